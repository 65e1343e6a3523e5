//! The endpoint facade and its actor loop.
//!
//! Each endpoint is a single-threaded cooperative actor: one OS thread
//! draining a crossbeam mailbox, run-to-completion per event. The
//! [`Endpoint`] handle lives on the caller side and talks to the actor via
//! control messages; peers talk to it via wire messages.

use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::core::{EndpointCore, StatusEvent};
use crate::data::Data;
use crate::error::{EndpointError, PeerError, StoreError};
use crate::id::EndpointId;
use crate::mailbox::Mailbox;
use crate::message::{Command, CommandMessage, DataMessage, NodeContent};
use crate::store::{self, Backend, Store, StoreChannelSink, StoreRequest};
use crate::topic::{Filter, Topic};
use crate::transport::{CoreHooks, PeerMessage, StreamTransport};

/// The channel to an endpoint actor is gone.
pub(crate) struct HandleClosed;

/// A capability naming a peer endpoint. Handles compare by endpoint id;
/// the channel inside is resolved lazily on each send.
#[derive(Clone)]
pub struct NodeHandle {
    id: EndpointId,
    tx: Sender<Event>,
}

impl NodeHandle {
    pub(crate) fn new(id: EndpointId, tx: Sender<Event>) -> Self {
        Self { id, tx }
    }

    /// A handle that refers to nothing. Peering against it fails with
    /// `invalid_argument`.
    pub fn nil() -> Self {
        let (tx, _rx) = channel::bounded(0);
        Self {
            id: EndpointId::nil(),
            tx,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub(crate) fn send(&self, event: Event) -> Result<(), HandleClosed> {
        self.tx.send(event).map_err(|_| HandleClosed)
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeHandle {}

impl std::hash::Hash for NodeHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({})", self.id)
    }
}

/// Everything an endpoint actor reacts to.
pub(crate) enum Event {
    Control(Control),
    Wire { from: NodeHandle, msg: PeerMessage },
}

pub(crate) enum Control {
    PublishData(DataMessage),
    PublishCommand(CommandMessage),
    /// Publishes to local subscribers only, bypassing the peer fabric.
    /// Store actors use this for change events.
    PublishLocalData(DataMessage),
    Subscribe {
        filter: Filter,
        reply: Sender<Result<Subscriber, EndpointError>>,
    },
    SubscribeStatus {
        reply: Sender<Result<StatusFeed, EndpointError>>,
    },
    Peer {
        peer: NodeHandle,
        reply: Sender<Result<(), PeerError>>,
    },
    Unpeer {
        peer: NodeHandle,
    },
    Peers {
        reply: Sender<Vec<EndpointId>>,
    },
    AttachMaster {
        name: String,
        backend: Backend,
        reply: Sender<Result<Store, StoreError>>,
    },
    AttachClone {
        name: String,
        reply: Sender<Result<Store, StoreError>>,
    },
    BlockPeer {
        peer: EndpointId,
    },
    UnblockPeer {
        peer: EndpointId,
    },
    Shutdown,
}

/// Lets store actors publish through their endpoint.
#[derive(Clone)]
pub(crate) struct CorePublisher {
    tx: Sender<Event>,
}

impl CorePublisher {
    /// Local-only delivery, e.g. store change events.
    pub(crate) fn publish_local_data(&self, msg: DataMessage) {
        let _ = self.tx.send(Event::Control(Control::PublishLocalData(msg)));
    }

    pub(crate) fn publish_command(&self, msg: CommandMessage) {
        let _ = self.tx.send(Event::Control(Control::PublishCommand(msg)));
    }
}

/// A local consumer of data messages.
pub struct Subscriber {
    mailbox: Mailbox<DataMessage>,
}

impl Subscriber {
    pub fn try_recv(&self) -> Option<DataMessage> {
        self.mailbox.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<DataMessage> {
        self.mailbox.recv_timeout(timeout).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mailbox.len()
    }

    /// Readable whenever a message is waiting; poll this from blocking
    /// consumers.
    pub fn ready_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.mailbox.ready_fd()
    }
}

/// A local consumer of peer status events.
pub struct StatusFeed {
    mailbox: Mailbox<StatusEvent>,
}

impl StatusFeed {
    pub fn try_recv(&self) -> Option<StatusEvent> {
        self.mailbox.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<StatusEvent> {
        self.mailbox.recv_timeout(timeout).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.is_empty()
    }

    pub fn ready_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.mailbox.ready_fd()
    }
}

struct AttachedStore {
    name: String,
    tx: Sender<StoreRequest>,
    thread: JoinHandle<()>,
}

struct EndpointActor {
    rx: Receiver<Event>,
    tx: Sender<Event>,
    core: EndpointCore,
    transport: StreamTransport,
    stores: Vec<AttachedStore>,
}

impl EndpointActor {
    fn run(mut self) {
        loop {
            let Ok(event) = self.rx.recv() else {
                break;
            };
            match event {
                Event::Wire { from, msg } => {
                    self.transport.handle_message(&mut self.core, from, msg);
                }
                Event::Control(control) => self.handle_control(control),
            }
            if self.core.take_filters_dirty() {
                self.core.broadcast_filter_updates();
            }
            if self.core.shutting_down() && self.transport.done() {
                break;
            }
        }
        self.stop_stores();
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::PublishData(msg) => {
                self.transport.publish(&mut self.core, NodeContent::Data(msg));
            }
            Control::PublishCommand(msg) => {
                self.transport
                    .publish(&mut self.core, NodeContent::Command(msg));
            }
            Control::PublishLocalData(msg) => {
                self.core.ship_data(msg);
            }
            Control::Subscribe { filter, reply } => {
                let result = self
                    .core
                    .add_worker(filter)
                    .map(|mailbox| Subscriber { mailbox })
                    .map_err(|err| EndpointError::Io(err.to_string()));
                let _ = reply.send(result);
            }
            Control::SubscribeStatus { reply } => {
                let result = self
                    .core
                    .add_status_feed()
                    .map(|mailbox| StatusFeed { mailbox })
                    .map_err(|err| EndpointError::Io(err.to_string()));
                let _ = reply.send(result);
            }
            Control::Peer { peer, reply } => {
                self.transport.start_peering(&mut self.core, peer, reply);
            }
            Control::Unpeer { peer } => {
                self.transport.unpeer(&mut self.core, &peer);
            }
            Control::Peers { reply } => {
                let _ = reply.send(self.core.connected_peers());
            }
            Control::AttachMaster {
                name,
                backend,
                reply,
            } => {
                let _ = reply.send(self.attach_master(name, backend));
            }
            Control::AttachClone { name, reply } => {
                let _ = reply.send(self.attach_clone(name));
            }
            Control::BlockPeer { peer } => self.transport.block_peer(peer),
            Control::UnblockPeer { peer } => {
                self.transport.unblock_peer(&mut self.core, peer);
            }
            Control::Shutdown => {
                debug!(endpoint = %self.core.id(), "shutting down");
                self.core.begin_shutdown();
                self.transport.shutdown(&mut self.core);
            }
        }
    }

    fn attach_master(&mut self, name: String, backend: Backend) -> Result<Store, StoreError> {
        if self.stores.iter().any(|store| store.name == name) {
            return Err(StoreError::AlreadyExists(name));
        }
        let id = self.core.next_entity();
        let (store_tx, store_rx) = channel::unbounded();
        let publisher = CorePublisher {
            tx: self.tx.clone(),
        };
        let thread = store::spawn_master(
            name.clone(),
            id,
            backend,
            publisher,
            self.core.options().clone(),
            store_rx,
        )
        .map_err(|err| {
            warn!(%err, store = %name, "failed to spawn master actor");
            StoreError::Detached
        })?;
        self.core.add_store_channel(
            Filter::from(Topic::master_channel(&name)),
            Box::new(StoreChannelSink {
                tx: store_tx.clone(),
            }),
        );
        let store = Store::new(
            name.clone(),
            id,
            store_tx.clone(),
            self.core.options().store_timeout,
        );
        self.stores.push(AttachedStore {
            name,
            tx: store_tx,
            thread,
        });
        Ok(store)
    }

    fn attach_clone(&mut self, name: String) -> Result<Store, StoreError> {
        if self.stores.iter().any(|store| store.name == name) {
            return Err(StoreError::AlreadyExists(name));
        }
        let id = self.core.next_entity();
        let (store_tx, store_rx) = channel::unbounded();
        let publisher = CorePublisher {
            tx: self.tx.clone(),
        };
        let thread = store::spawn_clone(
            name.clone(),
            id,
            publisher,
            self.core.options().clone(),
            store_rx,
        )
        .map_err(|err| {
            warn!(%err, store = %name, "failed to spawn clone actor");
            StoreError::Detached
        })?;
        self.core.add_store_channel(
            Filter::from(Topic::clone_channel(&name)),
            Box::new(StoreChannelSink {
                tx: store_tx.clone(),
            }),
        );
        let store = Store::new(
            name.clone(),
            id,
            store_tx.clone(),
            self.core.options().store_timeout,
        );
        self.stores.push(AttachedStore {
            name,
            tx: store_tx,
            thread,
        });
        Ok(store)
    }

    fn stop_stores(&mut self) {
        for store in self.stores.drain(..) {
            let _ = store.tx.send(StoreRequest::Shutdown);
            if store.thread.join().is_err() {
                warn!(store = %store.name, "store actor panicked");
            }
        }
    }
}

/// A process-local endpoint of the overlay.
pub struct Endpoint {
    handle: NodeHandle,
    thread: Option<JoinHandle<()>>,
}

impl Endpoint {
    /// Spawns the endpoint actor on its own thread.
    pub fn spawn(config: EndpointConfig) -> io::Result<Endpoint> {
        let id = EndpointId::random();
        let (tx, rx) = channel::unbounded();
        let handle = NodeHandle::new(id, tx.clone());
        let core = EndpointCore::new(handle.clone(), config.clone());
        let transport = StreamTransport::new(handle.clone(), &config);
        let actor = EndpointActor {
            rx,
            tx,
            core,
            transport,
            stores: Vec::new(),
        };
        let short = id.to_string();
        let thread = thread::Builder::new()
            .name(format!("trellis-{}", &short[..8]))
            .spawn(move || actor.run())?;
        Ok(Endpoint {
            handle,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> EndpointId {
        self.handle.id()
    }

    /// The capability other endpoints use to peer with this one.
    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Publishes opaque data on a topic.
    pub fn publish(
        &self,
        topic: impl Into<Topic>,
        data: impl Into<Data>,
    ) -> Result<(), EndpointError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(EndpointError::InvalidTopic);
        }
        self.send_control(Control::PublishData(DataMessage {
            topic,
            data: data.into(),
        }))
    }

    /// Publishes a store command on a topic, e.g. a put on `name/master`.
    pub fn publish_command(
        &self,
        topic: impl Into<Topic>,
        command: Command,
    ) -> Result<(), EndpointError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(EndpointError::InvalidTopic);
        }
        self.send_control(Control::PublishCommand(CommandMessage { topic, command }))
    }

    /// Registers a local subscriber for every topic matching `filter`.
    pub fn subscribe(&self, filter: impl Into<Filter>) -> Result<Subscriber, EndpointError> {
        let (reply, rx) = channel::bounded(1);
        self.send_control(Control::Subscribe {
            filter: filter.into(),
            reply,
        })?;
        rx.recv().map_err(|_| EndpointError::Detached)?
    }

    /// Registers a consumer of peer status events.
    pub fn status_feed(&self) -> Result<StatusFeed, EndpointError> {
        let (reply, rx) = channel::bounded(1);
        self.send_control(Control::SubscribeStatus { reply })?;
        rx.recv().map_err(|_| EndpointError::Detached)?
    }

    /// Initiates peering with another endpoint and waits for the handshake
    /// to finish. Peering with an existing peer succeeds as a no-op.
    pub fn peer(&self, peer: &NodeHandle) -> Result<(), PeerError> {
        let (reply, rx) = channel::bounded(1);
        self.handle
            .send(Event::Control(Control::Peer {
                peer: peer.clone(),
                reply,
            }))
            .map_err(|_| PeerError::PeerUnavailable)?;
        rx.recv().map_err(|_| PeerError::PeerUnavailable)?
    }

    /// Disconnects from a peer. Unknown peers are reported through the
    /// status feed, not an error.
    pub fn unpeer(&self, peer: &NodeHandle) -> Result<(), EndpointError> {
        self.send_control(Control::Unpeer { peer: peer.clone() })
    }

    /// Ids of all connected peers.
    pub fn peers(&self) -> Vec<EndpointId> {
        let (reply, rx) = channel::bounded(1);
        if self.send_control(Control::Peers { reply }).is_err() {
            return Vec::new();
        }
        rx.recv().unwrap_or_default()
    }

    /// Attaches an authoritative store under `name`.
    pub fn attach_master(&self, name: &str, backend: Backend) -> Result<Store, StoreError> {
        let (reply, rx) = channel::bounded(1);
        self.handle
            .send(Event::Control(Control::AttachMaster {
                name: name.to_string(),
                backend,
                reply,
            }))
            .map_err(|_| StoreError::Detached)?;
        rx.recv().map_err(|_| StoreError::Detached)?
    }

    /// Attaches an eventually consistent replica of the named store.
    pub fn attach_clone(&self, name: &str) -> Result<Store, StoreError> {
        let (reply, rx) = channel::bounded(1);
        self.handle
            .send(Event::Control(Control::AttachClone {
                name: name.to_string(),
                reply,
            }))
            .map_err(|_| StoreError::Detached)?;
        rx.recv().map_err(|_| StoreError::Detached)?
    }

    /// Pauses handling of batches from `peer`; they buffer until unblocked.
    /// Intended for tests and controlled maintenance windows.
    pub fn block_peer(&self, peer: EndpointId) -> Result<(), EndpointError> {
        self.send_control(Control::BlockPeer { peer })
    }

    /// Resumes handling of batches from `peer`, draining the buffer in order.
    pub fn unblock_peer(&self, peer: EndpointId) -> Result<(), EndpointError> {
        self.send_control(Control::UnblockPeer { peer })
    }

    /// Shuts the endpoint down, disconnecting every peer.
    pub fn shutdown(mut self) {
        self.shutdown_and_join();
    }

    fn send_control(&self, control: Control) -> Result<(), EndpointError> {
        self.handle
            .send(Event::Control(control))
            .map_err(|_| EndpointError::Detached)
    }

    fn shutdown_and_join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.send(Event::Control(Control::Shutdown));
            if thread.join().is_err() {
                warn!(endpoint = %self.handle.id(), "endpoint actor panicked");
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.handle.id())
    }
}
