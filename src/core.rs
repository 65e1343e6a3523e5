//! The endpoint core: local fan-out, filter aggregation, and peer cache.
//!
//! [`EndpointCore`] implements [`CoreHooks`] for the stream transport. It
//! owns the endpoint's own filter (the union of local subscribers' filters),
//! the downstream managers for local workers and stores, the routing cache
//! of peer handles and their advertised filters, and the status feeds.

use std::collections::{HashMap, VecDeque};
use std::io;

use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::downstream::{DownstreamManager, PathGone, PathSink, Slot};
use crate::endpoint::{Event, NodeHandle};
use crate::error::DisconnectReason;
use crate::id::{EndpointId, EntityId};
use crate::mailbox::{self, Mailbox, MailboxSender, SendOutcome};
use crate::message::{CommandMessage, DataMessage};
use crate::topic::{Filter, Topic};
use crate::transport::{CoreHooks, PeerMessage};

/// Out-of-band lifecycle notifications delivered to status subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    PeerAdded {
        peer: EndpointId,
    },
    PeerRemoved {
        peer: EndpointId,
    },
    PeerDisconnected {
        peer: EndpointId,
        reason: DisconnectReason,
    },
    PeerUnavailable {
        peer: EndpointId,
    },
    /// A forwarded message ran out of hops on this endpoint.
    TtlExpired {
        topic: Topic,
    },
}

struct WorkerSink {
    tx: MailboxSender<DataMessage>,
}

impl PathSink<DataMessage> for WorkerSink {
    fn feed(&mut self, queue: &mut VecDeque<DataMessage>, max: usize) -> Result<usize, PathGone> {
        let mut fed = 0;
        while fed < max {
            let Some(item) = queue.pop_front() else {
                break;
            };
            match self.tx.try_send(item) {
                SendOutcome::Delivered => fed += 1,
                SendOutcome::Full(item) => {
                    queue.push_front(item);
                    break;
                }
                SendOutcome::Closed => return Err(PathGone),
            }
        }
        Ok(fed)
    }
}

pub struct EndpointCore {
    local: NodeHandle,
    config: EndpointConfig,
    /// Union of local subscribers' filters (workers and store channels).
    local_filter: Filter,
    /// Filters peers advertised to us.
    peer_filters: HashMap<EndpointId, Filter>,
    /// Handles of connected peers, for out-of-band sends and `peers()`.
    cache: HashMap<EndpointId, NodeHandle>,
    /// What we last advertised to each peer.
    advertised: HashMap<EndpointId, Filter>,
    workers: DownstreamManager<DataMessage, Filter>,
    stores: DownstreamManager<CommandMessage, Filter>,
    next_slot: Slot,
    next_object: u64,
    status_feeds: Vec<MailboxSender<StatusEvent>>,
    shutting_down: bool,
    filters_dirty: bool,
}

impl EndpointCore {
    pub fn new(local: NodeHandle, config: EndpointConfig) -> Self {
        let batch = config.batch_size;
        Self {
            local,
            config,
            local_filter: Filter::new(),
            peer_filters: HashMap::new(),
            cache: HashMap::new(),
            advertised: HashMap::new(),
            workers: DownstreamManager::new(batch),
            stores: DownstreamManager::new(batch),
            next_slot: 1,
            next_object: 1,
            status_feeds: Vec::new(),
            shutting_down: false,
            filters_dirty: false,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.local.id()
    }

    /// Allocates the object part of an entity id for a new local object.
    pub fn next_entity(&mut self) -> EntityId {
        let object = self.next_object;
        self.next_object += 1;
        EntityId::new(self.local.id(), object)
    }

    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    pub fn connected_peers(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self.cache.keys().copied().collect();
        ids.sort();
        ids
    }

    // -- local subscribers ----------------------------------------------------

    /// Adds a local worker subscription and returns its mailbox.
    pub fn add_worker(&mut self, filter: Filter) -> io::Result<Mailbox<DataMessage>> {
        let (tx, rx) = mailbox::channel(self.config.subscriber_capacity)?;
        let slot = self.alloc_slot();
        self.workers
            .add_path(slot, filter.clone(), None, Box::new(WorkerSink { tx }));
        self.subscribe(&filter);
        Ok(rx)
    }

    /// Adds a store channel (master or clone) fed by the store manager.
    pub fn add_store_channel(&mut self, filter: Filter, sink: Box<dyn PathSink<CommandMessage>>) {
        let slot = self.alloc_slot();
        self.stores.add_path(slot, filter.clone(), None, sink);
        self.subscribe(&filter);
    }

    pub fn add_status_feed(&mut self) -> io::Result<Mailbox<StatusEvent>> {
        let (tx, rx) = mailbox::channel(self.config.subscriber_capacity)?;
        self.status_feeds.push(tx);
        Ok(rx)
    }

    fn alloc_slot(&mut self) -> Slot {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn emit_status(&mut self, event: StatusEvent) {
        self.status_feeds.retain(|tx| match tx.try_send(event.clone()) {
            SendOutcome::Delivered => true,
            SendOutcome::Full(_) => {
                debug!(?event, "status feed lagging; event dropped");
                true
            }
            SendOutcome::Closed => false,
        });
    }

    /// Recomputes the local filter from the surviving paths.
    fn recompute_local_filter(&mut self) {
        let mut filter = Filter::new();
        for f in self.workers.filters().chain(self.stores.filters()) {
            filter.extend(f);
        }
        if filter != self.local_filter {
            self.local_filter = filter;
            self.filters_dirty = true;
        }
    }

    fn drop_peer_state(&mut self, peer: EndpointId) {
        self.cache.remove(&peer);
        self.peer_filters.remove(&peer);
        self.advertised.remove(&peer);
        self.filters_dirty = true;
    }

    // -- filter propagation ---------------------------------------------------

    /// Whether an advertisement pass is due.
    pub fn take_filters_dirty(&mut self) -> bool {
        std::mem::take(&mut self.filters_dirty)
    }

    /// Pushes an updated filter to every peer whose advertisement changed.
    pub fn broadcast_filter_updates(&mut self) {
        let peers: Vec<(EndpointId, NodeHandle)> = self
            .cache
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        for (id, handle) in peers {
            let filter = self.filter(Some(&id));
            if self.advertised.get(&id) == Some(&filter) {
                continue;
            }
            debug!(peer = %id, ?filter, "advertising filter update");
            self.advertised.insert(id, filter.clone());
            let _ = handle.send(Event::Wire {
                from: self.local.clone(),
                msg: PeerMessage::FilterUpdate { filter },
            });
        }
    }
}

impl CoreHooks for EndpointCore {
    /// The advertised filter: local subscriptions plus, on forwarding
    /// endpoints, everything the *other* peers advertised (split horizon).
    fn filter(&self, exclude: Option<&EndpointId>) -> Filter {
        let mut filter = self.local_filter.clone();
        if self.config.forward {
            for (id, peer_filter) in &self.peer_filters {
                if Some(id) != exclude {
                    filter.extend(peer_filter);
                }
            }
        }
        filter
    }

    fn options(&self) -> &EndpointConfig {
        &self.config
    }

    fn shutting_down(&self) -> bool {
        self.shutting_down
    }

    fn subscribe(&mut self, filter: &Filter) {
        self.local_filter.extend(filter);
        self.filters_dirty = true;
    }

    fn ship_data(&mut self, msg: DataMessage) {
        if self.workers.num_paths() == 0 {
            return;
        }
        self.workers.push(msg);
        let gone = self.workers.emit_batches();
        if !gone.is_empty() {
            debug!(paths = gone.len(), "local subscriber went away");
            self.recompute_local_filter();
        }
    }

    fn ship_command(&mut self, msg: CommandMessage) {
        if self.stores.num_paths() == 0 {
            return;
        }
        self.stores.push(msg);
        let gone = self.stores.emit_batches();
        if !gone.is_empty() {
            debug!(paths = gone.len(), "local store channel went away");
            self.recompute_local_filter();
        }
    }

    fn peer_connected(&mut self, peer: &NodeHandle) {
        debug!(peer = %peer.id(), "peer connected");
        self.cache.insert(peer.id(), peer.clone());
        self.filters_dirty = true;
        self.emit_status(StatusEvent::PeerAdded { peer: peer.id() });
    }

    fn peer_removed(&mut self, peer: &NodeHandle) {
        debug!(peer = %peer.id(), "peer removed");
        self.drop_peer_state(peer.id());
        self.emit_status(StatusEvent::PeerRemoved { peer: peer.id() });
    }

    fn peer_disconnected(&mut self, peer: &NodeHandle, reason: DisconnectReason) {
        debug!(peer = %peer.id(), %reason, "peer disconnected");
        self.drop_peer_state(peer.id());
        self.emit_status(StatusEvent::PeerDisconnected {
            peer: peer.id(),
            reason,
        });
    }

    fn peer_unavailable(&mut self, peer: EndpointId) {
        debug!(%peer, "peer unavailable");
        self.emit_status(StatusEvent::PeerUnavailable { peer });
    }

    fn cannot_remove_peer(&mut self, peer: &NodeHandle) {
        warn!(peer = %peer.id(), "cannot unpeer from unknown peer");
    }

    fn peer_filter_changed(&mut self, peer: EndpointId, filter: Filter) {
        self.peer_filters.insert(peer, filter);
        self.filters_dirty = true;
    }

    fn ttl_expired(&mut self, topic: &Topic) {
        self.emit_status(StatusEvent::TtlExpired {
            topic: topic.clone(),
        });
    }
}
