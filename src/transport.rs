//! The per-endpoint streaming state machine.
//!
//! Owns every inbound and outbound peer path, runs the peering handshake,
//! dispatches inbound batches, enforces the no-reflect rule, decrements TTL
//! on forwards, buffers traffic from blocked peers, and tears paths down on
//! disconnect. Local delivery and endpoint policy live behind [`CoreHooks`];
//! the transport is parameterized by any implementation.

use std::collections::{HashMap, HashSet, VecDeque};

use crossbeam::channel::Sender;
use tracing::{debug, error, warn};

use crate::config::EndpointConfig;
use crate::downstream::{DownstreamManager, PathGone, PathSink, PeerFilter, Slot};
use crate::endpoint::{Event, NodeHandle};
use crate::error::{DisconnectReason, PeerError};
use crate::id::{EndpointId, EntityId};
use crate::message::{CommandMessage, DataMessage, NodeContent, NodeMessage};
use crate::recorder::Recorder;
use crate::topic::{Filter, Topic};

/// Streaming protocol messages exchanged between peered endpoints. Slot
/// numbers always refer to the *sender's* outbound stream; receivers resolve
/// paths through the sending handle.
#[derive(Clone, Debug)]
pub enum PeerMessage {
    /// Handshake step 1: the initiator announces itself and its filter.
    Peer { filter: Filter, handle: NodeHandle },
    /// Opens an outbound stream toward the receiver, carrying the opener's
    /// filter. Step 2 when sent by the responder, step 3 when reciprocal.
    OpenStream {
        slot: Slot,
        filter: Filter,
        handle: NodeHandle,
    },
    /// Acknowledges an opened stream and grants initial credit.
    AckOpen {
        slot: Slot,
        rebind_from: EndpointId,
        rebind_to: EndpointId,
        credit: usize,
    },
    /// A batch of node messages on an established stream.
    Batch { slot: Slot, items: Vec<NodeMessage> },
    /// Replenishes credit after the receiver dispatched a batch.
    AckBatch { slot: Slot, credit: usize },
    /// The sender closed its outbound stream.
    Close { slot: Slot },
    ForcedClose {
        slot: Slot,
        reason: DisconnectReason,
    },
    /// The sender dropped its inbound stream.
    Drop { slot: Slot },
    ForcedDrop {
        slot: Slot,
        reason: DisconnectReason,
    },
    /// Out-of-band advertisement of a changed filter.
    FilterUpdate { filter: Filter },
}

/// Callbacks the transport needs from the endpoint core.
pub trait CoreHooks {
    /// The filter to advertise, excluding what was learned from `exclude`.
    fn filter(&self, exclude: Option<&EndpointId>) -> Filter;
    fn options(&self) -> &EndpointConfig;
    fn shutting_down(&self) -> bool;
    /// Extends the endpoint's own filter (e.g. when a store channel attaches).
    fn subscribe(&mut self, filter: &Filter);
    /// Delivers to local workers; never re-enters the peer manager.
    fn ship_data(&mut self, msg: DataMessage);
    /// Delivers to local stores; never re-enters the peer manager.
    fn ship_command(&mut self, msg: CommandMessage);
    fn peer_connected(&mut self, peer: &NodeHandle);
    fn peer_removed(&mut self, peer: &NodeHandle);
    fn peer_disconnected(&mut self, peer: &NodeHandle, reason: DisconnectReason);
    fn peer_unavailable(&mut self, peer: EndpointId);
    fn cannot_remove_peer(&mut self, peer: &NodeHandle);
    /// A peer advertised a new filter (handshake or update).
    fn peer_filter_changed(&mut self, peer: EndpointId, filter: Filter);
    fn ttl_expired(&mut self, topic: &Topic);
}

struct PendingConnection {
    reply: Sender<Result<(), PeerError>>,
}

struct PeerSink {
    local: NodeHandle,
    peer: NodeHandle,
    slot: Slot,
}

impl PathSink<NodeMessage> for PeerSink {
    fn feed(&mut self, queue: &mut VecDeque<NodeMessage>, max: usize) -> Result<usize, PathGone> {
        let n = max.min(queue.len());
        if n == 0 {
            return Ok(0);
        }
        let items: Vec<NodeMessage> = queue.drain(..n).collect();
        self.peer
            .send(Event::Wire {
                from: self.local.clone(),
                msg: PeerMessage::Batch {
                    slot: self.slot,
                    items,
                },
            })
            .map_err(|_| PathGone)?;
        Ok(n)
    }
}

pub struct StreamTransport {
    local: NodeHandle,
    next_slot: Slot,
    peers: DownstreamManager<NodeMessage, PeerFilter>,
    hdl_to_ostream: HashMap<EndpointId, Slot>,
    ostream_to_hdl: HashMap<Slot, NodeHandle>,
    hdl_to_istream: HashMap<EndpointId, Slot>,
    istream_to_hdl: HashMap<Slot, NodeHandle>,
    pending: HashMap<EndpointId, PendingConnection>,
    blocked: HashSet<EndpointId>,
    blocked_msgs: HashMap<EndpointId, Vec<(Slot, Vec<NodeMessage>)>>,
    recorder: Option<Recorder>,
}

impl StreamTransport {
    pub fn new(local: NodeHandle, config: &EndpointConfig) -> Self {
        let recorder = match &config.recording_directory {
            Some(dir) => match Recorder::open(dir, config.recorder_file_cap) {
                Ok(recorder) => Some(recorder),
                Err(err) => {
                    warn!(%err, dir = %dir.display(), "cannot open recording file");
                    None
                }
            },
            None => None,
        };
        Self {
            local,
            next_slot: 1,
            peers: DownstreamManager::new(config.batch_size),
            hdl_to_ostream: HashMap::new(),
            ostream_to_hdl: HashMap::new(),
            hdl_to_istream: HashMap::new(),
            istream_to_hdl: HashMap::new(),
            pending: HashMap::new(),
            blocked: HashSet::new(),
            blocked_msgs: HashMap::new(),
            recorder,
        }
    }

    fn alloc_slot(&mut self) -> Slot {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    // -- peer management ------------------------------------------------------

    /// Queries whether `peer` has at least one live path.
    pub fn connected_to(&self, peer: &EndpointId) -> bool {
        self.hdl_to_ostream.contains_key(peer) || self.hdl_to_istream.contains_key(peer)
    }

    /// All known peers, deduplicated across both directions.
    pub fn peer_ids(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self
            .hdl_to_ostream
            .keys()
            .chain(self.hdl_to_istream.keys())
            .copied()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn peer_handles(&self) -> Vec<NodeHandle> {
        let mut handles: Vec<NodeHandle> = self
            .ostream_to_hdl
            .values()
            .chain(self.istream_to_hdl.values())
            .cloned()
            .collect();
        handles.sort_by_key(|hdl| hdl.id());
        handles.dedup_by_key(|hdl| hdl.id());
        handles
    }

    pub fn has_peers(&self) -> bool {
        !self.hdl_to_ostream.is_empty() || !self.hdl_to_istream.is_empty()
    }

    /// Initiates peering (handshake step 1).
    pub fn start_peering(
        &mut self,
        hooks: &mut impl CoreHooks,
        remote: NodeHandle,
        reply: Sender<Result<(), PeerError>>,
    ) {
        if remote.id().is_nil() {
            let _ = reply.send(Err(PeerError::InvalidArgument));
            return;
        }
        if hooks.shutting_down() {
            let _ = reply.send(Err(PeerError::ShuttingDown));
            return;
        }
        // Repeated peering requests succeed without further effect.
        if self.pending.contains_key(&remote.id()) || self.connected_to(&remote.id()) {
            debug!(peer = %remote.id(), "peer already connected");
            let _ = reply.send(Ok(()));
            return;
        }
        let filter = hooks.filter(Some(&remote.id()));
        let sent = remote.send(Event::Wire {
            from: self.local.clone(),
            msg: PeerMessage::Peer {
                filter,
                handle: self.local.clone(),
            },
        });
        if sent.is_err() {
            debug!(peer = %remote.id(), "peer unavailable before handshake");
            hooks.peer_unavailable(remote.id());
            let _ = reply.send(Err(PeerError::PeerUnavailable));
            return;
        }
        self.pending
            .insert(remote.id(), PendingConnection { reply });
    }

    /// Handshake step 2: a remote initiator announced itself.
    pub fn handle_peer_request(
        &mut self,
        hooks: &mut impl CoreHooks,
        from: NodeHandle,
        their_filter: Filter,
    ) {
        if self.hdl_to_ostream.contains_key(&from.id()) {
            debug!(peer = %from.id(), "peer already connected");
            return;
        }
        hooks.peer_filter_changed(from.id(), their_filter.clone());
        self.open_outbound(hooks, &from, their_filter);
    }

    /// Adds an outbound path to `peer` and announces it with `OpenStream`.
    fn open_outbound(&mut self, hooks: &mut impl CoreHooks, peer: &NodeHandle, their_filter: Filter) {
        let slot = self.alloc_slot();
        self.peers.add_path(
            slot,
            PeerFilter {
                addr: peer.id(),
                filter: their_filter,
            },
            // No credit until the peer acks the stream.
            Some(0),
            Box::new(PeerSink {
                local: self.local.clone(),
                peer: peer.clone(),
                slot,
            }),
        );
        self.hdl_to_ostream.insert(peer.id(), slot);
        self.ostream_to_hdl.insert(slot, peer.clone());
        let sent = peer.send(Event::Wire {
            from: self.local.clone(),
            msg: PeerMessage::OpenStream {
                slot,
                filter: hooks.filter(Some(&peer.id())),
                handle: self.local.clone(),
            },
        });
        if sent.is_err() {
            self.handle_down(hooks, peer.id());
        }
    }

    /// An `OpenStream` arrived: record the inbound path, open the reciprocal
    /// outbound path if this is step 2's answer, and ack.
    pub fn handle_open_stream(
        &mut self,
        hooks: &mut impl CoreHooks,
        from: NodeHandle,
        slot: Slot,
        their_filter: Filter,
    ) {
        if self.hdl_to_istream.contains_key(&from.id()) {
            debug!(peer = %from.id(), "inbound path already exists");
            return;
        }
        let islot = self.alloc_slot();
        self.hdl_to_istream.insert(from.id(), islot);
        self.istream_to_hdl.insert(islot, from.clone());
        hooks.peer_filter_changed(from.id(), their_filter.clone());
        if !self.hdl_to_ostream.contains_key(&from.id()) {
            self.open_outbound(hooks, &from, their_filter);
        }
        let local_id = self.local.id();
        let sent = from.send(Event::Wire {
            from: self.local.clone(),
            msg: PeerMessage::AckOpen {
                slot,
                rebind_from: local_id,
                rebind_to: local_id,
                credit: hooks.options().peer_credit,
            },
        });
        if sent.is_err() {
            self.handle_down(hooks, from.id());
        }
    }

    /// Our outbound stream was acked; the handshake is complete.
    pub fn handle_ack_open(
        &mut self,
        hooks: &mut impl CoreHooks,
        from: NodeHandle,
        slot: Slot,
        rebind_from: EndpointId,
        rebind_to: EndpointId,
        credit: usize,
    ) {
        if !self.ostream_to_hdl.contains_key(&slot) {
            error!(peer = %from.id(), slot, "ack for unknown outbound stream");
            if let Some(pending) = self.pending.remove(&from.id()) {
                let _ = pending.reply.send(Err(PeerError::InvalidStreamState));
            }
            self.remove_peer(
                hooks,
                &from,
                Some(DisconnectReason::InvalidStreamState),
                false,
                false,
            );
            return;
        }
        if rebind_from != rebind_to {
            debug!(slot, %rebind_from, %rebind_to, "rebind occurred");
            if let Some(peer_filter) = self.peers.filter_mut(slot) {
                peer_filter.addr = rebind_to;
            }
        }
        self.peers.grant_credit(slot, credit);
        if let Some(pending) = self.pending.remove(&from.id()) {
            let _ = pending.reply.send(Ok(()));
        }
        hooks.peer_connected(&from);
        self.flush(hooks);
    }

    // -- inbound dispatch -----------------------------------------------------

    /// Dispatches one inbound batch from a peer.
    pub fn handle_batch(
        &mut self,
        hooks: &mut impl CoreHooks,
        from: NodeHandle,
        slot: Slot,
        items: Vec<NodeMessage>,
    ) {
        // Anything buffered at this point is output of our own making, so it
        // must fan out before the sender exclusion takes effect.
        debug_assert!(self.peers.active_sender().is_none());
        self.peers.fan_out_flush();
        self.peers.set_active_sender(Some(from.id()));

        if self.blocked.contains(&from.id()) {
            debug!(peer = %from.id(), "buffer batch from blocked peer");
            self.blocked_msgs
                .entry(from.id())
                .or_default()
                .push((slot, items));
            self.peers.set_active_sender(None);
            return;
        }

        let num_items = items.len();
        self.dispatch_items(hooks, items);

        // Push buffered fan-out while the sender exclusion is still active.
        self.peers.fan_out_flush();
        let gone = self.peers.emit_batches();
        self.peers.set_active_sender(None);
        self.remove_gone(hooks, gone);

        let acked = from.send(Event::Wire {
            from: self.local.clone(),
            msg: PeerMessage::AckBatch {
                slot,
                credit: num_items,
            },
        });
        if acked.is_err() {
            self.handle_down(hooks, from.id());
        }
    }

    fn dispatch_items(&mut self, hooks: &mut impl CoreHooks, items: Vec<NodeMessage>) {
        for mut msg in items {
            match &msg.content {
                NodeContent::Data(dm) => hooks.ship_data(dm.clone()),
                NodeContent::Command(cm) => hooks.ship_command(cm.clone()),
            }
            if !hooks.options().forward {
                continue;
            }
            // Clone channels are terminal.
            if msg.topic().is_clone_channel() {
                continue;
            }
            msg.ttl -= 1;
            if msg.ttl == 0 {
                warn!(topic = %msg.topic(), "dropped a message with expired TTL");
                hooks.ttl_expired(msg.topic());
                continue;
            }
            self.remote_push(msg);
        }
    }

    pub fn handle_ack_batch(&mut self, hooks: &mut impl CoreHooks, slot: Slot, credit: usize) {
        self.peers.grant_credit(slot, credit);
        self.flush(hooks);
    }

    // -- outbound publish -----------------------------------------------------

    /// Publishes locally originated content: wraps it as a node message,
    /// ships it to local subscribers, and fans it out to peers.
    pub fn publish(&mut self, hooks: &mut impl CoreHooks, content: NodeContent) {
        match &content {
            NodeContent::Data(dm) => hooks.ship_data(dm.clone()),
            NodeContent::Command(cm) => hooks.ship_command(cm.clone()),
        }
        let msg = NodeMessage::new(
            content,
            hooks.options().ttl,
            EntityId::endpoint_root(self.local.id()),
        );
        self.remote_push(msg);
        self.flush(hooks);
    }

    fn remote_push(&mut self, msg: NodeMessage) {
        if let Some(recorder) = &mut self.recorder {
            recorder.record(&msg);
        }
        self.peers.push(msg);
    }

    fn flush(&mut self, hooks: &mut impl CoreHooks) {
        let gone = self.peers.emit_batches();
        self.remove_gone(hooks, gone);
    }

    fn remove_gone(&mut self, hooks: &mut impl CoreHooks, gone: Vec<Slot>) {
        for slot in gone {
            if let Some(handle) = self.ostream_to_hdl.get(&slot).cloned() {
                self.remove_peer(
                    hooks,
                    &handle,
                    Some(DisconnectReason::ChannelBroken),
                    true,
                    false,
                );
            }
        }
    }

    // -- blocking -------------------------------------------------------------

    /// Pauses dispatch of batches from `peer`; they buffer until unblocked.
    pub fn block_peer(&mut self, peer: EndpointId) {
        self.blocked.insert(peer);
    }

    /// Resumes dispatch and drains buffered batches in arrival order.
    pub fn unblock_peer(&mut self, hooks: &mut impl CoreHooks, peer: EndpointId) {
        self.blocked.remove(&peer);
        let Some(batches) = self.blocked_msgs.remove(&peer) else {
            return;
        };
        let Some(handle) = self
            .hdl_to_istream
            .get(&peer)
            .and_then(|islot| self.istream_to_hdl.get(islot))
            .cloned()
        else {
            debug!(%peer, "dropped batches after unblocking peer: path no longer exists");
            return;
        };
        for (slot, items) in batches {
            debug!(%peer, "handle blocked batch");
            self.handle_batch(hooks, handle.clone(), slot, items);
        }
    }

    // -- teardown -------------------------------------------------------------

    /// Erases both directions of a peer pair. `silent` suppresses the wire
    /// notifications; `graceful` selects `peer_removed` over
    /// `peer_disconnected`. Returns false when no path existed.
    pub fn remove_peer(
        &mut self,
        hooks: &mut impl CoreHooks,
        peer: &NodeHandle,
        reason: Option<DisconnectReason>,
        silent: bool,
        graceful: bool,
    ) -> bool {
        let mut erased = 0;
        if let Some(oslot) = self.hdl_to_ostream.remove(&peer.id()) {
            debug!(peer = %peer.id(), slot = oslot, "remove outbound path to peer");
            erased += 1;
            self.peers.remove_path(oslot);
            self.ostream_to_hdl.remove(&oslot);
            if !silent {
                let msg = match reason {
                    None => PeerMessage::Close { slot: oslot },
                    Some(reason) => PeerMessage::ForcedClose { slot: oslot, reason },
                };
                let _ = peer.send(Event::Wire {
                    from: self.local.clone(),
                    msg,
                });
            }
        }
        if let Some(islot) = self.hdl_to_istream.remove(&peer.id()) {
            debug!(peer = %peer.id(), slot = islot, "remove inbound path from peer");
            erased += 1;
            self.istream_to_hdl.remove(&islot);
            if !silent {
                let msg = match reason {
                    None => PeerMessage::Drop { slot: islot },
                    Some(reason) => PeerMessage::ForcedDrop { slot: islot, reason },
                };
                let _ = peer.send(Event::Wire {
                    from: self.local.clone(),
                    msg,
                });
            }
        }
        self.blocked.remove(&peer.id());
        if let Some(buffered) = self.blocked_msgs.remove(&peer.id()) {
            debug!(peer = %peer.id(), batches = buffered.len(), "dropped buffered batches");
        }
        if erased == 0 {
            debug!(peer = %peer.id(), "no path was removed for peer");
            return false;
        }
        if graceful {
            hooks.peer_removed(peer);
        } else {
            hooks.peer_disconnected(peer, reason.unwrap_or(DisconnectReason::Closed));
        }
        true
    }

    /// Disconnects a peer by demand of the user.
    pub fn unpeer(&mut self, hooks: &mut impl CoreHooks, peer: &NodeHandle) {
        if peer.id().is_nil() {
            return;
        }
        if !self.remove_peer(hooks, peer, None, false, true) {
            hooks.cannot_remove_peer(peer);
        }
    }

    /// The remote closed its outbound stream (our inbound path).
    pub fn handle_close(
        &mut self,
        hooks: &mut impl CoreHooks,
        from: NodeHandle,
        reason: Option<DisconnectReason>,
    ) {
        if !self.connected_to(&from.id()) {
            debug!(peer = %from.id(), "close for unknown peer");
            return;
        }
        self.remove_peer(
            hooks,
            &from,
            Some(reason.unwrap_or(DisconnectReason::Closed)),
            true,
            false,
        );
    }

    /// The remote dropped its inbound stream (our outbound path).
    pub fn handle_drop(
        &mut self,
        hooks: &mut impl CoreHooks,
        from: NodeHandle,
        reason: Option<DisconnectReason>,
    ) {
        if !self.connected_to(&from.id()) {
            debug!(peer = %from.id(), "drop for unknown peer");
            return;
        }
        self.remove_peer(
            hooks,
            &from,
            Some(reason.unwrap_or(DisconnectReason::Closed)),
            true,
            false,
        );
    }

    /// Updates the filter of an existing peer. Unknown handles are ignored.
    pub fn update_peer(
        &mut self,
        hooks: &mut impl CoreHooks,
        from: &NodeHandle,
        filter: Filter,
    ) -> bool {
        let Some(&slot) = self.hdl_to_ostream.get(&from.id()) else {
            debug!(peer = %from.id(), "cannot update filter on unknown peer");
            return false;
        };
        if let Some(peer_filter) = self.peers.filter_mut(slot) {
            peer_filter.filter = filter.clone();
        }
        hooks.peer_filter_changed(from.id(), filter);
        true
    }

    /// The channel to a peer broke outside a regular teardown.
    pub fn handle_down(&mut self, hooks: &mut impl CoreHooks, peer: EndpointId) {
        if let Some(pending) = self.pending.remove(&peer) {
            let _ = pending.reply.send(Err(PeerError::PeerUnavailable));
            hooks.peer_unavailable(peer);
        }
        let handle = self
            .hdl_to_ostream
            .get(&peer)
            .and_then(|slot| self.ostream_to_hdl.get(slot))
            .or_else(|| {
                self.hdl_to_istream
                    .get(&peer)
                    .and_then(|slot| self.istream_to_hdl.get(slot))
            })
            .cloned();
        if let Some(handle) = handle {
            self.remove_peer(
                hooks,
                &handle,
                Some(DisconnectReason::ChannelBroken),
                true,
                false,
            );
        }
    }

    /// Gracefully removes every peer, notifying each side.
    pub fn shutdown(&mut self, hooks: &mut impl CoreHooks) {
        for handle in self.peer_handles() {
            self.remove_peer(hooks, &handle, Some(DisconnectReason::Shutdown), false, true);
        }
        for pending in std::mem::take(&mut self.pending).into_values() {
            let _ = pending.reply.send(Err(PeerError::ShuttingDown));
        }
    }

    // -- progress -------------------------------------------------------------

    /// No handshake pending, no inbound path open, outbound manager clean.
    pub fn done(&self) -> bool {
        self.pending.is_empty() && self.hdl_to_istream.is_empty() && self.peers.clean()
    }

    /// Stalled outbound, or clean with nothing left to pull in.
    pub fn idle(&self) -> bool {
        self.peers.stalled() || (self.peers.clean() && self.blocked_msgs.is_empty())
    }

    /// Routes one wire message to its handler.
    pub fn handle_message(&mut self, hooks: &mut impl CoreHooks, from: NodeHandle, msg: PeerMessage) {
        match msg {
            PeerMessage::Peer { filter, handle } => self.handle_peer_request(hooks, handle, filter),
            PeerMessage::OpenStream {
                slot,
                filter,
                handle,
            } => self.handle_open_stream(hooks, handle, slot, filter),
            PeerMessage::AckOpen {
                slot,
                rebind_from,
                rebind_to,
                credit,
            } => self.handle_ack_open(hooks, from, slot, rebind_from, rebind_to, credit),
            PeerMessage::Batch { slot, items } => self.handle_batch(hooks, from, slot, items),
            PeerMessage::AckBatch { slot, credit } => self.handle_ack_batch(hooks, slot, credit),
            PeerMessage::Close { .. } => self.handle_close(hooks, from, None),
            PeerMessage::ForcedClose { reason, .. } => {
                self.handle_close(hooks, from, Some(reason))
            }
            PeerMessage::Drop { .. } => self.handle_drop(hooks, from, None),
            PeerMessage::ForcedDrop { reason, .. } => self.handle_drop(hooks, from, Some(reason)),
            PeerMessage::FilterUpdate { filter } => {
                self.update_peer(hooks, &from, filter);
            }
        }
    }
}
