//! Fan-out buffering for outbound paths.
//!
//! A [`DownstreamManager`] buffers items centrally, fans them out to
//! per-path queues by filter, and drains each queue into its sink subject
//! to credit. The transport instantiates one manager for peer traffic and
//! the core one each for local workers and stores.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::id::EndpointId;
use crate::message::{CommandMessage, DataMessage, NodeMessage};
use crate::topic::Filter;

/// Identifies one outbound path within a manager.
pub type Slot = u64;

/// Per-path acceptance predicate. `exclude` is the manager's active sender,
/// set while an inbound batch is being dispatched.
pub trait PathFilter<T> {
    fn accepts(&self, exclude: Option<&EndpointId>, item: &T) -> bool;
}

impl PathFilter<DataMessage> for Filter {
    fn accepts(&self, _exclude: Option<&EndpointId>, item: &DataMessage) -> bool {
        self.matches(&item.topic)
    }
}

impl PathFilter<CommandMessage> for Filter {
    fn accepts(&self, _exclude: Option<&EndpointId>, item: &CommandMessage) -> bool {
        self.matches(&item.topic)
    }
}

/// Filter of a peer path: the peer's address plus its advertised topics.
#[derive(Clone, Debug)]
pub struct PeerFilter {
    pub addr: EndpointId,
    pub filter: Filter,
}

impl PathFilter<NodeMessage> for PeerFilter {
    fn accepts(&self, exclude: Option<&EndpointId>, item: &NodeMessage) -> bool {
        // Never reflect a message back to the endpoint it came from.
        if item.sender.endpoint == self.addr {
            return false;
        }
        if exclude == Some(&self.addr) {
            return false;
        }
        self.filter.matches(item.topic())
    }
}

/// The path is gone; the caller should remove it and react.
#[derive(Debug)]
pub struct PathGone;

/// Destination of a path: consumes items popped from the path queue.
pub trait PathSink<T>: Send {
    /// Consumes up to `max` items from the front of `queue`, returning how
    /// many were taken. Returning 0 with a non-empty queue means the sink
    /// cannot currently accept more (it applies its own back-pressure).
    fn feed(&mut self, queue: &mut VecDeque<T>, max: usize) -> Result<usize, PathGone>;
}

struct OutboundPath<T, F> {
    filter: F,
    queue: VecDeque<T>,
    /// `Some(n)`: credit-limited (peer paths); `None`: limited only by the
    /// sink's own back-pressure (local paths).
    credit: Option<usize>,
    sink: Box<dyn PathSink<T>>,
}

pub struct DownstreamManager<T, F> {
    buf: Vec<T>,
    paths: BTreeMap<Slot, OutboundPath<T, F>>,
    active_sender: Option<EndpointId>,
    batch_size: usize,
}

impl<T: Clone, F: PathFilter<T>> DownstreamManager<T, F> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            paths: BTreeMap::new(),
            active_sender: None,
            batch_size: batch_size.max(1),
        }
    }

    pub fn add_path(&mut self, slot: Slot, filter: F, credit: Option<usize>, sink: Box<dyn PathSink<T>>) {
        let replaced = self.paths.insert(
            slot,
            OutboundPath {
                filter,
                queue: VecDeque::new(),
                credit,
                sink,
            },
        );
        debug_assert!(replaced.is_none(), "slot reused while occupied");
    }

    /// Drops the path along with anything still buffered for it.
    pub fn remove_path(&mut self, slot: Slot) -> bool {
        match self.paths.remove(&slot) {
            Some(path) => {
                if !path.queue.is_empty() {
                    debug!(slot, dropped = path.queue.len(), "removed path with queued items");
                }
                true
            }
            None => false,
        }
    }

    pub fn has_path(&self, slot: Slot) -> bool {
        self.paths.contains_key(&slot)
    }

    pub fn num_paths(&self) -> usize {
        self.paths.len()
    }

    pub fn set_filter(&mut self, slot: Slot, filter: F) -> bool {
        match self.paths.get_mut(&slot) {
            Some(path) => {
                path.filter = filter;
                true
            }
            None => false,
        }
    }

    pub fn filter(&self, slot: Slot) -> Option<&F> {
        self.paths.get(&slot).map(|path| &path.filter)
    }

    pub fn filter_mut(&mut self, slot: Slot) -> Option<&mut F> {
        self.paths.get_mut(&slot).map(|path| &mut path.filter)
    }

    pub fn filters(&self) -> impl Iterator<Item = &F> {
        self.paths.values().map(|path| &path.filter)
    }

    /// Sets the active sender. Callers must [`Self::fan_out_flush`] first so
    /// previously buffered items keep the exclusion that was in force when
    /// they were pushed.
    pub fn set_active_sender(&mut self, sender: Option<EndpointId>) {
        self.active_sender = sender;
    }

    pub fn active_sender(&self) -> Option<&EndpointId> {
        self.active_sender.as_ref()
    }

    /// Buffers an item for the next fan-out.
    pub fn push(&mut self, item: T) {
        self.buf.push(item);
    }

    /// Moves the central buffer into each matching path's queue.
    pub fn fan_out_flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.buf);
        for item in items {
            for path in self.paths.values_mut() {
                if path.filter.accepts(self.active_sender.as_ref(), &item) {
                    path.queue.push_back(item.clone());
                }
            }
        }
    }

    /// Fans out and drains path queues subject to credit. Returns the slots
    /// whose sinks are gone; the caller removes the associated peer.
    pub fn emit_batches(&mut self) -> Vec<Slot> {
        self.fan_out_flush();
        let mut gone = Vec::new();
        for (slot, path) in &mut self.paths {
            let budget = path.credit.unwrap_or(usize::MAX).min(path.queue.len());
            let mut sent = 0;
            while sent < budget {
                let chunk = (budget - sent).min(self.batch_size);
                match path.sink.feed(&mut path.queue, chunk) {
                    Ok(0) => break,
                    Ok(n) => sent += n,
                    Err(PathGone) => {
                        gone.push(*slot);
                        break;
                    }
                }
            }
            if let Some(credit) = &mut path.credit {
                *credit -= sent;
            }
        }
        for slot in &gone {
            self.remove_path(*slot);
        }
        gone
    }

    /// Grants additional credit to a path, typically on a batch ack.
    pub fn grant_credit(&mut self, slot: Slot, amount: usize) {
        if let Some(path) = self.paths.get_mut(&slot) {
            path.credit = Some(path.credit.unwrap_or(0).saturating_add(amount));
        }
    }

    /// No buffered output anywhere.
    pub fn clean(&self) -> bool {
        self.buf.is_empty() && self.paths.values().all(|path| path.queue.is_empty())
    }

    /// Buffered output exists but nothing can move: every non-empty path is
    /// out of credit.
    pub fn stalled(&self) -> bool {
        if self.clean() {
            return false;
        }
        self.paths
            .values()
            .filter(|path| !path.queue.is_empty())
            .all(|path| path.credit == Some(0))
    }
}
