//! Replicated key-value stores: masters, clones, and their frontend.

mod clone;
mod events;
mod master;
mod memory;

pub use events::StoreEvent;
pub use memory::MemoryBackend;

use std::collections::VecDeque;
use std::io;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{RecvTimeoutError, Sender};

use crate::config::EndpointConfig;
use crate::data::Data;
use crate::downstream::{PathGone, PathSink};
use crate::endpoint::CorePublisher;
use crate::error::StoreError;
use crate::id::EntityId;
use crate::message::{Command, CommandMessage, SnapshotEntry};

/// Selects the storage behind a master.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Memory,
}

impl Backend {
    fn open(self) -> Box<dyn StorageBackend> {
        match self {
            Backend::Memory => Box::new(MemoryBackend::new()),
        }
    }
}

/// Storage interface consumed by master and clone actors. Implementations
/// own the map and its expiry bookkeeping; actors drive timers and events.
pub trait StorageBackend: Send {
    /// Stores a value, returning the previous live value if any.
    fn put(&mut self, key: Data, value: Data, expires_at: Option<Instant>) -> Option<Data>;
    /// Reads a value; expired entries read as absent.
    fn get(&self, key: &Data, now: Instant) -> Option<Data>;
    fn erase(&mut self, key: &Data) -> Option<Data>;
    /// Removes everything, returning the removed keys in order.
    fn clear(&mut self) -> Vec<Data>;
    /// Removes entries whose deadline passed, returning their keys.
    fn expire_due(&mut self, now: Instant) -> Vec<Data>;
    fn next_expiry(&self) -> Option<Instant>;
    /// Atomic capture of the live map with remaining lifetimes.
    fn snapshot(&self, now: Instant) -> Vec<SnapshotEntry>;
    /// Replaces the whole map from a snapshot.
    fn replace_all(&mut self, entries: Vec<SnapshotEntry>, now: Instant);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Requests handled by store actors.
pub(crate) enum StoreRequest {
    /// A command that arrived over the endpoint's store fan-out.
    Network(CommandMessage),
    /// A mutation issued by the local frontend.
    Write(Command),
    /// A synchronous read from the local frontend.
    Get {
        key: Data,
        reply: Sender<Result<Data, StoreError>>,
    },
    Shutdown,
}

/// Feeds the endpoint's store fan-out into a store actor's mailbox.
pub(crate) struct StoreChannelSink {
    pub(crate) tx: Sender<StoreRequest>,
}

impl PathSink<CommandMessage> for StoreChannelSink {
    fn feed(
        &mut self,
        queue: &mut VecDeque<CommandMessage>,
        max: usize,
    ) -> Result<usize, PathGone> {
        let mut fed = 0;
        while fed < max {
            let Some(msg) = queue.pop_front() else {
                break;
            };
            if self.tx.send(StoreRequest::Network(msg)).is_err() {
                return Err(PathGone);
            }
            fed += 1;
        }
        Ok(fed)
    }
}

pub(crate) fn spawn_master(
    name: String,
    id: EntityId,
    backend: Backend,
    publisher: CorePublisher,
    config: EndpointConfig,
    rx: crossbeam::channel::Receiver<StoreRequest>,
) -> io::Result<JoinHandle<()>> {
    master::spawn(name, id, backend.open(), publisher, config, rx)
}

pub(crate) fn spawn_clone(
    name: String,
    id: EntityId,
    publisher: CorePublisher,
    config: EndpointConfig,
    rx: crossbeam::channel::Receiver<StoreRequest>,
) -> io::Result<JoinHandle<()>> {
    clone::spawn(name, id, publisher, config, rx)
}

/// Frontend handle of an attached master or clone. Writes are fire-and-
/// forget commands routed through the store actor; reads are synchronous
/// with a caller-controlled deadline.
#[derive(Clone)]
pub struct Store {
    name: String,
    id: EntityId,
    tx: Sender<StoreRequest>,
    timeout: Duration,
}

impl Store {
    pub(crate) fn new(name: String, id: EntityId, tx: Sender<StoreRequest>, timeout: Duration) -> Self {
        Self {
            name,
            id,
            tx,
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entity id mutations from this handle carry as publisher.
    pub fn frontend_id(&self) -> EntityId {
        self.id
    }

    pub fn put(&self, key: impl Into<Data>, value: impl Into<Data>) -> Result<(), StoreError> {
        self.write(Command::Put {
            key: key.into(),
            value: value.into(),
            expiry: None,
            publisher: self.id,
        })
    }

    pub fn put_with_expiry(
        &self,
        key: impl Into<Data>,
        value: impl Into<Data>,
        expiry: Duration,
    ) -> Result<(), StoreError> {
        self.write(Command::Put {
            key: key.into(),
            value: value.into(),
            expiry: Some(expiry),
            publisher: self.id,
        })
    }

    pub fn erase(&self, key: impl Into<Data>) -> Result<(), StoreError> {
        self.write(Command::Erase {
            key: key.into(),
            publisher: self.id,
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.write(Command::Clear { publisher: self.id })
    }

    /// Typed arithmetic on the current value; numbers add, strings and
    /// containers append.
    pub fn add(&self, key: impl Into<Data>, delta: impl Into<Data>) -> Result<(), StoreError> {
        self.write(Command::Add {
            key: key.into(),
            delta: delta.into(),
            expiry: None,
            publisher: self.id,
        })
    }

    pub fn subtract(&self, key: impl Into<Data>, delta: impl Into<Data>) -> Result<(), StoreError> {
        self.write(Command::Subtract {
            key: key.into(),
            delta: delta.into(),
            expiry: None,
            publisher: self.id,
        })
    }

    pub fn get(&self, key: impl Into<Data>) -> Result<Data, StoreError> {
        self.get_with_timeout(key, self.timeout)
    }

    pub fn get_with_timeout(
        &self,
        key: impl Into<Data>,
        timeout: Duration,
    ) -> Result<Data, StoreError> {
        let (reply, rx) = crossbeam::channel::bounded(1);
        self.tx
            .send(StoreRequest::Get {
                key: key.into(),
                reply,
            })
            .map_err(|_| StoreError::Detached)?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Detached),
        }
    }

    fn write(&self, command: Command) -> Result<(), StoreError> {
        self.tx
            .send(StoreRequest::Write(command))
            .map_err(|_| StoreError::Detached)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Store({}, {})", self.name, self.id)
    }
}
