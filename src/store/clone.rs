//! The clone actor: an eventually consistent replica of a master.
//!
//! On attach it requests a snapshot over the master channel, discards
//! mutations until the snapshot arrives, then applies the streamed commands
//! to its shadow map. Local writes are proxied to the master; the reflected
//! command updates the shadow when it comes back. Like the master, a clone
//! emits change events for the mutations it applies, so every endpoint's
//! event log is produced locally. Keepalives track master liveness; a
//! silent master triggers a fresh snapshot request, which also covers
//! resynchronization after a peer reconnect.

use std::io;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::data::Data;
use crate::endpoint::CorePublisher;
use crate::error::StoreError;
use crate::id::EntityId;
use crate::message::{Command, CommandMessage, DataMessage, SnapshotEntry};
use crate::store::events;
use crate::store::{MemoryBackend, StorageBackend, StoreRequest};
use crate::topic::Topic;

/// Keepalive intervals without master contact before a clone resyncs.
const STALE_INTERVALS: u32 = 3;

pub(crate) fn spawn(
    name: String,
    id: EntityId,
    publisher: CorePublisher,
    config: EndpointConfig,
    rx: Receiver<StoreRequest>,
) -> io::Result<JoinHandle<()>> {
    let thread_name = format!("trellis-clone-{name}");
    std::thread::Builder::new().name(thread_name).spawn(move || {
        let now = Instant::now();
        let actor = CloneActor {
            master_channel: Topic::master_channel(&name),
            clone_channel: Topic::clone_channel(&name),
            events_topic: Topic::store_events(&name),
            name,
            id,
            publisher,
            shadow: MemoryBackend::new(),
            initialized: false,
            keepalive_interval: config.keepalive_interval,
            last_master_contact: now,
            last_snapshot_request: now,
        };
        actor.run(rx);
    })
}

struct CloneActor {
    name: String,
    id: EntityId,
    master_channel: Topic,
    clone_channel: Topic,
    events_topic: Topic,
    publisher: CorePublisher,
    shadow: MemoryBackend,
    initialized: bool,
    keepalive_interval: Duration,
    last_master_contact: Instant,
    last_snapshot_request: Instant,
}

impl CloneActor {
    fn run(mut self, rx: Receiver<StoreRequest>) {
        debug!(store = %self.name, id = %self.id, "clone attached");
        self.request_snapshot();
        loop {
            let request = match rx.recv_timeout(self.keepalive_interval) {
                Ok(request) => Some(request),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match request {
                Some(StoreRequest::Shutdown) => break,
                Some(StoreRequest::Network(msg)) => self.on_network(msg),
                Some(StoreRequest::Write(command)) => self.on_write(command),
                Some(StoreRequest::Get { key, reply }) => {
                    let result = if self.initialized {
                        self.shadow
                            .get(&key, Instant::now())
                            .ok_or(StoreError::NoSuchKey)
                    } else {
                        Err(StoreError::Uninitialized)
                    };
                    let _ = reply.send(result);
                }
                None => {}
            }
            let now = Instant::now();
            self.shadow.expire_due(now);
            self.check_master_liveness(now);
        }
        debug!(store = %self.name, "clone detached");
    }

    fn on_network(&mut self, msg: CommandMessage) {
        if msg.topic != self.clone_channel {
            debug!(store = %self.name, topic = %msg.topic, "command on foreign topic ignored");
            return;
        }
        self.last_master_contact = Instant::now();
        match msg.command {
            Command::Snapshot { entries } => self.apply_snapshot(entries),
            Command::Keepalive => {}
            command if !self.initialized => {
                // Everything broadcast before the snapshot is contained in it.
                debug!(store = %self.name, op = command.name(), "mutation before snapshot discarded");
            }
            Command::Put {
                key,
                value,
                expiry,
                publisher,
            } => {
                let expires_at = expiry.map(|d| Instant::now() + d);
                let old = self.shadow.put(key.clone(), value.clone(), expires_at);
                match old {
                    None => {
                        self.emit_event(events::insert_event(&key, &value, expiry, publisher));
                    }
                    Some(old) => {
                        self.emit_event(events::update_event(
                            &key, &old, &value, expiry, publisher,
                        ));
                    }
                }
            }
            Command::Erase { key, publisher } => {
                if self.shadow.erase(&key).is_some() {
                    self.emit_event(events::erase_event(&key, publisher));
                }
            }
            Command::Clear { publisher } => {
                for key in self.shadow.clear() {
                    self.emit_event(events::erase_event(&key, publisher));
                }
            }
            command => {
                // Masters rewrite arithmetic as plain puts before forwarding.
                warn!(store = %self.name, op = command.name(), "unexpected command on clone channel");
            }
        }
    }

    /// Replaces the shadow from a snapshot, emitting the difference as
    /// change events with this clone as publisher.
    fn apply_snapshot(&mut self, entries: Vec<SnapshotEntry>) {
        debug!(store = %self.name, entries = entries.len(), "snapshot received");
        let now = Instant::now();
        for entry in &entries {
            match self.shadow.get(&entry.key, now) {
                None => {
                    self.emit_event(events::insert_event(
                        &entry.key,
                        &entry.value,
                        entry.expiry,
                        self.id,
                    ));
                }
                Some(old) if old != entry.value => {
                    self.emit_event(events::update_event(
                        &entry.key,
                        &old,
                        &entry.value,
                        entry.expiry,
                        self.id,
                    ));
                }
                Some(_) => {}
            }
        }
        let snapshot_keys: Vec<&Data> = entries.iter().map(|entry| &entry.key).collect();
        for stale in self.shadow.snapshot(now) {
            if !snapshot_keys.contains(&&stale.key) {
                self.emit_event(events::erase_event(&stale.key, self.id));
            }
        }
        self.shadow.replace_all(entries, now);
        self.initialized = true;
    }

    /// Local writes go to the master; the shadow updates when the command
    /// comes back over the clone channel.
    fn on_write(&mut self, command: Command) {
        self.publisher.publish_command(CommandMessage {
            topic: self.master_channel.clone(),
            command,
        });
    }

    fn emit_event(&self, data: Data) {
        self.publisher.publish_local_data(DataMessage {
            topic: self.events_topic.clone(),
            data,
        });
    }

    fn check_master_liveness(&mut self, now: Instant) {
        let stale_after = self.keepalive_interval * STALE_INTERVALS;
        if now.duration_since(self.last_master_contact) < stale_after {
            return;
        }
        if now.duration_since(self.last_snapshot_request) < self.keepalive_interval {
            return;
        }
        debug!(store = %self.name, "master silent; requesting a fresh snapshot");
        self.request_snapshot();
    }

    fn request_snapshot(&mut self) {
        self.last_snapshot_request = Instant::now();
        self.publisher.publish_command(CommandMessage {
            topic: self.master_channel.clone(),
            command: Command::SnapshotRequest { requester: self.id },
        });
    }
}
