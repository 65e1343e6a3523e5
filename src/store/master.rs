//! The master actor: authoritative state of a named store.
//!
//! Accepts commands from its local frontend and from the endpoint's store
//! fan-out, mutates the backend, emits change events on the store-event
//! topic, and streams commands to clones over the clone channel. Expired
//! keys are removed by a timer and emit `erase` with the master as
//! publisher.

use std::collections::BTreeSet;
use std::io;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::data::{Data, Real};
use crate::endpoint::CorePublisher;
use crate::error::StoreError;
use crate::id::EntityId;
use crate::message::{Command, CommandMessage, DataMessage};
use crate::store::events;
use crate::store::{StorageBackend, StoreRequest};
use crate::topic::Topic;

pub(crate) fn spawn(
    name: String,
    id: EntityId,
    backend: Box<dyn StorageBackend>,
    publisher: CorePublisher,
    config: EndpointConfig,
    rx: Receiver<StoreRequest>,
) -> io::Result<JoinHandle<()>> {
    let thread_name = format!("trellis-master-{name}");
    std::thread::Builder::new().name(thread_name).spawn(move || {
        let actor = MasterActor {
            master_channel: Topic::master_channel(&name),
            clone_channel: Topic::clone_channel(&name),
            events_topic: Topic::store_events(&name),
            name,
            id,
            backend,
            publisher,
            keepalive_interval: config.keepalive_interval,
            next_keepalive: Instant::now() + config.keepalive_interval,
            clones: BTreeSet::new(),
        };
        actor.run(rx);
    })
}

struct MasterActor {
    name: String,
    id: EntityId,
    master_channel: Topic,
    clone_channel: Topic,
    events_topic: Topic,
    backend: Box<dyn StorageBackend>,
    publisher: CorePublisher,
    keepalive_interval: Duration,
    next_keepalive: Instant,
    clones: BTreeSet<EntityId>,
}

impl MasterActor {
    fn run(mut self, rx: Receiver<StoreRequest>) {
        debug!(store = %self.name, id = %self.id, "master attached");
        loop {
            let deadline = self.next_deadline();
            let request = match deadline {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(request) => Some(request),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(request) => Some(request),
                    Err(_) => break,
                },
            };
            match request {
                Some(StoreRequest::Shutdown) => break,
                Some(StoreRequest::Network(msg)) => self.on_network(msg),
                Some(StoreRequest::Write(command)) => self.apply(command),
                Some(StoreRequest::Get { key, reply }) => {
                    let result = self
                        .backend
                        .get(&key, Instant::now())
                        .ok_or(StoreError::NoSuchKey);
                    let _ = reply.send(result);
                }
                None => {}
            }
            let now = Instant::now();
            self.sweep_expired(now);
            self.maybe_keepalive(now);
        }
        debug!(store = %self.name, "master detached");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let expiry = self.backend.next_expiry();
        let keepalive = if self.clones.is_empty() {
            None
        } else {
            Some(self.next_keepalive)
        };
        match (expiry, keepalive) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_network(&mut self, msg: CommandMessage) {
        if msg.topic != self.master_channel {
            debug!(store = %self.name, topic = %msg.topic, "command on foreign topic ignored");
            return;
        }
        match msg.command {
            Command::SnapshotRequest { requester } => self.on_snapshot_request(requester),
            Command::Snapshot { .. } | Command::Keepalive => {
                debug!(store = %self.name, "clone-channel command ignored by master");
            }
            command => self.apply(command),
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Put {
                key,
                value,
                expiry,
                publisher,
            } => self.apply_put(key, value, expiry, publisher),
            Command::Erase { key, publisher } => self.apply_erase(key, publisher),
            Command::Clear { publisher } => {
                for key in self.backend.clear() {
                    self.emit_erase(&key, publisher);
                }
                self.forward(Command::Clear { publisher });
            }
            Command::Add {
                key,
                delta,
                expiry,
                publisher,
            } => {
                let current = self.backend.get(&key, Instant::now());
                match add_values(current, &delta) {
                    Ok(value) => self.apply_put(key, value, expiry, publisher),
                    Err(err) => warn!(store = %self.name, %key, %err, "add failed"),
                }
            }
            Command::Subtract {
                key,
                delta,
                expiry,
                publisher,
            } => {
                let current = self.backend.get(&key, Instant::now());
                match subtract_values(current, &delta) {
                    Ok(value) => self.apply_put(key, value, expiry, publisher),
                    Err(err) => warn!(store = %self.name, %key, %err, "subtract failed"),
                }
            }
            Command::SnapshotRequest { requester } => self.on_snapshot_request(requester),
            Command::Snapshot { .. } | Command::Keepalive => {}
        }
    }

    fn apply_put(
        &mut self,
        key: Data,
        value: Data,
        expiry: Option<Duration>,
        publisher: EntityId,
    ) {
        let expires_at = expiry.map(|d| Instant::now() + d);
        let old = self.backend.put(key.clone(), value.clone(), expires_at);
        match old {
            None => self.emit_insert(&key, &value, expiry, publisher),
            Some(old) => self.emit_update(&key, &old, &value, expiry, publisher),
        }
        self.forward(Command::Put {
            key,
            value,
            expiry,
            publisher,
        });
    }

    fn apply_erase(&mut self, key: Data, publisher: EntityId) {
        if self.backend.erase(&key).is_none() {
            debug!(store = %self.name, %key, "erase on absent key");
            return;
        }
        self.emit_erase(&key, publisher);
        self.forward(Command::Erase { key, publisher });
    }

    fn on_snapshot_request(&mut self, requester: EntityId) {
        debug!(store = %self.name, %requester, "clone requested a snapshot");
        self.clones.insert(requester);
        let entries = self.backend.snapshot(Instant::now());
        self.publisher.publish_command(CommandMessage {
            topic: self.clone_channel.clone(),
            command: Command::Snapshot { entries },
        });
    }

    fn sweep_expired(&mut self, now: Instant) {
        for key in self.backend.expire_due(now) {
            debug!(store = %self.name, %key, "key expired");
            self.emit_erase(&key, self.id);
            self.forward(Command::Erase {
                key,
                publisher: self.id,
            });
        }
    }

    fn maybe_keepalive(&mut self, now: Instant) {
        if self.clones.is_empty() || now < self.next_keepalive {
            return;
        }
        self.next_keepalive = now + self.keepalive_interval;
        self.publisher.publish_command(CommandMessage {
            topic: self.clone_channel.clone(),
            command: Command::Keepalive,
        });
    }

    /// Streams a mutation to the clone channel.
    fn forward(&self, command: Command) {
        if self.clones.is_empty() {
            return;
        }
        self.publisher.publish_command(CommandMessage {
            topic: self.clone_channel.clone(),
            command,
        });
    }

    // -- change events --------------------------------------------------------

    // Change events are visible to local subscribers only; each endpoint's
    // event log is produced by its own store actors.

    fn emit_insert(
        &self,
        key: &Data,
        value: &Data,
        expiry: Option<Duration>,
        publisher: EntityId,
    ) {
        self.emit_event(events::insert_event(key, value, expiry, publisher));
    }

    fn emit_update(
        &self,
        key: &Data,
        old_value: &Data,
        new_value: &Data,
        expiry: Option<Duration>,
        publisher: EntityId,
    ) {
        self.emit_event(events::update_event(
            key, old_value, new_value, expiry, publisher,
        ));
    }

    fn emit_erase(&self, key: &Data, publisher: EntityId) {
        self.emit_event(events::erase_event(key, publisher));
    }

    fn emit_event(&self, data: Data) {
        self.publisher.publish_local_data(DataMessage {
            topic: self.events_topic.clone(),
            data,
        });
    }
}

fn add_values(current: Option<Data>, delta: &Data) -> Result<Data, StoreError> {
    let Some(current) = current else {
        // Absent keys initialize from the delta.
        return Ok(delta.clone());
    };
    match (current, delta) {
        (Data::Integer(a), Data::Integer(b)) => Ok(Data::Integer(a.wrapping_add(*b))),
        (Data::Real(a), Data::Real(b)) => Ok(Data::Real(Real(a.0 + b.0))),
        (Data::Str(a), Data::Str(b)) => Ok(Data::Str(a + b)),
        (Data::List(mut xs), d) => {
            xs.push(d.clone());
            Ok(Data::List(xs))
        }
        (Data::Set(mut xs), d) => {
            xs.insert(d.clone());
            Ok(Data::Set(xs))
        }
        (current, delta) => Err(StoreError::TypeMismatch {
            op: "add",
            lhs: current.kind(),
            rhs: delta.kind(),
        }),
    }
}

fn subtract_values(current: Option<Data>, delta: &Data) -> Result<Data, StoreError> {
    let Some(current) = current else {
        return Err(StoreError::NoSuchKey);
    };
    match (current, delta) {
        (Data::Integer(a), Data::Integer(b)) => Ok(Data::Integer(a.wrapping_sub(*b))),
        (Data::Real(a), Data::Real(b)) => Ok(Data::Real(Real(a.0 - b.0))),
        (Data::Set(mut xs), d) => {
            xs.remove(d);
            Ok(Data::Set(xs))
        }
        (Data::List(mut xs), d) => {
            if let Some(pos) = xs.iter().position(|x| x == d) {
                xs.remove(pos);
            }
            Ok(Data::List(xs))
        }
        (current, delta) => Err(StoreError::TypeMismatch {
            op: "subtract",
            lhs: current.kind(),
            rhs: delta.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_initializes_absent_keys_from_the_delta() {
        assert_eq!(add_values(None, &Data::from(5)), Ok(Data::from(5)));
    }

    #[test]
    fn add_covers_numbers_strings_and_containers() {
        assert_eq!(
            add_values(Some(Data::from(2)), &Data::from(3)),
            Ok(Data::from(5))
        );
        assert_eq!(
            add_values(Some(Data::from("ab")), &Data::from("cd")),
            Ok(Data::from("abcd"))
        );
        let list = Data::List(vec![Data::from(1)]);
        assert_eq!(
            add_values(Some(list), &Data::from(2)),
            Ok(Data::List(vec![Data::from(1), Data::from(2)]))
        );
    }

    #[test]
    fn mismatched_types_refuse_to_add() {
        assert!(matches!(
            add_values(Some(Data::from(1)), &Data::from("x")),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn subtract_requires_an_existing_key() {
        assert_eq!(
            subtract_values(None, &Data::from(1)),
            Err(StoreError::NoSuchKey)
        );
        assert_eq!(
            subtract_values(Some(Data::from(5)), &Data::from(2)),
            Ok(Data::from(3))
        );
    }
}
