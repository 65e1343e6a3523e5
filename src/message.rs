//! The three message shapes carried through the distribution engine.

use std::time::Duration;

use crate::data::Data;
use crate::id::EntityId;
use crate::topic::Topic;

/// Opaque user data published on a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataMessage {
    pub topic: Topic,
    pub data: Data,
}

impl DataMessage {
    pub fn new(topic: impl Into<Topic>, data: impl Into<Data>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }
}

/// One entry of a store snapshot: key, value, and the remaining lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Data,
    pub value: Data,
    pub expiry: Option<Duration>,
}

/// A store replication command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Put {
        key: Data,
        value: Data,
        expiry: Option<Duration>,
        publisher: EntityId,
    },
    Erase {
        key: Data,
        publisher: EntityId,
    },
    Clear {
        publisher: EntityId,
    },
    Add {
        key: Data,
        delta: Data,
        expiry: Option<Duration>,
        publisher: EntityId,
    },
    Subtract {
        key: Data,
        delta: Data,
        expiry: Option<Duration>,
        publisher: EntityId,
    },
    /// Clone asks its master for the current state.
    SnapshotRequest {
        requester: EntityId,
    },
    /// Master answers with an atomic capture of its map.
    Snapshot {
        entries: Vec<SnapshotEntry>,
    },
    /// Master heartbeat on the clone channel.
    Keepalive,
}

impl Command {
    /// Short operation name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::Erase { .. } => "erase",
            Command::Clear { .. } => "clear",
            Command::Add { .. } => "add",
            Command::Subtract { .. } => "subtract",
            Command::SnapshotRequest { .. } => "snapshot_request",
            Command::Snapshot { .. } => "snapshot",
            Command::Keepalive => "keepalive",
        }
    }

    /// The entity that issued the command, if it carries one.
    pub fn publisher(&self) -> Option<EntityId> {
        match self {
            Command::Put { publisher, .. }
            | Command::Erase { publisher, .. }
            | Command::Clear { publisher }
            | Command::Add { publisher, .. }
            | Command::Subtract { publisher, .. } => Some(*publisher),
            Command::SnapshotRequest { requester } => Some(*requester),
            Command::Snapshot { .. } | Command::Keepalive => None,
        }
    }
}

/// A command addressed to a store channel.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandMessage {
    pub topic: Topic,
    pub command: Command,
}

impl CommandMessage {
    pub fn new(topic: impl Into<Topic>, command: Command) -> Self {
        Self {
            topic: topic.into(),
            command,
        }
    }
}

/// Payload of a node message: either user data or a store command.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeContent {
    Data(DataMessage),
    Command(CommandMessage),
}

impl NodeContent {
    pub fn topic(&self) -> &Topic {
        match self {
            NodeContent::Data(msg) => &msg.topic,
            NodeContent::Command(msg) => &msg.topic,
        }
    }
}

/// The unit of peer-to-peer traffic: content plus hop budget and origin.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeMessage {
    pub content: NodeContent,
    pub ttl: u16,
    pub sender: EntityId,
}

impl NodeMessage {
    pub fn new(content: NodeContent, ttl: u16, sender: EntityId) -> Self {
        Self {
            content,
            ttl,
            sender,
        }
    }

    pub fn topic(&self) -> &Topic {
        self.content.topic()
    }
}
