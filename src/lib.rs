#![forbid(unsafe_code)]
//! trellis: a peer-to-peer publish/subscribe overlay with replicated
//! key-value stores.
//!
//! Each host runs one [`Endpoint`]; endpoints connect in an arbitrary graph
//! and jointly form a distribution tree along which topic-addressed
//! messages flow with bounded (TTL-capped) flooding. On top of that fabric
//! an endpoint may attach store [`Store`] masters (authoritative copies of
//! a keyed dataset) and clones (eventually consistent replicas that forward
//! writes to their master).

pub mod config;
pub mod core;
pub mod data;
pub mod downstream;
pub mod endpoint;
pub mod error;
pub mod flare;
pub mod frame;
pub mod id;
pub mod mailbox;
pub mod message;
pub mod recorder;
pub mod store;
pub mod telemetry;
pub mod topic;
pub mod transport;
pub mod wire;

pub use crate::config::EndpointConfig;
pub use crate::core::StatusEvent;
pub use crate::data::Data;
pub use crate::endpoint::{Endpoint, NodeHandle, StatusFeed, Subscriber};
pub use crate::error::{DisconnectReason, EndpointError, PeerError, StoreError};
pub use crate::id::{EndpointId, EntityId};
pub use crate::message::{Command, CommandMessage, DataMessage, NodeContent, NodeMessage};
pub use crate::store::{Backend, Store, StoreEvent};
pub use crate::topic::{Filter, Topic};
