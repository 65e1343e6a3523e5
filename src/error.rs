//! Error values surfaced by the engine. Nothing here panics an actor; every
//! failure is a value handed back to the caller or a status event.

use thiserror::Error;

/// Why a peer link went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed its stream.
    Closed,
    /// The handshake failed after the stream was opened.
    InvalidStreamState,
    /// The channel to the remote endpoint broke.
    ChannelBroken,
    /// The remote endpoint shut down.
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::InvalidStreamState => "invalid stream state",
            DisconnectReason::ChannelBroken => "channel broken",
            DisconnectReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Errors from peering operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("nil or malformed peer handle")]
    InvalidArgument,
    #[error("stream setup refused")]
    CannotAddDownstream,
    #[error("handshake failed after stream open")]
    InvalidStreamState,
    #[error("peer became unavailable during handshake")]
    PeerUnavailable,
    #[error("endpoint is shutting down")]
    ShuttingDown,
}

/// Errors from store operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no such key")]
    NoSuchKey,
    #[error("store request timed out")]
    Timeout,
    #[error("store actor is detached")]
    Detached,
    #[error("clone has not received a snapshot yet")]
    Uninitialized,
    #[error("cannot {op} {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("a store named {0} is already attached")]
    AlreadyExists(String),
}

/// Errors from facade calls into the endpoint actor.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint actor is gone")]
    Detached,
    #[error("empty topic")]
    InvalidTopic,
    #[error("io error: {0}")]
    Io(String),
}
