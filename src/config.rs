//! Endpoint configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Initial TTL stamped on published node messages.
pub const DEFAULT_TTL: u16 = 20;

/// Default cap on recorder file entries.
pub const DEFAULT_RECORDER_CAP: u64 = 100_000;

/// Tunables of a single endpoint. All fields have defaults; construct with
/// struct update syntax or deserialize from a config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Forward messages received from peers to other peers. Endpoints that
    /// leave this off act as leaves: they consume and publish but never
    /// relay.
    pub forward: bool,
    /// Hop budget for published node messages.
    pub ttl: u16,
    /// Directory for the message recorder; `None` disables recording.
    pub recording_directory: Option<PathBuf>,
    /// Maximum number of node messages the recorder writes.
    pub recorder_file_cap: u64,
    /// Credit window granted to each peer path.
    pub peer_credit: usize,
    /// Maximum items per emitted batch.
    pub batch_size: usize,
    /// Capacity of subscriber mailboxes.
    pub subscriber_capacity: usize,
    /// Interval between master keepalives on the clone channel.
    pub keepalive_interval: Duration,
    /// Default deadline for synchronous store reads.
    pub store_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            forward: false,
            ttl: DEFAULT_TTL,
            recording_directory: None,
            recorder_file_cap: DEFAULT_RECORDER_CAP,
            peer_credit: 64,
            batch_size: 32,
            subscriber_capacity: 256,
            keepalive_interval: Duration::from_secs(2),
            store_timeout: Duration::from_secs(10),
        }
    }
}

impl EndpointConfig {
    /// A forwarding ("router") configuration.
    pub fn router() -> Self {
        Self {
            forward: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EndpointConfig::default();
        assert!(!config.forward);
        assert_eq!(config.ttl, DEFAULT_TTL);
        assert!(config.recording_directory.is_none());
        assert!(config.peer_credit > 0);
        assert!(config.batch_size > 0);
    }

    #[test]
    fn router_config_forwards() {
        assert!(EndpointConfig::router().forward);
    }
}
