//! Recorder round-trip through a live endpoint.

use std::thread;
use std::time::Duration;

use trellis::config::DEFAULT_TTL;
use trellis::recorder::{self, RECORDER_FILE_NAME};
use trellis::{Data, Endpoint, EndpointConfig, EntityId, NodeContent};

#[test]
fn recorder_captures_published_messages_for_replay() {
    let dir = tempfile::tempdir().unwrap();
    let config = EndpointConfig {
        recording_directory: Some(dir.path().to_path_buf()),
        ..EndpointConfig::default()
    };
    let a = Endpoint::spawn(config).unwrap();
    let b = Endpoint::spawn(EndpointConfig::default()).unwrap();
    let a_id = a.id();

    a.peer(&b.handle()).unwrap();
    let sub = b.subscribe("x").unwrap();
    thread::sleep(Duration::from_millis(250));

    a.publish("x", 1).unwrap();
    a.publish("x", 2).unwrap();
    assert_eq!(
        sub.recv_timeout(Duration::from_secs(5)).unwrap().data,
        Data::from(1)
    );
    assert_eq!(
        sub.recv_timeout(Duration::from_secs(5)).unwrap().data,
        Data::from(2)
    );

    // Shut the recording endpoint down before reading its file.
    a.shutdown();

    let messages = recorder::replay(&dir.path().join(RECORDER_FILE_NAME)).unwrap();
    assert_eq!(messages.len(), 2);
    for (msg, expected) in messages.iter().zip([Data::from(1), Data::from(2)]) {
        assert_eq!(msg.ttl, DEFAULT_TTL);
        assert_eq!(msg.sender, EntityId::endpoint_root(a_id));
        match &msg.content {
            NodeContent::Data(dm) => {
                assert_eq!(dm.topic.as_str(), "x");
                assert_eq!(dm.data, expected);
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }
}

#[test]
fn recording_cap_bounds_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = EndpointConfig {
        recording_directory: Some(dir.path().to_path_buf()),
        recorder_file_cap: 3,
        ..EndpointConfig::default()
    };
    let a = Endpoint::spawn(config).unwrap();
    for n in 0..10 {
        a.publish("x", n).unwrap();
    }
    thread::sleep(Duration::from_millis(250));
    a.shutdown();

    let messages = recorder::replay(&dir.path().join(RECORDER_FILE_NAME)).unwrap();
    assert_eq!(messages.len(), 3);
}
