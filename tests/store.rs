//! Master/clone store scenarios.

use std::thread;
use std::time::{Duration, Instant};

use trellis::{
    Backend, Command, Data, Endpoint, EndpointConfig, EntityId, Store, StoreError, StoreEvent,
    Subscriber,
};

fn spawn_endpoint() -> Endpoint {
    Endpoint::spawn(EndpointConfig::default()).expect("spawn endpoint")
}

fn settle() {
    thread::sleep(Duration::from_millis(250));
}

/// Polls a store read until it matches, bounded by a deadline. Needed for
/// values that arrive through the replication fabric.
fn poll_get(store: &Store, key: &str, expected: Result<Data, StoreError>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let got = store.get_with_timeout(key, Duration::from_millis(500));
        if got == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "store never converged: last read {got:?}, expected {expected:?}"
        );
        thread::sleep(Duration::from_millis(20));
    }
}

fn drain_event_log(sub: &Subscriber) -> Vec<String> {
    let mut log = Vec::new();
    while let Some(msg) = sub.try_recv() {
        let event = StoreEvent::parse(&msg).expect("unparsable store event");
        log.push(event.to_string());
    }
    log
}

fn assert_log_matches(log: &[String], prefixes: &[&str]) {
    assert_eq!(
        log.len(),
        prefixes.len(),
        "unexpected event count: {log:?}"
    );
    for (line, prefix) in log.iter().zip(prefixes) {
        assert!(
            line.starts_with(prefix),
            "event {line:?} does not match {prefix:?}"
        );
    }
}

#[test]
fn local_master_put_get_clear_and_event_log() {
    let ep = spawn_endpoint();
    let log = ep.subscribe(".store_events").unwrap();
    let ds = ep.attach_master("foo", Backend::Memory).unwrap();
    assert_eq!(ds.name(), "foo");

    // Writes and reads to the master share one mailbox, so no settling is
    // needed for locally issued commands.
    ds.put("hello", "world").unwrap();
    assert_eq!(ds.get("hello").unwrap(), Data::from("world"));

    // A put published on the master's topic behaves like a frontend put.
    ep.publish_command(
        "foo/master",
        Command::Put {
            key: "hello".into(),
            value: "universe".into(),
            expiry: None,
            publisher: EntityId::nil(),
        },
    )
    .unwrap();
    poll_get(&ds, "hello", Ok(Data::from("universe")));

    ds.clear().unwrap();
    poll_get(&ds, "hello", Err(StoreError::NoSuchKey));

    settle();
    let log = drain_event_log(&log);
    assert_log_matches(
        &log,
        &[
            "insert(foo, hello, world, none, ",
            "update(foo, hello, world, universe, none, ",
            "erase(foo, hello, ",
        ],
    );
}

#[test]
fn master_with_remote_clone_converges_both_ways() {
    let earth = spawn_endpoint();
    let mars = spawn_endpoint();
    let earth_log = earth.subscribe(".store_events").unwrap();
    let mars_log = mars.subscribe(".store_events").unwrap();

    let ds_earth = earth.attach_master("foo", Backend::Memory).unwrap();
    ds_earth.put("test", 123).unwrap();
    assert_eq!(ds_earth.get("test").unwrap(), Data::from(123));

    earth.peer(&mars.handle()).unwrap();
    let ds_mars = mars.attach_clone("foo").unwrap();

    // The clone initializes from the master's snapshot...
    poll_get(&ds_mars, "test", Ok(Data::from(123)));

    // ...and writes through to the master, which reflects them back.
    ds_mars.put("user", "neverlord").unwrap();
    poll_get(&ds_earth, "user", Ok(Data::from("neverlord")));
    poll_get(&ds_mars, "user", Ok(Data::from("neverlord")));

    settle();
    // Events are produced locally on each endpoint: the master's log on
    // earth, the clone's on mars. Both must describe the same history.
    let expected = [
        "insert(foo, test, 123, none, ",
        "insert(foo, user, neverlord, none, ",
    ];
    assert_log_matches(&drain_event_log(&earth_log), &expected);
    assert_log_matches(&drain_event_log(&mars_log), &expected);
}

#[test]
fn add_and_subtract_apply_typed_arithmetic() {
    let ep = spawn_endpoint();
    let ds = ep.attach_master("counters", Backend::Memory).unwrap();

    ds.put("n", 1).unwrap();
    ds.add("n", 5).unwrap();
    ds.subtract("n", 2).unwrap();
    assert_eq!(ds.get("n").unwrap(), Data::from(4));

    // Absent keys initialize from the delta; strings append.
    ds.add("s", "x").unwrap();
    ds.add("s", "y").unwrap();
    assert_eq!(ds.get("s").unwrap(), Data::from("xy"));

    // A type mismatch leaves the current value untouched.
    ds.add("n", "oops").unwrap();
    assert_eq!(ds.get("n").unwrap(), Data::from(4));
}

#[test]
fn expired_keys_are_erased_by_the_master_timer() {
    let ep = spawn_endpoint();
    let log = ep.subscribe(".store_events").unwrap();
    let ds = ep.attach_master("foo", Backend::Memory).unwrap();

    ds.put_with_expiry("k", 1, Duration::from_millis(50)).unwrap();
    assert_eq!(ds.get("k").unwrap(), Data::from(1));

    poll_get(&ds, "k", Err(StoreError::NoSuchKey));

    settle();
    let log = drain_event_log(&log);
    assert_log_matches(&log, &["insert(foo, k, 1, ", "erase(foo, k, "]);
    // The timer-driven erase names the master itself as publisher.
    assert!(!log[1].contains("none)"), "expiry erase lost its publisher");
}

#[test]
fn clone_reads_fail_until_a_snapshot_arrives() {
    let ep = spawn_endpoint();
    // No master exists anywhere, so the snapshot never comes.
    let ds = ep.attach_clone("orphan").unwrap();
    assert_eq!(
        ds.get_with_timeout("k", Duration::from_millis(200)),
        Err(StoreError::Uninitialized)
    );
}

#[test]
fn attaching_the_same_store_twice_fails() {
    let ep = spawn_endpoint();
    let _ds = ep.attach_master("foo", Backend::Memory).unwrap();
    assert!(matches!(
        ep.attach_master("foo", Backend::Memory),
        Err(StoreError::AlreadyExists(_))
    ));
}
