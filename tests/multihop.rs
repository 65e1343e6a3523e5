//! Multi-hop routing scenarios over in-process overlays.

use std::thread;
use std::time::{Duration, Instant};

use trellis::{
    Data, DataMessage, Endpoint, EndpointConfig, NodeHandle, PeerError, StatusEvent, Subscriber,
};

fn spawn_leaf() -> Endpoint {
    Endpoint::spawn(EndpointConfig::default()).expect("spawn endpoint")
}

fn spawn_router() -> Endpoint {
    Endpoint::spawn(EndpointConfig::router()).expect("spawn endpoint")
}

fn connect(a: &Endpoint, b: &Endpoint) {
    a.peer(&b.handle()).expect("peering failed");
}

/// Lets subscriptions and filter updates propagate through the overlay.
fn settle() {
    thread::sleep(Duration::from_millis(250));
}

fn recv(sub: &Subscriber) -> DataMessage {
    sub.recv_timeout(Duration::from_secs(5)).expect("no message")
}

fn recv_status(feed: &trellis::StatusFeed) -> StatusEvent {
    feed.recv_timeout(Duration::from_secs(5)).expect("no status event")
}

#[test]
fn chain_of_nodes_routes_multihop() {
    // n0 [a] -- n1 [b, router] -- n2 [c]
    let n0 = spawn_leaf();
    let n1 = spawn_router();
    let n2 = spawn_leaf();

    connect(&n0, &n1);
    connect(&n1, &n2);
    settle();
    assert_eq!(n0.peers().len(), 1);
    assert_eq!(n1.peers().len(), 2);
    assert_eq!(n2.peers().len(), 1);

    let sub0 = n0.subscribe("a").unwrap();
    let sub1 = n1.subscribe("b").unwrap();
    let sub2 = n2.subscribe("c").unwrap();
    settle();

    // n2 -> n0 through the router, twice.
    for _ in 0..2 {
        n2.publish("a", "ping").unwrap();
    }
    for _ in 0..2 {
        let msg = recv(&sub0);
        assert_eq!(msg.topic.as_str(), "a");
        assert_eq!(msg.data, Data::from("ping"));
    }

    settle();
    assert!(sub0.is_empty());
    assert!(sub1.is_empty());
    assert!(sub2.is_empty());

    // n0 -> n2.
    n0.publish("c", "pong").unwrap();
    let msg = recv(&sub2);
    assert_eq!(msg.topic.as_str(), "c");
    assert_eq!(msg.data, Data::from("pong"));

    settle();
    assert!(sub0.is_empty());
    assert!(sub1.is_empty());
    assert!(sub2.is_empty());
}

#[test]
fn cluster_broadcast_reaches_every_subscriber_once() {
    // Fully meshed control node n0 with workers n1..n4, as in a typical
    // cluster layout. Leaves do not forward, so the mesh stays duplicate
    // free.
    let n0 = spawn_leaf();
    let n1 = spawn_leaf();
    let n2 = spawn_leaf();
    let n3 = spawn_leaf();
    let n4 = spawn_leaf();

    connect(&n0, &n1);
    connect(&n0, &n2);
    connect(&n0, &n3);
    connect(&n0, &n4);
    connect(&n1, &n2);
    connect(&n1, &n3);
    connect(&n1, &n4);
    connect(&n2, &n4);
    connect(&n3, &n4);
    settle();
    assert_eq!(n0.peers().len(), 4);
    assert_eq!(n1.peers().len(), 4);
    assert_eq!(n2.peers().len(), 3);
    assert_eq!(n3.peers().len(), 3);
    assert_eq!(n4.peers().len(), 4);

    let sub0 = n0.subscribe("b").unwrap();
    let workers = [
        n1.subscribe("a").unwrap(),
        n2.subscribe("a").unwrap(),
        n3.subscribe("a").unwrap(),
        n4.subscribe("a").unwrap(),
    ];
    settle();

    n0.publish("a", "ping").unwrap();
    for sub in &workers {
        let msg = recv(sub);
        assert_eq!(msg.topic.as_str(), "a");
    }

    settle();
    assert!(sub0.is_empty());
    for sub in &workers {
        assert!(sub.is_empty(), "duplicate delivery in the mesh");
    }
}

#[test]
fn unpeer_partitions_the_overlay() {
    //       n0 [a]
    //       |
    //       n1 [b, router]
    //      /  \
    // [c] n2   n3 [b, router]
    //          |
    //          n4 [d, router]
    //          |
    //          n5 [e]
    let n0 = spawn_leaf();
    let n1 = spawn_router();
    let n2 = spawn_leaf();
    let n3 = spawn_router();
    let n4 = spawn_router();
    let n5 = spawn_leaf();

    connect(&n0, &n1);
    connect(&n1, &n2);
    connect(&n1, &n3);
    connect(&n3, &n4);
    connect(&n4, &n5);
    settle();

    let sub0 = n0.subscribe("a").unwrap();
    let sub1 = n1.subscribe("b").unwrap();
    let sub2 = n2.subscribe("c").unwrap();
    let sub3 = n3.subscribe("b").unwrap();
    let sub4 = n4.subscribe("d").unwrap();
    let sub5 = n5.subscribe("e").unwrap();
    settle();

    // End-to-end delivery before the partition.
    n0.publish("b", "ping").unwrap();
    n0.publish("e", "ping").unwrap();
    assert_eq!(recv(&sub1).topic.as_str(), "b");
    assert_eq!(recv(&sub3).topic.as_str(), "b");
    assert_eq!(recv(&sub5).topic.as_str(), "e");

    n3.publish("a", "pong").unwrap();
    assert_eq!(recv(&sub0).topic.as_str(), "a");

    settle();
    for sub in [&sub0, &sub1, &sub2, &sub3, &sub4, &sub5] {
        assert!(sub.is_empty());
    }

    // Partition the overlay between n1 and n3.
    n3.unpeer(&n1.handle()).unwrap();
    settle();

    // "b" still reaches n1 in the first partition, but no longer n3.
    n0.publish("b", "ping").unwrap();
    assert_eq!(recv(&sub1).topic.as_str(), "b");

    // "e" is only subscribed across the partition: no delivery anywhere.
    n0.publish("e", "ping").unwrap();
    settle();
    for sub in [&sub0, &sub1, &sub2, &sub3, &sub4, &sub5] {
        assert!(sub.is_empty(), "message crossed a partition");
    }
}

#[test]
fn ttl_expires_after_the_hop_budget() {
    let short_ttl = EndpointConfig {
        ttl: 2,
        ..EndpointConfig::default()
    };
    let short_ttl_router = EndpointConfig {
        ttl: 2,
        forward: true,
        ..EndpointConfig::default()
    };
    let n0 = Endpoint::spawn(short_ttl.clone()).unwrap();
    let n1 = Endpoint::spawn(short_ttl_router.clone()).unwrap();
    let n2 = Endpoint::spawn(short_ttl_router).unwrap();
    let n3 = Endpoint::spawn(short_ttl).unwrap();

    connect(&n0, &n1);
    connect(&n1, &n2);
    connect(&n2, &n3);
    settle();

    let sub1 = n1.subscribe("t").unwrap();
    let sub2 = n2.subscribe("t/x").unwrap();
    let sub3 = n3.subscribe("t/x/y").unwrap();
    let status2 = n2.status_feed().unwrap();
    settle();

    n0.publish("t/x/y", "ping").unwrap();

    // Two hops succeed...
    assert_eq!(recv(&sub1).topic.as_str(), "t/x/y");
    assert_eq!(recv(&sub2).topic.as_str(), "t/x/y");

    // ...and the third node drops the message with a TTL event.
    let event = recv_status(&status2);
    assert_eq!(
        event,
        StatusEvent::TtlExpired {
            topic: "t/x/y".into()
        }
    );
    assert!(sub3.recv_timeout(Duration::from_millis(300)).is_none());
}

#[test]
fn published_messages_never_return_to_their_origin() {
    let a = spawn_leaf();
    let b = spawn_router();
    connect(&a, &b);

    let sub_a = a.subscribe("x").unwrap();
    let sub_b = b.subscribe("x").unwrap();
    settle();

    a.publish("x", "ping").unwrap();
    // One local copy at the origin, one copy at the peer, and nothing
    // reflected back by the router.
    assert_eq!(recv(&sub_a).data, Data::from("ping"));
    assert_eq!(recv(&sub_b).data, Data::from("ping"));
    settle();
    assert!(sub_a.is_empty(), "message reflected to its origin");
    assert!(sub_b.is_empty());
}

#[test]
fn peering_emits_status_events_on_both_ends() {
    let a = spawn_leaf();
    let b = spawn_leaf();
    let status_a = a.status_feed().unwrap();
    let status_b = b.status_feed().unwrap();

    connect(&a, &b);
    assert_eq!(recv_status(&status_a), StatusEvent::PeerAdded { peer: b.id() });
    assert_eq!(recv_status(&status_b), StatusEvent::PeerAdded { peer: a.id() });

    a.unpeer(&b.handle()).unwrap();
    assert_eq!(
        recv_status(&status_a),
        StatusEvent::PeerRemoved { peer: b.id() }
    );
    match recv_status(&status_b) {
        StatusEvent::PeerDisconnected { peer, .. } => assert_eq!(peer, a.id()),
        other => panic!("expected disconnect, got {other:?}"),
    }
}

#[test]
fn peering_is_idempotent_and_rejects_nil_handles() {
    let a = spawn_leaf();
    let b = spawn_leaf();

    assert_eq!(a.peer(&NodeHandle::nil()), Err(PeerError::InvalidArgument));

    connect(&a, &b);
    // Repeated peering succeeds as a no-op.
    connect(&a, &b);
    connect(&b, &a);
    settle();
    assert_eq!(a.peers().len(), 1);
    assert_eq!(b.peers().len(), 1);
}

#[test]
fn blocked_peers_buffer_batches_until_unblocked() {
    let a = spawn_leaf();
    let b = spawn_leaf();
    connect(&a, &b);
    let sub_b = b.subscribe("x").unwrap();
    settle();

    b.block_peer(a.id()).unwrap();
    settle();
    a.publish("x", 1).unwrap();
    a.publish("x", 2).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(sub_b.is_empty(), "blocked peer delivered anyway");

    b.unblock_peer(a.id()).unwrap();
    assert_eq!(recv(&sub_b).data, Data::from(1));
    assert_eq!(recv(&sub_b).data, Data::from(2));
}

#[test]
fn subscriber_fd_signals_readiness() {
    let a = spawn_leaf();
    let sub = a.subscribe("x").unwrap();
    let _ = sub.ready_fd();
    settle();

    a.publish("x", "ping").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while sub.is_empty() {
        assert!(Instant::now() < deadline, "no delivery");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(sub.len(), 1);
    assert!(sub.try_recv().is_some());
    assert!(sub.try_recv().is_none());
}
