//! Feed gossip between in-memory nodes
//!
//! Nodes run the real mux over in-process pipes. Where a test needs to see
//! exactly what a manager puts on the wire, one side is a [`RawPeer`].

mod common;

use std::time::Duration;

use channelmesh_core::sync::FEED_PROTOCOL;
use channelmesh_core::{EntrySource, FeedEvent, MemoryNetwork};
use common::{feed_for, key, wait_until, RawPeer};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_submission_is_forwarded_to_everyone_but_the_sender() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let b = network.node("b");
    let c = network.node("c");

    let (a_feed, _) = feed_for(&a);
    let (c_feed, _) = feed_for(&c);
    a_feed.start().await;
    c_feed.start().await;

    let b_conn = network.connect(&b, &a);
    let mut raw = RawPeer::open(&b_conn, FEED_PROTOCOL);

    let greeting = raw.next_message(WAIT).await.expect("HAVE_FEED on open");
    assert_eq!(greeting["type"], "HAVE_FEED");
    assert!(wait_until(WAIT, || a_feed.get_stats().open_channels == 2).await);

    let k = key('7');
    raw.channel
        .send(&json!({"type": "SUBMIT_CHANNEL", "key": k}))
        .unwrap();

    assert!(wait_until(WAIT, || c_feed.get_feed().len() == 1).await);
    let on_a = a_feed.get_feed();
    assert_eq!(on_a.len(), 1);
    assert_eq!(on_a[0].drive_key.to_hex(), k);
    assert_eq!(on_a[0].source, EntrySource::Peer);
    assert_eq!(c_feed.get_feed()[0].source, EntrySource::Peer);

    let echoed = raw.drain(Duration::from_millis(300)).await;
    assert!(
        echoed.iter().all(|m| m["type"] != "SUBMIT_CHANNEL"),
        "submission echoed back to its sender: {:?}",
        echoed
    );
}

#[tokio::test]
async fn test_known_submission_is_not_forwarded_again() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let (a_feed, _) = feed_for(&a);
    a_feed.start().await;
    a_feed.add_entry(&key('1'), EntrySource::Peer, None);

    let b_conn = network.connect(&network.node("b"), &a);
    let c_conn = network.connect(&network.node("c"), &a);
    let from_b = RawPeer::open(&b_conn, FEED_PROTOCOL);
    let mut to_c = RawPeer::open(&c_conn, FEED_PROTOCOL);
    assert!(wait_until(WAIT, || a_feed.get_stats().open_channels == 2).await);
    to_c.drain(Duration::from_millis(100)).await;

    from_b
        .channel
        .send(&json!({"type": "SUBMIT_CHANNEL", "key": key('1')}))
        .unwrap();
    assert!(to_c.drain(Duration::from_millis(300)).await.is_empty());
}

#[tokio::test]
async fn test_feed_is_exchanged_when_a_channel_opens() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let c = network.node("c");
    let (a_feed, _) = feed_for(&a);
    let (c_feed, _) = feed_for(&c);

    a_feed.start().await;
    a_feed.submit_channel(&key('a'), Some(&key('b'))).unwrap();
    a_feed.add_entry(&key('c'), EntrySource::Peer, None);

    let mut updates = c_feed.subscribe();
    c_feed.start().await;

    assert!(wait_until(WAIT, || c_feed.get_feed().len() == 2).await);
    let own = c_feed
        .get_feed()
        .into_iter()
        .find(|e| e.drive_key.to_hex() == key('a'))
        .unwrap();
    assert_eq!(own.source, EntrySource::Peer);
    assert_eq!(own.public_bee_key.map(|k| k.to_hex()), Some(key('b')));
    assert!(!c_feed.is_channel_published(&key('a')));

    let mut saw_update = false;
    while let Ok(event) = updates.try_recv() {
        saw_update |= event == FeedEvent::Updated;
    }
    assert!(saw_update);
}

#[tokio::test]
async fn test_connections_made_before_start_are_used() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let b = network.node("b");
    network.connect(&a, &b);

    let (a_feed, _) = feed_for(&a);
    let (b_feed, _) = feed_for(&b);
    a_feed.submit_channel(&key('d'), None).unwrap();

    a_feed.start().await;
    b_feed.start().await;

    assert!(wait_until(WAIT, || b_feed.get_feed().len() == 1).await);
    // Rendezvous must not add a second connection between the same pair
    assert_eq!(a.registry().len(), 1);
    assert_eq!(a_feed.get_stats().open_channels, 1);
}

#[tokio::test]
async fn test_need_feed_is_answered_and_can_be_requested() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let (a_feed, _) = feed_for(&a);
    a_feed.start().await;
    a_feed.add_entry(&key('e'), EntrySource::Peer, Some(&key('f')));

    let conn = network.connect(&network.node("b"), &a);
    let mut raw = RawPeer::open(&conn, FEED_PROTOCOL);
    raw.next_message(WAIT).await.expect("HAVE_FEED on open");

    raw.channel.send(&json!({"type": "NEED_FEED"})).unwrap();
    let response = raw.next_message(WAIT).await.expect("FEED_RESPONSE");
    assert_eq!(response["type"], "FEED_RESPONSE");
    assert_eq!(response["entries"][0]["driveKey"], key('e'));
    assert_eq!(response["entries"][0]["publicBeeKey"], key('f'));

    assert_eq!(a_feed.request_feeds_from_peers(), 1);
    let request = raw.next_message(WAIT).await.expect("NEED_FEED");
    assert_eq!(request["type"], "NEED_FEED");
}

#[tokio::test]
async fn test_hidden_key_survives_gossip_and_is_not_retracted() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let c = network.node("c");
    let (a_feed, _) = feed_for(&a);
    let (c_feed, _) = feed_for(&c);

    c_feed.hide_channel(&key('9')).unwrap();
    a_feed.start().await;
    c_feed.start().await;
    assert!(wait_until(WAIT, || a_feed.get_stats().open_channels == 1).await);

    a_feed.submit_channel(&key('9'), None).unwrap();
    a_feed.submit_channel(&key('8'), None).unwrap();
    assert!(wait_until(WAIT, || c_feed.get_feed().len() == 1).await);
    assert_eq!(c_feed.get_feed()[0].drive_key.to_hex(), key('8'));

    c_feed.hide_channel(&key('8')).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a_feed.get_feed().len(), 2);
}

#[tokio::test]
async fn test_closed_connection_drops_its_channel() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let (a_feed, _) = feed_for(&a);
    a_feed.start().await;

    let conn = network.connect(&network.node("b"), &a);
    let _raw = RawPeer::open(&conn, FEED_PROTOCOL);
    assert!(wait_until(WAIT, || a_feed.get_stats().open_channels == 1).await);

    conn.close();
    assert!(wait_until(WAIT, || a_feed.get_stats().open_channels == 0).await);

    assert_eq!(a_feed.submit_channel(&key('a'), None).unwrap(), 0);
    assert_eq!(a_feed.get_stats().send_failures, 0);
}

#[tokio::test]
async fn test_feed_larger_than_one_frame_is_sent_in_pieces() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let (a_feed, _) = feed_for(&a);
    a_feed.start().await;

    let count = 10_000;
    for i in 0..count {
        let drive = format!("{:064x}", i);
        let bee = format!("{:064x}", i + 1_000_000);
        a_feed.add_entry(&drive, EntrySource::Peer, Some(&bee));
    }

    let conn = network.connect(&network.node("b"), &a);
    let mut raw = RawPeer::open(&conn, FEED_PROTOCOL);

    let have_feed = raw.drain(Duration::from_millis(500)).await;
    assert!(have_feed.len() > 1, "expected several HAVE_FEED frames");
    assert!(have_feed.iter().all(|m| m["type"] == "HAVE_FEED"));
    let listed: usize = have_feed
        .iter()
        .map(|m| m["entries"].as_array().map_or(0, Vec::len))
        .sum();
    assert_eq!(listed, count);

    raw.channel.send(&json!({"type": "NEED_FEED"})).unwrap();
    let responses = raw.drain(Duration::from_millis(500)).await;
    assert!(responses.len() > 1);
    assert!(responses.iter().all(|m| m["type"] == "FEED_RESPONSE"));

    assert!(!conn.is_closed());
    assert_eq!(a_feed.get_stats().open_channels, 1);
    assert_eq!(a_feed.get_stats().send_failures, 0);
}

#[tokio::test]
async fn test_large_feed_reaches_a_managed_peer() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let c = network.node("c");
    let (a_feed, _) = feed_for(&a);
    let (c_feed, _) = feed_for(&c);
    a_feed.start().await;

    let count = 8_000;
    for i in 0..count {
        let drive = format!("{:064x}", i);
        a_feed.add_entry(&drive, EntrySource::Peer, None);
    }

    c_feed.start().await;
    assert!(wait_until(Duration::from_secs(10), || c_feed.get_feed().len() == count).await);
    assert_eq!(a_feed.get_stats().open_channels, 1);

    c_feed.submit_channel(&key('f'), None).unwrap();
    assert!(wait_until(WAIT, || a_feed.get_feed().len() == count + 1).await);
}
