//! Event Bridge Integration Tests
//!
//! Tests for the async channel bridge between the read-loop thread and Tokio.
//!
//! # Test Scenarios
//! - Ordered delivery from a blocking producer thread
//! - Multiple producers (read loop and detach path)
//! - Backpressure on a bounded channel
//!
//! Run with: `cargo test -p common --test event_bridge_tests`

use bytes::Bytes;
use common::{LifecycleEvent, create_event_bridge};
use std::thread;
use std::time::Duration;

// ============================================================================
// Ordering Tests
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_send_order() {
    let (sender, receiver) = create_event_bridge(16);

    let handle = thread::spawn(move || {
        sender
            .send_event(LifecycleEvent::ConnectionEstablished)
            .unwrap();
        for i in 0..3u8 {
            sender
                .send_event(LifecycleEvent::DataReceived {
                    data: Bytes::from(vec![i; 4]),
                })
                .unwrap();
        }
        sender.send_event(LifecycleEvent::ConnectionClosed).unwrap();
    });

    let mut events = Vec::new();
    for _ in 0..5 {
        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv_event())
            .await
            .expect("Timed out waiting for event")
            .expect("Channel closed");
        events.push(event);
    }
    handle.join().expect("Producer thread panicked");

    assert_eq!(events[0], LifecycleEvent::ConnectionEstablished);
    for (i, event) in events[1..4].iter().enumerate() {
        assert_eq!(
            *event,
            LifecycleEvent::DataReceived {
                data: Bytes::from(vec![i as u8; 4])
            }
        );
    }
    assert_eq!(events[4], LifecycleEvent::ConnectionClosed);
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test]
async fn test_read_loop_and_detach_senders_share_channel() {
    let (sender, receiver) = create_event_bridge(16);
    let detach_sender = sender.clone();

    let reader = thread::spawn(move || {
        sender.send_event(LifecycleEvent::ConnectionClosed).unwrap();
    });
    let detach = thread::spawn(move || {
        detach_sender
            .send_event(LifecycleEvent::DeviceDisconnected)
            .unwrap();
    });

    reader.join().unwrap();
    detach.join().unwrap();

    let mut got = vec![
        receiver.recv_event().await.unwrap(),
        receiver.recv_event().await.unwrap(),
    ];
    got.sort_by_key(|e| format!("{:?}", e));
    assert_eq!(
        got,
        vec![
            LifecycleEvent::ConnectionClosed,
            LifecycleEvent::DeviceDisconnected
        ]
    );
}

#[tokio::test]
async fn test_bounded_channel_applies_backpressure() {
    let (sender, receiver) = create_event_bridge(1);

    let handle = thread::spawn(move || {
        sender
            .send_event(LifecycleEvent::ConnectionEstablished)
            .unwrap();
        // Blocks until the first event is drained
        sender.send_event(LifecycleEvent::ConnectionClosed).unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(receiver.pending(), 1);

    assert_eq!(
        receiver.recv_event().await.unwrap(),
        LifecycleEvent::ConnectionEstablished
    );
    assert_eq!(
        receiver.recv_event().await.unwrap(),
        LifecycleEvent::ConnectionClosed
    );
    handle.join().unwrap();
}

#[tokio::test]
async fn test_receiver_errors_after_all_senders_dropped() {
    let (sender, receiver) = create_event_bridge(4);
    drop(sender);

    assert!(receiver.recv_event().await.is_err());
}
