//! Accept behaviour against the scripted transport
//!
//! Deadlines, ordering and error propagation

use crate::integration::{mock_listener, MockTransport};
use heartbeat_listener::{CancelSignal, Family, HeartbeatListener, ListenerError};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const HEARTBEAT: Duration = Duration::from_millis(50);

// ============================================================================
// Construction
// ============================================================================

#[tokio::test]
async fn test_bind_reports_resolve_failure() {
    let (transport, _feed) = MockTransport::new();
    let transport = transport.failing_resolve();

    let res = HeartbeatListener::bind(&transport, Family::Dual, "nowhere:1", (), HEARTBEAT).await;
    match res {
        Err(ListenerError::Resolve { address, .. }) => assert_eq!(address, "nowhere:1"),
        Err(e) => panic!("Expected resolve error, got {}", e),
        Ok(_) => panic!("Expected resolve error"),
    }
}

#[tokio::test]
async fn test_bind_reports_listen_failure() {
    let (transport, _feed) = MockTransport::new();
    let transport = transport.failing_listen();

    let res =
        HeartbeatListener::bind(&transport, Family::Ipv4, "127.0.0.1:7000", (), HEARTBEAT).await;
    match res {
        Err(ListenerError::Listen { addr, source }) => {
            assert_eq!(addr.port(), 7000);
            assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
        }
        Err(e) => panic!("Expected listen error, got {}", e),
        Ok(_) => panic!("Expected listen error"),
    }
}

#[tokio::test]
async fn test_addr_is_passthrough() {
    let (listener, _feed) = mock_listener(HEARTBEAT).await;
    assert_eq!(listener.addr(), "127.0.0.1:7000".parse().unwrap());
    assert_eq!(listener.heartbeat(), HEARTBEAT);
    listener.close().await.unwrap();
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test]
async fn test_unset_deadline_blocks_until_connection() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;
    let listener = Arc::new(listener);
    listener.set_deadline(None).unwrap();

    let l = Arc::clone(&listener);
    let pending = tokio::spawn(async move { l.accept().await });

    // several heartbeats pass without a timeout
    tokio::time::sleep(HEARTBEAT * 4).await;
    assert!(!pending.is_finished());

    feed.connect(3);
    let conn = pending.await.unwrap().expect("Expected a connection");
    assert_eq!(conn.id, 3);
    assert_eq!(listener.metrics().timeouts, 0);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_deadline_now_times_out_without_waiting() {
    let (listener, _feed) = mock_listener(HEARTBEAT).await;

    listener.set_deadline(Some(Instant::now())).unwrap();
    let start = std::time::Instant::now();
    let err = listener.accept().await.unwrap_err();

    assert!(err.is_timeout());
    assert!(err.is_temporary());
    assert!(start.elapsed() < Duration::from_millis(40));

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_past_deadline_times_out() {
    let (listener, _feed) = mock_listener(HEARTBEAT).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let past = Instant::now() - Duration::from_millis(1);
    let err = listener.accept_until(Some(past)).await.unwrap_err();
    assert!(err.is_timeout());

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_timeout_does_not_lose_later_connection() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;

    let deadline = Instant::now() + Duration::from_millis(20);
    assert!(listener.accept_until(Some(deadline)).await.unwrap_err().is_timeout());

    feed.connect(1);
    let conn = listener.accept_until(None).await.unwrap();
    assert_eq!(conn.id, 1);

    let metrics = listener.metrics();
    assert_eq!(metrics.accepted, 1);
    assert_eq!(metrics.delivered, 1);
    assert_eq!(metrics.timeouts, 1);

    listener.close().await.unwrap();
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_results_delivered_in_transport_order() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;

    for id in 1..=3 {
        feed.connect(id);
    }

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(listener.accept_until(None).await.unwrap().id);
    }
    assert_eq!(ids, vec![1, 2, 3]);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_callers_each_get_one_connection() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;
    let listener = Arc::new(listener);

    let mut callers = Vec::new();
    for _ in 0..8 {
        let l = Arc::clone(&listener);
        callers.push(tokio::spawn(async move {
            l.accept_with_cancel(&CancelSignal::never()).await
        }));
    }

    for id in 0..8 {
        feed.connect(id);
    }

    let results = futures::future::join_all(callers).await;
    let ids: HashSet<u32> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap().expect("Expected a connection").id)
        .collect();

    assert_eq!(ids, (0..8).collect::<HashSet<u32>>());
    assert_eq!(listener.metrics().delivered, 8);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_pump_holds_single_result_without_callers() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;

    feed.connect(1);
    feed.connect(2);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the pump accepted one and waits for a taker before accepting again
    assert_eq!(feed.accept_calls(), 1);
    assert_eq!(listener.metrics().in_flight(), 1);

    assert_eq!(listener.accept_until(None).await.unwrap().id, 1);
    assert_eq!(listener.accept_until(None).await.unwrap().id, 2);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_accept_returns_connection_to_pump() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;

    feed.connect(1);
    let mut abandoned_wait = Box::pin(listener.accept_until(None));
    assert!(futures::poll!(&mut abandoned_wait).is_pending());

    // the pump hands the connection over, then the caller gives up
    tokio::time::sleep(Duration::from_millis(30)).await;
    drop(abandoned_wait);
    assert_eq!(feed.dropped_connections(), 0);

    feed.connect(2);
    let first = listener.accept_until(None).await.unwrap();
    let second = listener.accept_until(None).await.unwrap();
    assert_eq!((first.id, second.id), (1, 2));

    let metrics = listener.metrics();
    assert_eq!(metrics.returned, 1);
    assert_eq!(metrics.delivered, 3);
    assert_eq!(metrics.in_flight(), 0);

    listener.close().await.unwrap();
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_fatal_accept_error_terminates_pump() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;

    feed.fail(io::ErrorKind::PermissionDenied);
    match listener.accept_until(None).await {
        Err(ListenerError::Accept { source, temporary }) => {
            assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            assert!(!temporary);
        }
        other => panic!("Expected accept error, got {:?}", other.map(|c| c.id)),
    }

    // later accepts see the same cause instead of a timeout
    feed.connect(9);
    let deadline = Instant::now() + Duration::from_millis(200);
    match listener.accept_until(Some(deadline)).await {
        Err(ListenerError::Terminated(cause)) => {
            assert_eq!(cause.kind(), io::ErrorKind::PermissionDenied)
        }
        other => panic!("Expected terminated error, got {:?}", other.map(|c| c.id)),
    }

    assert_eq!(feed.accept_calls(), 1);
    assert_eq!(listener.metrics().accept_errors, 1);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_accept_with_cancel_wraps_fatal_error() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;

    feed.fail(io::ErrorKind::PermissionDenied);
    let err = listener
        .accept_with_cancel(&CancelSignal::never())
        .await
        .unwrap_err();
    assert!(matches!(err, ListenerError::Accept { temporary: false, .. }));

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_temporary_error_retried_then_terminated() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;

    feed.fail(io::ErrorKind::TimedOut);
    let err = listener
        .accept_with_cancel(&CancelSignal::never())
        .await
        .unwrap_err();

    // the retry finds the pump gone and reports the original cause
    match err {
        ListenerError::Terminated(cause) => assert_eq!(cause.kind(), io::ErrorKind::TimedOut),
        other => panic!("Expected terminated error, got {}", other),
    }

    listener.close().await.unwrap();
}
