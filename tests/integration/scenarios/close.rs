//! Listener teardown
//!
//! Close must unblock pending callers, stop the pump and hand abandoned
//! connections back to `Drop`.

use crate::integration::{mock_listener, MockTransport};
use heartbeat_listener::{CancelSignal, Family, HeartbeatListener, ListenerError};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HEARTBEAT: Duration = Duration::from_millis(50);

#[tokio::test]
async fn test_close_unblocks_pending_accept() {
    let (listener, _feed) = mock_listener(HEARTBEAT).await;
    let listener = Arc::new(listener);

    let l = Arc::clone(&listener);
    let pending = tokio::spawn(async move { l.accept_until(None).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    tokio::time::timeout(Duration::from_secs(2), listener.close())
        .await
        .expect("close should not hang")
        .unwrap();

    let res = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending accept should return")
        .unwrap();

    // either the transport's close error was handed over or the pump was gone
    match res {
        Err(ListenerError::Closed) | Err(ListenerError::Accept { .. }) => {}
        Err(e) => panic!("Unexpected error: {}", e),
        Ok(conn) => panic!("Unexpected connection {}", conn.id),
    }
}

#[tokio::test]
async fn test_close_unblocks_accept_with_cancel() {
    let (listener, _feed) = mock_listener(HEARTBEAT).await;
    let listener = Arc::new(listener);

    let l = Arc::clone(&listener);
    let pending =
        tokio::spawn(async move { l.accept_with_cancel(&CancelSignal::never()).await });
    tokio::time::sleep(HEARTBEAT * 2).await;

    listener.close().await.unwrap();

    let res = tokio::time::timeout(HEARTBEAT * 4, pending)
        .await
        .expect("accept_with_cancel should return after close")
        .unwrap();
    assert!(res.is_err());
}

#[tokio::test]
async fn test_concurrent_close_waits_for_first() {
    let (transport, feed) = MockTransport::new();
    let transport = transport.slow_close(Duration::from_millis(200));
    let listener =
        HeartbeatListener::bind(&transport, Family::Ipv4, "127.0.0.1:7000", (), HEARTBEAT)
            .await
            .unwrap();

    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        listener.close().await.unwrap();
        start.elapsed()
    };
    let (first, waited) = tokio::join!(listener.close(), second);
    first.unwrap();

    // the second call returned only after the first one finished
    assert!(
        waited >= Duration::from_millis(150),
        "second close returned after {:?}",
        waited
    );
    assert_eq!(feed.close_calls().len(), 1);
    assert!(matches!(
        listener.accept_until(None).await,
        Err(ListenerError::Closed)
    ));
}

#[tokio::test]
async fn test_accept_after_close_reports_closed() {
    let (listener, _feed) = mock_listener(HEARTBEAT).await;
    listener.close().await.unwrap();

    assert!(listener.is_closed());
    assert!(matches!(
        listener.accept_until(None).await,
        Err(ListenerError::Closed)
    ));
    assert!(matches!(
        listener.accept_with_cancel(&CancelSignal::never()).await,
        Err(ListenerError::Closed)
    ));
}

#[tokio::test]
async fn test_close_passes_grace_period() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;
    let listener = listener.with_close_grace(Duration::from_millis(250));

    listener.close().await.unwrap();
    listener.close().await.unwrap();

    // the transport is closed exactly once
    assert_eq!(feed.close_calls(), vec![Duration::from_millis(250)]);
}

#[tokio::test]
async fn test_default_grace_period() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;
    listener.close().await.unwrap();
    assert_eq!(
        feed.close_calls(),
        vec![heartbeat_listener::DEFAULT_CLOSE_GRACE]
    );
}

#[tokio::test]
async fn test_abandoned_connection_is_dropped() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;

    feed.connect(1);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(listener.metrics().accepted, 1);

    listener.close().await.unwrap();

    let metrics = listener.metrics();
    assert_eq!(metrics.abandoned, 1);
    assert_eq!(metrics.delivered, 0);
    assert_eq!(feed.dropped_connections(), 1);
}

#[tokio::test]
async fn test_close_error_returned_after_pump_stops() {
    let (transport, feed) = MockTransport::new();
    let transport = transport.failing_close();
    let listener =
        HeartbeatListener::bind(&transport, Family::Ipv4, "127.0.0.1:7000", (), HEARTBEAT)
            .await
            .unwrap();

    let err = listener.close().await.unwrap_err();
    assert!(matches!(err, ListenerError::Close(_)));

    // the pump is gone even though close reported an error
    assert!(matches!(
        listener.accept_until(None).await,
        Err(ListenerError::Closed)
    ));
    assert_eq!(feed.close_calls().len(), 1);
}

#[tokio::test]
async fn test_drop_without_close_closes_transport() {
    let (listener, feed) = mock_listener(HEARTBEAT).await;
    drop(listener);

    // no grace period on drop
    assert_eq!(feed.close_calls(), vec![Duration::ZERO]);
}
