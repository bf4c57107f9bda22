//! Integration tests for common Tandem workflows.
//!
//! These tests exercise the public API the way an application would.

use std::convert::Infallible;
use std::time::Duration;
use tandem::prelude::*;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Key-value
// =============================================================================

#[tokio::test]
async fn test_set_then_get() {
    init_tracing();
    let tandem = Tandem::memory(&MemoryBackend::new());

    tandem.set("config", &serde_json::json!({ "retries": 3 })).await.unwrap();
    assert!(tandem.has("config").await.unwrap());
    assert_eq!(
        tandem.get::<serde_json::Value>("config").await.unwrap(),
        Some(serde_json::json!({ "retries": 3 }))
    );

    tandem.remove("config").await.unwrap();
    assert!(!tandem.has("config").await.unwrap());
    assert_eq!(tandem.get::<serde_json::Value>("config").await.unwrap(), None);
}

// =============================================================================
// Locks
// =============================================================================

#[tokio::test]
async fn test_read_modify_write() {
    init_tracing();
    let tandem = Tandem::memory(&MemoryBackend::new());
    tandem.set("x", &1).await.unwrap();

    let next = tandem
        .with_lock("x", |v: Option<i64>| async move { Ok::<_, Infallible>(v.unwrap_or(0) + 1) })
        .await
        .unwrap();

    assert_eq!(next, 2);
    assert_eq!(tandem.get::<i64>("x").await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_explicit_lock_scope() {
    init_tracing();
    let tandem = Tandem::memory(&MemoryBackend::new());

    let lock = tandem.lock("report").await.unwrap();
    assert_eq!(lock.key, "report");
    assert_eq!(lock.resource, "lock:report");
    assert!(lock.expires_at > lock.acquired_at);
    assert!(tandem.is_locked("report"));

    tandem.release("report").await;
    tandem.release("report").await;
    assert!(!tandem.is_locked("report"));
}

#[tokio::test]
async fn test_transform_error_surfaces() {
    init_tracing();
    let tandem = Tandem::memory(&MemoryBackend::new());

    let err = tandem
        .with_lock("x", |_: Option<i64>| async move {
            Err::<i64, _>(std::io::Error::other("upstream unavailable"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TandemError::Transform { ref key, .. } if key == "x"));
    assert!(err.to_string().contains("upstream unavailable"));
    assert!(!tandem.has("x").await.unwrap());
}

// =============================================================================
// Queues
// =============================================================================

#[tokio::test]
async fn test_queue_order() {
    init_tracing();
    let tandem = Tandem::memory(&MemoryBackend::new());

    tandem.push("t", &serde_json::json!({ "a": 1 })).await.unwrap();
    tandem.push("t", &serde_json::json!({ "b": 2 })).await.unwrap();

    assert_eq!(
        tandem.pop::<serde_json::Value>("t").await.unwrap(),
        Some(serde_json::json!({ "a": 1 }))
    );
    assert_eq!(
        tandem.pop::<serde_json::Value>("t").await.unwrap(),
        Some(serde_json::json!({ "b": 2 }))
    );
    assert_eq!(tandem.pop::<serde_json::Value>("t").await.unwrap(), None);
}

// =============================================================================
// Pub/Sub
// =============================================================================

#[tokio::test]
async fn test_stream_subscription() {
    use futures::StreamExt;

    init_tracing();
    let backend = MemoryBackend::new();
    let listener = Tandem::memory(&backend);
    let publisher = Tandem::memory(&backend);

    let mut stream = listener.stream::<String>("alerts").await.unwrap();
    publisher.broadcast("alerts", "disk full").await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.channel, "alerts");
    assert_eq!(delivery.data, "disk full");

    listener.unsubscribe("alerts").await.unwrap();
    assert!(!listener.is_subscribed("alerts").await);
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_builder() {
    let config = TandemConfig::builder()
        .url("redis://cache:6379")
        .lock_ttl(Duration::from_secs(1))
        .retry_count(3)
        .build();

    assert!(config.validate().is_ok());
    assert_eq!(config.store.url, "redis://cache:6379");
    assert_eq!(config.lease.retry_count, 3);
}

#[tokio::test]
async fn test_unreachable_store_is_connection_error() {
    let backend = MemoryBackend::new();
    backend.set_offline(true);
    let tandem = Tandem::memory(&backend);

    let err = tandem.get::<String>("anything").await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(tandem.state(), ConnectionState::Disconnected);
}
