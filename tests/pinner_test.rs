//! Integration tests for the digest pinner
//!
//! The resolver is played by the test itself: it holds the request channel
//! and feeds replies back through the pinner's inbox, so every interleaving
//! the protocol allows can be driven deterministically.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use tagpin::domain::{Digest, ImageRef};
use tagpin::pinner::{LookupError, PinMsg, Pinner, PinnerConfig, PinnerHandle};
use tagpin::resolver::{ResolveReply, ResolveRequest};
use tagpin::store::{DigestStore, JsonlDigestStore, PinnedRow, StoreError};

/// In-memory store with scripted write failures
#[derive(Default)]
struct ScriptedStore {
    rows: Mutex<Vec<PinnedRow>>,
    /// How many of the next `store` calls fail
    fail_next: Mutex<usize>,
    store_calls: Mutex<usize>,
}

impl ScriptedStore {
    fn fail_next_stores(&self, n: usize) {
        *self.fail_next.lock().unwrap() = n;
    }

    fn store_calls(&self) -> usize {
        *self.store_calls.lock().unwrap()
    }
}

#[async_trait]
impl DigestStore for ScriptedStore {
    async fn load(&self, workflow_id: &str) -> Result<Vec<PinnedRow>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn store(&self, workflow_id: &str, tag: &str, digest: &str) -> Result<(), StoreError> {
        *self.store_calls.lock().unwrap() += 1;

        let mut fail_next = self.fail_next.lock().unwrap();
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(StoreError::Unavailable("scripted write failure".to_string()));
        }

        self.rows.lock().unwrap().push(PinnedRow::new(workflow_id, tag, digest));
        Ok(())
    }
}

fn reference(s: &str) -> ImageRef {
    s.parse().unwrap()
}

fn spawn_pinner(
    config: PinnerConfig,
    store: Arc<dyn DigestStore>,
) -> (
    PinnerHandle,
    mpsc::UnboundedSender<PinMsg>,
    mpsc::UnboundedReceiver<ResolveRequest>,
) {
    let (resolver_tx, resolver_rx) = mpsc::unbounded_channel();
    let pinner = Pinner::new(config, "wf-itest", resolver_tx, store);
    let handle = pinner.handle();
    let sender = pinner.sender();
    tokio::spawn(pinner.run());
    (handle, sender, resolver_rx)
}

fn spawn_lookup(handle: &PinnerHandle, r: &str) -> tokio::task::JoinHandle<Result<Digest, LookupError>> {
    let handle = handle.clone();
    let r = reference(r);
    tokio::spawn(async move { handle.lookup(r).await })
}

fn success(request: ResolveRequest, digest: Digest) -> PinMsg {
    PinMsg::Resolver(ResolveReply::Success { request, digest })
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn test_backpressure_resends_after_backoff() {
    let config = PinnerConfig {
        backoff_initial_ms: 100,
        ..Default::default()
    };
    let store = Arc::new(ScriptedStore::default());
    let (handle, sender, mut resolver_rx) = spawn_pinner(config, store);

    let lookup = spawn_lookup(&handle, "ubuntu:latest");

    let request = resolver_rx.recv().await.unwrap();
    let refused_at = Instant::now();
    sender
        .send(PinMsg::Resolver(ResolveReply::BackPressure { request }))
        .unwrap();

    // The original request is re-sent after the backoff delay; the waiter
    // is still parked and the entry untouched.
    let request = tokio::time::timeout(Duration::from_secs(2), resolver_rx.recv())
        .await
        .expect("no re-send after backpressure")
        .unwrap();
    assert_eq!(request.reference, reference("ubuntu:latest"));
    assert!(refused_at.elapsed() >= Duration::from_millis(80));

    sender.send(success(request, Digest::new("sha256", "aaaa"))).unwrap();
    assert_eq!(lookup.await.unwrap().unwrap().canonical(), "sha256:aaaa");

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.backpressure_retries, 1);
    assert_eq!(metrics.resolver_requests_sent, 2);
}

#[tokio::test]
async fn test_backpressure_delay_grows_geometrically() {
    let config = PinnerConfig {
        backoff_initial_ms: 50,
        backoff_multiplier: 2.0,
        ..Default::default()
    };
    let store = Arc::new(ScriptedStore::default());
    let (handle, sender, mut resolver_rx) = spawn_pinner(config, store);

    let lookup = spawn_lookup(&handle, "ubuntu:latest");

    // Refuse twice; the second gap should be roughly twice the first.
    let request = resolver_rx.recv().await.unwrap();
    sender
        .send(PinMsg::Resolver(ResolveReply::BackPressure { request }))
        .unwrap();
    let request = resolver_rx.recv().await.unwrap();
    let second_refused_at = Instant::now();
    sender
        .send(PinMsg::Resolver(ResolveReply::BackPressure { request }))
        .unwrap();

    let request = tokio::time::timeout(Duration::from_secs(2), resolver_rx.recv())
        .await
        .expect("no second re-send")
        .unwrap();
    assert!(second_refused_at.elapsed() >= Duration::from_millis(80));

    sender.send(success(request, Digest::new("sha256", "aaaa"))).unwrap();
    lookup.await.unwrap().unwrap();
}

// =============================================================================
// Self-imposed timeout
// =============================================================================

#[tokio::test]
async fn test_timeout_fails_one_reference_only() {
    let config = PinnerConfig {
        resolver_timeout_ms: 600,
        ..Default::default()
    };
    let store = Arc::new(ScriptedStore::default());
    let (handle, sender, mut resolver_rx) = spawn_pinner(config, store);

    let latest = spawn_lookup(&handle, "ubuntu:latest");
    let _latest_request = resolver_rx.recv().await.unwrap();

    // Stagger the second lookup so its own deadline is still far off when
    // the first one expires.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let older = spawn_lookup(&handle, "ubuntu:older");
    let older_request = resolver_rx.recv().await.unwrap();

    // Never answer `latest`; its self-imposed deadline fires.
    let err = latest.await.unwrap().unwrap_err();
    assert!(matches!(err, LookupError::Timeout));
    assert!(err.is_retryable());

    // `older` is unaffected and still resolves.
    sender.send(success(older_request, Digest::new("md5", "BBBB"))).unwrap();
    assert_eq!(older.await.unwrap().unwrap().canonical(), "md5:BBBB");

    // The pinner is still running: retrying `latest` reaches the resolver.
    let retry = spawn_lookup(&handle, "ubuntu:latest");
    let request = resolver_rx.recv().await.unwrap();
    assert_eq!(request.reference, reference("ubuntu:latest"));
    sender.send(success(request, Digest::new("md5", "AAAA"))).unwrap();
    assert_eq!(retry.await.unwrap().unwrap().canonical(), "md5:AAAA");

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.resolver_timeouts, 1);
    assert_eq!(metrics.resolved_entries, 2);
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_absorbed() {
    let config = PinnerConfig {
        resolver_timeout_ms: 150,
        ..Default::default()
    };
    let store = Arc::new(ScriptedStore::default());
    let (handle, sender, mut resolver_rx) = spawn_pinner(config, store.clone());

    let lookup = spawn_lookup(&handle, "ubuntu:latest");
    let first_request = resolver_rx.recv().await.unwrap();

    let err = lookup.await.unwrap().unwrap_err();
    assert!(matches!(err, LookupError::Timeout));

    // Client retries; a second resolver request goes out.
    let retry = spawn_lookup(&handle, "ubuntu:latest");
    let second_request = resolver_rx.recv().await.unwrap();

    // The slow resolver now answers BOTH attempts.
    sender
        .send(success(first_request, Digest::new("md5", "AAAA")))
        .unwrap();
    sender
        .send(success(second_request, Digest::new("md5", "AAAA")))
        .unwrap();

    // Exactly one more outcome reaches the client, and the duplicate reply
    // did not double-write the store.
    assert_eq!(retry.await.unwrap().unwrap().canonical(), "md5:AAAA");
    assert_eq!(store.store_calls(), 1);

    // The pinner stayed out of the terminal state.
    let fresh = spawn_lookup(&handle, "alpine:3.20");
    let request = resolver_rx.recv().await.unwrap();
    sender.send(success(request, Digest::new("sha256", "cccc"))).unwrap();
    fresh.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_late_reply_with_no_retry_warms_the_cache() {
    let config = PinnerConfig {
        resolver_timeout_ms: 150,
        ..Default::default()
    };
    let store = Arc::new(ScriptedStore::default());
    let (handle, sender, mut resolver_rx) = spawn_pinner(config, store.clone());

    let lookup = spawn_lookup(&handle, "ubuntu:latest");
    let request = resolver_rx.recv().await.unwrap();

    let err = lookup.await.unwrap().unwrap_err();
    assert!(matches!(err, LookupError::Timeout));

    // The reply lands after the timeout with nobody waiting; it is
    // persisted anyway so the next lookup is a cache hit.
    sender.send(success(request, Digest::new("md5", "AAAA"))).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let digest = handle.lookup(reference("ubuntu:latest")).await.unwrap();
    assert_eq!(digest.canonical(), "md5:AAAA");

    assert_eq!(store.store_calls(), 1);
    assert!(resolver_rx.try_recv().is_err());
}

// =============================================================================
// Write failures
// =============================================================================

#[tokio::test]
async fn test_write_failure_surfaces_then_retry_succeeds() {
    let store = Arc::new(ScriptedStore::default());
    store.fail_next_stores(1);
    let (handle, sender, mut resolver_rx) = spawn_pinner(PinnerConfig::default(), store.clone());

    let lookup = spawn_lookup(&handle, "ubuntu:latest");
    let request = resolver_rx.recv().await.unwrap();
    sender.send(success(request, Digest::new("md5", "AAAA"))).unwrap();

    let err = lookup.await.unwrap().unwrap_err();
    assert!(matches!(err, LookupError::Store(_)));
    assert!(err.is_retryable());

    // Retry re-invokes the resolver and re-attempts the write.
    let retry = spawn_lookup(&handle, "ubuntu:latest");
    let request = resolver_rx.recv().await.unwrap();
    sender.send(success(request, Digest::new("md5", "AAAA"))).unwrap();

    assert_eq!(retry.await.unwrap().unwrap().canonical(), "md5:AAAA");
    assert_eq!(store.store_calls(), 2);

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.store_failures, 1);
    assert_eq!(metrics.store_writes, 1);
}

// =============================================================================
// Restart / durability
// =============================================================================

#[tokio::test]
async fn test_round_trip_through_real_store() {
    let temp = tempfile::tempdir().unwrap();

    // First run: resolve and pin one reference.
    {
        let store = Arc::new(JsonlDigestStore::new(temp.path()));
        let (handle, sender, mut resolver_rx) = spawn_pinner(PinnerConfig::default(), store);

        let lookup = spawn_lookup(&handle, "ubuntu:latest");
        let request = resolver_rx.recv().await.unwrap();
        sender.send(success(request, Digest::new("sha256", "deadbeef"))).unwrap();
        lookup.await.unwrap().unwrap();

        handle.shutdown();
    }

    // Second run: the digest comes back from disk, not the resolver.
    {
        let store = Arc::new(JsonlDigestStore::new(temp.path()));
        let config = PinnerConfig {
            is_restart: true,
            ..Default::default()
        };
        let (handle, _sender, mut resolver_rx) = spawn_pinner(config, store);

        let digest = handle.lookup(reference("ubuntu:latest")).await.unwrap();
        assert_eq!(digest.canonical(), "sha256:deadbeef");
        assert!(resolver_rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_load_failure_is_terminal_for_pending_and_future() {
    struct BrokenStore;

    #[async_trait]
    impl DigestStore for BrokenStore {
        async fn load(&self, _workflow_id: &str) -> Result<Vec<PinnedRow>, StoreError> {
            Err(StoreError::Unavailable("backend down".to_string()))
        }

        async fn store(&self, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    let config = PinnerConfig {
        is_restart: true,
        ..Default::default()
    };
    let (handle, _sender, mut resolver_rx) = spawn_pinner(config, Arc::new(BrokenStore));

    let err = handle.lookup(reference("ubuntu:latest")).await.unwrap_err();
    assert!(err.is_terminal());

    // Sticky: later requests fail the same way, with no resolver traffic.
    let err = handle.lookup(reference("ubuntu:older")).await.unwrap_err();
    assert!(err.is_terminal());
    assert!(resolver_rx.try_recv().is_err());

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.resolver_requests_sent, 0);
}

// =============================================================================
// Deduplication under load
// =============================================================================

#[tokio::test]
async fn test_many_concurrent_lookups_one_resolution() {
    let store = Arc::new(ScriptedStore::default());
    let (handle, sender, mut resolver_rx) = spawn_pinner(PinnerConfig::default(), store.clone());

    let lookups: Vec<_> = (0..8).map(|_| spawn_lookup(&handle, "ubuntu:latest")).collect();

    let request = resolver_rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(resolver_rx.try_recv().is_err());

    sender.send(success(request, Digest::new("sha256", "aaaa"))).unwrap();

    // Every waiter receives exactly one outcome, all identical.
    for lookup in lookups {
        assert_eq!(lookup.await.unwrap().unwrap().canonical(), "sha256:aaaa");
    }
    assert_eq!(store.store_calls(), 1);

    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.resolver_requests_sent, 1);
    assert_eq!(metrics.in_flight_references, 0);
    assert_eq!(metrics.resolved_entries, 1);
}
