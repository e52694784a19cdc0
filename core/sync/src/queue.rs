//! Durable FIFO queue of mutations issued while offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tether_common::{ApiRequest, Error, HttpMethod, Result};
use tether_storage::KeyValueStore;

use crate::clock::{Clock, SystemClock};
use crate::executor::RequestExecutor;

/// Storage key holding the serialized queue.
pub const QUEUE_KEY: &str = "tether/mutation-queue";

/// A mutating request waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Time-based id, strictly increasing in enqueue order.
    pub id: u64,
    /// When the mutation was queued.
    pub enqueued_at: DateTime<Utc>,
    pub url: String,
    /// Never GET.
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl QueuedMutation {
    /// The request to replay.
    pub fn to_request(&self) -> ApiRequest {
        ApiRequest {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Entries replayed with a 2xx answer and removed from the queue.
    pub succeeded: usize,
    /// Entries that failed and stay queued, in enqueue order.
    pub failed: Vec<QueuedMutation>,
}

impl DrainReport {
    /// Whether every replayed entry succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct QueueState {
    entries: Vec<QueuedMutation>,
    /// Highest id ever handed out, so ids keep increasing after a drain
    /// empties the queue.
    last_id: u64,
}

/// Durable, ordered store of pending mutations.
///
/// Delivery is at-least-once: a mutation whose replay succeeded remotely
/// but whose removal was never persisted is replayed again on the next
/// drain. Endpoints receiving queued mutations must be idempotent.
pub struct MutationQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    /// Held for a whole drain pass so passes never overlap.
    drain_lock: Mutex<()>,
}

impl MutationQueue {
    /// Open the queue, loading pending entries from `store`.
    ///
    /// An unreadable persisted queue is logged and treated as empty.
    pub async fn open(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut entries: Vec<QueuedMutation> = match store.get(QUEUE_KEY).await? {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Discarding unreadable mutation queue: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        entries.sort_by_key(|m| m.id);
        let last_id = entries.last().map(|m| m.id).unwrap_or(0);

        if !entries.is_empty() {
            info!("Loaded {} pending mutation(s)", entries.len());
        }

        Ok(Self {
            store,
            clock,
            state: Mutex::new(QueueState { entries, last_id }),
            drain_lock: Mutex::new(()),
        })
    }

    /// Open with the system clock.
    pub async fn open_default(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::open(store, Arc::new(SystemClock)).await
    }

    /// Append a mutation and persist the queue.
    ///
    /// # Errors
    /// - `Error::InvalidInput` for GET requests
    /// - Storage failures; the entry is not kept in that case
    pub async fn enqueue(&self, request: &ApiRequest) -> Result<QueuedMutation> {
        if !request.method.is_mutation() {
            return Err(Error::InvalidInput(format!(
                "Only mutations can be queued, got {} {}",
                request.method, request.url
            )));
        }

        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        let id = millis.max(state.last_id + 1);

        let mutation = QueuedMutation {
            id,
            enqueued_at: now,
            url: request.url.clone(),
            method: request.method,
            headers: request.headers.clone(),
            body: request.body.clone(),
        };

        state.entries.push(mutation.clone());
        if let Err(e) = self.persist(&state.entries).await {
            state.entries.pop();
            return Err(e);
        }
        state.last_id = id;

        info!(
            "Queued {} {} (#{}, {} pending)",
            mutation.method,
            mutation.url,
            id,
            state.entries.len()
        );
        Ok(mutation)
    }

    /// Replay every pending mutation once, in enqueue order.
    ///
    /// The queue is read when the pass starts; entries enqueued meanwhile
    /// wait for the next pass, entries cleared meanwhile are not sent. Each entry gets a single attempt with the
    /// executor's deadline. Afterwards the durable queue holds the failed
    /// entries plus anything enqueued during the pass.
    pub async fn drain(&self, executor: &RequestExecutor) -> Result<DrainReport> {
        let _pass = self.drain_lock.lock().await;

        let snapshot = self.state.lock().await.entries.clone();
        if snapshot.is_empty() {
            debug!("Nothing to drain");
            return Ok(DrainReport::default());
        }

        info!("Draining {} queued mutation(s)", snapshot.len());
        let deadline = executor.config().timeout;
        let mut delivered = HashSet::new();
        let mut failed = Vec::new();

        for mutation in snapshot {
            if !self.is_queued(mutation.id).await {
                debug!("Skipping #{}, no longer queued", mutation.id);
                continue;
            }
            match executor.send_once(&mutation.to_request(), deadline).await {
                Ok(response) => {
                    debug!(
                        "Replayed #{} {} {} -> {}",
                        mutation.id, mutation.method, mutation.url, response.status
                    );
                    delivered.insert(mutation.id);
                }
                Err(e) => {
                    warn!(
                        "Replay of #{} {} {} failed: {}",
                        mutation.id, mutation.method, mutation.url, e
                    );
                    failed.push(mutation);
                }
            }
        }

        let mut state = self.state.lock().await;
        let remaining: Vec<QueuedMutation> = state
            .entries
            .iter()
            .filter(|m| !delivered.contains(&m.id))
            .cloned()
            .collect();
        if let Err(e) = self.persist(&remaining).await {
            warn!(
                "Failed to record {} delivered mutation(s); they will be replayed: {}",
                delivered.len(),
                e
            );
            return Err(e);
        }
        state.entries = remaining;

        info!(
            "Drain finished: {} delivered, {} failed, {} pending",
            delivered.len(),
            failed.len(),
            state.entries.len()
        );
        Ok(DrainReport {
            succeeded: delivered.len(),
            failed,
        })
    }

    /// Drop every pending mutation without sending it.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let dropped = state.entries.len();
        state.entries.clear();
        self.store.remove(QUEUE_KEY).await?;
        info!("Cleared {} pending mutation(s)", dropped);
        Ok(())
    }

    /// Number of pending mutations.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Check if nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Snapshot of pending mutations, oldest first.
    pub async fn pending(&self) -> Vec<QueuedMutation> {
        self.state.lock().await.entries.clone()
    }

    async fn is_queued(&self, id: u64) -> bool {
        self.state.lock().await.entries.iter().any(|m| m.id == id)
    }

    async fn persist(&self, entries: &[QueuedMutation]) -> Result<()> {
        let json = serde_json::to_string(entries)?;
        self.store.set(QUEUE_KEY, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::ExecutorConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tether_common::ApiResponse;
    use tether_storage::MemoryStore;
    use tether_transport::{HttpTransport, MockReply, MockTransport};
    use tokio::sync::Notify;

    async fn open_queue(store: &MemoryStore, clock: &ManualClock) -> MutationQueue {
        MutationQueue::open(Arc::new(store.clone()), Arc::new(clock.clone()))
            .await
            .unwrap()
    }

    fn executor(transport: Arc<dyn HttpTransport>) -> RequestExecutor {
        RequestExecutor::new(
            transport,
            ExecutorConfig::default().with_timeout(Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn test_enqueue_preserves_request() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let queue = open_queue(&store, &clock).await;

        let request = ApiRequest::post("/api/locations")
            .with_header("authorization", "Bearer abc")
            .with_body(json!({"lat": 1, "lng": 2}));
        let mutation = queue.enqueue(&request).await.unwrap();

        assert_eq!(mutation.to_request(), request);
        assert_eq!(mutation.enqueued_at, clock.now());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_is_rejected() {
        let store = MemoryStore::new();
        let queue = open_queue(&store, &ManualClock::default()).await;

        let result = queue.enqueue(&ApiRequest::get("/api/patterns")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_ids_increase_with_frozen_clock() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let queue = open_queue(&store, &clock).await;

        let a = queue.enqueue(&ApiRequest::post("/a")).await.unwrap();
        let b = queue.enqueue(&ApiRequest::put("/b")).await.unwrap();
        clock.advance(chrono::Duration::seconds(-10));
        let c = queue.enqueue(&ApiRequest::delete("/c")).await.unwrap();

        assert_eq!(a.id, clock.now().timestamp_millis() as u64 + 10_000);
        assert!(a.id < b.id && b.id < c.id);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();

        {
            let queue = open_queue(&store, &clock).await;
            queue.enqueue(&ApiRequest::post("/first")).await.unwrap();
            queue.enqueue(&ApiRequest::patch("/second")).await.unwrap();
        }

        let queue = open_queue(&store, &clock).await;
        let pending = queue.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].url, "/first");
        assert_eq!(pending[1].method, HttpMethod::Patch);

        // ids continue after the persisted maximum
        let third = queue.enqueue(&ApiRequest::post("/third")).await.unwrap();
        assert!(third.id > pending[1].id);
    }

    #[tokio::test]
    async fn test_corrupt_queue_is_treated_as_empty() {
        let store = MemoryStore::new();
        store.set(QUEUE_KEY, "not json").await.unwrap();

        let queue = open_queue(&store, &ManualClock::default()).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_fifo_order() {
        let store = MemoryStore::new();
        let queue = open_queue(&store, &ManualClock::default()).await;
        for i in 1..=4 {
            queue
                .enqueue(&ApiRequest::post(format!("/api/m{}", i)))
                .await
                .unwrap();
        }

        let mock = MockTransport::new();
        let report = queue.drain(&executor(Arc::new(mock.clone()))).await.unwrap();

        assert_eq!(report.succeeded, 4);
        assert!(report.is_complete());
        let urls: Vec<String> = mock.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["/api/m1", "/api/m2", "/api/m3", "/api/m4"]);
        assert!(queue.is_empty().await);
        assert_eq!(store.get(QUEUE_KEY).await.unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_partial_failure_retained() {
        let store = MemoryStore::new();
        let queue = open_queue(&store, &ManualClock::default()).await;
        for url in ["/ok1", "/bad", "/ok2", "/down"] {
            queue.enqueue(&ApiRequest::put(url)).await.unwrap();
        }

        let mock = MockTransport::new();
        mock.route("/bad", MockReply::status(422));
        mock.route("/down", MockReply::fail("connection refused"));

        let report = queue.drain(&executor(Arc::new(mock.clone()))).await.unwrap();

        assert_eq!(report.succeeded, 2);
        let failed: Vec<&str> = report.failed.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(failed, vec!["/bad", "/down"]);
        // a single attempt per entry, no retry during drain
        assert_eq!(mock.request_count(), 4);

        let remaining: Vec<String> = queue.pending().await.into_iter().map(|m| m.url).collect();
        assert_eq!(remaining, vec!["/bad", "/down"]);

        // the failures survive a restart as well
        let reopened = open_queue(&store, &ManualClock::default()).await;
        assert_eq!(reopened.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_hanging_replay() {
        let store = MemoryStore::new();
        let queue = open_queue(&store, &ManualClock::default()).await;
        queue.enqueue(&ApiRequest::post("/slow")).await.unwrap();
        queue.enqueue(&ApiRequest::post("/fast")).await.unwrap();

        let mock = MockTransport::new();
        mock.route("/slow", MockReply::Hang);

        let report = queue.drain(&executor(Arc::new(mock.clone()))).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed[0].url, "/slow");
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStore::new();
        let queue = open_queue(&store, &ManualClock::default()).await;
        queue.enqueue(&ApiRequest::delete("/api/locations/1")).await.unwrap();

        queue.clear().await.unwrap();
        assert!(queue.is_empty().await);
        assert!(store.get(QUEUE_KEY).await.unwrap().is_none());

        let mock = MockTransport::new();
        let report = queue.drain(&executor(Arc::new(mock.clone()))).await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(mock.request_count(), 0);
    }

    /// Holds the first send until released, announcing when it started.
    /// Later sends pass straight through. Every URL sent is recorded.
    #[derive(Default)]
    struct GatedTransport {
        started: Notify,
        release: Notify,
        sent: std::sync::Mutex<Vec<String>>,
    }

    impl GatedTransport {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for GatedTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
            let first = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(request.url.clone());
                sent.len() == 1
            };
            if first {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(ApiResponse::new(200, ""))
        }
    }

    #[tokio::test]
    async fn test_enqueue_during_drain_waits_for_next_pass() {
        let store = MemoryStore::new();
        let queue = Arc::new(open_queue(&store, &ManualClock::default()).await);
        queue.enqueue(&ApiRequest::post("/before")).await.unwrap();

        let gate = Arc::new(GatedTransport::default());
        let exec = executor(gate.clone());

        let drain_queue = queue.clone();
        let drain = tokio::spawn(async move { drain_queue.drain(&exec).await });

        gate.started.notified().await;
        queue.enqueue(&ApiRequest::post("/during")).await.unwrap();
        gate.release.notify_one();

        let report = drain.await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(gate.sent(), vec!["/before"]);

        let remaining: Vec<String> = queue.pending().await.into_iter().map(|m| m.url).collect();
        assert_eq!(remaining, vec!["/during"]);
    }

    #[tokio::test]
    async fn test_clear_during_drain_stops_replay() {
        let store = MemoryStore::new();
        let queue = Arc::new(open_queue(&store, &ManualClock::default()).await);
        for url in ["/one", "/two", "/three"] {
            queue.enqueue(&ApiRequest::post(url)).await.unwrap();
        }

        let gate = Arc::new(GatedTransport::default());
        let exec = executor(gate.clone());

        let drain_queue = queue.clone();
        let drain = tokio::spawn(async move { drain_queue.drain(&exec).await });

        gate.started.notified().await;
        queue.clear().await.unwrap();
        gate.release.notify_one();

        let report = drain.await.unwrap().unwrap();
        // only the send already in flight went out
        assert_eq!(gate.sent(), vec!["/one"]);
        assert_eq!(report.succeeded, 1);
        assert!(report.failed.is_empty());
        assert!(queue.is_empty().await);
        assert_eq!(store.get(QUEUE_KEY).await.unwrap().as_deref(), Some("[]"));
    }

    /// Memory store whose writes can be switched off.
    #[derive(Default)]
    struct FailingWrites {
        inner: MemoryStore,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FailingWrites {
        fn name(&self) -> &str {
            "failing"
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_back_keeps_memory_and_disk_in_step() {
        let store = Arc::new(FailingWrites::default());
        let queue = MutationQueue::open(store.clone(), Arc::new(ManualClock::default()))
            .await
            .unwrap();
        queue.enqueue(&ApiRequest::post("/api/locations")).await.unwrap();

        let mock = MockTransport::new();
        store.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = queue.drain(&executor(Arc::new(mock.clone()))).await;
        assert!(matches!(result, Err(Error::Storage(_))));

        // still pending in memory, matching what is persisted
        assert_eq!(queue.len().await, 1);

        // the next pass replays it again
        store.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        let report = queue.drain(&executor(Arc::new(mock.clone()))).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(mock.request_count(), 2);
        assert!(queue.is_empty().await);
    }
}
