//! Resilient client that orchestrates cache, queue, and executor.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_common::{ApiRequest, ApiResponse, Error, HttpMethod, Result};
use tether_storage::KeyValueStore;
use tether_transport::{HttpTransport, ReqwestTransport};

use crate::cache::{CacheEntry, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::connectivity::{ConnectivityMonitor, ListenerId};
use crate::executor::{ExecuteOptions, RequestExecutor};
use crate::notify::{NoopNotifier, Notifier, SyncEvent};
use crate::queue::{DrainReport, MutationQueue, QueuedMutation};
use crate::scheduler::SyncScheduler;

/// Per-request overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Serve from and store into the response cache (GET only).
    pub use_cache: bool,
    /// Per-attempt deadline; the configured one if unset.
    pub timeout: Option<Duration>,
    /// Attempt budget; the configured one if unset.
    pub max_attempts: Option<u32>,
}

impl RequestOptions {
    /// Options that bypass the response cache.
    pub fn no_cache() -> Self {
        Self {
            use_cache: false,
            ..Default::default()
        }
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            timeout: None,
            max_attempts: None,
        }
    }
}

/// Result of a logical request that did not hard-fail.
///
/// Recoverable conditions come back here with metadata instead of as an
/// error: `queued` for a mutation stored for later, `from_cache` (with
/// `error` set when the network failed) for a read answered locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOutcome {
    /// Response payload; `None` for queued mutations.
    pub data: Option<Value>,
    /// HTTP status when the answer came from the network.
    pub status: Option<u16>,
    pub from_cache: bool,
    pub queued: bool,
    /// The stored entry when `queued` is set.
    pub mutation: Option<QueuedMutation>,
    /// Network error that was absorbed by a cache fallback.
    pub error: Option<String>,
}

impl RequestOutcome {
    fn from_network(response: &ApiResponse, data: Value) -> Self {
        Self {
            data: Some(data),
            status: Some(response.status),
            ..Default::default()
        }
    }

    fn from_cache(entry: CacheEntry, error: Option<String>) -> Self {
        Self {
            data: Some(entry.data),
            from_cache: true,
            error,
            ..Default::default()
        }
    }

    fn queued(mutation: QueuedMutation) -> Self {
        Self {
            queued: true,
            mutation: Some(mutation),
            ..Default::default()
        }
    }

    /// True when the request was answered by the network without falling back.
    pub fn is_success(&self) -> bool {
        !self.queued && !self.from_cache && self.error.is_none()
    }
}

/// Builder for [`ResilientClient`].
pub struct ClientBuilder {
    config: ClientConfig,
    store: Arc<dyn KeyValueStore>,
    transport: Option<Arc<dyn HttpTransport>>,
    monitor: Option<Arc<ConnectivityMonitor>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl ClientBuilder {
    /// Use a specific transport instead of the reqwest default.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share an existing connectivity monitor.
    pub fn monitor(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Deliver user-facing events to `notifier`.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Use `clock` for cache freshness and queue ids.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and open the cache and queue.
    pub async fn build(self) -> Result<ResilientClient> {
        self.config.validate()?;

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let mut transport = match &self.config.user_agent {
                    Some(agent) => ReqwestTransport::with_user_agent(agent)?,
                    None => ReqwestTransport::new()?,
                };
                if let Some(base) = &self.config.base_url {
                    transport = transport.with_base_url(base)?;
                }
                Arc::new(transport)
            }
        };

        let cache = ResponseCache::open(
            self.store.clone(),
            self.config.staleness()?,
            self.config.cache_policy,
            self.clock.clone(),
        )
        .await?;
        let queue = MutationQueue::open(self.store, self.clock).await?;
        let executor = RequestExecutor::new(transport, self.config.executor_config());
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(ConnectivityMonitor::new()));

        let notifier = self.notifier.clone();
        let listener = monitor
            .on_transition(move |state| notifier.notify(SyncEvent::ConnectivityChanged(state)));

        Ok(ResilientClient {
            config: self.config,
            monitor,
            cache: Arc::new(cache),
            queue: Arc::new(queue),
            executor: Arc::new(executor),
            notifier: self.notifier,
            listener,
        })
    }
}

/// Public entry point of the offline layer.
///
/// Decides per request whether to answer from cache, send now, or queue
/// for later:
/// 1. GET with caching: a fresh entry, or any entry while offline, is
///    returned without touching the network.
/// 2. Offline mutation: queued, nothing is sent.
/// 3. Otherwise sent through the executor. Reads fall back to a cached
///    entry on terminal failure; mutations that fail after connectivity
///    dropped are queued; everything else is returned as an error.
///
/// A flaky connection that the monitor still reports as online does not
/// queue mutations: they fail and the caller sees the error.
pub struct ResilientClient {
    config: ClientConfig,
    monitor: Arc<ConnectivityMonitor>,
    cache: Arc<ResponseCache>,
    queue: Arc<MutationQueue>,
    executor: Arc<RequestExecutor>,
    notifier: Arc<dyn Notifier>,
    /// Transition listener registered on `monitor`, removed on drop.
    listener: ListenerId,
}

impl ResilientClient {
    /// Start building a client persisting its state in `store`.
    pub fn builder(config: ClientConfig, store: Arc<dyn KeyValueStore>) -> ClientBuilder {
        ClientBuilder {
            config,
            store,
            transport: None,
            monitor: None,
            notifier: Arc::new(NoopNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    /// Issue a logical request.
    ///
    /// # Errors
    /// Only terminal failures with no fallback: a read that failed with no
    /// cached entry, or a mutation that failed while online.
    pub async fn request(
        &self,
        request: ApiRequest,
        options: RequestOptions,
    ) -> Result<RequestOutcome> {
        let caching =
            request.method == HttpMethod::Get && options.use_cache && self.config.cache_enabled;
        let key = request.signature();

        if caching {
            if let Some(entry) = self.cache.get(&key).await {
                let fresh = self.cache.is_fresh(&entry);
                let online = self.monitor.is_online();
                if fresh || !online {
                    debug!(
                        "Serving {} from cache (fresh: {}, online: {})",
                        request.url, fresh, online
                    );
                    if !fresh {
                        self.notifier.notify(SyncEvent::ServedFromCache {
                            url: request.url.clone(),
                            stale: true,
                        });
                    }
                    return Ok(RequestOutcome::from_cache(entry, None));
                }
            }
        }

        if request.method.is_mutation() && !self.monitor.is_online() {
            return self.enqueue(&request).await;
        }

        let exec_options = ExecuteOptions {
            timeout: options.timeout.unwrap_or(self.executor.config().timeout),
            max_attempts: options
                .max_attempts
                .unwrap_or(self.executor.config().max_attempts),
        };

        match self.executor.execute(&request, exec_options).await {
            Ok(response) => {
                let data = response.data();
                if caching {
                    if let Err(e) = self.cache.put(&key, data.clone()).await {
                        warn!("Failed to cache response for {}: {}", request.url, e);
                    }
                }
                Ok(RequestOutcome::from_network(&response, data))
            }
            Err(err) => self.recover(&request, &key, caching, err).await,
        }
    }

    /// Fallbacks after the executor gave up.
    async fn recover(
        &self,
        request: &ApiRequest,
        key: &str,
        caching: bool,
        err: Error,
    ) -> Result<RequestOutcome> {
        if caching {
            if let Some(entry) = self.cache.get(key).await {
                warn!(
                    "{} {} failed ({}); serving cached response",
                    request.method, request.url, err
                );
                self.notifier.notify(SyncEvent::ServedFromCache {
                    url: request.url.clone(),
                    stale: !self.cache.is_fresh(&entry),
                });
                return Ok(RequestOutcome::from_cache(entry, Some(err.to_string())));
            }
        }

        if request.method.is_mutation() && !self.monitor.is_online() {
            info!(
                "{} {} failed after connectivity dropped; queuing",
                request.method, request.url
            );
            return self.enqueue(request).await;
        }

        Err(err)
    }

    async fn enqueue(&self, request: &ApiRequest) -> Result<RequestOutcome> {
        let mutation = self.queue.enqueue(request).await?;
        self.notifier.notify(SyncEvent::Queued {
            id: mutation.id,
            method: mutation.method,
            url: mutation.url.clone(),
        });
        Ok(RequestOutcome::queued(mutation))
    }

    /// GET `url` with default options.
    pub async fn get(&self, url: impl Into<String>) -> Result<RequestOutcome> {
        self.request(ApiRequest::get(url), RequestOptions::default())
            .await
    }

    /// Issue `request` with default options.
    pub async fn send(&self, request: ApiRequest) -> Result<RequestOutcome> {
        self.request(request, RequestOptions::default()).await
    }

    /// Replay the pending queue once and report the outcome to the notifier.
    pub async fn drain(&self) -> Result<DrainReport> {
        let report = self.queue.drain(&self.executor).await?;
        if report.succeeded > 0 {
            self.notifier.notify(SyncEvent::Synced {
                count: report.succeeded,
            });
        }
        if !report.failed.is_empty() {
            self.notifier.notify(SyncEvent::SyncIncomplete {
                remaining: self.queue.len().await,
            });
        }
        Ok(report)
    }

    /// Abandon every pending mutation.
    pub async fn clear_queue(&self) -> Result<()> {
        self.queue.clear().await
    }

    /// Number of mutations waiting to be replayed.
    pub async fn pending_count(&self) -> usize {
        self.queue.len().await
    }

    /// Spawn the background task that drains the queue per `sync_mode`.
    ///
    /// The returned scheduler accepts explicit drain requests; the task
    /// runs until [`SyncScheduler::shutdown`].
    pub fn start_sync(self: &Arc<Self>) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) = SyncScheduler::new(self.config.sync_mode);
        let client = Arc::clone(self);
        let task = tokio::spawn(handle.run(self.monitor.subscribe(), move || {
            let client = Arc::clone(&client);
            async move { client.drain().await }
        }));
        (scheduler, task)
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        self.monitor.remove_listener(self.listener);
    }
}
