//! Single-request execution with deadline, retry, and exponential backoff.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use tether_common::{ApiRequest, ApiResponse, Error, Result};
use tether_transport::HttpTransport;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts per logical request, including the first.
    pub max_attempts: u32,
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Backoff unit; the wait after attempt `n` is `2^n * backoff_base`.
    pub backoff_base: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl ExecutorConfig {
    /// Create a new executor configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }

    /// Set the per-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the backoff unit.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// With the default base this is 2s, 4s, 8s, ... for attempts 1, 2, 3.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let capped_delay = self.backoff_base.saturating_mul(factor).min(self.max_delay);

        if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay.mul_f64(jitter_factor)
        } else {
            capped_delay
        }
    }

    /// Per-call options matching this configuration.
    pub fn options(&self) -> ExecuteOptions {
        ExecuteOptions {
            timeout: self.timeout,
            max_attempts: self.max_attempts,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl ExecuteOptions {
    /// One attempt, no retry.
    pub fn single(timeout: Duration) -> Self {
        Self {
            timeout,
            max_attempts: 1,
        }
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        ExecutorConfig::default().options()
    }
}

/// Issues requests through a transport with a deadline per attempt and
/// bounded retry.
///
/// Per logical request: `PENDING -> DONE` on a 2xx answer,
/// `PENDING -> PENDING` after a backoff delay while attempts remain, and
/// `PENDING -> FAILED` once they are exhausted. Timeouts, transport errors,
/// and non-2xx statuses are all treated the same way.
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    config: ExecutorConfig,
}

impl RequestExecutor {
    /// Create a new request executor.
    pub fn new(transport: Arc<dyn HttpTransport>, config: ExecutorConfig) -> Self {
        Self { transport, config }
    }

    /// Get the executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `request`, retrying failed attempts with exponential backoff.
    ///
    /// `max_attempts` of zero is treated as one. Errors that did not come
    /// from the remote side (e.g. an unresolvable URL) are returned without
    /// retry.
    ///
    /// # Errors
    /// The error of the last attempt once attempts are exhausted.
    pub async fn execute(
        &self,
        request: &ApiRequest,
        options: ExecuteOptions,
    ) -> Result<ApiResponse> {
        let max_attempts = options.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.send_once(request, options.timeout).await {
                Ok(response) => {
                    if attempt > 1 {
                        debug!(
                            "{} {} succeeded on attempt {}",
                            request.method, request.url, attempt
                        );
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if !err.is_transient() {
                        return Err(err);
                    }

                    if attempt >= max_attempts {
                        warn!(
                            "{} {} failed after {} attempts: {}",
                            request.method, request.url, attempt, err
                        );
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        "Attempt {}/{} for {} {} failed: {}. Retrying in {:?}...",
                        attempt, max_attempts, request.method, request.url, err, delay
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Make exactly one attempt, racing the transport against `deadline`.
    ///
    /// A non-2xx answer is reported as `Error::Status`; an expired deadline
    /// cancels the call and is reported as `Error::Timeout`.
    pub async fn send_once(&self, request: &ApiRequest, deadline: Duration) -> Result<ApiResponse> {
        match timeout(deadline, self.transport.send(request)).await {
            Err(_) => Err(Error::Timeout(deadline)),
            Ok(Err(err)) => Err(err),
            Ok(Ok(response)) if response.is_success() => Ok(response),
            Ok(Ok(response)) => Err(Error::Status {
                status: response.status,
                url: request.url.clone(),
            }),
        }
    }
}
