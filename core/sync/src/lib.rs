//! Tether offline sync layer
//!
//! This module keeps a client usable across unreliable connectivity:
//! - Connectivity tracking with transition listeners
//! - Durable FIFO queue for mutations issued while offline
//! - Response cache with a staleness horizon and stale fallback
//! - Request executor with per-attempt deadline and exponential backoff
//! - Background drain scheduling on reconnect

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod executor;
pub mod notify;
pub mod queue;
pub mod scheduler;

// Re-export main types
pub use cache::{CacheEntry, CachePolicy, ResponseCache};
pub use client::{ClientBuilder, RequestOptions, RequestOutcome, ResilientClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClientConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState, ListenerId};
pub use executor::{ExecuteOptions, ExecutorConfig, RequestExecutor};
pub use notify::{NoopNotifier, Notifier, RecordingNotifier, SyncEvent, TracingNotifier};
pub use queue::{DrainReport, MutationQueue, QueuedMutation};
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle};
