//! User-facing notification channel.

use std::sync::Mutex;
use tracing::info;

use tether_common::HttpMethod;

use crate::connectivity::ConnectivityState;

/// Something the user may want to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A mutation was stored for later delivery.
    Queued {
        id: u64,
        method: HttpMethod,
        url: String,
    },
    /// A drain delivered `count` queued mutations.
    Synced { count: usize },
    /// A drain finished with `remaining` mutations still pending.
    SyncIncomplete { remaining: usize },
    /// A read was answered from cache after the network failed or while
    /// offline.
    ServedFromCache { url: String, stale: bool },
    /// Connectivity changed.
    ConnectivityChanged(ConnectivityState),
}

/// Receives [`SyncEvent`]s. The layer works the same with [`NoopNotifier`].
pub trait Notifier: Send + Sync {
    fn notify(&self, event: SyncEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: SyncEvent) {}
}

/// Logs events at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: SyncEvent) {
        match event {
            SyncEvent::Queued { id, method, url } => {
                info!("Offline: {} {} saved for later (#{})", method, url, id)
            }
            SyncEvent::Synced { count } => info!("Synced {} pending request(s)", count),
            SyncEvent::SyncIncomplete { remaining } => {
                info!("{} request(s) still waiting to sync", remaining)
            }
            SyncEvent::ServedFromCache { url, stale } => {
                info!("Showing cached data for {} (stale: {})", url, stale)
            }
            SyncEvent::ConnectivityChanged(state) => info!("You are now {}", state),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, oldest first.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of `Synced` events received.
    pub fn synced_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SyncEvent::Synced { .. }))
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: SyncEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.notify(SyncEvent::Synced { count: 2 });
        notifier.notify(SyncEvent::SyncIncomplete { remaining: 1 });
        notifier.notify(SyncEvent::Synced { count: 1 });

        assert_eq!(notifier.events().len(), 3);
        assert_eq!(notifier.synced_count(), 2);
    }

    #[test]
    fn test_noop_and_tracing_accept_events() {
        NoopNotifier.notify(SyncEvent::Synced { count: 1 });
        TracingNotifier.notify(SyncEvent::ConnectivityChanged(ConnectivityState::Offline));
    }
}
