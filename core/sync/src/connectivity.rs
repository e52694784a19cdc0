//! Connectivity state tracking.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Whether the runtime currently reports network connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => f.write_str("online"),
            ConnectivityState::Offline => f.write_str("offline"),
        }
    }
}

/// Handle returned by [`ConnectivityMonitor::on_transition`].
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

/// Tracks the online/offline signal and fans out transitions.
///
/// The state only changes through [`set_state`](Self::set_state), which is
/// fed by whatever signal source the host runtime provides. Without any
/// signal the monitor stays Online.
pub struct ConnectivityMonitor {
    state_tx: watch::Sender<ConnectivityState>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl ConnectivityMonitor {
    /// Create a monitor that starts Online.
    pub fn new() -> Self {
        Self::with_state(ConnectivityState::Online)
    }

    /// Create a monitor with a known initial state.
    pub fn with_state(initial: ConnectivityState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            state_tx,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Record the runtime's connectivity signal.
    ///
    /// Returns `true` if this was a transition. Listeners run once per
    /// transition, on the calling task; repeating the current state is a
    /// no-op.
    pub fn set_state(&self, state: ConnectivityState) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if !changed {
            debug!("Connectivity unchanged ({})", state);
            return false;
        }

        info!("Connectivity changed: now {}", state);
        let listeners: Vec<Listener> = self
            .lock_listeners()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(state);
        }
        true
    }

    pub fn set_online(&self) -> bool {
        self.set_state(ConnectivityState::Online)
    }

    pub fn set_offline(&self) -> bool {
        self.set_state(ConnectivityState::Offline)
    }

    /// Register a listener invoked with the new state on every transition.
    pub fn on_transition<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners().push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Channel view of the state, for tasks that await transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Forward a signal source into this monitor on a background task.
    ///
    /// The task ends when the stream ends.
    pub fn attach<S>(self: &Arc<Self>, signal: S) -> JoinHandle<()>
    where
        S: Stream<Item = ConnectivityState> + Send + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            futures::pin_mut!(signal);
            while let Some(state) = signal.next().await {
                monitor.set_state(state);
            }
            debug!("Connectivity signal source ended");
        })
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        // Listeners are plain closures; a poisoned lock only means one of
        // them panicked, the list itself is intact.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_defaults_to_online() {
        let monitor = ConnectivityMonitor::new();
        assert!(monitor.is_online());
        assert_eq!(monitor.state(), ConnectivityState::Online);
    }

    #[test]
    fn test_listener_called_once_per_transition() {
        let monitor = ConnectivityMonitor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        monitor.on_transition(move |state| seen_clone.lock().unwrap().push(state));

        assert!(monitor.set_offline());
        assert!(!monitor.set_offline());
        assert!(monitor.set_online());
        assert!(!monitor.set_online());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectivityState::Offline, ConnectivityState::Online]
        );
    }

    #[test]
    fn test_remove_listener() {
        let monitor = ConnectivityMonitor::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let id = monitor.on_transition(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        monitor.set_offline();
        assert!(monitor.remove_listener(id));
        assert!(!monitor.remove_listener(id));
        monitor.set_online();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let monitor = ConnectivityMonitor::with_state(ConnectivityState::Offline);
        let mut rx = monitor.subscribe();

        monitor.set_online();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_attach_stream() {
        let monitor = Arc::new(ConnectivityMonitor::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        monitor.on_transition(move |state| seen_clone.lock().unwrap().push(state));

        let signal = futures::stream::iter(vec![
            ConnectivityState::Offline,
            ConnectivityState::Offline,
            ConnectivityState::Online,
        ]);
        monitor.attach(signal).await.unwrap();

        assert!(monitor.is_online());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
