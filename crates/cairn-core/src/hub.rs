//! The notification bus shared by the orchestrator, the host and plugins.
//!
//! [`Hub`] is pre-registered under the service name [`HUB_SERVICE`] and is
//! always considered resolved, so any plugin may consume it to observe the
//! application's lifecycle.
//!
//! ```rust,ignore
//! let mut events = app.subscribe();
//! while let Some(event) = events.recv().await {
//!     if let AppEvent::Service { name } = event {
//!         println!("service {name} is up");
//!     }
//! }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SharedError;

/// Service name the hub is registered under.
pub const HUB_SERVICE: &str = "hub";

/// A lifecycle notification.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A service was registered.
    Service {
        /// The service name.
        name: String,
    },
    /// A plugin finished its setup and registered everything it provides.
    Plugin {
        /// The plugin's package path.
        name: String,
    },
    /// The initial plugin set is fully started. Emitted once.
    Ready,
    /// A hot-loaded batch is fully started.
    ReadyAdditional,
    /// A boot attempt failed.
    Error(SharedError),
}

/// Multi-subscriber bus of [`AppEvent`]s.
///
/// Every event is delivered to every subscriber alive at emission time.
/// Subscribers whose receiver was dropped are pruned on the next emission.
#[derive(Clone, Default)]
pub struct Hub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<AppEvent>>>>,
}

impl Hub {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AppEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber.
    pub fn emit(&self, event: AppEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let hub = Hub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.emit(AppEvent::Service { name: "db".into() });
        hub.emit(AppEvent::Ready);

        for rx in [&mut a, &mut b] {
            assert!(matches!(rx.recv().await, Some(AppEvent::Service { name }) if name == "db"));
            assert!(matches!(rx.recv().await, Some(AppEvent::Ready)));
        }
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let hub = Hub::new();
        let rx = hub.subscribe();
        let _keep = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(rx);
        hub.emit(AppEvent::Ready);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let hub = Hub::new();
        hub.emit(AppEvent::Ready);
        let mut rx = hub.subscribe();
        hub.emit(AppEvent::ReadyAdditional);
        assert!(matches!(rx.recv().await, Some(AppEvent::ReadyAdditional)));
    }
}
