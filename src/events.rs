//! Event publishing.
//!
//! The connection actor is the only publisher. Subscribers either hold a
//! [`Subscription`] and pull events, or register a callback that runs on its
//! own task. Each subscriber has a bounded buffer; one that falls behind
//! loses its oldest events instead of holding up the link.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::ble::connection::LinkState;
use crate::data::{BatteryLevels, Telemetry};

/// Whether the device is streaming telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunState {
    /// Not streaming (initial state, after STOP, and after any disconnect).
    #[default]
    Stopped,
    /// START was acknowledged.
    Running,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// Events published by a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The link became ready (`true`) or went down (`false`).
    ConnectionStateChanged(bool),
    /// A telemetry frame arrived.
    TelemetryReceived {
        /// The decoded readings.
        reading: Telemetry,
        /// When the frame was processed.
        received_at: DateTime<Utc>,
    },
    /// A battery report arrived.
    BatteryUpdated(BatteryLevels),
    /// The link state machine moved to a new state.
    LinkStateChanged(LinkState),
    /// The device started or stopped streaming.
    RunStateChanged(RunState),
}

/// A pull-based subscription to device events.
pub struct Subscription {
    receiver: broadcast::Receiver<DeviceEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the manager is gone.
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Subscriber lagged, {} events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!("Subscriber lagged, {} events dropped", missed);
                }
                Err(_) => return None,
            }
        }
    }
}

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Broadcast point for device events.
#[derive(Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<DeviceEvent>,
    callback_counter: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Create a publisher buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            callback_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: DeviceEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers, callbacks included.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Register a callback for every event.
    ///
    /// The callback runs on its own task; dropping the returned handle
    /// unregisters it.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut subscription = self.subscribe();

        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(&event);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let DeviceEvent::ConnectionStateChanged(connected) = event {
                callback(*connected);
            }
        })
    }

    /// Register a callback for telemetry.
    pub fn on_telemetry<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Telemetry, DateTime<Utc>) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let DeviceEvent::TelemetryReceived {
                reading,
                received_at,
            } = event
            {
                callback(reading, *received_at);
            }
        })
    }

    /// Register a callback for battery updates.
    pub fn on_battery<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(BatteryLevels) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let DeviceEvent::BatteryUpdated(levels) = event {
                callback(*levels);
            }
        })
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
