//! Outbound lifecycle event emission.
//!
//! Workers announce transitions through the [`Notifier`] trait. Calls
//! return promptly regardless of transport latency; delivery failures
//! are logged and never surface to the caller. The worker may have
//! already updated status before the event lands, so consumers see
//! at-least-once, best-effort delivery.

mod cloudevent;

pub use cloudevent::{CloudEventNotifier, NotifyError};

use std::sync::Mutex;

use omni_events::ImageEvent;
use tracing::info;

/// Fire-and-forget event emission keyed by `(externalComponent, externalID)`.
pub trait Notifier: Send + Sync {
    /// Emit an event. Must not block on the transport.
    fn notify(
        &self,
        event: ImageEvent,
        external_component: &str,
        external_id: &str,
        data: serde_json::Value,
    );
}

/// Event subject: `{externalComponent}.{externalID}`.
pub fn subject(external_component: &str, external_id: &str) -> String {
    format!("{external_component}.{external_id}")
}

/// Serialize an event payload, falling back to `null` rather than
/// failing the emitting worker.
pub fn payload<T: serde::Serialize>(data: &T) -> serde_json::Value {
    serde_json::to_value(data).unwrap_or(serde_json::Value::Null)
}

/// Log-only notifier used when no event bus is configured.
pub struct EchoNotifier;

impl Notifier for EchoNotifier {
    fn notify(
        &self,
        event: ImageEvent,
        external_component: &str,
        external_id: &str,
        data: serde_json::Value,
    ) {
        info!(
            event = %event,
            subject = %subject(external_component, external_id),
            data = %data,
            "event emitted"
        );
    }
}

/// An event captured by [`RecordingNotifier`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub event: ImageEvent,
    pub subject: String,
    pub data: serde_json::Value,
}

/// Notifier that records events in memory, for tests.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events of one type, in emission order.
    pub fn events_of(&self, event: ImageEvent) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event == event)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(
        &self,
        event: ImageEvent,
        external_component: &str,
        external_id: &str,
        data: serde_json::Value,
    ) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedEvent {
                event,
                subject: subject(external_component, external_id),
                data,
            });
    }
}
