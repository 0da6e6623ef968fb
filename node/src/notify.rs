//! Alert dispatch.
//!
//! The core does not know how alerts reach people — it only requires a
//! [`Notifier`] capability. Dispatch decisions (alert suppression, the
//! `(device, alert_type, run)` dedup gate) belong to the device loop and
//! the registry; implementations here only deliver.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

/// The alert kinds the core can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    DeviceStopped,
    DeviceUnreachable,
    StorageWarning,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::DeviceStopped => "device_stopped",
            AlertKind::DeviceUnreachable => "device_unreachable",
            AlertKind::StorageWarning => "storage_warning",
        }
    }
}

/// One alert ready for delivery.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub device_id: String,
    pub device_name: String,
    /// Run the alert is keyed on for deduplication; empty when no run is
    /// associated.
    pub run_id: String,
    pub message: String,
}

/// Delivery capability required by the core.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_device_stopped_alert(&self, event: &AlertEvent);
    async fn send_device_unreachable_alert(&self, event: &AlertEvent);
    async fn send_storage_warning_alert(&self, event: &AlertEvent);

    /// Route an event to the matching send method.
    async fn dispatch(&self, event: &AlertEvent) {
        match event.kind {
            AlertKind::DeviceStopped => self.send_device_stopped_alert(event).await,
            AlertKind::DeviceUnreachable => self.send_device_unreachable_alert(event).await,
            AlertKind::StorageWarning => self.send_storage_warning_alert(event).await,
        }
    }
}

/// Notifier that POSTs alert payloads to a configured webhook URL.
///
/// Delivery is best-effort: failures are logged, never propagated.
pub struct WebhookNotifier {
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        WebhookNotifier { url: url.into() }
    }

    async fn post(&self, event: &AlertEvent) {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build reqwest client for webhook");
                return;
            }
        };

        let payload = json!({
            "type": event.kind.as_str(),
            "data": {
                "device_id": event.device_id,
                "device_name": event.device_name,
                "run_id": event.run_id,
                "message": event.message,
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        match client.post(&self.url).json(&payload).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(
                    url = %self.url,
                    status = %resp.status(),
                    "Webhook POST returned non-success status"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(url = %self.url, error = %e, "Webhook POST failed");
            }
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_device_stopped_alert(&self, event: &AlertEvent) {
        self.post(event).await;
    }

    async fn send_device_unreachable_alert(&self, event: &AlertEvent) {
        self.post(event).await;
    }

    async fn send_storage_warning_alert(&self, event: &AlertEvent) {
        self.post(event).await;
    }
}

/// Notifier that drops everything. Used when no transport is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send_device_stopped_alert(&self, _event: &AlertEvent) {}
    async fn send_device_unreachable_alert(&self, _event: &AlertEvent) {}
    async fn send_storage_warning_alert(&self, _event: &AlertEvent) {}
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Notifier that records every dispatched event, for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<AlertEvent>>,
    }

    impl RecordingNotifier {
        pub fn kinds(&self) -> Vec<AlertKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_device_stopped_alert(&self, event: &AlertEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        async fn send_device_unreachable_alert(&self, event: &AlertEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        async fn send_storage_warning_alert(&self, event: &AlertEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
