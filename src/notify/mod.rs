// Notification sinks
// Plain title/message payloads for failed healing, open circuits, exhausted cascades and degraded instances

use crate::error::MedicResult;
use crate::monitor::IssueKind;
use crate::network::Controller;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    HealingFailed,
    CircuitOpened,
    CascadeExhausted,
    InstanceDegraded,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::HealingFailed => "healing_failed",
            NotificationKind::CircuitOpened => "circuit_opened",
            NotificationKind::CascadeExhausted => "cascade_exhausted",
            NotificationKind::InstanceDegraded => "instance_degraded",
        }
    }
}

/// Payload handed to a sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub instance_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_kind: Option<IssueKind>,

    /// Attempt number of the failed remediation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u64>,

    /// When an open circuit resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn healing_failed(
        instance_id: &str,
        entity_id: &str,
        issue_kind: Option<IssueKind>,
        attempt: u64,
        error: &str,
    ) -> Self {
        let kind_text = issue_kind.map(|k| format!(" ({k})")).unwrap_or_default();
        Self {
            instance_id: instance_id.to_string(),
            kind: NotificationKind::HealingFailed,
            title: format!("Healing failed for {entity_id}"),
            message: format!(
                "Automatic remediation of {entity_id}{kind_text} on {instance_id} failed on attempt {attempt}: {error}"
            ),
            entity_id: Some(entity_id.to_string()),
            issue_kind,
            attempts: Some(attempt),
            reset_at: None,
        }
    }

    pub fn circuit_opened(
        instance_id: &str,
        target: &str,
        entity_id: Option<&str>,
        failures: u32,
        reset_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            kind: NotificationKind::CircuitOpened,
            title: format!("Healing suspended for {target}"),
            message: format!(
                "{target} on {instance_id} failed {failures} consecutive remediations; \
                 no further attempts until {}",
                reset_at.to_rfc3339()
            ),
            entity_id: entity_id.map(str::to_string),
            issue_kind: None,
            attempts: Some(u64::from(failures)),
            reset_at: Some(reset_at),
        }
    }

    pub fn cascade_exhausted(instance_id: &str, entity_id: &str, issue_kind: Option<IssueKind>, cascade_id: Uuid) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            kind: NotificationKind::CascadeExhausted,
            title: format!("Remediation exhausted for {entity_id}"),
            message: format!(
                "Every configured remediation level for {entity_id} on {instance_id} failed (cascade {cascade_id})"
            ),
            entity_id: Some(entity_id.to_string()),
            issue_kind,
            attempts: None,
            reset_at: None,
        }
    }

    pub fn instance_degraded(instance_id: &str, reason: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            kind: NotificationKind::InstanceDegraded,
            title: format!("Monitoring degraded for {instance_id}"),
            message: format!("Realtime monitoring of {instance_id} stopped: {reason}"),
            entity_id: None,
            issue_kind: None,
            attempts: None,
            reset_at: None,
        }
    }

    /// Stable id so repeated notifications replace each other on the controller
    pub fn notification_id(&self) -> String {
        let subject = self.entity_id.as_deref().unwrap_or(&self.instance_id);
        format!("home_medic_{}_{}", self.kind.as_str(), subject.replace('.', "_"))
    }
}

/// Delivery backend for notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> MedicResult<()>;
}

/// Persistent notification on the affected controller
pub struct ControllerSink {
    controller: Arc<dyn Controller>,
}

impl ControllerSink {
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl NotificationSink for ControllerSink {
    async fn deliver(&self, notification: &Notification) -> MedicResult<()> {
        self.controller
            .create_notification(
                &notification.title,
                &notification.message,
                Some(&notification.notification_id()),
            )
            .await
    }
}

/// Log-only sink
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> MedicResult<()> {
        warn!(
            instance = %notification.instance_id,
            kind = notification.kind.as_str(),
            entity_id = notification.entity_id.as_deref().unwrap_or(""),
            title = %notification.title,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Sink that keeps everything it receives
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, notification: &Notification) -> MedicResult<()> {
        self.delivered.lock().push(notification.clone());
        Ok(())
    }
}

/// Notification worker: last stage of the instance pipeline
pub async fn run_notification_worker(
    instance_id: String,
    sink: Arc<dyn NotificationSink>,
    mut rx: mpsc::Receiver<Notification>,
    token: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(notification) => notification,
                None => break,
            },
        };

        debug!(instance = %instance_id, kind = notification.kind.as_str(), "delivering notification");
        if let Err(e) = sink.deliver(&notification).await {
            warn!(instance = %instance_id, error = %e, title = %notification.title, "notification delivery failed");
        }
    }

    // Deliver what was already queued before shutdown
    while let Ok(notification) = rx.try_recv() {
        if let Err(e) = sink.deliver(&notification).await {
            warn!(instance = %instance_id, error = %e, "notification delivery failed during shutdown");
        }
    }
    info!(instance = %instance_id, "notification worker stopped");
}
