//! Operator-facing notifications.
//!
//! Workers report what happened through an [`Observer`]; the daemon's
//! implementation logs each notification and forwards it to the D-Bus
//! signal task.

use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Recognized,
    Cooldown,
    DispatchSucceeded,
    DispatchWarning,
    EnrollmentProgress,
    EnrollmentDone,
    Error,
}

impl NotificationKind {
    /// Wire name used in the `Notification` D-Bus signal.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recognized => "recognized",
            Self::Cooldown => "cooldown",
            Self::DispatchSucceeded => "dispatch-success",
            Self::DispatchWarning => "dispatch-warning",
            Self::EnrollmentProgress => "enrollment-progress",
            Self::EnrollmentDone => "enrollment-done",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    /// How long a display surface should show the message.
    pub duration: Duration,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind,
            message: message.into(),
            duration,
        }
    }
}

pub trait Observer: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs every notification and hands it to the signal emitter task.
pub struct BusObserver {
    tx: mpsc::UnboundedSender<Notification>,
}

impl BusObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for BusObserver {
    fn notify(&self, notification: Notification) {
        let kind = notification.kind.as_str();
        match notification.kind {
            NotificationKind::DispatchWarning => {
                tracing::warn!(kind, message = %notification.message, "notification")
            }
            NotificationKind::Error => {
                tracing::error!(kind, message = %notification.message, "notification")
            }
            NotificationKind::Cooldown | NotificationKind::EnrollmentProgress => {
                tracing::debug!(kind, message = %notification.message, "notification")
            }
            _ => tracing::info!(kind, message = %notification.message, "notification"),
        }
        // Receiver only goes away during shutdown.
        let _ = self.tx.send(notification);
    }
}
