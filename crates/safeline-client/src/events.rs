//! User-visible notifications.
//!
//! Every asynchronous failure is caught at its operation boundary and
//! turned into a [`Notification`] here; the UI layer subscribes and renders
//! them as alerts.

use serde::Serialize;
use tokio::sync::broadcast;

use safeline_shared::SafelineError;

const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: Level,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn info(title: &str, body: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            title: title.to_string(),
            body: body.into(),
        }
    }

    pub fn error(title: &str, body: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            title: title.to_string(),
            body: body.into(),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        tracing::debug!(title = %notification.title, level = ?notification.level, "notification");
        // Nobody listening is not an error.
        let _ = self.tx.send(notification);
    }

    /// Surface a failed operation and hand the result back unchanged.
    pub fn surface<T>(&self, title: &str, result: Result<T, SafelineError>) -> Result<T, SafelineError> {
        if let Err(e) = &result {
            tracing::warn!(operation = title, error = %e, "operation failed");
            self.emit(Notification::error(title, e.to_string()));
        }
        result
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
