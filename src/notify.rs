//! Operator notifications
//!
//! Producers never wait: a full or closed channel drops the message.

use crate::models::Notification;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<Notification>,
}

impl NotificationSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns `false` when the notification was dropped
    pub fn send(&self, title: impl Into<String>, message: impl Into<String>) -> bool {
        match self.tx.try_send(Notification::new(title, message)) {
            Ok(()) => true,
            Err(TrySendError::Full(n)) => {
                tracing::debug!(title = %n.title, "Notification channel full, dropping");
                false
            }
            Err(TrySendError::Closed(n)) => {
                tracing::debug!(title = %n.title, "Notification sink closed, dropping");
                false
            }
        }
    }
}

/// Drain notifications into the log
pub async fn run_sink(mut rx: mpsc::Receiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        tracing::info!(title = %notification.title, "🔔 {}", notification.message);
    }
}
