//! Outbound notifications, sent as background work so the request that queues them
//! returns immediately.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const DELIVERY_ATTEMPTS: u32 = 3;
pub const DELIVERY_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Field name to problem, empty when the notification can be sent.
    pub fn validate(&self) -> BTreeMap<&'static str, &'static str> {
        let mut errors = BTreeMap::new();
        if self.recipient.trim().is_empty() {
            errors.insert("recipient", "must be provided");
        } else if !self.recipient.contains('@') {
            errors.insert("recipient", "must be a valid email address");
        }
        if self.subject.trim().is_empty() {
            errors.insert("subject", "must be provided");
        }
        if self.body.is_empty() {
            errors.insert("body", "must be provided");
        }
        errors
    }
}

#[derive(Debug, Error)]
#[error("failed to deliver notification to {recipient}: {reason}")]
pub struct NotifyError {
    pub recipient: String,
    pub reason: String,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of a mail server.
pub struct LogNotifier {
    sender: String,
}

impl LogNotifier {
    pub fn new(sender: String) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            sender = %self.sender,
            recipient = %notification.recipient,
            subject = %notification.subject,
            "notification sent"
        );
        Ok(())
    }
}

/// Try the notifier up to [`DELIVERY_ATTEMPTS`] times, pausing between attempts.
pub async fn deliver(
    notifier: &dyn Notifier,
    notification: &Notification,
) -> Result<(), NotifyError> {
    let mut attempt = 1;
    loop {
        match notifier.send(notification).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < DELIVERY_ATTEMPTS => {
                warn!(attempt, error = %e, "notification delivery failed, retrying");
                attempt += 1;
                tokio::time::sleep(DELIVERY_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakyNotifier {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(NotifyError {
                    recipient: notification.recipient.clone(),
                    reason: "connection refused".to_owned(),
                });
            }
            Ok(())
        }
    }

    fn notification() -> Notification {
        Notification {
            recipient: "alice@example.com".to_owned(),
            subject: "Welcome".to_owned(),
            body: "Hello".to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_delivered() {
        let notifier = FlakyNotifier {
            failures: 2,
            calls: AtomicU32::new(0),
        };

        assert!(deliver(&notifier, &notification()).await.is_ok());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_last_attempt() {
        let notifier = FlakyNotifier {
            failures: 10,
            calls: AtomicU32::new(0),
        };

        assert!(deliver(&notifier, &notification()).await.is_err());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), DELIVERY_ATTEMPTS);
    }

    #[test]
    fn validates_fields() {
        let mut bad = notification();
        bad.recipient = "not-an-address".to_owned();
        bad.subject = " ".to_owned();

        let errors = bad.validate();
        assert_eq!(errors.get("recipient"), Some(&"must be a valid email address"));
        assert_eq!(errors.get("subject"), Some(&"must be provided"));
        assert!(notification().validate().is_empty());
    }
}
