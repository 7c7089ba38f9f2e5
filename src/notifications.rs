use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Trait for customer-facing notification delivery. Callers treat delivery
/// as best-effort; a failure is logged by the event loop, never surfaced to
/// the request that triggered it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, contact: &str, message: &str) -> Result<(), NotifyError>;
}

/// Notifier that writes the message to the application log. Stands in for a
/// real mail or SMS provider.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, contact: &str, message: &str) -> Result<(), NotifyError> {
        info!(contact = %contact, "Notification: {}", message);
        Ok(())
    }
}
