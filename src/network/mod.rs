// Controller network access
// The Controller trait is the seam between the control loop and a live instance

pub mod client;

pub use client::HomeAssistantClient;

use crate::error::MedicResult;
use crate::state::EntityState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Synchronous query and command surface of one controller instance
#[async_trait]
pub trait Controller: Send + Sync {
    /// Full current-state snapshot
    async fn get_states(&self) -> MedicResult<Vec<EntityState>>;

    async fn get_state(&self, entity_id: &str) -> MedicResult<EntityState>;

    /// Invoke `<domain>.<service>` with a JSON payload
    async fn call_service(&self, domain: &str, service: &str, data: serde_json::Value) -> MedicResult<()>;

    /// Reload one integration config entry
    async fn reload_config_entry(&self, entry_id: &str) -> MedicResult<()>;

    async fn create_notification(
        &self,
        title: &str,
        message: &str,
        notification_id: Option<&str>,
    ) -> MedicResult<()>;

    /// Recorded states of one entity since `start`, oldest first
    async fn history(&self, entity_id: &str, start: DateTime<Utc>) -> MedicResult<Vec<EntityState>>;
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`
///
/// `attempt` is 1-based; attempt 0 is treated as 1.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_secs(60);

        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_cap() {
        let delay = backoff_delay(10, Duration::from_millis(1000), Duration::from_secs(10));
        assert_eq!(delay, Duration::from_secs(10));

        let huge = backoff_delay(u32::MAX, Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(huge, Duration::from_secs(300));
    }
}
