use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::errors::Result;
use crate::models::{Alert, Event};
use crate::state::StateStore;

pub mod failed_login;

pub use failed_login::FailedLoginRule;

/// A unit of detection logic. One value per rule is constructed at startup,
/// bound to the shared state store, and reused for every event the process
/// sees. All cross-event memory a rule needs lives in the store, so rules
/// stay correct if events are ever evaluated concurrently.
#[async_trait]
pub trait DetectionRule: Send + Sync {
    fn name(&self) -> &str;

    /// Decide whether `event` should raise an alert now, updating windowed
    /// state as a side effect. Missing optional fields are a non-match,
    /// never an error.
    async fn evaluate(&self, event: &Event) -> Result<bool>;

    /// Build the alert for an event `evaluate` just returned true for. Reads
    /// the same correlation key and window as `evaluate` to assemble
    /// context, without appending again.
    async fn generate_alert(&self, event: &Event) -> Result<Option<Alert>>;
}

/// The active rule set, in evaluation order.
pub fn active_rules(state: Arc<StateStore>, config: &Config) -> Vec<Box<dyn DetectionRule>> {
    vec![Box::new(FailedLoginRule::new(
        state,
        config.suppression_ttl_secs,
    ))]
}
