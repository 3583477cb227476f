use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::models::{Alert, Event};
use crate::rules::DetectionRule;
use crate::state::{StateStore, StoreStats};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub rules_loaded: usize,
    pub state_store: StoreStats,
}

/// Runs the configured rule set against each incoming event.
///
/// Failure containment is the core property here: a rule that errors is
/// logged and skipped, and can at most lose its own alerts for that event.
/// It never fails the other rules or the event itself.
pub struct DetectionEngine {
    state: Arc<StateStore>,
    rules: Vec<Box<dyn DetectionRule>>,
}

impl DetectionEngine {
    pub fn new(state: Arc<StateStore>, rules: Vec<Box<dyn DetectionRule>>) -> Self {
        info!("detection engine initialized: rules_count={}", rules.len());
        DetectionEngine { state, rules }
    }

    /// Evaluate every rule against `event` and collect the generated alerts
    /// in rule order. Events that cannot be attributed to a tenant are
    /// dropped before any rule runs.
    pub async fn process_event(&self, event: &Event) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let tenant_id = match event.tenant_id.as_deref() {
            Some(id) => id,
            None => {
                warn!("event missing tenant_id: event_id={:?}", event.event_id);
                return alerts;
            }
        };

        for rule in &self.rules {
            let triggered = match rule.evaluate(event).await {
                Ok(triggered) => triggered,
                Err(e) => {
                    error!(
                        "rule evaluation failed: rule={} tenant_id={} event_id={:?} error={}",
                        rule.name(),
                        tenant_id,
                        event.event_id,
                        e
                    );
                    continue;
                }
            };
            if !triggered {
                continue;
            }

            match rule.generate_alert(event).await {
                Ok(Some(alert)) => {
                    info!(
                        "alert generated: tenant_id={} rule={} alert_id={} severity={}",
                        tenant_id, alert.rule_name, alert.alert_id, alert.severity
                    );
                    alerts.push(alert);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "alert generation failed: rule={} tenant_id={} event_id={:?} error={}",
                        rule.name(),
                        tenant_id,
                        event.event_id,
                        e
                    );
                }
            }
        }

        alerts
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            rules_loaded: self.rules.len(),
            state_store: self.state.stats(),
        }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{DetectError, Result};
    use crate::models::Entity;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Map};

    struct FailingRule;

    #[async_trait]
    impl DetectionRule for FailingRule {
        fn name(&self) -> &str {
            "failing_rule"
        }

        async fn evaluate(&self, _event: &Event) -> Result<bool> {
            Err(DetectError::Config("boom".to_string()))
        }

        async fn generate_alert(&self, _event: &Event) -> Result<Option<Alert>> {
            Ok(None)
        }
    }

    /// Fires on every attributed event; stands in for a healthy rule.
    struct AlwaysRule;

    #[async_trait]
    impl DetectionRule for AlwaysRule {
        fn name(&self) -> &str {
            "always_rule"
        }

        async fn evaluate(&self, _event: &Event) -> Result<bool> {
            Ok(true)
        }

        async fn generate_alert(&self, event: &Event) -> Result<Option<Alert>> {
            Ok(Some(Alert {
                tenant_id: event.tenant_id.clone().unwrap_or_default(),
                alert_id: "fixed".to_string(),
                timestamp: Utc::now(),
                severity: 1,
                rule_name: "always_rule".to_string(),
                rule_description: "fires on every event".to_string(),
                actor: Some(Entity::default()),
                target: None,
                details: Map::new(),
                related_events: vec![],
                tags: vec![],
            }))
        }
    }

    fn attributed_event() -> Event {
        serde_json::from_value(json!({
            "tenant_id": "tenant-a",
            "event_id": "evt1",
            "category": "auth"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn drops_events_without_tenant() {
        let engine = DetectionEngine::new(
            Arc::new(StateStore::new()),
            vec![Box::new(AlwaysRule)],
        );
        let event = Event::default();
        assert!(engine.process_event(&event).await.is_empty());
    }

    #[tokio::test]
    async fn failing_rule_does_not_block_others() {
        let engine = DetectionEngine::new(
            Arc::new(StateStore::new()),
            vec![Box::new(FailingRule), Box::new(AlwaysRule)],
        );
        let alerts = engine.process_event(&attributed_event()).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_name, "always_rule");
    }

    #[tokio::test]
    async fn alerts_preserve_rule_order() {
        let engine = DetectionEngine::new(
            Arc::new(StateStore::new()),
            vec![Box::new(AlwaysRule), Box::new(AlwaysRule)],
        );
        let alerts = engine.process_event(&attributed_event()).await;
        assert_eq!(alerts.len(), 2);
    }

    #[tokio::test]
    async fn stats_reports_rule_count() {
        let engine = DetectionEngine::new(
            Arc::new(StateStore::new()),
            vec![Box::new(AlwaysRule)],
        );
        let stats = engine.stats();
        assert_eq!(stats.rules_loaded, 1);
        assert_eq!(stats.state_store.key_count, 0);
    }
}
