use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{Alert, Entity, Event};
use crate::rules::DetectionRule;
use crate::state::StateStore;

pub const RULE_NAME: &str = "failed_login_threshold";

const THRESHOLD: usize = 10;
const WINDOW_SECONDS: u64 = 300;

/// Detects repeated failed login attempts against one actor.
///
/// Matches auth events carrying a positive `failed_login_count` whose
/// outcome, if present, is not "success". Observations accumulate per
/// `(tenant, actor)` in a 300 second window; reaching 10 in-window attempts
/// triggers once, after which the pair is suppressed. Suppression is itself
/// a store entry keyed by purpose, so it is shared across workers and
/// expires after the configured TTL (0 = never).
pub struct FailedLoginRule {
    state: Arc<StateStore>,
    suppression_ttl_secs: u64,
}

impl FailedLoginRule {
    pub fn new(state: Arc<StateStore>, suppression_ttl_secs: u64) -> Self {
        FailedLoginRule {
            state,
            suppression_ttl_secs,
        }
    }

    fn window_key(tenant_id: &str, actor_id: &str) -> String {
        format!("{}:failed_login:{}", tenant_id, actor_id)
    }

    fn suppression_key(tenant_id: &str, actor_id: &str) -> String {
        format!("{}:failed_login:suppressed:{}", tenant_id, actor_id)
    }

    fn suppression_window(&self) -> u64 {
        if self.suppression_ttl_secs == 0 {
            u64::MAX
        } else {
            self.suppression_ttl_secs
        }
    }

    fn is_suppressed(&self, tenant_id: &str, actor_id: &str) -> bool {
        let key = Self::suppression_key(tenant_id, actor_id);
        self.state.count(&key, self.suppression_window()) > 0
    }

    fn mark_suppressed(&self, tenant_id: &str, actor_id: &str, event: &Event) {
        let key = Self::suppression_key(tenant_id, actor_id);
        let mut fields = Map::new();
        fields.insert("triggered_by".to_string(), json!(event.event_id));
        self.state
            .append_and_list(&key, fields, self.suppression_window());
    }
}

#[async_trait]
impl DetectionRule for FailedLoginRule {
    fn name(&self) -> &str {
        RULE_NAME
    }

    async fn evaluate(&self, event: &Event) -> Result<bool> {
        if event.category.as_deref() != Some("auth") {
            return Ok(false);
        }

        if event.attr_u64("failed_login_count").unwrap_or(0) == 0 {
            return Ok(false);
        }

        if event.outcome.as_deref() == Some("success") {
            return Ok(false);
        }

        let actor_id = match event.actor_id() {
            Some(id) => id,
            None => {
                debug!(
                    "event missing actor information: event_id={:?}",
                    event.event_id
                );
                return Ok(false);
            }
        };
        let tenant_id = match event.tenant_id.as_deref() {
            Some(id) => id,
            None => return Ok(false),
        };

        let mut fields = Map::new();
        fields.insert("event_id".to_string(), json!(event.event_id));
        fields.insert("timestamp".to_string(), json!(event.timestamp));
        fields.insert("source_ip".to_string(), json!(event.attr_str("source_ip")));

        let key = Self::window_key(tenant_id, actor_id);
        let in_window = self.state.append_and_list(&key, fields, WINDOW_SECONDS);

        debug!(
            "failed login count: tenant_id={} actor_id={} count={} threshold={}",
            tenant_id,
            actor_id,
            in_window.len(),
            THRESHOLD
        );

        if in_window.len() < THRESHOLD {
            return Ok(false);
        }

        if self.is_suppressed(tenant_id, actor_id) {
            debug!("already alerted for actor: actor_id={}", actor_id);
            return Ok(false);
        }

        self.mark_suppressed(tenant_id, actor_id, event);
        Ok(true)
    }

    async fn generate_alert(&self, event: &Event) -> Result<Option<Alert>> {
        let tenant_id = match event.tenant_id.as_deref() {
            Some(id) => id,
            None => return Ok(None),
        };
        let actor = event.actor.clone().unwrap_or_default();
        let actor_id = match actor.id.clone() {
            Some(id) => id,
            None => return Ok(None),
        };

        let key = Self::window_key(tenant_id, &actor_id);
        let recent = self.state.list_in_window(&key, WINDOW_SECONDS);

        let related_events: Vec<String> = recent
            .iter()
            .filter_map(|e| e.field_str("event_id").map(str::to_string))
            .take(10)
            .collect();

        let mut seen = HashSet::new();
        let source_ips: Vec<String> = recent
            .iter()
            .filter_map(|e| e.field_str("source_ip"))
            .filter(|ip| seen.insert(ip.to_string()))
            .map(str::to_string)
            .collect();

        let mut details = Map::new();
        details.insert("failed_login_count".to_string(), json!(recent.len()));
        details.insert("threshold".to_string(), json!(THRESHOLD));
        details.insert("window_minutes".to_string(), json!(WINDOW_SECONDS / 60));
        details.insert("source_ips".to_string(), json!(source_ips));
        details.insert(
            "first_attempt".to_string(),
            json!(recent.first().and_then(|e| e.field_str("timestamp"))),
        );
        details.insert("last_attempt".to_string(), json!(event.timestamp));

        Ok(Some(Alert {
            tenant_id: tenant_id.to_string(),
            alert_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            severity: 8,
            rule_name: RULE_NAME.to_string(),
            rule_description: format!(
                "Detected {} failed login attempts in {} minutes",
                recent.len(),
                WINDOW_SECONDS / 60
            ),
            actor: Some(Entity {
                entity_type: actor.entity_type.or_else(|| Some("user".to_string())),
                id: Some(actor_id.clone()),
                name: actor.name.or_else(|| Some(actor_id.clone())),
            }),
            target: event.target.clone(),
            details,
            related_events,
            tags: vec![
                "brute-force".to_string(),
                "authentication".to_string(),
                "failed-login".to_string(),
            ],
        }))
    }
}
