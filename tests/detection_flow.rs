//! End-to-end pipeline flow without a broker: events run through the
//! detection engine and generated alerts land in a recording sink.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};

use siem_detect::alerts::AlertSink;
use siem_detect::config::Config;
use siem_detect::engine::DetectionEngine;
use siem_detect::errors::Result;
use siem_detect::models::{decode_event, Alert, Event};
use siem_detect::rules;
use siem_detect::state::StateStore;

/// Records published alerts instead of writing them anywhere.
#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn publish(&self, alert: &Alert) -> Result<()> {
        self.published.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

fn build_engine() -> (Arc<StateStore>, DetectionEngine) {
    let config = Config::from_env().unwrap();
    let state = Arc::new(StateStore::new());
    let rule_set = rules::active_rules(state.clone(), &config);
    (state.clone(), DetectionEngine::new(state, rule_set))
}

fn failed_login_event(event_id: &str) -> Event {
    serde_json::from_value(json!({
        "tenant_id": "tenant-a",
        "event_id": event_id,
        "timestamp": "2024-01-01T00:00:00Z",
        "category": "auth",
        "outcome": "failure",
        "actor": {"type": "user", "id": "user123", "name": "John Doe"},
        "attributes": {"failed_login_count": 1, "source_ip": "1.2.3.4"}
    }))
    .unwrap()
}

#[tokio::test]
async fn brute_force_burst_produces_one_published_alert() {
    let (_, engine) = build_engine();
    let sink = RecordingSink::default();

    for i in 0..12 {
        let event = failed_login_event(&format!("evt{}", i));
        for alert in engine.process_event(&event).await {
            sink.publish(&alert).await.unwrap();
        }
    }

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 1, "one alert for the whole burst");
    let alert = &published[0];
    assert_eq!(alert.tenant_id, "tenant-a");
    assert_eq!(alert.rule_name, "failed_login_threshold");
    assert_eq!(alert.severity, 8);
    assert_eq!(alert.related_events.len(), 10);
    assert!(!alert.alert_id.is_empty());
}

#[tokio::test]
async fn unattributed_events_are_dropped_before_rules() {
    let (state, engine) = build_engine();

    let event: Event = serde_json::from_value(json!({
        "event_id": "evt1",
        "category": "auth",
        "actor": {"id": "user123"},
        "attributes": {"failed_login_count": 1}
    }))
    .unwrap();

    let alerts = engine.process_event(&event).await;
    assert!(alerts.is_empty());
    assert_eq!(state.stats().total_entries, 0, "no rule saw the event");
}

#[tokio::test]
async fn malformed_payload_never_reaches_the_engine() {
    let (state, engine) = build_engine();

    // The consumer decodes before calling the engine; a decode failure is
    // dead-lettered and processing stops there.
    let decoded = decode_event(b"{\"tenant_id\": ");
    assert!(decoded.is_err());

    assert_eq!(state.stats().total_entries, 0);
    assert_eq!(engine.stats().state_store.key_count, 0);
}

#[tokio::test]
async fn alerts_for_different_tenants_stay_separate() {
    let (_, engine) = build_engine();
    let sink = RecordingSink::default();

    for tenant in ["tenant-a", "tenant-b"] {
        for i in 0..10 {
            let event: Event = serde_json::from_value(json!({
                "tenant_id": tenant,
                "event_id": format!("{}-{}", tenant, i),
                "category": "auth",
                "outcome": "failure",
                "actor": {"id": "user123"},
                "attributes": {"failed_login_count": 1, "source_ip": "9.9.9.9"}
            }))
            .unwrap();
            for alert in engine.process_event(&event).await {
                sink.publish(&alert).await.unwrap();
            }
        }
    }

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].tenant_id, "tenant-a");
    assert_eq!(published[1].tenant_id, "tenant-b");
    assert_ne!(published[0].alert_id, published[1].alert_id);
}
