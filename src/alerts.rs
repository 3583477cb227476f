use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::config::Config;
use crate::errors::{DetectError, Result};
use crate::models::Alert;

/// Durable, tenant-partitioned destination for generated alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish(&self, alert: &Alert) -> Result<()>;
}

/// Publishes alerts to ClickHouse over HTTP, one table per tenant.
///
/// Tables use ReplacingMergeTree ordered by alert_id, so a redelivered
/// message that regenerates an alert with the same id collapses to a single
/// stored row. Table creation runs before the first write for a tenant and
/// is idempotent.
pub struct ClickHouseAlertSink {
    client: Client,
    url: String,
    database: String,
    ensured: Mutex<HashSet<String>>,
}

/// Flat row shape for JSONEachRow inserts; nested objects go in as JSON
/// strings and the timestamp as epoch seconds.
#[derive(Serialize)]
struct AlertRow<'a> {
    tenant_id: &'a str,
    alert_id: &'a str,
    timestamp: u32,
    severity: u8,
    rule_name: &'a str,
    rule_description: &'a str,
    actor: String,
    target: String,
    details: String,
    related_events: &'a [String],
    tags: &'a [String],
}

impl ClickHouseAlertSink {
    pub fn new(config: &Config) -> Self {
        info!("ClickHouse alert sink initialized: url={}", config.clickhouse_url);
        ClickHouseAlertSink {
            client: Client::new(),
            url: config.clickhouse_url.clone(),
            database: config.clickhouse_db.clone(),
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Table name for a tenant, restricted to identifier-safe characters.
    fn tenant_table(tenant_id: &str) -> String {
        let sanitized: String = tenant_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("alerts_{}", sanitized)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let query = format!("EXISTS TABLE {}.{}", self.database, table);
        let url = format!("{}/?query={}", self.url, urlencoding::encode(&query));
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body = response.text().await?;
        Ok(body.trim() == "1")
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        {
            let ensured = self.ensured.lock().unwrap();
            if ensured.contains(table) {
                return Ok(());
            }
        }

        if !self.table_exists(table).await? {
            let ddl = format!(
                r#"CREATE TABLE IF NOT EXISTS {}.{} (
                    tenant_id String,
                    alert_id String,
                    timestamp DateTime,
                    severity UInt8,
                    rule_name String,
                    rule_description String,
                    actor String,
                    target String,
                    details String,
                    related_events Array(String),
                    tags Array(String)
                ) ENGINE = ReplacingMergeTree
                ORDER BY alert_id"#,
                self.database, table
            );

            let response = self.client.post(&self.url).body(ddl).send().await?;
            if response.status().is_success() {
                info!("created alert table: table={}", table);
            } else {
                // A concurrent writer may have won the race; IF NOT EXISTS
                // makes that a non-event, anything else is a real failure.
                let text = response.text().await.unwrap_or_default();
                if text.contains("already exists") {
                    debug!("alert table already exists: table={}", table);
                } else {
                    return Err(DetectError::ClickHouse(format!(
                        "failed to create alert table {}: {}",
                        table, text
                    )));
                }
            }
        }

        self.ensured.lock().unwrap().insert(table.to_string());
        Ok(())
    }
}

#[async_trait]
impl AlertSink for ClickHouseAlertSink {
    async fn publish(&self, alert: &Alert) -> Result<()> {
        if alert.tenant_id.is_empty() {
            warn!("alert missing tenant_id: alert_id={}", alert.alert_id);
            return Ok(());
        }

        let table = Self::tenant_table(&alert.tenant_id);
        self.ensure_table(&table).await?;

        let row = AlertRow {
            tenant_id: &alert.tenant_id,
            alert_id: &alert.alert_id,
            timestamp: alert.timestamp.timestamp() as u32,
            severity: alert.severity,
            rule_name: &alert.rule_name,
            rule_description: &alert.rule_description,
            actor: serde_json::to_string(&alert.actor)?,
            target: serde_json::to_string(&alert.target)?,
            details: serde_json::to_string(&alert.details)?,
            related_events: &alert.related_events,
            tags: &alert.tags,
        };

        let query = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            self.database, table
        );
        let response = self
            .client
            .post(&self.url)
            .query(&[("query", &query)])
            .body(serde_json::to_string(&row)?)
            .send()
            .await?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DetectError::ClickHouse(format!(
                "failed to insert alert {}: {}",
                alert.alert_id, text
            )));
        }

        info!(
            "alert published: tenant_id={} alert_id={} table={}",
            alert.tenant_id, alert.alert_id, table
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_table_sanitizes_identifiers() {
        assert_eq!(
            ClickHouseAlertSink::tenant_table("tenant-a"),
            "alerts_tenant_a"
        );
        assert_eq!(
            ClickHouseAlertSink::tenant_table("acme; DROP TABLE"),
            "alerts_acme__DROP_TABLE"
        );
        assert_eq!(ClickHouseAlertSink::tenant_table("t1"), "alerts_t1");
    }
}
