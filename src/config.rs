use std::env;
use std::time::Duration;

use crate::errors::Result;

const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

/// Runtime settings, loaded once from the environment at startup and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub kafka_brokers: String,
    /// Regex pattern subscription covering all tenant event topics.
    pub kafka_topic_pattern: String,
    /// Concrete topic created at startup so the subscription has a live target.
    pub kafka_bootstrap_topic: String,
    pub kafka_dlq_topic: String,
    /// Durable consumer identity; the committed offset for this group is the
    /// resume position across restarts.
    pub kafka_group_id: String,
    pub clickhouse_url: String,
    pub clickhouse_db: String,
    pub http_port: u16,
    pub poll_timeout: Duration,
    /// Seconds a triggered (tenant, actor) pair stays suppressed. 0 means the
    /// suppression never expires for the process lifetime.
    pub suppression_ttl_secs: u64,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            kafka_brokers: env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            kafka_topic_pattern: env::var("KAFKA_TOPIC_PATTERN")
                .unwrap_or_else(|_| r"^normalized\.events\..*".to_string()),
            kafka_bootstrap_topic: env::var("KAFKA_BOOTSTRAP_TOPIC")
                .unwrap_or_else(|_| "normalized.events.default".to_string()),
            kafka_dlq_topic: env::var("KAFKA_DLQ_TOPIC")
                .unwrap_or_else(|_| "detect.deadletter".to_string()),
            kafka_group_id: env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| "detect-service".to_string()),
            clickhouse_url: env::var("CLICKHOUSE_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string()),
            clickhouse_db: env::var("CLICKHOUSE_DB").unwrap_or_else(|_| "dev".to_string()),
            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            poll_timeout: Duration::from_millis(
                env::var("POLL_TIMEOUT_MS")
                    .unwrap_or_else(|_| DEFAULT_POLL_TIMEOUT_MS.to_string())
                    .parse()
                    .unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
            ),
            suppression_ttl_secs: env::var("SUPPRESSION_TTL_SECS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}
