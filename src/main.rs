use anyhow::Result;
use log::{error, info};
use std::sync::Arc;

use siem_detect::alerts::ClickHouseAlertSink;
use siem_detect::config::Config;
use siem_detect::consumer::EventConsumer;
use siem_detect::engine::DetectionEngine;
use siem_detect::http::{self, AppState};
use siem_detect::rules;
use siem_detect::state::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env()?);
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    info!("starting detection engine");
    info!("  Kafka brokers: {}", config.kafka_brokers);
    info!("  Topic pattern: {}", config.kafka_topic_pattern);
    info!("  Consumer group: {}", config.kafka_group_id);
    info!("  ClickHouse URL: {}", config.clickhouse_url);

    let state = Arc::new(StateStore::new());
    let rule_set = rules::active_rules(state.clone(), &config);
    let engine = Arc::new(DetectionEngine::new(state, rule_set));
    let sink = Arc::new(ClickHouseAlertSink::new(&config));
    let consumer = Arc::new(EventConsumer::new(config.clone(), engine.clone(), sink)?);

    let app_state = AppState {
        engine: engine.clone(),
        consumer: consumer.clone(),
    };
    let http_port = config.http_port;
    tokio::spawn(async move {
        if let Err(e) = http::serve(app_state, http_port).await {
            error!("http server error: {}", e);
        }
    });

    let shutdown = consumer.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.stop();
        }
    });

    consumer.start().await?;

    info!("detection engine stopped");
    Ok(())
}
