//! Rule-based threat detection engine.
//!
//! Consumes normalized security events from a durable Kafka subscription,
//! evaluates them against a set of stateful detection rules sharing one
//! windowed state store, and publishes the resulting alerts to
//! tenant-partitioned ClickHouse tables. Rules are isolated from each
//! other: a failing rule loses only its own alerts for that event.

pub mod alerts;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod errors;
pub mod http;
pub mod models;
pub mod rules;
pub mod state;
