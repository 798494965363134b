#![allow(dead_code)]

use async_trait::async_trait;
use kafka_pipeline::config::{Config, ConsumerConfig, KafkaConfig, ProducerConfig};
use kafka_pipeline::consumer::{ConsumedEvent, EventHandler};
use serde_json::{json, Value};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("kafka_pipeline=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    let kafka = KafkaConfig {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        client_id: format!("kafka-pipeline-test-{}", std::process::id()),
        acks: "all".to_string(),
        enable_idempotence: true,
        transactional_id: None,
        transaction_timeout_ms: 10_000,
    };

    let mut producer = ProducerConfig::new(format!("test_{}", std::process::id()));
    producer.settings.compression = "none".to_string(); // No compression for tests

    let consumer = ConsumerConfig {
        group_id: format!("test_group_{}", std::process::id()),
        from_beginning: true,
        retry_backoff_ms: 10,
        ..Default::default()
    };

    Config {
        kafka,
        producer,
        consumer,
    }
}

pub fn event(id: &str) -> Value {
    json!({
        "id": id,
        "type": "order.created",
        "timestamp": "2024-05-01T10:00:00Z",
        "data": {"orderId": id, "amount": 42}
    })
}

pub fn event_bytes(id: &str) -> Vec<u8> {
    serde_json::to_vec(&event(id)).unwrap()
}

/// Records every event it is handed.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &ConsumedEvent) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.id.clone());
        Ok(())
    }
}

/// Fails the first `failures` calls, then succeeds.
pub struct FlakyHandler {
    failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(&self, event: &ConsumedEvent) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("downstream unavailable for {}", event.id);
        }
        Ok(())
    }
}
