mod common;

use bytes::Bytes;
use common::init_tracing;
use kafka_pipeline::broker::{MemoryBroker, Message, Record};
use kafka_pipeline::config::ProducerConfig;
use kafka_pipeline::kafka::StringSerializer;
use kafka_pipeline::metadata::{MetadataManager, MetadataOverrides};
use kafka_pipeline::partitioner::{string_hash, CustomPartitioner};
use kafka_pipeline::producer::{OutgoingMessage, ProducerPipeline};
use kafka_pipeline::routing::RoutingRule;
use kafka_pipeline::schema::JsonSchema;
use kafka_pipeline::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn orders_config() -> ProducerConfig {
    ProducerConfig::new("orders")
}

fn messages(count: usize) -> Vec<OutgoingMessage> {
    (0..count)
        .map(|i| OutgoingMessage::new(json!({"orderId": i})))
        .collect()
}

/// Partitioner that always asks for a partition far out of range, exposing
/// the partition count the pipeline resolved.
fn max_partition() -> Box<CustomPartitioner> {
    Box::new(CustomPartitioner::new("max", |_| i64::MAX))
}

#[tokio::test]
async fn test_batch_is_chunked_in_order() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    let mut config = orders_config();
    config.settings.max_batch_size = 3;
    let pipeline = ProducerPipeline::new(broker.clone(), config);

    let report = pipeline.send_batch(messages(7)).await.unwrap();

    assert_eq!(broker.batch_sizes(), vec![3, 3, 1]);
    assert_eq!(report.chunk_sizes, vec![3, 3, 1]);
    assert_eq!(report.message_count, 7);
    assert_eq!(report.topic, "orders");

    let order: Vec<Bytes> = broker
        .sent()
        .into_iter()
        .flat_map(|batch| batch.records.into_iter().map(|r| r.value))
        .collect();
    let expected: Vec<Bytes> = (0..7)
        .map(|i| Bytes::from(format!(r#"{{"orderId":{}}}"#, i)))
        .collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn test_invalid_item_aborts_whole_batch() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = orders_config();
    config.enable_validation = true;
    let pipeline = ProducerPipeline::new(broker.clone(), config)
        .with_validator(Box::new(JsonSchema::new().require("orderId")));

    let mut items = messages(4);
    items.push(OutgoingMessage::new(json!({"sku": "missing-order-id"})));

    let err = pipeline.send_batch(items).await.unwrap_err();
    assert!(matches!(err, Error::Validation(ref reason) if reason.contains("orderId")));
    assert_eq!(broker.send_calls(), 0);
}

#[tokio::test]
async fn test_invalid_message_fails_before_send() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = orders_config();
    config.enable_validation = true;
    let pipeline = ProducerPipeline::new(broker.clone(), config).with_validator(Box::new(JsonSchema::new()));

    let err = pipeline
        .send_message(OutgoingMessage::new(json!(42)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(broker.send_calls(), 0);
}

#[tokio::test]
async fn test_serialization_failure_fails_before_send() {
    let broker = Arc::new(MemoryBroker::new());
    let pipeline =
        ProducerPipeline::new(broker.clone(), orders_config()).with_serializer(Box::new(StringSerializer));

    let err = pipeline
        .send_message(OutgoingMessage::new(json!({"not": "a string"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
    assert_eq!(broker.send_calls(), 0);

    pipeline
        .send_message(OutgoingMessage::new(json!("plain text")))
        .await
        .unwrap();
    assert_eq!(broker.sent()[0].records[0].value, Bytes::from_static(b"plain text"));
}

#[tokio::test]
async fn test_routing_selects_topic() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = ProducerConfig::new("fallback");
    config.enable_routing = true;
    let mut pipeline = ProducerPipeline::new(broker.clone(), config);

    pipeline.add_routing_rule(RoutingRule::path_equals(
        "alerts",
        "type",
        json!("alert"),
        "alerts",
        100,
    ));
    pipeline.add_routing_rule(RoutingRule::new("catch-all", "general", 50, |_, _| Ok(true)));

    let alert = pipeline
        .send_message(OutgoingMessage::new(json!({"type": "alert"})))
        .await
        .unwrap();
    let info = pipeline
        .send_message(OutgoingMessage::new(json!({"type": "info"})))
        .await
        .unwrap();

    assert_eq!(alert.topic, "alerts");
    assert_eq!(info.topic, "general");
    let topics: Vec<String> = broker.sent().into_iter().map(|b| b.topic).collect();
    assert_eq!(topics, vec!["alerts", "general"]);
}

#[tokio::test]
async fn test_rules_ignored_when_routing_disabled() {
    let broker = Arc::new(MemoryBroker::new());
    let mut pipeline = ProducerPipeline::new(broker.clone(), orders_config());
    pipeline.add_routing_rule(RoutingRule::new("everything", "elsewhere", 1, |_, _| Ok(true)));

    let receipt = pipeline
        .send_message(OutgoingMessage::new(json!({"type": "alert"})))
        .await
        .unwrap();
    assert_eq!(receipt.topic, "orders");
}

#[tokio::test]
async fn test_header_precedence() {
    let broker = Arc::new(MemoryBroker::new());
    let mut pipeline = ProducerPipeline::new(broker.clone(), orders_config());
    pipeline.set_default_metadata(
        MetadataOverrides::default()
            .with_message_type("order.created")
            .with_custom_header("tenant", "default")
            .with_custom_header("region", "eu"),
    );

    let receipt = pipeline
        .send_message(
            OutgoingMessage::new(json!({"orderId": 1}))
                .with_metadata(
                    MetadataOverrides::default()
                        .with_correlation_id("corr-fixed")
                        .with_priority(7)
                        .with_custom_header("tenant", "override"),
                )
                .with_header("x-custom-region", "caller")
                .with_header("trace", "abc"),
        )
        .await
        .unwrap();

    let headers = &broker.sent()[0].records[0].headers;
    assert_eq!(headers["x-custom-tenant"], Bytes::from_static(b"override"));
    assert_eq!(headers["x-custom-region"], Bytes::from_static(b"caller"));
    assert_eq!(headers["trace"], Bytes::from_static(b"abc"));
    assert_eq!(headers["x-msg-correlationId"], Bytes::from_static(b"corr-fixed"));

    let decoded = MetadataManager::headers_to_metadata(headers);
    assert_eq!(decoded.message_id, receipt.metadata.message_id);
    assert_eq!(decoded.correlation_id, "corr-fixed");
    assert_eq!(decoded.priority, Some(7));
    assert_eq!(decoded.message_type.as_deref(), Some("order.created"));
    assert_eq!(decoded.timestamp, receipt.metadata.timestamp);
}

#[tokio::test]
async fn test_partition_uses_broker_count() {
    let broker = Arc::new(MemoryBroker::new().with_partitions("orders", 6));
    let mut config = orders_config();
    config.enable_partitioning = true;
    let pipeline = ProducerPipeline::new(broker.clone(), config);

    let receipt = pipeline
        .send_message(OutgoingMessage::new(json!({"orderId": 1})).with_key("customer-7"))
        .await
        .unwrap();

    let expected = (string_hash("customer-7").unsigned_abs() % 6) as i32;
    assert_eq!(receipt.partition, Some(expected));
    assert_eq!(broker.sent()[0].records[0].partition, Some(expected));
    assert_eq!(broker.sent()[0].records[0].key, Some(Bytes::from_static(b"customer-7")));
}

#[tokio::test]
async fn test_partition_lookup_failure_falls_back() {
    let broker = Arc::new(MemoryBroker::new().fail_metadata());
    let pipeline = ProducerPipeline::new(broker.clone(), orders_config()).with_partitioner(max_partition());

    let receipt = pipeline
        .send_message(OutgoingMessage::new(json!({"orderId": 1})))
        .await
        .unwrap();
    assert_eq!(receipt.partition, Some(2));
}

#[tokio::test]
async fn test_partition_lookup_timeout_falls_back() {
    let broker = Arc::new(
        MemoryBroker::new()
            .with_partitions("orders", 12)
            .with_metadata_delay(Duration::from_secs(2)),
    );
    let mut config = orders_config();
    config.partition_lookup_timeout_ms = 50;
    let pipeline = ProducerPipeline::new(broker.clone(), config).with_partitioner(max_partition());

    let started = Instant::now();
    let report = pipeline.send_batch(messages(4)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(report.message_count, 4);
    for record in &broker.sent()[0].records {
        assert_eq!(record.partition, Some(2));
    }
}

#[tokio::test]
async fn test_linger_between_chunks() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = orders_config();
    config.settings.max_batch_size = 2;
    config.settings.linger_ms = 40;
    let pipeline = ProducerPipeline::new(broker.clone(), config);

    let started = Instant::now();
    pipeline.send_batch(messages(5)).await.unwrap();

    // three chunks, two pauses
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert_eq!(broker.batch_sizes(), vec![2, 2, 1]);
}

#[tokio::test]
async fn test_failed_chunk_aborts_remaining() {
    let broker = Arc::new(MemoryBroker::new().fail_send_at(1));
    let mut config = orders_config();
    config.settings.max_batch_size = 3;
    let pipeline = ProducerPipeline::new(broker.clone(), config);

    let err = pipeline.send_batch(messages(7)).await.unwrap_err();
    assert!(matches!(err, Error::Send { ref topic, .. } if topic == "orders"));
    assert_eq!(broker.send_calls(), 2);
    assert_eq!(broker.batch_sizes(), vec![3]);
}

#[tokio::test]
async fn test_configuration_update_applies_to_next_batch() {
    let broker = Arc::new(MemoryBroker::new());
    let mut pipeline = ProducerPipeline::new(broker.clone(), orders_config());

    pipeline.send_batch(messages(5)).await.unwrap();
    pipeline.set_max_batch_size(2);
    pipeline.send_batch(messages(5)).await.unwrap();

    assert_eq!(broker.batch_sizes(), vec![5, 2, 2, 1]);
    assert_eq!(pipeline.settings().max_batch_size, 2);
}

#[tokio::test]
async fn test_send_in_transaction_requires_transactions() {
    let broker = Arc::new(MemoryBroker::new());
    let mut pipeline = ProducerPipeline::new(broker.clone(), orders_config());

    let result = pipeline
        .send_in_transaction(|sender| async move {
            sender
                .send(vec![Message::new("orders", Record::new("x"))])
                .await
        })
        .await;
    assert!(matches!(result, Err(Error::TransactionsDisabled)));
    assert_eq!(broker.send_calls(), 0);
}

#[tokio::test]
async fn test_send_in_transaction_commits() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = orders_config();
    config.enable_transactions = true;
    let mut pipeline = ProducerPipeline::new(broker.clone(), config);

    let outcome = pipeline
        .send_in_transaction(|sender| async move {
            sender
                .send(vec![
                    Message::new("orders", Record::new("a")),
                    Message::new("audit", Record::new("b")),
                    Message::new("orders", Record::new("c")),
                ])
                .await?;
            Ok(sender.message_count())
        })
        .await
        .unwrap();

    assert!(outcome.is_committed());
    assert_eq!(outcome.result().message_count, 3);
    assert_eq!(outcome.into_result().unwrap(), 3);
    assert_eq!(broker.commits(), 1);
    assert!(broker.sent().iter().all(|batch| batch.transactional));
    assert!(!pipeline.transactions().unwrap().is_transaction_active());
}
