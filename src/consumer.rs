//! Consumer-side processing pipeline.
//!
//! [`ConsumerPipeline::process`] takes one delivered payload and classifies
//! it, short-circuiting at the first terminal outcome:
//!
//! 1. shutdown in progress: ignored, returns `Ok(None)`
//! 2. empty payload: [`Classification::Dlq`]
//! 3. payload is not JSON: [`Classification::Dlq`]
//! 4. event shape is invalid: [`Classification::Dlq`]
//! 5. event id already processed: [`Classification::Skip`]
//! 6. handler succeeds: [`Classification::Success`], the id is recorded
//!
//! A handler failure is returned as [`Error::RetryableProcessing`] so the
//! broker adapter redelivers the message. Nothing is retried in-process.

use crate::config::ConsumerConfig;
use crate::dedup::ProcessedIds;
use crate::metrics::ConsumerMetrics;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 2000-01-01T00:00:00Z
const EARLIEST_EVENT_SECS: i64 = 946_684_800;

/// A structurally valid event decoded from a delivered payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumedEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Business logic invoked once per new event.
///
/// Returning an error asks for redelivery; the event id is not recorded.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ConsumedEvent) -> anyhow::Result<()>;
}

/// Handler that only logs what it receives. Used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &ConsumedEvent) -> anyhow::Result<()> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            timestamp = %event.timestamp,
            "Event received"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqReason {
    EmptyMessage,
    ParseFailure(String),
    ShapeValidation(String),
}

impl fmt::Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DlqReason::EmptyMessage => write!(f, "empty message"),
            DlqReason::ParseFailure(detail) => write!(f, "parse failure: {}", detail),
            DlqReason::ShapeValidation(detail) => {
                write!(f, "shape validation failure: {}", detail)
            }
        }
    }
}

/// Terminal outcome of a delivered message that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    Skip,
    Dlq(DlqReason),
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::Skip => "skip",
            Classification::Dlq(_) => "dlq",
        }
    }
}

/// Broker coordinates and payload of one delivered message.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<&'a [u8]>,
}

impl<'a> Delivery<'a> {
    pub fn new(topic: &'a str, partition: i32, offset: i64, payload: Option<&'a [u8]>) -> Self {
        Self {
            topic,
            partition,
            offset,
            payload,
        }
    }
}

/// Required-field and date-sanity checks for decoded events.
#[derive(Debug, Clone)]
pub struct EventValidator {
    earliest_secs: i64,
    max_future_skew: ChronoDuration,
}

impl Default for EventValidator {
    fn default() -> Self {
        Self {
            earliest_secs: EARLIEST_EVENT_SECS,
            max_future_skew: ChronoDuration::hours(1),
        }
    }
}

impl EventValidator {
    pub fn with_max_future_skew(mut self, skew: ChronoDuration) -> Self {
        self.max_future_skew = skew;
        self
    }

    pub fn validate(
        &self,
        value: &Value,
        now: DateTime<Utc>,
    ) -> std::result::Result<ConsumedEvent, String> {
        let object = value
            .as_object()
            .ok_or_else(|| "event must be a JSON object".to_string())?;

        let id = required_string(object, "id")?;
        let event_type = required_string(object, "type")?;
        let raw_timestamp = required_string(object, "timestamp")?;

        let timestamp = DateTime::parse_from_rfc3339(raw_timestamp)
            .map_err(|e| format!("timestamp '{}' is not RFC 3339: {}", raw_timestamp, e))?
            .with_timezone(&Utc);
        if timestamp.timestamp() < self.earliest_secs {
            return Err(format!("timestamp {} is before year 2000", raw_timestamp));
        }
        if timestamp > now + self.max_future_skew {
            return Err(format!("timestamp {} is in the future", raw_timestamp));
        }

        let data = match object.get("data") {
            None | Some(Value::Null) => None,
            Some(data) => Some(data.clone()),
        };

        Ok(ConsumedEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            timestamp,
            data,
        })
    }
}

fn required_string<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> std::result::Result<&'a str, String> {
    match object.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(format!("field '{}' is empty", field)),
        Some(_) => Err(format!("field '{}' must be a string", field)),
        None => Err(format!("missing required field '{}'", field)),
    }
}

pub struct ConsumerPipeline<H> {
    handler: H,
    validator: EventValidator,
    processed: ProcessedIds,
    metrics: ConsumerMetrics,
    shutdown: CancellationToken,
}

impl<H: EventHandler> ConsumerPipeline<H> {
    pub fn new(handler: H, config: &ConsumerConfig) -> Result<Self> {
        let processed = ProcessedIds::new(config.dedup_capacity);
        debug!(
            group_id = %config.group_id,
            dedup_capacity = ?processed.capacity(),
            "Created consumer pipeline"
        );

        Ok(Self {
            handler,
            validator: EventValidator::default(),
            processed,
            metrics: ConsumerMetrics::new(&config.group_id)?,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_validator(mut self, validator: EventValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Token that stops this pipeline once cancelled. Cancelling it from a
    /// signal handler begins graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn metrics(&self) -> &ConsumerMetrics {
        &self.metrics
    }

    pub fn has_processed(&self, event_id: &str) -> bool {
        self.processed.contains(event_id)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Classifies one delivered message.
    ///
    /// Returns `Ok(None)` when shutdown is in progress and the message was
    /// left untouched.
    #[instrument(
        skip(self, delivery),
        fields(topic = delivery.topic, partition = delivery.partition, offset = delivery.offset)
    )]
    pub async fn process(&mut self, delivery: Delivery<'_>) -> Result<Option<Classification>> {
        if self.shutdown.is_cancelled() {
            debug!("Shutdown in progress, ignoring message");
            return Ok(None);
        }

        let event = match self.decode(delivery.payload) {
            Ok(event) => event,
            Err(reason) => {
                self.metrics.record_dlq();
                warn!(
                    topic = delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    reason = %reason,
                    "Dead-letter candidate"
                );
                let classification = Classification::Dlq(reason);
                self.log_snapshot(classification.as_str());
                return Ok(Some(classification));
            }
        };

        if self.processed.contains(&event.id) {
            self.metrics.record_skipped();
            debug!(event_id = %event.id, "Event already processed, skipping");
            self.log_snapshot(Classification::Skip.as_str());
            return Ok(Some(Classification::Skip));
        }

        match self.handler.handle(&event).await {
            Ok(()) => {
                self.processed.insert(event.id.as_str());
                self.metrics.record_processed();
                debug!(event_id = %event.id, event_type = %event.event_type, "Event processed");
                self.log_snapshot(Classification::Success.as_str());
                Ok(Some(Classification::Success))
            }
            Err(source) => {
                self.metrics.record_error();
                error!(event_id = %event.id, error = %source, "Handler failed, requesting redelivery");
                self.log_snapshot("error");
                Err(Error::RetryableProcessing {
                    event_id: event.id,
                    source,
                })
            }
        }
    }

    fn decode(&self, payload: Option<&[u8]>) -> std::result::Result<ConsumedEvent, DlqReason> {
        let text = match payload {
            None => return Err(DlqReason::EmptyMessage),
            Some(bytes) => {
                std::str::from_utf8(bytes).map_err(|e| DlqReason::ParseFailure(e.to_string()))?
            }
        };
        if text.trim().is_empty() {
            return Err(DlqReason::EmptyMessage);
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| DlqReason::ParseFailure(e.to_string()))?;
        self.validator
            .validate(&value, Utc::now())
            .map_err(DlqReason::ShapeValidation)
    }

    fn log_snapshot(&self, classification: &str) {
        let snapshot = self.metrics.snapshot();
        info!(
            classification,
            total = snapshot.total,
            processed = snapshot.processed,
            skipped = snapshot.skipped,
            errors = snapshot.errors,
            dlq = snapshot.dlq,
            dedup_size = self.processed.len(),
            "Consumer metrics"
        );
    }

    pub fn log_final_metrics(&self) {
        let snapshot = self.metrics.snapshot();
        info!(
            total = snapshot.total,
            processed = snapshot.processed,
            skipped = snapshot.skipped,
            errors = snapshot.errors,
            dlq = snapshot.dlq,
            dedup_size = self.processed.len(),
            "Consumer stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_validator_accepts_minimal_event() {
        let value = json!({
            "id": "evt-1",
            "type": "order.created",
            "timestamp": "2024-03-01T12:00:00Z"
        });

        let event = EventValidator::default().validate(&value, now()).unwrap();
        assert_eq!(event.id, "evt-1");
        assert_eq!(event.event_type, "order.created");
        assert!(event.data.is_none());
    }

    #[test]
    fn test_validator_keeps_data() {
        let value = json!({
            "id": "evt-1",
            "type": "t",
            "timestamp": "2024-03-01T12:00:00.250+02:00",
            "data": {"amount": 10}
        });

        let event = EventValidator::default().validate(&value, now()).unwrap();
        assert_eq!(event.data, Some(json!({"amount": 10})));
        assert_eq!(event.timestamp.to_rfc3339(), "2024-03-01T10:00:00.250+00:00");
    }

    #[test]
    fn test_validator_rejects_bad_shapes() {
        let validator = EventValidator::default();
        let cases = [
            (json!([1, 2]), "JSON object"),
            (json!({"type": "t", "timestamp": "2024-01-01T00:00:00Z"}), "'id'"),
            (json!({"id": 7, "type": "t", "timestamp": "2024-01-01T00:00:00Z"}), "must be a string"),
            (json!({"id": " ", "type": "t", "timestamp": "2024-01-01T00:00:00Z"}), "is empty"),
            (json!({"id": "a", "timestamp": "2024-01-01T00:00:00Z"}), "'type'"),
            (json!({"id": "a", "type": "t", "timestamp": "yesterday"}), "RFC 3339"),
            (json!({"id": "a", "type": "t", "timestamp": "1970-01-01T00:00:00Z"}), "year 2000"),
        ];

        for (value, expected) in cases {
            let err = validator.validate(&value, now()).unwrap_err();
            assert!(err.contains(expected), "{} should mention {}", err, expected);
        }
    }

    #[test]
    fn test_validator_future_skew() {
        let reference = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let validator = EventValidator::default().with_max_future_skew(ChronoDuration::minutes(5));

        let near = json!({"id": "a", "type": "t", "timestamp": "2024-06-01T00:04:00Z"});
        assert!(validator.validate(&near, reference).is_ok());

        let far = json!({"id": "a", "type": "t", "timestamp": "2024-06-01T01:00:00Z"});
        assert!(validator.validate(&far, reference).unwrap_err().contains("future"));
    }

    #[test]
    fn test_dlq_reason_display() {
        assert_eq!(DlqReason::EmptyMessage.to_string(), "empty message");
        assert!(DlqReason::ParseFailure("eof".into()).to_string().starts_with("parse failure"));
    }
}
