//! Correlation, causation and trace metadata for outgoing messages.
//!
//! Every message produced through the pipeline carries an
//! [`EnhancedMetadata`] record. [`MetadataManager`] creates these records,
//! derives correlation and trace contexts from a parent, and converts them
//! to and from Kafka headers.
//!
//! # Header layout
//!
//! Known metadata fields are written as `x-msg-<field>` using the camelCase
//! field name (`x-msg-correlationId`, `x-msg-priority`, ...). Free-form
//! custom headers are written as `x-custom-<key>`. Any other header is
//! ignored on decode.
//!
//! ```rust
//! use kafka_pipeline::metadata::{MetadataManager, MetadataOverrides};
//!
//! let manager = MetadataManager::new();
//! let metadata = manager.create_metadata(
//!     MetadataOverrides::default()
//!         .with_message_type("order.created")
//!         .with_priority(5),
//! );
//!
//! let headers = MetadataManager::metadata_to_headers(&metadata);
//! let decoded = MetadataManager::headers_to_metadata(&headers);
//! assert_eq!(decoded.correlation_id, metadata.correlation_id);
//! assert_eq!(decoded.priority, Some(5));
//! ```

use crate::broker::Headers;
use crate::schema::ValidationResult;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const METADATA_HEADER_PREFIX: &str = "x-msg-";
pub const CUSTOM_HEADER_PREFIX: &str = "x-custom-";

const MAX_PRIORITY: u8 = 10;
const ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Distributed-trace position of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub baggage: BTreeMap<String, String>,
}

/// Metadata attached to every outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedMetadata {
    pub message_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub conversation_id: Option<String>,
    pub message_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub priority: Option<u8>,
    pub ttl: Option<u64>,
    pub retry_count: Option<u32>,
    pub trace_context: Option<TraceContext>,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    /// Unrecognized `x-msg-*` headers, kept verbatim.
    #[serde(skip)]
    pub extra_fields: BTreeMap<String, String>,
}

/// Partial metadata. Every set field takes precedence over generated values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataOverrides {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub conversation_id: Option<String>,
    pub message_type: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub priority: Option<u8>,
    pub ttl: Option<u64>,
    pub retry_count: Option<u32>,
    pub trace_context: Option<TraceContext>,
    pub custom_headers: BTreeMap<String, String>,
}

/// Causation and conversation ids derived from a parent correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    pub causation_id: Option<String>,
    pub conversation_id: String,
}

impl MetadataOverrides {
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_trace_context(mut self, trace_context: TraceContext) -> Self {
        self.trace_context = Some(trace_context);
        self
    }

    pub fn with_custom_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_context(mut self, context: CorrelationContext) -> Self {
        self.causation_id = context.causation_id;
        self.conversation_id = Some(context.conversation_id);
        self
    }

    fn apply_to(&self, metadata: &mut EnhancedMetadata) {
        if let Some(v) = &self.message_id {
            metadata.message_id = v.clone();
        }
        if let Some(v) = &self.correlation_id {
            metadata.correlation_id = v.clone();
        }
        if let Some(v) = &self.causation_id {
            metadata.causation_id = Some(v.clone());
        }
        if let Some(v) = &self.conversation_id {
            metadata.conversation_id = Some(v.clone());
        }
        if let Some(v) = &self.message_type {
            metadata.message_type = Some(v.clone());
        }
        if let Some(v) = self.timestamp {
            metadata.timestamp = v;
        }
        if let Some(v) = self.priority {
            metadata.priority = Some(v);
        }
        if let Some(v) = self.ttl {
            metadata.ttl = Some(v);
        }
        if let Some(v) = self.retry_count {
            metadata.retry_count = Some(v);
        }
        if let Some(v) = &self.trace_context {
            metadata.trace_context = Some(v.clone());
        }
        metadata
            .custom_headers
            .extend(self.custom_headers.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// The known `x-msg-*` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    MessageId,
    CorrelationId,
    CausationId,
    ConversationId,
    MessageType,
    Timestamp,
    Priority,
    Ttl,
    RetryCount,
    TraceContext,
}

impl Field {
    const ALL: [Field; 10] = [
        Field::MessageId,
        Field::CorrelationId,
        Field::CausationId,
        Field::ConversationId,
        Field::MessageType,
        Field::Timestamp,
        Field::Priority,
        Field::Ttl,
        Field::RetryCount,
        Field::TraceContext,
    ];

    fn name(self) -> &'static str {
        match self {
            Field::MessageId => "messageId",
            Field::CorrelationId => "correlationId",
            Field::CausationId => "causationId",
            Field::ConversationId => "conversationId",
            Field::MessageType => "messageType",
            Field::Timestamp => "timestamp",
            Field::Priority => "priority",
            Field::Ttl => "ttl",
            Field::RetryCount => "retryCount",
            Field::TraceContext => "traceContext",
        }
    }

    fn from_name(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.name() == name)
    }

    fn encode(self, metadata: &EnhancedMetadata) -> Option<String> {
        match self {
            Field::MessageId => non_empty(&metadata.message_id),
            Field::CorrelationId => non_empty(&metadata.correlation_id),
            Field::CausationId => metadata.causation_id.clone(),
            Field::ConversationId => metadata.conversation_id.clone(),
            Field::MessageType => metadata.message_type.clone(),
            Field::Timestamp => Some(
                metadata
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            Field::Priority => metadata.priority.map(|v| v.to_string()),
            Field::Ttl => metadata.ttl.map(|v| v.to_string()),
            Field::RetryCount => metadata.retry_count.map(|v| v.to_string()),
            Field::TraceContext => metadata
                .trace_context
                .as_ref()
                .and_then(|tc| serde_json::to_string(tc).ok()),
        }
    }

    /// Applies a decoded header value. Returns false when the value does not
    /// parse as the field's type.
    fn decode(self, raw: &str, metadata: &mut EnhancedMetadata) -> bool {
        match self {
            Field::MessageId => metadata.message_id = raw.to_string(),
            Field::CorrelationId => metadata.correlation_id = raw.to_string(),
            Field::CausationId => metadata.causation_id = Some(raw.to_string()),
            Field::ConversationId => metadata.conversation_id = Some(raw.to_string()),
            Field::MessageType => metadata.message_type = Some(raw.to_string()),
            Field::Timestamp => match DateTime::parse_from_rfc3339(raw) {
                Ok(ts) => metadata.timestamp = ts.with_timezone(&Utc),
                Err(_) => return false,
            },
            Field::Priority => match raw.parse() {
                Ok(v) => metadata.priority = Some(v),
                Err(_) => return false,
            },
            Field::Ttl => match raw.parse() {
                Ok(v) => metadata.ttl = Some(v),
                Err(_) => return false,
            },
            Field::RetryCount => match raw.parse() {
                Ok(v) => metadata.retry_count = Some(v),
                Err(_) => return false,
            },
            Field::TraceContext => match serde_json::from_str(raw) {
                Ok(v) => metadata.trace_context = Some(v),
                Err(_) => return false,
            },
        }
        true
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl EnhancedMetadata {
    fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            message_id: String::new(),
            correlation_id: String::new(),
            causation_id: None,
            conversation_id: None,
            message_type: None,
            timestamp,
            priority: None,
            ttl: None,
            retry_count: None,
            trace_context: None,
            custom_headers: BTreeMap::new(),
            extra_fields: BTreeMap::new(),
        }
    }

    /// Looks up a field by its camelCase wire name, including custom headers
    /// (as `customHeaders.<key>`) and unrecognized extra fields.
    pub fn field(&self, name: &str) -> Option<String> {
        if let Some(field) = Field::from_name(name) {
            return field.encode(self);
        }
        if let Some(key) = name.strip_prefix("customHeaders.") {
            return self.custom_headers.get(key).cloned();
        }
        self.extra_fields.get(name).cloned()
    }
}

/// Generates ids shaped `<prefix>_<timestampMillis>_<base36 suffix>`.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), suffix)
}

/// Creates and converts message metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataManager {
    defaults: MetadataOverrides,
}

impl MetadataManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: MetadataOverrides) -> Self {
        Self { defaults }
    }

    /// Replaces the defaults applied to every subsequent `create_metadata`.
    pub fn set_defaults(&mut self, defaults: MetadataOverrides) {
        self.defaults = defaults;
    }

    pub fn defaults(&self) -> &MetadataOverrides {
        &self.defaults
    }

    /// Builds metadata from stored defaults, a fresh message id and
    /// timestamp, then `overrides`. A correlation id is generated when none
    /// of those supply one.
    pub fn create_metadata(&self, overrides: MetadataOverrides) -> EnhancedMetadata {
        let mut metadata = EnhancedMetadata::empty(Utc::now());

        self.defaults.apply_to(&mut metadata);
        metadata.message_id = generate_id("msg");
        metadata.timestamp = Utc::now();
        overrides.apply_to(&mut metadata);

        if metadata.correlation_id.is_empty() {
            metadata.correlation_id = generate_id("corr");
        }

        metadata
    }

    /// Derives causation and conversation ids from a parent correlation id.
    ///
    /// The conversation id reuses the parent's timestamp and random
    /// components, so all messages descending from one request share it.
    pub fn create_correlation_context(&self, parent_correlation_id: Option<&str>) -> CorrelationContext {
        match parent_correlation_id {
            Some(parent) => CorrelationContext {
                causation_id: Some(parent.to_string()),
                conversation_id: derive_conversation_id(parent)
                    .unwrap_or_else(|| generate_id("conv")),
            },
            None => CorrelationContext {
                causation_id: None,
                conversation_id: generate_id("conv"),
            },
        }
    }

    pub fn create_trace_context(&self, parent: Option<&TraceContext>) -> TraceContext {
        match parent {
            Some(parent) => TraceContext {
                trace_id: parent.trace_id.clone(),
                span_id: generate_id("span"),
                parent_span_id: Some(parent.span_id.clone()),
                baggage: parent.baggage.clone(),
            },
            None => TraceContext {
                trace_id: generate_id("trace"),
                span_id: generate_id("span"),
                parent_span_id: None,
                baggage: BTreeMap::new(),
            },
        }
    }

    pub fn metadata_to_headers(metadata: &EnhancedMetadata) -> Headers {
        let mut headers = Headers::new();

        for field in Field::ALL {
            if let Some(value) = field.encode(metadata) {
                headers.insert(
                    format!("{}{}", METADATA_HEADER_PREFIX, field.name()),
                    Bytes::from(value),
                );
            }
        }

        for (name, value) in &metadata.extra_fields {
            headers.insert(
                format!("{}{}", METADATA_HEADER_PREFIX, name),
                Bytes::from(value.clone()),
            );
        }

        for (key, value) in &metadata.custom_headers {
            headers.insert(
                format!("{}{}", CUSTOM_HEADER_PREFIX, key),
                Bytes::from(value.clone()),
            );
        }

        headers
    }

    /// Inverse of [`MetadataManager::metadata_to_headers`].
    ///
    /// Missing id fields decode as empty strings and a missing timestamp as
    /// the Unix epoch; `validate_metadata` reports the former. Typed fields
    /// that fail to parse are kept as raw strings in `extra_fields`.
    pub fn headers_to_metadata(headers: &Headers) -> EnhancedMetadata {
        let mut metadata = EnhancedMetadata::empty(DateTime::<Utc>::UNIX_EPOCH);

        for (key, value) in headers {
            let raw = String::from_utf8_lossy(value);

            if let Some(name) = key.strip_prefix(METADATA_HEADER_PREFIX) {
                match Field::from_name(name) {
                    Some(field) => {
                        if !field.decode(&raw, &mut metadata) {
                            warn!(header = %key, value = %raw, "Malformed metadata header, keeping raw value");
                            metadata.extra_fields.insert(name.to_string(), raw.into_owned());
                        }
                    }
                    None => {
                        metadata.extra_fields.insert(name.to_string(), raw.into_owned());
                    }
                }
            } else if let Some(custom) = key.strip_prefix(CUSTOM_HEADER_PREFIX) {
                metadata.custom_headers.insert(custom.to_string(), raw.into_owned());
            }
        }

        metadata
    }

    pub fn validate_metadata(metadata: &EnhancedMetadata) -> ValidationResult {
        let mut errors = Vec::new();

        if metadata.correlation_id.trim().is_empty() {
            errors.push("correlationId is required".to_string());
        }
        if metadata.message_type.as_deref().map_or(true, |t| t.trim().is_empty()) {
            errors.push("messageType is required".to_string());
        }
        if let Some(priority) = metadata.priority {
            if priority > MAX_PRIORITY {
                errors.push(format!("priority must be between 0 and {}", MAX_PRIORITY));
            }
        }
        if metadata.ttl == Some(0) {
            errors.push("ttl must be greater than 0".to_string());
        }

        ValidationResult::from_errors(errors)
    }
}

fn derive_conversation_id(parent: &str) -> Option<String> {
    let mut parts = parent.rsplitn(3, '_');
    let random = parts.next()?;
    let timestamp = parts.next()?;
    parts.next()?;

    if random.is_empty() || timestamp.parse::<i64>().is_err() {
        return None;
    }
    Some(format!("conv_{}_{}", timestamp, random))
}
