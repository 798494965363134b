//! Error types and result handling for kafka-pipeline.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use kafka_pipeline::{Error, Result};
//!
//! fn check_payload(payload: &str) -> Result<()> {
//!     if payload.is_empty() {
//!         return Err(Error::Validation("payload is empty".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! match check_payload("") {
//!     Ok(()) => println!("Valid"),
//!     Err(Error::Validation(reason)) => eprintln!("Rejected: {}", reason),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for kafka-pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from a malformed file or environment override.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but failed a semantic check.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Payload rejected by the configured schema validator.
    ///
    /// Raised before any network call is made.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Payload could not be encoded in the configured format.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker rejected or failed a send.
    #[error("Send to topic '{topic}' failed: {message}")]
    Send {
        /// Destination topic of the failed send
        topic: String,
        /// Broker-provided failure description
        message: String,
    },

    /// Begin, commit or rollback failure on a broker transaction.
    #[error("Transaction '{transaction_id}' failed: {message}")]
    Transaction {
        /// Id of the transaction that failed
        transaction_id: String,
        /// Description of the failure
        message: String,
    },

    /// A transaction is already in progress on this pipeline.
    #[error("Transaction '{0}' is already active")]
    TransactionAlreadyActive(String),

    /// Commit, rollback or transactional send without an active transaction.
    #[error("No active transaction")]
    NoActiveTransaction,

    /// Transactional operation requested on a pipeline without transactions.
    #[error("Transactions are not enabled for this pipeline")]
    TransactionsDisabled,

    /// Partitioner constructed with invalid parameters.
    #[error("Invalid partitioner: {0}")]
    InvalidPartitioner(String),

    /// Routing rule constructed with invalid parameters.
    #[error("Invalid routing rule: {0}")]
    InvalidRule(String),

    /// Business handler failure that should be redelivered by the broker.
    #[error("Processing of event '{event_id}' failed, requesting redelivery: {source}")]
    RetryableProcessing {
        /// Id of the event whose handler failed
        event_id: String,
        /// Underlying handler error
        #[source]
        source: anyhow::Error,
    },

    /// Metrics registration error.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error, typically from reading payload or config files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true when the broker should redeliver the message that
    /// produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryableProcessing { .. })
    }
}

/// A convenient Result type alias for kafka-pipeline operations.
///
/// This is equivalent to `std::result::Result<T, kafka_pipeline::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
