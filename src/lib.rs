pub mod broker;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod partitioner;
pub mod path;
pub mod producer;
pub mod routing;
pub mod schema;
pub mod transaction;

pub mod kafka;

pub use config::Config;
pub use consumer::{Classification, ConsumedEvent, ConsumerPipeline, EventHandler};
pub use error::{Error, Result};
pub use producer::{OutgoingMessage, ProducerPipeline};
