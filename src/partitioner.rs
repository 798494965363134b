//! Partition selection strategies.
//!
//! Every strategy implements [`Partitioner`] and maps a
//! [`PartitionContext`] to an index in `[0, partition_count)`. A context with
//! zero partitions always yields 0.

use crate::metadata::EnhancedMetadata;
use crate::path;
use crate::{Error, Result};
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Read-only view handed to a partitioner.
#[derive(Debug, Clone, Copy)]
pub struct PartitionContext<'a> {
    pub topic: &'a str,
    pub partition_count: usize,
    pub message: &'a Value,
    pub key: Option<&'a str>,
    pub metadata: Option<&'a EnhancedMetadata>,
}

pub trait Partitioner: Send + Sync {
    fn partition(&self, context: &PartitionContext<'_>) -> usize;

    fn name(&self) -> &str;
}

/// Java `String.hashCode`: `h = 31 * h + c` over UTF-16 code units with
/// 32-bit wraparound.
pub fn string_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

fn hash_to_partition(value: &str, partition_count: usize) -> usize {
    string_hash(value).unsigned_abs() as usize % partition_count
}

/// Key hash, or a random partition when there is no key.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn partition(&self, context: &PartitionContext<'_>) -> usize {
        if context.partition_count == 0 {
            return 0;
        }
        match context.key {
            Some(key) => hash_to_partition(key, context.partition_count),
            None => rand::thread_rng().gen_range(0..context.partition_count),
        }
    }

    fn name(&self) -> &str {
        "hash"
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    counter: AtomicUsize,
}

impl RoundRobinPartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&self, context: &PartitionContext<'_>) -> usize {
        let count = context.partition_count;
        if count == 0 {
            return 0;
        }
        let mut partition = 0;
        // fetch_update never fails with a closure that always returns Some
        let _ = self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                partition = current % count;
                Some((current + 1) % count)
            });
        partition
    }

    fn name(&self) -> &str {
        "round-robin"
    }
}

pub type HashFn = Arc<dyn Fn(&Value) -> u64 + Send + Sync>;

/// Hashes the value found at a dotted path in the message.
pub struct ContentBasedPartitioner {
    field_path: String,
    hash_fn: Option<HashFn>,
}

impl ContentBasedPartitioner {
    pub fn new(field_path: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            hash_fn: None,
        }
    }

    pub fn with_hash<F>(mut self, hash_fn: F) -> Self
    where
        F: Fn(&Value) -> u64 + Send + Sync + 'static,
    {
        self.hash_fn = Some(Arc::new(hash_fn));
        self
    }
}

impl Partitioner for ContentBasedPartitioner {
    fn partition(&self, context: &PartitionContext<'_>) -> usize {
        if context.partition_count == 0 {
            return 0;
        }
        let Some(value) = path::resolve(context.message, &self.field_path) else {
            return 0;
        };
        match &self.hash_fn {
            Some(hash_fn) => (hash_fn(value) % context.partition_count as u64) as usize,
            None => hash_to_partition(&path::value_to_string(value), context.partition_count),
        }
    }

    fn name(&self) -> &str {
        "content-based"
    }
}

pub type PartitionFn = Arc<dyn Fn(&PartitionContext<'_>) -> i64 + Send + Sync>;

/// Delegates to a caller function and clamps its result into range.
pub struct CustomPartitioner {
    name: String,
    partition_fn: PartitionFn,
}

impl CustomPartitioner {
    pub fn new<F>(name: impl Into<String>, partition_fn: F) -> Self
    where
        F: Fn(&PartitionContext<'_>) -> i64 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            partition_fn: Arc::new(partition_fn),
        }
    }
}

impl Partitioner for CustomPartitioner {
    fn partition(&self, context: &PartitionContext<'_>) -> usize {
        if context.partition_count == 0 {
            return 0;
        }
        let max = (context.partition_count - 1) as i64;
        (self.partition_fn)(context).clamp(0, max) as usize
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Picks partitions randomly in proportion to their weights.
#[derive(Debug, Clone)]
pub struct WeightedPartitioner {
    cumulative: Vec<f64>,
    total: f64,
}

impl WeightedPartitioner {
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::InvalidPartitioner(
                "weighted partitioner requires at least one weight".to_string(),
            ));
        }
        if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w <= 0.0) {
            return Err(Error::InvalidPartitioner(format!(
                "weights must be positive, got {}",
                bad
            )));
        }

        let cumulative: Vec<f64> = weights
            .iter()
            .scan(0.0, |sum, w| {
                *sum += w;
                Some(*sum)
            })
            .collect();
        let total = cumulative.last().copied().unwrap_or_default();
        if !total.is_finite() {
            return Err(Error::InvalidPartitioner(
                "sum of weights must be finite".to_string(),
            ));
        }

        Ok(Self { cumulative, total })
    }

    fn select(&self, draw: f64, partition_count: usize) -> usize {
        let reachable = self.cumulative.len().min(partition_count);
        self.cumulative[..reachable]
            .iter()
            .position(|bound| draw < *bound)
            .unwrap_or(0)
    }
}

impl Partitioner for WeightedPartitioner {
    fn partition(&self, context: &PartitionContext<'_>) -> usize {
        if context.partition_count == 0 {
            return 0;
        }
        let draw = rand::thread_rng().gen_range(0.0..self.total);
        self.select(draw, context.partition_count)
    }

    fn name(&self) -> &str {
        "weighted"
    }
}
