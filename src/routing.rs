//! Content-based topic routing.
//!
//! A [`Router`] holds prioritized [`RoutingRule`]s. Routing evaluates rules
//! from highest to lowest priority (insertion order on ties) and sends the
//! message to the first rule whose predicate matches, or to the default
//! topic when none does.
//!
//! ```rust
//! use kafka_pipeline::routing::{Router, RoutingRule};
//! use serde_json::json;
//!
//! let mut router = Router::new("general");
//! router.add_rule(RoutingRule::path_equals("alerts", "type", json!("alert"), "alerts", 100));
//!
//! assert_eq!(router.route(&json!({"type": "alert"}), None).topic, "alerts");
//! assert!(router.route(&json!({"type": "info"}), None).is_default);
//! ```

use crate::metadata::EnhancedMetadata;
use crate::path;
use crate::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Rule predicate. An `Err` counts as "no match".
pub type Predicate =
    Arc<dyn Fn(&Value, Option<&EnhancedMetadata>) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Clone)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    pub target_topic: String,
    pub priority: i32,
    predicate: Predicate,
}

/// Partial update applied by [`Router::update_rule`].
#[derive(Clone, Default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub target_topic: Option<String>,
    pub priority: Option<i32>,
    pub predicate: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResult {
    pub topic: String,
    /// Id of the matching rule, if any.
    pub matched_rule: Option<String>,
    pub is_default: bool,
}

impl RoutingRule {
    pub fn new<F>(
        id: impl Into<String>,
        target_topic: impl Into<String>,
        priority: i32,
        predicate: F,
    ) -> Self
    where
        F: Fn(&Value, Option<&EnhancedMetadata>) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            target_topic: target_topic.into(),
            priority,
            predicate: Arc::new(predicate),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Matches when the value at `field_path` equals `expected`.
    pub fn path_equals(
        id: impl Into<String>,
        field_path: impl Into<String>,
        expected: Value,
        target_topic: impl Into<String>,
        priority: i32,
    ) -> Self {
        let field_path = field_path.into();
        Self::new(id, target_topic, priority, move |payload, _| {
            Ok(path::resolve(payload, &field_path) == Some(&expected))
        })
    }

    /// Matches when a metadata field (camelCase wire name) equals `expected`.
    pub fn metadata_equals(
        id: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
        target_topic: impl Into<String>,
        priority: i32,
    ) -> Self {
        let field = field.into();
        let expected = expected.into();
        Self::new(id, target_topic, priority, move |_, metadata| {
            Ok(metadata
                .and_then(|m| m.field(&field))
                .map_or(false, |value| value == expected))
        })
    }

    /// Matches when the string at `field_path` matches `pattern`.
    pub fn path_matches(
        id: impl Into<String>,
        field_path: impl Into<String>,
        pattern: &str,
        target_topic: impl Into<String>,
        priority: i32,
    ) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::InvalidRule(format!("invalid pattern '{}': {}", pattern, e)))?;
        let field_path = field_path.into();
        Ok(Self::new(id, target_topic, priority, move |payload, _| {
            Ok(match path::resolve(payload, &field_path) {
                Some(Value::String(s)) => regex.is_match(s),
                _ => false,
            })
        }))
    }

    /// Evaluates the predicate, turning a panic into an error.
    pub fn evaluate(&self, payload: &Value, metadata: Option<&EnhancedMetadata>) -> anyhow::Result<bool> {
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(payload, metadata))) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("predicate panicked")),
        }
    }
}

impl fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target_topic", &self.target_topic)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl RuleUpdate {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn target_topic(mut self, topic: impl Into<String>) -> Self {
        self.target_topic = Some(topic.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value, Option<&EnhancedMetadata>) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

struct Entry {
    seq: u64,
    rule: RoutingRule,
}

pub struct Router {
    default_topic: String,
    rules: Vec<Entry>,
    next_seq: u64,
}

impl Router {
    pub fn new(default_topic: impl Into<String>) -> Self {
        Self {
            default_topic: default_topic.into(),
            rules: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    pub fn set_default_topic(&mut self, topic: impl Into<String>) {
        self.default_topic = topic.into();
    }

    /// Adds a rule. A rule with the same id is replaced.
    pub fn add_rule(&mut self, rule: RoutingRule) {
        if self.remove_rule(&rule.id) {
            debug!(rule_id = %rule.id, "Replacing routing rule");
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rules.push(Entry { seq, rule });
        self.sort();
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|entry| entry.rule.id != id);
        self.rules.len() != before
    }

    pub fn update_rule(&mut self, id: &str, update: RuleUpdate) -> bool {
        let Some(entry) = self.rules.iter_mut().find(|entry| entry.rule.id == id) else {
            return false;
        };

        let rule = &mut entry.rule;
        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(topic) = update.target_topic {
            rule.target_topic = topic;
        }
        if let Some(predicate) = update.predicate {
            rule.predicate = predicate;
        }
        if let Some(priority) = update.priority {
            rule.priority = priority;
            self.sort();
        }
        true
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.iter().map(|entry| &entry.rule)
    }

    /// Picks the destination topic. Never fails: a failing predicate is
    /// logged and skipped.
    pub fn route(&self, payload: &Value, metadata: Option<&EnhancedMetadata>) -> RouteResult {
        for rule in self.rules() {
            match rule.evaluate(payload, metadata) {
                Ok(true) => {
                    debug!(rule_id = %rule.id, topic = %rule.target_topic, "Routing rule matched");
                    return RouteResult {
                        topic: rule.target_topic.clone(),
                        matched_rule: Some(rule.id.clone()),
                        is_default: false,
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(rule_id = %rule.id, rule_name = %rule.name, error = %e, "Routing rule evaluation failed");
                }
            }
        }

        RouteResult {
            topic: self.default_topic.clone(),
            matched_rule: None,
            is_default: true,
        }
    }

    fn sort(&mut self) {
        self.rules
            .sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority).then(a.seq.cmp(&b.seq)));
    }
}
