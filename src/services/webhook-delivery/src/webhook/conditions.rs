//! # Condition Evaluator
//!
//! Endpoints may carry a condition tree that narrows which lifecycle events they
//! receive. Evaluation is pure: leaves read the event payload, the previous snapshot
//! or the event context, and custom leaves call named predicates registered on the
//! server. Every failure mode (missing field, type mismatch, unknown predicate,
//! predicate error or panic) evaluates to `false`.

use crate::error::WebhookDeliveryError;
use crate::models::LifecycleEvent;
use crate::utils::JsonUtils;
use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Boolean condition tree as stored on an endpoint.
///
/// A bare JSON array is an implicit AND of its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionTree {
    And { and: Vec<ConditionTree> },
    Or { or: Vec<ConditionTree> },
    Not { not: Box<ConditionTree> },
    All(Vec<ConditionTree>),
    Leaf(ConditionNode),
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Gt,
    Lt,
    Contains,
}

/// Component of `context.timestamp` addressed by a time condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeField {
    /// Hour of day in UTC, 0-23
    Hour,
    /// ISO weekday, 1 = Monday .. 7 = Sunday
    Weekday,
    /// Calendar date as `YYYY-MM-DD`
    Date,
}

/// Leaf condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConditionNode {
    /// Dot path into `data`, or into `previous.` / `context.` when prefixed
    Field {
        field: String,
        operator: ConditionOperator,
        value: Value,
    },
    /// Compares `context.userRole`
    Role {
        operator: ConditionOperator,
        value: Value,
    },
    /// Compares `context.tenantId`
    Tenant {
        operator: ConditionOperator,
        value: Value,
    },
    /// Compares `context.timestamp`; without `field` the value is an RFC 3339 instant
    Time {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<TimeField>,
        operator: ConditionOperator,
        value: Value,
    },
    /// Named predicate looked up in the [`PredicateRegistry`]
    Custom {
        name: String,
        #[serde(default)]
        params: Value,
    },
}

/// Signature of a server-side predicate
pub type Predicate = Arc<dyn Fn(&LifecycleEvent, &Value) -> Result<bool, String> + Send + Sync>;

/// Registry of named custom predicates
#[derive(Default, Clone)]
pub struct PredicateRegistry {
    predicates: Arc<RwLock<HashMap<String, Predicate>>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a predicate under `name`
    pub fn register<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&LifecycleEvent, &Value) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.predicates
            .write()
            .insert(name.into(), Arc::new(predicate));
    }

    pub fn get(&self, name: &str) -> Option<Predicate> {
        self.predicates.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.predicates.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("predicates", &self.names())
            .finish()
    }
}

/// Evaluates condition trees against lifecycle events
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator {
    predicates: PredicateRegistry,
}

impl ConditionEvaluator {
    pub fn new(predicates: PredicateRegistry) -> Self {
        Self { predicates }
    }

    pub fn predicates(&self) -> &PredicateRegistry {
        &self.predicates
    }

    /// Evaluate `tree` against `event`; never fails
    pub fn evaluate(&self, tree: &ConditionTree, event: &LifecycleEvent) -> bool {
        match tree {
            ConditionTree::And { and } | ConditionTree::All(and) => {
                and.iter().all(|child| self.evaluate(child, event))
            }
            ConditionTree::Or { or } => or.iter().any(|child| self.evaluate(child, event)),
            ConditionTree::Not { not } => !self.evaluate(not, event),
            ConditionTree::Leaf(node) => self.evaluate_node(node, event),
        }
    }

    /// Evaluate optional conditions; an endpoint without conditions always passes
    pub fn passes(&self, tree: Option<&ConditionTree>, event: &LifecycleEvent) -> bool {
        tree.map_or(true, |tree| self.evaluate(tree, event))
    }

    fn evaluate_node(&self, node: &ConditionNode, event: &LifecycleEvent) -> bool {
        match node {
            ConditionNode::Field {
                field,
                operator,
                value,
            } => {
                let actual = resolve_field(event, field);
                apply_operator(*operator, actual.as_ref(), value)
            }
            ConditionNode::Role { operator, value } => {
                let actual = event.context.user_role.clone().map(Value::String);
                apply_operator(*operator, actual.as_ref(), value)
            }
            ConditionNode::Tenant { operator, value } => {
                let actual = Value::String(event.context.tenant_id.clone());
                apply_operator(*operator, Some(&actual), value)
            }
            ConditionNode::Time {
                field,
                operator,
                value,
            } => evaluate_time(event.context.timestamp, *field, *operator, value),
            ConditionNode::Custom { name, params } => self.evaluate_custom(name, params, event),
        }
    }

    fn evaluate_custom(&self, name: &str, params: &Value, event: &LifecycleEvent) -> bool {
        let Some(predicate) = self.predicates.get(name) else {
            debug!(predicate = %name, "Unknown custom predicate, condition is false");
            return false;
        };

        match catch_unwind(AssertUnwindSafe(|| predicate(event, params))) {
            Ok(Ok(result)) => result,
            Ok(Err(message)) => {
                let error = WebhookDeliveryError::condition_evaluation(name, message);
                warn!(error_code = error.error_code(), error = %error, "Custom predicate failed");
                false
            }
            Err(_) => {
                let error = WebhookDeliveryError::condition_evaluation(name, "predicate panicked");
                warn!(error_code = error.error_code(), error = %error, "Custom predicate panicked");
                false
            }
        }
    }
}

/// Resolve a field path; `previous.` and `context.` select the source, `data` is the default
fn resolve_field(event: &LifecycleEvent, path: &str) -> Option<Value> {
    if let Some(rest) = path.strip_prefix("previous.") {
        return event
            .previous
            .as_ref()
            .and_then(|previous| JsonUtils::get_path(previous, rest))
            .cloned();
    }
    if let Some(rest) = path.strip_prefix("context.") {
        let context = serde_json::to_value(&event.context).ok()?;
        return JsonUtils::get_path(&context, rest).cloned();
    }
    JsonUtils::get_path(&event.data, path).cloned()
}

fn evaluate_time(
    timestamp: DateTime<Utc>,
    field: Option<TimeField>,
    operator: ConditionOperator,
    expected: &Value,
) -> bool {
    match field {
        Some(TimeField::Hour) => {
            apply_operator(operator, Some(&Value::from(timestamp.hour())), expected)
        }
        Some(TimeField::Weekday) => apply_operator(
            operator,
            Some(&Value::from(timestamp.weekday().number_from_monday())),
            expected,
        ),
        Some(TimeField::Date) => apply_operator(
            operator,
            Some(&Value::String(timestamp.format("%Y-%m-%d").to_string())),
            expected,
        ),
        None => {
            // Instants compare as epoch milliseconds
            let Some(expected) = instant_to_millis(expected) else {
                return false;
            };
            let actual = Value::from(timestamp.timestamp_millis());
            apply_operator(operator, Some(&actual), &expected)
        }
    }
}

fn instant_to_millis(value: &Value) -> Option<Value> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|instant| Value::from(instant.timestamp_millis())),
        Value::Array(items) => items
            .iter()
            .map(instant_to_millis)
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        _ => None,
    }
}

/// Apply `operator`; a missing or null actual value is always `false`
fn apply_operator(operator: ConditionOperator, actual: Option<&Value>, expected: &Value) -> bool {
    let actual = match actual {
        Some(Value::Null) | None => return false,
        Some(actual) => actual,
    };

    match operator {
        ConditionOperator::Equals => values_equal(actual, expected),
        ConditionOperator::NotEquals => {
            same_kind(actual, expected) && !values_equal(actual, expected)
        }
        ConditionOperator::In => expected
            .as_array()
            .map_or(false, |candidates| {
                candidates.iter().any(|candidate| values_equal(actual, candidate))
            }),
        ConditionOperator::NotIn => expected.as_array().map_or(false, |candidates| {
            is_scalar(actual)
                && !candidates.iter().any(|candidate| values_equal(actual, candidate))
        }),
        ConditionOperator::Gt => compare(actual, expected).map_or(false, |o| o.is_gt()),
        ConditionOperator::Lt => compare(actual, expected).map_or(false, |o| o.is_lt()),
        ConditionOperator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_event(total: Value) -> LifecycleEvent {
        serde_json::from_value(json!({
            "event": "created",
            "model": "Order",
            "data": {"total_amount": total, "status": "paid", "tags": ["vip", "eu"],
                     "customer": {"tier": "gold"}},
            "previous": {"status": "pending"},
            "context": {
                "tenantId": "tenant-1",
                "userId": "u-1",
                "userRole": "admin",
                "requestId": "req-1",
                "timestamp": "2024-05-01T10:30:00Z",
                "source": "api"
            }
        }))
        .unwrap()
    }

    fn tree(value: Value) -> ConditionTree {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_numeric_comparison() {
        let evaluator = ConditionEvaluator::default();
        let condition = tree(json!(
            {"type": "field", "field": "total_amount", "operator": "gt", "value": 10000}
        ));

        assert!(!evaluator.evaluate(&condition, &order_event(json!(5000))));
        assert!(evaluator.evaluate(&condition, &order_event(json!(15000.5))));
        // type mismatch fails closed
        assert!(!evaluator.evaluate(&condition, &order_event(json!("15000"))));
    }

    #[test]
    fn test_bare_array_is_and() {
        let evaluator = ConditionEvaluator::default();
        let event = order_event(json!(100));

        let both = tree(json!([
            {"type": "field", "field": "status", "operator": "equals", "value": "paid"},
            {"type": "role", "operator": "in", "value": ["admin", "owner"]}
        ]));
        assert!(evaluator.evaluate(&both, &event));

        let one_fails = tree(json!([
            {"type": "field", "field": "status", "operator": "equals", "value": "paid"},
            {"type": "tenant", "operator": "equals", "value": "tenant-2"}
        ]));
        assert!(!evaluator.evaluate(&one_fails, &event));
    }

    #[test]
    fn test_nested_or_and_not() {
        let evaluator = ConditionEvaluator::default();
        let event = order_event(json!(100));
        let condition = tree(json!({"or": [
            {"type": "field", "field": "customer.tier", "operator": "equals", "value": "platinum"},
            {"and": [
                {"type": "field", "field": "tags", "operator": "contains", "value": "vip"},
                {"not": {"type": "field", "field": "previous.status", "operator": "equals", "value": "paid"}}
            ]}
        ]}));

        assert!(evaluator.evaluate(&condition, &event));
    }

    #[test]
    fn test_missing_fields_fail_closed_for_negations() {
        let evaluator = ConditionEvaluator::default();
        let event = order_event(json!(100));

        for operator in ["not_equals", "not_in", "equals", "contains"] {
            let condition = tree(json!(
                {"type": "field", "field": "nope", "operator": operator, "value": ["x"]}
            ));
            assert!(!evaluator.evaluate(&condition, &event), "{} matched", operator);
        }

        let mismatched = tree(json!(
            {"type": "field", "field": "total_amount", "operator": "not_equals", "value": "100"}
        ));
        assert!(!evaluator.evaluate(&mismatched, &event));
    }

    #[test]
    fn test_context_and_time_conditions() {
        let evaluator = ConditionEvaluator::default();
        let event = order_event(json!(100));

        assert!(evaluator.evaluate(
            &tree(json!({"type": "field", "field": "context.source", "operator": "equals", "value": "api"})),
            &event
        ));
        assert!(evaluator.evaluate(
            &tree(json!({"type": "time", "field": "hour", "operator": "in", "value": [9, 10, 11]})),
            &event
        ));
        // 2024-05-01 is a Wednesday
        assert!(evaluator.evaluate(
            &tree(json!({"type": "time", "field": "weekday", "operator": "equals", "value": 3})),
            &event
        ));
        assert!(evaluator.evaluate(
            &tree(json!({"type": "time", "operator": "gt", "value": "2024-05-01T12:00:00+02:00"})),
            &event
        ));
        assert!(!evaluator.evaluate(
            &tree(json!({"type": "time", "operator": "gt", "value": "yesterday"})),
            &event
        ));
    }

    #[test]
    fn test_custom_predicates() {
        let predicates = PredicateRegistry::new();
        predicates.register("min_total", |event, params| {
            let min = params["min"].as_f64().ok_or("missing min")?;
            Ok(event.data["total_amount"].as_f64().unwrap_or(0.0) >= min)
        });
        predicates.register("explodes", |_, _| panic!("boom"));
        let evaluator = ConditionEvaluator::new(predicates);
        let event = order_event(json!(500));

        assert!(evaluator.evaluate(
            &tree(json!({"type": "custom", "name": "min_total", "params": {"min": 100}})),
            &event
        ));
        assert!(!evaluator.evaluate(
            &tree(json!({"type": "custom", "name": "min_total", "params": {}})),
            &event
        ));
        assert!(!evaluator.evaluate(&tree(json!({"type": "custom", "name": "explodes"})), &event));
        assert!(!evaluator.evaluate(&tree(json!({"type": "custom", "name": "unknown"})), &event));
    }

    #[test]
    fn test_tree_serialization_shape() {
        let condition = tree(json!({"not": [
            {"type": "role", "operator": "equals", "value": "guest"}
        ]}));
        let round = serde_json::to_value(&condition).unwrap();

        assert_eq!(
            round,
            json!({"not": [{"type": "role", "operator": "equals", "value": "guest"}]})
        );
    }
}
