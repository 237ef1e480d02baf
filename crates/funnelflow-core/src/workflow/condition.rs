//! Condition evaluator for CONDITION steps.
//!
//! Pure predicate evaluation over a two-root context: `contact.*` resolves
//! against the execution's contact (camelCase field names) and `data.*`
//! against the data bag. Missing path segments resolve to *undefined*; no
//! input ever makes evaluation fail.

use funnelflow_types::workflow::{ConditionConfig, ConditionLogic, ConditionOperator, ConditionRule};
use serde_json::Value;

/// Evaluates condition rules against a JSON context of shape
/// `{ "contact": {..} | null, "data": {..} }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a whole CONDITION config. AND over an empty list is true,
    /// OR over an empty list is false.
    pub fn evaluate(&self, config: &ConditionConfig, ctx: &Value) -> bool {
        match config.logic {
            ConditionLogic::And => config.conditions.iter().all(|r| self.evaluate_rule(r, ctx)),
            ConditionLogic::Or => config.conditions.iter().any(|r| self.evaluate_rule(r, ctx)),
        }
    }

    /// Evaluate one `<field> <operator> <value>` predicate.
    pub fn evaluate_rule(&self, rule: &ConditionRule, ctx: &Value) -> bool {
        let actual = resolve_path(ctx, &rule.field);
        let expected = &rule.value;

        match rule.operator {
            ConditionOperator::Equals => actual.is_some_and(|a| values_equal(a, expected)),
            ConditionOperator::NotEquals => !actual.is_some_and(|a| values_equal(a, expected)),
            ConditionOperator::Contains => string_contains(actual, expected).unwrap_or(false),
            ConditionOperator::NotContains => string_contains(actual, expected)
                .map(|found| !found)
                .unwrap_or(false),
            ConditionOperator::GreaterThan => {
                compare_numbers(actual, expected).is_some_and(|o| o.is_gt())
            }
            ConditionOperator::LessThan => {
                compare_numbers(actual, expected).is_some_and(|o| o.is_lt())
            }
            ConditionOperator::IsEmpty => is_empty(actual),
            ConditionOperator::IsNotEmpty => !is_empty(actual),
            ConditionOperator::Unsupported => {
                tracing::debug!(field = rule.field.as_str(), "unsupported condition operator");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Resolve a dot path such as `contact.customFields.plan` or `data.items.0.sku`.
///
/// Returns `None` (undefined) if any segment is missing. Numeric segments
/// index into arrays.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// JSON equality, except numbers compare by value (`1 == 1.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// `Some(found)` when both operands are strings, `None` otherwise.
fn string_contains(actual: Option<&Value>, expected: &Value) -> Option<bool> {
    match (actual?, expected) {
        (Value::String(haystack), Value::String(needle)) => Some(haystack.contains(needle.as_str())),
        _ => None,
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let a = actual?.as_f64()?;
    let b = expected.as_f64()?;
    a.partial_cmp(&b)
}

/// Undefined, null and "" are empty. `0`, `false`, `[]` and `{}` are not.
fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
