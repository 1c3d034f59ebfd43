// crates/alphred-core/src/core/guard.rs
// ============================================================================
// Module: Alphred Guard Expressions
// Description: Recursive boolean guard trees over routing-decision context.
// Purpose: Evaluate edge guards deterministically and fail closed on bad shapes.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Edge guards are recursive `and`/`or` trees over typed comparison leaves.
//! Evaluation is fail-closed: a type mismatch never matches an equality, and
//! ordered comparators on non-numeric operands are a fatal invalid-guard
//! error surfaced to the executor. Expressions deserialize shape-strictly so
//! malformed stored guards are rejected at load time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Guard evaluation errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// Guard expression shape or operand types are invalid.
    #[error("invalid guard expression: {0}")]
    InvalidExpression(String),
}

// ============================================================================
// SECTION: Expression Model
// ============================================================================

/// Logical connective for interior guard nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    /// Every condition must hold; an empty list is trivially true.
    And,
    /// At least one condition must hold; an empty list is trivially false.
    Or,
}

/// Comparison operator for guard leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equality on like-typed operands.
    #[serde(rename = "==")]
    Eq,
    /// Inequality on like-typed operands.
    #[serde(rename = "!=")]
    Ne,
    /// Numeric greater-than.
    #[serde(rename = ">")]
    Gt,
    /// Numeric less-than.
    #[serde(rename = "<")]
    Lt,
    /// Numeric greater-or-equal.
    #[serde(rename = ">=")]
    Ge,
    /// Numeric less-or-equal.
    #[serde(rename = "<=")]
    Le,
}

impl CompareOp {
    /// Returns true for the ordered comparators that require numbers.
    #[must_use]
    pub const fn is_ordered(self) -> bool {
        matches!(self, Self::Gt | Self::Lt | Self::Ge | Self::Le)
    }
}

/// Scalar guard operand.
///
/// # Invariants
/// - Only strings, finite numbers, and booleans are representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardValue {
    /// Boolean operand.
    Boolean(bool),
    /// Numeric operand (stored as f64; integers round-trip exactly to 2^53).
    Number(f64),
    /// String operand.
    String(String),
}

impl GuardValue {
    /// Returns the numeric value when this operand is a number.
    #[must_use]
    const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Boolean(_) | Self::String(_) => None,
        }
    }

    /// Like-typed equality; mismatched types are never equal.
    #[must_use]
    fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Boolean(left), Self::Boolean(right)) => left == right,
            (Self::Number(left), Self::Number(right)) => left == right,
            (Self::String(left), Self::String(right)) => left == right,
            _ => false,
        }
    }
}

impl fmt::Display for GuardValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(value) => value.fmt(f),
            Self::Number(value) => value.fmt(f),
            Self::String(value) => f.write_str(value),
        }
    }
}

/// Recursive guard expression tree.
///
/// # Invariants
/// - Interior nodes carry `logic` + `conditions`; leaves carry
///   `field` + `operator` + `value`. Any other shape fails to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardExpression {
    /// Interior `and`/`or` node.
    Logic {
        /// Logical connective applied to `conditions`.
        logic: LogicOp,
        /// Child expressions, evaluated in order with short-circuiting.
        conditions: Vec<GuardExpression>,
    },
    /// Typed comparison leaf.
    Comparison {
        /// Context field name to compare (for routing guards: `decision`).
        field: String,
        /// Comparison operator.
        operator: CompareOp,
        /// Expected operand.
        value: GuardValue,
    },
}

// ============================================================================
// SECTION: Evaluation Context
// ============================================================================

/// Field map a guard evaluates against.
///
/// Routing guards receive `{"decision": <signal>}`; the map form keeps the
/// evaluator reusable for other decision contexts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardContext {
    /// Field name to operand mapping.
    fields: BTreeMap<String, GuardValue>,
}

impl GuardContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the canonical routing context `{"decision": <signal>}`.
    #[must_use]
    pub fn for_decision(signal: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("decision".to_string(), GuardValue::String(signal.to_string()));
        Self {
            fields,
        }
    }

    /// Inserts or replaces a field operand.
    pub fn set(&mut self, field: impl Into<String>, value: GuardValue) {
        self.fields.insert(field.into(), value);
    }

    /// Looks up a field operand.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&GuardValue> {
        self.fields.get(field)
    }
}

// ============================================================================
// SECTION: Evaluation
// ============================================================================

/// Parses a stored guard expression from its JSON text.
///
/// # Errors
///
/// Returns [`GuardError::InvalidExpression`] when the JSON does not match the
/// guard shape.
pub fn parse_guard_expression(json: &str) -> Result<GuardExpression, GuardError> {
    serde_json::from_str(json).map_err(|err| GuardError::InvalidExpression(err.to_string()))
}

/// Evaluates a guard expression against a context.
///
/// # Errors
///
/// Returns [`GuardError::InvalidExpression`] when an ordered comparator meets
/// a non-numeric operand on either side.
pub fn evaluate_guard(
    expression: &GuardExpression,
    context: &GuardContext,
) -> Result<bool, GuardError> {
    match expression {
        GuardExpression::Logic {
            logic,
            conditions,
        } => match logic {
            LogicOp::And => {
                for condition in conditions {
                    if !evaluate_guard(condition, context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicOp::Or => {
                for condition in conditions {
                    if evaluate_guard(condition, context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        },
        GuardExpression::Comparison {
            field,
            operator,
            value,
        } => evaluate_comparison(context.get(field), *operator, value),
    }
}

/// Evaluates one comparison leaf with fail-closed semantics.
fn evaluate_comparison(
    actual: Option<&GuardValue>,
    operator: CompareOp,
    expected: &GuardValue,
) -> Result<bool, GuardError> {
    if operator.is_ordered() {
        let Some(expected) = expected.as_number() else {
            return Err(GuardError::InvalidExpression(format!(
                "ordered comparator requires a numeric expected value, got {expected}"
            )));
        };
        let Some(actual) = actual else {
            // Absent fields cannot satisfy an ordered comparison.
            return Ok(false);
        };
        let Some(actual) = actual.as_number() else {
            return Err(GuardError::InvalidExpression(format!(
                "ordered comparator requires a numeric context value, got {actual}"
            )));
        };
        return Ok(match operator {
            CompareOp::Gt => actual > expected,
            CompareOp::Lt => actual < expected,
            CompareOp::Ge => actual >= expected,
            CompareOp::Le => actual <= expected,
            CompareOp::Eq | CompareOp::Ne => false,
        });
    }

    let matched = actual.is_some_and(|actual| actual.loose_eq(expected));
    Ok(match operator {
        CompareOp::Eq => matched,
        CompareOp::Ne => !matched,
        CompareOp::Gt | CompareOp::Lt | CompareOp::Ge | CompareOp::Le => false,
    })
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        reason = "Test-only panic-based assertions are permitted."
    )]

    use super::CompareOp;
    use super::GuardContext;
    use super::GuardError;
    use super::GuardExpression;
    use super::GuardValue;
    use super::LogicOp;
    use super::evaluate_guard;
    use super::parse_guard_expression;

    /// Builds an equality leaf on the decision field.
    fn decision_equals(signal: &str) -> GuardExpression {
        GuardExpression::Comparison {
            field: "decision".to_string(),
            operator: CompareOp::Eq,
            value: GuardValue::String(signal.to_string()),
        }
    }

    /// Matches the canonical routing decision context.
    #[test]
    fn decision_equality() {
        let context = GuardContext::for_decision("changes_requested");
        assert!(evaluate_guard(&decision_equals("changes_requested"), &context).unwrap());
        assert!(!evaluate_guard(&decision_equals("approved"), &context).unwrap());
    }

    /// Inequality is true across type mismatches and absent fields.
    #[test]
    fn inequality_fails_open_on_mismatch() {
        let context = GuardContext::for_decision("approved");
        let ne_number = GuardExpression::Comparison {
            field: "decision".to_string(),
            operator: CompareOp::Ne,
            value: GuardValue::Number(4.0),
        };
        assert!(evaluate_guard(&ne_number, &context).unwrap());
        let absent = GuardExpression::Comparison {
            field: "missing".to_string(),
            operator: CompareOp::Ne,
            value: GuardValue::String("anything".to_string()),
        };
        assert!(evaluate_guard(&absent, &context).unwrap());
    }

    /// Equality never matches across types or absent fields.
    #[test]
    fn equality_fails_closed() {
        let context = GuardContext::for_decision("approved");
        let eq_bool = GuardExpression::Comparison {
            field: "decision".to_string(),
            operator: CompareOp::Eq,
            value: GuardValue::Boolean(true),
        };
        assert!(!evaluate_guard(&eq_bool, &context).unwrap());
        let absent = GuardExpression::Comparison {
            field: "missing".to_string(),
            operator: CompareOp::Eq,
            value: GuardValue::String("approved".to_string()),
        };
        assert!(!evaluate_guard(&absent, &context).unwrap());
    }

    /// Logic nodes short-circuit with the documented empty-list identities.
    #[test]
    fn logic_nodes() {
        let mut context = GuardContext::new();
        context.set("score", GuardValue::Number(7.0));
        let tree = GuardExpression::Logic {
            logic: LogicOp::And,
            conditions: vec![
                GuardExpression::Comparison {
                    field: "score".to_string(),
                    operator: CompareOp::Ge,
                    value: GuardValue::Number(5.0),
                },
                GuardExpression::Logic {
                    logic: LogicOp::Or,
                    conditions: vec![
                        GuardExpression::Comparison {
                            field: "score".to_string(),
                            operator: CompareOp::Lt,
                            value: GuardValue::Number(3.0),
                        },
                        GuardExpression::Comparison {
                            field: "score".to_string(),
                            operator: CompareOp::Le,
                            value: GuardValue::Number(10.0),
                        },
                    ],
                },
            ],
        };
        assert!(evaluate_guard(&tree, &context).unwrap());

        let empty_and = GuardExpression::Logic {
            logic: LogicOp::And,
            conditions: Vec::new(),
        };
        let empty_or = GuardExpression::Logic {
            logic: LogicOp::Or,
            conditions: Vec::new(),
        };
        assert!(evaluate_guard(&empty_and, &context).unwrap());
        assert!(!evaluate_guard(&empty_or, &context).unwrap());
    }

    /// Ordered comparators require numbers on both sides.
    #[test]
    fn ordered_comparators_require_numbers() {
        let context = GuardContext::for_decision("approved");
        let bad = GuardExpression::Comparison {
            field: "decision".to_string(),
            operator: CompareOp::Gt,
            value: GuardValue::Number(1.0),
        };
        assert!(matches!(
            evaluate_guard(&bad, &context),
            Err(GuardError::InvalidExpression(_))
        ));
        let bad_expected = GuardExpression::Comparison {
            field: "decision".to_string(),
            operator: CompareOp::Lt,
            value: GuardValue::String("nope".to_string()),
        };
        assert!(matches!(
            evaluate_guard(&bad_expected, &context),
            Err(GuardError::InvalidExpression(_))
        ));
    }

    /// Stored JSON parses into the expected tree and rejects bad shapes.
    #[test]
    fn parses_stored_expression_json() {
        let json = r#"{
            "logic": "or",
            "conditions": [
                {"field": "decision", "operator": "==", "value": "changes_requested"},
                {"field": "decision", "operator": "==", "value": "retry"}
            ]
        }"#;
        let parsed = parse_guard_expression(json).unwrap();
        let context = GuardContext::for_decision("retry");
        assert!(evaluate_guard(&parsed, &context).unwrap());

        assert!(parse_guard_expression(r#"{"field": "decision"}"#).is_err());
        assert!(parse_guard_expression("not json").is_err());
    }
}
