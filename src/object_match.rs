//! Object-match filters.
//!
//! A filter maps field names to either a literal (implicit `$eq`) or an
//! operator record such as `{"$gt": 3}`. Every non-empty object condition is
//! an operator record, so equality against an object value is written
//! `{"$eq": {...}}`. Every field condition must hold for the object to match.
//! Absent fields compare as `null`.
//!
//! Validation is a separate pass: [`match_object`] never validates. Callers
//! accepting untrusted filters run [`validate_object_filter`] first. An
//! operator unknown to the matcher makes its condition fail, so an unvalidated
//! filter can only ever produce a non-match, never a panic.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON-shaped record (object values, filters, updates).
pub type Record = Map<String, Value>;

/// Supported comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    /// Any-type equality.
    Eq,
    /// Numeric greater-than.
    Gt,
    /// Numeric greater-or-equal.
    Ge,
    /// Numeric less-than.
    Lt,
    /// Numeric less-or-equal.
    Le,
    /// Membership in a list of strings/numbers.
    In,
}

impl FilterOperator {
    /// Parses an operator name such as `$gt`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "$eq" => Some(Self::Eq),
            "$gt" => Some(Self::Gt),
            "$ge" => Some(Self::Ge),
            "$lt" => Some(Self::Lt),
            "$le" => Some(Self::Le),
            "$in" => Some(Self::In),
            _ => None,
        }
    }

    /// The operator's name as written in filters.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Gt => "$gt",
            Self::Ge => "$ge",
            Self::Lt => "$lt",
            Self::Le => "$le",
            Self::In => "$in",
        }
    }

    const fn is_numeric(self) -> bool {
        matches!(self, Self::Gt | Self::Ge | Self::Lt | Self::Le)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`match_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Whether every field condition held.
    pub matches: bool,
}

/// Outcome of [`validate_object_filter`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValidation {
    Valid,
    Invalid {
        field: Option<String>,
        operator: Option<String>,
        message: String,
    },
}

impl FilterValidation {
    /// Builds an invalid result.
    #[must_use]
    pub fn invalid(
        field: Option<&str>,
        operator: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::Invalid {
            field: field.map(str::to_string),
            operator: operator.map(str::to_string),
            message: message.into(),
        }
    }

    /// Returns true for [`FilterValidation::Valid`].
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl fmt::Display for FilterValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => f.write_str("valid"),
            Self::Invalid { message, .. } => f.write_str(message),
        }
    }
}

/// Returns the operator record behind a field condition, if it is one.
///
/// Any non-empty object is an operator record, and each of its keys must name
/// an operator. Every other value is a literal compared with `$eq`.
fn operator_record(condition: &Value) -> Option<&Record> {
    match condition {
        Value::Object(map) if !map.is_empty() => Some(map),
        _ => None,
    }
}

/// Equality with numbers compared by value (`5 == 5.0`).
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn compare(op: FilterOperator, actual: &Value, operand: &Value) -> bool {
    match op {
        FilterOperator::Eq => loose_eq(actual, operand),
        FilterOperator::In => match operand {
            Value::Array(items) => items.iter().any(|item| loose_eq(actual, item)),
            _ => false,
        },
        FilterOperator::Gt | FilterOperator::Ge | FilterOperator::Lt | FilterOperator::Le => {
            let (Some(a), Some(b)) = (actual.as_f64(), operand.as_f64()) else {
                return false;
            };
            match op {
                FilterOperator::Gt => a > b,
                FilterOperator::Ge => a >= b,
                FilterOperator::Lt => a < b,
                _ => a <= b,
            }
        }
    }
}

/// Evaluates `filter` against `object`.
#[must_use]
pub fn match_object(object: &Record, filter: &Record) -> MatchResult {
    let matches = filter.iter().all(|(field, condition)| {
        let actual = object.get(field).unwrap_or(&Value::Null);
        match operator_record(condition) {
            None => loose_eq(actual, condition),
            Some(ops) => ops.iter().all(|(name, operand)| {
                FilterOperator::parse(name).is_some_and(|op| compare(op, actual, operand))
            }),
        }
    });
    MatchResult { matches }
}

/// Checks a filter for structural problems before it is used for matching.
#[must_use]
pub fn validate_object_filter(filter: &Record) -> FilterValidation {
    for (field, condition) in filter {
        if field.starts_with('$') {
            return FilterValidation::invalid(
                None,
                None,
                format!("found field name starting with $: {field}"),
            );
        }

        let Some(ops) = operator_record(condition) else {
            continue;
        };

        for (name, operand) in ops {
            let Some(op) = FilterOperator::parse(name) else {
                return FilterValidation::invalid(
                    Some(field),
                    Some(name),
                    format!("found invalid operator for field '{field}': {name}"),
                );
            };

            if op.is_numeric() && !operand.is_number() {
                return FilterValidation::invalid(
                    Some(field),
                    Some(name),
                    "should compare with a number",
                );
            }

            if op == FilterOperator::In {
                let Value::Array(items) = operand else {
                    return FilterValidation::invalid(
                        Some(field),
                        Some(name),
                        "should compare with an array",
                    );
                };
                if !items.iter().all(|v| v.is_string() || v.is_number()) {
                    return FilterValidation::invalid(
                        Some(field),
                        Some(name),
                        "should compare with an array of strings or numbers",
                    );
                }
            }
        }
    }

    FilterValidation::Valid
}
