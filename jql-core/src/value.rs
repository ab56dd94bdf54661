//! Value helpers shared by both execution backends.
//!
//! - decimal_from_number: exact conversion of JSON numbers for comparisons
//! - coerce_number: numeric coercion used by the aggregation engine
//! - SortKey: ordering of extracted values, mirroring SQLite's storage-class order

use std::cmp::Ordering;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Number, Value};

/// Convert a JSON number to an exact decimal.
///
/// Floats go through their shortest round-trip representation, so `0.1`
/// becomes exactly `0.1`. Returns `None` when the value is out of range.
pub fn decimal_from_number(number: &Number) -> Option<Decimal> {
    if let Some(i) = number.as_i64() {
        return Some(Decimal::from(i));
    }
    if let Some(u) = number.as_u64() {
        return Some(Decimal::from(u));
    }
    let text = number.to_string();
    if text.contains(['e', 'E']) {
        Decimal::from_scientific(&text).ok()
    } else {
        Decimal::from_str(&text).ok()
    }
}

/// Compare a JSON number with a decimal, exactly when both fit a decimal.
pub fn compare_number(number: &Number, decimal: &Decimal) -> Ordering {
    match decimal_from_number(number) {
        Some(d) => d.cmp(decimal),
        None => {
            let left = number.as_f64().unwrap_or(0.0);
            let right = decimal.to_f64().unwrap_or(0.0);
            left.partial_cmp(&right).unwrap_or(Ordering::Equal)
        }
    }
}

/// JSON number from a decimal, integral when possible.
pub fn number_from_decimal(decimal: &Decimal) -> Value {
    if decimal.fract().is_zero() {
        if let Some(i) = decimal.to_i64() {
            return Value::from(i);
        }
    }
    decimal
        .to_f64()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// JSON number from an f64; NaN and infinities become null.
pub fn number_from_f64(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// Numeric coercion for aggregation: numbers, numeric strings and booleans
/// (as 0/1). Anything else counts as absent.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Name of a JSON value's type, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolve a dotted path through nested objects.
pub fn lookup<'a, S: AsRef<str>>(document: &'a Value, segments: &[S]) -> Option<&'a Value> {
    let mut current = document;
    for segment in segments {
        current = current.as_object()?.get(segment.as_ref())?;
    }
    Some(current)
}

/// Sort key for `order` clauses.
///
/// Null (or missing) sorts first, then numbers (booleans count as 0/1), then
/// text; containers sort as their compact JSON text. This is the order SQLite
/// gives to values extracted with `->>`.
#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    Null,
    Number(f64),
    Text(String),
}

impl SortKey {
    /// Key for a plain `order path` clause.
    pub fn natural(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => SortKey::Null,
            Some(Value::Bool(b)) => SortKey::Number(if *b { 1.0 } else { 0.0 }),
            Some(Value::Number(n)) => SortKey::Number(n.as_f64().unwrap_or(0.0)),
            Some(Value::String(s)) => SortKey::Text(s.clone()),
            Some(other) => SortKey::Text(other.to_string()),
        }
    }

    /// Key for an `order numeric(path)` clause, i.e. `CAST(x AS FLOAT)`.
    pub fn numeric(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => SortKey::Null,
            Some(Value::Bool(b)) => SortKey::Number(if *b { 1.0 } else { 0.0 }),
            Some(Value::Number(n)) => SortKey::Number(n.as_f64().unwrap_or(0.0)),
            Some(Value::String(s)) => SortKey::Number(leading_number(s)),
            Some(_) => SortKey::Number(0.0),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortKey::Null => 0,
            SortKey::Number(_) => 1,
            SortKey::Text(_) => 2,
        }
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Longest numeric prefix of `s` as a float, 0 when there is none.
fn leading_number(s: &str) -> f64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    let mut best = 0.0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    while end < bytes.len() && matches!(bytes[end], b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-') {
        end += 1;
        if let Ok(v) = s[..end].parse::<f64>() {
            best = v;
        }
    }

    best
}
