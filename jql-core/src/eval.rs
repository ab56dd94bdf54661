//! Boolean evaluation shared by every backend.
//!
//! The walker owns the grammar-level rules: `or`/`and` nesting, groups,
//! boolean literals, placeholder binding, null tests and the rule that a
//! path which does not resolve never matches a value (it only equals null).
//! Backends supply leaf resolution through [`PathResolver`] and
//! [`ValueComparer`]; the result of
//! a walk is whatever [`Verdict`] the backend produces (a `bool` for an
//! in-memory document, an SQL fragment for the relational translator).

use std::fmt;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::ast::{CompareOp, FieldPath, Node, NodeKind};
use crate::error::{JqlError, JqlResult};
use crate::value::{decimal_from_number, number_from_decimal, type_name};

/// Right-hand side of a comparison after placeholder binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(Decimal),
    String(String),
    Bool(bool),
    Null,
}

impl Operand {
    /// Bind a value node: either a literal or a 1-based placeholder.
    pub fn from_node(node: &Node, params: &[Value]) -> JqlResult<Self> {
        match &node.kind {
            NodeKind::NumberLiteral(n) => Ok(Operand::Number(*n)),
            NodeKind::StringLiteral(s) => Ok(Operand::String(s.clone())),
            NodeKind::BooleanLiteral(b) => Ok(Operand::Bool(*b)),
            NodeKind::NullLiteral => Ok(Operand::Null),
            NodeKind::Placeholder(index) => Self::from_param(*index, params),
            other => Err(JqlError::TypeCoercion(format!(
                "{:?} is not a comparable value",
                other
            ))),
        }
    }

    /// Resolve `$index` against the caller's parameters.
    pub fn from_param(index: usize, params: &[Value]) -> JqlResult<Self> {
        let value = param(index, params)?;
        match value {
            Value::Null => Ok(Operand::Null),
            Value::Bool(b) => Ok(Operand::Bool(*b)),
            Value::String(s) => Ok(Operand::String(s.clone())),
            Value::Number(n) => decimal_from_number(n).map(Operand::Number).ok_or_else(|| {
                JqlError::TypeCoercion(format!("parameter ${} is out of numeric range", index))
            }),
            other => Err(JqlError::TypeCoercion(format!(
                "parameter ${} is {}, expected a scalar",
                index,
                type_name(other)
            ))),
        }
    }

    /// The operand as a JSON value, for binding into a prepared statement.
    pub fn to_value(&self) -> Value {
        match self {
            Operand::Number(n) => number_from_decimal(n),
            Operand::String(s) => Value::String(s.clone()),
            Operand::Bool(b) => Value::Bool(*b),
            Operand::Null => Value::Null,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Operand::Number(_) => "number",
            Operand::String(_) => "string",
            Operand::Bool(_) => "boolean",
            Operand::Null => "null",
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Number(n) => write!(f, "{}", n),
            Operand::String(s) => write!(f, "'{}'", s),
            Operand::Bool(b) => write!(f, "{}", b),
            Operand::Null => f.write_str("null"),
        }
    }
}

/// Look up `$index` (1-based) in `params`.
pub fn param(index: usize, params: &[Value]) -> JqlResult<&Value> {
    index
        .checked_sub(1)
        .and_then(|i| params.get(i))
        .ok_or(JqlError::PlaceholderOutOfRange {
            index,
            available: params.len(),
        })
}

/// Outcome of evaluating a boolean tree.
pub trait Verdict: Sized {
    fn constant(value: bool) -> Self;

    /// Conjunction of all terms.
    fn all(terms: Vec<Self>) -> Self;

    /// Disjunction of all terms.
    fn any(terms: Vec<Self>) -> Self;
}

impl Verdict for bool {
    fn constant(value: bool) -> Self {
        value
    }

    fn all(terms: Vec<Self>) -> Self {
        terms.into_iter().all(|t| t)
    }

    fn any(terms: Vec<Self>) -> Self {
        terms.into_iter().any(|t| t)
    }
}

/// Resolves a field path to something a comparer can work with.
///
/// `None` means the path is undefined for the current target.
pub trait PathResolver {
    type Resolved;

    fn resolve(&self, path: &FieldPath) -> Option<Self::Resolved>;
}

/// Leaf comparisons of a backend.
pub trait ValueComparer: PathResolver {
    type Verdict: Verdict;

    /// `lhs op rhs` for a non-null operand. Booleans only reach this with
    /// `=` or `!=`. An error marks the term as non-matching.
    fn compare(
        &mut self,
        path: &FieldPath,
        lhs: &Self::Resolved,
        op: CompareOp,
        rhs: &Operand,
    ) -> JqlResult<Self::Verdict>;

    /// `lhs = null` when `want_null`, otherwise `lhs != null`. An undefined
    /// path (`lhs` is `None`) counts as null.
    fn null_test(
        &mut self,
        path: &FieldPath,
        lhs: Option<&Self::Resolved>,
        want_null: bool,
    ) -> Self::Verdict;
}

/// Walks a filter tree with one comparer, collecting non-fatal errors.
pub struct Evaluator<'p> {
    params: &'p [Value],
    errors: Vec<JqlError>,
}

impl<'p> Evaluator<'p> {
    pub fn new(params: &'p [Value]) -> Self {
        Self {
            params,
            errors: Vec::new(),
        }
    }

    /// Evaluate `filter`; no filter matches everything.
    pub fn evaluate<C: ValueComparer>(&mut self, filter: Option<&Node>, comparer: &mut C) -> C::Verdict {
        match filter {
            Some(node) => self.walk(node, comparer),
            None => C::Verdict::constant(true),
        }
    }

    pub fn errors(&self) -> &[JqlError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<JqlError> {
        self.errors
    }

    fn walk<C: ValueComparer>(&mut self, node: &Node, comparer: &mut C) -> C::Verdict {
        match &node.kind {
            NodeKind::BooleanOr => {
                let terms = node.children.iter().map(|c| self.walk(c, comparer)).collect();
                C::Verdict::any(terms)
            }
            NodeKind::BooleanAnd => {
                let terms = node.children.iter().map(|c| self.walk(c, comparer)).collect();
                C::Verdict::all(terms)
            }
            NodeKind::Group => match node.children.first() {
                Some(inner) => self.walk(inner, comparer),
                None => C::Verdict::constant(false),
            },
            NodeKind::BooleanLiteral(b) => C::Verdict::constant(*b),
            NodeKind::Expression(op) => self.comparison(node, *op, comparer),
            _ => C::Verdict::constant(false),
        }
    }

    fn comparison<C: ValueComparer>(&mut self, node: &Node, op: CompareOp, comparer: &mut C) -> C::Verdict {
        let Some((path, value)) = node.expression_parts() else {
            return C::Verdict::constant(false);
        };

        let operand = match Operand::from_node(value, self.params) {
            Ok(operand) => operand,
            Err(e) => {
                self.errors.push(e);
                return C::Verdict::constant(false);
            }
        };

        let lhs = comparer.resolve(&path);

        match (&operand, op) {
            (Operand::Null, CompareOp::Equal) => comparer.null_test(&path, lhs.as_ref(), true),
            (Operand::Null, CompareOp::NotEqual) => comparer.null_test(&path, lhs.as_ref(), false),
            (Operand::Null, _) => C::Verdict::constant(false),
            (Operand::Bool(_), op) if !op.is_equality() => C::Verdict::constant(false),
            _ => {
                let Some(lhs) = lhs else {
                    return C::Verdict::constant(false);
                };
                match comparer.compare(&path, &lhs, op, &operand) {
                    Ok(verdict) => verdict,
                    Err(e) => {
                        self.errors.push(e);
                        C::Verdict::constant(false)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;
    use std::collections::HashMap;

    /// Flat map of dotted paths to numbers.
    struct MapComparer {
        fields: HashMap<String, i64>,
    }

    impl PathResolver for MapComparer {
        type Resolved = i64;

        fn resolve(&self, path: &FieldPath) -> Option<i64> {
            self.fields.get(&path.to_string()).copied()
        }
    }

    impl ValueComparer for MapComparer {
        type Verdict = bool;

        fn compare(&mut self, _: &FieldPath, lhs: &i64, op: CompareOp, rhs: &Operand) -> JqlResult<bool> {
            match rhs {
                Operand::Number(n) => Ok(op.holds(Decimal::from(*lhs).cmp(n))),
                other => Err(JqlError::TypeCoercion(format!("not a number: {}", other))),
            }
        }

        fn null_test(&mut self, _: &FieldPath, lhs: Option<&i64>, want_null: bool) -> bool {
            lhs.is_none() == want_null
        }
    }

    fn run(query: &str, params: &[Value]) -> (bool, Vec<JqlError>) {
        let query = parse(query).unwrap();
        let mut comparer = MapComparer {
            fields: HashMap::from([("a".to_string(), 1), ("b.c".to_string(), 5)]),
        };
        let mut evaluator = Evaluator::new(params);
        let verdict = evaluator.evaluate(query.filter(), &mut comparer);
        (verdict, evaluator.into_errors())
    }

    #[test]
    fn test_no_filter_matches() {
        assert_eq!(run("", &[]), (true, vec![]));
    }

    #[test]
    fn test_precedence() {
        assert!(run("a = 2 or a = 1 and b.c = 5", &[]).0);
        assert!(!run("(a = 2 or a = 1) and b.c = 6", &[]).0);
        assert!(run("false or true", &[]).0);
    }

    #[test]
    fn test_undefined_path_is_false_without_error() {
        assert_eq!(run("missing = 1", &[]), (false, vec![]));
        assert_eq!(run("missing != 1", &[]), (false, vec![]));
        assert_eq!(run("missing > $1", &[json!(0)]), (false, vec![]));
    }

    #[test]
    fn test_undefined_path_counts_as_null() {
        assert!(run("missing = null", &[]).0);
        assert!(!run("missing != null", &[]).0);
    }

    #[test]
    fn test_placeholders() {
        assert!(run("b.c > $1", &[json!(4)]).0);
        let (matched, errors) = run("b.c > $2", &[json!(4)]);
        assert!(!matched);
        assert_eq!(
            errors,
            vec![JqlError::PlaceholderOutOfRange {
                index: 2,
                available: 1
            }]
        );
    }

    #[test]
    fn test_error_term_is_false_but_scan_continues() {
        let (matched, errors) = run("a = 'x' or a = 1", &[]);
        assert!(matched);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_null_and_bool_operators() {
        assert!(run("a != null", &[]).0);
        assert!(!run("a > null", &[]).0);
        assert!(!run("a > true", &[]).0);
    }

    #[test]
    fn test_container_params_are_type_errors() {
        let (matched, errors) = run("a = $1", &[json!([1, 2])]);
        assert!(!matched);
        assert!(matches!(errors[0], JqlError::TypeCoercion(_)));
    }

    #[test]
    fn test_param_lookup() {
        let params = [json!("x")];
        assert_eq!(param(1, &params).unwrap(), &json!("x"));
        assert!(param(0, &params).is_err());
        assert!(param(2, &params).is_err());
    }
}
