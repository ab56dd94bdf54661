//! In-memory evaluation of a filter against one decoded document.

use rust_decimal::Decimal;
use serde_json::Value;

use crate::ast::{CompareOp, FieldPath, Node};
use crate::error::{JqlError, JqlResult};
use crate::eval::{Evaluator, Operand, PathResolver, ValueComparer};
use crate::value::{compare_number, lookup, type_name};

/// A path resolved against a stored object.
#[derive(Debug, Clone, Copy)]
pub enum Resolved<'a> {
    /// The object id (`$id`), which is never stored inside the document
    Id(i64),
    Field(&'a Value),
}

/// Compares document fields with bound operands.
pub struct DocumentSelector<'a> {
    id: i64,
    document: &'a Value,
}

impl<'a> DocumentSelector<'a> {
    pub fn new(id: i64, document: &'a Value) -> Self {
        Self { id, document }
    }
}

impl<'a> PathResolver for DocumentSelector<'a> {
    type Resolved = Resolved<'a>;

    fn resolve(&self, path: &FieldPath) -> Option<Resolved<'a>> {
        if path.is_id() {
            return Some(Resolved::Id(self.id));
        }
        lookup(self.document, &path.segments).map(Resolved::Field)
    }
}

impl<'a> ValueComparer for DocumentSelector<'a> {
    type Verdict = bool;

    fn compare(
        &mut self,
        path: &FieldPath,
        lhs: &Resolved<'a>,
        op: CompareOp,
        rhs: &Operand,
    ) -> JqlResult<bool> {
        let value = match lhs {
            Resolved::Id(id) => {
                return Ok(match rhs {
                    Operand::Number(n) => op.holds(Decimal::from(*id).cmp(n)),
                    _ => false,
                });
            }
            Resolved::Field(value) => *value,
        };

        match (value, rhs) {
            (Value::Null, _) => Ok(false),
            (Value::Number(n), Operand::Number(d)) => Ok(op.holds(compare_number(n, d))),
            (Value::String(s), Operand::String(t)) => Ok(op.holds(s.as_bytes().cmp(t.as_bytes()))),
            (Value::Bool(b), Operand::Bool(c)) => Ok(match op {
                CompareOp::Equal => b == c,
                CompareOp::NotEqual => b != c,
                _ => false,
            }),
            (value, rhs) => Err(JqlError::TypeCoercion(format!(
                "cannot compare {} at '{}' with {} {}",
                type_name(value),
                path,
                rhs.type_name(),
                rhs
            ))),
        }
    }

    fn null_test(&mut self, _path: &FieldPath, lhs: Option<&Resolved<'a>>, want_null: bool) -> bool {
        let is_null = matches!(lhs, None | Some(Resolved::Field(Value::Null)));
        is_null == want_null
    }
}

/// Evaluate `filter` against a document stored under `id`.
///
/// Returns whether it matches plus the non-fatal errors met on the way.
pub fn evaluate_document(
    filter: Option<&Node>,
    id: i64,
    document: &Value,
    params: &[Value],
) -> (bool, Vec<JqlError>) {
    let mut selector = DocumentSelector::new(id, document);
    let mut evaluator = Evaluator::new(params);
    let matched = evaluator.evaluate(filter, &mut selector);
    (matched, evaluator.into_errors())
}
