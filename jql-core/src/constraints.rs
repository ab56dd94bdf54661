//! Order/limit/offset directives of a query.
//!
//! Only top-level `Order`, `Limit` and `Offset` nodes count; the grammar
//! never nests them inside groups. Unlike filter terms, a bad placeholder in
//! a constraint is fatal for the whole query.

use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;

use crate::ast::{FieldPath, Node, NodeKind, Query};
use crate::error::{JqlError, JqlResult};
use crate::eval::param;
use crate::value::{lookup, type_name, SortKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub path: FieldPath,
    pub direction: Direction,
    /// `order numeric(path)`: sort by numeric coercion of the value
    pub numeric: bool,
}

impl OrderBy {
    pub fn key(&self, document: &Value) -> SortKey {
        let value = lookup(document, &self.path.segments);
        if self.numeric {
            SortKey::numeric(value)
        } else {
            SortKey::natural(value)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constraints {
    pub order: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.order.is_none() && self.limit.is_none() && self.offset.is_none()
    }

    /// Sort, skip and truncate `documents`, which must arrive in id order.
    ///
    /// The sort is stable so ties keep ascending id order.
    pub fn apply(&self, mut documents: Vec<Value>) -> Vec<Value> {
        if let Some(order) = &self.order {
            let mut keyed: Vec<(SortKey, Value)> = documents
                .into_iter()
                .map(|doc| (order.key(&doc), doc))
                .collect();
            match order.direction {
                Direction::Asc => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
                Direction::Desc => keyed.sort_by(|a, b| b.0.cmp(&a.0)),
            }
            documents = keyed.into_iter().map(|(_, doc)| doc).collect();
        }

        let offset = self.offset.unwrap_or(0);
        let iter = documents.into_iter().skip(offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Extract the constraints of `query`, binding placeholders from `params`.
pub fn extract_constraints(query: &Query, params: &[Value]) -> JqlResult<Constraints> {
    let mut constraints = Constraints::default();

    for node in &query.nodes {
        match node.kind {
            NodeKind::Order => constraints.order = Some(order_by(node)?),
            NodeKind::Limit => constraints.limit = Some(bound(node, params, "limit")?),
            NodeKind::Offset => constraints.offset = Some(bound(node, params, "offset")?),
            _ => {}
        }
    }

    Ok(constraints)
}

fn order_by(node: &Node) -> JqlResult<OrderBy> {
    let malformed = || JqlError::TypeCoercion("malformed order clause".to_string());

    let target = node.children.first().ok_or_else(malformed)?;
    let (path_node, numeric) = match target.kind {
        NodeKind::Cast => (target.children.first().ok_or_else(malformed)?, true),
        _ => (target, false),
    };
    let path = FieldPath::from_node(path_node).ok_or_else(malformed)?;

    let direction = match node.children.get(1).map(|n| &n.kind) {
        Some(NodeKind::Desc) => Direction::Desc,
        _ => Direction::Asc,
    };

    Ok(OrderBy {
        path,
        direction,
        numeric,
    })
}

fn bound(node: &Node, params: &[Value], what: &str) -> JqlResult<usize> {
    let value = node
        .children
        .first()
        .ok_or_else(|| JqlError::TypeCoercion(format!("{} without a value", what)))?;

    match &value.kind {
        NodeKind::NumberLiteral(n) => n
            .fract()
            .is_zero()
            .then(|| n.to_u64())
            .flatten()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| JqlError::TypeCoercion(format!("{} {} is not a whole number", what, n))),
        NodeKind::Placeholder(index) => {
            let bound = param(*index, params)?;
            bound
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    JqlError::TypeCoercion(format!(
                        "{} parameter ${} must be a non-negative integer, got {} {}",
                        what,
                        index,
                        type_name(bound),
                        bound
                    ))
                })
        }
        other => Err(JqlError::TypeCoercion(format!("{} cannot be {:?}", what, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    fn constraints(query: &str, params: &[Value]) -> JqlResult<Constraints> {
        extract_constraints(&parse(query).unwrap(), params)
    }

    #[test]
    fn test_no_constraints() {
        let c = constraints("a = 1", &[]).unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn test_literal_constraints() {
        let c = constraints("a = 1 order numeric(b.c) desc limit 10 offset 5", &[]).unwrap();
        let order = c.order.unwrap();
        assert_eq!(order.path.to_string(), "b.c");
        assert_eq!(order.direction, Direction::Desc);
        assert!(order.numeric);
        assert_eq!(c.limit, Some(10));
        assert_eq!(c.offset, Some(5));
    }

    #[test]
    fn test_placeholder_constraints() {
        let c = constraints("limit $1 offset $2", &[json!(3), json!(0)]).unwrap();
        assert_eq!(c.limit, Some(3));
        assert_eq!(c.offset, Some(0));
    }

    #[test]
    fn test_bad_placeholder_is_fatal() {
        assert!(matches!(
            constraints("limit $1", &[json!("3")]),
            Err(JqlError::TypeCoercion(_))
        ));
        assert!(matches!(
            constraints("limit $1", &[json!(2.5)]),
            Err(JqlError::TypeCoercion(_))
        ));
        assert!(matches!(
            constraints("offset $1", &[json!(-1)]),
            Err(JqlError::TypeCoercion(_))
        ));
        assert!(matches!(
            constraints("limit $2", &[json!(1)]),
            Err(JqlError::PlaceholderOutOfRange { index: 2, available: 1 })
        ));
    }

    #[test]
    fn test_apply_sorts_stably_and_paginates() {
        let docs = vec![
            json!({"$id": 1, "n": 2}),
            json!({"$id": 2, "n": 1}),
            json!({"$id": 3, "n": 2}),
            json!({"$id": 4}),
        ];

        let c = constraints("order n desc", &[]).unwrap();
        let ids: Vec<_> = c.apply(docs.clone()).iter().map(|d| d["$id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(3), json!(2), json!(4)]);

        let c = constraints("order n asc limit 2 offset 1", &[]).unwrap();
        let ids: Vec<_> = c.apply(docs).iter().map(|d| d["$id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(1)]);
    }

    #[test]
    fn test_offset_past_end() {
        let c = constraints("offset 10", &[]).unwrap();
        assert!(c.apply(vec![json!({"$id": 1})]).is_empty());
    }
}
