use std::cmp::Ordering;
use std::fmt;

use rust_decimal::Decimal;

use crate::error::Span;

/// Reserved document field holding the object id.
pub const ID_FIELD: &str = "$id";

/// Comparison operators allowed between a path and a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
}

impl CompareOp {
    pub fn is_equality(&self) -> bool {
        matches!(self, CompareOp::Equal | CompareOp::NotEqual)
    }

    /// Whether `left.cmp(right) == ordering` satisfies this operator.
    pub fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Equal => ordering == Ordering::Equal,
            CompareOp::NotEqual => ordering != Ordering::Equal,
            CompareOp::GreaterThan => ordering == Ordering::Greater,
            CompareOp::LessThan => ordering == Ordering::Less,
            CompareOp::GreaterThanOrEqual => ordering != Ordering::Less,
            CompareOp::LessThanOrEqual => ordering != Ordering::Greater,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Equal => "=",
            CompareOp::NotEqual => "!=",
            CompareOp::GreaterThan => ">",
            CompareOp::LessThan => "<",
            CompareOp::GreaterThanOrEqual => ">=",
            CompareOp::LessThanOrEqual => "<=",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node kinds of the query tree. Leaf payloads live on the kind itself.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    BooleanOr,
    BooleanAnd,
    Group,
    Expression(CompareOp),
    Order,
    Cast,
    Asc,
    Desc,
    Limit,
    Offset,
    Path,
    Word(String),
    Placeholder(usize),
    StringLiteral(String),
    NumberLiteral(Decimal),
    BooleanLiteral(bool),
    NullLiteral,
    Aggregate,
    AggregateClause,
    Function(String),
    Selector,
    Wildcard,
}

/// One node of a parsed query: kind, ordered children and source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub children: Vec<Node>,
}

impl Node {
    pub fn leaf(kind: NodeKind, span: Span) -> Self {
        Self {
            kind,
            span,
            children: Vec::new(),
        }
    }

    pub fn with_children(kind: NodeKind, span: Span, children: Vec<Node>) -> Self {
        Self {
            kind,
            span,
            children,
        }
    }

    /// First direct child of the given kind (payload ignored for payload kinds).
    pub fn child(&self, matcher: fn(&NodeKind) -> bool) -> Option<&Node> {
        self.children.iter().find(|c| matcher(&c.kind))
    }

    pub fn is_value(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Placeholder(_)
                | NodeKind::StringLiteral(_)
                | NodeKind::NumberLiteral(_)
                | NodeKind::BooleanLiteral(_)
                | NodeKind::NullLiteral
        )
    }

    /// `(path, value)` of an `Expression` node.
    pub fn expression_parts(&self) -> Option<(FieldPath, &Node)> {
        if !matches!(self.kind, NodeKind::Expression(_)) {
            return None;
        }
        let path = self
            .child(|k| matches!(k, NodeKind::Path))
            .and_then(FieldPath::from_node)?;
        let value = self.children.iter().find(|c| c.is_value())?;
        Some((path, value))
    }
}

/// Dotted field path, e.g. `name.first`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath {
    pub segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from a `Path` node whose children are `Word` nodes.
    pub fn from_node(node: &Node) -> Option<Self> {
        if node.kind != NodeKind::Path {
            return None;
        }
        let segments: Option<Vec<String>> = node
            .children
            .iter()
            .map(|c| match &c.kind {
                NodeKind::Word(w) => Some(w.clone()),
                _ => None,
            })
            .collect();
        segments.filter(|s| !s.is_empty()).map(|segments| Self { segments })
    }

    /// The reserved id field, which maps to the object id rather than document data.
    pub fn is_id(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == ID_FIELD
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// A parsed query: the top-level nodes in source order.
///
/// At most one of each: the boolean filter (`BooleanOr`), `Order`, `Limit`,
/// `Offset` and `Aggregate`. A query without a filter matches every document.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub source: String,
    pub nodes: Vec<Node>,
}

impl Query {
    fn top_level(&self, kind: NodeKind) -> Option<&Node> {
        self.nodes.iter().find(|n| n.kind == kind)
    }

    pub fn filter(&self) -> Option<&Node> {
        self.top_level(NodeKind::BooleanOr)
    }

    pub fn order(&self) -> Option<&Node> {
        self.top_level(NodeKind::Order)
    }

    pub fn limit(&self) -> Option<&Node> {
        self.top_level(NodeKind::Limit)
    }

    pub fn offset(&self) -> Option<&Node> {
        self.top_level(NodeKind::Offset)
    }

    pub fn aggregate(&self) -> Option<&Node> {
        self.top_level(NodeKind::Aggregate)
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate().is_some()
    }

    /// Source text of a node of this query.
    pub fn text(&self, node: &Node) -> &str {
        node.span.slice(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_op_holds() {
        assert!(CompareOp::Equal.holds(Ordering::Equal));
        assert!(!CompareOp::Equal.holds(Ordering::Less));
        assert!(CompareOp::NotEqual.holds(Ordering::Greater));
        assert!(CompareOp::GreaterThanOrEqual.holds(Ordering::Equal));
        assert!(CompareOp::GreaterThanOrEqual.holds(Ordering::Greater));
        assert!(!CompareOp::LessThan.holds(Ordering::Equal));
        assert!(CompareOp::LessThanOrEqual.holds(Ordering::Less));
    }

    #[test]
    fn test_field_path_from_node() {
        let node = Node::with_children(
            NodeKind::Path,
            Span::new(0, 10),
            vec![
                Node::leaf(NodeKind::Word("name".to_string()), Span::new(0, 4)),
                Node::leaf(NodeKind::Word("first".to_string()), Span::new(5, 10)),
            ],
        );
        let path = FieldPath::from_node(&node).unwrap();
        assert_eq!(path.to_string(), "name.first");
        assert!(!path.is_id());
        assert!(FieldPath::new([ID_FIELD]).is_id());
    }

    #[test]
    fn test_field_path_rejects_other_nodes() {
        let node = Node::leaf(NodeKind::Wildcard, Span::new(0, 1));
        assert!(FieldPath::from_node(&node).is_none());
    }
}
