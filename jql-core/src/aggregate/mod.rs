//! Aggregation engine.
//!
//! Aggregate clauses (`| sum(age) as total, corr(y, x) as c`) are validated
//! into [`AggregateSpec`]s before any document is read; an [`Aggregation`]
//! then offers every matching document to each accumulator exactly once.

mod accumulators;

pub use accumulators::{
    Accumulator, BivariateAccumulator, CountAccumulator, Moments, UnivariateAccumulator,
};

use std::fmt;

use serde_json::{Map, Value};

use crate::ast::{FieldPath, Node, NodeKind, Query};
use crate::error::{JqlError, JqlResult, ParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Sum,
    Count,
    Avg,
    Var,
    Stddev,
    Min,
    Max,
    Cov,
    Corr,
    Regr,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name.to_ascii_lowercase().as_str() {
            "sum" => AggregateFunction::Sum,
            "count" => AggregateFunction::Count,
            "avg" => AggregateFunction::Avg,
            "var" => AggregateFunction::Var,
            "stddev" => AggregateFunction::Stddev,
            "min" => AggregateFunction::Min,
            "max" => AggregateFunction::Max,
            "cov" => AggregateFunction::Cov,
            "corr" => AggregateFunction::Corr,
            "regr" => AggregateFunction::Regr,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Var => "var",
            AggregateFunction::Stddev => "stddev",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Cov => "cov",
            AggregateFunction::Corr => "corr",
            AggregateFunction::Regr => "regr",
        }
    }

    /// Number of selector arguments the function takes.
    pub fn arity(&self) -> usize {
        if self.is_bivariate() {
            2
        } else {
            1
        }
    }

    /// Columns the SQL translation selects for this function.
    pub fn result_columns(&self) -> usize {
        if *self == AggregateFunction::Regr {
            2
        } else {
            1
        }
    }

    pub fn is_bivariate(&self) -> bool {
        matches!(
            self,
            AggregateFunction::Cov | AggregateFunction::Corr | AggregateFunction::Regr
        )
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A selector argument of an aggregate clause.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateArg {
    /// `*`, only valid for `count`
    Wildcard,
    Path(FieldPath),
}

impl AggregateArg {
    pub fn path(&self) -> Option<&FieldPath> {
        match self {
            AggregateArg::Wildcard => None,
            AggregateArg::Path(path) => Some(path),
        }
    }
}

/// One validated `function(args) as name` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub function: AggregateFunction,
    pub args: Vec<AggregateArg>,
    pub name: String,
}

impl AggregateSpec {
    fn from_node(node: &Node) -> JqlResult<Self> {
        let mut function = None;
        let mut args = Vec::new();
        let mut name = None;

        for child in &node.children {
            match &child.kind {
                NodeKind::Function(f) => function = Some(f.as_str()),
                NodeKind::Selector => match child.children.first().map(|c| (&c.kind, c)) {
                    Some((NodeKind::Wildcard, _)) => args.push(AggregateArg::Wildcard),
                    Some((NodeKind::Path, path)) => {
                        if let Some(path) = FieldPath::from_node(path) {
                            args.push(AggregateArg::Path(path));
                        }
                    }
                    _ => {}
                },
                NodeKind::Word(w) => name = Some(w.clone()),
                _ => {}
            }
        }

        let name = name.ok_or_else(|| ParseError {
            span: node.span,
            message: "aggregate clause is missing its `as` name".to_string(),
            trail: vec!["aggregate-clause"],
        })?;

        let function_name = function.unwrap_or_default();
        let function = AggregateFunction::from_name(function_name)
            .ok_or_else(|| JqlError::UnknownFunction(function_name.to_string()))?;

        if args.len() != function.arity() {
            return Err(JqlError::Arity {
                function: function.name().to_string(),
                expected: if function.is_bivariate() { "2" } else { "1" },
                got: args.len(),
            });
        }
        if function != AggregateFunction::Count && args.contains(&AggregateArg::Wildcard) {
            return Err(JqlError::TypeCoercion(format!(
                "{}(*) is not allowed, only count(*) accepts a wildcard",
                function
            )));
        }

        Ok(Self {
            function,
            args,
            name,
        })
    }

    /// Fresh accumulator for this clause.
    pub fn accumulator(&self) -> Box<dyn Accumulator> {
        let path = |i: usize| self.args.get(i).and_then(AggregateArg::path).cloned();
        match self.function {
            AggregateFunction::Count => Box::new(CountAccumulator::new(path(0))),
            f if f.is_bivariate() => Box::new(BivariateAccumulator::new(
                f,
                path(0).unwrap_or_default(),
                path(1).unwrap_or_default(),
            )),
            f => Box::new(UnivariateAccumulator::new(f, path(0).unwrap_or_default())),
        }
    }
}

/// Validate the aggregate clauses of `query`; empty when there are none.
pub fn aggregate_specs(query: &Query) -> JqlResult<Vec<AggregateSpec>> {
    let Some(aggregate) = query.aggregate() else {
        return Ok(Vec::new());
    };
    aggregate
        .children
        .iter()
        .filter(|c| c.kind == NodeKind::AggregateClause)
        .map(AggregateSpec::from_node)
        .collect()
}

/// All clauses of one query, fed in a single pass.
pub struct Aggregation {
    clauses: Vec<(String, Box<dyn Accumulator>)>,
}

impl Aggregation {
    pub fn new(specs: &[AggregateSpec]) -> Self {
        Self {
            clauses: specs
                .iter()
                .map(|spec| (spec.name.clone(), spec.accumulator()))
                .collect(),
        }
    }

    pub fn accumulate(&mut self, document: &Value) {
        for (_, accumulator) in &mut self.clauses {
            accumulator.accumulate(document);
        }
    }

    /// One object mapping each clause name to its result.
    pub fn finish(&self) -> Value {
        let mut result = Map::new();
        for (name, accumulator) in &self.clauses {
            result.insert(name.clone(), accumulator.compute());
        }
        Value::Object(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    fn specs(query: &str) -> JqlResult<Vec<AggregateSpec>> {
        aggregate_specs(&parse(query).unwrap())
    }

    #[test]
    fn test_no_aggregate() {
        assert!(specs("a = 1").unwrap().is_empty());
    }

    #[test]
    fn test_specs() {
        let specs = specs("| count(*) as n, SUM(a.b) as total, regr(y, x) as fit").unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].function, AggregateFunction::Count);
        assert_eq!(specs[0].args, vec![AggregateArg::Wildcard]);
        assert_eq!(specs[1].function, AggregateFunction::Sum);
        assert_eq!(specs[1].name, "total");
        assert_eq!(
            specs[2].args,
            vec![
                AggregateArg::Path(FieldPath::new(["y"])),
                AggregateArg::Path(FieldPath::new(["x"]))
            ]
        );
    }

    #[test]
    fn test_arity_errors() {
        assert_eq!(
            specs("| corr(age) as c"),
            Err(JqlError::Arity {
                function: "corr".to_string(),
                expected: "2",
                got: 1
            })
        );
        assert!(matches!(specs("| sum(a, b) as s"), Err(JqlError::Arity { got: 2, .. })));
    }

    #[test]
    fn test_unknown_function() {
        assert_eq!(
            specs("| median(a) as m"),
            Err(JqlError::UnknownFunction("median".to_string()))
        );
    }

    #[test]
    fn test_clause_without_name_is_rejected() {
        use crate::error::Span;

        let clause = Node::with_children(
            NodeKind::AggregateClause,
            Span::new(2, 10),
            vec![
                Node::leaf(NodeKind::Function("sum".to_string()), Span::new(2, 5)),
                Node::with_children(
                    NodeKind::Selector,
                    Span::new(6, 9),
                    vec![Node::with_children(
                        NodeKind::Path,
                        Span::new(6, 9),
                        vec![Node::leaf(NodeKind::Word("age".to_string()), Span::new(6, 9))],
                    )],
                ),
            ],
        );
        match AggregateSpec::from_node(&clause) {
            Err(JqlError::Parse(err)) => assert_eq!(err.span, Span::new(2, 10)),
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_wildcard_only_for_count() {
        assert!(matches!(specs("| sum(*) as s"), Err(JqlError::TypeCoercion(_))));
    }

    #[test]
    fn test_single_pass() {
        let specs = specs("| count(*) as n, avg(v) as mean, min(v) as lo, max(v) as hi").unwrap();
        let mut aggregation = Aggregation::new(&specs);
        for v in [3, 1, 2] {
            aggregation.accumulate(&json!({ "v": v }));
        }
        assert_eq!(
            aggregation.finish(),
            json!({"n": 3, "mean": 2.0, "lo": 1.0, "hi": 3.0})
        );
    }
}
