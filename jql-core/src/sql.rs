//! Translation of JQL into SQLite SQL.
//!
//! Documents live in `objects(id, account_id, collection_id, data)` where
//! `data` is JSON text. Paths become `->` chains ending in `->>`, every typed
//! comparison is guarded by `json_type` and cast so SQLite compares values,
//! and absent keys turn into SQL NULL, which never satisfies a comparison.
//! The aggregate functions beyond SQLite's built-ins (`jql_num`, `jql_sum`,
//! `jql_avg`, `var_pop`, `stddev_pop`, `covar_pop`, `corr`, `regr_slope`,
//! `regr_intercept`) must be registered on the connection that runs the
//! statement. Aggregates that return REAL values stay plain columns so no
//! JSON rendering rounds them.

use serde_json::Value;

use crate::aggregate::{aggregate_specs, AggregateArg, AggregateFunction, AggregateSpec};
use crate::ast::{CompareOp, FieldPath, Query};
use crate::constraints::extract_constraints;
use crate::error::{JqlError, JqlResult};
use crate::eval::{Evaluator, Operand, PathResolver, ValueComparer, Verdict};

/// SQL fragment produced for a boolean sub-tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFragment(pub String);

impl SqlFragment {
    fn join(mut terms: Vec<SqlFragment>, keyword: &str) -> SqlFragment {
        match terms.len() {
            0 => SqlFragment::constant(keyword == " AND "),
            1 => terms.remove(0),
            _ => {
                let parts: Vec<String> = terms.into_iter().map(|t| t.0).collect();
                SqlFragment(format!("({})", parts.join(keyword)))
            }
        }
    }
}

impl Verdict for SqlFragment {
    fn constant(value: bool) -> Self {
        SqlFragment(if value { "1" } else { "0" }.to_string())
    }

    fn all(terms: Vec<Self>) -> Self {
        Self::join(terms, " AND ")
    }

    fn any(terms: Vec<Self>) -> Self {
        Self::join(terms, " OR ")
    }
}

/// A path as SQL expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlPath {
    /// The `id` column
    Id,
    Field {
        /// `->` chain yielding JSON text
        chain: String,
        /// same chain ending in `->>`, yielding an SQL value
        extract: String,
    },
}

impl SqlPath {
    pub fn new(path: &FieldPath) -> Self {
        if path.is_id() {
            return SqlPath::Id;
        }
        let labels: Vec<String> = path.segments.iter().map(|s| label(s)).collect();
        let chain = format!("data->{}", labels.join("->"));
        let extract = match labels.split_last() {
            Some((last, [])) => format!("data->>{}", last),
            Some((last, init)) => format!("data->{}->>{}", init.join("->"), last),
            None => "NULL".to_string(),
        };
        SqlPath::Field { chain, extract }
    }

    /// Expression used for JSON-typed access (counting, numeric coercion).
    pub fn json(&self) -> &str {
        match self {
            SqlPath::Id => "id",
            SqlPath::Field { chain, .. } => chain,
        }
    }

    /// Expression yielding the SQL value at the path.
    pub fn value(&self) -> &str {
        match self {
            SqlPath::Id => "id",
            SqlPath::Field { extract, .. } => extract,
        }
    }
}

/// Object key as an SQLite JSON label.
fn label(segment: &str) -> String {
    let escaped = segment.replace('\'', "''");
    if segment.starts_with('$') {
        // A leading '$' would be read as a JSON path
        format!("'$.\"{}\"'", escaped.replace('"', "\\\""))
    } else {
        format!("'{}'", escaped)
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Emits WHERE fragments, collecting bound parameters.
struct SqlEmitter<'a> {
    params: &'a mut Vec<Value>,
}

impl SqlEmitter<'_> {
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }
}

impl PathResolver for SqlEmitter<'_> {
    type Resolved = SqlPath;

    fn resolve(&self, path: &FieldPath) -> Option<SqlPath> {
        Some(SqlPath::new(path))
    }
}

impl ValueComparer for SqlEmitter<'_> {
    type Verdict = SqlFragment;

    fn compare(
        &mut self,
        _path: &FieldPath,
        lhs: &SqlPath,
        op: CompareOp,
        rhs: &Operand,
    ) -> JqlResult<SqlFragment> {
        let (chain, extract) = match lhs {
            SqlPath::Id => {
                return Ok(match rhs {
                    Operand::Number(_) => {
                        let param = self.bind(rhs.to_value());
                        SqlFragment(format!("id {} {}", op, param))
                    }
                    _ => SqlFragment::constant(false),
                });
            }
            SqlPath::Field { chain, extract } => (chain, extract),
        };

        let sql = match rhs {
            Operand::Number(_) => {
                let param = self.bind(rhs.to_value());
                format!(
                    "(json_type({}) IN ('integer', 'real') AND CAST({} AS FLOAT) {} {})",
                    chain, extract, op, param
                )
            }
            Operand::String(_) => {
                let param = self.bind(rhs.to_value());
                format!("(json_type({}) = 'text' AND {} {} {})", chain, extract, op, param)
            }
            Operand::Bool(b) => {
                let param = self.bind(Value::from(i64::from(*b)));
                format!(
                    "(json_type({}) IN ('true', 'false') AND CAST({} AS BOOLEAN) {} {})",
                    chain, extract, op, param
                )
            }
            Operand::Null => return Ok(SqlFragment::constant(false)),
        };
        Ok(SqlFragment(sql))
    }

    fn null_test(&mut self, _path: &FieldPath, lhs: Option<&SqlPath>, want_null: bool) -> SqlFragment {
        match lhs {
            Some(SqlPath::Id) => SqlFragment::constant(!want_null),
            Some(path) => {
                let test = if want_null { "IS NULL" } else { "IS NOT NULL" };
                SqlFragment(format!("{} {}", path.value(), test))
            }
            None => SqlFragment::constant(want_null),
        }
    }
}

/// One SQL select expression of an aggregate clause.
fn aggregate_expression(spec: &AggregateSpec) -> String {
    let path = |i: usize| {
        spec.args
            .get(i)
            .and_then(AggregateArg::path)
            .map(SqlPath::new)
            .unwrap_or(SqlPath::Id)
    };
    let num = |i: usize| format!("jql_num({})", path(i).json());

    let expression = match spec.function {
        AggregateFunction::Count => match spec.args.first() {
            Some(AggregateArg::Path(p)) => format!("COUNT({})", SqlPath::new(p).json()),
            _ => "COUNT(*)".to_string(),
        },
        AggregateFunction::Sum => format!("jql_sum({})", num(0)),
        AggregateFunction::Avg => format!("jql_avg({})", num(0)),
        AggregateFunction::Min => format!("MIN({})", num(0)),
        AggregateFunction::Max => format!("MAX({})", num(0)),
        AggregateFunction::Var => format!("var_pop({})", num(0)),
        AggregateFunction::Stddev => format!("stddev_pop({})", num(0)),
        AggregateFunction::Cov => format!("covar_pop({}, {})", num(0), num(1)),
        AggregateFunction::Corr => format!("corr({}, {})", num(0), num(1)),
        // Slope and intercept come back as two REAL columns; the caller
        // assembles `{a, b}`
        AggregateFunction::Regr => {
            return format!(
                "regr_slope({y}, {x}) AS {a}, regr_intercept({y}, {x}) AS {b}",
                y = num(0),
                x = num(1),
                a = quote_identifier(&spec.name),
                b = quote_identifier(&format!("{}.b", spec.name))
            )
        }
    };

    format!("{} AS {}", expression, quote_identifier(&spec.name))
}

/// A translated query.
///
/// Placeholders are numbered (`?1`, `?2`, ...) in the order of `params`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlQuery {
    pub where_sql: String,
    /// `ORDER BY ...`, empty when the query has no order clause
    pub order_sql: String,
    pub limit_sql: String,
    pub offset_sql: String,
    /// One select expression per aggregate clause
    pub aggregate_sql: Vec<String>,
    pub aggregates: Vec<AggregateSpec>,
    pub params: Vec<Value>,
    /// Non-fatal errors; the affected terms translate to `0`
    pub errors: Vec<JqlError>,
}

impl SqlQuery {
    pub fn is_aggregate(&self) -> bool {
        !self.aggregates.is_empty()
    }

    /// Placeholder number the caller binds the collection id to.
    pub fn collection_param(&self) -> usize {
        self.params.len() + 1
    }

    /// Full statement over one collection of the `objects` table.
    ///
    /// Row queries select `id, data` ordered by the order clause with ties
    /// broken by ascending id; aggregate queries select one row.
    pub fn statement(&self) -> String {
        let filter = format!(
            "WHERE collection_id = ?{} AND {}",
            self.collection_param(),
            self.where_sql
        );

        if self.is_aggregate() {
            return format!("SELECT {} FROM objects {}", self.aggregate_sql.join(", "), filter);
        }

        let order = if self.order_sql.is_empty() {
            "ORDER BY id ASC".to_string()
        } else {
            format!("{}, id ASC", self.order_sql)
        };

        let mut sql = format!("SELECT id, data FROM objects {} {}", filter, order);
        for part in [&self.limit_sql, &self.offset_sql] {
            if !part.is_empty() {
                sql.push(' ');
                sql.push_str(part);
            }
        }
        sql
    }

    /// `params` followed by the collection id.
    pub fn bound_params(&self, collection_id: i64) -> Vec<Value> {
        let mut params = self.params.clone();
        params.push(Value::from(collection_id));
        params
    }
}

/// Clamp a row count into the signed 64-bit range SQLite binds.
fn sql_integer(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Translate `query` with its parameters.
///
/// Bad order/limit/offset placeholders and invalid aggregate clauses fail
/// the whole translation; filter errors are collected in `errors`.
pub fn translate(query: &Query, params: &[Value]) -> JqlResult<SqlQuery> {
    let constraints = extract_constraints(query, params)?;
    let aggregates = aggregate_specs(query)?;

    let mut bound = Vec::new();
    let mut evaluator = Evaluator::new(params);
    let where_sql = {
        let mut emitter = SqlEmitter { params: &mut bound };
        evaluator.evaluate(query.filter(), &mut emitter).0
    };

    let mut sql = SqlQuery {
        where_sql,
        errors: evaluator.into_errors(),
        ..SqlQuery::default()
    };

    if !aggregates.is_empty() {
        sql.aggregate_sql = aggregates.iter().map(aggregate_expression).collect();
        sql.aggregates = aggregates;
        sql.params = bound;
        return Ok(sql);
    }

    if let Some(order) = &constraints.order {
        let path = SqlPath::new(&order.path);
        let key = if order.numeric && path != SqlPath::Id {
            format!("CAST({} AS FLOAT)", path.value())
        } else {
            path.value().to_string()
        };
        sql.order_sql = format!("ORDER BY {} {}", key, order.direction.as_sql());
    }

    if let Some(limit) = constraints.limit {
        bound.push(Value::from(sql_integer(limit)));
        sql.limit_sql = format!("LIMIT ?{}", bound.len());
    }
    if let Some(offset) = constraints.offset {
        if sql.limit_sql.is_empty() {
            sql.limit_sql = "LIMIT -1".to_string();
        }
        bound.push(Value::from(sql_integer(offset)));
        sql.offset_sql = format!("OFFSET ?{}", bound.len());
    }

    sql.params = bound;
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    fn sql(query: &str, params: &[Value]) -> SqlQuery {
        translate(&parse(query).unwrap(), params).unwrap()
    }

    #[test]
    fn test_empty_query() {
        let q = sql("", &[]);
        assert_eq!(q.where_sql, "1");
        assert_eq!(
            q.statement(),
            "SELECT id, data FROM objects WHERE collection_id = ?1 AND 1 ORDER BY id ASC"
        );
        assert_eq!(q.bound_params(9), vec![json!(9)]);
    }

    #[test]
    fn test_path_chains() {
        assert_eq!(
            SqlPath::new(&FieldPath::new(["name", "first"])),
            SqlPath::Field {
                chain: "data->'name'->'first'".to_string(),
                extract: "data->'name'->>'first'".to_string(),
            }
        );
        assert_eq!(SqlPath::new(&FieldPath::new(["$id"])), SqlPath::Id);
        assert_eq!(SqlPath::new(&FieldPath::new(["it's"])).value(), "data->>'it''s'");
    }

    #[test]
    fn test_typed_comparisons() {
        let q = sql("age >= 18 and name = 'John' or active = true", &[]);
        assert_eq!(
            q.where_sql,
            "(((json_type(data->'age') IN ('integer', 'real') AND CAST(data->>'age' AS FLOAT) >= ?1) \
             AND (json_type(data->'name') = 'text' AND data->>'name' = ?2)) \
             OR (json_type(data->'active') IN ('true', 'false') AND CAST(data->>'active' AS BOOLEAN) = ?3))"
        );
        assert_eq!(q.params, vec![json!(18), json!("John"), json!(1)]);
    }

    #[test]
    fn test_null_and_id() {
        let q = sql("a.b = null or c != null", &[]);
        assert_eq!(q.where_sql, "(data->'a'->>'b' IS NULL OR data->>'c' IS NOT NULL)");

        let q = sql("$id > $1 and $id != null", &[json!(3)]);
        assert_eq!(q.where_sql, "(id > ?1 AND 1)");
        assert_eq!(q.params, vec![json!(3)]);

        assert_eq!(sql("$id = 'x'", &[]).where_sql, "0");
    }

    #[test]
    fn test_placeholder_error_becomes_false() {
        let q = sql("a = $2 or b = $1", &[json!("x")]);
        assert_eq!(q.where_sql, "(0 OR (json_type(data->'b') = 'text' AND data->>'b' = ?1))");
        assert_eq!(
            q.errors,
            vec![JqlError::PlaceholderOutOfRange {
                index: 2,
                available: 1
            }]
        );
    }

    #[test]
    fn test_bool_ordering_is_false() {
        assert_eq!(sql("a < true", &[]).where_sql, "0");
        assert_eq!(sql("a > null", &[]).where_sql, "0");
    }

    #[test]
    fn test_order_limit_offset() {
        let q = sql("a = 1 order numeric(score) desc limit 10 offset $1", &[json!(5)]);
        assert_eq!(q.order_sql, "ORDER BY CAST(data->>'score' AS FLOAT) DESC");
        assert_eq!(q.limit_sql, "LIMIT ?2");
        assert_eq!(q.offset_sql, "OFFSET ?3");
        assert_eq!(q.params, vec![json!(1), json!(10), json!(5)]);
        assert!(q
            .statement()
            .ends_with("ORDER BY CAST(data->>'score' AS FLOAT) DESC, id ASC LIMIT ?2 OFFSET ?3"));
        assert!(q.statement().contains("collection_id = ?4"));
    }

    #[test]
    fn test_huge_limit_binds_as_integer() {
        let q = sql("limit 10000000000000000000", &[]);
        assert_eq!(q.params, vec![json!(i64::MAX)]);

        let q = sql("limit $1 offset $2", &[json!(u64::MAX), json!(u64::MAX)]);
        assert_eq!(q.params, vec![json!(i64::MAX), json!(i64::MAX)]);
    }

    #[test]
    fn test_offset_without_limit() {
        let q = sql("order name asc offset 2", &[]);
        assert_eq!(q.limit_sql, "LIMIT -1");
        assert_eq!(q.offset_sql, "OFFSET ?1");
    }

    #[test]
    fn test_aggregates() {
        let q = sql(
            "age > 0 | count(*) as n, count(tag) as tagged, sum(age) as total, stddev(age) as sd, regr(y, x) as fit",
            &[],
        );
        assert!(q.is_aggregate());
        assert_eq!(
            q.aggregate_sql,
            vec![
                "COUNT(*) AS \"n\"",
                "COUNT(data->'tag') AS \"tagged\"",
                "jql_sum(jql_num(data->'age')) AS \"total\"",
                "stddev_pop(jql_num(data->'age')) AS \"sd\"",
                "regr_slope(jql_num(data->'y'), jql_num(data->'x')) AS \"fit\", regr_intercept(jql_num(data->'y'), jql_num(data->'x')) AS \"fit.b\"",
            ]
        );
        assert!(q.statement().starts_with("SELECT COUNT(*) AS \"n\""));
    }

    #[test]
    fn test_fatal_errors() {
        let query = parse("| corr(a) as c").unwrap();
        assert!(matches!(translate(&query, &[]), Err(JqlError::Arity { .. })));

        let query = parse("limit $1").unwrap();
        assert!(translate(&query, &[json!("ten")]).is_err());
    }
}
