//! JQL Core - Storage-independent JQL query language.
//!
//! JQL is a small filter language over JSON documents:
//!
//! ```text
//! age >= $1 and (name.first = 'John' or active = true) order numeric(age) desc limit 10
//! score > 0 | count(*) as n, avg(score) as mean, regr(y, x) as fit
//! ```
//!
//! This crate parses queries and evaluates them without any storage engine.
//! Both execution strategies share one boolean walker ([`eval::Evaluator`]):
//!
//! - **Selector**: evaluates a filter against an in-memory document
//! - **SQL**: translates a query into SQLite SQL over JSON text columns
//!
//! # Main Components
//!
//! - **Lexer / Parser**: query text into a [`Query`] tree, with spanned errors
//! - **Constraints**: order/limit/offset directives with bound placeholders
//! - **Aggregate**: validated aggregate clauses and streaming accumulators
//!
//! # Example
//!
//! ```rust
//! use jql_core::{evaluate_document, parse};
//! use serde_json::json;
//!
//! let query = parse("age >= $1 and name.first = 'John'").unwrap();
//! let doc = json!({"name": {"first": "John"}, "age": 30});
//!
//! let (matched, errors) = evaluate_document(query.filter(), 1, &doc, &[json!(18)]);
//! assert!(matched);
//! assert!(errors.is_empty());
//! ```

pub mod aggregate;
pub mod ast;
pub mod constraints;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod selector;
pub mod sql;
pub mod value;

// Re-export main types for convenience
pub use aggregate::{aggregate_specs, AggregateFunction, AggregateSpec, Aggregation, Moments};
pub use ast::{CompareOp, FieldPath, Node, NodeKind, Query, ID_FIELD};
pub use constraints::{extract_constraints, Constraints, Direction, OrderBy};
pub use error::{JqlError, JqlResult, ParseError, Span};
pub use eval::{Evaluator, Operand, PathResolver, ValueComparer, Verdict};
pub use lexer::{Lexer, Token};
pub use parser::{parse, Parser};
pub use selector::{evaluate_document, DocumentSelector};
pub use sql::{translate, SqlQuery};
pub use value::coerce_number;
