//! Error types for jql-core.
//!
//! Storage-free errors: nothing here knows about RocksDB or SQLite.

use std::fmt;

use thiserror::Error;

/// Byte range into the query source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn join(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Slice of `source` covered by this span (empty if out of bounds).
    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        source.get(self.start..self.end).unwrap_or("")
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A malformed query: where it broke and which grammar rules were active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub span: Span,
    pub message: String,
    /// Grammar rules entered when the error was raised, outermost first.
    pub trail: Vec<&'static str>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}: {}", self.span, self.message)?;
        if !self.trail.is_empty() {
            write!(f, " (in {})", self.trail.join(" > "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// JQL error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JqlError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Type error: {0}")]
    TypeCoercion(String),

    #[error("Placeholder ${index} is out of range ({available} parameter(s) supplied)")]
    PlaceholderOutOfRange { index: usize, available: usize },

    #[error("Function {function}() expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: &'static str,
        got: usize,
    },

    #[error("Unknown aggregate function: {0}")]
    UnknownFunction(String),
}

/// Result type for JQL operations
pub type JqlResult<T> = Result<T, JqlError>;

impl serde::Serialize for JqlError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError {
            span: Span::new(4, 6),
            message: "expected a value".to_string(),
            trail: vec!["query", "expr-or", "expression"],
        };
        assert_eq!(
            err.to_string(),
            "parse error at 4..6: expected a value (in query > expr-or > expression)"
        );
    }

    #[test]
    fn test_error_messages() {
        let err = JqlError::TypeCoercion("expected number at age".to_string());
        assert_eq!(err.to_string(), "Type error: expected number at age");

        let err = JqlError::PlaceholderOutOfRange {
            index: 3,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Placeholder $3 is out of range (1 parameter(s) supplied)"
        );

        let err = JqlError::Arity {
            function: "corr".to_string(),
            expected: "2",
            got: 1,
        };
        assert_eq!(err.to_string(), "Function corr() expects 2 argument(s), got 1");

        let err = JqlError::UnknownFunction("median".to_string());
        assert_eq!(err.to_string(), "Unknown aggregate function: median");
    }

    #[test]
    fn test_span_slice() {
        let span = Span::new(0, 3);
        assert_eq!(span.slice("age > 3"), "age");
        assert_eq!(Span::new(10, 20).slice("short"), "");
        assert_eq!(Span::new(2, 4).join(Span::new(0, 3)), Span::new(0, 4));
    }
}
