//! Recursive-descent parser for JQL.
//!
//! ```text
//! query      := expr-or? order? limit? offset? ("|" aggregate)?
//! expr-or    := expr-and ("or" expr-and)*
//! expr-and   := term ("and" term)*
//! term       := expression | "(" expr-or ")"
//! expression := path op value | boolean-literal
//! order      := "order" (path | "numeric(" path ")") ("asc" | "desc")
//! limit      := "limit" (placeholder | whole-number)
//! offset     := "offset" (placeholder | whole-number)
//! aggregate  := agg-clause ("," agg-clause)*
//! agg-clause := function "(" (path | "*") ("," path)? ")" "as" word
//! ```
//!
//! Every rule function pushes its name on a trail so that a failure reports
//! where in the grammar it happened. No semantic validation happens here
//! (aggregate arity is checked by the aggregation engine and the translator).

use crate::ast::{CompareOp, Node, NodeKind, Query};
use crate::error::{JqlResult, ParseError, Span};
use crate::lexer::{Lexer, Spanned, Token};


/// Parse a query string into its tree.
pub fn parse(input: &str) -> JqlResult<Query> {
    let mut parser = Parser::new(input)?;
    Ok(parser.parse()?)
}

pub struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    position: usize,
    trail: Vec<&'static str>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Result<Self, ParseError> {
        let tokens = Lexer::new(source).tokenize()?;

        Ok(Self {
            source,
            tokens,
            position: 0,
            trail: Vec::new(),
        })
    }

    fn current(&self) -> &Spanned {
        // tokenize() always ends with Eof
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn current_token(&self) -> &Token {
        &self.current().token
    }

    fn current_span(&self) -> Span {
        self.current().span
    }

    fn peek_token(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.position + offset)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Spanned {
        let spanned = self.current().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        spanned
    }

    /// Span of the most recently consumed token.
    fn previous_span(&self) -> Span {
        self.position
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map(|s| s.span)
            .unwrap_or_default()
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            span: self.current_span(),
            message: message.into(),
            trail: self.trail.clone(),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        self.error(format!(
            "expected {}, found {}",
            expected,
            self.current_token().describe()
        ))
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<Spanned, ParseError> {
        if self.current_token() == &expected {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    /// Run `f` as grammar rule `name`. The trail entry is popped only on
    /// success so an error keeps the full trail it was created with.
    fn rule<T>(
        &mut self,
        name: &'static str,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        self.trail.push(name);
        let result = f(self)?;
        self.trail.pop();
        Ok(result)
    }

    pub fn parse(&mut self) -> Result<Query, ParseError> {
        let nodes = self.rule("query", |p| p.parse_query())?;

        Ok(Query {
            source: self.source.to_string(),
            nodes,
        })
    }

    fn parse_query(&mut self) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();

        if !matches!(
            self.current_token(),
            Token::Order | Token::Limit | Token::Offset | Token::Pipe | Token::Eof
        ) {
            nodes.push(self.parse_or()?);
        }

        if matches!(self.current_token(), Token::Order) {
            nodes.push(self.rule("order", |p| p.parse_order())?);
        }

        if matches!(self.current_token(), Token::Limit) {
            nodes.push(self.rule("limit", |p| p.parse_bound(Token::Limit, NodeKind::Limit))?);
        }

        if matches!(self.current_token(), Token::Offset) {
            nodes.push(self.rule("offset", |p| p.parse_bound(Token::Offset, NodeKind::Offset))?);
        }

        if matches!(self.current_token(), Token::Pipe) {
            nodes.push(self.rule("aggregate", |p| p.parse_aggregate())?);
        }

        if !matches!(self.current_token(), Token::Eof) {
            return Err(self.unexpected("end of query"));
        }

        Ok(nodes)
    }

    fn parse_or(&mut self) -> Result<Node, ParseError> {
        self.rule("expr-or", |p| {
            let mut children = vec![p.parse_and()?];
            while matches!(p.current_token(), Token::Or) {
                p.advance();
                children.push(p.parse_and()?);
            }
            Ok(junction(NodeKind::BooleanOr, children))
        })
    }

    fn parse_and(&mut self) -> Result<Node, ParseError> {
        self.rule("expr-and", |p| {
            let mut children = vec![p.parse_term()?];
            while matches!(p.current_token(), Token::And) {
                p.advance();
                children.push(p.parse_term()?);
            }
            Ok(junction(NodeKind::BooleanAnd, children))
        })
    }

    fn parse_term(&mut self) -> Result<Node, ParseError> {
        self.rule("term", |p| {
            if matches!(p.current_token(), Token::LeftParen) {
                let open = p.advance();
                let inner = p.parse_or()?;
                let close = p.expect(Token::RightParen, "')'")?;
                Ok(Node::with_children(
                    NodeKind::Group,
                    open.span.join(close.span),
                    vec![inner],
                ))
            } else {
                p.parse_expression()
            }
        })
    }

    fn parse_expression(&mut self) -> Result<Node, ParseError> {
        self.rule("expression", |p| {
            if let Token::True | Token::False = p.current_token() {
                // A bare boolean literal, unless it is the start of a comparison
                if !is_compare_op(p.peek_token(1)) {
                    let spanned = p.advance();
                    return Ok(Node::leaf(
                        NodeKind::BooleanLiteral(spanned.token == Token::True),
                        spanned.span,
                    ));
                }
            }

            let path = p.parse_path()?;
            let op = p.rule("op", |p| {
                let op = match p.current_token() {
                    Token::Equal => CompareOp::Equal,
                    Token::NotEqual => CompareOp::NotEqual,
                    Token::GreaterThan => CompareOp::GreaterThan,
                    Token::LessThan => CompareOp::LessThan,
                    Token::GreaterThanEq => CompareOp::GreaterThanOrEqual,
                    Token::LessThanEq => CompareOp::LessThanOrEqual,
                    _ => return Err(p.unexpected("comparison operator")),
                };
                p.advance();
                Ok(op)
            })?;
            let value = p.parse_value()?;

            Ok(Node::with_children(
                NodeKind::Expression(op),
                path.span.join(value.span),
                vec![path, value],
            ))
        })
    }

    fn parse_path(&mut self) -> Result<Node, ParseError> {
        self.rule("path", |p| {
            let mut words = vec![p.parse_word()?];
            while matches!(p.current_token(), Token::Dot) {
                p.advance();
                words.push(p.parse_word()?);
            }
            let span = words[0].span.join(words[words.len() - 1].span);
            Ok(Node::with_children(NodeKind::Path, span, words))
        })
    }

    fn parse_word(&mut self) -> Result<Node, ParseError> {
        match self.current_token().clone() {
            Token::Word(word) => {
                let spanned = self.advance();
                Ok(Node::leaf(NodeKind::Word(word), spanned.span))
            }
            _ => Err(self.unexpected("field name")),
        }
    }

    fn parse_value(&mut self) -> Result<Node, ParseError> {
        self.rule("value", |p| {
            let kind = match p.current_token() {
                Token::Placeholder(index) => NodeKind::Placeholder(*index),
                Token::String(s) => NodeKind::StringLiteral(s.clone()),
                Token::Number(n) => NodeKind::NumberLiteral(*n),
                Token::True => NodeKind::BooleanLiteral(true),
                Token::False => NodeKind::BooleanLiteral(false),
                Token::Null => NodeKind::NullLiteral,
                _ => return Err(p.unexpected("value")),
            };
            let spanned = p.advance();
            Ok(Node::leaf(kind, spanned.span))
        })
    }

    fn parse_order(&mut self) -> Result<Node, ParseError> {
        let keyword = self.expect(Token::Order, "'order'")?;

        let target = if matches!(self.current_token(), Token::Numeric) {
            let numeric = self.advance();
            self.expect(Token::LeftParen, "'(' after numeric")?;
            let path = self.parse_path()?;
            let close = self.expect(Token::RightParen, "')'")?;
            Node::with_children(NodeKind::Cast, numeric.span.join(close.span), vec![path])
        } else {
            self.parse_path()?
        };

        let direction = match self.current_token() {
            Token::Asc => Node::leaf(NodeKind::Asc, self.advance().span),
            Token::Desc => Node::leaf(NodeKind::Desc, self.advance().span),
            _ => return Err(self.unexpected("'asc' or 'desc'")),
        };

        Ok(Node::with_children(
            NodeKind::Order,
            keyword.span.join(direction.span),
            vec![target, direction],
        ))
    }

    /// `limit` / `offset` followed by a placeholder or whole number.
    fn parse_bound(&mut self, keyword: Token, kind: NodeKind) -> Result<Node, ParseError> {
        let keyword = self.expect(keyword, "keyword")?;

        let value = match self.current_token() {
            Token::Placeholder(index) => {
                let index = *index;
                Node::leaf(NodeKind::Placeholder(index), self.advance().span)
            }
            Token::Number(n) if n.fract().is_zero() && !n.is_sign_negative() => {
                let n = *n;
                Node::leaf(NodeKind::NumberLiteral(n), self.advance().span)
            }
            _ => return Err(self.unexpected("whole number or placeholder")),
        };

        Ok(Node::with_children(
            kind,
            keyword.span.join(value.span),
            vec![value],
        ))
    }

    fn parse_aggregate(&mut self) -> Result<Node, ParseError> {
        let pipe = self.expect(Token::Pipe, "'|'")?;
        let mut clauses = vec![self.rule("agg-clause", |p| p.parse_aggregate_clause())?];

        while matches!(self.current_token(), Token::Comma) {
            self.advance();
            clauses.push(self.rule("agg-clause", |p| p.parse_aggregate_clause())?);
        }

        let span = pipe.span.join(self.previous_span());
        Ok(Node::with_children(NodeKind::Aggregate, span, clauses))
    }

    fn parse_aggregate_clause(&mut self) -> Result<Node, ParseError> {
        let function = match self.current_token().clone() {
            Token::Word(name) => Node::leaf(NodeKind::Function(name), self.advance().span),
            _ => return Err(self.unexpected("aggregate function name")),
        };

        self.expect(Token::LeftParen, "'('")?;
        let mut children = vec![function];
        children.push(self.parse_selector(true)?);
        if matches!(self.current_token(), Token::Comma) && !matches!(self.peek_token(1), Token::RightParen) {
            self.advance();
            children.push(self.parse_selector(false)?);
        }
        self.expect(Token::RightParen, "')'")?;

        self.expect(Token::As, "'as'")?;
        let name = match self.current_token().clone() {
            Token::Word(name) => Node::leaf(NodeKind::Word(name), self.advance().span),
            _ => return Err(self.unexpected("result name")),
        };

        let span = children[0].span.join(name.span);
        children.push(name);
        Ok(Node::with_children(NodeKind::AggregateClause, span, children))
    }

    fn parse_selector(&mut self, allow_wildcard: bool) -> Result<Node, ParseError> {
        self.rule("selector", |p| {
            let inner = if allow_wildcard && matches!(p.current_token(), Token::Star) {
                Node::leaf(NodeKind::Wildcard, p.advance().span)
            } else {
                p.parse_path()?
            };
            Ok(Node::with_children(NodeKind::Selector, inner.span, vec![inner]))
        })
    }
}

fn is_compare_op(token: &Token) -> bool {
    matches!(
        token,
        Token::Equal
            | Token::NotEqual
            | Token::GreaterThan
            | Token::LessThan
            | Token::GreaterThanEq
            | Token::LessThanEq
    )
}

fn junction(kind: NodeKind, children: Vec<Node>) -> Node {
    let span = children
        .iter()
        .map(|c| c.span)
        .reduce(Span::join)
        .unwrap_or_default();
    Node::with_children(kind, span, children)
}
