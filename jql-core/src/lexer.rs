use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::{ParseError, Span};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    And,
    Or,
    Order,
    Numeric,
    Asc,
    Desc,
    Limit,
    Offset,
    As,
    True,
    False,
    Null,

    // Identifiers and literals
    Word(String),
    Placeholder(usize), // $1, $2, ... (1-indexed)
    String(String),
    Number(Decimal),

    // Operators
    Equal,         // =
    NotEqual,      // !=
    LessThan,      // <
    LessThanEq,    // <=
    GreaterThan,   // >
    GreaterThanEq, // >=

    // Delimiters
    Dot,        // .
    Comma,      // ,
    Pipe,       // |
    Star,       // *
    LeftParen,  // (
    RightParen, // )

    // Special
    Eof,
}

impl Token {
    /// Short human-readable form used in parse error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Word(w) => format!("word '{}'", w),
            Token::Placeholder(n) => format!("placeholder ${}", n),
            Token::String(s) => format!("string \"{}\"", s),
            Token::Number(n) => format!("number {}", n),
            Token::Eof => "end of query".to_string(),
            Token::Equal => "'='".to_string(),
            Token::NotEqual => "'!='".to_string(),
            Token::LessThan => "'<'".to_string(),
            Token::LessThanEq => "'<='".to_string(),
            Token::GreaterThan => "'>'".to_string(),
            Token::GreaterThanEq => "'>='".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Pipe => "'|'".to_string(),
            Token::Star => "'*'".to_string(),
            Token::LeftParen => "'('".to_string(),
            Token::RightParen => "')'".to_string(),
            keyword => format!("keyword {:?}", keyword).to_lowercase(),
        }
    }
}

/// A token together with the byte range it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

pub struct Lexer {
    /// (byte offset, char) pairs of the input
    input: Vec<(usize, char)>,
    len: usize,
    position: usize,
    current_char: Option<char>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let chars: Vec<(usize, char)> = input.char_indices().collect();
        let current_char = chars.first().map(|(_, c)| *c);

        Self {
            input: chars,
            len: input.len(),
            position: 0,
            current_char,
        }
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).map(|(_, c)| *c);
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.position + 1).map(|(_, c)| *c)
    }

    /// Byte offset of the current character (input length at the end).
    fn offset(&self) -> usize {
        self.input
            .get(self.position)
            .map(|(i, _)| *i)
            .unwrap_or(self.len)
    }

    fn error(&self, start: usize, message: impl Into<String>) -> ParseError {
        let end = self.offset().max(start + 1).min(self.len);
        ParseError {
            span: Span::new(start, end.max(start)),
            message: message.into(),
            trail: vec!["token"],
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, ParseError> {
        let start = self.offset();
        let mut num_str = String::new();
        let mut has_dot = false;
        let mut has_exp = false;

        if self.current_char == Some('-') {
            num_str.push('-');
            self.advance();
        }

        while let Some(ch) = self.current_char {
            if ch.is_ascii_digit() {
                num_str.push(ch);
                self.advance();
            } else if ch == '.' && !has_dot && !has_exp {
                if !self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                    break;
                }
                has_dot = true;
                num_str.push(ch);
                self.advance();
            } else if (ch == 'e' || ch == 'E') && !has_exp {
                has_exp = true;
                num_str.push(ch);
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.current_char {
                    num_str.push(sign);
                    self.advance();
                }
            } else {
                break;
            }
        }

        let parsed = if has_exp {
            Decimal::from_scientific(&num_str)
        } else {
            Decimal::from_str(&num_str)
        };

        parsed
            .map(Token::Number)
            .map_err(|_| self.error(start, format!("invalid number: {}", num_str)))
    }

    fn read_string(&mut self) -> Result<Token, ParseError> {
        let start = self.offset();
        let quote = self.current_char.unwrap_or('"');
        self.advance(); // Skip opening quote

        let mut string = String::new();

        while let Some(ch) = self.current_char {
            if ch == quote {
                self.advance(); // Skip closing quote
                return Ok(Token::String(string));
            } else if ch == '\\' {
                self.advance();
                if let Some(escaped) = self.current_char {
                    string.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '"' => '"',
                        '\'' => '\'',
                        _ => escaped,
                    });
                    self.advance();
                }
            } else {
                string.push(ch);
                self.advance();
            }
        }

        Err(self.error(start, "unterminated string"))
    }

    fn read_identifier(&mut self) -> String {
        let mut ident = String::new();

        while let Some(ch) = self.current_char {
            if ch.is_alphanumeric() || ch == '_' || (ch == '-' && !ident.is_empty()) {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        ident
    }

    fn read_word(&mut self) -> Token {
        let ident = self.read_identifier();

        match ident.to_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "order" => Token::Order,
            "numeric" => Token::Numeric,
            "asc" => Token::Asc,
            "desc" => Token::Desc,
            "limit" => Token::Limit,
            "offset" => Token::Offset,
            "as" => Token::As,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => Token::Word(ident),
        }
    }

    /// `$N` placeholders, or `$word` fields such as the reserved `$id`.
    fn read_dollar(&mut self) -> Result<Token, ParseError> {
        let start = self.offset();
        self.advance(); // Skip '$'

        match self.current_char {
            Some(ch) if ch.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(ch) = self.current_char {
                    if ch.is_ascii_digit() {
                        digits.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
                match digits.parse::<usize>() {
                    Ok(0) => Err(self.error(start, "placeholders are 1-indexed, $0 is invalid")),
                    Ok(index) => Ok(Token::Placeholder(index)),
                    Err(_) => Err(self.error(start, format!("invalid placeholder ${}", digits))),
                }
            }
            Some(ch) if ch.is_alphabetic() || ch == '_' => {
                Ok(Token::Word(format!("${}", self.read_identifier())))
            }
            _ => Err(self.error(start, "expected placeholder number or field name after '$'")),
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    pub fn next_token(&mut self) -> Result<Spanned, ParseError> {
        self.skip_whitespace();
        let start = self.offset();

        let token = match self.current_char {
            None => Token::Eof,
            Some(ch) => match ch {
                '=' => {
                    self.advance();
                    // Accept `==` as an alias of `=`
                    if self.current_char == Some('=') {
                        self.advance();
                    }
                    Token::Equal
                }
                '!' => {
                    if self.peek_char() == Some('=') {
                        self.advance();
                        self.single(Token::NotEqual)
                    } else {
                        return Err(self.error(start, "unexpected character '!'"));
                    }
                }
                '<' => {
                    self.advance();
                    if self.current_char == Some('=') {
                        self.single(Token::LessThanEq)
                    } else {
                        Token::LessThan
                    }
                }
                '>' => {
                    self.advance();
                    if self.current_char == Some('=') {
                        self.single(Token::GreaterThanEq)
                    } else {
                        Token::GreaterThan
                    }
                }
                '.' => self.single(Token::Dot),
                ',' => self.single(Token::Comma),
                '|' => self.single(Token::Pipe),
                '*' => self.single(Token::Star),
                '(' => self.single(Token::LeftParen),
                ')' => self.single(Token::RightParen),
                '"' | '\'' => self.read_string()?,
                '$' => self.read_dollar()?,
                '-' if self.peek_char().is_some_and(|c| c.is_ascii_digit()) => self.read_number()?,
                c if c.is_ascii_digit() => self.read_number()?,
                c if c.is_alphabetic() || c == '_' => self.read_word(),
                other => {
                    return Err(self.error(start, format!("unexpected character '{}'", other)));
                }
            },
        };

        Ok(Spanned {
            token,
            span: Span::new(start, self.offset()),
        })
    }

    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, ParseError> {
        let mut tokens = Vec::new();

        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                break;
            }
        }

        Ok(tokens)
    }
}
