//! Parser for derived-metric expressions.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/') unary)*
//! unary  := '-' unary | factor
//! factor := NUMBER | NAME | '(' expr ')'
//!         | 'reduce' '(' expr ',' OP [',' '[' DIM (',' DIM)* ']'] ')'
//!         | 'select' '(' expr ',' '[' DIM '=' '[' INT (',' INT)* ']' (',' ...)* ']' ')'
//!         | 'accumulate' '(' NAME ',' MODE ')'
//! ```
//!
//! The output is a purely syntactic [`Expr`]; metric names are resolved
//! against the catalog when the expression tree is built.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use crate::counters::dimension::Dimension;

/// Errors that can occur while parsing an expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { offset: usize, ch: char },

    #[error("expected {expected} at offset {offset}, found {found}")]
    UnexpectedToken {
        offset: usize,
        expected: &'static str,
        found: String,
    },

    #[error("expected {expected}, found end of expression")]
    UnexpectedEnd { expected: &'static str },

    #[error("invalid number {text:?} at offset {offset}")]
    InvalidNumber { offset: usize, text: String },

    #[error("invalid reduce operator {op:?} at offset {offset}")]
    InvalidReduceOperator { offset: usize, op: String },

    #[error("invalid accumulate mode {mode:?} at offset {offset}")]
    InvalidAccumulateMode { offset: usize, mode: String },

    #[error("unknown dimension {name:?} at offset {offset}")]
    UnknownDimension { offset: usize, name: String },

    #[error("select value {text:?} at offset {offset} is not a non-negative integer")]
    InvalidSelectValue { offset: usize, text: String },

    #[error("expression nests deeper than {limit} levels at offset {offset}")]
    NestingTooDeep { offset: usize, limit: usize },
}

/// Deepest expression tree the parser builds.
///
/// Parentheses, function calls, unary minus and each chained binary operator
/// count as one level.
pub const MAX_NESTING: usize = 256;

/// Arithmetic operator of a binary node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// Applies the operator. Division by zero yields `0.0`.
    #[inline]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => {
                if rhs == 0.0 {
                    0.0
                } else {
                    lhs / rhs
                }
            }
        }
    }

    pub const fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
            Self::Mul => '*',
            Self::Div => '/',
        }
    }
}

/// Aggregation applied by `reduce(...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
    Avg,
}

impl ReduceOp {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "sum" => Some(Self::Sum),
            "avg" => Some(Self::Avg),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Avg => "avg",
        }
    }
}

/// How the sampler should accumulate a counter over a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccumulateMode {
    None,
    HighRes,
    LowRes,
}

impl AccumulateMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NONE" => Some(Self::None),
            "HIGH_RES" => Some(Self::HighRes),
            "LOW_RES" => Some(Self::LowRes),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::HighRes => "HIGH_RES",
            Self::LowRes => "LOW_RES",
        }
    }
}

/// Syntax tree of a parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Metric(String),
    Accumulate {
        metric: String,
        mode: AccumulateMode,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Reduce {
        expr: Box<Expr>,
        op: ReduceOp,
        dimensions: Vec<Dimension>,
    },
    Select {
        expr: Box<Expr>,
        filters: BTreeMap<Dimension, BTreeSet<u64>>,
    },
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Metric(name) => f.write_str(name),
            Self::Accumulate { metric, mode } => {
                write!(f, "accumulate({metric}, {})", mode.as_str())
            }
            Self::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Self::Reduce {
                expr,
                op,
                dimensions,
            } => {
                write!(f, "reduce({expr}, {}", op.as_str())?;
                if !dimensions.is_empty() {
                    let dims: Vec<&str> = dimensions.iter().map(|d| d.as_str()).collect();
                    write!(f, ", [{}]", dims.join(", "))?;
                }
                f.write_str(")")
            }
            Self::Select { expr, filters } => {
                write!(f, "select({expr}, [")?;
                for (i, (dim, values)) in filters.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    let values: Vec<String> = values.iter().map(u64::to_string).collect();
                    write!(f, "{dim}=[{}]", values.join(", "))?;
                }
                f.write_str("])")
            }
        }
    }
}

/// Parses an expression string.
pub fn parse_expression(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    match parser.next() {
        None => Ok(expr),
        Some(tok) => Err(ParseError::UnexpectedToken {
            offset: tok.offset,
            expected: "end of expression",
            found: tok.kind.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Equals,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(text) | Self::Ident(text) => write!(f, "{text:?}"),
            Self::Plus => f.write_str("'+'"),
            Self::Minus => f.write_str("'-'"),
            Self::Star => f.write_str("'*'"),
            Self::Slash => f.write_str("'/'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
            Self::LBracket => f.write_str("'['"),
            Self::RBracket => f.write_str("']'"),
            Self::Comma => f.write_str("','"),
            Self::Equals => f.write_str("'='"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b'=' => TokenKind::Equals,
            b'0'..=b'9' | b'.' => {
                i = scan_number(bytes, i);
                tokens.push(Token {
                    kind: TokenKind::Number(input[start..i].to_string()),
                    offset: start,
                });
                continue;
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(input[start..i].to_string()),
                    offset: start,
                });
                continue;
            }
            _ => {
                let ch = input[start..].chars().next().unwrap_or('\u{fffd}');
                return Err(ParseError::UnexpectedChar { offset: start, ch });
            }
        };

        tokens.push(Token {
            kind,
            offset: start,
        });
        i += 1;
    }

    Ok(tokens)
}

/// Returns the end offset of a numeric literal starting at `i`.
fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
        i += 1;
    }
    // Optional exponent, only when followed by digits.
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

// ---------------------------------------------------------------------------
// Recursive-descent parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<usize, ParseError> {
        match self.next() {
            Some(tok) if tok.kind == kind => Ok(tok.offset),
            Some(tok) => Err(ParseError::UnexpectedToken {
                offset: tok.offset,
                expected,
                found: tok.kind.to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd { expected }),
        }
    }

    /// Enters one nesting level at `offset`.
    fn deeper(&mut self, offset: usize) -> Result<(), ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(ParseError::NestingTooDeep {
                offset,
                limit: MAX_NESTING,
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(0, |t| t.offset)
    }

    fn ident(&mut self, expected: &'static str) -> Result<(String, usize), ParseError> {
        match self.next() {
            Some(Token {
                kind: TokenKind::Ident(name),
                offset,
            }) => Ok((name, offset)),
            Some(tok) => Err(ParseError::UnexpectedToken {
                offset: tok.offset,
                expected,
                found: tok.kind.to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd { expected }),
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let base = self.depth;
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.deeper(self.offset())?;
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.deeper(self.offset())?;
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&TokenKind::Minus) {
            self.deeper(self.offset())?;
            self.pos += 1;
            let operand = self.unary()?;
            self.depth -= 1;
            return match operand {
                Expr::Number(v) => Ok(Expr::Number(-v)),
                operand => Ok(Expr::Binary {
                    op: BinaryOp::Sub,
                    lhs: Box::new(Expr::Number(0.0)),
                    rhs: Box::new(operand),
                }),
            };
        }
        self.factor()
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        let Some(tok) = self.next() else {
            return Err(ParseError::UnexpectedEnd {
                expected: "number, metric or '('",
            });
        };

        match tok.kind {
            TokenKind::Number(text) => text
                .parse::<f64>()
                .map(Expr::Number)
                .map_err(|_| ParseError::InvalidNumber {
                    offset: tok.offset,
                    text,
                }),
            TokenKind::LParen => {
                self.deeper(tok.offset)?;
                let inner = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                self.depth -= 1;
                Ok(inner)
            }
            TokenKind::Ident(name) if self.peek() == Some(&TokenKind::LParen) => {
                self.deeper(tok.offset)?;
                let call = match name.as_str() {
                    "reduce" => self.reduce(),
                    "select" => self.select(),
                    "accumulate" => self.accumulate(),
                    _ => Err(ParseError::UnexpectedToken {
                        offset: tok.offset,
                        expected: "reduce, select or accumulate",
                        found: format!("{name:?}"),
                    }),
                }?;
                self.depth -= 1;
                Ok(call)
            }
            TokenKind::Ident(name) => Ok(Expr::Metric(name)),
            other => Err(ParseError::UnexpectedToken {
                offset: tok.offset,
                expected: "number, metric or '('",
                found: other.to_string(),
            }),
        }
    }

    fn reduce(&mut self) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LParen, "'('")?;
        let expr = self.expr()?;
        self.expect(TokenKind::Comma, "','")?;

        let (op_name, op_offset) = self.ident("reduce operator")?;
        let op = ReduceOp::from_name(&op_name).ok_or(ParseError::InvalidReduceOperator {
            offset: op_offset,
            op: op_name,
        })?;

        let mut dimensions = Vec::new();
        if self.peek() == Some(&TokenKind::Comma) {
            self.pos += 1;
            self.expect(TokenKind::LBracket, "'['")?;
            loop {
                dimensions.push(self.dimension()?);
                if self.peek() == Some(&TokenKind::Comma) {
                    self.pos += 1;
                    continue;
                }
                break;
            }
            self.expect(TokenKind::RBracket, "']'")?;
        }

        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Reduce {
            expr: Box::new(expr),
            op,
            dimensions,
        })
    }

    fn select(&mut self) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LParen, "'('")?;
        let expr = self.expr()?;
        self.expect(TokenKind::Comma, "','")?;
        self.expect(TokenKind::LBracket, "'['")?;

        let mut filters: BTreeMap<Dimension, BTreeSet<u64>> = BTreeMap::new();
        loop {
            let dim = self.dimension()?;
            self.expect(TokenKind::Equals, "'='")?;
            self.expect(TokenKind::LBracket, "'['")?;
            let values = filters.entry(dim).or_default();
            loop {
                values.insert(self.select_value()?);
                if self.peek() == Some(&TokenKind::Comma) {
                    self.pos += 1;
                    continue;
                }
                break;
            }
            self.expect(TokenKind::RBracket, "']'")?;

            if self.peek() == Some(&TokenKind::Comma) {
                self.pos += 1;
                continue;
            }
            break;
        }

        self.expect(TokenKind::RBracket, "']'")?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Select {
            expr: Box::new(expr),
            filters,
        })
    }

    fn accumulate(&mut self) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LParen, "'('")?;
        let (metric, _) = self.ident("metric name")?;
        self.expect(TokenKind::Comma, "','")?;
        let (mode_name, mode_offset) = self.ident("accumulate mode")?;
        let mode = AccumulateMode::from_name(&mode_name).ok_or(
            ParseError::InvalidAccumulateMode {
                offset: mode_offset,
                mode: mode_name,
            },
        )?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Accumulate { metric, mode })
    }

    fn dimension(&mut self) -> Result<Dimension, ParseError> {
        let (name, offset) = self.ident("dimension name")?;
        Dimension::from_name(&name).ok_or(ParseError::UnknownDimension { offset, name })
    }

    fn select_value(&mut self) -> Result<u64, ParseError> {
        match self.next() {
            Some(Token {
                kind: TokenKind::Number(text),
                offset,
            }) => text
                .parse::<u64>()
                .map_err(|_| ParseError::InvalidSelectValue { offset, text }),
            Some(tok) => Err(ParseError::UnexpectedToken {
                offset: tok.offset,
                expected: "select value",
                found: tok.kind.to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: "select value",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str) -> Box<Expr> {
        Box::new(Expr::Metric(name.into()))
    }

    #[test]
    fn test_parse_bare_metric() {
        assert_eq!(
            parse_expression("SQ_WAVES").expect("parse"),
            Expr::Metric("SQ_WAVES".into())
        );
    }

    #[test]
    fn test_parse_precedence() {
        let expr = parse_expression("A + B * 2").expect("parse");
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Add,
                lhs: metric("A"),
                rhs: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    lhs: metric("B"),
                    rhs: Box::new(Expr::Number(2.0)),
                }),
            }
        );
    }

    #[test]
    fn test_parse_left_associative_subtraction() {
        let expr = parse_expression("A - B - C").expect("parse");
        assert_eq!(expr.to_string(), "((A - B) - C)");
    }

    #[test]
    fn test_parse_parentheses_and_numbers() {
        let expr = parse_expression("100 * (GRBM_GUI_ACTIVE / GRBM_COUNT) + 1.5e2").expect("parse");
        assert_eq!(
            expr.to_string(),
            "((100 * (GRBM_GUI_ACTIVE / GRBM_COUNT)) + 150)"
        );
    }

    #[test]
    fn test_parse_unary_minus() {
        assert_eq!(parse_expression("-4").expect("parse"), Expr::Number(-4.0));
        assert_eq!(
            parse_expression("-A").expect("parse").to_string(),
            "(0 - A)"
        );
    }

    #[test]
    fn test_parse_reduce_without_dimensions() {
        let expr = parse_expression("reduce(SQ_WAVES, sum)").expect("parse");
        assert_eq!(
            expr,
            Expr::Reduce {
                expr: metric("SQ_WAVES"),
                op: ReduceOp::Sum,
                dimensions: Vec::new(),
            }
        );
    }

    #[test]
    fn test_parse_reduce_with_dimensions() {
        let expr = parse_expression(
            "reduce(TCC_HIT, max, [DIMENSION_XCC, DIMENSION_INSTANCE])",
        )
        .expect("parse");
        let Expr::Reduce { op, dimensions, .. } = expr else {
            panic!("expected reduce node");
        };
        assert_eq!(op, ReduceOp::Max);
        assert_eq!(dimensions, vec![Dimension::Xcc, Dimension::Instance]);
    }

    #[test]
    fn test_parse_select() {
        let expr = parse_expression(
            "select(SQ_WAVES, [DIMENSION_XCC=[0], DIMENSION_SHADER_ENGINE=[1, 3]])",
        )
        .expect("parse");
        let Expr::Select { filters, .. } = &expr else {
            panic!("expected select node");
        };
        assert_eq!(filters[&Dimension::Xcc], BTreeSet::from([0]));
        assert_eq!(filters[&Dimension::ShaderEngine], BTreeSet::from([1, 3]));
        assert_eq!(
            expr.to_string(),
            "select(SQ_WAVES, [DIMENSION_XCC=[0], DIMENSION_SHADER_ENGINE=[1, 3]])"
        );
    }

    #[test]
    fn test_parse_accumulate() {
        let expr = parse_expression("accumulate(SQ_LEVEL_WAVES, HIGH_RES) / SQ_WAVES")
            .expect("parse");
        let Expr::Binary { lhs, .. } = expr else {
            panic!("expected binary node");
        };
        assert_eq!(
            *lhs,
            Expr::Accumulate {
                metric: "SQ_LEVEL_WAVES".into(),
                mode: AccumulateMode::HighRes,
            }
        );
    }

    #[test]
    fn test_invalid_reduce_operator() {
        let err = parse_expression("reduce(A, median)").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidReduceOperator {
                offset: 10,
                op: "median".into()
            }
        );
    }

    #[test]
    fn test_invalid_accumulate_mode() {
        let err = parse_expression("accumulate(A, FAST)").unwrap_err();
        assert!(matches!(err, ParseError::InvalidAccumulateMode { .. }));
    }

    #[test]
    fn test_unknown_dimension() {
        let err = parse_expression("reduce(A, sum, [DIMENSION_BOGUS])").unwrap_err();
        assert!(matches!(err, ParseError::UnknownDimension { .. }));
    }

    #[test]
    fn test_unexpected_character() {
        let err = parse_expression("A % B").unwrap_err();
        assert_eq!(err, ParseError::UnexpectedChar { offset: 2, ch: '%' });
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        let err = parse_expression("A B").unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnexpectedToken {
                offset: 2,
                expected: "end of expression",
                ..
            }
        ));
    }

    #[test]
    fn test_unexpected_end() {
        assert!(matches!(
            parse_expression("A +").unwrap_err(),
            ParseError::UnexpectedEnd { .. }
        ));
        assert!(matches!(
            parse_expression("(A").unwrap_err(),
            ParseError::UnexpectedEnd { .. }
        ));
    }

    #[test]
    fn test_invalid_select_value() {
        let err = parse_expression("select(A, [DIMENSION_XCC=[1.5]])").unwrap_err();
        assert!(matches!(err, ParseError::InvalidSelectValue { .. }));
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let deep = format!("{}A{}", "(".repeat(10_000), ")".repeat(10_000));
        assert_eq!(
            parse_expression(&deep),
            Err(ParseError::NestingTooDeep {
                offset: MAX_NESTING,
                limit: MAX_NESTING
            })
        );

        let calls = format!("{}A{}", "reduce(".repeat(10_000), ", sum)".repeat(10_000));
        assert!(matches!(
            parse_expression(&calls),
            Err(ParseError::NestingTooDeep { .. })
        ));

        let negations = format!("{}A", "-".repeat(10_000));
        assert!(matches!(
            parse_expression(&negations),
            Err(ParseError::NestingTooDeep { .. })
        ));

        let chain = vec!["A"; 10_000].join(" + ");
        assert!(matches!(
            parse_expression(&chain),
            Err(ParseError::NestingTooDeep { .. })
        ));
    }

    #[test]
    fn test_nesting_below_limit_parses() {
        let depth = MAX_NESTING - 1;
        let nested = format!("{}A{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(parse_expression(&nested), Ok(Expr::Metric("A".into())));

        let sum = vec!["A"; 64].join(" + ");
        assert!(parse_expression(&sum).is_ok());
    }

    #[test]
    fn test_unknown_function() {
        let err = parse_expression("log(A)").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedToken { offset: 0, .. }));
    }
}
