//! Attribute filter expressions.
//!
//! One grammar serves both the server-side `CQL_FILTER` parameter and the
//! local post-download filter, so a constraint always means the same thing
//! regardless of where it is evaluated:
//!
//! ```text
//! expr      := term ( AND term )*
//! term      := '(' expr ')' | predicate
//! predicate := ident op literal
//!            | ident BETWEEN literal AND literal
//!            | ident IN '(' literal ( ',' literal )* ')'
//! op        := '=' | '<>' | '!=' | '<' | '<=' | '>' | '>='
//! ident     := bare_word | '"' ( char | '""' )* '"'
//! literal   := number | '\'' ( char | '\'\'' )* '\''
//! ```

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDate;
use geoharvest_feature_models::{AttributeValue, Feature, FieldType, Schema};
use strum_macros::{AsRefStr, EnumString};

/// Errors produced while parsing or binding an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    /// The text is not a valid expression.
    #[error("syntax error at {position}: {message}")]
    Syntax {
        /// Byte offset of the offending token.
        position: usize,
        /// What was expected.
        message: String,
    },

    /// The expression names a field the schema does not have.
    #[error("unknown field \"{0}\"")]
    UnknownField(String),

    /// A literal cannot be interpreted as the field's type.
    #[error("literal {literal} is not a valid {expected} for field \"{field}\"")]
    InvalidLiteral {
        /// Field compared against.
        field: String,
        /// Rendered literal.
        literal: String,
        /// Type of the field.
        expected: FieldType,
    },
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum CompareOp {
    /// `=`
    #[strum(serialize = "=")]
    Eq,
    /// `<>` (also accepted as `!=`)
    #[strum(to_string = "<>", serialize = "!=")]
    Ne,
    /// `<`
    #[strum(serialize = "<")]
    Lt,
    /// `<=`
    #[strum(serialize = "<=")]
    Le,
    /// `>`
    #[strum(serialize = ">")]
    Gt,
    /// `>=`
    #[strum(serialize = ">=")]
    Ge,
}

impl CompareOp {
    const fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering.is_eq(),
            Self::Ne => ordering.is_ne(),
            Self::Lt => ordering.is_lt(),
            Self::Le => ordering.is_le(),
            Self::Gt => ordering.is_gt(),
            Self::Ge => ordering.is_ge(),
        }
    }
}

/// A literal as written in the expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Quoted string.
    Text(String),
    /// Unquoted number.
    Number(f64),
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Literal {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for Literal {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<NaiveDate> for Literal {
    fn from(value: NaiveDate) -> Self {
        Self::Text(value.format("%Y-%m-%d").to_string())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Parsed attribute expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// `field op literal`
    Compare {
        /// Field name.
        field: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        value: Literal,
    },
    /// `field BETWEEN low AND high` (inclusive).
    Between {
        /// Field name.
        field: String,
        /// Lower bound.
        low: Literal,
        /// Upper bound.
        high: Literal,
    },
    /// `field IN (v1, v2, ...)`
    In {
        /// Field name.
        field: String,
        /// Accepted values.
        values: Vec<Literal>,
    },
    /// Conjunction of two or more terms.
    And(Vec<Self>),
}

impl Expression {
    /// `field = value`
    #[must_use]
    pub fn equals(field: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self::Compare {
            field: field.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    /// `field BETWEEN low AND high`
    #[must_use]
    pub fn between(
        field: impl Into<String>,
        low: impl Into<Literal>,
        high: impl Into<Literal>,
    ) -> Self {
        Self::Between {
            field: field.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    /// `field IN (values...)`
    #[must_use]
    pub fn in_list<L: Into<Literal>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = L>,
    ) -> Self {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Conjoins terms, flattening nested conjunctions. Returns `None` for
    /// an empty input and the term itself for a single input.
    #[must_use]
    pub fn and(terms: impl IntoIterator<Item = Self>) -> Option<Self> {
        let mut flat = Vec::new();
        for term in terms {
            match term {
                Self::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::And(flat)),
        }
    }

    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Syntax`] if `input` does not follow the
    /// grammar.
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end: input.len(),
        };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(ExpressionError::Syntax {
                position: token.position,
                message: "unexpected trailing input".to_string(),
            });
        }
        Ok(expr)
    }

    /// Fields referenced by the expression, in order of appearance.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Compare { field, .. } | Self::Between { field, .. } | Self::In { field, .. } => {
                vec![field.as_str()]
            }
            Self::And(terms) => terms.iter().flat_map(Self::fields).collect(),
        }
    }

    /// Resolves field names to column indices and types the literals.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::UnknownField`] if a field is not in the
    /// schema, or [`ExpressionError::InvalidLiteral`] if a literal cannot
    /// be read as the field's type.
    pub fn bind(&self, schema: &Schema) -> Result<BoundExpression, ExpressionError> {
        Ok(BoundExpression {
            root: bind_node(self, schema)?,
        })
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { field, op, value } => {
                write!(f, "{} {} {value}", quote_ident(field), op.as_ref())
            }
            Self::Between { field, low, high } => {
                write!(f, "{} BETWEEN {low} AND {high}", quote_ident(field))
            }
            Self::In { field, values } => {
                write!(f, "{} IN (", quote_ident(field))?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
            Self::And(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" AND ")?;
                    }
                    if matches!(term, Self::And(_)) {
                        write!(f, "({term})")?;
                    } else {
                        write!(f, "{term}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word(String),
    QuotedIdent(String),
    Str(String),
    Number(f64),
    Op(CompareOp),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let kind = match c {
            '(' => {
                i += 1;
                TokenKind::LParen
            }
            ')' => {
                i += 1;
                TokenKind::RParen
            }
            ',' => {
                i += 1;
                TokenKind::Comma
            }
            '\'' | '"' => {
                let (text, next) = read_quoted(&chars, i, c).ok_or(ExpressionError::Syntax {
                    position,
                    message: "unterminated quote".to_string(),
                })?;
                i = next;
                if c == '\'' {
                    TokenKind::Str(text)
                } else {
                    TokenKind::QuotedIdent(text)
                }
            }
            '=' | '<' | '>' | '!' => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let (op, len) = match (c, next) {
                    ('<', Some('=')) => ("<=", 2),
                    ('<', Some('>')) => ("<>", 2),
                    ('>', Some('=')) => (">=", 2),
                    ('!', Some('=')) => ("!=", 2),
                    ('=', _) => ("=", 1),
                    ('<', _) => ("<", 1),
                    ('>', _) => (">", 1),
                    _ => {
                        return Err(ExpressionError::Syntax {
                            position,
                            message: format!("unexpected character '{c}'"),
                        });
                    }
                };
                i += len;
                // The table above only yields valid operator spellings.
                TokenKind::Op(op.parse().map_err(|_| ExpressionError::Syntax {
                    position,
                    message: format!("unknown operator {op}"),
                })?)
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].1.is_ascii_digit() || matches!(chars[i].1, '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                TokenKind::Number(text.parse().map_err(|_| ExpressionError::Syntax {
                    position,
                    message: format!("invalid number {text}"),
                })?)
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                TokenKind::Word(chars[start..i].iter().map(|(_, c)| c).collect())
            }
            other => {
                return Err(ExpressionError::Syntax {
                    position,
                    message: format!("unexpected character '{other}'"),
                });
            }
        };
        tokens.push(Token { kind, position });
    }

    Ok(tokens)
}

/// Reads a quoted run starting at `start` (the opening quote). A doubled
/// quote inside the run stands for one literal quote.
fn read_quoted(chars: &[(usize, char)], start: usize, quote: char) -> Option<(String, usize)> {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            if chars.get(i + 1).is_some_and(|(_, n)| *n == quote) {
                text.push(quote);
                i += 2;
                continue;
            }
            return Some((text, i + 1));
        }
        text.push(c);
        i += 1;
    }
    None
}

// ── Parser ─────────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn position(&self) -> usize {
        self.peek().map_or(self.end, |t| t.position)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, ExpressionError> {
        Err(ExpressionError::Syntax {
            position: self.position(),
            message: message.into(),
        })
    }

    fn next(&mut self) -> Option<&'a TokenKind> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(&token.kind)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(
            self.peek(),
            Some(Token { kind: TokenKind::Word(w), .. }) if w.eq_ignore_ascii_case(keyword)
        )
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ExpressionError> {
        if self.is_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            self.error(format!("expected {keyword}"))
        }
    }

    fn expect(&mut self, kind: &TokenKind, label: &str) -> Result<(), ExpressionError> {
        if self.peek().is_some_and(|t| t.kind == *kind) {
            self.pos += 1;
            Ok(())
        } else {
            self.error(format!("expected {label}"))
        }
    }

    fn expr(&mut self) -> Result<Expression, ExpressionError> {
        let mut terms = vec![self.term()?];
        while self.is_keyword("AND") {
            self.pos += 1;
            terms.push(self.term()?);
        }
        match Expression::and(terms) {
            Some(expr) => Ok(expr),
            None => self.error("empty expression"),
        }
    }

    fn term(&mut self) -> Result<Expression, ExpressionError> {
        if self.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(inner);
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expression, ExpressionError> {
        let field = match self.next() {
            Some(TokenKind::Word(w) | TokenKind::QuotedIdent(w)) => w.clone(),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return self.error("expected field name");
            }
        };

        if self.is_keyword("BETWEEN") {
            self.pos += 1;
            let low = self.literal()?;
            self.expect_keyword("AND")?;
            let high = self.literal()?;
            return Ok(Expression::Between { field, low, high });
        }

        if self.is_keyword("IN") {
            self.pos += 1;
            self.expect(&TokenKind::LParen, "'('")?;
            let mut values = vec![self.literal()?];
            while self.peek().is_some_and(|t| t.kind == TokenKind::Comma) {
                self.pos += 1;
                values.push(self.literal()?);
            }
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Expression::In { field, values });
        }

        let op = match self.peek() {
            Some(Token {
                kind: TokenKind::Op(op),
                ..
            }) => *op,
            _ => return self.error("expected comparison operator, BETWEEN or IN"),
        };
        self.pos += 1;
        let value = self.literal()?;
        Ok(Expression::Compare { field, op, value })
    }

    fn literal(&mut self) -> Result<Literal, ExpressionError> {
        let literal = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Str(s)) => Literal::Text(s.clone()),
            Some(TokenKind::Number(n)) => Literal::Number(*n),
            _ => return self.error("expected literal"),
        };
        self.pos += 1;
        Ok(literal)
    }
}

// ── Binding and evaluation ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum BoundNode {
    Compare {
        column: usize,
        op: CompareOp,
        value: Value,
    },
    Between {
        column: usize,
        low: Value,
        high: Value,
    },
    In {
        column: usize,
        values: Vec<Value>,
    },
    And(Vec<Self>),
}

/// An expression whose field references have been resolved against a
/// schema. Evaluation is a pure function of the feature's attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundExpression {
    root: BoundNode,
}

impl BoundExpression {
    /// Returns `true` if the feature satisfies the expression. A `Null`
    /// attribute never satisfies a predicate.
    #[must_use]
    pub fn matches(&self, feature: &Feature) -> bool {
        eval(&self.root, feature)
    }
}

fn bind_node(expr: &Expression, schema: &Schema) -> Result<BoundNode, ExpressionError> {
    let column = |field: &str| {
        schema
            .index_of(field)
            .ok_or_else(|| ExpressionError::UnknownField(field.to_string()))
    };
    let typed = |field: &str, column: usize, literal: &Literal| {
        type_literal(field, schema.fields[column].field_type, literal)
    };

    Ok(match expr {
        Expression::Compare { field, op, value } => {
            let column = column(field)?;
            BoundNode::Compare {
                column,
                op: *op,
                value: typed(field, column, value)?,
            }
        }
        Expression::Between { field, low, high } => {
            let column = column(field)?;
            BoundNode::Between {
                column,
                low: typed(field, column, low)?,
                high: typed(field, column, high)?,
            }
        }
        Expression::In { field, values } => {
            let column = column(field)?;
            BoundNode::In {
                column,
                values: values
                    .iter()
                    .map(|v| typed(field, column, v))
                    .collect::<Result<_, _>>()?,
            }
        }
        Expression::And(terms) => BoundNode::And(
            terms
                .iter()
                .map(|t| bind_node(t, schema))
                .collect::<Result<_, _>>()?,
        ),
    })
}

fn type_literal(
    field: &str,
    field_type: FieldType,
    literal: &Literal,
) -> Result<Value, ExpressionError> {
    let invalid = || ExpressionError::InvalidLiteral {
        field: field.to_string(),
        literal: literal.to_string(),
        expected: field_type,
    };

    match (field_type, literal) {
        (FieldType::Date, Literal::Text(s)) => AttributeValue::parse_date(s)
            .map(Value::Date)
            .ok_or_else(invalid),
        (FieldType::Date, Literal::Number(_)) => Err(invalid()),
        (FieldType::Integer | FieldType::Float, Literal::Number(n)) => Ok(Value::Number(*n)),
        (FieldType::Integer | FieldType::Float, Literal::Text(s)) => {
            s.trim().parse().map(Value::Number).map_err(|_| invalid())
        }
        (FieldType::Bool, Literal::Text(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(Value::Bool(true)),
            "false" | "f" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        (FieldType::Bool, Literal::Number(n)) => Ok(Value::Bool(*n != 0.0)),
        (FieldType::Text | FieldType::Unknown, Literal::Text(s)) => Ok(Value::Text(s.clone())),
        (FieldType::Text | FieldType::Unknown, Literal::Number(n)) => Ok(Value::Number(*n)),
    }
}

fn compare(attr: &AttributeValue, value: &Value) -> Option<Ordering> {
    match (attr, value) {
        (AttributeValue::Null, _) => None,
        (AttributeValue::Date(d), Value::Date(v)) => Some(d.cmp(v)),
        (AttributeValue::Text(s), Value::Date(v)) => {
            AttributeValue::parse_date(s).map(|d| d.cmp(v))
        }
        (AttributeValue::Bool(b), Value::Bool(v)) => Some(b.cmp(v)),
        (AttributeValue::Text(s), Value::Text(v)) => Some(s.as_str().cmp(v.as_str())),
        (AttributeValue::Text(s), Value::Number(v)) => {
            s.trim().parse::<f64>().ok().and_then(|n| n.partial_cmp(v))
        }
        (AttributeValue::Date(d), Value::Text(v)) => {
            AttributeValue::parse_date(v).map(|v| d.cmp(&v))
        }
        (AttributeValue::Integer(_) | AttributeValue::Float(_), Value::Number(v)) => {
            attr.as_f64().and_then(|n| n.partial_cmp(v))
        }
        (AttributeValue::Integer(_) | AttributeValue::Float(_), Value::Text(v)) => {
            let v = v.trim().parse::<f64>().ok()?;
            attr.as_f64().and_then(|n| n.partial_cmp(&v))
        }
        _ => None,
    }
}

fn eval(node: &BoundNode, feature: &Feature) -> bool {
    match node {
        BoundNode::Compare { column, op, value } => {
            compare(feature.attribute(*column), value).is_some_and(|o| op.accepts(o))
        }
        BoundNode::Between { column, low, high } => {
            let attr = feature.attribute(*column);
            compare(attr, low).is_some_and(Ordering::is_ge)
                && compare(attr, high).is_some_and(Ordering::is_le)
        }
        BoundNode::In { column, values } => {
            let attr = feature.attribute(*column);
            values
                .iter()
                .any(|v| compare(attr, v).is_some_and(Ordering::is_eq))
        }
        BoundNode::And(terms) => terms.iter().all(|t| eval(t, feature)),
    }
}
