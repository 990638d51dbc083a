//! Filter Expression Engine
//!
//! Evaluates the untrusted match filters that clients attach to server list
//! requests, e.g.
//!
//! ```text
//! dwc_mver = 90 and dwc_pid != 1 and maxplayers = 11 and numplayers < 11
//!     and (rk = 'vs_123' and (ev > 4263 or ev <= 5763) and p = 0)
//! ```
//!
//! An expression is tokenized and parsed once into a closed tree (literals,
//! fields, arithmetic, comparisons, `and`/`or`, groups) and validated against
//! a whitelist. Nothing in a filter can do more than read fields of the
//! record it is evaluated against.
//!
//! Failure kinds:
//! - malformed expression: the whole search stops;
//! - missing field, type mismatch or arithmetic fault: only that record is
//!   excluded.

pub mod ast;
pub mod eval;
pub mod lexer;

use thiserror::Error;
use tracing::{debug, warn};

use crate::registry::record::{numeric_text, FieldValue, ServerRecord};
use ast::Expr;
use lexer::Token;

/// Filter errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Quote without its closing partner.
    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),

    /// Character outside the filter alphabet.
    #[error("unexpected character {ch:?} at {offset}")]
    UnexpectedChar {
        /// The character.
        ch: char,
        /// Its offset.
        offset: usize,
    },

    /// Integer literal out of range.
    #[error("integer literal out of range at {0}")]
    IntegerOverflow(usize),

    /// Token in a position the grammar does not allow.
    #[error("unexpected token {token:?} at position {position}")]
    UnexpectedToken {
        /// Rendered token.
        token: String,
        /// Token index.
        position: usize,
    },

    /// Expression ended early.
    #[error("unexpected end of filter")]
    UnexpectedEnd,

    /// Group left open.
    #[error("unbalanced parentheses")]
    UnbalancedParens,

    /// Too much nesting.
    #[error("filter nested too deeply")]
    TooDeep,

    /// Too many tokens.
    #[error("filter too long ({0} tokens)")]
    TooLong(usize),

    /// Arithmetic on something that is not a number.
    #[error("arithmetic on non-numeric operand {0}")]
    NonNumericOperand(String),

    /// Field not present in the record.
    #[error("unknown field {0}")]
    UnknownField(String),

    /// Operands of incompatible types.
    #[error("type mismatch for {0}")]
    TypeMismatch(String),

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Integer overflow.
    #[error("integer overflow")]
    Overflow,
}

/// A compiled filter.
#[derive(Debug, Clone)]
pub struct Filter {
    source: String,
    tokens: Vec<Token>,
    expr: Expr,
    fields: Vec<String>,
}

impl Filter {
    /// Tokenize, parse and validate an expression.
    pub fn compile(source: &str) -> Result<Self, FilterError> {
        let tokens = lexer::tokenize(source)?;
        let expr = ast::parse(&tokens)?;
        ast::validate(&expr)?;

        let mut fields = Vec::new();
        expr.collect_fields(&mut fields);

        Ok(Self {
            source: source.to_string(),
            tokens,
            expr,
            fields,
        })
    }

    /// The expression as received.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field names the expression reads.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Evaluate against a record.
    ///
    /// Every referenced field must exist, even in a branch that
    /// short-circuits.
    pub fn check(&self, record: &ServerRecord) -> Result<bool, FilterError> {
        if let Some(missing) = self.fields.iter().find(|f| !record.contains(f)) {
            return Err(FilterError::UnknownField(missing.clone()));
        }
        eval::eval(&self.expr, record).map(|v| v.truthy())
    }

    /// Evaluate, treating record-level failures as "no match".
    pub fn matches(&self, record: &ServerRecord) -> bool {
        match self.check(record) {
            Ok(result) => result,
            Err(e) => {
                debug!("Filter excluded record: {} [{}]", e, self.render(record));
                false
            }
        }
    }

    /// Render the expression with the record's values substituted.
    pub fn render(&self, record: &ServerRecord) -> String {
        self.tokens
            .iter()
            .map(|token| match token {
                Token::Ident(name) => match record.get(name) {
                    Some(FieldValue::Int(v)) => v.to_string(),
                    Some(FieldValue::Text(s)) if numeric_text(s).is_some() => s.clone(),
                    Some(FieldValue::Text(s)) => format!("'{}'", s),
                    None => name.clone(),
                },
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Evaluate one expression against one record.
///
/// Malformed expressions and record-level failures both yield `false`.
pub fn evaluate(expression: &str, record: &ServerRecord) -> bool {
    if expression.trim().is_empty() {
        return true;
    }

    match Filter::compile(expression) {
        Ok(filter) => filter.matches(record),
        Err(e) => {
            warn!("Invalid filter {:?}: {}", expression, e);
            false
        }
    }
}

/// Select the records matching `expression`, in order, up to `limit`.
///
/// An empty expression matches everything. A malformed one stops the search
/// and returns what matched so far, which is nothing since the expression is
/// checked before the first record.
pub fn evaluate_batch<'a, I>(expression: &str, records: I, limit: Option<usize>) -> Vec<&'a ServerRecord>
where
    I: IntoIterator<Item = &'a ServerRecord>,
{
    let limit = limit.unwrap_or(usize::MAX);
    if limit == 0 {
        return Vec::new();
    }

    let filter = if expression.trim().is_empty() {
        None
    } else {
        match Filter::compile(expression) {
            Ok(filter) => Some(filter),
            Err(e) => {
                warn!("Invalid filter {:?}: {}", expression, e);
                return Vec::new();
            }
        }
    };

    let mut matched = Vec::new();
    for record in records {
        let hit = filter.as_ref().map_or(true, |f| f.matches(record));
        if hit {
            matched.push(record);
            if matched.len() >= limit {
                break;
            }
        }
    }
    matched
}
