//! Tree evaluation against one record.

use std::borrow::Cow;

use super::ast::Expr;
use super::lexer::{ArithOp, CmpOp};
use super::FilterError;
use crate::registry::record::{numeric_text, FieldValue, ServerRecord};

/// Intermediate value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    /// Integer.
    Int(i64),
    /// Text.
    Str(Cow<'a, str>),
    /// Text field that reads as an integer. Compares as text only against text.
    NumText(i64, &'a str),
    /// Result of a comparison or boolean operator.
    Bool(bool),
}

impl Value<'_> {
    /// Truthiness of a final or boolean operand.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(v) | Value::NumText(v, _) => *v != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
        }
    }

    fn number(&self) -> Option<i64> {
        match self {
            Value::Int(v) | Value::NumText(v, _) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            Value::Str(_) => None,
        }
    }

    fn text(&self) -> Cow<'_, str> {
        match self {
            Value::Int(v) => Cow::Owned(v.to_string()),
            Value::Str(s) => Cow::Borrowed(s),
            Value::NumText(_, s) => Cow::Borrowed(s),
            Value::Bool(true) => Cow::Borrowed("True"),
            Value::Bool(false) => Cow::Borrowed("False"),
        }
    }

    fn is_text(&self) -> bool {
        matches!(self, Value::Str(_))
    }
}

/// Resolve a field to a value. Resolution is one level deep: a text value
/// that happens to name another field stays text.
pub fn resolve<'a>(record: &'a ServerRecord, name: &str) -> Result<Value<'a>, FilterError> {
    match record.get(name) {
        Some(FieldValue::Int(v)) => Ok(Value::Int(*v)),
        Some(FieldValue::Text(s)) => Ok(match numeric_text(s) {
            Some(v) => Value::NumText(v, s),
            None => Value::Str(Cow::Borrowed(s)),
        }),
        None => Err(FilterError::UnknownField(name.to_string())),
    }
}

/// Evaluate an expression.
pub fn eval<'a>(expr: &'a Expr, record: &'a ServerRecord) -> Result<Value<'a>, FilterError> {
    match expr {
        Expr::Int(v) => Ok(Value::Int(*v)),
        Expr::Str(s) => Ok(Value::Str(Cow::Borrowed(s))),
        Expr::Field(name) => resolve(record, name),
        Expr::Group(inner) => eval(inner, record),
        Expr::Neg(inner) => {
            let v = numeric(eval(inner, record)?, "-")?;
            v.checked_neg().map(Value::Int).ok_or(FilterError::Overflow)
        }
        Expr::Arith { op, lhs, rhs } => {
            let l = numeric(eval(lhs, record)?, op.symbol())?;
            let r = numeric(eval(rhs, record)?, op.symbol())?;
            arith(*op, l, r).map(Value::Int)
        }
        Expr::Compare { op, lhs, rhs } => {
            let l = eval(lhs, record)?;
            let r = eval(rhs, record)?;
            compare(*op, &l, &r).map(Value::Bool)
        }
        Expr::And(lhs, rhs) => {
            if !eval(lhs, record)?.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(rhs, record)?.truthy()))
        }
        Expr::Or(lhs, rhs) => {
            if eval(lhs, record)?.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(rhs, record)?.truthy()))
        }
    }
}

fn numeric(value: Value<'_>, op: &str) -> Result<i64, FilterError> {
    value.number().ok_or_else(|| FilterError::TypeMismatch(op.to_string()))
}

/// Integer arithmetic with floor division and a divisor-signed remainder.
fn arith(op: ArithOp, l: i64, r: i64) -> Result<i64, FilterError> {
    let result = match op {
        ArithOp::BitAnd => Some(l & r),
        ArithOp::BitOr => Some(l | r),
        ArithOp::Add => l.checked_add(r),
        ArithOp::Sub => l.checked_sub(r),
        ArithOp::Mul => l.checked_mul(r),
        ArithOp::Div => {
            if r == 0 {
                return Err(FilterError::DivisionByZero);
            }
            l.checked_div(r).map(|q| if (l % r != 0) && ((l < 0) != (r < 0)) { q - 1 } else { q })
        }
        ArithOp::Rem => {
            if r == 0 {
                return Err(FilterError::DivisionByZero);
            }
            l.checked_rem(r).map(|m| if m != 0 && ((m < 0) != (r < 0)) { m + r } else { m })
        }
    };
    result.ok_or(FilterError::Overflow)
}

fn compare(op: CmpOp, l: &Value<'_>, r: &Value<'_>) -> Result<bool, FilterError> {
    if op == CmpOp::Like {
        return Ok(l.text().to_lowercase() == r.text().to_lowercase());
    }

    // A numeric-looking text field compares as text against text.
    let textual = l.is_text() || r.is_text();
    let (ln, rn) = if textual { (None, None) } else { (l.number(), r.number()) };

    if let (Some(a), Some(b)) = (ln, rn) {
        return Ok(match op {
            CmpOp::Eq | CmpOp::Like => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        });
    }

    // At least one side is text. Only equality is defined, and only text
    // (or a numeric-looking text field) can equal text.
    let same_kind = comparable_as_text(l) && comparable_as_text(r);
    match op {
        CmpOp::Eq => Ok(same_kind && l.text() == r.text()),
        CmpOp::Ne => Ok(!(same_kind && l.text() == r.text())),
        _ => Err(FilterError::TypeMismatch(op.symbol().to_string())),
    }
}

fn comparable_as_text(v: &Value<'_>) -> bool {
    matches!(v, Value::Str(_) | Value::NumText(..))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_division_and_remainder() {
        assert_eq!(arith(ArithOp::Div, 7, 2).unwrap(), 3);
        assert_eq!(arith(ArithOp::Div, -7, 2).unwrap(), -4);
        assert_eq!(arith(ArithOp::Rem, -7, 2).unwrap(), 1);
        assert_eq!(arith(ArithOp::Rem, 7, -2).unwrap(), -1);
        assert!(matches!(arith(ArithOp::Div, 1, 0), Err(FilterError::DivisionByZero)));
        assert!(matches!(arith(ArithOp::Add, i64::MAX, 1), Err(FilterError::Overflow)));
    }

    #[test]
    fn test_numeric_text_against_string_literal() {
        let l = Value::NumText(102, "102");
        assert!(compare(CmpOp::Eq, &l, &Value::Str("102".into())).unwrap());
        assert!(compare(CmpOp::Eq, &l, &Value::Int(102)).unwrap());
        assert!(!compare(CmpOp::Eq, &Value::Int(102), &Value::Str("102".into())).unwrap());
        assert!(compare(CmpOp::Ne, &Value::Int(102), &Value::Str("102".into())).unwrap());
    }

    #[test]
    fn test_relational_on_text_is_mismatch() {
        let err = compare(CmpOp::Lt, &Value::Str("a".into()), &Value::Str("b".into()));
        assert!(matches!(err, Err(FilterError::TypeMismatch(_))));
        let err = compare(CmpOp::Ge, &Value::NumText(3, "3"), &Value::Str("b".into()));
        assert!(matches!(err, Err(FilterError::TypeMismatch(_))));
    }

    #[test]
    fn test_like_is_case_insensitive() {
        assert!(compare(CmpOp::Like, &Value::Str("EU".into()), &Value::Str("eu".into())).unwrap());
        assert!(compare(CmpOp::Like, &Value::Int(1), &Value::Str("1".into())).unwrap());
        assert!(!compare(CmpOp::Like, &Value::Str("US".into()), &Value::Str("eu".into())).unwrap());
    }
}
