//! Filter expression tree, parser and validator.

use super::lexer::{ArithOp, CmpOp, Token};
use super::FilterError;

/// Nesting limit for groups and unary minus.
pub const MAX_DEPTH: usize = 64;

/// A closed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Integer literal.
    Int(i64),
    /// String literal.
    Str(String),
    /// Record field, resolved at evaluation time.
    Field(String),
    /// Unary minus.
    Neg(Box<Expr>),
    /// Binary arithmetic.
    Arith {
        /// Operator.
        op: ArithOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Comparison.
    Compare {
        /// Operator.
        op: CmpOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Boolean `and`.
    And(Box<Expr>, Box<Expr>),
    /// Boolean `or`.
    Or(Box<Expr>, Box<Expr>),
    /// Parenthesised group.
    Group(Box<Expr>),
}

impl Expr {
    /// Visit every field name in the tree.
    pub fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Field(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Int(_) | Expr::Str(_) => {}
            Expr::Neg(inner) | Expr::Group(inner) => inner.collect_fields(out),
            Expr::Arith { lhs, rhs, .. }
            | Expr::Compare { lhs, rhs, .. }
            | Expr::And(lhs, rhs)
            | Expr::Or(lhs, rhs) => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
        }
    }
}

/// Token limit for one filter.
pub const MAX_TOKENS: usize = 1024;

/// Parse a token stream into a single expression.
pub fn parse(tokens: &[Token]) -> Result<Expr, FilterError> {
    if tokens.len() > MAX_TOKENS {
        return Err(FilterError::TooLong(tokens.len()));
    }
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let expr = parser.or_expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(FilterError::UnexpectedToken {
            token: token.to_string(),
            position: parser.pos,
        }),
    }
}

/// Whitelist check run once per compiled filter.
///
/// Arithmetic only accepts numeric operands: literals, fields, negation,
/// nested arithmetic or groups of those.
pub fn validate(expr: &Expr) -> Result<(), FilterError> {
    match expr {
        Expr::Int(_) | Expr::Str(_) | Expr::Field(_) => Ok(()),
        Expr::Neg(inner) => check_numeric(inner),
        Expr::Arith { lhs, rhs, .. } => {
            check_numeric(lhs)?;
            check_numeric(rhs)
        }
        Expr::Compare { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            validate(lhs)?;
            validate(rhs)
        }
        Expr::Group(inner) => validate(inner),
    }
}

fn check_numeric(expr: &Expr) -> Result<(), FilterError> {
    match expr {
        Expr::Int(_) | Expr::Field(_) => Ok(()),
        Expr::Neg(_) | Expr::Arith { .. } => validate(expr),
        Expr::Group(inner) => check_numeric(inner),
        Expr::Str(s) => Err(FilterError::NonNumericOperand(format!("'{}'", s))),
        Expr::Compare { op, .. } => Err(FilterError::NonNumericOperand(op.symbol().to_string())),
        Expr::And(..) => Err(FilterError::NonNumericOperand("and".into())),
        Expr::Or(..) => Err(FilterError::NonNumericOperand("or".into())),
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn unexpected(&self) -> FilterError {
        match self.peek() {
            Some(token) => FilterError::UnexpectedToken {
                token: token.to_string(),
                position: self.pos,
            },
            None => FilterError::UnexpectedEnd,
        }
    }

    fn enter(&mut self) -> Result<(), FilterError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FilterError::TooDeep);
        }
        Ok(())
    }

    fn or_expr(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, FilterError> {
        let lhs = self.bit_or()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            self.pos += 1;
            let rhs = self.bit_or()?;
            if let Some(Token::Cmp(_)) = self.peek() {
                return Err(self.unexpected());
            }
            return Ok(Expr::Compare {
                op: *op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn binary_level(
        &mut self,
        ops: &[ArithOp],
        next: fn(&mut Self) -> Result<Expr, FilterError>,
    ) -> Result<Expr, FilterError> {
        let mut lhs = next(self)?;
        loop {
            let op = match self.peek() {
                Some(Token::Arith(op)) if ops.contains(op) => *op,
                // `a -1` reads as a subtraction once an operand is complete.
                Some(Token::SignedInt(v)) if ops.contains(&ArithOp::Sub) => {
                    self.pos += 1;
                    let magnitude = v.checked_neg().map_or(Expr::Neg(Box::new(Expr::Int(*v))), Expr::Int);
                    let rhs = self.term_tail(magnitude)?;
                    lhs = Expr::Arith {
                        op: ArithOp::Sub,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                    continue;
                }
                _ => break,
            };
            self.pos += 1;
            let rhs = next(self)?;
            lhs = Expr::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn bit_or(&mut self) -> Result<Expr, FilterError> {
        self.binary_level(&[ArithOp::BitOr], Self::bit_and)
    }

    fn bit_and(&mut self) -> Result<Expr, FilterError> {
        self.binary_level(&[ArithOp::BitAnd], Self::additive)
    }

    fn additive(&mut self) -> Result<Expr, FilterError> {
        self.binary_level(&[ArithOp::Add, ArithOp::Sub], Self::term)
    }

    fn term(&mut self) -> Result<Expr, FilterError> {
        let first = self.unary()?;
        self.term_tail(first)
    }

    /// Continue a multiplicative chain from an already parsed operand.
    fn term_tail(&mut self, mut lhs: Expr) -> Result<Expr, FilterError> {
        while let Some(Token::Arith(op @ (ArithOp::Mul | ArithOp::Div | ArithOp::Rem))) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Arith {
                op: *op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        if self.peek() == Some(&Token::Arith(ArithOp::Sub)) {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        let expr = match self.peek() {
            Some(Token::Int(v)) | Some(Token::SignedInt(v)) => Expr::Int(*v),
            Some(Token::Str(s)) => Expr::Str(s.clone()),
            Some(Token::Ident(name)) => Expr::Field(name.clone()),
            Some(Token::LParen) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.or_expr()?;
                self.depth -= 1;
                return match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(Expr::Group(Box::new(inner)))
                    }
                    Some(_) => Err(self.unexpected()),
                    None => Err(FilterError::UnbalancedParens),
                };
            }
            _ => return Err(self.unexpected()),
        };
        self.pos += 1;
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::lexer::tokenize;

    fn parse_str(input: &str) -> Result<Expr, FilterError> {
        let expr = parse(&tokenize(input)?)?;
        validate(&expr)?;
        Ok(expr)
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = parse_str("a = 1 or b = 2 and c = 3").unwrap();
        match expr {
            Expr::Or(_, rhs) => assert!(matches!(*rhs, Expr::And(..))),
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_bitmask_comparison() {
        let expr = parse_str("(1&mskdif)=mskdif").unwrap();
        match expr {
            Expr::Compare { op: CmpOp::Eq, lhs, .. } => {
                assert!(matches!(*lhs, Expr::Group(ref g) if matches!(**g, Expr::Arith { op: ArithOp::BitAnd, .. })));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_signed_literal_after_operand_is_subtraction() {
        let expr = parse_str("a -1 = 4").unwrap();
        match expr {
            Expr::Compare { lhs, .. } => {
                assert_eq!(
                    *lhs,
                    Expr::Arith {
                        op: ArithOp::Sub,
                        lhs: Box::new(Expr::Field("a".into())),
                        rhs: Box::new(Expr::Int(1)),
                    }
                );
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_collect_fields() {
        let expr = parse_str("dwc_mresv != dwc_pid and maxplayers = 2 and dwc_pid != 5").unwrap();
        let mut fields = Vec::new();
        expr.collect_fields(&mut fields);
        assert_eq!(fields, vec!["dwc_mresv", "dwc_pid", "maxplayers"]);
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(parse_str("(a = 1"), Err(FilterError::UnbalancedParens)));
        assert!(matches!(parse_str("a = 1)"), Err(FilterError::UnexpectedToken { .. })));
        assert!(matches!(parse_str("a = "), Err(FilterError::UnexpectedEnd)));
        assert!(matches!(parse_str("a = 1 b = 2"), Err(FilterError::UnexpectedToken { .. })));
        assert!(matches!(parse_str("1 < a < 3"), Err(FilterError::UnexpectedToken { .. })));
        assert!(matches!(parse_str("and"), Err(FilterError::UnexpectedToken { .. })));
    }

    #[test]
    fn test_string_arithmetic_rejected() {
        assert!(matches!(parse_str("'a' + 1 = 2"), Err(FilterError::NonNumericOperand(_))));
        assert!(matches!(parse_str("(a = 1) & 1"), Err(FilterError::NonNumericOperand(_))));
        assert!(parse_str("-(a + 1) = -3").is_ok());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}1{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert!(matches!(parse_str(&deep), Err(FilterError::TooDeep)));
        let ok = format!("{}1{}", "(".repeat(8), ")".repeat(8));
        assert!(parse_str(&ok).is_ok());
    }
}
