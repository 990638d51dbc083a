//! Filter tokenizer.

use std::fmt;

use super::FilterError;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `LIKE` (case-insensitive text equality)
    Like,
}

impl CmpOp {
    /// Operator as written in a filter.
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Like => "LIKE",
        }
    }
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
}

impl ArithOp {
    /// Operator as written in a filter.
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::BitAnd => "&",
            ArithOp::BitOr => "|",
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Rem => "%",
        }
    }
}

/// A filter token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// Comparison operator.
    Cmp(CmpOp),
    /// Arithmetic operator.
    Arith(ArithOp),
    /// `and`
    And,
    /// `or`
    Or,
    /// Unsigned integer literal.
    Int(i64),
    /// Integer literal written with a leading `-`.
    SignedInt(i64),
    /// Quoted string literal.
    Str(String),
    /// Field name.
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Cmp(op) => f.write_str(op.symbol()),
            Token::Arith(op) => f.write_str(op.symbol()),
            Token::And => f.write_str("and"),
            Token::Or => f.write_str("or"),
            Token::Int(v) | Token::SignedInt(v) => write!(f, "{}", v),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Ident(name) => f.write_str(name),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Split a filter expression into tokens.
pub fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).copied();
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 1;
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Cmp(op));
                i += if or_equal { 2 } else { 1 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '\'' | '"' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&q| q == c)
                    .map(|p| start + p)
                    .ok_or(FilterError::UnterminatedString(i))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '-' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                let digits: String = chars[start..end].iter().collect();
                let value = parse_int(&format!("-{}", digits), i)?;
                tokens.push(Token::SignedInt(value));
                i = end;
            }
            '&' => {
                tokens.push(Token::Arith(ArithOp::BitAnd));
                i += 1;
            }
            '|' => {
                tokens.push(Token::Arith(ArithOp::BitOr));
                i += 1;
            }
            '+' => {
                tokens.push(Token::Arith(ArithOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Arith(ArithOp::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Arith(ArithOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Arith(ArithOp::Div));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Arith(ArithOp::Rem));
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i < chars.len() && is_word_char(chars[i]) {
                    return Err(FilterError::UnexpectedChar { ch: chars[i], offset: i });
                }
                let digits: String = chars[start..i].iter().collect();
                tokens.push(Token::Int(parse_int(&digits, start)?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "like" => Token::Cmp(CmpOp::Like),
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(FilterError::UnexpectedChar { ch: other, offset: i }),
        }
    }

    Ok(tokens)
}

fn parse_int(text: &str, offset: usize) -> Result<i64, FilterError> {
    text.parse().map_err(|_| FilterError::IntegerOverflow(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_comparisons() {
        let tokens = tokenize("a<=1 and b>=2 or c!=3 AND d<4").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("a".into()),
                Token::Cmp(CmpOp::Le),
                Token::Int(1),
                Token::And,
                Token::Ident("b".into()),
                Token::Cmp(CmpOp::Ge),
                Token::Int(2),
                Token::Or,
                Token::Ident("c".into()),
                Token::Cmp(CmpOp::Ne),
                Token::Int(3),
                Token::And,
                Token::Ident("d".into()),
                Token::Cmp(CmpOp::Lt),
                Token::Int(4),
            ]
        );
    }

    #[test]
    fn test_tokenize_strings_and_negatives() {
        let tokens = tokenize("rk = 'vs_123' and x = \"it's\" and y=-5").unwrap();
        assert_eq!(tokens[2], Token::Str("vs_123".into()));
        assert_eq!(tokens[6], Token::Str("it's".into()));
        assert_eq!(tokens[10], Token::SignedInt(-5));
    }

    #[test]
    fn test_tokenize_bitmask_group() {
        let tokens = tokenize("((1&mskdif)=mskdif)").unwrap();
        assert_eq!(tokens.len(), 9);
        assert_eq!(tokens[3], Token::Arith(ArithOp::BitAnd));
        assert_eq!(tokens[6], Token::Cmp(CmpOp::Eq));
    }

    #[test]
    fn test_tokenize_like_keyword() {
        let tokens = tokenize("zvar LIKE '102'").unwrap();
        assert_eq!(tokens[1], Token::Cmp(CmpOp::Like));
    }

    #[test]
    fn test_tokenize_errors() {
        assert!(matches!(tokenize("a = 'open"), Err(FilterError::UnterminatedString(4))));
        assert!(matches!(tokenize("a ^ 1"), Err(FilterError::UnexpectedChar { ch: '^', .. })));
        assert!(matches!(tokenize("a = 1x"), Err(FilterError::UnexpectedChar { ch: 'x', .. })));
        assert!(matches!(
            tokenize("a = 99999999999999999999"),
            Err(FilterError::IntegerOverflow(_))
        ));
    }
}
