//! The expression grammar the evaluator accepts:
//!
//! ```text
//! expr := name (('[' expr ']') | ('.' name))* | literal
//! ```
//!
//! Names must not start with a digit; literals are double-quoted strings,
//! unsigned decimal numbers, `0x`-prefixed hex and `true`/`false`.
//! Whitespace between tokens is ignored, and trailing input after a
//! complete parse is an error.

use alloy_primitives::U256;

use crate::error::EvalError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Literal {
    /// An unsigned decimal number.
    Uint(U256),
    /// A `0x`-prefixed hex string, kept at its written byte width.
    Hex(Vec<u8>),
    Str(String),
    Bool(bool),
}

/// A parsed expression: a left-associative chain of bracket and dot
/// accesses over a base name, or a bare literal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Name(String),
    Literal(Literal),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Self, EvalError> {
        let mut parser = Parser { input: input.as_bytes(), pos: 0 };
        let expr = parser.expr()?;
        parser.skip_whitespace();
        if parser.pos != parser.input.len() {
            return Err(EvalError::ParsingFailed);
        }
        Ok(expr)
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn expr(&mut self) -> Result<Expr, EvalError> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'"') => Ok(Expr::Literal(Literal::Str(self.string()?))),
            Some(c) if c.is_ascii_digit() => Ok(Expr::Literal(self.number()?)),
            _ => self.name_chain(),
        }
    }

    fn name_chain(&mut self) -> Result<Expr, EvalError> {
        let name = self.identifier()?;
        let mut expr = match name.as_str() {
            "true" => return Ok(Expr::Literal(Literal::Bool(true))),
            "false" => return Ok(Expr::Literal(Literal::Bool(false))),
            _ => Expr::Name(name),
        };
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    expr = Expr::Field(Box::new(expr), self.identifier()?);
                }
                Some(b'[') => {
                    self.pos += 1;
                    let index = self.expr()?;
                    self.skip_whitespace();
                    if self.peek() != Some(b']') {
                        return Err(EvalError::ParsingFailed);
                    }
                    self.pos += 1;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn identifier(&mut self) -> Result<String, EvalError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let raw = &self.input[start..self.pos];
        if raw.is_empty() || raw[0].is_ascii_digit() {
            return Err(EvalError::ParsingFailed);
        }
        String::from_utf8(raw.to_vec()).map_err(|_| EvalError::ParsingFailed)
    }

    fn number(&mut self) -> Result<Literal, EvalError> {
        if self.input[self.pos..].starts_with(b"0x") || self.input[self.pos..].starts_with(b"0X") {
            self.pos += 2;
            let digits = self.take_while(|c| c.is_ascii_hexdigit())?;
            let padded =
                if digits.len() % 2 == 1 { format!("0{digits}") } else { digits.to_string() };
            return hex::decode(padded).map(Literal::Hex).map_err(|_| EvalError::ParsingFailed);
        }
        let digits = self.take_while(|c| c.is_ascii_digit())?;
        U256::from_str_radix(digits, 10).map(Literal::Uint).map_err(|_| EvalError::ParsingFailed)
    }

    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> Result<&str, EvalError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if accept(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(EvalError::ParsingFailed);
        }
        std::str::from_utf8(&self.input[start..self.pos]).map_err(|_| EvalError::ParsingFailed)
    }

    /// The body of a double-quoted string; no escape sequences.
    fn string(&mut self) -> Result<String, EvalError> {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'"' {
                let body = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| EvalError::ParsingFailed)?
                    .to_string();
                self.pos += 1;
                return Ok(body);
            }
            self.pos += 1;
        }
        Err(EvalError::ParsingFailed)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Expr {
        Expr::Name(s.to_string())
    }

    #[test]
    fn plain_names_and_fields() {
        assert_eq!(Expr::parse("x").unwrap(), name("x"));
        assert_eq!(
            Expr::parse("point.x").unwrap(),
            Expr::Field(Box::new(name("point")), "x".to_string())
        );
        assert_eq!(
            Expr::parse("a.b.c").unwrap(),
            Expr::Field(
                Box::new(Expr::Field(Box::new(name("a")), "b".to_string())),
                "c".to_string()
            )
        );
    }

    #[test]
    fn bracket_indexing_nests() {
        assert_eq!(
            Expr::parse("xs[0]").unwrap(),
            Expr::Index(Box::new(name("xs")), Box::new(Expr::Literal(Literal::Uint(U256::ZERO))))
        );
        // The index may itself be a dotted expression.
        assert_eq!(
            Expr::parse("m[s.key]").unwrap(),
            Expr::Index(
                Box::new(name("m")),
                Box::new(Expr::Field(Box::new(name("s")), "key".to_string()))
            )
        );
    }

    #[test]
    fn literals() {
        assert_eq!(Expr::parse("42").unwrap(), Expr::Literal(Literal::Uint(U256::from(42))));
        assert_eq!(Expr::parse("true").unwrap(), Expr::Literal(Literal::Bool(true)));
        assert_eq!(Expr::parse("false").unwrap(), Expr::Literal(Literal::Bool(false)));
        assert_eq!(
            Expr::parse("\"hello world\"").unwrap(),
            Expr::Literal(Literal::Str("hello world".to_string()))
        );
        assert_eq!(
            Expr::parse("0xdeadbeef").unwrap(),
            Expr::Literal(Literal::Hex(vec![0xde, 0xad, 0xbe, 0xef]))
        );
        // Odd-length hex keeps its value.
        assert_eq!(Expr::parse("0xfff").unwrap(), Expr::Literal(Literal::Hex(vec![0x0f, 0xff])));
    }

    #[test]
    fn whitespace_between_tokens_is_ignored() {
        assert_eq!(Expr::parse(" m [ \"k\" ] . v ").unwrap(), Expr::parse("m[\"k\"].v").unwrap());
    }

    #[test]
    fn malformed_input_is_rejected() {
        for input in
            ["", "9abc", "a.", "a[", "a[0", "a]", "a..b", "\"unterminated", "a b", "42x", "0x"]
        {
            assert!(
                matches!(Expr::parse(input), Err(EvalError::ParsingFailed)),
                "`{input}` should not parse"
            );
        }
    }
}
