//! Restricted arithmetic formula evaluation.
//!
//! Formulas are a four-operator calculator over the numeric cells of a
//! single record, not a general expression language. The expression is
//! tokenized and parsed by a small recursive-descent parser and evaluated
//! directly from the parse tree; identifiers resolve only through the
//! caller-supplied context map. Anything unexpected — an unknown
//! identifier, a stray character, division by zero, a non-finite result —
//! evaluates to `None` (fail closed).

use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    /// Numeric literal with a fractional part, always a literal.
    Number(f64),
    /// Bare integer run. Resolved against the context first (expressions may
    /// reference fields by id), falling back to a numeric literal.
    Integer(String),
    /// `[A-Za-z_][A-Za-z0-9_]*`, resolved against the context by field name.
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

#[derive(Clone, Debug)]
enum Expr {
    Literal(f64),
    IntegerRef(String),
    Ref(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

/// Evaluate `expression` against a variable context keyed by field name and
/// stringified field id. Returns `None` on any lexical, syntactic, or
/// arithmetic failure.
pub fn evaluate(expression: &str, ctx: &HashMap<String, f64>) -> Option<f64> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        // Trailing tokens mean the expression was not fully consumed.
        return None;
    }
    let result = eval(&expr, ctx)?;
    result.is_finite().then_some(result)
}

fn tokenize(expression: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut buf = String::new();
                let mut saw_dot = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        buf.push(d);
                        chars.next();
                    } else if d == '.' && !saw_dot {
                        saw_dot = true;
                        buf.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // A digit run followed by identifier characters (`12x`) is
                // not a valid token stream.
                if matches!(chars.peek(), Some(c) if c.is_alphanumeric() || *c == '_') {
                    return None;
                }
                if saw_dot {
                    tokens.push(Token::Number(buf.parse().ok()?));
                } else {
                    tokens.push(Token::Integer(buf));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut buf = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        buf.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(buf));
            }
            _ => return None,
        }
    }

    Some(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.next();
                    let rhs = self.parse_term()?;
                    lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Minus) => {
                    self.next();
                    let rhs = self.parse_term()?;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => return Some(lhs),
            }
        }
    }

    fn parse_term(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.next();
                    let rhs = self.parse_unary()?;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Slash) => {
                    self.next();
                    let rhs = self.parse_unary()?;
                    lhs = Expr::Div(Box::new(lhs), Box::new(rhs));
                }
                _ => return Some(lhs),
            }
        }
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.next();
                let inner = self.parse_unary()?;
                Some(Expr::Neg(Box::new(inner)))
            }
            Some(Token::Plus) => {
                self.next();
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        match self.next()? {
            Token::Number(n) => Some(Expr::Literal(n)),
            Token::Integer(s) => Some(Expr::IntegerRef(s)),
            Token::Ident(name) => Some(Expr::Ref(name)),
            Token::LParen => {
                let inner = self.parse_expr()?;
                match self.next()? {
                    Token::RParen => Some(inner),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

fn eval(expr: &Expr, ctx: &HashMap<String, f64>) -> Option<f64> {
    match expr {
        Expr::Literal(n) => Some(*n),
        Expr::IntegerRef(s) => match ctx.get(s) {
            Some(v) => Some(*v),
            None => s.parse().ok(),
        },
        Expr::Ref(name) => ctx.get(name).copied(),
        Expr::Neg(inner) => eval(inner, ctx).map(|v| -v),
        Expr::Add(l, r) => Some(eval(l, ctx)? + eval(r, ctx)?),
        Expr::Sub(l, r) => Some(eval(l, ctx)? - eval(r, ctx)?),
        Expr::Mul(l, r) => Some(eval(l, ctx)? * eval(r, ctx)?),
        Expr::Div(l, r) => {
            let divisor = eval(r, ctx)?;
            if divisor == 0.0 {
                return None;
            }
            Some(eval(l, ctx)? / divisor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn arithmetic_precedence() {
        let c = ctx(&[]);
        assert_eq!(evaluate("1 + 2 * 3", &c), Some(7.0));
        assert_eq!(evaluate("(1 + 2) * 3", &c), Some(9.0));
        assert_eq!(evaluate("10 / 4", &c), Some(2.5));
        assert_eq!(evaluate("-3 + 5", &c), Some(2.0));
        assert_eq!(evaluate("2 * -3", &c), Some(-6.0));
    }

    #[test]
    fn identifiers_resolve_from_context() {
        let c = ctx(&[("A", 10.0), ("B", 5.0)]);
        assert_eq!(evaluate("A + B", &c), Some(15.0));
        assert_eq!(evaluate("A / B - 1", &c), Some(1.0));
    }

    #[test]
    fn bare_integers_prefer_field_ids_then_literals() {
        let c = ctx(&[("7", 100.0)]);
        assert_eq!(evaluate("7 + 1", &c), Some(101.0));
        assert_eq!(evaluate("8 + 1", &c), Some(9.0));
    }

    #[test]
    fn unresolved_identifier_is_null() {
        let c = ctx(&[("A", 1.0)]);
        assert_eq!(evaluate("A + missing", &c), None);
    }

    #[test]
    fn rejects_foreign_syntax() {
        let c = ctx(&[("A", 1.0)]);
        assert_eq!(evaluate("A; drop", &c), None);
        assert_eq!(evaluate("A ** 2", &c), None);
        assert_eq!(evaluate("pow(A, 2)", &c), None);
        assert_eq!(evaluate("A +", &c), None);
        assert_eq!(evaluate("(A", &c), None);
        assert_eq!(evaluate("", &c), None);
    }

    #[test]
    fn division_by_zero_is_null() {
        let c = ctx(&[("A", 1.0), ("Z", 0.0)]);
        assert_eq!(evaluate("A / Z", &c), None);
        assert_eq!(evaluate("A / 0", &c), None);
    }
}
