//! Expression grammar used inside template markers.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := number | string | path | '(' expr ')'
//! path    := ident ('.' segment)*
//! ```

use ordered_float::OrderedFloat;

use crate::error::{KurfileError, Result};
use crate::scope::Scope;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Integer(i64),
    Float(f64),
    Str(String),
    Path(String),
    Op(char),
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Negate(Box<Expr>),
    Binary(Box<Expr>, char, Box<Expr>),
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(KurfileError::template(source, "unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let token = if text.contains('.') {
                    text.parse::<f64>().map(Token::Float).ok()
                } else {
                    text.parse::<i64>().map(Token::Integer).ok()
                };
                match token {
                    Some(token) => tokens.push(token),
                    None => {
                        return Err(KurfileError::template(
                            source,
                            format!("invalid number `{}`", text),
                        ));
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let path: String = chars[start..i].iter().collect();
                if path.ends_with('.') || path.contains("..") {
                    return Err(KurfileError::template(
                        source,
                        format!("invalid path `{}`", path),
                    ));
                }
                tokens.push(Token::Path(path));
            }
            other => {
                return Err(KurfileError::template(
                    source,
                    format!("unexpected character `{}`", other),
                ));
            }
        }
    }

    Ok(tokens)
}

// Bounds on untrusted expressions. Parsing, evaluation and drop all recurse
// over the expression tree.
const MAX_DEPTH: usize = 64;
const MAX_TOKENS: usize = 4096;

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> KurfileError {
        KurfileError::template(self.source, reason)
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            let inner = self.nested(|parser| parser.unary())?;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Integer(i)) => Ok(Expr::Literal(Value::Integer(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::from(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::Open) => {
                let inner = self.nested(|parser| parser.expr())?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(self.error("expected `)`")),
                }
            }
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(KurfileError::template(source, "empty expression"));
    }
    if tokens.len() > MAX_TOKENS {
        return Err(KurfileError::template(
            source,
            format!("expression longer than {} tokens", MAX_TOKENS),
        ));
    }
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error(format!(
            "unexpected trailing token {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

impl Expr {
    pub fn eval(&self, source: &str, scope: &Scope<'_>) -> Result<Value> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(path) => scope.lookup(path).cloned().ok_or_else(|| {
                KurfileError::UnknownBinding {
                    path: path.clone(),
                    expression: source.to_string(),
                }
            }),
            Expr::Negate(inner) => match inner.eval(source, scope)? {
                Value::Integer(i) => i
                    .checked_neg()
                    .map(Value::Integer)
                    .ok_or_else(|| KurfileError::template(source, "integer overflow")),
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(KurfileError::template(
                    source,
                    format!("cannot negate a {}", other.type_name()),
                )),
            },
            Expr::Binary(lhs, op, rhs) => {
                let lhs = lhs.eval(source, scope)?;
                let rhs = rhs.eval(source, scope)?;
                apply(source, *op, lhs, rhs)
            }
        }
    }
}

fn apply(source: &str, op: char, lhs: Value, rhs: Value) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => integer_op(source, op, a, b),
        (Value::String(a), Value::String(b)) if op == '+' => Ok(Value::String(a + &b)),
        (lhs, rhs) => match (lhs.get_as::<f64>(), rhs.get_as::<f64>()) {
            (Some(a), Some(b)) => float_op(source, op, a, b),
            _ => Err(KurfileError::template(
                source,
                format!(
                    "unsupported operands for `{}`: {} and {}",
                    op,
                    lhs.type_name(),
                    rhs.type_name()
                ),
            )),
        },
    }
}

fn integer_op(source: &str, op: char, a: i64, b: i64) -> Result<Value> {
    let overflow = || KurfileError::template(source, "integer overflow");
    match op {
        '+' => a.checked_add(b).map(Value::Integer).ok_or_else(overflow),
        '-' => a.checked_sub(b).map(Value::Integer).ok_or_else(overflow),
        '*' => a.checked_mul(b).map(Value::Integer).ok_or_else(overflow),
        '/' => {
            if b == 0 {
                Err(KurfileError::template(source, "division by zero"))
            } else if a % b == 0 {
                a.checked_div(b).map(Value::Integer).ok_or_else(overflow)
            } else {
                Ok(Value::from(a as f64 / b as f64))
            }
        }
        _ => Err(KurfileError::template(source, format!("unknown operator `{}`", op))),
    }
}

fn float_op(source: &str, op: char, a: f64, b: f64) -> Result<Value> {
    let result = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' if b == 0.0 => return Err(KurfileError::template(source, "division by zero")),
        '/' => a / b,
        _ => return Err(KurfileError::template(source, format!("unknown operator `{}`", op))),
    };
    Ok(Value::Number(OrderedFloat(result)))
}
