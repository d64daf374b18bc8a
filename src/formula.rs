//! Arithmetic formulas over grade-component codes, e.g. `MT = (P1+P2+PT)/3`.
//!
//! Grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('+' | '-') unary | primary
//! primary := number | ident | ident '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Identifiers are matched case-insensitively (stored upper-cased). A formula
//! may optionally carry its own target, `MT = ...`; the left-hand side is
//! ignored when evaluating.

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("invalid number '{text}' at position {pos}")]
    InvalidNumber { text: String, pos: usize },
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("unexpected token '{token}' at position {pos}")]
    UnexpectedToken { token: String, pos: usize },
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },
    #[error("function '{name}' needs at least one argument")]
    EmptyArguments { name: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NonFinite,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Ident(s) => s.clone(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Min,
    Max,
    Mean,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "MIN" => Some(Func::Min),
            "MAX" => Some(Func::Max),
            "MEDIA" | "AVG" => Some(Func::Mean),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call { func: Func, args: Vec<Expr> },
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let tok = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' | ';' => Token::Comma,
            c if c.is_ascii_digit() || c == '.' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let lit: String = chars[start..i].iter().collect();
                let n = lit.parse::<f64>().map_err(|_| FormulaError::InvalidNumber {
                    text: lit.clone(),
                    pos: start,
                })?;
                out.push((Token::Number(n), start));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                out.push((Token::Ident(ident.to_uppercase()), start));
                continue;
            }
            other => return Err(FormulaError::UnexpectedChar { ch: other, pos: start }),
        };
        out.push((tok, start));
        i += 1;
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn unexpected(&self) -> FormulaError {
        match self.tokens.get(self.pos) {
            Some((Token::RParen, _)) => FormulaError::UnbalancedParens,
            Some((t, p)) => FormulaError::UnexpectedToken {
                token: t.describe(),
                pos: *p,
            },
            None => FormulaError::UnexpectedEnd,
        }
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr, FormulaError> {
        let mut left = self.parse_unary()?;
        loop {
            let (op, prec) = match self.peek() {
                Some(Token::Plus) => (BinOp::Add, 1),
                Some(Token::Minus) => (BinOp::Sub, 1),
                Some(Token::Star) => (BinOp::Mul, 2),
                Some(Token::Slash) => (BinOp::Div, 2),
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let right = self.parse_expr(prec + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, FormulaError> {
        let Some((tok, _)) = self.tokens.get(self.pos).cloned() else {
            return Err(FormulaError::UnexpectedEnd);
        };
        match tok {
            Token::Number(n) => {
                self.pos += 1;
                Ok(Expr::Number(n))
            }
            Token::Ident(name) => {
                self.pos += 1;
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.parse_call(name)
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.parse_expr(0)?;
                self.expect_rparen()?;
                Ok(inner)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, FormulaError> {
        let Some(func) = Func::lookup(&name) else {
            return Err(FormulaError::UnknownFunction { name });
        };
        if self.peek() == Some(&Token::RParen) {
            return Err(FormulaError::EmptyArguments { name });
        }
        let mut args = vec![self.parse_expr(0)?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            args.push(self.parse_expr(0)?);
        }
        self.expect_rparen()?;
        Ok(Expr::Call { func, args })
    }

    fn expect_rparen(&mut self) -> Result<(), FormulaError> {
        match self.peek() {
            Some(Token::RParen) => {
                self.pos += 1;
                Ok(())
            }
            None => Err(FormulaError::UnbalancedParens),
            Some(_) => Err(self.unexpected()),
        }
    }
}

/// A parsed formula. Parsing once and evaluating per student keeps the
/// resolver from re-tokenizing the same text for every row of the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    target: Option<String>,
    expr: Expr,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Formula, FormulaError> {
        let (target, body) = split_target(text);
        if body.trim().is_empty() {
            return Err(FormulaError::Empty);
        }
        let tokens = tokenize(body)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr(0)?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.unexpected());
        }
        Ok(Formula { target, expr })
    }

    /// Left-hand side of `CODE = ...`, if the formula was written that way.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_vars(&self.expr, &mut out);
        out
    }

    /// Unbound variables evaluate to 0.
    pub fn eval(&self, bindings: &HashMap<String, f64>) -> Result<f64, FormulaError> {
        let v = eval_expr(&self.expr, bindings)?;
        if !v.is_finite() {
            return Err(FormulaError::NonFinite);
        }
        Ok(v)
    }
}

fn split_target(text: &str) -> (Option<String>, &str) {
    let Some((lhs, rhs)) = text.split_once('=') else {
        return (None, text);
    };
    let lhs = lhs.trim();
    let is_ident = !lhs.is_empty()
        && lhs.chars().all(|c| c.is_alphanumeric() || c == '_')
        && lhs
            .chars()
            .next()
            .map(|c| c.is_alphabetic() || c == '_')
            .unwrap_or(false);
    if is_ident {
        (Some(lhs.to_uppercase()), rhs)
    } else {
        (None, text)
    }
}

fn collect_vars(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Var(name) => {
            out.insert(name.clone());
        }
        Expr::Neg(inner) => collect_vars(inner, out),
        Expr::Binary { left, right, .. } => {
            collect_vars(left, out);
            collect_vars(right, out);
        }
        Expr::Call { args, .. } => {
            for a in args {
                collect_vars(a, out);
            }
        }
    }
}

fn eval_expr(expr: &Expr, bindings: &HashMap<String, f64>) -> Result<f64, FormulaError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Var(name) => Ok(bindings.get(name).copied().unwrap_or(0.0)),
        Expr::Neg(inner) => Ok(-eval_expr(inner, bindings)?),
        Expr::Binary { op, left, right } => {
            let l = eval_expr(left, bindings)?;
            let r = eval_expr(right, bindings)?;
            match op {
                BinOp::Add => Ok(l + r),
                BinOp::Sub => Ok(l - r),
                BinOp::Mul => Ok(l * r),
                BinOp::Div => {
                    if r == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    Ok(l / r)
                }
            }
        }
        Expr::Call { func, args } => {
            let values = args
                .iter()
                .map(|a| eval_expr(a, bindings))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(match func {
                Func::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                Func::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                Func::Mean => values.iter().sum::<f64>() / (values.len() as f64),
            })
        }
    }
}
