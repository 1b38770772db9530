//! Predicate programs: small boolean expressions evaluated against
//! `{entity, attr, value}` bindings during validation. Programs are compiled
//! once per unique source text, keyed by its BLAKE2b-256 digest.

use attrdb_types::Value;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use dashmap::DashMap;
use logos::Logos;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

type Blake2b256 = Blake2b<U32>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("eval error: {0}")]
    Eval(String),
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("!")]
    Not,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len() - 1].to_string())
    })]
    Str(String),
    #[regex(r"[A-Za-z][A-Za-z0-9_./-]*", |lex| Some(lex.slice().to_string()))]
    Ident(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Bool(bool),
    Int(i64),
    Str(String),
    Var(String),
    Len(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token) -> Result<(), PredError> {
        match self.bump() {
            Some(t) if t == *token => Ok(()),
            other => Err(PredError::Parse(format!(
                "expected {token:?}, got {other:?}"
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, PredError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, PredError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, PredError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, PredError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.parse_unary()?;
        Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr, PredError> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, PredError> {
        match self.bump() {
            Some(Token::Int(i)) => Ok(Expr::Int(i)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "len" if self.peek() == Some(&Token::LParen) => {
                    self.bump();
                    let inner = self.parse_expr()?;
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Len(Box::new(inner)))
                }
                _ => Ok(Expr::Var(name)),
            },
            other => Err(PredError::Parse(format!("unexpected token {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PredValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for PredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredValue::Bool(b) => write!(f, "{b}"),
            PredValue::Int(i) => write!(f, "{i}"),
            PredValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

fn bind_value(value: &Value) -> PredValue {
    match value {
        Value::Bool(b) => PredValue::Bool(*b),
        Value::Int(i) => PredValue::Int(*i),
        Value::Uint(u) => i64::try_from(*u)
            .map(PredValue::Int)
            .unwrap_or_else(|_| PredValue::Str(u.to_string())),
        Value::String(s) => PredValue::Str(s.clone()),
        Value::Keyword(k) => PredValue::Str(k.as_str().to_string()),
        Value::Id(id) => PredValue::Str(id.as_str().to_string()),
        other => PredValue::Str(other.to_string()),
    }
}

struct Env<'a> {
    entity: &'a str,
    attr: &'a str,
    value: &'a Value,
}

fn eval(expr: &Expr, env: &Env<'_>) -> Result<PredValue, PredError> {
    match expr {
        Expr::Bool(b) => Ok(PredValue::Bool(*b)),
        Expr::Int(i) => Ok(PredValue::Int(*i)),
        Expr::Str(s) => Ok(PredValue::Str(s.clone())),
        Expr::Var(name) => match name.as_str() {
            "entity" => Ok(PredValue::Str(env.entity.to_string())),
            "attr" => Ok(PredValue::Str(env.attr.to_string())),
            "value" => Ok(bind_value(env.value)),
            other => Err(PredError::Eval(format!("unknown binding {other:?}"))),
        },
        Expr::Len(inner) => match eval(inner, env)? {
            PredValue::Str(s) => Ok(PredValue::Int(s.len() as i64)),
            other => Err(PredError::Eval(format!("len() of non-string {other}"))),
        },
        Expr::Not(inner) => match eval(inner, env)? {
            PredValue::Bool(b) => Ok(PredValue::Bool(!b)),
            other => Err(PredError::Eval(format!("! of non-bool {other}"))),
        },
        Expr::And(l, r) => {
            let left = as_bool(eval(l, env)?)?;
            if !left {
                return Ok(PredValue::Bool(false));
            }
            Ok(PredValue::Bool(as_bool(eval(r, env)?)?))
        }
        Expr::Or(l, r) => {
            let left = as_bool(eval(l, env)?)?;
            if left {
                return Ok(PredValue::Bool(true));
            }
            Ok(PredValue::Bool(as_bool(eval(r, env)?)?))
        }
        Expr::Cmp(op, l, r) => {
            let left = eval(l, env)?;
            let right = eval(r, env)?;
            let ordering = match (&left, &right) {
                (PredValue::Int(a), PredValue::Int(b)) => a.cmp(b),
                (PredValue::Str(a), PredValue::Str(b)) => a.cmp(b),
                (PredValue::Bool(a), PredValue::Bool(b)) => match op {
                    CmpOp::Eq => return Ok(PredValue::Bool(a == b)),
                    CmpOp::Ne => return Ok(PredValue::Bool(a != b)),
                    _ => {
                        return Err(PredError::Eval("ordering compare on bool".into()));
                    }
                },
                _ => {
                    return Err(PredError::Eval(format!(
                        "type mismatch: {left} vs {right}"
                    )))
                }
            };
            let result = match op {
                CmpOp::Eq => ordering.is_eq(),
                CmpOp::Ne => !ordering.is_eq(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
            };
            Ok(PredValue::Bool(result))
        }
    }
}

fn as_bool(value: PredValue) -> Result<bool, PredError> {
    match value {
        PredValue::Bool(b) => Ok(b),
        other => Err(PredError::Eval(format!("expected bool, got {other}"))),
    }
}

/// A compiled predicate program.
#[derive(Debug)]
pub struct Program {
    source: String,
    expr: Expr,
}

impl Program {
    pub fn compile(source: &str) -> Result<Program, PredError> {
        let mut tokens = Vec::new();
        for token in Token::lexer(source) {
            match token {
                Ok(t) => tokens.push(t),
                Err(()) => {
                    return Err(PredError::Parse(format!("bad token in {source:?}")));
                }
            }
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(PredError::Parse("trailing tokens".into()));
        }
        Ok(Program {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the program; anything other than boolean true is a reject.
    pub fn eval_bool(&self, entity: &str, attr: &str, value: &Value) -> Result<bool, PredError> {
        let env = Env {
            entity,
            attr,
            value,
        };
        Ok(matches!(eval(&self.expr, &env)?, PredValue::Bool(true)))
    }
}

/// Process-wide cache of compiled programs, keyed by source digest.
#[derive(Default)]
pub struct ProgramCache {
    programs: DashMap<[u8; 32], Arc<Program>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, source: &str) -> Result<Arc<Program>, PredError> {
        let mut hasher = Blake2b256::new();
        hasher.update(source.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();

        if let Some(program) = self.programs.get(&key) {
            return Ok(program.clone());
        }
        let program = Arc::new(Program::compile(source)?);
        self.programs.insert(key, program.clone());
        Ok(program)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
