//! The embedded expression language used by repetition bounds, and the value
//! model shared with derivation trees.
//!
//! The language is deliberately small: integer literals, identifiers bound
//! from the grammar environment or from tree queries, the four arithmetic
//! operators (`/` and `%` are flooring), and the `int`, `len`, `str`, `min`
//! and `max` functions. That is enough to express length fields and other
//! data-dependent repetition counts without embedding a host-language
//! evaluator.
use std::fmt;

use ahash::AHashMap;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{alpha1, alphanumeric1, char, digit1, multispace0};
use nom::combinator::{all_consuming, map, map_res, recognize};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

use crate::symbol::NonTerminal;
use crate::tree::{DerivationTree, NodeId};
use crate::utils::latin1_decode;

/// A value computed from a derivation tree or bound in the grammar
/// environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// A UTF-8 string.
    Str(String),
    /// A byte sequence.
    Bytes(Vec<u8>),
    /// An integer, as produced by bit runs or arithmetic.
    Int(i128),
}

impl Value {
    /// Convert to an integer: strings parse as decimal, byte sequences are
    /// read as big-endian unsigned numbers.
    pub fn as_int(&self) -> Result<i128, ExprError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| ExprError::NotAnInt(self.to_string())),
            Value::Bytes(b) => {
                if b.len() > 15 {
                    return Err(ExprError::NotAnInt(self.to_string()));
                }
                Ok(b.iter().fold(0i128, |acc, &x| (acc << 8) | i128::from(x)))
            }
        }
    }

    /// The length of the value: characters for strings, bytes for byte
    /// sequences. Integers have no length.
    pub fn length(&self) -> Result<usize, ExprError> {
        match self {
            Value::Str(s) => Ok(s.chars().count()),
            Value::Bytes(b) => Ok(b.len()),
            Value::Int(_) => Err(ExprError::NoLength(self.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "{}", latin1_decode(b)),
            Value::Int(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, thiserror::Error)]
/// The error type for parsing and evaluating bound expressions.
pub enum ExprError {
    #[error("could not parse expression {0:?}")]
    /// The expression source text does not parse.
    Parse(String),
    #[error("unknown identifier {0}")]
    /// An identifier is bound neither by a query nor by the environment.
    UnknownIdent(String),
    #[error("unknown function {0}")]
    /// The expression calls a function the language does not define.
    UnknownFunction(String),
    #[error("{0} expects {1} argument(s)")]
    /// A function was called with the wrong number of arguments.
    Arity(&'static str, usize),
    #[error("cannot convert {0:?} to an integer")]
    /// The value cannot be read as an integer.
    NotAnInt(String),
    #[error("{0:?} has no length")]
    /// The value has no length.
    NoLength(String),
    #[error("division by zero")]
    /// Division or remainder by zero.
    DivisionByZero,
    #[error("integer overflow")]
    /// Arithmetic overflowed the integer range.
    Overflow,
}

/// A parsed bound expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// An integer literal.
    Int(i128),
    /// An identifier looked up in the evaluation scope.
    Ident(String),
    /// A function call.
    Call(String, Vec<Expr>),
    /// Arithmetic negation.
    Neg(Box<Expr>),
    /// A binary arithmetic operation.
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

/// A binary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Flooring division.
    Div,
    /// Flooring remainder.
    Mod,
}

impl Expr {
    /// Parse an expression from its source text.
    pub fn parse(source: &str) -> Result<Expr, ExprError> {
        all_consuming(ws(expr))(source)
            .map(|(_, e)| e)
            .map_err(|_| ExprError::Parse(source.to_string()))
    }

    /// Evaluate against a scope.
    pub fn eval(&self, scope: &Scope<'_>) -> Result<Value, ExprError> {
        match self {
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Ident(name) => scope
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::UnknownIdent(name.clone())),
            Expr::Neg(inner) => {
                let v = inner.eval(scope)?.as_int()?;
                v.checked_neg().map(Value::Int).ok_or(ExprError::Overflow)
            }
            Expr::Bin(op, lhs, rhs) => {
                let a = lhs.eval(scope)?.as_int()?;
                let b = rhs.eval(scope)?.as_int()?;
                let result = match op {
                    BinOp::Add => a.checked_add(b).ok_or(ExprError::Overflow)?,
                    BinOp::Sub => a.checked_sub(b).ok_or(ExprError::Overflow)?,
                    BinOp::Mul => a.checked_mul(b).ok_or(ExprError::Overflow)?,
                    BinOp::Div => {
                        if b == 0 {
                            return Err(ExprError::DivisionByZero);
                        }
                        a.checked_div_euclid(b).ok_or(ExprError::Overflow)?
                    }
                    BinOp::Mod => {
                        if b == 0 {
                            return Err(ExprError::DivisionByZero);
                        }
                        a.checked_rem_euclid(b).ok_or(ExprError::Overflow)?
                    }
                };
                Ok(Value::Int(result))
            }
            Expr::Call(name, args) => eval_call(name, args, scope),
        }
    }
}

fn eval_call(name: &str, args: &[Expr], scope: &Scope<'_>) -> Result<Value, ExprError> {
    match name {
        "int" => {
            let [arg] = args else {
                return Err(ExprError::Arity("int", 1));
            };
            Ok(Value::Int(arg.eval(scope)?.as_int()?))
        }
        "len" => {
            let [arg] = args else {
                return Err(ExprError::Arity("len", 1));
            };
            Ok(Value::Int(arg.eval(scope)?.length()? as i128))
        }
        "str" => {
            let [arg] = args else {
                return Err(ExprError::Arity("str", 1));
            };
            Ok(Value::Str(arg.eval(scope)?.to_string()))
        }
        "min" => {
            let [a, b] = args else {
                return Err(ExprError::Arity("min", 2));
            };
            Ok(Value::Int(
                a.eval(scope)?.as_int()?.min(b.eval(scope)?.as_int()?),
            ))
        }
        "max" => {
            let [a, b] = args else {
                return Err(ExprError::Arity("max", 2));
            };
            Ok(Value::Int(
                a.eval(scope)?.as_int()?.max(b.eval(scope)?.as_int()?),
            ))
        }
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn call(input: &str) -> IResult<&str, Expr> {
    map(
        pair(
            identifier,
            delimited(
                ws(char('(')),
                separated_list0(ws(char(',')), expr),
                char(')'),
            ),
        ),
        |(name, args)| Expr::Call(name.to_string(), args),
    )(input)
}

fn factor(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map_res(digit1, |digits: &str| {
            digits.parse::<i128>().map(Expr::Int)
        }),
        call,
        map(identifier, |name| Expr::Ident(name.to_string())),
        delimited(char('('), expr, char(')')),
        map(preceded(char('-'), factor), |e| Expr::Neg(Box::new(e))),
    )))(input)
}

fn term(input: &str) -> IResult<&str, Expr> {
    let (input, first) = factor(input)?;
    let (input, rest) = many0(pair(alt((char('*'), char('/'), char('%'))), factor))(input)?;
    Ok((input, rest.into_iter().fold(first, |acc, (op, rhs)| {
        let op = match op {
            '*' => BinOp::Mul,
            '/' => BinOp::Div,
            _ => BinOp::Mod,
        };
        Expr::Bin(op, Box::new(acc), Box::new(rhs))
    })))
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = term(input)?;
    let (input, rest) = many0(pair(alt((char('+'), char('-'))), term))(input)?;
    Ok((input, rest.into_iter().fold(first, |acc, (op, rhs)| {
        let op = if op == '+' { BinOp::Add } else { BinOp::Sub };
        Expr::Bin(op, Box::new(acc), Box::new(rhs))
    })))
}

/// The environment bound expressions and generators are evaluated against:
/// a global and a local name space of [`Value`]s. Each evaluation works on
/// its own scope, so writes never leak into sibling evaluations.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    globals: AHashMap<String, Value>,
    locals: AHashMap<String, Value>,
}

impl Environment {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a global name.
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Bind a local name.
    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        self.locals.insert(name.into(), value);
    }

    /// Merge another environment into this one. Names in `other` win.
    pub fn merge(&mut self, other: &Environment) {
        self.globals
            .extend(other.globals.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.locals
            .extend(other.locals.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Open an evaluation scope over this environment.
    pub fn scope(&self) -> Scope<'_> {
        Scope {
            env: self,
            bindings: AHashMap::new(),
        }
    }
}

/// A per-evaluation view of an [`Environment`]. Names bound on the scope
/// shadow the environment's locals, which shadow its globals.
#[derive(Debug)]
pub struct Scope<'a> {
    env: &'a Environment,
    bindings: AHashMap<String, Value>,
}

impl Scope<'_> {
    /// Bind a name for the duration of this scope.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    /// Look a name up: scope bindings, then locals, then globals.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings
            .get(name)
            .or_else(|| self.env.locals.get(name))
            .or_else(|| self.env.globals.get(name))
    }
}

/// A path query that locates subtrees inside a (partial) derivation tree.
///
/// Each segment names a nonterminal; the query descends segment by segment,
/// collecting every subtree labelled with the segment's nonterminal that is
/// reachable from the matches of the previous segment. A single-segment
/// query finds all subtrees with that symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeQuery {
    segments: Vec<NonTerminal>,
}

impl TreeQuery {
    /// Build a query from its segments, outermost first.
    pub fn new<I>(segments: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<NonTerminal>,
    {
        TreeQuery {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The nonterminals this query looks up.
    pub fn access_points(&self) -> impl Iterator<Item = &NonTerminal> {
        self.segments.iter()
    }

    /// Find all matches in `tree`, starting at `from`.
    pub fn find(&self, tree: &DerivationTree, from: NodeId) -> Vec<NodeId> {
        let mut current = vec![from];
        for segment in &self.segments {
            let mut next = Vec::new();
            for &id in &current {
                next.extend(tree.find_all_trees(id, segment));
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        current
    }
}

impl From<NonTerminal> for TreeQuery {
    fn from(symbol: NonTerminal) -> Self {
        TreeQuery { segments: vec![symbol] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let env = Environment::new();
        let scope = env.scope();
        let e = Expr::parse("1 + 2 * 3").unwrap();
        assert_eq!(e.eval(&scope).unwrap(), Value::Int(7));
        let e = Expr::parse("(1 + 2) * 3").unwrap();
        assert_eq!(e.eval(&scope).unwrap(), Value::Int(9));
        let e = Expr::parse("7 / 2").unwrap();
        assert_eq!(e.eval(&scope).unwrap(), Value::Int(3));
    }

    #[test]
    fn functions_and_scope() {
        let mut env = Environment::new();
        env.set_local("n", Value::Str("12".to_string()));
        let mut scope = env.scope();
        scope.bind("m", Value::Bytes(vec![0x01, 0x00]));
        assert_eq!(
            Expr::parse("int(n) + 1").unwrap().eval(&scope).unwrap(),
            Value::Int(13)
        );
        assert_eq!(
            Expr::parse("int(m)").unwrap().eval(&scope).unwrap(),
            Value::Int(256)
        );
        assert_eq!(
            Expr::parse("len(n)").unwrap().eval(&scope).unwrap(),
            Value::Int(2)
        );
        assert!(matches!(
            Expr::parse("q + 1").unwrap().eval(&scope),
            Err(ExprError::UnknownIdent(_))
        ));
    }
}
