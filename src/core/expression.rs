//! Per-cell expressions over band values.
//!
//! Expressions are parsed once, at cube construction, against the band list of
//! the input cube. Band references are resolved to positions so evaluation is
//! a walk over a small tree with no lookups. Comparisons and logical operators
//! return `1.0` / `0.0`. Arithmetic and comparisons involving a missing value
//! yield `NaN`; `and` / `or` use three-valued logic, so `isnan(B1) or B1 > 5`
//! is true for a missing `B1`.
//!
//! Supported syntax:
//! - numbers, band names (letters, digits, `_` and `.`), constants `pi` and `e`
//! - `+ - * / % ^`, unary `-`, `!` / `not`
//! - `< <= > >= == !=`, `&&` / `and`, `||` / `or`
//! - functions: `abs sqrt exp log ln log10 sin cos tan asin acos atan atan2
//!   floor ceil round trunc sign isnan min max pow iif`

use crate::core::error::{ConstructionError, ConstructionResult};
use crate::core::types::BandCollection;
use std::fmt;

/// Narrow evaluation interface consumed by pixel-wise cubes.
pub trait PixelEvaluator: Send + Sync + fmt::Debug {
    /// Evaluate for one cell; `values` holds one value per input band.
    fn evaluate(&self, values: &[f64]) -> f64;

    /// Positions of the bands the expression reads.
    fn referenced_bands(&self) -> Vec<usize>;

    /// Source text.
    fn source(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Abs,
    Sqrt,
    Exp,
    Ln,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Floor,
    Ceil,
    Round,
    Trunc,
    Sign,
    IsNan,
    Min,
    Max,
    Pow,
    Iif,
}

impl Function {
    fn lookup(name: &str) -> Option<(Function, usize)> {
        let f = match name {
            "abs" => (Function::Abs, 1),
            "sqrt" => (Function::Sqrt, 1),
            "exp" => (Function::Exp, 1),
            "log" | "ln" => (Function::Ln, 1),
            "log10" => (Function::Log10, 1),
            "sin" => (Function::Sin, 1),
            "cos" => (Function::Cos, 1),
            "tan" => (Function::Tan, 1),
            "asin" => (Function::Asin, 1),
            "acos" => (Function::Acos, 1),
            "atan" => (Function::Atan, 1),
            "atan2" => (Function::Atan2, 2),
            "floor" => (Function::Floor, 1),
            "ceil" => (Function::Ceil, 1),
            "round" => (Function::Round, 1),
            "trunc" => (Function::Trunc, 1),
            "sign" => (Function::Sign, 1),
            "isnan" => (Function::IsNan, 1),
            "min" => (Function::Min, 2),
            "max" => (Function::Max, 2),
            "pow" => (Function::Pow, 2),
            "iif" => (Function::Iif, 3),
            _ => return None,
        };
        Some(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(f64),
    Band(usize),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

fn truth(v: f64) -> bool {
    !v.is_nan() && v != 0.0
}

/// Comparison result, `NaN` when either side is missing.
fn compare(a: f64, b: f64, holds: fn(&f64, &f64) -> bool) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        flag(holds(&a, &b))
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl Node {
    fn eval(&self, values: &[f64]) -> f64 {
        match self {
            Node::Const(v) => *v,
            Node::Band(i) => values[*i],
            Node::Unary(op, a) => {
                let a = a.eval(values);
                match op {
                    UnaryOp::Neg => -a,
                    UnaryOp::Not if a.is_nan() => f64::NAN,
                    UnaryOp::Not => flag(!truth(a)),
                }
            }
            Node::Binary(op, a, b) => {
                let (a, b) = (a.eval(values), b.eval(values));
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem => a % b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::Lt => compare(a, b, f64::lt),
                    BinaryOp::Le => compare(a, b, f64::le),
                    BinaryOp::Gt => compare(a, b, f64::gt),
                    BinaryOp::Ge => compare(a, b, f64::ge),
                    BinaryOp::Eq => compare(a, b, f64::eq),
                    BinaryOp::Ne => compare(a, b, f64::ne),
                    BinaryOp::And if a == 0.0 || b == 0.0 => 0.0,
                    BinaryOp::Or if truth(a) || truth(b) => 1.0,
                    BinaryOp::And | BinaryOp::Or if a.is_nan() || b.is_nan() => f64::NAN,
                    BinaryOp::And => 1.0,
                    BinaryOp::Or => 0.0,
                }
            }
            Node::Call(f, args) => {
                let arg = |i: usize| args[i].eval(values);
                match f {
                    Function::Abs => arg(0).abs(),
                    Function::Sqrt => arg(0).sqrt(),
                    Function::Exp => arg(0).exp(),
                    Function::Ln => arg(0).ln(),
                    Function::Log10 => arg(0).log10(),
                    Function::Sin => arg(0).sin(),
                    Function::Cos => arg(0).cos(),
                    Function::Tan => arg(0).tan(),
                    Function::Asin => arg(0).asin(),
                    Function::Acos => arg(0).acos(),
                    Function::Atan => arg(0).atan(),
                    Function::Atan2 => arg(0).atan2(arg(1)),
                    Function::Floor => arg(0).floor(),
                    Function::Ceil => arg(0).ceil(),
                    Function::Round => arg(0).round(),
                    Function::Trunc => arg(0).trunc(),
                    Function::Sign => {
                        let v = arg(0);
                        if v.is_nan() || v == 0.0 {
                            v
                        } else {
                            v.signum()
                        }
                    }
                    Function::IsNan => flag(arg(0).is_nan()),
                    Function::Min => {
                        let (a, b) = (arg(0), arg(1));
                        if a.is_nan() || b.is_nan() {
                            f64::NAN
                        } else {
                            a.min(b)
                        }
                    }
                    Function::Max => {
                        let (a, b) = (arg(0), arg(1));
                        if a.is_nan() || b.is_nan() {
                            f64::NAN
                        } else {
                            a.max(b)
                        }
                    }
                    Function::Pow => arg(0).powf(arg(1)),
                    Function::Iif => {
                        if truth(arg(0)) {
                            arg(1)
                        } else {
                            arg(2)
                        }
                    }
                }
            }
        }
    }

    fn collect_bands(&self, out: &mut Vec<usize>) {
        match self {
            Node::Const(_) => {}
            Node::Band(i) => {
                if !out.contains(i) {
                    out.push(*i)
                }
            }
            Node::Unary(_, a) => a.collect_bands(out),
            Node::Binary(_, a, b) => {
                a.collect_bands(out);
                b.collect_bands(out);
            }
            Node::Call(_, args) => args.iter().for_each(|a| a.collect_bands(out)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: &[&str] = &[
    "&&", "||", "<=", ">=", "==", "!=", "<", ">", "+", "-", "*", "/", "%", "^", "!", "&", "|",
    "=",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number '{}'", text))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == ',' {
            tokens.push(Token::Comma);
            i += 1;
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(*op))
                .ok_or_else(|| format!("unexpected character '{}'", c))?;
            tokens.push(Token::Op(op));
            i += op.len();
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    bands: &'a BandCollection,
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

    fn peek_op(&self, ops: &[&str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => Some(op),
            Some(Token::Ident(word)) => {
                let op = match word.as_str() {
                    "and" => "&&",
                    "or" => "||",
                    "not" => "!",
                    _ => return None,
                };
                ops.contains(&op).then_some(op)
            }
            _ => None,
        }
    }

    fn parse_or(&mut self) -> Result<Node, String> {
        let mut lhs = self.parse_and()?;
        while self.peek_op(&["||", "|"]).is_some() {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Node::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node, String> {
        let mut lhs = self.parse_cmp()?;
        while self.peek_op(&["&&", "&"]).is_some() {
            self.pos += 1;
            let rhs = self.parse_cmp()?;
            lhs = Node::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Node, String> {
        let lhs = self.parse_add()?;
        if let Some(op) = self.peek_op(&["<", "<=", ">", ">=", "==", "=", "!="]) {
            self.pos += 1;
            let rhs = self.parse_add()?;
            let op = match op {
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                "!=" => BinaryOp::Ne,
                _ => BinaryOp::Eq,
            };
            return Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Node, String> {
        let mut lhs = self.parse_mul()?;
        while let Some(op) = self.peek_op(&["+", "-"]) {
            self.pos += 1;
            let rhs = self.parse_mul()?;
            let op = if op == "+" { BinaryOp::Add } else { BinaryOp::Sub };
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Node, String> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.peek_op(&["*", "/", "%"]) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            let op = match op {
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, String> {
        if let Some(op) = self.peek_op(&["-", "+", "!"]) {
            self.pos += 1;
            let operand = self.parse_unary()?;
            return Ok(match op {
                "-" => Node::Unary(UnaryOp::Neg, Box::new(operand)),
                "!" => Node::Unary(UnaryOp::Not, Box::new(operand)),
                _ => operand,
            });
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> Result<Node, String> {
        let base = self.parse_primary()?;
        if self.peek_op(&["^"]).is_some() {
            self.pos += 1;
            let exponent = self.parse_unary()?;
            return Ok(Node::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Node::Const(v)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    return self.parse_call(&name);
                }
                self.resolve(&name)
            }
            Some(token) => Err(format!("unexpected token {:?}", token)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Node, String> {
        let (function, arity) = Function::lookup(&name.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown function '{}'", name))?;
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
        } else {
            loop {
                args.push(self.parse_or()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    _ => return Err(format!("malformed arguments of '{}'", name)),
                }
            }
        }
        if args.len() != arity {
            return Err(format!(
                "'{}' takes {} argument(s), got {}",
                name,
                arity,
                args.len()
            ));
        }
        Ok(Node::Call(function, args))
    }

    fn resolve(&self, name: &str) -> Result<Node, String> {
        if let Ok(index) = self.bands.index_of(name) {
            return Ok(Node::Band(index));
        }
        let matches: Vec<usize> = self
            .bands
            .names()
            .iter()
            .enumerate()
            .filter(|(_, band)| band.eq_ignore_ascii_case(name))
            .map(|(i, _)| i)
            .collect();
        if let [index] = matches.as_slice() {
            return Ok(Node::Band(*index));
        }
        match name.to_ascii_lowercase().as_str() {
            "pi" => Ok(Node::Const(std::f64::consts::PI)),
            "e" => Ok(Node::Const(std::f64::consts::E)),
            "nan" => Ok(Node::Const(f64::NAN)),
            _ => Err(format!(
                "unknown band '{}' (available: {})",
                name,
                self.bands.names().join(", ")
            )),
        }
    }
}

/// A compiled per-cell expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse `source`, resolving band names against `bands`.
    pub fn compile(source: &str, bands: &BandCollection) -> ConstructionResult<Self> {
        let fail = |reason: String| ConstructionError::Expression {
            expression: source.to_string(),
            reason,
        };
        let tokens = tokenize(source).map_err(fail)?;
        if tokens.is_empty() {
            return Err(fail("expression is empty".to_string()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            bands,
        };
        let root = parser.parse_or().map_err(fail)?;
        if let Some(token) = parser.peek() {
            return Err(fail(format!("unexpected trailing token {:?}", token)));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }
}

impl PixelEvaluator for Expression {
    fn evaluate(&self, values: &[f64]) -> f64 {
        self.root.eval(values)
    }

    fn referenced_bands(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.root.collect_bands(&mut out);
        out
    }

    fn source(&self) -> &str {
        &self.source
    }
}

/// Interpret an evaluated predicate: `true` only for non-zero, non-NaN values.
pub fn passes(value: f64) -> bool {
    truth(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bands() -> BandCollection {
        BandCollection::from_names(&["B04", "B08", "a.B1"]).unwrap()
    }

    fn eval(src: &str, values: &[f64]) -> f64 {
        Expression::compile(src, &bands()).unwrap().evaluate(values)
    }

    #[test]
    fn test_ndvi() {
        let v = eval("(B08 - B04) / (B08 + B04)", &[1.0, 3.0, 0.0]);
        assert!((v - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("1 + 2 * 3 ^ 2", &[0.0; 3]), 19.0);
        assert_eq!(eval("-2 ^ 2", &[0.0; 3]), -4.0);
        assert_eq!(eval("(1 + 2) * 3", &[0.0; 3]), 9.0);
        assert_eq!(eval("2 ^ -1", &[0.0; 3]), 0.5);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("B04 > 10", &[5.0, 0.0, 0.0]), 0.0);
        assert_eq!(eval("B04 > 1 and B08 <= 3", &[5.0, 3.0, 0.0]), 1.0);
        assert_eq!(eval("B04 < 1 || !(B08 == 2)", &[5.0, 3.0, 0.0]), 1.0);
        assert_eq!(eval("a.B1 != 0", &[0.0, 0.0, 2.0]), 1.0);
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("sqrt(abs(-16))", &[0.0; 3]), 4.0);
        assert_eq!(eval("max(B04, B08)", &[1.0, 2.0, 0.0]), 2.0);
        assert_eq!(eval("iif(B04 > 0, 10, 20)", &[1.0, 0.0, 0.0]), 10.0);
        assert_eq!(eval("1.5e2", &[0.0; 3]), 150.0);
    }

    #[test]
    fn test_nan_propagates() {
        let missing = [f64::NAN, 0.0, 0.0];
        assert!(eval("B04 + 1", &missing).is_nan());
        assert!(!passes(eval("B04 > 1", &missing)));
        for src in ["B04 != 5", "B04 == B04", "B04 < 1", "!(B04 >= 1)", "B04 > 1 and B08 == 0"] {
            assert!(eval(src, &missing).is_nan(), "{}", src);
        }
        assert_eq!(eval("B04 > 1 and B08 > 1", &missing), 0.0);
        assert_eq!(eval("isnan(B04) or B04 > 5", &missing), 1.0);
        assert!(eval("B04 > 5 or B08 > 1", &missing).is_nan());
        assert_eq!(eval("B04 > 5 or B08 > 1", &[6.0, 0.0, 0.0]), 1.0);
    }

    #[test]
    fn test_case_insensitive_fallback() {
        let expr = Expression::compile("b04 * 2", &bands()).unwrap();
        assert_eq!(expr.referenced_bands(), vec![0]);
    }

    #[test]
    fn test_construction_errors() {
        for src in ["B99 + 1", "1 +", "sqrt(1, 2)", "(1 + 2", "", "1 $ 2", "foo(1)"] {
            assert!(
                matches!(
                    Expression::compile(src, &bands()),
                    Err(ConstructionError::Expression { .. })
                ),
                "{}",
                src
            );
        }
    }
}
