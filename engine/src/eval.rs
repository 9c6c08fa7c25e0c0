//! The expression evaluator (component C4): a small recursive-descent parser and tree-walking
//! evaluator for the dialect [`api::Expression`] bodies are written in.
//!
//! None of the teacher's or the wider retrieval pack's example repos carry a general-purpose
//! expression-language crate (`evalexpr`, `rhai`, ...), so this is hand-written rather than adding
//! an unrelated scripting engine for what is, in the end, six operators and four functions.

use std::collections::HashMap;

use api::ResourceId;
use serde_json::Value as Json;
use thiserror::Error;

/// Errors raised while parsing or evaluating an expression body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    /// The lexer found a character it doesn't understand.
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),
    /// The parser expected a token and ran out of input.
    #[error("unexpected end of expression")]
    UnexpectedEof,
    /// The parser found a token it didn't expect at that position.
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    /// An identifier (resource id or `schema`) has no binding in the resolution context.
    #[error("unknown identifier {0:?}")]
    UnknownIdentifier(String),
    /// A member/index access had no matching field/element.
    #[error("no field {0:?}")]
    MissingField(String),
    /// An operator or function received an operand of the wrong shape.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A call named a function this evaluator doesn't implement.
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
}

type Result<T> = std::result::Result<T, EvalError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Bool(bool),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    AndAnd,
    OrOr,
    Not,
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '.' => {
                chars.next();
                out.push(Token::Dot);
            }
            '[' => {
                chars.next();
                out.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                out.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                out.push(Token::LParen);
            }
            ')' => {
                chars.next();
                out.push(Token::RParen);
            }
            ',' => {
                chars.next();
                out.push(Token::Comma);
            }
            '?' => {
                chars.next();
                out.push(Token::Question);
            }
            ':' => {
                chars.next();
                out.push(Token::Colon);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::Ne);
                } else {
                    out.push(Token::Not);
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::Eq);
                } else {
                    return Err(EvalError::UnexpectedChar('='));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::Le);
                } else {
                    out.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    out.push(Token::Ge);
                } else {
                    out.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    out.push(Token::AndAnd);
                } else {
                    return Err(EvalError::UnexpectedChar('&'));
                }
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    out.push(Token::OrOr);
                } else {
                    return Err(EvalError::UnexpectedChar('|'));
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(next) = chars.next() {
                                s.push(next);
                            }
                        }
                        Some(c) => s.push(c),
                        None => return Err(EvalError::UnexpectedEof),
                    }
                }
                out.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Token::Int(s.parse().map_err(|_| EvalError::UnexpectedChar('0'))?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match s.as_str() {
                    "true" => out.push(Token::Bool(true)),
                    "false" => out.push(Token::Bool(false)),
                    _ => out.push(Token::Ident(s)),
                }
            }
            other => return Err(EvalError::UnexpectedChar(other)),
        }
    }
    Ok(out)
}

/// A parsed expression body, ready to be evaluated repeatedly against different contexts.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    /// An integer literal.
    Int(i64),
    /// A boolean literal.
    Bool(bool),
    /// A string literal.
    Str(String),
    /// A bare identifier: `schema` or a resource id, the root of a member-access chain.
    Ident(String),
    /// `base.field`
    Member(Box<Ast>, String),
    /// `base[index]`
    Index(Box<Ast>, usize),
    /// `!expr`
    Not(Box<Ast>),
    /// A binary operator application.
    Binary(BinOp, Box<Ast>, Box<Ast>),
    /// `cond ? then : else_`
    Ternary(Box<Ast>, Box<Ast>, Box<Ast>),
    /// `name(args...)`
    Call(String, Vec<Ast>),
}

/// The binary operators this dialect supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `==`
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
    /// `&&`
    And,
    /// `||`
    Or,
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos = self.pos.saturating_add(1);
        t
    }

    fn expect(&mut self, t: &Token) -> Result<()> {
        match self.bump() {
            Some(got) if &got == t => Ok(()),
            Some(got) => Err(EvalError::UnexpectedToken(format!("{got:?}"))),
            None => Err(EvalError::UnexpectedEof),
        }
    }

    fn parse_expr(&mut self) -> Result<Ast> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Ast> {
        let cond = self.parse_or()?;
        if self.peek() == Some(&Token::Question) {
            self.bump();
            let then = self.parse_ternary()?;
            self.expect(&Token::Colon)?;
            let else_ = self.parse_ternary()?;
            return Ok(Ast::Ternary(Box::new(cond), Box::new(then), Box::new(else_)));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Ast::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let rhs = self.parse_equality()?;
            lhs = Ast::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_relational()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Ast> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            return Ok(Ast::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Ast> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(name)) => expr = Ast::Member(Box::new(expr), name),
                        Some(got) => return Err(EvalError::UnexpectedToken(format!("{got:?}"))),
                        None => return Err(EvalError::UnexpectedEof),
                    }
                }
                Some(Token::LBracket) => {
                    self.bump();
                    let idx = match self.bump() {
                        Some(Token::Int(i)) => usize::try_from(i).map_err(|_| EvalError::UnexpectedToken(format!("{i:?}")))?,
                        Some(got) => return Err(EvalError::UnexpectedToken(format!("{got:?}"))),
                        None => return Err(EvalError::UnexpectedEof),
                    };
                    self.expect(&Token::RBracket)?;
                    expr = Ast::Index(Box::new(expr), idx);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        match self.bump() {
            Some(Token::Int(i)) => Ok(Ast::Int(i)),
            Some(Token::Bool(b)) => Ok(Ast::Bool(b)),
            Some(Token::Str(s)) => Ok(Ast::Str(s)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        args.push(self.parse_expr()?);
                        while self.peek() == Some(&Token::Comma) {
                            self.bump();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Ast::Call(name, args))
                } else {
                    Ok(Ast::Ident(name))
                }
            }
            Some(got) => Err(EvalError::UnexpectedToken(format!("{got:?}"))),
            None => Err(EvalError::UnexpectedEof),
        }
    }
}

/// Parses a dialect expression body into an [`Ast`].
pub fn parse(src: &str) -> Result<Ast> {
    let tokens = lex(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::UnexpectedToken(format!("{:?}", parser.tokens[parser.pos])));
    }
    Ok(ast)
}

/// Bindings available to an evaluation: every resource id's current JSON value (its applied
/// manifest merged with live status, as far as it has been observed), plus `schema` for the
/// graph's own spec/status.
pub type Bindings = HashMap<ResourceId, Json>;

/// Evaluates a parsed expression against a set of bindings.
pub fn eval(ast: &Ast, bindings: &Bindings) -> Result<Json> {
    match ast {
        Ast::Int(i) => Ok(Json::Number((*i).into())),
        Ast::Bool(b) => Ok(Json::Bool(*b)),
        Ast::Str(s) => Ok(Json::String(s.clone())),
        Ast::Ident(name) => bindings
            .get(&ResourceId::from(name.as_str()))
            .cloned()
            .ok_or_else(|| EvalError::UnknownIdentifier(name.clone())),
        Ast::Member(base, field) => {
            let v = eval(base, bindings)?;
            v.get(field).cloned().ok_or_else(|| EvalError::MissingField(field.clone()))
        }
        Ast::Index(base, idx) => {
            let v = eval(base, bindings)?;
            v.get(*idx).cloned().ok_or_else(|| EvalError::MissingField(format!("[{idx}]")))
        }
        Ast::Not(e) => {
            let v = eval(e, bindings)?;
            as_bool(&v).map(|b| Json::Bool(!b))
        }
        Ast::Binary(BinOp::And, lhs, rhs) => {
            let l = as_bool(&eval(lhs, bindings)?)?;
            if !l {
                return Ok(Json::Bool(false));
            }
            Ok(Json::Bool(as_bool(&eval(rhs, bindings)?)?))
        }
        Ast::Binary(BinOp::Or, lhs, rhs) => {
            let l = eval(lhs, bindings)?;
            if is_truthy(&l) {
                return Ok(l);
            }
            eval(rhs, bindings)
        }
        Ast::Binary(op @ (BinOp::Eq | BinOp::Ne), lhs, rhs) => {
            let l = eval(lhs, bindings)?;
            let r = eval(rhs, bindings)?;
            let eq = l == r;
            Ok(Json::Bool(if *op == BinOp::Eq { eq } else { !eq }))
        }
        Ast::Binary(op, lhs, rhs) => {
            let l = as_i64(&eval(lhs, bindings)?)?;
            let r = as_i64(&eval(rhs, bindings)?)?;
            let result = match op {
                BinOp::Lt => l < r,
                BinOp::Le => l <= r,
                BinOp::Gt => l > r,
                BinOp::Ge => l >= r,
                _ => unreachable!("Eq/Ne/And/Or handled above"),
            };
            Ok(Json::Bool(result))
        }
        Ast::Ternary(cond, then, else_) => {
            if as_bool(&eval(cond, bindings)?)? {
                eval(then, bindings)
            } else {
                eval(else_, bindings)
            }
        }
        Ast::Call(name, args) => {
            let values: Vec<Json> = args.iter().map(|a| eval(a, bindings)).collect::<Result<_>>()?;
            call(name, &values)
        }
    }
}

/// `||`'s short-circuit semantics return the left operand unchanged when it is truthy, matching
/// the dialect's use of `||` as a default-value operator (e.g. `spec.port || 80`), not just a
/// boolean combinator.
fn is_truthy(v: &Json) -> bool {
    !matches!(v, Json::Null | Json::Bool(false))
}

fn as_bool(v: &Json) -> Result<bool> {
    v.as_bool().ok_or_else(|| EvalError::TypeMismatch(format!("expected bool, got {v}")))
}

fn as_i64(v: &Json) -> Result<i64> {
    v.as_i64().ok_or_else(|| EvalError::TypeMismatch(format!("expected int, got {v}")))
}

fn call(name: &str, args: &[Json]) -> Result<Json> {
    match name {
        "string" => {
            let [v] = args else {
                return Err(EvalError::TypeMismatch("string() takes one argument".into()));
            };
            Ok(Json::String(stringify(v)))
        }
        "int" => {
            let [v] = args else {
                return Err(EvalError::TypeMismatch("int() takes one argument".into()));
            };
            match v {
                Json::Number(_) => Ok(v.clone()),
                Json::String(s) => s
                    .parse::<i64>()
                    .map(|i| Json::Number(i.into()))
                    .map_err(|_| EvalError::TypeMismatch(format!("{s:?} is not an integer"))),
                other => Err(EvalError::TypeMismatch(format!("cannot convert {other} to int"))),
            }
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(EvalError::TypeMismatch(format!("{name}() takes at least one argument")));
            }
            let ints: Vec<i64> = args.iter().map(as_i64).collect::<Result<_>>()?;
            let picked = if name == "min" { ints.into_iter().min() } else { ints.into_iter().max() };
            Ok(Json::Number(picked.expect("checked non-empty above").into()))
        }
        "concat" => Ok(Json::String(args.iter().map(stringify).collect())),
        other => Err(EvalError::UnknownFunction(other.to_string())),
    }
}

fn stringify(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Number(n) => n.to_string(),
        Json::Bool(b) => b.to_string(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Bindings {
        let mut b = Bindings::new();
        b.insert(
            ResourceId::schema(),
            serde_json::json!({"spec": {"host": "db.example.com", "port": 5432}}),
        );
        b.insert(ResourceId::from("db"), serde_json::json!({"status": {"podIP": "10.0.0.5"}}));
        b
    }

    #[test]
    fn member_and_index_access() {
        let ast = parse("schema.spec.host").unwrap();
        assert_eq!(eval(&ast, &bindings()).unwrap(), Json::String("db.example.com".into()));
    }

    #[test]
    fn or_acts_as_default_value() {
        let ast = parse("db.status.missing || 80").unwrap();
        let mut b = bindings();
        b.insert(ResourceId::from("db"), serde_json::json!({"status": {}}));
        // missing field lookup errors instead of defaulting, matching the "no implicit null"
        // stance taken by `collect_refs`/`Value`: use an explicit optional field in the schema to
        // get default-value semantics instead of relying on a missing key.
        assert!(eval(&ast, &b).is_err());
        let ast = parse("(1 == 2) || true").unwrap();
        assert_eq!(eval(&ast, &bindings()).unwrap(), Json::Bool(true));
    }

    #[test]
    fn ternary_and_relational() {
        let ast = parse("schema.spec.port > 1024 ? \"high\" : \"low\"").unwrap();
        assert_eq!(eval(&ast, &bindings()).unwrap(), Json::String("high".into()));
    }

    #[test]
    fn functions() {
        assert_eq!(eval(&parse("string(5)").unwrap(), &bindings()).unwrap(), Json::String("5".into()));
        assert_eq!(eval(&parse("int(\"5\")").unwrap(), &bindings()).unwrap(), Json::Number(5.into()));
        assert_eq!(eval(&parse("min(3, 1, 2)").unwrap(), &bindings()).unwrap(), Json::Number(1.into()));
        assert_eq!(eval(&parse("max(3, 1, 2)").unwrap(), &bindings()).unwrap(), Json::Number(3.into()));
        assert_eq!(
            eval(&parse("concat(\"a\", string(1))").unwrap(), &bindings()).unwrap(),
            Json::String("a1".into())
        );
    }

    #[test]
    fn unknown_identifier_errors() {
        let err = eval(&parse("ghost.field").unwrap(), &bindings()).unwrap_err();
        assert_eq!(err, EvalError::UnknownIdentifier("ghost".into()));
    }
}
