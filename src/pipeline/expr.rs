//! Filter condition language.
//!
//! Conditions are compiled once at config-load time; a parse failure is
//! fatal before any mail-store session opens. At evaluation time a
//! condition is bound against namespaces (`message` plus any prefetch
//! namespaces) and produces a [`Value`]. Only an exact boolean `true`
//! counts as a match; absent fields and runtime type errors never do.
//!
//! Grammar:
//! - literals: `"string"`, integers, `true`/`false`
//! - dotted paths: `message.from`, `pull_request.author`
//! - operators: `==` `!=` `in` `!`/`not` `&&`/`and` `||`/`or`, parentheses
//! - functions: `contains(haystack, needle)` and `matches(path, "regex")`,
//!   whose regex is compiled together with the condition

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

// ── Values ──────────────────────────────────────────────────────────

/// A value produced by evaluating an expression or bound in a namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<Value>),
    /// A missing namespace or field. Propagates through operators and
    /// never satisfies a match.
    Absent,
}

impl Value {
    /// Short type label for error messages.
    fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Absent => "absent",
        }
    }

    pub fn str_list(items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::List(items.into_iter().map(|s| Value::Str(s.into())).collect())
    }
}

/// A named bag of fields exposed to conditions (e.g. `message`).
pub type Namespace = HashMap<String, Value>;

/// Evaluation environment: the namespaces a condition may reference.
#[derive(Debug, Default)]
pub struct EvalContext {
    namespaces: HashMap<String, Namespace>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a namespace. Re-binding a name replaces the previous bag.
    pub fn bind(&mut self, name: impl Into<String>, namespace: Namespace) {
        self.namespaces.insert(name.into(), namespace);
    }

    /// Look up a dotted path. Unknown namespaces and fields are Absent.
    fn lookup(&self, path: &[String]) -> Value {
        match path {
            [ns, field] => self
                .namespaces
                .get(ns)
                .and_then(|bag| bag.get(field))
                .cloned()
                .unwrap_or(Value::Absent),
            _ => Value::Absent,
        }
    }
}

/// Runtime evaluation failure (type mismatch). Recovered by the caller:
/// logged and treated as non-match.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EvalError(String);

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

// ── Tokens ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Int(i64),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    EqEq,
    NotEq,
    Bang,
    AndAnd,
    OrOr,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Ident(s) => write!(f, "{s}"),
            Self::Dot => write!(f, "."),
            Self::Comma => write!(f, ","),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::EqEq => write!(f, "=="),
            Self::NotEq => write!(f, "!="),
            Self::Bang => write!(f, "!"),
            Self::AndAnd => write!(f, "&&"),
            Self::OrOr => write!(f, "||"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => s.push(escaped),
                            None => return Err("unterminated string literal".into()),
                        },
                        Some(c) => s.push(c),
                        None => return Err("unterminated string literal".into()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: i64 = digits
                    .parse()
                    .map_err(|_| format!("integer literal {digits:?} out of range"))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    return Err("single '=' is not an operator (use '==')".into());
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::AndAnd);
                } else {
                    return Err("single '&' is not an operator (use '&&')".into());
                }
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::OrOr);
                } else {
                    return Err("single '|' is not an operator (use '||')".into());
                }
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }

    Ok(tokens)
}

// ── AST ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
    Contains(Box<Expr>, Box<Expr>),
    Matches(Box<Expr>, Regex),
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

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected}, found {token}")),
            None => Err(format!("expected {expected}, found end of input")),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        loop {
            match self.peek() {
                Some(Token::OrOr) => {
                    self.next();
                }
                Some(Token::Ident(name)) if name == "or" => {
                    self.next();
                }
                _ => break,
            }
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;
        loop {
            match self.peek() {
                Some(Token::AndAnd) => {
                    self.next();
                }
                Some(Token::Ident(name)) if name == "and" => {
                    self.next();
                }
                _ => break,
            }
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_unary()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.next();
                let right = self.parse_unary()?;
                Ok(Expr::Eq(Box::new(left), Box::new(right)))
            }
            Some(Token::NotEq) => {
                self.next();
                let right = self.parse_unary()?;
                Ok(Expr::Ne(Box::new(left), Box::new(right)))
            }
            Some(Token::Ident(name)) if name == "in" => {
                self.next();
                let right = self.parse_unary()?;
                Ok(Expr::In(Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Bang) => {
                self.next();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Ident(name)) if name == "not" => {
                self.next();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(n))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "contains" => {
                    self.expect(&Token::LParen)?;
                    let haystack = self.parse_or()?;
                    self.expect(&Token::Comma)?;
                    let needle = self.parse_or()?;
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Contains(Box::new(haystack), Box::new(needle)))
                }
                "matches" => {
                    self.expect(&Token::LParen)?;
                    let subject = self.parse_or()?;
                    self.expect(&Token::Comma)?;
                    let pattern = match self.next() {
                        Some(Token::Str(p)) => p,
                        Some(token) => {
                            return Err(format!(
                                "matches() requires a string literal pattern, found {token}"
                            ))
                        }
                        None => return Err("matches() requires a pattern".into()),
                    };
                    self.expect(&Token::RParen)?;
                    let regex = Regex::new(&pattern)
                        .map_err(|e| format!("invalid regex in matches(): {e}"))?;
                    Ok(Expr::Matches(Box::new(subject), regex))
                }
                _ => {
                    let mut path = vec![name];
                    while self.peek() == Some(&Token::Dot) {
                        self.next();
                        match self.next() {
                            Some(Token::Ident(field)) => path.push(field),
                            Some(token) => {
                                return Err(format!("expected field after '.', found {token}"))
                            }
                            None => return Err("expected field after '.'".into()),
                        }
                    }
                    Ok(Expr::Path(path))
                }
            },
            Some(token) => Err(format!("unexpected token {token}")),
            None => Err("unexpected end of input".into()),
        }
    }
}

// ── Compiled condition ──────────────────────────────────────────────

/// A boolean condition compiled from its source text.
#[derive(Debug)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Compile a condition. Errors here are configuration errors.
    pub fn compile(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty condition".into());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!(
                "trailing input after expression: {}",
                parser.tokens[parser.pos]
            ));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The original condition text, for logging.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the given namespaces.
    pub fn evaluate(&self, ctx: &EvalContext) -> Result<Value, EvalError> {
        eval(&self.expr, ctx)
    }

    /// True only when evaluation yields exactly `Bool(true)`.
    pub fn is_match(&self, ctx: &EvalContext) -> Result<bool, EvalError> {
        Ok(self.evaluate(ctx)? == Value::Bool(true))
    }
}

fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(ctx.lookup(path)),
        Expr::Not(inner) => match eval(inner, ctx)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            Value::Absent => Ok(Value::Absent),
            other => Err(EvalError::new(format!("cannot negate {}", other.kind()))),
        },
        Expr::And(left, right) => match eval(left, ctx)? {
            Value::Bool(false) => Ok(Value::Bool(false)),
            Value::Bool(true) => bool_operand(eval(right, ctx)?, "&&"),
            Value::Absent => match bool_operand(eval(right, ctx)?, "&&")? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                _ => Ok(Value::Absent),
            },
            other => Err(EvalError::new(format!(
                "left operand of && is {}, expected bool",
                other.kind()
            ))),
        },
        Expr::Or(left, right) => match eval(left, ctx)? {
            Value::Bool(true) => Ok(Value::Bool(true)),
            Value::Bool(false) => bool_operand(eval(right, ctx)?, "||"),
            Value::Absent => match bool_operand(eval(right, ctx)?, "||")? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                _ => Ok(Value::Absent),
            },
            other => Err(EvalError::new(format!(
                "left operand of || is {}, expected bool",
                other.kind()
            ))),
        },
        Expr::Eq(left, right) => compare(eval(left, ctx)?, eval(right, ctx)?, false),
        Expr::Ne(left, right) => compare(eval(left, ctx)?, eval(right, ctx)?, true),
        Expr::In(needle, haystack) => {
            let needle = eval(needle, ctx)?;
            let haystack = eval(haystack, ctx)?;
            membership(needle, haystack, "in")
        }
        Expr::Contains(haystack, needle) => {
            let haystack = eval(haystack, ctx)?;
            let needle = eval(needle, ctx)?;
            membership(needle, haystack, "contains")
        }
        Expr::Matches(subject, regex) => match eval(subject, ctx)? {
            Value::Str(s) => Ok(Value::Bool(regex.is_match(&s))),
            Value::List(items) => Ok(Value::Bool(items.iter().any(|item| match item {
                Value::Str(s) => regex.is_match(s),
                _ => false,
            }))),
            Value::Absent => Ok(Value::Absent),
            other => Err(EvalError::new(format!(
                "matches() requires a string or list, got {}",
                other.kind()
            ))),
        },
    }
}

fn bool_operand(value: Value, op: &str) -> Result<Value, EvalError> {
    match value {
        Value::Bool(_) | Value::Absent => Ok(value),
        other => Err(EvalError::new(format!(
            "operand of {op} is {}, expected bool",
            other.kind()
        ))),
    }
}

fn compare(left: Value, right: Value, negate: bool) -> Result<Value, EvalError> {
    if left == Value::Absent || right == Value::Absent {
        return Ok(Value::Absent);
    }
    let equal = match (&left, &right) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => a == b,
        _ => {
            return Err(EvalError::new(format!(
                "cannot compare {} with {}",
                left.kind(),
                right.kind()
            )))
        }
    };
    Ok(Value::Bool(equal ^ negate))
}

/// `needle in haystack` / `contains(haystack, needle)`. A list haystack
/// checks element equality, a string haystack checks substring.
fn membership(needle: Value, haystack: Value, op: &str) -> Result<Value, EvalError> {
    if needle == Value::Absent || haystack == Value::Absent {
        return Ok(Value::Absent);
    }
    match haystack {
        Value::List(items) => Ok(Value::Bool(items.contains(&needle))),
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(Value::Bool(s.contains(&sub))),
            other => Err(EvalError::new(format!(
                "{op} on a string requires a string, got {}",
                other.kind()
            ))),
        },
        other => Err(EvalError::new(format!(
            "{op} requires a list or string, got {}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_ctx() -> EvalContext {
        let mut ctx = EvalContext::new();
        let mut ns = Namespace::new();
        ns.insert(
            "from".into(),
            Value::str_list(["a@x.com", "b@y.org"]),
        );
        ns.insert("subject".into(), Value::Str("Build failed".into()));
        ns.insert(
            "body".into(),
            Value::Str("see https://ci.example.com/run/1".into()),
        );
        ctx.bind("message", ns);
        ctx
    }

    #[test]
    fn compiles_membership_condition() {
        let cond = Condition::compile(r#""a@x.com" in message.from"#).unwrap();
        assert!(cond.is_match(&message_ctx()).unwrap());
    }

    #[test]
    fn membership_miss_is_false_not_error() {
        let cond = Condition::compile(r#""z@z.com" in message.from"#).unwrap();
        assert!(!cond.is_match(&message_ctx()).unwrap());
    }

    #[test]
    fn substring_in_string() {
        let cond = Condition::compile(r#""ci.example.com" in message.body"#).unwrap();
        assert!(cond.is_match(&message_ctx()).unwrap());
    }

    #[test]
    fn equality_and_boolean_operators() {
        let cond = Condition::compile(
            r#"message.subject == "Build failed" && !("q@q.com" in message.from)"#,
        )
        .unwrap();
        assert!(cond.is_match(&message_ctx()).unwrap());
    }

    #[test]
    fn word_operators_parse() {
        let cond =
            Condition::compile(r#"message.subject == "Build failed" or false"#).unwrap();
        assert!(cond.is_match(&message_ctx()).unwrap());
        let cond = Condition::compile(r#"not false and true"#).unwrap();
        assert!(cond.is_match(&EvalContext::new()).unwrap());
    }

    #[test]
    fn contains_function() {
        let cond = Condition::compile(r#"contains(message.subject, "failed")"#).unwrap();
        assert!(cond.is_match(&message_ctx()).unwrap());
        let cond = Condition::compile(r#"contains(message.from, "a@x.com")"#).unwrap();
        assert!(cond.is_match(&message_ctx()).unwrap());
    }

    #[test]
    fn matches_function_compiled_regex() {
        let cond = Condition::compile(r#"matches(message.body, "https://[a-z.]+/run/\\d+")"#)
            .unwrap();
        assert!(cond.is_match(&message_ctx()).unwrap());
    }

    #[test]
    fn invalid_regex_fails_compile() {
        assert!(Condition::compile(r#"matches(message.body, "(unclosed")"#).is_err());
    }

    #[test]
    fn parse_errors() {
        assert!(Condition::compile("").is_err());
        assert!(Condition::compile(r#"message.subject = "x""#).is_err());
        assert!(Condition::compile(r#""a" in"#).is_err());
        assert!(Condition::compile(r#"(true"#).is_err());
        assert!(Condition::compile(r#"true true"#).is_err());
    }

    #[test]
    fn absent_namespace_is_not_a_match() {
        let cond = Condition::compile(r#"pull_request.author == "alice""#).unwrap();
        // pull_request namespace not bound → Absent → non-match, no error.
        assert!(!cond.is_match(&message_ctx()).unwrap());
    }

    #[test]
    fn absent_propagates_through_boolean_operators() {
        let ctx = message_ctx();
        let cond =
            Condition::compile(r#"pull_request.author == "alice" && true"#).unwrap();
        assert!(!cond.is_match(&ctx).unwrap());
        // A definite false on the other side still yields false.
        let cond =
            Condition::compile(r#"pull_request.author == "alice" || true"#).unwrap();
        assert!(cond.is_match(&ctx).unwrap());
    }

    #[test]
    fn non_boolean_result_is_not_a_match() {
        let cond = Condition::compile(r#"message.subject"#).unwrap();
        assert!(!cond.is_match(&message_ctx()).unwrap());
    }

    #[test]
    fn type_mismatch_is_an_eval_error() {
        let cond = Condition::compile(r#"message.subject == 3"#).unwrap();
        assert!(cond.is_match(&message_ctx()).is_err());
        let cond = Condition::compile(r#"3 in message.subject"#).unwrap();
        assert!(cond.is_match(&message_ctx()).is_err());
    }

    #[test]
    fn integer_comparison() {
        let mut ctx = EvalContext::new();
        let mut ns = Namespace::new();
        ns.insert("number".into(), Value::Int(42));
        ctx.bind("pull_request", ns);
        let cond = Condition::compile("pull_request.number == 42").unwrap();
        assert!(cond.is_match(&ctx).unwrap());
        let cond = Condition::compile("pull_request.number != 42").unwrap();
        assert!(!cond.is_match(&ctx).unwrap());
    }

    #[test]
    fn string_escapes() {
        let cond = Condition::compile(r#""say \"hi\"" in message.subject"#).unwrap();
        let mut ctx = EvalContext::new();
        let mut ns = Namespace::new();
        ns.insert("subject".into(), Value::Str(r#"please say "hi" now"#.into()));
        ctx.bind("message", ns);
        assert!(cond.is_match(&ctx).unwrap());
    }
}
