//! Expression evaluation.
//!
//! Expressions appear in guards, variable initializers, action payloads,
//! match cases and timeout delays. They are parsed once when a description
//! is built and evaluated against an [`Extent`](crate::Extent) at run time.
//!
//! The language supports:
//!
//! - literals: `42`, `1.5`, `"text"`, `'text'`, `true`, `false`, `null`, `[1, 2]`
//! - variables: `counter`, `$status` (event data), `order.total` (member access)
//! - arithmetic: `+ - * / %` (`+` concatenates when either side is a string)
//! - comparison: `== != < <= > >=`
//! - logic: `! && ||`
//! - `(expr)` for grouping
//!
//! Precedence from lowest to highest: `||`, `&&`, `== !=`, `< <= > >=`,
//! `+ -`, `* / %`, unary `! -`.
//!
//! Referencing an undefined variable is an evaluation error; accessing a
//! missing member of a defined object yields `null`.

use crate::error::CoreError;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;

/// Source of variable values during evaluation.
pub trait VariableLookup {
    /// Returns the value bound to `name`, if any. Errors are reserved for
    /// failing backends.
    fn lookup(&self, name: &str) -> Result<Option<Value>, CoreError>;
}

impl VariableLookup for serde_json::Map<String, Value> {
    fn lookup(&self, name: &str) -> Result<Option<Value>, CoreError> {
        Ok(self.get(name).cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Variable { root: String, path: Vec<String> },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parses an expression from source text.
    pub fn parse(source: &str) -> Result<Self, CoreError> {
        let trimmed = source.trim();
        let invalid = |reason: String| CoreError::InvalidExpression {
            expression: source.to_string(),
            reason,
        };

        if trimmed.is_empty() {
            return Err(invalid("empty expression".to_string()));
        }

        let mut parser = Parser::new(trimmed);
        let ast = parser.parse_expr().map_err(invalid)?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(invalid(format!(
                "unexpected input at offset {}: '{}'",
                parser.pos,
                parser.rest()
            )));
        }

        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    /// Wraps a constant value.
    pub fn literal(value: Value) -> Self {
        Self {
            source: value.to_string(),
            ast: Expr::Literal(value),
        }
    }

    /// Builds an expression from a description value: strings are parsed as
    /// expressions, every other JSON value is taken literally.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        match value {
            Value::String(source) => Self::parse(source),
            other => Ok(Self::literal(other.clone())),
        }
    }

    /// Returns the source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns true if the expression is a constant.
    pub fn is_literal(&self) -> bool {
        matches!(self.ast, Expr::Literal(_))
    }

    /// Evaluates the expression.
    pub fn evaluate<L: VariableLookup + ?Sized>(&self, vars: &L) -> Result<Value, CoreError> {
        eval(&self.ast, vars).map_err(|reason| CoreError::Evaluation {
            expression: self.source.clone(),
            reason,
        })
    }

    /// Evaluates the expression, requiring a boolean result.
    pub fn evaluate_bool<L: VariableLookup + ?Sized>(&self, vars: &L) -> Result<bool, CoreError> {
        match self.evaluate(vars)? {
            Value::Bool(b) => Ok(b),
            other => Err(CoreError::Evaluation {
                expression: self.source.clone(),
                reason: format!("expected a boolean, got {}", type_name(&other)),
            }),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval<L: VariableLookup + ?Sized>(expr: &Expr, vars: &L) -> Result<Value, String> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, vars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Variable { root, path } => {
            let mut current = vars
                .lookup(root)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("variable '{}' is not defined", root))?;
            for member in path {
                current = match current {
                    Value::Object(mut map) => map.remove(member).unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            }
            Ok(current)
        }
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!is_truthy(&eval(inner, vars)?))),
        Expr::Unary(UnaryOp::Neg, inner) => negate(eval(inner, vars)?),
        Expr::Binary(BinaryOp::And, left, right) => {
            if !is_truthy(&eval(left, vars)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(right, vars)?)))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if is_truthy(&eval(left, vars)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(right, vars)?)))
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, vars)?;
            let right = eval(right, vars)?;
            apply(*op, &left, &right)
        }
    }
}

fn apply(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, String> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, left, right),
        BinaryOp::Add if left.is_string() || right.is_string() => Ok(Value::String(format!(
            "{}{}",
            display(left),
            display(right)
        ))),
        BinaryOp::And => Ok(Value::Bool(is_truthy(left) && is_truthy(right))),
        BinaryOp::Or => Ok(Value::Bool(is_truthy(left) || is_truthy(right))),
        _ => arithmetic(op, left, right),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, String> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
    .ok_or_else(|| {
        format!(
            "cannot compare {} with {} using '{}'",
            type_name(left),
            type_name(right),
            op.symbol()
        )
    })?;

    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(Value::Bool(result))
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, String> {
    let (a, b) = match (left, right) {
        (Value::Number(a), Value::Number(b)) => (a, b),
        _ => {
            return Err(format!(
                "operator '{}' expects numbers, got {} and {}",
                op.symbol(),
                type_name(left),
                type_name(right)
            ))
        }
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinaryOp::Div | BinaryOp::Rem if y == 0 => return Err("division by zero".to_string()),
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div => x.checked_div(y),
            BinaryOp::Rem => x.checked_rem(y),
            _ => return Err(format!("operator '{}' is not arithmetic", op.symbol())),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| format!("integer overflow in '{}'", op.symbol()));
    }

    let (x, y) = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err("number is not representable as f64".to_string()),
    };
    let result = match op {
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => return Err("division by zero".to_string()),
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        BinaryOp::Rem => x % y,
        _ => return Err(format!("operator '{}' is not arithmetic", op.symbol())),
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".to_string())
}

fn negate(value: Value) -> Result<Value, String> {
    match &value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| "integer overflow in '-'".to_string());
            }
            n.as_f64()
                .and_then(|f| Number::from_f64(-f))
                .map(Value::Number)
                .ok_or_else(|| "result is not a finite number".to_string())
        }
        other => Err(format!("cannot negate {}", type_name(other))),
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Returns a short name for the JSON type of `value`.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Truthiness used by `!`, `&&` and `||`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Structural equality where numbers compare by value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b) == Some(Ordering::Equal),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Recursive descent parser for expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_equality()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;

        loop {
            self.skip_whitespace();
            let op = if self.peek_str("==") {
                BinaryOp::Eq
            } else if self.peek_str("!=") {
                BinaryOp::Ne
            } else {
                break;
            };
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;

        loop {
            self.skip_whitespace();
            // Two-character operators first
            let (op, len) = if self.peek_str("<=") {
                (BinaryOp::Le, 2)
            } else if self.peek_str(">=") {
                (BinaryOp::Ge, 2)
            } else if self.peek_char() == Some('<') {
                (BinaryOp::Lt, 1)
            } else if self.peek_char() == Some('>') {
                (BinaryOp::Gt, 1)
            } else {
                break;
            };
            self.pos += len;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        let op = match self.peek_char() {
            Some('!') => UnaryOp::Not,
            Some('-') => UnaryOp::Neg,
            _ => return self.parse_primary(),
        };
        self.pos += 1;
        let inner = self.parse_unary()?; // Recursive to allow !!a
        Ok(Expr::Unary(op, Box::new(inner)))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(format!("expected ')' at offset {}", self.pos));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('[') => self.parse_array(),
            Some(quote @ ('"' | '\'')) => self.parse_string(quote).map(Expr::Literal),
            Some(c) if c.is_ascii_digit() => self.parse_number().map(Expr::Literal),
            Some(c) if is_ident_start(c) => self.parse_identifier(),
            Some(c) => Err(format!("unexpected character '{}' at offset {}", c, self.pos)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_array(&mut self) -> Result<Expr, String> {
        self.pos += 1;
        let mut items = Vec::new();

        self.skip_whitespace();
        if self.peek_char() == Some(']') {
            self.pos += 1;
            return Ok(Expr::Array(items));
        }

        loop {
            items.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(']') => {
                    self.pos += 1;
                    return Ok(Expr::Array(items));
                }
                _ => return Err(format!("expected ',' or ']' at offset {}", self.pos)),
            }
        }
    }

    fn parse_string(&mut self, quote: char) -> Result<Value, String> {
        self.pos += 1;
        let mut out = String::new();

        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(Value::String(out));
            }
            if c == '\\' {
                let escaped = self
                    .peek_char()
                    .ok_or_else(|| "unterminated string".to_string())?;
                self.pos += escaped.len_utf8();
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            } else {
                out.push(c);
            }
        }

        Err("unterminated string".to_string())
    }

    fn parse_number(&mut self) -> Result<Value, String> {
        let start = self.pos;
        let mut is_float = false;

        self.consume_digits();

        // Optional decimal part
        if self.peek_char() == Some('.')
            && self.input[self.pos + 1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            self.pos += 1;
            self.consume_digits();
        }

        // Optional exponent
        if matches!(self.peek_char(), Some('e' | 'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek_char(), Some('+' | '-')) {
                self.pos += 1;
            }
            self.consume_digits();
        }

        let num_str = &self.input[start..self.pos];
        if !is_float {
            if let Ok(i) = num_str.parse::<i64>() {
                return Ok(Value::from(i));
            }
        }

        num_str
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("invalid number: '{}'", num_str))
    }

    fn parse_identifier(&mut self) -> Result<Expr, String> {
        let root = self.consume_ident();

        if self.peek_char() != Some('.') {
            match root.as_str() {
                "true" => return Ok(Expr::Literal(Value::Bool(true))),
                "false" => return Ok(Expr::Literal(Value::Bool(false))),
                "null" => return Ok(Expr::Literal(Value::Null)),
                _ => {}
            }
        }

        let mut path = Vec::new();
        while self.peek_char() == Some('.') {
            self.pos += 1;
            let member = self.consume_ident();
            if member.is_empty() {
                return Err(format!("expected member name at offset {}", self.pos));
            }
            path.push(member);
        }

        Ok(Expr::Variable { root, path })
    }

    fn consume_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_string()
    }

    fn consume_digits(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn eval_str(source: &str, value: Value) -> Result<Value, CoreError> {
        Expression::parse(source)?.evaluate(&vars(value))
    }

    #[test]
    fn test_literals() {
        let empty = json!({});
        assert_eq!(eval_str("42", empty.clone()).unwrap(), json!(42));
        assert_eq!(eval_str("1.5", empty.clone()).unwrap(), json!(1.5));
        assert_eq!(eval_str("\"hi\"", empty.clone()).unwrap(), json!("hi"));
        assert_eq!(eval_str("'it\\'s'", empty.clone()).unwrap(), json!("it's"));
        assert_eq!(eval_str("true", empty.clone()).unwrap(), json!(true));
        assert_eq!(eval_str("null", empty.clone()).unwrap(), Value::Null);
        assert_eq!(eval_str("[1, 'a', [] ]", empty).unwrap(), json!([1, "a", []]));
    }

    #[test]
    fn test_precedence() {
        let empty = json!({});
        assert_eq!(eval_str("1 + 2 * 3", empty.clone()).unwrap(), json!(7));
        assert_eq!(eval_str("(1 + 2) * 3", empty.clone()).unwrap(), json!(9));
        assert_eq!(eval_str("10 - 4 - 3", empty.clone()).unwrap(), json!(3));
        assert_eq!(
            eval_str("1 < 2 == 2 < 3", empty.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(
            eval_str("false && false || true", empty.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(eval_str("-2 * 3", empty).unwrap(), json!(-6));
    }

    #[test]
    fn test_variables_and_members() {
        let ctx = json!({"v": 5, "$data": {"id": "x"}, "order": {"total": 12.5}});
        assert_eq!(eval_str("v + 1", ctx.clone()).unwrap(), json!(6));
        assert_eq!(eval_str("$data.id", ctx.clone()).unwrap(), json!("x"));
        assert_eq!(eval_str("order.total > 10", ctx.clone()).unwrap(), json!(true));
        assert_eq!(eval_str("order.missing", ctx).unwrap(), Value::Null);
    }

    #[test]
    fn test_undefined_variable_is_error() {
        let err = eval_str("missing + 1", json!({})).unwrap_err();
        assert!(matches!(err, CoreError::Evaluation { .. }));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_integer_and_float_arithmetic() {
        let empty = json!({});
        assert_eq!(eval_str("7 / 2", empty.clone()).unwrap(), json!(3));
        assert_eq!(eval_str("7 % 4", empty.clone()).unwrap(), json!(3));
        assert_eq!(eval_str("7.0 / 2", empty.clone()).unwrap(), json!(3.5));
        assert!(eval_str("1 / 0", empty.clone()).is_err());
        assert!(eval_str("1.0 / 0", empty.clone()).is_err());
        assert!(eval_str("9223372036854775807 + 1", empty).is_err());
    }

    #[test]
    fn test_string_concatenation() {
        let ctx = json!({"name": "csm", "n": 3});
        assert_eq!(eval_str("'hello ' + name", ctx.clone()).unwrap(), json!("hello csm"));
        assert_eq!(eval_str("name + n", ctx).unwrap(), json!("csm3"));
    }

    #[test]
    fn test_equality_is_structural() {
        let empty = json!({});
        assert_eq!(eval_str("1 == 1.0", empty.clone()).unwrap(), json!(true));
        assert_eq!(eval_str("[1, 2] == [1, 2]", empty.clone()).unwrap(), json!(true));
        assert_eq!(eval_str("'1' == 1", empty.clone()).unwrap(), json!(false));
        assert_eq!(eval_str("null != false", empty).unwrap(), json!(true));
    }

    #[test]
    fn test_comparison_type_mismatch() {
        assert!(eval_str("'a' < 1", json!({})).is_err());
        assert_eq!(eval_str("'a' < 'b'", json!({})).unwrap(), json!(true));
    }

    #[test]
    fn test_logical_short_circuit() {
        // The right side would fail if evaluated
        assert_eq!(eval_str("false && missing", json!({})).unwrap(), json!(false));
        assert_eq!(eval_str("true || missing", json!({})).unwrap(), json!(true));
        assert_eq!(eval_str("!0", json!({})).unwrap(), json!(true));
    }

    #[test]
    fn test_evaluate_bool() {
        let ctx = vars(json!({"v": 3}));
        assert!(Expression::parse("v >= 3").unwrap().evaluate_bool(&ctx).unwrap());
        assert!(Expression::parse("v").unwrap().evaluate_bool(&ctx).is_err());
    }

    #[test]
    fn test_parse_errors() {
        for source in ["", "1 +", "(1", "[1, 2", "'open", "a..b", "1 2", "#"] {
            assert!(
                matches!(
                    Expression::parse(source),
                    Err(CoreError::InvalidExpression { .. })
                ),
                "expected parse error for {:?}",
                source
            );
        }
    }

    #[test]
    fn test_from_value() {
        let expr = Expression::from_value(&json!(10)).unwrap();
        assert!(expr.is_literal());
        assert_eq!(expr.evaluate(&vars(json!({}))).unwrap(), json!(10));

        let expr = Expression::from_value(&json!("v * 2")).unwrap();
        assert!(!expr.is_literal());
        assert_eq!(expr.evaluate(&vars(json!({"v": 4}))).unwrap(), json!(8));
        assert_eq!(expr.to_string(), "v * 2");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn integer_addition_matches_checked_add(a in any::<i32>(), b in any::<i32>()) {
                let ctx = vars(json!({"a": a, "b": b}));
                let result = Expression::parse("a + b").unwrap().evaluate(&ctx).unwrap();
                prop_assert_eq!(result, json!(a as i64 + b as i64));
            }

            #[test]
            fn comparisons_agree_with_ordering(a in any::<i64>(), b in any::<i64>()) {
                let ctx = vars(json!({"a": a, "b": b}));
                let lt = Expression::parse("a < b").unwrap().evaluate_bool(&ctx).unwrap();
                let ge = Expression::parse("a >= b").unwrap().evaluate_bool(&ctx).unwrap();
                prop_assert_eq!(lt, a < b);
                prop_assert_eq!(ge, !lt);
            }
        }
    }
}
