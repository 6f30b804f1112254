//! Routing condition DSL.
//!
//! ```text
//! {{path}} OP value [AND|OR {{path}} OP value ...]
//! ```
//!
//! Clauses are combined strictly left to right with no precedence, so
//! `a OR b AND c` means `(a OR b) AND c`. Text that does not parse evaluates
//! to `false`.

use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::template::stringify;
use crate::variables::Lookup;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,
    #[error("unterminated {0}")]
    Unterminated(&'static str),
    #[error("clause must start with a {{{{path}}}} reference")]
    MissingReference,
    #[error("missing operator after {{{{{0}}}}}")]
    MissingOperator(String),
    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(String),
    #[error("operator '{0}' takes no value")]
    UnexpectedValue(String),
    #[error("operator '{0}' needs a value")]
    MissingValue(String),
    #[error("dangling {0}")]
    DanglingJoin(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(String),
    Path(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    Exists,
    NotExists,
    NotEmpty,
    Empty,
    Equals(Operand),
    NotEquals(Operand),
    Contains(Operand),
    Greater(Operand),
    Less(Operand),
    GreaterOrEqual(Operand),
    LessOrEqual(Operand),
    /// `==`: numeric when both sides are numbers, exact text otherwise.
    StrictEquals(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub path: String,
    pub test: Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    And,
    Or,
}

/// A parsed condition: the first clause and every `(join, clause)` after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    first: Clause,
    rest: Vec<(Join, Clause)>,
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }

        let mut groups: Vec<(Option<Join>, Vec<Token>)> = vec![(None, Vec::new())];
        for token in tokens {
            let join = match &token {
                Token::Word(w) if w == "AND" => Some(Join::And),
                Token::Word(w) if w == "OR" => Some(Join::Or),
                _ => None,
            };
            match join {
                Some(join) => groups.push((Some(join), Vec::new())),
                None => {
                    if let Some((_, current)) = groups.last_mut() {
                        current.push(token);
                    }
                }
            }
        }

        let mut clauses = groups.into_iter().map(|(join, tokens)| {
            if tokens.is_empty() {
                let name = match join {
                    Some(Join::And) => "AND",
                    Some(Join::Or) => "OR",
                    None => return Err(ConditionError::MissingReference),
                };
                return Err(ConditionError::DanglingJoin(name.to_string()));
            }
            Ok((join, parse_clause(tokens)?))
        });

        let first = match clauses.next() {
            Some(Ok((_, clause))) => clause,
            Some(Err(e)) => return Err(e),
            None => return Err(ConditionError::Empty),
        };
        let mut rest = Vec::new();
        for item in clauses {
            let (join, clause) = item?;
            rest.push((join.unwrap_or(Join::And), clause));
        }
        Ok(Self { first, rest })
    }

    /// Evaluate every clause and fold strictly left to right.
    pub fn evaluate(&self, vars: &dyn Lookup) -> bool {
        let mut result = self.first.evaluate(vars);
        for (join, clause) in &self.rest {
            let value = clause.evaluate(vars);
            result = match join {
                Join::And => result && value,
                Join::Or => result || value,
            };
        }
        result
    }

    pub fn clauses(&self) -> impl Iterator<Item = &Clause> {
        std::iter::once(&self.first).chain(self.rest.iter().map(|(_, c)| c))
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse and evaluate in one go. Malformed conditions evaluate to `false`.
pub fn evaluate(text: &str, vars: &dyn Lookup) -> bool {
    match Condition::parse(text) {
        Ok(condition) => condition.evaluate(vars),
        Err(e) => {
            warn!(condition = %text, error = %e, "Unparseable condition, treating as false");
            false
        }
    }
}

impl Clause {
    fn evaluate(&self, vars: &dyn Lookup) -> bool {
        let left = vars.lookup(&self.path).filter(|v| !v.is_null());
        match &self.test {
            Test::Exists => left.is_some(),
            Test::NotExists => left.is_none(),
            Test::NotEmpty => is_non_empty(left),
            Test::Empty => !is_non_empty(left),
            Test::Equals(rhs) => loose_equals(left, &rhs.resolve(vars)),
            Test::NotEquals(rhs) => !loose_equals(left, &rhs.resolve(vars)),
            Test::Contains(rhs) => contains(left, &rhs.resolve(vars)),
            Test::Greater(rhs) => compare(left, &rhs.resolve(vars), |a, b| a > b),
            Test::Less(rhs) => compare(left, &rhs.resolve(vars), |a, b| a < b),
            Test::GreaterOrEqual(rhs) => compare(left, &rhs.resolve(vars), |a, b| a >= b),
            Test::LessOrEqual(rhs) => compare(left, &rhs.resolve(vars), |a, b| a <= b),
            Test::StrictEquals(rhs) => {
                let rhs = rhs.resolve(vars);
                match (as_number(left), rhs.trim().parse::<f64>().ok()) {
                    (Some(a), Some(b)) => a == b,
                    _ => stringify(left) == rhs,
                }
            }
        }
    }
}

impl Operand {
    fn resolve(&self, vars: &dyn Lookup) -> String {
        match self {
            Self::Literal(text) => text.clone(),
            Self::Path(path) => stringify(vars.lookup(path)),
        }
    }
}

fn is_non_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Object(_)) => true,
    }
}

fn loose_equals(left: Option<&Value>, right: &str) -> bool {
    stringify(left).trim().to_lowercase() == right.trim().to_lowercase()
}

fn contains(left: Option<&Value>, needle: &str) -> bool {
    let needle = needle.trim().to_lowercase();
    match left {
        None => false,
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| stringify(Some(item)).trim().to_lowercase() == needle),
        Some(other) => stringify(Some(other)).to_lowercase().contains(&needle),
    }
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(left: Option<&Value>, right: &str, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(left), right.trim().parse::<f64>().ok()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

// ── Parsing ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ref(String),
    Quoted(String),
    Word(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut rest = text.trim_start();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("{{") {
            let end = after
                .find("}}")
                .ok_or(ConditionError::Unterminated("{{"))?;
            tokens.push(Token::Ref(after[..end].trim().to_string()));
            rest = &after[end + 2..];
        } else if rest.starts_with('"') || rest.starts_with('\'') {
            let quote = &rest[..1];
            let after = &rest[1..];
            let end = after.find(quote).ok_or(ConditionError::Unterminated("quote"))?;
            tokens.push(Token::Quoted(after[..end].to_string()));
            rest = &after[end + 1..];
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            tokens.push(Token::Word(rest[..end].to_string()));
            rest = &rest[end..];
        }
        rest = rest.trim_start();
    }
    Ok(tokens)
}

fn parse_clause(tokens: Vec<Token>) -> Result<Clause, ConditionError> {
    let mut tokens = tokens.into_iter();
    let path = match tokens.next() {
        Some(Token::Ref(path)) if !path.is_empty() => path,
        _ => return Err(ConditionError::MissingReference),
    };

    let op = match tokens.next() {
        Some(Token::Word(w)) => w,
        Some(_) | None => return Err(ConditionError::MissingOperator(path)),
    };
    let mut remaining: Vec<Token> = tokens.collect();

    // `not exists` is the only two-word operator.
    let op = if op.eq_ignore_ascii_case("not")
        && matches!(remaining.first(), Some(Token::Word(w)) if w.eq_ignore_ascii_case("exists"))
    {
        remaining.remove(0);
        "not_exists".to_string()
    } else {
        op.to_lowercase()
    };

    let has_value = !remaining.is_empty();
    let unary = |test: Test| {
        if !has_value {
            Ok(test)
        } else {
            Err(ConditionError::UnexpectedValue(op.clone()))
        }
    };
    let test = match op.as_str() {
        "exists" => unary(Test::Exists)?,
        "not_exists" => unary(Test::NotExists)?,
        "not_empty" | "is_not_empty" => unary(Test::NotEmpty)?,
        "empty" | "is_empty" => unary(Test::Empty)?,
        _ => {
            let operand = parse_operand(&op, remaining)?;
            match op.as_str() {
                "equals" | "equal" | "eq" => Test::Equals(operand),
                "not_equal" | "not_equals" | "!=" => Test::NotEquals(operand),
                "contains" => Test::Contains(operand),
                ">" | "gt" => Test::Greater(operand),
                "<" | "lt" => Test::Less(operand),
                ">=" | "gte" => Test::GreaterOrEqual(operand),
                "<=" | "lte" => Test::LessOrEqual(operand),
                "==" => Test::StrictEquals(operand),
                other => return Err(ConditionError::UnsupportedOperator(other.to_string())),
            }
        }
    };
    Ok(Clause { path, test })
}

fn parse_operand(op: &str, tokens: Vec<Token>) -> Result<Operand, ConditionError> {
    match tokens.as_slice() {
        [] => Err(ConditionError::MissingValue(op.to_string())),
        [Token::Ref(path)] => Ok(Operand::Path(path.clone())),
        _ => {
            let mut words = Vec::with_capacity(tokens.len());
            for token in tokens {
                match token {
                    Token::Word(w) | Token::Quoted(w) => words.push(w),
                    Token::Ref(_) => {
                        return Err(ConditionError::UnsupportedOperator(format!(
                            "{op} with mixed reference and text"
                        )))
                    }
                }
            }
            Ok(Operand::Literal(words.join(" ")))
        }
    }
}
