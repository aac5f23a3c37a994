use crate::error::{EngineError, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

/// Comparison operator in an edge condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Predicate on an upstream node's output.
///
/// Supported forms:
/// - `output` / `output.field.0` (truthiness)
/// - `output <op> <literal>` with `==`, `!=`, `>`, `<`, `>=`, `<=`
///
/// Literals are JSON (`"x"`, `3`, `true`, `null`); an unquoted word is read
/// as a string.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    path: Vec<String>,
    comparison: Option<(Comparison, Value)>,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self> {
        let source = expression.trim();
        if source.is_empty() {
            return Err(EngineError::validation("empty edge condition"));
        }

        let (left, comparison) = match find_operator(source) {
            Some((pos, op, width)) => {
                let left = source[..pos].trim();
                let right = source[pos + width..].trim();
                if right.is_empty() {
                    return Err(EngineError::validation(format!(
                        "condition '{}' has no right-hand side",
                        source
                    )));
                }
                (left, Some((op, parse_literal(right))))
            }
            None => (source, None),
        };

        let path = parse_path(left).ok_or_else(|| {
            EngineError::validation(format!(
                "condition '{}' must start with 'output'",
                source
            ))
        })?;

        Ok(Self {
            source: source.to_string(),
            path,
            comparison,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against the upstream output. Missing paths resolve to null.
    pub fn evaluate(&self, output: &Value) -> bool {
        let resolved = resolve(output, &self.path).unwrap_or(&Value::Null);

        match &self.comparison {
            None => is_truthy(resolved),
            Some((op, literal)) => compare(resolved, *op, literal),
        }
    }
}

impl FromStr for Condition {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Locate the first operator outside a quoted string
fn find_operator(source: &str) -> Option<(usize, Comparison, usize)> {
    let bytes = source.as_bytes();
    let mut in_quote = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'"' && (i == 0 || bytes[i - 1] != b'\\') {
            in_quote = !in_quote;
        } else if !in_quote {
            let next = bytes.get(i + 1).copied();
            let found = match (c, next) {
                (b'=', Some(b'=')) => Some((Comparison::Eq, 2)),
                (b'!', Some(b'=')) => Some((Comparison::Ne, 2)),
                (b'>', Some(b'=')) => Some((Comparison::Ge, 2)),
                (b'<', Some(b'=')) => Some((Comparison::Le, 2)),
                (b'>', _) => Some((Comparison::Gt, 1)),
                (b'<', _) => Some((Comparison::Lt, 1)),
                _ => None,
            };
            if let Some((op, width)) = found {
                return Some((i, op, width));
            }
        }
        i += 1;
    }

    None
}

fn parse_path(left: &str) -> Option<Vec<String>> {
    let mut segments = left.split('.');
    if segments.next()? != "output" {
        return None;
    }
    let rest: Vec<String> = segments.map(|s| s.trim().to_string()).collect();
    if rest.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(rest)
}

fn parse_literal(right: &str) -> Value {
    serde_json::from_str(right).unwrap_or_else(|_| Value::String(right.to_string()))
}

/// Walk a dotted path; numeric segments index into arrays
pub(crate) fn resolve<'a, S: AsRef<str>>(value: &'a Value, path: &[S]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| {
        let segment = segment.as_ref();
        match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(left: &Value, op: Comparison, right: &Value) -> bool {
    // Numbers compare numerically so that 3 == 3.0
    let ordering = match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => Some(l.cmp(r)),
            _ => None,
        },
    };

    match op {
        Comparison::Eq => ordering.map_or(left == right, |o| o == Ordering::Equal),
        Comparison::Ne => ordering.map_or(left != right, |o| o != Ordering::Equal),
        Comparison::Gt => ordering == Some(Ordering::Greater),
        Comparison::Lt => ordering == Some(Ordering::Less),
        Comparison::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        Comparison::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_equality() {
        let is_x = Condition::parse(r#"output == "x""#).unwrap();
        let is_y = Condition::parse(r#"output == "y""#).unwrap();

        assert!(is_x.evaluate(&json!("x")));
        assert!(!is_y.evaluate(&json!("x")));
    }

    #[test]
    fn test_nested_path_and_numbers() {
        let cond = Condition::parse("output.score >= 0.5").unwrap();
        assert!(cond.evaluate(&json!({"score": 0.75})));
        assert!(!cond.evaluate(&json!({"score": 0.25})));
        assert!(!cond.evaluate(&json!({})));

        let exact = Condition::parse("output.count == 3").unwrap();
        assert!(exact.evaluate(&json!({"count": 3.0})));

        let indexed = Condition::parse(r#"output.items.1 != "b""#).unwrap();
        assert!(!indexed.evaluate(&json!({"items": ["a", "b"]})));
    }

    #[test]
    fn test_truthiness() {
        let cond = Condition::parse("output.done").unwrap();
        assert!(cond.evaluate(&json!({"done": true})));
        assert!(!cond.evaluate(&json!({"done": false})));
        assert!(!cond.evaluate(&json!({"other": 1})));
    }

    #[test]
    fn test_operator_inside_string_literal() {
        let cond = Condition::parse(r#"output == "a>b""#).unwrap();
        assert!(cond.evaluate(&json!("a>b")));
    }

    #[test]
    fn test_unquoted_word_is_string() {
        let cond = Condition::parse("output.state == ready").unwrap();
        assert!(cond.evaluate(&json!({"state": "ready"})));
    }

    #[test]
    fn test_invalid_conditions() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("result == 1").is_err());
        assert!(Condition::parse("output ==").is_err());
        assert!(Condition::parse("output..x").is_err());
    }
}
