//! Decision conditions
//!
//! A condition is evaluated after placeholder substitution. The grammar is
//! deliberately tiny:
//!
//! ```text
//! condition := operand OP operand | text
//! OP        := ">" | "<" | ">=" | "<=" | "==" | "!="
//! ```
//!
//! Operands that both parse as numbers compare numerically, otherwise as
//! strings. Matching single or double quotes around an operand are dropped.
//! Text that is not a comparison is true when non-empty.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::processor::value::parse_numeric;

static COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(.+?)\s*(>=|<=|==|!=|>|<)\s*(.+?)\s*$").expect("comparison pattern is valid")
});

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl Operator {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            ">" => Self::Gt,
            "<" => Self::Lt,
            ">=" => Self::Ge,
            "<=" => Self::Le,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            _ => return None,
        })
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Gt => ordering == Ordering::Greater,
            Self::Lt => ordering == Ordering::Less,
            Self::Ge => ordering != Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
        }
    }
}

/// A parsed condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition<'a> {
    /// `left OP right`
    Compare {
        /// Left operand text
        left: &'a str,
        /// Operator
        op: Operator,
        /// Right operand text
        right: &'a str,
    },
    /// Anything else
    Text(&'a str),
}

impl<'a> Condition<'a> {
    /// Parse a substituted condition string
    pub fn parse(text: &'a str) -> Self {
        let Some(caps) = COMPARISON.captures(text) else {
            return Self::Text(text);
        };
        match (caps.get(1), caps.get(2).and_then(|m| Operator::parse(m.as_str())), caps.get(3)) {
            (Some(left), Some(op), Some(right)) => Self::Compare {
                left: unquote(left.as_str()),
                op,
                right: unquote(right.as_str()),
            },
            _ => Self::Text(text),
        }
    }

    /// Evaluate to a boolean
    pub fn evaluate(&self) -> bool {
        match self {
            Self::Compare { left, op, right } => {
                let ordering = match (parse_numeric(left), parse_numeric(right)) {
                    (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
                    _ => left.cmp(right),
                };
                op.holds(ordering)
            }
            Self::Text(text) => !text.trim().is_empty(),
        }
    }
}

/// Parse and evaluate in one go
pub fn evaluate(text: &str) -> bool {
    Condition::parse(text).evaluate()
}

fn unquote(operand: &str) -> &str {
    let bytes = operand.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(b'"'), Some(b'"')) | (Some(b'\''), Some(b'\'')) if operand.len() >= 2 => {
            &operand[1..operand.len() - 1]
        }
        _ => operand,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10 > 5", true)]
    #[case("10 > 50", false)]
    #[case("10 >= 10", true)]
    #[case("2.5 <= 2", false)]
    #[case("9 < 10", true)]
    #[case("abc == abc", true)]
    #[case("'abc' == \"abc\"", true)]
    #[case("abc != abd", true)]
    #[case("b > a", true)]
    #[case("10 == 10.0", true)]
    #[case("anything", true)]
    #[case("   ", false)]
    #[case("", false)]
    fn test_evaluate(#[case] text: &str, #[case] expected: bool) {
        assert_eq!(evaluate(text), expected);
    }

    #[test]
    fn test_numeric_vs_string_ordering() {
        // numerically 10 > 9, lexically "10" < "9"
        assert!(evaluate("10 > 9"));
        assert!(evaluate("10a < 9a"));
    }

    #[test]
    fn test_parse_compare() {
        assert_eq!(
            Condition::parse("{{x}} >= 3"),
            Condition::Compare {
                left: "{{x}}",
                op: Operator::Ge,
                right: "3"
            }
        );
        assert_eq!(Condition::parse("yes"), Condition::Text("yes"));
    }
}
