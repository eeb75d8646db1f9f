//! Canonical page identifiers.
//!
//! Agents pass page ids as strings, integers, floats and occasionally quoted
//! strings. Everything is folded into one [`PageId`] at the entry point so
//! that `3`, `3.0`, `"3"`, `"3.0"` and `"'3'"` all name the same page.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical, string-typed page identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(String);

impl PageId {
    /// Canonicalize a raw string. Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(integral_part(trimmed).unwrap_or(trimmed).to_string()))
        }
    }

    /// Canonicalize any JSON value. `null`, blank strings, arrays and objects
    /// mean "no id supplied".
    pub fn canonicalize(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self(i.to_string()))
                } else if let Some(u) = n.as_u64() {
                    Some(Self(u.to_string()))
                } else {
                    n.as_f64().map(Self::from_float)
                }
            }
            Value::Bool(b) => Some(Self(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Id for a numeric allocation.
    pub fn from_number(n: u64) -> Self {
        Self(n.to_string())
    }

    fn from_float(f: f64) -> Self {
        if f.fract() == 0.0 && f.abs() < 9.0e15 {
            Self(format!("{}", f as i64))
        } else {
            Self(f.to_string())
        }
    }

    /// Numeric value when the id consists only of ASCII digits.
    pub fn as_number(&self) -> Option<u64> {
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            self.0.parse().ok()
        } else {
            None
        }
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `"12"` for `"12.00"`; `None` for anything but digits with a zero fraction.
fn integral_part(raw: &str) -> Option<&str> {
    let (int, frac) = raw.split_once('.')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    (digits(int) && digits(frac) && frac.bytes().all(|b| b == b'0')).then_some(int)
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Page id as it arrives in tool arguments.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct PageIdInput(Value);

impl PageIdInput {
    /// Canonical id, or `None` when the caller supplied nothing usable.
    pub fn resolve(&self) -> Option<PageId> {
        let id = PageId::canonicalize(&self.0);
        if id.is_none() && matches!(self.0, Value::Array(_) | Value::Object(_)) {
            tracing::warn!(raw = %self.0, "ignoring page id with unsupported shape");
        }
        id
    }
}

impl From<Value> for PageIdInput {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_and_strings_agree() {
        let a = PageId::canonicalize(&json!(3)).unwrap();
        let b = PageId::canonicalize(&json!("3")).unwrap();
        let c = PageId::canonicalize(&json!(3.0)).unwrap();
        let d = PageId::canonicalize(&json!(" '3' ")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
        assert_eq!(a.as_str(), "3");
    }

    #[test]
    fn integral_float_strings_match_integral_floats() {
        let number = PageId::canonicalize(&json!(3.0)).unwrap();
        assert_eq!(PageId::canonicalize(&json!("3.0")).unwrap(), number);
        assert_eq!(PageId::parse("'3.00'").unwrap(), number);
        assert_eq!(PageId::parse("3.5").unwrap().as_str(), "3.5");
        assert_eq!(PageId::parse("v3.0").unwrap().as_str(), "v3.0");
        assert_eq!(PageId::parse("3.").unwrap().as_str(), "3.");
    }

    #[test]
    fn blank_and_structured_values_are_absent() {
        assert!(PageId::canonicalize(&json!(null)).is_none());
        assert!(PageId::canonicalize(&json!("  ")).is_none());
        assert!(PageId::canonicalize(&json!("\"\"")).is_none());
        assert!(PageId::canonicalize(&json!([1])).is_none());
        assert!(PageId::canonicalize(&json!({"id": 1})).is_none());
    }

    #[test]
    fn numeric_detection() {
        assert_eq!(PageId::parse("42").unwrap().as_number(), Some(42));
        assert_eq!(PageId::parse("tab-1").unwrap().as_number(), None);
        assert_eq!(PageId::parse("-1").unwrap().as_number(), None);
        assert_eq!(PageId::canonicalize(&json!(2.5)).unwrap().as_str(), "2.5");
    }

    #[test]
    fn input_deserializes_from_any_primitive() {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            page_id: PageIdInput,
        }
        let args: Args = serde_json::from_value(json!({"page_id": 7})).unwrap();
        assert_eq!(args.page_id.resolve(), PageId::parse("7"));
        let args: Args = serde_json::from_value(json!({})).unwrap();
        assert_eq!(args.page_id.resolve(), None);
    }
}
