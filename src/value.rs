use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Filter value after coercion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Textual form used in REST filter parameters (`col=eq.<value>`)
    pub fn to_param(&self) -> String {
        match self {
            Scalar::Null => "null".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_param())
    }
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(b),
            Scalar::Int(n) => Value::Number(n.into()),
            Scalar::Text(s) => Value::String(s),
        }
    }
}

impl TryFrom<&Value> for Scalar {
    type Error = DbError;

    /// Equality filters arrive as JSON. Non-integral numbers keep their textual
    /// form; arrays and objects cannot be compared for equality.
    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Scalar::Null),
            Value::Bool(b) => Ok(Scalar::Bool(*b)),
            Value::Number(n) => Ok(n
                .as_i64()
                .map(Scalar::Int)
                .unwrap_or_else(|| Scalar::Text(n.to_string()))),
            Value::String(s) => Ok(Scalar::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(DbError::Validation(format!(
                "filter value must be null, boolean, number or string, got {}",
                value
            ))),
        }
    }
}

/// Coerce a raw filter token.
///
/// Checked in order: `null` (any case), `true`/`false` (any case), an
/// unsigned all-digit string, otherwise the token unchanged. A consequence is
/// that the text `"NULL"` can never be matched literally, and `"5.5"` stays
/// text because the decimal point fails the digit check. Digit strings that
/// overflow `i64` also stay text.
pub fn coerce(raw: &str) -> Scalar {
    if raw.eq_ignore_ascii_case("null") {
        return Scalar::Null;
    }
    if raw.eq_ignore_ascii_case("true") {
        return Scalar::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Scalar::Bool(false);
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = raw.parse::<i64>() {
            return Scalar::Int(n);
        }
    }
    Scalar::Text(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_null_any_case() {
        assert_eq!(coerce("null"), Scalar::Null);
        assert_eq!(coerce("NULL"), Scalar::Null);
        assert_eq!(coerce("Null"), Scalar::Null);
    }

    #[test]
    fn test_coerce_booleans() {
        assert_eq!(coerce("true"), Scalar::Bool(true));
        assert_eq!(coerce("FALSE"), Scalar::Bool(false));
    }

    #[test]
    fn test_coerce_integers() {
        assert_eq!(coerce("5"), Scalar::Int(5));
        assert_eq!(coerce("007"), Scalar::Int(7));
        // sign and decimal point both break the digit check
        assert_eq!(coerce("-5"), Scalar::Text("-5".to_string()));
        assert_eq!(coerce("5.5"), Scalar::Text("5.5".to_string()));
    }

    #[test]
    fn test_coerce_keeps_text_unmodified() {
        assert_eq!(coerce(" active "), Scalar::Text(" active ".to_string()));
        assert_eq!(coerce(""), Scalar::Text(String::new()));
        assert_eq!(
            coerce("99999999999999999999"),
            Scalar::Text("99999999999999999999".to_string())
        );
    }

    #[test]
    fn test_scalar_from_json() {
        assert_eq!(Scalar::try_from(&json!(3)).unwrap(), Scalar::Int(3));
        assert_eq!(Scalar::try_from(&json!(1.5)).unwrap(), Scalar::Text("1.5".into()));
        assert_eq!(Scalar::try_from(&json!(null)).unwrap(), Scalar::Null);
        assert!(Scalar::try_from(&json!([1, 2])).unwrap_err().is_validation());
    }

    #[test]
    fn test_scalar_param_form() {
        assert_eq!(Scalar::Null.to_param(), "null");
        assert_eq!(Scalar::Bool(true).to_param(), "true");
        assert_eq!(Scalar::Int(42).to_param(), "42");
        assert_eq!(Scalar::Text("a.b".into()).to_param(), "a.b");
    }
}
