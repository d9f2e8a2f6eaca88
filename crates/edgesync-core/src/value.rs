//! Attribute value types.

use serde::{Deserialize, Serialize, Serializer};

use crate::error::ModelError;

/// Scalar element type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// `true` / `false`
    Boolean,
    /// Signed 64-bit integer
    Integer,
    /// 64-bit float
    Number,
    /// UTF-8 string
    String,
}

/// Declared type of an attribute: a scalar or a fixed-length array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    /// Single value
    Scalar(ScalarType),
    /// Array of exactly `len` elements
    Array {
        /// Element type
        element: ScalarType,
        /// Fixed length
        len: usize,
    },
}

impl AttributeType {
    /// Boolean scalar.
    pub const BOOLEAN: Self = Self::Scalar(ScalarType::Boolean);
    /// Integer scalar.
    pub const INTEGER: Self = Self::Scalar(ScalarType::Integer);
    /// Number scalar.
    pub const NUMBER: Self = Self::Scalar(ScalarType::Number);
    /// String scalar.
    pub const STRING: Self = Self::Scalar(ScalarType::String);

    /// Fixed-length array of `element`.
    #[must_use]
    pub fn array(element: ScalarType, len: usize) -> Self {
        Self::Array { element, len }
    }

    /// Name used on the wire.
    #[must_use]
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Scalar(ScalarType::Boolean) => "Boolean",
            Self::Scalar(ScalarType::Integer) => "Integer",
            Self::Scalar(ScalarType::Number) => "Number",
            Self::Scalar(ScalarType::String) => "String",
            Self::Array { element: ScalarType::Boolean, .. } => "BooleanArray",
            Self::Array { element: ScalarType::Integer, .. } => "IntegerArray",
            Self::Array { element: ScalarType::Number, .. } => "NumberArray",
            Self::Array { element: ScalarType::String, .. } => "StringArray",
        }
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(_) => f.write_str(self.wire_name()),
            Self::Array { len, .. } => write!(f, "{}[{len}]", self.wire_name()),
        }
    }
}

impl Serialize for AttributeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.wire_name())
    }
}

/// A typed attribute value.
///
/// Deserialization is untagged: the shape of the input picks the variant, and
/// [`Value::coerce`] then fits it to the declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean scalar
    Boolean(bool),
    /// Integer scalar
    Integer(i64),
    /// Number scalar
    Number(f64),
    /// String scalar
    String(String),
    /// Boolean array
    BooleanArray(Vec<bool>),
    /// Integer array
    IntegerArray(Vec<i64>),
    /// Number array
    NumberArray(Vec<f64>),
    /// String array
    StringArray(Vec<String>),
}

impl Value {
    /// Name of this value's shape, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> String {
        match self {
            Self::Boolean(_) => "Boolean".into(),
            Self::Integer(_) => "Integer".into(),
            Self::Number(_) => "Number".into(),
            Self::String(_) => "String".into(),
            Self::BooleanArray(v) => format!("BooleanArray[{}]", v.len()),
            Self::IntegerArray(v) => format!("IntegerArray[{}]", v.len()),
            Self::NumberArray(v) => format!("NumberArray[{}]", v.len()),
            Self::StringArray(v) => format!("StringArray[{}]", v.len()),
        }
    }

    /// Fit this value to `ty`.
    ///
    /// Integers widen to numbers; array lengths must match exactly.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::TypeMismatch`] if the value cannot represent `ty`.
    #[allow(clippy::cast_precision_loss)]
    pub fn coerce(self, ty: AttributeType) -> Result<Self, ModelError> {
        let mismatch = |value: &Self| ModelError::TypeMismatch {
            expected: ty.to_string(),
            found: value.kind(),
        };
        match (ty, self) {
            (AttributeType::Scalar(ScalarType::Boolean), v @ Self::Boolean(_))
            | (AttributeType::Scalar(ScalarType::Integer), v @ Self::Integer(_))
            | (AttributeType::Scalar(ScalarType::Number), v @ Self::Number(_))
            | (AttributeType::Scalar(ScalarType::String), v @ Self::String(_)) => Ok(v),
            (AttributeType::Scalar(ScalarType::Number), Self::Integer(i)) => {
                Ok(Self::Number(i as f64))
            }
            (AttributeType::Array { element, len }, value) => {
                let value = match (element, value) {
                    (_, Self::BooleanArray(v)) if v.is_empty() => empty_array(element),
                    (ScalarType::Number, Self::IntegerArray(v)) => {
                        Self::NumberArray(v.into_iter().map(|i| i as f64).collect())
                    }
                    (_, value) => value,
                };
                let fits = match (&value, element) {
                    (Self::BooleanArray(v), ScalarType::Boolean) => v.len() == len,
                    (Self::IntegerArray(v), ScalarType::Integer) => v.len() == len,
                    (Self::NumberArray(v), ScalarType::Number) => v.len() == len,
                    (Self::StringArray(v), ScalarType::String) => v.len() == len,
                    _ => false,
                };
                if fits {
                    Ok(value)
                } else {
                    Err(mismatch(&value))
                }
            }
            (_, value) => Err(mismatch(&value)),
        }
    }

    /// Parse a string into a value of type `ty`.
    ///
    /// Booleans accept `true`/`false` in any case, integers accept decimal or
    /// `0x` hexadecimal, arrays are JSON array literals.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Parse`] on malformed input, or
    /// [`ModelError::TypeMismatch`] for an array of the wrong length.
    pub fn parse(input: &str, ty: AttributeType) -> Result<Self, ModelError> {
        let parse_error = || ModelError::Parse {
            input: input.to_string(),
            expected: ty.to_string(),
        };
        let trimmed = input.trim();
        match ty {
            AttributeType::Scalar(ScalarType::Boolean) => {
                if trimmed.eq_ignore_ascii_case("true") {
                    Ok(Self::Boolean(true))
                } else if trimmed.eq_ignore_ascii_case("false") {
                    Ok(Self::Boolean(false))
                } else {
                    Err(parse_error())
                }
            }
            AttributeType::Scalar(ScalarType::Integer) => parse_integer(trimmed)
                .map(Self::Integer)
                .ok_or_else(parse_error),
            AttributeType::Scalar(ScalarType::Number) => trimmed
                .parse::<f64>()
                .map(Self::Number)
                .map_err(|_| parse_error()),
            AttributeType::Scalar(ScalarType::String) => Ok(Self::String(input.to_string())),
            AttributeType::Array { .. } => serde_json::from_str::<Self>(trimmed)
                .map_err(|_| parse_error())?
                .coerce(ty),
        }
    }
}

fn empty_array(element: ScalarType) -> Value {
    match element {
        ScalarType::Boolean => Value::BooleanArray(Vec::new()),
        ScalarType::Integer => Value::IntegerArray(Vec::new()),
        ScalarType::Number => Value::NumberArray(Vec::new()),
        ScalarType::String => Value::StringArray(Vec::new()),
    }
}

fn parse_integer(input: &str) -> Option<i64> {
    let (negative, unsigned) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input.strip_prefix('+').unwrap_or(input)),
    };
    let (radix, digits) = match unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        Some(hex) => (16, hex),
        None => (10, unsigned),
    };
    // from_str_radix accepts its own sign; only bare digits may follow ours.
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = u64::from_str_radix(digits, radix).ok()?;
    if negative {
        0_i64.checked_sub_unsigned(magnitude)
    } else {
        i64::try_from(magnitude).ok()
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Self::BooleanArray(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Self::IntegerArray(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::NumberArray(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Self::StringArray(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_widens_to_number() {
        let v = Value::Integer(3).coerce(AttributeType::NUMBER).unwrap();
        assert_eq!(v, Value::Number(3.0));
        assert!(Value::Number(3.0).coerce(AttributeType::INTEGER).is_err());
    }

    #[test]
    fn array_length_is_enforced() {
        let ty = AttributeType::array(ScalarType::Number, 3);
        assert!(Value::from(vec![1.0, 2.0, 3.0]).coerce(ty).is_ok());
        assert!(matches!(
            Value::from(vec![1.0, 2.0]).coerce(ty),
            Err(ModelError::TypeMismatch { .. })
        ));
        assert_eq!(
            Value::IntegerArray(vec![1, 2, 3]).coerce(ty).unwrap(),
            Value::NumberArray(vec![1.0, 2.0, 3.0])
        );
    }

    #[test]
    fn parse_scalars() {
        assert_eq!(
            Value::parse("TRUE", AttributeType::BOOLEAN).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            Value::parse("0x1F", AttributeType::INTEGER).unwrap(),
            Value::Integer(31)
        );
        assert_eq!(
            Value::parse("-42", AttributeType::INTEGER).unwrap(),
            Value::Integer(-42)
        );
        assert_eq!(
            Value::parse("21.5", AttributeType::NUMBER).unwrap(),
            Value::Number(21.5)
        );
        assert_eq!(
            Value::parse(" spaced ", AttributeType::STRING).unwrap(),
            Value::String(" spaced ".into())
        );
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(matches!(
            Value::parse("yes", AttributeType::BOOLEAN),
            Err(ModelError::Parse { .. })
        ));
        assert!(matches!(
            Value::parse("12abc", AttributeType::INTEGER),
            Err(ModelError::Parse { .. })
        ));
        assert!(matches!(
            Value::parse("[1, 2", AttributeType::array(ScalarType::Integer, 2)),
            Err(ModelError::Parse { .. })
        ));
    }

    #[test]
    fn parse_integer_signs_and_bounds() {
        assert_eq!(
            Value::parse("-9223372036854775808", AttributeType::INTEGER).unwrap(),
            Value::Integer(i64::MIN)
        );
        assert_eq!(
            Value::parse("+0x10", AttributeType::INTEGER).unwrap(),
            Value::Integer(16)
        );
        assert_eq!(
            Value::parse("-0x10", AttributeType::INTEGER).unwrap(),
            Value::Integer(-16)
        );
        for input in [
            "--5",
            "+-5",
            "-+5",
            "0x-5",
            "-0x+5",
            "0x",
            "-",
            "--9223372036854775808",
            "9223372036854775808",
            "-9223372036854775809",
        ] {
            assert!(
                matches!(
                    Value::parse(input, AttributeType::INTEGER),
                    Err(ModelError::Parse { .. })
                ),
                "{input} accepted"
            );
        }
    }

    #[test]
    fn parse_array_literal() {
        let ty = AttributeType::array(ScalarType::String, 2);
        assert_eq!(
            Value::parse(r#"["a", "b"]"#, ty).unwrap(),
            Value::StringArray(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn untagged_deserialization_picks_shape() {
        let v: Value = serde_json::from_str("21").unwrap();
        assert_eq!(v, Value::Integer(21));
        let v: Value = serde_json::from_str("21.5").unwrap();
        assert_eq!(v, Value::Number(21.5));
        let v: Value = serde_json::from_str("[true, false]").unwrap();
        assert_eq!(v, Value::BooleanArray(vec![true, false]));
    }
}
