//! Value types for ferry-rdbc
//!
//! The replicated tables use a deliberately small set of semantic column
//! types. Every [`Value`] can be coerced into the column type it is written
//! to, so a sink never has to guess how an attribute should be stored.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Semantic column type of a replicated column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Character data
    Text,
    /// 64-bit signed integer
    Integer,
    /// Exact decimal number
    Float,
    /// Boolean
    Boolean,
    /// Raw bytes
    Binary,
    /// Timestamp with time zone
    Timestamp,
    /// Opaque JSON document
    Document,
}

impl ColumnType {
    /// Lowercase name, as used in configuration and logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Binary => "binary",
            Self::Timestamp => "timestamp",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            "boolean" => Ok(Self::Boolean),
            "binary" => Ok(Self::Binary),
            "timestamp" => Ok(Self::Timestamp),
            "document" => Ok(Self::Document),
            other => Err(Error::config(format!("unknown column type: {}", other))),
        }
    }
}

/// A typed value held by a table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int64(i64),
    /// Exact decimal number
    Numeric(Numeric),
    /// Text string
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp with timezone
    DateTimeTz(DateTime<Utc>),
    /// JSON document
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The column type this value naturally maps to (`None` for NULL)
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(ColumnType::Boolean),
            Self::Int64(_) => Some(ColumnType::Integer),
            Self::Numeric(_) => Some(ColumnType::Float),
            Self::String(_) => Some(ColumnType::Text),
            Self::Bytes(_) => Some(ColumnType::Binary),
            Self::DateTimeTz(_) => Some(ColumnType::Timestamp),
            Self::Json(_) => Some(ColumnType::Document),
        }
    }

    /// Try to get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(n) => Some(*n),
            Self::Numeric(n) => n.to_i64(),
            _ => None,
        }
    }

    /// Try to get as an exact number
    pub fn as_numeric(&self) -> Option<Numeric> {
        match self {
            Self::Numeric(n) => Some(n.clone()),
            Self::Int64(n) => Some(Numeric::from(*n)),
            _ => None,
        }
    }

    /// Try to get as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to get as JSON
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(j) => Some(j),
            _ => None,
        }
    }

    /// Render the value as a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int64(n) => serde_json::Value::from(*n),
            Self::Numeric(n) => n.to_json(),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => serde_json::Value::String(hex::encode(b)),
            Self::DateTimeTz(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Self::Json(j) => j.clone(),
        }
    }

    /// Coerce this value into the representation of `target`.
    ///
    /// NULL coerces to every type. Text and document columns accept any value;
    /// the other types accept lossless conversions only.
    pub fn coerce(self, target: ColumnType) -> Result<Value> {
        if self.column_type() == Some(target) || self.is_null() {
            return Ok(self);
        }

        let mismatch = |value: &Value| {
            Error::type_conversion(format!(
                "cannot store {} value in {} column",
                value
                    .column_type()
                    .map(ColumnType::name)
                    .unwrap_or("null"),
                target
            ))
        };

        match target {
            ColumnType::Text => Ok(Value::String(match self {
                Value::Json(serde_json::Value::String(s)) => s,
                Value::Json(j) => j.to_string(),
                Value::Bytes(b) => hex::encode(b),
                Value::DateTimeTz(dt) => dt.to_rfc3339(),
                Value::Numeric(n) => n.into(),
                Value::Int64(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => return Err(mismatch(&other)),
            })),
            ColumnType::Document => Ok(Value::Json(self.to_json())),
            ColumnType::Integer => match &self {
                Value::Numeric(_) => self.as_i64().map(Value::Int64).ok_or_else(|| mismatch(&self)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int64)
                    .map_err(|_| mismatch(&self)),
                _ => Err(mismatch(&self)),
            },
            ColumnType::Float => match &self {
                Value::Int64(n) => Ok(Value::Numeric(Numeric::from(*n))),
                Value::String(s) => Numeric::parse(s).map(Value::Numeric),
                _ => Err(mismatch(&self)),
            },
            ColumnType::Boolean => match &self {
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                _ => Err(mismatch(&self)),
            },
            ColumnType::Binary => match self {
                Value::String(s) => Ok(Value::Bytes(s.into_bytes())),
                other => Err(mismatch(&other)),
            },
            ColumnType::Timestamp => match &self {
                Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| Value::DateTimeTz(dt.with_timezone(&Utc)))
                    .map_err(|_| mismatch(&self)),
                Value::Int64(secs) => DateTime::<Utc>::from_timestamp(*secs, 0)
                    .map(Value::DateTimeTz)
                    .ok_or_else(|| mismatch(&self)),
                _ => Err(mismatch(&self)),
            },
        }
    }

    /// Append a stable, type-tagged byte encoding of the value.
    ///
    /// Equal keys always produce equal bytes; integers and numerically equal
    /// decimals share the canonical decimal text.
    pub fn write_key_bytes(&self, out: &mut Vec<u8>) {
        fn put(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
            out.push(tag);
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }

        match self {
            Self::Null => put(out, 0, &[]),
            Self::Bool(b) => put(out, 1, &[u8::from(*b)]),
            Self::Int64(n) => put(out, 2, n.to_string().as_bytes()),
            Self::Numeric(n) => put(out, 2, n.as_str().as_bytes()),
            Self::String(s) => put(out, 3, s.as_bytes()),
            Self::Bytes(b) => put(out, 4, b),
            Self::DateTimeTz(dt) => put(out, 5, &dt.timestamp_micros().to_le_bytes()),
            Self::Json(j) => put(out, 6, j.to_string().as_bytes()),
        }
    }
}

/// Largest decimal exponent accepted when expanding scientific notation.
///
/// Key-item stores stay within 1e-130..1e126; the bound keeps the expanded
/// text short.
pub const MAX_NUMERIC_EXPONENT: i64 = 1000;

/// An exact decimal number kept as canonical text.
///
/// Source numbers may carry 38 significant digits and exponents well beyond
/// what fixed-width decimal types hold, so they are never narrowed: the text
/// is validated, expanded out of scientific notation and normalized (no
/// leading or trailing zeros, no negative zero). PostgreSQL `NUMERIC` stores
/// every such value exactly.
///
/// ```
/// use ferry_rdbc::types::Numeric;
///
/// assert_eq!(Numeric::parse("1.50E+3").unwrap().as_str(), "1500");
/// assert_eq!(Numeric::parse("-0.0").unwrap().as_str(), "0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Numeric(String);

impl Numeric {
    /// Parse a number written in plain or scientific notation
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let invalid = || Error::type_conversion(format!("invalid number '{}'", text));

        let (negative, unsigned) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let (mantissa, exponent) = match unsigned.find(|c: char| c == 'e' || c == 'E') {
            Some(at) => (
                &unsigned[..at],
                unsigned[at + 1..].parse::<i64>().map_err(|_| invalid())?,
            ),
            None => (unsigned, 0),
        };
        let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !(-MAX_NUMERIC_EXPONENT..=MAX_NUMERIC_EXPONENT).contains(&exponent) {
            return Err(Error::type_conversion(format!(
                "number '{}' is out of range",
                text
            )));
        }

        let digits = format!("{}{}", int_part, frac_part);
        let significant = digits.trim_start_matches('0');
        // digits before the decimal point, counted from the first significant one
        let point = int_part.len() as i64 + exponent - (digits.len() - significant.len()) as i64;
        let significant = significant.trim_end_matches('0');
        if significant.is_empty() {
            return Ok(Self("0".to_string()));
        }

        let mut out = String::with_capacity(significant.len() + 2);
        if negative {
            out.push('-');
        }
        if point <= 0 {
            out.push_str("0.");
            out.extend(std::iter::repeat('0').take(point.unsigned_abs() as usize));
            out.push_str(significant);
        } else {
            let point = point as usize;
            if point >= significant.len() {
                out.push_str(significant);
                out.extend(std::iter::repeat('0').take(point - significant.len()));
            } else {
                out.push_str(&significant[..point]);
                out.push('.');
                out.push_str(&significant[point..]);
            }
        }
        Ok(Self(out))
    }

    /// Canonical decimal text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the value has no fractional digits
    pub fn is_integer(&self) -> bool {
        !self.0.contains('.')
    }

    /// The value as i64, when it is an integer in range
    pub fn to_i64(&self) -> Option<i64> {
        if self.is_integer() {
            self.0.parse().ok()
        } else {
            None
        }
    }

    /// JSON number when JSON can hold it exactly, JSON string otherwise
    pub fn to_json(&self) -> serde_json::Value {
        if let Some(n) = self.to_i64() {
            return serde_json::Value::from(n);
        }
        self.0
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && f.to_string() == self.0)
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(self.0.clone()))
    }

    fn split(&self) -> (bool, &str, &str) {
        let (negative, magnitude) = match self.0.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, self.0.as_str()),
        };
        let (int_part, frac_part) = magnitude.split_once('.').unwrap_or((magnitude, ""));
        (negative, int_part, frac_part)
    }
}

impl Ord for Numeric {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a_neg, a_int, a_frac) = self.split();
        let (b_neg, b_int, b_frac) = other.split();
        let magnitude = a_int
            .len()
            .cmp(&b_int.len())
            .then_with(|| a_int.cmp(b_int))
            .then_with(|| a_frac.cmp(b_frac));
        match (a_neg, b_neg) {
            (false, false) => magnitude,
            (true, true) => magnitude.reverse(),
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
        }
    }
}

impl PartialOrd for Numeric {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Numeric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Numeric {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Numeric> for String {
    fn from(n: Numeric) -> Self {
        n.0
    }
}

impl From<i64> for Numeric {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

impl From<Decimal> for Numeric {
    fn from(d: Decimal) -> Self {
        // normalize() drops trailing zeros and turns -0 into 0
        Self(d.normalize().to_string())
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Bool(a), Self::Bool(b)) => a.partial_cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.partial_cmp(b),
            (Self::String(a), Self::String(b)) => a.partial_cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.partial_cmp(b),
            (Self::DateTimeTz(a), Self::DateTimeTz(b)) => a.partial_cmp(b),
            (a, b) => match (a.as_numeric(), b.as_numeric()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int64(n) => write!(f, "{}", n),
            Self::Numeric(n) => f.write_str(n.as_str()),
            Self::String(s) => f.write_str(s),
            Self::Bytes(b) => write!(f, "\\x{}", hex::encode(b)),
            Self::DateTimeTz(dt) => f.write_str(&dt.to_rfc3339()),
            Self::Json(j) => write!(f, "{}", j),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int64(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<Numeric> for Value {
    fn from(v: Numeric) -> Self {
        Self::Numeric(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Numeric(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}
