//! Field value storage and best-effort coercions.
//!
//! Values move between three worlds: raw tag strings, typed catalog
//! fields, and the embedded expression engine. Conversions never fail
//! loudly; a value that cannot be represented in the requested type is
//! simply dropped by the caller.

use std::fmt;

use jiff::civil::DateTime;

use crate::fields::FieldType;

/// A single typed field value inside a materialized feature.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 32-bit integer.
    Integer(i32),
    /// 64-bit integer.
    Integer64(i64),
    /// Double-precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Civil date and time (no offset; OSM timestamps are UTC).
    DateTime(DateTime),
}

impl FieldValue {
    /// Widen or parse the value into an `i64`, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(i64::from(*v)),
            Self::Integer64(v) => Some(*v),
            #[expect(
                clippy::cast_possible_truncation,
                reason = "narrowing mirrors the engine's lossy numeric coercions"
            )]
            Self::Real(v) => Some(*v as i64),
            Self::Text(v) => v.trim().parse().ok(),
            Self::DateTime(_) => None,
        }
    }

    /// Widen or parse the value into an `f64`, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(f64::from(*v)),
            #[expect(
                clippy::cast_precision_loss,
                reason = "narrowing mirrors the engine's lossy numeric coercions"
            )]
            Self::Integer64(v) => Some(*v as f64),
            Self::Real(v) => Some(*v),
            Self::Text(v) => v.trim().parse().ok(),
            Self::DateTime(_) => None,
        }
    }

    /// Convert into the given catalog type, best effort.
    ///
    /// Returns `None` when no sensible conversion exists; the caller
    /// leaves the target field unset in that case.
    pub fn coerce_to(&self, target: FieldType) -> Option<Self> {
        match target {
            FieldType::Integer => self
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Self::Integer),
            FieldType::Integer64 => self.as_i64().map(Self::Integer64),
            FieldType::Real => self.as_f64().map(Self::Real),
            FieldType::Text => Some(Self::Text(self.to_string())),
            FieldType::DateTime => match self {
                Self::DateTime(v) => Some(Self::DateTime(*v)),
                Self::Text(v) => parse_datetime(v).map(Self::DateTime),
                _ => None,
            },
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Integer64(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::DateTime(v) => write!(f, "{v}"),
        }
    }
}

/// Parse a literal timestamp the way upstream metadata carries them:
/// RFC 3339 with an offset, or a bare civil datetime.
pub(crate) fn parse_datetime(text: &str) -> Option<DateTime> {
    if let Ok(instant) = text.parse::<jiff::Timestamp>() {
        return Some(instant.to_zoned(jiff::tz::TimeZone::UTC).datetime());
    }
    text.parse::<DateTime>().ok()
}

/// Convert a numeric epoch (seconds) into a UTC civil datetime.
pub(crate) fn epoch_to_datetime(seconds: i64) -> Option<DateTime> {
    jiff::Timestamp::from_second(seconds)
        .ok()
        .map(|instant| instant.to_zoned(jiff::tz::TimeZone::UTC).datetime())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FieldValue::Integer(7), Some(7))]
    #[case(FieldValue::Integer64(1 << 40), Some(1 << 40))]
    #[case(FieldValue::Real(2.9), Some(2))]
    #[case(FieldValue::Text(" 42 ".into()), Some(42))]
    #[case(FieldValue::Text("n/a".into()), None)]
    fn widens_to_i64(#[case] value: FieldValue, #[case] expected: Option<i64>) {
        assert_eq!(value.as_i64(), expected);
    }

    #[rstest]
    fn coerces_text_to_integer() {
        let coerced = FieldValue::Text("38".into()).coerce_to(FieldType::Integer);
        assert_eq!(coerced, Some(FieldValue::Integer(38)));
    }

    #[rstest]
    fn overflow_degrades_to_unset() {
        let coerced = FieldValue::Integer64(i64::MAX).coerce_to(FieldType::Integer);
        assert_eq!(coerced, None);
    }

    #[rstest]
    fn parses_rfc3339_and_civil_literals() {
        let zoned = parse_datetime("2012-01-01T12:34:56Z").expect("offset literal");
        let civil = parse_datetime("2012-01-01T12:34:56").expect("civil literal");
        assert_eq!(zoned, civil);
        assert_eq!(zoned.year(), 2012);
        assert_eq!(zoned.second(), 56);
    }

    #[rstest]
    fn converts_epochs() {
        let datetime = epoch_to_datetime(0).expect("epoch zero");
        assert_eq!(datetime.year(), 1970);
        assert_eq!(datetime.month(), 1);
        assert_eq!(datetime.day(), 1);
    }
}
