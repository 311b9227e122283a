//! Per-column value transforms applied between read and write.

use std::borrow::Cow;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::core::SqlValue;

/// A transform configured for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueTransform {
    /// Parse text dates into a timestamp and express zoned values in UTC.
    /// MySQL zero dates become NULL.
    NormalizeDate,
    /// Strip surrounding whitespace from text.
    Trim,
    Uppercase,
    Lowercase,
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

impl ValueTransform {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueTransform::NormalizeDate => "normalize_date",
            ValueTransform::Trim => "trim",
            ValueTransform::Uppercase => "uppercase",
            ValueTransform::Lowercase => "lowercase",
        }
    }

    /// Transform `value`. NULL passes through every transform. Text
    /// transforms leave non-text values alone.
    pub fn apply(&self, value: SqlValue<'static>) -> Result<SqlValue<'static>, String> {
        if value.is_null() {
            return Ok(value);
        }
        match self {
            ValueTransform::NormalizeDate => normalize_date(value),
            ValueTransform::Trim => Ok(map_text(value, |s| s.trim().to_string())),
            ValueTransform::Uppercase => Ok(map_text(value, |s| s.to_uppercase())),
            ValueTransform::Lowercase => Ok(map_text(value, |s| s.to_lowercase())),
        }
    }
}

fn map_text(value: SqlValue<'static>, f: impl Fn(&str) -> String) -> SqlValue<'static> {
    match value {
        SqlValue::Text(s) => SqlValue::Text(Cow::Owned(f(&s))),
        other => other,
    }
}

fn normalize_date(value: SqlValue<'static>) -> Result<SqlValue<'static>, String> {
    match value {
        SqlValue::DateTime(_) => Ok(value),
        SqlValue::DateTimeOffset(v) => Ok(SqlValue::DateTime(v.naive_utc())),
        SqlValue::Date(d) => d
            .and_hms_opt(0, 0, 0)
            .map(SqlValue::DateTime)
            .ok_or_else(|| format!("cannot normalize date {}", d)),
        SqlValue::Text(s) => parse_date_text(s.trim()),
        other => Err(format!("cannot normalize {} value {} as a date", other.type_name(), other)),
    }
}

fn parse_date_text(text: &str) -> Result<SqlValue<'static>, String> {
    if text.is_empty() || text.starts_with("0000-00-00") {
        return Ok(SqlValue::Null(crate::core::SqlNullType::DateTime));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(SqlValue::DateTime(dt.naive_utc()));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(SqlValue::DateTime(dt));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return Ok(SqlValue::DateTime(dt));
            }
        }
    }
    Err(format!("'{}' is not a recognised date", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlNullType;

    fn ts(s: &str) -> SqlValue<'static> {
        SqlValue::DateTime(NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap())
    }

    #[test]
    fn test_normalize_date_text_formats() {
        let t = ValueTransform::NormalizeDate;
        assert_eq!(t.apply(SqlValue::text("2024-03-01 10:30:00")).unwrap(), ts("2024-03-01 10:30:00"));
        assert_eq!(t.apply(SqlValue::text("2024-03-01T10:30:00")).unwrap(), ts("2024-03-01 10:30:00"));
        assert_eq!(t.apply(SqlValue::text("2024-03-01T12:30:00+02:00")).unwrap(), ts("2024-03-01 10:30:00"));
        assert_eq!(t.apply(SqlValue::text(" 2024/03/01 ")).unwrap(), ts("2024-03-01 00:00:00"));
    }

    #[test]
    fn test_normalize_date_zero_date_is_null() {
        let out = ValueTransform::NormalizeDate
            .apply(SqlValue::text("0000-00-00 00:00:00"))
            .unwrap();
        assert_eq!(out, SqlValue::Null(SqlNullType::DateTime));
    }

    #[test]
    fn test_normalize_date_rejects_garbage() {
        assert!(ValueTransform::NormalizeDate.apply(SqlValue::text("yesterday")).is_err());
        assert!(ValueTransform::NormalizeDate.apply(SqlValue::I32(7)).is_err());
    }

    #[test]
    fn test_text_transforms() {
        assert_eq!(ValueTransform::Trim.apply(SqlValue::text("  a b ")).unwrap(), SqlValue::text("a b"));
        assert_eq!(ValueTransform::Uppercase.apply(SqlValue::text("abc")).unwrap(), SqlValue::text("ABC"));
        assert_eq!(ValueTransform::Lowercase.apply(SqlValue::text("AbC")).unwrap(), SqlValue::text("abc"));
        assert_eq!(ValueTransform::Trim.apply(SqlValue::I32(5)).unwrap(), SqlValue::I32(5));
    }

    #[test]
    fn test_null_passes_through() {
        let null = SqlValue::Null(SqlNullType::String);
        assert_eq!(ValueTransform::NormalizeDate.apply(null.clone()).unwrap(), null);
    }

    #[test]
    fn test_serde_names() {
        let t: ValueTransform = serde_yaml::from_str("normalize_date").unwrap();
        assert_eq!(t, ValueTransform::NormalizeDate);
        assert_eq!(t.as_str(), "normalize_date");
    }
}
