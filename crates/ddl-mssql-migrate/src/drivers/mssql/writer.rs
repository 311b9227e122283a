//! INSERT construction, parameter binding and server error classification
//! for MSSQL writes.

use tiberius::ToSql;

use crate::config::DriverKind;
use crate::core::identifier::{qualify_for, quote_for};
use crate::core::{SqlNullType, SqlValue, TableRef};
use crate::error::Result;
use crate::transfer::RowFailureReason;

/// "Cannot insert explicit value for identity column ... IDENTITY_INSERT is
/// set to OFF."
pub const IDENTITY_INSERT_OFF: u32 = 544;

/// Errors that mean the row broke a key, uniqueness, foreign key or NOT NULL
/// constraint.
const CONSTRAINT_CODES: &[u32] = &[
    515,  // NULL into NOT NULL column
    547,  // FOREIGN KEY / CHECK conflict
    2601, // duplicate key in unique index
    2627, // PRIMARY KEY / UNIQUE violation
];

/// Constraint errors caused by a key already present in the target.
const DUPLICATE_KEY_CODES: &[u32] = &[2601, 2627];

/// Errors raised while converting a value to the column type.
const COERCION_CODES: &[u32] = &[
    220,  // arithmetic overflow for data type
    241,  // conversion failed converting date/time from string
    242,  // out-of-range datetime value
    245,  // conversion failed converting varchar to int
    2628, // string or binary data would be truncated (2019+)
    8114, // error converting data type
    8115, // arithmetic overflow converting to data type
    8116, // argument data type is invalid
    8152, // string or binary data would be truncated
];

/// `INSERT INTO [s].[t] ([a], [b]) VALUES (@P1, @P2)`
pub fn build_insert(table: &TableRef, columns: &[String]) -> Result<String> {
    let cols = columns
        .iter()
        .map(|c| quote_for(DriverKind::Mssql, c))
        .collect::<Result<Vec<_>>>()?;
    let params: Vec<String> = (1..=columns.len()).map(|i| format!("@P{}", i)).collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualify_for(DriverKind::Mssql, &table.schema, &table.name)?,
        cols.join(", "),
        params.join(", ")
    ))
}

/// Map a server error to a row-level rejection. `None` means the error is
/// fatal for the session.
///
/// Severity 17 and above are resource or connection problems, so they are
/// never treated as a property of the row.
pub fn classify_server_error(code: u32, class: u8) -> Option<RowFailureReason> {
    if class >= 17 {
        return None;
    }
    if CONSTRAINT_CODES.contains(&code) {
        Some(RowFailureReason::ConstraintViolation)
    } else if COERCION_CODES.contains(&code) {
        Some(RowFailureReason::TypeCoercion)
    } else {
        Some(RowFailureReason::Other)
    }
}

/// Whether a row-level server error means the key is already present.
pub fn is_duplicate_key(code: u32) -> bool {
    DUPLICATE_KEY_CODES.contains(&code)
}

/// Bind one value. NULLs keep their type so SQL Server does not have to
/// convert an untyped NULL (nvarchar to varbinary is not implicit).
pub fn to_param(value: &SqlValue<'_>) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(t) => match t {
            SqlNullType::Bool => Box::new(Option::<bool>::None),
            SqlNullType::I16 => Box::new(Option::<i16>::None),
            SqlNullType::I32 => Box::new(Option::<i32>::None),
            SqlNullType::I64 => Box::new(Option::<i64>::None),
            SqlNullType::F32 => Box::new(Option::<f32>::None),
            SqlNullType::F64 => Box::new(Option::<f64>::None),
            SqlNullType::String => Box::new(Option::<String>::None),
            SqlNullType::Bytes => Box::new(Option::<Vec<u8>>::None),
            SqlNullType::Uuid => Box::new(Option::<uuid::Uuid>::None),
            SqlNullType::Decimal => Box::new(Option::<rust_decimal::Decimal>::None),
            SqlNullType::DateTime => Box::new(Option::<chrono::NaiveDateTime>::None),
            SqlNullType::DateTimeOffset => {
                Box::new(Option::<chrono::DateTime<chrono::FixedOffset>>::None)
            }
            SqlNullType::Date => Box::new(Option::<chrono::NaiveDate>::None),
            SqlNullType::Time => Box::new(Option::<chrono::NaiveTime>::None),
        },
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        // FLOAT columns cannot hold NaN or infinities
        SqlValue::F32(f) if !f.is_finite() => Box::new(Option::<f32>::None),
        SqlValue::F64(f) if !f.is_finite() => Box::new(Option::<f64>::None),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.to_string()),
        SqlValue::Bytes(b) => Box::new(b.to_vec()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_insert() {
        let sql = build_insert(
            &TableRef::new("dbo", "orders"),
            &["id".to_string(), "total amount".to_string()],
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO [dbo].[orders] ([id], [total amount]) VALUES (@P1, @P2)"
        );
    }

    #[test]
    fn test_build_insert_rejects_bad_identifier() {
        assert!(build_insert(&TableRef::new("dbo", "t"), &["a\0".to_string()]).is_err());
    }

    #[test]
    fn test_classify_server_error() {
        assert_eq!(
            classify_server_error(2627, 14),
            Some(RowFailureReason::ConstraintViolation)
        );
        assert_eq!(
            classify_server_error(515, 16),
            Some(RowFailureReason::ConstraintViolation)
        );
        assert_eq!(
            classify_server_error(8152, 16),
            Some(RowFailureReason::TypeCoercion)
        );
        assert_eq!(
            classify_server_error(245, 16),
            Some(RowFailureReason::TypeCoercion)
        );
        assert_eq!(classify_server_error(50000, 16), Some(RowFailureReason::Other));
        // severity 17+ is never blamed on the row
        assert_eq!(classify_server_error(2627, 20), None);
    }

    #[test]
    fn test_duplicate_key_codes() {
        assert!(is_duplicate_key(2627));
        assert!(is_duplicate_key(2601));
        assert!(!is_duplicate_key(515));
        assert!(!is_duplicate_key(547));
    }
}
