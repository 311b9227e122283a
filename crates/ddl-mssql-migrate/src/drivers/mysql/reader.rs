//! Query construction and value conversion for MySQL reads.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{Row as _, ValueRef};

use crate::config::DriverKind;
use crate::core::identifier::{qualify_for, quote_for};
use crate::core::{ReadRequest, RowFilter, SqlNullType, SqlValue};
use crate::error::Result;

/// Build the SELECT for `request`. The watermark bound is bound as `?`.
pub fn build_select(request: &ReadRequest) -> Result<(String, Option<DateTime<Utc>>)> {
    let cols = if request.columns.is_empty() {
        "*".to_string()
    } else {
        request
            .columns
            .iter()
            .map(|c| quote_for(DriverKind::Mysql, c))
            .collect::<Result<Vec<_>>>()?
            .join(", ")
    };

    let mut sql = format!(
        "SELECT {} FROM {}",
        cols,
        qualify_for(DriverKind::Mysql, &request.table.schema, &request.table.name)?
    );

    let mut after = None;
    if let RowFilter::ModifiedAfter { column, after: ts } = &request.filter {
        sql.push_str(&format!(" WHERE {} > ?", quote_for(DriverKind::Mysql, column)?));
        after = Some(*ts);
    }
    if let Some(order_by) = &request.order_by {
        sql.push_str(&format!(" ORDER BY {}", quote_for(DriverKind::Mysql, order_by)?));
    }
    Ok((sql, after))
}

/// Lower-cased type name with display width and modifiers dropped,
/// e.g. `INT UNSIGNED` → (`int`, true).
pub fn normalize_type(type_name: &str) -> (String, bool) {
    let lowered = type_name.to_lowercase();
    let unsigned = lowered.contains("unsigned");
    let base = lowered
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or("")
        .to_string();
    (base, unsigned)
}

fn null_type_for(base: &str) -> SqlNullType {
    match base {
        "tinyint" | "smallint" => SqlNullType::I16,
        "mediumint" | "int" | "integer" => SqlNullType::I32,
        "bigint" => SqlNullType::I64,
        "float" => SqlNullType::F32,
        "double" | "real" => SqlNullType::F64,
        "decimal" | "numeric" => SqlNullType::Decimal,
        "boolean" | "bool" | "bit" => SqlNullType::Bool,
        "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
            SqlNullType::Bytes
        }
        "date" => SqlNullType::Date,
        "time" => SqlNullType::Time,
        "datetime" | "timestamp" => SqlNullType::DateTime,
        _ => SqlNullType::String,
    }
}

/// Convert one column of a row.
pub fn convert_value(row: &MySqlRow, idx: usize, type_name: &str) -> SqlValue<'static> {
    let (base, unsigned) = normalize_type(type_name);

    let is_null = row.try_get_raw(idx).map(|r| r.is_null()).unwrap_or(true);
    if is_null {
        return SqlValue::Null(null_type_for(&base));
    }

    let null = || SqlValue::Null(null_type_for(&base));
    match (base.as_str(), unsigned) {
        ("tinyint", false) => row
            .try_get::<i8, _>(idx)
            .map(|v| SqlValue::I16(v as i16))
            .unwrap_or_else(|_| null()),
        ("tinyint", true) => row
            .try_get::<u8, _>(idx)
            .map(|v| SqlValue::I16(v as i16))
            .unwrap_or_else(|_| null()),
        ("smallint", false) => row
            .try_get::<i16, _>(idx)
            .map(SqlValue::I16)
            .unwrap_or_else(|_| null()),
        ("smallint", true) => row
            .try_get::<u16, _>(idx)
            .map(|v| SqlValue::I32(v as i32))
            .unwrap_or_else(|_| null()),
        ("mediumint" | "int" | "integer", false) => row
            .try_get::<i32, _>(idx)
            .map(SqlValue::I32)
            .unwrap_or_else(|_| null()),
        ("mediumint" | "int" | "integer", true) => row
            .try_get::<u32, _>(idx)
            .map(|v| SqlValue::I64(v as i64))
            .unwrap_or_else(|_| null()),
        ("bigint", false) => row
            .try_get::<i64, _>(idx)
            .map(SqlValue::I64)
            .unwrap_or_else(|_| null()),
        ("bigint", true) => row
            .try_get::<u64, _>(idx)
            .map(|v| match i64::try_from(v) {
                Ok(v) => SqlValue::I64(v),
                Err(_) => SqlValue::Decimal(rust_decimal::Decimal::from(v)),
            })
            .unwrap_or_else(|_| null()),
        ("float", _) => row
            .try_get::<f32, _>(idx)
            .map(SqlValue::F32)
            .unwrap_or_else(|_| null()),
        ("double" | "real", _) => row
            .try_get::<f64, _>(idx)
            .map(SqlValue::F64)
            .unwrap_or_else(|_| null()),
        ("decimal" | "numeric", _) => row
            .try_get::<rust_decimal::Decimal, _>(idx)
            .map(SqlValue::Decimal)
            .unwrap_or_else(|_| null()),
        ("boolean" | "bool" | "bit", _) => row
            .try_get::<bool, _>(idx)
            .map(SqlValue::Bool)
            .unwrap_or_else(|_| null()),
        ("binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob", _) => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|b| SqlValue::Bytes(Cow::Owned(b)))
            .unwrap_or_else(|_| null()),
        ("date", _) => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(SqlValue::Date)
            .unwrap_or_else(|_| null()),
        ("time", _) => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(SqlValue::Time)
            .unwrap_or_else(|_| null()),
        ("datetime" | "timestamp", _) => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(SqlValue::DateTime)
            .unwrap_or_else(|_| null()),
        _ => row
            .try_get::<String, _>(idx)
            .map(|s| SqlValue::Text(Cow::Owned(s)))
            .unwrap_or_else(|_| null()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TableRef;
    use chrono::TimeZone;

    #[test]
    fn test_select_incremental() {
        let request = ReadRequest {
            table: TableRef::new("shop", "orders"),
            columns: Vec::new(),
            filter: RowFilter::ModifiedAfter {
                column: "updated_at".into(),
                after: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            },
            order_by: Some("updated_at".into()),
        };
        let (sql, after) = build_select(&request).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM `shop`.`orders` WHERE `updated_at` > ? ORDER BY `updated_at`"
        );
        assert!(after.is_some());
    }

    #[test]
    fn test_normalize_type() {
        assert_eq!(normalize_type("INT UNSIGNED"), ("int".to_string(), true));
        assert_eq!(normalize_type("VARCHAR"), ("varchar".to_string(), false));
        assert_eq!(normalize_type("decimal(10,2)"), ("decimal".to_string(), false));
    }

    #[test]
    fn test_null_type_for() {
        assert_eq!(null_type_for("bigint"), SqlNullType::I64);
        assert_eq!(null_type_for("datetime"), SqlNullType::DateTime);
        assert_eq!(null_type_for("json"), SqlNullType::String);
    }
}
