//! Query construction and value conversion for PostgreSQL reads.

use std::borrow::Cow;

use chrono::{DateTime, Utc};

use crate::config::DriverKind;
use crate::core::identifier::{qualify_for, quote_for};
use crate::core::{ReadRequest, RowFilter, SqlNullType, SqlValue};
use crate::error::Result;

/// Build the SELECT for `request`. Returns the SQL and the watermark bound,
/// which is passed as `$1`.
pub fn build_select(request: &ReadRequest) -> Result<(String, Option<DateTime<Utc>>)> {
    let cols = if request.columns.is_empty() {
        "*".to_string()
    } else {
        request
            .columns
            .iter()
            .map(|c| quote_for(DriverKind::Postgres, c))
            .collect::<Result<Vec<_>>>()?
            .join(", ")
    };

    let mut sql = format!(
        "SELECT {} FROM {}",
        cols,
        qualify_for(DriverKind::Postgres, &request.table.schema, &request.table.name)?
    );

    let mut after = None;
    if let RowFilter::ModifiedAfter { column, after: ts } = &request.filter {
        // timestamp columns compare in the session zone, which is UTC
        sql.push_str(&format!(
            " WHERE {} > $1::timestamptz",
            quote_for(DriverKind::Postgres, column)?
        ));
        after = Some(*ts);
    }

    if let Some(order_by) = &request.order_by {
        sql.push_str(&format!(
            " ORDER BY {} NULLS FIRST",
            quote_for(DriverKind::Postgres, order_by)?
        ));
    }

    Ok((sql, after))
}

/// Convert one column of a row, using the server's type name.
///
/// Values that fail to decode become a typed NULL; the type name decides
/// which Rust type is tried.
pub fn convert_value(row: &tokio_postgres::Row, idx: usize, type_name: &str) -> SqlValue<'static> {
    match type_name {
        "bool" => row
            .try_get::<_, bool>(idx)
            .ok()
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "int2" => row
            .try_get::<_, i16>(idx)
            .ok()
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int4" => row
            .try_get::<_, i32>(idx)
            .ok()
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "int8" => row
            .try_get::<_, i64>(idx)
            .ok()
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "float4" => row
            .try_get::<_, f32>(idx)
            .ok()
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float8" => row
            .try_get::<_, f64>(idx)
            .ok()
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "numeric" => row
            .try_get::<_, rust_decimal::Decimal>(idx)
            .ok()
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        "uuid" => row
            .try_get::<_, uuid::Uuid>(idx)
            .ok()
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "timestamp" => row
            .try_get::<_, chrono::NaiveDateTime>(idx)
            .ok()
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "timestamptz" => row
            .try_get::<_, DateTime<Utc>>(idx)
            .ok()
            .map(|v| SqlValue::DateTimeOffset(v.fixed_offset()))
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .try_get::<_, chrono::NaiveDate>(idx)
            .ok()
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .try_get::<_, chrono::NaiveTime>(idx)
            .ok()
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        "bytea" => row
            .try_get::<_, Vec<u8>>(idx)
            .ok()
            .map(|b| SqlValue::Bytes(Cow::Owned(b)))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        "json" | "jsonb" => row
            .try_get::<_, serde_json::Value>(idx)
            .ok()
            .map(|v| SqlValue::Text(Cow::Owned(v.to_string())))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
        _ => row
            .try_get::<_, String>(idx)
            .ok()
            .map(|s| SqlValue::Text(Cow::Owned(s)))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TableRef;
    use chrono::TimeZone;

    fn request() -> ReadRequest {
        ReadRequest {
            table: TableRef::new("public", "users"),
            columns: Vec::new(),
            filter: RowFilter::All,
            order_by: None,
        }
    }

    #[test]
    fn test_select_all() {
        let (sql, after) = build_select(&request()).unwrap();
        assert_eq!(sql, r#"SELECT * FROM "public"."users""#);
        assert!(after.is_none());
    }

    #[test]
    fn test_select_incremental() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut req = request();
        req.columns = vec!["id".into(), "last_modified".into()];
        req.filter = RowFilter::ModifiedAfter {
            column: "last_modified".into(),
            after: ts,
        };
        req.order_by = Some("last_modified".into());

        let (sql, after) = build_select(&req).unwrap();
        assert_eq!(
            sql,
            r#"SELECT "id", "last_modified" FROM "public"."users" WHERE "last_modified" > $1::timestamptz ORDER BY "last_modified" NULLS FIRST"#
        );
        assert_eq!(after, Some(ts));
    }

    #[test]
    fn test_rejects_bad_identifier() {
        let mut req = request();
        req.columns = vec!["a\0b".into()];
        assert!(build_select(&req).is_err());
    }
}
