//! In-process driver.
//!
//! Tables live in memory behind a shared lock, keyed by database and table
//! name (case-insensitive; schemas are ignored). `CREATE TABLE` statements
//! run through [`Session::execute`] create typed tables, and writes enforce
//! column types, `NOT NULL` and primary keys, so the driver refuses rows the
//! way a real target would. Used for dry runs and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use futures::StreamExt;
use tracing::debug;

use crate::config::{DriverKind, EndpointConfig};
use crate::conflict::{base_type, parse_create_table};
use crate::connection::ConnectFailure;
use crate::core::{
    Driver, ReadRequest, Row, RowCursor, RowFilter, Session, SqlNullType, SqlValue, TableRef,
    WriteOutcome,
};
use crate::error::{MigrateError, Result};
use crate::transfer::RowFailureReason;

/// Column of an in-memory table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub identity: bool,
}

impl MemoryColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            primary_key: false,
            identity: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }
}

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<MemoryColumn>,
    rows: Vec<Row>,
    next_identity: i64,
    /// Cursor error after this many rows.
    fail_reads_after: Option<usize>,
}

#[derive(Debug, Default)]
struct Store {
    databases: HashMap<String, HashMap<String, MemoryTable>>,
    executed: HashMap<String, Vec<String>>,
    connect_failures: VecDeque<ConnectFailure>,
    failing_statements: Vec<String>,
    open_sessions: usize,
}

/// Driver for in-memory databases. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    store: Arc<Mutex<Store>>,
}

fn key(name: &str) -> String {
    name.to_lowercase()
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        lock(&self.store)
    }

    /// Create (or replace) `table` in `database` with initial rows.
    pub fn create_table(
        &self,
        database: &str,
        table: &str,
        columns: Vec<MemoryColumn>,
        rows: Vec<Row>,
    ) {
        let next_identity = rows.len() as i64 + 1;
        self.lock().databases.entry(key(database)).or_default().insert(
            key(table),
            MemoryTable {
                columns,
                rows,
                next_identity,
                fail_reads_after: None,
            },
        );
    }

    /// Append rows to an existing table without constraint checks.
    pub fn append_rows(&self, database: &str, table: &str, rows: Vec<Row>) {
        let mut store = self.lock();
        if let Some(t) = store
            .databases
            .get_mut(&key(database))
            .and_then(|db| db.get_mut(&key(table)))
        {
            t.rows.extend(rows);
        }
    }

    /// Remove the rows matching `predicate`; returns how many went.
    pub fn delete_rows(&self, database: &str, table: &str, predicate: impl Fn(&Row) -> bool) -> usize {
        let mut store = self.lock();
        match store
            .databases
            .get_mut(&key(database))
            .and_then(|db| db.get_mut(&key(table)))
        {
            Some(t) => {
                let before = t.rows.len();
                t.rows.retain(|r| !predicate(r));
                before - t.rows.len()
            }
            None => 0,
        }
    }

    pub fn has_table(&self, database: &str, table: &str) -> bool {
        self.lock()
            .databases
            .get(&key(database))
            .is_some_and(|db| db.contains_key(&key(table)))
    }

    pub fn row_count(&self, database: &str, table: &str) -> usize {
        self.rows(database, table).len()
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, database: &str, table: &str) -> Vec<Row> {
        self.lock()
            .databases
            .get(&key(database))
            .and_then(|db| db.get(&key(table)))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Columns of a table, if it exists.
    pub fn columns(&self, database: &str, table: &str) -> Option<Vec<MemoryColumn>> {
        self.lock()
            .databases
            .get(&key(database))
            .and_then(|db| db.get(&key(table)))
            .map(|t| t.columns.clone())
    }

    /// Statements executed against `database`, in order.
    pub fn executed(&self, database: &str) -> Vec<String> {
        self.lock()
            .executed
            .get(&key(database))
            .cloned()
            .unwrap_or_default()
    }

    /// Make cursors over `table` fail after yielding `rows` rows.
    pub fn fail_reads_after(&self, database: &str, table: &str, rows: usize) {
        let mut store = self.lock();
        if let Some(t) = store
            .databases
            .get_mut(&key(database))
            .and_then(|db| db.get_mut(&key(table)))
        {
            t.fail_reads_after = Some(rows);
        }
    }

    /// Fail the next connection attempt with `failure`.
    pub fn fail_next_connect(&self, failure: ConnectFailure) {
        self.lock().connect_failures.push_back(failure);
    }

    /// Fail any statement containing `needle` (case-insensitive).
    pub fn fail_statements_containing(&self, needle: &str) {
        self.lock().failing_statements.push(needle.to_lowercase());
    }

    /// Sessions connected and not yet dropped.
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }
}

fn lock(store: &Mutex<Store>) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Driver for MemoryDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    async fn connect(
        &self,
        endpoint: &EndpointConfig,
    ) -> std::result::Result<Box<dyn Session>, ConnectFailure> {
        let mut store = self.lock();
        if let Some(failure) = store.connect_failures.pop_front() {
            return Err(failure);
        }
        if endpoint.database.trim().is_empty() {
            return Err(ConnectFailure::handle(
                "memory endpoint requires a database name",
            ));
        }
        store.open_sessions += 1;
        debug!("memory: session opened on '{}'", endpoint.database);
        Ok(Box::new(MemorySession {
            store: self.store.clone(),
            database: key(&endpoint.database),
        }))
    }
}

/// Session over one in-memory database.
pub struct MemorySession {
    store: Arc<Mutex<Store>>,
    database: String,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut store = lock(&self.store);
        store.open_sessions = store.open_sessions.saturating_sub(1);
    }
}

#[async_trait]
impl Session for MemorySession {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut store = lock(&self.store);
        store
            .executed
            .entry(self.database.clone())
            .or_default()
            .push(sql.to_string());

        let lowered = sql.to_lowercase();
        if store.failing_statements.iter().any(|n| lowered.contains(n.as_str())) {
            return Err(MigrateError::Database(format!(
                "statement rejected: {}",
                sql.lines().next().unwrap_or(sql)
            )));
        }

        if let Some(def) = parse_create_table(sql) {
            let tables = store.databases.entry(self.database.clone()).or_default();
            if tables.contains_key(&key(&def.name)) {
                return Err(MigrateError::Database(format!(
                    "There is already an object named '{}' in the database",
                    def.name
                )));
            }
            let columns = def
                .columns
                .iter()
                .map(|c| MemoryColumn {
                    name: c.name.clone(),
                    data_type: c.data_type.clone(),
                    nullable: c.is_nullable,
                    primary_key: def.primary_key.iter().any(|p| p.eq_ignore_ascii_case(&c.name)),
                    identity: c.is_identity,
                })
                .collect();
            tables.insert(
                key(&def.name),
                MemoryTable {
                    columns,
                    rows: Vec::new(),
                    next_identity: 1,
                    fail_reads_after: None,
                },
            );
            debug!("memory: created table {}", def.name);
        }
        Ok(())
    }

    async fn read_rows<'a>(&'a mut self, request: &ReadRequest) -> Result<RowCursor<'a>> {
        let store = lock(&self.store);
        let table = store
            .databases
            .get(&self.database)
            .and_then(|db| db.get(&key(&request.table.name)))
            .ok_or_else(|| {
                MigrateError::Database(format!(
                    "Invalid object name '{}'",
                    request.table.display_name()
                ))
            })?;

        let index_of = |name: &str| {
            table
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| MigrateError::Database(format!("Invalid column name '{}'", name)))
        };

        let selected: Vec<usize> = if request.columns.is_empty() {
            (0..table.columns.len()).collect()
        } else {
            request
                .columns
                .iter()
                .map(|c| index_of(c))
                .collect::<Result<_>>()?
        };

        let mut rows: Vec<&Row> = match &request.filter {
            RowFilter::All => table.rows.iter().collect(),
            RowFilter::ModifiedAfter { column, after } => {
                let idx = index_of(column)?;
                table
                    .rows
                    .iter()
                    .filter(|r| r[idx].as_timestamp().is_some_and(|ts| ts > *after))
                    .collect()
            }
        };
        if let Some(order_by) = &request.order_by {
            let idx = index_of(order_by)?;
            rows.sort_by_key(|r| r[idx].as_timestamp());
        }

        let columns = selected
            .iter()
            .map(|i| table.columns[*i].name.clone())
            .collect();
        let mut items: Vec<Result<Row>> = rows
            .into_iter()
            .map(|r| Ok(selected.iter().map(|i| r[*i].clone()).collect()))
            .collect();
        if let Some(limit) = table.fail_reads_after {
            items.truncate(limit);
            items.push(Err(MigrateError::Database(
                "connection lost while reading".into(),
            )));
        }

        Ok(RowCursor {
            columns,
            rows: futures::stream::iter(items).boxed(),
        })
    }

    async fn write_row(
        &mut self,
        table: &TableRef,
        columns: &[String],
        row: &Row,
    ) -> Result<WriteOutcome> {
        let mut store = lock(&self.store);
        let target = store
            .databases
            .get_mut(&self.database)
            .and_then(|db| db.get_mut(&key(&table.name)))
            .ok_or_else(|| {
                MigrateError::Database(format!("Invalid object name '{}'", table.display_name()))
            })?;

        if let Some(unknown) = columns
            .iter()
            .find(|c| !target.columns.iter().any(|t| t.name.eq_ignore_ascii_case(c)))
        {
            return Ok(rejected(
                RowFailureReason::Other,
                format!("Invalid column name '{}'", unknown),
            ));
        }

        let mut values = Vec::with_capacity(target.columns.len());
        for column in &target.columns {
            let provided = columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(&column.name))
                .map(|i| row[i].clone());
            let value = match provided {
                Some(v) => v,
                None if column.identity => SqlValue::I64(target.next_identity),
                None => SqlValue::Null(SqlNullType::String),
            };

            if value.is_null() && !column.nullable {
                return Ok(rejected(
                    RowFailureReason::ConstraintViolation,
                    format!(
                        "Cannot insert the value NULL into column '{}'",
                        column.name
                    ),
                ));
            }
            if !accepts(&column.data_type, &value) {
                return Ok(rejected(
                    RowFailureReason::TypeCoercion,
                    format!(
                        "cannot convert {} value {} to {} for column '{}'",
                        value.type_name(),
                        value,
                        column.data_type,
                        column.name
                    ),
                ));
            }
            values.push(value);
        }

        let pk: Vec<usize> = target
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect();
        if !pk.is_empty()
            && target
                .rows
                .iter()
                .any(|existing| pk.iter().all(|i| existing[*i] == values[*i]))
        {
            let key_text = pk
                .iter()
                .map(|i| values[*i].to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(WriteOutcome::DuplicateKey {
                message: format!(
                    "Violation of PRIMARY KEY constraint on '{}': duplicate key ({})",
                    table.name, key_text
                ),
            });
        }

        if target.columns.iter().any(|c| c.identity) {
            target.next_identity += 1;
        }
        target.rows.push(values);
        Ok(WriteOutcome::Written)
    }

    async fn close(&mut self) -> Result<()> {
        debug!("memory: session on '{}' closed", self.database);
        Ok(())
    }
}

fn rejected(reason: RowFailureReason, message: String) -> WriteOutcome {
    WriteOutcome::Rejected { reason, message }
}

/// Whether a column of `data_type` can hold `value`.
fn accepts(data_type: &str, value: &SqlValue<'_>) -> bool {
    if value.is_null() {
        return true;
    }
    match base_type(data_type).as_str() {
        "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "SERIAL" | "BIGSERIAL" => {
            matches!(value, SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_))
        }
        "BIT" | "BOOLEAN" | "BOOL" => match value {
            SqlValue::Bool(_) => true,
            SqlValue::I16(v) => *v == 0 || *v == 1,
            SqlValue::I32(v) => *v == 0 || *v == 1,
            SqlValue::I64(v) => *v == 0 || *v == 1,
            _ => false,
        },
        "DECIMAL" | "NUMERIC" | "FLOAT" | "REAL" | "MONEY" | "DOUBLE" => matches!(
            value,
            SqlValue::I16(_)
                | SqlValue::I32(_)
                | SqlValue::I64(_)
                | SqlValue::F32(_)
                | SqlValue::F64(_)
                | SqlValue::Decimal(_)
        ),
        "DATETIME" | "DATETIME2" | "SMALLDATETIME" | "DATE" | "TIMESTAMP"
        | "DATETIMEOFFSET" => match value {
            SqlValue::DateTime(_) | SqlValue::DateTimeOffset(_) | SqlValue::Date(_) => true,
            SqlValue::Text(s) => {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
                    || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
            }
            _ => false,
        },
        "UNIQUEIDENTIFIER" | "UUID" => match value {
            SqlValue::Uuid(_) => true,
            SqlValue::Text(s) => uuid::Uuid::parse_str(s).is_ok(),
            _ => false,
        },
        "VARBINARY" | "BINARY" | "IMAGE" | "BYTEA" | "BLOB" => matches!(value, SqlValue::Bytes(_)),
        "NVARCHAR" | "VARCHAR" | "NCHAR" | "CHAR" | "NTEXT" | "TEXT" => {
            !matches!(value, SqlValue::Bytes(_))
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;
    use chrono::{TimeZone, Utc};

    fn endpoint(database: &str) -> EndpointConfig {
        EndpointConfig {
            driver: DriverKind::Memory,
            provider: Provider::OnPremise,
            host: String::new(),
            port: None,
            database: database.to_string(),
            user: String::new(),
            password: String::new(),
            schema: None,
            encrypt: None,
            trust_server_cert: None,
            ssl_mode: None,
            connection_string: None,
        }
    }

    async fn session(driver: &MemoryDriver, db: &str) -> Box<dyn Session> {
        driver.connect(&endpoint(db)).await.unwrap()
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_execute_creates_typed_table() {
        let driver = MemoryDriver::new();
        let mut s = session(&driver, "dst").await;
        s.execute("CREATE TABLE users (id INT IDENTITY PRIMARY KEY CLUSTERED, name NVARCHAR(50) NOT NULL)")
            .await
            .unwrap();

        let columns = driver.columns("dst", "USERS").unwrap();
        assert!(columns[0].primary_key && columns[0].identity);
        assert!(!columns[1].nullable);
        assert_eq!(driver.executed("dst").len(), 1);

        let err = s.execute("CREATE TABLE users (x INT)").await.unwrap_err();
        assert!(err.to_string().contains("already an object"));
    }

    #[tokio::test]
    async fn test_write_enforces_constraints_and_types() {
        let driver = MemoryDriver::new();
        driver.create_table(
            "dst",
            "t",
            vec![
                MemoryColumn::new("id", "INT").primary_key(),
                MemoryColumn::new("flag", "BIT"),
                MemoryColumn::new("name", "NVARCHAR(10)").not_null(),
            ],
            Vec::new(),
        );
        let mut s = session(&driver, "dst").await;
        let table = TableRef::new("dbo", "t");
        let columns = cols(&["id", "flag", "name"]);

        let ok = vec![SqlValue::I32(1), SqlValue::Bool(true), SqlValue::text("a")];
        assert_eq!(s.write_row(&table, &columns, &ok).await.unwrap(), WriteOutcome::Written);

        let dup = vec![SqlValue::I32(1), SqlValue::Bool(false), SqlValue::text("b")];
        assert!(matches!(
            s.write_row(&table, &columns, &dup).await.unwrap(),
            WriteOutcome::DuplicateKey { ref message } if message.contains("duplicate key")
        ));

        let bad_type = vec![SqlValue::I32(2), SqlValue::text("yes"), SqlValue::text("c")];
        assert!(matches!(
            s.write_row(&table, &columns, &bad_type).await.unwrap(),
            WriteOutcome::Rejected { reason: RowFailureReason::TypeCoercion, .. }
        ));

        let null = vec![SqlValue::I32(3), SqlValue::Bool(true), SqlValue::Null(SqlNullType::String)];
        assert!(matches!(
            s.write_row(&table, &columns, &null).await.unwrap(),
            WriteOutcome::Rejected { reason: RowFailureReason::ConstraintViolation, .. }
        ));

        assert_eq!(driver.row_count("dst", "t"), 1);
    }

    #[tokio::test]
    async fn test_identity_is_generated_when_omitted() {
        let driver = MemoryDriver::new();
        driver.create_table(
            "dst",
            "t",
            vec![
                MemoryColumn::new("id", "INT").primary_key().identity(),
                MemoryColumn::new("name", "NVARCHAR(10)"),
            ],
            Vec::new(),
        );
        let mut s = session(&driver, "dst").await;
        let table = TableRef::new("", "t");
        for name in ["a", "b"] {
            s.write_row(&table, &cols(&["name"]), &vec![SqlValue::text(name)])
                .await
                .unwrap();
        }
        let rows = driver.rows("dst", "t");
        assert_eq!(rows[0][0], SqlValue::I64(1));
        assert_eq!(rows[1][0], SqlValue::I64(2));
    }

    #[tokio::test]
    async fn test_read_filters_and_orders() {
        let driver = MemoryDriver::new();
        let at = |h: u32| SqlValue::DateTime(Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap().naive_utc());
        driver.create_table(
            "src",
            "t",
            vec![MemoryColumn::new("id", "INT"), MemoryColumn::new("last_modified", "DATETIME")],
            vec![
                vec![SqlValue::I32(1), at(3)],
                vec![SqlValue::I32(2), at(1)],
                vec![SqlValue::I32(3), at(2)],
                vec![SqlValue::I32(4), SqlValue::Null(SqlNullType::DateTime)],
            ],
        );
        let mut s = session(&driver, "src").await;
        let request = ReadRequest {
            table: TableRef::new("", "t"),
            columns: cols(&["id"]),
            filter: RowFilter::ModifiedAfter {
                column: "last_modified".into(),
                after: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            },
            order_by: Some("last_modified".into()),
        };
        let cursor = s.read_rows(&request).await.unwrap();
        assert_eq!(cursor.columns, vec!["id"]);
        let rows: Vec<Row> = cursor.rows.map(|r| r.unwrap()).collect().await;
        assert_eq!(rows, vec![vec![SqlValue::I32(3)], vec![SqlValue::I32(1)]]);
    }

    #[tokio::test]
    async fn test_unknown_table_is_an_error() {
        let driver = MemoryDriver::new();
        let mut s = session(&driver, "src").await;
        let request = ReadRequest {
            table: TableRef::new("", "missing"),
            columns: Vec::new(),
            filter: RowFilter::All,
            order_by: None,
        };
        assert!(s.read_rows(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failures_and_session_count() {
        let driver = MemoryDriver::new();
        driver.fail_next_connect(ConnectFailure::connect("refused"));
        assert!(driver.connect(&endpoint("db")).await.is_err());
        assert!(driver.connect(&endpoint("")).await.is_err());

        let s = session(&driver, "db").await;
        assert_eq!(driver.open_sessions(), 1);
        drop(s);
        assert_eq!(driver.open_sessions(), 0);
    }
}
