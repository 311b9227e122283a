//! MySQL/MariaDB source driver (feature `mysql`).
//!
//! One sqlx connection per session. The session keeps the text of the
//! running query so the row stream can borrow it for as long as the cursor
//! lives.

mod reader;

pub use reader::build_select;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{Column, ConnectOptions, Connection, Executor, Statement, TypeInfo};
use tracing::{debug, info};

use super::common::classify_connect_error;
use crate::config::{DriverKind, EndpointConfig};
use crate::connection::{conn_str, ConnectFailure};
use crate::core::{Driver, ReadRequest, Row, RowCursor, Session, TableRef, WriteOutcome};
use crate::error::{MigrateError, Result};

/// Connects MySQL source sessions.
#[derive(Debug, Clone, Default)]
pub struct MysqlDriver;

impl MysqlDriver {
    pub fn new() -> Self {
        Self
    }
}

fn ssl_mode(value: &str) -> std::result::Result<MySqlSslMode, ConnectFailure> {
    match value.to_ascii_uppercase().replace('-', "_").as_str() {
        "DISABLED" => Ok(MySqlSslMode::Disabled),
        "PREFERRED" => Ok(MySqlSslMode::Preferred),
        "REQUIRED" => Ok(MySqlSslMode::Required),
        "VERIFY_CA" => Ok(MySqlSslMode::VerifyCa),
        "VERIFY_IDENTITY" => Ok(MySqlSslMode::VerifyIdentity),
        other => Err(ConnectFailure::handle(format!(
            "invalid ssl-mode '{}'",
            other
        ))),
    }
}

fn connect_options(
    pairs: &HashMap<String, String>,
) -> std::result::Result<MySqlConnectOptions, ConnectFailure> {
    let mut options = MySqlConnectOptions::new();
    let mut has_host = false;

    for (key, value) in pairs {
        options = match key.as_str() {
            "host" | "server" => {
                has_host = true;
                options.host(value)
            }
            "port" => options.port(value.parse::<u16>().map_err(|_| {
                ConnectFailure::handle(format!("invalid port '{}'", value))
            })?),
            "database" | "dbname" => options.database(value),
            "user" | "username" | "user id" => options.username(value),
            "password" => options.password(value),
            "ssl-mode" | "sslmode" | "ssl_mode" => options.ssl_mode(ssl_mode(value)?),
            "charset" => options.charset(value),
            other => {
                return Err(ConnectFailure::handle(format!(
                    "unsupported MySQL connection option '{}'",
                    other
                )))
            }
        };
    }

    if !has_host {
        return Err(ConnectFailure::handle("connection string has no host"));
    }
    Ok(options)
}

fn classify_sqlx_error(e: sqlx::Error) -> ConnectFailure {
    match e {
        sqlx::Error::Configuration(e) => ConnectFailure::handle(e.to_string()),
        sqlx::Error::Tls(e) => ConnectFailure::negotiation(e.to_string()),
        sqlx::Error::Protocol(msg) => ConnectFailure::negotiation(msg),
        other => classify_connect_error(other.to_string()),
    }
}

#[async_trait]
impl Driver for MysqlDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Mysql
    }

    async fn connect(
        &self,
        endpoint: &EndpointConfig,
    ) -> std::result::Result<Box<dyn Session>, ConnectFailure> {
        let pairs = conn_str::parse_pairs(&endpoint.connection_string())
            .map_err(|e| ConnectFailure::handle(e.to_string()))?;
        let options = connect_options(&pairs)?;

        let mut conn = options.connect().await.map_err(classify_sqlx_error)?;
        // TIMESTAMP columns come back in UTC, matching the watermark
        conn.execute("SET time_zone = '+00:00'")
            .await
            .map_err(classify_sqlx_error)?;

        info!(
            "Connected to MySQL {}:{}/{}",
            endpoint.host,
            endpoint.port(),
            endpoint.database
        );
        Ok(Box::new(MysqlSession {
            conn,
            query: String::new(),
        }))
    }
}

/// An open MySQL session.
pub struct MysqlSession {
    conn: MySqlConnection,
    /// Text of the query behind the current cursor.
    query: String,
}

fn db_error(context: &str, e: sqlx::Error) -> MigrateError {
    MigrateError::Database(format!("MySQL {}: {}", context, e))
}

#[async_trait]
impl Session for MysqlSession {
    fn kind(&self) -> DriverKind {
        DriverKind::Mysql
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn
            .execute(sql)
            .await
            .map(|_| ())
            .map_err(|e| db_error("execute", e))
    }

    async fn read_rows<'a>(&'a mut self, request: &ReadRequest) -> Result<RowCursor<'a>> {
        let (sql, after) = build_select(request)?;
        debug!("MySQL read: {}", sql);

        let Self { conn, query } = self;
        *query = sql;
        let query: &'a String = query;

        let (columns, types): (Vec<String>, Vec<String>) = {
            let statement = (&mut *conn)
                .prepare(query.as_str())
                .await
                .map_err(|e| db_error("prepare", e))?;
            statement
                .columns()
                .iter()
                .map(|c| (c.name().to_string(), c.type_info().name().to_string()))
                .unzip()
        };

        let mut q = sqlx::query(query.as_str());
        if let Some(ts) = after {
            q = q.bind(ts.naive_utc());
        }

        let rows = q
            .fetch(conn)
            .map(move |row| {
                let row = row.map_err(|e| db_error("cursor", e))?;
                Ok(types
                    .iter()
                    .enumerate()
                    .map(|(idx, type_name)| reader::convert_value(&row, idx, type_name))
                    .collect::<Row>())
            })
            .boxed();

        Ok(RowCursor { columns, rows })
    }

    async fn write_row(
        &mut self,
        table: &TableRef,
        _columns: &[String],
        _row: &Row,
    ) -> Result<WriteOutcome> {
        Err(MigrateError::Database(format!(
            "MySQL is only supported as a source (write to {})",
            table.display_name()
        )))
    }

    async fn close(&mut self) -> Result<()> {
        // Connection::close consumes the connection; ping-and-drop is enough
        self.conn.ping().await.ok();
        debug!("Closing MySQL session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionErrorKind;

    fn pairs(text: &str) -> HashMap<String, String> {
        conn_str::parse_pairs(text).unwrap()
    }

    #[test]
    fn test_connect_options_from_pairs() {
        let options = connect_options(&pairs(
            "host=my.local;port=3307;database=shop;user=app;password=x;ssl-mode=REQUIRED",
        ))
        .unwrap();
        assert_eq!(options.get_host(), "my.local");
        assert_eq!(options.get_port(), 3307);
        assert_eq!(options.get_database(), Some("shop"));
        assert_eq!(options.get_username(), "app");
    }

    #[test]
    fn test_ssl_mode_names() {
        assert!(matches!(ssl_mode("verify-identity"), Ok(MySqlSslMode::VerifyIdentity)));
        assert!(matches!(ssl_mode("preferred"), Ok(MySqlSslMode::Preferred)));
        assert_eq!(
            ssl_mode("always").unwrap_err().kind,
            ConnectionErrorKind::HandleAllocation
        );
    }

    #[test]
    fn test_connect_options_errors() {
        assert_eq!(
            connect_options(&pairs("database=shop")).unwrap_err().kind,
            ConnectionErrorKind::HandleAllocation
        );
        assert_eq!(
            connect_options(&pairs("host=h;port=99999")).unwrap_err().kind,
            ConnectionErrorKind::HandleAllocation
        );
    }
}
