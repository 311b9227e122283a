//! PostgreSQL source driver.
//!
//! One `tokio_postgres` client per session, its connection task spawned on
//! the runtime. Rows are streamed with `query_raw`, so the server sends them
//! as the cursor is consumed rather than materializing the result.

mod reader;

pub use reader::build_select;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::{debug, info, warn};

use super::common::{classify_connect_error, pg_connector, SslMode};
use crate::config::{DriverKind, EndpointConfig};
use crate::connection::{conn_str, ConnectFailure};
use crate::core::{Driver, ReadRequest, Row, RowCursor, Session, TableRef, WriteOutcome};
use crate::error::{MigrateError, Result};

/// Connects PostgreSQL source sessions.
#[derive(Debug, Clone, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

/// Turn connection-string pairs into a client config and TLS mode.
fn client_config(
    pairs: &HashMap<String, String>,
) -> std::result::Result<(PgConfig, SslMode), ConnectFailure> {
    let mut config = PgConfig::new();
    let mut ssl_mode = SslMode::Disable;

    for (key, value) in pairs {
        match key.as_str() {
            "host" | "server" => {
                config.host(value);
            }
            "port" => {
                let port = value.parse::<u16>().map_err(|_| {
                    ConnectFailure::handle(format!("invalid port '{}'", value))
                })?;
                config.port(port);
            }
            "dbname" | "database" => {
                config.dbname(value);
            }
            "user" | "username" | "user id" => {
                config.user(value);
            }
            "password" => {
                config.password(value);
            }
            "application_name" => {
                config.application_name(value);
            }
            "sslmode" => {
                ssl_mode =
                    SslMode::parse(value).map_err(|e| ConnectFailure::handle(e.to_string()))?;
            }
            other => {
                return Err(ConnectFailure::handle(format!(
                    "unsupported PostgreSQL connection option '{}'",
                    other
                )))
            }
        }
    }

    if config.get_hosts().is_empty() {
        return Err(ConnectFailure::handle("connection string has no host"));
    }
    if config.get_application_name().is_none() {
        config.application_name("ddl-mssql-migrate");
    }
    Ok((config, ssl_mode))
}

#[async_trait]
impl Driver for PostgresDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn connect(
        &self,
        endpoint: &EndpointConfig,
    ) -> std::result::Result<Box<dyn Session>, ConnectFailure> {
        let pairs = conn_str::parse_pairs(&endpoint.connection_string())
            .map_err(|e| ConnectFailure::handle(e.to_string()))?;
        let (config, ssl_mode) = client_config(&pairs)?;

        let tls = pg_connector(ssl_mode)?;

        let client = match tls {
            Some(connector) => {
                let (client, connection) = config
                    .connect(connector)
                    .await
                    .map_err(|e| classify_connect_error(e.to_string()))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("PostgreSQL connection closed: {}", e);
                    }
                });
                client
            }
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let (client, connection) = config
                    .connect(NoTls)
                    .await
                    .map_err(|e| classify_connect_error(e.to_string()))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("PostgreSQL connection closed: {}", e);
                    }
                });
                client
            }
        };

        // watermark comparisons against `timestamp` columns assume UTC
        client
            .batch_execute("SET TIME ZONE 'UTC'")
            .await
            .map_err(|e| classify_connect_error(e.to_string()))?;

        info!(
            "Connected to PostgreSQL {}:{}/{} (sslmode={})",
            endpoint.host,
            endpoint.port(),
            endpoint.database,
            ssl_mode.as_str()
        );
        Ok(Box::new(PostgresSession { client }))
    }
}

/// An open PostgreSQL session.
pub struct PostgresSession {
    client: Client,
}

fn db_error(context: &str, e: tokio_postgres::Error) -> MigrateError {
    MigrateError::Database(format!("PostgreSQL {}: {}", context, e))
}

#[async_trait]
impl Session for PostgresSession {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| db_error("execute", e))
    }

    async fn read_rows<'a>(&'a mut self, request: &ReadRequest) -> Result<RowCursor<'a>> {
        let (sql, after) = build_select(request)?;
        debug!("PostgreSQL read: {}", sql);

        let statement = self
            .client
            .prepare(&sql)
            .await
            .map_err(|e| db_error("prepare", e))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let types: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.type_().name().to_string())
            .collect();

        let params: Vec<chrono::DateTime<chrono::Utc>> = after.into_iter().collect();
        let stream = self
            .client
            .query_raw(&statement, params.iter())
            .await
            .map_err(|e| db_error("query", e))?;

        let rows = stream
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
            "PostgreSQL is only supported as a source (write to {})",
            table.display_name()
        )))
    }

    async fn close(&mut self) -> Result<()> {
        // dropping the client ends the connection task
        debug!("Closing PostgreSQL session");
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
    fn test_client_config_from_pairs() {
        let (config, ssl) = client_config(&pairs(
            "host=pg.local;port=6432;dbname=app;user=reader;password=\"a;b\";sslmode=require",
        ))
        .unwrap();
        assert_eq!(config.get_ports(), &[6432]);
        assert_eq!(config.get_dbname(), Some("app"));
        assert_eq!(config.get_user(), Some("reader"));
        assert_eq!(config.get_password(), Some("a;b".as_bytes()));
        assert_eq!(ssl, SslMode::Require);
    }

    #[test]
    fn test_client_config_rejects_bad_options() {
        let err = client_config(&pairs("host=pg;port=nope")).unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::HandleAllocation);

        let err = client_config(&pairs("host=pg;flux=1")).unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::HandleAllocation);

        let err = client_config(&pairs("dbname=app")).unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::HandleAllocation);

        let err = client_config(&pairs("host=pg;sslmode=sometimes")).unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::HandleAllocation);
    }
}
