//! MSSQL target driver, built on tiberius.
//!
//! The connection string is handed to tiberius' ADO.NET parser as is, so an
//! explicit `connection_string` in configuration reaches the server without
//! reinterpretation. Rows are written with parameterized INSERTs; server
//! errors that describe the row (constraint, conversion, truncation) become
//! [`WriteOutcome::Rejected`] or [`WriteOutcome::DuplicateKey`], everything
//! else ends the session.

mod writer;

pub use writer::{build_insert, classify_server_error, is_duplicate_key};

use async_trait::async_trait;
use tiberius::{Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use super::common::classify_connect_error;
use crate::config::{DriverKind, EndpointConfig};
use crate::connection::ConnectFailure;
use crate::core::identifier::qualify_for;
use crate::core::{Driver, ReadRequest, Row, RowCursor, Session, TableRef, WriteOutcome};
use crate::error::{MigrateError, Result};

type TdsClient = Client<Compat<TcpStream>>;

/// Connects MSSQL target sessions.
#[derive(Debug, Clone, Default)]
pub struct MssqlDriver;

impl MssqlDriver {
    pub fn new() -> Self {
        Self
    }
}

fn classify_tiberius_error(e: tiberius::error::Error) -> ConnectFailure {
    match e {
        tiberius::error::Error::Tls(msg) => ConnectFailure::negotiation(msg),
        tiberius::error::Error::Protocol(msg) => ConnectFailure::negotiation(msg.to_string()),
        other => classify_connect_error(other.to_string()),
    }
}

#[async_trait]
impl Driver for MssqlDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Mssql
    }

    async fn connect(
        &self,
        endpoint: &EndpointConfig,
    ) -> std::result::Result<Box<dyn Session>, ConnectFailure> {
        let config = Config::from_ado_string(&endpoint.connection_string())
            .map_err(|e| ConnectFailure::handle(e.to_string()))?;

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| ConnectFailure::connect(e.to_string()))?;
        tcp.set_nodelay(true).ok();

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(classify_tiberius_error)?;

        info!(
            "Connected to MSSQL {}:{}/{}",
            endpoint.host,
            endpoint.port(),
            endpoint.database
        );
        Ok(Box::new(MssqlSession {
            client: Some(client),
            identity_insert: None,
        }))
    }
}

/// An open MSSQL session.
pub struct MssqlSession {
    client: Option<TdsClient>,
    /// Table with IDENTITY_INSERT switched on. SQL Server allows one per
    /// session.
    identity_insert: Option<TableRef>,
}

fn db_error(context: &str, e: tiberius::error::Error) -> MigrateError {
    MigrateError::Database(format!("MSSQL {}: {}", context, e))
}

impl MssqlSession {
    fn client(&mut self) -> Result<&mut TdsClient> {
        self.client
            .as_mut()
            .ok_or_else(|| MigrateError::Database("MSSQL session is closed".to_string()))
    }

    async fn enable_identity_insert(&mut self, table: &TableRef) -> Result<()> {
        if let Some(previous) = self.identity_insert.take() {
            let sql = format!(
                "SET IDENTITY_INSERT {} OFF",
                qualify_for(DriverKind::Mssql, &previous.schema, &previous.name)?
            );
            self.client()?
                .execute(sql, &[])
                .await
                .map_err(|e| db_error("identity insert", e))?;
        }
        let sql = format!(
            "SET IDENTITY_INSERT {} ON",
            qualify_for(DriverKind::Mssql, &table.schema, &table.name)?
        );
        self.client()?
            .execute(sql, &[])
            .await
            .map_err(|e| db_error("identity insert", e))?;
        debug!("IDENTITY_INSERT on for {}", table.display_name());
        self.identity_insert = Some(table.clone());
        Ok(())
    }

    async fn insert(
        &mut self,
        sql: &str,
        row: &Row,
    ) -> std::result::Result<(), tiberius::error::Error> {
        let params: Vec<Box<dyn tiberius::ToSql>> = row.iter().map(writer::to_param).collect();
        let refs: Vec<&dyn tiberius::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        match self.client.as_mut() {
            Some(client) => client.execute(sql, &refs).await.map(|_| ()),
            None => Err(tiberius::error::Error::Io {
                kind: std::io::ErrorKind::NotConnected,
                message: "session is closed".to_string(),
            }),
        }
    }
}

fn outcome(result: std::result::Result<(), tiberius::error::Error>) -> Result<WriteOutcome> {
    match result {
        Ok(()) => Ok(WriteOutcome::Written),
        Err(tiberius::error::Error::Server(e)) => {
            match writer::classify_server_error(e.code(), e.class()) {
                Some(_) if writer::is_duplicate_key(e.code()) => Ok(WriteOutcome::DuplicateKey {
                    message: e.message().to_string(),
                }),
                Some(reason) => Ok(WriteOutcome::Rejected {
                    reason,
                    message: e.message().to_string(),
                }),
                None => Err(MigrateError::Database(format!(
                    "MSSQL insert: {}",
                    e.message()
                ))),
            }
        }
        Err(e) => Err(db_error("insert", e)),
    }
}

#[async_trait]
impl Session for MssqlSession {
    fn kind(&self) -> DriverKind {
        DriverKind::Mssql
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.client()?
            .execute(sql, &[])
            .await
            .map(|_| ())
            .map_err(|e| db_error("execute", e))
    }

    async fn read_rows<'a>(&'a mut self, request: &ReadRequest) -> Result<RowCursor<'a>> {
        Err(MigrateError::Database(format!(
            "MSSQL is only supported as a target (read from {})",
            request.table.display_name()
        )))
    }

    async fn write_row(
        &mut self,
        table: &TableRef,
        columns: &[String],
        row: &Row,
    ) -> Result<WriteOutcome> {
        let sql = build_insert(table, columns)?;
        match self.insert(&sql, row).await {
            Err(tiberius::error::Error::Server(e))
                if e.code() == writer::IDENTITY_INSERT_OFF
                    && self.identity_insert.as_ref() != Some(table) =>
            {
                self.enable_identity_insert(table).await?;
                outcome(self.insert(&sql, row).await)
            }
            result => outcome(result),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await.map_err(|e| db_error("close", e))?;
            debug!("Closed MSSQL session");
        }
        Ok(())
    }
}
