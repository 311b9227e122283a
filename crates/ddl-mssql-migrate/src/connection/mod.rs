//! Connection acquisition and release.
//!
//! [`ConnectionManager::open`] turns an endpoint into an owned
//! [`ConnectionHandle`]. Each attempt is bounded by the configured connect
//! timeout; failures are classified into four [`ConnectionErrorKind`]s and
//! only [`ConnectionErrorKind::DriverConnect`] is retried, with exponential
//! backoff.

pub mod conn_str;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, DriverKind, EndpointConfig, Provider};
use crate::core::{DriverCatalog, Session};
use crate::error::{MigrateError, Result};

/// Why a connection could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionErrorKind {
    /// No driver for the engine, or its client environment (TLS, runtime
    /// configuration) could not be built.
    EnvironmentAllocation,
    /// Protocol or TLS version negotiation with the server failed.
    VersionNegotiation,
    /// The connection string could not be turned into a connection handle.
    HandleAllocation,
    /// Network, login or timeout failure.
    DriverConnect,
}

impl ConnectionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionErrorKind::EnvironmentAllocation => "environment_allocation",
            ConnectionErrorKind::VersionNegotiation => "version_negotiation",
            ConnectionErrorKind::HandleAllocation => "handle_allocation",
            ConnectionErrorKind::DriverConnect => "driver_connect",
        }
    }

    /// Only transient connect failures are worth another attempt; the rest
    /// are configuration problems.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectionErrorKind::DriverConnect)
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the migration a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Target,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Target => "target",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection that could not be opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{role} connection ({provider}) failed with {kind}: {message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub role: Role,
    pub provider: Provider,
    pub message: String,
}

impl ConnectionError {
    pub fn new(
        kind: ConnectionErrorKind,
        role: Role,
        provider: Provider,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            role,
            provider,
            message: message.into(),
        }
    }
}

/// A single failed attempt, as reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

impl ConnectFailure {
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn environment(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::EnvironmentAllocation, message)
    }

    pub fn negotiation(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::VersionNegotiation, message)
    }

    pub fn handle(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::HandleAllocation, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::DriverConnect, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Open,
    /// The session broke; it is dropped without a graceful close.
    Failed,
    Closed,
}

/// An open session, owned by whoever opened it.
///
/// The session is released exactly once: by [`ConnectionHandle::close`] or,
/// failing that, when the handle is dropped.
pub struct ConnectionHandle {
    role: Role,
    provider: Provider,
    driver: DriverKind,
    session: Option<Box<dyn Session>>,
    state: HandleState,
}

impl ConnectionHandle {
    pub(crate) fn new(
        role: Role,
        provider: Provider,
        driver: DriverKind,
        session: Box<dyn Session>,
    ) -> Self {
        Self {
            role,
            provider,
            driver,
            session: Some(session),
            state: HandleState::Open,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    /// The live session.
    pub fn session(&mut self) -> Result<&mut (dyn Session + 'static)> {
        match (self.state, self.session.as_deref_mut()) {
            (HandleState::Open, Some(session)) => Ok(session),
            _ => Err(MigrateError::State(format!(
                "{} connection is no longer open",
                self.role
            ))),
        }
    }

    /// Mark the session as broken. A later `close` releases it without
    /// talking to the server.
    pub fn mark_failed(&mut self) {
        if self.state == HandleState::Open {
            self.state = HandleState::Failed;
        }
    }

    /// Release the session. Returns false if it was already released.
    pub async fn close(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        if self.state == HandleState::Open {
            if let Err(e) = session.close().await {
                warn!("Closing {} connection: {}", self.role, e);
            }
        }
        self.state = HandleState::Closed;
        debug!("Released {} connection ({})", self.role, self.driver);
        true
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            debug!(
                "Dropping unreleased {} connection ({})",
                self.role, self.driver
            );
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("role", &self.role)
            .field("provider", &self.provider)
            .field("driver", &self.driver)
            .field("state", &self.state)
            .finish()
    }
}

/// Opens connections through the drivers in a [`DriverCatalog`].
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    catalog: Arc<DriverCatalog>,
    settings: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(catalog: Arc<DriverCatalog>, settings: ConnectionConfig) -> Self {
        Self { catalog, settings }
    }

    pub fn catalog(&self) -> &DriverCatalog {
        &self.catalog
    }

    /// Open a connection to `endpoint` for `role`.
    pub async fn open(
        &self,
        role: Role,
        endpoint: &EndpointConfig,
    ) -> std::result::Result<ConnectionHandle, ConnectionError> {
        let fail = |failure: ConnectFailure| {
            let err = ConnectionError::new(failure.kind, role, endpoint.provider, failure.message);
            error!("{}", err);
            err
        };

        let driver = self.catalog.driver(endpoint.driver).ok_or_else(|| {
            fail(ConnectFailure::environment(format!(
                "no driver registered for '{}'",
                endpoint.driver
            )))
        })?;

        let timeout = self.settings.connect_timeout();
        let mut backoff = self.settings.retry_backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(
                "Connecting {} ({} on {}), attempt {}",
                role, endpoint.driver, endpoint.provider, attempt
            );

            let outcome = match tokio::time::timeout(timeout, driver.connect(endpoint)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ConnectFailure::connect(format!(
                    "timed out after {}s",
                    timeout.as_secs_f64()
                ))),
            };

            match outcome {
                Ok(session) => {
                    info!(
                        "Opened {} connection ({} on {})",
                        role, endpoint.driver, endpoint.provider
                    );
                    return Ok(ConnectionHandle::new(
                        role,
                        endpoint.provider,
                        endpoint.driver,
                        session,
                    ));
                }
                Err(failure)
                    if failure.kind.is_retryable() && attempt <= self.settings.max_retries =>
                {
                    warn!(
                        "{} connection attempt {} failed: {}; retrying in {}ms",
                        role,
                        attempt,
                        failure.message,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(failure) => return Err(fail(failure)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Driver, ReadRequest, RowCursor, TableRef, WriteOutcome};
    use crate::core::Row;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct NullSession {
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Session for NullSession {
        fn kind(&self) -> DriverKind {
            DriverKind::Memory
        }

        async fn execute(&mut self, _sql: &str) -> Result<()> {
            Ok(())
        }

        async fn read_rows<'a>(&'a mut self, _request: &ReadRequest) -> Result<RowCursor<'a>> {
            Ok(RowCursor {
                columns: Vec::new(),
                rows: Box::pin(futures::stream::empty()),
            })
        }

        async fn write_row(
            &mut self,
            _table: &TableRef,
            _columns: &[String],
            _row: &Row,
        ) -> Result<WriteOutcome> {
            Ok(WriteOutcome::Written)
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails the first `failures` attempts with `kind`, optionally hangs.
    struct ScriptedDriver {
        kind: ConnectionErrorKind,
        failures: u32,
        hang: bool,
        attempts: Arc<AtomicU32>,
        closes: Arc<AtomicU32>,
    }

    impl ScriptedDriver {
        fn new(kind: ConnectionErrorKind, failures: u32) -> Self {
            Self {
                kind,
                failures,
                hang: false,
                attempts: Arc::new(AtomicU32::new(0)),
                closes: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::Memory
        }

        async fn connect(
            &self,
            _endpoint: &EndpointConfig,
        ) -> std::result::Result<Box<dyn Session>, ConnectFailure> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if n < self.failures {
                return Err(ConnectFailure::new(self.kind, "scripted failure"));
            }
            Ok(Box::new(NullSession {
                closes: self.closes.clone(),
            }))
        }
    }

    fn endpoint() -> EndpointConfig {
        EndpointConfig {
            driver: DriverKind::Memory,
            provider: Provider::Gcp,
            host: String::new(),
            port: None,
            database: "mem".into(),
            user: String::new(),
            password: String::new(),
            schema: None,
            encrypt: None,
            trust_server_cert: None,
            ssl_mode: None,
            connection_string: None,
        }
    }

    fn settings(max_retries: u32) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout_secs: 5,
            max_retries,
            retry_backoff_ms: 1,
        }
    }

    fn manager(driver: ScriptedDriver, settings: ConnectionConfig) -> ConnectionManager {
        let mut catalog = DriverCatalog::new();
        catalog.register(Arc::new(driver));
        ConnectionManager::new(Arc::new(catalog), settings)
    }

    #[tokio::test]
    async fn test_driver_connect_is_retried() {
        let driver = ScriptedDriver::new(ConnectionErrorKind::DriverConnect, 2);
        let attempts = driver.attempts.clone();
        let handle = manager(driver, settings(3))
            .open(Role::Source, &endpoint())
            .await
            .unwrap();
        assert!(handle.is_open());
        assert_eq!(handle.provider(), Provider::Gcp);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let driver = ScriptedDriver::new(ConnectionErrorKind::DriverConnect, 10);
        let attempts = driver.attempts.clone();
        let err = manager(driver, settings(2))
            .open(Role::Target, &endpoint())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::DriverConnect);
        assert_eq!(err.role, Role::Target);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_configuration_failures_fail_fast() {
        for kind in [
            ConnectionErrorKind::EnvironmentAllocation,
            ConnectionErrorKind::VersionNegotiation,
            ConnectionErrorKind::HandleAllocation,
        ] {
            let driver = ScriptedDriver::new(kind, 1);
            let attempts = driver.attempts.clone();
            let err = manager(driver, settings(5))
                .open(Role::Source, &endpoint())
                .await
                .unwrap_err();
            assert_eq!(err.kind, kind);
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_timeout_is_driver_connect() {
        let mut driver = ScriptedDriver::new(ConnectionErrorKind::DriverConnect, 0);
        driver.hang = true;
        let mut settings = settings(0);
        settings.connect_timeout_secs = 0;
        let err = manager(driver, settings)
            .open(Role::Source, &endpoint())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::DriverConnect);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_driver_is_environment_failure() {
        let manager = ConnectionManager::new(Arc::new(DriverCatalog::new()), settings(3));
        let err = manager.open(Role::Source, &endpoint()).await.unwrap_err();
        assert_eq!(err.kind, ConnectionErrorKind::EnvironmentAllocation);
    }

    #[tokio::test]
    async fn test_close_releases_exactly_once() {
        let driver = ScriptedDriver::new(ConnectionErrorKind::DriverConnect, 0);
        let closes = driver.closes.clone();
        let mut handle = manager(driver, settings(0))
            .open(Role::Target, &endpoint())
            .await
            .unwrap();

        assert!(handle.close().await);
        assert!(!handle.close().await);
        assert!(handle.session().is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_handle_closes_without_server_round_trip() {
        let driver = ScriptedDriver::new(ConnectionErrorKind::DriverConnect, 0);
        let closes = driver.closes.clone();
        let mut handle = manager(driver, settings(0))
            .open(Role::Target, &endpoint())
            .await
            .unwrap();

        handle.mark_failed();
        assert!(!handle.is_open());
        assert!(handle.close().await);
        assert!(!handle.close().await);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_message_has_context() {
        let err = ConnectionError::new(
            ConnectionErrorKind::HandleAllocation,
            Role::Source,
            Provider::Aws,
            "bad option",
        );
        let text = err.to_string();
        assert!(text.contains("source"));
        assert!(text.contains("aws"));
        assert!(text.contains("handle_allocation"));
    }
}
