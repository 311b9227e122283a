//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transfer::ValueTransform;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database (MySQL or PostgreSQL).
    pub source: EndpointConfig,

    /// Target database (MSSQL).
    pub target: EndpointConfig,

    /// Connect timeout and retry behaviour.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// DDL translation options.
    #[serde(default)]
    pub translation: TranslationConfig,

    /// Conflict resolution options.
    #[serde(default)]
    pub conflicts: ConflictConfig,

    /// Recurring run registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,
}

/// Database engine a connection endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Postgres,
    Mysql,
    Mssql,
    /// In-process tables, used for dry runs and tests.
    Memory,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Postgres => "postgres",
            DriverKind::Mysql => "mysql",
            DriverKind::Mssql => "mssql",
            DriverKind::Memory => "memory",
        }
    }

    /// Default TCP port for the engine.
    pub fn default_port(&self) -> u16 {
        match self {
            DriverKind::Postgres => 5432,
            DriverKind::Mysql => 3306,
            DriverKind::Mssql => 1433,
            DriverKind::Memory => 0,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a database is hosted. Only changes how the connection string is
/// assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    #[default]
    OnPremise,
    #[serde(alias = "aws_rds")]
    Aws,
    #[serde(alias = "azure_sql")]
    Azure,
    #[serde(alias = "gcp_cloud_sql", alias = "google_cloud_sql")]
    Gcp,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OnPremise => "on_premise",
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
        }
    }

    /// Managed cloud services only accept encrypted sessions.
    pub fn requires_encryption(&self) -> bool {
        !matches!(self, Provider::OnPremise)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of the migration.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Database engine.
    pub driver: DriverKind,

    /// Hosting provider (default: on_premise).
    #[serde(default)]
    pub provider: Provider,

    /// Database host.
    #[serde(default)]
    pub host: String,

    /// Database port (default depends on driver).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    #[serde(default)]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema holding the migrated tables (default: driver specific).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Force encryption on or off. Cloud providers always encrypt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,

    /// Accept the server certificate without verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_server_cert: Option<bool>,

    /// PostgreSQL sslmode (disable, require, verify-ca, verify-full).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<String>,

    /// Raw connection string, passed to the driver untouched when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
}

impl EndpointConfig {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.driver.default_port())
    }

    /// Effective schema name.
    pub fn schema(&self) -> &str {
        match (&self.schema, self.driver) {
            (Some(s), _) => s,
            (None, DriverKind::Mssql) => "dbo",
            (None, DriverKind::Postgres) => "public",
            (None, _) => "",
        }
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("driver", &self.driver)
            .field("provider", &self.provider)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("ssl_mode", &self.ssl_mode)
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Connection acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Per-attempt connect timeout in seconds (default: 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Extra attempts after a retryable failure (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff between attempts, doubled each retry (default: 500).
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

/// Migration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Apply the translated schema and copy every row.
    #[default]
    Full,

    /// Copy rows modified after the stored watermark.
    Incremental,
}

/// What happens to the watermark when some rows of an incremental pass fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkPolicy {
    /// Stop below the earliest failed row so it is selected again next run.
    #[default]
    HoldAtFailure,

    /// Advance past every transferred row; failed rows are only reported.
    AdvancePastFailures,
}

/// Per-table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name (unqualified).
    pub name: String,

    /// Columns to copy (default: all).
    #[serde(default)]
    pub columns: Vec<String>,

    /// Modification timestamp column, overriding `migration.watermark_column`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_column: Option<String>,

    /// Value transforms applied per column before writing.
    #[serde(default)]
    pub transforms: BTreeMap<String, ValueTransform>,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Full or incremental (default: full).
    #[serde(default)]
    pub mode: MigrationMode,

    /// Tables whose rows are copied.
    #[serde(default)]
    pub tables: Vec<TableConfig>,

    /// Tables transferred concurrently, each with its own connections (default: 1).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Modification timestamp column (default: last_modified).
    #[serde(default = "default_watermark_column")]
    pub watermark_column: String,

    /// Watermark behaviour when rows fail (default: hold_at_failure).
    #[serde(default)]
    pub watermark_policy: WatermarkPolicy,

    /// Directory holding per-table watermark files.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Treat any failed row as a failed run (default: false).
    #[serde(default)]
    pub fail_on_row_errors: bool,

    /// Row failures kept with their reason per table (default: 100).
    #[serde(default = "default_max_recorded_failures")]
    pub max_recorded_failures: usize,

    /// Execute the translated DDL on the target. Defaults to true for full
    /// runs and false for incremental runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_schema: Option<bool>,
}

impl MigrationConfig {
    /// Whether the translated DDL is applied in this mode.
    pub fn should_apply_schema(&self) -> bool {
        self.apply_schema
            .unwrap_or(self.mode == MigrationMode::Full)
    }

    /// Watermark column for `table`.
    pub fn watermark_column_for<'a>(&'a self, table: &'a TableConfig) -> &'a str {
        table
            .watermark_column
            .as_deref()
            .unwrap_or(&self.watermark_column)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            mode: MigrationMode::default(),
            tables: Vec::new(),
            workers: default_workers(),
            watermark_column: default_watermark_column(),
            watermark_policy: WatermarkPolicy::default(),
            state_dir: default_state_dir(),
            fail_on_row_errors: false,
            max_recorded_failures: default_max_recorded_failures(),
            apply_schema: None,
        }
    }
}

/// A user supplied rewrite, run after the built-in rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRule {
    /// Name used in logs.
    pub name: String,
    /// Regular expression, matched case-insensitively.
    pub pattern: String,
    /// Replacement template (`$1` style captures allowed).
    pub replacement: String,
}

/// DDL translation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Schema used to qualify routines (default: dbo).
    #[serde(default = "default_dbo_schema")]
    pub routine_schema: String,

    /// Rules appended after the built-in rule set.
    #[serde(default)]
    pub extra_rules: Vec<CustomRule>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            routine_schema: default_dbo_schema(),
            extra_rules: Vec::new(),
        }
    }
}

/// Conflict resolution options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Known renames, source identifier to target identifier.
    #[serde(default)]
    pub renames: BTreeMap<String, String>,

    /// Existing target DDL to compare against instead of the translation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_schema_file: Option<PathBuf>,
}

/// Recurring run registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Five-field cron expression (default: daily at midnight).
    #[serde(default = "default_cron")]
    pub cron: String,

    /// Command the scheduler runs.
    pub command: String,
}

// Default value functions for serde
fn default_connect_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_workers() -> usize {
    1
}

fn default_watermark_column() -> String {
    "last_modified".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".ddl-migrate-state")
}

fn default_max_recorded_failures() -> usize {
    100
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_cron() -> String {
    "0 0 * * *".to_string()
}
