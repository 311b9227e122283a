//! Configuration loading, validation and connection-string assembly.

mod types;
mod validation;

pub use types::*;

use crate::connection::conn_str;
use crate::error::{MigrateError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| MigrateError::file_access(path, e))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Signing key for watermark files: a SHA256 of the source and target
    /// identity (driver, host, database, schema). Edits elsewhere in the
    /// configuration keep existing watermarks valid.
    pub fn state_key(&self) -> String {
        let mut hasher = Sha256::new();
        for endpoint in [&self.source, &self.target] {
            for part in [
                endpoint.driver.as_str(),
                endpoint.host.as_str(),
                endpoint.database.as_str(),
                endpoint.schema.as_deref().unwrap_or_default(),
            ] {
                hasher.update(part.as_bytes());
                hasher.update([0u8]);
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

impl EndpointConfig {
    /// Assemble the `key=value;` connection string handed to the driver.
    ///
    /// An explicit `connection_string` wins and is passed through as is.
    pub fn connection_string(&self) -> String {
        if let Some(raw) = &self.connection_string {
            return raw.clone();
        }

        let cloud = self.provider.requires_encryption();
        let host = self.host.as_str();
        let port = self.port().to_string();

        let pairs: Vec<(&str, String)> = match self.driver {
            DriverKind::Mssql => {
                let encrypt = cloud || self.encrypt.unwrap_or(false);
                let trust = match self.provider {
                    // Azure SQL presents a publicly trusted certificate
                    Provider::Azure => self.trust_server_cert.unwrap_or(false),
                    _ => self.trust_server_cert.unwrap_or(true),
                };
                let user = match self.provider {
                    Provider::Azure if !self.user.contains('@') => {
                        let server = host.split('.').next().unwrap_or(host);
                        format!("{}@{}", self.user, server)
                    }
                    _ => self.user.clone(),
                };
                vec![
                    ("Server", format!("tcp:{},{}", host, port)),
                    ("Database", self.database.clone()),
                    ("User Id", user),
                    ("Password", self.password.clone()),
                    ("Encrypt", encrypt.to_string()),
                    ("TrustServerCertificate", trust.to_string()),
                ]
            }
            DriverKind::Postgres => {
                let ssl_mode = match &self.ssl_mode {
                    Some(mode) if !(cloud && mode.eq_ignore_ascii_case("disable")) => mode.clone(),
                    _ if cloud => "require".to_string(),
                    _ => "disable".to_string(),
                };
                vec![
                    ("host", host.to_string()),
                    ("port", port),
                    ("dbname", self.database.clone()),
                    ("user", self.user.clone()),
                    ("password", self.password.clone()),
                    ("sslmode", ssl_mode),
                ]
            }
            DriverKind::Mysql => {
                let ssl_mode = if cloud || self.encrypt == Some(true) {
                    "REQUIRED"
                } else {
                    "PREFERRED"
                };
                vec![
                    ("host", host.to_string()),
                    ("port", port),
                    ("database", self.database.clone()),
                    ("user", self.user.clone()),
                    ("password", self.password.clone()),
                    ("ssl-mode", ssl_mode.to_string()),
                ]
            }
            DriverKind::Memory => vec![("database", self.database.clone())],
        };

        conn_str::format_pairs(&pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(driver: DriverKind, provider: Provider) -> EndpointConfig {
        EndpointConfig {
            driver,
            provider,
            host: "db1.example.net".to_string(),
            port: None,
            database: "sales".to_string(),
            user: "migrator".to_string(),
            password: "p;w".to_string(),
            schema: None,
            encrypt: None,
            trust_server_cert: None,
            ssl_mode: None,
            connection_string: None,
        }
    }

    #[test]
    fn test_mssql_on_premise_connection_string() {
        let cs = endpoint(DriverKind::Mssql, Provider::OnPremise).connection_string();
        let pairs = conn_str::parse_pairs(&cs).unwrap();
        assert_eq!(pairs.get("server").unwrap(), "tcp:db1.example.net,1433");
        assert_eq!(pairs.get("encrypt").unwrap(), "false");
        assert_eq!(pairs.get("password").unwrap(), "p;w");
        assert_eq!(pairs.get("user id").unwrap(), "migrator");
    }

    #[test]
    fn test_mssql_azure_uses_login_suffix_and_encryption() {
        let cs = endpoint(DriverKind::Mssql, Provider::Azure).connection_string();
        let pairs = conn_str::parse_pairs(&cs).unwrap();
        assert_eq!(pairs.get("user id").unwrap(), "migrator@db1");
        assert_eq!(pairs.get("encrypt").unwrap(), "true");
        assert_eq!(pairs.get("trustservercertificate").unwrap(), "false");
    }

    #[test]
    fn test_postgres_cloud_forces_ssl() {
        let mut ep = endpoint(DriverKind::Postgres, Provider::Gcp);
        ep.ssl_mode = Some("disable".to_string());
        let pairs = conn_str::parse_pairs(&ep.connection_string()).unwrap();
        assert_eq!(pairs.get("sslmode").unwrap(), "require");
        assert_eq!(pairs.get("port").unwrap(), "5432");

        let on_prem = endpoint(DriverKind::Postgres, Provider::OnPremise);
        let pairs = conn_str::parse_pairs(&on_prem.connection_string()).unwrap();
        assert_eq!(pairs.get("sslmode").unwrap(), "disable");
    }

    #[test]
    fn test_mysql_aws_requires_ssl() {
        let pairs =
            conn_str::parse_pairs(&endpoint(DriverKind::Mysql, Provider::Aws).connection_string())
                .unwrap();
        assert_eq!(pairs.get("ssl-mode").unwrap(), "REQUIRED");
        assert_eq!(pairs.get("port").unwrap(), "3306");
    }

    #[test]
    fn test_raw_connection_string_passes_through() {
        let mut ep = endpoint(DriverKind::Mssql, Provider::Aws);
        ep.connection_string = Some("whatever the driver wants".to_string());
        assert_eq!(ep.connection_string(), "whatever the driver wants");
    }

    #[test]
    fn test_endpoint_debug_redacts_password() {
        let mut ep = endpoint(DriverKind::Mssql, Provider::OnPremise);
        ep.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", ep);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }

    #[test]
    fn test_from_yaml_defaults() {
        let yaml = r#"
source:
  driver: postgres
  host: pg.local
  database: app
  user: reader
target:
  driver: mssql
  provider: azure_sql
  host: sqlsrv.database.windows.net
  database: app
  user: writer
migration:
  tables:
    - name: users
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.target.provider, Provider::Azure);
        assert_eq!(config.migration.mode, MigrationMode::Full);
        assert_eq!(config.migration.watermark_column, "last_modified");
        assert_eq!(config.migration.workers, 1);
        assert!(config.migration.should_apply_schema());
        assert_eq!(config.translation.routine_schema, "dbo");
        assert_eq!(config.connection.connect_timeout_secs, 30);
        assert!(config.schedule.is_none());
    }

    #[test]
    fn test_state_key_follows_endpoint_identity() {
        let yaml = r#"
source: { driver: mysql, host: a, database: d, user: u }
target: { driver: mssql, host: b, database: d, user: u }
"#;
        let a = Config::from_yaml(yaml).unwrap();
        let mut b = a.clone();
        assert_eq!(a.state_key(), b.state_key());

        b.migration.workers = 4;
        b.source.password = "rotated".into();
        b.schedule = Some(ScheduleConfig {
            cron: "0 2 * * *".into(),
            command: "sync".into(),
        });
        assert_eq!(a.state_key(), b.state_key());

        b.target.database = "other".into();
        assert_ne!(a.state_key(), b.state_key());

        let mut c = a.clone();
        c.source.schema = Some("sales".into());
        assert_ne!(a.state_key(), c.state_key());
    }
}
