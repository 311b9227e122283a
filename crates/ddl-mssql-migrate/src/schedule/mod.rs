//! Recurring run registration.
//!
//! The orchestrator hands a [`ScheduleRequest`] to a [`JobRegistrar`] once all
//! data work has finished. Registration is fire-and-forget: nothing here
//! tracks the runs the scheduler starts later.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{MigrateError, Result};

/// A validated crontab entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    cron_expression: String,
    command: String,
}

impl ScheduleRequest {
    /// Checks the expression has the five whitespace-separated fields
    /// crontab expects and the command is not empty. Field values are not
    /// interpreted.
    pub fn new(cron_expression: &str, command: &str) -> Result<Self> {
        let fields: Vec<&str> = cron_expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(MigrateError::Config(format!(
                "cron expression '{}' must have 5 fields, found {}",
                cron_expression.trim(),
                fields.len()
            )));
        }
        let command = command.trim();
        if command.is_empty() {
            return Err(MigrateError::Config(
                "schedule command cannot be empty".into(),
            ));
        }
        if command.contains('\n') {
            return Err(MigrateError::Config(
                "schedule command must be a single line".into(),
            ));
        }
        Ok(Self {
            cron_expression: fields.join(" "),
            command: command.to_string(),
        })
    }

    pub fn cron_expression(&self) -> &str {
        &self.cron_expression
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// The line added to the crontab.
    pub fn crontab_line(&self) -> String {
        format!("{} {}", self.cron_expression, self.command)
    }
}

/// Registers recurring jobs with an OS scheduler.
#[async_trait]
pub trait JobRegistrar: Send + Sync {
    async fn register(&self, request: &ScheduleRequest) -> Result<()>;
}

/// Appends to the current user's crontab via the `crontab` binary.
///
/// Entries are appended as is; registering the same request twice leaves
/// two lines.
#[derive(Debug, Clone)]
pub struct CrontabRegistrar {
    program: String,
}

impl Default for CrontabRegistrar {
    fn default() -> Self {
        Self {
            program: "crontab".to_string(),
        }
    }
}

impl CrontabRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different `crontab` executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn current(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("-l")
            .output()
            .await
            .map_err(|e| MigrateError::Schedule(format!("cannot run {} -l: {}", self.program, e)))?;

        // only "no crontab for <user>" means the table is empty
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.to_ascii_lowercase().contains("no crontab") {
                debug!("{} -l: {}", self.program, stderr);
                return Ok(String::new());
            }
            return Err(MigrateError::Schedule(format!(
                "{} -l exited with {}: {}",
                self.program, output.status, stderr
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| MigrateError::Schedule(format!("crontab is not UTF-8: {}", e)))
    }

    async fn install(&self, table: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| MigrateError::Schedule(format!("cannot run {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(table.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(MigrateError::Schedule(format!(
                "{} rejected the new table: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Append `line` to crontab `text`, keeping exactly one trailing newline.
fn append_line(text: &str, line: &str) -> String {
    let mut out = text.trim_end_matches('\n').to_string();
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    out
}

#[async_trait]
impl JobRegistrar for CrontabRegistrar {
    async fn register(&self, request: &ScheduleRequest) -> Result<()> {
        let current = self.current().await?;
        let updated = append_line(&current, &request.crontab_line());
        self.install(&updated).await?;
        info!("Registered recurring run: {}", request.crontab_line());
        Ok(())
    }
}

/// Records requests instead of touching the OS. For dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingRegistrar {
    requests: Mutex<Vec<ScheduleRequest>>,
}

impl RecordingRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ScheduleRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl JobRegistrar for RecordingRegistrar {
    async fn register(&self, request: &ScheduleRequest) -> Result<()> {
        let mut requests = self
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        requests.push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let req = ScheduleRequest::new("0  2 * *   *", "ddl-mssql-migrate migrate x.sql").unwrap();
        assert_eq!(req.cron_expression(), "0 2 * * *");
        assert_eq!(req.crontab_line(), "0 2 * * * ddl-mssql-migrate migrate x.sql");

        assert!(ScheduleRequest::new("0 2 * *", "cmd").is_err());
        assert!(ScheduleRequest::new("0 2 * * * *", "cmd").is_err());
        assert!(ScheduleRequest::new("", "cmd").is_err());
        assert!(ScheduleRequest::new("0 2 * * *", "   ").is_err());
        assert!(ScheduleRequest::new("0 2 * * *", "a\nb").is_err());
    }

    #[test]
    fn test_cron_fields_are_not_interpreted() {
        assert!(ScheduleRequest::new("@x 99 foo bar baz", "cmd").is_ok());
    }

    #[test]
    fn test_append_line() {
        assert_eq!(append_line("", "a"), "a\n");
        assert_eq!(append_line("x\n", "a"), "x\na\n");
        assert_eq!(append_line("x\n\n", "a"), "x\na\n");
        // no de-duplication
        assert_eq!(append_line("a\n", "a"), "a\na\n");
    }

    #[tokio::test]
    async fn test_recording_registrar() {
        let registrar = RecordingRegistrar::new();
        let req = ScheduleRequest::new("*/5 * * * *", "sync").unwrap();
        registrar.register(&req).await.unwrap();
        registrar.register(&req).await.unwrap();
        assert_eq!(registrar.requests(), vec![req.clone(), req]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crontab_registrar_appends() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let store = dir.path().join("crontab.txt");
        let script = dir.path().join("fake-crontab");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nif [ \"$1\" = \"-l\" ]; then\n  [ -f '{0}' ] || {{ echo 'no crontab' >&2; exit 1; }}\n  cat '{0}'\nelse\n  cat > '{0}'\nfi\n",
                store.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let registrar = CrontabRegistrar::with_program(script.display().to_string());
        let req = ScheduleRequest::new("0 3 * * *", "run-sync").unwrap();
        registrar.register(&req).await.unwrap();
        registrar.register(&req).await.unwrap();

        let content = std::fs::read_to_string(&store).unwrap();
        assert_eq!(content, "0 3 * * * run-sync\n0 3 * * * run-sync\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crontab_list_failure_keeps_existing_table() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let installed = dir.path().join("installed.txt");
        let script = dir.path().join("broken-crontab");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh
if [ \"$1\" = \"-l\" ]; then
  echo 'crontab: cannot open spool: Permission denied' >&2
  exit 1
fi
cat > '{}'
",
                installed.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let registrar = CrontabRegistrar::with_program(script.display().to_string());
        let req = ScheduleRequest::new("0 3 * * *", "run-sync").unwrap();
        let err = registrar.register(&req).await.unwrap_err();
        assert!(matches!(err, MigrateError::Schedule(ref m) if m.contains("Permission denied")));
        assert!(!installed.exists());
    }
}
