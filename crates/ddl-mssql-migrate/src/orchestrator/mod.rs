//! Migration orchestrator - coordinates the full run.
//!
//! One run walks the [`Phase`] machine: translate the DDL, check it against
//! the target schema, provision the target, move the data (full copy or
//! incremental sync per table) and, when asked, register the recurring job.

mod phase;

pub use phase::{Phase, PhaseTracker};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MigrationMode, TableConfig};
use crate::conflict::{blocking_summary, has_blocking, ConflictRecord, ConflictResolver, SchemaInventory};
use crate::connection::{ConnectionHandle, ConnectionManager, Role};
use crate::core::{DriverCatalog, RowFilter};
use crate::dialect::{SchemaDocument, TranslationEngine};
use crate::error::{MigrateError, Result};
use crate::schedule::{CrontabRegistrar, JobRegistrar, ScheduleRequest};
use crate::state::{FileWatermarkStore, Watermark, WatermarkStore};
use crate::sync::{next_watermark, IncrementalSync};
use crate::transfer::{TableSpec, TransferEngine, TransferResult};

/// Per-run switches that override configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after the conflict check and report the translated DDL.
    pub dry_run: bool,
    /// Force incremental mode regardless of `migration.mode`.
    pub incremental: bool,
    /// Register the configured recurring job after the data work.
    pub schedule: bool,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// `completed` or `dry_run`.
    pub status: String,

    /// Phase the run ended in.
    pub phase: Phase,

    pub mode: MigrationMode,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Per-table results, in configuration order.
    pub tables: Vec<TransferResult>,

    /// Total rows written.
    pub rows_transferred: u64,

    /// Total rows refused by the target.
    pub rows_failed: u64,

    /// Conflicts found, including auto-renamed ones.
    pub conflicts: Vec<ConflictRecord>,

    /// Whether a recurring job was registered.
    pub scheduled: bool,

    /// Translated DDL, reported by dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_ddl: Option<String>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Everything a table worker needs, shared between tasks.
struct WorkerContext {
    connections: ConnectionManager,
    config: Config,
    mode: MigrationMode,
    store: Arc<dyn WatermarkStore>,
    sync: IncrementalSync,
    engine: TransferEngine,
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    catalog: Arc<DriverCatalog>,
    store: Arc<dyn WatermarkStore>,
    registrar: Arc<dyn JobRegistrar>,
}

impl Orchestrator {
    /// Orchestrator with the built-in drivers, file watermarks under
    /// `migration.state_dir` and the crontab registrar.
    pub fn new(config: Config) -> Self {
        let store = FileWatermarkStore::new(config.migration.state_dir.clone(), config.state_key());
        Self {
            config,
            catalog: Arc::new(DriverCatalog::with_builtins()),
            store: Arc::new(store),
            registrar: Arc::new(CrontabRegistrar::new()),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<DriverCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WatermarkStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn JobRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Translation engine for this configuration.
    pub fn engine(&self) -> Result<TranslationEngine> {
        TranslationEngine::from_config(&self.config.translation)
    }

    /// Translate `source_ddl` and compare it with the target schema.
    ///
    /// The target schema is `conflicts.target_schema_file` when configured;
    /// otherwise the translated document itself, which only surfaces type
    /// rewrites that rules disagree on.
    pub fn check(&self, source_ddl: &SchemaDocument) -> Result<(SchemaDocument, Vec<ConflictRecord>)> {
        let engine = self.engine()?;
        let (translated, report) = engine.translate_with_report(source_ddl);
        debug!(
            "Translated {} with {} rewrites",
            source_ddl.display_name(),
            report.total_rewrites()
        );

        let target = match &self.config.conflicts.target_schema_file {
            Some(path) => SchemaDocument::load(path)?,
            None => translated.clone(),
        };
        let conflicts =
            ConflictResolver::new(engine, &self.config.conflicts.renames).find_conflicts(source_ddl, &target);
        Ok((translated, conflicts))
    }

    /// Register the configured recurring job. Used directly by the
    /// `schedule` command; runs call it after their data work.
    pub async fn register_schedule(&self) -> Result<ScheduleRequest> {
        let schedule = self.config.schedule.as_ref().ok_or_else(|| {
            MigrateError::Config("no schedule section in configuration".into())
        })?;
        let request = ScheduleRequest::new(&schedule.cron, &schedule.command)?;
        self.registrar.register(&request).await?;
        Ok(request)
    }

    /// Run the migration for `source_ddl`.
    pub async fn run(
        &self,
        source_ddl: &SchemaDocument,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mode = if options.incremental {
            MigrationMode::Incremental
        } else {
            self.config.migration.mode
        };
        info!("Starting migration run: {} (mode: {:?})", run_id, mode);

        let mut tracker = PhaseTracker::default();
        let mut result = MigrationResult {
            run_id,
            status: "running".to_string(),
            phase: Phase::Idle,
            mode,
            started_at,
            completed_at: started_at,
            duration_seconds: 0.0,
            tables: Vec::new(),
            rows_transferred: 0,
            rows_failed: 0,
            conflicts: Vec::new(),
            scheduled: false,
            translated_ddl: None,
        };

        match self
            .run_phases(source_ddl, options, mode, &cancel, &mut tracker, &mut result)
            .await
        {
            Ok(()) => {
                let completed_at = Utc::now();
                result.phase = tracker.current();
                result.completed_at = completed_at;
                result.duration_seconds =
                    (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
                info!(
                    "Migration {}: {} tables, {} rows transferred, {} failed in {:.1}s",
                    result.status,
                    result.tables.len(),
                    result.rows_transferred,
                    result.rows_failed,
                    result.duration_seconds
                );
                Ok(result)
            }
            Err(e) => {
                tracker.fail();
                error!("Migration failed in phase {}: {}", tracker.current(), e);
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        source_ddl: &SchemaDocument,
        options: &RunOptions,
        mode: MigrationMode,
        cancel: &CancellationToken,
        tracker: &mut PhaseTracker,
        result: &mut MigrationResult,
    ) -> Result<()> {
        if options.schedule && self.config.schedule.is_none() {
            return Err(MigrateError::Config(
                "--schedule needs a schedule section in configuration".into(),
            ));
        }

        // Phase 1: translate
        let (translated, conflicts) = self.check(source_ddl)?;
        tracker.advance(Phase::SchemaTranslated)?;

        // Phase 2: conflicts
        for record in &conflicts {
            if record.is_blocking() {
                warn!("Conflict: {}", record);
            } else {
                info!("Conflict: {}", record);
            }
        }
        result.conflicts = conflicts;
        tracker.advance(Phase::ConflictsChecked)?;

        if has_blocking(&result.conflicts) {
            let count = result.conflicts.iter().filter(|c| c.is_blocking()).count();
            return Err(MigrateError::Conflict {
                count,
                details: blocking_summary(&result.conflicts),
            });
        }

        if options.dry_run {
            info!("Dry run: stopping before the target is touched");
            result.translated_ddl = Some(translated.text().to_string());
            result.status = "dry_run".to_string();
            tracker.advance(Phase::Done)?;
            return Ok(());
        }

        let connections = ConnectionManager::new(self.catalog.clone(), self.config.connection.clone());

        // Phase 3: provision
        let apply = self
            .config
            .migration
            .apply_schema
            .unwrap_or(mode == MigrationMode::Full);
        let mut target = connections.open(Role::Target, &self.config.target).await?;
        let provisioned = if apply {
            Self::apply_schema(&mut target, &translated).await
        } else {
            info!("Skipping DDL (mode: {:?})", mode);
            Ok(())
        };
        target.close().await;
        provisioned?;
        tracker.advance(Phase::TargetProvisioned)?;

        // Phase 4: data
        result.tables = self
            .transfer_tables(source_ddl, connections, mode, cancel)
            .await?;
        result.rows_transferred = result.tables.iter().map(|t| t.rows_transferred).sum();
        result.rows_failed = result.tables.iter().map(|t| t.rows_failed).sum();

        if self.config.migration.fail_on_row_errors && result.rows_failed > 0 {
            let failed: Vec<String> = result
                .tables
                .iter()
                .filter(|t| t.rows_failed > 0)
                .map(|t| t.table.clone())
                .collect();
            return Err(MigrateError::transfer(
                failed.join(", "),
                format!("{} row(s) refused by the target", result.rows_failed),
            ));
        }
        tracker.advance(Phase::DataTransferred)?;

        // Phase 5: schedule
        if options.schedule {
            self.register_schedule().await?;
            result.scheduled = true;
            tracker.advance(Phase::Scheduled)?;
        }

        result.status = "completed".to_string();
        tracker.advance(Phase::Done)?;
        Ok(())
    }

    async fn apply_schema(target: &mut ConnectionHandle, translated: &SchemaDocument) -> Result<()> {
        let statements = translated.statements();
        info!("Applying {} DDL statements to target", statements.len());
        for (i, statement) in statements.iter().enumerate() {
            debug!("DDL {}/{}: {}", i + 1, statements.len(), statement);
            if let Err(e) = target.session()?.execute(statement).await {
                error!("DDL statement {} failed: {}", i + 1, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tables to move: the configured list, or every table in the DDL.
    fn table_configs(&self, source_ddl: &SchemaDocument) -> Vec<TableConfig> {
        if !self.config.migration.tables.is_empty() {
            return self.config.migration.tables.clone();
        }
        SchemaInventory::from_document(source_ddl)
            .tables
            .into_iter()
            .map(|t| TableConfig {
                name: t.name,
                columns: Vec::new(),
                watermark_column: None,
                transforms: BTreeMap::new(),
            })
            .collect()
    }

    fn table_spec(&self, table: &TableConfig) -> TableSpec {
        let mut spec = TableSpec::from_config(
            table,
            &self.config.migration,
            self.config.source.schema(),
            self.config.target.schema(),
        );

        let renames = &self.config.conflicts.renames;
        let table_key = table.name.to_lowercase();
        if let Some(renamed) = renames
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(&table_key))
            .map(|(_, v)| v.trim().to_string())
        {
            spec.target.name = renamed;
        }
        let prefix = format!("{}.", table_key);
        for (key, value) in renames {
            let key = key.trim().to_lowercase();
            if let Some(column) = key.strip_prefix(&prefix) {
                spec = spec.with_column_rename(column, value.trim());
            }
        }
        spec
    }

    async fn transfer_tables(
        &self,
        source_ddl: &SchemaDocument,
        connections: ConnectionManager,
        mode: MigrationMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<TransferResult>> {
        let migration = &self.config.migration;
        let engine = TransferEngine::new(migration.max_recorded_failures);
        let ctx = Arc::new(WorkerContext {
            connections,
            config: self.config.clone(),
            mode,
            store: self.store.clone(),
            sync: IncrementalSync::new(engine.clone(), migration.watermark_policy),
            engine,
        });

        let specs: Vec<TableSpec> = self
            .table_configs(source_ddl)
            .iter()
            .map(|t| self.table_spec(t))
            .collect();
        info!(
            "Transferring {} tables with {} workers",
            specs.len(),
            migration.workers
        );

        let semaphore = Arc::new(Semaphore::new(migration.workers));
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            if cancel.is_cancelled() {
                info!("Cancellation requested, stopping new transfers");
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| MigrateError::State(format!("worker pool closed: {}", e)))?;
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let name = spec.source.display_name();
            let handle = tokio::spawn(async move {
                let result = transfer_table(&ctx, &spec, &cancel).await;
                drop(permit);
                result
            });
            handles.push((name, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error: Option<MigrateError> = None;
        let mut cancelled = cancel.is_cancelled();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(MigrateError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    error!("{}: failed - {}", name, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("{}: task panicked - {}", name, e);
                    first_error.get_or_insert(MigrateError::transfer(name, format!("task panicked: {}", e)));
                }
            }
        }

        if cancelled {
            return Err(MigrateError::Cancelled);
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(results)
    }
}

/// One table pass on its own pair of connections.
async fn transfer_table(
    ctx: &WorkerContext,
    spec: &TableSpec,
    cancel: &CancellationToken,
) -> Result<TransferResult> {
    let mut source = ctx.connections.open(Role::Source, &ctx.config.source).await?;
    let mut target = match ctx.connections.open(Role::Target, &ctx.config.target).await {
        Ok(target) => target,
        Err(e) => {
            source.close().await;
            return Err(e.into());
        }
    };

    let outcome = table_pass(ctx, &mut source, &mut target, spec, cancel).await;
    source.close().await;
    target.close().await;
    outcome
}

async fn table_pass(
    ctx: &WorkerContext,
    source: &mut ConnectionHandle,
    target: &mut ConnectionHandle,
    spec: &TableSpec,
    cancel: &CancellationToken,
) -> Result<TransferResult> {
    let key = spec.source.display_name();
    match ctx.mode {
        MigrationMode::Incremental => {
            let watermark = ctx.store.load(&key).await?;
            let (result, next) = ctx
                .sync
                .sync_incremental(source, target, spec, &watermark, cancel)
                .await?;
            if next != watermark {
                ctx.store.save(&next).await?;
            }
            Ok(result)
        }
        MigrationMode::Full => {
            let result = ctx
                .engine
                .transfer(source, target, spec, &RowFilter::All, cancel)
                .await?;
            // a full copy seeds the watermark for later incremental runs
            let seed = Watermark::initial(&key)
                .advanced_to(next_watermark(&result, ctx.sync.policy()))
                .recorded(result.max_transferred_modified, &result.refused_modified);
            if seed.high_water.is_some() {
                ctx.store.save(&seed).await?;
            }
            Ok(result)
        }
    }
}
