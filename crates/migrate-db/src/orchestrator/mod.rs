//! Migration orchestrator - main workflow coordinator.
//!
//! A run walks a fixed sequence of phases:
//!
//! ```text
//! Start → DiscoverSchema → LoadCheckpoint → SuspendConstraints
//!       → TransferAll → RestoreConstraints → ClearCheckpoint → Done
//! ```
//!
//! Any error moves the run to `Failed`. A failed run keeps its checkpoint
//! and restore script so the next run resumes from them.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{Config, MigrationConfig};
use crate::error::{MigrateError, Result};
use crate::pool::{ConnectionManager, ConnectionPool};
use crate::progress::{LogProgress, ProgressSink};
use crate::schema::{SchemaIntrospector, Table};
use crate::source::{MssqlManager, SourceConnection};
use crate::state::{
    CheckpointStore, FileCheckpointStore, FileScriptStore, MemoryCheckpointStore,
    MemoryScriptStore, ScriptStore,
};
use crate::target::{
    add_foreign_key_statement, drop_foreign_key_statement, PgManager, TargetConnection,
};
use crate::transfer::{timed, TransferEngine, TransferOptions};

/// Run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    DiscoverSchema,
    LoadCheckpoint,
    SuspendConstraints,
    TransferAll,
    RestoreConstraints,
    ClearCheckpoint,
    Done,
    Failed,
}

impl Phase {
    /// Progress line announcing the phase.
    pub fn description(&self) -> &'static str {
        match self {
            Phase::Start => "Starting migration",
            Phase::DiscoverSchema => "Discovering target schema",
            Phase::LoadCheckpoint => "Loading checkpoint",
            Phase::SuspendConstraints => "Suspending foreign key constraints",
            Phase::TransferAll => "Transferring tables",
            Phase::RestoreConstraints => "Restoring foreign key constraints",
            Phase::ClearCheckpoint => "Clearing checkpoint",
            Phase::Done => "Migration complete",
            Phase::Failed => "Migration failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "start",
            Phase::DiscoverSchema => "discover_schema",
            Phase::LoadCheckpoint => "load_checkpoint",
            Phase::SuspendConstraints => "suspend_constraints",
            Phase::TransferAll => "transfer_all",
            Phase::RestoreConstraints => "restore_constraints",
            Phase::ClearCheckpoint => "clear_checkpoint",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Orchestrator settings taken from the migration section.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Tables never truncated, read or checkpointed. Matched exactly.
    pub ignore_tables: HashSet<String>,
    pub transfer: TransferOptions,
}

impl From<&MigrationConfig> for RunOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            ignore_tables: config.ignore_tables.iter().cloned().collect(),
            transfer: TransferOptions::from(config),
        }
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Tables in the discovered model.
    pub tables_total: usize,

    /// Tables copied by this run.
    pub tables_transferred: usize,

    /// Tables skipped because an earlier run checkpointed them.
    pub tables_skipped: usize,

    /// Tables skipped because they are in the ignore list.
    pub tables_ignored: usize,

    /// Total rows transferred.
    pub rows_transferred: u64,

    pub foreign_keys_suspended: usize,

    /// Statements executed from the restore script.
    pub constraints_restored: usize,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Resume records left by earlier runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub checkpoint_location: String,
    pub checkpointed_tables: Vec<String>,
    pub script_location: String,
    /// A restore script is waiting to be applied.
    pub restore_script_pending: bool,
}

/// Connectivity of one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub engine: String,
    pub connected: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source: EngineHealth,
    pub target: EngineHealth,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct RunCounters {
    tables_total: usize,
    tables_transferred: usize,
    tables_skipped: usize,
    tables_ignored: usize,
    rows_transferred: u64,
    foreign_keys_suspended: usize,
    constraints_restored: usize,
}

/// Append the lines of `additions` missing from `existing`, keeping order.
pub fn merge_script(existing: &str, additions: &[String]) -> String {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    for line in existing.lines().map(str::trim).chain(additions.iter().map(|s| s.trim())) {
        if !line.is_empty() && seen.insert(line) {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Migration orchestrator.
pub struct Orchestrator<S: ConnectionManager, T: ConnectionManager> {
    source: Arc<ConnectionPool<S>>,
    target: Arc<ConnectionPool<T>>,
    options: RunOptions,
    checkpoint: Arc<dyn CheckpointStore>,
    scripts: Arc<dyn ScriptStore>,
    progress: Arc<dyn ProgressSink>,
}

impl Orchestrator<MssqlManager, PgManager> {
    /// Build both pools and the file-backed stores from configuration.
    ///
    /// No connection is opened until the run starts.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let migration = &config.migration;

        let source = ConnectionPool::new(
            MssqlManager::new(&config.source)?,
            migration.source_capacity(),
        )?;
        let target = ConnectionPool::new(
            PgManager::new(&config.target)?,
            migration.target_capacity(),
        )?;
        debug!(
            "Pools ready: {} source / {} target connections",
            source.capacity(),
            target.capacity()
        );

        Ok(
            Self::new(Arc::new(source), Arc::new(target), RunOptions::from(migration))
                .with_checkpoint_store(Arc::new(FileCheckpointStore::new(
                    &config.state.checkpoint_file,
                )))
                .with_script_store(Arc::new(FileScriptStore::new(
                    &config.state.restore_script_file,
                ))),
        )
    }
}

impl<S, T> Orchestrator<S, T>
where
    S: ConnectionManager,
    T: ConnectionManager,
    S::Connection: SourceConnection,
    T::Connection: TargetConnection,
{
    /// Create an orchestrator with in-memory stores and log progress.
    pub fn new(
        source: Arc<ConnectionPool<S>>,
        target: Arc<ConnectionPool<T>>,
        options: RunOptions,
    ) -> Self {
        Self {
            source,
            target,
            options,
            checkpoint: Arc::new(MemoryCheckpointStore::new()),
            scripts: Arc::new(MemoryScriptStore::new()),
            progress: Arc::new(LogProgress),
        }
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = store;
        self
    }

    pub fn with_script_store(mut self, store: Arc<dyn ScriptStore>) -> Self {
        self.scripts = store;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Run the migration.
    pub async fn run(&self) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting migration run: {}", run_id);

        let mut phase = Phase::Start;
        let mut counters = RunCounters::default();
        self.progress.report(phase.description());

        if let Err(e) = self.run_phases(&mut phase, &mut counters).await {
            error!("Migration {} failed during {}: {}", run_id, phase, e);
            self.progress.report(&format!(
                "{} during {}: {}",
                Phase::Failed.description(),
                phase,
                e.format_detailed()
            ));
            return Err(e);
        }

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let result = MigrationResult {
            run_id,
            status: "completed".to_string(),
            started_at,
            completed_at,
            duration_seconds,
            tables_total: counters.tables_total,
            tables_transferred: counters.tables_transferred,
            tables_skipped: counters.tables_skipped,
            tables_ignored: counters.tables_ignored,
            rows_transferred: counters.rows_transferred,
            foreign_keys_suspended: counters.foreign_keys_suspended,
            constraints_restored: counters.constraints_restored,
        };

        info!(
            "Migration {}: {} tables ({} transferred, {} skipped, {} ignored), {} rows in {:.1}s",
            result.status,
            result.tables_total,
            result.tables_transferred,
            result.tables_skipped,
            result.tables_ignored,
            result.rows_transferred,
            result.duration_seconds
        );
        Ok(result)
    }

    fn enter(&self, current: &mut Phase, next: Phase) {
        debug!("Phase {} -> {}", current, next);
        *current = next;
        self.progress.report(next.description());
    }

    async fn run_phases(&self, phase: &mut Phase, counters: &mut RunCounters) -> Result<()> {
        self.enter(phase, Phase::DiscoverSchema);
        let tables = SchemaIntrospector::new(self.target.clone()).discover().await?;
        counters.tables_total = tables.len();

        self.enter(phase, Phase::LoadCheckpoint);
        let completed: HashSet<String> = self.checkpoint.read().await?.into_iter().collect();
        if !completed.is_empty() {
            info!(
                "Resuming: {} tables already transferred ({})",
                completed.len(),
                self.checkpoint.location()
            );
        }

        self.enter(phase, Phase::SuspendConstraints);
        counters.foreign_keys_suspended = self.suspend_constraints(&tables).await?;

        self.enter(phase, Phase::TransferAll);
        self.transfer_all(&tables, &completed, counters).await?;

        self.enter(phase, Phase::RestoreConstraints);
        counters.constraints_restored = self.apply_restore_script().await?;

        self.enter(phase, Phase::ClearCheckpoint);
        self.checkpoint.delete().await?;

        self.enter(phase, Phase::Done);
        Ok(())
    }

    /// Persist the restore DDL, then drop every foreign key in one batch.
    ///
    /// Returns the number of constraints dropped. Without foreign keys
    /// neither the script nor the target is touched.
    async fn suspend_constraints(&self, tables: &[Table]) -> Result<usize> {
        let (drops, restores): (Vec<String>, Vec<String>) = tables
            .iter()
            .flat_map(|table| {
                table.foreign_keys.iter().map(move |fk| {
                    (
                        drop_foreign_key_statement(&table.name, fk),
                        add_foreign_key_statement(&table.name, fk),
                    )
                })
            })
            .unzip();

        if drops.is_empty() {
            info!("No foreign keys to suspend");
            return Ok(0);
        }

        let existing = self.scripts.read().await?;
        if !existing.is_empty() {
            warn!(
                "Restore script from an earlier run found at {}; merging",
                self.scripts.location()
            );
        }
        self.scripts.write(&merge_script(&existing, &restores)).await?;
        debug!(
            "Wrote {} restore statements to {}",
            restores.len(),
            self.scripts.location()
        );

        let conn = self.target.acquire().await?;
        timed(
            "foreign key suspension",
            self.options.transfer.statement_timeout,
            conn.execute_script(&drops.join("\n")),
        )
        .await??;
        drop(conn);

        info!("Suspended {} foreign keys", drops.len());
        Ok(drops.len())
    }

    async fn transfer_all(
        &self,
        tables: &[Table],
        completed: &HashSet<String>,
        counters: &mut RunCounters,
    ) -> Result<()> {
        let engine = Arc::new(TransferEngine::new(
            self.source.clone(),
            self.target.clone(),
            self.checkpoint.clone(),
            self.progress.clone(),
            self.options.transfer,
        ));

        let mut handles = Vec::new();
        for table in tables {
            if self.options.ignore_tables.contains(&table.name) {
                debug!("{}: ignored", table.name);
                counters.tables_ignored += 1;
                continue;
            }
            if completed.contains(&table.name) {
                debug!("{}: already transferred", table.name);
                counters.tables_skipped += 1;
                continue;
            }

            let engine = engine.clone();
            let table = table.clone();
            let name = table.name.clone();
            handles.push((
                name,
                tokio::spawn(async move { engine.transfer_table(&table).await }),
            ));
        }

        info!(
            "Transferring {} tables ({} source / {} target connections)",
            handles.len(),
            self.source.capacity(),
            self.target.capacity()
        );

        let mut first_failure = None;
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(MigrateError::transfer(&name, format!("task aborted: {}", e))),
            };
            match outcome {
                Ok(stats) => {
                    counters.tables_transferred += 1;
                    counters.rows_transferred += stats.rows;
                }
                Err(e) => {
                    if first_failure.is_none() {
                        first_failure = Some(MigrateError::table_failed(name, e));
                    }
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Execute the persisted restore script and delete it.
    ///
    /// Returns the number of statements executed. A failed restore keeps the
    /// script in place.
    async fn apply_restore_script(&self) -> Result<usize> {
        let script = self.scripts.read().await?;
        if script.trim().is_empty() {
            debug!("No restore script pending");
            return Ok(0);
        }
        let statements = script.lines().filter(|l| !l.trim().is_empty()).count();

        let conn = self.target.acquire().await?;
        timed(
            "constraint restore",
            self.options.transfer.statement_timeout,
            conn.execute_script(&script),
        )
        .await??;
        drop(conn);

        self.scripts.delete().await?;
        info!("Restored {} foreign keys", statements);
        Ok(statements)
    }

    /// Run only the constraint restore phase.
    pub async fn restore_constraints(&self) -> Result<usize> {
        self.progress.report(Phase::RestoreConstraints.description());
        match self.apply_restore_script().await {
            Ok(count) => Ok(count),
            Err(e) => {
                error!("Constraint restore failed: {}", e);
                self.progress.report(&format!(
                    "{} during {}: {}",
                    Phase::Failed.description(),
                    Phase::RestoreConstraints,
                    e.format_detailed()
                ));
                Err(e)
            }
        }
    }

    /// Read the resume records without touching either database.
    pub async fn resume_state(&self) -> Result<ResumeState> {
        Ok(ResumeState {
            checkpoint_location: self.checkpoint.location(),
            checkpointed_tables: self.checkpoint.read().await?,
            script_location: self.scripts.location(),
            restore_script_pending: !self.scripts.read().await?.trim().is_empty(),
        })
    }

    /// Open and ping one connection per engine.
    pub async fn health_check(&self) -> HealthCheckResult {
        let limit = self.options.transfer.statement_timeout;

        let started = Instant::now();
        let outcome = timed("source health check", limit, async {
            let mut conn = self.source.acquire().await?;
            conn.ping().await
        })
        .await;
        let source = engine_health(self.source.engine(), started, outcome);

        let started = Instant::now();
        let outcome = timed("target health check", limit, async {
            let conn = self.target.acquire().await?;
            conn.ping().await
        })
        .await;
        let target = engine_health(self.target.engine(), started, outcome);

        HealthCheckResult {
            healthy: source.connected && target.connected,
            source,
            target,
        }
    }
}

fn engine_health(engine: &str, started: Instant, outcome: Result<Result<()>>) -> EngineHealth {
    let error = match outcome.and_then(|inner| inner) {
        Ok(()) => None,
        Err(e) => {
            warn!("{} health check failed: {}", engine, e);
            Some(e.to_string())
        }
    };
    EngineHealth {
        engine: engine.to_string(),
        connected: error.is_none(),
        latency_ms: started.elapsed().as_millis() as u64,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_script_appends_new_lines() {
        let merged = merge_script(
            "ALTER TABLE a ADD CONSTRAINT x;\nALTER TABLE b ADD CONSTRAINT y;",
            &[
                "ALTER TABLE b ADD CONSTRAINT y;".to_string(),
                "ALTER TABLE c ADD CONSTRAINT z;".to_string(),
            ],
        );
        assert_eq!(
            merged,
            "ALTER TABLE a ADD CONSTRAINT x;\nALTER TABLE b ADD CONSTRAINT y;\nALTER TABLE c ADD CONSTRAINT z;"
        );
    }

    #[test]
    fn test_merge_script_into_empty() {
        let merged = merge_script("", &["ALTER TABLE a ADD CONSTRAINT x;".to_string()]);
        assert_eq!(merged, "ALTER TABLE a ADD CONSTRAINT x;");
    }

    #[test]
    fn test_run_options_from_config() {
        let config = MigrationConfig {
            ignore_tables: vec!["__EFMigrationsHistory".to_string()],
            ..Default::default()
        };
        let opts = RunOptions::from(&config);
        assert!(opts.ignore_tables.contains("__EFMigrationsHistory"));
        assert!(!opts.ignore_tables.contains("__efmigrationshistory"));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::SuspendConstraints.to_string(), "suspend_constraints");
        assert_eq!(Phase::Done.description(), "Migration complete");
    }

    #[test]
    fn test_result_json() {
        let now = Utc::now();
        let result = MigrationResult {
            run_id: "r1".to_string(),
            status: "completed".to_string(),
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            tables_total: 2,
            tables_transferred: 1,
            tables_skipped: 1,
            tables_ignored: 0,
            rows_transferred: 10,
            foreign_keys_suspended: 1,
            constraints_restored: 1,
        };
        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["tables_skipped"], 1);
        assert_eq!(json["rows_transferred"], 10);
    }
}
