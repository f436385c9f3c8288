//! Per-table transfer task.
//!
//! One task copies one table: truncate the target, stream the source rows
//! through a binary COPY, repair the identity sequence, then record the
//! table in the checkpoint.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tracing::{debug, error, info};

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::pool::{ConnectionManager, ConnectionPool};
use crate::progress::ProgressSink;
use crate::schema::Table;
use crate::source::SourceConnection;
use crate::state::CheckpointStore;
use crate::target::TargetConnection;
use crate::value::coerce_boolean;

/// Timeouts applied inside a table transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Initial SELECT and every row fetch.
    pub read_timeout: Duration,
    /// Every row write (which may flush to the server) and the COPY finalize.
    pub write_timeout: Duration,
    /// TRUNCATE, COPY start and sequence restart.
    pub statement_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from(&MigrationConfig::default())
    }
}

impl From<&MigrationConfig> for TransferOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            statement_timeout: config.statement_timeout(),
        }
    }
}

/// Statistics from one table transfer.
#[derive(Debug, Clone)]
pub struct TransferStats {
    pub table: String,
    /// Rows committed by the COPY.
    pub rows: u64,
    /// Highest identity value seen, if the table has an identity column.
    pub last_id: Option<i64>,
    pub duration: Duration,
}

/// Bound a future by `limit`, mapping expiry to [`MigrateError::Timeout`].
pub(crate) async fn timed<F: Future>(operation: &str, limit: Duration, fut: F) -> Result<F::Output> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MigrateError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        })
}

/// Value the identity sequence restarts at: one past the highest id, or 1
/// for an empty table.
pub(crate) fn next_sequence_value(last_id: Option<i64>) -> Result<i64> {
    match last_id {
        None => Ok(1),
        Some(id) => id.checked_add(1).ok_or_else(|| {
            MigrateError::Conversion(format!(
                "identity value {} leaves no room for the next sequence value",
                id
            ))
        }),
    }
}

/// Copies tables from the source pool into the target pool.
pub struct TransferEngine<S: ConnectionManager, T: ConnectionManager> {
    source: Arc<ConnectionPool<S>>,
    target: Arc<ConnectionPool<T>>,
    checkpoint: Arc<dyn CheckpointStore>,
    progress: Arc<dyn ProgressSink>,
    options: TransferOptions,
}

impl<S, T> TransferEngine<S, T>
where
    S: ConnectionManager,
    T: ConnectionManager,
    S::Connection: SourceConnection,
    T::Connection: TargetConnection,
{
    pub fn new(
        source: Arc<ConnectionPool<S>>,
        target: Arc<ConnectionPool<T>>,
        checkpoint: Arc<dyn CheckpointStore>,
        progress: Arc<dyn ProgressSink>,
        options: TransferOptions,
    ) -> Self {
        Self {
            source,
            target,
            checkpoint,
            progress,
            options,
        }
    }

    /// Transfer one table. Failures are reported with their diagnostics and
    /// returned unchanged.
    pub async fn transfer_table(&self, table: &Table) -> Result<TransferStats> {
        match self.run(table).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                let mut line = format!("Table {} failed: {}", table.name, e);
                if let Some(diagnostics) = e.diagnostics() {
                    line.push('\n');
                    line.push_str(&diagnostics);
                }
                error!("{}", line);
                self.progress.report(&line);
                Err(e)
            }
        }
    }

    async fn run(&self, table: &Table) -> Result<TransferStats> {
        let started = Instant::now();
        let opts = self.options;

        let mut source = self.source.acquire().await?;
        let target = self.target.acquire().await?;
        self.progress.report(&format!(
            "Starting transfer of table {}. {}",
            table.name,
            self.target.busy_state()
        ));

        timed("TRUNCATE", opts.statement_timeout, target.truncate_cascade(&table.name)).await??;

        let column_names = table.column_names();
        let identity_index = table.columns.iter().position(|c| c.is_identity());

        let mut rows = timed(
            "source SELECT",
            opts.read_timeout,
            source.read_table(&table.name, &column_names),
        )
        .await??;
        let mut writer = timed(
            "COPY start",
            opts.statement_timeout,
            target.copy_in(&table.name, &table.columns),
        )
        .await??;

        let mut last_id: Option<i64> = None;
        let mut read = 0u64;
        while let Some(row) = timed("source row fetch", opts.read_timeout, rows.next()).await? {
            let row = row?;
            if row.len() != table.columns.len() {
                return Err(MigrateError::transfer(
                    &table.name,
                    format!(
                        "source returned {} values, expected {}",
                        row.len(),
                        table.columns.len()
                    ),
                ));
            }

            let mut values = Vec::with_capacity(row.len());
            for (i, (column, value)) in table.columns.iter().zip(row).enumerate() {
                if Some(i) == identity_index {
                    if let Some(id) = value.as_identity()? {
                        last_id = Some(last_id.map_or(id, |max| max.max(id)));
                    }
                }
                values.push(coerce_boolean(value, column.data_type));
            }
            timed("COPY write", opts.write_timeout, writer.write_row(values)).await??;
            read += 1;
        }
        drop(rows);

        let written = timed("COPY finalize", opts.write_timeout, writer.finish()).await??;
        debug!("{}: read {} rows, COPY reported {}", table.name, read, written);

        if let Some(sequence) = table.identity_column().and_then(|c| c.sequence_name()) {
            let next = next_sequence_value(last_id)?;
            timed(
                "sequence restart",
                opts.statement_timeout,
                target.restart_sequence(sequence, next),
            )
            .await??;
            debug!("{}: restarted {} at {}", table.name, sequence, next);
        }

        self.checkpoint.append_line(&table.name).await?;
        drop(target);
        drop(source);

        let stats = TransferStats {
            table: table.name.clone(),
            rows: written,
            last_id,
            duration: started.elapsed(),
        };
        info!(
            "{}: transferred {} rows in {:.1}s",
            stats.table,
            stats.rows,
            stats.duration.as_secs_f64()
        );
        self.progress.report(&format!(
            "Finished table {} ({} rows). {}",
            table.name,
            written,
            self.target.busy_state()
        ));
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timed_maps_expiry() {
        let err = timed("COPY finalize", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MigrateError::Timeout { .. }));
        assert!(err.to_string().starts_with("COPY finalize timed out"));
    }

    #[tokio::test]
    async fn test_timed_passes_output() {
        let value = timed("x", Duration::from_secs(1), async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_next_sequence_value() {
        assert_eq!(next_sequence_value(None).unwrap(), 1);
        assert_eq!(next_sequence_value(Some(12)).unwrap(), 13);
        assert_eq!(next_sequence_value(Some(-5)).unwrap(), -4);
        let err = next_sequence_value(Some(i64::MAX)).unwrap_err();
        assert!(matches!(err, MigrateError::Conversion(_)));
    }

    #[test]
    fn test_options_from_config() {
        let mut config = MigrationConfig::default();
        config.write_timeout_secs = 30;
        let opts = TransferOptions::from(&config);
        assert_eq!(opts.write_timeout, Duration::from_secs(30));
        assert_eq!(opts.read_timeout, Duration::from_secs(900));
    }
}
