//! # migrate-db
//!
//! Resumable SQL Server to PostgreSQL data migration library.
//!
//! The target schema already exists; this library moves the rows:
//!
//! - **Schema discovery** from the PostgreSQL catalog (columns, identity
//!   sequences, foreign keys)
//! - **Constraint suspension** with a persisted restore script
//! - **Concurrent table transfers** bounded by per-engine connection pools
//! - **Binary COPY** loading with boolean coercion and sequence repair
//! - **Resume capability** via an append-only table checkpoint
//!
//! ## Example
//!
//! ```rust,no_run
//! use migrate_db::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> migrate_db::Result<()> {
//!     let config = Config::load("migrate.yaml")?;
//!     let orchestrator = Orchestrator::from_config(&config)?;
//!     let result = orchestrator.run().await?;
//!     println!("Migrated {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod schema;
pub mod source;
pub mod state;
pub mod target;
pub mod transfer;
pub mod value;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, StateConfig, TargetConfig};
pub use error::{MigrateError, Result};
pub use orchestrator::{
    HealthCheckResult, MigrationResult, Orchestrator, Phase, ResumeState, RunOptions,
};
pub use pool::{ConnectionManager, ConnectionPool, PooledConnection};
pub use progress::{LogProgress, ProgressSink};
pub use schema::{Column, ColumnKind, DataType, ForeignKey, SchemaIntrospector, Table};
pub use source::{MssqlManager, SourceConnection};
pub use state::{CheckpointStore, ScriptStore};
pub use target::{BulkWriter, PgManager, TargetConnection};
pub use transfer::{TransferEngine, TransferOptions, TransferStats};
pub use value::SqlValue;
