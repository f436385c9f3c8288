//! In-memory source and target engines for orchestrator tests.
//!
//! Both engines share one [`World`]. The target fake interprets the DDL the
//! orchestrator emits (TRUNCATE, DROP/ADD CONSTRAINT, ALTER SEQUENCE) so tests
//! can assert on the resulting database state.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use migrate_db::error::{MigrateError, Result};
use migrate_db::pool::{ConnectionManager, ConnectionPool};
use migrate_db::schema::{CatalogColumn, CatalogForeignKey, Column};
use migrate_db::source::{RowStream, SourceConnection};
use migrate_db::target::{BulkWriter, TargetConnection};
use migrate_db::{Orchestrator, RunOptions, SqlValue};

#[derive(Default)]
pub struct World {
    /// Source rows per table, in column order.
    pub source: HashMap<String, Vec<Vec<SqlValue>>>,
    pub catalog: Vec<CatalogColumn>,
    /// Constraints currently present on the target.
    pub foreign_keys: Vec<CatalogForeignKey>,
    /// Constraints dropped and not yet re-added.
    pub suspended: Vec<CatalogForeignKey>,
    pub target: HashMap<String, Vec<Vec<SqlValue>>>,
    pub sequences: HashMap<String, i64>,
    pub truncated: Vec<String>,
    pub reads: Vec<String>,
    pub scripts: Vec<String>,
    pub fail_reads_for: HashSet<String>,
    pub fail_target_connect: bool,
    /// Constraint drops fail with this message.
    pub fail_drops: Option<String>,
    /// Writers into these tables error out after this many rows.
    pub fail_writes_after: HashMap<String, usize>,
    /// Writers block forever on the first row.
    pub stall_writes: bool,
    pub read_delay: Option<Duration>,
    pub source_live: usize,
    pub source_peak: usize,
    pub target_live: usize,
    pub target_peak: usize,
}

pub type Shared = Arc<Mutex<World>>;

pub fn column(table: &str, name: &str, data_type: &str) -> CatalogColumn {
    CatalogColumn {
        table_name: table.to_string(),
        column_name: name.to_string(),
        data_type: data_type.to_string(),
        column_default: None,
    }
}

pub fn identity(table: &str, name: &str, data_type: &str, sequence: &str) -> CatalogColumn {
    CatalogColumn {
        column_default: Some(format!("nextval('{}'::regclass)", sequence)),
        ..column(table, name, data_type)
    }
}

pub fn foreign_key(name: &str, table: &str, col: &str, ref_table: &str, ref_col: &str) -> CatalogForeignKey {
    CatalogForeignKey {
        constraint_name: name.to_string(),
        table_name: table.to_string(),
        column_name: col.to_string(),
        referenced_schema: "public".to_string(),
        referenced_table: ref_table.to_string(),
        referenced_column: ref_col.to_string(),
        on_delete: "c".to_string(),
        on_update: "a".to_string(),
    }
}

/// `customers` (no identity, no FK) and `orders` (identity `id`, FK to
/// `customers`, smallint flag fed by source booleans).
pub fn shop_world() -> World {
    let mut world = World::default();
    world.catalog = vec![
        column("customers", "id", "integer"),
        column("customers", "name", "character varying"),
        column("customers", "active", "boolean"),
        identity("orders", "id", "integer", "orders_id_seq"),
        column("orders", "customer_id", "integer"),
        column("orders", "is_paid", "smallint"),
        column("orders", "note", "text"),
    ];
    world.foreign_keys = vec![foreign_key(
        "fk_orders_customers",
        "orders",
        "customer_id",
        "customers",
        "id",
    )];
    world.source.insert(
        "customers".to_string(),
        vec![
            vec![SqlValue::I32(1), SqlValue::Text("Ada".into()), SqlValue::Bool(true)],
            vec![
                SqlValue::I32(2),
                SqlValue::Text("Grace".into()),
                SqlValue::Bool(false),
            ],
        ],
    );
    world.source.insert(
        "orders".to_string(),
        vec![
            vec![
                SqlValue::I32(10),
                SqlValue::I32(1),
                SqlValue::Bool(true),
                SqlValue::Text("first".into()),
            ],
            vec![
                SqlValue::I32(11),
                SqlValue::I32(2),
                SqlValue::Text("False".into()),
                SqlValue::Null,
            ],
            vec![
                SqlValue::I32(12),
                SqlValue::I32(1),
                SqlValue::I16(1),
                SqlValue::Text("rush".into()),
            ],
        ],
    );
    world.sequences.insert("orders_id_seq".to_string(), 1);
    world
}

pub fn shared(world: World) -> Shared {
    Arc::new(Mutex::new(world))
}

pub fn orchestrator(
    world: &Shared,
    capacity: usize,
    options: RunOptions,
) -> Orchestrator<FakeSourceManager, FakeTargetManager> {
    let source = ConnectionPool::new(FakeSourceManager(world.clone()), capacity).unwrap();
    let target = ConnectionPool::new(FakeTargetManager(world.clone()), capacity).unwrap();
    Orchestrator::new(Arc::new(source), Arc::new(target), options)
}

/// Double-quoted identifiers in `sql`, in order.
fn quoted(sql: &str) -> Vec<String> {
    sql.split('"')
        .skip(1)
        .step_by(2)
        .map(String::from)
        .collect()
}

// =============================================================================
// Source
// =============================================================================

pub struct FakeSourceManager(pub Shared);

pub struct FakeSource(Shared);

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.0.lock().unwrap().source_live -= 1;
    }
}

#[async_trait]
impl ConnectionManager for FakeSourceManager {
    type Connection = FakeSource;

    async fn connect(&self) -> Result<FakeSource> {
        let mut world = self.0.lock().unwrap();
        world.source_live += 1;
        world.source_peak = world.source_peak.max(world.source_live);
        Ok(FakeSource(self.0.clone()))
    }

    fn engine(&self) -> &'static str {
        "fake-source"
    }
}

#[async_trait]
impl SourceConnection for FakeSource {
    async fn read_table<'a>(
        &'a mut self,
        table: &'a str,
        columns: &'a [String],
    ) -> Result<RowStream<'a>> {
        let (rows, delay) = {
            let mut world = self.0.lock().unwrap();
            world.reads.push(table.to_string());
            if world.fail_reads_for.contains(table) {
                return Err(MigrateError::transfer(table, "Invalid object name"));
            }
            let rows = world.source.get(table).cloned().unwrap_or_default();
            (rows, world.read_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        assert!(rows.iter().all(|r| r.len() == columns.len()));
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Target
// =============================================================================

pub struct FakeTargetManager(pub Shared);

pub struct FakeTarget(Shared);

impl Drop for FakeTarget {
    fn drop(&mut self) {
        self.0.lock().unwrap().target_live -= 1;
    }
}

#[async_trait]
impl ConnectionManager for FakeTargetManager {
    type Connection = FakeTarget;

    async fn connect(&self) -> Result<FakeTarget> {
        let mut world = self.0.lock().unwrap();
        if world.fail_target_connect {
            return Err(MigrateError::pool("connection refused", "connecting to target"));
        }
        world.target_live += 1;
        world.target_peak = world.target_peak.max(world.target_live);
        Ok(FakeTarget(self.0.clone()))
    }

    fn engine(&self) -> &'static str {
        "fake-target"
    }
}

fn apply_statement(world: &mut World, sql: &str) -> Result<()> {
    let idents = quoted(sql);
    if sql.starts_with("TRUNCATE TABLE") {
        let table = idents[1].clone();
        world.target.remove(&table);
        world.truncated.push(table);
    } else if sql.contains("DROP CONSTRAINT IF EXISTS") {
        if let Some(message) = &world.fail_drops {
            return Err(MigrateError::State(message.clone()));
        }
        let name = &idents[2];
        if let Some(pos) = world.foreign_keys.iter().position(|fk| &fk.constraint_name == name) {
            let fk = world.foreign_keys.remove(pos);
            world.suspended.push(fk);
        }
    } else if sql.contains("ADD CONSTRAINT") {
        let name = &idents[2];
        if world.foreign_keys.iter().any(|fk| &fk.constraint_name == name) {
            return Err(MigrateError::State(format!(
                "constraint \"{}\" already exists",
                name
            )));
        }
        let pos = world
            .suspended
            .iter()
            .position(|fk| &fk.constraint_name == name)
            .ok_or_else(|| MigrateError::State(format!("unknown constraint {}", name)))?;
        let fk = world.suspended.remove(pos);
        world.foreign_keys.push(fk);
    } else if sql.starts_with("ALTER SEQUENCE") {
        let parts: Vec<&str> = sql.split_whitespace().collect();
        let next: i64 = parts[5].parse().unwrap();
        world.sequences.insert(parts[2].to_string(), next);
    }
    Ok(())
}

#[async_trait]
impl TargetConnection for FakeTarget {
    async fn execute_script(&self, script: &str) -> Result<()> {
        let mut world = self.0.lock().unwrap();
        world.scripts.push(script.to_string());
        for statement in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
            apply_statement(&mut world, statement)?;
        }
        Ok(())
    }

    async fn catalog_columns(&self) -> Result<Vec<CatalogColumn>> {
        Ok(self.0.lock().unwrap().catalog.clone())
    }

    async fn catalog_foreign_keys(&self) -> Result<Vec<CatalogForeignKey>> {
        Ok(self.0.lock().unwrap().foreign_keys.clone())
    }

    async fn copy_in(&self, table: &str, columns: &[Column]) -> Result<Box<dyn BulkWriter>> {
        let (fail_after, stall) = {
            let world = self.0.lock().unwrap();
            (world.fail_writes_after.get(table).copied(), world.stall_writes)
        };
        Ok(Box::new(FakeWriter {
            world: self.0.clone(),
            table: table.to_string(),
            width: columns.len(),
            rows: Vec::new(),
            fail_after,
            stall,
        }))
    }
}

/// Rows land in the target only on `finish`.
struct FakeWriter {
    world: Shared,
    table: String,
    width: usize,
    rows: Vec<Vec<SqlValue>>,
    fail_after: Option<usize>,
    stall: bool,
}

#[async_trait]
impl BulkWriter for FakeWriter {
    async fn write_row(&mut self, row: Vec<SqlValue>) -> Result<()> {
        if self.stall {
            futures::future::pending::<()>().await;
        }
        if row.len() != self.width {
            return Err(MigrateError::Conversion("row width mismatch".to_string()));
        }
        if self.fail_after == Some(self.rows.len()) {
            return Err(MigrateError::transfer(&self.table, "connection reset during COPY"));
        }
        self.rows.push(row);
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64> {
        let rows = std::mem::take(&mut self.rows);
        let count = rows.len() as u64;
        self.world
            .lock()
            .unwrap()
            .target
            .entry(self.table.clone())
            .or_default()
            .extend(rows);
        Ok(count)
    }
}
