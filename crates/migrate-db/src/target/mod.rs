//! PostgreSQL target database operations.

pub mod copy;
pub mod tls;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use tokio_postgres::{CopyInSink, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};
use crate::pool::ConnectionManager;
use crate::schema::{
    CatalogColumn, CatalogForeignKey, Column, ForeignKey, ReferentialAction, COLUMNS_QUERY,
    FOREIGN_KEYS_QUERY,
};
use crate::value::SqlValue;

use self::copy::BinaryCopyEncoder;
use self::tls::connector;

/// Schema every target table lives in.
pub const TARGET_SCHEMA: &str = "public";

/// Buffered COPY data is sent once it reaches this size.
const COPY_FLUSH_BYTES: usize = 1024 * 1024;

/// Operations the migration needs from a target connection.
#[async_trait]
pub trait TargetConnection: Send + Sync {
    /// Run one or more `;`-separated statements.
    async fn execute_script(&self, script: &str) -> Result<()>;

    /// Rows of the column catalog query.
    async fn catalog_columns(&self) -> Result<Vec<CatalogColumn>>;

    /// Rows of the foreign-key catalog query.
    async fn catalog_foreign_keys(&self) -> Result<Vec<CatalogForeignKey>>;

    /// Open a binary COPY into `table` with the given column order.
    async fn copy_in(&self, table: &str, columns: &[Column]) -> Result<Box<dyn BulkWriter>>;

    /// Empty `table` and everything that references it.
    async fn truncate_cascade(&self, table: &str) -> Result<()> {
        self.execute_script(&truncate_statement(table)).await
    }

    /// Make the next `nextval` of `sequence` return `next`.
    async fn restart_sequence(&self, sequence: &str, next: i64) -> Result<()> {
        self.execute_script(&restart_sequence_statement(sequence, next))
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.execute_script("SELECT 1").await
    }
}

/// An open bulk load. Rows become visible only after [`finish`](Self::finish);
/// dropping the writer aborts the load.
#[async_trait]
pub trait BulkWriter: Send {
    async fn write_row(&mut self, row: Vec<SqlValue>) -> Result<()>;

    /// Commit the load and return the number of rows written.
    async fn finish(&mut self) -> Result<u64>;
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"public"."<table>"`
pub fn qualify_table(table: &str) -> String {
    format!("{}.{}", quote_ident(TARGET_SCHEMA), quote_ident(table))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn truncate_statement(table: &str) -> String {
    format!("TRUNCATE TABLE {} CASCADE", qualify_table(table))
}

pub fn copy_statement(table: &str, columns: &[Column]) -> String {
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    format!(
        "COPY {} ({}) FROM STDIN (FORMAT BINARY)",
        qualify_table(table),
        column_list(&names)
    )
}

/// The sequence name is the `regclass` text from the column default and is
/// used as written.
pub fn restart_sequence_statement(sequence: &str, next: i64) -> String {
    format!("ALTER SEQUENCE {} RESTART WITH {}", sequence, next)
}

pub fn drop_foreign_key_statement(table: &str, fk: &ForeignKey) -> String {
    format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
        qualify_table(table),
        quote_ident(&fk.name)
    )
}

pub fn add_foreign_key_statement(table: &str, fk: &ForeignKey) -> String {
    let mut sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}.{} ({})",
        qualify_table(table),
        quote_ident(&fk.name),
        column_list(&fk.columns),
        quote_ident(&fk.referenced_schema),
        quote_ident(&fk.referenced_table),
        column_list(&fk.referenced_columns)
    );
    if fk.on_delete != ReferentialAction::NoAction {
        sql.push_str(" ON DELETE ");
        sql.push_str(fk.on_delete.as_sql());
    }
    if fk.on_update != ReferentialAction::NoAction {
        sql.push_str(" ON UPDATE ");
        sql.push_str(fk.on_update.as_sql());
    }
    sql.push(';');
    sql
}

/// Opens tokio-postgres connections.
pub struct PgManager {
    config: tokio_postgres::Config,
    tls: Option<MakeRustlsConnect>,
}

impl PgManager {
    pub fn new(target: &TargetConfig) -> Result<Self> {
        let config = target.pg_config()?;
        let tls = connector(target.ssl_mode()?)?;
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ConnectionManager for PgManager {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        let client = match &self.tls {
            Some(tls) => {
                let (client, connection) = self.config.connect(tls.clone()).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("PostgreSQL connection closed with error: {}", e);
                    }
                });
                client
            }
            None => {
                let (client, connection) = self.config.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("PostgreSQL connection closed with error: {}", e);
                    }
                });
                client
            }
        };
        Ok(PgConnection { client })
    }

    fn engine(&self) -> &'static str {
        "postgres"
    }
}

/// An open PostgreSQL session. Dropping it closes the connection.
pub struct PgConnection {
    client: tokio_postgres::Client,
}

#[async_trait]
impl TargetConnection for PgConnection {
    async fn execute_script(&self, script: &str) -> Result<()> {
        debug!("{}", script);
        self.client.batch_execute(script).await?;
        Ok(())
    }

    async fn catalog_columns(&self) -> Result<Vec<CatalogColumn>> {
        let rows = self.client.query(COLUMNS_QUERY, &[]).await?;
        rows.iter()
            .map(|row| -> Result<CatalogColumn> {
                Ok(CatalogColumn {
                    table_name: row.try_get(0)?,
                    column_name: row.try_get(1)?,
                    data_type: row.try_get(2)?,
                    column_default: row.try_get(3)?,
                })
            })
            .collect()
    }

    async fn catalog_foreign_keys(&self) -> Result<Vec<CatalogForeignKey>> {
        let rows = self.client.query(FOREIGN_KEYS_QUERY, &[]).await?;
        rows.iter()
            .map(|row| -> Result<CatalogForeignKey> {
                Ok(CatalogForeignKey {
                    constraint_name: row.try_get(0)?,
                    table_name: row.try_get(1)?,
                    column_name: row.try_get(2)?,
                    referenced_schema: row.try_get(3)?,
                    referenced_table: row.try_get(4)?,
                    referenced_column: row.try_get(5)?,
                    on_delete: row.try_get(6)?,
                    on_update: row.try_get(7)?,
                })
            })
            .collect()
    }

    async fn copy_in(&self, table: &str, columns: &[Column]) -> Result<Box<dyn BulkWriter>> {
        let sql = copy_statement(table, columns);
        debug!("{}", sql);
        let sink = self.client.copy_in::<_, Bytes>(sql.as_str()).await?;
        Ok(Box::new(PgCopyWriter {
            table: table.to_string(),
            columns: columns.to_vec(),
            sink: Box::pin(sink),
            encoder: BinaryCopyEncoder::new(),
        }))
    }
}

/// The server's row count for a finished COPY must match the rows encoded.
fn check_committed(table: &str, encoded: u64, committed: u64) -> Result<u64> {
    if encoded != committed {
        return Err(MigrateError::transfer(
            table,
            format!("COPY committed {} rows but {} were sent", committed, encoded),
        ));
    }
    Ok(committed)
}

/// Streams PGCOPY frames into a `COPY ... FROM STDIN` sink.
struct PgCopyWriter {
    table: String,
    columns: Vec<Column>,
    sink: Pin<Box<CopyInSink<Bytes>>>,
    encoder: BinaryCopyEncoder,
}

#[async_trait]
impl BulkWriter for PgCopyWriter {
    async fn write_row(&mut self, row: Vec<SqlValue>) -> Result<()> {
        self.encoder.encode_row(&self.columns, &row)?;
        if self.encoder.buffered() >= COPY_FLUSH_BYTES {
            self.sink.send(self.encoder.take()).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64> {
        self.sink.send(self.encoder.finish()).await?;
        let committed = self.sink.as_mut().finish().await?;
        let rows = check_committed(&self.table, self.encoder.rows(), committed)?;
        info!("{}: COPY committed {} rows", self.table, rows);
        Ok(rows)
    }
}
