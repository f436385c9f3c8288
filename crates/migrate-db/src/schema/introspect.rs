//! Catalog introspection of the target `public` schema.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use super::{Column, ColumnKind, DataType, ForeignKey, ReferentialAction, Table};
use crate::error::Result;
use crate::pool::{ConnectionManager, ConnectionPool};
use crate::target::TargetConnection;

/// Every column of every base table in `public`, in table then ordinal order.
pub const COLUMNS_QUERY: &str = r#"
SELECT
    c.table_name::text,
    c.column_name::text,
    c.data_type::text,
    c.column_default::text
FROM information_schema.columns AS c
JOIN information_schema.tables AS t
    ON t.table_schema = c.table_schema
    AND t.table_name = c.table_name
WHERE c.table_schema = 'public'
    AND t.table_type = 'BASE TABLE'
ORDER BY c.table_name, c.ordinal_position
"#;

/// One row per foreign-key column pair, in key order.
pub const FOREIGN_KEYS_QUERY: &str = r#"
SELECT
    con.conname::text,
    rel.relname::text,
    att.attname::text,
    fnsp.nspname::text,
    frel.relname::text,
    fatt.attname::text,
    con.confdeltype::text,
    con.confupdtype::text
FROM pg_constraint AS con
JOIN pg_class AS rel ON rel.oid = con.conrelid
JOIN pg_namespace AS nsp ON nsp.oid = rel.relnamespace
JOIN pg_class AS frel ON frel.oid = con.confrelid
JOIN pg_namespace AS fnsp ON fnsp.oid = frel.relnamespace
CROSS JOIN LATERAL unnest(con.conkey, con.confkey)
    WITH ORDINALITY AS k(attnum, fattnum, position)
JOIN pg_attribute AS att
    ON att.attrelid = con.conrelid AND att.attnum = k.attnum
JOIN pg_attribute AS fatt
    ON fatt.attrelid = con.confrelid AND fatt.attnum = k.fattnum
WHERE con.contype = 'f'
    AND nsp.nspname = 'public'
ORDER BY rel.relname, con.conname, k.position
"#;

static NEXTVAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)nextval\(\s*'?(?P<name>.+?)'?\s*::\s*regclass\s*\)")
        .expect("nextval pattern is valid")
});

/// A row of [`COLUMNS_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumn {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub column_default: Option<String>,
}

/// A row of [`FOREIGN_KEYS_QUERY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogForeignKey {
    pub constraint_name: String,
    pub table_name: String,
    pub column_name: String,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_column: String,
    /// `confdeltype` code.
    pub on_delete: String,
    /// `confupdtype` code.
    pub on_update: String,
}

/// Extract the sequence behind a `nextval('...'::regclass)` default.
pub fn parse_sequence_name(column_default: &str) -> Option<String> {
    NEXTVAL_RE
        .captures(column_default)
        .and_then(|caps| caps.name("name"))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Build the table model from raw catalog rows.
///
/// Tables keep the order in which they first appear in `columns`.
pub fn assemble_tables(
    columns: Vec<CatalogColumn>,
    foreign_keys: Vec<CatalogForeignKey>,
) -> Vec<Table> {
    let mut tables: Vec<Table> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in columns {
        let kind = match row.column_default.as_deref().and_then(parse_sequence_name) {
            Some(sequence_name) => ColumnKind::Identity { sequence_name },
            None => ColumnKind::Plain,
        };
        let column = Column {
            name: row.column_name,
            data_type: DataType::from_catalog(&row.data_type),
            kind,
        };

        let pos = *index.entry(row.table_name.clone()).or_insert_with(|| {
            tables.push(Table {
                name: row.table_name.clone(),
                columns: Vec::new(),
                foreign_keys: Vec::new(),
            });
            tables.len() - 1
        });
        tables[pos].columns.push(column);
    }

    for row in foreign_keys {
        let Some(&pos) = index.get(&row.table_name) else {
            warn!(
                "Foreign key {} belongs to unknown table {}, ignoring",
                row.constraint_name, row.table_name
            );
            continue;
        };
        let fks = &mut tables[pos].foreign_keys;
        match fks.iter_mut().find(|fk| fk.name == row.constraint_name) {
            Some(fk) => {
                fk.columns.push(row.column_name);
                fk.referenced_columns.push(row.referenced_column);
            }
            None => fks.push(ForeignKey {
                name: row.constraint_name,
                columns: vec![row.column_name],
                referenced_schema: row.referenced_schema,
                referenced_table: row.referenced_table,
                referenced_columns: vec![row.referenced_column],
                on_delete: ReferentialAction::from_code(&row.on_delete),
                on_update: ReferentialAction::from_code(&row.on_update),
            }),
        }
    }

    tables
}

/// Reads the table model from the target catalog.
pub struct SchemaIntrospector<M: ConnectionManager> {
    pool: Arc<ConnectionPool<M>>,
}

impl<M> SchemaIntrospector<M>
where
    M: ConnectionManager,
    M::Connection: TargetConnection,
{
    pub fn new(pool: Arc<ConnectionPool<M>>) -> Self {
        Self { pool }
    }

    /// Load every table with its columns and foreign keys.
    ///
    /// An empty catalog yields an empty list. Any query failure aborts.
    pub async fn discover(&self) -> Result<Vec<Table>> {
        let conn = self.pool.acquire().await?;
        let columns = conn.catalog_columns().await?;
        let foreign_keys = conn.catalog_foreign_keys().await?;
        drop(conn);

        debug!(
            "Catalog returned {} column rows and {} foreign key rows",
            columns.len(),
            foreign_keys.len()
        );

        let tables = assemble_tables(columns, foreign_keys);
        info!(
            "Discovered {} tables ({} foreign keys, {} identity columns)",
            tables.len(),
            tables.iter().map(|t| t.foreign_keys.len()).sum::<usize>(),
            tables.iter().filter(|t| t.identity_column().is_some()).count()
        );
        Ok(tables)
    }
}
