//! Table, column and foreign-key model of the target schema.
//!
//! The model is built once per run by [`SchemaIntrospector`] from the
//! PostgreSQL catalog and is immutable afterwards.

mod introspect;

pub use introspect::{
    assemble_tables, parse_sequence_name, CatalogColumn, CatalogForeignKey, SchemaIntrospector,
    COLUMNS_QUERY, FOREIGN_KEYS_QUERY,
};

use serde::{Deserialize, Serialize};

/// Canonical column type tag, derived from the catalog `data_type` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Text,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    TimeTz,
    Integer,
    SmallInt,
    BigInt,
    Boolean,
    Real,
    Double,
    Numeric,
    Uuid,
    Bytea,
    Json,
    /// Written with the version-1 prefix byte.
    Jsonb,
    /// Any other catalog type. Values are written with their native encoding.
    Unknown,
}

impl DataType {
    /// Map an `information_schema.columns.data_type` value. Never fails.
    pub fn from_catalog(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "character varying" | "text" | "character" => DataType::Text,
            "timestamp without time zone" => DataType::Timestamp,
            "timestamp with time zone" => DataType::TimestampTz,
            "date" => DataType::Date,
            "time without time zone" => DataType::Time,
            "time with time zone" => DataType::TimeTz,
            "integer" => DataType::Integer,
            "smallint" => DataType::SmallInt,
            "bigint" => DataType::BigInt,
            "boolean" => DataType::Boolean,
            "real" => DataType::Real,
            "double precision" => DataType::Double,
            "numeric" => DataType::Numeric,
            "uuid" => DataType::Uuid,
            "bytea" => DataType::Bytea,
            "json" => DataType::Json,
            "jsonb" => DataType::Jsonb,
            _ => DataType::Unknown,
        }
    }
}

/// Whether a column is fed by a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Plain,
    /// Default is `nextval('<sequence_name>'::regclass)`.
    Identity { sequence_name: String },
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub kind: ColumnKind,
}

impl Column {
    pub fn plain(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            kind: ColumnKind::Plain,
        }
    }

    pub fn identity(
        name: impl Into<String>,
        data_type: DataType,
        sequence_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            kind: ColumnKind::Identity {
                sequence_name: sequence_name.into(),
            },
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.kind, ColumnKind::Identity { .. })
    }

    pub fn sequence_name(&self) -> Option<&str> {
        match &self.kind {
            ColumnKind::Identity { sequence_name } => Some(sequence_name),
            ColumnKind::Plain => None,
        }
    }
}

/// ON DELETE / ON UPDATE behaviour of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Decode a `pg_constraint.confdeltype`/`confupdtype` code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "r" => ReferentialAction::Restrict,
            "c" => ReferentialAction::Cascade,
            "n" => ReferentialAction::SetNull,
            "d" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// Foreign key constraint metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Owning columns, in key order.
    pub columns: Vec<String>,

    /// Schema of the referenced table.
    pub referenced_schema: String,

    pub referenced_table: String,

    /// Referenced columns, paired positionally with `columns`.
    pub referenced_columns: Vec<String>,

    pub on_delete: ReferentialAction,

    pub on_update: ReferentialAction,
}

impl ForeignKey {
    /// First owning column; the whole key for single-column constraints.
    pub fn column_name(&self) -> &str {
        self.columns.first().map(String::as_str).unwrap_or_default()
    }

    /// First referenced column.
    pub fn referenced_column(&self) -> &str {
        self.referenced_columns
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,

    /// Columns in ordinal order. The SELECT and COPY column lists follow it.
    pub columns: Vec<Column>,

    /// Foreign keys owned by this table. Empty when there are none.
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    /// First identity column, if any.
    pub fn identity_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_identity())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_type_mapping() {
        assert_eq!(DataType::from_catalog("character varying"), DataType::Text);
        assert_eq!(DataType::from_catalog("text"), DataType::Text);
        assert_eq!(
            DataType::from_catalog("timestamp without time zone"),
            DataType::Timestamp
        );
        assert_eq!(DataType::from_catalog("integer"), DataType::Integer);
        assert_eq!(DataType::from_catalog("smallint"), DataType::SmallInt);
        assert_eq!(DataType::from_catalog("boolean"), DataType::Boolean);
        assert_eq!(DataType::from_catalog("double precision"), DataType::Double);
        assert_eq!(DataType::from_catalog("numeric"), DataType::Numeric);
        assert_eq!(DataType::from_catalog("bigint"), DataType::BigInt);
        assert_eq!(DataType::from_catalog("uuid"), DataType::Uuid);
        assert_eq!(DataType::from_catalog("json"), DataType::Json);
        assert_eq!(DataType::from_catalog("jsonb"), DataType::Jsonb);
        assert_eq!(DataType::from_catalog("time with time zone"), DataType::TimeTz);
    }

    #[test]
    fn test_unmapped_types_degrade_to_unknown() {
        assert_eq!(DataType::from_catalog("interval"), DataType::Unknown);
        assert_eq!(DataType::from_catalog("USER-DEFINED"), DataType::Unknown);
        assert_eq!(DataType::from_catalog(""), DataType::Unknown);
    }

    #[test]
    fn test_identity_is_derived_from_kind() {
        let id = Column::identity("id", DataType::Integer, "orders_id_seq");
        let name = Column::plain("name", DataType::Text);
        assert!(id.is_identity());
        assert_eq!(id.sequence_name(), Some("orders_id_seq"));
        assert!(!name.is_identity());
        assert_eq!(name.sequence_name(), None);
    }

    #[test]
    fn test_identity_column_is_first_found() {
        let table = Table {
            name: "t".into(),
            columns: vec![
                Column::plain("a", DataType::Text),
                Column::identity("b", DataType::BigInt, "t_b_seq"),
                Column::identity("c", DataType::BigInt, "t_c_seq"),
            ],
            foreign_keys: vec![],
        };
        assert_eq!(table.identity_column().map(|c| c.name.as_str()), Some("b"));
        assert_eq!(table.column_names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_referential_action_codes() {
        assert_eq!(ReferentialAction::from_code("a"), ReferentialAction::NoAction);
        assert_eq!(ReferentialAction::from_code("c"), ReferentialAction::Cascade);
        assert_eq!(ReferentialAction::from_code("n").as_sql(), "SET NULL");
    }
}
