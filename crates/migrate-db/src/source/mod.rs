//! SQL Server source: connection manager and row streaming.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::stream::{BoxStream, StreamExt};
use rust_decimal::Decimal;
use tiberius::{Client, ColumnData, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::pool::ConnectionManager;
use crate::value::SqlValue;

/// Rows of one table, in source order.
pub type RowStream<'a> = BoxStream<'a, Result<Vec<SqlValue>>>;

/// Operations the migration needs from a source connection.
#[async_trait]
pub trait SourceConnection: Send {
    /// Stream every row of `table`, selecting exactly `columns` in order.
    async fn read_table<'a>(
        &'a mut self,
        table: &'a str,
        columns: &'a [String],
    ) -> Result<RowStream<'a>>;

    /// Round-trip a trivial query.
    async fn ping(&mut self) -> Result<()>;
}

/// Quote an identifier with brackets, doubling embedded `]`.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `SELECT [c1], [c2] FROM [schema].[table]`
pub fn select_statement(schema: &str, table: &str, columns: &[String]) -> String {
    let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "SELECT {} FROM {}.{}",
        cols.join(", "),
        quote_ident(schema),
        quote_ident(table)
    )
}

/// Opens tiberius connections from an ADO.NET connection string.
pub struct MssqlManager {
    config: tiberius::Config,
    schema: String,
}

impl MssqlManager {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let config = tiberius::Config::from_ado_string(&source.connection_string).map_err(|e| {
            MigrateError::Config(format!("invalid source.connection_string: {}", e))
        })?;
        Ok(Self {
            config,
            schema: source.schema.clone(),
        })
    }

    async fn open(config: tiberius::Config) -> Result<Client<Compat<TcpStream>>> {
        let addr = config.get_addr();
        let tcp = TcpStream::connect(addr.as_str())
            .await
            .map_err(|e| MigrateError::pool(e, format!("connecting to SQL Server at {}", addr)))?;
        tcp.set_nodelay(true).ok();

        match Client::connect(config.clone(), tcp.compat_write()).await {
            Ok(client) => Ok(client),
            // Azure SQL may redirect the login to another node.
            Err(tiberius::error::Error::Routing { host, port }) => {
                info!("SQL Server redirected connection to {}:{}", host, port);
                let mut config = config;
                config.host(&host);
                config.port(port);
                let addr = config.get_addr();
                let tcp = TcpStream::connect(addr.as_str()).await.map_err(|e| {
                    MigrateError::pool(e, format!("connecting to SQL Server at {}", addr))
                })?;
                tcp.set_nodelay(true).ok();
                Ok(Client::connect(config, tcp.compat_write()).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConnectionManager for MssqlManager {
    type Connection = MssqlConnection;

    async fn connect(&self) -> Result<MssqlConnection> {
        let client = Self::open(self.config.clone()).await?;
        Ok(MssqlConnection {
            client,
            schema: self.schema.clone(),
        })
    }

    fn engine(&self) -> &'static str {
        "mssql"
    }
}

/// An open SQL Server session.
pub struct MssqlConnection {
    client: Client<Compat<TcpStream>>,
    schema: String,
}

#[async_trait]
impl SourceConnection for MssqlConnection {
    async fn read_table<'a>(
        &'a mut self,
        table: &'a str,
        columns: &'a [String],
    ) -> Result<RowStream<'a>> {
        let sql = select_statement(&self.schema, table, columns);
        debug!("{}", sql);

        let stream = self.client.simple_query(sql).await?.into_row_stream();
        Ok(stream
            .map(|row| -> Result<Vec<SqlValue>> {
                let row = row?;
                row.into_iter().map(decode_column).collect()
            })
            .boxed())
    }

    async fn ping(&mut self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }
}

/// Convert one TDS column value.
pub fn decode_column(data: ColumnData<'static>) -> Result<SqlValue> {
    let value = match data {
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::U8(v) => v.map(|v| SqlValue::I16(i16::from(v))),
        ColumnData::I16(v) => v.map(SqlValue::I16),
        ColumnData::I32(v) => v.map(SqlValue::I32),
        ColumnData::I64(v) => v.map(SqlValue::I64),
        ColumnData::F32(v) => v.map(SqlValue::F32),
        ColumnData::F64(v) => v.map(SqlValue::F64),
        ColumnData::String(v) => v.map(|s| SqlValue::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid),
        ColumnData::Binary(v) => v.map(|b| SqlValue::Bytes(b.into_owned())),
        ColumnData::Xml(v) => v.map(|x| SqlValue::Text(x.into_owned().into_string())),
        ColumnData::Numeric(_) => Decimal::from_sql(&data)?.map(SqlValue::Decimal),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)?.map(SqlValue::DateTime)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(&data)?.map(SqlValue::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)?.map(SqlValue::Time),
        ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(&data)?.map(SqlValue::DateTimeOffset)
        }
    };
    Ok(value.unwrap_or(SqlValue::Null))
}
