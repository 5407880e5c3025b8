//! SQL Server connection and query execution.
//!
//! Connections are opened per operation and dropped when done; the driver's
//! own pooling (none) is not supplemented because every caller is a single
//! short-lived statement or catalog walk. Generated statements run through
//! [`QueryExecutor`], a seam the orchestrator tests mock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tiberius::{AuthMethod, Client, ColumnData, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::MssqlConfig;

pub type MssqlClient = Client<Compat<TcpStream>>;

/// Column names plus rows converted to JSON values.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Executes one SQL statement against a named database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn run(&self, database: &str, sql: &str) -> Result<QueryOutput>;
}

/// Production executor backed by tiberius.
pub struct MssqlExecutor {
    config: MssqlConfig,
}

impl MssqlExecutor {
    pub fn new(config: MssqlConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QueryExecutor for MssqlExecutor {
    async fn run(&self, database: &str, sql: &str) -> Result<QueryOutput> {
        let mut client = connect(&self.config, database).await?;
        run_query(&mut client, sql).await
    }
}

/// Open a fresh connection to the given database.
pub async fn connect(config: &MssqlConfig, database: &str) -> Result<MssqlClient> {
    let password = config.resolved_password()?;

    let mut tds = tiberius::Config::new();
    tds.host(&config.host);
    tds.port(config.port);
    tds.database(database);
    tds.authentication(AuthMethod::sql_server(&config.user, password));
    // The containerized server ships a self-signed certificate.
    tds.trust_cert();

    let tcp = TcpStream::connect(tds.get_addr())
        .await
        .with_context(|| format!("Failed to reach SQL Server at {}:{}", config.host, config.port))?;
    tcp.set_nodelay(true)?;

    let client = Client::connect(tds, tcp.compat_write())
        .await
        .context("SQL Server login failed")?;
    Ok(client)
}

/// Run one statement and collect the first result set.
pub async fn run_query(client: &mut MssqlClient, sql: &str) -> Result<QueryOutput> {
    let stream = client.simple_query(sql).await?;
    let results = stream.into_results().await?;

    let rows = match results.into_iter().find(|set| !set.is_empty()) {
        Some(rows) => rows,
        None => return Ok(QueryOutput::default()),
    };

    let columns: Vec<String> = rows[0]
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let mut out_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(columns.len());
        for data in row.into_iter() {
            values.push(column_data_to_json(&data));
        }
        out_rows.push(values);
    }

    Ok(QueryOutput {
        columns,
        rows: out_rows,
    })
}

fn column_data_to_json(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::Bit(v) => (*v).map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::U8(v) => (*v).map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => (*v).map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => (*v).map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => (*v).map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => (*v)
            .map(|f| Value::from(f64::from(f)))
            .unwrap_or(Value::Null),
        ColumnData::F64(v) => (*v).map(Value::from).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => (*v)
            .map(|g| Value::String(g.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Numeric(v) => (*v)
            .map(|n| Value::String(n.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(format!("0x{}", hex::encode(b.as_ref()))))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono::NaiveDateTime::from_sql(data)
                .ok()
                .flatten()
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null)
        }
        ColumnData::Date(_) => chrono::NaiveDate::from_sql(data)
            .ok()
            .flatten()
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Time(_) => chrono::NaiveTime::from_sql(data)
            .ok()
            .flatten()
            .map(|t| Value::String(t.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTimeOffset(_) => chrono::DateTime::<chrono::Utc>::from_sql(data)
            .ok()
            .flatten()
            .map(|d| Value::String(d.to_rfc3339()))
            .unwrap_or(Value::Null),
        other => Value::String(format!("{:?}", other)),
    }
}
