//! SQLite store adapter.
//!
//! Everything klite persists goes through the [`Store`] trait: a thin
//! contract of single-statement `execute` and transactional `batch` over a
//! SQL engine with auto-incrementing row ids. [`SqliteStore`] is the
//! shipped implementation; the trait exists so another engine with the same
//! properties can be dropped in.
//!
//! The adapter deliberately knows nothing about topics, offsets or the
//! dispatcher — callers hand it finished SQL. The one piece of domain
//! knowledge it owns is table naming: partition logs live in
//! `klite_<topic>_<partition>` and the identifier is always quoted, because
//! topic names may contain hyphens and similar punctuation.

mod error;

pub use error::{Result, StoreError};

use async_trait::async_trait;
use bytes::Bytes;
use error::classify;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row as _, TypeInfo as _, ValueRef as _};
use std::path::Path;
use tracing::debug;

/// Name of the shared consumer offsets table.
pub const OFFSETS_TABLE: &str = "klite_consumer_offsets";

/// Quoted table identifier for a partition log.
///
/// Topic strings are embedded directly into the identifier, so the name is
/// always double-quoted and topics containing a quote character are
/// rejected.
pub fn partition_table(topic: &str, partition: u32) -> Result<String> {
    if topic.contains('"') {
        return Err(StoreError::InvalidTopic(topic.to_string()));
    }
    Ok(format!("\"klite_{topic}_{partition}\""))
}

/// A dynamically typed SQL value, both as bind argument and result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Blob(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<Bytes> for SqlValue {
    fn from(v: Bytes) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

/// A single parameterized SQL statement.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Append a positional bind argument.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// One row of a result set, in SELECT column order.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of executing one statement.
#[derive(Debug)]
pub struct StatementResult {
    pub rows: Vec<Row>,
    /// Rowid produced by the most recent insert on the connection.
    /// Meaningful only for INSERT statements; consecutive inserts in a
    /// batch also satisfy `first + index`.
    pub last_insert_rowid: i64,
}

/// Thin contract over the SQL engine.
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute a single statement.
    async fn execute(&self, stmt: Statement) -> Result<StatementResult>;

    /// Execute statements in order inside one transaction. Either every
    /// statement commits or none does; the error of the first failing
    /// statement is returned.
    async fn batch(&self, stmts: Vec<Statement>) -> Result<Vec<StatementResult>>;
}

/// SQLite-backed [`Store`] on a connection pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a file-backed database in WAL mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        debug!(path = %path.as_ref().display(), "opened sqlite store");
        Ok(Self { pool })
    }

    /// In-memory database, for tests and experiments.
    ///
    /// The pool is pinned to a single connection: every pooled `:memory:`
    /// connection would otherwise open its own private, empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    async fn run(conn: &mut SqliteConnection, stmt: &Statement) -> Result<StatementResult> {
        let mut query = sqlx::query(&stmt.sql);
        for arg in &stmt.args {
            query = match arg {
                SqlValue::Null => query.bind(Option::<i64>::None),
                SqlValue::Integer(v) => query.bind(*v),
                SqlValue::Real(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.clone()),
                SqlValue::Blob(v) => query.bind(v.clone()),
            };
        }

        let raw_rows = query.fetch_all(&mut *conn).await.map_err(classify)?;
        let rows = raw_rows
            .iter()
            .map(convert_row)
            .collect::<Result<Vec<Row>>>()?;

        // Read back on the same connection so the value belongs to this
        // statement and not to some other pooled connection's work.
        let last_insert_rowid = sqlx::query_scalar::<_, i64>("SELECT last_insert_rowid()")
            .fetch_one(&mut *conn)
            .await
            .map_err(classify)?;

        Ok(StatementResult {
            rows,
            last_insert_rowid,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn execute(&self, stmt: Statement) -> Result<StatementResult> {
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        Self::run(&mut conn, &stmt).await
    }

    async fn batch(&self, stmts: Vec<Statement>) -> Result<Vec<StatementResult>> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let mut results = Vec::with_capacity(stmts.len());
        for stmt in &stmts {
            match Self::run(&mut tx, stmt).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    // Report the statement's error even if rollback fails;
                    // dropping the transaction rolls back regardless.
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            }
        }

        tx.commit().await.map_err(classify)?;
        Ok(results)
    }
}

fn convert_row(row: &SqliteRow) -> Result<Row> {
    let mut values = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        let raw = row.try_get_raw(index).map_err(classify)?;
        let value = if raw.is_null() {
            SqlValue::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => SqlValue::Integer(row.try_get::<i64, _>(index).map_err(classify)?),
                "REAL" => SqlValue::Real(row.try_get::<f64, _>(index).map_err(classify)?),
                "BLOB" => SqlValue::Blob(row.try_get::<Vec<u8>, _>(index).map_err(classify)?),
                _ => SqlValue::Text(row.try_get::<String, _>(index).map_err(classify)?),
            }
        };
        values.push(value);
    }
    Ok(Row { values })
}
