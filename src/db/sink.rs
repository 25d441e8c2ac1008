//! Transactional row sink backed by sqlx
use anyhow::{Context, Result, anyhow, bail};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Postgres, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::{CONNECT_TIMEOUT, QUERY_TIMEOUT, SQLITE_BUSY_TIMEOUT};
use crate::dataset::{Insert, Value};

/// Destination for the statements produced by one worker
///
/// Everything inserted becomes visible atomically on `commit`. Dropping a sink
/// that was never committed discards everything inserted through it.
#[async_trait::async_trait]
pub trait Sink: Send {
    async fn insert(&mut self, insert: &Insert) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;
}

/// Open transaction for either supported backend
enum Transaction {
    Postgres(sqlx::Transaction<'static, Postgres>),
    Sqlite(sqlx::Transaction<'static, Sqlite>),
}

/// A single connection holding a single transaction for the lifetime of a worker
pub struct SqlSink {
    tx: Option<Transaction>,
    statements: HashMap<&'static str, String>,
}

/// Which backend a database URL addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Backend::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else {
            bail!("Unsupported database URL scheme (expected postgres:// or sqlite:)")
        }
    }
}

impl SqlSink {
    /// Connect and begin the worker's transaction
    pub async fn connect(url: &str) -> Result<Self> {
        let tx = match Backend::from_url(url)? {
            Backend::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(CONNECT_TIMEOUT)
                    .connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                let tx = pool.begin().await.context("Failed to begin transaction")?;
                Transaction::Postgres(tx)
            }
            Backend::Sqlite => {
                let options = SqliteConnectOptions::from_str(url)
                    .context("Invalid SQLite URL")?
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(SQLITE_BUSY_TIMEOUT);
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(CONNECT_TIMEOUT)
                    .connect_with(options)
                    .await
                    .context("Failed to open SQLite database")?;
                let tx = pool.begin().await.context("Failed to begin transaction")?;
                Transaction::Sqlite(tx)
            }
        };

        Ok(Self {
            tx: Some(tx),
            statements: HashMap::new(),
        })
    }
}

fn insert_sql(insert: &Insert, backend: Backend) -> String {
    let placeholders: Vec<String> = (1..=insert.values.len())
        .map(|i| match backend {
            Backend::Postgres => format!("${}", i),
            Backend::Sqlite => "?".to_string(),
        })
        .collect();
    format!(
        "INSERT INTO {} VALUES ({})",
        insert.table,
        placeholders.join(", ")
    )
}

fn bind_postgres<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    values: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for value in values {
        query = match value {
            Value::Text(v) => query.bind(v.as_str()),
            Value::Float(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Flag(v) => query.bind(*v),
            Value::Date(v) => query.bind(*v),
            Value::Time(v) => query.bind(*v),
        };
    }
    query
}

fn bind_sqlite<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            Value::Text(v) => query.bind(v.as_str()),
            Value::Float(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Flag(v) => query.bind(*v),
            Value::Date(v) => query.bind(*v),
            Value::Time(v) => query.bind(*v),
        };
    }
    query
}

#[async_trait::async_trait]
impl Sink for SqlSink {
    async fn insert(&mut self, insert: &Insert) -> Result<()> {
        let Self { tx, statements } = self;
        let tx = tx
            .as_mut()
            .ok_or_else(|| anyhow!("Transaction already committed"))?;
        let backend = match tx {
            Transaction::Postgres(_) => Backend::Postgres,
            Transaction::Sqlite(_) => Backend::Sqlite,
        };
        let sql = statements
            .entry(insert.table)
            .or_insert_with(|| insert_sql(insert, backend));

        let result = match tx {
            Transaction::Postgres(tx) => {
                let query = bind_postgres(sqlx::query(sql.as_str()), &insert.values);
                tokio::time::timeout(QUERY_TIMEOUT, query.execute(&mut **tx))
                    .await
                    .map(|r| r.map(|_| ()))
            }
            Transaction::Sqlite(tx) => {
                let query = bind_sqlite(sqlx::query(sql.as_str()), &insert.values);
                tokio::time::timeout(QUERY_TIMEOUT, query.execute(&mut **tx))
                    .await
                    .map(|r| r.map(|_| ()))
            }
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).with_context(|| format!("Failed to insert into {}", insert.table)),
            Err(_) => Err(anyhow!(
                "Insert into {} timed out after {} seconds",
                insert.table,
                QUERY_TIMEOUT.as_secs()
            )),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let committed = match self.tx.take() {
            Some(Transaction::Postgres(tx)) => tx.commit().await,
            Some(Transaction::Sqlite(tx)) => tx.commit().await,
            None => bail!("Transaction already committed"),
        };
        committed.context("Failed to commit transaction")
    }
}

/// In-memory sink with transactional visibility, for worker tests
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct MemorySink {
        pending: Vec<Insert>,
        committed: Arc<Mutex<Vec<Insert>>>,
        /// Inserts into this table fail, as a constraint violation would
        pub reject_table: Option<&'static str>,
    }

    impl MemorySink {
        pub fn rejecting(table: &'static str) -> Self {
            Self {
                reject_table: Some(table),
                ..Self::default()
            }
        }

        pub fn committed(&self) -> Vec<Insert> {
            self.committed.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Sink for MemorySink {
        async fn insert(&mut self, insert: &Insert) -> Result<()> {
            if self.reject_table == Some(insert.table) {
                bail!("constraint violation on {}", insert.table);
            }
            self.pending.push(insert.clone());
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            self.committed
                .lock()
                .unwrap()
                .extend(self.pending.drain(..));
            Ok(())
        }
    }
}
