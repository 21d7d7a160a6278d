//! PostgreSQL Durable Store
//!
//! Connection pooling via deadpool-postgres and a `DurableStore`
//! implementation over a single `documents` table:
//!
//! ```sql
//! CREATE TABLE documents (
//!     url              TEXT PRIMARY KEY,
//!     text             TEXT NOT NULL,
//!     fetch_time       BIGINT,
//!     pub_date         BIGINT,
//!     first_fetch_time BIGINT
//! )
//! ```
//!
//! Timestamps are unsigned on the wire and signed in PostgreSQL. They are
//! stored bit-for-bit, so values above `i64::MAX` read back unchanged but
//! sort as negative inside the database.

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use docsync_core::{DocSyncError, DocSyncResult, Document, StorageError, Timestamp};
use docsync_storage::DurableStore;
use serde::Deserialize;
use std::time::Duration;
use tokio_postgres::{NoTls, Row};

use crate::constants::{
    DEFAULT_DB_HOST, DEFAULT_DB_NAME, DEFAULT_DB_POOL_SIZE, DEFAULT_DB_PORT,
    DEFAULT_DB_TIMEOUT_SECS, DEFAULT_DB_USER,
};

const BACKEND: &str = "postgres";

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS documents (
    url TEXT PRIMARY KEY,
    text TEXT NOT NULL,
    fetch_time BIGINT,
    pub_date BIGINT,
    first_fetch_time BIGINT
)";

const SELECT_SQL: &str =
    "SELECT url, text, fetch_time, pub_date, first_fetch_time FROM documents WHERE url = $1";

const INSERT_SQL: &str = "INSERT INTO documents (url, text, fetch_time, pub_date, first_fetch_time)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (url) DO NOTHING";

const UPDATE_SQL: &str = "UPDATE documents
    SET text = $2, fetch_time = $3, pub_date = $4, first_fetch_time = $5
    WHERE url = $1";

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            dbname: DEFAULT_DB_NAME.to_string(),
            user: DEFAULT_DB_USER.to_string(),
            password: String::new(),
            max_size: DEFAULT_DB_POOL_SIZE,
            timeout_secs: DEFAULT_DB_TIMEOUT_SECS,
        }
    }
}

impl DbConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> DocSyncResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.connect_timeout = Some(self.timeout());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = PoolConfig::new(self.max_size.max(1));
        pool_config.timeouts.wait = Some(self.timeout());
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::backend(BACKEND, format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

// ============================================================================
// DURABLE STORE
// ============================================================================

/// `DurableStore` backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: Pool,
}

impl PgDocumentStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a store from configuration.
    pub fn from_config(config: &DbConfig) -> DocSyncResult<Self> {
        let pool = config.create_pool()?;
        Ok(Self::new(pool))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Create the documents table if it does not exist.
    pub async fn ensure_schema(&self) -> DocSyncResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(CREATE_TABLE_SQL).await.map_err(pg_error)?;
        tracing::info!("Documents table ready");
        Ok(())
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> DocSyncResult<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::backend(BACKEND, format!("Failed to get connection: {}", e)).into())
    }
}

#[async_trait]
impl DurableStore for PgDocumentStore {
    async fn get(&self, url: &str) -> DocSyncResult<Option<Document>> {
        let conn = self.get_conn().await?;
        let row = conn.query_opt(SELECT_SQL, &[&url]).await.map_err(pg_error)?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn insert(&self, doc: &Document) -> DocSyncResult<()> {
        let conn = self.get_conn().await?;
        let (fetch_time, pub_date, first_fetch_time) = timestamp_params(doc);
        let inserted = conn
            .execute(
                INSERT_SQL,
                &[&doc.url, &doc.text, &fetch_time, &pub_date, &first_fetch_time],
            )
            .await
            .map_err(pg_error)?;

        if inserted == 0 {
            return Err(StorageError::AlreadyExists {
                url: doc.url.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn update(&self, doc: &Document) -> DocSyncResult<()> {
        let conn = self.get_conn().await?;
        let (fetch_time, pub_date, first_fetch_time) = timestamp_params(doc);
        let updated = conn
            .execute(
                UPDATE_SQL,
                &[&doc.url, &doc.text, &fetch_time, &pub_date, &first_fetch_time],
            )
            .await
            .map_err(pg_error)?;

        if updated == 0 {
            return Err(StorageError::NotFound {
                url: doc.url.clone(),
            }
            .into());
        }
        Ok(())
    }
}

fn pg_error(e: tokio_postgres::Error) -> DocSyncError {
    StorageError::backend(BACKEND, e).into()
}

fn document_from_row(row: &Row) -> DocSyncResult<Document> {
    let read = |e: tokio_postgres::Error| StorageError::Serialization {
        reason: format!("bad documents row: {}", e),
    };
    let fetch_time: Option<i64> = row.try_get("fetch_time").map_err(read)?;
    let pub_date: Option<i64> = row.try_get("pub_date").map_err(read)?;
    let first_fetch_time: Option<i64> = row.try_get("first_fetch_time").map_err(read)?;

    Ok(Document {
        url: row.try_get("url").map_err(read)?,
        text: row.try_get("text").map_err(read)?,
        fetch_time: from_sql_timestamp(fetch_time.unwrap_or(0)),
        pub_date: from_sql_timestamp(pub_date.unwrap_or(0)),
        first_fetch_time: from_sql_timestamp(first_fetch_time.unwrap_or(0)),
    })
}

fn timestamp_params(doc: &Document) -> (i64, i64, i64) {
    (
        to_sql_timestamp(doc.fetch_time),
        to_sql_timestamp(doc.pub_date),
        to_sql_timestamp(doc.first_fetch_time),
    )
}

/// Reinterpret the bits of an unsigned timestamp as `BIGINT`.
fn to_sql_timestamp(ts: Timestamp) -> i64 {
    ts as i64
}

fn from_sql_timestamp(value: i64) -> Timestamp {
    value as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_bits_survive_bigint() {
        for ts in [0, 1, 1_577_836_800, i64::MAX as u64, i64::MAX as u64 + 1, u64::MAX] {
            assert_eq!(from_sql_timestamp(to_sql_timestamp(ts)), ts);
        }
        assert_eq!(to_sql_timestamp(u64::MAX), -1);
    }

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "docsync");
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_db_config_partial_yaml() {
        let config: DbConfig = serde_yaml::from_str("host: db.internal\nport: 6432\n").unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6432);
        assert_eq!(config.max_size, DEFAULT_DB_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_create_pool_is_lazy() {
        // deadpool connects on first checkout, so building a pool against an
        // unreachable host still succeeds.
        let config = DbConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let store = PgDocumentStore::from_config(&config).unwrap();
        assert_eq!(store.pool_size(), 0);
    }
}
