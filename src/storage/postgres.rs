/// PostgreSQL remote backend
///
/// A `deadpool-postgres` pool over `tokio-postgres`. The backend is kept
/// dormant by the orchestrator; the remote services and the JSON migration
/// drive it directly with SQL through [`PostgresStore::query`],
/// [`PostgresStore::execute`] and [`PostgresStore::transaction`].
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
    Transaction,
};
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::config::PostgresConfig;
use crate::domain::DEFAULT_CATEGORIES;
use crate::storage::{StorageAdapter, StorageError, StorageKind, StorageStats};

/// Bundled schema, applied on every successful connect
pub const POSTGRES_SCHEMA: &str = include_str!("../../schema/postgres_schema.sql");

/// `app_metadata` key set once the legacy JSON data has been imported
const MIGRATION_COMPLETED_KEY: &str = "migration_completed";

const TABLES: [&str; 6] = [
    "app_usage",
    "timestamps",
    "categories",
    "custom_category_mappings",
    "focus_sessions",
    "focus_session_interruptions",
];

/// Whether an error means the server can no longer be reached
fn is_connection_error(error: &tokio_postgres::Error) -> bool {
    if error.is_closed() {
        return true;
    }

    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            return matches!(
                io.kind(),
                ConnectionRefused
                    | ConnectionReset
                    | ConnectionAborted
                    | NotConnected
                    | BrokenPipe
                    | NotFound
                    | TimedOut
            );
        }
        source = inner.source();
    }

    let message = error.to_string().to_lowercase();
    message.contains("lookup address") || message.contains("connection refused")
}

/// Build the pool configuration
fn pool_config(config: &PostgresConfig) -> Config {
    let mut pool = PoolConfig::new(config.pool_size.max(1));
    pool.timeouts.wait = Some(config.connect_timeout);
    pool.timeouts.create = Some(config.connect_timeout);

    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.dbname.clone());
    cfg.user = Some(config.user.clone());
    if !config.password.is_empty() {
        cfg.password = Some(config.password.clone());
    }
    cfg.connect_timeout = Some(config.connect_timeout);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(pool);
    cfg
}

/// Pooled PostgreSQL backend
pub struct PostgresStore {
    config: PostgresConfig,
    pool: RwLock<Option<Pool>>,
    connected: AtomicBool,
}

impl PostgresStore {
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Configuration from `DB_*` environment variables
    pub fn from_env() -> Result<Self, StorageError> {
        Ok(Self::new(PostgresConfig::from_env()?))
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    /// Translate a driver error, marking the backend disconnected when the
    /// server went away
    pub(crate) fn classify(&self, error: tokio_postgres::Error) -> StorageError {
        if is_connection_error(&error) {
            self.connected.store(false, Ordering::SeqCst);
            return StorageError::ConnectionLost(error.to_string());
        }
        if let Some(db) = error.as_db_error() {
            if *db.code() == SqlState::UNIQUE_VIOLATION {
                return StorageError::DuplicateKey {
                    collection: db.table().unwrap_or("unknown").to_string(),
                    key: db.detail().unwrap_or(db.message()).to_string(),
                };
            }
        }
        StorageError::Postgres(error)
    }

    fn pool_error(&self, error: PoolError) -> StorageError {
        match error {
            PoolError::Backend(e) => self.classify(e),
            PoolError::Closed => StorageError::NotConnected,
            other => StorageError::Pool(other.to_string()),
        }
    }

    async fn client(&self) -> Result<Object, StorageError> {
        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or(StorageError::NotConnected)?;
        pool.get().await.map_err(|e| self.pool_error(e))
    }

    /// Open a pool and make sure the schema exists
    async fn open_pool(&self) -> Result<Pool, StorageError> {
        let pool = pool_config(&self.config)
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let client = pool.get().await.map_err(|e| match e {
            PoolError::Backend(e) => StorageError::Connection(e.to_string()),
            other => StorageError::Connection(other.to_string()),
        })?;
        client
            .batch_execute(POSTGRES_SCHEMA)
            .await
            .map_err(|e| StorageError::Schema(e.to_string()))?;

        Ok(pool)
    }

    /// Run a statement returning rows
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, StorageError> {
        let client = self.client().await?;
        client.query(sql, params).await.map_err(|e| self.classify(e))
    }

    /// Run a statement, returning the number of affected rows
    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, StorageError> {
        let client = self.client().await?;
        client.execute(sql, params).await.map_err(|e| self.classify(e))
    }

    /// Run `f` inside a transaction on a pooled connection
    ///
    /// Commits when `f` succeeds and rolls back when it fails; the connection
    /// goes back to the pool either way.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t Transaction<'_>) -> BoxFuture<'t, Result<T, StorageError>> + Send,
    {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(|e| self.classify(e))?;

        match f(&tx).await {
            Ok(value) => {
                tx.commit().await.map_err(|e| self.classify(e))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Whether the legacy JSON import already ran against this database
    pub async fn is_migration_completed(&self) -> Result<bool, StorageError> {
        let rows = self
            .query(
                "SELECT value FROM app_metadata WHERE key = $1",
                &[&MIGRATION_COMPLETED_KEY],
            )
            .await?;
        match rows.first() {
            Some(row) => Ok(row.try_get::<_, String>(0)? == "true"),
            None => Ok(false),
        }
    }

    pub async fn mark_migration_completed(&self) -> Result<(), StorageError> {
        self.execute(
            "INSERT INTO app_metadata (key, value, updated_at) VALUES ($1, 'true', NOW())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
            &[&MIGRATION_COMPLETED_KEY],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for PostgresStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Postgres
    }

    async fn connect(&self) -> Result<(), StorageError> {
        if self.is_connected() {
            return Ok(());
        }

        tracing::info!("Connecting to PostgreSQL at {}", self.config.location());

        let mut retry = 0;
        let pool = loop {
            match self.open_pool().await {
                Ok(pool) => break pool,
                Err(e) if retry < self.config.max_connect_retries => {
                    retry += 1;
                    let delay = self.config.backoff_delay(retry);
                    tracing::warn!(
                        "PostgreSQL connection failed: {}. Retrying in {:?} ({}/{})",
                        e,
                        delay,
                        retry,
                        self.config.max_connect_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(StorageError::Connection(format!(
                        "Failed to connect to {} after {} attempts: {}",
                        self.config.location(),
                        retry + 1,
                        e
                    )))
                }
            }
        };

        *self.pool.write().await = Some(pool);
        self.connected.store(true, Ordering::SeqCst);

        self.initialize_default_data().await?;
        tracing::info!("Connected to PostgreSQL");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close();
            tracing::info!("PostgreSQL pool closed");
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> bool {
        match self.query("SELECT 1", &[]).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("PostgreSQL health check failed: {}", e);
                false
            }
        }
    }

    /// Make sure every default category exists, leaving edited ones alone
    async fn initialize_default_data(&self) -> Result<(), StorageError> {
        let mut inserted = 0;
        for (name, category_type) in DEFAULT_CATEGORIES {
            inserted += self
                .execute(
                    "INSERT INTO categories (name, type) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
                    &[&name, &category_type.as_str()],
                )
                .await?;
        }
        if inserted > 0 {
            tracing::info!("Inserted {} default categories", inserted);
        }
        Ok(())
    }

    async fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let mut collections = std::collections::BTreeMap::new();
        for table in TABLES {
            let rows = self
                .query(&format!("SELECT COUNT(*) FROM {}", table), &[])
                .await?;
            let count: i64 = match rows.first() {
                Some(row) => row.try_get(0)?,
                None => 0,
            };
            collections.insert(table.to_string(), count.max(0) as u64);
        }

        Ok(StorageStats {
            backend: StorageKind::Postgres,
            location: self.config.location(),
            collections,
        })
    }
}
