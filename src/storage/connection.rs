use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool, Transaction};
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::{info, warn};

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::schema;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/flowmeta.db?mode=rwc";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the backing database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// SQLite database file at `path`, created on first connect.
    pub fn sqlite_file(path: &std::path::Path) -> Self {
        Self::new(format!("sqlite://{}?mode=rwc", path.to_string_lossy()))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn from_url(url: &str) -> StoreResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "sqlite" => Ok(Backend::Sqlite),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            _ => Err(StoreError::validation(
                "database_url",
                format!("unsupported database scheme '{}'", scheme),
            )),
        }
    }

    /// SQLite admits a single writer; its write units are gated in-process.
    pub fn single_writer(&self) -> bool {
        matches!(self, Backend::Sqlite)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Sqlite => write!(f, "sqlite"),
            Backend::Postgres => write!(f, "postgres"),
        }
    }
}

/// Owns the process-wide connection pool.
///
/// The pool is built lazily by [`ConnectionManager::initialize`], exactly once;
/// concurrent initializers all observe the same fully migrated pool.
pub struct ConnectionManager {
    config: DatabaseConfig,
    backend: Backend,
    pool: OnceCell<AnyPool>,
    write_gate: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(config: DatabaseConfig) -> StoreResult<Self> {
        let backend = Backend::from_url(&config.url)?;
        Ok(Self {
            config,
            backend,
            pool: OnceCell::new(),
            write_gate: Mutex::new(()),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.initialized()
    }

    /// Connect and migrate the schema. Later calls return the same pool.
    pub async fn initialize(&self) -> StoreResult<&AnyPool> {
        self.pool
            .get_or_try_init(|| async {
                sqlx::any::install_default_drivers();

                let pool = AnyPoolOptions::new()
                    .max_connections(self.config.max_connections)
                    .acquire_timeout(self.config.acquire_timeout)
                    .connect(&self.config.url)
                    .await
                    .map_err(|e| {
                        StoreError::Unavailable(format!(
                            "failed to connect to {} database: {}",
                            self.backend, e
                        ))
                    })?;

                schema::migrate(&pool, self.backend).await?;

                info!(
                    backend = %self.backend,
                    max_connections = self.config.max_connections,
                    "Connection pool initialized"
                );
                Ok(pool)
            })
            .await
    }

    pub fn pool(&self) -> StoreResult<&AnyPool> {
        self.pool.get().ok_or(StoreError::NotInitialized)
    }

    /// Check out a pooled connection. It returns to the pool when dropped.
    pub async fn acquire(&self) -> StoreResult<PoolConnection<Any>> {
        let pool = self.pool()?;
        pool.acquire().await.map_err(|e| {
            warn!(error = %e, "Failed to acquire connection");
            StoreError::from(e)
        })
    }

    /// Open one atomic write unit.
    pub async fn begin(&self) -> StoreResult<WriteUnit<'_>> {
        let pool = self.pool()?;
        let gate = if self.backend.single_writer() {
            Some(self.write_gate.lock().await)
        } else {
            None
        };
        let tx = pool.begin().await.map_err(|e| {
            warn!(error = %e, "Failed to begin transaction");
            StoreError::from(e)
        })?;
        Ok(WriteUnit { tx, _gate: gate })
    }

    /// Wait for checked-out connections to return, then close the pool.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!(backend = %self.backend, "Connection pool closed");
        }
    }
}

/// A transaction plus, on single-writer backends, the write gate.
///
/// Dropping an uncommitted unit rolls it back; the transaction is released
/// before the gate.
pub struct WriteUnit<'a> {
    tx: Transaction<'static, Any>,
    _gate: Option<MutexGuard<'a, ()>>,
}

impl WriteUnit<'_> {
    pub fn conn(&mut self) -> &mut AnyConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
