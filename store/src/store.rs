//! Store: connection lifecycle, pragmas, pool sizing, health checks.
use crate::config::StoreConfig;
use crate::errors::{StoreError, StoreResult};
use crate::migrations;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owns the single `sqlx::SqlitePool` handle for the process. Repositories borrow
/// the pool; only `Store` may close it.
pub struct Store {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
    max_task_context_depth: u32,
    max_transaction_retries: u32,
    ping_timeout: Duration,
}

impl Store {
    /// Open a healthy handle with the pragmas and pool limits from `cfg`, then
    /// apply pending migrations.
    ///
    /// Errors: `ConfigError` on an empty path, `FilesystemError` when the parent
    /// directory cannot be created or the file cannot be opened at mode 0600,
    /// `ConnectError` when the initial ping exceeds `cfg.ping_timeout`.
    pub async fn open(cfg: &StoreConfig) -> StoreResult<Self> {
        if cfg.path.trim().is_empty() {
            return Err(StoreError::Config("database path must not be empty".into()));
        }

        let db_path = if cfg.is_memory() {
            None
        } else {
            Some(prepare_file(&cfg.path)?)
        };

        let connect_options = build_connect_options(cfg, db_path.as_deref())?;

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_open_conns)
            .min_connections(cfg.max_idle_conns.min(cfg.max_open_conns))
            .max_lifetime(Some(cfg.conn_max_lifetime))
            .idle_timeout(Some(cfg.conn_max_idle_time))
            .acquire_timeout(cfg.ping_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::Connect(format!("failed to open connection pool: {e}")))?;

        tokio::time::timeout(cfg.ping_timeout, pool.acquire())
            .await
            .map_err(|_| StoreError::Connect("timed out waiting for initial connection".into()))?
            .map_err(|e| StoreError::Connect(format!("initial ping failed: {e}")))?;

        migrations::apply(&pool).await?;

        info!(path = %cfg.path, "store opened");

        Ok(Self {
            pool,
            db_path,
            max_task_context_depth: cfg.max_task_context_depth,
            max_transaction_retries: cfg.max_transaction_retries,
            ping_timeout: cfg.ping_timeout,
        })
    }

    /// Borrowed access to the connection pool; repositories run SQL against this
    /// and must never close it themselves.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn max_task_context_depth(&self) -> u32 {
        self.max_task_context_depth
    }

    pub fn max_transaction_retries(&self) -> u32 {
        self.max_transaction_retries
    }

    /// Release the handle. Idempotent: calling this more than once is harmless
    /// because `SqlitePool::close` itself tolerates repeated calls.
    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            debug!("store closed");
        }
    }

    /// Ping, then confirm `foreign_keys = 1` and, for on-disk databases,
    /// `journal_mode = WAL`.
    pub async fn health_check(&self) -> StoreResult<()> {
        tokio::time::timeout(self.ping_timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| StoreError::Health("ping timed out".into()))?
            .map_err(|e| StoreError::Health(format!("ping failed: {e}")))?;

        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Health(format!("failed to read foreign_keys pragma: {e}")))?;
        if foreign_keys != 1 {
            return Err(StoreError::Health("foreign_keys pragma is not enabled".into()));
        }

        if self.db_path.is_some() {
            let journal_mode: String = sqlx::query("PRAGMA journal_mode")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::Health(format!("failed to read journal_mode pragma: {e}")))?
                .try_get::<String, _>(0)
                .map_err(|e| StoreError::Health(format!("failed to decode journal_mode: {e}")))?;
            if !journal_mode.eq_ignore_ascii_case("wal") {
                warn!(mode = %journal_mode, "journal_mode is not WAL");
                return Err(StoreError::Health(format!(
                    "expected journal_mode = wal, got {journal_mode}"
                )));
            }
        }

        Ok(())
    }
}

fn build_connect_options(cfg: &StoreConfig, db_path: Option<&Path>) -> StoreResult<SqliteConnectOptions> {
    let dsn = match db_path {
        None => "sqlite::memory:".to_string(),
        Some(path) => format!("sqlite://{}", path.to_string_lossy()),
    };

    let busy_timeout_ms = cfg.busy_timeout.as_millis() as u32;

    let mut options = SqliteConnectOptions::from_str(&dsn)
        .map_err(|e| StoreError::Config(format!("invalid database path: {e}")))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(busy_timeout_ms as u64));

    if db_path.is_some() {
        options = options
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        if cfg.is_memory() {
            options = options.shared_cache(true);
        }
    } else {
        options = options.shared_cache(true);
    }

    Ok(options)
}

/// Resolve `path` to an absolute form, create its parent directory at mode 0750,
/// and ensure the database file exists at mode 0600.
fn prepare_file(path: &str) -> StoreResult<PathBuf> {
    let path = Path::new(path);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| StoreError::Filesystem(format!("failed to resolve current dir: {e}")))?
            .join(path)
    };

    if let Some(parent) = absolute.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Filesystem(format!("failed to create directory {}: {e}", parent.display())))?;
            set_permissions(parent, 0o750)?;
        }
    }

    if !absolute.exists() {
        std::fs::File::create(&absolute)
            .map_err(|e| StoreError::Filesystem(format!("failed to create database file {}: {e}", absolute.display())))?;
    }
    set_permissions(&absolute, 0o600)?;

    Ok(absolute)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> StoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| StoreError::Filesystem(format!("failed to chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> StoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_and_health_check() {
        let store = Store::open(&StoreConfig::in_memory()).await.expect("open");
        store.health_check().await.expect("healthy");
        store.close().await;
    }

    #[tokio::test]
    async fn empty_path_is_config_error() {
        let mut cfg = StoreConfig::in_memory();
        cfg.path = String::new();
        let err = Store::open(&cfg).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test]
    async fn on_disk_store_sets_file_permissions_and_wal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("state.db");
        let cfg = StoreConfig::new(db_path.to_string_lossy().to_string());
        let store = Store::open(&cfg).await.expect("open");
        store.health_check().await.expect("healthy");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(&db_path).expect("metadata");
            assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        }

        store.close().await;
    }
}
