use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

const SCHEMA: &str = include_str!("../migrations/schema.sql");

/// Resolve the database file path: use the custom path if provided,
/// otherwise fall back to `~/.boxsync_cache.db`.
pub fn resolve_db_path(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(".boxsync_cache.db"))
        }
    }
}

/// Open (creating if needed) the cache database.
///
/// With `reset` the tables are dropped and recreated; otherwise they are
/// only created when missing.
pub async fn init_db(path: &Path, reset: bool) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    tracing::debug!(path = %path.display(), "opening database");

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", path.display()))?;

    if reset || !schema_present(&pool).await? {
        reset_schema(&pool).await?;
    }

    tracing::info!(path = %path.display(), reset, "database initialized");
    Ok(pool)
}

/// Open the existing database in read-only mode.
/// Returns `None` if the database file doesn't exist (first run).
pub async fn open_db_readonly(path: &Path) -> Result<Option<SqlitePool>> {
    if !path.exists() {
        return Ok(None);
    }

    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database read-only: {}", path.display()))?;

    Ok(Some(pool))
}

/// Single-connection in-memory database with a fresh schema.
#[cfg(test)]
pub async fn init_in_memory() -> Result<SqlitePool> {
    use std::str::FromStr;

    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    // The database lives only as long as its one connection.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to create in-memory database")?;
    reset_schema(&pool).await?;
    Ok(pool)
}

/// Drop and recreate both cache tables.
pub async fn reset_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("Failed to initialize cache schema")?;
    Ok(())
}

async fn schema_present(pool: &SqlitePool) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('files', 'folders')",
    )
    .fetch_one(pool)
    .await
    .context("Failed to inspect database schema")?;
    Ok(row.0 == 2)
}
