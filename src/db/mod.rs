use crate::error::ChartError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};

const DEFAULT_DB_FILENAME: &str = "live-bars.db";

fn resolve_db_filename() -> String {
    std::env::var("LIVE_BARS_DB_FILENAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string())
}

pub fn resolve_db_path(explicit: Option<&Path>) -> Result<PathBuf, ChartError> {
    if let Some(path) = explicit {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        return Ok(path.to_path_buf());
    }
    Ok(PathBuf::from(resolve_db_filename()))
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), ChartError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, ChartError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool(explicit: Option<&Path>) -> Result<SqlitePool, ChartError> {
    let db_path = resolve_db_path(explicit)?;
    initialize_pool_from_path(&db_path).await
}

#[cfg(test)]
pub(crate) fn unique_db_path(prefix: &str) -> PathBuf {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock should be after unix epoch")
        .as_nanos();

    std::env::temp_dir().join(format!("{prefix}-{timestamp}.db"))
}
