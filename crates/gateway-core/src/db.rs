//! SQLite pool setup and schema management.
//!
//! Mirrors the teacher's `SqliteStore::init_schema` pattern: WAL journal
//! mode, `create_if_missing`, and `CREATE TABLE IF NOT EXISTS` run once at
//! startup so the gateway can be pointed at a fresh or existing database
//! file interchangeably.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::error::Result;

/// Open a connection pool against `path` (or `:memory:`), creating the file
/// and running schema migrations if needed.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    let options = if path == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes if they do not already exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            model TEXT NOT NULL,
            display_name TEXT NOT NULL,
            description TEXT,
            api_key_ciphertext BLOB NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            is_default INTEGER NOT NULL DEFAULT 0,
            default_for_extraction INTEGER NOT NULL DEFAULT 0,
            default_for_cv_draft INTEGER NOT NULL DEFAULT 0,
            default_for_cover_letter INTEGER NOT NULL DEFAULT 0,
            default_for_validation INTEGER NOT NULL DEFAULT 0,
            daily_token_cap INTEGER,
            monthly_token_cap INTEGER,
            last_tested_at TEXT,
            last_test_ok INTEGER,
            created_by INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_provider_configs_active_default ON provider_configs (is_active, is_default)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_provider_configs_kind ON provider_configs (kind)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            provider_config_id INTEGER REFERENCES provider_configs(id) ON DELETE SET NULL,
            task TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            cost_micro_usd INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            cache_hit INTEGER NOT NULL DEFAULT 0,
            estimated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_usage_records_user_created ON usage_records (user_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_usage_records_provider_created ON usage_records (provider_config_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_usage_records_task_created ON usage_records (task, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_key TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            user_id INTEGER,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT,
            hit_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cache_entries_scope_user_expires ON cache_entries (scope, user_id, expires_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_creates_schema_in_memory() {
        let pool = connect(":memory:").await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM provider_configs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
