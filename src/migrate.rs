use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Raw layer: one row per staged payload
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_records (
            id TEXT PRIMARY KEY,
            raw_table TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            input TEXT,
            input_key TEXT NOT NULL,
            batch TEXT NOT NULL DEFAULT '',
            page INTEGER NOT NULL,
            position INTEGER NOT NULL,
            url TEXT NOT NULL,
            data BLOB NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collection_states (
            raw_table TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            since_cursor INTEGER,
            time_after INTEGER,
            config TEXT NOT NULL DEFAULT '',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (raw_table, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Tool layer: connector-specific entities
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tool_rows (
            tool_table TEXT NOT NULL,
            row_key TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            origin TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (tool_table, row_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Domain layer: connector-agnostic entities
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS domain_rows (
            domain_table TEXT NOT NULL,
            id TEXT NOT NULL,
            origin TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (domain_table, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_records_page ON raw_records(raw_table, fingerprint, input_key, batch, page)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_records_created ON raw_records(raw_table, fingerprint, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tool_rows_origin ON tool_rows(origin)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tool_rows_fingerprint ON tool_rows(tool_table, fingerprint)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
