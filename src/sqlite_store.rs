//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as Unix microseconds so that round-tripping a
//! [`CollectionState`] cursor is exact.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use ingest_harness_core::models::{CollectionState, DomainRow, PageScope, RawRecord, ToolRow};
use ingest_harness_core::store::Store;

/// SQLite implementation of the [`Store`] trait.
///
/// Wraps a [`SqlitePool`]. Every multi-row operation runs in one
/// transaction, so a failure half way through leaves the previous rows in
/// place.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).with_context(|| format!("timestamp out of range: {}", us))
}

fn raw_from_row(row: &SqliteRow) -> Result<RawRecord> {
    Ok(RawRecord {
        id: row.try_get("id")?,
        table: row.try_get("raw_table")?,
        fingerprint: row.try_get("fingerprint")?,
        input: row.try_get("input")?,
        batch: row.try_get("batch")?,
        page: row.try_get("page")?,
        position: row.try_get("position")?,
        url: row.try_get("url")?,
        data: row.try_get("data")?,
        created_at: from_micros(row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn replace_raw_page(&self, scope: &PageScope<'_>, records: &[RawRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM raw_records
            WHERE raw_table = ? AND fingerprint = ? AND input_key = ? AND batch = ? AND page = ?
            "#,
        )
        .bind(scope.table)
        .bind(scope.fingerprint)
        .bind(scope.input_key)
        .bind(scope.batch)
        .bind(scope.page)
        .execute(&mut *tx)
        .await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO raw_records (id, raw_table, fingerprint, input, input_key,
                                         batch, page, position, url, data, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    input = excluded.input,
                    url = excluded.url,
                    data = excluded.data,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&record.id)
            .bind(&record.table)
            .bind(&record.fingerprint)
            .bind(&record.input)
            .bind(record.input_key())
            .bind(&record.batch)
            .bind(record.page)
            .bind(record.position)
            .bind(&record.url)
            .bind(&record.data)
            .bind(to_micros(record.created_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_raw(&self, table: &str, fingerprint: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM raw_records WHERE raw_table = ? AND fingerprint = ?")
            .bind(table)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_raw(
        &self,
        table: &str,
        fingerprint: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, raw_table, fingerprint, input, batch, page, position, url, data, created_at
            FROM raw_records
            WHERE raw_table = ? AND fingerprint = ? AND created_at >= ?
            ORDER BY created_at, input_key, batch, page, position
            "#,
        )
        .bind(table)
        .bind(fingerprint)
        .bind(since.map_or(i64::MIN, to_micros))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(raw_from_row).collect()
    }

    async fn get_state(&self, table: &str, fingerprint: &str) -> Result<Option<CollectionState>> {
        let row = sqlx::query(
            r#"
            SELECT raw_table, fingerprint, since_cursor, time_after, config, updated_at
            FROM collection_states
            WHERE raw_table = ? AND fingerprint = ?
            "#,
        )
        .bind(table)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let since_cursor: Option<i64> = row.try_get("since_cursor")?;
        let time_after: Option<i64> = row.try_get("time_after")?;
        Ok(Some(CollectionState {
            table: row.try_get("raw_table")?,
            fingerprint: row.try_get("fingerprint")?,
            since_cursor: since_cursor.map(from_micros).transpose()?,
            time_after: time_after.map(from_micros).transpose()?,
            config: row.try_get("config")?,
            updated_at: from_micros(row.try_get("updated_at")?)?,
        }))
    }

    async fn put_state(&self, state: &CollectionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_states (raw_table, fingerprint, since_cursor, time_after,
                                           config, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(raw_table, fingerprint) DO UPDATE SET
                since_cursor = excluded.since_cursor,
                time_after = excluded.time_after,
                config = excluded.config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.table)
        .bind(&state.fingerprint)
        .bind(state.since_cursor.map(to_micros))
        .bind(state.time_after.map(to_micros))
        .bind(&state.config)
        .bind(to_micros(state.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_tool_rows(&self, origin: &str, rows: &[ToolRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tool_rows WHERE origin = ?")
            .bind(origin)
            .execute(&mut *tx)
            .await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO tool_rows (tool_table, row_key, fingerprint, origin, data)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(tool_table, row_key) DO UPDATE SET
                    fingerprint = excluded.fingerprint,
                    origin = excluded.origin,
                    data = excluded.data
                "#,
            )
            .bind(&row.table)
            .bind(&row.key)
            .bind(&row.fingerprint)
            .bind(&row.origin)
            .bind(&row.data)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_tool_rows(&self, table: &str, fingerprint: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tool_rows WHERE tool_table = ? AND fingerprint = ?")
            .bind(table)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_tool_rows(&self, table: &str, fingerprint: &str) -> Result<Vec<ToolRow>> {
        let rows = sqlx::query(
            r#"
            SELECT tool_table, row_key, fingerprint, origin, data
            FROM tool_rows
            WHERE tool_table = ? AND fingerprint = ?
            ORDER BY row_key
            "#,
        )
        .bind(table)
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ToolRow {
                    table: row.try_get("tool_table")?,
                    key: row.try_get("row_key")?,
                    fingerprint: row.try_get("fingerprint")?,
                    origin: row.try_get("origin")?,
                    data: row.try_get("data")?,
                })
            })
            .collect()
    }

    async fn upsert_domain_rows(&self, rows: &[DomainRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO domain_rows (domain_table, id, origin, data)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(domain_table, id) DO UPDATE SET
                    origin = excluded.origin,
                    data = excluded.data
                "#,
            )
            .bind(&row.table)
            .bind(&row.id)
            .bind(&row.origin)
            .bind(&row.data)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_domain_rows(&self, table: &str) -> Result<Vec<DomainRow>> {
        let rows = sqlx::query(
            "SELECT domain_table, id, origin, data FROM domain_rows WHERE domain_table = ? ORDER BY id",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DomainRow {
                    table: row.try_get("domain_table")?,
                    id: row.try_get("id")?,
                    origin: row.try_get("origin")?,
                    data: row.try_get("data")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("ingest.sqlite"))
            .await
            .unwrap();
        crate::migrate::create_schema(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    #[tokio::test]
    async fn test_state_round_trip_is_exact() {
        let (_tmp, store) = store().await;
        let at = Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        let state = CollectionState {
            table: "_raw_copilot_metrics".into(),
            fingerprint: r#"{"connection_id":1}"#.into(),
            since_cursor: Some(at),
            time_after: None,
            config: String::new(),
            updated_at: at,
        };
        store.put_state(&state).await.unwrap();
        let loaded = store
            .get_state("_raw_copilot_metrics", r#"{"connection_id":1}"#)
            .await
            .unwrap();
        assert_eq!(loaded, Some(state));
        assert!(store.get_state("_raw_copilot_metrics", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_raw_page_replace_and_since_filter() {
        let (_tmp, store) = store().await;
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let scope = |input_key, batch| PageScope {
            table: "_raw",
            fingerprint: "fp",
            input_key,
            batch,
            page: 1,
        };
        let rec = |scope: &PageScope<'_>, pos: i64, at| {
            RawRecord::staged(scope, pos, "u", b"{}".to_vec(), at)
        };
        let a = scope("a", "");
        let b = scope("b", "");
        store
            .replace_raw_page(&a, &[rec(&a, 0, early), rec(&a, 1, early)])
            .await
            .unwrap();
        store.replace_raw_page(&b, &[rec(&b, 0, late)]).await.unwrap();
        assert_eq!(store.list_raw("_raw", "fp", None).await.unwrap().len(), 3);
        assert_eq!(store.list_raw("_raw", "fp", Some(late)).await.unwrap().len(), 1);

        store.replace_raw_page(&a, &[rec(&a, 0, late)]).await.unwrap();
        assert_eq!(store.list_raw("_raw", "fp", None).await.unwrap().len(), 2);

        // same page of a later batch appends
        let appended = scope("", "1735776000000000");
        store
            .replace_raw_page(&appended, &[rec(&appended, 0, late)])
            .await
            .unwrap();
        let rows = store.list_raw("_raw", "fp", None).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().any(|r| r.batch == "1735776000000000" && r.input.is_none()));

        assert_eq!(store.delete_raw("_raw", "fp").await.unwrap(), 3);
    }
}
