//! Core data models used throughout Ingest Harness.
//!
//! These types represent the three storage layers the pipeline writes to:
//!
//! | Layer | Type | Written by | Keyed by |
//! |-------|------|------------|----------|
//! | raw | [`RawRecord`] | collector | `(table, fingerprint, input, batch, page, position)` |
//! | tool | [`ToolRow`] | extractor | `(table, key)` |
//! | domain | [`DomainRow`] | converter | `(table, id)` |
//!
//! plus the per-collection [`CollectionState`] that carries the incremental
//! since-cursor between runs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One fetched page in the raw layer.
///
/// Re-staging the same scope replaces the page. An incremental run of a
/// collector with no inputs has no natural key to replace by, so it stages
/// under its own `batch` and appends instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageScope<'a> {
    pub table: &'a str,
    pub fingerprint: &'a str,
    /// Canonical JSON of the input, empty when the collection has none.
    pub input_key: &'a str,
    /// Empty, or the start time of the appending run.
    pub batch: &'a str,
    /// 1-based.
    pub page: i64,
}

/// One staged response payload.
///
/// A collector writes one record per item its response parser returns. The
/// record id is derived from the record's [`PageScope`] and position, so
/// re-collecting the same page overwrites the same ids instead of appending
/// new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: String,
    pub table: String,
    pub fingerprint: String,
    /// Canonical JSON of the input that drove the request, if any.
    pub input: Option<String>,
    pub batch: String,
    pub page: i64,
    pub position: i64,
    pub url: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl RawRecord {
    /// Build a record at `position` within `scope`.
    pub fn staged(
        scope: &PageScope<'_>,
        position: i64,
        url: &str,
        data: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: raw_record_id(scope, position),
            table: scope.table.to_string(),
            fingerprint: scope.fingerprint.to_string(),
            input: Some(scope.input_key)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            batch: scope.batch.to_string(),
            page: scope.page,
            position,
            url: url.to_string(),
            data,
            created_at,
        }
    }

    /// The natural key of the input, empty when the collection had no input.
    pub fn input_key(&self) -> &str {
        self.input.as_deref().unwrap_or("")
    }

    /// The page this record was staged in.
    pub fn scope(&self) -> PageScope<'_> {
        PageScope {
            table: &self.table,
            fingerprint: &self.fingerprint,
            input_key: self.input_key(),
            batch: &self.batch,
            page: self.page,
        }
    }

    /// Decode the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Deterministic raw record id.
pub fn raw_record_id(scope: &PageScope<'_>, position: i64) -> String {
    let mut hasher = Sha256::new();
    for part in [scope.table, scope.fingerprint, scope.input_key, scope.batch] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.update(scope.page.to_le_bytes());
    hasher.update(position.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Persisted incremental state of one `(table, fingerprint)` collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionState {
    pub table: String,
    pub fingerprint: String,
    /// Inclusive lower bound for the next incremental run.
    pub since_cursor: Option<DateTime<Utc>>,
    /// Explicit lower bound requested by the last full sync.
    pub time_after: Option<DateTime<Utc>>,
    /// Serialized subtask configuration of the last successful run.
    pub config: String,
    pub updated_at: DateTime<Utc>,
}

/// A connector-specific entity, serialized for the tool layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRow {
    pub table: String,
    /// Canonical natural composite key.
    pub key: String,
    pub fingerprint: String,
    /// Id of the raw record this row was extracted from.
    pub origin: String,
    /// JSON document.
    pub data: String,
}

impl ToolRow {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// A connector-agnostic entity, serialized for the domain layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRow {
    pub table: String,
    /// Deterministic global id, see [`crate::didgen`].
    pub id: String,
    /// `table/key` of the tool row this entity was converted from.
    pub origin: String,
    pub data: String,
}

impl DomainRow {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// A typed tool-layer entity.
///
/// Implementors name their table and expose the natural key the row is
/// upserted by. The scope (connection id, scope id) belongs in the key.
pub trait ToolEntity: Serialize {
    const TABLE: &'static str;

    fn natural_key(&self) -> Vec<String>;

    fn to_row(&self, fingerprint: &str, origin: &str) -> Result<ToolRow> {
        Ok(ToolRow {
            table: Self::TABLE.to_string(),
            key: canonical_key(&self.natural_key()),
            fingerprint: fingerprint.to_string(),
            origin: origin.to_string(),
            data: serde_json::to_string(self)?,
        })
    }
}

/// A typed domain-layer entity.
pub trait DomainEntity: Serialize {
    const TABLE: &'static str;

    fn id(&self) -> &str;

    fn to_row(&self, origin: &str) -> Result<DomainRow> {
        Ok(DomainRow {
            table: Self::TABLE.to_string(),
            id: self.id().to_string(),
            origin: origin.to_string(),
            data: serde_json::to_string(self)?,
        })
    }
}

/// Join key parts into a stable, unambiguous string (a JSON array).
pub fn canonical_key(parts: &[String]) -> String {
    serde_json::Value::from(parts.to_vec()).to_string()
}
