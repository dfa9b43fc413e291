//! Storage abstraction for Ingest Harness.
//!
//! The [`Store`] trait defines every persistence operation the pipeline
//! needs, across the raw, state, tool, and domain layers. Backends:
//! [`memory::InMemoryStore`] here, and the SQLite store in the main crate.
//!
//! Implementations must be `Send + Sync` to be shared by collector workers,
//! and must make each multi-row operation atomic: the pipeline holds no lock
//! of its own around store calls.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CollectionState, DomainRow, PageScope, RawRecord, ToolRow};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`replace_raw_page`](Store::replace_raw_page) | Atomically replace every record of one fetched page |
/// | [`delete_raw`](Store::delete_raw) | Flush a collection's raw records before a full run |
/// | [`list_raw`](Store::list_raw) | Read a collection's raw records, oldest first |
/// | [`get_state`](Store::get_state) / [`put_state`](Store::put_state) | Incremental state |
/// | [`replace_tool_rows`](Store::replace_tool_rows) | Atomically swap the rows derived from one raw record |
/// | [`delete_tool_rows`](Store::delete_tool_rows) | Clear a tool table for one fingerprint before a full extraction |
/// | [`list_tool_rows`](Store::list_tool_rows) | Read a tool table for one fingerprint |
/// | [`upsert_domain_rows`](Store::upsert_domain_rows) | Atomically upsert domain rows by id |
/// | [`list_domain_rows`](Store::list_domain_rows) | Read a domain table |
#[async_trait]
pub trait Store: Send + Sync {
    /// Replace all records previously staged in `scope`.
    ///
    /// An empty `records` slice clears the page.
    async fn replace_raw_page(&self, scope: &PageScope<'_>, records: &[RawRecord]) -> Result<()>;

    /// Delete every raw record of a collection. Returns the number removed.
    async fn delete_raw(&self, table: &str, fingerprint: &str) -> Result<u64>;

    /// Raw records of a collection created at or after `since`, ordered by
    /// creation time, input, page, and position.
    async fn list_raw(
        &self,
        table: &str,
        fingerprint: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRecord>>;

    async fn get_state(&self, table: &str, fingerprint: &str) -> Result<Option<CollectionState>>;

    async fn put_state(&self, state: &CollectionState) -> Result<()>;

    /// Delete the rows previously extracted from raw record `origin` and
    /// upsert `rows` in their place, all or nothing.
    async fn replace_tool_rows(&self, origin: &str, rows: &[ToolRow]) -> Result<()>;

    /// Delete every row of a tool table for one fingerprint. Returns the
    /// number removed.
    async fn delete_tool_rows(&self, table: &str, fingerprint: &str) -> Result<u64>;

    /// Rows of a tool table for one fingerprint, ordered by key.
    async fn list_tool_rows(&self, table: &str, fingerprint: &str) -> Result<Vec<ToolRow>>;

    /// Upsert domain rows by `(table, id)`, all or nothing.
    async fn upsert_domain_rows(&self, rows: &[DomainRow]) -> Result<()>;

    /// Rows of a domain table, ordered by id.
    async fn list_domain_rows(&self, table: &str) -> Result<Vec<DomainRow>>;
}
