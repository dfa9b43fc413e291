//! In-memory [`Store`] implementation for testing.
//!
//! Uses `BTreeMap`s behind `std::sync::RwLock`. Each operation takes every
//! lock it needs for its whole duration, which is what makes the multi-row
//! operations atomic.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CollectionState, DomainRow, PageScope, RawRecord, ToolRow};

use super::Store;

/// In-memory store for tests and dry runs.
pub struct InMemoryStore {
    raw: RwLock<BTreeMap<String, RawRecord>>,
    states: RwLock<BTreeMap<(String, String), CollectionState>>,
    tool: RwLock<BTreeMap<(String, String), ToolRow>>,
    domain: RwLock<BTreeMap<(String, String), DomainRow>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            raw: RwLock::new(BTreeMap::new()),
            states: RwLock::new(BTreeMap::new()),
            tool: RwLock::new(BTreeMap::new()),
            domain: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl Store for InMemoryStore {
    async fn replace_raw_page(&self, scope: &PageScope<'_>, records: &[RawRecord]) -> Result<()> {
        let mut raw = self.raw.write().map_err(poisoned)?;
        raw.retain(|_, r| r.scope() != *scope);
        for record in records {
            raw.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_raw(&self, table: &str, fingerprint: &str) -> Result<u64> {
        let mut raw = self.raw.write().map_err(poisoned)?;
        let before = raw.len();
        raw.retain(|_, r| !(r.table == table && r.fingerprint == fingerprint));
        Ok((before - raw.len()) as u64)
    }

    async fn list_raw(
        &self,
        table: &str,
        fingerprint: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRecord>> {
        let raw = self.raw.read().map_err(poisoned)?;
        let mut records: Vec<RawRecord> = raw
            .values()
            .filter(|r| r.table == table && r.fingerprint == fingerprint)
            .filter(|r| since.map_or(true, |s| r.created_at >= s))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (a.created_at, a.input_key(), &a.batch, a.page, a.position)
                .cmp(&(b.created_at, b.input_key(), &b.batch, b.page, b.position))
        });
        Ok(records)
    }

    async fn get_state(&self, table: &str, fingerprint: &str) -> Result<Option<CollectionState>> {
        let states = self.states.read().map_err(poisoned)?;
        Ok(states
            .get(&(table.to_string(), fingerprint.to_string()))
            .cloned())
    }

    async fn put_state(&self, state: &CollectionState) -> Result<()> {
        let mut states = self.states.write().map_err(poisoned)?;
        states.insert(
            (state.table.clone(), state.fingerprint.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn replace_tool_rows(&self, origin: &str, rows: &[ToolRow]) -> Result<()> {
        let mut tool = self.tool.write().map_err(poisoned)?;
        tool.retain(|_, r| r.origin != origin);
        for row in rows {
            tool.insert((row.table.clone(), row.key.clone()), row.clone());
        }
        Ok(())
    }

    async fn delete_tool_rows(&self, table: &str, fingerprint: &str) -> Result<u64> {
        let mut tool = self.tool.write().map_err(poisoned)?;
        let before = tool.len();
        tool.retain(|_, r| !(r.table == table && r.fingerprint == fingerprint));
        Ok((before - tool.len()) as u64)
    }

    async fn list_tool_rows(&self, table: &str, fingerprint: &str) -> Result<Vec<ToolRow>> {
        let tool = self.tool.read().map_err(poisoned)?;
        Ok(tool
            .values()
            .filter(|r| r.table == table && r.fingerprint == fingerprint)
            .cloned()
            .collect())
    }

    async fn upsert_domain_rows(&self, rows: &[DomainRow]) -> Result<()> {
        let mut domain = self.domain.write().map_err(poisoned)?;
        for row in rows {
            domain.insert((row.table.clone(), row.id.clone()), row.clone());
        }
        Ok(())
    }

    async fn list_domain_rows(&self, table: &str) -> Result<Vec<DomainRow>> {
        let domain = self.domain.read().map_err(poisoned)?;
        Ok(domain
            .values()
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }
}
