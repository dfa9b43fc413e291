//! Tool-to-domain conversion.
//!
//! Reads the rows of one tool table for one fingerprint and maps each into
//! connector-agnostic [`DomainRow`]s, addressed by ids from a
//! [`DomainIdGenerator`](ingest_harness_core::didgen::DomainIdGenerator).
//! Each entity's rows are upserted in their own transaction; a failing
//! entity is reported and the rest still convert.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use ingest_harness_core::fingerprint::{CollectionParams, Fingerprint};
use ingest_harness_core::models::{DomainRow, ToolRow};
use ingest_harness_core::store::Store;

pub type ConvertFn = Arc<dyn Fn(&ToolRow) -> Result<Vec<DomainRow>> + Send + Sync>;

#[derive(Clone)]
pub struct ConverterSpec {
    pub tool_table: String,
    pub fingerprint: Fingerprint,
    pub convert: ConvertFn,
}

impl ConverterSpec {
    pub fn new<P, F>(tool_table: &str, params: &P, convert: F) -> Result<Self>
    where
        P: CollectionParams,
        F: Fn(&ToolRow) -> Result<Vec<DomainRow>> + Send + Sync + 'static,
    {
        Ok(Self {
            tool_table: tool_table.to_string(),
            fingerprint: params.fingerprint()?,
            convert: Arc::new(convert),
        })
    }

    /// Decode each tool row as `T` before handing it to `convert`.
    pub fn json<P, T, F>(tool_table: &str, params: &P, convert: F) -> Result<Self>
    where
        P: CollectionParams,
        T: DeserializeOwned,
        F: Fn(T, &ToolRow) -> Result<Vec<DomainRow>> + Send + Sync + 'static,
    {
        Self::new(tool_table, params, move |row| {
            let entity: T = row.json().context("malformed tool row")?;
            convert(entity, row)
        })
    }
}

/// Origin stamped on domain rows converted from `row`.
pub fn tool_origin(row: &ToolRow) -> String {
    format!("{}/{}", row.table, row.key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertReport {
    pub entities: u64,
    pub rows: u64,
    pub failures: Vec<EntityFailure>,
}

pub struct DomainConverter<'a> {
    store: &'a dyn Store,
    spec: &'a ConverterSpec,
}

impl<'a> DomainConverter<'a> {
    pub fn new(store: &'a dyn Store, spec: &'a ConverterSpec) -> Self {
        Self { store, spec }
    }

    pub async fn run(&self) -> Result<ConvertReport> {
        let spec = self.spec;
        let rows = self
            .store
            .list_tool_rows(&spec.tool_table, spec.fingerprint.as_str())
            .await?;
        info!(table = %spec.tool_table, rows = rows.len(), "converting");

        let mut report = ConvertReport::default();
        for row in &rows {
            report.entities += 1;
            let converted = match (spec.convert)(row) {
                Ok(converted) => converted,
                Err(e) => {
                    warn!(table = %spec.tool_table, key = %row.key, "skipping entity: {:#}", e);
                    report.failures.push(EntityFailure {
                        key: row.key.clone(),
                        error: format!("{:#}", e),
                    });
                    continue;
                }
            };
            if let Err(e) = self.store.upsert_domain_rows(&converted).await {
                warn!(table = %spec.tool_table, key = %row.key, "write failed: {:#}", e);
                report.failures.push(EntityFailure {
                    key: row.key.clone(),
                    error: format!("{:#}", e),
                });
                continue;
            }
            report.rows += converted.len() as u64;
        }

        info!(
            table = %spec.tool_table,
            entities = report.entities,
            rows = report.rows,
            failures = report.failures.len(),
            "conversion done"
        );
        Ok(report)
    }
}
