//! Raw-to-tool extraction.
//!
//! Extraction is network-free: it reads the raw records a collector staged
//! for one `(table, fingerprint)` and turns each into zero or more
//! [`ToolRow`]s. All rows derived from one raw record are swapped in
//! atomically, replacing whatever that record produced last time, so
//! re-extraction is idempotent and a shrinking fan-out leaves no stale rows.
//!
//! A record that fails to parse is reported in the [`ExtractReport`]. With
//! `abort_on_error` the first failure ends the run instead.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use ingest_harness_core::fingerprint::{canonical_json, CollectionParams, Fingerprint};
use ingest_harness_core::models::{RawRecord, ToolRow};
use ingest_harness_core::state::{self, IncrementalMode, SyncPolicy};
use ingest_harness_core::store::Store;

use crate::clock::Clock;

pub type ExtractFn = Arc<dyn Fn(&RawRecord) -> Result<Vec<ToolRow>> + Send + Sync>;

#[derive(Clone)]
pub struct ExtractorSpec {
    pub raw_table: String,
    pub fingerprint: Fingerprint,
    /// Tool tables this extractor writes; cleared for the fingerprint
    /// before a full extraction.
    pub tables: Vec<String>,
    pub config: String,
    pub extract: ExtractFn,
    pub abort_on_error: bool,
    pub incremental: bool,
}

impl ExtractorSpec {
    pub fn new<P, F>(raw_table: &str, params: &P, tables: &[&str], extract: F) -> Result<Self>
    where
        P: CollectionParams,
        F: Fn(&RawRecord) -> Result<Vec<ToolRow>> + Send + Sync + 'static,
    {
        Ok(Self {
            raw_table: raw_table.to_string(),
            fingerprint: params.fingerprint()?,
            tables: tables.iter().map(|t| t.to_string()).collect(),
            config: String::new(),
            extract: Arc::new(extract),
            abort_on_error: false,
            incremental: false,
        })
    }

    /// Decode each record's payload as `T` before handing it to `extract`.
    pub fn json<P, T, F>(raw_table: &str, params: &P, tables: &[&str], extract: F) -> Result<Self>
    where
        P: CollectionParams,
        T: DeserializeOwned,
        F: Fn(T, &RawRecord) -> Result<Vec<ToolRow>> + Send + Sync + 'static,
    {
        Self::new(raw_table, params, tables, move |raw| {
            let payload: T = raw.json().context("malformed payload")?;
            extract(payload, raw)
        })
    }

    pub fn abort_on_error(mut self, abort: bool) -> Self {
        self.abort_on_error = abort;
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn config<C: Serialize>(mut self, config: &C) -> Result<Self> {
        self.config = canonical_json(&serde_json::to_value(config)?);
        Ok(self)
    }

    /// Key under which this extractor's own incremental state is kept.
    pub fn state_table(&self) -> String {
        format!("{}#extract", self.raw_table)
    }
}

/// A raw record that failed to extract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub raw_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub incremental: bool,
    pub records: u64,
    pub rows: u64,
    pub failures: Vec<RecordFailure>,
}

pub struct Extractor<'a> {
    store: &'a dyn Store,
    clock: &'a dyn Clock,
    spec: &'a ExtractorSpec,
}

impl<'a> Extractor<'a> {
    pub fn new(store: &'a dyn Store, clock: &'a dyn Clock, spec: &'a ExtractorSpec) -> Self {
        Self { store, clock, spec }
    }

    pub async fn run(&self, policy: &SyncPolicy) -> Result<ExtractReport> {
        let spec = self.spec;
        let fingerprint = spec.fingerprint.as_str();
        let state_table = spec.state_table();

        let previous = self.store.get_state(&state_table, fingerprint).await?;
        let mode = if spec.incremental {
            state::resolve(policy, previous.as_ref(), &spec.config)
        } else {
            IncrementalMode {
                incremental: false,
                since: None,
            }
        };
        let started_at = self.clock.now();

        info!(
            table = %spec.raw_table,
            fingerprint,
            incremental = mode.incremental,
            "extracting"
        );

        if !mode.incremental {
            for table in &spec.tables {
                self.store.delete_tool_rows(table, fingerprint).await?;
            }
        }

        let since: Option<DateTime<Utc>> = if mode.incremental { mode.since } else { None };
        let records = self
            .store
            .list_raw(&spec.raw_table, fingerprint, since)
            .await?;

        let mut report = ExtractReport {
            incremental: mode.incremental,
            ..ExtractReport::default()
        };

        for raw in &records {
            report.records += 1;
            match (spec.extract)(raw) {
                Ok(rows) => {
                    self.store
                        .replace_tool_rows(&raw.id, &rows)
                        .await
                        .with_context(|| format!("writing rows extracted from {}", raw.id))?;
                    report.rows += rows.len() as u64;
                }
                Err(e) if spec.abort_on_error => {
                    return Err(e.context(format!(
                        "extracting raw record {} of {}",
                        raw.id, spec.raw_table
                    )));
                }
                Err(e) => {
                    warn!(table = %spec.raw_table, raw_id = %raw.id, "skipping record: {:#}", e);
                    report.failures.push(RecordFailure {
                        raw_id: raw.id.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        // A failed record must be seen again by the next incremental pass.
        if report.failures.is_empty() {
            let next = state::advance(
                previous.as_ref(),
                &state_table,
                fingerprint,
                mode,
                policy,
                &spec.config,
                started_at,
            );
            self.store.put_state(&next).await?;
        }

        info!(
            table = %spec.raw_table,
            records = report.records,
            rows = report.rows,
            failures = report.failures.len(),
            "extraction done"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use ingest_harness_core::models::{PageScope, ToolEntity};
    use ingest_harness_core::store::memory::InMemoryStore;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Serialize)]
    struct Params {
        connection_id: u64,
    }

    impl CollectionParams for Params {}

    #[derive(Deserialize)]
    struct Payload {
        id: u64,
        created: String,
        labels: Vec<String>,
    }

    #[derive(Serialize)]
    struct Issue {
        connection_id: u64,
        id: u64,
        created: DateTime<Utc>,
    }

    impl ToolEntity for Issue {
        const TABLE: &'static str = "_tool_issues";
        fn natural_key(&self) -> Vec<String> {
            vec![self.connection_id.to_string(), self.id.to_string()]
        }
    }

    #[derive(Serialize)]
    struct Label {
        connection_id: u64,
        issue_id: u64,
        name: String,
    }

    impl ToolEntity for Label {
        const TABLE: &'static str = "_tool_labels";
        fn natural_key(&self) -> Vec<String> {
            vec![
                self.connection_id.to_string(),
                self.issue_id.to_string(),
                self.name.clone(),
            ]
        }
    }

    fn spec() -> ExtractorSpec {
        ExtractorSpec::json(
            "_raw_issues",
            &Params { connection_id: 1 },
            &[Issue::TABLE, Label::TABLE],
            |p: Payload, raw| {
                let created = DateTime::parse_from_rfc3339(&p.created)
                    .context("invalid created date")?
                    .with_timezone(&Utc);
                let mut rows = vec![Issue {
                    connection_id: 1,
                    id: p.id,
                    created,
                }
                .to_row(&raw.fingerprint, &raw.id)?];
                for name in p.labels {
                    rows.push(
                        Label {
                            connection_id: 1,
                            issue_id: p.id,
                            name,
                        }
                        .to_row(&raw.fingerprint, &raw.id)?,
                    );
                }
                Ok(rows)
            },
        )
        .unwrap()
    }

    async fn stage(store: &InMemoryStore, spec: &ExtractorSpec, position: i64, body: &str) {
        let scope = PageScope {
            table: &spec.raw_table,
            fingerprint: spec.fingerprint.as_str(),
            input_key: "",
            batch: "",
            page: 1,
        };
        let record = RawRecord::staged(
            &scope,
            position,
            "https://api.test/issues",
            body.as_bytes().to_vec(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        );
        let mut page = store
            .list_raw(&spec.raw_table, spec.fingerprint.as_str(), None)
            .await
            .unwrap();
        page.retain(|r| r.position != position);
        page.push(record);
        store.replace_raw_page(&scope, &page).await.unwrap();
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_extract_twice_is_idempotent() {
        let store = InMemoryStore::new();
        let spec = spec();
        stage(&store, &spec, 0, r#"{"id":1,"created":"2024-01-01T00:00:00Z","labels":["bug","p1"]}"#).await;
        stage(&store, &spec, 1, r#"{"id":2,"created":"2024-02-01T00:00:00Z","labels":[]}"#).await;
        let clock = clock();
        let fp = spec.fingerprint.as_str();

        let first = Extractor::new(&store, &clock, &spec)
            .run(&SyncPolicy::default())
            .await
            .unwrap();
        let issues = store.list_tool_rows("_tool_issues", fp).await.unwrap();
        let labels = store.list_tool_rows("_tool_labels", fp).await.unwrap();

        let second = Extractor::new(&store, &clock, &spec)
            .run(&SyncPolicy::default())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.rows, 4);
        assert_eq!(store.list_tool_rows("_tool_issues", fp).await.unwrap(), issues);
        assert_eq!(store.list_tool_rows("_tool_labels", fp).await.unwrap(), labels);
        assert_eq!(issues.len(), 2);
        assert_eq!(labels.len(), 2);
    }

    #[tokio::test]
    async fn test_fixing_malformed_record_touches_only_its_rows() {
        let store = InMemoryStore::new();
        let spec = spec();
        let fp = spec.fingerprint.as_str();
        stage(&store, &spec, 0, r#"{"id":1,"created":"2024-01-01T00:00:00Z","labels":["bug"]}"#).await;
        stage(&store, &spec, 1, r#"{"id":2,"created":"not a date","labels":["ux"]}"#).await;
        let clock = clock();

        let report = Extractor::new(&store, &clock, &spec)
            .run(&SyncPolicy::default())
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("invalid created date"));
        let before = store.list_tool_rows("_tool_issues", fp).await.unwrap();
        assert_eq!(before.len(), 1);

        stage(&store, &spec, 1, r#"{"id":2,"created":"2024-02-01T00:00:00Z","labels":["ux"]}"#).await;
        let report = Extractor::new(&store, &clock, &spec)
            .run(&SyncPolicy::default())
            .await
            .unwrap();
        assert!(report.failures.is_empty());

        let after = store.list_tool_rows("_tool_issues", fp).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0], before[0]);
        assert_eq!(store.list_tool_rows("_tool_labels", fp).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_abort_on_error() {
        let store = InMemoryStore::new();
        let spec = spec().abort_on_error(true);
        stage(&store, &spec, 0, "not json").await;
        let clock = clock();
        let err = Extractor::new(&store, &clock, &spec)
            .run(&SyncPolicy::default())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("malformed payload"));
    }

    #[tokio::test]
    async fn test_incremental_skips_already_extracted_records() {
        let store = InMemoryStore::new();
        let spec = spec().incremental(true);
        stage(&store, &spec, 0, r#"{"id":1,"created":"2024-01-01T00:00:00Z","labels":[]}"#).await;
        let clock = clock();

        let first = Extractor::new(&store, &clock, &spec)
            .run(&SyncPolicy::default())
            .await
            .unwrap();
        assert!(!first.incremental);
        assert_eq!(first.records, 1);

        clock.advance(Duration::from_secs(60));
        let second = Extractor::new(&store, &clock, &spec)
            .run(&SyncPolicy::default())
            .await
            .unwrap();
        assert!(second.incremental);
        assert_eq!(second.records, 0);
        assert_eq!(
            store
                .list_tool_rows("_tool_issues", spec.fingerprint.as_str())
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
