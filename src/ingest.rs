//! Pipeline orchestration.
//!
//! Runs the collect, extract and convert stages of one configured connection
//! in order, one subtask at a time. A collection failure stops the stage
//! (staged raw records stay, state is untouched); extraction and conversion
//! failures are per record and only reported.
//!
//! [`Pipeline`] is the library entry point; [`run_stage`] wires it to
//! SQLite, the network, and the system clock for the CLI and print a summary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{NaiveDate, NaiveTime};
use tracing::info;

use ingest_harness_core::state::SyncPolicy;
use ingest_harness_core::store::Store;

use crate::client::{ReqwestTransport, Transport};
use crate::clock::{Clock, SystemClock};
use crate::collector::{cancellation, CancelToken, CollectOptions, CollectReport, StatefulCollector};
use crate::config::Config;
use crate::converter::{ConvertReport, DomainConverter};
use crate::db;
use crate::extractor::{ExtractReport, Extractor};
use crate::sqlite_store::SqliteStore;
use crate::traits::{Connector, ConnectorRegistry, TaskContext};

/// Which stages to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Collect,
    Extract,
    Convert,
    /// All three, in order.
    Sync,
}

/// Caller options shared by every stage.
#[derive(Clone, Default)]
pub struct StageOptions {
    /// Ignore stored cursors.
    pub full: bool,
    /// Only request data on or after this day.
    pub since: Option<NaiveDate>,
    pub cancel: Option<CancelToken>,
}

impl StageOptions {
    pub fn policy(&self) -> SyncPolicy {
        SyncPolicy {
            full_sync: self.full,
            time_after: self.since.map(|d| d.and_time(NaiveTime::MIN).and_utc()),
        }
    }
}

/// Reports of one pipeline run, in execution order.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub collected: Vec<CollectReport>,
    pub extracted: Vec<(String, ExtractReport)>,
    pub converted: Vec<(String, ConvertReport)>,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    registry: &'a ConnectorRegistry,
    store: &'a dyn Store,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        registry: &'a ConnectorRegistry,
        store: &'a dyn Store,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            transport,
            clock,
        }
    }

    fn task(&self, connection: &str) -> Result<(&'a dyn Connector, TaskContext)> {
        let conn = self.config.connection(connection)?;
        let Some(connector) = self.registry.get(&conn.connector) else {
            bail!(
                "Unknown connector: '{}'. Available: {}",
                conn.connector,
                self.registry
                    .connectors()
                    .iter()
                    .map(|c| c.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        };
        let ctx = TaskContext::new(connection, conn.clone(), self.config.api.clone());
        Ok((connector, ctx))
    }

    pub async fn run(&self, stage: Stage, connection: &str, options: &StageOptions) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if matches!(stage, Stage::Collect | Stage::Sync) {
            report.collected = self.collect(connection, options).await?;
        }
        if matches!(stage, Stage::Extract | Stage::Sync) {
            report.extracted = self.extract(connection, options).await?;
        }
        if matches!(stage, Stage::Convert | Stage::Sync) {
            report.converted = self.convert(connection).await?;
        }
        Ok(report)
    }

    pub async fn collect(&self, connection: &str, options: &StageOptions) -> Result<Vec<CollectReport>> {
        let (connector, ctx) = self.task(connection)?;
        let client = connector.client(&ctx, self.transport.clone(), self.clock.clone())?;
        let collect = CollectOptions {
            policy: options.policy(),
            concurrency: self.config.api.concurrency,
            cancel: options.cancel.clone(),
        };
        info!(connection, connector = connector.name(), "collect stage");

        let mut reports = Vec::new();
        for spec in connector.collectors(&ctx)? {
            let report = StatefulCollector::new(self.store, &client, &spec)
                .run(&collect)
                .await?;
            reports.push(report);
        }
        Ok(reports)
    }

    pub async fn extract(
        &self,
        connection: &str,
        options: &StageOptions,
    ) -> Result<Vec<(String, ExtractReport)>> {
        let (connector, ctx) = self.task(connection)?;
        let policy = options.policy();
        info!(connection, connector = connector.name(), "extract stage");

        let mut reports = Vec::new();
        for spec in connector.extractors(&ctx)? {
            let report = Extractor::new(self.store, self.clock.as_ref(), &spec)
                .run(&policy)
                .await?;
            reports.push((spec.raw_table.clone(), report));
        }
        Ok(reports)
    }

    pub async fn convert(&self, connection: &str) -> Result<Vec<(String, ConvertReport)>> {
        let (connector, ctx) = self.task(connection)?;
        info!(connection, connector = connector.name(), "convert stage");

        let mut reports = Vec::new();
        for spec in connector.converters(&ctx)? {
            let report = DomainConverter::new(self.store, &spec).run().await?;
            reports.push((spec.tool_table.clone(), report));
        }
        Ok(reports)
    }
}

/// Run `stage` for `connection` against the configured database and print a
/// summary. Ctrl-C cancels an in-flight collection without advancing state.
pub async fn run_stage(
    config: &Config,
    registry: &ConnectorRegistry,
    stage: Stage,
    connection: &str,
    full: bool,
    since: Option<String>,
) -> Result<()> {
    let since = since
        .map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d"))
        .transpose()?;

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(Duration::from_secs(
        config.api.timeout_secs,
    ))?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (handle, token) = cancellation();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let options = StageOptions {
        full,
        since,
        cancel: Some(token),
    };
    let pipeline = Pipeline::new(config, registry, &store, transport, clock);
    let result = pipeline.run(stage, connection, &options).await;
    watcher.abort();
    let report = result?;

    print_report(connection, &report);
    println!("ok");

    pool.close().await;
    Ok(())
}

fn print_report(connection: &str, report: &SyncReport) {
    if !report.collected.is_empty() {
        println!("collect {}", connection);
        for r in &report.collected {
            println!(
                "  {}: {} records, {} requests, {} skipped ({})",
                r.table,
                r.records,
                r.requests,
                r.skipped,
                if r.incremental { "incremental" } else { "full" }
            );
            if r.flushed > 0 {
                println!("    flushed: {}", r.flushed);
            }
        }
    }
    if !report.extracted.is_empty() {
        println!("extract {}", connection);
        for (table, r) in &report.extracted {
            println!(
                "  {}: {} records -> {} rows, {} failed",
                table,
                r.records,
                r.rows,
                r.failures.len()
            );
            for f in &r.failures {
                println!("    {}: {}", f.raw_id, f.error);
            }
        }
    }
    if !report.converted.is_empty() {
        println!("convert {}", connection);
        for (table, r) in &report.converted {
            println!(
                "  {}: {} entities -> {} rows, {} failed",
                table,
                r.entities,
                r.rows,
                r.failures.len()
            );
            for f in &r.failures {
                println!("    {}: {}", f.key, f.error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{response, ScriptedTransport};
    use crate::clock::ManualClock;
    use crate::config::{ApiConfig, ConnectionConfig, DbConfig};
    use chrono::{TimeZone, Utc};
    use ingest_harness_core::store::memory::InMemoryStore;
    use std::collections::BTreeMap;

    fn config() -> Config {
        let core = ConnectionConfig {
            connector: "jira".into(),
            connection_id: 1,
            scope_id: "10".into(),
            endpoint: "https://jira.test/".into(),
            token_env: None,
            username: None,
            organization: None,
            rate_limit_per_hour: None,
            page_size: 2,
        };
        let broken = ConnectionConfig {
            connector: "tapd".into(),
            ..core.clone()
        };
        let mut connections = BTreeMap::new();
        connections.insert("core".to_string(), core);
        connections.insert("broken".to_string(), broken);
        Config {
            db: DbConfig::at("unused.sqlite"),
            api: ApiConfig {
                concurrency: 1,
                ..ApiConfig::default()
            },
            connections,
        }
    }

    fn issue(id: u64, labels: &str) -> String {
        format!(
            r#"{{"id":"{id}","key":"CORE-{id}","fields":{{"summary":"s","issuetype":{{"name":"Bug"}},
            "status":{{"name":"Open","statusCategory":{{"key":"new"}}}},"labels":[{labels}],
            "created":"2024-01-0{id}T10:00:00.000+0000","updated":"2024-01-09T10:00:00.000+0000"}}}}"#
        )
    }

    #[tokio::test]
    async fn test_sync_runs_every_stage() {
        let page1 = format!(
            r#"{{"startAt":0,"maxResults":2,"total":3,"issues":[{},{}]}}"#,
            issue(1, r#""crash""#),
            issue(2, "")
        );
        let page2 = format!(
            r#"{{"startAt":2,"maxResults":2,"total":3,"issues":[{}]}}"#,
            issue(3, r#""ux","p1""#)
        );
        let transport = ScriptedTransport::new(vec![
            Ok(response(200, &[], r#"{"id":10,"name":"Core","type":"scrum"}"#)),
            Ok(response(200, &[], &page1)),
            Ok(response(200, &[], &page2)),
        ]);
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let config = config();
        let registry = ConnectorRegistry::builtin();
        let store = InMemoryStore::new();
        let pipeline = Pipeline::new(&config, &registry, &store, transport.clone(), clock);

        let report = pipeline
            .run(Stage::Sync, "core", &StageOptions::default())
            .await
            .unwrap();

        assert_eq!(report.collected.len(), 2);
        assert_eq!(report.collected[1].records, 3);
        let jql = &transport.requests.lock().unwrap()[1].query[0];
        assert_eq!(jql.1, "ORDER BY created ASC");

        let issues = store.list_domain_rows("issues").await.unwrap();
        let ids: Vec<_> = issues.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["jira:Issue:1:1", "jira:Issue:1:2", "jira:Issue:1:3"]);
        assert_eq!(store.list_domain_rows("issue_labels").await.unwrap().len(), 3);
        assert_eq!(store.list_domain_rows("board_issues").await.unwrap().len(), 3);
        let boards = store.list_domain_rows("boards").await.unwrap();
        assert_eq!(boards[0].id, "jira:Board:1:10");
    }

    #[tokio::test]
    async fn test_unknown_connector() {
        let config = config();
        let registry = ConnectorRegistry::builtin();
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        let pipeline = Pipeline::new(&config, &registry, &store, ScriptedTransport::new(vec![]), clock);

        let err = pipeline.convert("broken").await.unwrap_err();
        assert!(err.to_string().contains("Unknown connector: 'tapd'"));
        let err = pipeline.convert("missing").await.unwrap_err();
        assert!(err.to_string().contains("Unknown connection"));
    }

    #[test]
    fn test_since_maps_to_time_after() {
        let options = StageOptions {
            full: true,
            since: NaiveDate::from_ymd_opt(2024, 6, 1),
            cancel: None,
        };
        let policy = options.policy();
        assert!(policy.full_sync);
        assert_eq!(
            policy.time_after,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        );
    }
}
