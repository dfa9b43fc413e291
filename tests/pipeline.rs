//! Library-level pipeline tests: the Jira connector against an in-process
//! fake Agile API, persisted to SQLite.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use ingest_harness::client::{ReqwestTransport, Transport};
use ingest_harness::clock::{Clock, SystemClock};
use ingest_harness::config::load_config;
use ingest_harness::connector_jira::{Issue, JiraConnector, RAW_ISSUES_TABLE};
use ingest_harness::db;
use ingest_harness::ingest::{Pipeline, Stage, StageOptions};
use ingest_harness::migrate::create_schema;
use ingest_harness::sqlite_store::SqliteStore;
use ingest_harness::traits::{Connector, ConnectorRegistry, TaskContext};
use ingest_harness_core::store::Store;

// "ada:jira-secret"
const EXPECTED_AUTH: &str = "Basic YWRhOmppcmEtc2VjcmV0";

#[derive(Default)]
struct FakeJira {
    jql: Mutex<Vec<String>>,
    throttled: AtomicBool,
    /// When set, the issue search returns nothing (no updates since the cursor).
    quiet: AtomicBool,
    /// When set, only these issues come back, as edited.
    edited: Mutex<Option<Vec<u64>>>,
}

fn issue(id: u64, summary: &str) -> Value {
    json!({
        "id": id.to_string(),
        "key": format!("CORE-{}", id),
        "self": format!("https://jira.test/rest/api/2/issue/{}", id),
        "fields": {
            "summary": summary,
            "issuetype": {"name": if id == 1 { "Bug" } else { "Story" }},
            "status": {"name": "In Review", "statusCategory": {"key": "indeterminate"}},
            "labels": ["backend"],
            "assignee": {"accountId": "acc-1", "displayName": "Ada"},
            "created": format!("2024-01-0{}T10:00:00.000+0000", id),
            "updated": "2024-01-09T10:00:00.000+0000",
            "resolutiondate": null
        }
    })
}

async fn board(headers: HeaderMap, Path(id): Path<u64>) -> Response {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(EXPECTED_AUTH) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"id": id, "name": "Core", "type": "scrum", "self": "https://jira.test/board/10"}))
        .into_response()
}

async fn issues(
    State(fake): State<Arc<FakeJira>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(EXPECTED_AUTH) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    fake.jql
        .lock()
        .unwrap()
        .push(query.get("jql").cloned().unwrap_or_default());
    if !fake.throttled.swap(true, Ordering::SeqCst) {
        return (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "1")], "slow down").into_response();
    }

    let start: usize = query.get("startAt").and_then(|s| s.parse().ok()).unwrap_or(0);
    let max: usize = query.get("maxResults").and_then(|s| s.parse().ok()).unwrap_or(50);
    let edited = fake.edited.lock().unwrap().clone();
    let all: Vec<Value> = match edited {
        _ if fake.quiet.load(Ordering::SeqCst) => Vec::new(),
        Some(ids) => ids
            .into_iter()
            .map(|id| issue(id, &format!("Issue {} (edited)", id)))
            .collect(),
        None => (1..=3).map(|id| issue(id, &format!("Issue {}", id))).collect(),
    };
    let page: Vec<Value> = all.iter().skip(start).take(max).cloned().collect();
    Json(json!({"startAt": start, "maxResults": max, "total": all.len(), "issues": page}))
        .into_response()
}

async fn serve(fake: Arc<FakeJira>) -> String {
    let app = Router::new()
        .route("/rest/agile/1.0/board/{id}", get(board))
        .route("/rest/agile/1.0/board/{id}/issue", get(issues))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/", addr)
}

fn write_config(root: &std::path::Path, endpoint: &str) -> std::path::PathBuf {
    let path = root.join("ingest.toml");
    fs::write(
        &path,
        format!(
            r#"[db]
path = "{}/ingest.sqlite"

[api]
timeout_secs = 10
concurrency = 2

[connections.core]
connector = "jira"
connection_id = 1
scope_id = "10"
endpoint = "{}"
username = "ada"
token_env = "INGEST_PIPELINE_JIRA_TOKEN"
page_size = 2
"#,
            root.display(),
            endpoint
        ),
    )
    .unwrap();
    path
}

#[tokio::test(flavor = "multi_thread")]
async fn test_jira_sync_with_throttling_and_incremental_rerun() {
    std::env::set_var("INGEST_PIPELINE_JIRA_TOKEN", "jira-secret");
    let fake = Arc::new(FakeJira::default());
    let endpoint = serve(fake.clone()).await;
    let tmp = TempDir::new().unwrap();
    let config = load_config(&write_config(tmp.path(), &endpoint)).unwrap();

    let pool = db::connect(&config).await.unwrap();
    create_schema(&pool).await.unwrap();
    let store = SqliteStore::new(pool.clone());
    let registry = ConnectorRegistry::builtin();
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(Duration::from_secs(10)).unwrap());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = Pipeline::new(&config, &registry, &store, transport, clock);

    let report = pipeline
        .run(Stage::Sync, "core", &StageOptions::default())
        .await
        .unwrap();

    // board, then issues: page 1 throttled once and re-issued, then page 2
    let issues_report = &report.collected[1];
    assert_eq!(issues_report.records, 3);
    assert_eq!(issues_report.requests, 3);
    {
        let jql = fake.jql.lock().unwrap();
        assert_eq!(jql.len(), 3);
        assert!(jql.iter().all(|q| q == "ORDER BY created ASC"));
    }

    let rows = store.list_domain_rows("issues").await.unwrap();
    assert_eq!(rows.len(), 3);
    let first: Issue = rows[0].json().unwrap();
    assert_eq!(first.id, "jira:Issue:1:1");
    assert_eq!(first.issue_type, "BUG");
    assert_eq!(first.status, "IN_PROGRESS");
    assert_eq!(first.assignee_id.as_deref(), Some("jira:Account:1:acc-1"));
    assert_eq!(store.list_domain_rows("boards").await.unwrap()[0].id, "jira:Board:1:10");

    // Second run: incremental JQL, nothing new, nothing lost.
    fake.quiet.store(true, Ordering::SeqCst);
    let report = pipeline
        .run(Stage::Sync, "core", &StageOptions::default())
        .await
        .unwrap();
    assert!(report.collected[1].incremental);
    assert_eq!(report.collected[1].records, 0);
    let jql = fake.jql.lock().unwrap().last().cloned().unwrap();
    assert!(jql.starts_with("updated >= '"), "unexpected jql: {}", jql);
    assert!(jql.ends_with("ORDER BY created ASC"));
    assert_eq!(store.list_domain_rows("issues").await.unwrap().len(), 3);

    pool.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stages_rerun_independently_from_staged_data() {
    std::env::set_var("INGEST_PIPELINE_JIRA_TOKEN", "jira-secret");
    let fake = Arc::new(FakeJira::default());
    fake.throttled.store(true, Ordering::SeqCst);
    let endpoint = serve(fake.clone()).await;
    let tmp = TempDir::new().unwrap();
    let config = load_config(&write_config(tmp.path(), &endpoint)).unwrap();

    let pool = db::connect(&config).await.unwrap();
    create_schema(&pool).await.unwrap();
    let store = SqliteStore::new(pool.clone());
    let registry = ConnectorRegistry::builtin();
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(Duration::from_secs(10)).unwrap());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = Pipeline::new(&config, &registry, &store, transport, clock);

    pipeline
        .run(Stage::Collect, "core", &StageOptions::default())
        .await
        .unwrap();
    let sent = fake.jql.lock().unwrap().len();

    // extract and convert twice without touching the network
    for _ in 0..2 {
        let full = StageOptions {
            full: true,
            ..StageOptions::default()
        };
        let extracted = pipeline.extract("core", &full).await.unwrap();
        assert!(extracted.iter().all(|(_, r)| r.failures.is_empty()));
        pipeline.convert("core").await.unwrap();
    }
    assert_eq!(fake.jql.lock().unwrap().len(), sent);

    let ctx = TaskContext::new(
        "core",
        config.connection("core").unwrap().clone(),
        config.api.clone(),
    );
    let labels = JiraConnector.extractors(&ctx).unwrap();
    let fingerprint = labels[1].fingerprint.as_str();
    assert_eq!(
        store
            .list_tool_rows("_tool_jira_issue_labels", fingerprint)
            .await
            .unwrap()
            .len(),
        3
    );
    assert_eq!(store.list_domain_rows("issue_labels").await.unwrap().len(), 3);

    pool.close().await;
}

async fn issue_summaries(store: &SqliteStore, fingerprint: &str) -> Vec<(u64, String)> {
    let mut rows: Vec<(u64, String)> = store
        .list_tool_rows("_tool_jira_issues", fingerprint)
        .await
        .unwrap()
        .iter()
        .map(|row| {
            let issue: Value = row.json().unwrap();
            (
                issue["issue_id"].as_u64().unwrap(),
                issue["summary"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    rows.sort();
    rows
}

#[tokio::test(flavor = "multi_thread")]
async fn test_incremental_rerun_keeps_earlier_raw_and_tool_rows() {
    std::env::set_var("INGEST_PIPELINE_JIRA_TOKEN", "jira-secret");
    let fake = Arc::new(FakeJira::default());
    fake.throttled.store(true, Ordering::SeqCst);
    let endpoint = serve(fake.clone()).await;
    let tmp = TempDir::new().unwrap();
    let config = load_config(&write_config(tmp.path(), &endpoint)).unwrap();

    let pool = db::connect(&config).await.unwrap();
    create_schema(&pool).await.unwrap();
    let store = SqliteStore::new(pool.clone());
    let registry = ConnectorRegistry::builtin();
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(Duration::from_secs(10)).unwrap());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = Pipeline::new(&config, &registry, &store, transport, clock);

    let ctx = TaskContext::new(
        "core",
        config.connection("core").unwrap().clone(),
        config.api.clone(),
    );
    let collectors = JiraConnector.collectors(&ctx).unwrap();
    let raw_fp = collectors[1].fingerprint.as_str();
    let extractors = JiraConnector.extractors(&ctx).unwrap();
    let tool_fp = extractors[1].fingerprint.as_str();

    // issues {1,2} on page 1, {3} on page 2
    pipeline
        .run(Stage::Sync, "core", &StageOptions::default())
        .await
        .unwrap();
    assert_eq!(store.list_raw(RAW_ISSUES_TABLE, raw_fp, None).await.unwrap().len(), 3);

    // only issue 3 changed: it comes back alone, on page 1
    *fake.edited.lock().unwrap() = Some(vec![3]);
    let report = pipeline
        .run(Stage::Sync, "core", &StageOptions::default())
        .await
        .unwrap();
    assert!(report.collected[1].incremental);
    assert_eq!(report.collected[1].records, 1);
    assert_eq!(store.list_raw(RAW_ISSUES_TABLE, raw_fp, None).await.unwrap().len(), 4);

    let expected = vec![
        (1, "Issue 1".to_string()),
        (2, "Issue 2".to_string()),
        (3, "Issue 3 (edited)".to_string()),
    ];
    assert_eq!(issue_summaries(&store, tool_fp).await, expected);
    assert_eq!(
        store
            .list_tool_rows("_tool_jira_issue_labels", tool_fp)
            .await
            .unwrap()
            .len(),
        3
    );

    // a full re-extract from the staged records reproduces every issue
    let full = StageOptions {
        full: true,
        ..StageOptions::default()
    };
    let extracted = pipeline.extract("core", &full).await.unwrap();
    assert!(extracted.iter().all(|(_, r)| r.failures.is_empty()));
    assert_eq!(issue_summaries(&store, tool_fp).await, expected);
    pipeline.convert("core").await.unwrap();
    assert_eq!(store.list_domain_rows("issues").await.unwrap().len(), 3);

    pool.close().await;
}
