//! Jira Agile connector (`jira`).
//!
//! Scope is one board. Collects the board itself and its issues through the
//! Agile REST API. Issues are paged with `startAt`/`maxResults`, the page
//! count is read from `total` on the first page, and incremental runs narrow
//! the JQL to `updated >= <cursor>`. Issues are always requested in creation
//! order so that pages stay stable while the board changes underneath.
//!
//! Authentication is HTTP basic with `username` and the token from
//! `token_env`, or a bearer token when no username is configured.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ingest_harness_core::didgen::DomainIdGenerator;
use ingest_harness_core::fingerprint::CollectionParams;
use ingest_harness_core::models::{DomainEntity, ToolEntity};
use ingest_harness_core::window::CollectWindow;

use crate::client::{HttpResponse, RateLimitedClient, Transport};
use crate::clock::Clock;
use crate::collector::{parse_json_array, parse_whole_body, CollectorSpec, Pagination};
use crate::converter::{tool_origin, ConverterSpec};
use crate::extractor::ExtractorSpec;
use crate::traits::{Connector, TaskContext};

pub const RAW_BOARD_TABLE: &str = "_raw_jira_api_boards";
pub const RAW_ISSUES_TABLE: &str = "_raw_jira_api_issues";

const CONNECTOR: &str = "jira";
/// Jira Cloud's cap on `maxResults` for board issue searches.
const MAX_RESULTS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct JiraParams {
    pub connection_id: u64,
    pub board_id: u64,
}

impl CollectionParams for JiraParams {}

impl JiraParams {
    pub fn from_context(ctx: &TaskContext) -> Result<Self> {
        let board_id = ctx
            .connection
            .scope_id
            .trim()
            .parse()
            .with_context(|| format!("jira scope_id must be a board id, got '{}'", ctx.connection.scope_id))?;
        Ok(Self {
            connection_id: ctx.connection.connection_id,
            board_id,
        })
    }
}

/// JQL for one collection window.
pub fn issues_jql(window: &CollectWindow) -> String {
    match window.since {
        Some(since) => format!(
            "updated >= '{}' ORDER BY created ASC",
            since.format("%Y/%m/%d %H:%M")
        ),
        None => "ORDER BY created ASC".to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// API payloads
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct BoardPayload {
    id: u64,
    name: String,
    #[serde(rename = "self", default)]
    self_url: String,
    #[serde(rename = "type", default)]
    board_type: String,
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    id: String,
    key: String,
    #[serde(rename = "self", default)]
    self_url: String,
    fields: IssueFields,
}

#[derive(Debug, Deserialize)]
struct IssueFields {
    #[serde(default)]
    summary: String,
    issuetype: Option<Named>,
    status: Option<StatusPayload>,
    priority: Option<Named>,
    #[serde(default)]
    labels: Vec<String>,
    assignee: Option<UserPayload>,
    creator: Option<UserPayload>,
    created: String,
    updated: String,
    resolutiondate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    name: String,
    #[serde(rename = "statusCategory")]
    category: Option<StatusCategory>,
}

#[derive(Debug, Deserialize)]
struct StatusCategory {
    key: String,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    #[serde(rename = "accountId", alias = "name")]
    account_id: String,
    #[serde(rename = "displayName", default)]
    display_name: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Tool entities
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JiraBoard {
    pub connection_id: u64,
    pub board_id: u64,
    pub name: String,
    pub self_url: String,
    pub board_type: String,
}

impl ToolEntity for JiraBoard {
    const TABLE: &'static str = "_tool_jira_boards";

    fn natural_key(&self) -> Vec<String> {
        vec![self.connection_id.to_string(), self.board_id.to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JiraIssue {
    pub connection_id: u64,
    pub issue_id: u64,
    pub issue_key: String,
    pub self_url: String,
    pub summary: String,
    pub issue_type: String,
    pub status_name: String,
    pub status_key: String,
    pub priority: Option<String>,
    pub assignee_account_id: Option<String>,
    pub assignee_display_name: Option<String>,
    pub creator_account_id: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub resolution_date: Option<DateTime<Utc>>,
}

impl ToolEntity for JiraIssue {
    const TABLE: &'static str = "_tool_jira_issues";

    fn natural_key(&self) -> Vec<String> {
        vec![self.connection_id.to_string(), self.issue_id.to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JiraBoardIssue {
    pub connection_id: u64,
    pub board_id: u64,
    pub issue_id: u64,
}

impl ToolEntity for JiraBoardIssue {
    const TABLE: &'static str = "_tool_jira_board_issues";

    fn natural_key(&self) -> Vec<String> {
        vec![
            self.connection_id.to_string(),
            self.board_id.to_string(),
            self.issue_id.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JiraIssueLabel {
    pub connection_id: u64,
    pub issue_id: u64,
    pub label_name: String,
}

impl ToolEntity for JiraIssueLabel {
    const TABLE: &'static str = "_tool_jira_issue_labels";

    fn natural_key(&self) -> Vec<String> {
        vec![
            self.connection_id.to_string(),
            self.issue_id.to_string(),
            self.label_name.clone(),
        ]
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Domain entities
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub board_type: String,
}

impl DomainEntity for Board {
    const TABLE: &'static str = "boards";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub issue_key: String,
    pub title: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub status: String,
    pub original_status: String,
    pub priority: Option<String>,
    pub assignee_id: Option<String>,
    pub assignee_name: Option<String>,
    pub creator_id: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub resolution_date: Option<DateTime<Utc>>,
    pub lead_time_minutes: Option<i64>,
    pub url: String,
}

impl DomainEntity for Issue {
    const TABLE: &'static str = "issues";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardIssue {
    pub id: String,
    pub board_id: String,
    pub issue_id: String,
}

impl DomainEntity for BoardIssue {
    const TABLE: &'static str = "board_issues";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueLabel {
    pub id: String,
    pub issue_id: String,
    pub label_name: String,
}

impl DomainEntity for IssueLabel {
    const TABLE: &'static str = "issue_labels";

    fn id(&self) -> &str {
        &self.id
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Connector
// ═══════════════════════════════════════════════════════════════════════

pub struct JiraConnector;

impl Connector for JiraConnector {
    fn name(&self) -> &str {
        CONNECTOR
    }

    fn description(&self) -> &str {
        "Jira Agile boards and issues"
    }

    fn client(
        &self,
        ctx: &TaskContext,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<RateLimitedClient> {
        let mut client = RateLimitedClient::new(
            &ctx.connection.endpoint,
            transport,
            clock,
            ctx.client_options(),
        )
        .with_header("Accept", "application/json");
        if let Some(token) = ctx.connection.token()? {
            let auth = match &ctx.connection.username {
                Some(user) => basic_auth(user, &token),
                None => format!("Bearer {}", token),
            };
            client = client.with_header("Authorization", auth);
        }
        Ok(client)
    }

    fn collectors(&self, ctx: &TaskContext) -> Result<Vec<CollectorSpec>> {
        let params = JiraParams::from_context(ctx)?;
        let board_id = params.board_id;
        let page_size = ctx.connection.page_size.clamp(1, MAX_RESULTS);

        let board = CollectorSpec::new(RAW_BOARD_TABLE, &params, move |_| {
            Ok(format!("rest/agile/1.0/board/{}", board_id))
        })?
        .parser(parse_whole_body());

        let issues = CollectorSpec::new(RAW_ISSUES_TABLE, &params, move |_| {
            Ok(format!("rest/agile/1.0/board/{}/issue", board_id))
        })?
        .query(|req| {
            Ok(vec![
                ("jql".to_string(), issues_jql(req.window)),
                ("startAt".to_string(), req.skip().to_string()),
                ("maxResults".to_string(), req.page_size.to_string()),
            ])
        })
        .page_size(page_size)
        .parser(parse_json_array(Some("issues")))
        .pagination(Pagination::Determined(Arc::new(move |resp: &HttpResponse| {
            total_pages(resp, page_size)
        })))
        .incremental(true)
        .config(&params)?;

        Ok(vec![board, issues])
    }

    fn extractors(&self, ctx: &TaskContext) -> Result<Vec<ExtractorSpec>> {
        let params = JiraParams::from_context(ctx)?;
        let connection_id = params.connection_id;

        let boards = ExtractorSpec::json(
            RAW_BOARD_TABLE,
            &params,
            &[JiraBoard::TABLE],
            move |b: BoardPayload, raw| {
                let board = JiraBoard {
                    connection_id,
                    board_id: b.id,
                    name: b.name,
                    self_url: b.self_url,
                    board_type: b.board_type,
                };
                Ok(vec![board.to_row(&raw.fingerprint, &raw.id)?])
            },
        )?;

        let issue_params = params.clone();
        let issues = ExtractorSpec::json(
            RAW_ISSUES_TABLE,
            &params,
            &[JiraIssue::TABLE, JiraBoardIssue::TABLE, JiraIssueLabel::TABLE],
            move |payload: IssuePayload, raw| {
                let labels = payload.fields.labels.clone();
                let issue = to_issue(issue_params.connection_id, payload)?;
                let mut rows = vec![
                    issue.to_row(&raw.fingerprint, &raw.id)?,
                    JiraBoardIssue {
                        connection_id: issue.connection_id,
                        board_id: issue_params.board_id,
                        issue_id: issue.issue_id,
                    }
                    .to_row(&raw.fingerprint, &raw.id)?,
                ];
                for label_name in labels {
                    let label = JiraIssueLabel {
                        connection_id: issue.connection_id,
                        issue_id: issue.issue_id,
                        label_name,
                    };
                    rows.push(label.to_row(&raw.fingerprint, &raw.id)?);
                }
                Ok(rows)
            },
        )?
        .incremental(true)
        .config(&params)?;

        Ok(vec![boards, issues])
    }

    fn converters(&self, ctx: &TaskContext) -> Result<Vec<ConverterSpec>> {
        let params = JiraParams::from_context(ctx)?;
        let board_ids = DomainIdGenerator::new(CONNECTOR, "Board");
        let issue_ids = DomainIdGenerator::new(CONNECTOR, "Issue");
        let account_ids = DomainIdGenerator::new(CONNECTOR, "Account");

        let boards = {
            let board_ids = board_ids.clone();
            ConverterSpec::json(JiraBoard::TABLE, &params, move |b: JiraBoard, row| {
                let board = Board {
                    id: board_ids.generate(&[&b.connection_id, &b.board_id]),
                    name: b.name,
                    url: b.self_url,
                    board_type: b.board_type,
                };
                Ok(vec![board.to_row(&tool_origin(row))?])
            })?
        };

        let issues = {
            let issue_ids = issue_ids.clone();
            ConverterSpec::json(JiraIssue::TABLE, &params, move |i: JiraIssue, row| {
                let issue = Issue {
                    id: issue_ids.generate(&[&i.connection_id, &i.issue_id]),
                    title: i.summary.clone(),
                    issue_type: standard_type(&i.issue_type).to_string(),
                    status: standard_status(&i.status_key).to_string(),
                    original_status: i.status_name.clone(),
                    assignee_id: i
                        .assignee_account_id
                        .as_ref()
                        .map(|a| account_ids.generate(&[&i.connection_id, a])),
                    creator_id: i
                        .creator_account_id
                        .as_ref()
                        .map(|a| account_ids.generate(&[&i.connection_id, a])),
                    lead_time_minutes: i
                        .resolution_date
                        .map(|done| (done - i.created).num_minutes()),
                    issue_key: i.issue_key,
                    priority: i.priority,
                    assignee_name: i.assignee_display_name,
                    created_date: i.created,
                    updated_date: i.updated,
                    resolution_date: i.resolution_date,
                    url: i.self_url,
                };
                Ok(vec![issue.to_row(&tool_origin(row))?])
            })?
        };

        let board_issues = {
            let board_ids = board_ids.clone();
            let issue_ids = issue_ids.clone();
            ConverterSpec::json(
                JiraBoardIssue::TABLE,
                &params,
                move |bi: JiraBoardIssue, row| {
                    let board_id = board_ids.generate(&[&bi.connection_id, &bi.board_id]);
                    let issue_id = issue_ids.generate(&[&bi.connection_id, &bi.issue_id]);
                    let link = BoardIssue {
                        id: format!("{}#{}", board_id, issue_id),
                        board_id,
                        issue_id,
                    };
                    Ok(vec![link.to_row(&tool_origin(row))?])
                },
            )?
        };

        let labels = ConverterSpec::json(
            JiraIssueLabel::TABLE,
            &params,
            move |l: JiraIssueLabel, row| {
                let issue_id = issue_ids.generate(&[&l.connection_id, &l.issue_id]);
                let label = IssueLabel {
                    id: format!("{}#{}", issue_id, l.label_name),
                    issue_id,
                    label_name: l.label_name,
                };
                Ok(vec![label.to_row(&tool_origin(row))?])
            },
        )?;

        Ok(vec![boards, issues, board_issues, labels])
    }
}

fn basic_auth(user: &str, token: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, token)))
}

/// Page count for `startAt` steps of `page_size`. A server that honoured a
/// smaller `maxResults` than requested would leave gaps between pages, so
/// that is an error.
fn total_pages(response: &HttpResponse, page_size: usize) -> Result<i64> {
    let body: Value = response.json()?;
    let total = body
        .get("total")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("issues response has no total"))?;
    if let Some(honoured) = body.get("maxResults").and_then(Value::as_u64) {
        if (honoured as usize) < page_size {
            bail!(
                "server capped maxResults at {} (requested {}); lower page_size",
                honoured,
                page_size
            );
        }
    }
    let page_size = page_size.max(1) as i64;
    Ok(((total + page_size - 1) / page_size).max(1))
}

fn to_issue(connection_id: u64, payload: IssuePayload) -> Result<JiraIssue> {
    let fields = payload.fields;
    let status = fields.status;
    Ok(JiraIssue {
        connection_id,
        issue_id: payload
            .id
            .parse()
            .with_context(|| format!("invalid issue id: {}", payload.id))?,
        issue_key: payload.key,
        self_url: payload.self_url,
        summary: fields.summary,
        issue_type: fields.issuetype.map(|t| t.name).unwrap_or_default(),
        status_key: status
            .as_ref()
            .and_then(|s| s.category.as_ref())
            .map(|c| c.key.clone())
            .unwrap_or_default(),
        status_name: status.map(|s| s.name).unwrap_or_default(),
        priority: fields.priority.map(|p| p.name),
        assignee_account_id: fields.assignee.as_ref().map(|a| a.account_id.clone()),
        assignee_display_name: fields.assignee.map(|a| a.display_name),
        creator_account_id: fields.creator.map(|c| c.account_id),
        created: parse_jira_time(&fields.created).context("invalid created date")?,
        updated: parse_jira_time(&fields.updated).context("invalid updated date")?,
        resolution_date: match fields.resolutiondate.as_deref() {
            Some(s) if !s.is_empty() => {
                Some(parse_jira_time(s).context("invalid resolution date")?)
            }
            _ => None,
        },
    })
}

/// Jira timestamps look like `2024-01-05T10:00:00.000+0000`.
fn parse_jira_time(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .with_context(|| format!("unparseable timestamp: {}", value))?;
    Ok(parsed.with_timezone(&Utc))
}

fn standard_type(issue_type: &str) -> &'static str {
    match issue_type.to_ascii_lowercase().as_str() {
        "bug" => "BUG",
        "incident" => "INCIDENT",
        "epic" => "EPIC",
        "sub-task" | "subtask" => "SUBTASK",
        "task" => "TASK",
        _ => "REQUIREMENT",
    }
}

fn standard_status(category_key: &str) -> &'static str {
    match category_key {
        "done" => "DONE",
        "new" => "TODO",
        _ => "IN_PROGRESS",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, ConnectionConfig};
    use chrono::TimeZone;

    fn issue_json(created: &str) -> String {
        format!(
            r#"{{
                "id": "10001",
                "key": "CORE-1",
                "self": "https://jira.test/rest/api/2/issue/10001",
                "fields": {{
                    "summary": "Crash on start",
                    "issuetype": {{"name": "Bug"}},
                    "status": {{"name": "Closed", "statusCategory": {{"key": "done"}}}},
                    "labels": ["crash", "p1"],
                    "assignee": {{"accountId": "abc", "displayName": "Ada"}},
                    "created": "{}",
                    "updated": "2024-01-06T10:00:00.000+0000",
                    "resolutiondate": "2024-01-07T10:00:00.000+0000"
                }}
            }}"#,
            created
        )
    }

    #[test]
    fn test_jql_uses_cursor_and_creation_order() {
        let window = CollectWindow {
            since: Some(Utc.with_ymd_and_hms(2024, 3, 5, 7, 9, 30).unwrap()),
            until: Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap(),
        };
        assert_eq!(
            issues_jql(&window),
            "updated >= '2024/03/05 07:09' ORDER BY created ASC"
        );
        let full = CollectWindow {
            since: None,
            ..window
        };
        assert_eq!(issues_jql(&full), "ORDER BY created ASC");
    }

    #[test]
    fn test_to_issue() {
        let payload: IssuePayload =
            serde_json::from_str(&issue_json("2024-01-05T10:00:00.000+0100")).unwrap();
        let issue = to_issue(1, payload).unwrap();
        assert_eq!(issue.issue_id, 10001);
        assert_eq!(issue.status_key, "done");
        assert_eq!(issue.assignee_account_id.as_deref(), Some("abc"));
        assert_eq!(issue.created, Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap());
        assert!(issue.resolution_date.is_some());
    }

    #[test]
    fn test_malformed_created_date() {
        let payload: IssuePayload = serde_json::from_str(&issue_json("yesterday")).unwrap();
        let err = to_issue(1, payload).unwrap_err();
        assert!(format!("{:#}", err).contains("invalid created date"));
    }

    fn search_response(body: &str) -> HttpResponse {
        HttpResponse {
            url: "u".into(),
            status: 200,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_total_pages() {
        let resp = search_response(r#"{"startAt":0,"maxResults":50,"total":120,"issues":[]}"#);
        assert_eq!(total_pages(&resp, 50).unwrap(), 3);
        assert_eq!(total_pages(&resp, 20).unwrap(), 6);
        let empty = search_response(r#"{"startAt":0,"maxResults":50,"total":0,"issues":[]}"#);
        assert_eq!(total_pages(&empty, 50).unwrap(), 1);
    }

    #[test]
    fn test_capped_max_results_is_an_error() {
        let resp = search_response(r#"{"startAt":0,"maxResults":50,"total":120,"issues":[]}"#);
        let err = total_pages(&resp, 100).unwrap_err();
        assert!(err.to_string().contains("capped maxResults at 50"));
    }

    #[test]
    fn test_page_size_is_clamped_to_jira_cap() {
        let connection = ConnectionConfig {
            connector: "jira".into(),
            connection_id: 1,
            scope_id: "10".into(),
            endpoint: "https://jira.test/".into(),
            token_env: None,
            username: None,
            organization: None,
            rate_limit_per_hour: None,
            page_size: 500,
        };
        let ctx = TaskContext::new("core", connection, ApiConfig::default());
        let collectors = JiraConnector.collectors(&ctx).unwrap();
        assert_eq!(collectors[1].page_size, MAX_RESULTS);
    }

    #[test]
    fn test_basic_auth() {
        assert_eq!(basic_auth("ada", "secret"), "Basic YWRhOnNlY3JldA==");
    }

    #[test]
    fn test_standard_mappings() {
        assert_eq!(standard_type("Bug"), "BUG");
        assert_eq!(standard_type("Story"), "REQUIREMENT");
        assert_eq!(standard_status("indeterminate"), "IN_PROGRESS");
    }
}
