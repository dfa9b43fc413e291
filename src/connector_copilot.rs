//! GitHub Copilot usage connector (`gh-copilot`).
//!
//! Collects, for one organization:
//!
//! - **seats** from `orgs/{org}/copilot/billing/seats`, a full pull with the
//!   page count derived from `total_seats`
//! - **daily metrics** from `orgs/{org}/copilot/metrics`, one request per
//!   day over a window clamped to the last 365 days. A 404 for a day means
//!   the report has no data for it and is skipped.
//!
//! Each metrics day extracts into one org-level row plus one row per
//! `(editor, language)` pair. Conversion produces `ai_usage_days` and
//! `accounts`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ingest_harness_core::didgen::DomainIdGenerator;
use ingest_harness_core::fingerprint::CollectionParams;
use ingest_harness_core::models::{DomainEntity, ToolEntity};
use ingest_harness_core::window::WindowPolicy;

use crate::client::{ignore_not_found, HttpResponse, RateLimitedClient, Transport};
use crate::clock::Clock;
use crate::collector::{parse_json_array, CollectorSpec, Inputs, Pagination};
use crate::converter::{tool_origin, ConverterSpec};
use crate::extractor::ExtractorSpec;
use crate::ratelimit::header_calibration;
use crate::traits::{Connector, TaskContext};

pub const RAW_SEATS_TABLE: &str = "_raw_copilot_seats";
pub const RAW_METRICS_TABLE: &str = "_raw_copilot_org_metrics";

const CONNECTOR: &str = "gh-copilot";
const MAX_LOOKBACK_DAYS: i64 = 365;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct CopilotParams {
    pub connection_id: u64,
    pub scope_id: String,
    pub organization: String,
    pub endpoint: String,
}

impl CollectionParams for CopilotParams {}

impl CopilotParams {
    pub fn from_context(ctx: &TaskContext) -> Self {
        let conn = &ctx.connection;
        Self {
            connection_id: conn.connection_id,
            scope_id: conn.scope_id.clone(),
            organization: conn
                .organization
                .clone()
                .unwrap_or_else(|| conn.scope_id.clone()),
            endpoint: conn.endpoint.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// API payloads
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct SeatPayload {
    created_at: String,
    updated_at: String,
    #[serde(default)]
    plan_type: String,
    pending_cancellation_date: Option<String>,
    last_authenticated_at: Option<String>,
    last_activity_at: Option<String>,
    #[serde(default)]
    last_activity_editor: Option<String>,
    assignee: Assignee,
}

#[derive(Debug, Deserialize)]
struct Assignee {
    login: String,
    id: i64,
}

#[derive(Debug, Deserialize)]
struct MetricsDay {
    date: String,
    #[serde(default)]
    total_active_users: i64,
    #[serde(default)]
    total_engaged_users: i64,
    #[serde(default)]
    copilot_ide_code_completions: IdeCompletions,
    #[serde(default)]
    copilot_ide_chat: IdeChat,
    #[serde(default)]
    copilot_dotcom_chat: DotcomChat,
}

#[derive(Debug, Default, Deserialize)]
struct IdeCompletions {
    #[serde(default)]
    editors: Vec<CompletionEditor>,
}

#[derive(Debug, Deserialize)]
struct CompletionEditor {
    #[serde(default)]
    name: String,
    #[serde(default)]
    models: Vec<CompletionModel>,
}

#[derive(Debug, Deserialize)]
struct CompletionModel {
    #[serde(default)]
    languages: Vec<LanguagePayload>,
}

#[derive(Debug, Deserialize)]
struct LanguagePayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    total_engaged_users: i64,
    #[serde(default)]
    total_code_suggestions: i64,
    #[serde(default)]
    total_code_acceptances: i64,
    #[serde(default)]
    total_code_lines_suggested: i64,
    #[serde(default)]
    total_code_lines_accepted: i64,
}

#[derive(Debug, Default, Deserialize)]
struct IdeChat {
    #[serde(default)]
    total_engaged_users: i64,
    #[serde(default)]
    editors: Vec<ChatEditor>,
}

#[derive(Debug, Deserialize)]
struct ChatEditor {
    #[serde(default)]
    models: Vec<ChatModel>,
}

#[derive(Debug, Deserialize)]
struct ChatModel {
    #[serde(default)]
    total_chats: i64,
    #[serde(default)]
    total_chat_copy_events: i64,
    #[serde(default)]
    total_chat_insertion_events: i64,
}

#[derive(Debug, Default, Deserialize)]
struct DotcomChat {
    #[serde(default)]
    total_engaged_users: i64,
    #[serde(default)]
    models: Vec<DotcomModel>,
}

#[derive(Debug, Deserialize)]
struct DotcomModel {
    #[serde(default)]
    total_chats: i64,
}

// ═══════════════════════════════════════════════════════════════════════
// Tool entities
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopilotSeat {
    pub connection_id: u64,
    pub organization: String,
    pub user_login: String,
    pub user_id: i64,
    pub plan_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_activity_editor: Option<String>,
    pub last_authenticated_at: Option<DateTime<Utc>>,
    pub pending_cancellation_date: Option<DateTime<Utc>>,
}

impl ToolEntity for CopilotSeat {
    const TABLE: &'static str = "_tool_copilot_seats";

    fn natural_key(&self) -> Vec<String> {
        vec![
            self.connection_id.to_string(),
            self.organization.clone(),
            self.user_login.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopilotOrgMetrics {
    pub connection_id: u64,
    pub scope_id: String,
    pub date: NaiveDate,
    pub total_active_users: i64,
    pub total_engaged_users: i64,
    pub completion_suggestions: i64,
    pub completion_acceptances: i64,
    pub completion_lines_suggested: i64,
    pub completion_lines_accepted: i64,
    pub ide_chats: i64,
    pub ide_chat_copy_events: i64,
    pub ide_chat_insertion_events: i64,
    pub ide_chat_engaged_users: i64,
    pub dotcom_chats: i64,
    pub dotcom_chat_engaged_users: i64,
}

impl ToolEntity for CopilotOrgMetrics {
    const TABLE: &'static str = "_tool_copilot_org_metrics";

    fn natural_key(&self) -> Vec<String> {
        vec![
            self.connection_id.to_string(),
            self.scope_id.clone(),
            self.date.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopilotLanguageMetrics {
    pub connection_id: u64,
    pub scope_id: String,
    pub date: NaiveDate,
    pub editor: String,
    pub language: String,
    pub engaged_users: i64,
    pub suggestions: i64,
    pub acceptances: i64,
    pub lines_suggested: i64,
    pub lines_accepted: i64,
}

impl ToolEntity for CopilotLanguageMetrics {
    const TABLE: &'static str = "_tool_copilot_language_metrics";

    fn natural_key(&self) -> Vec<String> {
        vec![
            self.connection_id.to_string(),
            self.scope_id.clone(),
            self.date.to_string(),
            self.editor.clone(),
            self.language.clone(),
        ]
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Domain entities
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiUsageDay {
    pub id: String,
    pub tool: String,
    pub scope_id: String,
    pub date: NaiveDate,
    pub active_users: i64,
    pub engaged_users: i64,
    pub suggestions: i64,
    pub acceptances: i64,
    pub acceptance_rate: Option<f64>,
    pub lines_accepted: i64,
    pub chats: i64,
}

impl DomainEntity for AiUsageDay {
    const TABLE: &'static str = "ai_usage_days";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub user_name: String,
    pub created_date: DateTime<Utc>,
}

impl DomainEntity for Account {
    const TABLE: &'static str = "accounts";

    fn id(&self) -> &str {
        &self.id
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Connector
// ═══════════════════════════════════════════════════════════════════════

pub struct CopilotConnector;

impl Connector for CopilotConnector {
    fn name(&self) -> &str {
        CONNECTOR
    }

    fn description(&self) -> &str {
        "GitHub Copilot seats and daily usage metrics"
    }

    fn client(
        &self,
        ctx: &TaskContext,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<RateLimitedClient> {
        let mut options = ctx.client_options();
        options.calibration = Some(header_calibration("X-RateLimit-Limit"));
        let mut client = RateLimitedClient::new(&ctx.connection.endpoint, transport, clock, options)
            .with_header("Accept", "application/vnd.github+json")
            .with_header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = ctx.connection.token()? {
            client = client.with_header("Authorization", format!("Bearer {}", token));
        }
        Ok(client)
    }

    fn collectors(&self, ctx: &TaskContext) -> Result<Vec<CollectorSpec>> {
        let params = CopilotParams::from_context(ctx);
        let org = params.organization.clone();
        let page_size = ctx.connection.page_size.clamp(1, MAX_PAGE_SIZE);

        let seats_org = org.clone();
        let seats = CollectorSpec::new(RAW_SEATS_TABLE, &params, move |_| {
            Ok(format!("orgs/{}/copilot/billing/seats", seats_org))
        })?
        .query(|req| {
            Ok(vec![
                ("page".to_string(), req.page.to_string()),
                ("per_page".to_string(), req.page_size.to_string()),
            ])
        })
        .page_size(page_size)
        .parser(parse_json_array(Some("seats")))
        .pagination(Pagination::Determined(Arc::new(move |resp: &HttpResponse| {
            seat_pages(resp, page_size)
        })));

        let metrics = CollectorSpec::new(RAW_METRICS_TABLE, &params, move |_| {
            Ok(format!("orgs/{}/copilot/metrics", org))
        })?
        .inputs(|window| {
            let days = window.days().map(|d| Value::String(d.to_string()));
            Ok(Box::new(days) as Inputs)
        })
        .query(|req| {
            let day: String = req.input_as()?;
            Ok(vec![
                ("since".to_string(), format!("{}T00:00:00Z", day)),
                ("until".to_string(), format!("{}T23:59:59Z", day)),
            ])
        })
        .after_response(ignore_not_found())
        .window(WindowPolicy::day_range(MAX_LOOKBACK_DAYS))
        .incremental(true)
        .config(&params)?;

        Ok(vec![seats, metrics])
    }

    fn extractors(&self, ctx: &TaskContext) -> Result<Vec<ExtractorSpec>> {
        let params = CopilotParams::from_context(ctx);

        let seat_params = params.clone();
        let seats = ExtractorSpec::json(
            RAW_SEATS_TABLE,
            &params,
            &[CopilotSeat::TABLE],
            move |seat: SeatPayload, raw| {
                let seat = to_seat(&seat_params, seat)?;
                Ok(vec![seat.to_row(&raw.fingerprint, &raw.id)?])
            },
        )?;

        let metrics_params = params.clone();
        let metrics = ExtractorSpec::json(
            RAW_METRICS_TABLE,
            &params,
            &[CopilotOrgMetrics::TABLE, CopilotLanguageMetrics::TABLE],
            move |day: MetricsDay, raw| {
                let (org, languages) = to_metrics(&metrics_params, day)?;
                let mut rows = Vec::with_capacity(1 + languages.len());
                rows.push(org.to_row(&raw.fingerprint, &raw.id)?);
                for lang in &languages {
                    rows.push(lang.to_row(&raw.fingerprint, &raw.id)?);
                }
                Ok(rows)
            },
        )?
        .incremental(true)
        .config(&params)?;

        Ok(vec![seats, metrics])
    }

    fn converters(&self, ctx: &TaskContext) -> Result<Vec<ConverterSpec>> {
        let params = CopilotParams::from_context(ctx);

        let day_ids = DomainIdGenerator::new(CONNECTOR, "CopilotOrgMetrics");
        let days = ConverterSpec::json(
            CopilotOrgMetrics::TABLE,
            &params,
            move |m: CopilotOrgMetrics, row| {
                let usage = AiUsageDay {
                    id: day_ids.generate(&[&m.connection_id, &m.scope_id, &m.date]),
                    tool: CONNECTOR.to_string(),
                    scope_id: m.scope_id.clone(),
                    date: m.date,
                    active_users: m.total_active_users,
                    engaged_users: m.total_engaged_users,
                    suggestions: m.completion_suggestions,
                    acceptances: m.completion_acceptances,
                    acceptance_rate: (m.completion_suggestions > 0).then(|| {
                        m.completion_acceptances as f64 / m.completion_suggestions as f64
                    }),
                    lines_accepted: m.completion_lines_accepted,
                    chats: m.ide_chats + m.dotcom_chats,
                };
                Ok(vec![usage.to_row(&tool_origin(row))?])
            },
        )?;

        let account_ids = DomainIdGenerator::new(CONNECTOR, "CopilotSeat");
        let accounts = ConverterSpec::json(CopilotSeat::TABLE, &params, move |s: CopilotSeat, row| {
            let account = Account {
                id: account_ids.generate(&[&s.connection_id, &s.user_login]),
                user_name: s.user_login,
                created_date: s.created_at,
            };
            Ok(vec![account.to_row(&tool_origin(row))?])
        })?;

        Ok(vec![days, accounts])
    }
}

fn seat_pages(response: &HttpResponse, page_size: usize) -> Result<i64> {
    let body: Value = response.json()?;
    let total = body
        .get("total_seats")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("seats response has no total_seats"))?;
    let size = page_size.max(1) as i64;
    Ok(((total + size - 1) / size).max(1))
}

fn to_seat(params: &CopilotParams, seat: SeatPayload) -> Result<CopilotSeat> {
    Ok(CopilotSeat {
        connection_id: params.connection_id,
        organization: params.organization.clone(),
        user_login: seat.assignee.login,
        user_id: seat.assignee.id,
        plan_type: seat.plan_type,
        created_at: parse_timestamp(&seat.created_at).context("invalid seat created_at")?,
        updated_at: parse_timestamp(&seat.updated_at).context("invalid seat updated_at")?,
        last_activity_at: parse_optional(seat.last_activity_at.as_deref())?,
        last_activity_editor: seat.last_activity_editor.filter(|e| !e.is_empty()),
        last_authenticated_at: parse_optional(seat.last_authenticated_at.as_deref())?,
        pending_cancellation_date: parse_optional(seat.pending_cancellation_date.as_deref())?,
    })
}

fn to_metrics(
    params: &CopilotParams,
    day: MetricsDay,
) -> Result<(CopilotOrgMetrics, Vec<CopilotLanguageMetrics>)> {
    let date = NaiveDate::parse_from_str(&day.date, "%Y-%m-%d").context("invalid metrics date")?;

    // The same (editor, language) pair can appear under several models.
    let mut languages: BTreeMap<(String, String), CopilotLanguageMetrics> = BTreeMap::new();
    for editor in &day.copilot_ide_code_completions.editors {
        let editor_name = normalize_dim(&editor.name);
        for model in &editor.models {
            for lang in &model.languages {
                let language = normalize_dim(&lang.name);
                let entry = languages
                    .entry((editor_name.clone(), language.clone()))
                    .or_insert_with(|| CopilotLanguageMetrics {
                        connection_id: params.connection_id,
                        scope_id: params.scope_id.clone(),
                        date,
                        editor: editor_name.clone(),
                        language,
                        engaged_users: 0,
                        suggestions: 0,
                        acceptances: 0,
                        lines_suggested: 0,
                        lines_accepted: 0,
                    });
                entry.engaged_users += lang.total_engaged_users;
                entry.suggestions += lang.total_code_suggestions;
                entry.acceptances += lang.total_code_acceptances;
                entry.lines_suggested += lang.total_code_lines_suggested;
                entry.lines_accepted += lang.total_code_lines_accepted;
            }
        }
    }
    let languages: Vec<CopilotLanguageMetrics> = languages.into_values().collect();

    let chat_models = day
        .copilot_ide_chat
        .editors
        .iter()
        .flat_map(|e| e.models.iter());
    let (mut ide_chats, mut copy_events, mut insertion_events) = (0, 0, 0);
    for model in chat_models {
        ide_chats += model.total_chats;
        copy_events += model.total_chat_copy_events;
        insertion_events += model.total_chat_insertion_events;
    }

    let org = CopilotOrgMetrics {
        connection_id: params.connection_id,
        scope_id: params.scope_id.clone(),
        date,
        total_active_users: day.total_active_users,
        total_engaged_users: day.total_engaged_users,
        completion_suggestions: languages.iter().map(|l| l.suggestions).sum(),
        completion_acceptances: languages.iter().map(|l| l.acceptances).sum(),
        completion_lines_suggested: languages.iter().map(|l| l.lines_suggested).sum(),
        completion_lines_accepted: languages.iter().map(|l| l.lines_accepted).sum(),
        ide_chats,
        ide_chat_copy_events: copy_events,
        ide_chat_insertion_events: insertion_events,
        ide_chat_engaged_users: day.copilot_ide_chat.total_engaged_users,
        dotcom_chats: day.copilot_dotcom_chat.models.iter().map(|m| m.total_chats).sum(),
        dotcom_chat_engaged_users: day.copilot_dotcom_chat.total_engaged_users,
    };
    Ok((org, languages))
}

fn normalize_dim(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        "unknown".to_string()
    } else {
        value.to_string()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    // some seat fields are date-only
    let day = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid timestamp: {}", value))?;
    Ok(day.and_time(chrono::NaiveTime::MIN).and_utc())
}

fn parse_optional(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => parse_timestamp(v).map(Some),
        None => Ok(None),
    }
}
