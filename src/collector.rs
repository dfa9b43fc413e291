//! Stateful API collector.
//!
//! A [`StatefulCollector`] runs one [`CollectorSpec`] against one
//! [`RateLimitedClient`] and stages every response item as a [`RawRecord`].
//!
//! # Run lifecycle
//!
//! ```text
//! INIT ──▶ FETCHING ◀──▶ PAGINATING ──▶ DONE    (state persisted)
//!              │
//!              └──────────────────────▶ FAILED  (state untouched)
//! ```
//!
//! 1. **INIT**: load the previous [`CollectionState`](ingest_harness_core::models::CollectionState),
//!    decide incremental vs. full, resolve the request window through the
//!    spec's [`WindowPolicy`]. Full runs flush the collection's raw records.
//! 2. **FETCHING**: a bounded worker pool pulls inputs from a lazy iterator.
//!    Each input is one stream of pages.
//! 3. **PAGINATING**: see [`Pagination`]. `page_size == 0` means one
//!    request per input.
//! 4. **DONE**: the new since-cursor is the run's start time.
//!
//! Raw records written before a failure stay in place: each page is
//! replaced atomically on its own. Inputs are their own natural key, so
//! re-fetching an input replaces its pages. An incremental run of a collector
//! without inputs appends instead, under a batch named after the run's start
//! time, so records from earlier runs are never overwritten.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use ingest_harness_core::fingerprint::{canonical_json, CollectionParams, Fingerprint};
use ingest_harness_core::models::{PageScope, RawRecord};
use ingest_harness_core::state::{self, SyncPolicy};
use ingest_harness_core::store::Store;
use ingest_harness_core::window::{CollectWindow, WindowPolicy};

use crate::client::{AfterResponse, HttpRequest, HttpResponse, RateLimitedClient};

// ═══════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Everything a request builder may depend on.
#[derive(Debug, Clone, Copy)]
pub struct RequestData<'a> {
    /// 1-based page number.
    pub page: i64,
    pub page_size: usize,
    pub input: Option<&'a Value>,
    pub window: &'a CollectWindow,
    pub incremental: bool,
    /// Data derived from the previous page by a sequential paginator.
    pub custom: Option<&'a Value>,
}

impl RequestData<'_> {
    /// Offset of the first item on this page.
    pub fn skip(&self) -> i64 {
        (self.page - 1) * self.page_size as i64
    }

    /// Decode the current input.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T> {
        let input = self.input.context("collector has no input")?;
        Ok(serde_json::from_value(input.clone())?)
    }
}

/// Items parsed out of one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    /// One raw record is staged per item.
    pub items: Vec<Vec<u8>>,
    /// Stop this input's stream after this page.
    pub finished: bool,
}

impl ParsedResponse {
    pub fn from_values(values: &[Value]) -> Result<Self> {
        let items = values
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            items,
            finished: false,
        })
    }

    pub fn finish(mut self) -> Self {
        self.finished = true;
        self
    }
}

pub type Inputs = Box<dyn Iterator<Item = Value> + Send>;
pub type InputFactory = Arc<dyn Fn(&CollectWindow) -> Result<Inputs> + Send + Sync>;
pub type UrlBuilder = Arc<dyn Fn(&RequestData<'_>) -> Result<String> + Send + Sync>;
pub type PairsBuilder =
    Arc<dyn Fn(&RequestData<'_>) -> Result<Vec<(String, String)>> + Send + Sync>;
pub type ResponseParser = Arc<dyn Fn(&HttpResponse) -> Result<ParsedResponse> + Send + Sync>;
pub type TotalPages = Arc<dyn Fn(&HttpResponse) -> Result<i64> + Send + Sync>;
pub type NextPage = Arc<dyn Fn(&HttpResponse) -> Result<Option<Value>> + Send + Sync>;

/// How a stream of pages advances. Ignored when `page_size == 0`.
#[derive(Clone)]
pub enum Pagination {
    /// Keep requesting until a page returns fewer than `page_size` items.
    Undetermined,
    /// Read the page count from page 1, then fetch the remaining pages
    /// concurrently.
    Determined(TotalPages),
    /// Derive the next page's custom data (a cursor token) from the
    /// previous response; `None` ends the stream.
    Sequential(NextPage),
}

/// Per-connector configuration of one collection.
#[derive(Clone)]
pub struct CollectorSpec {
    pub table: String,
    pub fingerprint: Fingerprint,
    /// Canonical subtask configuration; a change forces a full run.
    pub config: String,
    pub url: UrlBuilder,
    pub query: Option<PairsBuilder>,
    pub headers: Option<PairsBuilder>,
    pub parser: ResponseParser,
    pub after_response: Option<AfterResponse>,
    pub inputs: Option<InputFactory>,
    pub page_size: usize,
    pub pagination: Pagination,
    /// Overrides [`CollectOptions::concurrency`].
    pub concurrency: Option<usize>,
    pub window: WindowPolicy,
    pub incremental: bool,
}

impl CollectorSpec {
    pub fn new<P, F>(table: &str, params: &P, url: F) -> Result<Self>
    where
        P: CollectionParams,
        F: Fn(&RequestData<'_>) -> Result<String> + Send + Sync + 'static,
    {
        Ok(Self {
            table: table.to_string(),
            fingerprint: params.fingerprint()?,
            config: String::new(),
            url: Arc::new(url),
            query: None,
            headers: None,
            parser: parse_json_array(None),
            after_response: None,
            inputs: None,
            page_size: 0,
            pagination: Pagination::Undetermined,
            concurrency: None,
            window: WindowPolicy::Since,
            incremental: false,
        })
    }

    pub fn query<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestData<'_>) -> Result<Vec<(String, String)>> + Send + Sync + 'static,
    {
        self.query = Some(Arc::new(f));
        self
    }

    pub fn headers<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestData<'_>) -> Result<Vec<(String, String)>> + Send + Sync + 'static,
    {
        self.headers = Some(Arc::new(f));
        self
    }

    pub fn parser(mut self, parser: ResponseParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn after_response(mut self, policy: AfterResponse) -> Self {
        self.after_response = Some(policy);
        self
    }

    pub fn inputs<F>(mut self, f: F) -> Self
    where
        F: Fn(&CollectWindow) -> Result<Inputs> + Send + Sync + 'static,
    {
        self.inputs = Some(Arc::new(f));
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn window(mut self, window: WindowPolicy) -> Self {
        self.window = window;
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
}

/// Stage each element of a JSON array as its own record. `field` selects a
/// nested array (`"issues"` in `{"issues": [...]}`); a missing field or a
/// `null` body yields no items.
pub fn parse_json_array(field: Option<&'static str>) -> ResponseParser {
    Arc::new(move |response: &HttpResponse| {
        let body: Value = response.json()?;
        let target = match field {
            Some(name) => body.get(name).cloned().unwrap_or(Value::Null),
            None => body,
        };
        match target {
            Value::Array(items) => ParsedResponse::from_values(&items),
            Value::Null => Ok(ParsedResponse::default()),
            other => Err(anyhow!(
                "expected a JSON array{}, got {}",
                field.map(|f| format!(" at '{}'", f)).unwrap_or_default(),
                kind(&other)
            )),
        }
    })
}

/// Stage the whole body as a single record.
pub fn parse_whole_body() -> ResponseParser {
    Arc::new(|response: &HttpResponse| {
        Ok(ParsedResponse {
            items: vec![response.body.clone()],
            finished: false,
        })
    })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Cancellation
// ═══════════════════════════════════════════════════════════════════════

/// Create a linked cancellation handle and token.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped
    /// without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Run
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct CollectOptions {
    pub policy: SyncPolicy,
    /// Inputs (and determined pages) processed concurrently.
    pub concurrency: usize,
    pub cancel: Option<CancelToken>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::default(),
            concurrency: 8,
            cancel: None,
        }
    }
}

/// Summary of a completed collection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectReport {
    pub table: String,
    pub incremental: bool,
    pub since: Option<DateTime<Utc>>,
    /// Raw records removed by a full run before collecting.
    pub flushed: u64,
    pub inputs: u64,
    pub requests: u64,
    pub records: u64,
    /// Inputs or pages the after-response policy ignored.
    pub skipped: u64,
}

#[derive(Default)]
struct Stats {
    inputs: AtomicU64,
    requests: AtomicU64,
    records: AtomicU64,
    skipped: AtomicU64,
}

struct RunContext {
    window: CollectWindow,
    incremental: bool,
    batch: String,
    concurrency: usize,
    stats: Stats,
}

struct PageOutcome {
    count: usize,
    finished: bool,
    response: Option<HttpResponse>,
}

pub struct StatefulCollector<'a> {
    store: &'a dyn Store,
    client: &'a RateLimitedClient,
    spec: &'a CollectorSpec,
}

impl<'a> StatefulCollector<'a> {
    pub fn new(store: &'a dyn Store, client: &'a RateLimitedClient, spec: &'a CollectorSpec) -> Self {
        Self {
            store,
            client,
            spec,
        }
    }

    pub async fn run(&self, options: &CollectOptions) -> Result<CollectReport> {
        let spec = self.spec;
        let fingerprint = spec.fingerprint.as_str();

        let previous = self.store.get_state(&spec.table, fingerprint).await?;
        let policy = if spec.incremental {
            options.policy.clone()
        } else {
            SyncPolicy {
                full_sync: true,
                ..options.policy.clone()
            }
        };
        let mode = state::resolve(&policy, previous.as_ref(), &spec.config);
        let started_at = self.client.clock().now();
        let window = spec
            .window
            .resolve(mode.since, started_at)
            .with_context(|| format!("resolving collect window for {}", spec.table))?;

        info!(
            table = %spec.table,
            fingerprint,
            incremental = mode.incremental,
            since = ?window.since,
            until = %window.until,
            "collecting"
        );

        let flushed = if mode.incremental {
            0
        } else {
            self.store.delete_raw(&spec.table, fingerprint).await?
        };

        let batch = if mode.incremental && spec.inputs.is_none() {
            started_at.timestamp_micros().to_string()
        } else {
            String::new()
        };

        let ctx = RunContext {
            window,
            incremental: mode.incremental,
            batch,
            concurrency: spec.concurrency.unwrap_or(options.concurrency).max(1),
            stats: Stats::default(),
        };

        let work = self.collect_all(&ctx);
        let result = match &options.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(anyhow!("collection of {} cancelled", spec.table)),
                    r = work => r,
                }
            }
            None => work.await,
        };
        if let Err(e) = result {
            error!(table = %spec.table, fingerprint, "collection failed: {:#}", e);
            return Err(e);
        }

        let next = state::advance(
            previous.as_ref(),
            &spec.table,
            fingerprint,
            mode,
            &policy,
            &spec.config,
            started_at,
        );
        self.store.put_state(&next).await?;

        let report = CollectReport {
            table: spec.table.clone(),
            incremental: mode.incremental,
            since: window.since,
            flushed,
            inputs: ctx.stats.inputs.load(Ordering::Relaxed),
            requests: ctx.stats.requests.load(Ordering::Relaxed),
            records: ctx.stats.records.load(Ordering::Relaxed),
            skipped: ctx.stats.skipped.load(Ordering::Relaxed),
        };
        info!(
            table = %spec.table,
            requests = report.requests,
            records = report.records,
            skipped = report.skipped,
            requests_per_hour = self.client.requests_per_hour(),
            "collection done"
        );
        Ok(report)
    }

    async fn collect_all(&self, ctx: &RunContext) -> Result<()> {
        let inputs: Box<dyn Iterator<Item = Option<Value>> + Send> = match &self.spec.inputs {
            Some(factory) => Box::new(factory(&ctx.window)?.map(Some)),
            None => Box::new(std::iter::once(None)),
        };

        stream::iter(inputs.map(Ok::<_, anyhow::Error>))
            .try_for_each_concurrent(ctx.concurrency, |input| self.collect_input(input, ctx))
            .await
    }

    async fn collect_input(&self, input: Option<Value>, ctx: &RunContext) -> Result<()> {
        let spec = self.spec;
        ctx.stats.inputs.fetch_add(1, Ordering::Relaxed);
        let input = input.as_ref();

        if spec.page_size == 0 {
            self.fetch_page(input, 1, None, ctx).await?;
            return Ok(());
        }

        match &spec.pagination {
            Pagination::Undetermined => {
                let mut page = 1;
                loop {
                    let outcome = self.fetch_page(input, page, None, ctx).await?;
                    if outcome.response.is_none()
                        || outcome.finished
                        || outcome.count < spec.page_size
                    {
                        break;
                    }
                    page += 1;
                }
            }
            Pagination::Determined(total_pages) => {
                let first = self.fetch_page(input, 1, None, ctx).await?;
                let Some(response) = first.response.as_ref() else {
                    return Ok(());
                };
                if first.finished {
                    return Ok(());
                }
                let total = total_pages(response)
                    .with_context(|| format!("reading total pages from {}", response.url))?;
                debug!(table = %spec.table, total, "total pages");
                stream::iter((2..=total).map(Ok::<_, anyhow::Error>))
                    .try_for_each_concurrent(ctx.concurrency, |page| async move {
                        self.fetch_page(input, page, None, ctx).await?;
                        Ok::<(), anyhow::Error>(())
                    })
                    .await?;
            }
            Pagination::Sequential(next_page) => {
                let mut page = 1;
                let mut custom: Option<Value> = None;
                loop {
                    let outcome = self.fetch_page(input, page, custom.as_ref(), ctx).await?;
                    let Some(response) = outcome.response else {
                        break;
                    };
                    if outcome.finished {
                        break;
                    }
                    match next_page(&response)? {
                        Some(next) => custom = Some(next),
                        None => break,
                    }
                    page += 1;
                }
            }
        }
        Ok(())
    }

    async fn fetch_page(
        &self,
        input: Option<&Value>,
        page: i64,
        custom: Option<&Value>,
        ctx: &RunContext,
    ) -> Result<PageOutcome> {
        let spec = self.spec;
        let data = RequestData {
            page,
            page_size: spec.page_size,
            input,
            window: &ctx.window,
            incremental: ctx.incremental,
            custom,
        };
        let mut request = HttpRequest::get((spec.url)(&data)?);
        if let Some(query) = &spec.query {
            request.query = query(&data)?;
        }
        if let Some(headers) = &spec.headers {
            request.headers = headers(&data)?;
        }

        let mut reissued = 0;
        let response = loop {
            ctx.stats.requests.fetch_add(1, Ordering::Relaxed);
            match self.client.get(&request, spec.after_response.as_ref()).await {
                Ok(response) => break response,
                Err(e) if e.is_retryable() && reissued < self.client.max_retries() => {
                    reissued += 1;
                    warn!(
                        table = %spec.table,
                        url = %request.url,
                        page,
                        attempt = reissued,
                        "re-issuing request: {}",
                        e
                    );
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("collecting {} page {}", spec.table, page)))
                }
            }
        };

        let Some(response) = response else {
            ctx.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(table = %spec.table, url = %request.url, page, "no data, skipping");
            return Ok(PageOutcome {
                count: 0,
                finished: true,
                response: None,
            });
        };

        let parsed = (spec.parser)(&response)
            .with_context(|| format!("parsing response from {}", response.url))?;
        let finished = parsed.finished;

        let input_json = input.map(canonical_json);
        let scope = PageScope {
            table: &spec.table,
            fingerprint: spec.fingerprint.as_str(),
            input_key: input_json.as_deref().unwrap_or(""),
            batch: &ctx.batch,
            page,
        };
        let now = self.client.clock().now();
        let records: Vec<RawRecord> = parsed
            .items
            .into_iter()
            .enumerate()
            .map(|(position, data)| {
                RawRecord::staged(&scope, position as i64, &response.url, data, now)
            })
            .collect();

        self.store.replace_raw_page(&scope, &records).await?;
        ctx.stats.records.fetch_add(records.len() as u64, Ordering::Relaxed);

        Ok(PageOutcome {
            count: records.len(),
            finished,
            response: Some(response),
        })
    }
}
