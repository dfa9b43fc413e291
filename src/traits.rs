//! Connector extension point.
//!
//! A connector is a thin configuration of the shared pipeline: it hands out
//! [`CollectorSpec`]s, [`ExtractorSpec`]s and [`ConverterSpec`]s for one
//! configured connection, plus the HTTP client those collectors run on.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌────────────┐ ┌────────┐ ┌──────────┐  │
//! │  │ gh-copilot │ │  jira  │ │  Custom  │  │
//! │  └────────────┘ └────────┘ └──────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!   collect ──▶ raw ──▶ extract ──▶ tool ──▶ convert ──▶ domain
//! ```
//!
//! # Usage
//!
//! ```rust
//! use ingest_harness::traits::ConnectorRegistry;
//!
//! let mut connectors = ConnectorRegistry::builtin();
//! // connectors.register(Box::new(MyConnector::new()));
//! assert!(connectors.get("jira").is_some());
//! ```

use std::sync::Arc;

use anyhow::Result;

use crate::client::{ClientOptions, RateLimitedClient, Transport};
use crate::clock::Clock;
use crate::collector::CollectorSpec;
use crate::config::{ApiConfig, ConnectionConfig};
use crate::converter::ConverterSpec;
use crate::extractor::ExtractorSpec;

// ═══════════════════════════════════════════════════════════════════════
// TaskContext
// ═══════════════════════════════════════════════════════════════════════

/// One configured connection, as seen by a connector.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Connection name from the config file.
    pub name: String,
    pub connection: ConnectionConfig,
    pub api: ApiConfig,
}

impl TaskContext {
    pub fn new(name: &str, connection: ConnectionConfig, api: ApiConfig) -> Self {
        Self {
            name: name.to_string(),
            connection,
            api,
        }
    }

    /// Client limits from `[api]`, with the connection's own ceiling as an
    /// override.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            default_requests_per_hour: self.api.requests_per_hour,
            requests_per_hour: self.connection.rate_limit_per_hour,
            calibration: None,
            max_retries: self.api.max_retries,
            max_in_flight: self.api.max_in_flight,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Build the client for a connection. The default sends no credentials.
    fn client(
        &self,
        ctx: &TaskContext,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<RateLimitedClient> {
        Ok(RateLimitedClient::new(
            &ctx.connection.endpoint,
            transport,
            clock,
            ctx.client_options(),
        ))
    }

    fn collectors(&self, ctx: &TaskContext) -> Result<Vec<CollectorSpec>>;

    fn extractors(&self, ctx: &TaskContext) -> Result<Vec<ExtractorSpec>>;

    fn converters(&self, ctx: &TaskContext) -> Result<Vec<ConverterSpec>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Explicit set of available connectors, built once and passed by
/// reference.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Registry holding the built-in connectors.
    pub fn builtin() -> Self {
        use crate::connector_copilot::CopilotConnector;
        use crate::connector_jira::JiraConnector;

        let mut registry = Self::new();
        registry.register(Box::new(CopilotConnector));
        registry.register(Box::new(JiraConnector));
        registry
    }

    /// Register a connector. A later registration with the same name
    /// shadows the earlier one.
    pub fn register(&mut self, connector: Box<dyn Connector>) {
        self.connectors.push(connector);
    }

    pub fn connectors(&self) -> &[Box<dyn Connector>] {
        &self.connectors
    }

    pub fn get(&self, name: &str) -> Option<&dyn Connector> {
        self.connectors
            .iter()
            .rev()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
