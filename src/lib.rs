//! # Ingest Harness
//!
//! A collect → extract → convert pipeline for developer-tool APIs.
//!
//! Connectors describe *what* to fetch and how to map it; the pipeline owns
//! rate limiting, retries, concurrency, incremental cursors, and idempotent
//! staging. Every stage can be re-run on its own against what the previous
//! stage left in the store.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  raw   ┌───────────┐  tool   ┌─────────────────┐  domain
//! │ Stateful   │──────▶│ Extractor │───────▶│ DomainConverter │──────▶ SQLite
//! │ Collector  │        └───────────┘         └─────────────────┘
//! └─────┬──────┘
//!       ▼
//! ┌──────────────────┐
//! │ RateLimitedClient│──▶ vendor API
//! └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ingest init                   # create database
//! ingest connectors             # list connectors
//! ingest sync copilot           # collect, extract, convert
//! ingest collect jira --full    # re-collect from scratch
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`client`] | Rate-limited HTTP client with retry and backoff |
//! | [`ratelimit`] | Sliding-window request budget |
//! | [`collector`] | Stateful, concurrent API collection |
//! | [`extractor`] | Raw-to-tool extraction |
//! | [`converter`] | Tool-to-domain conversion |
//! | [`traits`] | Connector trait and registry |
//! | [`connector_copilot`] | GitHub Copilot usage connector |
//! | [`connector_jira`] | Jira Agile connector |
//! | [`ingest`] | Stage orchestration |
//! | [`sqlite_store`] | SQLite storage backend |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod client;
pub mod clock;
pub mod collector;
pub mod config;
pub mod connector_copilot;
pub mod connector_jira;
pub mod converter;
pub mod db;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod migrate;
pub mod ratelimit;
pub mod sources;
pub mod sqlite_store;
pub mod traits;
