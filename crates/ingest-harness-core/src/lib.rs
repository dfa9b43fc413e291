//! # Ingest Harness Core
//!
//! Runtime-free logic shared by the Ingest Harness pipeline: data models,
//! collection fingerprints, incremental-state resolution, collection windows,
//! domain id generation, and the store abstraction.
//!
//! This crate contains no tokio, sqlx, HTTP client, or filesystem I/O.
//! Everything that talks to the network or a database lives in the
//! `ingest-harness` crate.

pub mod didgen;
pub mod fingerprint;
pub mod models;
pub mod retry_after;
pub mod state;
pub mod store;
pub mod window;
