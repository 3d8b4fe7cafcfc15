// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # FlagFlow
//!
//! Server-side feature flag SDK: a long-lived in-process component that
//! keeps an eventually-consistent replica of your flag and segment rules,
//! evaluates them locally with microsecond latency, and reports evaluation
//! analytics in batched, deduplicated form.
//!
//! ## Features
//!
//! - **Streaming rule delivery**: server-sent events with automatic
//!   reconnection and a polling fallback
//! - **Local evaluation**: targeting, rules, percentage rollouts and
//!   experiments, prerequisites, segments — all evaluated in process with
//!   precomputed results on the hot path
//! - **Analytics pipeline**: bounded-memory event batching with context
//!   deduplication and evaluation summarization
//! - **Pluggable persistence**: optional caching wrapper over an external
//!   key/value store, with outage recovery
//! - **Big segments**: membership lookups against an external store for
//!   segments too large to replicate
//!
//! ## Example
//!
//! ```rust,no_run
//! use flagflow::{Client, Config, ContextBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::build(Config::new("sdk-key")).await?;
//!
//!     let context = ContextBuilder::new("user-123")
//!         .set("plan", serde_json::json!("enterprise"))
//!         .build();
//!     if client.bool_variation(&context, "new-billing-flow", false) {
//!         // new code path
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod bigsegments;
pub mod client;
pub mod config;
pub mod context;
pub mod datasource;
pub mod errors;
pub mod eval;
pub mod events;
pub mod model;
pub mod store;

pub use client::{AllFlagsStateOptions, Client, FlagsState};
pub use config::Config;
pub use context::{AttributeRef, Context, ContextBuilder, Kind, MultiContextBuilder};
pub use errors::{Error, Result};
pub use eval::{BigSegmentsStatus, Detail, ErrorKind, Reason};
