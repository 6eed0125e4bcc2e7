//! Z-DMR download engine core.
//!
//! A concurrent, resumable, range-aware HTTP fetcher that coordinates many
//! transfers under a shared bandwidth budget, persists enough state to
//! survive crashes, applies per-host proxy/header/mirror policy, recovers
//! from stalls, and emits a batched progress stream behind a
//! token-authenticated loopback API.
//!
//! # Architecture
//!
//! - [`db`] / [`store`] - SQLite persistence (downloads, segments, batches,
//!   settings, rules)
//! - [`rules`] - hostname pattern matching and policy resolution
//! - [`download`] - transport factory, bandwidth limiter, filename resolver,
//!   and the segmented fetcher
//! - [`engine`] - scheduler, state machine, stall watchdog, mirror fallback
//! - [`events`] - broadcast hub and the 250 ms progress bus
//! - [`api`] - loopback HTTP control surface with an SSE event stream

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

pub mod api;
pub mod db;
pub mod download;
pub mod engine;
pub mod events;
pub mod logging;
pub mod model;
pub mod paths;
pub mod rules;
pub mod store;

pub use db::Database;
pub use download::{BandwidthLimiter, ErrorCode, FetchError, Fetcher, Transport};
pub use engine::{Engine, EngineError, DEFAULT_CONCURRENCY};
pub use events::{EventHub, ServerEvent};
pub use model::{DownloadRecord, DownloadStatus, SettingsSnapshot};
pub use store::{Store, StoreError};
