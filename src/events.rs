//! Event fan-out: broadcast hub, per-download runtime counters, and the
//! periodic progress bus.
//!
//! Segment tasks only bump atomic counters; the bus is the sole aggregator.
//! Every 250 ms it gathers downloads whose counters changed, computes EWMA
//! speed and ETA, and emits one batched snapshot. Missed ticks collapse into
//! the next one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::instrument;

use crate::download::error::ErrorCode;
use crate::model::{now_rfc3339, DownloadStatus, ProgressUpdate};

/// Cadence of batched progress snapshots.
pub const PROGRESS_TICK: Duration = Duration::from_millis(250);

/// Smoothing factor for the speed estimate.
const EWMA_ALPHA: f64 = 0.3;

/// Window over which instantaneous speed is sampled before smoothing.
const EWMA_WINDOW: Duration = Duration::from_secs(1);

/// Events visible to subscribers (UI shell and control API).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Batched progress rows for downloads that changed this tick.
    ProgressBatch(Vec<ProgressUpdate>),
    /// Structural change: add, delete, or a status transition.
    DownloadsChanged,
}

/// Broadcast source shared by the engine, the bus, and the API.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ServerEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Creates the hub. Slow subscribers lag and drop, they never backlog.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(512);
        Self { tx }
    }

    /// Subscribes to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Emits a progress batch; dropped silently when nobody listens.
    pub fn emit_progress_batch(&self, updates: Vec<ProgressUpdate>) {
        let _ = self.tx.send(ServerEvent::ProgressBatch(updates));
    }

    /// Emits a structural-change notification.
    pub fn emit_downloads_changed(&self) {
        let _ = self.tx.send(ServerEvent::DownloadsChanged);
    }
}

/// Live counters for one active download. Writers (driver and segment tasks)
/// update these; only the progress bus turns them into events.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug)]
struct StatsInner {
    id: String,
    bytes: AtomicI64,
    /// Expected total; -1 while unknown.
    total: AtomicI64,
    status: Mutex<DownloadStatus>,
    error_code: Mutex<Option<ErrorCode>>,
    error_message: Mutex<Option<String>>,
    /// Absolute deadline of the current retry backoff, if any.
    backoff_until: Mutex<Option<Instant>>,
    /// Set when the driver is done with this download; the bus emits one
    /// final row and then drops the entry.
    finished: AtomicBool,
}

impl RuntimeStats {
    /// Creates counters for a download starting at `bytes` already on disk.
    #[must_use]
    pub fn new(id: impl Into<String>, bytes: i64) -> Self {
        Self {
            inner: Arc::new(StatsInner {
                id: id.into(),
                bytes: AtomicI64::new(bytes),
                total: AtomicI64::new(-1),
                status: Mutex::new(DownloadStatus::Queued),
                error_code: Mutex::new(None),
                error_message: Mutex::new(None),
                backoff_until: Mutex::new(None),
                finished: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn add_bytes(&self, n: u64) {
        self.inner.bytes.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub fn set_bytes(&self, n: i64) {
        self.inner.bytes.store(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn bytes(&self) -> i64 {
        self.inner.bytes.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: Option<i64>) {
        self.inner.total.store(total.unwrap_or(-1), Ordering::Relaxed);
    }

    #[must_use]
    pub fn total(&self) -> Option<i64> {
        let raw = self.inner.total.load(Ordering::Relaxed);
        (raw >= 0).then_some(raw)
    }

    pub fn set_status(&self, status: DownloadStatus) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.status.lock().unwrap();
        *guard = status;
    }

    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        #[allow(clippy::unwrap_used)]
        let guard = self.inner.status.lock().unwrap();
        *guard
    }

    pub fn set_error(&self, code: ErrorCode, message: impl Into<String>) {
        #[allow(clippy::unwrap_used)]
        let mut code_guard = self.inner.error_code.lock().unwrap();
        *code_guard = Some(code);
        drop(code_guard);
        #[allow(clippy::unwrap_used)]
        let mut message_guard = self.inner.error_message.lock().unwrap();
        *message_guard = Some(message.into());
    }

    #[must_use]
    pub fn error(&self) -> (Option<ErrorCode>, Option<String>) {
        #[allow(clippy::unwrap_used)]
        let code = *self.inner.error_code.lock().unwrap();
        #[allow(clippy::unwrap_used)]
        let message = self.inner.error_message.lock().unwrap().clone();
        (code, message)
    }

    /// Sets or clears the retry-backoff deadline shown to the UI.
    pub fn set_backoff_until(&self, deadline: Option<Instant>) {
        #[allow(clippy::unwrap_used)]
        let mut guard = self.inner.backoff_until.lock().unwrap();
        *guard = deadline;
    }

    /// Marks the download finished so the bus emits one last row.
    pub fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        #[allow(clippy::unwrap_used)]
        let guard = self.inner.backoff_until.lock().unwrap();
        guard.and_then(|deadline| {
            let remaining = deadline.saturating_duration_since(now);
            (!remaining.is_zero()).then_some(remaining)
        })
    }
}

/// Shared registry of live downloads, owned by the engine and read by the bus.
pub type StatsRegistry = Arc<DashMap<String, RuntimeStats>>;

/// Per-download bookkeeping private to the bus.
struct BusState {
    ewma_bps: f64,
    window_start: Instant,
    window_start_bytes: i64,
    last_emitted_bytes: i64,
    last_emitted_status: Option<DownloadStatus>,
    last_emitted_detail: Option<String>,
}

/// Spawns the periodic progress bus.
#[instrument(skip_all)]
pub fn spawn_progress_bus(stats: StatsRegistry, hub: EventHub) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PROGRESS_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut book: HashMap<String, BusState> = HashMap::new();

        loop {
            tick.tick().await;
            let now = Instant::now();
            let mut batch = Vec::new();
            let mut done = Vec::new();

            for entry in stats.iter() {
                let s = entry.value();
                let state = book.entry(s.id().to_string()).or_insert_with(|| BusState {
                    ewma_bps: 0.0,
                    window_start: now,
                    window_start_bytes: s.bytes(),
                    last_emitted_bytes: -1,
                    last_emitted_status: None,
                    last_emitted_detail: None,
                });

                let bytes = s.bytes();
                let window = now.saturating_duration_since(state.window_start);
                if window >= EWMA_WINDOW {
                    let inst =
                        ((bytes - state.window_start_bytes).max(0) as f64) / window.as_secs_f64();
                    state.ewma_bps = EWMA_ALPHA * inst + (1.0 - EWMA_ALPHA) * state.ewma_bps;
                    state.window_start = now;
                    state.window_start_bytes = bytes;
                }

                let status = s.status();
                let detail = s
                    .backoff_remaining(now)
                    .map(|left| format!("Retrying in {}s", left.as_secs_f64().ceil() as u64));
                let finished = s.is_finished();

                let changed = bytes != state.last_emitted_bytes
                    || Some(status) != state.last_emitted_status
                    || detail != state.last_emitted_detail
                    || finished;
                if !changed {
                    continue;
                }

                let total = s.total();
                let eta = match (total, state.ewma_bps) {
                    (Some(t), speed) if speed > 0.0 && t > bytes => {
                        Some(((t - bytes) as f64) / speed)
                    }
                    _ => None,
                };
                let (error_code, error_message) = s.error();

                batch.push(ProgressUpdate {
                    id: s.id().to_string(),
                    status,
                    bytes_downloaded: bytes,
                    content_length: total,
                    speed_bps: state.ewma_bps,
                    eta_seconds: eta,
                    status_detail: detail.clone(),
                    error_code,
                    error_message,
                    updated_at: now_rfc3339(),
                });

                state.last_emitted_bytes = bytes;
                state.last_emitted_status = Some(status);
                state.last_emitted_detail = detail;

                if finished {
                    done.push(s.id().to_string());
                }
            }

            // A finished download gets exactly one final row, then the bus
            // stops referencing its ID.
            for id in done {
                stats.remove(&id);
                book.remove(&id);
            }
            book.retain(|id, _| stats.contains_key(id));

            if !batch.is_empty() {
                hub.emit_progress_batch(batch);
            }
        }
    })
}
