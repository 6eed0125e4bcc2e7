//! Engine and scheduler: per-download state machine, FIFO admission under a
//! global concurrency cap, stall watchdog with fixed backoff, and mirror
//! fallback on retryable errors.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::download::fetcher::{AttemptContext, FetchOutcome, FetchSignal, Fetcher};
use crate::download::{BandwidthLimiter, ErrorCode, FetchError, Transport};
use crate::events::{spawn_progress_bus, EventHub, RuntimeStats, StatsRegistry};
use crate::model::{DownloadStatus, NewBatchRequest, SettingsSnapshot};
use crate::rules;
use crate::store::{Store, StoreError};
use backoff::{stall_backoff, MAX_CONSECUTIVE_STALLS};

/// Default number of simultaneously active downloads.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// A DOWNLOADING transfer whose counter does not advance for this long is
/// stalled.
const STALL_WINDOW: Duration = Duration::from_secs(15);

/// How often the watchdog samples the byte counter.
const STALL_POLL: Duration = Duration::from_secs(1);

/// Cancelled attempts get this long to drain before being dropped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No download with that ID.
    #[error("download not found: {0}")]
    NotFound(String),

    /// The operation does not apply to the download's current status.
    #[error("cannot {op} a download in status {status}")]
    InvalidState {
        op: &'static str,
        status: DownloadStatus,
    },

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of an attempt as seen by the driver, after watchdog arbitration.
enum AttemptEnd {
    Finished(Result<FetchOutcome, FetchError>),
    Stalled,
    UserSignal(FetchSignal),
}

struct JobHandle {
    control: watch::Sender<FetchSignal>,
}

struct EngineInner {
    store: Store,
    fetcher: Fetcher,
    hub: EventHub,
    limiter: BandwidthLimiter,
    stats: StatsRegistry,
    jobs: DashMap<String, JobHandle>,
    admit: Notify,
    concurrency: usize,
}

/// The download engine. Clones share one scheduler.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Assembles the engine over its collaborators.
    #[must_use]
    pub fn new(
        store: Store,
        transport: Transport,
        limiter: BandwidthLimiter,
        hub: EventHub,
        concurrency: usize,
    ) -> Self {
        let fetcher = Fetcher::new(store.clone(), transport, limiter.clone(), hub.clone());
        Self {
            inner: Arc::new(EngineInner {
                store,
                fetcher,
                hub,
                limiter,
                stats: Arc::new(DashMap::new()),
                jobs: DashMap::new(),
                admit: Notify::new(),
                concurrency: concurrency.max(1),
            }),
        }
    }

    /// Spawns the admission loop and the progress bus, then kicks admission
    /// once so recovered QUEUED rows start immediately.
    pub fn start(&self) {
        spawn_progress_bus(Arc::clone(&self.inner.stats), self.inner.hub.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                inner.admit.notified().await;
                if let Err(e) = admit_queued(&inner).await {
                    error!(error = %e, "admission pass failed");
                }
            }
        });
        self.inner.admit.notify_one();
    }

    /// Enqueues one download per URL and returns the created IDs.
    ///
    /// URLs that do not parse as http/https still get a record, immediately
    /// in ERROR with `INVALID_URL`, so the caller sees them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if persistence fails.
    #[instrument(skip(self, urls), fields(count = urls.len()))]
    pub async fn add_downloads(
        &self,
        urls: Vec<String>,
        dest_dir: Option<String>,
        batch_id: Option<String>,
        through_proxy: bool,
    ) -> Result<Vec<String>, EngineError> {
        let settings = self.inner.store.settings_snapshot().await?;
        let dest_dir = dest_dir
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| settings.default_download_dir.clone());
        let forced_proxy = if through_proxy {
            settings.global_proxy_url.clone()
        } else {
            None
        };

        let mut ids = Vec::with_capacity(urls.len());
        for url in urls {
            let id = self
                .inner
                .store
                .insert_download(&url, &dest_dir, forced_proxy.as_deref(), batch_id.as_deref())
                .await?;
            if !is_fetchable_url(&url) {
                self.inner
                    .store
                    .update_status(
                        &id,
                        DownloadStatus::Error,
                        Some(ErrorCode::InvalidUrl),
                        Some("URL is not a valid http/https URL"),
                    )
                    .await?;
            }
            ids.push(id);
        }

        self.inner.hub.emit_downloads_changed();
        self.inner.admit.notify_one();
        Ok(ids)
    }

    /// Creates a batch and enqueues its URLs; returns the batch ID and the
    /// download IDs.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if persistence fails.
    #[instrument(skip(self, req))]
    pub async fn add_batch(
        &self,
        req: &NewBatchRequest,
    ) -> Result<(String, Vec<String>), EngineError> {
        let through_proxy = req.download_through_proxy.unwrap_or(false);
        let batch_id = self
            .inner
            .store
            .insert_batch(
                req.name.as_deref(),
                &req.dest_dir,
                req.raw_url_list.as_deref(),
                through_proxy,
            )
            .await?;
        let ids = self
            .add_downloads(
                req.effective_urls(),
                Some(req.dest_dir.clone()),
                Some(batch_id.clone()),
                through_proxy,
            )
            .await?;
        Ok((batch_id, ids))
    }

    /// Pauses a download. Pausing a paused download is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown IDs or
    /// [`EngineError::InvalidState`] when the download already finished.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: &str) -> Result<(), EngineError> {
        let rec = self.require(id).await?;
        match rec.status() {
            DownloadStatus::Downloading => {
                if let Some(job) = self.inner.jobs.get(id) {
                    let _ = job.control.send(FetchSignal::Pause);
                } else {
                    self.inner
                        .store
                        .update_status(id, DownloadStatus::Paused, None, None)
                        .await?;
                    self.inner.hub.emit_downloads_changed();
                }
                Ok(())
            }
            DownloadStatus::Queued => {
                self.inner
                    .store
                    .update_status(id, DownloadStatus::Paused, None, None)
                    .await?;
                self.inner.hub.emit_downloads_changed();
                Ok(())
            }
            DownloadStatus::Paused => Ok(()),
            status => Err(EngineError::InvalidState {
                op: "pause",
                status,
            }),
        }
    }

    /// Resumes a paused download back into the queue.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] or [`EngineError::InvalidState`].
    #[instrument(skip(self))]
    pub async fn resume(&self, id: &str) -> Result<(), EngineError> {
        let rec = self.require(id).await?;
        match rec.status() {
            DownloadStatus::Paused => {
                self.inner
                    .store
                    .update_status(id, DownloadStatus::Queued, None, None)
                    .await?;
                self.inner.hub.emit_downloads_changed();
                self.inner.admit.notify_one();
                Ok(())
            }
            DownloadStatus::Queued | DownloadStatus::Downloading => Ok(()),
            status => Err(EngineError::InvalidState {
                op: "resume",
                status,
            }),
        }
    }

    /// Explicit retry from ERROR: wipes segments and the byte counter, then
    /// requeues from zero.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] or [`EngineError::InvalidState`].
    #[instrument(skip(self))]
    pub async fn retry(&self, id: &str) -> Result<(), EngineError> {
        let rec = self.require(id).await?;
        match rec.status() {
            DownloadStatus::Error => {
                if let Some(temp) = rec.temp_path.as_deref() {
                    let _ = std::fs::remove_file(temp);
                }
                self.inner.store.reset_for_retry(id).await?;
                self.inner.hub.emit_downloads_changed();
                self.inner.admit.notify_one();
                Ok(())
            }
            // Already requeued by an earlier retry.
            DownloadStatus::Queued => Ok(()),
            status => Err(EngineError::InvalidState { op: "retry", status }),
        }
    }

    /// Cancels any in-flight work, deletes the rows, and best-effort unlinks
    /// the temp file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] or [`EngineError::Store`].
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let rec = self.require(id).await?;
        if let Some(job) = self.inner.jobs.get(id) {
            let _ = job.control.send(FetchSignal::Cancel);
        }
        // Stop the progress stream from referencing the ID before the
        // structural event goes out.
        self.inner.stats.remove(id);
        self.inner.store.delete_download(id).await?;
        if let Some(temp) = rec.temp_path.as_deref() {
            let _ = std::fs::remove_file(temp);
        }
        self.inner.hub.emit_downloads_changed();
        self.inner.admit.notify_one();
        Ok(())
    }

    /// Inserts (or re-enables) a proxy rule for the download's host, then
    /// issues a retry. Repeating the operation never yields a second rule
    /// for the same host.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`], [`EngineError::InvalidState`] (from
    /// the retry), or [`EngineError::Store`].
    #[instrument(skip(self))]
    pub async fn add_host_to_proxy_and_retry(&self, id: &str) -> Result<(), EngineError> {
        let rec = self.require(id).await?;
        let host = Url::parse(&rec.original_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase));
        let Some(host) = host else {
            return Err(EngineError::InvalidState {
                op: "add_host_to_proxy_and_retry",
                status: rec.status(),
            });
        };

        let existing = self.inner.store.find_proxy_rule_by_pattern(&host).await?;
        match existing {
            Some(rule) => {
                self.inner
                    .store
                    .upsert_proxy_rule(
                        Some(rule.id),
                        &host,
                        true,
                        true,
                        rule.proxy_url_override.as_deref(),
                    )
                    .await?;
            }
            None => {
                self.inner
                    .store
                    .upsert_proxy_rule(None, &host, true, true, None)
                    .await?;
            }
        }
        self.retry(id).await
    }

    /// Pauses every queued or active download.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if persistence fails.
    #[instrument(skip(self))]
    pub async fn pause_all(&self) -> Result<(), EngineError> {
        for job in self.inner.jobs.iter() {
            let _ = job.control.send(FetchSignal::Pause);
        }
        for rec in self.inner.store.list_downloads().await? {
            if rec.status() == DownloadStatus::Queued {
                self.inner
                    .store
                    .update_status(&rec.id, DownloadStatus::Paused, None, None)
                    .await?;
            }
        }
        self.inner.hub.emit_downloads_changed();
        Ok(())
    }

    /// Requeues every paused download.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if persistence fails.
    #[instrument(skip(self))]
    pub async fn resume_all(&self) -> Result<(), EngineError> {
        for rec in self.inner.store.list_downloads().await? {
            if rec.status() == DownloadStatus::Paused {
                self.inner
                    .store
                    .update_status(&rec.id, DownloadStatus::Queued, None, None)
                    .await?;
            }
        }
        self.inner.hub.emit_downloads_changed();
        self.inner.admit.notify_one();
        Ok(())
    }

    /// Deletes all COMPLETED rows.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the sweep fails.
    #[instrument(skip(self))]
    pub async fn clear_completed(&self) -> Result<u64, EngineError> {
        let removed = self.inner.store.clear_completed().await?;
        if removed > 0 {
            self.inner.hub.emit_downloads_changed();
        }
        Ok(removed)
    }

    /// Persists new settings and applies the bandwidth limit to the shared
    /// limiter. The limit takes effect on the next token acquisition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if persistence fails.
    #[instrument(skip(self, snapshot))]
    pub async fn update_settings(&self, snapshot: &SettingsSnapshot) -> Result<(), EngineError> {
        self.inner.store.set_settings_snapshot(snapshot).await?;
        self.inner.limiter.set_limit(snapshot.bandwidth_limit_bps);
        Ok(())
    }

    async fn require(&self, id: &str) -> Result<crate::model::DownloadRecord, EngineError> {
        self.inner
            .store
            .get_download(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }
}

fn is_fetchable_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// One admission pass: fill free slots with the oldest QUEUED downloads.
async fn admit_queued(inner: &Arc<EngineInner>) -> Result<(), EngineError> {
    loop {
        if inner.jobs.len() >= inner.concurrency {
            return Ok(());
        }
        let active: Vec<String> = inner.jobs.iter().map(|e| e.key().clone()).collect();
        let Some(rec) = inner.store.next_queued(&active).await? else {
            return Ok(());
        };
        spawn_driver(inner, rec.id, rec.bytes_downloaded);
    }
}

fn spawn_driver(inner: &Arc<EngineInner>, id: String, initial_bytes: i64) {
    let (control_tx, control_rx) = watch::channel(FetchSignal::Run);
    inner.jobs.insert(id.clone(), JobHandle { control: control_tx });

    let stats = RuntimeStats::new(id.clone(), initial_bytes);
    inner.stats.insert(id.clone(), stats.clone());

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if let Err(e) = run_driver(&inner, &id, control_rx, stats.clone()).await {
            error!(download_id = %id, error = %e, "driver failed");
            let (code, message) = (ErrorCode::Unknown, e.to_string());
            let _ = inner
                .store
                .update_status(&id, DownloadStatus::Error, Some(code), Some(&message))
                .await;
            stats.set_status(DownloadStatus::Error);
            stats.set_error(code, message);
        }
        stats.mark_finished();
        inner.jobs.remove(&id);
        inner.hub.emit_downloads_changed();
        inner.admit.notify_one();
    });
}

/// Drives one download: attempt loop with stall watchdog, backoff, and
/// mirror fallback.
#[instrument(skip_all, fields(download_id = %id))]
async fn run_driver(
    inner: &Arc<EngineInner>,
    id: &str,
    mut control_rx: watch::Receiver<FetchSignal>,
    stats: RuntimeStats,
) -> Result<(), EngineError> {
    let Some(rec) = inner.store.get_download(id).await? else {
        return Ok(());
    };

    let Ok(original) = Url::parse(&rec.original_url) else {
        inner
            .store
            .update_status(
                id,
                DownloadStatus::Error,
                Some(ErrorCode::InvalidUrl),
                Some("URL is not a valid http/https URL"),
            )
            .await?;
        stats.set_status(DownloadStatus::Error);
        stats.set_error(ErrorCode::InvalidUrl, "URL is not a valid http/https URL");
        return Ok(());
    };

    stats.set_status(DownloadStatus::Downloading);
    inner
        .store
        .update_status(id, DownloadStatus::Downloading, None, None)
        .await?;
    inner.hub.emit_downloads_changed();

    // Copy-on-read snapshots, held for the whole fetch.
    let settings = inner.store.settings_snapshot().await?;
    let rules_snapshot = inner.store.rules_snapshot().await?;

    // The original URL first, then each mirror candidate in rule order.
    let mut candidates: Vec<(Url, Option<String>)> = vec![(original.clone(), None)];
    for mirror in rules::mirror_candidates(&rules_snapshot, &original) {
        let origin = mirror.origin().ascii_serialization();
        candidates.push((mirror, Some(origin)));
    }

    let mut candidate_idx = 0;
    let mut consecutive_stalls: u32 = 0;
    let mut unknown_retry_used = false;

    loop {
        let (url, mirror_used) = candidates[candidate_idx].clone();
        let proxy_url = rules::resolve_proxy(
            rec.forced_proxy_url.as_deref(),
            &settings,
            &rules_snapshot,
            &url,
        );

        let (attempt_tx, attempt_rx) = watch::channel(FetchSignal::Run);
        let ctx = AttemptContext {
            download_id: id.to_string(),
            url: url.clone(),
            rules: rules_snapshot.clone(),
            proxy_url,
            mirror_used,
            control: attempt_rx,
            stats: stats.clone(),
        };

        let end = watch_attempt(&stats, &mut control_rx, &attempt_tx, {
            let fetcher = inner.fetcher.clone();
            async move { fetcher.run_attempt(ctx).await }
        })
        .await;

        match end {
            AttemptEnd::Finished(Ok(FetchOutcome::Completed)) => {
                inner
                    .store
                    .update_status(id, DownloadStatus::Completed, None, None)
                    .await?;
                stats.set_status(DownloadStatus::Completed);
                info!("download completed");
                return Ok(());
            }
            AttemptEnd::Finished(Ok(FetchOutcome::Interrupted))
            | AttemptEnd::UserSignal(FetchSignal::Pause) => {
                // Either the fetcher saw the pause itself or the watchdog
                // relayed it; durable bytes are already checkpointed.
                if *control_rx.borrow() == FetchSignal::Cancel {
                    return Ok(());
                }
                // The record may have been deleted out from under the attempt.
                match inner
                    .store
                    .update_status(id, DownloadStatus::Paused, None, None)
                    .await
                {
                    Err(StoreError::DownloadNotFound(_)) => {}
                    other => other?,
                }
                stats.set_status(DownloadStatus::Paused);
                return Ok(());
            }
            AttemptEnd::UserSignal(_) => {
                // Cancel: the delete flow owns cleanup.
                return Ok(());
            }
            AttemptEnd::Stalled => {
                consecutive_stalls += 1;
                if consecutive_stalls >= MAX_CONSECUTIVE_STALLS {
                    let message = format!("no data received for {STALL_WINDOW:?}, gave up after {consecutive_stalls} stalls");
                    inner
                        .store
                        .update_status(
                            id,
                            DownloadStatus::Error,
                            Some(ErrorCode::Timeout),
                            Some(&message),
                        )
                        .await?;
                    stats.set_status(DownloadStatus::Error);
                    stats.set_error(ErrorCode::Timeout, message);
                    return Ok(());
                }
                let delay = stall_backoff(consecutive_stalls);
                warn!(stalls = consecutive_stalls, delay_secs = delay.as_secs(), "stalled; backing off");
                stats.set_backoff_until(Some(Instant::now() + delay));
                // A user signal cuts the wait short; the check below acts on it.
                let _ = wait_backoff(&mut control_rx, delay).await;
                stats.set_backoff_until(None);
            }
            AttemptEnd::Finished(Err(e)) => {
                let code = e.code();
                warn!(error = %e, code = %code, "attempt failed");

                if code.is_mirror_retryable() && candidate_idx + 1 < candidates.len() {
                    candidate_idx += 1;
                    debug!(next = %candidates[candidate_idx].0, "trying mirror");
                    continue;
                }
                if code == ErrorCode::Unknown && !unknown_retry_used {
                    unknown_retry_used = true;
                    debug!("retrying once after uncategorized error");
                    continue;
                }

                let message = e.to_string();
                inner
                    .store
                    .update_status(id, DownloadStatus::Error, Some(code), Some(&message))
                    .await?;
                stats.set_status(DownloadStatus::Error);
                stats.set_error(code, message);
                return Ok(());
            }
        }

        // Re-check user control between attempts.
        let signal = *control_rx.borrow();
        match signal {
            FetchSignal::Pause => {
                inner
                    .store
                    .update_status(id, DownloadStatus::Paused, None, None)
                    .await?;
                stats.set_status(DownloadStatus::Paused);
                return Ok(());
            }
            FetchSignal::Cancel => return Ok(()),
            FetchSignal::Run => {}
        }
    }
}

/// Supervises one attempt: completes it, detects stalls, or relays a user
/// signal. In both interruption cases the attempt is cancelled cooperatively
/// and given a bounded drain before being dropped.
async fn watch_attempt<F>(
    stats: &RuntimeStats,
    control_rx: &mut watch::Receiver<FetchSignal>,
    attempt_tx: &watch::Sender<FetchSignal>,
    attempt: F,
) -> AttemptEnd
where
    F: std::future::Future<Output = Result<FetchOutcome, FetchError>>,
{
    let mut attempt = std::pin::pin!(attempt);
    let mut last_bytes = stats.bytes();
    let mut last_change = Instant::now();

    loop {
        tokio::select! {
            result = &mut attempt => return AttemptEnd::Finished(result),
            _ = tokio::time::sleep(STALL_POLL) => {
                let bytes = stats.bytes();
                if bytes != last_bytes {
                    last_bytes = bytes;
                    last_change = Instant::now();
                } else if last_change.elapsed() >= STALL_WINDOW
                    && stats.status() == DownloadStatus::Downloading
                {
                    let _ = attempt_tx.send(FetchSignal::Cancel);
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut attempt).await;
                    return AttemptEnd::Stalled;
                }
            }
            changed = control_rx.changed() => {
                if changed.is_err() {
                    // Engine dropped; treat as cancel.
                    let _ = attempt_tx.send(FetchSignal::Cancel);
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut attempt).await;
                    return AttemptEnd::UserSignal(FetchSignal::Cancel);
                }
                let signal = *control_rx.borrow();
                if signal != FetchSignal::Run {
                    let _ = attempt_tx.send(signal);
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut attempt).await;
                    return AttemptEnd::UserSignal(signal);
                }
            }
        }
    }
}

/// Sleeps out a backoff, returning early (true) when a user signal arrives.
async fn wait_backoff(control_rx: &mut watch::Receiver<FetchSignal>, delay: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        _ = control_rx.changed() => true,
    }
}
