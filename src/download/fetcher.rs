//! Segmented fetcher: probe, plan, parallel ranged GETs, merge.
//!
//! One call to [`Fetcher::run_attempt`] drives a single attempt against a
//! single URL: probe the server, validate resume state, plan or reuse
//! segments, stream bytes into a sparse temp file under the bandwidth
//! budget, then rename into place. The engine above decides retries,
//! mirrors, and stall handling.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::FetchError;
use super::filename::{choose_unique_filename, resolve_filename, TEMP_SUFFIX};
use super::limiter::BandwidthLimiter;
use super::transport::Transport;
use crate::events::{EventHub, RuntimeStats};
use crate::model::{DownloadRecord, RulesSnapshot, SegmentRecord};
use crate::rules;
use crate::store::Store;

/// Below this size a transfer is not worth splitting.
pub const SEGMENT_THRESHOLD: i64 = 2 * 1024 * 1024;

/// Nominal bytes per segment when splitting.
pub const SEGMENT_SIZE: i64 = 4 * 1024 * 1024;

/// Upper bound on parallel segments per download.
pub const MAX_SEGMENTS: i64 = 8;

/// Byte counters are persisted at most this often, and on interruption.
const CHECKPOINT_INTERVAL: Duration = Duration::from_millis(500);

/// Cooperative control signal observed between buffer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSignal {
    Run,
    Pause,
    Cancel,
}

/// How an attempt ended short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// File is fully on disk under its final name.
    Completed,
    /// Pause/cancel was observed; durable bytes are checkpointed.
    Interrupted,
}

/// Everything one attempt needs, captured before it starts.
pub struct AttemptContext {
    pub download_id: String,
    pub url: Url,
    pub rules: RulesSnapshot,
    pub proxy_url: Option<String>,
    /// Mirror base in use for this attempt, if any.
    pub mirror_used: Option<String>,
    pub control: watch::Receiver<FetchSignal>,
    pub stats: RuntimeStats,
}

/// What the probe learned about the resource.
#[derive(Debug, Clone)]
struct Probe {
    supports_ranges: Option<bool>,
    content_length: Option<i64>,
    etag: Option<String>,
    last_modified: Option<String>,
    content_disposition: Option<String>,
    content_type: Option<String>,
    final_url: Url,
}

enum SegmentEnd {
    Done,
    Interrupted,
}

/// Positional writer for one segment of the shared sparse temp file.
///
/// Each segment task owns one handle and writes at absolute offsets, so no
/// task ever seeks and concurrent tasks cannot interleave through a shared
/// cursor. The writer tracks its own offset and refuses to run past the
/// segment's end, which keeps a misbehaving 206 response from bleeding into
/// a sibling's range.
struct SegmentWriter {
    file: File,
    offset: u64,
    end_exclusive: Option<u64>,
}

impl SegmentWriter {
    /// Opens the temp file positioned (logically) at `start`.
    fn open(temp_path: &Path, start: u64, end_exclusive: Option<i64>) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(temp_path)?;
        Ok(Self {
            file,
            offset: start,
            end_exclusive: end_exclusive.map(|end| end.max(0) as u64),
        })
    }

    /// Whether writing `len` more bytes would cross the segment boundary.
    fn exceeds_range(&self, len: usize) -> bool {
        self.end_exclusive
            .is_some_and(|end| self.offset + len as u64 > end)
    }

    /// Commits one network buffer at the current offset, advancing it.
    /// Short positional writes are retried until the buffer is durable.
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut buf = chunk;
        while !buf.is_empty() {
            let written = self.write_once(buf)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "temp file refused further bytes",
                ));
            }
            self.offset += written as u64;
            buf = &buf[written..];
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_once(&self, buf: &[u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.write_at(buf, self.offset)
    }

    #[cfg(windows)]
    fn write_once(&self, buf: &[u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_write(buf, self.offset)
    }
}

/// Shared state a segment task streams against.
#[derive(Clone)]
struct SegmentShared {
    download_id: String,
    url: Url,
    client: Client,
    headers: HeaderMap,
    temp_path: PathBuf,
    control: watch::Receiver<FetchSignal>,
    stats: RuntimeStats,
    abort: Arc<AtomicBool>,
}

/// Drives single fetch attempts. Cheap to clone; shares the store, the
/// transport cache, and the global limiter.
#[derive(Clone)]
pub struct Fetcher {
    store: Store,
    transport: Transport,
    limiter: BandwidthLimiter,
    hub: EventHub,
}

impl Fetcher {
    #[must_use]
    pub fn new(
        store: Store,
        transport: Transport,
        limiter: BandwidthLimiter,
        hub: EventHub,
    ) -> Self {
        Self {
            store,
            transport,
            limiter,
            hub,
        }
    }

    /// Runs one attempt to completion, interruption, or error.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] classified into the stable taxonomy; the
    /// engine decides whether it is retryable.
    #[instrument(skip_all, fields(id = %ctx.download_id, url = %ctx.url))]
    pub async fn run_attempt(&self, ctx: AttemptContext) -> Result<FetchOutcome, FetchError> {
        let Some(mut rec) = self.store.get_download(&ctx.download_id).await? else {
            // Deleted while queued; nothing to do.
            return Ok(FetchOutcome::Interrupted);
        };

        let client = self.transport.client_for(ctx.proxy_url.as_deref())?;
        let headers = build_header_map(&rules::merged_headers(&ctx.rules, &ctx.url));

        self.store
            .record_attempt_url(&ctx.download_id, ctx.url.as_str(), ctx.mirror_used.as_deref())
            .await?;

        let probe = probe_resource(&client, &ctx.url, &headers).await?;
        debug!(
            supports_ranges = ?probe.supports_ranges,
            content_length = ?probe.content_length,
            "probe complete"
        );

        // Validator-gated resume: existing segments may only be reused when
        // the remote entity is provably unchanged.
        let mut segments = self.store.list_segments(&ctx.download_id).await?;
        if !segments.is_empty() {
            if let Some(detail) = validator_mismatch(&rec, &probe) {
                return Err(FetchError::RemoteChanged { detail });
            }
        }

        ctx.stats.set_total(probe.content_length);

        let dest_dir = PathBuf::from(&rec.dest_dir);
        std::fs::create_dir_all(&dest_dir).map_err(|e| FetchError::io(&dest_dir, e))?;

        // Choose names once, on the first successful probe; the temp file
        // reserves the final name against collisions.
        let name_just_resolved = rec.final_filename.is_none() || rec.temp_path.is_none();
        if name_just_resolved {
            let desired = resolve_filename(
                &probe.final_url,
                probe.content_disposition.as_deref(),
                probe.content_type.as_deref(),
            );
            let chosen = choose_unique_filename(&dest_dir, &desired);
            let temp_path = dest_dir.join(format!("{chosen}{TEMP_SUFFIX}"));
            rec.final_filename = Some(chosen);
            rec.temp_path = Some(temp_path.display().to_string());
        }
        #[allow(clippy::unwrap_used)]
        let temp_path = PathBuf::from(rec.temp_path.as_deref().unwrap());
        #[allow(clippy::unwrap_used)]
        let final_name = rec.final_filename.clone().unwrap();

        self.store
            .record_probe(
                &ctx.download_id,
                probe.final_url.as_str(),
                &temp_path.display().to_string(),
                &final_name,
                probe.content_length,
                probe.etag.as_deref(),
                probe.last_modified.as_deref(),
                probe.supports_ranges,
                ctx.mirror_used.as_deref(),
            )
            .await?;
        if name_just_resolved {
            // Lets clients swap their placeholder for the real name now.
            self.hub.emit_downloads_changed();
        }

        prepare_temp_file(&temp_path, probe.content_length)?;

        let ranges_usable = probe.supports_ranges.unwrap_or(false);
        if segments.is_empty() {
            segments = plan_segments(&ctx.download_id, probe.content_length, ranges_usable);
            self.store
                .replace_segments(&ctx.download_id, &segments)
                .await?;
            ctx.stats.set_bytes(0);
            self.store.update_bytes(&ctx.download_id, 0).await?;
        } else {
            let durable: i64 = segments
                .iter()
                .map(|s| match s.range_end_exclusive {
                    Some(end) => s.bytes_written.min(end - s.range_start),
                    None => s.bytes_written,
                })
                .sum();
            ctx.stats.set_bytes(durable);
        }

        let shared = SegmentShared {
            download_id: ctx.download_id.clone(),
            url: ctx.url.clone(),
            client,
            headers,
            temp_path: temp_path.clone(),
            control: ctx.control.clone(),
            stats: ctx.stats.clone(),
            abort: Arc::new(AtomicBool::new(false)),
        };

        let outcome = if segments.len() == 1 {
            self.run_single(&shared, &segments[0], ranges_usable, probe.content_length)
                .await?
        } else {
            match self.run_segmented(&shared, &segments).await {
                Ok(outcome) => outcome,
                Err(FetchError::RangeUnsupported { .. }) => {
                    // The server advertised ranges then rejected them: throw
                    // the plan away and start over on one stream.
                    info!("downgrading to single stream after range rejection");
                    let single = self
                        .restart_single_stream(&shared, probe.content_length)
                        .await?;
                    shared.abort.store(false, Ordering::Release);
                    self.run_single(&shared, &single, false, probe.content_length)
                        .await?
                }
                Err(e) => return Err(e),
            }
        };

        if outcome == FetchOutcome::Interrupted {
            self.checkpoint_total(&shared).await?;
            return Ok(FetchOutcome::Interrupted);
        }

        self.finish(&shared, &rec.dest_dir, &final_name, probe.content_length)
            .await?;
        Ok(FetchOutcome::Completed)
    }

    /// Runs the single-stream path. A resume Range answered with 200 (and a
    /// fresh ranged GET answered the same way) restarts from offset zero.
    async fn run_single(
        &self,
        shared: &SegmentShared,
        segment: &SegmentRecord,
        ranges_usable: bool,
        content_length: Option<i64>,
    ) -> Result<FetchOutcome, FetchError> {
        let mut segment = segment.clone();

        // Partial bytes without range support cannot be resumed.
        if segment.bytes_written > 0 && !ranges_usable {
            segment = self.restart_single_stream(shared, content_length).await?;
        }

        let send_range = ranges_usable && segment.bytes_written > 0;
        match self.stream_segment(shared, &segment, send_range).await {
            Ok(SegmentEnd::Done) => Ok(FetchOutcome::Completed),
            Ok(SegmentEnd::Interrupted) => Ok(FetchOutcome::Interrupted),
            Err(FetchError::RangeUnsupported { .. }) if send_range => {
                info!("resume rejected with 200; restarting from offset 0");
                let fresh = self.restart_single_stream(shared, content_length).await?;
                match self.stream_segment(shared, &fresh, false).await? {
                    SegmentEnd::Done => Ok(FetchOutcome::Completed),
                    SegmentEnd::Interrupted => Ok(FetchOutcome::Interrupted),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Fans segment tasks out and aggregates their results. The first error
    /// aborts the siblings cooperatively.
    async fn run_segmented(
        &self,
        shared: &SegmentShared,
        segments: &[SegmentRecord],
    ) -> Result<FetchOutcome, FetchError> {
        let mut tasks: JoinSet<Result<SegmentEnd, FetchError>> = JoinSet::new();
        for segment in segments {
            if segment.done {
                continue;
            }
            let fetcher = self.clone();
            let shared = shared.clone();
            let segment = segment.clone();
            tasks.spawn(async move { fetcher.stream_segment(&shared, &segment, true).await });
        }

        let mut interrupted = false;
        let mut first_error: Option<FetchError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(SegmentEnd::Done)) => {}
                Ok(Ok(SegmentEnd::Interrupted)) => interrupted = true,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        shared.abort.store(true, Ordering::Release);
                        first_error = Some(e);
                    } else {
                        debug!(error = %e, "additional segment error");
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "segment task panicked");
                    if first_error.is_none() {
                        shared.abort.store(true, Ordering::Release);
                        first_error = Some(FetchError::Cancelled);
                    }
                }
            }
        }

        self.checkpoint_total(shared).await?;
        if let Some(e) = first_error {
            return Err(e);
        }
        if interrupted {
            return Ok(FetchOutcome::Interrupted);
        }
        Ok(FetchOutcome::Completed)
    }

    /// Streams one segment (or the whole body) into the temp file at its
    /// write offset. Checks the cooperative flags between buffer writes and
    /// checkpoints at most every 500 ms.
    async fn stream_segment(
        &self,
        shared: &SegmentShared,
        segment: &SegmentRecord,
        send_range: bool,
    ) -> Result<SegmentEnd, FetchError> {
        let start = segment.range_start + segment.bytes_written;
        if let Some(end) = segment.range_end_exclusive {
            if start >= end {
                self.store
                    .update_segment(&shared.download_id, segment.ordinal, segment.bytes_written, true)
                    .await?;
                return Ok(SegmentEnd::Done);
            }
        }

        let mut request = shared
            .client
            .get(shared.url.clone())
            .headers(shared.headers.clone());
        if send_range {
            request = request.header(RANGE, range_header(start, segment.range_end_exclusive));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::network(shared.url.as_str(), e))?;
        let status = response.status();

        if send_range && status == StatusCode::OK {
            return Err(FetchError::RangeUnsupported {
                url: shared.url.to_string(),
            });
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::http(shared.url.as_str(), status.as_u16()));
        }

        let mut writer = SegmentWriter::open(
            &shared.temp_path,
            start as u64,
            segment.range_end_exclusive,
        )
        .map_err(|e| FetchError::io(&shared.temp_path, e))?;

        let mut written = segment.bytes_written;
        let mut last_checkpoint = Instant::now();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::network(shared.url.as_str(), e))?;

            if *shared.control.borrow() != FetchSignal::Run
                || shared.abort.load(Ordering::Acquire)
            {
                self.store
                    .update_segment(&shared.download_id, segment.ordinal, written, false)
                    .await?;
                return Ok(SegmentEnd::Interrupted);
            }

            // A 206 body longer than the requested range would overwrite a
            // sibling segment; treat the server as range-broken.
            if writer.exceeds_range(chunk.len()) {
                self.store
                    .update_segment(&shared.download_id, segment.ordinal, written, false)
                    .await?;
                return Err(FetchError::RangeUnsupported {
                    url: shared.url.to_string(),
                });
            }

            self.limiter.acquire(chunk.len()).await;
            writer
                .write_chunk(&chunk)
                .map_err(|e| FetchError::io(&shared.temp_path, e))?;
            written += chunk.len() as i64;
            shared.stats.add_bytes(chunk.len() as u64);

            if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                self.store
                    .update_segment(&shared.download_id, segment.ordinal, written, false)
                    .await?;
                self.checkpoint_total(shared).await?;
                last_checkpoint = Instant::now();
            }
        }

        if let Some(end) = segment.range_end_exclusive {
            let expected = end - segment.range_start;
            if written < expected {
                self.store
                    .update_segment(&shared.download_id, segment.ordinal, written, false)
                    .await?;
                return Err(FetchError::TruncatedBody {
                    url: shared.url.to_string(),
                    expected,
                    actual: written,
                });
            }
        }

        self.store
            .update_segment(&shared.download_id, segment.ordinal, written, true)
            .await?;
        Ok(SegmentEnd::Done)
    }

    /// Resets on-disk and persisted progress to a fresh single segment so a
    /// stream can start over from offset zero. Returns the fresh segment.
    async fn restart_single_stream(
        &self,
        shared: &SegmentShared,
        content_length: Option<i64>,
    ) -> Result<SegmentRecord, FetchError> {
        let single = plan_segments(&shared.download_id, content_length, false);
        self.store
            .replace_segments(&shared.download_id, &single)
            .await?;
        self.store.update_bytes(&shared.download_id, 0).await?;
        shared.stats.set_bytes(0);

        let file = OpenOptions::new()
            .write(true)
            .open(&shared.temp_path)
            .map_err(|e| FetchError::io(&shared.temp_path, e))?;
        file.set_len(content_length.unwrap_or(0).max(0) as u64)
            .map_err(|e| FetchError::io(&shared.temp_path, e))?;

        let mut fresh = single.into_iter();
        #[allow(clippy::unwrap_used)]
        let first = fresh.next().unwrap();
        Ok(first)
    }

    async fn checkpoint_total(&self, shared: &SegmentShared) -> Result<(), FetchError> {
        self.store
            .update_bytes(&shared.download_id, shared.stats.bytes())
            .await?;
        Ok(())
    }

    /// Truncates to the expected length and renames into place atomically
    /// (temp lives in the destination dir, so the rename never crosses a
    /// filesystem).
    async fn finish(
        &self,
        shared: &SegmentShared,
        dest_dir: &str,
        final_name: &str,
        content_length: Option<i64>,
    ) -> Result<(), FetchError> {
        if let Some(len) = content_length {
            let file = OpenOptions::new()
                .write(true)
                .open(&shared.temp_path)
                .map_err(|e| FetchError::io(&shared.temp_path, e))?;
            file.set_len(len as u64)
                .map_err(|e| FetchError::io(&shared.temp_path, e))?;
        }

        let final_path = Path::new(dest_dir).join(final_name);
        std::fs::rename(&shared.temp_path, &final_path)
            .map_err(|e| FetchError::io(&final_path, e))?;

        if let Some(len) = content_length {
            let meta =
                std::fs::metadata(&final_path).map_err(|e| FetchError::io(&final_path, e))?;
            if meta.len() as i64 != len {
                return Err(FetchError::TruncatedBody {
                    url: shared.url.to_string(),
                    expected: len,
                    actual: meta.len() as i64,
                });
            }
            shared.stats.set_bytes(len);
        }

        self.checkpoint_total(shared).await?;
        info!(path = %final_path.display(), "download complete");
        Ok(())
    }
}

/// HEAD probe with a ranged-GET fallback when the server refuses HEAD.
async fn probe_resource(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
) -> Result<Probe, FetchError> {
    let head = client
        .head(url.clone())
        .headers(headers.clone())
        .send()
        .await
        .map_err(|e| FetchError::network(url.as_str(), e))?;

    let status = head.status();
    if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
        return probe_with_ranged_get(client, url, headers).await;
    }
    if status.is_client_error() || status.is_server_error() {
        return Err(FetchError::http(url.as_str(), status.as_u16()));
    }

    let response_headers = head.headers();
    let supports_ranges = response_headers
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("bytes"));

    Ok(Probe {
        supports_ranges,
        content_length: header_i64(response_headers, "content-length"),
        etag: header_string(response_headers, "etag"),
        last_modified: header_string(response_headers, "last-modified"),
        content_disposition: header_string(response_headers, "content-disposition"),
        content_type: header_string(response_headers, "content-type"),
        final_url: head.url().clone(),
    })
}

/// Fallback probe: `GET bytes=0-0`. A 206 proves range support and carries
/// the total in Content-Range; a 200 reveals the full length only.
async fn probe_with_ranged_get(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
) -> Result<Probe, FetchError> {
    let response = client
        .get(url.clone())
        .headers(headers.clone())
        .header(RANGE, HeaderValue::from_static("bytes=0-0"))
        .send()
        .await
        .map_err(|e| FetchError::network(url.as_str(), e))?;

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        return Err(FetchError::http(url.as_str(), status.as_u16()));
    }

    let response_headers = response.headers().clone();
    let final_url = response.url().clone();
    let (supports_ranges, content_length) = if status == StatusCode::PARTIAL_CONTENT {
        let total = response_headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        (Some(true), total)
    } else {
        (Some(false), header_i64(&response_headers, "content-length"))
    };

    Ok(Probe {
        supports_ranges,
        content_length,
        etag: header_string(&response_headers, "etag"),
        last_modified: header_string(&response_headers, "last-modified"),
        content_disposition: header_string(&response_headers, "content-disposition"),
        content_type: header_string(&response_headers, "content-type"),
        final_url,
    })
}

/// Splits `[0, content_length)` into equal segments when worthwhile;
/// otherwise one segment covering everything.
#[must_use]
pub fn plan_segments(
    download_id: &str,
    content_length: Option<i64>,
    ranges_usable: bool,
) -> Vec<SegmentRecord> {
    let single = |end: Option<i64>| {
        vec![SegmentRecord {
            download_id: download_id.to_string(),
            ordinal: 0,
            range_start: 0,
            range_end_exclusive: end,
            bytes_written: 0,
            done: false,
        }]
    };

    let Some(len) = content_length.filter(|l| *l > 0) else {
        return single(None);
    };
    if !ranges_usable || len < SEGMENT_THRESHOLD {
        return single(Some(len));
    }

    let count = ((len + SEGMENT_SIZE - 1) / SEGMENT_SIZE).clamp(1, MAX_SEGMENTS);
    let base = len / count;

    (0..count)
        .map(|i| {
            let start = i * base;
            // The last segment absorbs the remainder.
            let end = if i == count - 1 { len } else { (i + 1) * base };
            SegmentRecord {
                download_id: download_id.to_string(),
                ordinal: i,
                range_start: start,
                range_end_exclusive: Some(end),
                bytes_written: 0,
                done: false,
            }
        })
        .collect()
}

fn validator_mismatch(rec: &DownloadRecord, probe: &Probe) -> Option<String> {
    if let (Some(prev), Some(cur)) = (rec.etag.as_deref(), probe.etag.as_deref()) {
        if prev != cur {
            return Some(format!("ETag changed ({prev} -> {cur})"));
        }
    }
    if let (Some(prev), Some(cur)) = (rec.last_modified.as_deref(), probe.last_modified.as_deref())
    {
        if prev != cur {
            return Some(format!("Last-Modified changed ({prev} -> {cur})"));
        }
    }
    None
}

fn prepare_temp_file(temp_path: &Path, content_length: Option<i64>) -> Result<(), FetchError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(temp_path)
        .map_err(|e| FetchError::io(temp_path, e))?;
    if let Some(len) = content_length.filter(|l| *l > 0) {
        file.set_len(len as u64)
            .map_err(|e| FetchError::io(temp_path, e))?;
    }
    Ok(())
}

fn build_header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        map.insert(name, value);
    }
    map
}

#[allow(clippy::expect_used)]
fn range_header(start: i64, end_exclusive: Option<i64>) -> HeaderValue {
    let value = match end_exclusive {
        Some(end) => format!("bytes={start}-{}", end - 1),
        None => format!("bytes={start}-"),
    };
    HeaderValue::from_str(&value).expect("range header is always visible ASCII")
}

/// Parses the total out of `bytes 0-0/12345`; `*` totals are unknown.
fn parse_content_range_total(value: &str) -> Option<i64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ---- segment planning ----

    #[test]
    fn test_plan_unknown_length_is_single_unbounded() {
        let plan = plan_segments("d", None, true);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].range_start, 0);
        assert_eq!(plan[0].range_end_exclusive, None);
    }

    #[test]
    fn test_plan_small_file_is_single_bounded() {
        let plan = plan_segments("d", Some(SEGMENT_THRESHOLD - 1), true);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].range_end_exclusive, Some(SEGMENT_THRESHOLD - 1));
    }

    #[test]
    fn test_plan_no_ranges_is_single_bounded() {
        let plan = plan_segments("d", Some(100 * 1024 * 1024), false);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_plan_ten_mib_gives_three_segments() {
        let len = 10 * 1024 * 1024;
        let plan = plan_segments("d", Some(len), true);
        assert_eq!(plan.len(), 3); // ceil(10 MiB / 4 MiB)
        assert_covers_exactly(&plan, len);
    }

    #[test]
    fn test_plan_caps_at_eight_segments() {
        let len = 100 * 1024 * 1024;
        let plan = plan_segments("d", Some(len), true);
        assert_eq!(plan.len(), MAX_SEGMENTS as usize);
        assert_covers_exactly(&plan, len);
    }

    #[test]
    fn test_plan_last_segment_absorbs_remainder() {
        let len = SEGMENT_SIZE * 2 + 12_345;
        let plan = plan_segments("d", Some(len), true);
        assert_covers_exactly(&plan, len);
        let last = plan.last().unwrap();
        assert_eq!(last.range_end_exclusive, Some(len));
    }

    /// The union of ranges must be exactly `[0, len)`: dense ordinals, no
    /// gaps, no overlaps.
    fn assert_covers_exactly(plan: &[SegmentRecord], len: i64) {
        let mut cursor = 0;
        for (i, seg) in plan.iter().enumerate() {
            assert_eq!(seg.ordinal, i as i64, "ordinals are dense");
            assert_eq!(seg.range_start, cursor, "no gap or overlap");
            cursor = seg.range_end_exclusive.unwrap();
        }
        assert_eq!(cursor, len);
    }

    // ---- header helpers ----

    #[test]
    fn test_range_header_forms() {
        assert_eq!(range_header(0, Some(100)), "bytes=0-99");
        assert_eq!(range_header(50, Some(100)), "bytes=50-99");
        assert_eq!(range_header(10, None), "bytes=10-");
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12_345));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_build_header_map_skips_invalid() {
        let pairs = vec![
            ("X-Ok".to_string(), "yes".to_string()),
            ("Bad Name".to_string(), "v".to_string()),
            ("X-Bad-Value".to_string(), "a\nb".to_string()),
        ];
        let map = build_header_map(&pairs);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("x-ok").unwrap(), "yes");
    }

    // ---- segment writer ----

    #[test]
    fn test_segment_writers_share_one_sparse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.part");
        std::fs::File::create(&path).unwrap().set_len(10).unwrap();

        // Two segments writing out of order, as parallel tasks would.
        let mut tail = SegmentWriter::open(&path, 5, Some(10)).unwrap();
        tail.write_chunk(b"WORLD").unwrap();
        let mut head = SegmentWriter::open(&path, 0, Some(5)).unwrap();
        head.write_chunk(b"HEL").unwrap();
        head.write_chunk(b"LO").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"HELLOWORLD");
    }

    #[test]
    fn test_segment_writer_refuses_to_cross_its_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounded.part");
        std::fs::File::create(&path).unwrap().set_len(8).unwrap();

        let mut writer = SegmentWriter::open(&path, 0, Some(4)).unwrap();
        assert!(!writer.exceeds_range(4));
        writer.write_chunk(b"abcd").unwrap();
        assert!(writer.exceeds_range(1), "next byte would hit a sibling");
    }

    #[test]
    fn test_unbounded_writer_extends_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.part");
        std::fs::File::create(&path).unwrap();

        let mut writer = SegmentWriter::open(&path, 3, None).unwrap();
        assert!(!writer.exceeds_range(usize::MAX / 2));
        writer.write_chunk(b"abc").unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 6);
    }
}
