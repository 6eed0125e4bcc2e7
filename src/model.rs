//! Core entity types: downloads, segments, batches, rules, and settings.
//!
//! These mirror the persisted tables one-to-one; the store reads them with
//! `sqlx::FromRow` and the API serializes them with `serde`.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::download::error::ErrorCode;

/// Lifecycle state of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Waiting for a free slot.
    Queued,
    /// Actively transferring.
    Downloading,
    /// Suspended by the user; bytes on disk are retained.
    Paused,
    /// Fully transferred and renamed into place.
    Completed,
    /// Failed; `error_code` says why. Re-enterable via retry.
    Error,
}

impl DownloadStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Downloading => "DOWNLOADING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "DOWNLOADING" => Ok(Self::Downloading),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// One logical transfer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Opaque identifier, stable from creation.
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// The URL exactly as the user entered it.
    pub original_url: String,
    /// URL actually fetched, once known (after redirects or mirror rewrite).
    pub resolved_url: Option<String>,
    pub dest_dir: String,
    /// Per-download proxy that overrides every rule when set.
    pub forced_proxy_url: Option<String>,
    pub batch_id: Option<String>,
    /// Chosen on-disk name, once the first response headers are seen.
    pub final_filename: Option<String>,
    pub temp_path: Option<String>,
    /// Stored as text; parse via [`DownloadRecord::status`].
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub content_length: Option<i64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Tri-state: `None` until probed.
    pub supports_ranges: Option<bool>,
    /// Mirror base URL used for the successful attempt, if any.
    pub mirror_used: Option<String>,
    /// Authoritative byte count at rest.
    pub bytes_downloaded: i64,
}

impl DownloadRecord {
    /// Parsed status; falls back to `Error` on unknown strings.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.status_str.parse().unwrap_or(DownloadStatus::Error)
    }

    /// Parsed error code, when one is recorded.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code.as_deref().map(ErrorCode::parse)
    }
}

/// One byte-range slice of a download.
///
/// `range_end_exclusive` is `None` for the single unbounded segment used when
/// the content length is unknown.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub download_id: String,
    pub ordinal: i64,
    pub range_start: i64,
    pub range_end_exclusive: Option<i64>,
    pub bytes_written: i64,
    pub done: bool,
}

impl SegmentRecord {
    /// Bytes this segment still has to fetch, when its range is bounded.
    #[must_use]
    pub fn remaining(&self) -> Option<i64> {
        self.range_end_exclusive
            .map(|end| (end - self.range_start - self.bytes_written).max(0))
    }
}

/// A group of downloads added together.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    pub created_at: String,
    pub name: Option<String>,
    pub dest_dir: String,
    /// The raw paste the URLs were parsed from, kept verbatim for audit.
    pub raw_url_list: Option<String>,
    pub download_through_proxy: bool,
}

/// Hostname-matched proxy policy.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProxyRule {
    pub id: i64,
    pub pattern: String,
    pub enabled: bool,
    pub use_proxy: bool,
    pub proxy_url_override: Option<String>,
}

/// Hostname-matched extra request headers. `headers_json` accepts either the
/// map form (`{"X-A": "v"}`) or the flat form with explicit modes
/// (`{"X-A": {"value": "v", "mode": "add_if_missing"}}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    pub id: i64,
    pub pattern: String,
    pub enabled: bool,
    pub headers_json: serde_json::Value,
}

/// Hostname-matched ordered list of alternate base URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorRule {
    pub id: i64,
    pub pattern: String,
    pub enabled: bool,
    pub candidates_json: serde_json::Value,
}

/// Copy-on-read view of all rules, captured once per fetch attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesSnapshot {
    pub proxy_rules: Vec<ProxyRule>,
    pub header_rules: Vec<HeaderRule>,
    pub mirror_rules: Vec<MirrorRule>,
}

/// Singleton settings record, read as a snapshot per fetch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub default_download_dir: String,
    /// Global budget in bytes/s; `None` means unlimited.
    pub bandwidth_limit_bps: Option<i64>,
    pub minimize_to_tray: bool,
    pub theme: String,
    pub skin: String,
    pub global_hotkey: String,
    pub global_proxy_enabled: bool,
    pub global_proxy_url: Option<String>,
    pub local_api_port: i64,
}

/// One row of a batched progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: String,
    pub status: DownloadStatus,
    pub bytes_downloaded: i64,
    pub content_length: Option<i64>,
    pub speed_bps: f64,
    pub eta_seconds: Option<f64>,
    /// Human-readable transient state, e.g. "Retrying in 4s".
    #[serde(default)]
    pub status_detail: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub updated_at: String,
}

/// Body of `POST /downloads`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDownloadsRequest {
    pub urls: Vec<String>,
    pub dest_dir: Option<String>,
}

/// Body of `POST /batches`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatchRequest {
    pub name: Option<String>,
    pub dest_dir: String,
    /// Free-form paste; whitespace-split and filtered to http/https.
    pub raw_url_list: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    pub download_through_proxy: Option<bool>,
}

impl NewBatchRequest {
    /// Returns the effective URL list: explicit `urls` plus any http(s) URLs
    /// parsed out of `raw_url_list`.
    #[must_use]
    pub fn effective_urls(&self) -> Vec<String> {
        let mut out = self.urls.clone();
        if let Some(raw) = &self.raw_url_list {
            out.extend(
                raw.split_whitespace()
                    .filter(|tok| tok.starts_with("http://") || tok.starts_with("https://"))
                    .map(str::to_string),
            );
        }
        out
    }
}

/// Current RFC 3339 UTC timestamp, the format every table stores.
#[must_use]
pub fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            DownloadStatus::Queued,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Completed,
            DownloadStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_status_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&DownloadStatus::Downloading).unwrap();
        assert_eq!(json, "\"DOWNLOADING\"");
        let parsed: DownloadStatus = serde_json::from_str("\"PAUSED\"").unwrap();
        assert_eq!(parsed, DownloadStatus::Paused);
    }

    #[test]
    fn test_batch_request_parses_raw_url_list() {
        let req = NewBatchRequest {
            name: None,
            dest_dir: "/tmp".to_string(),
            raw_url_list: Some(
                "https://a.example/x\nftp://skip.me  http://b.example/y\nnot-a-url".to_string(),
            ),
            urls: vec!["https://c.example/z".to_string()],
            download_through_proxy: None,
        };

        let urls = req.effective_urls();
        assert_eq!(
            urls,
            vec![
                "https://c.example/z",
                "https://a.example/x",
                "http://b.example/y",
            ]
        );
    }

    #[test]
    fn test_segment_remaining() {
        let seg = SegmentRecord {
            download_id: "d".to_string(),
            ordinal: 0,
            range_start: 100,
            range_end_exclusive: Some(200),
            bytes_written: 30,
            done: false,
        };
        assert_eq!(seg.remaining(), Some(70));

        let unbounded = SegmentRecord {
            range_end_exclusive: None,
            ..seg
        };
        assert_eq!(unbounded.remaining(), None);
    }

    #[test]
    fn test_now_rfc3339_sorts_lexicographically() {
        let a = now_rfc3339();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_rfc3339();
        assert!(a < b, "timestamps must order by string comparison: {a} {b}");
    }
}
