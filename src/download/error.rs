//! Error types for the fetch path and the stable error-code taxonomy.
//!
//! [`FetchError`] carries context for logging and debugging; [`ErrorCode`] is
//! the fixed vocabulary persisted on the download row and surfaced verbatim
//! through the API and progress stream.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes. The string forms are part of the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DnsFail,
    ConnectFail,
    TlsFail,
    Http4xx,
    Http5xx,
    Timeout,
    RangeUnsupported,
    DiskFull,
    RemoteChanged,
    PermissionDenied,
    Cancelled,
    InvalidUrl,
    Unknown,
}

impl ErrorCode {
    /// The persisted/serialized string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DnsFail => "DNS_FAIL",
            Self::ConnectFail => "CONNECT_FAIL",
            Self::TlsFail => "TLS_FAIL",
            Self::Http4xx => "HTTP_4XX",
            Self::Http5xx => "HTTP_5XX",
            Self::Timeout => "TIMEOUT",
            Self::RangeUnsupported => "RANGE_UNSUPPORTED",
            Self::DiskFull => "DISK_FULL",
            Self::RemoteChanged => "REMOTE_CHANGED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Cancelled => "CANCELLED",
            Self::InvalidUrl => "INVALID_URL",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parses a persisted code; unrecognized strings collapse to `Unknown`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "DNS_FAIL" => Self::DnsFail,
            "CONNECT_FAIL" => Self::ConnectFail,
            "TLS_FAIL" => Self::TlsFail,
            "HTTP_4XX" => Self::Http4xx,
            "HTTP_5XX" => Self::Http5xx,
            "TIMEOUT" => Self::Timeout,
            "RANGE_UNSUPPORTED" => Self::RangeUnsupported,
            "DISK_FULL" => Self::DiskFull,
            "REMOTE_CHANGED" => Self::RemoteChanged,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "CANCELLED" => Self::Cancelled,
            "INVALID_URL" => Self::InvalidUrl,
            _ => Self::Unknown,
        }
    }

    /// Whether the engine may reissue the fetch against a mirror candidate.
    #[must_use]
    pub fn is_mirror_retryable(&self) -> bool {
        matches!(
            self,
            Self::DnsFail | Self::ConnectFail | Self::TlsFail | Self::Http5xx | Self::Timeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors produced while driving a single transfer.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level failure (DNS, connect, TLS, mid-stream read).
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a final error status.
    #[error("HTTP {status} fetching {url}")]
    Http { url: String, status: u16 },

    /// Filesystem failure while writing the temp file or renaming it.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The URL did not parse or was not http/https.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// A configured proxy URL was rejected by the transport.
    #[error("invalid proxy URL: {url}")]
    InvalidProxy { url: String },

    /// Validators differ from the persisted ones on resume.
    #[error("remote changed: {detail}")]
    RemoteChanged { detail: String },

    /// The server advertised ranges and then answered 200 to a ranged GET.
    #[error("server rejected ranged request for {url}")]
    RangeUnsupported { url: String },

    /// The body ended short of (or the final file disagrees with) the
    /// expected length.
    #[error("truncated body from {url}: expected {expected} bytes, got {actual}")]
    TruncatedBody {
        url: String,
        expected: i64,
        actual: i64,
    },

    /// Cooperative cancellation observed mid-transfer.
    #[error("cancelled")]
    Cancelled,

    /// Persistence failure; fatal to the operation, never silently dropped.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

impl FetchError {
    /// Creates a network error with its URL context.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http(url: impl Into<String>, status: u16) -> Self {
        Self::Http {
            url: url.into(),
            status,
        }
    }

    /// Creates an I/O error with its path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classifies this error into the stable taxonomy.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network { source, .. } => classify_reqwest(source),
            Self::Http { status, .. } if (400..500).contains(status) => ErrorCode::Http4xx,
            Self::Http { status, .. } if (500..600).contains(status) => ErrorCode::Http5xx,
            Self::Http { .. } => ErrorCode::Unknown,
            Self::Io { source, .. } => classify_io(source),
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::InvalidProxy { .. } => ErrorCode::ConnectFail,
            Self::RemoteChanged { .. } => ErrorCode::RemoteChanged,
            Self::RangeUnsupported { .. } => ErrorCode::RangeUnsupported,
            Self::TruncatedBody { .. } => ErrorCode::Unknown,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Store(_) => ErrorCode::Unknown,
        }
    }
}

/// Maps a transport error onto the taxonomy.
///
/// reqwest does not expose DNS or TLS failures as distinct kinds, so the
/// error chain text is inspected for them, the same way certificate errors
/// are usually detected.
fn classify_reqwest(error: &reqwest::Error) -> ErrorCode {
    if error.is_timeout() {
        return ErrorCode::Timeout;
    }
    let chain = error_chain_text(error);
    if chain.contains("dns") || chain.contains("failed to lookup") {
        return ErrorCode::DnsFail;
    }
    if chain.contains("certificate")
        || chain.contains("tls")
        || chain.contains("ssl")
        || chain.contains("handshake")
    {
        return ErrorCode::TlsFail;
    }
    if error.is_connect() || error.is_redirect() {
        return ErrorCode::ConnectFail;
    }
    ErrorCode::Unknown
}

fn error_chain_text(error: &reqwest::Error) -> String {
    let mut text = error.to_string().to_lowercase();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text
}

fn classify_io(error: &std::io::Error) -> ErrorCode {
    if error.kind() == std::io::ErrorKind::PermissionDenied {
        return ErrorCode::PermissionDenied;
    }
    if is_disk_full(error) {
        return ErrorCode::DiskFull;
    }
    ErrorCode::Unknown
}

#[cfg(unix)]
fn is_disk_full(error: &std::io::Error) -> bool {
    // ENOSPC / EDQUOT
    matches!(error.raw_os_error(), Some(28 | 122))
}

#[cfg(windows)]
fn is_disk_full(error: &std::io::Error) -> bool {
    // ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL
    matches!(error.raw_os_error(), Some(39 | 112))
}

#[cfg(not(any(unix, windows)))]
fn is_disk_full(_error: &std::io::Error) -> bool {
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trips() {
        for code in [
            ErrorCode::DnsFail,
            ErrorCode::ConnectFail,
            ErrorCode::TlsFail,
            ErrorCode::Http4xx,
            ErrorCode::Http5xx,
            ErrorCode::Timeout,
            ErrorCode::RangeUnsupported,
            ErrorCode::DiskFull,
            ErrorCode::RemoteChanged,
            ErrorCode::PermissionDenied,
            ErrorCode::Cancelled,
            ErrorCode::InvalidUrl,
            ErrorCode::Unknown,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
    }

    #[test]
    fn test_unrecognized_code_collapses_to_unknown() {
        assert_eq!(ErrorCode::parse("SOMETHING_ELSE"), ErrorCode::Unknown);
    }

    #[test]
    fn test_mirror_retryable_set() {
        assert!(ErrorCode::DnsFail.is_mirror_retryable());
        assert!(ErrorCode::ConnectFail.is_mirror_retryable());
        assert!(ErrorCode::TlsFail.is_mirror_retryable());
        assert!(ErrorCode::Http5xx.is_mirror_retryable());
        assert!(ErrorCode::Timeout.is_mirror_retryable());

        assert!(!ErrorCode::Http4xx.is_mirror_retryable());
        assert!(!ErrorCode::RemoteChanged.is_mirror_retryable());
        assert!(!ErrorCode::DiskFull.is_mirror_retryable());
        assert!(!ErrorCode::PermissionDenied.is_mirror_retryable());
        assert!(!ErrorCode::InvalidUrl.is_mirror_retryable());
        assert!(!ErrorCode::Cancelled.is_mirror_retryable());
    }

    #[test]
    fn test_http_classification() {
        assert_eq!(
            FetchError::http("https://example.com/a", 404).code(),
            ErrorCode::Http4xx
        );
        assert_eq!(
            FetchError::http("https://example.com/a", 503).code(),
            ErrorCode::Http5xx
        );
    }

    #[test]
    fn test_io_permission_denied_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            FetchError::io("/tmp/x.part", io).code(),
            ErrorCode::PermissionDenied
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_io_disk_full_classification() {
        let io = std::io::Error::from_raw_os_error(28);
        assert_eq!(FetchError::io("/tmp/x.part", io).code(), ErrorCode::DiskFull);
    }

    #[test]
    fn test_invalid_url_classification() {
        let err = FetchError::InvalidUrl {
            url: "nope".to_string(),
        };
        assert_eq!(err.code(), ErrorCode::InvalidUrl);
    }

    #[test]
    fn test_cancelled_classification() {
        assert_eq!(FetchError::Cancelled.code(), ErrorCode::Cancelled);
    }
}
