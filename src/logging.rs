//! Tracing initialization: JSON lines, one file per day.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initializes the global subscriber writing `zdmr.jsonl.YYYY-MM-DD` files
/// into `logs_dir`. `RUST_LOG` overrides the default filter.
pub fn init(logs_dir: &Path) {
    let appender = tracing_appender::rolling::daily(logs_dir, "zdmr.jsonl");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqwest=warn,hyper=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .json()
        .with_current_span(true)
        .init();
}
