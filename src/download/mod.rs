//! The fetch path: transport, bandwidth budget, filename resolution, and the
//! segmented fetcher itself.

pub mod error;
pub mod fetcher;
pub mod filename;
pub mod limiter;
pub mod transport;

pub use error::{ErrorCode, FetchError};
pub use fetcher::{AttemptContext, FetchOutcome, FetchSignal, Fetcher};
pub use limiter::BandwidthLimiter;
pub use transport::Transport;
