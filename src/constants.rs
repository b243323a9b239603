/// Envelope types that end a stream successfully. The backend is not
/// consistent about which one each endpoint emits, so all are accepted.
pub const TERMINAL_SUCCESS_TYPES: &[&str] =
    &["analysis_completed", "stream_completed", "streaming_complete"];

pub const TERMINAL_ERROR_TYPE: &str = "error";
pub const CACHE_MISS_REDIRECT_TYPE: &str = "cache_miss_redirect";

/// Backend endpoint paths, relative to the configured base URL.
pub const CACHED_STREAM_PATH: &str = "/api/stream/cached";
pub const LIVE_STREAM_PATH: &str = "/api/stream";
pub const CACHE_CHECK_PATH: &str = "/api/cache/check";
pub const RESULTS_PATH: &str = "/api/results";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Result fetch retry defaults
pub const RESULT_FETCH_MAX_ATTEMPTS: u32 = 3;
pub const RESULT_FETCH_BASE_DELAY_MS: u64 = 250;

pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

/// Upper bound on the signal queue between a transport reader task and its consumer.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// Lines longer than this are a protocol error rather than an allocation.
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;
