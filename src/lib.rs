pub mod backend;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod event_log;
pub mod hardening;
pub mod logging;
pub mod redaction;
pub mod redaction_layer;
pub mod reducer;
pub mod result_fetcher;
pub mod router;
pub mod sim;
pub mod sse;
pub mod trace_layer;
pub mod transport;
pub mod types;

pub use types::*;
