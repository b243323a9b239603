use crate::envelope::EventEnvelope;
use crate::reducer::StreamState;
use crate::router::RouterPhase;
use crate::types::*;
use std::collections::BTreeMap;
use std::panic;
use std::path::Path;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "vantage=info";

/// Flush guards for the non-blocking file writers. Keep alive until exit.
#[must_use]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber.
///
/// Stderr always gets human-readable output. With `log_dir`, two daily
/// rotated files are added there: `vantage.log` (plain text) and
/// `trace_buffer.json` (NDJSON with span fields). Secrets are scrubbed from
/// both files.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<LogGuards> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    let mut guards = Vec::new();
    let (file_layer, ndjson_layer) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (text, text_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "vantage.log"));
            let (trace, trace_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "trace_buffer.json"));
            guards.push(text_guard);
            guards.push(trace_guard);
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(redacting(text))
                        .with_ansi(false),
                ),
                Some(crate::trace_layer::NdjsonTraceLayer::new(
                    crate::redaction_layer::RedactingWriter::new(trace),
                )),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .with(ndjson_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .map_err(|e| {
            VantageError::Internal(
                format!("tracing already initialized: {}", e),
                tracing_error::SpanTrace::capture(),
            )
        })?;

    Ok(LogGuards { _guards: guards })
}

/// `MakeWriter` that hands out a scrubbing wrapper around a clone of `inner`
/// for every event.
fn redacting<W>(inner: W) -> impl Fn() -> crate::redaction_layer::RedactingWriter<W> + Send + Sync + 'static
where
    W: std::io::Write + Clone + Send + Sync + 'static,
{
    move || crate::redaction_layer::RedactingWriter::new(inner.clone())
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Leading `max_chars` characters of `s`, cut on a char boundary.
pub fn preview(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Per-session delivery counters, summarized once when the session ends.
#[derive(Debug, Default, Clone)]
pub struct StreamMetric {
    pub envelopes: usize,
    pub duplicates: usize,
    pub protocol_errors: usize,
    pub connection_errors: usize,
    pub substream_switches: usize,
    pub by_kind: BTreeMap<String, usize>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_envelope(&mut self, envelope: &EventEnvelope, duplicate: bool) {
        self.envelopes += 1;
        if duplicate {
            self.duplicates += 1;
        }
        *self
            .by_kind
            .entry(envelope.kind.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn record_protocol_error(&mut self) {
        self.protocol_errors += 1;
    }

    pub fn record_connection_error(&mut self) {
        self.connection_errors += 1;
    }

    pub fn record_substream(&mut self) {
        self.substream_switches += 1;
    }

    pub fn log_summary(&self, analysis_id: &AnalysisId, phase: RouterPhase, state: &StreamState) {
        let kinds = self
            .by_kind
            .iter()
            .map(|(k, n)| format!("{}={}", k, n))
            .collect::<Vec<_>>()
            .join(", ");

        info!(
            target: "stream_summary",
            "[STREAM END] {} | Phase: {:?} | Run: {:?} | Cache: {:?} | Envelopes: {} ({}) | Dups: {} | Bad frames: {} | Conn errors: {} | Switches: {}",
            analysis_id.short(),
            phase,
            state.run_status,
            state.cache_status,
            self.envelopes,
            kinds,
            self.duplicates,
            self.protocol_errors,
            self.connection_errors,
            self.substream_switches
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventKind;

    #[derive(Clone, Default)]
    struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            match self.0.lock() {
                Ok(mut inner) => inner.extend_from_slice(buf),
                Err(e) => panic!("buffer poisoned: {}", e),
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_text_log_output_is_scrubbed() {
        let buf = SharedBuf::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(redacting(buf.clone()))
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!(
                "sse",
                url = %crate::redaction::redact_url("http://h/api/stream/a1?token=s3cret&research=true")
            );
            let _guard = span.enter();
            info!("opening stream with Authorization: Bearer abc.def");
            info!("retrying http://h/api/stream/a1?api_key=k3y");
        });

        let out = match buf.0.lock() {
            Ok(inner) => String::from_utf8_lossy(&inner).to_string(),
            Err(e) => panic!("buffer poisoned: {}", e),
        };
        assert!(out.contains("opening stream"));
        assert!(out.contains("research=true"));
        assert!(!out.contains("s3cret"));
        assert!(!out.contains("abc.def"));
        assert!(!out.contains("k3y"));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("héllo wörld", 4), "héll");
        assert_eq!(preview("short", 80), "short");
        assert_eq!(preview("", 3), "");
    }

    #[test]
    fn test_metric_counts_by_kind() {
        let mut m = StreamMetric::new();
        m.record_envelope(&EventEnvelope::new(EventKind::Progress), false);
        m.record_envelope(&EventEnvelope::new(EventKind::Progress), true);
        m.record_envelope(&EventEnvelope::new(EventKind::AnalysisCompleted), false);
        m.record_protocol_error();

        assert_eq!(m.envelopes, 3);
        assert_eq!(m.duplicates, 1);
        assert_eq!(m.protocol_errors, 1);
        assert_eq!(m.by_kind.get("progress"), Some(&2));
        assert_eq!(m.by_kind.get("analysis_completed"), Some(&1));
    }
}
