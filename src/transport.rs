//! Push-channel connections.
//!
//! A [`Transport`] opens a [`Connection`] without waiting for the handshake:
//! a reader task is spawned and everything it observes comes back as
//! [`TransportSignal`]s in arrival order. The connection is the only owner of
//! that task; closing it aborts the reader and stops delivery.

use crate::constants::{MAX_SSE_LINE_BYTES, SIGNAL_CHANNEL_CAPACITY};
use crate::envelope::EventEnvelope;
use crate::sse::SseDecoder;
use crate::types::{Result, VantageError};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// Handshake succeeded. Not a business event.
    Connected,
    Envelope(EventEnvelope),
    /// A single frame could not be understood. The connection stays open.
    ProtocolError(String),
    /// The channel itself failed. Nothing follows this signal.
    ConnectionError { message: String, retryable: bool },
}

pub struct Connection {
    id: Uuid,
    url: String,
    rx: mpsc::Receiver<TransportSignal>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl Connection {
    pub fn new(url: impl Into<String>, rx: mpsc::Receiver<TransportSignal>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            rx,
            task,
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next signal in arrival order, or `None` once the connection is closed.
    ///
    /// A terminal envelope or a connection error closes the connection after
    /// it is handed out, so at most one terminal signal is ever delivered.
    pub async fn next_signal(&mut self) -> Option<TransportSignal> {
        if self.closed {
            return None;
        }

        let signal = match self.rx.recv().await {
            Some(s) => s,
            None => {
                tracing::debug!("[transport] {} reader ended without a signal", self.short_id());
                self.close();
                return None;
            }
        };

        let ends_connection = match &signal {
            TransportSignal::Envelope(env) => env.is_terminal(),
            TransportSignal::ConnectionError { .. } => true,
            _ => false,
        };
        if ends_connection {
            self.close();
        }
        Some(signal)
    }

    /// Stops delivery. Returns `true` only for the call that actually closed
    /// the connection; later calls are no-ops.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
        tracing::debug!("[transport] {} closed", self.short_id());
        true
    }

    fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("closed", &self.closed)
            .finish()
    }
}

pub trait Transport {
    /// Starts opening a channel to `url`. Returns immediately; the handshake
    /// outcome arrives as the first signal.
    fn open(&self, url: &str) -> Result<Connection>;
}

/// Server-sent events over HTTP.
#[derive(Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl SseTransport {
    pub fn new(client: reqwest::Client, bearer_token: Option<String>) -> Self {
        Self {
            client,
            bearer_token,
        }
    }
}

impl Transport for SseTransport {
    fn open(&self, url: &str) -> Result<Connection> {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let span = tracing::debug_span!("sse", url = %crate::redaction::redact_url(url));
        let task = tokio::spawn(run_sse_reader(request, tx).instrument(span));
        Ok(Connection::new(url, rx, Some(task)))
    }
}

async fn run_sse_reader(request: reqwest::RequestBuilder, tx: mpsc::Sender<TransportSignal>) {
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("[sse] handshake failed: {}", e);
            let _ = tx
                .send(TransportSignal::ConnectionError {
                    message: format!("handshake failed: {}", e),
                    retryable: true,
                })
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let retryable = VantageError::Upstream(status, body.clone()).is_transient();
        tracing::warn!("[sse] handshake rejected with status {}: {}", status, body);
        let _ = tx
            .send(TransportSignal::ConnectionError {
                message: format!("handshake rejected with status {}", status),
                retryable,
            })
            .await;
        return;
    }

    if tx.send(TransportSignal::Connected).await.is_err() {
        return;
    }

    let byte_stream = Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other)),
    );
    pump_lines(byte_stream, tx).await;
}

/// Reads SSE lines from `byte_stream` and forwards decoded envelopes.
///
/// Lines are split as raw bytes so that a line which is not UTF-8 costs only
/// its own frame, never the connection.
pub(crate) async fn pump_lines<R>(byte_stream: R, tx: mpsc::Sender<TransportSignal>)
where
    R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin,
{
    let reader = tokio_util::io::StreamReader::new(byte_stream);
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_SSE_LINE_BYTES);
    let mut lines = FramedRead::new(reader, codec);
    let mut decoder = SseDecoder::new();

    while let Some(line_result) = lines.next().await {
        let raw = match line_result {
            Ok(raw) => raw,
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::warn!("[sse] line exceeded {} bytes, skipping", MAX_SSE_LINE_BYTES);
                decoder.discard_frame();
                if tx
                    .send(TransportSignal::ProtocolError("oversized line".to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }
            Err(AnyDelimiterCodecError::Io(e)) => {
                tracing::warn!("[sse] stream read failed: {}", e);
                let _ = tx
                    .send(TransportSignal::ConnectionError {
                        message: format!("stream read failed: {}", e),
                        retryable: true,
                    })
                    .await;
                return;
            }
        };

        let raw = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("[sse] line is not valid UTF-8, dropping its frame: {}", e);
                decoder.discard_frame();
                if tx
                    .send(TransportSignal::ProtocolError(format!("line is not valid UTF-8: {}", e)))
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }
        };

        let frame = match decoder.push_line(line) {
            Some(f) => f,
            None => continue,
        };

        let signal = match EventEnvelope::parse(&frame.data, frame.event.as_deref(), frame.id.as_deref()) {
            Ok(envelope) => TransportSignal::Envelope(envelope),
            Err(e) => {
                tracing::warn!(
                    "[sse] malformed frame skipped: {} (data: {:?})",
                    e,
                    crate::logging::preview(&frame.data, 80)
                );
                TransportSignal::ProtocolError(e.to_string())
            }
        };

        let terminal = matches!(&signal, TransportSignal::Envelope(env) if env.is_terminal());
        if tx.send(signal).await.is_err() {
            return;
        }
        if terminal {
            tracing::debug!("[sse] terminal envelope received, reader done");
            return;
        }
    }

    decoder.finish();
    let _ = tx
        .send(TransportSignal::ConnectionError {
            message: "stream ended before a terminal event".to_string(),
            retryable: true,
        })
        .await;
}

/// Transport that replays prepared signal scripts, one script per `open`.
///
/// Used for offline replays and tests. Opening with no script left fails.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<TransportSignal>>>,
    opened: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: Vec<TransportSignal>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(script);
        }
    }

    /// URLs passed to `open`, in call order.
    pub fn opened_urls(&self) -> Vec<String> {
        match self.opened.lock() {
            Ok(opened) => opened.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, url: &str) -> Result<Connection> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(url.to_string());
        }
        let script = match self.scripts.lock() {
            Ok(mut scripts) => scripts.pop_front(),
            Err(_) => None,
        };
        let script = match script {
            Some(s) => s,
            None => {
                return Err(VantageError::Internal(
                    format!("no scripted stream left for {}", url),
                    tracing_error::SpanTrace::capture(),
                )
                .into())
            }
        };

        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            for signal in script {
                if tx.send(signal).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        });
        Ok(Connection::new(url, rx, Some(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventKind;

    fn chunks(parts: &[&str]) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin {
        let owned: Vec<std::result::Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        futures_util::stream::iter(owned)
    }

    async fn collect(mut rx: mpsc::Receiver<TransportSignal>) -> Vec<TransportSignal> {
        let mut out = Vec::new();
        while let Some(s) = rx.recv().await {
            out.push(s);
        }
        out
    }

    #[tokio::test]
    async fn test_pump_skips_malformed_frame_between_valid_frames() {
        let (tx, rx) = mpsc::channel(16);
        pump_lines(
            chunks(&[
                "data: {\"type\":\"node_execution\",\"progress\":10}\n\n",
                "data: {not json\n\n",
                "data: {\"type\":\"search_",
                "progress\",\"progress\":30}\n\n",
                "data: {\"type\":\"analysis_completed\",\"progress\":100}\n\n",
                "data: {\"type\":\"node_execution\"}\n\n",
            ]),
            tx,
        )
        .await;

        let signals = collect(rx).await;
        assert_eq!(signals.len(), 4);
        assert!(matches!(&signals[1], TransportSignal::ProtocolError(_)));
        match &signals[2] {
            TransportSignal::Envelope(env) => {
                assert_eq!(env.kind, EventKind::SearchProgress);
                assert_eq!(env.progress, Some(30));
            }
            other => panic!("Expected envelope, got {:?}", other),
        }
        // nothing is read past the terminal envelope
        assert!(matches!(&signals[3], TransportSignal::Envelope(env) if env.kind == EventKind::AnalysisCompleted));
    }

    #[tokio::test]
    async fn test_pump_survives_invalid_utf8_frame() {
        let mut corrupt = b"data: {\"type\":\"node_execution\",\"message\":\"".to_vec();
        corrupt.extend_from_slice(b"\xff\xfe\"}\r\n\r\n");
        let parts: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"progress\",\"progress\":10}\n\n")),
            Ok(Bytes::from(corrupt)),
            Ok(Bytes::from_static(b"data: {\"type\":\"progress\",\"progress\":60}\n\n")),
            Ok(Bytes::from_static(b"data: {\"type\":\"analysis_completed\"}\n\n")),
        ];
        let (tx, rx) = mpsc::channel(16);
        pump_lines(futures_util::stream::iter(parts), tx).await;

        let signals = collect(rx).await;
        assert_eq!(signals.len(), 4, "got {:?}", signals);
        assert!(matches!(&signals[0], TransportSignal::Envelope(env) if env.progress == Some(10)));
        assert!(matches!(&signals[1], TransportSignal::ProtocolError(_)));
        assert!(matches!(&signals[2], TransportSignal::Envelope(env) if env.progress == Some(60)));
        assert!(matches!(&signals[3], TransportSignal::Envelope(env) if env.kind == EventKind::AnalysisCompleted));
    }

    #[tokio::test]
    async fn test_pump_treats_read_failure_as_connection_error() {
        let parts: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"progress\",\"progress\":10}\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer")),
        ];
        let (tx, rx) = mpsc::channel(16);
        pump_lines(futures_util::stream::iter(parts), tx).await;

        let signals = collect(rx).await;
        assert_eq!(signals.len(), 2);
        assert!(matches!(
            &signals[1],
            TransportSignal::ConnectionError { retryable: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_pump_reports_unexpected_eof_as_retryable() {
        let (tx, rx) = mpsc::channel(16);
        pump_lines(chunks(&["data: {\"type\":\"progress\",\"progress\":5}\n\n"]), tx).await;

        let signals = collect(rx).await;
        assert_eq!(signals.len(), 2);
        assert!(matches!(
            &signals[1],
            TransportSignal::ConnectionError { retryable: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_connection_self_closes_once_on_terminal() {
        let transport = ScriptedTransport::new();
        transport.push_script(vec![
            TransportSignal::Connected,
            TransportSignal::Envelope(EventEnvelope::new(EventKind::StreamingComplete)),
            TransportSignal::Envelope(EventEnvelope::new(EventKind::AnalysisCompleted)),
        ]);
        let mut conn = match transport.open("scripted://a") {
            Ok(c) => c,
            Err(e) => panic!("open failed: {}", e),
        };

        assert_eq!(conn.next_signal().await, Some(TransportSignal::Connected));
        assert!(matches!(conn.next_signal().await, Some(TransportSignal::Envelope(_))));
        assert!(conn.is_closed());
        assert_eq!(conn.next_signal().await, None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_delivery() {
        let transport = ScriptedTransport::new();
        transport.push_script(vec![
            TransportSignal::Connected,
            TransportSignal::Envelope(EventEnvelope::new(EventKind::Progress).with_progress(10)),
        ]);
        let mut conn = match transport.open("scripted://b") {
            Ok(c) => c,
            Err(e) => panic!("open failed: {}", e),
        };

        assert!(conn.close());
        assert!(!conn.close());
        assert!(!conn.close());
        assert_eq!(conn.next_signal().await, None);
    }

    #[tokio::test]
    async fn test_scripted_transport_without_script_fails() {
        let transport = ScriptedTransport::new();
        assert!(transport.open("scripted://none").is_err());
        assert_eq!(transport.opened_urls(), vec!["scripted://none".to_string()]);
    }
}
