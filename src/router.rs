//! Delivery routing: cached replay, live computation, and the switch between
//! them.
//!
//! A [`WatchSession`] is a stepped state machine. Each call to
//! [`WatchSession::next_update`] performs one unit of work (probe the cache,
//! receive one transport signal, ...) on the caller's task and reports the
//! phase afterwards; the folded state is read with [`WatchSession::state`].
//! Nothing else mutates the state, so the session is its single writer.

use crate::backend::CacheProbe;
use crate::config::ClientConfig;
use crate::envelope::EventKind;
use crate::hardening::RetryPolicy;
use crate::logging::StreamMetric;
use crate::reducer::{self, CacheStatus, StreamState};
use crate::transport::{Connection, Transport, TransportSignal};
use crate::types::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Check the cache first and replay a finished result when one exists.
    CacheAware,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterPhase {
    Start,
    ProbingCache,
    ReplayingCache,
    Live,
    Done,
    Cancelled,
}

impl RouterPhase {
    pub fn is_final(self) -> bool {
        matches!(self, RouterPhase::Done | RouterPhase::Cancelled)
    }

    fn is_streaming(self) -> bool {
        matches!(self, RouterPhase::ReplayingCache | RouterPhase::Live)
    }
}

pub struct DeliveryRouter<T, P> {
    transport: Arc<T>,
    probe: Arc<P>,
    config: ClientConfig,
}

impl<T: Transport, P: CacheProbe> DeliveryRouter<T, P> {
    pub fn new(transport: T, probe: P, config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            probe: Arc::new(probe),
            config,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Creates a session in `Start`. Nothing happens until it is stepped.
    pub fn watch(&self, request: AnalysisRequest, analysis_id: AnalysisId, mode: DeliveryMode) -> WatchSession<T, P> {
        let span = tracing::info_span!(
            "watch",
            analysis_id = %analysis_id.short(),
            mode = ?mode
        );
        WatchSession {
            state: StreamState::new_attempt(analysis_id.clone(), CacheStatus::Unknown),
            analysis_id,
            request,
            mode,
            phase: RouterPhase::Start,
            connection: None,
            transport: Arc::clone(&self.transport),
            probe: Arc::clone(&self.probe),
            config: self.config.clone(),
            cancel: CancellationToken::new(),
            metric: StreamMetric::new(),
            final_reported: false,
            span,
        }
    }
}

enum Received {
    Cancelled,
    Signal(Option<TransportSignal>),
}

pub struct WatchSession<T, P> {
    analysis_id: AnalysisId,
    request: AnalysisRequest,
    mode: DeliveryMode,
    phase: RouterPhase,
    state: StreamState,
    connection: Option<Connection>,
    transport: Arc<T>,
    probe: Arc<P>,
    config: ClientConfig,
    cancel: CancellationToken,
    metric: StreamMetric,
    final_reported: bool,
    span: tracing::Span,
}

impl<T: Transport, P: CacheProbe> WatchSession<T, P> {
    pub fn analysis_id(&self) -> &AnalysisId {
        &self.analysis_id
    }

    pub fn phase(&self) -> RouterPhase {
        self.phase
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn into_state(mut self) -> StreamState {
        self.close_connection();
        std::mem::replace(
            &mut self.state,
            StreamState::new_attempt(self.analysis_id.clone(), CacheStatus::Unknown),
        )
    }

    pub fn metric(&self) -> &StreamMetric {
        &self.metric
    }

    pub fn has_open_connection(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Token that cancels this session from another task. The session notices
    /// on its next step.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels immediately: closes any open connection and stops all further
    /// state changes. Safe to call at any phase, any number of times.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.finish_cancelled();
    }

    /// Performs one step and returns the phase afterwards, or `None` once the
    /// session has ended and its final phase was already reported.
    ///
    /// A session stalled by a connection error also returns `None` until
    /// [`WatchSession::reconnect`] is called.
    pub async fn next_update(&mut self) -> Option<RouterPhase> {
        let span = self.span.clone();
        self.step().instrument(span).await
    }

    /// Drives the session to its end, calling `on_update` after every step.
    pub async fn run<F>(&mut self, mut on_update: F) -> &StreamState
    where
        F: FnMut(RouterPhase, &StreamState),
    {
        while let Some(phase) = self.next_update().await {
            on_update(phase, &self.state);
        }
        &self.state
    }

    /// [`WatchSession::run`], reconnecting after retryable connection errors.
    /// The policy bounds the total number of attempts and spaces them out.
    pub async fn run_with_reconnects<F>(&mut self, policy: &RetryPolicy, mut on_update: F) -> &StreamState
    where
        F: FnMut(RouterPhase, &StreamState),
    {
        let mut reconnects = 0u32;
        loop {
            while let Some(phase) = self.next_update().await {
                on_update(phase, &self.state);
            }

            let retryable = self
                .state
                .connection_error
                .as_ref()
                .is_some_and(|f| f.retryable);
            if self.phase.is_final() || !retryable || reconnects + 1 >= policy.max_attempts {
                break;
            }

            reconnects += 1;
            let delay = policy.delay_for(reconnects);
            tracing::warn!(
                parent: &self.span,
                "[router] stream lost (attempt {}/{}), reconnecting in {:?}",
                reconnects,
                policy.max_attempts,
                delay
            );
            let cancelled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                // next_update reports the cancellation
                continue;
            }
            if let Err(e) = self.reconnect() {
                tracing::error!(parent: &self.span, "[router] reconnect refused: {}", e);
                break;
            }
        }
        &self.state
    }

    /// Starts a fresh attempt after a transport failure, in the mode the
    /// session was streaming in. The previous state is discarded.
    pub fn reconnect(&mut self) -> Result<()> {
        if !self.phase.is_streaming() || self.has_open_connection() {
            return Err(VantageError::Validation(format!(
                "cannot reconnect in phase {:?} (connection open: {})",
                self.phase,
                self.has_open_connection()
            ))
            .into());
        }

        let span = self.span.clone();
        let _guard = span.enter();
        tracing::info!("[router] reconnecting ({:?})", self.phase);
        let (cache_status, url) = match self.phase {
            RouterPhase::ReplayingCache => (
                CacheStatus::Hit,
                self.config.cached_stream_url(&self.analysis_id, &self.request),
            ),
            _ => (
                CacheStatus::Live,
                self.config.live_stream_url(&self.analysis_id, self.request.research_enabled),
            ),
        };
        self.state = self.state.next_attempt(cache_status);
        self.open(url);
        Ok(())
    }

    async fn step(&mut self) -> Option<RouterPhase> {
        loop {
            if self.phase.is_final() {
                return self.report_final();
            }
            if self.cancel.is_cancelled() {
                self.finish_cancelled();
                return self.report_final();
            }

            match self.phase {
                RouterPhase::Start => {
                    self.start();
                    return Some(self.phase);
                }
                RouterPhase::ProbingCache => {
                    self.probe_cache().await;
                    if self.phase.is_final() {
                        return self.report_final();
                    }
                    return Some(self.phase);
                }
                RouterPhase::ReplayingCache | RouterPhase::Live => {
                    if self.connection.is_none() {
                        // stalled on a connection error, waiting for reconnect()
                        return None;
                    }
                    match self.receive().await {
                        Received::Cancelled => {
                            self.finish_cancelled();
                            return self.report_final();
                        }
                        Received::Signal(signal) => {
                            if !self.handle_signal(signal) {
                                continue;
                            }
                            if self.phase.is_final() {
                                return self.report_final();
                            }
                            return Some(self.phase);
                        }
                    }
                }
                RouterPhase::Done | RouterPhase::Cancelled => return self.report_final(),
            }
        }
    }

    fn start(&mut self) {
        match self.mode {
            DeliveryMode::CacheAware => {
                self.transition(RouterPhase::ProbingCache);
                self.update(|s| s.with_cache_status(CacheStatus::Checking));
            }
            DeliveryMode::Live => self.go_live(),
        }
    }

    async fn probe_cache(&mut self) {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            outcome = self.probe.probe(&self.request) => Some(outcome),
        };

        match outcome {
            None => self.finish_cancelled(),
            Some(Ok(descriptor)) if descriptor.is_cached => {
                tracing::info!(
                    "[router] cache hit: cost_saved={} processing_time_ms={}",
                    descriptor.cost_saved,
                    descriptor.processing_time_ms
                );
                self.transition(RouterPhase::ReplayingCache);
                let cost = descriptor.cost_saved.0;
                self.update(|mut s| {
                    s.cost_saved = cost;
                    s.with_cache_status(CacheStatus::Hit)
                });
                let url = self.config.cached_stream_url(&self.analysis_id, &self.request);
                self.open(url);
            }
            Some(Ok(_)) => {
                tracing::info!("[router] cache miss, going live");
                self.go_live();
            }
            Some(Err(e)) => {
                // the cache is an optimization; its failures never reach the user
                tracing::warn!("[router] cache probe failed, falling back to live: {}", e);
                self.go_live();
            }
        }
    }

    fn go_live(&mut self) {
        self.transition(RouterPhase::Live);
        self.update(|s| s.with_cache_status(CacheStatus::Live));
        let url = self
            .config
            .live_stream_url(&self.analysis_id, self.request.research_enabled);
        self.open(url);
    }

    async fn receive(&mut self) -> Received {
        let connection = match self.connection.as_mut() {
            Some(c) => c,
            None => return Received::Signal(None),
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Received::Cancelled,
            signal = connection.next_signal() => Received::Signal(signal),
        }
    }

    /// Applies one transport signal. Returns whether the state changed.
    fn handle_signal(&mut self, signal: Option<TransportSignal>) -> bool {
        match signal {
            None => {
                tracing::warn!("[router] connection closed without a terminal event");
                self.metric.record_connection_error();
                self.connection = None;
                self.update(|s| reducer::apply_connection_error(s, "connection closed", true));
                true
            }
            Some(TransportSignal::Connected) => {
                tracing::debug!("[router] connection established");
                self.update(reducer::apply_connected);
                true
            }
            Some(TransportSignal::ProtocolError(reason)) => {
                self.metric.record_protocol_error();
                tracing::debug!("[router] frame skipped: {}", reason);
                false
            }
            Some(TransportSignal::ConnectionError { message, retryable }) => {
                tracing::warn!(
                    "[router] connection lost (retryable: {}): {}",
                    retryable,
                    message
                );
                self.metric.record_connection_error();
                self.connection = None;
                self.update(|s| reducer::apply_connection_error(s, &message, retryable));
                true
            }
            Some(TransportSignal::Envelope(envelope)) => {
                self.update(|s| reducer::reduce(s, &envelope));
                let duplicate = self.state.event_log.last().is_some_and(|e| e.duplicate);
                self.metric.record_envelope(&envelope, duplicate);

                if self.state.is_done() {
                    self.close_connection();
                    self.update(StreamState::disconnected);
                    self.transition(RouterPhase::Done);
                } else if envelope.kind == EventKind::CacheMissRedirect {
                    self.handle_redirect();
                }
                true
            }
        }
    }

    fn handle_redirect(&mut self) {
        self.close_connection();
        if self.phase != RouterPhase::ReplayingCache {
            tracing::warn!("[router] cache_miss_redirect on a live stream, treating as connection loss");
            self.metric.record_connection_error();
            self.update(|s| reducer::apply_connection_error(s, "unexpected redirect on live stream", true));
            return;
        }

        tracing::info!("[router] cached replay redirected, switching to live");
        self.metric.record_substream();
        self.transition(RouterPhase::Live);
        self.update(StreamState::switch_to_live);
        let url = self
            .config
            .live_stream_url(&self.analysis_id, self.request.research_enabled);
        self.open(url);
    }

    fn open(&mut self, url: Result<reqwest::Url>) {
        self.close_connection();
        self.update(StreamState::connecting);
        let opened = url.and_then(|u| self.transport.open(u.as_str()));
        match opened {
            Ok(connection) => {
                tracing::info!(
                    "[router] opened {} (connection {})",
                    crate::redaction::redact_url(connection.url()),
                    connection.id()
                );
                self.connection = Some(connection);
            }
            Err(e) => {
                tracing::error!("[router] could not open stream: {}", e);
                self.metric.record_connection_error();
                let retryable = e.inner.is_transient();
                self.update(|s| reducer::apply_connection_error(s, &e.to_string(), retryable));
            }
        }
    }

    fn close_connection(&mut self) -> bool {
        match self.connection.take() {
            Some(mut connection) => connection.close(),
            None => false,
        }
    }

    fn finish_cancelled(&mut self) {
        if self.phase.is_final() {
            return;
        }
        self.close_connection();
        self.update(StreamState::disconnected);
        self.transition(RouterPhase::Cancelled);
    }

    fn report_final(&mut self) -> Option<RouterPhase> {
        if self.final_reported {
            return None;
        }
        self.final_reported = true;
        self.metric.log_summary(&self.analysis_id, self.phase, &self.state);
        Some(self.phase)
    }

    fn transition(&mut self, next: RouterPhase) {
        if self.phase.is_final() {
            return;
        }
        tracing::info!("[router] {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn update(&mut self, f: impl FnOnce(StreamState) -> StreamState) {
        let prior = std::mem::replace(
            &mut self.state,
            StreamState::new_attempt(self.analysis_id.clone(), CacheStatus::Unknown),
        );
        self.state = f(prior);
    }
}

impl<T, P> Drop for WatchSession<T, P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Keeps at most one session per analysis id.
pub struct Watcher<T, P> {
    router: DeliveryRouter<T, P>,
    sessions: HashMap<AnalysisId, WatchSession<T, P>>,
}

impl<T: Transport, P: CacheProbe> Watcher<T, P> {
    pub fn new(router: DeliveryRouter<T, P>) -> Self {
        Self {
            router,
            sessions: HashMap::new(),
        }
    }

    pub fn router(&self) -> &DeliveryRouter<T, P> {
        &self.router
    }

    /// Starts a fresh session, cancelling and discarding any previous one for
    /// the same id first.
    pub fn watch(&mut self, request: AnalysisRequest, analysis_id: AnalysisId, mode: DeliveryMode) -> &mut WatchSession<T, P> {
        if let Some(mut previous) = self.sessions.remove(&analysis_id) {
            tracing::info!(
                "[watcher] replacing existing watch for {} ({:?})",
                analysis_id.short(),
                previous.phase()
            );
            previous.cancel();
        }
        let session = self.router.watch(request, analysis_id.clone(), mode);
        self.sessions.entry(analysis_id).or_insert(session)
    }

    pub fn session_mut(&mut self, analysis_id: &AnalysisId) -> Option<&mut WatchSession<T, P>> {
        self.sessions.get_mut(analysis_id)
    }

    pub fn cancel(&mut self, analysis_id: &AnalysisId) -> bool {
        match self.sessions.remove(analysis_id) {
            Some(mut session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.cancel();
        }
    }

    pub fn open_connections(&self) -> usize {
        self.sessions.values().filter(|s| s.has_open_connection()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
