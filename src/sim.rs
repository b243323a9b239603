//! In-process stand-in for the analysis backend, used for local development
//! and end-to-end tests.
//!
//! Live streams run a scripted analysis and record the result, so a second
//! request with the same inputs becomes a cache hit. An analysis id containing
//! `fail` produces a failing run. A cached replay for inputs with no stored
//! result answers with `cache_miss_redirect`.

use crate::envelope::{EventEnvelope, EventKind};
use crate::types::*;
use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;

type EventStream = Sse<ReceiverStream<std::result::Result<Event, Infallible>>>;

#[derive(Debug, Clone)]
struct StoredAnalysis {
    analysis_id: AnalysisId,
    result: Value,
    cost_saved: CostUsd,
    processing_time_ms: u64,
}

struct SimInner {
    step_delay: Duration,
    by_fingerprint: RwLock<HashMap<RequestFingerprint, StoredAnalysis>>,
    results: RwLock<HashMap<AnalysisId, Value>>,
    next_event_id: AtomicU64,
}

#[derive(Clone)]
pub struct SimState {
    inner: Arc<SimInner>,
}

impl SimState {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            inner: Arc::new(SimInner {
                step_delay,
                by_fingerprint: RwLock::new(HashMap::new()),
                results: RwLock::new(HashMap::new()),
                next_event_id: AtomicU64::new(1),
            }),
        }
    }

    /// Stores a finished analysis as if a live run had produced it.
    pub fn seed(&self, request: &AnalysisRequest, result: Value, cost_saved: f64) -> AnalysisId {
        let analysis_id = request.new_analysis_id();
        self.store(&analysis_id, request.fingerprint(), result, cost_saved, 1200);
        analysis_id
    }

    pub fn result_count(&self) -> usize {
        self.inner.results.read().map(|r| r.len()).unwrap_or(0)
    }

    fn store(
        &self,
        analysis_id: &AnalysisId,
        fingerprint: RequestFingerprint,
        result: Value,
        cost_saved: f64,
        processing_time_ms: u64,
    ) {
        if let Ok(mut results) = self.inner.results.write() {
            results.insert(analysis_id.clone(), result.clone());
        }
        if let Ok(mut cache) = self.inner.by_fingerprint.write() {
            cache.insert(
                fingerprint,
                StoredAnalysis {
                    analysis_id: analysis_id.clone(),
                    result,
                    cost_saved: CostUsd(cost_saved),
                    processing_time_ms,
                },
            );
        }
    }

    fn complete(&self, analysis_id: AnalysisId, result: Value) {
        match analysis_id.fingerprint() {
            Some(fp) => self.store(&analysis_id, fp, result, 0.35, 4200),
            None => {
                if let Ok(mut results) = self.inner.results.write() {
                    results.insert(analysis_id, result);
                }
            }
        }
    }

    fn lookup(&self, fingerprint: &RequestFingerprint) -> Option<StoredAnalysis> {
        self.inner
            .by_fingerprint
            .read()
            .ok()
            .and_then(|c| c.get(fingerprint).cloned())
    }

    fn event_id(&self) -> String {
        self.inner.next_event_id.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

pub fn router(state: SimState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/api/cache/check", post(cache_check))
        .route("/api/stream/cached/:id", get(cached_stream))
        .route("/api/stream/:id", get(live_stream))
        .route("/api/results/:id", get(fetch_result))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: SimState) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("[sim] simulated backend listening on http://{}", addr);
    }
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CacheCheckBody {
    competitors: Vec<String>,
    focus_area: String,
}

async fn cache_check(
    State(state): State<SimState>,
    Json(body): Json<CacheCheckBody>,
) -> std::result::Result<Json<Value>, ObservedError> {
    let request = AnalysisRequest::new(body.competitors, &body.focus_area)?;
    let answer = match state.lookup(&request.fingerprint()) {
        Some(stored) => json!({
            "cached": true,
            "analysis_id": stored.analysis_id,
            "cost_saved": stored.cost_saved.0,
            "processing_time": stored.processing_time_ms,
            "result": stored.result,
        }),
        None => json!({"cached": false}),
    };
    tracing::debug!("[sim] cache check {} -> {}", request.fingerprint().0, answer["cached"]);
    Ok(Json(answer))
}

#[derive(Debug, Deserialize)]
struct CachedStreamQuery {
    competitors: String,
    focus_area: String,
}

async fn cached_stream(
    State(state): State<SimState>,
    Path(id): Path<String>,
    Query(query): Query<CachedStreamQuery>,
) -> std::result::Result<EventStream, ObservedError> {
    let request = AnalysisRequest::new(query.competitors.split(','), &query.focus_area)?;
    let analysis_id = AnalysisId::from(id);

    let script = match state.lookup(&request.fingerprint()) {
        Some(stored) => {
            tracing::info!("[sim] replaying cached analysis for {}", analysis_id.short());
            let mut hit = EventEnvelope::new(EventKind::CacheHit)
                .with_message("Loaded cached analysis")
                .with_progress(50)
                .with_cost_saved(stored.cost_saved.0);
            hit.cached = Some(true);
            vec![
                EventEnvelope::new(EventKind::Connected),
                hit,
                EventEnvelope::new(EventKind::StreamingComplete)
                    .with_message("Cached analysis delivered")
                    .with_progress(100),
            ]
        }
        None => {
            tracing::info!("[sim] no cached result for {}, redirecting", analysis_id.short());
            vec![
                EventEnvelope::new(EventKind::Connected),
                EventEnvelope::new(EventKind::CacheMissRedirect).with_message("No cached result, switching to live"),
            ]
        }
    };
    Ok(stream_script(state, script, None))
}

#[derive(Debug, Deserialize)]
struct LiveStreamQuery {
    #[serde(default)]
    research: bool,
}

async fn live_stream(
    State(state): State<SimState>,
    Path(id): Path<String>,
    Query(query): Query<LiveStreamQuery>,
) -> EventStream {
    let analysis_id = AnalysisId::from(id);
    let failing = analysis_id.as_str().contains("fail");
    tracing::info!(
        "[sim] live analysis {} (research: {}, failing: {})",
        analysis_id.short(),
        query.research,
        failing
    );

    let mut script = vec![
        EventEnvelope::new(EventKind::Connected),
        EventEnvelope::new(EventKind::AnalysisStarted)
            .with_message("Analysis started")
            .with_progress(5),
        EventEnvelope::new(EventKind::NodeExecution)
            .with_message("Researching competitors")
            .with_progress(20),
    ];
    if query.research {
        script.push(
            EventEnvelope::new(EventKind::SearchProgress)
                .with_message("Searching external sources")
                .with_progress(40),
        );
    }
    if failing {
        script.push(EventEnvelope::new(EventKind::Error).with_error("upstream API timeout"));
        return stream_script(state, script, None);
    }

    let mut insight = EventEnvelope::new(EventKind::InsightDiscovered).with_progress(60);
    insight
        .extra
        .insert("insight".into(), json!("Competitors underinvest in patient onboarding"));
    let mut opportunity = EventEnvelope::new(EventKind::OpportunityGenerated).with_progress(85);
    opportunity
        .extra
        .insert("opportunity".into(), json!("Launch a guided onboarding program"));
    script.push(insight);
    script.push(opportunity);
    script.push(
        EventEnvelope::new(EventKind::AnalysisCompleted)
            .with_message("Analysis complete")
            .with_progress(100),
    );

    let result = json!({
        "analysis_id": analysis_id,
        "insights": ["Competitors underinvest in patient onboarding"],
        "opportunities": ["Launch a guided onboarding program"],
        "research_enabled": query.research,
    });
    stream_script(state, script, Some((analysis_id, result)))
}

async fn fetch_result(
    State(state): State<SimState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Value>, ObservedError> {
    let analysis_id = AnalysisId::from(id);
    let found = state
        .inner
        .results
        .read()
        .ok()
        .and_then(|r| r.get(&analysis_id).cloned());
    match found {
        Some(result) => Ok(Json(result)),
        None => Err(VantageError::NotFound(format!("no result for analysis {}", analysis_id)).into()),
    }
}

/// Emits the script with event ids and sequence numbers, pausing between
/// frames. A completing script stores its result under the id and the
/// fingerprint before the terminal frame goes out.
fn stream_script(state: SimState, script: Vec<EventEnvelope>, mut completion: Option<(AnalysisId, Value)>) -> EventStream {
    let (tx, rx) = mpsc::channel(crate::constants::SIGNAL_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        for (idx, mut envelope) in script.into_iter().enumerate() {
            envelope.sequence = Some(idx as u64 + 1);
            envelope.event_id = Some(state.event_id());

            if envelope.kind.is_terminal_success() {
                if let Some((analysis_id, result)) = completion.take() {
                    state.complete(analysis_id, result);
                }
            }

            let copies = if envelope.kind == EventKind::NodeExecution { 2 } else { 1 };
            // at-least-once delivery: node frames go out twice
            for _ in 0..copies {
                let frame = match encode(&envelope) {
                    Some(f) => f,
                    None => break,
                };
                if tx.send(Ok(frame)).await.is_err() {
                    tracing::debug!("[sim] client went away");
                    return;
                }
            }
            if !state.inner.step_delay.is_zero() {
                tokio::time::sleep(state.inner.step_delay).await;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

fn encode(envelope: &EventEnvelope) -> Option<Event> {
    match Event::default().event(envelope.kind.as_str()).json_data(envelope) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!("[sim] could not encode {}: {}", envelope.kind.as_str(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    fn demo_request() -> AnalysisRequest {
        AnalysisRequest::new(["acme", "globex"], "oncology").unwrap()
    }

    #[tokio::test]
    async fn test_cache_check_miss_then_hit() {
        let state = SimState::new(Duration::ZERO);
        let check = || {
            Request::builder()
                .method("POST")
                .uri("/api/cache/check")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"competitors":["Globex","acme"],"focus_area":"Oncology"}"#))
                .unwrap()
        };

        let response = router(state.clone()).oneshot(check()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["cached"], false);

        state.seed(&demo_request(), json!({"ok": true}), 0.42);

        let response = router(state).oneshot(check()).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["cached"], true);
        assert_eq!(json["cost_saved"], 0.42);
        assert_eq!(json["result"]["ok"], true);
    }

    #[tokio::test]
    async fn test_cache_check_rejects_empty_competitors() {
        let response = router(SimState::new(Duration::ZERO))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cache/check")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"competitors":[],"focus_area":"oncology"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_result_is_404() {
        let response = router(SimState::new(Duration::ZERO))
            .oneshot(Request::builder().uri("/api/results/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cached_stream_without_entry_redirects() {
        let response = router(SimState::new(Duration::ZERO))
            .oneshot(
                Request::builder()
                    .uri("/api/stream/cached/abc?competitors=acme,globex&focus_area=oncology")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: cache_miss_redirect"));
        assert!(!text.contains("streaming_complete"));
    }

    #[tokio::test]
    async fn test_live_stream_stores_result() {
        let state = SimState::new(Duration::ZERO);
        let id = demo_request().new_analysis_id();
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri(format!("/api/stream/{}?research=true", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: search_progress"));
        assert!(text.contains("event: analysis_completed"));

        assert_eq!(state.result_count(), 1);
        assert!(state.lookup(&demo_request().fingerprint()).is_some());
    }
}
