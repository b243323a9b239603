//! Client-side fold of a stream into displayable state.
//!
//! All mutation goes through the functions here: [`reduce`] for business
//! envelopes, the `apply_*` helpers for transport signals, and the explicit
//! reset constructors used by the router when a new attempt or sub-stream
//! begins. Each takes the prior state by value and returns the next one.

use crate::envelope::{DedupKey, EventEnvelope, EventKind};
use crate::types::AnalysisId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Unknown,
    Checking,
    Hit,
    Miss,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFault {
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub duplicate: bool,
    /// Sub-stream the envelope arrived on.
    #[serde(default)]
    pub substream: u32,
    #[serde(flatten)]
    pub envelope: EventEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insight {
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub analysis_id: AnalysisId,
    pub connection_status: ConnectionStatus,
    pub run_status: RunStatus,
    pub progress: u8,
    pub current_message: Option<String>,
    pub cache_status: CacheStatus,
    pub cost_saved: f64,
    pub error_message: Option<String>,
    pub connection_error: Option<ConnectionFault>,
    pub event_log: Vec<LoggedEvent>,
    pub insights: Vec<Insight>,
    pub last_event_at: Option<DateTime<Utc>>,
    /// Sub-streams folded into this state; bumps on a cache-miss switch.
    pub substream: u32,
    /// Reconnects made before this attempt started.
    pub attempt: u32,
    #[serde(skip)]
    seen: HashSet<DedupKey>,
}

impl StreamState {
    /// State for a brand-new attempt. Replaces whatever came before.
    pub fn new_attempt(analysis_id: AnalysisId, cache_status: CacheStatus) -> Self {
        Self {
            analysis_id,
            connection_status: ConnectionStatus::Disconnected,
            run_status: RunStatus::Idle,
            progress: 0,
            current_message: None,
            cache_status,
            cost_saved: 0.0,
            error_message: None,
            connection_error: None,
            event_log: Vec::new(),
            insights: Vec::new(),
            last_event_at: None,
            substream: 0,
            attempt: 0,
            seen: HashSet::new(),
        }
    }

    /// Empty state for the attempt after this one.
    pub fn next_attempt(&self, cache_status: CacheStatus) -> Self {
        let mut next = Self::new_attempt(self.analysis_id.clone(), cache_status);
        next.attempt = self.attempt + 1;
        next
    }

    pub fn is_done(&self) -> bool {
        self.run_status.is_terminal()
    }

    pub fn duplicate_count(&self) -> usize {
        self.event_log.iter().filter(|e| e.duplicate).count()
    }

    /// Connection is being opened.
    pub fn connecting(mut self) -> Self {
        self.connection_status = ConnectionStatus::Connecting;
        self.connection_error = None;
        self
    }

    pub fn with_cache_status(mut self, cache_status: CacheStatus) -> Self {
        self.cache_status = cache_status;
        self
    }

    /// Fresh live sub-stream after a cache miss discovered mid-replay.
    ///
    /// Sequence numbers do not continue across the switch, so progress,
    /// message, insights and the dedup window restart. The event log is kept.
    pub fn switch_to_live(mut self) -> Self {
        self.progress = 0;
        self.current_message = None;
        self.insights.clear();
        self.seen.clear();
        self.cache_status = CacheStatus::Live;
        self.connection_status = ConnectionStatus::Connecting;
        self.connection_error = None;
        if !self.run_status.is_terminal() {
            self.run_status = RunStatus::Running;
        }
        self.substream += 1;
        self
    }

    pub fn disconnected(mut self) -> Self {
        self.connection_status = ConnectionStatus::Disconnected;
        self
    }
}

pub fn reduce(prior: StreamState, envelope: &EventEnvelope) -> StreamState {
    reduce_at(prior, envelope, Utc::now())
}

/// [`reduce`] with an explicit receipt time.
pub fn reduce_at(mut state: StreamState, envelope: &EventEnvelope, received_at: DateTime<Utc>) -> StreamState {
    let key = envelope.dedup_key();
    let duplicate = state.seen.contains(&key);

    state.event_log.push(LoggedEvent {
        received_at,
        duplicate,
        substream: state.substream,
        envelope: envelope.clone(),
    });
    state.last_event_at = Some(received_at);

    if state.run_status.is_terminal() {
        tracing::debug!(
            "[reducer] {} ignoring {} after terminal state {:?}",
            state.analysis_id.short(),
            envelope.kind.as_str(),
            state.run_status
        );
        return state;
    }
    if duplicate {
        tracing::debug!(
            "[reducer] {} duplicate {} skipped",
            state.analysis_id.short(),
            envelope.kind.as_str()
        );
        return state;
    }
    state.seen.insert(key);

    if state.run_status == RunStatus::Idle {
        state.run_status = RunStatus::Running;
    }

    if let Some(progress) = envelope.progress {
        if progress < state.progress {
            tracing::debug!(
                "[reducer] {} progress regression {} -> {} ignored",
                state.analysis_id.short(),
                state.progress,
                progress
            );
        } else {
            state.progress = progress;
        }
    }

    if let Some(message) = envelope.message.as_deref().filter(|m| !m.is_empty()) {
        state.current_message = Some(message.to_string());
    }

    if let Some(cost) = envelope.cost_saved.filter(|c| c.is_finite()) {
        state.cost_saved = cost;
    }

    if state.cache_status != CacheStatus::Live
        && (envelope.cached == Some(true) || envelope.cache_hit == Some(true))
    {
        state.cache_status = CacheStatus::Hit;
    }

    match &envelope.kind {
        EventKind::Connected => {
            state.connection_status = ConnectionStatus::Connected;
        }
        EventKind::CacheHit => {
            if state.cache_status != CacheStatus::Live {
                state.cache_status = CacheStatus::Hit;
            }
        }
        EventKind::CacheMiss | EventKind::CacheMissRedirect => {
            if state.cache_status != CacheStatus::Live {
                state.cache_status = CacheStatus::Miss;
            }
        }
        EventKind::InsightDiscovered | EventKind::OpportunityGenerated => {
            if let Some(text) = envelope.insight_text() {
                let insight = Insight {
                    kind: envelope.kind.as_str().to_string(),
                    text,
                };
                if !state.insights.contains(&insight) {
                    state.insights.push(insight);
                }
            }
        }
        EventKind::Error => {
            state.run_status = RunStatus::Failed;
            let text = envelope
                .error
                .clone()
                .or_else(|| envelope.message.clone())
                .unwrap_or_else(|| "analysis failed".to_string());
            state.error_message = Some(text);
        }
        kind if kind.is_terminal_success() => {
            state.run_status = RunStatus::Completed;
        }
        _ => {}
    }

    state
}

pub fn apply_connected(mut state: StreamState) -> StreamState {
    state.connection_status = ConnectionStatus::Connected;
    state.connection_error = None;
    state
}

/// Transport failure. Never touches `run_status`.
pub fn apply_connection_error(mut state: StreamState, message: &str, retryable: bool) -> StreamState {
    state.connection_status = ConnectionStatus::Disconnected;
    state.connection_error = Some(ConnectionFault {
        message: message.to_string(),
        retryable,
    });
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> StreamState {
        StreamState::new_attempt(AnalysisId::from("abc123def4567890-0011aabb"), CacheStatus::Unknown)
    }

    fn env(json: &str) -> EventEnvelope {
        match EventEnvelope::parse(json, None, None) {
            Ok(e) => e,
            Err(e) => panic!("bad fixture {}: {}", json, e),
        }
    }

    fn fold(state: StreamState, frames: &[&str]) -> StreamState {
        frames.iter().fold(state, |s, f| reduce(s, &env(f)))
    }

    #[test]
    fn test_cache_hit_replay_scenario() {
        let state = fresh().with_cache_status(CacheStatus::Hit).connecting();
        let state = fold(
            state,
            &[
                r#"{"type":"connected","timestamp":"2024-05-01T10:00:00Z"}"#,
                r#"{"type":"cache_hit","progress":50,"cost_saved":0.42,"timestamp":"2024-05-01T10:00:01Z"}"#,
                r#"{"type":"streaming_complete","progress":100,"timestamp":"2024-05-01T10:00:02Z"}"#,
            ],
        );

        assert_eq!(state.connection_status, ConnectionStatus::Connected);
        assert_eq!(state.run_status, RunStatus::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(state.cache_status, CacheStatus::Hit);
        assert_eq!(state.cost_saved, 0.42);
        assert_eq!(state.event_log.len(), 3);
    }

    #[test]
    fn test_live_failure_scenario_keeps_progress() {
        let state = fold(
            fresh().with_cache_status(CacheStatus::Live),
            &[
                r#"{"type":"connected","timestamp":"t0"}"#,
                r#"{"type":"node_execution","message":"Researching competitor A","progress":20,"timestamp":"t1"}"#,
                r#"{"type":"search_progress","progress":45,"timestamp":"t2"}"#,
                r#"{"type":"error","error":"upstream API timeout","timestamp":"t3"}"#,
            ],
        );

        assert_eq!(state.run_status, RunStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("upstream API timeout"));
        assert_eq!(state.progress, 45);
        assert_eq!(state.current_message.as_deref(), Some("Researching competitor A"));
    }

    #[test]
    fn test_terminal_state_is_absorbing() {
        let state = fold(
            fresh(),
            &[
                r#"{"type":"analysis_completed","progress":90,"timestamp":"t1"}"#,
                r#"{"type":"node_execution","progress":95,"message":"late","timestamp":"t2"}"#,
                r#"{"type":"error","error":"late failure","timestamp":"t3"}"#,
            ],
        );

        assert_eq!(state.run_status, RunStatus::Completed);
        assert_eq!(state.progress, 90);
        assert_eq!(state.error_message, None);
        assert_eq!(state.current_message, None);
        assert_eq!(state.event_log.len(), 3);
    }

    #[test]
    fn test_error_without_text_gets_generic_message() {
        let state = fold(fresh(), &[r#"{"type":"error","timestamp":"t"}"#]);
        assert_eq!(state.run_status, RunStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("analysis failed"));
    }

    #[test]
    fn test_duplicate_event_id_does_not_duplicate_insights() {
        let frame = r#"{"type":"insight_discovered","event_id":"ev-1","insight":"No pediatric dosing data","timestamp":"t"}"#;
        let state = fold(fresh(), &[frame, frame]);

        assert_eq!(state.insights.len(), 1);
        assert_eq!(state.event_log.len(), 2);
        assert_eq!(state.duplicate_count(), 1);
    }

    #[test]
    fn test_content_dedup_without_ids() {
        let frame = r#"{"type":"opportunity_generated","message":"Bundle pricing","timestamp":"2024-01-01T00:00:00Z"}"#;
        let later = r#"{"type":"opportunity_generated","message":"Bundle pricing","timestamp":"2024-01-01T00:00:09Z"}"#;
        let state = fold(fresh(), &[frame, frame, later]);

        // the third frame is a distinct event but carries the same text
        assert_eq!(state.insights.len(), 1);
        assert_eq!(state.duplicate_count(), 1);
    }

    #[test]
    fn test_bare_progress_frames_are_not_duplicates() {
        let state = fold(
            fresh(),
            &[
                r#"{"type":"search_progress","progress":20}"#,
                r#"{"type":"search_progress","progress":45}"#,
            ],
        );
        assert_eq!(state.progress, 45);
        assert_eq!(state.duplicate_count(), 0);

        // a byte-for-byte repeat is still recognised
        let state = fold(state, &[r#"{"type":"search_progress","progress":45}"#]);
        assert_eq!(state.duplicate_count(), 1);
    }

    #[test]
    fn test_next_attempt_counts_and_starts_empty() {
        let state = fold(fresh(), &[r#"{"type":"node_execution","progress":30,"sequence":1}"#]);
        let next = state.next_attempt(CacheStatus::Live);
        assert_eq!(next.attempt, 1);
        assert_eq!(next.progress, 0);
        assert!(next.event_log.is_empty());
        assert_eq!(next.cache_status, CacheStatus::Live);
        assert_eq!(next.next_attempt(CacheStatus::Live).attempt, 2);
    }

    #[test]
    fn test_unknown_and_unrelated_events_are_sticky_noops() {
        let state = fold(
            fresh(),
            &[
                r#"{"type":"node_execution","message":"Mapping market","progress":30,"timestamp":"t1"}"#,
                r#"{"type":"quantum_flux","timestamp":"t2"}"#,
                r#"{"type":"heartbeat","timestamp":"t3"}"#,
                r#"{"type":"search_progress","message":"","timestamp":"t4"}"#,
            ],
        );

        assert_eq!(state.progress, 30);
        assert_eq!(state.current_message.as_deref(), Some("Mapping market"));
        assert_eq!(state.event_log.len(), 4);
        assert_eq!(state.run_status, RunStatus::Running);
    }

    #[test]
    fn test_progress_never_decreases_for_random_sequences() {
        let kinds = ["node_execution", "search_progress", "progress", "insight_discovered", "heartbeat"];
        for seed in 0..50u64 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut state = fresh();
            let mut shown = 0u8;
            for i in 0..40 {
                let kind = kinds[rng.usize(..kinds.len())];
                let frame = if rng.bool() {
                    format!(r#"{{"type":"{}","progress":{},"sequence":{}}}"#, kind, rng.i32(-20..130), i)
                } else {
                    format!(r#"{{"type":"{}","sequence":{}}}"#, kind, i)
                };
                state = reduce(state, &env(&frame));
                assert!(state.progress >= shown, "seed {} step {} regressed", seed, i);
                assert!(state.progress <= 100);
                shown = state.progress;
            }
        }
    }

    #[test]
    fn test_switch_to_live_resets_substream_but_keeps_log() {
        let state = fold(
            fresh().with_cache_status(CacheStatus::Hit),
            &[
                r#"{"type":"connected","sequence":1}"#,
                r#"{"type":"progress","progress":40,"message":"replaying","sequence":2}"#,
                r#"{"type":"cache_miss_redirect","sequence":3}"#,
            ],
        );
        assert_eq!(state.cache_status, CacheStatus::Miss);
        assert_eq!(state.run_status, RunStatus::Running);

        let state = state.switch_to_live();
        assert_eq!(state.cache_status, CacheStatus::Live);
        assert_eq!(state.progress, 0);
        assert_eq!(state.current_message, None);
        assert_eq!(state.event_log.len(), 3);
        assert_eq!(state.substream, 1);

        // sequence numbers restart on the new sub-stream and must not be seen as duplicates
        let state = fold(
            state,
            &[
                r#"{"type":"connected","sequence":1}"#,
                r#"{"type":"node_execution","progress":10,"sequence":2}"#,
            ],
        );
        assert_eq!(state.progress, 10);
        assert_eq!(state.duplicate_count(), 0);
        assert_eq!(state.cache_status, CacheStatus::Live);
        let substreams: Vec<u32> = state.event_log.iter().map(|e| e.substream).collect();
        assert_eq!(substreams, vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_cache_flags_do_not_override_live() {
        let state = fold(
            fresh().with_cache_status(CacheStatus::Live),
            &[r#"{"type":"cache_hit","cached":true,"cost_saved":1.5}"#],
        );
        assert_eq!(state.cache_status, CacheStatus::Live);
        assert_eq!(state.cost_saved, 1.5);
    }

    #[test]
    fn test_connection_error_is_not_a_run_failure() {
        let state = fold(fresh().connecting(), &[r#"{"type":"node_execution","progress":12}"#]);
        let state = apply_connection_error(state, "socket reset", true);

        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(state.run_status, RunStatus::Running);
        assert_eq!(state.error_message, None);
        assert_eq!(
            state.connection_error,
            Some(ConnectionFault {
                message: "socket reset".to_string(),
                retryable: true
            })
        );

        let state = apply_connected(state.connecting());
        assert_eq!(state.connection_status, ConnectionStatus::Connected);
        assert_eq!(state.connection_error, None);
    }
}
