use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// Identifies one analysis request.
///
/// Layout is `<fingerprint>-<suffix>`: the fingerprint is derived from the
/// normalized competitor set and focus area, the suffix disambiguates repeat
/// submissions of the same inputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AnalysisId(pub String);

/// Stable hash of a normalized `(competitors, focus_area)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(pub String);

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct CostUsd(pub f64);

impl fmt::Display for CostUsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AnalysisId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AnalysisId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

const FINGERPRINT_HEX_LEN: usize = 16;
const SUFFIX_LEN: usize = 8;

impl RequestFingerprint {
    pub fn compute(competitors: &[String], focus_area: &str) -> Self {
        let mut hasher = Sha256::new();
        for competitor in competitors {
            hasher.update(competitor.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update(b"::");
        hasher.update(focus_area.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex[..FINGERPRINT_HEX_LEN].to_string())
    }
}

impl AnalysisId {
    pub fn derive(fingerprint: &RequestFingerprint) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", fingerprint.0, &suffix[..SUFFIX_LEN]))
    }

    /// Fingerprint portion of the id, if it was produced by [`AnalysisId::derive`].
    pub fn fingerprint(&self) -> Option<RequestFingerprint> {
        let (head, tail) = self.0.rsplit_once('-')?;
        if head.len() == FINGERPRINT_HEX_LEN && tail.len() == SUFFIX_LEN {
            Some(RequestFingerprint(head.to_string()))
        } else {
            None
        }
    }

    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the caller asks to watch: a competitor set and a focus area.
///
/// Construction normalizes the inputs (trim, lowercase, dedup, sort) so two
/// requests that differ only in spelling of whitespace or ordering share a
/// fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub competitors: Vec<String>,
    pub focus_area: String,
    #[serde(default)]
    pub research_enabled: bool,
}

impl AnalysisRequest {
    pub fn new<I, S>(competitors: I, focus_area: &str) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = competitors
            .into_iter()
            .map(|c| c.as_ref().trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();

        let focus_area = focus_area.trim().to_lowercase();

        let request = Self {
            competitors: normalized,
            focus_area,
            research_enabled: false,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_research(mut self, enabled: bool) -> Self {
        self.research_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.competitors.is_empty() {
            return Err(VantageError::Validation("competitor set must not be empty".into()).into());
        }
        if self.focus_area.is_empty() {
            return Err(VantageError::Validation("focus area must not be empty".into()).into());
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> RequestFingerprint {
        RequestFingerprint::compute(&self.competitors, &self.focus_area)
    }

    pub fn new_analysis_id(&self) -> AnalysisId {
        AnalysisId::derive(&self.fingerprint())
    }
}

/// Finished analysis payload. The business content is opaque to this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub analysis_id: AnalysisId,
    pub payload: serde_json::Value,
}

/// Answer of the cache pre-check.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CachedResultDescriptor {
    pub is_cached: bool,
    pub cost_saved: CostUsd,
    pub processing_time_ms: u64,
    pub payload: Option<serde_json::Value>,
}

impl CachedResultDescriptor {
    pub fn miss() -> Self {
        Self::default()
    }
}

#[derive(Error, Debug)]
pub enum VantageError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Results unavailable: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl VantageError {
    /// Whether a repeat of the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            VantageError::Network(_) | VantageError::Io(_) => true,
            VantageError::Upstream(status, _) => {
                crate::constants::RETRYABLE_STATUS_CODES.contains(&status.as_u16())
            }
            _ => false,
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            VantageError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            VantageError::Validation(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "VALIDATION_ERROR",
            ),
            VantageError::NotFound(m) => {
                (axum::http::StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND")
            }
            VantageError::Protocol(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "PROTOCOL_ERROR",
            ),
            VantageError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            VantageError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            VantageError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            VantageError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: VantageError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<VantageError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_normalization_is_order_and_case_insensitive() {
        let a = match AnalysisRequest::new(["Acme ", "globex", "ACME"], " Oncology") {
            Ok(r) => r,
            Err(e) => panic!("unexpected error: {}", e),
        };
        let b = match AnalysisRequest::new(["Globex", "acme"], "oncology") {
            Ok(r) => r,
            Err(e) => panic!("unexpected error: {}", e),
        };

        assert_eq!(a.competitors, vec!["acme".to_string(), "globex".to_string()]);
        assert_eq!(a.focus_area, "oncology");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_request_rejects_empty_inputs() {
        assert!(AnalysisRequest::new(Vec::<String>::new(), "oncology").is_err());
        assert!(AnalysisRequest::new(["  "], "oncology").is_err());
        assert!(AnalysisRequest::new(["acme"], "   ").is_err());
    }

    #[test]
    fn test_analysis_ids_share_fingerprint_but_differ() {
        let request = match AnalysisRequest::new(["acme"], "cardiology") {
            Ok(r) => r,
            Err(e) => panic!("unexpected error: {}", e),
        };
        let first = request.new_analysis_id();
        let second = request.new_analysis_id();

        assert_ne!(first, second);
        assert_eq!(first.fingerprint(), Some(request.fingerprint()));
        assert_eq!(second.fingerprint(), Some(request.fingerprint()));
        assert_eq!(first.short().len(), 8);
    }

    #[test]
    fn test_foreign_ids_have_no_fingerprint() {
        assert_eq!(AnalysisId::from("analysis_123").fingerprint(), None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(VantageError::Upstream(axum::http::StatusCode::BAD_GATEWAY, "x".into()).is_transient());
        assert!(!VantageError::Upstream(axum::http::StatusCode::NOT_IMPLEMENTED, "x".into()).is_transient());
        assert!(VantageError::Upstream(axum::http::StatusCode::TOO_MANY_REQUESTS, "x".into()).is_transient());
        assert!(!VantageError::Upstream(axum::http::StatusCode::BAD_REQUEST, "x".into()).is_transient());
        assert!(!VantageError::NotFound("gone".into()).is_transient());
    }
}
