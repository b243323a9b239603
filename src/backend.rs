//! One-shot HTTP calls against the analysis backend: the cache pre-check and
//! the finished-result lookup. Streams go through [`crate::transport`].

use crate::config::ClientConfig;
use crate::types::*;
use serde_json::Value;
use std::future::Future;

pub trait CacheProbe {
    /// Asks whether a finished result exists for the request's fingerprint.
    fn probe(&self, request: &AnalysisRequest) -> impl Future<Output = Result<CachedResultDescriptor>> + Send;
}

pub trait ResultSource {
    /// Single attempt at retrieving a finished payload.
    fn fetch_once(&self, id: &AnalysisId) -> impl Future<Output = Result<AnalysisResult>> + Send;
}

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.timeout(self.config.request_timeout);
        match &self.config.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

impl CacheProbe for HttpBackend {
    async fn probe(&self, request: &AnalysisRequest) -> Result<CachedResultDescriptor> {
        request.validate()?;
        let url = self.config.cache_check_url()?;
        let body = serde_json::json!({
            "competitors": request.competitors,
            "focus_area": request.focus_area,
        });

        let response = self
            .authorize(self.client.post(url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VantageError::Upstream(status, text).into());
        }

        let value: Value = response.json().await?;
        let descriptor = parse_cache_check(&value);
        tracing::debug!(
            "[probe] fingerprint {} cached={} cost_saved={} processing_time_ms={}",
            request.fingerprint().0,
            descriptor.is_cached,
            descriptor.cost_saved,
            descriptor.processing_time_ms
        );
        Ok(descriptor)
    }
}

impl ResultSource for HttpBackend {
    async fn fetch_once(&self, id: &AnalysisId) -> Result<AnalysisResult> {
        let url = self.config.result_url(id)?;
        let response = self.authorize(self.client.get(url)).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(VantageError::NotFound(format!("no result for analysis {}", id)).into());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VantageError::Upstream(status, text).into());
        }

        let payload: Value = response.json().await?;
        Ok(AnalysisResult {
            analysis_id: id.clone(),
            payload,
        })
    }
}

/// Interprets a cache-check response. Anything short of an explicit
/// `cached: true` is a miss.
pub fn parse_cache_check(value: &Value) -> CachedResultDescriptor {
    let explicit_hit = |key: &str| value.get(key).and_then(|v| v.as_bool()) == Some(true);
    if !(explicit_hit("cached") || explicit_hit("cache_hit")) {
        return CachedResultDescriptor::miss();
    }

    let cost_saved = value
        .get("cost_saved")
        .and_then(|v| v.as_f64())
        .filter(|c| c.is_finite() && *c >= 0.0)
        .unwrap_or(0.0);
    let processing_time_ms = value
        .get("processing_time")
        .or_else(|| value.get("processing_time_ms"))
        .and_then(|v| v.as_f64())
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(|t| t.round() as u64)
        .unwrap_or(0);
    let payload = value.get("result").filter(|v| !v.is_null()).cloned();

    CachedResultDescriptor {
        is_cached: true,
        cost_saved: CostUsd(cost_saved),
        processing_time_ms,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_explicit_hit() {
        let d = parse_cache_check(&json!({
            "cached": true,
            "cost_saved": 0.42,
            "processing_time": 1200,
            "result": {"opportunities": []}
        }));
        assert!(d.is_cached);
        assert_eq!(d.cost_saved, CostUsd(0.42));
        assert_eq!(d.processing_time_ms, 1200);
        assert_eq!(d.payload, Some(json!({"opportunities": []})));
    }

    #[test]
    fn test_ambiguous_responses_are_misses() {
        assert_eq!(parse_cache_check(&json!({})), CachedResultDescriptor::miss());
        assert_eq!(parse_cache_check(&json!({"cached": "yes"})), CachedResultDescriptor::miss());
        assert_eq!(parse_cache_check(&json!({"cached": 1})), CachedResultDescriptor::miss());
        assert_eq!(parse_cache_check(&json!({"cost_saved": 3.0})), CachedResultDescriptor::miss());
        assert!(!parse_cache_check(&json!(null)).is_cached);
    }

    #[test]
    fn test_hit_with_missing_metadata_defaults_to_zero() {
        let d = parse_cache_check(&json!({"cached": true, "cost_saved": -1, "result": null}));
        assert!(d.is_cached);
        assert_eq!(d.cost_saved, CostUsd(0.0));
        assert_eq!(d.processing_time_ms, 0);
        assert_eq!(d.payload, None);
    }
}
