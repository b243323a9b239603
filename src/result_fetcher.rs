use crate::backend::ResultSource;
use crate::hardening::RetryPolicy;
use crate::reducer::{RunStatus, StreamState};
use crate::types::*;

/// Retrieves the finished payload of an analysis.
///
/// Transient failures are retried within the policy's bound. A not-found
/// answer is permanent and comes back as [`VantageError::NotFound`]
/// immediately.
pub struct ResultFetcher<S> {
    source: S,
    policy: RetryPolicy,
}

impl<S: ResultSource> ResultFetcher<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetch for an analysis that was never streamed in this session, e.g.
    /// direct navigation to an existing result.
    #[tracing::instrument(name = "result.fetch", skip_all, fields(analysis_id = %id.short()))]
    pub async fn fetch(&self, id: &AnalysisId) -> Result<AnalysisResult> {
        let result = self
            .policy
            .execute_with_retry(|| self.source.fetch_once(id))
            .await;
        match &result {
            Ok(_) => tracing::info!("[fetch] result retrieved"),
            Err(e) => match &e.inner {
                VantageError::NotFound(_) => tracing::warn!("[fetch] results unavailable: {}", e),
                _ => tracing::error!("[fetch] giving up: {}", e),
            },
        }
        result
    }

    /// Fetch after a watch, allowed only once the stream reported completion.
    pub async fn fetch_completed(&self, state: &StreamState) -> Result<AnalysisResult> {
        if state.run_status != RunStatus::Completed {
            return Err(VantageError::Validation(format!(
                "analysis {} has not completed (status {:?})",
                state.analysis_id, state.run_status
            ))
            .into());
        }
        self.fetch(&state.analysis_id).await
    }
}
