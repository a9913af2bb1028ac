// Execution delegator
//
// The retry/failover state machine. Attempts are strictly sequential: one
// candidate at a time, picked uniformly at random among the unattempted
// on-prem members, with the cluster (when present in a mixed set) left for
// last. Only failures before stream commit are retried; the cluster as a
// sole target gets exactly one attempt because there is nothing to fail
// over to.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::models::{Backend, CandidateSet, QueryKind};
use crate::services::execution::{BackendExecutor, ExecutionError, QueryStream};

pub struct ExecutionDelegator {
    executors: HashMap<Backend, Arc<dyn BackendExecutor>>,
}

impl ExecutionDelegator {
    pub fn new(executors: HashMap<Backend, Arc<dyn BackendExecutor>>) -> Self {
        Self { executors }
    }

    fn executor(&self, backend: Backend) -> Result<&Arc<dyn BackendExecutor>, ExecutionError> {
        self.executors.get(&backend).ok_or_else(|| {
            ExecutionError::terminal(backend, "no executor configured for backend")
        })
    }

    /// Execute a query and return its committed CSV stream, failing over
    /// across the candidate set on transient errors.
    pub async fn execute_stream(
        &self,
        sql: &str,
        candidates: &CandidateSet,
        token: CancellationToken,
    ) -> Result<QueryStream, ExecutionError> {
        if token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        if candidates.is_empty() {
            return match candidates.kind {
                // A stored-procedure call with no resolved location still
                // runs once against the canonical server, without retry.
                QueryKind::StoredProcedure => {
                    tracing::debug!("stored procedure with no candidates, defaulting to {}", Backend::CANONICAL);
                    self.executor(Backend::CANONICAL)?
                        .begin_stream(sql, token)
                        .await
                }
                QueryKind::AdHoc => Err(ExecutionError::NoCandidates),
            };
        }

        if candidates.cluster_only() {
            // single warehouse instance: failures surface directly
            return self.executor(Backend::Cluster)?.begin_stream(sql, token).await;
        }

        let mut remaining = candidates.backends.clone();
        let mut attempts = 0usize;
        let mut last_error = String::new();

        while let Some(backend) = next_candidate(&mut remaining) {
            if token.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            attempts += 1;

            match self
                .executor(backend)?
                .begin_stream(sql, token.clone())
                .await
            {
                Ok(stream) => {
                    tracing::info!("query streaming from {} after {} attempt(s)", backend, attempts);
                    return Ok(stream);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "attempt {} on {} failed, {} candidate(s) remain: {}",
                        attempts,
                        backend,
                        remaining.len(),
                        e
                    );
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(ExecutionError::Exhausted {
            attempts,
            last: last_error,
        })
    }

    /// Execute a single-value query (count queries) with the same
    /// candidate-selection and retry rules as streaming execution.
    pub async fn execute_scalar(
        &self,
        sql: &str,
        candidates: &CandidateSet,
        token: CancellationToken,
    ) -> Result<i64, ExecutionError> {
        if token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        if candidates.is_empty() {
            return match candidates.kind {
                QueryKind::StoredProcedure => {
                    self.executor(Backend::CANONICAL)?.fetch_scalar(sql, token).await
                }
                QueryKind::AdHoc => Err(ExecutionError::NoCandidates),
            };
        }

        if candidates.cluster_only() {
            return self.executor(Backend::Cluster)?.fetch_scalar(sql, token).await;
        }

        let mut remaining = candidates.backends.clone();
        let mut attempts = 0usize;
        let mut last_error = String::new();

        while let Some(backend) = next_candidate(&mut remaining) {
            if token.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            attempts += 1;

            match self.executor(backend)?.fetch_scalar(sql, token.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::warn!("count attempt {} on {} failed: {}", attempts, backend, e);
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        Err(ExecutionError::Exhausted {
            attempts,
            last: last_error,
        })
    }
}

/// Remove and return the next candidate to attempt: a uniform random pick
/// among the remaining on-prem members, falling back to the cluster only
/// once every on-prem candidate has been tried.
fn next_candidate(remaining: &mut Vec<Backend>) -> Option<Backend> {
    if remaining.is_empty() {
        return None;
    }
    let on_prem: Vec<usize> = remaining
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_on_prem())
        .map(|(i, _)| i)
        .collect();

    let idx = if on_prem.is_empty() {
        0
    } else {
        on_prem[rand::rng().random_range(0..on_prem.len())]
    };
    Some(remaining.remove(idx))
}
