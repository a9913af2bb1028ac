// Query router facade
//
// Wires the whole pipeline: validation -> analysis -> candidate
// resolution -> admission control -> delegated execution. Collaborators
// that only need existence or location answers (bulk export, catalog
// tooling) call `analyze`/`resolve` directly without executing anything.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::middleware::AppError;
use crate::models::{CandidateSet, QueryAnalysis, QueryKind, SizeProjection};
use crate::services::admission::AdmissionController;
use crate::services::analyzer;
use crate::services::delegator::ExecutionDelegator;
use crate::services::execution::QueryStream;
use crate::services::resolver;
use crate::services::topology::TopologyCache;
use crate::validation::SqlValidator;

pub struct QueryRouter {
    topology: Arc<TopologyCache>,
    delegator: Arc<ExecutionDelegator>,
    admission: Arc<AdmissionController>,
}

impl QueryRouter {
    pub fn new(
        topology: Arc<TopologyCache>,
        delegator: Arc<ExecutionDelegator>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            topology,
            delegator,
            admission,
        }
    }

    pub fn analyze(&self, query: &str) -> QueryAnalysis {
        analyzer::analyze(query)
    }

    pub async fn resolve(&self, analysis: &QueryAnalysis) -> Result<CandidateSet, AppError> {
        let snapshot = self.topology.snapshot().await;
        resolver::resolve_candidates(analysis, &snapshot).map_err(Into::into)
    }

    /// Standalone admission check: projects the result size without
    /// executing the underlying query (the dry-run mode). A count query
    /// may still be issued when no analytic estimate exists.
    pub async fn check_size(&self, query: &str) -> Result<SizeProjection, AppError> {
        SqlValidator::validate_read_only(query)?;
        let analysis = analyzer::analyze(query);
        let snapshot = self.topology.snapshot().await;
        self.admission
            .check(query, &analysis, &snapshot, CancellationToken::new())
            .await
    }

    /// Drive the full pipeline and return the committed CSV stream along
    /// with the backend that answered.
    pub async fn route_and_stream(
        &self,
        query: &str,
        token: CancellationToken,
    ) -> Result<QueryStream, AppError> {
        SqlValidator::validate_read_only(query)?;
        let analysis = analyzer::analyze(query);
        let snapshot = self.topology.snapshot().await;

        // A procedure outside the data-retrieval allowlist runs unmodified
        // on the canonical server and skips routing entirely.
        if let Some(procedure) = &analysis.procedure {
            if !snapshot.is_data_retrieval_procedure(procedure) {
                tracing::debug!("procedure '{}' is not routable, running on canonical", procedure);
                let default = CandidateSet::new(vec![], QueryKind::StoredProcedure);
                return self
                    .delegator
                    .execute_stream(query, &default, token)
                    .await
                    .map_err(Into::into);
            }
        }

        let candidates = resolver::resolve_candidates(&analysis, &snapshot)?;

        // Admission applies to ad-hoc queries; allowlisted procedures are
        // curated reads and cannot be wrapped in a count query anyway.
        if !analysis.is_stored_procedure() {
            let projection = self
                .admission
                .check(query, &analysis, &snapshot, token.clone())
                .await?;
            if !projection.allowed {
                return Err(AppError::SizeExceeded {
                    estimated_rows: projection.estimated_rows,
                    threshold: projection.threshold,
                    provenance: format!("{:?}", projection.provenance),
                });
            }
        }

        self.delegator
            .execute_stream(query, &candidates, token)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::models::{Backend, DatasetStats};
    use crate::services::execution::{BackendExecutor, ExecutionError, QueryStream};
    use crate::services::topology::{TopologyProvider, TopologySnapshot};

    struct FixedProvider {
        snapshot: TopologySnapshot,
    }

    #[async_trait]
    impl TopologyProvider for FixedProvider {
        async fn fetch_snapshot(&self) -> Result<TopologySnapshot, AppError> {
            Ok(self.snapshot.clone())
        }
    }

    struct RecordingExecutor {
        backend: Backend,
        scalar: i64,
        streams: AtomicUsize,
        scalars: AtomicUsize,
    }

    #[async_trait]
    impl BackendExecutor for RecordingExecutor {
        fn backend(&self) -> Backend {
            self.backend
        }

        async fn begin_stream(
            &self,
            _sql: &str,
            _token: CancellationToken,
        ) -> Result<QueryStream, ExecutionError> {
            self.streams.fetch_add(1, Ordering::SeqCst);
            let (_tx, rx) = mpsc::channel(1);
            Ok(QueryStream::new(self.backend, rx))
        }

        async fn fetch_scalar(
            &self,
            _sql: &str,
            _token: CancellationToken,
        ) -> Result<i64, ExecutionError> {
            self.scalars.fetch_add(1, Ordering::SeqCst);
            Ok(self.scalar)
        }
    }

    fn snapshot() -> TopologySnapshot {
        let tables: HashSet<String> = ["tblargo", "tblwoa", "tbldatasets"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let dataset_ids: HashMap<String, i64> =
            [("tblargo".to_string(), 1), ("tblwoa".to_string(), 2)]
                .into_iter()
                .collect();
        let locations: HashMap<i64, Vec<Backend>> = [
            (1, vec![Backend::Rainier]),
            (2, vec![Backend::Mariana]),
        ]
        .into_iter()
        .collect();
        let procedures: HashSet<String> = ["uspspacetime".to_string()].into_iter().collect();
        let stats: HashMap<i64, DatasetStats> = [(
            1,
            DatasetStats {
                dataset_id: 1,
                row_count: Some(5_000_000),
                temporal_resolution: Some("Irregular".to_string()),
                spatial_resolution: Some("Irregular".to_string()),
                ..Default::default()
            },
        )]
        .into_iter()
        .collect();
        TopologySnapshot::new(tables, dataset_ids, locations, procedures, stats)
    }

    fn build_router(scalar: i64) -> (QueryRouter, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor {
            backend: Backend::Rainier,
            scalar,
            streams: AtomicUsize::new(0),
            scalars: AtomicUsize::new(0),
        });
        let mut executors: HashMap<Backend, Arc<dyn BackendExecutor>> = HashMap::new();
        executors.insert(Backend::Rainier, executor.clone());
        let delegator = Arc::new(ExecutionDelegator::new(executors));
        let topology = Arc::new(TopologyCache::new(
            Arc::new(FixedProvider {
                snapshot: snapshot(),
            }),
            Duration::from_secs(3600),
        ));
        let admission = Arc::new(AdmissionController::new(delegator.clone(), 2_000_000, 4));
        (
            QueryRouter::new(topology, delegator, admission),
            executor,
        )
    }

    #[tokio::test]
    async fn test_core_table_query_streams_from_canonical() {
        let (router, executor) = build_router(100);
        let stream = router
            .route_and_stream(
                "SELECT * FROM tblDatasets",
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(stream.backend, Backend::Rainier);
        assert_eq!(executor.streams.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_query_rejected_before_execution() {
        // irregular dataset: the count query reports more than the limit
        let (router, executor) = build_router(3_000_000);
        let result = router
            .route_and_stream("SELECT * FROM tblArgo", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::SizeExceeded { .. })));
        assert_eq!(executor.scalars.load(Ordering::SeqCst), 1);
        assert_eq!(executor.streams.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_colocated_join_is_incompatible() {
        let (router, _) = build_router(0);
        let result = router
            .route_and_stream(
                "SELECT * FROM tblArgo a JOIN tblWoa b ON a.id = b.id",
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(AppError::Incompatibility(_))));
    }

    #[tokio::test]
    async fn test_unlisted_procedure_runs_on_canonical() {
        let (router, executor) = build_router(0);
        let stream = router
            .route_and_stream("EXEC uspWeekly 'seasonal'", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.backend, Backend::Rainier);
        assert_eq!(executor.streams.load(Ordering::SeqCst), 1);
        // no admission query for procedure calls
        assert_eq!(executor.scalars.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_write_statement_rejected() {
        let (router, executor) = build_router(0);
        let result = router
            .route_and_stream("DELETE FROM tblArgo", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(executor.streams.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_size_is_dry_run() {
        let (router, executor) = build_router(1_000);
        let projection = router.check_size("SELECT * FROM tblArgo").await.unwrap();
        assert!(projection.allowed);
        assert_eq!(executor.scalars.load(Ordering::SeqCst), 1);
        assert_eq!(executor.streams.load(Ordering::SeqCst), 0);
    }
}
