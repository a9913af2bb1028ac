// Per-backend query execution
//
// One executor per physical backend, all behind the `BackendExecutor`
// seam so the delegator (and its tests) never care which driver sits
// underneath. An executor commits to a stream only after the first
// row/recordset event has arrived; everything before that point is
// retriable by the delegator without the caller having observed anything.

pub mod cluster;
pub mod onprem;
pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::api::middleware::AppError;
use crate::models::Backend;

/// How many encoded CSV batches may sit unconsumed between the pump task
/// and the transport. Together with the row batch size this bounds
/// buffered-but-unflushed rows for multi-million-row exports.
pub const CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A specific backend failed before its stream was committed; the
    /// delegator may retry the remaining candidates.
    #[error("backend {backend} failed: {message}")]
    Transient { backend: Backend, message: String },

    /// Unrecoverable failure on one backend.
    #[error("backend {backend} failed: {message}")]
    Terminal { backend: Backend, message: String },

    /// The query cannot be expressed for the target backend.
    #[error("{0}")]
    Unsupported(String),

    #[error("no candidate servers for query")]
    NoCandidates,

    #[error("all {attempts} candidate servers failed; last error: {last}")]
    Exhausted { attempts: usize, last: String },

    #[error("query cancelled by caller")]
    Cancelled,
}

impl ExecutionError {
    pub fn transient(backend: Backend, message: impl std::fmt::Display) -> Self {
        ExecutionError::Transient {
            backend,
            message: message.to_string(),
        }
    }

    pub fn terminal(backend: Backend, message: impl std::fmt::Display) -> Self {
        ExecutionError::Terminal {
            backend,
            message: message.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient { .. })
    }
}

impl From<ExecutionError> for AppError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Unsupported(msg) => AppError::Analysis(msg),
            other => AppError::Backend(other.to_string()),
        }
    }
}

/// A committed CSV result stream.
///
/// Constructed only once the backend has produced its first row/recordset
/// event; the receiver yields encoded CSV chunks, header row first. An
/// in-band `Err` means the stream is truncated and cannot be resumed.
pub struct QueryStream {
    pub backend: Backend,
    rx: mpsc::Receiver<Result<Bytes, ExecutionError>>,
}

impl QueryStream {
    pub fn new(backend: Backend, rx: mpsc::Receiver<Result<Bytes, ExecutionError>>) -> Self {
        Self { backend, rx }
    }

    pub fn into_byte_stream(self) -> ReceiverStream<Result<Bytes, ExecutionError>> {
        ReceiverStream::new(self.rx)
    }
}

/// One physical backend capable of executing a query.
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    fn backend(&self) -> Backend;

    /// Execute `sql` and return the committed CSV stream. Implementations
    /// must not return before the first row/recordset event so that a
    /// failure here is always safe to retry elsewhere.
    async fn begin_stream(
        &self,
        sql: &str,
        token: CancellationToken,
    ) -> Result<QueryStream, ExecutionError>;

    /// Execute `sql` expecting a single scalar result (count queries).
    async fn fetch_scalar(
        &self,
        sql: &str,
        token: CancellationToken,
    ) -> Result<i64, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExecutionError::transient(Backend::Mariana, "io error").is_transient());
        assert!(!ExecutionError::terminal(Backend::Cluster, "bad").is_transient());
        assert!(!ExecutionError::Cancelled.is_transient());
    }

    #[test]
    fn test_unsupported_maps_to_analysis_error() {
        let app: AppError = ExecutionError::Unsupported("TOP PERCENT".to_string()).into();
        assert!(matches!(app, AppError::Analysis(_)));
    }
}
