// On-prem executor
//
// Streams rows out of one on-prem replica with tokio-postgres. The
// statement is prepared first so the CSV header is known before any row
// arrives, and the stream is only committed once the first row event (or
// a clean empty result) has been observed; failures before that point are
// transient and the delegator is free to retry another replica.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::TryStreamExt;
use tokio::sync::mpsc;
use tokio_postgres::{CancelToken, Column, NoTls, Row, RowStream};
use tokio_util::sync::CancellationToken;

use crate::models::Backend;
use crate::services::connection_pool::ConnectionPoolManager;
use crate::services::execution::stream::{
    format_date, format_timestamp, format_timestamp_utc, CsvBatcher,
};
use crate::services::execution::{
    BackendExecutor, ExecutionError, QueryStream, CHANNEL_CAPACITY,
};

pub struct OnPremExecutor {
    backend: Backend,
    connection_url: String,
    pool_manager: Arc<ConnectionPoolManager>,
    batch_rows: usize,
}

impl OnPremExecutor {
    pub fn new(
        backend: Backend,
        connection_url: String,
        pool_manager: Arc<ConnectionPoolManager>,
        batch_rows: usize,
    ) -> Self {
        Self {
            backend,
            connection_url,
            pool_manager,
            batch_rows,
        }
    }
}

#[async_trait]
impl BackendExecutor for OnPremExecutor {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn begin_stream(
        &self,
        sql: &str,
        token: CancellationToken,
    ) -> Result<QueryStream, ExecutionError> {
        if token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let backend = self.backend;
        let pool = self
            .pool_manager
            .get_or_create_pool(backend, &self.connection_url)
            .await
            .map_err(|e| ExecutionError::transient(backend, e))?;
        let client = pool
            .get()
            .await
            .map_err(|e| ExecutionError::transient(backend, e))?;

        let stmt = client
            .prepare(sql)
            .await
            .map_err(|e| ExecutionError::transient(backend, e))?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

        let params: Vec<String> = Vec::new();
        let rows = client
            .query_raw(&stmt, params)
            .await
            .map_err(|e| ExecutionError::transient(backend, e))?;
        let mut rows: Pin<Box<RowStream>> = Box::pin(rows);

        // Hold the response until the first row event; a failure up to here
        // never leaked anything to the caller and stays retriable.
        let first = tokio::select! {
            _ = token.cancelled() => return Err(ExecutionError::Cancelled),
            next = rows.try_next() => {
                next.map_err(|e| ExecutionError::transient(backend, e))?
            }
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel_handle = client.cancel_token();
        let batch_rows = self.batch_rows;
        tokio::spawn(async move {
            // the pooled client must outlive the row stream
            let _client = client;
            pump_rows(
                backend,
                cancel_handle,
                rows,
                first,
                columns,
                tx,
                token,
                batch_rows,
            )
            .await;
        });

        Ok(QueryStream::new(backend, rx))
    }

    async fn fetch_scalar(
        &self,
        sql: &str,
        token: CancellationToken,
    ) -> Result<i64, ExecutionError> {
        let backend = self.backend;
        let pool = self
            .pool_manager
            .get_or_create_pool(backend, &self.connection_url)
            .await
            .map_err(|e| ExecutionError::transient(backend, e))?;
        let client = pool
            .get()
            .await
            .map_err(|e| ExecutionError::transient(backend, e))?;

        let row = tokio::select! {
            _ = token.cancelled() => return Err(ExecutionError::Cancelled),
            result = client.query_one(sql, &[]) => {
                result.map_err(|e| ExecutionError::transient(backend, e))?
            }
        };

        row.try_get::<_, i64>(0)
            .map_err(|e| ExecutionError::terminal(backend, format!("non-integer count result: {}", e)))
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump_rows(
    backend: Backend,
    cancel_handle: CancelToken,
    mut rows: Pin<Box<RowStream>>,
    first: Option<Row>,
    columns: Vec<String>,
    tx: mpsc::Sender<Result<Bytes, ExecutionError>>,
    token: CancellationToken,
    batch_rows: usize,
) {
    let mut batcher = CsvBatcher::new(batch_rows);
    if let Err(e) = batcher.header(&columns) {
        let _ = tx.send(Err(ExecutionError::terminal(backend, e))).await;
        return;
    }

    let mut pending = first;
    loop {
        match pending.take() {
            Some(row) => match batcher.push(&row_cells(&row)) {
                Ok(Some(chunk)) => {
                    // A full channel suspends the send, which stops row
                    // consumption until the transport drains: backpressure.
                    if tx.send(Ok(chunk)).await.is_err() {
                        // caller disconnected; stop the backend query too
                        cancel_backend(&cancel_handle, backend).await;
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(Err(ExecutionError::terminal(backend, e))).await;
                    return;
                }
            },
            None => {
                match batcher.finish() {
                    Ok(Some(chunk)) => {
                        let _ = tx.send(Ok(chunk)).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = tx.send(Err(ExecutionError::terminal(backend, e))).await;
                    }
                }
                return;
            }
        }

        pending = tokio::select! {
            _ = token.cancelled() => {
                cancel_backend(&cancel_handle, backend).await;
                return;
            }
            next = rows.try_next() => match next {
                Ok(row) => row,
                Err(e) => {
                    let _ = tx.send(Err(ExecutionError::terminal(backend, e))).await;
                    return;
                }
            }
        };
    }
}

async fn cancel_backend(cancel_handle: &CancelToken, backend: Backend) {
    tracing::debug!("cancelling in-flight query on {}", backend);
    if let Err(e) = cancel_handle.clone().cancel_query(NoTls).await {
        tracing::warn!("failed to cancel query on {}: {}", backend, e);
    }
}

fn row_cells(row: &Row) -> Vec<String> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| cell_text(row, idx, col))
        .collect()
}

/// Render one column value as a CSV cell; NULL becomes the empty cell.
fn cell_text(row: &Row, idx: usize, col: &Column) -> String {
    fn opt<T: ToString>(value: Option<T>) -> String {
        value.map(|v| v.to_string()).unwrap_or_default()
    }

    match col.type_().name() {
        "int2" => opt(row.try_get::<_, Option<i16>>(idx).ok().flatten()),
        "int4" => opt(row.try_get::<_, Option<i32>>(idx).ok().flatten()),
        "int8" => opt(row.try_get::<_, Option<i64>>(idx).ok().flatten()),
        "float4" => opt(row.try_get::<_, Option<f32>>(idx).ok().flatten()),
        "float8" | "numeric" => opt(row.try_get::<_, Option<f64>>(idx).ok().flatten()),
        "bool" => opt(row.try_get::<_, Option<bool>>(idx).ok().flatten()),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|ts| format_timestamp(&ts))
            .unwrap_or_default(),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(|ts| format_timestamp_utc(&ts))
            .unwrap_or_default(),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|d| format_date(&d))
            .unwrap_or_default(),
        "text" | "varchar" | "char" | "bpchar" | "name" => {
            opt(row.try_get::<_, Option<String>>(idx).ok().flatten())
        }
        other => {
            // Try the common decodings before giving up on the cell
            if let Ok(Some(v)) = row.try_get::<_, Option<String>>(idx) {
                v
            } else if let Ok(Some(v)) = row.try_get::<_, Option<i64>>(idx) {
                v.to_string()
            } else if let Ok(Some(v)) = row.try_get::<_, Option<f64>>(idx) {
                v.to_string()
            } else if let Ok(Some(v)) = row.try_get::<_, Option<bool>>(idx) {
                v.to_string()
            } else {
                tracing::warn!("column '{}' has unhandled type {}, emitting empty cell", col.name(), other);
                String::new()
            }
        }
    }
}
