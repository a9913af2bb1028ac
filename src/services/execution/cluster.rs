// Cloud warehouse executor
//
// The warehouse exposes an HTTP statement-execution API rather than a
// row-event driver: open a session, submit the statement, then page
// through the result. Each page is fully drained into the CSV stage
// before the next fetch. The statement is dialect-translated on the way
// in (brackets, schema prefixes, STDEV, TOP).

use bytes::Bytes;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::Backend;
use crate::services::dialect;
use crate::services::execution::stream::{json_cell, CsvBatcher};
use crate::services::execution::{
    BackendExecutor, ExecutionError, QueryStream, CHANNEL_CAPACITY,
};

use async_trait::async_trait;

pub struct ClusterExecutor {
    http_client: HttpClient,
    base_url: String,
    api_token: Option<String>,
    page_size: u32,
    batch_rows: usize,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
}

#[derive(Debug, Deserialize)]
struct ResultPage {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    has_more: bool,
}

impl ClusterExecutor {
    pub fn new(
        base_url: String,
        api_token: Option<String>,
        page_size: u32,
        batch_rows: usize,
    ) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            page_size,
            batch_rows,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn open_session(&self) -> Result<String, ExecutionError> {
        let response = self
            .request(self.http_client.post(format!("{}/api/v1/sessions", self.base_url)))
            .send()
            .await
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))?
            .error_for_status()
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))?;

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))?;
        Ok(session.session_id)
    }

    async fn submit_statement(
        &self,
        session_id: &str,
        sql: &str,
    ) -> Result<String, ExecutionError> {
        let response = self
            .request(self.http_client.post(format!(
                "{}/api/v1/sessions/{}/statements",
                self.base_url, session_id
            )))
            .json(&json!({ "statement": sql }))
            .send()
            .await
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))?
            .error_for_status()
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))?;

        let statement: StatementResponse = response
            .json()
            .await
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))?;
        Ok(statement.statement_id)
    }

    async fn fetch_page(&self, statement_id: &str, offset: u64) -> Result<ResultPage, ExecutionError> {
        let response = self
            .request(self.http_client.get(format!(
                "{}/api/v1/statements/{}/result",
                self.base_url, statement_id
            )))
            .query(&[("offset", offset.to_string()), ("limit", self.page_size.to_string())])
            .send()
            .await
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))?
            .error_for_status()
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))?;

        response
            .json()
            .await
            .map_err(|e| ExecutionError::transient(Backend::Cluster, e))
    }

    async fn close_session(&self, session_id: &str) {
        let result = self
            .request(self.http_client.delete(format!(
                "{}/api/v1/sessions/{}",
                self.base_url, session_id
            )))
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("failed to close warehouse session {}: {}", session_id, e);
        }
    }
}

#[async_trait]
impl BackendExecutor for ClusterExecutor {
    fn backend(&self) -> Backend {
        Backend::Cluster
    }

    async fn begin_stream(
        &self,
        sql: &str,
        token: CancellationToken,
    ) -> Result<QueryStream, ExecutionError> {
        if token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let translated =
            dialect::prepare_for_cluster(sql).map_err(|e| ExecutionError::Unsupported(e.to_string()))?;

        let session_id = self.open_session().await?;
        let statement_id = match self.submit_statement(&session_id, &translated).await {
            Ok(id) => id,
            Err(e) => {
                self.close_session(&session_id).await;
                return Err(e);
            }
        };

        // First page commits the stream; failures before this stay clean.
        let first_page = tokio::select! {
            _ = token.cancelled() => {
                self.close_session(&session_id).await;
                return Err(ExecutionError::Cancelled);
            }
            page = self.fetch_page(&statement_id, 0) => match page {
                Ok(page) => page,
                Err(e) => {
                    self.close_session(&session_id).await;
                    return Err(e);
                }
            }
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pump = ClusterPump {
            executor: self.clone_for_pump(),
            session_id,
            statement_id,
            tx,
            token,
        };
        tokio::spawn(pump.run(first_page));

        Ok(QueryStream::new(Backend::Cluster, rx))
    }

    async fn fetch_scalar(
        &self,
        sql: &str,
        token: CancellationToken,
    ) -> Result<i64, ExecutionError> {
        if token.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let translated =
            dialect::prepare_for_cluster(sql).map_err(|e| ExecutionError::Unsupported(e.to_string()))?;

        let session_id = self.open_session().await?;
        let result = async {
            let statement_id = self.submit_statement(&session_id, &translated).await?;
            let page = self.fetch_page(&statement_id, 0).await?;
            page.rows
                .first()
                .and_then(|row| row.first())
                .and_then(|cell| cell.as_i64())
                .ok_or_else(|| {
                    ExecutionError::terminal(Backend::Cluster, "non-integer count result")
                })
        }
        .await;

        self.close_session(&session_id).await;
        result
    }
}

impl ClusterExecutor {
    fn clone_for_pump(&self) -> ClusterExecutor {
        ClusterExecutor {
            http_client: self.http_client.clone(),
            base_url: self.base_url.clone(),
            api_token: self.api_token.clone(),
            page_size: self.page_size,
            batch_rows: self.batch_rows,
        }
    }
}

struct ClusterPump {
    executor: ClusterExecutor,
    session_id: String,
    statement_id: String,
    tx: mpsc::Sender<Result<Bytes, ExecutionError>>,
    token: CancellationToken,
}

impl ClusterPump {
    async fn run(self, first_page: ResultPage) {
        let mut batcher = CsvBatcher::new(self.executor.batch_rows);
        if let Err(e) = batcher.header(&first_page.columns) {
            let _ = self
                .tx
                .send(Err(ExecutionError::terminal(Backend::Cluster, e)))
                .await;
            self.executor.close_session(&self.session_id).await;
            return;
        }

        let mut page = first_page;
        let mut offset = 0u64;
        loop {
            offset += page.rows.len() as u64;
            // drain the whole page into the encoder before the next fetch
            for row in &page.rows {
                let cells: Vec<String> = row.iter().map(json_cell).collect();
                match batcher.push(&cells) {
                    Ok(Some(chunk)) => {
                        if self.tx.send(Ok(chunk)).await.is_err() {
                            // caller disconnected
                            self.executor.close_session(&self.session_id).await;
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = self
                            .tx
                            .send(Err(ExecutionError::terminal(Backend::Cluster, e)))
                            .await;
                        self.executor.close_session(&self.session_id).await;
                        return;
                    }
                }
            }

            if !page.has_more {
                break;
            }

            page = tokio::select! {
                _ = self.token.cancelled() => {
                    self.executor.close_session(&self.session_id).await;
                    return;
                }
                next = self.executor.fetch_page(&self.statement_id, offset) => match next {
                    Ok(next) => next,
                    Err(e) => {
                        let _ = self.tx.send(Err(e)).await;
                        self.executor.close_session(&self.session_id).await;
                        return;
                    }
                }
            };
        }

        match batcher.finish() {
            Ok(Some(chunk)) => {
                let _ = self.tx.send(Ok(chunk)).await;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = self
                    .tx
                    .send(Err(ExecutionError::terminal(Backend::Cluster, e)))
                    .await;
            }
        }
        self.executor.close_session(&self.session_id).await;
    }
}
