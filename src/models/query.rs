use serde::Deserialize;

/// Body for the query, size-check, and analyze endpoints.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}
