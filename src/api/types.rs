//! API request and response types.

use serde::{Deserialize, Serialize};

/// Body of `POST /task/:id`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AddUrlsRequest {
    pub urls: Vec<String>,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    /// Path of the failing request
    pub request: String,
    pub error: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
