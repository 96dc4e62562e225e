//! API request and response models.

use hflow_proxy::{InterceptId, InterceptSummary};
use serde::Serialize;

/// Response body for GET /api/intercepts.
#[derive(Debug, Serialize)]
pub struct InterceptsResponse {
    /// Installed intercepts, ordered by id.
    pub intercepts: Vec<InterceptSummary>,
}

/// Response body for POST /api/intercepts.
#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: InterceptId,
}
