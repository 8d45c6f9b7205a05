use serde::{Deserialize, Serialize};

use crate::store::PullProgress;

// Docker Engine API wire shapes for the translated image endpoints.

/// One entry of `GET /images/json`.
#[derive(Debug, Serialize)]
pub struct ImageSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Size")]
    pub size: i64,
    #[serde(rename = "Created")]
    pub created: i64,
}

/// One entry of the `DELETE /images/{reference}` response array.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    #[serde(rename = "Deleted")]
    pub deleted: String,
}

/// One streamed progress update during `POST /images/create`.
#[derive(Debug, Serialize)]
pub struct ProgressEvent {
    pub id: String,
    pub total: u64,
    pub current: u64,
}

impl From<PullProgress> for ProgressEvent {
    fn from(progress: PullProgress) -> Self {
        Self {
            id: progress.digest,
            total: progress.total,
            current: progress.completed,
        }
    }
}

/// Query parameters of `POST /images/create`.
#[derive(Debug, Deserialize)]
pub struct PullQuery {
    #[serde(rename = "fromImage")]
    pub from_image: Option<String>,
    pub tag: Option<String>,
}
