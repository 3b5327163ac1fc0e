use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::{
    data_model::{FileSpecifier, JobId, JobStatus, ZipRequest},
    error::ZipperError,
    job_tracker::Poll,
};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ZipperAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ZipperAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }
}

impl IntoResponse for ZipperAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<ZipperError> for ZipperAPIError {
    fn from(e: ZipperError) -> Self {
        let message = e.to_string();
        match e {
            ZipperError::InvalidRequest { .. } => Self::bad_request(&message),
            ZipperError::ObjectNotFound { .. } => Self::not_found(&message),
            ZipperError::CapacityExceeded { .. } => {
                Self::new(StatusCode::INSUFFICIENT_STORAGE, &message)
            }
            ZipperError::Saturated => Self::new(StatusCode::SERVICE_UNAVAILABLE, &message),
            ZipperError::StoreUnavailable { .. } => Self::new(StatusCode::BAD_GATEWAY, &message),
            e => Self::internal_error(e.into()),
        }
    }
}

/// Body of `POST /zipping` and `POST /disk-space-check`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ZipRequestBody {
    pub user_id: String,
    /// Paths relative to the group, a trailing `/` selects a directory.
    pub files: Vec<String>,
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(rename = "phfsPrefix", default)]
    pub phfs_prefix: Option<String>,
}

impl From<ZipRequestBody> for ZipRequest {
    fn from(body: ZipRequestBody) -> Self {
        ZipRequest {
            user_id: body.user_id,
            files: body.files.iter().map(|f| FileSpecifier::parse(f)).collect(),
            group_name: body.group_name,
            path_prefix: body.phfs_prefix,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ZipAccepted {
    pub job_id: String,
    /// Name the archive will have in the user's downloadable list.
    pub file: String,
}

impl From<JobId> for ZipAccepted {
    fn from(job_id: JobId) -> Self {
        Self {
            job_id: job_id.to_string(),
            file: job_id.archive_name(),
        }
    }
}

/// Oldest job of a user. Serializes to `{}` when the user has no jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobQueueStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Poll> for JobQueueStatus {
    fn from(poll: Poll) -> Self {
        let file = poll.file();
        match poll {
            Poll::Empty => JobQueueStatus::default(),
            Poll::Entry { status, .. } => {
                let (completed, error) = match status {
                    JobStatus::Pending => (false, None),
                    JobStatus::Completed => (true, None),
                    JobStatus::Failed { error } => (false, Some(error)),
                };
                JobQueueStatus {
                    file,
                    completed: Some(completed),
                    error,
                }
            }
        }
    }
}
