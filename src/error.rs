//! Error types for download jobs and metadata lookups, and their HTTP
//! rendering.

use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Terminal failure of a download job.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("no .{extension} file found")]
    IncompleteOutput { extension: &'static str },
    #[error("{0}")]
    Extraction(String),
}

/// Failure while asking the extractor for metadata only.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("extractor exited with {status}: {stderr}")]
    Extractor { status: String, stderr: String },
    #[error("invalid extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("metadata worker failed: {0}")]
    Worker(String),
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn metadata(what: &str, err: MetadataError) -> Self {
        tracing::error!(error = %err, "failed to get video {what}");
        Self::internal(format!("Failed to get video {what}: {err}"))
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Timeout(limit) => Self::new(
                StatusCode::REQUEST_TIMEOUT,
                format!("Download timed out after {} seconds", limit.as_secs()),
            ),
            DownloadError::IncompleteOutput { .. } | DownloadError::Extraction(_) => {
                Self::internal(format!("Download failed: {err}"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    #[test]
    fn timeout_maps_to_request_timeout() {
        let err: ApiError = DownloadError::Timeout(Duration::from_secs(300)).into();
        assert_eq!(err.status, StatusCode::REQUEST_TIMEOUT);
        assert!(err.message.contains("300 seconds"));
    }

    #[test]
    fn incomplete_output_names_missing_extension() {
        let err: ApiError = DownloadError::IncompleteOutput { extension: "mp3" }.into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Download failed: no .mp3 file found");
    }

    #[test]
    fn extraction_failure_keeps_underlying_description() {
        let err: ApiError = DownloadError::Extraction("Video unavailable".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Download failed: Video unavailable");
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::internal("boom").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"], "boom");
    }
}
