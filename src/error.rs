//! 统一的 API 错误类型与 HTTP 映射。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::orchestrator::UploadError;

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(u64),
    /// 缺失分片的完成请求：附上缺失序号，客户端只需补传这些分片。
    IncompleteUpload(Vec<u64>),
    /// 可重试的服务端失败：分片完好，重试 completeUpload 即可。
    Retryable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::Conflict(msg) => {
                (StatusCode::CONFLICT, Json(json!({ "error": msg }))).into_response()
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    headers,
                    Json(json!({ "error": "too many requests" })),
                )
                    .into_response()
            }
            ApiError::IncompleteUpload(missing) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "upload incomplete",
                    "missingChunks": missing,
                    "retry": "chunks",
                })),
            )
                .into_response(),
            ApiError::Retryable(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": msg, "retry": "complete" })),
            )
                .into_response(),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": msg })),
            )
                .into_response(),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            UploadError::SessionNotFound => ApiError::NotFound("session not found".into()),
            err @ UploadError::IndexOutOfRange { .. } => ApiError::BadRequest(err.to_string()),
            err @ UploadError::ChunkTooLarge { .. } => ApiError::BadRequest(err.to_string()),
            UploadError::TooManySessions => ApiError::TooManyRequests(60),
            err @ UploadError::SessionCompleting => ApiError::Conflict(err.to_string()),
            UploadError::IncompleteUpload { missing } => ApiError::IncompleteUpload(missing),
            err @ UploadError::SizeMismatch { .. } => ApiError::BadRequest(err.to_string()),
            UploadError::AssemblyFailed(msg) => ApiError::Retryable(msg),
            UploadError::RegistrationFailed(msg) => ApiError::Retryable(msg),
            UploadError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}
