//! 分片上传的 HTTP 接口层：参数搬运，不做状态修改。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Query};
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io;
use std::sync::Arc;
use tokio_util::io::StreamReader;

use crate::error::ApiError;
use crate::orchestrator::{ChunkReceipt, SessionStatus, UploadOrchestrator};
use crate::session::FinalizedUpload;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInitRequest {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    size: u64,
    total_chunks: u64,
    owner_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInitResponse {
    session_id: String,
    total_chunks: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdQuery {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdRequest {
    session_id: String,
}

/// 创建上传会话。
pub async fn init_upload(
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
    Json(payload): Json<UploadInitRequest>,
) -> Result<JsonResponse<UploadInitResponse>, ApiError> {
    let path = payload.path.as_deref().unwrap_or("/");
    let snapshot = orchestrator
        .init_upload(
            &payload.name,
            path,
            payload.size,
            payload.total_chunks,
            &payload.owner_id,
        )
        .await?;
    Ok(JsonResponse(UploadInitResponse {
        session_id: snapshot.session_id,
        total_chunks: snapshot.total_chunks,
    }))
}

/// 接收单个分片；分片序号走 `X-Chunk-Index` 头，正文即分片字节。
pub async fn accept_chunk(
    Query(SessionIdQuery { session_id }): Query<SessionIdQuery>,
    headers: HeaderMap,
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
    body: AxumBody,
) -> Result<JsonResponse<ChunkReceipt>, ApiError> {
    if session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("sessionId is required".into()));
    }
    let chunk_index = headers
        .get("X-Chunk-Index")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| ApiError::BadRequest("X-Chunk-Index is required".into()))?;
    let declared_total = headers
        .get("X-Total-Chunks")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let stream = BodyExt::into_data_stream(body);
    let mut reader = StreamReader::new(
        futures_util::TryStreamExt::map_err(stream, |err| io::Error::other(err.to_string())),
    );
    let receipt = orchestrator
        .accept_chunk(&session_id, chunk_index, declared_total, &mut reader)
        .await?;
    Ok(JsonResponse(receipt))
}

/// 查询会话进度与缺失分片。
pub async fn session_status(
    Query(SessionIdQuery { session_id }): Query<SessionIdQuery>,
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
) -> Result<JsonResponse<SessionStatus>, ApiError> {
    let status = orchestrator.session_status(&session_id).await?;
    Ok(JsonResponse(status))
}

/// 完成上传，返回最终对象引用。
pub async fn complete_upload(
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
    Json(SessionIdRequest { session_id }): Json<SessionIdRequest>,
) -> Result<JsonResponse<FinalizedUpload>, ApiError> {
    if session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("sessionId is required".into()));
    }
    let finalized = orchestrator.complete_upload(&session_id).await?;
    Ok(JsonResponse(finalized))
}

/// 取消上传；对未知会话也返回成功。
pub async fn cancel_upload(
    Extension(orchestrator): Extension<Arc<UploadOrchestrator>>,
    Json(SessionIdRequest { session_id }): Json<SessionIdRequest>,
) -> Result<JsonResponse<Value>, ApiError> {
    if session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("sessionId is required".into()));
    }
    orchestrator.cancel_upload(&session_id).await;
    Ok(JsonResponse(json!({ "ok": true })))
}
