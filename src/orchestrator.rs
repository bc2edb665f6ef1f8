//! 上传编排器：会话创建、分片接收、完成检测、装配触发与最终登记。

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::assembler::{self, AssembleError};
use crate::catalog::Catalog;
use crate::chunk_store::StoreError;
use crate::config::{MAX_CHUNK_SIZE, UploadLimits};
use crate::object_store::ObjectStore;
use crate::session::{
    FinalizedUpload, Phase, SessionError, SessionRegistry, SessionSnapshot,
};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("chunk index {index} out of range (total {total_chunks})")]
    IndexOutOfRange { index: u64, total_chunks: u64 },
    #[error("chunk exceeds {limit} bytes")]
    ChunkTooLarge { limit: u64 },
    #[error("too many concurrent upload sessions")]
    TooManySessions,
    #[error("session is completing, late chunks are rejected")]
    SessionCompleting,
    #[error("upload incomplete, missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<u64> },
    #[error("assembled size {assembled} does not match declared size {declared}")]
    SizeMismatch { declared: u64, assembled: u64 },
    #[error("assembly failed: {0}")]
    AssemblyFailed(String),
    #[error("file registration failed: {0}")]
    RegistrationFailed(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<SessionError> for UploadError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidArgument(msg) => UploadError::InvalidArgument(msg),
            SessionError::NotFound => UploadError::SessionNotFound,
            SessionError::IndexOutOfRange { index, total_chunks } => {
                UploadError::IndexOutOfRange { index, total_chunks }
            }
            SessionError::Store(err) => err.into(),
            SessionError::Io(err) => UploadError::Storage(err.to_string()),
        }
    }
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ChunkTooLarge { limit } => UploadError::ChunkTooLarge { limit },
            other => UploadError::Storage(other.to_string()),
        }
    }
}

/// 单个分片被接收后的进度回执。
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub received_chunks: u64,
    pub total_chunks: u64,
}

/// 会话状态查询结果：快照加上仍然缺失的分片序号。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    pub missing_chunks: Vec<u64>,
}

/// 把登记簿、分片暂存区、装配器与两个外部协作方绑在一起的状态机。
///
/// 会话记录只归这里修改；HTTP 层只做参数搬运。
pub struct UploadOrchestrator {
    registry: SessionRegistry,
    objects: Arc<dyn ObjectStore>,
    catalog: Arc<dyn Catalog>,
    limits: UploadLimits,
}

impl UploadOrchestrator {
    pub fn new(
        registry: SessionRegistry,
        objects: Arc<dyn ObjectStore>,
        catalog: Arc<dyn Catalog>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            registry,
            objects,
            catalog,
            limits,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// 重启后重建在途会话（接收数按磁盘上的分片重新统计）。
    pub async fn restore_sessions(&self) -> Result<usize, UploadError> {
        Ok(self.registry.load().await?)
    }

    /// 创建上传会话并返回初始快照。
    pub async fn init_upload(
        &self,
        name: &str,
        path: &str,
        declared_size: u64,
        total_chunks: u64,
        owner_id: &str,
    ) -> Result<SessionSnapshot, UploadError> {
        if self.limits.max_total_size > 0 && declared_size > self.limits.max_total_size {
            return Err(UploadError::InvalidArgument(
                "upload size exceeds limit".into(),
            ));
        }
        if self.limits.max_chunks > 0 && total_chunks > self.limits.max_chunks {
            return Err(UploadError::InvalidArgument(
                "upload chunk count exceeds limit".into(),
            ));
        }
        if self.limits.max_sessions > 0
            && self.registry.active_count().await >= self.limits.max_sessions
        {
            return Err(UploadError::TooManySessions);
        }

        let entry = self
            .registry
            .create_session(name, path, declared_size, total_chunks, owner_id)
            .await?;
        info!(
            session_id = entry.meta.id,
            name = entry.meta.target_name,
            path = entry.meta.target_path,
            declared_size,
            total_chunks,
            owner_id,
            "upload session initiated"
        );
        Ok(entry.snapshot().await)
    }

    /// 接收一个分片：持久化 blob，再登记进度。
    ///
    /// 分片文件本身就是持久化的接收记录，进程在两步之间崩溃也能
    /// 在重启对账时恢复；同一序号重复到达幂等覆盖。
    pub async fn accept_chunk<R>(
        &self,
        session_id: &str,
        chunk_index: u64,
        declared_total: Option<u64>,
        body: &mut R,
    ) -> Result<ChunkReceipt, UploadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let entry = self
            .registry
            .get(session_id)
            .await
            .ok_or(UploadError::SessionNotFound)?;
        let total_chunks = entry.meta.total_chunks;

        if let Some(declared) = declared_total
            && declared != total_chunks
        {
            return Err(UploadError::InvalidArgument(format!(
                "totalChunks mismatch: session expects {total_chunks}, got {declared}"
            )));
        }
        if chunk_index >= total_chunks {
            return Err(UploadError::IndexOutOfRange {
                index: chunk_index,
                total_chunks,
            });
        }
        if entry.phase().await == Phase::Completing {
            return Err(UploadError::SessionCompleting);
        }

        let written = self
            .registry
            .store()
            .put_chunk(session_id, chunk_index, body, MAX_CHUNK_SIZE)
            .await?;
        let received_chunks = entry.record_chunk_received(chunk_index).await?;

        debug!(
            session_id,
            chunk_index,
            bytes = written,
            received_chunks,
            total_chunks,
            "chunk persisted"
        );
        Ok(ChunkReceipt {
            received_chunks,
            total_chunks,
        })
    }

    /// 查询会话进度与缺失序号，供客户端断点续传。
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus, UploadError> {
        let entry = self
            .registry
            .get(session_id)
            .await
            .ok_or(UploadError::SessionNotFound)?;
        let snapshot = entry.snapshot().await;
        let missing_chunks = self
            .registry
            .store()
            .missing_indices(session_id, entry.meta.total_chunks)
            .await;
        Ok(SessionStatus {
            snapshot,
            missing_chunks,
        })
    }

    /// 完成上传：核验、装配、发布对象、登记元数据、清理。
    ///
    /// 同一会话的并发调用只执行一次装配，后到者等锁后取走相同的
    /// 结果。任何失败都把会话退回 Receiving，分片保留，重试无需
    /// 重传。
    pub async fn complete_upload(&self, session_id: &str) -> Result<FinalizedUpload, UploadError> {
        let entry = self
            .registry
            .get(session_id)
            .await
            .ok_or(UploadError::SessionNotFound)?;

        let mut outcome = entry.completion().lock().await;
        if let Some(done) = outcome.as_ref() {
            // a racing caller already finalized this session
            return Ok(done.clone());
        }

        let meta = &entry.meta;
        let missing = self
            .registry
            .store()
            .missing_indices(session_id, meta.total_chunks)
            .await;
        if !missing.is_empty() {
            return Err(UploadError::IncompleteUpload { missing });
        }
        entry.begin_completing().await;

        let key = self
            .objects
            .object_key_for(&meta.owner_id, &meta.target_path, &meta.target_name);
        let mut writer = match self.objects.start_object(&key).await {
            Ok(writer) => writer,
            Err(err) => {
                entry.back_to_receiving().await;
                return Err(UploadError::AssemblyFailed(err.to_string()));
            }
        };

        let assembled = match assembler::assemble(
            self.registry.store(),
            session_id,
            meta.total_chunks,
            &mut *writer,
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(err) => {
                writer.abort().await;
                entry.back_to_receiving().await;
                return Err(match err {
                    AssembleError::MissingChunk(index) => UploadError::IncompleteUpload {
                        missing: vec![index],
                    },
                    other => UploadError::AssemblyFailed(other.to_string()),
                });
            }
        };

        if meta.declared_size > 0 && assembled != meta.declared_size {
            warn!(
                session_id,
                declared = meta.declared_size,
                assembled,
                "size mismatch after assembly"
            );
            writer.abort().await;
            entry.back_to_receiving().await;
            return Err(UploadError::SizeMismatch {
                declared: meta.declared_size,
                assembled,
            });
        }

        if let Err(err) = writer.finalize().await {
            entry.back_to_receiving().await;
            return Err(UploadError::AssemblyFailed(err.to_string()));
        }

        // 对象已持久化；登记失败时保留分片，重试会重新装配并覆盖
        // 同一个键，然后再次尝试登记。
        let file_id = match self
            .catalog
            .register_file(
                &meta.owner_id,
                &meta.target_name,
                &meta.target_path,
                assembled,
                &key,
            )
            .await
        {
            Ok(file_id) => file_id,
            Err(err) => {
                entry.back_to_receiving().await;
                return Err(UploadError::RegistrationFailed(err.to_string()));
            }
        };

        let reference = match self.objects.reference_for(&key).await {
            Ok(reference) => reference,
            Err(err) => {
                warn!(session_id, error = %err, "reference generation failed, falling back to key");
                key.clone()
            }
        };

        let finalized = FinalizedUpload {
            file_id,
            object_key: key,
            reference,
            size: assembled,
        };
        *outcome = Some(finalized.clone());

        self.registry.delete_session(session_id).await;
        if let Err(err) = self
            .registry
            .store()
            .delete_session_chunks(session_id)
            .await
        {
            // the durable artifact exists; stray chunks are housekeeping
            warn!(session_id, error = %err, "chunk cleanup failed after successful upload");
        }

        info!(
            session_id,
            file_id = finalized.file_id,
            object_key = finalized.object_key,
            size = finalized.size,
            "upload finalized"
        );
        Ok(finalized)
    }

    /// 取消上传并清理；对未知或已结束的会话幂等成功。
    pub async fn cancel_upload(&self, session_id: &str) {
        let Some(entry) = self.registry.get(session_id).await else {
            // 磁盘上可能还留着没有会话记录的残片
            if let Err(err) = self
                .registry
                .store()
                .delete_session_chunks(session_id)
                .await
            {
                warn!(session_id, error = %err, "orphan chunk cleanup failed");
            }
            return;
        };

        // 等待在途的 completeUpload 结束；若它已经定稿则无事可做
        let outcome = entry.completion().lock().await;
        if outcome.is_some() {
            return;
        }
        self.registry.delete_session(session_id).await;
        if let Err(err) = self
            .registry
            .store()
            .delete_session_chunks(session_id)
            .await
        {
            warn!(session_id, error = %err, "chunk cleanup failed on cancel");
        }
        info!(session_id, "upload cancelled");
    }

    /// 清除长期无活动的会话；跳过正在完成中的会话。
    pub async fn evict_stale_sessions(&self) -> usize {
        if self.limits.session_ttl.is_zero() {
            return 0;
        }
        let stale = self.registry.stale_sessions(self.limits.session_ttl).await;
        let mut evicted = 0;
        for entry in stale {
            let session_id = entry.meta.id.clone();
            // never race a finalization: skip rather than risk deleting
            let Ok(outcome) = entry.completion().try_lock() else {
                continue;
            };
            if outcome.is_some() || entry.phase().await == Phase::Completing {
                continue;
            }
            self.registry.delete_session(&session_id).await;
            if let Err(err) = self.registry.store().delete_session_chunks(&session_id).await {
                warn!(session_id, error = %err, "chunk cleanup failed on eviction");
                continue;
            }
            info!(session_id, "stale upload session evicted");
            evicted += 1;
        }
        evicted
    }
}
