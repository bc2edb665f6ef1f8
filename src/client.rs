//! 客户端分块上传助手：与传输层解耦的分片驱动器。

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// 默认分片大小：5 MB。
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
/// 单个分片的默认重试次数。
pub const DEFAULT_MAX_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// 网络错误与 5xx 可重试；4xx 需要调用方修正。
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        index: u64,
        attempts: usize,
        source: TransportError,
    },
}

/// 发起上传所需的会话参数。
#[derive(Clone, Debug)]
pub struct InitUpload {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub total_chunks: u64,
    pub owner_id: String,
}

/// 完成后服务端返回的最终引用。
#[derive(Clone, Debug)]
pub struct CompletedUpload {
    pub file_id: String,
    pub reference: String,
    pub size: u64,
}

/// 上传传输层：HTTP、RPC 或进程内实现都只需这四个调用。
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn init_upload(&self, request: &InitUpload) -> Result<String, TransportError>;
    async fn send_chunk(
        &self,
        session_id: &str,
        chunk_index: u64,
        total_chunks: u64,
        payload: &[u8],
    ) -> Result<(), TransportError>;
    async fn complete_upload(&self, session_id: &str) -> Result<CompletedUpload, TransportError>;
    async fn cancel_upload(&self, session_id: &str) -> Result<(), TransportError>;
}

/// 上传过程中的带标签事件流，取代松散回调。
#[derive(Clone, Debug)]
pub enum UploadEvent {
    Started { session_id: String, total_chunks: u64 },
    Progress { sent_bytes: u64, total_bytes: u64 },
    ChunkFailed { index: u64, attempt: usize, error: String },
    Completed { reference: String, size: u64 },
    Error { message: String },
}

/// 把本地文件切成分片依次推给传输层，失败分片带退避重试。
#[derive(Clone, Debug)]
pub struct ChunkedUploader {
    pub chunk_size: u64,
    pub max_retries: usize,
    pub retry_base_delay: Duration,
}

impl Default for ChunkedUploader {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

impl ChunkedUploader {
    /// 上传一个本地文件并在过程中发出 [`UploadEvent`]。
    ///
    /// 分片失败重试耗尽时会尽力取消会话再返回错误；完成调用失败
    /// 则保留会话，调用方可以单独重试 complete 而无需重传分片。
    pub async fn upload_file<T, F>(
        &self,
        transport: &T,
        file_path: &Path,
        target_name: &str,
        target_path: &str,
        owner_id: &str,
        mut on_event: F,
    ) -> Result<CompletedUpload, ClientError>
    where
        T: UploadTransport + ?Sized,
        F: FnMut(UploadEvent),
    {
        let mut file = File::open(file_path).await?;
        let total_bytes = file.metadata().await?.len();
        let total_chunks = total_bytes.div_ceil(self.chunk_size).max(1);

        let request = InitUpload {
            name: target_name.to_string(),
            path: target_path.to_string(),
            size: total_bytes,
            total_chunks,
            owner_id: owner_id.to_string(),
        };
        let session_id = match transport.init_upload(&request).await {
            Ok(session_id) => session_id,
            Err(err) => {
                on_event(UploadEvent::Error {
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };
        on_event(UploadEvent::Started {
            session_id: session_id.clone(),
            total_chunks,
        });

        let mut sent_bytes: u64 = 0;
        for index in 0..total_chunks {
            let payload = read_chunk(&mut file, self.chunk_size).await?;
            if let Err(err) = self
                .send_chunk_with_retry(transport, &session_id, index, total_chunks, &payload, &mut on_event)
                .await
            {
                on_event(UploadEvent::Error {
                    message: err.to_string(),
                });
                if let Err(cancel_err) = transport.cancel_upload(&session_id).await {
                    warn!(session_id, error = %cancel_err, "cancel after chunk failure also failed");
                }
                return Err(err);
            }
            sent_bytes += payload.len() as u64;
            on_event(UploadEvent::Progress {
                sent_bytes,
                total_bytes,
            });
        }

        match transport.complete_upload(&session_id).await {
            Ok(done) => {
                on_event(UploadEvent::Completed {
                    reference: done.reference.clone(),
                    size: done.size,
                });
                Ok(done)
            }
            Err(err) => {
                // 分片都在服务端了，只有 complete 需要重试
                on_event(UploadEvent::Error {
                    message: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    async fn send_chunk_with_retry<T, F>(
        &self,
        transport: &T,
        session_id: &str,
        index: u64,
        total_chunks: u64,
        payload: &[u8],
        on_event: &mut F,
    ) -> Result<(), ClientError>
    where
        T: UploadTransport + ?Sized,
        F: FnMut(UploadEvent),
    {
        let mut attempt = 0;
        loop {
            match transport
                .send_chunk(session_id, index, total_chunks, payload)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.max_retries && err.is_retryable() => {
                    attempt += 1;
                    debug!(session_id, chunk_index = index, attempt, "retrying chunk");
                    on_event(UploadEvent::ChunkFailed {
                        index,
                        attempt,
                        error: err.to_string(),
                    });
                    // 退避因子饱和而非溢出，任意大的重试预算都安全
                    let factor = 2u32.saturating_pow(attempt.min(31) as u32);
                    tokio::time::sleep(self.retry_base_delay.saturating_mul(factor)).await;
                }
                Err(err) => {
                    return Err(ClientError::ChunkFailed {
                        index,
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }
}

/// 从文件读出最多 chunk_size 字节；读满或到 EOF 为止。
async fn read_chunk(file: &mut File, chunk_size: u64) -> Result<Vec<u8>, std::io::Error> {
    let mut payload = vec![0u8; chunk_size as usize];
    let mut filled = 0;
    while filled < payload.len() {
        let n = file.read(&mut payload[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    payload.truncate(filled);
    Ok(payload)
}
