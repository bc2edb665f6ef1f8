//! 上传会话登记簿：会话存在性、进度与生命周期的权威记录。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk_store::{ChunkStore, StoreError};

pub const SESSION_RECORD_NAME: &str = "session.json";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session not found")]
    NotFound,
    #[error("chunk index {index} out of range (total {total_chunks})")]
    IndexOutOfRange { index: u64, total_chunks: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 会话的不可变元数据，持久化为分片目录内的 `session.json`。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub target_name: String,
    pub target_path: String,
    pub declared_size: u64,
    pub total_chunks: u64,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// 会话当前所处的阶段。
///
/// `Finalized` 与 `Abandoned` 不作为驻留状态：终态即从登记簿移除，
/// 成功结果保留在会话的完成槽内供并发调用方读取。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Receiving,
    Completing,
}

/// 装配完成后的最终产物引用。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedUpload {
    pub file_id: String,
    pub object_key: String,
    pub reference: String,
    pub size: u64,
}

#[derive(Debug)]
struct Progress {
    received: HashSet<u64>,
    phase: Phase,
    last_activity: DateTime<Utc>,
}

/// 单个在途会话：元数据、进度与完成互斥锁。
#[derive(Debug)]
pub struct SessionEntry {
    pub meta: SessionMeta,
    progress: Mutex<Progress>,
    /// completeUpload 的互斥与结果槽：持锁者执行装配，后到者
    /// 等锁后直接取走相同的结果。
    completion: Mutex<Option<FinalizedUpload>>,
}

impl SessionEntry {
    fn new(meta: SessionMeta, received: HashSet<u64>) -> Self {
        let last_activity = meta.created_at;
        Self {
            meta,
            progress: Mutex::new(Progress {
                received,
                phase: Phase::Receiving,
                last_activity,
            }),
            completion: Mutex::new(None),
        }
    }

    /// 记录一个分片已持久化，返回去重后的接收数。
    ///
    /// 重复序号幂等，不增加计数；计数永远是不同序号的数量。
    pub async fn record_chunk_received(&self, chunk_index: u64) -> Result<u64, SessionError> {
        if chunk_index >= self.meta.total_chunks {
            return Err(SessionError::IndexOutOfRange {
                index: chunk_index,
                total_chunks: self.meta.total_chunks,
            });
        }
        let mut progress = self.progress.lock().await;
        progress.received.insert(chunk_index);
        progress.last_activity = Utc::now();
        Ok(progress.received.len() as u64)
    }

    pub async fn received_count(&self) -> u64 {
        self.progress.lock().await.received.len() as u64
    }

    pub async fn phase(&self) -> Phase {
        self.progress.lock().await.phase
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        self.progress.lock().await.last_activity
    }

    /// 尝试进入 Completing 阶段；已在 Completing 时返回 false。
    pub async fn begin_completing(&self) -> bool {
        let mut progress = self.progress.lock().await;
        if progress.phase == Phase::Completing {
            return false;
        }
        progress.phase = Phase::Completing;
        true
    }

    /// 完成失败后回到 Receiving，会话保持可续传。
    pub async fn back_to_receiving(&self) {
        let mut progress = self.progress.lock().await;
        progress.phase = Phase::Receiving;
        progress.last_activity = Utc::now();
    }

    pub fn completion(&self) -> &Mutex<Option<FinalizedUpload>> {
        &self.completion
    }
}

/// 会话快照，用于状态查询与进度上报。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub target_name: String,
    pub target_path: String,
    pub declared_size: u64,
    pub total_chunks: u64,
    pub received_chunks: u64,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub completing: bool,
}

impl SessionEntry {
    pub async fn snapshot(&self) -> SessionSnapshot {
        let progress = self.progress.lock().await;
        SessionSnapshot {
            session_id: self.meta.id.clone(),
            target_name: self.meta.target_name.clone(),
            target_path: self.meta.target_path.clone(),
            declared_size: self.meta.declared_size,
            total_chunks: self.meta.total_chunks,
            received_chunks: progress.received.len() as u64,
            owner_id: self.meta.owner_id.clone(),
            created_at: self.meta.created_at,
            completing: progress.phase == Phase::Completing,
        }
    }
}

/// 在途会话登记簿，仅由编排器持有与修改。
#[derive(Debug)]
pub struct SessionRegistry {
    store: ChunkStore,
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new(store: ChunkStore) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// 启动时从磁盘重建在途会话。
    ///
    /// 接收数一律按实际存在的分片文件重新统计，而不是沿用崩溃前
    /// 的计数；没有可读会话记录的残留目录直接清除。
    pub async fn load(&self) -> Result<usize, SessionError> {
        let mut restored = 0;
        for dir_name in self.store.list_session_dirs().await? {
            let record_path = self.store.session_dir(&dir_name).join(SESSION_RECORD_NAME);
            let meta = match fs::read(&record_path).await {
                Ok(bytes) => match serde_json::from_slice::<SessionMeta>(&bytes) {
                    Ok(meta) if meta.id == dir_name => meta,
                    Ok(meta) => {
                        warn!(dir = dir_name, record_id = meta.id, "session record id mismatch, removing");
                        self.store.delete_session_chunks(&dir_name).await?;
                        continue;
                    }
                    Err(err) => {
                        warn!(dir = dir_name, error = %err, "corrupt session record, removing");
                        self.store.delete_session_chunks(&dir_name).await?;
                        continue;
                    }
                },
                Err(err) => {
                    warn!(dir = dir_name, error = %err, "unreadable session record, removing");
                    self.store.delete_session_chunks(&dir_name).await?;
                    continue;
                }
            };

            let mut received = self.store.received_indices(&meta.id).await?;
            received.retain(|index| *index < meta.total_chunks);
            info!(
                session_id = meta.id,
                received = received.len(),
                total_chunks = meta.total_chunks,
                "restored upload session"
            );
            let entry = Arc::new(SessionEntry::new(meta, received));
            self.sessions
                .lock()
                .await
                .insert(entry.meta.id.clone(), entry);
            restored += 1;
        }
        Ok(restored)
    }

    /// 创建会话：校验参数、分配分片目录并落盘会话记录。
    pub async fn create_session(
        &self,
        target_name: &str,
        target_path: &str,
        declared_size: u64,
        total_chunks: u64,
        owner_id: &str,
    ) -> Result<Arc<SessionEntry>, SessionError> {
        let target_name = target_name.trim().trim_start_matches(['/', '\\']);
        if target_name.is_empty() {
            return Err(SessionError::InvalidArgument("name is required".into()));
        }
        if total_chunks == 0 {
            return Err(SessionError::InvalidArgument(
                "totalChunks must be at least 1".into(),
            ));
        }
        if owner_id.trim().is_empty() {
            return Err(SessionError::InvalidArgument("ownerId is required".into()));
        }

        let meta = SessionMeta {
            id: Uuid::new_v4().to_string(),
            target_name: target_name.to_string(),
            target_path: target_path.trim().to_string(),
            declared_size,
            total_chunks,
            owner_id: owner_id.to_string(),
            created_at: Utc::now(),
        };

        self.store.create_session_area(&meta.id).await?;
        let record_path = self.store.session_dir(&meta.id).join(SESSION_RECORD_NAME);
        let record = serde_json::to_vec(&meta)
            .map_err(|err| SessionError::InvalidArgument(err.to_string()))?;
        fs::write(&record_path, record).await?;

        let entry = Arc::new(SessionEntry::new(meta, HashSet::new()));
        self.sessions
            .lock()
            .await
            .insert(entry.meta.id.clone(), entry.clone());
        Ok(entry)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// 从登记簿移除会话记录；重复删除静默成功。
    pub async fn delete_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }

    pub async fn active_count(&self) -> u64 {
        self.sessions.lock().await.len() as u64
    }

    /// 返回最近无分片活动超过 ttl 的会话。
    pub async fn stale_sessions(&self, ttl: std::time::Duration) -> Vec<Arc<SessionEntry>> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - ttl;
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.lock().await.values().cloned().collect();
        let mut stale = Vec::new();
        for entry in entries {
            if entry.last_activity().await < cutoff {
                stale.push(entry);
            }
        }
        stale
    }
}
