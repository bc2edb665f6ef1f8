//! 分片暂存区：按 (会话, 序号) 寻址的持久临时存储。

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk {0} not found")]
    ChunkNotFound(u64),
    #[error("chunk exceeds {limit} bytes")]
    ChunkTooLarge { limit: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 每个会话一个目录，分片以 `{index}.part` 命名。
#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn chunk_path(&self, session_id: &str, chunk_index: u64) -> PathBuf {
        self.session_dir(session_id).join(format!("{chunk_index}.part"))
    }

    /// 为新会话分配空的分片目录。
    pub async fn create_session_area(&self, session_id: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.session_dir(session_id)).await?;
        Ok(())
    }

    /// 写入分片：先写临时文件再原子重命名，读者永远看不到半截分片。
    ///
    /// 同一序号重复写入会幂等覆盖。超过 `max_bytes`（0 表示不限制）
    /// 时中止并清理临时文件。返回写入的字节数。
    pub async fn put_chunk<R>(
        &self,
        session_id: &str,
        chunk_index: u64,
        reader: &mut R,
        max_bytes: u64,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let final_path = self.chunk_path(session_id, chunk_index);
        let temp_path = self
            .session_dir(session_id)
            .join(format!(".{chunk_index}.part.tmp.{}", Uuid::new_v4()));

        let mut file = File::create(&temp_path).await?;
        let mut written: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    drop(file);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(err.into());
                }
            };
            written += n as u64;
            if max_bytes > 0 && written > max_bytes {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(StoreError::ChunkTooLarge { limit: max_bytes });
            }
            if let Err(err) = file.write_all(&buf[..n]).await {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
        }
        if let Err(err) = file.sync_all().await {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(written)
    }

    pub async fn chunk_exists(&self, session_id: &str, chunk_index: u64) -> bool {
        fs::metadata(self.chunk_path(session_id, chunk_index))
            .await
            .is_ok()
    }

    /// 打开分片用于顺序读取。
    pub async fn open_chunk(&self, session_id: &str, chunk_index: u64) -> Result<File, StoreError> {
        match File::open(self.chunk_path(session_id, chunk_index)).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::ChunkNotFound(chunk_index))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 返回 [0, total_chunks) 中尚无分片文件的序号。
    pub async fn missing_indices(&self, session_id: &str, total_chunks: u64) -> Vec<u64> {
        let present = self.received_indices(session_id).await.unwrap_or_default();
        (0..total_chunks)
            .filter(|index| !present.contains(index))
            .collect()
    }

    /// 扫描会话目录，返回实际存在分片的序号集合。
    ///
    /// 重启后的对账依赖这里：分片文件本身就是持久化的接收记录。
    pub async fn received_indices(&self, session_id: &str) -> Result<HashSet<u64>, StoreError> {
        let mut present = HashSet::new();
        let mut dir = match fs::read_dir(self.session_dir(session_id)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(present),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(index_str) = file_name.strip_suffix(".part") else {
                continue;
            };
            if let Ok(index) = index_str.parse::<u64>() {
                present.insert(index);
            }
        }
        Ok(present)
    }

    /// 删除会话的全部分片与目录；目录不存在时静默成功。
    pub async fn delete_session_chunks(&self, session_id: &str) -> Result<(), StoreError> {
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// 列出当前存在的会话目录名。
    pub async fn list_session_dirs(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(names)
    }
}
