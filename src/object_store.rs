//! 对象存储接口与内置的文件系统后端。

use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWrite;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object key")]
    InvalidKey,
    #[error("object write failed: {0}")]
    Write(#[from] io::Error),
}

/// 核心对对象存储的全部要求：键命名、两阶段写入与引用生成。
///
/// `#[async_trait]` 保持对象安全，编排器通过 `Arc<dyn ObjectStore>`
/// 分发，S3 等远端后端在部署侧替换这里即可。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 由 (所有者, 目标路径, 文件名) 推导对象键；命名策略属于适配器。
    fn object_key_for(&self, owner_id: &str, target_path: &str, name: &str) -> String;

    /// 开始写入对象，返回两阶段写句柄。
    async fn start_object(&self, key: &str) -> Result<Box<dyn ObjectWriter>, ObjectStoreError>;

    /// 生成对象的可取回引用（签名 URL 或等价物）。
    async fn reference_for(&self, key: &str) -> Result<String, ObjectStoreError>;
}

/// 两阶段对象写句柄：`finalize` 之前对读者不可见。
#[async_trait]
pub trait ObjectWriter: AsyncWrite + Send + Unpin {
    /// 同步并原子发布对象。
    async fn finalize(self: Box<Self>) -> Result<(), ObjectStoreError>;
    /// 放弃写入并清理中间产物。
    async fn abort(self: Box<Self>);
}

/// 本地目录后端：对象即文件，键即相对路径。
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// 把对象键解析成 root 下的安全路径，拒绝任何越界成分。
    fn resolve(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let trimmed = key.trim_start_matches(['/', '\\']);
        if trimmed.is_empty() {
            return Err(ObjectStoreError::InvalidKey);
        }
        let mut normalized = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ObjectStoreError::InvalidKey);
                }
            }
        }
        Ok(self.root.join(normalized))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn object_key_for(&self, owner_id: &str, target_path: &str, name: &str) -> String {
        let mut segments = vec![owner_id.trim().to_string()];
        segments.extend(
            target_path
                .split(['/', '\\'])
                .map(str::trim)
                .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
                .map(str::to_string),
        );
        segments.push(name.trim().to_string());
        segments.join("/")
    }

    async fn start_object(&self, key: &str) -> Result<Box<dyn ObjectWriter>, ObjectStoreError> {
        let target = self.resolve(key)?;
        let parent = target.parent().ok_or(ObjectStoreError::InvalidKey)?;
        fs::create_dir_all(parent).await?;

        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "object".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Box::new(FsObjectWriter {
            target,
            temp_path,
            file,
        }))
    }

    async fn reference_for(&self, key: &str) -> Result<String, ObjectStoreError> {
        let target = self.resolve(key)?;
        Ok(format!("file://{}", target.display()))
    }
}

/// 临时文件写入加原子重命名，失败时目标文件保持原样。
pub struct FsObjectWriter {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AsyncWrite for FsObjectWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl ObjectWriter for FsObjectWriter {
    async fn finalize(self: Box<Self>) -> Result<(), ObjectStoreError> {
        self.file.sync_all().await?;
        drop(self.file);

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err.into());
        }
        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
