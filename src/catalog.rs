//! 文件目录（外部元数据库的窄接口）与内置 JSONL 后端。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog write failed: {0}")]
    Write(#[from] io::Error),
    #[error("catalog encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 核心只需要一件事：登记一个已落盘的对象，换回文件 ID。
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn register_file(
        &self,
        owner_id: &str,
        name: &str,
        path: &str,
        size: u64,
        object_key: &str,
    ) -> Result<String, CatalogError>;
}

/// 目录中的一行登记记录。
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: String,
    pub owner_id: String,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub object_key: String,
    pub content_type: String,
    pub registered_at: DateTime<Utc>,
}

/// 追加式 JSONL 目录，一行一条记录。
#[derive(Debug)]
pub struct JsonlCatalog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlCatalog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Catalog for JsonlCatalog {
    async fn register_file(
        &self,
        owner_id: &str,
        name: &str,
        path: &str,
        size: u64,
        object_key: &str,
    ) -> Result<String, CatalogError> {
        let record = FileRecord {
            file_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            size,
            object_key: object_key.to_string(),
            content_type: mime_guess::from_path(name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            registered_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        info!(
            file_id = record.file_id,
            owner_id, name, size, object_key, "file registered"
        );
        Ok(record.file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn register_appends_one_parseable_line_per_file() {
        let temp = tempdir().expect("tempdir");
        let catalog = JsonlCatalog::new(temp.path().join("catalog.jsonl"));

        let first = catalog
            .register_file("user1", "video.mp4", "/movies", 15728640, "user1/movies/video.mp4")
            .await
            .expect("register");
        let second = catalog
            .register_file("user1", "notes.txt", "/", 12, "user1/notes.txt")
            .await
            .expect("register");
        assert_ne!(first, second);

        let contents = std::fs::read_to_string(temp.path().join("catalog.jsonl")).expect("read");
        let records: Vec<FileRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("parse line"))
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file_id, first);
        assert_eq!(records[0].size, 15728640);
        assert_eq!(records[0].content_type, "video/mp4");
        assert_eq!(records[1].content_type, "text/plain");
    }
}
