//! 测试共用的内存对象存储与记录型目录。

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::Notify;

use crate::catalog::{Catalog, CatalogError};
use crate::object_store::{ObjectStore, ObjectStoreError, ObjectWriter};

#[derive(Default)]
struct MemoryState {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    finalize_gate: Mutex<Option<Arc<Notify>>>,
}

/// 全内存对象存储，可选地卡住 finalize 以制造竞态窗口。
#[derive(Default)]
pub struct MemoryObjectStore {
    state: Arc<MemoryState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.objects.lock().expect("objects lock").get(key).cloned()
    }

    pub fn put_count(&self) -> usize {
        self.state.puts.load(Ordering::SeqCst)
    }

    /// 让下一次 finalize 阻塞，直到 release_finalize 被调用。
    pub fn hold_finalize(&self) {
        *self.state.finalize_gate.lock().expect("gate lock") = Some(Arc::new(Notify::new()));
    }

    pub fn release_finalize(&self) {
        if let Some(gate) = self.state.finalize_gate.lock().expect("gate lock").take() {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn object_key_for(&self, owner_id: &str, target_path: &str, name: &str) -> String {
        let mut segments = vec![owner_id.trim().to_string()];
        segments.extend(
            target_path
                .split('/')
                .map(str::trim)
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
        );
        segments.push(name.trim().to_string());
        segments.join("/")
    }

    async fn start_object(&self, key: &str) -> Result<Box<dyn ObjectWriter>, ObjectStoreError> {
        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buf: Vec::new(),
            state: self.state.clone(),
        }))
    }

    async fn reference_for(&self, key: &str) -> Result<String, ObjectStoreError> {
        Ok(format!("mem://{key}"))
    }
}

struct MemoryWriter {
    key: String,
    buf: Vec<u8>,
    state: Arc<MemoryState>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn finalize(self: Box<Self>) -> Result<(), ObjectStoreError> {
        let gate = self
            .state
            .finalize_gate
            .lock()
            .expect("gate lock")
            .clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state
            .objects
            .lock()
            .expect("objects lock")
            .insert(self.key.clone(), self.buf);
        self.state.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

/// 目录的一次登记调用。
#[derive(Clone, Debug)]
pub struct RegisteredFile {
    pub owner_id: String,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub object_key: String,
}

/// 记录每次 register_file 调用的目录替身，可注入单次失败。
#[derive(Default)]
pub struct RecordingCatalog {
    calls: Mutex<Vec<RegisteredFile>>,
    fail_next: AtomicBool,
    next_id: AtomicUsize,
}

impl RecordingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RegisteredFile> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Catalog for RecordingCatalog {
    async fn register_file(
        &self,
        owner_id: &str,
        name: &str,
        path: &str,
        size: u64,
        object_key: &str,
    ) -> Result<String, CatalogError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CatalogError::Write(io::Error::other(
                "injected catalog failure",
            )));
        }
        self.calls.lock().expect("calls lock").push(RegisteredFile {
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            path: path.to_string(),
            size,
            object_key: object_key.to_string(),
        });
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("file-{id}"))
    }
}
