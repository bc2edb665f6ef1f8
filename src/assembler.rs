//! 分片装配器：把完整的分片集合按序号串接成单一字节流。

use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::chunk_store::{ChunkStore, StoreError};

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("missing chunk {0}")]
    MissingChunk(u64),
    #[error("failed reading chunk {index}: {source}")]
    ChunkRead { index: u64, source: io::Error },
    #[error("sink write failed: {0}")]
    SinkWrite(io::Error),
}

/// 依次打开 0..total_chunks 的分片并将其字节完整写入 sink。
///
/// 任何一个分片打不开就整体中止，不向 sink 交付残缺对象，也不动
/// 分片存储，调用方可以重试或精确报告缺失序号。逐块流式拷贝，
/// 内存占用与文件总大小无关。返回写入的总字节数。
pub async fn assemble<W>(
    store: &ChunkStore,
    session_id: &str,
    total_chunks: u64,
    sink: &mut W,
) -> Result<u64, AssembleError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total_written: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];

    for index in 0..total_chunks {
        let mut chunk = match store.open_chunk(session_id, index).await {
            Ok(file) => file,
            Err(StoreError::ChunkNotFound(index)) => {
                return Err(AssembleError::MissingChunk(index));
            }
            Err(err) => {
                return Err(AssembleError::ChunkRead {
                    index,
                    source: io::Error::other(err.to_string()),
                });
            }
        };

        loop {
            let n = chunk
                .read(&mut buf)
                .await
                .map_err(|source| AssembleError::ChunkRead { index, source })?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .await
                .map_err(AssembleError::SinkWrite)?;
            total_written += n as u64;
        }
        debug!(session_id, chunk_index = index, "chunk appended");
    }

    sink.flush().await.map_err(AssembleError::SinkWrite)?;
    Ok(total_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, ChunkStore) {
        let temp = tempdir().expect("tempdir");
        let store = ChunkStore::new(temp.path().join("chunks"));
        (temp, store)
    }

    async fn put_all(store: &ChunkStore, session_id: &str, order: &[u64], chunks: &[&[u8]]) {
        store.create_session_area(session_id).await.expect("area");
        for &index in order {
            store
                .put_chunk(session_id, index, &mut &chunks[index as usize][..], 0)
                .await
                .expect("put chunk");
        }
    }

    #[tokio::test]
    async fn output_is_in_index_order_regardless_of_arrival() {
        let chunks: [&[u8]; 4] = [b"alpha-", b"bravo-", b"charlie-", b"delta"];
        let expected = b"alpha-bravo-charlie-delta".to_vec();

        for order in [vec![3, 2, 1, 0], vec![2, 0, 3, 1]] {
            let (_temp, store) = make_store();
            put_all(&store, "s1", &order, &chunks).await;

            let mut out = Vec::new();
            let written = assemble(&store, "s1", 4, &mut out).await.expect("assemble");
            assert_eq!(written, expected.len() as u64);
            assert_eq!(out, expected);
        }
    }

    #[tokio::test]
    async fn missing_chunk_aborts_and_keeps_the_rest() {
        let chunks: [&[u8]; 3] = [b"aa", b"bb", b"cc"];
        let (_temp, store) = make_store();
        put_all(&store, "s1", &[0, 2], &chunks).await;

        let mut out = Vec::new();
        let result = assemble(&store, "s1", 3, &mut out).await;
        assert!(matches!(result, Err(AssembleError::MissingChunk(1))));
        // chunks must survive so the caller can retry after re-sending index 1
        assert!(store.chunk_exists("s1", 0).await);
        assert!(store.chunk_exists("s1", 2).await);
    }

    struct FailingSink;

    impl AsyncWrite for FailingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<Result<usize, io::Error>> {
            Poll::Ready(Err(io::Error::other("disk full")))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), io::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn sink_failure_aborts_and_keeps_chunks() {
        let chunks: [&[u8]; 2] = [b"aa", b"bb"];
        let (_temp, store) = make_store();
        put_all(&store, "s1", &[0, 1], &chunks).await;

        let mut sink = FailingSink;
        let result = assemble(&store, "s1", 2, &mut sink).await;
        assert!(matches!(result, Err(AssembleError::SinkWrite(_))));
        assert!(store.chunk_exists("s1", 0).await);
        assert!(store.chunk_exists("s1", 1).await);
    }
}
