use crate::error::ProcessingError;
use async_trait::async_trait;
use bytes::Bytes;
use chunkq_common::ChunkTask;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::info;

/// 分块的业务处理逻辑。
///
/// 返回 `ProcessingError::Transient` 会触发重投，`Permanent` 直接判定终止失败。
/// 同一分块可能被处理多次，实现需要幂等。
#[async_trait]
pub trait ChunkProcessor: Send + Sync {
    async fn process(&self, task: &ChunkTask, data: Bytes) -> Result<(), ProcessingError>;
}

/// 计算每个分块的 SHA-256 摘要并写入日志
#[derive(Debug, Default, Clone)]
pub struct DigestProcessor {
    fail_chunks: HashSet<u64>,
}

impl DigestProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定的分块总是以永久错误失败，用于演示部分失败
    pub fn with_failing_chunks(fail_chunks: impl IntoIterator<Item = u64>) -> Self {
        Self {
            fail_chunks: fail_chunks.into_iter().collect(),
        }
    }

    pub fn digest(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }
}

#[async_trait]
impl ChunkProcessor for DigestProcessor {
    async fn process(&self, task: &ChunkTask, data: Bytes) -> Result<(), ProcessingError> {
        if self.fail_chunks.contains(&task.chunk_index) {
            return Err(ProcessingError::permanent(format!(
                "分块 {} 被配置为失败",
                task.chunk_index
            )));
        }

        // 哈希是 CPU 密集操作，放到阻塞线程池
        let digest = tokio::task::spawn_blocking(move || Self::digest(&data))
            .await
            .map_err(|e| ProcessingError::transient(format!("摘要任务异常退出: {e}")))?;

        info!(
            file_id = %task.file_id,
            chunk_index = task.chunk_index,
            sha256 = %digest,
            "分块摘要"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkq_common::{FileId, PayloadRef, checksum};

    fn task(chunk_index: u64) -> ChunkTask {
        let file_id = FileId::new();
        ChunkTask {
            file_id,
            chunk_index,
            payload_ref: PayloadRef::for_chunk(file_id, chunk_index),
            total_chunks: 4,
            checksum: checksum(b"abc"),
            dispatch_round: 0,
        }
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            DigestProcessor::digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn configured_chunk_fails_permanently() {
        let processor = DigestProcessor::with_failing_chunks([2]);
        let data = Bytes::from_static(b"abc");

        assert!(processor.process(&task(1), data.clone()).await.is_ok());
        let err = processor.process(&task(2), data).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
