use crate::channel::MessageChannel;
use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::job::FileJob;
use crate::retry::Backoff;
use crate::splitter::{Chunk, ChunkStream};
use crate::store::PayloadStore;
use crate::tracker::TrackerHandle;
use chunkq_common::{ChunkTask, FileRegistration, PayloadRef, checksum, format_size};
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

/// 一次派发的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub total_chunks: u64,
    pub published: u64,
    /// 发布失败后重试的总次数
    pub retries: u64,
    pub bytes: u64,
}

enum ChunkPublish {
    Published { retries: u32, bytes: u64 },
    Exhausted { chunk_index: u64 },
    Source(Error),
}

pub struct Dispatcher {
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn PayloadStore>,
    tracker: TrackerHandle,
    max_attempts: u32,
    backoff: Backoff,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn PayloadStore>,
        tracker: TrackerHandle,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            channel,
            store,
            tracker,
            max_attempts: config.publish_max_attempts.max(1),
            backoff: Backoff::from_config(config),
            concurrency: config.publish_concurrency.max(1),
        }
    }

    /// 先向跟踪器注册分块总数，再逐块发布。
    ///
    /// 某个分块发布重试耗尽不会中断其他分块；全部尝试完之后返回
    /// `Error::Publish`，已发布的分块保持有效，是否取消由调用方决定。
    #[instrument(skip_all, fields(file_id = %job.file_id, total_chunks = job.total_chunks))]
    pub async fn dispatch(&self, job: &FileJob, chunks: ChunkStream) -> Result<DispatchReport> {
        self.tracker
            .register(FileRegistration {
                file_id: job.file_id,
                total_chunks: job.total_chunks,
            })
            .await?;

        info!("文件已注册，开始发布分块");

        let results: Vec<ChunkPublish> = chunks
            .map(|chunk| self.publish_chunk(job, chunk))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = DispatchReport {
            total_chunks: job.total_chunks,
            ..DispatchReport::default()
        };
        let mut failed_indices = Vec::new();
        let mut source_error = None;

        for result in results {
            match result {
                ChunkPublish::Published { retries, bytes } => {
                    report.published += 1;
                    report.retries += retries as u64;
                    report.bytes += bytes;
                }
                ChunkPublish::Exhausted { chunk_index } => failed_indices.push(chunk_index),
                ChunkPublish::Source(e) => {
                    if source_error.is_none() {
                        source_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = source_error {
            error!(error = %e, published = report.published, "读取分块失败，派发中止");
            return Err(e);
        }

        if !failed_indices.is_empty() {
            failed_indices.sort_unstable();
            error!(
                failed = ?failed_indices,
                published = report.published,
                "部分分块发布失败"
            );
            return Err(Error::Publish {
                file_id: job.file_id,
                failed_indices,
                attempts: self.max_attempts,
            });
        }

        if report.published != job.total_chunks {
            return Err(Error::InvalidInput(format!(
                "分块数与注册数不一致：注册 {}，实际 {}",
                job.total_chunks, report.published
            )));
        }

        info!(
            published = report.published,
            retries = report.retries,
            size = %format_size(report.bytes),
            "所有分块已发布"
        );
        Ok(report)
    }

    async fn publish_chunk(&self, job: &FileJob, chunk: Result<Chunk>) -> ChunkPublish {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return ChunkPublish::Source(e),
        };
        if chunk.index >= job.total_chunks {
            return ChunkPublish::Source(Error::InvalidInput(format!(
                "分块序号 {} 超出注册的总数 {}",
                chunk.index, job.total_chunks
            )));
        }

        let payload_ref = PayloadRef::for_chunk(job.file_id, chunk.index);
        let task = ChunkTask {
            file_id: job.file_id,
            chunk_index: chunk.index,
            payload_ref: payload_ref.clone(),
            total_chunks: job.total_chunks,
            checksum: checksum(&chunk.data),
            dispatch_round: 0,
        };
        let bytes = chunk.len() as u64;

        for attempt in 1..=self.max_attempts {
            let result: Result<()> = async {
                self.store.put(&payload_ref, chunk.data.clone()).await?;
                self.channel.publish(task.clone()).await
            }
            .await;

            match result {
                Ok(()) => {
                    return ChunkPublish::Published {
                        retries: attempt - 1,
                        bytes,
                    };
                }
                Err(Error::ChannelClosed) => {
                    warn!(chunk_index = chunk.index, "通道已关闭，放弃发布");
                    break;
                }
                Err(e) => {
                    warn!(
                        chunk_index = chunk.index,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "分块发布失败"
                    );
                    if attempt < self.max_attempts {
                        sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        ChunkPublish::Exhausted {
            chunk_index: chunk.index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Delivery, DeadLetter, DeliveryTag, MemoryChannel};
    use crate::config::QueueConfig;
    use crate::splitter::split_bytes;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chunkq_common::FileId;

    /// 每次发布前检查文件已经在跟踪器中注册
    struct RegistrationCheckingChannel {
        inner: MemoryChannel,
        tracker: TrackerHandle,
    }

    #[async_trait]
    impl MessageChannel for RegistrationCheckingChannel {
        async fn publish(&self, task: ChunkTask) -> Result<()> {
            let snapshot = self.tracker.snapshot(task.file_id).await?;
            assert!(snapshot.is_some(), "发布时文件尚未注册");
            self.inner.publish(task).await
        }
        async fn receive(&self) -> Result<Delivery> {
            self.inner.receive().await
        }
        async fn ack(&self, tag: DeliveryTag) -> Result<()> {
            self.inner.ack(tag).await
        }
        async fn nack(&self, tag: DeliveryTag) -> Result<()> {
            self.inner.nack(tag).await
        }
        async fn dead_letter(&self, tag: DeliveryTag, reason: String) -> Result<()> {
            self.inner.dead_letter(tag, reason).await
        }
        async fn receive_dead_letter(&self) -> Result<DeadLetter> {
            self.inner.receive_dead_letter().await
        }
        async fn purge_file(&self, file_id: FileId) -> Result<usize> {
            self.inner.purge_file(file_id).await
        }
        fn close(&self) {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn registers_before_publishing_and_stores_payloads() {
        let (tracker, _completions, _task) = TrackerHandle::spawn();
        let channel = Arc::new(RegistrationCheckingChannel {
            inner: MemoryChannel::declare(&QueueConfig::default()),
            tracker: tracker.clone(),
        });
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            channel.clone(),
            store.clone(),
            tracker.clone(),
            &DispatchConfig::default(),
        );

        let data = Bytes::from(vec![9u8; 3500]);
        let chunks = split_bytes(data.clone(), 1000).unwrap();
        let job = FileJob::new(FileId::new(), chunks.total_chunks());

        let report = dispatcher.dispatch(&job, chunks.into_stream()).await.unwrap();
        assert_eq!(report.published, 4);
        assert_eq!(report.retries, 0);
        assert_eq!(report.bytes, 3500);

        let mut tasks = channel.inner.ready_tasks();
        tasks.sort_by_key(|t| t.chunk_index);
        assert_eq!(tasks.len(), 4);
        for task in &tasks {
            assert_eq!(task.total_chunks, 4);
            let payload = store.get(&task.payload_ref).await.unwrap();
            assert_eq!(task.checksum, checksum(&payload));
        }
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn mismatched_total_is_rejected() {
        let (tracker, _completions, _task) = TrackerHandle::spawn();
        let channel = Arc::new(MemoryChannel::declare(&QueueConfig::default()));
        let dispatcher = Dispatcher::new(
            channel,
            Arc::new(MemoryStore::new()),
            tracker,
            &DispatchConfig::default(),
        );

        let chunks = split_bytes(Bytes::from(vec![0u8; 3000]), 1000).unwrap();
        let job = FileJob::new(FileId::new(), 2);

        let err = dispatcher.dispatch(&job, chunks.into_stream()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
