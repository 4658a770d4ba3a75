use crate::channel::{Delivery, MessageChannel};
use crate::error::{Error, ProcessingError};
use crate::processor::ChunkProcessor;
use crate::retry::{Disposition, RetryPolicy};
use crate::store::PayloadStore;
use crate::tracker::TrackerHandle;
use chunkq_common::{ChunkOutcome, ChunkTask, checksum};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// worker 共享的依赖，只读
pub struct WorkerContext {
    pub channel: Arc<dyn MessageChannel>,
    pub store: Arc<dyn PayloadStore>,
    pub tracker: TrackerHandle,
    pub processor: Arc<dyn ChunkProcessor>,
    pub policy: RetryPolicy,
    /// 单次处理的时限，超过视为暂时性错误
    pub processing_timeout: Duration,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(count: usize, ctx: Arc<WorkerContext>, shutdown: CancellationToken) -> Self {
        info!(count, "启动 worker");
        let handles = (0..count)
            .map(|id| tokio::spawn(run_worker(id, ctx.clone(), shutdown.clone())))
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 等待所有 worker 退出
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("worker 任务 panic: {e:?}");
                }
            }
        }
    }
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    debug!(worker = id, "worker 已启动");
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = ctx.channel.receive() => match received {
                Ok(delivery) => delivery,
                Err(Error::ChannelClosed) => break,
                Err(e) => {
                    error!(worker = id, error = %e, "接收消息失败");
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        handle_delivery(id, &ctx, delivery).await;
    }
    debug!(worker = id, "worker 已退出");
}

/// 处理一次投递：先上报结果，再确认/否认/死信
#[instrument(
    skip(ctx, delivery),
    fields(
        file_id = %delivery.task.file_id,
        chunk_index = delivery.task.chunk_index,
        redelivery = delivery.redelivery_count,
    )
)]
pub async fn handle_delivery(worker: usize, ctx: &WorkerContext, delivery: Delivery) {
    let task = &delivery.task;
    let processed = process(ctx, task).await;
    let decision = ctx
        .policy
        .decide(delivery.redelivery_count, task.dispatch_round, &processed);

    let detail = match &processed {
        Ok(()) => None,
        Err(e) => {
            warn!(error = %e, disposition = ?decision.disposition, "分块处理失败");
            Some(e.to_string())
        }
    };

    let outcome = ChunkOutcome {
        file_id: task.file_id,
        chunk_index: task.chunk_index,
        result: decision.result,
        detail: detail.clone(),
    };
    if let Err(e) = ctx.tracker.report(outcome).await {
        error!(error = %e, "无法上报分块结果");
    }

    let settled = match decision.disposition {
        Disposition::Ack => ctx.channel.ack(delivery.tag).await,
        Disposition::Requeue => ctx.channel.nack(delivery.tag).await,
        Disposition::DeadLetter => {
            let reason = detail.unwrap_or_else(|| "重投次数耗尽".to_string());
            ctx.channel.dead_letter(delivery.tag, reason).await
        }
    };
    match settled {
        Ok(()) => debug!(result = ?decision.result, "分块处理完成"),
        Err(e) => error!(error = %e, "确认消息失败"),
    }
}

async fn process(ctx: &WorkerContext, task: &ChunkTask) -> Result<(), ProcessingError> {
    if task.chunk_index >= task.total_chunks {
        return Err(ProcessingError::permanent(format!(
            "分块序号 {} 超出总数 {}",
            task.chunk_index, task.total_chunks
        )));
    }

    let data = ctx
        .store
        .get(&task.payload_ref)
        .await
        .map_err(|e| ProcessingError::transient(format!("读取分块数据失败: {e}")))?;

    if checksum(&data) != task.checksum {
        return Err(ProcessingError::permanent("分块数据校验失败"));
    }

    // processor panic 不能带走 worker，按暂时性错误处理
    let processing = AssertUnwindSafe(ctx.processor.process(task, data)).catch_unwind();
    match timeout(ctx.processing_timeout, processing).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(ProcessingError::transient(format!(
            "处理分块时 panic: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => Err(ProcessingError::transient(format!(
            "处理超时 ({:?})",
            ctx.processing_timeout
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "未知 panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::config::QueueConfig;
    use crate::retry::DeadLetterPolicy;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chunkq_common::{FileId, FileRegistration, PayloadRef};
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<Result<(), ProcessingError>>>);

    #[async_trait]
    impl ChunkProcessor for Scripted {
        async fn process(&self, _task: &ChunkTask, _data: Bytes) -> Result<(), ProcessingError> {
            self.0.lock().unwrap().remove(0)
        }
    }

    async fn setup(
        script: Vec<Result<(), ProcessingError>>,
        limit: u32,
    ) -> (Arc<MemoryChannel>, WorkerContext, ChunkTask) {
        let channel = Arc::new(MemoryChannel::declare(&QueueConfig {
            redelivery_limit: limit,
            ..QueueConfig::default()
        }));
        let store = Arc::new(MemoryStore::new());
        let (tracker, _completions, _task) = TrackerHandle::spawn();

        let file_id = FileId::new();
        let data = Bytes::from_static(b"payload");
        let task = ChunkTask {
            file_id,
            chunk_index: 0,
            payload_ref: PayloadRef::for_chunk(file_id, 0),
            total_chunks: 1,
            checksum: checksum(&data),
            dispatch_round: 0,
        };
        store.put(&task.payload_ref, data).await.unwrap();
        tracker
            .register(FileRegistration {
                file_id,
                total_chunks: 1,
            })
            .await
            .unwrap();
        channel.publish(task.clone()).await.unwrap();

        let ctx = WorkerContext {
            channel: channel.clone(),
            store,
            tracker,
            processor: Arc::new(Scripted(Mutex::new(script))),
            policy: RetryPolicy {
                redelivery_limit: limit,
                dead_letter: DeadLetterPolicy::Hold,
            },
            processing_timeout: Duration::from_secs(5),
        };
        (channel, ctx, task)
    }

    #[tokio::test]
    async fn success_is_acked_and_recorded() {
        let (channel, ctx, task) = setup(vec![Ok(())], 5).await;

        let delivery = channel.receive().await.unwrap();
        handle_delivery(0, &ctx, delivery).await;

        assert_eq!(channel.in_flight_len(), 0);
        assert_eq!(channel.ready_len(), 0);
        let snapshot = ctx.tracker.snapshot(task.file_id).await.unwrap().unwrap();
        assert!(snapshot.succeeded.is_marked(0));
    }

    #[tokio::test]
    async fn transient_failure_is_redelivered_until_limit_then_terminal() {
        let script = (0..3).map(|_| Err(ProcessingError::transient("busy"))).collect();
        let (channel, ctx, task) = setup(script, 2).await;

        for expected_count in 0..=2 {
            let delivery = channel.receive().await.unwrap();
            assert_eq!(delivery.redelivery_count, expected_count);
            handle_delivery(0, &ctx, delivery).await;
        }

        assert_eq!(channel.ready_len(), 0);
        assert_eq!(channel.dead_letter_len(), 1);
        let snapshot = ctx.tracker.snapshot(task.file_id).await.unwrap().unwrap();
        assert!(snapshot.failed.is_marked(0));
        assert_eq!(snapshot.outstanding, 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_acked_without_redelivery() {
        let (channel, ctx, task) =
            setup(vec![Err(ProcessingError::permanent("malformed"))], 5).await;

        let delivery = channel.receive().await.unwrap();
        handle_delivery(0, &ctx, delivery).await;

        assert_eq!(channel.ready_len(), 0);
        assert_eq!(channel.dead_letter_len(), 0);
        let snapshot = ctx.tracker.snapshot(task.file_id).await.unwrap().unwrap();
        assert!(snapshot.failed.is_marked(0));
    }

    #[tokio::test]
    async fn checksum_mismatch_is_permanent() {
        let (channel, ctx, task) = setup(vec![Ok(())], 5).await;
        ctx.store
            .put(&task.payload_ref, Bytes::from_static(b"tampered"))
            .await
            .unwrap();

        let delivery = channel.receive().await.unwrap();
        handle_delivery(0, &ctx, delivery).await;

        let snapshot = ctx.tracker.snapshot(task.file_id).await.unwrap().unwrap();
        assert_eq!(snapshot.failed.marked_ids(), vec![0]);
        assert_eq!(channel.ready_len(), 0);
    }

    struct Panicking;

    #[async_trait]
    impl ChunkProcessor for Panicking {
        async fn process(&self, task: &ChunkTask, _data: Bytes) -> Result<(), ProcessingError> {
            panic!("chunk {} exploded", task.chunk_index);
        }
    }

    #[tokio::test]
    async fn processor_panic_is_requeued_as_transient() {
        let (channel, mut ctx, task) = setup(Vec::new(), 5).await;
        ctx.processor = Arc::new(Panicking);

        let delivery = channel.receive().await.unwrap();
        handle_delivery(0, &ctx, delivery).await;

        // worker 存活，消息被否认并重新入队
        assert_eq!(channel.in_flight_len(), 0);
        assert_eq!(channel.ready_len(), 1);
        let redelivered = channel.receive().await.unwrap();
        assert_eq!(redelivered.redelivery_count, 1);
        assert_eq!(redelivered.task, task);
    }

    #[tokio::test]
    async fn pool_survives_panicking_processor() {
        let (channel, mut ctx, task) = setup(Vec::new(), 1).await;
        ctx.processor = Arc::new(Panicking);
        let tracker = ctx.tracker.clone();
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(1, Arc::new(ctx), shutdown.clone());

        // 一次投递加一次重投后进入死信，唯一的 worker 一直在处理
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.dead_letter_len() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let snapshot = tracker.snapshot(task.file_id).await.unwrap().unwrap();
        assert!(snapshot.failed.is_marked(0));

        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn pool_stops_on_shutdown() {
        let (channel, ctx, _task) = setup(vec![Ok(())], 5).await;
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(3, Arc::new(ctx), shutdown.clone());
        assert_eq!(pool.len(), 3);

        shutdown.cancel();
        pool.join().await;
        // 已投递的消息要么被确认，要么留在队列里
        assert_eq!(channel.in_flight_len(), 0);
    }
}
