use crate::channel::{DeadLetter, MessageChannel};
use crate::config::Config;
use crate::dead_letter::{DeadLetterMonitor, ParkedDeadLetters};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::{Error, Result};
use crate::job::FileJob;
use crate::processor::ChunkProcessor;
use crate::retry::RetryPolicy;
use crate::splitter::{ChunkStream, split_bytes, split_file};
use crate::store::PayloadStore;
use crate::tracker::{FileSnapshot, TrackerHandle};
use crate::worker::{WorkerContext, WorkerPool};
use bytes::Bytes;
use chunkq_common::{FileCompletion, FileId, format_size};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 一次提交的结果
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: FileJob,
    pub report: DispatchReport,
}

/// 把拆分、派发、worker、死信监视器和完成跟踪器组装在一起
pub struct Scheduler {
    config: Config,
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn PayloadStore>,
    tracker: TrackerHandle,
    dispatcher: Dispatcher,
    workers: WorkerPool,
    monitor: JoinHandle<()>,
    tracker_task: JoinHandle<()>,
    parked: ParkedDeadLetters,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// 启动所有后台任务，返回调度器和完成通知接收端
    pub fn start(
        config: Config,
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn PayloadStore>,
        processor: Arc<dyn ChunkProcessor>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FileCompletion>)> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let (tracker, completions, tracker_task) = TrackerHandle::spawn();

        let dispatcher = Dispatcher::new(
            channel.clone(),
            store.clone(),
            tracker.clone(),
            &config.dispatch,
        );

        let ctx = Arc::new(WorkerContext {
            channel: channel.clone(),
            store: store.clone(),
            tracker: tracker.clone(),
            processor,
            policy: RetryPolicy::from_config(&config),
            processing_timeout: config.queue.visibility_timeout(),
        });
        let workers = WorkerPool::spawn(config.workers.count, ctx, shutdown.clone());

        let monitor = DeadLetterMonitor::new(channel.clone(), tracker.clone(), config.dead_letter);
        let parked = monitor.parked();
        let monitor = tokio::spawn(monitor.run(shutdown.clone()));

        info!(
            queue = %config.queue.name,
            workers = config.workers.count,
            "调度器已启动"
        );

        let scheduler = Self {
            config,
            channel,
            store,
            tracker,
            dispatcher,
            workers,
            monitor,
            tracker_task,
            parked,
            shutdown,
        };
        Ok((scheduler, completions))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &TrackerHandle {
        &self.tracker
    }

    /// 提交内存中的数据
    pub async fn submit_bytes(&self, data: Bytes) -> Result<Submission> {
        let chunks = split_bytes(data, self.config.dispatch.chunk_size)?;
        let job = FileJob::new(FileId::new(), chunks.total_chunks());
        self.submit(job, chunks.into_stream()).await
    }

    /// 提交磁盘上的文件，分块在派发时流式读取
    pub async fn submit_file(&self, path: &Path) -> Result<Submission> {
        let file = split_file(path, self.config.dispatch.chunk_size).await?;
        let job = FileJob::new(FileId::new(), file.total_chunks);
        info!(
            file_id = %job.file_id,
            path = %path.display(),
            size = %format_size(file.file_size),
            total_chunks = file.total_chunks,
            "提交文件"
        );
        self.submit(job, file.chunks).await
    }

    async fn submit(&self, job: FileJob, chunks: ChunkStream) -> Result<Submission> {
        match self.dispatcher.dispatch(&job, chunks).await {
            Ok(report) => Ok(Submission { job, report }),
            // 已发布的分块仍然有效，是否取消交给调用方
            Err(e @ Error::Publish { .. }) => Err(e),
            Err(e) => {
                // 分块读不完，文件不可能正常结束
                warn!(file_id = %job.file_id, error = %e, "派发失败，取消文件");
                if let Err(cancel_err) = self.cancel(job.file_id).await {
                    error!(file_id = %job.file_id, error = %cancel_err, "取消文件失败");
                }
                Err(e)
            }
        }
    }

    /// 取消文件：立即发出失败通知，并尽力清除队列中剩余的分块
    pub async fn cancel(&self, file_id: FileId) -> Result<bool> {
        let cancelled = self.tracker.cancel(file_id).await?;
        if cancelled {
            let purged = self.channel.purge_file(file_id).await?;
            info!(%file_id, purged, "文件已取消");
        }
        Ok(cancelled)
    }

    pub async fn snapshot(&self, file_id: FileId) -> Result<Option<FileSnapshot>> {
        self.tracker.snapshot(file_id).await
    }

    /// 确认已收到完成通知：归档文件并删除暂存的分块数据
    pub async fn acknowledge(&self, file_id: FileId) -> Result<bool> {
        if !self.tracker.acknowledge(file_id).await? {
            return Ok(false);
        }
        self.store.delete_file(file_id).await?;
        Ok(true)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.parked.all()
    }

    /// 取出某个文件暂存的死信，用于重新提交
    pub fn take_dead_letters(&self, file_id: FileId) -> Vec<DeadLetter> {
        self.parked.take_file(file_id)
    }

    /// 停止所有后台任务。未确认的消息留在通道中
    pub async fn shutdown(self) {
        info!("正在关闭调度器...");
        let Self {
            channel,
            tracker,
            dispatcher,
            workers,
            monitor,
            tracker_task,
            shutdown,
            ..
        } = self;

        shutdown.cancel();
        channel.close();

        workers.join().await;
        if let Err(e) = monitor.await {
            error!("死信监视器退出异常: {e:?}");
        }

        // 所有句柄丢弃后跟踪器任务才会退出
        drop(dispatcher);
        drop(tracker);
        let abort_handle = tracker_task.abort_handle();
        match tokio::time::timeout(Duration::from_secs(10), tracker_task).await {
            Ok(Ok(())) => info!("完成跟踪器已关闭"),
            Ok(Err(e)) if e.is_panic() => error!("完成跟踪器 panic: {e:?}"),
            Ok(Err(_)) => info!("完成跟踪器已被中止"),
            Err(_) => {
                error!("等待完成跟踪器超时, 将强制中止");
                abort_handle.abort();
            }
        }
        info!("调度器已关闭");
    }
}
