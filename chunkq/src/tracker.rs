//! 完成跟踪器。
//!
//! 所有文件的 `FileProgress` 都由一个后台任务独占，外部只能通过
//! `TrackerHandle` 发送命令，因此同一文件的结果应用天然是串行的。
//! 注册之前到达的结果会被缓存，注册完成后按到达顺序补上。
//! 文件进入终态时，完成通知恰好发送一次。
//!
//! 缓存和归档记录都有上限：缓存最多保留 `PENDING_FILES_CAPACITY` 个未注册文件，
//! 超出时丢弃最早开始缓存的文件；归档只记住最近 `ARCHIVED_FILES_CAPACITY` 个文件。

use crate::error::{Error, Result};
use crate::job::{FileJob, FileStatus};
use crate::progress::{Applied, FileProgress};
use crate::recent::RecentSet;
use chunkq_common::{
    ChunkBitmap, ChunkOutcome, CompletionStatus, FileCompletion, FileId, FileRegistration,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 1024;
pub const PENDING_FILES_CAPACITY: usize = 1024;
pub const ARCHIVED_FILES_CAPACITY: usize = 4096;

/// 某个文件当前进度的只读快照
#[derive(Debug, Clone, Serialize)]
pub struct FileSnapshot {
    pub job: FileJob,
    pub succeeded: ChunkBitmap,
    pub failed: ChunkBitmap,
    pub outstanding: u64,
}

enum Command {
    Register {
        registration: FileRegistration,
        reply: oneshot::Sender<Result<()>>,
    },
    Outcome(ChunkOutcome),
    Cancel {
        file_id: FileId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        file_id: FileId,
        reply: oneshot::Sender<Option<FileSnapshot>>,
    },
    Acknowledge {
        file_id: FileId,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<Command>,
}

impl TrackerHandle {
    /// 启动跟踪器任务，返回句柄与完成通知接收端。
    /// 所有句柄被丢弃后任务退出。
    pub fn spawn() -> (
        TrackerHandle,
        mpsc::UnboundedReceiver<FileCompletion>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let tracker = Tracker::new(completion_tx);
        let handle = tokio::spawn(tracker.run(rx));
        (TrackerHandle { tx }, completion_rx, handle)
    }

    /// 注册文件的分块总数，返回时注册已生效
    pub async fn register(&self, registration: FileRegistration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            registration,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::TrackerClosed)?
    }

    pub async fn report(&self, outcome: ChunkOutcome) -> Result<()> {
        self.send(Command::Outcome(outcome)).await
    }

    /// 取消文件：立即判定为失败。文件不存在或已结束时返回 false
    pub async fn cancel(&self, file_id: FileId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { file_id, reply }).await?;
        rx.await.map_err(|_| Error::TrackerClosed)
    }

    pub async fn snapshot(&self, file_id: FileId) -> Result<Option<FileSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { file_id, reply }).await?;
        rx.await.map_err(|_| Error::TrackerClosed)
    }

    /// 外部确认终态后归档文件。文件未结束时返回 false
    pub async fn acknowledge(&self, file_id: FileId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acknowledge { file_id, reply }).await?;
        rx.await.map_err(|_| Error::TrackerClosed)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::TrackerClosed)
    }
}

struct TrackedFile {
    job: FileJob,
    progress: FileProgress,
    notified: bool,
}

struct Tracker {
    files: HashMap<FileId, TrackedFile>,
    // 注册前到达的结果
    pending: HashMap<FileId, Vec<ChunkOutcome>>,
    // 按开始缓存的顺序排列
    pending_order: VecDeque<FileId>,
    // 最近归档的文件，迟到的结果直接丢弃
    archived: RecentSet<FileId>,
    completion_tx: mpsc::UnboundedSender<FileCompletion>,
}

impl Tracker {
    fn new(completion_tx: mpsc::UnboundedSender<FileCompletion>) -> Self {
        Self {
            files: HashMap::new(),
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            archived: RecentSet::new(ARCHIVED_FILES_CAPACITY),
            completion_tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("完成跟踪器已启动");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register {
                    registration,
                    reply,
                } => {
                    let _ = reply.send(self.register(registration));
                }
                Command::Outcome(outcome) => self.apply(outcome),
                Command::Cancel { file_id, reply } => {
                    let _ = reply.send(self.cancel(file_id));
                }
                Command::Snapshot { file_id, reply } => {
                    let _ = reply.send(self.snapshot(file_id));
                }
                Command::Acknowledge { file_id, reply } => {
                    let _ = reply.send(self.acknowledge(file_id));
                }
            }
        }
        if !self.pending.is_empty() {
            warn!(
                files = self.pending.len(),
                "跟踪器退出时仍有未注册文件的缓存结果"
            );
        }
        info!("完成跟踪器已退出");
    }

    fn register(&mut self, registration: FileRegistration) -> Result<()> {
        let FileRegistration {
            file_id,
            total_chunks,
        } = registration;

        if total_chunks == 0 {
            return Err(Error::InvalidInput(format!(
                "文件 {file_id} 的分块总数不能为 0"
            )));
        }
        if self.files.contains_key(&file_id) || self.archived.contains(&file_id) {
            return Err(Error::InvalidInput(format!("文件 {file_id} 已注册")));
        }

        info!(%file_id, total_chunks, "注册文件");
        self.files.insert(
            file_id,
            TrackedFile {
                job: FileJob::new(file_id, total_chunks),
                progress: FileProgress::new(total_chunks),
                notified: false,
            },
        );

        if let Some(buffered) = self.pending.remove(&file_id) {
            self.pending_order.retain(|id| *id != file_id);
            info!(%file_id, count = buffered.len(), "应用注册前缓存的结果");
            for outcome in buffered {
                self.apply(outcome);
            }
        }
        Ok(())
    }

    fn apply(&mut self, outcome: ChunkOutcome) {
        let file_id = outcome.file_id;
        let Some(file) = self.files.get_mut(&file_id) else {
            if self.archived.contains(&file_id) {
                debug!(%file_id, chunk_index = outcome.chunk_index, "文件已归档，忽略结果");
            } else {
                debug!(%file_id, chunk_index = outcome.chunk_index, "文件尚未注册，缓存结果");
                self.buffer(outcome);
            }
            return;
        };

        if file.job.status.is_terminal() {
            debug!(%file_id, chunk_index = outcome.chunk_index, "文件已结束，忽略结果");
            return;
        }

        match file.progress.apply(&outcome) {
            Err(e) => warn!(%file_id, error = %e, "丢弃越界的结果"),
            Ok(Applied::Duplicate) => {
                debug!(%file_id, chunk_index = outcome.chunk_index, "重复结果已忽略");
            }
            Ok(Applied::StillOutstanding) => {
                debug!(
                    %file_id,
                    chunk_index = outcome.chunk_index,
                    detail = outcome.detail.as_deref().unwrap_or(""),
                    "分块可重试失败，等待重投"
                );
            }
            Ok(Applied::Recorded) => {
                file.job.status = file.progress.status();
                debug!(
                    %file_id,
                    chunk_index = outcome.chunk_index,
                    result = ?outcome.result,
                    outstanding = file.progress.outstanding(),
                    "分块已结束"
                );
            }
            Ok(Applied::Finished(status)) => {
                file.job.status = status.into();
                let failed = file.progress.failed_indices();
                Self::notify(&self.completion_tx, file, status, failed);
            }
        }
    }

    fn cancel(&mut self, file_id: FileId) -> bool {
        let Some(file) = self.files.get_mut(&file_id) else {
            return false;
        };
        if file.job.status.is_terminal() {
            return false;
        }

        warn!(%file_id, outstanding = file.progress.outstanding(), "取消文件");
        file.job.status = FileStatus::Failed;
        let unsucceeded = file.progress.unsucceeded_indices();
        Self::notify(&self.completion_tx, file, CompletionStatus::Failed, unsucceeded);
        true
    }

    fn buffer(&mut self, outcome: ChunkOutcome) {
        let file_id = outcome.file_id;
        if !self.pending.contains_key(&file_id) {
            if self.pending.len() >= PENDING_FILES_CAPACITY {
                if let Some(oldest) = self.pending_order.pop_front() {
                    let dropped = self.pending.remove(&oldest).map_or(0, |v| v.len());
                    warn!(file_id = %oldest, dropped, "缓存的未注册文件过多，丢弃最早的缓存");
                }
            }
            self.pending_order.push_back(file_id);
        }
        self.pending.entry(file_id).or_default().push(outcome);
    }

    fn notify(
        completion_tx: &mpsc::UnboundedSender<FileCompletion>,
        file: &mut TrackedFile,
        status: CompletionStatus,
        failed_chunk_indices: BTreeSet<u64>,
    ) {
        if file.notified {
            return;
        }
        file.notified = true;

        info!(
            file_id = %file.job.file_id,
            ?status,
            failed = failed_chunk_indices.len(),
            "文件处理结束"
        );
        let completion = FileCompletion {
            file_id: file.job.file_id,
            status,
            failed_chunk_indices,
        };
        if completion_tx.send(completion).is_err() {
            warn!(file_id = %file.job.file_id, "完成通知接收端已关闭");
        }
    }

    fn snapshot(&self, file_id: FileId) -> Option<FileSnapshot> {
        self.files.get(&file_id).map(|file| FileSnapshot {
            job: file.job.clone(),
            succeeded: file.progress.succeeded().clone(),
            failed: file.progress.failed().clone(),
            outstanding: file.progress.outstanding(),
        })
    }

    fn acknowledge(&mut self, file_id: FileId) -> bool {
        match self.files.get(&file_id) {
            Some(file) if file.job.status.is_terminal() => {
                self.files.remove(&file_id);
                if let Some(evicted) = self.archived.insert(file_id) {
                    debug!(file_id = %evicted, "归档记录已淘汰");
                }
                info!(%file_id, "文件已归档");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkq_common::ChunkResult;

    fn registration(file_id: FileId, total_chunks: u64) -> FileRegistration {
        FileRegistration {
            file_id,
            total_chunks,
        }
    }

    #[tokio::test]
    async fn three_successes_and_one_terminal_is_partially_failed() {
        let (tracker, mut completions, _task) = TrackerHandle::spawn();
        let file_id = FileId::new();
        tracker.register(registration(file_id, 4)).await.unwrap();

        tracker.report(ChunkOutcome::success(file_id, 0)).await.unwrap();
        tracker.report(ChunkOutcome::terminal(file_id, 2, "malformed")).await.unwrap();
        tracker.report(ChunkOutcome::success(file_id, 3)).await.unwrap();
        tracker.report(ChunkOutcome::success(file_id, 1)).await.unwrap();

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.file_id, file_id);
        assert_eq!(completion.status, CompletionStatus::PartiallyFailed);
        assert_eq!(completion.failed_chunk_indices, BTreeSet::from([2]));

        let snapshot = tracker.snapshot(file_id).await.unwrap().unwrap();
        assert_eq!(snapshot.job.status, FileStatus::PartiallyFailed);
        assert_eq!(snapshot.outstanding, 0);
    }

    #[tokio::test]
    async fn notification_fires_once_despite_duplicates() {
        let (tracker, mut completions, task) = TrackerHandle::spawn();
        let file_id = FileId::new();
        tracker.register(registration(file_id, 2)).await.unwrap();

        for _ in 0..3 {
            tracker.report(ChunkOutcome::success(file_id, 0)).await.unwrap();
            tracker.report(ChunkOutcome::success(file_id, 1)).await.unwrap();
        }
        drop(tracker);
        task.await.unwrap();

        assert_eq!(
            completions.recv().await.unwrap().status,
            CompletionStatus::Completed
        );
        assert!(completions.recv().await.is_none());
    }

    #[tokio::test]
    async fn outcomes_before_registration_are_buffered() {
        let (tracker, mut completions, _task) = TrackerHandle::spawn();
        let file_id = FileId::new();

        tracker.report(ChunkOutcome::success(file_id, 1)).await.unwrap();
        tracker.report(ChunkOutcome::success(file_id, 1)).await.unwrap();
        assert!(tracker.snapshot(file_id).await.unwrap().is_none());

        tracker.register(registration(file_id, 2)).await.unwrap();
        let snapshot = tracker.snapshot(file_id).await.unwrap().unwrap();
        assert_eq!(snapshot.job.status, FileStatus::InProgress);
        assert_eq!(snapshot.succeeded.marked_ids(), vec![1]);
        assert_eq!(snapshot.outstanding, 1);

        tracker.report(ChunkOutcome::success(file_id, 0)).await.unwrap();
        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.status, CompletionStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_fails_file_and_ignores_later_outcomes() {
        let (tracker, mut completions, task) = TrackerHandle::spawn();
        let file_id = FileId::new();
        tracker.register(registration(file_id, 3)).await.unwrap();
        tracker.report(ChunkOutcome::success(file_id, 0)).await.unwrap();

        assert!(tracker.cancel(file_id).await.unwrap());
        assert!(!tracker.cancel(file_id).await.unwrap());

        tracker.report(ChunkOutcome::success(file_id, 1)).await.unwrap();
        tracker.report(ChunkOutcome::success(file_id, 2)).await.unwrap();

        let snapshot = tracker.snapshot(file_id).await.unwrap().unwrap();
        assert_eq!(snapshot.job.status, FileStatus::Failed);
        assert_eq!(snapshot.outstanding, 2);

        drop(tracker);
        task.await.unwrap();
        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.status, CompletionStatus::Failed);
        assert_eq!(completion.failed_chunk_indices, BTreeSet::from([1, 2]));
        assert!(completions.recv().await.is_none());
    }

    #[tokio::test]
    async fn acknowledge_archives_only_terminal_files() {
        let (tracker, _completions, _task) = TrackerHandle::spawn();
        let file_id = FileId::new();
        tracker.register(registration(file_id, 1)).await.unwrap();

        assert!(!tracker.acknowledge(file_id).await.unwrap());

        tracker.report(ChunkOutcome::success(file_id, 0)).await.unwrap();
        assert!(tracker.acknowledge(file_id).await.unwrap());
        assert!(tracker.snapshot(file_id).await.unwrap().is_none());

        // 归档后的迟到结果不会被当成未注册文件缓存，重复注册也被拒绝
        tracker.report(ChunkOutcome::success(file_id, 0)).await.unwrap();
        assert!(matches!(
            tracker.register(registration(file_id, 1)).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn pending_buffer_drops_oldest_file_when_full() {
        let (completion_tx, _completions) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(completion_tx);
        let oldest = FileId::new();
        tracker.apply(ChunkOutcome::success(oldest, 0));
        for _ in 0..PENDING_FILES_CAPACITY {
            tracker.apply(ChunkOutcome::success(FileId::new(), 0));
        }

        assert_eq!(tracker.pending.len(), PENDING_FILES_CAPACITY);
        assert_eq!(tracker.pending_order.len(), PENDING_FILES_CAPACITY);
        assert!(!tracker.pending.contains_key(&oldest));

        // 缓存被丢弃的文件注册后从零开始
        tracker.register(registration(oldest, 1)).unwrap();
        assert_eq!(tracker.snapshot(oldest).unwrap().outstanding, 1);
    }

    #[test]
    fn archive_remembers_only_recent_files() {
        let (completion_tx, _completions) = mpsc::unbounded_channel();
        let mut tracker = Tracker::new(completion_tx);
        let archive = |tracker: &mut Tracker| {
            let file_id = FileId::new();
            tracker.register(registration(file_id, 1)).unwrap();
            tracker.apply(ChunkOutcome::success(file_id, 0));
            assert!(tracker.acknowledge(file_id));
            file_id
        };

        let first = archive(&mut tracker);
        for _ in 0..ARCHIVED_FILES_CAPACITY {
            archive(&mut tracker);
        }

        assert_eq!(tracker.archived.len(), ARCHIVED_FILES_CAPACITY);
        assert!(!tracker.archived.contains(&first));
        assert!(tracker.files.is_empty());
    }

    #[tokio::test]
    async fn rejects_zero_and_duplicate_registration() {
        let (tracker, _completions, _task) = TrackerHandle::spawn();
        let file_id = FileId::new();

        assert!(tracker.register(registration(file_id, 0)).await.is_err());
        tracker.register(registration(file_id, 2)).await.unwrap();
        assert!(tracker.register(registration(file_id, 2)).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_serializes_bitmaps() {
        let (tracker, _completions, _task) = TrackerHandle::spawn();
        let file_id = FileId::new();
        tracker.register(registration(file_id, 3)).await.unwrap();
        tracker
            .report(ChunkOutcome {
                file_id,
                chunk_index: 2,
                result: ChunkResult::TerminalFailure,
                detail: Some("bad".into()),
            })
            .await
            .unwrap();

        let snapshot = tracker.snapshot(file_id).await.unwrap().unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["job"]["status"], "in_progress");
        assert_eq!(json["failed"]["len"], 3);
        assert_eq!(json["outstanding"], 2);
    }
}
