use crate::channel::{DeadLetter, MessageChannel};
use crate::error::Error;
use crate::retry::DeadLetterPolicy;
use crate::tracker::TrackerHandle;
use chunkq_common::{ChunkOutcome, FileId};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 暂存的死信，供外部检查或重新提交
#[derive(Debug, Clone, Default)]
pub struct ParkedDeadLetters(Arc<Mutex<Vec<DeadLetter>>>);

impl ParkedDeadLetters {
    fn lock(&self) -> MutexGuard<'_, Vec<DeadLetter>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn park(&self, dead_letter: DeadLetter) {
        self.lock().push(dead_letter);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn all(&self) -> Vec<DeadLetter> {
        self.lock().clone()
    }

    /// 取出某个文件的全部死信
    pub fn take_file(&self, file_id: FileId) -> Vec<DeadLetter> {
        let mut parked = self.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = parked
            .drain(..)
            .partition(|dl| dl.task.file_id == file_id);
        *parked = kept;
        taken
    }
}

/// 消费死信队列。
///
/// `Redispatch` 策略下，轮次未用完的死信以新的轮次重新发布；
/// 其余死信向跟踪器上报终止失败并暂存。
pub struct DeadLetterMonitor {
    channel: Arc<dyn MessageChannel>,
    tracker: TrackerHandle,
    policy: DeadLetterPolicy,
    parked: ParkedDeadLetters,
}

impl DeadLetterMonitor {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        tracker: TrackerHandle,
        policy: DeadLetterPolicy,
    ) -> Self {
        Self {
            channel,
            tracker,
            policy,
            parked: ParkedDeadLetters::default(),
        }
    }

    pub fn parked(&self) -> ParkedDeadLetters {
        self.parked.clone()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(policy = ?self.policy, "死信监视器已启动");
        loop {
            let dead_letter = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.channel.receive_dead_letter() => match received {
                    Ok(dl) => dl,
                    Err(Error::ChannelClosed) => break,
                    Err(e) => {
                        error!(error = %e, "接收死信失败");
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            self.handle(dead_letter).await;
        }
        info!("死信监视器已退出");
    }

    async fn handle(&self, dead_letter: DeadLetter) {
        let task = &dead_letter.task;
        if self.policy.will_redispatch(task.dispatch_round) {
            let mut next = task.clone();
            next.dispatch_round += 1;
            info!(
                file_id = %task.file_id,
                chunk_index = task.chunk_index,
                round = next.dispatch_round,
                "重新派发死信分块"
            );
            match self.channel.publish(next).await {
                Ok(()) => return,
                Err(e) => warn!(error = %e, "重新派发失败，判定为终止失败"),
            }
        }

        let outcome = ChunkOutcome::terminal(
            task.file_id,
            task.chunk_index,
            dead_letter.reason.clone(),
        );
        if let Err(e) = self.tracker.report(outcome).await {
            error!(error = %e, "无法上报死信结果");
        }
        debug!(
            file_id = %task.file_id,
            chunk_index = task.chunk_index,
            reason = %dead_letter.reason,
            "死信已暂存"
        );
        self.parked.park(dead_letter);
    }
}
