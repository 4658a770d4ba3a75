//! 消息通道：持久、至少一次的点对点投递。
//!
//! 核心逻辑只依赖 `MessageChannel` 这组能力（发布、接收、确认、否认、死信），
//! 不关心背后是哪种 broker。`MemoryChannel` 是进程内实现：
//!
//! - 投递出去的消息在可见性超时内未确认，会被收回并重新投递；
//! - 每次重新投递都累加 `redelivery_count`；
//! - 重投次数超过上限的消息进入死信队列，不再投递。

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::recent::RecentSet;
use async_trait::async_trait;
use chunkq_common::{ChunkTask, FileId, Message};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type DeliveryTag = u64;

/// 一次投递，worker 处理完后用 tag 确认或否认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub task: ChunkTask,
    /// 该消息已被重新投递的次数，首次投递为 0
    pub redelivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub task: ChunkTask,
    pub redelivery_count: u32,
    pub reason: String,
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn publish(&self, task: ChunkTask) -> Result<()>;

    /// 等待下一条消息；通道关闭后返回 `Error::ChannelClosed`
    async fn receive(&self) -> Result<Delivery>;

    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// 否认并重新入队
    async fn nack(&self, tag: DeliveryTag) -> Result<()>;

    async fn dead_letter(&self, tag: DeliveryTag, reason: String) -> Result<()>;

    /// 等待下一条死信；通道关闭后返回 `Error::ChannelClosed`
    async fn receive_dead_letter(&self) -> Result<DeadLetter>;

    /// 尽力停止某个文件的投递，返回移除的消息数
    async fn purge_file(&self, file_id: FileId) -> Result<usize>;

    fn close(&self);
}

struct Envelope {
    file_id: FileId,
    body: String,
    redelivery_count: u32,
}

struct InFlight {
    envelope: Envelope,
    deadline: Instant,
}

/// 记住的已清除文件数量，更早的清除记录会被淘汰
pub const PURGED_FILES_CAPACITY: usize = 4096;

struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<DeliveryTag, InFlight>,
    dead_letters: VecDeque<DeadLetter>,
    // 只保留最近清除的文件，淘汰之后该文件的迟到消息会重新被接受
    purged: RecentSet<FileId>,
    next_tag: DeliveryTag,
    closed: bool,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            dead_letters: VecDeque::new(),
            purged: RecentSet::new(PURGED_FILES_CAPACITY),
            next_tag: 0,
            closed: false,
        }
    }
}

pub struct MemoryChannel {
    queue: QueueConfig,
    state: Mutex<QueueState>,
    ready_notify: Notify,
    dead_notify: Notify,
}

impl MemoryChannel {
    /// 按队列声明创建通道
    pub fn declare(queue: &QueueConfig) -> Self {
        info!(
            queue = %queue.name,
            durable = queue.durable,
            redelivery_limit = queue.redelivery_limit,
            visibility_timeout_secs = queue.visibility_timeout_secs,
            "声明队列"
        );
        Self {
            queue: queue.clone(),
            state: Mutex::new(QueueState::default()),
            ready_notify: Notify::new(),
            dead_notify: Notify::new(),
        }
    }

    pub fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn dead_letter_len(&self) -> usize {
        self.lock().dead_letters.len()
    }

    /// 当前排队中的任务（不含已投递未确认的）
    pub fn ready_tasks(&self) -> Vec<ChunkTask> {
        self.lock()
            .ready
            .iter()
            .filter_map(|env| decode(&env.body).ok())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // 临界区内不会 panic，中毒时直接沿用内部状态
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 重新入队，超过重投上限则转入死信。返回是否产生了死信
    fn requeue(&self, state: &mut QueueState, mut envelope: Envelope, reason: &str) -> bool {
        if state.purged.contains(&envelope.file_id) {
            debug!(file_id = %envelope.file_id, "文件已清除，丢弃重投消息");
            return false;
        }
        envelope.redelivery_count += 1;
        if envelope.redelivery_count > self.queue.redelivery_limit {
            match decode(&envelope.body) {
                Ok(task) => {
                    warn!(
                        file_id = %task.file_id,
                        chunk_index = task.chunk_index,
                        redelivery_count = envelope.redelivery_count,
                        "超过重投上限，转入死信"
                    );
                    state.dead_letters.push_back(DeadLetter {
                        task,
                        redelivery_count: envelope.redelivery_count,
                        reason: format!("{reason}，且超过重投上限 {}", self.queue.redelivery_limit),
                    });
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, "无法解析的消息，丢弃");
                    return false;
                }
            }
        }
        state.ready.push_back(envelope);
        false
    }

    /// 收回可见性超时的投递
    fn reclaim_expired(&self, state: &mut QueueState, now: Instant) -> bool {
        let expired: Vec<DeliveryTag> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();

        let mut dead_lettered = false;
        for tag in expired {
            if let Some(in_flight) = state.in_flight.remove(&tag) {
                debug!(tag, file_id = %in_flight.envelope.file_id, "投递超时未确认，重新入队");
                dead_lettered |= self.requeue(state, in_flight.envelope, "可见性超时未确认");
            }
        }
        dead_lettered
    }
}

fn decode(body: &str) -> Result<ChunkTask> {
    match Message::from_json(body)? {
        Message::Task(task) => Ok(task),
        other => Err(Error::InvalidInput(format!("队列中出现非任务消息: {other:?}"))),
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn publish(&self, task: ChunkTask) -> Result<()> {
        let file_id = task.file_id;
        let body = Message::from(task).to_json()?;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::ChannelClosed);
            }
            if state.purged.contains(&file_id) {
                debug!(%file_id, "文件已清除，忽略发布");
                return Ok(());
            }
            state.ready.push_back(Envelope {
                file_id,
                body,
                redelivery_count: 0,
            });
        }
        self.ready_notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery> {
        loop {
            // 先登记等待，再检查队列，避免错过唤醒
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (next_deadline, dead_lettered) = {
                let mut state = self.lock();
                if state.closed {
                    return Err(Error::ChannelClosed);
                }
                let now = Instant::now();
                let dead_lettered = self.reclaim_expired(&mut state, now);

                let mut delivered = None;
                while let Some(envelope) = state.ready.pop_front() {
                    match decode(&envelope.body) {
                        Ok(task) => {
                            let tag = state.next_tag;
                            state.next_tag += 1;
                            let redelivery_count = envelope.redelivery_count;
                            state.in_flight.insert(
                                tag,
                                InFlight {
                                    envelope,
                                    deadline: now + self.queue.visibility_timeout(),
                                },
                            );
                            delivered = Some(Delivery {
                                tag,
                                task,
                                redelivery_count,
                            });
                            break;
                        }
                        Err(e) => warn!(error = %e, "无法解析的消息，丢弃"),
                    }
                }

                if let Some(delivery) = delivered {
                    drop(state);
                    if dead_lettered {
                        self.dead_notify.notify_waiters();
                    }
                    return Ok(delivery);
                }

                let next_deadline = state.in_flight.values().map(|f| f.deadline).min();
                (next_deadline, dead_lettered)
            };

            if dead_lettered {
                self.dead_notify.notify_waiters();
            }

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        if self.lock().in_flight.remove(&tag).is_none() {
            // 超时后已被收回，新的投递会再次处理
            debug!(tag, "确认了已失效的投递");
        }
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<()> {
        let dead_lettered = {
            let mut state = self.lock();
            match state.in_flight.remove(&tag) {
                Some(in_flight) => self.requeue(&mut state, in_flight.envelope, "处理失败"),
                None => {
                    debug!(tag, "否认了已失效的投递");
                    return Ok(());
                }
            }
        };
        self.ready_notify.notify_waiters();
        if dead_lettered {
            self.dead_notify.notify_waiters();
        }
        Ok(())
    }

    async fn dead_letter(&self, tag: DeliveryTag, reason: String) -> Result<()> {
        {
            let mut state = self.lock();
            let Some(in_flight) = state.in_flight.remove(&tag) else {
                debug!(tag, "死信了已失效的投递");
                return Ok(());
            };
            if state.purged.contains(&in_flight.envelope.file_id) {
                return Ok(());
            }
            let task = decode(&in_flight.envelope.body)?;
            state.dead_letters.push_back(DeadLetter {
                task,
                redelivery_count: in_flight.envelope.redelivery_count,
                reason,
            });
        }
        self.dead_notify.notify_waiters();
        Ok(())
    }

    async fn receive_dead_letter(&self) -> Result<DeadLetter> {
        loop {
            let notified = self.dead_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(dead_letter) = state.dead_letters.pop_front() {
                    return Ok(dead_letter);
                }
                if state.closed {
                    return Err(Error::ChannelClosed);
                }
            }

            notified.await;
        }
    }

    async fn purge_file(&self, file_id: FileId) -> Result<usize> {
        let mut state = self.lock();
        if let Some(evicted) = state.purged.insert(file_id) {
            debug!(file_id = %evicted, "清除记录已淘汰");
        }

        let before = state.ready.len() + state.dead_letters.len();
        state.ready.retain(|env| env.file_id != file_id);
        state.dead_letters.retain(|dl| dl.task.file_id != file_id);
        let removed = before - state.ready.len() - state.dead_letters.len();

        info!(%file_id, removed, "已清除文件的待投递消息");
        Ok(removed)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready_notify.notify_waiters();
        self.dead_notify.notify_waiters();
    }
}
