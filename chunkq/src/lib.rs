//! 基于持久消息队列的分块文件处理。
//!
//! 文件被拆成定长分块，每个分块作为独立任务发布到 `MessageChannel`，
//! 由 worker 池并发处理。完成跟踪器汇总每个分块的最终结果，
//! 文件的所有分块都结束后恰好发出一次完成通知。

pub mod channel;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod logging;
pub mod processor;
pub mod progress;
pub mod recent;
pub mod retry;
pub mod scheduler;
pub mod splitter;
pub mod store;
pub mod tracker;
pub mod worker;

pub use channel::{DeadLetter, Delivery, MemoryChannel, MessageChannel};
pub use config::Config;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::{Error, ProcessingError, Result};
pub use job::{FileJob, FileStatus};
pub use processor::{ChunkProcessor, DigestProcessor};
pub use retry::{DeadLetterPolicy, RetryPolicy};
pub use scheduler::{Scheduler, Submission};
pub use store::{FsStore, MemoryStore, PayloadStore};
pub use tracker::{FileSnapshot, TrackerHandle};

pub use chunkq_common::{
    ChunkOutcome, ChunkResult, ChunkTask, CompletionStatus, FileCompletion, FileId,
    FileRegistration, Message, PayloadRef,
};
