//! 单个文件的分块完成状态。
//!
//! 每个分块序号任何时刻都恰好处于三种状态之一：成功、终止失败、未结束。
//! 已结束的分块不会再变化，重复结果直接丢弃。

use crate::job::FileStatus;
use chunkq_common::{ChunkBitmap, ChunkOutcome, ChunkResult, CompletionStatus};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// 该分块已结束，结果被丢弃
    Duplicate,
    /// 可重试失败，分块仍未结束
    StillOutstanding,
    Recorded,
    /// 最后一个分块结束，文件进入终态
    Finished(CompletionStatus),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("分块序号 {chunk_index} 超出范围 (总数 {total_chunks})")]
pub struct OutOfRange {
    pub chunk_index: u64,
    pub total_chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    total_chunks: u64,
    succeeded: ChunkBitmap,
    failed: ChunkBitmap,
    outstanding: u64,
}

impl FileProgress {
    pub fn new(total_chunks: u64) -> Self {
        Self {
            total_chunks,
            succeeded: ChunkBitmap::new(total_chunks),
            failed: ChunkBitmap::new(total_chunks),
            outstanding: total_chunks,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    pub fn succeeded(&self) -> &ChunkBitmap {
        &self.succeeded
    }

    pub fn failed(&self) -> &ChunkBitmap {
        &self.failed
    }

    pub fn is_resolved(&self, chunk_index: u64) -> bool {
        self.succeeded.is_marked(chunk_index) || self.failed.is_marked(chunk_index)
    }

    pub fn apply(&mut self, outcome: &ChunkOutcome) -> Result<Applied, OutOfRange> {
        let chunk_index = outcome.chunk_index;
        if chunk_index >= self.total_chunks {
            return Err(OutOfRange {
                chunk_index,
                total_chunks: self.total_chunks,
            });
        }
        if self.is_resolved(chunk_index) {
            return Ok(Applied::Duplicate);
        }

        match outcome.result {
            ChunkResult::Success => self.succeeded.mark(chunk_index),
            ChunkResult::TerminalFailure => self.failed.mark(chunk_index),
            ChunkResult::RetriableFailure => return Ok(Applied::StillOutstanding),
        };
        self.outstanding -= 1;
        debug_assert!(self.invariant_holds());

        if self.outstanding == 0 {
            Ok(Applied::Finished(self.terminal_status()))
        } else {
            Ok(Applied::Recorded)
        }
    }

    fn terminal_status(&self) -> CompletionStatus {
        if self.failed.marked_count() == 0 {
            CompletionStatus::Completed
        } else if self.succeeded.marked_count() == 0 {
            CompletionStatus::Failed
        } else {
            CompletionStatus::PartiallyFailed
        }
    }

    pub fn status(&self) -> FileStatus {
        if self.outstanding == 0 {
            self.terminal_status().into()
        } else if self.outstanding == self.total_chunks {
            FileStatus::Pending
        } else {
            FileStatus::InProgress
        }
    }

    pub fn failed_indices(&self) -> BTreeSet<u64> {
        self.failed.marked_ids().into_iter().collect()
    }

    /// 未成功的分块：终止失败的加上未结束的
    pub fn unsucceeded_indices(&self) -> BTreeSet<u64> {
        self.succeeded.unmarked_ids().into_iter().collect()
    }

    pub fn outstanding_indices(&self) -> BTreeSet<u64> {
        self.succeeded
            .unmarked_ids()
            .into_iter()
            .filter(|idx| !self.failed.is_marked(*idx))
            .collect()
    }

    /// 成功、失败、未结束三者两两不相交，且并集为 {0..N-1}
    pub fn invariant_holds(&self) -> bool {
        let succeeded = self.succeeded.marked_count();
        let failed = self.failed.marked_count();
        self.succeeded.is_disjoint(&self.failed)
            && succeeded + failed + self.outstanding == self.total_chunks
            && self.outstanding_indices().len() as u64 == self.outstanding
    }
}
