use chunkq_common::{CompletionStatus, FileId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// 已注册，尚无分块结束
    Pending,
    InProgress,
    Completed,
    Failed,
    PartiallyFailed,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Failed | FileStatus::PartiallyFailed
        )
    }
}

impl From<CompletionStatus> for FileStatus {
    fn from(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Completed => FileStatus::Completed,
            CompletionStatus::Failed => FileStatus::Failed,
            CompletionStatus::PartiallyFailed => FileStatus::PartiallyFailed,
        }
    }
}

/// 一个待处理文件。状态只由完成跟踪器修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileJob {
    pub file_id: FileId,
    pub total_chunks: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub status: FileStatus,
}

impl FileJob {
    pub fn new(file_id: FileId, total_chunks: u64) -> Self {
        Self {
            file_id,
            total_chunks,
            created_at: OffsetDateTime::now_utc(),
            status: FileStatus::Pending,
        }
    }
}
