//! 调度系统的错误类型

use chunkq_common::FileId;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// 分块请求不合法（空输入、分块大小为 0 等），不重试
    #[error("无效输入: {0}")]
    InvalidInput(String),

    /// 发布重试耗尽，已发布的分块仍然有效
    #[error("文件 {file_id} 的分块发布失败 (分块 {failed_indices:?}, 每块尝试 {attempts} 次)")]
    Publish {
        file_id: FileId,
        failed_indices: Vec<u64>,
        attempts: u32,
    },

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("消息通道已关闭")]
    ChannelClosed,

    #[error("完成跟踪器已关闭")]
    TrackerClosed,

    #[error("分块数据存储失败: {0}")]
    Store(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// worker 对处理错误的分类，决定是重投还是终止
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessingError {
    /// 超时、资源争用等，可重投
    #[error("暂时性处理错误: {0}")]
    Transient(String),

    /// 分块损坏等，不再重投
    #[error("永久性处理错误: {0}")]
    Permanent(String),
}

impl ProcessingError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Transient(detail.into())
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::Permanent(detail.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
