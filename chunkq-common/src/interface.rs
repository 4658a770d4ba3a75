use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// 所有在队列上流转的消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "message_type", content = "payload")]
pub enum Message {
    Task(ChunkTask),
    Outcome(ChunkOutcome),
    Registration(FileRegistration),
    Completion(FileCompletion),
}

impl From<ChunkTask> for Message {
    fn from(task: ChunkTask) -> Self {
        Message::Task(task)
    }
}

impl From<ChunkOutcome> for Message {
    fn from(outcome: ChunkOutcome) -> Self {
        Message::Outcome(outcome)
    }
}

impl From<FileRegistration> for Message {
    fn from(registration: FileRegistration) -> Self {
        Message::Registration(registration)
    }
}

impl From<FileCompletion> for Message {
    fn from(completion: FileCompletion) -> Self {
        Message::Completion(completion)
    }
}

impl Message {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// 文件唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FileId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 分块数据的不透明引用，由存储层解释
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadRef(String);

impl PayloadRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// 按 `<file_id>/<chunk_index>` 生成引用
    pub fn for_chunk(file_id: FileId, chunk_index: u64) -> Self {
        Self(format!("{file_id}/{chunk_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// 分块任务消息
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    pub file_id: FileId,
    pub chunk_index: u64,
    pub payload_ref: PayloadRef,
    /// 冗余的分块总数，供 worker 自检
    pub total_chunks: u64,
    /// 分块内容的 XXH3 校验值
    pub checksum: String,
    /// 死信重新派发的轮次，首次派发为 0
    #[serde(default)]
    pub dispatch_round: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkResult {
    Success,
    RetriableFailure,
    TerminalFailure,
}

// 分块处理结果消息
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub file_id: FileId,
    pub chunk_index: u64,
    pub result: ChunkResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ChunkOutcome {
    pub fn success(file_id: FileId, chunk_index: u64) -> Self {
        Self {
            file_id,
            chunk_index,
            result: ChunkResult::Success,
            detail: None,
        }
    }

    pub fn retriable(file_id: FileId, chunk_index: u64, detail: impl Into<String>) -> Self {
        Self {
            file_id,
            chunk_index,
            result: ChunkResult::RetriableFailure,
            detail: Some(detail.into()),
        }
    }

    pub fn terminal(file_id: FileId, chunk_index: u64, detail: impl Into<String>) -> Self {
        Self {
            file_id,
            chunk_index,
            result: ChunkResult::TerminalFailure,
            detail: Some(detail.into()),
        }
    }
}

// 文件注册
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRegistration {
    pub file_id: FileId,
    pub total_chunks: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
    PartiallyFailed,
}

// 文件完成通知
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileCompletion {
    pub file_id: FileId,
    pub status: CompletionStatus,
    pub failed_chunk_indices: BTreeSet<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_result_uses_snake_case_on_the_wire() {
        let file_id = FileId::new();
        let json = Message::from(ChunkOutcome::retriable(file_id, 3, "timeout"))
            .to_json()
            .unwrap();

        assert!(json.contains(r#""message_type":"Outcome""#));
        assert!(json.contains(r#""result":"retriable_failure""#));
        assert!(json.contains(&format!(r#""file_id":"{file_id}""#)));
    }

    #[test]
    fn completion_roundtrips_through_message() {
        let completion = FileCompletion {
            file_id: FileId::new(),
            status: CompletionStatus::PartiallyFailed,
            failed_chunk_indices: BTreeSet::from([2]),
        };
        let json = Message::from(completion.clone()).to_json().unwrap();
        assert!(json.contains(r#""status":"partially_failed""#));

        match Message::from_json(&json).unwrap() {
            Message::Completion(decoded) => assert_eq!(decoded, completion),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn task_without_round_defaults_to_zero() {
        let file_id = FileId::new();
        let json = format!(
            r#"{{"file_id":"{file_id}","chunk_index":1,"payload_ref":"{file_id}/1","total_chunks":4,"checksum":"00"}}"#
        );
        let task: ChunkTask = serde_json::from_str(&json).unwrap();
        assert_eq!(task.dispatch_round, 0);
        assert_eq!(task.payload_ref, PayloadRef::for_chunk(file_id, 1));
    }
}
