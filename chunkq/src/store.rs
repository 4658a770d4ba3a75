//! 分块数据存储。消息里只携带 `PayloadRef`，分块字节由存储层保存。

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chunkq_common::{FileId, PayloadRef};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn put(&self, key: &PayloadRef, data: Bytes) -> Result<()>;

    async fn get(&self, key: &PayloadRef) -> Result<Bytes>;

    /// 删除某个文件的全部分块
    async fn delete_file(&self, file_id: FileId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<PayloadRef, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl PayloadStore for MemoryStore {
    async fn put(&self, key: &PayloadRef, data: Bytes) -> Result<()> {
        self.objects.write().await.insert(key.clone(), data);
        Ok(())
    }

    async fn get(&self, key: &PayloadRef) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Store(format!("对象 '{key}' 不存在")))
    }

    async fn delete_file(&self, file_id: FileId) -> Result<()> {
        let prefix = format!("{file_id}/");
        self.objects
            .write()
            .await
            .retain(|key, _| !key.as_str().starts_with(&prefix));
        Ok(())
    }
}

/// 以 `<root>/<file_id>/<chunk_index>` 布局保存在本地目录
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &PayloadRef) -> Result<PathBuf> {
        let relative = key.as_str();
        if relative.is_empty()
            || relative.starts_with('/')
            || relative.split('/').any(|part| part == ".." || part.is_empty())
        {
            return Err(Error::Store(format!("非法的对象引用 '{key}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl PayloadStore for FsStore {
    async fn put(&self, key: &PayloadRef, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        Ok(())
    }

    async fn get(&self, key: &PayloadRef) -> Result<Bytes> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Store(format!("读取对象 '{key}' 失败: {e}")))?;
        Ok(Bytes::from(data))
    }

    async fn delete_file(&self, file_id: FileId) -> Result<()> {
        let dir = self.root.join(file_id.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
