//! 把字节流切成定长、按序编号的分块。
//!
//! 两个入口：`split_bytes` 针对内存中的数据返回惰性迭代器，
//! `split_reader` / `split_file` 针对异步读取器返回惰性流。
//! 除最后一块外，每块长度都等于分块大小；序号从 0 开始连续编号。

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::ops::Range;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub offset: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 分块在源文件中的字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.data.len() as u64
    }
}

/// ceil(total_size / chunk_size)
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

fn validate(total_size: u64, chunk_size: u64) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::InvalidInput("分块大小必须大于 0".to_string()));
    }
    if total_size == 0 {
        return Err(Error::InvalidInput("输入数据为空".to_string()));
    }
    Ok(())
}

/// 内存数据的惰性分块迭代器，切片共享同一块 `Bytes`，不拷贝
#[derive(Debug, Clone)]
pub struct ChunkIter {
    data: Bytes,
    chunk_size: u64,
    next_index: u64,
    total_chunks: u64,
}

impl ChunkIter {
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn into_stream(self) -> ChunkStream {
        stream::iter(self.map(Ok)).boxed()
    }
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next_index >= self.total_chunks {
            return None;
        }
        let offset = self.next_index * self.chunk_size;
        let end = (offset + self.chunk_size).min(self.data.len() as u64);
        let chunk = Chunk {
            index: self.next_index,
            offset,
            data: self.data.slice(offset as usize..end as usize),
        };
        self.next_index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total_chunks - self.next_index) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter {}

pub fn split_bytes(data: Bytes, chunk_size: u64) -> Result<ChunkIter> {
    let total_size = data.len() as u64;
    validate(total_size, chunk_size)?;
    Ok(ChunkIter {
        total_chunks: chunk_count(total_size, chunk_size),
        data,
        chunk_size,
        next_index: 0,
    })
}

struct ReaderState<R> {
    reader: R,
    next_index: u64,
    offset: u64,
    total_size: u64,
    chunk_size: u64,
    done: bool,
}

/// 按 `total_size` 读取 reader，读取器提前结束时产出一个 `InvalidInput` 后停止
pub fn split_reader<R>(reader: R, total_size: u64, chunk_size: u64) -> Result<ChunkStream>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    validate(total_size, chunk_size)?;

    let state = ReaderState {
        reader,
        next_index: 0,
        offset: 0,
        total_size,
        chunk_size,
        done: false,
    };

    let chunks = stream::unfold(state, |mut state| async move {
        if state.done || state.offset >= state.total_size {
            return None;
        }

        let want = state.chunk_size.min(state.total_size - state.offset) as usize;
        let mut buf = BytesMut::zeroed(want);
        let mut filled: usize = 0;

        // read 不保证一次读满，循环读取直到填满或 EOF
        while filled < want {
            match state.reader.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    state.done = true;
                    return Some((Err(Error::Io(e)), state));
                }
            }
        }

        if filled < want {
            state.done = true;
            let err = Error::InvalidInput(format!(
                "数据提前结束：分块 {} 需要 {} 字节，只读到 {} 字节",
                state.next_index, want, filled
            ));
            return Some((Err(err), state));
        }

        let chunk = Chunk {
            index: state.next_index,
            offset: state.offset,
            data: buf.freeze(),
        };
        state.next_index += 1;
        state.offset += want as u64;
        Some((Ok(chunk), state))
    });

    Ok(chunks.boxed())
}

/// 一个已打开、待派发的文件
pub struct FileChunks {
    pub file_size: u64,
    pub total_chunks: u64,
    pub chunks: ChunkStream,
}

/// 打开文件并分块，分块在消费流时才读取
pub async fn split_file(path: &Path, chunk_size: u64) -> Result<FileChunks> {
    let file = tokio::fs::File::open(path).await?;
    let file_size = file.metadata().await?.len();
    let chunks = split_reader(BufReader::new(file), file_size, chunk_size)?;
    Ok(FileChunks {
        file_size,
        total_chunks: chunk_count(file_size, chunk_size),
        chunks,
    })
}
