pub mod chunk_bitmap;
pub mod interface;
pub mod utils;

pub use chunk_bitmap::ChunkBitmap;
pub use interface::*;
pub use utils::{checksum, format_size};

/// 默认分块大小 10MB
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// 默认队列名称
pub const DEFAULT_QUEUE_NAME: &str = "file-chunks";
