use base64::{Engine as _, engine::general_purpose};
use bitvec::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 按分块序号记录标记状态的位图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    bits: BitVec<u64, Lsb0>,
}

impl ChunkBitmap {
    pub fn new(total_chunks: u64) -> Self {
        let bits: BitVec<u64, Lsb0> = BitVec::repeat(false, total_chunks as usize);
        Self { bits }
    }

    pub fn len(&self) -> u64 {
        self.bits.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// 标记分块，返回该分块之前是否未被标记
    pub fn mark(&mut self, chunk_index: u64) -> bool {
        let idx = chunk_index as usize;
        if self.bits[idx] {
            return false;
        }
        self.bits.set(idx, true);
        true
    }

    pub fn is_marked(&self, chunk_index: u64) -> bool {
        self.bits
            .get(chunk_index as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    pub fn all_marked(&self) -> bool {
        self.bits.all()
    }

    pub fn marked_count(&self) -> u64 {
        self.bits.count_ones() as u64
    }

    pub fn unmarked_count(&self) -> u64 {
        self.bits.count_zeros() as u64
    }

    pub fn marked_ids(&self) -> Vec<u64> {
        self.bits.iter_ones().map(|idx| idx as u64).collect()
    }

    pub fn unmarked_ids(&self) -> Vec<u64> {
        self.bits.iter_zeros().map(|idx| idx as u64).collect()
    }

    /// 两个位图是否没有共同标记的分块
    pub fn is_disjoint(&self, other: &ChunkBitmap) -> bool {
        self.bits
            .iter_ones()
            .all(|idx| !other.is_marked(idx as u64))
    }
}

// 序列化格式：{ "len": 分块数, "words": base64(u64 原始存储) }
// 只靠存储字无法还原长度，因此长度单独保存
#[derive(Serialize, Deserialize)]
struct RawBitmap {
    len: u64,
    words: String,
}

impl Serialize for ChunkBitmap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let words: &[u64] = self.bits.as_raw_slice();
        let raw: &[u8] = bytemuck::cast_slice(words);

        RawBitmap {
            len: self.len(),
            words: general_purpose::STANDARD.encode(raw),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChunkBitmap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw_bitmap = RawBitmap::deserialize(deserializer)?;

        let raw = general_purpose::STANDARD
            .decode(raw_bitmap.words)
            .map_err(serde::de::Error::custom)?;

        if raw.len() % 8 != 0 {
            return Err(serde::de::Error::custom("位图数据长度不是 8 的整数倍"));
        }

        // 解码后的 Vec<u8> 不保证按 u64 对齐，逐字拷贝
        let words: Vec<u64> = raw
            .chunks_exact(8)
            .map(|w| u64::from_ne_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]))
            .collect();

        let mut bits: BitVec<u64, Lsb0> = BitVec::from_vec(words);
        if (bits.len() as u64) < raw_bitmap.len {
            return Err(serde::de::Error::custom(format!(
                "位图长度不足：需要 {} 位，实际 {} 位",
                raw_bitmap.len,
                bits.len()
            )));
        }
        bits.truncate(raw_bitmap.len as usize);

        Ok(Self { bits })
    }
}
