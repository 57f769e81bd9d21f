use anyhow::Result;
use std::fmt;

/// 分片信息
///
/// 半开区间 `[start, end)`。`end == u64::MAX` 的分片表示"整个文件"
/// （长度未知或不分片），此时请求不携带 Range 头。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk {
    /// 起始偏移（包含）
    pub start: u64,
    /// 结束偏移（不包含）
    pub end: u64,
}

impl Chunk {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// 整文件分片
    pub fn whole_file() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    pub fn is_whole_file(&self) -> bool {
        self.start == 0 && self.end == u64::MAX
    }

    /// 分片大小，整文件分片返回 None
    pub fn size(&self) -> Option<u64> {
        if self.is_whole_file() {
            None
        } else {
            Some(self.end - self.start)
        }
    }

    /// Range 请求头的值（闭区间）
    pub fn range_header(&self) -> Option<String> {
        if self.is_whole_file() || self.end <= self.start {
            return None;
        }

        Some(format!("bytes={}-{}", self.start, self.end - 1))
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_whole_file() {
            write!(f, "[整个文件]")
        } else {
            write!(f, "[{}..{})", self.start, self.end)
        }
    }
}

/// 把长度 `length` 切分为 `chunk_count` 个连续分片
///
/// - `length < min_chunk_size` 时不切分，返回唯一分片 `[0, length)`
/// - 整除后的余数并入最后一个分片
///
/// # 错误
/// `chunk_count == 0` 或 `length < chunk_count`
pub fn split(length: u64, chunk_count: u32, min_chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_count == 0 {
        anyhow::bail!("分片数量必须大于 0");
    }

    if length < min_chunk_size {
        return Ok(vec![Chunk::new(0, length)]);
    }

    let count = chunk_count as u64;
    if length < count {
        anyhow::bail!("文件长度 {} 小于分片数量 {}", length, count);
    }

    let chunk_size = length / count;
    let mut chunks = Vec::with_capacity(chunk_count as usize);

    for index in 0..count {
        let start = index * chunk_size;
        let end = if index == count - 1 {
            length
        } else {
            start + chunk_size
        };

        chunks.push(Chunk::new(start, end));
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_even() {
        let chunks = split(10, 5, 1).unwrap();
        assert_eq!(
            chunks,
            vec![
                Chunk::new(0, 2),
                Chunk::new(2, 4),
                Chunk::new(4, 6),
                Chunk::new(6, 8),
                Chunk::new(8, 10),
            ]
        );
    }

    #[test]
    fn test_split_below_min_chunk_size() {
        let chunks = split(10, 5, 20).unwrap();
        assert_eq!(chunks, vec![Chunk::new(0, 10)]);
    }

    #[test]
    fn test_split_remainder_goes_to_last_chunk() {
        let chunks = split(105, 4, 1).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], Chunk::new(0, 26));
        assert_eq!(chunks[3], Chunk::new(78, 105));
    }

    #[test]
    fn test_split_invalid_arguments() {
        assert!(split(100, 0, 1).is_err());
        assert!(split(3, 5, 1).is_err());
    }

    #[test]
    fn test_whole_file_chunk() {
        let chunk = Chunk::whole_file();
        assert!(chunk.is_whole_file());
        assert_eq!(chunk.size(), None);
        assert_eq!(chunk.range_header(), None);

        let chunk = Chunk::new(100, 200);
        assert!(!chunk.is_whole_file());
        assert_eq!(chunk.size(), Some(100));
        assert_eq!(chunk.range_header().as_deref(), Some("bytes=100-199"));
    }

    proptest! {
        #[test]
        fn prop_split_covers_whole_range(
            length in 1u64..10_000_000,
            count in 1u32..16,
            min_chunk_size in 0u64..4096,
        ) {
            prop_assume!(length >= count as u64);

            let chunks = split(length, count, min_chunk_size).unwrap();

            prop_assert_eq!(chunks.first().unwrap().start, 0);
            prop_assert_eq!(chunks.last().unwrap().end, length);
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            for chunk in &chunks {
                prop_assert!(chunk.start < chunk.end);
            }

            if length < min_chunk_size {
                prop_assert_eq!(chunks.len(), 1);
            } else {
                prop_assert_eq!(chunks.len(), count as usize);
            }
        }
    }
}
