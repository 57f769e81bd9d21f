//! 缓存元数据文件
//!
//! 格式：4 字节大端长度 + UTF-8 文本 `"<创建时间毫秒>,<true|false>"`

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// 缓存元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFileMeta {
    /// 创建时间（毫秒时间戳）
    pub created_on: i64,
    /// 是否已下载完成
    pub is_downloaded: bool,
}

impl CacheFileMeta {
    pub fn new(created_on: i64, is_downloaded: bool) -> Self {
        Self {
            created_on,
            is_downloaded,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let text = format!("{},{}", self.created_on, self.is_downloaded);
        let bytes = text.as_bytes();

        let mut buf = Vec::with_capacity(4 + bytes.len());
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(bytes);
        buf
    }

    fn decode(text: &str) -> Result<Self> {
        let mut parts = text.split(',');
        let (created_on, is_downloaded) = match (parts.next(), parts.next(), parts.next()) {
            (Some(c), Some(d), None) => (c, d),
            _ => anyhow::bail!("元数据格式错误: {:?}", text),
        };

        let created_on = created_on
            .parse::<i64>()
            .with_context(|| format!("元数据创建时间无效: {:?}", created_on))?;
        let is_downloaded = is_downloaded
            .parse::<bool>()
            .with_context(|| format!("元数据下载标记无效: {:?}", is_downloaded))?;

        Ok(Self::new(created_on, is_downloaded))
    }
}

/// 写入（覆盖）元数据文件
pub fn write_meta(path: &Path, meta: &CacheFileMeta) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("打开元数据文件失败: {:?}", path))?;

    file.write_all(&meta.encode())
        .with_context(|| format!("写入元数据失败: {:?}", path))?;
    file.flush().context("刷新元数据文件失败")?;

    Ok(())
}

/// 读取元数据文件
///
/// 文件缺失、长度不足、格式错误都返回错误，由调用方按损坏处理
pub fn read_meta(path: &Path) -> Result<CacheFileMeta> {
    let mut file =
        File::open(path).with_context(|| format!("打开元数据文件失败: {:?}", path))?;

    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)
        .context("读取元数据长度失败")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut content = vec![0u8; len];
    file.read_exact(&mut content)
        .context("读取元数据内容失败")?;

    let text = String::from_utf8(content).context("元数据不是合法的 UTF-8")?;
    CacheFileMeta::decode(&text)
}
