//! 哈希工具
//!
//! - URL 摘要：缓存文件名
//! - 内容摘要：合并后文件的完整性校验

use anyhow::{Context, Result};
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// 读取缓冲区大小
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// URL 对应的缓存文件名（不含扩展名）
pub fn url_hash(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// 期望的内容哈希
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "value", rename_all = "lowercase")]
pub enum ExpectedHash {
    /// 十六进制 SHA-256
    Sha256(String),
    /// 十六进制 MD5
    Md5(String),
}

impl ExpectedHash {
    pub fn value(&self) -> &str {
        match self {
            ExpectedHash::Sha256(v) | ExpectedHash::Md5(v) => v,
        }
    }

    /// 大小写不敏感比较
    pub fn matches(&self, actual: &str) -> bool {
        self.value().eq_ignore_ascii_case(actual)
    }
}

impl fmt::Display for ExpectedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedHash::Sha256(v) => write!(f, "sha256:{}", v),
            ExpectedHash::Md5(v) => write!(f, "md5:{}", v),
        }
    }
}

/// 按期望哈希的算法流式计算文件摘要（十六进制小写）
pub async fn compute_file_hash(path: &Path, expected: &ExpectedHash) -> Result<String> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("打开文件计算哈希失败: {:?}", path))?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    match expected {
        ExpectedHash::Sha256(_) => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buffer).await.context("读取文件失败")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        ExpectedHash::Md5(_) => {
            let mut hasher = Md5Context::new();
            loop {
                let n = file.read(&mut buffer).await.context("读取文件失败")?;
                if n == 0 {
                    break;
                }
                hasher.consume(&buffer[..n]);
            }
            Ok(format!("{:x}", hasher.compute()))
        }
    }
}
