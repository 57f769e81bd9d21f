use crate::downloader::state::DownloadState;
use std::path::PathBuf;
use thiserror::Error;

/// 下载/缓存错误
#[derive(Debug, Error)]
pub enum FileCacheError {
    /// 下载被取消或停止，携带切换前的状态
    #[error("下载已取消: state={state:?}, url={url}")]
    Cancellation { state: DownloadState, url: String },

    #[error("服务器上不存在该文件")]
    FileNotFoundOnServer,

    #[error("输出文件不存在: {0:?}")]
    OutputFileDoesNotExist(PathBuf),

    #[error("分片文件不存在: {0:?}")]
    ChunkFileDoesNotExist(PathBuf),

    #[error("无法打开输入流: path={path:?}, exists={exists}, is_file={is_file}")]
    CouldNotGetInputStream {
        path: PathBuf,
        exists: bool,
        is_file: bool,
    },

    #[error("无法打开输出流: path={path:?}, exists={exists}, is_file={is_file}")]
    CouldNotGetOutputStream {
        path: PathBuf,
        exists: bool,
        is_file: bool,
    },

    #[error("无法标记文件为已下载: {0:?}")]
    CouldNotMarkFileAsDownloaded(PathBuf),

    #[error("文件哈希不匹配: 期望={expected}, 实际={actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("HTTP错误: {0}")]
    HttpCode(u16),

    #[error("分片参数错误: {0}")]
    BadChunk(String),

    /// 并发分片的多个失败
    #[error("{} 个分片下载失败", .0.len())]
    Composite(Vec<FileCacheError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl FileCacheError {
    pub fn cancellation(state: DownloadState, url: &str) -> Self {
        FileCacheError::Cancellation {
            state,
            url: url.to_string(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, FileCacheError::Cancellation { .. })
    }

    /// 是否属于可在分片内部重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        match self {
            FileCacheError::Io(_) => true,
            FileCacheError::Http(e) => !e.is_builder() && !e.is_status(),
            _ => false,
        }
    }

    /// 打开输入文件失败时附带文件状态
    pub fn input_stream(path: PathBuf) -> Self {
        let (exists, is_file) = (path.exists(), path.is_file());
        FileCacheError::CouldNotGetInputStream {
            path,
            exists,
            is_file,
        }
    }

    /// 打开输出文件失败时附带文件状态
    pub fn output_stream(path: PathBuf) -> Self {
        let (exists, is_file) = (path.exists(), path.is_file());
        FileCacheError::CouldNotGetOutputStream {
            path,
            exists,
            is_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let io = FileCacheError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_retryable());

        assert!(!FileCacheError::cancellation(DownloadState::Canceled, "u").is_retryable());
        assert!(!FileCacheError::FileNotFoundOnServer.is_retryable());
        assert!(!FileCacheError::HttpCode(500).is_retryable());
        assert!(!FileCacheError::Unknown(anyhow::anyhow!("x")).is_retryable());
    }

    #[test]
    fn test_composite_message() {
        let err = FileCacheError::Composite(vec![
            FileCacheError::HttpCode(500),
            FileCacheError::FileNotFoundOnServer,
        ]);
        assert_eq!(err.to_string(), "2 个分片下载失败");
    }
}
