use crate::downloader::FileCacheError;
use std::path::PathBuf;
use std::time::Duration;

/// 下载事件/结果
#[derive(Debug)]
pub enum FileDownloadResult {
    /// 开始下载
    Start { chunks_count: usize },
    /// 分片进度
    Progress {
        chunk_index: usize,
        downloaded: u64,
        chunk_size: u64,
    },
    /// 下载完成
    Success { file: PathBuf, request_time: Duration },
    Canceled,
    Stopped,
    /// 可识别的缓存错误（404、哈希不匹配、HTTP 状态码等）
    KnownException(FileCacheError),
    /// 其他错误
    UnknownException(FileCacheError),
}

impl FileDownloadResult {
    /// 是否为任意一种失败终态
    pub fn is_error_of_any_kind(&self) -> bool {
        matches!(
            self,
            FileDownloadResult::Canceled
                | FileDownloadResult::Stopped
                | FileDownloadResult::KnownException(_)
                | FileDownloadResult::UnknownException(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            FileDownloadResult::Start { .. } | FileDownloadResult::Progress { .. }
        )
    }
}
