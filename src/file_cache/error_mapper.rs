use crate::downloader::{DownloadState, FileCacheError};
use crate::file_cache::FileDownloadResult;
use tracing::debug;

/// 把下载管线的错误归一化为 `FileDownloadResult`
pub struct ErrorMapper;

impl ErrorMapper {
    pub fn map_error(url: &str, error: FileCacheError) -> FileDownloadResult {
        let error = Self::resolve_composite(error);
        debug!("下载失败归类: url={}, 错误: {}", url, error);

        match error {
            FileCacheError::Cancellation {
                state: DownloadState::Stopped,
                ..
            } => FileDownloadResult::Stopped,
            FileCacheError::Cancellation { .. } => FileDownloadResult::Canceled,
            e @ (FileCacheError::Io(_)
            | FileCacheError::Http(_)
            | FileCacheError::Unknown(_)
            | FileCacheError::Composite(_)) => FileDownloadResult::UnknownException(e),
            e => FileDownloadResult::KnownException(e),
        }
    }

    /// 组合错误：有取消就取取消，否则取第一个
    fn resolve_composite(error: FileCacheError) -> FileCacheError {
        let errors = match error {
            FileCacheError::Composite(errors) => errors,
            other => return other,
        };

        let mut flattened: Vec<FileCacheError> = errors
            .into_iter()
            .map(Self::resolve_composite)
            .collect();

        if let Some(pos) = flattened.iter().position(|e| e.is_cancellation()) {
            return flattened.swap_remove(pos);
        }

        if flattened.is_empty() {
            return FileCacheError::Unknown(anyhow::anyhow!("组合错误为空"));
        }

        flattened.swap_remove(0)
    }
}
