use crate::downloader::FileCacheError;
use std::path::Path;

/// 下载结果回调
///
/// 每次入队最终只会收到 `on_success` / `on_not_found` / `on_fail` /
/// `on_cancel` / `on_stop` 之一，随后恰好一次 `on_end`。
/// 回调在下载任务所在线程上同步执行，不要在里面阻塞
pub trait FileCacheListener: Send + Sync {
    /// 开始下载，`chunks_count` 为分片数
    fn on_start(&self, _chunks_count: usize) {}

    /// 分片进度
    fn on_progress(&self, _chunk_index: usize, _downloaded: u64, _total: u64) {}

    /// 下载完成；`immediate` 为 true 表示文件早已在缓存中
    fn on_success(&self, _file: &Path, _immediate: bool) {}

    /// 服务器返回 404
    fn on_not_found(&self) {}

    fn on_fail(&self, _error: &FileCacheError) {}

    fn on_cancel(&self) {}

    /// 下载被停止，`file` 是保留下来的部分文件
    fn on_stop(&self, _file: &Path) {}

    fn on_end(&self) {}
}
