use crate::common::ExpectedHash;
use crate::downloader::cancelable::{CancelableDownload, DisposeFunc};
use crate::downloader::chunk::Chunk;
use crate::downloader::error::FileCacheError;
use crate::downloader::state::DownloadState;
use crate::file_cache::FileCacheListener;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 正在进行的下载请求
#[derive(Clone)]
pub struct ActiveDownloadRequest {
    pub url: String,
    /// 输出（缓存）文件
    pub output: PathBuf,
    /// 已下载字节数
    pub downloaded: Arc<AtomicU64>,
    /// 总字节数（未知时为 0）
    pub total: Arc<AtomicU64>,
    /// 请求的分片数
    pub chunks_count: usize,
    pub cancelable_download: Arc<CancelableDownload>,
    /// 期望的内容哈希
    pub expected_hash: Option<ExpectedHash>,
    /// 实际使用的分片
    pub chunks: BTreeSet<Chunk>,
}

impl ActiveDownloadRequest {
    pub fn new(
        url: &str,
        output: PathBuf,
        chunks_count: usize,
        cancelable_download: Arc<CancelableDownload>,
        expected_hash: Option<ExpectedHash>,
    ) -> Self {
        Self {
            url: url.to_string(),
            output,
            downloaded: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
            chunks_count: chunks_count.max(1),
            cancelable_download,
            expected_hash,
            chunks: BTreeSet::new(),
        }
    }
}

/// 正在进行的下载注册表
///
/// 所有操作都持有同一把锁
#[derive(Default)]
pub struct ActiveDownloads {
    requests: Mutex<HashMap<String, ActiveDownloadRequest>>,
}

impl ActiveDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求快照（计数器与原请求共享）
    pub fn get(&self, url: &str) -> Option<ActiveDownloadRequest> {
        self.requests.lock().get(url).cloned()
    }

    pub fn put(&self, url: &str, request: ActiveDownloadRequest) {
        self.requests.lock().insert(url.to_string(), request);
    }

    /// 原子地获取或创建请求
    ///
    /// 已存在时在锁内执行 `on_existing`（挂载回调），否则在锁内用 `create`
    /// 创建并插入。`create` 失败时注册表不变
    ///
    /// # 返回
    /// * `(取消句柄, 是否已存在)`
    pub fn get_or_create<E, C>(
        &self,
        url: &str,
        on_existing: E,
        create: C,
    ) -> anyhow::Result<(Arc<CancelableDownload>, bool)>
    where
        E: FnOnce(&ActiveDownloadRequest),
        C: FnOnce() -> anyhow::Result<ActiveDownloadRequest>,
    {
        let mut requests = self.requests.lock();

        if let Some(existing) = requests.get(url) {
            on_existing(existing);
            return Ok((Arc::clone(&existing.cancelable_download), true));
        }

        let request = create()?;
        let cancelable = Arc::clone(&request.cancelable_download);
        requests.insert(url.to_string(), request);
        Ok((cancelable, false))
    }

    pub fn remove(&self, url: &str) -> Option<ActiveDownloadRequest> {
        self.requests.lock().remove(url)
    }

    /// 原子地移除请求并取出它的全部回调（终态分发用）
    ///
    /// 只有注册表里的请求仍是 `cancelable` 对应的那一次时才移除，并在锁内执行
    /// `cleanup`；同一 URL 的新请求必须等清理结束才能创建输出文件
    pub fn remove_with_callbacks<F>(
        &self,
        url: &str,
        cancelable: &Arc<CancelableDownload>,
        cleanup: F,
    ) -> Option<(ActiveDownloadRequest, Vec<Arc<dyn FileCacheListener>>)>
    where
        F: FnOnce(&ActiveDownloadRequest),
    {
        let mut requests = self.requests.lock();
        match requests.get(url) {
            Some(r) if Arc::ptr_eq(&r.cancelable_download, cancelable) => {}
            _ => return None,
        }
        let request = requests.remove(url)?;
        cleanup(&request);
        let callbacks = request.cancelable_download.take_callbacks();
        Some((request, callbacks))
    }

    /// 清空注册表，返回被移除的请求
    pub fn clear(&self) -> Vec<ActiveDownloadRequest> {
        self.requests.lock().drain().map(|(_, r)| r).collect()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }

    /// 增加已下载字节数，返回新的总量
    pub fn update_downloaded(&self, url: &str, delta: u64) -> Option<u64> {
        let requests = self.requests.lock();
        let request = requests.get(url)?;
        Some(request.downloaded.fetch_add(delta, Ordering::SeqCst) + delta)
    }

    /// 回退已下载字节数（分片重试前）
    pub fn rollback_downloaded(&self, url: &str, delta: u64) {
        let requests = self.requests.lock();
        if let Some(request) = requests.get(url) {
            let _ = request
                .downloaded
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(delta))
                });
        }
    }

    pub fn update_total_length(&self, url: &str, total: u64) {
        let requests = self.requests.lock();
        if let Some(request) = requests.get(url) {
            request.total.store(total, Ordering::SeqCst);
        }
    }

    pub fn get_downloaded(&self, url: &str) -> Option<u64> {
        self.requests
            .lock()
            .get(url)
            .map(|r| r.downloaded.load(Ordering::SeqCst))
    }

    pub fn get_total(&self, url: &str) -> Option<u64> {
        self.requests
            .lock()
            .get(url)
            .map(|r| r.total.load(Ordering::SeqCst))
    }

    pub fn add_chunks(&self, url: &str, chunks: &[Chunk]) {
        let mut requests = self.requests.lock();
        if let Some(request) = requests.get_mut(url) {
            request.chunks.extend(chunks.iter().copied());
        }
    }

    pub fn get_chunks(&self, url: &str) -> BTreeSet<Chunk> {
        self.requests
            .lock()
            .get(url)
            .map(|r| r.chunks.clone())
            .unwrap_or_default()
    }

    pub fn get_state(&self, url: &str) -> Option<DownloadState> {
        self.requests
            .lock()
            .get(url)
            .map(|r| r.cancelable_download.get_state())
    }

    /// 请求存在且处于 Running
    pub fn is_running(&self, url: &str) -> bool {
        self.get_state(url)
            .map(|s| s.is_running())
            .unwrap_or(false)
    }

    pub fn is_batch_download(&self, url: &str) -> bool {
        self.requests
            .lock()
            .get(url)
            .map(|r| r.cancelable_download.is_part_of_batch_download())
            .unwrap_or(false)
    }

    /// 注册释放函数
    ///
    /// 请求已不存在时立即执行 `func` 并返回 Canceled
    pub fn add_dispose_func(&self, url: &str, func: DisposeFunc) -> DownloadState {
        let cancelable = self
            .requests
            .lock()
            .get(url)
            .map(|r| Arc::clone(&r.cancelable_download));

        match cancelable {
            Some(cancelable) => cancelable.add_dispose_func(func),
            None => {
                func();
                DownloadState::Canceled
            }
        }
    }

    /// 生成取消错误
    ///
    /// 仍在 Running 的请求会被强制取消；错误携带切换前的状态，
    /// 用于区分"被停止"和"被取消"
    pub fn cancellation_error(&self, url: &str) -> FileCacheError {
        let cancelable = self
            .requests
            .lock()
            .get(url)
            .map(|r| Arc::clone(&r.cancelable_download));

        // 读取和切换在句柄内部一次完成，并发的 stop() 不会被覆盖成 Canceled
        let prev_state = match cancelable {
            Some(cancelable) => cancelable.cancel_if_running(),
            None => DownloadState::Canceled,
        };

        FileCacheError::cancellation(prev_state, url)
    }

    /// 以当前状态生成取消错误，不改变状态
    pub fn aborted_error(&self, url: &str) -> FileCacheError {
        let state = self.get_state(url).unwrap_or(DownloadState::Canceled);
        FileCacheError::cancellation(state, url)
    }
}
