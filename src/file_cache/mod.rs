//! 文件缓存门面
//!
//! 对外入口：按 URL 入队下载，同一 URL 同时最多一条下载管线。
//! 普通请求和预加载批量请求走两条独立队列，各自有并发上限

pub mod error_mapper;
pub mod listener;
pub mod result;

pub use error_mapper::ErrorMapper;
pub use listener::FileCacheListener;
pub use result::FileDownloadResult;

use crate::cache::CacheHandler;
use crate::common::{BackgroundExecutor, ExpectedHash};
use crate::config::AppConfig;
use crate::downloader::{
    ActiveDownloadRequest, ActiveDownloads, CancelableDownload, ChunkDownloader, ChunkMerger,
    ChunkPersister, ConcurrentChunkedFileDownloader, FileCacheError, PartialContentSupportChecker,
};
use anyhow::{Context, Result};
use reqwest::Client;
use std::any::TypeId;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// 单次下载的选项
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// 分片数提示，None 时使用配置里的默认值
    pub chunk_count: Option<usize>,
    /// 下载完成后校验的内容哈希
    pub expected_hash: Option<ExpectedHash>,
}

/// 文件缓存
///
/// 克隆开销很小，所有克隆共享同一份状态
#[derive(Clone)]
pub struct FileCacheV2 {
    inner: Arc<Inner>,
}

struct Inner {
    cache_handler: Arc<CacheHandler>,
    active_downloads: Arc<ActiveDownloads>,
    checker: PartialContentSupportChecker,
    downloader: ConcurrentChunkedFileDownloader,
    dispose_executor: Arc<BackgroundExecutor>,
    dispose_timeout: Duration,
    default_chunk_count: usize,
    queue_tx: mpsc::UnboundedSender<String>,
    batch_tx: mpsc::UnboundedSender<Vec<String>>,
}

impl FileCacheV2 {
    /// 创建文件缓存并启动调度任务
    ///
    /// 必须在 tokio 运行时内调用
    pub fn new(config: &AppConfig, client: Client) -> Result<Self> {
        let runtime = Handle::try_current().context("文件缓存必须在 tokio 运行时内创建")?;

        let cache_handler = CacheHandler::new(config.cache.clone())?;
        let active_downloads = Arc::new(ActiveDownloads::new());
        let dispose_executor = Arc::new(BackgroundExecutor::new("file-cache-dispose")?);

        let download = &config.download;
        let checker = PartialContentSupportChecker::new(
            client.clone(),
            Arc::clone(&active_downloads),
            download.head_request_timeout(),
            download.min_chunk_size,
            download.partial_content_cache_capacity,
        );
        let downloader = ConcurrentChunkedFileDownloader::new(
            Arc::clone(&active_downloads),
            ChunkDownloader::new(
                client,
                Arc::clone(&active_downloads),
                download.user_agent.clone(),
                download.request_timeout(),
            ),
            ChunkPersister::new(Arc::clone(&cache_handler), Arc::clone(&active_downloads)),
            ChunkMerger::new(Arc::clone(&cache_handler), Arc::clone(&active_downloads)),
            download.max_chunks,
            download.min_chunk_size,
            download.max_retries,
            download.retry_delay(),
        );

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            cache_handler,
            active_downloads,
            checker,
            downloader,
            dispose_executor,
            dispose_timeout: download.dispose_timeout(),
            default_chunk_count: download.chunk_count.max(1),
            queue_tx,
            batch_tx,
        });

        let worker_count = download.effective_worker_count();
        runtime.spawn(run_queue(
            Arc::downgrade(&inner),
            queue_rx,
            Arc::new(Semaphore::new(worker_count)),
        ));
        runtime.spawn(run_batch_queue(
            Arc::downgrade(&inner),
            batch_rx,
            Arc::new(Semaphore::new(worker_count)),
        ));

        info!(
            "文件缓存初始化完成: 缓存目录={:?}, 工作线程数={}",
            inner.cache_handler.cache_dir(),
            worker_count
        );

        Ok(Self { inner })
    }

    /// 入队下载请求
    ///
    /// - 同一 URL 已在下载：只挂载回调，不会再起一条管线
    /// - 文件已在缓存中：立即回调 `on_success(file, true)` 和 `on_end`
    ///
    /// # 返回
    /// 取消句柄；`cancel()` 删除输出文件，`stop()` 保留
    pub fn enqueue_download_file_request<L>(
        &self,
        url: &str,
        options: DownloadOptions,
        listener: L,
    ) -> Arc<CancelableDownload>
    where
        L: FileCacheListener + 'static,
    {
        let inner = &self.inner;
        let key = TypeId::of::<L>();
        let listener: Arc<dyn FileCacheListener> = Arc::new(listener);

        if inner.active_downloads.get(url).is_none() {
            if let Some(file) = inner.cache_handler.get_cache_file_or_none(url) {
                debug!("命中缓存: url={}, file={:?}", url, file);
                listener.on_success(&file, true);
                listener.on_end();
                return inner.detached_handle(url);
            }
        }

        let chunks_count = options.chunk_count.unwrap_or(inner.default_chunk_count);
        // 输出文件在注册表锁内创建，不会和上一次请求的终态清理交错
        let created = inner.active_downloads.get_or_create(
            url,
            |existing| {
                existing
                    .cancelable_download
                    .add_callback_arc(key, Arc::clone(&listener));
            },
            || {
                let output = inner.cache_handler.get_or_create_cache_file(url)?;
                let cancelable = Arc::new(CancelableDownload::new(
                    url,
                    false,
                    Arc::clone(&inner.dispose_executor),
                    inner.dispose_timeout,
                ));
                cancelable.add_callback_arc(key, Arc::clone(&listener));
                Ok(ActiveDownloadRequest::new(
                    url,
                    output,
                    chunks_count,
                    Arc::clone(&cancelable),
                    options.expected_hash.clone(),
                ))
            },
        );

        let (cancelable, existed) = match created {
            Ok(created) => created,
            Err(e) => {
                error!("创建缓存文件失败: url={}, 错误: {:#}", url, e);
                listener.on_fail(&FileCacheError::Unknown(e));
                listener.on_end();
                return inner.detached_handle(url);
            }
        };

        if existed {
            debug!("URL 已在下载中，挂载回调: url={}", url);
        } else if inner.queue_tx.send(url.to_string()).is_err() {
            warn!("下载队列已关闭: url={}", url);
        }

        cancelable
    }

    /// 入队一批预加载请求
    ///
    /// 批量请求没有回调，只能用 `cancel_prefetch()`/`stop_prefetch()` 取消。
    /// 已在下载或已在缓存中的 URL 会被跳过
    pub fn enqueue_media_prefetch_request_batch(
        &self,
        urls: &[String],
    ) -> Vec<Arc<CancelableDownload>> {
        let inner = &self.inner;
        let mut handles = Vec::with_capacity(urls.len());
        let mut batch = Vec::new();

        for url in urls {
            if inner.active_downloads.get(url).is_some()
                || inner.cache_handler.get_cache_file_or_none(url).is_some()
            {
                continue;
            }

            let created = inner.active_downloads.get_or_create(
                url,
                |_| {},
                || {
                    let output = inner.cache_handler.get_or_create_cache_file(url)?;
                    let cancelable = Arc::new(CancelableDownload::new(
                        url,
                        true,
                        Arc::clone(&inner.dispose_executor),
                        inner.dispose_timeout,
                    ));
                    Ok(ActiveDownloadRequest::new(
                        url,
                        output,
                        1,
                        Arc::clone(&cancelable),
                        None,
                    ))
                },
            );

            let (cancelable, existed) = match created {
                Ok(created) => created,
                Err(e) => {
                    warn!("预加载创建缓存文件失败: url={}, 错误: {:#}", url, e);
                    continue;
                }
            };

            if !existed {
                batch.push(url.clone());
                handles.push(cancelable);
            }
        }

        if !batch.is_empty() {
            info!("预加载批量入队: {} 个文件", batch.len());
            if inner.batch_tx.send(batch).is_err() {
                warn!("预加载队列已关闭");
            }
        }

        handles
    }

    /// 缓存目录里是否有这个 URL 的文件（不论是否下载完成）
    pub fn is_file_in_cache(&self, url: &str) -> bool {
        self.inner.cache_handler.cache_file_for_url(url).exists()
    }

    pub fn is_file_downloaded(&self, url: &str) -> bool {
        self.get_cache_file(url).is_some()
    }

    /// 已下载完成的缓存文件
    pub fn get_cache_file(&self, url: &str) -> Option<PathBuf> {
        self.inner.cache_handler.get_cache_file_or_none(url)
    }

    pub fn cache_size(&self) -> u64 {
        self.inner.cache_handler.get_size()
    }

    pub fn is_running(&self, url: &str) -> bool {
        self.inner.active_downloads.is_running(url)
    }

    /// 正在进行的下载数
    pub fn active_downloads_count(&self) -> usize {
        self.inner.active_downloads.count()
    }

    /// 清空缓存
    ///
    /// 强制取消所有下载（不再回调），删除全部缓存文件和分片文件
    pub fn clear_cache(&self) {
        let inner = &self.inner;
        let requests = inner.active_downloads.clear();
        info!("清空缓存，取消 {} 个进行中的下载", requests.len());

        for request in requests {
            request.cancelable_download.clear_callbacks();
            request.cancelable_download.cancel_prefetch();
        }

        inner.checker.clear();
        inner.cache_handler.clear_cache();
    }
}

/// 普通队列调度
async fn run_queue(
    inner: Weak<Inner>,
    mut queue_rx: mpsc::UnboundedReceiver<String>,
    semaphore: Arc<Semaphore>,
) {
    while let Some(url) = queue_rx.recv().await {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        tokio::spawn(async move {
            inner.handle_file_download(&url).await;
            drop(permit);
        });
    }

    debug!("下载队列调度结束");
}

/// 预加载队列调度
async fn run_batch_queue(
    inner: Weak<Inner>,
    mut batch_rx: mpsc::UnboundedReceiver<Vec<String>>,
    semaphore: Arc<Semaphore>,
) {
    while let Some(batch) = batch_rx.recv().await {
        for url in batch {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let Some(inner) = inner.upgrade() else {
                return;
            };

            tokio::spawn(async move {
                inner.handle_file_download(&url).await;
                drop(permit);
            });
        }
    }

    debug!("预加载队列调度结束");
}

impl Inner {
    /// 不在注册表里的句柄，取消它没有任何效果
    fn detached_handle(&self, url: &str) -> Arc<CancelableDownload> {
        Arc::new(CancelableDownload::new(
            url,
            false,
            Arc::clone(&self.dispose_executor),
            self.dispose_timeout,
        ))
    }

    /// 执行一次下载管线，并把事件分发给回调
    async fn handle_file_download(&self, url: &str) {
        let Some(request) = self.active_downloads.get(url) else {
            debug!("下载请求已被移除: url={}", url);
            return;
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pipeline = self.run_pipeline(url, events_tx);
        tokio::pin!(pipeline);

        let result = loop {
            tokio::select! {
                biased;

                Some(event) = events_rx.recv() => self.handle_results(url, &request, event),
                result = &mut pipeline => break result,
            }
        };

        while let Ok(event) = events_rx.try_recv() {
            self.handle_results(url, &request, event);
        }

        let result = match result {
            Ok(result) => result,
            Err(e) => ErrorMapper::map_error(url, e),
        };
        self.handle_results(url, &request, result);
    }

    async fn run_pipeline(
        &self,
        url: &str,
        events_tx: mpsc::UnboundedSender<FileDownloadResult>,
    ) -> Result<FileDownloadResult, FileCacheError> {
        let request = self
            .active_downloads
            .get(url)
            .ok_or_else(|| self.active_downloads.aborted_error(url))?;

        if !request.cancelable_download.is_running() {
            return Err(self.active_downloads.aborted_error(url));
        }

        if !request.output.exists() {
            return Err(FileCacheError::OutputFileDoesNotExist(request.output));
        }

        let check = self.checker.check(url).await?;
        if check.not_found_on_server {
            return Err(FileCacheError::FileNotFoundOnServer);
        }

        self.downloader
            .download(check, url, request.chunks_count > 1, &events_tx)
            .await
    }

    fn handle_results(&self, url: &str, request: &ActiveDownloadRequest, result: FileDownloadResult) {
        let cancelable = &request.cancelable_download;

        match result {
            FileDownloadResult::Start { chunks_count } => {
                cancelable.for_each_callback(|l| l.on_start(chunks_count));
            }
            FileDownloadResult::Progress {
                chunk_index,
                downloaded,
                chunk_size,
            } => {
                cancelable.for_each_callback(|l| l.on_progress(chunk_index, downloaded, chunk_size));
            }
            terminal => self.dispatch_terminal(url, request, terminal),
        }
    }

    /// 终态：移出注册表并清理，然后回调一次终态 + `on_end`
    ///
    /// 请求已被 `clear_cache()` 移除时什么都不清理，输出文件可能已属于新的请求
    fn dispatch_terminal(
        &self,
        url: &str,
        request: &ActiveDownloadRequest,
        result: FileDownloadResult,
    ) {
        let cancelable = &request.cancelable_download;
        let discard_output =
            result.is_error_of_any_kind() && !matches!(result, FileDownloadResult::Stopped);

        let removed = self
            .active_downloads
            .remove_with_callbacks(url, cancelable, |removed| {
                if discard_output {
                    removed.cancelable_download.cancel_prefetch();
                    self.cache_handler.delete_cache_file(&removed.output);
                }
            });

        let callbacks = match removed {
            Some((_, callbacks)) => callbacks,
            None => {
                debug!("下载请求已被清除，跳过清理和回调: url={}", url);
                Vec::new()
            }
        };

        match &result {
            FileDownloadResult::Success { file, request_time } => {
                let len = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
                self.cache_handler.file_was_added(len);
                debug!(
                    "下载成功: url={}, 大小={}, 耗时={}ms",
                    url,
                    len,
                    request_time.as_millis()
                );
                notify(&callbacks, |l| l.on_success(file, false));
            }
            FileDownloadResult::Canceled => {
                info!("下载已取消: url={}", url);
                notify(&callbacks, |l| l.on_cancel());
            }
            FileDownloadResult::Stopped => {
                info!("下载已停止: url={}", url);
                notify(&callbacks, |l| l.on_stop(&request.output));
            }
            FileDownloadResult::KnownException(FileCacheError::FileNotFoundOnServer) => {
                warn!("服务器上不存在该文件: url={}", url);
                notify(&callbacks, |l| l.on_not_found());
            }
            FileDownloadResult::KnownException(e) => {
                warn!("下载失败: url={}, 错误: {}", url, e);
                notify(&callbacks, |l| l.on_fail(e));
            }
            FileDownloadResult::UnknownException(e) => {
                error!("下载失败（未知错误）: url={}, 错误: {:?}", url, e);
                let generic = FileCacheError::Unknown(anyhow::anyhow!("下载失败: {}", e));
                notify(&callbacks, |l| l.on_fail(&generic));
            }
            FileDownloadResult::Start { .. } | FileDownloadResult::Progress { .. } => {}
        }

        notify(&callbacks, |l| l.on_end());
    }
}

fn notify<F>(callbacks: &[Arc<dyn FileCacheListener>], f: F)
where
    F: Fn(&dyn FileCacheListener),
{
    for listener in callbacks {
        f(listener.as_ref());
    }
}
