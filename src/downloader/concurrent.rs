//! 并发分片下载
//!
//! 一个 URL 的完整流程：
//! 1. 决定分片数（不支持 Range 或只有 1 片时整文件下载）
//! 2. 每个分片独立下载+落盘，瞬时 I/O 错误在分片内部重试
//! 3. 所有分片都成功后按偏移顺序合并
//!
//! 进度与分片结果走两个独立通道，由同一个 select 循环汇合后转发给调用方

use crate::downloader::active::ActiveDownloads;
use crate::downloader::chunk::{self, Chunk};
use crate::downloader::chunk_downloader::ChunkDownloader;
use crate::downloader::chunk_merger::ChunkMerger;
use crate::downloader::chunk_persister::{ChunkPersister, ChunkProgress, ChunkSuccess};
use crate::downloader::error::FileCacheError;
use crate::downloader::partial_content::PartialContentCheckResult;
use crate::downloader::state::DownloadState;
use crate::file_cache::FileDownloadResult;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 分片任务的结果
type ChunkOutcome = (usize, Result<ChunkSuccess, FileCacheError>);

/// 每个分片已上报的最大进度
///
/// 分片重试时从 0 重新计数，低于已上报值的进度不再转发
struct ReportedProgress {
    high_water: Vec<u64>,
}

impl ReportedProgress {
    fn new(chunks_count: usize) -> Self {
        Self {
            high_water: vec![0; chunks_count],
        }
    }

    fn forward(&mut self, progress: ChunkProgress, events: &mpsc::UnboundedSender<FileDownloadResult>) {
        let Some(high_water) = self.high_water.get_mut(progress.chunk_index) else {
            return;
        };
        if progress.downloaded < *high_water {
            return;
        }
        *high_water = progress.downloaded;

        let _ = events.send(FileDownloadResult::Progress {
            chunk_index: progress.chunk_index,
            downloaded: progress.downloaded,
            chunk_size: progress.chunk_size,
        });
    }
}

/// 并发分片下载器
#[derive(Clone)]
pub struct ConcurrentChunkedFileDownloader {
    active_downloads: Arc<ActiveDownloads>,
    chunk_downloader: ChunkDownloader,
    chunk_persister: ChunkPersister,
    chunk_merger: ChunkMerger,
    /// 单个文件最大分片数
    max_chunks: usize,
    min_chunk_size: u64,
    /// 单个分片最大重试次数
    max_retries: u32,
    retry_delay: Duration,
}

impl ConcurrentChunkedFileDownloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        active_downloads: Arc<ActiveDownloads>,
        chunk_downloader: ChunkDownloader,
        chunk_persister: ChunkPersister,
        chunk_merger: ChunkMerger,
        max_chunks: usize,
        min_chunk_size: u64,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            active_downloads,
            chunk_downloader,
            chunk_persister,
            chunk_merger,
            max_chunks: max_chunks.max(1),
            min_chunk_size,
            max_retries,
            retry_delay,
        }
    }

    /// 下载 URL
    ///
    /// `Start`/`Progress` 事件通过 `events` 发出，成功时返回 `Success`
    pub async fn download(
        &self,
        check_result: PartialContentCheckResult,
        url: &str,
        chunked: bool,
        events: &mpsc::UnboundedSender<FileDownloadResult>,
    ) -> Result<FileDownloadResult, FileCacheError> {
        let request_start = Instant::now();

        let request = self
            .active_downloads
            .get(url)
            .ok_or_else(|| self.active_downloads.aborted_error(url))?;
        let output = request.output.clone();

        if !output.exists() {
            return Err(FileCacheError::OutputFileDoesNotExist(output));
        }

        let chunks = self.calculate_chunks(&check_result, chunked, request.chunks_count)?;
        let chunks_count = chunks.len();

        let _ = events.send(FileDownloadResult::Start { chunks_count });

        if !self.active_downloads.is_running(url) {
            return Err(self.active_downloads.aborted_error(url));
        }

        if check_result.could_determine_file_size() {
            self.active_downloads
                .update_total_length(url, check_result.length as u64);
        }
        self.active_downloads.add_chunks(url, &chunks);

        info!(
            "开始下载: url={}, 分片数={}, 文件大小={}",
            url, chunks_count, check_result.length
        );

        let sibling_abort = CancellationToken::new();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ChunkProgress>();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<ChunkOutcome>();

        for (chunk_index, chunk) in chunks.iter().copied().enumerate() {
            let this = self.clone();
            let url = url.to_string();
            let sibling_abort = sibling_abort.clone();
            let progress_tx = progress_tx.clone();
            let outcome_tx = outcome_tx.clone();

            tokio::spawn(async move {
                let result = this
                    .process_chunk(
                        &url,
                        chunk,
                        chunk_index,
                        chunks_count,
                        &sibling_abort,
                        &progress_tx,
                    )
                    .await;
                let _ = outcome_tx.send((chunk_index, result));
            });
        }

        // 只保留任务持有的发送端，任务全部结束后通道关闭
        drop(progress_tx);
        drop(outcome_tx);

        let mut successes: Vec<ChunkSuccess> = Vec::with_capacity(chunks_count);
        let mut errors: Vec<FileCacheError> = Vec::new();
        let mut received = 0usize;
        let mut reported = ReportedProgress::new(chunks_count);

        loop {
            tokio::select! {
                biased;

                Some(progress) = progress_rx.recv() => reported.forward(progress, events),
                outcome = outcome_rx.recv() => {
                    let (chunk_index, result) = match outcome {
                        Some(outcome) => outcome,
                        None => break,
                    };
                    received += 1;

                    match result {
                        Ok(success) => successes.push(success),
                        Err(error) => {
                            if Self::is_sibling_abort(&sibling_abort, &error) {
                                debug!("分片因兄弟分片失败而中止: url={}, chunk={}", url, chunk_index);
                                continue;
                            }

                            if !error.is_cancellation() {
                                warn!(
                                    "分片下载失败，中止其余分片: url={}, chunk={}, 错误: {}",
                                    url, chunk_index, error
                                );
                                sibling_abort.cancel();
                            }
                            errors.push(error);
                        }
                    }
                }
            }
        }

        while let Ok(progress) = progress_rx.try_recv() {
            reported.forward(progress, events);
        }

        if received < chunks_count && errors.is_empty() {
            errors.push(FileCacheError::Unknown(anyhow::anyhow!(
                "分片任务异常退出: 期望 {} 个结果, 实际 {}",
                chunks_count,
                received
            )));
        }

        if !errors.is_empty() {
            for success in &successes {
                let _ = tokio::fs::remove_file(&success.chunk_file).await;
            }

            return Err(if errors.len() == 1 {
                errors.remove(0)
            } else {
                FileCacheError::Composite(errors)
            });
        }

        self.chunk_merger
            .merge_chunks_into_cache_file(url, successes, &output, request_start)
            .await
    }

    /// 决定分片
    fn calculate_chunks(
        &self,
        check_result: &PartialContentCheckResult,
        chunked: bool,
        requested_chunks: usize,
    ) -> Result<Vec<Chunk>, FileCacheError> {
        let chunks_count = requested_chunks.min(self.max_chunks).max(1);

        let can_chunk = chunked
            && chunks_count > 1
            && check_result.supports_partial_content_download
            && check_result.could_determine_file_size();

        if !can_chunk {
            return Ok(vec![Chunk::whole_file()]);
        }

        let chunks = chunk::split(
            check_result.length as u64,
            chunks_count as u32,
            self.min_chunk_size,
        )?;
        Ok(chunks)
    }

    /// 由本地中止令牌引起、且下载本身仍在运行的取消
    fn is_sibling_abort(sibling_abort: &CancellationToken, error: &FileCacheError) -> bool {
        sibling_abort.is_cancelled()
            && matches!(
                error,
                FileCacheError::Cancellation {
                    state: DownloadState::Running,
                    ..
                }
            )
    }

    /// 单个分片：下载 + 落盘，瞬时错误重试
    async fn process_chunk(
        &self,
        url: &str,
        chunk: Chunk,
        chunk_index: usize,
        chunks_count: usize,
        sibling_abort: &CancellationToken,
        progress: &mpsc::UnboundedSender<ChunkProgress>,
    ) -> Result<ChunkSuccess, FileCacheError> {
        let mut retries = 0u32;

        loop {
            if sibling_abort.is_cancelled() || !self.active_downloads.is_running(url) {
                return Err(self.active_downloads.aborted_error(url));
            }

            let result = match self
                .chunk_downloader
                .download_chunk(url, chunk, chunks_count, sibling_abort)
                .await
            {
                Ok(response) => {
                    self.chunk_persister
                        .store_chunk_in_file(url, response, chunk_index, chunks_count, progress)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(success) => return Ok(success),
                Err(e)
                    if e.is_retryable()
                        && retries < self.max_retries
                        && self.active_downloads.is_running(url) =>
                {
                    retries += 1;
                    warn!(
                        "分片 #{} 下载失败，{}ms 后重试 ({}/{}): url={}, 错误: {}",
                        chunk_index,
                        self.retry_delay.as_millis(),
                        retries,
                        self.max_retries,
                        url,
                        e
                    );

                    tokio::select! {
                        _ = sibling_abort.cancelled() => {}
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::partial_content::PartialContentSupportChecker;
    use crate::downloader::test_support::{
        chunked_response, mount_range_file, serve_raw_responses, test_content, TestEnv,
    };
    use reqwest::Client;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MIN_CHUNK_SIZE: u64 = 1024;

    fn downloader(env: &TestEnv) -> ConcurrentChunkedFileDownloader {
        let client = Client::new();
        ConcurrentChunkedFileDownloader::new(
            Arc::clone(&env.active_downloads),
            ChunkDownloader::new(
                client,
                Arc::clone(&env.active_downloads),
                "test-agent".to_string(),
                Duration::from_secs(10),
            ),
            ChunkPersister::new(
                Arc::clone(&env.cache_handler),
                Arc::clone(&env.active_downloads),
            ),
            ChunkMerger::new(
                Arc::clone(&env.cache_handler),
                Arc::clone(&env.active_downloads),
            ),
            4,
            MIN_CHUNK_SIZE,
            2,
            Duration::from_millis(10),
        )
    }

    fn collect_events(rx: &mut mpsc::UnboundedReceiver<FileDownloadResult>) -> Vec<FileDownloadResult> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_chunked_download() {
        let server = MockServer::start().await;
        let content = test_content(100 * 1024 + 3);
        let range_requests = mount_range_file(&server, "/big.bin", &content).await;

        let env = TestEnv::new();
        let url = format!("{}/big.bin", server.uri());
        env.register(&url, 4, None);

        let checker = PartialContentSupportChecker::new(
            Client::new(),
            Arc::clone(&env.active_downloads),
            Duration::from_secs(5),
            MIN_CHUNK_SIZE,
            16,
        );
        let check = checker.check(&url).await.unwrap();
        assert!(check.supports_partial_content_download);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = downloader(&env).download(check, &url, true, &tx).await.unwrap();

        let file = match result {
            FileDownloadResult::Success { file, .. } => file,
            other => panic!("unexpected result: {:?}", other),
        };
        assert_eq!(std::fs::read(&file).unwrap(), content);
        assert_eq!(range_requests.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert!(env.cache_handler.is_already_downloaded(&file));
        assert_eq!(env.active_downloads.get_chunks(&url).len(), 4);

        let events = collect_events(&mut rx);
        assert!(matches!(events[0], FileDownloadResult::Start { chunks_count: 4 }));

        // 每个分片的进度单调不减，且最终到达分片大小
        for index in 0..4 {
            let progress: Vec<(u64, u64)> = events
                .iter()
                .filter_map(|e| match e {
                    FileDownloadResult::Progress {
                        chunk_index,
                        downloaded,
                        chunk_size,
                    } if *chunk_index == index => Some((*downloaded, *chunk_size)),
                    _ => None,
                })
                .collect();
            assert!(!progress.is_empty());
            assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
            let (last_downloaded, chunk_size) = *progress.last().unwrap();
            assert_eq!(last_downloaded, chunk_size);
        }

        // 分片文件已清理
        assert_eq!(
            std::fs::read_dir(env.cache_handler.chunks_cache_dir())
                .unwrap()
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn test_unsupported_falls_back_to_whole_file() {
        let server = MockServer::start().await;
        let content = test_content(10 * 1024);
        let range_requests = mount_range_file(&server, "/plain.bin", &content).await;

        let env = TestEnv::new();
        let url = format!("{}/plain.bin", server.uri());
        env.register(&url, 4, None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = downloader(&env)
            .download(PartialContentCheckResult::unsupported(), &url, true, &tx)
            .await
            .unwrap();

        assert!(matches!(result, FileDownloadResult::Success { .. }));
        assert_eq!(range_requests.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(
            std::fs::read(env.cache_handler.cache_file_for_url(&url)).unwrap(),
            content
        );
        // 整文件下载的总大小来自 GET 响应
        assert_eq!(env.active_downloads.get_total(&url), Some(content.len() as u64));

        let events = collect_events(&mut rx);
        assert!(matches!(events[0], FileDownloadResult::Start { chunks_count: 1 }));
    }

    #[tokio::test]
    async fn test_not_found_on_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.bin"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let env = TestEnv::new();
        let url = format!("{}/gone.bin", server.uri());
        env.register(&url, 1, None);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = downloader(&env)
            .download(PartialContentCheckResult::unsupported(), &url, false, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, FileCacheError::FileNotFoundOnServer));
    }

    #[tokio::test]
    async fn test_http_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/error.bin"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let env = TestEnv::new();
        let url = format!("{}/error.bin", server.uri());
        env.register(&url, 1, None);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = downloader(&env)
            .download(PartialContentCheckResult::unsupported(), &url, false, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, FileCacheError::HttpCode(500)));
    }

    #[tokio::test]
    async fn test_canceled_before_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let env = TestEnv::new();
        let url = format!("{}/canceled.bin", server.uri());
        env.register(&url, 1, None).stop();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = downloader(&env)
            .download(PartialContentCheckResult::unsupported(), &url, false, &tx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FileCacheError::Cancellation {
                state: DownloadState::Stopped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(test_content(1024))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let env = TestEnv::new();
        let url = format!("{}/slow.bin", server.uri());
        let cancelable = env.register(&url, 1, None);

        let canceler = {
            let cancelable = Arc::clone(&cancelable);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                tokio::task::spawn_blocking(move || cancelable.cancel())
                    .await
                    .unwrap();
            })
        };

        let (tx, _rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let err = downloader(&env)
            .download(PartialContentCheckResult::unsupported(), &url, false, &tx)
            .await
            .unwrap_err();
        canceler.await.unwrap();

        assert!(matches!(
            err,
            FileCacheError::Cancellation {
                state: DownloadState::Canceled,
                ..
            }
        ));
        // 释放函数直接中止了挂起的请求，不用等服务器响应
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    fn chunk_progress(events: &[FileDownloadResult], index: usize) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                FileDownloadResult::Progress {
                    chunk_index,
                    downloaded,
                    ..
                } if *chunk_index == index => Some(*downloaded),
                _ => None,
            })
            .collect()
    }

    fn chunk_files_left(env: &TestEnv) -> usize {
        std::fs::read_dir(env.cache_handler.chunks_cache_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_transient_body_error_is_retried() {
        let content = test_content(200_000);
        // 第一次连接发到一半就断开，第二次完整返回
        let (base, connections) = serve_raw_responses(vec![
            chunked_response(&content[..120_000], 16 * 1024, false),
            chunked_response(&content, 16 * 1024, true),
        ])
        .await;

        let env = TestEnv::new();
        let url = format!("{}/flaky.bin", base);
        env.register(&url, 1, None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = downloader(&env)
            .download(PartialContentCheckResult::unsupported(), &url, false, &tx)
            .await
            .unwrap();

        assert!(matches!(result, FileDownloadResult::Success { .. }));
        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert_eq!(
            std::fs::read(env.cache_handler.cache_file_for_url(&url)).unwrap(),
            content
        );
        assert_eq!(env.active_downloads.get_downloaded(&url), Some(content.len() as u64));

        // 重试后的进度不会回退
        let progress = chunk_progress(&collect_events(&mut rx), 0);
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
        assert_eq!(progress.last().copied(), Some(content.len() as u64));
    }

    #[tokio::test]
    async fn test_short_read_is_cancellation() {
        let content = test_content(120_000);
        let mut response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 200000\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(&content);
        let (base, connections) = serve_raw_responses(vec![response]).await;

        let env = TestEnv::new();
        let url = format!("{}/short.bin", base);
        env.register(&url, 1, None);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = downloader(&env)
            .download(PartialContentCheckResult::unsupported(), &url, false, &tx)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FileCacheError::Cancellation {
                state: DownloadState::Running,
                ..
            }
        ));
        // 不重试，下载被强制取消
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(env.active_downloads.get_state(&url), Some(DownloadState::Canceled));
        assert_eq!(chunk_files_left(&env), 0);
    }

    #[tokio::test]
    async fn test_failed_chunk_aborts_siblings() {
        let server = MockServer::start().await;
        let content = test_content(8 * 1024);
        mount_range_file(&server, "/partial.bin", &content).await;
        Mock::given(method("GET"))
            .and(path("/partial.bin"))
            .and(header("Range", "bytes=2048-4095"))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&server)
            .await;

        let env = TestEnv::new();
        let url = format!("{}/partial.bin", server.uri());
        env.register(&url, 4, None);

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = downloader(&env)
            .download(
                PartialContentCheckResult::supported(content.len() as u64),
                &url,
                true,
                &tx,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FileCacheError::HttpCode(500)), "{:?}", err);
        assert_eq!(chunk_files_left(&env), 0);
        // 兄弟分片的中止不会改变请求本身的状态
        assert_eq!(env.active_downloads.get_state(&url), Some(DownloadState::Running));
        assert!(!env.cache_handler.is_already_downloaded(&env.cache_handler.cache_file_for_url(&url)));
    }

    #[test]
    fn test_reported_progress_drops_regressions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reported = ReportedProgress::new(2);
        let progress = |chunk_index, downloaded| ChunkProgress {
            chunk_index,
            downloaded,
            chunk_size: 100,
        };

        for (index, downloaded) in [(0, 30), (0, 60), (1, 10), (0, 20), (0, 60), (0, 100), (5, 1)] {
            reported.forward(progress(index, downloaded), &tx);
        }

        let events = collect_events(&mut rx);
        assert_eq!(chunk_progress(&events, 0), vec![30, 60, 60, 100]);
        assert_eq!(chunk_progress(&events, 1), vec![10]);
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn test_calculate_chunks() {
        let env = TestEnv::new();
        let downloader = downloader(&env);

        let supported = PartialContentCheckResult::supported(10 * 1024);
        assert_eq!(downloader.calculate_chunks(&supported, true, 8).unwrap().len(), 4);
        assert_eq!(downloader.calculate_chunks(&supported, true, 2).unwrap().len(), 2);
        assert_eq!(
            downloader.calculate_chunks(&supported, false, 4).unwrap(),
            vec![Chunk::whole_file()]
        );
        assert_eq!(
            downloader.calculate_chunks(&supported, true, 1).unwrap(),
            vec![Chunk::whole_file()]
        );
        assert_eq!(
            downloader
                .calculate_chunks(&PartialContentCheckResult::unsupported(), true, 4)
                .unwrap(),
            vec![Chunk::whole_file()]
        );
    }
}
