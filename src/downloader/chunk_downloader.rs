use crate::downloader::active::ActiveDownloads;
use crate::downloader::chunk::Chunk;
use crate::downloader::error::FileCacheError;
use reqwest::header::{RANGE, USER_AGENT};
use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 分片请求的响应
pub struct ChunkResponse {
    pub chunk: Chunk,
    pub response: Response,
    /// 中止该分片读取的令牌（下载被取消/停止或兄弟分片失败时触发）
    pub abort: CancellationToken,
}

/// 发起单个分片（或整文件）的 GET 请求
#[derive(Clone)]
pub struct ChunkDownloader {
    client: Client,
    active_downloads: Arc<ActiveDownloads>,
    user_agent: String,
    request_timeout: Duration,
}

impl ChunkDownloader {
    pub fn new(
        client: Client,
        active_downloads: Arc<ActiveDownloads>,
        user_agent: String,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            active_downloads,
            user_agent,
            request_timeout,
        }
    }

    /// 下载分片
    ///
    /// # 参数
    /// * `sibling_abort` - 同一请求内所有分片共享的中止令牌
    ///
    /// # 返回
    /// 原始响应，body 由 ChunkPersister 读取
    pub async fn download_chunk(
        &self,
        url: &str,
        chunk: Chunk,
        total_chunks_count: usize,
        sibling_abort: &CancellationToken,
    ) -> Result<ChunkResponse, FileCacheError> {
        if self.active_downloads.get(url).is_none() {
            return Err(self.active_downloads.aborted_error(url));
        }

        if chunk.is_whole_file() && total_chunks_count > 1 {
            return Err(FileCacheError::BadChunk(format!(
                "整文件分片不能和其他分片同时存在: chunks={}",
                total_chunks_count
            )));
        }

        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .timeout(self.request_timeout);

        if let Some(range) = chunk.range_header() {
            request = request.header(RANGE, range);
        }

        debug!(
            "开始下载分片: url={}, chunk={}, 分片总数={}",
            url, chunk, total_chunks_count
        );

        let abort = sibling_abort.child_token();
        let token = abort.clone();
        let state = self
            .active_downloads
            .add_dispose_func(url, Box::new(move || token.cancel()));
        if !state.is_running() {
            return Err(self.active_downloads.aborted_error(url));
        }

        let response = tokio::select! {
            _ = abort.cancelled() => {
                return Err(self.active_downloads.aborted_error(url));
            }
            result = request.send() => result?,
        };

        Ok(ChunkResponse {
            chunk,
            response,
            abort,
        })
    }
}
