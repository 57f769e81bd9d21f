//! 分片下载能力探测
//!
//! 用 HEAD 请求判断服务器是否支持 Range 请求，并按 URL 缓存结论

use crate::downloader::active::ActiveDownloads;
use crate::downloader::error::FileCacheError;
use moka::sync::Cache;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH};
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialContentCheckResult {
    /// 是否支持 Range 请求
    pub supports_partial_content_download: bool,
    /// 服务器返回 404
    pub not_found_on_server: bool,
    /// 文件长度，-1 表示未知
    pub length: i64,
}

impl PartialContentCheckResult {
    pub fn unsupported() -> Self {
        Self {
            supports_partial_content_download: false,
            not_found_on_server: false,
            length: -1,
        }
    }

    pub fn not_found() -> Self {
        Self {
            supports_partial_content_download: false,
            not_found_on_server: true,
            length: -1,
        }
    }

    pub fn supported(length: u64) -> Self {
        Self {
            supports_partial_content_download: true,
            not_found_on_server: false,
            length: length as i64,
        }
    }

    pub fn could_determine_file_size(&self) -> bool {
        self.length >= 0
    }
}

/// 分片下载能力探测器
pub struct PartialContentSupportChecker {
    client: Client,
    active_downloads: Arc<ActiveDownloads>,
    /// URL -> 探测结果（有界）
    cached_results: Cache<String, PartialContentCheckResult>,
    max_timeout: Duration,
    min_chunk_size: u64,
}

impl PartialContentSupportChecker {
    pub fn new(
        client: Client,
        active_downloads: Arc<ActiveDownloads>,
        max_timeout: Duration,
        min_chunk_size: u64,
        cache_capacity: u64,
    ) -> Self {
        Self {
            client,
            active_downloads,
            cached_results: Cache::new(cache_capacity),
            max_timeout,
            min_chunk_size,
        }
    }

    /// 探测 URL 是否支持分片下载
    ///
    /// - 批量下载直接返回不支持，不发 HEAD
    /// - 超时或网络错误返回不支持，但不缓存
    pub async fn check(&self, url: &str) -> Result<PartialContentCheckResult, FileCacheError> {
        if self.active_downloads.is_batch_download(url) {
            return Ok(PartialContentCheckResult::unsupported());
        }

        if let Some(cached) = self.cached_results.get(url) {
            debug!("命中探测缓存: url={}, result={:?}", url, cached);
            return Ok(cached);
        }

        let abort = CancellationToken::new();
        let token = abort.clone();
        let state = self
            .active_downloads
            .add_dispose_func(url, Box::new(move || token.cancel()));
        if !state.is_running() {
            return Err(self.active_downloads.aborted_error(url));
        }

        let started = Instant::now();
        let request = self.client.head(url).send();

        let response = tokio::select! {
            _ = abort.cancelled() => {
                return Err(self.active_downloads.aborted_error(url));
            }
            result = tokio::time::timeout(self.max_timeout, request) => result,
        };

        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("HEAD 请求失败，按不支持分片处理: url={}, 错误: {}", url, e);
                return Ok(PartialContentCheckResult::unsupported());
            }
            Err(_) => {
                warn!(
                    "HEAD 请求超时({:?})，按不支持分片处理: url={}",
                    self.max_timeout, url
                );
                return Ok(PartialContentCheckResult::unsupported());
            }
        };

        let result = match self.classify(url, &response) {
            Some(result) => result,
            None => return Ok(PartialContentCheckResult::unsupported()),
        };

        info!(
            "分片能力探测完成: url={}, 支持={}, 长度={}, 耗时={}ms",
            url,
            result.supports_partial_content_download,
            result.length,
            started.elapsed().as_millis()
        );

        self.cached_results.insert(url.to_string(), result);
        Ok(result)
    }

    /// 解析 HEAD 响应，返回 None 表示结论不可缓存
    fn classify(&self, url: &str, response: &Response) -> Option<PartialContentCheckResult> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Some(PartialContentCheckResult::not_found());
        }

        if !status.is_success() {
            warn!("HEAD 请求返回异常状态: url={}, status={}", url, status);
            return None;
        }

        let accept_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        if !accept_ranges {
            debug!("服务器不支持 Range 请求: url={}", url);
            return Some(PartialContentCheckResult::unsupported());
        }

        // 直接读头部，HEAD 响应没有 body
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|len| *len > 0);
        let length = match length {
            Some(length) => length,
            None => {
                debug!("Content-Length 缺失或无效: url={}", url);
                return Some(PartialContentCheckResult::unsupported());
            }
        };

        if length < self.min_chunk_size {
            return Some(PartialContentCheckResult {
                supports_partial_content_download: false,
                not_found_on_server: false,
                length: length as i64,
            });
        }

        Some(PartialContentCheckResult::supported(length))
    }

    /// 清除单个 URL 的探测缓存
    pub fn invalidate(&self, url: &str) {
        self.cached_results.invalidate(url);
    }

    pub fn clear(&self) {
        self.cached_results.invalidate_all();
    }
}
