use crate::cache::CacheHandler;
use crate::downloader::active::ActiveDownloads;
use crate::downloader::chunk::Chunk;
use crate::downloader::chunk_downloader::ChunkResponse;
use crate::downloader::error::FileCacheError;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 未知分片大小时的进度通知间隔
const UNKNOWN_SIZE_NOTIFY_BYTES: u64 = 8192;

/// 写盘缓冲区大小
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// 分片进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk_index: usize,
    /// 该分片已写入字节数
    pub downloaded: u64,
    /// 该分片总字节数（未知时等于 downloaded）
    pub chunk_size: u64,
}

/// 分片下载成功
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSuccess {
    pub chunk_index: usize,
    pub chunk: Chunk,
    pub chunk_file: PathBuf,
}

/// 把分片响应写入分片临时文件
#[derive(Clone)]
pub struct ChunkPersister {
    cache_handler: Arc<CacheHandler>,
    active_downloads: Arc<ActiveDownloads>,
}

impl ChunkPersister {
    pub fn new(cache_handler: Arc<CacheHandler>, active_downloads: Arc<ActiveDownloads>) -> Self {
        Self {
            cache_handler,
            active_downloads,
        }
    }

    /// 保存分片
    ///
    /// 失败时删除分片文件并回退已计入的下载字节数
    pub async fn store_chunk_in_file(
        &self,
        url: &str,
        chunk_response: ChunkResponse,
        chunk_index: usize,
        total_chunks_count: usize,
        progress: &mpsc::UnboundedSender<ChunkProgress>,
    ) -> Result<ChunkSuccess, FileCacheError> {
        let chunk = chunk_response.chunk;

        if chunk.is_whole_file() && total_chunks_count > 1 {
            return Err(FileCacheError::BadChunk(format!(
                "整文件分片不能和其他分片同时存在: chunks={}",
                total_chunks_count
            )));
        }

        let status = chunk_response.response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FileCacheError::FileNotFoundOnServer);
        }
        if !status.is_success() {
            return Err(FileCacheError::HttpCode(status.as_u16()));
        }
        // 服务器忽略 Range 返回整文件时不能当作分片写入
        if !chunk.is_whole_file() && status != StatusCode::PARTIAL_CONTENT {
            warn!(
                "分片请求没有返回 206: url={}, chunk={}, status={}",
                url, chunk, status
            );
            return Err(FileCacheError::HttpCode(status.as_u16()));
        }

        let chunk_file = self
            .cache_handler
            .get_or_create_chunk_cache_file(chunk.start, chunk.end, url)?;

        let mut written = 0u64;
        let result = self
            .read_body_loop(
                url,
                chunk_response,
                &chunk_file,
                chunk_index,
                total_chunks_count,
                progress,
                &mut written,
            )
            .await;

        match result {
            Ok(()) => {
                debug!(
                    "分片保存完成: url={}, chunk={}, 大小={} bytes",
                    url, chunk, written
                );
                Ok(ChunkSuccess {
                    chunk_index,
                    chunk,
                    chunk_file,
                })
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&chunk_file).await {
                    debug!("删除失败分片文件出错: {:?}, {}", chunk_file, remove_err);
                }
                self.active_downloads.rollback_downloaded(url, written);
                Err(self.handle_error(url, e))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_body_loop(
        &self,
        url: &str,
        chunk_response: ChunkResponse,
        chunk_file: &Path,
        chunk_index: usize,
        total_chunks_count: usize,
        progress: &mpsc::UnboundedSender<ChunkProgress>,
        written: &mut u64,
    ) -> Result<(), FileCacheError> {
        let ChunkResponse {
            chunk,
            response,
            abort,
        } = chunk_response;

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        // 不分片时总大小只能从 GET 响应得知
        if total_chunks_count == 1 {
            if let Some(len) = content_length {
                self.active_downloads.update_total_length(url, len);
            }
        }

        let chunk_size = content_length.or_else(|| chunk.size());
        let notify_size = match chunk_size {
            Some(size) if size >= 10 => size / 10,
            _ => UNKNOWN_SIZE_NOTIFY_BYTES,
        };

        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(chunk_file)
            .await
            .map_err(|_| FileCacheError::output_stream(chunk_file.to_path_buf()))?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let mut stream = response.bytes_stream();
        let mut last_notified = 0u64;

        loop {
            let next = tokio::select! {
                _ = abort.cancelled() => {
                    return Err(self.active_downloads.aborted_error(url));
                }
                next = stream.next() => next,
            };

            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => match chunk_size {
                    // 声明了长度但连接提前结束：短读，按取消处理，不重试
                    Some(expected) if *written < expected => {
                        warn!(
                            "分片读取中断: url={}, chunk={}, 期望={}, 实际={}, 错误: {}",
                            url, chunk, expected, written, e
                        );
                        return Err(self.active_downloads.cancellation_error(url));
                    }
                    _ => return Err(e.into()),
                },
                None => break,
            };

            if !self.active_downloads.is_running(url) {
                return Err(self.active_downloads.aborted_error(url));
            }

            writer.write_all(&bytes).await?;

            let len = bytes.len() as u64;
            *written += len;
            self.active_downloads.update_downloaded(url, len);

            if *written - last_notified >= notify_size {
                last_notified = *written;
                let _ = progress.send(ChunkProgress {
                    chunk_index,
                    downloaded: *written,
                    chunk_size: chunk_size.unwrap_or(*written),
                });
            }
        }

        writer.flush().await?;

        // 读到的字节数与声明长度不符，视为损坏
        if let Some(expected) = chunk_size {
            if *written != expected {
                warn!(
                    "分片长度不符: url={}, chunk={}, 期望={}, 实际={}",
                    url, chunk, expected, written
                );
                return Err(self.active_downloads.cancellation_error(url));
            }
        }

        let _ = progress.send(ChunkProgress {
            chunk_index,
            downloaded: *written,
            chunk_size: chunk_size.unwrap_or(*written),
        });

        Ok(())
    }

    /// 下载已不在运行时，任何错误都归为取消
    fn handle_error(&self, url: &str, error: FileCacheError) -> FileCacheError {
        if error.is_cancellation() {
            return error;
        }

        if !self.active_downloads.is_running(url) {
            debug!("下载已不在运行，错误按取消处理: url={}, 错误: {}", url, error);
            return self.active_downloads.aborted_error(url);
        }

        error
    }
}
