use crate::cache::CacheHandler;
use crate::common::{compute_file_hash, ExpectedHash};
use crate::downloader::active::ActiveDownloads;
use crate::downloader::chunk_persister::ChunkSuccess;
use crate::downloader::error::FileCacheError;
use crate::file_cache::FileDownloadResult;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// 把分片文件按偏移顺序合并进最终缓存文件
#[derive(Clone)]
pub struct ChunkMerger {
    cache_handler: Arc<CacheHandler>,
    active_downloads: Arc<ActiveDownloads>,
}

impl ChunkMerger {
    pub fn new(cache_handler: Arc<CacheHandler>, active_downloads: Arc<ActiveDownloads>) -> Self {
        Self {
            cache_handler,
            active_downloads,
        }
    }

    /// 合并分片
    ///
    /// 按 `chunk.start` 升序拷贝，与分片完成顺序无关。
    /// 成功与否都会删除分片文件；成功后校验哈希并标记为已下载
    pub async fn merge_chunks_into_cache_file(
        &self,
        url: &str,
        chunk_successes: Vec<ChunkSuccess>,
        output: &Path,
        request_start: Instant,
    ) -> Result<FileDownloadResult, FileCacheError> {
        let expected_hash = self
            .active_downloads
            .get(url)
            .and_then(|r| r.expected_hash);

        let result = self
            .merge_and_verify(url, &chunk_successes, output, expected_hash.as_ref())
            .await;

        for success in &chunk_successes {
            if let Err(e) = tokio::fs::remove_file(&success.chunk_file).await {
                debug!("删除分片文件失败: {:?}, {}", success.chunk_file, e);
            }
        }

        result?;

        if !self.cache_handler.mark_file_downloaded(output) {
            return Err(FileCacheError::CouldNotMarkFileAsDownloaded(
                output.to_path_buf(),
            ));
        }

        let request_time = request_start.elapsed();
        info!(
            "✓ 文件下载完成: url={}, 分片数={}, 耗时={}ms",
            url,
            chunk_successes.len(),
            request_time.as_millis()
        );

        Ok(FileDownloadResult::Success {
            file: output.to_path_buf(),
            request_time,
        })
    }

    async fn merge_and_verify(
        &self,
        url: &str,
        chunk_successes: &[ChunkSuccess],
        output: &Path,
        expected_hash: Option<&ExpectedHash>,
    ) -> Result<(), FileCacheError> {
        if !self.active_downloads.is_running(url) {
            return Err(self.active_downloads.aborted_error(url));
        }

        if !output.exists() {
            return Err(FileCacheError::OutputFileDoesNotExist(output.to_path_buf()));
        }

        let mut sorted: Vec<&ChunkSuccess> = chunk_successes.iter().collect();
        sorted.sort_by_key(|s| s.chunk.start);

        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(output)
            .await
            .map_err(|_| FileCacheError::output_stream(output.to_path_buf()))?;
        let mut writer = BufWriter::new(file);

        for success in sorted {
            if !self.active_downloads.is_running(url) {
                return Err(self.active_downloads.aborted_error(url));
            }

            if !success.chunk_file.exists() {
                return Err(FileCacheError::ChunkFileDoesNotExist(
                    success.chunk_file.clone(),
                ));
            }

            let mut input = File::open(&success.chunk_file)
                .await
                .map_err(|_| FileCacheError::input_stream(success.chunk_file.clone()))?;

            tokio::io::copy(&mut input, &mut writer).await?;
        }

        writer.flush().await?;

        if let Some(expected) = expected_hash {
            let actual = compute_file_hash(output, expected).await?;
            if !expected.matches(&actual) {
                warn!(
                    "文件哈希校验失败: url={}, 期望={}, 实际={}",
                    url, expected, actual
                );
                return Err(FileCacheError::HashMismatch {
                    expected: expected.value().to_string(),
                    actual,
                });
            }
            debug!("文件哈希校验通过: url={}, {}", url, expected);
        }

        Ok(())
    }
}
