//! 分片下载管线
//!
//! 探测 Range 支持 -> 分片 -> 并发下载落盘 -> 合并

pub mod active;
pub mod cancelable;
pub mod chunk;
pub mod chunk_downloader;
pub mod chunk_merger;
pub mod chunk_persister;
pub mod concurrent;
pub mod error;
pub mod partial_content;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use active::{ActiveDownloadRequest, ActiveDownloads};
pub use cancelable::{CancelableDownload, DisposeFunc};
pub use chunk::{split, Chunk};
pub use chunk_downloader::{ChunkDownloader, ChunkResponse};
pub use chunk_merger::ChunkMerger;
pub use chunk_persister::{ChunkPersister, ChunkProgress, ChunkSuccess};
pub use concurrent::ConcurrentChunkedFileDownloader;
pub use error::FileCacheError;
pub use partial_content::{PartialContentCheckResult, PartialContentSupportChecker};
pub use state::DownloadState;
