// Chunked File Cache Library
// 磁盘缓存 + 可断点、可取消的并发分片下载

// 磁盘缓存模块
pub mod cache;

// 公共模块（后台线程、哈希、清理协调）
pub mod common;

// 配置管理模块
pub mod config;

// 分片下载管线
pub mod downloader;

// 文件缓存门面
pub mod file_cache;

// 日志模块
pub mod logging;

// 导出常用类型
pub use cache::CacheHandler;
pub use common::ExpectedHash;
pub use config::AppConfig;
pub use downloader::{CancelableDownload, DownloadState, FileCacheError};
pub use file_cache::{DownloadOptions, FileCacheListener, FileCacheV2, FileDownloadResult};
