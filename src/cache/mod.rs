//! 磁盘缓存
//!
//! 每个 URL 对应一对文件：`<hash>.cache` 存数据，`<hash>.cache_meta` 存创建时间和完成标记

pub mod handler;
pub mod meta;

pub use handler::{CacheHandler, TrimStats, CACHE_EXTENSION, CACHE_META_EXTENSION, CHUNK_EXTENSION};
pub use meta::CacheFileMeta;
