//! 磁盘缓存管理
//!
//! 每个 URL 对应缓存目录下的一对文件：
//! - `<hash>.cache`       数据文件
//! - `<hash>.cache_meta`  元数据文件（创建时间 + 是否下载完成）
//!
//! 分片临时文件放在独立目录 `<hash>_<start>_<end>.chunk`，启动时清空

use crate::cache::meta::{read_meta, write_meta, CacheFileMeta};
use crate::common::{url_hash, BackgroundExecutor, TrimCoordinator};
use crate::config::CacheConfig;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// 数据文件扩展名
pub const CACHE_EXTENSION: &str = "cache";
/// 元数据文件扩展名
pub const CACHE_META_EXTENSION: &str = "cache_meta";
/// 分片文件扩展名
pub const CHUNK_EXTENSION: &str = "chunk";

/// 单次清理的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimStats {
    /// 删除的缓存条目数
    pub files_deleted: usize,
    /// 释放的字节数
    pub bytes_freed: u64,
}

/// 清理候选条目
struct TrimCandidate {
    data_file: PathBuf,
    size: u64,
    created_on: i64,
}

/// 磁盘缓存管理器
pub struct CacheHandler {
    config: CacheConfig,
    /// 缓存目录总大小（近似值）
    size: AtomicU64,
    /// 后台是否正在重算容量
    recalculation_running: AtomicBool,
    trim_coordinator: Arc<TrimCoordinator>,
    /// 清理/重算容量专用线程
    executor: BackgroundExecutor,
}

impl CacheHandler {
    /// 创建缓存管理器
    ///
    /// 创建缓存目录、清空分片目录，并在后台重算缓存容量
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("创建缓存目录失败: {:?}", config.cache_dir))?;
        fs::create_dir_all(&config.chunks_cache_dir)
            .with_context(|| format!("创建分片目录失败: {:?}", config.chunks_cache_dir))?;

        let trim_coordinator = Arc::new(TrimCoordinator::new(config.min_trim_interval()));
        let executor = BackgroundExecutor::new("file-cache-trim")?;

        let handler = Arc::new(Self {
            config,
            size: AtomicU64::new(0),
            recalculation_running: AtomicBool::new(false),
            trim_coordinator,
            executor,
        });

        // 分片文件不能跨进程存活
        handler.clear_chunks_cache_dir();
        handler.schedule_size_recalculation();

        info!(
            "缓存管理器初始化完成: 缓存目录={:?}, 分片目录={:?}, 容量上限={}MB",
            handler.config.cache_dir,
            handler.config.chunks_cache_dir,
            handler.config.current_budget() / 1024 / 1024
        );

        Ok(handler)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    pub fn chunks_cache_dir(&self) -> &Path {
        &self.config.chunks_cache_dir
    }

    /// 当前缓存大小（近似值）
    pub fn get_size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// URL 对应的数据文件路径（不创建）
    pub fn cache_file_for_url(&self, url: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.{}", url_hash(url), CACHE_EXTENSION))
    }

    fn meta_file_for(&self, file: &Path) -> PathBuf {
        file.with_extension(CACHE_META_EXTENSION)
    }

    /// 已下载完成的缓存文件，否则 None
    pub fn get_cache_file_or_none(&self, url: &str) -> Option<PathBuf> {
        let file = self.cache_file_for_url(url);
        if !file.exists() {
            return None;
        }

        if self.is_already_downloaded(&file) {
            Some(file)
        } else {
            None
        }
    }

    /// 获取或创建 URL 对应的缓存文件
    ///
    /// 新建时同时写入元数据（创建时间=现在，未下载）。任何 I/O 失败都会删除这对文件
    pub fn get_or_create_cache_file(&self, url: &str) -> Result<PathBuf> {
        let file = self.cache_file_for_url(url);

        match self.create_cache_file_if_needed(&file) {
            Ok(()) => Ok(file),
            Err(e) => {
                error!("创建缓存文件失败: url={}, 错误: {:#}", url, e);
                self.delete_cache_file(&file);
                Err(e)
            }
        }
    }

    fn create_cache_file_if_needed(&self, file: &Path) -> Result<()> {
        fs::create_dir_all(&self.config.cache_dir)
            .with_context(|| format!("创建缓存目录失败: {:?}", self.config.cache_dir))?;

        let meta_file = self.meta_file_for(file);
        let meta_valid = read_meta(&meta_file).is_ok();

        if file.exists() && meta_valid {
            return Ok(());
        }

        // 数据或元数据缺一不可，统一重建
        fs::File::create(file).with_context(|| format!("创建缓存文件失败: {:?}", file))?;
        write_meta(&meta_file, &CacheFileMeta::new(now_millis(), false))?;

        debug!("已创建缓存文件: {:?}", file);
        Ok(())
    }

    /// 获取或重建分片临时文件
    ///
    /// 同名旧文件会先被删除
    pub fn get_or_create_chunk_cache_file(&self, start: u64, end: u64, url: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.chunks_cache_dir).with_context(|| {
            format!("创建分片目录失败: {:?}", self.config.chunks_cache_dir)
        })?;

        let chunk_file = self.config.chunks_cache_dir.join(format!(
            "{}_{}_{}.{}",
            url_hash(url),
            start,
            end,
            CHUNK_EXTENSION
        ));

        remove_if_exists(&chunk_file)
            .with_context(|| format!("删除旧分片文件失败: {:?}", chunk_file))?;
        fs::File::create(&chunk_file)
            .with_context(|| format!("创建分片文件失败: {:?}", chunk_file))?;

        Ok(chunk_file)
    }

    /// 缓存文件是否已下载完成
    ///
    /// 文件缺失、扩展名不对、元数据缺失或损坏时删除这对文件并返回 false
    pub fn is_already_downloaded(&self, file: &Path) -> bool {
        if !file.exists() {
            self.delete_cache_file(file);
            return false;
        }

        if file.extension().and_then(|e| e.to_str()) != Some(CACHE_EXTENSION) {
            warn!("不是缓存数据文件: {:?}", file);
            self.delete_cache_file(file);
            return false;
        }

        match read_meta(&self.meta_file_for(file)) {
            Ok(meta) => meta.is_downloaded,
            Err(e) => {
                warn!("缓存元数据损坏，删除缓存文件: {:?}, 错误: {:#}", file, e);
                self.delete_cache_file(file);
                false
            }
        }
    }

    /// 标记缓存文件已下载完成（保留原创建时间）
    pub fn mark_file_downloaded(&self, file: &Path) -> bool {
        if !file.exists() {
            error!("标记下载完成失败，文件不存在: {:?}", file);
            self.delete_cache_file(file);
            return false;
        }

        let meta_file = self.meta_file_for(file);
        let result = read_meta(&meta_file)
            .and_then(|meta| write_meta(&meta_file, &CacheFileMeta::new(meta.created_on, true)));

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("标记下载完成失败: {:?}, 错误: {:#}", file, e);
                self.delete_cache_file(file);
                false
            }
        }
    }

    /// 删除 URL 对应的缓存文件
    pub fn delete_cache_file_by_url(&self, url: &str) -> bool {
        self.delete_cache_file(&self.cache_file_for_url(url))
    }

    /// 删除缓存条目（数据 + 元数据）
    ///
    /// 只删掉其中一个也会扣减容量计数（不低于 0），但返回 false
    pub fn delete_cache_file(&self, file: &Path) -> bool {
        let stem = match file.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => {
                warn!("无法解析缓存文件名: {:?}", file);
                return false;
            }
        };

        let data_file = self
            .config
            .cache_dir
            .join(format!("{}.{}", stem, CACHE_EXTENSION));
        let meta_file = self
            .config
            .cache_dir
            .join(format!("{}.{}", stem, CACHE_META_EXTENSION));

        let data_len = fs::metadata(&data_file).map(|m| m.len()).unwrap_or(0);

        let data_deleted = match remove_if_exists(&data_file) {
            Ok(()) => true,
            Err(e) => {
                warn!("删除缓存数据文件失败: {:?}, 错误: {}", data_file, e);
                false
            }
        };
        let meta_deleted = match remove_if_exists(&meta_file) {
            Ok(()) => true,
            Err(e) => {
                warn!("删除缓存元数据失败: {:?}, 错误: {}", meta_file, e);
                false
            }
        };

        if data_len > 0 {
            self.decrement_size(data_len);
        }

        data_deleted && meta_deleted
    }

    fn decrement_size(&self, delta: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                Some(size.saturating_sub(delta))
            });
    }

    /// 清空整个缓存（数据目录 + 分片目录），之后在后台重算容量
    pub fn clear_cache(self: &Arc<Self>) {
        info!("开始清空缓存: {:?}", self.config.cache_dir);

        let files: Vec<PathBuf> = WalkDir::new(&self.config.cache_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        let mut deleted = 0usize;
        for file in files.iter().filter(|f| has_extension(f, CACHE_EXTENSION)) {
            if self.delete_cache_file(file) {
                deleted += 1;
            }
        }

        // 剩下的只可能是孤儿元数据或无关文件
        for file in &files {
            if let Err(e) = remove_if_exists(file) {
                warn!("删除缓存文件失败: {:?}, 错误: {}", file, e);
            }
        }

        self.clear_chunks_cache_dir();
        self.schedule_size_recalculation();

        info!("✓ 缓存已清空，删除 {} 个条目", deleted);
    }

    /// 清空分片目录
    fn clear_chunks_cache_dir(&self) {
        let entries = match fs::read_dir(&self.config.chunks_cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "读取分片目录失败: {:?}, 错误: {}",
                    self.config.chunks_cache_dir, e
                );
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("删除分片文件失败: {:?}, 错误: {}", path, e);
                }
            }
        }
    }

    /// 新文件下载完成后调用
    ///
    /// 容量超出上限且距离上次清理足够久时，在后台线程执行清理
    pub fn file_was_added(self: &Arc<Self>, file_len: u64) {
        let total = self.size.fetch_add(file_len, Ordering::SeqCst) + file_len;
        let budget = self.config.current_budget();

        if total <= budget {
            return;
        }

        let guard = match self.trim_coordinator.try_acquire() {
            Some(guard) => guard,
            None => return,
        };

        info!(
            "缓存容量超出上限，开始后台清理: 当前={}MB, 上限={}MB",
            total / 1024 / 1024,
            budget / 1024 / 1024
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        self.executor.execute(move || {
            let _guard = guard;
            if let Some(handler) = weak.upgrade() {
                handler.trim();
            }
        });
    }

    /// 清理缓存
    ///
    /// 按创建时间从旧到新删除，跳过存活时间不足的条目，
    /// 直到释放 `max(当前大小, 默认容量) / 2` 字节或遍历完毕。最后重算容量
    pub fn trim(&self) -> TrimStats {
        let mut stats = TrimStats::default();

        let files: Vec<PathBuf> = WalkDir::new(&self.config.cache_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        // 只有一两个文件时不值得清理
        if files.len() <= 2 {
            debug!("缓存文件过少，跳过清理: {}", files.len());
            return stats;
        }

        let mut groups: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for file in files {
            let stem = match file.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            groups.entry(stem).or_default().push(file);
        }

        let mut candidates = Vec::with_capacity(groups.len());
        for (stem, group) in groups {
            let data_file = self
                .config
                .cache_dir
                .join(format!("{}.{}", stem, CACHE_EXTENSION));

            let paired = group.len() == 2
                && group.iter().any(|f| has_extension(f, CACHE_EXTENSION))
                && group.iter().any(|f| has_extension(f, CACHE_META_EXTENSION));

            if !paired {
                debug!("删除不成对的缓存文件: {:?}", group);
                for file in &group {
                    let _ = remove_if_exists(file);
                }
                continue;
            }

            match read_meta(&self.meta_file_for(&data_file)) {
                Ok(meta) => {
                    let size = fs::metadata(&data_file).map(|m| m.len()).unwrap_or(0);
                    candidates.push(TrimCandidate {
                        data_file,
                        size,
                        created_on: meta.created_on,
                    });
                }
                Err(e) => {
                    debug!("元数据损坏，删除缓存条目: {:?}, 错误: {:#}", data_file, e);
                    self.delete_cache_file(&data_file);
                }
            }
        }

        candidates.sort_by_key(|c| c.created_on);

        let current_size = self.get_size();
        let size_to_free = current_size.max(self.config.default_cache_size) / 2;
        let min_life_time_ms = self.config.min_cache_file_life_time().as_millis() as i64;
        let now = now_millis();

        for candidate in candidates {
            if stats.bytes_freed >= size_to_free {
                break;
            }

            // 刚开始或刚完成下载的文件不能删
            if now - candidate.created_on < min_life_time_ms {
                continue;
            }

            if self.delete_cache_file(&candidate.data_file) {
                stats.files_deleted += 1;
                stats.bytes_freed += candidate.size;
            }
        }

        self.recalculate_size();

        info!(
            "✓ 缓存清理完成: 删除 {} 个文件, 释放 {}KB, 剩余 {}KB",
            stats.files_deleted,
            stats.bytes_freed / 1024,
            self.get_size() / 1024
        );

        stats
    }

    /// 扫描缓存目录重算容量
    pub fn recalculate_size(&self) -> u64 {
        let total: u64 = WalkDir::new(&self.config.cache_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();

        self.size.store(total, Ordering::SeqCst);
        debug!("缓存容量重算完成: {} bytes", total);
        total
    }

    fn schedule_size_recalculation(self: &Arc<Self>) {
        if self
            .recalculation_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let submitted = self.executor.execute(move || {
            if let Some(handler) = weak.upgrade() {
                handler.recalculate_size();
                handler.recalculation_running.store(false, Ordering::SeqCst);
            }
        });

        if !submitted {
            self.recalculation_running.store(false, Ordering::SeqCst);
        }
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(extension)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_handler(dir: &TempDir, default_cache_size: u64) -> Arc<CacheHandler> {
        let mut config = CacheConfig::with_root(dir.path());
        config.default_cache_size = default_cache_size;
        let handler = CacheHandler::new(config).unwrap();
        // 等待启动时的容量重算结束，避免和测试写入交错
        assert!(handler
            .executor
            .execute_and_wait(|| {}, Duration::from_secs(5)));
        handler
    }

    /// 写入一个已下载完成、指定创建时间的缓存条目
    fn put_entry(handler: &CacheHandler, url: &str, len: usize, created_on: i64) -> PathBuf {
        let file = handler.get_or_create_cache_file(url).unwrap();
        fs::write(&file, vec![7u8; len]).unwrap();
        write_meta(
            &handler.meta_file_for(&file),
            &CacheFileMeta::new(created_on, true),
        )
        .unwrap();
        file
    }

    #[test]
    fn test_get_or_create_cache_file() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 1024);

        let file = handler.get_or_create_cache_file("https://a.com/1.jpg").unwrap();
        assert!(file.exists());
        assert_eq!(file.extension().unwrap(), CACHE_EXTENSION);

        let meta = read_meta(&handler.meta_file_for(&file)).unwrap();
        assert!(!meta.is_downloaded);
        assert!(!handler.is_already_downloaded(&file));

        // 再次获取返回同一个文件，不重建
        fs::write(&file, b"data").unwrap();
        let again = handler.get_or_create_cache_file("https://a.com/1.jpg").unwrap();
        assert_eq!(again, file);
        assert_eq!(fs::read(&again).unwrap(), b"data");
    }

    #[test]
    fn test_mark_file_downloaded_keeps_created_on() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 1024);

        let file = handler.get_or_create_cache_file("https://a.com/2.jpg").unwrap();
        let before = read_meta(&handler.meta_file_for(&file)).unwrap();

        assert!(handler.mark_file_downloaded(&file));
        assert!(handler.is_already_downloaded(&file));

        let after = read_meta(&handler.meta_file_for(&file)).unwrap();
        assert_eq!(after.created_on, before.created_on);
        assert!(after.is_downloaded);
        assert_eq!(
            handler.get_cache_file_or_none("https://a.com/2.jpg"),
            Some(file)
        );
    }

    #[test]
    fn test_corrupted_meta_deletes_entry() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 1024);

        let file = handler.get_or_create_cache_file("https://a.com/3.jpg").unwrap();
        assert!(handler.mark_file_downloaded(&file));

        // 破坏布尔字段: "<millis>,true" -> "<millis>,trXe"
        let meta_file = handler.meta_file_for(&file);
        let mut bytes = fs::read(&meta_file).unwrap();
        let len = bytes.len();
        bytes[len - 2] = b'X';
        fs::write(&meta_file, &bytes).unwrap();

        assert!(!handler.is_already_downloaded(&file));
        assert!(!file.exists());
        assert!(!meta_file.exists());
    }

    #[test]
    fn test_missing_meta_deletes_entry() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 1024);

        let file = handler.get_or_create_cache_file("https://a.com/4.jpg").unwrap();
        fs::remove_file(handler.meta_file_for(&file)).unwrap();

        assert!(!handler.is_already_downloaded(&file));
        assert!(!file.exists());
    }

    #[test]
    fn test_chunk_cache_file_is_recreated() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 1024);

        let chunk = handler
            .get_or_create_chunk_cache_file(0, 100, "https://a.com/5.jpg")
            .unwrap();
        assert!(chunk.starts_with(handler.chunks_cache_dir()));
        assert!(chunk
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("_0_100.chunk"));

        fs::write(&chunk, b"stale").unwrap();
        let again = handler
            .get_or_create_chunk_cache_file(0, 100, "https://a.com/5.jpg")
            .unwrap();
        assert_eq!(again, chunk);
        assert_eq!(fs::metadata(&again).unwrap().len(), 0);
    }

    #[test]
    fn test_chunks_dir_cleared_on_startup() {
        let dir = TempDir::new().unwrap();
        let chunk = {
            let handler = test_handler(&dir, 1024);
            let chunk = handler
                .get_or_create_chunk_cache_file(0, 10, "https://a.com/6.jpg")
                .unwrap();
            fs::write(&chunk, b"0123456789").unwrap();
            chunk
        };
        assert!(chunk.exists());

        let _handler = test_handler(&dir, 1024);
        assert!(!chunk.exists());
    }

    #[test]
    fn test_delete_decrements_size_clamped() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 1024);

        let file = put_entry(&handler, "https://a.com/7.jpg", 100, now_millis());
        handler.recalculate_size();
        assert!(handler.get_size() >= 100);

        // 计数器被人为调低后也不会下溢
        handler.size.store(10, Ordering::SeqCst);
        assert!(handler.delete_cache_file(&file));
        assert_eq!(handler.get_size(), 0);

        // 删除不存在的条目是幂等的
        assert!(handler.delete_cache_file(&file));
    }

    #[test]
    fn test_trim_removes_oldest_first() {
        let dir = TempDir::new().unwrap();
        // 上限 1000，需释放 max(当前, 1000) / 2
        let handler = test_handler(&dir, 1000);
        let old = now_millis() - Duration::from_secs(3600).as_millis() as i64;

        let files: Vec<PathBuf> = (0..6)
            .map(|i| put_entry(&handler, &format!("https://a.com/old{}.jpg", i), 200, old + i))
            .collect();
        handler.recalculate_size();
        let size_before = handler.get_size();
        assert!(size_before > 1000);

        let stats = handler.trim();
        let size_to_free = size_before.max(1000) / 2;
        assert!(stats.bytes_freed >= size_to_free);

        // 最旧的先删，且删掉的恰好是前缀
        let deleted = files.iter().take_while(|f| !f.exists()).count();
        assert_eq!(deleted, stats.files_deleted);
        assert!(files[deleted..].iter().all(|f| f.exists()));
        assert!(handler.get_size() < size_before);
    }

    #[test]
    fn test_trim_skips_young_entries() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 100);
        let old = now_millis() - Duration::from_secs(3600).as_millis() as i64;

        let old_file = put_entry(&handler, "https://a.com/old.jpg", 300, old);
        let young: Vec<PathBuf> = (0..4)
            .map(|i| put_entry(&handler, &format!("https://a.com/new{}.jpg", i), 300, now_millis()))
            .collect();
        handler.recalculate_size();

        let stats = handler.trim();

        assert_eq!(stats.files_deleted, 1);
        assert!(!old_file.exists());
        assert!(young.iter().all(|f| f.exists()));
    }

    #[test]
    fn test_trim_removes_stale_files() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 1024 * 1024);

        put_entry(&handler, "https://a.com/ok1.jpg", 10, now_millis());
        put_entry(&handler, "https://a.com/ok2.jpg", 10, now_millis());

        // 没有元数据的孤儿数据文件
        let orphan = handler.cache_dir().join("orphan.cache");
        fs::write(&orphan, b"orphan").unwrap();

        // 元数据损坏的条目
        let broken = handler.get_or_create_cache_file("https://a.com/broken.jpg").unwrap();
        fs::write(handler.meta_file_for(&broken), b"garbage").unwrap();

        handler.trim();

        assert!(!orphan.exists());
        assert!(!broken.exists());
        assert!(handler.cache_file_for_url("https://a.com/ok1.jpg").exists());
        assert!(handler.cache_file_for_url("https://a.com/ok2.jpg").exists());
    }

    #[test]
    fn test_clear_cache() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 1024);

        let a = put_entry(&handler, "https://a.com/c1.jpg", 10, now_millis());
        let b = put_entry(&handler, "https://a.com/c2.jpg", 10, now_millis());
        let chunk = handler
            .get_or_create_chunk_cache_file(0, 5, "https://a.com/c3.jpg")
            .unwrap();

        handler.clear_cache();

        assert!(!a.exists());
        assert!(!b.exists());
        assert!(!chunk.exists());
        assert_eq!(fs::read_dir(handler.cache_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_was_added_triggers_background_trim() {
        let dir = TempDir::new().unwrap();
        let handler = test_handler(&dir, 500);
        let old = now_millis() - Duration::from_secs(3600).as_millis() as i64;

        let files: Vec<PathBuf> = (0..4)
            .map(|i| put_entry(&handler, &format!("https://a.com/t{}.jpg", i), 200, old + i))
            .collect();

        handler.file_was_added(800);

        // 等待后台清理完成
        let mut waited = 0;
        while files[0].exists() && waited < 50 {
            std::thread::sleep(Duration::from_millis(20));
            waited += 1;
        }
        assert!(!files[0].exists());
        assert!(files[3].exists());
    }
}
