// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存文件目录（`<hash>.cache` + `<hash>.cache_meta`）
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// 分片临时文件目录，启动时清空
    #[serde(default = "default_chunks_cache_dir")]
    pub chunks_cache_dir: PathBuf,
    /// 普通模式下的缓存容量（字节，默认 512MB）
    #[serde(default = "default_cache_size")]
    pub default_cache_size: u64,
    /// 预加载模式下的缓存容量（字节，默认 1GB）
    #[serde(default = "default_prefetch_cache_size")]
    pub prefetch_cache_size: u64,
    /// 是否启用预加载模式（使用更大的容量）
    #[serde(default)]
    pub prefetch_enabled: bool,
    /// 缓存文件最短存活时间（秒），清理时跳过更年轻的文件
    #[serde(default = "default_min_cache_file_life_time_secs")]
    pub min_cache_file_life_time_secs: u64,
    /// 两次清理的最小间隔（秒）
    #[serde(default = "default_min_trim_interval_secs")]
    pub min_trim_interval_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache/files")
}

fn default_chunks_cache_dir() -> PathBuf {
    PathBuf::from("cache/chunks")
}

fn default_cache_size() -> u64 {
    512 * 1024 * 1024 // 512MB
}

fn default_prefetch_cache_size() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

fn default_min_cache_file_life_time_secs() -> u64 {
    5 * 60
}

fn default_min_trim_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            chunks_cache_dir: default_chunks_cache_dir(),
            default_cache_size: default_cache_size(),
            prefetch_cache_size: default_prefetch_cache_size(),
            prefetch_enabled: false,
            min_cache_file_life_time_secs: default_min_cache_file_life_time_secs(),
            min_trim_interval_secs: default_min_trim_interval_secs(),
        }
    }
}

impl CacheConfig {
    /// 在指定根目录下创建缓存配置
    pub fn with_root(root: &Path) -> Self {
        Self {
            cache_dir: root.join("files"),
            chunks_cache_dir: root.join("chunks"),
            ..Self::default()
        }
    }

    /// 当前生效的缓存容量
    pub fn current_budget(&self) -> u64 {
        if self.prefetch_enabled {
            self.prefetch_cache_size
        } else {
            self.default_cache_size
        }
    }

    pub fn min_cache_file_life_time(&self) -> Duration {
        Duration::from_secs(self.min_cache_file_life_time_secs)
    }

    pub fn min_trim_interval(&self) -> Duration {
        Duration::from_secs(self.min_trim_interval_secs)
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认分片数（请求未指定时使用）
    #[serde(default = "default_chunk_count")]
    pub chunk_count: usize,
    /// 单个文件最大分片数
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    /// 最小分片大小（字节），更小的文件不分片
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 单个分片的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试间隔（毫秒）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// HEAD 探测超时（毫秒）
    #[serde(default = "default_head_request_timeout_ms")]
    pub head_request_timeout_ms: u64,
    /// 单个 GET 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// HEAD 探测结果缓存条目数
    #[serde(default = "default_partial_content_cache_capacity")]
    pub partial_content_cache_capacity: u64,
    /// 工作线程数，未设置时为 max(4, CPU 核数 / 2)
    #[serde(default)]
    pub worker_count: Option<usize>,
    /// 等待释放函数执行完毕的最长时间（秒）
    #[serde(default = "default_dispose_timeout_secs")]
    pub dispose_timeout_secs: u64,
    /// User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_chunk_count() -> usize {
    2
}

fn default_max_chunks() -> usize {
    4
}

fn default_min_chunk_size() -> u64 {
    64 * 1024 // 64KB
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_head_request_timeout_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_partial_content_cache_capacity() -> u64 {
    1024
}

fn default_dispose_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("chunked-file-cache/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_count: default_chunk_count(),
            max_chunks: default_max_chunks(),
            min_chunk_size: default_min_chunk_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            head_request_timeout_ms: default_head_request_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            partial_content_cache_capacity: default_partial_content_cache_capacity(),
            worker_count: None,
            dispose_timeout_secs: default_dispose_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl DownloadConfig {
    /// 实际工作线程数
    pub fn effective_worker_count(&self) -> usize {
        if let Some(count) = self.worker_count {
            return count.max(1);
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus / 2).max(4)
    }

    pub fn head_request_timeout(&self) -> Duration {
        Duration::from_millis(self.head_request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_secs(self.dispose_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("读取配置文件失败")?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;

        if config.download.max_chunks == 0 {
            anyhow::bail!("配置错误：max_chunks 必须大于 0");
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
            }
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .context("写入配置文件失败")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.cache.default_cache_size, 512 * 1024 * 1024);
        assert_eq!(config.cache.prefetch_cache_size, 1024 * 1024 * 1024);
        assert_eq!(config.cache.min_cache_file_life_time_secs, 300);
        assert_eq!(config.cache.min_trim_interval_secs, 60);
        assert_eq!(config.download.max_chunks, 4);
        assert_eq!(config.download.max_retries, 5);
        assert_eq!(config.download.head_request_timeout_ms, 1000);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_current_budget() {
        let mut config = CacheConfig::default();
        assert_eq!(config.current_budget(), 512 * 1024 * 1024);

        config.prefetch_enabled = true;
        assert_eq!(config.current_budget(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_worker_count() {
        let mut config = DownloadConfig::default();
        assert!(config.effective_worker_count() >= 4);

        config.worker_count = Some(2);
        assert_eq!(config.effective_worker_count(), 2);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.chunk_count = 3;
        config.cache.prefetch_enabled = true;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.download.chunk_count, 3);
        assert!(loaded.cache.prefetch_enabled);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        tokio::fs::write(&path, "[download]\nmax_retries = 1\n")
            .await
            .unwrap();

        let loaded = AppConfig::load_from_file(path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.download.max_retries, 1);
        assert_eq!(loaded.download.max_chunks, 4);
        assert_eq!(loaded.cache.cache_dir, PathBuf::from("cache/files"));
    }

    #[tokio::test]
    async fn test_load_or_default_on_missing_file() {
        let config = AppConfig::load_or_default("/nonexistent/dir/app.toml").await;
        assert_eq!(config.download.max_chunks, 4);
    }
}
