use anyhow::Context;
use clap::Parser;
use chunked_file_cache::{
    config::LogConfig, logging, AppConfig, DownloadOptions, FileCacheError, FileCacheListener,
    FileCacheV2,
};
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

const CONFIG_PATH: &str = "config/app.toml";

/// 单个 URL 的下载汇总（每行一条 JSON）
#[derive(Debug, Serialize)]
struct DownloadSummary {
    url: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    cached: bool,
    elapsed_ms: u128,
}

enum CliEvent {
    Terminal {
        url: String,
        status: &'static str,
        file: Option<String>,
        error: Option<String>,
        cached: bool,
    },
    End(String),
}

/// 把回调转成 channel 消息
struct ChannelListener {
    url: String,
    tx: mpsc::UnboundedSender<CliEvent>,
}

impl ChannelListener {
    fn terminal(&self, status: &'static str, file: Option<&Path>, error: Option<String>, cached: bool) {
        let _ = self.tx.send(CliEvent::Terminal {
            url: self.url.clone(),
            status,
            file: file.map(|f| f.display().to_string()),
            error,
            cached,
        });
    }
}

impl FileCacheListener for ChannelListener {
    fn on_start(&self, chunks_count: usize) {
        info!("开始下载: url={}, 分片数={}", self.url, chunks_count);
    }

    fn on_success(&self, file: &Path, immediate: bool) {
        self.terminal("success", Some(file), None, immediate);
    }

    fn on_not_found(&self) {
        self.terminal("not_found", None, None, false);
    }

    fn on_fail(&self, error: &FileCacheError) {
        self.terminal("failed", None, Some(error.to_string()), false);
    }

    fn on_cancel(&self) {
        self.terminal("canceled", None, None, false);
    }

    fn on_stop(&self, file: &Path) {
        self.terminal("stopped", Some(file), None, false);
    }

    fn on_end(&self) {
        let _ = self.tx.send(CliEvent::End(self.url.clone()));
    }
}

/// 下载 URL 到本地缓存，每个 URL 输出一行 JSON 汇总
#[derive(Parser, Debug)]
#[command(name = "chunked-file-cache", version)]
struct Cli {
    /// 分片数提示（默认取配置文件）
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    chunks: Option<u64>,
    /// 要下载的 URL
    #[arg(required = true)]
    urls: Vec<String>,
}

impl Cli {
    /// 去重后的 URL，保持输入顺序
    fn unique_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

/// 先尝试加载日志配置，失败时使用默认配置
async fn load_log_config() -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let urls = cli.unique_urls();
    let chunk_count = cli.chunks.map(|n| n as usize);

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&load_log_config().await);

    info!("Chunked File Cache v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let client = Client::builder()
        .user_agent(config.download.user_agent.clone())
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .context("创建 HTTP 客户端失败")?;

    let cache = FileCacheV2::new(&config, client)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();

    for url in &urls {
        cache.enqueue_download_file_request(
            url,
            DownloadOptions {
                chunk_count,
                ..Default::default()
            },
            ChannelListener {
                url: url.clone(),
                tx: tx.clone(),
            },
        );
    }
    drop(tx);

    let mut pending = urls.len();
    while pending > 0 {
        match rx.recv().await {
            Some(CliEvent::Terminal {
                url,
                status,
                file,
                error,
                cached,
            }) => {
                let summary = DownloadSummary {
                    url,
                    status,
                    file,
                    error,
                    cached,
                    elapsed_ms: started.elapsed().as_millis(),
                };
                println!("{}", serde_json::to_string(&summary)?);
            }
            Some(CliEvent::End(url)) => {
                info!("请求结束: {}", url);
                pending -= 1;
            }
            None => break,
        }
    }

    info!(
        "✓ 全部完成: {} 个 URL, 缓存大小={} 字节",
        urls.len(),
        cache.cache_size()
    );

    Ok(())
}
