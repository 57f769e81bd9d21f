//! 测试辅助：支持 Range 的 mock 服务器和下载环境

use crate::cache::CacheHandler;
use crate::common::{BackgroundExecutor, ExpectedHash};
use crate::config::CacheConfig;
use crate::downloader::active::{ActiveDownloadRequest, ActiveDownloads};
use crate::downloader::cancelable::CancelableDownload;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// 按 Range 头返回 206 的响应器
pub struct RangeResponder {
    content: Vec<u8>,
    range_requests: Arc<AtomicUsize>,
}

impl RangeResponder {
    pub fn new(content: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
        let range_requests = Arc::new(AtomicUsize::new(0));
        (
            Self {
                content,
                range_requests: Arc::clone(&range_requests),
            },
            range_requests,
        )
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(s, e)| Some((s.parse::<usize>().ok()?, e.parse::<usize>().ok()?)));

        match range {
            Some((start, end)) if start <= end && end < self.content.len() => {
                self.range_requests.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(206)
                    .append_header(
                        "Content-Range",
                        format!("bytes {}-{}/{}", start, end, self.content.len()).as_str(),
                    )
                    .set_body_bytes(self.content[start..=end].to_vec())
            }
            _ => ResponseTemplate::new(200).set_body_bytes(self.content.clone()),
        }
    }
}

/// 挂载 HEAD（声明支持 Range）+ GET（按 Range 返回）
pub async fn mount_range_file(server: &MockServer, file_path: &str, content: &[u8]) -> Arc<AtomicUsize> {
    Mock::given(method("HEAD"))
        .and(path(file_path))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("Accept-Ranges", "bytes")
                .append_header("Content-Length", content.len().to_string().as_str()),
        )
        .mount(server)
        .await;

    let (responder, range_requests) = RangeResponder::new(content.to_vec());
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(responder)
        .mount(server)
        .await;

    range_requests
}

/// 下载环境：缓存目录 + 注册表
pub struct TestEnv {
    pub dir: TempDir,
    pub cache_handler: Arc<CacheHandler>,
    pub active_downloads: Arc<ActiveDownloads>,
    pub executor: Arc<BackgroundExecutor>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cache_handler = CacheHandler::new(CacheConfig::with_root(dir.path())).unwrap();
        Self {
            dir,
            cache_handler,
            active_downloads: Arc::new(ActiveDownloads::new()),
            executor: Arc::new(BackgroundExecutor::new("test-dispose").unwrap()),
        }
    }

    /// 创建缓存文件并注册下载请求
    pub fn register(
        &self,
        url: &str,
        chunks_count: usize,
        expected_hash: Option<ExpectedHash>,
    ) -> Arc<CancelableDownload> {
        let output = self.cache_handler.get_or_create_cache_file(url).unwrap();
        let cancelable = Arc::new(CancelableDownload::new(
            url,
            false,
            Arc::clone(&self.executor),
            Duration::from_secs(10),
        ));
        self.active_downloads.put(
            url,
            ActiveDownloadRequest::new(
                url,
                output,
                chunks_count,
                Arc::clone(&cancelable),
                expected_hash,
            ),
        );
        cancelable
    }
}

/// 生成可区分偏移的测试数据
pub fn test_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 原始 TCP 服务器：第 n 个连接读完请求头后写入 `responses[n]`（超出时用最后一个）并关闭
///
/// 用于模拟连接中途断开等 mock 服务器做不到的情况。返回 (base url, 连接数)
pub async fn serve_raw_responses(responses: Vec<Vec<u8>>) -> (String, Arc<AtomicUsize>) {
    assert!(!responses.is_empty());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let responses = Arc::new(responses);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let response = responses[index.min(responses.len() - 1)].clone();

            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), connections)
}

/// `Transfer-Encoding: chunked` 的 200 响应；`complete` 为 false 时缺少结束块
pub fn chunked_response(content: &[u8], frame_size: usize, complete: bool) -> Vec<u8> {
    let mut response =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
    for frame in content.chunks(frame_size) {
        response.extend_from_slice(format!("{:x}\r\n", frame.len()).as_bytes());
        response.extend_from_slice(frame);
        response.extend_from_slice(b"\r\n");
    }
    if complete {
        response.extend_from_slice(b"0\r\n\r\n");
    }
    response
}
