use crate::common::BackgroundExecutor;
use crate::downloader::state::DownloadState;
use crate::file_cache::FileCacheListener;
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 释放函数：中止一次正在进行的网络调用
pub type DisposeFunc = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    state: DownloadState,
    dispose_funcs: Vec<DisposeFunc>,
}

/// 单个 URL 的取消句柄
///
/// 持有下载状态、按类型去重的回调表，以及中止网络调用的释放函数列表
pub struct CancelableDownload {
    url: String,
    inner: Mutex<Inner>,
    /// 是否属于批量（预加载）下载
    is_part_of_batch_download: AtomicBool,
    callbacks: Mutex<Vec<(TypeId, Arc<dyn FileCacheListener>)>>,
    dispose_executor: Arc<BackgroundExecutor>,
    dispose_timeout: Duration,
}

impl fmt::Debug for CancelableDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelableDownload")
            .field("url", &self.url)
            .field("state", &self.get_state())
            .field("batch", &self.is_part_of_batch_download())
            .finish()
    }
}

impl CancelableDownload {
    pub fn new(
        url: &str,
        is_part_of_batch_download: bool,
        dispose_executor: Arc<BackgroundExecutor>,
        dispose_timeout: Duration,
    ) -> Self {
        Self {
            url: url.to_string(),
            inner: Mutex::new(Inner {
                state: DownloadState::Running,
                dispose_funcs: Vec::new(),
            }),
            is_part_of_batch_download: AtomicBool::new(is_part_of_batch_download),
            callbacks: Mutex::new(Vec::new()),
            dispose_executor,
            dispose_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn get_state(&self) -> DownloadState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    pub fn is_part_of_batch_download(&self) -> bool {
        self.is_part_of_batch_download.load(Ordering::SeqCst)
    }

    /// 添加回调，同一类型的回调只保留最新的一个
    pub fn add_callback<L>(&self, listener: L)
    where
        L: FileCacheListener + 'static,
    {
        self.add_callback_arc(TypeId::of::<L>(), Arc::new(listener));
    }

    pub(crate) fn add_callback_arc(&self, key: TypeId, listener: Arc<dyn FileCacheListener>) {
        let mut callbacks = self.callbacks.lock();
        match callbacks.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = listener,
            None => callbacks.push((key, listener)),
        }
    }

    pub fn callbacks_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// 对每个回调执行 `f`（在锁外执行，回调里可以安全地回调本对象）
    pub fn for_each_callback<F>(&self, f: F)
    where
        F: Fn(&dyn FileCacheListener),
    {
        let snapshot: Vec<Arc<dyn FileCacheListener>> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in snapshot {
            f(listener.as_ref());
        }
    }

    /// 取出并清空全部回调
    pub fn take_callbacks(&self) -> Vec<Arc<dyn FileCacheListener>> {
        self.callbacks
            .lock()
            .drain(..)
            .map(|(_, l)| l)
            .collect()
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.lock().clear();
    }

    /// 注册释放函数
    ///
    /// 已经不是 Running 时立即执行 `func`（取消即将开始的调用）。
    /// 返回注册时的状态
    pub fn add_dispose_func(&self, func: DisposeFunc) -> DownloadState {
        let state = {
            let mut inner = self.inner.lock();
            if inner.state.is_running() {
                inner.dispose_funcs.push(func);
                return DownloadState::Running;
            }
            inner.state
        };

        func();
        state
    }

    /// 取消下载（删除输出文件）；批量下载成员会忽略
    pub fn cancel(&self) {
        let _ = self.transition(DownloadState::Canceled, false);
    }

    /// 停止下载（保留输出文件）；批量下载成员会忽略
    pub fn stop(&self) {
        let _ = self.transition(DownloadState::Stopped, false);
    }

    /// 取消下载，批量下载成员也生效
    pub fn cancel_prefetch(&self) {
        let _ = self.transition(DownloadState::Canceled, true);
    }

    /// 停止下载，批量下载成员也生效
    pub fn stop_prefetch(&self) {
        let _ = self.transition(DownloadState::Stopped, true);
    }

    /// 原子地把 Running 切换为 Canceled（批量成员也生效）
    ///
    /// # 返回
    /// * 切换前的状态；已经是 Stopped/Canceled 时保持不变
    pub fn cancel_if_running(&self) -> DownloadState {
        self.transition(DownloadState::Canceled, true)
    }

    /// 状态读取与切换在同一把锁内完成，返回切换前的状态
    fn transition(&self, to: DownloadState, can_cancel_batch: bool) -> DownloadState {
        if self.is_part_of_batch_download() && !can_cancel_batch {
            debug!("批量下载成员忽略普通取消: url={}", self.url);
            return self.get_state();
        }

        let funcs = {
            let mut inner = self.inner.lock();
            if !inner.state.is_running() {
                return inner.state;
            }
            inner.state = to;
            std::mem::take(&mut inner.dispose_funcs)
        };

        debug!("下载状态切换: url={}, -> {:?}", self.url, to);
        self.dispose(funcs);
        DownloadState::Running
    }

    /// 在专用线程上执行释放函数，最多等待 `dispose_timeout`
    fn dispose(&self, funcs: Vec<DisposeFunc>) {
        if funcs.is_empty() {
            return;
        }

        let count = funcs.len();
        let finished = self.dispose_executor.execute_and_wait(
            move || {
                for func in funcs {
                    func();
                }
            },
            self.dispose_timeout,
        );

        if !finished {
            warn!(
                "⚠️ 释放函数未在限定时间内执行完毕: url={}, count={}",
                self.url, count
            );
        }
    }
}
