//! 单线程后台执行器
//!
//! 缓存清理/容量重算、下载释放函数都在独立的 OS 线程上串行执行，
//! 不占用 tokio 工作线程，也不和下载 I/O 争抢

use anyhow::{Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 单线程后台执行器
///
/// 任务按提交顺序执行；执行器被 drop 后工作线程在处理完剩余任务后退出
#[derive(Debug)]
pub struct BackgroundExecutor {
    name: String,
    sender: mpsc::Sender<Job>,
}

impl BackgroundExecutor {
    /// 创建执行器并启动工作线程
    pub fn new(name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread_name = name.to_string();

        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for job in receiver {
                    // 单个任务 panic 不能带走整个执行器
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("后台任务 panic: executor={}", thread_name);
                    }
                }
                debug!("后台执行器退出: {}", thread_name);
            })
            .with_context(|| format!("创建后台线程失败: {}", name))?;

        Ok(Self {
            name: name.to_string(),
            sender,
        })
    }

    /// 提交任务，不等待结果
    ///
    /// # 返回
    /// 工作线程已退出时返回 false
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("后台执行器已关闭，任务被丢弃: {}", self.name);
            return false;
        }

        true
    }

    /// 提交任务并最多等待 `timeout`
    ///
    /// # 返回
    /// 任务在超时前执行完毕返回 true
    pub fn execute_and_wait<F>(&self, job: F, timeout: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let submitted = self.execute(move || {
            job();
            let _ = done_tx.send(());
        });
        if !submitted {
            return false;
        }

        match done_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "⚠️ 等待后台任务超时: executor={}, timeout={:?}",
                    self.name, timeout
                );
                false
            }
        }
    }
}
