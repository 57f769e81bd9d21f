//! 缓存清理协调器
//!
//! 保证同一时刻最多只有一次清理在执行，并限制两次清理之间的最小间隔

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 缓存清理协调器
///
/// `try_acquire` 成功后返回拥有所有权的守卫，守卫可以被移动到后台线程，
/// drop 时释放"正在清理"标记
#[derive(Debug)]
pub struct TrimCoordinator {
    /// 是否正在清理
    is_trimming: AtomicBool,
    /// 上次清理时间戳（毫秒）
    last_trim_ms: AtomicU64,
    /// 两次清理的最小间隔
    min_interval: Duration,
}

impl TrimCoordinator {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            is_trimming: AtomicBool::new(false),
            last_trim_ms: AtomicU64::new(0),
            min_interval,
        }
    }

    fn current_time_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    /// 尝试获取清理许可
    ///
    /// # 返回
    /// - `Some(TrimGuard)`: 可以执行清理
    /// - `None`: 正在清理或距上次清理间隔太短
    pub fn try_acquire(self: &Arc<Self>) -> Option<TrimGuard> {
        let now_ms = Self::current_time_ms();
        let interval_ms = self.min_interval.as_millis() as u64;

        // 先检查间隔，避免无意义地争抢标记
        let last_ms = self.last_trim_ms.load(Ordering::SeqCst);
        if last_ms != 0 && now_ms.saturating_sub(last_ms) < interval_ms {
            return None;
        }

        if self
            .is_trimming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        // 拿到标记后再确认一次，期间可能有别的清理刚结束
        if self
            .last_trim_ms
            .compare_exchange(last_ms, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.is_trimming.store(false, Ordering::SeqCst);
            return None;
        }

        Some(TrimGuard {
            coordinator: Arc::clone(self),
        })
    }

    pub fn is_trimming(&self) -> bool {
        self.is_trimming.load(Ordering::SeqCst)
    }
}

/// 清理守卫（RAII）
pub struct TrimGuard {
    coordinator: Arc<TrimCoordinator>,
}

impl Drop for TrimGuard {
    fn drop(&mut self) {
        self.coordinator.is_trimming.store(false, Ordering::SeqCst);
    }
}
