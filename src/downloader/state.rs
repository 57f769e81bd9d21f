use serde::{Deserialize, Serialize};

/// 下载生命周期状态
///
/// 初始为 `Running`，只能单向切换到 `Stopped` 或 `Canceled`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// 下载中
    #[default]
    Running,
    /// 已停止（保留已下载的输出文件）
    Stopped,
    /// 已取消（删除输出文件）
    Canceled,
}

impl DownloadState {
    pub fn is_running(&self) -> bool {
        matches!(self, DownloadState::Running)
    }
}
