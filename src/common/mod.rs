//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod executor;
mod hash;
mod trim_coordinator;

pub use executor::BackgroundExecutor;
pub use hash::{compute_file_hash, url_hash, ExpectedHash};
pub use trim_coordinator::{TrimCoordinator, TrimGuard};
