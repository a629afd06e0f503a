//! 任务模块
//!
//! - `types.rs`: 下载请求、任务状态、任务记录
//! - `store.rs`: 基于代理键值存储的任务存储

mod store;
mod types;

pub use store::JobStore;
pub use types::*;
