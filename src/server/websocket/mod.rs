// WebSocket 模块
//
// 每个连接转发一个任务频道的实时日志

pub mod handler;

pub use handler::{job_log_stream, pump, RelayEnd};
