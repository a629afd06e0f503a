// hf-fetchd
// Hugging Face 模型下载任务服务核心库

// 接口鉴权
pub mod auth;

// 消息代理（队列 / 键值 / 发布订阅）
pub mod broker;

// 配置管理模块
pub mod config;

// 任务分发
pub mod dispatch;

// 任务频道事件
pub mod events;

// 下载执行器
pub mod executor;

// 任务模型与存储
pub mod jobs;

// 日志系统
pub mod logging;

// Web服务器模块
pub mod server;

// 下载 worker
pub mod worker;

// 导出常用类型
pub use auth::{Identity, TokenVerifier};
pub use broker::{Broker, MemoryBroker, RedisBroker, SharedBroker};
pub use config::AppConfig;
pub use dispatch::{DispatchError, DispatchService};
pub use events::JobEvent;
pub use executor::DownloadExecutor;
pub use jobs::{DownloadSpec, DownloadType, JobRecord, JobResult, JobStatus, JobStore};
pub use server::AppState;
pub use worker::{QueueMessage, Worker, WorkerPool};
