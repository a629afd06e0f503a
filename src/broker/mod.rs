//! 消息代理抽象
//!
//! 任务系统依赖的三类原语：
//! - 持久化队列：待执行任务（FIFO，出队原子，同一条消息只会被一个 worker 取到）
//! - 键值存储：任务元数据与结果（支持 TTL）
//! - 发布订阅：按任务划分的实时日志频道（至多一次投递，不回放）
//!
//! 代理句柄以 `Arc<dyn Broker>` 的形式显式注入到各组件，没有全局单例

mod memory;
mod redis_broker;
#[cfg(test)]
pub(crate) mod testing;

pub use self::memory::MemoryBroker;
pub use self::redis_broker::RedisBroker;

use crate::config::{BrokerBackend, BrokerConfig};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 任务元数据键前缀
pub const JOB_KEY_PREFIX: &str = "job:meta:";

/// 任务元数据键
pub fn job_key(job_id: &str) -> String {
    format!("{}{}", JOB_KEY_PREFIX, job_id)
}

/// 任务日志频道名（由任务 ID 确定）
pub fn job_channel(job_id: &str) -> String {
    format!("job:{}:channel", job_id)
}

/// 代理错误
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("代理不可用: {0}")]
    Unavailable(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// 代理层的任务状态词汇
///
/// 与常见任务队列（RQ 等）的状态集合一致，只在代理记录中出现；
/// 对外暴露的状态由 `JobStatus::from_broker_state` 映射得到
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerJobState {
    Queued,
    Deferred,
    Scheduled,
    Started,
    Finished,
    Failed,
    Stopped,
    Canceled,
}

/// 频道订阅
///
/// drop 即退订
pub struct Subscription {
    channel: String,
    stream: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new(channel: String, stream: BoxStream<'static, String>) -> Self {
        Self { channel, stream }
    }

    /// 频道名
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 等待下一条消息，频道关闭时返回 None
    pub async fn next(&mut self) -> Option<String> {
        self.stream.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// 代理能力
#[async_trait]
pub trait Broker: Send + Sync {
    /// 入队（追加到队尾）
    async fn enqueue(&self, queue: &str, payload: &str) -> BrokerResult<()>;

    /// 阻塞出队，超时返回 None
    async fn dequeue(&self, queue: &str, timeout: Duration) -> BrokerResult<Option<String>>;

    /// 写入键值，`ttl` 为 None 时不过期
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BrokerResult<()>;

    /// 读取键值
    async fn get(&self, key: &str) -> BrokerResult<Option<String>>;

    /// 按前缀扫描键，最多返回 `limit` 个（不保证完整）
    async fn scan_keys(&self, prefix: &str, limit: usize) -> BrokerResult<Vec<String>>;

    /// 发布消息，只有当前在线的订阅者能收到
    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()>;

    /// 订阅频道；返回时订阅已生效
    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription>;
}

/// 共享代理句柄
pub type SharedBroker = Arc<dyn Broker>;

/// 按配置建立代理连接
///
/// Redis 后端在返回前先 PING 一次，连不上直接报错；内存后端只在单进程内有效
pub async fn connect(config: &BrokerConfig) -> BrokerResult<SharedBroker> {
    match config.backend {
        BrokerBackend::Redis => {
            let broker = RedisBroker::connect(&config.redis_url).await?;
            broker.ping().await?;
            info!("已连接 Redis 代理");
            Ok(Arc::new(broker))
        }
        BrokerBackend::Memory => {
            warn!("使用内存代理，任务队列只在当前进程内有效");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = BrokerConfig {
            backend: BrokerBackend::Memory,
            ..BrokerConfig::default()
        };
        let broker = connect(&config).await.unwrap();
        broker.set("k", "v", None).await.unwrap();
        assert_eq!(broker.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_redis_url() {
        let config = BrokerConfig {
            backend: BrokerBackend::Redis,
            redis_url: "not-a-redis-url".to_string(),
            ..BrokerConfig::default()
        };
        assert!(matches!(connect(&config).await, Err(BrokerError::Redis(_))));
    }

    #[test]
    fn test_key_and_channel_names() {
        assert_eq!(job_key("abc"), "job:meta:abc");
        assert_eq!(job_channel("abc"), "job:abc:channel");
        assert!(job_key("abc").starts_with(JOB_KEY_PREFIX));
    }

    #[test]
    fn test_broker_state_serde() {
        let json = serde_json::to_string(&BrokerJobState::Started).unwrap();
        assert_eq!(json, "\"started\"");
        let state: BrokerJobState = serde_json::from_str("\"canceled\"").unwrap();
        assert_eq!(state, BrokerJobState::Canceled);
    }
}
