//! Redis 代理
//!
//! - 队列：RPUSH / BLPOP（出队原子，多个 worker 不会取到同一条）
//! - 键值：SET EX / GET / SCAN
//! - 发布订阅：PUBLISH / SUBSCRIBE（每个订阅独占一条连接，drop 即断开）
//!
//! 非阻塞命令共用一条多路复用连接（断线后自动重连），BLPOP 每次单独建连

use super::{Broker, BrokerResult, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// SCAN 每批建议返回数量
const SCAN_BATCH: usize = 200;

/// Redis 代理
pub struct RedisBroker {
    client: Client,
    /// 共享连接，clone 只复制句柄
    conn: ConnectionManager,
}

impl RedisBroker {
    /// 解析连接地址并建立共享连接
    pub async fn connect(redis_url: &str) -> BrokerResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// 启动时探测连通性
    pub async fn ping(&self) -> BrokerResult<()> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, queue: &str, payload: &str) -> BrokerResult<()> {
        let mut conn = self.connection();
        let _: i64 = redis::cmd("RPUSH")
            .arg(queue)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> BrokerResult<Option<String>> {
        // BLPOP 会占住连接直到超时，不能放在共享连接上
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let secs = timeout.as_secs().max(1);
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(queue)
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, payload)| payload))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BrokerResult<()> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn scan_keys(&self, prefix: &str, limit: usize) -> BrokerResult<Vec<String>> {
        let mut conn = self.connection();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            for key in batch {
                if keys.len() >= limit {
                    break;
                }
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }

            if next == 0 || keys.len() >= limit {
                break;
            }
            cursor = next;
        }

        debug!("SCAN {} 得到 {} 个键 (上限 {})", pattern, keys.len(), limit);
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
        let mut conn = self.connection();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| match msg.get_payload::<String>() {
                Ok(text) => text,
                Err(e) => {
                    warn!("频道消息不是有效文本，按有损方式解码: {}", e);
                    String::from_utf8_lossy(msg.get_payload_bytes()).into_owned()
                }
            })
            .boxed();

        Ok(Subscription::new(channel.to_string(), stream))
    }
}
