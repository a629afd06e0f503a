//! 进程内代理
//!
//! 单进程部署（API 与 worker 同进程）和测试使用，语义与 Redis 后端一致：
//! 队列 FIFO、键值带 TTL、发布订阅不回放

use super::{Broker, BrokerError, BrokerResult, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::warn;

/// 单个频道的缓冲容量，慢订阅者超过此值会丢消息
const CHANNEL_CAPACITY: usize = 1024;

struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// 进程内代理
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    queue_notify: Notify,
    kv: DashMap<String, KvEntry>,
    channels: DashMap<String, broadcast::Sender<String>>,
    /// 模拟代理不可达
    offline: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            queue_notify: Notify::new(),
            kv: DashMap::new(),
            channels: DashMap::new(),
            offline: AtomicBool::new(false),
        }
    }

    /// 切换可用状态，离线时所有操作返回 `BrokerError::Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 队列当前长度
    pub fn queue_len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map(|q| q.len()).unwrap_or(0)
    }

    fn ensure_online(&self) -> BrokerResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BrokerError::Unavailable("memory broker offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn pop(&self, queue: &str) -> Option<String> {
        self.queues.lock().get_mut(queue).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, queue: &str, payload: &str) -> BrokerResult<()> {
        self.ensure_online()?;
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        self.queue_notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> BrokerResult<Option<String>> {
        self.ensure_online()?;
        let deadline = Instant::now() + timeout;

        loop {
            // 先注册再检查，避免错过检查与等待之间的通知
            let notified = self.queue_notify.notified();
            if let Some(item) = self.pop(queue) {
                return Ok(Some(item));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(self.pop(queue));
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BrokerResult<()> {
        self.ensure_online()?;
        self.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
        self.ensure_online()?;
        let now = Instant::now();
        if self
            .kv
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            return Ok(None);
        }
        Ok(self.kv.get(key).map(|entry| entry.value.clone()))
    }

    async fn scan_keys(&self, prefix: &str, limit: usize) -> BrokerResult<Vec<String>> {
        self.ensure_online()?;
        let now = Instant::now();
        Ok(self
            .kv
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .take(limit)
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
        self.ensure_online()?;
        if let Some(sender) = self.channels.get(channel) {
            // 没有订阅者时 send 返回错误，与 Redis PUBLISH 返回 0 等价
            let _ = sender.send(payload.to_string());
        }
        self.channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        self.ensure_online()?;
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let name = channel.to_string();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let name = name.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((message, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("订阅者处理过慢，频道 {} 丢弃了 {} 条消息", name, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();

        Ok(Subscription::new(channel.to_string(), stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_fifo() {
        let broker = MemoryBroker::new();
        broker.enqueue("q", "a").await.unwrap();
        broker.enqueue("q", "b").await.unwrap();
        assert_eq!(broker.queue_len("q"), 2);

        let timeout = Duration::from_millis(10);
        assert_eq!(broker.dequeue("q", timeout).await.unwrap().as_deref(), Some("a"));
        assert_eq!(broker.dequeue("q", timeout).await.unwrap().as_deref(), Some("b"));
        assert_eq!(broker.dequeue("q", timeout).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue("q", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue("q", "job-1").await.unwrap();

        let item = waiter.await.unwrap().unwrap();
        assert_eq!(item.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn test_each_item_claimed_once() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        for i in 0..20 {
            broker.enqueue("q", &i.to_string()).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(item) = broker.dequeue("q", Duration::from_millis(20)).await.unwrap() {
                    got.push(item);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_by_key(|s| s.parse::<u32>().unwrap());
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn test_kv_ttl_and_scan() {
        let broker = MemoryBroker::new();
        broker.set("job:meta:1", "one", None).await.unwrap();
        broker
            .set("job:meta:2", "two", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        broker.set("other:3", "three", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(broker.get("job:meta:1").await.unwrap().as_deref(), Some("one"));
        assert_eq!(broker.get("job:meta:2").await.unwrap(), None);

        let keys = broker.scan_keys("job:meta:", 10).await.unwrap();
        assert_eq!(keys, vec!["job:meta:1".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_respects_limit() {
        let broker = MemoryBroker::new();
        for i in 0..10 {
            broker.set(&format!("job:meta:{}", i), "x", None).await.unwrap();
        }
        assert_eq!(broker.scan_keys("job:meta:", 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_pubsub_no_replay() {
        let broker = MemoryBroker::new();
        broker.publish("ch", "early").await.unwrap();

        let mut sub = broker.subscribe("ch").await.unwrap();
        broker.publish("ch", "late").await.unwrap();

        assert_eq!(sub.next().await.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_two_subscribers_same_order() {
        let broker = MemoryBroker::new();
        let mut first = broker.subscribe("ch").await.unwrap();
        broker.publish("ch", "1").await.unwrap();

        let mut second = broker.subscribe("ch").await.unwrap();
        for msg in ["2", "3", "4"] {
            broker.publish("ch", msg).await.unwrap();
        }

        let mut got_first = Vec::new();
        for _ in 0..4 {
            got_first.push(first.next().await.unwrap());
        }
        let mut got_second = Vec::new();
        for _ in 0..3 {
            got_second.push(second.next().await.unwrap());
        }

        assert_eq!(got_first, vec!["1", "2", "3", "4"]);
        assert_eq!(got_second, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_releases_channel() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("ch").await.unwrap();
        assert_eq!(sub.channel(), "ch");
        drop(sub);

        broker.publish("ch", "nobody").await.unwrap();
        assert!(broker.channels.get("ch").is_none());
    }

    #[tokio::test]
    async fn test_offline_errors() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        assert!(matches!(
            broker.enqueue("q", "x").await,
            Err(BrokerError::Unavailable(_))
        ));
        broker.set_offline(false);
        assert!(broker.enqueue("q", "x").await.is_ok());
    }
}
