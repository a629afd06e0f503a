//! 可注入故障的代理（仅测试）
//!
//! 包装 `MemoryBroker`，按操作类型让指定次数的调用返回 `Unavailable`

use super::{Broker, BrokerError, BrokerResult, MemoryBroker, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

/// 故障计划：先放行 `skip` 次，再失败 `fail` 次，之后恢复正常
#[derive(Default)]
struct FaultPlan {
    counts: Mutex<(usize, usize)>,
}

impl FaultPlan {
    fn arm(&self, skip: usize, fail: usize) {
        *self.counts.lock() = (skip, fail);
    }

    fn check(&self, op: &str) -> BrokerResult<()> {
        let mut counts = self.counts.lock();
        let (skip, fail) = &mut *counts;
        if *skip > 0 {
            *skip -= 1;
            Ok(())
        } else if *fail > 0 {
            *fail -= 1;
            Err(BrokerError::Unavailable(format!("injected {} failure", op)))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct FlakyBroker {
    inner: MemoryBroker,
    enqueue: FaultPlan,
    get: FaultPlan,
    set: FaultPlan,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryBroker {
        &self.inner
    }

    pub fn fail_enqueue(&self, skip: usize, fail: usize) {
        self.enqueue.arm(skip, fail);
    }

    pub fn fail_get(&self, skip: usize, fail: usize) {
        self.get.arm(skip, fail);
    }

    pub fn fail_set(&self, skip: usize, fail: usize) {
        self.set.arm(skip, fail);
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn enqueue(&self, queue: &str, payload: &str) -> BrokerResult<()> {
        self.enqueue.check("enqueue")?;
        self.inner.enqueue(queue, payload).await
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> BrokerResult<Option<String>> {
        self.inner.dequeue(queue, timeout).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BrokerResult<()> {
        self.set.check("set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
        self.get.check("get")?;
        self.inner.get(key).await
    }

    async fn scan_keys(&self, prefix: &str, limit: usize) -> BrokerResult<Vec<String>> {
        self.inner.scan_keys(prefix, limit).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        self.inner.subscribe(channel).await
    }
}
