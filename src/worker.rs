//! 下载 worker
//!
//! 每个 worker 串行处理任务：从代理队列阻塞拉取一条消息，执行完毕后再拉下一条。
//! 多个 worker 并行时由队列保证同一任务只会被一个 worker 取到

use crate::broker::SharedBroker;
use crate::config::AppConfig;
use crate::executor::DownloadExecutor;
use crate::jobs::{JobError, JobRecord, JobStore};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 代理异常时的重试间隔
const BROKER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// 任务状态写入的重试次数（含首次）
const STORE_ATTEMPTS: u32 = 5;

/// 任务状态写入的首次重试间隔，之后按次数线性增加
const STORE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// 队列消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMessage {
    pub job_id: String,
}

/// 单个 worker
pub struct Worker {
    name: String,
    broker: SharedBroker,
    store: JobStore,
    executor: Arc<DownloadExecutor>,
    queue: String,
    poll_timeout: Duration,
    retry_delay: Duration,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        broker: SharedBroker,
        store: JobStore,
        executor: Arc<DownloadExecutor>,
        queue: impl Into<String>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            broker,
            store,
            executor,
            queue: queue.into(),
            poll_timeout,
            retry_delay: STORE_RETRY_DELAY,
        }
    }

    /// 设置任务状态写入的重试间隔
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// 主循环，收到关闭信号后在任务间隙退出
    pub async fn run(self, shutdown: CancellationToken) {
        info!("{} 已启动，监听队列 {}", self.name, self.queue);

        loop {
            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.broker.dequeue(&self.queue, self.poll_timeout) => popped,
            };

            match popped {
                Ok(Some(payload)) => {
                    self.process(&payload).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("{} 拉取队列失败: {}", self.name, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(BROKER_RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!("{} 已停止", self.name);
    }

    /// 处理一条队列消息，返回任务终态记录（跳过时返回 None）
    pub async fn process(&self, payload: &str) -> Option<JobRecord> {
        let message: QueueMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} 丢弃无法解析的队列消息 {:?}: {}", self.name, payload, e);
                return None;
            }
        };
        let job_id = message.job_id;

        let record = match self
            .with_retry("领取", &job_id, || self.store.mark_running(&job_id))
            .await
        {
            Ok(record) => record,
            Err(JobError::NotFound(_)) => {
                warn!("{} 跳过任务 {}: 记录不存在（可能已过期）", self.name, job_id);
                return None;
            }
            Err(JobError::Broker(e)) => {
                // 消息已出队，放回队尾交给下一次拉取
                error!("{} 领取任务 {} 失败，放回队列: {}", self.name, job_id, e);
                if let Err(e) = self.broker.enqueue(&self.queue, payload).await {
                    error!(
                        "{} 任务 {} 放回队列失败，记录将保持 queued: {}",
                        self.name, job_id, e
                    );
                }
                return None;
            }
            Err(e) => {
                warn!("{} 跳过任务 {}: {}", self.name, job_id, e);
                return None;
            }
        };

        debug!("{} 开始处理任务 {}", self.name, job_id);
        let result = self
            .executor
            .execute(&job_id, &record.spec, &record.target_dir)
            .await;

        match self
            .with_retry("保存结果", &job_id, || self.store.complete(&job_id, result.clone()))
            .await
        {
            Ok(record) => {
                info!("{} 任务 {} 完成: {}", self.name, job_id, record.status());
                Some(record)
            }
            Err(e) => {
                error!("{} 保存任务 {} 结果失败: {}", self.name, job_id, e);
                None
            }
        }
    }

    /// 代理异常时按递增间隔重试，其他错误直接返回
    async fn with_retry<T, F, Fut>(
        &self,
        action: &str,
        job_id: &str,
        mut op: F,
    ) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(JobError::Broker(e)) if attempt < STORE_ATTEMPTS => {
                    let delay = self.retry_delay * attempt;
                    warn!(
                        "{} {}任务 {} 时代理异常 (第 {} 次): {}，{:?} 后重试",
                        self.name, action, job_id, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// worker 池
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// 启动 `count` 个 worker
    pub fn spawn(
        count: usize,
        broker: SharedBroker,
        store: JobStore,
        executor: Arc<DownloadExecutor>,
        queue: &str,
        poll_timeout: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..count)
            .map(|i| {
                let worker = Worker::new(
                    format!("worker-{}", i),
                    broker.clone(),
                    store.clone(),
                    executor.clone(),
                    queue,
                    poll_timeout,
                );
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();

        Self { handles, shutdown }
    }

    /// 按配置启动
    pub fn from_config(config: &AppConfig, broker: SharedBroker) -> Self {
        let store = JobStore::new(
            broker.clone(),
            Duration::from_secs(config.broker.result_ttl_secs),
            config.broker.list_limit,
        );
        let executor = Arc::new(DownloadExecutor::new(
            broker.clone(),
            config.worker.transfer_bin.clone(),
            config.storage.logs_dir(),
        ));
        Self::spawn(
            config.worker.concurrency,
            broker,
            store,
            executor,
            &config.broker.queue_name,
            Duration::from_secs(config.worker.poll_timeout_secs),
        )
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 通知所有 worker 停止并等待当前任务结束
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("worker 异常退出: {}", e);
            }
        }
    }
}
