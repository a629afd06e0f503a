//! 任务分发
//!
//! 接收下载请求：校验 → 创建保存目录 → 写入任务记录（queued）→ 投递到队列。
//! 分发端不执行下载，只负责让任务可被 worker 取到

use crate::auth::Identity;
use crate::broker::SharedBroker;
use crate::jobs::{DownloadSpec, JobError, JobResult, JobStore, JobSummary, JobView};
use crate::worker::QueueMessage;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// 分发错误
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// 请求不合法（调用方可修正）
    #[error("{0}")]
    InvalidRequest(String),
    #[error("job not found: {0}")]
    NotFound(String),
    /// 代理不可用（可重试）
    #[error("broker unavailable: {0}")]
    Broker(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JobError> for DispatchError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => DispatchError::NotFound(id),
            JobError::Broker(e) => DispatchError::Broker(e.to_string()),
            other => DispatchError::Internal(other.to_string()),
        }
    }
}

/// 任务分发服务
#[derive(Clone)]
pub struct DispatchService {
    broker: SharedBroker,
    store: JobStore,
    model_dir: PathBuf,
    queue: String,
}

impl DispatchService {
    pub fn new(
        broker: SharedBroker,
        store: JobStore,
        model_dir: PathBuf,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            model_dir,
            queue: queue.into(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// 提交下载任务，返回任务ID
    ///
    /// 返回时任务已处于 queued 状态；校验失败时不会产生任何任务记录。
    ///
    /// 入队失败时会尽力把已写入的记录标记为 failed。代理整体不可用时这次写入
    /// 同样会失败，记录保持 queued 直到 TTL 过期
    pub async fn submit(&self, caller: &Identity, spec: DownloadSpec) -> Result<String, DispatchError> {
        spec.validate()
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;

        let target_dir = spec.target_dir(&self.model_dir);
        tokio::fs::create_dir_all(&target_dir).await?;

        let model_id = spec.model_id.clone();
        let job_id = self.store.create(spec, target_dir.clone()).await?;

        let message = QueueMessage {
            job_id: job_id.clone(),
        };
        let payload =
            serde_json::to_string(&message).map_err(|e| DispatchError::Internal(e.to_string()))?;

        if let Err(e) = self.broker.enqueue(&self.queue, &payload).await {
            error!("任务 {} 入队失败: {}", job_id, e);
            // 记录已写入，标记为失败，避免留下永远排队的任务
            if let Err(mark_err) = self
                .store
                .complete(&job_id, JobResult::failure(format!("enqueue failed: {}", e)))
                .await
            {
                warn!("标记任务 {} 失败状态时出错: {}", job_id, mark_err);
            }
            return Err(DispatchError::Broker(e.to_string()));
        }

        info!(
            "{} 提交下载任务: job={}, model={}, dir={:?}",
            caller.subject, job_id, model_id, target_dir
        );
        Ok(job_id)
    }

    /// 查询任务状态
    pub async fn status(&self, _caller: &Identity, job_id: &str) -> Result<JobView, DispatchError> {
        Ok(self.store.get(job_id).await?)
    }

    /// 列出最近的任务
    pub async fn list(&self, _caller: &Identity) -> Result<Vec<JobSummary>, DispatchError> {
        Ok(self.store.list().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FlakyBroker;
    use crate::broker::{Broker, MemoryBroker};
    use crate::jobs::{DownloadType, JobStatus};
    use crate::server::ApiError;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;

    fn service(model_dir: PathBuf) -> (Arc<MemoryBroker>, DispatchService) {
        let broker = Arc::new(MemoryBroker::new());
        let store = JobStore::new(broker.clone(), Duration::from_secs(60), 100);
        let service = DispatchService::new(broker.clone(), store, model_dir, "hf-jobs");
        (broker, service)
    }

    fn caller() -> Identity {
        Identity::new("tester")
    }

    #[tokio::test]
    async fn test_submit_is_queued_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, service) = service(dir.path().to_path_buf());

        let id = service
            .submit(&caller(), DownloadSpec::new("org/model"))
            .await
            .unwrap();

        let view = service.status(&caller(), &id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(broker.queue_len("hf-jobs"), 1);

        let payload = broker
            .dequeue("hf-jobs", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let message: QueueMessage = serde_json::from_str(&payload).unwrap();
        assert_eq!(message.job_id, id);
    }

    #[tokio::test]
    async fn test_submit_creates_target_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (_broker, service) = service(dir.path().to_path_buf());

        service
            .submit(&caller(), DownloadSpec::new("org/model"))
            .await
            .unwrap();
        assert!(dir.path().join("org_model").is_dir());

        let mut spec = DownloadSpec::new("org/other");
        spec.local_dir = "team/custom".to_string();
        service.submit(&caller(), spec).await.unwrap();
        assert!(dir.path().join("team/custom").is_dir());
    }

    #[tokio::test]
    async fn test_invalid_request_creates_no_job() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, service) = service(dir.path().to_path_buf());

        let err = service
            .submit(&caller(), DownloadSpec::new(""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(ref m) if m == "model_id required"));

        let mut spec = DownloadSpec::new("org/model");
        spec.download_type = DownloadType::Branch;
        assert!(matches!(
            service.submit(&caller(), spec).await,
            Err(DispatchError::InvalidRequest(_))
        ));

        assert!(service.list(&caller()).await.unwrap().is_empty());
        assert_eq!(broker.queue_len("hf-jobs"), 0);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let (_broker, service) = service(dir.path().to_path_buf());
        assert!(matches!(
            service.status(&caller(), "missing").await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_broker_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (broker, service) = service(dir.path().to_path_buf());
        broker.set_offline(true);

        assert!(matches!(
            service.submit(&caller(), DownloadSpec::new("org/model")).await,
            Err(DispatchError::Broker(_))
        ));
        assert!(matches!(
            service.list(&caller()).await,
            Err(DispatchError::Broker(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_failure_marks_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(FlakyBroker::new());
        let store = JobStore::new(broker.clone(), Duration::from_secs(60), 100);
        let service =
            DispatchService::new(broker.clone(), store, dir.path().to_path_buf(), "hf-jobs");

        broker.fail_enqueue(0, 1);
        let err = service
            .submit(&caller(), DownloadSpec::new("org/model"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Broker(_)));
        assert_eq!(ApiError::from(err).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(broker.inner().queue_len("hf-jobs"), 0);

        let jobs = service.list(&caller()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);

        let view = service.status(&caller(), &jobs[0].id).await.unwrap();
        let error = view.result.unwrap().error.unwrap();
        assert!(error.starts_with("enqueue failed"), "{}", error);
    }

    #[tokio::test]
    async fn test_list_contains_submitted() {
        let dir = tempfile::tempdir().unwrap();
        let (_broker, service) = service(dir.path().to_path_buf());
        let a = service
            .submit(&caller(), DownloadSpec::new("org/a"))
            .await
            .unwrap();
        let b = service
            .submit(&caller(), DownloadSpec::new("org/b"))
            .await
            .unwrap();

        let ids: Vec<String> = service
            .list(&caller())
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
    }
}
