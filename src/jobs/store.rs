//! 任务存储
//!
//! 任务记录以 JSON 保存在代理的键值存储中（`job:meta:{id}`），进程内不做缓存；
//! 所有读取都直接访问代理，多个 API / worker 进程看到的是同一份状态

use super::types::{DownloadSpec, JobError, JobRecord, JobResult, JobStatus, JobSummary, JobView};
use crate::broker::{job_key, SharedBroker, JOB_KEY_PREFIX};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 任务存储
#[derive(Clone)]
pub struct JobStore {
    broker: SharedBroker,
    /// 记录保留时长，过期由代理负责清理
    ttl: Duration,
    /// 列表上限
    list_limit: usize,
}

impl JobStore {
    pub fn new(broker: SharedBroker, ttl: Duration, list_limit: usize) -> Self {
        Self {
            broker,
            ttl,
            list_limit,
        }
    }

    /// 创建任务记录（状态 queued），返回新任务ID
    pub async fn create(&self, spec: DownloadSpec, target_dir: PathBuf) -> Result<String, JobError> {
        let id = Uuid::new_v4().to_string();
        let record = JobRecord::new(id.clone(), spec, target_dir);
        self.save(&record).await?;
        info!("创建任务记录: {} ({})", id, record.spec.model_id);
        Ok(id)
    }

    /// 读取完整记录
    pub async fn fetch(&self, id: &str) -> Result<JobRecord, JobError> {
        let raw = self
            .broker
            .get(&job_key(id))
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// 查询任务状态
    pub async fn get(&self, id: &str) -> Result<JobView, JobError> {
        Ok(self.fetch(id).await?.view())
    }

    /// 列出最近的任务
    ///
    /// 通过扫描键实现，最多返回 `list_limit` 条，任务量大时不保证全部可见
    pub async fn list(&self) -> Result<Vec<JobSummary>, JobError> {
        let keys = self
            .broker
            .scan_keys(JOB_KEY_PREFIX, self.list_limit)
            .await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // 扫描与读取之间记录可能过期
            let Some(raw) = self.broker.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<JobRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!("跳过无法解析的任务记录 {}: {}", key, e),
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.iter().map(JobRecord::summary).collect())
    }

    /// queued -> running
    pub async fn mark_running(&self, id: &str) -> Result<JobRecord, JobError> {
        self.transition(id, JobStatus::Running, |record| record.mark_running())
            .await
    }

    /// 写入终态结果：有错误描述为 failed，否则为 finished
    pub async fn complete(&self, id: &str, result: JobResult) -> Result<JobRecord, JobError> {
        let to = JobStatus::from_broker_state(result.broker_state());
        self.transition(id, to, move |record| record.mark_done(result))
            .await
    }

    async fn transition<F>(&self, id: &str, to: JobStatus, apply: F) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut record = self.fetch(id).await?;
        let from = record.status();
        if !from.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        apply(&mut record);
        self.save(&record).await?;
        debug!("任务 {} 状态变更: {} -> {}", id, from, to);
        Ok(record)
    }

    async fn save(&self, record: &JobRecord) -> Result<(), JobError> {
        let raw = serde_json::to_string(record)?;
        self.broker
            .set(&job_key(&record.id), &raw, Some(self.ttl))
            .await?;
        Ok(())
    }
}
