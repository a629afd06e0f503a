use crate::broker::{BrokerError, BrokerJobState};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// 下载方式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadType {
    /// 整个仓库
    #[default]
    Full,
    /// 指定分支 / 修订版本
    Branch,
    /// 仅指定文件
    Files,
}

/// 校验后的下载模式，命令构造只依赖它
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode<'a> {
    Full,
    Branch(&'a str),
    Files(&'a [String]),
}

fn default_repo_type() -> String {
    "model".to_string()
}

fn default_hf_transfer() -> bool {
    true
}

/// 下载请求（提交后不可变）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadSpec {
    /// 仓库 ID，例如 `org/model`
    pub model_id: String,
    /// 仓库类型（model / dataset / space）
    #[serde(default = "default_repo_type")]
    pub repo_type: String,
    /// 相对模型根目录的保存目录，空表示按仓库 ID 生成
    #[serde(default)]
    pub local_dir: String,
    /// 是否启用 hf_transfer 加速
    #[serde(default = "default_hf_transfer")]
    pub hf_transfer: bool,
    #[serde(default)]
    pub download_type: DownloadType,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub files: Option<Vec<String>>,
}

/// 请求校验错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("model_id required")]
    EmptyModelId,
    #[error("branch download requires a non-empty branch")]
    MissingBranch,
    #[error("files download requires a non-empty file list")]
    MissingFiles,
    #[error("file entry must not be empty")]
    EmptyFileEntry,
    #[error("local_dir must be a relative path without '..': {0}")]
    InvalidLocalDir(String),
}

impl DownloadSpec {
    /// 最小请求（其余字段取默认值）
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            repo_type: default_repo_type(),
            local_dir: String::new(),
            hf_transfer: default_hf_transfer(),
            download_type: DownloadType::Full,
            branch: None,
            files: None,
        }
    }

    /// 校验请求
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.model_id.trim().is_empty() {
            return Err(SpecError::EmptyModelId);
        }

        match self.download_type {
            DownloadType::Full => {}
            DownloadType::Branch => {
                let has_branch = self
                    .branch
                    .as_deref()
                    .map(|b| !b.trim().is_empty())
                    .unwrap_or(false);
                if !has_branch {
                    return Err(SpecError::MissingBranch);
                }
            }
            DownloadType::Files => {
                let files = self.files.as_deref().unwrap_or_default();
                if files.is_empty() {
                    return Err(SpecError::MissingFiles);
                }
                if files.iter().any(|f| f.is_empty()) {
                    return Err(SpecError::EmptyFileEntry);
                }
            }
        }

        if !self.local_dir.is_empty() {
            let path = Path::new(&self.local_dir);
            let escapes = path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Err(SpecError::InvalidLocalDir(self.local_dir.clone()));
            }
        }

        Ok(())
    }

    /// 下载模式，未通过校验的请求会退化为 Full
    pub fn mode(&self) -> DownloadMode<'_> {
        match self.download_type {
            DownloadType::Branch => match self.branch.as_deref() {
                Some(branch) if !branch.is_empty() => DownloadMode::Branch(branch),
                _ => DownloadMode::Full,
            },
            DownloadType::Files => match self.files.as_deref() {
                Some(files) if !files.is_empty() => DownloadMode::Files(files),
                _ => DownloadMode::Full,
            },
            DownloadType::Full => DownloadMode::Full,
        }
    }

    /// 保存目录（相对模型根目录）
    ///
    /// 未指定 local_dir 时由仓库 ID 生成，`/` 等字符替换为 `_`
    pub fn target_dir(&self, model_root: &Path) -> PathBuf {
        if self.local_dir.is_empty() {
            model_root.join(sanitize_model_id(&self.model_id))
        } else {
            model_root.join(&self.local_dir)
        }
    }
}

/// 仓库 ID 转目录名：只保留 `[A-Za-z0-9._-]`，其余替换为 `_`
pub fn sanitize_model_id(model_id: &str) -> String {
    let name: String = model_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // 纯点号会变成当前/上级目录
    if name.chars().all(|c| c == '.') {
        name.replace('.', "_")
    } else {
        name
    }
}

/// 任务状态（对外）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// 排队中
    Queued,
    /// 执行中
    Running,
    /// 已结束（任意退出码）
    Finished,
    /// 内部失败（进程无法启动等）
    Failed,
}

impl JobStatus {
    /// 代理状态映射
    pub fn from_broker_state(state: BrokerJobState) -> Self {
        match state {
            BrokerJobState::Queued | BrokerJobState::Deferred | BrokerJobState::Scheduled => {
                JobStatus::Queued
            }
            BrokerJobState::Started => JobStatus::Running,
            BrokerJobState::Finished => JobStatus::Finished,
            BrokerJobState::Failed | BrokerJobState::Stopped | BrokerJobState::Canceled => {
                JobStatus::Failed
            }
        }
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Finished | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// 只允许前进，终态之后不再变化
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 任务结果（仅终态存在）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    /// 外部进程退出码；被信号终止或未能启动时为 None
    pub returncode: Option<i32>,
    /// 内部错误描述
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn exited(returncode: Option<i32>) -> Self {
        Self {
            returncode,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            returncode: None,
            error: Some(error.into()),
        }
    }

    /// 对应的代理终态
    pub fn broker_state(&self) -> BrokerJobState {
        if self.error.is_some() {
            BrokerJobState::Failed
        } else {
            BrokerJobState::Finished
        }
    }
}

/// 代理中保存的任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// 任务ID
    pub id: String,
    /// 下载请求
    pub spec: DownloadSpec,
    /// 实际保存目录
    pub target_dir: PathBuf,
    /// 代理层状态
    pub state: BrokerJobState,
    /// 终态结果
    #[serde(default)]
    pub result: Option<JobResult>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    #[serde(default)]
    pub started_at: Option<i64>,
    /// 结束时间 (Unix timestamp)
    #[serde(default)]
    pub ended_at: Option<i64>,
}

impl JobRecord {
    pub fn new(id: String, spec: DownloadSpec, target_dir: PathBuf) -> Self {
        Self {
            id,
            spec,
            target_dir,
            state: BrokerJobState::Queued,
            result: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_broker_state(self.state)
    }

    /// 标记为执行中
    pub fn mark_running(&mut self) {
        self.state = BrokerJobState::Started;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 写入终态结果
    pub fn mark_done(&mut self, result: JobResult) {
        self.state = result.broker_state();
        self.result = Some(result);
        self.ended_at = Some(chrono::Utc::now().timestamp());
    }

    pub fn view(&self) -> JobView {
        let status = self.status();
        JobView {
            id: self.id.clone(),
            status,
            result: if status.is_terminal() {
                self.result.clone()
            } else {
                None
            },
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            status: self.status(),
        }
    }
}

/// 任务查询结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub result: Option<JobResult>,
}

/// 任务列表项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
}

/// 任务存储错误
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("任务记录序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}
