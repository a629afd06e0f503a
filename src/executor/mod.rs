//! 下载执行器
//!
//! worker 端执行单个任务：
//! 1. 构造传输命令并发布 start 事件
//! 2. 创建任务日志文件
//! 3. 启动进程，stdout / stderr 写入同一个管道，由一个读取任务切行后送入通道
//! 4. 消费端按产生顺序处理每一行：先写日志文件，再发布 log 事件
//! 5. 等待进程退出，发布 finish 事件
//!
//! 任何退出码都是正常结束（finished），由调用方解释；只有进程无法启动等内部错误才是 failed

mod command;
mod job_log;
mod lines;

pub use command::{TransferCommand, HF_TRANSFER_ENV};
pub use job_log::{job_log_path, read_job_log, JobLogWriter};
pub use lines::{pump_lines, LineSplitter};

use crate::broker::{job_channel, SharedBroker};
use crate::events::JobEvent;
use crate::jobs::{DownloadSpec, JobResult};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 行通道容量，消费端跟不上时读取端等待
const LINE_BUFFER: usize = 256;

/// 执行错误（记录到任务结果中，不会抛给提交者）
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("无法启动 {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("任务日志写入失败: {0}")]
    LogIo(#[source] std::io::Error),
    #[error("等待进程结束失败: {0}")]
    Wait(#[source] std::io::Error),
}

/// 下载执行器
pub struct DownloadExecutor {
    broker: SharedBroker,
    transfer_bin: String,
    logs_dir: PathBuf,
}

impl DownloadExecutor {
    pub fn new(broker: SharedBroker, transfer_bin: impl Into<String>, logs_dir: PathBuf) -> Self {
        Self {
            broker,
            transfer_bin: transfer_bin.into(),
            logs_dir,
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// 执行任务，返回终态结果
    pub async fn execute(&self, job_id: &str, spec: &DownloadSpec, target_dir: &Path) -> JobResult {
        match self.run(job_id, spec, target_dir).await {
            Ok(code) => {
                info!("任务 {} 进程退出: code={:?}", job_id, code);
                JobResult::exited(code)
            }
            Err(e) => {
                error!("任务 {} 执行失败: {}", job_id, e);
                let message = e.to_string();
                self.publish(job_id, &JobEvent::Error {
                    error: message.clone(),
                })
                .await;
                self.publish(job_id, &JobEvent::Finish { code: None }).await;
                JobResult::failure(message)
            }
        }
    }

    async fn run(
        &self,
        job_id: &str,
        spec: &DownloadSpec,
        target_dir: &Path,
    ) -> Result<Option<i32>, ExecutionError> {
        let inherited = std::env::var(HF_TRANSFER_ENV).ok();
        let command =
            TransferCommand::build(&self.transfer_bin, spec, target_dir, inherited.as_deref());

        let cmd_line = command.display();
        info!("任务 {} 开始执行: {}", job_id, cmd_line);
        self.publish(job_id, &JobEvent::Start { cmd: cmd_line }).await;

        let mut log = JobLogWriter::create(&self.logs_dir, job_id)
            .await
            .map_err(ExecutionError::LogIo)?;

        let (mut child, output) = command
            .spawn_merged()
            .map_err(|source| ExecutionError::Spawn {
                program: command.program().to_string(),
                source,
            })?;

        let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);
        let reader = tokio::spawn(pump_lines(output, tx));

        // 日志文件先于频道：频道上出现的行一定已经落盘
        // 出错提前返回时 child 被 drop，kill_on_drop 会结束进程
        while let Some(line) = rx.recv().await {
            log.append_line(&line).await.map_err(ExecutionError::LogIo)?;
            self.publish(job_id, &JobEvent::Log { line }).await;
        }

        if let Err(e) = reader.await {
            warn!("任务 {} 输出读取任务异常结束: {}", job_id, e);
        }

        let status = child.wait().await.map_err(ExecutionError::Wait)?;
        let code = status.code();
        self.publish(job_id, &JobEvent::Finish { code }).await;

        info!("任务 {} 共输出 {} 行", job_id, log.lines());
        Ok(code)
    }

    /// 发布事件；失败只记录日志，不影响任务执行
    async fn publish(&self, job_id: &str, event: &JobEvent) {
        let payload = match event.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!("序列化任务事件失败: {}", e);
                return;
            }
        };
        if let Err(e) = self.broker.publish(&job_channel(job_id), &payload).await {
            warn!("发布任务事件失败 (任务 {}): {}", job_id, e);
        }
    }
}
