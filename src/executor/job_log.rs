//! 任务日志文件
//!
//! 每个任务一个纯文本文件：`{logs_dir}/{job_id}.log`，每行一条进程输出。
//! 只由执行该任务的 executor 写入；每行写入后立即刷到操作系统，
//! executor 崩溃时已写入的行不会丢失

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 任务日志扩展名
const LOG_EXTENSION: &str = "log";

/// 获取任务日志路径：`{logs_dir}/{job_id}.log`
pub fn job_log_path(logs_dir: &Path, job_id: &str) -> PathBuf {
    logs_dir.join(format!("{}.{}", job_id, LOG_EXTENSION))
}

/// 读取任务日志全文，文件不存在时返回 None
pub async fn read_job_log(logs_dir: &Path, job_id: &str) -> io::Result<Option<String>> {
    match fs::read(job_log_path(logs_dir, job_id)).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// 任务日志写入器
pub struct JobLogWriter {
    file: File,
    lines: u64,
}

impl JobLogWriter {
    /// 创建（或截断）任务日志
    pub async fn create(logs_dir: &Path, job_id: &str) -> io::Result<Self> {
        fs::create_dir_all(logs_dir).await?;

        let path = job_log_path(logs_dir, job_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        debug!("已创建任务日志: {:?}", path);
        Ok(Self { file, lines: 0 })
    }

    /// 追加一行并刷新
    pub async fn append_line(&mut self, line: &str) -> io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file.write_all(&buf).await?;
        self.file.flush().await?;
        self.lines += 1;
        Ok(())
    }

    /// 已写入行数
    pub fn lines(&self) -> u64 {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let mut writer = JobLogWriter::create(&logs, "job-1").await.unwrap();
        writer.append_line("first").await.unwrap();
        writer.append_line("second").await.unwrap();
        assert_eq!(writer.lines(), 2);
        assert!(job_log_path(&logs, "job-1").is_file());

        // 未 drop 写入器时内容已可见
        let content = read_job_log(&logs, "job-1").await.unwrap().unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_create_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JobLogWriter::create(dir.path(), "job-2").await.unwrap();
        writer.append_line("old").await.unwrap();
        drop(writer);

        let writer = JobLogWriter::create(dir.path(), "job-2").await.unwrap();
        drop(writer);
        let content = read_job_log(dir.path(), "job-2").await.unwrap().unwrap();
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn test_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_job_log(dir.path(), "nope").await.unwrap(), None);
    }
}
