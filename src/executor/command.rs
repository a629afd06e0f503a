//! 传输命令构造
//!
//! 以参数列表直接启动进程，不经过 shell；仓库 ID、文件名中的 shell 元字符
//! 只是普通参数内容

use crate::jobs::{DownloadMode, DownloadSpec};
use std::borrow::Cow;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// 控制 hf_transfer 加速的环境变量
pub const HF_TRANSFER_ENV: &str = "HF_HUB_ENABLE_HF_TRANSFER";

/// 传输命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl TransferCommand {
    /// 根据下载请求构造命令
    ///
    /// `inherited_env` 为 worker 进程中已有的加速开关，已设置时不覆盖
    pub fn build(
        program: &str,
        spec: &DownloadSpec,
        target_dir: &Path,
        inherited_env: Option<&str>,
    ) -> Self {
        let mut args = vec![
            "download".to_string(),
            spec.model_id.clone(),
            "--repo-type".to_string(),
            spec.repo_type.clone(),
            "--local-dir".to_string(),
            target_dir.to_string_lossy().into_owned(),
        ];

        match spec.mode() {
            DownloadMode::Full => {}
            DownloadMode::Branch(branch) => {
                args.push("--revision".to_string());
                args.push(branch.to_string());
            }
            DownloadMode::Files(files) => {
                for file in files {
                    args.push("--include".to_string());
                    args.push(file.clone());
                }
            }
        }

        let envs = acceleration_env(spec.hf_transfer, inherited_env)
            .into_iter()
            .collect();

        Self {
            program: program.to_string(),
            args,
            envs,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }

    /// 展示用命令行（POSIX 引号），只用于日志和 start 事件
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_arg)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// 生成进程命令：stdin 关闭，句柄 drop 时杀掉子进程
    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// 启动进程，stdout 和 stderr 共用同一个管道
    ///
    /// 两路输出在内核里按写入顺序合并，读端看到的就是进程产生的顺序
    pub fn spawn_merged(&self) -> io::Result<(Child, tokio::fs::File)> {
        let (reader, writer) = os_pipe::pipe()?;
        let writer_err = writer.try_clone()?;

        let mut command = self.to_command();
        command.stdout(writer).stderr(writer_err);
        let child = command.spawn()?;
        // 父进程持有的写端必须关闭，否则读端等不到 EOF
        drop(command);

        Ok((child, tokio::fs::File::from_std(pipe_file(reader))))
    }
}

#[cfg(unix)]
fn pipe_file(reader: os_pipe::PipeReader) -> std::fs::File {
    std::fs::File::from(std::os::fd::OwnedFd::from(reader))
}

#[cfg(windows)]
fn pipe_file(reader: os_pipe::PipeReader) -> std::fs::File {
    std::fs::File::from(std::os::windows::io::OwnedHandle::from(reader))
}

/// 加速开关环境变量；已存在时保持原值
fn acceleration_env(hf_transfer: bool, inherited: Option<&str>) -> Option<(String, String)> {
    if inherited.is_some() {
        return None;
    }
    let value = if hf_transfer { "1" } else { "0" };
    Some((HF_TRANSFER_ENV.to_string(), value.to_string()))
}

fn quote_arg(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,%".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}
