//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化。文件按大小滚动，启动时清理超过保留天数的旧文件。
//!
//! 注意：这里是服务自身的运行日志，任务输出日志由 executor 写入 `{data_dir}/logs/{job_id}.log`

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "hf-fetchd.";

/// 时间戳格式
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RotatingState {
    dir: PathBuf,
    /// 启动时间戳（YYYY-MM-DD-HHMMSS），同一次运行的所有文件共享
    stamp: String,
    index: u32,
    file: File,
    written: u64,
    max_size: u64,
}

impl RotatingState {
    fn path_for(dir: &Path, stamp: &str, index: u32) -> PathBuf {
        if index == 0 {
            dir.join(format!("{}{}.log", LOG_FILE_PREFIX, stamp))
        } else {
            dir.join(format!("{}{}_{}.log", LOG_FILE_PREFIX, stamp, index))
        }
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn write_rotating(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.file.flush()?;
            self.index += 1;
            self.file = Self::open(&Self::path_for(&self.dir, &self.stamp, self.index))?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小滚动的日志文件写入器
///
/// 文件名：`hf-fetchd.YYYY-MM-DD-HHMMSS.log`，滚动后追加 `_N`
#[derive(Clone)]
pub struct RotatingFileWriter {
    state: Arc<Mutex<RotatingState>>,
}

impl RotatingFileWriter {
    pub fn new(dir: PathBuf, max_size: u64) -> io::Result<Self> {
        let stamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = RotatingState::open(&RotatingState::path_for(&dir, &stamp, 0))?;
        Ok(Self {
            state: Arc::new(Mutex::new(RotatingState {
                dir,
                stamp,
                index: 0,
                file,
                written: 0,
                max_size,
            })),
        })
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write_rotating(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().file.flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的 level
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| RotatingFileWriter::new(config.log_dir.clone(), config.max_file_size))
            .map_err(|e| eprintln!("创建日志文件失败: {:?}, 回退到仅控制台输出: {}", config.log_dir, e))
            .ok()
    } else {
        None
    };

    match writer {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();

            info!(
                "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
                config.log_dir, config.retention_days, config.level
            );

            let removed = cleanup_old_logs(
                &config.log_dir,
                Duration::from_secs(config.retention_days as u64 * 24 * 60 * 60),
            );
            if removed > 0 {
                info!("已清理 {} 个过期日志文件", removed);
            }

            LogGuard {
                _file_guard: Some(guard),
            }
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();

            info!("日志系统初始化完成（仅控制台输出）");
            LogGuard { _file_guard: None }
        }
    }
}

/// 删除修改时间早于保留期的日志文件，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention: Duration) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_service_log = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(".log"))
            .unwrap_or(false);
        if !is_service_log {
            continue;
        }

        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map(|age| age > retention)
            .unwrap_or(false);

        if expired {
            match fs::remove_file(&path) {
                Ok(_) => {
                    removed += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    removed
}
