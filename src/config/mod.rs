// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 消息代理配置
    #[serde(default)]
    pub broker: BrokerConfig,
    /// 存储目录配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 认证配置
    #[serde(default)]
    pub auth: AuthConfig,
    /// 下载 worker 配置
    #[serde(default)]
    pub worker: WorkerConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// 日志流 WebSocket 是否要求认证
    ///
    /// 设为 false 时与旧版行为一致（任何人都能订阅任务日志）
    #[serde(default = "default_ws_require_auth")]
    pub ws_require_auth: bool,
    /// WebSocket 空闲超时（秒），超过此时间没有任何消息则断开，0 表示不限制
    #[serde(default = "default_ws_idle_timeout_secs")]
    pub ws_idle_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_ws_require_auth() -> bool {
    true
}

fn default_ws_idle_timeout_secs() -> u64 {
    60 * 60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_require_auth: default_ws_require_auth(),
            ws_idle_timeout_secs: default_ws_idle_timeout_secs(),
        }
    }
}

/// 消息代理后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// Redis（多进程部署）
    Redis,
    /// 进程内存（单进程部署 / 测试）
    Memory,
}

/// 消息代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// 后端类型
    #[serde(default = "default_broker_backend")]
    pub backend: BrokerBackend,
    /// Redis 连接地址
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// 任务队列名称
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// 任务记录保留时长（秒，默认 24 小时）
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// 任务列表最多返回条数
    ///
    /// 列表通过扫描任务键得到，只保证尽力而为，任务量大时不会全部可见
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

fn default_broker_backend() -> BrokerBackend {
    BrokerBackend::Redis
}

fn default_redis_url() -> String {
    "redis://redis:6379/0".to_string()
}

fn default_queue_name() -> String {
    "hf-jobs".to_string()
}

fn default_result_ttl_secs() -> u64 {
    60 * 60 * 24
}

fn default_list_limit() -> usize {
    100
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: default_broker_backend(),
            redis_url: default_redis_url(),
            queue_name: default_queue_name(),
            result_ttl_secs: default_result_ttl_secs(),
            list_limit: default_list_limit(),
        }
    }
}

/// 存储目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 模型下载根目录
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// 数据目录（任务日志保存在 {data_dir}/logs 下）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("/models")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// 任务日志目录
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 签名密钥
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

fn default_jwt_secret() -> String {
    "please-set-me".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
        }
    }
}

/// 下载 worker 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 外部传输工具可执行文件
    #[serde(default = "default_transfer_bin")]
    pub transfer_bin: String,
    /// worker 数量（每个 worker 同一时间只处理一个任务）
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 队列阻塞拉取超时（秒）
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// serve 模式下是否在 API 进程内启动 worker
    ///
    /// 使用内存代理时总是内嵌
    #[serde(default)]
    pub embedded: bool,
}

fn default_transfer_bin() -> String {
    "huggingface-cli".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_timeout_secs() -> u64 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            transfer_bin: default_transfer_bin(),
            concurrency: default_concurrency(),
            poll_timeout_secs: default_poll_timeout_secs(),
            embedded: false,
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// 加载配置，失败时使用默认配置
    ///
    /// 加载后应用环境变量覆盖，与容器部署方式保持一致
    pub async fn load_or_default(path: &str) -> Self {
        let mut config = match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// 应用环境变量覆盖
    ///
    /// 支持的变量：
    /// - `REDIS_URL`
    /// - `MODEL_DIR`
    /// - `DATA_DIR`
    /// - `JWT_SECRET`
    /// - `HF_FETCHD_HOST` / `HF_FETCHD_PORT`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.broker.redis_url = url;
        }
        if let Some(dir) = lookup("MODEL_DIR") {
            self.storage.model_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(host) = lookup("HF_FETCHD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("HF_FETCHD_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("忽略无效的 HF_FETCHD_PORT: {}", port),
            }
        }
    }

    /// 启动前校验
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            anyhow::bail!("auth.jwt_secret 不能为空");
        }
        if self.worker.concurrency == 0 {
            anyhow::bail!("worker.concurrency 必须大于0");
        }
        if self.broker.list_limit == 0 {
            anyhow::bail!("broker.list_limit 必须大于0");
        }
        if self.worker.transfer_bin.trim().is_empty() {
            anyhow::bail!("worker.transfer_bin 不能为空");
        }
        Ok(())
    }
}
