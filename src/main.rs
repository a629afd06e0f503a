use anyhow::Context;
use clap::{Parser, Subcommand};
use hf_fetchd::{
    auth::TokenVerifier,
    broker,
    config::{AppConfig, BrokerBackend, LogConfig, DEFAULT_CONFIG_PATH},
    logging,
    server::{build_router, AppState},
    worker::WorkerPool,
};
use std::time::Duration;
use tracing::info;

/// hf-fetchd - Hugging Face 模型下载任务服务
#[derive(Parser)]
#[command(name = "hf-fetchd")]
#[command(version)]
#[command(about = "Queue-backed Hugging Face download jobs with live log streaming")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// 配置文件路径
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动 API 与日志网关（默认）
    Serve,
    /// 只启动下载 worker
    Worker,
    /// 用配置中的密钥签发访问令牌
    Token {
        /// 令牌主体
        #[arg(long)]
        sub: String,
        /// 有效期（秒），不指定则长期有效
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
}

/// 只读取配置文件中的 [log] 段，用于在完整加载配置前初始化日志
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve);

    // 令牌直接输出到 stdout，不初始化日志
    if let Commands::Token { sub, ttl_secs } = &command {
        let config = AppConfig::load_or_default(&cli.config).await;
        config.validate()?;
        let token = TokenVerifier::new(&config.auth.jwt_secret)
            .issue(sub, ttl_secs.map(Duration::from_secs))
            .context("签发令牌失败")?;
        println!("{}", token);
        return Ok(());
    }

    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("hf-fetchd v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&cli.config).await;
    config.validate().context("配置校验失败")?;

    match command {
        Commands::Worker => run_worker(config).await,
        _ => serve(config).await,
    }
}

/// API + 日志网关
async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let broker = broker::connect(&config.broker)
        .await
        .context("连接消息代理失败")?;

    // 内存代理只在本进程内可见，必须内嵌 worker
    let embedded = config.broker.backend == BrokerBackend::Memory || config.worker.embedded;
    let pool = if embedded {
        let pool = WorkerPool::from_config(&config, broker.clone());
        info!("已内嵌 {} 个下载 worker", pool.len());
        Some(pool)
    } else {
        None
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = build_router(AppState::new(config, broker));

    info!("服务器启动在: http://{}", addr);
    info!("提交下载: POST http://{}/api/download", addr);
    info!("日志订阅: ws://{}/ws/jobs/{{job_id}}", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听地址失败: {}", addr))?;

    // 🔥 使用 select! 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    if let Some(pool) = pool {
        info!("等待下载 worker 完成当前任务...");
        pool.shutdown().await;
    }
    info!("应用已安全退出");

    Ok(())
}

/// 独立 worker 进程
async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    if config.broker.backend == BrokerBackend::Memory {
        anyhow::bail!("内存代理无法跨进程共享队列，独立 worker 需要 Redis 代理");
    }

    let broker = broker::connect(&config.broker)
        .await
        .context("连接消息代理失败")?;

    let pool = WorkerPool::from_config(&config, broker);
    info!(
        "已启动 {} 个下载 worker，队列: {}，模型目录: {:?}",
        pool.len(),
        config.broker.queue_name,
        config.storage.model_dir
    );

    tokio::signal::ctrl_c()
        .await
        .context("监听 Ctrl+C 失败")?;
    info!("收到 Ctrl+C，等待当前任务完成...");
    pool.shutdown().await;
    info!("worker 已安全退出");

    Ok(())
}
