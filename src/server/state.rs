// 应用状态

use crate::auth::TokenVerifier;
use crate::broker::SharedBroker;
use crate::config::AppConfig;
use crate::dispatch::DispatchService;
use crate::jobs::JobStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置（启动后只读）
    pub config: Arc<AppConfig>,
    /// 消息代理
    pub broker: SharedBroker,
    /// 任务分发
    pub dispatch: DispatchService,
    /// 令牌校验
    pub verifier: Arc<TokenVerifier>,
    /// 任务日志目录
    pub logs_dir: PathBuf,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(config: AppConfig, broker: SharedBroker) -> Self {
        let store = JobStore::new(
            broker.clone(),
            Duration::from_secs(config.broker.result_ttl_secs),
            config.broker.list_limit,
        );
        let dispatch = DispatchService::new(
            broker.clone(),
            store,
            config.storage.model_dir.clone(),
            config.broker.queue_name.clone(),
        );
        let verifier = Arc::new(TokenVerifier::new(&config.auth.jwt_secret));
        let logs_dir = config.storage.logs_dir();

        Self {
            config: Arc::new(config),
            broker,
            dispatch,
            verifier,
            logs_dir,
        }
    }
}
