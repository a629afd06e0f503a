//! 任务频道事件
//!
//! 频道消息为 JSON 文本，按 `event` 字段区分：
//! ```text
//! {"event":"start","cmd":"huggingface-cli download org/model ..."}
//! {"event":"log","line":"Fetching 3 files: 100%"}
//! {"event":"error","error":"..."}
//! {"event":"finish","code":0}
//! ```
//! 网关原样转发，不解析（除了识别 finish 以结束转发）

use serde::{Deserialize, Serialize};

/// 任务事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// 开始执行，附带命令行（仅供展示）
    Start { cmd: String },
    /// 一行进程输出（不含换行符）
    Log { line: String },
    /// 内部错误（进程无法启动等）
    Error { error: String },
    /// 进程结束；被信号终止或未启动时 code 为 null
    Finish { code: Option<i32> },
}

impl JobEvent {
    /// 序列化为频道消息
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// 频道消息是否为 finish 事件
    pub fn is_finish_payload(payload: &str) -> bool {
        matches!(
            serde_json::from_str::<JobEvent>(payload),
            Ok(JobEvent::Finish { .. })
        )
    }
}
