//! WebSocket 路由处理器
//!
//! 连接建立后订阅 `job:{id}:channel`，把频道消息原样作为文本帧转发。
//! 不回放历史：连接之前发布的消息看不到，需要时通过日志接口获取

use crate::broker::{job_channel, SharedBroker, Subscription};
use crate::events::JobEvent;
use crate::server::extract::WsCaller;
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tracing::{debug, error, info};

/// 转发结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// 频道关闭
    ChannelClosed,
    /// 观察者断开
    ObserverClosed,
    /// 已转发 finish 事件
    Finished,
    /// 长时间无消息
    IdleTimeout,
    /// 发送失败
    SendFailed,
}

/// WS /ws/jobs/:id
///
/// 鉴权在升级之前完成，失败直接返回 403
pub async fn job_log_stream(
    WsCaller(caller): WsCaller,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let observer = caller
        .map(|identity| identity.subject)
        .unwrap_or_else(|| "anonymous".to_string());
    debug!("日志订阅请求: job={}, observer={}", job_id, observer);

    let broker = state.broker.clone();
    let idle = Duration::from_secs(state.config.server.ws_idle_timeout_secs);
    ws.on_upgrade(move |socket| handle_socket(socket, broker, job_id, idle))
}

/// 处理 WebSocket 连接
async fn handle_socket(socket: WebSocket, broker: SharedBroker, job_id: String, idle: Duration) {
    let channel = job_channel(&job_id);
    let (mut sender, receiver) = socket.split();

    let subscription = match broker.subscribe(&channel).await {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("订阅频道 {} 失败: {}", channel, e);
            let _ = sender.close().await;
            return;
        }
    };
    info!("WebSocket 已订阅: {}", channel);

    let end = pump(subscription, &mut sender, receiver, idle).await;

    // 订阅已在 pump 返回时释放
    let _ = sender.close().await;
    info!("WebSocket 连接已关闭: {} ({:?})", channel, end);
}

/// 把订阅消息转发到 sink，直到任一方结束
///
/// `incoming` 是观察者发来的消息，只用于感知断开，内容忽略
pub async fn pump<S, I, E>(
    mut subscription: Subscription,
    sink: &mut S,
    mut incoming: I,
    idle: Duration,
) -> RelayEnd
where
    S: Sink<Message> + Unpin,
    I: Stream<Item = Result<Message, E>> + Unpin,
{
    loop {
        tokio::select! {
            next = tokio::time::timeout(idle, subscription.next()) => match next {
                Err(_) => return RelayEnd::IdleTimeout,
                Ok(None) => return RelayEnd::ChannelClosed,
                Ok(Some(payload)) => {
                    let finished = JobEvent::is_finish_payload(&payload);
                    if sink.send(Message::Text(payload)).await.is_err() {
                        return RelayEnd::SendFailed;
                    }
                    if finished {
                        return RelayEnd::Finished;
                    }
                }
            },
            message = incoming.next() => match message {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                    return RelayEnd::ObserverClosed;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
