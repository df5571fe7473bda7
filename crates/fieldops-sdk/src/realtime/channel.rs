//! 实时推送通道
//!
//! 后台任务负责：连接 → 发送 auth → 心跳 select 循环 → 断线后按退避重连。
//! ping 之后 `pong_timeout` 内没有任何入站帧即判定对端失联，主动关闭并重连。
//! 重连次数耗尽后发出唯一一次 `connection_failed`，任务结束。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{FieldOpsError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::realtime::backoff::ReconnectBackoff;
use crate::realtime::protocol::{ClientMessage, ServerMessage};
use crate::realtime::transport::{InboundFrame, RealtimeConnection, RealtimeConnector};
use crate::sync::AuthProvider;
use crate::utils::Clock;

const OUTBOUND_BUFFER: usize = 64;

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接（auth 已发送）
    Connected,
    /// 重连中
    Reconnecting,
    /// 重连次数耗尽
    Failed,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Disconnected => write!(f, "未连接"),
            ChannelStatus::Connecting => write!(f, "连接中"),
            ChannelStatus::Connected => write!(f, "已连接"),
            ChannelStatus::Reconnecting => write!(f, "重连中"),
            ChannelStatus::Failed => write!(f, "连接失败"),
        }
    }
}

#[derive(Debug)]
struct ChannelShared {
    status: Mutex<ChannelStatus>,
    events: Arc<EventManager>,
    clock: Arc<dyn Clock>,
}

impl ChannelShared {
    fn set_status(&self, new_state: ChannelStatus) {
        let old_state = {
            let mut status = self.status.lock();
            if *status == new_state {
                return;
            }
            std::mem::replace(&mut *status, new_state)
        };
        info!("实时通道状态: {} → {}", old_state, new_state);
        self.events.emit(SDKEvent::RealtimeStateChanged {
            old_state,
            new_state,
            timestamp: self.clock.now_ms(),
        });
    }

    fn dispatch(&self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("忽略无法解析的实时消息: {}", e);
                return;
            }
        };
        let timestamp = self.clock.now_ms();
        match message {
            ServerMessage::LocationUpdate { data } => {
                self.events.emit(SDKEvent::LocationUpdate { data, timestamp })
            }
            ServerMessage::EtaUpdate { data } => self.events.emit(SDKEvent::EtaUpdate { data, timestamp }),
            ServerMessage::Pong => debug!("收到 pong"),
            ServerMessage::Unknown => debug!("忽略未知类型的实时消息"),
        }
    }
}

enum SessionEnd {
    /// 连接断开或对端失联，需要重连
    Lost,
    /// 通道已被关闭
    Stopped,
}

struct ChannelDriver {
    url: String,
    config: RealtimeConfig,
    connector: Arc<dyn RealtimeConnector>,
    auth: Arc<dyn AuthProvider>,
    shared: Arc<ChannelShared>,
    outbound: mpsc::Receiver<ClientMessage>,
}

async fn send_message(conn: &mut dyn RealtimeConnection, message: &ClientMessage) -> Result<()> {
    let text = message.to_text()?;
    conn.send_text(text).await
}

impl ChannelDriver {
    async fn run(mut self) {
        let mut backoff = ReconnectBackoff::new(&self.config);
        loop {
            if backoff.attempts() == 0 {
                self.shared.set_status(ChannelStatus::Connecting);
            }

            match self.connect_and_auth().await {
                Ok(mut conn) => {
                    backoff.reset();
                    self.shared.set_status(ChannelStatus::Connected);
                    match self.run_session(conn.as_mut()).await {
                        SessionEnd::Stopped => {
                            conn.close().await;
                            self.shared.set_status(ChannelStatus::Disconnected);
                            return;
                        }
                        SessionEnd::Lost => warn!("实时通道连接已断开: {}", self.url),
                    }
                }
                Err(e) => warn!("实时通道连接失败: {}", e),
            }

            match backoff.next_delay() {
                Some(delay) => {
                    self.shared.set_status(ChannelStatus::Reconnecting);
                    sleep(delay).await;
                }
                None => {
                    let attempts = backoff.attempts();
                    error!("❌ 实时通道重连 {} 次均失败，停止重连", attempts);
                    self.shared.set_status(ChannelStatus::Failed);
                    self.shared.events.emit(SDKEvent::ConnectionFailed {
                        attempts,
                        timestamp: self.shared.clock.now_ms(),
                    });
                    return;
                }
            }
        }
    }

    async fn connect_and_auth(&self) -> Result<Box<dyn RealtimeConnection>> {
        let mut conn = self.connector.connect(&self.url).await?;
        match self.auth.access_token() {
            Some(token) => send_message(conn.as_mut(), &ClientMessage::Auth { token }).await?,
            None => warn!("没有访问令牌，实时通道未认证"),
        }
        info!("✅ 实时通道已连接: {}", self.url);
        Ok(conn)
    }

    async fn run_session(&mut self, conn: &mut dyn RealtimeConnection) -> SessionEnd {
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let pong_timeout = Duration::from_secs(self.config.pong_timeout_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                frame = conn.recv() => match frame {
                    Some(Ok(frame)) => {
                        pong_deadline = None;
                        if let InboundFrame::Text(text) = frame {
                            self.shared.dispatch(&text);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("实时通道读取失败: {}", e);
                        return SessionEnd::Lost;
                    }
                    None => {
                        info!("实时通道被对端关闭");
                        return SessionEnd::Lost;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = send_message(conn, &ClientMessage::Ping).await {
                        warn!("心跳发送失败: {}", e);
                        return SessionEnd::Lost;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + pong_timeout);
                    }
                },
                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    warn!("{:?} 内未收到任何入站帧，判定对端失联", pong_timeout);
                    conn.close().await;
                    return SessionEnd::Lost;
                },
                message = self.outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = send_message(conn, &message).await {
                            warn!("实时消息发送失败: {}", e);
                            return SessionEnd::Lost;
                        }
                    }
                    None => return SessionEnd::Stopped,
                },
            }
        }
    }
}

/// 实时通道
#[derive(Debug)]
pub struct RealtimeChannel {
    url: String,
    config: RealtimeConfig,
    connector: Arc<dyn RealtimeConnector>,
    auth: Arc<dyn AuthProvider>,
    shared: Arc<ChannelShared>,
    outbound: Mutex<Option<mpsc::Sender<ClientMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(
        url: impl Into<String>,
        config: RealtimeConfig,
        connector: Arc<dyn RealtimeConnector>,
        auth: Arc<dyn AuthProvider>,
        events: Arc<EventManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            url: url.into(),
            config,
            connector,
            auth,
            shared: Arc::new(ChannelShared {
                status: Mutex::new(ChannelStatus::Disconnected),
                events,
                clock,
            }),
            outbound: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// 启动后台连接任务；已在运行时不做任何事
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("实时通道已在运行");
            return;
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        *self.outbound.lock() = Some(tx);
        let driver = ChannelDriver {
            url: self.url.clone(),
            config: self.config.clone(),
            connector: self.connector.clone(),
            auth: self.auth.clone(),
            shared: self.shared.clone(),
            outbound: rx,
        };
        *task = Some(tokio::spawn(driver.run()));
    }

    pub fn stop(&self) {
        self.outbound.lock().take();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        if self.status() != ChannelStatus::Failed {
            self.shared.set_status(ChannelStatus::Disconnected);
        }
    }

    pub fn status(&self) -> ChannelStatus {
        *self.shared.status.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ChannelStatus::Connected
    }

    /// 广播一条位置更新；未连接时返回 `NotConnected`
    pub fn send_location(&self, data: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(FieldOpsError::NotConnected);
        }
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(FieldOpsError::NotConnected)?;
        sender
            .try_send(ClientMessage::LocationUpdate { data })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => FieldOpsError::Network("实时发送队列已满".to_string()),
                mpsc::error::TrySendError::Closed(_) => FieldOpsError::NotConnected,
            })
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
