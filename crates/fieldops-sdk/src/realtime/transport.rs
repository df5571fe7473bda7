//! 实时通道传输层：trait 抽象 + tokio-tungstenite WebSocket 实现

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::fmt::Debug;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::RealtimeConfig;
use crate::error::{FieldOpsError, Result};

/// 入站帧；非文本帧只用于判断对端存活
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Other,
}

#[async_trait]
pub trait RealtimeConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// 下一帧；None 表示连接已关闭
    async fn recv(&mut self) -> Option<Result<InboundFrame>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait RealtimeConnector: Debug + Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn RealtimeConnection>>;
}

/// WebSocket 连接器
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(config.connect_timeout())
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[async_trait]
impl RealtimeConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn RealtimeConnection>> {
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| FieldOpsError::Network(format!("WebSocket 连接超时: {}", url)))?
            .map_err(|e| FieldOpsError::Network(format!("WebSocket 连接失败: {}", e)))?;
        debug!("WebSocket 握手完成: {} (status {})", url, response.status());
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FieldOpsError::Network(format!("WebSocket 发送失败: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame>> {
        match self.stream.next().await? {
            Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text))),
            Ok(Message::Close(_)) => None,
            // Ping 的 Pong 由 tungstenite 在下次写入时自动回复
            Ok(_) => Some(Ok(InboundFrame::Other)),
            Err(e) => Some(Err(FieldOpsError::Network(format!("WebSocket 读取失败: {}", e)))),
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
