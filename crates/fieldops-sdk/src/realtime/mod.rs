//! 实时通道：WebSocket 推送、心跳与重连

pub mod backoff;
pub mod channel;
pub mod protocol;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use channel::{ChannelStatus, RealtimeChannel};
pub use protocol::{ClientMessage, ServerMessage};
pub use transport::{InboundFrame, RealtimeConnection, RealtimeConnector, WsConnector};
