//! 实时通道消息格式（JSON，`type` 字段区分）

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 客户端 → 服务端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth { token: String },
    Ping,
    LocationUpdate { data: Value },
}

/// 服务端 → 客户端；未知类型解析为 `Unknown`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LocationUpdate { data: Value },
    EtaUpdate { data: Value },
    Pong,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_on_the_wire() {
        let auth = ClientMessage::Auth { token: "tok".to_string() }.to_text().unwrap();
        assert_eq!(serde_json::from_str::<Value>(&auth).unwrap(), json!({"type": "auth", "token": "tok"}));
        assert_eq!(ClientMessage::Ping.to_text().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_server_messages_parse() {
        assert_eq!(ServerMessage::parse(r#"{"type":"pong"}"#).unwrap(), ServerMessage::Pong);
        assert_eq!(
            ServerMessage::parse(r#"{"type":"eta_update","data":{"minutes":7}}"#).unwrap(),
            ServerMessage::EtaUpdate { data: json!({"minutes": 7}) }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"broadcast_message","text":"hi"}"#).unwrap(),
            ServerMessage::Unknown
        );
        assert!(ServerMessage::parse("not json").is_err());
    }
}
