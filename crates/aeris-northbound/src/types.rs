use serde::{Deserialize, Serialize};

/// 北向发布通道类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NorthboundKind {
    Gb28181,
    Mqtt,
    Http,
    WebSocket,
}

impl NorthboundKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gb28181" | "gb-28181" => Some(Self::Gb28181),
            "mqtt" => Some(Self::Mqtt),
            "http" | "https" => Some(Self::Http),
            "websocket" | "ws" => Some(Self::WebSocket),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gb28181 => "gb28181",
            Self::Mqtt => "mqtt",
            Self::Http => "http",
            Self::WebSocket => "websocket",
        }
    }
}
