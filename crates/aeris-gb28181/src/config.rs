// GB28181 发布器配置
// 由核心引擎在进程启动时装配，会话生命周期内不可变

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// 信令传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl Default for TransportKind {
    fn default() -> Self {
        Self::Udp
    }
}

impl TransportKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "udp" => Some(Self::Udp),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }

    /// Via 头部中的传输标识
    pub fn via_token(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

/// GB28181 发布器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gb28181Config {
    /// 本网关设备 ID（20 位国标编码）
    pub device_id: String,

    /// 本地监听地址
    pub local_ip: String,

    /// 本地监听端口
    #[serde(default)]
    pub local_port: u16,

    /// 平台 ID（20 位国标编码）
    pub platform_id: String,

    /// 平台地址
    pub platform_ip: String,

    /// 平台端口
    #[serde(default)]
    pub platform_port: u16,

    /// SIP 域；为空时取平台 ID 前 10 位
    #[serde(default)]
    pub sip_domain: String,

    /// 鉴权用户名；为空时取设备 ID
    #[serde(default)]
    pub username: String,

    /// 鉴权密码
    #[serde(default)]
    pub password: String,

    /// 传输方式
    #[serde(default)]
    pub transport: TransportKind,

    /// 注册有效期（秒）
    #[serde(default)]
    pub register_expires: u32,

    /// 心跳间隔（秒）
    #[serde(default)]
    pub heartbeat_interval: u64,

    /// 单设备位置上报最小间隔（秒）
    #[serde(default)]
    pub position_interval: u64,

    /// 通道保活超时（秒），超时未更新的通道置为离线
    #[serde(default)]
    pub channel_timeout: u64,

    /// 网关对外展示名称
    #[serde(default)]
    pub device_name: String,
}

impl Gb28181Config {
    /// 校验必填项并补齐默认值
    pub fn validate(&mut self) -> Result<()> {
        validate_gb_id("device_id", &self.device_id)?;
        validate_gb_id("platform_id", &self.platform_id)?;

        if self.local_ip.is_empty() {
            return Err(Error::Config("local_ip must not be empty".to_string()));
        }
        if self.platform_ip.is_empty() {
            return Err(Error::Config("platform_ip must not be empty".to_string()));
        }

        if self.platform_port == 0 {
            self.platform_port = 5060;
        }
        if self.sip_domain.is_empty() {
            self.sip_domain = self.platform_id[..10].to_string();
        }
        if self.username.is_empty() {
            self.username = self.device_id.clone();
        }
        if self.register_expires == 0 {
            self.register_expires = 3600;
        }
        if self.heartbeat_interval == 0 {
            self.heartbeat_interval = 60;
        }
        if self.position_interval == 0 {
            self.position_interval = 5;
        }
        if self.channel_timeout == 0 {
            self.channel_timeout = 180;
        }
        if self.device_name.is_empty() {
            self.device_name = "AERIS UAV Gateway".to_string();
        }

        Ok(())
    }

    /// 行政区划编码（设备 ID 前 6 位）
    pub fn region_code(&self) -> &str {
        &self.device_id[..6]
    }
}

fn validate_gb_id(field: &str, id: &str) -> Result<()> {
    if id.len() != 20 || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Config(format!(
            "{} must be a 20-digit GB28181 identifier, got {:?}",
            field, id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Gb28181Config {
        Gb28181Config {
            device_id: "34020000001110000001".to_string(),
            local_ip: "192.168.1.10".to_string(),
            local_port: 5061,
            platform_id: "34020000002000000001".to_string(),
            platform_ip: "192.168.1.1".to_string(),
            platform_port: 0,
            sip_domain: String::new(),
            username: String::new(),
            password: "telemetry123".to_string(),
            transport: TransportKind::default(),
            register_expires: 0,
            heartbeat_interval: 0,
            position_interval: 0,
            channel_timeout: 0,
            device_name: String::new(),
        }
    }

    #[test]
    fn test_validate_applies_defaults() {
        let mut config = base_config();
        config.validate().unwrap();

        assert_eq!(config.platform_port, 5060);
        assert_eq!(config.sip_domain, "3402000000");
        assert_eq!(config.username, "34020000001110000001");
        assert_eq!(config.register_expires, 3600);
        assert_eq!(config.heartbeat_interval, 60);
        assert_eq!(config.position_interval, 5);
        assert_eq!(config.channel_timeout, 180);
        assert_eq!(config.transport, TransportKind::Udp);
    }

    #[test]
    fn test_validate_rejects_bad_device_id() {
        let mut config = base_config();
        config.device_id = "12345".to_string();
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.device_id = "3402000000111000000X".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_region_code() {
        let mut config = base_config();
        config.validate().unwrap();
        assert_eq!(config.region_code(), "340200");
    }

    #[test]
    fn test_transport_kind() {
        assert_eq!(TransportKind::from_str("UDP"), Some(TransportKind::Udp));
        assert_eq!(TransportKind::from_str("tcp"), Some(TransportKind::Tcp));
        assert_eq!(TransportKind::from_str("sctp"), None);
        assert_eq!(TransportKind::Udp.via_token(), "UDP");
        assert_eq!(TransportKind::Tcp.as_str(), "tcp");
    }
}
