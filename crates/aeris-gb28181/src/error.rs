use thiserror::Error;

/// GB28181 发布器统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Not registered with platform")]
    NotRegistered,

    #[error("Publisher not running")]
    NotRunning,

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Transaction timeout: {0}")]
    Timeout(String),

    #[error("Request rejected with status {0}")]
    Rejected(u16),

    #[error("SIP parse error: {0}")]
    Parse(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
