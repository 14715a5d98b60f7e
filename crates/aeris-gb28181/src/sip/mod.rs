pub mod auth;
pub mod message;
pub mod session;
pub mod transport;

pub use auth::{DigestAuthenticator, DigestChallenge};
pub use message::{SipMessage, SipMethod, SipRequest, SipResponse};
pub use session::{RequestHandler, SipSession};
pub use transport::SipTransport;

/// GB28181 应用层 XML 消息内容类型
pub const MANSCDP_CONTENT_TYPE: &str = "Application/MANSCDP+xml";
