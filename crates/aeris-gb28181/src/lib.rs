pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod manscdp;
pub mod publisher;
pub mod sip;
pub mod subscription;

pub use channel::{Channel, ChannelRegistry};
pub use config::{Gb28181Config, TransportKind};
pub use error::{Error, Result};
pub use publisher::Gb28181Publisher;
pub use subscription::{Subscription, SubscriptionRegistry};
