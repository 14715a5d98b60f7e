pub mod publisher;
pub mod types;

pub use publisher::NorthboundPublisher;
pub use types::NorthboundKind;
