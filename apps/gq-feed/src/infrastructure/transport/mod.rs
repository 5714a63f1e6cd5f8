//! Transport Adapters
//!
//! Implementations of the [`Transport`](crate::application::ports::Transport)
//! port:
//!
//! - `GatewayTransport`: WebSocket connection per stream to the GQ gateway
//! - `ChannelTransport`: In-process broadcast channels fed by producers

mod channel;
mod gateway;

pub use channel::{ChannelPublisher, ChannelTransport};
pub use gateway::{GatewayConfig, GatewayTransport, SubscribeRequest};
