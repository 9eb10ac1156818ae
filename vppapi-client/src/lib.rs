//! # vppapi-client
//!
//! Client runtime for the engine's binary API.
//!
//! This crate provides:
//! - Connections multiplexing many logical channels over one transport
//! - Request/reply correlation with multi-part dump support
//! - Background health checking and reconnection
//! - Notification subscriptions, direct streams and call tracing

pub mod adapter;
pub mod channel;
pub mod config;
pub mod connection;
mod dispatch;
pub mod error;
pub mod events;
mod health;
mod pool;
mod registry;
pub mod stream;
pub mod subscription;
pub mod trace;

#[cfg(test)]
mod test_messages;

pub use adapter::{AdapterError, MockAdapter, MsgCallback, VppApi};
pub use channel::{Channel, MultiRequestCtx, RequestCtx};
pub use config::{ConfigError, ConnectionConfig};
pub use connection::Connection;
pub use error::{ClientError, ErrorKind};
pub use events::{ConnectionEvent, ConnectionState};
pub use stream::{cancel_pair, CancelHandle, CancelSignal, Stream, StreamOptions};
pub use subscription::SubscriptionHandle;
pub use trace::{Record, Trace};
