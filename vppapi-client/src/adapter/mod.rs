//! Transport adapter interface.
//!
//! An adapter owns the physical link to the engine (a socket, a shared
//! memory ring). The runtime only ever talks to it through [`VppApi`]; how
//! the link is opened is up to the implementation.

pub mod mock;

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub use mock::{MockAdapter, MsgWithContext, ReplyHandler, SentMessage};

/// Inbound frame callback: `(msg_id, raw message including header)`.
///
/// Invoked from the adapter's receive path. Implementations must not block
/// in it.
pub type MsgCallback = Arc<dyn Fn(u16, Bytes) + Send + Sync>;

/// Adapter errors.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter not connected")]
    NotConnected,

    #[error("unknown message: {name}_{crc}")]
    UnknownMessage { name: String, crc: String },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binary API transport.
///
/// Methods are synchronous; the runtime calls the potentially slow ones
/// (`connect`, `wait_ready`) from a blocking task.
pub trait VppApi: Send + Sync + 'static {
    /// Opens the session with the engine.
    fn connect(&self) -> Result<(), AdapterError>;

    /// Closes the session. Must be safe to call when not connected.
    fn disconnect(&self) -> Result<(), AdapterError>;

    /// Blocks until the engine is ready to accept a session.
    fn wait_ready(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Installs the callback receiving every inbound message.
    fn set_msg_callback(&self, callback: MsgCallback);

    /// Transmits one encoded message. `context` is passed through unmodified.
    fn send_msg(&self, context: u32, data: Bytes) -> Result<(), AdapterError>;

    /// Resolves the wire ID of a message by name and CRC.
    fn get_msg_id(&self, name: &str, crc: &str) -> Result<u16, AdapterError>;
}
