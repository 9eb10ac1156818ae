//! Message trait and the built-in control messages.
//!
//! Concrete message types are normally produced by a code generator from the
//! engine's API schema. The runtime only needs the narrow surface defined
//! here: identity (name + CRC), header kind, body encoding and an optional
//! return-value capability.

use crate::codec::{get_i32, get_u32};
use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use std::any::Any;
use std::fmt;

/// Header layout a message uses on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client request: `msg_id, client_index, context`.
    Request,
    /// Engine reply: `msg_id, context`.
    Reply,
    /// Unsolicited event: `msg_id, client_index`.
    Event,
    /// Anything else: `msg_id` only.
    Other,
}

impl MessageType {
    /// Size of the header preceding the message body.
    pub fn header_len(&self) -> usize {
        match self {
            MessageType::Request => 10,
            MessageType::Reply => 6,
            MessageType::Event => 6,
            MessageType::Other => 2,
        }
    }
}

/// A binary API message.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    /// Message name as declared in the API schema.
    fn name(&self) -> &'static str;

    /// Schema checksum of the message definition.
    fn crc(&self) -> &'static str;

    /// Header layout used on the wire.
    fn msg_type(&self) -> MessageType;

    /// API module the message belongs to. Used to scope reverse lookups.
    fn package(&self) -> &'static str {
        ""
    }

    /// Appends the message body (everything after the header).
    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Reads the message body, advancing `buf` past it.
    fn decode_body(&mut self, buf: &mut &[u8]) -> Result<(), ProtocolError>;

    /// Allocates a fresh, zero-valued instance of the same message type.
    fn new_instance(&self) -> Box<dyn Message>;

    /// Exposes the return-value field of replies that carry one.
    fn as_retval(&self) -> Option<&dyn Retval> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn Message {
    /// Downcasts a type-erased message to its concrete type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Returns the `name_crc` key identifying this message definition.
    pub fn key(&self) -> String {
        message_key(self.name(), self.crc())
    }
}

/// Replies that report an engine status code.
pub trait Retval {
    fn retval(&self) -> i32;
}

/// Builds the `name_crc` key used to resolve wire IDs.
pub fn message_key(name: &str, crc: &str) -> String {
    format!("{}_{}", name, crc)
}

/// Parameterless liveness probe. Also sent after every multi-part request to
/// delimit the end of the reply stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlPing;

impl ControlPing {
    pub const NAME: &'static str = "control_ping";
    pub const CRC: &'static str = "51077d14";
}

impl Message for ControlPing {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn crc(&self) -> &'static str {
        Self::CRC
    }

    fn msg_type(&self) -> MessageType {
        MessageType::Request
    }

    fn package(&self) -> &'static str {
        "memclnt"
    }

    fn encode_body(&self, _buf: &mut BytesMut) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn decode_body(&mut self, _buf: &mut &[u8]) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn new_instance(&self) -> Box<dyn Message> {
        Box::<Self>::default()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reply to [`ControlPing`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlPingReply {
    pub retval: i32,
    pub client_index: u32,
    pub vpe_pid: u32,
}

impl ControlPingReply {
    pub const NAME: &'static str = "control_ping_reply";
    pub const CRC: &'static str = "f6b0b8ca";
}

impl Message for ControlPingReply {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn crc(&self) -> &'static str {
        Self::CRC
    }

    fn msg_type(&self) -> MessageType {
        MessageType::Reply
    }

    fn package(&self) -> &'static str {
        "memclnt"
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_i32(self.retval);
        buf.put_u32(self.client_index);
        buf.put_u32(self.vpe_pid);
        Ok(())
    }

    fn decode_body(&mut self, buf: &mut &[u8]) -> Result<(), ProtocolError> {
        self.retval = get_i32(buf)?;
        self.client_index = get_u32(buf)?;
        self.vpe_pid = get_u32(buf)?;
        Ok(())
    }

    fn new_instance(&self) -> Box<dyn Message> {
        Box::<Self>::default()
    }

    fn as_retval(&self) -> Option<&dyn Retval> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Retval for ControlPingReply {
    fn retval(&self) -> i32 {
        self.retval
    }
}
