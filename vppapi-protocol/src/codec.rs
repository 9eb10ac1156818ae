//! Binary encoding of message headers plus checked field readers.
//!
//! Header layouts (all integers big-endian):
//!
//! ```text
//! request: | msg_id u16 | client_index u32 | context u32 | body ...
//! reply:   | msg_id u16 | context u32 | body ...
//! event:   | msg_id u16 | client_index u32 | body ...
//! other:   | msg_id u16 | body ...
//! ```

use crate::error::ProtocolError;
use crate::message::{Message, MessageType};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encodes and decodes whole messages (header + body).
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec;

impl Codec {
    /// Encodes `msg` under wire ID `msg_id`, stamping `context` into the
    /// header when the layout carries one.
    pub fn encode_msg(msg: &dyn Message, msg_id: u16, context: u32) -> Result<Bytes, ProtocolError> {
        let msg_type = msg.msg_type();
        let mut buf = BytesMut::with_capacity(msg_type.header_len() + 64);

        buf.put_u16(msg_id);
        match msg_type {
            MessageType::Request => {
                // client_index is filled in by the transport adapter
                buf.put_u32(0);
                buf.put_u32(context);
            }
            MessageType::Reply => buf.put_u32(context),
            MessageType::Event => buf.put_u32(0),
            MessageType::Other => {}
        }

        msg.encode_body(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes `data` into `msg`, skipping the header for its layout.
    pub fn decode_msg(data: &[u8], msg: &mut dyn Message) -> Result<(), ProtocolError> {
        let header_len = msg.msg_type().header_len();
        ensure(data, header_len)?;
        let mut body = &data[header_len..];
        msg.decode_body(&mut body)
    }

    /// Reads the wire ID from the first two bytes.
    pub fn decode_msg_id(data: &[u8]) -> Result<u16, ProtocolError> {
        ensure(data, 2)?;
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Extracts the context value. Layouts without a context yield zero.
    pub fn decode_msg_context(data: &[u8], msg_type: MessageType) -> Result<u32, ProtocolError> {
        let offset = match msg_type {
            MessageType::Request => 6,
            MessageType::Reply => 2,
            MessageType::Event | MessageType::Other => return Ok(0),
        };
        ensure(data, offset + 4)?;
        Ok(u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]))
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn ensure_remaining(buf: &&[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8(buf: &mut &[u8]) -> Result<u8, ProtocolError> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut &[u8]) -> Result<u16, ProtocolError> {
    ensure_remaining(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_i32(buf: &mut &[u8]) -> Result<i32, ProtocolError> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_u64(buf: &mut &[u8]) -> Result<u64, ProtocolError> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_u64())
}

/// Reads a fixed-size, NUL-padded string field.
pub fn get_string(buf: &mut &[u8], len: usize, field: &'static str) -> Result<String, ProtocolError> {
    ensure_remaining(buf, len)?;
    let raw = &buf[..len];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(len);
    let value = std::str::from_utf8(&raw[..end])
        .map_err(|_| ProtocolError::InvalidUtf8 { field })?
        .to_string();
    buf.advance(len);
    Ok(value)
}

/// Writes a fixed-size, NUL-padded string field.
pub fn put_string(
    buf: &mut BytesMut,
    value: &str,
    len: usize,
    field: &'static str,
) -> Result<(), ProtocolError> {
    let bytes = value.as_bytes();
    if bytes.len() > len {
        return Err(ProtocolError::StringTooLong { field, max: len });
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, len - bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ControlPing, ControlPingReply};

    #[test]
    fn test_request_header_layout() {
        let data = Codec::encode_msg(&ControlPing, 0x0102, 0xAABB_CCDD).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(&data[0..2], &[0x01, 0x02]);
        assert_eq!(&data[2..6], &[0, 0, 0, 0]);
        assert_eq!(&data[6..10], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_reply_header_layout() {
        let reply = ControlPingReply {
            retval: -1,
            client_index: 3,
            vpe_pid: 77,
        };
        let data = Codec::encode_msg(&reply, 17, 0x0002_0005).unwrap();
        assert_eq!(data.len(), 6 + 12);
        assert_eq!(Codec::decode_msg_id(&data).unwrap(), 17);
        assert_eq!(
            Codec::decode_msg_context(&data, MessageType::Reply).unwrap(),
            0x0002_0005
        );

        let mut decoded = ControlPingReply::default();
        Codec::decode_msg(&data, &mut decoded).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_request_context_offset() {
        let data = Codec::encode_msg(&ControlPing, 1, 42).unwrap();
        assert_eq!(
            Codec::decode_msg_context(&data, MessageType::Request).unwrap(),
            42
        );
    }

    #[test]
    fn test_event_and_other_have_no_context() {
        let data = [0u8, 5, 0, 0, 0, 9, 1, 2, 3];
        assert_eq!(
            Codec::decode_msg_context(&data, MessageType::Event).unwrap(),
            0
        );
        assert_eq!(
            Codec::decode_msg_context(&data, MessageType::Other).unwrap(),
            0
        );
    }

    #[test]
    fn test_truncated_reply() {
        let mut reply = ControlPingReply::default();
        let result = Codec::decode_msg(&[0, 1, 0, 0, 0, 1, 0xFF], &mut reply);
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));

        let result = Codec::decode_msg_context(&[0, 1, 0], MessageType::Reply);
        assert!(matches!(
            result,
            Err(ProtocolError::Truncated {
                needed: 6,
                available: 3
            })
        ));

        assert!(Codec::decode_msg_id(&[1]).is_err());
    }

    #[test]
    fn test_string_fields() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "eth0", 8, "name").unwrap();
        assert_eq!(buf.len(), 8);

        let mut slice = &buf[..];
        assert_eq!(get_string(&mut slice, 8, "name").unwrap(), "eth0");
        assert!(slice.is_empty());

        let result = put_string(&mut BytesMut::new(), "too-long-name", 4, "name");
        assert!(matches!(result, Err(ProtocolError::StringTooLong { max: 4, .. })));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let raw = [0xFFu8, 0xFE, 0, 0];
        let mut slice = &raw[..];
        let result = get_string(&mut slice, 4, "tag");
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidUtf8 { field: "tag" })
        ));
    }

    #[test]
    fn test_checked_integer_reads() {
        let raw = [0u8, 0, 0, 7, 0xFF];
        let mut slice = &raw[..];
        assert_eq!(get_u32(&mut slice).unwrap(), 7);
        assert_eq!(get_u8(&mut slice).unwrap(), 0xFF);
        assert!(get_u16(&mut slice).is_err());
        assert!(get_u64(&mut slice).is_err());
    }
}
