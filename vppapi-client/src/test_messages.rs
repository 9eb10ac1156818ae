//! Hand-written messages used by the runtime tests.

use bytes::{BufMut, BytesMut};
use std::any::Any;
use std::sync::Arc;
use vppapi_protocol::codec::{get_i32, get_string, get_u32, put_string};
use vppapi_protocol::{Message, MessageType, ProtocolError, Retval};

/// Prototypes of every message defined here.
pub fn all_messages() -> Vec<Arc<dyn Message>> {
    vec![
        Arc::new(ShowVersion),
        Arc::new(ShowVersionReply::default()),
        Arc::new(SwInterfaceDump::default()),
        Arc::new(SwInterfaceDetails::default()),
        Arc::new(SwInterfaceSetFlags::default()),
        Arc::new(SwInterfaceSetFlagsReply::default()),
        Arc::new(SwInterfaceEvent::default()),
    ]
}

macro_rules! message_identity {
    ($ty:ty, $name:expr, $crc:expr, $kind:expr, $package:expr) => {
        fn name(&self) -> &'static str {
            $name
        }

        fn crc(&self) -> &'static str {
            $crc
        }

        fn msg_type(&self) -> MessageType {
            $kind
        }

        fn package(&self) -> &'static str {
            $package
        }

        fn new_instance(&self) -> Box<dyn Message> {
            Box::<$ty>::default()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShowVersion;

impl Message for ShowVersion {
    message_identity!(ShowVersion, "show_version", "51077d14", MessageType::Request, "vpe");

    fn encode_body(&self, _buf: &mut BytesMut) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn decode_body(&mut self, _buf: &mut &[u8]) -> Result<(), ProtocolError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShowVersionReply {
    pub retval: i32,
    pub program: String,
    pub version: String,
}

impl Message for ShowVersionReply {
    message_identity!(ShowVersionReply, "show_version_reply", "c919bde1", MessageType::Reply, "vpe");

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_i32(self.retval);
        put_string(buf, &self.program, 32, "program")?;
        put_string(buf, &self.version, 32, "version")
    }

    fn decode_body(&mut self, buf: &mut &[u8]) -> Result<(), ProtocolError> {
        self.retval = get_i32(buf)?;
        self.program = get_string(buf, 32, "program")?;
        self.version = get_string(buf, 32, "version")?;
        Ok(())
    }

    fn as_retval(&self) -> Option<&dyn Retval> {
        Some(self)
    }
}

impl Retval for ShowVersionReply {
    fn retval(&self) -> i32 {
        self.retval
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwInterfaceDump {
    pub sw_if_index: u32,
}

impl Message for SwInterfaceDump {
    message_identity!(SwInterfaceDump, "sw_interface_dump", "aa610c27", MessageType::Request, "interface");

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.sw_if_index);
        Ok(())
    }

    fn decode_body(&mut self, buf: &mut &[u8]) -> Result<(), ProtocolError> {
        self.sw_if_index = get_u32(buf)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwInterfaceDetails {
    pub sw_if_index: u32,
    pub interface_name: String,
}

impl Message for SwInterfaceDetails {
    message_identity!(SwInterfaceDetails, "sw_interface_details", "17b69fa2", MessageType::Reply, "interface");

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.sw_if_index);
        put_string(buf, &self.interface_name, 64, "interface_name")
    }

    fn decode_body(&mut self, buf: &mut &[u8]) -> Result<(), ProtocolError> {
        self.sw_if_index = get_u32(buf)?;
        self.interface_name = get_string(buf, 64, "interface_name")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwInterfaceSetFlags {
    pub sw_if_index: u32,
    pub flags: u32,
}

impl Message for SwInterfaceSetFlags {
    message_identity!(SwInterfaceSetFlags, "sw_interface_set_flags", "6a2b491a", MessageType::Request, "interface");

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.sw_if_index);
        buf.put_u32(self.flags);
        Ok(())
    }

    fn decode_body(&mut self, buf: &mut &[u8]) -> Result<(), ProtocolError> {
        self.sw_if_index = get_u32(buf)?;
        self.flags = get_u32(buf)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwInterfaceSetFlagsReply {
    pub retval: i32,
}

impl Message for SwInterfaceSetFlagsReply {
    message_identity!(SwInterfaceSetFlagsReply, "sw_interface_set_flags_reply", "e8d4e804", MessageType::Reply, "interface");

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_i32(self.retval);
        Ok(())
    }

    fn decode_body(&mut self, buf: &mut &[u8]) -> Result<(), ProtocolError> {
        self.retval = get_i32(buf)?;
        Ok(())
    }

    fn as_retval(&self) -> Option<&dyn Retval> {
        Some(self)
    }
}

impl Retval for SwInterfaceSetFlagsReply {
    fn retval(&self) -> i32 {
        self.retval
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwInterfaceEvent {
    pub pid: u32,
    pub sw_if_index: u32,
    pub flags: u32,
}

impl Message for SwInterfaceEvent {
    message_identity!(SwInterfaceEvent, "sw_interface_event", "2d3d95a7", MessageType::Event, "interface");

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.pid);
        buf.put_u32(self.sw_if_index);
        buf.put_u32(self.flags);
        Ok(())
    }

    fn decode_body(&mut self, buf: &mut &[u8]) -> Result<(), ProtocolError> {
        self.pid = get_u32(buf)?;
        self.sw_if_index = get_u32(buf)?;
        self.flags = get_u32(buf)?;
        Ok(())
    }
}
