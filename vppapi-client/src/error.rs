//! Client error types.

use crate::adapter::AdapterError;
use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;
use vppapi_protocol::{ProtocolError, VppApiError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("no free channel IDs")]
    ChannelIdsExhausted,

    #[error("no reply received within the timeout period {timeout:?} (seq_num={seq_num})")]
    Timeout { seq_num: u16, timeout: Duration },

    #[error("health check probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("missing binary API reply with sequence number: {seq_num}")]
    MissingReply { seq_num: u16 },

    #[error(
        "received unexpected message (seq_num={seq_num}), expected {expected} (ID {expected_id}), \
         but got {received} (ID {received_id}); check that the channel is not shared between tasks"
    )]
    UnexpectedReply {
        seq_num: u16,
        expected: String,
        expected_id: u16,
        received: String,
        received_id: u16,
    },

    #[error("multi-part reply received while a single reply was expected")]
    UnexpectedMultipart,

    #[error("message {name} with CRC {crc} is not compatible with the connected engine")]
    MessageIncompatible { name: String, crc: String },

    #[error("{} message(s) incompatible with the connected engine: {}", .messages.len(), .messages.join(", "))]
    IncompatibleMessages { messages: Vec<String> },

    #[error("unknown message ID {0}")]
    UnknownMessage(u16),

    #[error("{0}")]
    VppApi(#[from] VppApiError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Coarse classification of [`ClientError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The transport failed or the session is gone.
    Transport,
    /// Malformed, unexpected or incompatible messages.
    Protocol,
    /// A reply or probe did not arrive in time.
    Timing,
    /// A reply arrived for a later request than the one awaited.
    Ordering,
    /// The engine processed the request and returned a failure code.
    Engine,
    /// Local resources, configuration or cancellation.
    Resource,
}

impl ClientError {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Adapter(_)
            | ClientError::NotConnected
            | ClientError::ConnectionClosed
            | ClientError::ChannelClosed => ErrorKind::Transport,
            ClientError::Protocol(_)
            | ClientError::UnexpectedReply { .. }
            | ClientError::UnexpectedMultipart
            | ClientError::MessageIncompatible { .. }
            | ClientError::IncompatibleMessages { .. }
            | ClientError::UnknownMessage(_) => ErrorKind::Protocol,
            ClientError::Timeout { .. } | ClientError::ProbeTimeout(_) => ErrorKind::Timing,
            ClientError::MissingReply { .. } => ErrorKind::Ordering,
            ClientError::VppApi(_) => ErrorKind::Engine,
            ClientError::ChannelIdsExhausted | ClientError::Cancelled | ClientError::Config(_) => {
                ErrorKind::Resource
            }
        }
    }

    /// Returns whether this error is a reply or probe timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timing
    }

    /// Returns the engine return code, if the engine rejected the request.
    pub fn vpp_api_error(&self) -> Option<VppApiError> {
        match self {
            ClientError::VppApi(err) => Some(*err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kind() {
        let err = ClientError::Timeout {
            seq_num: 3,
            timeout: Duration::from_millis(5),
        };
        assert!(err.is_timeout());
        assert_eq!(err.kind(), ErrorKind::Timing);
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_missing_reply_names_sequence() {
        let err = ClientError::MissingReply { seq_num: 42 };
        assert_eq!(err.kind(), ErrorKind::Ordering);
        assert!(!err.is_timeout());
        assert!(err.to_string().ends_with("42"));
    }

    #[test]
    fn test_unexpected_reply_names_both_types() {
        let err = ClientError::UnexpectedReply {
            seq_num: 1,
            expected: "control_ping_reply".to_string(),
            expected_id: 2,
            received: "show_version_reply_c919bde1".to_string(),
            received_id: 9,
        };
        let msg = err.to_string();
        assert!(msg.contains("control_ping_reply"));
        assert!(msg.contains("show_version_reply_c919bde1"));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_engine_error() {
        let err = ClientError::from(VppApiError::NO_SUCH_ENTRY);
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert_eq!(err.vpp_api_error(), Some(VppApiError::NO_SUCH_ENTRY));
        assert!(err.to_string().contains("No such entry"));
    }

    #[test]
    fn test_incompatible_messages_lists_all() {
        let err = ClientError::IncompatibleMessages {
            messages: vec!["a_1".to_string(), "b_2".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 message(s)"));
        assert!(msg.contains("a_1, b_2"));
    }

    #[test]
    fn test_transport_kind() {
        assert_eq!(ClientError::NotConnected.kind(), ErrorKind::Transport);
        assert_eq!(
            ClientError::Adapter(AdapterError::NotConnected).kind(),
            ErrorKind::Transport
        );
    }
}
