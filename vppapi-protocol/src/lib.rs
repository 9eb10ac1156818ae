//! # vppapi-protocol
//!
//! Wire-level contract for the engine's binary API.
//!
//! This crate provides:
//! - The `Message` trait implemented by generated message types
//! - Header encoding/decoding for request, reply and event layouts
//! - 32-bit request context packing and cyclic sequence ordering
//! - Engine return codes and protocol error types

pub mod codec;
pub mod context;
pub mod error;
pub mod message;

pub use codec::Codec;
pub use context::{compare_seq_nums, RequestContext, MAX_CHANNEL_ID, SEQ_WRAP_THRESHOLD};
pub use error::{ProtocolError, VppApiError};
pub use message::{message_key, ControlPing, ControlPingReply, Message, MessageType, Retval};
