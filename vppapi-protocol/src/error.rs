//! Protocol error types and engine return codes.

use std::fmt;
use thiserror::Error;

/// Errors raised while encoding or decoding binary API messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("string field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("string field {field} exceeds {max} bytes")]
    StringTooLong { field: &'static str, max: usize },
}

/// Error code returned by the engine in the `retval` field of a reply.
///
/// Zero means success and never produces a `VppApiError`. Codes outside the
/// known table are kept as-is and reported as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VppApiError(i32);

impl VppApiError {
    pub const UNSPECIFIED: Self = Self(-1);
    pub const INVALID_SW_IF_INDEX: Self = Self(-2);
    pub const NO_SUCH_FIB: Self = Self(-3);
    pub const NO_SUCH_INNER_FIB: Self = Self(-4);
    pub const NO_SUCH_LABEL: Self = Self(-5);
    pub const NO_SUCH_ENTRY: Self = Self(-6);
    pub const INVALID_VALUE: Self = Self(-7);
    pub const INVALID_VALUE_2: Self = Self(-8);
    pub const UNIMPLEMENTED: Self = Self(-9);
    pub const INVALID_SW_IF_INDEX_2: Self = Self(-10);
    pub const SYSCALL_ERROR_1: Self = Self(-11);
    pub const SYSCALL_ERROR_2: Self = Self(-12);
    pub const SYSCALL_ERROR_3: Self = Self(-13);
    pub const FEATURE_DISABLED: Self = Self(-30);
    pub const INVALID_REGISTRATION: Self = Self(-31);
    pub const NEXT_HOP_NOT_IN_FIB: Self = Self(-50);
    pub const UNKNOWN_DESTINATION: Self = Self(-51);
    pub const NO_MATCHING_INTERFACE: Self = Self(-54);
    pub const INVALID_VLAN: Self = Self(-55);
    pub const VLAN_ALREADY_EXISTS: Self = Self(-56);
    pub const INVALID_SRC_ADDRESS: Self = Self(-57);
    pub const INVALID_DST_ADDRESS: Self = Self(-58);
    pub const ADDRESS_LENGTH_MISMATCH: Self = Self(-59);
    pub const ADDRESS_NOT_FOUND_FOR_INTERFACE: Self = Self(-60);
    pub const ADDRESS_NOT_DELETABLE: Self = Self(-61);
    pub const IP6_NOT_ENABLED: Self = Self(-62);
    pub const NO_SUCH_NODE: Self = Self(-63);
    pub const NO_SUCH_TABLE: Self = Self(-65);

    /// Converts a reply's `retval` into an error, or `None` for success.
    pub fn from_retval(retval: i32) -> Option<Self> {
        if retval == 0 {
            None
        } else {
            Some(Self(retval))
        }
    }

    /// Returns the raw return value.
    pub fn code(&self) -> i32 {
        self.0
    }

    /// Returns whether the code is part of the known table.
    pub fn is_known(&self) -> bool {
        self.description().is_some()
    }

    /// Returns the human-readable description for known codes.
    pub fn description(&self) -> Option<&'static str> {
        let text = match self.0 {
            -1 => "Unspecified Error",
            -2 => "Invalid sw_if_index",
            -3 => "No such FIB / VRF",
            -4 => "No such inner FIB / VRF",
            -5 => "No such label",
            -6 => "No such entry",
            -7 => "Invalid value",
            -8 => "Invalid value #2",
            -9 => "Unimplemented",
            -10 => "Invalid sw_if_index #2",
            -11 => "System call error #1",
            -12 => "System call error #2",
            -13 => "System call error #3",
            -30 => "Feature disabled by configuration",
            -31 => "Invalid registration",
            -50 => "Next hop not in FIB",
            -51 => "Unknown destination",
            -54 => "No matching interface for probe",
            -55 => "Invalid VLAN",
            -56 => "VLAN subif already exists",
            -57 => "Invalid src address",
            -58 => "Invalid dst address",
            -59 => "Address length mismatch",
            -60 => "Address not found for interface",
            -61 => "Address not deletable",
            -62 => "ip6 not enabled",
            -63 => "No such graph node",
            -65 => "No such table",
            _ => return None,
        };
        Some(text)
    }
}

impl fmt::Display for VppApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(text) => write!(f, "VPPApiError: {} ({})", text, self.0),
            None => write!(f, "VPPApiError: unknown error ({})", self.0),
        }
    }
}

impl std::error::Error for VppApiError {}
