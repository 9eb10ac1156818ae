//! Request context packing and sequence number ordering.
//!
//! Every request carries a 32-bit context that the engine echoes back in its
//! replies. The runtime packs the originating channel, a multi-part flag and
//! the per-channel sequence number into it:
//!
//! ```text
//!  31                 17   16   15                              0
//! +---------------------+-----+---------------------------------+
//! |  channel_id (15)    |  M  |         seq_num (16)            |
//! +---------------------+-----+---------------------------------+
//! ```

use std::cmp::Ordering;

/// Largest usable channel ID (15 bits).
pub const MAX_CHANNEL_ID: u16 = 0x7FFF;

/// Half of the sequence number space; distances at or beyond it wrap.
pub const SEQ_WRAP_THRESHOLD: u16 = 0x8000;

const MULTIPART_BIT: u32 = 1 << 16;

/// Unpacked request context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestContext {
    pub channel_id: u16,
    pub multipart: bool,
    pub seq_num: u16,
}

impl RequestContext {
    pub fn new(channel_id: u16, multipart: bool, seq_num: u16) -> Self {
        Self {
            channel_id,
            multipart,
            seq_num,
        }
    }

    /// Packs the context into its wire form. Channel IDs are truncated to
    /// 15 bits.
    pub fn pack(&self) -> u32 {
        let mut context = u32::from(self.channel_id & MAX_CHANNEL_ID) << 17;
        if self.multipart {
            context |= MULTIPART_BIT;
        }
        context | u32::from(self.seq_num)
    }

    pub fn unpack(context: u32) -> Self {
        Self {
            channel_id: ((context >> 17) as u16) & MAX_CHANNEL_ID,
            multipart: context & MULTIPART_BIT != 0,
            seq_num: (context & 0xFFFF) as u16,
        }
    }
}

/// Compares two sequence numbers on the 16-bit ring.
///
/// `Less` means `a` was issued before `b`. The shorter of the two cyclic
/// distances decides; a forward distance of [`SEQ_WRAP_THRESHOLD`] or more is
/// treated as `b` lying behind `a`.
pub fn compare_seq_nums(a: u16, b: u16) -> Ordering {
    let dist = b.wrapping_sub(a);
    if dist == 0 {
        Ordering::Equal
    } else if dist < SEQ_WRAP_THRESHOLD {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}
