// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire layouts shared with the opposite endpoint: the ring control block and
//! the framing around each packet.

use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Rings are sized in 4KB pages, preceded by a 4KB control page.
pub const PAGE_SIZE: usize = 4096;

/// The number of 32-bit words of the control page that the transport uses.
pub const CONTROL_WORD_COUNT: usize = 32;

const WRITE_INDEX: usize = 0;
const READ_INDEX: usize = 1;
const INTERRUPT_MASK: usize = 2;
const PENDING_SEND_SIZE: usize = 3;
const FEATURE_BITS: usize = 16;

/// Set in the feature bits by a producer that honors `pending_send_size`.
pub const FEATURE_SUPPORTS_PENDING_SEND_SIZE: u32 = 1;

/// The control words at the start of a ring's control page.
///
/// The page is shared with the opposite endpoint, so every word is an atomic.
/// The producer owns the write index and the consumer owns the read index.
/// Index loads that precede payload reads use `Acquire`, index stores that
/// follow payload writes use at least `Release`. A store that is followed by a
/// load of the other endpoint's signaling word (interrupt mask or pending send
/// size) is `SeqCst`, so the two endpoints cannot both miss each other.
#[derive(Copy, Clone)]
pub struct Control<'a>(&'a [AtomicU32; CONTROL_WORD_COUNT]);

impl<'a> Control<'a> {
    pub fn new(words: &'a [AtomicU32; CONTROL_WORD_COUNT]) -> Self {
        Self(words)
    }

    /// Byte offset in the data region where the producer writes next.
    pub fn write_index(&self) -> &'a AtomicU32 {
        &self.0[WRITE_INDEX]
    }

    /// Byte offset in the data region where the consumer reads next.
    pub fn read_index(&self) -> &'a AtomicU32 {
        &self.0[READ_INDEX]
    }

    /// Non-zero while the consumer does not want empty-to-non-empty signals.
    pub fn interrupt_mask(&self) -> &'a AtomicU32 {
        &self.0[INTERRUPT_MASK]
    }

    /// The free byte count the producer is waiting for, or zero.
    pub fn pending_send_size(&self) -> &'a AtomicU32 {
        &self.0[PENDING_SEND_SIZE]
    }

    pub fn feature_bits(&self) -> &'a AtomicU32 {
        &self.0[FEATURE_BITS]
    }
}

impl Debug for Control<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let load = |word: &AtomicU32| word.load(Ordering::Relaxed);
        f.debug_struct("Control")
            .field("write_index", &load(self.write_index()))
            .field("read_index", &load(self.read_index()))
            .field("interrupt_mask", &load(self.interrupt_mask()))
            .field("pending_send_size", &load(self.pending_send_size()))
            .field("feature_bits", &load(self.feature_bits()))
            .finish()
    }
}

pub const PACKET_TYPE_IN_BAND: u16 = 0x6;
pub const PACKET_TYPE_TRANSFER_PAGES: u16 = 0x7;
pub const PACKET_TYPE_GPA_DIRECT: u16 = 0x9;
pub const PACKET_TYPE_CANCEL: u16 = 0xa;
pub const PACKET_TYPE_COMPLETION: u16 = 0xb;

pub const PACKET_FLAG_COMPLETION_REQUESTED: u16 = 1;

/// The 16-byte header at the start of every packet. Offsets and lengths are
/// in units of 8 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct PacketDescriptor {
    pub packet_type: u16,
    pub data_offset8: u16,
    pub length8: u16,
    pub flags: u16,
    pub transaction_id: u64,
}

/// Follows the descriptor of a GPA direct packet, before the range list.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpaDirectHeader {
    // Not zeroed by every sender.
    pub reserved: u32,
    pub range_count: u32,
}

/// Follows the descriptor of a transfer page packet, before the range list.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TransferPageHeader {
    pub transfer_page_set_id: u16,
    // Not zeroed by every sender.
    pub reserved: u16,
    pub range_count: u32,
}

/// A byte range within a transfer page set.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TransferPageRange {
    pub byte_count: u32,
    pub byte_offset: u32,
}

/// Trails every packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Footer {
    pub reserved: u32,
    /// The ring offset of the packet's descriptor.
    pub offset: u32,
}
