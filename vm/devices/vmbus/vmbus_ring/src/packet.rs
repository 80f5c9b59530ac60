// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packet framing: the descriptor, the extended header of packets that
//! reference memory outside the ring, padding and the footer.

use crate::Error;
use crate::gparange::GpaRange;
use crate::gparange::GpnList;
use crate::gparange::MultiPagedRangeBuf;
use crate::gparange::PagedRange;
use crate::mem::RingMem;
use crate::protocol::*;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

pub(crate) const DESCRIPTOR_SIZE: usize = size_of::<PacketDescriptor>();
/// The descriptor followed by a GPA direct or transfer page header.
const EXTENDED_HEADER_SIZE: usize = DESCRIPTOR_SIZE + 8;
const FOOTER_SIZE: usize = size_of::<Footer>();

/// The bytes a packet occupies in the ring: its header and payload padded to
/// 8 bytes, then the footer.
pub const fn framed_len(header_len: usize, payload_len: usize) -> usize {
    (header_len + payload_len).next_multiple_of(8) + FOOTER_SIZE
}

/// The smallest amount of readable data that can hold a packet.
pub(crate) const MIN_PACKET_LEN: u32 = EXTENDED_HEADER_SIZE as u32;

/// Gives access to the memory of a ring, for reading and writing packet
/// ranges.
pub trait Ring {
    type Memory: RingMem;

    fn mem(&self) -> &Self::Memory;
}

/// An access past the end of a [`RingRange`].
#[derive(Copy, Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("access of {requested} bytes exceeds the {remaining} bytes remaining in the range")]
pub struct AccessError {
    pub remaining: usize,
    pub requested: usize,
}

/// A span of ring offsets, such as a packet's payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingRange {
    off: u32,
    size: u32,
}

impl RingRange {
    fn new(off: u32, size: u32) -> Self {
        Self { off, size }
    }

    pub fn reader<'a, T: Ring>(&self, ring: &'a T) -> RingRangeReader<'a, T::Memory> {
        RingRangeReader {
            mem: ring.mem(),
            cursor: Cursor::new(*self),
        }
    }

    pub fn writer<'a, T: Ring>(&self, ring: &'a T) -> RingRangeWriter<'a, T::Memory> {
        RingRangeWriter {
            mem: ring.mem(),
            cursor: Cursor::new(*self),
        }
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Copy, Clone, Debug)]
struct Cursor {
    pos: u32,
    remaining: u32,
}

impl Cursor {
    fn new(range: RingRange) -> Self {
        Self {
            pos: range.off,
            remaining: range.size,
        }
    }

    /// Consumes `len` bytes, returning the ring offset they start at.
    fn take(&mut self, len: usize) -> Result<usize, AccessError> {
        let remaining = self.remaining as usize;
        if len > remaining {
            return Err(AccessError {
                remaining,
                requested: len,
            });
        }
        let at = self.pos as usize;
        self.pos += len as u32;
        self.remaining -= len as u32;
        Ok(at)
    }
}

/// Reads a [`RingRange`] front to back.
pub struct RingRangeReader<'a, M> {
    mem: &'a M,
    cursor: Cursor,
}

impl<M: RingMem> RingRangeReader<'_, M> {
    pub fn read(&mut self, data: &mut [u8]) -> Result<&mut Self, AccessError> {
        let at = self.cursor.take(data.len())?;
        self.mem.read_at(at, data);
        Ok(self)
    }

    pub fn read_plain<P: IntoBytes + FromBytes>(&mut self) -> Result<P, AccessError> {
        let mut value = P::new_zeroed();
        self.read(value.as_mut_bytes())?;
        Ok(value)
    }

    /// Reads whatever is left of the range.
    pub fn read_all(&mut self) -> Result<Vec<u8>, AccessError> {
        let mut data = vec![0; self.len()];
        self.read(&mut data)?;
        Ok(data)
    }

    pub fn len(&self) -> usize {
        self.cursor.remaining as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.remaining == 0
    }
}

/// Writes a [`RingRange`] front to back.
pub struct RingRangeWriter<'a, M> {
    mem: &'a M,
    cursor: Cursor,
}

impl<M: RingMem> RingRangeWriter<'_, M> {
    pub fn write(&mut self, data: &[u8]) -> Result<(), AccessError> {
        let at = self.cursor.take(data.len())?;
        self.mem.write_at(at, data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cursor.remaining as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.remaining == 0
    }
}

/// The kind of a received packet. Packets that reference external memory
/// carry the range count and the ring range of their range list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IncomingPacketType {
    InBand,
    Completion,
    /// Cancels the transaction named by the packet's transaction ID.
    Cancel,
    GpaDirect(u32, RingRange),
    /// Transfer page set ID, range count and range list.
    TransferPages(u16, u32, RingRange),
}

/// A received packet, still in the ring.
#[derive(Debug)]
pub struct IncomingPacket {
    /// Present for completions, cancellations and packets that request a
    /// completion.
    pub transaction_id: Option<u64>,
    pub typ: IncomingPacketType,
    pub payload: RingRange,
}

impl IncomingPacket {
    /// Reads the range list of a GPA direct packet, or `None` for any other
    /// kind of packet.
    pub fn gpa_direct_ranges<T: Ring>(
        &self,
        ring: &T,
    ) -> Result<Option<MultiPagedRangeBuf<GpnList>>, Error> {
        let IncomingPacketType::GpaDirect(count, list) = self.typ else {
            return Ok(None);
        };
        MultiPagedRangeBuf::new(count as usize, read_words(ring.mem(), list))
            .map(Some)
            .map_err(Error::InvalidDescriptorGpaDirectRanges)
    }
}

/// A packet to send. The payload is written separately, through the range
/// returned by [`OutgoingRing::write`](crate::OutgoingRing::write).
#[derive(Debug)]
pub struct OutgoingPacket<'a> {
    pub transaction_id: u64,
    /// The payload length in bytes.
    pub size: usize,
    pub typ: OutgoingPacketType<'a>,
}

#[derive(Debug, Copy, Clone)]
pub enum OutgoingPacketType<'a> {
    InBandNoCompletion,
    /// An in-band packet the receiver answers with a completion.
    InBandWithCompletion,
    Completion,
    /// Cancels an outstanding transaction.
    Cancel,
    /// Carries the addresses of memory outside the ring.
    GpaDirect(&'a [PagedRange<'a>]),
    /// Carries byte ranges of a transfer page set, a buffer the endpoints
    /// registered earlier.
    TransferPages(u16, &'a [TransferPageRange]),
}

fn read_struct<T: FromBytes + IntoBytes, M: RingMem>(mem: &M, addr: usize) -> T {
    let mut value = T::new_zeroed();
    mem.read_aligned(addr, value.as_mut_bytes());
    value
}

fn read_words<M: RingMem>(mem: &M, list: RingRange) -> GpnList {
    let mut words = GpnList::from_elem(0, list.len() / 8);
    mem.read_aligned(list.off as usize, words.as_mut_bytes());
    words
}

/// Decodes the packet at ring offset `off`, with `avail` bytes readable from
/// there. Returns the packet and the number of bytes it occupies.
pub(crate) fn decode<M: RingMem>(
    mem: &M,
    off: u32,
    avail: u32,
) -> Result<(IncomingPacket, u32), Error> {
    if avail < MIN_PACKET_LEN {
        return Err(Error::InvalidDataAvailable);
    }
    let desc: PacketDescriptor = read_struct(mem, off as usize);
    let len = u32::from(desc.length8) * 8;
    let data_offset = u32::from(desc.data_offset8) * 8;
    let framed = len + FOOTER_SIZE as u32;
    if data_offset < DESCRIPTOR_SIZE as u32 || data_offset > len || framed > avail {
        return Err(Error::InvalidDescriptorLengths);
    }
    if desc.flags & !PACKET_FLAG_COMPLETION_REQUESTED != 0 {
        return Err(Error::InvalidDescriptorFlags);
    }

    let range_list = || {
        data_offset
            .checked_sub(EXTENDED_HEADER_SIZE as u32)
            .map(|size| RingRange::new(off + EXTENDED_HEADER_SIZE as u32, size))
            .ok_or(Error::InvalidDescriptorLengths)
    };
    let extended_at = off as usize + DESCRIPTOR_SIZE;
    let typ = match desc.packet_type {
        PACKET_TYPE_IN_BAND => IncomingPacketType::InBand,
        PACKET_TYPE_COMPLETION => IncomingPacketType::Completion,
        PACKET_TYPE_CANCEL => IncomingPacketType::Cancel,
        PACKET_TYPE_GPA_DIRECT => {
            let list = range_list()?;
            let header: GpaDirectHeader = read_struct(mem, extended_at);
            if header.range_count == 0 {
                return Err(Error::InvalidDescriptorGpaDirectRangeCount);
            }
            MultiPagedRangeBuf::<&[u64]>::validate(
                header.range_count as usize,
                &read_words(mem, list),
            )
            .map_err(Error::InvalidDescriptorGpaDirectRanges)?;
            IncomingPacketType::GpaDirect(header.range_count, list)
        }
        PACKET_TYPE_TRANSFER_PAGES => {
            let list = range_list()?;
            let header: TransferPageHeader = read_struct(mem, extended_at);
            if list.len() != header.range_count as usize * size_of::<TransferPageRange>() {
                return Err(Error::InvalidDescriptorTransferPageRangeCount);
            }
            IncomingPacketType::TransferPages(
                header.transfer_page_set_id,
                header.range_count,
                list,
            )
        }
        _ => return Err(Error::InvalidDescriptorType),
    };

    let transaction_id = (desc.flags & PACKET_FLAG_COMPLETION_REQUESTED != 0
        || matches!(
            typ,
            IncomingPacketType::Completion | IncomingPacketType::Cancel
        ))
    .then_some(desc.transaction_id);
    let packet = IncomingPacket {
        transaction_id,
        typ,
        payload: RingRange::new(off + data_offset, len - data_offset),
    };
    Ok((packet, framed))
}

/// How an outgoing packet is laid out in the ring.
pub(crate) struct Frame {
    packet_type: u16,
    flags: u16,
    /// Descriptor plus any extended header and range list.
    header_len: usize,
    /// Header plus payload, padded to 8 bytes.
    body_len: usize,
}

impl Frame {
    pub fn new(packet: &OutgoingPacket<'_>) -> Self {
        let (packet_type, header_len, flags) = match packet.typ {
            OutgoingPacketType::InBandNoCompletion => (PACKET_TYPE_IN_BAND, DESCRIPTOR_SIZE, 0),
            OutgoingPacketType::InBandWithCompletion => (
                PACKET_TYPE_IN_BAND,
                DESCRIPTOR_SIZE,
                PACKET_FLAG_COMPLETION_REQUESTED,
            ),
            OutgoingPacketType::Completion => (PACKET_TYPE_COMPLETION, DESCRIPTOR_SIZE, 0),
            OutgoingPacketType::Cancel => (PACKET_TYPE_CANCEL, DESCRIPTOR_SIZE, 0),
            OutgoingPacketType::GpaDirect(ranges) => (
                PACKET_TYPE_GPA_DIRECT,
                EXTENDED_HEADER_SIZE
                    + ranges
                        .iter()
                        .map(|range| size_of::<GpaRange>() + size_of_val(range.gpns()))
                        .sum::<usize>(),
                PACKET_FLAG_COMPLETION_REQUESTED,
            ),
            OutgoingPacketType::TransferPages(_, ranges) => (
                PACKET_TYPE_TRANSFER_PAGES,
                EXTENDED_HEADER_SIZE + size_of_val(ranges),
                PACKET_FLAG_COMPLETION_REQUESTED,
            ),
        };
        Self {
            packet_type,
            flags,
            header_len,
            body_len: (header_len + packet.size).next_multiple_of(8),
        }
    }

    /// The bytes the packet occupies, footer included.
    pub fn len(&self) -> usize {
        self.body_len + FOOTER_SIZE
    }

    /// Whether the descriptor can express the packet's length.
    pub fn fits_descriptor(&self) -> bool {
        self.body_len / 8 <= u16::MAX as usize
    }

    /// Writes everything but the payload at ring offset `off` and returns the
    /// range the payload goes in.
    pub fn write<M: RingMem>(&self, mem: &M, off: u32, packet: &OutgoingPacket<'_>) -> RingRange {
        let at = off as usize;
        let desc = PacketDescriptor {
            packet_type: self.packet_type,
            data_offset8: (self.header_len / 8) as u16,
            length8: (self.body_len / 8) as u16,
            flags: self.flags,
            transaction_id: packet.transaction_id,
        };
        mem.write_aligned(at, desc.as_bytes());

        match packet.typ {
            OutgoingPacketType::GpaDirect(ranges) => {
                let header = GpaDirectHeader {
                    reserved: 0,
                    range_count: ranges.len() as u32,
                };
                let words: GpnList = ranges
                    .iter()
                    .flat_map(|range| {
                        std::iter::once(range.header().to_word()).chain(range.gpns().iter().copied())
                    })
                    .collect();
                mem.write_aligned(at + DESCRIPTOR_SIZE, header.as_bytes());
                mem.write_aligned(at + EXTENDED_HEADER_SIZE, words.as_bytes());
            }
            OutgoingPacketType::TransferPages(id, ranges) => {
                let header = TransferPageHeader {
                    transfer_page_set_id: id,
                    reserved: 0,
                    range_count: ranges.len() as u32,
                };
                mem.write_aligned(at + DESCRIPTOR_SIZE, header.as_bytes());
                mem.write_aligned(at + EXTENDED_HEADER_SIZE, ranges.as_bytes());
            }
            _ => {}
        }

        // Zero the padding so stale ring contents never reach the other side.
        let payload_end = self.header_len + packet.size;
        mem.write_at(at + payload_end, &[0; 8][..self.body_len - payload_end]);
        let footer = Footer {
            reserved: 0,
            offset: off,
        };
        mem.write_aligned(at + self.body_len, footer.as_bytes());

        RingRange::new(off + self.header_len as u32, packet.size as u32)
    }
}
