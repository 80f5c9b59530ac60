// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The VMBus ring buffer: a single-producer, single-consumer queue of
//! variable-sized packets in memory shared by the two endpoints of a channel.
//!
//! Each packet starts with a descriptor that may carry a transaction ID and
//! metadata describing memory outside the ring. Packets are padded to 8 bytes
//! and end with a footer. A channel uses two rings, one per direction, but the
//! types here each handle one side of one ring.

#![forbid(unsafe_code)]

pub mod gpadl_ring;
pub mod gparange;
mod mem;
mod packet;
pub mod protocol;

pub use mem::FlatRingMem;
pub use mem::RingMem;
pub use packet::AccessError;
pub use packet::IncomingPacket;
pub use packet::IncomingPacketType;
pub use packet::OutgoingPacket;
pub use packet::OutgoingPacketType;
pub use packet::Ring;
pub use packet::RingRange;
pub use packet::RingRangeReader;
pub use packet::RingRangeWriter;
pub use packet::framed_len;
pub use protocol::CONTROL_WORD_COUNT;
pub use protocol::PAGE_SIZE;
pub use protocol::TransferPageRange;

use packet::Frame;
use protocol::Control;
use protocol::FEATURE_SUPPORTS_PENDING_SEND_SIZE;
use std::fmt::Debug;
use std::sync::atomic::Ordering;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("ring index out of range or misaligned")]
    InvalidRingPointer,
    #[error("packet length exceeds what the ring can hold")]
    InvalidMessageLength,
    #[error("readable data too short for a packet")]
    InvalidDataAvailable,
    #[error("ring memory is not a non-zero multiple of the page size")]
    InvalidRingMemory,
    #[error("descriptor offset or length out of range")]
    InvalidDescriptorLengths,
    #[error("unknown descriptor flags")]
    InvalidDescriptorFlags,
    #[error("unknown descriptor type")]
    InvalidDescriptorType,
    #[error("gpa direct packet without ranges")]
    InvalidDescriptorGpaDirectRangeCount,
    #[error("malformed gpa direct range list")]
    InvalidDescriptorGpaDirectRanges(#[source] gparange::Error),
    #[error("transfer page range count does not match the range list")]
    InvalidDescriptorTransferPageRangeCount,
    #[error("interrupts masked by the opposite endpoint")]
    InterruptsExternallyMasked,
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("ring empty")]
    Empty,
    #[error(transparent)]
    Corrupt(#[from] Error),
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// Not enough free space. Carries the bytes the packet needs, suitable for
    /// [`OutgoingRing::set_pending_send_size`].
    #[error("ring full, {0} bytes needed")]
    Full(usize),
    #[error(transparent)]
    Corrupt(#[from] Error),
}

/// Geometry and index arithmetic common to both sides of a ring.
struct Shared<M> {
    mem: M,
    size: u32,
}

impl<M: RingMem> Debug for Shared<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("control", &self.control())
            .field("size", &self.size)
            .finish()
    }
}

impl<M: RingMem> Shared<M> {
    fn new(mem: M) -> Result<Self, Error> {
        let size = u32::try_from(mem.len())
            .ok()
            .filter(|&size| size != 0 && size as usize % PAGE_SIZE == 0)
            .ok_or(Error::InvalidRingMemory)?;
        Ok(Self { mem, size })
    }

    fn control(&self) -> Control<'_> {
        Control::new(self.mem.control())
    }

    /// Checks an index read from the control page.
    fn check(&self, index: u32) -> Result<u32, Error> {
        if index < self.size && index % 8 == 0 {
            Ok(index)
        } else {
            Err(Error::InvalidRingPointer)
        }
    }

    fn advance(&self, index: u32, n: u32) -> u32 {
        let next = index + n;
        if next >= self.size {
            next - self.size
        } else {
            next
        }
    }

    /// Bytes written but not yet consumed.
    fn used(&self, write: u32, read: u32) -> u32 {
        if write >= read {
            write - read
        } else {
            self.size - (read - write)
        }
    }

    /// Bytes the producer may still write. The last 8 bytes are never
    /// written, since a full ring would look empty.
    fn free(&self, write: u32, read: u32) -> u32 {
        self.size - self.used(write, read) - 8
    }
}

/// The consumer side of a ring.
#[derive(Debug)]
pub struct IncomingRing<M: RingMem> {
    shared: Shared<M>,
}

/// The consumer's position: packets between `committed_read` and `next_read`
/// have been read but not yet released to the producer.
#[derive(Debug, Clone)]
pub struct IncomingOffset {
    cached_write: u32,
    committed_read: u32,
    next_read: u32,
}

impl IncomingOffset {
    /// Puts back the packets read since the last commit.
    pub fn revert(&mut self) {
        self.next_read = self.committed_read;
    }
}

impl<M: RingMem> Ring for IncomingRing<M> {
    type Memory = M;

    fn mem(&self) -> &M {
        &self.shared.mem
    }
}

impl<M: RingMem> IncomingRing<M> {
    /// Fails if `mem` is not a whole number of pages. Interrupts start out
    /// masked.
    pub fn new(mem: M) -> Result<Self, Error> {
        let shared = Shared::new(mem)?;
        shared.control().interrupt_mask().store(1, Ordering::Relaxed);
        Ok(Self { shared })
    }

    /// Whether the producer signals when space frees up past the pending
    /// send size.
    pub fn supports_pending_send_size(&self) -> bool {
        self.shared.control().feature_bits().load(Ordering::Relaxed)
            & FEATURE_SUPPORTS_PENDING_SEND_SIZE
            != 0
    }

    /// Masks or unmasks the producer's empty-to-non-empty signal.
    pub fn set_interrupt_mask(&self, masked: bool) {
        self.shared
            .control()
            .interrupt_mask()
            .store(masked.into(), Ordering::SeqCst);
    }

    pub fn verify_interrupts_unmasked(&self) -> Result<(), Error> {
        match self.shared.control().interrupt_mask().load(Ordering::Relaxed) {
            0 => Ok(()),
            _ => Err(Error::InterruptsExternallyMasked),
        }
    }

    /// Snapshots the control page for a batch of reads.
    pub fn incoming(&self) -> Result<IncomingOffset, Error> {
        let control = self.shared.control();
        let next_read = self.shared.check(control.read_index().load(Ordering::Relaxed))?;
        let cached_write = self.shared.check(control.write_index().load(Ordering::Acquire))?;
        Ok(IncomingOffset {
            cached_write,
            committed_read: next_read,
            next_read,
        })
    }

    /// Whether a packet is waiting. Reloads the write index only once the
    /// cached one has been caught up with.
    pub fn can_read(&self, ptrs: &mut IncomingOffset) -> Result<bool, Error> {
        if ptrs.next_read == ptrs.cached_write {
            ptrs.cached_write = self
                .shared
                .check(self.shared.control().write_index().load(Ordering::Acquire))?;
        }
        Ok(ptrs.next_read != ptrs.cached_write)
    }

    /// Releases the packets read since the last commit. Returns whether the
    /// producer is waiting for the space this frees.
    pub fn commit_read(&self, ptrs: &mut IncomingOffset) -> bool {
        if ptrs.committed_read == ptrs.next_read {
            return false;
        }
        let control = self.shared.control();
        control.read_index().store(ptrs.next_read, Ordering::SeqCst);
        // Some producers ask for the ring size minus one to mean "when empty",
        // but only whole 8-byte units ever become free.
        let wanted = control.pending_send_size().load(Ordering::SeqCst) & !7;
        let signal = wanted != 0
            && self
                .shared
                .check(control.write_index().load(Ordering::SeqCst))
                .is_ok_and(|write| {
                    self.shared.free(write, ptrs.committed_read) < wanted
                        && self.shared.free(write, ptrs.next_read) >= wanted
                });
        ptrs.committed_read = ptrs.next_read;
        signal
    }

    /// Decodes the next packet. Its space stays reserved until
    /// [`IncomingRing::commit_read`].
    pub fn read(&self, ptrs: &mut IncomingOffset) -> Result<IncomingPacket, ReadError> {
        if !self.can_read(ptrs)? {
            return Err(ReadError::Empty);
        }
        let avail = self.shared.used(ptrs.cached_write, ptrs.next_read);
        let (packet, len) = packet::decode(&self.shared.mem, ptrs.next_read, avail)?;
        ptrs.next_read = self.shared.advance(ptrs.next_read, len);
        Ok(packet)
    }
}

/// The producer side of a ring.
#[derive(Debug)]
pub struct OutgoingRing<M: RingMem> {
    shared: Shared<M>,
}

/// The producer's position: packets between `committed_write` and
/// `next_write` are written but not yet visible to the consumer.
#[derive(Debug, Clone)]
pub struct OutgoingOffset {
    cached_read: u32,
    committed_write: u32,
    next_write: u32,
}

impl OutgoingOffset {
    /// Drops the packets written since the last commit.
    pub fn revert(&mut self) {
        self.next_write = self.committed_write;
    }
}

impl<M: RingMem> Ring for OutgoingRing<M> {
    type Memory = M;

    fn mem(&self) -> &M {
        &self.shared.mem
    }
}

impl<M: RingMem> OutgoingRing<M> {
    /// Fails if `mem` is not a whole number of pages. Advertises pending send
    /// size support, with no send pending.
    pub fn new(mem: M) -> Result<Self, Error> {
        let shared = Shared::new(mem)?;
        let control = shared.control();
        control
            .feature_bits()
            .store(FEATURE_SUPPORTS_PENDING_SEND_SIZE, Ordering::Relaxed);
        control.pending_send_size().store(0, Ordering::Relaxed);
        Ok(Self { shared })
    }

    /// Snapshots the control page for a batch of writes.
    pub fn outgoing(&self) -> Result<OutgoingOffset, Error> {
        let control = self.shared.control();
        let next_write = self.shared.check(control.write_index().load(Ordering::Relaxed))?;
        let cached_read = self.shared.check(control.read_index().load(Ordering::Acquire))?;
        Ok(OutgoingOffset {
            cached_read,
            committed_write: next_write,
            next_write,
        })
    }

    /// Asks the consumer to signal once `len` bytes are free. Zero cancels the
    /// request.
    pub fn set_pending_send_size(&self, len: usize) -> Result<(), Error> {
        if len > self.maximum_packet_size() {
            return Err(Error::InvalidMessageLength);
        }
        self.shared
            .control()
            .pending_send_size()
            .store((len as u32).next_multiple_of(8), Ordering::SeqCst);
        Ok(())
    }

    /// The largest framed packet the ring can ever hold.
    pub fn maximum_packet_size(&self) -> usize {
        self.shared.size as usize - 8
    }

    /// Whether `len` framed bytes fit. Reloads the read index only if the
    /// cached one says they do not.
    pub fn can_write(&self, ptrs: &mut OutgoingOffset, len: usize) -> Result<bool, Error> {
        if (self.shared.free(ptrs.next_write, ptrs.cached_read) as usize) < len {
            ptrs.cached_read = self
                .shared
                .check(self.shared.control().read_index().load(Ordering::Acquire))?;
        }
        Ok(self.shared.free(ptrs.next_write, ptrs.cached_read) as usize >= len)
    }

    /// Publishes the packets written since the last commit. Returns whether
    /// the consumer needs a signal: it has interrupts unmasked and had
    /// drained the ring before this batch.
    pub fn commit_write(&self, ptrs: &mut OutgoingOffset) -> bool {
        if ptrs.committed_write == ptrs.next_write {
            return false;
        }
        let control = self.shared.control();
        control.write_index().store(ptrs.next_write, Ordering::SeqCst);
        let signal = control.interrupt_mask().load(Ordering::SeqCst) == 0
            && control.read_index().load(Ordering::SeqCst) == ptrs.committed_write;
        ptrs.committed_write = ptrs.next_write;
        signal
    }

    /// Frames the next packet and returns the range for its payload, which
    /// the caller fills before [`OutgoingRing::commit_write`].
    pub fn write(
        &self,
        ptrs: &mut OutgoingOffset,
        packet: &OutgoingPacket<'_>,
    ) -> Result<RingRange, WriteError> {
        let frame = Frame::new(packet);
        let len = frame.len();
        if len > self.maximum_packet_size() || !frame.fits_descriptor() {
            return Err(Error::InvalidMessageLength.into());
        }
        if !self.can_write(ptrs, len)? {
            return Err(WriteError::Full(len));
        }
        let payload = frame.write(&self.shared.mem, ptrs.next_write, packet);
        ptrs.next_write = self.shared.advance(ptrs.next_write, len as u32);
        Ok(payload)
    }
}
