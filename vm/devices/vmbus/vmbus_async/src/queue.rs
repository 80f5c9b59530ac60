// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module implements the `Queue` type, which provides an abstraction over
//! a VmBus channel.

use super::core::Core;
use super::core::ReadState;
use super::core::WriteState;
use crate::core::PollError;
use crate::signal::RawAsyncChannel;
use crate::signal::connected_async_channels;
use futures::FutureExt;
use std::future::Future;
use std::future::poll_fn;
use std::ops::Deref;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use thiserror::Error;
use vmbus_ring as ring;
use vmbus_ring::AccessError;
use vmbus_ring::FlatRingMem;
use vmbus_ring::IncomingPacketType;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingPacketType;
use vmbus_ring::RingMem;
use vmbus_ring::RingRangeReader;
use vmbus_ring::TransferPageRange;
use vmbus_ring::gparange::GpnList;
use vmbus_ring::gparange::MultiPagedRangeBuf;

/// A queue error.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<ErrorInner>);

impl From<ErrorInner> for Error {
    fn from(value: ErrorInner) -> Self {
        Self(Box::new(value))
    }
}

impl Error {
    /// Returns true if the error is due to the channel being closed by the
    /// remote endpoint.
    pub fn is_closed_error(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInner::ChannelClosed)
    }

    /// Returns the ring corruption that caused the error, if any.
    pub fn ring_error(&self) -> Option<ring::Error> {
        match self.0.as_ref() {
            ErrorInner::Ring(err) => Some(*err),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
enum ErrorInner {
    #[error("ring buffer access error")]
    Access(#[source] AccessError),
    #[error("ring buffer error")]
    Ring(#[source] ring::Error),
    #[error("the channel has been closed")]
    ChannelClosed,
}

impl From<PollError> for ErrorInner {
    fn from(value: PollError) -> Self {
        match value {
            PollError::Ring(ring) => Self::Ring(ring),
            PollError::Closed => Self::ChannelClosed,
        }
    }
}

/// An error returned by `try_read*` methods.
#[derive(Debug, Error)]
pub enum TryReadError {
    /// The ring is empty.
    #[error("ring is empty")]
    Empty,
    /// Underlying queue error.
    #[error("queue error")]
    Queue(#[source] Error),
}

/// An error returned by `try_write*` methods.
#[derive(Debug, Error)]
pub enum TryWriteError {
    /// The ring is full. The value is the number of bytes the packet needs.
    #[error("ring is full")]
    Full(usize),
    /// Underlying queue error.
    #[error("queue error")]
    Queue(#[source] Error),
}

/// An error returned when reading the external data of a packet.
#[derive(Debug, Error)]
pub enum ExternalDataError {
    #[error("invalid gpa ranges")]
    Ring(#[source] ring::Error),
    #[error("ring buffer access error")]
    Access(#[source] AccessError),
    #[error("packet does not carry this kind of external data")]
    WrongExternalDataType,
}

/// An incoming packet batch reader.
pub struct ReadBatch<'a, M: RingMem> {
    core: &'a Core<M>,
    read: &'a mut ReadState,
}

/// The packet iterator for [`ReadBatch`].
pub struct ReadBatchIter<'a, 'b, M: RingMem>(&'a mut ReadBatch<'b, M>);

impl<'a, M: RingMem> ReadBatch<'a, M> {
    fn next_priv(&mut self) -> Result<Option<IncomingPacket<'a, M>>, Error> {
        let mut ptrs = self.read.ptrs.clone();
        match self.core.in_ring().read(&mut ptrs) {
            Ok(packet) => {
                let packet = IncomingPacket::parse(self.core.in_ring(), packet);
                self.read.ptrs = ptrs;
                Ok(Some(packet))
            }
            Err(ring::ReadError::Empty) => Ok(None),
            Err(ring::ReadError::Corrupt(err)) => Err(ErrorInner::Ring(err).into()),
        }
    }

    fn single_packet(mut self) -> Result<Option<PacketRef<'a, M>>, Error> {
        if let Some(packet) = self.next_priv()? {
            Ok(Some(PacketRef {
                batch: self,
                packet,
            }))
        } else {
            Ok(None)
        }
    }

    /// Returns an iterator of the packets.
    pub fn packets(&mut self) -> ReadBatchIter<'_, 'a, M> {
        ReadBatchIter(self)
    }
}

impl<'a, M: RingMem> Iterator for ReadBatchIter<'a, '_, M> {
    type Item = Result<IncomingPacket<'a, M>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next_priv().transpose()
    }
}

impl<M: RingMem> Drop for ReadBatch<'_, M> {
    fn drop(&mut self) {
        self.read.clear_poll(self.core);
        if self.core.in_ring().commit_read(&mut self.read.ptrs) {
            self.core.signal();
        }
    }
}

/// A reference to a single packet that has not been released from the ring
/// yet. The packet is consumed when this is dropped.
pub struct PacketRef<'a, M: RingMem> {
    batch: ReadBatch<'a, M>,
    packet: IncomingPacket<'a, M>,
}

impl<'a, M: RingMem> Deref for PacketRef<'a, M> {
    type Target = IncomingPacket<'a, M>;

    fn deref(&self) -> &Self::Target {
        &self.packet
    }
}

impl<M: RingMem> PacketRef<'_, M> {
    /// Reverts the read pointers so that the packet stays in the ring.
    ///
    /// The remote endpoint can change the packet before it is read again, so
    /// any validation must be repeated.
    pub fn revert(&mut self) {
        self.batch.read.ptrs.revert();
    }
}

/// An incoming packet.
pub enum IncomingPacket<'a, T: RingMem> {
    /// A data packet.
    Data(DataPacket<'a, T>),
    /// A completion packet.
    Completion(CompletionPacket<'a, T>),
    /// A request to cancel the transaction with the given ID.
    Cancel(u64),
}

/// An incoming data packet: in-band, GPA direct or transfer pages.
pub struct DataPacket<'a, T: RingMem> {
    ring: &'a IncomingRing<T>,
    packet: ring::IncomingPacket,
}

impl<T: RingMem> DataPacket<'_, T> {
    /// A reader for the data payload.
    ///
    /// This reads the payload in place, so the opposite endpoint could change
    /// it between reads.
    pub fn reader(&self) -> RingRangeReader<'_, T> {
        self.packet.payload.reader(self.ring)
    }

    /// The packet's transaction ID. Set if and only if a completion packet was
    /// requested.
    pub fn transaction_id(&self) -> Option<u64> {
        self.packet.transaction_id
    }

    /// The number of GPA direct or transfer page ranges.
    pub fn external_range_count(&self) -> usize {
        match self.packet.typ {
            IncomingPacketType::GpaDirect(count, _)
            | IncomingPacketType::TransferPages(_, count, _) => count as usize,
            _ => 0,
        }
    }

    /// Reads the GPA direct ranges from the packet.
    pub fn read_external_ranges(&self) -> Result<MultiPagedRangeBuf<GpnList>, ExternalDataError> {
        match self.packet.gpa_direct_ranges(self.ring) {
            Ok(Some(ranges)) => Ok(ranges),
            Ok(None) => Err(ExternalDataError::WrongExternalDataType),
            Err(err) => Err(ExternalDataError::Ring(err)),
        }
    }

    /// The transfer page set ID, or `None` if this is not a transfer page
    /// packet.
    pub fn transfer_buffer_id(&self) -> Option<u16> {
        match self.packet.typ {
            IncomingPacketType::TransferPages(id, _, _) => Some(id),
            _ => None,
        }
    }

    /// Reads the transfer page ranges from the packet.
    pub fn read_transfer_ranges(&self) -> Result<Vec<TransferPageRange>, ExternalDataError> {
        let IncomingPacketType::TransferPages(_, count, range) = self.packet.typ else {
            return Err(ExternalDataError::WrongExternalDataType);
        };
        let mut reader = range.reader(self.ring);
        (0..count)
            .map(|_| reader.read_plain().map_err(ExternalDataError::Access))
            .collect()
    }
}

/// A completion packet.
pub struct CompletionPacket<'a, T: RingMem> {
    ring: &'a IncomingRing<T>,
    payload: ring::RingRange,
    transaction_id: u64,
}

impl<T: RingMem> CompletionPacket<'_, T> {
    /// A reader for the completion payload.
    pub fn reader(&self) -> RingRangeReader<'_, T> {
        self.payload.reader(self.ring)
    }

    /// The packet's transaction ID.
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }
}

impl<'a, T: RingMem> IncomingPacket<'a, T> {
    fn parse(ring: &'a IncomingRing<T>, packet: ring::IncomingPacket) -> Self {
        // The ring always reports a transaction ID for completions and
        // cancellations.
        match packet.typ {
            IncomingPacketType::Completion => IncomingPacket::Completion(CompletionPacket {
                ring,
                payload: packet.payload,
                transaction_id: packet.transaction_id.unwrap_or_default(),
            }),
            IncomingPacketType::Cancel => {
                IncomingPacket::Cancel(packet.transaction_id.unwrap_or_default())
            }
            IncomingPacketType::InBand
            | IncomingPacketType::GpaDirect(..)
            | IncomingPacketType::TransferPages(..) => {
                IncomingPacket::Data(DataPacket { ring, packet })
            }
        }
    }
}

/// The reader for the incoming ring buffer of a [`Queue`].
pub struct ReadHalf<'a, M: RingMem> {
    core: &'a Core<M>,
    read: &'a mut ReadState,
}

impl<'a, M: RingMem> ReadHalf<'a, M> {
    /// Polls the incoming ring for more packets.
    ///
    /// This manages interrupt masking: interrupts stay masked while packets
    /// are being drained and are unmasked only when this finds the ring
    /// empty.
    pub fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        ready!(self.read.poll_ready(cx, self.core)).map_err(ErrorInner::from)?;
        Poll::Ready(Ok(()))
    }

    /// Polls the incoming ring for more packets and returns a batch reader for
    /// them.
    pub fn poll_read_batch<'b>(
        &'b mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<ReadBatch<'b, M>, Error>> {
        let batch = loop {
            ready!(self.poll_ready(cx))?;
            if self
                .core
                .in_ring()
                .can_read(&mut self.read.ptrs)
                .map_err(ErrorInner::Ring)?
            {
                break ReadBatch {
                    core: self.core,
                    read: self.read,
                };
            } else {
                self.read.clear_ready();
            }
        };
        Poll::Ready(Ok(batch))
    }

    /// Tries to get a reader for the next batch of packets.
    pub fn try_read_batch(&mut self) -> Result<ReadBatch<'_, M>, TryReadError> {
        try_read_batch(self.core, self.read)
    }

    /// Waits for the next batch of packets to be ready and returns a reader for
    /// them.
    pub fn read_batch<'b>(&'b mut self) -> BatchRead<'a, 'b, M> {
        BatchRead(Some(self))
    }

    /// Tries to read the next packet.
    ///
    /// Returns `Err(TryReadError::Empty)` if the ring is empty.
    pub fn try_read(&mut self) -> Result<PacketRef<'_, M>, TryReadError> {
        try_read_single(self.core, self.read)
    }

    /// Waits for the next packet to be ready and returns it.
    pub fn read<'b>(&'b mut self) -> Read<'a, 'b, M> {
        Read(self.read_batch())
    }

    /// Indicates whether the remote endpoint honors pending send size
    /// requests on this ring.
    pub fn supports_pending_send_size(&self) -> bool {
        self.core.in_ring().supports_pending_send_size()
    }
}

fn try_read_batch<'a, M: RingMem>(
    core: &'a Core<M>,
    read: &'a mut ReadState,
) -> Result<ReadBatch<'a, M>, TryReadError> {
    if core
        .in_ring()
        .can_read(&mut read.ptrs)
        .map_err(|err| TryReadError::Queue(Error::from(ErrorInner::Ring(err))))?
    {
        Ok(ReadBatch { core, read })
    } else {
        read.clear_ready();
        Err(TryReadError::Empty)
    }
}

fn try_read_single<'a, M: RingMem>(
    core: &'a Core<M>,
    read: &'a mut ReadState,
) -> Result<PacketRef<'a, M>, TryReadError> {
    try_read_batch(core, read)?
        .single_packet()
        .map_err(TryReadError::Queue)?
        .ok_or(TryReadError::Empty)
}

/// An asynchronous batch read operation.
pub struct BatchRead<'a, 'b, M: RingMem>(Option<&'a mut ReadHalf<'b, M>>);

impl<'a, M: RingMem> Future for BatchRead<'a, '_, M> {
    type Output = Result<ReadBatch<'a, M>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(half) = this.0.as_mut() else {
            return Poll::Pending;
        };
        // Rebuild the batch below to get the lifetimes right.
        let _ = ready!(half.poll_read_batch(cx))?;
        let Some(half) = this.0.take() else {
            return Poll::Pending;
        };
        Poll::Ready(Ok(ReadBatch {
            core: half.core,
            read: half.read,
        }))
    }
}

/// An asynchronous read operation.
pub struct Read<'a, 'b, M: RingMem>(BatchRead<'a, 'b, M>);

impl<'a, M: RingMem> Future for Read<'a, '_, M> {
    type Output = Result<PacketRef<'a, M>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let batch = ready!(self.0.poll_unpin(cx))?;
        // The batch was non-empty when polled, so a missing packet means the
        // ring indexes moved backwards.
        Poll::Ready(
            batch
                .single_packet()?
                .ok_or_else(|| ErrorInner::Ring(ring::Error::InvalidDataAvailable).into()),
        )
    }
}

/// An outgoing packet.
pub struct OutgoingPacket<'a, 'b> {
    /// The transaction ID. Ignored for `packet_type` of [`OutgoingPacketType::InBandNoCompletion`].
    pub transaction_id: u64,
    /// The outgoing packet type.
    pub packet_type: OutgoingPacketType<'a>,
    /// The payload, as a list of byte slices.
    pub payload: &'b [&'b [u8]],
}

/// The writer for the outgoing ring buffer of a [`Queue`].
pub struct WriteHalf<'a, M: RingMem> {
    core: &'a Core<M>,
    write: &'a mut WriteState,
}

impl<'a, M: RingMem> WriteHalf<'a, M> {
    /// Polls the outgoing ring for the ability to send a packet of size
    /// `send_size`.
    ///
    /// `send_size` can be taken from `TryWriteError::Full(send_size)`.
    pub fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
        send_size: usize,
    ) -> Poll<Result<(), Error>> {
        loop {
            ready!(self.write.poll_ready(cx, self.core, send_size)).map_err(ErrorInner::from)?;
            if self.can_write(send_size)? {
                break Poll::Ready(Ok(()));
            }
        }
    }

    /// Waits until there is enough space in the ring to send a packet of size
    /// `send_size`.
    pub async fn wait_ready(&mut self, send_size: usize) -> Result<(), Error> {
        poll_fn(|cx| self.poll_ready(cx, send_size)).await
    }

    /// Returns an object for writing multiple packets at once.
    ///
    /// The batch is committed, and the remote signaled if needed, only once,
    /// when the returned object is dropped.
    pub fn batched(&mut self) -> WriteBatch<'_, M> {
        WriteBatch {
            core: self.core,
            write: self.write,
        }
    }

    /// Checks the outgoing ring for the capacity to send a packet of size
    /// `send_size`.
    pub fn can_write(&mut self, send_size: usize) -> Result<bool, Error> {
        self.batched().can_write(send_size)
    }

    /// The largest packet the ring can ever hold, in bytes.
    pub fn capacity(&self) -> usize {
        self.core.out_ring().maximum_packet_size()
    }

    /// Tries to write a packet into the outgoing ring.
    ///
    /// Fails with `TryWriteError::Full(send_size)` if the ring is full.
    pub fn try_write(&mut self, packet: &OutgoingPacket<'_, '_>) -> Result<(), TryWriteError> {
        self.batched().try_write(packet)
    }

    /// Polls the ring for successful write of `packet`.
    pub fn poll_write(
        &mut self,
        cx: &mut Context<'_>,
        packet: &OutgoingPacket<'_, '_>,
    ) -> Poll<Result<(), Error>> {
        let mut send_size = 32;
        let r = loop {
            ready!(self.write.poll_ready(cx, self.core, send_size)).map_err(ErrorInner::from)?;
            match self.try_write(packet) {
                Ok(()) => break Ok(()),
                Err(TryWriteError::Full(len)) => send_size = len,
                Err(TryWriteError::Queue(err)) => break Err(err),
            }
        };
        Poll::Ready(r)
    }

    /// Writes a packet, waiting for space if the ring is full.
    pub fn write<'b, 'c>(&'b mut self, packet: OutgoingPacket<'c, 'b>) -> Write<'a, 'b, 'c, M> {
        Write {
            write: self,
            packet,
        }
    }
}

/// A batch writer, returned by [`WriteHalf::batched`].
pub struct WriteBatch<'a, M: RingMem> {
    core: &'a Core<M>,
    write: &'a mut WriteState,
}

impl<M: RingMem> WriteBatch<'_, M> {
    /// Checks the outgoing ring for the capacity to send a packet of size
    /// `send_size`.
    pub fn can_write(&mut self, send_size: usize) -> Result<bool, Error> {
        let can_write = self
            .core
            .out_ring()
            .can_write(&mut self.write.ptrs, send_size)
            .map_err(ErrorInner::Ring)?;

        // Ensure that poll_write will check again.
        if !can_write {
            self.write.clear_ready();
        }
        Ok(can_write)
    }

    /// Tries to write a packet into the outgoing ring.
    ///
    /// Fails with `TryWriteError::Full(send_size)` if the ring is full.
    pub fn try_write(&mut self, packet: &OutgoingPacket<'_, '_>) -> Result<(), TryWriteError> {
        let size = packet.payload.iter().map(|p| p.len()).sum();
        let ring_packet = ring::OutgoingPacket {
            transaction_id: packet.transaction_id,
            size,
            typ: packet.packet_type,
        };
        let mut ptrs = self.write.ptrs.clone();
        match self.core.out_ring().write(&mut ptrs, &ring_packet) {
            Ok(range) => {
                let mut writer = range.writer(self.core.out_ring());
                for p in packet.payload.iter().copied() {
                    writer.write(p).map_err(|err| {
                        TryWriteError::Queue(Error::from(ErrorInner::Access(err)))
                    })?;
                }
                self.write
                    .clear_poll(self.core)
                    .map_err(|err| TryWriteError::Queue(ErrorInner::Ring(err).into()))?;
                self.write.ptrs = ptrs;
                Ok(())
            }
            Err(ring::WriteError::Full(n)) => {
                self.write.clear_ready();
                Err(TryWriteError::Full(n))
            }
            Err(ring::WriteError::Corrupt(err)) => {
                Err(TryWriteError::Queue(ErrorInner::Ring(err).into()))
            }
        }
    }
}

impl<M: RingMem> Drop for WriteBatch<'_, M> {
    fn drop(&mut self) {
        if self.core.out_ring().commit_write(&mut self.write.ptrs) {
            self.core.signal();
        }
    }
}

/// An asynchronous packet write operation.
#[must_use]
pub struct Write<'a, 'b, 'c, M: RingMem> {
    write: &'b mut WriteHalf<'a, M>,
    packet: OutgoingPacket<'c, 'b>,
}

impl<M: RingMem> Future for Write<'_, '_, '_, M> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.write.poll_write(cx, &this.packet)
    }
}

/// An abstraction over an open VmBus channel that provides methods to read and
/// write packets from the ring, as well as poll the ring for readiness.
pub struct Queue<M: RingMem> {
    core: Core<M>,
    read: ReadState,
    write: WriteState,
}

impl<M: RingMem> Queue<M> {
    /// Constructs a `Queue` object over the given raw channel.
    pub fn new(raw: RawAsyncChannel<M>) -> Result<Self, Error> {
        let incoming = raw.in_ring.incoming().map_err(ErrorInner::Ring)?;
        let outgoing = raw.out_ring.outgoing().map_err(ErrorInner::Ring)?;
        let core = Core::new(raw);
        let read = ReadState::new(incoming);
        let write = WriteState::new(outgoing);

        Ok(Self { core, read, write })
    }

    /// Splits the queue into a read half and write half that can be operated on
    /// independently.
    pub fn split(&mut self) -> (ReadHalf<'_, M>, WriteHalf<'_, M>) {
        (
            ReadHalf {
                core: &self.core,
                read: &mut self.read,
            },
            WriteHalf {
                core: &self.core,
                write: &mut self.write,
            },
        )
    }

    /// Tries to write a packet. See [`WriteHalf::try_write`].
    pub fn try_write(&mut self, packet: &OutgoingPacket<'_, '_>) -> Result<(), TryWriteError> {
        self.split().1.try_write(packet)
    }

    /// Tries to read the next packet. See [`ReadHalf::try_read`].
    pub fn try_read(&mut self) -> Result<PacketRef<'_, M>, TryReadError> {
        try_read_single(&self.core, &mut self.read)
    }

    /// Signals the remote endpoint unconditionally.
    ///
    /// Reads and writes signal on their own when the ring state calls for it;
    /// this is for callers that manage the ring pointers out of band.
    pub fn signal_remote(&self) {
        self.core.signal();
    }
}

/// Returns a pair of connected queues over in-process memory.
pub fn connected_queues(
    ring_size: usize,
) -> Result<(Queue<FlatRingMem>, Queue<FlatRingMem>), Error> {
    let (host, guest) =
        connected_async_channels(ring_size).map_err(|err| Error::from(ErrorInner::Ring(err)))?;
    Ok((Queue::new(host)?, Queue::new(guest)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::task::Waker;
    use test_with_tracing::test;
    use vmbus_ring::gparange::PagedRange;

    fn in_band<'a>(payload: &'a [&'a [u8]]) -> OutgoingPacket<'static, 'a> {
        OutgoingPacket {
            transaction_id: 0,
            packet_type: OutgoingPacketType::InBandNoCompletion,
            payload,
        }
    }

    fn read_payload<M: RingMem>(packet: &IncomingPacket<'_, M>) -> Vec<u8> {
        match packet {
            IncomingPacket::Data(data) => data.reader().read_all().unwrap(),
            IncomingPacket::Completion(completion) => completion.reader().read_all().unwrap(),
            IncomingPacket::Cancel(_) => panic!("unexpected cancel"),
        }
    }

    #[test]
    fn request_and_completion() {
        let (mut host, mut guest) = connected_queues(16384).unwrap();

        guest
            .try_write(&OutgoingPacket {
                transaction_id: 5,
                packet_type: OutgoingPacketType::InBandWithCompletion,
                payload: &[b"hello ", b"world"],
            })
            .unwrap();

        {
            let packet = host.try_read().unwrap();
            let IncomingPacket::Data(data) = &*packet else {
                panic!("expected data");
            };
            assert_eq!(data.transaction_id(), Some(5));
            assert_eq!(data.reader().read_all().unwrap(), b"hello world");
        }
        assert!(matches!(host.try_read(), Err(TryReadError::Empty)));

        host.try_write(&OutgoingPacket {
            transaction_id: 5,
            packet_type: OutgoingPacketType::Completion,
            payload: &[&[1, 2, 3]],
        })
        .unwrap();
        let (mut reader, _) = guest.split();
        let packet = block_on(reader.read()).unwrap();
        let IncomingPacket::Completion(completion) = &*packet else {
            panic!("expected completion");
        };
        assert_eq!(completion.transaction_id(), 5);
        assert_eq!(read_payload(&packet), [1, 2, 3]);
    }

    #[test]
    fn fifo_order_across_wrap() {
        let (mut host, mut guest) = connected_queues(4096).unwrap();
        let mut next_read = 0u32;
        for i in 0..500u32 {
            let payload = vec![i as u8; (i as usize * 37) % 300 + 1];
            loop {
                match guest.try_write(&in_band(&[&payload[..]])) {
                    Ok(()) => break,
                    Err(TryWriteError::Full(_)) => {
                        let packet = host.try_read().unwrap();
                        let data = read_payload(&packet);
                        assert_eq!(data.len(), (next_read as usize * 37) % 300 + 1);
                        assert!(data.iter().all(|&b| b == next_read as u8));
                        next_read += 1;
                    }
                    Err(err) => panic!("{err}"),
                }
            }
        }
        while let Ok(packet) = host.try_read() {
            assert_eq!(read_payload(&packet)[0], next_read as u8);
            next_read += 1;
        }
        assert_eq!(next_read, 500);
    }

    #[test]
    fn batched_read() {
        let (mut host, mut guest) = connected_queues(16384).unwrap();
        {
            let (_, mut writer) = guest.split();
            let mut batch = writer.batched();
            for i in 0..4u8 {
                batch.try_write(&in_band(&[&[i; 10]])).unwrap();
            }
        }
        let (mut reader, _) = host.split();
        let mut batch = reader.try_read_batch().unwrap();
        let payloads: Vec<_> = batch
            .packets()
            .map(|p| read_payload(&p.unwrap())[0])
            .collect();
        assert_eq!(payloads, [0, 1, 2, 3]);
    }

    #[test]
    fn revert_keeps_packet() {
        let (mut host, mut guest) = connected_queues(16384).unwrap();
        guest.try_write(&in_band(&[&[9; 16]])).unwrap();
        {
            let mut packet = host.try_read().unwrap();
            packet.revert();
        }
        assert_eq!(read_payload(&host.try_read().unwrap()), [9; 16]);
    }

    #[test]
    fn gpa_direct() {
        let (mut host, mut guest) = connected_queues(16384).unwrap();

        let gpa1: Vec<u64> = vec![4096, 8192];
        let gpa2: Vec<u64> = vec![8192];
        let gpas = vec![
            PagedRange::new(20, 4096, &gpa1).unwrap(),
            PagedRange::new(0, 200, &gpa2).unwrap(),
        ];

        let payload: &[u8] = &[0xf; 24];
        block_on(guest.split().1.write(OutgoingPacket {
            transaction_id: 0,
            packet_type: OutgoingPacketType::GpaDirect(&gpas),
            payload: &[payload],
        }))
        .unwrap();

        let packet = host.try_read().unwrap();
        let IncomingPacket::Data(data) = &*packet else {
            panic!("expected data");
        };
        assert_eq!(data.reader().read_all().unwrap(), payload);
        assert_eq!(data.external_range_count(), 2);
        assert!(data.transfer_buffer_id().is_none());
        let ranges = data.read_external_ranges().unwrap();
        let in_gpas: Vec<PagedRange<'_>> = ranges.iter().collect();
        assert_eq!(in_gpas.len(), gpas.len());
        for (p, q) in in_gpas.iter().zip(&gpas) {
            assert_eq!(p.offset(), q.offset());
            assert_eq!(p.len(), q.len());
            assert_eq!(p.gpns(), q.gpns());
        }
    }

    #[test]
    fn transfer_pages() {
        let (mut host, mut guest) = connected_queues(16384).unwrap();
        let ranges = [
            TransferPageRange {
                byte_count: 0x10,
                byte_offset: 0x10,
            },
            TransferPageRange {
                byte_count: 0x20,
                byte_offset: 0x1000,
            },
        ];
        guest
            .try_write(&OutgoingPacket {
                transaction_id: 3,
                packet_type: OutgoingPacketType::TransferPages(13, &ranges),
                payload: &[&[0xf; 24]],
            })
            .unwrap();

        let packet = host.try_read().unwrap();
        let IncomingPacket::Data(data) = &*packet else {
            panic!("expected data");
        };
        assert_eq!(data.transfer_buffer_id(), Some(13));
        assert_eq!(data.external_range_count(), 2);
        assert_eq!(data.read_transfer_ranges().unwrap(), ranges);
        assert!(matches!(
            data.read_external_ranges(),
            Err(ExternalDataError::WrongExternalDataType)
        ));
    }

    #[test]
    fn cancel_packet() {
        let (mut host, mut guest) = connected_queues(16384).unwrap();
        guest
            .try_write(&OutgoingPacket {
                transaction_id: 77,
                packet_type: OutgoingPacketType::Cancel,
                payload: &[],
            })
            .unwrap();
        assert!(matches!(*host.try_read().unwrap(), IncomingPacket::Cancel(77)));
    }

    #[test]
    fn ring_full_waits_for_space() {
        let (mut host, mut guest) = connected_queues(4096).unwrap();
        let big = [0u8; 4000];

        host.try_write(&in_band(&[&big])).unwrap();
        let Err(TryWriteError::Full(n)) = host.try_write(&in_band(&[&big])) else {
            panic!("expected a full ring");
        };

        let mut wait = Box::pin(async move {
            poll_fn(|cx| host.split().1.poll_ready(cx, n)).await.unwrap();
            host
        });
        let mut cx = Context::from_waker(Waker::noop());
        assert!(wait.as_mut().poll(&mut cx).is_pending());

        // Draining the ring crosses the pending send size, so the reader
        // signals the writer.
        block_on(guest.split().0.read()).unwrap();
        assert!(guest.try_read().is_err());

        let mut host = block_on(wait);
        host.try_write(&in_band(&[&big])).unwrap();
    }

    #[test]
    fn remote_close_fails_reads() {
        let (mut host, guest) = connected_queues(4096).unwrap();
        drop(guest);
        let err = block_on(host.split().0.read()).err().unwrap();
        assert!(err.is_closed_error());
    }
}
