// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The data plane of an open channel.

use crate::SynicEventClient;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use thiserror::Error;
use vmbus_async::queue;
use vmbus_async::queue::OutgoingPacket;
use vmbus_async::queue::PacketRef;
use vmbus_async::queue::Queue;
use vmbus_async::queue::ReadHalf;
use vmbus_async::queue::TryReadError;
use vmbus_async::queue::TryWriteError;
use vmbus_async::signal::ChannelClosed;
use vmbus_async::signal::RemoteSignal;
use vmbus_async::signal::SignalVmbusChannel;
use vmbus_core::protocol::ChannelId;
use vmbus_ring::RingMem;

/// Set once the remote rescinds the channel. Shared between the client task
/// and the channel's owner.
#[derive(Debug, Clone, Default)]
pub struct Rescinded(Arc<AtomicBool>);

impl Rescinded {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Signals the remote through the synic and waits on the event the client
/// task mapped for the channel.
pub(crate) struct ChannelSignal {
    pub event_client: Arc<dyn SynicEventClient>,
    pub connection_id: u32,
    pub incoming: Arc<RemoteSignal>,
}

impl SignalVmbusChannel for ChannelSignal {
    fn signal_remote(&self) {
        if let Err(err) = self.event_client.signal_event(self.connection_id, 0) {
            tracing::warn!(
                connection_id = self.connection_id,
                error = &err as &dyn std::error::Error,
                "failed to signal channel"
            );
        }
    }

    fn poll_for_signal(&self, cx: &mut Context<'_>) -> Poll<Result<(), ChannelClosed>> {
        self.incoming.poll_wait(cx)
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("the channel has been rescinded")]
    ChannelRescinded,
    #[error("ring is full")]
    Full(usize),
    #[error("queue error")]
    Queue(#[source] queue::Error),
}

impl From<TryWriteError> for SendError {
    fn from(err: TryWriteError) -> Self {
        match err {
            TryWriteError::Full(n) => Self::Full(n),
            TryWriteError::Queue(err) => Self::Queue(err),
        }
    }
}

/// An open channel's packet queue.
///
/// Sends are refused once the channel is rescinded. Packets already in the
/// incoming ring can still be read.
pub struct OpenedChannel<M: RingMem> {
    channel_id: ChannelId,
    queue: Queue<M>,
    rescinded: Rescinded,
}

impl<M: RingMem> OpenedChannel<M> {
    pub(crate) fn new(channel_id: ChannelId, queue: Queue<M>, rescinded: Rescinded) -> Self {
        Self {
            channel_id,
            queue,
            rescinded,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn is_rescinded(&self) -> bool {
        self.rescinded.is_set()
    }

    /// Writes a packet without waiting.
    pub fn try_write(&mut self, packet: &OutgoingPacket<'_, '_>) -> Result<(), SendError> {
        if self.rescinded.is_set() {
            return Err(SendError::ChannelRescinded);
        }
        Ok(self.queue.try_write(packet)?)
    }

    /// Writes a packet, waiting for ring space.
    pub async fn write(&mut self, packet: OutgoingPacket<'_, '_>) -> Result<(), SendError> {
        if self.rescinded.is_set() {
            return Err(SendError::ChannelRescinded);
        }
        let (_, mut writer) = self.queue.split();
        writer.write(packet).await.map_err(SendError::Queue)
    }

    pub fn try_read(&mut self) -> Result<PacketRef<'_, M>, TryReadError> {
        self.queue.try_read()
    }

    /// The reader for the incoming ring.
    pub fn reader(&mut self) -> ReadHalf<'_, M> {
        self.queue.split().0
    }
}
