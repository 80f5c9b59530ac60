// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Notifications between the two endpoints of a channel.

use parking_lot::Mutex;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use thiserror::Error;
use vmbus_ring::FlatRingMem;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingRing;
use vmbus_ring::RingMem;

/// An object to use to communicate notifications with the remote endpoint of a
/// vmbus channel.
///
/// When dropped, this may (or may not) signal to the remote endpoint that the
/// channel is being closed.
pub trait SignalVmbusChannel: Send + Sync {
    /// Signals the remote endpoint that there is work to do: either the
    /// outgoing ring buffer has transitioned from empty to non-empty, or the
    /// incoming ring buffer now has enough space for the remote endpoint's
    /// pending send.
    fn signal_remote(&self);

    /// Polls the channel for a ring buffer signal or for being closed.
    fn poll_for_signal(&self, cx: &mut Context<'_>) -> Poll<Result<(), ChannelClosed>>;
}

/// Returned from [`SignalVmbusChannel::poll_for_signal`] once the other
/// endpoint has closed the channel.
#[derive(Debug, Error)]
#[error("the channel has been closed")]
pub struct ChannelClosed;

/// The receiving side of a doorbell. The lower transport layer calls
/// [`RemoteSignal::on_remote_signal`] when the remote endpoint signals; this
/// only wakes whichever task is parked on the channel.
#[derive(Debug, Default)]
pub struct RemoteSignal {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    signaled: bool,
    closed: bool,
    waker: Option<Waker>,
}

impl RemoteSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a signal from the remote endpoint and wakes the waiter.
    pub fn on_remote_signal(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.signaled = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Marks the channel closed. Waiters fail with [`ChannelClosed`].
    pub fn close(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.closed = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Consumes a pending signal, or registers to be woken by the next one.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), ChannelClosed>> {
        let _dead_waker;
        let mut state = self.state.lock();
        if state.closed {
            return Poll::Ready(Err(ChannelClosed));
        }
        if state.signaled {
            state.signaled = false;
            _dead_waker = state.waker.take();
            Poll::Ready(Ok(()))
        } else {
            if !state
                .waker
                .as_ref()
                .is_some_and(|w| cx.waker().will_wake(w))
            {
                _dead_waker = state.waker.replace(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

/// The resources for a bidirectional vmbus channel.
pub struct RawAsyncChannel<M: RingMem> {
    /// The incoming ring buffer.
    pub in_ring: IncomingRing<M>,
    /// The outgoing ring buffer.
    pub out_ring: OutgoingRing<M>,
    /// The object to use to communicate notifications with the remote endpoint.
    pub signal: Box<dyn SignalVmbusChannel>,
}

struct InProcSignal {
    local: Arc<RemoteSignal>,
    remote: Arc<RemoteSignal>,
    close_on_drop: bool,
}

impl SignalVmbusChannel for InProcSignal {
    fn signal_remote(&self) {
        self.remote.on_remote_signal();
    }

    fn poll_for_signal(&self, cx: &mut Context<'_>) -> Poll<Result<(), ChannelClosed>> {
        self.local.poll_wait(cx)
    }
}

impl Drop for InProcSignal {
    fn drop(&mut self) {
        if self.close_on_drop {
            self.remote.close();
        }
    }
}

/// Creates a pair of connected in-process channels, each ring with
/// `ring_size` bytes of data. Dropping the second channel closes the first.
pub fn connected_async_channels(
    ring_size: usize,
) -> Result<(RawAsyncChannel<FlatRingMem>, RawAsyncChannel<FlatRingMem>), vmbus_ring::Error> {
    let host_signal = InProcSignal {
        local: Default::default(),
        remote: Default::default(),
        close_on_drop: false,
    };
    let guest_signal = InProcSignal {
        local: host_signal.remote.clone(),
        remote: host_signal.local.clone(),
        close_on_drop: true,
    };
    let (host_in_ring, guest_out_ring) = make_ring_pair(ring_size)?;
    let (guest_in_ring, host_out_ring) = make_ring_pair(ring_size)?;

    let host = RawAsyncChannel {
        in_ring: host_in_ring,
        out_ring: host_out_ring,
        signal: Box::new(host_signal),
    };
    let guest = RawAsyncChannel {
        in_ring: guest_in_ring,
        out_ring: guest_out_ring,
        signal: Box::new(guest_signal),
    };
    Ok((host, guest))
}

fn make_ring_pair(
    size: usize,
) -> Result<(IncomingRing<FlatRingMem>, OutgoingRing<FlatRingMem>), vmbus_ring::Error> {
    let mem = FlatRingMem::new(size);
    Ok((IncomingRing::new(mem.clone())?, OutgoingRing::new(mem)?))
}
