// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Internal types for performing asynchronous channel IO.

use crate::signal::ChannelClosed;
use crate::signal::RawAsyncChannel;
use crate::signal::SignalVmbusChannel;
use parking_lot::Mutex;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Wake;
use std::task::Waker;
use vmbus_ring as ring;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingOffset;
use vmbus_ring::OutgoingRing;
use vmbus_ring::RingMem;

/// Multiplexes several wakers onto the single waker registered with the
/// channel signal, so that both the reader and the writer are woken.
#[derive(Debug)]
struct MultiWaker<const N: usize> {
    inner: Arc<WakerSlots<N>>,
}

#[derive(Debug)]
struct WakerSlots<const N: usize> {
    wakers: Mutex<[Option<Waker>; N]>,
}

impl<const N: usize> Wake for WakerSlots<N> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let wakers = std::mem::replace(&mut *self.wakers.lock(), [const { None }; N]);
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }
}

impl<const N: usize> MultiWaker<N> {
    fn new() -> Self {
        Self {
            inner: Arc::new(WakerSlots {
                wakers: Mutex::new([const { None }; N]),
            }),
        }
    }

    /// Calls `f` on behalf of slot `index` with a context whose waker wakes
    /// every registered slot.
    fn poll_wrapped<R>(
        &self,
        cx: &mut Context<'_>,
        index: usize,
        f: impl FnOnce(&mut Context<'_>) -> Poll<R>,
    ) -> Poll<R> {
        {
            let mut wakers = self.inner.wakers.lock();
            if !wakers[index]
                .as_ref()
                .is_some_and(|old| old.will_wake(cx.waker()))
            {
                wakers[index] = Some(cx.waker().clone());
            }
        }
        let waker = Waker::from(self.inner.clone());
        f(&mut Context::from_waker(&waker))
    }
}

pub struct Core<M: RingMem> {
    signal: Box<dyn SignalVmbusChannel>,
    multi_waker: MultiWaker<2>,
    in_ring: IncomingRing<M>,
    out_ring: OutgoingRing<M>,
}

impl<M: RingMem> Core<M> {
    pub fn new(channel: RawAsyncChannel<M>) -> Self {
        let RawAsyncChannel {
            in_ring,
            out_ring,
            signal,
        } = channel;
        Self {
            signal,
            multi_waker: MultiWaker::new(),
            in_ring,
            out_ring,
        }
    }

    pub fn in_ring(&self) -> &IncomingRing<M> {
        &self.in_ring
    }

    pub fn out_ring(&self) -> &OutgoingRing<M> {
        &self.out_ring
    }

    pub fn signal(&self) {
        self.signal.signal_remote();
    }

    fn poll_ready(&self, cx: &mut Context<'_>, for_outgoing: bool) -> Poll<Result<(), PollError>> {
        self.multi_waker
            .poll_wrapped(cx, for_outgoing.into(), |cx| {
                self.signal
                    .poll_for_signal(cx)
                    .map_err(|ChannelClosed| PollError::Closed)
            })
    }
}

#[derive(Debug)]
pub(crate) enum PollError {
    Ring(ring::Error),
    Closed,
}

#[derive(Debug)]
pub struct ReadState {
    pub ptrs: ring::IncomingOffset,
    ready: bool,
    masked: bool,
}

impl ReadState {
    pub fn new(ptrs: ring::IncomingOffset) -> Self {
        Self {
            ptrs,
            ready: false,
            // New incoming rings start masked. Clearing the mask is what
            // guarantees a notification, so start from the masked state.
            masked: true,
        }
    }

    /// Polls the incoming ring for readiness.
    pub fn poll_ready<M: RingMem>(
        &mut self,
        cx: &mut Context<'_>,
        core: &Core<M>,
    ) -> Poll<Result<(), PollError>> {
        while !self.ready {
            // The ring is believed to be empty. Unmask interrupts before
            // checking again so that a concurrent write is not missed.
            if self.masked {
                core.in_ring.set_interrupt_mask(false);
                self.masked = false;
            } else {
                core.in_ring
                    .verify_interrupts_unmasked()
                    .map_err(PollError::Ring)?;
            }

            if core
                .in_ring
                .can_read(&mut self.ptrs)
                .map_err(PollError::Ring)?
            {
                // The mask stays clear until packets are actually removed;
                // the producer only signals on the empty to non-empty
                // transition anyway.
                self.ready = true;
            } else {
                std::task::ready!(core.poll_ready(cx, false))?;
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Clears the cached ready state. Called when the ring is known to be
    /// empty.
    pub fn clear_ready(&mut self) {
        self.ready = false;
    }

    /// Masks interrupts while packets are being drained, so that the
    /// producer does not signal for packets the consumer is about to read
    /// anyway.
    pub fn clear_poll<M: RingMem>(&mut self, core: &Core<M>) {
        if !self.masked {
            core.in_ring.set_interrupt_mask(true);
            self.masked = true;
        }
    }
}

#[derive(Debug)]
pub struct WriteState {
    pub ptrs: OutgoingOffset,
    ready: bool,
    pending_size: usize,
}

impl WriteState {
    pub fn new(ptrs: OutgoingOffset) -> Self {
        Self {
            ptrs,
            ready: false,
            pending_size: 0,
        }
    }

    /// Polls the outgoing ring for room to send `send_size` bytes.
    pub fn poll_ready<M: RingMem>(
        &mut self,
        cx: &mut Context<'_>,
        core: &Core<M>,
        send_size: usize,
    ) -> Poll<Result<(), PollError>> {
        while !self.ready {
            // The ring is believed to be full. Publish the pending send size
            // before checking again.
            if self.pending_size < send_size {
                // Ask to be woken only once a quarter of the ring is free (and
                // the packet fits), to avoid ping-ponging with the consumer.
                self.pending_size = send_size.max(core.out_ring().maximum_packet_size() / 4);
                core.out_ring
                    .set_pending_send_size(self.pending_size)
                    .map_err(PollError::Ring)?;
            }
            if core
                .out_ring
                .can_write(&mut self.ptrs, send_size)
                .map_err(PollError::Ring)?
            {
                self.ready = true;
                // A larger pending size than needed would cause spurious
                // signals from the consumer.
                if self.pending_size > send_size {
                    self.clear_poll(core).map_err(PollError::Ring)?;
                }
            } else {
                std::task::ready!(core.poll_ready(cx, true))?;
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Clears the cached ready state. Called when the ring is known to be
    /// full.
    pub fn clear_ready(&mut self) {
        self.ready = false;
    }

    /// Withdraws the request for a ring-not-full signal. Called just before
    /// inserting packets.
    pub fn clear_poll<M: RingMem>(&mut self, core: &Core<M>) -> Result<(), ring::Error> {
        if self.pending_size != 0 {
            core.out_ring.set_pending_send_size(0)?;
            self.pending_size = 0;
        }
        Ok(())
    }
}
