// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPADL-backed ring buffers.
//!
//! An open channel's two rings live in a single GPADL. The first
//! `ring_buffer_page_offset` pages hold the ring the opening endpoint sends on,
//! the remaining pages the ring it receives on. Each ring is one control page
//! followed by its data pages.

use crate::CONTROL_WORD_COUNT;
use crate::IncomingRing;
use crate::OutgoingRing;
use crate::PAGE_SIZE;
use crate::RingMem;
use crate::gparange::MultiPagedRangeBuf;
use crate::mem::load_bytes;
use crate::mem::store_bytes;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use thiserror::Error;

/// Memory shared with the opposite endpoint, provided by the layer below the
/// transport.
pub trait SharedMemory {
    /// The locked pages of one ring.
    type Pages: RingPages + Sync;

    /// Locks the pages of a ring. `gpns[0]` is the control page, the rest are
    /// data pages in ring order.
    fn lock_ring_pages(&self, gpns: &[u64]) -> Result<Self::Pages, GpadlRingError>;
}

#[derive(Debug, Error)]
pub enum GpadlRingError {
    #[error("ring gpadl must be a single page-aligned range")]
    UnalignedGpadl,
    #[error("ring buffer page offset {offset} does not split {page_count} pages into two rings")]
    InvalidPageOffset { offset: u32, page_count: usize },
    #[error("page {0:#x} is not shared")]
    UnmappedPage(u64),
    #[error("ring buffer error")]
    Ring(#[source] crate::Error),
}

/// Which endpoint of the channel is mapping the rings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RingRole {
    /// The endpoint that sent the open request and owns the GPADL.
    Opener,
    /// The endpoint that offered the channel.
    Offerer,
}

/// Splits the page list of a ring GPADL at `ring_buffer_page_offset` into the
/// opener's send ring pages and receive ring pages.
pub fn split_ring_gpadl<T: AsRef<[u64]>>(
    gpadl: &MultiPagedRangeBuf<T>,
    ring_buffer_page_offset: u32,
) -> Result<(&[u64], &[u64]), GpadlRingError> {
    let range = gpadl
        .contiguous_aligned()
        .ok_or(GpadlRingError::UnalignedGpadl)?;
    let gpns = range.gpns();
    let offset = ring_buffer_page_offset as usize;
    // Each ring needs a control page and at least one data page.
    if offset < 2 || gpns.len() < offset + 2 {
        return Err(GpadlRingError::InvalidPageOffset {
            offset: ring_buffer_page_offset,
            page_count: gpns.len(),
        });
    }
    Ok(gpns.split_at(offset))
}

/// The locked pages of one ring.
pub trait RingPages: Send {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT];

    fn data_page_count(&self) -> usize;

    /// Data page `index`, in ring order.
    fn data_page(&self, index: usize) -> &[AtomicU8; PAGE_SIZE];
}

/// [`RingMem`] over the pages of a ring GPADL, which need not be contiguous.
#[derive(Debug, Clone)]
pub struct GpadlRingMem<P>(P);

impl<P: RingPages> GpadlRingMem<P> {
    pub fn new(pages: P) -> Self {
        Self(pages)
    }

    /// Calls `f` with each page piece covering `len` bytes at ring offset
    /// `addr`, and the number of bytes covered before it.
    fn for_each_chunk(&self, addr: usize, len: usize, mut f: impl FnMut(&[AtomicU8], usize)) {
        let mut done = 0;
        while done < len {
            let at = addr + done;
            let page = self.0.data_page((at / PAGE_SIZE) % self.0.data_page_count());
            let start = at % PAGE_SIZE;
            let n = (PAGE_SIZE - start).min(len - done);
            f(&page[start..start + n], done);
            done += n;
        }
    }
}

impl<P: RingPages> RingMem for GpadlRingMem<P> {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        self.0.control()
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        self.for_each_chunk(addr, data.len(), |src, done| {
            load_bytes(src, &mut data[done..])
        });
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        self.for_each_chunk(addr, data.len(), |dst, done| {
            store_bytes(dst, &data[done..])
        });
    }

    fn len(&self) -> usize {
        self.0.data_page_count() * PAGE_SIZE
    }
}

/// The rings of an open channel, from one endpoint's point of view.
pub type ChannelRings<P> = (IncomingRing<GpadlRingMem<P>>, OutgoingRing<GpadlRingMem<P>>);

/// Creates the incoming and outgoing rings for a channel whose ring GPADL is
/// `gpadl`.
pub fn make_rings<S: SharedMemory, T: AsRef<[u64]>>(
    mem: &S,
    gpadl: &MultiPagedRangeBuf<T>,
    ring_buffer_page_offset: u32,
    role: RingRole,
) -> Result<ChannelRings<S::Pages>, GpadlRingError> {
    let (opener_send, opener_receive) = split_ring_gpadl(gpadl, ring_buffer_page_offset)?;
    let (incoming, outgoing) = match role {
        RingRole::Opener => (opener_receive, opener_send),
        RingRole::Offerer => (opener_send, opener_receive),
    };
    let incoming = IncomingRing::new(GpadlRingMem::new(mem.lock_ring_pages(incoming)?))
        .map_err(GpadlRingError::Ring)?;
    let outgoing = OutgoingRing::new(GpadlRingMem::new(mem.lock_ring_pages(outgoing)?))
        .map_err(GpadlRingError::Ring)?;
    Ok((incoming, outgoing))
}

struct PoolPage {
    control: [AtomicU32; CONTROL_WORD_COUNT],
    data: Box<[AtomicU8; PAGE_SIZE]>,
}

/// A fixed set of in-process pages addressed by page number. Useful for tests
/// and for endpoints that share an address space.
#[derive(Clone)]
pub struct PagePool {
    base_gpn: u64,
    pages: Arc<Vec<Arc<PoolPage>>>,
}

impl Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("base_gpn", &self.base_gpn)
            .field("page_count", &self.pages.len())
            .finish()
    }
}

impl PagePool {
    /// Allocates `page_count` zeroed pages numbered from `base_gpn`.
    pub fn new(base_gpn: u64, page_count: usize) -> Self {
        let pages = (0..page_count)
            .map(|_| {
                Arc::new(PoolPage {
                    control: [0; CONTROL_WORD_COUNT].map(Into::into),
                    data: Box::new(std::array::from_fn(|_| AtomicU8::new(0))),
                })
            })
            .collect();
        Self {
            base_gpn,
            pages: Arc::new(pages),
        }
    }

    /// The page numbers of every page in the pool.
    pub fn gpns(&self) -> Vec<u64> {
        (self.base_gpn..self.base_gpn + self.pages.len() as u64).collect()
    }

    fn page(&self, gpn: u64) -> Result<Arc<PoolPage>, GpadlRingError> {
        gpn.checked_sub(self.base_gpn)
            .and_then(|i| self.pages.get(i as usize))
            .cloned()
            .ok_or(GpadlRingError::UnmappedPage(gpn))
    }
}

/// Ring pages locked from a [`PagePool`].
pub struct PoolRingPages {
    control: Arc<PoolPage>,
    data: Vec<Arc<PoolPage>>,
}

impl RingPages for PoolRingPages {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        &self.control.control
    }

    fn data_page_count(&self) -> usize {
        self.data.len()
    }

    fn data_page(&self, index: usize) -> &[AtomicU8; PAGE_SIZE] {
        &self.data[index].data
    }
}

impl Debug for PoolRingPages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRingPages")
            .field("data_pages", &self.data.len())
            .finish()
    }
}

impl SharedMemory for PagePool {
    type Pages = PoolRingPages;

    fn lock_ring_pages(&self, gpns: &[u64]) -> Result<Self::Pages, GpadlRingError> {
        let (&control, data) = gpns
            .split_first()
            .ok_or(GpadlRingError::UnalignedGpadl)?;
        Ok(PoolRingPages {
            control: self.page(control)?,
            data: data
                .iter()
                .map(|&gpn| self.page(gpn))
                .collect::<Result<_, _>>()?,
        })
    }
}
