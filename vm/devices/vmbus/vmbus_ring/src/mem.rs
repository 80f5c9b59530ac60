// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory behind a ring.

use crate::protocol::CONTROL_WORD_COUNT;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Memory backing one ring: the control words plus the data region.
///
/// Data accesses take ring offsets and wrap once at the end of the data
/// region, so `addr + len` may be up to twice the ring length.
pub trait RingMem: Send {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT];

    fn read_at(&self, addr: usize, data: &mut [u8]);

    /// As [`RingMem::read_at`], for 8-byte aligned offsets and lengths.
    fn read_aligned(&self, addr: usize, data: &mut [u8]) {
        debug_assert!(addr % 8 == 0 && data.len() % 8 == 0);
        self.read_at(addr, data)
    }

    fn write_at(&self, addr: usize, data: &[u8]);

    /// As [`RingMem::write_at`], for 8-byte aligned offsets and lengths.
    fn write_aligned(&self, addr: usize, data: &[u8]) {
        debug_assert!(addr % 8 == 0 && data.len() % 8 == 0);
        self.write_at(addr, data)
    }

    /// The length of the data region in bytes.
    fn len(&self) -> usize;
}

impl<T: RingMem + Sync> RingMem for &'_ T {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        (*self).control()
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        (*self).read_at(addr, data)
    }

    fn read_aligned(&self, addr: usize, data: &mut [u8]) {
        (*self).read_aligned(addr, data)
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        (*self).write_at(addr, data)
    }

    fn write_aligned(&self, addr: usize, data: &[u8]) {
        (*self).write_aligned(addr, data)
    }

    fn len(&self) -> usize {
        (*self).len()
    }
}

/// Copies shared bytes out. Each byte is loaded individually since the other
/// endpoint may be writing nearby.
pub(crate) fn load_bytes(src: &[AtomicU8], dst: &mut [u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.load(Ordering::Relaxed);
    }
}

pub(crate) fn store_bytes(dst: &[AtomicU8], src: &[u8]) {
    for (d, s) in dst.iter().zip(src) {
        d.store(*s, Ordering::Relaxed);
    }
}

/// Splits an access of `n` bytes at ring offset `addr` into the part before
/// the end of a `len` byte ring and the part that wraps to the start.
fn wrap(len: usize, addr: usize, n: usize) -> (Range<usize>, Range<usize>) {
    let start = if addr >= len { addr - len } else { addr };
    let head = n.min(len - start);
    (start..start + head, 0..n - head)
}

struct FlatRing {
    control: [AtomicU32; CONTROL_WORD_COUNT],
    data: Box<[AtomicU8]>,
}

/// A ring in a single in-process allocation, for tests and for endpoints that
/// share an address space.
#[derive(Clone)]
pub struct FlatRingMem(Arc<FlatRing>);

impl FlatRingMem {
    /// Allocates a zeroed ring with `len` data bytes.
    pub fn new(len: usize) -> Self {
        Self(Arc::new(FlatRing {
            control: std::array::from_fn(|_| AtomicU32::new(0)),
            data: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }))
    }
}

impl Debug for FlatRingMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FlatRingMem").field(&self.0.data.len()).finish()
    }
}

impl RingMem for FlatRingMem {
    fn control(&self) -> &[AtomicU32; CONTROL_WORD_COUNT] {
        &self.0.control
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        let (head, tail) = wrap(self.len(), addr, data.len());
        let (first, rest) = data.split_at_mut(head.len());
        load_bytes(&self.0.data[head], first);
        load_bytes(&self.0.data[tail], rest);
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        let (head, tail) = wrap(self.len(), addr, data.len());
        let (first, rest) = data.split_at(head.len());
        store_bytes(&self.0.data[head], first);
        store_bytes(&self.0.data[tail], rest);
    }

    fn len(&self) -> usize {
        self.0.data.len()
    }
}
