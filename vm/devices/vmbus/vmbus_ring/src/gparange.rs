// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest physical address range lists, as carried by GPADL registrations and
//! GPA direct packets.
//!
//! A range list is a sequence of `u64` words. Each range starts with a
//! [`GpaRange`] header word (byte length and offset into the first page),
//! followed by one page number per page the range touches.

use crate::PAGE_SIZE;
use smallvec::SmallVec;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub type GpnList = SmallVec<[u64; 64]>;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GpaRange {
    pub len: u32,
    pub offset: u32,
}

impl GpaRange {
    /// Packs the header into the `u64` word that precedes the page numbers.
    pub fn to_word(self) -> u64 {
        u64::from(self.len) | (u64::from(self.offset) << 32)
    }

    pub fn from_word(word: u64) -> Self {
        Self {
            len: word as u32,
            offset: (word >> 32) as u32,
        }
    }
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("empty range")]
    EmptyRange,
    #[error("empty byte count")]
    EmptyByteCount,
    #[error("range offset must be within the first page")]
    OffsetTooLarge,
    #[error("range too small")]
    RangeTooSmall,
    #[error("range list has trailing page numbers")]
    TrailingData,
    #[error("integer overflow")]
    Overflow,
}

/// A byte range spread over a list of guest pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PagedRange<'a> {
    offset: usize,
    len: usize,
    gpns: &'a [u64],
}

impl<'a> PagedRange<'a> {
    /// Returns a range of `len` bytes starting `offset` bytes into the first
    /// page of `gpns`, or `None` if `gpns` does not cover exactly the pages
    /// the range touches.
    pub fn new(offset: usize, len: usize, gpns: &'a [u64]) -> Option<Self> {
        if offset >= PAGE_SIZE || len == 0 {
            return None;
        }
        if (offset + len).div_ceil(PAGE_SIZE) != gpns.len() {
            return None;
        }
        Some(Self { offset, len, gpns })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn gpns(&self) -> &'a [u64] {
        self.gpns
    }

    /// The range header word for this range.
    pub fn header(&self) -> GpaRange {
        GpaRange {
            len: self.len as u32,
            offset: self.offset as u32,
        }
    }
}

fn parse(buf: &[u64]) -> Result<(PagedRange<'_>, &[u64]), Error> {
    let (hdr, gpns) = buf.split_first().ok_or(Error::EmptyRange)?;
    let hdr = GpaRange::from_word(*hdr);
    if hdr.len == 0 {
        return Err(Error::EmptyByteCount);
    }
    if hdr.offset as usize >= PAGE_SIZE {
        return Err(Error::OffsetTooLarge);
    }
    let pages = (hdr.len as usize)
        .checked_add(hdr.offset as usize)
        .ok_or(Error::Overflow)?
        .div_ceil(PAGE_SIZE);
    if gpns.len() < pages {
        return Err(Error::RangeTooSmall);
    }
    let (gpns, rest) = gpns.split_at(pages);
    Ok((
        PagedRange {
            offset: hdr.offset as usize,
            len: hdr.len as usize,
            gpns,
        },
        rest,
    ))
}

/// A validated list of `count` ranges.
#[derive(Debug, Default, Clone)]
pub struct MultiPagedRangeBuf<T: AsRef<[u64]>> {
    buf: T,
    count: usize,
}

impl<T: AsRef<[u64]>> MultiPagedRangeBuf<T> {
    /// Checks that `buf` holds exactly `count` well-formed ranges and nothing
    /// else.
    pub fn validate(count: usize, buf: &[u64]) -> Result<(), Error> {
        let mut rem = buf;
        for _ in 0..count {
            let (_, rest) = parse(rem)?;
            rem = rest;
        }
        if !rem.is_empty() {
            return Err(Error::TrailingData);
        }
        Ok(())
    }

    pub fn new(count: usize, buf: T) -> Result<Self, Error> {
        Self::validate(count, buf.as_ref())?;
        Ok(Self { buf, count })
    }

    pub fn iter(&self) -> MultiPagedRangeIter<'_> {
        MultiPagedRangeIter {
            buf: self.buf.as_ref(),
            count: self.count,
        }
    }

    pub fn range_count(&self) -> usize {
        self.count
    }

    pub fn first(&self) -> Option<PagedRange<'_>> {
        self.iter().next()
    }

    /// Returns the single page-aligned range this list consists of, if any.
    pub fn contiguous_aligned(&self) -> Option<PagedRange<'_>> {
        if self.count != 1 {
            return None;
        }
        let first = self.first()?;
        (first.offset() == 0 && first.len() % PAGE_SIZE == 0).then_some(first)
    }

    pub fn range_buffer(&self) -> &[u64] {
        self.buf.as_ref()
    }

    pub fn into_buffer(self) -> T {
        self.buf
    }
}

impl<'a> FromIterator<PagedRange<'a>> for MultiPagedRangeBuf<GpnList> {
    fn from_iter<I: IntoIterator<Item = PagedRange<'a>>>(iter: I) -> Self {
        let mut buf = GpnList::new();
        let mut count = 0;
        for range in iter {
            buf.push(range.header().to_word());
            buf.extend_from_slice(range.gpns());
            count += 1;
        }
        // Every `PagedRange` is valid by construction.
        Self { buf, count }
    }
}

#[derive(Clone, Debug)]
pub struct MultiPagedRangeIter<'a> {
    buf: &'a [u64],
    count: usize,
}

impl<'a> Iterator for MultiPagedRangeIter<'a> {
    type Item = PagedRange<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count == 0 {
            return None;
        }
        let (range, rest) = parse(self.buf).ok()?;
        self.count -= 1;
        self.buf = rest;
        Some(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn single_unaligned_range() {
        let buf = [
            GpaRange {
                len: 5000,
                offset: 100,
            }
            .to_word(),
            7,
            9,
        ];
        let ranges = MultiPagedRangeBuf::new(1, &buf[..]).unwrap();
        let range = ranges.first().unwrap();
        assert_eq!(range.offset(), 100);
        assert_eq!(range.len(), 5000);
        assert_eq!(range.gpns(), &[7, 9]);
        assert!(ranges.contiguous_aligned().is_none());
    }

    #[test]
    fn page_count_must_match() {
        let short = [GpaRange { len: 8192, offset: 0 }.to_word(), 1];
        assert_eq!(
            MultiPagedRangeBuf::<&[u64]>::validate(1, &short),
            Err(Error::RangeTooSmall)
        );
        let long = [GpaRange { len: 4096, offset: 0 }.to_word(), 1, 2];
        assert_eq!(
            MultiPagedRangeBuf::<&[u64]>::validate(1, &long),
            Err(Error::TrailingData)
        );
        let bad_offset = [GpaRange { len: 1, offset: 4096 }.to_word(), 1, 2];
        assert_eq!(
            MultiPagedRangeBuf::<&[u64]>::validate(1, &bad_offset),
            Err(Error::OffsetTooLarge)
        );
    }

    #[test]
    fn collect_ranges() {
        let a = [1, 2];
        let b = [3];
        let ranges: MultiPagedRangeBuf<GpnList> = [
            PagedRange::new(0, 8192, &a).unwrap(),
            PagedRange::new(16, 32, &b).unwrap(),
        ]
        .into_iter()
        .collect();
        assert_eq!(ranges.range_count(), 2);
        MultiPagedRangeBuf::<&[u64]>::validate(2, ranges.range_buffer()).unwrap();
        let collected: Vec<_> = ranges.iter().map(|r| r.gpns().to_vec()).collect();
        assert_eq!(collected, vec![vec![1, 2], vec![3]]);
    }
}
