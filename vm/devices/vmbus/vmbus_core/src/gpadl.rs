// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Splitting a GPADL range buffer into header and body messages, and
//! reassembling it on the receiving side.

use crate::OutgoingMessage;
use crate::protocol::ChannelId;
use crate::protocol::GpadlBody;
use crate::protocol::GpadlHeader;
use crate::protocol::GpadlId;
use crate::protocol::HEADER_SIZE;
use crate::protocol::MAX_MESSAGE_SIZE;
use std::collections::BTreeMap;
use thiserror::Error;
use vmbus_ring::PAGE_SIZE;
use vmbus_ring::gparange;
use vmbus_ring::gparange::GpnList;
use vmbus_ring::gparange::MultiPagedRangeBuf;
use vmbus_ring::gparange::PagedRange;
use zerocopy::IntoBytes;

/// The range buffer of a GPADL.
pub type GpadlBuffer = MultiPagedRangeBuf<GpnList>;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum GpadlError {
    #[error("a {0} byte message cannot carry gpadl page numbers")]
    InvalidMessageSize(usize),
    #[error("gpadl has no pages")]
    Empty,
    #[error("gpadl range buffer does not fit in a gpadl header")]
    TooLarge,
    #[error("duplicate gpadl body message {0}")]
    DuplicateBody(u32),
    #[error("gpadl body message {0} is beyond the declared length")]
    Overflow(u32),
    #[error("gpadl is already complete")]
    AlreadyComplete,
    #[error("gpadl is missing body messages")]
    Incomplete,
    #[error("invalid gpadl range buffer")]
    InvalidRanges(#[source] gparange::Error),
}

/// Builds a range buffer with a single page-aligned range covering `gpns`.
pub fn gpadl_buffer_from_pages(gpns: &[u64]) -> Result<GpadlBuffer, GpadlError> {
    let range = PagedRange::new(0, gpns.len() * PAGE_SIZE, gpns).ok_or(GpadlError::Empty)?;
    Ok([range].into_iter().collect())
}

/// Splits range buffers into a [`GpadlHeader`] message followed by as many
/// [`GpadlBody`] messages as needed, given the maximum message size of the
/// lower transport.
#[derive(Debug, Copy, Clone)]
pub struct GpadlMessageBuilder {
    header_capacity: usize,
    body_capacity: usize,
}

impl GpadlMessageBuilder {
    pub fn new(max_message_size: usize) -> Result<Self, GpadlError> {
        let entries = |fixed: usize| {
            max_message_size
                .checked_sub(HEADER_SIZE + fixed)
                .map(|n| n / size_of::<u64>())
                .filter(|&n| n > 0)
        };
        if max_message_size > MAX_MESSAGE_SIZE {
            return Err(GpadlError::InvalidMessageSize(max_message_size));
        }
        let (Some(header_capacity), Some(body_capacity)) = (
            entries(size_of::<GpadlHeader>()),
            entries(size_of::<GpadlBody>()),
        ) else {
            return Err(GpadlError::InvalidMessageSize(max_message_size));
        };
        Ok(Self {
            header_capacity,
            body_capacity,
        })
    }

    /// The number of `u64` entries carried by the header message.
    pub fn header_capacity(&self) -> usize {
        self.header_capacity
    }

    /// The number of `u64` entries carried by each body message.
    pub fn body_capacity(&self) -> usize {
        self.body_capacity
    }

    /// Returns the messages that register `buf` as `gpadl_id` on `channel_id`.
    pub fn build<T: AsRef<[u64]>>(
        &self,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
        buf: &MultiPagedRangeBuf<T>,
    ) -> Result<Vec<OutgoingMessage>, GpadlError> {
        let words = buf.range_buffer();
        if buf.range_count() == 0 || words.is_empty() {
            return Err(GpadlError::Empty);
        }
        let header = GpadlHeader {
            channel_id,
            gpadl_id,
            len: size_of_val(words)
                .try_into()
                .map_err(|_| GpadlError::TooLarge)?,
            count: buf
                .range_count()
                .try_into()
                .map_err(|_| GpadlError::TooLarge)?,
        };

        let (first, remaining) = words.split_at(words.len().min(self.header_capacity));
        let mut messages = vec![
            OutgoingMessage::with_data(&header, first.as_bytes()).map_err(|_| GpadlError::TooLarge)?,
        ];
        for (msg_number, chunk) in remaining.chunks(self.body_capacity).enumerate() {
            let body = GpadlBody {
                msg_number: msg_number as u32,
                gpadl_id,
            };
            messages.push(
                OutgoingMessage::with_data(&body, chunk.as_bytes())
                    .map_err(|_| GpadlError::TooLarge)?,
            );
        }
        tracing::trace!(
            channel_id = channel_id.0,
            gpadl_id = gpadl_id.0,
            entries = words.len(),
            messages = messages.len(),
            "split gpadl"
        );
        Ok(messages)
    }
}

fn entries(data: &[u8], limit: usize) -> Vec<u64> {
    // Some senders always post the maximum message length, so only whole
    // entries up to the declared length are meaningful.
    let count = (data.len() / size_of::<u64>()).min(limit);
    let mut buf = vec![0u64; count];
    buf.as_mut_bytes()
        .copy_from_slice(&data[..count * size_of::<u64>()]);
    buf
}

/// Reassembles a GPADL range buffer from a header message and body messages
/// that may arrive in any order.
#[derive(Debug)]
pub struct GpadlAssembler {
    channel_id: ChannelId,
    gpadl_id: GpadlId,
    count: u16,
    expected: usize,
    header_entries: Vec<u64>,
    bodies: BTreeMap<u32, Vec<u64>>,
    complete: bool,
}

impl GpadlAssembler {
    /// Starts reassembly from a header message and its trailing data.
    pub fn new(header: &GpadlHeader, data: &[u8]) -> Result<Self, GpadlError> {
        let expected = header.entry_count();
        if header.count == 0 || expected == 0 {
            return Err(GpadlError::Empty);
        }
        let mut this = Self {
            channel_id: header.channel_id,
            gpadl_id: header.gpadl_id,
            count: header.count,
            expected,
            header_entries: entries(data, expected),
            bodies: BTreeMap::new(),
            complete: false,
        };
        this.update()?;
        Ok(this)
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn gpadl_id(&self) -> GpadlId {
        self.gpadl_id
    }

    /// Adds a body message. Returns true once every entry has arrived.
    pub fn add_body(&mut self, body: &GpadlBody, data: &[u8]) -> Result<bool, GpadlError> {
        if self.complete {
            return Err(GpadlError::AlreadyComplete);
        }
        if self.bodies.contains_key(&body.msg_number) {
            return Err(GpadlError::DuplicateBody(body.msg_number));
        }
        self.bodies
            .insert(body.msg_number, entries(data, self.expected));
        self.update()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn update(&mut self) -> Result<bool, GpadlError> {
        let mut total = self.header_entries.len();
        let mut next = 0;
        while total < self.expected {
            let Some(body) = self.bodies.get(&next) else {
                return Ok(false);
            };
            total += body.len();
            next += 1;
        }
        if let Some(&extra) = self.bodies.range(next..).next().map(|(n, _)| n) {
            return Err(GpadlError::Overflow(extra));
        }
        self.complete = true;
        Ok(true)
    }

    /// Returns the validated range buffer.
    pub fn finish(self) -> Result<GpadlBuffer, GpadlError> {
        if !self.complete {
            return Err(GpadlError::Incomplete);
        }
        let mut buf: GpnList = self.header_entries.into_iter().collect();
        for body in self.bodies.into_values() {
            buf.extend(body);
        }
        buf.truncate(self.expected);
        MultiPagedRangeBuf::new(self.count.into(), buf).map_err(GpadlError::InvalidRanges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use test_with_tracing::test;

    fn pages(n: u64) -> Vec<u64> {
        (0x1000..0x1000 + n).collect()
    }

    const VERSION: Option<crate::VersionInfo> = Some(crate::VersionInfo {
        version: crate::protocol::Version::Win10,
        feature_flags: crate::protocol::FeatureFlags::new(),
    });

    /// Parses built messages back into an assembler and the body messages.
    fn parse(messages: &[OutgoingMessage]) -> (GpadlAssembler, Vec<(GpadlBody, Vec<u8>)>) {
        let Message::GpadlHeader(header, data) = Message::parse(messages[0].data(), VERSION).unwrap()
        else {
            panic!("expected header");
        };
        let assembler = GpadlAssembler::new(&header, data).unwrap();
        let bodies = messages[1..]
            .iter()
            .map(|m| {
                let Message::GpadlBody(body, data) = Message::parse(m.data(), VERSION).unwrap() else {
                    panic!("expected body");
                };
                (body, data.to_vec())
            })
            .collect();
        (assembler, bodies)
    }

    #[test]
    fn split_sizes() {
        let builder = GpadlMessageBuilder::new(MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(builder.header_capacity(), GpadlHeader::MAX_DATA_VALUES);
        assert_eq!(builder.body_capacity(), GpadlBody::MAX_DATA_VALUES);

        // 1 range header word + 100 page numbers = 27 + 28 + 28 + 18 entries.
        let buf = gpadl_buffer_from_pages(&pages(100)).unwrap();
        let messages = builder.build(ChannelId(1), GpadlId(9), &buf).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].data().len(), MAX_MESSAGE_SIZE);
        assert_eq!(messages[3].data().len(), 16 + 18 * 8);

        let small = GpadlMessageBuilder::new(64).unwrap();
        assert_eq!(small.header_capacity(), 5);
        assert_eq!(small.body_capacity(), 6);
        assert_eq!(
            small.build(ChannelId(1), GpadlId(9), &buf).unwrap().len(),
            1 + (101 - 5_usize).div_ceil(6)
        );

        assert_eq!(
            GpadlMessageBuilder::new(24).unwrap_err(),
            GpadlError::InvalidMessageSize(24)
        );
        assert_eq!(
            GpadlMessageBuilder::new(MAX_MESSAGE_SIZE + 8).unwrap_err(),
            GpadlError::InvalidMessageSize(MAX_MESSAGE_SIZE + 8)
        );
    }

    #[test]
    fn header_only() {
        let builder = GpadlMessageBuilder::new(MAX_MESSAGE_SIZE).unwrap();
        let buf = gpadl_buffer_from_pages(&pages(4)).unwrap();
        let messages = builder.build(ChannelId(1), GpadlId(9), &buf).unwrap();
        assert_eq!(messages.len(), 1);
        let (assembler, _) = parse(&messages);
        assert!(assembler.is_complete());
        assert_eq!(assembler.finish().unwrap().range_buffer(), buf.range_buffer());
    }

    #[test]
    fn reassembly_is_order_independent() {
        let builder = GpadlMessageBuilder::new(MAX_MESSAGE_SIZE).unwrap();
        let buf = gpadl_buffer_from_pages(&pages(60)).unwrap();
        let messages = builder.build(ChannelId(1), GpadlId(9), &buf).unwrap();
        assert_eq!(messages.len(), 3);

        for order in [[0, 1], [1, 0]] {
            let (mut assembler, bodies) = parse(&messages);
            assert!(!assembler.is_complete());
            let (body, data) = &bodies[order[0]];
            assert!(!assembler.add_body(body, data).unwrap());
            let (body, data) = &bodies[order[1]];
            assert!(assembler.add_body(body, data).unwrap());
            assert_eq!(assembler.gpadl_id(), GpadlId(9));
            let result = assembler.finish().unwrap();
            assert_eq!(result.range_buffer(), buf.range_buffer());
            assert_eq!(result.first().unwrap().gpns(), pages(60).as_slice());
        }
    }

    #[test]
    fn reassembly_errors() {
        let builder = GpadlMessageBuilder::new(MAX_MESSAGE_SIZE).unwrap();
        let buf = gpadl_buffer_from_pages(&pages(60)).unwrap();
        let messages = builder.build(ChannelId(1), GpadlId(9), &buf).unwrap();

        let (mut assembler, bodies) = parse(&messages);
        assembler.add_body(&bodies[0].0, &bodies[0].1).unwrap();
        assert_eq!(
            assembler.add_body(&bodies[0].0, &bodies[0].1).unwrap_err(),
            GpadlError::DuplicateBody(0)
        );

        // A body numbered past the end is detected once the gap is filled.
        let (mut assembler, bodies) = parse(&messages);
        let stray = GpadlBody {
            msg_number: 2,
            gpadl_id: GpadlId(9),
        };
        assert!(!assembler.add_body(&stray, &[0; 8]).unwrap());
        assembler.add_body(&bodies[0].0, &bodies[0].1).unwrap();
        assert_eq!(
            assembler.add_body(&bodies[1].0, &bodies[1].1).unwrap_err(),
            GpadlError::Overflow(2)
        );

        let (mut assembler, bodies) = parse(&messages);
        assembler.add_body(&bodies[0].0, &bodies[0].1).unwrap();
        assembler.add_body(&bodies[1].0, &bodies[1].1).unwrap();
        assert_eq!(
            assembler.add_body(&stray, &[0; 8]).unwrap_err(),
            GpadlError::AlreadyComplete
        );

        let (assembler, _) = parse(&messages);
        assert_eq!(assembler.finish().unwrap_err(), GpadlError::Incomplete);
    }

    #[test]
    fn inconsistent_ranges_rejected() {
        // Declares two ranges but the buffer only holds one.
        let header = GpadlHeader {
            channel_id: ChannelId(1),
            gpadl_id: GpadlId(2),
            len: 32,
            count: 2,
        };
        let data = [
            gparange::GpaRange {
                len: 2 * PAGE_SIZE as u32,
                offset: 0,
            }
            .to_word(),
            1,
            2,
            0,
        ];
        let assembler = GpadlAssembler::new(&header, data.as_bytes()).unwrap();
        assert!(assembler.is_complete());
        assert!(matches!(
            assembler.finish().unwrap_err(),
            GpadlError::InvalidRanges(_)
        ));
    }

    #[test]
    fn trailing_bytes_ignored() {
        let header = GpadlHeader {
            channel_id: ChannelId(1),
            gpadl_id: GpadlId(2),
            len: 16,
            count: 1,
        };
        let mut data = [0u64; 27];
        data[0] = gparange::GpaRange {
            len: PAGE_SIZE as u32,
            offset: 0,
        }
        .to_word();
        data[1] = 0x55;
        data[2] = 0xdead;
        let assembler = GpadlAssembler::new(&header, data.as_bytes()).unwrap();
        let buf = assembler.finish().unwrap();
        assert_eq!(buf.first().unwrap().gpns(), &[0x55]);
    }
}
