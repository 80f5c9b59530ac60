// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides the [`Guid`] type used to name vmbus interface classes and
//! device instances. The in-memory layout matches the wire layout of the
//! 16-byte identifiers carried in channel offers.

#![forbid(unsafe_code)]

use std::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A mixed-endian 128-bit identifier: the first three fields are stored
/// little endian, the last eight bytes are stored in order.
#[repr(C)]
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Default for Guid {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// An error parsing a GUID string.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid GUID length")]
    Length,
    #[error("misplaced GUID separator or brace")]
    Format,
    #[error("invalid GUID hex digit")]
    Digit,
}

/// Offsets of the 32 hex digits in the unbraced string form.
const DIGIT_OFFSETS: [usize; 32] = {
    let mut offsets = [0; 32];
    let mut i = 0;
    let mut pos = 0;
    while i < 32 {
        if pos == 8 || pos == 13 || pos == 18 || pos == 23 {
            pos += 1;
        }
        offsets[i] = pos;
        i += 1;
        pos += 1;
    }
    offsets
};

const fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Self = Self {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Parses a GUID constant at compile time. Panics on malformed input, so
    /// use [`str::parse`] for anything not known statically.
    pub const fn from_static_str(value: &'static str) -> Self {
        match Self::parse(value.as_bytes()) {
            Ok(guid) => guid,
            Err(ParseError::Length) => panic!("invalid GUID length"),
            Err(ParseError::Format) => panic!("invalid GUID format"),
            Err(ParseError::Digit) => panic!("invalid GUID digit"),
        }
    }

    const fn parse(value: &[u8]) -> Result<Self, ParseError> {
        let base = match value.len() {
            36 => 0,
            38 => {
                if value[0] != b'{' || value[37] != b'}' {
                    return Err(ParseError::Format);
                }
                1
            }
            _ => return Err(ParseError::Length),
        };
        if value[base + 8] != b'-'
            || value[base + 13] != b'-'
            || value[base + 18] != b'-'
            || value[base + 23] != b'-'
        {
            return Err(ParseError::Format);
        }

        // Collect the 16 bytes in string order, then split into fields.
        let mut bytes = [0u8; 16];
        let mut i = 0;
        while i < 32 {
            let Some(nibble) = hex_value(value[base + DIGIT_OFFSETS[i]]) else {
                return Err(ParseError::Digit);
            };
            let shift = if i % 2 == 0 { 4 } else { 0 };
            bytes[i / 2] |= nibble << shift;
            i += 1;
        }

        Ok(Self {
            data1: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_be_bytes([bytes[4], bytes[5]]),
            data3: u16::from_be_bytes([bytes[6], bytes[7]]),
            data4: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        })
    }

    /// Returns true if this is the all-zero GUID.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7],
        )
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl FromStr for Guid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}
