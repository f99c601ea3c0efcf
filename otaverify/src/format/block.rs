// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Parser for the nested length-prefixed blocks that make up an APK signing
//! block. Nothing here copies data. Every parse returns [`ByteRange`] views
//! relative to the buffer that was passed in, and every length field is checked
//! against the remaining buffer before it is used.

use std::{fmt, ops::Range};

use byteorder::{ByteOrder, LittleEndian};
use num_traits::ToPrimitive;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{field:?} at offset {offset} needs {needed} bytes, but only {available} remain")]
    Truncated {
        field: &'static str,
        offset: u64,
        needed: u64,
        available: u64,
    },
    #[error("Entry at offset {offset} has length {length}, which cannot fit the 4-byte ID")]
    EntryTooShort { offset: u64, length: u64 },
    #[error("Block length {0} does not fit in 32 bits")]
    LengthTooLarge(u64),
}

type Result<T> = std::result::Result<T, Error>;

/// A non-owning view into a byte buffer.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u32,
}

impl fmt::Debug for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.offset, self.end())
    }
}

impl ByteRange {
    pub fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Move the range forward by `base` bytes. This is used to convert a range
    /// relative to a child block into one relative to the parent.
    pub fn shift(&self, base: u64) -> Option<Self> {
        let offset = self.offset.checked_add(base)?;
        offset.checked_add(u64::from(self.length))?;

        Some(Self::new(offset, self.length))
    }

    fn to_range(self) -> Option<Range<usize>> {
        let start = self.offset.to_usize()?;
        let end = start.checked_add(self.length.to_usize()?)?;

        Some(start..end)
    }

    /// Get the bytes covered by this range within `data`.
    pub fn slice<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        self.to_range()
            .and_then(|r| data.get(r))
            .ok_or_else(|| Error::Truncated {
                field: "range",
                offset: self.offset,
                needed: u64::from(self.length),
                available: (data.len() as u64).saturating_sub(self.offset),
            })
    }
}

fn header<'a>(data: &'a [u8], field: &'static str, size: usize) -> Result<&'a [u8]> {
    data.get(..size).ok_or(Error::Truncated {
        field,
        offset: 0,
        needed: size as u64,
        available: data.len() as u64,
    })
}

/// Parse a 4-byte little-endian length followed by that many bytes. Returns the
/// range of the data and the offset of the first byte after it.
pub fn parse_length_prefixed(data: &[u8]) -> Result<(ByteRange, usize)> {
    let length = LittleEndian::read_u32(header(data, "length", 4)?);
    let available = data.len() - 4;
    let range = ByteRange::new(4, length);

    match length.to_usize() {
        Some(n) if n <= available => Ok((range, 4 + n)),
        _ => Err(Error::Truncated {
            field: "length-prefixed data",
            offset: 4,
            needed: u64::from(length),
            available: available as u64,
        }),
    }
}

/// Parse an 8-byte little-endian length, a 4-byte little-endian ID, and a value
/// of `length - 4` bytes. Returns the ID, the range of the value, and the
/// offset of the first byte after the value.
pub fn parse_length_id_value(data: &[u8]) -> Result<(u32, ByteRange, usize)> {
    let header = header(data, "length-id header", 12)?;
    let length = LittleEndian::read_u64(&header[..8]);
    let id = LittleEndian::read_u32(&header[8..12]);

    if length < 4 {
        return Err(Error::EntryTooShort { offset: 0, length });
    }

    let value_len = length - 4;
    let available = (data.len() - 12) as u64;

    if value_len > available {
        return Err(Error::Truncated {
            field: "entry value",
            offset: 12,
            needed: value_len,
            available,
        });
    }

    let value_len = u32::try_from(value_len).map_err(|_| Error::LengthTooLarge(value_len))?;
    let range = ByteRange::new(12, value_len);

    // Cannot overflow since the value fits in the buffer.
    Ok((id, range, 12 + value_len as usize))
}

/// Adjust the offset inside a parse error to be relative to the parent buffer.
fn relocate(e: Error, base: usize) -> Error {
    let base = base as u64;

    match e {
        Error::Truncated {
            field,
            offset,
            needed,
            available,
        } => Error::Truncated {
            field,
            offset: offset + base,
            needed,
            available,
        },
        Error::EntryTooShort { offset, length } => Error::EntryTooShort {
            offset: offset + base,
            length,
        },
        e => e,
    }
}

/// Iterator over a sequence of length-prefixed blocks that fill a buffer. The
/// ranges are relative to the start of the buffer. Iteration stops after the
/// first error.
pub struct LengthPrefixedList<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LengthPrefixedList<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Iterator for LengthPrefixedList<'_> {
    type Item = Result<ByteRange>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }

        let base = self.pos;

        match parse_length_prefixed(&self.data[base..]) {
            Ok((range, next)) => {
                self.pos = base + next;
                Some(Ok(ByteRange::new(range.offset + base as u64, range.length)))
            }
            Err(e) => {
                self.pos = self.data.len();
                Some(Err(relocate(e, base)))
            }
        }
    }
}

/// Iterator over a sequence of length-id-value entries that fill a buffer.
/// Unknown IDs are yielded too so that callers can skip them. Iteration stops
/// after the first error.
pub struct LengthIdValueList<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LengthIdValueList<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Iterator for LengthIdValueList<'_> {
    type Item = Result<(u32, ByteRange)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }

        let base = self.pos;

        match parse_length_id_value(&self.data[base..]) {
            Ok((id, range, next)) => {
                self.pos = base + next;
                Some(Ok((
                    id,
                    ByteRange::new(range.offset + base as u64, range.length),
                )))
            }
            Err(e) => {
                self.pos = self.data.len();
                Some(Err(relocate(e, base)))
            }
        }
    }
}

/// Append a 4-byte little-endian length followed by `value`.
pub fn encode_length_prefixed(out: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    let length =
        u32::try_from(value.len()).map_err(|_| Error::LengthTooLarge(value.len() as u64))?;

    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(value);

    Ok(())
}

/// Append an 8-byte little-endian length (covering the ID), a 4-byte
/// little-endian ID, and `value`.
pub fn encode_length_id_value(out: &mut Vec<u8>, id: u32, value: &[u8]) -> Result<()> {
    let length = u32::try_from(value.len())
        .map(|n| u64::from(n) + 4)
        .map_err(|_| Error::LengthTooLarge(value.len() as u64))?;

    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(value);

    Ok(())
}
