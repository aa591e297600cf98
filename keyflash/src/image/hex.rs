//! Intel HEX image parser.
//!
//! Keyboard firmware ships as Intel HEX text. Each line is one record:
//!
//! ```text
//! :LLAAAATT<data...>CC
//!  |  |   |          +-- checksum (two's complement of the byte sum)
//!  |  |   +------------- record type
//!  |  +----------------- 16-bit address offset
//!  +-------------------- data length
//! ```
//!
//! Supported record types: 00 data, 01 end of file, 02 extended segment
//! address, 03 start segment address, 04 extended linear address, 05 start
//! linear address.

use std::fs;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::{Error, Result};

/// Record type: data.
const RECORD_DATA: u8 = 0x00;
/// Record type: end of file.
const RECORD_EOF: u8 = 0x01;
/// Record type: extended segment address.
const RECORD_EXT_SEGMENT: u8 = 0x02;
/// Record type: start segment address.
const RECORD_START_SEGMENT: u8 = 0x03;
/// Record type: extended linear address.
const RECORD_EXT_LINEAR: u8 = 0x04;
/// Record type: start linear address.
const RECORD_START_LINEAR: u8 = 0x05;

/// Largest base-to-end span accepted, which bounds what `to_flat` allocates.
pub const MAX_IMAGE_SPAN: u32 = 16 * 1024 * 1024;

/// A contiguous run of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexSegment {
    /// Absolute start address.
    pub address: u32,
    /// Segment bytes.
    pub data: Vec<u8>,
}

impl HexSegment {
    /// Address one past the last byte.
    ///
    /// Parsed segments always end inside the 32-bit address space.
    pub fn end(&self) -> u32 {
        self.checked_end().unwrap_or(u32::MAX)
    }

    fn checked_end(&self) -> Option<u32> {
        u32::try_from(self.data.len())
            .ok()
            .and_then(|len| self.address.checked_add(len))
    }
}

/// Parsed Intel HEX image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    segments: Vec<HexSegment>,
    start_address: Option<u32>,
}

impl HexImage {
    /// Parse HEX text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut segments: Vec<HexSegment> = Vec::new();
        let mut start_address = None;
        let mut base: u32 = 0;
        let mut saw_eof = false;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let record = raw.trim();
            if record.is_empty() {
                continue;
            }
            if saw_eof {
                return Err(invalid(line, "data after end-of-file record"));
            }

            let bytes = decode_record(line, record)?;
            let len = bytes[0] as usize;
            let offset = u32::from(BigEndian::read_u16(&bytes[1..3]));
            let kind = bytes[3];
            let data = &bytes[4..4 + len];

            match kind {
                RECORD_DATA => {
                    let address = base
                        .checked_add(offset)
                        .ok_or_else(|| invalid(line, "address overflow"))?;
                    if address.checked_add(u32::from(bytes[0])).is_none() {
                        return Err(invalid(line, "data runs past the 32-bit address space"));
                    }
                    match segments.last_mut() {
                        Some(last) if last.end() == address => last.data.extend_from_slice(data),
                        _ => segments.push(HexSegment {
                            address,
                            data: data.to_vec(),
                        }),
                    }
                },
                RECORD_EOF => saw_eof = true,
                RECORD_EXT_SEGMENT => {
                    expect_len(line, len, 2)?;
                    base = u32::from(BigEndian::read_u16(data)) << 4;
                },
                RECORD_EXT_LINEAR => {
                    expect_len(line, len, 2)?;
                    base = u32::from(BigEndian::read_u16(data)) << 16;
                },
                RECORD_START_SEGMENT => {
                    expect_len(line, len, 4)?;
                    let cs = u32::from(BigEndian::read_u16(&data[..2]));
                    let ip = u32::from(BigEndian::read_u16(&data[2..]));
                    start_address = Some((cs << 4) + ip);
                },
                RECORD_START_LINEAR => {
                    expect_len(line, len, 4)?;
                    start_address = Some(BigEndian::read_u32(data));
                },
                other => return Err(invalid(line, &format!("unknown record type {other:02X}"))),
            }
        }

        if !saw_eof {
            return Err(invalid(
                text.lines().count().max(1),
                "missing end-of-file record",
            ));
        }

        segments.sort_by_key(|s| s.address);
        let segments = merge_segments(segments)?;
        if let (Some(first), Some(last)) = (segments.first(), segments.last()) {
            let span = last.end() - first.address;
            if span > MAX_IMAGE_SPAN {
                return Err(Error::InvalidHex {
                    line: 0,
                    reason: format!(
                        "image spans 0x{:08X}..0x{:08X}, more than {MAX_IMAGE_SPAN} bytes",
                        first.address,
                        last.end()
                    ),
                });
            }
        }
        debug!(
            "Parsed HEX image: {} segment(s), {} bytes",
            segments.len(),
            segments.iter().map(|s| s.data.len()).sum::<usize>()
        );

        Ok(Self {
            segments,
            start_address,
        })
    }

    /// Read and parse a HEX file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Segments in ascending address order.
    pub fn segments(&self) -> &[HexSegment] {
        &self.segments
    }

    /// Entry point, if the image declares one.
    pub fn start_address(&self) -> Option<u32> {
        self.start_address
    }

    /// Number of data bytes, excluding gaps.
    pub fn data_len(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.data.len())
            .sum()
    }

    /// Lowest address covered.
    pub fn base_address(&self) -> Option<u32> {
        self.segments
            .first()
            .map(|s| s.address)
    }

    /// One past the highest address covered.
    pub fn end_address(&self) -> Option<u32> {
        self.segments
            .last()
            .map(HexSegment::end)
    }

    /// Flatten into one buffer starting at the base address, filling gaps.
    pub fn to_flat(&self, fill: u8) -> (u32, Vec<u8>) {
        let (Some(base), Some(end)) = (self.base_address(), self.end_address()) else {
            return (0, Vec::new());
        };

        let mut flat = vec![fill; (end - base) as usize];
        for segment in &self.segments {
            let start = (segment.address - base) as usize;
            flat[start..start + segment.data.len()].copy_from_slice(&segment.data);
        }
        (base, flat)
    }
}

fn invalid(line: usize, reason: &str) -> Error {
    Error::InvalidHex {
        line,
        reason: reason.to_string(),
    }
}

fn expect_len(line: usize, len: usize, expected: usize) -> Result<()> {
    if len == expected {
        Ok(())
    } else {
        Err(invalid(
            line,
            &format!("record length {len}, expected {expected}"),
        ))
    }
}

/// Decode one `:`-prefixed record and verify its length and checksum.
fn decode_record(line: usize, record: &str) -> Result<Vec<u8>> {
    let hex = record
        .strip_prefix(':')
        .ok_or_else(|| invalid(line, "record does not start with ':'"))?;
    if !hex.is_ascii() {
        return Err(invalid(line, "non-hex character"));
    }
    if hex.len() % 2 != 0 {
        return Err(invalid(line, "odd number of hex digits"));
    }

    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| invalid(line, "non-hex character"))?;

    if bytes.len() < 5 {
        return Err(invalid(line, "record too short"));
    }
    let declared = bytes[0] as usize;
    if bytes.len() != declared + 5 {
        return Err(invalid(
            line,
            &format!(
                "declared {declared} data bytes, found {}",
                bytes.len() - 5
            ),
        ));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - 1);
    let expected = checksum_of(body);
    if expected != checksum[0] {
        return Err(Error::ChecksumMismatch {
            line,
            expected,
            actual: checksum[0],
        });
    }

    Ok(bytes)
}

/// Two's complement of the byte sum.
pub fn checksum_of(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

fn merge_segments(segments: Vec<HexSegment>) -> Result<Vec<HexSegment>> {
    let mut merged: Vec<HexSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if segment.checked_end().is_none() {
            return Err(Error::InvalidHex {
                line: 0,
                reason: format!("data at 0x{:08X} runs past the 32-bit address space", segment.address),
            });
        }
        match merged.last_mut() {
            Some(last) if last.end() > segment.address => {
                return Err(Error::InvalidHex {
                    line: 0,
                    reason: format!("overlapping data at 0x{:08X}", segment.address),
                });
            },
            Some(last) if last.end() == segment.address => {
                last.data.extend_from_slice(&segment.data);
            },
            _ => merged.push(segment),
        }
    }
    Ok(merged)
}
