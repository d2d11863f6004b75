//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Packet buffer with typed push/pop primitives
//!
//! A [`Packet`] owns its bytes exclusively and carries a read cursor. Outbound packets are
//! built by appending values in order; inbound packets are consumed by typed `pop_*` calls
//! that advance the cursor. A failed pop leaves the cursor where it was.

use crate::{CodecError, CodecResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Ordered key/value string pairs as carried on the wire
pub type KeyValues = Vec<(String, String)>;

const SIGN_BIT: u8 = 0x80;
const FIRST_CONTINUATION: u8 = 0x40;
const FIRST_MAGNITUDE: u8 = 0x3F;
const CONTINUATION: u8 = 0x80;
const MAGNITUDE: u8 = 0x7F;

/// Whether a packet is being read from or written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from a peer; consumed with `pop_*`
    Inbound,
    /// Being built for a peer; filled with `push_*`
    Outbound,
}

/// Wire layout of a string value, selected by the indicator byte
///
/// Bit `0x01` selects wide (UTF-16LE) characters over narrow (Latin-1) ones and bit `0x02`
/// selects a compact-index length prefix over a NUL terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    /// Latin-1 bytes followed by a NUL byte
    NarrowTerminated,
    /// Compact-index byte count followed by Latin-1 bytes
    NarrowPrefixed,
    /// UTF-16LE code units followed by a NUL unit
    WideTerminated,
    /// Compact-index unit count followed by UTF-16LE code units
    WidePrefixed,
}

impl StringEncoding {
    const WIDE: u8 = 0x01;
    const LENGTH_PREFIXED: u8 = 0x02;

    /// Indicator byte written ahead of the string
    pub fn indicator(self) -> u8 {
        match self {
            StringEncoding::NarrowTerminated => 0,
            StringEncoding::WideTerminated => Self::WIDE,
            StringEncoding::NarrowPrefixed => Self::LENGTH_PREFIXED,
            StringEncoding::WidePrefixed => Self::WIDE | Self::LENGTH_PREFIXED,
        }
    }

    /// Parse an indicator byte
    pub fn from_indicator(indicator: u8) -> CodecResult<Self> {
        match indicator {
            0 => Ok(StringEncoding::NarrowTerminated),
            Self::WIDE => Ok(StringEncoding::WideTerminated),
            Self::LENGTH_PREFIXED => Ok(StringEncoding::NarrowPrefixed),
            0x03 => Ok(StringEncoding::WidePrefixed),
            other => Err(CodecError::InvalidStringIndicator(other)),
        }
    }

    /// Smallest lossless layout for `value`
    ///
    /// Narrow when every character fits Latin-1, wide otherwise; length-prefixed only when
    /// the value itself contains NUL.
    pub fn for_value(value: &str) -> Self {
        let wide = value.chars().any(|c| u32::from(c) > 0xFF);
        let prefixed = value.contains('\0');
        match (wide, prefixed) {
            (false, false) => StringEncoding::NarrowTerminated,
            (false, true) => StringEncoding::NarrowPrefixed,
            (true, false) => StringEncoding::WideTerminated,
            (true, true) => StringEncoding::WidePrefixed,
        }
    }

    /// True for UTF-16 layouts
    pub fn is_wide(self) -> bool {
        self.indicator() & Self::WIDE != 0
    }

    /// True for layouts carrying an explicit length
    pub fn is_length_prefixed(self) -> bool {
        self.indicator() & Self::LENGTH_PREFIXED != 0
    }
}

/// Number of bytes the compact-index encoding of `value` occupies
pub fn compact_index_len(value: i32) -> usize {
    match value.unsigned_abs() {
        m if m < 1 << 6 => 1,
        m if m < 1 << 13 => 2,
        m if m < 1 << 20 => 3,
        m if m < 1 << 27 => 4,
        _ => 5,
    }
}

/// Number of bytes [`Packet::push_string`] writes for `value`, indicator included
pub fn encoded_string_len(value: &str) -> usize {
    match StringEncoding::for_value(value) {
        StringEncoding::NarrowTerminated => value.chars().count() + 2,
        StringEncoding::NarrowPrefixed => {
            let len = value.chars().count();
            1 + compact_index_len(clamp_len(len)) + len
        }
        StringEncoding::WideTerminated => value.encode_utf16().count() * 2 + 3,
        StringEncoding::WidePrefixed => {
            let units = value.encode_utf16().count();
            1 + compact_index_len(clamp_len(units)) + units * 2
        }
    }
}

/// Number of bytes [`Packet::push_key_values`] writes for `pairs`
pub fn encoded_key_values_len<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> usize {
    pairs.iter().fold(
        compact_index_len(clamp_len(pairs.len())),
        |total, (key, value)| {
            total + encoded_string_len(key.as_ref()) + encoded_string_len(value.as_ref())
        },
    )
}

/// An exclusively owned byte buffer plus a read cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buffer: BytesMut,
    cursor: usize,
    direction: Direction,
}

impl Default for Packet {
    fn default() -> Self {
        Self::outbound()
    }
}

impl Packet {
    /// Create an empty outbound packet
    pub fn outbound() -> Self {
        Self::with_capacity(64)
    }

    /// Create an empty outbound packet with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            cursor: 0,
            direction: Direction::Outbound,
        }
    }

    /// Create an inbound packet over a copy of `data`
    pub fn inbound(data: &[u8]) -> Self {
        Self::from_bytes(BytesMut::from(data))
    }

    /// Create an inbound packet taking ownership of `buffer`
    pub fn from_bytes(buffer: BytesMut) -> Self {
        Self {
            buffer,
            cursor: 0,
            direction: Direction::Inbound,
        }
    }

    /// Direction of this packet
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Total length of the buffer in bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when the buffer holds no bytes at all
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current cursor position
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Bytes left between the cursor and the end of the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    /// The whole buffer, independent of the cursor
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// The bytes not yet consumed
    pub fn unread(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    /// Freeze the buffer for transmission
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Turn a finished outbound packet into an inbound one positioned at the start
    pub fn into_inbound(self) -> Self {
        Self::from_bytes(self.buffer)
    }

    /// Move the cursor back to the start of the buffer.
    ///
    /// Diagnostic only; the live protocol never re-reads a packet.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Fail unless every byte has been consumed
    pub fn expect_end(&self) -> CodecResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    fn atomically<T>(&mut self, op: impl FnOnce(&mut Self) -> CodecResult<T>) -> CodecResult<T> {
        let start = self.cursor;
        let result = op(self);
        if result.is_err() {
            self.cursor = start;
        }
        result
    }

    fn take(&mut self, needed: usize) -> CodecResult<&[u8]> {
        let available = self.remaining();
        if needed > available {
            return Err(CodecError::InsufficientData { needed, available });
        }
        let start = self.cursor;
        self.cursor += needed;
        Ok(&self.buffer[start..self.cursor])
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Append a single byte
    pub fn push_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.put_u8(value);
        self
    }

    /// Append an unsigned 16-bit integer (little-endian)
    pub fn push_u16(&mut self, value: u16) -> &mut Self {
        self.buffer.put_u16_le(value);
        self
    }

    /// Append a signed 32-bit integer (little-endian)
    pub fn push_i32(&mut self, value: i32) -> &mut Self {
        self.buffer.put_i32_le(value);
        self
    }

    /// Append raw bytes
    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    /// Append a compact index using the minimal number of bytes
    pub fn push_compact_index(&mut self, value: i32) -> &mut Self {
        let mut magnitude = value.unsigned_abs();
        let mut first = (magnitude as u8) & FIRST_MAGNITUDE;
        if value < 0 {
            first |= SIGN_BIT;
        }
        magnitude >>= 6;
        if magnitude == 0 {
            return self.push_u8(first);
        }
        self.push_u8(first | FIRST_CONTINUATION);
        for _ in 0..3 {
            let byte = (magnitude as u8) & MAGNITUDE;
            magnitude >>= 7;
            if magnitude == 0 {
                return self.push_u8(byte);
            }
            self.push_u8(byte | CONTINUATION);
        }
        self.push_u8(magnitude as u8)
    }

    /// Append a string in its smallest lossless layout
    pub fn push_string(&mut self, value: &str) -> &mut Self {
        self.push_string_as(value, StringEncoding::for_value(value))
    }

    /// Append a string in a specific layout.
    ///
    /// Characters outside Latin-1 are replaced by `?` in narrow layouts, and a terminated
    /// layout stops at the first NUL of `value`.
    pub fn push_string_as(&mut self, value: &str, encoding: StringEncoding) -> &mut Self {
        self.push_u8(encoding.indicator());
        match encoding {
            StringEncoding::NarrowTerminated => {
                for c in value.chars().take_while(|&c| c != '\0') {
                    self.buffer.put_u8(latin1(c));
                }
                self.buffer.put_u8(0);
            }
            StringEncoding::NarrowPrefixed => {
                let bytes: Vec<u8> = value.chars().map(latin1).collect();
                self.push_compact_index(clamp_len(bytes.len()));
                self.buffer.extend_from_slice(&bytes);
            }
            StringEncoding::WideTerminated => {
                for unit in value.encode_utf16().take_while(|&u| u != 0) {
                    self.buffer.put_u16_le(unit);
                }
                self.buffer.put_u16_le(0);
            }
            StringEncoding::WidePrefixed => {
                let units: Vec<u16> = value.encode_utf16().collect();
                self.push_compact_index(clamp_len(units.len()));
                for unit in units {
                    self.buffer.put_u16_le(unit);
                }
            }
        }
        self
    }

    /// Append a key/value array: a compact-index count followed by the strings pairwise
    pub fn push_key_values<K: AsRef<str>, V: AsRef<str>>(&mut self, pairs: &[(K, V)]) -> &mut Self {
        let count = clamp_len(pairs.len());
        self.push_compact_index(count);
        for (key, value) in pairs.iter().take(count as usize) {
            self.push_string(key.as_ref());
            self.push_string(value.as_ref());
        }
        self
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Read a single byte
    pub fn pop_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read an unsigned 16-bit integer (little-endian)
    pub fn pop_u16(&mut self) -> CodecResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a signed 32-bit integer (little-endian)
    pub fn pop_i32(&mut self) -> CodecResult<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read every unconsumed byte
    pub fn pop_remaining(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(self.unread());
        self.cursor = self.buffer.len();
        rest
    }

    /// Read a compact index
    ///
    /// Fails with [`CodecError::InsufficientData`] when the buffer ends while a continuation
    /// bit is still set, and with [`CodecError::CompactIndexOverflow`] when the magnitude does
    /// not fit an `i32`.
    pub fn pop_compact_index(&mut self) -> CodecResult<i32> {
        self.atomically(|packet| {
            let first = packet.pop_u8()?;
            let negative = first & SIGN_BIT != 0;
            let mut magnitude = u64::from(first & FIRST_MAGNITUDE);
            if first & FIRST_CONTINUATION != 0 {
                let mut shift = 6;
                let mut terminated = false;
                for _ in 0..3 {
                    let byte = packet.pop_u8()?;
                    magnitude |= u64::from(byte & MAGNITUDE) << shift;
                    shift += 7;
                    if byte & CONTINUATION == 0 {
                        terminated = true;
                        break;
                    }
                }
                if !terminated {
                    magnitude |= u64::from(packet.pop_u8()?) << shift;
                }
            }
            if negative {
                if magnitude > 1 << 31 {
                    return Err(CodecError::CompactIndexOverflow);
                }
                Ok((-(magnitude as i64)) as i32)
            } else {
                i32::try_from(magnitude).map_err(|_| CodecError::CompactIndexOverflow)
            }
        })
    }

    /// Read a string in any of the [`StringEncoding`] layouts
    pub fn pop_string(&mut self) -> CodecResult<String> {
        self.atomically(|packet| {
            let encoding = StringEncoding::from_indicator(packet.pop_u8()?)?;
            match encoding {
                StringEncoding::NarrowTerminated => {
                    let rest = packet.unread();
                    let end = rest
                        .iter()
                        .position(|&b| b == 0)
                        .ok_or(CodecError::MissingTerminator)?;
                    let value = rest[..end].iter().map(|&b| char::from(b)).collect();
                    packet.cursor += end + 1;
                    Ok(value)
                }
                StringEncoding::NarrowPrefixed => {
                    let len = packet.pop_length()?;
                    Ok(packet.take(len)?.iter().map(|&b| char::from(b)).collect())
                }
                StringEncoding::WideTerminated => {
                    let rest = packet.unread();
                    let mut units = Vec::new();
                    let mut consumed = None;
                    for (index, pair) in rest.chunks_exact(2).enumerate() {
                        let unit = u16::from_le_bytes([pair[0], pair[1]]);
                        if unit == 0 {
                            consumed = Some((index + 1) * 2);
                            break;
                        }
                        units.push(unit);
                    }
                    let consumed = consumed.ok_or(CodecError::MissingTerminator)?;
                    packet.cursor += consumed;
                    String::from_utf16(&units).map_err(|_| CodecError::InvalidUtf16)
                }
                StringEncoding::WidePrefixed => {
                    let len = packet.pop_length()?;
                    let bytes = packet.take(len.saturating_mul(2))?;
                    let units: Vec<u16> = bytes
                        .chunks_exact(2)
                        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                        .collect();
                    String::from_utf16(&units).map_err(|_| CodecError::InvalidUtf16)
                }
            }
        })
    }

    /// Read a key/value array, preserving pair order
    pub fn pop_key_values(&mut self) -> CodecResult<KeyValues> {
        self.atomically(|packet| {
            let count = packet.pop_length()?;
            // The shortest string is two bytes, so a pair needs at least four.
            let minimum = count.saturating_mul(4);
            if minimum > packet.remaining() {
                return Err(CodecError::InsufficientData {
                    needed: minimum,
                    available: packet.remaining(),
                });
            }
            let mut pairs = Vec::with_capacity(count);
            for _ in 0..count {
                let key = packet.pop_string()?;
                let value = packet.pop_string()?;
                pairs.push((key, value));
            }
            Ok(pairs)
        })
    }

    fn pop_length(&mut self) -> CodecResult<usize> {
        let len = self.pop_compact_index()?;
        usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))
    }
}

fn latin1(c: char) -> u8 {
    u8::try_from(u32::from(c)).unwrap_or(b'?')
}

fn clamp_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_index(value: i32) -> Vec<u8> {
        let mut packet = Packet::outbound();
        packet.push_compact_index(value);
        packet.as_bytes().to_vec()
    }

    #[test]
    fn compact_index_small_values() {
        assert_eq!(encode_index(0), vec![0x00]);
        assert_eq!(encode_index(1), vec![0x01]);
        assert_eq!(encode_index(63), vec![0x3F]);
        assert_eq!(encode_index(-1), vec![0x81]);
        assert_eq!(encode_index(-63), vec![0xBF]);
    }

    #[test]
    fn compact_index_two_bytes() {
        // 64 = 0b1_000000: low six bits zero, continuation, then 1
        assert_eq!(encode_index(64), vec![0x40, 0x01]);
        assert_eq!(encode_index(-64), vec![0xC0, 0x01]);
    }

    #[test]
    fn compact_index_extremes() {
        assert_eq!(encode_index(i32::MAX).len(), 5);
        assert_eq!(encode_index(i32::MIN).len(), 5);
        let mut packet = Packet::inbound(&encode_index(i32::MIN));
        assert_eq!(packet.pop_compact_index().unwrap(), i32::MIN);
        assert_eq!(packet.remaining(), 0);
    }

    #[test]
    fn compact_index_negative_zero_decodes_to_zero() {
        let mut packet = Packet::inbound(&[0x80]);
        assert_eq!(packet.pop_compact_index().unwrap(), 0);
    }

    #[test]
    fn compact_index_overflow() {
        // Positive 2^31 encoded in five bytes
        let mut packet = Packet::inbound(&[0x40, 0x80, 0x80, 0x80, 0x10]);
        assert_eq!(
            packet.pop_compact_index(),
            Err(CodecError::CompactIndexOverflow)
        );
        assert_eq!(packet.position(), 0);
    }

    #[test]
    fn failed_pop_restores_cursor() {
        let mut packet = Packet::inbound(&[0x07, 0x40]);
        assert_eq!(packet.pop_u8().unwrap(), 7);
        assert!(packet.pop_compact_index().is_err());
        assert_eq!(packet.position(), 1);
        assert_eq!(packet.remaining(), 1);
    }

    #[test]
    fn primitives_are_little_endian() {
        let mut packet = Packet::outbound();
        packet.push_u8(0xAB).push_u16(0x1234).push_i32(-2);
        assert_eq!(
            packet.as_bytes(),
            &[0xAB, 0x34, 0x12, 0xFE, 0xFF, 0xFF, 0xFF]
        );

        let mut packet = packet.into_inbound();
        assert_eq!(packet.direction(), Direction::Inbound);
        assert_eq!(packet.pop_u8().unwrap(), 0xAB);
        assert_eq!(packet.pop_u16().unwrap(), 0x1234);
        assert_eq!(packet.pop_i32().unwrap(), -2);
        assert!(packet.expect_end().is_ok());
    }

    #[test]
    fn pop_past_end_is_explicit() {
        let mut packet = Packet::inbound(&[0x01]);
        assert_eq!(
            packet.pop_u16(),
            Err(CodecError::InsufficientData {
                needed: 2,
                available: 1
            })
        );
        assert_eq!(
            Packet::inbound(&[]).pop_u8(),
            Err(CodecError::InsufficientData {
                needed: 1,
                available: 0
            })
        );
    }

    #[test]
    fn string_layout_selection() {
        assert_eq!(
            StringEncoding::for_value("DM-Deck16]["),
            StringEncoding::NarrowTerminated
        );
        assert_eq!(
            StringEncoding::for_value("caf\u{e9}"),
            StringEncoding::NarrowTerminated
        );
        assert_eq!(
            StringEncoding::for_value("\u{65e5}\u{672c}"),
            StringEncoding::WideTerminated
        );
        assert_eq!(
            StringEncoding::for_value("a\0b"),
            StringEncoding::NarrowPrefixed
        );
    }

    #[test]
    fn narrow_terminated_bytes() {
        let mut packet = Packet::outbound();
        packet.push_string("Hi");
        assert_eq!(packet.as_bytes(), &[0x00, b'H', b'i', 0x00]);
    }

    #[test]
    fn strings_in_every_layout() {
        let cases = [
            ("plain", StringEncoding::NarrowTerminated),
            ("with\0nul", StringEncoding::NarrowPrefixed),
            ("\u{263A} smile", StringEncoding::WideTerminated),
            ("\u{263A}\0", StringEncoding::WidePrefixed),
        ];
        let mut packet = Packet::outbound();
        for (value, encoding) in cases {
            packet.push_string_as(value, encoding);
        }
        let mut packet = packet.into_inbound();
        for (value, _) in cases {
            assert_eq!(packet.pop_string().unwrap(), value);
        }
        assert!(packet.expect_end().is_ok());
    }

    #[test]
    fn string_missing_terminator() {
        let mut packet = Packet::inbound(&[0x00, b'a', b'b']);
        assert_eq!(packet.pop_string(), Err(CodecError::MissingTerminator));
        assert_eq!(packet.position(), 0);

        let mut packet = Packet::inbound(&[0x01, b'a', 0x00, b'b']);
        assert_eq!(packet.pop_string(), Err(CodecError::MissingTerminator));
    }

    #[test]
    fn string_invalid_indicator() {
        let mut packet = Packet::inbound(&[0x09, 0x00]);
        assert_eq!(
            packet.pop_string(),
            Err(CodecError::InvalidStringIndicator(0x09))
        );
    }

    #[test]
    fn string_negative_length() {
        let mut packet = Packet::inbound(&[0x02, 0x81]);
        assert_eq!(packet.pop_string(), Err(CodecError::NegativeLength(-1)));
    }

    #[test]
    fn string_unpaired_surrogate() {
        let mut packet = Packet::inbound(&[0x01, 0x00, 0xD8, 0x00, 0x00]);
        assert_eq!(packet.pop_string(), Err(CodecError::InvalidUtf16));
    }

    #[test]
    fn key_values_preserve_order() {
        let pairs = vec![
            ("mapname".to_string(), "DM-Morpheus".to_string()),
            ("numplayers".to_string(), "4".to_string()),
            ("gametype".to_string(), "DeathMatch".to_string()),
        ];
        let mut packet = Packet::outbound();
        packet.push_key_values(&pairs);
        let mut packet = packet.into_inbound();
        assert_eq!(packet.pop_key_values().unwrap(), pairs);
    }

    #[test]
    fn key_values_count_exceeds_buffer() {
        // Claims 30 pairs, carries none
        let mut packet = Packet::inbound(&[0x1E]);
        assert!(matches!(
            packet.pop_key_values(),
            Err(CodecError::InsufficientData { .. })
        ));
        assert_eq!(packet.position(), 0);
    }

    #[test]
    fn encoded_lengths_match_output() {
        let values = ["", "abc", "a\0b", "\u{263A}", "\u{263A}\0x"];
        for value in values {
            let mut packet = Packet::outbound();
            packet.push_string(value);
            assert_eq!(packet.len(), encoded_string_len(value), "{value:?}");
        }

        let pairs = [("hostname", "Lan Party"), ("maxplayers", "16")];
        let mut packet = Packet::outbound();
        packet.push_key_values(&pairs);
        assert_eq!(packet.len(), encoded_key_values_len(&pairs));
    }

    #[test]
    fn rewind_is_diagnostic_reset() {
        let mut packet = Packet::inbound(&[1, 2, 3]);
        packet.pop_u16().unwrap();
        packet.rewind();
        assert_eq!(packet.position(), 0);
        assert_eq!(packet.pop_u8().unwrap(), 1);
    }
}
