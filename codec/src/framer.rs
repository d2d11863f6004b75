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

use crate::{CodecError, Message, Packet};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// Largest frame a u16 length prefix can describe
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const PREFIX_LEN: usize = 2;

/// Stream framing for TCP sessions.
///
/// Each packet travels as a little-endian `u16` length followed by that many bytes. Datagram
/// transports do not use this codec; one datagram is one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFramer {
    max_frame_len: usize,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl PacketFramer {
    /// Create a framer accepting frames up to `max_frame_len` bytes (capped at [`MAX_FRAME_LEN`])
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(MAX_FRAME_LEN),
        }
    }

    /// Largest accepted frame body
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn check_len(&self, len: usize) -> Result<(), CodecError> {
        if len == 0 {
            return Err(CodecError::EmptyFrame);
        }
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

impl Decoder for PacketFramer {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Self::Error> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = usize::from(u16::from_le_bytes([src[0], src[1]]));
        if let Err(err) = self.check_len(len) {
            debug!(len, max = self.max_frame_len, "Rejecting frame: {}", err);
            return Err(err);
        }
        if src.len() < PREFIX_LEN + len {
            src.reserve(PREFIX_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(PREFIX_LEN);
        trace!(len, "Decoded frame");
        Ok(Some(Packet::from_bytes(src.split_to(len))))
    }
}

impl Encoder<Packet> for PacketFramer {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.as_bytes();
        self.check_len(body.len())?;
        dst.reserve(PREFIX_LEN + body.len());
        dst.put_u16_le(body.len() as u16);
        dst.extend_from_slice(body);
        Ok(())
    }
}

impl Encoder<Message> for PacketFramer {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<Packet>::encode(self, item.encode(), dst)
    }
}

impl Encoder<&Message> for PacketFramer {
    type Error = CodecError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<Packet>::encode(self, item.encode(), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_length() {
        let mut framer = PacketFramer::default();
        let mut dst = BytesMut::new();
        framer.encode(Message::Ping { token: 5 }, &mut dst).unwrap();
        assert_eq!(&dst[..], &[5, 0, 0x7E, 5, 0, 0, 0]);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut framer = PacketFramer::default();
        let mut src = BytesMut::from(&[5u8][..]);
        assert!(framer.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&[0, 0x7E, 5, 0]);
        assert!(framer.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&[0, 0, 0x7F]);
        let packet = framer.decode(&mut src).unwrap().unwrap();
        assert_eq!(
            Message::decode(packet).unwrap(),
            Message::Ping { token: 5 }
        );
        // Start of the next frame stays buffered
        assert_eq!(&src[..], &[0x7F]);
    }

    #[test]
    fn back_to_back_frames() {
        let mut framer = PacketFramer::default();
        let mut src = BytesMut::new();
        framer.encode(Message::Ping { token: 1 }, &mut src).unwrap();
        framer.encode(Message::Pong { token: 2 }, &mut src).unwrap();
        let first = framer.decode(&mut src).unwrap().unwrap();
        let second = framer.decode(&mut src).unwrap().unwrap();
        assert_eq!(Message::decode(first).unwrap(), Message::Ping { token: 1 });
        assert_eq!(Message::decode(second).unwrap(), Message::Pong { token: 2 });
        assert!(src.is_empty());
    }

    #[test]
    fn empty_frame_is_an_error() {
        let mut framer = PacketFramer::default();
        let mut src = BytesMut::from(&[0u8, 0][..]);
        assert_eq!(framer.decode(&mut src), Err(CodecError::EmptyFrame));
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut framer = PacketFramer::new(16);
        let mut src = BytesMut::from(&[17u8, 0][..]);
        assert_eq!(
            framer.decode(&mut src),
            Err(CodecError::FrameTooLarge { len: 17, max: 16 })
        );

        let mut dst = BytesMut::new();
        let mut packet = Packet::outbound();
        packet.push_bytes(&[0; 17]);
        assert!(framer.encode(packet, &mut dst).is_err());
        assert!(dst.is_empty());
    }
}
