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

//! # Umaster Packet Codec
//!
//! Binary wire format for the master server protocol: primitives, a variable-length
//! "compact index" integer, indicator-tagged strings, key/value string arrays, typed
//! messages and a length-prefixed stream framer for `tokio_util::codec`.
//!
//! ## Core Components
//!
//! ### [`Packet`]
//!
//! An exclusively owned buffer with a read cursor. Outbound packets are appended to with
//! `push_*`; inbound packets are consumed with `pop_*`. Reading past the end always fails
//! with [`CodecError::InsufficientData`] and leaves the cursor untouched.
//!
//! ### [`Message`]
//!
//! One variant per protocol operation, keyed by [`OpCode`]. Unknown op-codes decode to
//! [`Message::Unknown`] so higher layers can decide what to do with them.
//!
//! ### [`PacketFramer`]
//!
//! `Decoder`/`Encoder` for TCP streams: a little-endian `u16` length followed by the packet.
//!
//! ## Compact Index
//!
//! | Byte | Bits                                               |
//! |------|----------------------------------------------------|
//! | 1    | `0x80` sign, `0x40` continuation, 6 magnitude bits |
//! | 2-4  | `0x80` continuation, 7 magnitude bits              |
//! | 5    | 8 magnitude bits                                   |
//!
//! ```rust
//! use umaster_codec::Packet;
//!
//! let mut packet = Packet::outbound();
//! packet.push_compact_index(-100).push_string("DM-Deck16");
//!
//! let mut packet = packet.into_inbound();
//! assert_eq!(packet.pop_compact_index().unwrap(), -100);
//! assert_eq!(packet.pop_string().unwrap(), "DM-Deck16");
//! ```
//!
//! ## Framing Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use tokio_util::codec::{Decoder, Encoder};
//! use umaster_codec::{Message, PacketFramer};
//!
//! let mut framer = PacketFramer::default();
//! let mut buffer = BytesMut::new();
//! framer.encode(Message::Ping { token: 42 }, &mut buffer).unwrap();
//!
//! let packet = framer.decode(&mut buffer).unwrap().unwrap();
//! assert_eq!(Message::decode(packet).unwrap(), Message::Ping { token: 42 });
//! ```

#![warn(
    clippy::cargo,
    missing_docs,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms
)]
#![allow(
    clippy::option_if_let_else,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

mod framer;
mod message;
mod packet;
mod result;

pub use self::framer::{MAX_FRAME_LEN, PacketFramer};
pub use self::message::{
    Heartbeat, Message, OpCode, SERVER_LIST_HEADER_LEN, ServerList, ServerRecord, ValidateKey,
    ValidateResult,
};
pub use self::packet::{
    Direction, KeyValues, Packet, StringEncoding, compact_index_len, encoded_key_values_len,
    encoded_string_len,
};
pub use self::result::{CodecError, CodecResult};
