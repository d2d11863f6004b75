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

//! Typed wire messages
//!
//! Every packet starts with a single op-code byte followed by the fields of that operation.

use crate::packet::{KeyValues, encoded_key_values_len, encoded_string_len};
use crate::{CodecError, CodecResult, Packet};
use bytes::Bytes;
use std::fmt;

/// Fixed bytes ahead of the records in a [`ServerList`] packet: op-code, sequence, total
/// and a compact-index count of at most five bytes.
pub const SERVER_LIST_HEADER_LEN: usize = 1 + 2 + 2 + 5;

/// Operation code carried in the first byte of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Game server announces itself
    Heartbeat,
    /// Master asks a game server to echo a nonce
    Challenge,
    /// Game server echoes a challenge nonce
    ChallengeResponse,
    /// Master accepts a heartbeat
    HeartbeatAck,
    /// Game server withdraws its listing
    Deregister,
    /// Client requests the server list
    Query,
    /// One fragment of a server list
    ServerList,
    /// Request to validate a CD key
    ValidateKey,
    /// Verdict for a CD key
    ValidateResult,
    /// Liveness probe
    Ping,
    /// Liveness reply
    Pong,
    /// Any op-code this codec does not know
    Unknown(u8),
}

impl OpCode {
    /// Short lowercase name used in logs
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Heartbeat => "heartbeat",
            OpCode::Challenge => "challenge",
            OpCode::ChallengeResponse => "challenge_response",
            OpCode::HeartbeatAck => "heartbeat_ack",
            OpCode::Deregister => "deregister",
            OpCode::Query => "query",
            OpCode::ServerList => "server_list",
            OpCode::ValidateKey => "validate_key",
            OpCode::ValidateResult => "validate_result",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
            OpCode::Unknown(_) => "unknown",
        }
    }
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => OpCode::Heartbeat,
            0x02 => OpCode::Challenge,
            0x03 => OpCode::ChallengeResponse,
            0x04 => OpCode::HeartbeatAck,
            0x05 => OpCode::Deregister,
            0x10 => OpCode::Query,
            0x11 => OpCode::ServerList,
            0x20 => OpCode::ValidateKey,
            0x21 => OpCode::ValidateResult,
            0x7E => OpCode::Ping,
            0x7F => OpCode::Pong,
            other => OpCode::Unknown(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Heartbeat => 0x01,
            OpCode::Challenge => 0x02,
            OpCode::ChallengeResponse => 0x03,
            OpCode::HeartbeatAck => 0x04,
            OpCode::Deregister => 0x05,
            OpCode::Query => 0x10,
            OpCode::ServerList => 0x11,
            OpCode::ValidateKey => 0x20,
            OpCode::ValidateResult => 0x21,
            OpCode::Ping => 0x7E,
            OpCode::Pong => 0x7F,
            OpCode::Unknown(other) => other,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), u8::from(*self))
    }
}

/// Game server announcement
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Heartbeat {
    /// Game name, e.g. `ut`
    pub game: String,
    /// Port the game server accepts players on; zero means "use the source port"
    pub port: u16,
    /// Server-reported rules and status
    pub metadata: KeyValues,
}

/// One server in a [`ServerList`] fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    /// Textual IP address
    pub address: String,
    /// Game port
    pub port: u16,
    /// Server-reported rules and status
    pub metadata: KeyValues,
}

impl ServerRecord {
    /// Bytes this record occupies inside a [`ServerList`] packet
    pub fn encoded_len(&self) -> usize {
        encoded_string_len(&self.address) + 2 + encoded_key_values_len(&self.metadata)
    }

    fn push(&self, packet: &mut Packet) {
        packet
            .push_string(&self.address)
            .push_u16(self.port)
            .push_key_values(&self.metadata);
    }

    fn pop(packet: &mut Packet) -> CodecResult<Self> {
        Ok(Self {
            address: packet.pop_string()?,
            port: packet.pop_u16()?,
            metadata: packet.pop_key_values()?,
        })
    }
}

/// One fragment of a query response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerList {
    /// Zero-based index of this fragment
    pub sequence: u16,
    /// Number of fragments in the response
    pub total: u16,
    /// Servers carried by this fragment
    pub servers: Vec<ServerRecord>,
}

/// CD-key material relayed by a game server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateKey {
    /// Id chosen by the requester, echoed in the result
    pub correlation: i32,
    /// Hash of the player's CD key
    pub key_hash: String,
    /// Challenge the game server issued to the player
    pub challenge: String,
    /// Player's response to the challenge
    pub response: String,
}

/// Verdict for a [`ValidateKey`] request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidateResult {
    /// Correlation id of the request
    pub correlation: i32,
    /// Whether the key was accepted
    pub accepted: bool,
    /// Whether the verdict came from the default policy after a timeout
    pub timed_out: bool,
}

/// A decoded wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// See [`Heartbeat`]
    Heartbeat(Heartbeat),
    /// Master challenge to a registering game server
    Challenge {
        /// Nonce the game server must echo
        nonce: i32,
    },
    /// Echo of a [`Message::Challenge`]
    ChallengeResponse {
        /// Echoed nonce
        nonce: i32,
        /// Game port being registered
        port: u16,
    },
    /// Heartbeat accepted
    HeartbeatAck {
        /// Seconds until the next heartbeat is expected
        interval_secs: u16,
    },
    /// Explicit removal of a listing
    Deregister {
        /// Game port being withdrawn
        port: u16,
    },
    /// Server list request
    Query {
        /// Filter rules as key/value pairs
        filters: KeyValues,
    },
    /// See [`ServerList`]
    ServerList(ServerList),
    /// See [`ValidateKey`]
    ValidateKey(ValidateKey),
    /// See [`ValidateResult`]
    ValidateResult(ValidateResult),
    /// Liveness probe
    Ping {
        /// Token echoed by the pong
        token: i32,
    },
    /// Liveness reply
    Pong {
        /// Token from the ping
        token: i32,
    },
    /// An op-code this codec does not interpret
    Unknown {
        /// Raw op-code byte
        opcode: u8,
        /// Everything after the op-code
        body: Bytes,
    },
}

impl Message {
    /// Op-code of this message
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Heartbeat(_) => OpCode::Heartbeat,
            Message::Challenge { .. } => OpCode::Challenge,
            Message::ChallengeResponse { .. } => OpCode::ChallengeResponse,
            Message::HeartbeatAck { .. } => OpCode::HeartbeatAck,
            Message::Deregister { .. } => OpCode::Deregister,
            Message::Query { .. } => OpCode::Query,
            Message::ServerList(_) => OpCode::ServerList,
            Message::ValidateKey(_) => OpCode::ValidateKey,
            Message::ValidateResult(_) => OpCode::ValidateResult,
            Message::Ping { .. } => OpCode::Ping,
            Message::Pong { .. } => OpCode::Pong,
            Message::Unknown { opcode, .. } => OpCode::Unknown(*opcode),
        }
    }

    /// Encode into a fresh outbound packet
    pub fn encode(&self) -> Packet {
        let mut packet = Packet::outbound();
        self.encode_into(&mut packet);
        packet
    }

    /// Append the encoded message to `packet`
    pub fn encode_into(&self, packet: &mut Packet) {
        packet.push_u8(self.opcode().into());
        match self {
            Message::Heartbeat(heartbeat) => {
                packet
                    .push_string(&heartbeat.game)
                    .push_u16(heartbeat.port)
                    .push_key_values(&heartbeat.metadata);
            }
            Message::Challenge { nonce } => {
                packet.push_i32(*nonce);
            }
            Message::ChallengeResponse { nonce, port } => {
                packet.push_i32(*nonce).push_u16(*port);
            }
            Message::HeartbeatAck { interval_secs } => {
                packet.push_u16(*interval_secs);
            }
            Message::Deregister { port } => {
                packet.push_u16(*port);
            }
            Message::Query { filters } => {
                packet.push_key_values(filters);
            }
            Message::ServerList(list) => {
                let count = i32::try_from(list.servers.len()).unwrap_or(i32::MAX);
                packet
                    .push_u16(list.sequence)
                    .push_u16(list.total)
                    .push_compact_index(count);
                for record in list.servers.iter().take(count as usize) {
                    record.push(packet);
                }
            }
            Message::ValidateKey(request) => {
                packet
                    .push_i32(request.correlation)
                    .push_string(&request.key_hash)
                    .push_string(&request.challenge)
                    .push_string(&request.response);
            }
            Message::ValidateResult(result) => {
                packet
                    .push_i32(result.correlation)
                    .push_u8(u8::from(result.accepted))
                    .push_u8(u8::from(result.timed_out));
            }
            Message::Ping { token } | Message::Pong { token } => {
                packet.push_i32(*token);
            }
            Message::Unknown { body, .. } => {
                packet.push_bytes(body);
            }
        }
    }

    /// Decode a complete packet.
    ///
    /// The packet must contain exactly one message; leftover bytes are a
    /// [`CodecError::TrailingBytes`] error.
    pub fn decode(mut packet: Packet) -> CodecResult<Message> {
        let opcode = OpCode::from(packet.pop_u8()?);
        let message = match opcode {
            OpCode::Heartbeat => Message::Heartbeat(Heartbeat {
                game: packet.pop_string()?,
                port: packet.pop_u16()?,
                metadata: packet.pop_key_values()?,
            }),
            OpCode::Challenge => Message::Challenge {
                nonce: packet.pop_i32()?,
            },
            OpCode::ChallengeResponse => Message::ChallengeResponse {
                nonce: packet.pop_i32()?,
                port: packet.pop_u16()?,
            },
            OpCode::HeartbeatAck => Message::HeartbeatAck {
                interval_secs: packet.pop_u16()?,
            },
            OpCode::Deregister => Message::Deregister {
                port: packet.pop_u16()?,
            },
            OpCode::Query => Message::Query {
                filters: packet.pop_key_values()?,
            },
            OpCode::ServerList => {
                let sequence = packet.pop_u16()?;
                let total = packet.pop_u16()?;
                let count = packet.pop_compact_index()?;
                let count = usize::try_from(count).map_err(|_| CodecError::NegativeLength(count))?;
                // Address string (2) + port (2) + empty metadata (1)
                let minimum = count.saturating_mul(5);
                if minimum > packet.remaining() {
                    return Err(CodecError::InsufficientData {
                        needed: minimum,
                        available: packet.remaining(),
                    });
                }
                let mut servers = Vec::with_capacity(count);
                for _ in 0..count {
                    servers.push(ServerRecord::pop(&mut packet)?);
                }
                Message::ServerList(ServerList {
                    sequence,
                    total,
                    servers,
                })
            }
            OpCode::ValidateKey => Message::ValidateKey(ValidateKey {
                correlation: packet.pop_i32()?,
                key_hash: packet.pop_string()?,
                challenge: packet.pop_string()?,
                response: packet.pop_string()?,
            }),
            OpCode::ValidateResult => Message::ValidateResult(ValidateResult {
                correlation: packet.pop_i32()?,
                accepted: pop_flag(&mut packet, "verdict")?,
                timed_out: pop_flag(&mut packet, "timed_out")?,
            }),
            OpCode::Ping => Message::Ping {
                token: packet.pop_i32()?,
            },
            OpCode::Pong => Message::Pong {
                token: packet.pop_i32()?,
            },
            OpCode::Unknown(opcode) => {
                return Ok(Message::Unknown {
                    opcode,
                    body: packet.pop_remaining(),
                });
            }
        };
        packet.expect_end()?;
        Ok(message)
    }

    /// Decode a message from a raw datagram
    pub fn decode_bytes(data: &[u8]) -> CodecResult<Message> {
        Self::decode(Packet::inbound(data))
    }
}

fn pop_flag(packet: &mut Packet, field: &'static str) -> CodecResult<bool> {
    match packet.pop_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidField {
            field,
            value: i64::from(other),
        }),
    }
}
