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

//! Core types for the master server

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a connection (monotonically increasing, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport a listener or session runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Stateful, length-prefixed stream
    Tcp,
    /// Stateless, one packet per datagram
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// The connection a unit of work arrived on.
///
/// TCP sessions are identified by their connection id. UDP has no connection, so the peer
/// address stands in for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// An accepted TCP connection
    Tcp(ConnectionId),
    /// A UDP peer
    Udp(SocketAddr),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Tcp(id) => write!(f, "{id}"),
            Origin::Udp(peer) => write!(f, "udp:{peer}"),
        }
    }
}

/// Connection state (stored as atomic u8 for lock-free state management)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Connection is being established
    Connecting = 0,
    /// Connection is active and processing packets
    Active = 1,
    /// Connection is idle (no recent activity)
    Idle = 2,
    /// Connection is closing (cleanup in progress)
    Closing = 3,
    /// Connection is closed
    Closed = 4,
}

impl ConnectionState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Idle,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if the connection is in a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Check if the connection is active
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Connection information snapshot (for non-blocking queries)
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection ID
    pub id: ConnectionId,
    /// Current state
    pub state: ConnectionState,
    /// Peer address
    pub peer_addr: SocketAddr,
    /// When the connection was created
    pub created_at: Instant,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total messages sent
    pub messages_sent: u64,
    /// Total messages received
    pub messages_received: u64,
}

impl ConnectionInfo {
    /// Get the connection duration
    pub fn duration(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Master server status for non-blocking debug information
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Number of open TCP connections
    pub active_connections: usize,
    /// Total TCP connections since server start
    pub total_connections: u64,
    /// Number of servers in the registry, stale ones included
    pub registered_servers: usize,
    /// Number of ban entries
    pub active_bans: usize,
    /// Bound TCP address, if any
    pub tcp_address: Option<SocketAddr>,
    /// Bound UDP address, if any
    pub udp_address: Option<SocketAddr>,
    /// Server uptime
    pub uptime: Duration,
    /// Server start time
    pub started_at: Instant,
}

impl fmt::Display for ServerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |addr: Option<SocketAddr>| addr.map_or_else(|| "-".to_string(), |a| a.to_string());
        write!(
            f,
            "MasterServer {{ connections: {}/{}, servers: {}, bans: {}, tcp: {}, udp: {}, uptime: {:?} }}",
            self.active_connections,
            self.total_connections,
            self.registered_servers,
            self.active_bans,
            show(self.tcp_address),
            show(self.udp_address),
            self.uptime
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id() {
        let id1 = ConnectionId::new(1);
        let id2 = ConnectionId::new(2);

        assert_eq!(id1.as_u64(), 1);
        assert_ne!(id1, id2);
        assert!(id1 < id2);
        assert_eq!(id2.to_string(), "conn-2");
    }

    #[test]
    fn test_connection_state_conversion() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Active,
            ConnectionState::Idle,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ConnectionState::from_u8(200), ConnectionState::Closed);
    }

    #[test]
    fn test_connection_state_predicates() {
        assert!(ConnectionState::Closing.is_terminal());
        assert!(!ConnectionState::Idle.is_terminal());
        assert!(ConnectionState::Idle.is_active());
        assert!(!ConnectionState::Connecting.is_active());
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(Origin::Tcp(ConnectionId::new(7)).to_string(), "conn-7");
        let peer: SocketAddr = "10.1.2.3:27900".parse().unwrap();
        assert_eq!(Origin::Udp(peer).to_string(), "udp:10.1.2.3:27900");
    }
}
