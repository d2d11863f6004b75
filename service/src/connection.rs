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

//! Framed TCP connection

use crate::error::Result;
use crate::types::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, trace};
use umaster_codec::{Message, Packet, PacketFramer};

/// Length prefix in front of every frame
const PREFIX_LEN: u64 = 2;

/// Traffic counters of one connection, shared with the manager
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl ConnectionStats {
    /// Bytes written, framing included
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes read, framing included
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Frames written
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Frames read
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }
}

/// An accepted TCP connection speaking length-prefixed packets
///
/// The connection is owned by its worker; other parties observe it through
/// [`ConnectionStats`].
pub struct TcpConnection {
    framed: Framed<TcpStream, PacketFramer>,
    id: ConnectionId,
    peer_addr: SocketAddr,
    created_at: Instant,
    stats: Arc<ConnectionStats>,
}

impl TcpConnection {
    /// Wrap an accepted stream
    #[instrument(skip(socket), fields(connection_id = %id))]
    pub fn wrap(socket: TcpStream, id: ConnectionId, max_frame_len: usize) -> Result<Self> {
        let peer_addr = socket.peer_addr()?;
        socket.set_nodelay(true)?;
        debug!(%peer_addr, "Creating new connection");
        counter!("umaster.connections.total").increment(1);

        Ok(Self {
            framed: Framed::new(socket, PacketFramer::new(max_frame_len)),
            id,
            peer_addr,
            created_at: Instant::now(),
            stats: Arc::new(ConnectionStats::default()),
        })
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// When the connection was accepted
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Shared traffic counters
    pub fn stats(&self) -> Arc<ConnectionStats> {
        self.stats.clone()
    }

    /// Write one message; returns the bytes put on the wire
    pub async fn send(&mut self, message: &Message) -> Result<u64> {
        let start = Instant::now();
        let packet = message.encode();
        let written = packet.len() as u64 + PREFIX_LEN;
        self.framed.send(packet).await?;

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(written, Ordering::Relaxed);
        counter!("umaster.messages.sent").increment(1);
        histogram!("umaster.message.send_duration").record(start.elapsed().as_secs_f64());
        trace!(connection_id = %self.id, opcode = %message.opcode(), "Message sent");
        Ok(written)
    }

    /// Read the next frame; `None` once the peer has closed the stream
    pub async fn next(&mut self) -> Result<Option<Packet>> {
        match self.framed.next().await {
            Some(Ok(packet)) => {
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_received
                    .fetch_add(packet.len() as u64 + PREFIX_LEN, Ordering::Relaxed);
                counter!("umaster.messages.received").increment(1);
                Ok(Some(packet))
            }
            Some(Err(err)) => {
                counter!("umaster.errors.receive").increment(1);
                Err(err.into())
            }
            None => {
                debug!(connection_id = %self.id, "Connection stream ended");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("created_at", &self.created_at)
            .finish()
    }
}
