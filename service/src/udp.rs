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

//! UDP listener
//!
//! One task receives datagrams and shards them over a pool of workers by peer address.
//! Datagrams from one peer always land on the same worker and are handled in the order
//! they arrived. A worker whose queue is full loses the datagram; UDP senders retry.

use crate::ban::BanGate;
use crate::dispatcher::ProtocolDispatcher;
use crate::error::MasterError;
use crate::logging::Operation;
use crate::metrics::ServerMetrics;
use crate::session::Session;
use crate::types::Transport;
use bytes::Bytes;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use umaster_codec::{MAX_FRAME_LEN, OpCode, Packet};

type Datagram = (SocketAddr, Bytes);

/// Datagram side of the master
#[derive(Debug)]
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<ProtocolDispatcher>,
    bans: Arc<BanGate>,
    metrics: Arc<ServerMetrics>,
    workers: usize,
    queue_depth: usize,
    max_payload: usize,
}

impl UdpListener {
    /// Listener over an already bound socket
    pub fn new(
        socket: Arc<UdpSocket>,
        dispatcher: Arc<ProtocolDispatcher>,
        bans: Arc<BanGate>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            socket,
            dispatcher,
            bans,
            metrics,
            workers: 4,
            queue_depth: 1024,
            max_payload: crate::config::DEFAULT_UDP_PAYLOAD,
        }
    }

    /// Set the worker pool size and the queue depth of each worker
    pub fn with_workers(mut self, workers: usize, queue_depth: usize) -> Self {
        self.workers = workers.max(1);
        self.queue_depth = queue_depth.max(1);
        self
    }

    /// Set the largest reply datagram
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the receive loop and the workers; all of them stop with `cancel`
    pub fn spawn(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.workers + 1);
        let mut queues = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let (tx, rx) = mpsc::channel(self.queue_depth);
            queues.push(tx);
            handles.push(tokio::spawn(work(
                index,
                rx,
                self.socket.clone(),
                self.dispatcher.clone(),
                self.metrics.clone(),
                self.max_payload,
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(self.receive(queues, cancel)));
        handles
    }

    async fn receive(self, queues: Vec<mpsc::Sender<Datagram>>, cancel: CancellationToken) {
        let hasher = RandomState::new();
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        match self.socket.local_addr() {
            Ok(addr) => info!(%addr, workers = queues.len(), "UDP listener running"),
            Err(err) => warn!(error = %err, "UDP listener running on an unknown address"),
        }

        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    // ICMP unreachable from an earlier reply
                    Err(err) if err.kind() == ErrorKind::ConnectionReset => continue,
                    Err(err) => {
                        warn!(error = %err, "UDP receive failed");
                        self.metrics.transport_error();
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            self.metrics.datagram_received(len);

            if self.bans.is_banned(peer.ip()) {
                let operation = buf[..len]
                    .first()
                    .map_or(Operation::Malformed, |byte| Operation::from(OpCode::from(*byte)));
                self.dispatcher.reject(
                    peer,
                    Transport::Udp,
                    operation,
                    &MasterError::BanRejection(peer.ip()),
                );
                continue;
            }

            let shard = (hasher.hash_one(peer) % queues.len() as u64) as usize;
            match queues[shard].try_send((peer, Bytes::copy_from_slice(&buf[..len]))) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    trace!(%peer, shard, "Worker queue full, dropping datagram");
                    self.metrics.datagram_dropped();
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        debug!("UDP receive loop stopped");
    }
}

async fn work(
    index: usize,
    mut queue: mpsc::Receiver<Datagram>,
    socket: Arc<UdpSocket>,
    dispatcher: Arc<ProtocolDispatcher>,
    metrics: Arc<ServerMetrics>,
    max_payload: usize,
    cancel: CancellationToken,
) {
    loop {
        let (peer, datagram) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let session = Session::udp(socket.clone(), peer, cancel.clone(), max_payload);
        for reply in dispatcher.dispatch(&session, Packet::inbound(&datagram)).await {
            let packet = reply.encode();
            match socket.send_to(packet.as_bytes(), peer).await {
                Ok(sent) => metrics.bytes_sent(sent as u64),
                Err(err) => {
                    debug!(%peer, error = %err, "UDP reply failed");
                    metrics.transport_error();
                }
            }
        }
    }
    debug!(worker = index, "UDP worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatPolicy, ValidationConfig};
    use crate::heartbeat::HeartbeatMachine;
    use crate::logging::LogPump;
    use crate::module::{ModuleRegistry, ModuleSet};
    use crate::query::QueryHandler;
    use crate::registry::ServerRegistry;
    use crate::validation::ValidationPipeline;
    use umaster_codec::{Heartbeat, Message};

    struct Fixture {
        address: SocketAddr,
        registry: Arc<ServerRegistry>,
        bans: Arc<BanGate>,
        metrics: Arc<ServerMetrics>,
        cancel: CancellationToken,
    }

    async fn start() -> Fixture {
        let policy = HeartbeatPolicy::default();
        let registry = Arc::new(ServerRegistry::from_policy(&policy));
        let bans = Arc::new(BanGate::new());
        let metrics = Arc::new(ServerMetrics::new());
        let modules = Arc::new(ModuleRegistry::new(ModuleSet::new()));
        let dispatcher = Arc::new(ProtocolDispatcher::new(
            modules.clone(),
            Arc::new(HeartbeatMachine::new(registry.clone(), bans.clone(), policy)),
            Arc::new(QueryHandler::new(registry.clone(), bans.clone())),
            Arc::new(ValidationPipeline::new(
                modules,
                ValidationConfig::default(),
                metrics.clone(),
            )),
            bans.clone(),
            Arc::new(LogPump::new(64)),
            metrics.clone(),
        ));
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let address = socket.local_addr().unwrap();
        let cancel = CancellationToken::new();
        UdpListener::new(socket, dispatcher, bans.clone(), metrics.clone())
            .with_workers(2, 8)
            .spawn(cancel.clone());
        Fixture {
            address,
            registry,
            bans,
            metrics,
            cancel,
        }
    }

    fn heartbeat(port: u16) -> Vec<u8> {
        Message::Heartbeat(Heartbeat {
            game: "ut".to_string(),
            port,
            metadata: Vec::new(),
        })
        .encode()
        .as_bytes()
        .to_vec()
    }

    #[tokio::test]
    async fn test_heartbeat_acknowledged() {
        let fx = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&heartbeat(7777), fx.address).await.unwrap();

        let mut buf = [0u8; 64];
        let len = tokio::time::timeout(Duration::from_secs(1), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            Message::decode_bytes(&buf[..len]).unwrap(),
            Message::HeartbeatAck { .. }
        ));
        assert_eq!(fx.registry.len(), 1);
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_banned_peer_dropped() {
        let fx = start().await;
        fx.bans.ban("127.0.0.1".parse().unwrap(), None, None);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&heartbeat(7777), fx.address).await.unwrap();

        let mut buf = [0u8; 64];
        let answered = tokio::time::timeout(Duration::from_millis(200), client.recv(&mut buf)).await;
        assert!(answered.is_err());
        assert!(fx.registry.is_empty());
        assert_eq!(fx.metrics.snapshot().ban_rejections, 1);
        fx.cancel.cancel();
    }
}
