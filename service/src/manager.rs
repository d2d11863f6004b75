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

//! Connection manager implementation
//!
//! The ConnectionManager is responsible for:
//! - Enforcing the connection cap
//! - Spawning and tracking connection workers
//! - Closing connections on request, one by one or by address
//! - Graceful shutdown coordination

use crate::ban::canonical_ip;
use crate::connection::{ConnectionStats, TcpConnection};
use crate::dispatcher::ProtocolDispatcher;
use crate::error::{MasterError, Result};
use crate::metrics::ServerMetrics;
use crate::types::{ConnectionId, ConnectionInfo, ConnectionState};
use crate::worker::{ConnectionWorker, ControlMessage, WorkerConfig};
use dashmap::DashMap;
use futures_util::future::join_all;
use metrics::gauge;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use umaster_codec::Message;

/// A reserved connection slot
///
/// Obtained from [`ConnectionManager::reserve`] before a stream is wrapped; dropping it
/// frees the slot.
#[derive(Debug)]
pub struct ConnectionSlot(OwnedSemaphorePermit);

/// Managed connection entry
struct ManagedConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    stats: Arc<ConnectionStats>,
    control_tx: mpsc::Sender<ControlMessage>,
    worker_handle: Option<JoinHandle<()>>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    created_at: Instant,
}

impl ManagedConnection {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state(),
            peer_addr: self.peer_addr,
            created_at: self.created_at,
            bytes_sent: self.stats.bytes_sent(),
            bytes_received: self.stats.bytes_received(),
            messages_sent: self.stats.messages_sent(),
            messages_received: self.stats.messages_received(),
        }
    }
}

/// Connection manager
pub struct ConnectionManager {
    connections: Arc<DashMap<ConnectionId, ManagedConnection>>,
    next_id: AtomicU64,
    slots: Arc<Semaphore>,
    max_connections: usize,
    max_frame_len: usize,
    dispatcher: Arc<ProtocolDispatcher>,
    metrics: Arc<ServerMetrics>,
    worker_config: WorkerConfig,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager admitting at most `max_connections` connections
    ///
    /// Connection workers are cancelled together with `cancel`.
    pub fn new(
        max_connections: usize,
        max_frame_len: usize,
        dispatcher: Arc<ProtocolDispatcher>,
        metrics: Arc<ServerMetrics>,
        worker_config: WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            max_frame_len,
            dispatcher,
            metrics,
            worker_config,
            cancel,
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Reserve a connection slot
    ///
    /// Fails with [`MasterError::MaxConnectionsReached`] when every slot is taken.
    pub fn reserve(&self) -> Result<ConnectionSlot> {
        self.slots
            .clone()
            .try_acquire_owned()
            .map(ConnectionSlot)
            .map_err(|_| MasterError::MaxConnectionsReached(self.max_connections))
    }

    /// Wrap `socket` and start its worker
    ///
    /// The slot is held until the worker finishes.
    pub fn add_connection(&self, socket: TcpStream, slot: ConnectionSlot) -> Result<ConnectionId> {
        let id = self.next_connection_id();
        let connection = TcpConnection::wrap(socket, id, self.max_frame_len)?;
        let peer_addr = connection.peer_addr();
        let stats = connection.stats();
        let state = Arc::new(AtomicU8::new(ConnectionState::Connecting.as_u8()));
        let cancel = self.cancel.child_token();

        let (worker, control_tx) = ConnectionWorker::new(
            connection,
            self.dispatcher.clone(),
            self.metrics.clone(),
            self.worker_config.clone(),
            state.clone(),
            cancel.clone(),
        );

        // The worker waits until it is tracked, so its own removal cannot come first
        let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
        let connections = self.connections.clone();
        let metrics = self.metrics.clone();
        let worker_handle = tokio::spawn(async move {
            let _ = tracked_rx.await;
            let start = Instant::now();
            worker.run().await;

            connections.remove(&id);
            metrics.connection_closed(start.elapsed());
            gauge!("umaster.connections.active").decrement(1.0);
            drop(slot);
        });

        self.connections.insert(
            id,
            ManagedConnection {
                id,
                peer_addr,
                stats,
                control_tx,
                worker_handle: Some(worker_handle),
                state,
                cancel,
                created_at: Instant::now(),
            },
        );
        let _ = tracked_tx.send(());
        self.metrics.connection_opened();
        gauge!("umaster.connections.active").increment(1.0);
        info!(connection_id = %id, %peer_addr, "Connection established");

        Ok(id)
    }

    /// Close a connection and wait briefly for its worker to finish
    pub async fn remove_connection(&self, id: ConnectionId) -> Result<()> {
        let handle = {
            let mut entry = self
                .connections
                .get_mut(&id)
                .ok_or(MasterError::ConnectionNotFound(id))?;
            let _ = entry.control_tx.try_send(ControlMessage::Close);
            entry.cancel.cancel();
            entry.worker_handle.take()
        };
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        Ok(())
    }

    /// Close every connection from `address`; returns how many were told to close
    pub fn close_address(&self, address: IpAddr) -> usize {
        let address = canonical_ip(address);
        let mut closed = 0;
        for entry in self.connections.iter() {
            if canonical_ip(entry.peer_addr.ip()) == address {
                entry.cancel.cancel();
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(%address, closed, "Closed connections from address");
        }
        closed
    }

    /// Queue a message for a connection
    pub async fn send_to_connection(&self, id: ConnectionId, message: Message) -> Result<()> {
        let tx = self
            .connections
            .get(&id)
            .map(|entry| entry.control_tx.clone())
            .ok_or(MasterError::ConnectionNotFound(id))?;
        tx.send(ControlMessage::Send(message))
            .await
            .map_err(|_| MasterError::ConnectionClosed)
    }

    /// Get connection info
    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|entry| entry.info())
    }

    /// Get all connection IDs
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Get all connection infos
    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Get the number of open connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connection cap
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Close every connection
    ///
    /// Workers get `grace` to finish on their own; stragglers are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        let mut handles = Vec::new();
        for mut entry in self.connections.iter_mut() {
            let _ = entry.control_tx.try_send(ControlMessage::Close);
            entry.cancel.cancel();
            if let Some(handle) = entry.worker_handle.take() {
                handles.push(handle);
            }
        }
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let count = handles.len();

        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            warn!(count, "Connections did not close in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        self.connections.clear();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connection_count", &self.connection_count())
            .field("max_connections", &self.max_connections)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::BanGate;
    use crate::config::{HeartbeatPolicy, ValidationConfig};
    use crate::heartbeat::HeartbeatMachine;
    use crate::logging::LogPump;
    use crate::module::{ModuleRegistry, ModuleSet};
    use crate::query::QueryHandler;
    use crate::registry::ServerRegistry;
    use crate::validation::ValidationPipeline;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn manager(max_connections: usize) -> ConnectionManager {
        let policy = HeartbeatPolicy::default();
        let registry = Arc::new(ServerRegistry::from_policy(&policy));
        let bans = Arc::new(BanGate::new());
        let metrics = Arc::new(ServerMetrics::new());
        let modules = Arc::new(ModuleRegistry::new(ModuleSet::new()));
        let dispatcher = Arc::new(ProtocolDispatcher::new(
            modules.clone(),
            Arc::new(HeartbeatMachine::new(registry.clone(), bans.clone(), policy)),
            Arc::new(QueryHandler::new(registry, bans.clone())),
            Arc::new(ValidationPipeline::new(
                modules,
                ValidationConfig::default(),
                metrics.clone(),
            )),
            bans,
            Arc::new(LogPump::new(64)),
            metrics.clone(),
        ));
        ConnectionManager::new(
            max_connections,
            umaster_codec::MAX_FRAME_LEN,
            dispatcher,
            metrics,
            WorkerConfig::default(),
            CancellationToken::new(),
        )
    }

    async fn create_test_connection() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (server, _) = listener.accept().await.unwrap();
        let client = client_task.await.unwrap();

        (server, client)
    }

    #[tokio::test]
    async fn test_manager_add_remove() {
        let manager = manager(4);
        let (server, _client) = create_test_connection().await;

        let slot = manager.reserve().unwrap();
        let id = manager.add_connection(server, slot).unwrap();
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.connection_info(id).unwrap().id, id);

        manager.remove_connection(id).await.unwrap();
        assert_eq!(manager.connection_count(), 0);
        assert!(matches!(
            manager.remove_connection(id).await,
            Err(MasterError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let manager = manager(1);
        let (server, _client) = create_test_connection().await;

        let slot = manager.reserve().unwrap();
        assert!(matches!(
            manager.reserve(),
            Err(MasterError::MaxConnectionsReached(1))
        ));
        let id = manager.add_connection(server, slot).unwrap();
        assert!(manager.reserve().is_err());

        manager.remove_connection(id).await.unwrap();
        assert!(manager.reserve().is_ok());
    }

    #[tokio::test]
    async fn test_serves_ping() {
        let manager = manager(2);
        let (server, mut client) = create_test_connection().await;
        let slot = manager.reserve().unwrap();
        manager.add_connection(server, slot).unwrap();

        let ping = Message::Ping { token: 42 }.encode();
        client
            .write_all(&(ping.len() as u16).to_le_bytes())
            .await
            .unwrap();
        client.write_all(ping.as_bytes()).await.unwrap();

        let mut prefix = [0u8; 2];
        client.read_exact(&mut prefix).await.unwrap();
        let mut body = vec![0u8; usize::from(u16::from_le_bytes(prefix))];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(
            Message::decode_bytes(&body).unwrap(),
            Message::Pong { token: 42 }
        );

        manager.shutdown(Duration::from_secs(1)).await;
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_address() {
        let manager = manager(4);
        let (server, mut client) = create_test_connection().await;
        let slot = manager.reserve().unwrap();
        manager.add_connection(server, slot).unwrap();

        assert_eq!(manager.close_address("127.0.0.1".parse().unwrap()), 1);
        // The worker closes the stream
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }
}
