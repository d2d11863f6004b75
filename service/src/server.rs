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

//! Master server implementation
//!
//! The MasterServer is the main entry point. It binds the listeners, wires the
//! subsystems together and runs the background tasks: TCP accept loops, the UDP
//! listener, the registry sweeper and the request log drain.

use crate::ban::BanGate;
use crate::command::{AdminCommands, CommandRegistry};
use crate::config::{ListenerConfig, MasterConfig};
use crate::dispatcher::ProtocolDispatcher;
use crate::error::{MasterError, Result};
use crate::heartbeat::HeartbeatMachine;
use crate::logging::{LogPump, Operation};
use crate::manager::ConnectionManager;
use crate::metrics::ServerMetrics;
use crate::module::{ModuleContext, ModuleRegistry, ModuleSet};
use crate::query::QueryHandler;
use crate::registry::ServerRegistry;
use crate::types::{ServerSnapshot, Transport};
use crate::udp::UdpListener;
use crate::validation::ValidationPipeline;
use crate::worker::WorkerConfig;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Game master server
///
/// Holds the live server list and answers heartbeats, queries and CD-key validation
/// requests on the configured listeners.
///
/// # Example
///
/// ```no_run
/// use umaster_service::{MasterConfig, MasterServer, ModuleSet, NullValidator};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let modules = ModuleSet::new().with_validator(Arc::new(NullValidator::new()));
///     let server = MasterServer::new(MasterConfig::default(), modules).await?;
///
///     server.start().await?;
///     tokio::signal::ctrl_c().await?;
///     server.shutdown().await?;
///
///     Ok(())
/// }
/// ```
pub struct MasterServer {
    config: Arc<MasterConfig>,
    tcp_listeners: Mutex<Vec<TcpListener>>,
    udp_sockets: Vec<Arc<UdpSocket>>,
    tcp_address: Option<SocketAddr>,
    udp_address: Option<SocketAddr>,
    registry: Arc<ServerRegistry>,
    bans: Arc<BanGate>,
    metrics: Arc<ServerMetrics>,
    modules: Arc<ModuleRegistry>,
    log: Arc<LogPump>,
    heartbeats: Arc<HeartbeatMachine>,
    validation: Arc<ValidationPipeline>,
    dispatcher: Arc<ProtocolDispatcher>,
    manager: Arc<ConnectionManager>,
    commands: Arc<CommandRegistry>,
    started_at: Instant,
    running: AtomicBool,
    cancel: CancellationToken,
    log_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MasterServer {
    /// Create a new server with the given configuration and modules
    ///
    /// Binds every configured listener but does not serve anything yet. A listener that
    /// fails to bind is logged and skipped; the server fails only when none is left.
    pub async fn new(config: MasterConfig, modules: ModuleSet) -> Result<Self> {
        config.validate().map_err(MasterError::Config)?;

        let mut tcp_listeners = Vec::new();
        let mut udp_sockets = Vec::new();
        for listener in &config.listeners {
            match bind(listener).await {
                Ok(Bound::Tcp(socket)) => tcp_listeners.push(socket),
                Ok(Bound::Udp(socket)) => udp_sockets.push(Arc::new(socket)),
                Err(err) => warn!(
                    transport = %listener.transport,
                    address = %listener.bind_address,
                    error = %err,
                    "Listener failed to bind, skipping"
                ),
            }
        }
        if tcp_listeners.is_empty() && udp_sockets.is_empty() {
            return Err(MasterError::NoListeners);
        }
        let tcp_address = tcp_listeners.first().and_then(|l| l.local_addr().ok());
        let udp_address = udp_sockets.first().and_then(|s| s.local_addr().ok());

        let config = Arc::new(config);
        let registry = Arc::new(ServerRegistry::from_policy(&config.heartbeat));
        let bans = Arc::new(BanGate::new());
        let metrics = Arc::new(ServerMetrics::new());
        let modules = Arc::new(ModuleRegistry::new(modules));
        let log = Arc::new(LogPump::new(config.log_queue_depth));
        let heartbeats = Arc::new(HeartbeatMachine::new(
            registry.clone(),
            bans.clone(),
            config.heartbeat.clone(),
        ));
        let queries = Arc::new(QueryHandler::new(registry.clone(), bans.clone()));
        let validation = Arc::new(ValidationPipeline::new(
            modules.clone(),
            config.validation.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(ProtocolDispatcher::new(
            modules.clone(),
            heartbeats.clone(),
            queries,
            validation.clone(),
            bans.clone(),
            log.clone(),
            metrics.clone(),
        ));

        let cancel = CancellationToken::new();
        let worker_config = WorkerConfig {
            read_timeout: config.read_timeout,
            idle_timeout: config.idle_timeout,
            write_timeout: config.write_timeout,
            max_payload: config.max_frame_len,
            ..WorkerConfig::default()
        };
        let manager = Arc::new(ConnectionManager::new(
            config.max_connections,
            config.max_frame_len,
            dispatcher.clone(),
            metrics.clone(),
            worker_config,
            cancel.child_token(),
        ));

        let commands = Arc::new(CommandRegistry::new());
        commands.register(Arc::new(
            AdminCommands::new(bans.clone(), registry.clone(), metrics.clone())
                .with_connections(manager.clone()),
        ));

        info!(
            tcp = ?tcp_address,
            udp = ?udp_address,
            modules = modules.len(),
            "Master server bound"
        );

        Ok(Self {
            config,
            tcp_listeners: Mutex::new(tcp_listeners),
            udp_sockets,
            tcp_address,
            udp_address,
            registry,
            bans,
            metrics,
            modules,
            log,
            heartbeats,
            validation,
            dispatcher,
            manager,
            commands,
            started_at: Instant::now(),
            running: AtomicBool::new(false),
            cancel,
            log_cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start serving
    ///
    /// Activates the modules, then spawns the listeners and background tasks. The server
    /// runs until `shutdown()` is called. A server that was shut down cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MasterError::ServerShuttingDown);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MasterError::ServerAlreadyRunning);
        }

        let context = ModuleContext {
            registry: self.registry.clone(),
            bans: self.bans.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        };
        if let Err(err) = self.modules.activate(&context).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let mut tasks = Vec::new();
        tasks.extend(self.log.spawn_drain(self.modules.clone(), self.log_cancel.clone()));

        for listener in self.tcp_listeners.lock().drain(..) {
            tasks.push(tokio::spawn(accept_loop(
                listener,
                self.manager.clone(),
                self.dispatcher.clone(),
                self.bans.clone(),
                self.cancel.clone(),
            )));
        }

        for socket in &self.udp_sockets {
            let listener = UdpListener::new(
                socket.clone(),
                self.dispatcher.clone(),
                self.bans.clone(),
                self.metrics.clone(),
            )
            .with_workers(self.config.udp_workers, self.config.udp_queue_depth)
            .with_max_payload(self.config.udp_max_payload);
            tasks.extend(listener.spawn(self.cancel.clone()));
        }

        tasks.push(tokio::spawn(sweep_loop(
            self.config.heartbeat.sweep_interval,
            self.registry.clone(),
            self.heartbeats.clone(),
            self.validation.clone(),
            self.bans.clone(),
            self.cancel.clone(),
        )));

        self.tasks.lock().extend(tasks);
        info!(tcp = ?self.tcp_address, udp = ?self.udp_address, "Master server started");
        Ok(())
    }

    /// Shutdown the server gracefully
    ///
    /// Stops the listeners, gives open connections the configured shutdown timeout to
    /// close, deactivates the modules and flushes the request log.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(MasterError::ServerNotRunning);
        }
        info!("Shutting down master server");

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        self.manager.shutdown(self.config.shutdown_timeout).await;
        self.modules.deactivate().await;
        self.log_cancel.cancel();

        if tokio::time::timeout(self.config.shutdown_timeout, join_all(tasks))
            .await
            .is_err()
        {
            warn!("Background tasks did not stop in time");
        }

        info!("Master server shutdown complete");
        Ok(())
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// First bound TCP address
    pub fn tcp_address(&self) -> Option<SocketAddr> {
        self.tcp_address
    }

    /// First bound UDP address
    pub fn udp_address(&self) -> Option<SocketAddr> {
        self.udp_address
    }

    /// Get the number of open TCP connections
    pub fn connection_count(&self) -> usize {
        self.manager.connection_count()
    }

    /// Get a snapshot of the server state
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            active_connections: self.manager.connection_count(),
            total_connections: self.metrics.total_connections(),
            registered_servers: self.registry.len(),
            active_bans: self.bans.len(),
            tcp_address: self.tcp_address,
            udp_address: self.udp_address,
            uptime: self.started_at.elapsed(),
            started_at: self.started_at,
        }
    }

    /// Live server list
    pub fn registry(&self) -> Arc<ServerRegistry> {
        self.registry.clone()
    }

    /// Ban list
    pub fn bans(&self) -> Arc<BanGate> {
        self.bans.clone()
    }

    /// Operator commands
    pub fn commands(&self) -> Arc<CommandRegistry> {
        self.commands.clone()
    }

    /// Get the server metrics
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Installed modules
    pub fn modules(&self) -> Arc<ModuleRegistry> {
        self.modules.clone()
    }

    /// Get the connection manager
    pub fn manager(&self) -> Arc<ConnectionManager> {
        self.manager.clone()
    }

    /// Get the server configuration
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }
}

impl std::fmt::Debug for MasterServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterServer")
            .field("tcp_address", &self.tcp_address)
            .field("udp_address", &self.udp_address)
            .field("running", &self.is_running())
            .field("connection_count", &self.connection_count())
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

impl Drop for MasterServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("MasterServer dropped while still running");
            self.running.store(false, Ordering::SeqCst);
            self.cancel.cancel();
            self.log_cancel.cancel();
        }
    }
}

enum Bound {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

async fn bind(listener: &ListenerConfig) -> std::io::Result<Bound> {
    match listener.transport {
        Transport::Tcp => TcpListener::bind(listener.bind_address).await.map(Bound::Tcp),
        Transport::Udp => UdpSocket::bind(listener.bind_address).await.map(Bound::Udp),
    }
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<ProtocolDispatcher>,
    bans: Arc<BanGate>,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "Failed to accept connection");
                    // Back off on errors to avoid tight loop
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        if bans.is_banned(peer.ip()) {
            debug!(%peer, "Refusing banned peer");
            let err = MasterError::BanRejection(peer.ip());
            dispatcher.reject(peer, Transport::Tcp, Operation::Connect, &err);
            continue;
        }

        let slot = match manager.reserve() {
            Ok(slot) => slot,
            Err(err) => {
                warn!(%peer, "Connection limit reached, refusing");
                dispatcher.reject(peer, Transport::Tcp, Operation::Connect, &err);
                continue;
            }
        };

        match manager.add_connection(socket, slot) {
            Ok(id) => debug!(connection_id = %id, %peer, "Connection established"),
            Err(err) => {
                warn!(%peer, error = %err, "Failed to add connection");
                dispatcher.reject(peer, Transport::Tcp, Operation::Connect, &err);
            }
        }
    }
    debug!("Accept loop terminated");
}

async fn sweep_loop(
    period: Duration,
    registry: Arc<ServerRegistry>,
    heartbeats: Arc<HeartbeatMachine>,
    validation: Arc<ValidationPipeline>,
    bans: Arc<BanGate>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = registry.sweep();
        let challenges = heartbeats.purge_challenges();
        let verdicts = validation.purge_resolved();
        let bans = bans.purge_expired();
        if report.removed + challenges + verdicts + bans > 0 {
            debug!(
                stale = report.stale,
                removed = report.removed,
                challenges,
                verdicts,
                bans,
                "Sweep finished"
            );
        }
    }
    debug!("Sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_lifecycle() {
        let server = MasterServer::new(MasterConfig::loopback(), ModuleSet::new())
            .await
            .unwrap();
        assert!(!server.is_running());
        assert!(server.tcp_address().is_some());
        assert!(server.udp_address().is_some());

        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(server.modules().is_active());

        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown().await.unwrap();
        assert!(!server.is_running());
        assert!(matches!(server.start().await, Err(MasterError::ServerShuttingDown)));
    }

    #[tokio::test]
    async fn test_server_snapshot() {
        let server = MasterServer::new(MasterConfig::loopback(), ModuleSet::new())
            .await
            .unwrap();
        let snapshot = server.snapshot();

        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.total_connections, 0);
        assert_eq!(snapshot.registered_servers, 0);
        assert_eq!(snapshot.tcp_address, server.tcp_address());
    }

    #[tokio::test]
    async fn test_server_double_start() {
        let server = MasterServer::new(MasterConfig::loopback(), ModuleSet::new())
            .await
            .unwrap();
        server.start().await.unwrap();

        assert!(matches!(server.start().await, Err(MasterError::ServerAlreadyRunning)));

        server.shutdown().await.unwrap();
        assert!(matches!(server.shutdown().await, Err(MasterError::ServerNotRunning)));
    }

    #[tokio::test]
    async fn test_failed_bind_is_skipped() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = MasterConfig::new(vec![
            ListenerConfig::tcp(taken.local_addr().unwrap()),
            ListenerConfig::udp("127.0.0.1:0".parse().unwrap()),
        ]);
        let server = MasterServer::new(config, ModuleSet::new()).await.unwrap();
        assert_eq!(server.tcp_address(), None);
        assert!(server.udp_address().is_some());

        let config = MasterConfig::new(vec![ListenerConfig::tcp(taken.local_addr().unwrap())]);
        assert!(matches!(
            MasterServer::new(config, ModuleSet::new()).await,
            Err(MasterError::NoListeners)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let config = MasterConfig::loopback().with_max_connections(0);
        assert!(matches!(
            MasterServer::new(config, ModuleSet::new()).await,
            Err(MasterError::Config(_))
        ));
    }
}
