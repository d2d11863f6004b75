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

//! Connection worker implementation
//!
//! The ConnectionWorker owns one TCP connection for its whole life:
//! - Reading frames and handing them to the dispatcher
//! - Writing immediate and deferred replies
//! - Read, idle and write timeouts
//! - Control messages from the manager
//! - Cancelling outstanding work when the connection ends

use crate::connection::TcpConnection;
use crate::dispatcher::ProtocolDispatcher;
use crate::error::{MasterError, Result};
use crate::logging::Operation;
use crate::metrics::ServerMetrics;
use crate::session::Session;
use crate::types::{ConnectionId, ConnectionState, Origin, Transport};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use umaster_codec::Message;

/// Control messages for the worker
#[derive(Debug)]
pub enum ControlMessage {
    /// Gracefully close the connection
    Close,
    /// Send a message to the peer
    Send(Message),
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Max time to wait for the next frame
    pub read_timeout: Duration,
    /// Max time without any traffic
    pub idle_timeout: Duration,
    /// Max time for one write
    pub write_timeout: Duration,
    /// Control channel buffer size
    pub control_buffer_size: usize,
    /// Deferred reply buffer size
    pub reply_buffer_size: usize,
    /// Largest reply packet
    pub max_payload: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(10),
            control_buffer_size: 32,
            reply_buffer_size: 64,
            max_payload: umaster_codec::MAX_FRAME_LEN,
        }
    }
}

/// Connection worker that manages a single connection's lifecycle
pub struct ConnectionWorker {
    id: ConnectionId,
    connection: TcpConnection,
    dispatcher: Arc<ProtocolDispatcher>,
    metrics: Arc<ServerMetrics>,
    config: WorkerConfig,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    control_rx: mpsc::Receiver<ControlMessage>,
    reply_tx: mpsc::Sender<Message>,
    reply_rx: mpsc::Receiver<Message>,
    last_activity: Instant,
}

impl ConnectionWorker {
    /// Create a new connection worker
    ///
    /// `cancel` ends the worker and every piece of work its requests started.
    pub fn new(
        connection: TcpConnection,
        dispatcher: Arc<ProtocolDispatcher>,
        metrics: Arc<ServerMetrics>,
        config: WorkerConfig,
        state: Arc<AtomicU8>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<ControlMessage>) {
        let (control_tx, control_rx) = mpsc::channel(config.control_buffer_size.max(1));
        let (reply_tx, reply_rx) = mpsc::channel(config.reply_buffer_size.max(1));

        let worker = Self {
            id: connection.id(),
            connection,
            dispatcher,
            metrics,
            config,
            state,
            cancel,
            control_rx,
            reply_tx,
            reply_rx,
            last_activity: Instant::now(),
        };

        (worker, control_tx)
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, new_state: ConnectionState) {
        self.state.store(new_state.as_u8(), Ordering::Release);
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.state() == ConnectionState::Idle {
            self.set_state(ConnectionState::Active);
        }
    }

    /// Next instant the idle check has something to do
    fn idle_deadline(&self) -> Instant {
        match self.state() {
            ConnectionState::Idle => self.last_activity + self.config.idle_timeout,
            _ => self.last_activity + self.config.idle_timeout / 2,
        }
    }

    fn session(&self) -> Session {
        Session::tcp(
            self.id,
            self.connection.peer_addr(),
            self.cancel.clone(),
            self.reply_tx.clone(),
            self.config.max_payload,
        )
    }

    /// Run the worker until the connection ends
    pub async fn run(mut self) {
        self.set_state(ConnectionState::Active);

        match self.event_loop().await {
            Ok(()) => debug!(connection_id = %self.id, "Connection closed"),
            Err(MasterError::Format(err)) => {
                debug!(connection_id = %self.id, error = %err, "Closing connection after bad frame");
                self.dispatcher.reject(
                    self.connection.peer_addr(),
                    Transport::Tcp,
                    Operation::Malformed,
                    &MasterError::Format(err),
                );
            }
            Err(MasterError::Timeout) => {
                debug!(connection_id = %self.id, "Connection timed out");
            }
            Err(err) => {
                debug!(connection_id = %self.id, error = %err, "Connection failed");
                self.metrics.transport_error();
            }
        }

        self.cleanup();
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            let idle_at = self.idle_deadline();
            select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(()),

                msg = self.control_rx.recv() => match msg {
                    Some(ControlMessage::Close) | None => return Ok(()),
                    Some(ControlMessage::Send(message)) => self.write(&message).await?,
                },

                Some(reply) = self.reply_rx.recv() => self.write(&reply).await?,

                result = timeout(self.config.read_timeout, self.connection.next()) => match result {
                    Ok(Ok(Some(packet))) => {
                        self.metrics.bytes_received(packet.len() as u64);
                        self.touch();
                        let session = self.session();
                        for reply in self.dispatcher.dispatch(&session, packet).await {
                            self.write(&reply).await?;
                        }
                    }
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(MasterError::Timeout),
                },

                _ = sleep_until(idle_at) => {
                    if self.state() == ConnectionState::Idle {
                        return Err(MasterError::Timeout);
                    }
                    self.set_state(ConnectionState::Idle);
                }
            }
        }
    }

    async fn write(&mut self, message: &Message) -> Result<()> {
        match timeout(self.config.write_timeout, self.connection.send(message)).await {
            Ok(Ok(written)) => {
                self.metrics.bytes_sent(written);
                self.touch();
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(connection_id = %self.id, "Write timed out");
                Err(MasterError::Timeout)
            }
        }
    }

    fn cleanup(&mut self) {
        self.set_state(ConnectionState::Closing);

        self.cancel.cancel();
        let cancelled = self.dispatcher.connection_closed(Origin::Tcp(self.id));
        if cancelled > 0 {
            debug!(connection_id = %self.id, cancelled, "Abandoned pending validations");
        }

        self.control_rx.close();
        while self.control_rx.try_recv().is_ok() {}
        self.reply_rx.close();
        while self.reply_rx.try_recv().is_ok() {}

        self.set_state(ConnectionState::Closed);
    }
}

impl std::fmt::Debug for ConnectionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWorker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("last_activity", &self.last_activity)
            .finish()
    }
}
