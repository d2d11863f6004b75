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

//! Request log
//!
//! Every unit of work produces one [`RequestRecord`]. Records go to a [`LogSink`], which
//! must never block the caller. The [`LogPump`] sink queues records and a drain task hands
//! them to the installed [`LogWriter`] modules in priority order.

use crate::module::{Module, ModuleRegistry};
use crate::types::Transport;
use async_trait::async_trait;
use metrics::counter;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use umaster_codec::OpCode;

/// What a request asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Server announcement
    Heartbeat,
    /// Answer to a heartbeat challenge
    ChallengeResponse,
    /// Server withdrawal
    Deregister,
    /// Server list request
    Query,
    /// CD-key validation
    Validate,
    /// Liveness probe
    Ping,
    /// Connection attempt
    Connect,
    /// A well-formed message the master does not serve
    Other(OpCode),
    /// Bytes that did not decode
    Malformed,
}

impl From<OpCode> for Operation {
    fn from(opcode: OpCode) -> Self {
        match opcode {
            OpCode::Heartbeat => Operation::Heartbeat,
            OpCode::ChallengeResponse => Operation::ChallengeResponse,
            OpCode::Deregister => Operation::Deregister,
            OpCode::Query => Operation::Query,
            OpCode::ValidateKey => Operation::Validate,
            OpCode::Ping => Operation::Ping,
            other => Operation::Other(other),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Heartbeat => f.write_str("heartbeat"),
            Operation::ChallengeResponse => f.write_str("challenge_response"),
            Operation::Deregister => f.write_str("deregister"),
            Operation::Query => f.write_str("query"),
            Operation::Validate => f.write_str("validate"),
            Operation::Ping => f.write_str("ping"),
            Operation::Connect => f.write_str("connect"),
            Operation::Other(opcode) => write!(f, "other({opcode})"),
            Operation::Malformed => f.write_str("malformed"),
        }
    }
}

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Served
    Ok,
    /// Heartbeat answered with a challenge
    Challenged,
    /// Key accepted by a validator
    Accepted,
    /// Key rejected by a validator
    Rejected,
    /// Validation fell back to the default policy
    TimedOut,
    /// Packet did not decode
    FormatError,
    /// Message invalid in the current state
    ProtocolError,
    /// Socket failure
    TransportError,
    /// Sender is banned
    Banned,
    /// Connection refused at capacity
    Refused,
    /// Requester went away first
    Cancelled,
}

impl StatusCode {
    /// Whether the request failed
    pub fn is_error(self) -> bool {
        matches!(
            self,
            StatusCode::FormatError
                | StatusCode::ProtocolError
                | StatusCode::TransportError
                | StatusCode::Banned
                | StatusCode::Refused
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "ok",
            StatusCode::Challenged => "challenged",
            StatusCode::Accepted => "accepted",
            StatusCode::Rejected => "rejected",
            StatusCode::TimedOut => "timed_out",
            StatusCode::FormatError => "format_error",
            StatusCode::ProtocolError => "protocol_error",
            StatusCode::TransportError => "transport_error",
            StatusCode::Banned => "banned",
            StatusCode::Refused => "refused",
            StatusCode::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One line of the request log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// When the request finished
    pub timestamp: SystemTime,
    /// Who sent it
    pub remote: SocketAddr,
    /// How it arrived
    pub transport: Transport,
    /// What it asked for
    pub operation: Operation,
    /// How it ended
    pub status: StatusCode,
}

impl RequestRecord {
    /// Record stamped with the current time
    pub fn now(
        remote: SocketAddr,
        transport: Transport,
        operation: Operation,
        status: StatusCode,
    ) -> Self {
        Self {
            timestamp: SystemTime::now(),
            remote,
            transport,
            operation,
            status,
        }
    }
}

/// Destination for request records
pub trait LogSink: Send + Sync + 'static {
    /// Accept a record without blocking
    fn record(&self, record: RequestRecord);
}

/// A request log backend, installed as a module
#[async_trait]
pub trait LogWriter: Module {
    /// Persist one record
    async fn write(&self, record: &RequestRecord);
}

/// Writes records as `tracing` events
#[derive(Debug, Default)]
pub struct TracingLogWriter {
    priority: i32,
}

impl TracingLogWriter {
    /// Create the writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the position among log writers
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Module for TracingLogWriter {
    fn name(&self) -> &str {
        "tracing-log"
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[async_trait]
impl LogWriter for TracingLogWriter {
    async fn write(&self, record: &RequestRecord) {
        if record.status.is_error() {
            warn!(
                remote = %record.remote,
                transport = %record.transport,
                operation = %record.operation,
                status = %record.status,
                "request"
            );
        } else {
            info!(
                remote = %record.remote,
                transport = %record.transport,
                operation = %record.operation,
                status = %record.status,
                "request"
            );
        }
    }
}

/// Bounded, non-blocking [`LogSink`]
///
/// A full queue drops the record and counts it.
#[derive(Debug)]
pub struct LogPump {
    tx: mpsc::Sender<RequestRecord>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<RequestRecord>>>,
    dropped: AtomicU64,
}

impl LogPump {
    /// Queue holding up to `depth` records
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        Self {
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Records dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Start the task feeding queued records to the log writers of `modules`
    ///
    /// Returns `None` when the drain was already started. On cancellation the task writes
    /// what is still queued and exits.
    pub fn spawn_drain(
        &self,
        modules: Arc<ModuleRegistry>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        Some(tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    record = rx.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        rx.close();
                        while let Some(record) = rx.recv().await {
                            write_all(&modules, &record).await;
                        }
                        break;
                    }
                };
                write_all(&modules, &record).await;
            }
            debug!("Request log drain stopped");
        }))
    }
}

impl LogSink for LogPump {
    fn record(&self, record: RequestRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("umaster.log.dropped").increment(1);
        }
    }
}

async fn write_all(modules: &ModuleRegistry, record: &RequestRecord) {
    for writer in modules.log_writers().iter() {
        writer.write(record).await;
    }
}
