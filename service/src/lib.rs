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

//! Game Master Server
//!
//! This crate keeps the live list of game servers and answers the three things game
//! clients and servers ask a master for:
//!
//! - Heartbeats that register a server and keep it listed
//! - Queries for the filtered server list, fragmented to fit datagrams
//! - CD-key validation through a chain of pluggable validators
//!
//! # Architecture
//!
//! ```text
//! MasterServer
//!     ├── accept loop → ConnectionManager → ConnectionWorker → TcpConnection
//!     ├── UdpListener → sharded workers
//!     └── sweeper
//!              ↓
//!      ProtocolDispatcher (ban gate, request handlers)
//!          ├── HeartbeatMachine → ServerRegistry
//!          ├── QueryHandler     → ServerRegistry
//!          └── ValidationPipeline → Validator chain
//! ```
//!
//! Every request ends in a [`RequestRecord`] handed to the [`LogSink`]; log writer
//! modules receive them off the request path.
//!
//! # Example
//!
//! ```no_run
//! use umaster_service::{MasterConfig, MasterServer, ModuleSet, NullValidator, TracingLogWriter};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let modules = ModuleSet::new()
//!         .with_validator(Arc::new(NullValidator::new()))
//!         .with_log_writer(Arc::new(TracingLogWriter::new()));
//!     let server = MasterServer::new(MasterConfig::default(), modules).await?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

mod ban;
mod command;
mod config;
mod connection;
mod dispatcher;
mod error;
mod handler;
mod heartbeat;
mod logging;
mod manager;
mod metrics;
mod module;
mod query;
mod registry;
mod server;
mod session;
mod types;
mod udp;
mod validation;
mod worker;

pub use ban::{BanEntry, BanGate};
pub use command::{AdminCommands, Command, CommandListener, CommandRegistry, CommandResponse};
pub use config::{
    DEFAULT_TCP_PORT, DEFAULT_UDP_PAYLOAD, DEFAULT_UDP_PORT, DefaultPolicy, HeartbeatPolicy,
    ListenerConfig, MasterConfig, UpstreamConfig, ValidationConfig,
};
pub use connection::{ConnectionStats, TcpConnection};
pub use dispatcher::ProtocolDispatcher;
pub use error::{MasterError, Result};
pub use handler::{CallbackHandler, HandlerOutcome, RequestHandler};
pub use heartbeat::{HeartbeatMachine, HeartbeatReply, HeartbeatState};
pub use logging::{LogPump, LogSink, LogWriter, Operation, RequestRecord, StatusCode, TracingLogWriter};
pub use manager::{ConnectionManager, ConnectionSlot};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use module::{Module, ModuleContext, ModuleRegistry, ModuleSet};
pub use query::{QueryHandler, fragment};
pub use registry::{
    EntryState, Metadata, Server, ServerFilter, ServerKey, ServerListEntry, ServerRegistry,
    SweepReport, UpsertOutcome,
};
pub use server::MasterServer;
pub use session::{Responder, Session};
pub use types::{ConnectionId, ConnectionInfo, ConnectionState, Origin, ServerSnapshot, Transport};
pub use udp::UdpListener;
pub use validation::{
    Classification, KeyBackend, KeyMaterial, KeyRequest, MultiValidator, NullValidator,
    PassthroughValidator, SingleValidator, StaticKeyBackend, UpstreamClient, ValidationOutcome,
    ValidationPipeline, ValidationState, Validator, Verdict, expected_response, hash_key,
    normalise_key,
};
pub use worker::{ConnectionWorker, ControlMessage, WorkerConfig};
