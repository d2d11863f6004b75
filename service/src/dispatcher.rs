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

//! Protocol dispatcher
//!
//! Turns one inbound packet into replies. Each packet is one unit of work and produces
//! exactly one [`RequestRecord`], however it ends. Validation requests are the only work
//! that outlives the call: they run in their own task and answer through the session's
//! [`Responder`](crate::Responder), recording their outcome when the verdict is delivered.

use crate::ban::BanGate;
use crate::error::{MasterError, Result};
use crate::handler::HandlerOutcome;
use crate::heartbeat::{HeartbeatMachine, HeartbeatReply};
use crate::logging::{LogSink, Operation, RequestRecord, StatusCode};
use crate::metrics::ServerMetrics;
use crate::module::ModuleRegistry;
use crate::query::QueryHandler;
use crate::session::Session;
use crate::types::{Origin, Transport};
use crate::validation::{KeyMaterial, ValidationPipeline};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};
use umaster_codec::{Message, OpCode, Packet, ValidateKey};

/// Routes decoded messages to the subsystem that serves them
pub struct ProtocolDispatcher {
    modules: Arc<ModuleRegistry>,
    heartbeats: Arc<HeartbeatMachine>,
    queries: Arc<QueryHandler>,
    validation: Arc<ValidationPipeline>,
    bans: Arc<BanGate>,
    sink: Arc<dyn LogSink>,
    metrics: Arc<ServerMetrics>,
}

impl ProtocolDispatcher {
    /// Create a dispatcher over the given subsystems
    pub fn new(
        modules: Arc<ModuleRegistry>,
        heartbeats: Arc<HeartbeatMachine>,
        queries: Arc<QueryHandler>,
        validation: Arc<ValidationPipeline>,
        bans: Arc<BanGate>,
        sink: Arc<dyn LogSink>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            modules,
            heartbeats,
            queries,
            validation,
            bans,
            sink,
            metrics,
        }
    }

    /// The validation pipeline
    pub fn validation(&self) -> &Arc<ValidationPipeline> {
        &self.validation
    }

    /// Handle one packet, returning the replies to send right away
    #[instrument(skip_all, fields(peer = %session.peer(), transport = %session.transport()))]
    pub async fn dispatch(&self, session: &Session, packet: Packet) -> Vec<Message> {
        let peek = packet
            .as_bytes()
            .first()
            .map_or(Operation::Malformed, |byte| Operation::from(OpCode::from(*byte)));

        if self.bans.is_banned(session.peer().ip()) {
            self.fail(session, peek, &MasterError::BanRejection(session.peer().ip()));
            return Vec::new();
        }

        let message = match Message::decode(packet) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "Dropping malformed packet");
                self.fail(session, Operation::Malformed, &err.into());
                return Vec::new();
            }
        };
        let operation = Operation::from(message.opcode());
        trace!(%operation, "Dispatching");

        match self.offer(session, &message).await {
            Ok(HandlerOutcome::Pass) => {}
            Ok(HandlerOutcome::Handled(replies)) => {
                self.log(session, operation, StatusCode::Ok);
                return replies;
            }
            Err(err) => {
                self.fail(session, operation, &err);
                return Vec::new();
            }
        }

        if let Message::ValidateKey(request) = message {
            self.spawn_validation(session, request);
            return Vec::new();
        }

        match self.route(session, message) {
            Ok((replies, status)) => {
                self.log(session, operation, status);
                replies
            }
            Err(err) => {
                self.fail(session, operation, &err);
                Vec::new()
            }
        }
    }

    /// Record a failure that happened before a packet could be dispatched
    ///
    /// Used by transports for framing errors and refused connections.
    pub fn reject(&self, remote: SocketAddr, transport: Transport, operation: Operation, err: &MasterError) {
        self.count(err);
        self.sink
            .record(RequestRecord::now(remote, transport, operation, err.status()));
    }

    /// Abandon all work of a closed connection; returns how many validations were cancelled
    pub fn connection_closed(&self, origin: Origin) -> usize {
        self.validation.cancel_origin(origin)
    }

    async fn offer(&self, session: &Session, message: &Message) -> Result<HandlerOutcome> {
        for handler in self.modules.handlers().iter() {
            match handler.handle(session, message).await? {
                HandlerOutcome::Pass => {}
                handled => {
                    trace!(handler = handler.name(), "Message claimed by handler");
                    return Ok(handled);
                }
            }
        }
        Ok(HandlerOutcome::Pass)
    }

    fn route(&self, session: &Session, message: Message) -> Result<(Vec<Message>, StatusCode)> {
        let peer = session.peer();
        match message {
            Message::Heartbeat(heartbeat) => {
                self.metrics.heartbeat();
                let reply = self.heartbeats.heartbeat(peer, heartbeat)?;
                let status = match reply {
                    HeartbeatReply::Ack { .. } => StatusCode::Ok,
                    HeartbeatReply::Challenge { .. } => StatusCode::Challenged,
                };
                Ok((vec![reply.into_message()], status))
            }
            Message::ChallengeResponse { nonce, port } => {
                let reply = self.heartbeats.challenge_response(peer, nonce, port)?;
                Ok((vec![reply.into_message()], StatusCode::Ok))
            }
            Message::Deregister { port } => {
                self.heartbeats.deregister(peer, port);
                Ok((Vec::new(), StatusCode::Ok))
            }
            Message::Query { filters } => {
                self.metrics.query();
                let replies = match session.transport() {
                    Transport::Tcp => self.queries.respond_stream(&filters, session.max_payload()),
                    Transport::Udp => self.queries.respond(&filters, session.max_payload()),
                };
                Ok((replies, StatusCode::Ok))
            }
            Message::Ping { token } => Ok((vec![Message::Pong { token }], StatusCode::Ok)),
            other => Err(MasterError::protocol(format!(
                "{} is not a request the master serves",
                other.opcode()
            ))),
        }
    }

    fn spawn_validation(&self, session: &Session, request: ValidateKey) {
        let pipeline = self.validation.clone();
        let sink = self.sink.clone();
        let metrics = self.metrics.clone();
        let session = session.clone();
        let correlation = request.correlation;
        let material = KeyMaterial::from(request);

        tokio::spawn(async move {
            let origin = session.origin();
            let status = match pipeline
                .validate(origin, correlation, material, session.cancel_token())
                .await
            {
                Ok(outcome) => match session.responder().send(outcome.to_message(correlation)).await {
                    Ok(()) => outcome.status(),
                    Err(err) => {
                        debug!(%origin, error = %err, "Verdict could not be delivered");
                        metrics.transport_error();
                        err.status()
                    }
                },
                Err(err) => {
                    debug!(%origin, correlation, error = %err, "Validation abandoned");
                    err.status()
                }
            };
            sink.record(RequestRecord::now(
                session.peer(),
                session.transport(),
                Operation::Validate,
                status,
            ));
        });
    }

    fn fail(&self, session: &Session, operation: Operation, err: &MasterError) {
        if err.is_protocol_error() {
            warn!(%operation, error = %err, "Request refused");
        }
        self.reject(session.peer(), session.transport(), operation, err);
    }

    fn log(&self, session: &Session, operation: Operation, status: StatusCode) {
        self.sink.record(RequestRecord::now(
            session.peer(),
            session.transport(),
            operation,
            status,
        ));
    }

    fn count(&self, err: &MasterError) {
        match err {
            MasterError::Format(_) => self.metrics.format_error(),
            MasterError::Protocol(_) => self.metrics.protocol_error(),
            MasterError::BanRejection(_) => self.metrics.ban_rejection(),
            MasterError::MaxConnectionsReached(_) => self.metrics.connection_refused(),
            _ => self.metrics.transport_error(),
        }
    }
}

impl std::fmt::Debug for ProtocolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolDispatcher")
            .field("modules", &self.modules)
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatPolicy, ValidationConfig};
    use crate::handler::CallbackHandler;
    use crate::module::ModuleSet;
    use crate::registry::ServerRegistry;
    use crate::validation::NullValidator;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use umaster_codec::{Heartbeat, ValidateResult};

    #[derive(Default)]
    struct Journal(Mutex<Vec<RequestRecord>>);

    impl LogSink for Journal {
        fn record(&self, record: RequestRecord) {
            self.0.lock().push(record);
        }
    }

    impl Journal {
        fn statuses(&self) -> Vec<(Operation, StatusCode)> {
            self.0.lock().iter().map(|r| (r.operation, r.status)).collect()
        }
    }

    struct Fixture {
        dispatcher: ProtocolDispatcher,
        journal: Arc<Journal>,
        bans: Arc<BanGate>,
        registry: Arc<ServerRegistry>,
    }

    fn fixture(set: ModuleSet) -> Fixture {
        let policy = HeartbeatPolicy::default();
        let registry = Arc::new(ServerRegistry::from_policy(&policy));
        let bans = Arc::new(BanGate::new());
        let metrics = Arc::new(ServerMetrics::new());
        let modules = Arc::new(ModuleRegistry::new(set));
        let journal = Arc::new(Journal::default());
        let dispatcher = ProtocolDispatcher::new(
            modules.clone(),
            Arc::new(HeartbeatMachine::new(registry.clone(), bans.clone(), policy)),
            Arc::new(QueryHandler::new(registry.clone(), bans.clone())),
            Arc::new(ValidationPipeline::new(
                modules,
                ValidationConfig::default(),
                metrics.clone(),
            )),
            bans.clone(),
            journal.clone(),
            metrics,
        );
        Fixture {
            dispatcher,
            journal,
            bans,
            registry,
        }
    }

    fn session() -> (Session, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let session = Session::tcp(
            crate::types::ConnectionId::new(1),
            "192.0.2.10:40000".parse().unwrap(),
            CancellationToken::new(),
            tx,
            1200,
        );
        (session, rx)
    }

    fn heartbeat() -> Packet {
        Message::Heartbeat(Heartbeat {
            game: "ut".to_string(),
            port: 7777,
            metadata: vec![("mapname".to_string(), "DM-Deck16".to_string())],
        })
        .encode()
        .into_inbound()
    }

    #[tokio::test]
    async fn test_heartbeat_then_query() {
        let fx = fixture(ModuleSet::new());
        let (session, _rx) = session();

        let replies = fx.dispatcher.dispatch(&session, heartbeat()).await;
        assert!(matches!(replies.as_slice(), [Message::HeartbeatAck { .. }]));
        assert_eq!(fx.registry.len(), 1);

        let query = Message::Query { filters: Vec::new() }.encode().into_inbound();
        let replies = fx.dispatcher.dispatch(&session, query).await;
        let [Message::ServerList(list)] = replies.as_slice() else {
            panic!("expected one server list fragment");
        };
        assert_eq!(list.servers.len(), 1);
        assert_eq!(list.servers[0].port, 7777);

        assert_eq!(
            fx.journal.statuses(),
            vec![
                (Operation::Heartbeat, StatusCode::Ok),
                (Operation::Query, StatusCode::Ok)
            ]
        );
    }

    #[tokio::test]
    async fn test_errors_stay_local() {
        let fx = fixture(ModuleSet::new());
        let (session, _rx) = session();

        let garbage = Packet::inbound(&[0x01]);
        assert!(fx.dispatcher.dispatch(&session, garbage).await.is_empty());

        let stray = Message::ValidateResult(ValidateResult {
            correlation: 1,
            accepted: true,
            timed_out: false,
        })
        .encode()
        .into_inbound();
        assert!(fx.dispatcher.dispatch(&session, stray).await.is_empty());

        fx.bans.ban(session.peer().ip(), None, None);
        assert!(fx.dispatcher.dispatch(&session, heartbeat()).await.is_empty());
        assert!(fx.registry.is_empty());

        assert_eq!(
            fx.journal.statuses(),
            vec![
                (Operation::Malformed, StatusCode::FormatError),
                (
                    Operation::Other(OpCode::ValidateResult),
                    StatusCode::ProtocolError
                ),
                (Operation::Heartbeat, StatusCode::Banned),
            ]
        );
    }

    #[tokio::test]
    async fn test_handler_claims_unknown_opcode() {
        let handler = CallbackHandler::new("motd", |_session, message| match message {
            Message::Unknown { opcode: 0x60, .. } => {
                HandlerOutcome::Handled(vec![Message::Pong { token: 60 }])
            }
            _ => HandlerOutcome::Pass,
        });
        let fx = fixture(ModuleSet::new().with_handler(Arc::new(handler)));
        let (session, _rx) = session();

        let replies = fx
            .dispatcher
            .dispatch(&session, Packet::inbound(&[0x60, 1, 2, 3]))
            .await;
        assert_eq!(replies, vec![Message::Pong { token: 60 }]);

        // Pings still reach the built-in routing
        let ping = Message::Ping { token: 9 }.encode().into_inbound();
        let replies = fx.dispatcher.dispatch(&session, ping).await;
        assert_eq!(replies, vec![Message::Pong { token: 9 }]);
    }

    #[tokio::test]
    async fn test_validation_answers_through_responder() {
        let fx = fixture(ModuleSet::new().with_validator(Arc::new(NullValidator::new())));
        let (session, mut rx) = session();

        let request = Message::ValidateKey(ValidateKey {
            correlation: 77,
            key_hash: "abc".to_string(),
            challenge: "x".to_string(),
            response: "y".to_string(),
        })
        .encode()
        .into_inbound();
        assert!(fx.dispatcher.dispatch(&session, request).await.is_empty());

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reply,
            Message::ValidateResult(ValidateResult {
                correlation: 77,
                accepted: true,
                timed_out: false,
            })
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            fx.journal.statuses(),
            vec![(Operation::Validate, StatusCode::Accepted)]
        );
    }
}
