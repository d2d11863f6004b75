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

//! UDP relay to an upstream master

use super::KeyMaterial;
use crate::config::UpstreamConfig;
use crate::error::{MasterError, Result};
use dashmap::DashMap;
use metrics::counter;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{OnceCell, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use umaster_codec::{MAX_FRAME_LEN, Message, ValidateKey, ValidateResult};

type PendingReplies = DashMap<i32, oneshot::Sender<ValidateResult>>;

/// Client side of the validation relay
///
/// Requests carry a correlation id chosen by this client, unrelated to the id the game
/// server used. Every attempt of one relay reuses the same id, so whichever reply arrives
/// first answers it. Replies with an id nobody is waiting for are logged and dropped.
#[derive(Debug)]
pub struct UpstreamClient {
    config: UpstreamConfig,
    socket: OnceCell<Arc<UdpSocket>>,
    pending: Arc<PendingReplies>,
    next_correlation: AtomicI32,
    cancel: CancellationToken,
}

/// Removes a relay's pending entry however the relay ends.
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    correlation: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation);
    }
}

impl UpstreamClient {
    /// Client for the upstream described by `config`; no socket is opened yet
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            socket: OnceCell::new(),
            pending: Arc::new(DashMap::new()),
            next_correlation: AtomicI32::new(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Upstream settings
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Open the relay socket and start its reader, once
    pub async fn connect(&self) -> Result<Arc<UdpSocket>> {
        let socket = self
            .socket
            .get_or_try_init(|| async {
                let local = match self.config.address.ip() {
                    IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                    IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(self.config.address).await?;
                let socket = Arc::new(socket);
                debug!(upstream = %self.config.address, "Upstream relay connected");
                tokio::spawn(read_replies(
                    socket.clone(),
                    self.pending.clone(),
                    self.cancel.clone(),
                ));
                Ok::<_, MasterError>(socket)
            })
            .await?;
        Ok(socket.clone())
    }

    /// Ask the upstream about `material`
    ///
    /// Each attempt waits `attempt_timeout`; after `max_attempts` silent attempts the relay
    /// fails with [`MasterError::Timeout`].
    #[instrument(skip(self, material), fields(upstream = %self.config.address))]
    pub async fn relay(&self, material: &KeyMaterial) -> Result<ValidateResult> {
        let socket = self.connect().await?;
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(correlation, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation,
        };

        let request = Message::ValidateKey(ValidateKey {
            correlation,
            key_hash: material.key_hash.clone(),
            challenge: material.challenge.clone(),
            response: material.response.clone(),
        })
        .encode();

        for attempt in 1..=self.config.max_attempts {
            counter!("umaster.upstream.attempts").increment(1);
            if let Err(error) = socket.send(request.as_bytes()).await {
                debug!(attempt, %error, "Upstream send failed");
            }
            match timeout(self.config.attempt_timeout, &mut rx).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(_)) => return Err(MasterError::ConnectionClosed),
                Err(_) => debug!(attempt, correlation, "Upstream attempt timed out"),
            }
        }
        counter!("umaster.upstream.timeouts").increment(1);
        Err(MasterError::Timeout)
    }

    /// Number of relays waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Stop the reader task
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UpstreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_replies(
    socket: Arc<UdpSocket>,
    pending: Arc<PendingReplies>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(len) => len,
                // ICMP port unreachable from an earlier send
                Err(error) if error.kind() == ErrorKind::ConnectionRefused => continue,
                Err(error) => {
                    warn!(%error, "Upstream receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        match Message::decode_bytes(&buf[..len]) {
            Ok(Message::ValidateResult(result)) => match pending.remove(&result.correlation) {
                Some((_, tx)) => {
                    let _ = tx.send(result);
                }
                None => {
                    counter!("umaster.errors.protocol").increment(1);
                    warn!(
                        correlation = result.correlation,
                        "Upstream reply with unknown correlation id"
                    );
                }
            },
            Ok(other) => {
                counter!("umaster.errors.protocol").increment(1);
                warn!(opcode = %other.opcode(), "Unexpected message from upstream");
            }
            Err(error) => {
                counter!("umaster.errors.format").increment(1);
                debug!(%error, "Malformed upstream datagram");
            }
        }
    }
    debug!("Upstream reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> KeyMaterial {
        KeyMaterial {
            key_hash: "00112233445566778899aabbccddeeff".to_string(),
            challenge: "abc".to_string(),
            response: "def".to_string(),
        }
    }

    #[tokio::test]
    async fn test_relay_answered() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (len, from) = upstream.recv_from(&mut buf).await.unwrap();
            let Message::ValidateKey(request) = Message::decode_bytes(&buf[..len]).unwrap() else {
                panic!("expected a validate request");
            };
            // A stray reply first, then the real one
            let stray = Message::ValidateResult(ValidateResult {
                correlation: request.correlation.wrapping_add(100),
                accepted: false,
                timed_out: false,
            });
            upstream.send_to(stray.encode().as_bytes(), from).await.unwrap();
            let reply = Message::ValidateResult(ValidateResult {
                correlation: request.correlation,
                accepted: true,
                timed_out: false,
            });
            upstream.send_to(reply.encode().as_bytes(), from).await.unwrap();
        });

        let client = UpstreamClient::new(UpstreamConfig::new(address));
        let result = client.relay(&material()).await.unwrap();
        assert!(result.accepted);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_relay_retries_then_times_out() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = UpstreamConfig::new(upstream.local_addr().unwrap())
            .with_attempt_timeout(Duration::from_millis(50))
            .with_max_attempts(3);
        let client = UpstreamClient::new(config);

        let err = client.relay(&material()).await.unwrap_err();
        assert!(matches!(err, MasterError::Timeout));
        assert_eq!(client.in_flight(), 0);

        // Every attempt reached the upstream with the same correlation id
        let mut buf = vec![0u8; 2048];
        let mut ids = Vec::new();
        for _ in 0..3 {
            let len = upstream.recv(&mut buf).await.unwrap();
            if let Message::ValidateKey(request) = Message::decode_bytes(&buf[..len]).unwrap() {
                ids.push(request.correlation);
            }
        }
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
