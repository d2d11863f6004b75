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

//! Heartbeat state machine
//!
//! A game server moves through
//! `Unregistered → AwaitingAck → Registered → Stale → Removed`.
//! `AwaitingAck` only exists while the master requires new servers to echo a challenge
//! nonce; the remaining states are derived from the registry clock.

use crate::ban::BanGate;
use crate::config::HeartbeatPolicy;
use crate::error::{MasterError, Result};
use crate::registry::{EntryState, Metadata, Server, ServerKey, ServerRegistry, UpsertOutcome};
use dashmap::DashMap;
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use umaster_codec::{Heartbeat, Message};

/// Registration state of a server key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Never seen, or deleted
    Unregistered,
    /// Challenged, waiting for the nonce to come back
    AwaitingAck,
    /// Listed
    Registered,
    /// Missed its deadline; hidden from queries
    Stale,
    /// Past the grace period, about to be deleted
    Removed,
}

/// What the master answers to an accepted heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReply {
    /// Listed; heartbeat again within the interval
    Ack {
        /// Heartbeat interval in seconds
        interval_secs: u16,
    },
    /// Echo this nonce to complete registration
    Challenge {
        /// Nonce to echo
        nonce: i32,
    },
}

impl HeartbeatReply {
    /// Wire form of the reply
    pub fn into_message(self) -> Message {
        match self {
            HeartbeatReply::Ack { interval_secs } => Message::HeartbeatAck { interval_secs },
            HeartbeatReply::Challenge { nonce } => Message::Challenge { nonce },
        }
    }
}

#[derive(Debug)]
struct PendingChallenge {
    nonce: i32,
    game: String,
    metadata: Metadata,
    expires_at: Instant,
}

/// Drives registrations into the [`ServerRegistry`]
///
/// Per-key work touches only that key's registry entry and pending challenge, so heartbeats
/// from unrelated servers never wait on each other beyond the registry write lock.
#[derive(Debug)]
pub struct HeartbeatMachine {
    registry: Arc<ServerRegistry>,
    bans: Arc<BanGate>,
    policy: HeartbeatPolicy,
    pending: DashMap<ServerKey, PendingChallenge>,
}

impl HeartbeatMachine {
    /// Create a machine over a registry and ban gate
    pub fn new(registry: Arc<ServerRegistry>, bans: Arc<BanGate>, policy: HeartbeatPolicy) -> Self {
        Self {
            registry,
            bans,
            policy,
            pending: DashMap::new(),
        }
    }

    /// Policy in effect
    pub fn policy(&self) -> &HeartbeatPolicy {
        &self.policy
    }

    /// Handle a heartbeat from `peer`
    pub fn heartbeat(&self, peer: SocketAddr, heartbeat: Heartbeat) -> Result<HeartbeatReply> {
        self.heartbeat_at(peer, heartbeat, Instant::now())
    }

    /// [`heartbeat`](Self::heartbeat) with an explicit clock
    ///
    /// A key that is already listed, stale or not, is refreshed in place. Repeating the
    /// same heartbeat leaves one entry carrying the latest metadata.
    pub fn heartbeat_at(
        &self,
        peer: SocketAddr,
        heartbeat: Heartbeat,
        now: Instant,
    ) -> Result<HeartbeatReply> {
        if self.bans.is_banned_at(peer.ip(), now) {
            return Err(MasterError::BanRejection(peer.ip()));
        }

        let key = ServerKey::from_heartbeat(peer, heartbeat.port);
        let metadata: Metadata = heartbeat.metadata.into_iter().collect();
        let listed = matches!(
            self.registry.state_of_at(&key, now),
            Some(EntryState::Registered | EntryState::Stale)
        );

        if listed || !self.policy.require_challenge {
            let outcome = self
                .registry
                .upsert_at(Server::new(key, heartbeat.game, metadata, now), now);
            if outcome == UpsertOutcome::Created {
                tracing::info!(server = %key, "Server registered");
                self.pending.remove(&key);
            }
            counter!("umaster.heartbeats.accepted").increment(1);
            return Ok(self.ack());
        }

        let mut pending = self.pending.entry(key).or_insert_with(|| PendingChallenge {
            nonce: rand::random(),
            game: String::new(),
            metadata: Metadata::new(),
            expires_at: now + self.policy.interval,
        });
        if pending.expires_at <= now {
            pending.nonce = rand::random();
            pending.expires_at = now + self.policy.interval;
        }
        pending.game = heartbeat.game;
        pending.metadata = metadata;
        tracing::debug!(server = %key, "Challenging new server");
        Ok(HeartbeatReply::Challenge {
            nonce: pending.nonce,
        })
    }

    /// Handle the echo of a challenge nonce
    pub fn challenge_response(
        &self,
        peer: SocketAddr,
        nonce: i32,
        port: u16,
    ) -> Result<HeartbeatReply> {
        self.challenge_response_at(peer, nonce, port, Instant::now())
    }

    /// [`challenge_response`](Self::challenge_response) with an explicit clock
    ///
    /// A missing, expired or mismatched challenge is a protocol error and leaves the
    /// pending challenge untouched.
    pub fn challenge_response_at(
        &self,
        peer: SocketAddr,
        nonce: i32,
        port: u16,
        now: Instant,
    ) -> Result<HeartbeatReply> {
        if self.bans.is_banned_at(peer.ip(), now) {
            return Err(MasterError::BanRejection(peer.ip()));
        }

        let key = ServerKey::from_heartbeat(peer, port);
        let (_, pending) = self
            .pending
            .remove_if(&key, |_, pending| {
                pending.nonce == nonce && pending.expires_at > now
            })
            .ok_or_else(|| MasterError::protocol(format!("no matching challenge for {key}")))?;

        self.registry.upsert_at(
            Server::new(key, pending.game, pending.metadata, now).validated(true),
            now,
        );
        tracing::info!(server = %key, "Server registered after challenge");
        counter!("umaster.heartbeats.accepted").increment(1);
        Ok(self.ack())
    }

    /// Withdraw a listing; returns whether anything was removed
    pub fn deregister(&self, peer: SocketAddr, port: u16) -> bool {
        let key = ServerKey::from_heartbeat(peer, port);
        let challenged = self.pending.remove(&key).is_some();
        let listed = self.registry.remove(&key).is_some();
        if listed {
            tracing::info!(server = %key, "Server deregistered");
        }
        challenged || listed
    }

    /// State of `key`
    pub fn state_of(&self, key: &ServerKey) -> HeartbeatState {
        self.state_of_at(key, Instant::now())
    }

    /// [`state_of`](Self::state_of) with an explicit clock
    pub fn state_of_at(&self, key: &ServerKey, now: Instant) -> HeartbeatState {
        match self.registry.state_of_at(key, now) {
            Some(EntryState::Registered) => HeartbeatState::Registered,
            Some(EntryState::Stale) => HeartbeatState::Stale,
            Some(EntryState::Removed) => HeartbeatState::Removed,
            None => match self.pending.get(key) {
                Some(pending) if pending.expires_at > now => HeartbeatState::AwaitingAck,
                _ => HeartbeatState::Unregistered,
            },
        }
    }

    /// Drop lapsed challenges; returns how many were removed
    pub fn purge_challenges(&self) -> usize {
        self.purge_challenges_at(Instant::now())
    }

    /// [`purge_challenges`](Self::purge_challenges) with an explicit clock
    pub fn purge_challenges_at(&self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.expires_at > now);
        before.saturating_sub(self.pending.len())
    }

    /// Number of outstanding challenges
    pub fn pending_challenges(&self) -> usize {
        self.pending.len()
    }

    fn ack(&self) -> HeartbeatReply {
        HeartbeatReply::Ack {
            interval_secs: self.policy.interval_secs(),
        }
    }
}
