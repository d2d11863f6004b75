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

//! Server registry
//!
//! The registry is the table of live game servers. Entries are immutable [`Server`] values
//! behind an `Arc`; an accepted heartbeat replaces the whole value, so a reader holding a
//! snapshot never observes a half-written entry.
//!
//! Time enters only through the `*_at` variants, which makes eviction deterministic under
//! test. The plain variants read [`Instant::now`].

use crate::ban::canonical_ip;
use crate::config::HeartbeatPolicy;
use metrics::gauge;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use umaster_codec::ServerRecord;

/// Unique identity of a listed server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    /// Public address of the game server
    pub address: IpAddr,
    /// Game port
    pub port: u16,
}

impl ServerKey {
    /// Create a key
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address: canonical_ip(address),
            port,
        }
    }

    /// Key for a heartbeat received from `peer` announcing `announced`
    ///
    /// An announced port of zero falls back to the source port of the datagram.
    pub fn from_heartbeat(peer: SocketAddr, announced: u16) -> Self {
        let port = if announced == 0 { peer.port() } else { announced };
        Self::new(peer.ip(), port)
    }

    /// The key as a socket address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for ServerKey {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s.parse()?;
        Ok(Self::new(addr.ip(), addr.port()))
    }
}

/// Server-reported key/value metadata
///
/// Insertion order is preserved. Keys compare case-insensitively; a repeated key replaces
/// the earlier value in its original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    /// Empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Pairs as stored
    pub fn as_slice(&self) -> &[(String, String)] {
        &self.0
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no keys
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// A listed game server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Identity
    pub key: ServerKey,
    /// Game name
    pub game: String,
    /// Reported rules and status
    pub metadata: Metadata,
    /// When the last accepted heartbeat arrived
    pub last_heartbeat: Instant,
    /// Whether the server passed the challenge step
    pub validated: bool,
}

impl Server {
    /// A server seen at `now`
    pub fn new(key: ServerKey, game: impl Into<String>, metadata: Metadata, now: Instant) -> Self {
        Self {
            key,
            game: game.into(),
            metadata,
            last_heartbeat: now,
            validated: false,
        }
    }

    /// Mark the server as having passed the challenge step
    pub fn validated(mut self, validated: bool) -> Self {
        self.validated = validated;
        self
    }

    /// Wire form used in server lists
    pub fn to_record(&self) -> ServerRecord {
        ServerRecord {
            address: self.key.address.to_string(),
            port: self.key.port,
            metadata: self.metadata.as_slice().to_vec(),
        }
    }
}

/// Lifecycle of a registry entry as derived from the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Within its heartbeat deadline
    Registered,
    /// Past its deadline, hidden from queries, awaiting removal
    Stale,
    /// Past the grace period; the next sweep deletes it
    Removed,
}

/// Registry bookkeeping around a [`Server`]
#[derive(Debug, Clone)]
pub struct ServerListEntry {
    /// Current server value
    pub server: Arc<Server>,
    /// First accepted heartbeat
    pub registered_at: Instant,
    /// Deadline for the next heartbeat
    pub expires_at: Instant,
}

impl ServerListEntry {
    /// State at `now` given the stale grace period
    pub fn state_at(&self, now: Instant, grace: Duration) -> EntryState {
        if now < self.expires_at {
            EntryState::Registered
        } else if now < self.expires_at + grace {
            EntryState::Stale
        } else {
            EntryState::Removed
        }
    }
}

/// Result of [`ServerRegistry::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new entry was added
    Created,
    /// An existing entry was replaced and its deadline extended
    Refreshed,
}

/// Result of [`ServerRegistry::sweep`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries left in place but hidden from queries
    pub stale: usize,
    /// Entries deleted
    pub removed: usize,
}

/// Read-time query filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    /// Required game name
    pub game: Option<String>,
    /// Required metadata values
    pub rules: Vec<(String, String)>,
}

impl ServerFilter {
    /// A filter that matches every server
    pub fn any() -> Self {
        Self::default()
    }

    /// Build a filter from query key/value pairs
    ///
    /// `game` (or `gamename`) selects the game; every other pair must equal a metadata
    /// value. Empty values are ignored.
    pub fn from_key_values(pairs: &[(String, String)]) -> Self {
        let mut filter = Self::any();
        for (key, value) in pairs {
            if value.is_empty() {
                continue;
            }
            if key.eq_ignore_ascii_case("game") || key.eq_ignore_ascii_case("gamename") {
                filter.game = Some(value.clone());
            } else {
                filter.rules.push((key.clone(), value.clone()));
            }
        }
        filter
    }

    /// Require a game name
    pub fn with_game(mut self, game: impl Into<String>) -> Self {
        self.game = Some(game.into());
        self
    }

    /// Require a metadata value
    pub fn with_rule(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.rules.push((key.into(), value.into()));
        self
    }

    /// Whether `server` passes the filter
    pub fn matches(&self, server: &Server) -> bool {
        if self
            .game
            .as_ref()
            .is_some_and(|game| !game.eq_ignore_ascii_case(&server.game))
        {
            return false;
        }
        self.rules.iter().all(|(key, value)| {
            server
                .metadata
                .get(key)
                .is_some_and(|actual| actual.eq_ignore_ascii_case(value))
        })
    }
}

/// Concurrent table of live servers
///
/// Readers take a shared lock and writers an exclusive one, so snapshots run in parallel
/// and never see a key twice or miss one mid-update.
#[derive(Debug)]
pub struct ServerRegistry {
    entries: RwLock<BTreeMap<ServerKey, ServerListEntry>>,
    ttl: Duration,
    grace: Duration,
}

impl ServerRegistry {
    /// Registry whose entries go stale `ttl` after their last heartbeat and are removed
    /// `grace` later
    pub fn new(ttl: Duration, grace: Duration) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            ttl,
            grace,
        }
    }

    /// Registry timed by a heartbeat policy
    pub fn from_policy(policy: &HeartbeatPolicy) -> Self {
        Self::new(policy.timeout(), policy.stale_grace)
    }

    /// Time an entry lives without a heartbeat
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace a server, extending its deadline
    pub fn upsert(&self, server: Server) -> UpsertOutcome {
        self.upsert_at(server, Instant::now())
    }

    /// [`upsert`](Self::upsert) with an explicit clock
    ///
    /// A refreshed entry keeps its registration time and its validated flag.
    pub fn upsert_at(&self, mut server: Server, now: Instant) -> UpsertOutcome {
        let expires_at = now + self.ttl;
        let mut entries = self.entries.write();
        match entries.get_mut(&server.key) {
            Some(entry) => {
                server.validated |= entry.server.validated;
                entry.server = Arc::new(server);
                entry.expires_at = expires_at;
                UpsertOutcome::Refreshed
            }
            None => {
                let key = server.key;
                entries.insert(
                    key,
                    ServerListEntry {
                        server: Arc::new(server),
                        registered_at: now,
                        expires_at,
                    },
                );
                gauge!("umaster.registry.servers").set(entries.len() as f64);
                UpsertOutcome::Created
            }
        }
    }

    /// Delete a server
    pub fn remove(&self, key: &ServerKey) -> Option<Arc<Server>> {
        let mut entries = self.entries.write();
        let removed = entries.remove(key).map(|entry| entry.server);
        gauge!("umaster.registry.servers").set(entries.len() as f64);
        removed
    }

    /// Delete every server at `address`; returns how many were removed
    pub fn remove_address(&self, address: IpAddr) -> usize {
        let address = canonical_ip(address);
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| key.address != address);
        gauge!("umaster.registry.servers").set(entries.len() as f64);
        before - entries.len()
    }

    /// Current value of a server, whatever its state
    pub fn get(&self, key: &ServerKey) -> Option<Arc<Server>> {
        self.entries.read().get(key).map(|entry| entry.server.clone())
    }

    /// Whether the table holds `key`, stale or not
    pub fn contains(&self, key: &ServerKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// State of `key`, `None` when absent
    pub fn state_of(&self, key: &ServerKey) -> Option<EntryState> {
        self.state_of_at(key, Instant::now())
    }

    /// [`state_of`](Self::state_of) with an explicit clock
    pub fn state_of_at(&self, key: &ServerKey, now: Instant) -> Option<EntryState> {
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.state_at(now, self.grace))
    }

    /// Registered servers passing `filter`, ordered by key
    pub fn snapshot(&self, filter: &ServerFilter) -> Vec<Arc<Server>> {
        self.snapshot_at(filter, Instant::now())
    }

    /// [`snapshot`](Self::snapshot) with an explicit clock
    pub fn snapshot_at(&self, filter: &ServerFilter, now: Instant) -> Vec<Arc<Server>> {
        let mut out = Vec::new();
        self.snapshot_into(filter, now, |_| false, &mut out);
        out
    }

    /// Fill `out` with registered servers passing `filter` and not rejected by `exclude`
    ///
    /// `out` is cleared first, so one buffer can serve many queries. The whole scan runs
    /// under a single read lock.
    pub fn snapshot_into<F>(
        &self,
        filter: &ServerFilter,
        now: Instant,
        exclude: F,
        out: &mut Vec<Arc<Server>>,
    ) where
        F: Fn(&Server) -> bool,
    {
        out.clear();
        let entries = self.entries.read();
        out.extend(
            entries
                .values()
                .filter(|entry| entry.state_at(now, self.grace) == EntryState::Registered)
                .filter(|entry| filter.matches(&entry.server) && !exclude(&entry.server))
                .map(|entry| entry.server.clone()),
        );
    }

    /// Delete entries past their grace period
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) with an explicit clock
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut entries = self.entries.write();
        entries.retain(|key, entry| match entry.state_at(now, self.grace) {
            EntryState::Registered => true,
            EntryState::Stale => {
                report.stale += 1;
                true
            }
            EntryState::Removed => {
                tracing::debug!(server = %key, "Evicting server");
                report.removed += 1;
                false
            }
        });
        gauge!("umaster.registry.servers").set(entries.len() as f64);
        report
    }

    /// Number of entries, stale ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
