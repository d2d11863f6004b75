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

//! IP ban gate
//!
//! An in-memory deny-list consulted before a connection is accepted, before a datagram is
//! processed and before a heartbeat registers a server. Matching is by exact address.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A single ban
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    /// Banned address
    pub address: IpAddr,
    /// Operator supplied reason
    pub reason: Option<String>,
    /// When the ban was placed
    pub created_at: Instant,
    /// When the ban lapses; `None` is permanent
    pub expires_at: Option<Instant>,
}

impl BanEntry {
    /// Whether the ban has lapsed at `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expiry| now >= expiry)
    }

    /// Time left before the ban lapses, `None` for permanent bans
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|expiry| expiry.saturating_duration_since(now))
    }
}

/// Concurrent address deny-list
#[derive(Debug, Default)]
pub struct BanGate {
    entries: DashMap<IpAddr, BanEntry>,
}

/// IPv4-mapped IPv6 addresses compare equal to their IPv4 form.
pub(crate) fn canonical_ip(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}

impl BanGate {
    /// Create an empty gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `address` for `ttl`, or permanently when `ttl` is `None`
    ///
    /// Returns `true` when the address was not banned before. Banning an address again
    /// replaces its expiry and reason. A `ttl` reaching past the clock's range bans
    /// permanently.
    pub fn ban(&self, address: IpAddr, ttl: Option<Duration>, reason: Option<String>) -> bool {
        self.ban_at(address, ttl, reason, Instant::now())
    }

    /// [`ban`](Self::ban) with an explicit clock
    pub fn ban_at(
        &self,
        address: IpAddr,
        ttl: Option<Duration>,
        reason: Option<String>,
        now: Instant,
    ) -> bool {
        let address = canonical_ip(address);
        let entry = BanEntry {
            address,
            reason,
            created_at: now,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        };
        let previous = self.entries.insert(address, entry);
        tracing::info!(%address, ?ttl, "Address banned");
        previous.is_none_or(|previous| previous.is_expired_at(now))
    }

    /// Lift the ban on `address`; returns whether a live ban was removed
    pub fn unban(&self, address: IpAddr) -> bool {
        let now = Instant::now();
        match self.entries.remove(&canonical_ip(address)) {
            Some((address, entry)) => {
                tracing::info!(%address, "Address unbanned");
                !entry.is_expired_at(now)
            }
            None => false,
        }
    }

    /// Whether `address` is currently banned
    pub fn is_banned(&self, address: IpAddr) -> bool {
        self.is_banned_at(address, Instant::now())
    }

    /// [`is_banned`](Self::is_banned) with an explicit clock
    ///
    /// An expired entry counts as absent and is removed on the way out.
    pub fn is_banned_at(&self, address: IpAddr, now: Instant) -> bool {
        let address = canonical_ip(address);
        let expired = match self.entries.get(&address) {
            None => return false,
            Some(entry) => entry.is_expired_at(now),
        };
        if expired {
            self.entries
                .remove_if(&address, |_, entry| entry.is_expired_at(now));
            return false;
        }
        true
    }

    /// The live ban on `address`, if any
    pub fn get(&self, address: IpAddr) -> Option<BanEntry> {
        let now = Instant::now();
        self.entries
            .get(&canonical_ip(address))
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.clone())
    }

    /// Every live ban, ordered by address
    pub fn entries(&self) -> Vec<BanEntry> {
        let now = Instant::now();
        let mut entries: Vec<BanEntry> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|entry| entry.address);
        entries
    }

    /// Drop lapsed bans; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// [`purge_expired`](Self::purge_expired) with an explicit clock
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, lapsed ones not yet purged included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the gate holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
