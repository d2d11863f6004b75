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

//! Query handler
//!
//! Answers server list requests. A response that does not fit the transport's payload
//! limit is split into [`ServerList`] fragments stamped with `sequence` and `total`; the
//! client reassembles them and the master never retransmits.

use crate::ban::BanGate;
use crate::registry::{Server, ServerFilter, ServerRegistry};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use umaster_codec::{Message, SERVER_LIST_HEADER_LEN, ServerList, ServerRecord};

/// Split `records` into server list fragments no larger than `max_payload` bytes
///
/// Records are packed greedily in order. A record too large for any fragment is sent in
/// one of its own. An empty input still yields one empty fragment so the client learns
/// there is nothing to list.
pub fn fragment(records: Vec<ServerRecord>, max_payload: usize) -> Vec<Message> {
    let budget = max_payload.saturating_sub(SERVER_LIST_HEADER_LEN);
    let mut fragments: Vec<Vec<ServerRecord>> = Vec::new();
    let mut current: Vec<ServerRecord> = Vec::new();
    let mut used = 0;

    for record in records {
        let len = record.encoded_len();
        if !current.is_empty() && used + len > budget {
            fragments.push(std::mem::take(&mut current));
            used = 0;
        }
        used += len;
        current.push(record);
    }
    if !current.is_empty() || fragments.is_empty() {
        fragments.push(current);
    }

    let limit = usize::from(u16::MAX);
    if fragments.len() > limit {
        let dropped: usize = fragments[limit..].iter().map(Vec::len).sum();
        tracing::warn!(
            fragments = fragments.len(),
            dropped,
            "Server list exceeds the fragment limit, truncating"
        );
        counter!("umaster.query.truncated_records").increment(dropped as u64);
        fragments.truncate(limit);
    }

    let total = u16::try_from(fragments.len()).unwrap_or(u16::MAX);
    fragments
        .into_iter()
        .enumerate()
        .map(|(sequence, servers)| {
            Message::ServerList(ServerList {
                sequence: u16::try_from(sequence).unwrap_or(u16::MAX),
                total,
                servers,
            })
        })
        .collect()
}

/// Builds query responses from registry snapshots
#[derive(Debug)]
pub struct QueryHandler {
    registry: Arc<ServerRegistry>,
    bans: Arc<BanGate>,
    buffers: Mutex<Vec<Vec<Arc<Server>>>>,
}

impl QueryHandler {
    /// Create a handler over a registry and ban gate
    pub fn new(registry: Arc<ServerRegistry>, bans: Arc<BanGate>) -> Self {
        Self {
            registry,
            bans,
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Answer a query with fragments no larger than `max_payload`
    pub fn respond(&self, filters: &[(String, String)], max_payload: usize) -> Vec<Message> {
        self.respond_at(filters, max_payload, Instant::now())
    }

    /// Answer a query for a stream transport whose frames are capped at `max_payload`
    ///
    /// Unlike [`respond`](Self::respond), a server whose record alone would overflow a
    /// frame is left out instead of being sent in a fragment the framer cannot carry.
    pub fn respond_stream(&self, filters: &[(String, String)], max_payload: usize) -> Vec<Message> {
        self.answer(filters, max_payload, Instant::now(), true)
    }

    /// [`respond`](Self::respond) with an explicit clock
    ///
    /// Servers at banned addresses are left out even while their listing is live.
    pub fn respond_at(
        &self,
        filters: &[(String, String)],
        max_payload: usize,
        now: Instant,
    ) -> Vec<Message> {
        self.answer(filters, max_payload, now, false)
    }

    fn answer(
        &self,
        filters: &[(String, String)],
        max_payload: usize,
        now: Instant,
        skip_oversized: bool,
    ) -> Vec<Message> {
        let start = Instant::now();
        let filter = ServerFilter::from_key_values(filters);

        let mut buffer = self.buffers.lock().pop().unwrap_or_default();
        self.registry.snapshot_into(
            &filter,
            now,
            |server| self.bans.is_banned_at(server.key.address, now),
            &mut buffer,
        );
        let mut records: Vec<ServerRecord> =
            buffer.iter().map(|server| server.to_record()).collect();
        if skip_oversized {
            records.retain(|record| {
                let fits = SERVER_LIST_HEADER_LEN + record.encoded_len() <= max_payload;
                if !fits {
                    tracing::trace!(
                        address = %record.address,
                        port = record.port,
                        "Server record exceeds the frame limit, skipping"
                    );
                }
                fits
            });
        }
        let listed = records.len();
        buffer.clear();
        self.buffers.lock().push(buffer);

        let fragments = fragment(records, max_payload);
        tracing::debug!(
            servers = listed,
            fragments = fragments.len(),
            "Answering query"
        );
        counter!("umaster.queries").increment(1);
        histogram!("umaster.query.duration").record(start.elapsed().as_secs_f64());
        fragments
    }
}
