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

//! Lock-free metrics for the master server

use crate::validation::ValidationState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free server metrics
///
/// All metrics are stored as atomics and can be accessed concurrently
/// without locks. Use the `snapshot()` method to get a view of all
/// metrics at a point in time.
#[derive(Debug)]
pub struct ServerMetrics {
    // Connection counts
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    refused_connections: AtomicU64,

    // Throughput
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_received: AtomicU64,
    datagrams_dropped: AtomicU64,

    // Work
    heartbeats: AtomicU64,
    queries: AtomicU64,
    validations_accepted: AtomicU64,
    validations_rejected: AtomicU64,
    validations_timed_out: AtomicU64,

    // Errors
    format_errors: AtomicU64,
    protocol_errors: AtomicU64,
    transport_errors: AtomicU64,
    ban_rejections: AtomicU64,

    // Timing (stored as nanoseconds)
    total_connection_duration_ns: AtomicU64,

    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            refused_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            validations_accepted: AtomicU64::new(0),
            validations_rejected: AtomicU64::new(0),
            validations_timed_out: AtomicU64::new(0),
            format_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            ban_rejections: AtomicU64::new(0),
            total_connection_duration_ns: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Connection tracking

    /// Record a new connection being opened
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection being closed
    pub fn connection_closed(&self, duration: Duration) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.total_connection_duration_ns.fetch_add(
            u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Record a connection refused at accept time
    pub fn connection_refused(&self) {
        self.refused_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current number of active connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get the total number of connections since server start
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    // Throughput tracking

    /// Record bytes sent
    pub fn bytes_sent(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Record bytes received
    pub fn bytes_received(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a datagram received
    pub fn datagram_received(&self, len: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received(len as u64);
    }

    /// Record a datagram dropped because its worker queue was full
    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Work tracking

    /// Record an accepted heartbeat
    pub fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an answered query
    pub fn query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resolved validation
    pub fn validation(&self, state: ValidationState) {
        let counter = match state {
            ValidationState::Accepted => &self.validations_accepted,
            ValidationState::Rejected => &self.validations_rejected,
            ValidationState::TimedOut => &self.validations_timed_out,
            ValidationState::Pending | ValidationState::InProgress(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking

    /// Record a malformed packet
    pub fn format_error(&self) {
        self.format_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transport error
    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record traffic rejected by the ban gate
    pub fn ban_rejection(&self) {
        self.ban_rejections.fetch_add(1, Ordering::Relaxed);
    }

    // Snapshot

    /// Get a snapshot of all metrics
    ///
    /// Counters are read one at a time, so a snapshot taken under load may
    /// mix values from slightly different instants.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            refused_connections: self.refused_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            validations_accepted: self.validations_accepted.load(Ordering::Relaxed),
            validations_rejected: self.validations_rejected.load(Ordering::Relaxed),
            validations_timed_out: self.validations_timed_out.load(Ordering::Relaxed),
            format_errors: self.format_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            ban_rejections: self.ban_rejections.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_connection_duration: self.average_connection_duration(),
        }
    }

    fn average_connection_duration(&self) -> Duration {
        let total = self.total_connections.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_connection_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / total)
    }
}

/// A snapshot of server metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total connections since server start
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Connections refused at the cap
    pub refused_connections: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Datagrams received
    pub datagrams_received: u64,
    /// Datagrams dropped on full worker queues
    pub datagrams_dropped: u64,
    /// Accepted heartbeats
    pub heartbeats: u64,
    /// Answered queries
    pub queries: u64,
    /// Validations resolved as accepted
    pub validations_accepted: u64,
    /// Validations resolved as rejected
    pub validations_rejected: u64,
    /// Validations resolved by timeout
    pub validations_timed_out: u64,
    /// Malformed packets
    pub format_errors: u64,
    /// Protocol errors
    pub protocol_errors: u64,
    /// Transport errors
    pub transport_errors: u64,
    /// Traffic rejected by the ban gate
    pub ban_rejections: u64,
    /// Server uptime
    pub uptime: Duration,
    /// Average connection duration
    pub avg_connection_duration: Duration,
}

impl MetricsSnapshot {
    /// Calculate datagrams per second
    pub fn datagrams_per_sec(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.datagrams_received as f64 / self.uptime.as_secs_f64()
    }

    /// Total resolved validations
    pub fn total_validations(&self) -> u64 {
        self.validations_accepted + self.validations_rejected + self.validations_timed_out
    }

    /// Calculate total error count
    pub fn total_errors(&self) -> u64 {
        self.format_errors + self.protocol_errors + self.transport_errors
    }

    /// Calculate error rate (errors per second)
    pub fn error_rate(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.total_errors() as f64 / self.uptime.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections(), 2);
        assert_eq!(metrics.total_connections(), 2);

        metrics.connection_closed(Duration::from_secs(10));
        assert_eq!(metrics.active_connections(), 1);
        assert_eq!(metrics.total_connections(), 2);

        metrics.connection_refused();
        assert_eq!(metrics.snapshot().refused_connections, 1);
    }

    #[test]
    fn test_validation_tracking() {
        let metrics = ServerMetrics::new();

        metrics.validation(ValidationState::Accepted);
        metrics.validation(ValidationState::TimedOut);
        metrics.validation(ValidationState::InProgress(0));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.validations_accepted, 1);
        assert_eq!(snapshot.validations_timed_out, 1);
        assert_eq!(snapshot.total_validations(), 2);
    }

    #[test]
    fn test_error_tracking() {
        let metrics = ServerMetrics::new();

        metrics.format_error();
        metrics.protocol_error();
        metrics.transport_error();
        metrics.ban_rejection();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_errors(), 3);
        assert_eq!(snapshot.ban_rejections, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = std::sync::Arc::new(ServerMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let metrics = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    metrics.datagram_received(10);
                    metrics.heartbeat();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.datagrams_received, 1000);
        assert_eq!(snapshot.bytes_received, 10000);
        assert_eq!(snapshot.heartbeats, 1000);
    }
}
