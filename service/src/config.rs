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

//! Master server configuration types and builders
//!
//! Configuration is plain data passed into [`MasterServer::new`](crate::MasterServer::new);
//! nothing is read from files or the environment.
//!
//! # Examples
//!
//! ```
//! use umaster_service::{DefaultPolicy, HeartbeatPolicy, MasterConfig, ValidationConfig};
//! use std::time::Duration;
//!
//! let config = MasterConfig::default()
//!     .with_max_connections(500)
//!     .with_heartbeat(HeartbeatPolicy::default().with_require_challenge(true))
//!     .with_validation(
//!         ValidationConfig::default()
//!             .with_deadline(Duration::from_secs(2))
//!             .with_default_policy(DefaultPolicy::Accept),
//!     );
//! assert!(config.validate().is_ok());
//! ```

use crate::types::Transport;
use crate::validation::Verdict;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use umaster_codec::MAX_FRAME_LEN;

/// Default TCP port for queries and key validation
pub const DEFAULT_TCP_PORT: u16 = 28900;

/// Default UDP port for heartbeats
pub const DEFAULT_UDP_PORT: u16 = 27900;

/// Datagram payload size that avoids IP fragmentation on common paths
pub const DEFAULT_UDP_PAYLOAD: usize = 1200;

/// One listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Transport to listen on
    pub transport: Transport,
    /// Address to bind
    pub bind_address: SocketAddr,
}

impl ListenerConfig {
    /// A TCP listener on `bind_address`
    pub fn tcp(bind_address: SocketAddr) -> Self {
        Self {
            transport: Transport::Tcp,
            bind_address,
        }
    }

    /// A UDP listener on `bind_address`
    pub fn udp(bind_address: SocketAddr) -> Self {
        Self {
            transport: Transport::Udp,
            bind_address,
        }
    }
}

/// Verdict applied when validation times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultPolicy {
    /// Let the player in
    Accept,
    /// Keep the player out
    #[default]
    Reject,
}

impl DefaultPolicy {
    /// The verdict this policy yields
    pub fn verdict(self) -> Verdict {
        match self {
            DefaultPolicy::Accept => Verdict::Accepted,
            DefaultPolicy::Reject => Verdict::Rejected,
        }
    }
}

/// Registration lifecycle timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Interval game servers are told to heartbeat at
    pub interval: Duration,
    /// Missed intervals before an entry goes stale
    pub timeout_multiplier: u32,
    /// Time a stale entry lingers before removal
    pub stale_grace: Duration,
    /// Period of the background sweep
    pub sweep_interval: Duration,
    /// Whether first heartbeats must echo a challenge nonce
    pub require_challenge: bool,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout_multiplier: 3,
            stale_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            require_challenge: false,
        }
    }
}

impl HeartbeatPolicy {
    /// Time without an accepted heartbeat after which an entry is stale
    pub fn timeout(&self) -> Duration {
        self.interval.saturating_mul(self.timeout_multiplier)
    }

    /// Interval in whole seconds as sent in heartbeat acknowledgements
    pub fn interval_secs(&self) -> u16 {
        u16::try_from(self.interval.as_secs()).unwrap_or(u16::MAX)
    }

    /// Set the heartbeat interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the number of missed intervals tolerated
    pub fn with_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// Set the stale grace period
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    /// Set the sweep period
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Require or skip the challenge step for new servers
    pub fn with_require_challenge(mut self, required: bool) -> Self {
        self.require_challenge = required;
        self
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("heartbeat interval must be greater than 0".to_string());
        }
        if self.timeout_multiplier == 0 {
            return Err("heartbeat timeout_multiplier must be greater than 0".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// CD-key validation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    /// Time the validator chain gets before the request times out
    pub deadline: Duration,
    /// Verdict applied on timeout
    pub default_policy: DefaultPolicy,
    /// How long a resolved verdict is kept for late duplicates
    pub linger: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5),
            default_policy: DefaultPolicy::Reject,
            linger: Duration::from_secs(30),
        }
    }
}

impl ValidationConfig {
    /// Set the deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the default policy
    pub fn with_default_policy(mut self, policy: DefaultPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Set how long resolved verdicts are kept
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.deadline.is_zero() {
            return Err("validation deadline must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Upstream authority for the passthrough validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Address of the upstream master
    pub address: SocketAddr,
    /// Time to wait for each attempt
    pub attempt_timeout: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl UpstreamConfig {
    /// Relay to `address` with default retry settings
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            attempt_timeout: Duration::from_secs(1),
            max_attempts: 4,
        }
    }

    /// Set the per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set the number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.attempt_timeout.is_zero() {
            return Err("upstream attempt_timeout must be greater than 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("upstream max_attempts must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Master server configuration
///
/// Use the builder methods to customize the defaults.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Sockets to listen on; a failed bind skips only that listener
    pub listeners: Vec<ListenerConfig>,

    /// Maximum number of concurrent TCP connections
    pub max_connections: usize,

    /// Connections with no activity for this long are closed
    pub idle_timeout: Duration,

    /// Maximum wait for the next frame on a TCP connection
    pub read_timeout: Duration,

    /// Maximum time for a single frame write
    pub write_timeout: Duration,

    /// Time connections get to close before they are aborted on shutdown
    pub shutdown_timeout: Duration,

    /// Largest accepted TCP frame body
    pub max_frame_len: usize,

    /// Largest UDP reply payload; query responses are fragmented to fit
    pub udp_max_payload: usize,

    /// Number of UDP worker tasks
    pub udp_workers: usize,

    /// Queue depth per UDP worker; datagrams beyond it are dropped
    pub udp_queue_depth: usize,

    /// Request records buffered for log writers before dropping
    pub log_queue_depth: usize,

    /// Registration lifecycle timing
    pub heartbeat: HeartbeatPolicy,

    /// CD-key validation settings
    pub validation: ValidationConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            listeners: vec![
                ListenerConfig::tcp(SocketAddr::new(any, DEFAULT_TCP_PORT)),
                ListenerConfig::udp(SocketAddr::new(any, DEFAULT_UDP_PORT)),
            ],
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            max_frame_len: MAX_FRAME_LEN,
            udp_max_payload: DEFAULT_UDP_PAYLOAD,
            udp_workers: 4,
            udp_queue_depth: 1024,
            log_queue_depth: 4096,
            heartbeat: HeartbeatPolicy::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Create a configuration listening on `listeners`
    ///
    /// All other settings will use their default values.
    pub fn new(listeners: Vec<ListenerConfig>) -> Self {
        Self {
            listeners,
            ..Default::default()
        }
    }

    /// Listen on a TCP and a UDP port of the loopback interface, chosen by the OS
    pub fn loopback() -> Self {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        Self::new(vec![ListenerConfig::tcp(local), ListenerConfig::udp(local)])
    }

    /// Add a listener
    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the idle timeout duration
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the read timeout duration
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout duration
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the shutdown timeout duration
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the largest accepted TCP frame
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Set the UDP reply payload limit
    pub fn with_udp_max_payload(mut self, len: usize) -> Self {
        self.udp_max_payload = len;
        self
    }

    /// Set the UDP worker pool size and queue depth
    pub fn with_udp_workers(mut self, workers: usize, queue_depth: usize) -> Self {
        self.udp_workers = workers;
        self.udp_queue_depth = queue_depth;
        self
    }

    /// Set the log queue depth
    pub fn with_log_queue_depth(mut self, depth: usize) -> Self {
        self.log_queue_depth = depth;
        self
    }

    /// Set the heartbeat policy
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatPolicy) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the validation settings
    pub fn with_validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.listeners.is_empty() {
            return Err("at least one listener must be configured".to_string());
        }

        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }

        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be greater than 0".to_string());
        }

        if self.read_timeout.is_zero() {
            return Err("read_timeout must be greater than 0".to_string());
        }

        if self.write_timeout.is_zero() {
            return Err("write_timeout must be greater than 0".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }

        if self.max_frame_len == 0 || self.max_frame_len > MAX_FRAME_LEN {
            return Err(format!("max_frame_len must be between 1 and {MAX_FRAME_LEN}"));
        }

        if self.udp_max_payload < umaster_codec::SERVER_LIST_HEADER_LEN + 16 {
            return Err("udp_max_payload is too small to carry a server list".to_string());
        }

        if self.udp_workers == 0 || self.udp_queue_depth == 0 {
            return Err("udp_workers and udp_queue_depth must be greater than 0".to_string());
        }

        if self.log_queue_depth == 0 {
            return Err("log_queue_depth must be greater than 0".to_string());
        }

        self.heartbeat.validate()?;
        self.validation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MasterConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].bind_address.port(), DEFAULT_TCP_PORT);
        assert_eq!(config.listeners[1].transport, Transport::Udp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = MasterConfig::loopback()
            .with_max_connections(2)
            .with_udp_workers(2, 16)
            .with_heartbeat(HeartbeatPolicy::default().with_interval(Duration::from_secs(30)));

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.udp_workers, 2);
        assert_eq!(config.heartbeat.timeout(), Duration::from_secs(90));
        assert_eq!(config.heartbeat.interval_secs(), 30);
    }

    #[test]
    fn test_validation() {
        let mut config = MasterConfig::default();
        assert!(config.validate().is_ok());

        config.max_connections = 0;
        assert!(config.validate().is_err());

        config.max_connections = 10;
        config.heartbeat.timeout_multiplier = 0;
        assert!(config.validate().is_err());

        config.heartbeat.timeout_multiplier = 3;
        config.validation.deadline = Duration::ZERO;
        assert!(config.validate().is_err());

        config.validation.deadline = Duration::from_secs(1);
        config.listeners.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(DefaultPolicy::default(), DefaultPolicy::Reject);
        assert_eq!(DefaultPolicy::Accept.verdict(), Verdict::Accepted);
    }

    #[test]
    fn test_upstream_config() {
        let upstream = UpstreamConfig::new("127.0.0.1:28900".parse().unwrap());
        assert_eq!(upstream.max_attempts, 4);
        assert!(upstream.validate().is_ok());
        assert!(upstream.with_max_attempts(0).validate().is_err());
    }
}
