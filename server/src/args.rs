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

//! Command line arguments

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use umaster_service::{
    DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, DefaultPolicy, HeartbeatPolicy, ListenerConfig,
    MasterConfig, MasterError, ModuleSet, NullValidator, PassthroughValidator, Result,
    TracingLogWriter, UpstreamConfig, ValidationConfig,
};

/// Key validation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ValidatorKind {
    /// No validator; every key gets the default policy
    None,
    /// Accept every key
    Null,
    /// Relay keys to an upstream master
    Passthrough,
}

/// Verdict for keys nobody could classify in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Let the player in
    Accept,
    /// Keep the player out
    Reject,
}

impl From<PolicyArg> for DefaultPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::Accept => DefaultPolicy::Accept,
            PolicyArg::Reject => DefaultPolicy::Reject,
        }
    }
}

/// Game master server
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// TCP address for queries and key validation; repeatable
    #[arg(long, default_values_t = [SocketAddr::from(([0, 0, 0, 0], DEFAULT_TCP_PORT))])]
    pub tcp: Vec<SocketAddr>,

    /// UDP address for heartbeats and queries; repeatable
    #[arg(long, default_values_t = [SocketAddr::from(([0, 0, 0, 0], DEFAULT_UDP_PORT))])]
    pub udp: Vec<SocketAddr>,

    /// Maximum concurrent TCP connections
    #[arg(long, default_value_t = 1000)]
    pub max_connections: usize,

    /// Seconds between heartbeats game servers are asked for
    #[arg(long, default_value_t = 60)]
    pub heartbeat_interval: u64,

    /// Challenge new servers before listing them
    #[arg(long)]
    pub require_challenge: bool,

    /// Key validation strategy
    #[arg(long, value_enum, default_value_t = ValidatorKind::Null)]
    pub validator: ValidatorKind,

    /// Upstream master for the passthrough validator
    #[arg(long, required_if_eq("validator", "passthrough"))]
    pub upstream: Option<SocketAddr>,

    /// Seconds a validation may take before the default policy applies
    #[arg(long, default_value_t = 5)]
    pub deadline: u64,

    /// Verdict applied when validation times out
    #[arg(long, value_enum, default_value_t = PolicyArg::Reject)]
    pub default_policy: PolicyArg,

    /// Write every request to the log
    #[arg(long)]
    pub log_requests: bool,
}

impl Args {
    /// Server configuration described by the arguments
    pub fn config(&self) -> MasterConfig {
        let listeners = self
            .tcp
            .iter()
            .copied()
            .map(ListenerConfig::tcp)
            .chain(self.udp.iter().copied().map(ListenerConfig::udp))
            .collect();
        MasterConfig::new(listeners)
            .with_max_connections(self.max_connections)
            .with_heartbeat(
                HeartbeatPolicy::default()
                    .with_interval(Duration::from_secs(self.heartbeat_interval))
                    .with_require_challenge(self.require_challenge),
            )
            .with_validation(
                ValidationConfig::default()
                    .with_deadline(Duration::from_secs(self.deadline))
                    .with_default_policy(self.default_policy.into()),
            )
    }

    /// Modules described by the arguments
    pub fn modules(&self) -> Result<ModuleSet> {
        let mut modules = ModuleSet::new();
        match self.validator {
            ValidatorKind::None => {}
            ValidatorKind::Null => {
                modules = modules.with_validator(Arc::new(NullValidator::new()));
            }
            ValidatorKind::Passthrough => {
                let upstream = self.upstream.ok_or_else(|| {
                    MasterError::Config("the passthrough validator needs --upstream".to_string())
                })?;
                modules = modules
                    .with_validator(Arc::new(PassthroughValidator::new(UpstreamConfig::new(upstream))));
            }
        }
        if self.log_requests {
            modules = modules.with_log_writer(Arc::new(TracingLogWriter::new()));
        }
        Ok(modules)
    }
}
