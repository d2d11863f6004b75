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

//! Operator commands
//!
//! Commands arrive as text lines, typically from the console. The [`CommandRegistry`]
//! parses a line and offers it to each [`CommandListener`] in registration order; the
//! first listener that recognises the name answers. Commands run synchronously and are
//! idempotent.

use crate::ban::BanGate;
use crate::manager::ConnectionManager;
use crate::metrics::ServerMetrics;
use crate::registry::{ServerFilter, ServerKey, ServerRegistry};
use parking_lot::RwLock;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Lowercased command name
    pub name: String,
    /// Remaining words
    pub args: Vec<String>,
    /// The line as typed, trimmed
    pub line: String,
}

impl Command {
    /// Parse a line; blank lines and `#` comments yield `None`
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut words = line.split_whitespace();
        let name = words.next()?.to_ascii_lowercase();
        Some(Command {
            name,
            args: words.map(str::to_string).collect(),
            line: line.to_string(),
        })
    }

    /// Argument at `index`
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Answer to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    /// Ran; lines to show the operator
    Done(Vec<String>),
    /// Did not run
    Failed(String),
}

impl CommandResponse {
    fn line(text: impl Into<String>) -> Self {
        CommandResponse::Done(vec![text.into()])
    }

    fn usage(usage: &str) -> Self {
        CommandResponse::Failed(format!("usage: {usage}"))
    }

    /// Whether the command ran
    pub fn is_done(&self) -> bool {
        matches!(self, CommandResponse::Done(_))
    }
}

impl fmt::Display for CommandResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResponse::Done(lines) => f.write_str(&lines.join("\n")),
            CommandResponse::Failed(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Something that serves operator commands
pub trait CommandListener: Send + Sync + 'static {
    /// Run `command`, or `None` when the name is not this listener's
    fn execute(&self, command: &Command) -> Option<CommandResponse>;

    /// One line per command served
    fn help(&self) -> Vec<String>;
}

/// Routes command lines to listeners
#[derive(Default)]
pub struct CommandRegistry {
    listeners: RwLock<Vec<Arc<dyn CommandListener>>>,
}

impl CommandRegistry {
    /// Registry with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener after the existing ones
    pub fn register(&self, listener: Arc<dyn CommandListener>) {
        self.listeners.write().push(listener);
    }

    /// Run a parsed command
    pub fn execute(&self, command: &Command) -> CommandResponse {
        let listeners = self.listeners.read().clone();
        if command.name == "help" {
            let mut lines = vec!["help".to_string()];
            lines.extend(listeners.iter().flat_map(|listener| listener.help()));
            return CommandResponse::Done(lines);
        }
        listeners
            .iter()
            .find_map(|listener| listener.execute(command))
            .unwrap_or_else(|| {
                CommandResponse::Failed(format!("unknown command '{}', try 'help'", command.name))
            })
    }

    /// Parse and run a line; `None` for blank lines and comments
    pub fn execute_line(&self, line: &str) -> Option<CommandResponse> {
        let command = Command::parse(line)?;
        let response = self.execute(&command);
        info!(command = %command.line, done = response.is_done(), "Operator command");
        Some(response)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

/// Built-in administration commands
#[derive(Debug)]
pub struct AdminCommands {
    bans: Arc<BanGate>,
    registry: Arc<ServerRegistry>,
    metrics: Arc<ServerMetrics>,
    connections: Option<Arc<ConnectionManager>>,
}

impl AdminCommands {
    /// Commands over the given server state
    pub fn new(bans: Arc<BanGate>, registry: Arc<ServerRegistry>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            bans,
            registry,
            metrics,
            connections: None,
        }
    }

    /// Also close open connections of banned addresses
    pub fn with_connections(mut self, connections: Arc<ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    fn ban(&self, command: &Command) -> CommandResponse {
        const USAGE: &str = "ban <ip> [seconds] [reason]";
        let Some(Ok(address)) = command.arg(0).map(str::parse::<IpAddr>) else {
            return CommandResponse::usage(USAGE);
        };
        let mut rest = &command.args[1..];
        let mut ttl = None;
        if let Some(Ok(seconds)) = rest.first().map(|word| word.parse::<u64>()) {
            ttl = (seconds > 0).then(|| Duration::from_secs(seconds));
            rest = &rest[1..];
        }
        let reason = (!rest.is_empty()).then(|| rest.join(" "));

        let fresh = self.bans.ban(address, ttl, reason);
        let delisted = self.registry.remove_address(address);
        let closed = self
            .connections
            .as_ref()
            .map_or(0, |connections| connections.close_address(address));

        let expires = self.bans.get(address).and_then(|entry| entry.expires_at);
        let how_long = match (ttl, expires) {
            (Some(ttl), Some(_)) => format!("for {}s", ttl.as_secs()),
            _ => "permanently".to_string(),
        };
        let verb = if fresh { "banned" } else { "ban renewed for" };
        CommandResponse::line(format!(
            "{verb} {address} {how_long} ({delisted} servers delisted, {closed} connections closed)"
        ))
    }

    fn unban(&self, command: &Command) -> CommandResponse {
        let Some(Ok(address)) = command.arg(0).map(str::parse::<IpAddr>) else {
            return CommandResponse::usage("unban <ip>");
        };
        if self.bans.unban(address) {
            CommandResponse::line(format!("unbanned {address}"))
        } else {
            CommandResponse::line(format!("{address} was not banned"))
        }
    }

    fn bans(&self) -> CommandResponse {
        let entries = self.bans.entries();
        if entries.is_empty() {
            return CommandResponse::line("no bans");
        }
        CommandResponse::Done(
            entries
                .iter()
                .map(|entry| {
                    let expiry = entry
                        .remaining_at(std::time::Instant::now())
                        .map_or_else(|| "permanent".to_string(), |left| format!("{}s left", left.as_secs()));
                    match &entry.reason {
                        Some(reason) => format!("{} {expiry} {reason}", entry.address),
                        None => format!("{} {expiry}", entry.address),
                    }
                })
                .collect(),
        )
    }

    fn status(&self) -> CommandResponse {
        let snapshot = self.metrics.snapshot();
        let connections = self
            .connections
            .as_ref()
            .map_or(0, |connections| connections.connection_count());
        CommandResponse::Done(vec![
            format!("uptime {}s", snapshot.uptime.as_secs()),
            format!("servers {}", self.registry.len()),
            format!("bans {}", self.bans.len()),
            format!("connections {connections} open, {} total", snapshot.total_connections),
            format!(
                "heartbeats {} queries {} validations {}",
                snapshot.heartbeats,
                snapshot.queries,
                snapshot.total_validations()
            ),
            format!("errors {} dropped datagrams {}", snapshot.total_errors(), snapshot.datagrams_dropped),
        ])
    }

    fn servers(&self) -> CommandResponse {
        let servers = self.registry.snapshot(&ServerFilter::any());
        if servers.is_empty() {
            return CommandResponse::line("no servers");
        }
        CommandResponse::Done(
            servers
                .iter()
                .map(|server| {
                    let validated = if server.validated { " validated" } else { "" };
                    format!("{} {}{validated}", server.key, server.game)
                })
                .collect(),
        )
    }

    fn remove(&self, command: &Command) -> CommandResponse {
        let Some(Ok(key)) = command.arg(0).map(str::parse::<ServerKey>) else {
            return CommandResponse::usage("remove <ip>:<port>");
        };
        match self.registry.remove(&key) {
            Some(_) => CommandResponse::line(format!("removed {key}")),
            None => CommandResponse::line(format!("{key} was not listed")),
        }
    }
}

impl CommandListener for AdminCommands {
    fn execute(&self, command: &Command) -> Option<CommandResponse> {
        Some(match command.name.as_str() {
            "ban" => self.ban(command),
            "unban" => self.unban(command),
            "bans" => self.bans(),
            "status" => self.status(),
            "servers" => self.servers(),
            "remove" => self.remove(command),
            _ => return None,
        })
    }

    fn help(&self) -> Vec<String> {
        vec![
            "ban <ip> [seconds] [reason]".to_string(),
            "unban <ip>".to_string(),
            "bans".to_string(),
            "status".to_string(),
            "servers".to_string(),
            "remove <ip>:<port>".to_string(),
        ]
    }
}
