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

//! Error types for the master server

use crate::logging::StatusCode;
use crate::types::ConnectionId;
use std::net::IpAddr;
use thiserror::Error;
use umaster_codec::CodecError;

/// Result type for operations
pub type Result<T> = std::result::Result<T, MasterError>;

/// Master server error types
///
/// `Format`, `Protocol`, `Transport`, `Timeout` and `BanRejection` are the classes every unit
/// of work can fail with. They stay local to that unit: the packet is dropped or the
/// connection closed, and listeners keep running.
#[derive(Debug, Error)]
pub enum MasterError {
    /// Malformed or truncated packet
    #[error("Format error: {0}")]
    Format(CodecError),

    /// Well-formed packet that is invalid in the current state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket or stream failure
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Address denied by the ban gate
    #[error("Address {0} is banned")]
    BanRejection(IpAddr),

    /// Connection with the given ID was not found
    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// Connection has been closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server is not running
    #[error("Server not running")]
    ServerNotRunning,

    /// Server is already running
    #[error("Server already running")]
    ServerAlreadyRunning,

    /// Server is shutting down or has shut down
    #[error("Server is shutting down")]
    ServerShuttingDown,

    /// Maximum number of connections reached
    #[error("Maximum connections ({0}) reached")]
    MaxConnectionsReached(usize),

    /// Every configured listener failed to bind
    #[error("No listener could be bound")]
    NoListeners,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A module failed during its lifecycle
    #[error("Module {name} failed: {reason}")]
    Module {
        /// Module name
        name: String,
        /// What went wrong
        reason: String,
    },

    /// Work was abandoned because its connection went away
    #[error("Cancelled")]
    Cancelled,
}

impl From<CodecError> for MasterError {
    fn from(err: CodecError) -> Self {
        match err {
            // Stream failures surface through the framer but are not format problems
            CodecError::IOError { kind, operation } => {
                MasterError::Transport(std::io::Error::new(kind, operation))
            }
            other => MasterError::Format(other),
        }
    }
}

impl MasterError {
    /// Check if the error is recoverable
    ///
    /// Recoverable errors are those that don't indicate a fatal condition
    /// and where retrying the operation might succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MasterError::Timeout | MasterError::ConnectionClosed | MasterError::Transport(_)
        )
    }

    /// Check if the error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MasterError::ConnectionNotFound(_)
                | MasterError::ConnectionClosed
                | MasterError::Transport(_)
        )
    }

    /// Check if the error is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, MasterError::Protocol(_))
    }

    /// Check if the error came from malformed input
    pub fn is_format_error(&self) -> bool {
        matches!(self, MasterError::Format(_))
    }

    /// Status code recorded in the request log for this error
    pub fn status(&self) -> StatusCode {
        match self {
            MasterError::Format(_) => StatusCode::FormatError,
            MasterError::Protocol(_) => StatusCode::ProtocolError,
            MasterError::Timeout => StatusCode::TimedOut,
            MasterError::BanRejection(_) => StatusCode::Banned,
            MasterError::MaxConnectionsReached(_) => StatusCode::Refused,
            MasterError::Cancelled => StatusCode::Cancelled,
            _ => StatusCode::TransportError,
        }
    }

    /// Shorthand for a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        MasterError::Protocol(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_recoverable() {
        assert!(MasterError::Timeout.is_recoverable());
        assert!(MasterError::ConnectionClosed.is_recoverable());
        assert!(!MasterError::ServerNotRunning.is_recoverable());
        assert!(!MasterError::MaxConnectionsReached(100).is_recoverable());
    }

    #[test]
    fn test_error_classification() {
        assert!(MasterError::ConnectionNotFound(ConnectionId::new(1)).is_connection_error());
        assert!(!MasterError::Timeout.is_connection_error());
        assert!(MasterError::protocol("unexpected").is_protocol_error());
        assert!(MasterError::from(CodecError::EmptyFrame).is_format_error());
    }

    #[test]
    fn test_error_status() {
        assert_eq!(
            MasterError::from(CodecError::MissingTerminator).status(),
            StatusCode::FormatError
        );
        assert_eq!(
            MasterError::BanRejection("10.0.0.1".parse().unwrap()).status(),
            StatusCode::Banned
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(MasterError::from(io).status(), StatusCode::TransportError);
    }

    #[test]
    fn test_error_display() {
        let err = MasterError::ConnectionNotFound(ConnectionId::new(42));
        assert_eq!(err.to_string(), "Connection conn-42 not found");

        let err = MasterError::MaxConnectionsReached(1000);
        assert_eq!(err.to_string(), "Maximum connections (1000) reached");
    }
}
