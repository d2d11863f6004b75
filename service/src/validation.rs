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

//! CD-key validation
//!
//! A validation request walks an ordered chain of [`Validator`]s. The first one to return a
//! [`Verdict`] ends the walk; a validator that answers [`Classification::NotMine`], or
//! fails, hands the request to the next. If the chain runs dry or the deadline passes the
//! request resolves as [`ValidationState::TimedOut`] and the configured default policy
//! decides.
//!
//! ```text
//! Pending → InProgress(0) → InProgress(1) → … → Accepted | Rejected | TimedOut
//! ```

mod backend;
mod pipeline;
mod upstream;
mod validators;

pub use backend::{KeyBackend, StaticKeyBackend, expected_response, hash_key, normalise_key};
pub use pipeline::ValidationPipeline;
pub use upstream::UpstreamClient;
pub use validators::{MultiValidator, NullValidator, PassthroughValidator, SingleValidator};

use crate::error::Result;
use crate::logging::StatusCode;
use crate::module::Module;
use crate::types::Origin;
use async_trait::async_trait;
use umaster_codec::{Message, ValidateKey, ValidateResult};

/// A definitive answer for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// The key may play
    Accepted,
    /// The key may not play
    Rejected,
}

impl Verdict {
    /// Whether this is [`Verdict::Accepted`]
    pub fn is_accepted(self) -> bool {
        self == Verdict::Accepted
    }
}

/// What a validator made of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A definitive answer; the chain stops here
    Verdict(Verdict),
    /// Not this validator's key; try the next one
    NotMine,
}

/// Progress of one validation context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    /// Created, no validator asked yet
    Pending,
    /// Waiting on the validator at this chain index
    InProgress(usize),
    /// Resolved by a validator
    Accepted,
    /// Resolved by a validator
    Rejected,
    /// Deadline passed or no validator claimed the key
    TimedOut,
}

impl ValidationState {
    /// Whether the context has resolved
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ValidationState::Accepted | ValidationState::Rejected | ValidationState::TimedOut
        )
    }
}

impl From<Verdict> for ValidationState {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accepted => ValidationState::Accepted,
            Verdict::Rejected => ValidationState::Rejected,
        }
    }
}

/// Resolution of a validation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// Final state
    pub state: ValidationState,
    /// Verdict delivered to the requester; the default policy's on timeout
    pub verdict: Verdict,
}

impl ValidationOutcome {
    /// Reply carrying this outcome
    pub fn to_message(&self, correlation: i32) -> Message {
        Message::ValidateResult(ValidateResult {
            correlation,
            accepted: self.verdict.is_accepted(),
            timed_out: self.state == ValidationState::TimedOut,
        })
    }

    /// Status recorded in the request log
    pub fn status(&self) -> StatusCode {
        match (self.state, self.verdict) {
            (ValidationState::TimedOut, _) => StatusCode::TimedOut,
            (_, Verdict::Accepted) => StatusCode::Accepted,
            (_, Verdict::Rejected) => StatusCode::Rejected,
        }
    }
}

/// Key material as relayed by a game server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMaterial {
    /// MD5 of the player's normalised CD key, hex encoded
    pub key_hash: String,
    /// Challenge the game server issued to the player
    pub challenge: String,
    /// Player's response, MD5 of key and challenge
    pub response: String,
}

impl From<ValidateKey> for KeyMaterial {
    fn from(request: ValidateKey) -> Self {
        Self {
            key_hash: request.key_hash,
            challenge: request.challenge,
            response: request.response,
        }
    }
}

/// One request as seen by validators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    /// Connection the request arrived on
    pub origin: Origin,
    /// Requester's correlation id
    pub correlation: i32,
    /// Material to classify
    pub material: KeyMaterial,
}

/// A link in the validation chain
///
/// Validators are modules: the registry initialises them in priority order, and the chain
/// is walked in that same order.
#[async_trait]
pub trait Validator: Module {
    /// Classify a key
    ///
    /// An `Err` is logged and treated as [`Classification::NotMine`].
    async fn classify(&self, request: &KeyRequest) -> Result<Classification>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_finality() {
        assert!(!ValidationState::Pending.is_final());
        assert!(!ValidationState::InProgress(2).is_final());
        assert!(ValidationState::Accepted.is_final());
        assert!(ValidationState::TimedOut.is_final());
    }

    #[test]
    fn test_outcome_message() {
        let outcome = ValidationOutcome {
            state: ValidationState::TimedOut,
            verdict: Verdict::Accepted,
        };
        assert_eq!(
            outcome.to_message(9),
            Message::ValidateResult(ValidateResult {
                correlation: 9,
                accepted: true,
                timed_out: true,
            })
        );
        assert_eq!(outcome.status(), StatusCode::TimedOut);

        let outcome = ValidationOutcome {
            state: ValidationState::Rejected,
            verdict: Verdict::Rejected,
        };
        assert_eq!(outcome.status(), StatusCode::Rejected);
    }
}
