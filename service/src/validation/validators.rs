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

//! Built-in validators

use super::{Classification, KeyBackend, KeyRequest, UpstreamClient, Validator, Verdict};
use crate::config::UpstreamConfig;
use crate::error::{MasterError, Result};
use crate::module::{Module, ModuleContext};
use async_trait::async_trait;
use std::sync::Arc;

/// Accepts every key
#[derive(Debug, Default)]
pub struct NullValidator {
    priority: i32,
}

impl NullValidator {
    /// Create the validator
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chain position
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Module for NullValidator {
    fn name(&self) -> &str {
        "null"
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[async_trait]
impl Validator for NullValidator {
    async fn classify(&self, _request: &KeyRequest) -> Result<Classification> {
        Ok(Classification::Verdict(Verdict::Accepted))
    }
}

/// Relays keys to an upstream master
///
/// An upstream that answers with its own timeout verdict has not really classified the
/// key, so that answer counts as not mine.
#[derive(Debug)]
pub struct PassthroughValidator {
    client: UpstreamClient,
    priority: i32,
}

impl PassthroughValidator {
    /// Relay to the upstream described by `config`
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            client: UpstreamClient::new(config),
            priority: 0,
        }
    }

    /// Set the chain position
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// The relay client
    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }
}

#[async_trait]
impl Module for PassthroughValidator {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn initialise(&self, _context: &ModuleContext) -> Result<()> {
        self.client.config().validate().map_err(MasterError::Config)?;
        self.client.connect().await?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.client.close();
    }
}

#[async_trait]
impl Validator for PassthroughValidator {
    async fn classify(&self, request: &KeyRequest) -> Result<Classification> {
        let result = self.client.relay(&request.material).await?;
        if result.timed_out {
            return Ok(Classification::NotMine);
        }
        Ok(Classification::Verdict(if result.accepted {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        }))
    }
}

/// Asks one fixed backend
pub struct SingleValidator {
    backend: Arc<dyn KeyBackend>,
    priority: i32,
}

impl SingleValidator {
    /// Validate against `backend`
    pub fn new(backend: Arc<dyn KeyBackend>) -> Self {
        Self {
            backend,
            priority: 0,
        }
    }

    /// Set the chain position
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for SingleValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleValidator")
            .field("backend", &self.backend.name())
            .field("priority", &self.priority)
            .finish()
    }
}

#[async_trait]
impl Module for SingleValidator {
    fn name(&self) -> &str {
        "single"
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[async_trait]
impl Validator for SingleValidator {
    async fn classify(&self, request: &KeyRequest) -> Result<Classification> {
        Ok(match self.backend.verify(&request.material).await? {
            Some(verdict) => Classification::Verdict(verdict),
            None => Classification::NotMine,
        })
    }
}

/// Routes keys to backends by key hash prefix
///
/// The longest matching prefix wins, compared without regard to case. A key no route
/// matches is not mine.
pub struct MultiValidator {
    routes: Vec<(String, Arc<dyn KeyBackend>)>,
    priority: i32,
}

impl MultiValidator {
    /// Validator with no routes
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            priority: 0,
        }
    }

    /// Send keys whose hash starts with `prefix` to `backend`
    ///
    /// An empty prefix catches every key not claimed by a longer one.
    pub fn with_route(mut self, prefix: impl Into<String>, backend: Arc<dyn KeyBackend>) -> Self {
        self.routes.push((prefix.into().to_ascii_lowercase(), backend));
        self
    }

    /// Set the chain position
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Backend responsible for `key_hash`
    pub fn route(&self, key_hash: &str) -> Option<&Arc<dyn KeyBackend>> {
        let key_hash = key_hash.to_ascii_lowercase();
        self.routes
            .iter()
            .filter(|(prefix, _)| key_hash.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, backend)| backend)
    }
}

impl Default for MultiValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MultiValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: Vec<(&str, &str)> = self
            .routes
            .iter()
            .map(|(prefix, backend)| (prefix.as_str(), backend.name()))
            .collect();
        f.debug_struct("MultiValidator")
            .field("routes", &routes)
            .field("priority", &self.priority)
            .finish()
    }
}

#[async_trait]
impl Module for MultiValidator {
    fn name(&self) -> &str {
        "multi"
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[async_trait]
impl Validator for MultiValidator {
    async fn classify(&self, request: &KeyRequest) -> Result<Classification> {
        let Some(backend) = self.route(&request.material.key_hash) else {
            return Ok(Classification::NotMine);
        };
        tracing::trace!(backend = backend.name(), "Routing key");
        Ok(match backend.verify(&request.material).await? {
            Some(verdict) => Classification::Verdict(verdict),
            None => Classification::NotMine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Origin;
    use crate::validation::{KeyMaterial, StaticKeyBackend, expected_response, hash_key};

    fn request(key: &str, challenge: &str) -> KeyRequest {
        KeyRequest {
            origin: Origin::Udp("10.0.0.1:7777".parse().unwrap()),
            correlation: 1,
            material: KeyMaterial {
                key_hash: hash_key(key),
                challenge: challenge.to_string(),
                response: expected_response(key, challenge),
            },
        }
    }

    #[tokio::test]
    async fn test_null_accepts() {
        let verdict = NullValidator::new().classify(&request("ANY", "x")).await.unwrap();
        assert_eq!(verdict, Classification::Verdict(Verdict::Accepted));
    }

    #[tokio::test]
    async fn test_single() {
        let backend = Arc::new(StaticKeyBackend::new("retail").with_key("KEY-ONE"));
        let validator = SingleValidator::new(backend);

        let known = validator.classify(&request("KEY-ONE", "c")).await.unwrap();
        assert_eq!(known, Classification::Verdict(Verdict::Accepted));
        let unknown = validator.classify(&request("KEY-TWO", "c")).await.unwrap();
        assert_eq!(unknown, Classification::NotMine);
    }

    #[tokio::test]
    async fn test_multi_routes_by_longest_prefix() {
        let retail = Arc::new(StaticKeyBackend::new("retail").with_key("KEY-ONE"));
        let beta = Arc::new(StaticKeyBackend::new("beta"));
        let prefix: String = hash_key("KEY-ONE").chars().take(2).collect();

        let validator = MultiValidator::new()
            .with_route("", beta.clone())
            .with_route(prefix.to_ascii_uppercase(), retail);

        assert_eq!(validator.route(&hash_key("KEY-ONE")).unwrap().name(), "retail");
        let verdict = validator.classify(&request("KEY-ONE", "c")).await.unwrap();
        assert_eq!(verdict, Classification::Verdict(Verdict::Accepted));

        let empty = MultiValidator::new().with_route("zz-never", beta);
        let verdict = empty.classify(&request("KEY-ONE", "c")).await.unwrap();
        assert_eq!(verdict, Classification::NotMine);
    }
}
