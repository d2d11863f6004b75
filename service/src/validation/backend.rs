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

//! Key stores consulted by the single and multi validators

use super::{KeyMaterial, Verdict};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Canonical form of a CD key: ASCII uppercase, separators and whitespace removed
pub fn normalise_key(key: &str) -> String {
    key.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Hex MD5 of the normalised key, as carried in validation requests
pub fn hash_key(key: &str) -> String {
    format!("{:x}", md5::compute(normalise_key(key)))
}

/// Response a genuine client computes for `challenge`
pub fn expected_response(key: &str, challenge: &str) -> String {
    let mut input = normalise_key(key);
    input.push_str(challenge);
    format!("{:x}", md5::compute(input))
}

/// A source of truth for keys
#[async_trait]
pub trait KeyBackend: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Verdict for `material`, `None` when the backend does not know the key
    async fn verify(&self, material: &KeyMaterial) -> Result<Option<Verdict>>;
}

#[derive(Debug, Clone)]
struct StoredKey {
    key: String,
    revoked: bool,
}

/// In-memory key store indexed by key hash
#[derive(Debug)]
pub struct StaticKeyBackend {
    name: String,
    keys: RwLock<HashMap<String, StoredKey>>,
}

impl StaticKeyBackend {
    /// Empty store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with_key(self, key: &str) -> Self {
        self.insert(key);
        self
    }

    /// Add a key; returns its hash
    pub fn insert(&self, key: &str) -> String {
        let hash = hash_key(key);
        self.keys.write().insert(
            hash.clone(),
            StoredKey {
                key: normalise_key(key),
                revoked: false,
            },
        );
        hash
    }

    /// Mark a key as revoked; returns whether it was known
    pub fn revoke(&self, key: &str) -> bool {
        match self.keys.write().get_mut(&hash_key(key)) {
            Some(stored) => {
                stored.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Forget a key; returns whether it was known
    pub fn remove(&self, key: &str) -> bool {
        self.keys.write().remove(&hash_key(key)).is_some()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    fn lookup(&self, material: &KeyMaterial) -> Option<Verdict> {
        let keys = self.keys.read();
        let stored = keys.get(&material.key_hash.to_ascii_lowercase())?;
        if stored.revoked {
            return Some(Verdict::Rejected);
        }
        let expected = expected_response(&stored.key, &material.challenge);
        if expected.eq_ignore_ascii_case(&material.response) {
            Some(Verdict::Accepted)
        } else {
            Some(Verdict::Rejected)
        }
    }
}

#[async_trait]
impl KeyBackend for StaticKeyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, material: &KeyMaterial) -> Result<Option<Verdict>> {
        Ok(self.lookup(material))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ABCD-EFGH-1234-5678";

    fn material(key: &str, challenge: &str, response: String) -> KeyMaterial {
        KeyMaterial {
            key_hash: hash_key(key),
            challenge: challenge.to_string(),
            response,
        }
    }

    #[test]
    fn test_normalise_and_hash() {
        assert_eq!(normalise_key("abcd-efgh 1234"), "ABCDEFGH1234");
        assert_eq!(hash_key("abcd-efgh-1234-5678"), hash_key(KEY));
        assert_eq!(hash_key(KEY).len(), 32);
        // Known MD5 vector
        assert_eq!(hash_key(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn test_static_backend() {
        let backend = StaticKeyBackend::new("retail").with_key(KEY);
        assert_eq!(backend.len(), 1);

        let good = material(KEY, "c1", expected_response(KEY, "c1"));
        assert_eq!(backend.verify(&good).await.unwrap(), Some(Verdict::Accepted));

        let bad = material(KEY, "c1", expected_response(KEY, "c2"));
        assert_eq!(backend.verify(&bad).await.unwrap(), Some(Verdict::Rejected));

        let unknown = material("ZZZZ", "c1", expected_response("ZZZZ", "c1"));
        assert_eq!(backend.verify(&unknown).await.unwrap(), None);

        assert!(backend.revoke(KEY));
        assert_eq!(backend.verify(&good).await.unwrap(), Some(Verdict::Rejected));
    }
}
