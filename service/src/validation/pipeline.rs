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

//! Validation contexts and the chain walker

use super::{
    Classification, KeyMaterial, KeyRequest, ValidationOutcome, ValidationState, Validator,
    Verdict,
};
use crate::config::ValidationConfig;
use crate::error::{MasterError, Result};
use crate::metrics::ServerMetrics;
use crate::module::ModuleRegistry;
use crate::types::Origin;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ContextKey = (Origin, i32);

/// One validation context
#[derive(Debug)]
enum Slot {
    /// The chain is running in a task
    InFlight {
        generation: u64,
        state: watch::Receiver<ValidationState>,
        task: AbortHandle,
    },
    /// Kept so late duplicates get the same answer
    Resolved { state: ValidationState, at: Instant },
}

enum Decision {
    Done(ValidationState),
    Wait(watch::Receiver<ValidationState>),
}

/// Runs validation requests through the validator chain
///
/// At most one context exists per `(origin, correlation)`. A request that finds a context
/// in flight waits on it instead of starting another walk, and one that finds a recent
/// verdict gets that verdict.
#[derive(Debug)]
pub struct ValidationPipeline {
    contexts: Arc<DashMap<ContextKey, Slot>>,
    modules: Arc<ModuleRegistry>,
    config: ValidationConfig,
    metrics: Arc<ServerMetrics>,
    generation: AtomicU64,
}

impl ValidationPipeline {
    /// Create a pipeline walking the validators of `modules`
    pub fn new(
        modules: Arc<ModuleRegistry>,
        config: ValidationConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            contexts: Arc::new(DashMap::new()),
            modules,
            config,
            metrics,
            generation: AtomicU64::new(0),
        }
    }

    /// Settings in effect
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate `material` on behalf of `origin`
    ///
    /// Resolves once the chain gives a verdict, runs dry, or the deadline passes. When
    /// `cancel` fires first the context is torn down, any running validator is detached,
    /// and `Err(Cancelled)` is returned.
    pub async fn validate(
        &self,
        origin: Origin,
        correlation: i32,
        material: KeyMaterial,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome> {
        let key = (origin, correlation);
        let mut rx = match self.decide(key, material) {
            Decision::Done(state) => return Ok(self.outcome(state)),
            Decision::Wait(rx) => rx,
        };

        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.cancel(origin, correlation);
                return Err(MasterError::Cancelled);
            }
            changed = rx.wait_for(ValidationState::is_final) => match changed {
                Ok(state) => *state,
                // The walk was aborted underneath us
                Err(_) => ValidationState::TimedOut,
            },
        };
        Ok(self.outcome(state))
    }

    fn decide(&self, key: ContextKey, material: KeyMaterial) -> Decision {
        match self.contexts.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = match occupied.get() {
                    Slot::InFlight { state, .. } => Some(Decision::Wait(state.clone())),
                    Slot::Resolved { state, at } if at.elapsed() < self.config.linger => {
                        Some(Decision::Done(*state))
                    }
                    Slot::Resolved { .. } => None,
                };
                if let Some(decision) = existing {
                    debug!(origin = %key.0, correlation = key.1, "Joining existing validation");
                    counter!("umaster.validations.coalesced").increment(1);
                    return decision;
                }
                let (slot, rx) = self.launch(key, material);
                occupied.insert(slot);
                Decision::Wait(rx)
            }
            Entry::Vacant(vacant) => {
                let (slot, rx) = self.launch(key, material);
                vacant.insert(slot);
                Decision::Wait(rx)
            }
        }
    }

    fn launch(&self, key: ContextKey, material: KeyMaterial) -> (Slot, watch::Receiver<ValidationState>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(ValidationState::Pending);
        let validators = self.modules.validators();
        let request = KeyRequest {
            origin: key.0,
            correlation: key.1,
            material,
        };
        let deadline = self.config.deadline;
        let contexts = self.contexts.clone();
        let metrics = self.metrics.clone();

        let task = tokio::spawn(async move {
            let start = Instant::now();
            let state = match timeout(deadline, walk(&validators, &request, &tx)).await {
                Ok(Some(verdict)) => ValidationState::from(verdict),
                Ok(None) => {
                    debug!(origin = %request.origin, "No validator claimed the key");
                    ValidationState::TimedOut
                }
                Err(_) => {
                    debug!(origin = %request.origin, ?deadline, "Validation deadline passed");
                    ValidationState::TimedOut
                }
            };

            // A newer context under the same key is left alone
            if let Some(mut slot) = contexts.get_mut(&key) {
                let current = matches!(
                    &*slot,
                    Slot::InFlight { generation: g, .. } if *g == generation
                );
                if current {
                    *slot = Slot::Resolved {
                        state,
                        at: Instant::now(),
                    };
                }
            }
            metrics.validation(state);
            histogram!("umaster.validation.duration").record(start.elapsed().as_secs_f64());
            tx.send_replace(state);
        });

        let slot = Slot::InFlight {
            generation,
            state: rx.clone(),
            task: task.abort_handle(),
        };
        (slot, rx)
    }

    fn outcome(&self, state: ValidationState) -> ValidationOutcome {
        let verdict = match state {
            ValidationState::Accepted => Verdict::Accepted,
            ValidationState::Rejected => Verdict::Rejected,
            _ => self.config.default_policy.verdict(),
        };
        ValidationOutcome { state, verdict }
    }

    /// Abandon an in-flight context; returns whether one was running
    pub fn cancel(&self, origin: Origin, correlation: i32) -> bool {
        match self
            .contexts
            .remove_if(&(origin, correlation), |_, slot| matches!(slot, Slot::InFlight { .. }))
        {
            Some((_, Slot::InFlight { task, .. })) => {
                task.abort();
                counter!("umaster.validations.cancelled").increment(1);
                debug!(%origin, correlation, "Validation cancelled");
                true
            }
            _ => false,
        }
    }

    /// Drop every context of a closed connection; returns how many were still running
    pub fn cancel_origin(&self, origin: Origin) -> usize {
        let mut cancelled = 0;
        self.contexts.retain(|(owner, _), slot| {
            if *owner != origin {
                return true;
            }
            if let Slot::InFlight { task, .. } = slot {
                task.abort();
                cancelled += 1;
            }
            false
        });
        if cancelled > 0 {
            counter!("umaster.validations.cancelled").increment(cancelled as u64);
            debug!(%origin, cancelled, "Validations cancelled with their connection");
        }
        cancelled
    }

    /// Forget verdicts older than the linger period; returns how many were dropped
    pub fn purge_resolved(&self) -> usize {
        let linger = self.config.linger;
        let before = self.contexts.len();
        self.contexts.retain(|_, slot| match slot {
            Slot::Resolved { at, .. } => at.elapsed() < linger,
            Slot::InFlight { .. } => true,
        });
        before.saturating_sub(self.contexts.len())
    }

    /// Number of contexts whose chain is still running
    pub fn in_flight(&self) -> usize {
        self.contexts
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::InFlight { .. }))
            .count()
    }

    /// Number of contexts, resolved ones included
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether there are no contexts
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Try each validator in order until one gives a verdict.
async fn walk(
    validators: &[Arc<dyn Validator>],
    request: &KeyRequest,
    progress: &watch::Sender<ValidationState>,
) -> Option<Verdict> {
    for (index, validator) in validators.iter().enumerate() {
        progress.send_replace(ValidationState::InProgress(index));
        match validator.classify(request).await {
            Ok(Classification::Verdict(verdict)) => {
                debug!(validator = validator.name(), ?verdict, "Key classified");
                return Some(verdict);
            }
            Ok(Classification::NotMine) => {}
            Err(error) => {
                counter!("umaster.errors.validator").increment(1);
                warn!(validator = validator.name(), %error, "Validator failed, trying the next one");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultPolicy;
    use crate::module::{Module, ModuleSet};
    use crate::validation::NullValidator;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Classifies after a delay and counts its calls
    struct SlowValidator {
        delay: Duration,
        calls: Arc<AtomicUsize>,
        answer: Classification,
    }

    #[async_trait]
    impl Module for SlowValidator {
        fn name(&self) -> &str {
            "slow"
        }
    }

    #[async_trait]
    impl Validator for SlowValidator {
        async fn classify(&self, _request: &KeyRequest) -> Result<Classification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.answer)
        }
    }

    struct FailingValidator;

    #[async_trait]
    impl Module for FailingValidator {
        fn name(&self) -> &str {
            "failing"
        }
    }

    #[async_trait]
    impl Validator for FailingValidator {
        async fn classify(&self, _request: &KeyRequest) -> Result<Classification> {
            Err(MasterError::protocol("backend exploded"))
        }
    }

    fn pipeline(set: ModuleSet, config: ValidationConfig) -> ValidationPipeline {
        let modules = Arc::new(ModuleRegistry::new(set));
        ValidationPipeline::new(modules, config, Arc::new(ServerMetrics::new()))
    }

    fn origin() -> Origin {
        Origin::Udp("10.0.0.1:7777".parse().unwrap())
    }

    fn material() -> KeyMaterial {
        KeyMaterial {
            key_hash: "hash".to_string(),
            challenge: "challenge".to_string(),
            response: "response".to_string(),
        }
    }

    #[tokio::test]
    async fn test_null_chain_accepts() {
        let pipeline = pipeline(
            ModuleSet::new().with_validator(Arc::new(NullValidator::new())),
            ValidationConfig::default(),
        );
        let outcome = pipeline
            .validate(origin(), 1, material(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.state, ValidationState::Accepted);
        assert_eq!(outcome.verdict, Verdict::Accepted);
    }

    #[tokio::test]
    async fn test_failure_advances_chain() {
        let set = ModuleSet::new()
            .with_validator(Arc::new(FailingValidator))
            .with_validator(Arc::new(NullValidator::new().with_priority(1)));
        let pipeline = pipeline(set, ValidationConfig::default());
        let outcome = pipeline
            .validate(origin(), 1, material(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.state, ValidationState::Accepted);
    }

    #[tokio::test]
    async fn test_empty_chain_applies_default_policy() {
        let config = ValidationConfig::default().with_default_policy(DefaultPolicy::Accept);
        let pipeline = pipeline(ModuleSet::new(), config);
        let outcome = pipeline
            .validate(origin(), 1, material(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.state, ValidationState::TimedOut);
        assert_eq!(outcome.verdict, Verdict::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = SlowValidator {
            delay: Duration::from_secs(60),
            calls: calls.clone(),
            answer: Classification::Verdict(Verdict::Accepted),
        };
        let config = ValidationConfig::default().with_deadline(Duration::from_secs(2));
        let pipeline = pipeline(ModuleSet::new().with_validator(Arc::new(slow)), config);

        let start = tokio::time::Instant::now();
        let outcome = pipeline
            .validate(origin(), 1, material(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.state, ValidationState::TimedOut);
        assert_eq!(outcome.verdict, Verdict::Rejected);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2100));
    }

    #[tokio::test]
    async fn test_duplicates_coalesce() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = SlowValidator {
            delay: Duration::from_millis(100),
            calls: calls.clone(),
            answer: Classification::Verdict(Verdict::Rejected),
        };
        let pipeline = Arc::new(pipeline(
            ModuleSet::new().with_validator(Arc::new(slow)),
            ValidationConfig::default(),
        ));

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let pipeline = pipeline.clone();
            waiters.push(tokio::spawn(async move {
                pipeline
                    .validate(origin(), 42, material(), &CancellationToken::new())
                    .await
            }));
        }
        for waiter in waiters {
            let outcome = waiter.await.unwrap().unwrap();
            assert_eq!(outcome.state, ValidationState::Rejected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A late duplicate gets the remembered verdict
        let late = pipeline
            .validate(origin(), 42, material(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(late.state, ValidationState::Rejected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = SlowValidator {
            delay: Duration::from_secs(30),
            calls,
            answer: Classification::Verdict(Verdict::Accepted),
        };
        let pipeline = Arc::new(pipeline(
            ModuleSet::new().with_validator(Arc::new(slow)),
            ValidationConfig::default(),
        ));
        let cancel = CancellationToken::new();

        let waiter = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.validate(origin(), 7, material(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.in_flight(), 1);

        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(MasterError::Cancelled)));
        assert!(pipeline.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_origin() {
        let slow = SlowValidator {
            delay: Duration::from_secs(30),
            calls: Arc::new(AtomicUsize::new(0)),
            answer: Classification::NotMine,
        };
        let pipeline = Arc::new(pipeline(
            ModuleSet::new().with_validator(Arc::new(slow)),
            ValidationConfig::default(),
        ));

        let mut waiters = Vec::new();
        for correlation in 0..3 {
            let pipeline = pipeline.clone();
            waiters.push(tokio::spawn(async move {
                pipeline
                    .validate(origin(), correlation, material(), &CancellationToken::new())
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pipeline.cancel_origin(origin()), 3);
        assert!(pipeline.is_empty());
        // Waiters of a torn-down context resolve rather than hang
        for waiter in waiters {
            let outcome = waiter.await.unwrap().unwrap();
            assert_eq!(outcome.state, ValidationState::TimedOut);
        }
    }
}
