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

//! Pluggable modules and their lifecycle
//!
//! Validators, request handlers and log writers are all modules. They are handed to the
//! server in a [`ModuleSet`], initialised once when the server starts and shut down once
//! when it stops, both in ascending priority order. Each kind is kept as an immutable,
//! priority-ordered list that readers clone cheaply and that can be swapped wholesale.

use crate::ban::BanGate;
use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::handler::RequestHandler;
use crate::logging::LogWriter;
use crate::metrics::ServerMetrics;
use crate::registry::ServerRegistry;
use crate::validation::Validator;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// Lifecycle shared by every pluggable component
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Position in its list; lower runs first
    fn priority(&self) -> i32 {
        0
    }

    /// Called once before the module sees any traffic
    async fn initialise(&self, _context: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the server stops
    async fn shutdown(&self) {}
}

/// Server state a module may use during initialisation
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Live server list
    pub registry: Arc<ServerRegistry>,
    /// Ban list
    pub bans: Arc<BanGate>,
    /// Server counters
    pub metrics: Arc<ServerMetrics>,
    /// Configuration the server runs with
    pub config: Arc<MasterConfig>,
}

/// Modules to install, in any order
#[derive(Default)]
pub struct ModuleSet {
    validators: Vec<Arc<dyn Validator>>,
    handlers: Vec<Arc<dyn RequestHandler>>,
    log_writers: Vec<Arc<dyn LogWriter>>,
}

impl ModuleSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link to the validation chain
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Add a request handler
    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Add a log writer
    pub fn with_log_writer(mut self, writer: Arc<dyn LogWriter>) -> Self {
        self.log_writers.push(writer);
        self
    }
}

impl std::fmt::Debug for ModuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSet")
            .field("validators", &names(&self.validators))
            .field("handlers", &names(&self.handlers))
            .field("log_writers", &names(&self.log_writers))
            .finish()
    }
}

/// A module of any kind, for lifecycle dispatch.
#[derive(Clone)]
enum ModuleRef {
    Validator(Arc<dyn Validator>),
    Handler(Arc<dyn RequestHandler>),
    LogWriter(Arc<dyn LogWriter>),
}

impl ModuleRef {
    fn name(&self) -> &str {
        match self {
            ModuleRef::Validator(module) => module.name(),
            ModuleRef::Handler(module) => module.name(),
            ModuleRef::LogWriter(module) => module.name(),
        }
    }

    fn priority(&self) -> i32 {
        match self {
            ModuleRef::Validator(module) => module.priority(),
            ModuleRef::Handler(module) => module.priority(),
            ModuleRef::LogWriter(module) => module.priority(),
        }
    }

    async fn initialise(&self, context: &ModuleContext) -> Result<()> {
        match self {
            ModuleRef::Validator(module) => module.initialise(context).await,
            ModuleRef::Handler(module) => module.initialise(context).await,
            ModuleRef::LogWriter(module) => module.initialise(context).await,
        }
    }

    async fn shutdown(&self) {
        match self {
            ModuleRef::Validator(module) => module.shutdown().await,
            ModuleRef::Handler(module) => module.shutdown().await,
            ModuleRef::LogWriter(module) => module.shutdown().await,
        }
    }
}

/// Installed modules
pub struct ModuleRegistry {
    validators: RwLock<Arc<[Arc<dyn Validator>]>>,
    handlers: RwLock<Arc<[Arc<dyn RequestHandler>]>>,
    log_writers: RwLock<Arc<[Arc<dyn LogWriter>]>>,
    activated: AtomicBool,
    deactivated: AtomicBool,
}

impl ModuleRegistry {
    /// Install `set`, ordering each list by priority
    ///
    /// Modules of equal priority keep the order they were added in.
    pub fn new(set: ModuleSet) -> Self {
        Self {
            validators: RwLock::new(ordered(set.validators)),
            handlers: RwLock::new(ordered(set.handlers)),
            log_writers: RwLock::new(ordered(set.log_writers)),
            activated: AtomicBool::new(false),
            deactivated: AtomicBool::new(false),
        }
    }

    /// Current validation chain
    pub fn validators(&self) -> Arc<[Arc<dyn Validator>]> {
        self.validators.read().clone()
    }

    /// Current request handler chain
    pub fn handlers(&self) -> Arc<[Arc<dyn RequestHandler>]> {
        self.handlers.read().clone()
    }

    /// Current log writers
    pub fn log_writers(&self) -> Arc<[Arc<dyn LogWriter>]> {
        self.log_writers.read().clone()
    }

    /// Swap in a new validation chain
    ///
    /// Requests already walking the old chain finish on it. The new modules are not
    /// initialised by the registry.
    pub fn replace_validators(&self, validators: Vec<Arc<dyn Validator>>) {
        *self.validators.write() = ordered(validators);
    }

    /// Swap in a new request handler chain
    pub fn replace_handlers(&self, handlers: Vec<Arc<dyn RequestHandler>>) {
        *self.handlers.write() = ordered(handlers);
    }

    /// Swap in new log writers
    pub fn replace_log_writers(&self, writers: Vec<Arc<dyn LogWriter>>) {
        *self.log_writers.write() = ordered(writers);
    }

    /// Number of installed modules of every kind
    pub fn len(&self) -> usize {
        self.validators.read().len() + self.handlers.read().len() + self.log_writers.read().len()
    }

    /// Whether no module is installed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`activate`](Self::activate) has run
    pub fn is_active(&self) -> bool {
        self.activated.load(Ordering::Acquire) && !self.deactivated.load(Ordering::Acquire)
    }

    /// Initialise every module in priority order
    ///
    /// Runs at most once; later calls return `Ok(())` without doing anything. When a
    /// module fails, the ones already initialised are shut down again and the failure is
    /// returned.
    pub async fn activate(&self, context: &ModuleContext) -> Result<()> {
        if self.activated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let modules = self.all();
        for (index, module) in modules.iter().enumerate() {
            debug!(module = module.name(), priority = module.priority(), "Initialising module");
            if let Err(err) = module.initialise(context).await {
                error!(module = module.name(), error = %err, "Module failed to initialise");
                for started in &modules[..index] {
                    started.shutdown().await;
                }
                self.deactivated.store(true, Ordering::Release);
                return Err(MasterError::Module {
                    name: module.name().to_string(),
                    reason: err.to_string(),
                });
            }
        }
        info!(modules = modules.len(), "Modules initialised");
        Ok(())
    }

    /// Shut every module down in priority order
    ///
    /// Does nothing unless [`activate`](Self::activate) succeeded, and runs at most once.
    pub async fn deactivate(&self) {
        if !self.activated.load(Ordering::Acquire) || self.deactivated.swap(true, Ordering::AcqRel)
        {
            return;
        }
        for module in self.all() {
            debug!(module = module.name(), "Shutting module down");
            module.shutdown().await;
        }
    }

    fn all(&self) -> Vec<ModuleRef> {
        let mut modules: Vec<ModuleRef> = Vec::with_capacity(self.len());
        modules.extend(self.validators().iter().cloned().map(ModuleRef::Validator));
        modules.extend(self.handlers().iter().cloned().map(ModuleRef::Handler));
        modules.extend(self.log_writers().iter().cloned().map(ModuleRef::LogWriter));
        modules.sort_by_key(ModuleRef::priority);
        modules
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("validators", &names(&self.validators()))
            .field("handlers", &names(&self.handlers()))
            .field("log_writers", &names(&self.log_writers()))
            .field("active", &self.is_active())
            .finish()
    }
}

fn ordered<M: Module + ?Sized>(mut modules: Vec<Arc<M>>) -> Arc<[Arc<M>]> {
    modules.sort_by_key(|module| module.priority());
    modules.into()
}

fn names<M: Module + ?Sized>(modules: &[Arc<M>]) -> Vec<&str> {
    modules.iter().map(|module| module.name()).collect()
}
