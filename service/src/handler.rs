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

//! Request handler modules

use crate::error::Result;
use crate::module::Module;
use crate::session::Session;
use async_trait::async_trait;
use umaster_codec::Message;

/// Result of offering a message to a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Not handled; offer it to the next handler or the built-in routing
    Pass,
    /// Handled; these replies go back to the sender
    Handled(Vec<Message>),
}

/// Module that sees decoded messages before the built-in routing
///
/// Handlers are asked in priority order and the first to return
/// [`HandlerOutcome::Handled`] claims the message. This is also how unknown op-codes get
/// served: they reach handlers as [`Message::Unknown`].
///
/// # Example
///
/// ```no_run
/// use umaster_service::{HandlerOutcome, Module, RequestHandler, Result, Session};
/// use umaster_codec::Message;
/// use async_trait::async_trait;
///
/// struct Echo;
///
/// #[async_trait]
/// impl Module for Echo {
///     fn name(&self) -> &str {
///         "echo"
///     }
/// }
///
/// #[async_trait]
/// impl RequestHandler for Echo {
///     async fn handle(&self, _session: &Session, message: &Message) -> Result<HandlerOutcome> {
///         match message {
///             Message::Unknown { opcode: 0x60, .. } => {
///                 Ok(HandlerOutcome::Handled(vec![message.clone()]))
///             }
///             _ => Ok(HandlerOutcome::Pass),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait RequestHandler: Module {
    /// Offer `message` from `session` to this handler
    async fn handle(&self, session: &Session, message: &Message) -> Result<HandlerOutcome>;
}

type Callback = Box<dyn Fn(&Session, &Message) -> HandlerOutcome + Send + Sync + 'static>;

/// Closure-based handler
///
/// # Example
///
/// ```no_run
/// use umaster_service::{CallbackHandler, HandlerOutcome};
/// use umaster_codec::Message;
///
/// let handler = CallbackHandler::new("motd", |_session, message| match message {
///     Message::Unknown { opcode: 0x61, .. } => HandlerOutcome::Handled(Vec::new()),
///     _ => HandlerOutcome::Pass,
/// });
/// ```
pub struct CallbackHandler {
    name: String,
    priority: i32,
    callback: Callback,
}

impl CallbackHandler {
    /// Handler named `name` running `callback`
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Session, &Message) -> HandlerOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority: 0,
            callback: Box::new(callback),
        }
    }

    /// Set the position among handlers
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for CallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Module for CallbackHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

#[async_trait]
impl RequestHandler for CallbackHandler {
    async fn handle(&self, session: &Session, message: &Message) -> Result<HandlerOutcome> {
        Ok((self.callback)(session, message))
    }
}
