// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::Message;
use crate::session::Session;
use crate::{AppError, AppResult};

use super::{GlobalStrategy, StrategyHandler};

/// Collects handlers, then builds immutable dispatchers from them.
///
/// The server keeps one builder and builds a dispatcher per listener port, so
/// each port only sees handlers whose `supports_port` accepts it.
#[derive(Clone, Default)]
pub struct DispatcherBuilder {
    handlers: Vec<Arc<dyn StrategyHandler>>,
    interceptor: Option<Arc<dyn GlobalStrategy>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        DispatcherBuilder::default()
    }

    pub fn handler<H: StrategyHandler + 'static>(self, handler: H) -> Self {
        self.register(Arc::new(handler))
    }

    pub fn register(mut self, handler: Arc<dyn StrategyHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn interceptor<G: GlobalStrategy + 'static>(mut self, interceptor: G) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn build(&self) -> StrategyDispatcher {
        self.build_filtered(|_| true)
    }

    pub fn build_for_port(&self, port: u16) -> StrategyDispatcher {
        self.build_filtered(|handler| handler.supports_port(port))
    }

    fn build_filtered<F>(&self, accept: F) -> StrategyDispatcher
    where
        F: Fn(&Arc<dyn StrategyHandler>) -> bool,
    {
        let mut routes: HashMap<String, Vec<Arc<dyn StrategyHandler>>> = HashMap::new();
        for handler in self.handlers.iter().filter(|handler| accept(handler)) {
            for command in handler.commands() {
                let registered = routes.entry(command.clone()).or_default();
                // the same instance answers a command once
                if registered.iter().any(|existing| same_handler(existing, handler)) {
                    continue;
                }
                info!(
                    "register strategy handler: {} => {} (priority {})",
                    command,
                    handler.name(),
                    handler.priority()
                );
                registered.push(handler.clone());
            }
        }
        // stable: equal priorities keep registration order
        for handlers in routes.values_mut() {
            handlers.sort_by_key(|handler| std::cmp::Reverse(handler.priority()));
        }
        StrategyDispatcher {
            routes,
            interceptor: self.interceptor.clone(),
        }
    }
}

fn same_handler(a: &Arc<dyn StrategyHandler>, b: &Arc<dyn StrategyHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Command to handler routing table, immutable after build so dispatch takes no locks.
pub struct StrategyDispatcher {
    routes: HashMap<String, Vec<Arc<dyn StrategyHandler>>>,
    interceptor: Option<Arc<dyn GlobalStrategy>>,
}

impl StrategyDispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn commands(&self) -> Vec<&str> {
        let mut commands: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        commands.sort_unstable();
        commands
    }

    /// The highest-priority handler registered for the message's command whose
    /// `supports` accepts it.
    pub fn select(&self, message: &Message) -> AppResult<&Arc<dyn StrategyHandler>> {
        let command = message.command();
        if command.is_empty() {
            return Err(AppError::DispatchMiss("<empty>".to_string()));
        }
        self.routes
            .get(command)
            .and_then(|handlers| handlers.iter().find(|handler| handler.supports(message)))
            .ok_or_else(|| AppError::DispatchMiss(command.to_string()))
    }

    /// Routes `message` and returns the handler's reply.
    ///
    /// A miss is logged and reported as `DispatchMiss`; nothing is sent to the peer.
    pub fn dispatch(&self, session: &Arc<Session>, message: Message) -> AppResult<Option<Message>> {
        if let Some(interceptor) = &self.interceptor {
            if let Some(reply) = interceptor.intercept(session, &message) {
                debug!(session = %session, "message answered by global strategy");
                return Ok(Some(reply));
            }
        }
        let handler = match self.select(&message) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(session = %session, "drop message {:?}: {}", message, e);
                return Err(e);
            }
        };
        debug!(
            session = %session,
            "command {} handled by {}",
            message.command(),
            handler.name()
        );
        handler.process(session, message)
    }
}

impl fmt::Debug for StrategyDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyDispatcher")
            .field("commands", &self.commands())
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}
