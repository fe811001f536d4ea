//! Typed in-process command dispatch.
//!
//! One command type routes to exactly one handler; registering a second
//! handler for the same type is an error.  A middleware chain, fixed at
//! construction, wraps every dispatch; the logging middleware emits
//! structured events.  `handle` is synchronous for the caller — handlers
//! push frames onto per-connection channels and may spawn async follow-up.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("a handler is already registered for {0}")]
    DuplicateHandler(&'static str),
    #[error("no handler registered for {0}")]
    NoHandler(&'static str),
}

/// Hooks invoked around every dispatch, in registration order.
pub trait Middleware: Send + Sync {
    fn before_dispatch(&self, command_name: &str);
    fn after_dispatch(&self, command_name: &str);
}

/// Emits a structured event on each side of a dispatch.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before_dispatch(&self, command_name: &str) {
        debug!(command = command_name, "dispatching command");
    }

    fn after_dispatch(&self, command_name: &str) {
        debug!(command = command_name, "command handled");
    }
}

type Handler = Box<dyn Fn(&dyn Any) + Send + Sync>;

pub struct CommandBus {
    handlers: RwLock<HashMap<TypeId, Handler>>,
    middleware: Vec<Box<dyn Middleware>>,
}

impl CommandBus {
    pub fn new(middleware: Vec<Box<dyn Middleware>>) -> Self {
        CommandBus {
            handlers: RwLock::new(HashMap::new()),
            middleware,
        }
    }

    /// Register the sole handler for command type `C`.
    pub fn register<C: Any + Send>(
        &self,
        handler: impl Fn(&C) + Send + Sync + 'static,
    ) -> Result<(), BusError> {
        let mut handlers = self.handlers.write().expect("bus handler table poisoned");
        if handlers.contains_key(&TypeId::of::<C>()) {
            return Err(BusError::DuplicateHandler(type_name::<C>()));
        }
        handlers.insert(
            TypeId::of::<C>(),
            Box::new(move |any| {
                if let Some(command) = any.downcast_ref::<C>() {
                    handler(command);
                }
            }),
        );
        Ok(())
    }

    /// Dispatch `command` through the middleware chain to its handler.
    pub fn handle<C: Any + Send>(&self, command: C) -> Result<(), BusError> {
        let name = type_name::<C>();
        let handlers = self.handlers.read().expect("bus handler table poisoned");
        let handler = handlers
            .get(&TypeId::of::<C>())
            .ok_or(BusError::NoHandler(name))?;
        for middleware in &self.middleware {
            middleware.before_dispatch(name);
        }
        handler(&command);
        for middleware in &self.middleware {
            middleware.after_dispatch(name);
        }
        Ok(())
    }
}
