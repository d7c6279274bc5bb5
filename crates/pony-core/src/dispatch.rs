//! Message kind to handler registry.
//!
//! Handlers are registered per kind with the event type they expect. The
//! dispatcher decodes the payload, calls the handler with the sender's
//! identity and contains every failure: unknown kinds, malformed payloads,
//! handler errors and handler panics are logged and reported as a
//! [`Dispatch`] outcome, never propagated to the daemon loop.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use pony_rpc::Message;
use pony_types::Identity;
use serde::de::DeserializeOwned;
use tracing::{error, trace, warn};

use crate::error::DecodeError;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No handler registered for the kind.
    Unknown,
    /// The payload did not decode into the handler's event type.
    Malformed,
    /// The handler returned an error or panicked.
    Failed,
}

type Outcome = Result<anyhow::Result<()>, DecodeError>;
type Handler<M> = Box<dyn Fn(&mut M, &Message) -> Outcome + Send>;

pub struct EventDispatcher<M> {
    handlers: HashMap<String, Handler<M>>,
}

impl<M> Default for EventDispatcher<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for EventDispatcher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("EventDispatcher")
            .field("kinds", &kinds)
            .finish()
    }
}

impl<M> EventDispatcher<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for messages of `kind`. A later registration for
    /// the same kind replaces the earlier one.
    pub fn on<E, F>(&mut self, kind: &str, handler: F) -> &mut Self
    where
        E: DeserializeOwned,
        F: Fn(&mut M, &Identity, E) -> anyhow::Result<()> + Send + 'static,
    {
        let erased: Handler<M> = Box::new(move |manager, message| {
            let event: E = message.decode().map_err(|source| DecodeError {
                kind: message.kind.clone(),
                sender: message.sender.to_string(),
                source,
            })?;
            Ok(handler(manager, &message.sender, event))
        });

        if self.handlers.insert(kind.to_string(), erased).is_some() {
            warn!("Handler for {} replaced", kind);
        }
        self
    }

    #[must_use]
    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, manager: &mut M, message: &Message) -> Dispatch {
        let Some(handler) = self.handlers.get(&message.kind) else {
            warn!(
                "Dropping {} message from {}: no handler",
                message.kind, message.sender
            );
            return Dispatch::Unknown;
        };

        trace!("Dispatching {} from {}", message.kind, message.sender);

        match panic::catch_unwind(AssertUnwindSafe(|| handler(manager, message))) {
            Ok(Ok(Ok(()))) => Dispatch::Handled,
            Ok(Err(e)) => {
                warn!("{}", e);
                Dispatch::Malformed
            }
            Ok(Ok(Err(e))) => {
                error!(
                    "Handler for {} from {} failed: {:#}",
                    message.kind, message.sender, e
                );
                Dispatch::Failed
            }
            Err(payload) => {
                error!(
                    "Handler for {} from {} panicked: {}",
                    message.kind,
                    message.sender,
                    panic_message(payload.as_ref())
                );
                Dispatch::Failed
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
