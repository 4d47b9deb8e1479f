//! Bidirectional event routing between the wire and the application.
//!
//! Inbound: a dispatch table maps each recognized event name to exactly one
//! handler — last registration wins, unknown names are dropped without
//! error. Outbound: an `OutgoingAction` from the UI layer is pushed verbatim
//! as a wire event named after its `type`; no validation happens here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::{PresenceDiff, PresenceState};

/// Handler invoked with the raw payload of one inbound event.
pub type EventHandler = Box<dyn FnMut(Value) + Send>;

/// Typed notifications delivered to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Merged presence after a snapshot (including replayed diffs).
    PresenceState(PresenceState),
    /// One applied diff plus the merged state after it.
    PresenceDiff {
        diff: PresenceDiff,
        state: PresenceState,
    },
    Vote(Value),
    Reset(Value),
    Reveal(Value),
    /// The room channel reached `Joined`.
    Joined { topic: String },
    /// The server rejected the join, or it timed out.
    JoinFailed { topic: String, reason: Value },
}

/// Generic application action, sent as wire event `type` with body `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl OutgoingAction {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Dispatch table from event name to its single registered handler.
///
/// Owned by the channel it routes for; cleared when the channel leaves so a
/// torn-down channel can never deliver again.
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<String, EventHandler>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an event name. Last registration wins.
    pub fn on(&mut self, event: impl Into<String>, handler: EventHandler) {
        self.handlers.insert(event.into(), handler);
    }

    /// Drop the handler for an event name.
    pub fn off(&mut self, event: &str) {
        self.handlers.remove(event);
    }

    /// Drop all handlers.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn recognizes(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Dispatch one inbound event. Returns whether a handler was found;
    /// unrecognized events are dropped silently.
    pub fn dispatch(&mut self, event: &str, payload: Value) -> bool {
        match self.handlers.get_mut(event) {
            Some(handler) => {
                handler(payload);
                true
            }
            None => {
                log::debug!("dropping unrecognized event: {event}");
                false
            }
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
