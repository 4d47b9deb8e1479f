//! The room session: one socket, one active channel, one presence store.
//!
//! `RoomSession` is the explicit object handed to the UI layer in place of
//! process-wide globals. It mints the player identity once, owns the
//! transport, and guarantees at most one live room channel: joining a new
//! room tears the previous one down first, so a superseded channel can
//! never deliver into its successor.
//!
//! ```text
//! UI layer ──join_room/room_action──► RoomSession
//!                                        │
//!                         Socket ── RoomChannel ── EventRouter
//!                                        │              │
//!                                   PresenceStore   SessionEvent mpsc
//!                                                       │
//! UI layer ◄────────────────── take_event_rx() ─────────┘
//! ```

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;

use crate::channel::{ChannelState, RoomChannel};
use crate::identity::{PlayerIdentity, RoomIdentity};
use crate::presence::{PresenceDiff, PresenceState, PresenceStore};
use crate::protocol::{
    SessionError, EVENT_PRESENCE_DIFF, EVENT_PRESENCE_STATE, EVENT_RESET, EVENT_REVEAL, EVENT_VOTE,
};
use crate::router::{EventRouter, OutgoingAction, SessionEvent};
use crate::socket::{Socket, SocketConfig, SocketStatus};

/// One page session: identity, transport, and the active room.
pub struct RoomSession {
    player: PlayerIdentity,
    socket: Socket,
    active: Option<RoomChannel>,
    room: Option<RoomIdentity>,
    presence: Arc<Mutex<PresenceStore>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl RoomSession {
    /// Build a session with a freshly generated player identity.
    pub fn new(config: SocketConfig) -> Self {
        let player = PlayerIdentity::generate();
        let socket = Socket::new(config, player);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            player,
            socket,
            active: None,
            room: None,
            presence: Arc::new(Mutex::new(PresenceStore::new())),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Start the transport. Returns immediately; channels join once the
    /// connection is up.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        self.socket.connect()
    }

    /// Join a room, leaving the current one first if any.
    ///
    /// The superseded channel's handlers are unregistered before the new
    /// join is issued; in-flight events for the old room are not delivered.
    pub fn join_room(&mut self, room: &RoomIdentity) {
        if let Some(prev) = self.active.take() {
            log::info!("leaving {} for {}", prev.topic(), room.topic());
            prev.leave();
        }

        // Fresh presence store per channel lifecycle.
        let presence = Arc::new(Mutex::new(PresenceStore::new()));
        self.presence = presence.clone();

        let router = wire_router(&self.event_tx, &presence);
        let channel = self.socket.channel(
            room.topic(),
            json!({}),
            router,
            self.event_tx.clone(),
        );
        channel.join();
        self.active = Some(channel);
        self.room = Some(room.clone());
    }

    /// Leave the current room, if any.
    pub fn leave_room(&mut self) {
        if let Some(channel) = self.active.take() {
            channel.leave();
        }
        self.room = None;
        if let Ok(mut store) = self.presence.lock() {
            store.reset();
        }
    }

    /// Forward a UI action onto the active channel, verbatim.
    pub fn room_action(&self, action: OutgoingAction) {
        match &self.active {
            Some(channel) => channel.push(action.kind, action.data),
            None => log::warn!("room action {:?} with no active room", action.kind),
        }
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn player(&self) -> PlayerIdentity {
        self.player
    }

    pub fn room(&self) -> Option<&RoomIdentity> {
        self.room.as_ref()
    }

    /// Join state of the active channel, if a room has been requested.
    pub fn room_state(&self) -> Option<ChannelState> {
        self.active.as_ref().map(RoomChannel::state)
    }

    pub fn socket_status(&self) -> SocketStatus {
        self.socket.status()
    }

    /// Snapshot of the merged presence state.
    pub fn presence(&self) -> PresenceState {
        self.presence
            .lock()
            .map(|store| store.state().clone())
            .unwrap_or_default()
    }
}

/// Build the dispatch table for one room channel: presence events feed the
/// store before the application sees merged state; domain events pass
/// through with their payloads untouched.
fn wire_router(
    events: &mpsc::UnboundedSender<SessionEvent>,
    presence: &Arc<Mutex<PresenceStore>>,
) -> EventRouter {
    let mut router = EventRouter::new();

    {
        let tx = events.clone();
        let store = presence.clone();
        router.on(
            EVENT_PRESENCE_STATE,
            Box::new(move |payload| {
                let full: PresenceState = match serde_json::from_value(payload) {
                    Ok(full) => full,
                    Err(e) => {
                        log::warn!("dropping malformed presence_state: {e}");
                        return;
                    }
                };
                let merged = match store.lock() {
                    Ok(mut guard) => guard.sync_state(full).clone(),
                    Err(_) => return,
                };
                let _ = tx.send(SessionEvent::PresenceState(merged));
            }),
        );
    }

    {
        let tx = events.clone();
        let store = presence.clone();
        router.on(
            EVENT_PRESENCE_DIFF,
            Box::new(move |payload| {
                let diff: PresenceDiff = match serde_json::from_value(payload) {
                    Ok(diff) => diff,
                    Err(e) => {
                        log::warn!("dropping malformed presence_diff: {e}");
                        return;
                    }
                };
                let merged = match store.lock() {
                    Ok(mut guard) => guard.sync_diff(diff.clone()).cloned(),
                    Err(_) => return,
                };
                // Diffs that raced ahead of the snapshot surface later, as
                // part of the merged snapshot state.
                if let Some(state) = merged {
                    let _ = tx.send(SessionEvent::PresenceDiff { diff, state });
                }
            }),
        );
    }

    let domain: [(&str, fn(serde_json::Value) -> SessionEvent); 3] = [
        (EVENT_VOTE, SessionEvent::Vote),
        (EVENT_RESET, SessionEvent::Reset),
        (EVENT_REVEAL, SessionEvent::Reveal),
    ];
    for (event, make) in domain {
        let tx = events.clone();
        router.on(
            event,
            Box::new(move |payload| {
                let _ = tx.send(make(payload));
            }),
        );
    }

    router
}
