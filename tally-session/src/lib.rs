//! # tally-session — Realtime room session layer
//!
//! Client-side session layer for a collaborative voting room: players join
//! a room over one persistent websocket, vote, see who else is connected,
//! and reset/reveal the round. The UI layer stays outside this crate and
//! talks to it through [`RoomSession`] and the [`SessionEvent`] stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  join_room / room_action   ┌─────────────┐
//! │ UI layer │ ─────────────────────────► │ RoomSession │
//! │ (extern) │ ◄───── SessionEvent ────── │             │
//! └──────────┘                            └──────┬──────┘
//!                                                │
//!                     ┌──────────────┬───────────┴──┬──────────────┐
//!                     ▼              ▼              ▼              ▼
//!               ┌──────────┐  ┌─────────────┐ ┌───────────┐ ┌──────────────┐
//!               │  Socket  │  │ RoomChannel │ │EventRouter│ │PresenceStore │
//!               │(reconnect│  │ (join state │ │ (dispatch │ │ (snapshot +  │
//!               │ + route) │  │  machine)   │ │  table)   │ │  diff merge) │
//!               └──────────┘  └─────────────┘ └───────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON array wire frames and reply parsing
//! - [`identity`] — session-scoped player and room identities
//! - [`socket`] — auto-reconnecting multiplexed websocket transport
//! - [`channel`] — per-topic join state machine and delivery
//! - [`presence`] — snapshot/diff presence merge
//! - [`router`] — event name dispatch table and typed session events
//! - [`session`] — the one object the UI layer holds
//! - [`prefs`] — best-effort persisted preference strings

pub mod channel;
pub mod identity;
pub mod prefs;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod socket;

// Re-exports for convenience
pub use channel::{ChannelState, RoomChannel};
pub use identity::{PlayerIdentity, RoomIdentity};
pub use prefs::PreferenceStore;
pub use presence::{PresenceDiff, PresenceEntry, PresenceMeta, PresenceState, PresenceStore};
pub use protocol::{Frame, Reply, SessionError};
pub use router::{EventRouter, OutgoingAction, SessionEvent};
pub use session::RoomSession;
pub use socket::{Socket, SocketConfig, SocketStatus};
