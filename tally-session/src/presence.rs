//! Presence state tracking via snapshot/diff merge.
//!
//! The server sends one full snapshot (`presence_state`) per join, then an
//! incremental `presence_diff` on every membership change. Each presence key
//! (a player id) holds an ordered list of metas, one per live connection —
//! the same player with two open tabs has two metas under one key.
//!
//! ```text
//! join reply / presence_state          presence_diff
//!          │                                │
//!          ▼                                ▼
//!   sync_state(full) ──────────────► sync_diff({joins, leaves})
//!          │                                │
//!          └──────────► PresenceState ◄─────┘
//!                  (player_id → metas)
//! ```
//!
//! Diffs received before the snapshot for the current join are buffered and
//! replayed in arrival order once the snapshot lands; merging them into an
//! empty or stale state would fabricate membership.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One connection's metadata under a presence key.
///
/// `phx_ref` uniquely identifies the connection; remaining fields are
/// opaque application data carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub phx_ref: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl PresenceMeta {
    pub fn new(phx_ref: impl Into<String>) -> Self {
        Self {
            phx_ref: phx_ref.into(),
            fields: serde_json::Map::new(),
        }
    }
}

/// All live connections for one presence key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub metas: Vec<PresenceMeta>,
}

/// The merged presence map: player id → entry.
///
/// An identity with zero remaining metas is removed outright; no empty
/// entries are ever kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceState(pub HashMap<String, PresenceEntry>);

impl PresenceState {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.0.contains_key(player_id)
    }

    pub fn get(&self, player_id: &str) -> Option<&PresenceEntry> {
        self.0.get(player_id)
    }

    /// Iterate over connected player ids.
    pub fn players(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Incremental membership change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    #[serde(default)]
    pub joins: HashMap<String, PresenceEntry>,
    #[serde(default)]
    pub leaves: HashMap<String, PresenceEntry>,
}

/// Owns the merged presence state for one channel.
///
/// Created empty alongside its channel, replaced wholesale on snapshot,
/// mutated incrementally on diff, and destroyed with the channel.
#[derive(Debug, Default)]
pub struct PresenceStore {
    state: PresenceState,
    /// Whether the snapshot for the current join has been applied.
    synced: bool,
    /// Diffs that raced ahead of the snapshot, in arrival order.
    pending: VecDeque<PresenceDiff>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the state wholesale with a full snapshot, then replay any
    /// diffs that arrived before it, in order. Returns the merged state.
    pub fn sync_state(&mut self, full: PresenceState) -> &PresenceState {
        self.state = full;
        self.synced = true;
        let pending: Vec<PresenceDiff> = self.pending.drain(..).collect();
        for diff in pending {
            Self::apply_diff(&mut self.state, diff);
        }
        &self.state
    }

    /// Merge one diff. Returns the merged state, or `None` if the diff was
    /// buffered because no snapshot has been applied yet.
    pub fn sync_diff(&mut self, diff: PresenceDiff) -> Option<&PresenceState> {
        if !self.synced {
            log::debug!("buffering presence diff received before snapshot");
            self.pending.push_back(diff);
            return None;
        }
        Self::apply_diff(&mut self.state, diff);
        Some(&self.state)
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    /// Forget everything; the next join starts from a fresh snapshot.
    pub fn reset(&mut self) {
        self.state = PresenceState::default();
        self.synced = false;
        self.pending.clear();
    }

    fn apply_diff(state: &mut PresenceState, diff: PresenceDiff) {
        for (key, incoming) in diff.joins {
            let entry = state.0.entry(key).or_default();
            for meta in incoming.metas {
                // Same phx_ref joining twice is a no-op, not a duplicate.
                if !entry.metas.iter().any(|m| m.phx_ref == meta.phx_ref) {
                    entry.metas.push(meta);
                }
            }
        }
        for (key, leaving) in diff.leaves {
            let emptied = match state.0.get_mut(&key) {
                Some(entry) => {
                    entry
                        .metas
                        .retain(|m| !leaving.metas.iter().any(|l| l.phx_ref == m.phx_ref));
                    entry.metas.is_empty()
                }
                None => false,
            };
            if emptied {
                state.0.remove(&key);
            }
        }
    }
}
