//! Wire protocol for the room channel transport.
//!
//! Frames follow the Phoenix channels V2 format: a JSON array of five
//! elements sent as a websocket text message.
//!
//! ```text
//! ┌──────────┬─────────┬───────────┬───────────┬──────────┐
//! │ join_ref │ ref     │ topic     │ event     │ payload  │
//! │ str|null │ str|null│ string    │ string    │ object   │
//! └──────────┴─────────┴───────────┴───────────┴──────────┘
//! ```
//!
//! `join_ref` ties a frame to one join attempt on its topic; replies echo
//! the `ref` of the frame they answer. Reply payloads carry
//! `{"status": "ok"|"error", "response": …}`.

use serde_json::{json, Value};

/// Reserved channel events.
pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Presence events emitted by the server after a join.
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";

/// Application-domain events recognized by the session layer.
pub const EVENT_VOTE: &str = "vote";
pub const EVENT_RESET: &str = "reset";
pub const EVENT_REVEAL: &str = "reveal";

/// Reserved topic for transport-level traffic (heartbeats).
pub const TOPIC_PHOENIX: &str = "phoenix";

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Ref of the join message that opened this frame's channel.
    pub join_ref: Option<String>,
    /// Per-message ref, echoed back in replies.
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    /// Create a join frame for `topic`. The message ref doubles as the
    /// channel's join_ref for everything sent on it afterwards.
    pub fn join(topic: impl Into<String>, msg_ref: impl Into<String>, params: Value) -> Self {
        let msg_ref = msg_ref.into();
        Self {
            join_ref: Some(msg_ref.clone()),
            msg_ref: Some(msg_ref),
            topic: topic.into(),
            event: EVENT_JOIN.to_string(),
            payload: params,
        }
    }

    /// Create a leave frame for `topic`.
    pub fn leave(
        topic: impl Into<String>,
        join_ref: impl Into<String>,
        msg_ref: impl Into<String>,
    ) -> Self {
        Self {
            join_ref: Some(join_ref.into()),
            msg_ref: Some(msg_ref.into()),
            topic: topic.into(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
        }
    }

    /// Create an application event frame on a joined topic.
    pub fn event(
        topic: impl Into<String>,
        join_ref: impl Into<String>,
        msg_ref: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref: Some(join_ref.into()),
            msg_ref: Some(msg_ref.into()),
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create a transport heartbeat frame.
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref.into()),
            topic: TOPIC_PHOENIX.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
        }
    }

    /// Serialize to the JSON array wire format.
    pub fn encode(&self) -> Result<String, SessionError> {
        serde_json::to_string(&(
            &self.join_ref,
            &self.msg_ref,
            &self.topic,
            &self.event,
            &self.payload,
        ))
        .map_err(|e| SessionError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON array wire format.
    pub fn decode(text: &str) -> Result<Self, SessionError> {
        let (join_ref, msg_ref, topic, event, payload) =
            serde_json::from_str::<(Option<String>, Option<String>, String, String, Value)>(text)
                .map_err(|e| SessionError::Deserialization(e.to_string()))?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }

    /// Whether this frame is a reply to a previously sent message.
    pub fn is_reply(&self) -> bool {
        self.event == EVENT_REPLY
    }
}

/// Server reply to a sent frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(Value),
    Error(Value),
}

/// Parse a `phx_reply` payload into its status and response.
pub fn parse_reply(payload: &Value) -> Result<Reply, SessionError> {
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::Deserialization("reply missing status".to_string()))?;
    let response = payload.get("response").cloned().unwrap_or(Value::Null);
    match status {
        "ok" => Ok(Reply::Ok(response)),
        "error" => Ok(Reply::Error(response)),
        other => Err(SessionError::Deserialization(format!(
            "unknown reply status: {other}"
        ))),
    }
}

/// Session-layer errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    Serialization(String),
    Deserialization(String),
    AlreadyConnected,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::AlreadyConnected => write!(f, "Socket already connected"),
        }
    }
}

impl std::error::Error for SessionError {}
