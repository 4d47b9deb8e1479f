//! Persistent multiplexed websocket transport.
//!
//! One `Socket` owns one connection to the server endpoint, parameterized
//! by the session's `player_id`. The driver task dials, pumps frames, and
//! on connection loss re-dials with bounded exponential backoff — no new
//! identity, no new channel objects. Channels are notified on every open
//! and close so they can rejoin automatically.
//!
//! ```text
//!            ┌────────────── driver task ──────────────┐
//! out_tx ───►│ outgoing mpsc ──► websocket sink        │
//!            │ websocket stream ──► decode ──► route   │──► per-topic
//!            │ heartbeat interval ──► "phoenix" topic  │    channel mpsc
//!            └─────────────────────────────────────────┘
//! ```
//!
//! Frames for a topic with no live binding are dropped; a channel that has
//! been unbound can never receive another frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{ChannelBindings, ChannelMsg, ChannelRuntime, RoomChannel};
use crate::identity::PlayerIdentity;
use crate::protocol::{Frame, SessionError, TOPIC_PHOENIX};
use crate::router::{EventRouter, SessionEvent};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Websocket endpoint, e.g. `ws://localhost:4000/socket/websocket`.
    pub endpoint: String,
    /// Interval between transport heartbeats while connected.
    pub heartbeat_interval: Duration,
    /// Initial reconnect backoff after a connection loss.
    pub reconnect_min: Duration,
    /// Backoff ceiling; doubling stops here.
    pub reconnect_max: Duration,
    /// How long a join may wait for its reply before resolving to Errored.
    pub join_timeout: Duration,
    /// Actions buffered per channel while not joined.
    pub pending_push_capacity: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:4000/socket/websocket".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_min: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            pending_push_capacity: 64,
        }
    }
}

/// Transport connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl SocketStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// The shared transport socket.
pub struct Socket {
    config: SocketConfig,
    player: PlayerIdentity,
    out_tx: mpsc::UnboundedSender<Frame>,
    out_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    bindings: ChannelBindings,
    status: Arc<AtomicU8>,
}

impl Socket {
    pub fn new(config: SocketConfig, player: PlayerIdentity) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            config,
            player,
            out_tx,
            out_rx: Some(out_rx),
            bindings: Arc::new(RwLock::new(HashMap::new())),
            status: Arc::new(AtomicU8::new(SocketStatus::Disconnected as u8)),
        }
    }

    /// Spawn the driver task and return immediately. The driver keeps
    /// redialing for the life of the socket; calling twice is an error.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        let Some(out_rx) = self.out_rx.take() else {
            return Err(SessionError::AlreadyConnected);
        };
        let url = format!(
            "{}?vsn=2.0.0&player_id={}",
            self.config.endpoint, self.player
        );
        tokio::spawn(run_socket(
            self.config.clone(),
            url,
            out_rx,
            self.bindings.clone(),
            self.status.clone(),
        ));
        Ok(())
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn player(&self) -> PlayerIdentity {
        self.player
    }

    /// Create a channel bound to `topic`, replacing any previous binding
    /// for the same topic. The channel rejoins by itself across reconnects.
    pub fn channel(
        &self,
        topic: impl Into<String>,
        params: Value,
        router: EventRouter,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> RoomChannel {
        RoomChannel::spawn(
            topic.into(),
            params,
            ChannelRuntime {
                router,
                events,
                out_tx: self.out_tx.clone(),
                bindings: self.bindings.clone(),
                join_timeout: self.config.join_timeout,
                pending_push_capacity: self.config.pending_push_capacity,
                socket_status: self.status.clone(),
            },
        )
    }
}

async fn run_socket(
    config: SocketConfig,
    url: String,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    bindings: ChannelBindings,
    status: Arc<AtomicU8>,
) {
    let mut backoff = config.reconnect_min;
    loop {
        status.store(SocketStatus::Connecting as u8, Ordering::SeqCst);
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => {
                log::info!("socket connected to {}", config.endpoint);
                backoff = config.reconnect_min;
                status.store(SocketStatus::Connected as u8, Ordering::SeqCst);
                notify_channels(&bindings, || ChannelMsg::SocketOpened);

                let finished = pump(&config, ws, &mut out_rx, &bindings).await;

                status.store(SocketStatus::Disconnected as u8, Ordering::SeqCst);
                notify_channels(&bindings, || ChannelMsg::SocketClosed);
                if finished {
                    // Socket owner dropped every sender; nothing to serve.
                    return;
                }
                log::warn!("socket connection lost, reconnecting");
            }
            Err(e) => {
                log::warn!("socket connect failed: {e}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

/// Pump one live connection until it drops. Returns `true` when the
/// outgoing channel is closed and the driver should exit for good.
async fn pump(
    config: &SocketConfig,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    out_rx: &mut mpsc::UnboundedReceiver<Frame>,
    bindings: &ChannelBindings,
) -> bool {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut heartbeat_ref: u64 = 0;

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(frame) => match frame.encode() {
                        Ok(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                return false;
                            }
                        }
                        Err(e) => log::warn!("dropping unencodable frame: {e}"),
                    },
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return true;
                    }
                }
            }
            _ = heartbeat.tick() => {
                heartbeat_ref += 1;
                let frame = Frame::heartbeat(heartbeat_ref.to_string());
                if let Ok(text) = frame.encode() {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return false;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => route(bindings, text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Ok(_)) => {} // ping/pong/binary: transport-level noise
                    Some(Err(e)) => {
                        log::warn!("websocket error: {e}");
                        return false;
                    }
                }
            }
        }
    }
}

fn route(bindings: &ChannelBindings, text: &str) {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("dropping malformed frame: {e}");
            return;
        }
    };
    if frame.topic == TOPIC_PHOENIX {
        // Heartbeat replies carry no channel state.
        return;
    }
    let Ok(map) = bindings.read() else {
        return;
    };
    match map.get(&frame.topic) {
        Some(tx) => {
            let _ = tx.send(ChannelMsg::Frame(frame));
        }
        None => log::debug!("no channel bound for topic {}", frame.topic),
    }
}

fn notify_channels(bindings: &ChannelBindings, make: impl Fn() -> ChannelMsg) {
    if let Ok(map) = bindings.read() {
        for tx in map.values() {
            let _ = tx.send(make());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config = SocketConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.reconnect_min < config.reconnect_max);
        assert!(config.pending_push_capacity > 0);
    }

    #[test]
    fn test_initial_status_disconnected() {
        let socket = Socket::new(SocketConfig::default(), PlayerIdentity::generate());
        assert_eq!(socket.status(), SocketStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_twice_is_an_error() {
        let mut socket = Socket::new(SocketConfig::default(), PlayerIdentity::generate());
        socket.connect().unwrap();
        assert!(matches!(
            socket.connect(),
            Err(SessionError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_channel_binds_topic() {
        let socket = Socket::new(SocketConfig::default(), PlayerIdentity::generate());
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let channel = socket.channel("room:1", json!({}), EventRouter::new(), event_tx);
        assert_eq!(channel.topic(), "room:1");
        assert!(socket.bindings.read().unwrap().contains_key("room:1"));
    }

    #[tokio::test]
    async fn test_rebinding_topic_replaces_previous_channel() {
        let socket = Socket::new(SocketConfig::default(), PlayerIdentity::generate());
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let _first = socket.channel("room:1", json!({}), EventRouter::new(), event_tx.clone());
        let _second = socket.channel("room:1", json!({}), EventRouter::new(), event_tx);
        assert_eq!(socket.bindings.read().unwrap().len(), 1);
    }
}
