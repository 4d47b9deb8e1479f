//! Room channel lifecycle and join state machine.
//!
//! One `RoomChannel` is one logical sub-connection scoped to a room topic,
//! multiplexed over the shared socket:
//!
//! ```text
//! Disconnected ──join()──► Joining ──ok──► Joined
//!                             │              │
//!                           error          socket loss
//!                             │              │
//!                             ▼              ▼
//!                          Errored      Disconnected ──(socket open)──► Joining
//! ```
//!
//! `join()` is idempotent: a second call while `Joining` or `Joined` sends
//! nothing and resolves to the same single outcome. A join rejected by the
//! server lands in `Errored` and is not retried at this layer; a join
//! interrupted by connection loss rejoins automatically once the transport
//! recovers, under a fresh join_ref so stale replies are ignored.
//!
//! The state machine itself (`ChannelCore`) is pure: it consumes frames and
//! commands, and returns the frames to send. The actor task spawned per
//! channel wires it to the socket and to the handler dispatch table.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::protocol::{
    parse_reply, Frame, Reply, EVENT_CLOSE, EVENT_ERROR, EVENT_PRESENCE_STATE, EVENT_REPLY,
};
use crate::router::{EventHandler, EventRouter, SessionEvent};
use crate::socket::SocketStatus;

/// Channel join states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Disconnected = 0,
    Joining = 1,
    Joined = 2,
    Errored = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Joining,
            2 => Self::Joined,
            3 => Self::Errored,
            _ => Self::Disconnected,
        }
    }
}

/// Messages consumed by a channel's actor task: frames and connectivity
/// notifications from the socket driver, commands from the handle.
pub(crate) enum ChannelMsg {
    Frame(Frame),
    SocketOpened,
    SocketClosed,
    Join,
    Push { event: String, payload: Value },
    On { event: String, handler: EventHandler },
    Leave,
}

/// Per-topic routing table shared between the socket driver and channels.
pub(crate) type ChannelBindings =
    Arc<RwLock<HashMap<String, mpsc::UnboundedSender<ChannelMsg>>>>;

/// Outcome of feeding one inbound frame to the state machine.
#[derive(Debug)]
enum Inbound {
    /// Join acknowledged; payload is the initial presence snapshot, and any
    /// pushes queued while not joined are flushed.
    JoinedOk { snapshot: Value, flushed: Vec<Frame> },
    /// Join rejected by the server.
    JoinError { reason: Value },
    /// A named event for the dispatch table.
    Event { event: String, payload: Value },
    /// Server closed the channel; fell back to `Disconnected`.
    Closed,
    /// Stale, out-of-state, or foreign frame.
    Ignored,
}

/// Pure join state machine for one topic.
///
/// Emits outbound frames as return values; never performs I/O.
struct ChannelCore {
    topic: String,
    params: Value,
    state: ChannelState,
    socket_open: bool,
    /// True between `join()` and a terminal error or `leave()`; drives
    /// automatic rejoin after connection loss.
    wants_join: bool,
    /// Ref of the current join attempt; frames from older attempts carry an
    /// older join_ref and are ignored.
    join_ref: u64,
    ref_counter: u64,
    /// Pushes issued while not `Joined`, flushed on the next successful join.
    pending: VecDeque<(String, Value)>,
    pending_capacity: usize,
}

impl ChannelCore {
    fn new(topic: String, params: Value, pending_capacity: usize) -> Self {
        Self {
            topic,
            params,
            state: ChannelState::Disconnected,
            socket_open: false,
            wants_join: false,
            join_ref: 0,
            ref_counter: 0,
            pending: VecDeque::new(),
            pending_capacity,
        }
    }

    fn state(&self) -> ChannelState {
        self.state
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn next_ref(&mut self) -> String {
        self.ref_counter += 1;
        self.ref_counter.to_string()
    }

    /// Request a join. No-op while already `Joining` or `Joined`; the frame
    /// is deferred if the socket is down and sent once it opens.
    fn join(&mut self) -> Option<Frame> {
        match self.state {
            ChannelState::Joining | ChannelState::Joined => None,
            _ => {
                self.wants_join = true;
                self.begin_join()
            }
        }
    }

    fn begin_join(&mut self) -> Option<Frame> {
        self.state = ChannelState::Joining;
        if !self.socket_open {
            return None;
        }
        let msg_ref = self.next_ref();
        self.join_ref = self.ref_counter;
        Some(Frame::join(self.topic.clone(), msg_ref, self.params.clone()))
    }

    fn socket_opened(&mut self) -> Option<Frame> {
        self.socket_open = true;
        if self.wants_join
            && matches!(self.state, ChannelState::Disconnected | ChannelState::Joining)
        {
            self.begin_join()
        } else {
            None
        }
    }

    fn socket_closed(&mut self) {
        self.socket_open = false;
        if matches!(self.state, ChannelState::Joined | ChannelState::Joining) {
            self.state = ChannelState::Disconnected;
        }
    }

    /// Rejoin after a server-side channel close, if still wanted.
    fn rejoin(&mut self) -> Option<Frame> {
        if self.wants_join && self.state == ChannelState::Disconnected {
            self.begin_join()
        } else {
            None
        }
    }

    /// Send an event now, or queue it until the next successful join.
    fn push(&mut self, event: String, payload: Value) -> Option<Frame> {
        if self.state == ChannelState::Joined && self.socket_open {
            let msg_ref = self.next_ref();
            return Some(Frame::event(
                self.topic.clone(),
                self.join_ref.to_string(),
                msg_ref,
                event,
                payload,
            ));
        }
        if self.pending.len() >= self.pending_capacity {
            log::warn!(
                "pending push queue full on {}, dropping oldest action",
                self.topic
            );
            self.pending.pop_front();
        }
        self.pending.push_back((event, payload));
        None
    }

    fn flush_pending(&mut self) -> Vec<Frame> {
        let queued: Vec<(String, Value)> = self.pending.drain(..).collect();
        queued
            .into_iter()
            .filter_map(|(event, payload)| self.push(event, payload))
            .collect()
    }

    /// Tear down: drop queued pushes and return to `Disconnected`, sending a
    /// leave frame when one can reach the server.
    fn leave(&mut self) -> Option<Frame> {
        self.wants_join = false;
        self.pending.clear();
        let frame = if self.socket_open
            && matches!(self.state, ChannelState::Joining | ChannelState::Joined)
        {
            let msg_ref = self.next_ref();
            Some(Frame::leave(
                self.topic.clone(),
                self.join_ref.to_string(),
                msg_ref,
            ))
        } else {
            None
        };
        self.state = ChannelState::Disconnected;
        frame
    }

    /// Resolve a join that never got a reply.
    fn join_timed_out(&mut self) -> bool {
        if self.state == ChannelState::Joining {
            self.state = ChannelState::Errored;
            self.wants_join = false;
            true
        } else {
            false
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Inbound {
        if frame.topic != self.topic {
            return Inbound::Ignored;
        }
        match frame.event.as_str() {
            EVENT_REPLY => self.handle_reply(frame),
            EVENT_ERROR | EVENT_CLOSE => {
                if matches!(self.state, ChannelState::Joined | ChannelState::Joining) {
                    self.state = ChannelState::Disconnected;
                    Inbound::Closed
                } else {
                    Inbound::Ignored
                }
            }
            _ => {
                // Handlers only fire while Joined, and only for the current
                // join attempt.
                if self.state != ChannelState::Joined {
                    return Inbound::Ignored;
                }
                let current = self.join_ref.to_string();
                if frame.join_ref.as_deref().is_some_and(|jr| jr != current) {
                    return Inbound::Ignored;
                }
                Inbound::Event {
                    event: frame.event,
                    payload: frame.payload,
                }
            }
        }
    }

    fn handle_reply(&mut self, frame: Frame) -> Inbound {
        if self.state != ChannelState::Joining {
            // Replies to pushes carry no channel-level state; ignored.
            return Inbound::Ignored;
        }
        let join_ref = self.join_ref.to_string();
        if frame.msg_ref.as_deref() != Some(join_ref.as_str()) {
            return Inbound::Ignored;
        }
        match parse_reply(&frame.payload) {
            Ok(Reply::Ok(snapshot)) => {
                self.state = ChannelState::Joined;
                let flushed = self.flush_pending();
                Inbound::JoinedOk { snapshot, flushed }
            }
            Ok(Reply::Error(reason)) => {
                self.state = ChannelState::Errored;
                self.wants_join = false;
                Inbound::JoinError { reason }
            }
            Err(e) => {
                log::warn!("malformed join reply on {}: {e}", self.topic);
                Inbound::Ignored
            }
        }
    }
}

/// Everything a channel actor needs from its socket and session.
pub(crate) struct ChannelRuntime {
    pub router: EventRouter,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub out_tx: mpsc::UnboundedSender<Frame>,
    pub bindings: ChannelBindings,
    pub join_timeout: Duration,
    pub pending_push_capacity: usize,
    pub socket_status: Arc<AtomicU8>,
}

/// Handle to a live room channel.
///
/// All methods return immediately; work happens on the channel's actor
/// task. After `leave()` the handle is inert and the actor winds down.
pub struct RoomChannel {
    topic: String,
    tx: mpsc::UnboundedSender<ChannelMsg>,
    state: Arc<AtomicU8>,
    detached: Arc<AtomicBool>,
}

impl RoomChannel {
    /// Bind a new channel for `topic` and spawn its actor task, replacing
    /// any previous binding for the same topic.
    pub(crate) fn spawn(topic: String, params: Value, rt: ChannelRuntime) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        match rt.bindings.write() {
            Ok(mut map) => {
                if map.insert(topic.clone(), tx.clone()).is_some() {
                    log::debug!("replacing channel binding for {topic}");
                }
            }
            Err(_) => log::warn!("channel bindings lock poisoned; {topic} will receive nothing"),
        }
        // Status is read only after the binding exists: a connect that
        // happened earlier is visible here, and one that happens later
        // reaches us through the driver's SocketOpened notification. A
        // duplicate SocketOpened before join() is a no-op in the core.
        if rt.socket_status.load(Ordering::SeqCst) == SocketStatus::Connected as u8 {
            let _ = tx.send(ChannelMsg::SocketOpened);
        }

        let state = Arc::new(AtomicU8::new(ChannelState::Disconnected as u8));
        let detached = Arc::new(AtomicBool::new(false));
        let core = ChannelCore::new(topic.clone(), params, rt.pending_push_capacity);
        tokio::spawn(run_channel(
            core,
            rt.router,
            rt.events,
            rt.out_tx,
            rx,
            tx.clone(),
            rt.bindings,
            state.clone(),
            detached.clone(),
            rt.join_timeout,
        ));

        Self {
            topic,
            tx,
            state,
            detached,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Request a join. Idempotent while a join is pending or established.
    pub fn join(&self) {
        let _ = self.tx.send(ChannelMsg::Join);
    }

    /// Register the handler for an event name (last registration wins).
    /// Valid in any state; handlers only fire while `Joined`.
    pub fn on(&self, event: impl Into<String>, handler: impl FnMut(Value) + Send + 'static) {
        let _ = self.tx.send(ChannelMsg::On {
            event: event.into(),
            handler: Box::new(handler),
        });
    }

    /// Send an event, or queue it until the next successful join.
    pub fn push(&self, event: impl Into<String>, payload: Value) {
        let _ = self.tx.send(ChannelMsg::Push {
            event: event.into(),
            payload,
        });
    }

    /// Tear the channel down. Takes effect immediately: no event queued
    /// behind this call will be delivered, even if already in flight.
    pub fn leave(&self) {
        self.detached.store(true, Ordering::SeqCst);
        let _ = self.tx.send(ChannelMsg::Leave);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_channel(
    mut core: ChannelCore,
    mut router: EventRouter,
    events: mpsc::UnboundedSender<SessionEvent>,
    out_tx: mpsc::UnboundedSender<Frame>,
    mut rx: mpsc::UnboundedReceiver<ChannelMsg>,
    self_tx: mpsc::UnboundedSender<ChannelMsg>,
    bindings: ChannelBindings,
    state_cell: Arc<AtomicU8>,
    detached: Arc<AtomicBool>,
    join_timeout: Duration,
) {
    let mut join_deadline: Option<tokio::time::Instant> = None;

    loop {
        let deadline = join_deadline;
        let wait_join = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures_util::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = wait_join => {
                join_deadline = None;
                if core.join_timed_out() {
                    log::warn!("join timed out on {}", core.topic());
                    let _ = events.send(SessionEvent::JoinFailed {
                        topic: core.topic().to_string(),
                        reason: json!({"reason": "timeout"}),
                    });
                }
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                // leave() detaches synchronously: anything queued behind it,
                // including frames already in flight, is dropped unseen.
                if detached.load(Ordering::SeqCst) && !matches!(msg, ChannelMsg::Leave) {
                    continue;
                }
                match msg {
                    ChannelMsg::Join => {
                        if let Some(frame) = core.join() {
                            send_frame(&out_tx, frame);
                            join_deadline = Some(tokio::time::Instant::now() + join_timeout);
                        }
                    }
                    ChannelMsg::Push { event, payload } => {
                        if let Some(frame) = core.push(event, payload) {
                            send_frame(&out_tx, frame);
                        }
                    }
                    ChannelMsg::On { event, handler } => router.on(event, handler),
                    ChannelMsg::Leave => {
                        if let Some(frame) = core.leave() {
                            send_frame(&out_tx, frame);
                        }
                        router.clear();
                        break;
                    }
                    ChannelMsg::SocketOpened => {
                        if let Some(frame) = core.socket_opened() {
                            send_frame(&out_tx, frame);
                            join_deadline = Some(tokio::time::Instant::now() + join_timeout);
                        }
                    }
                    ChannelMsg::SocketClosed => {
                        core.socket_closed();
                        join_deadline = None;
                    }
                    ChannelMsg::Frame(frame) => match core.handle_frame(frame) {
                        Inbound::JoinedOk { snapshot, flushed } => {
                            join_deadline = None;
                            log::info!("joined {}", core.topic());
                            let _ = events.send(SessionEvent::Joined {
                                topic: core.topic().to_string(),
                            });
                            if snapshot.is_object() {
                                router.dispatch(EVENT_PRESENCE_STATE, snapshot);
                            }
                            if !flushed.is_empty() {
                                log::info!(
                                    "replaying {} queued actions on {}",
                                    flushed.len(),
                                    core.topic()
                                );
                            }
                            for frame in flushed {
                                send_frame(&out_tx, frame);
                            }
                        }
                        Inbound::JoinError { reason } => {
                            join_deadline = None;
                            log::warn!("join rejected on {}: {reason}", core.topic());
                            let _ = events.send(SessionEvent::JoinFailed {
                                topic: core.topic().to_string(),
                                reason,
                            });
                        }
                        Inbound::Event { event, payload } => {
                            router.dispatch(&event, payload);
                        }
                        Inbound::Closed => {
                            join_deadline = None;
                            log::info!("channel {} closed by server", core.topic());
                            if let Some(frame) = core.rejoin() {
                                send_frame(&out_tx, frame);
                                join_deadline =
                                    Some(tokio::time::Instant::now() + join_timeout);
                            }
                        }
                        Inbound::Ignored => {}
                    },
                }
            }
        }
        state_cell.store(core.state() as u8, Ordering::SeqCst);
    }
    state_cell.store(core.state() as u8, Ordering::SeqCst);

    // Unbind on exit, unless a successor already replaced us.
    if let Ok(mut map) = bindings.write() {
        if map
            .get(core.topic())
            .is_some_and(|tx| tx.same_channel(&self_tx))
        {
            map.remove(core.topic());
        }
    }
}

fn send_frame(out_tx: &mpsc::UnboundedSender<Frame>, frame: Frame) {
    if out_tx.send(frame).is_err() {
        log::debug!("socket driver gone; frame dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EVENT_JOIN, EVENT_LEAVE};
    use serde_json::json;

    fn open_core(topic: &str) -> ChannelCore {
        let mut core = ChannelCore::new(topic.to_string(), json!({}), 8);
        core.socket_opened();
        core
    }

    fn ok_reply(topic: &str, msg_ref: &str, response: Value) -> Frame {
        Frame {
            join_ref: Some(msg_ref.to_string()),
            msg_ref: Some(msg_ref.to_string()),
            topic: topic.to_string(),
            event: EVENT_REPLY.to_string(),
            payload: json!({"status": "ok", "response": response}),
        }
    }

    fn error_reply(topic: &str, msg_ref: &str, reason: &str) -> Frame {
        Frame {
            join_ref: Some(msg_ref.to_string()),
            msg_ref: Some(msg_ref.to_string()),
            topic: topic.to_string(),
            event: EVENT_REPLY.to_string(),
            payload: json!({"status": "error", "response": {"reason": reason}}),
        }
    }

    fn event_frame(topic: &str, join_ref: &str, event: &str, payload: Value) -> Frame {
        Frame {
            join_ref: Some(join_ref.to_string()),
            msg_ref: None,
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        }
    }

    #[test]
    fn test_join_sends_single_frame() {
        let mut core = open_core("room:1");
        let frame = core.join().unwrap();
        assert_eq!(frame.event, EVENT_JOIN);
        assert_eq!(frame.topic, "room:1");
        assert_eq!(core.state(), ChannelState::Joining);

        // Second join while Joining sends nothing.
        assert!(core.join().is_none());
        assert_eq!(core.state(), ChannelState::Joining);
    }

    #[test]
    fn test_join_ok_transitions_to_joined() {
        let mut core = open_core("room:1");
        let join = core.join().unwrap();
        let reply = ok_reply("room:1", join.msg_ref.as_deref().unwrap(), json!({}));

        match core.handle_frame(reply) {
            Inbound::JoinedOk { snapshot, flushed } => {
                assert_eq!(snapshot, json!({}));
                assert!(flushed.is_empty());
            }
            other => panic!("expected JoinedOk, got {other:?}"),
        }
        assert_eq!(core.state(), ChannelState::Joined);

        // join() after Joined is still a no-op.
        assert!(core.join().is_none());
    }

    #[test]
    fn test_join_error_transitions_to_errored() {
        let mut core = open_core("room:1");
        let join = core.join().unwrap();
        let reply = error_reply("room:1", join.msg_ref.as_deref().unwrap(), "room_full");

        match core.handle_frame(reply) {
            Inbound::JoinError { reason } => {
                assert_eq!(reason, json!({"reason": "room_full"}))
            }
            other => panic!("expected JoinError, got {other:?}"),
        }
        assert_eq!(core.state(), ChannelState::Errored);

        // No delivery and no automatic retry after a rejected join.
        let frame = event_frame("room:1", "1", "vote", json!({}));
        assert!(matches!(core.handle_frame(frame), Inbound::Ignored));
        assert!(core.socket_opened().is_none());

        // A fresh join() is allowed and starts over.
        assert!(core.join().is_some());
        assert_eq!(core.state(), ChannelState::Joining);
    }

    #[test]
    fn test_stale_reply_ignored() {
        let mut core = open_core("room:1");
        core.join().unwrap();
        let stale = ok_reply("room:1", "99", json!({}));
        assert!(matches!(core.handle_frame(stale), Inbound::Ignored));
        assert_eq!(core.state(), ChannelState::Joining);
    }

    #[test]
    fn test_events_only_fire_while_joined() {
        let mut core = open_core("room:1");
        let join = core.join().unwrap();

        let early = event_frame("room:1", "1", "vote", json!({"value": 5}));
        assert!(matches!(core.handle_frame(early), Inbound::Ignored));

        let reply = ok_reply("room:1", join.msg_ref.as_deref().unwrap(), json!({}));
        core.handle_frame(reply);

        let frame = event_frame("room:1", "1", "vote", json!({"value": 5}));
        match core.handle_frame(frame) {
            Inbound::Event { event, payload } => {
                assert_eq!(event, "vote");
                assert_eq!(payload, json!({"value": 5}));
            }
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn test_foreign_topic_and_stale_join_ref_ignored() {
        let mut core = open_core("room:1");
        let join = core.join().unwrap();
        core.handle_frame(ok_reply("room:1", join.msg_ref.as_deref().unwrap(), json!({})));

        let foreign = event_frame("room:2", "1", "vote", json!({}));
        assert!(matches!(core.handle_frame(foreign), Inbound::Ignored));

        let stale = event_frame("room:1", "42", "vote", json!({}));
        assert!(matches!(core.handle_frame(stale), Inbound::Ignored));
    }

    #[test]
    fn test_push_while_joined_carries_action_verbatim() {
        let mut core = open_core("room:1");
        let join = core.join().unwrap();
        core.handle_frame(ok_reply("room:1", join.msg_ref.as_deref().unwrap(), json!({})));

        let frame = core.push("vote".to_string(), json!({"value": 5})).unwrap();
        assert_eq!(frame.event, "vote");
        assert_eq!(frame.payload, json!({"value": 5}));
        assert_eq!(frame.topic, "room:1");
        assert_eq!(frame.join_ref, join.msg_ref);
    }

    #[test]
    fn test_push_while_joining_queued_then_flushed() {
        let mut core = open_core("room:1");
        let join = core.join().unwrap();
        assert!(core.push("vote".to_string(), json!({"value": 3})).is_none());
        assert!(core.push("reveal".to_string(), json!({})).is_none());

        let reply = ok_reply("room:1", join.msg_ref.as_deref().unwrap(), json!({}));
        match core.handle_frame(reply) {
            Inbound::JoinedOk { flushed, .. } => {
                assert_eq!(flushed.len(), 2);
                assert_eq!(flushed[0].event, "vote");
                assert_eq!(flushed[1].event, "reveal");
            }
            other => panic!("expected JoinedOk, got {other:?}"),
        }
    }

    #[test]
    fn test_pending_queue_evicts_oldest() {
        let mut core = ChannelCore::new("room:1".to_string(), json!({}), 2);
        core.push("a".to_string(), json!(1));
        core.push("b".to_string(), json!(2));
        core.push("c".to_string(), json!(3));
        assert_eq!(core.pending.len(), 2);
        assert_eq!(
            core.pending.iter().map(|(e, _)| e.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }

    #[test]
    fn test_socket_loss_and_automatic_rejoin() {
        let mut core = open_core("room:1");
        let first = core.join().unwrap();
        core.handle_frame(ok_reply("room:1", first.msg_ref.as_deref().unwrap(), json!({})));
        assert_eq!(core.state(), ChannelState::Joined);

        core.socket_closed();
        assert_eq!(core.state(), ChannelState::Disconnected);

        // Reconnect rejoins under a fresh join_ref.
        let rejoin = core.socket_opened().unwrap();
        assert_eq!(rejoin.event, EVENT_JOIN);
        assert_ne!(rejoin.msg_ref, first.msg_ref);
        assert_eq!(core.state(), ChannelState::Joining);

        // A reply to the first join is now stale.
        let stale = ok_reply("room:1", first.msg_ref.as_deref().unwrap(), json!({}));
        assert!(matches!(core.handle_frame(stale), Inbound::Ignored));
    }

    #[test]
    fn test_join_deferred_until_socket_opens() {
        let mut core = ChannelCore::new("room:1".to_string(), json!({}), 8);
        assert!(core.join().is_none());
        assert_eq!(core.state(), ChannelState::Joining);

        let frame = core.socket_opened().unwrap();
        assert_eq!(frame.event, EVENT_JOIN);
    }

    #[test]
    fn test_server_close_triggers_rejoin() {
        let mut core = open_core("room:1");
        let join = core.join().unwrap();
        core.handle_frame(ok_reply("room:1", join.msg_ref.as_deref().unwrap(), json!({})));

        let close = event_frame("room:1", "1", EVENT_CLOSE, json!({}));
        assert!(matches!(core.handle_frame(close), Inbound::Closed));
        assert_eq!(core.state(), ChannelState::Disconnected);
        assert!(core.rejoin().is_some());
    }

    #[test]
    fn test_leave_sends_frame_and_clears_queue() {
        let mut core = open_core("room:1");
        let join = core.join().unwrap();
        core.handle_frame(ok_reply("room:1", join.msg_ref.as_deref().unwrap(), json!({})));

        let frame = core.leave().unwrap();
        assert_eq!(frame.event, EVENT_LEAVE);
        assert_eq!(core.state(), ChannelState::Disconnected);

        // Left channels do not rejoin when the socket cycles.
        assert!(core.socket_opened().is_none());
        assert_eq!(core.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_leave_while_disconnected_sends_nothing() {
        let mut core = ChannelCore::new("room:1".to_string(), json!({}), 8);
        core.push("vote".to_string(), json!(1));
        assert!(core.leave().is_none());
        assert!(core.pending.is_empty());
    }

    #[test]
    fn test_join_timeout_resolves_to_errored() {
        let mut core = open_core("room:1");
        core.join().unwrap();
        assert!(core.join_timed_out());
        assert_eq!(core.state(), ChannelState::Errored);

        // Only a pending join can time out.
        assert!(!core.join_timed_out());
    }

    fn runtime(
        bindings: &ChannelBindings,
        out_tx: mpsc::UnboundedSender<Frame>,
        events: mpsc::UnboundedSender<SessionEvent>,
        status: SocketStatus,
    ) -> ChannelRuntime {
        ChannelRuntime {
            router: EventRouter::new(),
            events,
            out_tx,
            bindings: bindings.clone(),
            join_timeout: Duration::from_secs(10),
            pending_push_capacity: 8,
            socket_status: Arc::new(AtomicU8::new(status as u8)),
        }
    }

    #[tokio::test]
    async fn test_spawned_channel_unbinds_on_leave() {
        let bindings: ChannelBindings = Arc::new(RwLock::new(HashMap::new()));
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let channel = RoomChannel::spawn(
            "room:1".to_string(),
            json!({}),
            runtime(&bindings, out_tx, event_tx, SocketStatus::Disconnected),
        );
        assert_eq!(channel.topic(), "room:1");
        assert!(bindings.read().unwrap().contains_key("room:1"));

        channel.leave();
        for _ in 0..100 {
            if !bindings.read().unwrap().contains_key("room:1") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("channel binding not removed after leave()");
    }

    #[tokio::test]
    async fn test_in_flight_event_not_delivered_after_leave() {
        let bindings: ChannelBindings = Arc::new(RwLock::new(HashMap::new()));
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let channel = RoomChannel::spawn(
            "room:1".to_string(),
            json!({}),
            runtime(&bindings, out_tx, event_tx, SocketStatus::Connected),
        );

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        channel.on("vote", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        channel.join();

        // The pre-seeded SocketOpened consumes no ref, so the join goes
        // out as ref "1"; drive the channel to Joined and deliver one vote.
        let inbound = bindings.read().unwrap().get("room:1").cloned().unwrap();
        inbound
            .send(ChannelMsg::Frame(ok_reply("room:1", "1", json!({}))))
            .unwrap();
        inbound
            .send(ChannelMsg::Frame(event_frame(
                "room:1",
                "1",
                "vote",
                json!({"value": 5}),
            )))
            .unwrap();
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A frame already queued when leave() runs must never reach a
        // handler, even though the actor has not consumed it yet.
        inbound
            .send(ChannelMsg::Frame(event_frame(
                "room:1",
                "1",
                "vote",
                json!({"value": 8}),
            )))
            .unwrap();
        channel.leave();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_sees_connect_that_raced_ahead_of_binding() {
        let bindings: ChannelBindings = Arc::new(RwLock::new(HashMap::new()));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let rt = runtime(&bindings, out_tx, event_tx, SocketStatus::Disconnected);

        // Connection established before the binding exists: the driver's
        // SocketOpened notification cannot have reached this channel, so
        // spawn must pick the status up on its own.
        rt.socket_status
            .store(SocketStatus::Connected as u8, Ordering::SeqCst);
        let channel = RoomChannel::spawn("room:1".to_string(), json!({}), rt);
        channel.join();

        for _ in 0..100 {
            if let Ok(frame) = out_rx.try_recv() {
                assert_eq!(frame.event, EVENT_JOIN);
                assert_eq!(channel.state(), ChannelState::Joining);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("join frame never sent despite connected socket");
    }
}
