//! CallEngine: the FSM coordinating PeerLink + AudioPipeline, per spec.md
//! §4.5. Commands are exposed as async methods; inbound wire messages and
//! timeouts are driven by the net task in `crate::tasks`.

pub mod events;
pub mod fsm;

use crate::audio::AudioPipeline;
use crate::peer::{PeerLink, PeerSession};
use crate::protocol::{Frame, MsgType};
pub use events::{CallEndReason, CallEvent};
pub use fsm::{Action, CallState, ConnState, Event, Transition};
use parking_lot::Mutex as PLMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const PING_INTERVAL_MS: i64 = 5_000;
pub const DEFAULT_RINGING_TIMEOUT_MS: i64 = 10_000;

pub struct CallEngine {
    state: PLMutex<CallState>,
    conn_state: PLMutex<ConnState>,
    session: PLMutex<Option<Arc<PeerSession>>>,
    peer_link: Arc<PeerLink>,
    pub audio: Arc<AudioPipeline>,
    event_tx: broadcast::Sender<CallEvent>,

    pub auto_answer: AtomicBool,
    pub ringing_timeout_ms: AtomicI64,
    ringing_start: AtomicI64,
    outgoing_start: AtomicI64,
    last_ping: AtomicI64,

    pending_connect: PLMutex<Option<(String, u16)>>,
    /// Name announced to the peer in our own outbound `START` (set once at
    /// construction). Distinct from `caller_name`, which holds the *remote*
    /// peer's announced name on an inbound `START` — conflating the two
    /// would let a past caller's name leak into our own outgoing frames.
    local_display_name: String,
    caller_name: PLMutex<String>,
}

impl CallEngine {
    pub fn new(
        peer_link: Arc<PeerLink>,
        audio: Arc<AudioPipeline>,
        auto_answer: bool,
        local_display_name: String,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            state: PLMutex::new(CallState::Idle),
            conn_state: PLMutex::new(ConnState::Disconnected),
            session: PLMutex::new(None),
            peer_link,
            audio,
            event_tx,
            auto_answer: AtomicBool::new(auto_answer),
            ringing_timeout_ms: AtomicI64::new(DEFAULT_RINGING_TIMEOUT_MS),
            ringing_start: AtomicI64::new(0),
            outgoing_start: AtomicI64::new(0),
            last_ping: AtomicI64::new(0),
            pending_connect: PLMutex::new(None),
            local_display_name,
            caller_name: PLMutex::new(String::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    pub fn state_label(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn session(&self) -> Option<Arc<PeerSession>> {
        self.session.lock().clone()
    }

    pub fn caller_name(&self) -> String {
        self.caller_name.lock().clone()
    }

    /// Requests a client-dial connect to `host:port` the next time the net
    /// task observes `Event::CmdStart`'s `Connect` action. Set before
    /// calling [`CallEngine::start`].
    pub fn set_dial_target(&self, host: String, port: u16) {
        *self.pending_connect.lock() = Some((host, port));
    }

    // ---- Commands ---------------------------------------------------------

    pub async fn start(&self) {
        self.apply(Event::CmdStart).await;
    }

    pub async fn stop(&self) {
        self.apply(Event::CmdStop).await;
    }

    pub async fn answer(&self) {
        self.apply(Event::CmdAnswer).await;
    }

    pub async fn decline(&self) {
        self.apply(Event::CmdDecline).await;
    }

    pub async fn toggle(&self) {
        match self.state() {
            CallState::Idle => self.start().await,
            CallState::Ringing => self.answer().await,
            CallState::Streaming | CallState::Answering | CallState::Outgoing => self.stop().await,
            CallState::Incoming => {}
        }
    }

    // ---- Inbound reaction ---------------------------------------------------

    /// Called by the net task for every frame successfully decoded from the
    /// active session. `AUDIO` payloads are handed to the pipeline before
    /// the FSM is stepped, since the FSM's own `Audio` arms only decide the
    /// state transition.
    pub async fn on_frame(&self, frame: Frame) {
        if let Some(msg_type) = crate::protocol::MsgType::from_byte(frame.header.msg_type) {
            if msg_type == MsgType::Audio {
                self.audio.on_remote_audio(&frame.payload);
            }
            if msg_type == MsgType::Error {
                let reason = frame
                    .payload
                    .first()
                    .copied()
                    .map(crate::protocol::ErrorReason::from_byte);
                warn!("peer sent ERROR: {:?}", reason);
            }
            self.apply(Event::Inbound {
                msg_type,
                flags: frame.header.flags,
                payload: frame.payload,
            })
            .await;
        } else {
            // Unknown type without framing damage: forward-compatible, just log.
            info!("ignoring unknown message type {}", frame.header.msg_type);
        }
    }

    pub async fn on_disconnected(&self) {
        self.apply(Event::Disconnected).await;
    }

    /// Called by the net task when a frame fails to decode cleanly (oversize
    /// header/payload, other framing damage). Distinct from
    /// [`CallEngine::on_disconnected`] so the call ends as
    /// `CallFailed{ProtocolError}` per spec.md §7, not a plain hangup.
    pub async fn on_protocol_error(&self) {
        self.apply(Event::ProtocolError).await;
    }

    /// Polled by the net task loop. Fires ringing/outgoing timeouts and the
    /// idle-keepalive PING per spec.md §4.5.
    pub async fn poll_timeouts(&self, now_ms: i64) {
        let state = self.state();
        let ringing_timeout = self.ringing_timeout_ms.load(Ordering::Relaxed);

        match state {
            CallState::Ringing => {
                if now_ms - self.ringing_start.load(Ordering::Relaxed) >= ringing_timeout {
                    self.apply(Event::RingingTimeout).await;
                    return;
                }
            }
            CallState::Outgoing => {
                if now_ms - self.outgoing_start.load(Ordering::Relaxed) >= ringing_timeout {
                    self.apply(Event::OutgoingTimeout).await;
                    return;
                }
            }
            _ => {}
        }

        let conn = *self.conn_state.lock();
        let streaming = state == CallState::Streaming;
        if matches!(conn, ConnState::Connected | ConnState::Streaming) && !streaming {
            let last = self.last_ping.load(Ordering::Relaxed);
            if now_ms - last >= PING_INTERVAL_MS {
                self.last_ping.store(now_ms, Ordering::Relaxed);
                if let Some(session) = self.session() {
                    if let Err(e) = self
                        .peer_link
                        .send(&session, MsgType::Ping.to_byte(), 0, &[])
                        .await
                    {
                        warn!("ping send failed: {e}");
                    }
                }
            }
        }
    }

    /// Accept policy per spec.md §4.5: only `Idle` or `Outgoing` may accept
    /// an inbound connection; anything else replies `ERROR{BUSY}` and closes
    /// (handled inside `PeerLink::try_accept` for the "already active"
    /// case — this additionally covers the FSM-state half of the policy for
    /// states where no session exists yet but the call isn't otherwise
    /// idle/outgoing, which should not happen given the invariants but is
    /// guarded defensively).
    pub fn accept_allowed(&self) -> bool {
        matches!(self.state(), CallState::Idle | CallState::Outgoing)
    }

    pub fn adopt_session(&self, session: Arc<PeerSession>) {
        *self.session.lock() = Some(session);
        *self.conn_state.lock() = ConnState::Connected;
    }

    // ---- Internals ------------------------------------------------------

    async fn apply(&self, event: Event) {
        let auto_answer = self.auto_answer.load(Ordering::Relaxed);
        let current = self.state();
        let transition: Transition = fsm::step(current, event, auto_answer);

        *self.state.lock() = transition.next;
        if transition.next == CallState::Streaming {
            *self.conn_state.lock() = ConnState::Streaming;
        }

        for action in transition.actions {
            self.run_action(action).await;
        }
    }

    async fn run_action(&self, action: Action) {
        match action {
            Action::Send { msg_type, flags, payload } => {
                if let Some(session) = self.session() {
                    if let Err(e) = self.peer_link.send(&session, msg_type, flags, &payload).await {
                        warn!("send failed: {e}");
                    }
                }
            }
            Action::Close => {
                self.peer_link_close_current().await;
            }
            Action::Connect => {
                let target = self.pending_connect.lock().clone();
                if let Some((host, port)) = target {
                    *self.conn_state.lock() = ConnState::Connecting;
                    match self.peer_link.connect(&host, port).await {
                        Ok(session) => {
                            self.adopt_session(session.clone());
                            if let Err(e) = self
                                .peer_link
                                .send(
                                    &session,
                                    MsgType::Start.to_byte(),
                                    0,
                                    self.local_display_name.as_bytes(),
                                )
                                .await
                            {
                                warn!("START send failed: {e}");
                            }
                        }
                        Err(_) => {
                            *self.conn_state.lock() = ConnState::Disconnected;
                            *self.state.lock() = CallState::Idle;
                            let _ = self
                                .event_tx
                                .send(CallEvent::for_end_reason(CallEndReason::Unreachable));
                        }
                    }
                }
            }
            Action::StartAudio => {
                self.audio.reset_for_call();
            }
            Action::StopAudio => {
                self.stop_audio_internal();
            }
            Action::Emit(event) => {
                let _ = self.event_tx.send(event);
            }
            Action::PublishCallerName(name) => {
                *self.caller_name.lock() = name;
            }
            Action::MarkRingingStart => {
                self.ringing_start.store(now_epoch_ms(), Ordering::Relaxed);
            }
            Action::MarkOutgoingStart => {
                self.outgoing_start.store(now_epoch_ms(), Ordering::Relaxed);
            }
        }
    }

    fn stop_audio_internal(&self) {
        // The pipeline's own rings are reset on the *next* entry to
        // Streaming (`reset_for_call`), not here — this only concerns
        // anything the engine itself owns around audio lifecycle. Kept as
        // a named hook so `call/mod.rs` stays the single place that
        // orders "stop audio" relative to "close socket" per spec.md §5.
    }

    async fn peer_link_close_current(&self) {
        if let Some(session) = self.session.lock().take() {
            self.peer_link.close(&session).await;
        }
        *self.conn_state.lock() = ConnState::Disconnected;
    }
}

fn now_epoch_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioPipeline;

    fn engine() -> CallEngine {
        let link = Arc::new(PeerLink::new());
        let audio = Arc::new(AudioPipeline::new(crate::audio::DEFAULT_REF_DELAY_MS, None));
        CallEngine::new(link, audio, false, "test".to_string())
    }

    #[tokio::test]
    async fn toggle_from_idle_starts_outgoing_without_dial_target() {
        let engine = engine();
        engine.toggle().await;
        // No dial target configured, so Connect silently does nothing but
        // the FSM still advances to Outgoing.
        assert_eq!(engine.state(), CallState::Outgoing);
    }

    #[tokio::test]
    async fn toggle_from_outgoing_stops() {
        let engine = engine();
        engine.start().await;
        engine.toggle().await;
        assert_eq!(engine.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn auto_answer_inbound_start_reaches_streaming() {
        let link = Arc::new(PeerLink::new());
        let audio = Arc::new(AudioPipeline::new(crate::audio::DEFAULT_REF_DELAY_MS, None));
        let engine = CallEngine::new(link, audio, true, "test".to_string());

        let frame = Frame {
            header: crate::protocol::Header {
                msg_type: MsgType::Start.to_byte(),
                flags: 0,
                length: 2,
            },
            payload: b"HA".to_vec(),
        };
        engine.on_frame(frame).await;
        assert_eq!(engine.state(), CallState::Streaming);
        assert_eq!(engine.caller_name(), "HA");
    }

    #[tokio::test]
    async fn manual_answer_flow_reaches_ringing_then_streaming() {
        let engine = engine();
        let frame = Frame {
            header: crate::protocol::Header {
                msg_type: MsgType::Start.to_byte(),
                flags: 0,
                length: 2,
            },
            payload: b"HA".to_vec(),
        };
        engine.on_frame(frame).await;
        assert_eq!(engine.state(), CallState::Ringing);

        engine.answer().await;
        assert_eq!(engine.state(), CallState::Streaming);
    }

    #[tokio::test]
    async fn ringing_timeout_returns_to_idle() {
        let engine = engine();
        engine.ringing_timeout_ms.store(0, Ordering::Relaxed);
        let frame = Frame {
            header: crate::protocol::Header {
                msg_type: MsgType::Start.to_byte(),
                flags: 0,
                length: 2,
            },
            payload: b"HA".to_vec(),
        };
        engine.on_frame(frame).await;
        assert_eq!(engine.state(), CallState::Ringing);

        engine.poll_timeouts(now_epoch_ms() + 1).await;
        assert_eq!(engine.state(), CallState::Idle);
    }
}
