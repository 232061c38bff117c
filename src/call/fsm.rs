//! The call finite state machine, kept as one exhaustive function keyed by
//! `(state, event)` per spec.md §9's DESIGN NOTES — every edge lives here,
//! not scattered across message handlers, so the transition table is
//! auditable in one place.

use super::events::{CallEndReason, CallEvent};
use crate::protocol::{ErrorReason, MsgType, FLAG_NO_RING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    Ringing,
    Answering,
    Streaming,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Outgoing => "outgoing",
            CallState::Incoming => "incoming",
            CallState::Ringing => "ringing",
            CallState::Answering => "answering",
            CallState::Streaming => "streaming",
        }
    }
}

/// Transport-level view of the connection, tracked alongside `CallState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
}

/// Inputs to the FSM: UI commands, inbound wire messages, and timers.
#[derive(Debug, Clone)]
pub enum Event {
    CmdStart,
    CmdStop,
    CmdAnswer,
    CmdDecline,
    Inbound {
        msg_type: MsgType,
        flags: u8,
        payload: Vec<u8>,
    },
    Disconnected,
    ProtocolError,
    RingingTimeout,
    OutgoingTimeout,
}

/// Side effects the engine must carry out after a transition. Kept separate
/// from the state itself so `step` stays a pure function.
#[derive(Debug, Clone)]
pub enum Action {
    Send { msg_type: u8, flags: u8, payload: Vec<u8> },
    Close,
    Connect,
    StartAudio,
    StopAudio,
    Emit(CallEvent),
    PublishCallerName(String),
    MarkRingingStart,
    MarkOutgoingStart,
}

#[derive(Debug)]
pub struct Transition {
    pub next: CallState,
    pub actions: Vec<Action>,
}

fn goto(next: CallState, actions: Vec<Action>) -> Transition {
    Transition { next, actions }
}

fn hangup(reason: CallEndReason, mut actions: Vec<Action>) -> Transition {
    actions.push(Action::StopAudio);
    actions.push(Action::Close);
    actions.push(Action::Emit(CallEvent::for_end_reason(reason)));
    goto(CallState::Idle, actions)
}

fn error_payload(reason: ErrorReason) -> Vec<u8> {
    vec![reason as u8]
}

/// Advances the FSM by one event. `auto_answer` gates the `Idle`+`START`
/// (ring-requested) branch.
pub fn step(state: CallState, event: Event, auto_answer: bool) -> Transition {
    use CallState::*;

    match (state, event) {
        // ---- Commands --------------------------------------------------
        (Idle, Event::CmdStart) => goto(
            Outgoing,
            vec![Action::MarkOutgoingStart, Action::Connect, Action::Emit(CallEvent::OutgoingCall)],
        ),
        // `start()` is only meaningful from `Idle`; elsewhere it's a no-op.
        (s, Event::CmdStart) => goto(s, vec![]),

        // Nothing to hang up on if we're already idle.
        (Idle, Event::CmdStop) => goto(Idle, vec![]),
        (_, Event::CmdStop) => hangup(
            CallEndReason::LocalHangup,
            vec![Action::Send {
                msg_type: MsgType::Stop.to_byte(),
                flags: 0,
                payload: vec![],
            }],
        ),

        (Ringing, Event::CmdAnswer) => goto(
            Streaming,
            vec![
                Action::Send {
                    msg_type: MsgType::Answer.to_byte(),
                    flags: 0,
                    payload: vec![],
                },
                Action::StartAudio,
                Action::Emit(CallEvent::Answered),
                Action::Emit(CallEvent::Streaming),
            ],
        ),

        (Ringing, Event::CmdDecline) => hangup(
            CallEndReason::Declined,
            vec![Action::Send {
                msg_type: MsgType::Error.to_byte(),
                flags: 0,
                payload: error_payload(ErrorReason::Busy),
            }],
        ),

        // ---- Inbound AUDIO: drives Outgoing -> Streaming ("peer answered") --
        // The raw payload has already been handed to the pipeline's
        // `on_remote_audio` by the caller before `step` runs; this arm only
        // decides the state transition.
        (Outgoing, Event::Inbound { msg_type: MsgType::Audio, .. }) => goto(
            Streaming,
            vec![Action::StartAudio, Action::Emit(CallEvent::Streaming)],
        ),

        // ---- Inbound START ------------------------------------------------
        (Idle, Event::Inbound { msg_type: MsgType::Start, flags, payload }) => {
            if flags & FLAG_NO_RING != 0 {
                goto(
                    Outgoing,
                    vec![
                        Action::StartAudio,
                        Action::Send {
                            msg_type: MsgType::Pong.to_byte(),
                            flags: 0,
                            payload: vec![],
                        },
                        Action::Emit(CallEvent::OutgoingCall),
                    ],
                )
            } else if auto_answer {
                goto(
                    Streaming,
                    vec![
                        Action::PublishCallerName(String::from_utf8_lossy(&payload).into_owned()),
                        Action::StartAudio,
                        Action::Send {
                            msg_type: MsgType::Pong.to_byte(),
                            flags: 0,
                            payload: vec![],
                        },
                        Action::Emit(CallEvent::Answered),
                        Action::Emit(CallEvent::Streaming),
                    ],
                )
            } else {
                goto(
                    Ringing,
                    vec![
                        Action::PublishCallerName(String::from_utf8_lossy(&payload).into_owned()),
                        Action::MarkRingingStart,
                        Action::Send {
                            msg_type: MsgType::Ring.to_byte(),
                            flags: 0,
                            payload: vec![],
                        },
                        Action::Emit(CallEvent::IncomingCall {
                            caller_name: String::from_utf8_lossy(&payload).into_owned(),
                        }),
                        Action::Emit(CallEvent::Ringing),
                    ],
                )
            }
        }

        // ---- Inbound STOP: remote hangup from any state -----------------
        (_, Event::Inbound { msg_type: MsgType::Stop, .. }) => hangup(CallEndReason::RemoteHangup, vec![]),

        // ---- Inbound PING: keepalive reply, no state change -------------
        // A PING can only arrive over an active session, so `Idle` never
        // sees one in practice; replying is harmless either way.
        (s, Event::Inbound { msg_type: MsgType::Ping, .. }) => goto(
            s,
            vec![Action::Send {
                msg_type: MsgType::Pong.to_byte(),
                flags: 0,
                payload: vec![],
            }],
        ),

        // ---- Inbound PONG: dual meaning disambiguated by state -----------
        // `Outgoing` means we sent START as the caller and are waiting for
        // either an `ANSWER` or an auto-answering `PONG`; any other state
        // treats PONG as a plain keepalive reply with no transition.
        (Outgoing, Event::Inbound { msg_type: MsgType::Pong, .. }) => {
            goto(Streaming, vec![Action::StartAudio, Action::Emit(CallEvent::Streaming)])
        }
        (s, Event::Inbound { msg_type: MsgType::Pong, .. }) => goto(s, vec![]),

        // ---- Inbound ANSWER ----------------------------------------------
        (Outgoing, Event::Inbound { msg_type: MsgType::Answer, .. }) => goto(
            Streaming,
            vec![
                Action::StartAudio,
                Action::Send {
                    msg_type: MsgType::Pong.to_byte(),
                    flags: 0,
                    payload: vec![],
                },
                Action::Emit(CallEvent::Streaming),
            ],
        ),
        (Ringing, Event::Inbound { msg_type: MsgType::Answer, .. }) => goto(
            Streaming,
            vec![
                Action::StartAudio,
                Action::Send {
                    msg_type: MsgType::Pong.to_byte(),
                    flags: 0,
                    payload: vec![],
                },
                Action::Emit(CallEvent::Answered),
                Action::Emit(CallEvent::Streaming),
            ],
        ),

        // ---- Inbound ERROR{BUSY} while dialing out: the callee is already
        // in a call with someone else. Ends the dial attempt immediately
        // rather than waiting out the outgoing timeout.
        (Outgoing, Event::Inbound { msg_type: MsgType::Error, payload, .. })
            if payload.first().copied().map(ErrorReason::from_byte) == Some(ErrorReason::Busy) =>
        {
            hangup(CallEndReason::Busy, vec![])
        }

        // ---- Inbound ERROR: logged by caller, no transition by default --
        (s, Event::Inbound { msg_type: MsgType::Error, .. }) => goto(s, vec![]),

        // AUDIO received in any other connected state: enqueue only; the
        // caller is responsible for handing the payload to the pipeline
        // before this function is invoked (see call/mod.rs).
        (s, Event::Inbound { msg_type: MsgType::Audio, .. }) => goto(s, vec![]),

        // Anything else not named above (e.g. a second START while already
        // mid-call, a RING we'd only ever send ourselves, an ANSWER outside
        // Outgoing/Ringing) is forward-compatible noise: ignored, no
        // transition. Unknown-type framing damage is caught earlier by the
        // protocol decoder, not here.
        (s, Event::Inbound { .. }) => goto(s, vec![]),

        // ---- Disconnect detection -----------------------------------------
        (Idle, Event::Disconnected) => goto(Idle, vec![]),
        (_, Event::Disconnected) => hangup(CallEndReason::RemoteHangup, vec![]),

        // ---- Protocol violation: oversize frame or other decode-level ----
        // damage (spec.md §7). Distinct from a clean `Disconnected`/`STOP`
        // teardown so the observable lands on `CallFailed{ProtocolError}`,
        // not `Hangup`.
        (Idle, Event::ProtocolError) => goto(Idle, vec![]),
        (_, Event::ProtocolError) => hangup(CallEndReason::ProtocolError, vec![]),

        // ---- Timeouts -------------------------------------------------------
        (Ringing, Event::RingingTimeout) => hangup(
            CallEndReason::Timeout,
            vec![Action::Send {
                msg_type: MsgType::Stop.to_byte(),
                flags: 0,
                payload: vec![],
            }],
        ),
        (Outgoing, Event::OutgoingTimeout) => hangup(
            CallEndReason::Timeout,
            vec![Action::Send {
                msg_type: MsgType::Stop.to_byte(),
                flags: 0,
                payload: vec![],
            }],
        ),
        (s, Event::RingingTimeout) | (s, Event::OutgoingTimeout) => goto(s, vec![]),

        // Commands that don't apply in the current state are no-ops; the
        // public command API (call/mod.rs) is expected to have already
        // dispatched via `toggle()`'s state-aware routing, so reaching here
        // means a direct command call was simply invalid for this state.
        (s, Event::CmdAnswer) | (s, Event::CmdDecline) => goto(s, vec![]),
    }
}
