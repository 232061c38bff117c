//! Call lifecycle reasons and the events published on every FSM edge.
//!
//! Modeled after the `CallEvent`/`CallState` split in the pack's reference
//! `call_engine/engine.rs`: a `broadcast::Sender<CallEvent>` fed by the
//! engine, subscribable by as many listeners (UI, logging) as care.

use super::fsm::CallState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    Timeout,
    Busy,
    Unreachable,
    ProtocolError,
    BridgeError,
    None,
}

impl CallEndReason {
    /// Failure-class reasons map to `CallFailed`; everything else maps to
    /// `Hangup` (spec.md §4.5 "Event emission").
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CallEndReason::Unreachable
                | CallEndReason::Busy
                | CallEndReason::ProtocolError
                | CallEndReason::BridgeError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallEndReason::LocalHangup => "local_hangup",
            CallEndReason::RemoteHangup => "remote_hangup",
            CallEndReason::Declined => "declined",
            CallEndReason::Timeout => "timeout",
            CallEndReason::Busy => "busy",
            CallEndReason::Unreachable => "unreachable",
            CallEndReason::ProtocolError => "protocol_error",
            CallEndReason::BridgeError => "bridge_error",
            CallEndReason::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    IncomingCall { caller_name: String },
    OutgoingCall,
    Ringing,
    Answered,
    Streaming,
    Hangup(CallEndReason),
    CallFailed(CallEndReason),
    Idle,
}

impl CallEvent {
    /// Builds the right event variant for an edge landing on `Idle` with the
    /// given reason, per spec.md's failure/hangup split.
    pub fn for_end_reason(reason: CallEndReason) -> Self {
        if reason.is_failure() {
            CallEvent::CallFailed(reason)
        } else {
            CallEvent::Hangup(reason)
        }
    }

    /// Publishable string form of the state this event corresponds to, for
    /// consumers (UI, settings) that only want a stable label.
    pub fn state_label(&self) -> &'static str {
        match self {
            CallEvent::IncomingCall { .. } => CallState::Incoming.as_str(),
            CallEvent::OutgoingCall => CallState::Outgoing.as_str(),
            CallEvent::Ringing => CallState::Ringing.as_str(),
            CallEvent::Answered => CallState::Answering.as_str(),
            CallEvent::Streaming => CallState::Streaming.as_str(),
            CallEvent::Hangup(_) | CallEvent::CallFailed(_) | CallEvent::Idle => {
                CallState::Idle.as_str()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_map_to_call_failed() {
        for reason in [
            CallEndReason::Unreachable,
            CallEndReason::Busy,
            CallEndReason::ProtocolError,
            CallEndReason::BridgeError,
        ] {
            assert!(matches!(
                CallEvent::for_end_reason(reason),
                CallEvent::CallFailed(_)
            ));
        }
    }

    #[test]
    fn non_failure_reasons_map_to_hangup() {
        for reason in [
            CallEndReason::LocalHangup,
            CallEndReason::RemoteHangup,
            CallEndReason::Declined,
            CallEndReason::Timeout,
        ] {
            assert!(matches!(
                CallEvent::for_end_reason(reason),
                CallEvent::Hangup(_)
            ));
        }
    }
}
