//! The three cooperating real-time tasks from spec.md §5: net, TX, and
//! playback, plus a small media-lifecycle task that reacts to `CallEvent`s to
//! start/stop the capture source and the playback sink in the order §5's
//! "Cancellation / shutdown ordering" requires.
//!
//! Priority is realized the way the teacher's `network_task`/`decode_task`
//! already are — `tokio::task::spawn`ed loops distinguished by poll/sleep
//! cadence rather than an OS priority class, which tokio's cooperative
//! scheduler has no knob for (see DESIGN.md).

use crate::audio::{CaptureSource, PlaybackSink};
use crate::call::{CallEngine, CallEvent, CallState};
use crate::error::EndpointError;
use crate::peer::PeerLink;
use parking_lot::Mutex as PLMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};

fn now_epoch_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Single-owner sink-stop handshake (spec.md §5): an atomic flag plus a
/// binary semaphore, so only the playback task ever calls `sink.stop()`.
pub struct SinkStopController {
    stop_requested: AtomicBool,
    ack: Semaphore,
}

impl SinkStopController {
    pub fn new() -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            ack: Semaphore::new(0),
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Called by whoever is tearing a call down. Sets the flag and waits up
    /// to 200 ms for the playback task to acknowledge having called
    /// `sink.stop()`. A missed acknowledgement (playback task wedged) is
    /// logged, not fatal — the flag stays set so the next iteration still
    /// catches it.
    pub async fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        match tokio::time::timeout(Duration::from_millis(200), self.ack.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.stop_requested.store(false, Ordering::Release);
            }
            _ => warn!("sink-stop acknowledgement timed out after 200ms"),
        }
    }

    /// Called only by the playback task, immediately after `sink.stop()`.
    pub fn acknowledge(&self) {
        self.ack.add_permits(1);
    }
}

impl Default for SinkStopController {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the listening socket and the active session's read side. Accepts,
/// polls for inbound frames (the protocol decoder's own 50 ms retry budget
/// doubles as the "select-based read polling" window), dispatches to the
/// FSM, and drives timeout/keepalive checks every iteration.
pub async fn net_task(engine: Arc<CallEngine>, peer_link: Arc<PeerLink>) {
    loop {
        if engine.session().is_none() {
            match peer_link.try_accept().await {
                Ok(Some(session)) => {
                    if engine.accept_allowed() {
                        debug!("accepted peer {}", session.peer_addr);
                        engine.adopt_session(session);
                    } else {
                        // Defensive: try_accept() already rejects with
                        // ERROR{BUSY} when a session is active; this covers
                        // the narrow window where no session exists yet but
                        // the FSM is mid-teardown.
                        peer_link.close(&session).await;
                    }
                }
                Ok(None) => {}
                Err(EndpointError::Busy) => {}
                Err(e) => warn!("accept error: {e}"),
            }

            engine.poll_timeouts(now_epoch_ms()).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        let session = engine.session().expect("checked above");
        match peer_link.recv(&session).await {
            Ok(frame) => engine.on_frame(frame).await,
            Err(EndpointError::Incomplete) => {}
            Err(EndpointError::Closed) => engine.on_disconnected().await,
            Err(EndpointError::Oversize { len }) => {
                warn!("peer sent oversize frame ({len} bytes), protocol error");
                engine.on_protocol_error().await;
            }
            Err(e) => {
                warn!("recv error: {e}");
                engine.on_disconnected().await;
            }
        }

        engine.poll_timeouts(now_epoch_ms()).await;
    }
}

/// Drains `mic_ring` through the AEC aligner (or straight through, when AEC
/// is absent) and sends `AUDIO` frames. Yields every iteration while
/// streaming; sleeps 20 ms otherwise.
pub async fn tx_task(engine: Arc<CallEngine>, peer_link: Arc<PeerLink>) {
    loop {
        if engine.state() == CallState::Streaming {
            if let Some(session) = engine.session() {
                engine.audio.pump_capture_to_peer(&peer_link, &session).await;
            }
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Drains `spk_ring` into the sink and services the single-owner sink-stop
/// handshake. Lowest priority of the three: 16 ms cadence while streaming
/// (one chunk's worth), 50 ms otherwise.
pub async fn playback_task(
    engine: Arc<CallEngine>,
    sink: Arc<PLMutex<Box<dyn PlaybackSink>>>,
    sink_ctl: Arc<SinkStopController>,
) {
    loop {
        if sink_ctl.should_stop() {
            if let Err(e) = sink.lock().stop() {
                warn!("sink stop failed: {e}");
            }
            sink_ctl.acknowledge();
        }

        if engine.state() == CallState::Streaming {
            engine.audio.pump_playback(&mut **sink.lock());
            tokio::time::sleep(Duration::from_millis(16)).await;
        } else {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Reacts to `CallEvent`s to start the capture source on `Streaming` and
/// run the single-owner sink-stop + capture-stop sequence on any edge back
/// to `Idle`, completing steps 3–4 of spec.md §5's shutdown ordering (steps
/// 1–2, clearing `streaming` and closing the socket, already happened
/// synchronously inside `CallEngine::apply` before the event was emitted).
pub async fn media_task(
    mut events: broadcast::Receiver<CallEvent>,
    capture: Arc<PLMutex<Box<dyn CaptureSource>>>,
    sink_ctl: Arc<SinkStopController>,
) {
    loop {
        match events.recv().await {
            Ok(CallEvent::Streaming) => {
                if let Err(e) = capture.lock().start() {
                    warn!("capture start failed: {e}");
                }
            }
            Ok(CallEvent::Hangup(_)) | Ok(CallEvent::CallFailed(_)) | Ok(CallEvent::Idle) => {
                sink_ctl.request_stop().await;
                if let Err(e) = capture.lock().stop() {
                    warn!("capture stop failed: {e}");
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("media task lagged behind {n} call events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_stop_round_trip_within_budget() {
        let ctl = Arc::new(SinkStopController::new());
        let playback_ctl = ctl.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(playback_ctl.should_stop());
            playback_ctl.acknowledge();
        });

        ctl.request_stop().await;
        handle.await.unwrap();
        assert!(!ctl.should_stop());
    }

    #[tokio::test]
    async fn sink_stop_times_out_without_acknowledgement() {
        let ctl = Arc::new(SinkStopController::new());
        let start = tokio::time::Instant::now();
        ctl.request_stop().await;
        assert!(start.elapsed() >= Duration::from_millis(190));
    }
}
