//! AudioPipeline: ring buffers for capture/playback, AEC frame aligner,
//! mic preprocessor, and the speaker reference tap, per spec.md §4.4.

pub mod aec;
pub mod preprocess;

use crate::peer::{PeerLink, PeerSession};
use crate::protocol::MsgType;
use crate::ring::ByteRing;
use aec::{AecAligner, AecKernel};
use parking_lot::Mutex;
use preprocess::Preprocessor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHUNK_BYTES: usize = 512; // 256 samples, 16 ms
pub const CHUNK_SAMPLES: usize = CHUNK_BYTES / 2;
pub const TX_RING_BYTES: usize = 2 * 1024;
pub const RX_RING_BYTES: usize = 8 * 1024;

pub const DEFAULT_REF_DELAY_MS: u32 = 80;
pub const MIN_REF_DELAY_MS: u32 = 20;
pub const MAX_REF_DELAY_MS: u32 = 100;

pub fn ref_delay_bytes(ref_delay_ms: u32) -> usize {
    (SAMPLE_RATE as usize * 2 * ref_delay_ms as usize) / 1000
}

/// Platform capture source: delivers variable-size buffers of 16-bit LE PCM.
pub trait CaptureSource: Send {
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
}

/// Platform playback sink. Only the playback task ever calls these.
pub trait PlaybackSink: Send {
    fn start(&mut self) -> anyhow::Result<()>;
    fn play(&mut self, pcm: &[u8]);
    fn stop(&mut self) -> anyhow::Result<()>;
    fn set_volume(&mut self, volume: f32);
    fn volume(&self) -> f32;
}

#[derive(Default)]
pub struct OverflowCounters {
    pub mic_dropped: AtomicU64,
    pub spk_dropped: AtomicU64,
}

/// Shared audio state threaded between the capture callback, the TX task,
/// and the playback task. Each ring has its own lock with short critical
/// sections, per spec.md §5's shared-resource policy.
pub struct AudioPipeline {
    pub mic_ring: Arc<Mutex<ByteRing>>,
    pub spk_ring: Arc<Mutex<ByteRing>>,
    pub spk_ref_ring: Arc<Mutex<ByteRing>>,
    preprocessor: Mutex<Preprocessor>,
    aligner: Mutex<Option<AecAligner>>,
    pub overflow: Arc<OverflowCounters>,
    ref_delay_bytes: usize,
}

impl AudioPipeline {
    pub fn new(ref_delay_ms: u32, aec_kernel: Option<Box<dyn AecKernel>>) -> Self {
        let ref_delay_ms = ref_delay_ms.clamp(MIN_REF_DELAY_MS, MAX_REF_DELAY_MS);
        let ref_bytes = ref_delay_bytes(ref_delay_ms);

        let aligner = aec_kernel.map(|k| AecAligner::new(CHUNK_SAMPLES, k));

        Self {
            mic_ring: Arc::new(Mutex::new(ByteRing::new(TX_RING_BYTES))),
            spk_ring: Arc::new(Mutex::new(ByteRing::new(RX_RING_BYTES))),
            spk_ref_ring: Arc::new(Mutex::new(ByteRing::new(ref_bytes + RX_RING_BYTES))),
            preprocessor: Mutex::new(Preprocessor::default()),
            aligner: Mutex::new(aligner),
            overflow: Arc::new(OverflowCounters::default()),
            ref_delay_bytes: ref_bytes,
        }
    }

    pub fn set_mic_gain_db(&self, db: f32) {
        self.preprocessor.lock().set_gain_db(db);
    }

    pub fn has_aec(&self) -> bool {
        self.aligner.lock().is_some()
    }

    /// Resets all rings and AEC state and re-seeds the reference delay.
    /// Must be called on every entry to `Streaming` so residual audio from a
    /// previous call never leaks into a new one.
    pub fn reset_for_call(&self) {
        self.mic_ring.lock().reset();
        self.spk_ring.lock().reset();
        let mut ref_ring = self.spk_ref_ring.lock();
        ref_ring.reset();
        ref_ring.fill_zeros(self.ref_delay_bytes);
        drop(ref_ring);

        if let Some(aligner) = self.aligner.lock().as_mut() {
            aligner.reset();
        }
    }

    /// Called from the capture driver's callback. Applies the preprocessor
    /// and writes into `mic_ring`, counting (not failing on) overflow.
    pub fn on_capture(&self, pcm: &[u8]) {
        let mut samples = bytes_to_i16(pcm);
        self.preprocessor.lock().process(&mut samples);
        let out_bytes = i16_to_bytes(&samples);

        let mut ring = self.mic_ring.lock();
        let written = ring.write(&out_bytes);
        if written < out_bytes.len() {
            let dropped = (out_bytes.len() - written) as u64;
            let prev = self.overflow.mic_dropped.fetch_add(dropped, Ordering::Relaxed);
            log_overflow_sampled("mic ring", prev + dropped, dropped);
        }
    }

    /// Called when an `AUDIO` frame arrives from the peer. Writes into
    /// `spk_ring`, counting (not failing on) overflow.
    pub fn on_remote_audio(&self, pcm: &[u8]) {
        let mut ring = self.spk_ring.lock();
        let written = ring.write(pcm);
        if written < pcm.len() {
            let dropped = (pcm.len() - written) as u64;
            let prev = self.overflow.spk_dropped.fetch_add(dropped, Ordering::Relaxed);
            log_overflow_sampled("speaker ring", prev + dropped, dropped);
        }
    }

    /// Drains up to four 512-byte chunks from `spk_ring`, submits them to
    /// `sink` (unless volume is ~0), and appends the post-volume bytes to
    /// the reference ring in order (Testable Property #4).
    pub fn pump_playback(&self, sink: &mut dyn PlaybackSink) {
        let mut scratch = [0u8; CHUNK_BYTES];
        for _ in 0..4 {
            let n = {
                let mut ring = self.spk_ring.lock();
                if ring.available() < CHUNK_BYTES {
                    break;
                }
                ring.read(&mut scratch)
            };
            if n == 0 {
                break;
            }

            let volume = sink.volume();
            if volume > 0.001 {
                sink.play(&scratch[..n]);
            }

            let post_volume = apply_volume(&scratch[..n], volume);
            let mut ref_ring = self.spk_ref_ring.lock();
            let written = ref_ring.write(&post_volume);
            if written < post_volume.len() {
                debug!("reference ring overflow, dropping {} bytes", post_volume.len() - written);
            }
        }
    }

    /// TX path: accumulates captured chunks, runs the AEC aligner if present,
    /// and sends the result (or the raw chunk, when AEC is absent) to the
    /// peer as an `AUDIO` frame.
    pub async fn pump_capture_to_peer(&self, link: &PeerLink, session: &PeerSession) {
        let chunk = {
            let mut ring = self.mic_ring.lock();
            if ring.available() < CHUNK_BYTES {
                return;
            }
            let mut buf = [0u8; CHUNK_BYTES];
            let n = ring.read(&mut buf);
            buf[..n].to_vec()
        };

        let mut aligner_guard = self.aligner.lock();
        if let Some(aligner) = aligner_guard.as_mut() {
            let samples = bytes_to_i16(&chunk);
            let mut emitted = Vec::new();
            aligner.push_capture(&samples, &self.spk_ref_ring, &mut emitted);
            drop(aligner_guard);
            if !emitted.is_empty() {
                if let Err(e) = link.send(session, MsgType::Audio.to_byte(), 0, &emitted).await {
                    warn!("tx send failed: {e}");
                }
            }
        } else {
            drop(aligner_guard);
            if let Err(e) = link.send(session, MsgType::Audio.to_byte(), 0, &chunk).await {
                warn!("tx send failed: {e}");
            }
        }
    }
}

const OVERFLOW_LOG_BURST: u64 = 5;
const OVERFLOW_LOG_PERIOD: u64 = 200;

/// Logs the first few overflow occurrences on a ring, then every Nth after
/// that, so a sustained overflow (e.g. a stalled playback device) doesn't
/// flood the log at audio-callback rate (spec.md §7).
fn log_overflow_sampled(ring: &str, total_dropped: u64, just_dropped: u64) {
    if total_dropped <= OVERFLOW_LOG_BURST || total_dropped % OVERFLOW_LOG_PERIOD == 0 {
        warn!("{ring} overflow, dropped {just_dropped} bytes ({total_dropped} total)");
    }
}

fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn apply_volume(pcm: &[u8], volume: f32) -> Vec<u8> {
    if (volume - 1.0).abs() < f32::EPSILON {
        return pcm.to_vec();
    }
    bytes_to_i16(pcm)
        .into_iter()
        .map(|s| ((s as f32) * volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeSink {
        volume: f32,
        played: StdMutex<Vec<u8>>,
    }

    impl FakeSink {
        fn new() -> Self {
            Self {
                volume: 1.0,
                played: StdMutex::new(Vec::new()),
            }
        }
    }

    impl PlaybackSink for FakeSink {
        fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn play(&mut self, pcm: &[u8]) {
            self.played.lock().unwrap().extend_from_slice(pcm);
        }
        fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_volume(&mut self, v: f32) {
            self.volume = v;
        }
        fn volume(&self) -> f32 {
            self.volume
        }
    }

    #[test]
    fn remote_audio_overflow_is_counted_not_fatal() {
        let pipeline = AudioPipeline::new(DEFAULT_REF_DELAY_MS, None);
        let big = vec![0xABu8; RX_RING_BYTES + 100];
        pipeline.on_remote_audio(&big);
        assert_eq!(
            pipeline.overflow.spk_dropped.load(Ordering::Relaxed),
            100
        );
    }

    #[test]
    fn capture_overflow_is_counted_not_fatal() {
        let pipeline = AudioPipeline::new(DEFAULT_REF_DELAY_MS, None);
        let big = vec![0u8; TX_RING_BYTES + 50];
        pipeline.on_capture(&big);
        assert_eq!(pipeline.overflow.mic_dropped.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn pump_playback_appends_post_volume_bytes_to_reference_ring_in_order() {
        let pipeline = AudioPipeline::new(DEFAULT_REF_DELAY_MS, None);
        let mut sink = FakeSink::new();
        sink.set_volume(0.5);

        let chunk = vec![0x10u8; CHUNK_BYTES];
        pipeline.on_remote_audio(&chunk);
        pipeline.pump_playback(&mut sink);

        let played = sink.played.lock().unwrap().clone();
        assert_eq!(played, chunk);

        let expected_ref = apply_volume(&chunk, 0.5);
        let mut ref_out = vec![0u8; CHUNK_BYTES];
        let n = pipeline.spk_ref_ring.lock().read(&mut ref_out);
        assert_eq!(&ref_out[..n], &expected_ref[..n]);
    }

    #[test]
    fn silent_volume_does_not_submit_to_sink() {
        let pipeline = AudioPipeline::new(DEFAULT_REF_DELAY_MS, None);
        let mut sink = FakeSink::new();
        sink.set_volume(0.0);

        pipeline.on_remote_audio(&vec![0x20u8; CHUNK_BYTES]);
        pipeline.pump_playback(&mut sink);

        assert!(sink.played.lock().unwrap().is_empty());
    }

    #[test]
    fn reset_for_call_reseeds_reference_delay() {
        let pipeline = AudioPipeline::new(DEFAULT_REF_DELAY_MS, None);
        pipeline.mic_ring.lock().write(&[1, 2, 3]);
        pipeline.spk_ring.lock().write(&[4, 5, 6]);

        pipeline.reset_for_call();

        assert_eq!(pipeline.mic_ring.lock().available(), 0);
        assert_eq!(pipeline.spk_ring.lock().available(), 0);
        assert_eq!(
            pipeline.spk_ref_ring.lock().available(),
            ref_delay_bytes(DEFAULT_REF_DELAY_MS)
        );
    }
}
