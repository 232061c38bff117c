//! Voice intercom endpoint binary: wires `PeerLink`, `AudioPipeline`, and
//! `CallEngine` to real cpal capture/playback streams and a TCP socket, then
//! runs until `Ctrl+C`.
//!
//! Device wiring follows the teacher's `build_input_stream`/
//! `build_output_stream` shape (per-sample-format dispatch, a closure handed
//! to `cpal::Device::build_{input,output}_stream`), retargeted from the
//! teacher's f32/Opus pipeline to this spec's 16-bit PCM at 16 kHz.

use anyhow::{Context, Result};
use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use intercom_endpoint::audio::aec::{AecKernel, WebrtcApmKernel};
use intercom_endpoint::audio::{
    AudioPipeline, CaptureSource, PlaybackSink, CHUNK_BYTES, SAMPLE_RATE,
};
use intercom_endpoint::call::CallEngine;
use intercom_endpoint::config::EndpointConfig;
use intercom_endpoint::peer::PeerLink;
use intercom_endpoint::ring::ByteRing;
use intercom_endpoint::settings::{DebouncedSettings, FileSettingsStore, SettingsStore};
use intercom_endpoint::tasks::{media_task, net_task, playback_task, tx_task, SinkStopController};
use parking_lot::Mutex as PLMutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = rolling::daily("logs", "intercom-endpoint.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap())
                .with_ansi(false),
        )
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    std::panic::set_hook(Box::new(|panic_info| {
        error!("panic occurred: {}", panic_info);
    }));

    let cfg = EndpointConfig::parse();

    let settings_store: Arc<dyn SettingsStore> = Arc::new(FileSettingsStore::new(&cfg.settings_path));
    let settings = Arc::new(DebouncedSettings::new(settings_store));
    let loaded = settings.get().await;

    let host = select_host()?;
    let input_device = host
        .default_input_device()
        .context("no default input device found")?;
    let output_device = host
        .default_output_device()
        .context("no default output device found")?;
    info!(
        "using input device '{}', output device '{}'",
        input_device.name().unwrap_or_else(|_| "unknown".into()),
        output_device.name().unwrap_or_else(|_| "unknown".into()),
    );

    let aec_kernel: Option<Box<dyn AecKernel>> = if cfg.aec_enabled {
        Some(Box::new(WebrtcApmKernel::new(CHUNK_BYTES / 2)?))
    } else {
        None
    };
    let audio = Arc::new(AudioPipeline::new(cfg.ref_delay_ms, aec_kernel));
    audio.set_mic_gain_db(loaded.mic_gain_db as f32 + cfg.mic_gain_db as f32);

    let mut peer_link = PeerLink::new();
    peer_link.listen(cfg.listen_port).await?;
    let peer_link = Arc::new(peer_link);

    let auto_answer = cfg.auto_answer || loaded.auto_answer();
    let engine = Arc::new(CallEngine::new(
        peer_link.clone(),
        audio.clone(),
        auto_answer,
        cfg.display_name.clone(),
    ));
    engine
        .ringing_timeout_ms
        .store(cfg.ringing_timeout_ms, Ordering::Relaxed);

    let playback_ring = Arc::new(PLMutex::new(ByteRing::new(CHUNK_BYTES * 8)));
    let output_stream = build_output_stream(&output_device, playback_ring.clone())?;
    let sink: Arc<PLMutex<Box<dyn PlaybackSink>>> = Arc::new(PLMutex::new(Box::new(CpalSink {
        stream: output_stream,
        ring: playback_ring,
        volume: (loaded.volume_pct.min(100) as f32) / 100.0,
    })));

    let input_stream = build_input_stream(&input_device, audio.clone())?;
    let capture: Arc<PLMutex<Box<dyn CaptureSource>>> =
        Arc::new(PLMutex::new(Box::new(CpalCapture {
            stream: input_stream,
        })));

    let sink_ctl = Arc::new(SinkStopController::new());

    let net_handle = tokio::spawn(net_task(engine.clone(), peer_link.clone()));
    let tx_handle = tokio::spawn(tx_task(engine.clone(), peer_link.clone()));
    let playback_handle = tokio::spawn(playback_task(engine.clone(), sink.clone(), sink_ctl.clone()));
    let media_handle = tokio::spawn(media_task(engine.subscribe(), capture.clone(), sink_ctl.clone()));

    if let Some(peer) = &cfg.peer {
        let (host, port) = split_host_port(peer).context("invalid --peer, expected host:port")?;
        engine.set_dial_target(host, port);
        engine.start().await;
        info!("dialing {peer}");
    } else {
        info!("listening on port {}", cfg.listen_port);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.stop().await;

    net_handle.abort();
    tx_handle.abort();
    playback_handle.abort();
    media_handle.abort();
    Ok(())
}

fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

fn select_host() -> Result<cpal::Host> {
    #[cfg(target_os = "windows")]
    {
        return Ok(cpal::host_from_id(cpal::HostId::Wasapi)?);
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        return Ok(cpal::default_host());
    }
    #[cfg(target_os = "macos")]
    {
        return Ok(cpal::host_from_id(cpal::HostId::CoreAudio)?);
    }
}

fn device_stream_config() -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    }
}

// ---- Capture (input) ---------------------------------------------------

struct CpalCapture {
    stream: cpal::Stream,
}

impl CaptureSource for CpalCapture {
    fn start(&mut self) -> Result<()> {
        self.stream.play()?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream.pause()?;
        Ok(())
    }
}

fn build_input_stream(device: &cpal::Device, audio: Arc<AudioPipeline>) -> Result<cpal::Stream> {
    let cfg = device_stream_config();
    match device.default_input_config()?.sample_format() {
        cpal::SampleFormat::I16 => build_input::<i16>(device, &cfg, audio),
        cpal::SampleFormat::U16 => build_input::<u16>(device, &cfg, audio),
        cpal::SampleFormat::F32 => build_input::<f32>(device, &cfg, audio),
        other => Err(anyhow::anyhow!("unsupported input sample format: {other:?}")),
    }
}

fn build_input<T>(
    device: &cpal::Device,
    cfg: &cpal::StreamConfig,
    audio: Arc<AudioPipeline>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + DeviceSampleToPcm + 'static,
{
    let err_fn = |e| error!("input stream error: {e}");
    let stream = device.build_input_stream(
        cfg,
        move |data: &[T], _| {
            let bytes: Vec<u8> = data.iter().flat_map(|s| s.to_pcm_le_bytes()).collect();
            audio.on_capture(&bytes);
        },
        err_fn,
        None,
    )?;
    stream.pause()?;
    Ok(stream)
}

/// Converts one device sample to 16-bit LE PCM bytes, generalizing the
/// teacher's `sample_to_f32` in the opposite direction (device format ->
/// fixed-point PCM instead of device format -> float for Opus).
trait DeviceSampleToPcm {
    fn to_pcm_le_bytes(&self) -> [u8; 2];
}

impl DeviceSampleToPcm for i16 {
    fn to_pcm_le_bytes(&self) -> [u8; 2] {
        self.to_le_bytes()
    }
}

impl DeviceSampleToPcm for u16 {
    fn to_pcm_le_bytes(&self) -> [u8; 2] {
        (((*self as i32) - i16::MAX as i32 - 1) as i16).to_le_bytes()
    }
}

impl DeviceSampleToPcm for f32 {
    fn to_pcm_le_bytes(&self) -> [u8; 2] {
        (((*self).clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_le_bytes()
    }
}

// ---- Playback (output) --------------------------------------------------

struct CpalSink {
    stream: cpal::Stream,
    ring: Arc<PLMutex<ByteRing>>,
    volume: f32,
}

impl PlaybackSink for CpalSink {
    fn start(&mut self) -> Result<()> {
        self.stream.play()?;
        Ok(())
    }

    fn play(&mut self, pcm: &[u8]) {
        let mut ring = self.ring.lock();
        let written = ring.write(pcm);
        if written < pcm.len() {
            tracing::debug!("playback ring overflow, dropped {} bytes", pcm.len() - written);
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.stream.pause()?;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn volume(&self) -> f32 {
        self.volume
    }
}

fn build_output_stream(device: &cpal::Device, ring: Arc<PLMutex<ByteRing>>) -> Result<cpal::Stream> {
    let cfg = device_stream_config();
    match device.default_output_config()?.sample_format() {
        cpal::SampleFormat::I16 => build_output::<i16>(device, &cfg, ring),
        cpal::SampleFormat::U16 => build_output::<u16>(device, &cfg, ring),
        cpal::SampleFormat::F32 => build_output::<f32>(device, &cfg, ring),
        other => Err(anyhow::anyhow!("unsupported output sample format: {other:?}")),
    }
}

fn build_output<T>(
    device: &cpal::Device,
    cfg: &cpal::StreamConfig,
    ring: Arc<PLMutex<ByteRing>>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + PcmToDeviceSample + 'static,
{
    let err_fn = |e| error!("output stream error: {e}");
    let stream = device.build_output_stream(
        cfg,
        move |out: &mut [T], _| {
            let mut ring = ring.lock();
            let mut scratch = [0u8; 2];
            for sample in out.iter_mut() {
                let n = ring.read(&mut scratch);
                *sample = if n == 2 {
                    T::from_pcm_le_bytes(scratch)
                } else {
                    T::from_pcm_le_bytes([0, 0])
                };
            }
        },
        err_fn,
        None,
    )?;
    stream.pause()?;
    Ok(stream)
}

trait PcmToDeviceSample {
    fn from_pcm_le_bytes(bytes: [u8; 2]) -> Self;
}

impl PcmToDeviceSample for i16 {
    fn from_pcm_le_bytes(bytes: [u8; 2]) -> Self {
        i16::from_le_bytes(bytes)
    }
}

impl PcmToDeviceSample for u16 {
    fn from_pcm_le_bytes(bytes: [u8; 2]) -> Self {
        (i16::from_le_bytes(bytes) as i32 + i16::MAX as i32 + 1) as u16
    }
}

impl PcmToDeviceSample for f32 {
    fn from_pcm_le_bytes(bytes: [u8; 2]) -> Self {
        i16::from_le_bytes(bytes) as f32 / i16::MAX as f32
    }
}
