//! Duplex audio via the cpal backend.
//!
//! # Design constraints
//!
//! Both cpal callbacks run on OS audio threads at elevated priority
//! (TIME_CRITICAL on Windows). They **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The callbacks therefore touch only SPSC ring buffers: the input
//! callback pushes downmixed mono frames to the capture ring, the
//! output callback pops converted frames from the playback ring and
//! zero-fills whatever the scheduler has not produced yet. An underrun
//! audibly drops out but never blocks the device.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows,
//! CoreAudio on macOS). `DuplexAudio` must be created and dropped on
//! the same thread; the engine does both inside `spawn_blocking`.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate,
};

#[cfg(feature = "audio-cpal")]
use crate::buffering::{Consumer, Producer};
use crate::{
    buffering::{AudioConsumer, AudioProducer},
    config::StreamConfig,
    error::{Result, RevoiceError},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Handle to an active capture + playback stream pair.
///
/// **Not `Send`** — both streams are bound to their creation thread on
/// Windows/macOS.
pub struct DuplexAudio {
    /// Kept alive so the streams are not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _input: cpal::Stream,
    #[cfg(feature = "audio-cpal")]
    _output: cpal::Stream,
    running: Arc<AtomicBool>,
    /// Sample rate both streams actually run at (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl DuplexAudio {
    /// Open the input and output devices named in `config` (default
    /// devices when unnamed) at `config.sample_rate` and start both
    /// streams.
    ///
    /// Must be called from the thread that will also drop this value.
    ///
    /// # Errors
    /// `RevoiceError::DeviceNotFound` when no usable device exists,
    /// `RevoiceError::AudioStream` when cpal rejects the configuration.
    pub fn open(
        config: &StreamConfig,
        capture: AudioProducer,
        playback: AudioConsumer,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let input = resolve_device(
            host.input_devices()
                .map_err(|e| RevoiceError::AudioDevice(e.to_string()))?,
            host.default_input_device(),
            config.input_device.as_deref(),
            "input",
        )?;
        let output = resolve_device(
            host.output_devices()
                .map_err(|e| RevoiceError::AudioDevice(e.to_string()))?,
            host.default_output_device(),
            config.output_device.as_deref(),
            "output",
        )?;

        let sample_rate = config.sample_rate;
        let _input = open_input(&input, sample_rate, capture, Arc::clone(&running))?;
        let _output = open_output(&output, sample_rate, playback, Arc::clone(&running))?;

        info!(
            input = input.name().unwrap_or_default().as_str(),
            output = output.name().unwrap_or_default().as_str(),
            sample_rate,
            "duplex audio running"
        );

        Ok(Self {
            _input,
            _output,
            running,
            sample_rate,
        })
    }

    /// Stop: signal both callbacks to no-op on their next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(feature = "audio-cpal")]
fn resolve_device(
    mut devices: impl Iterator<Item = cpal::Device>,
    default: Option<cpal::Device>,
    preferred_name: Option<&str>,
    direction: &str,
) -> Result<cpal::Device> {
    if let Some(name) = preferred_name {
        if let Some(found) = devices.find(|d| d.name().map(|n| n == name).unwrap_or(false)) {
            return Ok(found);
        }
        warn!("preferred {direction} device '{name}' not found, falling back to default");
    }
    default.ok_or_else(|| RevoiceError::DeviceNotFound(format!("no default {direction} device")))
}

#[cfg(feature = "audio-cpal")]
fn open_input(
    device: &cpal::Device,
    sample_rate: u32,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let supported = device
        .default_input_config()
        .map_err(|e| RevoiceError::AudioDevice(e.to_string()))?;
    let channels = supported.channels();
    let config = cpal::StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(channels, format = ?supported.sample_format(), "input config selected");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let ch = channels as usize;
            let mut mix_buf: Vec<f32> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    if ch == 1 {
                        let written = producer.push_slice(data);
                        if written < data.len() {
                            warn!("capture ring full: dropped {} frames", data.len() - written);
                        }
                        return;
                    }
                    let frames = data.len() / ch;
                    mix_buf.resize(frames, 0.0);
                    for f in 0..frames {
                        let base = f * ch;
                        let sum: f32 = data[base..base + ch].iter().sum();
                        mix_buf[f] = sum / ch as f32;
                    }
                    let written = producer.push_slice(&mix_buf);
                    if written < mix_buf.len() {
                        warn!("capture ring full: dropped {} frames", mix_buf.len() - written);
                    }
                },
                |err| error!("input stream error: {err}"),
                None,
            )
        }

        SampleFormat::I16 => {
            let ch = channels as usize;
            let mut mix_buf: Vec<f32> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    let frames = data.len() / ch;
                    mix_buf.resize(frames, 0.0);
                    for f in 0..frames {
                        let base = f * ch;
                        let mut sum = 0f32;
                        for c in 0..ch {
                            sum += data[base + c] as f32 / 32768.0;
                        }
                        mix_buf[f] = sum / ch as f32;
                    }
                    let written = producer.push_slice(&mix_buf);
                    if written < mix_buf.len() {
                        warn!("capture ring full: dropped {} frames", mix_buf.len() - written);
                    }
                },
                |err| error!("input stream error: {err}"),
                None,
            )
        }

        fmt => {
            return Err(RevoiceError::AudioStream(format!(
                "unsupported input sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| RevoiceError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| RevoiceError::AudioStream(e.to_string()))?;
    Ok(stream)
}

#[cfg(feature = "audio-cpal")]
fn open_output(
    device: &cpal::Device,
    sample_rate: u32,
    mut consumer: AudioConsumer,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let supported = device
        .default_output_config()
        .map_err(|e| RevoiceError::AudioDevice(e.to_string()))?;
    let channels = supported.channels();
    let config = cpal::StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(channels, format = ?supported.sample_format(), "output config selected");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let ch = channels as usize;
            let mut mono_buf: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    let frames = data.len() / ch;
                    mono_buf.resize(frames, 0.0);
                    let got = if running.load(Ordering::Relaxed) {
                        consumer.pop_slice(&mut mono_buf)
                    } else {
                        0
                    };
                    // Underrun: the tail stays silent rather than stale.
                    mono_buf[got..].fill(0.0);
                    for f in 0..frames {
                        let base = f * ch;
                        data[base..base + ch].fill(mono_buf[f]);
                    }
                },
                |err| error!("output stream error: {err}"),
                None,
            )
        }

        SampleFormat::I16 => {
            let ch = channels as usize;
            let mut mono_buf: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    let frames = data.len() / ch;
                    mono_buf.resize(frames, 0.0);
                    let got = if running.load(Ordering::Relaxed) {
                        consumer.pop_slice(&mut mono_buf)
                    } else {
                        0
                    };
                    mono_buf[got..].fill(0.0);
                    for f in 0..frames {
                        let sample = (mono_buf[f].clamp(-1.0, 1.0) * 32767.0) as i16;
                        let base = f * ch;
                        data[base..base + ch].fill(sample);
                    }
                },
                |err| error!("output stream error: {err}"),
                None,
            )
        }

        fmt => {
            return Err(RevoiceError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| RevoiceError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| RevoiceError::AudioStream(e.to_string()))?;
    Ok(stream)
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl DuplexAudio {
    pub fn open(
        config: &StreamConfig,
        _capture: AudioProducer,
        _playback: AudioConsumer,
        _running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let _ = config;
        Err(RevoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
