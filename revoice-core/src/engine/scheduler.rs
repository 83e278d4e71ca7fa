//! Blocking scheduler loop.
//!
//! ## Stages (per device block)
//!
//! ```text
//! 1. Drain exactly one block from the capture ring
//! 2. Resample device → 16 kHz (every block, keeps filter history warm)
//! 3. try_lock the session; busy or unloaded → emit silence
//! 4. Voice-activity gate (16 kHz) → Speech | Silence
//! 5. Run the chunk processor on the 16 kHz block
//! 6. Resample target → device rate
//! 7. Emit exactly one block to the playback ring (pad/trim)
//! 8. Broadcast an ActivityEvent
//! ```
//!
//! The whole loop runs inside `spawn_blocking`, so the Tokio executor
//! never carries DSP work. The loop emits one output block per input
//! block regardless of what happened inside, which keeps playback
//! pacing fixed even through errors, gating and session swaps.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{block::AudioBlock, AudioConsumer, AudioProducer, Consumer, Observer, Producer},
    config::{ConversionSettings, StreamConfig, FEATURE_RATE},
    events::{ActivityEvent, StreamStatus, StreamStatusEvent},
    session::ResourceSession,
    vad::{VadDecision, VoiceActivityDetector},
};

use super::processor::ChunkProcessor;

pub struct SchedulerDiagnostics {
    pub blocks_in: AtomicUsize,
    pub blocks_out: AtomicUsize,
    pub blocks_converted: AtomicUsize,
    pub blocks_gated: AtomicUsize,
    pub blocks_not_ready: AtomicUsize,
    pub session_busy: AtomicUsize,
    pub vad_errors: AtomicUsize,
}

impl Default for SchedulerDiagnostics {
    fn default() -> Self {
        Self {
            blocks_in: AtomicUsize::new(0),
            blocks_out: AtomicUsize::new(0),
            blocks_converted: AtomicUsize::new(0),
            blocks_gated: AtomicUsize::new(0),
            blocks_not_ready: AtomicUsize::new(0),
            session_busy: AtomicUsize::new(0),
            vad_errors: AtomicUsize::new(0),
        }
    }
}

impl SchedulerDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            blocks_in: self.blocks_in.load(Ordering::Relaxed),
            blocks_out: self.blocks_out.load(Ordering::Relaxed),
            blocks_converted: self.blocks_converted.load(Ordering::Relaxed),
            blocks_gated: self.blocks_gated.load(Ordering::Relaxed),
            blocks_not_ready: self.blocks_not_ready.load(Ordering::Relaxed),
            session_busy: self.session_busy.load(Ordering::Relaxed),
            vad_errors: self.vad_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub blocks_in: usize,
    pub blocks_out: usize,
    pub blocks_converted: usize,
    pub blocks_gated: usize,
    pub blocks_not_ready: usize,
    pub session_busy: usize,
    pub vad_errors: usize,
}

/// All context the scheduler needs, passed as one struct so the closure stays tidy.
pub struct SchedulerContext {
    pub stream: StreamConfig,
    pub settings: ConversionSettings,
    pub session: Arc<Mutex<ResourceSession>>,
    pub vad: Box<dyn VoiceActivityDetector>,
    pub consumer: AudioConsumer,
    pub producer: AudioProducer,
    pub running: Arc<AtomicBool>,
    pub status_tx: broadcast::Sender<StreamStatusEvent>,
    pub activity_tx: broadcast::Sender<ActivityEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<SchedulerDiagnostics>,
}

/// Sleep when the capture ring has less than a block (avoids busy-wait).
const SLEEP_EMPTY_MS: u64 = 2;

/// Input chunk for the target→device leg; output lengths per block vary
/// with the model rate, so the converter accumulates across blocks.
const OUT_LEG_CHUNK: usize = 512;

/// Run the blocking scheduler until `ctx.running` becomes false.
pub fn run(mut ctx: SchedulerContext) {
    info!(
        sample_rate = ctx.stream.sample_rate,
        block_size = ctx.stream.block_size,
        "scheduler started"
    );

    let block_size = ctx.stream.block_size;
    let device_rate = ctx.stream.sample_rate;

    let mut in_converter = match RateConverter::new(device_rate, FEATURE_RATE, block_size) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create input resampler: {e}");
            let _ = ctx.status_tx.send(StreamStatusEvent {
                status: StreamStatus::Error,
                detail: Some(format!("input resampler: {e}")),
            });
            return;
        }
    };
    if !in_converter.is_passthrough() {
        info!(from = device_rate, to = FEATURE_RATE, "input resampling enabled");
    }

    // Output-leg converter follows the loaded model's target rate and is
    // rebuilt when a session swap changes it.
    let mut out_converter: Option<(u32, RateConverter)> = None;

    let mut processor = ChunkProcessor::new();
    let mut raw = vec![0f32; block_size];
    // Device-rate output awaiting emission; absorbs resampler jitter so
    // every input block still yields exactly one output block.
    let mut pending_out: Vec<f32> = Vec::with_capacity(block_size * 4);

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        if ctx.consumer.occupied_len() < block_size {
            std::thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }
        let n = ctx.consumer.pop_slice(&mut raw);
        debug_assert_eq!(n, block_size);
        ctx.diagnostics.blocks_in.fetch_add(1, Ordering::Relaxed);

        // The feature leg runs on every block, gated or not, so the
        // resampler's filter history never sees a gap in the stream.
        let feature_block = AudioBlock::new(in_converter.process(&raw), FEATURE_RATE);
        let rms = feature_block.rms();

        // Snapshot under try_lock: a load in progress costs one silent
        // block instead of stalling the audio path. The guard drops at
        // the end of this statement, before any output is emitted.
        let snapshot = ctx.session.try_lock().map(|session| session.snapshot());
        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => {
                ctx.diagnostics.session_busy.fetch_add(1, Ordering::Relaxed);
                emit_block(&mut ctx, &mut pending_out, block_size, true, rms, false);
                continue;
            }
        };
        let Some(snapshot) = snapshot else {
            ctx.diagnostics
                .blocks_not_ready
                .fetch_add(1, Ordering::Relaxed);
            emit_block(&mut ctx, &mut pending_out, block_size, true, rms, false);
            continue;
        };

        // The gate classifies the 16 kHz block the model would consume.
        // A failing gate must not mute the stream; treat its blocks as
        // speech and keep converting.
        let is_speech = if !ctx.settings.vad_enabled || feature_block.is_empty() {
            true
        } else {
            match ctx.vad.classify(&feature_block) {
                Ok(decision) => matches!(decision, VadDecision::Speech),
                Err(e) => {
                    ctx.diagnostics.vad_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("vad error, processing block anyway: {e}");
                    true
                }
            }
        };

        if !is_speech {
            ctx.diagnostics.blocks_gated.fetch_add(1, Ordering::Relaxed);
            // Gated blocks skip the model entirely but still pace output.
            emit_block(&mut ctx, &mut pending_out, block_size, true, rms, false);
            continue;
        }

        if !feature_block.is_empty() {
            let converted = processor.process(&snapshot, &ctx.settings, &feature_block.samples);
            ctx.diagnostics
                .blocks_converted
                .fetch_add(1, Ordering::Relaxed);

            let target_rate = snapshot.constants.target_rate;
            let needs_new = !matches!(&out_converter, Some((rate, _)) if *rate == target_rate);
            if needs_new {
                match RateConverter::new(target_rate, device_rate, OUT_LEG_CHUNK) {
                    Ok(r) => {
                        debug!(from = target_rate, to = device_rate, "output resampler ready");
                        out_converter = Some((target_rate, r));
                    }
                    Err(e) => {
                        error!("failed to create output resampler: {e}");
                        out_converter = None;
                    }
                }
            }
            match out_converter.as_mut() {
                Some((_, converter)) => pending_out.extend(converter.process(&converted)),
                None => pending_out.extend(converted),
            }
        }

        emit_block(&mut ctx, &mut pending_out, block_size, false, rms, true);
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        blocks_in = snap.blocks_in,
        blocks_out = snap.blocks_out,
        blocks_converted = snap.blocks_converted,
        blocks_gated = snap.blocks_gated,
        blocks_not_ready = snap.blocks_not_ready,
        session_busy = snap.session_busy,
        vad_errors = snap.vad_errors,
        "scheduler stopped"
    );
}

/// Push exactly one device block to the playback ring and broadcast the
/// matching activity event. `silence` forces a zero block; otherwise the
/// block is drawn from `pending`, zero-padded while the converters are
/// still priming.
fn emit_block(
    ctx: &mut SchedulerContext,
    pending: &mut Vec<f32>,
    block_size: usize,
    silence: bool,
    rms: f32,
    is_speech: bool,
) {
    let mut out = vec![0f32; block_size];
    if !silence {
        let take = pending.len().min(block_size);
        out[..take].copy_from_slice(&pending[..take]);
        pending.drain(..take);
    }

    let pushed = ctx.producer.push_slice(&out);
    if pushed < block_size {
        warn!(pushed, block_size, "playback ring full, dropping samples");
    }
    ctx.diagnostics.blocks_out.fetch_add(1, Ordering::Relaxed);

    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    let _ = ctx.activity_tx.send(ActivityEvent { seq, rms, is_speech });
}
