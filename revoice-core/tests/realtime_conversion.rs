use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use revoice_core::buffering::{create_audio_ring, AudioConsumer, Consumer, Producer};
use revoice_core::engine::scheduler::{self, SchedulerDiagnostics};
use revoice_core::session::stub::StubBackend;
use revoice_core::session::ResourceSession;
use revoice_core::vad::{VadDecision, VoiceActivityDetector};
use revoice_core::{ConversionSettings, Result, StreamConfig};

struct AlwaysSpeechVad;

impl VoiceActivityDetector for AlwaysSpeechVad {
    fn classify(&mut self, _block: &revoice_core::buffering::block::AudioBlock) -> Result<VadDecision> {
        Ok(VadDecision::Speech)
    }

    fn reset(&mut self) {}
}

struct Harness {
    producer: revoice_core::buffering::AudioProducer,
    consumer: AudioConsumer,
    running: Arc<AtomicBool>,
    diagnostics: Arc<SchedulerDiagnostics>,
    handle: thread::JoinHandle<()>,
}

fn spawn_scheduler(
    stream: StreamConfig,
    session: Arc<Mutex<ResourceSession>>,
    settings: ConversionSettings,
) -> Harness {
    let (capture_tx, capture_rx) = create_audio_ring();
    let (playback_tx, playback_rx) = create_audio_ring();
    let (status_tx, _) = broadcast::channel(8);
    let (activity_tx, _) = broadcast::channel(64);
    let running = Arc::new(AtomicBool::new(true));
    let diagnostics = Arc::new(SchedulerDiagnostics::default());

    let ctx = scheduler::SchedulerContext {
        stream,
        settings,
        session,
        vad: Box::new(AlwaysSpeechVad),
        consumer: capture_rx,
        producer: playback_tx,
        running: Arc::clone(&running),
        status_tx,
        activity_tx,
        seq: Arc::new(AtomicU64::new(0)),
        diagnostics: Arc::clone(&diagnostics),
    };
    let handle = thread::spawn(move || scheduler::run(ctx));

    Harness {
        producer: capture_tx,
        consumer: playback_rx,
        running,
        diagnostics,
        handle,
    }
}

fn drain_output(harness: &mut Harness, want: usize, timeout: Duration) -> Vec<f32> {
    let start = Instant::now();
    let mut out = Vec::new();
    let mut buf = vec![0f32; 4096];
    while out.len() < want {
        let n = harness.consumer.pop_slice(&mut buf);
        out.extend_from_slice(&buf[..n]);
        if n == 0 {
            if start.elapsed() >= timeout {
                panic!("timed out: got {} of {} samples", out.len(), want);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
    out
}

fn stop(harness: Harness) -> Arc<SchedulerDiagnostics> {
    let diagnostics = Arc::clone(&harness.diagnostics);
    harness.running.store(false, Ordering::SeqCst);
    harness.handle.join().expect("scheduler thread panicked");
    diagnostics
}

fn loaded_session(backend: Arc<StubBackend>) -> Arc<Mutex<ResourceSession>> {
    let mut session = ResourceSession::new(backend as _);
    session.load_embedder("contentvec", None).unwrap();
    session
        .load_generator(Path::new("model.onnx"), 0)
        .unwrap();
    Arc::new(Mutex::new(session))
}

fn sine_blocks(blocks: usize, block_size: usize, hz: f32, rate: f32) -> Vec<Vec<f32>> {
    (0..blocks)
        .map(|b| {
            (0..block_size)
                .map(|i| {
                    let t = (b * block_size + i) as f32 / rate;
                    0.3 * (std::f32::consts::TAU * hz * t).sin()
                })
                .collect()
        })
        .collect()
}

/// Full three-rate chain: 48 kHz capture, 16 kHz features, 40 kHz model
/// output, back to 48 kHz playback. One output block per input block.
#[test]
fn full_rate_chain_keeps_block_pacing() {
    let backend = Arc::new(StubBackend::new().with_target_rate(40_000));
    let session = loaded_session(Arc::clone(&backend));
    let stream = StreamConfig {
        sample_rate: 48_000,
        block_size: 1024,
        ..Default::default()
    };
    let mut harness = spawn_scheduler(stream, session, ConversionSettings::default());

    let blocks = 16;
    for block in sine_blocks(blocks, 1024, 220.0, 48_000.0) {
        harness.producer.push_slice(&block);
    }
    let out = drain_output(&mut harness, blocks * 1024, Duration::from_secs(5));
    let diagnostics = stop(harness);

    let snap = diagnostics.snapshot();
    assert_eq!(snap.blocks_in, blocks);
    assert_eq!(snap.blocks_out, blocks);
    assert!(backend.extract_calls.load(Ordering::Relaxed) >= 1);

    assert_eq!(out.len(), blocks * 1024);
    assert!(out.iter().all(|s| s.is_finite()));
    let peak = out.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    assert!(peak <= 0.99 + 1e-6, "peak {peak} above ceiling");
    assert!(out.iter().any(|s| s.abs() > 1e-4), "all output was silent");
}

#[test]
fn unready_session_streams_silence_without_model_calls() {
    let backend = Arc::new(StubBackend::new());
    let session = Arc::new(Mutex::new(ResourceSession::new(
        Arc::clone(&backend) as Arc<_>
    )));
    let stream = StreamConfig {
        sample_rate: 48_000,
        block_size: 1024,
        ..Default::default()
    };
    let mut harness = spawn_scheduler(stream, session, ConversionSettings::default());

    for block in sine_blocks(4, 1024, 220.0, 48_000.0) {
        harness.producer.push_slice(&block);
    }
    let out = drain_output(&mut harness, 4 * 1024, Duration::from_secs(2));
    let diagnostics = stop(harness);

    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(diagnostics.snapshot().blocks_not_ready, 4);
    assert_eq!(backend.extract_calls.load(Ordering::Relaxed), 0);
}

/// Swapping the generator mid-stream must not stall or corrupt pacing;
/// the scheduler just picks up the new snapshot.
#[test]
fn mid_stream_model_swap_keeps_streaming() {
    let backend = Arc::new(StubBackend::new().with_target_rate(40_000));
    let session = loaded_session(Arc::clone(&backend));
    let stream = StreamConfig {
        sample_rate: 48_000,
        block_size: 1024,
        ..Default::default()
    };
    let mut harness = spawn_scheduler(
        stream,
        Arc::clone(&session),
        ConversionSettings::default(),
    );

    for block in sine_blocks(4, 1024, 220.0, 48_000.0) {
        harness.producer.push_slice(&block);
    }
    drain_output(&mut harness, 4 * 1024, Duration::from_secs(2));

    // Hot swap to a different speaker while blocks keep flowing.
    session
        .lock()
        .load_generator(Path::new("model.onnx"), 1)
        .unwrap();

    for block in sine_blocks(4, 1024, 220.0, 48_000.0) {
        harness.producer.push_slice(&block);
    }
    let out = drain_output(&mut harness, 4 * 1024, Duration::from_secs(2));
    let diagnostics = stop(harness);

    assert!(out.iter().all(|s| s.is_finite()));
    assert_eq!(diagnostics.snapshot().blocks_in, 8);
    assert_eq!(backend.generator_loads.load(Ordering::Relaxed), 2);
}

/// A synthesizer that keeps producing degenerate output never breaks
/// the output cadence; the failed blocks are just silent.
#[test]
fn degenerate_model_output_still_paces_playback() {
    let backend = Arc::new(StubBackend::new().with_target_rate(40_000).with_short_output(0));
    let session = loaded_session(backend);
    let stream = StreamConfig {
        sample_rate: 48_000,
        block_size: 1024,
        ..Default::default()
    };
    let mut harness = spawn_scheduler(stream, session, ConversionSettings::default());

    for block in sine_blocks(6, 1024, 220.0, 48_000.0) {
        harness.producer.push_slice(&block);
    }
    let out = drain_output(&mut harness, 6 * 1024, Duration::from_secs(2));
    let diagnostics = stop(harness);

    assert_eq!(out.len(), 6 * 1024);
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(diagnostics.snapshot().blocks_out, 6);
}
