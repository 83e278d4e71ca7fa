//! `RevoiceEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! RevoiceEngine::new()
//!     └─► load_resources()   → models loaded, session ready
//!         └─► start()        → duplex audio open, scheduler spawned, status = Running
//!             └─► stop()     → running=false, streams dropped, status = Idle
//! ```
//!
//! `start()`/`stop()` in the wrong state return an error rather than
//! panicking. `load_resources()` may also be called while running: the
//! scheduler picks up the new session snapshot on its next block.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). The duplex pair is therefore opened *inside* the
//! `spawn_blocking` closure so it never crosses a thread boundary. A
//! sync oneshot channel propagates open-device errors back to the
//! `start()` caller.

pub mod dsp;
pub mod processor;
pub mod scheduler;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    audio::DuplexAudio,
    buffering::create_audio_ring,
    config::{ConversionSettings, StreamConfig},
    error::{Result, RevoiceError},
    events::{ActivityEvent, StreamStatus, StreamStatusEvent, EVENT_CHANNEL_CAPACITY},
    session::{backend::ConversionBackend, ResourceSession},
    vad::{energy::EnergyVad, VoiceActivityDetector},
};

/// The top-level engine handle.
///
/// `RevoiceEngine` is `Send + Sync` — all fields use interior
/// mutability. Wrap in `Arc<RevoiceEngine>` to share between command
/// surfaces and event-forwarding async tasks.
pub struct RevoiceEngine {
    stream: StreamConfig,
    settings: Mutex<ConversionSettings>,
    session: Arc<Mutex<ResourceSession>>,
    /// `true` while the duplex streams and the scheduler are active.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<StreamStatus>>,
    status_tx: broadcast::Sender<StreamStatusEvent>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<scheduler::SchedulerDiagnostics>,
}

impl RevoiceEngine {
    /// Create a new engine. Does not open audio — call `load_resources()`
    /// then `start()`.
    pub fn new(stream: StreamConfig, backend: Arc<dyn ConversionBackend>) -> Self {
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (activity_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            stream,
            settings: Mutex::new(ConversionSettings::default()),
            session: Arc::new(Mutex::new(ResourceSession::new(backend))),
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(StreamStatus::Idle)),
            status_tx,
            activity_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(scheduler::SchedulerDiagnostics::default()),
        }
    }

    /// Load (or hot-swap) the model bundle. Safe while running: the
    /// scheduler reads the session through `try_lock` and at worst emits
    /// silence for the blocks that land mid-swap.
    pub fn load_resources(
        &self,
        model_path: &Path,
        index_path: Option<&Path>,
        speaker_id: u32,
        embedder_name: &str,
    ) -> Result<()> {
        self.session
            .lock()
            .load_all(model_path, index_path, speaker_id, embedder_name)
    }

    /// Replace the conversion settings.
    ///
    /// # Errors
    /// `RevoiceError::AlreadyRunning` while the stream is active; the
    /// scheduler captured its settings at `start()`.
    pub fn update_settings(&self, settings: ConversionSettings) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RevoiceError::AlreadyRunning);
        }
        *self.settings.lock() = settings.clamped();
        Ok(())
    }

    pub fn settings(&self) -> ConversionSettings {
        self.settings.lock().clone()
    }

    /// Open the duplex audio pair and spawn the scheduler.
    ///
    /// Blocks until both devices are confirmed open (or failed), then
    /// returns; the scheduler keeps running on a background blocking
    /// thread.
    ///
    /// # Errors
    /// - `RevoiceError::AlreadyRunning` if already started.
    /// - `RevoiceError::AudioDevice` / `AudioStream` on device errors.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RevoiceError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        self.set_status(StreamStatus::Starting, None);

        // capture: device callback → scheduler; playback: scheduler → device.
        let (capture_tx, capture_rx) = create_audio_ring();
        let (playback_tx, playback_rx) = create_audio_ring();

        let stream = self.stream.clone();
        let settings = self.settings.lock().clone();
        let session = Arc::clone(&self.session);
        let running = Arc::clone(&self.running);
        let status_tx = self.status_tx.clone();
        let activity_tx = self.activity_tx.clone();
        let seq = Arc::clone(&self.seq);
        let diagnostics = Arc::clone(&self.diagnostics);

        // Sync oneshot: the scheduler thread signals open success/failure
        // back to start().
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        tokio::task::spawn_blocking(move || {
            let audio = match DuplexAudio::open(&stream, capture_tx, playback_rx, Arc::clone(&running))
            {
                Ok(a) => {
                    let _ = open_tx.send(Ok(()));
                    a
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let vad: Box<dyn VoiceActivityDetector> =
                Box::new(EnergyVad::from_sensitivity(settings.vad_sensitivity));

            scheduler::run(scheduler::SchedulerContext {
                stream,
                settings,
                session,
                vad,
                consumer: capture_rx,
                producer: playback_tx,
                running,
                status_tx,
                activity_tx,
                seq,
                diagnostics,
            });

            // Streams drop here, releasing both devices on this thread.
            drop(audio);
        });

        match open_rx.recv() {
            Ok(Ok(())) => {
                self.set_status(StreamStatus::Running, None);
                info!("engine started — converting");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(StreamStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent — the blocking
                // task died before opening the devices.
                self.running.store(false, Ordering::SeqCst);
                self.set_status(StreamStatus::Error, Some("scheduler failed to start".into()));
                Err(RevoiceError::Other(anyhow::anyhow!(
                    "scheduler task died unexpectedly"
                )))
            }
        }
    }

    /// Stop the stream and release the audio devices.
    ///
    /// # Errors
    /// `RevoiceError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(RevoiceError::NotRunning);
        }

        self.set_status(StreamStatus::Stopping, None);
        self.running.store(false, Ordering::SeqCst);
        self.set_status(StreamStatus::Idle, None);
        info!("engine stop requested");
        Ok(())
    }

    /// Current stream status (snapshot).
    pub fn status(&self) -> StreamStatus {
        *self.status.lock()
    }

    /// True once a complete model bundle has been loaded.
    pub fn is_ready(&self) -> bool {
        self.session.lock().is_ready()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StreamStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to per-block activity events (RMS + gate decisions).
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Snapshot of scheduler counters for observability.
    pub fn diagnostics_snapshot(&self) -> scheduler::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn set_status(&self, new_status: StreamStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(StreamStatusEvent {
            status: new_status,
            detail,
        });
    }
}
