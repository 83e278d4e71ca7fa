//! # revoice-core
//!
//! Reusable real-time voice conversion engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → input callback → SPSC ring → Scheduler(spawn_blocking)
//!                                               │
//!                                         VAD gate decision
//!                                               │
//!                                   ChunkProcessor (16 kHz pipeline:
//!                                   high-pass → pad → pitch → embed →
//!                                   retrieve → synthesize → trim →
//!                                   envelope → limit)
//!                                               │
//! Speakers ← output callback ← SPSC ring ← target→device resample
//! ```
//!
//! Both device callbacks are zero-alloc. All heap and model work
//! happens on the scheduler thread, and a model bundle can be
//! hot-swapped while the stream runs.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod pitch;
pub mod session;
pub mod vad;

#[cfg(feature = "onnx")]
pub mod onnx;

// Convenience re-exports for downstream crates
pub use config::{ConversionSettings, StreamConfig, FEATURE_RATE};
pub use engine::RevoiceEngine;
pub use error::{Result, RevoiceError};
pub use events::{ActivityEvent, StreamStatus, StreamStatusEvent};
pub use pitch::PitchMethod;
pub use session::backend::ConversionBackend;
pub use session::ResourceSession;

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;
