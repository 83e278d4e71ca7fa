//! Lock-free SPSC ring buffers for audio samples.
//!
//! Two rings connect the real-time callbacks to the worker thread:
//! capture callback → capture ring → worker → playback ring → playback
//! callback. `push_slice`/`pop_slice` are wait-free and allocation-free,
//! which is what keeps the device callbacks deadline-safe.

pub mod block;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half — held by the capture callback (or by the worker for
/// the playback leg).
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half — held by the worker (or by the playback callback).
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^16 = 65 536 f32 samples ≈ 1.37 s at 48 kHz.
/// Deep enough to ride out a slow conversion pass, shallow enough that a
/// stalled worker cannot accumulate seconds of latency — stale audio is
/// dropped at the producer instead.
pub const RING_CAPACITY: usize = 1 << 16;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
