//! Broadcast event payloads emitted by the engine.
//!
//! Serialized with camelCase field names for any JSON consumer (CLI
//! status output, future IPC surfaces). Broadcast channels drop the
//! oldest events for slow receivers rather than blocking the sender.

use serde::{Deserialize, Serialize};

/// Capacity of every broadcast channel the engine creates.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of the conversion stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusEvent {
    pub status: StreamStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-block activity report, one per processed device block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub seq: u64,
    /// Input RMS at the device rate, before any processing.
    pub rms: f32,
    /// Whether the voice-activity gate passed this block to the model.
    pub is_speech: bool,
}
