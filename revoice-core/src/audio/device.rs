//! Host audio device inventory for the duplex stream.

use serde::{Deserialize, Serialize};

/// Which side of the duplex pair a device can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Device name as reported by the host API.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for input devices that actually capture system
    /// output (stereo-mix style). Converting those feeds the engine its
    /// own playback.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mixage stereo",
    "mezcla estereo",
    "mix stereo",
    "speakers (",
    "headphones (",
];

/// Name-based guess at whether an input device is a system-output capture
/// (stereo-mix style) rather than a real microphone.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Enumerate capture devices, default first, loopback-like last.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => collect(devices, default_name, DeviceDirection::Input),
        Err(e) => {
            tracing::warn!(error = %e, "input device enumeration failed");
            vec![]
        }
    }
}

/// Enumerate playback devices, default first.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => collect(devices, default_name, DeviceDirection::Output),
        Err(e) => {
            tracing::warn!(error = %e, "output device enumeration failed");
            vec![]
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn collect(
    devices: impl Iterator<Item = cpal::Device>,
    default_name: Option<String>,
    direction: DeviceDirection,
) -> Vec<DeviceInfo> {
    use cpal::traits::DeviceTrait;

    let mut list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            let is_default = default_name.as_deref() == Some(name.as_str());
            let is_loopback_like =
                direction == DeviceDirection::Input && is_loopback_like_name(&name);
            DeviceInfo {
                name,
                direction,
                is_default,
                is_loopback_like,
            }
        })
        .collect::<Vec<_>>();

    list.sort_by_key(|d| {
        (
            !d.is_default,
            d.is_loopback_like,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::is_loopback_like_name;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("What U Hear (Sound Blaster)"));
        assert!(is_loopback_like_name(
            "Speakers (High Definition Audio Device)"
        ));
    }

    #[test]
    fn real_microphone_names_are_not_loopback() {
        assert!(!is_loopback_like_name("Microphone Array (Intel Smart Sound)"));
        assert!(!is_loopback_like_name("USB PnP Audio Device"));
    }
}
