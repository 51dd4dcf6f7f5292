//! Input device enumeration and selection.
//!
//! Inputs that record the system mix ("Stereo Mix", "Monitor of …",
//! BlackHole) would feed the assistant's own voice straight back to it.
//! Selection ranks them below every real microphone unless the user names
//! one explicitly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    /// Captures what the speakers play rather than the room.
    pub is_loopback_like: bool,
    /// Best candidate for a voice session.
    pub is_recommended: bool,
}

#[cfg(any(feature = "audio-cpal", test))]
impl DeviceInfo {
    fn described(name: String, default_name: Option<&str>) -> Self {
        Self {
            is_default: default_name == Some(name.as_str()),
            is_loopback_like: classify(&name) == InputKind::SystemMix,
            is_recommended: false,
            name,
        }
    }
}

/// What a device name suggests it records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// The local output mix (feedback risk).
    SystemMix,
    /// Clearly a microphone or headset.
    Microphone,
    Unknown,
}

const SYSTEM_MIX_HINTS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "wave out",
    "loopback",
    "monitor of",
    ".monitor",
    "blackhole",
    "soundflower",
    "virtual output",
    "speakers (",
    "headphones (",
];

const MICROPHONE_HINTS: &[&str] = &["microphone", "mic", "headset", "array", "webcam", "usb"];

pub fn classify(name: &str) -> InputKind {
    let name = name.trim().to_ascii_lowercase();
    if SYSTEM_MIX_HINTS.iter().any(|hint| name.contains(hint)) {
        InputKind::SystemMix
    } else if MICROPHONE_HINTS.iter().any(|hint| name.contains(hint)) {
        InputKind::Microphone
    } else {
        InputKind::Unknown
    }
}

pub fn is_loopback_like_name(name: &str) -> bool {
    classify(name) == InputKind::SystemMix
}

/// Ranking key: real microphones first, the default breaks ties.
fn rank(device: &DeviceInfo) -> u8 {
    let kind = match classify(&device.name) {
        InputKind::Microphone => 4,
        InputKind::Unknown => 2,
        InputKind::SystemMix => 0,
    };
    kind + u8::from(device.is_default)
}

/// Index of the device a session should use, or `None` for an empty list.
///
/// Earlier entries win remaining ties.
pub fn recommended_index(devices: &[DeviceInfo]) -> Option<usize> {
    devices
        .iter()
        .enumerate()
        .max_by_key(|(idx, device)| (rank(device), std::cmp::Reverse(*idx)))
        .map(|(idx, _)| idx)
}

/// Recommended device first, system-mix inputs last.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("input device enumeration failed: {e}");
            return Vec::new();
        }
    };
    let mut list: Vec<DeviceInfo> = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device.name().unwrap_or_else(|_| format!("Input {}", idx + 1));
            DeviceInfo::described(name, default_name.as_deref())
        })
        .collect();

    if let Some(idx) = recommended_index(&list) {
        list[idx].is_recommended = true;
    }
    list.sort_by(|a, b| {
        b.is_recommended
            .cmp(&a.is_recommended)
            .then(rank(b).cmp(&rank(a)))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    Vec::new()
}

/// Pick the capture device.
///
/// An exact `preferred` name wins, even a system-mix input. Otherwise the
/// default is used unless it records the system mix, in which case the
/// best-ranked device is taken.
#[cfg(feature = "audio-cpal")]
pub fn find_input_device(preferred: Option<&str>) -> crate::error::Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::{info, warn};

    use crate::error::CounselError;

    let host = cpal::default_host();
    let mut devices: Vec<(cpal::Device, String)> = host
        .input_devices()
        .map_err(|e| CounselError::DeviceUnavailable(e.to_string()))?
        .map(|d| {
            let name = d.name().unwrap_or_default();
            (d, name)
        })
        .collect();

    if let Some(wanted) = preferred {
        if let Some(pos) = devices.iter().position(|(_, name)| name == wanted) {
            info!(device = wanted, "using requested input device");
            return Ok(devices.swap_remove(pos).0);
        }
        warn!(device = wanted, "requested input device not present");
    }

    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    if let Some(name) = default_name.as_deref() {
        if !is_loopback_like_name(name) {
            if let Some(pos) = devices.iter().position(|(_, n)| n == name) {
                info!(device = name, "using default input device");
                return Ok(devices.swap_remove(pos).0);
            }
        } else {
            warn!(device = name, "default input records the system mix, choosing another");
        }
    }

    let infos: Vec<DeviceInfo> = devices
        .iter()
        .map(|(_, name)| DeviceInfo::described(name.clone(), default_name.as_deref()))
        .collect();
    let idx = recommended_index(&infos)
        .ok_or_else(|| CounselError::DeviceUnavailable("no input device found".into()))?;
    info!(device = %infos[idx].name, "using best-ranked input device");
    Ok(devices.swap_remove(idx).0)
}
