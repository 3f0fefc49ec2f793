//! Local media policy and per-user audio preferences.

use crate::engine::CaptureConstraints;

/// The local user's media policy. Mutable at any time; the controller
/// applies changes to live producers/consumers without a rejoin where the
/// engine allows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMediaPolicy {
    pub muted: bool,
    pub deafened: bool,
    pub noise_suppression: bool,
    pub input_device_id: Option<String>,
    pub output_device_id: Option<String>,
}

impl Default for LocalMediaPolicy {
    fn default() -> Self {
        Self {
            muted: false,
            deafened: false,
            noise_suppression: true, // Enabled by default
            input_device_id: None,
            output_device_id: None,
        }
    }
}

impl LocalMediaPolicy {
    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            device_id: self.input_device_id.clone(),
            noise_suppression: self.noise_suppression,
        }
    }
}

/// How loudly one remote user plays back, chosen by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAudioPreference {
    pub muted: bool,
    /// 0..=100, default 100.
    pub volume: u8,
}

impl Default for UserAudioPreference {
    fn default() -> Self {
        Self {
            muted: false,
            volume: 100,
        }
    }
}

/// Effective playback gain for one remote user's consumers. Deafened forces
/// zero regardless of the preference.
pub fn effective_volume(deafened: bool, pref: UserAudioPreference) -> f32 {
    if deafened || pref.muted {
        0.0
    } else {
        f32::from(pref.volume.min(100)) / 100.0
    }
}
