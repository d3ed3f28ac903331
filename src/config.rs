/// Process-global AutoMix configuration
///
/// Mirrors the player's persisted settings; the engine receives a copy at
/// construction and on every settings change. Nothing here is persisted by
/// this crate.

use crate::gain::FadeCurve;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which ReplayGain tags to apply when matching loudness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayGainMode {
    Track,
    Album,
}

/// AutoMix settings, as configured in the player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomixConfig {
    /// Master switch for automatic transitions.
    pub enable_automix: bool,
    /// Maximum seconds of audio the analyser may inspect per track.
    /// Clamped to [10, 300] wherever it is consumed.
    pub automix_max_analyze_time: u32,
    /// ReplayGain tag selection for loudness matching.
    pub replay_gain_mode: ReplayGainMode,
    /// Fade curve for volume automation.
    pub fade_curve: FadeCurve,
    /// The user-configured playback rate; rate automation ramps back to this
    /// after a BPM-aligned transition.
    #[serde(default = "default_rate")]
    pub playback_rate: f64,
    /// Re-plan suppression window after a completed handover.
    #[serde(default = "default_cooldown", with = "duration_ms")]
    pub cooldown: Duration,
}

fn default_rate() -> f64 { 1.0 }
fn default_cooldown() -> Duration { Duration::from_millis(500) }

impl Default for AutomixConfig {
    fn default() -> Self {
        Self {
            enable_automix: true,
            automix_max_analyze_time: 60,
            replay_gain_mode: ReplayGainMode::Track,
            fade_curve: FadeCurve::EqualPower,
            playback_rate: 1.0,
            cooldown: default_cooldown(),
        }
    }
}

impl AutomixConfig {
    /// Analysis window handed to the analyser, clamped to [10, 300] s.
    pub fn analyze_window(&self) -> f64 {
        f64::from(self.automix_max_analyze_time).clamp(10.0, 300.0)
    }

    /// Monitoring window: how close to the end of the current track the
    /// engine must be before it starts planning. Clamped to [30, 300] s.
    pub fn monitor_window(&self) -> f64 {
        f64::from(self.automix_max_analyze_time).clamp(30.0, 300.0)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
