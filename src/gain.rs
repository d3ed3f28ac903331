/// Gain math for loudness-matched, peak-safe crossfades
///
/// Covers dB/linear conversion, the equal-power fade pair, loudness
/// compensation between two analysed tracks, ReplayGain selection and the
/// peak clamp that keeps the compensated signal below full scale.

use crate::config::ReplayGainMode;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Loudness compensation is clamped to this many dB in either direction.
pub const MAX_COMPENSATION_DB: f64 = 9.0;

/// Volume automation curve shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FadeCurve {
    Linear,
    EqualPower,
    Exponential,
}

/// Convert decibels to a linear factor.
pub fn db_to_linear(db: f64) -> f64 {
    10_f64.powf(db / 20.0)
}

/// Convert a linear factor to decibels. Zero and negatives floor at -100 dB.
pub fn linear_to_db(linear: f64) -> f64 {
    if linear <= 0.0 {
        -100.0
    } else {
        20.0 * linear.log10()
    }
}

/// Incoming-side equal-power gain: `sin(π t / 2D)`, so that the squared sum
/// with the outgoing side stays constant across the fade.
pub fn equal_power_in(t: f64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return 1.0;
    }
    (PI * t.clamp(0.0, duration) / (2.0 * duration)).sin()
}

/// Outgoing-side equal-power gain: `cos(π t / 2D)`.
pub fn equal_power_out(t: f64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return 0.0;
    }
    (PI * t.clamp(0.0, duration) / (2.0 * duration)).cos()
}

/// ReplayGain metadata from the next track's tags. Gains and peaks are
/// linear factors, not dB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplayGainInfo {
    pub track_gain: f64,
    pub album_gain: f64,
    pub track_peak: f64,
    pub album_peak: f64,
}

impl ReplayGainInfo {
    pub fn gain(&self, mode: ReplayGainMode) -> f64 {
        match mode {
            ReplayGainMode::Track => self.track_gain,
            ReplayGainMode::Album => self.album_gain,
        }
    }

    pub fn peak(&self, mode: ReplayGainMode) -> f64 {
        match mode {
            ReplayGainMode::Track => self.track_peak,
            ReplayGainMode::Album => self.album_peak,
        }
    }
}

/// Linear gain that brings the next track's integrated loudness up (or down)
/// to the current track's, clamped to ±`MAX_COMPENSATION_DB`.
///
/// Either loudness missing means no compensation.
pub fn loudness_compensation(current_lufs: Option<f64>, next_lufs: Option<f64>) -> f64 {
    match (current_lufs, next_lufs) {
        (Some(current), Some(next)) => {
            let db = (current - next).clamp(-MAX_COMPENSATION_DB, MAX_COMPENSATION_DB);
            db_to_linear(db)
        }
        _ => 1.0,
    }
}

/// Reduce `gain` so that `gain × peak ≤ 1.0`. Missing peak metadata means
/// no clamp.
pub fn peak_clamp(gain: f64, peak: Option<f64>) -> f64 {
    match peak {
        Some(peak) if peak > 0.0 && gain * peak > 1.0 => {
            log::warn!(
                "peak clamp: gain {:.3} × peak {:.3} would clip, reducing to {:.3}",
                gain,
                peak,
                1.0 / peak
            );
            1.0 / peak
        }
        _ => gain,
    }
}

/// The pending engine's pre-fade target gain: loudness compensation times
/// the configured ReplayGain, peak-clamped.
pub fn prefade_target(
    current_lufs: Option<f64>,
    next_lufs: Option<f64>,
    replay_gain: Option<&ReplayGainInfo>,
    mode: ReplayGainMode,
) -> f64 {
    let compensation = loudness_compensation(current_lufs, next_lufs);
    let rg = replay_gain.map_or(1.0, |info| info.gain(mode));
    let peak = replay_gain.map(|info| info.peak(mode));
    peak_clamp(compensation * rg, peak)
}
