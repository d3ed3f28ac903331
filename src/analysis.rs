/// Analysis-result schema shared by the analyser gateway, cache and planner
///
/// All records are produced by the native analyser and immutable once
/// cached. Positional fields are seconds from the start of the track.
/// Cached payloads carry a schema version; mismatched entries are ignored
/// wholesale, while a single out-of-order positional field is discarded on
/// its own and the rest of the record survives.

use serde::{Deserialize, Serialize};

/// Current analysis schema version. Bump whenever a field changes meaning;
/// the cache treats every other version as a miss.
pub const ANALYSIS_VERSION: u32 = 3;

/// Tolerance when comparing positional fields against the ordering chain.
const ORDER_EPSILON: f64 = 1e-6;

/// Musical mode of the detected key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    Major,
    Minor,
}

/// Transition style. `BassSwap` keeps the two tracks' low ends from
/// overlapping by sweeping complementary filters during the fade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MixType {
    #[default]
    Default,
    BassSwap,
}

/// Full (or head-only) offline analysis of one audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAnalysis {
    /// Schema version of the producing analyser.
    pub version: u32,
    /// How many seconds of audio were actually analysed.
    pub analyze_window: f64,
    /// Track duration in seconds.
    pub duration: f64,

    // --- Rhythm ---
    pub bpm: Option<f64>,
    #[serde(default)]
    pub bpm_confidence: f64,
    pub first_beat_pos: Option<f64>,

    // --- Key ---
    /// Pitch class of the key root, 0-11.
    pub key_root: Option<u8>,
    pub key_mode: Option<KeyMode>,
    #[serde(default)]
    pub key_confidence: f64,
    pub camelot_key: Option<String>,

    // --- Loudness ---
    /// Integrated loudness in LUFS (negative).
    pub loudness: Option<f64>,
    /// Outro energy in dB, used to pick the aggressive-outro behaviour.
    pub outro_energy_level: Option<f64>,

    // --- Boundaries ---
    /// Where perceptible audio starts / ends.
    pub fade_in_pos: Option<f64>,
    pub fade_out_pos: Option<f64>,
    /// Tighter boundaries suitable for hard cuts.
    pub cut_in_pos: Option<f64>,
    pub cut_out_pos: Option<f64>,
    /// Vocal activity boundaries.
    pub vocal_in_pos: Option<f64>,
    pub vocal_out_pos: Option<f64>,
    pub vocal_last_in_pos: Option<f64>,

    // --- Mix hints ---
    pub drop_pos: Option<f64>,
    pub mix_start_pos: Option<f64>,
    pub mix_center_pos: Option<f64>,
    pub mix_end_pos: Option<f64>,

    /// Coarse per-window energy values, finite and restartable.
    pub energy_profile: Option<Vec<f32>>,

    /// True when this record came from a head-only analysis. Head results
    /// cover only the intro region and never drive outro heuristics.
    #[serde(default)]
    pub head: bool,
}

impl AudioAnalysis {
    /// A minimal record as the analyser would emit for an unanalysable file:
    /// duration only, current schema version.
    pub fn empty(duration: f64, analyze_window: f64) -> Self {
        Self {
            version: ANALYSIS_VERSION,
            analyze_window,
            duration,
            bpm: None,
            bpm_confidence: 0.0,
            first_beat_pos: None,
            key_root: None,
            key_mode: None,
            key_confidence: 0.0,
            camelot_key: None,
            loudness: None,
            outro_energy_level: None,
            fade_in_pos: None,
            fade_out_pos: None,
            cut_in_pos: None,
            cut_out_pos: None,
            vocal_in_pos: None,
            vocal_out_pos: None,
            vocal_last_in_pos: None,
            drop_pos: None,
            mix_start_pos: None,
            mix_center_pos: None,
            mix_end_pos: None,
            energy_profile: None,
            head: false,
        }
    }

    /// Enforce the positional ordering chain
    /// `fade_in ≤ cut_in ≤ vocal_in ≤ vocal_out ≤ cut_out ≤ fade_out ≤ duration`.
    ///
    /// A field that breaks the chain is dropped on its own; the record
    /// survives. Returns the number of fields discarded.
    pub fn sanitize(&mut self) -> usize {
        let mut dropped = 0;
        let mut floor = 0.0_f64;

        let mut check = |field: &mut Option<f64>, floor: &mut f64| {
            if let Some(value) = *field {
                if value + ORDER_EPSILON < *floor || value < 0.0 {
                    *field = None;
                    return 1;
                }
                *floor = value;
            }
            0
        };

        dropped += check(&mut self.fade_in_pos, &mut floor);
        dropped += check(&mut self.cut_in_pos, &mut floor);
        dropped += check(&mut self.vocal_in_pos, &mut floor);
        dropped += check(&mut self.vocal_out_pos, &mut floor);
        dropped += check(&mut self.cut_out_pos, &mut floor);
        dropped += check(&mut self.fade_out_pos, &mut floor);

        if let Some(fade_out) = self.fade_out_pos {
            if fade_out > self.duration + ORDER_EPSILON {
                self.fade_out_pos = None;
                dropped += 1;
            }
        }

        if dropped > 0 {
            log::debug!("analysis sanitize dropped {dropped} out-of-order field(s)");
        }
        dropped
    }
}

/// Automation parameter addressed by one point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutomationTarget {
    /// Linear gain, 0..1.
    Gain(f64),
    /// Filter cutoff in Hz.
    FilterHz(f64),
    /// Filter resonance.
    Q(f64),
}

/// One step of a per-engine automation sequence. `time` is seconds from the
/// start of the crossfade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    pub time: f64,
    pub target: AutomationTarget,
}

/// Short mix suggestion from the analyser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionProposal {
    pub duration: f64,
    /// Where the current track should begin its fade-out.
    pub current_track_mix_out: f64,
    /// Where the next track should enter.
    pub next_track_mix_in: f64,
    pub mix_type: MixType,
    /// Free-form strategy label; contains "Bass Swap" when the bass region
    /// is to be swapped.
    pub filter_strategy: String,
    pub compatibility_score: f64,
    pub key_compatible: bool,
    pub bpm_compatible: bool,
}

/// Long "mashup" plan from the analyser: an automation-rich overlay of two
/// tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedTransition {
    /// Fade start in the current track's timeline.
    pub start_time_current: f64,
    /// Entry point into the next track.
    pub start_time_next: f64,
    pub duration: f64,
    pub pitch_shift_semitones: f64,
    /// Typically 0.97-1.03.
    pub playback_rate: f64,
    pub automation_current: Vec<AutomationPoint>,
    pub automation_next: Vec<AutomationPoint>,
    /// Free-form strategy label; contains "Bass Swap" when applicable.
    pub strategy: String,
}

/// Queue item handed to the engine by the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: String,
    /// Absolute path of the backing file; `None` for non-local sources,
    /// which AutoMix cannot analyse.
    pub path: Option<std::path::PathBuf>,
    pub duration_ms: u64,
    pub replay_gain: Option<crate::gain::ReplayGainInfo>,
}

impl TrackDescriptor {
    pub fn duration_sec(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}
