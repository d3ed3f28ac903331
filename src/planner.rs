/// Transition planning
///
/// Turns two analyses plus the live playback position into a concrete
/// [`TransitionPlan`]. Stateless: the same inputs always produce the same
/// plan, so the monitoring loop may call it every tick. Strategies, in
/// priority order: a mashup plan from the analyser is copied verbatim; a
/// native short-mix proposal is clamped into the current track; otherwise a
/// snap-to-bar fallback derives an exit point from the analysed boundaries.
/// The fallback and proposal paths then get BPM rate alignment and the
/// aggressive-outro correction before the final safety clamp.

use crate::analysis::{
    AdvancedTransition, AudioAnalysis, AutomationPoint, MixType, TransitionProposal,
};

/// Crossfade length used by the fallback strategy, seconds.
pub const DEFAULT_FADE: f64 = 8.0;
/// No plan ever fades for less than this.
pub const MIN_FADE: f64 = 0.5;

/// Rate matching applies only when both BPM estimates clear this.
const BPM_MIN_CONFIDENCE: f64 = 0.4;
/// Inclusive BPM ratio band for rate matching.
const BPM_RATIO_MIN: f64 = 0.97;
const BPM_RATIO_MAX: f64 = 1.03;

/// Outros louder than this are treated as high-energy.
const HIGH_ENERGY_DB: f64 = -12.0;

/// What the engine actually executes for one track boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    /// Session token at planning time; a stale token kills the plan at
    /// scheduler fire time.
    pub token: u64,
    /// Queue reference of the incoming track.
    pub next_song_ref: String,
    pub next_index: usize,
    /// Fade start, seconds in the current track's timeline.
    pub trigger_time: f64,
    pub crossfade_duration: f64,
    /// Entry point into the next track, milliseconds.
    pub start_seek_ms: u64,
    /// Rate applied to the incoming engine at start; 1.0 unless BPM-aligned.
    pub initial_rate: f64,
    /// Seconds into the fade at which the logical "now playing" flips.
    pub ui_switch_delay: f64,
    pub mix_type: MixType,
    /// Semitones applied to the incoming engine (mashup plans only).
    pub pitch_shift: f64,
    pub playback_rate: f64,
    pub automation_current: Vec<AutomationPoint>,
    pub automation_next: Vec<AutomationPoint>,
}

/// Everything the planner looks at. Analyses may be head-only; the planner
/// never touches the cache or the clock.
pub struct PlannerInput<'a> {
    pub current: &'a AudioAnalysis,
    pub next: &'a AudioAnalysis,
    pub proposal: Option<&'a TransitionProposal>,
    pub long_mix: Option<&'a AdvancedTransition>,
    /// Current playback position, seconds. Only the caller compares it to
    /// the returned trigger; planning itself is position-independent.
    pub position: f64,
    pub token: u64,
    pub next_song_ref: String,
    pub next_index: usize,
}

/// Produce a plan for the upcoming boundary, or `None` when no viable
/// transition exists and the caller should keep monitoring.
pub fn plan(input: &PlannerInput<'_>) -> Option<TransitionPlan> {
    let current = input.current;
    let next = input.next;

    let mut draft = if let Some(long_mix) = input.long_mix {
        mashup_plan(input, long_mix)
    } else if let Some(proposal) = input.proposal.filter(|p| p.duration > MIN_FADE) {
        let mut draft = proposal_plan(input, proposal, current);
        let exit_point = draft.trigger_time + draft.crossfade_duration;
        align_and_tighten(&mut draft, current, next, exit_point);
        draft
    } else {
        let exit_point = exit_point(current);
        let mut draft = fallback_plan(input, current, next, exit_point);
        align_and_tighten(&mut draft, current, next, exit_point);
        draft
    };

    // Final safety clamp, all strategies.
    if draft.trigger_time < 0.0 {
        draft.trigger_time = 0.0;
    }
    if draft.trigger_time + draft.crossfade_duration > current.duration {
        draft.crossfade_duration = (current.duration - draft.trigger_time).max(MIN_FADE);
    }
    if draft.ui_switch_delay == 0.0 {
        draft.ui_switch_delay = draft.crossfade_duration * 0.5;
    }

    // The fade must actually fit the current track...
    if draft.trigger_time + draft.crossfade_duration > current.duration
        || current.duration < draft.crossfade_duration + MIN_FADE
    {
        return None;
    }
    // ...and the entry point must exist in the next track.
    if draft.start_seek_ms as f64 / 1000.0 > next.duration {
        return None;
    }

    Some(draft)
}

/// Strategy: copy the analyser's mashup plan verbatim.
fn mashup_plan(input: &PlannerInput<'_>, long_mix: &AdvancedTransition) -> TransitionPlan {
    TransitionPlan {
        token: input.token,
        next_song_ref: input.next_song_ref.clone(),
        next_index: input.next_index,
        trigger_time: long_mix.start_time_current,
        crossfade_duration: long_mix.duration,
        start_seek_ms: (long_mix.start_time_next.max(0.0) * 1000.0) as u64,
        initial_rate: long_mix.playback_rate,
        ui_switch_delay: long_mix.duration * 0.5,
        mix_type: bass_swap_if(&long_mix.strategy),
        pitch_shift: long_mix.pitch_shift_semitones,
        playback_rate: long_mix.playback_rate,
        automation_current: long_mix.automation_current.clone(),
        automation_next: long_mix.automation_next.clone(),
    }
}

/// Strategy: clamp the analyser's short-mix proposal into the current track.
fn proposal_plan(
    input: &PlannerInput<'_>,
    proposal: &TransitionProposal,
    current: &AudioAnalysis,
) -> TransitionPlan {
    let trigger = proposal
        .current_track_mix_out
        .min(current.duration - 1.0);
    TransitionPlan {
        token: input.token,
        next_song_ref: input.next_song_ref.clone(),
        next_index: input.next_index,
        trigger_time: trigger,
        crossfade_duration: proposal.duration.min(current.duration - trigger),
        start_seek_ms: (proposal.next_track_mix_in.max(0.0) * 1000.0) as u64,
        initial_rate: 1.0,
        ui_switch_delay: 0.0,
        mix_type: bass_swap_if(&proposal.filter_strategy),
        pitch_shift: 0.0,
        playback_rate: 1.0,
        automation_current: Vec::new(),
        automation_next: Vec::new(),
    }
}

/// Strategy: derive the exit point from the analysed boundaries and snap
/// the trigger to the nearest bar when both tracks carry a beat grid.
fn fallback_plan(
    input: &PlannerInput<'_>,
    current: &AudioAnalysis,
    next: &AudioAnalysis,
    exit_point: f64,
) -> TransitionPlan {
    let raw_trigger = exit_point - DEFAULT_FADE;

    let trigger = match (current.bpm, current.first_beat_pos, next.bpm) {
        (Some(bpm), Some(first_beat), Some(_)) if bpm > 0.0 => {
            let snapped = snap_to_bar(raw_trigger, bpm, first_beat);
            // Bar alignment never wins over keeping an audible fade.
            if current.duration - snapped < 4.0 {
                raw_trigger
            } else {
                snapped
            }
        }
        _ => raw_trigger,
    };

    TransitionPlan {
        token: input.token,
        next_song_ref: input.next_song_ref.clone(),
        next_index: input.next_index,
        trigger_time: trigger,
        crossfade_duration: DEFAULT_FADE,
        start_seek_ms: (next.fade_in_pos.unwrap_or(0.0).max(0.0) * 1000.0) as u64,
        initial_rate: 1.0,
        ui_switch_delay: 0.0,
        mix_type: MixType::Default,
        pitch_shift: 0.0,
        playback_rate: 1.0,
        automation_current: Vec::new(),
        automation_next: Vec::new(),
    }
}

/// Where the current track stops being worth listening to.
///
/// Start from the fade-out; a fade-out that would cut vocals short is
/// distrusted in favour of the full duration; a cut-out that leaves at
/// least 30 s of body and does not clip vocals takes over.
fn exit_point(current: &AudioAnalysis) -> f64 {
    let mut exit = current
        .fade_out_pos
        .unwrap_or(current.duration)
        .min(current.duration);

    if let Some(vocal_out) = current.vocal_out_pos {
        if exit < vocal_out - 0.1 {
            exit = current.duration;
        }
    }

    if let Some(cut_out) = current.cut_out_pos {
        let intro = current
            .cut_in_pos
            .or(current.fade_in_pos)
            .unwrap_or(0.0);
        let clears_vocals = current
            .vocal_out_pos
            .map_or(true, |vocal_out| cut_out >= vocal_out - 0.1);
        if cut_out > 0.0 && cut_out <= current.duration && cut_out - intro > 30.0 && clears_vocals
        {
            exit = cut_out;
        }
    }

    exit
}

/// Nearest bar boundary (4 beats) of the current track's grid.
pub fn snap_to_bar(t: f64, bpm: f64, first_beat: f64) -> f64 {
    let bar = 4.0 * 60.0 / bpm;
    first_beat + ((t - first_beat) / bar).round() * bar
}

/// Post-processing shared by the proposal and fallback strategies: BPM rate
/// alignment, then the aggressive-outro correction.
fn align_and_tighten(
    draft: &mut TransitionPlan,
    current: &AudioAnalysis,
    next: &AudioAnalysis,
    exit_point: f64,
) {
    draft.initial_rate = bpm_aligned_rate(current, next);
    aggressive_outro(draft, current, exit_point);
}

/// `current_bpm / next_bpm` when both estimates are confident and the ratio
/// sits inside the inclusive matching band; 1.0 otherwise.
fn bpm_aligned_rate(current: &AudioAnalysis, next: &AudioAnalysis) -> f64 {
    let (Some(current_bpm), Some(next_bpm)) = (current.bpm, next.bpm) else {
        return 1.0;
    };
    if current.bpm_confidence <= BPM_MIN_CONFIDENCE
        || next.bpm_confidence <= BPM_MIN_CONFIDENCE
        || next_bpm <= 0.0
    {
        return 1.0;
    }
    let ratio = current_bpm / next_bpm;
    if (BPM_RATIO_MIN..=BPM_RATIO_MAX).contains(&ratio) {
        ratio
    } else {
        1.0
    }
}

/// Pull the trigger forward when vocals end long before the planned exit,
/// so the mix starts over the outro instead of dead air. Requires a full
/// analysis; head analyses never see the outro.
fn aggressive_outro(draft: &mut TransitionPlan, current: &AudioAnalysis, exit_point: f64) {
    if current.head {
        return;
    }
    let Some(vocal_out) = current.vocal_out_pos else { return };
    let tail = exit_point - vocal_out;
    if tail <= 8.0 {
        return;
    }

    let high_energy = current
        .outro_energy_level
        .map_or(false, |level| level > HIGH_ENERGY_DB);
    let beats_to_wait = if high_energy { 8.0 } else { 1.0 };

    let new_trigger = match (current.bpm, current.first_beat_pos) {
        (Some(bpm), Some(first_beat)) if bpm > 0.0 => {
            let beat_len = 60.0 / bpm;
            let beat_position = (vocal_out - first_beat) / beat_len;
            let mut beat = beat_position.floor();
            // More than 90% into the next beat counts as that beat.
            if beat_position - beat > 0.9 {
                beat += 1.0;
            }
            let mut target_beat = beat + beats_to_wait;
            if high_energy {
                // Land on a bar for loud outros.
                target_beat = (target_beat / 4.0).ceil() * 4.0;
            }
            first_beat + target_beat * beat_len
        }
        _ => vocal_out + if high_energy { 4.0 } else { 0.5 },
    };

    if new_trigger < draft.trigger_time && new_trigger <= exit_point - 1.0 {
        draft.trigger_time = new_trigger;
        let cap = if high_energy { 8.0 } else { 5.0 };
        draft.crossfade_duration = draft
            .crossfade_duration
            .min(cap)
            .min(exit_point - new_trigger);
    }
}

fn bass_swap_if(strategy: &str) -> MixType {
    if strategy.contains("Bass Swap") {
        MixType::BassSwap
    } else {
        MixType::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AutomationTarget, AudioAnalysis};

    fn base_input<'a>(
        current: &'a AudioAnalysis,
        next: &'a AudioAnalysis,
    ) -> PlannerInput<'a> {
        PlannerInput {
            current,
            next,
            proposal: None,
            long_mix: None,
            position: 0.0,
            token: 7,
            next_song_ref: "song-2".to_string(),
            next_index: 1,
        }
    }

    /// Current track of the bar-aligned fallback case: 180 s at 128 BPM
    /// with a clean boundary chain.
    fn bar_aligned_current() -> AudioAnalysis {
        let mut a = AudioAnalysis::empty(180.0, 60.0);
        a.bpm = Some(128.0);
        a.first_beat_pos = Some(0.0);
        a.fade_out_pos = Some(175.0);
        a.vocal_out_pos = Some(170.0);
        a.cut_out_pos = Some(176.0);
        a.cut_in_pos = Some(4.0);
        a.fade_in_pos = Some(2.0);
        a.loudness = Some(-9.0);
        a
    }

    fn bar_aligned_next() -> AudioAnalysis {
        let mut a = AudioAnalysis::empty(200.0, 60.0);
        a.bpm = Some(128.0);
        a.fade_in_pos = Some(5.0);
        a.loudness = Some(-9.0);
        a
    }

    #[test]
    fn test_fallback_snaps_to_nearest_bar() {
        let current = bar_aligned_current();
        let next = bar_aligned_next();
        let plan = plan(&base_input(&current, &next)).expect("plan");

        // exit point 176 (cut-out), raw trigger 168, nearest 1.875 s bar.
        assert!((plan.trigger_time - 168.75).abs() < 1e-9);
        assert!((plan.crossfade_duration - 8.0).abs() < 1e-9);
        assert_eq!(plan.start_seek_ms, 5000);
        assert!((plan.initial_rate - 1.0).abs() < 1e-9);
        assert_eq!(plan.mix_type, MixType::Default);
        assert!((plan.ui_switch_delay - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_planner_is_deterministic() {
        let current = bar_aligned_current();
        let next = bar_aligned_next();
        let a = plan(&base_input(&current, &next)).unwrap();
        let b = plan(&base_input(&current, &next)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_aggressive_outro_high_energy() {
        // Loud outro with vocals done a minute early: trigger moves up to
        // the first bar after an 8-beat wait past the last vocal.
        let mut current = AudioAnalysis::empty(240.0, 60.0);
        current.bpm = Some(120.0);
        current.first_beat_pos = Some(0.0);
        current.fade_out_pos = Some(235.0);
        current.vocal_out_pos = Some(180.0);
        current.outro_energy_level = Some(-8.0);
        current.cut_out_pos = Some(235.0);
        let next = bar_aligned_next();

        let plan = plan(&base_input(&current, &next)).expect("plan");
        // vocal_out lands on beat 360; +8 beats, already on a bar: 368.
        assert!((plan.trigger_time - 184.0).abs() < 1e-9);
        assert!((plan.crossfade_duration - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggressive_outro_low_energy_waits_one_beat() {
        let mut current = AudioAnalysis::empty(240.0, 60.0);
        current.bpm = Some(120.0);
        current.first_beat_pos = Some(0.0);
        current.fade_out_pos = Some(235.0);
        current.vocal_out_pos = Some(180.0);
        current.outro_energy_level = Some(-20.0);
        current.cut_out_pos = Some(235.0);
        let next = bar_aligned_next();

        let plan = plan(&base_input(&current, &next)).expect("plan");
        // One beat past the last vocal: beat 361 at 0.5 s/beat.
        assert!((plan.trigger_time - 180.5).abs() < 1e-9);
        // Low-energy cap is 5 s.
        assert!((plan.crossfade_duration - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggressive_outro_skipped_for_head_analysis() {
        let mut current = AudioAnalysis::empty(240.0, 60.0);
        current.head = true;
        current.bpm = Some(120.0);
        current.first_beat_pos = Some(0.0);
        current.fade_out_pos = Some(235.0);
        current.vocal_out_pos = Some(180.0);
        current.outro_energy_level = Some(-8.0);
        current.cut_out_pos = Some(235.0);
        let next = bar_aligned_next();

        let plan = plan(&base_input(&current, &next)).expect("plan");
        // Snapped fallback trigger, untouched by the outro pass.
        assert!(plan.trigger_time > 220.0);
    }

    #[test]
    fn test_mashup_plan_copied_verbatim() {
        let current = AudioAnalysis::empty(180.0, 60.0);
        let next = AudioAnalysis::empty(200.0, 60.0);
        let long_mix = AdvancedTransition {
            start_time_current: 100.0,
            start_time_next: 30.0,
            duration: 16.0,
            pitch_shift_semitones: -1.0,
            playback_rate: 0.98,
            automation_current: vec![AutomationPoint {
                time: 0.0,
                target: AutomationTarget::Gain(1.0),
            }],
            automation_next: vec![AutomationPoint {
                time: 4.0,
                target: AutomationTarget::FilterHz(400.0),
            }],
            strategy: "Bass Swap+Mashup".to_string(),
        };
        let mut input = base_input(&current, &next);
        input.long_mix = Some(&long_mix);

        let plan = plan(&input).expect("plan");
        assert!((plan.trigger_time - 100.0).abs() < 1e-9);
        assert!((plan.crossfade_duration - 16.0).abs() < 1e-9);
        assert_eq!(plan.start_seek_ms, 30_000);
        assert!((plan.initial_rate - 0.98).abs() < 1e-9);
        assert!((plan.ui_switch_delay - 8.0).abs() < 1e-9);
        assert_eq!(plan.mix_type, MixType::BassSwap);
        assert!((plan.pitch_shift - -1.0).abs() < 1e-9);
        assert_eq!(plan.automation_current, long_mix.automation_current);
        assert_eq!(plan.automation_next, long_mix.automation_next);
    }

    #[test]
    fn test_proposal_clamped_into_current_track() {
        let mut current = AudioAnalysis::empty(180.0, 60.0);
        current.loudness = Some(-9.0);
        let next = bar_aligned_next();
        let proposal = TransitionProposal {
            duration: 12.0,
            current_track_mix_out: 380.0, // past the track end
            next_track_mix_in: 6.0,
            mix_type: MixType::Default,
            filter_strategy: "Bass Swap sweep".to_string(),
            compatibility_score: 0.8,
            key_compatible: true,
            bpm_compatible: true,
        };
        let mut input = base_input(&current, &next);
        input.proposal = Some(&proposal);

        let plan = plan(&input).expect("plan");
        assert!((plan.trigger_time - 179.0).abs() < 1e-9);
        assert!((plan.crossfade_duration - 1.0).abs() < 1e-9);
        assert_eq!(plan.start_seek_ms, 6000);
        assert_eq!(plan.mix_type, MixType::BassSwap);
    }

    #[test]
    fn test_short_proposal_falls_through_to_fallback() {
        let current = bar_aligned_current();
        let next = bar_aligned_next();
        let proposal = TransitionProposal {
            duration: 0.4, // too short to be a mix
            current_track_mix_out: 100.0,
            next_track_mix_in: 0.0,
            mix_type: MixType::Default,
            filter_strategy: String::new(),
            compatibility_score: 0.1,
            key_compatible: false,
            bpm_compatible: false,
        };
        let mut input = base_input(&current, &next);
        input.proposal = Some(&proposal);

        let plan = plan(&input).expect("plan");
        assert!((plan.trigger_time - 168.75).abs() < 1e-9);
    }

    #[test]
    fn test_bpm_alignment_within_band() {
        let mut current = AudioAnalysis::empty(300.0, 60.0);
        current.bpm = Some(128.0);
        current.bpm_confidence = 0.8;
        current.first_beat_pos = Some(0.0);
        current.fade_out_pos = Some(295.0);
        let mut next = AudioAnalysis::empty(300.0, 60.0);
        next.bpm = Some(130.0);
        next.bpm_confidence = 0.8;

        let plan = plan(&base_input(&current, &next)).expect("plan");
        assert!((plan.initial_rate - 128.0 / 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_bpm_alignment_band_is_inclusive() {
        let mut current = AudioAnalysis::empty(300.0, 60.0);
        current.bpm = Some(97.0);
        current.bpm_confidence = 0.8;
        current.first_beat_pos = Some(0.0);
        current.fade_out_pos = Some(295.0);
        let mut next = AudioAnalysis::empty(300.0, 60.0);
        next.bpm = Some(100.0);
        next.bpm_confidence = 0.8;

        // Ratio exactly 0.97 still aligns.
        let plan = plan(&base_input(&current, &next)).expect("plan");
        assert!((plan.initial_rate - 0.97).abs() < 1e-9);
    }

    #[test]
    fn test_low_confidence_bpm_is_ignored() {
        let mut current = AudioAnalysis::empty(300.0, 60.0);
        current.bpm = Some(128.0);
        current.bpm_confidence = 0.3;
        current.first_beat_pos = Some(0.0);
        current.fade_out_pos = Some(295.0);
        let mut next = AudioAnalysis::empty(300.0, 60.0);
        next.bpm = Some(130.0);
        next.bpm_confidence = 0.8;

        let plan = plan(&base_input(&current, &next)).expect("plan");
        assert!((plan.initial_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fade_out_before_vocals_distrusted() {
        // A fade-out that would clip vocals pushes the exit to the full
        // duration.
        let mut current = AudioAnalysis::empty(200.0, 60.0);
        current.fade_out_pos = Some(150.0);
        current.vocal_out_pos = Some(195.0);
        let next = bar_aligned_next();

        let plan = plan(&base_input(&current, &next)).expect("plan");
        assert!((plan.trigger_time - 192.0).abs() < 1e-9); // 200 - 8
    }

    #[test]
    fn test_too_short_current_track_yields_none() {
        let current = AudioAnalysis::empty(6.0, 60.0);
        let next = bar_aligned_next();
        // An 8 s fade cannot fit a 6 s track even after clamping.
        assert!(plan(&base_input(&current, &next)).is_none());
    }

    #[test]
    fn test_seek_past_next_duration_yields_none() {
        let current = AudioAnalysis::empty(180.0, 60.0);
        let mut next = AudioAnalysis::empty(20.0, 60.0);
        next.fade_in_pos = Some(25.0); // beyond the track
        assert!(plan(&base_input(&current, &next)).is_none());
    }

    #[test]
    fn test_snap_reverted_when_it_starves_the_fade() {
        // 24 BPM → 10 s bars. Raw trigger 165 would snap up to 170 and
        // leave only 3 s of track; the unsnapped trigger wins.
        let mut current = AudioAnalysis::empty(173.0, 60.0);
        current.bpm = Some(24.0);
        current.first_beat_pos = Some(0.0);
        let mut next = AudioAnalysis::empty(200.0, 60.0);
        next.bpm = Some(24.0);

        let plan = plan(&base_input(&current, &next)).expect("plan");
        assert!((plan.trigger_time - 165.0).abs() < 1e-9);
    }

    #[test]
    fn test_min_fade_floor_respected() {
        // Trigger lands 0.3 s before the end after clamping: rejected
        // rather than fading for less than half a second.
        let mut current = AudioAnalysis::empty(100.0, 60.0);
        current.fade_out_pos = Some(99.9);
        current.vocal_out_pos = Some(99.8);
        let next = bar_aligned_next();
        let proposal = TransitionProposal {
            duration: 2.0,
            current_track_mix_out: 99.8,
            next_track_mix_in: 0.0,
            mix_type: MixType::Default,
            filter_strategy: String::new(),
            compatibility_score: 0.5,
            key_compatible: true,
            bpm_compatible: true,
        };
        let mut input = base_input(&current, &next);
        input.proposal = Some(&proposal);

        let plan = plan(&input).expect("plan");
        assert!(plan.crossfade_duration >= MIN_FADE);
        assert!(plan.trigger_time + plan.crossfade_duration <= current.duration + 1e-9);
    }
}
