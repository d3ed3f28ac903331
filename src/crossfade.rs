/// The dual-engine crossfade protocol
///
/// Executes a [`TransitionPlan`] against the engine pair: prime the
/// incoming engine muted, pre-apply loudness compensation, start it at the
/// planned seek, then drive opposing gain ramps, the bass-swap filter
/// sweeps and any analyser-authored automation through the scheduler, all
/// aligned to the audio clock. The logical "now playing" flips once at the
/// plan's UI-switch delay; the outgoing engine keeps fading and is torn
/// down a safety margin after the fade completes.
///
/// Two scheduler groups per crossfade: the main group holds everything up
/// to and including the UI commit (which clears it), the tail group holds
/// rate restoration and teardown so they survive the commit.

use crate::analysis::{AutomationPoint, AutomationTarget, MixType, TrackDescriptor};
use crate::config::AutomixConfig;
use crate::engine_pair::{EnginePair, EngineRole, PlayOptions};
use crate::error::AutomixError;
use crate::gain::{self, FadeCurve};
use crate::planner::TransitionPlan;
use crate::scheduler::{AudioClock, Scheduler};
use crate::state::{AutomixState, StateCell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Volume automations are anchored this long before their ramp starts, so
/// concurrent reads and writes on the audio clock cannot glitch.
pub const PREARM_LEAD: f64 = 0.020;

/// The retired engine is destroyed this long after the fade completes.
pub const TEARDOWN_MARGIN: f64 = 1.0;

/// Gain ramp length when a crossfade is aborted mid-fade.
pub const ABORT_FADE: f64 = 0.2;

/// Rate restoration ramp length after a BPM-aligned fade.
pub const RATE_RESTORE_SEC: f64 = 2.0;
const RATE_RESTORE_STEPS: u32 = 8;

/// Bass-swap sweep endpoints.
const BASS_SWAP_HZ: f64 = 400.0;
const BASS_SWAP_FLOOR_HZ: f64 = 10.0;

/// Host callback that flips the logical "now playing". Runs exactly once
/// per crossfade.
pub type SwitchCallback = Arc<Mutex<dyn FnMut(&TrackDescriptor, usize) + Send>>;

/// Shared services a crossfade runs against. Cheap to clone; scheduler jobs
/// capture clones.
#[derive(Clone)]
pub struct CrossfadeContext {
    pub pair: Arc<Mutex<EnginePair>>,
    pub scheduler: Arc<Scheduler>,
    pub clock: Arc<dyn AudioClock>,
    pub state: Arc<StateCell>,
    /// Audio-clock time at which the cooldown ends; written by the
    /// teardown job, read by the monitoring loop.
    pub cooldown_until: Arc<Mutex<f64>>,
    pub on_switch: SwitchCallback,
}

pub fn group_name(token: u64) -> String {
    format!("crossfade-{token}")
}

pub fn tail_group_name(token: u64) -> String {
    format!("crossfade-{token}-tail")
}

/// Run the crossfade described by `plan`, scheduling every later step.
/// Called at trigger time with the session token already validated.
///
/// On a prime failure the UI switch is committed immediately with no
/// crossfade and the error is returned so the caller can fall through to a
/// plain play of the next track.
pub fn begin(
    ctx: &CrossfadeContext,
    plan: &TransitionPlan,
    current_loudness: Option<f64>,
    next_loudness: Option<f64>,
    next_track: &TrackDescriptor,
    cfg: &AutomixConfig,
) -> Result<(), AutomixError> {
    let t0 = ctx.clock.now();
    let group = group_name(plan.token);
    let tail_group = tail_group_name(plan.token);
    let duration = plan.crossfade_duration;
    let committed = Arc::new(AtomicBool::new(false));

    ctx.state.set(AutomixState::Transitioning);

    let url = track_url(next_track);
    let prefade_gain = gain::prefade_target(
        current_loudness,
        next_loudness,
        next_track.replay_gain.as_ref(),
        cfg.replay_gain_mode,
    );

    {
        let mut pair = ctx.pair.lock();

        // Prime the incoming engine: muted, on the shared graph, rate
        // matched when the platform allows it.
        let engine = match pair.prime_pending() {
            Ok(engine) => engine,
            Err(err) => {
                drop(pair);
                prime_failure_fallback(ctx, plan, next_track, &committed);
                return Err(AutomixError::EnginePrimeFailure(err));
            }
        };
        if engine.caps().supports_rate && plan.initial_rate != 1.0 {
            engine.set_rate(plan.initial_rate);
        }
        if plan.mix_type == MixType::BassSwap {
            engine.set_high_pass_q(1.0);
            engine.set_high_pass_filter(BASS_SWAP_HZ, 0.0);
        }
        engine.set_replay_gain(prefade_gain);

        let play = engine.play(
            &url,
            &PlayOptions {
                auto_play: true,
                seek_sec: plan.start_seek_ms as f64 / 1000.0,
                fade_in: false,
                fade_duration: 0.0,
                fade_curve: cfg.fade_curve,
            },
        );
        if let Err(err) = play {
            pair.drop_pending();
            drop(pair);
            prime_failure_fallback(ctx, plan, next_track, &committed);
            return Err(AutomixError::EnginePrimeFailure(err));
        }

        // Anchor both gain stages at their current values; the ramps armed
        // below start one pre-arm lead later.
        if let Some(primary) = pair.primary() {
            if plan.mix_type == MixType::BassSwap {
                primary.set_high_pass_q(1.0);
            }
            let held = primary.volume();
            primary.set_volume(held);
        }
    }

    // Opposing gain ramps across the fade. Loudness compensation sits in
    // the pending engine's replay-gain stage, so its volume ramps 0 → 1.
    // A mashup plan that authors its own gain curve for a side suppresses
    // the default ramp on that side.
    let ramp_start = t0 + PREARM_LEAD;
    let curve = cfg.fade_curve;
    let ramp_pending = !has_gain_automation(&plan.automation_next);
    let ramp_primary = !has_gain_automation(&plan.automation_current);
    {
        let pair = Arc::clone(&ctx.pair);
        ctx.scheduler.run_at(
            &group,
            ramp_start,
            plan.token,
            Box::new(move || {
                let mut pair = pair.lock();
                if ramp_pending {
                    if let Some(pending) = pair.pending() {
                        pending.ramp_volume_to(1.0, duration, curve);
                    }
                }
                if ramp_primary {
                    if let Some(primary) = pair.primary() {
                        primary.ramp_volume_to(0.0, duration, curve);
                    }
                }
                Ok(())
            }),
        );
    }

    // Bass swap: sweep the outgoing low end up and the incoming one back
    // down, exponentially, armed on the engines' own parameter clocks.
    if plan.mix_type == MixType::BassSwap {
        let pair = Arc::clone(&ctx.pair);
        ctx.scheduler.schedule(
            &group,
            t0,
            plan.token,
            Box::new(move || {
                let mut pair = pair.lock();
                if let Some(primary) = pair.primary() {
                    primary.set_high_pass_filter_at(BASS_SWAP_FLOOR_HZ, t0);
                    primary.ramp_high_pass_filter_to_at(BASS_SWAP_HZ, t0 + duration);
                }
                if let Some(pending) = pair.pending() {
                    pending.ramp_high_pass_filter_to_at(BASS_SWAP_FLOOR_HZ, t0 + duration);
                }
                Ok(())
            }),
        );
    }

    // Analyser-authored automation (mashup plans).
    schedule_automation(
        ctx,
        &group,
        plan.token,
        EngineRole::Primary,
        &plan.automation_current,
        t0,
    );
    schedule_automation(
        ctx,
        &group,
        plan.token,
        EngineRole::Pending,
        &plan.automation_next,
        t0,
    );

    // UI commit: flip the logical track once, hand the engines over, and
    // retire this crossfade's main group.
    {
        let ctx_commit = ctx.clone();
        let committed = Arc::clone(&committed);
        let next_track = next_track.clone();
        let next_index = plan.next_index;
        let group_to_clear = group.clone();
        ctx.scheduler.run_at(
            &group,
            t0 + plan.ui_switch_delay,
            plan.token,
            Box::new(move || {
                if committed.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                ctx_commit.pair.lock().commit_handover();
                {
                    let mut on_switch = ctx_commit.on_switch.lock();
                    (&mut *on_switch)(&next_track, next_index);
                }
                ctx_commit.state.transition(
                    AutomixState::Transitioning,
                    AutomixState::Monitoring,
                );
                ctx_commit.scheduler.clear_group(&group_to_clear);
                Ok(())
            }),
        );
    }

    // Rate restoration: a short linear ramp back to the configured rate,
    // synthesised as scheduler steps since engines only expose set_rate.
    if plan.initial_rate != 1.0 {
        let step_len = RATE_RESTORE_SEC / f64::from(RATE_RESTORE_STEPS);
        for step in 1..=RATE_RESTORE_STEPS {
            let fraction = f64::from(step) / f64::from(RATE_RESTORE_STEPS);
            let rate =
                plan.initial_rate + (cfg.playback_rate - plan.initial_rate) * fraction;
            let pair = Arc::clone(&ctx.pair);
            ctx.scheduler.run_at(
                &tail_group,
                t0 + duration + step_len * f64::from(step),
                plan.token,
                Box::new(move || {
                    let mut pair = pair.lock();
                    if let Some(primary) = pair.primary() {
                        if primary.caps().supports_rate {
                            primary.set_rate(rate);
                        }
                    }
                    Ok(())
                }),
            );
        }
    }

    // Old-engine teardown, one safety margin after the fade. Also enters
    // the cooldown that suppresses immediate re-planning.
    {
        let ctx_teardown = ctx.clone();
        let cooldown = cfg.cooldown.as_secs_f64();
        ctx.scheduler.run_at(
            &tail_group,
            t0 + duration + TEARDOWN_MARGIN,
            plan.token,
            Box::new(move || {
                ctx_teardown.pair.lock().teardown_retired();
                let entered = ctx_teardown
                    .state
                    .transition(AutomixState::Transitioning, AutomixState::Cooldown)
                    || ctx_teardown
                        .state
                        .transition(AutomixState::Monitoring, AutomixState::Cooldown);
                if entered {
                    *ctx_teardown.cooldown_until.lock() =
                        ctx_teardown.clock.now() + cooldown;
                }
                Ok(())
            }),
        );
    }

    Ok(())
}

/// Abort a crossfade in flight: kill this crossfade's jobs (including the
/// pending teardown), ramp every live engine to silence over [`ABORT_FADE`]
/// and destroy them right after. The engines leave the pair immediately, so
/// a fresh playback started next is untouched by the delayed stop. The
/// caller has already bumped the session token; the stop job carries the
/// new one.
pub fn abort(ctx: &CrossfadeContext, old_token: u64, new_token: u64) {
    ctx.scheduler.clear_group(&group_name(old_token));
    ctx.scheduler.clear_group(&tail_group_name(old_token));

    let mut dying = ctx.pair.lock().take_all();
    for engine in &mut dying {
        engine.ramp_volume_to(0.0, ABORT_FADE, FadeCurve::Linear);
    }

    let dying = Mutex::new(Some(dying));
    ctx.scheduler.run_at(
        "crossfade-abort",
        ctx.clock.now() + ABORT_FADE,
        new_token,
        Box::new(move || {
            if let Some(engines) = dying.lock().take() {
                for mut engine in engines {
                    engine.stop();
                }
            }
            Ok(())
        }),
    );
}

/// Commit the UI switch with no crossfade after the pending engine failed,
/// leaving the old engine as the one to replace.
fn prime_failure_fallback(
    ctx: &CrossfadeContext,
    plan: &TransitionPlan,
    next_track: &TrackDescriptor,
    committed: &Arc<AtomicBool>,
) {
    log::warn!("pending engine failed to prime; committing switch without a fade");
    if !committed.swap(true, Ordering::SeqCst) {
        let mut on_switch = ctx.on_switch.lock();
        (&mut *on_switch)(next_track, plan.next_index);
    }
    ctx.scheduler.clear_group(&group_name(plan.token));
    ctx.scheduler.clear_group(&tail_group_name(plan.token));
    ctx.state.set(AutomixState::Monitoring);
}

/// Arm one engine's automation sequence. Gain points become timed linear
/// ramps from the previous point; filter points are armed on the engine's
/// parameter clock; Q changes apply at their instant.
fn schedule_automation(
    ctx: &CrossfadeContext,
    group: &str,
    token: u64,
    role: EngineRole,
    points: &[AutomationPoint],
    t0: f64,
) {
    let mut previous_time = 0.0;
    for point in points {
        let ramp_len = (point.time - previous_time).max(0.0);
        let fire_at = t0 + previous_time;
        let pair = Arc::clone(&ctx.pair);
        let target = point.target;
        let point_time = point.time;
        ctx.scheduler.run_at(
            group,
            fire_at,
            token,
            Box::new(move || {
                let mut pair = pair.lock();
                let engine = match role {
                    EngineRole::Primary => pair.primary(),
                    EngineRole::Pending => pair.pending(),
                };
                let Some(engine) = engine else { return Ok(()) };
                match target {
                    AutomationTarget::Gain(value) => {
                        engine.ramp_volume_to(value, ramp_len, FadeCurve::Linear);
                    }
                    AutomationTarget::FilterHz(hz) => {
                        engine.ramp_high_pass_filter_to_at(hz, t0 + point_time);
                    }
                    AutomationTarget::Q(q) => {
                        engine.set_high_pass_q(q);
                    }
                }
                Ok(())
            }),
        );
        previous_time = point.time;
    }
}

fn has_gain_automation(points: &[AutomationPoint]) -> bool {
    points
        .iter()
        .any(|point| matches!(point.target, AutomationTarget::Gain(_)))
}

pub(crate) fn track_url(track: &TrackDescriptor) -> String {
    track
        .path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| track.id.clone())
}
