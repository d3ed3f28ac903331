/// The AutoMix engine
///
/// Long-lived orchestrator behind the player: watches the playing track,
/// prepares analyses for the upcoming boundary, asks the planner for a
/// transition and executes it through the scheduler and the engine pair.
/// Driven cooperatively — the host calls [`AutomixEngine::tick`] on every
/// playback time update and forwards user actions (seek, skip, pause)
/// explicitly. Everything that must happen at audio-clock precision runs as
/// scheduler jobs; everything else happens inside these calls.
///
/// Failure is always graceful: an unavailable analyser or a rejected plan
/// degrades the boundary to the player's ordinary hard cut, and a stale
/// session token silences superseded work.

use crate::analysis::{
    AdvancedTransition, AudioAnalysis, TrackDescriptor, TransitionProposal,
};
use crate::analyzer::{Analyzer, AnalyzerGateway, Pending};
use crate::cache::AnalysisCache;
use crate::config::AutomixConfig;
use crate::crossfade::{self, CrossfadeContext, SwitchCallback};
use crate::engine_pair::{EngineFactory, EnginePair, MasterBus, PlayOptions};
use crate::error::AutomixError;
use crate::planner::{self, PlannerInput, TransitionPlan};
use crate::scheduler::{AudioClock, Scheduler};
use crate::state::{AutomixState, Preconditions, StateCell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Everything the engine needs from the host, injected once at startup.
pub struct AutomixDeps {
    pub analyzer: Arc<dyn Analyzer>,
    pub cache: Arc<AnalysisCache>,
    pub factory: Box<dyn EngineFactory>,
    pub clock: Arc<dyn AudioClock>,
    pub config: AutomixConfig,
    /// Flips the logical "now playing" at the UI commit. The host updates
    /// its queue state and calls [`AutomixEngine::on_track_switched`] back.
    pub on_switch: SwitchCallback,
    /// False on platforms without the native analyser; AutoMix stays idle.
    pub platform_supports_analysis: bool,
}

/// One request slot for the upcoming boundary.
enum Slot<T> {
    Idle,
    Waiting(Pending<T>),
    Ready(T),
    Failed(String),
}

impl<T> Slot<T> {
    fn poll(&mut self) {
        if let Slot::Waiting(pending) = self {
            if let Some(result) = pending.take_result() {
                *self = match result {
                    Ok(value) => Slot::Ready(value),
                    Err(err) => Slot::Failed(err),
                };
            }
        }
    }

    fn settled(&self) -> bool {
        matches!(self, Slot::Ready(_) | Slot::Failed(_))
    }

    fn ready(&self) -> Option<&T> {
        match self {
            Slot::Ready(value) => Some(value),
            _ => None,
        }
    }

    fn failure(&self) -> Option<&str> {
        match self {
            Slot::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// In-flight analysis work for one current → next boundary. Planning waits
/// for every slot to settle so consecutive planner calls see identical
/// inputs; the two suggestions may settle as failures and stay optional.
struct Boundary {
    current_full: Slot<AudioAnalysis>,
    next_head: Slot<AudioAnalysis>,
    proposal: Slot<TransitionProposal>,
    long_mix: Slot<AdvancedTransition>,
    requested: bool,
}

impl Boundary {
    fn new() -> Self {
        Self {
            current_full: Slot::Idle,
            next_head: Slot::Idle,
            proposal: Slot::Idle,
            long_mix: Slot::Idle,
            requested: false,
        }
    }

    fn poll(&mut self) {
        self.current_full.poll();
        self.next_head.poll();
        self.proposal.poll();
        self.long_mix.poll();
    }

    fn all_settled(&self) -> bool {
        self.current_full.settled()
            && self.next_head.settled()
            && self.proposal.settled()
            && self.long_mix.settled()
    }
}

/// The AutoMix subsystem. One instance per player, alive for the process.
pub struct AutomixEngine {
    config: AutomixConfig,
    gateway: AnalyzerGateway,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn AudioClock>,
    pair: Arc<Mutex<EnginePair>>,
    state: Arc<StateCell>,
    session: Arc<AtomicU64>,
    cooldown_until: Arc<Mutex<f64>>,
    on_switch: SwitchCallback,
    platform_supports_analysis: bool,

    personal_radio: bool,
    playing: bool,
    current: Option<TrackDescriptor>,
    next: Option<(TrackDescriptor, usize)>,

    boundary: Option<Boundary>,
    /// The plan whose trigger is armed on the scheduler.
    armed_plan: Option<TransitionPlan>,
    /// Set when the analyser failed for this boundary; cleared on the next
    /// track. While set, the boundary falls through to a hard cut.
    analyser_failed: bool,
}

impl AutomixEngine {
    pub fn new(deps: AutomixDeps) -> Self {
        let session = Arc::new(AtomicU64::new(1));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&deps.clock), Arc::clone(&session)));
        let pair = Arc::new(Mutex::new(EnginePair::new(
            deps.factory,
            Arc::new(MasterBus::new()),
        )));
        Self {
            config: deps.config,
            gateway: AnalyzerGateway::new(deps.analyzer, deps.cache),
            scheduler,
            clock: deps.clock,
            pair,
            state: Arc::new(StateCell::new()),
            session,
            cooldown_until: Arc::new(Mutex::new(0.0)),
            on_switch: deps.on_switch,
            platform_supports_analysis: deps.platform_supports_analysis,
            personal_radio: false,
            playing: false,
            current: None,
            next: None,
            boundary: None,
            armed_plan: None,
            analyser_failed: false,
        }
    }

    // --- Host surface ---

    pub fn state(&self) -> AutomixState {
        self.state.get()
    }

    pub fn session_token(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn pair(&self) -> &Arc<Mutex<EnginePair>> {
        &self.pair
    }

    pub fn set_config(&mut self, config: AutomixConfig) {
        self.config = config;
    }

    pub fn set_personal_radio(&mut self, on: bool) {
        self.personal_radio = on;
    }

    /// A user-initiated play: new session, new boundary, playback started
    /// on the primary engine.
    pub fn on_play_request(
        &mut self,
        track: TrackDescriptor,
        next: Option<(TrackDescriptor, usize)>,
    ) -> anyhow::Result<()> {
        self.session.fetch_add(1, Ordering::SeqCst);
        let url = crossfade::track_url(&track);
        {
            let mut pair = self.pair.lock();
            let engine = pair.ensure_primary()?;
            engine.play(&url, &PlayOptions::default())?;
        }
        self.begin_track(track, next);
        self.playing = true;
        Ok(())
    }

    /// The logical track flipped through an AutoMix handover; playback is
    /// already running on the (new) primary engine.
    pub fn on_track_switched(
        &mut self,
        track: TrackDescriptor,
        next: Option<(TrackDescriptor, usize)>,
    ) {
        self.begin_track(track, next);
        self.playing = true;
    }

    /// The queue beyond the current track changed.
    pub fn set_next_track(&mut self, next: Option<(TrackDescriptor, usize)>) {
        if self.next != next {
            self.next = next;
            self.boundary = None;
            self.disarm_plan();
        }
    }

    pub fn on_pause(&mut self) {
        self.playing = false;
        self.disarm_plan();
        if self.state.get() == AutomixState::Monitoring {
            self.state.set(AutomixState::Idle);
        }
    }

    pub fn on_resume(&mut self) {
        self.playing = true;
    }

    /// A user seek invalidates any armed trigger; monitoring restarts from
    /// the new position on the next tick.
    pub fn on_user_seek(&mut self, _position_sec: f64) {
        match self.state.get() {
            AutomixState::Scheduled => {
                self.disarm_plan();
            }
            AutomixState::Monitoring => {
                self.state.set(AutomixState::Idle);
            }
            _ => {}
        }
    }

    /// User skipped to `track`. Aborts any crossfade in flight, bumps the
    /// session twice (the skip, then the fresh play) and starts the new
    /// selection on a clean primary engine.
    pub fn on_user_skip(
        &mut self,
        track: TrackDescriptor,
        next: Option<(TrackDescriptor, usize)>,
    ) -> anyhow::Result<()> {
        // Any live fade and any armed trigger run under the current epoch.
        let live_token = self.session_token();
        self.session.fetch_add(1, Ordering::SeqCst);
        let new_token = self.session.fetch_add(1, Ordering::SeqCst) + 1;

        self.scheduler.clear_group(&arm_group(live_token));
        self.armed_plan = None;
        crossfade::abort(&self.context(), live_token, new_token);

        let url = crossfade::track_url(&track);
        {
            let mut pair = self.pair.lock();
            let engine = pair.ensure_primary()?;
            engine.play(&url, &PlayOptions::default())?;
        }
        self.begin_track(track, next);
        self.playing = true;
        self.state.set(AutomixState::Monitoring);
        Ok(())
    }

    /// Main driver, called on every playback time update with the current
    /// position in seconds.
    pub fn tick(&mut self, position_sec: f64) {
        self.drain_engine_events();

        match self.state.get() {
            AutomixState::Idle => {
                if self.preconditions().allow_monitoring()
                    && self.current.is_some()
                    && !self.analyser_failed
                {
                    self.state.set(AutomixState::Monitoring);
                }
            }
            AutomixState::Monitoring => self.tick_monitoring(position_sec),
            AutomixState::Scheduled | AutomixState::Transitioning => {
                // Scheduler jobs drive these; nothing to do here.
            }
            AutomixState::Cooldown => {
                if self.clock.now() >= *self.cooldown_until.lock() {
                    self.state
                        .transition(AutomixState::Cooldown, AutomixState::Monitoring);
                }
            }
        }
    }

    /// Tear down every engine and flush the cache. The engine is unusable
    /// afterwards.
    pub fn shutdown(&mut self) {
        self.session.fetch_add(1, Ordering::SeqCst);
        self.pair.lock().teardown_all();
        self.gateway.cache().flush();
        self.state.set(AutomixState::Idle);
    }

    // --- Internals ---

    fn preconditions(&self) -> Preconditions {
        Preconditions {
            automix_enabled: self.config.enable_automix,
            track_playing: self.playing,
            personal_radio: self.personal_radio,
            platform_supports_analysis: self.platform_supports_analysis,
        }
    }

    fn context(&self) -> CrossfadeContext {
        CrossfadeContext {
            pair: Arc::clone(&self.pair),
            scheduler: Arc::clone(&self.scheduler),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
            cooldown_until: Arc::clone(&self.cooldown_until),
            on_switch: Arc::clone(&self.on_switch),
        }
    }

    fn begin_track(
        &mut self,
        track: TrackDescriptor,
        next: Option<(TrackDescriptor, usize)>,
    ) {
        self.current = Some(track);
        self.next = next;
        self.boundary = None;
        self.armed_plan = None;
        self.analyser_failed = false;
    }

    /// Cancel an armed (not yet fired) trigger and fall back to monitoring.
    fn disarm_plan(&mut self) {
        if let Some(plan) = self.armed_plan.take() {
            self.scheduler.clear_group(&arm_group(plan.token));
            self.state
                .transition(AutomixState::Scheduled, AutomixState::Monitoring);
        }
    }

    fn drain_engine_events(&mut self) {
        for (role, event) in self.pair.lock().poll_events() {
            log::trace!("engine event {role:?}: {event:?}");
        }
    }

    fn tick_monitoring(&mut self, position_sec: f64) {
        if !self.preconditions().allow_monitoring() || self.analyser_failed {
            self.state.set(AutomixState::Idle);
            return;
        }
        if self.next.is_none() {
            // Queue emptied: nothing to transition into.
            self.state.set(AutomixState::Idle);
            return;
        }
        let (Some(current), Some((next, next_index))) =
            (self.current.as_ref(), self.next.as_ref())
        else {
            return;
        };
        let (Some(current_path), Some(next_path)) = (&current.path, &next.path) else {
            // Non-local sources cannot be analysed; hard cut at the end.
            return;
        };

        let remaining = current.duration_sec() - position_sec;
        if remaining >= self.config.monitor_window() {
            return;
        }

        let window = self.config.analyze_window();
        let boundary = self.boundary.get_or_insert_with(Boundary::new);

        if !boundary.requested {
            boundary.requested = true;
            boundary.next_head = Slot::Waiting(self.gateway.analyze_head(next_path, window));
            boundary.current_full = Slot::Waiting(self.gateway.analyze(current_path, window));
            boundary.proposal =
                Slot::Waiting(self.gateway.suggest_transition(current_path, next_path));
            boundary.long_mix =
                Slot::Waiting(self.gateway.suggest_long_mix(current_path, next_path));
        }

        boundary.poll();
        if !boundary.all_settled() {
            return;
        }

        // A failed required analysis degrades this boundary to a hard cut.
        if let Some(err) = boundary
            .current_full
            .failure()
            .or_else(|| boundary.next_head.failure())
        {
            log::warn!("analyser unavailable for boundary, falling back to hard cut: {err}");
            self.analyser_failed = true;
            self.state.set(AutomixState::Idle);
            return;
        }
        let (Some(current_analysis), Some(next_analysis)) =
            (boundary.current_full.ready(), boundary.next_head.ready())
        else {
            return;
        };

        let input = PlannerInput {
            current: current_analysis,
            next: next_analysis,
            proposal: boundary.proposal.ready(),
            long_mix: boundary.long_mix.ready(),
            position: position_sec,
            token: self.session.load(Ordering::SeqCst),
            next_song_ref: next.id.clone(),
            next_index: *next_index,
        };
        let Some(plan) = planner::plan(&input) else {
            log::debug!("no viable plan yet, staying in monitoring");
            return;
        };

        let next_track = next.clone();
        let current_loudness = current_analysis.loudness;
        let next_loudness = next_analysis.loudness;

        if plan.trigger_time > position_sec {
            let fire_at = self.clock.now() + (plan.trigger_time - position_sec);
            self.arm_plan(plan, fire_at, current_loudness, next_loudness, next_track);
        } else if self
            .state
            .transition(AutomixState::Monitoring, AutomixState::Transitioning)
        {
            // Trigger already passed: fire immediately under a new epoch.
            let plan = self.stamp_crossfade_token(plan);
            fire_crossfade(
                &self.context(),
                &plan,
                current_loudness,
                next_loudness,
                &next_track,
                &self.config,
            );
        }
    }

    /// Queue the trigger on the scheduler and move to `Scheduled`.
    fn arm_plan(
        &mut self,
        plan: TransitionPlan,
        fire_at: f64,
        current_loudness: Option<f64>,
        next_loudness: Option<f64>,
        next_track: TrackDescriptor,
    ) {
        if !self
            .state
            .transition(AutomixState::Monitoring, AutomixState::Scheduled)
        {
            return;
        }

        let ctx = self.context();
        let session = Arc::clone(&self.session);
        let state = Arc::clone(&self.state);
        let cfg = self.config.clone();
        let armed_token = plan.token;
        let fire_plan = plan.clone();
        self.armed_plan = Some(plan);

        self.scheduler.run_at(
            &arm_group(armed_token),
            fire_at,
            armed_token,
            Box::new(move || {
                // The scheduler already dropped this job if the session
                // moved on; the state gate guards against a seek that went
                // back to monitoring without a token bump.
                if !state.transition(AutomixState::Scheduled, AutomixState::Transitioning) {
                    return Ok(());
                }
                // Crossfade start: new session epoch; every queued step of
                // this fade carries the new token.
                let token = session.fetch_add(1, Ordering::SeqCst) + 1;
                let mut plan = fire_plan.clone();
                plan.token = token;
                fire_crossfade(
                    &ctx,
                    &plan,
                    current_loudness,
                    next_loudness,
                    &next_track,
                    &cfg,
                );
                Ok(())
            }),
        );
    }

    /// Bump the session for an immediately fired crossfade and restamp the
    /// plan with the new epoch.
    fn stamp_crossfade_token(&self, mut plan: TransitionPlan) -> TransitionPlan {
        plan.token = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        plan
    }
}

fn arm_group(token: u64) -> String {
    format!("automix-arm-{token}")
}

/// Execute a plan now; a prime failure falls through to a plain play of the
/// next track so the listener always ends up on it.
fn fire_crossfade(
    ctx: &CrossfadeContext,
    plan: &TransitionPlan,
    current_loudness: Option<f64>,
    next_loudness: Option<f64>,
    next_track: &TrackDescriptor,
    cfg: &AutomixConfig,
) {
    match crossfade::begin(ctx, plan, current_loudness, next_loudness, next_track, cfg) {
        Ok(()) => {}
        Err(AutomixError::EnginePrimeFailure(err)) => {
            log::warn!("crossfade aborted at prime, playing next track plainly: {err:#}");
            let url = crossfade::track_url(next_track);
            let mut pair = ctx.pair.lock();
            match pair.ensure_primary() {
                Ok(engine) => {
                    if let Err(err) = engine.play(&url, &PlayOptions::default()) {
                        log::warn!("plain fallback play failed: {err:#}");
                    }
                }
                Err(err) => log::warn!("no engine for fallback play: {err:#}"),
            }
        }
        Err(other) => {
            log::debug!("crossfade did not start: {other}");
        }
    }
}
