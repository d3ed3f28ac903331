/// Dual playback engines on one output graph
///
/// An engine owns its decoder/source, its processed chain (the bass-swap
/// filter pair plus EQ) and a per-engine gain stage; both engines feed the
/// shared [`MasterBus`], which the AutoMix engine owns and which outlives
/// them. At most two engines are live at a time: `primary` (audible "now
/// playing") and `pending` (the incoming track being primed). During a
/// crossfade the outgoing engine is retired but kept fading; its terminal
/// events are masked so the player never reacts to a track "ending" that
/// the listener already left.

use crate::gain::FadeCurve;
use anyhow::Result;
use std::sync::Arc;

/// Capability flags reported by a platform engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineCaps {
    pub supports_rate: bool,
    pub supports_equalizer: bool,
    pub supports_spectrum: bool,
    pub supports_sink_id: bool,
}

/// Options for [`PlaybackEngine::play`].
#[derive(Debug, Clone)]
pub struct PlayOptions {
    pub auto_play: bool,
    /// Initial position, seconds.
    pub seek_sec: f64,
    pub fade_in: bool,
    pub fade_duration: f64,
    pub fade_curve: FadeCurve,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            auto_play: true,
            seek_sec: 0.0,
            fade_in: false,
            fade_duration: 0.0,
            fade_curve: FadeCurve::EqualPower,
        }
    }
}

/// Options for [`PlaybackEngine::pause`].
#[derive(Debug, Clone)]
pub struct PauseOptions {
    pub fade_out: bool,
    pub fade_duration: f64,
    pub fade_curve: FadeCurve,
    /// Keep the output graph running so a resume is glitch-free.
    pub keep_context_running: bool,
}

impl Default for PauseOptions {
    fn default() -> Self {
        Self {
            fade_out: true,
            fade_duration: 0.02,
            fade_curve: FadeCurve::Linear,
            keep_context_running: true,
        }
    }
}

/// Events emitted by a platform engine, delivered in order per engine.
/// Cross-engine ordering is not guaranteed.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Play,
    Pause,
    Ended,
    Error { code: i32, message: String },
    CanPlay,
    LoadStart,
    Seeking,
    Seeked,
    Waiting,
    Playing,
    TimeUpdate(f64),
    DurationChange(f64),
}

impl EngineEvent {
    /// Events that would make the player advance or surface an error.
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::Pause | EngineEvent::Ended | EngineEvent::Error { .. }
        )
    }
}

/// Contract every platform playback engine satisfies. The AutoMix engine
/// drives everything through this trait and never touches audio bytes.
///
/// Scheduled variants (`*_at`, `ramp_*_to_at`) take absolute times on the
/// audio output clock, letting the engine arm its own parameter automation
/// ahead of the deadline. Filter ramps approach their target exponentially,
/// matching how cutoff frequencies are perceived.
pub trait PlaybackEngine: Send {
    fn play(&mut self, url: &str, opts: &PlayOptions) -> Result<()>;
    fn pause(&mut self, opts: &PauseOptions) -> Result<()>;
    fn seek(&mut self, sec: f64) -> Result<()>;
    fn stop(&mut self);

    /// Playback position, seconds.
    fn position(&self) -> f64;

    fn volume(&self) -> f64;
    fn set_volume(&mut self, volume: f64);
    fn ramp_volume_to(&mut self, target: f64, duration_sec: f64, curve: FadeCurve);
    fn set_replay_gain(&mut self, linear: f64);

    /// No-op unless `caps().supports_rate`.
    fn set_rate(&mut self, rate: f64);

    fn set_high_pass_filter(&mut self, hz: f64, ramp_sec: f64);
    fn set_high_pass_q(&mut self, q: f64);
    fn set_high_pass_filter_at(&mut self, hz: f64, when_sec: f64);
    fn ramp_high_pass_filter_to_at(&mut self, hz: f64, when_sec: f64);

    fn set_low_pass_filter(&mut self, hz: f64, ramp_sec: f64);
    fn set_low_pass_q(&mut self, q: f64);
    fn set_low_pass_filter_at(&mut self, hz: f64, when_sec: f64);
    fn ramp_low_pass_filter_to_at(&mut self, hz: f64, when_sec: f64);

    /// No-op unless `caps().supports_sink_id`.
    fn set_sink_id(&mut self, device_id: &str) -> Result<()>;

    fn caps(&self) -> EngineCaps;

    /// Drain events that occurred since the last call, oldest first.
    fn take_events(&mut self) -> Vec<EngineEvent>;
}

/// Creates engines wired into the shared master bus.
pub trait EngineFactory: Send {
    fn create(&mut self, bus: &Arc<MasterBus>) -> Result<Box<dyn PlaybackEngine>>;
}

/// The shared output stage. Owned by the AutoMix engine, shared by both
/// playback engines during a crossfade and by no one else.
pub struct MasterBus {
    volume: parking_lot::Mutex<f64>,
    sink_id: parking_lot::Mutex<Option<String>>,
}

impl MasterBus {
    pub fn new() -> Self {
        Self {
            volume: parking_lot::Mutex::new(1.0),
            sink_id: parking_lot::Mutex::new(None),
        }
    }

    pub fn volume(&self) -> f64 {
        *self.volume.lock()
    }

    pub fn set_volume(&self, volume: f64) {
        *self.volume.lock() = volume.clamp(0.0, 1.0);
    }

    pub fn sink_id(&self) -> Option<String> {
        self.sink_id.lock().clone()
    }

    pub fn set_sink_id(&self, device_id: Option<String>) {
        *self.sink_id.lock() = device_id;
    }
}

impl Default for MasterBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Which slot an event came from, after masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRole {
    Primary,
    Pending,
}

/// Holder of the (at most) two live engines plus the one being retired.
pub struct EnginePair {
    factory: Box<dyn EngineFactory>,
    bus: Arc<MasterBus>,
    primary: Option<Box<dyn PlaybackEngine>>,
    pending: Option<Box<dyn PlaybackEngine>>,
    /// The outgoing engine between handover and teardown. Still fading;
    /// its events are masked.
    retired: Option<Box<dyn PlaybackEngine>>,
}

impl EnginePair {
    pub fn new(factory: Box<dyn EngineFactory>, bus: Arc<MasterBus>) -> Self {
        Self {
            factory,
            bus,
            primary: None,
            pending: None,
            retired: None,
        }
    }

    pub fn bus(&self) -> &Arc<MasterBus> {
        &self.bus
    }

    pub fn primary(&mut self) -> Option<&mut (dyn PlaybackEngine + '_)> {
        match self.primary.as_mut() {
            Some(e) => Some(&mut **e),
            None => None,
        }
    }

    pub fn pending(&mut self) -> Option<&mut (dyn PlaybackEngine + '_)> {
        match self.pending.as_mut() {
            Some(e) => Some(&mut **e),
            None => None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn has_retired(&self) -> bool {
        self.retired.is_some()
    }

    /// Create the primary engine if none exists, returning it.
    pub fn ensure_primary(&mut self) -> Result<&mut dyn PlaybackEngine> {
        let engine = match self.primary.take() {
            Some(engine) => engine,
            None => self.factory.create(&self.bus)?,
        };
        Ok(self.primary.insert(engine).as_mut())
    }

    /// Instantiate the incoming engine on the shared graph, muted. Replaces
    /// any leftover pending engine.
    pub fn prime_pending(&mut self) -> Result<&mut dyn PlaybackEngine> {
        if let Some(mut old) = self.pending.take() {
            old.stop();
        }
        let mut engine = self.factory.create(&self.bus)?;
        engine.set_volume(0.0);
        Ok(self.pending.insert(engine).as_mut())
    }

    /// Drop a pending engine that failed to prime.
    pub fn drop_pending(&mut self) {
        if let Some(mut engine) = self.pending.take() {
            engine.stop();
        }
    }

    /// Handover: the pending engine becomes primary, the outgoing engine is
    /// retired (still fading, events masked). No-op without a pending
    /// engine.
    pub fn commit_handover(&mut self) {
        if let Some(next) = self.pending.take() {
            if let Some(mut previous) = self.retired.take() {
                // A previous retiree still around means two overlapping
                // fades; drop the older one now.
                previous.stop();
            }
            self.retired = self.primary.take();
            self.primary = Some(next);
        }
    }

    /// Destroy the retired engine after its fade-out margin.
    pub fn teardown_retired(&mut self) {
        if let Some(mut engine) = self.retired.take() {
            engine.stop();
        }
    }

    /// Remove every engine from the pair without stopping them. The caller
    /// owns their shutdown; the pair is immediately free for a fresh
    /// primary.
    pub fn take_all(&mut self) -> Vec<Box<dyn PlaybackEngine>> {
        [
            self.primary.take(),
            self.pending.take(),
            self.retired.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Drop every engine (user skip / shutdown).
    pub fn teardown_all(&mut self) {
        for mut engine in self.take_all() {
            engine.stop();
        }
    }

    /// Drain events from all engines with the retiree masked: its terminal
    /// events are swallowed (logged at debug), everything else from it is
    /// dropped outright. Consumers never see a stale engine's lifecycle.
    pub fn poll_events(&mut self) -> Vec<(EngineRole, EngineEvent)> {
        let mut out = Vec::new();
        if let Some(engine) = self.primary.as_deref_mut() {
            out.extend(
                engine
                    .take_events()
                    .into_iter()
                    .map(|event| (EngineRole::Primary, event)),
            );
        }
        if let Some(engine) = self.pending.as_deref_mut() {
            out.extend(
                engine
                    .take_events()
                    .into_iter()
                    .map(|event| (EngineRole::Pending, event)),
            );
        }
        if let Some(engine) = self.retired.as_deref_mut() {
            for event in engine.take_events() {
                if event.is_terminal() {
                    log::debug!("masked {event:?} from retired engine");
                }
            }
        }
        out
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn pair() -> (EnginePair, Arc<parking_lot::Mutex<Vec<LogHandle>>>) {
        let factory = MockFactory::new();
        let logs = Arc::clone(&factory.logs);
        (
            EnginePair::new(Box::new(factory), Arc::new(MasterBus::new())),
            logs,
        )
    }

    #[test]
    fn test_prime_pending_starts_muted() {
        let (mut pair, logs) = pair();
        pair.ensure_primary().unwrap();
        pair.prime_pending().unwrap();

        let logs = logs.lock();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].lock().volume, 0.0);
    }

    #[test]
    fn test_commit_handover_swaps_roles() {
        let (mut pair, logs) = pair();
        pair.ensure_primary().unwrap();
        pair.prime_pending().unwrap();
        pair.commit_handover();

        assert!(!pair.has_pending());
        assert!(pair.has_retired());
        // Old primary is not stopped yet; it keeps fading until teardown.
        assert!(!logs.lock()[0].lock().stopped);

        pair.teardown_retired();
        assert!(logs.lock()[0].lock().stopped);
        assert!(!pair.has_retired());
    }

    #[test]
    fn test_retired_terminal_events_masked() {
        let (mut pair, logs) = pair();
        pair.ensure_primary().unwrap();
        pair.prime_pending().unwrap();

        // The outgoing engine fires Ended mid-fade after the handover.
        pair.commit_handover();
        logs.lock()[0].lock().events.push(EngineEvent::Ended);
        logs.lock()[1]
            .lock()
            .events
            .push(EngineEvent::TimeUpdate(1.0));

        let events = pair.poll_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EngineRole::Primary);
        assert_eq!(events[0].1, EngineEvent::TimeUpdate(1.0));
    }

    #[test]
    fn test_teardown_all_stops_everything() {
        let (mut pair, logs) = pair();
        pair.ensure_primary().unwrap();
        pair.prime_pending().unwrap();
        pair.teardown_all();

        let logs = logs.lock();
        assert!(logs.iter().all(|log| log.lock().stopped));
        assert!(!pair.has_pending());
    }
}
