/// AutoMix lifecycle state
///
/// Exactly one state at any time, stored as an atomic so the scheduler
/// thread and the host loop observe the same value without a lock. All
/// legal transitions are listed on [`AutomixState`]; everything else is a
/// no-op enforced by compare-and-swap.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the transition engine.
///
/// - `Idle` — AutoMix off, nothing playing, or the platform cannot analyse.
/// - `Monitoring` — a track is playing; the engine watches the remaining
///   time and prepares analyses.
/// - `Scheduled` — a plan exists and its trigger is queued on the scheduler.
/// - `Transitioning` — both engines are live and fading.
/// - `Cooldown` — the handover finished; re-planning is suppressed briefly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AutomixState {
    Idle = 0,
    Monitoring = 1,
    Scheduled = 2,
    Transitioning = 3,
    Cooldown = 4,
}

impl AutomixState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AutomixState::Monitoring,
            2 => AutomixState::Scheduled,
            3 => AutomixState::Transitioning,
            4 => AutomixState::Cooldown,
            _ => AutomixState::Idle,
        }
    }
}

/// Shared, atomically updated state value.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(AutomixState::Idle as u8))
    }

    pub fn get(&self) -> AutomixState {
        AutomixState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Unconditional transition.
    pub fn set(&self, state: AutomixState) {
        let previous = AutomixState::from_u8(self.0.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            log::debug!("automix state {previous:?} → {state:?}");
        }
    }

    /// Transition only if the current state is `from`. Returns whether the
    /// swap happened; a failed swap means another actor got there first and
    /// the caller must drop its intent.
    pub fn transition(&self, from: AutomixState, to: AutomixState) -> bool {
        let swapped = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            log::debug!("automix state {from:?} → {to:?}");
        }
        swapped
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs to the `Idle → Monitoring` gate. All must hold, and monitoring
/// collapses back to idle the moment any stops holding.
#[derive(Debug, Clone, Copy)]
pub struct Preconditions {
    pub automix_enabled: bool,
    pub track_playing: bool,
    pub personal_radio: bool,
    pub platform_supports_analysis: bool,
}

impl Preconditions {
    pub fn allow_monitoring(&self) -> bool {
        self.automix_enabled
            && self.track_playing
            && !self.personal_radio
            && self.platform_supports_analysis
    }
}
