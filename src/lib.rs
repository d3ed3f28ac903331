// Rust linting configuration
#![warn(
    rust_2018_idioms,
    unused_lifetimes,
    unused_qualifications,
    clippy::all,
    clippy::pedantic
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::float_cmp
)]

// ============================================
// Analysis pipeline
// ============================================
mod analysis;   // Analyser result schema + sanitization
mod analyzer;   // Gateway over the four native analyser operations
mod cache;      // Persistent, single-flight analysis cache

// ============================================
// Transition core
// ============================================
mod planner;    // Analyses + position → TransitionPlan
mod scheduler;  // Audio-clock job scheduler
mod state;      // Automix lifecycle state machine
mod automix;    // The orchestrator

// ============================================
// Playback
// ============================================
mod crossfade;  // Dual-engine crossfade protocol
mod engine_pair;
mod gain;       // Loudness matching, peak safety, fade curves

// ============================================
// Support
// ============================================
mod config;
mod error;
pub mod throttle;

// ============================================
// Re-exports
// ============================================
pub use analysis::{
    AdvancedTransition, AudioAnalysis, AutomationPoint, AutomationTarget, KeyMode, MixType,
    TrackDescriptor, TransitionProposal, ANALYSIS_VERSION,
};
pub use analyzer::{
    Analyzer, AnalyzerGateway, Pending, FULL_TIMEOUT, HEAD_TIMEOUT, MAX_WINDOW, MIN_WINDOW,
};
pub use automix::{AutomixDeps, AutomixEngine};
pub use cache::{AnalysisCache, FlightResult, FlightTicket, WINDOW_TOLERANCE};
pub use config::{AutomixConfig, ReplayGainMode};
pub use crossfade::{SwitchCallback, ABORT_FADE, PREARM_LEAD, RATE_RESTORE_SEC, TEARDOWN_MARGIN};
pub use engine_pair::{
    EngineCaps, EngineEvent, EngineFactory, EnginePair, EngineRole, MasterBus, PauseOptions,
    PlayOptions, PlaybackEngine,
};
pub use error::AutomixError;
pub use gain::{FadeCurve, ReplayGainInfo};
pub use planner::{plan, PlannerInput, TransitionPlan, DEFAULT_FADE, MIN_FADE};
pub use scheduler::{AudioClock, JobId, Scheduler, Ticker, DEFAULT_HORIZON, DEFAULT_TICK};
pub use state::{AutomixState, Preconditions, StateCell};
