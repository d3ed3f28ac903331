/// Error taxonomy for the AutoMix engine
///
/// Ordered by severity. Transient conditions (a scheduler action that
/// errored, a dropped engine event, a failed head-analysis retry) are logged
/// through `throttle` and never surfaced; peak clipping is a warning with an
/// automatic gain reduction. A failed transition never reaches the user as
/// an error: playback degrades to a hard cut.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutomixError {
    /// Worker crash, timeout, missing export, or unparseable cached payload.
    /// AutoMix skips the current track boundary and performs a hard cut.
    #[error("analyser unavailable: {0}")]
    AnalyserUnavailable(String),

    /// The planner returned no plan, or the plan failed the final safety
    /// clamp. Monitoring continues; the next tick retries.
    #[error("no viable transition plan for this boundary")]
    PlanRejected,

    /// The pending engine failed to start or seek. The UI switch is
    /// committed immediately and playback falls through to a plain play.
    #[error("pending engine failed to prime: {0}")]
    EnginePrimeFailure(anyhow::Error),

    /// A suspended continuation resumed after its session token was
    /// superseded. Dropped silently at every call site.
    #[error("session token stale")]
    SessionStale,
}
