/// Audio-clock driven action scheduler
///
/// A single tick source that fires one-shot jobs at sample-accurate times
/// on the output clock. Two job kinds: `schedule` fires as soon as the
/// target time enters the look-ahead horizon (pre-roll arming of audio
/// graph parameters), `run` fires when the target time has actually been
/// reached (hard-deadline events such as the UI commit).
///
/// Jobs belong to named groups so an aborted crossfade can cancel its whole
/// batch at once. Every job carries the session token that was live at its
/// creation; a job whose token has been superseded is dropped silently at
/// fire time. Between two jobs with identical times, insertion order is
/// preserved.
///
/// The ticker is a dedicated background thread, deliberately not tied to
/// any UI timer so it keeps firing while the window is hidden. Hosts that
/// cannot spare the thread call [`Scheduler::tick`] from their own loop.

use crate::warn_throttled;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Default look-ahead for `schedule`-kind jobs, seconds.
pub const DEFAULT_HORIZON: f64 = 1.5;

/// Default ticker period.
pub const DEFAULT_TICK: Duration = Duration::from_millis(75);

/// The audio output clock, in seconds. Implemented over the platform's
/// output stream so scheduled times line up with what is audible.
pub trait AudioClock: Send + Sync + 'static {
    fn now(&self) -> f64;
}

/// Opaque handle to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    /// Fire once `time ≤ now + horizon`.
    Schedule,
    /// Fire once `time ≤ now`.
    Run,
}

type Action = Box<dyn FnMut() -> anyhow::Result<()> + Send>;
type Cleanup = Box<dyn FnOnce() + Send>;

struct Job {
    id: JobId,
    group: String,
    kind: JobKind,
    time: f64,
    token: u64,
    action: Action,
    cleanup: Option<Cleanup>,
    cancelled: Arc<AtomicBool>,
}

/// One-shot job scheduler on the audio clock.
pub struct Scheduler {
    jobs: Mutex<Vec<Job>>,
    /// Cancellation flags per group, including jobs already drained for
    /// execution on the current tick.
    group_flags: Mutex<std::collections::HashMap<String, Vec<Arc<AtomicBool>>>>,
    next_id: AtomicU64,
    clock: Arc<dyn AudioClock>,
    session: Arc<AtomicU64>,
    horizon: f64,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn AudioClock>, session: Arc<AtomicU64>) -> Self {
        Self::with_horizon(clock, session, DEFAULT_HORIZON)
    }

    pub fn with_horizon(clock: Arc<dyn AudioClock>, session: Arc<AtomicU64>, horizon: f64) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            group_flags: Mutex::new(std::collections::HashMap::new()),
            next_id: AtomicU64::new(1),
            clock,
            session,
            horizon,
        }
    }

    /// Queue a pre-roll arming job: fires when `time` first comes within
    /// the horizon.
    pub fn schedule(&self, group: &str, time: f64, token: u64, action: Action) -> JobId {
        self.submit(group, JobKind::Schedule, time, token, action, None)
    }

    /// Queue a hard-deadline job: fires when the clock passes `time`.
    pub fn run_at(&self, group: &str, time: f64, token: u64, action: Action) -> JobId {
        self.submit(group, JobKind::Run, time, token, action, None)
    }

    /// `run_at` with a cleanup invoked when the job is cancelled or its
    /// group cleared before firing.
    pub fn run_at_with_cleanup(
        &self,
        group: &str,
        time: f64,
        token: u64,
        action: Action,
        cleanup: Cleanup,
    ) -> JobId {
        self.submit(group, JobKind::Run, time, token, action, Some(cleanup))
    }

    fn submit(
        &self,
        group: &str,
        kind: JobKind,
        time: f64,
        token: u64,
        action: Action,
        cleanup: Option<Cleanup>,
    ) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut flags = self.group_flags.lock();
            let entry = flags.entry(group.to_string()).or_default();
            // A flag held only here belongs to a job that already ran.
            entry.retain(|flag| Arc::strong_count(flag) > 1);
            entry.push(Arc::clone(&cancelled));
        }
        self.jobs.lock().push(Job {
            id,
            group: group.to_string(),
            kind,
            time,
            token,
            action,
            cleanup,
            cancelled,
        });
        id
    }

    /// Cancel a single job. No effect on a call already in progress, but
    /// the job will never fire afterwards; its cleanup runs if it had not
    /// fired yet.
    pub fn cancel(&self, id: JobId) {
        let mut jobs = self.jobs.lock();
        if let Some(index) = jobs.iter().position(|job| job.id == id) {
            let mut job = jobs.remove(index);
            job.cancelled.store(true, Ordering::SeqCst);
            drop(jobs);
            if let Some(cleanup) = job.cleanup.take() {
                cleanup();
            }
        }
    }

    /// Cancel every job in `group`, running their cleanups. Idempotent.
    /// Jobs already drained as due on a tick racing this call are
    /// suppressed through their cancellation flag.
    pub fn clear_group(&self, group: &str) {
        if let Some(flags) = self.group_flags.lock().remove(group) {
            for flag in flags {
                flag.store(true, Ordering::SeqCst);
            }
        }
        let removed: Vec<Job> = {
            let mut jobs = self.jobs.lock();
            let mut keep = Vec::with_capacity(jobs.len());
            let mut removed = Vec::new();
            for job in jobs.drain(..) {
                if job.group == group {
                    removed.push(job);
                } else {
                    keep.push(job);
                }
            }
            *jobs = keep;
            removed
        };
        for mut job in removed {
            job.cancelled.store(true, Ordering::SeqCst);
            if let Some(cleanup) = job.cleanup.take() {
                cleanup();
            }
        }
    }

    /// Drain and execute due jobs, in insertion order. Called from the
    /// ticker thread or the host loop.
    pub fn tick(&self) {
        let now = self.clock.now();
        let due: Vec<Job> = {
            let mut jobs = self.jobs.lock();
            let mut due = Vec::new();
            let mut keep = Vec::with_capacity(jobs.len());
            for job in jobs.drain(..) {
                let fires = match job.kind {
                    JobKind::Schedule => job.time <= now + self.horizon,
                    JobKind::Run => job.time <= now,
                };
                if fires {
                    due.push(job);
                } else {
                    keep.push(job);
                }
            }
            *jobs = keep;
            due
        };

        let current_token = self.session.load(Ordering::SeqCst);
        for mut job in due {
            if job.cancelled.load(Ordering::SeqCst) {
                if let Some(cleanup) = job.cleanup.take() {
                    cleanup();
                }
                continue;
            }
            if job.token < current_token {
                log::debug!(
                    "dropping stale job in group '{}' (token {} < {})",
                    job.group,
                    job.token,
                    current_token
                );
                continue;
            }
            if let Err(err) = (job.action)() {
                warn_throttled!(
                    &format!("sched-{}", job.group),
                    "scheduled action failed in group '{}': {err:#}",
                    job.group
                );
            }
        }
    }

    /// Pending job count (diagnostics and tests).
    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Start the dedicated ticker thread. The returned handle stops and
    /// joins the thread on drop.
    pub fn spawn_ticker(self: &Arc<Self>, period: Duration) -> anyhow::Result<Ticker> {
        let scheduler = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("automix-scheduler".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    scheduler.tick();
                    std::thread::sleep(period);
                }
            })?;
        Ok(Ticker { stop, handle: Some(handle) })
    }
}

/// Handle to the background ticker thread.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
