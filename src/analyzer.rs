/// Typed gateway over the native analyser's four operations
///
/// Each call runs on a disposable worker thread so a crash or hang in
/// native code never stalls the player loop or the scheduler. Callers get a
/// [`Pending`] handle they poll from their own tick; a worker that stays
/// silent past its deadline resolves to an error while the thread is left
/// to die on its own. Successful analyses flow through the cache, and
/// concurrent requests for the same key are deduplicated so only one worker
/// computes.

use crate::analysis::{AdvancedTransition, AudioAnalysis, TransitionProposal};
use crate::cache::{AnalysisCache, FlightTicket};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wall-clock budget for a head analysis reply.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(4);
/// Wall-clock budget for a full analysis or mix-suggestion reply.
pub const FULL_TIMEOUT: Duration = Duration::from_secs(30);

/// Analysis window bounds in seconds; requests outside are clamped.
pub const MIN_WINDOW: f64 = 10.0;
pub const MAX_WINDOW: f64 = 300.0;

/// Contract of the native analyser. Implemented by the player's platform
/// layer; the engine never inspects audio bytes itself.
pub trait Analyzer: Send + Sync + 'static {
    /// Full analysis of up to `max_window` seconds. Expensive.
    fn analyze(&self, path: &Path, max_window: f64) -> anyhow::Result<AudioAnalysis>;
    /// Fast analysis covering only the intro region.
    fn analyze_head(&self, path: &Path, max_window: f64) -> anyhow::Result<AudioAnalysis>;
    /// Short-mix proposal for the `current → next` boundary.
    fn suggest_transition(&self, current: &Path, next: &Path)
        -> anyhow::Result<TransitionProposal>;
    /// Long automation-rich mashup plan for the boundary.
    fn suggest_long_mix(&self, current: &Path, next: &Path)
        -> anyhow::Result<AdvancedTransition>;
}

/// A result that may still be on a worker. Poll from the host tick; once
/// resolved the value stays available.
pub struct Pending<T> {
    rx: Option<Receiver<Result<T, String>>>,
    deadline: Instant,
    result: Option<Result<T, String>>,
}

impl<T> Pending<T> {
    fn ready(result: Result<T, String>) -> Self {
        Self { rx: None, deadline: Instant::now(), result: Some(result) }
    }

    fn from_rx(rx: Receiver<Result<T, String>>, timeout: Duration) -> Self {
        Self { rx: Some(rx), deadline: Instant::now() + timeout, result: None }
    }

    /// Non-blocking poll. `None` while the worker is still inside its
    /// budget; after that, the resolved result (a timeout resolves to an
    /// error).
    pub fn poll(&mut self) -> Option<&Result<T, String>> {
        if self.result.is_none() {
            if let Some(rx) = &self.rx {
                match rx.try_recv() {
                    Ok(result) => self.result = Some(result),
                    Err(TryRecvError::Disconnected) => {
                        self.result = Some(Err("analyser worker died".to_string()));
                    }
                    Err(TryRecvError::Empty) => {
                        if Instant::now() >= self.deadline {
                            self.result = Some(Err("analyser timed out".to_string()));
                        }
                    }
                }
            }
        }
        self.result.as_ref()
    }

    /// Poll and move the resolved result out, leaving the handle spent.
    pub fn take_result(&mut self) -> Option<Result<T, String>> {
        self.poll();
        self.result.take()
    }

    /// Block until resolution or deadline. Test and teardown helper; the
    /// player loop polls instead.
    pub fn wait(mut self) -> Result<T, String> {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.rx {
            Some(rx) => match rx.recv_deadline(self.deadline) {
                Ok(result) => result,
                Err(_) => Err("analyser timed out".to_string()),
            },
            None => Err("analyser worker died".to_string()),
        }
    }
}

/// Strongly-typed wrapper over the four analyser operations, with caching
/// and single-flight deduplication for the two analysis calls.
pub struct AnalyzerGateway {
    analyzer: Arc<dyn Analyzer>,
    cache: Arc<AnalysisCache>,
}

impl AnalyzerGateway {
    pub fn new(analyzer: Arc<dyn Analyzer>, cache: Arc<AnalysisCache>) -> Self {
        Self { analyzer, cache }
    }

    pub fn cache(&self) -> &Arc<AnalysisCache> {
        &self.cache
    }

    /// Full analysis of `path`, answered from the cache when possible.
    pub fn analyze(&self, path: &Path, max_window: f64) -> Pending<AudioAnalysis> {
        self.analyze_inner(path, max_window, false)
    }

    /// Head-only analysis of `path`, answered from the cache when possible.
    pub fn analyze_head(&self, path: &Path, max_window: f64) -> Pending<AudioAnalysis> {
        self.analyze_inner(path, max_window, true)
    }

    fn analyze_inner(&self, path: &Path, max_window: f64, head: bool) -> Pending<AudioAnalysis> {
        let window = max_window.clamp(MIN_WINDOW, MAX_WINDOW);
        if std::fs::metadata(path).is_err() {
            return Pending::ready(Err(format!("file unreachable: {}", path.display())));
        }
        if let Some(hit) = self.cache.get(path, head, window) {
            return Pending::ready(Ok(hit));
        }

        let request_key = if head {
            format!("{}|head|{}", path.display(), window)
        } else {
            format!("{}|{}", path.display(), window)
        };
        let timeout = if head { HEAD_TIMEOUT } else { FULL_TIMEOUT };

        match self.cache.join_flight(&request_key) {
            FlightTicket::Follower(rx) => Pending::from_rx(rx, timeout),
            FlightTicket::Leader => {
                let (tx, rx) = bounded(1);
                let analyzer = Arc::clone(&self.analyzer);
                let cache = Arc::clone(&self.cache);
                let path: PathBuf = path.to_path_buf();
                spawn_worker("automix-analyze", move || {
                    let raw = if head {
                        analyzer.analyze_head(&path, window)
                    } else {
                        analyzer.analyze(&path, window)
                    };
                    let result = raw
                        .map(|mut analysis| {
                            analysis.head = head;
                            if analysis.analyze_window == 0.0 {
                                analysis.analyze_window = window;
                            }
                            analysis.sanitize();
                            analysis
                        })
                        .map_err(|err| format!("{err:#}"));
                    if let Ok(analysis) = &result {
                        cache.put_analysis(&path, analysis);
                    }
                    cache.complete_flight(&request_key, &result);
                    let _ = tx.send(result);
                });
                Pending::from_rx(rx, timeout)
            }
        }
    }

    /// Short-mix proposal for the boundary between two local files.
    pub fn suggest_transition(
        &self,
        current: &Path,
        next: &Path,
    ) -> Pending<TransitionProposal> {
        let analyzer = Arc::clone(&self.analyzer);
        self.suggest_inner(current, next, move |current, next| {
            analyzer.suggest_transition(current, next)
        })
    }

    /// Long mashup plan for the boundary between two local files.
    pub fn suggest_long_mix(&self, current: &Path, next: &Path) -> Pending<AdvancedTransition> {
        let analyzer = Arc::clone(&self.analyzer);
        self.suggest_inner(current, next, move |current, next| {
            analyzer.suggest_long_mix(current, next)
        })
    }

    fn suggest_inner<T, F>(&self, current: &Path, next: &Path, call: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &Path) -> anyhow::Result<T> + Send + 'static,
    {
        if std::fs::metadata(current).is_err() || std::fs::metadata(next).is_err() {
            return Pending::ready(Err("file unreachable".to_string()));
        }
        let (tx, rx) = bounded(1);
        let current = current.to_path_buf();
        let next = next.to_path_buf();
        spawn_worker("automix-suggest", move || {
            let result = call(&current, &next).map_err(|err| format!("{err:#}"));
            let _ = tx.send(result);
        });
        Pending::from_rx(rx, FULL_TIMEOUT)
    }
}

/// Spawn a disposable worker. Spawn failure is reported through the
/// channel path: the closure is simply dropped, which disconnects every
/// receiver.
fn spawn_worker<F: FnOnce() + Send + 'static>(name: &str, body: F) {
    if let Err(err) = std::thread::Builder::new().name(name.to_string()).spawn(body) {
        log::warn!("failed to spawn {name} worker: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ANALYSIS_VERSION;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted analyser: counts calls, optionally sleeps, optionally fails.
    struct FakeAnalyzer {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakeAnalyzer {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0), delay: Duration::ZERO, fail: false }
        }

        fn analysis(window: f64) -> AudioAnalysis {
            let mut a = AudioAnalysis::empty(200.0, window);
            a.version = ANALYSIS_VERSION;
            a.bpm = Some(124.0);
            a
        }
    }

    impl Analyzer for FakeAnalyzer {
        fn analyze(&self, _path: &Path, max_window: f64) -> anyhow::Result<AudioAnalysis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                anyhow::bail!("native analyser crashed");
            }
            Ok(Self::analysis(max_window))
        }

        fn analyze_head(&self, path: &Path, max_window: f64) -> anyhow::Result<AudioAnalysis> {
            let mut a = self.analyze(path, max_window)?;
            a.head = true;
            Ok(a)
        }

        fn suggest_transition(
            &self,
            _current: &Path,
            _next: &Path,
        ) -> anyhow::Result<TransitionProposal> {
            anyhow::bail!("no proposal");
        }

        fn suggest_long_mix(
            &self,
            _current: &Path,
            _next: &Path,
        ) -> anyhow::Result<AdvancedTransition> {
            anyhow::bail!("no long mix");
        }
    }

    fn write_track(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"audio bytes").unwrap();
        path
    }

    fn gateway(analyzer: FakeAnalyzer) -> AnalyzerGateway {
        AnalyzerGateway::new(Arc::new(analyzer), Arc::new(AnalysisCache::open(None)))
    }

    #[test]
    fn test_analyze_resolves_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let gw = gateway(FakeAnalyzer::new());

        let got = gw.analyze(&track, 60.0).wait().unwrap();
        assert_eq!(got.bpm, Some(124.0));
        // Second request is a cache hit, resolved without a worker.
        let mut second = gw.analyze(&track, 60.0);
        assert!(second.poll().unwrap().is_ok());
    }

    #[test]
    fn test_window_clamped_into_range() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let gw = gateway(FakeAnalyzer::new());

        let got = gw.analyze(&track, 5000.0).wait().unwrap();
        assert_eq!(got.analyze_window, MAX_WINDOW);
    }

    #[test]
    fn test_unreachable_file_fails_immediately() {
        let gw = gateway(FakeAnalyzer::new());
        let mut pending = gw.analyze(Path::new("/no/such/file.flac"), 60.0);
        let err = pending.poll().unwrap().as_ref().unwrap_err();
        assert!(err.contains("unreachable"));
    }

    #[test]
    fn test_worker_error_reported() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let mut fake = FakeAnalyzer::new();
        fake.fail = true;
        let gw = gateway(fake);

        let err = gw.analyze(&track, 60.0).wait().unwrap_err();
        assert!(err.contains("crashed"));
    }

    #[test]
    fn test_slow_worker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let mut fake = FakeAnalyzer::new();
        fake.delay = Duration::from_secs(6);
        let gw = gateway(fake);

        // Head budget is 4 s; poll with a short deadline override by
        // waiting on the handle, which honours the head deadline.
        let started = Instant::now();
        let err = gw.analyze_head(&track, 30.0).wait().unwrap_err();
        assert!(err.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[test]
    fn test_concurrent_requests_share_one_worker() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let mut fake = FakeAnalyzer::new();
        fake.delay = Duration::from_millis(150);
        let analyzer = Arc::new(fake);
        let gw = AnalyzerGateway::new(
            Arc::clone(&analyzer) as Arc<dyn Analyzer>,
            Arc::new(AnalysisCache::open(None)),
        );

        // Issued within milliseconds of each other: one computation.
        let first = gw.analyze(&track, 60.0);
        let second = gw.analyze(&track, 60.0);
        assert!(first.wait().is_ok());
        assert!(second.wait().is_ok());
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }
}
