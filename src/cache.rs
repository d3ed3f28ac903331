/// Analysis cache: keyed, versioned, mtime/size-validated
///
/// Maps a normalised file path to `{mtime, size, payload}`. The payload is
/// the analyser's JSON output, kept opaque here; parsing happens on read so
/// a stale schema degrades to a miss instead of an error. The cache is the
/// only persisted state in the subsystem: the index (payloads base64-coded)
/// is written through to a single JSON file.
///
/// Path normalisation is OS-aware. On case-insensitive filesystems keys are
/// lowercased and both slash forms are readable; writes land on the
/// canonical forward-slash key, with the alias backfilled after a hit on a
/// non-canonical form. On case-sensitive filesystems only the canonical
/// absolute path is used.

use crate::analysis::{AudioAnalysis, ANALYSIS_VERSION};
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Cached analyses whose window differs from the requested one by less than
/// this many seconds still count as hits.
pub const WINDOW_TOLERANCE: f64 = 1.0;

const CASE_INSENSITIVE: bool = cfg!(any(target_os = "windows", target_os = "macos"));

/// Broadcast result of a deduplicated analyser computation. Errors are
/// strings so every subscriber can own a copy.
pub type FlightResult = Result<AudioAnalysis, String>;

/// Outcome of joining an in-flight computation.
pub enum FlightTicket {
    /// No computation in flight for this key; the caller must run it and
    /// call [`AnalysisCache::complete_flight`].
    Leader,
    /// Someone else is computing; the receiver yields the broadcast result.
    Follower(Receiver<FlightResult>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    mtime_ms: u64,
    size: u64,
    #[serde(with = "payload_b64")]
    payload: Vec<u8>,
}

/// Process-wide analysis store. Constructed once at startup and injected
/// into the gateway; mutation happens under one lock.
pub struct AnalysisCache {
    entries: Mutex<HashMap<String, CacheRecord>>,
    flights: Mutex<HashMap<String, Vec<Sender<FlightResult>>>>,
    /// Index file; `None` keeps the cache memory-only (tests).
    index_path: Option<PathBuf>,
}

impl AnalysisCache {
    /// Open the cache, loading the persisted index when it exists. An
    /// unreadable index is logged and treated as empty.
    pub fn open(index_path: Option<PathBuf>) -> Self {
        let entries = index_path
            .as_deref()
            .and_then(|path| match load_index(path) {
                Ok(map) => Some(map),
                Err(err) => {
                    log::warn!("analysis cache index unreadable, starting empty: {err:#}");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            entries: Mutex::new(entries),
            flights: Mutex::new(HashMap::new()),
            index_path,
        }
    }

    /// Look up an analysis for `path`. A hit requires matching mtime/size,
    /// the current schema version, and an analysis window within
    /// [`WINDOW_TOLERANCE`] of `want_window`. Head and full analyses are
    /// distinct entries (`head` selects which).
    pub fn get(&self, path: &Path, head: bool, want_window: f64) -> Option<AudioAnalysis> {
        let (mtime_ms, size) = file_stamp(path)?;
        let canonical = entry_key(path, head);
        let mut entries = self.entries.lock();

        for key in key_candidates(&canonical) {
            let record = match entries.get(&key) {
                Some(record) => record.clone(),
                None => continue,
            };
            if record.mtime_ms != mtime_ms || record.size != size {
                continue;
            }
            match parse_payload(&record.payload, want_window) {
                Some(analysis) => {
                    // Backfill the canonical key after an alias hit.
                    if key != canonical {
                        entries.insert(canonical.clone(), record);
                        self.persist(&entries);
                    }
                    return Some(analysis);
                }
                None => {
                    // Version mismatch or parse failure: evict so the next
                    // write does not race a stale record.
                    entries.remove(&key);
                    self.persist(&entries);
                    return None;
                }
            }
        }
        None
    }

    /// Unconditional write, last-writer-wins. `payload` is the analyser's
    /// serialized output for `path` at its current `(mtime, size)`.
    pub fn put(&self, path: &Path, head: bool, payload: Vec<u8>) {
        let Some((mtime_ms, size)) = file_stamp(path) else {
            log::warn!("analysis cache put skipped, cannot stat {}", path.display());
            return;
        };
        let key = entry_key(path, head);
        let mut entries = self.entries.lock();
        entries.insert(key, CacheRecord { mtime_ms, size, payload });
        self.persist(&entries);
    }

    /// Serialize and store an analysis record.
    pub fn put_analysis(&self, path: &Path, analysis: &AudioAnalysis) {
        match serde_json::to_vec(analysis) {
            Ok(payload) => self.put(path, analysis.head, payload),
            Err(err) => log::warn!("analysis serialize failed for {}: {err}", path.display()),
        }
    }

    /// Join the in-flight computation for `request_key`, or become its
    /// leader. Concurrent callers with the same key observe exactly one
    /// computation; the leader broadcasts via [`Self::complete_flight`].
    pub fn join_flight(&self, request_key: &str) -> FlightTicket {
        let mut flights = self.flights.lock();
        match flights.get_mut(request_key) {
            Some(subscribers) => {
                let (tx, rx) = bounded(1);
                subscribers.push(tx);
                FlightTicket::Follower(rx)
            }
            None => {
                flights.insert(request_key.to_string(), Vec::new());
                FlightTicket::Leader
            }
        }
    }

    /// Broadcast the leader's result to every follower and drop the flight
    /// entry. Success and failure are broadcast alike.
    pub fn complete_flight(&self, request_key: &str, result: &FlightResult) {
        let subscribers = self.flights.lock().remove(request_key).unwrap_or_default();
        for tx in subscribers {
            let _ = tx.send(result.clone());
        }
    }

    /// Number of in-flight computations (diagnostics and tests).
    pub fn flights_in_progress(&self) -> usize {
        self.flights.lock().len()
    }

    /// Write the index out now. `open` + write-through makes this mostly
    /// redundant; teardown calls it so shutdown order does not matter.
    pub fn flush(&self) {
        let entries = self.entries.lock();
        self.persist(&entries);
    }

    fn persist(&self, entries: &HashMap<String, CacheRecord>) {
        let Some(path) = self.index_path.as_deref() else { return };
        if let Err(err) = save_index(path, entries) {
            log::warn!("analysis cache persist failed: {err:#}");
        }
    }
}

/// Storage key for one analysis variant of one file.
fn entry_key(path: &Path, head: bool) -> String {
    let base = canonical_path_key(path);
    if head {
        format!("{base}|head")
    } else {
        base
    }
}

/// Canonical string form of a path: absolute, symlinks resolved when the
/// file exists, lowercased + forward slashes on case-insensitive systems.
fn canonical_path_key(path: &Path) -> String {
    let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut key = absolute.to_string_lossy().into_owned();
    if CASE_INSENSITIVE {
        key = key.to_lowercase().replace('\\', "/");
    }
    key
}

/// All keys a read should try, canonical first.
fn key_candidates(canonical: &str) -> Vec<String> {
    let mut keys = vec![canonical.to_string()];
    if CASE_INSENSITIVE {
        keys.push(canonical.replace('/', "\\"));
    }
    keys
}

/// `(mtime in ms, size in bytes)` of the backing file, or `None` when the
/// file is unreachable.
fn file_stamp(path: &Path) -> Option<(u64, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime_ms = meta
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_millis() as u64;
    Some((mtime_ms, meta.len()))
}

/// Parse a payload into a current-version analysis within the window
/// tolerance. Any failure is a miss.
fn parse_payload(payload: &[u8], want_window: f64) -> Option<AudioAnalysis> {
    let mut analysis: AudioAnalysis = match serde_json::from_slice(payload) {
        Ok(analysis) => analysis,
        Err(err) => {
            log::debug!("cached analysis payload unparseable: {err}");
            return None;
        }
    };
    if analysis.version != ANALYSIS_VERSION {
        log::debug!(
            "cached analysis version {} != {}, ignoring",
            analysis.version,
            ANALYSIS_VERSION
        );
        return None;
    }
    if (analysis.analyze_window - want_window).abs() >= WINDOW_TOLERANCE {
        return None;
    }
    analysis.sanitize();
    Some(analysis)
}

fn load_index(path: &Path) -> Result<HashMap<String, CacheRecord>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading cache index {}", path.display()))?;
    serde_json::from_slice(&bytes).context("parsing cache index")
}

fn save_index(path: &Path, entries: &HashMap<String, CacheRecord>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating cache dir {}", parent.display()))?;
    }
    let json = serde_json::to_string(entries).context("serializing cache index")?;
    std::fs::write(path, json)
        .with_context(|| format!("writing cache index {}", path.display()))
}

mod payload_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AudioAnalysis;
    use std::io::Write;

    fn write_track(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"not really audio").unwrap();
        path
    }

    fn analysis(window: f64) -> AudioAnalysis {
        let mut a = AudioAnalysis::empty(180.0, window);
        a.bpm = Some(128.0);
        a
    }

    #[test]
    fn test_get_hits_after_put() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let cache = AnalysisCache::open(None);

        cache.put_analysis(&track, &analysis(60.0));
        let hit = cache.get(&track, false, 60.0).expect("hit");
        assert_eq!(hit.bpm, Some(128.0));
    }

    #[test]
    fn test_window_tolerance_is_one_second() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let cache = AnalysisCache::open(None);

        cache.put_analysis(&track, &analysis(60.0));
        assert!(cache.get(&track, false, 60.9).is_some());
        assert!(cache.get(&track, false, 61.0).is_none());
    }

    #[test]
    fn test_modified_file_misses() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let cache = AnalysisCache::open(None);

        cache.put_analysis(&track, &analysis(60.0));
        // Grow the file; the recorded size no longer matches.
        let mut file = std::fs::OpenOptions::new().append(true).open(&track).unwrap();
        file.write_all(b"tail").unwrap();
        assert!(cache.get(&track, false, 60.0).is_none());
    }

    #[test]
    fn test_version_mismatch_is_a_miss_and_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let cache = AnalysisCache::open(None);

        let mut stale = analysis(60.0);
        stale.version = ANALYSIS_VERSION - 1;
        cache.put(&track, false, serde_json::to_vec(&stale).unwrap());
        assert!(cache.get(&track, false, 60.0).is_none());
        // Evicted: a later current-version put must win cleanly.
        cache.put_analysis(&track, &analysis(60.0));
        assert!(cache.get(&track, false, 60.0).is_some());
    }

    #[test]
    fn test_garbage_payload_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let cache = AnalysisCache::open(None);

        cache.put(&track, false, b"{not json".to_vec());
        assert!(cache.get(&track, false, 60.0).is_none());
    }

    #[test]
    fn test_head_and_full_are_distinct_entries() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let cache = AnalysisCache::open(None);

        let mut head = analysis(30.0);
        head.head = true;
        cache.put_analysis(&track, &head);
        assert!(cache.get(&track, false, 30.0).is_none());
        assert!(cache.get(&track, true, 30.0).is_some());
    }

    #[test]
    fn test_index_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let index = dir.path().join("cache/analysis.json");

        {
            let cache = AnalysisCache::open(Some(index.clone()));
            cache.put_analysis(&track, &analysis(60.0));
            cache.flush();
        }
        let reopened = AnalysisCache::open(Some(index));
        assert!(reopened.get(&track, false, 60.0).is_some());
    }

    #[test]
    fn test_single_flight_broadcasts_to_followers() {
        let cache = AnalysisCache::open(None);
        let key = "track.flac|60";

        let FlightTicket::Leader = cache.join_flight(key) else {
            panic!("first join must lead")
        };
        let FlightTicket::Follower(rx) = cache.join_flight(key) else {
            panic!("second join must follow")
        };
        assert_eq!(cache.flights_in_progress(), 1);

        cache.complete_flight(key, &Ok(analysis(60.0)));
        let got = rx.recv().unwrap().unwrap();
        assert_eq!(got.bpm, Some(128.0));
        assert_eq!(cache.flights_in_progress(), 0);
    }

    #[test]
    fn test_single_flight_broadcasts_failures() {
        let cache = AnalysisCache::open(None);
        let key = "track.flac|head|30";

        let FlightTicket::Leader = cache.join_flight(key) else { panic!() };
        let FlightTicket::Follower(rx) = cache.join_flight(key) else { panic!() };
        cache.complete_flight(key, &Err("worker died".to_string()));
        assert_eq!(rx.recv().unwrap().unwrap_err(), "worker died");
        // Entry removed on failure too: the next join leads again.
        assert!(matches!(cache.join_flight(key), FlightTicket::Leader));
        cache.complete_flight(key, &Err("cleanup".into()));
    }

    #[test]
    fn test_sanitize_applied_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_track(&dir, "a.flac");
        let cache = AnalysisCache::open(None);

        let mut bad = analysis(60.0);
        bad.fade_in_pos = Some(10.0);
        bad.cut_in_pos = Some(2.0); // violates the ordering chain
        cache.put(&track, false, serde_json::to_vec(&bad).unwrap());
        let got = cache.get(&track, false, 60.0).unwrap();
        assert_eq!(got.cut_in_pos, None);
        assert_eq!(got.fade_in_pos, Some(10.0));
    }
}
