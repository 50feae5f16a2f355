//! Filesystem weather cache with disk-pressure management.
//!
//! One JSON file per rounded coordinate bucket, carrying the weather
//! subset plus `_cache_lat` / `_cache_lon` / `_cache_time` metadata. Reads
//! are distance-matched: any fresh entry within the distance threshold of
//! the requested point is a hit. A periodic monitor watches free disk
//! space and escalates from intelligent cleanup (score-based eviction) to
//! emergency cleanup (delete oldest until space is freed) when the volume
//! runs hot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::geo::{haversine_km, round3};

/// Files examined per lookup before giving up.
const LOOKUP_SCAN_LIMIT: usize = 100;

/// Emergency cleanup stops after freeing this much.
const EMERGENCY_FREE_TARGET_MB: u64 = 50;

/// Request log cap before emergency truncation.
const REQUEST_LOG_MAX_BYTES: u64 = 1024 * 1024;

/// Minimum spacing between intelligent cleanup passes.
const CLEANUP_MIN_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Disk monitor sampling period.
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

// ---

/// Capability: free space on the volume holding `path`, in megabytes.
pub trait DiskSpaceProbe: Send + Sync {
    fn available_mb(&self, path: &Path) -> Option<u64>;
}

/// Production probe via `statvfs`.
pub struct StatvfsProbe;

impl DiskSpaceProbe for StatvfsProbe {
    fn available_mb(&self, path: &Path) -> Option<u64> {
        // ---
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return None;
        }
        let bytes = stat.f_bavail as u128 * stat.f_frsize as u128;
        Some((bytes / (1024 * 1024)) as u64)
    }
}

/// Fixed probe for tests.
pub struct FixedDiskProbe(pub Mutex<u64>);

impl FixedDiskProbe {
    pub fn new(mb: u64) -> Self {
        Self(Mutex::new(mb))
    }

    pub fn set(&self, mb: u64) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = mb;
    }
}

impl DiskSpaceProbe for FixedDiskProbe {
    fn available_mb(&self, _path: &Path) -> Option<u64> {
        Some(*self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

// ---

/// Cache tunables.
#[derive(Debug, Clone)]
pub struct WeatherCacheConfig {
    pub dir: PathBuf,
    pub ttl: Duration,
    pub distance_threshold_km: f64,
    pub max_files: usize,
    pub max_size_mb: u64,
    pub emergency_disk_threshold_mb: u64,
    pub critical_disk_threshold_mb: u64,
}

impl Default for WeatherCacheConfig {
    fn default() -> Self {
        // ---
        Self {
            dir: PathBuf::from("/tmp/fleetsink_weather_cache"),
            ttl: Duration::from_secs(3600),
            distance_threshold_km: 1.0,
            max_files: 1000,
            max_size_mb: 50,
            emergency_disk_threshold_mb: 500,
            critical_disk_threshold_mb: 200,
        }
    }
}

/// The cache itself. Concurrent readers are fine (lookups are
/// idempotent); writers for the same coordinate are serialized upstream
/// by the coordinator's per-coordinate mutex.
pub struct WeatherDiskCache {
    cfg: WeatherCacheConfig,
    disk: Arc<dyn DiskSpaceProbe>,
    emergency_mode: AtomicBool,
    last_cleanup: Mutex<Option<Instant>>,
    cleanup_lock: tokio::sync::Mutex<()>,
}

impl WeatherDiskCache {
    pub fn new(cfg: WeatherCacheConfig, disk: Arc<dyn DiskSpaceProbe>) -> std::io::Result<Self> {
        // ---
        fs::create_dir_all(&cfg.dir)?;
        Ok(Self {
            cfg,
            disk,
            emergency_mode: AtomicBool::new(false),
            last_cleanup: Mutex::new(None),
            cleanup_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn emergency_mode(&self) -> bool {
        self.emergency_mode.load(Ordering::Relaxed)
    }

    /// File path for a coordinate bucket.
    pub fn cache_path(&self, lat: f64, lon: f64) -> PathBuf {
        // ---
        let key = format!("{:.3}_{:.3}", round3(lat), round3(lon));
        let digest = Sha256::digest(key.as_bytes());
        self.cfg.dir.join(format!("{}.json", hex::encode(&digest[..16])))
    }

    /// Distance-matched lookup.
    ///
    /// The exact bucket file is tried first, then up to
    /// [`LOOKUP_SCAN_LIMIT`] directory entries. Expired files found on
    /// the way are deleted. A hit strips the `_cache_*` metadata.
    pub fn lookup(&self, lat: f64, lon: f64) -> Option<Value> {
        // ---
        let exact = self.cache_path(lat, lon);
        if let Some(hit) = self.try_file(&exact, lat, lon) {
            return Some(hit);
        }

        let entries = fs::read_dir(&self.cfg.dir).ok()?;
        for entry in entries.flatten().take(LOOKUP_SCAN_LIMIT) {
            let path = entry.path();
            if path == exact || path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            if let Some(hit) = self.try_file(&path, lat, lon) {
                return Some(hit);
            }
        }
        None
    }

    fn try_file(&self, path: &Path, lat: f64, lon: f64) -> Option<Value> {
        // ---
        let raw = fs::read(path).ok()?;
        let mut value: Value = serde_json::from_slice(&raw).ok()?;

        let cached_at = value.get("_cache_time").and_then(Value::as_i64)?;
        let age = now_unix().saturating_sub(cached_at.max(0) as u64);
        if age > self.cfg.ttl.as_secs() {
            let _ = fs::remove_file(path);
            return None;
        }

        let c_lat = value.get("_cache_lat").and_then(Value::as_f64)?;
        let c_lon = value.get("_cache_lon").and_then(Value::as_f64)?;
        if haversine_km(lat, lon, c_lat, c_lon) > self.cfg.distance_threshold_km {
            return None;
        }

        if let Some(obj) = value.as_object_mut() {
            obj.retain(|k, _| !k.starts_with("_cache_"));
        }
        Some(value)
    }

    /// Write-through after a provider fetch. Skipped entirely when the
    /// disk is under emergency pressure.
    pub fn store(&self, lat: f64, lon: f64, weather: &Value) {
        // ---
        if self.emergency_mode() {
            debug!("weather cache write skipped: emergency mode");
            return;
        }
        if let Some(avail) = self.disk.available_mb(&self.cfg.dir) {
            if avail < self.cfg.emergency_disk_threshold_mb {
                debug!("weather cache write skipped: {avail} MB free");
                return;
            }
        }

        let mut doc = weather.clone();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("_cache_lat".to_string(), json!(round3(lat)));
            obj.insert("_cache_lon".to_string(), json!(round3(lon)));
            obj.insert("_cache_time".to_string(), json!(now_unix()));
        }

        let path = self.cache_path(lat, lon);
        if let Err(e) = fs::write(&path, doc.to_string()) {
            warn!("weather cache write failed for {path:?}: {e}");
        }
    }

    /// Append one line to the fetch request log.
    pub fn log_request(&self, line: &str) {
        // ---
        use std::io::Write;
        let path = self.cfg.dir.join("requests.log");
        if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(f, "{} {line}", now_unix());
        }
    }

    // ---

    /// Score-based eviction pass. Runs at most every 30 minutes unless
    /// `force` is set (the disk monitor forces it under pressure).
    pub async fn intelligent_cleanup(&self, force: bool) {
        // ---
        {
            let last = self.last_cleanup.lock().unwrap_or_else(|e| e.into_inner());
            if !force && last.is_some_and(|t| t.elapsed() < CLEANUP_MIN_INTERVAL) {
                return;
            }
        }
        let _guard = self.cleanup_lock.lock().await;

        let dir = self.cfg.dir.clone();
        let ttl = self.cfg.ttl;
        let max_files = self.cfg.max_files;
        let max_size_mb = self.cfg.max_size_mb;
        let removed = tokio::task::spawn_blocking(move || {
            cleanup_pass(&dir, ttl, max_files, max_size_mb)
        })
        .await
        .unwrap_or(0);

        *self.last_cleanup.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        if removed > 0 {
            info!("weather cache cleanup removed {removed} files");
        }
    }

    /// Delete oldest cache files until [`EMERGENCY_FREE_TARGET_MB`] is
    /// freed or the cache is empty, truncate an oversized request log,
    /// and record the event in the emergency log.
    pub async fn emergency_cleanup(&self) {
        // ---
        let _guard = self.cleanup_lock.lock().await;
        let dir = self.cfg.dir.clone();
        let freed = tokio::task::spawn_blocking(move || emergency_pass(&dir))
            .await
            .unwrap_or(0);
        warn!("emergency cleanup freed {:.1} MB", freed as f64 / (1024.0 * 1024.0));
        self.log_emergency(freed);
    }

    fn log_emergency(&self, freed_bytes: u64) {
        // ---
        use std::io::Write;
        let path = self.cfg.dir.join("emergency.log");
        if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(f, "{} emergency_cleanup freed_bytes={freed_bytes}", now_unix());
        }
    }

    /// Disk monitor loop: sample free space every minute, run emergency
    /// cleanup below the critical threshold, intelligent cleanup below
    /// the emergency threshold, and expose `emergency_mode` while the
    /// volume stays critical.
    pub async fn disk_monitor(self: Arc<Self>) {
        // ---
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(avail) = self.disk.available_mb(&self.cfg.dir) else {
                continue;
            };

            if avail < self.cfg.critical_disk_threshold_mb {
                if !self.emergency_mode.swap(true, Ordering::Relaxed) {
                    warn!("disk critical: {avail} MB free, entering emergency mode");
                }
                self.emergency_cleanup().await;
            } else {
                if self.emergency_mode.swap(false, Ordering::Relaxed) {
                    info!("disk recovered: {avail} MB free, leaving emergency mode");
                }
                if avail < self.cfg.emergency_disk_threshold_mb {
                    self.intelligent_cleanup(true).await;
                }
            }
        }
    }
}

// ---

#[derive(Debug)]
struct CacheFile {
    path: PathBuf,
    size: u64,
    age_secs: u64,
}

fn scan_cache_files(dir: &Path) -> Vec<CacheFile> {
    // ---
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let now = SystemTime::now();
    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                return None;
            }
            let meta = entry.metadata().ok()?;
            let age_secs = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .map(|d| d.as_secs())
                .unwrap_or(u64::MAX);
            Some(CacheFile {
                path,
                size: meta.len(),
                age_secs,
            })
        })
        .collect()
}

/// One intelligent cleanup pass; returns files removed.
///
/// Eviction order: everything past TTL goes first; if total size still
/// exceeds the budget, the worst-scoring third goes; finally the oldest
/// go until the file count fits.
fn cleanup_pass(dir: &Path, ttl: Duration, max_files: usize, max_size_mb: u64) -> usize {
    // ---
    let mut files = scan_cache_files(dir);
    let mut removed = 0;

    files.retain(|f| {
        if f.age_secs > ttl.as_secs() {
            if fs::remove_file(&f.path).is_ok() {
                removed += 1;
            }
            false
        } else {
            true
        }
    });

    let total_size: u64 = files.iter().map(|f| f.size).sum();
    if total_size > max_size_mb * 1024 * 1024 && !files.is_empty() {
        // score = age + size/1024; highest scores are evicted.
        files.sort_by_key(|f| std::cmp::Reverse(f.age_secs + f.size / 1024));
        let victims = files.len().div_ceil(3);
        for f in files.drain(..victims) {
            if fs::remove_file(&f.path).is_ok() {
                removed += 1;
            }
        }
    }

    if files.len() > max_files {
        files.sort_by_key(|f| std::cmp::Reverse(f.age_secs));
        let excess = files.len() - max_files;
        for f in files.drain(..excess) {
            if fs::remove_file(&f.path).is_ok() {
                removed += 1;
            }
        }
    }

    removed
}

/// Emergency pass; returns bytes freed.
fn emergency_pass(dir: &Path) -> u64 {
    // ---
    let mut files = scan_cache_files(dir);
    files.sort_by_key(|f| std::cmp::Reverse(f.age_secs));

    let mut freed: u64 = 0;
    for f in files {
        if freed >= EMERGENCY_FREE_TARGET_MB * 1024 * 1024 {
            break;
        }
        if fs::remove_file(&f.path).is_ok() {
            freed += f.size;
        }
    }

    // An oversized request log is scrapped too; it is diagnostics only.
    let log = dir.join("requests.log");
    if let Ok(meta) = fs::metadata(&log) {
        if meta.len() > REQUEST_LOG_MAX_BYTES {
            let _ = fs::write(&log, b"");
        }
    }

    freed
}

fn now_unix() -> u64 {
    // ---
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tempfile::TempDir;

    fn cache_with(dir: &TempDir, cfg_mut: impl FnOnce(&mut WeatherCacheConfig)) -> WeatherDiskCache {
        // ---
        let mut cfg = WeatherCacheConfig {
            dir: dir.path().to_path_buf(),
            ..WeatherCacheConfig::default()
        };
        cfg_mut(&mut cfg);
        WeatherDiskCache::new(cfg, Arc::new(FixedDiskProbe::new(10_000))).unwrap()
    }

    #[test]
    fn store_then_lookup_strips_metadata() {
        // ---
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, |_| {});
        cache.store(48.8566, 2.3522, &json!({"temperature": 21.5}));

        let hit = cache.lookup(48.8566, 2.3522).unwrap();
        assert_eq!(hit, json!({"temperature": 21.5}));
    }

    #[test]
    fn nearby_query_hits_distant_query_misses() {
        // ---
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, |_| {});
        cache.store(48.8566, 2.3522, &json!({"temperature": 21.5}));

        // ~0.4 km away: hit.
        assert!(cache.lookup(48.860, 2.3522).is_some());
        // ~11 km away: miss.
        assert!(cache.lookup(48.956, 2.3522).is_none());
    }

    #[test]
    fn expired_entries_are_deleted_on_read() {
        // ---
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, |c| c.ttl = Duration::from_secs(0));
        cache.store(10.0, 20.0, &json!({"temperature": 5.0}));

        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.lookup(10.0, 20.0).is_none());
        assert!(!cache.cache_path(10.0, 20.0).exists());
    }

    #[test]
    fn writes_skipped_when_disk_low_or_emergency() {
        // ---
        let dir = TempDir::new().unwrap();
        let probe = Arc::new(FixedDiskProbe::new(100));
        let cfg = WeatherCacheConfig {
            dir: dir.path().to_path_buf(),
            ..WeatherCacheConfig::default()
        };
        let cache = WeatherDiskCache::new(cfg, probe.clone()).unwrap();

        cache.store(10.0, 20.0, &json!({"t": 1}));
        assert!(!cache.cache_path(10.0, 20.0).exists());

        probe.set(10_000);
        cache.emergency_mode.store(true, Ordering::Relaxed);
        cache.store(10.0, 20.0, &json!({"t": 1}));
        assert!(!cache.cache_path(10.0, 20.0).exists());
    }

    #[tokio::test]
    async fn cleanup_enforces_count_and_size() {
        // ---
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, |c| {
            c.max_files = 10;
            c.max_size_mb = 0; // force the size rule with tiny files
        });
        for i in 0..30 {
            cache.store(10.0 + i as f64, 20.0, &json!({"t": i, "pad": "x".repeat(512)}));
        }
        assert_eq!(scan_cache_files(dir.path()).len(), 30);

        cache.intelligent_cleanup(true).await;
        let remaining = scan_cache_files(dir.path()).len();
        assert!(remaining <= 10, "remaining {remaining}");
    }

    #[tokio::test]
    async fn emergency_cleanup_empties_cache_and_logs() {
        // ---
        let dir = TempDir::new().unwrap();
        let cache = cache_with(&dir, |_| {});
        for i in 0..5 {
            cache.store(10.0 + i as f64, 20.0, &json!({"t": i}));
        }

        cache.emergency_cleanup().await;
        assert_eq!(scan_cache_files(dir.path()).len(), 0);
        assert!(dir.path().join("emergency.log").exists());
    }
}
