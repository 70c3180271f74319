//! Bounded, time-expiring cache of loaded analyses.
//!
//! Entries are keyed by the SHA-256 of the artifact's canonical path and
//! carry a [`Fingerprint`] of the file; a changed modification time or size
//! drops the entry on the next access. Capacity is enforced by evicting the
//! least recently used entry, and entries idle for longer than the TTL are
//! swept whenever the cache is consulted.
//!
//! An on-disk cache keeps one `<key>.snapshot` (bincode) and one
//! `<key>.meta` (JSON) per entry so that separate invocations share work.
//! Every write to an entry happens under `<key>.lock` and lands through a
//! temporary file and a rename.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{Analysis, SCHEMA_VERSION};
use crate::error::{Result, ShadesError};
use crate::serialize;

const SNAPSHOT_EXT: &str = "snapshot";
const META_EXT: &str = "meta";
const LOCK_EXT: &str = "lock";
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);
const LOCK_ATTEMPTS: u32 = 200;
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Capacity and expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Maximum resident entries.
    pub capacity: usize,
    /// Entries idle for longer than this are purged.
    pub ttl: TimeDelta,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            ttl: TimeDelta::days(5),
        }
    }
}

/// Identity of an artifact file at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    /// Canonical artifact path.
    pub path: PathBuf,
    /// Modification time, whole seconds since the epoch.
    pub modified_secs: i64,
    /// Sub-second part of the modification time.
    pub modified_nanos: u32,
    /// Size in bytes.
    pub size: u64,
}

impl Fingerprint {
    /// Fingerprint the file at `path`.
    pub fn of(path: &Path) -> io::Result<Self> {
        let canonical = std::fs::canonicalize(path)?;
        let metadata = std::fs::metadata(&canonical)?;
        let modified = metadata.modified()?;
        let (modified_secs, modified_nanos) = match modified.duration_since(UNIX_EPOCH) {
            Ok(since) => (since.as_secs() as i64, since.subsec_nanos()),
            Err(before) => (-(before.duration().as_secs() as i64), 0),
        };
        Ok(Self {
            path: canonical,
            modified_secs,
            modified_nanos,
            size: metadata.len(),
        })
    }

    fn key(&self) -> String {
        cache_key(&self.path)
    }
}

/// Build stamp recorded with every entry. Snapshots are not
/// self-describing, so entries from any other build are dropped.
fn snapshot_version() -> String {
    format!("{}+schema{}", env!("CARGO_PKG_VERSION"), SCHEMA_VERSION)
}

fn cache_key(canonical: &Path) -> String {
    Sha256::digest(canonical.to_string_lossy().as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub struct Lookup {
    /// The loaded analysis.
    pub analysis: Arc<Analysis>,
    /// Whether it was served without reading the artifact.
    pub cached: bool,
}

#[derive(Debug)]
struct Entry {
    fingerprint: Fingerprint,
    last_access: DateTime<Utc>,
    analysis: Option<Arc<Analysis>>,
}

/// Memoizes [`serialize::load`].
pub struct AnalysisCache<C: Clock = SystemClock> {
    clock: C,
    settings: CacheSettings,
    store: Option<SnapshotStore>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl<C: Clock> AnalysisCache<C> {
    /// A cache that lives only as long as this value.
    pub fn in_memory(clock: C, settings: CacheSettings) -> Self {
        Self {
            clock,
            settings,
            store: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A cache persisted under `dir`, picking up entries left by earlier
    /// runs.
    pub fn on_disk(dir: impl Into<PathBuf>, clock: C, settings: CacheSettings) -> Result<Self> {
        let store = SnapshotStore::open(dir.into())?;
        let mut entries = HashMap::new();
        for (key, meta) in store.read_index() {
            entries.insert(
                key,
                Entry {
                    fingerprint: meta.fingerprint,
                    last_access: meta.last_access,
                    analysis: None,
                },
            );
        }
        debug!("analysis cache opened with {} entries", entries.len());
        Ok(Self {
            clock,
            settings,
            store: Some(store),
            entries: Mutex::new(entries),
        })
    }

    /// Load the analysis at `path`, from the cache when possible.
    pub fn get(&self, path: &Path) -> Result<Arc<Analysis>> {
        self.fetch(path).map(|lookup| lookup.analysis)
    }

    /// Like [`get`](Self::get), also reporting whether the cache served it.
    pub fn fetch(&self, path: &Path) -> Result<Lookup> {
        let fingerprint = Fingerprint::of(path)
            .map_err(|err| ShadesError::serialization(path, format!("cannot read file: {err}")))?;
        let key = fingerprint.key();
        let now = self.clock.now();

        let mut entries = self.lock_entries();
        self.sweep(&mut entries, now);

        if let Some(analysis) = self.cached(&mut entries, &key, &fingerprint, now) {
            debug!("analysis cache hit for {}", path.display());
            return Ok(Lookup {
                analysis,
                cached: true,
            });
        }

        debug!("analysis cache miss for {}", path.display());
        let analysis = Arc::new(serialize::load(path)?);
        self.insert(&mut entries, key, fingerprint, Arc::clone(&analysis), now);
        Ok(Lookup {
            analysis,
            cached: false,
        })
    }

    /// Whether `path` currently has a fresh entry.
    pub fn contains(&self, path: &Path) -> bool {
        let Ok(fingerprint) = Fingerprint::of(path) else {
            return false;
        };
        let entries = self.lock_entries();
        entries
            .get(&fingerprint.key())
            .is_some_and(|entry| entry.fingerprint == fingerprint)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, on disk included.
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.lock_entries();
        entries.clear();
        if let Some(store) = &self.store {
            store.clear()?;
        }
        debug!("analysis cache cleared");
        Ok(())
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self, entries: &mut HashMap<String, Entry>, now: DateTime<Utc>) {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now - entry.last_access > self.settings.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                debug!("analysis cache expired {}", entry.fingerprint.path.display());
            }
            self.remove_from_disk(&key);
        }
    }

    fn cached(
        &self,
        entries: &mut HashMap<String, Entry>,
        key: &str,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Option<Arc<Analysis>> {
        let entry = entries.get_mut(key)?;
        if entry.fingerprint != *fingerprint {
            debug!(
                "analysis cache entry for {} is stale",
                fingerprint.path.display()
            );
            entries.remove(key);
            self.remove_from_disk(key);
            return None;
        }

        if entry.analysis.is_none() {
            let store = self.store.as_ref()?;
            match store.read_snapshot(key) {
                Ok(analysis) => entry.analysis = Some(Arc::new(analysis)),
                Err(err) => {
                    warn!("dropping unreadable cache entry {key}: {err}");
                    entries.remove(key);
                    self.remove_from_disk(key);
                    return None;
                }
            }
        }
        let analysis = entry.analysis.clone()?;

        entry.last_access = now;
        if let Some(store) = &self.store {
            let meta = Meta::new(entry);
            if let Err(err) = store.write(key, &meta, None) {
                warn!("could not record cache access for {key}: {err}");
            }
        }
        Some(analysis)
    }

    fn insert(
        &self,
        entries: &mut HashMap<String, Entry>,
        key: String,
        fingerprint: Fingerprint,
        analysis: Arc<Analysis>,
        now: DateTime<Utc>,
    ) {
        while entries.len() >= self.settings.capacity.max(1) {
            let Some(oldest) = entries
                .iter()
                .min_by(|(a_key, a), (b_key, b)| {
                    a.last_access.cmp(&b.last_access).then_with(|| a_key.cmp(b_key))
                })
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            if let Some(entry) = entries.remove(&oldest) {
                debug!("analysis cache evicted {}", entry.fingerprint.path.display());
            }
            self.remove_from_disk(&oldest);
        }

        let entry = Entry {
            fingerprint,
            last_access: now,
            analysis: Some(Arc::clone(&analysis)),
        };
        if let Some(store) = &self.store {
            if let Err(err) = store.write(&key, &Meta::new(&entry), Some(&analysis)) {
                warn!("could not persist cache entry {key}: {err}");
            }
        }
        entries.insert(key, entry);
    }

    fn remove_from_disk(&self, key: &str) {
        if let Some(store) = &self.store {
            if let Err(err) = store.remove(key) {
                warn!("could not remove cache entry {key}: {err}");
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    #[serde(default)]
    version: String,
    fingerprint: Fingerprint,
    last_access: DateTime<Utc>,
}

impl Meta {
    fn new(entry: &Entry) -> Self {
        Self {
            version: snapshot_version(),
            fingerprint: entry.fingerprint.clone(),
            last_access: entry.last_access,
        }
    }
}

struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ext}"))
    }

    fn read_index(&self) -> Vec<(String, Meta)> {
        let Ok(listing) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let current = snapshot_version();
        let mut index = Vec::new();
        for entry in listing.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(META_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let key = key.to_string();
            match self.read_meta(&path) {
                Ok(meta) if meta.version != current => {
                    debug!(
                        "dropping cache entry {key} written by build {:?}",
                        meta.version
                    );
                    let _ = self.remove(&key);
                }
                Ok(meta) if self.path(&key, SNAPSHOT_EXT).exists() => index.push((key, meta)),
                Ok(_) => {
                    let _ = self.remove(&key);
                }
                Err(err) => {
                    warn!("dropping unreadable cache entry {key}: {err}");
                    let _ = self.remove(&key);
                }
            }
        }
        index
    }

    fn read_meta(&self, path: &Path) -> Result<Meta> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn read_snapshot(&self, key: &str) -> Result<Analysis> {
        let bytes = std::fs::read(self.path(key, SNAPSHOT_EXT))?;
        bincode::deserialize(&bytes)
            .map_err(|err| ShadesError::Cache(format!("corrupt snapshot {key}: {err}")))
    }

    fn write(&self, key: &str, meta: &Meta, analysis: Option<&Analysis>) -> Result<()> {
        let _lock = EntryLock::acquire(self.path(key, LOCK_EXT))?;
        if let Some(analysis) = analysis {
            let bytes = bincode::serialize(analysis)
                .map_err(|err| ShadesError::Cache(format!("cannot encode snapshot: {err}")))?;
            self.write_atomic(key, SNAPSHOT_EXT, &bytes)?;
        }
        let text = serde_json::to_string(meta)?;
        self.write_atomic(key, META_EXT, text.as_bytes())
    }

    fn write_atomic(&self, key: &str, ext: &str, bytes: &[u8]) -> Result<()> {
        let temp = self
            .dir
            .join(format!(".{key}.{ext}.{}.tmp", std::process::id()));
        std::fs::write(&temp, bytes)?;
        if let Err(err) = std::fs::rename(&temp, self.path(key, ext)) {
            let _ = std::fs::remove_file(&temp);
            return Err(err.into());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _lock = EntryLock::acquire(self.path(key, LOCK_EXT))?;
        for ext in [META_EXT, SNAPSHOT_EXT] {
            match std::fs::remove_file(self.path(key, ext)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let owned = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some(SNAPSHOT_EXT | META_EXT)
            );
            if owned {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Exclusive access to one cache entry, held until dropped.
struct EntryLock {
    path: PathBuf,
}

impl EntryLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!("removing stale cache lock {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ShadesError::Cache(format!(
            "timed out waiting for {}",
            path.display()
        )))
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}
