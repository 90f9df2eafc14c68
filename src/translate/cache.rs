//! Two-tier content-addressable translation cache.
//! Key: blake3 fingerprint of (normalized text | normalized context | model id).
//! L1: bounded in-memory map with ratio-triggered LRU eviction.
//! L2: `PersistentStore` (SQLite in production), authoritative on L1 miss.
//! Entries can be exported to and imported from a JSON file.
//!
//! The memory lock is never held across persistent-tier I/O, and eviction runs
//! on the already-locked map so a lookup that promotes an entry can evict
//! without re-acquiring the lock.

use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::normalize::{normalize_context, normalize_text};
use super::sqlite_cache::SqliteStore;
use crate::config::CacheConfig;

/// Deterministic cache key for one translation request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fields are length-prefixed so ("ab", ["c"]) and ("a", ["bc"]) never collide.
    pub fn compute(text: &str, context: &[String], model_identifier: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        let mut field = |bytes: &[u8]| {
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(normalize_text(text).as_bytes());
        let context = normalize_context(context);
        field(&(context.len() as u64).to_le_bytes());
        for line in &context {
            field(line.as_bytes());
        }
        field(model_identifier.trim().as_bytes());
        Fingerprint(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A cached translation. Immutable after creation apart from access metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub source_text: String,
    pub context: Vec<String>,
    pub model_identifier: String,
    pub translated_text: String,
    /// Unix seconds.
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub hit_count: u64,
}

impl CacheEntry {
    /// Entry for a fresh translation; the creating request counts as the first use.
    pub fn new(
        source_text: &str,
        context: &[String],
        model_identifier: &str,
        translated_text: &str,
    ) -> Self {
        let now = now_unix();
        Self {
            fingerprint: Fingerprint::compute(source_text, context, model_identifier),
            source_text: source_text.to_string(),
            context: context.to_vec(),
            model_identifier: model_identifier.to_string(),
            translated_text: translated_text.to_string(),
            created_at: now,
            last_accessed_at: now,
            hit_count: 1,
        }
    }

    /// Rough heap footprint, used for memory statistics.
    pub fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.source_text.len()
            + self.translated_text.len()
            + self.model_identifier.len()
            + self.context.iter().map(|c| c.len() + std::mem::size_of::<String>()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Open(String),
    Query(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Open(msg) => write!(f, "cache store open failed: {msg}"),
            StoreError::Query(msg) => write!(f, "cache store query failed: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Aggregates reported by the persistent tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreAggregate {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub per_model: Vec<(String, u64)>,
}

/// Durable key-value table behind the memory tier.
/// Every call is a short, self-contained transaction.
pub trait PersistentStore: Send + Sync {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, StoreError>;
    /// Insert or replace; must be durable when it returns.
    fn upsert(&self, entry: &CacheEntry) -> Result<(), StoreError>;
    fn record_hit(&self, fingerprint: &Fingerprint, accessed_at: i64) -> Result<(), StoreError>;
    /// Delete rows last accessed before `cutoff` (unix seconds).
    fn purge_older_than(&self, cutoff: i64) -> Result<usize, StoreError>;
    fn clear_model(&self, model_identifier: &str) -> Result<usize, StoreError>;
    fn aggregate(&self) -> Result<StoreAggregate, StoreError>;
    /// Insert unless the fingerprint is already present; true if inserted.
    fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool, StoreError>;
    fn entries(&self) -> Result<Vec<CacheEntry>, StoreError>;
    /// Case-insensitive substring match on source or translation, most used first.
    fn search(
        &self,
        keyword: &str,
        model_identifier: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, StoreError>;
    fn clear_all(&self) -> Result<usize, StoreError>;
    /// Unix seconds of the last age purge. Stores without metadata always purge.
    fn last_cleanup(&self) -> Result<Option<i64>, StoreError> {
        Ok(None)
    }
    fn set_last_cleanup(&self, _at: i64) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Version written into export files; imports of any other version are refused.
pub const EXPORT_VERSION: u32 = 1;

/// Minimum spacing between automatic age purges.
const CLEANUP_INTERVAL_SECS: i64 = 86_400;

/// On-disk export layout. Fingerprints are recomputed on import.
#[derive(Debug, Serialize, Deserialize)]
struct CacheExport {
    version: u32,
    exported_at: i64,
    entries: Vec<ExportedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportedEntry {
    source_text: String,
    #[serde(default)]
    context: Vec<String>,
    model_identifier: String,
    translated_text: String,
    created_at: i64,
    last_accessed_at: i64,
    #[serde(default = "default_hit_count")]
    hit_count: u64,
}

fn default_hit_count() -> u64 {
    1
}

impl From<&CacheEntry> for ExportedEntry {
    fn from(e: &CacheEntry) -> Self {
        Self {
            source_text: e.source_text.clone(),
            context: e.context.clone(),
            model_identifier: e.model_identifier.clone(),
            translated_text: e.translated_text.clone(),
            created_at: e.created_at,
            last_accessed_at: e.last_accessed_at,
            hit_count: e.hit_count,
        }
    }
}

impl From<ExportedEntry> for CacheEntry {
    fn from(e: ExportedEntry) -> Self {
        Self {
            fingerprint: Fingerprint::compute(&e.source_text, &e.context, &e.model_identifier),
            source_text: e.source_text,
            context: e.context,
            model_identifier: e.model_identifier,
            translated_text: e.translated_text,
            created_at: e.created_at,
            last_accessed_at: e.last_accessed_at,
            hit_count: e.hit_count,
        }
    }
}

/// Export or import failure.
#[derive(Debug)]
pub enum TransferError {
    Io(std::io::Error),
    Format(serde_json::Error),
    UnsupportedVersion(u32),
    Store(StoreError),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Io(e) => write!(f, "cache file IO error: {e}"),
            TransferError::Format(e) => write!(f, "cache file format error: {e}"),
            TransferError::UnsupportedVersion(v) => {
                write!(f, "cache file version {v} is not supported (expected {EXPORT_VERSION})")
            }
            TransferError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e)
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::Format(e)
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub persistent_entries: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub memory_bytes: usize,
    pub evictions: u64,
    pub persistent_available: bool,
}

struct MemorySlot {
    entry: CacheEntry,
    /// Monotonic access stamp; lower means less recently used.
    last_tick: u64,
}

struct MemoryTier {
    slots: HashMap<Fingerprint, MemorySlot>,
    tick: u64,
}

impl MemoryTier {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[derive(Debug, Clone, Copy)]
struct EvictionPolicy {
    max_entries: usize,
    trigger_ratio: f64,
    keep_ratio: f64,
}

impl EvictionPolicy {
    fn should_evict(&self, len: usize) -> bool {
        len as f64 > self.trigger_ratio * self.max_entries as f64
    }

    fn keep_count(&self) -> usize {
        (self.keep_ratio * self.max_entries as f64).floor() as usize
    }
}

/// Owned two-tier cache; share it between workers behind an `Arc`.
pub struct FingerprintCache {
    memory: Mutex<MemoryTier>,
    persistent: Option<Box<dyn PersistentStore>>,
    persistent_live: AtomicBool,
    degraded: AtomicBool,
    policy: EvictionPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl FingerprintCache {
    /// Cache without a durable tier.
    pub fn memory_only(config: &CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Cache over an already-open persistent store.
    pub fn with_store(config: &CacheConfig, store: Box<dyn PersistentStore>) -> Self {
        Self::build(config, Some(store))
    }

    /// Open the SQLite tier at `config.db_path`. A store that cannot be opened
    /// degrades the cache to memory-only with a warning instead of failing.
    pub fn open(config: &CacheConfig) -> Self {
        let Some(path) = config.db_path.as_deref() else {
            info!("no cache db_path configured, running memory-only");
            return Self::memory_only(config);
        };

        match SqliteStore::open(path) {
            Ok(store) => {
                let cache = Self::with_store(config, Box::new(store));
                let max_age = Duration::from_secs(u64::from(config.max_age_days) * 86_400);
                cache.purge_if_due(max_age, now_unix());
                cache
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "persistent cache unavailable, running memory-only");
                let cache = Self::memory_only(config);
                cache.degraded.store(true, Ordering::SeqCst);
                cache
            }
        }
    }

    fn build(config: &CacheConfig, persistent: Option<Box<dyn PersistentStore>>) -> Self {
        let live = persistent.is_some();
        Self {
            memory: Mutex::new(MemoryTier {
                slots: HashMap::with_capacity(config.max_memory_entries),
                tick: 0,
            }),
            persistent,
            persistent_live: AtomicBool::new(live),
            degraded: AtomicBool::new(false),
            policy: EvictionPolicy {
                max_entries: config.max_memory_entries.max(1),
                trigger_ratio: config.trigger_ratio,
                keep_ratio: config.keep_ratio,
            },
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a translation. Memory first; on miss the persistent tier is
    /// consulted and a hit there is promoted into memory.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<String> {
        {
            let mut tier = self.memory.lock();
            let tick = tier.next_tick();
            if let Some(slot) = tier.slots.get_mut(fingerprint) {
                slot.last_tick = tick;
                slot.entry.hit_count += 1;
                slot.entry.last_accessed_at = now_unix();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(slot.entry.translated_text.clone());
            }
        }

        let Some(mut entry) = self.persistent_get(fingerprint) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let now = now_unix();
        entry.hit_count += 1;
        entry.last_accessed_at = now;
        if let Some(store) = self.live_store() {
            if let Err(e) = store.record_hit(fingerprint, now) {
                self.degrade(&e);
            }
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = ?fingerprint, "L2 cache hit, promoting");
        let text = entry.translated_text.clone();
        self.insert_memory(entry);
        Some(text)
    }

    /// Inspect an entry without counting it as a hit.
    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        if let Some(slot) = self.memory.lock().slots.get(fingerprint) {
            return Some(slot.entry.clone());
        }
        self.persistent_get(fingerprint)
    }

    /// Record a translation in both tiers. The persistent write has completed
    /// (or failed and degraded the cache) by the time this returns.
    pub fn store(&self, entry: CacheEntry) {
        let fingerprint = entry.fingerprint;
        if let Some(store) = self.live_store() {
            if let Err(e) = store.upsert(&entry) {
                self.degrade(&e);
            }
        }
        self.insert_memory(entry);
        debug!(fingerprint = ?fingerprint, "cache store");
    }

    /// Evict least-recently-used memory entries if occupancy exceeds the trigger.
    /// Returns the number of entries evicted.
    pub fn evict_if_needed(&self) -> usize {
        let mut tier = self.memory.lock();
        self.evict_locked(&mut tier)
    }

    /// Delete persistent rows not accessed within `max_age`. Memory is untouched.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let Some(store) = self.live_store() else {
            return 0;
        };
        let cutoff = now_unix() - max_age.as_secs() as i64;
        match store.purge_older_than(cutoff) {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "persistent cache purge");
                }
                removed
            }
            Err(e) => {
                self.degrade(&e);
                0
            }
        }
    }

    /// Age purge that runs at most once per day, tracked in the store's
    /// metadata. Returns rows removed; 0 when skipped.
    pub fn purge_if_due(&self, max_age: Duration, now: i64) -> usize {
        let Some(store) = self.live_store() else {
            return 0;
        };
        match store.last_cleanup() {
            Ok(Some(last)) if now - last < CLEANUP_INTERVAL_SECS => {
                debug!(last_cleanup = last, "age purge ran recently, skipping");
                return 0;
            }
            Ok(_) => {}
            Err(e) => {
                self.degrade(&e);
                return 0;
            }
        }
        let removed = self.purge_older_than(max_age);
        if let Some(store) = self.live_store() {
            if let Err(e) = store.set_last_cleanup(now) {
                self.degrade(&e);
            }
        }
        removed
    }

    /// Drop every entry produced by `model_identifier` from both tiers.
    pub fn clear_model(&self, model_identifier: &str) -> usize {
        let removed_memory = {
            let mut tier = self.memory.lock();
            let before = tier.slots.len();
            tier.slots
                .retain(|_, slot| slot.entry.model_identifier != model_identifier);
            before - tier.slots.len()
        };
        let removed_persistent = match self.live_store() {
            Some(store) => match store.clear_model(model_identifier) {
                Ok(n) => n,
                Err(e) => {
                    self.degrade(&e);
                    0
                }
            },
            None => 0,
        };
        info!(
            model = model_identifier,
            removed_memory, removed_persistent, "cache cleared for model"
        );
        removed_memory.max(removed_persistent)
    }

    /// Empty both tiers. Returns the larger of the two removal counts.
    pub fn clear_all(&self) -> usize {
        let removed_memory = {
            let mut tier = self.memory.lock();
            let n = tier.slots.len();
            tier.slots.clear();
            n
        };
        let removed_persistent = match self.live_store() {
            Some(store) => match store.clear_all() {
                Ok(n) => n,
                Err(e) => {
                    self.degrade(&e);
                    0
                }
            },
            None => 0,
        };
        info!(removed_memory, removed_persistent, "cache cleared");
        removed_memory.max(removed_persistent)
    }

    /// Entries whose source or translation contains `keyword` (ASCII
    /// case-insensitive), optionally limited to one model, most used first.
    /// Does not count as a hit.
    pub fn search(
        &self,
        keyword: &str,
        model_identifier: Option<&str>,
        limit: usize,
    ) -> Vec<CacheEntry> {
        if let Some(store) = self.live_store() {
            match store.search(keyword, model_identifier, limit) {
                Ok(found) => {
                    debug!(keyword, found = found.len(), "cache search");
                    return found;
                }
                Err(e) => self.degrade(&e),
            }
        }
        let needle = keyword.to_ascii_lowercase();
        let mut found: Vec<CacheEntry> = self
            .memory
            .lock()
            .slots
            .values()
            .map(|slot| &slot.entry)
            .filter(|e| model_identifier.map_or(true, |m| e.model_identifier == m))
            .filter(|e| {
                e.source_text.to_ascii_lowercase().contains(&needle)
                    || e.translated_text.to_ascii_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.hit_count
                .cmp(&a.hit_count)
                .then_with(|| a.source_text.cmp(&b.source_text))
        });
        found.truncate(limit);
        debug!(keyword, found = found.len(), "cache search (memory)");
        found
    }

    /// Every known entry: the persistent tier when live, else memory.
    fn all_entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        match self.live_store() {
            Some(store) => store.entries(),
            None => {
                let mut entries: Vec<CacheEntry> = self
                    .memory
                    .lock()
                    .slots
                    .values()
                    .map(|slot| slot.entry.clone())
                    .collect();
                entries.sort_by(|a, b| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| a.source_text.cmp(&b.source_text))
                });
                Ok(entries)
            }
        }
    }

    /// Write every entry to `path` as JSON. Returns the number written.
    pub fn export_to(&self, path: &Path) -> Result<usize, TransferError> {
        let entries = self.all_entries().map_err(|e| {
            self.degrade(&e);
            TransferError::Store(e)
        })?;
        let export = CacheExport {
            version: EXPORT_VERSION,
            exported_at: now_unix(),
            entries: entries.iter().map(ExportedEntry::from).collect(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&export)?)?;
        info!(path = %path.display(), entries = export.entries.len(), "cache exported");
        Ok(export.entries.len())
    }

    /// Load entries written by `export_to`. Existing entries win; returns the
    /// number actually added.
    pub fn import_from(&self, path: &Path) -> Result<usize, TransferError> {
        let export: CacheExport = serde_json::from_slice(&std::fs::read(path)?)?;
        if export.version != EXPORT_VERSION {
            warn!(path = %path.display(), version = export.version, "cache import refused");
            return Err(TransferError::UnsupportedVersion(export.version));
        }

        let mut imported = 0;
        for entry in export.entries.into_iter().map(CacheEntry::from) {
            let added = match self.live_store() {
                Some(store) => store.insert_if_absent(&entry).map_err(|e| {
                    self.degrade(&e);
                    TransferError::Store(e)
                })?,
                None => self.insert_memory_if_absent(entry),
            };
            if added {
                imported += 1;
            }
        }
        info!(path = %path.display(), imported, "cache imported");
        Ok(imported)
    }

    pub fn stats(&self) -> CacheStats {
        let (entry_count, memory_bytes) = {
            let tier = self.memory.lock();
            let bytes = tier.slots.values().map(|s| s.entry.approx_bytes()).sum();
            (tier.slots.len(), bytes)
        };
        let persistent_entries = self.live_store().and_then(|store| match store.aggregate() {
            Ok(agg) => Some(agg.entry_count),
            Err(e) => {
                self.degrade(&e);
                None
            }
        });
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entry_count,
            persistent_entries,
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            persistent_available: self.is_persistent_available(),
        }
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().slots.len()
    }

    pub fn is_persistent_available(&self) -> bool {
        self.persistent_live.load(Ordering::SeqCst)
    }

    /// True once a configured persistent tier has failed to open or to answer.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn insert_memory(&self, entry: CacheEntry) {
        let mut tier = self.memory.lock();
        let tick = tier.next_tick();
        tier.slots.insert(
            entry.fingerprint,
            MemorySlot {
                entry,
                last_tick: tick,
            },
        );
        self.evict_locked(&mut tier);
    }

    fn insert_memory_if_absent(&self, entry: CacheEntry) -> bool {
        if self.memory.lock().slots.contains_key(&entry.fingerprint) {
            return false;
        }
        self.insert_memory(entry);
        true
    }

    /// Partial selection of the k oldest slots with a bounded max-heap: O(n log k).
    fn evict_locked(&self, tier: &mut MemoryTier) -> usize {
        let len = tier.slots.len();
        if !self.policy.should_evict(len) {
            return 0;
        }
        let k = len - self.policy.keep_count().min(len);
        if k == 0 {
            return 0;
        }

        let mut oldest: BinaryHeap<(u64, Fingerprint)> = BinaryHeap::with_capacity(k + 1);
        for (fingerprint, slot) in &tier.slots {
            oldest.push((slot.last_tick, *fingerprint));
            if oldest.len() > k {
                oldest.pop();
            }
        }

        for (_, fingerprint) in oldest.into_iter() {
            tier.slots.remove(&fingerprint);
        }
        self.evictions.fetch_add(k as u64, Ordering::Relaxed);
        info!(
            evicted = k,
            remaining = tier.slots.len(),
            limit = self.policy.max_entries,
            "memory cache eviction"
        );
        k
    }

    fn live_store(&self) -> Option<&dyn PersistentStore> {
        if self.is_persistent_available() {
            self.persistent.as_deref()
        } else {
            None
        }
    }

    fn persistent_get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let store = self.live_store()?;
        match store.get(fingerprint) {
            Ok(entry) => entry,
            Err(e) => {
                self.degrade(&e);
                None
            }
        }
    }

    fn degrade(&self, error: &StoreError) {
        self.degraded.store(true, Ordering::SeqCst);
        if self.persistent_live.swap(false, Ordering::SeqCst) {
            warn!(error = %error, "persistent cache failed, continuing memory-only");
        }
    }
}

/// Current time as Unix timestamp (seconds).
pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
