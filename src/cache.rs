//! Run-level memoization of batch results.
//!
//! Every remote lookup costs an API credit, so an unchanged request (same
//! queries, locale and mode) is answered from memory until its entry expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::dispatcher::BatchResult;
use crate::input_loader::Query;
use crate::locale::{ExtractionMode, LocaleConfig};

pub const DEFAULT_MAX_ENTRIES: usize = 64;

/// Identity of a run. The worker count lives inside `locale`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub queries: Vec<Query>,
    pub locale: LocaleConfig,
    pub mode: ExtractionMode,
}

impl RunKey {
    pub fn new(queries: &[Query], locale: &LocaleConfig, mode: ExtractionMode) -> Self {
        RunKey {
            queries: queries.to_vec(),
            locale: locale.clone(),
            mode,
        }
    }
}

struct CachedEntry {
    result: Arc<BatchResult>,
    inserted_at: Instant,
}

// Each key owns a slot; holding the slot lock is what makes computation
// single-flight per key.
type Slot = Arc<Mutex<Option<CachedEntry>>>;

pub struct CacheOutcome {
    pub result: Arc<BatchResult>,
    /// True when no computation ran for this call.
    pub hit: bool,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Keys with a stored result
    pub total: usize,
    /// Stored results past their TTL (not yet evicted)
    pub expired: usize,
    /// Maximum number of keys kept
    pub max: usize,
}

// Slots are only cloned while the map lock is held, so under that lock a
// count above one means some caller is about to lock or is computing.
fn in_use(slot: &Slot) -> bool {
    Arc::strong_count(slot) > 1
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking computation must not take the whole cache down with it.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ResultCache {
    slots: Mutex<HashMap<RunKey, Slot>>,
    ttl: Option<Duration>,
    max_entries: usize,
}

impl ResultCache {
    /// `ttl = None` keeps entries for the lifetime of the process.
    pub fn new(ttl: Option<Duration>, max_entries: usize) -> Self {
        ResultCache {
            slots: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn is_fresh(&self, entry: &CachedEntry) -> bool {
        self.ttl.map_or(true, |ttl| entry.inserted_at.elapsed() <= ttl)
    }

    fn slot_for(&self, key: RunKey) -> Slot {
        let mut slots = lock(&self.slots);
        if !slots.contains_key(&key) && slots.len() >= self.max_entries {
            Self::evict_oldest(&mut slots);
        }
        slots.entry(key).or_default().clone()
    }

    /// Removes the slot holding the oldest result. Empty slots go first;
    /// slots held by any caller are never touched.
    fn evict_oldest(slots: &mut HashMap<RunKey, Slot>) {
        let victim = slots
            .iter()
            .filter(|(_, slot)| !in_use(slot))
            .filter_map(|(key, slot)| {
                let guard = slot.try_lock().ok()?;
                Some((key, guard.as_ref().map(|e| e.inserted_at)))
            })
            .min_by_key(|(_, inserted_at)| *inserted_at)
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            debug!("Evicting cached run with {} queries", key.queries.len());
            slots.remove(&key);
        }
    }

    /// Returns the stored result for `key` if still fresh, otherwise runs
    /// `compute` and stores its result.
    ///
    /// Concurrent callers with the same key wait for the first one instead
    /// of computing again. Results containing failed queries are returned
    /// but not stored, so a later call retries them.
    pub fn get_or_compute<F>(&self, key: RunKey, compute: F) -> CacheOutcome
    where
        F: FnOnce() -> BatchResult,
    {
        let query_count = key.queries.len();
        let slot = self.slot_for(key.clone());
        let mut entry = lock(&slot);

        match entry.as_ref() {
            Some(cached) if self.is_fresh(cached) => {
                info!("Cache hit for run of {} queries", query_count);
                return CacheOutcome {
                    result: Arc::clone(&cached.result),
                    hit: true,
                };
            }
            Some(_) => info!("Cache miss for run of {} queries (expired)", query_count),
            None => info!("Cache miss for run of {} queries", query_count),
        }

        let result = Arc::new(compute());
        if result.failed_count() == 0 {
            *entry = Some(CachedEntry {
                result: Arc::clone(&result),
                inserted_at: Instant::now(),
            });
        } else {
            info!(
                "Not caching run with {} failed queries",
                result.failed_count()
            );
            *entry = None;
            drop(entry);
            self.release_empty(&key, &slot);
        }

        CacheOutcome { result, hit: false }
    }

    /// Drops `slot` from the map when it is still empty and nobody else
    /// holds it, so failed runs do not occupy capacity.
    fn release_empty(&self, key: &RunKey, slot: &Slot) {
        let mut slots = lock(&self.slots);
        let ours = slots.get(key).map_or(false, |current| Arc::ptr_eq(current, slot));
        // Map + this caller.
        let unshared = Arc::strong_count(slot) == 2;
        let empty = slot.try_lock().map_or(false, |guard| guard.is_none());
        if ours && unshared && empty {
            slots.remove(key);
        }
    }

    /// Fresh stored result for `key`, without computing. Waits if the key is
    /// being computed.
    pub fn get(&self, key: &RunKey) -> Option<Arc<BatchResult>> {
        let slot = lock(&self.slots).get(key).cloned()?;
        let entry = lock(&slot);
        entry
            .as_ref()
            .filter(|e| self.is_fresh(e))
            .map(|e| Arc::clone(&e.result))
    }

    pub fn clear(&self) {
        lock(&self.slots).clear();
    }

    /// Drops expired and empty slots that no caller holds.
    pub fn cleanup_expired(&self) {
        let mut slots = lock(&self.slots);
        slots.retain(|_, slot| {
            if in_use(slot) {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => guard.as_ref().map_or(false, |e| self.is_fresh(e)),
                Err(_) => true,
            }
        });
    }

    pub fn stats(&self) -> CacheStats {
        let slots = lock(&self.slots);
        let mut total = 0;
        let mut expired = 0;
        for slot in slots.values() {
            if let Ok(guard) = slot.try_lock() {
                if let Some(entry) = guard.as_ref() {
                    total += 1;
                    if !self.is_fresh(entry) {
                        expired += 1;
                    }
                }
            }
        }
        CacheStats {
            total,
            expired,
            max: self.max_entries,
        }
    }
}
