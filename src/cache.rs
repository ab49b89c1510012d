//! In-process LRU cache of rendered artifacts, keyed by fingerprint.
//!
//! Concurrent requests for the same fingerprint share one render
//! (single-flight). Only generated artifacts are stored; failures reach the
//! callers of that flight and are then forgotten.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::artifact::{ArtifactStatus, PreviewArtifact};
use crate::error::RenderError;
use crate::request::Fingerprint;

/// Default number of cached artifacts.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

type FlightResult = Result<Arc<PreviewArtifact>, RenderError>;

/// How a [`ArtifactCache::get_or_render`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Served from the cache.
    Hit,
    /// This caller rendered.
    Miss,
    /// Joined a render already in flight.
    Coalesced,
}

impl Lookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Coalesced => "coalesced",
        }
    }
}

struct CacheEntry {
    artifact: Arc<PreviewArtifact>,
    inserted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
}

pub struct ArtifactCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    // Lock order: `in_flight` before `entries`
    in_flight: Mutex<HashMap<Fingerprint, watch::Receiver<Option<FlightResult>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

enum Role {
    Hit(Arc<PreviewArtifact>),
    Leader(watch::Sender<Option<FlightResult>>),
    Follower(watch::Receiver<Option<FlightResult>>),
}

impl ArtifactCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up an artifact, marking it most recently used.
    pub fn get(&self, fp: &Fingerprint) -> Option<Arc<PreviewArtifact>> {
        let found = self.entries.lock().get(fp).map(|e| e.artifact.clone());
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Look up an artifact without touching recency or the hit/miss counters.
    pub fn peek(&self, fp: &Fingerprint) -> Option<Arc<PreviewArtifact>> {
        self.entries.lock().peek(fp).map(|e| e.artifact.clone())
    }

    /// Store a generated artifact. Anything else is ignored.
    pub fn put(&self, fp: Fingerprint, artifact: PreviewArtifact) {
        self.insert(fp, Arc::new(artifact));
    }

    fn insert(&self, fp: Fingerprint, artifact: Arc<PreviewArtifact>) {
        if artifact.status != ArtifactStatus::Generated {
            tracing::debug!(fingerprint = %fp, status = ?artifact.status, "refusing to cache failed artifact");
            return;
        }
        let entry = CacheEntry {
            artifact,
            inserted_at: Utc::now(),
        };
        if let Some((evicted, old)) = self.entries.lock().push(fp, entry) {
            if evicted != fp {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    fingerprint = %evicted,
                    age_ms = (Utc::now() - old.inserted_at).num_milliseconds(),
                    "evicted least recently used artifact"
                );
            }
        }
    }

    /// Return the cached artifact, or run `render` once for all concurrent
    /// callers of the same fingerprint.
    ///
    /// If the caller that is rendering goes away, waiting callers retry and
    /// one of them takes over.
    pub async fn get_or_render<F, Fut>(
        &self,
        fp: Fingerprint,
        render: F,
    ) -> Result<(Arc<PreviewArtifact>, Lookup), RenderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PreviewArtifact, RenderError>>,
    {
        loop {
            match self.join(fp) {
                Role::Hit(artifact) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((artifact, Lookup::Hit));
                }
                Role::Leader(tx) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let flight = Flight {
                        cache: self,
                        fp,
                        tx: Some(tx),
                    };
                    let result = render().await.map(Arc::new);
                    flight.complete(result.clone());
                    return result.map(|artifact| (artifact, Lookup::Miss));
                }
                Role::Follower(rx) => {
                    if let Some(result) = wait_for_flight(rx).await {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        return result.map(|artifact| (artifact, Lookup::Coalesced));
                    }
                    tracing::debug!(fingerprint = %fp, "render flight abandoned, retrying");
                }
            }
        }
    }

    fn join(&self, fp: Fingerprint) -> Role {
        let mut in_flight = self.in_flight.lock();
        if let Some(entry) = self.entries.lock().get(&fp) {
            return Role::Hit(entry.artifact.clone());
        }
        if let Some(rx) = in_flight.get(&fp) {
            return Role::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        in_flight.insert(fp, rx);
        Role::Leader(tx)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, capacity) = {
            let lru = self.entries.lock();
            (lru.len(), lru.cap().get())
        };
        CacheStats {
            entries,
            capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

/// The leader's claim on a fingerprint. Dropping it unfinished releases the
/// claim so waiters can retry.
struct Flight<'a> {
    cache: &'a ArtifactCache,
    fp: Fingerprint,
    tx: Option<watch::Sender<Option<FlightResult>>>,
}

impl Flight<'_> {
    fn complete(mut self, result: FlightResult) {
        {
            let mut in_flight = self.cache.in_flight.lock();
            // Cache before releasing the claim so no caller sees neither
            if let Ok(artifact) = &result {
                self.cache.insert(self.fp, artifact.clone());
            }
            in_flight.remove(&self.fp);
        }
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.cache.in_flight.lock().remove(&self.fp);
        }
        // `tx` drops after this, waking waiters with a closed channel
    }
}

/// Wait for a flight's result. `None` means the leader gave up without one.
async fn wait_for_flight(mut rx: watch::Receiver<Option<FlightResult>>) -> Option<FlightResult> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return Some(result);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
