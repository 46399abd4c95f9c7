//! Model loader and in-memory predictor cache.
//!
//! Each model version owns one slot: `Loading`, `Ready`, or `Failed`.
//! The map lock is a short critical section and is never held across an
//! await; load outcomes fan out to concurrent waiters over a watch channel
//! so N callers of an unresolved version trigger exactly one fetch+load.
//! Failed outcomes are cached per version until swept or invalidated,
//! which bounds remote refetch storms.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::predictor::{deserialize_artifact, Predictor};
use crate::resolver::{ArtifactResolver, ModelVersion};

/// Loader-derived state of a version, as surfaced by the health reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Unconfigured,
    Loading,
    Ready,
    Failed,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Unconfigured => "unconfigured",
            LoadStatus::Loading => "loading",
            LoadStatus::Ready => "ready",
            LoadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type LoadOutcome = Result<Arc<dyn Predictor>, Arc<LoadError>>;

enum Slot {
    Loading {
        rx: watch::Receiver<Option<LoadOutcome>>,
    },
    Ready {
        predictor: Arc<dyn Predictor>,
        in_flight: Arc<AtomicUsize>,
        last_access: Instant,
    },
    Failed {
        error: Arc<LoadError>,
        failed_at: Instant,
    },
}

/// RAII lease over a cached predictor. While any lease is live the entry
/// is pinned against eviction; the in-flight count drops with the lease.
#[derive(Debug)]
pub struct PredictorLease {
    predictor: Arc<dyn Predictor>,
    in_flight: Arc<AtomicUsize>,
}

impl Deref for PredictorLease {
    type Target = dyn Predictor;
    fn deref(&self) -> &Self::Target {
        self.predictor.as_ref()
    }
}

impl Drop for PredictorLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ModelCache {
    resolver: ArtifactResolver,
    entries: Mutex<HashMap<ModelVersion, Slot>>,
    max_entries: usize,
    idle_timeout: Duration,
}

enum Action {
    Lease(PredictorLease),
    Wait(watch::Receiver<Option<LoadOutcome>>),
    Failed(Arc<LoadError>),
    Load(watch::Sender<Option<LoadOutcome>>),
}

impl ModelCache {
    pub fn new(resolver: ArtifactResolver, max_entries: usize, idle_timeout: Duration) -> Self {
        Self {
            resolver,
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            idle_timeout,
        }
    }

    /// Returns a lease on the predictor for `version`, loading it if
    /// necessary. Concurrent callers for the same unresolved version share
    /// a single resolve+deserialize and its outcome, success or failure.
    pub async fn get_or_load(&self, version: &ModelVersion) -> Result<PredictorLease, Arc<LoadError>> {
        loop {
            let action = {
                let mut map = self.entries.lock();
                match map.get_mut(version) {
                    Some(Slot::Ready { predictor, in_flight, last_access }) => {
                        *last_access = Instant::now();
                        in_flight.fetch_add(1, Ordering::SeqCst);
                        Action::Lease(PredictorLease {
                            predictor: Arc::clone(predictor),
                            in_flight: Arc::clone(in_flight),
                        })
                    }
                    Some(Slot::Loading { rx, .. }) => Action::Wait(rx.clone()),
                    Some(Slot::Failed { error, .. }) => Action::Failed(Arc::clone(error)),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        map.insert(version.clone(), Slot::Loading { rx });
                        Action::Load(tx)
                    }
                }
            };
            match action {
                Action::Lease(lease) => return Ok(lease),
                Action::Failed(err) => return Err(err),
                Action::Load(tx) => return self.run_load(version, tx).await,
                Action::Wait(mut rx) => {
                    let outcome = loop {
                        let current = rx.borrow().clone();
                        if let Some(out) = current {
                            break out;
                        }
                        if rx.changed().await.is_err() {
                            return Err(Arc::new(LoadError::Shutdown));
                        }
                    };
                    match outcome {
                        Err(err) => return Err(err),
                        // Ready slot is published before the send; take a
                        // lease on the next pass. If it was evicted in the
                        // meantime the pass starts a fresh load instead.
                        Ok(_) => continue,
                    }
                }
            }
        }
    }

    async fn run_load(
        &self,
        version: &ModelVersion,
        tx: watch::Sender<Option<LoadOutcome>>,
    ) -> Result<PredictorLease, Arc<LoadError>> {
        // If this future is dropped mid-load the slot must not stay Loading
        // forever; the guard clears it so waiters fail with Shutdown and a
        // later call can start over.
        let mut cleanup = LoadCleanup { cache: self, version, armed: true };

        let started = Instant::now();
        let loaded: Result<Arc<dyn Predictor>, LoadError> = match self.resolver.resolve(version).await {
            Ok(bytes) => deserialize_artifact(&bytes),
            Err(e) => Err(LoadError::Resolve(e)),
        };

        let mut map = self.entries.lock();
        cleanup.armed = false;
        match loaded {
            Ok(predictor) => {
                info!(
                    version = %version.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model loaded"
                );
                let in_flight = Arc::new(AtomicUsize::new(1));
                map.insert(
                    version.clone(),
                    Slot::Ready {
                        predictor: Arc::clone(&predictor),
                        in_flight: Arc::clone(&in_flight),
                        last_access: Instant::now(),
                    },
                );
                self.evict_over_capacity(&mut map);
                drop(map);
                let _ = tx.send(Some(Ok(Arc::clone(&predictor))));
                Ok(PredictorLease { predictor, in_flight })
            }
            Err(e) => {
                let err = Arc::new(e);
                warn!(version = %version.id, error = %err, "model load failed");
                map.insert(version.clone(), Slot::Failed { error: Arc::clone(&err), failed_at: Instant::now() });
                drop(map);
                let _ = tx.send(Some(Err(Arc::clone(&err))));
                Err(err)
            }
        }
    }

    /// Lease the predictor only if the version is already Ready. Never
    /// blocks and never triggers a load.
    pub fn try_lease(&self, version: &ModelVersion) -> Option<PredictorLease> {
        let mut map = self.entries.lock();
        if let Some(Slot::Ready { predictor, in_flight, last_access }) = map.get_mut(version) {
            *last_access = Instant::now();
            in_flight.fetch_add(1, Ordering::SeqCst);
            Some(PredictorLease {
                predictor: Arc::clone(predictor),
                in_flight: Arc::clone(in_flight),
            })
        } else {
            None
        }
    }

    /// Health view. An absent slot for a configured version reports
    /// Loading: either the warm-up task or the next request will start one.
    pub fn status(&self, version: Option<&ModelVersion>) -> LoadStatus {
        let Some(version) = version else { return LoadStatus::Unconfigured };
        match self.entries.lock().get(version) {
            None | Some(Slot::Loading { .. }) => LoadStatus::Loading,
            Some(Slot::Ready { .. }) => LoadStatus::Ready,
            Some(Slot::Failed { .. }) => LoadStatus::Failed,
        }
    }

    /// Starts a background load unless a slot already exists. Used by the
    /// request path so `/predict` signals NotReady instead of blocking.
    pub fn ensure_loading(self: &Arc<Self>, version: &ModelVersion) {
        let absent = !self.entries.lock().contains_key(version);
        if absent {
            self.spawn_load(version.clone());
        }
    }

    pub fn spawn_load(self: &Arc<Self>, version: ModelVersion) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = cache.get_or_load(&version).await {
                debug!(version = %version.id, error = %e, "background model load failed");
            }
        });
    }

    /// Drops a Failed or idle Ready entry. Entries serving in-flight
    /// requests and entries still loading are left alone.
    pub fn invalidate(&self, version: &ModelVersion) -> bool {
        let mut map = self.entries.lock();
        match map.get(version) {
            Some(Slot::Ready { in_flight, .. }) if in_flight.load(Ordering::SeqCst) > 0 => false,
            Some(Slot::Ready { .. }) | Some(Slot::Failed { .. }) => {
                map.remove(version);
                true
            }
            _ => false,
        }
    }

    /// Evicts entries unused beyond the idle timeout, Failed entries
    /// included so a fixed remote can be retried without a restart.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let mut map = self.entries.lock();
        map.retain(|version, slot| {
            let keep = match slot {
                Slot::Ready { in_flight, last_access, .. } => {
                    in_flight.load(Ordering::SeqCst) > 0
                        || now.duration_since(*last_access) < self.idle_timeout
                }
                Slot::Failed { failed_at, .. } => now.duration_since(*failed_at) < self.idle_timeout,
                Slot::Loading { .. } => true,
            };
            if !keep {
                debug!(version = %version.id, "evicting idle cache entry");
            }
            keep
        });
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cache.sweep_idle();
            }
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Registers an already-built predictor as Ready, bypassing resolution.
    /// Useful for embedded models and test harnesses.
    pub fn insert_ready(&self, version: ModelVersion, predictor: Arc<dyn Predictor>) {
        let mut map = self.entries.lock();
        map.insert(
            version,
            Slot::Ready {
                predictor,
                in_flight: Arc::new(AtomicUsize::new(0)),
                last_access: Instant::now(),
            },
        );
        self.evict_over_capacity(&mut map);
    }

    /// Least-recently-used eviction under size pressure. Loading slots and
    /// entries with live leases are never victims; if nothing is evictable
    /// the map is allowed to run over capacity.
    fn evict_over_capacity(&self, map: &mut HashMap<ModelVersion, Slot>) {
        while map.len() > self.max_entries {
            let victim = map
                .iter()
                .filter_map(|(version, slot)| match slot {
                    Slot::Ready { in_flight, last_access, .. }
                        if in_flight.load(Ordering::SeqCst) == 0 =>
                    {
                        Some((version.clone(), *last_access))
                    }
                    Slot::Failed { failed_at, .. } => Some((version.clone(), *failed_at)),
                    _ => None,
                })
                .min_by_key(|(_, at)| *at)
                .map(|(version, _)| version);
            match victim {
                Some(version) => {
                    debug!(version = %version.id, "evicting cache entry under size pressure");
                    map.remove(&version);
                }
                None => break,
            }
        }
    }
}

struct LoadCleanup<'a> {
    cache: &'a ModelCache,
    version: &'a ModelVersion,
    armed: bool,
}

impl Drop for LoadCleanup<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut map = self.cache.entries.lock();
            if matches!(map.get(self.version), Some(Slot::Loading { .. })) {
                map.remove(self.version);
            }
        }
    }
}
