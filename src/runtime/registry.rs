//! Handle registry: bounded, idle-expiring cache of loaded callees
//!
//! The registry maps canonical locations to [`CalleeHandle`]s. One registry
//! is shared by every caller in a process; clones share the same state.
//!
//! - Lookups are single-flight: a second lookup for a location that is
//!   still loading waits for the first load instead of loading again.
//! - Every lookup and release runs an eviction pass that drops entries idle
//!   longer than the TTL and then the least recently used entries beyond
//!   the capacity.
//! - An evicted handle leaves the map at once. If it is locked, disposal is
//!   deferred to its holder's release (see [`CalleeHandle`]). This keeps
//!   in-flight batches intact; it is a deliberate choice and must not be
//!   changed into immediate disposal.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::RuntimeConfig;
use super::callee::CalleeLoader;
use super::cancel::CancelToken;
use super::error::{CallError, Result};
use super::handle::{CalleeHandle, DiscardOutcome, HandleState};
use super::resolver::CanonicalLocation;
use super::scheduler::CleanupScheduler;

/// Snapshot of one cached handle
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    /// Instance id
    pub id: Uuid,
    /// Canonical location
    pub location: CanonicalLocation,
    /// Lock state
    pub state: HandleState,
    /// Load timestamp
    pub loaded_at: DateTime<Utc>,
    /// Time since last access
    pub idle: Duration,
}

enum Slot {
    Loading,
    Ready(Entry),
}

struct Entry {
    handle: Arc<CalleeHandle>,
    last_access: Instant,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<CanonicalLocation, Slot>,
    closed: bool,
}

struct RegistryInner {
    config: RuntimeConfig,
    loader: Arc<dyn CalleeLoader>,
    scheduler: Arc<dyn CleanupScheduler>,
    slots: Mutex<Slots>,
    loaded: Condvar,
}

/// Process-wide cache of callee handles
#[derive(Clone)]
pub struct HandleRegistry {
    inner: Arc<RegistryInner>,
}

/// Exclusive use of a handle.
///
/// Dropping a lease releases it; [`Lease::release`] does the same explicitly.
pub struct Lease {
    handle: Option<Arc<CalleeHandle>>,
    registry: HandleRegistry,
}

impl HandleRegistry {
    /// Create a registry with the given limits, loader and timer
    pub fn new(
        config: RuntimeConfig,
        loader: Arc<dyn CalleeLoader>,
        scheduler: Arc<dyn CleanupScheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                loader,
                scheduler,
                slots: Mutex::new(Slots::default()),
                loaded: Condvar::new(),
            }),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Return the cached handle for `location`, loading it on a miss.
    pub fn get_or_create(&self, location: &CanonicalLocation) -> Result<Arc<CalleeHandle>> {
        let mut slots = self.inner.slots.lock();
        loop {
            if slots.closed {
                return Err(CallError::RegistryClosed);
            }
            match slots.entries.get_mut(location) {
                Some(Slot::Ready(entry)) => {
                    entry.last_access = Instant::now();
                    let handle = entry.handle.clone();
                    let victims = self.inner.collect_victims(&mut slots);
                    drop(slots);
                    discard_all(victims);
                    return Ok(handle);
                }
                Some(Slot::Loading) => self.inner.loaded.wait(&mut slots),
                None => break,
            }
        }

        slots.entries.insert(location.clone(), Slot::Loading);
        drop(slots);

        debug!(%location, "loading workflow");
        let mut pending = PendingLoad {
            inner: &self.inner,
            location,
            armed: true,
        };
        let loaded = self.inner.loader.load(location);
        pending.armed = false;

        let mut slots = self.inner.slots.lock();
        let (result, mut victims) = match loaded {
            Ok(instance) if slots.closed => {
                slots.entries.remove(location);
                let handle = Arc::new(CalleeHandle::new(location.clone(), instance));
                (Err(CallError::RegistryClosed), vec![handle])
            }
            Ok(instance) => {
                let handle = Arc::new(CalleeHandle::new(location.clone(), instance));
                info!(%location, id = %handle.id(), "loaded workflow");
                slots.entries.insert(
                    location.clone(),
                    Slot::Ready(Entry {
                        handle: handle.clone(),
                        last_access: Instant::now(),
                    }),
                );
                (Ok(handle), Vec::new())
            }
            Err(err) => {
                slots.entries.remove(location);
                (Err(err), Vec::new())
            }
        };
        victims.extend(self.inner.collect_victims(&mut slots));
        drop(slots);
        self.inner.loaded.notify_all();
        discard_all(victims);
        result
    }

    /// Block until the caller holds exclusive use of `handle`.
    ///
    /// Fails with [`CallError::LockInterrupted`] when `cancel` fires while
    /// waiting, and with [`CallError::HandleDisposed`] if the handle was
    /// disposed in the meantime.
    pub fn acquire(&self, handle: &Arc<CalleeHandle>, cancel: &CancelToken) -> Result<Lease> {
        handle.lock(cancel, self.inner.config.lock_poll())?;
        Ok(Lease {
            handle: Some(handle.clone()),
            registry: self.clone(),
        })
    }

    /// Look up (or load) and acquire in one step.
    ///
    /// Retries when the handle is disposed between lookup and acquisition.
    pub fn checkout(&self, location: &CanonicalLocation, cancel: &CancelToken) -> Result<Lease> {
        loop {
            let handle = self.get_or_create(location)?;
            match self.acquire(&handle, cancel) {
                Err(CallError::HandleDisposed(_)) => {
                    debug!(%location, "handle disposed before acquisition, retrying");
                    continue;
                }
                other => return other,
            }
        }
    }

    /// Release exclusive use of a handle.
    pub fn release(&self, lease: Lease) {
        lease.release();
    }

    fn release_handle(&self, handle: &Arc<CalleeHandle>) {
        let disposed = handle.unlock();

        let mut slots = self.inner.slots.lock();
        let same = matches!(
            slots.entries.get(handle.location()),
            Some(Slot::Ready(entry)) if Arc::ptr_eq(&entry.handle, handle)
        );
        if same {
            if disposed {
                slots.entries.remove(handle.location());
            } else if let Some(Slot::Ready(entry)) = slots.entries.get_mut(handle.location()) {
                entry.last_access = Instant::now();
            }
        }
        let victims = self.inner.collect_victims(&mut slots);
        drop(slots);
        discard_all(victims);

        if disposed {
            info!(location = %handle.location(), "disposed workflow after use");
        } else {
            self.schedule_cleanup();
        }
    }

    fn schedule_cleanup(&self) {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(
            self.inner.config.cleanup_delay(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let evicted = HandleRegistry { inner }.evict_idle();
                    debug!(evicted, "cleanup tick");
                }
            }),
        );
    }

    /// Run one eviction pass. Returns the number of entries removed.
    pub fn evict_idle(&self) -> usize {
        let victims = {
            let mut slots = self.inner.slots.lock();
            self.inner.collect_victims(&mut slots)
        };
        let count = victims.len();
        discard_all(victims);
        count
    }

    /// Force-discard every handle located under `scope`, used or not.
    ///
    /// In-use handles are disposed when their holder releases them.
    pub fn cleanup_all(&self, scope: &Path) -> usize {
        let victims: Vec<Arc<CalleeHandle>> = {
            let mut slots = self.inner.slots.lock();
            take_matching(&mut slots, |location| location.is_within(scope))
        };
        let count = victims.len();
        if count > 0 {
            info!(scope = %scope.display(), count, "discarding workflows in scope");
        }
        discard_all(victims);
        count
    }

    /// Discard everything and reject further lookups.
    pub fn shutdown(&self) {
        let victims = {
            let mut slots = self.inner.slots.lock();
            slots.closed = true;
            take_matching(&mut slots, |_| true)
        };
        info!(count = victims.len(), "shutting down handle registry");
        discard_all(victims);
        self.inner.loaded.notify_all();
    }

    /// Number of cached handles
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .entries
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Whether no handle is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a handle for `location` is cached
    pub fn contains(&self, location: &CanonicalLocation) -> bool {
        matches!(
            self.inner.slots.lock().entries.get(location),
            Some(Slot::Ready(_))
        )
    }

    /// Describe every cached handle, least recently used first
    pub fn snapshot(&self) -> Vec<HandleInfo> {
        let now = Instant::now();
        let slots = self.inner.slots.lock();
        let mut infos: Vec<(Instant, HandleInfo)> = slots
            .entries
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(entry) => Some((
                    entry.last_access,
                    HandleInfo {
                        id: entry.handle.id(),
                        location: entry.handle.location().clone(),
                        state: entry.handle.state(),
                        loaded_at: entry.handle.loaded_at(),
                        idle: now.saturating_duration_since(entry.last_access),
                    },
                )),
                Slot::Loading => None,
            })
            .collect();
        infos.sort_by_key(|(last_access, _)| *last_access);
        infos.into_iter().map(|(_, info)| info).collect()
    }
}

impl RegistryInner {
    /// Remove expired and over-capacity entries, returning them for discard.
    fn collect_victims(&self, slots: &mut Slots) -> Vec<Arc<CalleeHandle>> {
        let now = Instant::now();
        let ttl = self.config.idle_ttl();

        let mut victims = take_matching_entries(slots, |entry| {
            now.saturating_duration_since(entry.last_access) > ttl
        });

        let mut ready: Vec<(Instant, CanonicalLocation)> = slots
            .entries
            .iter()
            .filter_map(|(location, slot)| match slot {
                Slot::Ready(entry) => Some((entry.last_access, location.clone())),
                Slot::Loading => None,
            })
            .collect();

        let capacity = self.config.capacity();
        if ready.len() > capacity {
            ready.sort_by_key(|(last_access, _)| *last_access);
            let excess = ready.len() - capacity;
            for (_, location) in ready.into_iter().take(excess) {
                if let Some(Slot::Ready(entry)) = slots.entries.remove(&location) {
                    debug!(%location, "evicting least recently used workflow");
                    victims.push(entry.handle);
                }
            }
        }

        victims
    }
}

/// Clears a `Loading` slot if the loader unwinds, so waiters retry.
struct PendingLoad<'a> {
    inner: &'a RegistryInner,
    location: &'a CanonicalLocation,
    armed: bool,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.inner.slots.lock();
        if matches!(slots.entries.get(self.location), Some(Slot::Loading)) {
            slots.entries.remove(self.location);
        }
        drop(slots);
        warn!(location = %self.location, "workflow loader panicked");
        self.inner.loaded.notify_all();
    }
}

impl Lease {
    /// The held handle
    pub fn handle(&self) -> Option<&Arc<CalleeHandle>> {
        self.handle.as_ref()
    }

    /// Canonical location of the held handle
    pub fn location(&self) -> Option<&CanonicalLocation> {
        self.handle.as_ref().map(|handle| handle.location())
    }

    /// Run `f` against the callee instance.
    pub fn with_callee<R>(
        &self,
        f: impl FnOnce(&mut dyn super::callee::Callee) -> Result<R>,
    ) -> Result<R> {
        match &self.handle {
            Some(handle) => handle.with_instance(f),
            None => Err(CallError::Execution("lease already released".into())),
        }
    }

    /// Give up exclusive use
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.release_handle(&handle);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn take_matching(
    slots: &mut Slots,
    predicate: impl Fn(&CanonicalLocation) -> bool,
) -> Vec<Arc<CalleeHandle>> {
    let keys: Vec<CanonicalLocation> = slots
        .entries
        .iter()
        .filter(|(location, slot)| matches!(slot, Slot::Ready(_)) && predicate(location))
        .map(|(location, _)| location.clone())
        .collect();
    keys.into_iter()
        .filter_map(|location| match slots.entries.remove(&location) {
            Some(Slot::Ready(entry)) => Some(entry.handle),
            _ => None,
        })
        .collect()
}

fn take_matching_entries(
    slots: &mut Slots,
    predicate: impl Fn(&Entry) -> bool,
) -> Vec<Arc<CalleeHandle>> {
    let keys: Vec<CanonicalLocation> = slots
        .entries
        .iter()
        .filter_map(|(location, slot)| match slot {
            Slot::Ready(entry) if predicate(entry) => Some(location.clone()),
            _ => None,
        })
        .collect();
    keys.into_iter()
        .filter_map(|location| match slots.entries.remove(&location) {
            Some(Slot::Ready(entry)) => {
                debug!(%location, "evicting idle workflow");
                Some(entry.handle)
            }
            _ => None,
        })
        .collect()
}

fn discard_all(victims: Vec<Arc<CalleeHandle>>) {
    for handle in victims {
        if handle.discard() == DiscardOutcome::Deferred {
            info!(location = %handle.location(), "workflow evicted while in use, discarding after use");
        }
    }
}
