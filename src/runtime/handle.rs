//! Callee handles and their exclusive-use state machine
//!
//! A handle wraps one loaded callee instance. Its lifecycle is an explicit
//! atomic state machine:
//!
//! ```text
//!   FREE ──lock──▶ LOCKED ──unlock──▶ FREE
//!    │               │
//!    │ discard       │ discard
//!    ▼               ▼
//! DISPOSED ◀─unlock─ LOCKED_PENDING_DISCARD
//! ```
//!
//! A discard against a locked handle only marks it; the instance is disposed
//! by the holder's unlock. Disposal of an in-use instance therefore never
//! happens, even when the registry evicts the handle mid-batch.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::callee::Callee;
use super::cancel::CancelToken;
use super::error::{CallError, Result};
use super::resolver::CanonicalLocation;

const FREE: u8 = 0;
const LOCKED: u8 = 1;
const LOCKED_PENDING_DISCARD: u8 = 2;
const DISPOSED: u8 = 3;

/// Observable handle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleState {
    /// Cached and unused
    Free,
    /// Held by a caller
    Locked,
    /// Held by a caller; disposed on release
    LockedPendingDiscard,
    /// Instance released
    Disposed,
}

impl HandleState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            FREE => HandleState::Free,
            LOCKED => HandleState::Locked,
            LOCKED_PENDING_DISCARD => HandleState::LockedPendingDiscard,
            _ => HandleState::Disposed,
        }
    }
}

/// Result of a discard request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardOutcome {
    /// Instance disposed right away
    Disposed,
    /// Handle in use; disposal happens on release
    Deferred,
    /// Nothing to do
    AlreadyDisposed,
}

/// Cached wrapper around a loaded callee plus its exclusive-use lock
pub struct CalleeHandle {
    id: Uuid,
    location: CanonicalLocation,
    loaded_at: DateTime<Utc>,
    state: AtomicU8,
    instance: Mutex<Option<Box<dyn Callee>>>,
    gate: Mutex<()>,
    wake: Condvar,
}

impl CalleeHandle {
    /// Wrap a freshly loaded instance in the `FREE` state
    pub fn new(location: CanonicalLocation, instance: Box<dyn Callee>) -> Self {
        Self {
            id: Uuid::new_v4(),
            location,
            loaded_at: Utc::now(),
            state: AtomicU8::new(FREE),
            instance: Mutex::new(Some(instance)),
            gate: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Unique id of this instance (a reload gets a new id)
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Canonical location this handle was loaded from
    pub fn location(&self) -> &CanonicalLocation {
        &self.location
    }

    /// Load timestamp
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Current state
    pub fn state(&self) -> HandleState {
        HandleState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Whether someone holds the lock
    pub fn is_locked(&self) -> bool {
        matches!(
            self.state(),
            HandleState::Locked | HandleState::LockedPendingDiscard
        )
    }

    /// Block until the caller holds exclusive use.
    ///
    /// Cancellation is re-checked every `poll` while waiting.
    pub(crate) fn lock(&self, cancel: &CancelToken, poll: Duration) -> Result<()> {
        loop {
            match self
                .state
                .compare_exchange(FREE, LOCKED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(DISPOSED) => return Err(CallError::HandleDisposed(self.location.to_string())),
                Err(_) => {}
            }

            if cancel.is_cancelled() {
                debug!(location = %self.location, "lock wait interrupted");
                return Err(CallError::LockInterrupted {
                    location: self.location.to_string(),
                });
            }

            let mut gate = self.gate.lock();
            // Unlock notifies under the gate, so a state read here cannot miss it.
            let raw = self.state.load(Ordering::Acquire);
            if raw == LOCKED || raw == LOCKED_PENDING_DISCARD {
                self.wake.wait_for(&mut gate, poll);
            }
        }
    }

    /// Give up exclusive use. Returns `true` if this disposed the instance.
    pub(crate) fn unlock(&self) -> bool {
        let disposed = loop {
            let raw = self.state.load(Ordering::Acquire);
            let (next, disposing) = match raw {
                LOCKED => (FREE, false),
                LOCKED_PENDING_DISCARD => (DISPOSED, true),
                _ => break false,
            };
            if self
                .state
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break disposing;
            }
        };

        if disposed {
            self.dispose_instance();
        }
        self.notify_waiters();
        disposed
    }

    /// Dispose now if unused, otherwise mark for disposal on release.
    pub(crate) fn discard(&self) -> DiscardOutcome {
        loop {
            let raw = self.state.load(Ordering::Acquire);
            let (next, outcome) = match raw {
                FREE => (DISPOSED, DiscardOutcome::Disposed),
                LOCKED => (LOCKED_PENDING_DISCARD, DiscardOutcome::Deferred),
                LOCKED_PENDING_DISCARD => return DiscardOutcome::Deferred,
                _ => return DiscardOutcome::AlreadyDisposed,
            };
            if self
                .state
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if outcome == DiscardOutcome::Disposed {
                    self.dispose_instance();
                    self.notify_waiters();
                } else {
                    debug!(location = %self.location, "handle in use, disposal deferred to release");
                }
                return outcome;
            }
        }
    }

    /// Run `f` against the instance. Only the lock holder may call this.
    pub(crate) fn with_instance<R>(&self, f: impl FnOnce(&mut dyn Callee) -> Result<R>) -> Result<R> {
        let mut slot = self.instance.lock();
        match slot.as_deref_mut() {
            Some(instance) => f(instance),
            None => Err(CallError::HandleDisposed(self.location.to_string())),
        }
    }

    fn dispose_instance(&self) {
        if let Some(mut instance) = self.instance.lock().take() {
            instance.cancel();
            instance.dispose();
            debug!(location = %self.location, id = %self.id, "disposed workflow handle");
        }
    }

    fn notify_waiters(&self) {
        let _gate = self.gate.lock();
        self.wake.notify_all();
    }
}

impl std::fmt::Debug for CalleeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalleeHandle")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state())
            .finish()
    }
}
