//! Runtime service and public API
//!
//! [`CallRuntime`] owns the process-wide [`HandleRegistry`] and exposes the
//! high-level operations: describe a callee, invoke it over a table, and tear
//! down cached handles. Create one per process and share it by reference
//! (or `Arc`) with every caller.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// Submodules
pub mod backend;
pub mod callee;
pub mod cancel;
pub mod error;
pub mod handle;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod storage;

use crate::invoker::{BatchResult, CallSettings, DataTable, ProgressListener, RowInvoker};
use backend::{InvocationBackend, LocalBackend};
use callee::{CalleeLoader, CalleeSignature};
use cancel::CancelToken;
use error::{CallError, Result};
use registry::HandleRegistry;
use resolver::{CanonicalLocation, ResolveContext};
use scheduler::CleanupScheduler;

/// Default maximum number of cached handles
pub const DEFAULT_CACHE_CAPACITY: usize = 5;
/// Default idle time before a cached handle expires
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60);
/// Default delay of the cleanup tick scheduled after a release
pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_secs(65);
/// Default interval for re-checking cancellation while waiting for a lock
pub const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(25);

/// Configuration for the callflow runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of cached handles (at least 1)
    pub cache_capacity: usize,

    /// Idle time in milliseconds after which a cached handle expires
    pub idle_ttl_ms: u64,

    /// Delay in milliseconds of the cleanup tick scheduled after each release
    pub cleanup_delay_ms: u64,

    /// How often a blocked lock wait re-checks cancellation, in milliseconds
    pub lock_poll_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            idle_ttl_ms: DEFAULT_IDLE_TTL.as_millis() as u64,
            cleanup_delay_ms: DEFAULT_CLEANUP_DELAY.as_millis() as u64,
            lock_poll_ms: DEFAULT_LOCK_POLL.as_millis() as u64,
        }
    }
}

impl RuntimeConfig {
    /// Set the cache capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the idle expiry
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the cleanup tick delay
    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the lock wait poll interval
    pub fn with_lock_poll(mut self, poll: Duration) -> Self {
        self.lock_poll_ms = poll.as_millis() as u64;
        self
    }

    /// Apply `CALLFLOW_CACHE_CAPACITY`, `CALLFLOW_IDLE_TTL_MS` and
    /// `CALLFLOW_CLEANUP_DELAY_MS` when set to valid numbers
    pub fn with_env_overrides(mut self) -> Self {
        fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key)
                .ok()
                .and_then(|value| value.trim().parse::<T>().ok())
        }

        if let Some(capacity) = env_number("CALLFLOW_CACHE_CAPACITY") {
            self.cache_capacity = capacity;
        }
        if let Some(ttl) = env_number("CALLFLOW_IDLE_TTL_MS") {
            self.idle_ttl_ms = ttl;
        }
        if let Some(delay) = env_number("CALLFLOW_CLEANUP_DELAY_MS") {
            self.cleanup_delay_ms = delay;
        }
        self
    }

    /// Effective capacity
    pub fn capacity(&self) -> usize {
        self.cache_capacity.max(1)
    }

    /// Idle expiry as a duration
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    /// Cleanup tick delay as a duration
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    /// Lock poll interval as a duration (at least 1ms)
    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }
}

/// Process-wide service that owns the handle registry
pub struct CallRuntime {
    registry: HandleRegistry,
}

impl CallRuntime {
    /// Create a runtime with the given configuration, loader and timer
    pub fn new(
        config: RuntimeConfig,
        loader: Arc<dyn CalleeLoader>,
        scheduler: Arc<dyn CleanupScheduler>,
    ) -> Self {
        info!(
            capacity = config.capacity(),
            idle_ttl_ms = config.idle_ttl_ms,
            "starting callflow runtime"
        );
        Self {
            registry: HandleRegistry::new(config, loader, scheduler),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &RuntimeConfig {
        self.registry.config()
    }

    /// The shared handle registry
    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Resolve `workflow` and wait for exclusive use of its handle
    pub fn open(
        &self,
        workflow: &str,
        context: &ResolveContext,
        cancel: &CancelToken,
    ) -> Result<LocalBackend> {
        let location = resolver::resolve(workflow, context)?;
        LocalBackend::open(&self.registry, &location, cancel)
    }

    /// Declared parameters of the callee at `workflow`
    pub fn describe(
        &self,
        workflow: &str,
        context: &ResolveContext,
        cancel: &CancelToken,
    ) -> Result<CalleeSignature> {
        let backend = Box::new(self.open(workflow, context, cancel)?);
        let signature = backend.signature();
        backend.release()?;
        signature
    }

    /// Invoke the configured callee once per row of `input`.
    ///
    /// Resolution, loading, lock acquisition and binding validation errors
    /// abort the call; row-level failures end up in the Status column.
    pub fn invoke(
        &self,
        settings: &CallSettings,
        context: &ResolveContext,
        input: &DataTable,
        cancel: &CancelToken,
        progress: &dyn ProgressListener,
    ) -> Result<BatchResult> {
        let backend = Box::new(self.open(&settings.workflow, context, cancel)?);
        let signature = backend.signature()?;
        let invoker = RowInvoker::configure(
            backend.location().display_name(),
            settings.binding.clone(),
            &input.spec,
            &signature,
        )?;
        invoker.run(backend, input, cancel, progress)
    }

    /// Run [`CallRuntime::invoke`] on tokio's blocking pool.
    ///
    /// The batch blocks a thread for its whole duration, and callees may
    /// themselves invoke callees; keeping it off the async workers prevents
    /// nested invocations from starving the pool.
    pub async fn invoke_detached(
        self: Arc<Self>,
        settings: CallSettings,
        context: ResolveContext,
        input: DataTable,
        cancel: CancelToken,
        progress: Arc<dyn ProgressListener>,
    ) -> Result<BatchResult> {
        tokio::task::spawn_blocking(move || {
            self.invoke(&settings, &context, &input, &cancel, progress.as_ref())
        })
        .await
        .map_err(|err| CallError::Execution(format!("invocation task failed: {err}")))?
    }

    /// Force-discard cached handles under `scope` (owner teardown)
    pub fn cleanup_all(&self, scope: &Path) -> usize {
        self.registry.cleanup_all(scope)
    }

    /// Whether a handle for `location` is cached
    pub fn is_cached(&self, location: &CanonicalLocation) -> bool {
        self.registry.contains(location)
    }

    /// Discard every handle and stop accepting lookups
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}
