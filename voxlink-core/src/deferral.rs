//! Deferred completions and the id-keyed registry that correlates them.
//!
//! `Deferred<T>` is a resolve-or-reject-once cell. Any number of tasks may
//! `wait()` on clones of the same handle; they all observe the same outcome.
//!
//! `DeferralMap<T>` holds one pending `Deferred` per request id so replies
//! arriving on a shared connection can be routed back to the call that issued
//! them.
//!
//! ## Resolution failures
//!
//! `DeferralMap::complete` removes the entry *before* resolving it, so an id
//! can never fire twice. If the resolution itself fails (the handle was already
//! settled elsewhere) the failure is turned into a rejection of that same
//! handle instead of being returned to the caller of `complete`. Since the
//! handle is already settled that rejection is a no-op in practice; the
//! behaviour is kept as-is pending a product decision on whether it should
//! propagate instead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Result, VoxlinkError};

struct DeferredInner<T> {
    outcome: Mutex<Option<std::result::Result<T, String>>>,
    notify: Notify,
}

/// A completion handle settled exactly once.
pub struct Deferred<T> {
    inner: Arc<DeferredInner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeferredInner {
                outcome: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Settle successfully.
    ///
    /// # Errors
    /// `VoxlinkError::InvalidState` if the handle was already settled.
    pub fn resolve(&self, value: T) -> Result<()> {
        self.settle(Ok(value))
    }

    /// Settle with a failure reason.
    ///
    /// # Errors
    /// `VoxlinkError::InvalidState` if the handle was already settled.
    pub fn reject(&self, reason: impl Into<String>) -> Result<()> {
        self.settle(Err(reason.into()))
    }

    pub fn is_settled(&self) -> bool {
        self.inner.outcome.lock().is_some()
    }

    fn settle(&self, outcome: std::result::Result<T, String>) -> Result<()> {
        {
            let mut slot = self.inner.outcome.lock();
            if slot.is_some() {
                return Err(VoxlinkError::InvalidState(
                    "deferred already settled".into(),
                ));
            }
            *slot = Some(outcome);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

impl<T: Clone> Deferred<T> {
    /// Wait for the outcome. Returns immediately if already settled.
    ///
    /// # Errors
    /// `VoxlinkError::Rejected` carrying the rejection reason.
    pub async fn wait(&self) -> Result<T> {
        loop {
            // Register interest before checking so a concurrent settle is not missed.
            let notified = self.inner.notify.notified();
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Non-blocking peek at the outcome.
    pub fn try_outcome(&self) -> Option<Result<T>> {
        self.inner
            .outcome
            .lock()
            .clone()
            .map(|o| o.map_err(VoxlinkError::Rejected))
    }
}

/// Registry of pending completions keyed by request id.
pub struct DeferralMap<T> {
    pending: Mutex<HashMap<String, Deferred<T>>>,
}

impl<T> Default for DeferralMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferralMap<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending completion. An existing entry under `id` is replaced.
    pub fn add(&self, id: impl Into<String>, handle: Deferred<T>) {
        let id = id.into();
        if self.pending.lock().insert(id.clone(), handle).is_some() {
            warn!(id = id.as_str(), "replaced a deferral that was still pending");
        }
    }

    /// Resolve and remove the entry for `id`. Unknown ids are ignored.
    pub fn complete(&self, id: &str, result: T) {
        let Some(handle) = self.pending.lock().remove(id) else {
            debug!(id, "complete for unknown deferral id");
            return;
        };
        if let Err(e) = handle.resolve(result) {
            let _ = handle.reject(e.to_string());
        }
    }

    /// Reject and remove the entry for `id`. Unknown ids are ignored.
    pub fn reject(&self, id: &str, reason: impl Into<String>) {
        if let Some(handle) = self.pending.lock().remove(id) {
            let _ = handle.reject(reason);
        }
    }

    /// Reject every pending entry and clear the map.
    pub fn reject_all(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (id, handle) in drained {
            debug!(id = id.as_str(), reason, "rejecting pending deferral");
            let _ = handle.reject(reason);
        }
    }

    /// Lookup without side effects. `None` for unknown or completed ids.
    pub fn get(&self, id: &str) -> Option<Deferred<T>> {
        self.pending.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
