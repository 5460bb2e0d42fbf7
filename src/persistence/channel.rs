//! Bundler wrapper that resumes from and saves to a state store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{LoadBalancerPersistence, StateKey};
use crate::bundler::{Algorithm, Bundler, BundlerId, BundlerState, NodeAwareBundler, NodeCapabilityInfo};
use crate::error::Result;
use crate::metrics::BundlerMetrics;

/// A channel's bundler bound to a [`StateKey`] in a store.
///
/// The learned state is stored when the channel is disposed (or dropped).
/// Load and store failures are logged and counted, never propagated: the
/// dispatch loop keeps running on a cold bundler.
pub struct PersistentBundler {
    inner: Box<dyn Bundler>,
    key: StateKey,
    store: Arc<dyn LoadBalancerPersistence>,
    metrics: BundlerMetrics,
    disposed: bool,
}

impl PersistentBundler {
    pub fn new(
        inner: Box<dyn Bundler>,
        key: StateKey,
        store: Arc<dyn LoadBalancerPersistence>,
        metrics: BundlerMetrics,
    ) -> Self {
        Self {
            inner,
            key,
            store,
            metrics,
            disposed: false,
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Resume the wrapped bundler from the stored state, if any.
    pub fn load(&mut self) -> bool {
        restore_from(self.inner.as_mut(), &self.key, self.store.as_ref(), &self.metrics)
    }

    /// Store the current state now. Returns `false` for strategies with
    /// nothing to store.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn save(&self) -> Result<bool> {
        let Some(state) = self.inner.snapshot() else {
            return Ok(false);
        };
        self.store.store(&self.key, &state)?;
        self.metrics.record_state_stored();
        Ok(true)
    }
}

/// Restore `bundler` from the state stored under `key`.
pub(crate) fn restore_from(
    bundler: &mut dyn Bundler,
    key: &StateKey,
    store: &dyn LoadBalancerPersistence,
    metrics: &BundlerMetrics,
) -> bool {
    match store.load(key) {
        Ok(Some(state)) => {
            let stored = state.algorithm();
            if bundler.restore(state) {
                metrics.record_state_restored();
                info!(%key, bundler = %bundler.id(), algorithm = %stored, "bundler state restored");
                true
            } else {
                warn!(%key, stored = %stored, expected = %bundler.algorithm(), "stored state belongs to another algorithm");
                false
            }
        }
        Ok(None) => false,
        Err(e) => {
            metrics.record_persistence_error();
            warn!(%key, error = %e, "failed to load bundler state");
            false
        }
    }
}

impl std::fmt::Debug for PersistentBundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentBundler")
            .field("key", &self.key)
            .field("inner", &self.inner)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Bundler for PersistentBundler {
    fn id(&self) -> BundlerId {
        self.inner.id()
    }

    fn algorithm(&self) -> Algorithm {
        self.inner.algorithm()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn feedback(&mut self, size: usize, elapsed: Duration) {
        self.inner.feedback(size, elapsed);
    }

    /// The copy is not bound to this channel's key.
    fn copy(&self) -> Box<dyn Bundler> {
        self.inner.copy()
    }

    fn max_size(&self) -> usize {
        self.inner.max_size()
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        // Snapshot before the inner bundler releases its channel state
        match self.save() {
            Ok(stored) => debug!(key = %self.key, stored, "channel state saved on dispose"),
            Err(e) => {
                self.metrics.record_persistence_error();
                warn!(key = %self.key, error = %e, "failed to store bundler state");
            }
        }
        self.inner.dispose();
    }

    fn as_node_aware(&mut self) -> Option<&mut dyn NodeAwareBundler> {
        if self.inner.as_node_aware().is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn snapshot(&self) -> Option<BundlerState> {
        self.inner.snapshot()
    }

    fn restore(&mut self, state: BundlerState) -> bool {
        self.inner.restore(state)
    }
}

impl NodeAwareBundler for PersistentBundler {
    fn set_node_capability(&mut self, info: NodeCapabilityInfo) {
        if let Some(aware) = self.inner.as_node_aware() {
            aware.set_node_capability(info);
        }
    }
}

impl Drop for PersistentBundler {
    fn drop(&mut self) {
        self.dispose();
    }
}
