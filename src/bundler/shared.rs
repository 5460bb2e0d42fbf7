//! One bundler shared by every channel of the driver.
//!
//! When load balancing is configured with global scope, all node channels
//! must learn from and hand out sizes of a single underlying bundler. Each
//! channel holds its own [`SharedDelegatingBundler`], and every call is
//! forwarded to the common [`SharedBundlerState`] under its lock, so feedback
//! from concurrent channels is serialized and never lost.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::state::BundlerState;
use super::types::{BundlerId, NodeCapabilityInfo};
use super::{Algorithm, Bundler, NodeAwareBundler};

/// The single bundler behind a set of [`SharedDelegatingBundler`]s.
pub struct SharedBundlerState {
    inner: Mutex<Box<dyn Bundler>>,
}

impl SharedBundlerState {
    pub fn new(inner: Box<dyn Bundler>) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Id of the underlying bundler.
    pub fn inner_id(&self) -> BundlerId {
        self.inner.lock().id()
    }

    /// Run `f` against the underlying bundler while holding the lock.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut dyn Bundler) -> R) -> R {
        let mut guard = self.inner.lock();
        f(guard.as_mut())
    }
}

impl std::fmt::Debug for SharedBundlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("SharedBundlerState");
        match self.inner.try_lock() {
            Some(inner) => d.field("inner", &*inner),
            None => d.field("inner", &"<locked>"),
        };
        d.finish()
    }
}

/// Per-channel handle forwarding to a shared bundler.
///
/// `copy()` returns another handle on the same state: the copies are coupled,
/// feedback through one is visible in the sizes of all.
#[derive(Debug)]
pub struct SharedDelegatingBundler {
    id: BundlerId,
    state: Arc<SharedBundlerState>,
}

impl SharedDelegatingBundler {
    pub fn new(state: Arc<SharedBundlerState>) -> Self {
        Self {
            id: BundlerId::next(),
            state,
        }
    }

    pub fn state(&self) -> &Arc<SharedBundlerState> {
        &self.state
    }
}

impl Bundler for SharedDelegatingBundler {
    fn id(&self) -> BundlerId {
        self.id
    }

    fn algorithm(&self) -> Algorithm {
        self.state.with_inner(|b| b.algorithm())
    }

    fn size(&self) -> usize {
        self.state.with_inner(|b| b.size())
    }

    fn feedback(&mut self, size: usize, elapsed: Duration) {
        self.state.with_inner(|b| b.feedback(size, elapsed));
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::new(Arc::clone(&self.state)))
    }

    fn max_size(&self) -> usize {
        self.state.with_inner(|b| b.max_size())
    }

    /// Retires this handle only. The shared bundler lives as long as any
    /// handle or its owner keeps the state alive.
    fn dispose(&mut self) {
        debug!(bundler = %self.id, "shared bundler handle disposed");
    }

    fn as_node_aware(&mut self) -> Option<&mut dyn NodeAwareBundler> {
        Some(self)
    }

    fn snapshot(&self) -> Option<BundlerState> {
        self.state.with_inner(|b| b.snapshot())
    }

    fn restore(&mut self, state: BundlerState) -> bool {
        self.state.with_inner(|b| b.restore(state))
    }
}

impl NodeAwareBundler for SharedDelegatingBundler {
    /// Forwarded when the shared bundler is itself node-aware.
    fn set_node_capability(&mut self, info: NodeCapabilityInfo) {
        self.state.with_inner(|b| {
            if let Some(aware) = b.as_node_aware() {
                aware.set_node_capability(info);
            }
        });
    }
}
