//! Persistence of learned bundler state across channel reconnections.
//!
//! When a channel goes away its bundler's [`BundlerState`] is written to a
//! [`LoadBalancerPersistence`] store, keyed by the channel identifier and a
//! hash of the algorithm name. A channel reconnecting under the same
//! identifier and algorithm resumes from that state instead of starting the
//! search over.
//!
//! ```ignore
//! let factory = BundlerFactoryBuilder::new()
//!     .algorithm(Algorithm::Autotuned)
//!     .persistence_dir("/var/lib/driver/lb_persistence")
//!     .build(ceiling)?;
//!
//! let mut bundler = factory.new_channel_bundler(&node_uuid);
//! // ... dispatch loop ...
//! bundler.dispose(); // state stored here
//! ```

mod channel;
mod file;

use std::fmt;

use sha2::{Digest, Sha256};

use crate::bundler::{Algorithm, BundlerState};
use crate::error::Result;

pub(crate) use channel::restore_from;
pub use channel::PersistentBundler;
pub use file::FileLoadBalancerPersistence;

/// Channel identifier under which a globally scoped bundler is stored.
pub const GLOBAL_CHANNEL: &str = "_global";

/// Where one bundler state lives in a store.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StateKey {
    /// Identifier of the channel, stable across reconnections
    pub channel: String,
    /// [`algorithm_hash`] of the bundler's algorithm
    pub algorithm: String,
}

impl StateKey {
    pub fn new(channel: impl Into<String>, algorithm: Algorithm) -> Self {
        Self {
            channel: channel.into(),
            algorithm: algorithm_hash(algorithm),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.algorithm)
    }
}

/// Hex SHA-256 of the algorithm name, the algorithm part of a [`StateKey`].
pub fn algorithm_hash(algorithm: Algorithm) -> String {
    hex::encode(Sha256::digest(algorithm.name().as_bytes()))
}

/// Store of bundler states.
///
/// Implementations must be safe to call from any channel's thread.
pub trait LoadBalancerPersistence: Send + Sync + fmt::Debug {
    /// State stored under `key`, `None` if there is none.
    fn load(&self, key: &StateKey) -> Result<Option<BundlerState>>;

    /// Store `state` under `key`, replacing any previous state.
    fn store(&self, key: &StateKey, state: &BundlerState) -> Result<()>;

    /// Delete stored states. `None` matches any channel or any algorithm,
    /// so `delete(None, None)` clears the store.
    fn delete(&self, channel: Option<&str>, algorithm: Option<&str>) -> Result<()>;

    /// Channels with at least one stored state.
    fn list_channels(&self) -> Result<Vec<String>>;

    /// Algorithm hashes with a stored state for `channel`.
    fn list_algorithms(&self, channel: &str) -> Result<Vec<String>>;
}
