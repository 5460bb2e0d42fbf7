//! Adaptive bundle sizing strategies.
//!
//! A [`Bundler`] decides how many tasks the dispatcher hands to one channel
//! in a single round-trip, and learns from the `(size, elapsed)` outcome of
//! each bundle.
//!
//! # Dispatch loop
//!
//! ```ignore
//! let mut bundler = factory.new_bundler();
//! loop {
//!     let n = bundler.size();
//!     let tasks = queue.take(n);
//!     let start = Instant::now();
//!     let done = channel.execute(tasks).await;
//!     bundler.feedback(done, start.elapsed());
//! }
//! bundler.dispose();
//! ```
//!
//! # Strategies
//!
//! | Algorithm | Type | Learns |
//! |-----------|------|--------|
//! | `manual` | [`FixedSizeBundler`] | no |
//! | `nodethreads` | [`StaticCapacityBundler`] | no, node capability only |
//! | `proportional` | [`ProportionalFairBundler`] | yes, across channels |
//! | `autotuned` | [`AnnealingSearchBundler`] | yes, randomized local search |
//! | `rl` | [`BanditAdjustBundler`] | yes, softmax bandit |
//!
//! Any of them can be shared by a whole fleet through
//! [`SharedDelegatingBundler`].

mod annealing;
mod bandit;
mod capacity;
mod fixed;
mod profile;
mod proportional;
mod shared;
mod state;
mod types;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BundlerError;

pub use annealing::AnnealingSearchBundler;
pub use bandit::{BanditAction, BanditAdjustBundler};
pub use capacity::StaticCapacityBundler;
pub use fixed::FixedSizeBundler;
pub use profile::TuningProfile;
pub use proportional::{ProportionalFairBundler, ProportionalGroup};
pub use shared::{SharedBundlerState, SharedDelegatingBundler};
pub use state::{AnnealingState, BanditState, BundlerState, ConvergedState, ProportionalState};
pub use types::{
    BundlerContext, BundlerId, FixedCeiling, NodeCapabilityInfo, PerformanceSample,
    QueueCeiling, SampleWindow, SharedCeiling, UNBOUNDED_SIZE,
};

/// Load-balancing algorithm names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Fixed bundle size
    Manual,
    /// Bundle size from the node's thread count
    #[serde(rename = "nodethreads")]
    NodeThreads,
    /// Proportional-fair split of the queue across channels
    #[default]
    Proportional,
    /// Annealing-style search for the fastest size
    Autotuned,
    /// Reinforcement-learning bandit
    Rl,
}

impl Algorithm {
    /// All algorithms, in name order.
    pub const ALL: [Algorithm; 5] = [
        Algorithm::Autotuned,
        Algorithm::Manual,
        Algorithm::NodeThreads,
        Algorithm::Proportional,
        Algorithm::Rl,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Manual => "manual",
            Algorithm::NodeThreads => "nodethreads",
            Algorithm::Proportional => "proportional",
            Algorithm::Autotuned => "autotuned",
            Algorithm::Rl => "rl",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = BundlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BundlerError::UnknownAlgorithm(s.to_string()))
    }
}

/// Strategy deciding the bundle size of one channel (or one fleet).
///
/// `size()` is a pure read. `feedback()` mutates state and the next `size()`
/// reflects the update. Neither ever fails: invalid feedback is ignored and
/// degenerate state falls back to a size of 1. Returned sizes are always in
/// `[1, max_size()]`.
pub trait Bundler: Send + fmt::Debug {
    /// Instance sequence number, for diagnostics.
    fn id(&self) -> BundlerId;

    /// The algorithm implemented by this bundler.
    fn algorithm(&self) -> Algorithm;

    /// Number of tasks to put in the next bundle.
    fn size(&self) -> usize;

    /// Record that `size` tasks completed in `elapsed` wall-clock time.
    ///
    /// A `size` of 0 (e.g. a bundle cancelled before any task ran) is ignored.
    fn feedback(&mut self, size: usize, elapsed: Duration);

    /// Like [`feedback`](Bundler::feedback), from raw counters.
    ///
    /// Non-positive sizes and negative times are ignored.
    fn feedback_raw(&mut self, size: i64, elapsed_nanos: i64) {
        if size <= 0 || elapsed_nanos < 0 {
            tracing::trace!(bundler = %self.id(), size, elapsed_nanos, "ignoring invalid feedback");
            return;
        }
        self.feedback(size as usize, Duration::from_nanos(elapsed_nanos as u64));
    }

    /// A new instance with the same profile and its own mutable state.
    fn copy(&self) -> Box<dyn Bundler>;

    /// Driver-wide upper bound on bundle size.
    fn max_size(&self) -> usize;

    /// Release resources held for this channel. The instance must not be
    /// used afterwards. Calling it twice is harmless.
    fn dispose(&mut self) {}

    /// Access to the node capability setter, for strategies that use it.
    fn as_node_aware(&mut self) -> Option<&mut dyn NodeAwareBundler> {
        None
    }

    /// Learned state worth keeping across reconnections. `None` for
    /// strategies that learn nothing.
    fn snapshot(&self) -> Option<BundlerState> {
        None
    }

    /// Resume from a snapshot taken by the same algorithm.
    ///
    /// Returns `false`, leaving the bundler untouched, if the state belongs
    /// to another algorithm.
    fn restore(&mut self, _state: BundlerState) -> bool {
        false
    }
}

/// A bundler that consumes node-reported capabilities.
pub trait NodeAwareBundler {
    /// Push the node's capabilities once they become known.
    fn set_node_capability(&mut self, info: NodeCapabilityInfo);
}
