//! Core types shared by every bundler strategy.
//!
//! - `BundlerId`: process-unique instance number for log correlation
//! - `PerformanceSample`: weighted running mean of per-task execution time
//! - `SampleWindow`: bounded moving window of recent outcomes
//! - `NodeCapabilityInfo`: node-reported parallelism
//! - `QueueCeiling`: the externally supplied bundle size bound
//! - `BundlerContext`: bookkeeping composed into each strategy

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metrics::BundlerMetrics;

/// Size returned by `max_size()` when the queue ceiling is unbounded.
pub const UNBOUNDED_SIZE: usize = i32::MAX as usize;

static NEXT_BUNDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique sequence number of a bundler instance.
///
/// Only used for diagnostics and as the channel key of proportional groups.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BundlerId(pub u64);

impl BundlerId {
    /// Allocate the next id.
    pub fn next() -> Self {
        BundlerId(NEXT_BUNDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BundlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Weighted running mean of execution time for one bundle size.
///
/// `sample_count` accumulates tasks, not feedback calls, so a bundle of 10
/// tasks weighs ten times as much as a bundle of one. `mean_time` is therefore
/// a per-task time in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Mean execution time per task (nanoseconds)
    pub mean_time: f64,
    /// Accumulated number of tasks observed
    pub sample_count: u64,
}

impl PerformanceSample {
    /// Fold one `(elapsed, bundle_size)` outcome into the mean.
    pub fn record(&mut self, elapsed_ns: f64, bundle_size: usize) {
        if bundle_size == 0 {
            return;
        }
        let total = self.sample_count + bundle_size as u64;
        self.mean_time = (elapsed_ns + self.sample_count as f64 * self.mean_time) / total as f64;
        self.sample_count = total;
    }
}

/// Bounded memory of the most recent outcomes of one channel.
///
/// The bound is a task weight: once the summed bundle sizes exceed
/// `capacity`, the oldest contributions are dropped. The newest contribution
/// is always kept, however large.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleWindow {
    samples: VecDeque<(f64, usize)>,
    total_time: f64,
    total_size: usize,
    capacity: usize,
    previous_mean: f64,
}

impl SampleWindow {
    /// Create an empty window bounded to `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            total_time: 0.0,
            total_size: 0,
            capacity: capacity.max(1),
            previous_mean: 0.0,
        }
    }

    /// Add an outcome and evict the oldest ones past the bound.
    pub fn add(&mut self, elapsed_ns: f64, bundle_size: usize) {
        if bundle_size == 0 {
            return;
        }
        self.previous_mean = self.mean();
        self.samples.push_back((elapsed_ns, bundle_size));
        self.total_time += elapsed_ns;
        self.total_size += bundle_size;
        self.evict();
    }

    /// Change the bound, evicting as needed. Used when a restored window
    /// meets a profile with a different threshold.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict();
    }

    fn evict(&mut self) {
        while self.total_size > self.capacity && self.samples.len() > 1 {
            if let Some((time, size)) = self.samples.pop_front() {
                self.total_time -= time;
                self.total_size -= size;
            }
        }
    }

    /// Mean time per task over the window, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.total_time / self.total_size as f64
        }
    }

    /// Mean before the most recent `add()`.
    pub fn previous_mean(&self) -> f64 {
        self.previous_mean
    }

    /// Number of tasks currently in the window.
    pub fn weight(&self) -> usize {
        self.total_size
    }

    /// Average bundle size of the outcomes in the window, 0 when empty.
    pub fn mean_bundle_size(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.total_size as f64 / self.samples.len() as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Parallelism reported by a node once its system information is known.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilityInfo {
    /// Number of processing threads available on the node
    pub available_threads: i32,
}

impl NodeCapabilityInfo {
    pub fn new(available_threads: i32) -> Self {
        Self { available_threads }
    }

    /// Thread count as a usable size, at least 1.
    pub fn threads_or_one(&self) -> usize {
        if self.available_threads > 0 {
            self.available_threads as usize
        } else {
            1
        }
    }
}

/// Source of the driver-wide bundle size bound.
///
/// Supplied by the dispatcher, typically from the current job queue's
/// configured maximum bundle size.
pub trait QueueCeiling: Send + Sync {
    /// Maximum size of one bundle, 0 when unbounded.
    fn current_ceiling(&self) -> usize;

    /// Total number of tasks waiting to be dispatched, `None` when the
    /// dispatcher does not track it.
    ///
    /// Used as the budget that proportional bundlers split across channels.
    /// Unrelated to the ceiling: a queue can be unbounded per bundle and
    /// still hold a known number of tasks.
    fn outstanding_tasks(&self) -> Option<usize> {
        None
    }
}

/// A ceiling that never changes. The outstanding task count is unknown.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedCeiling(pub usize);

impl QueueCeiling for FixedCeiling {
    fn current_ceiling(&self) -> usize {
        self.0
    }
}

/// A ceiling and outstanding task count the dispatcher updates as the
/// queue changes.
#[derive(Debug, Default)]
pub struct SharedCeiling {
    ceiling: AtomicUsize,
    outstanding: AtomicUsize,
}

impl SharedCeiling {
    pub fn new(ceiling: usize, outstanding: usize) -> Self {
        Self {
            ceiling: AtomicUsize::new(ceiling),
            outstanding: AtomicUsize::new(outstanding),
        }
    }

    pub fn set_ceiling(&self, ceiling: usize) {
        self.ceiling.store(ceiling, Ordering::Relaxed);
    }

    pub fn set_outstanding(&self, outstanding: usize) {
        self.outstanding.store(outstanding, Ordering::Relaxed);
    }
}

impl QueueCeiling for SharedCeiling {
    fn current_ceiling(&self) -> usize {
        self.ceiling.load(Ordering::Relaxed)
    }

    fn outstanding_tasks(&self) -> Option<usize> {
        Some(self.outstanding.load(Ordering::Relaxed))
    }
}

impl<F> QueueCeiling for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn current_ceiling(&self) -> usize {
        self()
    }
}

/// Per-instance bookkeeping composed into every strategy.
#[derive(Clone)]
pub struct BundlerContext {
    id: BundlerId,
    ceiling: Arc<dyn QueueCeiling>,
    metrics: BundlerMetrics,
}

impl BundlerContext {
    /// Create a context with a fresh id and standalone metrics.
    pub fn new(ceiling: Arc<dyn QueueCeiling>) -> Self {
        Self::with_metrics(ceiling, BundlerMetrics::new())
    }

    /// Create a context reporting into the given metrics.
    pub fn with_metrics(ceiling: Arc<dyn QueueCeiling>, metrics: BundlerMetrics) -> Self {
        Self {
            id: BundlerId::next(),
            ceiling,
            metrics,
        }
    }

    /// Same ceiling and metrics under a new id, for `copy()`.
    pub fn fork(&self) -> Self {
        Self {
            id: BundlerId::next(),
            ceiling: Arc::clone(&self.ceiling),
            metrics: self.metrics.clone(),
        }
    }

    pub fn id(&self) -> BundlerId {
        self.id
    }

    pub fn metrics(&self) -> &BundlerMetrics {
        &self.metrics
    }

    pub fn ceiling(&self) -> &Arc<dyn QueueCeiling> {
        &self.ceiling
    }

    /// Effective upper bound for a bundle, `UNBOUNDED_SIZE` if none.
    pub fn max_size(&self) -> usize {
        match self.ceiling.current_ceiling() {
            0 => UNBOUNDED_SIZE,
            n => n.min(UNBOUNDED_SIZE),
        }
    }

    /// Clamp a candidate size into `[1, max_size()]`.
    pub fn clamp(&self, size: usize) -> usize {
        size.clamp(1, self.max_size())
    }

    /// Round a signed or fractional candidate to the nearest size in
    /// `[1, max_size()]`.
    pub fn clamp_f64(&self, size: f64) -> usize {
        if !size.is_finite() {
            return 1;
        }
        let size = size.round();
        if size < 1.0 {
            return 1;
        }
        let max = self.max_size();
        if size >= max as f64 {
            max
        } else {
            size as usize
        }
    }
}

impl fmt::Debug for BundlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundlerContext")
            .field("id", &self.id)
            .field("max_size", &self.max_size())
            .finish()
    }
}
