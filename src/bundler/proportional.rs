//! Proportional-fair split of the outstanding tasks across channels.
//!
//! Every channel keeps a moving-window mean of its per-task execution time
//! in a table shared by all channels of the group. A channel's bundle size is
//! its share of the outstanding tasks, weighted by `1 / mean^p`:
//!
//! ```text
//! size_i = outstanding * (1 / mean_i^p) / sum_j(1 / mean_j^p)
//! ```
//!
//! With `p > 1` fast channels get disproportionately larger bundles, so
//! completion times across channels converge. When the dispatcher does not
//! report the outstanding task count, the budget is the volume the channels
//! have been dispatching per round (the sum of their mean bundle sizes), so
//! the split still moves tasks from slow channels to fast ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::profile::TuningProfile;
use super::state::{BundlerState, ProportionalState};
use super::types::{BundlerContext, BundlerId, NodeCapabilityInfo, SampleWindow};
use super::{Algorithm, Bundler, NodeAwareBundler};

/// Lower bound on a channel mean, avoids infinite weights for zero-time feedback.
const MIN_MEAN_NS: f64 = 1.0;

struct ChannelState {
    window: SampleWindow,
    /// Size handed out before the first feedback
    bootstrap: usize,
}

/// Table of per-channel performance shared by cooperating proportional bundlers.
///
/// Owned by the scheduler (usually through a `BundlerFactory`) and handed to
/// each channel's bundler by `Arc`. All reads and updates of the table happen
/// under one short-held lock.
#[derive(Default)]
pub struct ProportionalGroup {
    channels: Mutex<HashMap<BundlerId, ChannelState>>,
}

impl ProportionalGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels currently registered.
    pub fn active_channels(&self) -> usize {
        self.channels.lock().len()
    }

    /// Mean per-task time of a channel, `None` without samples.
    pub fn channel_mean(&self, id: BundlerId) -> Option<f64> {
        self.channels
            .lock()
            .get(&id)
            .filter(|c| !c.window.is_empty())
            .map(|c| c.window.mean())
    }

    /// Task weight currently held in a channel's window.
    pub fn channel_weight(&self, id: BundlerId) -> usize {
        self.channels
            .lock()
            .get(&id)
            .map_or(0, |c| c.window.weight())
    }

    fn register(&self, id: BundlerId, window_capacity: usize) {
        self.channels.lock().insert(
            id,
            ChannelState {
                window: SampleWindow::new(window_capacity),
                bootstrap: 1,
            },
        );
    }

    fn unregister(&self, id: BundlerId) -> bool {
        self.channels.lock().remove(&id).is_some()
    }

    fn record(&self, id: BundlerId, elapsed_ns: f64, size: usize) {
        if let Some(channel) = self.channels.lock().get_mut(&id) {
            channel.window.add(elapsed_ns, size);
        }
    }

    fn set_bootstrap(&self, id: BundlerId, size: usize) {
        if let Some(channel) = self.channels.lock().get_mut(&id) {
            channel.bootstrap = size.max(1);
        }
    }

    fn snapshot(&self, id: BundlerId) -> Option<ProportionalState> {
        self.channels.lock().get(&id).map(|c| ProportionalState {
            window: c.window.clone(),
            bootstrap: c.bootstrap,
        })
    }

    fn restore(&self, id: BundlerId, state: ProportionalState, window_capacity: usize) -> bool {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(&id) else {
            return false;
        };
        channel.window = state.window;
        channel.window.set_capacity(window_capacity);
        channel.bootstrap = state.bootstrap.max(1);
        true
    }

    /// Share of the budget for channel `id`, before rounding and clamping.
    ///
    /// `outstanding` is the number of queued tasks, if the dispatcher knows it.
    fn share(&self, id: BundlerId, p: f64, outstanding: Option<usize>) -> f64 {
        let channels = self.channels.lock();
        let Some(me) = channels.get(&id) else {
            return 1.0;
        };
        if me.window.is_empty() {
            return me.bootstrap as f64;
        }

        // (mean time per task, mean bundle size) of every channel with samples
        let sampled: Vec<(f64, f64)> = channels
            .values()
            .filter(|c| !c.window.is_empty())
            .map(|c| (c.window.mean().max(MIN_MEAN_NS), c.window.mean_bundle_size()))
            .collect();
        let budget = match outstanding {
            Some(n) => n as f64,
            None => sampled.iter().map(|(_, size)| size).sum(),
        };
        if budget <= 0.0 {
            return 1.0;
        }

        // Normalizing by the slowest mean keeps the weights in a sane range.
        let max_mean = sampled
            .iter()
            .map(|(mean, _)| *mean)
            .fold(MIN_MEAN_NS, f64::max);
        let total: f64 = sampled.iter().map(|(mean, _)| (max_mean / mean).powf(p)).sum();
        let mine = (max_mean / me.window.mean().max(MIN_MEAN_NS)).powf(p);

        budget * mine / total
    }
}

impl std::fmt::Debug for ProportionalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProportionalGroup")
            .field("active_channels", &self.active_channels())
            .finish()
    }
}

/// One channel of a [`ProportionalGroup`].
///
/// The size depends on every other active channel of the group, so it can
/// change without this channel receiving feedback.
#[derive(Debug)]
pub struct ProportionalFairBundler {
    ctx: BundlerContext,
    profile: Arc<TuningProfile>,
    group: Arc<ProportionalGroup>,
    disposed: bool,
}

impl ProportionalFairBundler {
    /// Create a bundler and register it as a channel of `group`.
    pub fn new(
        profile: Arc<TuningProfile>,
        ctx: BundlerContext,
        group: Arc<ProportionalGroup>,
    ) -> Self {
        group.register(ctx.id(), window_capacity(&profile));
        ctx.metrics().channel_registered();
        debug!(bundler = %ctx.id(), channels = group.active_channels(), "proportional channel registered");
        Self {
            ctx,
            profile,
            group,
            disposed: false,
        }
    }

    /// The group this channel belongs to.
    pub fn group(&self) -> &Arc<ProportionalGroup> {
        &self.group
    }
}

fn window_capacity(profile: &TuningProfile) -> usize {
    usize::try_from(profile.min_samples_to_analyse).unwrap_or(usize::MAX)
}

impl Bundler for ProportionalFairBundler {
    fn id(&self) -> BundlerId {
        self.ctx.id()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Proportional
    }

    fn size(&self) -> usize {
        let outstanding = self.ctx.ceiling().outstanding_tasks();
        let share = self
            .group
            .share(self.ctx.id(), self.profile.proportionality_factor, outstanding);
        self.ctx.clamp_f64(share)
    }

    fn feedback(&mut self, size: usize, elapsed: Duration) {
        if size == 0 || self.disposed {
            self.ctx.metrics().record_ignored_feedback();
            return;
        }
        self.group
            .record(self.ctx.id(), elapsed.as_nanos() as f64, size);
        self.ctx.metrics().record_feedback();
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::new(
            Arc::clone(&self.profile),
            self.ctx.fork(),
            Arc::clone(&self.group),
        ))
    }

    fn max_size(&self) -> usize {
        self.ctx.max_size()
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.group.unregister(self.ctx.id()) {
            self.ctx.metrics().channel_unregistered();
        }
        debug!(bundler = %self.ctx.id(), "proportional channel disposed");
    }

    fn as_node_aware(&mut self) -> Option<&mut dyn NodeAwareBundler> {
        Some(self)
    }

    fn snapshot(&self) -> Option<BundlerState> {
        self.group
            .snapshot(self.ctx.id())
            .map(BundlerState::Proportional)
    }

    fn restore(&mut self, state: BundlerState) -> bool {
        let BundlerState::Proportional(state) = state else {
            return false;
        };
        if self.disposed {
            return false;
        }
        self.group
            .restore(self.ctx.id(), state, window_capacity(&self.profile))
    }
}

impl NodeAwareBundler for ProportionalFairBundler {
    /// Use the node's thread count as the size before the first feedback.
    fn set_node_capability(&mut self, info: NodeCapabilityInfo) {
        self.group.set_bootstrap(self.ctx.id(), info.threads_or_one());
    }
}

/// A channel dropped without `dispose()` must not keep its share of the budget.
impl Drop for ProportionalFairBundler {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::types::{FixedCeiling, QueueCeiling, SharedCeiling};
    use crate::metrics::BundlerMetrics;

    fn channel(
        group: &Arc<ProportionalGroup>,
        p: f64,
        ceiling: Arc<dyn QueueCeiling>,
    ) -> ProportionalFairBundler {
        ProportionalFairBundler::new(
            Arc::new(TuningProfile::new().with_proportionality_factor(p)),
            BundlerContext::new(ceiling),
            Arc::clone(group),
        )
    }

    /// Unbounded bundles, `outstanding` queued tasks.
    fn queue(outstanding: usize) -> Arc<dyn QueueCeiling> {
        Arc::new(SharedCeiling::new(0, outstanding))
    }

    #[test]
    fn test_bootstrap_size_is_one() {
        let group = Arc::new(ProportionalGroup::new());
        let b = channel(&group, 2.0, queue(1000));
        assert_eq!(b.size(), 1);
        assert_eq!(group.active_channels(), 1);
    }

    #[test]
    fn test_single_channel_gets_whole_budget() {
        let group = Arc::new(ProportionalGroup::new());
        let mut b = channel(&group, 2.0, queue(100));
        b.feedback(10, Duration::from_millis(10));
        assert_eq!(b.size(), 100);
    }

    #[test]
    fn test_proportional_split() {
        let group = Arc::new(ProportionalGroup::new());
        let ceiling = queue(1000);
        let mut fast = channel(&group, 2.0, ceiling.clone());
        let mut slow = channel(&group, 2.0, ceiling);

        // 1ms per task vs 2ms per task
        fast.feedback(10, Duration::from_millis(10));
        slow.feedback(10, Duration::from_millis(20));

        // (t2/t1)^p = 4 -> 800 / 200
        assert_eq!(fast.size(), 800);
        assert_eq!(slow.size(), 200);
    }

    #[test]
    fn test_split_uses_outstanding_tasks_and_clamps_to_ceiling() {
        let group = Arc::new(ProportionalGroup::new());
        let ceiling = Arc::new(SharedCeiling::new(300, 1000));
        let mut fast = channel(&group, 1.0, ceiling.clone());
        let mut slow = channel(&group, 1.0, ceiling.clone());
        fast.feedback(5, Duration::from_millis(5));
        slow.feedback(5, Duration::from_millis(15));

        // 750 / 250 before clamping
        assert_eq!(fast.size(), 300);
        assert_eq!(slow.size(), 250);

        ceiling.set_outstanding(0);
        assert_eq!(fast.size(), 1);
    }

    #[test]
    fn test_unknown_outstanding_redistributes_dispatched_volume() {
        let group = Arc::new(ProportionalGroup::new());
        let ceiling: Arc<dyn QueueCeiling> = Arc::new(FixedCeiling(0));
        let mut fast = channel(&group, 2.0, ceiling.clone());
        let mut slow = channel(&group, 2.0, ceiling);

        fast.feedback(10, Duration::from_millis(10));
        assert_eq!(fast.size(), 10);

        slow.feedback(10, Duration::from_millis(20));
        // 20 tasks per round, split 4:1
        assert_eq!(fast.size(), 16);
        assert_eq!(slow.size(), 4);
    }

    #[test]
    fn test_bounded_ceiling_is_not_a_budget() {
        let group = Arc::new(ProportionalGroup::new());
        let mut b = channel(&group, 2.0, Arc::new(FixedCeiling(500)));
        b.feedback(40, Duration::from_millis(40));
        assert_eq!(b.size(), 40);
    }

    #[test]
    fn test_window_tracks_recent_behavior() {
        let group = Arc::new(ProportionalGroup::new());
        let profile = Arc::new(TuningProfile::new().with_min_samples_to_analyse(20));
        let mut b = ProportionalFairBundler::new(
            profile,
            BundlerContext::new(Arc::new(FixedCeiling(0))),
            Arc::clone(&group),
        );
        for _ in 0..10 {
            b.feedback(10, Duration::from_millis(100)); // 10ms per task
        }
        for _ in 0..2 {
            b.feedback(10, Duration::from_millis(10)); // 1ms per task
        }
        let mean = group.channel_mean(b.id()).unwrap();
        assert!((mean - 1_000_000.0).abs() < 1.0, "mean = {}", mean);
    }

    #[test]
    fn test_dispose_unregisters_channel() {
        let group = Arc::new(ProportionalGroup::new());
        let ceiling = queue(100);
        let mut a = channel(&group, 2.0, ceiling.clone());
        let mut b = channel(&group, 2.0, ceiling);
        a.feedback(1, Duration::from_millis(1));
        b.feedback(1, Duration::from_millis(1));
        assert_eq!(a.size(), 50);

        b.dispose();
        b.dispose();
        assert_eq!(group.active_channels(), 1);
        assert_eq!(a.size(), 100);
    }

    #[test]
    fn test_drop_without_dispose_releases_share() {
        let group = Arc::new(ProportionalGroup::new());
        let metrics = BundlerMetrics::new();
        let ceiling = queue(100);
        let profile = Arc::new(TuningProfile::new());
        let mut a = ProportionalFairBundler::new(
            Arc::clone(&profile),
            BundlerContext::with_metrics(ceiling.clone(), metrics.clone()),
            Arc::clone(&group),
        );
        a.feedback(1, Duration::from_millis(1));
        {
            let mut b = ProportionalFairBundler::new(
                profile,
                BundlerContext::with_metrics(ceiling, metrics.clone()),
                Arc::clone(&group),
            );
            b.feedback(1, Duration::from_millis(1));
            assert_eq!(a.size(), 50);
            assert_eq!(metrics.active_channels.get(), 2);
        }
        assert_eq!(group.active_channels(), 1);
        assert_eq!(metrics.active_channels.get(), 1);
        assert_eq!(a.size(), 100);

        // Disposing then dropping unregisters once
        a.dispose();
        drop(a);
        assert_eq!(metrics.active_channels.get(), 0);
    }

    #[test]
    fn test_copy_joins_same_group() {
        let group = Arc::new(ProportionalGroup::new());
        let a = channel(&group, 2.0, queue(100));
        let b = a.copy();
        assert_ne!(a.id(), b.id());
        assert_eq!(group.active_channels(), 2);
    }

    #[test]
    fn test_node_capability_sets_bootstrap() {
        let group = Arc::new(ProportionalGroup::new());
        let mut b = channel(&group, 2.0, queue(100));
        b.set_node_capability(NodeCapabilityInfo::new(6));
        assert_eq!(b.size(), 6);

        b.feedback(6, Duration::from_millis(6));
        assert_eq!(b.size(), 100);
    }

    #[test]
    fn test_snapshot_restores_channel_window() {
        let group = Arc::new(ProportionalGroup::new());
        let ceiling = queue(300);
        let mut fast = channel(&group, 1.0, ceiling.clone());
        let mut slow = channel(&group, 1.0, ceiling.clone());
        fast.feedback(10, Duration::from_millis(10));
        slow.feedback(10, Duration::from_millis(20));
        let state = slow.snapshot().unwrap();
        drop(slow);

        // Reconnected channel resumes with its old mean instead of bootstrapping
        let mut back = channel(&group, 1.0, ceiling);
        assert_eq!(back.size(), 1);
        assert!(back.restore(state.clone()));
        assert_eq!(back.size(), 100);
        assert_eq!(fast.size(), 200);
        assert_eq!(back.snapshot(), Some(state));
    }
}
