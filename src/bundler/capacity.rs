//! Bundle size taken from the node's self-reported parallelism.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::profile::TuningProfile;
use super::types::{BundlerContext, BundlerId, NodeCapabilityInfo};
use super::{Algorithm, Bundler, NodeAwareBundler};

/// Sizes bundles as `available_threads * threads_multiplier`.
///
/// Does not learn: `feedback()` is a no-op and only
/// [`set_node_capability`](NodeAwareBundler::set_node_capability) changes the
/// size. Until a capability is reported the size is 1.
#[derive(Debug)]
pub struct StaticCapacityBundler {
    ctx: BundlerContext,
    profile: Arc<TuningProfile>,
    size: usize,
}

impl StaticCapacityBundler {
    pub fn new(profile: Arc<TuningProfile>, ctx: BundlerContext) -> Self {
        Self {
            ctx,
            profile,
            size: 1,
        }
    }
}

impl Bundler for StaticCapacityBundler {
    fn id(&self) -> BundlerId {
        self.ctx.id()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::NodeThreads
    }

    fn size(&self) -> usize {
        self.ctx.clamp(self.size)
    }

    fn feedback(&mut self, _size: usize, _elapsed: Duration) {}

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::new(Arc::clone(&self.profile), self.ctx.fork()))
    }

    fn max_size(&self) -> usize {
        self.ctx.max_size()
    }

    fn as_node_aware(&mut self) -> Option<&mut dyn NodeAwareBundler> {
        Some(self)
    }
}

impl NodeAwareBundler for StaticCapacityBundler {
    fn set_node_capability(&mut self, info: NodeCapabilityInfo) {
        self.size = info
            .threads_or_one()
            .saturating_mul(self.profile.threads_multiplier.max(1));
        debug!(bundler = %self.ctx.id(), threads = info.available_threads, size = self.size, "node capability set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::types::FixedCeiling;

    fn bundler(multiplier: usize, ceiling: usize) -> StaticCapacityBundler {
        StaticCapacityBundler::new(
            Arc::new(TuningProfile::new().with_threads_multiplier(multiplier)),
            BundlerContext::new(Arc::new(FixedCeiling(ceiling))),
        )
    }

    #[test]
    fn test_size_before_capability_is_one() {
        assert_eq!(bundler(1, 0).size(), 1);
    }

    #[test]
    fn test_capability_sets_size() {
        let mut b = bundler(1, 0);
        b.set_node_capability(NodeCapabilityInfo::new(8));
        assert_eq!(b.size(), 8);

        let mut doubled = bundler(2, 0);
        doubled.set_node_capability(NodeCapabilityInfo::new(8));
        assert_eq!(doubled.size(), 16);
    }

    #[test]
    fn test_non_positive_threads_fall_back_to_one() {
        let mut b = bundler(1, 0);
        b.set_node_capability(NodeCapabilityInfo::new(8));
        b.set_node_capability(NodeCapabilityInfo::new(0));
        assert_eq!(b.size(), 1);
        b.set_node_capability(NodeCapabilityInfo::new(-2));
        assert_eq!(b.size(), 1);
    }

    #[test]
    fn test_feedback_is_no_op() {
        let mut b = bundler(1, 0);
        b.set_node_capability(NodeCapabilityInfo::new(4));
        for i in 1..50 {
            b.feedback(i, Duration::from_millis(i as u64 * 7));
        }
        assert_eq!(b.size(), 4);
    }

    #[test]
    fn test_size_clamped_to_ceiling() {
        let mut b = bundler(1, 3);
        b.set_node_capability(NodeCapabilityInfo::new(16));
        assert_eq!(b.size(), 3);
    }

    #[test]
    fn test_node_aware_access_through_trait_object() {
        let mut boxed: Box<dyn Bundler> = Box::new(bundler(1, 0));
        boxed
            .as_node_aware()
            .expect("static capacity bundler is node aware")
            .set_node_capability(NodeCapabilityInfo::new(6));
        assert_eq!(boxed.size(), 6);
    }
}
