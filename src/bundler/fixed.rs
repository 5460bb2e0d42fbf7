//! Fixed-size bundler, also used as the dispatcher's fallback.

use std::sync::Arc;
use std::time::Duration;

use super::profile::TuningProfile;
use super::types::{BundlerContext, BundlerId};
use super::{Algorithm, Bundler};

/// Always hands out `initial_size` tasks, clamped to the ceiling.
#[derive(Debug)]
pub struct FixedSizeBundler {
    ctx: BundlerContext,
    profile: Arc<TuningProfile>,
}

impl FixedSizeBundler {
    pub fn new(profile: Arc<TuningProfile>, ctx: BundlerContext) -> Self {
        Self { ctx, profile }
    }
}

impl Bundler for FixedSizeBundler {
    fn id(&self) -> BundlerId {
        self.ctx.id()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Manual
    }

    fn size(&self) -> usize {
        self.ctx.clamp(self.profile.initial_size)
    }

    fn feedback(&mut self, _size: usize, _elapsed: Duration) {}

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::new(Arc::clone(&self.profile), self.ctx.fork()))
    }

    fn max_size(&self) -> usize {
        self.ctx.max_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::types::FixedCeiling;

    #[test]
    fn test_fixed_size_is_clamped() {
        let profile = Arc::new(TuningProfile::new().with_initial_size(20));
        let bundler = FixedSizeBundler::new(
            profile.clone(),
            BundlerContext::new(Arc::new(FixedCeiling(0))),
        );
        assert_eq!(bundler.size(), 20);

        let bounded = FixedSizeBundler::new(profile, BundlerContext::new(Arc::new(FixedCeiling(8))));
        assert_eq!(bounded.size(), 8);
    }

    #[test]
    fn test_feedback_does_not_change_size() {
        let mut bundler = FixedSizeBundler::new(
            Arc::new(TuningProfile::default()),
            BundlerContext::new(Arc::new(FixedCeiling(0))),
        );
        bundler.feedback(100, Duration::from_secs(10));
        assert_eq!(bundler.size(), 5);
        assert!(bundler.copy().id() != bundler.id());
    }
}
