//! Reinforcement-learning bundler treating size changes as bandit arms.
//!
//! Three actions are available after each bundle: shrink the size by
//! `action_step` (at least one task), keep it, or grow it. Each action carries
//! a preference value. When feedback arrives, the action that produced the
//! current size is rewarded by how much the per-task time improved over the
//! recent baseline:
//!
//! ```text
//! reward = 1 - t / baseline        (clamped to [-1, 1])
//! pref[a] += learning_rate * (reward - pref[a])
//! ```
//!
//! The next action is drawn from a softmax over the preferences. Cheaper per
//! call than the annealing search and quicker to react to regime changes, at
//! the cost of a noisier size.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::profile::TuningProfile;
use super::state::{BanditState, BundlerState};
use super::types::{BundlerContext, BundlerId, SampleWindow};
use super::{Algorithm, Bundler};

/// Size adjustment chosen by the bandit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanditAction {
    Decrease,
    Keep,
    Increase,
}

impl BanditAction {
    pub const ALL: [BanditAction; 3] = [
        BanditAction::Decrease,
        BanditAction::Keep,
        BanditAction::Increase,
    ];

    fn index(self) -> usize {
        match self {
            BanditAction::Decrease => 0,
            BanditAction::Keep => 1,
            BanditAction::Increase => 2,
        }
    }
}

/// Softmax bandit bundler (algorithm `rl`).
#[derive(Debug)]
pub struct BanditAdjustBundler {
    ctx: BundlerContext,
    profile: Arc<TuningProfile>,
    current_size: usize,
    window: SampleWindow,
    preferences: [f64; 3],
    last_action: Option<BanditAction>,
    rng: SmallRng,
}

impl BanditAdjustBundler {
    pub fn new(profile: Arc<TuningProfile>, ctx: BundlerContext) -> Self {
        let window = usize::try_from(profile.min_samples_to_analyse).unwrap_or(usize::MAX);
        Self {
            current_size: ctx.clamp(profile.initial_size),
            window: SampleWindow::new(window),
            preferences: [0.0; 3],
            last_action: None,
            rng: profile.rng(),
            ctx,
            profile,
        }
    }

    /// Current preference of an action.
    pub fn preference(&self, action: BanditAction) -> f64 {
        self.preferences[action.index()]
    }

    /// Action applied to produce the current size, if any.
    pub fn last_action(&self) -> Option<BanditAction> {
        self.last_action
    }

    fn choose_action(&mut self) -> BanditAction {
        let top = self
            .preferences
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let weights = self
            .preferences
            .map(|p| ((p - top) / self.profile.temperature).exp());
        match WeightedIndex::new(weights) {
            Ok(dist) => BanditAction::ALL[dist.sample(&mut self.rng)],
            Err(_) => BanditAction::Keep,
        }
    }

    fn apply(&mut self, action: BanditAction) {
        let step = ((self.current_size as f64 * self.profile.action_step).round() as usize).max(1);
        let next = match action {
            BanditAction::Decrease => self.current_size.saturating_sub(step),
            BanditAction::Keep => self.current_size,
            BanditAction::Increase => self.current_size.saturating_add(step),
        };
        self.current_size = self.ctx.clamp(next);
    }
}

impl Bundler for BanditAdjustBundler {
    fn id(&self) -> BundlerId {
        self.ctx.id()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Rl
    }

    fn size(&self) -> usize {
        self.ctx.clamp(self.current_size)
    }

    fn feedback(&mut self, size: usize, elapsed: Duration) {
        if size == 0 {
            self.ctx.metrics().record_ignored_feedback();
            return;
        }
        self.ctx.metrics().record_feedback();

        let elapsed_ns = elapsed.as_nanos() as f64;
        let per_task = elapsed_ns / size as f64;
        let baseline = self.window.mean();
        let had_baseline = !self.window.is_empty();
        self.window.add(elapsed_ns, size);

        if let (true, Some(action)) = (had_baseline, self.last_action) {
            let reward = if baseline > 0.0 {
                (1.0 - per_task / baseline).clamp(-1.0, 1.0)
            } else {
                0.0
            };
            let pref = &mut self.preferences[action.index()];
            *pref += self.profile.learning_rate * (reward - *pref);
        }

        let action = self.choose_action();
        self.apply(action);
        self.last_action = Some(action);
        self.ctx.metrics().set_last_size(self.current_size);
        debug!(
            bundler = %self.ctx.id(),
            ?action,
            size = self.current_size,
            baseline_ns = baseline,
            "bandit action chosen"
        );
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::new(Arc::clone(&self.profile), self.ctx.fork()))
    }

    fn max_size(&self) -> usize {
        self.ctx.max_size()
    }

    fn snapshot(&self) -> Option<BundlerState> {
        Some(BundlerState::Rl(BanditState {
            current_size: self.current_size,
            window: self.window.clone(),
            preferences: self.preferences,
            last_action: self.last_action,
        }))
    }

    fn restore(&mut self, state: BundlerState) -> bool {
        let BundlerState::Rl(state) = state else {
            return false;
        };
        let mut window = state.window;
        let capacity = usize::try_from(self.profile.min_samples_to_analyse).unwrap_or(usize::MAX);
        window.set_capacity(capacity);
        self.current_size = self.ctx.clamp(state.current_size);
        self.window = window;
        // Non-finite preferences would poison the softmax
        self.preferences = state.preferences.map(|p| if p.is_finite() { p } else { 0.0 });
        self.last_action = state.last_action;
        debug!(bundler = %self.ctx.id(), size = self.current_size, "bandit state restored");
        true
    }
}
