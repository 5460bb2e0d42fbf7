//! Tuning profile for the bundler strategies.
//!
//! All knobs have defaults suited to typical grids. A profile is immutable
//! once handed to a bundler; copies of a bundler share it by `Arc`.

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{BundlerError, Result};

/// Parameters of the adaptive bundling algorithms.
///
/// One struct covers every strategy; each strategy reads only the knobs it
/// needs.
///
/// # Annealing search
///
/// An analysis pass runs once a size has accumulated more than
/// `min_samples_to_analyse` tasks. Candidate sizes are drawn around the best
/// known size with a spread of
/// ```text
/// sigma = best * size_ratio_deviation * exp(-decrease_ratio * (explored - 1))
/// ```
/// so steps shrink as more sizes are explored. After `max_guesses_to_stable`
/// draws that only hit explored sizes, the search converges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningProfile {
    // === Common ===
    /// Starting bundle size for fixed, annealing and bandit bundlers.
    /// Default: 5
    pub initial_size: usize,

    /// Task weight a size must accumulate before an analysis pass. Also the
    /// bound of the moving windows used by proportional and bandit bundlers.
    /// Default: 500
    pub min_samples_to_analyse: u64,

    // === Annealing search ===
    /// Task weight accumulated at the converged size before checking for drift.
    /// Default: 300
    pub min_samples_to_check_convergence: u64,

    /// Relative deviation from the converged mean that restarts the search.
    /// Default: 0.2
    pub max_deviation: f64,

    /// Maximum number of candidate draws per analysis pass.
    /// Default: 50
    pub max_guesses_to_stable: u32,

    /// Spread of candidate draws, relative to the best size.
    /// Default: 1.5
    pub size_ratio_deviation: f64,

    /// Shrink rate of the spread per explored size.
    /// Default: 0.2
    pub decrease_ratio: f64,

    // === Proportional ===
    /// Exponent `p` in `weight = 1 / mean^p`. Values above 1 penalize slow
    /// channels super-linearly.
    /// Default: 2.0
    pub proportionality_factor: f64,

    // === Static capacity ===
    /// Bundle size per reported node thread.
    /// Default: 1
    pub threads_multiplier: usize,

    // === Bandit ===
    /// Relative size change of the increase/decrease actions (at least one task).
    /// Default: 0.1
    pub action_step: f64,

    /// Step size of the action preference update.
    /// Default: 0.1
    pub learning_rate: f64,

    /// Softmax temperature for action selection.
    /// Default: 0.1
    pub temperature: f64,

    /// RNG seed. `None` seeds from entropy.
    /// Default: None
    pub seed: Option<u64>,
}

impl Default for TuningProfile {
    fn default() -> Self {
        Self {
            initial_size: 5,
            min_samples_to_analyse: 500,

            min_samples_to_check_convergence: 300,
            max_deviation: 0.2,
            max_guesses_to_stable: 50,
            size_ratio_deviation: 1.5,
            decrease_ratio: 0.2,

            proportionality_factor: 2.0,

            threads_multiplier: 1,

            action_step: 0.1,
            learning_rate: 0.1,
            temperature: 0.1,

            seed: None,
        }
    }
}

impl TuningProfile {
    /// Create a profile with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that every knob is within its valid range.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(BundlerError::InvalidProfile(msg))
        }

        if self.initial_size == 0 {
            return invalid("initial_size must be at least 1".into());
        }
        if self.min_samples_to_analyse == 0 {
            return invalid("min_samples_to_analyse must be at least 1".into());
        }
        if !(self.max_deviation.is_finite() && self.max_deviation >= 0.0) {
            return invalid(format!("max_deviation must be >= 0, got {}", self.max_deviation));
        }
        if !(self.size_ratio_deviation.is_finite() && self.size_ratio_deviation > 0.0) {
            return invalid(format!(
                "size_ratio_deviation must be > 0, got {}",
                self.size_ratio_deviation
            ));
        }
        if !(self.decrease_ratio.is_finite() && self.decrease_ratio >= 0.0) {
            return invalid(format!("decrease_ratio must be >= 0, got {}", self.decrease_ratio));
        }
        if !(self.proportionality_factor.is_finite() && self.proportionality_factor > 0.0) {
            return invalid(format!(
                "proportionality_factor must be > 0, got {}",
                self.proportionality_factor
            ));
        }
        if self.threads_multiplier == 0 {
            return invalid("threads_multiplier must be at least 1".into());
        }
        if !(self.action_step.is_finite() && self.action_step >= 0.0) {
            return invalid(format!("action_step must be >= 0, got {}", self.action_step));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return invalid(format!(
                "learning_rate must be in (0, 1], got {}",
                self.learning_rate
            ));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return invalid(format!("temperature must be > 0, got {}", self.temperature));
        }
        Ok(())
    }

    /// RNG for one bundler instance, seeded from `seed` if set.
    pub(crate) fn rng(&self) -> SmallRng {
        match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        }
    }

    /// Builder method to set the starting size.
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Builder method to set the analysis threshold.
    pub fn with_min_samples_to_analyse(mut self, samples: u64) -> Self {
        self.min_samples_to_analyse = samples;
        self
    }

    /// Builder method to set the drift check parameters.
    pub fn with_convergence_check(mut self, min_samples: u64, max_deviation: f64) -> Self {
        self.min_samples_to_check_convergence = min_samples;
        self.max_deviation = max_deviation;
        self
    }

    /// Builder method to set the guess budget.
    pub fn with_max_guesses(mut self, guesses: u32) -> Self {
        self.max_guesses_to_stable = guesses;
        self
    }

    /// Builder method to set the proportionality exponent.
    pub fn with_proportionality_factor(mut self, p: f64) -> Self {
        self.proportionality_factor = p;
        self
    }

    /// Builder method to set the node threads multiplier.
    pub fn with_threads_multiplier(mut self, multiplier: usize) -> Self {
        self.threads_multiplier = multiplier;
        self
    }

    /// Builder method to set the bandit parameters.
    pub fn with_bandit(mut self, action_step: f64, learning_rate: f64, temperature: f64) -> Self {
        self.action_step = action_step;
        self.learning_rate = learning_rate;
        self.temperature = temperature;
        self
    }

    /// Builder method to fix the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
