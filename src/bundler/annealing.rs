//! Randomized local search for the bundle size with the lowest per-task time.
//!
//! The bundler keeps a table of weighted mean execution times, one entry per
//! bundle size it has tried. Once the size just fed has accumulated enough
//! weight, an analysis pass picks the best size so far and draws candidates
//! around it with a spread that shrinks as the table fills up. The first
//! candidate not yet tried becomes the next size. When the guess budget runs
//! out without finding one, the search has converged: the table is reduced to
//! the best entry and the size stays there until its observed time drifts.
//!
//! No derivative or throughput model is needed, so noisy and non-convex
//! size/time curves are fine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::{debug, info};

use super::profile::TuningProfile;
use super::state::{AnnealingState, BundlerState, ConvergedState};
use super::types::{BundlerContext, BundlerId, PerformanceSample};
use super::{Algorithm, Bundler};

/// Annealing-style search bundler (algorithm `autotuned`).
#[derive(Debug)]
pub struct AnnealingSearchBundler {
    ctx: BundlerContext,
    profile: Arc<TuningProfile>,
    current_size: usize,
    samples: BTreeMap<usize, PerformanceSample>,
    converged: Option<ConvergedState>,
    rng: SmallRng,
    analysis_passes: u64,
    convergences: u64,
}

impl AnnealingSearchBundler {
    pub fn new(profile: Arc<TuningProfile>, ctx: BundlerContext) -> Self {
        debug!(bundler = %ctx.id(), initial_size = profile.initial_size, "using annealing search bundle size");
        Self {
            current_size: profile.initial_size.max(1),
            samples: BTreeMap::new(),
            converged: None,
            rng: profile.rng(),
            analysis_passes: 0,
            convergences: 0,
            ctx,
            profile,
        }
    }

    /// Sample table, keyed by bundle size.
    pub fn samples(&self) -> &BTreeMap<usize, PerformanceSample> {
        &self.samples
    }

    /// Number of analysis passes run so far.
    pub fn analysis_passes(&self) -> u64 {
        self.analysis_passes
    }

    /// Number of times the search converged.
    pub fn convergences(&self) -> u64 {
        self.convergences
    }

    pub fn is_converged(&self) -> bool {
        self.converged.is_some()
    }

    /// Per-task mean time (ns) of the converged size, once known.
    pub fn converged_mean(&self) -> Option<f64> {
        self.converged
            .filter(|c| c.stable.sample_count > 0)
            .map(|c| c.stable.mean_time)
    }

    /// Size with the lowest mean time in the table.
    fn best_size(&self) -> Option<usize> {
        self.samples
            .iter()
            .min_by(|a, b| a.1.mean_time.total_cmp(&b.1.mean_time))
            .map(|(size, _)| *size)
    }

    fn analyse(&mut self) {
        self.analysis_passes += 1;
        self.ctx.metrics().record_analysis();

        let Some(argmin) = self.best_size() else {
            self.current_size = 1;
            return;
        };
        let max = self.ctx.max_size();
        let best = argmin.min(max).max(1);

        let explored = self.samples.len().saturating_sub(1) as f64;
        let sigma = (best as f64
            * self.profile.size_ratio_deviation
            * (-self.profile.decrease_ratio * explored).exp())
        .max(1.0);

        if let Ok(spread) = Normal::new(0.0, sigma) {
            for _ in 0..self.profile.max_guesses_to_stable {
                let magnitude = spread.sample(&mut self.rng).abs().round().max(1.0);
                let candidate = if self.rng.gen_bool(0.5) {
                    best as f64 + magnitude
                } else {
                    best as f64 - magnitude
                };
                if candidate < 1.0 || candidate > max as f64 {
                    continue;
                }
                let candidate = candidate as usize;
                if !self.samples.contains_key(&candidate) {
                    debug!(
                        bundler = %self.ctx.id(),
                        best,
                        candidate,
                        sigma,
                        explored = self.samples.len(),
                        "analysis pass picked new candidate"
                    );
                    self.current_size = candidate;
                    self.ctx.metrics().set_last_size(candidate);
                    return;
                }
            }
        }

        self.converge(best);
    }

    fn converge(&mut self, best: usize) {
        // A best size clamped below the argmin has no sample of its own; its
        // reference mean is taken at the first drift check.
        let kept = self.samples.get(&best).copied().unwrap_or_default();
        self.samples.clear();
        self.samples.insert(best, kept);

        self.current_size = best;
        self.converged = Some(ConvergedState {
            size: best,
            stable: kept,
            check: PerformanceSample::default(),
        });
        self.convergences += 1;
        self.ctx.metrics().record_convergence();
        self.ctx.metrics().set_last_size(best);
        info!(
            bundler = %self.ctx.id(),
            size = best,
            mean_ns = kept.mean_time,
            "bundle size converged"
        );
    }

    /// Leave the converged state and search again from `size`, seeded with
    /// `seed` observations of it.
    fn restart(&mut self, size: usize, seed: PerformanceSample) {
        self.ctx.metrics().record_drift_reset();
        self.converged = None;
        self.samples.clear();
        if seed.sample_count > 0 {
            self.samples.insert(size, seed);
        }
        self.current_size = size;
        if seed.sample_count > self.profile.min_samples_to_analyse {
            self.analyse();
        }
    }

    /// Feedback while converged: watch the converged size for drift.
    fn check_drift(&mut self, size: usize, elapsed_ns: f64) {
        let Some(conv) = self.converged else {
            return;
        };

        // The ceiling fell below the converged size: the size handed out is
        // no longer the one the search settled on.
        let effective = self.ctx.clamp(conv.size);
        if effective != conv.size {
            info!(
                bundler = %self.ctx.id(),
                converged = conv.size,
                max_size = effective,
                "ceiling dropped below converged size, restarting search"
            );
            self.restart(effective, PerformanceSample::default());
            self.record_search_sample(size, elapsed_ns);
            return;
        }
        if size != effective {
            return;
        }

        let mut conv = conv;
        conv.check.record(elapsed_ns, size);
        if conv.check.sample_count <= self.profile.min_samples_to_check_convergence {
            self.converged = Some(conv);
            return;
        }

        if conv.stable.sample_count == 0 {
            debug!(
                bundler = %self.ctx.id(),
                size = conv.size,
                mean_ns = conv.check.mean_time,
                "reference mean of converged size established"
            );
            conv.stable = conv.check;
            conv.check = PerformanceSample::default();
            self.converged = Some(conv);
            return;
        }

        let observed = conv.check.mean_time;
        let stable_mean = conv.stable.mean_time;
        let deviation = if stable_mean > 0.0 {
            (observed - stable_mean).abs() / stable_mean
        } else if observed > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        if deviation <= self.profile.max_deviation {
            conv.check = PerformanceSample::default();
            self.converged = Some(conv);
            return;
        }

        info!(
            bundler = %self.ctx.id(),
            size = conv.size,
            stable_mean_ns = stable_mean,
            observed_mean_ns = observed,
            deviation,
            "performance drifted, restarting search"
        );
        self.restart(conv.size, conv.check);
    }

    fn record_search_sample(&mut self, size: usize, elapsed_ns: f64) {
        let sample = self.samples.entry(size).or_default();
        sample.record(elapsed_ns, size);
        if sample.sample_count > self.profile.min_samples_to_analyse {
            self.analyse();
        }
    }
}

impl Bundler for AnnealingSearchBundler {
    fn id(&self) -> BundlerId {
        self.ctx.id()
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Autotuned
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

        if self.converged.is_some() {
            self.check_drift(size, elapsed_ns);
        } else {
            self.record_search_sample(size, elapsed_ns);
        }
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::new(Arc::clone(&self.profile), self.ctx.fork()))
    }

    fn max_size(&self) -> usize {
        self.ctx.max_size()
    }

    fn snapshot(&self) -> Option<BundlerState> {
        Some(BundlerState::Autotuned(AnnealingState {
            current_size: self.current_size,
            samples: self.samples.clone(),
            converged: self.converged,
            analysis_passes: self.analysis_passes,
            convergences: self.convergences,
        }))
    }

    fn restore(&mut self, state: BundlerState) -> bool {
        let BundlerState::Autotuned(state) = state else {
            return false;
        };
        self.current_size = state.current_size.max(1);
        self.samples = state.samples;
        self.samples.remove(&0);
        self.converged = state.converged.filter(|c| c.size > 0);
        self.analysis_passes = state.analysis_passes;
        self.convergences = state.convergences;
        debug!(
            bundler = %self.ctx.id(),
            size = self.current_size,
            explored = self.samples.len(),
            converged = self.converged.is_some(),
            "annealing state restored"
        );
        true
    }
}
