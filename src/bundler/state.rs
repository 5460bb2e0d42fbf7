//! Serializable snapshots of what the learning strategies have learned.
//!
//! A snapshot is taken when a channel goes away and handed back to a fresh
//! bundler of the same algorithm when the channel reconnects, so the search
//! resumes instead of starting cold.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::bandit::BanditAction;
use super::types::{PerformanceSample, SampleWindow};
use super::Algorithm;

/// Learned state of one bundler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundlerState {
    Proportional(ProportionalState),
    Autotuned(AnnealingState),
    Rl(BanditState),
}

impl BundlerState {
    /// Algorithm that produced this state.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            BundlerState::Proportional(_) => Algorithm::Proportional,
            BundlerState::Autotuned(_) => Algorithm::Autotuned,
            BundlerState::Rl(_) => Algorithm::Rl,
        }
    }
}

/// One channel's moving window in a proportional group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProportionalState {
    pub window: SampleWindow,
    pub bootstrap: usize,
}

/// Sample table and convergence of an annealing search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnealingState {
    pub current_size: usize,
    pub samples: BTreeMap<usize, PerformanceSample>,
    pub converged: Option<ConvergedState>,
    pub analysis_passes: u64,
    pub convergences: u64,
}

/// What the annealing search keeps once it settled on a size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergedState {
    pub size: usize,
    /// Reference observations of `size`, empty until the first drift check
    /// when the search converged on a size it never sampled
    pub stable: PerformanceSample,
    /// Observations of `size` since convergence or the last drift check
    pub check: PerformanceSample,
}

/// Preferences and recent outcomes of a bandit bundler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BanditState {
    pub current_size: usize,
    pub window: SampleWindow,
    pub preferences: [f64; 3],
    pub last_action: Option<BanditAction>,
}
