//! # gridtune
//!
//! **Adaptive bundle sizing for grid dispatchers**
//!
//! A dispatcher sends tasks to remote execution channels in bundles. Too small
//! and the round-trip overhead dominates, too large and fast nodes sit idle
//! while slow ones finish. A [`Bundler`] decides the size of each bundle and
//! learns from the observed `(size, elapsed)` outcome.
//!
//! ## Features
//!
//! - **Static sizing**: fixed size, or the node's reported thread count
//! - **Proportional-fair**: splits the queue across channels by `1 / mean^p`
//! - **Annealing search**: randomized local search for the fastest size, with
//!   convergence and drift detection
//! - **Bandit**: softmax action selection over grow/keep/shrink
//! - **Global scope**: one bundler shared by every channel
//! - **Persistence**: learned state survives channel reconnections and driver restarts
//! - **Flexible Configuration**: Configure via files (TOML/YAML/JSON), environment variables, or code
//! - **CLI Integration**: Built-in clap support for command-line overrides
//! - **Metrics**: Prometheus counters, optionally registered for scraping
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Instant;
//! use gridtune::{Algorithm, BundlerFactoryBuilder, FixedCeiling};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = BundlerFactoryBuilder::new()
//!         .algorithm(Algorithm::Autotuned)
//!         .build(Arc::new(FixedCeiling(0)))?;
//!
//!     let mut bundler = factory.new_bundler();
//!     while let Some(tasks) = queue.take(bundler.size()) {
//!         let start = Instant::now();
//!         let done = channel.execute(tasks)?;
//!         bundler.feedback(done, start.elapsed());
//!     }
//!     bundler.dispose();
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Configuration sources are merged in order (later sources override earlier):
//!
//! 1. Default values
//! 2. Config files (via `.file()`)
//! 3. Environment variables (via `.env_prefix()`)
//! 4. Programmatic overrides
//! 5. CLI arguments (via `.with_cli_args()`)
//!
//! ### Config File Example (TOML)
//!
//! ```toml
//! algorithm = "autotuned"
//! scope = "node"
//!
//! [profile]
//! initial_size = 10
//! min_samples_to_analyse = 500
//! max_guesses_to_stable = 50
//! ```
//!
//! ### Environment Variables
//!
//! With `.env_prefix("GRIDTUNE")`:
//! - `GRIDTUNE_ALGORITHM=rl`
//! - `GRIDTUNE_SCOPE=global`
//! - `GRIDTUNE_PROFILE__INITIAL_SIZE=10`
//! - `GRIDTUNE_PERSISTENCE_DIR=/var/lib/driver/lb_persistence`
//!
//! ### CLI Arguments
//!
//! ```ignore
//! use clap::Parser;
//! use gridtune::{BundlerArgs, BundlerFactoryBuilder};
//!
//! #[derive(Parser)]
//! struct DriverArgs {
//!     #[command(flatten)]
//!     lb: BundlerArgs,
//! }
//!
//! let args = DriverArgs::parse();
//! let factory = BundlerFactoryBuilder::new()
//!     .file("gridtune.toml")
//!     .env_prefix("GRIDTUNE")
//!     .with_cli_args(&args.lb)
//!     .build(ceiling)?;
//! ```

pub mod builder;
pub mod bundler;
pub mod config;
pub mod error;
pub mod factory;
pub mod metrics;
pub mod persistence;

pub use builder::{BundlerArgs, BundlerFactoryBuilder};
pub use bundler::{
    Algorithm, AnnealingSearchBundler, AnnealingState, BanditAction, BanditAdjustBundler,
    BanditState, Bundler, BundlerContext, BundlerId, BundlerState, ConvergedState, FixedCeiling,
    FixedSizeBundler, NodeAwareBundler, NodeCapabilityInfo, PerformanceSample,
    ProportionalFairBundler, ProportionalGroup, ProportionalState, QueueCeiling, SampleWindow,
    SharedBundlerState, SharedCeiling, SharedDelegatingBundler, StaticCapacityBundler,
    TuningProfile, UNBOUNDED_SIZE,
};
pub use config::{LoadBalancingConfig, Scope};
pub use error::{BundlerError, Result};
pub use factory::BundlerFactory;
pub use metrics::BundlerMetrics;
pub use persistence::{
    algorithm_hash, FileLoadBalancerPersistence, LoadBalancerPersistence, PersistentBundler,
    StateKey,
};
