//! Metrics collection for bundler observability.
//!
//! Metrics are always collected (atomic operations) and can optionally be
//! exposed via a Prometheus registry for scraping.
//!
//! # Available Metrics
//!
//! ## Gauges (current values)
//!
//! - `gridtune_active_channels` - Proportional channels registered
//! - `gridtune_last_bundle_size` - Most recent size chosen by a learning bundler
//!
//! ## Counters (cumulative)
//!
//! - `gridtune_feedback_total` - Bundle outcomes recorded
//! - `gridtune_ignored_feedback_total` - Bundle outcomes ignored
//! - `gridtune_analysis_passes_total` - Annealing analysis passes
//! - `gridtune_convergences_total` - Annealing searches converged
//! - `gridtune_drift_resets_total` - Converged searches restarted after drift
//! - `gridtune_states_restored_total` - Bundler states restored from persistence
//! - `gridtune_states_stored_total` - Bundler states stored to persistence
//! - `gridtune_persistence_errors_total` - Failed bundler state loads and stores

mod prometheus;

pub use prometheus::BundlerMetrics;
