//! Prometheus metrics for bundler observability.
//!
//! Counters and gauges are plain atomics and work without a `Registry`.
//! Registration is only needed for exposition (scraping). Every bundler
//! created by one factory reports into the same set of metrics, clones share
//! the underlying values.
//!
//! # Usage
//!
//! ```ignore
//! let registry = prometheus::Registry::new();
//! let factory = BundlerFactoryBuilder::new()
//!     .prometheus_registry(registry.clone())
//!     .build(Arc::new(FixedCeiling(0)))?;
//!
//! let encoder = prometheus::TextEncoder::new();
//! encoder.encode(&registry.gather(), &mut buffer)?;
//! ```

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics shared by the bundlers of one factory.
#[derive(Clone)]
pub struct BundlerMetrics {
    // === Gauges ===
    /// Proportional channels currently registered
    pub active_channels: IntGauge,

    /// Most recent size chosen by a learning bundler
    pub last_bundle_size: IntGauge,

    // === Counters ===
    /// Feedback calls folded into a bundler's state
    pub feedback_total: IntCounter,

    /// Feedback calls dropped (empty bundle or disposed channel)
    pub ignored_feedback_total: IntCounter,

    /// Annealing analysis passes
    pub analysis_passes_total: IntCounter,

    /// Annealing searches that settled on a size
    pub convergences_total: IntCounter,

    /// Converged searches restarted because performance drifted
    pub drift_resets_total: IntCounter,

    /// Bundler states resumed from the persistence store
    pub states_restored_total: IntCounter,

    /// Bundler states written to the persistence store
    pub states_stored_total: IntCounter,

    /// Failed loads and stores of bundler state
    pub persistence_errors_total: IntCounter,
}

impl Default for BundlerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BundlerMetrics {
    /// Create metrics with default prefix "gridtune".
    pub fn new() -> Self {
        Self::with_prefix("gridtune")
    }

    /// Create metrics with a custom prefix.
    ///
    /// Metric names will be `{prefix}_feedback_total`, `{prefix}_active_channels`, etc.
    /// Characters not valid in a Prometheus metric name are replaced with
    /// underscores.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = sanitize_prefix(prefix);
        Self {
            active_channels: int_gauge(&prefix, "active_channels", "Proportional channels registered"),
            last_bundle_size: int_gauge(
                &prefix,
                "last_bundle_size",
                "Most recent size chosen by a learning bundler",
            ),
            feedback_total: int_counter(&prefix, "feedback_total", "Bundle outcomes recorded"),
            ignored_feedback_total: int_counter(
                &prefix,
                "ignored_feedback_total",
                "Bundle outcomes ignored",
            ),
            analysis_passes_total: int_counter(
                &prefix,
                "analysis_passes_total",
                "Annealing analysis passes",
            ),
            convergences_total: int_counter(
                &prefix,
                "convergences_total",
                "Annealing searches converged",
            ),
            drift_resets_total: int_counter(
                &prefix,
                "drift_resets_total",
                "Converged searches restarted after drift",
            ),
            states_restored_total: int_counter(
                &prefix,
                "states_restored_total",
                "Bundler states restored from persistence",
            ),
            states_stored_total: int_counter(
                &prefix,
                "states_stored_total",
                "Bundler states stored to persistence",
            ),
            persistence_errors_total: int_counter(
                &prefix,
                "persistence_errors_total",
                "Failed bundler state loads and stores",
            ),
        }
    }

    /// Register all metrics with a Registry for exposition.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate names).
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.active_channels.clone()))?;
        registry.register(Box::new(self.last_bundle_size.clone()))?;
        registry.register(Box::new(self.feedback_total.clone()))?;
        registry.register(Box::new(self.ignored_feedback_total.clone()))?;
        registry.register(Box::new(self.analysis_passes_total.clone()))?;
        registry.register(Box::new(self.convergences_total.clone()))?;
        registry.register(Box::new(self.drift_resets_total.clone()))?;
        registry.register(Box::new(self.states_restored_total.clone()))?;
        registry.register(Box::new(self.states_stored_total.clone()))?;
        registry.register(Box::new(self.persistence_errors_total.clone()))?;
        Ok(())
    }

    #[inline]
    pub fn record_feedback(&self) {
        self.feedback_total.inc();
    }

    #[inline]
    pub fn record_ignored_feedback(&self) {
        self.ignored_feedback_total.inc();
    }

    #[inline]
    pub fn record_analysis(&self) {
        self.analysis_passes_total.inc();
    }

    #[inline]
    pub fn record_convergence(&self) {
        self.convergences_total.inc();
    }

    #[inline]
    pub fn record_drift_reset(&self) {
        self.drift_resets_total.inc();
    }

    #[inline]
    pub fn record_state_restored(&self) {
        self.states_restored_total.inc();
    }

    #[inline]
    pub fn record_state_stored(&self) {
        self.states_stored_total.inc();
    }

    #[inline]
    pub fn record_persistence_error(&self) {
        self.persistence_errors_total.inc();
    }

    #[inline]
    pub fn channel_registered(&self) {
        self.active_channels.inc();
    }

    #[inline]
    pub fn channel_unregistered(&self) {
        self.active_channels.dec();
    }

    /// Update the last bundle size gauge.
    #[inline]
    pub fn set_last_size(&self, size: usize) {
        self.last_bundle_size
            .set(i64::try_from(size).unwrap_or(i64::MAX));
    }
}

// Valid chars: [a-zA-Z_:] for the first char, [a-zA-Z0-9_:] for the rest
fn sanitize_prefix(prefix: &str) -> String {
    prefix
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let valid = c == '_' || c == ':' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit());
            if valid {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn int_counter(prefix: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(format!("{prefix}_{name}"), help))
        .expect("metric creation should not fail")
}

fn int_gauge(prefix: &str, name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(format!("{prefix}_{name}"), help))
        .expect("metric creation should not fail")
}

impl std::fmt::Debug for BundlerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlerMetrics")
            .field("active_channels", &self.active_channels.get())
            .field("feedback_total", &self.feedback_total.get())
            .field("analysis_passes_total", &self.analysis_passes_total.get())
            .field("convergences_total", &self.convergences_total.get())
            .finish()
    }
}
