//! Builder pattern for constructing bundler factories.
//!
//! The builder supports multiple configuration sources using figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap

use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use prometheus::Registry;

use crate::bundler::{Algorithm, QueueCeiling, TuningProfile};
use crate::config::{LoadBalancingConfig, Scope};
use crate::error::Result;
use crate::factory::BundlerFactory;
use crate::metrics::BundlerMetrics;
use crate::persistence::LoadBalancerPersistence;

/// Builder for constructing a [`BundlerFactory`].
///
/// Configuration sources are merged in the following order (later sources override earlier):
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides
/// 5. CLI arguments
///
/// # Examples
///
/// ```ignore
/// use gridtune::{Algorithm, BundlerFactoryBuilder, FixedCeiling};
///
/// let factory = BundlerFactoryBuilder::new()
///     .file("gridtune.toml")
///     .env_prefix("GRIDTUNE")
///     .algorithm(Algorithm::Autotuned)
///     .build(Arc::new(FixedCeiling(0)))?;
/// ```
pub struct BundlerFactoryBuilder {
    figment: Figment,
    prometheus_registry: Option<Registry>,
    persistence: Option<Arc<dyn LoadBalancerPersistence>>,
}

impl Default for BundlerFactoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BundlerFactoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlerFactoryBuilder")
            .field("figment", &self.figment)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl BundlerFactoryBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(LoadBalancingConfig::default())),
            prometheus_registry: None,
            persistence: None,
        }
    }

    /// Add a configuration file.
    ///
    /// Supports TOML, YAML, and JSON formats (detected by extension, TOML
    /// otherwise). Files are merged in the order they are added. A missing
    /// file contributes nothing.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => self.figment.merge(Toml::file(path)),
        };
        self
    }

    /// Add environment variables with a prefix.
    ///
    /// Variables are expected as `{PREFIX}_{KEY}`, with `__` separating
    /// nested keys, e.g. `GRIDTUNE_ALGORITHM` or
    /// `GRIDTUNE_PROFILE__INITIAL_SIZE`.
    ///
    /// # Arguments
    ///
    /// * `prefix` - The environment variable prefix (without trailing underscore)
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.figment = self
            .figment
            .merge(Env::prefixed(&format!("{prefix}_")).split("__"));
        self
    }

    /// Set the load-balancing algorithm.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("algorithm", algorithm));
        self
    }

    /// Set the bundler sharing scope.
    pub fn scope(mut self, scope: Scope) -> Self {
        self.figment = self.figment.merge(Serialized::default("scope", scope));
        self
    }

    /// Replace the whole tuning profile.
    pub fn profile(mut self, profile: TuningProfile) -> Self {
        self.figment = self.figment.merge(Serialized::default("profile", profile));
        self
    }

    /// Set the starting bundle size.
    pub fn initial_size(mut self, size: usize) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("profile.initial_size", size));
        self
    }

    /// Seed the random number generators of learning bundlers.
    pub fn seed(mut self, seed: u64) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("profile.seed", seed));
        self
    }

    /// Set the prefix of the Prometheus metric names.
    pub fn metrics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("metrics_prefix", prefix.into()));
        self
    }

    /// Persist learned bundler state as files under `dir`.
    pub fn persistence_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("persistence_dir", dir.as_ref().to_path_buf()));
        self
    }

    /// Persist learned bundler state in a custom store.
    ///
    /// Takes precedence over `persistence_dir` from any source.
    pub fn persistence(mut self, store: Arc<dyn LoadBalancerPersistence>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Provide an external Prometheus registry for metrics exposition.
    ///
    /// When a registry is provided, the factory's metrics are registered
    /// and available for Prometheus scraping.
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Apply CLI argument overrides.
    ///
    /// This method applies any non-None values from the `BundlerArgs` struct.
    pub fn with_cli_args(mut self, args: &BundlerArgs) -> Self {
        if let Some(ref algorithm) = args.lb_algorithm {
            // Serde names are lowercase
            self.figment = self.figment.merge(Serialized::default(
                "algorithm",
                algorithm.trim().to_lowercase(),
            ));
        }
        if let Some(scope) = args.lb_scope {
            self.figment = self.figment.merge(Serialized::default("scope", scope));
        }
        if let Some(size) = args.lb_initial_size {
            self.figment = self
                .figment
                .merge(Serialized::default("profile.initial_size", size));
        }
        if let Some(samples) = args.lb_min_samples {
            self.figment = self
                .figment
                .merge(Serialized::default("profile.min_samples_to_analyse", samples));
        }
        if let Some(seed) = args.lb_seed {
            self.figment = self
                .figment
                .merge(Serialized::default("profile.seed", seed));
        }
        if let Some(ref dir) = args.lb_persistence_dir {
            self.figment = self
                .figment
                .merge(Serialized::default("persistence_dir", dir.clone()));
        }
        self
    }

    /// Extract the merged configuration without building a factory.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed or a value has the wrong type,
    /// including unknown algorithm names.
    pub fn extract(&self) -> Result<LoadBalancingConfig> {
        Ok(self.figment.extract().map_err(Box::new)?)
    }

    /// Build the factory.
    ///
    /// `ceiling` supplies the driver-wide maximum bundle size and the number
    /// of outstanding tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration extraction fails
    /// - The tuning profile is invalid
    /// - Metrics cannot be registered with the provided registry
    pub fn build(self, ceiling: Arc<dyn QueueCeiling>) -> Result<BundlerFactory> {
        let config = self.extract()?;
        let metrics = BundlerMetrics::with_prefix(&config.metrics_prefix);
        if let Some(ref registry) = self.prometheus_registry {
            metrics.register(registry)?;
        }
        BundlerFactory::with_parts(config, ceiling, metrics, self.persistence)
    }
}

/// CLI arguments for load-balancing configuration.
///
/// Use with clap's `Parser` derive macro. These arguments can be applied
/// to a `BundlerFactoryBuilder` using `with_cli_args`.
///
/// # Examples
///
/// ```ignore
/// use clap::Parser;
/// use gridtune::{BundlerArgs, BundlerFactoryBuilder};
///
/// #[derive(Parser)]
/// struct DriverArgs {
///     #[command(flatten)]
///     lb: BundlerArgs,
///     // ... other args
/// }
///
/// let args = DriverArgs::parse();
/// let factory = BundlerFactoryBuilder::new()
///     .with_cli_args(&args.lb)
///     .build(ceiling)?;
/// ```
#[derive(Debug, Default, Clone, clap::Args)]
pub struct BundlerArgs {
    /// Load-balancing algorithm (autotuned, manual, nodethreads, proportional, rl)
    #[arg(long)]
    pub lb_algorithm: Option<String>,

    /// Share one bundler across all channels (global) or not (node)
    #[arg(long, value_enum)]
    pub lb_scope: Option<Scope>,

    /// Starting bundle size
    #[arg(long)]
    pub lb_initial_size: Option<usize>,

    /// Task weight a size must accumulate before it is analysed
    #[arg(long)]
    pub lb_min_samples: Option<u64>,

    /// RNG seed for reproducible runs
    #[arg(long)]
    pub lb_seed: Option<u64>,

    /// Directory where learned bundler state is persisted
    #[arg(long)]
    pub lb_persistence_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::FixedCeiling;
    use crate::error::BundlerError;
    use figment::Jail;

    fn ceiling() -> Arc<dyn QueueCeiling> {
        Arc::new(FixedCeiling(0))
    }

    #[test]
    fn test_builder_defaults() {
        let config = BundlerFactoryBuilder::new().extract().unwrap();
        assert_eq!(config, LoadBalancingConfig::default());
    }

    #[test]
    fn test_builder_programmatic_override() {
        let config = BundlerFactoryBuilder::new()
            .algorithm(Algorithm::Rl)
            .scope(Scope::Global)
            .initial_size(12)
            .seed(42)
            .extract()
            .unwrap();

        assert_eq!(config.algorithm, Algorithm::Rl);
        assert_eq!(config.scope, Scope::Global);
        assert_eq!(config.profile.initial_size, 12);
        assert_eq!(config.profile.seed, Some(42));
        // Nested override keeps sibling knobs
        assert_eq!(config.profile.min_samples_to_analyse, 500);
    }

    #[test]
    fn test_builder_cli_args() {
        let args = BundlerArgs {
            lb_algorithm: Some("Autotuned".to_string()),
            lb_scope: Some(Scope::Global),
            lb_initial_size: Some(3),
            lb_min_samples: Some(64),
            lb_seed: None,
            lb_persistence_dir: Some(PathBuf::from("lb_state")),
        };

        let config = BundlerFactoryBuilder::new()
            .algorithm(Algorithm::Manual)
            .initial_size(20)
            .with_cli_args(&args)
            .extract()
            .unwrap();

        // CLI args should override programmatic values
        assert_eq!(config.algorithm, Algorithm::Autotuned);
        assert_eq!(config.scope, Scope::Global);
        assert_eq!(config.profile.initial_size, 3);
        assert_eq!(config.profile.min_samples_to_analyse, 64);
        assert_eq!(config.profile.seed, None);
        assert_eq!(config.persistence_dir, Some(PathBuf::from("lb_state")));
    }

    #[test]
    fn test_builder_partial_cli_args() {
        let args = BundlerArgs {
            lb_seed: Some(9),
            ..Default::default()
        };

        let config = BundlerFactoryBuilder::new()
            .algorithm(Algorithm::Manual)
            .with_cli_args(&args)
            .extract()
            .unwrap();

        assert_eq!(config.algorithm, Algorithm::Manual);
        assert_eq!(config.profile.seed, Some(9));
    }

    #[test]
    fn test_unknown_algorithm_fails_build() {
        let args = BundlerArgs {
            lb_algorithm: Some("simplex".to_string()),
            ..Default::default()
        };
        let err = BundlerFactoryBuilder::new()
            .with_cli_args(&args)
            .build(ceiling())
            .unwrap_err();
        assert!(matches!(err, BundlerError::Config(_)));
    }

    #[test]
    fn test_invalid_profile_fails_build() {
        let err = BundlerFactoryBuilder::new()
            .initial_size(0)
            .build(ceiling())
            .unwrap_err();
        assert!(matches!(err, BundlerError::InvalidProfile(_)));
    }

    #[test]
    fn test_file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gridtune.toml",
                r#"
                    algorithm = "autotuned"
                    scope = "global"

                    [profile]
                    initial_size = 8
                    min_samples_to_analyse = 200
                "#,
            )?;
            jail.set_env("GRIDTUNE_ALGORITHM", "rl");
            jail.set_env("GRIDTUNE_PROFILE__MIN_SAMPLES_TO_ANALYSE", "64");

            let config = BundlerFactoryBuilder::new()
                .file("gridtune.toml")
                .env_prefix("GRIDTUNE")
                .extract()
                .map_err(|e| e.to_string())?;

            assert_eq!(config.algorithm, Algorithm::Rl);
            assert_eq!(config.scope, Scope::Global);
            assert_eq!(config.profile.initial_size, 8);
            assert_eq!(config.profile.min_samples_to_analyse, 64);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_and_json_files() {
        Jail::expect_with(|jail| {
            jail.create_file("lb.yaml", "algorithm: manual\nprofile:\n  initial_size: 4\n")?;
            jail.create_file("lb.json", r#"{ "profile": { "initial_size": 6 } }"#)?;

            let config = BundlerFactoryBuilder::new()
                .file("lb.yaml")
                .file("lb.json")
                .extract()
                .map_err(|e| e.to_string())?;

            assert_eq!(config.algorithm, Algorithm::Manual);
            assert_eq!(config.profile.initial_size, 6);
            Ok(())
        });
    }

    #[test]
    fn test_persistence_dir_from_env_builds_file_store() {
        Jail::expect_with(|jail| {
            jail.set_env("GRIDTUNE_PERSISTENCE_DIR", "lb_state");

            let factory = BundlerFactoryBuilder::new()
                .env_prefix("GRIDTUNE")
                .build(ceiling())
                .map_err(|e| e.to_string())?;

            assert_eq!(factory.config().persistence_dir, Some(PathBuf::from("lb_state")));
            assert!(factory.persistence().is_some());
            Ok(())
        });
    }

    #[test]
    fn test_no_persistence_by_default() {
        let factory = BundlerFactoryBuilder::new().build(ceiling()).unwrap();
        assert!(factory.persistence().is_none());
    }

    #[test]
    fn test_build_registers_metrics() {
        let registry = Registry::new();
        let factory = BundlerFactoryBuilder::new()
            .metrics_prefix("driver")
            .prometheus_registry(registry.clone())
            .build(ceiling())
            .unwrap();
        factory.metrics().record_feedback();

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "driver_feedback_total"));

        // Same names twice in one registry
        let err = BundlerFactoryBuilder::new()
            .metrics_prefix("driver")
            .prometheus_registry(registry)
            .build(ceiling())
            .unwrap_err();
        assert!(matches!(err, BundlerError::Metrics(_)));
    }
}
