//! Creation of bundlers from a load-balancing configuration.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use crate::bundler::{
    Algorithm, AnnealingSearchBundler, BanditAdjustBundler, Bundler, BundlerContext,
    FixedSizeBundler, ProportionalFairBundler, ProportionalGroup, QueueCeiling,
    SharedBundlerState, SharedDelegatingBundler, StaticCapacityBundler, TuningProfile,
};
use crate::config::{LoadBalancingConfig, Scope};
use crate::error::Result;
use crate::metrics::BundlerMetrics;
use crate::persistence::{
    algorithm_hash, restore_from, FileLoadBalancerPersistence, LoadBalancerPersistence,
    PersistentBundler, StateKey, GLOBAL_CHANNEL,
};

/// Creates the bundler of each new channel.
///
/// Owns what cooperating bundlers share: the tuning profile, the queue
/// ceiling, the metrics, the proportional channel group, the state store,
/// and in global scope the single shared bundler. Usually obtained from
/// [`BundlerFactoryBuilder`](crate::BundlerFactoryBuilder).
pub struct BundlerFactory {
    config: LoadBalancingConfig,
    profile: Arc<TuningProfile>,
    ceiling: Arc<dyn QueueCeiling>,
    metrics: BundlerMetrics,
    group: Arc<ProportionalGroup>,
    shared: OnceLock<Arc<SharedBundlerState>>,
    persistence: Option<Arc<dyn LoadBalancerPersistence>>,
    hashes: HashMap<Algorithm, String>,
}

impl BundlerFactory {
    /// Create a factory with standalone metrics.
    ///
    /// A file state store is set up when the configuration names a
    /// `persistence_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BundlerError::InvalidProfile`](crate::BundlerError::InvalidProfile)
    /// if the profile has out-of-range knobs.
    pub fn new(config: LoadBalancingConfig, ceiling: Arc<dyn QueueCeiling>) -> Result<Self> {
        let metrics = BundlerMetrics::with_prefix(&config.metrics_prefix);
        Self::with_parts(config, ceiling, metrics, None)
    }

    pub(crate) fn with_parts(
        config: LoadBalancingConfig,
        ceiling: Arc<dyn QueueCeiling>,
        metrics: BundlerMetrics,
        persistence: Option<Arc<dyn LoadBalancerPersistence>>,
    ) -> Result<Self> {
        config.profile.validate()?;
        let persistence = persistence.or_else(|| {
            config.persistence_dir.as_ref().map(|dir| {
                Arc::new(FileLoadBalancerPersistence::new(dir)) as Arc<dyn LoadBalancerPersistence>
            })
        });
        info!(
            algorithm = %config.algorithm,
            scope = ?config.scope,
            initial_size = config.profile.initial_size,
            persistence = persistence.is_some(),
            "bundler factory configured"
        );
        Ok(Self {
            profile: Arc::new(config.profile.clone()),
            config,
            ceiling,
            metrics,
            group: Arc::new(ProportionalGroup::new()),
            shared: OnceLock::new(),
            persistence,
            hashes: Algorithm::ALL
                .into_iter()
                .map(|a| (a, algorithm_hash(a)))
                .collect(),
        })
    }

    /// Use `store` for learned state, replacing any configured store.
    pub fn with_persistence(mut self, store: Arc<dyn LoadBalancerPersistence>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Names accepted for the `algorithm` setting.
    pub fn algorithm_names() -> Vec<&'static str> {
        Algorithm::ALL.iter().map(Algorithm::name).collect()
    }

    /// Identifier of `algorithm` in the state store.
    pub fn algorithm_hash(&self, algorithm: Algorithm) -> &str {
        self.hashes
            .get(&algorithm)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Algorithm whose state store identifier is `hash`.
    pub fn algorithm_from_hash(&self, hash: &str) -> Option<Algorithm> {
        self.hashes
            .iter()
            .find(|(_, h)| h.as_str() == hash)
            .map(|(a, _)| *a)
    }

    pub fn config(&self) -> &LoadBalancingConfig {
        &self.config
    }

    /// Metrics every bundler of this factory reports into.
    pub fn metrics(&self) -> &BundlerMetrics {
        &self.metrics
    }

    /// Channel table of the proportional bundlers created by this factory.
    pub fn proportional_group(&self) -> &Arc<ProportionalGroup> {
        &self.group
    }

    /// Store of learned bundler state, if persistence is enabled.
    pub fn persistence(&self) -> Option<&Arc<dyn LoadBalancerPersistence>> {
        self.persistence.as_ref()
    }

    /// Bundler for a new channel, per the configured algorithm and scope.
    ///
    /// In global scope every call returns a handle on the same underlying
    /// bundler, which is created on first use. The bundler is not tied to a
    /// channel identity, so its state is not persisted; see
    /// [`new_channel_bundler`](Self::new_channel_bundler).
    pub fn new_bundler(&self) -> Box<dyn Bundler> {
        match self.config.scope {
            Scope::PerNode => self.create(self.config.algorithm),
            Scope::Global => Box::new(SharedDelegatingBundler::new(Arc::clone(self.shared_state()))),
        }
    }

    /// Bundler for the channel identified by `channel`.
    ///
    /// With persistence enabled, a per-node bundler resumes from the state
    /// stored for this channel and algorithm, and stores its state when
    /// disposed. In global scope the shared bundler is restored once, when
    /// it is created, and every handle stores the shared state when disposed.
    pub fn new_channel_bundler(&self, channel: &str) -> Box<dyn Bundler> {
        let Some(store) = self.persistence.as_ref() else {
            return self.new_bundler();
        };
        let algorithm = self.config.algorithm;
        match self.config.scope {
            Scope::PerNode => {
                let key = self.state_key(channel, algorithm);
                let mut bundler = PersistentBundler::new(
                    self.create(algorithm),
                    key,
                    Arc::clone(store),
                    self.metrics.clone(),
                );
                bundler.load();
                Box::new(bundler)
            }
            Scope::Global => Box::new(PersistentBundler::new(
                self.new_bundler(),
                self.state_key(GLOBAL_CHANNEL, algorithm),
                Arc::clone(store),
                self.metrics.clone(),
            )),
        }
    }

    fn state_key(&self, channel: &str, algorithm: Algorithm) -> StateKey {
        StateKey {
            channel: channel.to_owned(),
            algorithm: self.algorithm_hash(algorithm).to_owned(),
        }
    }

    fn shared_state(&self) -> &Arc<SharedBundlerState> {
        self.shared.get_or_init(|| {
            debug!(algorithm = %self.config.algorithm, "creating shared bundler");
            let mut inner = self.create(self.config.algorithm);
            if let Some(store) = self.persistence.as_ref() {
                let key = self.state_key(GLOBAL_CHANNEL, self.config.algorithm);
                restore_from(inner.as_mut(), &key, store.as_ref(), &self.metrics);
            }
            Arc::new(SharedBundlerState::new(inner))
        })
    }

    /// Independent bundler of the given algorithm, ignoring the scope.
    pub fn create(&self, algorithm: Algorithm) -> Box<dyn Bundler> {
        let profile = Arc::clone(&self.profile);
        let ctx = self.context();
        match algorithm {
            Algorithm::Manual => Box::new(FixedSizeBundler::new(profile, ctx)),
            Algorithm::NodeThreads => Box::new(StaticCapacityBundler::new(profile, ctx)),
            Algorithm::Proportional => Box::new(ProportionalFairBundler::new(
                profile,
                ctx,
                Arc::clone(&self.group),
            )),
            Algorithm::Autotuned => Box::new(AnnealingSearchBundler::new(profile, ctx)),
            Algorithm::Rl => Box::new(BanditAdjustBundler::new(profile, ctx)),
        }
    }

    /// Independent bundler of the algorithm called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BundlerError::UnknownAlgorithm`](crate::BundlerError::UnknownAlgorithm)
    /// if `name` is not one of [`algorithm_names`](Self::algorithm_names).
    pub fn create_by_name(&self, name: &str) -> Result<Box<dyn Bundler>> {
        Ok(self.create(name.parse()?))
    }

    /// Bundler handing out one task at a time, for channels the configured
    /// algorithm cannot serve.
    pub fn fallback_bundler(&self) -> Box<dyn Bundler> {
        Box::new(FixedSizeBundler::new(
            Arc::new(TuningProfile::new().with_initial_size(1)),
            self.context(),
        ))
    }

    fn context(&self) -> BundlerContext {
        BundlerContext::with_metrics(Arc::clone(&self.ceiling), self.metrics.clone())
    }
}

impl std::fmt::Debug for BundlerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlerFactory")
            .field("algorithm", &self.config.algorithm)
            .field("scope", &self.config.scope)
            .field("max_size", &self.ceiling.current_ceiling())
            .field("shared", &self.shared.get().is_some())
            .field("persistence", &self.persistence)
            .finish()
    }
}
