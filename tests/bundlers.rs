//! Integration tests for the bundler strategies through the public API.

use std::sync::Arc;
use std::time::Duration;

use gridtune::{
    Algorithm, AnnealingSearchBundler, BanditAdjustBundler, Bundler, BundlerContext,
    BundlerFactory, FixedCeiling, LoadBalancingConfig, NodeAwareBundler, NodeCapabilityInfo,
    ProportionalFairBundler, ProportionalGroup, QueueCeiling, Scope, SharedBundlerState,
    SharedCeiling, SharedDelegatingBundler, StaticCapacityBundler, TuningProfile,
};

/// Per-task cost with a single minimum at `optimum`.
fn elapsed_for(size: usize, optimum: usize) -> Duration {
    let x = (size as f64 - optimum as f64) / optimum as f64;
    let per_task_ns = 1_000_000.0 * (1.0 + x * x);
    Duration::from_nanos((per_task_ns * size as f64) as u64)
}

fn annealing(profile: TuningProfile, ceiling: usize) -> AnnealingSearchBundler {
    AnnealingSearchBundler::new(
        Arc::new(profile),
        BundlerContext::new(Arc::new(FixedCeiling(ceiling))),
    )
}

fn search_profile(seed: u64) -> TuningProfile {
    TuningProfile::new()
        .with_initial_size(5)
        .with_min_samples_to_analyse(20)
        .with_max_guesses(200)
        .with_seed(seed)
}

fn run_until_converged(b: &mut AnnealingSearchBundler, optimum: usize) {
    for _ in 0..50_000 {
        if b.is_converged() {
            return;
        }
        let size = b.size();
        b.feedback(size, elapsed_for(size, optimum));
    }
}

/// Every strategy, fed arbitrary outcomes, stays within [1, max].
#[test]
fn test_all_strategies_clamp_sizes() {
    for ceiling in [0usize, 1, 7] {
        let config = LoadBalancingConfig {
            profile: TuningProfile::new()
                .with_initial_size(50)
                .with_min_samples_to_analyse(10)
                .with_seed(17),
            ..LoadBalancingConfig::new()
        };
        let factory = BundlerFactory::new(config, Arc::new(FixedCeiling(ceiling))).unwrap();
        let max = if ceiling == 0 { usize::MAX } else { ceiling };

        for algorithm in Algorithm::ALL {
            let mut bundler = factory.create(algorithm);
            if let Some(aware) = bundler.as_node_aware() {
                aware.set_node_capability(NodeCapabilityInfo::new(64));
            }
            for i in 0..300u64 {
                let size = bundler.size();
                assert!(
                    size >= 1 && size <= max,
                    "{} returned {} with ceiling {}",
                    algorithm,
                    size,
                    ceiling
                );
                bundler.feedback(size, Duration::from_micros(100 + (i * 37) % 900));
            }
        }
    }
}

#[test]
fn test_annealing_converges_and_stays() {
    let mut b = annealing(search_profile(2024), 0);
    run_until_converged(&mut b, 30);
    assert!(b.is_converged());
    let converged = b.size();
    assert!((28..=32).contains(&converged), "converged to {}", converged);

    for _ in 0..2_000 {
        b.feedback(converged, elapsed_for(converged, 30));
        assert_eq!(b.size(), converged);
    }
}

#[test]
fn test_per_channel_instances_are_independent() {
    let mut small = annealing(search_profile(1), 0);
    let mut large = annealing(search_profile(1), 0);
    run_until_converged(&mut small, 10);
    run_until_converged(&mut large, 60);

    assert!(small.is_converged() && large.is_converged());
    assert!((9..=11).contains(&small.size()), "small = {}", small.size());
    assert!((57..=63).contains(&large.size()), "large = {}", large.size());
}

/// minSamplesToAnalyse = 50 fed with (10 tasks, 100ms) bundles.
#[test]
fn test_threshold_scenario() {
    let mut b = annealing(
        TuningProfile::new()
            .with_initial_size(10)
            .with_min_samples_to_analyse(50)
            .with_max_guesses(0),
        0,
    );
    let mut fed = 0;
    while b.samples().get(&10).map_or(0, |s| s.sample_count) <= 50 && !b.is_converged() {
        b.feedback(10, Duration::from_millis(100));
        fed += 1;
    }
    assert_eq!(fed, 6);
    assert_eq!(b.analysis_passes(), 1);
    assert!(b.is_converged());
    assert!(b.samples().len() <= 1);
}

#[test]
fn test_proportional_split_ratio() {
    let group = Arc::new(ProportionalGroup::new());
    let ceiling: Arc<dyn QueueCeiling> = Arc::new(SharedCeiling::new(0, 900));
    let profile = Arc::new(TuningProfile::new().with_proportionality_factor(1.5));
    let mut fast = ProportionalFairBundler::new(
        Arc::clone(&profile),
        BundlerContext::new(Arc::clone(&ceiling)),
        Arc::clone(&group),
    );
    let mut slow = ProportionalFairBundler::new(profile, BundlerContext::new(ceiling), group);

    for _ in 0..20 {
        fast.feedback(10, Duration::from_millis(20)); // t1 = 2ms
        slow.feedback(10, Duration::from_millis(50)); // t2 = 5ms
    }

    let (s1, s2) = (fast.size() as f64, slow.size() as f64);
    let expected = (5.0f64 / 2.0).powf(1.5);
    assert!((s1 / s2 - expected).abs() < 0.05, "ratio {} vs {}", s1 / s2, expected);
    assert!((s1 + s2 - 900.0).abs() <= 1.0);
}

#[test]
fn test_proportional_unbounded_ceiling_tracks_dispatched_sizes() {
    let factory =
        BundlerFactory::new(LoadBalancingConfig::new(), Arc::new(FixedCeiling(0))).unwrap();
    let mut a = factory.new_bundler();
    let mut b = factory.new_bundler();
    for _ in 0..100 {
        a.feedback(10, Duration::from_millis(10));
        b.feedback(10, Duration::from_millis(30));
    }
    assert!(a.size() > 1);
    assert!(b.size() > 1);
    assert!(a.size() > b.size());
    assert!(a.size() + b.size() <= 21);
}

#[test]
fn test_proportional_channels_fed_concurrently() {
    const CHANNELS: usize = 4;
    const ROUNDS: usize = 200;
    const BUDGET: usize = 1000;

    let group = Arc::new(ProportionalGroup::new());
    let ceiling: Arc<dyn QueueCeiling> = Arc::new(SharedCeiling::new(0, BUDGET));
    let profile = Arc::new(TuningProfile::new().with_min_samples_to_analyse(10_000));
    let mut bundlers: Vec<ProportionalFairBundler> = (0..CHANNELS)
        .map(|_| {
            ProportionalFairBundler::new(
                Arc::clone(&profile),
                BundlerContext::new(Arc::clone(&ceiling)),
                Arc::clone(&group),
            )
        })
        .collect();

    std::thread::scope(|s| {
        for (i, b) in bundlers.iter_mut().enumerate() {
            s.spawn(move || {
                let bundle = i + 1;
                for round in 0..ROUNDS {
                    b.feedback(bundle, Duration::from_millis((bundle * (i + 1)) as u64));
                    if round % 3 == 0 {
                        let size = b.size();
                        assert!((1..=BUDGET).contains(&size), "size {size}");
                    }
                }
            });
        }
    });

    for (i, b) in bundlers.iter().enumerate() {
        assert_eq!(group.channel_weight(b.id()), ROUNDS * (i + 1));
    }
    let sizes: Vec<usize> = bundlers.iter().map(|b| b.size()).collect();
    let total: usize = sizes.iter().sum();
    assert!(total.abs_diff(BUDGET) <= CHANNELS, "sizes {sizes:?}");
    // Slower channels get less
    assert!(sizes.windows(2).all(|w| w[0] > w[1]), "sizes {sizes:?}");
}

#[test]
fn test_static_capacity_ignores_feedback() {
    let mut b = StaticCapacityBundler::new(
        Arc::new(TuningProfile::new()),
        BundlerContext::new(Arc::new(FixedCeiling(0))),
    );
    b.set_node_capability(NodeCapabilityInfo::new(12));
    for size in 1..100 {
        b.feedback(size, elapsed_for(size, 3));
        assert_eq!(b.size(), 12);
    }
}

#[test]
fn test_shared_wrappers_are_coupled() {
    let state = Arc::new(SharedBundlerState::new(Box::new(BanditAdjustBundler::new(
        Arc::new(TuningProfile::new().with_initial_size(20).with_seed(4)),
        BundlerContext::new(Arc::new(FixedCeiling(0))),
    ))));
    let mut a = SharedDelegatingBundler::new(Arc::clone(&state));
    let b = a.copy();

    let before = b.size();
    let mut changed = false;
    for _ in 0..50 {
        let size = a.size();
        a.feedback(size, elapsed_for(size, 5));
        if b.size() != before {
            changed = true;
            break;
        }
    }
    assert!(changed, "feedback through one wrapper never reached the other");
    assert_eq!(a.size(), b.size());
}

/// Concurrent feedback through shared wrappers loses no updates.
#[test]
fn test_concurrent_shared_feedback_loses_nothing() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 250;
    const TASKS: usize = 3;

    let group = Arc::new(ProportionalGroup::new());
    let inner = ProportionalFairBundler::new(
        Arc::new(TuningProfile::new().with_min_samples_to_analyse(1_000_000)),
        BundlerContext::new(Arc::new(FixedCeiling(0))),
        Arc::clone(&group),
    );
    let state = Arc::new(SharedBundlerState::new(Box::new(inner)));
    let channel = state.inner_id();

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            let mut wrapper = SharedDelegatingBundler::new(Arc::clone(&state));
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    let _ = wrapper.size();
                    wrapper.feedback(TASKS, Duration::from_micros(30));
                }
            });
        }
    });

    assert_eq!(group.channel_weight(channel), THREADS * ROUNDS * TASKS);
    let mean = group.channel_mean(channel).unwrap();
    assert!((mean - 10_000.0).abs() < 1e-6);
}

#[test]
fn test_global_factory_hands_out_coupled_wrappers() {
    let config = LoadBalancingConfig {
        algorithm: Algorithm::Autotuned,
        scope: Scope::Global,
        profile: TuningProfile::new()
            .with_initial_size(10)
            .with_min_samples_to_analyse(50)
            .with_seed(8),
        ..LoadBalancingConfig::new()
    };
    let factory = BundlerFactory::new(config, Arc::new(FixedCeiling(0))).unwrap();
    let mut a = factory.new_bundler();
    let b = factory.new_bundler();

    for _ in 0..6 {
        a.feedback(10, Duration::from_millis(100));
    }
    assert_ne!(b.size(), 10);
    assert_eq!(factory.metrics().analysis_passes_total.get(), 1);
}

#[test]
fn test_raw_feedback_rejects_invalid_input() {
    let mut b = annealing(TuningProfile::new().with_min_samples_to_analyse(1), 0);
    b.feedback_raw(0, 1_000);
    b.feedback_raw(-4, 1_000);
    b.feedback_raw(4, -1);
    assert!(b.samples().is_empty());

    b.feedback_raw(4, 4_000);
    assert_eq!(b.samples()[&4].sample_count, 4);
}
