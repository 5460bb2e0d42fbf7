//! Fleet Simulation
//!
//! Simulates a driver dispatching a job queue to a heterogeneous fleet of
//! nodes with every load-balancing algorithm, and compares how many
//! simulated seconds each needs to drain the queue.
//!
//! Each node has a fixed round-trip overhead per bundle and a per-task cost.
//! Bundles are dispatched round-robin in virtual time: the node that becomes
//! free first takes the next bundle.
//!
//! Run: cargo run --example fleet_simulation --release
//! With logs: RUST_LOG=gridtune=debug cargo run --example fleet_simulation

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gridtune::{
    Algorithm, Bundler, BundlerArgs, BundlerFactoryBuilder, NodeCapabilityInfo, SharedCeiling,
};
use prometheus::Registry;
use tracing_subscriber::EnvFilter;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Parser, Debug)]
#[command(about = "Compare bundling algorithms on a simulated fleet")]
struct SimArgs {
    /// Tasks in the job queue
    #[arg(long, default_value_t = 200_000)]
    tasks: usize,

    /// Maximum bundle size (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    max_bundle: usize,

    /// Optional configuration file (TOML/YAML/JSON)
    #[arg(long)]
    config: Option<String>,

    #[command(flatten)]
    lb: BundlerArgs,
}

/// A simulated worker node.
#[derive(Clone, Copy, Debug)]
struct NodeSpec {
    name: &'static str,
    threads: i32,
    /// Fixed cost of one round-trip
    overhead: Duration,
    /// Cost of one task on one thread
    task_cost: Duration,
}

const FLEET: [NodeSpec; 4] = [
    NodeSpec {
        name: "fast-16",
        threads: 16,
        overhead: Duration::from_millis(20),
        task_cost: Duration::from_micros(800),
    },
    NodeSpec {
        name: "fast-8",
        threads: 8,
        overhead: Duration::from_millis(20),
        task_cost: Duration::from_micros(800),
    },
    NodeSpec {
        name: "slow-8",
        threads: 8,
        overhead: Duration::from_millis(40),
        task_cost: Duration::from_micros(2_500),
    },
    NodeSpec {
        name: "remote-4",
        threads: 4,
        overhead: Duration::from_millis(150),
        task_cost: Duration::from_micros(1_200),
    },
];

impl NodeSpec {
    /// Wall-clock time for the node to run `size` tasks on all its threads.
    fn execute(&self, size: usize) -> Duration {
        let threads = self.threads.max(1) as u32;
        let waves = (size as u32).div_ceil(threads);
        self.overhead + self.task_cost * waves
    }
}

// =============================================================================
// Simulation
// =============================================================================

struct Channel {
    spec: NodeSpec,
    bundler: Box<dyn Bundler>,
    /// Virtual time at which the node becomes free
    free_at: Duration,
    bundles: usize,
    tasks: usize,
}

struct Outcome {
    makespan: Duration,
    bundles: usize,
    per_node: Vec<(&'static str, usize)>,
}

fn simulate(
    args: &SimArgs,
    algorithm: Algorithm,
    registry: &Registry,
) -> Result<Outcome, Box<dyn std::error::Error>> {
    let ceiling = Arc::new(SharedCeiling::new(args.max_bundle, args.tasks));

    let mut builder = BundlerFactoryBuilder::new();
    if let Some(ref path) = args.config {
        builder = builder.file(path);
    }
    let factory = builder
        .env_prefix("GRIDTUNE")
        .algorithm(algorithm)
        .metrics_prefix(format!("sim_{}", algorithm))
        .with_cli_args(&args.lb)
        .prometheus_registry(registry.clone())
        .build(ceiling.clone())?;

    let mut channels: Vec<Channel> = FLEET
        .iter()
        .map(|spec| {
            let mut bundler = factory.new_bundler();
            if let Some(aware) = bundler.as_node_aware() {
                aware.set_node_capability(NodeCapabilityInfo::new(spec.threads));
            }
            Channel {
                spec: *spec,
                bundler,
                free_at: Duration::ZERO,
                bundles: 0,
                tasks: 0,
            }
        })
        .collect();

    let mut remaining = args.tasks;
    while remaining > 0 {
        let channel = channels
            .iter_mut()
            .min_by_key(|c| c.free_at)
            .ok_or("empty fleet")?;

        let size = channel.bundler.size().min(remaining);
        remaining -= size;
        ceiling.set_outstanding(remaining);

        let elapsed = channel.spec.execute(size);
        channel.free_at += elapsed;
        channel.bundles += 1;
        channel.tasks += size;
        channel.bundler.feedback(size, elapsed);
    }

    let makespan = channels
        .iter()
        .map(|c| c.free_at)
        .max()
        .unwrap_or_default();
    let bundles = channels.iter().map(|c| c.bundles).sum();
    let per_node = channels.iter().map(|c| (c.spec.name, c.tasks)).collect();
    for channel in &mut channels {
        channel.bundler.dispose();
    }

    Ok(Outcome {
        makespan,
        bundles,
        per_node,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = SimArgs::parse();
    let registry = Registry::new();

    println!("=== Fleet Simulation ===\n");
    println!("{} tasks, {} nodes\n", args.tasks, FLEET.len());
    println!(
        "| {:<12} | {:>12} | {:>8} | {} |",
        "algorithm", "makespan (s)", "bundles", "tasks per node"
    );
    println!("|{:-<14}|{:->14}|{:->10}|{:-<16}|", "", "", "", "");

    for algorithm in Algorithm::ALL {
        let outcome = simulate(&args, algorithm, &registry)?;
        let split: Vec<String> = outcome
            .per_node
            .iter()
            .map(|(name, tasks)| format!("{}={}", name, tasks))
            .collect();
        println!(
            "| {:<12} | {:>12.2} | {:>8} | {} |",
            algorithm.name(),
            outcome.makespan.as_secs_f64(),
            outcome.bundles,
            split.join(" ")
        );
    }

    let families = registry.gather();
    println!("\n{} metric families registered", families.len());
    Ok(())
}
