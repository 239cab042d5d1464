//! servesim: discrete-event simulator for LLM serving engines.
//!
//! Replays a workload (CSV trace or seeded synthetic traffic) against a
//! simulated serving cluster and writes a JSON metrics report.

use clap::Parser;
use tracing::info;

use servesim::config::{Cli, SimConfig};
use servesim::sim::cluster::ClusterSimulator;
use servesim::sim::instance::InstanceSimulator;
use servesim::workload::{synth, trace};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "servesim=debug"
    } else {
        "servesim=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("servesim v{}", env!("CARGO_PKG_VERSION"));

    // Load the bundle, then let flags override it.
    let mut config = match &cli.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    config.apply_cli(&cli);
    config.validate()?;

    info!(
        instances = config.cluster.instances,
        routing = ?config.routing.policy,
        admission = ?config.admission.policy,
        scheduler = ?config.scheduler,
        total_blocks = config.kv_cache.total_blocks,
        block_size = config.kv_cache.block_size_tokens,
        fast_tier_tokens = config.kv_cache.fast_tier_tokens(),
        "configuration loaded"
    );

    let workload = match &cli.workload {
        Some(path) => trace::read_trace(path)?,
        None => synth::generate(&config.workload, config.seed)?,
    };
    info!(requests = workload.len(), seed = config.seed, "workload ready");

    let report = if config.cluster.instances > 1 {
        ClusterSimulator::new(&config)?
            .include_requests(cli.include_requests)
            .run(workload)
    } else {
        InstanceSimulator::new(&config)?
            .include_requests(cli.include_requests)
            .run(workload)
    };

    info!(
        completed = report.completed,
        dropped = report.dropped_unservable,
        rejected = report.rejected,
        duration_s = report.sim_ended_time_s,
        "simulation finished"
    );

    let json = report.to_json()?;
    match &cli.output {
        Some(path) => std::fs::write(path, json.as_bytes())?,
        None => println!("{json}"),
    }

    Ok(())
}
