//! TDIMM simulator
//!
//! Builds a set of simulated devices with one engine each, optionally
//! assembles them into a RAID set and runs a verified random workload.

mod config;
mod workload;

use anyhow::{Context, Result, bail};
use clap::Parser;
use config::Config;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tdimm_common::RaidConfig;
use tdimm_engine::{
    DevGroup, Engine, EngineWorkItem, FaultKind, FaultRule, FaultTarget, RunState, SimControl,
    SimCounters, SimHal, StatsSnapshot,
};
use tdimm_raid::{MemberDevice, RaidDevice, StrategyRegistry};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workload::WorkloadReport;

#[derive(Parser, Debug)]
#[command(name = "tdimm-sim")]
#[command(about = "TDIMM engine simulator")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tdimm-sim.toml")]
    config: PathBuf,

    /// Number of simulated devices
    #[arg(long)]
    engines: Option<usize>,

    /// Requests to issue per target
    #[arg(long)]
    requests: Option<u64>,

    /// Assemble the devices into a RAID set of this level
    #[arg(long)]
    raid: Option<String>,

    /// RAID stripe size in sectors
    #[arg(long)]
    stride: Option<u32>,

    /// Workload seed
    #[arg(long)]
    seed: Option<u64>,

    /// Copies of each write-side command (1 or 2)
    #[arg(long)]
    sec_copies: Option<u8>,

    /// Retryable faults injected per device
    #[arg(long)]
    faults: Option<u32>,

    /// Log level
    #[arg(long, env = "TDIMM_LOG")]
    log_level: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct EngineReport {
    name: String,
    state: RunState,
    stats: StatsSnapshot,
    device: SimCounters,
}

#[derive(Debug, Serialize)]
struct RaidReport {
    name: String,
    level: &'static str,
    state: String,
    width: usize,
}

#[derive(Debug, Serialize)]
struct Report {
    engines: Vec<EngineReport>,
    raid: Option<RaidReport>,
    workloads: Vec<WorkloadReport>,
}

struct SimDevice {
    item: Arc<EngineWorkItem>,
    control: SimControl,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    apply_overrides(&mut config, &args);

    let level = config.logging.level.clone();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(
        "starting {} engines of {} MiB, {} requests",
        config.sim.engines, config.sim.capacity_mb, config.workload.requests
    );
    config
        .engine
        .validate()
        .context("invalid engine configuration")?;

    let mut group = DevGroup::new(
        "tdimm",
        config.workload.workers,
        Duration::from_micros(config.workload.poll_interval_us.max(1)),
    )
    .context("failed to start device group")?;

    let devices = build_devices(&config, &group)?;
    let seed = config.workload.seed.unwrap_or_else(|| rand::thread_rng().r#gen());
    info!("workload seed {}", seed);

    let mut workloads = Vec::new();
    let raid = match config.raid.clone() {
        Some(raid_config) => {
            let raid = assemble(raid_config, &devices)?;
            workloads.push(workload::run(&raid, &config.workload, seed)?);
            Some(RaidReport {
                name: raid.name().to_string(),
                level: raid.level(),
                state: raid.state().to_string(),
                width: raid.width(),
            })
        }
        None => {
            for (i, device) in devices.iter().enumerate() {
                let target = device.item.handle();
                workloads.push(workload::run(target, &config.workload, seed.wrapping_add(i as u64))?);
            }
            None
        }
    };

    let report = Report {
        engines: devices
            .iter()
            .map(|d| EngineReport {
                name: d.item.handle().name().to_string(),
                state: d.item.handle().state(),
                stats: d.item.handle().stats(),
                device: d.control.counters(),
            })
            .collect(),
        raid,
        workloads,
    };

    for device in &devices {
        if let Err(e) = device.item.with_engine(|e| e.request_state(RunState::Terminating)) {
            warn!("{}: shutdown request failed: {}", device.item.handle().name(), e);
        }
    }
    group.shutdown();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let failures: u64 = report.workloads.iter().map(|w| w.failures).sum();
    let mismatches: u64 = report.workloads.iter().map(|w| w.mismatches).sum();
    if mismatches > 0 {
        error!("{} reads returned wrong data", mismatches);
        bail!("data verification failed");
    }
    if failures > 0 {
        bail!("{} requests failed", failures);
    }
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(engines) = args.engines {
        config.sim.engines = engines;
    }
    if let Some(requests) = args.requests {
        config.workload.requests = requests;
    }
    if let Some(level) = &args.raid {
        let raid = config.raid.get_or_insert_with(RaidConfig::default);
        raid.level.clone_from(level);
    }
    if let Some(stride) = args.stride {
        let raid = config.raid.get_or_insert_with(RaidConfig::default);
        raid.stride_sectors = stride;
    }
    if let Some(seed) = args.seed {
        config.workload.seed = Some(seed);
    }
    if let Some(copies) = args.sec_copies {
        config.engine.sec_copies = copies;
    }
    if let Some(faults) = args.faults {
        config.sim.faults = faults;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
}

fn build_devices(config: &Config, group: &DevGroup) -> Result<Vec<SimDevice>> {
    if config.sim.engines == 0 {
        bail!("at least one engine is required");
    }
    let mut rng = rand::thread_rng();
    let mut devices = Vec::with_capacity(config.sim.engines);
    for i in 0..config.sim.engines {
        let name = format!("tdimm{i}");
        let (hal, control) = SimHal::new(config.sim.sim_config(&name, &config.engine));
        for _ in 0..config.sim.faults {
            let skip = rng.gen_range(0..config.workload.requests.clamp(1, 10_000) as u32);
            control.inject(FaultRule::new(FaultTarget::AnyCommand, FaultKind::Retryable, 1).after(skip));
        }

        let engine_config = tdimm_common::EngineConfig {
            name: name.clone(),
            ..config.engine.clone()
        };
        let mut engine = Engine::new(engine_config, Box::new(hal))
            .with_context(|| format!("{name}: failed to create engine"))?;
        engine
            .start()
            .with_context(|| format!("{name}: failed to start"))?;
        let item = group.add_engine(engine);
        item.handle()
            .wait_for(RunState::Running, Duration::from_secs(10))
            .with_context(|| format!("{name}: did not come up"))?;
        info!("{}: running, {:?}", name, item.handle().geometry());
        devices.push(SimDevice { item, control });
    }
    Ok(devices)
}

fn assemble(raid_config: RaidConfig, devices: &[SimDevice]) -> Result<RaidDevice> {
    let registry = StrategyRegistry::default();
    let raid = RaidDevice::create(raid_config, &registry)?;
    for device in devices {
        let member: Arc<dyn MemberDevice> = Arc::new(device.item.handle().clone());
        let slot = raid.add_member(member)?;
        info!("{}: {} joined slot {}", raid.name(), device.item.handle().name(), slot);
    }
    info!(
        "{}: {} over {} members, {:?}, {}",
        raid.name(),
        raid.level(),
        raid.width(),
        raid.geometry(),
        raid.state()
    );
    Ok(raid)
}

fn print_report(report: &Report) {
    for engine in &report.engines {
        println!(
            "{:<10} {:?}: {} completed, {} failed, {} retries, {} timeouts, {} commands on device",
            engine.name,
            engine.state,
            engine.stats.requests_completed,
            engine.stats.requests_failed,
            engine.stats.retries,
            engine.stats.timeouts,
            engine.device.commands
        );
    }
    if let Some(raid) = &report.raid {
        println!("{:<10} {} x{}: {}", raid.name, raid.level, raid.width, raid.state);
    }
    for w in &report.workloads {
        println!(
            "{:<10} {} requests ({} read, {} write, {} discard) {} bytes in {} ms, {:.0} IOPS, {} failed, {} mismatched",
            w.target, w.requests, w.reads, w.writes, w.discards, w.bytes, w.elapsed_ms, w.iops, w.failures, w.mismatches
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file() {
        let mut config: Config = toml::from_str(
            r#"
            [sim]
            engines = 4

            [workload]
            requests = 10
            seed = 1
            "#,
        )
        .unwrap();
        let args = Args::try_parse_from([
            "tdimm-sim", "--engines", "3", "--raid", "mirror", "--sec-copies", "2",
        ])
        .unwrap();
        apply_overrides(&mut config, &args);
        assert_eq!(config.sim.engines, 3);
        assert_eq!(config.workload.requests, 10);
        assert_eq!(config.workload.seed, Some(1));
        assert_eq!(config.engine.sec_copies, 2);
        let raid = config.raid.unwrap();
        assert_eq!(raid.level, "mirror");
        assert_eq!(raid.stride_sectors, 256);
    }

    #[test]
    fn test_raid_absent_without_flags() {
        let mut config = Config::default();
        let args = Args::try_parse_from(["tdimm-sim", "--json"]).unwrap();
        apply_overrides(&mut config, &args);
        assert!(config.raid.is_none());
        assert!(args.json);
    }
}
