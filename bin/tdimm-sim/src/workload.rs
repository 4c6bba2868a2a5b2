//! Verified synthetic workload
//!
//! Requests go out in batches of non-overlapping ranges. Once a batch has
//! completed, writes and discards are applied to a shadow copy of the
//! device and every read is compared against it.

use crate::config::WorkloadConfig;
use anyhow::{Result, bail};
use crossbeam_channel::unbounded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::{Duration, Instant};
use tdimm_common::{Direction, IoResult, SECTOR_SIZE};
use tdimm_engine::{IoBuf, Request};
use tdimm_raid::MemberDevice;
use tracing::{debug, info, warn};

/// Largest span of the target the workload touches
const MAX_MODEL_BYTES: u64 = 256 << 20;

#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkloadReport {
    pub target: String,
    pub requests: u64,
    pub reads: u64,
    pub writes: u64,
    pub discards: u64,
    pub bytes: u64,
    pub failures: u64,
    pub mismatches: u64,
    pub elapsed_ms: u64,
    pub iops: f64,
}

struct Op {
    direction: Direction,
    offset: u64,
    size: u64,
    buf: IoBuf,
}

impl Op {
    fn range(&self) -> (u64, u64) {
        (self.offset, self.offset + self.size)
    }
}

/// Run the workload against one target
pub fn run(target: &dyn MemberDevice, config: &WorkloadConfig, seed: u64) -> Result<WorkloadReport> {
    let span = target.geometry().capacity_bytes.min(MAX_MODEL_BYTES);
    let max_bytes = (config.max_sectors.max(1) * SECTOR_SIZE)
        .min(u64::from(target.geometry().max_request_bytes))
        .min(span);
    if max_bytes < SECTOR_SIZE {
        bail!("{}: device too small for the workload", target.name());
    }
    #[allow(clippy::cast_possible_truncation)]
    let mut model = vec![0u8; span as usize];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = WorkloadReport {
        target: target.name().to_string(),
        ..WorkloadReport::default()
    };
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    info!(
        "{}: {} requests, depth {}, up to {} bytes, seed {}",
        target.name(),
        config.requests,
        config.queue_depth,
        max_bytes,
        seed
    );

    let started = Instant::now();
    while report.requests < config.requests {
        let budget = (config.requests - report.requests).min(config.queue_depth.max(1) as u64);
        let batch = plan_batch(&mut rng, config, span, max_bytes, budget);
        let (tx, rx) = unbounded::<(usize, IoResult)>();
        for (i, op) in batch.iter().enumerate() {
            let tx = tx.clone();
            let request = match op.direction {
                Direction::Read => Request::read(op.offset, op.buf.clone()),
                Direction::Write => Request::write(op.offset, op.buf.clone()),
                Direction::Discard => Request::discard(op.offset, op.size),
            }
            .with_tag(report.requests + i as u64)
            .on_complete(move |res, _| {
                let _ = tx.send((i, res));
            });
            target.queue_request(request);
        }
        drop(tx);

        let mut results = vec![None; batch.len()];
        for _ in 0..batch.len() {
            match rx.recv_timeout(timeout) {
                Ok((i, res)) => results[i] = Some(res),
                Err(e) => bail!("{}: request lost after {:?}: {}", target.name(), timeout, e),
            }
        }

        for (op, result) in batch.iter().zip(results) {
            report.requests += 1;
            report.bytes += op.size;
            #[allow(clippy::cast_possible_truncation)]
            let (start, end) = (op.offset as usize, (op.offset + op.size) as usize);
            match op.direction {
                Direction::Read => report.reads += 1,
                Direction::Write => report.writes += 1,
                Direction::Discard => report.discards += 1,
            }
            if let Some(Err(e)) = result {
                warn!("{}: {} {}+{} failed: {}", target.name(), op.direction, op.offset, op.size, e);
                report.failures += 1;
                continue;
            }
            match op.direction {
                Direction::Read => {
                    if op.buf.to_vec() != model[start..end] {
                        warn!("{}: read {}+{} returned stale data", target.name(), op.offset, op.size);
                        report.mismatches += 1;
                    }
                }
                Direction::Write => op.buf.copy_to(0, &mut model[start..end]),
                Direction::Discard => model[start..end].fill(0),
            }
        }
        debug!("{}: {} of {} done", target.name(), report.requests, config.requests);
    }

    let elapsed = started.elapsed();
    report.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    #[allow(clippy::cast_precision_loss)]
    let requests = report.requests as f64;
    report.iops = requests / elapsed.as_secs_f64().max(1e-9);
    Ok(report)
}

fn plan_batch(rng: &mut StdRng, config: &WorkloadConfig, span: u64, max_bytes: u64, budget: u64) -> Vec<Op> {
    let mut batch: Vec<Op> = Vec::new();
    let max_sectors = max_bytes / SECTOR_SIZE;
    let mut attempts = 0;
    while (batch.len() as u64) < budget && attempts < budget * 4 {
        attempts += 1;
        let sectors = rng.gen_range(1..=max_sectors);
        let size = sectors * SECTOR_SIZE;
        let offset = rng.gen_range(0..=(span - size) / SECTOR_SIZE) * SECTOR_SIZE;
        let overlaps = batch.iter().any(|op| {
            let (s, e) = op.range();
            offset < e && s < offset + size
        });
        if overlaps {
            continue;
        }

        let roll = rng.gen_range(0..100);
        let direction = if roll < config.read_percent {
            Direction::Read
        } else if roll < config.read_percent + config.discard_percent {
            Direction::Discard
        } else {
            Direction::Write
        };
        #[allow(clippy::cast_possible_truncation)]
        let buf = match direction {
            Direction::Read => IoBuf::zeroed(size as usize),
            Direction::Write => {
                let mut data = vec![0u8; size as usize];
                rng.fill(&mut data[..]);
                IoBuf::from_vec(data)
            }
            Direction::Discard => IoBuf::default(),
        };
        batch.push(Op {
            direction,
            offset,
            size,
            buf,
        });
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tdimm_common::EngineConfig;
    use tdimm_engine::{DevGroup, Engine, RunState, SimConfig, SimHal};

    fn config(requests: u64) -> WorkloadConfig {
        WorkloadConfig {
            requests,
            queue_depth: 8,
            max_sectors: 24,
            ..WorkloadConfig::default()
        }
    }

    #[test]
    fn test_batches_never_overlap() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let batch = plan_batch(&mut rng, &config(100), 1 << 16, 8192, 16);
            for (i, a) in batch.iter().enumerate() {
                let (s, e) = a.range();
                assert!(e <= 1 << 16);
                for b in &batch[i + 1..] {
                    let (bs, be) = b.range();
                    assert!(e <= bs || be <= s);
                }
            }
        }
    }

    #[test]
    fn test_workload_on_engine() {
        let mut group = DevGroup::new("wl", 1, Duration::from_millis(1)).unwrap();
        let (hal, _control) = SimHal::new(SimConfig {
            capacity_bytes: 1 << 20,
            latency_polls: 1,
            ..SimConfig::default()
        });
        let mut engine = Engine::new(EngineConfig::default(), Box::new(hal)).unwrap();
        engine.start().unwrap();
        let item = group.add_engine(engine);
        item.handle().wait_for(RunState::Running, Duration::from_secs(5)).unwrap();

        let target: Arc<dyn MemberDevice> = Arc::new(item.handle().clone());
        let report = run(target.as_ref(), &config(300), 42).unwrap();
        assert_eq!(report.requests, 300);
        assert_eq!(report.failures, 0);
        assert_eq!(report.mismatches, 0);
        assert_eq!(report.reads + report.writes + report.discards, 300);
        group.shutdown();
    }
}
