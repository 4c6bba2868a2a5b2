//! Mirroring: writes go to every member, reads are spread over them

use crate::member::MemberDevice;
use crate::metadata::ConfigKey;
use crate::strategy::{MemberSlots, RaidStrategy};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tdimm_common::{Direction, Error, Geometry, RaidConfig, Result, SECTOR_SIZE};
use tdimm_engine::Request;
use tdimm_engine::biogrp::{Rejected, replicate, split};

/// Mirror set parameters
///
/// Reads are cut at `read_stride_sectors` and the pieces handed to the
/// live members in turn, continuing where the previous read left off.
#[derive(Debug)]
pub struct Mirror {
    read_stride_sectors: u64,
    last_read: AtomicUsize,
}

impl Mirror {
    pub fn new(read_stride_sectors: u64) -> Result<Self> {
        if read_stride_sectors == 0 {
            return Err(Error::configuration("mirror read stride must be non-zero"));
        }
        Ok(Self {
            read_stride_sectors,
            last_read: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &RaidConfig) -> Result<Box<dyn RaidStrategy>> {
        Ok(Box::new(Self::new(u64::from(config.read_stride_sectors))?))
    }

    #[must_use]
    pub const fn read_stride_sectors(&self) -> u64 {
        self.read_stride_sectors
    }
}

impl RaidStrategy for Mirror {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn capacity(&self, member: &Geometry, width: usize) -> u64 {
        if width == 0 { 0 } else { member.capacity_bytes }
    }

    fn survives(&self, healthy: usize, _width: usize) -> bool {
        healthy > 0
    }

    fn submit(&self, request: Request, members: &MemberSlots) -> std::result::Result<usize, Rejected> {
        let live: Vec<&Arc<dyn MemberDevice>> = members
            .iter()
            .flatten()
            .filter(|m| m.is_alive())
            .collect();
        if live.is_empty() {
            return Err(Rejected {
                request,
                error: Error::internal("mirror set has no live members"),
            });
        }

        if request.direction == Direction::Read {
            let n = live.len();
            return split(request, self.read_stride_sectors * SECTOR_SIZE, |_, fragment| {
                let turn = self.last_read.fetch_add(1, Ordering::Relaxed) % n;
                live[turn].queue_request(fragment);
            });
        }

        let n = live.len();
        let mut targets = live.into_iter();
        replicate(request, n, |_, fragment| {
            if let Some(member) = targets.next() {
                member.queue_request(fragment);
            }
        })
    }

    fn parameters(&self) -> Vec<(u32, u64)> {
        vec![(ConfigKey::ReadStrideSectors as u32, self.read_stride_sectors)]
    }
}
