//! Striping: consecutive strides rotate across members

use crate::metadata::ConfigKey;
use crate::strategy::{MemberSlots, RaidStrategy};
use tdimm_common::{Error, Geometry, IoError, RaidConfig, Result, SECTOR_SIZE};
use tdimm_engine::Request;
use tdimm_engine::biogrp::{Rejected, split};
use tracing::trace;

/// Stripe set parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stripe {
    stride_sectors: u64,
}

impl Stripe {
    pub fn new(stride_sectors: u64) -> Result<Self> {
        if stride_sectors == 0 {
            return Err(Error::configuration("stripe stride must be non-zero"));
        }
        Ok(Self { stride_sectors })
    }

    pub fn from_config(config: &RaidConfig) -> Result<Box<dyn RaidStrategy>> {
        Ok(Box::new(Self::new(u64::from(config.stride_sectors))?))
    }

    #[must_use]
    pub const fn stride_sectors(&self) -> u64 {
        self.stride_sectors
    }

    const fn stride_bytes(&self) -> u64 {
        self.stride_sectors * SECTOR_SIZE
    }

    /// Member index and member-relative sector of an array sector
    #[must_use]
    pub const fn locate(&self, sector: u64, width: u64) -> (u64, u64) {
        let stripe = sector / self.stride_sectors;
        let within = sector % self.stride_sectors;
        (stripe % width, (stripe / width) * self.stride_sectors + within)
    }
}

impl RaidStrategy for Stripe {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn capacity(&self, member: &Geometry, width: usize) -> u64 {
        let per_member = member.capacity_bytes / self.stride_bytes() * self.stride_bytes();
        per_member * width as u64
    }

    fn survives(&self, healthy: usize, width: usize) -> bool {
        width > 0 && healthy == width
    }

    fn submit(&self, request: Request, members: &MemberSlots) -> std::result::Result<usize, Rejected> {
        let width = members.len() as u64;
        if width == 0 {
            return Err(Rejected {
                request,
                error: Error::internal("stripe set has no members"),
            });
        }
        split(request, self.stride_bytes(), |_, mut fragment| {
            let (index, sector) = self.locate(fragment.offset / SECTOR_SIZE, width);
            fragment.offset = sector * SECTOR_SIZE;
            trace!(
                "stripe: {} {}+{} -> member {}",
                fragment.direction, fragment.offset, fragment.size, index
            );
            let member = usize::try_from(index)
                .ok()
                .and_then(|i| members.get(i))
                .and_then(Option::as_ref);
            match member {
                Some(member) => member.queue_request(fragment),
                None => fragment.complete(Err(IoError::Io)),
            }
        })
    }

    fn parameters(&self) -> Vec<(u32, u64)> {
        vec![(ConfigKey::StrideSectors as u32, self.stride_sectors)]
    }
}
