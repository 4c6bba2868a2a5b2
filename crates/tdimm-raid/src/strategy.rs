//! Composition strategy seam

use crate::member::MemberDevice;
use std::sync::Arc;
use tdimm_common::Geometry;
use tdimm_engine::Request;
use tdimm_engine::biogrp::Rejected;

/// Member devices by slot; `None` marks a slot whose member is missing
pub type MemberSlots = [Option<Arc<dyn MemberDevice>>];

/// How a RAID level distributes requests over its members
pub trait RaidStrategy: Send + Sync + std::fmt::Debug {
    /// Registry name of the level
    fn name(&self) -> &'static str;

    /// Capacity exposed by `width` members of the given geometry
    fn capacity(&self, member: &Geometry, width: usize) -> u64;

    /// Whether the set still serves I/O with `healthy` of `width` members
    fn survives(&self, healthy: usize, width: usize) -> bool;

    /// Fan a request out to the members
    ///
    /// Returns the number of member requests queued. A request that cannot
    /// be split comes back untouched.
    fn submit(&self, request: Request, members: &MemberSlots) -> Result<usize, Rejected>;

    /// Parameters persisted in member metadata, as `(key, value)` pairs
    fn parameters(&self) -> Vec<(u32, u64)>;
}
