//! Core geometry types and constants shared by the engine and RAID layer

use serde::{Deserialize, Serialize};

/// Hardware sector size in bytes
pub const SECTOR_SIZE: u64 = 512;

/// log2 of [`SECTOR_SIZE`]
pub const SECTOR_SHIFT: u32 = 9;

/// Native transfer unit of the device in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Sectors per native page
pub const SECTORS_PER_PAGE: u64 = PAGE_SIZE / SECTOR_SIZE;

/// Hard maximum of fragments a single request may be split into
pub const MAX_SPLIT_FRAGMENTS: usize = 128;

/// Default number of in-flight command tokens
pub const DEFAULT_TOKEN_COUNT: usize = 256;

/// Member slots per RAID device
pub const MAX_RAID_MEMBERS: usize = 32;

/// Size of the per-member RAID metadata block
pub const RAID_METADATA_SIZE: usize = 4096;

/// Request direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
    Discard,
}

impl Direction {
    /// True for operations that modify media
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Discard)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Discard => "discard",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block parameters a device exposes to the layers above it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Usable capacity in bytes
    pub capacity_bytes: u64,
    /// Logical sector size in bytes
    pub sector_size: u32,
    /// Largest request the device accepts in bytes
    pub max_request_bytes: u32,
}

impl Geometry {
    #[must_use]
    pub const fn new(capacity_bytes: u64, sector_size: u32, max_request_bytes: u32) -> Self {
        Self {
            capacity_bytes,
            sector_size,
            max_request_bytes,
        }
    }

    /// Capacity in sectors
    #[must_use]
    pub const fn capacity_sectors(&self) -> u64 {
        self.capacity_bytes / self.sector_size as u64
    }

    /// Check whether `[offset, offset + size)` lies inside the device
    #[must_use]
    pub const fn contains(&self, offset: u64, size: u64) -> bool {
        match offset.checked_add(size) {
            Some(end) => end <= self.capacity_bytes,
            None => false,
        }
    }
}

/// Convert bytes to sectors, rounding down
#[inline]
#[must_use]
pub const fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes >> SECTOR_SHIFT
}

/// Convert sectors to bytes
#[inline]
#[must_use]
pub const fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors << SECTOR_SHIFT
}

/// Check sector alignment of a byte quantity
#[inline]
#[must_use]
pub const fn is_sector_aligned(bytes: u64) -> bool {
    bytes & (SECTOR_SIZE - 1) == 0
}

/// Round down to the containing page boundary
#[inline]
#[must_use]
pub const fn page_floor(bytes: u64) -> u64 {
    bytes & !(PAGE_SIZE - 1)
}
