//! Configuration types for TDIMM
//!
//! Configuration is passed explicitly at construction. Individual engine
//! variables can also be read and written at runtime through [`ConfigVar`],
//! which is checked against the static descriptor table [`CONFIG_VARS`].

use crate::error::{Error, Result};
use crate::types::{PAGE_SIZE, SECTOR_SIZE};
use serde::{Deserialize, Serialize};

/// Which in-flight commands a new request must not overlap
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionMode {
    /// No collision detection
    None,
    /// Only read-modify-write commands are protected
    RmwOnly,
    /// Overlap with any in-flight write (or a write overlapping a read)
    #[default]
    AnyWrite,
    /// Overlap with anything in flight
    AnyAccess,
}

impl CollisionMode {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        match self {
            Self::None => 0,
            Self::RmwOnly => 1,
            Self::AnyWrite => 2,
            Self::AnyAccess => 3,
        }
    }

    #[must_use]
    pub const fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::RmwOnly),
            2 => Some(Self::AnyWrite),
            3 => Some(Self::AnyAccess),
            _ => None,
        }
    }
}

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name used in logs
    pub name: String,
    /// Number of command tokens
    pub token_count: usize,
    /// Number of core (command slot) buffers
    pub core_buffers: usize,
    /// Number of write buffers
    pub write_buffers: usize,
    /// Number of read buffers
    pub read_buffers: usize,
    /// Retry budget per token
    pub max_retries: u32,
    /// Command timeout in milliseconds
    pub timeout_ms: u64,
    /// Timed-out tokens tolerated before the engine gives up
    pub timeout_abort_threshold: u32,
    /// Tokens started per admission pass
    pub max_burst: u32,
    /// Collision detection mode
    pub collision_mode: CollisionMode,
    /// Issue read-buffer deallocations as separate tokens
    pub independent_dealloc: bool,
    /// Deallocation tokens started per admission pass
    pub dealloc_burst: u32,
    /// Copies written per block write (1 = off, 2 = dual, 3 = triple)
    pub sec_copies: u8,
    /// Kill the engine on the first timeout (debug)
    pub halt_on_timeout: bool,
    /// Deliver completed writes before completed reads
    pub writes_first: bool,
    /// Age after which an unowned read buffer is considered orphaned
    pub orphan_threshold_ms: u64,
    /// Incoming queue depth at which submitters are throttled
    pub max_incoming: u32,
    /// Largest request accepted, in bytes
    pub max_request_bytes: u32,
    /// Discard stripe size in bytes
    pub discard_stripe_bytes: u64,
    /// Number of flash backends discards are spread across
    pub discard_backends: u32,
    /// Stripes a single trim command may cover
    pub max_discard_stripes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "tdimm0".to_string(),
            token_count: crate::types::DEFAULT_TOKEN_COUNT,
            core_buffers: 256,
            write_buffers: 64,
            read_buffers: 64,
            max_retries: 5,
            timeout_ms: 1000,
            timeout_abort_threshold: 16,
            max_burst: 64,
            collision_mode: CollisionMode::AnyWrite,
            independent_dealloc: true,
            dealloc_burst: 8,
            sec_copies: 1,
            halt_on_timeout: false,
            writes_first: false,
            orphan_threshold_ms: 5000,
            max_incoming: 1024,
            max_request_bytes: 512 * 1024,
            discard_stripe_bytes: 64 * 1024,
            discard_backends: 2,
            max_discard_stripes: 1024,
        }
    }
}

/// Runtime-addressable engine variables
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ConfigVar {
    TokenCount = 0,
    CoreBuffers = 1,
    WriteBuffers = 2,
    ReadBuffers = 3,
    MaxRetries = 4,
    TimeoutMs = 5,
    TimeoutAbortThreshold = 6,
    MaxBurst = 7,
    CollisionMode = 8,
    IndependentDealloc = 9,
    DeallocBurst = 10,
    SecCopies = 11,
    HaltOnTimeout = 12,
    WritesFirst = 13,
    OrphanThresholdMs = 14,
    MaxIncoming = 15,
    MaxRequestBytes = 16,
    DiscardStripeBytes = 17,
    DiscardBackends = 18,
    MaxDiscardStripes = 19,
}

/// Extra acceptance check run after the range check
pub type Validator = fn(&EngineConfig, u64) -> bool;

/// Descriptor of one runtime variable
#[derive(Clone, Copy, Debug)]
pub struct VarDescriptor {
    pub var: ConfigVar,
    pub name: &'static str,
    pub min: u64,
    pub max: u64,
    /// Whether the value may change once an engine is running
    pub runtime: bool,
    pub validator: Option<Validator>,
}

fn burst_within_tokens(cfg: &EngineConfig, value: u64) -> bool {
    value <= cfg.token_count as u64
}

fn page_multiple(_: &EngineConfig, value: u64) -> bool {
    value % PAGE_SIZE == 0
}

fn sector_multiple(_: &EngineConfig, value: u64) -> bool {
    value % SECTOR_SIZE == 0
}

fn power_of_two_or_one(_: &EngineConfig, value: u64) -> bool {
    value.is_power_of_two()
}

const fn var(
    var: ConfigVar,
    name: &'static str,
    min: u64,
    max: u64,
    runtime: bool,
    validator: Option<Validator>,
) -> VarDescriptor {
    VarDescriptor {
        var,
        name,
        min,
        max,
        runtime,
        validator,
    }
}

/// Descriptor table, indexed by `ConfigVar as usize`
pub static CONFIG_VARS: [VarDescriptor; 20] = [
    var(ConfigVar::TokenCount, "token_count", 1, 4096, false, None),
    var(ConfigVar::CoreBuffers, "core_buffers", 1, 4096, false, None),
    var(ConfigVar::WriteBuffers, "write_buffers", 1, 4096, false, None),
    var(ConfigVar::ReadBuffers, "read_buffers", 1, 4096, false, None),
    var(ConfigVar::MaxRetries, "max_retries", 0, 1000, true, None),
    var(ConfigVar::TimeoutMs, "timeout_ms", 1, 3_600_000, true, None),
    var(ConfigVar::TimeoutAbortThreshold, "timeout_abort_threshold", 1, 4096, true, None),
    var(ConfigVar::MaxBurst, "max_burst", 1, 4096, true, Some(burst_within_tokens)),
    var(ConfigVar::CollisionMode, "collision_mode", 0, 3, true, None),
    var(ConfigVar::IndependentDealloc, "independent_dealloc", 0, 1, true, None),
    var(ConfigVar::DeallocBurst, "dealloc_burst", 1, 4096, true, None),
    var(ConfigVar::SecCopies, "sec_copies", 1, 3, true, None),
    var(ConfigVar::HaltOnTimeout, "halt_on_timeout", 0, 1, true, None),
    var(ConfigVar::WritesFirst, "writes_first", 0, 1, true, None),
    var(ConfigVar::OrphanThresholdMs, "orphan_threshold_ms", 1, 3_600_000, true, None),
    var(ConfigVar::MaxIncoming, "max_incoming", 1, 1 << 20, true, None),
    var(ConfigVar::MaxRequestBytes, "max_request_bytes", SECTOR_SIZE, 128 * PAGE_SIZE, true, Some(sector_multiple)),
    var(ConfigVar::DiscardStripeBytes, "discard_stripe_bytes", PAGE_SIZE, 1 << 30, false, Some(page_multiple)),
    var(ConfigVar::DiscardBackends, "discard_backends", 1, 64, false, Some(power_of_two_or_one)),
    var(ConfigVar::MaxDiscardStripes, "max_discard_stripes", 1, 1 << 20, true, None),
];

impl ConfigVar {
    /// All variables in id order
    pub fn all() -> impl Iterator<Item = Self> {
        CONFIG_VARS.iter().map(|d| d.var)
    }

    /// Descriptor of this variable
    #[must_use]
    pub fn descriptor(self) -> &'static VarDescriptor {
        &CONFIG_VARS[self as usize]
    }

    /// Look a variable up by its name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        CONFIG_VARS.iter().find(|d| d.name == name).map(|d| d.var)
    }
}

impl EngineConfig {
    /// Read a variable
    #[must_use]
    pub fn get(&self, var: ConfigVar) -> u64 {
        match var {
            ConfigVar::TokenCount => self.token_count as u64,
            ConfigVar::CoreBuffers => self.core_buffers as u64,
            ConfigVar::WriteBuffers => self.write_buffers as u64,
            ConfigVar::ReadBuffers => self.read_buffers as u64,
            ConfigVar::MaxRetries => u64::from(self.max_retries),
            ConfigVar::TimeoutMs => self.timeout_ms,
            ConfigVar::TimeoutAbortThreshold => u64::from(self.timeout_abort_threshold),
            ConfigVar::MaxBurst => u64::from(self.max_burst),
            ConfigVar::CollisionMode => self.collision_mode.as_u64(),
            ConfigVar::IndependentDealloc => u64::from(self.independent_dealloc),
            ConfigVar::DeallocBurst => u64::from(self.dealloc_burst),
            ConfigVar::SecCopies => u64::from(self.sec_copies),
            ConfigVar::HaltOnTimeout => u64::from(self.halt_on_timeout),
            ConfigVar::WritesFirst => u64::from(self.writes_first),
            ConfigVar::OrphanThresholdMs => self.orphan_threshold_ms,
            ConfigVar::MaxIncoming => u64::from(self.max_incoming),
            ConfigVar::MaxRequestBytes => u64::from(self.max_request_bytes),
            ConfigVar::DiscardStripeBytes => self.discard_stripe_bytes,
            ConfigVar::DiscardBackends => u64::from(self.discard_backends),
            ConfigVar::MaxDiscardStripes => u64::from(self.max_discard_stripes),
        }
    }

    /// Check a value against the variable's descriptor without applying it
    pub fn check(&self, var: ConfigVar, value: u64) -> Result<()> {
        let desc = var.descriptor();
        if value < desc.min || value > desc.max {
            return Err(Error::configuration(format!(
                "{} = {} out of range [{}, {}]",
                desc.name, value, desc.min, desc.max
            )));
        }
        if let Some(validator) = desc.validator
            && !validator(self, value)
        {
            return Err(Error::configuration(format!(
                "{} = {} rejected by validator",
                desc.name, value
            )));
        }
        Ok(())
    }

    /// Write a variable after range and validator checks
    #[allow(clippy::cast_possible_truncation)]
    pub fn set(&mut self, var: ConfigVar, value: u64) -> Result<()> {
        self.check(var, value)?;
        match var {
            ConfigVar::TokenCount => self.token_count = value as usize,
            ConfigVar::CoreBuffers => self.core_buffers = value as usize,
            ConfigVar::WriteBuffers => self.write_buffers = value as usize,
            ConfigVar::ReadBuffers => self.read_buffers = value as usize,
            ConfigVar::MaxRetries => self.max_retries = value as u32,
            ConfigVar::TimeoutMs => self.timeout_ms = value,
            ConfigVar::TimeoutAbortThreshold => self.timeout_abort_threshold = value as u32,
            ConfigVar::MaxBurst => self.max_burst = value as u32,
            ConfigVar::CollisionMode => {
                self.collision_mode = CollisionMode::from_u64(value).unwrap_or_default();
            }
            ConfigVar::IndependentDealloc => self.independent_dealloc = value != 0,
            ConfigVar::DeallocBurst => self.dealloc_burst = value as u32,
            ConfigVar::SecCopies => self.sec_copies = value as u8,
            ConfigVar::HaltOnTimeout => self.halt_on_timeout = value != 0,
            ConfigVar::WritesFirst => self.writes_first = value != 0,
            ConfigVar::OrphanThresholdMs => self.orphan_threshold_ms = value,
            ConfigVar::MaxIncoming => self.max_incoming = value as u32,
            ConfigVar::MaxRequestBytes => self.max_request_bytes = value as u32,
            ConfigVar::DiscardStripeBytes => self.discard_stripe_bytes = value,
            ConfigVar::DiscardBackends => self.discard_backends = value as u32,
            ConfigVar::MaxDiscardStripes => self.max_discard_stripes = value as u32,
        }
        Ok(())
    }

    /// Validate every variable against the descriptor table
    pub fn validate(&self) -> Result<()> {
        for desc in &CONFIG_VARS {
            self.check(desc.var, self.get(desc.var))?;
        }
        Ok(())
    }

    /// Command timeout as a duration
    #[must_use]
    pub const fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    /// Orphan threshold as a duration
    #[must_use]
    pub const fn orphan_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.orphan_threshold_ms)
    }
}

/// RAID device configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidConfig {
    /// Device name used in logs
    pub name: String,
    /// Strategy name ("stripe" or "mirror")
    pub level: String,
    /// Stripe stride in sectors
    pub stride_sectors: u32,
    /// Mirror read stride in sectors
    pub read_stride_sectors: u32,
}

impl Default for RaidConfig {
    fn default() -> Self {
        Self {
            name: "tdraid0".to_string(),
            level: "stripe".to_string(),
            stride_sectors: 256,
            read_stride_sectors: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_descriptor_table_is_indexed_by_id() {
        for (i, desc) in CONFIG_VARS.iter().enumerate() {
            assert_eq!(desc.var as usize, i, "{} out of place", desc.name);
            assert_eq!(ConfigVar::from_name(desc.name), Some(desc.var));
        }
    }

    #[test]
    fn test_get_set_round_trip() {
        let mut cfg = EngineConfig::default();
        cfg.set(ConfigVar::MaxRetries, 9).unwrap();
        assert_eq!(cfg.get(ConfigVar::MaxRetries), 9);
        cfg.set(ConfigVar::CollisionMode, 3).unwrap();
        assert_eq!(cfg.collision_mode, CollisionMode::AnyAccess);
        cfg.set(ConfigVar::HaltOnTimeout, 1).unwrap();
        assert!(cfg.halt_on_timeout);
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.set(ConfigVar::SecCopies, 4).is_err());
        assert!(cfg.set(ConfigVar::SecCopies, 0).is_err());
        assert_eq!(cfg.sec_copies, 1);
    }

    #[test]
    fn test_validators() {
        let mut cfg = EngineConfig {
            token_count: 8,
            ..Default::default()
        };
        assert!(cfg.set(ConfigVar::MaxBurst, 9).is_err());
        cfg.set(ConfigVar::MaxBurst, 8).unwrap();
        assert!(cfg.set(ConfigVar::DiscardStripeBytes, 4096 + 512).is_err());
        assert!(cfg.set(ConfigVar::DiscardBackends, 3).is_err());
        cfg.set(ConfigVar::DiscardBackends, 4).unwrap();
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            name = "td7"
            max_retries = 2
            collision_mode = "rmw_only"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.name, "td7");
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.collision_mode, CollisionMode::RmwOnly);
        assert_eq!(cfg.token_count, 256);
    }
}
