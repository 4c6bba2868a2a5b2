//! Strategy registry: level name to constructor

use crate::mirror::Mirror;
use crate::strategy::RaidStrategy;
use crate::stripe::Stripe;
use std::collections::HashMap;
use tdimm_common::{Error, RaidConfig, Result};

/// Builds a strategy from its configuration
pub type StrategyCtor = fn(&RaidConfig) -> Result<Box<dyn RaidStrategy>>;

/// Known RAID levels
///
/// Only consulted when a device is created; the device keeps the strategy
/// object it got.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    ctors: HashMap<&'static str, StrategyCtor>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("stripe", Stripe::from_config);
        registry.register("mirror", Mirror::from_config);
        registry
    }
}

impl StrategyRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Register a level, replacing any previous constructor of that name
    pub fn register(&mut self, name: &'static str, ctor: StrategyCtor) {
        self.ctors.insert(name, ctor);
    }

    /// Build the strategy `config.level` names
    pub fn create(&self, config: &RaidConfig) -> Result<Box<dyn RaidStrategy>> {
        let ctor = self
            .ctors
            .get(config.level.as_str())
            .ok_or_else(|| Error::UnknownRaidLevel(config.level.clone()))?;
        ctor(config)
    }

    /// Registered level names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.ctors.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
