//! TDIMM RAID - stripe and mirror sets over TDIMM engines
//!
//! A [`RaidDevice`] fans requests out to its members with the engine's
//! request splitter; each member is typically an engine handle running its
//! own admission and completion. Members persist a 4 KiB
//! [`metadata::RaidMetadata`] block so a set can be reassembled.

pub mod device;
pub mod member;
pub mod metadata;
pub mod mirror;
pub mod registry;
pub mod strategy;
pub mod stripe;

pub use device::{RaidDevice, RaidState};
pub use member::{MemberDevice, MemberState, MemberTable};
pub use metadata::RaidMetadata;
pub use mirror::Mirror;
pub use registry::StrategyRegistry;
pub use strategy::RaidStrategy;
pub use stripe::Stripe;
