//! TDIMM Common - Shared types and utilities
//!
//! This crate provides the error definitions, per-request result codes,
//! configuration structures and geometry constants used by the engine,
//! the RAID layer and the simulator binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CollisionMode, ConfigVar, EngineConfig, RaidConfig, VarDescriptor};
pub use error::{Error, IoError, IoResult, Result};
pub use types::*;
