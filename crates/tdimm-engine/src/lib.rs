//! TDIMM Engine - command/IO engine for memory-mapped flash devices
//!
//! The engine turns block requests into fixed-size device commands: it
//! splits requests into page fragments, allocates command tokens and device
//! buffers, hands commands to a [`hal::Hal`] backend, polls for completion,
//! retries failures and joins fragment results back into one completion per
//! request.
//!
//! The in-memory [`sim::SimHal`] backend stands in for hardware in tests and
//! in the `tdimm-sim` binary.

pub mod biogrp;
pub mod engine;
pub mod hal;
pub mod handle;
pub mod pool;
pub mod request;
pub mod run_state;
pub mod scheduler;
pub mod sim;
pub mod stats;
pub mod token;

pub use biogrp::{DiscardGeometry, SplitGroup};
pub use engine::Engine;
pub use hal::{Hal, HalError, HalResult};
pub use handle::EngineHandle;
pub use request::{ControlCommand, ControlOp, IoBuf, Request, RequestFlags};
pub use run_state::RunState;
pub use scheduler::{DevGroup, EngineWorkItem, WorkItem, WorkerEvent};
pub use sim::{FaultKind, FaultRule, FaultTarget, SimConfig, SimControl, SimCounters, SimHal};
pub use stats::StatsSnapshot;
