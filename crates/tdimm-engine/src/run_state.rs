//! Engine run-state machine
//!
//! ```text
//! INIT -> FW_PROBE -> READ_PURGE -> RUNNING <-> {SYNC_IO, BIO_DRAIN, UCMD_ONLY}
//! RUNNING -> PM_DRAIN -> PM_SHUTDOWN -> PM_SLEEP -> (state before PM_DRAIN)
//! any -> TERMINATING -> DEAD -> INIT (reset)
//! ```
//!
//! All mutation goes through [`RunStateCell::transition`]. Waiters are woken
//! on every transition into a settled state.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tdimm_common::{Error, Result};
use tracing::{error, info};

/// Engine-wide operational state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    FwProbe,
    ReadPurge,
    Running,
    /// One synchronous command in flight
    SyncIo,
    /// Block I/O paused until drained
    BioDrain,
    /// Only control commands are served
    UcmdOnly,
    PmDrain,
    PmShutdown,
    PmSleep,
    Terminating,
    Dead,
}

impl RunState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::FwProbe => "FW_PROBE",
            Self::ReadPurge => "READ_PURGE",
            Self::Running => "RUNNING",
            Self::SyncIo => "SYNC_IO",
            Self::BioDrain => "BIO_DRAIN",
            Self::UcmdOnly => "UCMD_ONLY",
            Self::PmDrain => "PM_DRAIN",
            Self::PmShutdown => "PM_SHUTDOWN",
            Self::PmSleep => "PM_SLEEP",
            Self::Terminating => "TERMINATING",
            Self::Dead => "DEAD",
        }
    }

    /// Whether `self -> to` is a legal transition
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        use RunState::{
            BioDrain, Dead, FwProbe, Init, PmDrain, PmShutdown, PmSleep, ReadPurge, Running,
            SyncIo, Terminating, UcmdOnly,
        };
        match (self, to) {
            (Dead, Init) | (Terminating, Dead) => true,
            (Dead | Terminating, _) => false,
            (_, Terminating) => true,
            (Init, FwProbe)
            | (FwProbe, ReadPurge)
            | (ReadPurge, Running)
            | (Running, SyncIo | BioDrain | UcmdOnly | PmDrain)
            | (SyncIo, Running)
            | (BioDrain, Running | UcmdOnly | PmDrain)
            | (UcmdOnly, Running | PmDrain)
            | (PmDrain, PmShutdown | Running)
            | (PmShutdown, PmSleep)
            | (PmSleep, Running | BioDrain | UcmdOnly) => true,
            _ => false,
        }
    }

    /// States waiters are woken for
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Running | Self::Dead | Self::PmSleep | Self::UcmdOnly)
    }

    /// Whether new block requests may be started
    #[must_use]
    pub const fn allows_block_io(self) -> bool {
        matches!(self, Self::Running | Self::SyncIo)
    }

    /// Whether control commands may be started
    #[must_use]
    pub const fn allows_control(self) -> bool {
        matches!(
            self,
            Self::Init | Self::FwProbe | Self::Running | Self::BioDrain | Self::UcmdOnly
        )
    }

    /// Whether the engine has given up
    #[must_use]
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Terminating | Self::Dead)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-state shared between the engine and its handles
pub struct RunStateCell {
    name: String,
    state: Mutex<RunState>,
    settled: Condvar,
}

impl std::fmt::Debug for RunStateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStateCell")
            .field("name", &self.name)
            .field("state", &self.current())
            .finish()
    }
}

impl RunStateCell {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RunState::Init),
            settled: Condvar::new(),
        }
    }

    #[must_use]
    pub fn current(&self) -> RunState {
        *self.state.lock()
    }

    /// Move to `to`, returning the previous state
    pub fn transition(&self, to: RunState) -> Result<RunState> {
        let mut state = self.state.lock();
        let prev = *state;
        if prev == to {
            return Ok(prev);
        }
        if !prev.can_transition(to) {
            return Err(Error::IllegalTransition {
                from: prev.to_string(),
                to: to.to_string(),
            });
        }
        *state = to;
        drop(state);

        if to.is_failed() {
            error!("{}: run state {} -> {}", self.name, prev, to);
        } else {
            info!("{}: run state {} -> {}", self.name, prev, to);
        }
        if to.is_settled() {
            self.settled.notify_all();
        }
        Ok(prev)
    }

    /// Block until the engine reaches the settled state `target`
    ///
    /// Fails early if the engine dies while waiting for another state.
    pub fn wait_for(&self, target: RunState, timeout: Duration) -> Result<()> {
        if !target.is_settled() {
            return Err(Error::invalid_request(format!("{target} is not a settled state")));
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if *state == target {
                return Ok(());
            }
            if *state == RunState::Dead {
                return Err(Error::EngineDead);
            }
            if self.settled.wait_until(&mut state, deadline).timed_out() {
                return if *state == target {
                    Ok(())
                } else {
                    Err(Error::Timeout(format!("{} to reach {}", self.name, target)))
                };
            }
        }
    }
}
