//! The command/IO engine
//!
//! One `Engine` drives one device. It is not internally synchronised: a
//! single scheduler context calls [`Engine::io_begin`] to admit work and
//! [`Engine::io_complete`] to reap it. Submitters talk to the engine through
//! an [`EngineHandle`].
//!
//! Request path:
//!
//! ```text
//! incoming -> queued -> collision check -> resource check -> split
//!          -> token per fragment -> HAL dispatch -> active
//!          -> {completed | repeat | timedout | resumable} -> completion
//! ```

mod admit;
mod complete;

use crate::handle::{EngineHandle, EngineShared};
use crate::hal::Hal;
use crate::pool::{BufferId, BufferKind, BufferPool, ReadBufferPool};
use crate::request::{ControlCommand, Request};
use crate::run_state::RunState;
use crate::stats::StatsSnapshot;
use crate::token::{TokenList, TokenPool};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tdimm_common::{ConfigVar, EngineConfig, Error, Geometry, IoError, Result, SECTOR_SIZE};
use tracing::{error, info, warn};

/// Command engine of one device
pub struct Engine {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    hal: Box<dyn Hal>,
    tokens: TokenPool,
    core_bufs: BufferPool,
    write_bufs: BufferPool,
    read_bufs: ReadBufferPool,
    queued: VecDeque<Request>,
    controls: VecDeque<ControlCommand>,
    next_seq: u64,
    /// State to return to when waking from `PM_SLEEP`
    pm_resume: Option<RunState>,
    last_orphan_scan: Instant,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("tokens_in_use", &self.tokens.in_use())
            .field("queued", &self.queued.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine over a device backend
    pub fn new(config: EngineConfig, hal: Box<dyn Hal>) -> Result<Self> {
        config.validate()?;
        let device = hal.geometry();
        if u64::from(device.sector_size) != SECTOR_SIZE {
            return Err(Error::configuration(format!(
                "{}: unsupported sector size {}",
                hal.name(),
                device.sector_size
            )));
        }
        let geometry = Geometry::new(
            device.capacity_bytes,
            device.sector_size,
            config.max_request_bytes.min(device.max_request_bytes),
        );

        let tokens = TokenPool::new(config.token_count)?;
        let shared = Arc::new(EngineShared::new(
            &config.name,
            geometry,
            config.max_incoming as usize,
        ));
        info!(
            "{}: engine on {} ({} bytes, {} tokens, {}/{}/{} core/write/read buffers)",
            config.name,
            hal.name(),
            geometry.capacity_bytes,
            config.token_count,
            config.core_buffers,
            config.write_buffers,
            config.read_buffers
        );

        Ok(Self {
            core_bufs: BufferPool::new(BufferKind::Core, config.core_buffers),
            write_bufs: BufferPool::new(BufferKind::Write, config.write_buffers),
            read_bufs: ReadBufferPool::new(config.read_buffers),
            tokens,
            shared,
            hal,
            queued: VecDeque::new(),
            controls: VecDeque::new(),
            next_seq: 0,
            pm_resume: None,
            last_orphan_scan: Instant::now(),
            config,
        })
    }

    /// Submission handle for this engine
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(Arc::clone(&self.shared))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.shared.run_state.current()
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    #[must_use]
    pub const fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    /// Requests held in the engine's own queue
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Bring the device up: `INIT -> FW_PROBE -> READ_PURGE`
    ///
    /// The purge releases every read buffer the device may still hold; the
    /// engine reaches `RUNNING` once the purge has drained.
    pub fn start(&mut self) -> Result<()> {
        self.shared.run_state.transition(RunState::FwProbe)?;
        if let Err(e) = self.hal.handshake() {
            error!("{}: firmware handshake failed: {}", self.name(), e);
            self.terminate("firmware handshake failed");
            return Err(Error::internal(format!("handshake with {} failed: {e}", self.hal.name())));
        }
        self.shared.run_state.transition(RunState::ReadPurge)?;
        for i in 0..self.read_bufs.total() {
            if let Ok(raw) = u16::try_from(i) {
                self.read_bufs.schedule_deallocation(BufferId(raw));
            }
        }
        self.advance_state();
        self.publish();
        Ok(())
    }

    /// One scheduling pass: reap completions, then admit new work
    ///
    /// Returns whether the engine still has work that needs polling.
    pub fn poll_once(&mut self) -> bool {
        self.io_complete(None);
        self.io_begin();
        self.publish();
        self.has_work()
    }

    /// Whether a scheduling pass right now could make progress
    #[must_use]
    pub fn has_work(&self) -> bool {
        let incoming = {
            let incoming = self.shared.incoming.lock();
            incoming.requests.len() + incoming.controls.len()
        };
        let state = self.state();
        let deallocs = (state == RunState::ReadPurge
            || (self.config.independent_dealloc && state.allows_block_io()))
            && self.read_bufs.pending_deallocations() > 0;
        self.tokens.in_use() > 0
            || incoming > 0
            || (!self.queued.is_empty() && state.allows_block_io())
            || (!self.controls.is_empty() && state.allows_control())
            || deallocs
            || state == RunState::PmShutdown
    }

    /// When the next orphan scan is due, if any read buffer could be orphaned
    fn next_scan(&self) -> Option<Instant> {
        let held = self.read_bufs.outstanding() > 0;
        (held && self.state().allows_control())
            .then(|| self.last_orphan_scan + self.config.orphan_threshold() / 2)
    }

    /// Request a run-state change
    ///
    /// `PM_DRAIN` remembers the current state for [`Engine::resume`];
    /// `TERMINATING` and `DEAD` tear the engine down.
    pub fn request_state(&mut self, target: RunState) -> Result<()> {
        match target {
            RunState::Terminating | RunState::Dead => self.terminate("requested"),
            RunState::PmDrain => {
                let prev = self.shared.run_state.transition(RunState::PmDrain)?;
                self.pm_resume = Some(prev);
            }
            _ => {
                self.shared.run_state.transition(target)?;
            }
        }
        self.advance_state();
        self.publish();
        Ok(())
    }

    /// Wake from `PM_SLEEP` back into the state saved at drain time
    pub fn resume(&mut self) -> Result<()> {
        let state = self.state();
        if state != RunState::PmSleep {
            return Err(Error::IllegalTransition {
                from: state.to_string(),
                to: "resume".into(),
            });
        }
        self.hal
            .resume()
            .map_err(|e| Error::internal(format!("resume of {} failed: {e}", self.hal.name())))?;
        let target = self.pm_resume.take().unwrap_or(RunState::Running);
        self.shared.run_state.transition(target)?;
        self.publish();
        self.shared.wake();
        Ok(())
    }

    /// Take a dead engine back to `INIT`
    pub fn reset(&mut self) -> Result<()> {
        self.shared.run_state.transition(RunState::Init)?;
        debug_assert_eq!(self.tokens.in_use(), 0);
        self.core_bufs.reset();
        self.write_bufs.reset();
        self.read_bufs.reset();
        self.next_seq = 0;
        self.pm_resume = None;
        self.publish();
        info!("{}: reset", self.name());
        Ok(())
    }

    /// Read a configuration variable
    #[must_use]
    pub fn get_var(&self, var: ConfigVar) -> u64 {
        self.config.get(var)
    }

    /// Change a configuration variable at runtime
    pub fn set_var(&mut self, var: ConfigVar, value: u64) -> Result<()> {
        let desc = var.descriptor();
        if !desc.runtime {
            return Err(Error::configuration(format!(
                "{} cannot change while the engine exists",
                desc.name
            )));
        }
        self.config.set(var, value)?;
        info!("{}: {} = {}", self.name(), desc.name, value);
        if var == ConfigVar::MaxIncoming {
            self.shared
                .max_incoming
                .store(self.config.max_incoming as usize, Ordering::Relaxed);
        }
        self.publish();
        Ok(())
    }

    /// Verify token list membership and exclusive buffer ownership
    pub fn check_invariants(&self) -> Result<()> {
        self.tokens.check_invariants()?;
        let mut owned: [HashSet<BufferId>; 3] = Default::default();
        for list in [
            TokenList::Staged,
            TokenList::Active,
            TokenList::TimedOut,
            TokenList::Resumable,
            TokenList::Repeat,
            TokenList::Completed,
        ] {
            for token in self.tokens.iter(list) {
                for (slot, buf) in [token.core_buf, token.wr_buf, token.rd_buf].into_iter().enumerate() {
                    if let Some(buf) = buf
                        && !owned[slot].insert(buf)
                    {
                        return Err(Error::internal(format!("buffer {buf} owned twice")));
                    }
                }
            }
        }
        if owned[0].iter().any(|&b| !self.core_bufs.is_allocated(b))
            || owned[1].iter().any(|&b| !self.write_bufs.is_allocated(b))
        {
            return Err(Error::internal("token owns a free buffer"));
        }
        Ok(())
    }

    fn set_state(&self, to: RunState) -> bool {
        match self.shared.run_state.transition(to) {
            Ok(_) => true,
            Err(e) => {
                warn!("{}: {}", self.name(), e);
                false
            }
        }
    }

    /// Publish queue length, in-flight count and pending internal work to
    /// the shared side so the scheduler can scout the engine
    fn publish(&self) {
        self.shared
            .in_flight
            .store(self.tokens.in_use(), Ordering::Release);
        self.shared.needs_poll.store(self.has_work(), Ordering::Release);
        *self.shared.poll_at.lock() = self.next_scan();
        self.shared.set_queued(self.queued.len());
    }

    /// Fail everything queued, including work still in the incoming lists
    fn fail_queued(&mut self) {
        {
            let mut incoming = self.shared.incoming.lock();
            self.queued.extend(incoming.requests.drain(..));
            self.controls.extend(incoming.controls.drain(..));
        }
        for request in self.queued.drain(..) {
            request.complete(Err(IoError::Io));
        }
        for command in self.controls.drain(..) {
            command.complete(Err(IoError::Io));
        }
    }

    /// Declare the engine failed
    ///
    /// Moves to `TERMINATING`, force-fails every token and queued request,
    /// then settles in `DEAD`.
    pub(crate) fn terminate(&mut self, reason: &str) {
        match self.state() {
            RunState::Dead => return,
            RunState::Terminating => {}
            _ => {
                error!("{}: terminating: {}", self.name(), reason);
                if !self.set_state(RunState::Terminating) {
                    return;
                }
            }
        }

        for list in [
            TokenList::Staged,
            TokenList::Active,
            TokenList::TimedOut,
            TokenList::Resumable,
            TokenList::Repeat,
        ] {
            for id in self.tokens.snapshot(list) {
                if list != TokenList::Staged
                    && list != TokenList::Repeat
                    && let Err(e) = self.hal.reset_token(self.tokens.get(id))
                {
                    warn!("{}: reset of {} failed: {}", self.name(), id, e);
                }
                self.force_fail(id);
            }
        }
        self.deliver_completed(true);
        self.fail_queued();
        self.set_state(RunState::Dead);
        self.publish();
    }
}

#[cfg(test)]
mod tests;
