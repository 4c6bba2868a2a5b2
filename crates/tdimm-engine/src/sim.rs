//! In-memory device backend
//!
//! `SimHal` models the device side of the command protocol over a sparse
//! media map: write buffers, read buffers with device-side allocation
//! tracking, per-token in-flight commands with polled latency, optional
//! strict sequence ordering, and a control parameter table. A cloneable
//! [`SimControl`] shares the state for fault injection and inspection.

use crate::hal::{
    CommandFields, CommandWord, ControlKind, ExtStatus, Hal, HalError, HalResult, Opcode,
    TimeoutVerdict, TokenStatus,
};
use crate::pool::BufferId;
use crate::token::Token;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tdimm_common::{Geometry, IoError, PAGE_SIZE, SECTOR_SIZE};
use tracing::{debug, trace};

const PAGE: usize = PAGE_SIZE as usize;
const SECTOR: usize = SECTOR_SIZE as usize;

/// Which commands a fault rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    AnyCommand,
    /// Data commands (read, write, trim) whose sector range covers the sector
    Lba(u64),
    Opcode(Opcode),
}

/// What happens to a faulted command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fails with a retryable error
    Retryable,
    /// Never completes; the backend offers it for retry on timeout
    Timeout,
    /// Never completes; the backend declares it dead on timeout
    DeadTimeout,
    /// Hard device failure
    Fatal,
}

/// Fault injection rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRule {
    pub target: FaultTarget,
    pub kind: FaultKind,
    /// Matching commands to let through before the rule fires
    pub skip: u32,
    /// Times the rule fires
    pub remaining: u32,
}

impl FaultRule {
    #[must_use]
    pub const fn new(target: FaultTarget, kind: FaultKind, remaining: u32) -> Self {
        Self {
            target,
            kind,
            skip: 0,
            remaining,
        }
    }

    #[must_use]
    pub const fn after(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    fn matches(&self, cmd: &CommandFields) -> bool {
        match self.target {
            FaultTarget::AnyCommand => true,
            FaultTarget::Opcode(op) => cmd.opcode == op,
            FaultTarget::Lba(lba) => {
                matches!(cmd.opcode, Opcode::Read | Opcode::Write | Opcode::Trim)
                    && cmd.lba <= lba
                    && lba < cmd.lba + u64::from(cmd.sectors.max(1))
            }
        }
    }
}

/// Configuration of a simulated device
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    pub capacity_bytes: u64,
    pub max_request_bytes: u32,
    pub write_buffers: usize,
    pub read_buffers: usize,
    /// Status polls a command stays pending before it completes
    pub latency_polls: u32,
    /// Extended-status polls a finished read or control command defers
    pub ext_delay_polls: u32,
    /// Commands must complete in sequence-number order
    pub strict_sequence: bool,
    /// Read buffers start out held by the device and need a purge
    pub stale_read_buffers: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "sim0".into(),
            capacity_bytes: 64 << 20,
            max_request_bytes: 512 * 1024,
            write_buffers: 64,
            read_buffers: 64,
            latency_polls: 0,
            ext_delay_polls: 0,
            strict_sequence: false,
            stale_read_buffers: true,
        }
    }
}

#[derive(Debug)]
struct Inflight {
    cmd: CommandFields,
    polls_left: u32,
    ext_polls_left: u32,
    fault: Option<FaultKind>,
    finished: bool,
}

/// Counters kept by the simulated device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimCounters {
    pub commands: u64,
    pub reads: u64,
    pub writes: u64,
    pub trims: u64,
    pub deallocs: u64,
    pub seq_advances: u64,
    pub resets: u64,
    /// Read started into a buffer the device still held
    pub double_allocations: u64,
    /// Re-dispatch of the same command without flipping polarity
    pub polarity_violations: u64,
    /// Deallocation of a buffer the device did not hold
    pub spurious_deallocs: u64,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    media: HashMap<u64, Vec<u8>>,
    write_bufs: Vec<Vec<u8>>,
    read_bufs: Vec<Vec<u8>>,
    held_read_bufs: HashSet<u16>,
    inflight: HashMap<u16, Inflight>,
    last_dispatch: HashMap<u16, (u64, bool)>,
    faults: Vec<FaultRule>,
    stalled: Vec<(u64, u64)>,
    params: HashMap<u64, u64>,
    next_seq: u64,
    started: Vec<CommandFields>,
    counters: SimCounters,
    handshake_fails: bool,
    suspended: bool,
    /// Suspend requests still to be answered with `Busy`
    busy_suspends: u32,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let held_read_bufs = if config.stale_read_buffers {
            (0..config.read_buffers)
                .filter_map(|i| u16::try_from(i).ok())
                .collect()
        } else {
            HashSet::new()
        };
        Self {
            write_bufs: vec![vec![0; PAGE]; config.write_buffers],
            read_bufs: vec![vec![0; PAGE]; config.read_buffers],
            held_read_bufs,
            media: HashMap::new(),
            inflight: HashMap::new(),
            last_dispatch: HashMap::new(),
            faults: Vec::new(),
            stalled: Vec::new(),
            params: HashMap::new(),
            next_seq: 0,
            started: Vec::new(),
            counters: SimCounters::default(),
            handshake_fails: false,
            suspended: false,
            busy_suspends: 0,
            config,
        }
    }

    fn read_sectors(&self, lba: u64, dst: &mut [u8]) {
        for (i, chunk) in dst.chunks_mut(SECTOR).enumerate() {
            let sector = lba + i as u64;
            let page = sector * SECTOR_SIZE / PAGE_SIZE;
            let within = ((sector * SECTOR_SIZE) % PAGE_SIZE) as usize;
            match self.media.get(&page) {
                Some(data) => chunk.copy_from_slice(&data[within..within + chunk.len()]),
                None => chunk.fill(0),
            }
        }
    }

    fn write_sectors(&mut self, lba: u64, src: &[u8]) {
        for (i, chunk) in src.chunks(SECTOR).enumerate() {
            let sector = lba + i as u64;
            let page = sector * SECTOR_SIZE / PAGE_SIZE;
            let within = ((sector * SECTOR_SIZE) % PAGE_SIZE) as usize;
            let data = self.media.entry(page).or_insert_with(|| vec![0; PAGE]);
            data[within..within + chunk.len()].copy_from_slice(chunk);
        }
    }

    fn zero_sectors(&mut self, lba: u64, sectors: u64) {
        let zeros = vec![0u8; SECTOR];
        for s in 0..sectors {
            let sector = lba + s;
            let page = sector * SECTOR_SIZE / PAGE_SIZE;
            if self.media.contains_key(&page) {
                self.write_sectors(sector, &zeros);
                if self.media.get(&page).is_some_and(|d| d.iter().all(|&b| b == 0)) {
                    self.media.remove(&page);
                }
            }
        }
    }

    fn take_fault(&mut self, cmd: &CommandFields) -> Option<FaultKind> {
        for rule in &mut self.faults {
            if rule.remaining == 0 || !rule.matches(cmd) {
                continue;
            }
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            rule.remaining -= 1;
            return Some(rule.kind);
        }
        None
    }

    fn is_stalled(&self, cmd: &CommandFields) -> bool {
        let end = cmd.lba + u64::from(cmd.sectors.max(1));
        self.stalled.iter().any(|&(s, e)| s < end && cmd.lba < e)
    }

    fn release_dealloc(&mut self, buf: BufferId) {
        self.counters.deallocs += 1;
        if !self.held_read_bufs.remove(&buf.0) {
            self.counters.spurious_deallocs += 1;
        }
    }

    /// Apply a finished command's effect on media and buffers
    fn execute(&mut self, cmd: &CommandFields) -> TokenStatus {
        if let Some(buf) = cmd.dealloc_buf {
            self.release_dealloc(buf);
        }
        let bytes = cmd.transfer_bytes().min(PAGE);
        match cmd.opcode {
            Opcode::Read => {
                let Some(rd) = cmd.rd_buf.filter(|b| b.index() < self.read_bufs.len()) else {
                    return TokenStatus::Retry(IoError::Invalid);
                };
                let mut page = vec![0u8; PAGE];
                self.read_sectors(cmd.lba, &mut page[..bytes]);
                self.read_bufs[rd.index()] = page;
                self.counters.reads += 1;
            }
            Opcode::Write => {
                let Some(wr) = cmd.wr_buf.filter(|b| b.index() < self.write_bufs.len()) else {
                    return TokenStatus::Retry(IoError::Invalid);
                };
                let data = self.write_bufs[wr.index()][..bytes].to_vec();
                self.write_sectors(cmd.lba, &data);
                self.counters.writes += 1;
            }
            Opcode::Trim => {
                if cmd.param == 0 {
                    self.zero_sectors(cmd.lba, u64::from(cmd.sectors));
                } else {
                    for k in 0..cmd.stripes {
                        self.zero_sectors(cmd.lba + k * cmd.aux, cmd.param);
                    }
                }
                self.counters.trims += 1;
            }
            Opcode::Dealloc => {
                if let Some(rd) = cmd.rd_buf {
                    self.release_dealloc(rd);
                }
            }
            Opcode::Control => match cmd.control {
                ControlKind::SetParam => {
                    self.params.insert(cmd.param, cmd.aux);
                }
                ControlKind::GetParam | ControlKind::Nop | ControlKind::Flush => {}
            },
            Opcode::SeqAdvance => self.counters.seq_advances += 1,
        }
        TokenStatus::Done
    }
}

/// Shared handle for fault injection and inspection
#[derive(Clone)]
pub struct SimControl {
    state: Arc<Mutex<SimState>>,
}

impl SimControl {
    pub fn inject(&self, rule: FaultRule) {
        self.state.lock().faults.push(rule);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Hold every command touching the sector range until released
    pub fn stall(&self, lba: u64, sectors: u64) {
        self.state.lock().stalled.push((lba, lba + sectors));
    }

    pub fn release(&self) {
        self.state.lock().stalled.clear();
    }

    pub fn set_latency(&self, polls: u32) {
        self.state.lock().config.latency_polls = polls;
    }

    pub fn set_ext_delay(&self, polls: u32) {
        self.state.lock().config.ext_delay_polls = polls;
    }

    /// Answer the next `times` suspend requests with `Busy`
    pub fn refuse_suspend(&self, times: u32) {
        self.state.lock().busy_suspends = times;
    }

    pub fn fail_handshake(&self, fail: bool) {
        self.state.lock().handshake_fails = fail;
    }

    /// Read media directly, bypassing the command protocol
    #[must_use]
    pub fn read_media(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let mut out = vec![0u8; len];
        state.read_sectors(offset / SECTOR_SIZE, &mut out);
        out
    }

    /// Write media directly, bypassing the command protocol
    pub fn write_media(&self, offset: u64, data: &[u8]) {
        self.state.lock().write_sectors(offset / SECTOR_SIZE, data);
    }

    #[must_use]
    pub fn counters(&self) -> SimCounters {
        self.state.lock().counters.clone()
    }

    /// Every command started so far, in start order
    #[must_use]
    pub fn started(&self) -> Vec<CommandFields> {
        self.state.lock().started.clone()
    }

    /// Read buffers the device currently holds
    #[must_use]
    pub fn held_read_buffers(&self) -> usize {
        self.state.lock().held_read_bufs.len()
    }

    #[must_use]
    pub fn param(&self, id: u64) -> Option<u64> {
        self.state.lock().params.get(&id).copied()
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }
}

/// Simulated device backend
pub struct SimHal {
    name: String,
    geometry: Geometry,
    strict_sequence: bool,
    state: Arc<Mutex<SimState>>,
}

impl SimHal {
    #[must_use]
    pub fn new(config: SimConfig) -> (Self, SimControl) {
        let geometry = Geometry::new(config.capacity_bytes, SECTOR as u32, config.max_request_bytes);
        let hal = Self {
            name: config.name.clone(),
            geometry,
            strict_sequence: config.strict_sequence,
            state: Arc::new(Mutex::new(SimState::new(config))),
        };
        let control = SimControl {
            state: Arc::clone(&hal.state),
        };
        (hal, control)
    }

    fn start(&mut self, token: &Token, word: &CommandWord) -> HalResult<()> {
        let cmd = CommandFields::decode(word)?;
        if cmd.token != token.id.0 {
            return Err(HalError::BadCommand(format!(
                "command for token {} started on {}",
                cmd.token, token.id
            )));
        }
        let mut state = self.state.lock();
        if state.suspended {
            return Err(HalError::Busy);
        }
        if let Some(&(seq, odd)) = state.last_dispatch.get(&cmd.token)
            && seq == cmd.seq
            && odd == cmd.odd
            && token.retries + token.resets > 0
        {
            state.counters.polarity_violations += 1;
        }
        state.last_dispatch.insert(cmd.token, (cmd.seq, cmd.odd));

        // A read owns its device buffer from the moment it reaches the
        // device until an explicit deallocation, whatever its outcome.
        if cmd.opcode == Opcode::Read
            && let Some(rd) = cmd.rd_buf
            && !state.held_read_bufs.insert(rd.0)
        {
            state.counters.double_allocations += 1;
        }

        let fault = state.take_fault(&cmd);
        if fault.is_some() {
            debug!("{}: injecting {:?} into {:?}", self.name, fault, cmd.opcode);
        }
        let inflight = Inflight {
            cmd,
            polls_left: state.config.latency_polls,
            ext_polls_left: state.config.ext_delay_polls,
            fault,
            finished: false,
        };
        state.counters.commands += 1;
        state.started.push(cmd);
        state.inflight.insert(cmd.token, inflight);
        trace!("{}: started {:?} seq {} lba {}", self.name, cmd.opcode, cmd.seq, cmd.lba);
        Ok(())
    }
}

impl Hal for SimHal {
    fn name(&self) -> &str {
        &self.name
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn handshake(&mut self) -> HalResult<()> {
        let mut state = self.state.lock();
        if state.handshake_fails {
            return Err(HalError::NotPresent(self.name.clone()));
        }
        state.next_seq = 0;
        Ok(())
    }

    fn create_cmd(&mut self, token: &Token) -> HalResult<CommandWord> {
        Ok(CommandFields::from_token(token).encode())
    }

    fn start_token(&mut self, token: &Token, cmd: &CommandWord) -> HalResult<()> {
        self.start(token, cmd)
    }

    fn trim(&mut self, token: &Token, cmd: &CommandWord) -> HalResult<()> {
        let fields = CommandFields::decode(cmd)?;
        if fields.opcode != Opcode::Trim {
            return Err(HalError::BadCommand("trim with non-trim opcode".into()));
        }
        self.start(token, cmd)
    }

    fn reset_token(&mut self, token: &Token) -> HalResult<()> {
        let mut state = self.state.lock();
        state.inflight.remove(&token.id.0);
        state.counters.resets += 1;
        Ok(())
    }

    fn read_page(&mut self, buf: BufferId, dst: &mut [u8]) -> HalResult<()> {
        let state = self.state.lock();
        let src = state.read_bufs.get(buf.index()).ok_or(HalError::InvalidBuffer {
            kind: "read",
            id: buf.0,
        })?;
        let n = dst.len().min(PAGE);
        dst[..n].copy_from_slice(&src[..n]);
        Ok(())
    }

    fn write_page(&mut self, buf: BufferId, src: &[u8]) -> HalResult<()> {
        let mut state = self.state.lock();
        let dst = state.write_bufs.get_mut(buf.index()).ok_or(HalError::InvalidBuffer {
            kind: "write",
            id: buf.0,
        })?;
        let n = src.len().min(PAGE);
        dst[..n].copy_from_slice(&src[..n]);
        Ok(())
    }

    fn refresh_wep(&mut self, buf: BufferId) -> HalResult<()> {
        let state = self.state.lock();
        if buf.index() >= state.write_bufs.len() {
            return Err(HalError::InvalidBuffer {
                kind: "write",
                id: buf.0,
            });
        }
        Ok(())
    }

    fn read_status(&mut self, token: &Token) -> TokenStatus {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let next_seq = state.next_seq;
        let stalled = state
            .inflight
            .get(&token.id.0)
            .is_some_and(|f| state.is_stalled(&f.cmd));
        let Some(inflight) = state.inflight.get_mut(&token.id.0) else {
            return TokenStatus::TimedOut;
        };
        if inflight.finished {
            return TokenStatus::Done;
        }
        if stalled {
            return TokenStatus::Pending;
        }
        let fault = inflight.fault;
        if matches!(fault, Some(FaultKind::Timeout | FaultKind::DeadTimeout)) {
            return TokenStatus::Pending;
        }
        if inflight.polls_left > 0 {
            inflight.polls_left -= 1;
            return TokenStatus::Pending;
        }
        match fault {
            Some(FaultKind::Retryable) => {
                state.inflight.remove(&token.id.0);
                return TokenStatus::Retry(IoError::Io);
            }
            Some(FaultKind::Fatal) => {
                state.inflight.remove(&token.id.0);
                return TokenStatus::Fatal;
            }
            _ => {}
        }
        if self.strict_sequence && inflight.cmd.seq != next_seq {
            return TokenStatus::Pending;
        }

        let cmd = inflight.cmd;
        let status = state.execute(&cmd);
        if status == TokenStatus::Done {
            // Reads and control commands still report extended status
            if matches!(cmd.opcode, Opcode::Read | Opcode::Control) {
                if let Some(f) = state.inflight.get_mut(&token.id.0) {
                    f.finished = true;
                }
            } else {
                state.inflight.remove(&token.id.0);
            }
            if self.strict_sequence {
                state.next_seq += 1;
            }
        } else {
            state.inflight.remove(&token.id.0);
        }
        status
    }

    fn read_ext_status(&mut self, token: &Token) -> ExtStatus {
        let mut state = self.state.lock();
        let params_value = |state: &SimState, cmd: &CommandFields| match cmd.control {
            ControlKind::GetParam => state.params.get(&cmd.param).copied().unwrap_or(0),
            ControlKind::SetParam => cmd.aux,
            ControlKind::Nop | ControlKind::Flush => 0,
        };
        let Some(inflight) = state.inflight.get_mut(&token.id.0) else {
            return ExtStatus::Deferred;
        };
        if inflight.ext_polls_left > 0 {
            inflight.ext_polls_left -= 1;
            return ExtStatus::Deferred;
        }
        let cmd = inflight.cmd;
        let value = match cmd.opcode {
            Opcode::Read => cmd.rd_buf.map_or(u64::MAX, |b| u64::from(b.0)),
            Opcode::Control => params_value(&*state, &cmd),
            _ => 0,
        };
        state.inflight.remove(&token.id.0);
        ExtStatus::Ready(value)
    }

    fn handle_timeouts(&mut self, tokens: &[&Token]) -> TimeoutVerdict {
        let mut state = self.state.lock();
        let mut verdict = TimeoutVerdict::default();
        for token in tokens {
            let dead = state
                .inflight
                .remove(&token.id.0)
                .is_some_and(|f| f.fault == Some(FaultKind::DeadTimeout));
            if dead {
                verdict.dead.push(token.id);
            } else {
                verdict.retry.push(token.id);
            }
        }
        verdict
    }

    fn requires_sequence_advance(&self) -> bool {
        self.strict_sequence
    }

    fn suspend(&mut self) -> HalResult<()> {
        let mut state = self.state.lock();
        if !state.inflight.values().all(|f| f.finished) {
            return Err(HalError::Busy);
        }
        if state.busy_suspends > 0 {
            state.busy_suspends -= 1;
            return Err(HalError::Busy);
        }
        state.inflight.clear();
        state.suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> HalResult<()> {
        self.state.lock().suspended = false;
        Ok(())
    }
}

/// Ids of tokens a backend still tracks, for tests
#[cfg(test)]
pub(crate) fn inflight_ids(control: &SimControl) -> Vec<crate::token::TokenId> {
    use crate::token::TokenId;
    let mut ids: Vec<_> = control.state.lock().inflight.keys().map(|&k| TokenId(k)).collect();
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{Op, TokenId, TokenPool, TokenType};

    fn token(pool: &mut TokenPool, op: Op, lba: u64) -> TokenId {
        let id = pool.allocate(TokenType::Block).unwrap();
        let t = pool.get_mut(id);
        t.op = op;
        t.lba = lba;
        t.sectors = 8;
        id
    }

    fn dispatch(hal: &mut SimHal, pool: &TokenPool, id: TokenId) {
        let cmd = hal.create_cmd(pool.get(id)).unwrap();
        hal.start_token(pool.get(id), &cmd).unwrap();
    }

    #[test]
    fn test_write_then_read() {
        let (mut hal, control) = SimHal::new(SimConfig {
            stale_read_buffers: false,
            ..SimConfig::default()
        });
        let mut pool = TokenPool::new(4).unwrap();

        let w = token(&mut pool, Op::Write, 16);
        pool.get_mut(w).wr_buf = Some(BufferId(1));
        hal.write_page(BufferId(1), &[0x5A; 4096]).unwrap();
        dispatch(&mut hal, &pool, w);
        assert_eq!(hal.read_status(pool.get(w)), TokenStatus::Done);
        assert_eq!(control.read_media(16 * 512, 4096), vec![0x5A; 4096]);

        let r = token(&mut pool, Op::Read, 16);
        pool.get_mut(r).rd_buf = Some(BufferId(2));
        dispatch(&mut hal, &pool, r);
        assert_eq!(hal.read_status(pool.get(r)), TokenStatus::Done);
        assert_eq!(hal.read_ext_status(pool.get(r)), ExtStatus::Ready(2));
        let mut page = vec![0u8; 4096];
        hal.read_page(BufferId(2), &mut page).unwrap();
        assert_eq!(page, vec![0x5A; 4096]);
        assert_eq!(control.held_read_buffers(), 1);
    }

    #[test]
    fn test_latency_and_stall() {
        let (mut hal, control) = SimHal::new(SimConfig::default());
        control.set_latency(2);
        control.stall(0, 8);
        let mut pool = TokenPool::new(1).unwrap();
        let t = token(&mut pool, Op::Trim, 0);
        dispatch(&mut hal, &pool, t);
        for _ in 0..5 {
            assert_eq!(hal.read_status(pool.get(t)), TokenStatus::Pending);
        }
        control.release();
        assert_eq!(hal.read_status(pool.get(t)), TokenStatus::Pending);
        assert_eq!(hal.read_status(pool.get(t)), TokenStatus::Pending);
        assert_eq!(hal.read_status(pool.get(t)), TokenStatus::Done);
    }

    #[test]
    fn test_refused_suspend_reports_busy() {
        let (mut hal, control) = SimHal::new(SimConfig::default());
        control.refuse_suspend(2);
        assert!(matches!(hal.suspend(), Err(HalError::Busy)));
        assert!(matches!(hal.suspend(), Err(HalError::Busy)));
        assert!(!control.is_suspended());
        hal.suspend().unwrap();
        assert!(control.is_suspended());
    }

    #[test]
    fn test_fault_rules() {
        let (mut hal, control) = SimHal::new(SimConfig::default());
        control.inject(FaultRule::new(FaultTarget::Lba(4), FaultKind::Retryable, 1).after(1));
        let mut pool = TokenPool::new(1).unwrap();
        let t = token(&mut pool, Op::Trim, 0);

        dispatch(&mut hal, &pool, t);
        assert_eq!(hal.read_status(pool.get(t)), TokenStatus::Done);
        dispatch(&mut hal, &pool, t);
        assert_eq!(hal.read_status(pool.get(t)), TokenStatus::Retry(IoError::Io));
        dispatch(&mut hal, &pool, t);
        assert_eq!(hal.read_status(pool.get(t)), TokenStatus::Done);
    }

    #[test]
    fn test_timeout_partition() {
        let (mut hal, control) = SimHal::new(SimConfig::default());
        control.inject(FaultRule::new(FaultTarget::Lba(0), FaultKind::DeadTimeout, 1));
        control.inject(FaultRule::new(FaultTarget::Lba(8), FaultKind::Timeout, 1));
        let mut pool = TokenPool::new(2).unwrap();
        let a = token(&mut pool, Op::Trim, 0);
        let b = token(&mut pool, Op::Trim, 8);
        dispatch(&mut hal, &pool, a);
        dispatch(&mut hal, &pool, b);
        assert_eq!(hal.read_status(pool.get(a)), TokenStatus::Pending);
        assert_eq!(hal.read_status(pool.get(b)), TokenStatus::Pending);
        let verdict = hal.handle_timeouts(&[pool.get(a), pool.get(b)]);
        assert_eq!(verdict.dead, vec![a]);
        assert_eq!(verdict.retry, vec![b]);
        assert!(inflight_ids(&control).is_empty());
    }

    #[test]
    fn test_strict_sequence_orders_completion() {
        let (mut hal, _control) = SimHal::new(SimConfig {
            strict_sequence: true,
            ..SimConfig::default()
        });
        let mut pool = TokenPool::new(2).unwrap();
        let first = token(&mut pool, Op::Trim, 0);
        let second = token(&mut pool, Op::Trim, 8);
        pool.get_mut(first).seq = Some(0);
        pool.get_mut(second).seq = Some(1);
        dispatch(&mut hal, &pool, second);
        assert_eq!(hal.read_status(pool.get(second)), TokenStatus::Pending);
        dispatch(&mut hal, &pool, first);
        assert_eq!(hal.read_status(pool.get(first)), TokenStatus::Done);
        assert_eq!(hal.read_status(pool.get(second)), TokenStatus::Done);
    }

    #[test]
    fn test_polarity_violation_counted() {
        let (mut hal, control) = SimHal::new(SimConfig::default());
        let mut pool = TokenPool::new(1).unwrap();
        let t = token(&mut pool, Op::Trim, 0);
        dispatch(&mut hal, &pool, t);
        pool.get_mut(t).retries = 1;
        dispatch(&mut hal, &pool, t);
        assert_eq!(control.counters().polarity_violations, 1);

        let mut cmd = hal.create_cmd(pool.get(t)).unwrap();
        hal.reverse_cmd_polarity(&mut cmd);
        hal.start_token(pool.get(t), &cmd).unwrap();
        assert_eq!(control.counters().polarity_violations, 1);
    }
}
