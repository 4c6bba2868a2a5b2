//! Admission: moving queued work onto the device

use super::Engine;
use crate::biogrp::{DiscardGeometry, fragment_count, fragment_spans, split, split_discard};
use crate::pool::BufferId;
use crate::request::{Request, SplitFlags};
use crate::run_state::RunState;
use crate::stats::{add, bump};
use crate::token::{Op, RmwPhase, TokenId, TokenList, TokenType};
use std::time::Instant;
use tdimm_common::{
    CollisionMode, Direction, Error, IoError, MAX_SPLIT_FRAGMENTS, PAGE_SIZE, SECTOR_SIZE,
    SECTORS_PER_PAGE, bytes_to_sectors, is_sector_aligned, page_floor,
};
use tracing::{debug, trace, warn};

const fn page_ceil(bytes: u64) -> u64 {
    page_floor(bytes + PAGE_SIZE - 1)
}

/// Whether `[offset, offset + size)` stays inside one page
const fn within_page(offset: u64, size: u64) -> bool {
    page_floor(offset) == page_floor(offset + size - 1)
}

fn sector_count(bytes: u64) -> u32 {
    u32::try_from(bytes_to_sectors(bytes)).unwrap_or(u32::MAX)
}

/// Resources one request needs to dispatch completely
#[derive(Debug, Default, Clone, Copy)]
struct Need {
    tokens: usize,
    core: usize,
    write: usize,
    read: usize,
}

impl Engine {
    /// Admission pass
    ///
    /// Issues pending deallocations, starts control commands and dispatches
    /// queued block requests as far as tokens and buffers allow. Returns the
    /// number of tokens started.
    pub fn io_begin(&mut self) -> usize {
        self.splice_incoming();
        let state = self.state();
        if state.is_failed() {
            self.fail_queued();
            return 0;
        }
        if matches!(state, RunState::PmShutdown | RunState::PmSleep) {
            return 0;
        }

        let mut started = 0;
        let purging = state == RunState::ReadPurge;
        if purging || (self.config.independent_dealloc && state.allows_block_io()) {
            started += self.issue_deallocs(self.config.dealloc_burst as usize);
            if purging {
                return started;
            }
        }

        self.scan_orphans(Instant::now());
        if state.allows_control() {
            started += self.start_controls();
        }

        let timed_out = self.timed_out_count();
        if timed_out > self.config.timeout_abort_threshold as usize {
            self.terminate(&format!("{timed_out} tokens timed out"));
            return started;
        }

        if state.allows_block_io() {
            started += self.start_requests();
            // Queue blocked on read buffers: push deallocations out even in
            // piggyback mode, nothing else would carry them.
            if !self.queued.is_empty()
                && self.read_bufs.free_count() == 0
                && self.read_bufs.pending_deallocations() > 0
            {
                started += self.issue_deallocs(self.config.dealloc_burst.max(1) as usize);
            }
        }
        self.publish();
        started
    }

    fn splice_incoming(&mut self) {
        let mut incoming = self.shared.incoming.lock();
        self.queued.extend(incoming.requests.drain(..));
        self.controls.extend(incoming.controls.drain(..));
        self.shared
            .queued_len
            .store(self.queued.len(), std::sync::atomic::Ordering::Release);
    }

    /// Start independent deallocation tokens, at most `limit`
    fn issue_deallocs(&mut self, limit: usize) -> usize {
        let mut issued = 0;
        while issued < limit && self.read_bufs.pending_deallocations() > 0 {
            let Some(id) = self.tokens.allocate(TokenType::Maintenance) else {
                break;
            };
            let Some(buf) = self.read_bufs.next_to_deallocate() else {
                self.tokens.free(id);
                break;
            };
            let token = self.tokens.get_mut(id);
            token.op = Op::Dealloc;
            token.dealloc_buf = Some(buf);
            token.independent_dealloc = true;
            self.launch(id);
            issued += 1;
        }
        if issued > 0 {
            trace!("{}: issued {} deallocations", self.name(), issued);
        }
        issued
    }

    fn scan_orphans(&mut self, now: Instant) {
        let threshold = self.config.orphan_threshold();
        if now.saturating_duration_since(self.last_orphan_scan) < threshold / 2 {
            return;
        }
        self.last_orphan_scan = now;
        let tokens = &self.tokens;
        let recovered = self
            .read_bufs
            .recover_orphans(now, threshold, |buf| tokens.any_live(|t| t.rd_buf == Some(buf)));
        if recovered > 0 {
            add(&self.shared.stats.orphans_recovered, recovered as u64);
        }
    }

    fn start_controls(&mut self) -> usize {
        let mut started = 0;
        while let Some(command) = self.controls.pop_front() {
            let Some(id) = self.tokens.allocate(TokenType::Control) else {
                self.controls.push_front(command);
                break;
            };
            let token = self.tokens.get_mut(id);
            token.op = Op::Control(command.op);
            token.control = Some(command);
            bump(&self.shared.stats.control_commands);
            self.launch(id);
            started += 1;
        }
        started
    }

    /// Tokens that have timed out at least once and are still live
    fn timed_out_count(&self) -> usize {
        self.tokens
            .count_live(|t| t.list() == TokenList::TimedOut || t.timeouts > 0)
    }

    fn start_requests(&mut self) -> usize {
        let mut started = 0;
        let burst = self.config.max_burst as usize;
        while started < burst {
            let Some(request) = self.queued.pop_front() else {
                break;
            };
            if let Err(e) = self.validate(&request) {
                warn!(
                    "{}: rejecting {} {}+{}: {}",
                    self.name(),
                    request.direction,
                    request.offset,
                    request.size,
                    e
                );
                request.complete(Err(IoError::Invalid));
                continue;
            }

            // Nothing starts next to a synchronous request
            if self.state() == RunState::SyncIo {
                self.queued.push_front(request);
                break;
            }
            let serializing = request.flags.serializing();
            if serializing && self.tokens.any_live(|t| t.ty == TokenType::Block) {
                self.queued.push_front(request);
                break;
            }
            if self.collides(&request) {
                bump(&self.shared.stats.collisions);
                trace!(
                    "{}: {}+{} collides with in-flight work",
                    self.name(),
                    request.offset,
                    request.size
                );
                self.queued.push_front(request);
                break;
            }
            if !self.can_satisfy(self.need_for(&request)) {
                bump(&self.shared.stats.requeues);
                trace!("{}: out of resources for {}+{}", self.name(), request.offset, request.size);
                self.queued.push_front(request);
                break;
            }
            if serializing && !self.set_state(RunState::SyncIo) {
                self.queued.push_front(request);
                break;
            }
            started += self.dispatch(request);
        }
        started
    }

    fn validate(&self, request: &Request) -> Result<(), Error> {
        let geo = self.shared.geometry;
        if request.size == 0 {
            return Err(Error::invalid_request(if request.flags.barrier {
                "empty barrier"
            } else {
                "empty request"
            }));
        }
        if !is_sector_aligned(request.offset) || !is_sector_aligned(request.size) {
            return Err(Error::invalid_request("not sector aligned"));
        }
        if !geo.contains(request.offset, request.size) {
            return Err(Error::invalid_request("beyond device capacity"));
        }
        if request.direction != Direction::Discard {
            let limit = geo.max_request_bytes.min(self.config.max_request_bytes);
            if request.size > u64::from(limit) {
                return Err(Error::invalid_request("larger than the maximum request size"));
            }
            if (request.buf.len() as u64) < request.size {
                return Err(Error::invalid_request("data buffer shorter than the request"));
            }
        }
        Ok(())
    }

    /// Whether a request overlaps in-flight work the collision mode guards
    fn collides(&self, request: &Request) -> bool {
        let (start, end) = request.span();
        let rmw = request.direction == Direction::Write
            && (start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0);
        // An RMW touches the whole page around the request
        let (start, end) = if rmw {
            (page_floor(start), page_ceil(end))
        } else {
            (start, end)
        };
        let writes = request.direction.is_write();
        let tokens = &self.tokens;
        match self.config.collision_mode {
            CollisionMode::None => false,
            CollisionMode::RmwOnly => tokens.any_live(|t| {
                t.ty == TokenType::Block && (rmw || t.rmw.is_some()) && t.overlaps(start, end)
            }),
            CollisionMode::AnyWrite => tokens.any_live(|t| {
                t.ty == TokenType::Block
                    && (writes || t.op.is_write() || t.rmw.is_some())
                    && t.overlaps(start, end)
            }),
            CollisionMode::AnyAccess => {
                tokens.any_live(|t| t.ty == TokenType::Block && t.overlaps(start, end))
            }
        }
    }

    fn discard_geometry(&self) -> DiscardGeometry {
        DiscardGeometry {
            sector_size: SECTOR_SIZE,
            stripe_bytes: self.config.discard_stripe_bytes,
            backends: u64::from(self.config.discard_backends),
            max_stripes: u64::from(self.config.max_discard_stripes),
        }
    }

    fn need_for(&self, request: &Request) -> Need {
        let (offset, size) = (request.offset, request.size);
        match request.direction {
            Direction::Discard => {
                let n = if request.split_flags.contains(SplitFlags::DISCARD_PIECE) {
                    1
                } else {
                    crate::biogrp::discard_fragment_count(offset, size, &self.discard_geometry())
                };
                if n > MAX_SPLIT_FRAGMENTS {
                    // Rejected at split time
                    return Need::default();
                }
                Need {
                    tokens: n,
                    core: n,
                    ..Need::default()
                }
            }
            Direction::Read => {
                let n = fragment_count(offset, size, PAGE_SIZE);
                Need {
                    tokens: n,
                    core: n,
                    read: n,
                    ..Need::default()
                }
            }
            Direction::Write => {
                let copies = usize::from(self.config.sec_copies.max(1));
                let mut need = Need::default();
                for (start, len) in fragment_spans(offset, size, PAGE_SIZE) {
                    if len == PAGE_SIZE && start % PAGE_SIZE == 0 {
                        need.tokens += copies;
                        need.core += copies;
                        need.write += copies;
                    } else {
                        need.tokens += 1;
                        need.core += 1;
                        need.write += 1;
                        need.read += 1;
                    }
                }
                need
            }
        }
    }

    fn can_satisfy(&self, need: Need) -> bool {
        self.tokens.len(TokenList::Free) >= need.tokens
            && self.core_bufs.free_count() >= need.core
            && self.write_bufs.free_count() >= need.write
            && self.read_bufs.free_count() >= need.read
    }

    /// Split a request into fragments and launch them
    ///
    /// Fragments that cannot get resources go back to the head of the
    /// queue in order, marked as requeued.
    fn dispatch(&mut self, request: Request) -> usize {
        let mut fragments = Vec::new();
        let single = match request.direction {
            Direction::Discard => request.split_flags.contains(SplitFlags::DISCARD_PIECE),
            _ => within_page(request.offset, request.size),
        };
        let split_result = if single {
            fragments.push(request);
            Ok(1)
        } else if request.direction == Direction::Discard {
            let geo = self.discard_geometry();
            split_discard(request, &geo, |_, f| fragments.push(f))
        } else {
            split(request, PAGE_SIZE, |_, f| fragments.push(f))
        };
        match split_result {
            Ok(n) => add(&self.shared.stats.fragments, n as u64),
            Err(rejected) => {
                warn!("{}: {}", self.name(), rejected.error);
                rejected.fail();
                return 0;
            }
        }

        let mut started = 0;
        let mut fragments = fragments.into_iter();
        while let Some(fragment) = fragments.next() {
            match self.launch_fragment(fragment) {
                Ok(n) => started += n,
                Err(fragment) => {
                    let rest: Vec<Request> = std::iter::once(fragment).chain(fragments).collect();
                    debug!("{}: requeueing {} fragments", self.name(), rest.len());
                    for mut f in rest.into_iter().rev() {
                        f.split_flags.insert(SplitFlags::REQUEUED);
                        self.queued.push_front(f);
                    }
                    bump(&self.shared.stats.requeues);
                    break;
                }
            }
        }
        started
    }

    fn launch_fragment(&mut self, fragment: Request) -> Result<usize, Request> {
        match fragment.direction {
            Direction::Read => {
                let Some(id) = self.alloc_block(false, true) else {
                    return Err(fragment);
                };
                let token = self.tokens.get_mut(id);
                token.op = Op::Read;
                token.lba = bytes_to_sectors(fragment.offset);
                token.sectors = sector_count(fragment.size);
                token.span = fragment.span();
                token.request = Some(fragment);
                self.launch(id);
                Ok(1)
            }
            Direction::Discard => {
                let Some(id) = self.alloc_block(false, false) else {
                    return Err(fragment);
                };
                let token = self.tokens.get_mut(id);
                token.op = Op::Trim;
                token.lba = bytes_to_sectors(fragment.offset);
                token.sectors = sector_count(fragment.size);
                token.discard = fragment.discard;
                token.span = fragment.span();
                token.request = Some(fragment);
                self.launch(id);
                Ok(1)
            }
            Direction::Write if fragment.size == PAGE_SIZE && fragment.offset % PAGE_SIZE == 0 => {
                self.launch_write(fragment)
            }
            Direction::Write => self.launch_rmw(fragment),
        }
    }

    /// Allocate a block token with its buffers, all or nothing
    fn alloc_block(&mut self, write: bool, read: bool) -> Option<TokenId> {
        let id = self.tokens.allocate(TokenType::Block)?;
        let core = self.core_bufs.allocate();
        let wr = if write { self.write_bufs.allocate() } else { None };
        let rd = if read {
            self.read_bufs.allocate(Instant::now())
        } else {
            None
        };
        if core.is_none() || (write && wr.is_none()) || (read && rd.is_none()) {
            if let Some(b) = core {
                self.core_bufs.free(b);
            }
            if let Some(b) = wr {
                self.write_bufs.free(b);
            }
            if let Some(b) = rd {
                self.read_bufs.free(b);
            }
            self.tokens.free(id);
            return None;
        }
        let token = self.tokens.get_mut(id);
        token.core_buf = core;
        token.wr_buf = wr;
        token.rd_buf = rd;
        token.independent_dealloc = self.config.independent_dealloc;
        Some(id)
    }

    /// Full-page write, one token per configured copy
    fn launch_write(&mut self, fragment: Request) -> Result<usize, Request> {
        let copies = usize::from(self.config.sec_copies.max(1));
        let mut ids = Vec::with_capacity(copies);
        for _ in 0..copies {
            match self.alloc_block(true, false) {
                Some(id) => ids.push(id),
                None => {
                    for id in ids {
                        self.release_buffers(id);
                        self.tokens.free(id);
                    }
                    return Err(fragment);
                }
            }
        }

        let data = fragment.buf.to_vec();
        let (lba, span) = (bytes_to_sectors(fragment.offset), fragment.span());
        let mut fragment = Some(fragment);
        for (i, &id) in ids.iter().enumerate() {
            let wr = self.tokens.get(id).wr_buf;
            let staged = match wr {
                Some(wr) => self.stage_page(wr, &data),
                None => Err(IoError::NoMemory),
            };
            let token = self.tokens.get_mut(id);
            token.op = Op::Write;
            token.lba = lba;
            token.sectors = sector_count(PAGE_SIZE);
            token.span = span;
            if copies > 1 {
                token.early_commit = true;
                token.buddy = Some(ids[(i + 1) % copies]);
            }
            if i == 0 {
                token.request = fragment.take();
            }
            match staged {
                Ok(()) => self.launch(id),
                Err(e) => {
                    warn!("{}: staging write data for {} failed: {}", self.name(), id, e);
                    let token = self.tokens.get_mut(id);
                    token.result = Err(e);
                    token.sec = crate::token::SecOutcome::Failed;
                    self.tokens.move_to(id, TokenList::Completed);
                }
            }
        }
        Ok(copies)
    }

    /// Partial-page write: read the page first, merge, then write it back
    fn launch_rmw(&mut self, fragment: Request) -> Result<usize, Request> {
        let Some(id) = self.alloc_block(true, true) else {
            return Err(fragment);
        };
        let page = page_floor(fragment.offset);
        let token = self.tokens.get_mut(id);
        token.op = Op::Read;
        token.rmw = Some(RmwPhase::Read);
        token.lba = bytes_to_sectors(page);
        token.sectors = sector_count(SECTORS_PER_PAGE * SECTOR_SIZE);
        token.span = (page, page + PAGE_SIZE);
        token.request = Some(fragment);
        bump(&self.shared.stats.rmw);
        self.launch(id);
        Ok(1)
    }

    pub(super) fn stage_page(&mut self, wr: BufferId, data: &[u8]) -> Result<(), IoError> {
        self.hal
            .write_page(wr, data)
            .and_then(|()| self.hal.refresh_wep(wr))
            .map_err(|e| e.io_error())
    }

    /// Hand a staged token to the device
    ///
    /// First dispatch builds a fresh command word; a retry of an unchanged
    /// command reuses the cached word with its polarity reversed. Either
    /// way the token's odd bit flips, so the device never sees the same
    /// sequence number with the same polarity twice.
    pub(super) fn launch(&mut self, id: TokenId) {
        let independent = self.config.independent_dealloc;
        let token = self.tokens.get_mut(id);
        token.odd = !token.odd;
        if token.seq.is_none() {
            token.seq = Some(self.next_seq);
            self.next_seq += 1;
        }
        let carries_payload = matches!(token.op, Op::Read | Op::Write | Op::Trim | Op::Control(_));
        if !independent && carries_payload && token.cmd.is_none() && token.dealloc_buf.is_none() {
            token.dealloc_buf = self.read_bufs.next_to_deallocate();
        }

        let cached = self.tokens.get(id).cmd;
        let word = match cached {
            Some(mut word) => {
                self.hal.reverse_cmd_polarity(&mut word);
                Ok(word)
            }
            None => self.hal.create_cmd(self.tokens.get(id)),
        };
        let started = word.and_then(|word| {
            let token = self.tokens.get(id);
            match token.op {
                Op::Trim => self.hal.trim(token, &word),
                Op::Dealloc => self.hal.deallocate(token, &word),
                _ => self.hal.start_token(token, &word),
            }
            .map(|()| word)
        });

        let token = self.tokens.get_mut(id);
        token.started = Some(Instant::now());
        match started {
            Ok(word) => {
                token.cmd = Some(word);
                trace!(
                    "{}: start {} {} lba {} seq {:?}",
                    self.shared.name,
                    id,
                    token.op.as_str(),
                    token.lba,
                    token.seq
                );
                self.tokens.move_to(id, TokenList::Active);
                bump(&self.shared.stats.tokens_dispatched);
            }
            Err(e) => {
                warn!("{}: dispatch of {} failed: {}", self.shared.name, id, e);
                token.cmd = None;
                token.result = Err(e.io_error());
                self.tokens.move_to(id, TokenList::Repeat);
            }
        }
    }
}
