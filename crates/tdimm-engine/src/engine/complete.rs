//! Completion: reaping tokens, retries and delivery

use super::Engine;
use crate::hal::{ExtStatus, HalError, RetryDecision, TokenStatus};
use crate::run_state::RunState;
use crate::stats::bump;
use crate::token::{Op, RmwPhase, SecOutcome, TokenId, TokenList, TokenType};
use std::time::Instant;
use tdimm_common::{IoError, PAGE_SIZE, page_floor};
use tracing::{debug, error, trace, warn};

/// Outcome of one delivery pass
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Delivery {
    pub(super) count: usize,
    /// Every copy of a multi-copy write failed
    pub(super) fatal: bool,
}

impl Engine {
    /// Completion pass
    ///
    /// Polls every active token (optionally only those of one type), runs
    /// retries and delivers finished work. Returns the number of tokens
    /// delivered.
    pub fn io_complete(&mut self, filter: Option<TokenType>) -> usize {
        let wanted = |ty: TokenType| filter.is_none_or(|f| f == ty);
        let now = Instant::now();
        let timeout = self.config.timeout();
        let mut fatal = false;

        for id in self.tokens.snapshot(TokenList::Active) {
            let token = self.tokens.get(id);
            if !wanted(token.ty) {
                continue;
            }
            match self.hal.read_status(token) {
                TokenStatus::Pending => {
                    let expired = token
                        .started
                        .is_some_and(|s| now.saturating_duration_since(s) > timeout);
                    if expired && self.on_timeout(id) {
                        return 0;
                    }
                }
                TokenStatus::TimedOut => {
                    if self.on_timeout(id) {
                        return 0;
                    }
                }
                TokenStatus::Done => self.on_done(id),
                TokenStatus::Retry(err) => {
                    debug!("{}: {} {} needs retry: {}", self.name(), id, token.op.as_str(), err);
                    self.tokens.get_mut(id).result = Err(err);
                    self.release_for_retry(id);
                    self.tokens.move_to(id, TokenList::Repeat);
                }
                TokenStatus::Fatal => {
                    error!("{}: {} {} failed fatally", self.name(), id, token.op.as_str());
                    self.tokens.get_mut(id).result = Err(IoError::Io);
                    self.tokens.move_to(id, TokenList::Completed);
                    fatal = true;
                }
            }
        }
        if fatal {
            self.terminate("device reported a fatal error");
            return 0;
        }

        for id in self.tokens.snapshot(TokenList::Resumable) {
            let token = self.tokens.get(id);
            if !wanted(token.ty) {
                continue;
            }
            if let ExtStatus::Ready(value) = self.hal.read_ext_status(token) {
                self.finish_done(id, value);
            }
        }

        self.sweep_timeouts(&wanted);

        for id in self.tokens.snapshot(TokenList::Repeat) {
            if wanted(self.tokens.get(id).ty) {
                self.retry(id);
            }
        }

        let delivery = self.deliver_completed(false);
        if delivery.fatal {
            self.terminate("every copy of a write failed");
            return delivery.count;
        }
        self.advance_state();
        self.publish();
        delivery.count
    }

    /// Returns true when the engine was halted
    fn on_timeout(&mut self, id: TokenId) -> bool {
        let token = self.tokens.get_mut(id);
        token.timeouts += 1;
        bump(&self.shared.stats.timeouts);
        warn!(
            "{}: {} {} lba {} timed out ({} so far)",
            self.shared.name,
            id,
            token.op.as_str(),
            token.lba,
            token.timeouts
        );
        if self.config.halt_on_timeout {
            self.terminate("command timed out with halt-on-timeout set");
            return true;
        }
        self.tokens.move_to(id, TokenList::TimedOut);
        false
    }

    /// Let the backend sort timed-out tokens into retryable and dead ones
    fn sweep_timeouts(&mut self, wanted: &impl Fn(TokenType) -> bool) {
        let timed_out: Vec<TokenId> = self
            .tokens
            .snapshot(TokenList::TimedOut)
            .into_iter()
            .filter(|&id| wanted(self.tokens.get(id).ty))
            .collect();
        if timed_out.is_empty() {
            return;
        }
        let verdict = {
            let refs: Vec<_> = timed_out.iter().map(|&id| self.tokens.get(id)).collect();
            self.hal.handle_timeouts(&refs)
        };
        for id in timed_out {
            if verdict.dead.contains(&id) {
                self.tokens.get_mut(id).result = Err(IoError::Timeout);
                self.exhausted(id);
                continue;
            }
            if let Err(e) = self.hal.reset_token(self.tokens.get(id)) {
                warn!("{}: reset of {} failed: {}", self.name(), id, e);
            }
            let token = self.tokens.get_mut(id);
            token.resets += 1;
            token.result = Err(IoError::Timeout);
            self.release_for_retry(id);
            self.tokens.move_to(id, TokenList::Repeat);
        }
    }

    fn on_done(&mut self, id: TokenId) {
        let token = self.tokens.get(id);
        if !matches!(token.op, Op::Read | Op::Control(_)) {
            self.finish_done(id, 0);
            return;
        }
        match self.hal.read_ext_status(token) {
            ExtStatus::Ready(value) => self.finish_done(id, value),
            ExtStatus::Deferred => {
                trace!("{}: {} extended status deferred", self.name(), id);
                self.tokens.get_mut(id).ext_deferred = true;
                self.tokens.move_to(id, TokenList::Resumable);
            }
        }
    }

    /// The device finished a token successfully
    fn finish_done(&mut self, id: TokenId, value: u64) {
        let token = self.tokens.get_mut(id);
        token.ext_deferred = false;
        if let Some(buf) = token.dealloc_buf.take() {
            self.read_bufs.deallocated(buf);
            bump(&self.shared.stats.deallocations);
        }
        match (token.op, token.rmw) {
            (Op::Read, Some(RmwPhase::Read)) => self.rmw_merge(id, value),
            (Op::Read, _) => self.read_done(id, value),
            (Op::Write, _) => {
                if token.early_commit {
                    token.sec = SecOutcome::Succeeded;
                }
                self.tokens.move_to(id, TokenList::Completed);
            }
            (Op::Control(_), _) => {
                token.control_value = value;
                self.tokens.move_to(id, TokenList::Completed);
            }
            (Op::SeqAdvance, _) => {
                trace!("{}: sequence {:?} consumed", self.shared.name, token.seq);
                self.tokens.move_to(id, TokenList::Completed);
            }
            (Op::Trim | Op::Dealloc, _) => self.tokens.move_to(id, TokenList::Completed),
        }
    }

    /// Copy a finished read's page out of its device buffer
    ///
    /// Returns the page, or `None` after sending the token back for a
    /// retry.
    fn take_read_page(&mut self, id: TokenId, value: u64) -> Option<Vec<u8>> {
        let Some(rd) = self.tokens.get(id).rd_buf else {
            self.tokens.get_mut(id).result = Err(IoError::Io);
            self.tokens.move_to(id, TokenList::Repeat);
            return None;
        };
        if value != u64::from(rd.0) {
            warn!("{}: {} landed in buffer {} instead of {}", self.name(), id, value, rd);
            self.tokens.get_mut(id).result = Err(IoError::Io);
            self.release_for_retry(id);
            self.tokens.move_to(id, TokenList::Repeat);
            return None;
        }
        let mut page = std::mem::take(&mut self.tokens.get_mut(id).scratch);
        page.resize(PAGE_SIZE as usize, 0);
        if let Err(e) = self.hal.read_page(rd, &mut page) {
            warn!("{}: fetching {} from buffer {} failed: {}", self.name(), id, rd, e);
            self.tokens.get_mut(id).result = Err(e.io_error());
            self.release_for_retry(id);
            self.tokens.move_to(id, TokenList::Repeat);
            return None;
        }
        self.read_bufs.schedule_deallocation(rd);
        self.tokens.get_mut(id).rd_buf = None;
        Some(page)
    }

    fn read_done(&mut self, id: TokenId, value: u64) {
        let Some(page) = self.take_read_page(id, value) else {
            return;
        };
        let token = self.tokens.get_mut(id);
        let len = (token.sectors as usize * tdimm_common::SECTOR_SIZE as usize).min(page.len());
        if let Some(request) = &token.request {
            request.buf.copy_from(0, &page[..len]);
        }
        token.scratch = page;
        self.tokens.move_to(id, TokenList::Completed);
    }

    /// First half of a read-modify-write is back: merge and write the page
    fn rmw_merge(&mut self, id: TokenId, value: u64) {
        let Some(mut page) = self.take_read_page(id, value) else {
            return;
        };
        let token = self.tokens.get(id);
        if let Some(request) = &token.request {
            let within = (request.offset - page_floor(request.offset)) as usize;
            let len = request.size as usize;
            request.buf.copy_to(0, &mut page[within..within + len]);
        }
        let wr = token.wr_buf;
        let staged = match wr {
            Some(wr) => self.stage_page(wr, &page),
            None => Err(IoError::NoMemory),
        };

        let token = self.tokens.get_mut(id);
        token.scratch = page;
        if let Err(e) = staged {
            warn!("{}: staging merged page for {} failed: {}", self.shared.name, id, e);
            token.result = Err(e);
            self.tokens.move_to(id, TokenList::Completed);
            return;
        }
        token.op = Op::Write;
        token.rmw = Some(RmwPhase::Write);
        token.cmd = None;
        token.seq = None;
        token.retries = 0;
        token.result = Ok(());
        self.launch(id);
    }

    /// Give back the read buffer of a read that has to be retried
    ///
    /// The device may have filled it, so it goes through deallocation and
    /// the retry gets a fresh one.
    fn release_for_retry(&mut self, id: TokenId) {
        let token = self.tokens.get_mut(id);
        if token.op == Op::Read
            && let Some(rd) = token.rd_buf.take()
        {
            self.read_bufs.schedule_deallocation(rd);
            token.cmd = None;
        }
    }

    /// Whether another copy of this token's write has committed
    fn buddy_committed(&self, id: TokenId) -> bool {
        self.sec_ring(id)
            .into_iter()
            .any(|b| b != id && self.tokens.get(b).sec == SecOutcome::Succeeded)
    }

    /// All tokens of a multi-copy write, starting with `id`
    fn sec_ring(&self, id: TokenId) -> Vec<TokenId> {
        let mut ring = vec![id];
        let mut next = self.tokens.get(id).buddy;
        while let Some(b) = next {
            if b == id || ring.len() > usize::from(u8::MAX) {
                break;
            }
            ring.push(b);
            next = self.tokens.get(b).buddy;
        }
        ring
    }

    fn retry(&mut self, id: TokenId) {
        let token = self.tokens.get(id);
        if token.early_commit && self.buddy_committed(id) {
            debug!("{}: {} retry suppressed, another copy committed", self.name(), id);
            bump(&self.shared.stats.sec_suppressed);
            let token = self.tokens.get_mut(id);
            token.sec = SecOutcome::Failed;
            if let Some(buf) = token.dealloc_buf.take() {
                self.read_bufs.requeue_deallocation(buf);
            }
            self.tokens.move_to(id, TokenList::Completed);
            return;
        }

        let allowed = match self.hal.can_retry(token) {
            RetryDecision::Allow => true,
            RetryDecision::Deny => false,
            RetryDecision::Default => token.retries < self.config.max_retries,
        };
        if !allowed {
            self.exhausted(id);
            return;
        }

        if token.op == Op::Read && token.rd_buf.is_none() {
            let Some(rd) = self.read_bufs.allocate(Instant::now()) else {
                // Waits on the repeat list for a buffer
                return;
            };
            let token = self.tokens.get_mut(id);
            token.rd_buf = Some(rd);
            token.cmd = None;
        }

        let token = self.tokens.get_mut(id);
        token.retries += 1;
        debug!(
            "{}: retry {} of {} {} lba {} after {:?}",
            self.shared.name,
            token.retries,
            id,
            token.op.as_str(),
            token.lba,
            token.result
        );
        if token.op != Op::SeqAdvance {
            token.result = Ok(());
        }
        bump(&self.shared.stats.retries);
        self.launch(id);
    }

    /// A token ran out of retries
    ///
    /// On a device that executes strictly in sequence order the slot still
    /// has to be consumed, so the token turns into a sequence advance that
    /// keeps the failure as its result.
    fn exhausted(&mut self, id: TokenId) {
        let advance = self.hal.requires_sequence_advance();
        let token = self.tokens.get_mut(id);
        if token.result.is_ok() {
            token.result = Err(IoError::Io);
        }
        warn!(
            "{}: {} {} lba {} failed after {} retries: {:?}",
            self.shared.name,
            id,
            token.op.as_str(),
            token.lba,
            token.retries,
            token.result
        );
        if token.early_commit {
            token.sec = SecOutcome::Failed;
        }

        if advance && token.seq.is_some() && token.op != Op::SeqAdvance {
            if let Some(rd) = token.rd_buf.take() {
                self.read_bufs.schedule_deallocation(rd);
            }
            token.op = Op::SeqAdvance;
            token.rmw = None;
            token.cmd = None;
            token.retries = 0;
            bump(&self.shared.stats.seq_advances);
            self.launch(id);
            return;
        }

        if let Some(buf) = token.dealloc_buf.take() {
            self.read_bufs.requeue_deallocation(buf);
        }
        self.tokens.move_to(id, TokenList::Completed);
    }

    /// Fail a token during termination
    pub(super) fn force_fail(&mut self, id: TokenId) {
        let token = self.tokens.get_mut(id);
        if token.result.is_ok() {
            token.result = Err(IoError::Io);
        }
        if token.early_commit && token.sec == SecOutcome::Pending {
            token.sec = SecOutcome::Failed;
        }
        token.ext_deferred = false;
        self.tokens.move_to(id, TokenList::Completed);
    }

    /// Deliver every token on the completed list
    ///
    /// A copy of a multi-copy write waits until all copies are done, unless
    /// `force` is set; the request succeeds if any copy committed.
    pub(super) fn deliver_completed(&mut self, force: bool) -> Delivery {
        let mut ids = self.tokens.snapshot(TokenList::Completed);
        if self.config.writes_first {
            ids.sort_by_key(|&id| !self.tokens.get(id).op.is_write());
        }

        let mut delivery = Delivery::default();
        for id in ids {
            let token = self.tokens.get(id);
            if token.list() != TokenList::Completed {
                // Delivered with its ring
                continue;
            }
            if !token.early_commit {
                self.finish_token(id);
                delivery.count += 1;
                continue;
            }

            let ring = self.sec_ring(id);
            if !force
                && ring
                    .iter()
                    .any(|&b| self.tokens.get(b).list() != TokenList::Completed)
            {
                continue;
            }
            let committed = ring
                .iter()
                .any(|&b| self.tokens.get(b).sec == SecOutcome::Succeeded);
            if !committed && !force {
                error!("{}: every copy of the write at lba {} failed", self.name(), token.lba);
                delivery.fatal = true;
            }
            let failure = ring
                .iter()
                .find_map(|&b| self.tokens.get(b).result.err())
                .unwrap_or(IoError::Io);
            for b in ring {
                self.tokens.get_mut(b).result = if committed { Ok(()) } else { Err(failure) };
                self.finish_token(b);
                delivery.count += 1;
            }
        }
        delivery
    }

    /// Release a token's buffers, run its completion and free it
    fn finish_token(&mut self, id: TokenId) {
        self.release_buffers(id);
        let token = self.tokens.get_mut(id);
        let result = token.result;
        let value = token.control_value;
        let request = token.request.take();
        let control = token.control.take();
        if let Err(e) = result {
            trace!("{}: {} completes with {}", self.shared.name, id, e);
        }
        if let Some(request) = request {
            request.complete(result);
        }
        if let Some(control) = control {
            control.complete(result.map(|()| value));
        }
        self.tokens.free(id);
    }

    pub(super) fn release_buffers(&mut self, id: TokenId) {
        let token = self.tokens.get_mut(id);
        if let Some(b) = token.core_buf.take() {
            self.core_bufs.free(b);
        }
        if let Some(b) = token.wr_buf.take() {
            self.write_bufs.free(b);
        }
        if let Some(b) = token.rd_buf.take() {
            if token.started.is_some() {
                self.read_bufs.schedule_deallocation(b);
            } else {
                self.read_bufs.free(b);
            }
        }
        if let Some(b) = token.dealloc_buf.take() {
            self.read_bufs.requeue_deallocation(b);
        }
    }

    /// Follow-up transitions once in-flight work has drained
    pub(super) fn advance_state(&mut self) {
        match self.state() {
            RunState::SyncIo if !self.tokens.any_live(|t| t.ty == TokenType::Block) => {
                self.set_state(RunState::Running);
            }
            RunState::PmDrain if self.tokens.in_use() == 0 => {
                self.set_state(RunState::PmShutdown);
            }
            RunState::ReadPurge
                if self.tokens.in_use() == 0 && self.read_bufs.pending_deallocations() == 0 =>
            {
                self.set_state(RunState::Running);
            }
            _ => {}
        }
        if self.state() == RunState::PmShutdown {
            match self.hal.suspend() {
                Ok(()) => {
                    self.set_state(RunState::PmSleep);
                }
                Err(HalError::Busy) => trace!("{}: device busy, suspend deferred", self.name()),
                Err(e) => self.terminate(&format!("suspend failed: {e}")),
            }
        }
    }
}
