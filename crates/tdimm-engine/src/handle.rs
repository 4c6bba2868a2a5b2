//! Submission side of an engine
//!
//! The engine itself is driven by a single scheduler context. Everything a
//! submitter touches lives in [`EngineShared`]: the incoming lists, the
//! run-state, statistics and the waker of the device group serving the
//! engine. [`EngineHandle`] is the cloneable front door to it.

use crate::request::{ControlCommand, Request};
use crate::run_state::{RunState, RunStateCell};
use crate::scheduler::WorkerEvent;
use crate::stats::{EngineStats, StatsSnapshot, add, bump};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tdimm_common::{Direction, Geometry, IoError, Result};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Default)]
pub(crate) struct Incoming {
    pub(crate) requests: VecDeque<Request>,
    pub(crate) controls: VecDeque<ControlCommand>,
}

/// State shared between an engine and its handles
#[derive(Debug)]
pub(crate) struct EngineShared {
    pub(crate) name: String,
    pub(crate) uuid: Uuid,
    pub(crate) geometry: Geometry,
    pub(crate) incoming: Mutex<Incoming>,
    /// Signalled when queue depth drops
    pub(crate) space: Condvar,
    /// Requests the engine holds in its own queue
    pub(crate) queued_len: AtomicUsize,
    pub(crate) max_incoming: AtomicUsize,
    /// Tokens in use as of the last scheduling pass
    pub(crate) in_flight: AtomicUsize,
    /// Engine-internal work (deallocations, purge, deferred suspend) that
    /// only a scheduling pass can make progress on
    pub(crate) needs_poll: AtomicBool,
    /// Time-driven work such as the orphan scan becomes due at this instant
    pub(crate) poll_at: Mutex<Option<Instant>>,
    pub(crate) run_state: RunStateCell,
    pub(crate) stats: EngineStats,
    pub(crate) waker: Mutex<Option<Sender<WorkerEvent>>>,
}

impl EngineShared {
    pub(crate) fn new(name: &str, geometry: Geometry, max_incoming: usize) -> Self {
        Self {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            geometry,
            incoming: Mutex::new(Incoming::default()),
            space: Condvar::new(),
            queued_len: AtomicUsize::new(0),
            max_incoming: AtomicUsize::new(max_incoming),
            in_flight: AtomicUsize::new(0),
            needs_poll: AtomicBool::new(false),
            poll_at: Mutex::new(None),
            run_state: RunStateCell::new(name),
            stats: EngineStats::default(),
            waker: Mutex::new(None),
        }
    }

    fn depth(&self, incoming: &Incoming) -> usize {
        incoming.requests.len() + self.queued_len.load(Ordering::Acquire)
    }

    /// Publish the engine's queue length and wake blocked submitters
    pub(crate) fn set_queued(&self, len: usize) {
        let incoming = self.incoming.lock();
        self.queued_len.store(len, Ordering::Release);
        if self.depth(&incoming) < self.max_incoming.load(Ordering::Relaxed) {
            self.space.notify_all();
        }
    }

    pub(crate) fn wake(&self) {
        if let Some(tx) = self.waker.lock().as_ref() {
            let _ = tx.try_send(WorkerEvent::Wake);
        }
    }
}

/// Cloneable submission handle of one engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub(crate) const fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.shared.uuid
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    /// Queue a block request; it is completed asynchronously
    ///
    /// A request queued to a dying or dead engine is failed immediately.
    pub fn queue_request(&self, mut request: Request) {
        let shared = &self.shared;
        bump(&shared.stats.requests_queued);

        let owner = Arc::downgrade(shared);
        let (direction, size) = (request.direction, request.size);
        request.observe(move |res| {
            let Some(owner) = owner.upgrade() else {
                return;
            };
            let stats = &owner.stats;
            match res {
                Ok(()) => {
                    bump(&stats.requests_completed);
                    match direction {
                        Direction::Read => add(&stats.bytes_read, size),
                        Direction::Write => add(&stats.bytes_written, size),
                        Direction::Discard => add(&stats.bytes_discarded, size),
                    }
                }
                Err(_) => bump(&stats.requests_failed),
            }
        });

        if shared.run_state.current().is_failed() {
            request.complete(Err(IoError::Io));
            return;
        }
        trace!("{}: queue {} {}+{}", shared.name, request.direction, request.offset, request.size);
        shared.incoming.lock().requests.push_back(request);
        shared.wake();
    }

    /// Queue a request once the queue depth is below the backpressure limit
    ///
    /// Hands the request back if no room opened up within `timeout`.
    pub fn queue_request_blocking(
        &self,
        request: Request,
        timeout: Duration,
    ) -> std::result::Result<(), Request> {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;
        {
            let mut incoming = shared.incoming.lock();
            while shared.depth(&incoming) >= shared.max_incoming.load(Ordering::Relaxed) {
                if shared.run_state.current().is_failed() {
                    break;
                }
                if shared.space.wait_until(&mut incoming, deadline).timed_out()
                    && shared.depth(&incoming) >= shared.max_incoming.load(Ordering::Relaxed)
                {
                    return Err(request);
                }
            }
        }
        self.queue_request(request);
        Ok(())
    }

    /// Queue a control command
    pub fn queue_control(&self, command: ControlCommand) {
        let shared = &self.shared;
        if shared.run_state.current().is_failed() {
            command.complete(Err(IoError::Io));
            return;
        }
        shared.incoming.lock().controls.push_back(command);
        shared.wake();
    }

    /// Requests queued but not yet dispatched
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        let incoming = self.shared.incoming.lock();
        self.shared.depth(&incoming)
    }

    /// Whether a scheduling pass could find anything to do
    ///
    /// Submissions not yet seen by the engine always count; everything the
    /// engine already holds counts as published by its last pass.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        let pending = {
            let incoming = self.shared.incoming.lock();
            incoming.requests.len() + incoming.controls.len()
        };
        pending > 0
            || self.shared.in_flight.load(Ordering::Acquire) > 0
            || self.shared.needs_poll.load(Ordering::Acquire)
            || self
                .shared
                .poll_at
                .lock()
                .is_some_and(|at| at <= Instant::now())
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.shared.run_state.current()
    }

    /// Block until the engine reaches a settled state
    pub fn wait_for(&self, target: RunState, timeout: Duration) -> Result<()> {
        self.shared.run_state.wait_for(target, timeout)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Nudge the device group serving this engine
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Route wakeups to a device group
    pub fn set_waker(&self, waker: Option<Sender<WorkerEvent>>) {
        *self.shared.waker.lock() = waker;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ControlOp, IoBuf};

    fn handle(max_incoming: usize) -> EngineHandle {
        let geo = Geometry::new(1 << 20, 512, 1 << 16);
        EngineHandle::new(Arc::new(EngineShared::new("h", geo, max_incoming)))
    }

    #[test]
    fn test_queue_counts_depth() {
        let h = handle(8);
        h.queue_request(Request::write(0, IoBuf::zeroed(4096)));
        h.queue_request(Request::read(0, IoBuf::zeroed(4096)));
        assert_eq!(h.queue_depth(), 2);
        assert_eq!(h.stats().requests_queued, 2);
    }

    #[test]
    fn test_blocking_queue_times_out_when_full() {
        let h = handle(1);
        h.queue_request(Request::discard(0, 4096));
        let back = h
            .queue_request_blocking(Request::discard(4096, 4096), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(back.offset, 4096);
    }

    #[test]
    fn test_blocking_queue_wakes_on_space() {
        let h = handle(1);
        h.queue_request(Request::discard(0, 4096));
        let shared = Arc::clone(&h.shared);
        let drainer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            shared.incoming.lock().requests.clear();
            shared.set_queued(0);
        });
        h.queue_request_blocking(Request::discard(4096, 4096), Duration::from_secs(5))
            .unwrap();
        drainer.join().unwrap();
    }

    #[test]
    fn test_pending_follows_engine_flags() {
        let h = handle(4);
        assert!(!h.has_pending());
        h.shared.needs_poll.store(true, Ordering::Release);
        assert!(h.has_pending());
        h.shared.needs_poll.store(false, Ordering::Release);

        *h.shared.poll_at.lock() = Some(Instant::now() + Duration::from_secs(60));
        assert!(!h.has_pending());
        *h.shared.poll_at.lock() = Some(Instant::now());
        assert!(h.has_pending());
    }

    #[test]
    fn test_dead_engine_fails_immediately() {
        let h = handle(4);
        h.shared.run_state.transition(RunState::Terminating).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        h.queue_request(Request::discard(0, 4096).on_complete(move |res, _| *s.lock() = Some(res)));
        assert_eq!(*seen.lock(), Some(Err(IoError::Io)));
        assert_eq!(h.queue_depth(), 0);
        assert_eq!(h.stats().requests_failed, 1);

        let got = Arc::new(Mutex::new(None));
        let g = Arc::clone(&got);
        h.queue_control(ControlCommand::new(ControlOp::Nop, move |res| *g.lock() = Some(res)));
        assert_eq!(*got.lock(), Some(Err(IoError::Io)));
    }
}
