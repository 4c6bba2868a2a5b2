//! Device groups: worker threads driving a set of engines
//!
//! Each engine is wrapped in a [`WorkItem`]. Workers of a [`DevGroup`] scout
//! every item, activate the ones with work and sleep on the group channel
//! when nothing is pending. Handles wake the group when work is queued.

use crate::engine::Engine;
use crate::handle::EngineHandle;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Message to the workers of a device group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// New work was queued somewhere in the group
    Wake,
    /// Exit the worker loop
    Shutdown,
}

/// Unit of work a device group schedules
pub trait WorkItem: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap check whether activating would find anything to do
    fn scout(&self) -> bool;

    /// Run one pass; returns whether work remains
    fn activate(&self) -> bool;
}

/// An engine scheduled by a device group
///
/// At most `max_occupancy` workers run an engine pass at once; since the
/// engine sits behind a mutex the others bounce off `try_lock`.
pub struct EngineWorkItem {
    name: String,
    engine: Mutex<Engine>,
    handle: EngineHandle,
    occupancy: AtomicU32,
    max_occupancy: u32,
}

impl std::fmt::Debug for EngineWorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineWorkItem")
            .field("name", &self.name)
            .field("occupancy", &self.occupancy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EngineWorkItem {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            name: engine.name().to_string(),
            handle: engine.handle(),
            engine: Mutex::new(engine),
            occupancy: AtomicU32::new(0),
            max_occupancy: 1,
        }
    }

    #[must_use]
    pub const fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Run `f` with exclusive access to the engine, e.g. for state changes
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let out = f(&mut self.engine.lock());
        self.handle.wake();
        out
    }

    fn try_enter(&self) -> bool {
        let mut current = self.occupancy.load(Ordering::Relaxed);
        loop {
            if current >= self.max_occupancy {
                return false;
            }
            match self.occupancy.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn leave(&self) {
        self.occupancy.fetch_sub(1, Ordering::Release);
    }
}

impl WorkItem for EngineWorkItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn scout(&self) -> bool {
        self.handle.has_pending()
    }

    fn activate(&self) -> bool {
        if !self.try_enter() {
            return false;
        }
        let more = match self.engine.try_lock() {
            Some(mut engine) => engine.poll_once(),
            None => false,
        };
        self.leave();
        more
    }
}

/// Worker threads serving a set of work items
pub struct DevGroup {
    name: String,
    items: Arc<RwLock<Vec<Arc<dyn WorkItem>>>>,
    tx: Sender<WorkerEvent>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for DevGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevGroup")
            .field("name", &self.name)
            .field("items", &self.items.read().len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl DevGroup {
    /// Start `workers` threads; idle workers re-scout every `poll_interval`
    pub fn new(name: &str, workers: usize, poll_interval: Duration) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = bounded(workers * 4);
        let items: Arc<RwLock<Vec<Arc<dyn WorkItem>>>> = Arc::new(RwLock::new(Vec::new()));
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let items = Arc::clone(&items);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(&items, &rx, poll_interval))?;
            threads.push(handle);
        }
        info!("device group {} started with {} workers", name, workers);
        Ok(Self {
            name: name.to_string(),
            items,
            tx,
            workers: threads,
        })
    }

    /// Add a work item and wake the workers
    pub fn add(&self, item: Arc<dyn WorkItem>) {
        debug!("{}: adding {}", self.name, item.name());
        self.items.write().push(item);
        self.wake();
    }

    /// Schedule an engine; its handle wakes this group on submission
    pub fn add_engine(&self, engine: Engine) -> Arc<EngineWorkItem> {
        let item = Arc::new(EngineWorkItem::new(engine));
        item.handle().set_waker(Some(self.waker()));
        self.add(Arc::clone(&item) as Arc<dyn WorkItem>);
        item
    }

    #[must_use]
    pub fn waker(&self) -> Sender<WorkerEvent> {
        self.tx.clone()
    }

    pub fn wake(&self) {
        let _ = self.tx.try_send(WorkerEvent::Wake);
    }

    /// Stop and join all workers
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for _ in 0..self.workers.len() {
            if self.tx.send(WorkerEvent::Shutdown).is_err() {
                break;
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("{}: worker panicked", self.name);
            }
        }
        for item in self.items.read().iter() {
            debug!("{}: detached {}", self.name, item.name());
        }
        info!("device group {} stopped", self.name);
    }
}

impl Drop for DevGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(items: &RwLock<Vec<Arc<dyn WorkItem>>>, rx: &Receiver<WorkerEvent>, poll: Duration) {
    loop {
        let snapshot: Vec<Arc<dyn WorkItem>> = items.read().clone();
        let mut busy = false;
        for item in &snapshot {
            if item.scout() {
                busy |= item.activate();
            }
        }

        if busy {
            match rx.try_recv() {
                Ok(WorkerEvent::Shutdown) | Err(TryRecvError::Disconnected) => return,
                Ok(WorkerEvent::Wake) | Err(TryRecvError::Empty) => std::thread::yield_now(),
            }
            continue;
        }
        match rx.recv_timeout(poll) {
            Ok(WorkerEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(WorkerEvent::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
