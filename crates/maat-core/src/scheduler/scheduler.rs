//! M:N scheduler multiplexing Maatines over worker threads

use super::worker::Worker;
use crate::config::SchedulerOptions;
use crate::dispatch::Dispatch;
use crate::maatine::{Maatine, MaatineId, MaatineStatus};
use crate::runtime::Runtime;
use crate::{MaatError, MaatResult};
use crossbeam::atomic::AtomicCell;
use crossbeam_deque::{Injector, Steal, Worker as CWorker};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Builds the interpreter each worker thread runs Maatines with
pub type DispatchFactory = Arc<dyn Fn() -> Box<dyn Dispatch + Send> + Send + Sync>;

/// A Maatine registered with a scheduler
pub struct MaatineHandle {
    id: MaatineId,
    status: AtomicCell<MaatineStatus>,
    queued: AtomicBool,
    pub(crate) maatine: Mutex<Maatine>,
}

impl MaatineHandle {
    fn new(maatine: Maatine) -> Self {
        Self {
            id: maatine.id(),
            status: AtomicCell::new(maatine.status()),
            queued: AtomicBool::new(false),
            maatine: Mutex::new(maatine),
        }
    }

    /// Maatine id
    pub fn id(&self) -> MaatineId {
        self.id
    }

    /// Last published status; readable while the Maatine runs
    pub fn status(&self) -> MaatineStatus {
        self.status.load()
    }

    pub(crate) fn publish(&self, status: MaatineStatus) {
        self.status.store(status);
    }
}

impl std::fmt::Debug for MaatineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaatineHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .finish()
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Maatines registered
    pub maatines: usize,

    /// Maatines queued or running
    pub active: usize,

    /// Total Maatines spawned
    pub spawned: u64,

    /// Slices run by all workers
    pub slices: u64,

    /// Maatines taken from another worker's deque
    pub steals: u64,
}

/// State shared by the scheduler and its workers
pub(crate) struct Shared {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) options: SchedulerOptions,
    pub(crate) injector: Injector<Arc<MaatineHandle>>,
    pub(crate) maatines: RwLock<FxHashMap<MaatineId, Arc<MaatineHandle>>>,
    pub(crate) dispatch: DispatchFactory,
    pub(crate) shutdown: AtomicBool,
    active: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    spawned: AtomicU64,
    pub(crate) slices: AtomicU64,
    pub(crate) steals: AtomicU64,
}

impl Shared {
    /// Queue `handle` unless it is queued or running already
    pub(crate) fn wake(&self, handle: &Arc<MaatineHandle>) {
        if !handle.queued.swap(true, Ordering::SeqCst) {
            self.active.fetch_add(1, Ordering::SeqCst);
            handle.publish(MaatineStatus::Ready);
            self.injector.push(Arc::clone(handle));
        }
    }

    /// A slice of `handle` ended without putting it back on a queue
    pub(crate) fn settle(&self, handle: &Arc<MaatineHandle>) {
        handle.queued.store(false, Ordering::SeqCst);
        // work submitted while the slice was finishing
        let pending = {
            let ma = handle.maatine.lock();
            ma.status() != MaatineStatus::Dead && ma.ready_len() > 0
        };
        if pending {
            self.wake(handle);
        }
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }
}

/// M:N scheduler
///
/// Runs every registered Maatine on a pool of worker threads. A Maatine is
/// executed by one worker at a time, for at most `slice_budget` Works, and
/// then goes back on a queue if it still has work.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
    started: bool,
}

impl Scheduler {
    /// Scheduler for `runtime`; each worker builds its interpreter with
    /// `dispatch`
    pub fn new(
        runtime: Arc<Runtime>,
        dispatch: impl Fn() -> Box<dyn Dispatch + Send> + Send + Sync + 'static,
    ) -> Self {
        let options = runtime.options().scheduler.clone();
        let shared = Arc::new(Shared {
            runtime,
            options,
            injector: Injector::new(),
            maatines: RwLock::new(FxHashMap::default()),
            dispatch: Arc::new(dispatch),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            spawned: AtomicU64::new(0),
            slices: AtomicU64::new(0),
            steals: AtomicU64::new(0),
        });
        Self {
            shared,
            workers: Vec::new(),
            started: false,
        }
    }

    /// Start the worker threads
    pub fn start(&mut self) -> MaatResult<()> {
        if self.started {
            return Ok(());
        }
        let count = self.shared.options.num_threads.max(1);
        let deques: Vec<CWorker<Arc<MaatineHandle>>> =
            (0..count).map(|_| CWorker::new_lifo()).collect();
        let stealers: Vec<_> = deques.iter().map(CWorker::stealer).collect();

        self.shared.shutdown.store(false, Ordering::Release);
        for (id, deque) in deques.into_iter().enumerate() {
            let others = stealers
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != id)
                .map(|(_, s)| s.clone())
                .collect();
            let mut worker = Worker::new(id, Arc::clone(&self.shared));
            worker.start(deque, others)?;
            self.workers.push(worker);
        }
        self.started = true;
        info!(target: "maat::sched", workers = count, "scheduler started");
        Ok(())
    }

    /// Create a Maatine, let `init` set it up, and queue it
    pub fn spawn(
        &self,
        init: impl FnOnce(&mut Maatine) -> MaatResult<()>,
    ) -> MaatResult<MaatineId> {
        let mut maatine = Maatine::new(Arc::clone(&self.shared.runtime))?;
        init(&mut maatine)?;
        let id = maatine.id();
        let handle = Arc::new(MaatineHandle::new(maatine));
        self.shared.maatines.write().insert(id, Arc::clone(&handle));
        self.shared.spawned.fetch_add(1, Ordering::Relaxed);
        debug!(target: "maat::sched", maatine = %id, "maatine spawned");
        self.shared.wake(&handle);
        Ok(id)
    }

    /// Run `f` on the Maatine `id` between slices, then queue it
    ///
    /// Blocks while the Maatine is running a slice.
    pub fn submit<R>(&self, id: MaatineId, f: impl FnOnce(&mut Maatine) -> MaatResult<R>) -> MaatResult<R> {
        let handle = self.handle(id).ok_or(MaatError::Terminated)?;
        let result = {
            let mut ma = handle.maatine.lock();
            if ma.status() == MaatineStatus::Dead {
                return Err(MaatError::Terminated);
            }
            f(&mut ma)
        };
        self.shared.wake(&handle);
        result
    }

    /// Inspect the Maatine `id` without queueing it
    pub fn with_maatine<R>(&self, id: MaatineId, f: impl FnOnce(&mut Maatine) -> R) -> Option<R> {
        let handle = self.handle(id)?;
        let mut ma = handle.maatine.lock();
        Some(f(&mut ma))
    }

    /// Handle of the Maatine `id`
    pub fn handle(&self, id: MaatineId) -> Option<Arc<MaatineHandle>> {
        self.shared.maatines.read().get(&id).cloned()
    }

    /// Unregister the Maatine `id`; it is dropped once no worker holds it
    pub fn remove(&self, id: MaatineId) -> Option<Arc<MaatineHandle>> {
        self.shared.maatines.write().remove(&id)
    }

    /// Wait until no Maatine is queued or running
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.idle_lock.lock();
        while self.shared.active.load(Ordering::SeqCst) != 0 {
            if self.shared.idle.wait_until(&mut guard, deadline).timed_out() {
                return self.shared.active.load(Ordering::SeqCst) == 0;
            }
        }
        true
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Whether the workers are running
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Runtime the Maatines belong to
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.shared.runtime
    }

    /// Scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            maatines: self.shared.maatines.read().len(),
            active: self.shared.active.load(Ordering::SeqCst),
            spawned: self.shared.spawned.load(Ordering::Relaxed),
            slices: self.shared.slices.load(Ordering::Relaxed),
            steals: self.shared.steals.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers and drop every registered Maatine
    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
        self.started = false;
        while !matches!(self.shared.injector.steal(), Steal::Empty) {}
        self.shared.maatines.write().clear();
        info!(target: "maat::sched", "scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers.len())
            .field("started", &self.started)
            .field("stats", &self.stats())
            .finish()
    }
}
