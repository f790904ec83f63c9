//! Worker thread that runs Maatine slices

use super::scheduler::{MaatineHandle, Shared};
use crate::dispatch::Dispatch;
use crate::maatine::SliceOutcome;
use crate::{MaatError, MaatResult};
use crossbeam_deque::{Steal, Stealer, Worker as CWorker};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Worker thread that runs Maatines
pub(crate) struct Worker {
    /// Worker ID
    id: usize,

    /// Scheduler state
    shared: Arc<Shared>,

    /// Worker thread handle
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Create a new Worker
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            handle: None,
        }
    }

    /// Start the worker thread with its deque and the other workers' stealers
    pub(crate) fn start(
        &mut self,
        deque: CWorker<Arc<MaatineHandle>>,
        stealers: Vec<Stealer<Arc<MaatineHandle>>>,
    ) -> MaatResult<()> {
        let id = self.id;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("maat-worker-{}", id))
            .spawn(move || {
                let dispatch = (shared.dispatch)();
                Worker::run_loop(id, deque, stealers, shared, dispatch);
            })
            .map_err(|e| MaatError::Spawn(e.to_string()))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Wait for the worker thread to exit; the shutdown flag must be set
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: "maat::sched", worker = self.id, "worker thread panicked");
            }
        }
    }

    /// Worker thread main loop
    fn run_loop(
        id: usize,
        deque: CWorker<Arc<MaatineHandle>>,
        stealers: Vec<Stealer<Arc<MaatineHandle>>>,
        shared: Arc<Shared>,
        mut dispatch: Box<dyn Dispatch + Send>,
    ) {
        debug!(target: "maat::sched", worker = id, "worker started");
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            let handle = match Self::find_work(&deque, &stealers, &shared) {
                Some(handle) => handle,
                None => {
                    Self::help_shared_pass(&shared);
                    thread::sleep(Duration::from_micros(100));
                    continue;
                }
            };

            let outcome = Self::run_slice(&handle, &shared, dispatch.as_mut());
            shared.slices.fetch_add(1, Ordering::Relaxed);
            match outcome {
                SliceOutcome::Yielded => {
                    // keep it local unless others are waiting
                    if shared.injector.is_empty() {
                        deque.push(handle);
                    } else {
                        shared.injector.push(handle);
                    }
                }
                SliceOutcome::Blocked => {
                    shared.injector.push(handle);
                    thread::yield_now();
                }
                SliceOutcome::Idle => shared.settle(&handle),
                SliceOutcome::Terminated => {
                    warn!(target: "maat::sched", worker = id, maatine = %handle.id(), "maatine terminated");
                    shared.settle(&handle);
                }
            }
        }
        debug!(target: "maat::sched", worker = id, "worker stopped");
    }

    fn run_slice(
        handle: &MaatineHandle,
        shared: &Shared,
        dispatch: &mut dyn Dispatch,
    ) -> SliceOutcome {
        let mut ma = handle.maatine.lock();
        handle.publish(crate::MaatineStatus::Running);
        let outcome = ma.run_slice(dispatch, shared.options.slice_budget);
        handle.publish(ma.status());
        trace!(target: "maat::sched", maatine = %handle.id(), ?outcome, "slice finished");
        outcome
    }

    /// Find work: local pop, then steal, then inject
    fn find_work(
        deque: &CWorker<Arc<MaatineHandle>>,
        stealers: &[Stealer<Arc<MaatineHandle>>],
        shared: &Shared,
    ) -> Option<Arc<MaatineHandle>> {
        if let Some(handle) = deque.pop() {
            return Some(handle);
        }

        loop {
            if let Some(handle) = Self::steal_from_others(stealers) {
                shared.steals.fetch_add(1, Ordering::Relaxed);
                return Some(handle);
            }

            match shared.injector.steal_batch_and_pop(deque) {
                Steal::Success(handle) => return Some(handle),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        None
    }

    /// Steal from other workers, starting at a random victim
    fn steal_from_others(
        stealers: &[Stealer<Arc<MaatineHandle>>],
    ) -> Option<Arc<MaatineHandle>> {
        use rand::Rng;

        if stealers.is_empty() {
            return None;
        }

        let start = rand::thread_rng().gen_range(0..stealers.len());
        for i in 0..stealers.len() {
            let stealer = &stealers[(start + i) % stealers.len()];
            loop {
                match stealer.steal() {
                    Steal::Success(handle) => return Some(handle),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Report idle Maatines to an open shared pass and help tracing it
    ///
    /// A Maatine with nothing queued never reaches a safe point on its own,
    /// so an idle worker reports for it.
    fn help_shared_pass(shared: &Shared) {
        let sos = shared.runtime.sos();
        if sos.pass_epoch().is_none() {
            return;
        }
        let handles: Vec<_> = shared.maatines.read().values().cloned().collect();
        for handle in handles {
            if let Some(mut ma) = handle.maatine.try_lock() {
                ma.poll_shared_pass();
            }
        }
        sos.trace_step(usize::MAX);
        sos.try_finish();
    }
}
