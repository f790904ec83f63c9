//! Works: asynchronous tasks with continuation chains
//!
//! A Work wraps a callable and its arguments. Scheduling puts it on its
//! Maatine's ready queue; running it executes the code on a State of its
//! own, then feeds the result through the `then` chain in order. The first
//! error skips the remaining thens and goes to the catch handler, which
//! runs at most once. An error nobody catches terminates the Maatine.
//!
//! A Work resolves at most once: later `resolve` calls are ignored, so a
//! continuation never runs twice.

use crate::dispatch::Dispatch;
use crate::maatine::Maatine;
use crate::object::{ObjBody, ObjRef};
use crate::state::{BackRef, CoStatus, StateObj};
use crate::value::{variant, Kind, Value};
use crate::{MaatError, MaatResult};
use tracing::{debug, trace};

/// Lifecycle of a Work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Created, not on a ready queue
    Pending,
    /// On the ready queue
    Queued,
    /// Executing
    Running,
    /// Completed with a value
    Fulfilled,
    /// Completed with an error
    Rejected,
}

/// Work task
#[derive(Debug)]
pub struct WorkObj {
    /// Current lifecycle status
    pub status: WorkStatus,

    /// Code to run; nil for a deferred Work resolved from outside
    pub code: Value,

    /// Arguments passed to `code`
    pub args: Vec<Value>,

    /// Continuations, run in order on success
    pub thens: Vec<Value>,

    /// Error handler, nil when absent
    pub catch: Value,

    /// State the code and continuations run on
    pub state: Option<ObjRef>,

    next_then: usize,
    outcome: Option<Result<Value, Value>>,
    caught: bool,
    abandoned: bool,
}

impl WorkObj {
    /// Work running `code` with `args`
    pub fn new(code: Value, args: Vec<Value>) -> Self {
        Self {
            status: WorkStatus::Pending,
            code,
            args,
            thens: Vec::new(),
            catch: Value::NIL,
            state: None,
            next_then: 0,
            outcome: None,
            caught: false,
            abandoned: false,
        }
    }

    /// Work without code, completed by [`Maatine::resolve`]
    pub fn deferred() -> Self {
        Self::new(Value::NIL, Vec::new())
    }

    /// Result so far: the value or the error of the chain
    pub fn outcome(&self) -> Option<Result<Value, Value>> {
        self.outcome
    }

    /// Whether the Work was resolved
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// Whether the Work was abandoned
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Visit every value referenced by the Work
    pub fn for_each_ref(&self, mut f: impl FnMut(Value)) {
        f(self.code);
        self.args.iter().copied().for_each(&mut f);
        self.thens.iter().copied().for_each(&mut f);
        f(self.catch);
        match self.outcome {
            Some(Ok(v)) | Some(Err(v)) => f(v),
            None => {}
        }
        if let Some(s) = self.state {
            f(Value::object(Kind::State, variant::STATE_CO, s));
        }
    }
}

/// What a single run of a Work did
enum Step {
    Done,
    Blocked,
}

impl Maatine {
    fn work_mut(&mut self, work: ObjRef) -> &mut WorkObj {
        match &mut self.gc.heap_mut().get_mut(work).body {
            ObjBody::Work(w) => w,
            other => panic!("internal error: expected work body, found {:?}", other.default_tag()),
        }
    }

    fn owned_work(&self, work: Value) -> MaatResult<ObjRef> {
        let r = work.try_work()?;
        if !self.gc.heap().owns(r) {
            return Err(MaatError::CrossMaatine);
        }
        Ok(r)
    }

    /// Work object behind a Work value
    pub fn work(&self, work: Value) -> MaatResult<&WorkObj> {
        let r = self.owned_work(work)?;
        match &self.gc.heap().get(r).body {
            ObjBody::Work(w) => Ok(w),
            other => Err(MaatError::TypeError { expected: Kind::Work, found: other.default_tag().kind() }),
        }
    }

    /// New pending Work running `code` with `args`
    pub fn new_work(&mut self, code: Value, args: &[Value]) -> MaatResult<Value> {
        if !matches!(code.kind(), Kind::Fun | Kind::CFunc) {
            return Err(MaatError::NotCallable(code.kind()));
        }
        self.alloc(ObjBody::Work(WorkObj::new(code, args.to_vec())))
    }

    /// New pending Work completed only through [`Maatine::resolve`]
    pub fn new_deferred_work(&mut self) -> MaatResult<Value> {
        self.alloc(ObjBody::Work(WorkObj::deferred()))
    }

    // store barrier and size accounting after changing a Work
    fn work_stored(&mut self, r: ObjRef, value: Value) {
        self.gc.write_barrier(r, value);
        let size = self.gc.heap().get(r).body.size_hint();
        self.gc.heap_mut().resize(r, size);
    }

    /// Append a continuation
    ///
    /// Ignored once the Work was abandoned. A continuation attached to an
    /// already fulfilled Work is run by rescheduling it.
    pub fn then(&mut self, work: Value, f: Value) -> MaatResult<()> {
        let r = self.owned_work(work)?;
        let w = self.work_mut(r);
        if w.abandoned {
            return Ok(());
        }
        w.thens.push(f);
        let rerun = w.status == WorkStatus::Fulfilled;
        self.work_stored(r, f);
        if rerun {
            self.enqueue(r)?;
        }
        Ok(())
    }

    /// Set the error handler
    pub fn catch(&mut self, work: Value, f: Value) -> MaatResult<()> {
        let r = self.owned_work(work)?;
        self.work_mut(r).catch = f;
        self.gc.write_barrier(r, f);
        Ok(())
    }

    /// Put a pending Work on the ready queue
    ///
    /// Works already queued, running or completed are left alone.
    pub fn schedule(&mut self, work: Value) -> MaatResult<()> {
        let r = self.owned_work(work)?;
        if self.work_mut(r).status == WorkStatus::Pending {
            self.enqueue(r)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, r: ObjRef) -> MaatResult<()> {
        self.ready.try_push(r)?;
        self.work_mut(r).status = WorkStatus::Queued;
        trace!(target: "maat::work", maatine = %self.id(), work = ?r, "work queued");
        Ok(())
    }

    /// Complete a Work from outside
    ///
    /// Returns false, changing nothing, when the Work was resolved before.
    /// Otherwise the continuations are scheduled to run.
    pub fn resolve(&mut self, work: Value, result: Result<Value, Value>) -> MaatResult<bool> {
        let r = self.owned_work(work)?;
        let w = self.work_mut(r);
        if w.outcome.is_some() {
            return Ok(false);
        }
        w.outcome = Some(result);
        let idle = !matches!(w.status, WorkStatus::Queued | WorkStatus::Running);
        let (Ok(v) | Err(v)) = result;
        self.gc.write_barrier(r, v);
        if idle {
            self.enqueue(r)?;
        }
        Ok(true)
    }

    /// Detach from the Work: its code still runs, continuations attached
    /// from now on never do
    pub fn abandon(&mut self, work: Value) -> MaatResult<()> {
        let r = self.owned_work(work)?;
        self.work_mut(r).abandoned = true;
        Ok(())
    }

    /// Run one queued Work; false means it blocked and was queued again
    pub(crate) fn run_work(&mut self, dispatch: &mut dyn Dispatch, work: ObjRef) -> MaatResult<bool> {
        self.running.push(work);
        let result = self.drive_work(dispatch, work);
        self.running.pop();
        match result {
            Ok(Step::Done) => Ok(true),
            Ok(Step::Blocked) => {
                self.enqueue(work)?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn drive_work(&mut self, dispatch: &mut dyn Dispatch, work: ObjRef) -> MaatResult<Step> {
        let (code, args, outcome) = {
            let w = self.work_mut(work);
            w.status = WorkStatus::Running;
            (w.code, w.args.clone(), w.outcome)
        };

        if outcome.is_none() {
            if code.is_nil() {
                // deferred and not resolved yet
                self.work_mut(work).status = WorkStatus::Pending;
                return Ok(Step::Done);
            }
            let result = match self.run_on_work_state(dispatch, work, code, &args) {
                Ok(v) => Ok(v),
                Err(MaatError::Thrown(e)) => Err(e),
                Err(MaatError::WouldBlock) => return Ok(Step::Blocked),
                Err(e) => return Err(e),
            };
            // the code may have resolved its own Work; the first result wins
            if self.work_mut(work).outcome.is_none() {
                self.settle(work, result);
            }
        }

        loop {
            let w = self.work_mut(work);
            let Some(outcome) = w.outcome else { break };
            match outcome {
                Ok(v) => {
                    let Some(f) = w.thens.get(w.next_then).copied() else {
                        break;
                    };
                    let result = match self.run_on_work_state(dispatch, work, f, &[v]) {
                        Ok(v) => Ok(v),
                        Err(MaatError::Thrown(e)) => Err(e),
                        Err(MaatError::WouldBlock) => return Ok(Step::Blocked),
                        Err(e) => return Err(e),
                    };
                    self.work_mut(work).next_then += 1;
                    self.settle(work, result);
                }
                Err(e) => {
                    if w.caught {
                        break;
                    }
                    let handler = w.catch;
                    if handler.is_nil() {
                        w.status = WorkStatus::Rejected;
                        self.retire_work_state(work, true);
                        debug!(target: "maat::work", maatine = %self.id(), "work rejected without handler");
                        return Err(MaatError::Thrown(e));
                    }
                    let result = match self.run_on_work_state(dispatch, work, handler, &[e]) {
                        Ok(v) => v,
                        Err(MaatError::WouldBlock) => return Ok(Step::Blocked),
                        Err(e) => return Err(e),
                    };
                    let w = self.work_mut(work);
                    w.caught = true;
                    w.next_then = w.thens.len();
                    self.settle(work, Ok(result));
                    break;
                }
            }
        }

        let w = self.work_mut(work);
        let failed = matches!(w.outcome, Some(Err(_)));
        w.status = if failed { WorkStatus::Rejected } else { WorkStatus::Fulfilled };
        self.retire_work_state(work, failed);
        Ok(Step::Done)
    }

    fn settle(&mut self, work: ObjRef, result: Result<Value, Value>) {
        self.work_mut(work).outcome = Some(result);
        let (Ok(v) | Err(v)) = result;
        self.gc.write_barrier(work, v);
    }

    // Run `f` on the Work's State, creating it on first use.
    fn run_on_work_state(
        &mut self,
        dispatch: &mut dyn Dispatch,
        work: ObjRef,
        f: Value,
        args: &[Value],
    ) -> MaatResult<Value> {
        let state = match self.work_mut(work).state {
            Some(s) => s,
            None => {
                let body = StateObj::coroutine(self.id(), f, false);
                let s = self.alloc(ObjBody::State(body))?.as_state();
                self.work_mut(work).state = Some(s);
                self.gc.write_barrier(work, Value::object(Kind::State, variant::STATE_CO, s));
                s
            }
        };
        {
            let st = self.state_mut_of(state);
            st.status = CoStatus::Running;
            st.back = BackRef::Work(work);
        }
        let previous = std::mem::replace(&mut self.current, state);
        let result = self.call(dispatch, f, args);
        self.current = previous;
        result
    }

    fn retire_work_state(&mut self, work: ObjRef, errored: bool) {
        if let Some(s) = self.work_mut(work).state.take() {
            let st = self.state_mut_of(s);
            st.status = CoStatus::Dead { errored };
            st.back = BackRef::None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;
    use crate::dispatch::Exit;
    use crate::runtime::Runtime;
    use crate::value::NativeFn;
    use crate::SliceOutcome;

    struct NoDispatch;

    impl Dispatch for NoDispatch {
        fn execute(&mut self, _: &mut Maatine, _: usize) -> MaatResult<Exit> {
            unreachable!("native-only test")
        }
    }

    fn maatine() -> Maatine {
        let runtime = Runtime::new(RuntimeOptions {
            seed: Some(5),
            ..RuntimeOptions::default()
        })
        .unwrap();
        Maatine::new(runtime).unwrap()
    }

    fn inc(_: &mut Maatine, args: &[Value]) -> MaatResult<Value> {
        Ok(Value::Num(args[0].try_num()? + 1.0))
    }

    fn fail(ma: &mut Maatine, _: &[Value]) -> MaatResult<Value> {
        Err(MaatError::Thrown(ma.new_str("boom")?))
    }

    fn recover(_: &mut Maatine, _: &[Value]) -> MaatResult<Value> {
        Ok(Value::Num(-1.0))
    }

    const INC: Value = Value::CFunc(NativeFn(inc));
    const FAIL: Value = Value::CFunc(NativeFn(fail));
    const RECOVER: Value = Value::CFunc(NativeFn(recover));

    #[test]
    fn test_then_chain_in_order() {
        let mut ma = maatine();
        let w = ma.new_work(INC, &[Value::Num(1.0)]).unwrap();
        ma.then(w, INC).unwrap();
        ma.then(w, INC).unwrap();
        ma.schedule(w).unwrap();
        assert_eq!(ma.run_slice(&mut NoDispatch, 8), SliceOutcome::Idle);
        let work = ma.work(w).unwrap();
        assert_eq!(work.status, WorkStatus::Fulfilled);
        assert_eq!(work.outcome(), Some(Ok(Value::Num(4.0))));
    }

    #[test]
    fn test_error_skips_thens_and_runs_catch_once() {
        let mut ma = maatine();
        let w = ma.new_work(FAIL, &[]).unwrap();
        ma.then(w, INC).unwrap();
        ma.catch(w, RECOVER).unwrap();
        ma.schedule(w).unwrap();
        assert_eq!(ma.run_slice(&mut NoDispatch, 8), SliceOutcome::Idle);
        assert_eq!(ma.work(w).unwrap().outcome(), Some(Ok(Value::Num(-1.0))));
        assert!(ma.errors().is_empty());
    }

    #[test]
    fn test_unhandled_error_terminates() {
        let mut ma = maatine();
        let w = ma.new_work(FAIL, &[]).unwrap();
        ma.schedule(w).unwrap();
        assert_eq!(ma.run_slice(&mut NoDispatch, 8), SliceOutcome::Terminated);
        assert_eq!(ma.status(), crate::MaatineStatus::Dead);
        assert_eq!(ma.take_errors().len(), 1);
    }

    #[test]
    fn test_deferred_resolve_runs_continuations() {
        let mut ma = maatine();
        let w = ma.new_deferred_work().unwrap();
        ma.then(w, INC).unwrap();
        assert!(ma.resolve(w, Ok(Value::Num(9.0))).unwrap());
        assert!(!ma.resolve(w, Ok(Value::Num(100.0))).unwrap());
        ma.run_slice(&mut NoDispatch, 8);
        assert_eq!(ma.work(w).unwrap().outcome(), Some(Ok(Value::Num(10.0))));
    }

    #[test]
    fn test_then_after_fulfilled_reschedules() {
        let mut ma = maatine();
        let w = ma.new_work(INC, &[Value::Num(0.0)]).unwrap();
        ma.schedule(w).unwrap();
        ma.run_slice(&mut NoDispatch, 8);
        ma.then(w, INC).unwrap();
        assert_eq!(ma.ready_len(), 1);
        ma.run_slice(&mut NoDispatch, 8);
        assert_eq!(ma.work(w).unwrap().outcome(), Some(Ok(Value::Num(2.0))));
    }

    #[test]
    fn test_abandoned_ignores_new_thens() {
        let mut ma = maatine();
        let w = ma.new_work(INC, &[Value::Num(0.0)]).unwrap();
        ma.abandon(w).unwrap();
        ma.then(w, INC).unwrap();
        assert!(ma.work(w).unwrap().thens.is_empty());
        ma.schedule(w).unwrap();
        ma.run_slice(&mut NoDispatch, 8);
        assert_eq!(ma.work(w).unwrap().outcome(), Some(Ok(Value::Num(1.0))));
    }
}
