//! Scheduler integration tests
//!
//! Maatines running on worker threads, talking over channels.

mod common;

use common::*;
use maat_core::{
    Dispatch, MaatError, MaatineStatus, Runtime, RuntimeOptions, Scheduler, SchedulerOptions,
    Value,
};
use std::sync::Arc;
use std::time::Duration;

fn scheduler(threads: usize) -> Scheduler {
    init_logging();
    let rt = Runtime::new(RuntimeOptions {
        seed: Some(9),
        scheduler: SchedulerOptions {
            num_threads: threads,
            ..SchedulerOptions::default()
        },
        ..RuntimeOptions::default()
    })
    .unwrap();
    let mut sched = Scheduler::new(rt, || Box::new(Toy) as Box<dyn Dispatch + Send>);
    sched.start().unwrap();
    sched
}

#[test]
fn test_many_maatines_complete() {
    let sched = scheduler(4);
    let rt = sched.runtime().clone();
    let add = function(&rt, &[ARG, 0, ARG, 1, ADD, 0, RET, 1], vec![]);

    let mut spawned = Vec::new();
    for i in 0..32 {
        let mut work = Value::NIL;
        let id = sched
            .spawn(|ma| {
                work = ma.new_work(add, &[Value::Num(i as f64), Value::Num(1.0)])?;
                ma.protect(work);
                ma.schedule(work)
            })
            .unwrap();
        spawned.push((id, work, i as f64 + 1.0));
    }

    assert!(sched.wait_idle(Duration::from_secs(10)));
    for (id, work, expected) in spawned {
        let outcome = sched
            .with_maatine(id, |ma| ma.work(work).unwrap().outcome())
            .unwrap();
        assert_eq!(outcome, Some(Ok(Value::Num(expected))));
        assert_eq!(sched.handle(id).unwrap().status(), MaatineStatus::Idle);
    }
    assert!(sched.stats().slices >= 32);
}

#[test]
fn test_channel_between_maatines() {
    let sched = scheduler(2);
    let rt = sched.runtime().clone();
    let ch = rt.new_channel(1);
    let recv = function(&rt, &[CONST, 0, RECV, 0, RET, 1], vec![ch]);
    let send = function(&rt, &[CONST, 0, ARG, 0, SEND, 0, ARG, 0, RET, 1], vec![ch]);

    // the receiver starts first and blocks until the sender runs
    let mut received = Value::NIL;
    let receiver = sched
        .spawn(|ma| {
            received = ma.new_work(recv, &[])?;
            ma.protect(received);
            ma.schedule(received)
        })
        .unwrap();
    let sender = sched
        .spawn(|ma| {
            let w = ma.new_work(send, &[Value::Num(42.0)])?;
            ma.schedule(w)
        })
        .unwrap();

    assert!(sched.wait_idle(Duration::from_secs(10)));
    let outcome = sched
        .with_maatine(receiver, |ma| ma.work(received).unwrap().outcome())
        .unwrap();
    assert_eq!(outcome, Some(Ok(Value::Num(42.0))));
    assert_eq!(sched.handle(sender).unwrap().status(), MaatineStatus::Idle);
}

#[test]
fn test_submit_after_idle_runs_again() {
    let sched = scheduler(1);
    let rt = sched.runtime().clone();
    let add = function(&rt, &[ARG, 0, ARG, 1, ADD, 0, RET, 1], vec![]);
    let id = sched.spawn(|_| Ok(())).unwrap();
    assert!(sched.wait_idle(Duration::from_secs(10)));

    let work = sched
        .submit(id, |ma| {
            let w = ma.new_work(add, &[Value::Num(2.0), Value::Num(2.0)])?;
            ma.protect(w);
            ma.schedule(w)?;
            Ok(w)
        })
        .unwrap();
    assert!(sched.wait_idle(Duration::from_secs(10)));
    let outcome = sched
        .with_maatine(id, |ma| ma.work(work).unwrap().outcome())
        .unwrap();
    assert_eq!(outcome, Some(Ok(Value::Num(4.0))));
}

#[test]
fn test_failing_maatine_is_isolated() {
    let sched = scheduler(2);
    let rt = sched.runtime().clone();
    let thrower = function(&rt, &[CONST, 0, THROW, 0], vec![Value::Num(0.0)]);
    let add = function(&rt, &[ARG, 0, ARG, 1, ADD, 0, RET, 1], vec![]);

    let bad = sched
        .spawn(|ma| {
            let w = ma.new_work(thrower, &[])?;
            ma.schedule(w)
        })
        .unwrap();
    let mut work = Value::NIL;
    let good = sched
        .spawn(|ma| {
            work = ma.new_work(add, &[Value::Num(1.0), Value::Num(1.0)])?;
            ma.protect(work);
            ma.schedule(work)
        })
        .unwrap();

    assert!(sched.wait_idle(Duration::from_secs(10)));
    assert_eq!(sched.handle(bad).unwrap().status(), MaatineStatus::Dead);
    assert_eq!(sched.with_maatine(bad, |ma| ma.errors().len()), Some(1));
    assert!(matches!(
        sched.submit(bad, |_| Ok(())),
        Err(MaatError::Terminated)
    ));
    let outcome = sched
        .with_maatine(good, |ma| ma.work(work).unwrap().outcome())
        .unwrap();
    assert_eq!(outcome, Some(Ok(Value::Num(2.0))));
}

#[test]
fn test_shutdown_retires_maatines() {
    let mut sched = scheduler(2);
    let rt: Arc<Runtime> = sched.runtime().clone();
    for _ in 0..3 {
        sched.spawn(|_| Ok(())).unwrap();
    }
    assert!(sched.wait_idle(Duration::from_secs(10)));
    assert_eq!(rt.live_maatines(), 3);
    sched.shutdown();
    assert_eq!(rt.live_maatines(), 0);
    assert!(!sched.is_started());
}
