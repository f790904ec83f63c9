//! Coroutine and call integration tests
//!
//! Drives States through resume, yield, return and error with the toy
//! interpreter from `common`.

mod common;

use common::*;
use maat_core::{CoResult, CoStatus, Kind, MaatError, Maatine, Value};

fn maatine() -> Maatine {
    Maatine::new(runtime()).unwrap()
}

#[test]
fn test_yield_then_return() {
    let mut ma = maatine();
    // yield the argument, then return argument + 10
    let body = function(
        ma.runtime(),
        &[ARG, 0, YIELD, 1, ARG, 0, CONST, 0, ADD, 0, RET, 1],
        vec![Value::Num(10.0)],
    );
    let co = ma.new_coroutine(body, false).unwrap();

    let first = ma.run_coroutine(&mut Toy, co, &[Value::Num(5.0)]).unwrap();
    assert_eq!(first, CoResult::Yielded(1));
    assert_eq!(ma.pop(), Some(Value::Num(5.0)));
    assert_eq!(ma.state_of(co).unwrap().status, CoStatus::Yielded);

    // the argument slot survived the suspension
    let second = ma.run_coroutine(&mut Toy, co, &[]).unwrap();
    assert_eq!(second, CoResult::Returned(1));
    assert_eq!(ma.pop(), Some(Value::Num(15.0)));
    assert_eq!(ma.state_of(co).unwrap().status, CoStatus::Dead { errored: false });
}

#[test]
fn test_resume_dead_coroutine_fails() {
    let mut ma = maatine();
    let body = function(ma.runtime(), &[CONST, 0, RET, 1], vec![Value::Num(1.0)]);
    let co = ma.new_coroutine(body, false).unwrap();
    ma.run_coroutine(&mut Toy, co, &[]).unwrap();
    assert!(matches!(
        ma.run_coroutine(&mut Toy, co, &[]),
        Err(MaatError::DeadCoroutine)
    ));
}

#[test]
fn test_error_kills_coroutine() {
    let mut ma = maatine();
    let body = function(ma.runtime(), &[CONST, 0, THROW, 0], vec![Value::Num(7.0)]);
    let co = ma.new_coroutine(body, false).unwrap();

    let result = ma.run_coroutine(&mut Toy, co, &[]);
    assert!(matches!(result, Err(MaatError::Thrown(Value::Num(n))) if n == 7.0));
    assert_eq!(ma.state_of(co).unwrap().status, CoStatus::Dead { errored: true });
    assert_eq!(ma.current(), ma.primary());
    assert_eq!(ma.state().status, CoStatus::Running);
}

#[test]
fn test_resume_rejects_non_coroutines() {
    let mut ma = maatine();
    let primary = ma.primary();
    assert!(matches!(ma.resume(primary, &[]), Err(MaatError::NotACoroutine)));
    assert!(matches!(ma.resume(Value::Num(1.0), &[]), Err(MaatError::NotACoroutine)));
}

#[test]
fn test_resume_foreign_coroutine_fails() {
    let rt = runtime();
    let mut a = Maatine::new(rt.clone()).unwrap();
    let mut b = Maatine::new(rt).unwrap();
    let body = function(a.runtime(), &[RET, 0], vec![]);
    let co = a.new_coroutine(body, false).unwrap();
    assert!(matches!(b.resume(co, &[]), Err(MaatError::CrossMaatine)));
}

#[test]
fn test_yield_from_primary_has_no_caller() {
    let mut ma = maatine();
    assert!(matches!(ma.yield_values(0), Err(MaatError::NoCaller)));
}

#[test]
fn test_call_returns_value_and_restores_stack() {
    let mut ma = maatine();
    let add = function(ma.runtime(), &[ARG, 0, ARG, 1, ADD, 0, RET, 1], vec![]);
    ma.push(Value::Bool(true));
    let sum = ma
        .call(&mut Toy, add, &[Value::Num(2.0), Value::Num(3.0)])
        .unwrap();
    assert_eq!(sum, Value::Num(5.0));
    assert_eq!(ma.state().stack, vec![Value::Bool(true)]);
    assert!(ma.state().frames.is_empty());
}

#[test]
fn test_yield_across_call_fails() {
    let mut ma = maatine();
    let f = function(ma.runtime(), &[CONST, 0, YIELD, 1], vec![Value::Num(1.0)]);
    assert!(matches!(ma.call(&mut Toy, f, &[]), Err(MaatError::NoCaller)));
    assert!(ma.state().stack.is_empty());
}

#[test]
fn test_coroutine_requires_callable_body() {
    let mut ma = maatine();
    assert!(matches!(
        ma.new_coroutine(Value::Num(1.0), true),
        Err(MaatError::NotCallable(Kind::Num))
    ));
}
