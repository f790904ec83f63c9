//! Shared helpers for integration tests
//!
//! `Toy` is a tiny stack-machine interpreter standing in for the real
//! bytecode dispatcher. Each instruction is an opcode byte followed by one
//! operand byte.

#![allow(dead_code)]

use maat_core::object::FunctionProto;
use maat_core::{Dispatch, Exit, MaatError, MaatResult, Maatine, Runtime, RuntimeOptions, Value};
use std::sync::Arc;

/// Push constant `n`
pub const CONST: u8 = 0;
/// Push argument `n` of the current frame
pub const ARG: u8 = 1;
/// Pop two numbers, push their sum
pub const ADD: u8 = 2;
/// Yield the top `n` values
pub const YIELD: u8 = 3;
/// Return the top `n` values
pub const RET: u8 = 4;
/// Throw the popped value
pub const THROW: u8 = 5;
/// Pop a value and a channel, send the value
pub const SEND: u8 = 6;
/// Pop a channel, push the received value
pub const RECV: u8 = 7;

pub struct Toy;

impl Dispatch for Toy {
    fn execute(&mut self, ma: &mut Maatine, _entry_depth: usize) -> MaatResult<Exit> {
        loop {
            let (closure, ip, base) = {
                let frame = ma.state().frame().expect("no frame to execute");
                (frame.closure, frame.ip, frame.base)
            };
            let fun = ma.runtime().shared(closure)?;
            let fun = fun.as_fun().expect("not a function");
            let op = fun.code[ip];
            let arg = fun.code.get(ip + 1).copied().unwrap_or(0) as usize;
            ma.state_mut().frame_mut().expect("frame").ip = ip + 2;

            match op {
                CONST => ma.push(fun.constants[arg]),
                ARG => {
                    let v = ma.state().stack[base + arg];
                    ma.push(v);
                }
                ADD => {
                    let b = ma.pop().unwrap_or_default().try_num()?;
                    let a = ma.pop().unwrap_or_default().try_num()?;
                    ma.push(Value::Num(a + b));
                }
                YIELD => return Ok(Exit::Yield(arg)),
                RET => {
                    ma.state_mut().frames.pop();
                    return Ok(Exit::Return(arg));
                }
                THROW => return Err(MaatError::Thrown(ma.pop().unwrap_or_default())),
                SEND => {
                    let v = ma.pop().unwrap_or_default();
                    let ch = ma.pop().unwrap_or_default();
                    ma.channel_send(ch, v)?;
                }
                RECV => {
                    let ch = ma.pop().unwrap_or_default();
                    let v = ma.channel_recv(ch)?;
                    ma.push(v);
                }
                other => panic!("bad opcode {}", other),
            }
        }
    }
}

/// Store a toy function in the shared space
pub fn function(rt: &Runtime, code: &[u8], constants: Vec<Value>) -> Value {
    rt.define_function(FunctionProto {
        name: None,
        code: Arc::from(code),
        constants,
        arity: 0,
        namespace: 0,
        nupvals: 0,
    })
    .unwrap()
}

/// Runtime with a fixed seed
pub fn runtime() -> Arc<Runtime> {
    init_logging();
    Runtime::new(RuntimeOptions {
        seed: Some(0x5eed),
        ..RuntimeOptions::default()
    })
    .unwrap()
}

/// Install a subscriber filtered by `MAAT_LOG`; later calls are no-ops
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("MAAT_LOG"))
        .with_test_writer()
        .try_init();
}
