//! Maat VM Core Runtime
//!
//! This crate provides the runtime core of the Maat virtual machine:
//! - Tagged values and the collectable object model
//! - Per-Maatine generational, incremental garbage collector
//! - Shared Object Space (SOS) with string interning and cross-heap marking
//! - Execution States (coroutines and generators)
//! - Work tasks with then/catch chains
//! - M:N scheduler, ring queues and channels

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod defaults;
pub mod dispatch;
pub mod gc;
pub mod maatine;
pub mod object;
pub mod runtime;
pub mod scheduler;
pub mod sos;
pub mod state;
pub mod value;
pub mod work;

pub use config::{GcParams, RuntimeOptions, SchedulerOptions};
pub use dispatch::{Dispatch, Exit};
pub use gc::{GarbageCollector, GcPhase, GcStats, Heap};
pub use maatine::{CoResult, Maatine, MaatineId, MaatineStatus, SliceOutcome};
pub use object::{Header, HeapObject, ObjBody, ObjRef};
pub use runtime::Runtime;
pub use scheduler::{Channel, MaatineHandle, RingQueue, Scheduler, SchedulerStats};
pub use sos::{SharedObject, SharedSpace, StringTable};
pub use state::{BackRef, CallFrame, CoStatus, StateObj};
pub use value::{Kind, NativeFn, Num, Payload, Tag, Value};
pub use work::{WorkObj, WorkStatus};

/// Runtime errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum MaatError {
    /// Language-level exception carrying the thrown value
    #[error("uncaught exception: {0:?}")]
    Thrown(Value),

    /// Heap limit exceeded even after an emergency full collection
    #[error("out of memory: heap limit of {limit} bytes exceeded")]
    OutOfMemory {
        /// Configured heap limit in bytes
        limit: usize,
    },

    /// Resume of a coroutine that already returned or failed
    #[error("cannot resume a dead coroutine")]
    DeadCoroutine,

    /// Resume of a coroutine that is running or waiting on a nested resume
    #[error("coroutine is not suspended")]
    NotSuspended,

    /// Resume target is not a coroutine State
    #[error("value is not a coroutine")]
    NotACoroutine,

    /// Yield outside of any coroutine
    #[error("cannot yield from the primary state")]
    NoCaller,

    /// State or object owned by another Maatine
    #[error("object belongs to another maatine")]
    CrossMaatine,

    /// Call on a non-callable value
    #[error("value of kind {0} is not callable")]
    NotCallable(Kind),

    /// Value cannot be used as a map key
    #[error("invalid map key of kind {0}")]
    InvalidKey(Kind),

    /// Value cannot be moved into the shared object space
    #[error("{0} values cannot be shared between maatines")]
    NotShareable(Kind),

    /// Type mismatch detected by a checked accessor
    #[error("type error: expected {expected}, found {found}")]
    TypeError {
        /// Expected kind
        expected: Kind,
        /// Actual kind
        found: Kind,
    },

    /// Index outside of an array or attribute buffer
    #[error("index {0} out of bounds")]
    IndexOutOfBounds(usize),

    /// Ring queue has no free slot
    #[error("queue is full")]
    QueueFull,

    /// Channel was closed by one of its ends
    #[error("channel is closed")]
    ChannelClosed,

    /// Operation must be retried after yielding to the scheduler
    #[error("operation would block")]
    WouldBlock,

    /// The Maatine was terminated by a fatal or unhandled error
    #[error("maatine has terminated")]
    Terminated,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A scheduler worker thread could not be started
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl MaatError {
    /// Whether language code may catch this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MaatError::Thrown(_))
    }

    /// Whether this error ends the Maatine it occurred on
    pub fn is_fatal(&self) -> bool {
        matches!(self, MaatError::OutOfMemory { .. } | MaatError::Terminated)
    }
}

/// Runtime result
pub type MaatResult<T> = Result<T, MaatError>;
