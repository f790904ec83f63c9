//! Garbage collection
//!
//! One heap and one collector per Maatine. Shared objects are collected
//! separately by the [`crate::sos`] pass protocol.

pub mod collector;
pub mod heap;
pub mod roots;

pub use collector::{GarbageCollector, GcPhase, GcStats};
pub use heap::{Finalizer, Generation, Heap};
pub use roots::{RootSet, TempMark, TempRoots};
