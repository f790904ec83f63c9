//! Interface to the bytecode interpreter
//!
//! The core never decodes instructions. Whenever a closure has to run,
//! the Maatine pushes a [`crate::CallFrame`] on the current State and hands
//! control to a [`Dispatch`] implementation supplied by the embedder.

use crate::maatine::Maatine;
use crate::MaatResult;

/// How [`Dispatch::execute`] gave control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The frame at `entry_depth` returned; this many results sit on top of
    /// the State's stack
    Return(usize),
    /// The running coroutine yielded; this many values sit on top of its stack
    Yield(usize),
}

/// Bytecode interpreter
pub trait Dispatch {
    /// Run the current State of `ma` until its frame count drops back to
    /// `entry_depth` or the code yields
    ///
    /// Errors propagate unchanged; language exceptions are
    /// [`crate::MaatError::Thrown`]. The Maatine unwinds the frames above
    /// `entry_depth` itself.
    fn execute(&mut self, ma: &mut Maatine, entry_depth: usize) -> MaatResult<Exit>;
}

impl<D: Dispatch + ?Sized> Dispatch for Box<D> {
    fn execute(&mut self, ma: &mut Maatine, entry_depth: usize) -> MaatResult<Exit> {
        (**self).execute(ma, entry_depth)
    }
}
