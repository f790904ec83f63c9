//! Maatine scheduler
//!
//! Work-stealing M:N scheduler running Maatines on a pool of OS threads,
//! plus the bounded ring queues and channels Maatines communicate through.

mod channel;
mod ring;
#[allow(clippy::module_inception)]
mod scheduler;
mod worker;

pub use channel::Channel;
pub use ring::RingQueue;
pub use scheduler::{DispatchFactory, MaatineHandle, Scheduler, SchedulerStats};
