//! Default constants for runtime configuration.
//!
//! Centralizes the collector pacing knobs, table sizes and queue capacities
//! used by config.rs, the heaps, the shared space and the scheduler.

/// Percent of the live size allowed to accumulate before the next minor cycle starts.
pub const DEFAULT_GC_PAUSE: usize = 200;

/// Base number of work units (objects traced or swept) per incremental step.
pub const DEFAULT_GC_SSIZE: usize = 256;

/// Percent multiplier applied to the step size.
pub const DEFAULT_GC_SMUL: usize = 200;

/// Number of minor collections an object must survive before promotion.
pub const DEFAULT_GC_MINOR: u8 = 2;

/// Percent of old-generation growth since the last major cycle that triggers a new one.
pub const DEFAULT_GC_MAJOR: usize = 100;

/// Lower bound for the minor-cycle threshold in bytes (64 KB).
pub const MIN_GC_THRESHOLD: usize = 64 * 1024;

/// Longest string, in bytes, that is interned as a short string.
pub const MAX_SHORT_LEN: usize = 40;

/// Number of buckets in the short-string intern table.
pub const INTERN_BUCKETS: usize = 256;

/// Shared-space insertions between two global marking passes.
pub const DEFAULT_SOS_THRESHOLD: usize = 4096;

/// Shared objects traced per poll of an open pass.
pub const SOS_TRACE_BUDGET: usize = 512;

/// Capacity of a Maatine's ready queue.
pub const DEFAULT_READY_CAPACITY: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Largest integer key stored in a map's array part.
pub const MAX_ARRAY_PART: usize = 1 << 20;

/// Works run by a Maatine in one scheduler slice.
pub const DEFAULT_SLICE_BUDGET: usize = 64;

/// Maximum call depth of a single State.
pub const MAX_CALL_DEPTH: usize = 4096;
