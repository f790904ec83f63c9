//! Runtime configuration
//!
//! Options are plain structs with defaults from [`crate::defaults`]. They can
//! be loaded from a TOML document and overridden from the environment:
//!
//! ```toml
//! [gc]
//! pause = 150
//! minor = 3
//! max_heap = 67108864
//!
//! [scheduler]
//! num_threads = 4
//! ```

use crate::defaults::*;
use crate::{MaatError, MaatResult};
use serde::Deserialize;

/// Collector pacing parameters of a single heap
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcParams {
    /// Percent of live size to allocate before the next cycle (`gc_pause`)
    pub pause: usize,

    /// Work units per incremental step (`gc_ssize`)
    pub step_size: usize,

    /// Step multiplier in percent (`gc_smul`)
    pub step_mul: usize,

    /// Minor collections survived before promotion (`gc_minor`)
    pub minor: u8,

    /// Percent of old-generation growth that triggers a major cycle (`gc_major`)
    pub major: usize,

    /// Hard heap limit in bytes; exceeding it forces an emergency collection
    pub max_heap: Option<usize>,
}

impl Default for GcParams {
    fn default() -> Self {
        Self {
            pause: DEFAULT_GC_PAUSE,
            step_size: DEFAULT_GC_SSIZE,
            step_mul: DEFAULT_GC_SMUL,
            minor: DEFAULT_GC_MINOR,
            major: DEFAULT_GC_MAJOR,
            max_heap: None,
        }
    }
}

impl GcParams {
    /// Work units granted to one incremental step
    pub fn step_budget(&self) -> usize {
        (self.step_size * self.step_mul / 100).max(1)
    }

    pub(crate) fn validate(&self) -> MaatResult<()> {
        if self.minor == 0 {
            return Err(MaatError::Config("gc.minor must be at least 1".into()));
        }
        if self.pause < 100 {
            return Err(MaatError::Config("gc.pause must be at least 100".into()));
        }
        if self.step_size == 0 || self.step_mul == 0 {
            return Err(MaatError::Config("gc step size and multiplier must be positive".into()));
        }
        Ok(())
    }
}

/// Scheduler options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerOptions {
    /// Number of worker OS threads
    pub num_threads: usize,

    /// Works a Maatine runs before it is put back on the queue
    pub slice_budget: usize,

    /// Ready-queue capacity of each Maatine
    pub ready_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get(),
            slice_budget: DEFAULT_SLICE_BUDGET,
            ready_capacity: DEFAULT_READY_CAPACITY,
        }
    }
}

/// Options for a [`crate::Runtime`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeOptions {
    /// Collector parameters applied to every new Maatine heap
    pub gc: GcParams,

    /// Scheduler options
    pub scheduler: SchedulerOptions,

    /// Shared-space insertions that trigger a global marking pass
    pub sos_threshold: usize,

    /// Fixed seed for string hashing; random when absent
    pub seed: Option<u64>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            gc: GcParams::default(),
            scheduler: SchedulerOptions::default(),
            sos_threshold: DEFAULT_SOS_THRESHOLD,
            seed: None,
        }
    }
}

impl RuntimeOptions {
    /// Parse options from a TOML document
    pub fn from_toml_str(source: &str) -> MaatResult<Self> {
        let options: RuntimeOptions =
            toml::from_str(source).map_err(|e| MaatError::Config(e.to_string()))?;
        options.gc.validate()?;
        Ok(options)
    }

    /// Apply `MAAT_NUM_THREADS` and `MAAT_MAX_HEAP` overrides
    pub fn with_env(mut self) -> MaatResult<Self> {
        if let Ok(threads) = std::env::var("MAAT_NUM_THREADS") {
            self.scheduler.num_threads = threads
                .parse()
                .map_err(|_| MaatError::Config(format!("invalid MAAT_NUM_THREADS: {}", threads)))?;
        }
        if let Ok(limit) = std::env::var("MAAT_MAX_HEAP") {
            let bytes = limit
                .parse()
                .map_err(|_| MaatError::Config(format!("invalid MAAT_MAX_HEAP: {}", limit)))?;
            self.gc.max_heap = Some(bytes);
        }
        self.gc.validate()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RuntimeOptions::default();
        assert_eq!(options.gc.pause, DEFAULT_GC_PAUSE);
        assert_eq!(options.gc.minor, DEFAULT_GC_MINOR);
        assert!(options.scheduler.num_threads >= 1);
        assert_eq!(options.gc.step_budget(), 512);
    }

    #[test]
    fn test_from_toml() {
        let options = RuntimeOptions::from_toml_str(
            r#"
            seed = 7
            [gc]
            minor = 3
            max_heap = 1048576
            [scheduler]
            num_threads = 2
            "#,
        )
        .unwrap();

        assert_eq!(options.seed, Some(7));
        assert_eq!(options.gc.minor, 3);
        assert_eq!(options.gc.max_heap, Some(1 << 20));
        assert_eq!(options.gc.pause, DEFAULT_GC_PAUSE);
        assert_eq!(options.scheduler.num_threads, 2);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            RuntimeOptions::from_toml_str("[gc]\nminor = 0"),
            Err(MaatError::Config(_))
        ));
        assert!(matches!(
            RuntimeOptions::from_toml_str("[gc]\nbogus = 1"),
            Err(MaatError::Config(_))
        ));
    }
}
