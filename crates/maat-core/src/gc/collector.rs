//! Generational incremental collector
//!
//! Each Maatine owns one [`GarbageCollector`]. It is advanced only at safe
//! points, in bounded steps:
//!
//! ```text
//! minor: Idle -> MarkRoots -> MarkIncremental -> Sweep      -> Idle
//! major: Idle -> MarkRoots -> MajorMark       -> MajorSweep -> Idle
//! ```
//!
//! Minor cycles only color young objects; old objects count as black and
//! old-to-young edges are found through the remembered set. A young object
//! is promoted once it has survived `gc_minor` minor cycles; major cycles
//! free young garbage but leave the survivors' age alone. Stores into
//! objects go through [`GarbageCollector::write_barrier`], which both
//! maintains the remembered set and grays white targets of black parents.
//! States are not barriered: they stay on the gray-again list and are
//! re-scanned atomically before the sweep starts.

use super::heap::Heap;
use super::roots::RootSet;
use crate::config::GcParams;
use crate::defaults::MIN_GC_THRESHOLD;
use crate::object::{Color, Mark, ObjBody, ObjRef};
use crate::value::{Kind, Value};
use crate::{MaatError, MaatResult};
use rustc_hash::FxHashSet;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Collector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No cycle in progress
    Idle,
    /// Roots are grayed at the next step
    MarkRoots,
    /// Minor cycle: draining the gray lists
    MarkIncremental,
    /// Minor cycle: reclaiming unmarked young objects
    Sweep,
    /// Major cycle: draining the gray lists
    MajorMark,
    /// Major cycle: reclaiming unmarked objects of both generations
    MajorSweep,
}

impl GcPhase {
    /// Whether a mark phase is in progress
    pub fn is_marking(self) -> bool {
        matches!(self, GcPhase::MarkRoots | GcPhase::MarkIncremental | GcPhase::MajorMark)
    }

    /// Whether a sweep phase is in progress
    pub fn is_sweeping(self) -> bool {
        matches!(self, GcPhase::Sweep | GcPhase::MajorSweep)
    }
}

/// Garbage collector statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Completed minor cycles
    pub minor_collections: usize,

    /// Completed major cycles
    pub major_collections: usize,

    /// Emergency full collections forced by the heap limit
    pub emergency_collections: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total bytes freed
    pub bytes_freed: usize,

    /// Objects moved to the old generation
    pub objects_promoted: usize,

    /// Incremental steps taken
    pub steps: usize,

    /// Total time spent in the collector
    pub total_pause_time: Duration,

    /// Duration of the last step or synchronous collection
    pub last_pause_time: Duration,
}

/// Per-heap generational, incremental, tri-color collector
pub struct GarbageCollector {
    /// Heap allocator
    heap: Heap,

    /// Pacing parameters
    params: GcParams,

    /// Current phase
    phase: GcPhase,

    /// Current cycle is a major one
    major: bool,

    /// Gray young objects
    gray: Vec<u32>,

    /// Gray old objects
    gray2: Vec<u32>,

    /// States to re-scan before the sweep
    grayagain: Vec<u32>,

    /// Old objects that may reference young ones
    remembered: FxHashSet<u32>,

    /// Snapshot of the lists being swept
    sweeping: Vec<u32>,

    /// Sweep cursor into `sweeping`
    sweep_pos: usize,

    /// Heap size that starts the next cycle
    threshold: usize,

    /// Old-generation size that makes the next cycle a major one
    old_threshold: usize,

    /// Objects and bytes freed by the current cycle
    cycle_freed: (usize, usize),

    /// Reusable child buffer
    scratch: Vec<Value>,

    /// Statistics
    stats: GcStats,
}

impl GarbageCollector {
    /// Create a collector for the heap of space `space`
    pub fn new(space: u32, params: GcParams) -> Self {
        Self {
            heap: Heap::new(space),
            params,
            phase: GcPhase::Idle,
            major: false,
            gray: Vec::new(),
            gray2: Vec::new(),
            grayagain: Vec::new(),
            remembered: FxHashSet::default(),
            sweeping: Vec::new(),
            sweep_pos: 0,
            threshold: MIN_GC_THRESHOLD,
            old_threshold: MIN_GC_THRESHOLD,
            cycle_freed: (0, 0),
            scratch: Vec::new(),
            stats: GcStats::default(),
        }
    }

    /// The heap
    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, mutable
    ///
    /// Stores of references into objects must be followed by
    /// [`GarbageCollector::write_barrier`].
    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Pacing parameters
    pub fn params(&self) -> &GcParams {
        &self.params
    }

    /// Current phase
    #[inline]
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Whether the current cycle is a major one
    pub fn is_major(&self) -> bool {
        self.major
    }

    /// Get GC statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Heap size that starts the next cycle
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether `r` is in the remembered set
    pub fn is_remembered(&self, r: ObjRef) -> bool {
        self.heap.owns(r) && self.remembered.contains(&r.slot())
    }

    /// Allocate an object
    ///
    /// Exceeding `max_heap` forces an emergency full collection with the
    /// roots produced by `roots`; if the heap is still too large the
    /// allocation fails with [`MaatError::OutOfMemory`].
    pub fn allocate(
        &mut self,
        body: ObjBody,
        class: ObjRef,
        roots: impl FnOnce() -> RootSet,
    ) -> MaatResult<ObjRef> {
        let size = body.size_hint();
        if let Some(limit) = self.params.max_heap {
            if self.heap.allocated_bytes() + size > limit {
                warn!(
                    target: "maat::gc",
                    bytes = self.heap.allocated_bytes(),
                    limit,
                    "heap limit reached, running emergency collection"
                );
                self.stats.emergency_collections += 1;
                let roots = roots();
                self.full_collect(&roots);
                if self.heap.allocated_bytes() + size > limit {
                    return Err(MaatError::OutOfMemory { limit });
                }
            }
        }

        let tag = body.default_tag();
        let marking = self.phase.is_marking();
        let color = if marking { Color::Black } else { Color::White };
        let r = self.heap.insert(tag, class, body, color);
        if marking {
            // a black newcomer must not point at white objects
            if tag.kind() == Kind::State {
                self.grayagain.push(r.slot());
            }
            self.trace_children(r.slot());
        }
        Ok(r)
    }

    /// Record the store of `child` into `parent`
    pub fn write_barrier(&mut self, parent: ObjRef, child: Value) {
        let Some(c) = child.obj_ref() else {
            return;
        };
        if !self.heap.owns(c) || !self.heap.owns(parent) {
            return;
        }
        let parent_mark = self.heap.get(parent).header.mark;
        let child_old = self.heap.get(c).header.mark.is_old();
        if parent_mark.is_old() && !child_old {
            self.remembered.insert(parent.slot());
        }
        if self.phase.is_marking() && self.is_black(parent_mark) {
            self.shade(child);
        }
    }

    /// Run one bounded step of the current cycle, starting one when the
    /// heap crossed its threshold
    ///
    /// Returns true when a cycle finished during this step.
    pub fn step(&mut self, roots: &RootSet) -> bool {
        let start = Instant::now();
        let finished = match self.phase {
            GcPhase::Idle => {
                if self.heap.allocated_bytes() >= self.threshold {
                    let major = self.heap.old_bytes() >= self.old_threshold;
                    self.start_cycle(major);
                }
                false
            }
            _ => self.advance(roots, self.params.step_budget()),
        };
        self.stats.steps += 1;
        self.record_pause(start.elapsed());
        finished
    }

    /// Run one bounded step, starting a cycle now if none is running
    pub fn force_step(&mut self, roots: &RootSet) -> bool {
        if self.phase == GcPhase::Idle {
            let major = self.heap.old_bytes() >= self.old_threshold;
            self.start_cycle(major);
        }
        self.step(roots)
    }

    /// Whether a step would do any work
    pub fn wants_step(&self) -> bool {
        self.phase != GcPhase::Idle || self.heap.allocated_bytes() >= self.threshold
    }

    /// Run a complete minor collection synchronously
    pub fn collect_minor(&mut self, roots: &RootSet) {
        self.collect(false, roots);
    }

    /// Run a complete major collection synchronously
    pub fn full_collect(&mut self, roots: &RootSet) {
        self.collect(true, roots);
    }

    fn collect(&mut self, major: bool, roots: &RootSet) {
        let start = Instant::now();
        // finish whatever cycle is in flight first
        while self.phase != GcPhase::Idle {
            self.advance(roots, usize::MAX);
        }
        self.start_cycle(major);
        while self.phase != GcPhase::Idle {
            self.advance(roots, usize::MAX);
        }
        self.record_pause(start.elapsed());
    }

    fn record_pause(&mut self, elapsed: Duration) {
        self.stats.last_pause_time = elapsed;
        self.stats.total_pause_time += elapsed;
    }

    fn start_cycle(&mut self, major: bool) {
        trace!(
            target: "maat::gc",
            space = self.heap.space(),
            major,
            bytes = self.heap.allocated_bytes(),
            "starting cycle"
        );
        self.phase = GcPhase::MarkRoots;
        self.major = major;
        self.cycle_freed = (0, 0);
    }

    // Perform up to `budget` units of work; true when the cycle ended.
    fn advance(&mut self, roots: &RootSet, budget: usize) -> bool {
        match self.phase {
            GcPhase::Idle => false,
            GcPhase::MarkRoots => {
                self.mark_roots(roots);
                self.phase = if self.major {
                    GcPhase::MajorMark
                } else {
                    GcPhase::MarkIncremental
                };
                false
            }
            GcPhase::MarkIncremental | GcPhase::MajorMark => {
                if self.propagate(budget) {
                    self.remark(roots);
                    self.start_sweep();
                }
                false
            }
            GcPhase::Sweep | GcPhase::MajorSweep => {
                if self.sweep_step(budget) {
                    self.finish_cycle();
                    true
                } else {
                    false
                }
            }
        }
    }

    #[inline]
    fn is_black(&self, mark: Mark) -> bool {
        mark.color() == Color::Black || (!self.major && mark.is_old())
    }

    fn shade(&mut self, value: Value) {
        let Some(r) = value.obj_ref() else {
            return;
        };
        if !self.heap.owns(r) {
            return;
        }
        let major = self.major;
        let mark = &mut self.heap.get_mut(r).header.mark;
        if !major && mark.is_old() {
            return;
        }
        if mark.color() == Color::White {
            mark.set_color(Color::Gray);
            if mark.is_old() {
                self.gray2.push(r.slot());
            } else {
                self.gray.push(r.slot());
            }
        }
    }

    fn trace_children(&mut self, slot: u32) {
        let mut buf = std::mem::take(&mut self.scratch);
        if let Some(obj) = self.heap.slot(slot) {
            obj.for_each_ref(|v| buf.push(v));
        }
        for v in buf.drain(..) {
            self.shade(v);
        }
        self.scratch = buf;
    }

    fn has_young_children(&mut self, slot: u32) -> bool {
        let mut buf = std::mem::take(&mut self.scratch);
        if let Some(obj) = self.heap.slot(slot) {
            obj.for_each_ref(|v| buf.push(v));
        }
        let young = buf.drain(..).any(|v| match v.obj_ref() {
            Some(r) => self
                .heap
                .try_get(r)
                .is_some_and(|child| !child.header.mark.is_old()),
            None => false,
        });
        buf.clear();
        self.scratch = buf;
        young
    }

    fn mark_roots(&mut self, roots: &RootSet) {
        for v in roots.iter() {
            self.shade(v);
        }
        if !self.major {
            // old States are never barriered and old parents are never
            // traced by a minor cycle: scan both directly
            let old_states: Vec<u32> = self
                .heap
                .states
                .iter()
                .copied()
                .filter(|s| self.heap.slot(*s).is_some_and(|o| o.header.mark.is_old()))
                .collect();
            for s in old_states {
                self.trace_children(s);
            }
            let remembered: Vec<u32> = self.remembered.iter().copied().collect();
            for s in remembered {
                self.trace_children(s);
            }
        }
    }

    // Blacken gray objects; true when both gray lists are empty.
    fn propagate(&mut self, budget: usize) -> bool {
        let mut work = 0;
        while work < budget {
            let Some(slot) = self.gray.pop().or_else(|| self.gray2.pop()) else {
                return true;
            };
            let Some(obj) = self.heap.slot_mut(slot) else {
                continue;
            };
            obj.header.mark.set_color(Color::Black);
            if obj.kind() == Kind::State {
                self.grayagain.push(slot);
            }
            self.trace_children(slot);
            work += 1;
        }
        self.gray.is_empty() && self.gray2.is_empty()
    }

    // Atomic final mark: roots and States again, then drain.
    fn remark(&mut self, roots: &RootSet) {
        self.mark_roots(roots);
        let again = std::mem::take(&mut self.grayagain);
        for s in again {
            self.trace_children(s);
        }
        self.propagate(usize::MAX);
        self.grayagain.clear();
    }

    fn start_sweep(&mut self) {
        self.phase = if self.major {
            GcPhase::MajorSweep
        } else {
            GcPhase::Sweep
        };
        let mut sweeping = std::mem::take(&mut self.heap.nursery);
        sweeping.append(&mut self.heap.nursery2);
        if self.major {
            sweeping.append(&mut self.heap.old);
        }
        self.sweeping = sweeping;
        self.sweep_pos = 0;
    }

    // Sweep up to `budget` objects; true when the snapshot is exhausted.
    fn sweep_step(&mut self, budget: usize) -> bool {
        let end = self.sweep_pos.saturating_add(budget).min(self.sweeping.len());
        for i in self.sweep_pos..end {
            let slot = self.sweeping[i];
            self.sweep_slot(slot);
        }
        self.sweep_pos = end;
        end == self.sweeping.len()
    }

    fn sweep_slot(&mut self, slot: u32) {
        let Some(obj) = self.heap.slot_mut(slot) else {
            return;
        };
        let mark = obj.header.mark;
        if mark.color() == Color::White {
            let size = self.heap.free(slot);
            self.cycle_freed.0 += 1;
            self.cycle_freed.1 += size;
            return;
        }

        obj.header.mark.set_color(Color::White);
        if mark.is_old() {
            self.heap.old2.push(slot);
            return;
        }

        // age counts minor survivals only
        if self.major {
            self.heap.nursery2.push(slot);
            return;
        }
        obj.header.mark.bump_age();
        if obj.header.mark.age() < self.params.minor {
            self.heap.nursery2.push(slot);
            return;
        }

        obj.header.mark.set_old();
        let size = obj.header.size;
        self.heap.old_bytes += size;
        self.heap.old.push(slot);
        self.stats.objects_promoted += 1;
        if self.has_young_children(slot) {
            self.remembered.insert(slot);
        }
    }

    fn finish_cycle(&mut self) {
        if self.major {
            let mut old2 = std::mem::take(&mut self.heap.old2);
            self.heap.old.append(&mut old2);
        }
        self.sweeping.clear();
        self.sweep_pos = 0;

        let remembered: Vec<u32> = self.remembered.drain().collect();
        for slot in remembered {
            let is_old = self.heap.slot(slot).is_some_and(|o| o.header.mark.is_old());
            if is_old && self.has_young_children(slot) {
                self.remembered.insert(slot);
            }
        }
        self.rebuild_finalizer_lists();

        let (objects, bytes) = self.cycle_freed;
        self.stats.objects_freed += objects;
        self.stats.bytes_freed += bytes;
        if self.major {
            self.stats.major_collections += 1;
            self.old_threshold = (self.heap.old_bytes() * (100 + self.params.major) / 100)
                .max(MIN_GC_THRESHOLD);
        } else {
            self.stats.minor_collections += 1;
        }
        let live = self.heap.allocated_bytes();
        self.threshold = (live * self.params.pause / 100).max(MIN_GC_THRESHOLD);

        debug!(
            target: "maat::gc",
            space = self.heap.space(),
            major = self.major,
            freed_objects = objects,
            freed_bytes = bytes,
            live_bytes = live,
            old_bytes = self.heap.old_bytes(),
            "cycle finished"
        );
        self.phase = GcPhase::Idle;
        self.major = false;
    }

    fn rebuild_finalizer_lists(&mut self) {
        let mut all = std::mem::take(&mut self.heap.fin_young);
        all.append(&mut self.heap.fin_old);
        for slot in all {
            match self.heap.slot(slot) {
                Some(obj) if obj.header.finalizable => {
                    if obj.header.mark.is_old() {
                        self.heap.fin_old.push(slot);
                    } else {
                        self.heap.fin_young.push(slot);
                    }
                }
                _ => {}
            }
        }
    }

    /// Verify list membership and the tri-color invariant
    ///
    /// During a mark phase no black object (old objects count as black in
    /// a minor cycle) may reference a white one. States are exempt: they
    /// are re-scanned before the sweep.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = FxHashSet::default();
        let lists: [(&[u32], bool, &str); 4] = [
            (&self.heap.nursery, false, "nursery"),
            (&self.heap.nursery2, false, "nursery2"),
            (&self.heap.old, true, "old"),
            (&self.heap.old2, true, "old2"),
        ];
        for (list, old, name) in lists {
            for &slot in list {
                let obj = self
                    .heap
                    .slot(slot)
                    .ok_or_else(|| format!("dead slot {} on {} list", slot, name))?;
                if obj.header.mark.is_old() != old {
                    return Err(format!("slot {} on {} list has mark {:?}", slot, name, obj.header.mark));
                }
                if !seen.insert(slot) {
                    return Err(format!("slot {} is on two lists", slot));
                }
            }
        }
        if self.phase.is_sweeping() {
            for &slot in &self.sweeping[self.sweep_pos..] {
                if self.heap.slot(slot).is_some() && !seen.insert(slot) {
                    return Err(format!("slot {} is on two lists", slot));
                }
            }
        }
        for (r, _) in self.heap.iter() {
            if !seen.contains(&r.slot()) {
                return Err(format!("{:?} is on no list", r));
            }
        }

        if !matches!(self.phase, GcPhase::MarkIncremental | GcPhase::MajorMark) {
            return Ok(());
        }
        for (r, obj) in self.heap.iter() {
            if obj.kind() == Kind::State || !self.is_black(obj.header.mark) {
                continue;
            }
            let mut violation = None;
            obj.for_each_ref(|v| {
                let Some(c) = v.obj_ref() else {
                    return;
                };
                let Some(child) = self.heap.try_get(c) else {
                    return;
                };
                let mark = child.header.mark;
                if mark.color() == Color::White && !(!self.major && mark.is_old()) {
                    violation = Some(c);
                }
            });
            if let Some(c) = violation {
                return Err(format!("black {:?} references white {:?}", r, c));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ArrayObj, RangeObj, SHARED_SPACE};

    fn class() -> ObjRef {
        ObjRef::new(SHARED_SPACE, 0, 0)
    }

    fn gc() -> GarbageCollector {
        GarbageCollector::new(1, GcParams::default())
    }

    fn array(gc: &mut GarbageCollector, items: Vec<Value>) -> Value {
        let r = gc
            .allocate(ObjBody::Array(ArrayObj::from_vec(items, false)), class(), RootSet::new)
            .unwrap();
        Value::object(Kind::Array, 0, r)
    }

    fn range(gc: &mut GarbageCollector) -> Value {
        let r = gc
            .allocate(ObjBody::Range(RangeObj { from: 0.0, to: 1.0 }), class(), RootSet::new)
            .unwrap();
        Value::object(Kind::Range, 0, r)
    }

    fn roots(values: &[Value]) -> RootSet {
        let mut roots = RootSet::new();
        for v in values {
            roots.add_root(*v);
        }
        roots
    }

    #[test]
    fn test_minor_frees_unreachable() {
        let mut gc = gc();
        let kept = range(&mut gc);
        let lost = range(&mut gc);
        gc.collect_minor(&roots(&[kept]));

        assert!(gc.heap().contains(kept.obj_ref().unwrap()));
        assert!(!gc.heap().contains(lost.obj_ref().unwrap()));
        assert_eq!(gc.stats().minor_collections, 1);
        assert_eq!(gc.stats().objects_freed, 1);
        gc.check_invariants().unwrap();
    }

    #[test]
    fn test_children_survive_through_parent() {
        let mut gc = gc();
        let child = range(&mut gc);
        let parent = array(&mut gc, vec![child]);
        gc.full_collect(&roots(&[parent]));
        assert!(gc.heap().contains(child.obj_ref().unwrap()));
        assert_eq!(gc.stats().major_collections, 1);
    }

    #[test]
    fn test_promotion_after_minor_cycles() {
        let mut gc = gc();
        let v = range(&mut gc);
        let r = v.obj_ref().unwrap();
        for _ in 0..gc.params().minor - 1 {
            gc.collect_minor(&roots(&[v]));
            assert!(!gc.heap().get(r).header.mark.is_old());
        }
        gc.collect_minor(&roots(&[v]));
        assert!(gc.heap().get(r).header.mark.is_old());
        assert_eq!(gc.stats().objects_promoted, 1);
        gc.check_invariants().unwrap();
    }

    #[test]
    fn test_major_cycles_do_not_age_young_objects() {
        let mut gc = gc();
        let v = range(&mut gc);
        let r = v.obj_ref().unwrap();
        for _ in 0..gc.params().minor + 2 {
            gc.full_collect(&roots(&[v]));
        }
        assert_eq!(gc.heap().get(r).header.mark.age(), 0);
        assert!(!gc.heap().get(r).header.mark.is_old());
        assert_eq!(gc.stats().objects_promoted, 0);

        for _ in 0..gc.params().minor {
            gc.collect_minor(&roots(&[v]));
        }
        assert!(gc.heap().get(r).header.mark.is_old());
        gc.check_invariants().unwrap();
    }

    #[test]
    fn test_barrier_records_old_to_young() {
        let mut gc = gc();
        let parent = array(&mut gc, vec![]);
        for _ in 0..gc.params().minor {
            gc.collect_minor(&roots(&[parent]));
        }
        let p = parent.obj_ref().unwrap();
        assert!(gc.heap().get(p).header.mark.is_old());

        let child = range(&mut gc);
        if let ObjBody::Array(a) = &mut gc.heap_mut().get_mut(p).body {
            a.push(child);
        }
        gc.write_barrier(p, child);
        assert!(gc.is_remembered(p));

        // the parent itself is not a root any more: only the remembered set keeps the child
        gc.collect_minor(&RootSet::new());
        assert!(gc.heap().contains(child.obj_ref().unwrap()));
    }

    #[test]
    fn test_barrier_grays_during_marking() {
        let mut gc = gc();
        let parent = array(&mut gc, vec![]);
        let p = parent.obj_ref().unwrap();
        let root_set = roots(&[parent]);
        gc.start_cycle(false);
        gc.advance(&root_set, usize::MAX); // roots
        gc.advance(&root_set, 1); // blacken parent
        assert_eq!(gc.heap().get(p).header.mark.color(), Color::Black);

        let white = {
            // allocated before the cycle would be white; fake one by clearing the mark
            let v = range(&mut gc);
            gc.heap_mut().get_mut(v.obj_ref().unwrap()).header.mark.set_color(Color::White);
            v
        };
        if let ObjBody::Array(a) = &mut gc.heap_mut().get_mut(p).body {
            a.push(white);
        }
        assert!(gc.check_invariants().is_err());
        gc.write_barrier(p, white);
        gc.check_invariants().unwrap();
    }

    #[test]
    fn test_emergency_collection_then_oom() {
        let params = GcParams {
            max_heap: Some(4096),
            ..GcParams::default()
        };
        let mut gc = GarbageCollector::new(1, params);
        // garbage only: the emergency collection reclaims it
        for _ in 0..1000 {
            range(&mut gc);
        }
        assert!(gc.stats().emergency_collections > 0);

        let mut live = Vec::new();
        let result = loop {
            let kept = live.clone();
            match gc.allocate(ObjBody::Range(RangeObj { from: 0.0, to: 1.0 }), class(), || roots(&kept)) {
                Ok(r) => live.push(Value::object(Kind::Range, 0, r)),
                Err(e) => break e,
            }
        };
        assert!(matches!(result, MaatError::OutOfMemory { limit: 4096 }));
    }

    #[test]
    fn test_incremental_steps_finish_cycle() {
        let params = GcParams {
            step_size: 1,
            step_mul: 100,
            ..GcParams::default()
        };
        let mut gc = GarbageCollector::new(1, params);
        let items: Vec<Value> = (0..10).map(|_| range(&mut gc)).collect();
        let parent = array(&mut gc, items);
        let root_set = roots(&[parent]);
        gc.start_cycle(false);
        let mut steps = 0;
        while !gc.step(&root_set) {
            gc.check_invariants().unwrap();
            steps += 1;
            assert!(steps < 100);
        }
        assert!(steps > 3);
        assert_eq!(gc.heap().object_count(), 11);
    }
}
