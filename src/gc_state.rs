use crate::chunk::SLOT_SIZE;
use crate::mark_stack::{DrainState, MarkStack, MARK_LOOP_ITERATION_COUNT};
use crate::memory_manager::{Blockness, MemoryManager};
use crate::statistics::{formatted_size, SweepTally};
use crate::value::Value;
use crate::weak_collections::{WeakMapObject, WeakSetObject};
use std::time::{Duration, Instant};

/// One garbage collection cycle, broken into resumable steps. The order is
/// the execution order; the machine is idle exactly when the state is
/// `Invalid`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum GcState {
    MarkStart,
    MarkGlobalObject,
    MarkJSStack,
    InitMarkPersistentValues,
    MarkPersistentValues,
    InitMarkWeakValues,
    MarkWeakValues,
    MarkDrain,
    MarkReady,
    InitCallDestroyObjects,
    CallDestroyObjects,
    FreeWeakMaps,
    FreeWeakSets,
    HandleWeakHostReferences,
    DoSweep,
    Invalid,
}

/// States flagged here always yield control after executing, regardless of
/// the remaining time budget. Host finalizer bookkeeping runs right after
/// `FreeWeakSets` and wants a fresh slice to itself.
pub(crate) const fn break_after(state: GcState) -> bool {
    matches!(state, GcState::FreeWeakSets)
}

/// Point in time a work slice has to stop at. `forever` never expires and is
/// what forced (synchronous) completion runs under.
#[derive(Clone, Copy)]
pub struct Deadline {
    when: Option<Instant>,
}

impl Deadline {
    pub fn forever() -> Self {
        Self { when: None }
    }

    pub fn within(limit: Duration) -> Self {
        Self {
            when: Some(Instant::now() + limit),
        }
    }

    pub fn is_forever(&self) -> bool {
        self.when.is_none()
    }

    pub fn has_expired(&self) -> bool {
        match self.when {
            None => false,
            Some(t) => Instant::now() >= t,
        }
    }
}

pub(crate) struct GcStateMachine {
    pub state: GcState,
    /// Budget per incremental slice. Zero disables slicing entirely: a
    /// triggered collection then runs to completion synchronously.
    pub time_limit: Duration,
    pub deadline: Deadline,
    /// Resumable flat-index position for the table-iteration states.
    pub cursor: usize,
}

impl GcStateMachine {
    pub fn new(time_limit: Duration) -> Self {
        Self {
            state: GcState::Invalid,
            time_limit,
            deadline: Deadline::forever(),
            cursor: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.state != GcState::Invalid
    }
}

impl MemoryManager {
    /// Run the machine: either a single time-bounded slice, or to completion
    /// when slicing is disabled. While a cycle stays unfinished the host is
    /// expected to keep calling [`gc_step`](MemoryManager::gc_step) from its
    /// event loop.
    pub(crate) fn gc_transition(&mut self) {
        if self.gc.time_limit > Duration::from_millis(0) {
            self.gc.deadline = Deadline::within(self.gc.time_limit);
            while !self.gc.deadline.has_expired() && self.gc.state != GcState::Invalid {
                if self.gc.state > GcState::InitCallDestroyObjects {
                    // No deletion barrier: anything the mutator wired up
                    // since the last drain has to be re-collected before
                    // state handlers that observe mark bits run. Earlier
                    // states drain anyway, redraining there would only do
                    // busy work.
                    self.redrain();
                }
                let state = self.gc.state;
                self.gc.state = self.gc_execute(state);
                if break_after(state) {
                    break;
                }
            }
        } else {
            self.gc.deadline = Deadline::forever();
            while self.gc.state != GcState::Invalid {
                let state = self.gc.state;
                self.gc.state = self.gc_execute(state);
            }
        }
    }

    fn gc_execute(&mut self, state: GcState) -> GcState {
        match state {
            GcState::MarkStart => self.mark_start(),
            GcState::MarkGlobalObject => self.mark_global_object(),
            GcState::MarkJSStack => self.mark_js_stack(),
            GcState::InitMarkPersistentValues => self.init_mark_persistent_values(),
            GcState::MarkPersistentValues => self.mark_persistent_values(),
            GcState::InitMarkWeakValues => self.init_mark_weak_values(),
            GcState::MarkWeakValues => self.mark_weak_values(),
            GcState::MarkDrain => self.mark_drain(),
            GcState::MarkReady => self.mark_ready(),
            GcState::InitCallDestroyObjects => self.init_call_destroy_objects(),
            GcState::CallDestroyObjects => self.call_destroy_objects(),
            GcState::FreeWeakMaps => self.free_weak_maps_state(),
            GcState::FreeWeakSets => self.free_weak_sets_state(),
            GcState::HandleWeakHostReferences => self.handle_weak_host_references(),
            GcState::DoSweep => self.do_sweep(),
            GcState::Invalid => GcState::Invalid,
        }
    }

    fn mark_start(&mut self) -> GcState {
        self.mark_stack = Some(Box::new(MarkStack::new(
            self.config.mark_stack_size,
            &self.types,
        )));
        GcState::MarkGlobalObject
    }

    fn mark_global_object(&mut self) -> GcState {
        let mut stack = match self.mark_stack.take() {
            Some(s) => s,
            None => return GcState::Invalid,
        };
        let mut constraints = std::mem::take(&mut self.constraints);
        for constraint in constraints.iter_mut() {
            constraint(&mut stack);
        }
        self.constraints = constraints;
        self.mark_stack = Some(stack);
        GcState::MarkJSStack
    }

    fn mark_js_stack(&mut self) -> GcState {
        self.collect_from_stack();
        GcState::InitMarkPersistentValues
    }

    fn init_mark_persistent_values(&mut self) -> GcState {
        if self.persistent_values.slot_capacity() == 0 {
            return GcState::InitMarkWeakValues; // no persistent values to mark
        }
        self.gc.cursor = 0;
        GcState::MarkPersistentValues
    }

    fn mark_persistent_values(&mut self) -> GcState {
        let mut stack = match self.mark_stack.take() {
            Some(s) => s,
            None => return GcState::Invalid,
        };
        if stack.drain_if_near_soft_limit(self.gc.deadline) && self.gc.deadline.has_expired() {
            self.mark_stack = Some(stack);
            return GcState::MarkPersistentValues;
        }
        // batching keeps us from hitting the clock on every entry
        let mut next = GcState::MarkPersistentValues;
        for _ in 0..MARK_LOOP_ITERATION_COUNT {
            match self.persistent_values.value_at(self.gc.cursor) {
                None => {
                    next = GcState::InitMarkWeakValues;
                    break;
                }
                Some(value) => {
                    self.gc.cursor += 1;
                    if let Some(object) = value.as_object() {
                        stack.push(object);
                    }
                }
            }
        }
        self.mark_stack = Some(stack);
        next
    }

    fn init_mark_weak_values(&mut self) -> GcState {
        self.gc.cursor = 0;
        GcState::MarkWeakValues
    }

    fn mark_weak_values(&mut self) -> GcState {
        let mut stack = match self.mark_stack.take() {
            Some(s) => s,
            None => return GcState::Invalid,
        };
        if stack.drain_if_near_soft_limit(self.gc.deadline) && self.gc.deadline.has_expired() {
            self.mark_stack = Some(stack);
            return GcState::MarkWeakValues;
        }
        let mut policy = self.keep_alive_policy.take();
        let mut next = GcState::MarkWeakValues;
        for _ in 0..MARK_LOOP_ITERATION_COUNT {
            match self.weak_values.value_at(self.gc.cursor) {
                None => {
                    next = GcState::MarkDrain;
                    break;
                }
                Some(value) => {
                    self.gc.cursor += 1;
                    let object = match value.as_object() {
                        Some(o) => o,
                        None => continue,
                    };
                    // weak entries stay unmarked unless the host insists the
                    // referent has an external owner keeping it alive
                    if let Some(keep_alive) = policy.as_mut() {
                        if keep_alive(object) {
                            stack.push(object);
                        }
                    }
                }
            }
        }
        self.keep_alive_policy = policy;
        self.mark_stack = Some(stack);
        next
    }

    fn mark_drain(&mut self) -> GcState {
        let mut stack = match self.mark_stack.take() {
            Some(s) => s,
            None => return GcState::Invalid,
        };
        let next = if self.gc.deadline.is_forever() {
            stack.drain();
            GcState::MarkReady
        } else {
            match stack.drain_with_deadline(self.gc.deadline) {
                DrainState::Complete => GcState::MarkReady,
                DrainState::Ongoing => GcState::MarkDrain,
            }
        };
        self.mark_stack = Some(stack);
        next
    }

    fn mark_ready(&mut self) -> GcState {
        // checkpoint for statistics, nothing to do
        GcState::InitCallDestroyObjects
    }

    /// Collect new references from the mutator stack, then drain again.
    pub(crate) fn redrain(&mut self) {
        self.collect_from_stack();
        if let Some(mut stack) = self.mark_stack.take() {
            stack.drain();
            self.mark_stack = Some(stack);
        }
    }

    pub(crate) fn collect_from_stack(&mut self) {
        let mut stack = match self.mark_stack.take() {
            Some(s) => s,
            None => return,
        };
        let mut v = self.value_stack.base();
        let top = self.value_stack.top();
        while v < top {
            unsafe {
                if let Some(object) = (*v).as_object() {
                    stack.push(object);
                }
                v = v.add(1);
            }
        }
        self.mark_stack = Some(stack);
    }

    fn init_call_destroy_objects(&mut self) -> GcState {
        // no deletion barrier: rescan the stack before any externally
        // visible finalizer runs, resurrection has to be tolerated
        self.redrain();
        if self.weak_values.slot_capacity() == 0 {
            return GcState::FreeWeakMaps; // no finalizers to deliver
        }
        self.gc.cursor = 0;
        GcState::CallDestroyObjects
    }

    fn call_destroy_objects(&mut self) -> GcState {
        // finalizers run host code, which must not re-enter the collector
        let old = std::mem::replace(&mut self.blocked, Blockness::InCriticalSection);
        let mut finalizer = self.host_finalizer.take();
        let mut next = GcState::CallDestroyObjects;
        for _ in 0..MARK_LOOP_ITERATION_COUNT {
            match self.weak_values.value_at(self.gc.cursor) {
                None => {
                    next = GcState::FreeWeakMaps;
                    break;
                }
                Some(value) => {
                    self.gc.cursor += 1;
                    if let Some(object) = value.as_object() {
                        if !object.is_marked() {
                            if let Some(callback) = finalizer.as_mut() {
                                callback(self, object);
                            }
                        }
                    }
                }
            }
        }
        self.host_finalizer = finalizer;
        self.blocked = old;
        next
    }

    pub(crate) fn free_weak_maps_impl(&mut self) {
        unsafe {
            let mut last: *mut Option<crate::gcref::UntypedGcRef> = &mut self.weak_maps;
            let mut current = self.weak_maps;
            while let Some(r) = current {
                let map = &mut *r.payload().cast::<WeakMapObject>();
                current = map.next_weak_map;
                if !r.is_marked() {
                    continue; // dead maps drop out of the list, sweep frees them
                }
                map.remove_unmarked_keys();
                *last = Some(r);
                last = &mut map.next_weak_map;
            }
            *last = None;
        }
    }

    pub(crate) fn free_weak_sets_impl(&mut self) {
        unsafe {
            let mut last: *mut Option<crate::gcref::UntypedGcRef> = &mut self.weak_sets;
            let mut current = self.weak_sets;
            while let Some(r) = current {
                let set = &mut *r.payload().cast::<WeakSetObject>();
                current = set.next_weak_set;
                if !r.is_marked() {
                    continue;
                }
                set.remove_unmarked_keys();
                *last = Some(r);
                last = &mut set.next_weak_set;
            }
            *last = None;
        }
    }

    fn free_weak_maps_state(&mut self) -> GcState {
        self.free_weak_maps_impl();
        GcState::FreeWeakSets
    }

    fn free_weak_sets_state(&mut self) -> GcState {
        self.free_weak_sets_impl();
        GcState::HandleWeakHostReferences
    }

    /// Weak slots whose referent died read as undefined from here on, and
    /// slot frees deferred by host finalizers get flushed.
    pub(crate) fn cleanup_weak_host_references(&mut self) {
        for flat in 0..self.weak_values.slot_capacity() {
            if let Some(value) = self.weak_values.value_at(flat) {
                if let Some(object) = value.as_object() {
                    if !object.is_marked() {
                        self.weak_values.set_at(flat, Value::undefined());
                    }
                }
            }
        }

        let pending = std::mem::take(&mut self.pending_freed_weak_slots);
        let mut remaining = Vec::with_capacity(pending.len());
        for slot in pending {
            if self.weak_values.get(slot).is_undefined() {
                self.weak_values.free(slot);
            } else {
                remaining.push(slot);
            }
        }
        self.pending_freed_weak_slots = remaining;
    }

    fn handle_weak_host_references(&mut self) -> GcState {
        self.cleanup_weak_host_references();
        GcState::DoSweep
    }

    fn do_sweep(&mut self) -> GcState {
        self.identifier_table.sweep();

        let mut tally = SweepTally::new(self.gc_collector_stats);
        {
            let MemoryManager {
                ref mut chunk_allocator,
                ref mut block_allocator,
                ref mut aux_allocator,
                ref mut huge_allocator,
                ref types,
                ..
            } = *self;
            block_allocator.sweep(chunk_allocator, types, &mut tally);
            huge_allocator.sweep(chunk_allocator, types, &mut tally);
            aux_allocator.sweep(chunk_allocator, types, &mut tally);
        }

        // only black bits are reset: object bits already equal "was black"
        self.block_allocator.reset_black_bits();
        self.huge_allocator.reset_black_bits();
        self.aux_allocator.reset_black_bits();

        self.used_slots_after_last_full_sweep = self.block_allocator.used_slots_after_last_sweep
            + self.aux_allocator.used_slots_after_last_sweep;
        self.unmanaged_heap_size = self
            .unmanaged_heap_size
            .saturating_sub(tally.unmanaged_freed);

        let objects_marked = self
            .mark_stack
            .as_ref()
            .map(|s| s.objects_marked())
            .unwrap_or(0);
        self.mark_stack = None;
        self.blocked = Blockness::Unblocked;

        self.update_unmanaged_heap_size_gc_limit();
        self.statistics.total_gc_cycles += 1;

        if self.gc_stats {
            log::debug!(
                target: "quasar::gc::statistics",
                "[gc #{}] cycle {}: {} marked, freed {} in {} objects, {} chunks, {} huge",
                self.engine_serial,
                self.statistics.total_gc_cycles,
                objects_marked,
                formatted_size(tally.slots_freed * SLOT_SIZE),
                tally.objects_freed,
                tally.chunks_freed,
                formatted_size(tally.bytes_freed_huge),
            );
        }
        if let Some(counts) = tally.freed_by_type {
            let mut sorted: Vec<_> = counts.into_iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
            for (name, count) in sorted {
                log::debug!(
                    target: "quasar::gc::allocator_stats",
                    "[gc #{}] freed type: {} ({} instances)",
                    self.engine_serial,
                    name,
                    count
                );
            }
        }

        GcState::Invalid
    }
}
