use crate::block_allocator::{BlockAllocator, NUM_BINS};
use crate::chunk::{HeapItem, AVAILABLE_SLOTS, DATA_SIZE, SLOT_SIZE, SLOT_SIZE_SHIFT};
use crate::chunk_allocator::ChunkAllocator;
use crate::gc_state::{GcState, GcStateMachine};
use crate::gcref::{GcRef, UntypedGcRef};
use crate::header::HeapObjectHeader;
use crate::huge_allocator::HugeItemAllocator;
use crate::identifier_table::{HeapString, IdentifierTable};
use crate::mark_stack::MarkStack;
use crate::persistent::{PersistentSlot, PersistentValueStorage};
use crate::statistics::{formatted_size, Statistics, SweepTally};
use crate::type_info::{HeapObject, TypeInfoTable};
use crate::value::{Value, ValueStack};
use crate::weak_collections::{WeakMapObject, WeakSetObject};
use crate::{align_usize, Config, Platform};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

/// Trigger a collection once this many managed slots exist and utilization
/// drops below the overallocation bound.
const MIN_SLOTS_GC_LIMIT: usize = AVAILABLE_SLOTS * 16;
/// Max overallocation by the collector in percent.
const GC_OVERALLOCATION: usize = 200;
const MIN_UNMANAGED_HEAP_SIZE_GC_LIMIT: usize = 128 * 1024;

/// Collection gate. `NormalBlocked` means a cycle is in flight (and further
/// triggers coalesce into it); `InCriticalSection` means the caller forbade
/// any collector activity until further notice.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Blockness {
    Unblocked,
    NormalBlocked,
    InCriticalSection,
}

/// The engine's memory manager: allocation facade over the block, auxiliary
/// and huge-item allocators, owner of the root tables, and driver of the
/// incremental collection state machine.
///
/// Single threaded by construction. A collection cycle interleaves with
/// mutator execution in time slices, never in parallel with it.
pub struct MemoryManager {
    pub(crate) engine_serial: u64,
    pub(crate) config: Config,
    _platform: Arc<Platform>,

    pub(crate) types: Box<TypeInfoTable>,
    pub(crate) chunk_allocator: ChunkAllocator,
    pub(crate) block_allocator: BlockAllocator,
    /// Engine metadata allocations (shapes, internal classes) get their own
    /// block allocator so they do not fragment the object chunks.
    pub(crate) aux_allocator: BlockAllocator,
    pub(crate) huge_allocator: HugeItemAllocator,

    pub(crate) value_stack: ValueStack,
    pub(crate) persistent_values: PersistentValueStorage,
    pub(crate) weak_values: PersistentValueStorage,
    pub(crate) identifier_table: IdentifierTable,

    pub(crate) constraints: Vec<Box<dyn FnMut(&mut MarkStack)>>,
    pub(crate) keep_alive_policy: Option<Box<dyn FnMut(UntypedGcRef) -> bool>>,
    pub(crate) host_finalizer: Option<Box<dyn FnMut(&mut MemoryManager, UntypedGcRef)>>,
    pub(crate) pending_freed_weak_slots: Vec<PersistentSlot>,

    pub(crate) weak_maps: Option<UntypedGcRef>,
    pub(crate) weak_sets: Option<UntypedGcRef>,

    pub(crate) mark_stack: Option<Box<MarkStack>>,
    pub(crate) gc: GcStateMachine,
    pub(crate) blocked: Blockness,
    pub(crate) gc_requested_while_blocked: bool,

    pub(crate) unmanaged_heap_size: usize,
    pub(crate) unmanaged_heap_size_gc_limit: usize,
    pub(crate) used_slots_after_last_full_sweep: usize,

    pub(crate) aggressive_gc: bool,
    pub(crate) gc_stats: bool,
    pub(crate) gc_collector_stats: bool,
    pub(crate) statistics: Statistics,
}

impl MemoryManager {
    pub fn new(platform: Arc<Platform>, config: Config) -> Self {
        let gc_stats =
            log::log_enabled!(target: "quasar::gc::statistics", log::Level::Debug);
        let gc_collector_stats =
            log::log_enabled!(target: "quasar::gc::allocator_stats", log::Level::Debug);

        let mut block_allocator = BlockAllocator::new();
        if gc_stats {
            block_allocator.allocation_stats = Some(Box::new([0; NUM_BINS]));
        }

        let engine_serial = platform.next_serial();
        Self {
            engine_serial,
            types: Box::new(TypeInfoTable::new()),
            chunk_allocator: ChunkAllocator::new(),
            block_allocator,
            aux_allocator: BlockAllocator::new(),
            huge_allocator: HugeItemAllocator::new(),
            value_stack: ValueStack::new(config.value_stack_size),
            persistent_values: PersistentValueStorage::new(),
            weak_values: PersistentValueStorage::new(),
            identifier_table: IdentifierTable::new(),
            constraints: Vec::new(),
            keep_alive_policy: None,
            host_finalizer: None,
            pending_freed_weak_slots: Vec::new(),
            weak_maps: None,
            weak_sets: None,
            mark_stack: None,
            gc: GcStateMachine::new(config.time_limit),
            blocked: Blockness::Unblocked,
            gc_requested_while_blocked: false,
            unmanaged_heap_size: 0,
            unmanaged_heap_size_gc_limit: MIN_UNMANAGED_HEAP_SIZE_GC_LIMIT,
            used_slots_after_last_full_sweep: 0,
            aggressive_gc: config.aggressive_gc,
            gc_stats,
            gc_collector_stats,
            statistics: Statistics::new(),
            config,
            _platform: platform,
        }
    }

    // ---- allocation -----------------------------------------------------

    /// Allocate a managed `T`. Any managed references already stored in
    /// `value` must be reachable from a root for the duration of this call,
    /// since the allocation itself may trigger a collection.
    pub fn allocate<T: HeapObject>(&mut self, value: T) -> GcRef<T> {
        self.allocate_with_extra_slots(value, 0)
    }

    /// Allocate a `T` followed by `extra_slots` zeroed slots in the same
    /// contiguous allocation, for objects with inline trailing storage.
    pub fn allocate_with_extra_slots<T: HeapObject>(
        &mut self,
        value: T,
        extra_slots: usize,
    ) -> GcRef<T> {
        let size = align_usize(size_of::<HeapObjectHeader>() + size_of::<T>(), SLOT_SIZE)
            + extra_slots * SLOT_SIZE;
        self.unmanaged_heap_size += value.unmanaged_size();
        let huge = size > DATA_SIZE;
        let item = self.allocate_raw(size, false);
        unsafe {
            let index = self.types.index_of::<T>();
            (item.as_ptr() as *mut HeapObjectHeader).write(HeapObjectHeader::new(index, huge));
            (*item.as_ptr()).payload().cast::<T>().write(value);
            GcRef {
                raw: UntypedGcRef::from_item(item),
                marker: PhantomData,
            }
        }
    }

    /// Allocation variant for engine metadata; lives in its own chunk set
    /// but follows the same lifecycle.
    pub fn allocate_aux<T: HeapObject>(&mut self, value: T) -> GcRef<T> {
        let size = align_usize(size_of::<HeapObjectHeader>() + size_of::<T>(), SLOT_SIZE);
        self.unmanaged_heap_size += value.unmanaged_size();
        let huge = size > DATA_SIZE;
        let item = self.allocate_raw(size, true);
        unsafe {
            let index = self.types.index_of::<T>();
            (item.as_ptr() as *mut HeapObjectHeader).write(HeapObjectHeader::new(index, huge));
            (*item.as_ptr()).payload().cast::<T>().write(value);
            GcRef {
                raw: UntypedGcRef::from_item(item),
                marker: PhantomData,
            }
        }
    }

    pub fn allocate_string(&mut self, s: String) -> GcRef<HeapString> {
        self.allocate(HeapString::new(s))
    }

    /// Intern `s`: returns the existing identifier if one is alive, a fresh
    /// allocation otherwise.
    pub fn intern(&mut self, s: &str) -> GcRef<HeapString> {
        if let Some(existing) = self.identifier_table.lookup(s) {
            return existing;
        }
        let string = self.allocate(HeapString::new(s.to_string()));
        self.identifier_table.insert(string);
        string
    }

    fn allocate_raw(&mut self, size: usize, aux: bool) -> NonNull<HeapItem> {
        let mut did_gc_run = false;
        if self.aggressive_gc {
            self.run_full_gc();
            did_gc_run = true;
        }

        if self.unmanaged_heap_size > self.unmanaged_heap_size_gc_limit {
            if !did_gc_run {
                if self.gc.in_progress() {
                    self.try_force_gc_completion();
                } else {
                    self.run_full_gc();
                }
            }
            did_gc_run = true;
        }

        if size > DATA_SIZE {
            let MemoryManager {
                ref mut chunk_allocator,
                ref mut huge_allocator,
                ..
            } = *self;
            return huge_allocator.allocate(chunk_allocator, size);
        }

        if let Some(m) = self.block_allocate(size, aux, false) {
            unsafe { core::ptr::write_bytes(m.as_ptr() as *mut u8, 0, size) };
            return m;
        }

        // the designed backpressure path: soft failure, collect, retry hard
        if !did_gc_run && self.should_run_gc() {
            self.run_gc();
        }
        match self.block_allocate(size, aux, true) {
            Some(m) => {
                unsafe { core::ptr::write_bytes(m.as_ptr() as *mut u8, 0, size) };
                m
            }
            None => panic!("heap exhausted: forced allocation of {} bytes failed", size),
        }
    }

    fn block_allocate(&mut self, size: usize, aux: bool, force: bool) -> Option<NonNull<HeapItem>> {
        let MemoryManager {
            ref mut chunk_allocator,
            ref mut block_allocator,
            ref mut aux_allocator,
            ..
        } = *self;
        let allocator = if aux { aux_allocator } else { block_allocator };
        allocator.allocate(chunk_allocator, size, force)
    }

    // ---- collection triggering ------------------------------------------

    pub(crate) fn should_run_gc(&self) -> bool {
        let total = self.block_allocator.total_slots() + self.aux_allocator.total_slots();
        total > MIN_SLOTS_GC_LIMIT
            && self.used_slots_after_last_full_sweep * GC_OVERALLOCATION < total * 100
    }

    pub fn gc_in_progress(&self) -> bool {
        self.gc.in_progress()
    }

    /// One incremental slice. Call from the host event loop while
    /// [`gc_in_progress`](Self::gc_in_progress) reports an unfinished cycle.
    pub fn gc_step(&mut self) {
        if self.blocked == Blockness::InCriticalSection {
            return;
        }
        if self.gc.in_progress() {
            self.gc_transition();
        }
    }

    /// Start a collection cycle. A no-op while one is already in flight; a
    /// deferred request while in a critical section.
    pub fn run_gc(&mut self) {
        match self.blocked {
            Blockness::InCriticalSection => {
                self.gc_requested_while_blocked = true;
                return;
            }
            Blockness::NormalBlocked => return, // request coalesced
            Blockness::Unblocked => {}
        }
        self.blocked = Blockness::NormalBlocked;

        if self.gc_stats {
            self.statistics.max_reserved_mem =
                self.statistics.max_reserved_mem.max(self.allocated_mem());
            self.statistics.max_allocated_mem = self
                .statistics
                .max_allocated_mem
                .max(self.used_mem() + self.large_items_mem());
        }
        if self.gc_collector_stats {
            log::debug!(
                target: "quasar::gc::allocator_stats",
                "[gc #{}] ========== GC ==========",
                self.engine_serial
            );
            log::debug!(
                target: "quasar::gc::allocator_stats",
                "[gc #{}] allocated {} in {} chunks, fragmented {}",
                self.engine_serial,
                formatted_size(self.allocated_mem()),
                self.block_allocator.chunks.len() + self.aux_allocator.chunks.len(),
                formatted_size(self.allocated_mem().saturating_sub(self.used_mem())),
            );
            Self::dump_bins(&self.block_allocator, self.engine_serial, "block");
            Self::dump_bins(&self.aux_allocator, self.engine_serial, "aux");
        }

        self.gc.state = GcState::MarkStart;
        self.gc_transition();

        if self.gc_stats {
            self.statistics.max_used_mem = self
                .statistics
                .max_used_mem
                .max(self.used_mem() + self.large_items_mem());
        }
    }

    /// Start a cycle and drive it to completion synchronously.
    pub fn run_full_gc(&mut self) {
        self.run_gc();
        if self.gc.in_progress() {
            self.try_force_gc_completion();
        }
    }

    /// Finish the in-flight incremental cycle without further yielding.
    /// Fails (and records a deferred request) inside a critical section;
    /// the caller retries after leaving it.
    pub fn try_force_gc_completion(&mut self) -> bool {
        if self.blocked == Blockness::InCriticalSection {
            self.gc_requested_while_blocked = true;
            return false;
        }
        debug_assert!(self.gc.in_progress(), "no incremental cycle to complete");
        let old_limit = std::mem::replace(&mut self.gc.time_limit, Duration::from_millis(0));
        while self.gc.in_progress() {
            self.gc_transition();
        }
        self.gc.time_limit = old_limit;
        true
    }

    /// Run `f` with all collector activity forbidden. Collection requests
    /// arriving in between are deferred and honored immediately on exit.
    /// Critical sections do not nest.
    pub fn with_critical_section<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        assert!(
            self.blocked != Blockness::InCriticalSection,
            "critical sections do not nest"
        );
        let old = std::mem::replace(&mut self.blocked, Blockness::InCriticalSection);
        let result = f(self);
        self.blocked = old;
        if std::mem::take(&mut self.gc_requested_while_blocked) {
            if self.gc.in_progress() {
                self.try_force_gc_completion();
            } else {
                self.run_gc();
            }
        }
        result
    }

    // ---- roots and weak structures --------------------------------------

    /// Register a root set provider, executed at the start of every cycle.
    pub fn add_constraint(&mut self, constraint: impl FnMut(&mut MarkStack) + 'static) {
        self.constraints.push(Box::new(constraint));
    }

    /// Host policy applied to weak-table entries before marking: returning
    /// true keeps the referent alive even though nothing internal marks it.
    pub fn set_keep_alive_policy(
        &mut self,
        policy: impl FnMut(UntypedGcRef) -> bool + 'static,
    ) {
        self.keep_alive_policy = Some(Box::new(policy));
    }

    /// Callback delivered once per cycle for every unmarked weak-table
    /// referent, before sweep frees it. Runs inside a critical section.
    pub fn set_host_finalizer(
        &mut self,
        finalizer: impl FnMut(&mut MemoryManager, UntypedGcRef) + 'static,
    ) {
        self.host_finalizer = Some(Box::new(finalizer));
    }

    pub fn register_weak_map(&mut self, map: GcRef<WeakMapObject>) {
        unsafe {
            (*map.as_ptr()).next_weak_map = self.weak_maps;
        }
        self.weak_maps = Some(map.untyped());
    }

    pub fn register_weak_set(&mut self, set: GcRef<WeakSetObject>) {
        unsafe {
            (*set.as_ptr()).next_weak_set = self.weak_sets;
        }
        self.weak_sets = Some(set.untyped());
    }

    pub fn create_persistent(&mut self, value: Value) -> PersistentSlot {
        self.persistent_values.allocate(value)
    }

    pub fn release_persistent(&mut self, slot: PersistentSlot) {
        self.persistent_values.free(slot);
    }

    pub fn persistent_value(&self, slot: PersistentSlot) -> Value {
        self.persistent_values.get(slot)
    }

    pub fn set_persistent_value(&mut self, slot: PersistentSlot, value: Value) {
        self.persistent_values.set(slot, value);
    }

    /// Weak handle: observes an object without keeping it alive. Reads as
    /// undefined once the referent is collected.
    pub fn create_weak(&mut self, value: Value) -> PersistentSlot {
        self.weak_values.allocate(value)
    }

    pub fn release_weak(&mut self, slot: PersistentSlot) {
        self.weak_values.free(slot);
    }

    pub fn weak_value(&self, slot: PersistentSlot) -> Value {
        self.weak_values.get(slot)
    }

    /// For host finalizers: park a weak slot for freeing once its value has
    /// settled to undefined, handled at the end of the cycle.
    pub fn defer_free_weak_slot(&mut self, slot: PersistentSlot) {
        self.pending_freed_weak_slots.push(slot);
    }

    pub fn value_stack(&self) -> &ValueStack {
        &self.value_stack
    }

    pub fn value_stack_mut(&mut self) -> &mut ValueStack {
        &mut self.value_stack
    }

    // ---- accounting ------------------------------------------------------

    pub fn used_mem(&self) -> usize {
        self.block_allocator.used_mem() + self.aux_allocator.used_mem()
    }

    pub fn allocated_mem(&self) -> usize {
        self.block_allocator.allocated_mem()
            + self.aux_allocator.allocated_mem()
            + self.huge_allocator.used_mem()
    }

    pub fn large_items_mem(&self) -> usize {
        self.huge_allocator.used_mem()
    }

    pub fn unmanaged_heap_size(&self) -> usize {
        self.unmanaged_heap_size
    }

    pub fn unmanaged_heap_size_gc_limit(&self) -> usize {
        self.unmanaged_heap_size_gc_limit
    }

    pub(crate) fn update_unmanaged_heap_size_gc_limit(&mut self) {
        if 3 * self.unmanaged_heap_size_gc_limit <= 4 * self.unmanaged_heap_size {
            // more than 75% full, raise the limit
            self.unmanaged_heap_size_gc_limit =
                self.unmanaged_heap_size_gc_limit.max(self.unmanaged_heap_size) * 2;
        } else if self.unmanaged_heap_size * 4 <= self.unmanaged_heap_size_gc_limit {
            // less than 25% full, lower it again
            self.unmanaged_heap_size_gc_limit = MIN_UNMANAGED_HEAP_SIZE_GC_LIMIT
                .max(self.unmanaged_heap_size_gc_limit / 2);
        }

        if self.aggressive_gc {
            // nothing may go missing between used slots and the free pools
            debug_assert_eq!(
                self.block_allocator.total_slots(),
                self.block_allocator.used_mem() / SLOT_SIZE
                    + self.block_allocator.free_slots_in_bins()
                    + self.block_allocator.bump_region_slots()
            );
            debug_assert_eq!(
                self.aux_allocator.total_slots(),
                self.aux_allocator.used_mem() / SLOT_SIZE
                    + self.aux_allocator.free_slots_in_bins()
                    + self.aux_allocator.bump_region_slots()
            );
        }
    }

    fn dump_bins(allocator: &BlockAllocator, serial: u64, title: &str) {
        log::debug!(
            target: "quasar::gc::allocator_stats",
            "[gc #{}] bin map for {} allocator ({} in bins):",
            serial,
            title,
            formatted_size(allocator.free_slots_in_bins() * SLOT_SIZE)
        );
        for i in 0..NUM_BINS {
            log::debug!(
                target: "quasar::gc::allocator_stats",
                "[gc #{}]     bin {}: {} entries",
                serial,
                i,
                allocator.bin_entries(i)
            );
        }
    }

    pub fn dump_stats(&self) {
        if !self.gc_stats {
            return;
        }
        let serial = self.engine_serial;
        log::debug!(target: "quasar::gc::statistics", "[gc #{}] memory allocation statistics:", serial);
        log::debug!(
            target: "quasar::gc::statistics",
            "[gc #{}]   gc cycles: {}",
            serial,
            self.statistics.total_gc_cycles
        );
        log::debug!(
            target: "quasar::gc::statistics",
            "[gc #{}]   max memory allocated: {}",
            serial,
            formatted_size(self.statistics.max_reserved_mem)
        );
        log::debug!(
            target: "quasar::gc::statistics",
            "[gc #{}]   max memory used before a gc run: {}",
            serial,
            formatted_size(self.statistics.max_allocated_mem)
        );
        log::debug!(
            target: "quasar::gc::statistics",
            "[gc #{}]   max memory used after a gc run: {}",
            serial,
            formatted_size(self.statistics.max_used_mem)
        );
        if let Some(stats) = self.block_allocator.allocation_stats.as_ref() {
            log::debug!(
                target: "quasar::gc::statistics",
                "[gc #{}]   requests for different item sizes:",
                serial
            );
            for i in 1..NUM_BINS - 1 {
                log::debug!(
                    target: "quasar::gc::statistics",
                    "[gc #{}]     <  {} bytes: {}",
                    serial,
                    i << SLOT_SIZE_SHIFT,
                    stats[i]
                );
            }
            log::debug!(
                target: "quasar::gc::statistics",
                "[gc #{}]     >= {} bytes: {}",
                serial,
                (NUM_BINS - 1) << SLOT_SIZE_SHIFT,
                stats[NUM_BINS - 1]
            );
        }
    }

    // ---- synchronous sweep (teardown path) -------------------------------

    /// Non-incremental sweep over the current mark state. Used by teardown;
    /// the incremental path goes through the state machine instead.
    pub(crate) fn sweep_now(&mut self, last_sweep: bool) {
        // deliver finalizers for dead weak referents first, they may still
        // touch other heap objects
        let mut finalizer = self.host_finalizer.take();
        if let Some(callback) = finalizer.as_mut() {
            for flat in 0..self.weak_values.slot_capacity() {
                if let Some(value) = self.weak_values.value_at(flat) {
                    if let Some(object) = value.as_object() {
                        if !object.is_marked() {
                            let old =
                                std::mem::replace(&mut self.blocked, Blockness::InCriticalSection);
                            callback(self, object);
                            self.blocked = old;
                        }
                    }
                }
            }
        }
        self.host_finalizer = finalizer;

        self.free_weak_maps_impl();
        self.free_weak_sets_impl();
        self.cleanup_weak_host_references();

        if !last_sweep {
            self.identifier_table.sweep();
            let mut tally = SweepTally::new(false);
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
            self.unmanaged_heap_size = self
                .unmanaged_heap_size
                .saturating_sub(tally.unmanaged_freed);
        }

        self.block_allocator.reset_black_bits();
        self.huge_allocator.reset_black_bits();
        self.aux_allocator.reset_black_bits();

        self.used_slots_after_last_full_sweep = self.block_allocator.used_slots_after_last_sweep
            + self.aux_allocator.used_slots_after_last_sweep;
        self.update_unmanaged_heap_size_gc_limit();
        self.blocked = Blockness::Unblocked;
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.dump_stats();

        // abort any in-flight incremental cycle, then run one last
        // non-incremental sweep so host finalizers still fire
        if self.gc.in_progress() || self.mark_stack.is_some() {
            self.mark_stack = None;
            self.gc.state = GcState::Invalid;
            self.block_allocator.reset_black_bits();
            self.huge_allocator.reset_black_bits();
            self.aux_allocator.reset_black_bits();
        }
        self.sweep_now(true);

        let mut tally = SweepTally::new(false);
        let MemoryManager {
            ref mut chunk_allocator,
            ref mut block_allocator,
            ref mut aux_allocator,
            ref mut huge_allocator,
            ref types,
            ..
        } = *self;
        block_allocator.free_all(chunk_allocator, types, &mut tally);
        huge_allocator.free_all(chunk_allocator, types, &mut tally);
        aux_allocator.free_all(chunk_allocator, types, &mut tally);
    }
}
