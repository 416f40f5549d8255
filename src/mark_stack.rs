use crate::gc_state::Deadline;
use crate::gcref::UntypedGcRef;
use crate::type_info::TypeInfoTable;
use memmap2::MmapMut;
use std::ptr::NonNull;

/// Batch length for deadline checks while marking. Checking the clock on
/// every pop costs more than the pops.
pub const MARK_LOOP_ITERATION_COUNT: usize = 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DrainState {
    Complete,
    Ongoing,
}

/// Pre-allocated worklist for iterative tri-color marking. Pushing an object
/// sets its black bit; only newly marked objects land on the stack, so every
/// object is traced at most once per pass.
///
/// The stack is deliberately bounded: crossing the soft limit makes the mark
/// loops drain eagerly, running past the hard limit is a contract violation
/// by some `mark_objects` implementation and aborts.
pub struct MarkStack {
    base: *mut UntypedGcRef,
    top: *mut UntypedGcRef,
    soft_limit: *mut UntypedGcRef,
    hard_limit: *mut UntypedGcRef,
    types: NonNull<TypeInfoTable>,
    objects_marked: usize,
    _map: MmapMut,
}

impl MarkStack {
    pub fn new(size_bytes: usize, types: &TypeInfoTable) -> Self {
        let mut map = MmapMut::map_anon(size_bytes).expect("mark stack allocation failed");
        let base = map.as_mut_ptr() as *mut UntypedGcRef;
        let len = size_bytes / core::mem::size_of::<UntypedGcRef>();
        unsafe {
            Self {
                base,
                top: base,
                soft_limit: base.add(len * 3 / 4),
                hard_limit: base.add(len),
                types: NonNull::from(types),
                objects_marked: 0,
                _map: map,
            }
        }
    }

    /// Mark `object` and queue it for tracing unless it was already marked.
    #[inline]
    pub fn push(&mut self, object: UntypedGcRef) {
        unsafe {
            if object.item.as_ref().test_and_set_black() {
                return;
            }
            assert!(
                self.top < self.hard_limit,
                "mark stack overflow: mark_objects pushed past the hard limit"
            );
            self.top.write(object);
            self.top = self.top.add(1);
        }
    }

    #[inline]
    fn pop(&mut self) -> UntypedGcRef {
        unsafe {
            self.top = self.top.sub(1);
            self.top.read()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == self.base
    }

    pub fn remaining_before_soft_limit(&self) -> isize {
        unsafe { self.soft_limit.offset_from(self.top) }
    }

    pub fn objects_marked(&self) -> usize {
        self.objects_marked
    }

    pub fn drain(&mut self) {
        // cheaper than drain_with_deadline, no clock involved
        while self.top > self.base {
            let object = self.pop();
            self.objects_marked += 1;
            unsafe {
                let trace = (*self.types.as_ptr()).get(object.type_info_index()).trace;
                trace(object.payload(), self);
            }
        }
    }

    pub fn drain_with_deadline(&mut self, deadline: Deadline) -> DrainState {
        loop {
            for _ in 0..=MARK_LOOP_ITERATION_COUNT * 10 {
                if self.top == self.base {
                    return DrainState::Complete;
                }
                let object = self.pop();
                self.objects_marked += 1;
                unsafe {
                    let trace = (*self.types.as_ptr()).get(object.type_info_index()).trace;
                    trace(object.payload(), self);
                }
            }
            if deadline.has_expired() {
                return DrainState::Ongoing;
            }
        }
    }

    /// Eagerly drain when the batched mark loops have little headroom left
    /// before the soft limit. Returns whether a drain ran, in which case the
    /// caller should re-check its deadline.
    pub(crate) fn drain_if_near_soft_limit(&mut self, deadline: Deadline) -> bool {
        if self.remaining_before_soft_limit() > MARK_LOOP_ITERATION_COUNT as isize {
            return false;
        }
        self.drain_with_deadline(deadline);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, HeapItem, CHUNK_SIZE, HEADER_SLOTS, SLOT_SIZE};
    use crate::header::HeapObjectHeader;
    use crate::type_info::HeapObject;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::ptr::NonNull;

    struct Node {
        next: Option<UntypedGcRef>,
    }
    unsafe impl HeapObject for Node {
        fn mark_objects(&mut self, stack: &mut MarkStack) {
            if let Some(next) = self.next {
                stack.push(next);
            }
        }
    }

    struct TestHeap {
        chunk: *mut Chunk,
        cursor: usize,
    }

    impl TestHeap {
        fn new() -> Self {
            unsafe {
                let layout = Layout::from_size_align(CHUNK_SIZE, CHUNK_SIZE).unwrap();
                Self {
                    chunk: alloc_zeroed(layout) as *mut Chunk,
                    cursor: HEADER_SLOTS,
                }
            }
        }

        fn alloc_node(&mut self, types: &mut TypeInfoTable, next: Option<UntypedGcRef>) -> UntypedGcRef {
            unsafe {
                let item = (*self.chunk).real_base().add(self.cursor);
                self.cursor += (core::mem::size_of::<HeapObjectHeader>()
                    + core::mem::size_of::<Node>()
                    + SLOT_SIZE
                    - 1)
                    / SLOT_SIZE;
                (*item).set_allocated_slots(1);
                let index = types.index_of::<Node>();
                (item as *mut HeapObjectHeader).write(HeapObjectHeader::new(index, false));
                let r = UntypedGcRef::from_item(NonNull::new_unchecked(item));
                r.payload().cast::<Node>().write(Node { next });
                r
            }
        }
    }

    impl Drop for TestHeap {
        fn drop(&mut self) {
            unsafe {
                let layout = Layout::from_size_align(CHUNK_SIZE, CHUNK_SIZE).unwrap();
                dealloc(self.chunk as *mut u8, layout);
            }
        }
    }

    #[test]
    fn drain_traces_chains() {
        let mut types = TypeInfoTable::new();
        let mut heap = TestHeap::new();
        let mut tail = heap.alloc_node(&mut types, None);
        let mut refs = vec![tail];
        for _ in 0..10 {
            tail = heap.alloc_node(&mut types, Some(tail));
            refs.push(tail);
        }

        let mut stack = MarkStack::new(64 * 1024, &types);
        stack.push(tail);
        stack.drain();
        assert!(stack.is_empty());
        assert_eq!(stack.objects_marked(), 11);
        for r in refs {
            assert!(r.is_marked());
        }
    }

    #[test]
    fn push_deduplicates_marked_objects() {
        let mut types = TypeInfoTable::new();
        let mut heap = TestHeap::new();
        let node = heap.alloc_node(&mut types, None);

        let mut stack = MarkStack::new(64 * 1024, &types);
        stack.push(node);
        stack.push(node);
        stack.drain();
        assert_eq!(stack.objects_marked(), 1);
    }

    #[test]
    fn deadline_drain_completes_on_forever() {
        let mut types = TypeInfoTable::new();
        let mut heap = TestHeap::new();
        let mut tail = heap.alloc_node(&mut types, None);
        for _ in 0..100 {
            tail = heap.alloc_node(&mut types, Some(tail));
        }
        let mut stack = MarkStack::new(64 * 1024, &types);
        stack.push(tail);
        assert_eq!(
            stack.drain_with_deadline(Deadline::forever()),
            DrainState::Complete
        );
    }
}
