use crate::chunk::{
    Chunk, HeapItem, AVAILABLE_SLOTS, DATA_SIZE, SLOT_SIZE, SLOT_SIZE_SHIFT,
};
use crate::chunk_allocator::ChunkAllocator;
use crate::statistics::SweepTally;
use crate::type_info::TypeInfoTable;
use std::ptr::{null_mut, NonNull};

/// Bins 1..NUM_BINS-1 hold free runs of exactly that many slots, the last
/// bin holds everything larger.
pub const NUM_BINS: usize = 8;

#[inline]
pub fn bin_for_slots(slots: usize) -> usize {
    slots.min(NUM_BINS - 1)
}

/// Allocator for normal-size objects. Fresh chunks are consumed by bumping
/// through their free span; the free runs discovered by sweep are recycled
/// through size-class bins.
pub struct BlockAllocator {
    next_free: *mut HeapItem,
    n_free: usize,
    free_bins: [*mut HeapItem; NUM_BINS],
    pub(crate) chunks: Vec<*mut Chunk>,
    pub(crate) used_slots_after_last_sweep: usize,
    pub(crate) allocation_stats: Option<Box<[usize; NUM_BINS]>>,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self {
            next_free: null_mut(),
            n_free: 0,
            free_bins: [null_mut(); NUM_BINS],
            chunks: Vec::new(),
            used_slots_after_last_sweep: 0,
            allocation_stats: None,
        }
    }

    pub fn total_slots(&self) -> usize {
        self.chunks.len() * AVAILABLE_SLOTS
    }

    pub fn allocated_mem(&self) -> usize {
        self.chunks.len() * DATA_SIZE
    }

    pub fn used_mem(&self) -> usize {
        let mut used = 0;
        for &c in self.chunks.iter() {
            used += unsafe { (*c).n_used_slots() * SLOT_SIZE };
        }
        used
    }

    /// Slots currently parked in the free bins.
    pub fn free_slots_in_bins(&self) -> usize {
        let mut total = 0;
        for bin in self.free_bins.iter() {
            let mut h = *bin;
            while !h.is_null() {
                unsafe {
                    total += (*h).free.available_slots;
                    h = (*h).free.next;
                }
            }
        }
        total
    }

    pub fn bump_region_slots(&self) -> usize {
        self.n_free
    }

    pub(crate) fn bin_entries(&self, bin: usize) -> usize {
        let mut n = 0;
        let mut h = self.free_bins[bin];
        while !h.is_null() {
            n += 1;
            h = unsafe { (*h).free.next };
        }
        n
    }

    /// Hand out `size` bytes (a slot multiple). Returns `None` when the free
    /// pool is exhausted and `force` is unset; the caller is expected to
    /// trigger a collection and retry with `force` set, which grabs a fresh
    /// chunk instead. Returned memory is not zeroed here.
    pub fn allocate(
        &mut self,
        chunk_allocator: &mut ChunkAllocator,
        size: usize,
        force: bool,
    ) -> Option<NonNull<HeapItem>> {
        debug_assert_eq!(size % SLOT_SIZE, 0);
        let slots_required = size >> SLOT_SIZE_SHIFT;

        if let Some(stats) = self.allocation_stats.as_mut() {
            stats[bin_for_slots(slots_required)] += 1;
        }

        unsafe {
            let m = 'found: loop {
                if slots_required < NUM_BINS - 1 {
                    let m = self.free_bins[slots_required];
                    if !m.is_null() {
                        self.free_bins[slots_required] = (*m).free.next;
                        break 'found m;
                    }
                }

                if self.n_free >= slots_required {
                    let m = self.next_free;
                    debug_assert!(!m.is_null());
                    self.next_free = self.next_free.add(slots_required);
                    self.n_free -= slots_required;
                    break 'found m;
                }

                // search the large bin for a run that is big enough
                let mut last: *mut *mut HeapItem = &mut self.free_bins[NUM_BINS - 1];
                while !(*last).is_null() {
                    let m = *last;
                    if (*m).free.available_slots >= slots_required {
                        *last = (*m).free.next; // take it out of the list

                        let remaining = (*m).free.available_slots - slots_required;
                        if remaining > 0 {
                            let remainder = m.add(slots_required);
                            if remaining > self.n_free {
                                // the remainder beats the current bump
                                // region; park the old one in a bin
                                if self.n_free > 0 {
                                    let bin = bin_for_slots(self.n_free);
                                    (*self.next_free).free.next = self.free_bins[bin];
                                    (*self.next_free).free.available_slots = self.n_free;
                                    self.free_bins[bin] = self.next_free;
                                }
                                self.next_free = remainder;
                                self.n_free = remaining;
                            } else {
                                (*remainder).free.available_slots = remaining;
                                let bin = bin_for_slots(remaining);
                                (*remainder).free.next = self.free_bins[bin];
                                self.free_bins[bin] = remainder;
                            }
                        }
                        break 'found m;
                    }
                    last = &mut (*m).free.next;
                }

                // split a larger discrete bin
                if slots_required < NUM_BINS - 1 {
                    for i in slots_required + 1..NUM_BINS - 1 {
                        let m = self.free_bins[i];
                        if !m.is_null() {
                            self.free_bins[i] = (*m).free.next;
                            let remaining = i - slots_required;
                            debug_assert!(remaining < NUM_BINS - 1);
                            let remainder = m.add(slots_required);
                            (*remainder).free.available_slots = remaining;
                            (*remainder).free.next = self.free_bins[remaining];
                            self.free_bins[remaining] = remainder;
                            break 'found m;
                        }
                    }
                }

                if !force {
                    return None;
                }

                // save the remainder of the current chunk for later, smaller
                // allocations
                if self.n_free > 0 {
                    let bin = bin_for_slots(self.n_free);
                    (*self.next_free).free.next = self.free_bins[bin];
                    (*self.next_free).free.available_slots = self.n_free;
                    self.free_bins[bin] = self.next_free;
                }
                let new_chunk = chunk_allocator.allocate(0);
                self.chunks.push(new_chunk);
                self.next_free = (*new_chunk).first();
                self.n_free = AVAILABLE_SLOTS;
                let m = self.next_free;
                self.next_free = self.next_free.add(slots_required);
                self.n_free -= slots_required;
                break 'found m;
            };

            (*m).set_allocated_slots(slots_required);
            NonNull::new(m)
        }
    }

    /// Free everything without a black bit, rebuild the bins from the
    /// surviving chunks, return empty chunks to the chunk allocator.
    pub fn sweep(
        &mut self,
        chunk_allocator: &mut ChunkAllocator,
        types: &TypeInfoTable,
        tally: &mut SweepTally,
    ) {
        self.next_free = null_mut();
        self.n_free = 0;
        self.free_bins = [null_mut(); NUM_BINS];
        self.used_slots_after_last_sweep = 0;

        let mut survivors = Vec::with_capacity(self.chunks.len());
        let mut empty = Vec::new();
        for &c in self.chunks.iter() {
            if unsafe { (*c).sweep(types, tally) } {
                survivors.push(c);
            } else {
                empty.push(c);
            }
        }

        for &c in survivors.iter() {
            unsafe {
                (*c).sort_into_bins(&mut self.free_bins);
                self.used_slots_after_last_sweep += (*c).n_used_slots();
            }
        }

        // only release empty chunks after every destroy hook has run, so
        // hooks never observe freed memory
        for c in empty {
            tally.chunks_freed += 1;
            chunk_allocator.free(c, 0);
        }
        self.chunks = survivors;
    }

    /// Teardown: destroy all live objects and release every chunk.
    pub fn free_all(
        &mut self,
        chunk_allocator: &mut ChunkAllocator,
        types: &TypeInfoTable,
        tally: &mut SweepTally,
    ) {
        for &c in self.chunks.iter() {
            unsafe { (*c).free_all(types, tally) };
        }
        for &c in self.chunks.iter() {
            chunk_allocator.free(c, 0);
        }
        self.chunks.clear();
        self.next_free = null_mut();
        self.n_free = 0;
        self.free_bins = [null_mut(); NUM_BINS];
    }

    pub fn reset_black_bits(&mut self) {
        for &c in self.chunks.iter() {
            unsafe { (*c).reset_black_bits() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::SweepTally;

    #[test]
    fn exact_bin_and_bump() {
        let mut chunks = ChunkAllocator::new();
        let mut alloc = BlockAllocator::new();

        // first allocation has to force a chunk in
        assert!(alloc.allocate(&mut chunks, SLOT_SIZE, false).is_none());
        let a = alloc.allocate(&mut chunks, SLOT_SIZE, true).expect("chunk");
        let b = alloc.allocate(&mut chunks, 2 * SLOT_SIZE, true).expect("bump");
        // bump allocation is contiguous
        assert_eq!(
            b.as_ptr() as usize,
            a.as_ptr() as usize + SLOT_SIZE
        );
        assert_eq!(alloc.bump_region_slots(), AVAILABLE_SLOTS - 3);
        assert_eq!(alloc.total_slots(), AVAILABLE_SLOTS);
    }

    #[test]
    fn conservation_through_allocation() {
        let mut chunks = ChunkAllocator::new();
        let mut alloc = BlockAllocator::new();
        let mut used = 0;
        for i in 1..6 {
            let size = i * SLOT_SIZE;
            alloc.allocate(&mut chunks, size, true).expect("alloc");
            used += i;
            assert_eq!(
                alloc.total_slots(),
                used + alloc.free_slots_in_bins() + alloc.bump_region_slots()
            );
        }
    }

    #[test]
    fn sweep_rebuilds_bins_and_releases_empty_chunks() {
        let mut chunks = ChunkAllocator::new();
        let mut types = TypeInfoTable::new();
        let mut alloc = BlockAllocator::new();

        for _ in 0..10 {
            alloc.allocate(&mut chunks, 2 * SLOT_SIZE, true).expect("alloc");
        }
        assert_eq!(alloc.chunks.len(), 1);

        // nothing marked: the chunk empties out and goes back
        let mut tally = SweepTally::new(false);
        alloc.sweep(&mut chunks, &mut types, &mut tally);
        assert_eq!(alloc.chunks.len(), 0);
        assert_eq!(tally.chunks_freed, 1);
        assert_eq!(tally.slots_freed, 20);
    }

    #[test]
    fn large_bin_split_prefers_bump_region_swap() {
        let mut chunks = ChunkAllocator::new();
        let mut alloc = BlockAllocator::new();

        // exhaust the bump region down to nothing
        let big = (AVAILABLE_SLOTS - 1) * SLOT_SIZE;
        alloc.allocate(&mut chunks, big, true).expect("alloc");
        assert_eq!(alloc.bump_region_slots(), 1);

        // a 3-slot request cannot be bumped, gets a fresh chunk when forced
        assert!(alloc.allocate(&mut chunks, 3 * SLOT_SIZE, false).is_none());
        alloc.allocate(&mut chunks, 3 * SLOT_SIZE, true).expect("alloc");
        assert_eq!(alloc.chunks.len(), 2);
        // the single leftover slot of the first chunk was parked in bin 1
        assert_eq!(alloc.bin_entries(1), 1);
    }
}
