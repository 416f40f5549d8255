use crate::chunk::{Chunk, HeapItem, HEADER_SIZE};
use crate::chunk_allocator::{ChunkAllocator, MemorySegment, SEGMENT_SIZE};
use crate::mmap;
use crate::statistics::SweepTally;
use crate::type_info::TypeInfoTable;
use std::ptr::NonNull;

struct HugeChunk {
    /// Present when the allocation got its own dedicated segment.
    segment: Option<Box<MemorySegment>>,
    chunk: *mut Chunk,
    size: usize,
}

/// Allocator for objects too large for the slot scheme. Every allocation is
/// tracked individually; dead entries are released immediately during sweep,
/// nothing is pooled.
pub struct HugeItemAllocator {
    chunks: Vec<HugeChunk>,
}

impl HugeItemAllocator {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub fn used_mem(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }

    pub fn item_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn allocate(
        &mut self,
        chunk_allocator: &mut ChunkAllocator,
        size: usize,
    ) -> NonNull<HeapItem> {
        let (segment, chunk, size) = if size >= SEGMENT_SIZE / 2 {
            // too large to share the chunk pool, reserve a dedicated segment
            let size = size + HEADER_SIZE;
            let page_size = mmap::page_size();
            let size = (size + page_size - 1) & !(page_size - 1);
            let mut segment = Box::new(MemorySegment::new(size));
            match segment.allocate(size) {
                Some(c) => (Some(segment), c, size),
                None => panic!("dedicated segment refused {} bytes", size),
            }
        } else {
            (None, chunk_allocator.allocate(size), size)
        };

        unsafe {
            let first = (*chunk).first();
            let index = (*first).slot_index();
            Chunk::set_bit(&mut (*chunk).object_bitmap, index);
            self.chunks.push(HugeChunk {
                segment,
                chunk,
                size,
            });
            NonNull::new_unchecked(first)
        }
    }

    fn free_huge_chunk(
        chunk_allocator: &mut ChunkAllocator,
        c: HugeChunk,
        types: &TypeInfoTable,
        tally: &mut SweepTally,
        class_counts: bool,
    ) {
        unsafe {
            let item = &mut *(*c.chunk).first();
            let info = types.get(item.header.type_info_index());
            if let Some(destroy) = info.destroy {
                tally.unmanaged_freed += destroy(item.payload());
            }
            tally.objects_freed += 1;
            tally.bytes_freed_huge += c.size;
            if class_counts {
                if let Some(counts) = tally.freed_by_type.as_mut() {
                    *counts.entry(info.name).or_insert(0) += 1;
                }
            }
        }
        match c.segment {
            Some(mut segment) => {
                let page_size = mmap::page_size();
                segment.free(c.chunk, c.size, page_size);
                // segment reservation released on drop
            }
            None => chunk_allocator.free(c.chunk, c.size),
        }
    }

    /// One black-bit test per entry; unmarked entries are destroyed and their
    /// backing released on the spot.
    pub fn sweep(
        &mut self,
        chunk_allocator: &mut ChunkAllocator,
        types: &TypeInfoTable,
        tally: &mut SweepTally,
    ) {
        let mut i = 0;
        while i < self.chunks.len() {
            let c = self.chunks[i].chunk;
            let black = unsafe {
                let first = &*(*c).first();
                let black = first.is_black();
                first.clear_black();
                black
            };
            if black {
                i += 1;
            } else {
                let dead = self.chunks.swap_remove(i);
                Self::free_huge_chunk(chunk_allocator, dead, types, tally, true);
            }
        }
    }

    pub fn reset_black_bits(&mut self) {
        for c in self.chunks.iter() {
            unsafe {
                let first = &*(*c.chunk).first();
                first.clear_black();
            }
        }
    }

    pub fn free_all(
        &mut self,
        chunk_allocator: &mut ChunkAllocator,
        types: &TypeInfoTable,
        tally: &mut SweepTally,
    ) {
        for c in self.chunks.drain(..) {
            Self::free_huge_chunk(chunk_allocator, c, types, tally, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DATA_SIZE;
    use crate::gcref::UntypedGcRef;

    #[test]
    fn oversized_allocations_get_object_bit() {
        let mut chunk_allocator = ChunkAllocator::new();
        let mut huge = HugeItemAllocator::new();
        let item = huge.allocate(&mut chunk_allocator, DATA_SIZE + 1);
        let r = UntypedGcRef::from_item(item);
        assert!(!r.is_marked());
        assert_eq!(huge.item_count(), 1);
        assert!(huge.used_mem() >= DATA_SIZE + 1);

        let mut types = TypeInfoTable::new();
        let mut tally = SweepTally::new(false);
        huge.sweep(&mut chunk_allocator, &mut types, &mut tally);
        assert_eq!(huge.item_count(), 0);
        assert_eq!(tally.objects_freed, 1);
    }

    #[test]
    fn marked_entries_survive_sweep() {
        let mut chunk_allocator = ChunkAllocator::new();
        let mut huge = HugeItemAllocator::new();
        let mut types = TypeInfoTable::new();

        let item = huge.allocate(&mut chunk_allocator, DATA_SIZE + 1);
        unsafe {
            item.as_ref().test_and_set_black();
        }
        let mut tally = SweepTally::new(false);
        huge.sweep(&mut chunk_allocator, &mut types, &mut tally);
        assert_eq!(huge.item_count(), 1);
        // black bits were consumed by the sweep
        let r = UntypedGcRef::from_item(item);
        assert!(!r.is_marked());

        huge.sweep(&mut chunk_allocator, &mut types, &mut tally);
        assert_eq!(huge.item_count(), 0);
    }

    #[test]
    fn half_segment_requests_get_dedicated_segments() {
        let mut chunk_allocator = ChunkAllocator::new();
        let mut huge = HugeItemAllocator::new();
        let mut types = TypeInfoTable::new();

        let item = huge.allocate(&mut chunk_allocator, SEGMENT_SIZE / 2 + 4096);
        // the shared pool saw nothing
        assert_eq!(chunk_allocator.reserved_bytes(), 0);
        unsafe {
            // the whole payload is writable
            let p = item.as_ref().payload();
            core::ptr::write_bytes(p, 0xab, SEGMENT_SIZE / 2);
        }
        let mut tally = SweepTally::new(false);
        huge.free_all(&mut chunk_allocator, &mut types, &mut tally);
        assert_eq!(huge.item_count(), 0);
    }
}
