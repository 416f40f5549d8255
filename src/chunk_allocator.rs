use crate::chunk::{Chunk, CHUNK_SIZE, HEADER_SIZE};
use crate::mmap::{self, Mmap};
use std::mem::size_of;

pub const NUM_CHUNKS: usize = 8 * size_of::<u64>();
pub const SEGMENT_SIZE: usize = NUM_CHUNKS * CHUNK_SIZE;

/// A reserved address range carved into up to [`NUM_CHUNKS`] chunk-aligned
/// chunks. The segment is the unit of OS reservation, the chunk the unit of
/// commit; per-chunk occupancy lives in a single bitmap word.
pub struct MemorySegment {
    mmap: Mmap,
    base: *mut Chunk,
    allocated_map: u64,
    available_bytes: usize,
    n_chunks: usize,
}

impl MemorySegment {
    pub fn new(size: usize) -> Self {
        let mut size = size + CHUNK_SIZE; // headroom for chunk alignment
        if size < SEGMENT_SIZE {
            size = SEGMENT_SIZE;
        }
        let map = Mmap::reserve(size);
        let base =
            ((map.start() as usize + CHUNK_SIZE - 1) & !(CHUNK_SIZE - 1)) as *mut Chunk;
        let available_bytes = size - (base as usize - map.start() as usize);
        let mut n_chunks = NUM_CHUNKS;
        if available_bytes < SEGMENT_SIZE {
            n_chunks -= 1;
        }
        Self {
            mmap: map,
            base,
            allocated_map: 0,
            available_bytes,
            n_chunks,
        }
    }

    fn set_bit(&mut self, index: usize) {
        debug_assert!(index < self.n_chunks);
        self.allocated_map |= 1u64 << index;
    }
    fn clear_bit(&mut self, index: usize) {
        debug_assert!(index < self.n_chunks);
        self.allocated_map &= !(1u64 << index);
    }
    fn test_bit(&self, index: usize) -> bool {
        debug_assert!(index < self.n_chunks);
        self.allocated_map & (1u64 << index) != 0
    }

    pub fn has_free_chunks(&self) -> bool {
        self.allocated_map != u64::MAX
    }

    pub fn contains(&self, c: *mut Chunk) -> bool {
        c >= self.base && (c as usize) < self.base as usize + self.n_chunks * CHUNK_SIZE
    }

    pub fn allocate(&mut self, size: usize) -> Option<*mut Chunk> {
        if self.allocated_map == 0 && size >= SEGMENT_SIZE {
            // the whole segment backs one huge allocation
            debug_assert!(self.available_bytes >= size);
            self.mmap.commit(self.base as *mut u8, size);
            self.allocated_map = !0;
            return Some(self.base);
        }
        let required_chunks = (size + CHUNK_SIZE - 1) / CHUNK_SIZE;
        let mut sequence = 0;
        let mut candidate = 0;
        for i in 0..self.n_chunks {
            if !self.test_bit(i) {
                if sequence == 0 {
                    candidate = i;
                }
                sequence += 1;
            } else {
                sequence = 0;
            }
            if sequence == required_chunks {
                let c = (self.base as usize + candidate * CHUNK_SIZE) as *mut Chunk;
                self.mmap.commit(c as *mut u8, size);
                for j in 0..required_chunks {
                    self.set_bit(candidate + j);
                }
                return Some(c);
            }
        }
        None
    }

    pub fn free(&mut self, chunk: *mut Chunk, size: usize, page_size: usize) {
        let index = (chunk as usize - self.base as usize) / CHUNK_SIZE;
        let end = NUM_CHUNKS.min(index + (size - 1) / CHUNK_SIZE + 1);
        for i in index..end {
            debug_assert!(self.test_bit(i));
            self.clear_bit(i);
        }

        let size = (size + page_size - 1) & !(page_size - 1);
        #[cfg(not(any(target_os = "linux", windows)))]
        unsafe {
            // Linux and Windows hand decommitted pages back zeroed; other
            // systems do not, and the allocators rely on fresh chunk memory
            // being zero.
            core::ptr::write_bytes(chunk as *mut u8, 0, size);
        }
        self.mmap.decommit(chunk as *mut u8, size);
    }
}

/// Hands out chunk-aligned, committed, zeroed chunk runs, reserving new
/// [`MemorySegment`]s as the existing ones fill up.
pub struct ChunkAllocator {
    segments: Vec<MemorySegment>,
    page_size: usize,
}

impl ChunkAllocator {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            page_size: mmap::page_size(),
        }
    }

    /// Space for the requested payload plus the chunk header, rounded up to
    /// page and chunk granularity.
    pub fn required_chunk_size(&self, size: usize) -> usize {
        let size = size + HEADER_SIZE;
        let size = (size + self.page_size - 1) & !(self.page_size - 1);
        size.max(CHUNK_SIZE)
    }

    pub fn allocate(&mut self, size: usize) -> *mut Chunk {
        let size = self.required_chunk_size(size);
        for m in self.segments.iter_mut() {
            if m.has_free_chunks() {
                if let Some(c) = m.allocate(size) {
                    return c;
                }
            }
        }

        self.segments.push(MemorySegment::new(size));
        match self.segments.last_mut().and_then(|m| m.allocate(size)) {
            Some(c) => c,
            // a fresh segment is sized to fit the request
            None => panic!("chunk allocation of {} bytes failed", size),
        }
    }

    pub fn free(&mut self, chunk: *mut Chunk, size: usize) {
        let size = self.required_chunk_size(size);
        let page_size = self.page_size;
        for m in self.segments.iter_mut() {
            if m.contains(chunk) {
                m.free(chunk, size, page_size);
                return;
            }
        }
        panic!("freed chunk {:p} belongs to no segment", chunk);
    }

    pub fn reserved_bytes(&self) -> usize {
        self.segments.iter().map(|m| m.mmap.size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ENTRIES_IN_BITMAP;

    #[test]
    fn chunks_are_aligned_and_zeroed() {
        let mut alloc = ChunkAllocator::new();
        let c = alloc.allocate(0);
        assert_eq!(c as usize % CHUNK_SIZE, 0);
        unsafe {
            for i in 0..ENTRIES_IN_BITMAP {
                assert_eq!((*c).object_bitmap[i], 0);
                assert_eq!((*c).extends_bitmap[i], 0);
                assert_eq!((*c).black_bitmap[i], 0);
            }
        }
        alloc.free(c, 0);
    }

    #[test]
    fn reuses_freed_chunks() {
        let mut alloc = ChunkAllocator::new();
        let a = alloc.allocate(0);
        let b = alloc.allocate(0);
        assert_ne!(a, b);
        alloc.free(a, 0);
        let c = alloc.allocate(0);
        // first-fit bitmap scan hands the freed chunk back
        assert_eq!(a, c);
        alloc.free(b, 0);
        alloc.free(c, 0);
    }

    #[test]
    fn multi_chunk_runs() {
        let mut alloc = ChunkAllocator::new();
        let size = 3 * CHUNK_SIZE;
        let c = alloc.allocate(size);
        assert_eq!(c as usize % CHUNK_SIZE, 0);
        unsafe {
            // the run is contiguous and writable across chunk boundaries
            let p = c as *mut u8;
            *p.add(CHUNK_SIZE) = 1;
            *p.add(2 * CHUNK_SIZE) = 2;
        }
        alloc.free(c, size);
    }

    #[test]
    fn segment_scan_finds_holes() {
        let mut seg = MemorySegment::new(SEGMENT_SIZE);
        let a = seg.allocate(CHUNK_SIZE).unwrap();
        let b = seg.allocate(CHUNK_SIZE).unwrap();
        let c = seg.allocate(CHUNK_SIZE).unwrap();
        assert!(seg.contains(a) && seg.contains(b) && seg.contains(c));
        seg.free(b, CHUNK_SIZE, 4096);
        // a two-chunk run does not fit into the single-chunk hole
        let d = seg.allocate(2 * CHUNK_SIZE).unwrap();
        assert!(d > c);
        let e = seg.allocate(CHUNK_SIZE).unwrap();
        assert_eq!(e, b);
    }

    #[test]
    fn request_sizes_are_rounded_to_chunks() {
        let alloc = ChunkAllocator::new();
        assert_eq!(alloc.required_chunk_size(0), CHUNK_SIZE);
        assert_eq!(alloc.required_chunk_size(CHUNK_SIZE - HEADER_SIZE), CHUNK_SIZE);
        assert!(alloc.required_chunk_size(CHUNK_SIZE) > CHUNK_SIZE);
        assert_eq!(NUM_CHUNKS, 64);
        assert_eq!(SEGMENT_SIZE, 4 * 1024 * 1024);
    }
}
