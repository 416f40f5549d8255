use crate::gcref::{GcRef, UntypedGcRef};
use crate::type_info::HeapObject;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Heap-allocated interned string. The byte storage stays on the unmanaged
/// heap and is accounted against the unmanaged GC limit.
pub struct HeapString {
    string: String,
    hash: u64,
}

unsafe impl HeapObject for HeapString {
    fn unmanaged_size(&self) -> usize {
        self.string.capacity()
    }
}

impl HeapString {
    pub fn new(string: String) -> Self {
        let hash = hash_str(&string);
        Self { string, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.string
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

pub fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Interning table for identifiers. Entries are weak: the table itself keeps
/// nothing alive, and its per-cycle sweep drops every string that failed to
/// mark, so a dead identifier can be re-interned later without ever yielding
/// a dangling reference.
pub struct IdentifierTable {
    by_hash: HashMap<u64, Vec<UntypedGcRef>>,
}

impl IdentifierTable {
    pub fn new() -> Self {
        Self {
            by_hash: HashMap::new(),
        }
    }

    pub fn lookup(&self, s: &str) -> Option<GcRef<HeapString>> {
        let hash = hash_str(s);
        let bucket = self.by_hash.get(&hash)?;
        for &r in bucket.iter() {
            let string = unsafe { r.cast_unchecked::<HeapString>() };
            if string.as_str() == s {
                return Some(string);
            }
        }
        None
    }

    pub fn insert(&mut self, string: GcRef<HeapString>) {
        self.by_hash
            .entry(string.hash())
            .or_insert_with(Vec::new)
            .push(string.untyped());
    }

    pub fn len(&self) -> usize {
        self.by_hash.values().map(|b| b.len()).sum()
    }

    /// Runs while the cycle's black bits are still valid, before the
    /// allocator sweeps free the underlying memory.
    pub fn sweep(&mut self) {
        self.by_hash.retain(|_, bucket| {
            bucket.retain(|r| r.is_marked());
            !bucket.is_empty()
        });
    }
}
