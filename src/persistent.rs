use crate::value::Value;

pub const VALUES_PER_PAGE: usize = 64;

struct Page {
    values: [Value; VALUES_PER_PAGE],
    /// Head of the in-page free list, -1 when the page is full. Free slots
    /// store the index of the next free slot as an int-tagged value.
    free_list: i32,
    n_used: u32,
}

impl Page {
    fn new() -> Box<Self> {
        let mut page = Box::new(Page {
            values: [Value::undefined(); VALUES_PER_PAGE],
            free_list: 0,
            n_used: 0,
        });
        for i in 0..VALUES_PER_PAGE {
            let next = if i + 1 < VALUES_PER_PAGE {
                (i + 1) as i32
            } else {
                -1
            };
            page.values[i] = Value::from_int(next);
        }
        page
    }
}

/// Index-based handle into a [`PersistentValueStorage`]. Stable for the
/// lifetime of the slot; freeing the slot invalidates the handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PersistentSlot {
    page: u32,
    index: u32,
}

/// Paged storage for values the host keeps alive across collections (or, for
/// the weak table, observes without keeping alive). Slots are handed out from
/// per-page free lists and never move; iteration by flat index is resumable
/// across state-machine slices.
pub struct PersistentValueStorage {
    pages: Vec<Box<Page>>,
}

impl PersistentValueStorage {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn allocate(&mut self, value: Value) -> PersistentSlot {
        let page = match self.pages.iter().position(|p| p.free_list >= 0) {
            Some(i) => i,
            None => {
                self.pages.push(Page::new());
                self.pages.len() - 1
            }
        };
        let p = &mut self.pages[page];
        let index = p.free_list as usize;
        p.free_list = match p.values[index].as_int() {
            Some(next) => next,
            None => -1,
        };
        p.values[index] = value;
        p.n_used += 1;
        PersistentSlot {
            page: page as u32,
            index: index as u32,
        }
    }

    pub fn free(&mut self, slot: PersistentSlot) {
        let p = &mut self.pages[slot.page as usize];
        p.values[slot.index as usize] = Value::from_int(p.free_list);
        p.free_list = slot.index as i32;
        p.n_used -= 1;
    }

    pub fn get(&self, slot: PersistentSlot) -> Value {
        self.pages[slot.page as usize].values[slot.index as usize]
    }

    pub fn set(&mut self, slot: PersistentSlot, value: Value) {
        self.pages[slot.page as usize].values[slot.index as usize] = value;
    }

    /// Number of slots a flat-index walk covers, free ones included.
    pub fn slot_capacity(&self) -> usize {
        self.pages.len() * VALUES_PER_PAGE
    }

    pub fn used_slots(&self) -> usize {
        self.pages.iter().map(|p| p.n_used as usize).sum()
    }

    /// Value at a flat position, or `None` past the end. Free slots read as
    /// int-tagged values, which callers looking for managed pointers skip
    /// anyway.
    pub fn value_at(&self, flat: usize) -> Option<Value> {
        let page = flat / VALUES_PER_PAGE;
        if page >= self.pages.len() {
            return None;
        }
        Some(self.pages[page].values[flat % VALUES_PER_PAGE])
    }

    pub(crate) fn set_at(&mut self, flat: usize, value: Value) {
        let page = flat / VALUES_PER_PAGE;
        self.pages[page].values[flat % VALUES_PER_PAGE] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_get_set_free() {
        let mut storage = PersistentValueStorage::new();
        let a = storage.allocate(Value::from_int(1));
        let b = storage.allocate(Value::from_int(2));
        assert_eq!(storage.get(a).as_int(), Some(1));
        assert_eq!(storage.get(b).as_int(), Some(2));
        storage.set(a, Value::from_int(7));
        assert_eq!(storage.get(a).as_int(), Some(7));
        assert_eq!(storage.used_slots(), 2);
        storage.free(a);
        assert_eq!(storage.used_slots(), 1);
    }

    #[test]
    fn freed_slots_are_reused_before_new_pages() {
        let mut storage = PersistentValueStorage::new();
        let slots: Vec<_> = (0..VALUES_PER_PAGE)
            .map(|i| storage.allocate(Value::from_int(i as i32)))
            .collect();
        assert_eq!(storage.slot_capacity(), VALUES_PER_PAGE);
        storage.free(slots[10]);
        let again = storage.allocate(Value::from_int(99));
        assert_eq!(again, slots[10]);
        assert_eq!(storage.slot_capacity(), VALUES_PER_PAGE);
        // page is full again, the next allocation grows the storage
        storage.allocate(Value::undefined());
        assert_eq!(storage.slot_capacity(), 2 * VALUES_PER_PAGE);
    }

    #[test]
    fn flat_walk_covers_all_pages() {
        let mut storage = PersistentValueStorage::new();
        for i in 0..(VALUES_PER_PAGE + 5) {
            storage.allocate(Value::from_int(i as i32));
        }
        let mut seen = 0;
        let mut flat = 0;
        while let Some(v) = storage.value_at(flat) {
            if v.as_int().is_some() {
                seen += 1;
            }
            flat += 1;
        }
        // free tail slots also read as ints, so everything counts
        assert_eq!(flat, 2 * VALUES_PER_PAGE);
        assert_eq!(seen, 2 * VALUES_PER_PAGE);
    }
}
