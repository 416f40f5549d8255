use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub mod block_allocator;
pub mod chunk;
pub mod chunk_allocator;
pub mod gc_state;
pub mod gcref;
pub mod header;
pub mod huge_allocator;
pub mod identifier_table;
pub mod mark_stack;
pub mod memory_manager;
pub mod mmap;
pub mod persistent;
pub mod statistics;
pub mod type_info;
pub mod value;
pub mod weak_collections;


pub use gc_state::GcState;
pub use gcref::{GcRef, UntypedGcRef};
pub use mark_stack::MarkStack;
pub use memory_manager::{Blockness, MemoryManager};
pub use persistent::PersistentSlot;
pub use type_info::HeapObject;
pub use value::Value;

/// Rounds `value` up to the nearest multiple of `align`.
pub const fn align_usize(value: usize, align: usize) -> usize {
    ((value + align - 1) / align) * align
}

/// Process-wide state shared by every engine instance in this process.
/// Created once at startup and handed to each [`MemoryManager`].
pub struct Platform {
    next_engine_serial: Mutex<u64>,
}

impl Platform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_engine_serial: Mutex::new(1),
        })
    }

    pub(crate) fn next_serial(&self) -> u64 {
        let mut serial = self.next_engine_serial.lock();
        let current = *serial;
        *serial += 1;
        current
    }
}

/// Collector tuning. `Default` is what production engines run with;
/// [`Config::from_env`] layers the recognized environment options on top.
#[derive(Clone)]
pub struct Config {
    /// Run a full synchronous collection on every allocation. Debugging aid.
    pub aggressive_gc: bool,
    /// Time budget per incremental collection slice. Zero disables
    /// incremental collection entirely: cycles run to completion when
    /// triggered.
    pub time_limit: Duration,
    pub mark_stack_size: usize,
    pub value_stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aggressive_gc: false,
            // target 60fps, use at most a third of a frame per slice
            time_limit: Duration::from_millis((1000 / 60) / 3),
            mark_stack_size: 4 * 1024 * 1024,
            value_stack_size: 1024 * 1024,
        }
    }
}

impl Config {
    /// Recognized options: `QUASAR_GC_AGGRESSIVE` (any non-empty value) and
    /// `QUASAR_GC_TIMELIMIT` (milliseconds per slice, zero or negative for
    /// synchronous collection).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if std::env::var_os("QUASAR_GC_AGGRESSIVE").map_or(false, |v| !v.is_empty()) {
            config.aggressive_gc = true;
        }
        if let Ok(limit) = std::env::var("QUASAR_GC_TIMELIMIT") {
            if let Ok(ms) = limit.parse::<i64>() {
                config.time_limit = if ms > 0 {
                    Duration::from_millis(ms as u64)
                } else {
                    Duration::from_millis(0)
                };
            }
        }
        config
    }
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn align_rounds_up() {
        assert_eq!(align_usize(0, 32), 0);
        assert_eq!(align_usize(1, 32), 32);
        assert_eq!(align_usize(32, 32), 32);
        assert_eq!(align_usize(33, 32), 64);
    }

    #[test]
    fn platform_serials_are_unique() {
        let platform = Platform::new();
        let a = platform.next_serial();
        let b = platform.next_serial();
        assert_ne!(a, b);
    }
}
