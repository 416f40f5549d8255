use crate::type_info::TypeInfoIndex;
use modular_bitfield::prelude::*;

// HeapObjectHeader occupies the first bytes of an object's first slot.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | type info index |   14 | Index 0 is reserved as a sentinel.       |
// | huge            |    1 | Object lives in the huge-item allocator. |
// | unused          |    1 |                                          |
// +-----------------+------+------------------------------------------+
//
// Slot count and mark state are not stored here: both live in the chunk
// header bitmaps (extends and black respectively), keyed by slot index.
#[bitfield(bits = 16)]
#[derive(Clone, Copy)]
pub struct EncodedHeader {
    info: B14,
    huge: bool,
    #[skip]
    __: B1,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct HeapObjectHeader {
    encoded: EncodedHeader,
    _reserved: [u8; 6],
}

impl HeapObjectHeader {
    #[inline(always)]
    pub fn new(info: TypeInfoIndex, huge: bool) -> Self {
        Self {
            encoded: EncodedHeader::new().with_info(info).with_huge(huge),
            _reserved: [0; 6],
        }
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + core::mem::size_of::<Self>()) as _
    }

    #[inline(always)]
    pub fn type_info_index(&self) -> TypeInfoIndex {
        self.encoded.info()
    }

    #[inline(always)]
    pub fn is_huge(&self) -> bool {
        self.encoded.huge()
    }

    /// A slot whose header carries index 0 was never initialized as an
    /// object. Free-list entries reuse the slot bytes, so this is only
    /// meaningful for slots with their object bit set.
    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.encoded.info() != 0
    }
}
