use std::fmt;

use newt::{define_num_enum, NumEnum};

define_num_enum! {
    /// The resource categories partitioning both the ID space and the
    /// table space. Mirrors the `OS_OBJECT_TYPE_*` enumeration.
    pub enum ObjectKind {
        Task,
        Queue,
        CountSem,
        BinSem,
        Mutex,
        Condvar,
        Module,
        TimeBase,
        TimeCb,
        Stream,
        Dir,
        FileSys,
        Console,
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const GENERATION_BITS: u32 = 12;
const INDEX_BITS: u32 = 16;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Maximum number of live slots a single kind's table may address. Indices
/// beyond this never get handed out; `ObjectTable::new` enforces it.
pub const MAX_INDEX: usize = (1 << INDEX_BITS) - 1;

/// Masks a slot's raw, unboundedly-incrementing generation counter down to
/// the `GENERATION_BITS` an `ObjectId` actually carries, remapping 0 to 1
/// the same way `ObjectId::new` does. `ObjectTable` stores the raw counter
/// (so it never itself wraps back to a value `ObjectId` could confuse with
/// a much older generation until `u32::wrapping_add` actually wraps), and
/// must run every comparison against a live id's 12-bit generation through
/// this same normalization, or a slot reused `2^GENERATION_BITS` times
/// would wrongly fail validation against an id minted after the wrap.
pub(crate) fn normalize_generation(generation: u32) -> u32 {
    let generation = generation & GENERATION_MASK;
    if generation == 0 {
        1
    } else {
        generation
    }
}

/// An opaque 32-bit object identifier: `kind` in the upper 4 bits,
/// a wrapping `generation` in the next 12, and a slot `index` in the low
/// 16. The all-zero value is reserved to mean "undefined", matching the
/// special `OS_OBJECT_ID_UNDEFINED` sentinel.
///
/// Two `ObjectId`s compare equal iff they were produced by the same
/// allocation: reusing a slot index bumps the generation, so a caller
/// holding a stale id can never alias a fresh allocation at the same index.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    pub const UNDEFINED: ObjectId = ObjectId(0);

    pub(crate) fn new(kind: ObjectKind, generation: u32, index: usize) -> Self {
        debug_assert!(index <= MAX_INDEX);

        // generation 0 is reserved so that (kind=0, gen=0, index=0) never
        // collides with the bit pattern of UNDEFINED.
        let generation = normalize_generation(generation);

        let raw = ((kind.as_usize() as u32) << (GENERATION_BITS + INDEX_BITS))
            | (generation << INDEX_BITS)
            | index as u32;

        ObjectId(raw)
    }

    pub fn is_defined(self) -> bool {
        self.0 != 0
    }

    pub fn kind(self) -> Option<ObjectKind> {
        if !self.is_defined() {
            return None;
        }

        let kind_idx = (self.0 >> (GENERATION_BITS + INDEX_BITS)) as usize;
        ObjectKind::try_from_index(kind_idx)
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> INDEX_BITS) & GENERATION_MASK
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// The raw 32-bit value, for bridging to a C-style facade.
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        ObjectId(raw)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_defined() {
            return write!(f, "ObjectId(undefined)");
        }

        write!(
            f,
            "ObjectId({:?}, gen={}, idx={})",
            self.kind(),
            self.generation(),
            self.index()
        )
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_is_zero() {
        assert_eq!(ObjectId::UNDEFINED.raw(), 0);
        assert!(!ObjectId::UNDEFINED.is_defined());
    }

    #[test]
    fn round_trips_kind_and_index() {
        let id = ObjectId::new(ObjectKind::Queue, 7, 42);
        assert!(id.is_defined());
        assert_eq!(id.kind(), Some(ObjectKind::Queue));
        assert_eq!(id.generation(), 7);
        assert_eq!(id.index(), 42);
    }

    #[test]
    fn never_collides_with_undefined() {
        let id = ObjectId::new(ObjectKind::Task, 0, 0);
        assert_ne!(id, ObjectId::UNDEFINED);
    }

    #[test]
    fn normalize_generation_matches_object_id_new_remap() {
        // A raw counter that happens to be a multiple of 2^GENERATION_BITS
        // normalizes the same way a fresh `ObjectId` built from it would.
        assert_eq!(normalize_generation(0), 1);
        assert_eq!(normalize_generation(1 << GENERATION_BITS), 1);
        assert_eq!(normalize_generation((1 << GENERATION_BITS) + 7), 7);
    }
}
