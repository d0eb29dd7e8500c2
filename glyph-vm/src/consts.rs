//! VM parameters

/// Default stack capacity, in `Value` slots.
pub const DEFAULT_STACK_CAPACITY: usize = 10 * 1024;

/// Number of header slots at the base of every call frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Frame header slot holding the return-value destination.
pub const FRAME_SLOT_RETURN_DST: usize = 0;
/// Frame header slot holding packed `{requested-return-count, flags}`.
pub const FRAME_SLOT_META: usize = 1;
/// Frame header slot holding the caller's saved program counter.
pub const FRAME_SLOT_RETURN_PC: usize = 2;
/// Frame header slot holding the caller's saved frame pointer.
pub const FRAME_SLOT_RETURN_FP: usize = 3;

/// Bit of [`FRAME_SLOT_META`] marking the outermost (embedder-entry) frame.
pub const FRAME_FLAG_ROOT: u8 = 0x01;

/// Default boundary between the slab pool and the general allocator, in
/// bytes. Objects at or under this size are served from the pool.
pub const DEFAULT_POOL_MAX: usize = 32;

/// Size classes the slab pool buckets small allocations into. Every
/// allocation is rounded up to the smallest class that fits it.
pub const POOL_SIZE_CLASSES: [usize; 8] = [16, 32, 48, 64, 96, 128, 192, 256];

/// Default cycle-collector candidate-list length that triggers an
/// automatic `perform_gc` between instructions.
pub const DEFAULT_GC_CANDIDATE_THRESHOLD: usize = 256;

/// Recursion depth past which `release` defers remaining children to an
/// explicit worklist instead of recursing further.
pub const DEFER_RELEASE_DEPTH: usize = 16;

/// Integer payload width, in bits, of the tag-7 48-bit signed integer.
pub const INT_BITS: u32 = 48;

/// Largest representable tag-7 integer (`2^47 - 1`).
pub const INT_MAX: i64 = (1i64 << (INT_BITS - 1)) - 1;

/// Smallest representable tag-7 integer (`-2^47`).
pub const INT_MIN: i64 = -(1i64 << (INT_BITS - 1));
