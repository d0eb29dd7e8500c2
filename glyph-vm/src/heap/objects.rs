//! Heap object variants, distinguished by [`HeapHeader::type_id`].
//!
//! Every struct here is `#[repr(C)]` with [`HeapHeader`] as its first
//! field, so a `*mut HeapHeader` obtained from a [`crate::Value`] can be
//! cast to the concrete type once `type_id` identifies which one it is
//! (the same "intrusive header" trick the allocator in [`super::pool`]
//! relies on).

use crate::value::Value;
use super::header::HeapHeader;

#[repr(C)]
pub struct GlyphList {
    pub header: HeapHeader,
    pub items: Vec<Value>,
}

#[derive(Clone, Copy)]
pub(crate) struct MapEntry {
    pub hash: u64,
    pub key: Value,
    pub val: Value,
}

#[repr(C)]
/// Open-addressed hash map from `Value` to `Value`. Hashing and equality
/// for heap-object keys (content hash for strings, identity otherwise)
/// are content-dependent, so map operations take `&Heap` — see
/// [`super::Heap::hash_value`]/[`super::Heap::values_equal`].
pub struct GlyphMap {
    pub header: HeapHeader,
    pub(crate) buckets: Vec<Option<MapEntry>>,
    pub(crate) len: usize,
}

impl GlyphMap {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        let cap = cap.next_power_of_two().max(8);
        GlyphMap {
            header: HeapHeader::new(super::header::builtin_type::MAP),
            buckets: vec![None; cap],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[repr(C)]
/// Allocated ASCII string: every byte is guaranteed `< 0x80`.
pub struct GlyphStringAscii {
    pub header: HeapHeader,
    pub bytes: Box<[u8]>,
}

#[repr(C)]
/// Allocated UTF-8 string with a precomputed rune (Unicode scalar value)
/// count, so `len()` in runes doesn't require a re-scan.
pub struct GlyphStringUtf8 {
    pub header: HeapHeader,
    pub bytes: Box<[u8]>,
    pub rune_count: usize,
}

#[repr(C)]
/// A view into an owning ASCII/UTF-8 string, retaining its parent for the
/// slice's lifetime.
pub struct GlyphStringSlice {
    pub header: HeapHeader,
    pub parent: Value,
    pub byte_offset: usize,
    pub byte_len: usize,
    pub rune_count: usize,
}

#[repr(C)]
/// Byte buffer with no UTF-8 validity guarantee.
pub struct GlyphRawString {
    pub header: HeapHeader,
    pub bytes: Box<[u8]>,
}

#[repr(C)]
pub struct GlyphRawStringSlice {
    pub header: HeapHeader,
    pub parent: Value,
    pub offset: usize,
    pub len: usize,
}

#[repr(C)]
/// Function pointer plus captured upvalues (each a retained [`GlyphBox`]
/// cell shared with the enclosing scope).
pub struct GlyphClosure {
    pub header: HeapHeader,
    pub func_addr: u64,
    pub param_count: u8,
    pub upvalues: Vec<Value>,
}

#[repr(C)]
/// Function pointer with no captures.
pub struct GlyphLambda {
    pub header: HeapHeader,
    pub func_addr: u64,
    pub param_count: u8,
}

#[repr(C)]
/// Single-slot mutable cell used to share a captured local between a
/// closure and its enclosing frame.
pub struct GlyphBox {
    pub header: HeapHeader,
    pub value: Value,
}

#[repr(C)]
/// A user-defined struct instance: `type_id` (>= [`super::header::USER_TYPE_ID_BASE`])
/// identifies its shape (field count and names, tracked in the chunk's
/// symbol table), `fields` holds the retained field values in
/// declaration order.
pub struct GlyphObject {
    pub header: HeapHeader,
    pub fields: Vec<Value>,
}

#[repr(C)]
/// Reflective handle to a type id, returned by type-introspection
/// built-ins.
pub struct GlyphMetaType {
    pub header: HeapHeader,
    pub referenced_type_id: u32,
}

#[repr(C)]
/// A callable backed by a Rust closure registered through
/// `Vm::register_host_fn`, rather than by compiled bytecode. `native_id`
/// indexes `crate::interpreter::NativeFnTable`, which the call machinery
/// consults whenever it dispatches through a value of this type.
pub struct GlyphNativeFunction {
    pub header: HeapHeader,
    pub native_id: u32,
    pub param_count: u8,
}

/// A finalizer run exactly once, either at RC-driven destruction or during
/// cycle-sweep (with child manipulation suppressed — see
/// [`super::Heap::destroy`]). Must not allocate on the VM heap.
pub type Finalizer = Box<dyn FnMut(*mut core::ffi::c_void)>;

#[repr(C)]
/// Opaque foreign-resource handle backing `Pointer`/`File`/`Dir`/`DirIter`
/// values. `data` is owned by the embedder's finalizer, not by the VM.
pub struct GlyphForeign {
    pub header: HeapHeader,
    pub data: *mut core::ffi::c_void,
    pub finalizer: Option<Finalizer>,
}

impl Drop for GlyphForeign {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.as_mut() {
            finalizer(self.data);
        }
    }
}
