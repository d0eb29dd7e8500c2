//! The reference-counted heap: allocation, destructor dispatch, and the
//! child-tracing walk shared by immediate destruction ([`Heap::release`])
//! and the cycle collector (`crate::cycle`).

mod header;
mod objects;
mod pool;

pub use header::{builtin_type, Color, HeapHeader, USER_TYPE_ID_BASE};
pub use objects::*;

use std::alloc::{dealloc, Layout};
use std::ptr::NonNull;

use smallvec::SmallVec;

use crate::consts::DEFER_RELEASE_DEPTH;
use crate::fiber::Fiber;
use crate::value::Value;
use pool::Pool;

/// Owns every heap allocation a VM (or one of its fibers) has made. A VM has
/// exactly one `Heap`; fibers allocate from and release into the same heap
/// their owning VM does (there is one heap per VM instance, never per fiber
/// — see the resource model's "multiple VMs must not share heap pointers").
pub struct Heap {
    pool: Pool,
    pool_max: usize,
    /// Intrusive singly-linked candidate list for the trial-deletion
    /// collector (see `crate::cycle`). Populated by `release` when a
    /// cycle-capable object's rc drops without reaching zero.
    candidates: *mut HeapHeader,
    candidate_count: usize,
    /// Values whose release was deferred past `DEFER_RELEASE_DEPTH` to keep
    /// `release`'s recursion bounded; drained by an explicit loop in
    /// `release` itself.
    deferred: Vec<Value>,
    #[cfg(feature = "rc-tracking")]
    global_rc: i64,
}

impl Heap {
    pub fn new(pool_max: usize) -> Self {
        Heap {
            pool: Pool::new(pool_max),
            pool_max,
            candidates: std::ptr::null_mut(),
            candidate_count: 0,
            deferred: Vec::new(),
            #[cfg(feature = "rc-tracking")]
            global_rc: 0,
        }
    }

    /// Sum of every live heap object's `rc`, when the `rc-tracking` feature
    /// is enabled. A testable property: this must return to zero after the
    /// VM's final teardown for every program that evaluates successfully.
    #[cfg(feature = "rc-tracking")]
    pub fn global_rc(&self) -> i64 {
        self.global_rc
    }

    pub fn candidate_count(&self) -> usize {
        self.candidate_count
    }

    fn fits_pool(&self, size: usize, align: usize) -> bool {
        size <= self.pool_max && align <= 8
    }

    unsafe fn alloc_raw<T>(&mut self) -> NonNull<T> {
        let size = core::mem::size_of::<T>();
        let align = core::mem::align_of::<T>();
        if self.fits_pool(size, align) {
            self.pool.alloc_typed::<T>().expect("heap allocation failed")
        } else {
            let layout = Layout::new::<T>();
            let raw = std::alloc::alloc(layout) as *mut T;
            NonNull::new(raw).expect("heap allocation failed")
        }
    }

    unsafe fn dealloc_raw<T>(&mut self, ptr: NonNull<T>) {
        let size = core::mem::size_of::<T>();
        let align = core::mem::align_of::<T>();
        if self.fits_pool(size, align) {
            self.pool.dealloc_typed(ptr);
        } else {
            dealloc(ptr.as_ptr() as *mut u8, Layout::new::<T>());
        }
    }

    /// Raw byte allocation for embedder-owned memory that doesn't back a
    /// typed heap object (host-side buffers, foreign data cells). Routed
    /// through the same size-class pool as every other allocation when it
    /// fits, falling back to the general allocator otherwise.
    ///
    /// # Safety
    /// `align` must be a power of two; the returned pointer is valid for
    /// `size` bytes until passed back to `dealloc_bytes` with the same
    /// `size`/`align`.
    pub unsafe fn alloc_bytes(&mut self, size: usize, align: usize) -> *mut u8 {
        if self.fits_pool(size, align) {
            self.pool.alloc(size, align)
        } else {
            let layout = Layout::from_size_align(size, align).expect("invalid layout");
            std::alloc::alloc(layout)
        }
    }

    /// # Safety
    /// `ptr` must have come from `alloc_bytes` with the same `size`/`align`.
    pub unsafe fn dealloc_bytes(&mut self, ptr: *mut u8, size: usize, align: usize) {
        if self.fits_pool(size, align) {
            self.pool.dealloc(ptr, size, align);
        } else {
            let layout = Layout::from_size_align(size, align).expect("invalid layout");
            dealloc(ptr, layout);
        }
    }

    /// Allocates `value` on the heap and returns a `Value` wrapping the
    /// resulting pointer with `rc == 1` (the caller's own ownership). `value`
    /// must already carry a correctly-initialized `HeapHeader` as its first
    /// field.
    unsafe fn alloc<T>(&mut self, value: T) -> Value {
        let ptr = self.alloc_raw::<T>();
        ptr.as_ptr().write(value);
        #[cfg(feature = "rc-tracking")]
        {
            self.global_rc += 1;
        }
        Value::from_heap_ptr(ptr.as_ptr() as *mut HeapHeader)
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Value {
        unsafe {
            self.alloc(GlyphList {
                header: HeapHeader::new(builtin_type::LIST),
                items,
            })
        }
    }

    pub fn alloc_map(&mut self, capacity_hint: usize) -> Value {
        unsafe { self.alloc(GlyphMap::with_capacity(capacity_hint)) }
    }

    pub fn alloc_string_ascii(&mut self, bytes: Box<[u8]>) -> Value {
        unsafe {
            self.alloc(GlyphStringAscii {
                header: HeapHeader::new(builtin_type::STRING_ASCII),
                bytes,
            })
        }
    }

    pub fn alloc_string_utf8(&mut self, bytes: Box<[u8]>) -> Value {
        let rune_count = core::str::from_utf8(&bytes).map(|s| s.chars().count()).unwrap_or(0);
        unsafe {
            self.alloc(GlyphStringUtf8 {
                header: HeapHeader::new(builtin_type::STRING_UTF8),
                bytes,
                rune_count,
            })
        }
    }

    /// `parent` is retained by the caller before this call (the interpreter
    /// emits a `Retain` alongside `Slice`, per the compiler's SSA-boundary
    /// convention).
    pub fn alloc_string_slice(&mut self, parent: Value, byte_offset: usize, byte_len: usize, rune_count: usize) -> Value {
        unsafe {
            self.alloc(GlyphStringSlice {
                header: HeapHeader::new(builtin_type::STRING_SLICE),
                parent,
                byte_offset,
                byte_len,
                rune_count,
            })
        }
    }

    pub fn alloc_raw_string(&mut self, bytes: Box<[u8]>) -> Value {
        unsafe {
            self.alloc(GlyphRawString {
                header: HeapHeader::new(builtin_type::RAW_STRING),
                bytes,
            })
        }
    }

    pub fn alloc_raw_string_slice(&mut self, parent: Value, offset: usize, len: usize) -> Value {
        unsafe {
            self.alloc(GlyphRawStringSlice {
                header: HeapHeader::new(builtin_type::RAW_STRING_SLICE),
                parent,
                offset,
                len,
            })
        }
    }

    pub fn alloc_closure(&mut self, func_addr: u64, param_count: u8, upvalues: Vec<Value>) -> Value {
        unsafe {
            self.alloc(GlyphClosure {
                header: HeapHeader::new(builtin_type::CLOSURE),
                func_addr,
                param_count,
                upvalues,
            })
        }
    }

    pub fn alloc_lambda(&mut self, func_addr: u64, param_count: u8) -> Value {
        unsafe {
            self.alloc(GlyphLambda {
                header: HeapHeader::new(builtin_type::LAMBDA),
                func_addr,
                param_count,
            })
        }
    }

    pub fn alloc_box(&mut self, value: Value) -> Value {
        unsafe {
            self.alloc(GlyphBox {
                header: HeapHeader::new(builtin_type::BOX_CELL),
                value,
            })
        }
    }

    pub fn alloc_object(&mut self, type_id: u32, fields: Vec<Value>) -> Value {
        debug_assert!(type_id >= USER_TYPE_ID_BASE);
        unsafe {
            self.alloc(GlyphObject {
                header: HeapHeader::new(type_id),
                fields,
            })
        }
    }

    pub fn alloc_native_function(&mut self, native_id: u32, param_count: u8) -> Value {
        unsafe {
            self.alloc(GlyphNativeFunction {
                header: HeapHeader::new(builtin_type::NATIVE_FUNCTION),
                native_id,
                param_count,
            })
        }
    }

    pub fn alloc_meta_type(&mut self, referenced_type_id: u32) -> Value {
        unsafe {
            self.alloc(GlyphMetaType {
                header: HeapHeader::new(builtin_type::META_TYPE),
                referenced_type_id,
            })
        }
    }

    pub fn alloc_foreign(&mut self, type_id: u32, data: *mut core::ffi::c_void, finalizer: Option<Finalizer>) -> Value {
        debug_assert!(matches!(
            type_id,
            builtin_type::POINTER | builtin_type::FILE | builtin_type::DIR | builtin_type::DIR_ITER
        ));
        unsafe {
            self.alloc(GlyphForeign {
                header: HeapHeader::new(type_id),
                data,
                finalizer,
            })
        }
    }

    pub fn alloc_fiber(&mut self, fiber: Fiber) -> Value {
        unsafe { self.alloc(fiber) }
    }

    /// Whether a heap object of this kind must be tracked by the trial
    /// deletion collector. Strings, booleans and numbers never participate
    /// in reference cycles and are intentionally excluded (see the runtime's
    /// design notes on reference graphs with cycles).
    pub fn participates_in_cycles(type_id: u32) -> bool {
        use builtin_type::*;
        matches!(type_id, LIST | MAP | CLOSURE | BOX_CELL | FIBER) || type_id >= USER_TYPE_ID_BASE
    }

    /// Increments `v`'s refcount. A no-op for non-heap values.
    pub fn retain(&mut self, v: Value) {
        if let Some(ptr) = unsafe { v.as_ptr() } {
            unsafe {
                (*ptr).rc += 1;
            }
            #[cfg(feature = "rc-tracking")]
            {
                self.global_rc += 1;
            }
        }
    }

    /// Decrements `v`'s refcount; destroys and frees the object immediately
    /// once it reaches zero. A no-op for non-heap values.
    pub fn release(&mut self, v: Value) {
        self.release_depth(v, 0);
        self.drain_deferred();
    }

    fn release_depth(&mut self, v: Value, depth: usize) {
        let Some(ptr) = (unsafe { v.as_ptr() }) else { return };
        unsafe {
            debug_assert!((*ptr).rc > 0, "release on an already-dead object");
            (*ptr).rc -= 1;
            #[cfg(feature = "rc-tracking")]
            {
                self.global_rc -= 1;
            }
            if (*ptr).rc == 0 {
                self.destroy(ptr, false, depth);
            } else if Self::participates_in_cycles((*ptr).type_id) && !(*ptr).buffered {
                self.buffer_candidate(ptr);
            }
        }
    }

    fn buffer_candidate(&mut self, ptr: *mut HeapHeader) {
        unsafe {
            (*ptr).buffered = true;
            (*ptr).next_cyc = self.candidates;
        }
        self.candidates = ptr;
        self.candidate_count += 1;
    }

    /// Drains the candidate list, clearing `buffered` on every entry. Used
    /// by the cycle collector at the start of a GC pass.
    pub(crate) fn drain_candidates(&mut self) -> Vec<*mut HeapHeader> {
        let mut out = Vec::with_capacity(self.candidate_count);
        let mut cur = self.candidates;
        unsafe {
            while !cur.is_null() {
                let next = (*cur).next_cyc;
                (*cur).buffered = false;
                (*cur).next_cyc = std::ptr::null_mut();
                out.push(cur);
                cur = next;
            }
        }
        self.candidates = std::ptr::null_mut();
        self.candidate_count = 0;
        out
    }

    /// Removes a to-be-collected cycle member's own `rc` from the global
    /// counter. Only valid for objects about to be swept with
    /// `suppress_children = true`: their contribution to `global_rc` comes
    /// entirely from other members of the same collected cycle (trial
    /// deletion proved them unreachable from any root), so the whole batch
    /// nets to zero without walking individual edges.
    #[cfg(feature = "rc-tracking")]
    pub(crate) fn account_cycle_collected(&mut self, ptr: *mut HeapHeader) {
        unsafe {
            self.global_rc -= (*ptr).rc as i64;
        }
    }

    #[cfg(not(feature = "rc-tracking"))]
    pub(crate) fn account_cycle_collected(&mut self, _ptr: *mut HeapHeader) {}

    /// Destroys and frees `ptr`. When `suppress_children` is set (the
    /// cycle-sweep case), owned `Value` fields are *not* released — they
    /// belong to the same sweep batch and will be freed directly by it.
    pub(crate) unsafe fn destroy(&mut self, ptr: *mut HeapHeader, suppress_children: bool, depth: usize) {
        let type_id = (*ptr).type_id;
        if !suppress_children {
            let mut children: SmallVec<[Value; 4]> = SmallVec::new();
            for_each_child(ptr, &mut |child| children.push(child));
            for child in children {
                if depth >= DEFER_RELEASE_DEPTH {
                    self.deferred.push(child);
                } else {
                    self.release_depth(child, depth + 1);
                }
            }
        }
        self.free_payload(ptr, type_id);
    }

    /// Drops the Rust-level payload (`Vec`/`Box` buffers, finalizers) and
    /// returns the memory to the allocator the object came from.
    unsafe fn free_payload(&mut self, ptr: *mut HeapHeader, type_id: u32) {
        use builtin_type::*;
        macro_rules! drop_and_free {
            ($ty:ty) => {{
                let typed = ptr as *mut $ty;
                core::ptr::drop_in_place(typed);
                self.dealloc_raw(NonNull::new_unchecked(typed));
            }};
        }
        match type_id {
            LIST => drop_and_free!(GlyphList),
            MAP => drop_and_free!(GlyphMap),
            STRING_ASCII => drop_and_free!(GlyphStringAscii),
            STRING_UTF8 => drop_and_free!(GlyphStringUtf8),
            STRING_SLICE => drop_and_free!(GlyphStringSlice),
            RAW_STRING => drop_and_free!(GlyphRawString),
            RAW_STRING_SLICE => drop_and_free!(GlyphRawStringSlice),
            CLOSURE => drop_and_free!(GlyphClosure),
            LAMBDA => drop_and_free!(GlyphLambda),
            BOX_CELL => drop_and_free!(GlyphBox),
            FIBER => drop_and_free!(Fiber),
            POINTER | FILE | DIR | DIR_ITER => drop_and_free!(GlyphForeign),
            META_TYPE => drop_and_free!(GlyphMetaType),
            NATIVE_FUNCTION => drop_and_free!(GlyphNativeFunction),
            _ if type_id >= USER_TYPE_ID_BASE => drop_and_free!(GlyphObject),
            other => unreachable!("no destructor registered for type_id {other}"),
        }
    }

    fn drain_deferred(&mut self) {
        while let Some(v) = self.deferred.pop() {
            self.release_depth(v, 0);
        }
    }

    /// Slow-path `toF64` for heap-object operands: only strings convert (via
    /// parsing), everything else yields `None` (the `TryValue`/arithmetic
    /// call sites surface that as an `InvalidArgument` panic).
    pub fn to_f64_slow(&self, v: Value) -> Option<f64> {
        let ptr = unsafe { v.as_ptr() }?;
        unsafe {
            match (*ptr).type_id {
                builtin_type::STRING_ASCII | builtin_type::STRING_UTF8 | builtin_type::RAW_STRING => {
                    self.string_contents(ptr).and_then(|s| s.parse().ok())
                }
                _ => None,
            }
        }
    }

    /// Reads a heap string-like object's bytes as UTF-8, if valid.
    ///
    /// # Safety
    /// `ptr` must point to a live object of one of the string type ids.
    pub unsafe fn string_contents(&self, ptr: *mut HeapHeader) -> Option<&str> {
        match (*ptr).type_id {
            builtin_type::STRING_ASCII => core::str::from_utf8(&(*(ptr as *mut GlyphStringAscii)).bytes).ok(),
            builtin_type::STRING_UTF8 => core::str::from_utf8(&(*(ptr as *mut GlyphStringUtf8)).bytes).ok(),
            builtin_type::RAW_STRING => core::str::from_utf8(&(*(ptr as *mut GlyphRawString)).bytes).ok(),
            builtin_type::STRING_SLICE => {
                let slice = &*(ptr as *mut GlyphStringSlice);
                let parent_ptr = slice.parent.as_ptr()?;
                let parent = self.string_contents(parent_ptr)?;
                parent.get(slice.byte_offset..slice.byte_offset + slice.byte_len)
            }
            _ => None,
        }
    }

    /// Equality per §4.1: bitwise for primitives, content comparison for
    /// strings, identity for every other heap object.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (unsafe { a.as_ptr() }, unsafe { b.as_ptr() }) {
            (None, None) => a.bits() == b.bits() || (a.as_float().zip(b.as_float()).is_some_and(|(x, y)| x == y)),
            (Some(pa), Some(pb)) => {
                let (ta, tb) = unsafe { ((*pa).type_id, (*pb).type_id) };
                if is_string_type(ta) && is_string_type(tb) {
                    unsafe { self.string_contents(pa) == self.string_contents(pb) }
                } else {
                    pa == pb
                }
            }
            _ => false,
        }
    }

    /// Hashes a value the same way `values_equal` compares it: by content
    /// for strings, by pointer identity for every other heap object. Used
    /// by `GlyphMap`'s open-addressing probe.
    pub fn hash_value(&self, v: Value) -> u64 {
        use core::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        match unsafe { v.as_ptr() } {
            None => v.bits().hash(&mut hasher),
            Some(ptr) => {
                let type_id = unsafe { (*ptr).type_id };
                if is_string_type(type_id) {
                    unsafe { self.string_contents(ptr) }.hash(&mut hasher);
                } else {
                    (ptr as usize).hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }
}

fn is_string_type(type_id: u32) -> bool {
    use builtin_type::*;
    matches!(type_id, STRING_ASCII | STRING_UTF8 | STRING_SLICE | RAW_STRING | RAW_STRING_SLICE)
}

/// Visits every `Value` directly owned by the object at `ptr` — the set
/// both `Heap::destroy`'s release pass and the cycle collector's mark/scan
/// walk need to traverse identically.
///
/// # Safety
/// `ptr` must point to a live, correctly-typed heap object.
pub(crate) unsafe fn for_each_child(ptr: *mut HeapHeader, f: &mut dyn FnMut(Value)) {
    use builtin_type::*;
    match (*ptr).type_id {
        LIST => {
            for &item in &(*(ptr as *mut GlyphList)).items {
                f(item);
            }
        }
        MAP => {
            for entry in (*(ptr as *mut GlyphMap)).buckets.iter().flatten() {
                f(entry.key);
                f(entry.val);
            }
        }
        STRING_SLICE => f((*(ptr as *mut GlyphStringSlice)).parent),
        RAW_STRING_SLICE => f((*(ptr as *mut GlyphRawStringSlice)).parent),
        CLOSURE => {
            for &up in &(*(ptr as *mut GlyphClosure)).upvalues {
                f(up);
            }
        }
        BOX_CELL => f((*(ptr as *mut GlyphBox)).value),
        FIBER => (*(ptr as *mut Fiber)).for_each_owned_value(f),
        _ if (*ptr).type_id >= USER_TYPE_ID_BASE => {
            for &field in &(*(ptr as *mut GlyphObject)).fields {
                f(field);
            }
        }
        _ => {}
    }
}
