//! Built-in operations the interpreter dispatches directly: arithmetic,
//! comparison, bitwise ops, indexing/slicing, and aggregate construction.
//!
//! Every function here takes already-fetched register `Value`s and a
//! `&Heap`/`&mut Heap` as needed; decoding operands out of an instruction
//! and writing the result back to a register slot is the dispatch loop's
//! job, not this module's.

use glyph_asm::PanicReason;

use crate::heap::{builtin_type, GlyphList, GlyphMap, Heap, MapEntry};
use crate::value::Value;

/// Reserved error-symbol ids the VM itself raises (string indexing domain
/// failures, primarily). Distinct namespace from the chunk's own compiler-
/// assigned symbol ids, which start at [`WELL_KNOWN_SYMBOL_COUNT`].
pub mod well_known {
    pub const OUT_OF_BOUNDS: u32 = 0;
    pub const INVALID_RUNE: u32 = 1;
    pub const INVALID_ARGUMENT: u32 = 2;

    pub const WELL_KNOWN_SYMBOL_COUNT: u32 = 3;
}

/// `toF64` per §4.1: fast path for primitives, heap slow path (string
/// parsing) otherwise.
pub fn to_f64(heap: &Heap, v: Value) -> Option<f64> {
    v.to_f64_fast().or_else(|| heap.to_f64_slow(v))
}

fn numeric_binop(heap: &Heap, a: Value, b: Value, f: impl FnOnce(f64, f64) -> f64) -> Result<Value, PanicReason> {
    let (x, y) = (to_f64(heap, a), to_f64(heap, b));
    match (x, y) {
        (Some(x), Some(y)) => Ok(Value::float(f(x, y))),
        _ => Err(PanicReason::InvalidArgument),
    }
}

pub fn add(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    numeric_binop(heap, a, b, |x, y| x + y)
}

pub fn sub(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    numeric_binop(heap, a, b, |x, y| x - y)
}

pub fn mul(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    numeric_binop(heap, a, b, |x, y| x * y)
}

pub fn div(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    // IEEE-754 division by zero yields +/-inf or NaN; no separate error path.
    numeric_binop(heap, a, b, |x, y| x / y)
}

pub fn pow(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    numeric_binop(heap, a, b, f64::powf)
}

/// Follows host `fmod` (via `f64::rem`), not Euclidean modulo: the result
/// carries the dividend's sign, matching `%` in most C-family hosts.
pub fn modulo(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    numeric_binop(heap, a, b, |x, y| x % y)
}

pub fn neg(heap: &Heap, a: Value) -> Result<Value, PanicReason> {
    to_f64(heap, a).map(|x| Value::float(-x)).ok_or(PanicReason::InvalidArgument)
}

/// Wraps modulo 2^48, matching the source's typed-integer fast path
/// (reimplemented identically per the open question on `AddInt`/`SubInt`
/// overflow).
pub fn add_int(a: Value, b: Value) -> Result<Value, PanicReason> {
    let (x, y) = (a.as_integer(), b.as_integer());
    match (x, y) {
        (Some(x), Some(y)) => Ok(Value::integer(wrap_int48(x.wrapping_add(y)))),
        _ => Err(PanicReason::InvalidArgument),
    }
}

pub fn sub_int(a: Value, b: Value) -> Result<Value, PanicReason> {
    let (x, y) = (a.as_integer(), b.as_integer());
    match (x, y) {
        (Some(x), Some(y)) => Ok(Value::integer(wrap_int48(x.wrapping_sub(y)))),
        _ => Err(PanicReason::InvalidArgument),
    }
}

pub fn less_int(a: Value, b: Value) -> Result<Value, PanicReason> {
    let (x, y) = (a.as_integer(), b.as_integer());
    match (x, y) {
        (Some(x), Some(y)) => Ok(Value::bool(x < y)),
        _ => Err(PanicReason::InvalidArgument),
    }
}

fn wrap_int48(v: i64) -> i64 {
    let masked = (v as u64) & 0x0000_FFFF_FFFF_FFFF;
    if masked & 0x0000_8000_0000_0000 != 0 {
        (masked | 0xFFFF_0000_0000_0000) as i64
    } else {
        masked as i64
    }
}

/// `none` is falsy, `bool` is its own truth value, everything else
/// (including `0`/`0.0`, which some scripting languages treat as falsy) is
/// truthy — this runtime does not special-case numeric zero.
pub fn truthy(v: Value) -> bool {
    if v.is_none() {
        false
    } else {
        v.as_bool().unwrap_or(true)
    }
}

pub fn compare(heap: &Heap, a: Value, b: Value) -> Value {
    Value::bool(heap.values_equal(a, b))
}

pub fn compare_not(heap: &Heap, a: Value, b: Value) -> Value {
    Value::bool(!heap.values_equal(a, b))
}

fn ordering_binop(heap: &Heap, a: Value, b: Value, f: impl FnOnce(f64, f64) -> bool) -> Result<Value, PanicReason> {
    let (x, y) = (to_f64(heap, a), to_f64(heap, b));
    match (x, y) {
        (Some(x), Some(y)) => Ok(Value::bool(f(x, y))),
        _ => Err(PanicReason::InvalidArgument),
    }
}

pub fn less(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    ordering_binop(heap, a, b, |x, y| x < y)
}

pub fn greater(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    ordering_binop(heap, a, b, |x, y| x > y)
}

pub fn less_equal(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    ordering_binop(heap, a, b, |x, y| x <= y)
}

pub fn greater_equal(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    ordering_binop(heap, a, b, |x, y| x >= y)
}

pub fn not(v: Value) -> Value {
    Value::bool(!truthy(v))
}

fn bitwise_binop(a: Value, b: Value, f: impl FnOnce(i64, i64) -> i64) -> Result<Value, PanicReason> {
    match (a.as_integer(), b.as_integer()) {
        (Some(x), Some(y)) => Ok(Value::integer(wrap_int48(f(x, y)))),
        _ => Err(PanicReason::InvalidArgument),
    }
}

pub fn bitwise_and(a: Value, b: Value) -> Result<Value, PanicReason> {
    bitwise_binop(a, b, |x, y| x & y)
}

pub fn bitwise_or(a: Value, b: Value) -> Result<Value, PanicReason> {
    bitwise_binop(a, b, |x, y| x | y)
}

pub fn bitwise_xor(a: Value, b: Value) -> Result<Value, PanicReason> {
    bitwise_binop(a, b, |x, y| x ^ y)
}

pub fn bitwise_not(a: Value) -> Result<Value, PanicReason> {
    a.as_integer().map(|x| Value::integer(wrap_int48(!x))).ok_or(PanicReason::InvalidArgument)
}

pub fn left_shift(a: Value, b: Value) -> Result<Value, PanicReason> {
    bitwise_binop(a, b, |x, y| x.wrapping_shl(y as u32 & 63))
}

pub fn right_shift(a: Value, b: Value) -> Result<Value, PanicReason> {
    bitwise_binop(a, b, |x, y| x.wrapping_shr(y as u32 & 63))
}

fn utf8_char_width(byte: u8) -> Option<usize> {
    match byte {
        0x00..=0x7f => Some(1),
        0xc0..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf7 => Some(4),
        _ => None,
    }
}

/// Rune-indexes a UTF-8 byte buffer. Bounds are checked against `rune_count`
/// (not `bytes.len()`): a string's index domain is capped at its rune
/// count even though the index addresses a byte offset, so an index past
/// the last rune is rejected as `OutOfBounds` before the byte at that
/// offset is ever inspected, and only an in-bounds offset can surface
/// `InvalidRune`.
fn index_string_bytes(bytes: &[u8], rune_count: usize, index: i64) -> Result<(usize, usize), u32> {
    if index < 0 || index as usize >= rune_count {
        return Err(well_known::OUT_OF_BOUNDS);
    }
    let offset = index as usize;
    match bytes.get(offset).copied().and_then(utf8_char_width) {
        Some(width) if offset + width <= bytes.len() => Ok((offset, width)),
        _ => Err(well_known::INVALID_RUNE),
    }
}

/// `recv[key]`, non-retaining: for lists/maps/objects the result is a copy
/// of a `Value` the receiver still owns; for strings it is a freshly
/// allocated slice (already `rc == 1`) since no existing `Value` could be
/// handed back unretained.
pub fn index(heap: &mut Heap, recv: Value, key: Value) -> Result<Value, PanicReason> {
    let ptr = unsafe { recv.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
    let type_id = unsafe { (*ptr).type_id };
    match type_id {
        builtin_type::LIST => {
            let list = unsafe { &*(ptr as *mut GlyphList) };
            let i = key.as_integer().ok_or(PanicReason::InvalidArgument)?;
            if i < 0 || i as usize >= list.items.len() {
                Err(PanicReason::OutOfBounds)
            } else {
                Ok(list.items[i as usize])
            }
        }
        builtin_type::MAP => {
            let map = unsafe { &*(ptr as *mut GlyphMap) };
            Ok(map_get(heap, map, key).unwrap_or_else(Value::none))
        }
        builtin_type::STRING_ASCII | builtin_type::STRING_UTF8 | builtin_type::STRING_SLICE => {
            let i = key.as_integer().ok_or(PanicReason::InvalidArgument)?;
            index_string(heap, recv, i)
        }
        _ => Err(PanicReason::InvalidArgument),
    }
}

fn string_len_and_contents(heap: &Heap, ptr: *mut crate::heap::HeapHeader) -> Option<(usize, &str)> {
    unsafe {
        let type_id = (*ptr).type_id;
        let rune_count = match type_id {
            builtin_type::STRING_ASCII => (*(ptr as *mut crate::heap::GlyphStringAscii)).bytes.len(),
            builtin_type::STRING_UTF8 => (*(ptr as *mut crate::heap::GlyphStringUtf8)).rune_count,
            builtin_type::STRING_SLICE => (*(ptr as *mut crate::heap::GlyphStringSlice)).rune_count,
            _ => return None,
        };
        heap.string_contents(ptr).map(|s| (rune_count, s))
    }
}

fn index_string(heap: &mut Heap, recv: Value, index: i64) -> Result<Value, PanicReason> {
    let ptr = unsafe { recv.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
    let Some((rune_count, contents)) = string_len_and_contents(heap, ptr) else {
        return Err(PanicReason::InvalidArgument);
    };
    match index_string_bytes(contents.as_bytes(), rune_count, index) {
        Ok((offset, width)) => {
            heap.retain(recv);
            Ok(heap.alloc_string_slice(recv, offset, width, 1))
        }
        Err(sym) => Ok(Value::error(sym)),
    }
}

/// `recv[^key]`: indexes from the end (`len - 1 - key`), sharing every
/// other rule with [`index`].
pub fn reverse_index(heap: &mut Heap, recv: Value, key: Value) -> Result<Value, PanicReason> {
    let ptr = unsafe { recv.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
    let type_id = unsafe { (*ptr).type_id };
    let i = key.as_integer().ok_or(PanicReason::InvalidArgument)?;
    match type_id {
        builtin_type::LIST => {
            let len = unsafe { (*(ptr as *mut GlyphList)).items.len() } as i64;
            index(heap, recv, Value::integer(len - 1 - i))
        }
        builtin_type::STRING_ASCII | builtin_type::STRING_UTF8 | builtin_type::STRING_SLICE => {
            let (rune_count, _) = string_len_and_contents(heap, ptr).ok_or(PanicReason::InvalidArgument)?;
            index_string(heap, recv, rune_count as i64 - 1 - i)
        }
        _ => Err(PanicReason::InvalidArgument),
    }
}

/// `recv[key] = val`, without releasing whatever value previously occupied
/// that slot (the caller is responsible for the old value's ownership, or
/// is using the aggregate-construction convention where the slot started
/// as `none`).
pub fn set_index(heap: &mut Heap, recv: Value, key: Value, val: Value) -> Result<(), PanicReason> {
    let ptr = unsafe { recv.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
    let type_id = unsafe { (*ptr).type_id };
    match type_id {
        builtin_type::LIST => {
            let list = unsafe { &mut *(ptr as *mut GlyphList) };
            let i = key.as_integer().ok_or(PanicReason::InvalidArgument)?;
            if i < 0 || i as usize >= list.items.len() {
                Err(PanicReason::OutOfBounds)
            } else {
                list.items[i as usize] = val;
                Ok(())
            }
        }
        builtin_type::MAP => {
            let map = unsafe { &mut *(ptr as *mut GlyphMap) };
            map_insert(heap, map, key, val);
            Ok(())
        }
        _ => Err(PanicReason::InvalidArgument),
    }
}

/// As [`set_index`], releasing the value previously occupying the slot
/// first (the `SetIndexRelease` opcode's contract).
pub fn set_index_release(heap: &mut Heap, recv: Value, key: Value, val: Value) -> Result<(), PanicReason> {
    let old = index(heap, recv, key);
    set_index(heap, recv, key, val)?;
    if let Ok(old) = old {
        heap.release(old);
    }
    Ok(())
}

/// `recv[start..end]`: a retained sub-list for lists, a rune-range slice
/// for strings.
pub fn slice(heap: &mut Heap, recv: Value, start: Value, end: Value) -> Result<Value, PanicReason> {
    let ptr = unsafe { recv.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
    let type_id = unsafe { (*ptr).type_id };
    let start = start.as_integer().ok_or(PanicReason::InvalidArgument)?;
    let end = end.as_integer().ok_or(PanicReason::InvalidArgument)?;
    match type_id {
        builtin_type::LIST => {
            let list = unsafe { &*(ptr as *mut GlyphList) };
            if start < 0 || end < start || end as usize > list.items.len() {
                return Err(PanicReason::OutOfBounds);
            }
            let items: Vec<Value> = list.items[start as usize..end as usize].to_vec();
            for &v in &items {
                heap.retain(v);
            }
            Ok(heap.alloc_list(items))
        }
        builtin_type::STRING_ASCII | builtin_type::STRING_UTF8 | builtin_type::STRING_SLICE => {
            let (rune_count, contents) = string_len_and_contents(heap, ptr).ok_or(PanicReason::InvalidArgument)?;
            if start < 0 || end < start || end as usize > rune_count {
                return Err(PanicReason::OutOfBounds);
            }
            let bytes = contents.as_bytes();
            let mut byte_start = bytes.len();
            let mut byte_end = bytes.len();
            let mut rune_idx = 0usize;
            let mut cursor = 0usize;
            while cursor < bytes.len() && rune_idx <= end as usize {
                if rune_idx == start as usize {
                    byte_start = cursor;
                }
                if rune_idx == end as usize {
                    byte_end = cursor;
                }
                let width = utf8_char_width(bytes[cursor]).ok_or(PanicReason::InvalidRune)?;
                cursor += width;
                rune_idx += 1;
            }
            if start as usize == rune_count {
                byte_start = bytes.len();
            }
            if end as usize == rune_count {
                byte_end = bytes.len();
            }
            heap.retain(recv);
            Ok(heap.alloc_string_slice(recv, byte_start, byte_end - byte_start, (end - start) as usize))
        }
        _ => Err(PanicReason::InvalidArgument),
    }
}

/// Formats `v` for `StringTemplate` interpolation. Heap aggregates other
/// than strings have no defined textual form yet and render as a bare type
/// tag; front ends that need richer formatting call a registered host
/// function instead of relying on the built-in opcode.
pub fn to_display_string(heap: &Heap, v: Value) -> String {
    if let Some(i) = v.as_integer() {
        return i.to_string();
    }
    if let Some(b) = v.as_bool() {
        return b.to_string();
    }
    if v.is_none() {
        return "none".to_string();
    }
    if let Some(sym) = v.as_symbol() {
        return format!("#{sym}");
    }
    if let Some(sym) = v.as_error_symbol() {
        return format!("error(#{sym})");
    }
    if let Some(f) = v.as_float() {
        return f.to_string();
    }
    if let Some(ptr) = unsafe { v.as_ptr() } {
        if let Some((_, s)) = string_len_and_contents(heap, ptr) {
            return s.to_string();
        }
    }
    "<object>".to_string()
}

/// `StringTemplate`: concatenates `values` (already converted per
/// [`to_display_string`]) into one freshly allocated UTF-8 string.
pub fn string_template(heap: &mut Heap, values: &[Value]) -> Value {
    let mut out = String::new();
    for &v in values {
        out.push_str(&to_display_string(heap, v));
    }
    let rune_count = out.chars().count();
    let value = heap.alloc_string_utf8(out.into_bytes().into_boxed_slice());
    debug_assert_eq!(
        unsafe { (*(value.as_ptr().unwrap() as *mut crate::heap::GlyphStringUtf8)).rune_count },
        rune_count
    );
    value
}

pub(crate) fn map_get(heap: &Heap, map: &GlyphMap, key: Value) -> Option<Value> {
    let (idx, found) = map_probe(heap, map, key);
    if found {
        map.buckets[idx].as_ref().map(|e| e.val)
    } else {
        None
    }
}

fn map_probe(heap: &Heap, map: &GlyphMap, key: Value) -> (usize, bool) {
    let mask = map.buckets.len() - 1;
    let hash = heap.hash_value(key);
    let mut idx = (hash as usize) & mask;
    for _ in 0..map.buckets.len() {
        match &map.buckets[idx] {
            None => return (idx, false),
            Some(entry) if entry.hash == hash && heap.values_equal(entry.key, key) => return (idx, true),
            _ => idx = (idx + 1) & mask,
        }
    }
    (idx, false)
}

pub(crate) fn map_insert(heap: &Heap, map: &mut GlyphMap, key: Value, val: Value) {
    if (map.len + 1) * 4 > map.buckets.len() * 3 {
        map_grow(heap, map);
    }
    let (idx, found) = map_probe(heap, map, key);
    if found {
        map.buckets[idx].as_mut().unwrap().val = val;
    } else {
        let hash = heap.hash_value(key);
        map.buckets[idx] = Some(MapEntry { hash, key, val });
        map.len += 1;
    }
}

fn map_grow(heap: &Heap, map: &mut GlyphMap) {
    let new_cap = (map.buckets.len() * 2).max(8);
    let old = core::mem::replace(&mut map.buckets, vec![None; new_cap]);
    map.len = 0;
    for entry in old.into_iter().flatten() {
        map_insert(heap, map, entry.key, entry.val);
    }
}

/// `SetInitN`: builds a set as a map whose values are all `none`, following
/// the host language's convention of representing sets over the same
/// hash-table machinery as maps.
pub fn set_init(heap: &mut Heap, items: &[Value]) -> Value {
    let map_val = heap.alloc_map(items.len());
    {
        let ptr = unsafe { map_val.as_ptr() }.unwrap() as *mut GlyphMap;
        let map = unsafe { &mut *ptr };
        for &item in items {
            map_insert(heap, map, item, Value::none());
        }
    }
    map_val
}

/// `Object`/`ObjectSmall`: allocates a user-defined struct instance with
/// `fields` already filled from the register window.
pub fn object(heap: &mut Heap, type_id: u32, fields: Vec<Value>) -> Value {
    heap.alloc_object(type_id, fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_promotes_integers_to_float() {
        let heap = Heap::new(32);
        let v = add(&heap, Value::integer(2), Value::integer(3)).unwrap();
        assert_eq!(v.as_float(), Some(5.0));
    }

    #[test]
    fn add_int_wraps_modulo_2_48() {
        let v = add_int(Value::integer(crate::consts::INT_MAX), Value::integer(1)).unwrap();
        assert_eq!(v.as_integer(), Some(crate::consts::INT_MIN));
    }

    #[test]
    fn modulo_follows_host_fmod_sign() {
        let heap = Heap::new(32);
        let v = modulo(&heap, Value::float(-7.0), Value::float(3.0)).unwrap();
        assert_eq!(v.as_float(), Some(-1.0));
    }

    #[test]
    fn utf8_indexing_matches_documented_scenario() {
        let mut heap = Heap::new(32);
        let s = "abc\u{1F98A}xyz\u{1F436}";
        let rune_count = s.chars().count();
        let recv = heap.alloc_string_utf8(s.as_bytes().to_vec().into_boxed_slice());

        let r3 = index_string(&mut heap, recv, 3).unwrap();
        assert!(!r3.is_error());
        let r4 = index_string(&mut heap, recv, 4).unwrap();
        assert_eq!(r4.as_error_symbol(), Some(well_known::INVALID_RUNE));
        let r8 = index_string(&mut heap, recv, rune_count as i64).unwrap();
        assert_eq!(r8, Value::error(well_known::OUT_OF_BOUNDS));
        let r8_literal = index_string(&mut heap, recv, 8).unwrap();
        assert_eq!(r8_literal, Value::error(well_known::OUT_OF_BOUNDS));

        heap.release(r3);
        heap.release(recv);
    }

    #[test]
    fn list_index_out_of_bounds_panics() {
        let mut heap = Heap::new(32);
        let list = heap.alloc_list(vec![Value::integer(1)]);
        let err = index(&mut heap, list, Value::integer(5)).unwrap_err();
        assert_eq!(err, PanicReason::OutOfBounds);
        heap.release(list);
    }

    #[test]
    fn map_round_trips_through_index_and_set_index() {
        let mut heap = Heap::new(32);
        let map_val = heap.alloc_map(4);
        set_index(&mut heap, map_val, Value::integer(1), Value::integer(100)).unwrap();
        let v = index(&mut heap, map_val, Value::integer(1)).unwrap();
        assert_eq!(v.as_integer(), Some(100));
        let missing = index(&mut heap, map_val, Value::integer(2)).unwrap();
        assert!(missing.is_none());
        heap.release(map_val);
    }
}
