//! Shared chunk-assembly helpers for the scenario integration tests.
#![allow(dead_code)]

use glyph_vm::{Chunk, ConstantData, FunctionProto, SymbolTable};

/// A chunk with no statically-known functions beyond the implicit entry
/// point at instruction 0.
pub fn chunk(instructions: Vec<u8>, constants_raw: Vec<ConstantData>) -> Chunk {
    Chunk {
        constants_raw,
        constants: vec![],
        instructions,
        functions: vec![],
        symbols: SymbolTable::default(),
        debug_info: vec![],
        static_vars: vec![],
        static_funcs: vec![],
    }
}

/// As `chunk`, additionally registering `functions` — used wherever a
/// second callable body (a fiber's entry point, a lambda) is appended
/// after the main instruction stream in the same buffer.
pub fn chunk_with_functions(instructions: Vec<u8>, constants_raw: Vec<ConstantData>, functions: Vec<FunctionProto>) -> Chunk {
    let mut c = chunk(instructions, constants_raw);
    c.functions = functions;
    c
}

/// Overwrites the little-endian `i16` reserved at `at` once the real jump
/// target is known. Lets a test assemble straight-line code with a `0`
/// placeholder offset and patch it in after the target's own byte position
/// has been observed from `buf.len()`, rather than computing byte
/// distances by hand ahead of time.
pub fn patch_i16(buf: &mut [u8], at: usize, value: i16) {
    let bytes = value.to_le_bytes();
    buf[at] = bytes[0];
    buf[at + 1] = bytes[1];
}
