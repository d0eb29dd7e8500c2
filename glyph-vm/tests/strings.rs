mod test_helpers;

use glyph_asm::{encode, Opcode};
use glyph_vm::builtins::well_known;
use glyph_vm::{ChunkId, ConstantData, Vm, VmConfig};
use test_helpers::chunk;

/// Indexes a UTF-8 string at a rune boundary, a mid-character continuation
/// byte, and one past the end — `"abc\u{1F98A}xyz\u{1F436}"` has 8 runes,
/// with the 4-byte `🦊` occupying rune index 3 (byte offset 3..7).
#[test]
fn utf8_indexing_distinguishes_valid_invalid_and_out_of_bounds() {
    let mut vm = Vm::new(VmConfig::default());
    let s = "abc\u{1F98A}xyz\u{1F436}";
    assert_eq!(s.chars().count(), 8);

    let mut buf = Vec::new();
    encode(&Opcode::ConstOp { dst: 0, idx: 0 }, &mut buf);
    encode(&Opcode::ConstI8Int { dst: 1, imm: 3 }, &mut buf);
    encode(&Opcode::Index { dst: 2, recv: 0, key: 1 }, &mut buf);
    encode(&Opcode::ConstI8Int { dst: 3, imm: 4 }, &mut buf);
    encode(&Opcode::Index { dst: 4, recv: 0, key: 3 }, &mut buf);
    encode(&Opcode::ConstI8Int { dst: 5, imm: 8 }, &mut buf);
    encode(&Opcode::Index { dst: 6, recv: 0, key: 5 }, &mut buf);
    encode(&Opcode::Copy { dst: 10, src: 2 }, &mut buf);
    encode(&Opcode::Copy { dst: 11, src: 4 }, &mut buf);
    encode(&Opcode::Copy { dst: 12, src: 6 }, &mut buf);
    encode(&Opcode::List { dst: 13, start: 10, count: 3 }, &mut buf);
    encode(&Opcode::Copy { dst: 0, src: 13 }, &mut buf);
    encode(&Opcode::Ret1, &mut buf);

    let id: ChunkId = vm.load_chunk(chunk(buf, vec![ConstantData::HeapUtf8String(s.as_bytes().into())])).unwrap();
    let result = vm.eval(id).unwrap();

    assert_eq!(vm.list_len(result), Some(3));
    let at_boundary = vm.list_get(result, 0).unwrap();
    assert!(!at_boundary.is_error());
    let mid_char = vm.list_get(result, 1).unwrap();
    assert_eq!(mid_char.as_error_symbol(), Some(well_known::INVALID_RUNE));
    let past_end = vm.list_get(result, 2).unwrap();
    assert_eq!(past_end.as_error_symbol(), Some(well_known::OUT_OF_BOUNDS));
}
