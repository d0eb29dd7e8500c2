mod test_helpers;

use glyph_asm::{encode, Opcode};
use glyph_vm::{Vm, VmConfig};
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use test_helpers::chunk;

/// Builds `[1, 2, 3]`, indexes element 1, releases the list, and returns
/// the indexed value — exercising `List`/`Index`/`Release` together and
/// confirming the list doesn't outlive its last reference.
#[test]
fn list_round_trip_indexes_and_fully_releases() {
    let mut vm = Vm::new(VmConfig::default());
    let mut buf = Vec::new();
    encode(&Opcode::ConstI8Int { dst: 0, imm: 1 }, &mut buf);
    encode(&Opcode::ConstI8Int { dst: 1, imm: 2 }, &mut buf);
    encode(&Opcode::ConstI8Int { dst: 2, imm: 3 }, &mut buf);
    encode(&Opcode::List { dst: 3, start: 0, count: 3 }, &mut buf);
    encode(&Opcode::ConstI8Int { dst: 4, imm: 1 }, &mut buf);
    encode(&Opcode::Index { dst: 5, recv: 3, key: 4 }, &mut buf);
    encode(&Opcode::Release { slot: 3 }, &mut buf);
    encode(&Opcode::Copy { dst: 0, src: 5 }, &mut buf);
    encode(&Opcode::Ret1, &mut buf);

    let id = vm.load_chunk(chunk(buf, vec![])).unwrap();
    let result = vm.eval(id).unwrap();
    assert_eq!(result.as_integer(), Some(2));

    #[cfg(feature = "rc-tracking")]
    assert_eq!(vm.global_rc(), 0);
}

/// For any short run of integers, building a list from them and releasing
/// it immediately must leave no dangling references behind: the list's own
/// refcount and every element it retained settle back to zero.
#[quickcheck]
fn list_build_and_release_preserves_refcount(values: Vec<i8>) -> TestResult {
    if values.len() > 6 {
        return TestResult::discard();
    }

    let mut vm = Vm::new(VmConfig::default());
    let mut buf = Vec::new();
    for (i, &v) in values.iter().enumerate() {
        encode(&Opcode::ConstI8Int { dst: i as u8, imm: v }, &mut buf);
    }
    let list_slot = values.len() as u8;
    encode(&Opcode::List { dst: list_slot, start: 0, count: values.len() as u8 }, &mut buf);
    encode(&Opcode::Release { slot: list_slot }, &mut buf);
    encode(&Opcode::None { dst: 0 }, &mut buf);
    encode(&Opcode::Ret1, &mut buf);

    let id = vm.load_chunk(chunk(buf, vec![])).unwrap();
    let result = vm.eval(id).unwrap();
    if !result.is_none() {
        return TestResult::failed();
    }

    #[cfg(feature = "rc-tracking")]
    let rc_is_zero = vm.global_rc() == 0;
    #[cfg(not(feature = "rc-tracking"))]
    let rc_is_zero = true;
    TestResult::from_bool(rc_is_zero)
}
