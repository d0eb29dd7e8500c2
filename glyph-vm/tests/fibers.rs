mod test_helpers;

use glyph_asm::{encode, Opcode};
use glyph_vm::{ConstantData, FunctionProto, Vm, VmConfig};
use test_helpers::chunk_with_functions;

/// A fiber body that yields `1`, then on resumption returns `2`. Driving it
/// through `coinit -> coresume -> coresume -> coresume` (the third call
/// lands on an already-`Done` fiber) must produce `[1, 2, none]`.
///
/// The caller's lambda register is released only *after* the first
/// `coresume`, once the fiber has taken ownership of the pending call —
/// releasing it earlier would free the lambda while the fiber still
/// referenced it.
#[test]
fn fiber_yields_then_returns_then_reports_done() {
    let mut vm = Vm::new(VmConfig::default());

    let mut main = Vec::new();
    encode(&Opcode::Lambda { dst: 0, func_const: 0 }, &mut main);
    encode(&Opcode::Coinit { dst: 1, func: 0, start_local: 2, num_args: 0 }, &mut main);
    encode(&Opcode::None { dst: 3 }, &mut main);
    encode(&Opcode::Coresume { dst: 4, fiber: 1, val: 3 }, &mut main);
    encode(&Opcode::Release { slot: 0 }, &mut main);
    encode(&Opcode::Coresume { dst: 5, fiber: 1, val: 3 }, &mut main);
    encode(&Opcode::Coresume { dst: 6, fiber: 1, val: 3 }, &mut main);
    encode(&Opcode::Release { slot: 1 }, &mut main);
    encode(&Opcode::Copy { dst: 10, src: 4 }, &mut main);
    encode(&Opcode::Copy { dst: 11, src: 5 }, &mut main);
    encode(&Opcode::Copy { dst: 12, src: 6 }, &mut main);
    encode(&Opcode::List { dst: 13, start: 10, count: 3 }, &mut main);
    encode(&Opcode::Copy { dst: 0, src: 13 }, &mut main);
    encode(&Opcode::Ret1, &mut main);

    let fiber_body_entry = main.len();
    encode(&Opcode::ConstI8Int { dst: 0, imm: 1 }, &mut main);
    encode(&Opcode::Coyield { val: 0 }, &mut main);
    encode(&Opcode::ConstI8Int { dst: 0, imm: 2 }, &mut main);
    encode(&Opcode::Coreturn { val: 0 }, &mut main);

    let functions = vec![FunctionProto { entry_pc: fiber_body_entry, max_locals: 1, param_count: 0, is_native: false }];
    let id = vm.load_chunk(chunk_with_functions(main, vec![ConstantData::Integer(0)], functions)).unwrap();
    let result = vm.eval(id).unwrap();

    assert_eq!(vm.list_len(result), Some(3));
    assert_eq!(vm.list_get(result, 0).and_then(|v| v.as_integer()), Some(1));
    assert_eq!(vm.list_get(result, 1).and_then(|v| v.as_integer()), Some(2));
    assert!(vm.list_get(result, 2).unwrap().is_none());

    vm.release(result);
    #[cfg(feature = "rc-tracking")]
    assert_eq!(vm.global_rc(), 0);
}
