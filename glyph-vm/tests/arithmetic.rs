mod test_helpers;

use glyph_asm::{encode, Opcode};
use glyph_vm::{Vm, VmConfig};
use test_helpers::chunk;

/// `1 + 2 * 3` evaluates to the float `7.0` — `Add`/`Mul` are the
/// float-arithmetic family and always produce a float result even when fed
/// integer operands (see `builtins::numeric_binop`).
#[test]
fn one_plus_two_times_three_is_seven() {
    let mut vm = Vm::new(VmConfig::default());
    let mut buf = Vec::new();
    encode(&Opcode::ConstI8Int { dst: 0, imm: 2 }, &mut buf);
    encode(&Opcode::ConstI8Int { dst: 1, imm: 3 }, &mut buf);
    encode(&Opcode::Mul { dst: 2, a: 0, b: 1 }, &mut buf);
    encode(&Opcode::ConstI8Int { dst: 3, imm: 1 }, &mut buf);
    encode(&Opcode::Add { dst: 0, a: 3, b: 2 }, &mut buf);
    encode(&Opcode::Ret1, &mut buf);

    let id = vm.load_chunk(chunk(buf, vec![])).unwrap();
    let result = vm.eval(id).unwrap();
    assert_eq!(result.as_float(), Some(7.0));

    #[cfg(feature = "rc-tracking")]
    assert_eq!(vm.global_rc(), 0);
}
