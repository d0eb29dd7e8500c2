mod test_helpers;

use glyph_asm::{encode, Opcode};
use glyph_vm::{ChunkId, ModuleId, Vm, VmConfig, USER_TYPE_ID_BASE};
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use test_helpers::{chunk, patch_i16};

const METHOD_SYM: u32 = 7;
const TYPE_B_RESULT: i64 = 222;
const TYPE_A_RESULT: i64 = 111;

/// Builds the polymorphic call-site chunk used by both the fixed scenario
/// below and the property test: a `Match` selects between a type-A and a
/// type-B receiver, both of which flow into one shared `CallObjSym` site.
/// Returns the loaded chunk and the byte offset of that shared call site.
fn build_polymorphic_call_site(vm: &mut Vm) -> (ChunkId, usize) {
    let type_a = vm.register_host_type();
    let type_b = vm.register_host_type();
    let local_a: u16 = (type_a - USER_TYPE_ID_BASE) as u16;
    let local_b: u16 = (type_b - USER_TYPE_ID_BASE) as u16;

    let fn_a: glyph_vm::NativeFn =
        Box::new(|_heap: &mut glyph_vm::Heap, _args: &[glyph_vm::Value]| Ok(glyph_vm::Value::integer(TYPE_A_RESULT)));
    let fn_b: glyph_vm::NativeFn =
        Box::new(|_heap: &mut glyph_vm::Heap, _args: &[glyph_vm::Value]| Ok(glyph_vm::Value::integer(TYPE_B_RESULT)));
    let native_a = vm.register_host_fn(ModuleId(0), 0, fn_a);
    let native_b = vm.register_host_fn(ModuleId(0), 0, fn_b);
    let callable_a = vm.new_native_function(native_a, 0);
    let callable_b = vm.new_native_function(native_b, 0);
    vm.register_method(type_a, METHOD_SYM, callable_a);
    vm.register_method(type_b, METHOD_SYM, callable_b);

    let mut buf = Vec::new();
    let match_pc = buf.len();
    encode(&Opcode::Match { src: 0, case_const: 0, offset: 0 }, &mut buf);

    encode(&Opcode::Object { dst: 1, type_id: local_b, start: 0, count: 0 }, &mut buf);
    let jump_pc = buf.len();
    encode(&Opcode::Jump { offset: 0 }, &mut buf);

    let a_branch_pc = buf.len();
    encode(&Opcode::Object { dst: 1, type_id: local_a, start: 0, count: 0 }, &mut buf);

    let call_site_pc = buf.len();
    encode(&Opcode::Copy { dst: 2, src: 1 }, &mut buf);
    let callobjsym_pc = buf.len();
    encode(&Opcode::CallObjSym { recv: 2, sym: METHOD_SYM, start_local: 3, num_args: 0, num_ret: 1 }, &mut buf);
    encode(&Opcode::Release { slot: 1 }, &mut buf);
    encode(&Opcode::Copy { dst: 0, src: 2 }, &mut buf);
    encode(&Opcode::Ret1, &mut buf);

    patch_i16(&mut buf, match_pc + 4, (a_branch_pc as i64 - match_pc as i64) as i16);
    patch_i16(&mut buf, jump_pc + 1, (call_site_pc as i64 - jump_pc as i64) as i16);

    let id = vm.load_chunk(chunk(buf, vec![glyph_vm::ConstantData::Integer(0)])).unwrap();
    (id, callobjsym_pc)
}

/// However many times a polymorphic `CallObjSym` site flips between
/// receiver types, each call must still dispatch to that receiver's own
/// method — inline-cache promotion/deopt is an optimization, never a
/// change in observable behavior — and nothing is leaked along the way.
#[quickcheck]
fn call_site_dispatches_correctly_under_arbitrary_type_flips(selectors: Vec<bool>) -> TestResult {
    if selectors.len() > 20 {
        return TestResult::discard();
    }

    let mut vm = Vm::new(VmConfig::default());
    let (id, _) = build_polymorphic_call_site(&mut vm);

    for is_a in selectors {
        let selector = if is_a { 0 } else { 1 };
        let expected = if is_a { TYPE_A_RESULT } else { TYPE_B_RESULT };
        let r = match vm.eval_with_args(id, &[glyph_vm::Value::integer(selector)]) {
            Ok(r) => r,
            Err(_) => return TestResult::failed(),
        };
        if r.as_integer() != Some(expected) {
            return TestResult::failed();
        }
    }
    TestResult::passed()
}

/// One `CallObjSym` call site is reached from two branches selecting
/// different host types. The first call (type B, the `else` branch)
/// promotes the site to a monomorphic `CallObjNativeFuncIC`; a later call
/// with a type-A receiver must still produce the correct result by
/// deoptimizing, re-resolving, and re-promoting for the new type, and the
/// call site's disassembled mnemonic never reverts to the unresolved form
/// once promoted.
#[test]
fn call_site_promotes_and_survives_a_polymorphic_receiver() {
    let mut vm = Vm::new(VmConfig::default());
    let (id, callobjsym_pc) = build_polymorphic_call_site(&mut vm);
    let local_a: u16 = 0;
    let local_b: u16 = 1;

    let call_site_mnemonic = |vm: &Vm| -> String {
        vm.disassemble(id).unwrap().into_iter().find(|i| i.offset == callobjsym_pc).unwrap().mnemonic
    };
    let call_site_operands = |vm: &Vm| -> String {
        vm.disassemble(id).unwrap().into_iter().find(|i| i.offset == callobjsym_pc).unwrap().operands
    };

    assert_eq!(call_site_mnemonic(&vm), "CallObjSym");

    for _ in 0..5 {
        let r = vm.eval_with_args(id, &[glyph_vm::Value::integer(1)]).unwrap();
        assert_eq!(r.as_integer(), Some(TYPE_B_RESULT));
    }
    assert_eq!(call_site_mnemonic(&vm), "CallObjNativeFuncIC");
    assert!(call_site_operands(&vm).contains(&format!("ic_type: {local_b}")));

    // A foreign-type receiver interleaved into the now-monomorphic site:
    // deopts, re-resolves for type A, and gets the right answer.
    let r = vm.eval_with_args(id, &[glyph_vm::Value::integer(0)]).unwrap();
    assert_eq!(r.as_integer(), Some(TYPE_A_RESULT));
    assert_eq!(call_site_mnemonic(&vm), "CallObjNativeFuncIC");
    assert!(call_site_operands(&vm).contains(&format!("ic_type: {local_a}")));

    // And back to type B: the site re-specializes again, still correct.
    let r = vm.eval_with_args(id, &[glyph_vm::Value::integer(1)]).unwrap();
    assert_eq!(r.as_integer(), Some(TYPE_B_RESULT));
    assert_eq!(call_site_mnemonic(&vm), "CallObjNativeFuncIC");
    assert!(call_site_operands(&vm).contains(&format!("ic_type: {local_b}")));
}
