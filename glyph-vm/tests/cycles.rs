mod test_helpers;

use glyph_asm::{encode, Opcode};
use glyph_vm::{Vm, VmConfig, USER_TYPE_ID_BASE};
use test_helpers::chunk;

/// Two host-type objects retaining each other (`a.field0 = b`,
/// `b.field0 = a`) are unreachable from any root once their local stack
/// slots are released, but neither's refcount drops to zero on its own —
/// only the trial-deletion collector can tell the cycle is garbage.
#[test]
fn two_object_cycle_is_reclaimed_by_explicit_gc() {
    let cfg = VmConfig::builder().auto_gc(false).build();
    let mut vm = Vm::new(cfg);
    let type_id = vm.register_host_type();
    let local_type: u16 = (type_id - USER_TYPE_ID_BASE) as u16;

    let mut buf = Vec::new();
    encode(&Opcode::None { dst: 0 }, &mut buf);
    encode(&Opcode::Object { dst: 1, type_id: local_type, start: 0, count: 1 }, &mut buf); // a
    encode(&Opcode::None { dst: 2 }, &mut buf);
    encode(&Opcode::Object { dst: 3, type_id: local_type, start: 2, count: 1 }, &mut buf); // b
    encode(&Opcode::Retain { slot: 3 }, &mut buf);
    encode(&Opcode::SetField { recv: 1, field: 0, val: 3 }, &mut buf); // a.field0 = b
    encode(&Opcode::Retain { slot: 1 }, &mut buf);
    encode(&Opcode::SetField { recv: 3, field: 0, val: 1 }, &mut buf); // b.field0 = a
    encode(&Opcode::Release { slot: 1 }, &mut buf);
    encode(&Opcode::Release { slot: 3 }, &mut buf);
    encode(&Opcode::Ret0, &mut buf);

    let id = vm.load_chunk(chunk(buf, vec![])).unwrap();
    let result = vm.eval(id).unwrap();
    assert!(result.is_none());

    let stats = vm.run_gc();
    assert_eq!(stats.num_cyc_freed, 2);
    assert_eq!(stats.num_obj_freed_total, 2);

    #[cfg(feature = "rc-tracking")]
    assert_eq!(vm.global_rc(), 0);
}
