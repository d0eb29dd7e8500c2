//! The per-opcode match. One iteration decodes one instruction, executes
//! it, and either falls through to the next `pc` or redirects control flow
//! (jumps, calls, returns, fiber switches).

use glyph_asm::{decode_at, deopt_call_obj_ic, deopt_field_ic, promote_call_obj_sym, promote_field_ic, rewrite_in_place, FieldIcFamily, Opcode, PanicReason};

use crate::builtins;
use crate::cycle;
use crate::heap::{builtin_type, GlyphList, GlyphMap, GlyphObject};
use crate::stack::Stack;
use crate::value::Value;

use super::{do_call, full_user_type_id, local_type_id, read_object_field, resolve_callable, resume_fiber, Ctx, RunOutcome};

pub(super) fn run_loop(ctx: &mut Ctx, stack: &mut Stack, pc: &mut usize) -> Result<RunOutcome, crate::error::RuntimeError> {
    loop {
        if ctx.auto_gc && ctx.heap.candidate_count() >= ctx.gc_candidate_threshold {
            cycle::perform_gc(ctx.heap);
        }

        let (op, width) = decode_at(&ctx.chunk.instructions, *pc).map_err(|_| PanicReason::CompileError)?;
        let this_pc = *pc;
        *pc += width;

        match op {
            // ---- Constants & literals ----
            Opcode::ConstOp { dst, idx } | Opcode::TagLiteral { dst, idx } => {
                stack.set(dst, ctx.chunk.constants[idx as usize]);
            }
            Opcode::ConstI8 { dst, imm } => stack.set(dst, Value::float(imm as f64)),
            Opcode::ConstI8Int { dst, imm } => stack.set(dst, Value::integer(imm as i64)),
            Opcode::True { dst } => stack.set(dst, Value::bool(true)),
            Opcode::False { dst } => stack.set(dst, Value::bool(false)),
            Opcode::None { dst } => stack.set(dst, Value::none()),
            Opcode::Tag { dst, sym } => stack.set(dst, Value::symbol(sym)),

            // ---- Moves ----
            Opcode::Copy { dst, src } => stack.set(dst, stack.get(src)),
            Opcode::CopyReleaseDst { dst, src } => {
                let old = stack.get(dst);
                stack.set(dst, stack.get(src));
                ctx.heap.release(old);
            }
            Opcode::CopyRetainSrc { dst, src } => {
                let v = stack.get(src);
                ctx.heap.retain(v);
                stack.set(dst, v);
            }
            Opcode::CopyRetainRelease { dst, src } => {
                let v = stack.get(src);
                ctx.heap.retain(v);
                let old = stack.get(dst);
                stack.set(dst, v);
                ctx.heap.release(old);
            }
            Opcode::Retain { slot } => ctx.heap.retain(stack.get(slot)),
            Opcode::Release { slot } => {
                let v = stack.get(slot);
                ctx.heap.release(v);
                stack.set(slot, Value::none());
            }
            Opcode::ReleaseN { start, count } => {
                for i in 0..count {
                    let v = stack.get(start + i);
                    ctx.heap.release(v);
                    stack.set(start + i, Value::none());
                }
            }

            // ---- Arithmetic (float) ----
            Opcode::Add { dst, a, b } => stack.set(dst, builtins::add(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::Sub { dst, a, b } => stack.set(dst, builtins::sub(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::Mul { dst, a, b } => stack.set(dst, builtins::mul(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::Div { dst, a, b } => stack.set(dst, builtins::div(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::Pow { dst, a, b } => stack.set(dst, builtins::pow(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::Mod { dst, a, b } => stack.set(dst, builtins::modulo(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::Neg { dst, src } => stack.set(dst, builtins::neg(ctx.heap, stack.get(src))?),

            // ---- Typed-integer fast paths ----
            Opcode::AddInt { dst, a, b } => stack.set(dst, builtins::add_int(stack.get(a), stack.get(b))?),
            Opcode::SubInt { dst, a, b } => stack.set(dst, builtins::sub_int(stack.get(a), stack.get(b))?),
            Opcode::LessInt { dst, a, b } => stack.set(dst, builtins::less_int(stack.get(a), stack.get(b))?),

            // ---- Comparison / boolean ----
            Opcode::Compare { dst, a, b } => stack.set(dst, builtins::compare(ctx.heap, stack.get(a), stack.get(b))),
            Opcode::CompareNot { dst, a, b } => stack.set(dst, builtins::compare_not(ctx.heap, stack.get(a), stack.get(b))),
            Opcode::Less { dst, a, b } => stack.set(dst, builtins::less(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::Greater { dst, a, b } => stack.set(dst, builtins::greater(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::LessEqual { dst, a, b } => stack.set(dst, builtins::less_equal(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::GreaterEqual { dst, a, b } => stack.set(dst, builtins::greater_equal(ctx.heap, stack.get(a), stack.get(b))?),
            Opcode::Not { dst, src } => stack.set(dst, builtins::not(stack.get(src))),

            // ---- Bitwise ----
            Opcode::BitwiseAnd { dst, a, b } => stack.set(dst, builtins::bitwise_and(stack.get(a), stack.get(b))?),
            Opcode::BitwiseOr { dst, a, b } => stack.set(dst, builtins::bitwise_or(stack.get(a), stack.get(b))?),
            Opcode::BitwiseXor { dst, a, b } => stack.set(dst, builtins::bitwise_xor(stack.get(a), stack.get(b))?),
            Opcode::BitwiseNot { dst, src } => stack.set(dst, builtins::bitwise_not(stack.get(src))?),
            Opcode::LeftShift { dst, a, b } => stack.set(dst, builtins::left_shift(stack.get(a), stack.get(b))?),
            Opcode::RightShift { dst, a, b } => stack.set(dst, builtins::right_shift(stack.get(a), stack.get(b))?),

            // ---- Control ----
            Opcode::Jump { offset } => *pc = (this_pc as i64 + offset as i64) as usize,
            Opcode::JumpCond { cond, offset } => {
                if builtins::truthy(stack.get(cond)) {
                    *pc = (this_pc as i64 + offset as i64) as usize;
                }
            }
            Opcode::JumpNotCond { cond, offset } => {
                if !builtins::truthy(stack.get(cond)) {
                    *pc = (this_pc as i64 + offset as i64) as usize;
                }
            }
            Opcode::JumpNotNone { src, offset } => {
                if !stack.get(src).is_none() {
                    *pc = (this_pc as i64 + offset as i64) as usize;
                }
            }
            Opcode::Match { src, case_const, offset } => {
                let case = ctx.chunk.constants[case_const as usize];
                if ctx.heap.values_equal(stack.get(src), case) {
                    *pc = (this_pc as i64 + offset as i64) as usize;
                }
            }

            // ---- Calls ----
            Opcode::Call0 { callee, start_local, num_args } => {
                let dst_abs = stack.base() + callee as usize;
                do_call(ctx, stack, pc, stack.get(callee), start_local, num_args, 0, dst_abs, *pc)?;
            }
            Opcode::Call1 { callee, start_local, num_args } => {
                let dst_abs = stack.base() + callee as usize;
                do_call(ctx, stack, pc, stack.get(callee), start_local, num_args, 1, dst_abs, *pc)?;
            }
            Opcode::CallSym { sym, start_local, num_args, num_ret } => {
                let func_val = *ctx
                    .chunk
                    .static_funcs
                    .get(sym as usize)
                    .ok_or(PanicReason::InvalidArgument)?;
                let dst_abs = stack.base() + start_local as usize;
                promote_call_sym(ctx, this_pc, func_val, start_local, num_args, num_ret);
                do_call(ctx, stack, pc, func_val, start_local, num_args, num_ret, dst_abs, *pc)?;
            }
            Opcode::CallFuncIC { func_const, start_local, num_args, num_ret }
            | Opcode::CallNativeFuncIC { func_const, start_local, num_args, num_ret } => {
                let func_val = ctx.chunk.constants[func_const as usize];
                let dst_abs = stack.base() + start_local as usize;
                do_call(ctx, stack, pc, func_val, start_local, num_args, num_ret, dst_abs, *pc)?;
            }
            Opcode::CallObjSym { recv, sym, start_local, num_args, num_ret } => {
                let recv_val = stack.get(recv);
                let ptr = unsafe { recv_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let type_id = unsafe { (*ptr).type_id };
                let func_val = ctx.methods.resolve(type_id, sym).ok_or(PanicReason::InvalidArgument)?;
                let dst_abs = stack.base() + recv as usize;
                promote_call_obj_sym_site(ctx, this_pc, type_id, func_val);
                do_call(ctx, stack, pc, func_val, start_local, num_args, num_ret, dst_abs, *pc)?;
            }
            Opcode::CallObjFuncIC { recv, start_local, num_args, num_ret, ic_type, ic_func }
            | Opcode::CallObjNativeFuncIC { recv, start_local, num_args, num_ret, ic_type, ic_func } => {
                let recv_val = stack.get(recv);
                let ptr = unsafe { recv_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let type_id = unsafe { (*ptr).type_id };
                let dst_abs = stack.base() + recv as usize;
                if local_type_id(type_id) == ic_type {
                    let is_native = matches!(op, Opcode::CallObjNativeFuncIC { .. });
                    if is_native {
                        do_call_native_id(ctx, stack, ic_func as u32, start_local, num_args, num_ret, dst_abs)?;
                    } else {
                        do_call_proto_idx(ctx, stack, pc, ic_func as usize, start_local, num_args, num_ret, dst_abs, *pc)?;
                    }
                } else {
                    deopt_call_obj_ic(&mut ctx.chunk.instructions, this_pc).ok();
                    let sym = method_sym_hint(&ctx.chunk.instructions, this_pc);
                    let func_val = ctx.methods.resolve(type_id, sym).ok_or(PanicReason::InvalidArgument)?;
                    do_call(ctx, stack, pc, func_val, start_local, num_args, num_ret, dst_abs, *pc)?;
                }
            }
            Opcode::Ret0 => {
                let dst = stack.return_destination();
                let (return_pc, was_root) = stack.leave_frame();
                stack.set_abs(dst, Value::none());
                if was_root {
                    return Ok(RunOutcome::Completed(Value::none()));
                }
                *pc = return_pc;
            }
            Opcode::Ret1 => {
                let retval = stack.get(0);
                let dst = stack.return_destination();
                let (return_pc, was_root) = stack.leave_frame();
                stack.set_abs(dst, retval);
                if was_root {
                    return Ok(RunOutcome::Completed(retval));
                }
                *pc = return_pc;
            }

            // ---- Aggregates ----
            Opcode::List { dst, start, count } => {
                let items: Vec<Value> = (0..count).map(|i| stack.get(start + i)).collect();
                let v = ctx.heap.alloc_list(items);
                stack.set(dst, v);
            }
            Opcode::Map { dst, start, count } => {
                let map_val = ctx.heap.alloc_map(count as usize);
                {
                    let ptr = unsafe { map_val.as_ptr() }.unwrap() as *mut GlyphMap;
                    for i in 0..count / 2 {
                        let k = stack.get(start + 2 * i);
                        let v = stack.get(start + 2 * i + 1);
                        builtins::map_insert(ctx.heap, unsafe { &mut *ptr }, k, v);
                    }
                }
                stack.set(dst, map_val);
            }
            Opcode::MapEmpty { dst } => stack.set(dst, ctx.heap.alloc_map(0)),
            Opcode::Object { dst, type_id, start, count } | Opcode::ObjectSmall { dst, type_id, start, count } => {
                let fields: Vec<Value> = (0..count).map(|i| stack.get(start + i)).collect();
                let v = ctx.heap.alloc_object(full_user_type_id(type_id), fields);
                stack.set(dst, v);
            }
            Opcode::SetInitN { dst, start, count } => {
                let dst_val = stack.get(dst);
                let ptr = unsafe { dst_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                match unsafe { (*ptr).type_id } {
                    builtin_type::LIST => {
                        let list = unsafe { &mut *(ptr as *mut GlyphList) };
                        for i in 0..count {
                            list.items.push(stack.get(start + i));
                        }
                    }
                    builtin_type::MAP => {
                        let map = unsafe { &mut *(ptr as *mut GlyphMap) };
                        let mut i = 0;
                        while i + 1 < count {
                            let k = stack.get(start + i);
                            let v = stack.get(start + i + 1);
                            builtins::map_insert(ctx.heap, map, k, v);
                            i += 2;
                        }
                    }
                    _ if unsafe { (*ptr).type_id } >= crate::heap::USER_TYPE_ID_BASE => {
                        let obj = unsafe { &mut *(ptr as *mut GlyphObject) };
                        for i in 0..count {
                            let slot = start as usize + i as usize;
                            if (slot) < obj.fields.len() {
                                obj.fields[slot] = stack.get(start + i);
                            }
                        }
                    }
                    _ => return Err(PanicReason::InvalidArgument.into()),
                }
            }
            Opcode::Index { dst, recv, key } => {
                let v = builtins::index(ctx.heap, stack.get(recv), stack.get(key))?;
                stack.set(dst, v);
            }
            Opcode::ReverseIndex { dst, recv, key } => {
                let v = builtins::reverse_index(ctx.heap, stack.get(recv), stack.get(key))?;
                stack.set(dst, v);
            }
            Opcode::SetIndex { recv, key, val } => {
                builtins::set_index(ctx.heap, stack.get(recv), stack.get(key), stack.get(val))?;
            }
            Opcode::SetIndexRelease { recv, key, val } => {
                builtins::set_index_release(ctx.heap, stack.get(recv), stack.get(key), stack.get(val))?;
            }
            Opcode::Slice { dst, recv, start, end } => {
                let v = builtins::slice(ctx.heap, stack.get(recv), stack.get(start), stack.get(end))?;
                stack.set(dst, v);
            }
            Opcode::Field { dst, recv, field } => {
                let (val, type_id) = read_object_field(stack.get(recv), field)?;
                stack.set(dst, val);
                let ic_offset = field;
                let _ = promote_field_ic(&mut ctx.chunk.instructions, this_pc, FieldIcFamily::Field, local_type_id(type_id), ic_offset);
            }
            Opcode::FieldIC { dst, recv, field, ic_type, ic_offset } => {
                let recv_val = stack.get(recv);
                let ptr = unsafe { recv_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let type_id = unsafe { (*ptr).type_id };
                if local_type_id(type_id) == ic_type {
                    let obj = unsafe { &*(ptr as *mut GlyphObject) };
                    stack.set(dst, *obj.fields.get(ic_offset as usize).ok_or(PanicReason::OutOfBounds)?);
                } else {
                    deopt_field_ic(&mut ctx.chunk.instructions, this_pc, FieldIcFamily::Field).ok();
                    let (val, _) = read_object_field(recv_val, field)?;
                    stack.set(dst, val);
                }
            }
            Opcode::FieldRetain { dst, recv, field } => {
                let (val, type_id) = read_object_field(stack.get(recv), field)?;
                ctx.heap.retain(val);
                stack.set(dst, val);
                let _ = promote_field_ic(&mut ctx.chunk.instructions, this_pc, FieldIcFamily::FieldRetain, local_type_id(type_id), field);
            }
            Opcode::FieldRetainIC { dst, recv, field, ic_type, ic_offset } => {
                let recv_val = stack.get(recv);
                let ptr = unsafe { recv_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let type_id = unsafe { (*ptr).type_id };
                if local_type_id(type_id) == ic_type {
                    let obj = unsafe { &*(ptr as *mut GlyphObject) };
                    let val = *obj.fields.get(ic_offset as usize).ok_or(PanicReason::OutOfBounds)?;
                    ctx.heap.retain(val);
                    stack.set(dst, val);
                } else {
                    deopt_field_ic(&mut ctx.chunk.instructions, this_pc, FieldIcFamily::FieldRetain).ok();
                    let (val, _) = read_object_field(recv_val, field)?;
                    ctx.heap.retain(val);
                    stack.set(dst, val);
                }
            }
            Opcode::FieldRelease { recv, field } => {
                let recv_val = stack.get(recv);
                let ptr = unsafe { recv_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let obj = unsafe { &mut *(ptr as *mut GlyphObject) };
                let slot = obj.fields.get_mut(field as usize).ok_or(PanicReason::OutOfBounds)?;
                let old = *slot;
                *slot = Value::none();
                ctx.heap.release(old);
            }
            Opcode::SetField { recv, field, val } => {
                let recv_val = stack.get(recv);
                let ptr = unsafe { recv_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let obj = unsafe { &mut *(ptr as *mut GlyphObject) };
                *obj.fields.get_mut(field as usize).ok_or(PanicReason::OutOfBounds)? = stack.get(val);
            }
            Opcode::SetFieldRelease { recv, field, val } => {
                let recv_val = stack.get(recv);
                let ptr = unsafe { recv_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let type_id = unsafe { (*ptr).type_id };
                let obj = unsafe { &mut *(ptr as *mut GlyphObject) };
                let slot = obj.fields.get_mut(field as usize).ok_or(PanicReason::OutOfBounds)?;
                let old = *slot;
                *slot = stack.get(val);
                ctx.heap.release(old);
                let _ = promote_field_ic(&mut ctx.chunk.instructions, this_pc, FieldIcFamily::SetFieldRelease, local_type_id(type_id), field);
            }
            Opcode::SetFieldReleaseIC { recv, field, val, ic_type, ic_offset } => {
                let recv_val = stack.get(recv);
                let ptr = unsafe { recv_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let type_id = unsafe { (*ptr).type_id };
                let obj = unsafe { &mut *(ptr as *mut GlyphObject) };
                if local_type_id(type_id) == ic_type {
                    let slot = obj.fields.get_mut(ic_offset as usize).ok_or(PanicReason::OutOfBounds)?;
                    let old = *slot;
                    *slot = stack.get(val);
                    ctx.heap.release(old);
                } else {
                    deopt_field_ic(&mut ctx.chunk.instructions, this_pc, FieldIcFamily::SetFieldRelease).ok();
                    let slot = obj.fields.get_mut(field as usize).ok_or(PanicReason::OutOfBounds)?;
                    let old = *slot;
                    *slot = stack.get(val);
                    ctx.heap.release(old);
                }
            }
            Opcode::StringTemplate { dst, start, count } => {
                let values: Vec<Value> = (0..count).map(|i| stack.get(start + i)).collect();
                let v = builtins::string_template(ctx.heap, &values);
                stack.set(dst, v);
            }

            // ---- Closures & boxes ----
            Opcode::Lambda { dst, func_const } => {
                let idx = ctx.chunk.constants[func_const as usize].as_integer().ok_or(PanicReason::InvalidArgument)? as u64;
                let proto = ctx.chunk.functions[idx as usize];
                let v = ctx.heap.alloc_lambda(idx, proto.param_count);
                stack.set(dst, v);
            }
            Opcode::Closure { dst, func_const, upvalue_start, upvalue_count } => {
                let idx = ctx.chunk.constants[func_const as usize].as_integer().ok_or(PanicReason::InvalidArgument)? as u64;
                let proto = ctx.chunk.functions[idx as usize];
                let upvalues: Vec<Value> = (0..upvalue_count)
                    .map(|i| {
                        let v = stack.get(upvalue_start + i);
                        ctx.heap.retain(v);
                        v
                    })
                    .collect();
                let v = ctx.heap.alloc_closure(idx, proto.param_count, upvalues);
                stack.set(dst, v);
            }
            Opcode::Box { dst, src } => {
                let v = ctx.heap.alloc_box(stack.get(src));
                stack.set(dst, v);
            }
            Opcode::BoxValue { dst, cell } => {
                let ptr = unsafe { stack.get(cell).as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let v = unsafe { (*(ptr as *mut crate::heap::GlyphBox)).value };
                stack.set(dst, v);
            }
            Opcode::BoxValueRetain { dst, cell } => {
                let ptr = unsafe { stack.get(cell).as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let v = unsafe { (*(ptr as *mut crate::heap::GlyphBox)).value };
                ctx.heap.retain(v);
                stack.set(dst, v);
            }
            Opcode::SetBoxValue { cell, val } => {
                let ptr = unsafe { stack.get(cell).as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                unsafe { (*(ptr as *mut crate::heap::GlyphBox)).value = stack.get(val) };
            }
            Opcode::SetBoxValueRelease { cell, val } => {
                let ptr = unsafe { stack.get(cell).as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                let b = unsafe { &mut *(ptr as *mut crate::heap::GlyphBox) };
                let old = b.value;
                b.value = stack.get(val);
                ctx.heap.release(old);
            }

            // ---- Iteration ----
            Opcode::ForRangeInit { start, end, step, offset } => {
                let s = stack.get(start).as_integer().ok_or(PanicReason::InvalidArgument)?;
                let e = stack.get(end).as_integer().ok_or(PanicReason::InvalidArgument)?;
                let target = (this_pc as i64 + offset as i64) as usize;
                let new_op = if s <= e {
                    Opcode::ForRange { counter: start, end, step, offset }
                } else {
                    Opcode::ForRangeReverse { counter: start, end, step, offset }
                };
                rewrite_in_place(&mut ctx.chunk.instructions, target, &new_op).map_err(|_| PanicReason::CompileError)?;
            }
            Opcode::ForRange { counter, end, step, offset } => {
                let c = stack.get(counter).as_integer().ok_or(PanicReason::InvalidArgument)?;
                let e = stack.get(end).as_integer().ok_or(PanicReason::InvalidArgument)?;
                let s = stack.get(step).as_integer().ok_or(PanicReason::InvalidArgument)?;
                let next = c + s;
                if next <= e {
                    stack.set(counter, Value::integer(next));
                    *pc = (this_pc as i64 + offset as i64) as usize;
                }
            }
            Opcode::ForRangeReverse { counter, end, step, offset } => {
                let c = stack.get(counter).as_integer().ok_or(PanicReason::InvalidArgument)?;
                let e = stack.get(end).as_integer().ok_or(PanicReason::InvalidArgument)?;
                let s = stack.get(step).as_integer().ok_or(PanicReason::InvalidArgument)?;
                let next = c - s;
                if next >= e {
                    stack.set(counter, Value::integer(next));
                    *pc = (this_pc as i64 + offset as i64) as usize;
                }
            }

            // ---- Statics ----
            Opcode::StaticFunc { dst, id } => stack.set(dst, ctx.chunk.static_funcs[id as usize]),
            Opcode::StaticVar { dst, id } => stack.set(dst, ctx.chunk.static_vars[id as usize]),
            Opcode::SetStaticFunc { id, src } => {
                let old = ctx.chunk.static_funcs[id as usize];
                ctx.chunk.static_funcs[id as usize] = stack.get(src);
                ctx.heap.release(old);
            }
            Opcode::SetStaticVar { id, src } => {
                let old = ctx.chunk.static_vars[id as usize];
                ctx.chunk.static_vars[id as usize] = stack.get(src);
                ctx.heap.release(old);
            }
            Opcode::Sym { dst, sym } => stack.set(dst, Value::symbol(sym)),

            // ---- Fibers ----
            Opcode::Coinit { dst, func, start_local, num_args } => {
                let func_val = stack.get(func);
                let args: Vec<Value> = (0..num_args).map(|i| stack.get(start_local + i)).collect();
                let fiber = crate::fiber::Fiber::new(crate::chunk::ChunkId(0), stack.capacity(), func_val, args);
                let v = ctx.heap.alloc_fiber(fiber);
                stack.set(dst, v);
            }
            Opcode::Coyield { val } => {
                return Ok(RunOutcome::Yielded(stack.get(val), val));
            }
            Opcode::Coresume { dst, fiber, val } => {
                let fiber_val = stack.get(fiber);
                let ptr = unsafe { fiber_val.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
                if unsafe { (*ptr).type_id } != builtin_type::FIBER {
                    return Err(PanicReason::InvalidArgument.into());
                }
                let fiber_ref = unsafe { &mut *(ptr as *mut crate::fiber::Fiber) };
                if fiber_ref.is_done() {
                    stack.set(dst, Value::none());
                } else {
                    let resume_val = stack.get(val);
                    match resume_fiber(ctx, fiber_ref, resume_val)? {
                        RunOutcome::Yielded(v, _) => stack.set(dst, v),
                        RunOutcome::Completed(v) => stack.set(dst, v),
                    }
                }
            }
            Opcode::Coreturn { val } => {
                return Ok(RunOutcome::Completed(stack.get(val)));
            }

            // ---- Misc ----
            Opcode::TryValue { dst, src } => {
                let v = stack.get(src);
                if v.is_error() {
                    let ret_dst = stack.return_destination();
                    let (return_pc, was_root) = stack.leave_frame();
                    stack.set_abs(ret_dst, v);
                    if was_root {
                        return Ok(RunOutcome::Completed(v));
                    }
                    *pc = return_pc;
                } else {
                    stack.set(dst, v);
                }
            }
            Opcode::End => return Ok(RunOutcome::Completed(Value::none())),
        }
    }
}

/// One-way promotion: a resolved global function call is never
/// polymorphic, so there is no deopt path and a full re-encode (rather
/// than the surgical `promote_call_obj_sym`/`promote_field_ic` byte
/// patches) is safe here.
fn promote_call_sym(ctx: &mut Ctx, pc: usize, func_val: Value, start_local: u8, num_args: u8, num_ret: u8) {
    let const_idx = ctx.chunk.constants.len() as u16;
    let is_native = unsafe { func_val.as_ptr() }
        .map(|p| unsafe { (*p).type_id } == builtin_type::NATIVE_FUNCTION)
        .unwrap_or(false);
    ctx.chunk.constants.push(func_val);
    let new_op = if is_native {
        Opcode::CallNativeFuncIC { func_const: const_idx, start_local, num_args, num_ret }
    } else {
        Opcode::CallFuncIC { func_const: const_idx, start_local, num_args, num_ret }
    };
    let _ = rewrite_in_place(&mut ctx.chunk.instructions, pc, &new_op);
}

/// Promotes a `CallObjSym` site to its IC form, but only when the resolved
/// target carries no upvalues (a bare `Lambda` or a native function): the
/// cache has no slot for captured state, so a `Closure`-backed method stays
/// on the uncached, always-correct path.
fn promote_call_obj_sym_site(ctx: &mut Ctx, pc: usize, type_id: u32, func_val: Value) {
    let Some(fptr) = (unsafe { func_val.as_ptr() }) else { return };
    let ftype = unsafe { (*fptr).type_id };
    let (native, ic_func) = match ftype {
        builtin_type::LAMBDA => (false, unsafe { (*(fptr as *mut crate::heap::GlyphLambda)).func_addr }),
        builtin_type::NATIVE_FUNCTION => (true, unsafe { (*(fptr as *mut crate::heap::GlyphNativeFunction)).native_id as u64 }),
        _ => return,
    };
    let _ = promote_call_obj_sym(&mut ctx.chunk.instructions, pc, native, local_type_id(type_id), ic_func);
}

/// Recovers the `sym` field of a (just-deoptimized) `CallObjSym` instruction
/// at `pc`, to re-resolve the method table after an IC miss.
fn method_sym_hint(buf: &[u8], pc: usize) -> u32 {
    let (op, _) = decode_at(buf, pc).expect("just-deoptimized CallObjSym must decode");
    match op {
        Opcode::CallObjSym { sym, .. } => sym,
        _ => unreachable!("deopt_call_obj_ic always restores CallObjSym"),
    }
}

fn do_call_native_id(
    ctx: &mut Ctx,
    stack: &mut Stack,
    native_id: u32,
    start_local: u8,
    num_args: u8,
    num_ret: u8,
    dst_abs: usize,
) -> Result<(), crate::error::RuntimeError> {
    let args: Vec<Value> = (0..num_args).map(|i| stack.get(start_local + i)).collect();
    let result = ctx.natives.call(native_id, ctx.heap, &args)?;
    if num_ret > 0 {
        stack.set_abs(dst_abs, result);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn do_call_proto_idx(
    ctx: &mut Ctx,
    stack: &mut Stack,
    pc: &mut usize,
    proto_idx: usize,
    start_local: u8,
    num_args: u8,
    num_ret: u8,
    dst_abs: usize,
    return_pc: usize,
) -> Result<(), crate::error::RuntimeError> {
    let proto = ctx.chunk.functions[proto_idx];
    let frame_size = crate::consts::FRAME_HEADER_SIZE + proto.max_locals as usize;
    stack.check_call(start_local, frame_size).map_err(|_| PanicReason::StackOverflow)?;
    stack.enter_frame(start_local, dst_abs, num_ret, false, return_pc);
    *pc = proto.entry_pc;
    let _ = num_args;
    Ok(())
}
