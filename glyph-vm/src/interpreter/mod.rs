//! The bytecode dispatch loop and the call/return/fiber machinery around it.
//!
//! Mirrors the split in the teacher's own `interpreter` module: this file
//! owns frame/call bookkeeping and the pieces shared across opcode
//! families, [`dispatch`] owns the big per-opcode match.

mod dispatch;

use std::collections::HashMap;

use glyph_asm::{FieldIcFamily, PanicReason};

use crate::chunk::{Chunk, FunctionProto};
use crate::error::RuntimeError;
use crate::fiber::{Fiber, FiberState};
use crate::heap::{builtin_type, GlyphClosure, GlyphLambda, GlyphNativeFunction, GlyphObject, Heap, USER_TYPE_ID_BASE};
use crate::stack::Stack;
use crate::value::Value;

/// A Rust closure registered through `Vm::register_host_fn`. Takes the
/// already-fetched argument values and the heap they (and the result) are
/// allocated from.
pub type NativeFn = Box<dyn FnMut(&mut Heap, &[Value]) -> Result<Value, RuntimeError>>;

/// Host functions reachable from bytecode via `GlyphNativeFunction::native_id`.
#[derive(Default)]
pub struct NativeFnTable {
    fns: Vec<NativeFn>,
}

impl NativeFnTable {
    pub fn register(&mut self, f: NativeFn) -> u32 {
        let id = self.fns.len() as u32;
        self.fns.push(f);
        id
    }

    fn call(&mut self, id: u32, heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
        self.fns[id as usize](heap, args)
    }
}

/// `(receiver type_id, method symbol id) -> callable`, populated by the
/// front end's type registration and by `Vm::register_host_type`. Backs
/// `CallObjSym` resolution; there is no per-type vtable struct since method
/// sets are opened dynamically by the embedder, not fixed at compile time.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<(u32, u32), Value>,
}

impl MethodTable {
    pub fn register_method(&mut self, type_id: u32, sym: u32, callable: Value) {
        self.methods.insert((type_id, sym), callable);
    }

    fn resolve(&self, type_id: u32, sym: u32) -> Option<Value> {
        self.methods.get(&(type_id, sym)).copied()
    }
}

/// Everything the dispatch loop needs besides the stack it's currently
/// running on (the running stack may belong to a fiber rather than the
/// root, so it's threaded through call arguments instead of living here).
pub struct Ctx<'a> {
    pub heap: &'a mut Heap,
    pub chunk: &'a mut Chunk,
    pub methods: &'a mut MethodTable,
    pub natives: &'a mut NativeFnTable,
    pub auto_gc: bool,
    pub gc_candidate_threshold: usize,
}

/// Result of running a fiber's stack until it can't proceed without
/// outside help.
pub enum RunOutcome {
    /// The fiber's root frame returned (`Ret0`/`Ret1`) or it hit `End`.
    Completed(Value),
    /// `Coyield` suspended the fiber; `slot` is where the resumed value
    /// must be written back on the next `Coresume`.
    Yielded(Value, u8),
}

/// Runs `stack`/`pc` until completion or suspension. The public entry point
/// `Vm::eval` calls this directly on the root fiber's stack; `Coresume`
/// calls it recursively on the target fiber's own stack.
pub fn run(ctx: &mut Ctx, stack: &mut Stack, pc: &mut usize) -> Result<RunOutcome, RuntimeError> {
    dispatch::run_loop(ctx, stack, pc)
}

/// A resolved call target: either a chunk-local function (lambda or
/// closure, upvalues already copied out) or a host callback.
enum CallTarget {
    Bytecode { proto: FunctionProto, upvalues: Vec<Value> },
    Native { native_id: u32 },
}

fn resolve_callable(ctx: &Ctx, callee: Value) -> Result<CallTarget, RuntimeError> {
    let ptr = unsafe { callee.as_ptr() }.ok_or(RuntimeError::Recoverable(PanicReason::InvalidArgument))?;
    let type_id = unsafe { (*ptr).type_id };
    match type_id {
        builtin_type::LAMBDA => {
            let l = unsafe { &*(ptr as *mut GlyphLambda) };
            let proto = ctx.chunk.functions[l.func_addr as usize];
            Ok(CallTarget::Bytecode { proto, upvalues: Vec::new() })
        }
        builtin_type::CLOSURE => {
            let c = unsafe { &*(ptr as *mut GlyphClosure) };
            let proto = ctx.chunk.functions[c.func_addr as usize];
            Ok(CallTarget::Bytecode { proto, upvalues: c.upvalues.clone() })
        }
        builtin_type::NATIVE_FUNCTION => {
            let n = unsafe { &*(ptr as *mut GlyphNativeFunction) };
            Ok(CallTarget::Native { native_id: n.native_id })
        }
        _ => Err(RuntimeError::Recoverable(PanicReason::InvalidArgument)),
    }
}

/// `local_type_id`/`USER_TYPE_ID_BASE` round-trip exactly for user types
/// (bytecode operands already carry the local 16-bit id; `GlyphObject`'s
/// header stores the full `USER_TYPE_ID_BASE`-offset id), and built-in type
/// ids (1..=17) fit directly — the two halves of the space never collide at
/// a single call site since a given expression's static receiver type is
/// either always a built-in or always a user type.
fn local_type_id(type_id: u32) -> u16 {
    if type_id >= USER_TYPE_ID_BASE {
        (type_id - USER_TYPE_ID_BASE) as u16
    } else {
        type_id as u16
    }
}

fn full_user_type_id(local: u16) -> u32 {
    USER_TYPE_ID_BASE + local as u32
}

/// Begins a call: resolves `func_val`, pushes a frame (bytecode target) or
/// executes synchronously (native target), and writes the result to
/// `dst_abs` for natives / zero-arg bytecode returns. For bytecode targets,
/// `*pc` is redirected to the callee's entry point and the frame's own
/// `Ret0`/`Ret1` will eventually restore it.
#[allow(clippy::too_many_arguments)]
fn do_call(
    ctx: &mut Ctx,
    stack: &mut Stack,
    pc: &mut usize,
    func_val: Value,
    start_local: u8,
    num_args: u8,
    num_ret: u8,
    dst_abs: usize,
    return_pc: usize,
) -> Result<(), RuntimeError> {
    match resolve_callable(ctx, func_val)? {
        CallTarget::Native { native_id } => {
            let args: Vec<Value> = (0..num_args).map(|i| stack.get(start_local + i)).collect();
            let result = ctx.natives.call(native_id, ctx.heap, &args)?;
            if num_ret > 0 {
                stack.set_abs(dst_abs, result);
            }
            Ok(())
        }
        CallTarget::Bytecode { proto, upvalues } => {
            let frame_size = crate::consts::FRAME_HEADER_SIZE + proto.max_locals as usize;
            stack
                .check_call(start_local, frame_size)
                .map_err(|_| RuntimeError::Recoverable(PanicReason::StackOverflow))?;
            stack.enter_frame(start_local, dst_abs, num_ret, false, return_pc);
            for (i, up) in upvalues.into_iter().enumerate() {
                ctx.heap.retain(up);
                stack.set(proto.param_count + i as u8, up);
            }
            *pc = proto.entry_pc;
            Ok(())
        }
    }
}

/// Reads `recv.field`, returning the value and `recv`'s own `type_id` (the
/// latter only meaningful for opportunistic inline-cache promotion by the
/// caller).
fn read_object_field(recv: Value, field: u16) -> Result<(Value, u32), PanicReason> {
    let ptr = unsafe { recv.as_ptr() }.ok_or(PanicReason::InvalidArgument)?;
    let type_id = unsafe { (*ptr).type_id };
    if type_id < USER_TYPE_ID_BASE {
        return Err(PanicReason::InvalidArgument);
    }
    let obj = unsafe { &*(ptr as *mut GlyphObject) };
    obj.fields.get(field as usize).copied().map(|v| (v, type_id)).ok_or(PanicReason::OutOfBounds)
}

/// Resumes a fiber (first activation from `Init`, or continuation from
/// `Paused`) until it yields or completes.
fn resume_fiber(ctx: &mut Ctx, fiber: &mut Fiber, resume_val: Value) -> Result<RunOutcome, RuntimeError> {
    match fiber.state {
        FiberState::Init => {
            let (func, args) = fiber.pending_call.take().expect("Init fiber always carries a pending call");
            fiber.stack.init_root_frame();
            for (i, a) in args.into_iter().enumerate() {
                fiber.stack.set(i as u8, a);
            }
            match resolve_callable(ctx, func)? {
                CallTarget::Bytecode { proto, upvalues } => {
                    fiber.pc = proto.entry_pc;
                    for (i, up) in upvalues.into_iter().enumerate() {
                        ctx.heap.retain(up);
                        fiber.stack.set(proto.param_count + i as u8, up);
                    }
                }
                CallTarget::Native { .. } => return Err(RuntimeError::Recoverable(PanicReason::InvalidArgument)),
            }
            fiber.state = FiberState::Exec;
        }
        FiberState::Paused => {
            if let Some(slot) = fiber.resume_slot.take() {
                fiber.stack.set(slot, resume_val);
            }
            fiber.state = FiberState::Exec;
        }
        FiberState::Exec | FiberState::Done => {
            return Err(RuntimeError::Recoverable(PanicReason::InvalidArgument));
        }
    }
    let outcome = match run(ctx, &mut fiber.stack, &mut fiber.pc) {
        Ok(outcome) => outcome,
        Err(err @ RuntimeError::Recoverable(_)) => {
            fiber.stack.unwind_release_all(ctx.heap);
            fiber.state = FiberState::Done;
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    match &outcome {
        RunOutcome::Yielded(_, slot) => {
            fiber.resume_slot = Some(*slot);
            fiber.state = FiberState::Paused;
        }
        RunOutcome::Completed(_) => {
            fiber.state = FiberState::Done;
        }
    }
    Ok(outcome)
}
