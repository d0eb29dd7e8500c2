//! The embedder-facing VM: wires the heap, stack, method/native tables and
//! dispatch loop together behind a single [`Vm`] handle, the way the
//! teacher's `Interpreter<S>` is the one type embedders construct and drive
//! even though its behaviour is spread across many submodules.
//!
//! A host never touches [`heap::Heap`]/[`stack::Stack`] directly; it loads a
//! compiled [`Chunk`], evaluates it, and otherwise goes through `Vm`'s
//! value-construction, content-query and host-registration methods.

pub mod builtins;
pub mod chunk;
pub mod config;
pub mod consts;
pub mod cycle;
pub mod debug;
pub mod error;
pub mod fiber;
pub mod heap;
pub mod interpreter;
pub mod stack;
pub mod value;

pub use chunk::{Chunk, ChunkId, ChunkValidationError, ConstantData, DebugEntry, FunctionProto, SymbolTable};
pub use config::{VmConfig, VmConfigBuilder};
pub use cycle::GcStats;
pub use error::{FrameInfo, RuntimeError, VmError};
pub use fiber::{Fiber, FiberState};
pub use heap::{builtin_type, Color, Heap, HeapHeader, USER_TYPE_ID_BASE};
pub use interpreter::{Ctx, MethodTable, NativeFn, NativeFnTable, RunOutcome};
pub use stack::{Stack, StackOverflow};
pub use value::Value;

use std::any::Any;

use glyph_asm::PanicReason;

use heap::GlyphList;

/// What a completed [`Vm::eval`] produced. A bare alias rather than a
/// wrapper struct: the root frame's `Ret0`/`Ret1` result *is* the program's
/// result, there is nothing else to carry alongside it.
pub type ProgramResult = Value;

/// Identifies a module for the loader/resolver callbacks and for
/// `register_host_fn`'s `(module, index)` key, mirroring how bytecode
/// addresses host callables by a small integer pair rather than by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// Bumped whenever an `Opcode` variant is added, removed, or has its byte
/// width changed — i.e. whenever a chunk compiled against one version of
/// this crate could fail to decode against another. Independent of
/// `CARGO_PKG_VERSION`, which also moves on changes that don't touch the
/// wire format (bug fixes, new embedder-surface methods, ...).
pub const OPCODE_SET_VERSION: u32 = 1;

/// Returned by [`version`]. Lets an embedder that persists compiled chunks
/// across process restarts check both "which crate build is this" and
/// "is the bytecode format the same one I compiled against".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub crate_version: &'static str,
    pub opcode_set_version: u32,
}

pub fn version() -> VersionInfo {
    VersionInfo { crate_version: env!("CARGO_PKG_VERSION"), opcode_set_version: OPCODE_SET_VERSION }
}

/// A host function registered through [`Vm::register_host_fn`].
pub type HostFn = NativeFn;

/// The long-lived execution engine. One `Vm` owns exactly one [`Heap`] and
/// one root [`Stack`] (see the resource model: heaps and VM instances are
/// in 1:1 correspondence, pointers never cross VMs); chunks loaded into it
/// stay resident for its entire lifetime, since their constant pools are
/// interned into this heap.
pub struct Vm {
    heap: Heap,
    methods: MethodTable,
    natives: NativeFnTable,
    config: VmConfig,
    main_stack: Stack,
    chunks: Vec<Chunk>,
    next_user_type_id: u16,
    user_data: Option<Box<dyn Any>>,
    print_callback: Option<Box<dyn FnMut(&str)>>,
    #[allow(clippy::type_complexity)]
    module_resolver: Option<Box<dyn FnMut(&str) -> Option<ModuleId>>>,
    #[allow(clippy::type_complexity)]
    module_loader: Option<Box<dyn FnMut(ModuleId) -> Result<Chunk, VmError>>>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Vm {
            heap: Heap::new(config.pool_max),
            methods: MethodTable::default(),
            natives: NativeFnTable::default(),
            main_stack: Stack::new(config.stack_capacity),
            config,
            chunks: Vec::new(),
            next_user_type_id: 0,
            user_data: None,
            print_callback: None,
            module_resolver: None,
            module_loader: None,
        }
    }

    pub fn config(&self) -> VmConfig {
        self.config
    }

    /// Resolves `chunk`'s constant pool into live heap values, validates the
    /// result, and takes up permanent residence in this VM. Heap-backed
    /// string constants are interned once here and never released early —
    /// they live for the chunk's entire lifetime, same as its instruction
    /// buffer.
    pub fn load_chunk(&mut self, mut chunk: Chunk) -> Result<ChunkId, VmError> {
        let mut resolved = Vec::with_capacity(chunk.constants_raw.len());
        for c in &chunk.constants_raw {
            let v = match c {
                ConstantData::None => Value::none(),
                ConstantData::Bool(b) => Value::bool(*b),
                ConstantData::Integer(i) => Value::integer(*i),
                ConstantData::Float(f) => Value::float(*f),
                ConstantData::Symbol(id) => Value::symbol(*id),
                ConstantData::StaticAsciiString(id) => Value::static_ascii_string(*id),
                ConstantData::StaticUtf8String(id) => Value::static_utf8_string(*id),
                ConstantData::HeapAsciiString(bytes) => self.heap.alloc_string_ascii(bytes.clone()),
                ConstantData::HeapUtf8String(bytes) => self.heap.alloc_string_utf8(bytes.clone()),
            };
            resolved.push(v);
        }
        chunk.constants = resolved;
        chunk.validate().map_err(|e| VmError::CompileError(e.to_string()))?;
        let id = ChunkId(self.chunks.len() as u32);
        self.chunks.push(chunk);
        Ok(id)
    }

    /// Structural validation only; does not re-resolve constants. Exposed
    /// separately so an embedder can reject a malformed chunk before
    /// spending an allocation pass on it.
    pub fn validate_chunk(&self, chunk: &Chunk) -> Result<(), VmError> {
        chunk.validate().map_err(|e| VmError::CompileError(e.to_string()))
    }

    /// Disassembles `chunk_id`'s current instruction buffer. Reflects
    /// whatever self-modification inline-cache promotion/deopt or
    /// `ForRangeInit` specialization has already applied, since it reads
    /// the live buffer rather than a cached copy from load time.
    pub fn disassemble(&self, chunk_id: ChunkId) -> Result<Vec<debug::DisassembledInstruction>, glyph_asm::DecodeError> {
        debug::disassemble(&self.chunks[chunk_id.0 as usize].instructions)
    }

    /// Runs `chunk_id` from its first instruction on the VM's root fiber.
    /// On a panic, captures a frame trace before releasing every local the
    /// unwind passed through, so a failed evaluation leaves no dangling
    /// references behind for the next `eval` call to trip over.
    pub fn eval(&mut self, chunk_id: ChunkId) -> Result<ProgramResult, VmError> {
        self.eval_with_args(chunk_id, &[])
    }

    pub fn eval_with_args(&mut self, chunk_id: ChunkId, args: &[Value]) -> Result<ProgramResult, VmError> {
        let idx = chunk_id.0 as usize;
        self.main_stack.init_root_frame();
        for (i, &a) in args.iter().enumerate() {
            self.heap.retain(a);
            self.main_stack.set(i as u8, a);
        }
        let mut pc = 0usize;
        let mut ctx = Ctx {
            heap: &mut self.heap,
            chunk: &mut self.chunks[idx],
            methods: &mut self.methods,
            natives: &mut self.natives,
            auto_gc: self.config.auto_gc,
            gc_candidate_threshold: self.config.gc_candidate_threshold,
        };
        match interpreter::run(&mut ctx, &mut self.main_stack, &mut pc) {
            Ok(RunOutcome::Completed(v)) => Ok(v),
            Ok(RunOutcome::Yielded(_, _)) => {
                let frame_trace = capture_frame_trace(&self.main_stack, &self.chunks[idx], pc);
                self.main_stack.unwind_release_all(&mut self.heap);
                Err(VmError::Panic { reason: PanicReason::InvalidArgument, pc, frame_trace })
            }
            Err(RuntimeError::Recoverable(reason)) => {
                let frame_trace = capture_frame_trace(&self.main_stack, &self.chunks[idx], pc);
                self.main_stack.unwind_release_all(&mut self.heap);
                Err(VmError::Panic { reason, pc, frame_trace })
            }
            Err(RuntimeError::Halt(e)) => Err(VmError::Io(e)),
        }
    }

    pub fn run_gc(&mut self) -> GcStats {
        cycle::perform_gc(&mut self.heap)
    }

    #[cfg(feature = "rc-tracking")]
    pub fn global_rc(&self) -> i64 {
        self.heap.global_rc()
    }

    pub fn retain(&mut self, v: Value) {
        self.heap.retain(v);
    }

    pub fn release(&mut self, v: Value) {
        self.heap.release(v);
    }

    /// # Safety
    /// See [`Heap::alloc_bytes`].
    pub unsafe fn alloc_bytes(&mut self, size: usize, align: usize) -> *mut u8 {
        self.heap.alloc_bytes(size, align)
    }

    /// # Safety
    /// See [`Heap::dealloc_bytes`].
    pub unsafe fn free_bytes(&mut self, ptr: *mut u8, size: usize, align: usize) {
        self.heap.dealloc_bytes(ptr, size, align);
    }

    // -- value constructors ------------------------------------------------

    pub fn new_none(&self) -> Value {
        Value::none()
    }

    pub fn new_bool(&self, b: bool) -> Value {
        Value::bool(b)
    }

    pub fn new_integer(&self, i: i64) -> Value {
        Value::integer(i)
    }

    pub fn new_float(&self, f: f64) -> Value {
        Value::float(f)
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        self.heap.alloc_list(items)
    }

    pub fn new_map(&mut self, capacity_hint: usize) -> Value {
        self.heap.alloc_map(capacity_hint)
    }

    pub fn new_string(&mut self, s: &str) -> Value {
        if s.is_ascii() {
            self.heap.alloc_string_ascii(s.as_bytes().into())
        } else {
            self.heap.alloc_string_utf8(s.as_bytes().into())
        }
    }

    pub fn new_raw_string(&mut self, bytes: &[u8]) -> Value {
        self.heap.alloc_raw_string(bytes.into())
    }

    pub fn new_box(&mut self, value: Value) -> Value {
        self.heap.retain(value);
        self.heap.alloc_box(value)
    }

    pub fn new_native_function(&mut self, native_id: u32, param_count: u8) -> Value {
        self.heap.alloc_native_function(native_id, param_count)
    }

    // -- content queries -----------------------------------------------

    pub fn list_len(&self, v: Value) -> Option<usize> {
        let ptr = unsafe { v.as_ptr() }?;
        if unsafe { (*ptr).type_id } != heap::builtin_type::LIST {
            return None;
        }
        Some(unsafe { (*(ptr as *mut GlyphList)).items.len() })
    }

    pub fn list_get(&self, v: Value, index: usize) -> Option<Value> {
        let ptr = unsafe { v.as_ptr() }?;
        if unsafe { (*ptr).type_id } != heap::builtin_type::LIST {
            return None;
        }
        unsafe { (*(ptr as *mut GlyphList)).items.get(index).copied() }
    }

    pub fn map_len(&self, v: Value) -> Option<usize> {
        let ptr = unsafe { v.as_ptr() }?;
        if unsafe { (*ptr).type_id } != heap::builtin_type::MAP {
            return None;
        }
        Some(unsafe { (*(ptr as *mut heap::GlyphMap)).len() })
    }

    pub fn map_get(&self, v: Value, key: Value) -> Option<Value> {
        let ptr = unsafe { v.as_ptr() }?;
        if unsafe { (*ptr).type_id } != heap::builtin_type::MAP {
            return None;
        }
        builtins::map_get(&self.heap, unsafe { &*(ptr as *mut heap::GlyphMap) }, key)
    }

    pub fn string_as_str(&self, v: Value) -> Option<&str> {
        let ptr = unsafe { v.as_ptr() }?;
        unsafe { self.heap.string_contents(ptr) }
    }

    // -- embedder state -------------------------------------------------

    pub fn set_user_data<T: 'static>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn user_data<T: 'static>(&self) -> Option<&T> {
        self.user_data.as_ref().and_then(|d| d.downcast_ref())
    }

    pub fn user_data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut().and_then(|d| d.downcast_mut())
    }

    pub fn set_print_callback(&mut self, cb: impl FnMut(&str) + 'static) {
        self.print_callback = Some(Box::new(cb));
    }

    /// Routes `s` through the registered print callback, falling back to
    /// stdout when the embedder hasn't installed one — the same default the
    /// teacher's own CLI front end relies on when no sink is configured.
    pub fn print(&mut self, s: &str) {
        match &mut self.print_callback {
            Some(cb) => cb(s),
            None => println!("{s}"),
        }
    }

    pub fn set_module_resolver(&mut self, cb: impl FnMut(&str) -> Option<ModuleId> + 'static) {
        self.module_resolver = Some(Box::new(cb));
    }

    pub fn set_module_loader(&mut self, cb: impl FnMut(ModuleId) -> Result<Chunk, VmError> + 'static) {
        self.module_loader = Some(Box::new(cb));
    }

    pub fn resolve_module(&mut self, name: &str) -> Option<ModuleId> {
        self.module_resolver.as_mut().and_then(|cb| cb(name))
    }

    pub fn load_module(&mut self, id: ModuleId) -> Option<Result<Chunk, VmError>> {
        self.module_loader.as_mut().map(|cb| cb(id))
    }

    pub fn register_host_fn(&mut self, _module: ModuleId, _index: u32, f: HostFn) -> u32 {
        self.natives.register(f)
    }

    pub fn register_method(&mut self, type_id: u32, sym: u32, callable: Value) {
        self.methods.register_method(type_id, sym, callable);
    }

    /// Allocates the next available user type id, for an embedder defining
    /// a new host-backed struct shape. Mirrors `GlyphObject::type_id`'s
    /// `USER_TYPE_ID_BASE`-relative convention.
    pub fn register_host_type(&mut self) -> u32 {
        let local = self.next_user_type_id;
        self.next_user_type_id += 1;
        USER_TYPE_ID_BASE + local as u32
    }

    pub fn register_static_var(&mut self, chunk_id: ChunkId, id: u16, value: Value) {
        self.chunks[chunk_id.0 as usize].static_vars[id as usize] = value;
    }

    /// Renders a `VmError` the way a CLI front end would print it to the
    /// user: no separate "free the message" step is needed since the
    /// returned `String` is owned outright, unlike the C-ABI embedding
    /// surface this crate's Rust API deliberately doesn't expose.
    pub fn format_error_report(&self, err: &VmError) -> String {
        match err {
            VmError::Panic { reason, pc, frame_trace } => {
                let mut out = format!("panic: {reason} at pc={pc}");
                for frame in frame_trace {
                    let name = frame.function_name.as_deref().unwrap_or("<unknown>");
                    match frame.line {
                        Some(line) => out.push_str(&format!("\n  at {name} (pc={}, line {line})", frame.pc)),
                        None => out.push_str(&format!("\n  at {name} (pc={})", frame.pc)),
                    }
                }
                out
            }
            other => other.to_string(),
        }
    }
}

/// Walks the stack's frame chain from the currently-executing frame down to
/// the root, recording one [`FrameInfo`] per level. `function_name` is
/// always `None`: the symbol table tracks field/method/static names, not a
/// pc-range-to-function-name table, so there is nothing to look up here
/// without inventing one.
fn capture_frame_trace(stack: &Stack, chunk: &Chunk, current_pc: usize) -> Vec<FrameInfo> {
    let mut trace = vec![FrameInfo { pc: current_pc, function_name: None, line: line_for_pc(chunk, current_pc) }];
    let mut fp = stack.base();
    loop {
        let (return_pc, return_fp, is_root) = stack.peek_frame_at(fp);
        if is_root {
            break;
        }
        trace.push(FrameInfo { pc: return_pc, function_name: None, line: line_for_pc(chunk, return_pc) });
        fp = return_fp;
    }
    trace
}

fn line_for_pc(chunk: &Chunk, pc: usize) -> Option<u32> {
    chunk.debug_info.iter().find(|e| e.pc_start <= pc && pc < e.pc_end).map(|e| e.line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glyph_asm::{encode, Opcode};

    fn script(instructions: Vec<u8>) -> Chunk {
        Chunk {
            constants_raw: vec![ConstantData::Integer(41)],
            constants: vec![],
            instructions,
            functions: vec![],
            symbols: SymbolTable::default(),
            debug_info: vec![],
            static_vars: vec![],
            static_funcs: vec![],
        }
    }

    #[test]
    fn eval_runs_a_trivial_script_to_completion() {
        let mut vm = Vm::new(VmConfig::default());
        let mut buf = Vec::new();
        encode(&Opcode::ConstOp { dst: 0, idx: 0 }, &mut buf);
        encode(&Opcode::AddInt { dst: 0, a: 0, b: 0 }, &mut buf);
        encode(&Opcode::Ret1, &mut buf);
        let id = vm.load_chunk(script(buf)).unwrap();
        let result = vm.eval(id).unwrap();
        assert_eq!(result.as_integer(), Some(82));
    }

    #[test]
    fn eval_propagates_a_panic_with_a_frame_trace() {
        let mut vm = Vm::new(VmConfig::default());
        // `Index`ing an integer receiver is not a valid operation, so this
        // panics with `InvalidArgument` as soon as it runs, exercising the
        // unwind-and-capture path.
        let mut buf = Vec::new();
        encode(&Opcode::ConstOp { dst: 0, idx: 0 }, &mut buf);
        encode(&Opcode::Index { dst: 1, recv: 0, key: 0 }, &mut buf);
        encode(&Opcode::Ret1, &mut buf);
        let id = vm.load_chunk(script(buf)).unwrap();
        let err = vm.eval(id).unwrap_err();
        assert!(matches!(err, VmError::Panic { .. }));
    }

    #[test]
    fn user_data_round_trips_by_type() {
        let mut vm = Vm::new(VmConfig::default());
        vm.set_user_data(42u32);
        assert_eq!(vm.user_data::<u32>(), Some(&42));
        assert_eq!(vm.user_data::<String>(), None);
    }

    #[test]
    fn version_reports_crate_and_opcode_set_versions() {
        let v = version();
        assert_eq!(v.crate_version, env!("CARGO_PKG_VERSION"));
        assert_eq!(v.opcode_set_version, OPCODE_SET_VERSION);
    }

    #[test]
    fn disassemble_reflects_the_loaded_chunk() {
        let mut vm = Vm::new(VmConfig::default());
        let mut buf = Vec::new();
        encode(&Opcode::ConstOp { dst: 0, idx: 0 }, &mut buf);
        encode(&Opcode::Ret1, &mut buf);
        let id = vm.load_chunk(script(buf)).unwrap();
        let instrs = vm.disassemble(id).unwrap();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].mnemonic, "ConstOp");
        assert_eq!(instrs[1].mnemonic, "Ret1");
    }
}
