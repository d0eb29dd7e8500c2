//! The compiled artifact a front-end hands the VM: constant pool,
//! instruction buffer, function/symbol tables and debug info.
//!
//! A `Chunk` is produced once by an external compiler and is otherwise
//! read-only — except for its instruction buffer, which the interpreter
//! rewrites in place for inline-cache promotion/deopt and `ForRangeInit`
//! loop specialization (see the runtime's design notes on self-modifying
//! dispatch). `instructions` is therefore a plain `Vec<u8>`, not behind a
//! shared/`Arc` reference, matching the single-threaded, single-owner
//! execution model.

use glyph_asm::{decode_at, DecodeError, Opcode};

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u32);

/// A constant-pool entry as produced by the compiler, before the VM
/// resolves heap-backed variants into live `Value`s at load time. Bit
/// patterns for heap constants can't survive serialization, so the wire
/// format carries their *content* instead and `Vm::load_chunk` allocates
/// them once into the VM's heap (after which they live for the chunk's
/// entire lifetime — interned, never released early).
#[derive(Debug, Clone)]
pub enum ConstantData {
    None,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Symbol(u32),
    StaticAsciiString(u32),
    StaticUtf8String(u32),
    HeapAsciiString(Box<[u8]>),
    HeapUtf8String(Box<[u8]>),
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionProto {
    /// Byte offset into `Chunk::instructions` of the function's first
    /// instruction.
    pub entry_pc: usize,
    /// Upper bound on local-slot usage the compiler computed for this
    /// function, used for the stack-overflow check at call time.
    pub max_locals: u8,
    pub param_count: u8,
    pub is_native: bool,
}

/// Method/field/static-variable/static-function name tables, indexed by
/// the ids bytecode operands carry (`SymId`, `FieldId`, `StaticId`).
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub methods: Vec<String>,
    pub fields: Vec<String>,
    pub static_vars: Vec<String>,
    pub static_funcs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DebugEntry {
    pub pc_start: usize,
    pub pc_end: usize,
    pub line: u32,
    pub mnemonic: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkValidationError {
    ConstantIndexOutOfRange { idx: u16, pool_len: usize },
    StaticIndexOutOfRange { id: u16 },
    JumpTargetOutOfRange { offset: usize },
    Decode(DecodeError),
}

impl core::fmt::Display for ChunkValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ConstantIndexOutOfRange { idx, pool_len } => {
                write!(f, "constant index {idx} out of range (pool has {pool_len} entries)")
            }
            Self::StaticIndexOutOfRange { id } => write!(f, "static index {id} out of range"),
            Self::JumpTargetOutOfRange { offset } => write!(f, "jump target {offset} out of range"),
            Self::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ChunkValidationError {}

/// A compiled module: constant pool, instruction stream, and the symbol
/// tables/debug info needed to interpret it. `constants_raw` is retained
/// for reference (e.g. re-serialization tests) but execution only ever
/// reads `constants`.
pub struct Chunk {
    pub constants_raw: Vec<ConstantData>,
    pub constants: Vec<Value>,
    pub instructions: Vec<u8>,
    pub functions: Vec<FunctionProto>,
    pub symbols: SymbolTable,
    pub debug_info: Vec<DebugEntry>,
    /// Initial values for `StaticVar`/`StaticFunc` slots; mutated in place
    /// by `SetStaticVar`/`SetStaticFunc` during execution.
    pub static_vars: Vec<Value>,
    pub static_funcs: Vec<Value>,
}

impl Chunk {
    /// Structural validation independent of the heap: every constant/static
    /// index an instruction references is in bounds, and every jump lands
    /// inside the instruction buffer. Does not check that jump targets fall
    /// on an instruction boundary (a malformed compiler could point mid-
    /// instruction; the dispatch loop's own `decode_at` call will then fail
    /// at runtime) — that check would require decoding the whole buffer
    /// into a boundary set first, more work than this op-by-op pass needs
    /// to catch the bounds violations that matter for memory safety.
    pub fn validate(&self) -> Result<(), ChunkValidationError> {
        let mut pc = 0usize;
        while pc < self.instructions.len() {
            let (op, width) = decode_at(&self.instructions, pc).map_err(ChunkValidationError::Decode)?;
            self.validate_op(&op, pc)?;
            pc += width;
        }
        Ok(())
    }

    fn validate_op(&self, op: &Opcode, pc: usize) -> Result<(), ChunkValidationError> {
        let check_const = |idx: u16| -> Result<(), ChunkValidationError> {
            if (idx as usize) < self.constants.len() {
                Ok(())
            } else {
                Err(ChunkValidationError::ConstantIndexOutOfRange { idx, pool_len: self.constants.len() })
            }
        };
        let check_jump = |offset: i16| -> Result<(), ChunkValidationError> {
            let target = pc as i64 + offset as i64;
            if target >= 0 && (target as usize) <= self.instructions.len() {
                Ok(())
            } else {
                Err(ChunkValidationError::JumpTargetOutOfRange { offset: target.max(0) as usize })
            }
        };
        match *op {
            Opcode::ConstOp { idx, .. } | Opcode::TagLiteral { idx, .. } => check_const(idx)?,
            Opcode::Match { case_const, offset, .. } => {
                check_const(case_const)?;
                check_jump(offset)?;
            }
            Opcode::Jump { offset } => check_jump(offset)?,
            Opcode::JumpCond { offset, .. } | Opcode::JumpNotCond { offset, .. } | Opcode::JumpNotNone { offset, .. } => {
                check_jump(offset)?;
            }
            Opcode::ForRangeInit { offset, .. } | Opcode::ForRange { offset, .. } | Opcode::ForRangeReverse { offset, .. } => {
                check_jump(offset)?;
            }
            Opcode::CallFuncIC { func_const, .. } | Opcode::CallNativeFuncIC { func_const, .. } => check_const(func_const)?,
            Opcode::Lambda { func_const, .. } | Opcode::Closure { func_const, .. } => check_const(func_const)?,
            Opcode::StaticFunc { id, .. } | Opcode::SetStaticFunc { id, .. } => {
                if (id as usize) >= self.static_funcs.len() {
                    return Err(ChunkValidationError::StaticIndexOutOfRange { id });
                }
            }
            Opcode::StaticVar { id, .. } | Opcode::SetStaticVar { id, .. } => {
                if (id as usize) >= self.static_vars.len() {
                    return Err(ChunkValidationError::StaticIndexOutOfRange { id });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glyph_asm::encode;

    fn empty_chunk(instructions: Vec<u8>) -> Chunk {
        Chunk {
            constants_raw: vec![],
            constants: vec![Value::integer(7)],
            instructions,
            functions: vec![],
            symbols: SymbolTable::default(),
            debug_info: vec![],
            static_vars: vec![Value::none()],
            static_funcs: vec![],
        }
    }

    #[test]
    fn validate_accepts_in_range_constant() {
        let mut buf = Vec::new();
        encode(&Opcode::ConstOp { dst: 0, idx: 0 }, &mut buf);
        encode(&Opcode::End, &mut buf);
        assert!(empty_chunk(buf).validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_constant() {
        let mut buf = Vec::new();
        encode(&Opcode::ConstOp { dst: 0, idx: 5 }, &mut buf);
        encode(&Opcode::End, &mut buf);
        assert_eq!(
            empty_chunk(buf).validate(),
            Err(ChunkValidationError::ConstantIndexOutOfRange { idx: 5, pool_len: 1 })
        );
    }

    #[test]
    fn validate_rejects_out_of_range_jump() {
        let mut buf = Vec::new();
        encode(&Opcode::Jump { offset: 1000 }, &mut buf);
        assert!(matches!(empty_chunk(buf).validate(), Err(ChunkValidationError::JumpTargetOutOfRange { .. })));
    }

    #[test]
    fn validate_rejects_out_of_range_static() {
        let mut buf = Vec::new();
        encode(&Opcode::StaticVar { dst: 0, id: 9 }, &mut buf);
        encode(&Opcode::End, &mut buf);
        assert_eq!(empty_chunk(buf).validate(), Err(ChunkValidationError::StaticIndexOutOfRange { id: 9 }));
    }
}
