//! Little-endian encode/decode between [`Opcode`] and a raw instruction
//! buffer.
//!
//! Every opcode has a fixed byte width (see [`Opcode::width`]); decoding
//! never needs to look ahead further than that width, and encoding never
//! produces a different width than `op.width()` reports — a property
//! inline-cache promotion/deopt relies on to rewrite a site without
//! disturbing surrounding instructions.

use crate::opcode::Opcode;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Failure decoding an instruction from a raw buffer.
pub enum DecodeError {
    /// The buffer ended before a full instruction could be read.
    Truncated,
    /// The tag byte does not correspond to any known opcode.
    UnknownOpcode(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "instruction truncated"),
            Self::UnknownOpcode(tag) => write!(f, "unknown opcode tag {tag:#04x}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

#[inline]
fn u8_at(b: &[u8], i: usize) -> Result<u8, DecodeError> {
    b.get(i).copied().ok_or(DecodeError::Truncated)
}

#[inline]
fn u16_at(b: &[u8], i: usize) -> Result<u16, DecodeError> {
    let hi = u8_at(b, i + 1)?;
    let lo = u8_at(b, i)?;
    Ok(u16::from_le_bytes([lo, hi]))
}

#[inline]
fn i16_at(b: &[u8], i: usize) -> Result<i16, DecodeError> {
    Ok(u16_at(b, i)? as i16)
}

#[inline]
fn u32_at(b: &[u8], i: usize) -> Result<u32, DecodeError> {
    let mut bytes = [0u8; 4];
    for (k, slot) in bytes.iter_mut().enumerate() {
        *slot = u8_at(b, i + k)?;
    }
    Ok(u32::from_le_bytes(bytes))
}

/// Read the low 48 bits of a `u64`, stored as 6 little-endian bytes.
#[inline]
fn u48_at(b: &[u8], i: usize) -> Result<u64, DecodeError> {
    let mut bytes = [0u8; 8];
    for (k, slot) in bytes.iter_mut().enumerate().take(6) {
        *slot = u8_at(b, i + k)?;
    }
    Ok(u64::from_le_bytes(bytes))
}

/// Decode a single instruction starting at `offset` in `buf`.
///
/// Returns the decoded [`Opcode`] and the number of bytes consumed
/// (`== opcode.width()`), so callers advance `pc` by the returned length.
pub fn decode_at(buf: &[u8], offset: usize) -> Result<(Opcode, usize), DecodeError> {
    let tag = u8_at(buf, offset)?;
    let p = offset + 1;
    let op = match tag {
        0 => Opcode::ConstOp { dst: u8_at(buf, p)?, idx: u16_at(buf, p + 1)? },
        1 => Opcode::ConstI8 { dst: u8_at(buf, p)?, imm: u8_at(buf, p + 1)? },
        2 => Opcode::ConstI8Int { dst: u8_at(buf, p)?, imm: u8_at(buf, p + 1)? as i8 },
        3 => Opcode::True { dst: u8_at(buf, p)? },
        4 => Opcode::False { dst: u8_at(buf, p)? },
        5 => Opcode::None { dst: u8_at(buf, p)? },
        6 => Opcode::Tag { dst: u8_at(buf, p)?, sym: u32_at(buf, p + 1)? },
        7 => Opcode::TagLiteral { dst: u8_at(buf, p)?, idx: u16_at(buf, p + 1)? },
        8 => Opcode::Copy { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        9 => Opcode::CopyReleaseDst { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        10 => Opcode::CopyRetainSrc { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        11 => Opcode::CopyRetainRelease { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        12 => Opcode::Retain { slot: u8_at(buf, p)? },
        13 => Opcode::Release { slot: u8_at(buf, p)? },
        14 => Opcode::ReleaseN { start: u8_at(buf, p)?, count: u8_at(buf, p + 1)? },
        15 => Opcode::Add { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        16 => Opcode::Sub { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        17 => Opcode::Mul { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        18 => Opcode::Div { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        19 => Opcode::Pow { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        20 => Opcode::Mod { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        21 => Opcode::Neg { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        22 => Opcode::AddInt { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        23 => Opcode::SubInt { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        24 => Opcode::LessInt { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        25 => Opcode::Compare { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        26 => Opcode::CompareNot { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        27 => Opcode::Less { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        28 => Opcode::Greater { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        29 => Opcode::LessEqual { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        30 => Opcode::GreaterEqual { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        31 => Opcode::Not { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        32 => Opcode::BitwiseAnd { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        33 => Opcode::BitwiseOr { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        34 => Opcode::BitwiseXor { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        35 => Opcode::BitwiseNot { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        36 => Opcode::LeftShift { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        37 => Opcode::RightShift { dst: u8_at(buf, p)?, a: u8_at(buf, p + 1)?, b: u8_at(buf, p + 2)? },
        38 => Opcode::Jump { offset: i16_at(buf, p)? },
        39 => Opcode::JumpCond { cond: u8_at(buf, p)?, offset: i16_at(buf, p + 1)? },
        40 => Opcode::JumpNotCond { cond: u8_at(buf, p)?, offset: i16_at(buf, p + 1)? },
        41 => Opcode::JumpNotNone { src: u8_at(buf, p)?, offset: i16_at(buf, p + 1)? },
        42 => Opcode::Match { src: u8_at(buf, p)?, case_const: u16_at(buf, p + 1)?, offset: i16_at(buf, p + 3)? },
        43 => Opcode::Call0 { callee: u8_at(buf, p)?, start_local: u8_at(buf, p + 1)?, num_args: u8_at(buf, p + 2)? },
        44 => Opcode::Call1 { callee: u8_at(buf, p)?, start_local: u8_at(buf, p + 1)?, num_args: u8_at(buf, p + 2)? },
        45 => Opcode::CallSym {
            sym: u32_at(buf, p)?,
            start_local: u8_at(buf, p + 4)?,
            num_args: u8_at(buf, p + 5)?,
            num_ret: u8_at(buf, p + 6)?,
        },
        46 => Opcode::CallObjSym {
            recv: u8_at(buf, p)?,
            sym: u32_at(buf, p + 1)?,
            start_local: u8_at(buf, p + 5)?,
            num_args: u8_at(buf, p + 6)?,
            num_ret: u8_at(buf, p + 7)?,
        },
        47 => Opcode::CallFuncIC {
            func_const: u16_at(buf, p)?,
            start_local: u8_at(buf, p + 2)?,
            num_args: u8_at(buf, p + 3)?,
            num_ret: u8_at(buf, p + 4)?,
        },
        48 => Opcode::CallNativeFuncIC {
            func_const: u16_at(buf, p)?,
            start_local: u8_at(buf, p + 2)?,
            num_args: u8_at(buf, p + 3)?,
            num_ret: u8_at(buf, p + 4)?,
        },
        49 => Opcode::CallObjFuncIC {
            recv: u8_at(buf, p)?,
            start_local: u8_at(buf, p + 5)?,
            num_args: u8_at(buf, p + 6)?,
            num_ret: u8_at(buf, p + 7)?,
            ic_type: u16_at(buf, p + 8)?,
            ic_func: u48_at(buf, p + 10)?,
        },
        50 => Opcode::CallObjNativeFuncIC {
            recv: u8_at(buf, p)?,
            start_local: u8_at(buf, p + 5)?,
            num_args: u8_at(buf, p + 6)?,
            num_ret: u8_at(buf, p + 7)?,
            ic_type: u16_at(buf, p + 8)?,
            ic_func: u48_at(buf, p + 10)?,
        },
        51 => Opcode::Ret0,
        52 => Opcode::Ret1,
        53 => Opcode::List { dst: u8_at(buf, p)?, start: u8_at(buf, p + 1)?, count: u8_at(buf, p + 2)? },
        54 => Opcode::Map { dst: u8_at(buf, p)?, start: u8_at(buf, p + 1)?, count: u8_at(buf, p + 2)? },
        55 => Opcode::MapEmpty { dst: u8_at(buf, p)? },
        56 => Opcode::Object {
            dst: u8_at(buf, p)?,
            type_id: u16_at(buf, p + 1)?,
            start: u8_at(buf, p + 3)?,
            count: u8_at(buf, p + 4)?,
        },
        57 => Opcode::ObjectSmall {
            dst: u8_at(buf, p)?,
            type_id: u16_at(buf, p + 1)?,
            start: u8_at(buf, p + 3)?,
            count: u8_at(buf, p + 4)?,
        },
        58 => Opcode::SetInitN { dst: u8_at(buf, p)?, start: u8_at(buf, p + 1)?, count: u8_at(buf, p + 2)? },
        59 => Opcode::Index { dst: u8_at(buf, p)?, recv: u8_at(buf, p + 1)?, key: u8_at(buf, p + 2)? },
        60 => Opcode::ReverseIndex { dst: u8_at(buf, p)?, recv: u8_at(buf, p + 1)?, key: u8_at(buf, p + 2)? },
        61 => Opcode::SetIndex { recv: u8_at(buf, p)?, key: u8_at(buf, p + 1)?, val: u8_at(buf, p + 2)? },
        62 => Opcode::SetIndexRelease { recv: u8_at(buf, p)?, key: u8_at(buf, p + 1)?, val: u8_at(buf, p + 2)? },
        63 => Opcode::Slice {
            dst: u8_at(buf, p)?,
            recv: u8_at(buf, p + 1)?,
            start: u8_at(buf, p + 2)?,
            end: u8_at(buf, p + 3)?,
        },
        64 => Opcode::Field { dst: u8_at(buf, p)?, recv: u8_at(buf, p + 1)?, field: u16_at(buf, p + 2)? },
        65 => Opcode::FieldIC {
            dst: u8_at(buf, p)?,
            recv: u8_at(buf, p + 1)?,
            field: u16_at(buf, p + 2)?,
            ic_type: u16_at(buf, p + 4)?,
            ic_offset: u16_at(buf, p + 6)?,
        },
        66 => Opcode::FieldRetain { dst: u8_at(buf, p)?, recv: u8_at(buf, p + 1)?, field: u16_at(buf, p + 2)? },
        67 => Opcode::FieldRetainIC {
            dst: u8_at(buf, p)?,
            recv: u8_at(buf, p + 1)?,
            field: u16_at(buf, p + 2)?,
            ic_type: u16_at(buf, p + 4)?,
            ic_offset: u16_at(buf, p + 6)?,
        },
        68 => Opcode::FieldRelease { recv: u8_at(buf, p)?, field: u16_at(buf, p + 1)? },
        69 => Opcode::SetField { recv: u8_at(buf, p)?, field: u16_at(buf, p + 1)?, val: u8_at(buf, p + 3)? },
        70 => Opcode::SetFieldRelease { recv: u8_at(buf, p)?, field: u16_at(buf, p + 1)?, val: u8_at(buf, p + 3)? },
        71 => Opcode::SetFieldReleaseIC {
            recv: u8_at(buf, p)?,
            field: u16_at(buf, p + 1)?,
            val: u8_at(buf, p + 3)?,
            ic_type: u16_at(buf, p + 4)?,
            ic_offset: u16_at(buf, p + 6)?,
        },
        72 => Opcode::StringTemplate { dst: u8_at(buf, p)?, start: u8_at(buf, p + 1)?, count: u8_at(buf, p + 2)? },
        73 => Opcode::Lambda { dst: u8_at(buf, p)?, func_const: u16_at(buf, p + 1)? },
        74 => Opcode::Closure {
            dst: u8_at(buf, p)?,
            func_const: u16_at(buf, p + 1)?,
            upvalue_start: u8_at(buf, p + 3)?,
            upvalue_count: u8_at(buf, p + 4)?,
        },
        75 => Opcode::Box { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        76 => Opcode::BoxValue { dst: u8_at(buf, p)?, cell: u8_at(buf, p + 1)? },
        77 => Opcode::BoxValueRetain { dst: u8_at(buf, p)?, cell: u8_at(buf, p + 1)? },
        78 => Opcode::SetBoxValue { cell: u8_at(buf, p)?, val: u8_at(buf, p + 1)? },
        79 => Opcode::SetBoxValueRelease { cell: u8_at(buf, p)?, val: u8_at(buf, p + 1)? },
        80 => Opcode::ForRangeInit {
            start: u8_at(buf, p)?,
            end: u8_at(buf, p + 1)?,
            step: u8_at(buf, p + 2)?,
            offset: i16_at(buf, p + 3)?,
        },
        81 => Opcode::ForRange {
            counter: u8_at(buf, p)?,
            end: u8_at(buf, p + 1)?,
            step: u8_at(buf, p + 2)?,
            offset: i16_at(buf, p + 3)?,
        },
        82 => Opcode::ForRangeReverse {
            counter: u8_at(buf, p)?,
            end: u8_at(buf, p + 1)?,
            step: u8_at(buf, p + 2)?,
            offset: i16_at(buf, p + 3)?,
        },
        83 => Opcode::StaticFunc { dst: u8_at(buf, p)?, id: u16_at(buf, p + 1)? },
        84 => Opcode::StaticVar { dst: u8_at(buf, p)?, id: u16_at(buf, p + 1)? },
        85 => Opcode::SetStaticFunc { id: u16_at(buf, p)?, src: u8_at(buf, p + 2)? },
        86 => Opcode::SetStaticVar { id: u16_at(buf, p)?, src: u8_at(buf, p + 2)? },
        87 => Opcode::Sym { dst: u8_at(buf, p)?, sym: u32_at(buf, p + 1)? },
        88 => Opcode::Coinit {
            dst: u8_at(buf, p)?,
            func: u8_at(buf, p + 1)?,
            start_local: u8_at(buf, p + 2)?,
            num_args: u8_at(buf, p + 3)?,
        },
        89 => Opcode::Coyield { val: u8_at(buf, p)? },
        90 => Opcode::Coresume { dst: u8_at(buf, p)?, fiber: u8_at(buf, p + 1)?, val: u8_at(buf, p + 2)? },
        91 => Opcode::Coreturn { val: u8_at(buf, p)? },
        92 => Opcode::TryValue { dst: u8_at(buf, p)?, src: u8_at(buf, p + 1)? },
        93 => Opcode::End,
        other => return Err(DecodeError::UnknownOpcode(other)),
    };
    let width = op.width();
    if offset + width > buf.len() {
        return Err(DecodeError::Truncated);
    }
    Ok((op, width))
}

#[inline]
fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn push_i16(buf: &mut Vec<u8>, v: i16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn push_u48(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes()[..6]);
}

/// Append the little-endian encoding of `op` to `buf`.
pub fn encode(op: &Opcode, buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.push(op.tag());
    match *op {
        Opcode::ConstOp { dst, idx } => {
            buf.push(dst);
            push_u16(buf, idx);
        }
        Opcode::ConstI8 { dst, imm } => {
            buf.push(dst);
            buf.push(imm);
        }
        Opcode::ConstI8Int { dst, imm } => {
            buf.push(dst);
            buf.push(imm as u8);
        }
        Opcode::True { dst } | Opcode::False { dst } | Opcode::None { dst } | Opcode::MapEmpty { dst } => {
            buf.push(dst);
        }
        Opcode::Tag { dst, sym } => {
            buf.push(dst);
            push_u32(buf, sym);
        }
        Opcode::TagLiteral { dst, idx } => {
            buf.push(dst);
            push_u16(buf, idx);
        }
        Opcode::Copy { dst, src }
        | Opcode::CopyReleaseDst { dst, src }
        | Opcode::CopyRetainSrc { dst, src }
        | Opcode::CopyRetainRelease { dst, src }
        | Opcode::Neg { dst, src }
        | Opcode::Not { dst, src }
        | Opcode::BitwiseNot { dst, src }
        | Opcode::Box { dst, src }
        | Opcode::TryValue { dst, src } => {
            buf.push(dst);
            buf.push(src);
        }
        Opcode::Retain { slot } | Opcode::Release { slot } => buf.push(slot),
        Opcode::ReleaseN { start, count } => {
            buf.push(start);
            buf.push(count);
        }
        Opcode::Add { dst, a, b }
        | Opcode::Sub { dst, a, b }
        | Opcode::Mul { dst, a, b }
        | Opcode::Div { dst, a, b }
        | Opcode::Pow { dst, a, b }
        | Opcode::Mod { dst, a, b }
        | Opcode::AddInt { dst, a, b }
        | Opcode::SubInt { dst, a, b }
        | Opcode::LessInt { dst, a, b }
        | Opcode::Compare { dst, a, b }
        | Opcode::CompareNot { dst, a, b }
        | Opcode::Less { dst, a, b }
        | Opcode::Greater { dst, a, b }
        | Opcode::LessEqual { dst, a, b }
        | Opcode::GreaterEqual { dst, a, b }
        | Opcode::BitwiseAnd { dst, a, b }
        | Opcode::BitwiseOr { dst, a, b }
        | Opcode::BitwiseXor { dst, a, b }
        | Opcode::LeftShift { dst, a, b }
        | Opcode::RightShift { dst, a, b } => {
            buf.push(dst);
            buf.push(a);
            buf.push(b);
        }
        Opcode::Jump { offset } => push_i16(buf, offset),
        Opcode::JumpCond { cond, offset } | Opcode::JumpNotCond { cond, offset } => {
            buf.push(cond);
            push_i16(buf, offset);
        }
        Opcode::JumpNotNone { src, offset } => {
            buf.push(src);
            push_i16(buf, offset);
        }
        Opcode::Match { src, case_const, offset } => {
            buf.push(src);
            push_u16(buf, case_const);
            push_i16(buf, offset);
        }
        Opcode::Call0 { callee, start_local, num_args } | Opcode::Call1 { callee, start_local, num_args } => {
            buf.push(callee);
            buf.push(start_local);
            buf.push(num_args);
        }
        Opcode::CallSym { sym, start_local, num_args, num_ret } => {
            push_u32(buf, sym);
            buf.push(start_local);
            buf.push(num_args);
            buf.push(num_ret);
            push_u16(buf, 0); // reserved: future resolved-func cache
        }
        Opcode::CallObjSym { recv, sym, start_local, num_args, num_ret } => {
            buf.push(recv);
            push_u32(buf, sym);
            buf.push(start_local);
            buf.push(num_args);
            buf.push(num_ret);
            push_u16(buf, 0); // reserved: ic_type
            push_u48(buf, 0); // reserved: ic_func
        }
        Opcode::CallFuncIC { func_const, start_local, num_args, num_ret }
        | Opcode::CallNativeFuncIC { func_const, start_local, num_args, num_ret } => {
            push_u16(buf, func_const);
            buf.push(start_local);
            buf.push(num_args);
            buf.push(num_ret);
            push_u32(buf, 0); // unused sym-id slot, reserved for deopt symmetry
        }
        Opcode::CallObjFuncIC { recv, start_local, num_args, num_ret, ic_type, ic_func }
        | Opcode::CallObjNativeFuncIC { recv, start_local, num_args, num_ret, ic_type, ic_func } => {
            buf.push(recv);
            push_u32(buf, 0); // unused sym-id slot, reserved for deopt symmetry
            buf.push(start_local);
            buf.push(num_args);
            buf.push(num_ret);
            push_u16(buf, ic_type);
            push_u48(buf, ic_func);
        }
        Opcode::Ret0 | Opcode::Ret1 | Opcode::End => {}
        Opcode::List { dst, start, count }
        | Opcode::Map { dst, start, count }
        | Opcode::SetInitN { dst, start, count }
        | Opcode::StringTemplate { dst, start, count } => {
            buf.push(dst);
            buf.push(start);
            buf.push(count);
        }
        Opcode::Object { dst, type_id, start, count } | Opcode::ObjectSmall { dst, type_id, start, count } => {
            buf.push(dst);
            push_u16(buf, type_id);
            buf.push(start);
            buf.push(count);
        }
        Opcode::Index { dst, recv, key } | Opcode::ReverseIndex { dst, recv, key } => {
            buf.push(dst);
            buf.push(recv);
            buf.push(key);
        }
        Opcode::SetIndex { recv, key, val } | Opcode::SetIndexRelease { recv, key, val } => {
            buf.push(recv);
            buf.push(key);
            buf.push(val);
        }
        Opcode::Slice { dst, recv, start, end } => {
            buf.push(dst);
            buf.push(recv);
            buf.push(start);
            buf.push(end);
        }
        Opcode::Field { dst, recv, field } | Opcode::FieldRetain { dst, recv, field } => {
            buf.push(dst);
            buf.push(recv);
            push_u16(buf, field);
            push_u16(buf, 0); // reserved ic_type
            push_u16(buf, 0); // reserved ic_offset
        }
        Opcode::FieldIC { dst, recv, field, ic_type, ic_offset }
        | Opcode::FieldRetainIC { dst, recv, field, ic_type, ic_offset } => {
            buf.push(dst);
            buf.push(recv);
            push_u16(buf, field);
            push_u16(buf, ic_type);
            push_u16(buf, ic_offset);
        }
        Opcode::FieldRelease { recv, field } => {
            buf.push(recv);
            push_u16(buf, field);
        }
        Opcode::SetField { recv, field, val } => {
            buf.push(recv);
            push_u16(buf, field);
            buf.push(val);
        }
        Opcode::SetFieldRelease { recv, field, val } => {
            buf.push(recv);
            push_u16(buf, field);
            buf.push(val);
            push_u16(buf, 0);
            push_u16(buf, 0);
        }
        Opcode::SetFieldReleaseIC { recv, field, val, ic_type, ic_offset } => {
            buf.push(recv);
            push_u16(buf, field);
            buf.push(val);
            push_u16(buf, ic_type);
            push_u16(buf, ic_offset);
        }
        Opcode::Lambda { dst, func_const } => {
            buf.push(dst);
            push_u16(buf, func_const);
        }
        Opcode::Closure { dst, func_const, upvalue_start, upvalue_count } => {
            buf.push(dst);
            push_u16(buf, func_const);
            buf.push(upvalue_start);
            buf.push(upvalue_count);
        }
        Opcode::BoxValue { dst, cell } | Opcode::BoxValueRetain { dst, cell } => {
            buf.push(dst);
            buf.push(cell);
        }
        Opcode::SetBoxValue { cell, val } | Opcode::SetBoxValueRelease { cell, val } => {
            buf.push(cell);
            buf.push(val);
        }
        Opcode::ForRangeInit { start, end, step, offset }
        | Opcode::ForRange { counter: start, end, step, offset }
        | Opcode::ForRangeReverse { counter: start, end, step, offset } => {
            buf.push(start);
            buf.push(end);
            buf.push(step);
            push_i16(buf, offset);
        }
        Opcode::StaticFunc { dst, id } | Opcode::StaticVar { dst, id } => {
            buf.push(dst);
            push_u16(buf, id);
        }
        Opcode::SetStaticFunc { id, src } | Opcode::SetStaticVar { id, src } => {
            push_u16(buf, id);
            buf.push(src);
        }
        Opcode::Sym { dst, sym } => {
            buf.push(dst);
            push_u32(buf, sym);
        }
        Opcode::Coinit { dst, func, start_local, num_args } => {
            buf.push(dst);
            buf.push(func);
            buf.push(start_local);
            buf.push(num_args);
        }
        Opcode::Coyield { val } | Opcode::Coreturn { val } => buf.push(val),
        Opcode::Coresume { dst, fiber, val } => {
            buf.push(dst);
            buf.push(fiber);
            buf.push(val);
        }
    }
    debug_assert_eq!(buf.len() - start, op.width());
}

/// Rewrite the instruction at `offset` in place with `op`, which must have
/// the same [`Opcode::width`] as the instruction currently occupying that
/// slot. Safe only when every field of the new opcode has an identical byte
/// position to the old one (true for `ForRangeInit` -> `ForRange`/
/// `ForRangeReverse`, which share one field layout and differ only in the
/// tag byte). **Not** safe for the `CallObjSym`/`Field`/`SetFieldRelease`
/// inline-cache families: those reserve cache bytes alongside fields the
/// IC variant doesn't carry in its `Opcode` representation, and a generic
/// re-encode would clobber the reserved bytes a later deopt needs. Use
/// [`promote_call_obj_sym`]/[`deopt_call_obj_ic`] (and the `Field`/
/// `SetFieldRelease` equivalents) for those instead.
pub fn rewrite_in_place(buf: &mut [u8], offset: usize, op: &Opcode) -> Result<(), DecodeError> {
    let mut scratch = Vec::with_capacity(op.width());
    encode(op, &mut scratch);
    if offset + scratch.len() > buf.len() {
        return Err(DecodeError::Truncated);
    }
    buf[offset..offset + scratch.len()].copy_from_slice(&scratch);
    Ok(())
}

#[inline]
fn write_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn write_u48(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 6].copy_from_slice(&v.to_le_bytes()[..6]);
}

const CALL_OBJ_SYM_TAG: u8 = 46;
const CALL_OBJ_FUNC_IC_TAG: u8 = 49;
const CALL_OBJ_NATIVE_FUNC_IC_TAG: u8 = 50;
const CALL_OBJ_FAMILY_WIDTH: usize = 17;

/// Promote a `CallObjSym` call site to `CallObjFuncIC`/`CallObjNativeFuncIC`
/// in place. Only the opcode tag and the two cache fields are written —
/// the receiver, symbol id and call-shape bytes are left untouched, so a
/// later mismatch can [`deopt_call_obj_ic`] back to the exact original
/// `CallObjSym` instruction.
pub fn promote_call_obj_sym(buf: &mut [u8], offset: usize, native: bool, ic_type: u16, ic_func: u64) -> Result<(), DecodeError> {
    if offset + CALL_OBJ_FAMILY_WIDTH > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let p = offset + 1;
    buf[offset] = if native { CALL_OBJ_NATIVE_FUNC_IC_TAG } else { CALL_OBJ_FUNC_IC_TAG };
    write_u16(buf, p + 8, ic_type);
    write_u48(buf, p + 10, ic_func);
    Ok(())
}

/// Deoptimize a promoted object-method call site back to `CallObjSym`.
/// A single-byte opcode rewrite; every other byte (including the original
/// symbol id, never touched by [`promote_call_obj_sym`]) is left as-is.
pub fn deopt_call_obj_ic(buf: &mut [u8], offset: usize) -> Result<(), DecodeError> {
    if offset + CALL_OBJ_FAMILY_WIDTH > buf.len() {
        return Err(DecodeError::Truncated);
    }
    buf[offset] = CALL_OBJ_SYM_TAG;
    Ok(())
}

const FIELD_TAG: u8 = 64;
const FIELD_IC_TAG: u8 = 65;
const FIELD_RETAIN_TAG: u8 = 66;
const FIELD_RETAIN_IC_TAG: u8 = 67;
const SET_FIELD_RELEASE_TAG: u8 = 70;
const SET_FIELD_RELEASE_IC_TAG: u8 = 71;
const FIELD_FAMILY_WIDTH: usize = 9;

/// Promote a `Field`/`FieldRetain`/`SetFieldRelease` site to its `*IC`
/// variant in place, writing only the tag byte and the trailing
/// `ic_type`/`ic_offset` cache fields. `retain`/`release_variant` select
/// which of the three families `offset` currently holds.
pub fn promote_field_ic(buf: &mut [u8], offset: usize, family: FieldIcFamily, ic_type: u16, ic_offset: u16) -> Result<(), DecodeError> {
    if offset + FIELD_FAMILY_WIDTH > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let p = offset + 1;
    buf[offset] = family.ic_tag();
    // Field/FieldRetain reserve ic fields at p+4/p+6; SetFieldRelease's
    // value byte shifts the reserved fields to the same relative tail
    // position since both families are 9 bytes wide with a 2-byte id.
    match family {
        FieldIcFamily::Field | FieldIcFamily::FieldRetain => {
            write_u16(buf, p + 4, ic_type);
            write_u16(buf, p + 6, ic_offset);
        }
        FieldIcFamily::SetFieldRelease => {
            write_u16(buf, p + 4, ic_type);
            write_u16(buf, p + 6, ic_offset);
        }
    }
    Ok(())
}

/// Deoptimize a promoted field-access site back to its base opcode.
pub fn deopt_field_ic(buf: &mut [u8], offset: usize, family: FieldIcFamily) -> Result<(), DecodeError> {
    if offset + FIELD_FAMILY_WIDTH > buf.len() {
        return Err(DecodeError::Truncated);
    }
    buf[offset] = family.base_tag();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which field-access inline-cache family a site belongs to.
pub enum FieldIcFamily {
    Field,
    FieldRetain,
    SetFieldRelease,
}

impl FieldIcFamily {
    const fn base_tag(self) -> u8 {
        match self {
            Self::Field => FIELD_TAG,
            Self::FieldRetain => FIELD_RETAIN_TAG,
            Self::SetFieldRelease => SET_FIELD_RELEASE_TAG,
        }
    }

    const fn ic_tag(self) -> u8 {
        match self {
            Self::Field => FIELD_IC_TAG,
            Self::FieldRetain => FIELD_RETAIN_IC_TAG,
            Self::SetFieldRelease => SET_FIELD_RELEASE_IC_TAG,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_opcode() {
        let op = Opcode::Add { dst: 1, a: 2, b: 3 };
        let mut buf = Vec::new();
        encode(&op, &mut buf);
        assert_eq!(buf.len(), op.width());
        let (decoded, len) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(len, op.width());
    }

    #[test]
    fn round_trips_jump_offset_negative() {
        let op = Opcode::Jump { offset: -12 };
        let mut buf = Vec::new();
        encode(&op, &mut buf);
        let (decoded, _) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn for_range_init_rewrite_preserves_width() {
        let mut buf = Vec::new();
        let init = Opcode::ForRangeInit { start: 3, end: 4, step: 5, offset: 20 };
        encode(&init, &mut buf);
        let before_len = buf.len();

        let specialized = Opcode::ForRange { counter: 3, end: 4, step: 5, offset: 20 };
        rewrite_in_place(&mut buf, 0, &specialized).unwrap();
        assert_eq!(buf.len(), before_len);
        let (decoded, _) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, specialized);
    }

    #[test]
    fn call_obj_sym_ic_promotion_preserves_sym() {
        let mut buf = Vec::new();
        let unresolved = Opcode::CallObjSym { recv: 1, sym: 42, start_local: 2, num_args: 1, num_ret: 1 };
        encode(&unresolved, &mut buf);
        let before_len = buf.len();

        promote_call_obj_sym(&mut buf, 0, false, 7, 0x0000_dead_beef).unwrap();
        assert_eq!(buf.len(), before_len);
        let (decoded, _) = decode_at(&buf, 0).unwrap();
        assert_eq!(
            decoded,
            Opcode::CallObjFuncIC { recv: 1, start_local: 2, num_args: 1, num_ret: 1, ic_type: 7, ic_func: 0x0000_dead_beef }
        );

        // Deopt must recover the exact original instruction, `sym` included —
        // promotion never touched the bytes it lives in.
        deopt_call_obj_ic(&mut buf, 0).unwrap();
        assert_eq!(buf.len(), before_len);
        let (decoded, _) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, unresolved);
    }

    #[test]
    fn field_ic_promotion_preserves_field_id() {
        let mut buf = Vec::new();
        let unresolved = Opcode::Field { dst: 1, recv: 2, field: 300 };
        encode(&unresolved, &mut buf);
        let before_len = buf.len();

        promote_field_ic(&mut buf, 0, FieldIcFamily::Field, 9, 16).unwrap();
        assert_eq!(buf.len(), before_len);
        let (decoded, _) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, Opcode::FieldIC { dst: 1, recv: 2, field: 300, ic_type: 9, ic_offset: 16 });

        deopt_field_ic(&mut buf, 0, FieldIcFamily::Field).unwrap();
        assert_eq!(buf.len(), before_len);
        let (decoded, _) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, unresolved);
    }

    #[test]
    fn set_field_release_ic_promotion_preserves_val() {
        let mut buf = Vec::new();
        let unresolved = Opcode::SetFieldRelease { recv: 4, field: 12, val: 9 };
        encode(&unresolved, &mut buf);
        let before_len = buf.len();

        promote_field_ic(&mut buf, 0, FieldIcFamily::SetFieldRelease, 2, 40).unwrap();
        let (decoded, _) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, Opcode::SetFieldReleaseIC { recv: 4, field: 12, val: 9, ic_type: 2, ic_offset: 40 });

        deopt_field_ic(&mut buf, 0, FieldIcFamily::SetFieldRelease).unwrap();
        assert_eq!(buf.len(), before_len);
        let (decoded, _) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, unresolved);
    }

    #[test]
    fn truncated_buffer_errors() {
        let buf = [Opcode::Add { dst: 0, a: 0, b: 0 }.tag()];
        assert_eq!(decode_at(&buf, 0), Err(DecodeError::Truncated));
    }

    #[test]
    fn unknown_tag_errors() {
        let buf = [250u8, 0, 0, 0];
        assert_eq!(decode_at(&buf, 0), Err(DecodeError::UnknownOpcode(250)));
    }

    #[rstest::rstest]
    fn round_trips_across_opcode_families(
        #[values(
            Opcode::ConstOp { dst: 0, idx: 0 },
            Opcode::ConstI8Int { dst: 5, imm: -3 },
            Opcode::Copy { dst: 1, src: 2 },
            Opcode::Retain { slot: 9 },
            Opcode::Add { dst: 1, a: 2, b: 3 },
            Opcode::LessInt { dst: 1, a: 2, b: 3 },
            Opcode::Jump { offset: -100 },
            Opcode::Match { src: 4, case_const: 300, offset: 12 },
            Opcode::CallSym { sym: 77, start_local: 3, num_args: 2, num_ret: 1 },
            Opcode::CallObjSym { recv: 2, sym: 42, start_local: 3, num_args: 1, num_ret: 1 },
            Opcode::List { dst: 0, start: 1, count: 4 },
            Opcode::ForRangeInit { start: 1, end: 2, step: 3, offset: 8 }
        )]
        op: Opcode,
    ) {
        let mut buf = Vec::new();
        encode(&op, &mut buf);
        assert_eq!(buf.len(), op.width(), "encoded length must match the declared width for {op:?}");
        let (decoded, len) = decode_at(&buf, 0).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(len, op.width());
    }
}
