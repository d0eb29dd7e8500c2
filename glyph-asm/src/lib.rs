//! Atomic bytecode types of the Glyph VM: the [`Opcode`] vocabulary, its
//! little-endian fixed-width encoding, and the vocabularies used to report
//! VM results ([`PanicReason`], [`ResultCode`]).
//!
//! This crate has no heap, no execution, and no notion of a running VM: it
//! is the wire format shared between a compiler producing a [`Chunk`] and
//! the interpreter in `glyph-vm` that consumes it.
//!
//! [`Chunk`]: https://docs.rs/glyph-vm

mod instruction;
mod opcode;
mod panic_reason;
mod result_code;

pub use instruction::{
    decode_at, deopt_call_obj_ic, deopt_field_ic, encode, promote_call_obj_sym, promote_field_ic, rewrite_in_place,
    DecodeError, FieldIcFamily,
};
pub use opcode::Opcode;
pub use panic_reason::PanicReason;
pub use result_code::ResultCode;
