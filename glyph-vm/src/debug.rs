//! Linear disassembler over a raw instruction buffer.
//!
//! Walks the buffer the same way [`crate::chunk::Chunk::validate`] and the
//! dispatch loop do — `decode_at`, advance by the returned width, repeat —
//! so a disassembly always reflects the buffer's current self-modified
//! state (inline-cache promotions, `ForRangeInit` specialization) rather
//! than some separately-maintained view of it.

use glyph_asm::{decode_at, DecodeError, Opcode};

/// One decoded instruction, formatted for human inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    /// Byte offset of the opcode tag within the buffer.
    pub offset: usize,
    /// The opcode's variant name, e.g. `"CallObjFuncIC"`.
    pub mnemonic: String,
    /// The operand fields, formatted as `{ field: value, ... }` (empty
    /// string for zero-operand opcodes like `Ret0`/`End`).
    pub operands: String,
    /// Whether this site may be rewritten in place by the interpreter
    /// (see [`Opcode::is_self_modifying_site`]).
    pub self_modifying: bool,
}

/// Disassembles every instruction in `buf`, front to back.
///
/// Returns an error as soon as `decode_at` fails to decode an instruction,
/// the same failure mode `Chunk::validate` surfaces — a disassembly is
/// only ever attempted on a buffer that's at least structurally well
/// formed.
pub fn disassemble(buf: &[u8]) -> Result<Vec<DisassembledInstruction>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        let (op, width) = decode_at(buf, offset)?;
        let (mnemonic, operands) = split_mnemonic(&op);
        out.push(DisassembledInstruction {
            offset,
            mnemonic,
            operands,
            self_modifying: op.is_self_modifying_site(),
        });
        offset += width;
    }
    Ok(out)
}

/// Splits an `Opcode`'s `{:?}` rendering into its variant name and operand
/// list. `Opcode`'s `Debug` derive already produces `Name { field: val,
/// ... }` or bare `Name` for unit variants, so this is just a split on the
/// first `{`/space rather than a second formatter.
fn split_mnemonic(op: &Opcode) -> (String, String) {
    let text = format!("{op:?}");
    match text.find([' ', '{']) {
        Some(idx) => {
            let mnemonic = text[..idx].trim_end().to_string();
            let operands = text[idx..].trim_start().to_string();
            (mnemonic, operands)
        }
        None => (text, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glyph_asm::encode;

    #[test]
    fn disassembles_a_short_sequence_in_order() {
        let mut buf = Vec::new();
        encode(&Opcode::ConstI8Int { dst: 0, imm: 2 }, &mut buf);
        encode(&Opcode::ConstI8Int { dst: 1, imm: 3 }, &mut buf);
        encode(&Opcode::AddInt { dst: 2, a: 0, b: 1 }, &mut buf);
        encode(&Opcode::Ret1, &mut buf);

        let instrs = disassemble(&buf).expect("decode error");
        assert_eq!(instrs.len(), 4);
        assert_eq!(instrs[0].mnemonic, "ConstI8Int");
        assert_eq!(instrs[2].mnemonic, "AddInt");
        assert_eq!(instrs[3].mnemonic, "Ret1");
        assert_eq!(instrs[3].operands, "");
        assert!(!instrs[3].self_modifying);

        let mut expected_offset = 0;
        for instr in &instrs {
            assert_eq!(instr.offset, expected_offset);
            expected_offset += match instr.mnemonic.as_str() {
                "ConstI8Int" => 3,
                "AddInt" => 4,
                "Ret1" => 1,
                other => panic!("unexpected mnemonic {other}"),
            };
        }
    }

    #[test]
    fn flags_inline_cache_sites_as_self_modifying() {
        let mut buf = Vec::new();
        encode(
            &Opcode::CallObjSym { recv: 0, sym: 1, start_local: 2, num_args: 0, num_ret: 1 },
            &mut buf,
        );
        let instrs = disassemble(&buf).expect("decode error");
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].mnemonic, "CallObjSym");
        assert!(instrs[0].self_modifying);
    }

    #[test]
    fn reports_decode_error_on_truncated_buffer() {
        let mut buf = Vec::new();
        encode(&Opcode::Ret1, &mut buf);
        buf.extend_from_slice(&[0xFF]); // unknown tag
        assert!(disassemble(&buf).is_err());
    }
}
