use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
/// Outcome of a single `Vm::eval` call, reported to the embedder.
///
/// Unlike [`crate::PanicReason`], which identifies *why* a panic happened,
/// a `ResultCode` identifies *which stage* of lex/parse/compile/run failed.
pub enum ResultCode {
    Success = 0x00,
    TokenError = 0x01,
    ParseError = 0x02,
    CompileError = 0x03,
    Panic = 0x04,
    Unknown = 0xff,
}

impl ResultCode {
    /// Whether the embedder should treat this as a successful evaluation.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ResultCode {}

impl From<u8> for ResultCode {
    fn from(b: u8) -> Self {
        use ResultCode::*;
        match b {
            0x00 => Success,
            0x01 => TokenError,
            0x02 => ParseError,
            0x03 => CompileError,
            0x04 => Panic,
            _ => Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn only_success_is_success() {
        for code in ResultCode::iter() {
            assert_eq!(code.is_success(), code == ResultCode::Success);
        }
    }

    #[test]
    fn u8_round_trip_for_known_codes() {
        for code in ResultCode::iter().filter(|c| *c != ResultCode::Unknown) {
            assert_eq!(ResultCode::from(code as u8), code);
        }
        assert_eq!(ResultCode::from(0x7f), ResultCode::Unknown);
    }
}
