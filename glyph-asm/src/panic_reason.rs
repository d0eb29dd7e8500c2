use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
/// Reason a fiber unwound irrecoverably.
///
/// Distinct from a value-level `error(#Symbol)`: a panic ends the current
/// evaluation rather than flowing through normal data paths (see the two
/// error planes in the runtime's error handling design).
pub enum PanicReason {
    /// The byte can't be mapped to any known `PanicReason`.
    UnknownPanicReason = 0x00,
    /// The front-end lexer rejected the source.
    TokenError = 0x01,
    /// The front-end parser rejected the token stream.
    ParseError = 0x02,
    /// The compiler rejected a syntactically valid program.
    CompileError = 0x03,
    /// A host function or built-in signalled an unrecoverable fault.
    Panic = 0x04,
    /// The call stack exceeded its configured capacity.
    StackOverflow = 0x05,
    /// The allocator could not satisfy a request.
    OutOfMemory = 0x06,
    /// A built-in or host function received an argument of the wrong shape.
    InvalidArgument = 0x07,
    /// An index or slice bound fell outside the receiver's domain.
    OutOfBounds = 0x08,
    /// A string index fell inside a multi-byte UTF-8 sequence.
    InvalidRune = 0x09,
    /// An `assert` expression evaluated to a falsy value.
    AssertError = 0x0a,
}

impl fmt::Display for PanicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PanicReason {}

impl From<u8> for PanicReason {
    /// Unrecognized bytes map to `UnknownPanicReason` rather than panicking
    /// the host — panic reasons travel over the embedder boundary as plain
    /// bytes and must tolerate a version skew between compiler and VM.
    fn from(b: u8) -> Self {
        use PanicReason::*;
        match b {
            0x01 => TokenError,
            0x02 => ParseError,
            0x03 => CompileError,
            0x04 => Panic,
            0x05 => StackOverflow,
            0x06 => OutOfMemory,
            0x07 => InvalidArgument,
            0x08 => OutOfBounds,
            0x09 => InvalidRune,
            0x0a => AssertError,
            _ => UnknownPanicReason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn u8_round_trip() {
        let last_known: u8 = PanicReason::iter().last().unwrap() as u8 + 1;
        assert_eq!(PanicReason::from(0), PanicReason::UnknownPanicReason);

        for i in 1..last_known {
            let reason = PanicReason::from(i);
            assert_eq!(reason as u8, i);
        }
        for i in last_known..=255 {
            assert_eq!(PanicReason::from(i), PanicReason::UnknownPanicReason);
        }
    }

    #[test]
    fn display_matches_debug() {
        assert_eq!(PanicReason::OutOfBounds.to_string(), "OutOfBounds");
    }
}
