use std::io;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Byte pattern written by a single overwrite pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Fixed(u8),
    Random,
}

impl PatternKind {
    pub const ZERO: PatternKind = PatternKind::Fixed(0x00);
    pub const ONES: PatternKind = PatternKind::Fixed(0xFF);
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternKind::Fixed(byte) => write!(f, "0x{:02X}", byte),
            PatternKind::Random => write!(f, "random"),
        }
    }
}

/// Produce exactly `length` bytes of `kind` for the chunk starting at `offset`.
///
/// Every call returns a freshly allocated buffer, so no bytes from an earlier
/// chunk can leak into a short final chunk. Random bytes come from the
/// operating system CSPRNG; a failure to obtain entropy is reported rather
/// than papered over with a weaker generator.
///
/// All current patterns are position independent, so `_offset` does not
/// change the output.
pub fn generate(kind: PatternKind, _offset: u64, length: usize) -> io::Result<Vec<u8>> {
    match kind {
        PatternKind::Fixed(byte) => Ok(vec![byte; length]),
        PatternKind::Random => {
            let mut buffer = vec![0u8; length];
            OsRng
                .try_fill_bytes(&mut buffer)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Ok(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_patterns_fill_every_byte() {
        let zeros = generate(PatternKind::ZERO, 0, 4096).unwrap();
        assert!(zeros.iter().all(|b| *b == 0x00));

        let ones = generate(PatternKind::ONES, 4096, 4096).unwrap();
        assert!(ones.iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn random_chunks_are_not_repeated() {
        let a = generate(PatternKind::Random, 0, 1024).unwrap();
        let b = generate(PatternKind::Random, 0, 1024).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, vec![0u8; 1024]);
        assert_ne!(a, vec![0xFFu8; 1024]);
    }

    #[test]
    fn zero_length_is_empty() {
        assert!(generate(PatternKind::Random, 10, 0).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn length_is_always_exact(len in 0usize..20_000, offset in any::<u64>(), byte in any::<u8>()) {
            prop_assert_eq!(generate(PatternKind::Fixed(byte), offset, len).unwrap().len(), len);
            prop_assert_eq!(generate(PatternKind::Random, offset, len).unwrap().len(), len);
        }
    }
}
