//! Opcode length table.
//!
//! Every opcode on the wire declares how the length of its payload is
//! determined. The table is built once at protocol initialization and then
//! shared read-only between all connections.

use std::fmt;

/// How the payload length of an opcode is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LengthSpec {
    /// The payload always has exactly this many bytes.
    Fixed(u16),
    /// The next byte holds the payload length.
    U8Prefixed,
    /// The next two bytes (big-endian) hold the payload length.
    U16Prefixed,
    /// No length is registered: the payload is everything currently buffered.
    ///
    /// This is a diagnostic fallback for unmapped opcodes, never a normal mode.
    Remainder,
}

impl LengthSpec {
    /// Number of length-prefix bytes following the opcode.
    #[must_use]
    pub const fn prefix_len(self) -> usize {
        match self {
            LengthSpec::U8Prefixed => 1,
            LengthSpec::U16Prefixed => 2,
            LengthSpec::Fixed(_) | LengthSpec::Remainder => 0,
        }
    }

    /// Largest payload this spec can describe.
    #[must_use]
    pub const fn max_payload(self) -> usize {
        match self {
            LengthSpec::Fixed(n) => n as usize,
            LengthSpec::U8Prefixed => u8::MAX as usize,
            LengthSpec::U16Prefixed => u16::MAX as usize,
            LengthSpec::Remainder => crate::codec::MAX_FRAME_SIZE,
        }
    }
}

impl fmt::Display for LengthSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LengthSpec::Fixed(n) => write!(f, "fixed({n})"),
            LengthSpec::U8Prefixed => f.write_str("u8"),
            LengthSpec::U16Prefixed => f.write_str("u16"),
            LengthSpec::Remainder => f.write_str("remainder"),
        }
    }
}

/// Mapping from opcode to declared payload length.
#[derive(Clone)]
pub struct OpcodeTable {
    lengths: [Option<LengthSpec>; 256],
}

impl OpcodeTable {
    /// Create an empty table. Every opcode resolves to [`LengthSpec::Remainder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            lengths: [None; 256],
        }
    }

    /// Register the length of an opcode, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, opcode: u8, spec: LengthSpec) -> Self {
        self.set(opcode, spec);
        self
    }

    /// Register a fixed-size opcode.
    #[must_use]
    pub fn fixed(self, opcode: u8, size: u16) -> Self {
        self.with(opcode, LengthSpec::Fixed(size))
    }

    /// Register an opcode whose length is carried in one byte.
    #[must_use]
    pub fn u8_prefixed(self, opcode: u8) -> Self {
        self.with(opcode, LengthSpec::U8Prefixed)
    }

    /// Register an opcode whose length is carried in two big-endian bytes.
    #[must_use]
    pub fn u16_prefixed(self, opcode: u8) -> Self {
        self.with(opcode, LengthSpec::U16Prefixed)
    }

    /// Register the length of an opcode in place.
    pub fn set(&mut self, opcode: u8, spec: LengthSpec) {
        // Remainder is what "absent" means; keep a single representation.
        self.lengths[opcode as usize] = match spec {
            LengthSpec::Remainder => None,
            other => Some(other),
        };
    }

    /// Look up the declared length of an opcode.
    #[must_use]
    pub fn lookup(&self, opcode: u8) -> LengthSpec {
        self.lengths[opcode as usize].unwrap_or(LengthSpec::Remainder)
    }

    /// Whether the opcode has a registered length.
    #[must_use]
    pub fn is_mapped(&self, opcode: u8) -> bool {
        self.lengths[opcode as usize].is_some()
    }

    /// Number of mapped opcodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lengths.iter().filter(|l| l.is_some()).count()
    }

    /// Whether no opcode is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpcodeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.lengths
                    .iter()
                    .enumerate()
                    .filter_map(|(op, spec)| spec.map(|s| (op, s))),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_is_remainder() {
        let table = OpcodeTable::new().fixed(1, 4);
        assert_eq!(table.lookup(1), LengthSpec::Fixed(4));
        assert_eq!(table.lookup(2), LengthSpec::Remainder);
        assert!(table.is_mapped(1));
        assert!(!table.is_mapped(2));
    }

    #[test]
    fn test_overwrite_and_unmap() {
        let mut table = OpcodeTable::new().u8_prefixed(5).u16_prefixed(6);
        assert_eq!(table.len(), 2);

        table.set(5, LengthSpec::Remainder);
        assert!(!table.is_mapped(5));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_prefix_len() {
        assert_eq!(LengthSpec::Fixed(9).prefix_len(), 0);
        assert_eq!(LengthSpec::U8Prefixed.prefix_len(), 1);
        assert_eq!(LengthSpec::U16Prefixed.prefix_len(), 2);
        assert_eq!(LengthSpec::Remainder.prefix_len(), 0);
    }
}
