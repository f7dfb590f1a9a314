//! Low-level atom ("box") grammar for the QuickTime container.
//!
//! Every structural unit of a `.mov` file is an atom: a 32-bit
//! big-endian size covering the whole atom, a four-character type code,
//! and a payload of raw bytes or child atoms. Atoms whose payload may
//! exceed the 32-bit size field use the extended header form (size
//! field 1 followed by a 64-bit length).

mod stream;
mod writer;

pub use stream::QtStream;
pub use writer::AtomWriter;

use std::fmt;

/// Size of a plain atom header: 32-bit size + type code.
pub const ATOM_HEADER_SIZE: u64 = 8;

/// Size of the header space reserved for a wide (64-bit capable) atom.
pub const WIDE_HEADER_SIZE: u64 = 16;

/// Marker value in the 32-bit size field selecting the extended
/// 64-bit length form.
pub const EXTENDED_SIZE_MARKER: u32 = 1;

/// A four-character atom type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// The bytes of the code.
    #[inline]
    pub const fn bytes(self) -> [u8; 4] {
        self.0
    }
}

impl From<[u8; 4]> for FourCc {
    fn from(b: [u8; 4]) -> Self {
        Self(b)
    }
}

impl From<&[u8; 4]> for FourCc {
    fn from(b: &[u8; 4]) -> Self {
        Self(*b)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if (0x20..0x7f).contains(&b) { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc(\"{self}\")")
    }
}
