//! Atom tree writer with deferred size patching.
//!
//! Atom sizes are only known once their payload has been written, so
//! every `begin` reserves header space and every `end` seeks back,
//! patches the computed size, and seeks forward again. Exactly one
//! child of a composite may be open at a time; the chain of open
//! ancestors is an explicit stack, so out-of-order finishing is a
//! detectable error rather than silent corruption.

use std::io::{Seek, Write};

use tracing::warn;

use crate::util::{Error, Result};

use super::stream::QtStream;
use super::{FourCc, ATOM_HEADER_SIZE, EXTENDED_SIZE_MARKER};

#[derive(Debug, Clone, Copy)]
struct OpenAtom {
    atom_type: FourCc,
    offset: u64,
    wide: bool,
}

/// Writer for a nested tree of length-prefixed atoms.
pub struct AtomWriter<W: Write + Seek> {
    stream: QtStream<W>,
    stack: Vec<OpenAtom>,
}

impl<W: Write + Seek> AtomWriter<W> {
    /// Wrap a stream. Atoms may start at any position; the stream does
    /// not have to be empty.
    pub fn new(inner: W) -> Result<Self> {
        Ok(Self {
            stream: QtStream::new(inner)?,
            stack: Vec::new(),
        })
    }

    /// Current absolute write position.
    #[inline]
    pub fn pos(&self) -> u64 {
        self.stream.pos()
    }

    /// Number of currently open atoms.
    #[inline]
    pub fn open_depth(&self) -> usize {
        self.stack.len()
    }

    /// Access the stream for leaf payload writes between `begin` and
    /// `end`.
    #[inline]
    pub fn stream(&mut self) -> &mut QtStream<W> {
        &mut self.stream
    }

    /// Open an atom: reserve the 8-byte header and push it on the
    /// open-atom stack.
    pub fn begin(&mut self, ty: impl Into<FourCc>) -> Result<()> {
        let atom_type = ty.into();
        let offset = self.stream.pos();
        self.stream.write_u32(0)?;
        self.stream.write_fourcc(atom_type)?;
        self.stack.push(OpenAtom { atom_type, offset, wide: false });
        Ok(())
    }

    /// Open a wide atom: reserve 16 bytes of header so the finished
    /// atom can hold either a compact 32-bit header or the extended
    /// 64-bit form. Until the atom is finished the reservation reads
    /// as an empty `free` atom, keeping a truncated file parseable.
    pub fn begin_wide(&mut self, ty: impl Into<FourCc>) -> Result<()> {
        let atom_type = ty.into();
        let offset = self.stream.pos();
        self.stream.write_u32(ATOM_HEADER_SIZE as u32)?;
        self.stream.write_fourcc(b"free")?;
        self.stream.write_zeros(ATOM_HEADER_SIZE as usize)?;
        self.stack.push(OpenAtom { atom_type, offset, wide: true });
        Ok(())
    }

    /// Finish the innermost open atom and patch its size.
    ///
    /// `ty` must name the innermost open atom; a mismatch is an
    /// [`Error::AtomNesting`] and nothing is written. Returns the
    /// finished atom's total size in bytes.
    pub fn end(&mut self, ty: impl Into<FourCc>) -> Result<u64> {
        let found = ty.into();
        let open = *self.stack.last().ok_or(Error::NoOpenAtom)?;
        if open.atom_type != found {
            return Err(Error::AtomNesting { expected: open.atom_type, found });
        }
        self.stack.pop();
        self.patch_header(open)
    }

    /// Finish the innermost open atom, checking the payload length the
    /// caller expected to have written. A mismatch is logged and the
    /// measured size wins; the file stays structurally valid either
    /// way.
    pub fn end_sized(&mut self, ty: impl Into<FourCc>, expected_payload: u64) -> Result<u64> {
        let found = ty.into();
        let size = self.end(found)?;
        if size != expected_payload + ATOM_HEADER_SIZE {
            warn!(
                atom = %found,
                measured = size,
                expected = expected_payload + ATOM_HEADER_SIZE,
                "atom size bookkeeping mismatch"
            );
        }
        Ok(size)
    }

    /// Finish every open atom, innermost first.
    pub fn finish_all(&mut self) -> Result<()> {
        while let Some(open) = self.stack.pop() {
            self.patch_header(open)?;
        }
        Ok(())
    }

    /// Write a complete leaf atom: `begin`, payload, `end`.
    pub fn leaf<F>(&mut self, ty: impl Into<FourCc>, payload: F) -> Result<u64>
    where
        F: FnOnce(&mut QtStream<W>) -> Result<()>,
    {
        let ty = ty.into();
        self.begin(ty)?;
        payload(&mut self.stream)?;
        self.end(ty)
    }

    /// Flush buffered bytes to the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()
    }

    /// Flush and unwrap the underlying stream. All atoms must be
    /// finished.
    pub fn into_inner(mut self) -> Result<W> {
        self.finish_all()?;
        self.stream.into_inner()
    }

    fn patch_header(&mut self, open: OpenAtom) -> Result<u64> {
        let end_pos = self.stream.pos();
        let size = end_pos - open.offset;

        self.stream.seek(open.offset)?;
        if open.wide {
            if size - ATOM_HEADER_SIZE <= u32::MAX as u64 {
                // Compact: an 8-byte `wide` placeholder followed by an
                // ordinary header whose size excludes the placeholder.
                self.stream.write_u32(ATOM_HEADER_SIZE as u32)?;
                self.stream.write_fourcc(b"wide")?;
                self.stream.write_u32((size - ATOM_HEADER_SIZE) as u32)?;
                self.stream.write_fourcc(open.atom_type)?;
            } else {
                // Extended: size field 1, then the 64-bit length
                // covering the whole atom including this header.
                self.stream.write_u32(EXTENDED_SIZE_MARKER)?;
                self.stream.write_fourcc(open.atom_type)?;
                self.stream.write_u64(size)?;
            }
        } else {
            if size > u32::MAX as u64 {
                return Err(Error::StructuralOverflow { atom_type: open.atom_type, size });
            }
            self.stream.write_u32(size as u32)?;
        }
        self.stream.seek(end_pos)?;
        Ok(size)
    }
}
