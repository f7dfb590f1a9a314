//! Web-optimized movie rewriting.
//!
//! A finished movie has its metadata at the end of the file; streaming
//! playback wants it at the front. Rewriting relocates the `moov` tree
//! before the media data, optionally zlib-compressed inside a
//! `moov{cmov{dcom,cmvd}}` wrapper, and shifts every chunk offset by
//! the relocation delta.
//!
//! The layout is circular: chunk offsets depend on where `mdat` lands,
//! which depends on the serialized (and compressed) metadata size,
//! which depends on the chunk offsets. The rewrite resolves this by
//! fixed-point iteration over the reserved header size, padding the
//! final slack with a `free` atom.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::debug;

use crate::atoms::{AtomWriter, ATOM_HEADER_SIZE};
use crate::track::Track;
use crate::util::{Error, Result};

use super::{write_ftyp, write_moov, QuickTimeWriter, State, FTYP_SIZE};

/// Reservation passes before giving up. Compressed size varies only
/// mildly with the offsets it encodes, so convergence normally takes
/// two passes.
const MAX_OPTIMIZE_PASSES: u32 = 10;

/// Minimum `free` atom: a bare header.
const FREE_ATOM_MIN: u64 = ATOM_HEADER_SIZE;

/// Fixed wrapper bytes around the compressed payload:
/// `moov`(8) + `cmov`(8) + `dcom`(12) + `cmvd` header(12).
const CMOV_OVERHEAD: u64 = 40;

const COPY_BUF_SIZE: usize = 64 * 1024;

impl<W: Read + Write + Seek> QuickTimeWriter<W> {
    /// Rewrite the finished movie into `out` with the metadata in
    /// front of the media data, returning the output stream.
    ///
    /// With `compress_header` the `moov` tree is zlib-deflated into a
    /// `cmov` wrapper. The source writer must be finished and stays
    /// usable for further rewrites.
    pub fn to_web_optimized_movie<O: Write + Seek>(
        &mut self,
        out: O,
        compress_header: bool,
    ) -> Result<O> {
        if self.state != State::Finished {
            return Err(Error::track(format!(
                "web optimization requires a finished movie (state: {})",
                self.state.name()
            )));
        }

        let mut w = AtomWriter::new(out)?;
        let base = w.pos();
        let mdat_len = self.mdat_end - self.mdat_offset;

        // First guess from the unshifted tree; offsets only grow the
        // tables when the stco/co64 choice flips.
        let probe = self.serialize_moov(0)?;
        let mut reserved = if compress_header {
            deflate(&probe)?.len() as u64 + CMOV_OVERHEAD + FREE_ATOM_MIN
        } else {
            probe.len() as u64 + FREE_ATOM_MIN
        };

        let mut header: Option<Header> = None;
        let mut needed = 0;
        for pass in 0..MAX_OPTIMIZE_PASSES {
            let delta = (base + FTYP_SIZE + reserved) as i64 - self.mdat_offset as i64;
            let raw = self.serialize_moov(delta)?;
            needed = if compress_header {
                let compressed = deflate(&raw)?;
                let n = compressed.len() as u64 + CMOV_OVERHEAD + FREE_ATOM_MIN;
                if n <= reserved {
                    header = Some(Header::Compressed { raw_len: raw.len() as u64, compressed });
                    break;
                }
                n
            } else {
                let n = raw.len() as u64 + FREE_ATOM_MIN;
                if n <= reserved {
                    header = Some(Header::Plain(raw));
                    break;
                }
                n
            };
            debug!(pass, needed, reserved, "metadata reservation too small, retrying");
            reserved = needed + needed / 10 + 1024;
        }
        let Some(header) = header else {
            return Err(Error::OptimizeRetriesExhausted { reserved, compressed: needed });
        };

        write_ftyp(&mut w)?;
        match header {
            Header::Compressed { raw_len, compressed } => {
                if raw_len > u32::MAX as u64 {
                    return Err(Error::StructuralOverflow {
                        atom_type: b"cmvd".into(),
                        size: raw_len,
                    });
                }
                w.begin(b"moov")?;
                w.begin(b"cmov")?;
                w.leaf(b"dcom", |s| s.write_fourcc(b"zlib"))?;
                w.leaf(b"cmvd", |s| {
                    s.write_u32(raw_len as u32)?; // uncompressed size
                    s.write_bytes(&compressed)
                })?;
                w.end(b"cmov")?;
                w.end(b"moov")?;
            }
            Header::Plain(raw) => {
                w.stream().write_bytes(&raw)?;
            }
        }

        // Pad the remaining reservation so mdat lands exactly where
        // the chunk offsets say it does.
        let pad = base + FTYP_SIZE + reserved - w.pos();
        w.begin(b"free")?;
        w.stream().write_zeros((pad - ATOM_HEADER_SIZE) as usize)?;
        w.end(b"free")?;

        self.copy_mdat(&mut w, mdat_len)?;
        self.atoms.stream().seek_end()?;
        w.flush()?;
        w.into_inner()
    }

    /// Serialize a complete `moov` atom with the given chunk-offset
    /// shift into memory.
    fn serialize_moov(&self, chunk_offset_delta: i64) -> Result<Vec<u8>> {
        let ctx = self.movie_context(chunk_offset_delta);
        let tracks: &[Track] = &self.tracks;
        let mut w = AtomWriter::new(Cursor::new(Vec::new()))?;
        write_moov(&mut w, tracks, &ctx)?;
        Ok(w.into_inner()?.into_inner())
    }

    /// Copy the source `mdat` atom, header included, byte for byte.
    fn copy_mdat<O: Write + Seek>(&mut self, w: &mut AtomWriter<O>, len: u64) -> Result<()> {
        let src = self.atoms.stream().inner_mut()?;
        src.seek(SeekFrom::Start(self.mdat_offset))?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = src.read(&mut buf[..want])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "media data ended early during rewrite",
                )
                .into());
            }
            w.stream().write_bytes(&buf[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

enum Header {
    Compressed { raw_len: u64, compressed: Vec<u8> },
    Plain(Vec<u8>),
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
