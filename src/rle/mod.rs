//! Apple Animation (RLE) lossless video encoder.
//!
//! Scanline run-length/delta codec for 16-bit (5-5-5 RGB), 24-bit
//! (8-8-8 RGB) and 32-bit (8-8-8-8 ARGB) rasters. Each encoded frame
//! is one chunk: a 32-bit length counting from the start of its own
//! header, a 16-bit flags word (0x0000 whole frame, 0x0008 partial
//! band with start line and line count), then per-scanline opcode
//! streams. Scanline opcodes are a leading skip byte (`skip + 1`,
//! chained through 0x00 continuation opcodes above 254 pixels), signed
//! literal/repeat counts (positive N copies N pixels from the stream,
//! negative −N repeats one pixel N times), and the −1 end-of-line
//! terminator.
//!
//! A delta frame identical to its predecessor encodes as exactly four
//! bytes whose big-endian value is 4.

use crate::util::{Error, Result};

/// Longest literal run a single positive opcode can carry.
const MAX_LITERAL_RUN: usize = 127;

/// Longest repeat run a single negative opcode can carry.
const MAX_REPEAT_RUN: usize = 127;

/// Longest skip a single count byte can carry; longer runs chain.
const MAX_SKIP_RUN: usize = 254;

/// End-of-scanline opcode (−1).
const END_OF_LINE: u8 = 0xFF;

/// Whole chunk emitted when a delta frame has no changed pixels.
const NO_CHANGE_CHUNK: u32 = 4;

/// Chunk flags: every scanline of the frame follows.
const FLAGS_WHOLE_FRAME: u16 = 0x0000;

/// Chunk flags: only the scanlines of a vertical band follow.
const FLAGS_PARTIAL_BAND: u16 = 0x0008;

/// Pixel depths the encoder implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDepth {
    /// 16-bit 5-5-5 RGB.
    Rgb555,
    /// 24-bit 8-8-8 RGB, carried in the low bits of a `u32`.
    Rgb24,
    /// 32-bit 8-8-8-8 ARGB.
    Argb32,
}

impl PixelDepth {
    /// Bits per pixel as stored in the video sample description.
    pub fn bits(self) -> u16 {
        match self {
            Self::Rgb555 => 16,
            Self::Rgb24 => 24,
            Self::Argb32 => 32,
        }
    }

    /// Map a bit depth to an implemented pixel format.
    pub fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            16 => Ok(Self::Rgb555),
            24 => Ok(Self::Rgb24),
            32 => Ok(Self::Argb32),
            other => Err(Error::unsupported(format!(
                "{other}-bit rasters are not supported by the RLE encoder (16, 24 or 32)"
            ))),
        }
    }
}

/// One frame of raw pixels, scanlines top to bottom, no padding
/// between lines.
#[derive(Clone, Copy)]
pub enum FrameBuf<'a> {
    /// 5-5-5 RGB in the low 15 bits of each word.
    Rgb555(&'a [u16]),
    /// 8-8-8 RGB in the low 24 bits of each word.
    Rgb24(&'a [u32]),
    /// 8-8-8-8 ARGB.
    Argb32(&'a [u32]),
}

impl FrameBuf<'_> {
    /// The pixel depth of this buffer.
    pub fn depth(&self) -> PixelDepth {
        match self {
            Self::Rgb555(_) => PixelDepth::Rgb555,
            Self::Rgb24(_) => PixelDepth::Rgb24,
            Self::Argb32(_) => PixelDepth::Argb32,
        }
    }

    /// Number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            Self::Rgb555(p) => p.len(),
            Self::Rgb24(p) | Self::Argb32(p) => p.len(),
        }
    }

    /// True if the buffer holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
enum PrevFrame {
    None,
    Rgb555(Vec<u16>),
    Rgb24(Vec<u32>),
    Argb32(Vec<u32>),
}

/// Stateful encoder for one video track.
///
/// Holds a deep copy of the previous frame's pixels, refreshed after
/// every encode call; callers may freely mutate or discard their
/// source buffer afterward. Not safe for concurrent encode calls.
#[derive(Debug)]
pub struct AppleRleEncoder {
    width: usize,
    height: usize,
    depth: PixelDepth,
    prev: PrevFrame,
}

impl AppleRleEncoder {
    /// Create an encoder for frames of the given geometry.
    pub fn new(width: u32, height: u32, depth: PixelDepth) -> Self {
        Self {
            width: width as usize,
            height: height as usize,
            depth,
            prev: PrevFrame::None,
        }
    }

    /// The pixel depth this encoder was created for.
    pub fn depth(&self) -> PixelDepth {
        self.depth
    }

    /// True until a first frame has been encoded; a delta has nothing
    /// to diff against before that.
    pub fn needs_key_frame(&self) -> bool {
        matches!(self.prev, PrevFrame::None)
    }

    /// Encode `frame` as a key frame, appending one complete chunk to
    /// `out`.
    pub fn encode_key_frame(&mut self, frame: FrameBuf<'_>, out: &mut Vec<u8>) -> Result<()> {
        self.check_frame(&frame)?;
        match frame {
            FrameBuf::Rgb555(cur) => encode_key_lines(cur, self.width, out, &put_u16),
            FrameBuf::Rgb24(cur) => encode_key_lines(cur, self.width, out, &put_rgb24),
            FrameBuf::Argb32(cur) => encode_key_lines(cur, self.width, out, &put_u32),
        }
        self.remember(frame);
        Ok(())
    }

    /// Encode `frame` as a delta against the previous frame, appending
    /// one complete chunk to `out`.
    pub fn encode_delta_frame(&mut self, frame: FrameBuf<'_>, out: &mut Vec<u8>) -> Result<()> {
        self.check_frame(&frame)?;
        match (&self.prev, frame) {
            (PrevFrame::Rgb555(prev), FrameBuf::Rgb555(cur)) => {
                encode_delta_lines(cur, prev, self.width, self.height, out, &put_u16)
            }
            (PrevFrame::Rgb24(prev), FrameBuf::Rgb24(cur)) => {
                encode_delta_lines(cur, prev, self.width, self.height, out, &put_rgb24)
            }
            (PrevFrame::Argb32(prev), FrameBuf::Argb32(cur)) => {
                encode_delta_lines(cur, prev, self.width, self.height, out, &put_u32)
            }
            (PrevFrame::None, _) => {
                return Err(Error::track("delta frame requested before any key frame"))
            }
            _ => unreachable!("frame depth checked against encoder depth"),
        }
        self.remember(frame);
        Ok(())
    }

    fn check_frame(&self, frame: &FrameBuf<'_>) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::track("encoder has zero-sized frame geometry"));
        }
        if frame.depth() != self.depth {
            return Err(Error::track(format!(
                "frame depth {} does not match track depth {}",
                frame.depth().bits(),
                self.depth.bits()
            )));
        }
        if frame.len() != self.width * self.height {
            return Err(Error::track(format!(
                "frame holds {} pixels, track is {}x{}",
                frame.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }

    fn remember(&mut self, frame: FrameBuf<'_>) {
        self.prev = match frame {
            FrameBuf::Rgb555(p) => PrevFrame::Rgb555(p.to_vec()),
            FrameBuf::Rgb24(p) => PrevFrame::Rgb24(p.to_vec()),
            FrameBuf::Argb32(p) => PrevFrame::Argb32(p.to_vec()),
        };
    }
}

fn put_u16(v: u16, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_rgb24(v: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

fn put_u32(v: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Reserve the 32-bit chunk-length field, returning its offset for
/// back-patching.
fn begin_chunk(out: &mut Vec<u8>) -> usize {
    let at = out.len();
    out.extend_from_slice(&[0u8; 4]);
    at
}

/// Patch the chunk-length field with the distance from the field's own
/// start to the end of the chunk.
fn end_chunk(out: &mut Vec<u8>, at: usize) {
    let size = (out.len() - at) as u32;
    out[at..at + 4].copy_from_slice(&size.to_be_bytes());
}

fn encode_key_lines<T, F>(cur: &[T], width: usize, out: &mut Vec<u8>, put: &F)
where
    T: Copy + Eq,
    F: Fn(T, &mut Vec<u8>),
{
    let at = begin_chunk(out);
    out.extend_from_slice(&FLAGS_WHOLE_FRAME.to_be_bytes());
    for line in cur.chunks_exact(width) {
        // Skip byte 1: skip nothing.
        out.push(1);
        encode_run_stream(line, 0, line.len().wrapping_sub(1), out, put);
        out.push(END_OF_LINE);
    }
    end_chunk(out, at);
}

fn encode_delta_lines<T, F>(
    cur: &[T],
    prev: &[T],
    width: usize,
    height: usize,
    out: &mut Vec<u8>,
    put: &F,
) where
    T: Copy + Eq,
    F: Fn(T, &mut Vec<u8>),
{
    // Minimal vertical band containing any change.
    let mut top = 0;
    while top < height && scanline(cur, width, top) == scanline(prev, width, top) {
        top += 1;
    }
    if top == height {
        out.extend_from_slice(&NO_CHANGE_CHUNK.to_be_bytes());
        return;
    }
    let mut bot = height;
    while bot > top + 1 && scanline(cur, width, bot - 1) == scanline(prev, width, bot - 1) {
        bot -= 1;
    }

    let at = begin_chunk(out);
    if top == 0 && bot == height {
        out.extend_from_slice(&FLAGS_WHOLE_FRAME.to_be_bytes());
    } else {
        out.extend_from_slice(&FLAGS_PARTIAL_BAND.to_be_bytes());
        out.extend_from_slice(&(top as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&((bot - top) as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
    }

    for y in top..bot {
        encode_delta_line(scanline(cur, width, y), scanline(prev, width, y), out, put);
    }
    end_chunk(out, at);
}

fn scanline<T>(buf: &[T], width: usize, y: usize) -> &[T] {
    &buf[y * width..(y + 1) * width]
}

fn encode_delta_line<T, F>(cur: &[T], prev: &[T], out: &mut Vec<u8>, put: &F)
where
    T: Copy + Eq,
    F: Fn(T, &mut Vec<u8>),
{
    // The unchanged tail of a line is free: ending the line skips it.
    let mut end = cur.len();
    while end > 0 && cur[end - 1] == prev[end - 1] {
        end -= 1;
    }
    if end == 0 {
        // Interior band line with no changes: skip nothing, end line.
        out.push(1);
        out.push(END_OF_LINE);
        return;
    }
    let last = end - 1;

    let mut x = 0;
    while cur[x] == prev[x] {
        x += 1;
    }
    push_leading_skip(out, x);

    encode_dirty_region(cur, prev, x, last, out, put);
    out.push(END_OF_LINE);
}

/// Leading skip byte of a scanline: `skip + 1`, chained above 254.
fn push_leading_skip(out: &mut Vec<u8>, mut skip: usize) {
    let n = skip.min(MAX_SKIP_RUN);
    out.push((n + 1) as u8);
    skip -= n;
    push_skip_chain(out, skip);
}

/// Skip-continuation opcodes: 0x00 followed by a `skip + 1` count
/// byte, repeated while the run exceeds one count byte.
fn push_skip_chain(out: &mut Vec<u8>, mut skip: usize) {
    while skip > 0 {
        let n = skip.min(MAX_SKIP_RUN);
        out.push(0);
        out.push((n + 1) as u8);
        skip -= n;
    }
}

/// Literal/repeat opcode stream over `line[x..=last]`, treating pixels
/// equal to `prev` as skippable. Unchanged runs of at least 2 pixels
/// become skip-continuation opcodes; a single unchanged pixel folds
/// into the surrounding literal run, which is cheaper than a 2-byte
/// skip opcode.
fn encode_dirty_region<T, F>(
    cur: &[T],
    prev: &[T],
    mut x: usize,
    last: usize,
    out: &mut Vec<u8>,
    put: &F,
) where
    T: Copy + Eq,
    F: Fn(T, &mut Vec<u8>),
{
    let mut lit_from = x;
    let mut lit_len = 0usize;

    while x <= last {
        if cur[x] == prev[x] {
            let mut eq = 1;
            while x + eq <= last && cur[x + eq] == prev[x + eq] {
                eq += 1;
            }
            if eq >= 2 {
                flush_literal(cur, lit_from, &mut lit_len, out, put);
                push_skip_chain(out, eq);
                x += eq;
                continue;
            }
        }

        let v = cur[x];
        let mut run = 1;
        while x + run <= last && cur[x + run] == v {
            run += 1;
        }
        if run < 2 {
            if lit_len == 0 {
                lit_from = x;
            }
            lit_len += 1;
            x += 1;
            if lit_len == MAX_LITERAL_RUN {
                flush_literal(cur, lit_from, &mut lit_len, out, put);
            }
        } else {
            flush_literal(cur, lit_from, &mut lit_len, out, put);
            let mut rem = run;
            while rem > 1 {
                let n = rem.min(MAX_REPEAT_RUN);
                out.push((n as i8).wrapping_neg() as u8);
                put(v, out);
                x += n;
                rem -= n;
            }
            // A leftover single pixel re-enters the loop as a literal.
        }
    }
    flush_literal(cur, lit_from, &mut lit_len, out, put);
}

/// Key-frame opcode stream: same literal/repeat logic with nothing to
/// diff against.
fn encode_run_stream<T, F>(line: &[T], from: usize, last: usize, out: &mut Vec<u8>, put: &F)
where
    T: Copy + Eq,
    F: Fn(T, &mut Vec<u8>),
{
    if line.is_empty() {
        return;
    }
    let mut x = from;
    let mut lit_from = x;
    let mut lit_len = 0usize;

    while x <= last {
        let v = line[x];
        let mut run = 1;
        while x + run <= last && line[x + run] == v {
            run += 1;
        }
        if run < 2 {
            if lit_len == 0 {
                lit_from = x;
            }
            lit_len += 1;
            x += 1;
            if lit_len == MAX_LITERAL_RUN {
                flush_literal(line, lit_from, &mut lit_len, out, put);
            }
        } else {
            flush_literal(line, lit_from, &mut lit_len, out, put);
            let mut rem = run;
            while rem > 1 {
                let n = rem.min(MAX_REPEAT_RUN);
                out.push((n as i8).wrapping_neg() as u8);
                put(v, out);
                x += n;
                rem -= n;
            }
        }
    }
    flush_literal(line, lit_from, &mut lit_len, out, put);
}

fn flush_literal<T, F>(line: &[T], lit_from: usize, lit_len: &mut usize, out: &mut Vec<u8>, put: &F)
where
    T: Copy + Eq,
    F: Fn(T, &mut Vec<u8>),
{
    if *lit_len == 0 {
        return;
    }
    out.push(*lit_len as u8);
    for &p in &line[lit_from..lit_from + *lit_len] {
        put(p, out);
    }
    *lit_len = 0;
}
