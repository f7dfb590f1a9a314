//! Movie writer orchestrator.
//!
//! Owns the backing stream, the track list, and the chain of open
//! atoms, and drives the file through its lifecycle:
//! `Realized → Started → Finished → Closed`. The first mutating call
//! writes the `ftyp` atom and opens the wide `mdat`; `finish` closes
//! `mdat` and serializes the `moov` metadata tree; `close` releases
//! the stream. Calls after `finish` other than `close` and
//! `to_web_optimized_movie` fail; calls after `close` always fail.

mod optimize;

use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::path::Path;

use tracing::debug;

use crate::atoms::AtomWriter;
use crate::rle::{AppleRleEncoder, FrameBuf, PixelDepth};
use crate::track::{AudioMedia, Edit, Media, MovieContext, Sample, Track, VideoMedia};
use crate::util::fixed::mac_timestamp_now;
use crate::util::{Error, Result};

/// Default movie timescale: 600 units per second.
pub const DEFAULT_MOVIE_TIME_SCALE: u32 = 600;

/// Total size of the fixed `ftyp` atom.
pub(crate) const FTYP_SIZE: u64 = 20;

const DEFAULT_VIDEO_QUALITY: f32 = 0.97;
const DEFAULT_SYNC_INTERVAL: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Created; tracks may be added, nothing written yet.
    Realized,
    /// `ftyp` written and `mdat` open; samples are being ingested.
    Started,
    /// `mdat` closed and `moov` written; the file is complete.
    Finished,
    /// The stream has been released.
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            Self::Realized => "realized",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Closed => "closed",
        }
    }
}

/// Writer for QuickTime `.mov` movie files.
pub struct QuickTimeWriter<W: Write + Seek> {
    atoms: AtomWriter<W>,
    state: State,
    movie_time_scale: u32,
    creation_time: u32,
    tracks: Vec<Track>,
    /// Offset of the `mdat` atom header.
    mdat_offset: u64,
    /// One past the last `mdat` byte, set by `finish`.
    mdat_end: u64,
}

impl QuickTimeWriter<File> {
    /// Create a movie file at `path`, truncating any existing file.
    ///
    /// The file is opened read-write so it can later be rewritten by
    /// [`QuickTimeWriter::to_web_optimized_movie`].
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::new(file)
    }
}

impl<W: Write + Seek> QuickTimeWriter<W> {
    /// Wrap a stream. Nothing is written until the first mutating
    /// call.
    pub fn new(inner: W) -> Result<Self> {
        Ok(Self {
            atoms: AtomWriter::new(inner)?,
            state: State::Realized,
            movie_time_scale: DEFAULT_MOVIE_TIME_SCALE,
            creation_time: mac_timestamp_now(),
            tracks: Vec::new(),
            mdat_offset: 0,
            mdat_end: 0,
        })
    }

    /// Number of tracks added so far.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Set the movie timescale (units per second). Only allowed
    /// before the first sample is written.
    pub fn set_movie_time_scale(&mut self, time_scale: u32) -> Result<()> {
        self.ensure_realized("set the movie timescale")?;
        if time_scale == 0 {
            return Err(Error::track("movie timescale must be nonzero"));
        }
        self.movie_time_scale = time_scale;
        Ok(())
    }

    /// Set the creation timestamp (seconds since 1904-01-01 UTC)
    /// stored in the movie and track headers. Only allowed before the
    /// first sample is written.
    pub fn set_creation_time(&mut self, mac_seconds: u32) -> Result<()> {
        self.ensure_realized("set the creation time")?;
        self.creation_time = mac_seconds;
        Ok(())
    }

    /// Add a video track and return its index. Tracks can only be
    /// added before the first sample is written.
    ///
    /// `compression_type` is the sample-description format code, e.g.
    /// `b"rle "` for the built-in Animation encoder or `b"jpeg"` /
    /// `b"png "` for externally encoded samples. `depth` is bits per
    /// pixel.
    pub fn add_video_track(
        &mut self,
        compression_type: &[u8; 4],
        media_time_scale: u32,
        width: u32,
        height: u32,
        depth: u16,
    ) -> Result<usize> {
        self.ensure_realized("add a video track")?;
        if media_time_scale == 0 {
            return Err(Error::track("media timescale must be nonzero"));
        }
        if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
            return Err(Error::track(format!("invalid video dimensions {width}x{height}")));
        }
        self.tracks.push(Track::new(
            Media::Video(VideoMedia {
                compression_type: compression_type.into(),
                width,
                height,
                depth,
                quality: DEFAULT_VIDEO_QUALITY,
                sync_interval: DEFAULT_SYNC_INTERVAL,
                encoder: None,
                scratch: Vec::new(),
            }),
            media_time_scale,
        ));
        Ok(self.tracks.len() - 1)
    }

    /// Add an audio track and return its index. Tracks can only be
    /// added before the first sample is written.
    ///
    /// `format` is the sound sample-description format code (e.g.
    /// `b"twos"`). Samples are handed in pre-encoded through
    /// [`write_samples`](Self::write_samples).
    pub fn add_audio_track(
        &mut self,
        format: &[u8; 4],
        media_time_scale: u32,
        sample_rate: f64,
        sample_size_bits: u16,
        channels: u16,
        samples_per_packet: u32,
        bytes_per_packet: u32,
    ) -> Result<usize> {
        self.ensure_realized("add an audio track")?;
        if media_time_scale == 0 {
            return Err(Error::track("media timescale must be nonzero"));
        }
        if channels == 0 {
            return Err(Error::track("audio track needs at least one channel"));
        }
        if !(sample_rate > 0.0) {
            return Err(Error::track(format!("invalid sample rate {sample_rate}")));
        }
        self.tracks.push(Track::new(
            Media::Audio(AudioMedia {
                format: format.into(),
                channels,
                sample_size_bits,
                sample_rate,
                samples_per_packet,
                bytes_per_packet,
            }),
            media_time_scale,
        ));
        Ok(self.tracks.len() - 1)
    }

    /// Set the compression quality (0.0..=1.0) stored in a video
    /// track's sample description.
    pub fn set_compression_quality(&mut self, track: usize, quality: f32) -> Result<()> {
        self.ensure_writable("set the compression quality")?;
        match &mut self.track_mut(track)?.media {
            Media::Video(v) => {
                v.quality = quality.clamp(0.0, 1.0);
                Ok(())
            }
            Media::Audio(_) => Err(Error::track("compression quality applies to video tracks")),
        }
    }

    /// Set a video track's key-frame interval: every n-th frame
    /// written through [`write_frame`](Self::write_frame) is encoded
    /// as a key frame. 0 makes every frame a key frame.
    pub fn set_sync_interval(&mut self, track: usize, interval: u32) -> Result<()> {
        self.ensure_writable("set the sync interval")?;
        match &mut self.track_mut(track)?.media {
            Media::Video(v) => {
                v.sync_interval = interval;
                Ok(())
            }
            Media::Audio(_) => Err(Error::track("sync interval applies to video tracks")),
        }
    }

    /// Install a track's edit list. The last edit must not be empty.
    pub fn set_edit_list(&mut self, track: usize, edits: Vec<Edit>) -> Result<()> {
        self.ensure_writable("set an edit list")?;
        self.track_mut(track)?.set_edit_list(edits)
    }

    /// Encode a raw frame with the track's built-in encoder and write
    /// it as one sample. The track must use the `rle ` compression
    /// type; pre-encoded formats go through
    /// [`write_sample`](Self::write_sample).
    pub fn write_frame(&mut self, track: usize, frame: FrameBuf<'_>, duration: u64) -> Result<()> {
        self.ensure_writable("write a frame")?;
        if duration == 0 {
            return Err(Error::track("sample duration must be nonzero"));
        }
        self.track_mut(track)?;
        self.ensure_started()?;

        let t = &mut self.tracks[track];
        let frame_index = t.sample_count();
        let Media::Video(v) = &mut t.media else {
            return Err(Error::track(format!("track {track} is not a video track")));
        };
        if &v.compression_type.bytes() != b"rle " {
            return Err(Error::unsupported(format!(
                "no built-in encoder for '{}'; write pre-encoded samples instead",
                v.compression_type
            )));
        }
        let depth = PixelDepth::from_bits(v.depth)?;
        let (width, height) = (v.width, v.height);
        let encoder = v
            .encoder
            .get_or_insert_with(|| AppleRleEncoder::new(width, height, depth));
        let is_key = encoder.needs_key_frame()
            || v.sync_interval == 0
            || frame_index % v.sync_interval as u64 == 0;

        let mut scratch = std::mem::take(&mut v.scratch);
        scratch.clear();
        if is_key {
            encoder.encode_key_frame(frame, &mut scratch)?;
        } else {
            encoder.encode_delta_frame(frame, &mut scratch)?;
        }

        let offset = self.atoms.pos();
        self.atoms.stream().write_bytes(&scratch)?;
        let length = scratch.len() as u64;

        let t = &mut self.tracks[track];
        if let Media::Video(v) = &mut t.media {
            v.scratch = scratch;
        }
        t.add_sample(Sample { duration, offset, length }, 1, is_key);
        Ok(())
    }

    /// Write one pre-encoded sample.
    pub fn write_sample(
        &mut self,
        track: usize,
        data: &[u8],
        duration: u64,
        is_sync: bool,
    ) -> Result<()> {
        self.ensure_writable("write a sample")?;
        if duration == 0 {
            return Err(Error::track("sample duration must be nonzero"));
        }
        self.track_mut(track)?;
        self.ensure_started()?;

        let offset = self.atoms.pos();
        self.atoms.stream().write_bytes(data)?;
        self.tracks[track].add_sample(
            Sample { duration, offset, length: data.len() as u64 },
            1,
            is_sync,
        );
        Ok(())
    }

    /// Write a contiguous run of `sample_count` equal-duration,
    /// equal-length samples in one call (the batch path used for
    /// audio). The run folds into the sample tables exactly as if the
    /// samples were written one at a time.
    pub fn write_samples(
        &mut self,
        track: usize,
        sample_count: u64,
        data: &[u8],
        sample_duration: u64,
        is_sync: bool,
    ) -> Result<()> {
        self.ensure_writable("write samples")?;
        if sample_count == 0 {
            return Err(Error::track("sample count must be nonzero"));
        }
        if sample_duration == 0 {
            return Err(Error::track("sample duration must be nonzero"));
        }
        if data.len() as u64 % sample_count != 0 {
            return Err(Error::track(format!(
                "{} bytes do not divide into {sample_count} equal samples",
                data.len()
            )));
        }
        self.track_mut(track)?;
        self.ensure_started()?;

        let offset = self.atoms.pos();
        self.atoms.stream().write_bytes(data)?;
        self.tracks[track].add_samples(
            sample_count,
            sample_duration,
            offset,
            data.len() as u64 / sample_count,
            1,
            is_sync,
        );
        Ok(())
    }

    /// Advisory check: true when the file is approaching the size at
    /// which 32-bit chunk-offset tables stop fitting.
    pub fn is_data_limit_reached(&self) -> bool {
        self.atoms.pos() >= u32::MAX as u64 - (1 << 24)
    }

    /// Close the `mdat` atom and write the `moov` metadata tree. The
    /// file is complete afterward; only `close` and
    /// `to_web_optimized_movie` may follow.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            State::Closed => return Err(Error::track("writer is closed")),
            State::Finished => return Ok(()),
            State::Realized | State::Started => {}
        }
        self.ensure_started()?;
        self.atoms.end(b"mdat")?;
        self.mdat_end = self.atoms.pos();

        let ctx = self.movie_context(0);
        write_moov(&mut self.atoms, &self.tracks, &ctx)?;
        self.atoms.flush()?;
        self.state = State::Finished;
        debug!(
            tracks = self.tracks.len(),
            bytes = self.atoms.pos(),
            "movie finished"
        );
        Ok(())
    }

    /// Finish the movie if needed and release the stream. Even when
    /// finishing fails the stream is still flushed and the writer
    /// closed, so no handle is leaked; the file is invalid in that
    /// case.
    pub fn close(&mut self) -> Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        let finished = if self.state == State::Finished {
            Ok(())
        } else {
            self.finish()
        };
        let flushed = self.atoms.flush();
        self.state = State::Closed;
        finished.and(flushed)
    }

    /// Close the movie if needed and unwrap the underlying stream.
    pub fn into_stream(mut self) -> Result<W> {
        if self.state != State::Closed {
            self.close()?;
        }
        self.atoms.into_inner()
    }

    fn movie_context(&self, chunk_offset_delta: i64) -> MovieContext {
        MovieContext {
            movie_time_scale: self.movie_time_scale,
            creation_time: self.creation_time,
            modification_time: self.creation_time,
            chunk_offset_delta,
        }
    }

    fn track_mut(&mut self, index: usize) -> Result<&mut Track> {
        let count = self.tracks.len();
        self.tracks
            .get_mut(index)
            .ok_or_else(|| Error::track(format!("track index {index} out of range ({count} tracks)")))
    }

    fn ensure_realized(&self, what: &str) -> Result<()> {
        if self.state != State::Realized {
            return Err(Error::track(format!(
                "cannot {what} once writing has started (state: {})",
                self.state.name()
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self, what: &str) -> Result<()> {
        match self.state {
            State::Realized | State::Started => Ok(()),
            State::Finished | State::Closed => Err(Error::track(format!(
                "cannot {what}: writer is {}",
                self.state.name()
            ))),
        }
    }

    /// Write the file prolog on the first mutating call: the `ftyp`
    /// atom and the opening of the wide `mdat`.
    fn ensure_started(&mut self) -> Result<()> {
        match self.state {
            State::Started => Ok(()),
            State::Realized => {
                write_ftyp(&mut self.atoms)?;
                self.mdat_offset = self.atoms.pos();
                self.atoms.begin_wide(b"mdat")?;
                self.state = State::Started;
                Ok(())
            }
            State::Finished | State::Closed => Err(Error::track(format!(
                "writer is {}",
                self.state.name()
            ))),
        }
    }
}

pub(crate) fn write_ftyp<W: Write + Seek>(w: &mut AtomWriter<W>) -> Result<()> {
    let size = w.leaf(b"ftyp", |s| {
        s.write_fourcc(b"qt  ")?; // major brand
        s.write_u32(0x0000_0200)?; // minor version
        s.write_fourcc(b"qt  ")?; // compatible brand
        Ok(())
    })?;
    debug_assert_eq!(size, FTYP_SIZE);
    Ok(())
}

/// Serialize the complete `moov` tree for the given tracks.
pub(crate) fn write_moov<W: Write + Seek>(
    w: &mut AtomWriter<W>,
    tracks: &[Track],
    ctx: &MovieContext,
) -> Result<()> {
    let duration = tracks
        .iter()
        .map(|t| t.track_duration(ctx.movie_time_scale))
        .max()
        .unwrap_or(0);

    w.begin(b"moov")?;
    w.leaf(b"mvhd", |s| {
        s.write_u32(0)?; // version + flags
        s.write_u32(ctx.creation_time)?;
        s.write_u32(ctx.modification_time)?;
        s.write_u32(ctx.movie_time_scale)?;
        s.write_u32(duration.min(u32::MAX as u64) as u32)?;
        s.write_fixed_16_16(1.0)?; // preferred rate
        s.write_fixed_8_8(1.0)?; // preferred volume
        s.write_zeros(10)?;
        // Identity matrix, rows of (16.16, 16.16, 2.30).
        s.write_fixed_16_16(1.0)?;
        s.write_fixed_16_16(0.0)?;
        s.write_fixed_2_30(0.0)?;
        s.write_fixed_16_16(0.0)?;
        s.write_fixed_16_16(1.0)?;
        s.write_fixed_2_30(0.0)?;
        s.write_fixed_16_16(0.0)?;
        s.write_fixed_16_16(0.0)?;
        s.write_fixed_2_30(1.0)?;
        s.write_u32(0)?; // preview time
        s.write_u32(0)?; // preview duration
        s.write_u32(0)?; // poster time
        s.write_u32(0)?; // selection time
        s.write_u32(0)?; // selection duration
        s.write_u32(0)?; // current time
        s.write_u32(tracks.len() as u32 + 1)?; // next track id
        Ok(())
    })?;
    for (i, track) in tracks.iter().enumerate() {
        track.write_trak(w, ctx, i as u32 + 1)?;
    }
    w.end(b"moov")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn writer() -> QuickTimeWriter<Cursor<Vec<u8>>> {
        QuickTimeWriter::new(Cursor::new(Vec::new())).expect("writer")
    }

    #[test]
    fn test_nothing_written_before_first_sample() {
        let mut w = writer();
        w.add_video_track(b"rle ", 600, 64, 64, 24).expect("track");
        w.set_movie_time_scale(1000).expect("timescale");
        assert_eq!(w.atoms.pos(), 0);
    }

    #[test]
    fn test_track_adds_rejected_after_start() {
        let mut w = writer();
        let t = w.add_video_track(b"jpeg", 600, 64, 64, 24).expect("track");
        w.write_sample(t, &[1, 2, 3], 25, true).expect("sample");
        assert!(w.add_video_track(b"rle ", 600, 64, 64, 24).is_err());
        assert!(w.add_audio_track(b"twos", 44100, 44100.0, 16, 2, 1, 2).is_err());
        assert!(w.set_movie_time_scale(90_000).is_err());
    }

    #[test]
    fn test_writes_rejected_after_finish() {
        let mut w = writer();
        let t = w.add_video_track(b"jpeg", 600, 64, 64, 24).expect("track");
        w.write_sample(t, &[0; 8], 25, true).expect("sample");
        w.finish().expect("finish");
        assert!(w.write_sample(t, &[0; 8], 25, true).is_err());
        assert!(w.set_edit_list(t, vec![Edit::new(100, 0)]).is_err());
        // finish is idempotent, close still works.
        w.finish().expect("finish again");
        w.close().expect("close");
        assert!(w.finish().is_err());
        w.close().expect("close again");
    }

    #[test]
    fn test_close_finishes_unfinished_movie() {
        let mut w = writer();
        let t = w.add_video_track(b"jpeg", 600, 64, 64, 24).expect("track");
        w.write_sample(t, &[0; 8], 25, true).expect("sample");
        w.close().expect("close");
        assert_eq!(w.state, State::Closed);
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        let mut w = writer();
        assert!(w.add_video_track(b"rle ", 0, 64, 64, 24).is_err());
        assert!(w.add_video_track(b"rle ", 600, 0, 64, 24).is_err());
        assert!(w.set_movie_time_scale(0).is_err());
        let t = w.add_video_track(b"jpeg", 600, 64, 64, 24).expect("track");
        assert!(w.write_sample(t, &[0; 8], 0, true).is_err());
        assert!(w.write_sample(t + 1, &[0; 8], 25, true).is_err());
        assert!(w.write_samples(t, 3, &[0; 8], 25, true).is_err());
        assert!(w.set_compression_quality(t, 0.5).is_ok());
    }

    #[test]
    fn test_frame_encoder_requires_rle_track() {
        let mut w = writer();
        let t = w.add_video_track(b"jpeg", 600, 4, 4, 24).expect("track");
        let frame = [0u32; 16];
        let err = w.write_frame(t, FrameBuf::Rgb24(&frame), 25).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMedia(_)));
    }

    #[test]
    fn test_unsupported_depth_rejected() {
        let mut w = writer();
        let t = w.add_video_track(b"rle ", 600, 4, 4, 8).expect("track");
        let frame = [0u32; 16];
        let err = w.write_frame(t, FrameBuf::Rgb24(&frame), 25).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMedia(_)));
    }
}
