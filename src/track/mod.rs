//! Track model: per-track bookkeeping and `trak` subtree
//! serialization.
//!
//! A track owns three independent run-length tables (durations, sizes,
//! chunks), an optional explicit sync-sample list, and its media
//! description. Serialization writes the whole
//! `trak{tkhd, edts?, mdia{mdhd, hdlr, minf{vmhd|smhd, hdlr,
//! dinf{dref}, stbl{stsd, stts, stss?, stsc, stsz, stco|co64}}}}`
//! subtree through the atom writer.

pub mod sample;

use std::io::{Seek, Write};

use crate::atoms::{AtomWriter, FourCc};
use crate::rle::AppleRleEncoder;
use crate::util::{Error, Result};

pub use sample::Sample;
use sample::{fold_chunks, fold_durations, fold_sizes, Chunk, SampleSizeGroup, TimeToSampleGroup};

/// One edit-list entry remapping the track's presentation timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edit {
    /// Duration of this edit in movie timescale units.
    pub track_duration: u64,
    /// Start of the edit in media timescale units; −1 denotes an
    /// empty edit.
    pub media_time: i64,
    /// Playback rate as 16.16 fixed point.
    pub media_rate: u32,
}

impl Edit {
    /// 16.16 fixed-point encoding of rate 1.0.
    pub const NORMAL_RATE: u32 = 0x0001_0000;

    /// `media_time` value of an empty edit.
    pub const EMPTY_TIME: i64 = -1;

    /// An edit playing media from `media_time` at normal rate.
    pub fn new(track_duration: u64, media_time: i64) -> Self {
        Self { track_duration, media_time, media_rate: Self::NORMAL_RATE }
    }

    /// True if this edit inserts empty time.
    pub fn is_empty_edit(&self) -> bool {
        self.media_time == Self::EMPTY_TIME
    }
}

/// Video-specific track state.
#[derive(Debug)]
pub(crate) struct VideoMedia {
    pub compression_type: FourCc,
    pub width: u32,
    pub height: u32,
    pub depth: u16,
    /// Compression quality in 0.0..=1.0, stored in the sample
    /// description as a spatial-quality field.
    pub quality: f32,
    /// Every n-th frame is a key frame; 0 makes every frame a key
    /// frame.
    pub sync_interval: u32,
    pub encoder: Option<AppleRleEncoder>,
    pub scratch: Vec<u8>,
}

/// Audio-specific track state.
#[derive(Debug, Clone)]
pub(crate) struct AudioMedia {
    pub format: FourCc,
    pub channels: u16,
    pub sample_size_bits: u16,
    pub sample_rate: f64,
    pub samples_per_packet: u32,
    pub bytes_per_packet: u32,
}

impl AudioMedia {
    pub fn bytes_per_frame(&self) -> u32 {
        self.bytes_per_packet * self.channels as u32
    }

    pub fn bytes_per_sample(&self) -> u32 {
        (self.sample_size_bits as u32).div_ceil(8)
    }
}

#[derive(Debug)]
pub(crate) enum Media {
    Video(VideoMedia),
    Audio(AudioMedia),
}

/// Movie-level context threaded through track serialization.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MovieContext {
    pub movie_time_scale: u32,
    pub creation_time: u32,
    pub modification_time: u32,
    /// Signed shift applied to every chunk offset, used when the
    /// media data is relocated.
    pub chunk_offset_delta: i64,
}

/// One media track of the movie being written.
pub struct Track {
    pub(crate) media: Media,
    pub(crate) media_time_scale: u32,
    time_to_samples: Vec<TimeToSampleGroup>,
    sample_sizes: Vec<SampleSizeGroup>,
    chunks: Vec<Chunk>,
    /// `None` while every sample so far is a sync sample; the `stss`
    /// atom is omitted in that case.
    sync_samples: Option<Vec<u32>>,
    sample_count: u64,
    media_duration: u64,
    edits: Option<Vec<Edit>>,
}

impl Track {
    pub(crate) fn new(media: Media, media_time_scale: u32) -> Self {
        Self {
            media,
            media_time_scale,
            time_to_samples: Vec::new(),
            sample_sizes: Vec::new(),
            chunks: Vec::new(),
            sync_samples: None,
            sample_count: 0,
            media_duration: 0,
            edits: None,
        }
    }

    /// Total number of samples ingested.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Media duration in media timescale units.
    pub fn media_duration(&self) -> u64 {
        self.media_duration
    }

    /// Fold one sample into all three run tables.
    pub(crate) fn add_sample(&mut self, s: Sample, sample_description_id: u32, is_sync: bool) {
        self.note_sync(1, is_sync);
        fold_durations(&mut self.time_to_samples, s.duration, 1);
        fold_sizes(&mut self.sample_sizes, s.length, 1);
        fold_chunks(&mut self.chunks, sample_description_id, s.offset, s.length, 1);
        self.sample_count += 1;
        self.media_duration += s.duration;
    }

    /// Fold a contiguous run of `count` identical samples, producing
    /// the same tables as `count` single adds.
    pub(crate) fn add_samples(
        &mut self,
        count: u64,
        duration: u64,
        offset: u64,
        length: u64,
        sample_description_id: u32,
        is_sync: bool,
    ) {
        if count == 0 {
            return;
        }
        self.note_sync(count, is_sync);
        fold_durations(&mut self.time_to_samples, duration, count);
        fold_sizes(&mut self.sample_sizes, length, count);
        fold_chunks(&mut self.chunks, sample_description_id, offset, length, count);
        self.sample_count += count;
        self.media_duration += duration * count;
    }

    /// Lazy sync-sample tracking. No list exists while every sample is
    /// sync; the first non-sync sample retroactively materializes the
    /// indices of all earlier samples, and the list is maintained from
    /// then on.
    fn note_sync(&mut self, count: u64, is_sync: bool) {
        match (&mut self.sync_samples, is_sync) {
            (None, true) => {}
            (Some(list), true) => {
                let first = self.sample_count + 1;
                list.extend((0..count).map(|i| (first + i) as u32));
            }
            (None, false) => {
                self.sync_samples = Some((1..=self.sample_count as u32).collect());
            }
            (Some(_), false) => {}
        }
    }

    /// Install the edit list. The list must be non-empty and its last
    /// entry must not be an empty edit.
    pub(crate) fn set_edit_list(&mut self, edits: Vec<Edit>) -> Result<()> {
        match edits.last() {
            None => return Err(Error::track("edit list must not be empty")),
            Some(last) if last.is_empty_edit() => {
                return Err(Error::track("the last edit in a list must not be empty"))
            }
            Some(_) => {}
        }
        self.edits = Some(edits);
        Ok(())
    }

    /// Track duration in movie timescale units: the explicit sum of
    /// edit durations when an edit list is present, otherwise the
    /// media duration rescaled.
    pub(crate) fn track_duration(&self, movie_time_scale: u32) -> u64 {
        match &self.edits {
            Some(edits) => edits.iter().map(|e| e.track_duration).sum(),
            None => {
                (self.media_duration as u128 * movie_time_scale as u128
                    / self.media_time_scale as u128) as u64
            }
        }
    }

    // ---------------------------------------------------------------
    // Serialization
    // ---------------------------------------------------------------

    pub(crate) fn write_trak<W: Write + Seek>(
        &self,
        w: &mut AtomWriter<W>,
        ctx: &MovieContext,
        track_id: u32,
    ) -> Result<()> {
        w.begin(b"trak")?;
        self.write_tkhd(w, ctx, track_id)?;
        if self.edits.is_some() {
            self.write_edts(w)?;
        }
        self.write_mdia(w, ctx)?;
        w.end(b"trak")?;
        Ok(())
    }

    fn write_tkhd<W: Write + Seek>(
        &self,
        w: &mut AtomWriter<W>,
        ctx: &MovieContext,
        track_id: u32,
    ) -> Result<u64> {
        let duration = self.track_duration(ctx.movie_time_scale);
        w.leaf(b"tkhd", |s| {
            s.write_u8(0)?; // version
            s.write_bytes(&[0, 0, 0x0F])?; // enabled, in movie, in preview, in poster
            s.write_u32(ctx.creation_time)?;
            s.write_u32(ctx.modification_time)?;
            s.write_u32(track_id)?;
            s.write_u32(0)?; // reserved
            s.write_u32(duration.min(u32::MAX as u64) as u32)?;
            s.write_zeros(8)?;
            s.write_u16(0)?; // layer
            s.write_u16(0)?; // alternate group
            match &self.media {
                Media::Video(_) => s.write_fixed_8_8(0.0)?,
                Media::Audio(_) => s.write_fixed_8_8(1.0)?,
            }
            s.write_u16(0)?; // reserved
            write_identity_matrix(s)?;
            match &self.media {
                Media::Video(v) => {
                    s.write_fixed_16_16(v.width as f64)?;
                    s.write_fixed_16_16(v.height as f64)?;
                }
                Media::Audio(_) => {
                    s.write_fixed_16_16(0.0)?;
                    s.write_fixed_16_16(0.0)?;
                }
            }
            Ok(())
        })
    }

    fn write_edts<W: Write + Seek>(&self, w: &mut AtomWriter<W>) -> Result<()> {
        let edits = self.edits.as_deref().unwrap_or(&[]);
        w.begin(b"edts")?;
        w.leaf(b"elst", |s| {
            s.write_u32(0)?; // version + flags
            s.write_u32(edits.len() as u32)?;
            for e in edits {
                s.write_u32(e.track_duration.min(u32::MAX as u64) as u32)?;
                s.write_i32(e.media_time as i32)?;
                s.write_u32(e.media_rate)?;
            }
            Ok(())
        })?;
        w.end(b"edts")?;
        Ok(())
    }

    fn write_mdia<W: Write + Seek>(&self, w: &mut AtomWriter<W>, ctx: &MovieContext) -> Result<()> {
        w.begin(b"mdia")?;
        w.leaf(b"mdhd", |s| {
            s.write_u32(0)?; // version + flags
            s.write_u32(ctx.creation_time)?;
            s.write_u32(ctx.modification_time)?;
            s.write_u32(self.media_time_scale)?;
            s.write_u32(self.media_duration.min(u32::MAX as u64) as u32)?;
            s.write_u16(0)?; // language
            s.write_u16(0)?; // quality
            Ok(())
        })?;
        match &self.media {
            Media::Video(_) => {
                write_hdlr(w, b"mhlr", b"vide", "Apple Video Media Handler")?
            }
            Media::Audio(_) => {
                write_hdlr(w, b"mhlr", b"soun", "Apple Sound Media Handler")?
            }
        };
        self.write_minf(w, ctx)?;
        w.end(b"mdia")?;
        Ok(())
    }

    fn write_minf<W: Write + Seek>(&self, w: &mut AtomWriter<W>, ctx: &MovieContext) -> Result<()> {
        w.begin(b"minf")?;
        match &self.media {
            Media::Video(_) => {
                w.leaf(b"vmhd", |s| {
                    s.write_u8(0)?;
                    s.write_bytes(&[0, 0, 0x01])?; // no lean ahead
                    s.write_u16(0x40)?; // graphics mode: dither copy
                    s.write_u16(0x8000)?; // opcolor
                    s.write_u16(0x8000)?;
                    s.write_u16(0x8000)?;
                    Ok(())
                })?;
            }
            Media::Audio(_) => {
                w.leaf(b"smhd", |s| {
                    s.write_u32(0)?; // version + flags
                    s.write_u16(0)?; // balance
                    s.write_u16(0)?; // reserved
                    Ok(())
                })?;
            }
        }
        write_hdlr(w, b"dhlr", b"alis", "Apple Alias Data Handler")?;
        w.begin(b"dinf")?;
        w.leaf(b"dref", |s| {
            s.write_u32(0)?; // version + flags
            s.write_u32(1)?; // entry count
            s.write_u32(12)?; // entry size
            s.write_fourcc(b"alis")?;
            s.write_u32(0x0000_0001)?; // data is in the same file
            Ok(())
        })?;
        w.end(b"dinf")?;
        self.write_stbl(w, ctx)?;
        w.end(b"minf")?;
        Ok(())
    }

    fn write_stbl<W: Write + Seek>(&self, w: &mut AtomWriter<W>, ctx: &MovieContext) -> Result<()> {
        w.begin(b"stbl")?;
        self.write_stsd(w)?;
        self.write_stts(w)?;
        self.write_stss(w)?;
        self.write_stsc(w)?;
        self.write_stsz(w)?;
        self.write_chunk_offsets(w, ctx)?;
        w.end(b"stbl")?;
        Ok(())
    }

    fn write_stsd<W: Write + Seek>(&self, w: &mut AtomWriter<W>) -> Result<()> {
        w.begin(b"stsd")?;
        w.stream().write_u32(0)?; // version + flags
        w.stream().write_u32(1)?; // entry count
        match &self.media {
            Media::Video(v) => {
                w.begin(v.compression_type)?;
                let s = w.stream();
                s.write_zeros(6)?;
                s.write_u16(1)?; // data reference index
                s.write_u16(0)?; // version
                s.write_u16(0)?; // revision
                s.write_u32(0)?; // vendor
                s.write_u32(0)?; // temporal quality
                s.write_u32((v.quality.clamp(0.0, 1.0) * 1024.0) as u32)?; // spatial quality
                s.write_u16(v.width as u16)?;
                s.write_u16(v.height as u16)?;
                s.write_fixed_16_16(72.0)?; // horizontal resolution
                s.write_fixed_16_16(72.0)?; // vertical resolution
                s.write_u32(0)?; // data size
                s.write_u16(1)?; // frame count per sample
                s.write_pascal_string(compressor_name(v.compression_type), 32)?;
                s.write_u16(v.depth)?;
                s.write_i16(-1)?; // color table id
                w.end(v.compression_type)?;
            }
            Media::Audio(a) => {
                w.begin(a.format)?;
                let s = w.stream();
                s.write_zeros(6)?;
                s.write_u16(1)?; // data reference index
                s.write_u16(1)?; // sound description version 1
                s.write_u16(0)?; // revision
                s.write_u32(0)?; // vendor
                s.write_u16(a.channels)?;
                s.write_u16(a.sample_size_bits)?;
                s.write_i16(0)?; // compression id
                s.write_u16(0)?; // packet size
                s.write_fixed_16_16(a.sample_rate)?;
                s.write_u32(a.samples_per_packet)?;
                s.write_u32(a.bytes_per_packet)?;
                s.write_u32(a.bytes_per_frame())?;
                s.write_u32(a.bytes_per_sample())?;
                w.end(a.format)?;
            }
        }
        w.end(b"stsd")?;
        Ok(())
    }

    fn write_stts<W: Write + Seek>(&self, w: &mut AtomWriter<W>) -> Result<()> {
        let groups = &self.time_to_samples;
        w.begin(b"stts")?;
        let s = w.stream();
        s.write_u32(0)?; // version + flags
        s.write_u32(groups.len() as u32)?;
        for g in groups {
            s.write_u32(g.sample_count as u32)?;
            s.write_u32(g.duration.min(u32::MAX as u64) as u32)?;
        }
        w.end_sized(b"stts", 8 + groups.len() as u64 * 8)?;
        Ok(())
    }

    /// Omitted entirely while every sample is a sync sample.
    fn write_stss<W: Write + Seek>(&self, w: &mut AtomWriter<W>) -> Result<()> {
        let Some(list) = &self.sync_samples else {
            return Ok(());
        };
        w.begin(b"stss")?;
        let s = w.stream();
        s.write_u32(0)?; // version + flags
        s.write_u32(list.len() as u32)?;
        for &index in list {
            s.write_u32(index)?;
        }
        w.end_sized(b"stss", 8 + list.len() as u64 * 4)?;
        Ok(())
    }

    fn write_stsc<W: Write + Seek>(&self, w: &mut AtomWriter<W>) -> Result<()> {
        // Runs of chunks with the same layout collapse to one entry.
        let mut entries: Vec<(u32, u64, u32)> = Vec::new();
        for (i, c) in self.chunks.iter().enumerate() {
            let same = entries
                .last()
                .is_some_and(|&(_, n, id)| n == c.sample_count && id == c.sample_description_id);
            if !same {
                entries.push((i as u32 + 1, c.sample_count, c.sample_description_id));
            }
        }
        w.begin(b"stsc")?;
        let s = w.stream();
        s.write_u32(0)?; // version + flags
        s.write_u32(entries.len() as u32)?;
        for (first_chunk, samples_per_chunk, id) in &entries {
            s.write_u32(*first_chunk)?;
            s.write_u32(*samples_per_chunk as u32)?;
            s.write_u32(*id)?;
        }
        w.end_sized(b"stsc", 8 + entries.len() as u64 * 12)?;
        Ok(())
    }

    fn write_stsz<W: Write + Seek>(&self, w: &mut AtomWriter<W>) -> Result<()> {
        let divisor = self.size_divisor() as u64;
        w.begin(b"stsz")?;
        let s = w.stream();
        s.write_u32(0)?; // version + flags
        if self.sample_sizes.len() <= 1 {
            // Compact form: one size, one count, no table.
            let size = self.sample_sizes.first().map_or(0, |g| g.length / divisor);
            s.write_u32(size as u32)?;
            s.write_u32(self.sample_count as u32)?;
        } else {
            s.write_u32(0)?;
            s.write_u32(self.sample_count as u32)?;
            for g in &self.sample_sizes {
                for _ in 0..g.sample_count {
                    s.write_u32((g.length / divisor) as u32)?;
                }
            }
        }
        w.end(b"stsz")?;
        Ok(())
    }

    /// Audio tracks divide the stored byte lengths by the
    /// channel/byte-depth factor when every run divides evenly;
    /// otherwise raw byte lengths are kept.
    fn size_divisor(&self) -> u32 {
        let Media::Audio(a) = &self.media else {
            return 1;
        };
        let d = a.channels as u32 * a.bytes_per_sample();
        if d > 1 && self.sample_sizes.iter().all(|g| g.length % d as u64 == 0) {
            d
        } else {
            1
        }
    }

    /// `stco` or `co64`, chosen once per track from the last chunk's
    /// shifted offset.
    fn write_chunk_offsets<W: Write + Seek>(
        &self,
        w: &mut AtomWriter<W>,
        ctx: &MovieContext,
    ) -> Result<()> {
        let delta = |offset: u64| -> u64 { (offset as i64 + ctx.chunk_offset_delta) as u64 };
        let wide = self
            .chunks
            .last()
            .is_some_and(|c| delta(c.first_offset) > u32::MAX as u64);
        if wide {
            w.begin(b"co64")?;
            let s = w.stream();
            s.write_u32(0)?;
            s.write_u32(self.chunks.len() as u32)?;
            for c in &self.chunks {
                s.write_u64(delta(c.first_offset))?;
            }
            w.end_sized(b"co64", 8 + self.chunks.len() as u64 * 8)?;
        } else {
            w.begin(b"stco")?;
            let s = w.stream();
            s.write_u32(0)?;
            s.write_u32(self.chunks.len() as u32)?;
            for c in &self.chunks {
                s.write_u32(delta(c.first_offset) as u32)?;
            }
            w.end_sized(b"stco", 8 + self.chunks.len() as u64 * 4)?;
        }
        Ok(())
    }
}

fn write_identity_matrix<W: Write + Seek>(s: &mut crate::atoms::QtStream<W>) -> Result<()> {
    // Rows of (16.16, 16.16, 2.30) fixed point.
    s.write_fixed_16_16(1.0)?;
    s.write_fixed_16_16(0.0)?;
    s.write_fixed_2_30(0.0)?;
    s.write_fixed_16_16(0.0)?;
    s.write_fixed_16_16(1.0)?;
    s.write_fixed_2_30(0.0)?;
    s.write_fixed_16_16(0.0)?;
    s.write_fixed_16_16(0.0)?;
    s.write_fixed_2_30(1.0)?;
    Ok(())
}

fn write_hdlr<W: Write + Seek>(
    w: &mut AtomWriter<W>,
    component_type: &[u8; 4],
    subtype: &[u8; 4],
    name: &str,
) -> Result<u64> {
    w.leaf(b"hdlr", |s| {
        s.write_u32(0)?; // version + flags
        s.write_fourcc(component_type)?;
        s.write_fourcc(subtype)?;
        s.write_u32(0)?; // manufacturer
        s.write_u32(0)?; // component flags
        s.write_u32(0)?; // component flags mask
        s.write_u8(name.len() as u8)?;
        s.write_bytes(name.as_bytes())?;
        Ok(())
    })
}

fn compressor_name(compression_type: FourCc) -> &'static str {
    match &compression_type.bytes() {
        b"rle " => "Animation",
        b"jpeg" => "Photo - JPEG",
        b"png " => "PNG",
        b"raw " => "None",
        _ => "",
    }
}
