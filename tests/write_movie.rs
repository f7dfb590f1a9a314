//! Integration tests: write movies into memory, then parse the atom
//! tree back out of the raw bytes and verify the structure a player
//! would see.

use std::io::{Cursor, Read};

use quicktime_mov::{Edit, FrameBuf, QuickTimeWriter};

// ---------------------------------------------------------------------
// Minimal atom parser for verification
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Atom {
    ty: [u8; 4],
    offset: usize,
    size: usize,
    header: usize,
}

impl Atom {
    fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset + self.header..self.offset + self.size]
    }
}

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(data[at..at + 4].try_into().expect("4 bytes"))
}

fn be64(data: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(data[at..at + 8].try_into().expect("8 bytes"))
}

/// Parse a run of sibling atoms covering `data[start..end]` exactly.
fn parse_atoms(data: &[u8], start: usize, end: usize) -> Vec<Atom> {
    let mut atoms = Vec::new();
    let mut pos = start;
    while pos < end {
        assert!(pos + 8 <= end, "truncated atom header at {pos}");
        let size32 = be32(data, pos);
        let ty = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        let (size, header) = if size32 == 1 {
            (be64(data, pos + 8) as usize, 16)
        } else {
            (size32 as usize, 8)
        };
        assert!(size >= header, "atom {:?} smaller than its header", ty);
        assert!(pos + size <= end, "atom {:?} overruns its parent", ty);
        atoms.push(Atom { ty, offset: pos, size, header });
        pos += size;
    }
    assert_eq!(pos, end, "sibling atoms do not tile their parent exactly");
    atoms
}

fn children(data: &[u8], parent: &Atom) -> Vec<Atom> {
    parse_atoms(data, parent.offset + parent.header, parent.offset + parent.size)
}

fn child(data: &[u8], parent: &Atom, ty: &[u8; 4]) -> Atom {
    find_child(data, parent, ty)
        .unwrap_or_else(|| panic!("no {:?} inside {:?}", ty, parent.ty))
}

fn find_child(data: &[u8], parent: &Atom, ty: &[u8; 4]) -> Option<Atom> {
    children(data, parent).into_iter().find(|a| &a.ty == ty)
}

/// Walk moov → trak[index] → mdia → minf → stbl.
fn stbl_of(data: &[u8], moov: &Atom, track_index: usize) -> Atom {
    let traks: Vec<Atom> = children(data, moov)
        .into_iter()
        .filter(|a| &a.ty == b"trak")
        .collect();
    let mdia = child(data, &traks[track_index], b"mdia");
    let minf = child(data, &mdia, b"minf");
    child(data, &minf, b"stbl")
}

fn stco_offsets(data: &[u8], stbl: &Atom) -> Vec<u64> {
    if let Some(stco) = find_child(data, stbl, b"stco") {
        let p = stco.payload(data);
        let count = be32(p, 4) as usize;
        (0..count).map(|i| be32(p, 8 + i * 4) as u64).collect()
    } else {
        let co64 = child(data, stbl, b"co64");
        let p = co64.payload(data);
        let count = be32(p, 4) as usize;
        (0..count).map(|i| be64(p, 8 + i * 8)).collect()
    }
}

/// Route `tracing` output through the test harness so diagnostics
/// (size-mismatch warnings, optimization retries) show up with
/// `RUST_LOG` set. Safe to call from every test; only the first call
/// installs the subscriber.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn memory_writer() -> QuickTimeWriter<Cursor<Vec<u8>>> {
    init_tracing();
    QuickTimeWriter::new(Cursor::new(Vec::new())).expect("writer")
}

// ---------------------------------------------------------------------
// Plain (metadata-last) movies
// ---------------------------------------------------------------------

#[test]
fn test_single_video_track_structure() {
    let mut movie = memory_writer();
    let t = movie.add_video_track(b"jpeg", 600, 64, 48, 24).expect("track");
    for _ in 0..3 {
        movie.write_sample(t, &[0xAB; 8], 25, true).expect("sample");
    }
    movie.finish().expect("finish");
    let data = movie.into_stream().expect("stream").into_inner();

    let top = parse_atoms(&data, 0, data.len());
    let types: Vec<[u8; 4]> = top.iter().map(|a| a.ty).collect();
    assert_eq!(types, vec![*b"ftyp", *b"wide", *b"mdat", *b"moov"]);

    // ftyp: qt brand.
    assert_eq!(&top[0].payload(&data)[..4], b"qt  ");

    // mdat holds exactly the three samples.
    assert_eq!(top[2].payload(&data).len(), 24);
    assert!(top[2].payload(&data).iter().all(|&b| b == 0xAB));

    let moov = top[3];
    let mvhd = child(&data, &moov, b"mvhd");
    let p = mvhd.payload(&data);
    assert_eq!(be32(p, 12), 600, "movie timescale");
    // 3 samples x 25 units at a shared 600 timescale.
    assert_eq!(be32(p, 16), 75, "movie duration");

    let stbl = stbl_of(&data, &moov, 0);
    // All samples sync: no stss.
    assert!(find_child(&data, &stbl, b"stss").is_none());

    let stts = child(&data, &stbl, b"stts").payload(&data).to_vec();
    assert_eq!(be32(&stts, 4), 1, "one duration group");
    assert_eq!((be32(&stts, 8), be32(&stts, 12)), (3, 25));

    let stsz = child(&data, &stbl, b"stsz").payload(&data).to_vec();
    assert_eq!((be32(&stsz, 4), be32(&stsz, 8)), (8, 3), "compact stsz");

    let stsc = child(&data, &stbl, b"stsc").payload(&data).to_vec();
    assert_eq!(be32(&stsc, 4), 1, "one chunk run");
    assert_eq!((be32(&stsc, 8), be32(&stsc, 12)), (1, 3));

    // One chunk, starting right after the 16-byte mdat header space.
    let offsets = stco_offsets(&data, &stbl);
    assert_eq!(offsets, vec![36]);
    assert_eq!(&data[36..44], &[0xAB; 8]);
}

#[test]
fn test_atom_sizes_tile_the_whole_file() {
    let mut movie = memory_writer();
    let v = movie.add_video_track(b"rle ", 600, 8, 8, 24).expect("video");
    let a = movie
        .add_audio_track(b"twos", 44100, 44100.0, 16, 2, 1, 2)
        .expect("audio");
    let mut frame = [0u32; 64];
    for i in 0..4 {
        frame[i] = 0x0000_FF00 + i as u32;
        movie.write_frame(v, FrameBuf::Rgb24(&frame), 25).expect("frame");
        movie
            .write_samples(a, 441, &vec![0u8; 441 * 4], 1, true)
            .expect("audio samples");
    }
    movie.finish().expect("finish");
    let data = movie.into_stream().expect("stream").into_inner();

    // The parser asserts exact tiling at every level it visits.
    let top = parse_atoms(&data, 0, data.len());
    let moov = top.last().copied().expect("moov");
    assert_eq!(&moov.ty, b"moov");
    for trak in children(&data, &moov).iter().filter(|a| &a.ty == b"trak") {
        let mdia = child(&data, trak, b"mdia");
        let minf = child(&data, &mdia, b"minf");
        let stbl = child(&data, &minf, b"stbl");
        children(&data, &stbl);
    }
}

#[test]
fn test_sync_sample_list_materializes_retroactively() {
    let mut movie = memory_writer();
    let t = movie.add_video_track(b"jpeg", 600, 32, 32, 24).expect("track");
    movie.write_sample(t, &[1; 4], 25, true).expect("s1");
    movie.write_sample(t, &[2; 4], 25, true).expect("s2");
    movie.write_sample(t, &[3; 4], 25, false).expect("s3");
    movie.write_sample(t, &[4; 4], 25, true).expect("s4");
    movie.finish().expect("finish");
    let data = movie.into_stream().expect("stream").into_inner();

    let top = parse_atoms(&data, 0, data.len());
    let stbl = stbl_of(&data, top.last().expect("moov"), 0);
    let stss = child(&data, &stbl, b"stss").payload(&data).to_vec();
    assert_eq!(be32(&stss, 4), 3);
    let entries: Vec<u32> = (0..3).map(|i| be32(&stss, 8 + i * 4)).collect();
    assert_eq!(entries, vec![1, 2, 4]);
}

#[test]
fn test_rle_track_key_and_delta_frames() {
    let mut movie = memory_writer();
    let t = movie.add_video_track(b"rle ", 600, 4, 4, 24).expect("track");

    let base = [0x00FF_0000u32; 16];
    let mut changed = base;
    changed[5] = 0x0000_00FF;

    movie.write_frame(t, FrameBuf::Rgb24(&base), 20).expect("key");
    movie.write_frame(t, FrameBuf::Rgb24(&base), 20).expect("no-change delta");
    movie.write_frame(t, FrameBuf::Rgb24(&changed), 20).expect("delta");
    movie.finish().expect("finish");
    let data = movie.into_stream().expect("stream").into_inner();

    let top = parse_atoms(&data, 0, data.len());
    let stbl = stbl_of(&data, top.last().expect("moov"), 0);

    // Only the first frame is a key frame at the default interval.
    let stss = child(&data, &stbl, b"stss").payload(&data).to_vec();
    assert_eq!(be32(&stss, 4), 1);
    assert_eq!(be32(&stss, 8), 1);

    // A no-change delta frame is the 4-byte minimal chunk.
    let stsz = child(&data, &stbl, b"stsz").payload(&data).to_vec();
    assert_eq!(be32(&stsz, 4), 0, "varying sizes use the full table");
    assert_eq!(be32(&stsz, 8), 3);
    assert_eq!(be32(&stsz, 16), 4, "no-change frame is one chunk length word");

    // The sample description advertises the Animation compressor.
    let stsd = child(&data, &stbl, b"stsd");
    let entry = parse_atoms(&data, stsd.offset + 16, stsd.offset + stsd.size)[0];
    assert_eq!(&entry.ty, b"rle ");
}

#[test]
fn test_audio_sample_sizes_divided_by_frame_bytes() {
    let mut movie = memory_writer();
    let t = movie
        .add_audio_track(b"twos", 44100, 44100.0, 16, 2, 1, 2)
        .expect("audio");
    // 1000 samples, 4 bytes each (2 channels x 16 bits).
    movie
        .write_samples(t, 1000, &vec![0u8; 4000], 1, true)
        .expect("samples");
    movie.finish().expect("finish");
    let data = movie.into_stream().expect("stream").into_inner();

    let top = parse_atoms(&data, 0, data.len());
    let stbl = stbl_of(&data, top.last().expect("moov"), 0);

    let stsz = child(&data, &stbl, b"stsz").payload(&data).to_vec();
    assert_eq!((be32(&stsz, 4), be32(&stsz, 8)), (1, 1000));

    let offsets = stco_offsets(&data, &stbl);
    assert_eq!(offsets.len(), 1, "one contiguous chunk");

    // Sound description is version 1 with packet fields.
    let stsd = child(&data, &stbl, b"stsd");
    let entry = parse_atoms(&data, stsd.offset + 16, stsd.offset + stsd.size)[0];
    assert_eq!(&entry.ty, b"twos");
    let p = entry.payload(&data);
    let version = u16::from_be_bytes(p[8..10].try_into().expect("2 bytes"));
    assert_eq!(version, 1, "sound description version");
}

#[test]
fn test_edit_list_sets_track_duration() {
    let mut movie = memory_writer();
    let t = movie.add_video_track(b"jpeg", 600, 16, 16, 24).expect("track");
    movie.write_sample(t, &[0; 4], 200, true).expect("s1");
    movie.write_sample(t, &[0; 4], 200, true).expect("s2");
    movie.write_sample(t, &[0; 4], 200, true).expect("s3");
    movie
        .set_edit_list(t, vec![Edit::new(250, Edit::EMPTY_TIME), Edit::new(100, 0)])
        .expect("edits");
    movie.finish().expect("finish");
    let data = movie.into_stream().expect("stream").into_inner();

    let top = parse_atoms(&data, 0, data.len());
    let moov = *top.last().expect("moov");
    let traks: Vec<Atom> = children(&data, &moov)
        .into_iter()
        .filter(|a| &a.ty == b"trak")
        .collect();

    let tkhd = child(&data, &traks[0], b"tkhd").payload(&data).to_vec();
    assert_eq!(be32(&tkhd, 20), 350, "tkhd duration is the edit sum");

    let edts = child(&data, &traks[0], b"edts");
    let elst = child(&data, &edts, b"elst").payload(&data).to_vec();
    assert_eq!(be32(&elst, 4), 2);
    assert_eq!(be32(&elst, 8), 250);
    assert_eq!(be32(&elst, 12), u32::MAX, "-1 media time marks the empty edit");
    assert_eq!(be32(&elst, 20), 100);
    assert_eq!(be32(&elst, 24), 0);
    assert_eq!(be32(&elst, 28), 0x0001_0000, "normal rate");
}

#[test]
fn test_empty_last_edit_rejected() {
    let mut movie = memory_writer();
    let t = movie.add_video_track(b"jpeg", 600, 16, 16, 24).expect("track");
    assert!(movie.set_edit_list(t, vec![]).is_err());
    assert!(movie
        .set_edit_list(t, vec![Edit::new(100, 0), Edit::new(50, Edit::EMPTY_TIME)])
        .is_err());
}

#[test]
fn test_multi_track_movie() {
    let mut movie = memory_writer();
    let v = movie.add_video_track(b"jpeg", 600, 64, 48, 24).expect("video");
    let a = movie
        .add_audio_track(b"twos", 22050, 22050.0, 16, 1, 1, 2)
        .expect("audio");
    movie.write_sample(v, &[9; 16], 25, true).expect("frame");
    movie
        .write_samples(a, 2205, &vec![0u8; 2205 * 2], 1, true)
        .expect("audio");
    movie.write_sample(v, &[9; 16], 25, true).expect("frame");
    movie.finish().expect("finish");
    let data = movie.into_stream().expect("stream").into_inner();

    let top = parse_atoms(&data, 0, data.len());
    let moov = *top.last().expect("moov");
    let traks: Vec<Atom> = children(&data, &moov)
        .into_iter()
        .filter(|a| &a.ty == b"trak")
        .collect();
    assert_eq!(traks.len(), 2);

    let mvhd = child(&data, &moov, b"mvhd").payload(&data).to_vec();
    assert_eq!(be32(&mvhd, 96), 3, "next track id");

    // Interleaving split the video track into two chunks.
    let video_stbl = stbl_of(&data, &moov, 0);
    assert_eq!(stco_offsets(&data, &video_stbl).len(), 2);
    let audio_stbl = stbl_of(&data, &moov, 1);
    assert_eq!(stco_offsets(&data, &audio_stbl).len(), 1);
}

// ---------------------------------------------------------------------
// Web-optimized rewrites
// ---------------------------------------------------------------------

fn build_finished_movie(frames: usize) -> QuickTimeWriter<Cursor<Vec<u8>>> {
    let mut movie = memory_writer();
    let t = movie.add_video_track(b"jpeg", 600, 32, 32, 24).expect("track");
    for i in 0..frames {
        let byte = (i % 251) as u8;
        movie.write_sample(t, &[byte; 64], 25, true).expect("sample");
    }
    movie.finish().expect("finish");
    movie
}

fn inflate(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .expect("zlib payload");
    out
}

#[test]
fn test_optimized_layout_uncompressed() {
    let mut movie = build_finished_movie(5);
    let out = movie
        .to_web_optimized_movie(Cursor::new(Vec::new()), false)
        .expect("optimize")
        .into_inner();

    let top = parse_atoms(&out, 0, out.len());
    let types: Vec<[u8; 4]> = top.iter().map(|a| a.ty).collect();
    assert_eq!(types, vec![*b"ftyp", *b"moov", *b"free", *b"wide", *b"mdat"]);

    // Chunk offsets point into the relocated mdat.
    let stbl = stbl_of(&out, &top[1], 0);
    let offsets = stco_offsets(&out, &stbl);
    let first = offsets[0] as usize;
    assert_eq!(first, top[4].offset + top[4].header);
    assert_eq!(&out[first..first + 64], &[0u8; 64][..]);
}

#[test]
fn test_optimized_layout_compressed() {
    let mut movie = build_finished_movie(40);
    let out = movie
        .to_web_optimized_movie(Cursor::new(Vec::new()), true)
        .expect("optimize")
        .into_inner();

    let top = parse_atoms(&out, 0, out.len());
    let types: Vec<[u8; 4]> = top.iter().map(|a| a.ty).collect();
    assert_eq!(types, vec![*b"ftyp", *b"moov", *b"free", *b"wide", *b"mdat"]);

    // moov holds only the cmov wrapper.
    let moov = top[1];
    let cmov = child(&out, &moov, b"cmov");
    let dcom = child(&out, &cmov, b"dcom");
    assert_eq!(dcom.payload(&out), b"zlib");
    let cmvd = child(&out, &cmov, b"cmvd");
    let uncompressed_len = be32(cmvd.payload(&out), 0) as usize;

    // The decompressed payload is a complete moov tree whose offsets
    // line up with the rewritten file.
    let raw = inflate(&cmvd.payload(&out)[4..]);
    assert_eq!(raw.len(), uncompressed_len);
    let inner = parse_atoms(&raw, 0, raw.len());
    assert_eq!(&inner[0].ty, b"moov");

    let stbl = stbl_of(&raw, &inner[0], 0);
    let offsets = stco_offsets(&raw, &stbl);
    let first = offsets[0] as usize;
    assert_eq!(first, top[4].offset + top[4].header);
    assert_eq!(&out[first..first + 64], &[0u8; 64][..]);

    // Consecutive samples stay contiguous after relocation.
    assert_eq!(offsets.len(), 1, "one chunk survives the shift");

    // The source writer can be rewritten again.
    movie
        .to_web_optimized_movie(Cursor::new(Vec::new()), false)
        .expect("second rewrite");
    movie.close().expect("close");
}

#[test]
fn test_optimized_multi_track_offsets() {
    let mut movie = memory_writer();
    let v = movie.add_video_track(b"jpeg", 600, 64, 48, 24).expect("video");
    let a = movie
        .add_audio_track(b"twos", 22050, 22050.0, 16, 1, 1, 2)
        .expect("audio");
    // Interleave so each track ends up with several chunks, each
    // carrying a recognizable first byte.
    for i in 0..4u8 {
        movie.write_sample(v, &[0x10 + i; 32], 25, true).expect("frame");
        movie
            .write_samples(a, 100, &vec![0x80 + i; 200], 1, true)
            .expect("audio chunk");
    }
    movie.finish().expect("finish");

    let out = movie
        .to_web_optimized_movie(Cursor::new(Vec::new()), true)
        .expect("optimize")
        .into_inner();

    let top = parse_atoms(&out, 0, out.len());
    let types: Vec<[u8; 4]> = top.iter().map(|a| a.ty).collect();
    assert_eq!(types, vec![*b"ftyp", *b"moov", *b"free", *b"wide", *b"mdat"]);

    let cmov = child(&out, &top[1], b"cmov");
    let cmvd = child(&out, &cmov, b"cmvd");
    let raw = inflate(&cmvd.payload(&out)[4..]);
    let moov = parse_atoms(&raw, 0, raw.len())[0];

    // Every relocated chunk offset of both tracks must land on the
    // bytes written for that chunk.
    let video_offsets = stco_offsets(&raw, &stbl_of(&raw, &moov, 0));
    assert_eq!(video_offsets.len(), 4);
    for (i, &offset) in video_offsets.iter().enumerate() {
        let at = offset as usize;
        assert_eq!(&out[at..at + 32], &[0x10 + i as u8; 32][..]);
    }
    let audio_offsets = stco_offsets(&raw, &stbl_of(&raw, &moov, 1));
    assert_eq!(audio_offsets.len(), 4);
    for (i, &offset) in audio_offsets.iter().enumerate() {
        let at = offset as usize;
        assert_eq!(&out[at..at + 200], &[0x80 + i as u8; 200][..]);
    }

    // All offsets stay inside the relocated mdat payload.
    let mdat = top[4];
    let lo = (mdat.offset + mdat.header) as u64;
    let hi = (mdat.offset + mdat.size) as u64;
    for &offset in video_offsets.iter().chain(&audio_offsets) {
        assert!(offset >= lo && offset < hi);
    }
}

#[test]
fn test_optimize_requires_finished_movie() {
    let mut movie = memory_writer();
    let t = movie.add_video_track(b"jpeg", 600, 32, 32, 24).expect("track");
    movie.write_sample(t, &[0; 8], 25, true).expect("sample");
    assert!(movie
        .to_web_optimized_movie(Cursor::new(Vec::new()), true)
        .is_err());
    movie.close().expect("close");
}

#[test]
fn test_create_writes_playable_file_on_disk() {
    init_tracing();
    let temp = tempfile::NamedTempFile::new().expect("temp file");
    let path = temp.path().to_path_buf();
    {
        let mut movie = QuickTimeWriter::create(&path).expect("create");
        let t = movie.add_video_track(b"rle ", 600, 8, 8, 24).expect("track");
        let frame = [0x00AA_BBCCu32; 64];
        movie.write_frame(t, FrameBuf::Rgb24(&frame), 30).expect("frame");
        movie.close().expect("close");
    }
    let data = std::fs::read(&path).expect("read back");
    let top = parse_atoms(&data, 0, data.len());
    let types: Vec<[u8; 4]> = top.iter().map(|a| a.ty).collect();
    assert_eq!(types, vec![*b"ftyp", *b"wide", *b"mdat", *b"moov"]);
}
