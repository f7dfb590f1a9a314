//! # QuickTime movie writer
//!
//! Rust implementation of a QuickTime (.mov) container writer with a
//! built-in Apple Animation (RLE) lossless video encoder.
//!
//! Original QuickTime file format developed by Apple. This is an
//! independent Rust implementation aiming to produce files that
//! standard QuickTime players accept, including the web-optimized
//! layout with compressed movie metadata at the front of the file.
//!
//! ## Modules
//!
//! - [`util`] - Basic types (errors, fixed-point and timestamp encodings)
//! - [`atoms`] - Low-level atom ("box") tree writing with size patching
//! - [`rle`] - Apple Animation run-length video encoder
//! - [`track`] - Per-track sample bookkeeping and `trak` serialization
//! - [`writer`] - Movie writer orchestrator and web optimization
//!
//! ## Example
//!
//! ```ignore
//! use quicktime_mov::{FrameBuf, QuickTimeWriter};
//!
//! let mut movie = QuickTimeWriter::create("out.mov")?;
//! let video = movie.add_video_track(b"rle ", 600, 320, 240, 24)?;
//! for frame in frames {
//!     movie.write_frame(video, FrameBuf::Rgb24(&frame), 20)?;
//! }
//! movie.finish()?;
//! movie.close()?;
//! ```

pub mod atoms;
pub mod rle;
pub mod track;
pub mod util;
pub mod writer;

// Re-export commonly used types
pub use rle::{AppleRleEncoder, FrameBuf, PixelDepth};
pub use track::{Edit, Sample, Track};
pub use util::{Error, Result};
pub use writer::{QuickTimeWriter, DEFAULT_MOVIE_TIME_SCALE};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::atoms::{AtomWriter, FourCc, QtStream};
    pub use crate::rle::{AppleRleEncoder, FrameBuf, PixelDepth};
    pub use crate::track::{Edit, Sample, Track};
    pub use crate::util::{Error, Result};
    pub use crate::writer::{QuickTimeWriter, DEFAULT_MOVIE_TIME_SCALE};
}
