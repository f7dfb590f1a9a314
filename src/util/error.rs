//! Error types for the QuickTime writer.

use thiserror::Error;

use crate::atoms::FourCc;

/// Main error type for QuickTime write operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An atom's finished size does not fit its header width.
    /// Fatal: the partially written output must be discarded.
    #[error("atom '{atom_type}' finished at {size} bytes, exceeding its 32-bit size field")]
    StructuralOverflow { atom_type: FourCc, size: u64 },

    /// Atoms were finished out of nesting order.
    #[error("atom nesting violation: expected to finish '{expected}', found '{found}'")]
    AtomNesting { expected: FourCc, found: FourCc },

    /// `end` was called with no atom open.
    #[error("no atom is open")]
    NoOpenAtom,

    /// API misuse: wrong writer state, bad track index, mismatched
    /// frame dimensions, invalid edit list.
    #[error("invalid track state: {0}")]
    InvalidTrackState(String),

    /// A pixel-depth/compression combination the built-in encoders
    /// do not implement.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    /// The web-optimization reservation loop failed to stabilize.
    #[error("movie header compression did not stabilize: {compressed} bytes compressed against a {reserved} byte reservation")]
    OptimizeRetriesExhausted { reserved: u64, compressed: u64 },

    /// I/O error from the backing stream. Never retried: seek-back
    /// patching makes mid-structure resumption unsafe.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid-track-state error from a message.
    pub fn track(msg: impl Into<String>) -> Self {
        Self::InvalidTrackState(msg.into())
    }

    /// Create an unsupported-media error from a message.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedMedia(msg.into())
    }
}

/// Result type alias for QuickTime write operations.
pub type Result<T> = std::result::Result<T, Error>;
