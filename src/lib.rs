//! PPMd8 (PPMd var.I rev.1) compression and decompression.
//!
//! PPMd8 is the adaptive context-modelling compressor used by the zip
//! archive format (method 98). It pairs an order-N suffix trie of byte
//! contexts with a carry-less binary range coder. The whole model lives in
//! one fixed-size arena; when the arena fills up, the model recovers either
//! by restarting from scratch ([`RestoreMethod::Restart`]) or by pruning the
//! trie ([`RestoreMethod::CutOff`]). Both recoveries are deterministic and
//! are replayed identically by the decoder, so the compressed stream carries
//! no marker for them.
//!
//! The encoder and decoder work incrementally on byte slices:
//!
//! ```
//! use ppmd8::{Ppmd8Decoder, Ppmd8Encoder, RestoreMethod};
//!
//! let mut encoder = Ppmd8Encoder::new(6, 1 << 20, RestoreMethod::Restart, true).unwrap();
//! let mut compressed = encoder.encode(b"an example payload").unwrap();
//! compressed.extend(encoder.flush().unwrap());
//!
//! let mut decoder = Ppmd8Decoder::new(6, 1 << 20, RestoreMethod::Restart, true).unwrap();
//! let decoded = decoder.decode(&compressed, None).unwrap();
//! assert_eq!(decoded, b"an example payload");
//! assert!(decoder.eof());
//! ```
//!
//! ## Acknowledgement
//!
//! The model follows the 7-Zip edition of PPMd by Igor Pavlov, which in turn
//! is based on the PPMd var.H (2001) / var.I (2002) code by Dmitry Shkarin.
//! The carry-less range coder was originally written by Dmitry Subbotin
//! (1999).
//!
//! ## License
//!
//! The code in this crate is in the public domain, as the original code by
//! their authors.
mod decoder;
mod encoder;
mod model;

pub use decoder::Ppmd8Decoder;
pub use encoder::Ppmd8Encoder;

/// Lowest accepted model order.
pub const MIN_ORDER: u32 = 2;

/// Highest accepted model order.
pub const MAX_ORDER: u32 = 64;

/// Smallest accepted arena size in bytes.
pub const MIN_MEM_SIZE: u32 = 2048;

/// Largest accepted arena size in bytes.
pub const MAX_MEM_SIZE: u32 = 4294967259;

/// Decoder result for the end marker.
const SYM_END: i32 = -1;
/// Decoder result for an impossible coding state.
const SYM_ERROR: i32 = -2;

pub type Result<T> = core::result::Result<T, Error>;

/// Recovery policy applied when the model arena runs out of memory.
///
/// The policy is part of the stream configuration: encoder and decoder must
/// be constructed with the same method (and the same `order` / `mem_size`),
/// or their models diverge.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum RestoreMethod {
    /// Drop the whole model and restart from the order-0 state.
    Restart,
    /// Prune the deepest contexts first and keep what fits. Falls back to a
    /// restart when pruning cannot free enough memory.
    CutOff,
}

/// Crate error type.
#[derive(Debug)]
pub enum Error {
    /// Invalid `order` or `mem_size` at construction.
    InvalidParameter,
    /// The compressed stream is corrupt or was produced with a different
    /// configuration. The session cannot continue.
    CorruptStream,
    /// The session was already flushed or hit a fatal error.
    SessionFinished,
    /// The model arena could not be allocated.
    MemoryAllocation,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidParameter => write!(f, "Wrong PPMd8 parameter"),
            Error::CorruptStream => write!(f, "Corrupt PPMd8 stream"),
            Error::SessionFinished => write!(f, "PPMd8 session is finished"),
            Error::MemoryAllocation => write!(f, "Memory allocation error (out of memory?)"),
        }
    }
}

impl std::error::Error for Error {}
