//! Format parsing for chipstream.
//!
//! Parses XM (FastTracker II Extended Module) files into the raw
//! `chip-ir` module model. Parsing stays close to the file: sample payloads
//! are kept delta-packed, cells keep their raw bytes. The playback compiler
//! in `chip-engine` does all normalization.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod xm_format;

pub use xm_format::load_xm;

use core::fmt;

/// Error type for format parsing. Every variant carries the byte offset the
/// parser had reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatError {
    /// The file does not start with the XM magic text
    InvalidMagic,
    /// The file ended while reading the named field
    UnexpectedEof { what: &'static str, offset: usize },
    /// A header field held a value outside its legal range
    InvalidValue { what: &'static str, value: i64, offset: usize },
    /// An unrecognized sample encoding byte
    UnknownSampleEncoding { value: u8, offset: usize },
    /// A pattern's packed data did not match its declared size
    PatternSizeMismatch { offset: usize },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FormatError::InvalidMagic => write!(f, "not an XM module (bad magic text)"),
            FormatError::UnexpectedEof { what, offset } => {
                write!(f, "unexpected EOF while reading {} (offset={})", what, offset)
            }
            FormatError::InvalidValue { what, value, offset } => {
                write!(f, "invalid {} value: {} (offset={})", what, value, offset)
            }
            FormatError::UnknownSampleEncoding { value, offset } => {
                write!(f, "unknown sample encoding scheme {:#04x} (offset={})", value, offset)
            }
            FormatError::PatternSizeMismatch { offset } => {
                write!(f, "pattern data size does not match its header (offset={})", offset)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FormatError {}
