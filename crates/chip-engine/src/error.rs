//! Module compilation errors.

use core::fmt;

/// Errors surfaced while compiling a module for playback.
///
/// All of these are fatal at load time; a partially compiled module is never
/// playable. Once a module is loaded, the engine itself is infallible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// The module uses the Amiga frequency table (flags bit 0 clear)
    UnsupportedFrequencyTable,
    /// An instrument carries more than one sample
    UnsupportedMultiSample { instrument: usize, count: usize },
    /// Sample loop-type bits outside {none, forward, ping-pong}
    UnsupportedSampleLoopType { instrument: usize },
    /// A ping-pong loop shorter than 2 samples
    MalformedPingPongLoop { instrument: usize },
    /// A forward loop whose start lies past its end
    MalformedSampleLoop { instrument: usize },
    /// An ADPCM-compressed sample
    UnsupportedSampleEncoding { instrument: usize },
    /// Only 44100 Hz output is supported
    UnsupportedSampleRate(u32),
    /// An effect type outside the supported table
    UnsupportedEffect { effect: u8, param: u8 },
    /// A volume slide with both up and down nibbles set
    VolumeSlideBothDirections,
    /// A panning slide with both left and right nibbles set
    PanningSlideBothDirections,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LoadError::UnsupportedFrequencyTable => {
                write!(f, "the Amiga frequency table is not supported")
            }
            LoadError::UnsupportedMultiSample { instrument, count } => {
                write!(
                    f,
                    "instrument {:02X}: multi-sample instruments are not supported (found {})",
                    instrument + 1,
                    count
                )
            }
            LoadError::UnsupportedSampleLoopType { instrument } => {
                write!(f, "instrument {:02X}: unsupported sample loop type", instrument + 1)
            }
            LoadError::MalformedPingPongLoop { instrument } => {
                write!(
                    f,
                    "instrument {:02X}: a ping-pong sample loop can't be shorter than 2",
                    instrument + 1
                )
            }
            LoadError::MalformedSampleLoop { instrument } => {
                write!(f, "instrument {:02X}: sample loop start > loop end", instrument + 1)
            }
            LoadError::UnsupportedSampleEncoding { instrument } => {
                write!(f, "instrument {:02X}: ADPCM samples are not supported", instrument + 1)
            }
            LoadError::UnsupportedSampleRate(rate) => {
                write!(f, "unsupported sample rate {} (only 44100 is supported)", rate)
            }
            LoadError::UnsupportedEffect { effect, param } => {
                write!(f, "unsupported effect: {:02X} (param {:02X})", effect, param)
            }
            LoadError::VolumeSlideBothDirections => {
                write!(f, "volume slide uses both up & down (XY) values")
            }
            LoadError::PanningSlideBothDirections => {
                write!(f, "panning slide uses both right & left (XY) values")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LoadError {}
