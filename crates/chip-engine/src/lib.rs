//! Playback engine for chipstream.
//!
//! Compiles a parsed XM module into a flat playback representation and
//! renders it as interleaved stereo 16-bit little-endian PCM at 44100 Hz.
//! The engine is a pull-based byte reader: the embedder calls
//! [`Stream::read`] and feeds the bytes to whatever sink it likes.
//!
//! Designed to be `no_std` compatible with the `alloc` crate; the `std`
//! feature adds `io::Read`/`io::Seek` adapters on [`Stream`].

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod channel;
mod compiler;
mod effects;
mod error;
mod event;
mod frequency;
mod mixer;
mod module;
mod stream;

pub use error::LoadError;
pub use event::StreamEvent;
pub use frequency::{
    linear_frequency, linear_period, samples_per_tick, seconds_per_row, slide_towards, MIN_PERIOD,
};
pub use stream::{LoadModuleConfig, Stream, StreamInfo};
