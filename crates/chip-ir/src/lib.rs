//! Raw XM module data model for chipstream.
//!
//! This crate defines the module structure produced by the XM parser and
//! consumed by the playback compiler. It mirrors the on-disk format closely:
//! pattern cells stay as raw byte tuples, sample payloads stay delta-packed.
//! All normalization happens downstream in `chip-engine`.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod instrument;
mod module;

pub use instrument::{
    EnvelopeFlags, EnvelopePoint, Instrument, Sample, SampleEncoding, SampleLoopType,
};
pub use module::{Module, Note, Pattern, Row};
