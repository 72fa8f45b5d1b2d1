//! Module, pattern and note-table types.

use alloc::vec::Vec;
use arrayvec::ArrayString;

use crate::instrument::Instrument;

/// A parsed XM module.
///
/// This is the raw file contents, not optimized for playback; the playback
/// compiler turns it into a flat representation.
#[derive(Clone, Debug)]
pub struct Module {
    /// Module name (padded field in the file, trimmed here)
    pub name: ArrayString<20>,
    /// Name of the tracker that wrote the file
    pub tracker_name: ArrayString<20>,
    /// Format version, 0x0104 for FastTracker II
    pub version: u16,
    /// Number of entries in `pattern_order` that are actually played
    pub song_length: usize,
    /// Order index to restart from after the song ends
    pub restart_position: usize,
    pub num_channels: usize,
    pub num_patterns: usize,
    pub num_instruments: usize,
    /// Bit 0: linear frequency table (as opposed to Amiga)
    pub flags: u16,
    /// Default ticks per row ("Spd" in trackers)
    pub default_tempo: u32,
    pub default_bpm: u32,
    /// Pattern indices in play order
    pub pattern_order: Vec<u8>,
    pub patterns: Vec<Pattern>,
    /// Shared note table. Rows reference notes by index; `notes[0]` is the
    /// empty note. Identical cells share one entry.
    pub notes: Vec<Note>,
    pub instruments: Vec<Instrument>,
}

impl Module {
    /// Linear frequency table flag (bit 0 of `flags`).
    pub const FLAG_LINEAR_FREQUENCY: u16 = 1;

    /// Create an empty module with the note table seeded with the empty note.
    pub fn new() -> Self {
        Self {
            name: ArrayString::new(),
            tracker_name: ArrayString::new(),
            version: 0x0104,
            song_length: 0,
            restart_position: 0,
            num_channels: 0,
            num_patterns: 0,
            num_instruments: 0,
            flags: Self::FLAG_LINEAR_FREQUENCY,
            default_tempo: 0,
            default_bpm: 0,
            pattern_order: Vec::new(),
            patterns: Vec::new(),
            notes: alloc::vec![Note::default()],
            instruments: Vec::new(),
        }
    }

    /// Returns true if the module uses the linear frequency table.
    pub fn uses_linear_frequency(&self) -> bool {
        self.flags & Self::FLAG_LINEAR_FREQUENCY != 0
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

/// A pattern: a grid of rows × channels.
#[derive(Clone, Debug, Default)]
pub struct Pattern {
    pub rows: Vec<Row>,
}

/// One pattern row: a note-table index per channel.
#[derive(Clone, Debug, Default)]
pub struct Row {
    pub notes: Vec<u16>,
}

/// A raw pattern cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Note {
    /// 0 = empty, 1..=96 playable, 97 = key off
    pub note: u8,
    /// 1-based instrument number, 0 = none
    pub instrument: u8,
    /// Volume column byte (encodes an effect family by range)
    pub volume: u8,
    pub effect_type: u8,
    pub effect_param: u8,
}

impl Note {
    /// The key-off note value.
    pub const KEY_OFF: u8 = 97;

    /// Returns true if every field is zero.
    pub fn is_empty(&self) -> bool {
        *self == Note::default()
    }

    /// Returns true for a playable note value (1..=96).
    pub fn is_playable(&self) -> bool {
        self.note > 0 && self.note < Self::KEY_OFF
    }

    /// Pack all five fields into one integer, for interning maps.
    pub fn packed(&self) -> u64 {
        (self.note as u64)
            | (self.instrument as u64) << 8
            | (self.volume as u64) << 16
            | (self.effect_type as u64) << 24
            | (self.effect_param as u64) << 32
    }
}
