//! Playback events.
//!
//! A stream can report row-level happenings to the embedding application
//! through a callback, for driving visualizations or gameplay off the music.
//! Every event carries the playback time it belongs to, in seconds from the
//! track start; the application schedules its reaction itself.

/// A single stream event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StreamEvent {
    /// A channel started playing a note. Ghost notes report too; it's up to
    /// the application to filter.
    Note {
        /// Channel id (stable across the stream's lifetime)
        channel: usize,
        /// Playback offset of the row, in seconds
        time: f64,
        /// Raw note value (1..=96, or 97 for key-off)
        note: u8,
        /// Instrument id, or -1 when the cell has none
        instrument: i32,
        /// Channel volume after the row's effects ran
        volume: f32,
    },

    /// The stream rewound: once `time` is reached, the application should
    /// snap its own clock to `target_time`.
    Sync { time: f64, target_time: f64 },
}
