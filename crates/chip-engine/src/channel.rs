//! Per-channel playback state.

use crate::frequency::{linear_period, real_note};
use crate::module::{EffectKey, Envelope, NoteFlags, NoteKind, PlaybackModule, envelope_lerp};

/// Samples at the head of each tick that crossfade against the previous
/// tick's tail while the volume slides toward its new target.
pub(crate) const RAMP_SAMPLES: usize = 32;

/// Mutable state for one module channel.
///
/// The fields used by the mixer inner loop sit at the head of the struct.
#[derive(Clone, Debug, Default)]
pub(crate) struct Channel {
    /// Current per-side volume, sliding toward `target_volume`
    pub computed_volume: [f64; 2],
    /// Volume the tick scheduler wants, split across stereo
    pub target_volume: [f64; 2],
    /// Playback position in the instrument's pool slice
    pub sample_offset: f64,
    /// Tail of the previous tick, crossfaded in at tick starts
    pub ramp_samples: [f64; RAMP_SAMPLES],
    pub ramp_frame: usize,

    /// Index of the sounding instrument, if any
    pub inst: Option<usize>,
    /// Note-table index of the last assigned note
    pub note: u16,
    pub period: f64,
    /// Pool samples consumed per output frame
    pub sample_step: f64,
    pub effect: EffectKey,
    pub key_on: bool,

    pub panning: f64,
    pub volume: f64,
    pub fadeout_volume: f64,

    // Arpeggio effect state.
    pub arpeggio_running: bool,
    pub arpeggio_note_offset: f64,

    // Latched effect memories.
    pub panning_slide_value: f64,
    pub volume_slide_value: f64,
    pub global_volume_slide_value: f64,
    pub portamento_up_value: f64,
    pub portamento_down_value: f64,
    pub note_portamento_target_period: f64,
    pub note_portamento_value: f64,

    // Vibrato effect state.
    pub vibrato_running: bool,
    pub vibrato_period_offset: f64,
    pub vibrato_depth: f64,
    pub vibrato_step: u8,
    pub vibrato_speed: u8,

    /// Ping-pong loop direction
    pub reverse: bool,

    pub volume_envelope: EnvelopeRunner,
    pub panning_envelope: EnvelopeRunner,

    /// Stable channel number, kept for events and debugging
    pub id: usize,
}

/// Runtime cursor over an instrument envelope.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct EnvelopeRunner {
    pub value: f64,
    pub frame: i32,
}

impl Channel {
    pub fn new(id: usize) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.id);
    }

    pub fn reset_envelopes(&mut self) {
        self.fadeout_volume = 1.0;
        self.volume_envelope.value = 1.0;
        self.volume_envelope.frame = 0;
        self.panning_envelope.value = 0.5;
        self.panning_envelope.frame = 0;
    }

    /// Apply a row's note to the channel.
    ///
    /// Sensible row states:
    ///
    ///   note  instrument
    ///   no    no           keep playing the current note (if any)
    ///   no    yes          "ghost instrument" (keeps the sample offset)
    ///   yes   no           "ghost note" (keeps the volume)
    ///   yes   yes          normal note play
    ///
    /// In practice it's more involved: a note portamento keeps the current
    /// instrument sounding regardless of the cell's instrument field.
    pub fn assign_note(&mut self, note_id: u16, module: &PlaybackModule) {
        let n = &module.note_table[note_id as usize];
        self.note = note_id;
        self.effect = n.effect;

        let kind = n.flags.kind();
        if kind == NoteKind::Empty {
            return;
        }

        let has_note_portamento = n.flags.contains(NoteFlags::HAS_NOTE_PORTAMENTO);
        if !has_note_portamento && kind == NoteKind::Normal {
            self.inst = n.inst.map(|i| i as usize);
        }

        self.vibrato_period_offset = 0.0;
        self.key_on = true;
        self.reset_envelopes();

        if !has_note_portamento && n.flags.contains(NoteFlags::VALID) {
            if n.period == 0.0 {
                // Ghost notes have no precomputed period; derive one from the
                // instrument the channel is already playing.
                let inst = self.inst.map(|i| &module.instruments[i]);
                self.period = linear_period(real_note(n.raw, inst));
            } else {
                self.period = n.period;
            }
        }

        if !has_note_portamento && kind != NoteKind::GhostInstrument {
            self.sample_offset = 0.0;
            self.reverse = false;
        }

        if let Some(ii) = self.inst {
            let inst = &module.instruments[ii];
            if kind != NoteKind::Ghost {
                self.volume = inst.volume;
            }
            self.panning = inst.panning;
        }
    }

    /// Whether the channel can produce output this tick.
    pub fn is_active(&self, module: &PlaybackModule) -> bool {
        let Some(ii) = self.inst else {
            return false;
        };
        let inst = &module.instruments[ii];
        if inst.loop_type == chip_ir::SampleLoopType::None
            && self.sample_offset as usize >= inst.pool_len
        {
            return false;
        }
        true
    }
}

/// Advance an envelope runner by one tick.
///
/// Walks the point list for the segment containing the current frame (a
/// linear scan; envelopes carry at most 12 points), samples it, then steps
/// the frame unless the sustain point holds it.
pub(crate) fn envelope_tick(e: &Envelope, r: &mut EnvelopeRunner, key_on: bool) {
    if e.points.len() < 2 {
        return;
    }

    if e.flags.loop_enabled() && r.frame >= e.loop_end_frame {
        r.frame -= e.loop_length;
    }

    let mut i = 0;
    while i < e.points.len() - 2 {
        if e.points[i].frame <= r.frame && e.points[i + 1].frame >= r.frame {
            break;
        }
        i += 1;
    }

    r.value = envelope_lerp(e.points[i], e.points[i + 1], r.frame) * (1.0 / 64.0);

    if !key_on || !e.flags.sustain_enabled() || r.frame != e.sustain_frame {
        r.frame += 1;
    }
}
