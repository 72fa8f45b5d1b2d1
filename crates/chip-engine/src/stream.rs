//! The playback stream: a tick-accurate state machine producing PCM.
//!
//! `Stream` owns a compiled module and advances it one tick at a time. Each
//! tick evaluates the per-channel effect machines and envelopes, then the
//! mixer renders `samples_per_tick` stereo frames. `read` packs whole ticks
//! into the caller's buffer; there is no partial-tick output.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::channel::{envelope_tick, Channel, RAMP_SAMPLES};
use crate::compiler::{compile_module, ModuleConfig};
use crate::effects::EffectOp;
use crate::error::LoadError;
use crate::event::StreamEvent;
use crate::frequency::{
    linear_frequency, linear_period, real_note, samples_per_tick, seconds_per_row, slide_towards,
    waveform, MIN_PERIOD,
};
use crate::module::{NoteFlags, PlaybackModule};

/// Configures module loading. These settings are fixed once a module is
/// loaded; `set_volume`, `set_looping` and `set_event_handler` stay available
/// afterwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadModuleConfig {
    /// Playback speed override. Zero uses the module default, falling back
    /// to 120.
    pub bpm: u32,

    /// Ticks per pattern row ("Spd" in trackers). Perhaps a bit
    /// counter-intuitively, higher values make the song play slower: there
    /// are more resolution steps inside a single row. Zero uses the module
    /// default, falling back to 6.
    pub tempo: u32,

    /// Output sample rate. Zero assumes 44100, the only supported value.
    pub sample_rate: u32,

    /// Insert interpolated sub-samples at load time. Trades memory for a
    /// smoother result without branching in the mixer.
    pub linear_interpolation: bool,
}

/// Sizing facts about a loaded stream.
#[derive(Clone, Copy, Debug)]
pub struct StreamInfo {
    /// Bytes one tick currently occupies; size read buffers from this
    pub bytes_per_tick: usize,
    /// Row duration at the module's default BPM and tempo
    pub seconds_per_row: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JumpKind {
    None,
    PatternBreak,
}

/// An XM playback stream.
///
/// Produces interleaved stereo 16-bit little-endian PCM at 44100 Hz through
/// `read`. Strictly single-threaded; hand the whole stream to an audio
/// thread if the sink lives on one.
pub struct Stream {
    pub(crate) module: PlaybackModule,

    pub(crate) channels: Vec<Channel>,
    /// Channels producing output this tick, rebuilt by the scheduler
    pub(crate) active_channels: Vec<usize>,

    current_pattern: usize,
    pattern_index: i32,
    pattern_rows_remain: i32,
    pattern_row_index: i32,
    row_ticks_remain: i32,
    tick_index: i32,

    // Pattern break state.
    jump_kind: JumpKind,
    jump_pattern: i32,
    jump_row: i32,

    // These values can change during playback.
    bpm: f64,
    pub(crate) samples_per_tick: f64,
    bytes_per_tick: usize,
    ticks_per_row: i32,
    global_volume: f64,

    volume_scaling: f64,
    looping: bool,
    finished: bool,
    /// A tick was scheduled but did not fit the caller's buffer
    pending_tick: bool,

    byte_pos: u64,
    /// Playback offset in seconds, advanced per row
    t: f64,

    event_handler: Option<Box<dyn FnMut(StreamEvent) + Send>>,
}

impl Stream {
    /// Allocate a stream. Use `load_module` to make it playable.
    pub fn new() -> Self {
        Self {
            module: PlaybackModule::default(),
            channels: Vec::new(),
            active_channels: Vec::new(),
            current_pattern: 0,
            pattern_index: -1,
            pattern_rows_remain: 0,
            pattern_row_index: -1,
            row_ticks_remain: 0,
            tick_index: -1,
            jump_kind: JumpKind::None,
            jump_pattern: 0,
            jump_row: 0,
            bpm: 0.0,
            samples_per_tick: 0.0,
            bytes_per_tick: 0,
            ticks_per_row: 0,
            global_volume: 1.0,
            volume_scaling: 0.8,
            looping: false,
            finished: false,
            pending_tick: false,
            byte_pos: 0,
            t: 0.0,
            event_handler: None,
        }
    }

    /// Compile `m` and make it the stream's module, rewound to the start.
    pub fn load_module(
        &mut self,
        m: &chip_ir::Module,
        config: LoadModuleConfig,
    ) -> Result<(), LoadError> {
        let mut config = config;
        if config.sample_rate == 0 {
            config.sample_rate = 44100;
        }
        if config.bpm == 0 {
            config.bpm = m.default_bpm;
            if config.bpm == 0 {
                config.bpm = 120;
            }
        }
        if config.tempo == 0 {
            config.tempo = m.default_tempo;
            if config.tempo == 0 {
                config.tempo = 6;
            }
        }
        if config.sample_rate != 44100 {
            return Err(LoadError::UnsupportedSampleRate(config.sample_rate));
        }

        self.module = compile_module(
            m,
            ModuleConfig {
                sample_rate: config.sample_rate,
                bpm: config.bpm,
                tempo: config.tempo,
                sub_samples: config.linear_interpolation,
            },
        )?;

        self.channels.clear();
        self.channels.extend((0..m.num_channels).map(Channel::new));
        self.active_channels = Vec::with_capacity(m.num_channels);

        self.rewind();
        Ok(())
    }

    /// Global volume scaling in [0, 1]. The default is 0.8; zero mutes.
    pub fn set_volume(&mut self, v: f64) {
        self.volume_scaling = v.clamp(0.0, 1.0);
    }

    /// When looping, the stream rewinds at the song end instead of
    /// reporting end-of-stream.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Install the event callback. Replaces any previous handler.
    pub fn set_event_handler<F>(&mut self, handler: F)
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        self.event_handler = Some(Box::new(handler));
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            bytes_per_tick: self.bytes_per_tick,
            seconds_per_row: self.module.seconds_per_row,
        }
    }

    /// Heap footprint of the compiled module, in bytes.
    pub fn memory_usage(&self) -> usize {
        self.module.memory_usage()
    }

    /// Current position in output bytes since the last rewind.
    pub fn position(&self) -> u64 {
        self.byte_pos
    }

    /// True once the song has ended (never set while looping).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fill `b` with as many complete tick chunks as fit and return the byte
    /// count. Trailing space smaller than one tick is left untouched, so a
    /// buffer smaller than `info().bytes_per_tick` makes no progress.
    /// Returns 0 at the song end when not looping.
    pub fn read(&mut self, b: &mut [u8]) -> usize {
        let mut pos = 0;

        while !self.finished {
            if !self.pending_tick {
                if b.len() - pos < self.bytes_per_tick {
                    break;
                }
                if !self.next_tick() {
                    self.finished = true;
                    break;
                }
                self.pending_tick = true;
            }

            // Tick size may have changed at a row boundary; keep the tick
            // pending until the caller brings a buffer it fits in.
            let n = self.bytes_per_tick;
            if b.len() - pos < n {
                break;
            }
            self.read_tick(&mut b[pos..pos + n]);
            self.pending_tick = false;
            self.byte_pos += n as u64;
            pos += n;
        }

        pos
    }

    /// Reset playback to the start of the song.
    ///
    /// Restores the module's BPM and tempo, full global volume, and resets
    /// every channel. Emits a sync event so the application can rewind its
    /// own clock.
    pub fn rewind(&mut self) {
        if let Some(handler) = self.event_handler.as_mut() {
            handler(StreamEvent::Sync { time: self.t, target_time: 0.0 });
        }

        self.pattern_index = -1;
        self.pattern_rows_remain = 0;
        self.pattern_row_index = -1;
        self.row_ticks_remain = 0;
        self.tick_index = -1;
        self.jump_kind = JumpKind::None;
        self.jump_pattern = 0;
        self.jump_row = 0;

        self.ticks_per_row = self.module.ticks_per_row;
        self.global_volume = 1.0;
        self.bpm = self.module.bpm;
        self.samples_per_tick = self.module.samples_per_tick;
        self.bytes_per_tick = self.module.bytes_per_tick;

        self.byte_pos = 0;
        self.t = 0.0;
        self.finished = false;
        self.pending_tick = false;

        for ch in &mut self.channels {
            ch.reset();
        }
        self.active_channels.clear();
    }

    fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
        let (samples, bytes) = samples_per_tick(self.module.sample_rate, bpm);
        self.samples_per_tick = samples;
        self.bytes_per_tick = bytes;
    }

    /// Advance the clock by one tick. Returns false at the song end.
    fn next_tick(&mut self) -> bool {
        if self.row_ticks_remain == 0 {
            if !self.next_row() {
                if !self.looping {
                    return false;
                }
                self.rewind();
                if !self.next_row() {
                    return false;
                }
            }
        }

        self.row_ticks_remain -= 1;
        self.tick_index += 1;

        self.active_channels.clear();
        for j in 0..self.channels.len() {
            self.tick_envelopes(j);

            {
                let ch = &mut self.channels[j];
                // The panning envelope shifts the channel panning within the
                // headroom left on its narrower side.
                let panning = ch.panning
                    + (ch.panning_envelope.value - 0.5)
                        * (0.5 - libm::fabs(ch.panning - 0.5))
                        * 2.0;
                // 0.25 is an amplification heuristic to avoid clipping.
                let volume = 0.25
                    * self.volume_scaling
                    * self.global_volume
                    * ch.volume
                    * ch.fadeout_volume
                    * ch.volume_envelope.value;
                ch.target_volume[0] = volume * libm::sqrt(1.0 - panning);
                ch.target_volume[1] = volume * libm::sqrt(panning);
                ch.ramp_frame = 0;
            }

            if !self.channels[j].effect.is_empty() {
                self.apply_tick_effect(j);
            }

            let ch = &mut self.channels[j];
            let note = self.module.note_table[ch.note as usize];
            if ch.arpeggio_running && !note.flags.contains(NoteFlags::HAS_ARPEGGIO) {
                ch.arpeggio_running = false;
                ch.arpeggio_note_offset = 0.0;
            }
            if ch.vibrato_running && !note.flags.contains(NoteFlags::HAS_VIBRATO) {
                ch.vibrato_running = false;
                ch.vibrato_period_offset = 0.0;
            }

            let freq = linear_frequency(
                ch.period - 64.0 * ch.arpeggio_note_offset - 16.0 * ch.vibrato_period_offset,
            );
            ch.sample_step = freq / self.module.sample_rate;
            if let Some(ii) = ch.inst {
                let multiplier = self.module.instruments[ii].sample_step_multiplier;
                if multiplier != 1.0 {
                    ch.sample_step *= multiplier;
                }
            }

            if self.channels[j].is_active(&self.module) {
                self.active_channels.push(j);
            } else {
                // A silent channel contributes nothing; make sure a later
                // note ramps in from silence, not stale tail data.
                let ch = &mut self.channels[j];
                ch.ramp_samples = [0.0; RAMP_SAMPLES];
                ch.computed_volume = [0.0; 2];
            }
        }

        true
    }

    fn tick_envelopes(&mut self, j: usize) {
        let ch = &mut self.channels[j];
        let Some(ii) = ch.inst else {
            return;
        };
        let inst = &self.module.instruments[ii];

        if inst.volume_envelope.flags.is_on() {
            if !ch.key_on {
                ch.fadeout_volume = (ch.fadeout_volume - inst.volume_fadeout_step).max(0.0);
            }
            envelope_tick(&inst.volume_envelope, &mut ch.volume_envelope, ch.key_on);
        }

        if inst.panning_envelope.flags.is_on() {
            envelope_tick(&inst.panning_envelope, &mut ch.panning_envelope, ch.key_on);
        }
    }

    /// Advance to the next row, honoring a pending jump.
    /// Returns false when the song has no more rows.
    fn next_row(&mut self) -> bool {
        if self.jump_kind == JumpKind::PatternBreak {
            self.jump_kind = JumpKind::None;
            if self.jump_pattern as usize >= self.module.pattern_order.len() {
                return false;
            }
            self.select_pattern(self.jump_pattern);
            let num_rows = self.module.patterns[self.current_pattern].num_rows as i32;
            let row = self.jump_row.min(num_rows - 1);
            self.pattern_row_index = row;
            self.pattern_rows_remain = num_rows - row - 1;
        } else {
            if self.pattern_rows_remain == 0 {
                if (self.pattern_index + 1) as usize >= self.module.pattern_order.len() {
                    return false;
                }
                self.select_pattern(self.pattern_index + 1);
            }
            self.pattern_row_index += 1;
            self.pattern_rows_remain -= 1;
        }

        let pat = self.module.patterns[self.current_pattern];
        let row = self.pattern_row_index as usize;

        for j in 0..self.channels.len() {
            let note_id = pat.row(&self.module.pattern_note_ids, row)[j];
            self.channels[j].assign_note(note_id, &self.module);
            if !self.channels[j].effect.is_empty() {
                self.apply_row_effect(j);
            }

            let n = self.module.note_table[note_id as usize];
            if n.raw != 0.0 {
                let ch = &self.channels[j];
                let event = StreamEvent::Note {
                    channel: ch.id,
                    time: self.t,
                    note: n.raw as u8,
                    instrument: ch
                        .inst
                        .map(|i| self.module.instruments[i].id as i32)
                        .unwrap_or(-1),
                    volume: ch.volume as f32,
                };
                if let Some(handler) = self.event_handler.as_mut() {
                    handler(event);
                }
            }
        }

        self.t += seconds_per_row(self.ticks_per_row, self.bpm);
        self.row_ticks_remain = self.ticks_per_row;
        self.tick_index = -1;
        true
    }

    fn select_pattern(&mut self, i: i32) {
        self.pattern_index = i;
        self.current_pattern = self.module.pattern_order[i as usize] as usize;
        self.pattern_row_index = -1;
        self.pattern_rows_remain = self.module.patterns[self.current_pattern].num_rows as i32;
    }

    fn key_off(&mut self, j: usize) {
        let ch = &mut self.channels[j];
        ch.key_on = false;
        // With no volume envelope there is no fadeout curve; cut instead.
        let envelope_on = match ch.inst {
            Some(ii) => self.module.instruments[ii].volume_envelope.flags.is_on(),
            None => false,
        };
        if !envelope_on {
            ch.volume = 0.0;
        }
    }

    /// The row (tick 0) branch of the channel's effects: latch memories and
    /// run one-shot actions.
    fn apply_row_effect(&mut self, j: usize) {
        let key = self.channels[j].effect;
        let offset = key.index();

        for k in offset..offset + key.len() {
            let e = self.module.effect_table[k];
            match e.op {
                EffectOp::SetVolume => self.channels[j].volume = e.float_value,

                EffectOp::EarlyKeyOff => self.key_off(j),

                EffectOp::KeyOff => {
                    if e.raw_value == 0 {
                        self.key_off(j);
                    }
                }

                EffectOp::VolumeSlide | EffectOp::VibratoWithVolumeSlide => {
                    if e.float_value != 0.0 {
                        self.channels[j].volume_slide_value = e.float_value;
                    }
                }

                EffectOp::PortamentoUp => {
                    if e.float_value != 0.0 {
                        self.channels[j].portamento_up_value = e.float_value;
                    }
                }

                EffectOp::PortamentoDown => {
                    if e.float_value != 0.0 {
                        self.channels[j].portamento_down_value = e.float_value;
                    }
                }

                EffectOp::NotePortamento => {
                    if e.float_value != 0.0 {
                        self.channels[j].note_portamento_value = e.float_value;
                    }
                    self.latch_portamento_target(j);
                }

                EffectOp::NotePortamentoWithVolumeSlide => {
                    if e.float_value != 0.0 {
                        self.channels[j].volume_slide_value = e.float_value;
                    }
                    self.latch_portamento_target(j);
                }

                EffectOp::Vibrato => {
                    let ch = &mut self.channels[j];
                    if e.arp[0] != 0 {
                        ch.vibrato_speed = e.arp[0];
                    }
                    if e.float_value != 0.0 {
                        ch.vibrato_depth = e.float_value;
                    }
                }

                EffectOp::PatternBreak => {
                    self.jump_kind = JumpKind::PatternBreak;
                    self.jump_pattern = self.pattern_index + 1;
                    self.jump_row = e.arp[0] as i32;
                }

                EffectOp::SetBPM => self.set_bpm(e.float_value),

                EffectOp::SetTempo => self.ticks_per_row = e.raw_value as i32,

                EffectOp::SetPanning => self.channels[j].panning = e.float_value,

                EffectOp::SampleOffset => {
                    let ch = &mut self.channels[j];
                    if let Some(ii) = ch.inst {
                        let inst = &self.module.instruments[ii];
                        // The raw offset counts file bytes; rescale into the
                        // (possibly expanded) pool index space.
                        let mut offset = e.float_value;
                        if inst.sample_16bit {
                            offset *= 0.5;
                        }
                        offset *= (inst.num_sub_samples + 1) as f64;
                        ch.sample_offset = offset;
                        ch.reverse = false;
                    }
                }

                EffectOp::FineVolumeSlideUp => {
                    let ch = &mut self.channels[j];
                    ch.volume = (ch.volume + e.float_value).min(1.0);
                }

                EffectOp::FineVolumeSlideDown => {
                    let ch = &mut self.channels[j];
                    ch.volume = (ch.volume - e.float_value).max(0.0);
                }

                EffectOp::FinePortamentoUp => {
                    let ch = &mut self.channels[j];
                    ch.period = (ch.period - e.float_value).max(MIN_PERIOD);
                }

                EffectOp::FinePortamentoDown => self.channels[j].period += e.float_value,

                EffectOp::SetGlobalVolume => self.global_volume = e.float_value,

                EffectOp::GlobalVolumeSlide => {
                    if e.float_value != 0.0 {
                        self.channels[j].global_volume_slide_value = e.float_value;
                    }
                }

                EffectOp::PanningSlide => {
                    if e.float_value != 0.0 {
                        self.channels[j].panning_slide_value = e.float_value;
                    }
                }

                EffectOp::SetEnvelopePos => {
                    let ch = &mut self.channels[j];
                    ch.volume_envelope.frame = e.raw_value as i32;
                    ch.panning_envelope.frame = e.raw_value as i32;
                }

                _ => {}
            }
        }
    }

    /// Note portamento targets the row's own note, played on whatever
    /// instrument the channel already carries.
    fn latch_portamento_target(&mut self, j: usize) {
        let n = self.module.note_table[self.channels[j].note as usize];
        if n.raw == 0.0 {
            return;
        }
        let ch = &mut self.channels[j];
        let inst = ch.inst.map(|i| &self.module.instruments[i]);
        ch.note_portamento_target_period = linear_period(real_note(n.raw, inst));
    }

    /// The per-tick branch of the channel's effects. Continuous effects skip
    /// tick 0; the volume-column slides run on every tick.
    fn apply_tick_effect(&mut self, j: usize) {
        let key = self.channels[j].effect;
        let offset = key.index();
        let tick = self.tick_index;

        for k in offset..offset + key.len() {
            let e = self.module.effect_table[k];
            match e.op {
                EffectOp::PortamentoUp => {
                    if tick != 0 {
                        let ch = &mut self.channels[j];
                        ch.period = (ch.period - ch.portamento_up_value).max(MIN_PERIOD);
                    }
                }

                EffectOp::PortamentoDown => {
                    if tick != 0 {
                        let ch = &mut self.channels[j];
                        ch.period += ch.portamento_down_value;
                    }
                }

                EffectOp::NotePortamento => {
                    if tick != 0 {
                        self.note_portamento_step(j);
                    }
                }

                EffectOp::NotePortamentoWithVolumeSlide => {
                    if tick != 0 {
                        self.note_portamento_step(j);
                        let ch = &mut self.channels[j];
                        ch.volume = (ch.volume + ch.volume_slide_value).clamp(0.0, 1.0);
                    }
                }

                EffectOp::Vibrato => {
                    if tick != 0 {
                        let ch = &mut self.channels[j];
                        ch.vibrato_running = true;
                        vibrato(ch);
                    }
                }

                EffectOp::VibratoWithVolumeSlide => {
                    if tick != 0 {
                        let ch = &mut self.channels[j];
                        ch.vibrato_running = true;
                        vibrato(ch);
                        ch.volume = (ch.volume + ch.volume_slide_value).clamp(0.0, 1.0);
                    }
                }

                EffectOp::KeyOff => {
                    if e.raw_value as i32 == tick {
                        self.key_off(j);
                    }
                }

                EffectOp::Arpeggio => {
                    let ch = &mut self.channels[j];
                    let i = (tick % 3) as usize;
                    ch.arpeggio_note_offset = e.arp[i] as f64;
                    ch.arpeggio_running = i != 0;
                }

                EffectOp::VolumeSlide => {
                    if tick != 0 {
                        let ch = &mut self.channels[j];
                        ch.volume = (ch.volume + ch.volume_slide_value).clamp(0.0, 1.0);
                    }
                }

                EffectOp::GlobalVolumeSlide => {
                    if tick != 0 {
                        let delta = self.channels[j].global_volume_slide_value;
                        self.global_volume = (self.global_volume + delta).clamp(0.0, 1.0);
                    }
                }

                EffectOp::PanningSlide => {
                    if tick != 0 {
                        let ch = &mut self.channels[j];
                        ch.panning = (ch.panning + ch.panning_slide_value).clamp(0.0, 1.0);
                    }
                }

                EffectOp::VolumeSlideDown => {
                    let ch = &mut self.channels[j];
                    ch.volume = (ch.volume - e.float_value).max(0.0);
                }

                EffectOp::VolumeSlideUp => {
                    let ch = &mut self.channels[j];
                    ch.volume = (ch.volume + e.float_value).min(1.0);
                }

                EffectOp::PanningSlideLeft => {
                    let ch = &mut self.channels[j];
                    ch.panning = (ch.panning - e.float_value).max(0.0);
                }

                EffectOp::PanningSlideRight => {
                    let ch = &mut self.channels[j];
                    ch.panning = (ch.panning + e.float_value).min(1.0);
                }

                EffectOp::NoteCut => {
                    if e.arp[0] as i32 == tick {
                        self.channels[j].volume = 0.0;
                    }
                }

                _ => {}
            }
        }
    }

    fn note_portamento_step(&mut self, j: usize) {
        let ch = &mut self.channels[j];
        if ch.note_portamento_target_period == 0.0 {
            return;
        }
        if ch.period == ch.note_portamento_target_period {
            return;
        }
        ch.period = slide_towards(
            ch.period,
            ch.note_portamento_target_period,
            ch.note_portamento_value,
        );
    }
}

fn vibrato(ch: &mut Channel) {
    ch.vibrato_step = ch.vibrato_step.wrapping_add(ch.vibrato_speed);
    ch.vibrato_period_offset = -2.0 * waveform(ch.vibrato_step) * ch.vibrato_depth;
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl std::io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(Stream::read(self, buf))
    }
}

#[cfg(feature = "std")]
impl std::io::Seek for Stream {
    /// `seek(Start, 0)` rewinds; `seek(Current, 0)` reports the position;
    /// everything else is unsupported.
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        use std::io::SeekFrom;
        match pos {
            SeekFrom::Start(0) => {
                self.rewind();
                Ok(0)
            }
            SeekFrom::Current(0) => Ok(self.byte_pos),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "unsupported seek",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use chip_ir as ir;

    const BYTES_PER_TICK: usize = 3528;

    /// Delta-encode absolute 8-bit sample values.
    fn delta_encode(absolute: &[i8]) -> alloc::vec::Vec<u8> {
        let mut out = alloc::vec::Vec::new();
        let mut prev: i8 = 0;
        for &v in absolute {
            out.push(v.wrapping_sub(prev) as u8);
            prev = v;
        }
        out
    }

    /// A square-wave instrument with a forward loop over the whole sample.
    fn square_instrument() -> ir::Instrument {
        let data = delta_encode(&[62, 62, -62, -62]);
        ir::Instrument {
            samples: vec![ir::Sample {
                length: data.len(),
                loop_start: 0,
                loop_length: 4,
                volume: 64,
                type_flags: 1, // forward loop
                panning: 128,
                data,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// One pattern, one channel, 64 rows; the given notes fill the first rows.
    fn module_with_rows(rows: &[ir::Note]) -> ir::Module {
        let mut m = ir::Module::new();
        m.num_channels = 1;
        m.num_instruments = 1;
        m.instruments.push(square_instrument());

        let mut pattern = ir::Pattern::default();
        for r in 0..64 {
            let id = if r < rows.len() && !rows[r].is_empty() {
                let id = m.notes.len() as u16;
                m.notes.push(rows[r]);
                id
            } else {
                0
            };
            pattern.rows.push(ir::Row { notes: vec![id] });
        }
        m.patterns.push(pattern);
        m.num_patterns = 1;
        m.pattern_order.push(0);
        m.song_length = 1;
        m
    }

    fn stream_for(m: &ir::Module) -> Stream {
        let mut s = Stream::new();
        s.load_module(m, LoadModuleConfig::default()).unwrap();
        s
    }

    fn advance_ticks(s: &mut Stream, n: usize) {
        let mut buf = vec![0u8; BYTES_PER_TICK];
        for _ in 0..n {
            assert_eq!(s.read(&mut buf), BYTES_PER_TICK);
        }
    }

    fn note(note: u8) -> ir::Note {
        ir::Note { note, instrument: 1, ..Default::default() }
    }

    fn note_with_effect(n: u8, effect_type: u8, effect_param: u8) -> ir::Note {
        ir::Note { note: n, instrument: 1, effect_type, effect_param, ..Default::default() }
    }

    #[test]
    fn default_config_derives_tick_geometry() {
        let m = module_with_rows(&[note(49)]);
        let s = stream_for(&m);
        assert_eq!(s.info().bytes_per_tick, BYTES_PER_TICK);
        assert_eq!(s.info().seconds_per_row, 0.125);
    }

    #[test]
    fn unsupported_sample_rate_fails() {
        let m = module_with_rows(&[]);
        let mut s = Stream::new();
        let err = s
            .load_module(&m, LoadModuleConfig { sample_rate: 48000, ..Default::default() })
            .unwrap_err();
        assert_eq!(err, LoadError::UnsupportedSampleRate(48000));
    }

    #[test]
    fn small_buffer_makes_no_progress() {
        let m = module_with_rows(&[note(49)]);
        let mut s = stream_for(&m);
        let mut buf = vec![0u8; BYTES_PER_TICK - 1];
        assert_eq!(s.read(&mut buf), 0);
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn note_sets_period_and_volume() {
        let m = module_with_rows(&[note(49)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 1);
        let ch = &s.channels[0];
        assert_eq!(ch.period, 4608.0);
        assert_eq!(ch.volume, 1.0);
        assert!(ch.key_on);
        // A-4 at 8363 Hz: one pool sample per ~5.27 output frames.
        assert!((ch.sample_step - 8363.0 / 44100.0).abs() < 1e-9);
    }

    #[test]
    fn volume_slide_down_decays_over_row() {
        // 0x0A 0x01: slide down 1/64 per tick after tick 0.
        let m = module_with_rows(&[note_with_effect(49, 0x0A, 0x01)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6);
        let expected = 1.0 - 5.0 / 64.0;
        assert!((s.channels[0].volume - expected).abs() < 1e-12);
    }

    #[test]
    fn volume_slide_up_clamps_at_one() {
        let m = module_with_rows(&[note_with_effect(49, 0x0A, 0x10)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6);
        assert_eq!(s.channels[0].volume, 1.0);
    }

    #[test]
    fn volume_column_slide_applies_every_tick() {
        // Volume byte 0x61: slide down 1/64 on all six ticks.
        let mut n = note(49);
        n.volume = 0x61;
        let m = module_with_rows(&[n]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6);
        let expected = 1.0 - 6.0 / 64.0;
        assert!((s.channels[0].volume - expected).abs() < 1e-12);
    }

    #[test]
    fn set_volume_effect_is_immediate() {
        let m = module_with_rows(&[note_with_effect(49, 0x0C, 32)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 1);
        assert!((s.channels[0].volume - 0.5).abs() < 1e-12);
    }

    #[test]
    fn arpeggio_cycles_note_offsets() {
        // 0x47: offsets cycle 0, +4, +7 per tick.
        let m = module_with_rows(&[note_with_effect(49, 0x00, 0x47)]);
        let mut s = stream_for(&m);
        let mut offsets = alloc::vec::Vec::new();
        for _ in 0..6 {
            advance_ticks(&mut s, 1);
            offsets.push(s.channels[0].arpeggio_note_offset);
        }
        assert_eq!(offsets, [0.0, 4.0, 7.0, 0.0, 4.0, 7.0]);
    }

    #[test]
    fn arpeggio_shifts_sample_step() {
        let m = module_with_rows(&[note_with_effect(49, 0x00, 0x47)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 1);
        let base = s.channels[0].sample_step;
        advance_ticks(&mut s, 1);
        // +4 semitones: period drops by 256, frequency rises.
        assert!(s.channels[0].sample_step > base);
        assert_eq!(s.channels[0].period, 4608.0); // base period untouched
    }

    #[test]
    fn portamento_up_clamps_at_minimum_period() {
        // Very fast slide from a high note: period cannot drop below 50.
        let m = module_with_rows(&[note_with_effect(96, 0x01, 0xFF)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 12);
        assert_eq!(s.channels[0].period, MIN_PERIOD);
    }

    #[test]
    fn portamento_memory_survives_zero_argument() {
        let m = module_with_rows(&[
            note_with_effect(49, 0x01, 0x02),
            note_with_effect(0, 0x01, 0x00),
        ]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6);
        let after_first_row = s.channels[0].period;
        assert_eq!(after_first_row, 4608.0 - 5.0 * 8.0);
        advance_ticks(&mut s, 6);
        // Second row slides with the remembered speed.
        assert_eq!(s.channels[0].period, after_first_row - 5.0 * 8.0);
    }

    #[test]
    fn note_portamento_slides_toward_target_without_retrigger() {
        let porta_cont = ir::Note { effect_type: 0x03, ..Default::default() };
        let m = module_with_rows(&[
            note(49),
            note_with_effect(61, 0x03, 0x08),
            porta_cont,
            porta_cont,
            porta_cont,
            porta_cont,
        ]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6);
        assert_eq!(s.channels[0].period, 4608.0);
        advance_ticks(&mut s, 6);
        // Slid 5 ticks at 32 period units toward 3840. An instant jump to
        // 3840 here would mean the note retriggered instead of sliding.
        assert_eq!(s.channels[0].period, 4608.0 - 5.0 * 32.0);
        advance_ticks(&mut s, 24);
        // The remembered speed keeps sliding on the continuation rows;
        // the target is reached and held, no overshoot.
        assert_eq!(s.channels[0].period, 3840.0);
    }

    #[test]
    fn vibrato_oscillates_and_note_change_clears_it() {
        let m = module_with_rows(&[
            note_with_effect(49, 0x04, 0x84),
            ir::Note::default(),
            note(49),
        ]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 2);
        let ch = &s.channels[0];
        assert!(ch.vibrato_running);
        assert!(ch.vibrato_period_offset != 0.0);
        // Row 2 has no vibrato: the offset clears on its first tick.
        advance_ticks(&mut s, 11);
        assert!(!s.channels[0].vibrato_running);
        assert_eq!(s.channels[0].vibrato_period_offset, 0.0);
    }

    #[test]
    fn key_off_without_envelope_cuts_volume() {
        let m = module_with_rows(&[note(49), ir::Note { note: 97, ..Default::default() }]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6);
        assert_eq!(s.channels[0].volume, 1.0);
        advance_ticks(&mut s, 1);
        let ch = &s.channels[0];
        assert!(!ch.key_on);
        assert_eq!(ch.volume, 0.0);
    }

    #[test]
    fn key_off_with_envelope_fades_out() {
        let mut m = module_with_rows(&[note(49), ir::Note { note: 97, ..Default::default() }]);
        {
            let inst = &mut m.instruments[0];
            inst.volume_flags = ir::EnvelopeFlags(ir::EnvelopeFlags::ON);
            inst.volume_envelope = vec![
                ir::EnvelopePoint { frame: 0, value: 64 },
                ir::EnvelopePoint { frame: 100, value: 64 },
            ];
            inst.volume_fadeout = 4096;
        }
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 7);
        let ch = &s.channels[0];
        assert!(!ch.key_on);
        assert_eq!(ch.volume, 1.0); // volume survives; fadeout takes over
        let f1 = ch.fadeout_volume;
        assert!(f1 < 1.0);
        advance_ticks(&mut s, 1);
        let f2 = s.channels[0].fadeout_volume;
        assert!(f2 < f1);
        assert!((f1 - f2 - 4096.0 / 32768.0).abs() < 1e-12);
    }

    #[test]
    fn delayed_key_off_fires_on_its_tick() {
        let m = module_with_rows(&[note_with_effect(49, 0x14, 3)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 3);
        assert!(s.channels[0].key_on);
        advance_ticks(&mut s, 1);
        assert!(!s.channels[0].key_on);
    }

    #[test]
    fn note_cut_zeroes_volume_on_its_tick() {
        let m = module_with_rows(&[note_with_effect(49, 0x0E, 0xC2)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 2);
        assert_eq!(s.channels[0].volume, 1.0);
        advance_ticks(&mut s, 1);
        assert_eq!(s.channels[0].volume, 0.0);
    }

    #[test]
    fn fine_volume_slide_fires_once_per_row() {
        let m = module_with_rows(&[note_with_effect(49, 0x0E, 0xB8)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 1);
        let expected = 1.0 - 8.0 / 64.0;
        assert!((s.channels[0].volume - expected).abs() < 1e-12);
        advance_ticks(&mut s, 5);
        assert!((s.channels[0].volume - expected).abs() < 1e-12);
    }

    #[test]
    fn set_tempo_changes_row_length() {
        let m = module_with_rows(&[note_with_effect(49, 0x0F, 3)]);
        let mut s = stream_for(&m);
        // Row 0 now spans 3 ticks; tick 4 lands on row 1.
        advance_ticks(&mut s, 3);
        assert_eq!(s.pattern_row_index, 0);
        advance_ticks(&mut s, 1);
        assert_eq!(s.pattern_row_index, 1);
    }

    #[test]
    fn set_bpm_changes_tick_size() {
        let m = module_with_rows(&[note_with_effect(49, 0x0F, 0xF0)]);
        let mut s = stream_for(&m);
        let mut buf = vec![0u8; 8192];
        let n = s.read(&mut buf);
        assert!(n > 0);
        // 240 BPM: round(44100 / 96) = 459 samples per tick.
        assert_eq!(s.info().bytes_per_tick, 459 * 4);
    }

    #[test]
    fn global_volume_scales_target() {
        let m = module_with_rows(&[note_with_effect(49, 0x10, 32)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 1);
        assert!((s.global_volume - 0.5).abs() < 1e-12);
        let target = s.channels[0].target_volume;
        // Half global volume at center panning.
        let expected = 0.25 * 0.8 * 0.5 * libm::sqrt(0.5);
        assert!((target[0] - expected).abs() < 1e-9);
        assert!((target[1] - expected).abs() < 1e-9);
    }

    #[test]
    fn panning_slide_moves_right() {
        let m = module_with_rows(&[note_with_effect(49, 0x19, 0x40)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6);
        let expected = 0.5 + 5.0 * 4.0 / 255.0;
        assert!((s.channels[0].panning - expected).abs() < 1e-12);
    }

    #[test]
    fn sample_offset_moves_playback_position() {
        // Offset of 1*256 bytes lands past this tiny sample's end.
        let m = module_with_rows(&[note_with_effect(49, 0x09, 1)]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 1);
        assert_eq!(s.channels[0].sample_offset, 256.0);
    }

    #[test]
    fn pattern_break_jumps_to_row_of_next_pattern() {
        let mut m = module_with_rows(&[note_with_effect(49, 0x0D, 0x20)]);
        // Add a second, distinguishable pattern.
        let mut p1 = ir::Pattern::default();
        for _ in 0..64 {
            p1.rows.push(ir::Row { notes: vec![0] });
        }
        m.patterns.push(p1);
        m.num_patterns = 2;
        m.pattern_order.push(1);
        m.song_length = 2;

        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6); // row 0 of pattern 0
        advance_ticks(&mut s, 1); // first tick after the jump
        assert_eq!(s.pattern_index, 1);
        assert_eq!(s.pattern_row_index, 20);

        // Remainder: rows 20..63 of pattern 1, minus the tick just played.
        let mut total = 7 * BYTES_PER_TICK as u64;
        let mut buf = vec![0u8; BYTES_PER_TICK];
        loop {
            let n = s.read(&mut buf);
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        assert_eq!(total, (1 + 44) * 6 * BYTES_PER_TICK as u64);
        assert_eq!(s.position(), total);
    }

    #[test]
    fn break_past_song_end_finishes_playback() {
        let m = module_with_rows(&[note_with_effect(49, 0x0D, 0x00)]);
        let mut s = stream_for(&m);
        let mut buf = vec![0u8; BYTES_PER_TICK];
        let mut ticks = 0;
        while s.read(&mut buf) > 0 {
            ticks += 1;
        }
        assert_eq!(ticks, 6); // row 0 plays, then the jump ends the song
        assert!(s.is_finished());
    }

    #[test]
    fn empty_module_renders_silence_then_eof() {
        let m = module_with_rows(&[]);
        let mut s = stream_for(&m);
        let mut buf = vec![0u8; BYTES_PER_TICK * 8];
        let mut total = 0usize;
        loop {
            let n = s.read(&mut buf);
            if n == 0 {
                break;
            }
            assert!(buf[..n].iter().all(|&b| b == 0), "silent module produced sound");
            total += n;
        }
        assert_eq!(total, 64 * 6 * BYTES_PER_TICK);
        assert_eq!(s.read(&mut buf), 0); // EOF is sticky
    }

    #[test]
    fn looping_stream_rewinds_instead_of_eof() {
        let m = module_with_rows(&[note(49)]);
        let mut s = stream_for(&m);
        s.set_looping(true);
        let song_bytes = 64 * 6 * BYTES_PER_TICK;
        let mut buf = vec![0u8; BYTES_PER_TICK];
        let mut total = 0usize;
        while total < song_bytes + BYTES_PER_TICK {
            let n = s.read(&mut buf);
            assert!(n > 0, "looping stream must not end");
            total += n;
        }
        assert!(!s.is_finished());
    }

    #[test]
    fn note_events_report_channel_note_and_volume() {
        use std::sync::{Arc, Mutex};
        let m = module_with_rows(&[note_with_effect(49, 0x0C, 16)]);
        let mut s = stream_for(&m);
        let events = Arc::new(Mutex::new(alloc::vec::Vec::new()));
        let sink = events.clone();
        s.set_event_handler(move |ev| sink.lock().unwrap().push(ev));
        advance_ticks(&mut s, 1);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match events[0] {
            StreamEvent::Note { channel, time, note, instrument, volume } => {
                assert_eq!(channel, 0);
                assert_eq!(time, 0.0);
                assert_eq!(note, 49);
                assert_eq!(instrument, 0);
                assert!((volume - 0.25).abs() < 1e-6);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn rewind_emits_sync_event() {
        use std::sync::{Arc, Mutex};
        let m = module_with_rows(&[note(49)]);
        let mut s = stream_for(&m);
        let events = Arc::new(Mutex::new(alloc::vec::Vec::new()));
        let sink = events.clone();
        s.set_event_handler(move |ev| {
            if let StreamEvent::Sync { .. } = ev {
                sink.lock().unwrap().push(ev);
            }
        });
        advance_ticks(&mut s, 12);
        s.rewind();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match events[0] {
            StreamEvent::Sync { time, target_time } => {
                assert!((time - 0.25).abs() < 1e-9);
                assert_eq!(target_time, 0.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn ghost_note_keeps_volume_ghost_instrument_keeps_position() {
        let m = module_with_rows(&[
            note_with_effect(49, 0x0C, 16), // volume 0.25
            ir::Note { note: 51, ..Default::default() }, // ghost note
            ir::Note { instrument: 1, ..Default::default() }, // ghost instrument
        ]);
        let mut s = stream_for(&m);
        advance_ticks(&mut s, 6);
        assert!((s.channels[0].volume - 0.25).abs() < 1e-12);

        advance_ticks(&mut s, 6);
        // Ghost note: new period, volume survives.
        let ch = &s.channels[0];
        assert_eq!(ch.period, linear_period(real_note(51.0, None)));
        assert!((ch.volume - 0.25).abs() < 1e-12);
        let offset = ch.sample_offset;
        assert!(offset > 0.0);

        advance_ticks(&mut s, 1);
        // Ghost instrument: volume resets to the instrument default, the
        // sample keeps running.
        let ch = &s.channels[0];
        assert_eq!(ch.volume, 1.0);
        assert!(ch.sample_offset >= offset);
    }

    #[test]
    fn memory_usage_reports_compiled_size() {
        let m = module_with_rows(&[note(49)]);
        let s = stream_for(&m);
        assert!(s.memory_usage() > 0);
    }
}
