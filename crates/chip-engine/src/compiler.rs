//! The module compiler: raw module in, playback module out.
//!
//! Compilation normalizes sample data (delta to absolute, 8 to 16 bit,
//! ping-pong unrolling, optional sub-sample insertion), compiles envelopes,
//! interns pattern notes and effect triples into flat tables, and precomputes
//! per-note flags and effect arguments so the driver does no decoding work.

use alloc::vec;
use alloc::vec::Vec;
use hashbrown::HashMap;

use chip_ir as ir;
use chip_ir::{SampleEncoding, SampleLoopType};

use crate::effects::{Effect, EffectOp};
use crate::error::LoadError;
use crate::frequency::{lerp, linear_period, real_note, samples_per_tick, seconds_per_row};
use crate::module::{
    CompiledEffect, EffectKey, Envelope, EnvelopePoint, Instrument, NoteFlags, NoteKind, Pattern,
    PatternNote, PlaybackModule,
};

#[derive(Clone, Copy, Debug)]
pub(crate) struct ModuleConfig {
    pub sample_rate: u32,
    pub bpm: u32,
    pub tempo: u32,
    pub sub_samples: bool,
}

pub(crate) fn compile_module(
    m: &ir::Module,
    config: ModuleConfig,
) -> Result<PlaybackModule, LoadError> {
    let mut c = ModuleCompiler {
        m,
        result: PlaybackModule {
            sample_rate: config.sample_rate as f64,
            bpm: config.bpm as f64,
            ticks_per_row: config.tempo as i32,
            note_table: vec![PatternNote::default(); m.notes.len()],
            ..Default::default()
        },
        effect_set: HashMap::with_capacity(24),
        pool_cursor: 0,
        sub_samples: config.sub_samples,
    };
    c.compile()?;
    Ok(c.result)
}

struct ModuleCompiler<'a> {
    m: &'a ir::Module,
    result: PlaybackModule,
    /// Packed effect triples already interned
    effect_set: HashMap<u64, EffectKey>,
    pool_cursor: usize,
    sub_samples: bool,
}

impl ModuleCompiler<'_> {
    fn compile(&mut self) -> Result<(), LoadError> {
        if !self.m.uses_linear_frequency() {
            return Err(LoadError::UnsupportedFrequencyTable);
        }

        let (samples, bytes) = samples_per_tick(self.result.sample_rate, self.result.bpm);
        self.result.samples_per_tick = samples;
        self.result.bytes_per_tick = bytes;
        self.result.seconds_per_row = seconds_per_row(self.result.ticks_per_row, self.result.bpm);

        self.compile_instruments()?;
        self.compile_patterns()?;

        // Assign the derived pattern-note flags. Some flags could be set
        // already, so the assignment below must OR.
        for pi in 0..self.result.patterns.len() {
            let pat = self.result.patterns[pi];
            let cells = pat.notes_offset..pat.notes_offset + pat.num_rows * pat.num_channels;
            for cell in cells {
                let id = self.result.pattern_note_ids[cell] as usize;
                let extra = self.generate_note_flags(&self.result.note_table[id]);
                self.result.note_table[id].flags.insert(extra);
            }
        }

        debug_assert_eq!(self.pool_cursor, self.result.sample_pool.len());

        Ok(())
    }

    fn compile_instruments(&mut self) -> Result<(), LoadError> {
        self.result.instruments = vec![Instrument::default(); self.m.instruments.len()];
        for (i, raw_inst) in self.m.instruments.iter().enumerate() {
            if raw_inst.samples.is_empty() {
                continue;
            }
            let mut inst = self.compile_instrument(i, raw_inst)?;
            inst.id = i;
            self.result.instruments[i] = inst;
        }

        let mut combined_size = 0;
        for (i, raw_inst) in self.m.instruments.iter().enumerate() {
            if raw_inst.samples.is_empty() {
                continue;
            }
            combined_size +=
                self.total_sample_size(&self.result.instruments[i], &raw_inst.samples[0]);
        }
        // One allocation serves every sample in the module.
        self.result.sample_pool = vec![0i16; combined_size];

        for (i, raw_inst) in self.m.instruments.iter().enumerate() {
            if raw_inst.samples.is_empty() {
                continue;
            }
            self.load_instrument_sample(i, &raw_inst.samples[0]);
        }

        Ok(())
    }

    fn compile_instrument(
        &self,
        index: usize,
        raw: &ir::Instrument,
    ) -> Result<Instrument, LoadError> {
        if raw.samples.len() != 1 {
            return Err(LoadError::UnsupportedMultiSample {
                instrument: index,
                count: raw.samples.len(),
            });
        }

        let sample = &raw.samples[0];
        if sample.encoding == SampleEncoding::Adpcm {
            return Err(LoadError::UnsupportedSampleEncoding { instrument: index });
        }

        // Loop geometry starts in byte units, exactly as stored in the file.
        let mut loop_start = sample.loop_start as i64;
        let mut loop_end = (sample.loop_start + sample.loop_length) as i64;
        let mut loop_length = sample.loop_length as i64;
        if sample.loop_start > sample.length {
            loop_start = loop_length;
        }
        if loop_end > sample.length as i64 {
            loop_end = sample.length as i64;
        }
        loop_length = loop_end - loop_start;
        if sample.is_16bit() {
            loop_end /= 2;
            loop_start /= 2;
            loop_length /= 2;
        }

        let mut loop_type = sample.loop_type();
        if loop_type == SampleLoopType::Forward && loop_length == 0 {
            // Trackers write zero-length loops to mean "no loop"; keeping the
            // flag would wedge the mixer's wrap check.
            loop_type = SampleLoopType::None;
        }
        match loop_type {
            SampleLoopType::None => {}
            SampleLoopType::Forward => {
                if loop_start > loop_end {
                    return Err(LoadError::MalformedSampleLoop { instrument: index });
                }
            }
            SampleLoopType::PingPong => {
                if sample.data.len() < 2 || loop_length < 2 {
                    return Err(LoadError::MalformedPingPongLoop { instrument: index });
                }
            }
            SampleLoopType::Unknown => {
                return Err(LoadError::UnsupportedSampleLoopType { instrument: index });
            }
        }

        let volume_envelope = compile_envelope(
            &raw.volume_envelope,
            raw.volume_flags,
            raw.volume_sustain_point,
            raw.volume_loop_start_point,
            raw.volume_loop_end_point,
        );
        let panning_envelope = compile_envelope(
            &raw.panning_envelope,
            raw.panning_flags,
            raw.panning_sustain_point,
            raw.panning_loop_start_point,
            raw.panning_loop_end_point,
        );

        Ok(Instrument {
            finetune: sample.finetune,
            relative_note: sample.relative_note,

            volume: sample.volume as f64 / 64.0,
            panning: sample.panning as f64 / 256.0,

            volume_envelope,
            panning_envelope,

            volume_fadeout_step: raw.volume_fadeout as f64 / 32768.0,

            loop_type,
            loop_start: loop_start as f64,
            // An unreachable loop end removes the no-loop branch from the
            // mixer's wrap check.
            loop_end: if loop_type == SampleLoopType::None {
                f64::INFINITY
            } else {
                loop_end as f64
            },
            loop_length: loop_length as f64,

            sample_16bit: sample.is_16bit(),
            ..Default::default()
        })
    }

    fn load_instrument_sample(&mut self, index: usize, sample: &ir::Sample) {
        let num_samples = num_samples(sample);
        let sample_size = self.sample_size(&self.result.instruments[index], sample);
        let total_size = self.total_sample_size(&self.result.instruments[index], sample);
        let num_sub = self.num_sub_samples(sample);

        let offset = self.pool_cursor;
        self.pool_cursor += total_size;

        let inst = &mut self.result.instruments[index];
        inst.pool_offset = offset;
        inst.pool_len = total_size;

        // The slice is large enough for the unrolled loop and the sub-samples.
        // Sub-samples are ignored while decoding and inserted in a separate
        // pass over the same memory.
        let dst = &mut self.result.sample_pool[offset..offset + total_size];

        if sample.is_16bit() {
            // The payload stores little-endian 16-bit deltas.
            let mut v: i16 = 0;
            for (k, word) in sample.data.chunks_exact(2).enumerate() {
                v = v.wrapping_add(i16::from_le_bytes([word[0], word[1]]));
                dst[k] = v;
            }
        } else {
            // 8-bit deltas accumulate into signed bytes, then shift up to
            // the 16-bit range.
            let mut v: i8 = 0;
            for (k, &delta) in sample.data.iter().enumerate() {
                v = v.wrapping_add(delta as i8);
                dst[k] = (v as i16) << 8;
            }
        }

        if inst.loop_type == SampleLoopType::PingPong {
            // Turn the ping-pong loop into a forward loop:
            // [1 2 3 4 5] => [1 2 3 4 5 | 4 3 2]
            // [1 2 3 4]   => [1 2 3 4 | 3 2]
            let loop_end = inst.loop_end as usize;
            let num_extra = inst.loop_length as usize - 2;
            inst.loop_length += num_extra as f64;
            inst.loop_end += num_extra as f64;
            for i in 0..num_extra {
                dst[num_samples + i] = dst[loop_end - 2 - i];
            }
        }

        if self.sub_samples {
            insert_sub_samples(inst, dst, sample_size, num_sub);
        }
    }

    /// Sample count after loop unrolling, before sub-sample insertion.
    fn sample_size(&self, inst: &Instrument, sample: &ir::Sample) -> usize {
        let mut n = num_samples(sample);
        if sample.loop_type() == SampleLoopType::PingPong {
            n += inst.loop_length as usize - 2;
        }
        n
    }

    /// Final sample count, including inserted sub-samples.
    fn total_sample_size(&self, inst: &Instrument, sample: &ir::Sample) -> usize {
        let n = self.sample_size(inst, sample);
        let num_sub = self.num_sub_samples(sample);
        n + n.saturating_sub(1) * num_sub
    }

    /// How many interpolated samples go between each adjacent pair.
    /// Short samples get more; long samples would double memory for little
    /// audible gain.
    fn num_sub_samples(&self, sample: &ir::Sample) -> usize {
        if !self.sub_samples {
            return 0;
        }
        match num_samples(sample) {
            0..=1 => 0,
            2..=256 => 7,
            257..=1024 => 4,
            1025..=4096 => 3,
            _ => 1,
        }
    }

    fn compile_patterns(&mut self) -> Result<(), LoadError> {
        self.result.patterns = vec![Pattern::default(); self.m.patterns.len()];
        self.result.pattern_order = self
            .m
            .pattern_order
            .iter()
            .filter(|&&p| (p as usize) < self.m.patterns.len())
            .map(|&p| p as u16)
            .collect();

        let total_notes: usize = self
            .m
            .patterns
            .iter()
            .map(|p| p.rows.len() * self.m.num_channels)
            .sum();
        self.result.pattern_note_ids = vec![0u16; total_notes];

        let mut cell = 0;
        for pi in 0..self.m.patterns.len() {
            let raw_pat = &self.m.patterns[pi];
            {
                let pat = &mut self.result.patterns[pi];
                pat.num_channels = self.m.num_channels;
                pat.num_rows = raw_pat.rows.len();
                pat.notes_offset = cell;
            }

            for row in &raw_pat.rows {
                for &note_id in &row.notes {
                    self.compile_note(note_id)?;
                    self.result.pattern_note_ids[cell] = note_id;
                    cell += 1;
                }
            }
        }

        Ok(())
    }

    /// Compile one pattern cell into the shared note table.
    /// The first compilation of a note id wins; later cells reuse it.
    fn compile_note(&mut self, note_id: u16) -> Result<(), LoadError> {
        let raw_note = self.m.notes[note_id as usize];

        let mut inst_ref: Option<u16> = None;
        let mut bad_instrument = false;
        if raw_note.instrument != 0 {
            let idx = raw_note.instrument as usize - 1;
            if idx < self.result.instruments.len() {
                inst_ref = Some(idx as u16);
            } else {
                bad_instrument = true;
            }
        }

        let fnote = raw_note.note as f64;
        let is_valid = raw_note.is_playable();
        let mut period = 0.0;
        if is_valid {
            if let Some(ii) = inst_ref {
                let inst = &self.result.instruments[ii as usize];
                period = linear_period(real_note(fnote, Some(inst)));
            }
        }

        let e1 = if raw_note.note == ir::Note::KEY_OFF {
            Effect { op: EffectOp::EarlyKeyOff, arg: 0 }
        } else {
            Effect::default()
        };
        let e2 = Effect::from_volume_byte(raw_note.volume);
        let e3 = Effect::from_effect_byte(raw_note.effect_type, raw_note.effect_param)?;
        let effect = self.compile_effect(e1, e2, e3)?;

        let mut flags = NoteFlags::default();
        if is_valid {
            flags.insert(NoteFlags::VALID);
        }
        if bad_instrument {
            flags.insert(NoteFlags::BAD_INSTRUMENT);
        }

        let kind = if raw_note.note == 0 && raw_note.instrument == 0 {
            NoteKind::Empty
        } else if raw_note.note == 0 {
            NoteKind::GhostInstrument
        } else if is_valid && raw_note.instrument == 0 {
            NoteKind::Ghost
        } else if is_valid {
            NoteKind::Normal
        } else {
            // A special note like key-off; it still carries its effects.
            NoteKind::Empty
        };
        flags.set_kind(kind);

        if !self.result.note_table[note_id as usize].flags.contains(NoteFlags::INITIALIZED) {
            flags.insert(NoteFlags::INITIALIZED);
            self.result.note_table[note_id as usize] =
                PatternNote { raw: fnote, period, inst: inst_ref, effect, flags };
        }

        Ok(())
    }

    /// The fast-path predicates the driver checks when a note changes.
    fn generate_note_flags(&self, n: &PatternNote) -> u8 {
        let mut flags = 0;
        let offset = n.effect.index();
        for e in &self.result.effect_table[offset..offset + n.effect.len()] {
            match e.op {
                EffectOp::NotePortamento | EffectOp::NotePortamentoWithVolumeSlide => {
                    flags |= NoteFlags::HAS_NOTE_PORTAMENTO;
                }
                EffectOp::Arpeggio => flags |= NoteFlags::HAS_ARPEGGIO,
                EffectOp::Vibrato | EffectOp::VibratoWithVolumeSlide => {
                    flags |= NoteFlags::HAS_VIBRATO;
                }
                _ => {}
            }
        }
        flags
    }

    /// Intern an effect triple, compiling its entries on first sight.
    fn compile_effect(&mut self, e1: Effect, e2: Effect, e3: Effect) -> Result<EffectKey, LoadError> {
        let hash = (e1.as_u16() as u64)
            | (e2.as_u16() as u64) << 16
            | (e3.as_u16() as u64) << 32;
        if hash == 0 {
            return Ok(EffectKey::default());
        }
        if let Some(&key) = self.effect_set.get(&hash) {
            return Ok(key);
        }

        let index = self.result.effect_table.len();
        let mut real_length = 0;

        for e in [e1, e2, e3] {
            if e.op == EffectOp::None {
                continue;
            }

            let mut compiled = CompiledEffect {
                op: e.op,
                raw_value: e.arg,
                ..Default::default()
            };

            match e.op {
                EffectOp::SetVolume | EffectOp::SetGlobalVolume => {
                    compiled.float_value = e.arg.min(64) as f64 / 64.0;
                }

                EffectOp::KeyOff => {
                    if e.arg as i64 > self.result.ticks_per_row as i64 - 1 {
                        // This key-off can never fire. Discard it.
                        continue;
                    }
                }

                EffectOp::Arpeggio => {
                    compiled.arp[0] = 0; // the original note
                    compiled.arp[1] = e.arg >> 4;
                    compiled.arp[2] = e.arg & 0b1111;
                }

                EffectOp::VolumeSlideUp
                | EffectOp::VolumeSlideDown
                | EffectOp::FineVolumeSlideUp
                | EffectOp::FineVolumeSlideDown => {
                    compiled.float_value = e.arg as f64 / 64.0;
                }

                EffectOp::PortamentoUp
                | EffectOp::PortamentoDown
                | EffectOp::NotePortamento
                | EffectOp::FinePortamentoUp
                | EffectOp::FinePortamentoDown => {
                    compiled.float_value = e.arg as f64 * 4.0;
                }

                EffectOp::Vibrato => {
                    compiled.arp[0] = e.arg >> 4; // speed
                    compiled.float_value = (e.arg & 0b1111) as f64 / 15.0; // depth
                }

                EffectOp::VolumeSlide
                | EffectOp::VibratoWithVolumeSlide
                | EffectOp::NotePortamentoWithVolumeSlide
                | EffectOp::GlobalVolumeSlide => {
                    let slide_up = e.arg >> 4;
                    let slide_down = e.arg & 0b1111;
                    if slide_up > 0 && slide_down > 0 {
                        return Err(LoadError::VolumeSlideBothDirections);
                    }
                    compiled.float_value = if slide_up > 0 {
                        slide_up as f64 / 64.0
                    } else {
                        -(slide_down as f64 / 64.0)
                    };
                }

                EffectOp::PatternBreak => {
                    // The argument reads as two decimal digits.
                    compiled.arp[0] = (e.arg >> 4) * 10 + (e.arg & 0b1111);
                }

                EffectOp::SetPanning => {
                    compiled.float_value = e.arg as f64 / 255.0;
                }

                EffectOp::SetBPM => {
                    compiled.float_value = e.arg as f64;
                }

                EffectOp::NoteCut => {
                    compiled.arp[0] = e.arg & 0b1111;
                }

                EffectOp::PanningSlide => {
                    let slide_right = e.arg >> 4;
                    let slide_left = e.arg & 0b1111;
                    if slide_right > 0 && slide_left > 0 {
                        return Err(LoadError::PanningSlideBothDirections);
                    }
                    compiled.float_value = if slide_right > 0 {
                        slide_right as f64 / 255.0
                    } else {
                        -(slide_left as f64 / 255.0)
                    };
                }

                EffectOp::PanningSlideLeft | EffectOp::PanningSlideRight => {
                    compiled.float_value = e.arg as f64 / 255.0;
                }

                EffectOp::SampleOffset => {
                    compiled.float_value = e.arg as f64 * 256.0;
                }

                _ => {}
            }

            self.result.effect_table.push(compiled);
            real_length += 1;
        }

        let key = EffectKey::new(index, real_length);
        self.effect_set.insert(hash, key);
        Ok(key)
    }
}

/// Samples in the raw payload (16-bit payloads count words, not bytes).
fn num_samples(sample: &ir::Sample) -> usize {
    let n = sample.data.len();
    if sample.is_16bit() {
        n / 2
    } else {
        n
    }
}

fn compile_envelope(
    points: &[ir::EnvelopePoint],
    flags: ir::EnvelopeFlags,
    sustain: u8,
    loop_start: u8,
    loop_end: u8,
) -> Envelope {
    let mut e = Envelope {
        flags,
        sustain_point: sustain,
        loop_start_point: loop_start,
        loop_end_point: loop_end,
        ..Default::default()
    };

    if !points.is_empty() {
        let last = (points.len() - 1) as u8;
        e.sustain_point = e.sustain_point.min(last);
        e.loop_start_point = e.loop_start_point.min(last);
        e.loop_end_point = e.loop_end_point.min(last);
        e.points = points
            .iter()
            .map(|p| EnvelopePoint { frame: p.frame as i32, value: p.value as f64 })
            .collect();

        e.sustain_frame = e.points[e.sustain_point as usize].frame;
        e.loop_end_frame = e.points[e.loop_end_point as usize].frame;
        let loop_start_frame = e.points[e.loop_start_point as usize].frame;
        e.loop_length = e.loop_end_frame - loop_start_frame;
    }

    e
}

/// Insert `num_sub` linearly interpolated samples between each adjacent
/// sample pair, in place.
///
/// Iterates from the end of the slice: the trailing zero-filled part serves
/// as scratch space, so reads never hit already-rewritten data.
fn insert_sub_samples(inst: &mut Instrument, dst: &mut [i16], sample_size: usize, num_sub: usize) {
    if num_sub == 0 {
        return;
    }

    let samples_to_process = sample_size - 1;
    let t_step = 1.0 / (num_sub + 1) as f64;
    let k_step = num_sub + 1;
    let mut k = dst.len() - 1;

    for i in (1..=samples_to_process).rev() {
        let u = dst[i - 1];
        let v = dst[i];
        let uf = u as f64;
        let vf = v as f64;
        dst[k - k_step] = u;
        dst[k] = v;
        let mut t = t_step;
        for j in 0..num_sub {
            dst[k - j - 1] = lerp(vf, uf, t) as i16;
            t += t_step;
        }
        k -= k_step;
    }

    inst.sample_step_multiplier =
        (sample_size + (sample_size - 1) * num_sub) as f64 / sample_size as f64;
    inst.num_sub_samples = num_sub;

    // Rescale the loop geometry into the expanded index space. The last
    // segment of each span has no trailing sub-samples, hence the -num_sub.
    if inst.loop_type != SampleLoopType::None {
        let scale = num_sub + 1;
        inst.loop_end = (inst.loop_end as usize * scale - num_sub) as f64;
        inst.loop_start = (inst.loop_start as usize * scale) as f64;
        inst.loop_length = (inst.loop_length as usize * scale - num_sub) as f64;
    }
}
