//! XM (FastTracker II Extended Module) parser.
//!
//! Format reference: the FastTracker II file spec v0104, plus MilkyTracker's
//! xm-form.txt. Stated header sizes are respected over fixed layouts, so
//! files written by other trackers with extended headers still parse.

use alloc::vec::Vec;
use arrayvec::ArrayString;
use hashbrown::HashMap;

use chip_ir::{
    EnvelopeFlags, EnvelopePoint, Instrument, Module, Note, Pattern, Row, Sample, SampleEncoding,
};

use crate::FormatError;

/// XM magic text, compared case-insensitively like trackers do.
const XM_MAGIC: &[u8; 17] = b"Extended Module: ";

/// Maximum envelope points an instrument header can carry.
const MAX_ENVELOPE_POINTS: usize = 12;

/// Parse an XM file image into a raw module.
pub fn load_xm(data: &[u8]) -> Result<Module, FormatError> {
    let mut p = Parser {
        r: Reader { data, offset: 0 },
        module: Module::new(),
        note_ids: HashMap::new(),
    };
    // The empty note is pre-seeded at id 0.
    p.note_ids.insert(0, 0);

    p.parse_header()?;
    for _ in 0..p.module.num_patterns {
        let pattern = p.parse_pattern()?;
        p.module.patterns.push(pattern);
    }
    for _ in 0..p.module.num_instruments {
        let instrument = p.parse_instrument()?;
        p.module.instruments.push(instrument);
    }

    Ok(p.module)
}

/// Cursor over the file image.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], FormatError> {
        if self.remaining() < n {
            return Err(FormatError::UnexpectedEof { what, offset: self.offset });
        }
        let b = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(b)
    }

    fn skip(&mut self, n: usize, what: &'static str) -> Result<(), FormatError> {
        self.bytes(n, what).map(|_| ())
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, FormatError> {
        Ok(self.bytes(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, FormatError> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, FormatError> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

struct Parser<'a> {
    r: Reader<'a>,
    module: Module,
    /// Packed note bytes already interned into the shared table
    note_ids: HashMap<u64, u16>,
}

impl Parser<'_> {
    fn invalid(&self, what: &'static str, value: i64) -> FormatError {
        FormatError::InvalidValue { what, value, offset: self.r.offset }
    }

    fn parse_header(&mut self) -> Result<(), FormatError> {
        let magic = self.r.bytes(XM_MAGIC.len(), "id text")?;
        if !magic.eq_ignore_ascii_case(XM_MAGIC) {
            return Err(FormatError::InvalidMagic);
        }

        self.module.name = fixed_string(self.r.bytes(20, "module name")?);

        let escape = self.r.u8("magic byte")?;
        if escape != 0x1A {
            return Err(self.invalid("magic byte", escape as i64));
        }

        self.module.tracker_name = fixed_string(self.r.bytes(20, "tracker name")?);
        self.module.version = self.r.u16("version")?;

        let header_size = self.r.u32("header size")?.wrapping_sub(4) as usize;
        if self.r.remaining() < header_size {
            return Err(self.invalid("header size", header_size as i64));
        }
        let header_end = self.r.offset + header_size;

        let song_length = self.r.u16("song length")? as usize;
        if song_length == 0 || song_length > 256 {
            return Err(self.invalid("song length", song_length as i64));
        }
        self.module.song_length = song_length;

        self.module.restart_position = self.r.u16("restart position")? as usize;
        if self.module.restart_position > song_length {
            self.module.restart_position = 0;
        }

        self.module.num_channels = self.r.u16("number of channels")? as usize;
        self.module.num_patterns = self.r.u16("number of patterns")? as usize;
        self.module.num_instruments = self.r.u16("number of instruments")? as usize;
        self.module.flags = self.r.u16("flags")?;
        self.module.default_tempo = self.r.u16("default tempo")? as u32;
        self.module.default_bpm = self.r.u16("default bpm")? as u32;

        self.module.pattern_order =
            self.r.bytes(song_length, "pattern order table")?.to_vec();

        // Respect the stated header size; extra header bytes belong to the
        // writing tracker.
        self.r.offset = header_end;
        Ok(())
    }

    fn parse_pattern(&mut self) -> Result<Pattern, FormatError> {
        let header_length = self.r.u32("pattern header length")? as usize;
        if header_length < 9 {
            return Err(self.invalid("pattern header length", header_length as i64));
        }
        self.r.skip(1, "packing type")?;

        let num_rows = self.r.u16("number of rows")? as usize;
        if num_rows == 0 || num_rows > 256 {
            return Err(self.invalid("number of rows", num_rows as i64));
        }

        let packed_size = self.r.u16("packed pattern data size")? as usize;
        if self.r.remaining() < packed_size {
            return Err(FormatError::UnexpectedEof {
                what: "packed pattern data",
                offset: self.r.offset,
            });
        }
        if header_length > 9 {
            self.r.skip(header_length - 9, "pattern header tail")?;
        }
        let data_end = self.r.offset + packed_size;

        let mut pattern = Pattern { rows: Vec::with_capacity(num_rows) };

        if packed_size == 0 {
            // Trackers store fully empty patterns with no data at all.
            for _ in 0..num_rows {
                pattern.rows.push(Row { notes: alloc::vec![0; self.module.num_channels] });
            }
            return Ok(pattern);
        }

        for _ in 0..num_rows {
            let mut row = Row { notes: Vec::with_capacity(self.module.num_channels) };
            for _ in 0..self.module.num_channels {
                let note = self.parse_note()?;
                row.notes.push(self.intern_note(note)?);
            }
            pattern.rows.push(row);
        }

        if self.r.offset != data_end {
            return Err(FormatError::PatternSizeMismatch { offset: self.r.offset });
        }

        Ok(pattern)
    }

    fn parse_note(&mut self) -> Result<Note, FormatError> {
        let mut note = Note::default();
        let b = self.r.u8("first note byte")?;

        // The MSB selects a compact scheme where a bitmask tells which of
        // the five fields follow; missing fields default to zero.
        let (read_note, read_instrument, read_volume, read_effect, read_param);
        if b & 0x80 != 0 {
            read_note = b & (1 << 0) != 0;
            read_instrument = b & (1 << 1) != 0;
            read_volume = b & (1 << 2) != 0;
            read_effect = b & (1 << 3) != 0;
            read_param = b & (1 << 4) != 0;
        } else {
            // The first byte was the note itself.
            note.note = b;
            read_note = false;
            read_instrument = true;
            read_volume = true;
            read_effect = true;
            read_param = true;
        }

        if read_note {
            note.note = self.r.u8("pattern note")?;
        }
        if read_instrument {
            note.instrument = self.r.u8("pattern instrument")?;
        }
        if read_volume {
            note.volume = self.r.u8("pattern volume")?;
        }
        if read_effect {
            note.effect_type = self.r.u8("effect type")?;
        }
        if read_param {
            note.effect_param = self.r.u8("effect parameter")?;
        }

        Ok(note)
    }

    /// Identical cells share one note-table entry; cell id 0 is the empty
    /// note.
    fn intern_note(&mut self, note: Note) -> Result<u16, FormatError> {
        let key = note.packed();
        if let Some(&id) = self.note_ids.get(&key) {
            return Ok(id);
        }
        if self.module.notes.len() > u16::MAX as usize {
            return Err(self.invalid("note table size", self.module.notes.len() as i64));
        }
        let id = self.module.notes.len() as u16;
        self.module.notes.push(note);
        self.note_ids.insert(key, id);
        Ok(id)
    }

    fn parse_instrument(&mut self) -> Result<Instrument, FormatError> {
        let mut inst = Instrument::default();

        let header_size = self.r.u32("instrument header size")?.wrapping_sub(4) as usize;
        if self.r.remaining() < header_size {
            return Err(self.invalid("instrument header size", header_size as i64));
        }
        let header_end = self.r.offset + header_size;

        inst.name = fixed_string(self.r.bytes(22, "instrument name")?);
        self.r.skip(1, "instrument type")?;

        let num_samples = self.r.u16("number of samples")? as usize;
        if num_samples == 0 {
            if self.r.offset > header_end {
                return Err(self.invalid("instrument header size", header_size as i64));
            }
            self.r.offset = header_end;
            return Ok(inst);
        }

        let sample_header_size = self.r.u32("sample header size")?.wrapping_sub(4) as usize;
        if self.r.remaining() < sample_header_size {
            return Err(self.invalid("sample header size", sample_header_size as i64));
        }
        self.r.skip(96, "keymap assignments")?;

        let mut volume_points = [EnvelopePoint::default(); MAX_ENVELOPE_POINTS];
        for point in &mut volume_points {
            point.frame = self.r.u16("volume envelope point x")?;
            point.value = self.r.u16("volume envelope point y")?;
        }
        let mut panning_points = [EnvelopePoint::default(); MAX_ENVELOPE_POINTS];
        for point in &mut panning_points {
            point.frame = self.r.u16("panning envelope point x")?;
            point.value = self.r.u16("panning envelope point y")?;
        }

        let num_volume_points =
            (self.r.u8("number of volume points")? as usize).min(MAX_ENVELOPE_POINTS);
        let num_panning_points =
            (self.r.u8("number of panning points")? as usize).min(MAX_ENVELOPE_POINTS);
        inst.volume_envelope = volume_points[..num_volume_points].to_vec();
        inst.panning_envelope = panning_points[..num_panning_points].to_vec();

        inst.volume_sustain_point = self.r.u8("volume sustain point")?;
        inst.volume_loop_start_point = self.r.u8("volume loop start point")?;
        inst.volume_loop_end_point = self.r.u8("volume loop end point")?;
        inst.panning_sustain_point = self.r.u8("panning sustain point")?;
        inst.panning_loop_start_point = self.r.u8("panning loop start point")?;
        inst.panning_loop_end_point = self.r.u8("panning loop end point")?;

        inst.volume_flags = EnvelopeFlags(self.r.u8("volume type")?);
        inst.panning_flags = EnvelopeFlags(self.r.u8("panning type")?);

        inst.vibrato_type = self.r.u8("vibrato type")?;
        inst.vibrato_sweep = self.r.u8("vibrato sweep")?;
        inst.vibrato_depth = self.r.u8("vibrato depth")?;
        inst.vibrato_rate = self.r.u8("vibrato rate")?;

        inst.volume_fadeout = self.r.u16("volume fadeout")?;

        if self.r.offset > header_end {
            return Err(self.invalid("instrument header size", header_size as i64));
        }
        self.r.offset = header_end;

        for _ in 0..num_samples {
            let sample = self.parse_sample_header()?;
            inst.samples.push(sample);
        }
        for sample in &mut inst.samples {
            if sample.length == 0 {
                continue;
            }
            sample.data = self.r.bytes(sample.length, "sample data")?.to_vec();
        }

        Ok(inst)
    }

    fn parse_sample_header(&mut self) -> Result<Sample, FormatError> {
        let mut sample = Sample::default();

        let length = self.r.u32("sample length")? as usize;
        if self.r.remaining() < length {
            return Err(FormatError::UnexpectedEof {
                what: "sample data",
                offset: self.r.offset,
            });
        }
        sample.length = length;
        sample.loop_start = self.r.u32("sample loop start")? as usize;
        sample.loop_length = self.r.u32("sample loop length")? as usize;
        sample.volume = self.r.u8("sample volume")?;
        sample.finetune = self.r.u8("sample finetune")? as i8;
        sample.type_flags = self.r.u8("sample type")?;
        sample.panning = self.r.u8("sample panning")?;
        sample.relative_note = self.r.u8("sample relative note")? as i8;

        let encoding = self.r.u8("sample encoding")?;
        sample.encoding = match encoding {
            0x00 => SampleEncoding::DeltaPacked,
            0xAD => SampleEncoding::Adpcm,
            _ => {
                return Err(FormatError::UnknownSampleEncoding {
                    value: encoding,
                    offset: self.r.offset,
                });
            }
        };

        sample.name = fixed_string(self.r.bytes(22, "sample name")?);
        Ok(sample)
    }
}

/// Decode a fixed-size name field: cut at the first NUL, drop what doesn't
/// fit after lossy UTF-8 conversion, trim trailing padding.
fn fixed_string<const N: usize>(bytes: &[u8]) -> ArrayString<N> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let mut out = ArrayString::new();
    for ch in alloc::string::String::from_utf8_lossy(&bytes[..end]).chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_string_cuts_at_nul_and_trims() {
        let s: ArrayString<20> = fixed_string(b"hello world\0garbage!");
        assert_eq!(&s[..], "hello world");
        let s: ArrayString<20> = fixed_string(b"padded              ");
        assert_eq!(&s[..], "padded");
    }

    #[test]
    fn fixed_string_survives_non_utf8() {
        let s: ArrayString<4> = fixed_string(&[0xFF, 0xFE, b'a', 0]);
        assert!(s.len() <= 4);
    }
}
