//! Pitch and timing math for the linear frequency table.
//!
//! XM pitch is expressed as a *period*: an inverse-frequency value where
//! smaller means higher pitch. One semitone is 64 period units.

use crate::module::Instrument;

/// Lowest period a portamento can reach (XM_MINPERIOD in MilkyTracker).
pub const MIN_PERIOD: f64 = 50.0;

/// Convert a (fractional) note number to a linear period.
pub fn linear_period(note: f64) -> f64 {
    7680.0 - note * 64.0
}

/// Convert a linear period to a frequency in Hz.
pub fn linear_frequency(period: f64) -> f64 {
    8363.0 * libm::exp2((4608.0 - period) / 768.0)
}

/// The effective note number for an instrument: raw note plus the
/// instrument's relative note and finetune, minus one.
///
/// A missing instrument contributes neither relative note nor finetune.
pub fn real_note(note: f64, inst: Option<&Instrument>) -> f64 {
    let (relative, finetune) = match inst {
        Some(inst) => (inst.relative_note as f64, inst.finetune as f64),
        None => (0.0, 0.0),
    };
    (note + relative + finetune / 128.0) - 1.0
}

/// Output samples per tick and the matching byte count
/// (stereo, 2 bytes per sample).
pub fn samples_per_tick(sample_rate: f64, bpm: f64) -> (f64, usize) {
    let samples = libm::round(sample_rate / (bpm * 0.4));
    (samples, samples as usize * 4)
}

/// Wall-clock duration of one pattern row at the given tempo.
pub fn seconds_per_row(ticks_per_row: i32, bpm: f64) -> f64 {
    ticks_per_row as f64 / (bpm * 0.4)
}

/// Move `v` toward `goal` by at most `step`, never overshooting.
pub fn slide_towards(v: f64, goal: f64, step: f64) -> f64 {
    if v < goal {
        (v + step).min(goal)
    } else if v > goal {
        (v - step).max(goal)
    } else {
        goal
    }
}

/// Vibrato waveform: an inverted sine over a 64-step phase.
pub fn waveform(step: u8) -> f64 {
    -libm::sin(2.0 * core::f64::consts::PI * (step as f64) / 64.0)
}

/// Linear interpolation from `a` to `b`.
pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Write one stereo sample pair as interleaved 16-bit little-endian PCM.
pub fn put_pcm(buf: &mut [u8], left: i16, right: i16) {
    buf[0..2].copy_from_slice(&left.to_le_bytes());
    buf[2..4].copy_from_slice(&right.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tick_geometry() {
        // bpm=120, sample_rate=44100 → 882 samples, 3528 bytes per tick
        let (samples, bytes) = samples_per_tick(44100.0, 120.0);
        assert_eq!(samples, 882.0);
        assert_eq!(bytes, 3528);
    }

    #[test]
    fn default_row_duration() {
        assert_eq!(seconds_per_row(6, 120.0), 0.125);
    }

    #[test]
    fn a4_with_no_offsets_is_8363_hz() {
        // Note 49 with a null instrument: real note 48, period 4608.
        let period = linear_period(real_note(49.0, None));
        assert_eq!(period, 4608.0);
        assert!((linear_frequency(period) - 8363.0).abs() < 1e-9);
    }

    #[test]
    fn octave_up_doubles_frequency() {
        let f1 = linear_frequency(linear_period(48.0));
        let f2 = linear_frequency(linear_period(60.0));
        assert!((f2 / f1 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn smaller_period_is_higher_pitch() {
        assert!(linear_frequency(4000.0) > linear_frequency(4608.0));
    }

    #[test]
    fn slide_towards_does_not_overshoot() {
        assert_eq!(slide_towards(0.0, 1.0, 0.3), 0.3);
        assert_eq!(slide_towards(0.9, 1.0, 0.3), 1.0);
        assert_eq!(slide_towards(1.0, 0.0, 0.4), 0.6);
        assert_eq!(slide_towards(0.1, 0.0, 0.4), 0.0);
        assert_eq!(slide_towards(0.5, 0.5, 0.4), 0.5);
    }

    #[test]
    fn waveform_quarter_points() {
        assert!(waveform(0).abs() < 1e-12);
        assert!((waveform(16) + 1.0).abs() < 1e-12);
        assert!(waveform(32).abs() < 1e-9);
        assert!((waveform(48) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn pcm_is_little_endian_interleaved() {
        let mut buf = [0u8; 4];
        put_pcm(&mut buf, 0x1234, -2);
        assert_eq!(buf, [0x34, 0x12, 0xFE, 0xFF]);
    }
}
