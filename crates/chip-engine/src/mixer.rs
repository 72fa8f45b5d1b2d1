//! The channel mixer: one tick of PCM at a time.

use chip_ir::SampleLoopType;

use crate::channel::RAMP_SAMPLES;
use crate::frequency::{lerp, put_pcm, slide_towards};
use crate::stream::Stream;

/// Per-sample step for the volume ramp. At 44100 Hz a full-scale volume
/// change settles in about 4 ms of ramped samples.
const RAMP_VOLUME_STEP: f64 = 1.0 / 180.0;

impl Stream {
    /// Render exactly one tick (`samples_per_tick` stereo frames) into `b`.
    ///
    /// The first `RAMP_SAMPLES` frames crossfade each channel against the
    /// tail it recorded last tick while the per-side volume slides toward
    /// the scheduler's new target; the remainder is a plain
    /// fetch-multiply-accumulate loop.
    pub(crate) fn read_tick(&mut self, b: &mut [u8]) {
        let n = self.samples_per_tick as usize;
        debug_assert!(b.len() >= n * 4);
        let ramp_len = RAMP_SAMPLES.min(n);
        let tail_start = n - ramp_len;

        for i in 0..n {
            let mut left = 0.0f64;
            let mut right = 0.0f64;

            for k in 0..self.active_channels.len() {
                let j = self.active_channels[k];
                let ch = &mut self.channels[j];
                let Some(ii) = ch.inst else {
                    continue;
                };
                let inst = &self.module.instruments[ii];
                let samples = inst.samples(&self.module.sample_pool);

                let offset = ch.sample_offset as usize;
                if offset >= samples.len() {
                    // A non-looping sample that ran out mid-tick.
                    continue;
                }
                let mut v = samples[offset] as f64;

                if ch.ramp_frame < ramp_len {
                    let t = (ramp_len - ch.ramp_frame) as f64 / ramp_len as f64;
                    v = lerp(v, ch.ramp_samples[ch.ramp_frame], t);
                    left += v * ch.computed_volume[0];
                    right += v * ch.computed_volume[1];
                    ch.computed_volume[0] =
                        slide_towards(ch.computed_volume[0], ch.target_volume[0], RAMP_VOLUME_STEP);
                    ch.computed_volume[1] =
                        slide_towards(ch.computed_volume[1], ch.target_volume[1], RAMP_VOLUME_STEP);
                    ch.ramp_frame += 1;
                } else {
                    left += v * ch.computed_volume[0];
                    right += v * ch.computed_volume[1];
                }

                if i >= tail_start {
                    ch.ramp_samples[i - tail_start] = v;
                }

                match inst.loop_type {
                    SampleLoopType::None => ch.sample_offset += ch.sample_step,
                    SampleLoopType::Forward => {
                        ch.sample_offset += ch.sample_step;
                        while ch.sample_offset >= inst.loop_end {
                            ch.sample_offset -= inst.loop_length;
                        }
                    }
                    _ => {
                        // Ping-pong. The compiler unrolled the loop into a
                        // forward region, but the direction flip is kept for
                        // offsets that land outside it.
                        if ch.reverse {
                            ch.sample_offset -= ch.sample_step;
                            if ch.sample_offset <= inst.loop_start {
                                ch.reverse = false;
                                let wrapped = inst.loop_start as i64
                                    + ch.sample_offset as i64 % inst.loop_length as i64;
                                ch.sample_offset = libm::fabs(wrapped as f64);
                            }
                        } else {
                            ch.sample_offset += ch.sample_step;
                            if ch.sample_offset >= inst.loop_end {
                                ch.reverse = true;
                                ch.sample_offset = (inst.loop_end as i64
                                    - ch.sample_offset as i64 % inst.loop_length as i64)
                                    as f64;
                            }
                        }
                    }
                }
            }

            // Accumulators clip by saturating into the 16-bit range; the
            // 0.25 volume headroom makes that rare in practice.
            put_pcm(&mut b[i * 4..i * 4 + 4], left as i16, right as i16);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::stream::{LoadModuleConfig, Stream};
    use alloc::vec;
    use chip_ir as ir;

    const BYTES_PER_TICK: usize = 3528;

    fn delta_encode(absolute: &[i8]) -> alloc::vec::Vec<u8> {
        let mut out = alloc::vec::Vec::new();
        let mut prev: i8 = 0;
        for &v in absolute {
            out.push(v.wrapping_sub(prev) as u8);
            prev = v;
        }
        out
    }

    fn one_note_module(sample_values: &[i8], type_flags: u8, loop_length: usize) -> ir::Module {
        let data = delta_encode(sample_values);
        let mut m = ir::Module::new();
        m.num_channels = 1;
        m.num_instruments = 1;
        m.instruments.push(ir::Instrument {
            samples: vec![ir::Sample {
                length: data.len(),
                loop_start: 0,
                loop_length,
                volume: 64,
                type_flags,
                panning: 128,
                data,
                ..Default::default()
            }],
            ..Default::default()
        });

        let note_id = m.notes.len() as u16;
        m.notes.push(ir::Note { note: 49, instrument: 1, ..Default::default() });
        let mut pattern = ir::Pattern::default();
        pattern.rows.push(ir::Row { notes: vec![note_id] });
        for _ in 1..64 {
            pattern.rows.push(ir::Row { notes: vec![0] });
        }
        m.patterns.push(pattern);
        m.num_patterns = 1;
        m.pattern_order.push(0);
        m.song_length = 1;
        m
    }

    fn render_ticks(s: &mut Stream, ticks: usize) -> alloc::vec::Vec<i16> {
        let mut buf = vec![0u8; BYTES_PER_TICK];
        let mut out = alloc::vec::Vec::new();
        for _ in 0..ticks {
            assert_eq!(s.read(&mut buf), BYTES_PER_TICK);
            for frame in buf.chunks_exact(2) {
                out.push(i16::from_le_bytes([frame[0], frame[1]]));
            }
        }
        out
    }

    #[test]
    fn looping_square_produces_symmetric_stereo() {
        let m = one_note_module(&[62, 62, -62, -62], 1, 4);
        let mut s = Stream::new();
        s.load_module(&m, LoadModuleConfig::default()).unwrap();
        let pcm = render_ticks(&mut s, 2);

        let mut positive = 0usize;
        let mut negative = 0usize;
        for pair in pcm.chunks_exact(2) {
            // Center panning: both sides carry the same signal.
            assert_eq!(pair[0], pair[1]);
            if pair[0] > 0 {
                positive += 1;
            }
            if pair[0] < 0 {
                negative += 1;
            }
        }
        assert!(positive > 100, "expected positive peaks, got {}", positive);
        assert!(negative > 100, "expected negative peaks, got {}", negative);
    }

    #[test]
    fn volume_ramp_fades_output_in() {
        let m = one_note_module(&[120, 120, 120, 120], 1, 4);
        let mut s = Stream::new();
        s.load_module(&m, LoadModuleConfig::default()).unwrap();
        let pcm = render_ticks(&mut s, 1);

        // Computed volume starts at zero and slides toward the target, so
        // the very first frame is quieter than the steady state.
        let first = pcm[0].unsigned_abs();
        let steady = pcm[pcm.len() / 2].unsigned_abs();
        assert!(first < steady, "first={} steady={}", first, steady);
    }

    #[test]
    fn forward_loop_keeps_offset_inside_loop() {
        let m = one_note_module(&[10, 20, 30, 40], 1, 4);
        let mut s = Stream::new();
        s.load_module(&m, LoadModuleConfig::default()).unwrap();
        render_ticks(&mut s, 4);
        let offset = s.channels[0].sample_offset;
        assert!((0.0..4.0).contains(&offset), "offset {}", offset);
    }

    #[test]
    fn non_looping_sample_goes_silent_at_the_end() {
        let m = one_note_module(&[100, 100, 100, 100], 0, 0);
        let mut s = Stream::new();
        s.load_module(&m, LoadModuleConfig::default()).unwrap();
        // 4 samples at ~0.19 samples/frame are gone within one tick.
        render_ticks(&mut s, 1);
        let pcm = render_ticks(&mut s, 1);
        assert!(pcm.iter().all(|&v| v == 0), "expected silence after sample end");
        assert!(s.channels[0].sample_offset >= 4.0);
    }

    #[test]
    fn ping_pong_offset_stays_inside_unrolled_loop() {
        let m = one_note_module(&[1, 2, 3, 4, 5], 2, 5);
        let mut s = Stream::new();
        s.load_module(&m, LoadModuleConfig::default()).unwrap();
        render_ticks(&mut s, 8);
        // Unrolled region spans 8 samples.
        let offset = s.channels[0].sample_offset;
        assert!((0.0..=8.0).contains(&offset), "offset {}", offset);
    }
}
