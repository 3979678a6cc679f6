//! Implements the fixed-rate polyphase resampler of the speech layer.
//!
//! The resampler converts between 48 kHz and the SILK internal rates of
//! 8, 12 and 16 kHz (plus the 24 kHz output rate of the decoder API), which
//! reduces every conversion to an integer factor of 2, 3, 4 or 6. Each
//! factor has one linear-phase FIR bank in Q15; decimation filters then
//! drops samples, interpolation zero-stuffs and scales. The filters carry
//! their history across calls, so for identical input and initial state the
//! output is bit-exact.

use crate::encoder_error::EncoderError;

/// Q15 anti-aliasing filter for a rate factor of 2.
pub(crate) const FIR_RATIO_2: [i16; 24] = [
    0, 5, 25, -47, -185, 92, 709, 96, -1975, -1316,
    5534, 13447, 13445, 5534, -1316, -1975, 96, 709, 92, -185,
    -47, 25, 5, 0,
];

/// Q15 anti-aliasing filter for a rate factor of 3.
pub(crate) const FIR_RATIO_3: [i16; 36] = [
    0, 0, 7, 18, 7, -53, -125, -91, 137, 440,
    452, -141, -1122, -1574, -396, 2716, 6668, 9441, 9441, 6668,
    2716, -396, -1574, -1122, -141, 452, 440, 137, -91, -125,
    -53, 7, 18, 7, 0, 0,
];

/// Q15 anti-aliasing filter for a rate factor of 4.
pub(crate) const FIR_RATIO_4: [i16; 48] = [
    0, 0, 2, 7, 14, 13, -8, -50, -92, -96,
    -21, 135, 312, 386, 231, -193, -758, -1163, -1028, -78,
    1686, 3909, 5969, 7208, 7206, 5969, 3909, 1686, -78, -1028,
    -1163, -758, -193, 231, 386, 312, 135, -21, -96, -92,
    -50, -8, 13, 14, 7, 2, 0, 0,
];

/// Q15 anti-aliasing filter for a rate factor of 6.
pub(crate) const FIR_RATIO_6: [i16; 72] = [
    0, 0, 0, 1, 3, 6, 10, 11, 8, -2,
    -19, -40, -59, -70, -61, -27, 33, 113, 193, 250,
    255, 186, 33, -190, -446, -673, -795, -738, -443, 110,
    899, 1852, 2856, 3778, 4484, 4867, 4865, 4484, 3778, 2856,
    1852, 899, 110, -443, -738, -795, -673, -446, -190, 33,
    186, 255, 250, 193, 113, 33, -27, -61, -70, -59,
    -40, -19, -2, 8, 11, 10, 6, 3, 1, 0,
    0, 0,
];

/// Direction of a fixed-factor conversion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Passthrough,
    /// Drop `factor - 1` of every `factor` samples after filtering.
    Down(usize),
    /// Insert `factor - 1` zeros between samples before filtering.
    Up(usize),
}

/// A deterministic integer resampler between two of the fixed Opus rates.
#[derive(Clone, Debug)]
pub(crate) struct Resampler {
    mode: Mode,
    taps: &'static [i16],
    /// FIR state: the last `taps.len() - 1` filter inputs.
    history: Vec<i32>,
    /// Decimation phase carried across calls.
    phase: usize,
}

impl Resampler {
    pub(crate) fn new(in_rate: u32, out_rate: u32) -> Result<Self, EncoderError> {
        let mode = if in_rate == out_rate {
            Mode::Passthrough
        } else if in_rate > out_rate && in_rate % out_rate == 0 {
            Mode::Down((in_rate / out_rate) as usize)
        } else if out_rate > in_rate && out_rate % in_rate == 0 {
            Mode::Up((out_rate / in_rate) as usize)
        } else {
            return Err(EncoderError::BadArguments(
                "unsupported resampling rate pair",
            ));
        };

        let taps: &'static [i16] = match mode {
            Mode::Passthrough => &[],
            Mode::Down(2) | Mode::Up(2) => &FIR_RATIO_2,
            Mode::Down(3) | Mode::Up(3) => &FIR_RATIO_3,
            Mode::Down(4) | Mode::Up(4) => &FIR_RATIO_4,
            Mode::Down(6) | Mode::Up(6) => &FIR_RATIO_6,
            _ => {
                return Err(EncoderError::BadArguments(
                    "unsupported resampling factor",
                ))
            }
        };

        let history = vec![0; taps.len()];
        Ok(Self {
            mode,
            taps,
            history,
            phase: 0,
        })
    }

    pub(crate) fn reset(&mut self) {
        self.history.iter_mut().for_each(|v| *v = 0);
        self.phase = 0;
    }

    /// Resamples `input` into `output`, returning the number of samples
    /// produced. The output length is `input.len() * out_rate / in_rate`,
    /// plus or minus the decimation phase carry.
    pub(crate) fn process(&mut self, input: &[i16], output: &mut [i16]) -> usize {
        match self.mode {
            Mode::Passthrough => {
                output[..input.len()].copy_from_slice(input);
                input.len()
            }
            Mode::Down(factor) => self.run_down(input, output, factor),
            Mode::Up(factor) => self.run_up(input, output, factor),
        }
    }

    fn run_down(&mut self, input: &[i16], output: &mut [i16], factor: usize) -> usize {
        let mut produced = 0;
        for &sample in input {
            self.push(i32::from(sample));
            if self.phase == 0 {
                output[produced] = self.fir_out(1);
                produced += 1;
            }
            self.phase = (self.phase + 1) % factor;
        }
        produced
    }

    fn run_up(&mut self, input: &[i16], output: &mut [i16], factor: usize) -> usize {
        let mut produced = 0;
        for &sample in input {
            self.push(i32::from(sample));
            output[produced] = self.fir_out(factor as i32);
            produced += 1;
            for _ in 1..factor {
                self.push(0);
                output[produced] = self.fir_out(factor as i32);
                produced += 1;
            }
        }
        produced
    }

    #[inline(always)]
    fn push(&mut self, sample: i32) {
        self.history.rotate_left(1);
        let len = self.history.len();
        self.history[len - 1] = sample;
    }

    /// Filter output over the newest `taps.len()` inputs, with unity gain
    /// scaled by `gain` to compensate zero stuffing.
    fn fir_out(&self, gain: i32) -> i16 {
        let len = self.history.len();
        let mut acc: i64 = 0;
        self.taps.iter().enumerate().for_each(|(k, &h)| {
            let x = self.history[len - 1 - k];
            acc += i64::from(h) * i64::from(x);
        });
        let scaled = (acc * i64::from(gain) + (1 << 14)) >> 15;
        scaled.max(i64::from(i16::MIN)).min(i64::from(i16::MAX)) as i16
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sine(rate: f64, freq: f64, len: usize, amp: f64) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / rate;
                (amp * (2.0 * std::f64::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn test_sample_counts() {
        let mut down = Resampler::new(48000, 16000).unwrap();
        let input = vec![0_i16; 960];
        let mut output = vec![0_i16; 960];
        assert_eq!(down.process(&input, &mut output), 320);

        let mut up = Resampler::new(16000, 48000).unwrap();
        let input = vec![0_i16; 320];
        let mut output = vec![0_i16; 960];
        assert_eq!(up.process(&input, &mut output), 960);
    }

    #[test]
    fn test_rejects_non_integer_ratio() {
        assert!(Resampler::new(12000, 16000).is_err());
        assert!(Resampler::new(44100, 48000).is_err());
    }

    #[test]
    fn test_deterministic() {
        let input = sine(48000.0, 440.0, 4800, 8192.0);

        let mut a = Resampler::new(48000, 8000).unwrap();
        let mut b = Resampler::new(48000, 8000).unwrap();
        let mut out_a = vec![0_i16; 800];
        let mut out_b = vec![0_i16; 800];

        for chunk in input.chunks(960) {
            let n_a = a.process(chunk, &mut out_a);
            let n_b = b.process(chunk, &mut out_b);
            assert_eq!(n_a, n_b);
            assert_eq!(out_a[..n_a], out_b[..n_b]);
        }
    }

    #[test]
    fn test_tone_survives_round_trip() {
        // 440 Hz is far below every cutoff; after down + up the tone must
        // come back at roughly the same amplitude.
        let input = sine(48000.0, 440.0, 9600, 8192.0);
        let mut down = Resampler::new(48000, 16000).unwrap();
        let mut up = Resampler::new(16000, 48000).unwrap();

        let mut mid = vec![0_i16; 3200];
        let n_mid = down.process(&input, &mut mid);
        let mut back = vec![0_i16; 9600];
        let n_back = up.process(&mid[..n_mid], &mut back);
        assert_eq!(n_back, 9600);

        // Skip the filter warm-up, compare RMS.
        let rms = |x: &[i16]| {
            (x.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>() / x.len() as f64).sqrt()
        };
        let rms_in = rms(&input[2000..8000]);
        let rms_out = rms(&back[2000..8000]);
        let ratio = rms_out / rms_in;
        assert!(
            ratio > 0.8 && ratio < 1.2,
            "rms ratio {} out of range",
            ratio
        );
    }

    #[test]
    fn test_passthrough() {
        let mut r = Resampler::new(48000, 48000).unwrap();
        let input = sine(48000.0, 1000.0, 480, 1000.0);
        let mut output = vec![0_i16; 480];
        assert_eq!(r.process(&input, &mut output), 480);
        assert_eq!(input, output);
    }
}
