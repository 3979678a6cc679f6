//! Implements the modified discrete cosine transform.

use num_complex::Complex32;

use crate::celt::kiss_fft::KissFft;

/// This is an MDCT implementation that uses an N/2 complex FFT to do most of
/// the work. The algorithm is similar to (and inspired from) Fabrice
/// Bellard's MDCT implementation in FFMPEG, but has differences in signs,
/// ordering and scaling in many places.
///
/// The transform takes 2N time samples to N spectral coefficients:
///
/// `y[k] = sum_n x[n] * cos(pi/N * (n + 1/2 + N/2) * (k + 1/2))`
///
/// The input is folded into an N-point DCT-IV, which in turn is computed with
/// pre/post twiddles around the N/2-point FFT.
pub(crate) struct Mdct {
    /// Number of spectral coefficients; the time-domain span is 2n.
    n: usize,
    fft: KissFft,
    /// exp(-i*pi*m/n) for the DCT-IV pre-twiddle.
    pre_twiddle: Vec<Complex32>,
    /// exp(-i*pi*(2r + 1/2)/(2n)) for the DCT-IV post-twiddle.
    post_twiddle: Vec<Complex32>,
}

impl Mdct {
    pub(crate) fn new(n: usize) -> Self {
        use std::f64::consts::PI;

        debug_assert!(n % 4 == 0);
        let m = n / 2;

        let pre_twiddle = (0..m)
            .map(|i| {
                let phase = -PI * i as f64 / n as f64;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect();
        let post_twiddle = (0..m)
            .map(|r| {
                let phase = -PI * (2.0 * r as f64 + 0.5) / (2.0 * n as f64);
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect();

        Self {
            n,
            fft: KissFft::new(m),
            pre_twiddle,
            post_twiddle,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.n
    }

    /// DCT-IV of `input` into `output`, both of length n.
    fn dct4(&self, input: &[f32], output: &mut [f32]) {
        let n = self.n;
        let m = n / 2;

        let buf: Vec<Complex32> = (0..m)
            .map(|i| Complex32::new(input[2 * i], input[n - 1 - 2 * i]) * self.pre_twiddle[i])
            .collect();
        let mut freq = vec![Complex32::default(); m];
        self.fft.forward(&buf, &mut freq);

        (0..m).for_each(|r| {
            let t = freq[r] * self.post_twiddle[r];
            output[2 * r] = t.re;
            output[n - 1 - 2 * r] = -t.im;
        });
    }

    /// Forward MDCT of a 2n-sample (windowed) input into n coefficients.
    pub(crate) fn forward(&self, input: &[f32], output: &mut [f32]) {
        let n = self.n;
        debug_assert_eq!(input.len(), 2 * n);
        debug_assert_eq!(output.len(), n);

        // Fold the 2n samples down to the n-point DCT-IV input.
        let mut folded = vec![0.0_f32; n];
        (0..n / 2).for_each(|i| {
            folded[i] = -input[3 * n / 2 - 1 - i] - input[3 * n / 2 + i];
        });
        (n / 2..n).for_each(|i| {
            folded[i] = input[i - n / 2] - input[3 * n / 2 - 1 - i];
        });

        self.dct4(&folded, output);
    }

    /// Inverse MDCT of n coefficients into 2n (unwindowed) time samples,
    /// including the 2/n synthesis scale.
    pub(crate) fn inverse(&self, input: &[f32], output: &mut [f32]) {
        let n = self.n;
        debug_assert_eq!(input.len(), n);
        debug_assert_eq!(output.len(), 2 * n);

        let mut spread = vec![0.0_f32; n];
        self.dct4(input, &mut spread);

        let scale = 2.0 / n as f32;
        (0..n / 2).for_each(|i| {
            output[i] = scale * spread[n / 2 + i];
        });
        (n / 2..3 * n / 2).for_each(|i| {
            output[i] = -scale * spread[3 * n / 2 - 1 - i];
        });
        (3 * n / 2..2 * n).for_each(|i| {
            output[i] = -scale * spread[i - 3 * n / 2];
        });
    }
}

/// Applies the analysis window to `input` (n + overlap samples: the previous
/// frame's tail followed by the current frame) and runs the forward MDCT.
///
/// The conceptual 2n-sample window is zero outside the input span, rises and
/// falls over `window` at its edges and is flat in between.
pub(crate) fn forward_windowed(mdct: &Mdct, window: &[f32], input: &[f32], output: &mut [f32]) {
    let n = mdct.len();
    let overlap = window.len();
    debug_assert_eq!(input.len(), n + overlap);

    let z = (n - overlap) / 2;
    let mut padded = vec![0.0_f32; 2 * n];
    input.iter().enumerate().for_each(|(i, &x)| {
        padded[z + i] = x * support_gain(window, n, i);
    });

    mdct.forward(&padded, output);
}

/// Runs the inverse MDCT and applies the synthesis window, producing the
/// n + overlap samples of the window support. The caller overlap-adds the
/// first `overlap` samples with the previous frame's tail.
pub(crate) fn inverse_windowed(mdct: &Mdct, window: &[f32], input: &[f32], output: &mut [f32]) {
    let n = mdct.len();
    let overlap = window.len();
    debug_assert_eq!(output.len(), n + overlap);

    let z = (n - overlap) / 2;
    let mut time = vec![0.0_f32; 2 * n];
    mdct.inverse(input, &mut time);

    output.iter_mut().enumerate().for_each(|(i, out)| {
        *out = time[z + i] * support_gain(window, n, i);
    });
}

/// The window gain at position `i` of the n + overlap sample support region.
#[inline(always)]
fn support_gain(window: &[f32], n: usize, i: usize) -> f32 {
    let overlap = window.len();
    if i < overlap {
        window[i]
    } else if i < n {
        1.0
    } else {
        window[n + overlap - 1 - i]
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;

    fn naive_mdct(input: &[f32]) -> Vec<f32> {
        use std::f64::consts::PI;

        let n = input.len() / 2;
        (0..n)
            .map(|k| {
                let mut acc = 0.0_f64;
                input.iter().enumerate().for_each(|(j, &x)| {
                    let phase =
                        PI / n as f64 * (j as f64 + 0.5 + n as f64 / 2.0) * (k as f64 + 0.5);
                    acc += f64::from(x) * phase.cos();
                });
                acc as f32
            })
            .collect()
    }

    fn random_pcm(rng: &mut nanorand::WyRand, len: usize) -> Vec<f32> {
        (0..len)
            .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0)
            .collect()
    }

    #[test]
    fn test_forward_matches_naive() {
        let mut rng = nanorand::WyRand::new_seed(3);

        [120_usize, 240].iter().for_each(|&n| {
            let mdct = Mdct::new(n);
            let input = random_pcm(&mut rng, 2 * n);
            let mut output = vec![0.0_f32; n];
            mdct.forward(&input, &mut output);

            let expected = naive_mdct(&input);
            output.iter().zip(expected.iter()).for_each(|(got, want)| {
                assert!(
                    (got - want).abs() < 1e-2,
                    "n = {}: {} != {}",
                    n,
                    got,
                    want
                );
            });
        });
    }

    #[test]
    fn test_streaming_reconstruction() {
        let mut rng = nanorand::WyRand::new_seed(5);

        let n = 240;
        let overlap = 120;
        let mdct = Mdct::new(n);
        let window = crate::celt::vorbis_window(overlap);

        let frames = 8;
        let signal = random_pcm(&mut rng, frames * n + overlap);

        let mut reconstructed = vec![0.0_f32; frames * n + overlap];
        (0..frames).for_each(|t| {
            let mut coeffs = vec![0.0_f32; n];
            forward_windowed(&mdct, &window, &signal[t * n..t * n + n + overlap], &mut coeffs);

            let mut synth = vec![0.0_f32; n + overlap];
            inverse_windowed(&mdct, &window, &coeffs, &mut synth);
            synth
                .iter()
                .enumerate()
                .for_each(|(i, &x)| reconstructed[t * n + i] += x);
        });

        // The interior (away from the first rise and last fall, which lack
        // their overlap partners) must reconstruct the signal.
        (overlap..(frames - 1) * n).for_each(|i| {
            assert!(
                (reconstructed[i] - signal[i]).abs() < 1e-3,
                "sample {}: {} != {}",
                i,
                reconstructed[i],
                signal[i]
            );
        });
    }
}
