//! Implements the FFT used for the MDCT.

use num_complex::Complex32;

/// A mixed-radix fast Fourier transform based upon the principle,
/// "Keep It Simple, Stupid."
///
/// This code is in spirit of Mark Borgerding's KISS-FFT, restricted to the
/// radix 2/3/5 factorizations the MDCT sizes need. The transform is not
/// normalized; the MDCT applies its own scaling.
pub(crate) struct KissFft {
    nfft: usize,
    /// Twiddles for the full transform size, exp(-2*pi*i*j/nfft).
    twiddles: Vec<Complex32>,
}

impl KissFft {
    /// Creates a transform of the given size. The size must factor into
    /// powers of 2, 3 and 5.
    pub(crate) fn new(nfft: usize) -> Self {
        use std::f64::consts::PI;

        debug_assert!(supported_size(nfft), "unsupported fft size {}", nfft);

        let twiddles = (0..nfft)
            .map(|j| {
                let phase = -2.0 * PI * j as f64 / nfft as f64;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect();

        Self { nfft, twiddles }
    }

    pub(crate) fn nfft(&self) -> usize {
        self.nfft
    }

    /// Computes the forward transform of `input` into `output`.
    pub(crate) fn forward(&self, input: &[Complex32], output: &mut [Complex32]) {
        debug_assert_eq!(input.len(), self.nfft);
        debug_assert_eq!(output.len(), self.nfft);
        self.work(input, output, self.nfft, 1, false);
    }

    /// Computes the unnormalized inverse transform of `input` into `output`.
    pub(crate) fn inverse(&self, input: &[Complex32], output: &mut [Complex32]) {
        debug_assert_eq!(input.len(), self.nfft);
        debug_assert_eq!(output.len(), self.nfft);
        self.work(input, output, self.nfft, 1, true);
    }

    /// Recursive decimation-in-time step: transforms `n` samples taken from
    /// `input` at the given stride.
    fn work(
        &self,
        input: &[Complex32],
        output: &mut [Complex32],
        n: usize,
        in_stride: usize,
        inverse: bool,
    ) {
        if n == 1 {
            output[0] = input[0];
            return;
        }

        let radix = smallest_factor(n);
        let m = n / radix;

        // Sub-transforms over the decimated sequences.
        (0..radix).for_each(|q| {
            self.work(
                &input[q * in_stride..],
                &mut output[q * m..(q + 1) * m],
                m,
                in_stride * radix,
                inverse,
            );
        });

        // Combine with twiddles: X[k + r*m] = sum_q A_q[k] * W_n^(qk) * W_radix^(qr).
        let twiddle_stride = self.nfft / n;
        let mut scratch = [Complex32::default(); 5];

        for k in 0..m {
            (0..radix).for_each(|q| {
                let tw = self.twiddle(q * k * twiddle_stride, inverse);
                scratch[q] = output[q * m + k] * tw;
            });
            (0..radix).for_each(|r| {
                let mut acc = scratch[0];
                (1..radix).for_each(|q| {
                    let tw = self.twiddle(q * r * m * twiddle_stride % self.nfft, inverse);
                    acc += scratch[q] * tw;
                });
                output[k + r * m] = acc;
            });
        }
    }

    #[inline(always)]
    fn twiddle(&self, index: usize, inverse: bool) -> Complex32 {
        let tw = self.twiddles[index % self.nfft];
        if inverse {
            tw.conj()
        } else {
            tw
        }
    }
}

fn smallest_factor(n: usize) -> usize {
    if n % 2 == 0 {
        2
    } else if n % 3 == 0 {
        3
    } else {
        5
    }
}

fn supported_size(mut n: usize) -> bool {
    for p in [2, 3, 5].iter() {
        while n % p == 0 {
            n /= p;
        }
    }
    n == 1
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;

    fn naive_dft(input: &[Complex32], inverse: bool) -> Vec<Complex32> {
        use std::f64::consts::PI;

        let n = input.len();
        let sign = if inverse { 1.0 } else { -1.0 };
        (0..n)
            .map(|k| {
                let mut acc = num_complex::Complex64::default();
                input.iter().enumerate().for_each(|(j, x)| {
                    let phase = sign * 2.0 * PI * (j * k % n) as f64 / n as f64;
                    let tw = num_complex::Complex64::new(phase.cos(), phase.sin());
                    acc += num_complex::Complex64::new(f64::from(x.re), f64::from(x.im)) * tw;
                });
                Complex32::new(acc.re as f32, acc.im as f32)
            })
            .collect()
    }

    fn random_signal(rng: &mut nanorand::WyRand, n: usize) -> Vec<Complex32> {
        (0..n)
            .map(|_| {
                let re = rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0;
                let im = rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0;
                Complex32::new(re, im)
            })
            .collect()
    }

    #[test]
    fn test_matches_naive_dft() {
        let mut rng = nanorand::WyRand::new_seed(7);

        [4, 6, 30, 60, 120, 240, 480].iter().for_each(|&n| {
            let fft = KissFft::new(n);
            let input = random_signal(&mut rng, n);
            let mut output = vec![Complex32::default(); n];
            fft.forward(&input, &mut output);

            let expected = naive_dft(&input, false);
            output.iter().zip(expected.iter()).for_each(|(got, want)| {
                assert!(
                    (got - want).norm() < 1e-2 * (n as f32).sqrt(),
                    "n = {}: {} != {}",
                    n,
                    got,
                    want
                );
            });
        });
    }

    #[test]
    fn test_forward_inverse_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(11);

        [60, 120, 240, 480].iter().for_each(|&n| {
            let fft = KissFft::new(n);
            let input = random_signal(&mut rng, n);
            let mut freq = vec![Complex32::default(); n];
            let mut back = vec![Complex32::default(); n];
            fft.forward(&input, &mut freq);
            fft.inverse(&freq, &mut back);

            let scale = 1.0 / n as f32;
            back.iter().zip(input.iter()).for_each(|(got, want)| {
                assert!(((got * scale) - want).norm() < 1e-3);
            });
        });
    }
}
