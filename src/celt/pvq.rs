//! Implements the Pyramid Vector Quantizer used for the band shapes.
//!
//! A shape is a vector of `n` signed integers whose absolute values sum to
//! `k`. The codebook of all such vectors is enumerated combinatorially and a
//! single index into it is range coded.

use crate::encoder_error::EncoderError;
use crate::range_coder::{RangeDecoder, RangeEncoder};

/// Combination counts V(n, k): the number of n-dimensional vectors of pulses
/// summing to k in absolute value.
///
/// Satisfies `V(n, k) = V(n-1, k) + V(n, k-1) + V(n-1, k-1)` with
/// `V(n, 0) = 1` and `V(0, k) = 0` for `k > 0`.
pub(crate) struct PulseTable {
    rows: Vec<Vec<u64>>,
}

impl PulseTable {
    pub(crate) fn new(n: usize, k: usize) -> Self {
        let mut rows: Vec<Vec<u64>> = Vec::with_capacity(n + 1);
        (0..=n).for_each(|dim| {
            let mut row = vec![0_u64; k + 1];
            row[0] = 1;
            (1..=k).for_each(|pulses| {
                row[pulses] = if dim == 0 {
                    0
                } else {
                    let prev: &Vec<u64> = &rows[dim - 1];
                    prev[pulses]
                        .saturating_add(row[pulses - 1])
                        .saturating_add(prev[pulses - 1])
                };
            });
            rows.push(row);
        });

        Self { rows }
    }

    #[inline(always)]
    pub(crate) fn count(&self, n: usize, k: usize) -> u64 {
        self.rows[n][k]
    }
}

/// The size of the codebook for `n` dimensions and `k` pulses.
pub(crate) fn codebook_size(n: usize, k: usize) -> u64 {
    PulseTable::new(n, k).count(n, k)
}

/// The number of bits (in 1/8th units) needed to code a shape of `n`
/// dimensions and `k` pulses, rounded up to whole bits.
pub(crate) fn pulse_bits(table: &PulseTable, n: usize, k: usize) -> i32 {
    let size = table.count(n, k);
    (64 - (size - 1).leading_zeros() as i32) << 3
}

/// The largest pulse count whose codebook both fits the range coder's 32-bit
/// integer coding and stays within the given budget of 1/8th bits.
pub(crate) fn pulses_for_bits(n: usize, bits: i32, max_k: usize) -> usize {
    let table = PulseTable::new(n, max_k);
    let mut best = 0;
    (1..=max_k).for_each(|k| {
        let size = table.count(n, k);
        if size <= u64::from(u32::MAX) && pulse_bits(&table, n, k) <= bits {
            best = k;
        }
    });
    best
}

/// Ranks a pulse vector into its codebook index.
///
/// The enumeration fixes component order and, per component, the value order
/// `0, +1, -1, +2, -2, ...`; the rank counts all vectors that sort before the
/// given one.
fn rank_pulses(table: &PulseTable, y: &[i32], k: usize) -> u64 {
    let n = y.len();
    let mut rank = 0_u64;
    let mut left = k;

    (0..n).for_each(|j| {
        let v = y[j];
        let rest = n - 1 - j;

        // Vectors whose j-th component sorts before v.
        let mut w = 0_usize;
        while w < v.unsigned_abs() as usize {
            let count = table.count(rest, left - w);
            rank += if w == 0 { count } else { 2 * count };
            w += 1;
        }
        if v < 0 {
            rank += table.count(rest, left - w);
        }

        left -= v.unsigned_abs() as usize;
    });

    rank
}

/// Reconstructs the pulse vector from its codebook index.
fn unrank_pulses(table: &PulseTable, mut rank: u64, n: usize, k: usize, y: &mut [i32]) {
    let mut left = k;

    (0..n).for_each(|j| {
        let rest = n - 1 - j;
        let mut value: i32 = 0;

        let mut w = 0_usize;
        loop {
            let count = table.count(rest, left - w);
            let span = if w == 0 { count } else { 2 * count };
            if rank < span {
                value = if w == 0 {
                    0
                } else if rank < count {
                    w as i32
                } else {
                    rank -= count;
                    -(w as i32)
                };
                break;
            }
            rank -= span;
            w += 1;
        }

        y[j] = value;
        left -= value.unsigned_abs() as usize;
    });

    debug_assert_eq!(left, 0);
}

/// Encodes a pulse vector with `k` pulses.
pub(crate) fn encode_pulses(
    enc: &mut RangeEncoder<'_>,
    y: &[i32],
    k: usize,
) -> Result<(), EncoderError> {
    let n = y.len();
    let table = PulseTable::new(n, k);
    let ft = table.count(n, k);
    debug_assert!(ft <= u64::from(u32::MAX));

    let rank = rank_pulses(&table, y, k);
    enc.encode_uint(rank as u32, ft as u32)
}

/// Decodes a pulse vector with `k` pulses into `y`.
pub(crate) fn decode_pulses(dec: &mut RangeDecoder<'_>, y: &mut [i32], k: usize) {
    let n = y.len();
    let table = PulseTable::new(n, k);
    let ft = table.count(n, k);
    debug_assert!(ft <= u64::from(u32::MAX));

    let rank = dec.decode_uint(ft as u32);
    unrank_pulses(&table, u64::from(rank), n, k, y);
}

/// Finds the pulse vector of `k` pulses closest in direction to `x`.
///
/// Works on magnitudes: signs are extracted first, the search runs in the
/// non-negative orthant, and the signs are folded back into the result.
pub(crate) fn pvq_search(x: &[f32], k: usize, y: &mut [i32]) {
    let n = x.len();
    debug_assert_eq!(y.len(), n);

    let signs: Vec<f32> = x.iter().map(|&v| if v < 0.0 { -1.0 } else { 1.0 }).collect();
    let abs_x: Vec<f32> = x.iter().map(|v| v.abs()).collect();
    let sum: f32 = abs_x.iter().sum();

    y.iter_mut().for_each(|v| *v = 0);
    let mut placed = 0_usize;

    // Projection pre-fill to within one pulse per dimension.
    if sum > 1e-9 && k > 1 {
        let scale = (k - 1) as f32 / sum;
        abs_x.iter().enumerate().for_each(|(j, &v)| {
            let pulses = (v * scale).floor() as i32;
            y[j] = pulses;
            placed += pulses as usize;
        });
    }

    let mut ryy: f32 = y.iter().map(|&v| (v * v) as f32).sum();
    let mut rxy: f32 = y
        .iter()
        .zip(abs_x.iter())
        .map(|(&v, &xv)| v as f32 * xv)
        .sum();

    // Greedy refinement: each pulse goes where it helps the correlation most.
    while placed < k {
        let mut best = 0_usize;
        let mut best_num = -1.0_f32;
        let mut best_den = 1.0_f32;

        (0..n).for_each(|j| {
            let num = rxy + abs_x[j];
            let num = num * num;
            let den = ryy + 2.0 * y[j] as f32 + 1.0;
            if num * best_den > best_num * den {
                best_num = num;
                best_den = den;
                best = j;
            }
        });

        rxy += abs_x[best];
        ryy += 2.0 * y[best] as f32 + 1.0;
        y[best] += 1;
        placed += 1;
    }

    y.iter_mut()
        .zip(signs.iter())
        .for_each(|(v, &s)| *v = (*v as f32 * s) as i32);
}

/// Normalizes a decoded pulse vector to the unit sphere.
pub(crate) fn normalize_pulses(y: &[i32], x: &mut [f32]) {
    let energy: f32 = y.iter().map(|&v| (v * v) as f32).sum();
    let gain = if energy > 0.0 {
        1.0 / energy.sqrt()
    } else {
        0.0
    };
    x.iter_mut()
        .zip(y.iter())
        .for_each(|(out, &v)| *out = v as f32 * gain);
}

const SPREAD_FACTOR: [usize; 3] = [15, 10, 5];

/// Applies (or reverses) the spreading rotation that decorrelates sparse
/// shapes before quantization.
///
/// `dir < 0` is the analysis direction used by the encoder; `dir > 0` is its
/// exact inverse, applied by both sides after reconstructing the shape.
pub(crate) fn exp_rotation(x: &mut [f32], dir: i32, stride: usize, k: usize, spread: usize) {
    let len = x.len();
    if 2 * k >= len || spread == 0 {
        return;
    }

    let factor = SPREAD_FACTOR[spread - 1];
    let gain = len as f32 / (len + factor * k) as f32;
    let theta = 0.5 * gain * gain * std::f32::consts::FRAC_PI_2;
    let c = theta.cos();
    let s = theta.sin();

    let mut stride2 = 0_usize;
    if len >= 8 * stride {
        // Larger blocks need two rotation passes to spread across the block.
        stride2 = 1;
        while (stride2 * stride2 + stride2) * stride + (stride >> 2) < len {
            stride2 += 1;
        }
    }

    let block = len / stride;
    (0..stride).for_each(|i| {
        let slice = &mut x[i * block..(i + 1) * block];
        if dir < 0 {
            if stride2 > 0 {
                rotation_pass(slice, stride2, c, s, true);
            }
            rotation_pass(slice, 1, c, s, true);
        } else {
            rotation_pass(slice, 1, c, s, false);
            if stride2 > 0 {
                rotation_pass(slice, stride2, c, s, false);
            }
        }
    });
}

/// One sequence of overlapping Givens rotations with the given stride.
/// Running it forward and then backward restores the input.
fn rotation_pass(x: &mut [f32], stride: usize, c: f32, s: f32, forward: bool) {
    let len = x.len();
    if len <= stride {
        return;
    }

    if forward {
        (0..len - stride).for_each(|i| {
            let x1 = x[i];
            let x2 = x[i + stride];
            x[i + stride] = c * x2 + s * x1;
            x[i] = c * x1 - s * x2;
        });
        if len >= 2 * stride + 1 {
            (0..=len - 2 * stride - 1).rev().for_each(|i| {
                let x1 = x[i];
                let x2 = x[i + stride];
                x[i + stride] = c * x2 + s * x1;
                x[i] = c * x1 - s * x2;
            });
        }
    } else {
        if len >= 2 * stride + 1 {
            (0..=len - 2 * stride - 1).for_each(|i| {
                let x1 = x[i];
                let x2 = x[i + stride];
                x[i + stride] = c * x2 - s * x1;
                x[i] = c * x1 + s * x2;
            });
        }
        (0..len - stride).rev().for_each(|i| {
            let x1 = x[i];
            let x2 = x[i + stride];
            x[i + stride] = c * x2 - s * x1;
            x[i] = c * x1 + s * x2;
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;
    use crate::range_coder::{RangeDecoder, RangeEncoder};

    #[test]
    fn test_codebook_sizes() {
        // V(n, 1) = 2n, V(1, k) = 2 and a couple of closed-form checks.
        (1..32).for_each(|n| assert_eq!(codebook_size(n, 1), 2 * n as u64));
        (1..32).for_each(|k| assert_eq!(codebook_size(1, k), 2));
        assert_eq!(codebook_size(2, 2), 8);
        assert_eq!(codebook_size(3, 2), 18);
        assert_eq!(codebook_size(4, 3), 104);
    }

    #[test]
    fn test_rank_unrank_exhaustive_small() {
        let n = 4;
        let k = 3;
        let table = PulseTable::new(n, k);
        let size = table.count(n, k);

        let mut seen = std::collections::HashSet::new();
        let mut y = vec![0_i32; n];
        (0..size).for_each(|rank| {
            unrank_pulses(&table, rank, n, k, &mut y);
            let total: u32 = y.iter().map(|v| v.unsigned_abs()).sum();
            assert_eq!(total as usize, k);
            assert_eq!(rank_pulses(&table, &y, k), rank);
            assert!(seen.insert(y.clone()), "duplicate vector {:?}", y);
        });
        assert_eq!(seen.len() as u64, size);
    }

    #[test]
    fn test_pulse_round_trip_through_range_coder() {
        let mut rng = nanorand::WyRand::new_seed(17);
        let mut buffer = vec![0_u8; 1024];

        for _ in 0..200 {
            let n = rng.generate_range::<usize>(2, 24);
            let k = rng.generate_range::<usize>(1, 12);

            // Random direction, quantized to k pulses.
            let x: Vec<f32> = (0..n)
                .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0)
                .collect();
            let mut y = vec![0_i32; n];
            pvq_search(&x, k, &mut y);
            let total: u32 = y.iter().map(|v| v.unsigned_abs()).sum();
            assert_eq!(total as usize, k);

            let mut enc = RangeEncoder::new(&mut buffer);
            encode_pulses(&mut enc, &y, k).unwrap();
            enc.done().unwrap();
            drop(enc);

            let mut dec = RangeDecoder::new(&buffer);
            let mut decoded = vec![0_i32; n];
            decode_pulses(&mut dec, &mut decoded, k);
            assert_eq!(decoded, y);
        }
    }

    #[test]
    fn test_search_prefers_dominant_direction() {
        let x = [0.9_f32, 0.1, -0.05, 0.02];
        let mut y = [0_i32; 4];
        pvq_search(&x, 4, &mut y);
        assert!(y[0] >= 3, "expected most pulses on the dominant axis: {:?}", y);
    }

    #[test]
    fn test_exp_rotation_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(23);

        for &(len, k, spread) in [(16_usize, 2_usize, 2_usize), (32, 3, 1), (64, 4, 3)].iter() {
            let original: Vec<f32> = (0..len)
                .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0)
                .collect();
            let mut x = original.clone();

            exp_rotation(&mut x, -1, 1, k, spread);
            exp_rotation(&mut x, 1, 1, k, spread);

            x.iter().zip(original.iter()).for_each(|(got, want)| {
                assert!((got - want).abs() < 1e-4, "{} != {}", got, want);
            });
        }
    }

    #[test]
    fn test_normalize_produces_unit_vector() {
        let y = [3_i32, -2, 0, 1];
        let mut x = [0.0_f32; 4];
        normalize_pulses(&y, &mut x);
        let norm: f32 = x.iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
