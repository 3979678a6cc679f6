//! Implements the band processing of the transform coder: energy
//! quantization, shape coding with recursive theta splits, stereo coupling,
//! time-frequency resolution switching and anti-collapse.

use crate::celt::pvq;
use crate::celt::{
    EBANDS, E_MEANS, E_PROB_MODEL, BETA_COEF, BETA_INTRA, LOG_N, MAX_BANDS, PRED_COEF,
    SMALL_ENERGY_ICDF, TF_SELECT_TABLE,
};
use crate::encoder_error::EncoderError;
use crate::math::{bitexact_cos, bitexact_log2tan, fast_exp2, fast_log2};
use crate::range_coder::{RangeDecoder, RangeEncoder, Tell, BITRES};

/// Largest pulse count considered per partition.
const MAX_PULSES: usize = 128;
/// Fine energy quantizers never exceed this depth.
const MAX_FINE_BITS: i32 = 8;

const QTHETA_OFFSET: i32 = 4;
const QTHETA_OFFSET_TWOPHASE: i32 = 16;

/// The linear congruential generator used for noise filling and
/// anti-collapse. Must match on any platform.
#[inline(always)]
pub(crate) fn lcg_rand(seed: u32) -> u32 {
    seed.wrapping_mul(1664525).wrapping_add(1013904223)
}

/// Computes the per-band RMS energies of the spectrum.
pub(crate) fn compute_band_energies(
    x: &[f32],
    end: usize,
    lm: usize,
    band_e: &mut [f32; MAX_BANDS],
) {
    (0..end).for_each(|i| {
        let lo = EBANDS[i] << lm;
        let hi = EBANDS[i + 1] << lm;
        let sum: f32 = x[lo..hi].iter().map(|v| v * v).sum();
        band_e[i] = (1e-27 + sum).sqrt();
    });
}

/// Converts band energies to the log domain, removing the static means.
pub(crate) fn amp_to_log(band_e: &[f32; MAX_BANDS], end: usize, log_e: &mut [f32; MAX_BANDS]) {
    (0..end).for_each(|i| {
        log_e[i] = fast_log2(band_e[i]) - E_MEANS[i];
    });
}

/// Normalizes each band of the spectrum to unit energy.
pub(crate) fn normalise_bands(
    freq: &[f32],
    x: &mut [f32],
    band_e: &[f32; MAX_BANDS],
    end: usize,
    lm: usize,
) {
    (0..end).for_each(|i| {
        let lo = EBANDS[i] << lm;
        let hi = EBANDS[i + 1] << lm;
        let g = 1.0 / (1e-27 + band_e[i]);
        (lo..hi).for_each(|j| x[j] = freq[j] * g);
    });
}

/// Scales the normalized shapes back to their coded energies.
pub(crate) fn denormalise_bands(
    x: &[f32],
    freq: &mut [f32],
    log_e: &[f32; MAX_BANDS],
    start: usize,
    end: usize,
    lm: usize,
) {
    freq[..EBANDS[start] << lm].iter_mut().for_each(|v| *v = 0.0);
    (start..end).for_each(|i| {
        let lo = EBANDS[i] << lm;
        let hi = EBANDS[i + 1] << lm;
        let g = fast_exp2(f32::min(32.0, log_e[i] + E_MEANS[i]));
        (lo..hi).for_each(|j| freq[j] = x[j] * g);
    });
    freq[EBANDS[end] << lm..].iter_mut().for_each(|v| *v = 0.0);
}

/// Quantizes the coarse band energies with the two-dimensional
/// (inter-frame, inter-band) predictor and a Laplace model.
///
/// Returns the per-band quantization error for the fine energy pass.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_coarse_energy(
    enc: &mut RangeEncoder<'_>,
    start: usize,
    end: usize,
    log_e: &[[f32; MAX_BANDS]; 2],
    old_e: &mut [[f32; MAX_BANDS]; 2],
    budget: u32,
    lm: usize,
    channels: usize,
    intra: bool,
    error: &mut [[f32; MAX_BANDS]; 2],
) -> Result<(), EncoderError> {
    let (coef, beta) = if intra {
        (0.0, BETA_INTRA)
    } else {
        (PRED_COEF[lm], BETA_COEF[lm])
    };
    let prob_model = &E_PROB_MODEL[lm][usize::from(intra)];
    let mut prev = [0.0_f32; 2];

    for i in start..end {
        for c in 0..channels {
            let x = log_e[c][i];
            let f = x - coef * old_e[c][i] - prev[c];
            let mut qi = (0.5 + f).floor() as i32;

            // Prevent the energy from decaying faster than the decoder can
            // track with an empty budget.
            let decay_bound = f32::max(-28.0, old_e[c][i] - 28.0);
            if qi < 0 && x < decay_bound {
                qi += ((decay_bound - x) as i32).min(-qi);
            }

            let tell = enc.tell();
            let bits_left = budget as i32 - tell as i32 - 3 * (channels * (end - i)) as i32;
            if i != start && bits_left < 30 {
                if bits_left < 24 {
                    qi = i32::min(1, qi);
                }
                if bits_left < 16 {
                    qi = i32::max(-1, qi);
                }
            }

            let budget_left = budget as i32 - enc.tell() as i32;
            if budget_left >= 15 {
                let pi = 2 * usize::min(i, 20);
                enc.encode_laplace(
                    &mut qi,
                    u32::from(prob_model[pi]) << 7,
                    u32::from(prob_model[pi + 1]) << 6,
                )?;
            } else if budget_left >= 2 {
                qi = i32::max(-1, i32::min(qi, 1));
                let sym = (2 * qi) ^ -i32::from(qi < 0);
                enc.encode_icdf(sym as usize, &SMALL_ENERGY_ICDF, 2)?;
            } else if budget_left >= 1 {
                qi = i32::min(0, qi);
                enc.encode_bit_logp((-qi) as u32, 1)?;
            } else {
                qi = -1;
            }

            error[c][i] = f - qi as f32;
            let q = qi as f32;
            old_e[c][i] = coef * old_e[c][i] + prev[c] + q;
            prev[c] += q - beta * q;
        }
    }

    Ok(())
}

/// Decodes the coarse band energies. The exact mirror of
/// `quant_coarse_energy`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn unquant_coarse_energy(
    dec: &mut RangeDecoder<'_>,
    start: usize,
    end: usize,
    old_e: &mut [[f32; MAX_BANDS]; 2],
    budget: u32,
    lm: usize,
    channels: usize,
    intra: bool,
) {
    let (coef, beta) = if intra {
        (0.0, BETA_INTRA)
    } else {
        (PRED_COEF[lm], BETA_COEF[lm])
    };
    let prob_model = &E_PROB_MODEL[lm][usize::from(intra)];
    let mut prev = [0.0_f32; 2];

    for i in start..end {
        for c in 0..channels {
            let budget_left = budget as i32 - dec.tell() as i32;
            let qi = if budget_left >= 15 {
                let pi = 2 * usize::min(i, 20);
                dec.decode_laplace(
                    u32::from(prob_model[pi]) << 7,
                    u32::from(prob_model[pi + 1]) << 6,
                )
            } else if budget_left >= 2 {
                let sym = dec.decode_icdf(&SMALL_ENERGY_ICDF, 2) as i32;
                (sym >> 1) ^ -(sym & 1)
            } else if budget_left >= 1 {
                -i32::from(dec.decode_bit_logp(1))
            } else {
                -1
            };

            let q = qi as f32;
            old_e[c][i] = coef * old_e[c][i] + prev[c] + q;
            prev[c] += q - beta * q;
        }
    }
}

/// Encodes the fine energy refinements.
pub(crate) fn quant_fine_energy(
    enc: &mut RangeEncoder<'_>,
    start: usize,
    end: usize,
    old_e: &mut [[f32; MAX_BANDS]; 2],
    error: &mut [[f32; MAX_BANDS]; 2],
    fine_bits: &[i32; MAX_BANDS],
    channels: usize,
) -> Result<(), EncoderError> {
    for i in start..end {
        if fine_bits[i] <= 0 {
            continue;
        }
        let frac = 1 << fine_bits[i];
        for c in 0..channels {
            let mut q2 = ((error[c][i] + 0.5) * frac as f32).floor() as i32;
            q2 = q2.max(0).min(frac - 1);
            enc.encode_bits(q2 as u32, fine_bits[i] as u32)?;
            let offset = (q2 as f32 + 0.5) / frac as f32 - 0.5;
            old_e[c][i] += offset;
            error[c][i] -= offset;
        }
    }
    Ok(())
}

/// Decodes the fine energy refinements.
pub(crate) fn unquant_fine_energy(
    dec: &mut RangeDecoder<'_>,
    start: usize,
    end: usize,
    old_e: &mut [[f32; MAX_BANDS]; 2],
    fine_bits: &[i32; MAX_BANDS],
    channels: usize,
) {
    for i in start..end {
        if fine_bits[i] <= 0 {
            continue;
        }
        let frac = 1 << fine_bits[i];
        for c in 0..channels {
            let q2 = dec.decode_bits(fine_bits[i] as u32) as i32;
            let offset = (q2 as f32 + 0.5) / frac as f32 - 0.5;
            old_e[c][i] += offset;
        }
    }
}

/// Spends any left-over whole bits on one more bit of energy resolution for
/// the bands that want it most.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_energy_finalise(
    enc: &mut RangeEncoder<'_>,
    start: usize,
    end: usize,
    old_e: &mut [[f32; MAX_BANDS]; 2],
    error: &mut [[f32; MAX_BANDS]; 2],
    fine_bits: &[i32; MAX_BANDS],
    fine_priority: &[bool; MAX_BANDS],
    channels: usize,
    mut bits_left: i32,
) -> Result<(), EncoderError> {
    for prio in [false, true].iter() {
        for i in start..end {
            if bits_left < channels as i32 {
                break;
            }
            if fine_bits[i] >= MAX_FINE_BITS || fine_priority[i] != *prio {
                continue;
            }
            for c in 0..channels {
                let q2 = i32::from(error[c][i] >= 0.0);
                enc.encode_bits(q2 as u32, 1)?;
                let offset = (q2 as f32 - 0.5) / (1 << (fine_bits[i] + 1)) as f32;
                old_e[c][i] += offset;
                error[c][i] -= offset;
                bits_left -= 1;
            }
        }
    }
    Ok(())
}

/// Decoder mirror of `quant_energy_finalise`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn unquant_energy_finalise(
    dec: &mut RangeDecoder<'_>,
    start: usize,
    end: usize,
    old_e: &mut [[f32; MAX_BANDS]; 2],
    fine_bits: &[i32; MAX_BANDS],
    fine_priority: &[bool; MAX_BANDS],
    channels: usize,
    mut bits_left: i32,
) {
    for prio in [false, true].iter() {
        for i in start..end {
            if bits_left < channels as i32 {
                break;
            }
            if fine_bits[i] >= MAX_FINE_BITS || fine_priority[i] != *prio {
                continue;
            }
            for c in 0..channels {
                let q2 = dec.decode_bits(1) as i32;
                let offset = (q2 as f32 - 0.5) / (1 << (fine_bits[i] + 1)) as f32;
                old_e[c][i] += offset;
                bits_left -= 1;
            }
        }
    }
}

/// Encodes the per-band time-frequency resolution changes.
pub(crate) fn tf_encode(
    enc: &mut RangeEncoder<'_>,
    start: usize,
    end: usize,
    is_transient: bool,
    tf_res: &mut [i32; MAX_BANDS],
    lm: usize,
    tf_select: usize,
) -> Result<(), EncoderError> {
    let mut budget = (enc.storage() * 8) as u32;
    let mut tell = enc.tell();
    let mut logp = if is_transient { 2 } else { 4 };

    let tf_select_rsv = u32::from(lm > 0 && tell + logp + 1 <= budget);
    budget -= tf_select_rsv;

    let mut curr = 0;
    let mut tf_changed = 0_usize;
    for i in start..end {
        if tell + logp <= budget {
            enc.encode_bit_logp((tf_res[i] ^ curr) as u32, logp)?;
            tell = enc.tell();
            curr = tf_res[i];
            tf_changed |= curr as usize;
        } else {
            tf_res[i] = curr;
        }
        logp = if is_transient { 4 } else { 5 };
    }

    let mut tf_select = tf_select;
    let transient = usize::from(is_transient);
    if tf_select_rsv != 0
        && TF_SELECT_TABLE[lm][4 * transient + tf_changed]
            != TF_SELECT_TABLE[lm][4 * transient + 2 + tf_changed]
    {
        enc.encode_bit_logp(tf_select as u32, 1)?;
    } else {
        tf_select = 0;
    }

    (start..end).for_each(|i| {
        tf_res[i] =
            i32::from(TF_SELECT_TABLE[lm][4 * transient + 2 * tf_select + tf_res[i] as usize]);
    });
    Ok(())
}

/// Decodes the per-band time-frequency resolution changes.
pub(crate) fn tf_decode(
    dec: &mut RangeDecoder<'_>,
    start: usize,
    end: usize,
    is_transient: bool,
    tf_res: &mut [i32; MAX_BANDS],
    lm: usize,
) {
    let mut budget = (dec.storage() * 8) as u32;
    let mut tell = dec.tell();
    let mut logp = if is_transient { 2 } else { 4 };

    let tf_select_rsv = u32::from(lm > 0 && tell + logp + 1 <= budget);
    budget -= tf_select_rsv;

    let mut curr = 0;
    let mut tf_changed = 0_usize;
    for i in start..end {
        if tell + logp <= budget {
            curr ^= i32::from(dec.decode_bit_logp(logp));
            tell = dec.tell();
            tf_changed |= curr as usize;
        }
        tf_res[i] = curr;
        logp = if is_transient { 4 } else { 5 };
    }

    let transient = usize::from(is_transient);
    let mut tf_select = 0;
    if tf_select_rsv != 0
        && TF_SELECT_TABLE[lm][4 * transient + tf_changed]
            != TF_SELECT_TABLE[lm][4 * transient + 2 + tf_changed]
    {
        tf_select = usize::from(dec.decode_bit_logp(1));
    }

    (start..end).for_each(|i| {
        tf_res[i] =
            i32::from(TF_SELECT_TABLE[lm][4 * transient + 2 * tf_select + tf_res[i] as usize]);
    });
}

/// The orthonormal Haar pairing used when a band trades time resolution
/// against frequency resolution. The transform is its own inverse.
pub(crate) fn haar1(x: &mut [f32], n0: usize, stride: usize) {
    use std::f32::consts::FRAC_1_SQRT_2;

    let n0 = n0 / 2;
    (0..stride).for_each(|i| {
        (0..n0).for_each(|j| {
            let a = FRAC_1_SQRT_2 * x[stride * 2 * j + i];
            let b = FRAC_1_SQRT_2 * x[stride * (2 * j + 1) + i];
            x[stride * 2 * j + i] = a + b;
            x[stride * (2 * j + 1) + i] = a - b;
        });
    });
}

/// Applies the decoded tf_res changes to one band of normalized spectrum.
pub(crate) fn apply_tf_change(x: &mut [f32], tf_change: i32) {
    let n = x.len();
    let mut applied = 0;
    while applied < tf_change.abs() {
        let stride = 1 << applied;
        if n / (2 * stride as usize) == 0 {
            break;
        }
        haar1(x, n / stride as usize, stride as usize);
        applied += 1;
    }
}

fn isqrt(n: u32) -> u32 {
    if n == 0 {
        return 0;
    }
    let mut x = (f64::from(n)).sqrt() as u32;
    while (x + 1).checked_mul(x + 1).map_or(false, |sq| sq <= n) {
        x += 1;
    }
    while x.checked_mul(x).map_or(true, |sq| sq > n) {
        x -= 1;
    }
    x
}

/// The number of quantization levels for a split angle coded with `b`
/// eighth-bits in an `n`-dimensional band.
fn compute_qn(n: usize, b: i32, offset: i32, pulse_cap: i32, stereo: bool) -> i32 {
    const EXP2_TABLE8: [i32; 8] = [16384, 17866, 19483, 21247, 23170, 25267, 27554, 30048];

    let mut n2 = 2 * n as i32 - 1;
    if stereo && n == 2 {
        n2 -= 1;
    }

    // The upper limit ensures a theta split always leaves enough bits for at
    // least one pulse on the smaller side.
    let mut qb = (b + n2 * offset) / n2;
    qb = i32::min(b - pulse_cap - (4 << BITRES), qb);
    qb = i32::min(8 << BITRES, qb);

    if qb < (1 << BITRES) / 2 {
        1
    } else {
        let qn = EXP2_TABLE8[(qb & 0x7) as usize] >> (14 - (qb >> BITRES));
        ((qn + 1) >> 1) << 1
    }
}

#[inline(always)]
fn frac_mul16(a: i32, b: i32) -> i32 {
    (16384 + a * b) >> 15
}

/// Everything the recursive shape coders share.
pub(crate) struct ShapeCtx {
    pub lm: usize,
    pub spread: usize,
    pub blocks: usize,
    pub intensity: usize,
    pub dual_stereo: bool,
    pub remaining_bits: i32,
    pub total_bits: i32,
    pub seed: u32,
}

/// The coded angle of a split, along with the bit-split offset it implies.
struct Theta {
    itheta: i32,
    imid: i32,
    iside: i32,
    delta: i32,
    qalloc: i32,
}

#[allow(clippy::too_many_arguments)]
fn encode_theta(
    enc: &mut RangeEncoder<'_>,
    ctx: &mut ShapeCtx,
    itheta_q14: i32,
    n: usize,
    b: i32,
    band: usize,
    stereo: bool,
) -> Result<Theta, EncoderError> {
    let pulse_cap = LOG_N[band] + ((ctx.lm as i32) << BITRES);
    let offset = (pulse_cap >> 1)
        - if stereo && n == 2 {
            QTHETA_OFFSET_TWOPHASE
        } else {
            QTHETA_OFFSET
        };
    let qn = compute_qn(n, b, offset, pulse_cap, stereo);
    let tell_before = enc.tell_frac() as i32;

    let mut itheta = itheta_q14;
    if qn != 1 {
        itheta = (itheta * qn + 8192) >> 14;

        if stereo && n > 2 {
            // Low-probability model favoring small angles.
            let p0 = 3;
            let x0 = qn / 2;
            let ft = (p0 * (x0 + 1) + x0) as u32;
            if itheta <= x0 {
                enc.encode((p0 * itheta) as u32, (p0 * (itheta + 1)) as u32, ft)?;
            } else {
                enc.encode(
                    ((itheta - 1 - x0) + (x0 + 1) * p0) as u32,
                    ((itheta - x0) + (x0 + 1) * p0) as u32,
                    ft,
                )?;
            }
        } else if ctx.blocks > 1 || stereo {
            enc.encode_uint(itheta as u32, qn as u32 + 1)?;
        } else {
            // Triangular pdf centered on the diagonal.
            let half = qn >> 1;
            let ft = ((half + 1) * (half + 1)) as u32;
            let (fl, fs) = if itheta <= half {
                ((itheta * (itheta + 1) / 2) as u32, (itheta + 1) as u32)
            } else {
                (
                    (ft as i32 - (qn + 1 - itheta) * (qn + 2 - itheta) / 2) as u32,
                    (qn + 1 - itheta) as u32,
                )
            };
            enc.encode(fl, fl + fs, ft)?;
        }
        itheta = itheta * 16384 / qn;
    } else {
        itheta = 0;
    }

    let qalloc = enc.tell_frac() as i32 - tell_before;
    Ok(theta_outputs(itheta, n, qalloc))
}

fn decode_theta(
    dec: &mut RangeDecoder<'_>,
    ctx: &mut ShapeCtx,
    n: usize,
    b: i32,
    band: usize,
    stereo: bool,
) -> Theta {
    let pulse_cap = LOG_N[band] + ((ctx.lm as i32) << BITRES);
    let offset = (pulse_cap >> 1)
        - if stereo && n == 2 {
            QTHETA_OFFSET_TWOPHASE
        } else {
            QTHETA_OFFSET
        };
    let qn = compute_qn(n, b, offset, pulse_cap, stereo);
    let tell_before = dec.tell_frac() as i32;

    let mut itheta;
    if qn != 1 {
        if stereo && n > 2 {
            let p0 = 3;
            let x0 = qn / 2;
            let ft = (p0 * (x0 + 1) + x0) as u32;
            let fm = dec.decode(ft) as i32;
            if fm < p0 * (x0 + 1) {
                itheta = fm / p0;
                dec.update((p0 * itheta) as u32, (p0 * (itheta + 1)) as u32, ft);
            } else {
                itheta = x0 + 1 + (fm - p0 * (x0 + 1));
                dec.update(
                    ((itheta - 1 - x0) + (x0 + 1) * p0) as u32,
                    ((itheta - x0) + (x0 + 1) * p0) as u32,
                    ft,
                );
            }
        } else if ctx.blocks > 1 || stereo {
            itheta = dec.decode_uint(qn as u32 + 1) as i32;
        } else {
            let half = qn >> 1;
            let ft = ((half + 1) * (half + 1)) as u32;
            let fm = dec.decode(ft) as i32;
            let (fl, fs) = if fm < half * (half + 1) / 2 {
                itheta = ((isqrt(8 * fm as u32 + 1) as i32) - 1) >> 1;
                ((itheta * (itheta + 1) / 2) as u32, (itheta + 1) as u32)
            } else {
                itheta = (2 * (qn + 1) - isqrt(8 * (ft as i32 - fm - 1) as u32 + 1) as i32) >> 1;
                (
                    (ft as i32 - (qn + 1 - itheta) * (qn + 2 - itheta) / 2) as u32,
                    (qn + 1 - itheta) as u32,
                )
            };
            dec.update(fl, fl + fs, ft);
        }
        itheta = itheta * 16384 / qn;
    } else {
        itheta = 0;
    }

    let qalloc = dec.tell_frac() as i32 - tell_before;
    theta_outputs(itheta, n, qalloc)
}

fn theta_outputs(itheta: i32, n: usize, qalloc: i32) -> Theta {
    let (imid, iside, delta) = if itheta == 0 {
        (32767, 0, -16384)
    } else if itheta == 16384 {
        (0, 32767, 16384)
    } else {
        let imid = i32::from(bitexact_cos(itheta as i16));
        let iside = i32::from(bitexact_cos((16384 - itheta) as i16));
        let delta = frac_mul16(((n - 1) << 7) as i32, bitexact_log2tan(iside, imid));
        (imid, iside, delta)
    };
    Theta {
        itheta,
        imid,
        iside,
        delta,
        qalloc,
    }
}

/// The energy split angle of two sub-vectors, in Q14.
fn stereo_itheta(mid: &[f32], side: &[f32]) -> i32 {
    let em: f32 = mid.iter().map(|v| v * v).sum::<f32>().sqrt();
    let es: f32 = side.iter().map(|v| v * v).sum::<f32>().sqrt();
    let theta = es.atan2(em + 1e-15);
    let itheta = (theta * (2.0 / std::f32::consts::PI) * 16384.0 + 0.5).floor() as i32;
    itheta.max(0).min(16384)
}

/// Encodes one partition of a band, recursively splitting while the budget
/// exceeds what a single pyramid codebook can absorb.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_partition(
    enc: &mut RangeEncoder<'_>,
    ctx: &mut ShapeCtx,
    x: &mut [f32],
    mut b: i32,
    band: usize,
) -> Result<u32, EncoderError> {
    let n = x.len();

    // Split whenever the budget cannot be spent on a single codebook.
    let max_bits = pvq::pulse_bits(&pvq::PulseTable::new(n, MAX_PULSES), n, MAX_PULSES);
    if n > 2 && b > max_bits {
        let (lo_half, hi_half) = x.split_at_mut(n / 2);
        let itheta = stereo_itheta(lo_half, hi_half);
        let theta = encode_theta(enc, ctx, itheta, n / 2, b, band, false)?;
        b -= theta.qalloc;
        ctx.remaining_bits -= theta.qalloc;

        let mid_gain = theta.imid as f32 / 32768.0;
        let side_gain = theta.iside as f32 / 32768.0;

        let mbits = i32::max(0, i32::min(b, (b - theta.delta) / 2));
        let sbits = b - mbits;

        // Pre-scale so each half is quantized against a unit target.
        scale_partition(lo_half, mid_gain);
        scale_partition(hi_half, side_gain);

        let before = ctx.remaining_bits;
        let cm0 = quant_partition(enc, ctx, lo_half, mbits, band)?;
        // Bits the first half left unspent roll over to the second.
        let rebalance = mbits - (before - ctx.remaining_bits);
        let mut sbits = sbits;
        if rebalance > 3 << BITRES && theta.itheta != 0 {
            sbits += rebalance - (3 << BITRES);
        }
        let cm1 = quant_partition(enc, ctx, hi_half, sbits, band)?;
        return Ok(cm0 | cm1);
    }

    // Terminal codebook.
    let k = pvq::pulses_for_bits(n, i32::min(b, ctx.remaining_bits), MAX_PULSES.min(n * 8));
    if k == 0 {
        return Ok(0);
    }
    let used = pvq::pulse_bits(&pvq::PulseTable::new(n, k), n, k);
    ctx.remaining_bits -= used;

    pvq::exp_rotation(x, -1, ctx.blocks, k, ctx.spread);
    let mut y = vec![0_i32; n];
    pvq::pvq_search(x, k, &mut y);
    pvq::encode_pulses(enc, &y, k)?;

    Ok(collapse_mask(&y, ctx.blocks))
}

/// Decodes one partition of a band. The exact mirror of `quant_partition`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn unquant_partition(
    dec: &mut RangeDecoder<'_>,
    ctx: &mut ShapeCtx,
    x: &mut [f32],
    mut b: i32,
    band: usize,
    fill: bool,
) -> u32 {
    let n = x.len();

    let max_bits = pvq::pulse_bits(&pvq::PulseTable::new(n, MAX_PULSES), n, MAX_PULSES);
    if n > 2 && b > max_bits {
        let theta = decode_theta(dec, ctx, n / 2, b, band, false);
        b -= theta.qalloc;
        ctx.remaining_bits -= theta.qalloc;

        let mid_gain = theta.imid as f32 / 32768.0;
        let side_gain = theta.iside as f32 / 32768.0;

        let mbits = i32::max(0, i32::min(b, (b - theta.delta) / 2));
        let sbits = b - mbits;

        let (lo_half, hi_half) = x.split_at_mut(n / 2);
        let before = ctx.remaining_bits;
        let cm0 = unquant_partition(dec, ctx, lo_half, mbits, band, fill);
        let rebalance = mbits - (before - ctx.remaining_bits);
        let mut sbits = sbits;
        if rebalance > 3 << BITRES && theta.itheta != 0 {
            sbits += rebalance - (3 << BITRES);
        }
        let cm1 = unquant_partition(dec, ctx, hi_half, sbits, band, fill);

        scale_partition(lo_half, mid_gain);
        scale_partition(hi_half, side_gain);
        return cm0 | cm1;
    }

    let k = pvq::pulses_for_bits(n, i32::min(b, ctx.remaining_bits), MAX_PULSES.min(n * 8));
    if k == 0 {
        // Nothing coded: noise-fill so the band doesn't collapse.
        if fill {
            x.iter_mut().for_each(|v| {
                ctx.seed = lcg_rand(ctx.seed);
                *v = if ctx.seed & 0x8000 != 0 { 1.0 } else { -1.0 };
            });
            renormalise_vector(x, 1.0);
            return (1 << ctx.blocks) - 1;
        }
        x.iter_mut().for_each(|v| *v = 0.0);
        return 0;
    }
    let used = pvq::pulse_bits(&pvq::PulseTable::new(n, k), n, k);
    ctx.remaining_bits -= used;

    let mut y = vec![0_i32; n];
    pvq::decode_pulses(dec, &mut y, k);
    pvq::normalize_pulses(&y, x);
    pvq::exp_rotation(x, 1, ctx.blocks, k, ctx.spread);

    collapse_mask(&y, ctx.blocks)
}

fn scale_partition(x: &mut [f32], gain: f32) {
    x.iter_mut().for_each(|v| *v *= gain);
}

fn collapse_mask(y: &[i32], blocks: usize) -> u32 {
    if blocks == 1 {
        return u32::from(y.iter().any(|&v| v != 0));
    }
    let mut mask = 0_u32;
    y.iter().enumerate().for_each(|(i, &v)| {
        if v != 0 {
            mask |= 1 << (i % blocks);
        }
    });
    mask
}

/// Renormalizes a vector to the given gain.
pub(crate) fn renormalise_vector(x: &mut [f32], gain: f32) {
    let energy: f32 = x.iter().map(|v| v * v).sum();
    if energy <= 1e-27 {
        return;
    }
    let g = gain / energy.sqrt();
    x.iter_mut().for_each(|v| *v *= g);
}

/// Encodes all coded bands of one frame.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_all_bands(
    enc: &mut RangeEncoder<'_>,
    ctx: &mut ShapeCtx,
    start: usize,
    end: usize,
    x_left: &mut [f32],
    x_right: Option<&mut [f32]>,
    shape_bits: &[i32; MAX_BANDS],
    coded_bands: usize,
    tf_res: &[i32; MAX_BANDS],
    mut balance: i32,
    collapse_masks: &mut [u8; 2 * MAX_BANDS],
) -> Result<(), EncoderError> {
    let lm = ctx.lm;
    let mut right = x_right;

    for i in start..end {
        let lo = EBANDS[i] << lm;
        let hi = EBANDS[i + 1] << lm;

        let tell = enc.tell_frac() as i32;
        if i != start {
            balance -= tell;
        }
        let remaining = ctx.total_bits - tell - 1;
        ctx.remaining_bits = remaining;

        let b = if i < coded_bands {
            let curr_balance = balance / i32::min(3, (coded_bands - i) as i32);
            i32::max(
                0,
                i32::min(16383, i32::min(remaining + 1, shape_bits[i] + curr_balance)),
            )
        } else {
            0
        };

        match right.as_mut() {
            None => {
                let band = &mut x_left[lo..hi];
                apply_tf_change(band, tf_res[i]);
                let cm = if b > 0 {
                    quant_partition(enc, ctx, band, b, i)?
                } else {
                    0
                };
                collapse_masks[i * 2] = cm as u8;
            }
            Some(y) => {
                let (cm_l, cm_r) = quant_band_stereo(
                    enc,
                    ctx,
                    &mut x_left[lo..hi],
                    &mut y[lo..hi],
                    b,
                    i,
                    tf_res[i],
                )?;
                collapse_masks[i * 2] = cm_l as u8;
                collapse_masks[i * 2 + 1] = cm_r as u8;
            }
        }

        balance += shape_bits[i] + tell;
    }
    Ok(())
}

/// Encodes one stereo band: dual, intensity or mid/side depending on the
/// coded stereo decisions.
#[allow(clippy::too_many_arguments)]
fn quant_band_stereo(
    enc: &mut RangeEncoder<'_>,
    ctx: &mut ShapeCtx,
    left: &mut [f32],
    right: &mut [f32],
    b: i32,
    band: usize,
    tf_change: i32,
) -> Result<(u32, u32), EncoderError> {
    use std::f32::consts::FRAC_1_SQRT_2;

    apply_tf_change(left, tf_change);
    apply_tf_change(right, tf_change);

    if b == 0 {
        return Ok((0, 0));
    }

    if band >= ctx.intensity {
        // Intensity: only the mid shape is coded.
        let mut mid: Vec<f32> = left
            .iter()
            .zip(right.iter())
            .map(|(l, r)| (l + r) * FRAC_1_SQRT_2)
            .collect();
        renormalise_vector(&mut mid, 1.0);
        let cm = quant_partition(enc, ctx, &mut mid, b, band)?;
        return Ok((cm, cm));
    }

    if ctx.dual_stereo {
        let half = b / 2;
        let cm_l = quant_partition(enc, ctx, left, half, band)?;
        let cm_r = quant_partition(enc, ctx, right, b - half, band)?;
        return Ok((cm_l, cm_r));
    }

    // Mid/side with a coded angle.
    let mut mid: Vec<f32> = left
        .iter()
        .zip(right.iter())
        .map(|(l, r)| (l + r) * FRAC_1_SQRT_2)
        .collect();
    let mut side: Vec<f32> = left
        .iter()
        .zip(right.iter())
        .map(|(l, r)| (l - r) * FRAC_1_SQRT_2)
        .collect();

    let itheta = stereo_itheta(&mid, &side);
    let theta = encode_theta(enc, ctx, itheta, mid.len(), b, band, true)?;
    let b = b - theta.qalloc;
    ctx.remaining_bits -= theta.qalloc;

    renormalise_vector(&mut mid, 1.0);
    renormalise_vector(&mut side, 1.0);

    let mbits = i32::max(0, i32::min(b, (b - theta.delta) / 2));
    let sbits = b - mbits;

    let cm_m = quant_partition(enc, ctx, &mut mid, mbits, band)?;
    let cm_s = if sbits > 0 && theta.itheta != 0 {
        quant_partition(enc, ctx, &mut side, sbits, band)?
    } else {
        0
    };

    Ok((cm_m | cm_s, cm_m | cm_s))
}

/// Decodes all coded bands of one frame.
#[allow(clippy::too_many_arguments)]
pub(crate) fn unquant_all_bands(
    dec: &mut RangeDecoder<'_>,
    ctx: &mut ShapeCtx,
    start: usize,
    end: usize,
    x_left: &mut [f32],
    x_right: Option<&mut [f32]>,
    shape_bits: &[i32; MAX_BANDS],
    coded_bands: usize,
    tf_res: &[i32; MAX_BANDS],
    mut balance: i32,
    collapse_masks: &mut [u8; 2 * MAX_BANDS],
) {
    let lm = ctx.lm;
    let mut right = x_right;

    for i in start..end {
        let lo = EBANDS[i] << lm;
        let hi = EBANDS[i + 1] << lm;

        let tell = dec.tell_frac() as i32;
        if i != start {
            balance -= tell;
        }
        let remaining = ctx.total_bits - tell - 1;
        ctx.remaining_bits = remaining;

        let b = if i < coded_bands {
            let curr_balance = balance / i32::min(3, (coded_bands - i) as i32);
            i32::max(
                0,
                i32::min(16383, i32::min(remaining + 1, shape_bits[i] + curr_balance)),
            )
        } else {
            0
        };

        match right.as_mut() {
            None => {
                let band = &mut x_left[lo..hi];
                let cm = if b > 0 {
                    unquant_partition(dec, ctx, band, b, i, false)
                } else {
                    unquant_partition(dec, ctx, band, 0, i, true)
                };
                apply_tf_change(band, tf_res[i]);
                collapse_masks[i * 2] = cm as u8;
            }
            Some(y) => {
                let (cm_l, cm_r) = unquant_band_stereo(
                    dec,
                    ctx,
                    &mut x_left[lo..hi],
                    &mut y[lo..hi],
                    b,
                    i,
                    tf_res[i],
                );
                collapse_masks[i * 2] = cm_l as u8;
                collapse_masks[i * 2 + 1] = cm_r as u8;
            }
        }

        balance += shape_bits[i] + tell;
    }
}

/// Decodes one stereo band. The exact mirror of `quant_band_stereo`.
#[allow(clippy::too_many_arguments)]
fn unquant_band_stereo(
    dec: &mut RangeDecoder<'_>,
    ctx: &mut ShapeCtx,
    left: &mut [f32],
    right: &mut [f32],
    b: i32,
    band: usize,
    tf_change: i32,
) -> (u32, u32) {
    if b == 0 {
        let cm = unquant_partition(dec, ctx, left, 0, band, true);
        right.copy_from_slice(left);
        apply_tf_change(left, tf_change);
        apply_tf_change(right, tf_change);
        return (cm, cm);
    }

    if band >= ctx.intensity {
        let cm = unquant_partition(dec, ctx, left, b, band, true);
        right.copy_from_slice(left);
        apply_tf_change(left, tf_change);
        apply_tf_change(right, tf_change);
        return (cm, cm);
    }

    if ctx.dual_stereo {
        let half = b / 2;
        let cm_l = unquant_partition(dec, ctx, left, half, band, true);
        let cm_r = unquant_partition(dec, ctx, right, b - half, band, true);
        apply_tf_change(left, tf_change);
        apply_tf_change(right, tf_change);
        return (cm_l, cm_r);
    }

    let theta = decode_theta(dec, ctx, left.len(), b, band, true);
    let b = b - theta.qalloc;
    ctx.remaining_bits -= theta.qalloc;

    let mbits = i32::max(0, i32::min(b, (b - theta.delta) / 2));
    let sbits = b - mbits;

    let n = left.len();
    let mut mid = vec![0.0_f32; n];
    let mut side = vec![0.0_f32; n];
    let cm_m = unquant_partition(dec, ctx, &mut mid, mbits, band, true);
    let cm_s = if sbits > 0 && theta.itheta != 0 {
        unquant_partition(dec, ctx, &mut side, sbits, band, false)
    } else {
        0
    };

    // Merge back to left/right and renormalize each channel.
    let gm = theta.imid as f32 / 32768.0;
    let gs = theta.iside as f32 / 32768.0;
    (0..n).for_each(|j| {
        left[j] = gm * mid[j] + gs * side[j];
        right[j] = gm * mid[j] - gs * side[j];
    });
    renormalise_vector(left, 1.0);
    renormalise_vector(right, 1.0);

    apply_tf_change(left, tf_change);
    apply_tf_change(right, tf_change);

    (cm_m | cm_s, cm_m | cm_s)
}

/// Regenerates energy in the short blocks of transient bands that decoded to
/// silence, then renormalizes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn anti_collapse(
    x: &mut [f32],
    collapse_masks: &[u8; 2 * MAX_BANDS],
    lm: usize,
    channel: usize,
    start: usize,
    end: usize,
    log_e: &[f32; MAX_BANDS],
    prev1_log_e: &[f32; MAX_BANDS],
    prev2_log_e: &[f32; MAX_BANDS],
    pulses: &[i32; MAX_BANDS],
    seed: &mut u32,
) {
    for i in start..end {
        let n0 = EBANDS[i + 1] - EBANDS[i];
        let depth = ((1 + pulses[i]) / n0 as i32) >> lm;

        let thresh = 0.5 * fast_exp2(-0.125 * depth as f32);
        let sqrt_1 = 1.0 / ((n0 << lm) as f32).sqrt();

        let prev1 = prev1_log_e[i];
        let prev2 = prev2_log_e[i];
        let ediff = f32::max(0.0, log_e[i] - f32::min(prev1, prev2));

        let mut r = 2.0 * fast_exp2(-ediff);
        if lm == 3 {
            r *= std::f32::consts::SQRT_2;
        }
        r = f32::min(thresh, r) * sqrt_1;

        let lo = EBANDS[i] << lm;
        let blocks = 1 << lm;
        let mut renormalize = false;
        (0..blocks).for_each(|k| {
            if collapse_masks[i * 2 + channel] & (1 << k) == 0 {
                // Fill this short block with decorrelated noise.
                (0..n0).for_each(|j| {
                    *seed = lcg_rand(*seed);
                    x[lo + (j << lm) + k] = if *seed & 0x8000 != 0 { r } else { -r };
                });
                renormalize = true;
            }
        });

        if renormalize {
            renormalise_vector(&mut x[lo..lo + (n0 << lm)], 1.0);
        }
    }
}

/// Decides how much spreading the spectrum wants, from how concentrated the
/// normalized shapes are.
pub(crate) fn spreading_decision(x: &[f32], end: usize, lm: usize) -> usize {
    let mut sum = 0.0_f32;
    let mut count = 0;

    (0..end).for_each(|i| {
        let lo = EBANDS[i] << lm;
        let hi = EBANDS[i + 1] << lm;
        if hi - lo <= 8 {
            return;
        }
        let l2: f32 = x[lo..hi].iter().map(|v| v * v).sum();
        if l2 <= 1e-15 {
            return;
        }
        let l1: f32 = x[lo..hi].iter().map(|v| v.abs()).sum();
        // l1/sqrt(n*l2) approaches 1 for flat bands and 1/sqrt(n) for peaky.
        sum += l1 / (l2 * (hi - lo) as f32).sqrt();
        count += 1;
    });

    if count == 0 {
        return 2;
    }
    let flatness = sum / count as f32;
    if flatness > 0.85 {
        3
    } else if flatness > 0.6 {
        2
    } else if flatness > 0.4 {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;
    use crate::range_coder::{RangeDecoder, RangeEncoder};

    fn random_spectrum(rng: &mut nanorand::WyRand, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0)
            .collect()
    }

    #[test]
    fn test_coarse_energy_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(31);
        let mut buffer = vec![0_u8; 256];

        for &intra in [true, false].iter() {
            let log_e = {
                let mut e = [[0.0_f32; MAX_BANDS]; 2];
                e[0].iter_mut().for_each(|v| {
                    *v = rng.generate_range::<u32>(0, 200) as f32 / 10.0 - 10.0;
                });
                e
            };
            let mut enc_old = [[0.0_f32; MAX_BANDS]; 2];
            let mut dec_old = [[0.0_f32; MAX_BANDS]; 2];
            let mut error = [[0.0_f32; MAX_BANDS]; 2];

            let mut enc = RangeEncoder::new(&mut buffer);
            quant_coarse_energy(
                &mut enc, 0, 21, &log_e, &mut enc_old, 2048, 3, 1, intra, &mut error,
            )
            .unwrap();
            enc.done().unwrap();
            drop(enc);

            let mut dec = RangeDecoder::new(&buffer);
            unquant_coarse_energy(&mut dec, 0, 21, &mut dec_old, 2048, 3, 1, intra);

            (0..21).for_each(|i| {
                assert!(
                    (enc_old[0][i] - dec_old[0][i]).abs() < 1e-4,
                    "band {} differs: {} != {} (intra: {})",
                    i,
                    enc_old[0][i],
                    dec_old[0][i],
                    intra
                );
            });

            // The quantized energies track the input within half a step plus
            // the prediction leakage.
            (0..21).for_each(|i| {
                assert!(
                    (enc_old[0][i] - log_e[0][i]).abs() < 1.0,
                    "band {}: quantized {} vs input {}",
                    i,
                    enc_old[0][i],
                    log_e[0][i]
                );
            });
        }
    }

    #[test]
    fn test_fine_energy_round_trip() {
        let mut buffer = vec![0_u8; 256];
        let mut fine_bits = [0_i32; MAX_BANDS];
        fine_bits.iter_mut().for_each(|b| *b = 3);

        let mut error = [[0.0_f32; MAX_BANDS]; 2];
        error[0].iter_mut().enumerate().for_each(|(i, e)| {
            *e = (i as f32 / MAX_BANDS as f32) - 0.5;
        });
        let mut enc_e = [[0.0_f32; MAX_BANDS]; 2];
        let mut dec_e = [[0.0_f32; MAX_BANDS]; 2];

        let mut enc = RangeEncoder::new(&mut buffer);
        let mut enc_error = error;
        quant_fine_energy(&mut enc, 0, 21, &mut enc_e, &mut enc_error, &fine_bits, 1).unwrap();
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        unquant_fine_energy(&mut dec, 0, 21, &mut dec_e, &fine_bits, 1);

        (0..21).for_each(|i| {
            assert!((enc_e[0][i] - dec_e[0][i]).abs() < 1e-6);
            // 3 bits of refinement leave at most 1/16 of residual error.
            assert!(enc_error[0][i].abs() <= 0.0626);
        });
    }

    #[test]
    fn test_tf_round_trip() {
        let mut buffer = vec![0_u8; 64];

        let mut tf_res = [0_i32; MAX_BANDS];
        (0..MAX_BANDS).for_each(|i| tf_res[i] = (i % 2) as i32);
        let coded = tf_res;

        let mut enc = RangeEncoder::new(&mut buffer);
        let mut enc_res = coded;
        tf_encode(&mut enc, 0, 21, true, &mut enc_res, 3, 0).unwrap();
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        let mut dec_res = [0_i32; MAX_BANDS];
        tf_decode(&mut dec, 0, 21, true, &mut dec_res, 3);

        assert_eq!(enc_res, dec_res);
    }

    #[test]
    fn test_haar1_is_involution() {
        let mut rng = nanorand::WyRand::new_seed(41);
        let original = random_spectrum(&mut rng, 32);
        let mut x = original.clone();

        haar1(&mut x, 32, 1);
        haar1(&mut x, 32, 1);

        x.iter().zip(original.iter()).for_each(|(got, want)| {
            assert!((got - want).abs() < 1e-5);
        });
    }

    #[test]
    fn test_mono_band_shape_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(53);
        let mut buffer = vec![0_u8; 1275];

        for &band in [4_usize, 10, 16].iter() {
            let lm = 3;
            let n = (EBANDS[band + 1] - EBANDS[band]) << lm;
            let mut shape = random_spectrum(&mut rng, n);
            renormalise_vector(&mut shape, 1.0);
            let original = shape.clone();

            let b = 900;
            let mut enc_ctx = ShapeCtx {
                lm,
                spread: 2,
                blocks: 1,
                intensity: 21,
                dual_stereo: false,
                remaining_bits: 8 * 1275,
                total_bits: 8 * 1275 << BITRES,
                seed: 0,
            };

            let mut enc = RangeEncoder::new(&mut buffer);
            quant_partition(&mut enc, &mut enc_ctx, &mut shape, b, band).unwrap();
            enc.done().unwrap();
            drop(enc);

            let mut dec_ctx = ShapeCtx {
                lm,
                spread: 2,
                blocks: 1,
                intensity: 21,
                dual_stereo: false,
                remaining_bits: 8 * 1275,
                total_bits: 8 * 1275 << BITRES,
                seed: 0,
            };
            let mut dec = RangeDecoder::new(&buffer);
            let mut decoded = vec![0.0_f32; n];
            unquant_partition(&mut dec, &mut dec_ctx, &mut decoded, b, band, false);

            // A 900-eighth-bit budget buys a decent shape approximation.
            let err: f32 = decoded
                .iter()
                .zip(original.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            let norm: f32 = original.iter().map(|v| v * v).sum();
            assert!(
                err / norm < 0.5,
                "band {}: relative shape error {}",
                band,
                err / norm
            );
        }
    }

    #[test]
    fn test_anti_collapse_renormalizes() {
        let mut x = vec![0.0_f32; EBANDS[MAX_BANDS] << 1];
        let collapse_masks = [0_u8; 2 * MAX_BANDS];
        let log_e = [0.0_f32; MAX_BANDS];
        let prev = [10.0_f32; MAX_BANDS];
        let pulses = [0_i32; MAX_BANDS];
        let mut seed = 42;

        anti_collapse(
            &mut x,
            &collapse_masks,
            1,
            0,
            0,
            21,
            &log_e,
            &prev,
            &prev,
            &pulses,
            &mut seed,
        );

        (0..21).for_each(|i| {
            let lo = EBANDS[i] << 1;
            let hi = EBANDS[i + 1] << 1;
            let energy: f32 = x[lo..hi].iter().map(|v| v * v).sum();
            assert!((energy - 1.0).abs() < 1e-4, "band {} energy {}", i, energy);
        });
        assert_ne!(seed, 42);
    }
}
