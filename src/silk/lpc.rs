//! Implements the short-term prediction analysis: Burg's method, bandwidth
//! expansion and conversion between prediction coefficients and normalized
//! line spectral frequencies.
//!
//! Analysis runs in floating point; only the quantized outputs reach the
//! bitstream, and the synthesis filters they produce are integer Q12.

use std::f64::consts::PI;

use crate::silk::MAX_LPC_ORDER;

/// Shortest distance between stabilized NLSFs, Q15.
const NLSF_MIN_SPACING: i32 = 250;

/// Burg's method over `x`, writing `order` prediction coefficients.
///
/// The convention matches the synthesis filter: the predicted sample is
/// `sum(a[k] * x[n - 1 - k])`.
pub(crate) fn burg(x: &[f32], order: usize, a: &mut [f32]) {
    let n = x.len();
    a[..order].iter_mut().for_each(|v| *v = 0.0);
    if n <= order {
        return;
    }

    let mut f: Vec<f64> = x.iter().map(|&v| f64::from(v)).collect();
    let mut b = f.clone();
    let mut a64 = [0.0_f64; MAX_LPC_ORDER];

    let mut dk: f64 = f.iter().map(|v| v * v).sum::<f64>() * 2.0;
    dk -= f[0] * f[0] + b[n - 1] * b[n - 1];

    for m in 0..order {
        if dk <= 1e-9 {
            break;
        }

        // Reflection coefficient maximizing the remaining prediction gain.
        let mut num = 0.0_f64;
        (m + 1..n).for_each(|i| {
            num += f[i] * b[i - 1];
        });
        let k = -2.0 * num / dk;
        let k = k.max(-0.999_999).min(0.999_999);

        // Levinson recursion on the coefficients.
        let half = (m + 1) / 2;
        (0..half).for_each(|i| {
            let tmp = a64[i];
            a64[i] += k * a64[m - 1 - i];
            if i != m - 1 - i {
                a64[m - 1 - i] += k * tmp;
            }
        });
        a64[m] = k;

        // Update the forward and backward errors.
        (m + 1..n).rev().for_each(|i| {
            let fi = f[i];
            f[i] += k * b[i - 1];
            b[i] = b[i - 1] + k * fi;
        });

        dk = (1.0 - k * k) * dk - f[m + 1] * f[m + 1] - b[n - 1] * b[n - 1];
    }

    // Flip to the prediction convention.
    (0..order).for_each(|i| a[i] = -a64[i] as f32);
}

/// Scales the coefficients towards the origin, trading prediction gain for
/// stability margin.
pub(crate) fn bandwidth_expand(a: &mut [f32], chirp: f32) {
    let mut c = chirp;
    a.iter_mut().for_each(|v| {
        *v *= c;
        c *= chirp;
    });
}

/// The prediction error energy ratio of the filter; also a stability probe.
/// Returns `None` when the step-down recursion fails, i.e. the filter has a
/// pole on or outside the unit circle.
pub(crate) fn reflection_coefficients(a: &[f32]) -> Option<Vec<f32>> {
    let order = a.len();
    let mut c: Vec<f64> = a.iter().map(|&v| f64::from(-v)).collect();
    let mut k = vec![0.0_f32; order];

    for m in (0..order).rev() {
        let km = c[m];
        if km.abs() >= 1.0 {
            return None;
        }
        k[m] = km as f32;
        let denom = 1.0 - km * km;
        let prev = c.clone();
        (0..m).for_each(|i| {
            c[i] = (prev[i] - km * prev[m - 1 - i]) / denom;
        });
    }
    Some(k)
}

/// Expands the filter until it is safely stable.
pub(crate) fn ensure_stable(a: &mut [f32]) {
    for _ in 0..32 {
        match reflection_coefficients(a) {
            Some(k) if k.iter().all(|v| v.abs() < 0.98) => return,
            _ => bandwidth_expand(a, 0.995),
        }
    }
    // Last resort: flatten the predictor entirely.
    a.iter_mut().for_each(|v| *v = 0.0);
}

/// Evaluates the symmetrized LSP polynomial at frequency `w`.
fn lsp_poly_at(p: &[f64], w: f64) -> f64 {
    let m1 = p.len() - 1;
    let center = m1 as f64 / 2.0;
    p.iter()
        .enumerate()
        .map(|(i, &c)| c * ((center - i as f64) * w).cos())
        .sum()
}

/// Converts prediction coefficients to normalized LSFs in Q15.
///
/// Scans the sum and difference polynomials over the frequency axis and
/// bisects each sign change. Falls back to an evenly spaced set when the
/// expected root count is not found.
pub(crate) fn lpc_to_nlsf(a: &[f32], nlsf_q15: &mut [i16]) {
    let order = a.len();

    // c = coefficients of A(z) = 1 - sum a_k z^-k.
    let mut c = vec![0.0_f64; order + 2];
    c[0] = 1.0;
    (0..order).for_each(|k| c[k + 1] = -f64::from(a[k]));

    // Sum and difference polynomials, both of degree order + 1.
    let mut p = vec![0.0_f64; order + 2];
    let mut q = vec![0.0_f64; order + 2];
    (0..order + 2).for_each(|i| {
        p[i] = c[i] + c[order + 1 - i];
        q[i] = c[i] - c[order + 1 - i];
    });

    const GRID: usize = 1024;
    let mut roots: Vec<f64> = Vec::with_capacity(order + 2);
    for &(poly, skip_zero, skip_pi) in [(&p[..], false, true), (&q[..], true, false)].iter() {
        let mut prev_w = 1e-4;
        let mut prev_v = lsp_poly_at(poly, prev_w);
        for g in 1..=GRID {
            let w = PI * g as f64 / (GRID + 1) as f64;
            let v = lsp_poly_at(poly, w);
            if prev_v == 0.0 || (prev_v > 0.0) != (v > 0.0) {
                // Bisect the bracket.
                let mut lo = prev_w;
                let mut hi = w;
                let mut lo_v = prev_v;
                for _ in 0..40 {
                    let mid = 0.5 * (lo + hi);
                    let mid_v = lsp_poly_at(poly, mid);
                    if (lo_v > 0.0) != (mid_v > 0.0) {
                        hi = mid;
                    } else {
                        lo = mid;
                        lo_v = mid_v;
                    }
                }
                let root = 0.5 * (lo + hi);
                let near_zero = root < 1e-3;
                let near_pi = root > PI - 1e-3;
                if !(skip_zero && near_zero) && !(skip_pi && near_pi) && !near_zero && !near_pi {
                    roots.push(root);
                }
            }
            prev_w = w;
            prev_v = v;
        }
    }
    roots.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

    if roots.len() != order {
        // Root finding failed (unstable or degenerate filter).
        (0..order).for_each(|i| {
            nlsf_q15[i] = ((i + 1) as i32 * 32768 / (order + 1) as i32) as i16;
        });
        return;
    }

    (0..order).for_each(|i| {
        let v = (roots[i] / PI * 32768.0).round() as i32;
        nlsf_q15[i] = v.max(1).min(32767) as i16;
    });
    stabilize_nlsf(&mut nlsf_q15[..order]);
}

/// Converts normalized LSFs back to Q12 prediction coefficients.
pub(crate) fn nlsf_to_lpc(nlsf_q15: &[i16], a_q12: &mut [i16]) {
    let order = nlsf_q15.len();

    // Split the frequencies between the sum and difference polynomials.
    let build = |indices: &[usize]| -> Vec<f64> {
        let mut poly = vec![0.0_f64; 1];
        poly[0] = 1.0;
        indices.iter().for_each(|&k| {
            let w = f64::from(nlsf_q15[k]) / 32768.0 * PI;
            let c = -2.0 * w.cos();
            // Multiply poly by (1 + c z^-1 + z^-2).
            let mut next = vec![0.0_f64; poly.len() + 2];
            poly.iter().enumerate().for_each(|(i, &v)| {
                next[i] += v;
                next[i + 1] += c * v;
                next[i + 2] += v;
            });
            poly = next;
        });
        poly
    };

    let even: Vec<usize> = (0..order).step_by(2).collect();
    let odd: Vec<usize> = (1..order).step_by(2).collect();
    let p_core = build(&even);
    let q_core = build(&odd);

    // P(z) = (1 + z^-1) * p_core, Q(z) = (1 - z^-1) * q_core.
    let mut p = vec![0.0_f64; p_core.len() + 1];
    let mut q = vec![0.0_f64; q_core.len() + 1];
    p_core.iter().enumerate().for_each(|(i, &v)| {
        p[i] += v;
        p[i + 1] += v;
    });
    q_core.iter().enumerate().for_each(|(i, &v)| {
        q[i] += v;
        q[i + 1] -= v;
    });

    // A(z) = (P(z) + Q(z)) / 2; coefficient 0 is one, the rest negate into
    // the prediction convention.
    let mut a = vec![0.0_f64; order];
    (0..order).for_each(|k| {
        a[k] = -0.5 * (p[k + 1] + q[k + 1]);
    });

    // Quantize with saturation; expand on overflow.
    for _ in 0..16 {
        let max = a.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if max * 4096.0 <= 32766.0 {
            break;
        }
        let chirp = 0.999 * (32766.0 / (max * 4096.0)).powf(1.0 / order as f64);
        let mut c = chirp;
        a.iter_mut().for_each(|v| {
            *v *= c;
            c *= chirp;
        });
    }
    (0..order).for_each(|k| {
        let v = (a[k] * 4096.0).round() as i32;
        a_q12[k] = v.max(-32768).min(32767) as i16;
    });
}

/// Forces the NLSF vector to be strictly increasing with a minimum spacing,
/// which keeps the reconstructed filter stable.
pub(crate) fn stabilize_nlsf(nlsf_q15: &mut [i16]) {
    let order = nlsf_q15.len();
    let min = NLSF_MIN_SPACING;
    let mut v: Vec<i32> = nlsf_q15.iter().map(|&x| i32::from(x)).collect();

    // Forward pass pushes values up to their floor; the intermediate values
    // may exceed the Q15 range until the backward pass pulls them down.
    let mut floor = min;
    (0..order).for_each(|i| {
        if v[i] < floor {
            v[i] = floor;
        }
        floor = v[i] + min;
    });

    // Backward pass pulls values below their ceiling.
    let mut ceil = 32768 - min;
    (0..order).rev().for_each(|i| {
        if v[i] > ceil {
            v[i] = ceil;
        }
        ceil = v[i] - min;
    });

    (0..order).for_each(|i| nlsf_q15[i] = v[i] as i16);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn synth_signal(a: &[f32], len: usize) -> Vec<f32> {
        // Drive the synthesis filter with a deterministic excitation.
        let mut x = vec![0.0_f32; len];
        let mut seed = 22222_u32;
        (0..len).for_each(|n| {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            let e = (seed >> 16) as f32 / 65536.0 - 0.5;
            let mut v = e;
            a.iter().enumerate().for_each(|(k, &ak)| {
                if n > k {
                    v += ak * x[n - 1 - k];
                }
            });
            x[n] = v;
        });
        x
    }

    #[test]
    fn test_burg_recovers_known_filter() {
        let target = [1.2_f32, -0.6];
        let x = synth_signal(&target, 2000);

        let mut a = [0.0_f32; MAX_LPC_ORDER];
        burg(&x[500..], 2, &mut a);

        assert!((a[0] - target[0]).abs() < 0.05, "a0 = {}", a[0]);
        assert!((a[1] - target[1]).abs() < 0.05, "a1 = {}", a[1]);
    }

    #[test]
    fn test_nlsf_round_trip() {
        let target = [1.1_f32, -0.44, 0.2, -0.1, 0.05, -0.02, 0.01, 0.0, 0.0, 0.0];
        let mut a = target;
        ensure_stable(&mut a);

        let mut nlsf = [0_i16; MAX_LPC_ORDER];
        lpc_to_nlsf(&a, &mut nlsf);

        // Monotone and in range.
        (1..10).for_each(|i| assert!(nlsf[i] > nlsf[i - 1], "nlsf not monotonic"));

        let mut a_q12 = [0_i16; MAX_LPC_ORDER];
        nlsf_to_lpc(&nlsf[..10], &mut a_q12);

        (0..10).for_each(|k| {
            let got = f32::from(a_q12[k]) / 4096.0;
            assert!(
                (got - a[k]).abs() < 0.08,
                "coefficient {}: {} != {}",
                k,
                got,
                a[k]
            );
        });
    }

    #[test]
    fn test_stabilize_enforces_spacing() {
        let mut nlsf = [100_i16, 120, 130, 20000, 20010, 20020, 30000, 32700, 32760, 32765];
        stabilize_nlsf(&mut nlsf);

        let mut prev = 0_i32;
        nlsf.iter().for_each(|&v| {
            assert!(i32::from(v) >= prev + 250, "spacing violated at {}", v);
            prev = i32::from(v);
        });
        assert!(i32::from(nlsf[9]) <= 32768 - 250);
    }

    #[test]
    fn test_unstable_filter_is_tamed() {
        let mut a = [0.0_f32; 10];
        a[0] = 2.5;
        ensure_stable(&mut a);
        assert!(reflection_coefficients(&a).is_some());
    }

    #[test]
    fn test_bandwidth_expand() {
        let mut a = [1.0_f32, 1.0, 1.0];
        bandwidth_expand(&mut a, 0.9);
        assert!((a[0] - 0.9).abs() < 1e-6);
        assert!((a[1] - 0.81).abs() < 1e-6);
        assert!((a[2] - 0.729).abs() < 1e-6);
    }
}
