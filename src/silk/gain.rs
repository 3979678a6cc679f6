//! Implements the log-domain subframe gain quantizer.
//!
//! Gains live on a 64-step logarithmic grid. The first subframe of an
//! independently coded frame carries an absolute index (three MSBs
//! conditioned on the signal type, three uniform LSBs); every other
//! subframe delta-codes against its predecessor.

use crate::math::{lin2log, log2lin};

/// Number of quantization levels of the log gain.
pub(crate) const N_LEVELS: i32 = 64;

/// Scale between the 6-bit index domain and the `lin2log` domain.
const SCALE_Q16: i64 = 0x1D1C71;
/// Offset into the `lin2log` domain; index 0 maps to unity gain.
const OFFSET: i32 = 2090;

/// Dequantizes a log gain index to a linear Q16 gain.
pub(crate) fn dequant_gain_q16(log_gain: i32) -> i32 {
    let in_log = ((i64::from(log_gain) * SCALE_Q16) >> 16) as i32 + OFFSET;
    log2lin(in_log)
}

/// Quantizes a linear Q16 gain to the nearest log gain index.
pub(crate) fn quant_gain_index(gain_q16: i32) -> i32 {
    let log = lin2log(gain_q16.max(1)) - OFFSET;
    let idx = ((i64::from(log) << 16) + SCALE_Q16 / 2) / SCALE_Q16;
    (idx as i32).max(0).min(N_LEVELS - 1)
}

/// The decoder's delta-gain rule: the new index from the previous index and
/// a coded delta in `0..41`.
pub(crate) fn apply_delta(prev: i32, delta: i32) -> i32 {
    (2 * delta - 16)
        .max(prev + delta - 4)
        .max(0)
        .min(N_LEVELS - 1)
}

/// The delta whose decoded index lands closest to (without exceeding by
/// much) the target index.
pub(crate) fn best_delta(prev: i32, target: i32) -> i32 {
    let mut best = 0;
    let mut best_err = i32::MAX;
    (0..41).for_each(|delta| {
        let err = (apply_delta(prev, delta) - target).abs();
        if err < best_err {
            best_err = err;
            best = delta;
        }
    });
    best
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_gain_grid_anchor() {
        // Index 0 sits just above unity; the grid tops out near 2^30.
        let low = dequant_gain_q16(0);
        assert!(low > 65536 && low < 131072, "low gain {}", low);
        let high = dequant_gain_q16(N_LEVELS - 1);
        assert!(high > 1 << 28, "high gain {}", high);
    }

    #[test]
    fn test_quant_dequant_round_trip() {
        (0..N_LEVELS).for_each(|idx| {
            let g = dequant_gain_q16(idx);
            let back = quant_gain_index(g);
            assert!(
                (back - idx).abs() <= 1,
                "index {} decoded to gain {} re-encoded as {}",
                idx,
                g,
                back
            );
        });
    }

    #[test]
    fn test_gain_grid_is_monotonic() {
        let mut prev = 0;
        (0..N_LEVELS).for_each(|idx| {
            let g = dequant_gain_q16(idx);
            assert!(g > prev, "gain grid not increasing at {}", idx);
            prev = g;
        });
    }

    #[test]
    fn test_delta_rule_bounds() {
        (0..N_LEVELS).for_each(|prev| {
            (0..41).for_each(|delta| {
                let v = apply_delta(prev, delta);
                assert!((0..N_LEVELS).contains(&v));
            });
        });
    }

    #[test]
    fn test_best_delta_tracks_target() {
        // Within the reachable range the delta coder must land close.
        let prev = 30;
        (20..45).for_each(|target| {
            let d = best_delta(prev, target);
            let got = apply_delta(prev, d);
            assert!((got - target).abs() <= 1, "target {} got {}", target, got);
        });
    }
}
