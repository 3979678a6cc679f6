//! Implements the pitch estimator: a coarse search on a 4 kHz decimated
//! signal, refinement at the internal rate, and the per-subframe contour
//! selection.

use crate::silk::tables::{PITCH_CONTOUR_10MS, PITCH_CONTOUR_20MS};
use crate::silk::{FrameConfig, MAX_NB_SUBFR};

/// Correlation above which a frame is classified voiced.
const VOICED_THRESHOLD: f32 = 0.45;

#[derive(Clone, Copy, Debug)]
pub(crate) struct PitchResult {
    pub voiced: bool,
    /// Base lag at the internal rate.
    pub lag: i32,
    /// Per-subframe lags after contour application.
    pub lags: [i32; MAX_NB_SUBFR],
    /// Index into the contour codebook.
    pub contour: usize,
    /// Normalized correlation at the chosen lag.
    pub correlation: f32,
}

impl PitchResult {
    pub(crate) fn unvoiced() -> Self {
        Self {
            voiced: false,
            lag: 0,
            lags: [0; MAX_NB_SUBFR],
            contour: 0,
            correlation: 0.0,
        }
    }
}

/// Normalized cross-correlation of `frame` against itself `lag` samples in
/// the past. `buf` holds history followed by the frame, `start` is the
/// frame's offset in `buf`.
fn norm_corr(buf: &[f32], start: usize, len: usize, lag: usize) -> f32 {
    if lag > start {
        return 0.0;
    }
    let mut xy = 0.0_f32;
    let mut yy = 1e-9_f32;
    let mut xx = 1e-9_f32;
    (0..len).for_each(|i| {
        let x = buf[start + i];
        let y = buf[start + i - lag];
        xy += x * y;
        yy += y * y;
        xx += x * x;
    });
    xy / (xx * yy).sqrt()
}

/// Full pitch analysis over one frame.
///
/// `buf` contains at least `max_lag + 3` samples of history followed by the
/// frame itself; `prev_lag` biases the search towards continuity.
pub(crate) fn pitch_analysis(buf: &[f32], cfg: &FrameConfig, prev_lag: i32) -> PitchResult {
    let frame_len = cfg.frame_len();
    let start = buf.len() - frame_len;
    let min_lag = cfg.min_lag() as usize;
    let max_lag = (cfg.max_lag() as usize).min(start.saturating_sub(3));
    if max_lag <= min_lag {
        return PitchResult::unvoiced();
    }

    // Stage 1: coarse search on a 4 kHz decimated copy.
    let dec = cfg.fs_khz / 4;
    let dec_buf: Vec<f32> = buf
        .chunks(dec)
        .map(|c| c.iter().sum::<f32>() / dec as f32)
        .collect();
    let dec_start = start / dec;
    let dec_len = frame_len / dec;

    let mut best_coarse = 0_usize;
    let mut best_coarse_corr = -1.0_f32;
    for lag in min_lag / dec..=max_lag / dec {
        let mut corr = norm_corr(&dec_buf, dec_start, dec_len, lag);
        // Slight preference for the previous frame's lag keeps the
        // trajectory smooth on stationary voiced segments.
        if prev_lag > 0 && (lag as i32 * dec as i32 - prev_lag).abs() < 3 * dec as i32 {
            corr += 0.02;
        }
        // And a mild bias against octave-up errors.
        corr -= 0.01 * (lag as f32 / (max_lag / dec) as f32);
        if corr > best_coarse_corr {
            best_coarse_corr = corr;
            best_coarse = lag;
        }
    }

    // Stage 2: refine around the coarse lag at the full rate.
    let center = best_coarse * dec;
    let lo = center.saturating_sub(dec + 2).max(min_lag);
    let hi = (center + dec + 2).min(max_lag);
    let mut best_lag = lo;
    let mut best_corr = -1.0_f32;
    for lag in lo..=hi {
        let corr = norm_corr(buf, start, frame_len, lag);
        if corr > best_corr {
            best_corr = corr;
            best_lag = lag;
        }
    }

    if best_corr < VOICED_THRESHOLD {
        return PitchResult::unvoiced();
    }

    // Stage 3: per-subframe lags and the closest contour.
    let subfr_len = cfg.subfr_len();
    let mut sub_lags = [0_i32; MAX_NB_SUBFR];
    for s in 0..cfg.nb_subfr {
        let sub_start = start + s * subfr_len;
        let lo = best_lag.saturating_sub(4).max(min_lag);
        let hi = (best_lag + 4).min(max_lag);
        let mut best = best_lag;
        let mut best_c = -1.0_f32;
        for lag in lo..=hi {
            let c = norm_corr(buf, sub_start, subfr_len, lag);
            if c > best_c {
                best_c = c;
                best = lag;
            }
        }
        sub_lags[s] = best as i32;
    }

    let (contour, lags) = best_contour(cfg, best_lag as i32, &sub_lags);

    PitchResult {
        voiced: true,
        lag: best_lag as i32,
        lags,
        contour,
        correlation: best_corr,
    }
}

/// Picks the contour whose offsets best match the measured per-subframe
/// lags, and returns the contoured (clamped) lags.
fn best_contour(
    cfg: &FrameConfig,
    base: i32,
    measured: &[i32; MAX_NB_SUBFR],
) -> (usize, [i32; MAX_NB_SUBFR]) {
    let mut best = 0;
    let mut best_err = i32::MAX;

    let count = contour_count(cfg.nb_subfr);
    for c in 0..count {
        let mut err = 0;
        (0..cfg.nb_subfr).for_each(|s| {
            err += (measured[s] - (base + contour_offset(cfg.nb_subfr, c, s))).abs();
        });
        if err < best_err {
            best_err = err;
            best = c;
        }
    }

    (best, apply_contour(cfg, base, best))
}

/// The per-subframe lags implied by a base lag and contour index.
pub(crate) fn apply_contour(cfg: &FrameConfig, base: i32, contour: usize) -> [i32; MAX_NB_SUBFR] {
    let mut lags = [0_i32; MAX_NB_SUBFR];
    (0..cfg.nb_subfr).for_each(|s| {
        let lag = base + contour_offset(cfg.nb_subfr, contour, s);
        lags[s] = lag.max(cfg.min_lag()).min(cfg.max_lag());
    });
    lags
}

pub(crate) fn contour_count(nb_subfr: usize) -> usize {
    if nb_subfr == 2 {
        PITCH_CONTOUR_10MS.len()
    } else {
        PITCH_CONTOUR_20MS.len()
    }
}

fn contour_offset(nb_subfr: usize, contour: usize, subfr: usize) -> i32 {
    if nb_subfr == 2 {
        i32::from(PITCH_CONTOUR_10MS[contour][subfr])
    } else {
        i32::from(PITCH_CONTOUR_20MS[contour][subfr])
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn pitched_signal(period: usize, len: usize) -> Vec<f32> {
        // A decaying pulse train with some harmonic body.
        (0..len)
            .map(|i| {
                let phase = (i % period) as f32 / period as f32;
                let f = 2.0 * std::f32::consts::PI * phase;
                0.7 * f.sin() + 0.25 * (2.0 * f).sin() + 0.1 * (3.0 * f).sin()
            })
            .collect()
    }

    #[test]
    fn test_finds_known_period() {
        let cfg = FrameConfig::new(16, 20);
        let period = 120;
        let buf = pitched_signal(period, cfg.max_lag() as usize + 16 + cfg.frame_len());

        let result = pitch_analysis(&buf, &cfg, 0);
        assert!(result.voiced);
        // Allow the search to land on the fundamental within a small margin.
        assert!(
            (result.lag - period as i32).abs() <= 3,
            "found lag {} for period {}",
            result.lag,
            period
        );
        assert!(result.correlation > 0.8);
    }

    #[test]
    fn test_noise_is_unvoiced() {
        let cfg = FrameConfig::new(8, 20);
        let mut seed = 1_u32;
        let buf: Vec<f32> = (0..cfg.max_lag() as usize + 16 + cfg.frame_len())
            .map(|_| {
                seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                (seed >> 16) as f32 / 32768.0 - 1.0
            })
            .collect();

        let result = pitch_analysis(&buf, &cfg, 0);
        assert!(!result.voiced, "white noise classified voiced");
    }

    #[test]
    fn test_contoured_lags_stay_in_range() {
        let cfg = FrameConfig::new(8, 20);
        for contour in 0..contour_count(cfg.nb_subfr) {
            let lags = apply_contour(&cfg, cfg.min_lag(), contour);
            (0..cfg.nb_subfr).for_each(|s| {
                assert!(lags[s] >= cfg.min_lag() && lags[s] <= cfg.max_lag());
            });
        }
    }
}
