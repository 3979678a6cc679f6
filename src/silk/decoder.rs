//! Implements the SILK decoder.

use crate::decoder_error::DecoderError;
use crate::range_coder::RangeDecoder;
use crate::silk::encoder::{dequant_residual, stage2_dist, stage2_icdf};
use crate::silk::gain;
use crate::silk::lpc;
use crate::silk::nsq::{self, NsqState};
use crate::silk::pitch;
use crate::silk::resampler::Resampler;
use crate::silk::tables::*;
use crate::silk::{
    FrameConfig, FrameParams, SignalType, LTP_ORDER, MAX_LPC_ORDER, MAX_NB_SUBFR,
    SHELL_BLOCK_LEN,
};
use crate::{Bandwidth, Channels};

/// Carried per-channel decoding state.
#[derive(Clone, Debug)]
struct ChannelState {
    nsq: NsqState,
    prev_log_gain: i32,
    prev_nlsf_q15: [i16; MAX_LPC_ORDER],
    prev_signal_type: SignalType,
    prev_lag: i32,
    /// Last frame's parameters, kept for concealment.
    last_params: FrameParams,
    last_a_q12: [i16; MAX_LPC_ORDER],
    loss_count: u32,
    decoded_in_packet: bool,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            nsq: NsqState::default(),
            prev_log_gain: 0,
            prev_nlsf_q15: [0; MAX_LPC_ORDER],
            prev_signal_type: SignalType::NoActivity,
            prev_lag: 0,
            last_params: FrameParams::default(),
            last_a_q12: [0; MAX_LPC_ORDER],
            loss_count: 0,
            decoded_in_packet: false,
        }
    }
}

/// The SILK decoder. Produces 48 kHz PCM from the 8/12/16 kHz internal
/// decode.
#[derive(Clone, Debug)]
pub(crate) struct SilkDecoder {
    channels: usize,
    fs_khz: usize,
    resamplers: Vec<Resampler>,
    state: Vec<ChannelState>,
    stereo_weight_q13: i32,
}

impl SilkDecoder {
    pub(crate) fn new(channels: Channels) -> Result<Self, DecoderError> {
        let channels = channels as usize;
        Ok(Self {
            channels,
            fs_khz: 16,
            resamplers: (0..channels)
                .map(|_| Resampler::new(16000, 48000))
                .collect::<Result<_, _>>()
                .map_err(|_| DecoderError::InternalError("resampler construction failed"))?,
            state: (0..channels).map(|_| ChannelState::new()).collect(),
            stereo_weight_q13: 0,
        })
    }

    pub(crate) fn reset(&mut self) -> Result<(), DecoderError> {
        self.state.iter_mut().for_each(|s| *s = ChannelState::new());
        self.resamplers.iter_mut().for_each(|r| r.reset());
        self.stereo_weight_q13 = 0;
        Ok(())
    }

    pub(crate) fn set_bandwidth(&mut self, bandwidth: Bandwidth) -> Result<(), DecoderError> {
        let fs_khz = match bandwidth {
            Bandwidth::Narrowband => 8,
            Bandwidth::Mediumband => 12,
            _ => 16,
        };
        if fs_khz != self.fs_khz {
            self.fs_khz = fs_khz;
            self.resamplers = (0..self.channels)
                .map(|_| Resampler::new(fs_khz as u32 * 1000, 48000))
                .collect::<Result<_, _>>()
                .map_err(|_| DecoderError::InternalError("resampler construction failed"))?;
            self.state.iter_mut().for_each(|s| *s = ChannelState::new());
        }
        Ok(())
    }

    /// The pitch of the last decoded frame at 48 kHz.
    pub(crate) fn pitch(&self) -> u32 {
        (self.state[0].prev_lag * 48 / self.fs_khz as i32).max(0) as u32
    }

    /// Decodes `frame_ms` worth of payload into 48 kHz PCM (interleaved when
    /// stereo). `None` runs concealment.
    ///
    /// With `decode_fec` set, the LBRR data of this packet replaces the
    /// regular decode; when no LBRR is present the frame is concealed.
    pub(crate) fn decode(
        &mut self,
        dec: Option<&mut RangeDecoder<'_>>,
        frame_ms: usize,
        out48: &mut [i16],
        decode_fec: bool,
    ) -> Result<usize, DecoderError> {
        let dec = match dec {
            Some(dec) => dec,
            None => return self.conceal(frame_ms, out48),
        };

        let n_frames = if frame_ms <= 20 { 1 } else { frame_ms / 20 };
        let internal_ms = if frame_ms < 20 { frame_ms } else { 20 };
        let cfg = FrameConfig::new(self.fs_khz, internal_ms);
        let frame_len = cfg.frame_len();

        // Header flags.
        let mut vad = vec![[false; 3]; self.channels];
        let mut lbrr = vec![false; self.channels];
        for c in 0..self.channels {
            for f in 0..n_frames {
                vad[c][f] = dec.decode_bit_logp(1);
            }
            lbrr[c] = dec.decode_bit_logp(1);
        }

        // LBRR frames.
        let mut lbrr_frames: Vec<(FrameParams, [i16; MAX_LPC_ORDER])> = Vec::new();
        if lbrr.iter().any(|&b| b) {
            let mask = if n_frames == 1 {
                1
            } else {
                let icdf: &[u8] = if n_frames == 2 {
                    &LBRR_FLAGS_2_ICDF
                } else {
                    &LBRR_FLAGS_3_ICDF
                };
                dec.decode_icdf(icdf, 8) as usize + 1
            };
            let mut prev_log_gain = 0;
            for f in 0..n_frames {
                if mask & (1 << f) != 0 {
                    let (params, a) =
                        decode_frame_params(dec, &cfg, true, false, &mut prev_log_gain, 0)?;
                    lbrr_frames.push((params, a));
                }
            }
        }

        if decode_fec {
            // Use the redundancy as this packet's output; fall back to
            // concealment when it isn't there.
            if lbrr_frames.is_empty() {
                log::debug!("fec requested but no lbrr data, concealing");
                return self.conceal(frame_ms, out48);
            }
            let mut internal = vec![0_i16; frame_len * n_frames];
            for (f, (params, a)) in lbrr_frames.iter().enumerate().take(n_frames) {
                let state = &mut self.state[0];
                nsq::decode_frame(
                    &mut state.nsq,
                    &cfg,
                    params,
                    a,
                    a,
                    &mut internal[f * frame_len..(f + 1) * frame_len],
                );
                state.loss_count = 0;
            }
            return self.resample_out(&internal, &internal, out48);
        }

        // Stereo weights and the mid-only flag.
        let mut mid_only = false;
        if self.channels == 2 {
            let joint = dec.decode_icdf(&STEREO_WEIGHT_STAGE1_ICDF, 8) as usize;
            let fine = dec.decode_icdf(&STEREO_WEIGHT_STAGE2_ICDF, 8) as usize;
            let _step = dec.decode_icdf(&STEREO_WEIGHT_STAGE3_ICDF, 8);
            let idx = usize::min((joint / 5) * 3 + fine, 14);
            self.stereo_weight_q13 = i32::from(STEREO_PRED_QUANT_Q13[idx]);
            mid_only = dec.decode_icdf(&STEREO_MID_ONLY_ICDF, 8) != 0;
        }

        // Regular frames.
        self.state
            .iter_mut()
            .for_each(|s| s.decoded_in_packet = false);
        let mut internal = vec![vec![0_i16; frame_len * n_frames]; self.channels];
        for f in 0..n_frames {
            for c in 0..self.channels {
                let conditional = self.state[c].decoded_in_packet;
                let mut prev_log_gain = self.state[c].prev_log_gain;
                let (params, a_q12) = decode_frame_params(
                    dec,
                    &cfg,
                    vad[c][f],
                    conditional,
                    &mut prev_log_gain,
                    self.state[c].prev_lag,
                )?;

                let state = &mut self.state[c];
                nsq::decode_frame(
                    &mut state.nsq,
                    &cfg,
                    &params,
                    &a_q12,
                    &a_q12,
                    &mut internal[c][f * frame_len..(f + 1) * frame_len],
                );

                state.prev_log_gain = prev_log_gain;
                state.prev_nlsf_q15 = params.nlsf_q15;
                state.prev_signal_type = params.signal_type;
                state.prev_lag = if params.signal_type == SignalType::Voiced {
                    params.pitch_base
                } else {
                    0
                };
                state.last_params = params;
                state.last_a_q12 = a_q12;
                state.loss_count = 0;
                state.decoded_in_packet = true;
            }
        }

        // Stereo unmix.
        if self.channels == 2 {
            let w = self.stereo_weight_q13;
            let (mid, side) = internal.split_at_mut(1);
            let mid = &mid[0];
            let side = &mut side[0];
            if mid_only {
                side.iter_mut().for_each(|v| *v = 0);
            }
            let mut left = vec![0_i16; mid.len()];
            let mut right = vec![0_i16; mid.len()];
            (0..mid.len()).for_each(|i| {
                let m = i32::from(mid[i]);
                let pred = ((i64::from(m) * i64::from(w)) >> 13) as i32;
                let s_full = i32::from(side[i]) + pred;
                left[i] = (m + s_full).max(-32768).min(32767) as i16;
                right[i] = (m - s_full).max(-32768).min(32767) as i16;
            });
            let l = left;
            let r = right;
            return self.resample_out(&l, &r, out48);
        }

        let mono = internal[0].clone();
        self.resample_out(&mono, &mono, out48)
    }

    /// Resamples the internal-rate channels up to interleaved 48 kHz.
    fn resample_out(
        &mut self,
        left: &[i16],
        right: &[i16],
        out48: &mut [i16],
    ) -> Result<usize, DecoderError> {
        let factor = 48 / self.fs_khz;
        let samples48 = left.len() * factor;
        if out48.len() < samples48 * self.channels {
            return Err(DecoderError::BufferTooSmall);
        }

        let mut tmp = vec![0_i16; samples48];
        let produced = self.resamplers[0].process(left, &mut tmp);
        debug_assert_eq!(produced, samples48);
        if self.channels == 1 {
            out48[..samples48].copy_from_slice(&tmp);
        } else {
            (0..samples48).for_each(|i| out48[2 * i] = tmp[i]);
            let produced = self.resamplers[1].process(right, &mut tmp);
            debug_assert_eq!(produced, samples48);
            (0..samples48).for_each(|i| out48[2 * i + 1] = tmp[i]);
        }
        Ok(samples48)
    }

    /// Pitch-based extrapolation concealment: re-run the synthesis with the
    /// last frame's parameters, no pulses and decaying gains.
    fn conceal(&mut self, frame_ms: usize, out48: &mut [i16]) -> Result<usize, DecoderError> {
        let n_frames = if frame_ms <= 20 { 1 } else { frame_ms / 20 };
        let internal_ms = if frame_ms < 20 { frame_ms } else { 20 };
        let cfg = FrameConfig::new(self.fs_khz, internal_ms);
        let frame_len = cfg.frame_len();

        log::debug!(
            "silk concealment, loss_count = {}",
            self.state[0].loss_count
        );

        let mut internal = vec![vec![0_i16; frame_len * n_frames]; self.channels];
        for c in 0..self.channels {
            let state = &mut self.state[c];
            let mut params = state.last_params.clone();
            params.pulses = [0; crate::silk::MAX_FRAME_LEN];
            params.seed = (state.loss_count & 3) as i32;

            // Fade towards silence over consecutive losses.
            let decay = match state.loss_count {
                0 => 0.98_f32,
                1 => 0.9,
                2 => 0.8,
                _ => 0.6,
            };
            params
                .gains_q16
                .iter_mut()
                .for_each(|g| *g = ((*g as f32) * decay) as i32);

            let a = state.last_a_q12;
            for f in 0..n_frames {
                nsq::decode_frame(
                    &mut state.nsq,
                    &cfg,
                    &params,
                    &a,
                    &a,
                    &mut internal[c][f * frame_len..(f + 1) * frame_len],
                );
            }
            state.last_params.gains_q16 = params.gains_q16;
            state.loss_count += 1;
        }

        if self.channels == 2 {
            let l = internal[0].clone();
            let r = internal[1].clone();
            self.resample_out(&l, &r, out48)
        } else {
            let mono = internal[0].clone();
            self.resample_out(&mono, &mono, out48)
        }
    }
}

/// Decodes one frame's parameter stream. The exact mirror of the encoder's
/// `encode_frame_params_full`.
pub(crate) fn decode_frame_params(
    dec: &mut RangeDecoder<'_>,
    cfg: &FrameConfig,
    vad: bool,
    conditional: bool,
    prev_log_gain: &mut i32,
    prev_lag: i32,
) -> Result<(FrameParams, [i16; MAX_LPC_ORDER]), DecoderError> {
    let mut params = FrameParams::default();

    // Frame type.
    if vad {
        match dec.decode_icdf(&FRAME_TYPE_ACTIVE_ICDF, 8) {
            0 => {
                params.signal_type = SignalType::Unvoiced;
                params.quant_offset = 0;
            }
            1 => {
                params.signal_type = SignalType::Unvoiced;
                params.quant_offset = 1;
            }
            2 => {
                params.signal_type = SignalType::Voiced;
                params.quant_offset = 0;
            }
            _ => {
                params.signal_type = SignalType::Voiced;
                params.quant_offset = 1;
            }
        }
    } else {
        params.signal_type = SignalType::NoActivity;
        params.quant_offset = dec.decode_icdf(&FRAME_TYPE_INACTIVE_ICDF, 8) as usize;
    }
    let voiced = params.signal_type == SignalType::Voiced;

    // Gains.
    for s in 0..cfg.nb_subfr {
        if s == 0 && !conditional {
            let msb = dec.decode_icdf(&GAIN_MSB_ICDF[params.signal_type.index()], 8) as i32;
            let lsb = dec.decode_icdf(&GAIN_LSB_ICDF, 8) as i32;
            *prev_log_gain = (msb << 3) | lsb;
        } else {
            let delta = dec.decode_icdf(&GAIN_DELTA_ICDF, 8) as i32;
            *prev_log_gain = gain::apply_delta(*prev_log_gain, delta);
        }
        params.gain_indices[s] = *prev_log_gain;
        params.gains_q16[s] = gain::dequant_gain_q16(*prev_log_gain);
    }

    // NLSF.
    let wb = cfg.lpc_order == MAX_LPC_ORDER;
    let s1_ctx = usize::from(voiced) | (usize::from(wb) << 1);
    let s1 = dec.decode_icdf(&NLSF_STAGE1_ICDF[s1_ctx], 8) as usize;

    let mut residual_indices = [0_i32; MAX_LPC_ORDER];
    for i in 0..cfg.lpc_order {
        let dist = stage2_dist(wb, s1, i);
        let sym = dec.decode_icdf(stage2_icdf(wb, dist), 8) as i32 - 4;
        residual_indices[i] = if sym == -4 {
            sym - dec.decode_icdf(&NLSF_EXT_ICDF, 8) as i32
        } else if sym == 4 {
            sym + dec.decode_icdf(&NLSF_EXT_ICDF, 8) as i32
        } else {
            sym
        };
    }

    // Residual dequantization with backwards prediction, then the vector.
    let step_q16 = if wb { NLSF_STEP_Q16_WB } else { NLSF_STEP_Q16_NB };
    let mut res_q10 = [0_i32; MAX_LPC_ORDER];
    for i in (0..cfg.lpc_order).rev() {
        let pred = if i + 1 < cfg.lpc_order {
            (res_q10[i + 1] * i32::from(pred_weight_dec(wb, s1, i))) >> 8
        } else {
            0
        };
        res_q10[i] = dequant_residual(residual_indices[i], step_q16) + pred;
    }
    for i in 0..cfg.lpc_order {
        let cb = i32::from(if wb {
            NLSF_CB1_WB[s1][i]
        } else {
            NLSF_CB1_NB[s1][i]
        }) << 7;
        params.nlsf_q15[i] = (cb + (res_q10[i] << 5)).max(0).min(32767) as i16;
    }
    lpc::stabilize_nlsf(&mut params.nlsf_q15[..cfg.lpc_order]);

    let mut a_q12 = [0_i16; MAX_LPC_ORDER];
    lpc::nlsf_to_lpc(&params.nlsf_q15[..cfg.lpc_order], &mut a_q12);

    // Interpolation index.
    if cfg.nb_subfr == MAX_NB_SUBFR {
        params.interp_index = dec.decode_icdf(&NLSF_INTERP_ICDF, 8) as usize;
    }

    if voiced {
        // Pitch lag.
        let mut lag = 0_i32;
        let mut absolute = true;
        if conditional && prev_lag > 0 {
            let sym = dec.decode_icdf(&PITCH_DELTA_ICDF, 8) as i32;
            if sym > 0 {
                lag = prev_lag + sym - 10;
                absolute = false;
            }
        }
        if absolute {
            let low_size = cfg.lag_low_size();
            let msb = dec.decode_icdf(&PITCH_LAG_MSB_ICDF, 8);
            let low = dec.decode_uint(low_size);
            lag = cfg.min_lag() + (msb * low_size + low) as i32;
        }
        lag = lag.max(cfg.min_lag()).min(cfg.max_lag());
        params.pitch_base = lag;

        let contour_icdf: &[u8] = if cfg.nb_subfr == 2 {
            &PITCH_CONTOUR_10MS_ICDF
        } else {
            &PITCH_CONTOUR_20MS_ICDF
        };
        params.pitch_contour = dec.decode_icdf(contour_icdf, 8) as usize;
        params.pitch_lags = pitch::apply_contour(cfg, lag, params.pitch_contour);

        // LTP filters.
        let per_index = dec.decode_icdf(&LTP_PER_INDEX_ICDF, 8) as usize;
        for s in 0..cfg.nb_subfr {
            let (idx, table): (usize, &[[i8; LTP_ORDER]]) = match per_index {
                0 => (
                    dec.decode_icdf(&LTP_GAIN_ICDF_0, 8) as usize,
                    &LTP_GAIN_VQ_0,
                ),
                1 => (
                    dec.decode_icdf(&LTP_GAIN_ICDF_1, 8) as usize,
                    &LTP_GAIN_VQ_1,
                ),
                _ => (
                    dec.decode_icdf(&LTP_GAIN_ICDF_2, 8) as usize,
                    &LTP_GAIN_VQ_2,
                ),
            };
            params.ltp_filters[s] = table[idx];
        }
        let scale_idx = dec.decode_icdf(&LTP_SCALE_ICDF, 8) as usize;
        params.ltp_scale_q14 = i32::from(LTP_SCALES_Q14[scale_idx]);
    }

    // Dither seed.
    params.seed = dec.decode_uint(4) as i32;

    // Excitation.
    decode_excitation(dec, cfg, &mut params);

    Ok((params, a_q12))
}

fn pred_weight_dec(wb: bool, s1: usize, i: usize) -> u8 {
    if wb {
        if i < 15 {
            NLSF_PRED_WB[NLSF_PRED_SELECT_WB[s1][i] as usize][i]
        } else {
            0
        }
    } else if i < 9 {
        NLSF_PRED_NB[NLSF_PRED_SELECT_NB[s1][i] as usize][i]
    } else {
        0
    }
}

/// Decodes the excitation: rate level, pulse counts with LSB extension,
/// shell positions, LSB planes and signs.
fn decode_excitation(dec: &mut RangeDecoder<'_>, cfg: &FrameConfig, params: &mut FrameParams) {
    let frame_len = cfg.frame_len();
    let n_blocks = frame_len / SHELL_BLOCK_LEN;
    let voiced = params.signal_type == SignalType::Voiced;

    let rate_level = dec.decode_icdf(&RATE_LEVEL_ICDF[usize::from(voiced)], 8) as usize;

    for b in 0..n_blocks {
        // Pulse count with escape coding.
        let mut lsb_count = 0;
        let mut table: &[u8] = &PULSE_COUNT_ICDF[rate_level];
        let total = loop {
            let sym = dec.decode_icdf(table, 8) as usize;
            if sym < 17 {
                break sym as u32;
            }
            lsb_count += 1;
            table = &PULSE_COUNT_ICDF[10];
        };

        // Positions.
        let mut magnitudes = [0_u32; SHELL_BLOCK_LEN];
        if total > 0 {
            shell_decode(dec, total, &mut magnitudes);
        }

        // LSB planes, most significant first.
        if lsb_count > 0 {
            magnitudes.iter_mut().for_each(|m| {
                (0..lsb_count).for_each(|_| {
                    let bit = dec.decode_icdf(&EXC_LSB_ICDF, 8);
                    *m = (*m << 1) | bit;
                });
            });
        }

        // Signs.
        let sign_p =
            SIGN_P[params.signal_type.index()][params.quant_offset][usize::min(total as usize, 6)];
        (0..SHELL_BLOCK_LEN).for_each(|i| {
            let idx = b * SHELL_BLOCK_LEN + i;
            let m = magnitudes[i];
            if m > 0 {
                let icdf = [sign_p, 0];
                let negative = dec.decode_icdf(&icdf, 8) != 0;
                params.pulses[idx] = if negative { -(m as i16) } else { m as i16 };
            } else {
                params.pulses[idx] = 0;
            }
        });
    }
}

/// Splits a partition's pulse count into its halves, recursively.
fn shell_decode(dec: &mut RangeDecoder<'_>, total: u32, out: &mut [u32]) {
    if total == 0 {
        out.iter_mut().for_each(|v| *v = 0);
        return;
    }
    if out.len() == 1 {
        out[0] = total;
        return;
    }
    let half = out.len() / 2;
    let left = dec.decode_icdf(
        &SHELL_SPLIT_ICDF[(total - 1) as usize][..(total + 1) as usize],
        8,
    );
    let (lo, hi) = out.split_at_mut(half);
    shell_decode(dec, left, lo);
    shell_decode(dec, total - left, hi);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::range_coder::{RangeDecoder, RangeEncoder};
    use crate::silk::encoder::encode_excitation;

    #[test]
    fn test_excitation_round_trip() {
        let cfg = FrameConfig::new(16, 20);
        let mut buffer = vec![0_u8; 1275];

        let mut params = FrameParams {
            signal_type: SignalType::Unvoiced,
            ..FrameParams::default()
        };
        // A mix of small and large pulses exercising the LSB extension.
        let pattern: [i16; 8] = [0, 1, -2, 0, 25, -1, 3, 0];
        (0..cfg.frame_len()).for_each(|i| {
            params.pulses[i] = pattern[i % pattern.len()];
        });

        let mut enc = RangeEncoder::new(&mut buffer);
        encode_excitation(&mut enc, &cfg, &params).unwrap();
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        let mut decoded = FrameParams {
            signal_type: SignalType::Unvoiced,
            ..FrameParams::default()
        };
        decode_excitation(&mut dec, &cfg, &mut decoded);

        (0..cfg.frame_len()).for_each(|i| {
            assert_eq!(
                decoded.pulses[i], params.pulses[i],
                "pulse {} differs",
                i
            );
        });
    }

    #[test]
    fn test_shell_split_covers_all_totals() {
        let mut buffer = vec![0_u8; 256];
        for total in 1..=16_u32 {
            let mut magnitudes = [0_u32; SHELL_BLOCK_LEN];
            magnitudes[0] = total / 2;
            magnitudes[SHELL_BLOCK_LEN - 1] = total - total / 2;

            let mut enc = RangeEncoder::new(&mut buffer);
            crate::silk::encoder::shell_encode(&mut enc, &magnitudes).unwrap();
            enc.done().unwrap();
            drop(enc);

            let mut dec = RangeDecoder::new(&buffer);
            let mut out = [0_u32; SHELL_BLOCK_LEN];
            shell_decode(&mut dec, total, &mut out);
            assert_eq!(out, magnitudes, "total {}", total);
        }
    }
}
