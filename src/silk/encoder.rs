//! Implements the SILK encoder.

use crate::encoder_error::EncoderError;
use crate::range_coder::RangeEncoder;
use crate::silk::gain;
use crate::silk::lpc;
use crate::silk::nsq::{self, NsqState, SubframeFilters};
use crate::silk::pitch::{self, PitchResult};
use crate::silk::resampler::Resampler;
use crate::silk::tables::*;
use crate::silk::{
    FrameConfig, FrameParams, SignalType, LTP_ORDER, MAX_LPC_ORDER, MAX_NB_SUBFR,
    MAX_PITCH_LAG_MS, SHAPE_ORDER, SHELL_BLOCK_LEN,
};
use crate::{Bandwidth, Channels};

/// Carried per-channel coding state.
#[derive(Clone, Debug)]
struct ChannelState {
    nsq: NsqState,
    prev_log_gain: i32,
    prev_nlsf_q15: [i16; MAX_LPC_ORDER],
    prev_signal_type: SignalType,
    prev_lag: i32,
    /// Input history at the internal rate for pitch and whitening.
    x_buf: Vec<i16>,
    /// Whether the previous frame in this packet coded its first gain
    /// conditionally.
    coded_in_packet: bool,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            nsq: NsqState::default(),
            prev_log_gain: 0,
            prev_nlsf_q15: [0; MAX_LPC_ORDER],
            prev_signal_type: SignalType::NoActivity,
            prev_lag: 0,
            x_buf: vec![0; MAX_PITCH_LAG_MS * 16 + 16 + 320],
            coded_in_packet: false,
        }
    }
}

/// The SILK encoder. Consumes 48 kHz PCM, codes at 8, 12 or 16 kHz
/// internally.
#[derive(Clone, Debug)]
pub(crate) struct SilkEncoder {
    channels: usize,
    fs_khz: usize,
    resamplers: Vec<Resampler>,
    state: Vec<ChannelState>,
    /// In-band FEC: re-encode each frame at reduced quality for the next
    /// packet.
    lbrr_enabled: bool,
    packet_loss_perc: u8,
    complexity: u8,
    bitrate_bps: u32,
    /// Pending LBRR payload parameters from the previous packet's frames.
    lbrr_pending: Vec<FrameParams>,
    lbrr_cfg: Option<FrameConfig>,
    /// LTP coding context of the frame being coded.
    ltp_per_index: usize,
    ltp_indices: [usize; MAX_NB_SUBFR],
    frame_counter: u64,
}

impl SilkEncoder {
    pub(crate) fn new(channels: Channels) -> Result<Self, EncoderError> {
        let channels = channels as usize;
        Ok(Self {
            channels,
            fs_khz: 16,
            resamplers: (0..channels)
                .map(|_| Resampler::new(48000, 16000))
                .collect::<Result<_, _>>()?,
            state: (0..channels).map(|_| ChannelState::new()).collect(),
            lbrr_enabled: false,
            packet_loss_perc: 0,
            complexity: 5,
            bitrate_bps: 32_000,
            lbrr_pending: Vec::new(),
            lbrr_cfg: None,
            ltp_per_index: 0,
            ltp_indices: [0; MAX_NB_SUBFR],
            frame_counter: 0,
        })
    }

    pub(crate) fn reset(&mut self) {
        self.state.iter_mut().for_each(|s| *s = ChannelState::new());
        self.resamplers.iter_mut().for_each(|r| r.reset());
        self.lbrr_pending.clear();
        self.lbrr_cfg = None;
    }

    pub(crate) fn set_packet_loss_perc(&mut self, perc: u8) {
        self.packet_loss_perc = perc;
        self.lbrr_enabled = perc > 0;
    }

    pub(crate) fn set_complexity(&mut self, complexity: u8) {
        self.complexity = complexity;
    }

    pub(crate) fn set_bitrate(&mut self, bitrate_bps: u32) {
        self.bitrate_bps = bitrate_bps;
    }

    pub(crate) fn set_bandwidth(&mut self, bandwidth: Bandwidth) -> Result<(), EncoderError> {
        let fs_khz = match bandwidth {
            Bandwidth::Narrowband => 8,
            Bandwidth::Mediumband => 12,
            _ => 16,
        };
        if fs_khz != self.fs_khz {
            self.fs_khz = fs_khz;
            self.resamplers = (0..self.channels)
                .map(|_| Resampler::new(48000, fs_khz as u32 * 1000))
                .collect::<Result<_, _>>()?;
            self.state.iter_mut().for_each(|s| *s = ChannelState::new());
            self.lbrr_pending.clear();
        }
        Ok(())
    }

    pub(crate) fn pitch(&self) -> u32 {
        // Report at 48 kHz.
        (self.state[0].prev_lag * 48 / self.fs_khz as i32).max(0) as u32
    }

    /// Encodes `frame_ms` of 48 kHz PCM into the given range encoder.
    /// Packets longer than 20 ms carry several internal frames.
    pub(crate) fn encode(
        &mut self,
        enc: &mut RangeEncoder<'_>,
        pcm48: &[i16],
        frame_ms: usize,
    ) -> Result<(), EncoderError> {
        let n_frames = if frame_ms <= 20 { 1 } else { frame_ms / 20 };
        let internal_ms = if frame_ms < 20 { frame_ms } else { 20 };
        let cfg = FrameConfig::new(self.fs_khz, internal_ms);
        let frame_len = cfg.frame_len();
        let samples48 = frame_ms * 48;

        // Resample the whole packet's input per channel.
        let mut internal = vec![vec![0_i16; self.fs_khz * frame_ms]; self.channels];
        for c in 0..self.channels {
            let mono: Vec<i16> = if self.channels == 2 {
                (0..samples48).map(|i| pcm48[2 * i + c]).collect()
            } else {
                pcm48.to_vec()
            };
            let produced = self.resamplers[c].process(&mono, &mut internal[c]);
            debug_assert_eq!(produced, self.fs_khz * frame_ms);
        }

        // Stereo runs as mid/side with a coded side-from-mid predictor; the
        // weight indices are coded after the header flags.
        let mut stereo_coding: Option<(usize, usize, bool)> = None;
        if self.channels == 2 {
            let (mid, side): (Vec<i16>, Vec<i16>) = internal[0]
                .iter()
                .zip(internal[1].iter())
                .map(|(&l, &r)| {
                    let m = (i32::from(l) + i32::from(r)) >> 1;
                    let sd = (i32::from(l) - i32::from(r)) >> 1;
                    (m as i16, sd as i16)
                })
                .unzip();

            // Least-squares side-from-mid predictor, quantized in Q13.
            let num: i64 = mid
                .iter()
                .zip(side.iter())
                .map(|(&m, &sv)| i64::from(m) * i64::from(sv))
                .sum();
            let den: i64 = mid.iter().map(|&m| i64::from(m) * i64::from(m)).sum::<i64>() + 1;
            let w_q13 = ((num << 13) / den).max(-13732).min(13732) as i32;

            let mut best_idx = 0;
            let mut best_err = i32::MAX;
            STEREO_PRED_QUANT_Q13
                .iter()
                .take(15)
                .enumerate()
                .for_each(|(i, &q)| {
                    let err = (w_q13 - i32::from(q)).abs();
                    if err < best_err {
                        best_err = err;
                        best_idx = i;
                    }
                });

            let w = i32::from(STEREO_PRED_QUANT_Q13[best_idx]);
            let residual: Vec<i16> = mid
                .iter()
                .zip(side.iter())
                .map(|(&m, &sv)| {
                    let pred = (i64::from(m) * i64::from(w) >> 13) as i32;
                    (i32::from(sv) - pred).max(-32768).min(32767) as i16
                })
                .collect();

            let side_energy: i64 = residual
                .iter()
                .map(|&v| i64::from(v) * i64::from(v))
                .sum();
            let mid_only = side_energy < (mid.len() as i64) * 4;

            internal[0] = mid;
            internal[1] = if mid_only {
                vec![0; residual.len()]
            } else {
                residual
            };
            stereo_coding = Some((best_idx / 3, best_idx % 3, mid_only));
        }

        // Analyze every frame up front so the header flags can be coded
        // before any frame payload.
        let mut analyses: Vec<Vec<FrameAnalysis>> = Vec::with_capacity(self.channels);
        for c in 0..self.channels {
            let mut per_frame = Vec::with_capacity(n_frames);
            for f in 0..n_frames {
                let x = &internal[c][f * frame_len..(f + 1) * frame_len];
                per_frame.push(self.analyze_frame(c, &cfg, x));
            }
            analyses.push(per_frame);
        }

        // Header: VAD flags then the LBRR flag, per channel. The pending
        // redundancy must match this packet's layout to be usable.
        let send_lbrr = self.lbrr_enabled
            && self.lbrr_pending.len() == n_frames
            && self
                .lbrr_cfg
                .map_or(false, |c| c.fs_khz == cfg.fs_khz && c.nb_subfr == cfg.nb_subfr);
        for c in 0..self.channels {
            for f in 0..n_frames {
                let vad = analyses[c][f].signal_type != SignalType::NoActivity;
                enc.encode_bit_logp(u32::from(vad), 1)?;
            }
            enc.encode_bit_logp(u32::from(send_lbrr && c == 0), 1)?;
        }

        // LBRR payload: the previous packet's frames at reduced rate.
        if send_lbrr {
            let lbrr_cfg = self.lbrr_cfg.unwrap_or(cfg);
            let frames: Vec<FrameParams> = self.lbrr_pending.drain(..).collect();
            if frames.len() > 1 {
                let mask = (1 << frames.len()) - 1;
                let icdf: &[u8] = if frames.len() == 2 {
                    &LBRR_FLAGS_2_ICDF
                } else {
                    &LBRR_FLAGS_3_ICDF
                };
                enc.encode_icdf(mask - 1, icdf, 8)?;
            }
            let mut prev_log_gain = 0;
            for params in frames.iter() {
                encode_frame_params(enc, &lbrr_cfg, params, false, &mut prev_log_gain, 0)?;
            }
        }

        // Stereo prediction weight and mid-only flag.
        if let Some((coarse, fine, mid_only)) = stereo_coding {
            enc.encode_icdf(coarse * 5, &STEREO_WEIGHT_STAGE1_ICDF, 8)?;
            enc.encode_icdf(fine, &STEREO_WEIGHT_STAGE2_ICDF, 8)?;
            enc.encode_icdf(2, &STEREO_WEIGHT_STAGE3_ICDF, 8)?;
            enc.encode_icdf(usize::from(mid_only), &STEREO_MID_ONLY_ICDF, 8)?;
        }

        // Regular frames.
        self.state.iter_mut().for_each(|s| s.coded_in_packet = false);
        let mut lbrr_next: Vec<FrameParams> = Vec::new();
        for f in 0..n_frames {
            for c in 0..self.channels {
                let analysis = analyses[c][f].clone();
                let x: Vec<i16> =
                    internal[c][f * frame_len..(f + 1) * frame_len].to_vec();
                let params = self.encode_channel_frame(enc, c, &cfg, &x, analysis)?;
                if self.lbrr_enabled && c == 0 {
                    lbrr_next.push(params);
                }
            }
        }
        if self.lbrr_enabled {
            self.lbrr_pending = lbrr_next;
            self.lbrr_cfg = Some(cfg);
        }

        Ok(())
    }

    /// Signal classification, pitch and LPC analysis for one frame.
    fn analyze_frame(&mut self, c: usize, cfg: &FrameConfig, x: &[i16]) -> FrameAnalysis {
        let frame_len = cfg.frame_len();
        let state = &mut self.state[c];

        // Maintain the analysis history buffer.
        let keep = state.x_buf.len() - frame_len;
        state.x_buf.copy_within(frame_len.., 0);
        state.x_buf[keep..].copy_from_slice(x);

        let fbuf: Vec<f32> = state.x_buf.iter().map(|&v| f32::from(v) / 32768.0).collect();

        // Activity from short-term energy.
        let energy: f32 =
            fbuf[keep..].iter().map(|v| v * v).sum::<f32>() / frame_len as f32;
        let active = energy > 1e-6;

        let pitch_result = if active {
            pitch::pitch_analysis(&fbuf, cfg, state.prev_lag)
        } else {
            PitchResult::unvoiced()
        };

        let signal_type = if !active {
            SignalType::NoActivity
        } else if pitch_result.voiced {
            SignalType::Voiced
        } else {
            SignalType::Unvoiced
        };

        // LPC analysis over the frame plus one subframe of history.
        let look_back = cfg.subfr_len();
        let mut a = [0.0_f32; MAX_LPC_ORDER];
        lpc::burg(&fbuf[keep - look_back..], cfg.lpc_order, &mut a);
        lpc::bandwidth_expand(&mut a[..cfg.lpc_order], 0.999);
        lpc::ensure_stable(&mut a[..cfg.lpc_order]);

        FrameAnalysis {
            signal_type,
            pitch: pitch_result,
            a,
            energy,
        }
    }

    /// Quantizes and codes one channel frame, returning the coded parameters
    /// (reused for LBRR).
    fn encode_channel_frame(
        &mut self,
        enc: &mut RangeEncoder<'_>,
        c: usize,
        cfg: &FrameConfig,
        x: &[i16],
        analysis: FrameAnalysis,
    ) -> Result<FrameParams, EncoderError> {
        let mut params = FrameParams::default();
        params.signal_type = analysis.signal_type;
        params.quant_offset = usize::from(analysis.energy > 1e-3);

        // NLSF quantization.
        let mut nlsf_target = [0_i16; MAX_LPC_ORDER];
        lpc::lpc_to_nlsf(&analysis.a[..cfg.lpc_order], &mut nlsf_target);
        let voiced = params.signal_type == SignalType::Voiced;
        let (s1, residual_indices, nlsf_q15) =
            quantize_nlsf(cfg, &nlsf_target[..cfg.lpc_order]);
        params.nlsf_q15[..cfg.lpc_order].copy_from_slice(&nlsf_q15[..cfg.lpc_order]);
        params.interp_index = 4;

        let mut a_q12 = [0_i16; MAX_LPC_ORDER];
        lpc::nlsf_to_lpc(&params.nlsf_q15[..cfg.lpc_order], &mut a_q12);

        // Pitch and LTP.
        if voiced {
            params.pitch_base = analysis.pitch.lag;
            params.pitch_contour = analysis.pitch.contour;
            params.pitch_lags = analysis.pitch.lags;
            let per_index = if analysis.pitch.correlation > 0.8 {
                2
            } else if analysis.pitch.correlation > 0.6 {
                1
            } else {
                0
            };
            let ltp = select_ltp_filters(per_index, analysis.pitch.correlation, cfg.nb_subfr);
            params.ltp_filters = ltp.1;
            params.ltp_scale_q14 = i32::from(LTP_SCALES_Q14[ltp_scale_index(
                self.packet_loss_perc,
            )]);
            self.ltp_per_index = per_index;
            self.ltp_indices = ltp.0;
        } else {
            self.ltp_per_index = 0;
            self.ltp_indices = [0; MAX_NB_SUBFR];
        }

        // Per-subframe gains from the residual energy, scaled so the pulse
        // density matches the bit budget: louder gains mean fewer pulses.
        let subfr_len = cfg.subfr_len();
        let frame_bits = (self.bitrate_bps as f64) * (cfg.nb_subfr * 5) as f64 / 1000.0
            / self.channels as f64;
        let excitation_bits = (frame_bits - 220.0).max(32.0);
        let bits_per_sample = excitation_bits / cfg.frame_len() as f64;
        let pulse_sigma = (0.7 * (bits_per_sample - 1.0).exp2()).max(0.35).min(6.0);
        for s in 0..cfg.nb_subfr {
            let seg = &x[s * subfr_len..(s + 1) * subfr_len];
            let energy: i64 = seg.iter().map(|&v| i64::from(v) * i64::from(v)).sum();
            let rms = ((energy / subfr_len as i64) as f64).sqrt();
            let gain_q16 = ((rms * 65536.0 / pulse_sigma) as i64).max(65536) as i32;
            params.gains_q16[s] = gain_q16;
        }

        params.seed = (self.frame_counter & 3) as i32;
        self.frame_counter = self.frame_counter.wrapping_add(1);

        // Noise shaping filters.
        let filters = derive_shaping(cfg, &analysis, &a_q12, params.quant_offset);

        // Gains are run through the coding rule before quantization so the
        // NSQ sees exactly the values the decoder will reconstruct: the
        // delta coder cannot reach every index from every predecessor.
        {
            let conditional = self.state[c].coded_in_packet;
            let mut prev_lg = self.state[c].prev_log_gain;
            for s in 0..cfg.nb_subfr {
                let target = gain::quant_gain_index(params.gains_q16[s]);
                let coded = if s == 0 && !conditional {
                    target
                } else {
                    gain::apply_delta(prev_lg, gain::best_delta(prev_lg, target))
                };
                params.gain_indices[s] = coded;
                params.gains_q16[s] = gain::dequant_gain_q16(coded);
                prev_lg = coded;
            }
        }

        // Quantize the excitation, advancing the carried state exactly as
        // the decoder will.
        {
            let state = &mut self.state[c];
            if self.complexity >= 8 {
                nsq::quantize_frame_del_dec(
                    &mut state.nsq,
                    cfg,
                    &mut params,
                    &filters,
                    &a_q12,
                    &a_q12,
                    x,
                    4,
                );
            } else {
                nsq::quantize_frame(
                    &mut state.nsq,
                    cfg,
                    &mut params,
                    &filters,
                    &a_q12,
                    &a_q12,
                    x,
                );
            }
        }

        // Entropy-code the parameter stream.
        let conditional = self.state[c].coded_in_packet;
        let mut prev_log_gain = self.state[c].prev_log_gain;
        encode_frame_params_full(
            enc,
            cfg,
            &params,
            conditional,
            &mut prev_log_gain,
            self.state[c].prev_lag,
            s1,
            &residual_indices,
            self.ltp_per_index,
            &self.ltp_indices,
            self.packet_loss_perc,
        )?;

        // Advance the carried coding state.
        let state = &mut self.state[c];
        state.prev_log_gain = prev_log_gain;
        state.prev_nlsf_q15 = params.nlsf_q15;
        state.prev_signal_type = params.signal_type;
        state.prev_lag = if voiced { params.pitch_base } else { 0 };
        state.coded_in_packet = true;

        Ok(params)
    }
}

/// Analysis products of one frame.
#[derive(Clone, Debug)]
struct FrameAnalysis {
    signal_type: SignalType,
    pitch: PitchResult,
    a: [f32; MAX_LPC_ORDER],
    energy: f32,
}

/// The shaping filters: a bandwidth-expanded copy of the prediction filter
/// plus tilt and low-frequency emphasis.
fn derive_shaping(
    cfg: &FrameConfig,
    analysis: &FrameAnalysis,
    a_q12: &[i16; MAX_LPC_ORDER],
    quant_offset: usize,
) -> Vec<SubframeFilters> {
    let mut base = SubframeFilters::default();
    let chirp = 0.84_f32;
    let mut c = chirp;
    (0..cfg.lpc_order.min(SHAPE_ORDER)).for_each(|k| {
        base.ar_shp_q12[k] = ((f32::from(a_q12[k]) * c) as i32)
            .max(-32768)
            .min(32767) as i16;
        c *= chirp;
    });
    base.tilt_q14 = if analysis.signal_type == SignalType::Voiced {
        4915
    } else {
        3277
    };
    base.lf_shp_q14 = 2458;
    base.harm_shape_gain_q14 = if analysis.signal_type == SignalType::Voiced {
        (analysis.pitch.correlation * 8192.0) as i32
    } else {
        0
    };
    base.lambda_q10 = if quant_offset == 0 { 614 } else { 410 };

    vec![base; cfg.nb_subfr]
}

/// LTP codebook search: picks one filter per subframe from the codebook of
/// the given periodicity class.
fn select_ltp_filters(
    per_index: usize,
    correlation: f32,
    nb_subfr: usize,
) -> ([usize; MAX_NB_SUBFR], [[i8; LTP_ORDER]; MAX_NB_SUBFR]) {
    let target = (correlation * 110.0) as i32;
    let mut indices = [0_usize; MAX_NB_SUBFR];
    let mut filters = [[0_i8; LTP_ORDER]; MAX_NB_SUBFR];

    for s in 0..nb_subfr {
        let (idx, taps) = match per_index {
            0 => nearest_ltp(&LTP_GAIN_VQ_0, target),
            1 => nearest_ltp(&LTP_GAIN_VQ_1, target),
            _ => nearest_ltp(&LTP_GAIN_VQ_2, target),
        };
        indices[s] = idx;
        filters[s] = taps;
    }
    (indices, filters)
}

fn nearest_ltp(table: &[[i8; LTP_ORDER]], target: i32) -> (usize, [i8; LTP_ORDER]) {
    let mut best = 0;
    let mut best_err = i32::MAX;
    table.iter().enumerate().for_each(|(i, taps)| {
        let sum: i32 = taps.iter().map(|&t| i32::from(t)).sum();
        let err = (sum - target).abs();
        if err < best_err {
            best_err = err;
            best = i;
        }
    });
    (best, table[best])
}

fn ltp_scale_index(packet_loss_perc: u8) -> usize {
    if packet_loss_perc > 20 {
        2
    } else if packet_loss_perc > 5 {
        1
    } else {
        0
    }
}

/// Stage-one codebook search plus stage-two residual quantization, mirroring
/// the decoder's dequantization exactly.
fn quantize_nlsf(
    cfg: &FrameConfig,
    target: &[i16],
) -> (usize, [i8; MAX_LPC_ORDER], [i16; MAX_LPC_ORDER]) {
    let wb = cfg.lpc_order == MAX_LPC_ORDER;
    let order = cfg.lpc_order;

    // Stage 1: nearest codebook vector, spacing-weighted.
    let mut best_s1 = 0;
    let mut best_err = i64::MAX;
    for s1 in 0..32 {
        let mut err: i64 = 0;
        (0..order).for_each(|i| {
            let cb = i32::from(cb1_value(wb, s1, i)) << 7;
            let d = i64::from(i32::from(target[i]) - cb);
            err += d * d;
        });
        if err < best_err {
            best_err = err;
            best_s1 = s1;
        }
    }

    // Stage 2: back-to-front residual quantization against the backwards
    // prediction, reconstructing exactly like the decoder.
    let step_q16 = if wb { NLSF_STEP_Q16_WB } else { NLSF_STEP_Q16_NB };
    let mut indices = [0_i8; MAX_LPC_ORDER];
    let mut res_q10 = [0_i32; MAX_LPC_ORDER];

    for i in (0..order).rev() {
        let cb = i32::from(cb1_value(wb, best_s1, i)) << 7;
        let target_res_q10 = (i32::from(target[i]) - cb) >> 5;
        let pred = if i + 1 < order {
            (res_q10[i + 1] * i32::from(pred_weight(wb, best_s1, i))) >> 8
        } else {
            0
        };
        let step_q10 = (step_q16 * 1024) >> 16;
        let mut idx = if step_q10 > 0 {
            let num = target_res_q10 - pred;
            (num + if num >= 0 { step_q10 / 2 } else { -step_q10 / 2 }) / step_q10
        } else {
            0
        };
        idx = idx.max(-10).min(10);
        indices[i] = idx as i8;
        res_q10[i] = dequant_residual(idx, step_q16) + pred;
    }

    let mut nlsf = [0_i16; MAX_LPC_ORDER];
    (0..order).for_each(|i| {
        let cb = i32::from(cb1_value(wb, best_s1, i)) << 7;
        let v = (cb + (res_q10[i] << 5)).max(0).min(32767);
        nlsf[i] = v as i16;
    });
    lpc::stabilize_nlsf(&mut nlsf[..order]);

    (best_s1, indices, nlsf)
}

fn cb1_value(wb: bool, s1: usize, i: usize) -> u8 {
    if wb {
        NLSF_CB1_WB[s1][i]
    } else {
        NLSF_CB1_NB[s1][i]
    }
}

fn pred_weight(wb: bool, s1: usize, i: usize) -> u8 {
    if wb {
        if i + 1 < MAX_LPC_ORDER {
            NLSF_PRED_WB[NLSF_PRED_SELECT_WB[s1][i.min(14)] as usize][i.min(14)]
        } else {
            0
        }
    } else if i + 1 < MIN_ORDER_NB {
        NLSF_PRED_NB[NLSF_PRED_SELECT_NB[s1][i.min(8)] as usize][i.min(8)]
    } else {
        0
    }
}

const MIN_ORDER_NB: usize = 10;

/// The decoder's residual dequantization step.
pub(crate) fn dequant_residual(idx: i32, step_q16: i32) -> i32 {
    let fix = if idx < 0 {
        102
    } else if idx > 0 {
        -102
    } else {
        0
    };
    ((idx * 1024 + fix) * step_q16) >> 16
}

/// Codes everything of one frame except what needs encoder-side analysis
/// context: used for LBRR frames, which re-code stored parameters.
fn encode_frame_params(
    enc: &mut RangeEncoder<'_>,
    cfg: &FrameConfig,
    params: &FrameParams,
    conditional: bool,
    prev_log_gain: &mut i32,
    prev_lag: i32,
) -> Result<(), EncoderError> {
    // LBRR frames are always decoded as active; coerce silent frames so the
    // frame type and excitation tables line up.
    let mut params = params.clone();
    if params.signal_type == SignalType::NoActivity {
        params.signal_type = SignalType::Unvoiced;
    }

    // Rebuild the stage indices from the stored NLSF vector.
    let (s1, residuals, _) = quantize_nlsf(cfg, &params.nlsf_q15[..cfg.lpc_order]);
    let per_index = 0;
    let ltp_indices = [0_usize; MAX_NB_SUBFR];
    encode_frame_params_full(
        enc,
        cfg,
        &params,
        conditional,
        prev_log_gain,
        prev_lag,
        s1,
        &residuals,
        per_index,
        &ltp_indices,
        0,
    )
}

/// The complete per-frame parameter stream.
#[allow(clippy::too_many_arguments)]
fn encode_frame_params_full(
    enc: &mut RangeEncoder<'_>,
    cfg: &FrameConfig,
    params: &FrameParams,
    conditional: bool,
    prev_log_gain: &mut i32,
    prev_lag: i32,
    nlsf_s1: usize,
    nlsf_residuals: &[i8; MAX_LPC_ORDER],
    ltp_per_index: usize,
    ltp_indices: &[usize; MAX_NB_SUBFR],
    packet_loss_perc: u8,
) -> Result<(), EncoderError> {
    let voiced = params.signal_type == SignalType::Voiced;

    // Frame type.
    match params.signal_type {
        SignalType::NoActivity => {
            enc.encode_icdf(params.quant_offset, &FRAME_TYPE_INACTIVE_ICDF, 8)?;
        }
        SignalType::Unvoiced => {
            enc.encode_icdf(params.quant_offset, &FRAME_TYPE_ACTIVE_ICDF, 8)?;
        }
        SignalType::Voiced => {
            enc.encode_icdf(2 + params.quant_offset, &FRAME_TYPE_ACTIVE_ICDF, 8)?;
        }
    }

    // Gains.
    for s in 0..cfg.nb_subfr {
        let target = params.gain_indices[s];
        if s == 0 && !conditional {
            let msb = (target >> 3).max(0).min(7) as usize;
            let lsb = (target & 7) as usize;
            enc.encode_icdf(msb, &GAIN_MSB_ICDF[params.signal_type.index()], 8)?;
            enc.encode_icdf(lsb, &GAIN_LSB_ICDF, 8)?;
            *prev_log_gain = ((msb as i32) << 3) | lsb as i32;
        } else {
            let delta = gain::best_delta(*prev_log_gain, target);
            enc.encode_icdf(delta as usize, &GAIN_DELTA_ICDF, 8)?;
            *prev_log_gain = gain::apply_delta(*prev_log_gain, delta);
        }
    }

    // NLSF stage 1 and stage 2.
    let wb = cfg.lpc_order == MAX_LPC_ORDER;
    let s1_ctx = usize::from(voiced) | (usize::from(wb) << 1);
    enc.encode_icdf(nlsf_s1, &NLSF_STAGE1_ICDF[s1_ctx], 8)?;
    for i in 0..cfg.lpc_order {
        let dist_idx = stage2_dist(wb, nlsf_s1, i);
        let idx = i32::from(nlsf_residuals[i]);
        let clamped = idx.max(-4).min(4);
        enc.encode_icdf((clamped + 4) as usize, stage2_icdf(wb, dist_idx), 8)?;
        if clamped == -4 {
            let ext = (-idx - 4).max(0).min(6) as usize;
            enc.encode_icdf(ext, &NLSF_EXT_ICDF, 8)?;
        } else if clamped == 4 {
            let ext = (idx - 4).max(0).min(6) as usize;
            enc.encode_icdf(ext, &NLSF_EXT_ICDF, 8)?;
        }
    }

    // Interpolation index, 20 ms frames only.
    if cfg.nb_subfr == MAX_NB_SUBFR {
        enc.encode_icdf(params.interp_index, &NLSF_INTERP_ICDF, 8)?;
    }

    if voiced {
        // Pitch lag, absolute or delta against the previous frame.
        let lag = params.pitch_base;
        let delta = lag - prev_lag;
        if conditional && prev_lag > 0 && (-9..=10).contains(&delta) {
            enc.encode_icdf((delta + 10) as usize, &PITCH_DELTA_ICDF, 8)?;
        } else {
            if conditional && prev_lag > 0 {
                // Escape to absolute coding.
                enc.encode_icdf(0, &PITCH_DELTA_ICDF, 8)?;
            }
            let low_size = cfg.lag_low_size();
            let coded = (lag - cfg.min_lag()).max(0) as u32;
            let msb = (coded / low_size).min(31);
            let low = coded - msb * low_size;
            enc.encode_icdf(msb as usize, &PITCH_LAG_MSB_ICDF, 8)?;
            enc.encode_uint(low, low_size)?;
        }

        // Contour.
        let contour_icdf: &[u8] = if cfg.nb_subfr == 2 {
            &PITCH_CONTOUR_10MS_ICDF
        } else {
            &PITCH_CONTOUR_20MS_ICDF
        };
        enc.encode_icdf(params.pitch_contour, contour_icdf, 8)?;

        // LTP filter indices and scale.
        enc.encode_icdf(ltp_per_index, &LTP_PER_INDEX_ICDF, 8)?;
        for s in 0..cfg.nb_subfr {
            match ltp_per_index {
                0 => enc.encode_icdf(ltp_indices[s], &LTP_GAIN_ICDF_0, 8)?,
                1 => enc.encode_icdf(ltp_indices[s], &LTP_GAIN_ICDF_1, 8)?,
                _ => enc.encode_icdf(ltp_indices[s], &LTP_GAIN_ICDF_2, 8)?,
            }
        }
        enc.encode_icdf(ltp_scale_index(packet_loss_perc), &LTP_SCALE_ICDF, 8)?;
    }

    // Dither seed.
    enc.encode_uint(params.seed as u32, 4)?;

    // Excitation.
    encode_excitation(enc, cfg, params)?;

    Ok(())
}

/// Codes the excitation pulses: rate level, per-block pulse counts with LSB
/// extension, shell-coded positions, LSB planes and signs.
pub(crate) fn encode_excitation(
    enc: &mut RangeEncoder<'_>,
    cfg: &FrameConfig,
    params: &FrameParams,
) -> Result<(), EncoderError> {
    let frame_len = cfg.frame_len();
    let n_blocks = frame_len / SHELL_BLOCK_LEN;
    let voiced = params.signal_type == SignalType::Voiced;

    // Rate level from the average pulse density.
    let total_abs: i64 = params.pulses[..frame_len]
        .iter()
        .map(|&p| i64::from(p.unsigned_abs()))
        .sum();
    let density = (total_abs as usize * 8 / frame_len).min(8);
    let rate_level = density;
    enc.encode_icdf(rate_level, &RATE_LEVEL_ICDF[usize::from(voiced)], 8)?;

    for b in 0..n_blocks {
        let block = &params.pulses[b * SHELL_BLOCK_LEN..(b + 1) * SHELL_BLOCK_LEN];
        let mut magnitudes: Vec<u32> = block.iter().map(|&p| u32::from(p.unsigned_abs())).collect();

        // Scale down with LSB planes until the shell coder can hold it.
        let mut lsb_count = 0;
        while magnitudes.iter().sum::<u32>() > 16 {
            magnitudes.iter_mut().for_each(|m| *m >>= 1);
            lsb_count += 1;
        }
        let total: u32 = magnitudes.iter().sum();

        // Pulse count with escape coding.
        let mut first = true;
        for _ in 0..lsb_count {
            let icdf = if first {
                &PULSE_COUNT_ICDF[rate_level]
            } else {
                &PULSE_COUNT_ICDF[10]
            };
            enc.encode_icdf(17, icdf, 8)?;
            first = false;
        }
        let icdf = if first {
            &PULSE_COUNT_ICDF[rate_level]
        } else {
            &PULSE_COUNT_ICDF[10]
        };
        enc.encode_icdf(total as usize, icdf, 8)?;

        // Shell-coded positions.
        if total > 0 {
            shell_encode(enc, &magnitudes)?;
        }

        // LSB planes, most significant first.
        if lsb_count > 0 {
            for i in 0..SHELL_BLOCK_LEN {
                let abs = u32::from(block[i].unsigned_abs());
                for bit in (0..lsb_count).rev() {
                    enc.encode_icdf(((abs >> bit) & 1) as usize, &EXC_LSB_ICDF, 8)?;
                }
            }
        }

        // Signs of the nonzero samples.
        let sign_p = SIGN_P[params.signal_type.index()][params.quant_offset]
            [usize::min(total as usize, 6)];
        for &p in block.iter() {
            if p != 0 {
                let icdf = [sign_p, 0];
                enc.encode_icdf(usize::from(p < 0), &icdf, 8)?;
            }
        }
    }

    Ok(())
}

/// Splits the pulse counts of a partition between its halves, recursively.
pub(crate) fn shell_encode(enc: &mut RangeEncoder<'_>, magnitudes: &[u32]) -> Result<(), EncoderError> {
    let total: u32 = magnitudes.iter().sum();
    if total == 0 || magnitudes.len() == 1 {
        return Ok(());
    }
    let half = magnitudes.len() / 2;
    let left: u32 = magnitudes[..half].iter().sum();
    enc.encode_icdf(
        left as usize,
        &SHELL_SPLIT_ICDF[(total - 1) as usize][..(total + 1) as usize],
        8,
    )?;
    shell_encode(enc, &magnitudes[..half])?;
    shell_encode(enc, &magnitudes[half..])?;
    Ok(())
}

/// Which stage-two distribution codes coefficient `i`.
pub(crate) fn stage2_dist(wb: bool, s1: usize, i: usize) -> usize {
    if wb {
        NLSF_STAGE2_WB_MAP[s1][i] as usize
    } else {
        NLSF_STAGE2_NB_MAP[s1][i] as usize
    }
}

pub(crate) fn stage2_icdf(wb: bool, dist: usize) -> &'static [u8] {
    if wb {
        &NLSF_STAGE2_WB_ICDF[dist]
    } else {
        &NLSF_STAGE2_NB_ICDF[dist]
    }
}
