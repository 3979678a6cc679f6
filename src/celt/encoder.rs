//! Implements the CELT encoder.

use crate::celt::alloc::{self, EncoderBits};
use crate::celt::bands::{self, ShapeCtx};
use crate::celt::comb_filter::comb_filter_inplace;
use crate::celt::mdct::{forward_windowed, Mdct};
use crate::celt::{
    vorbis_window, COMBFILTER_MAXPERIOD, COMBFILTER_MINPERIOD, MAX_BANDS, MAX_FRAME_SIZE,
    SHORT_BLOCK_SIZE, SPREAD_ICDF, TAPSET_ICDF, TRIM_ICDF,
};
use crate::encoder_error::EncoderError;
use crate::math::ilog;
use crate::range_coder::{RangeEncoder, Tell, BITRES};
use crate::Channels;

/// 48 kHz first-order pre-emphasis coefficient.
pub(crate) const PREEMPHASIS: f32 = 0.85;

/// The CELT encoder. Operates at 48 kHz on frames of 120 to 960 samples.
#[derive(Clone, Debug)]
pub(crate) struct CeltEncoder {
    channels: usize,
    window: Vec<f32>,

    /// Input history: pre-emphasized samples kept for the MDCT overlap and
    /// the prefilter, per channel.
    in_mem: Vec<Vec<f32>>,
    preemph_mem: [f32; 2],

    /// Band energy history in the log domain.
    old_band_e: [[f32; MAX_BANDS]; 2],

    prefilter_period: usize,
    prefilter_gain: f32,
    prefilter_tapset: usize,

    frames_encoded: u64,
    /// First band coded; 17 when running as the high part of a hybrid frame.
    start_band: usize,
    /// One past the last coded band, from the audio bandwidth.
    end_band: usize,
}

impl CeltEncoder {
    pub(crate) fn new(channels: Channels) -> Self {
        let channels = channels as usize;
        Self {
            channels,
            window: vorbis_window(SHORT_BLOCK_SIZE),
            in_mem: vec![vec![0.0; COMBFILTER_MAXPERIOD + MAX_FRAME_SIZE]; channels],
            preemph_mem: [0.0; 2],
            old_band_e: [[-28.0; MAX_BANDS]; 2],
            prefilter_period: 0,
            prefilter_gain: 0.0,
            prefilter_tapset: 0,
            frames_encoded: 0,
            start_band: 0,
            end_band: MAX_BANDS,
        }
    }

    pub(crate) fn reset(&mut self) {
        let channels = self.channels;
        *self = Self::new(if channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        });
    }

    pub(crate) fn set_start_band(&mut self, start: usize) {
        self.start_band = start;
    }

    pub(crate) fn set_end_band(&mut self, end: usize) {
        self.end_band = end;
    }

    pub(crate) fn pitch(&self) -> u32 {
        self.prefilter_period as u32
    }

    /// Encodes one frame of 48 kHz PCM (interleaved when stereo) into the
    /// given range encoder. `nb_bytes` is the byte budget of the frame.
    pub(crate) fn encode(
        &mut self,
        enc: &mut RangeEncoder<'_>,
        pcm: &[f32],
        frame_size: usize,
        nb_bytes: usize,
    ) -> Result<(), EncoderError> {
        let lm = lm_for_frame_size(frame_size)?;
        let channels = self.channels;
        let n = frame_size;
        let overlap = SHORT_BLOCK_SIZE;
        let total_bits = (nb_bytes * 8) as u32;
        let total_bits_frac = (total_bits << BITRES) as i32;

        // Pre-emphasize the input into the per-channel history buffers. The
        // last `max_period + overlap` samples stay available for the MDCT
        // overlap and the prefilter.
        for c in 0..channels {
            let mem_len = self.in_mem[c].len();
            self.in_mem[c].copy_within(n.., 0);
            let keep = mem_len - n;
            let mut m = self.preemph_mem[c];
            for i in 0..n {
                let x = pcm[i * channels + c];
                let y = x - PREEMPHASIS * m;
                m = x;
                self.in_mem[c][keep + i] = y;
            }
            self.preemph_mem[c] = m;
        }

        // Transient decision drives the short-block switch.
        let is_transient = lm > 0 && self.detect_transient(n, lm);
        let blocks = if is_transient { 1 << lm } else { 1 };

        let silence = self.is_silent(n);
        if enc.tell() == 1 {
            enc.encode_bit_logp(u32::from(silence), 15)?;
            if silence {
                // Nothing else is coded for a silent frame.
                self.old_band_e = [[-28.0; MAX_BANDS]; 2];
                self.frames_encoded += 1;
                return Ok(());
            }
        }

        // Pitch prefilter, coded only when the low bands are in the stream.
        let pf_on = self.run_prefilter(enc, n, total_bits, silence)?;
        if !pf_on {
            self.prefilter_period = 0;
            self.prefilter_gain = 0.0;
        }

        if lm > 0 && enc.tell() + 3 <= total_bits {
            enc.encode_bit_logp(u32::from(is_transient), 3)?;
        }

        // Forward MDCT per channel (and per short block when transient).
        let mut freq = vec![vec![0.0_f32; n]; channels];
        let block_size = n >> if is_transient { lm } else { 0 };
        let short_mdct = Mdct::new(block_size);
        for c in 0..channels {
            let mem_len = self.in_mem[c].len();
            let input = &self.in_mem[c][mem_len - n - overlap..];
            if is_transient {
                let mut block_out = vec![0.0_f32; block_size];
                for b in 0..blocks {
                    forward_windowed(
                        &short_mdct,
                        &self.window,
                        &input[b * block_size..b * block_size + block_size + overlap],
                        &mut block_out,
                    );
                    // Interleave the short blocks.
                    block_out
                        .iter()
                        .enumerate()
                        .for_each(|(j, &v)| freq[c][j * blocks + b] = v);
                }
            } else {
                forward_windowed(&short_mdct, &self.window, input, &mut freq[c]);
            }
        }

        let end = self.end_band;
        let start = self.start_band;

        // Band energies.
        let mut band_e = [[0.0_f32; MAX_BANDS]; 2];
        let mut band_log_e = [[0.0_f32; MAX_BANDS]; 2];
        for c in 0..channels {
            bands::compute_band_energies(&freq[c], end, lm, &mut band_e[c]);
            bands::amp_to_log(&band_e[c], end, &mut band_log_e[c]);
        }

        // Normalized shapes.
        let mut norm = vec![vec![0.0_f32; n]; channels];
        for c in 0..channels {
            bands::normalise_bands(&freq[c], &mut norm[c], &band_e[c], end, lm);
        }

        // Intra on the first frame after a reset, when prediction has no
        // past. Without budget for the flag the decoder assumes inter.
        let mut intra = self.frames_encoded == 0;
        if enc.tell() + 3 <= total_bits {
            enc.encode_bit_logp(u32::from(intra), 3)?;
        } else {
            intra = false;
        }

        let mut error = [[0.0_f32; MAX_BANDS]; 2];
        bands::quant_coarse_energy(
            enc,
            start,
            end,
            &band_log_e,
            &mut self.old_band_e,
            total_bits,
            lm,
            channels,
            intra,
            &mut error,
        )?;

        // Time-frequency resolution, flat by default.
        let mut tf_res = [0_i32; MAX_BANDS];
        bands::tf_encode(enc, start, end, is_transient, &mut tf_res, lm, 0)?;

        let spread = if enc.tell() + 4 <= total_bits {
            let spread = bands::spreading_decision(&norm[0], end, lm);
            enc.encode_icdf(spread, &SPREAD_ICDF, 5)?;
            spread
        } else {
            2
        };

        // Dynamic allocation boosts. This encoder does not request any, but
        // the zero flags are still part of the stream.
        let caps = alloc::band_caps(lm, channels);
        let mut offsets = [0_i32; MAX_BANDS];
        let mut dynalloc_logp = 6_u32;
        let mut total_boost = 0_i32;
        for i in start..end {
            let quanta = alloc::boost_quanta(i, lm, channels);
            let mut dynalloc_loop_logp = dynalloc_logp;
            let mut boost = 0_i32;
            while (enc.tell_frac() as i32) + ((dynalloc_loop_logp as i32) << BITRES)
                < total_bits_frac - total_boost
                && boost < caps[i]
            {
                // This encoder never requests a boost, but the stop flag is
                // still part of the stream.
                let more = false;
                enc.encode_bit_logp(u32::from(more), dynalloc_loop_logp)?;
                if !more {
                    break;
                }
                boost += quanta;
                total_boost += quanta;
                dynalloc_loop_logp = 1;
            }
            if boost > 0 {
                dynalloc_logp = u32::max(2, dynalloc_logp - 1);
            }
            offsets[i] = boost;
        }

        let alloc_trim = if enc.tell_frac() as i32 + (6 << BITRES) <= total_bits_frac - total_boost
        {
            let trim = 5_usize;
            enc.encode_icdf(trim, &TRIM_ICDF, 7)?;
            trim as i32
        } else {
            5
        };

        // Anti-collapse reservation.
        let mut bits = total_bits_frac - enc.tell_frac() as i32 - 1;
        let anti_collapse_rsv =
            if is_transient && lm >= 2 && bits >= ((lm as i32) + 2) << BITRES {
                1 << BITRES
            } else {
                0
            };
        bits -= anti_collapse_rsv;

        let allocation = {
            let mut coder = EncoderBits { enc: &mut *enc };
            alloc::compute_allocation(
                start,
                end,
                lm,
                channels,
                &offsets,
                alloc_trim,
                end,
                false,
                bits,
                &mut coder,
            )?
        };

        bands::quant_fine_energy(
            enc,
            start,
            end,
            &mut self.old_band_e,
            &mut error,
            &allocation.fine_bits,
            channels,
        )?;

        // Shape coding.
        let mut collapse_masks = [0_u8; 2 * MAX_BANDS];
        let mut ctx = ShapeCtx {
            lm,
            spread,
            blocks,
            intensity: allocation.intensity,
            dual_stereo: allocation.dual_stereo,
            remaining_bits: 0,
            total_bits: total_bits_frac,
            seed: 0,
        };
        {
            let (left, right) = norm.split_at_mut(1);
            bands::quant_all_bands(
                enc,
                &mut ctx,
                start,
                end,
                &mut left[0],
                right.get_mut(0).map(|r| &mut r[..]),
                &allocation.shape_bits,
                allocation.coded_bands,
                &tf_res,
                allocation.balance,
                &mut collapse_masks,
            )?;
        }

        if anti_collapse_rsv > 0 {
            enc.encode_bits(u32::from(is_transient), 1)?;
        }

        let bits_left = total_bits as i32 - enc.tell() as i32;
        bands::quant_energy_finalise(
            enc,
            start,
            end,
            &mut self.old_band_e,
            &mut error,
            &allocation.fine_bits,
            &allocation.fine_priority,
            channels,
            bits_left,
        )?;

        if channels == 1 {
            self.old_band_e[1] = self.old_band_e[0];
        }

        self.frames_encoded += 1;
        Ok(())
    }

    /// Simple time-domain transient detector: compares short-window energies
    /// across the frame on the pre-emphasized signal.
    fn detect_transient(&self, n: usize, lm: usize) -> bool {
        let block = n >> lm;
        let mem_len = self.in_mem[0].len();
        let input = &self.in_mem[0][mem_len - n..];

        let mut max_e = 0.0_f32;
        let mut min_e = f32::MAX;
        (0..1 << lm).for_each(|b| {
            let e: f32 = input[b * block..(b + 1) * block]
                .iter()
                .map(|v| v * v)
                .sum::<f32>()
                + 1e-15;
            max_e = max_e.max(e);
            min_e = min_e.min(e);
        });

        max_e > 16.0 * min_e && max_e > 1e-4
    }

    fn is_silent(&self, n: usize) -> bool {
        self.in_mem.iter().all(|mem| {
            let mem_len = mem.len();
            mem[mem_len - n..].iter().all(|v| v.abs() < 1e-9)
        })
    }

    /// Searches a pitch period on the pre-emphasized history, applies the
    /// prefilter and codes its parameters. Returns whether the prefilter
    /// signaling was coded as enabled.
    fn run_prefilter(
        &mut self,
        enc: &mut RangeEncoder<'_>,
        n: usize,
        total_bits: u32,
        silence: bool,
    ) -> Result<bool, EncoderError> {
        if self.start_band != 0 || enc.tell() + 16 > total_bits {
            return Ok(false);
        }

        let (period, corr) = if silence { (0, 0.0) } else { self.search_pitch(n) };
        let enabled = corr > 0.2 && period >= COMBFILTER_MINPERIOD && period <= 1022;

        if !enabled {
            enc.encode_bit_logp(0, 1)?;
            // Crossfade any previous filter out.
            let tapset = self.prefilter_tapset;
            self.apply_prefilter(n, 0, 0.0, tapset);
            self.prefilter_period = 0;
            self.prefilter_gain = 0.0;
            return Ok(false);
        }

        let qg = ((corr * 32.0 / 3.0).round() as i32 - 1).max(0).min(7);
        let gain = 0.09375 * (qg as f32 + 1.0);
        enc.encode_bit_logp(1, 1)?;
        let pi = (period + 1) as u32;
        let octave = ilog(pi) - 5;
        enc.encode_uint(octave, 6)?;
        enc.encode_bits(pi - (16 << octave), 4 + octave)?;
        enc.encode_bits(qg as u32, 3)?;
        enc.encode_icdf(self.prefilter_tapset, &TAPSET_ICDF, 2)?;

        let tapset = self.prefilter_tapset;
        self.apply_prefilter(n, period, -gain, tapset);
        self.prefilter_period = period;
        self.prefilter_gain = gain;
        Ok(true)
    }

    /// Applies the comb filter to the newest `n` samples of the history,
    /// crossfading from the previous frame's parameters.
    fn apply_prefilter(&mut self, n: usize, period: usize, gain: f32, tapset: usize) {
        let overlap = SHORT_BLOCK_SIZE;
        let prev_period = self.prefilter_period;
        let prev_gain = if self.prefilter_gain > 0.0 {
            -self.prefilter_gain
        } else {
            0.0
        };
        for c in 0..self.channels {
            let mem_len = self.in_mem[c].len();
            let offset = mem_len - n;
            comb_filter_inplace(
                &mut self.in_mem[c],
                offset,
                prev_period,
                period,
                n,
                prev_gain,
                gain,
                self.prefilter_tapset,
                tapset,
                &self.window,
                overlap,
            );
        }
    }

    /// Normalized autocorrelation search over the comb filter's period range.
    fn search_pitch(&self, n: usize) -> (usize, f32) {
        let mem_len = self.in_mem[0].len();
        let hist = &self.in_mem[0];
        let target_start = mem_len - n;

        let energy: f32 = hist[target_start..].iter().map(|v| v * v).sum::<f32>() + 1e-9;
        let mut best_period = 0;
        let mut best_gain = 0.0_f32;

        // Coarse search with a stride of 2, bounded by the available history.
        let max_period = usize::min(COMBFILTER_MAXPERIOD, target_start);
        let mut period = COMBFILTER_MINPERIOD;
        while period < max_period {
            let mut corr = 0.0_f32;
            let mut lag_energy = 1e-9_f32;
            (0..n).for_each(|i| {
                let x = hist[target_start + i];
                let y = hist[target_start + i - period];
                corr += x * y;
                lag_energy += y * y;
            });
            let gain = corr / (energy * lag_energy).sqrt();
            if gain > best_gain {
                best_gain = gain;
                best_period = period;
            }
            period += 2;
        }

        (best_period, best_gain.max(0.0))
    }
}

/// Maps a 48 kHz frame size to its LM (number of short-block doublings).
pub(crate) fn lm_for_frame_size(frame_size: usize) -> Result<usize, EncoderError> {
    match frame_size {
        SHORT_BLOCK_SIZE => Ok(0),
        n if n == SHORT_BLOCK_SIZE * 2 => Ok(1),
        n if n == SHORT_BLOCK_SIZE * 4 => Ok(2),
        n if n == MAX_FRAME_SIZE => Ok(3),
        _ => Err(EncoderError::BadArguments(
            "frame size is not a valid transform size",
        )),
    }
}

