//! Implements the CELT decoder.

use crate::celt::alloc::{self, DecoderBits};
use crate::celt::bands::{self, lcg_rand, ShapeCtx};
use crate::celt::comb_filter::comb_filter_inplace;
use crate::celt::encoder::{lm_for_frame_size, PREEMPHASIS};
use crate::celt::mdct::{inverse_windowed, Mdct};
use crate::celt::{
    vorbis_window, COMBFILTER_MAXPERIOD, EBANDS, MAX_BANDS, MAX_FRAME_SIZE, SHORT_BLOCK_SIZE,
    SPREAD_ICDF, TAPSET_ICDF, TRIM_ICDF,
};
use crate::decoder_error::DecoderError;
use crate::range_coder::{RangeDecoder, Tell, BITRES};
use crate::Channels;

/// The CELT decoder. The exact mirror of the encoder's coding flow, plus
/// synthesis, the pitch post-filter and loss concealment.
#[derive(Clone, Debug)]
pub(crate) struct CeltDecoder {
    channels: usize,
    window: Vec<f32>,

    /// Synthesized (pre-de-emphasis) history per channel, for the
    /// post-filter and the overlap-add carry.
    syn_mem: Vec<Vec<f32>>,
    /// Overlap-add carry per channel.
    overlap_mem: Vec<Vec<f32>>,
    deemph_mem: [f32; 2],

    old_band_e: [[f32; MAX_BANDS]; 2],
    old_log_e: [[f32; MAX_BANDS]; 2],
    old_log_e2: [[f32; MAX_BANDS]; 2],

    postfilter_period: usize,
    postfilter_gain: f32,
    postfilter_tapset: usize,

    seed: u32,
    loss_count: u32,
    start_band: usize,
    end_band: usize,
    last_pitch: usize,
}

impl CeltDecoder {
    pub(crate) fn new(channels: Channels) -> Result<Self, DecoderError> {
        let channels = channels as usize;
        Ok(Self {
            channels,
            window: vorbis_window(SHORT_BLOCK_SIZE),
            syn_mem: vec![vec![0.0; COMBFILTER_MAXPERIOD + MAX_FRAME_SIZE]; channels],
            overlap_mem: vec![vec![0.0; SHORT_BLOCK_SIZE]; channels],
            deemph_mem: [0.0; 2],
            old_band_e: [[-28.0; MAX_BANDS]; 2],
            old_log_e: [[-28.0; MAX_BANDS]; 2],
            old_log_e2: [[-28.0; MAX_BANDS]; 2],
            postfilter_period: 0,
            postfilter_gain: 0.0,
            postfilter_tapset: 0,
            seed: 0,
            loss_count: 0,
            start_band: 0,
            end_band: MAX_BANDS,
            last_pitch: 0,
        })
    }

    pub(crate) fn reset(&mut self) -> Result<(), DecoderError> {
        let channels = if self.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };
        *self = Self::new(channels)?;
        Ok(())
    }

    pub(crate) fn set_start_band(&mut self, start: usize) {
        self.start_band = start;
    }

    pub(crate) fn set_end_band(&mut self, end: usize) {
        self.end_band = end;
    }

    /// The pitch of the last decoded frame, from the post-filter period.
    pub(crate) fn pitch(&self) -> u32 {
        self.last_pitch as u32
    }

    /// Decodes one frame into `pcm` (interleaved when stereo). `None`
    /// conceals a lost frame.
    pub(crate) fn decode(
        &mut self,
        dec: Option<&mut RangeDecoder<'_>>,
        pcm: &mut [f32],
        frame_size: usize,
    ) -> Result<(), DecoderError> {
        let dec = match dec {
            Some(dec) => dec,
            None => return self.conceal(pcm, frame_size),
        };

        let lm = lm_for_frame_size(frame_size)
            .map_err(|_| DecoderError::InternalError("bad transform size"))?;
        let n = frame_size;
        let channels = self.channels;
        let start = self.start_band;
        let end = self.end_band;
        let total_bits = (dec.storage() * 8) as u32;
        let total_bits_frac = (total_bits << BITRES) as i32;

        let silence = if dec.tell() == 1 {
            dec.decode_bit_logp(15)
        } else {
            false
        };
        if silence {
            let mut freq = vec![vec![0.0_f32; n]; channels];
            self.old_band_e = [[-28.0; MAX_BANDS]; 2];
            let pf = (
                self.postfilter_period,
                self.postfilter_gain,
                self.postfilter_tapset,
            );
            self.synthesize(&mut freq, pcm, n, lm, false, pf);
            self.loss_count = 0;
            return Ok(());
        }

        // Post-filter parameters.
        let mut pf_period = 0_usize;
        let mut pf_gain = 0.0_f32;
        let mut pf_tapset = 0_usize;
        if start == 0 && dec.tell() + 16 <= total_bits && dec.decode_bit_logp(1) {
            let octave = dec.decode_uint(6);
            let pi = (16 << octave) + dec.decode_bits(4 + octave);
            pf_period = pi as usize - 1;
            let qg = dec.decode_bits(3);
            pf_gain = 0.09375 * (qg as f32 + 1.0);
            pf_tapset = dec.decode_icdf(&TAPSET_ICDF, 2) as usize;
        }

        let is_transient = if lm > 0 && dec.tell() + 3 <= total_bits {
            dec.decode_bit_logp(3)
        } else {
            false
        };
        let blocks = if is_transient { 1 << lm } else { 1 };

        let intra = if dec.tell() + 3 <= total_bits {
            dec.decode_bit_logp(3)
        } else {
            false
        };

        bands::unquant_coarse_energy(
            dec,
            start,
            end,
            &mut self.old_band_e,
            total_bits,
            lm,
            channels,
            intra,
        );

        let mut tf_res = [0_i32; MAX_BANDS];
        bands::tf_decode(dec, start, end, is_transient, &mut tf_res, lm);

        let spread = if dec.tell() + 4 <= total_bits {
            dec.decode_icdf(&SPREAD_ICDF, 5) as usize
        } else {
            2
        };

        // Dynamic allocation boosts.
        let caps = alloc::band_caps(lm, channels);
        let mut offsets = [0_i32; MAX_BANDS];
        let mut dynalloc_logp = 6_u32;
        let mut total_boost = 0_i32;
        for i in start..end {
            let quanta = alloc::boost_quanta(i, lm, channels);
            let mut dynalloc_loop_logp = dynalloc_logp;
            let mut boost = 0_i32;
            while (dec.tell_frac() as i32) + ((dynalloc_loop_logp as i32) << BITRES)
                < total_bits_frac - total_boost
                && boost < caps[i]
            {
                let more = dec.decode_bit_logp(dynalloc_loop_logp);
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

        let alloc_trim = if dec.tell_frac() as i32 + (6 << BITRES) <= total_bits_frac - total_boost
        {
            dec.decode_icdf(&TRIM_ICDF, 7) as i32
        } else {
            5
        };

        let mut bits = total_bits_frac - dec.tell_frac() as i32 - 1;
        let anti_collapse_rsv =
            if is_transient && lm >= 2 && bits >= ((lm as i32) + 2) << BITRES {
                1 << BITRES
            } else {
                0
            };
        bits -= anti_collapse_rsv;

        let allocation = {
            let mut coder = DecoderBits { dec: &mut *dec };
            alloc::compute_allocation(
                start, end, lm, channels, &offsets, alloc_trim, end, false, bits, &mut coder,
            )
            .map_err(|_| DecoderError::InternalError("allocation failed"))?
        };

        bands::unquant_fine_energy(
            dec,
            start,
            end,
            &mut self.old_band_e,
            &allocation.fine_bits,
            channels,
        );

        let mut norm = vec![vec![0.0_f32; n]; channels];
        let mut collapse_masks = [0_u8; 2 * MAX_BANDS];
        let mut ctx = ShapeCtx {
            lm,
            spread,
            blocks,
            intensity: allocation.intensity,
            dual_stereo: allocation.dual_stereo,
            remaining_bits: 0,
            total_bits: total_bits_frac,
            seed: self.seed,
        };
        {
            let (left, right) = norm.split_at_mut(1);
            bands::unquant_all_bands(
                dec,
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
            );
        }
        self.seed = ctx.seed;

        let anti_collapse_on = anti_collapse_rsv > 0 && dec.decode_bits(1) != 0;

        bands::unquant_energy_finalise(
            dec,
            start,
            end,
            &mut self.old_band_e,
            &allocation.fine_bits,
            &allocation.fine_priority,
            channels,
            total_bits as i32 - dec.tell() as i32,
        );

        if anti_collapse_on {
            let old_band_e = self.old_band_e;
            for c in 0..channels {
                bands::anti_collapse(
                    &mut norm[c],
                    &collapse_masks,
                    lm,
                    c,
                    start,
                    end,
                    &old_band_e[c],
                    &self.old_log_e[c],
                    &self.old_log_e2[c],
                    &allocation.shape_bits,
                    &mut self.seed,
                );
            }
        }

        // Denormalize to the coded energies.
        let mut freq = vec![vec![0.0_f32; n]; channels];
        for c in 0..channels {
            bands::denormalise_bands(&norm[c], &mut freq[c], &self.old_band_e[c], start, end, lm);
        }

        // Energy history for anti-collapse and concealment.
        self.old_log_e2 = self.old_log_e;
        self.old_log_e = self.old_band_e;
        if channels == 1 {
            self.old_band_e[1] = self.old_band_e[0];
            self.old_log_e[1] = self.old_log_e[0];
            self.old_log_e2[1] = self.old_log_e2[0];
        }

        self.synthesize(&mut freq, pcm, n, lm, is_transient, (pf_period, pf_gain, pf_tapset));
        if pf_period > 0 {
            self.last_pitch = pf_period;
        }
        self.loss_count = 0;
        Ok(())
    }

    /// Inverse transform, overlap-add, post-filter and de-emphasis.
    ///
    /// `pf` carries the post-filter parameters decoded for this frame; the
    /// filter crossfades from the previous frame's parameters and the new
    /// ones become the carried state.
    fn synthesize(
        &mut self,
        freq: &mut [Vec<f32>],
        pcm: &mut [f32],
        n: usize,
        lm: usize,
        is_transient: bool,
        pf: (usize, f32, usize),
    ) {
        let channels = self.channels;
        let overlap = SHORT_BLOCK_SIZE;
        let blocks = if is_transient { 1 << lm } else { 1 };
        let block_size = n / blocks;
        let mdct = Mdct::new(block_size);

        for c in 0..channels {
            // Overlap-add buffer covering this frame plus its tail.
            let mut buf = vec![0.0_f32; n + overlap];
            buf[..overlap].copy_from_slice(&self.overlap_mem[c]);

            let mut block_in = vec![0.0_f32; block_size];
            let mut block_out = vec![0.0_f32; block_size + overlap];
            for b in 0..blocks {
                (0..block_size).for_each(|j| block_in[j] = freq[c][j * blocks + b]);
                inverse_windowed(&mdct, &self.window, &block_in, &mut block_out);
                (0..block_size + overlap).for_each(|i| buf[b * block_size + i] += block_out[i]);
            }

            self.overlap_mem[c].copy_from_slice(&buf[n..]);

            // Append to the synthesis history and run the post-filter over
            // the new samples.
            let mem_len = self.syn_mem[c].len();
            self.syn_mem[c].copy_within(n.., 0);
            self.syn_mem[c][mem_len - n..].copy_from_slice(&buf[..n]);
        }
        self.apply_postfilter(n, pf);

        // De-emphasis into the output.
        for c in 0..channels {
            let mem_len = self.syn_mem[c].len();
            let mut m = self.deemph_mem[c];
            (0..n).for_each(|i| {
                let v = self.syn_mem[c][mem_len - n + i] + PREEMPHASIS * m;
                m = v;
                pcm[i * channels + c] = v;
            });
            self.deemph_mem[c] = m;
        }
    }

    /// Runs the post-filter over the newest `n` samples, crossfading from
    /// the previous frame's parameters to this frame's, then carries the new
    /// parameters.
    fn apply_postfilter(&mut self, n: usize, pf: (usize, f32, usize)) {
        let (period, gain, tapset) = pf;
        if self.postfilter_gain != 0.0 || gain != 0.0 {
            let overlap = SHORT_BLOCK_SIZE;
            for c in 0..self.channels {
                let mem_len = self.syn_mem[c].len();
                comb_filter_inplace(
                    &mut self.syn_mem[c],
                    mem_len - n,
                    self.postfilter_period,
                    period,
                    n,
                    self.postfilter_gain,
                    gain,
                    self.postfilter_tapset,
                    tapset,
                    &self.window,
                    overlap,
                );
            }
        }
        self.postfilter_period = period;
        self.postfilter_gain = gain;
        self.postfilter_tapset = tapset;
    }

    /// Concealment for a lost frame: regenerate the spectrum from the last
    /// band energies with decorrelated noise shapes, decaying towards
    /// silence over consecutive losses.
    fn conceal(&mut self, pcm: &mut [f32], frame_size: usize) -> Result<(), DecoderError> {
        let lm = lm_for_frame_size(frame_size)
            .map_err(|_| DecoderError::InternalError("bad transform size"))?;
        let n = frame_size;
        let channels = self.channels;
        let start = self.start_band;
        let end = self.end_band;

        log::debug!("celt concealment, loss_count = {}", self.loss_count);

        // Decay the energies once the loss run gets long.
        if self.loss_count >= 2 {
            for e in self.old_band_e.iter_mut() {
                e.iter_mut().for_each(|v| *v = f32::max(*v - 1.0, -28.0));
            }
        }

        let mut freq = vec![vec![0.0_f32; n]; channels];
        for c in 0..channels {
            let mut shape = vec![0.0_f32; n];
            (start..end).for_each(|i| {
                let lo = EBANDS[i] << lm;
                let hi = EBANDS[i + 1] << lm;
                (lo..hi).for_each(|j| {
                    self.seed = lcg_rand(self.seed);
                    shape[j] = if self.seed & 0x8000 != 0 { 1.0 } else { -1.0 };
                });
                bands::renormalise_vector(&mut shape[lo..hi], 1.0);
            });
            bands::denormalise_bands(&shape, &mut freq[c], &self.old_band_e[c], start, end, lm);
        }

        let pf = (
            self.postfilter_period,
            self.postfilter_gain,
            self.postfilter_tapset,
        );
        self.synthesize(&mut freq, pcm, n, lm, false, pf);
        self.loss_count += 1;
        Ok(())
    }
}
