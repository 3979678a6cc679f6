//! Implements the SILK layer: the linear-predictive speech path used for
//! SILK-only and hybrid streams.

pub(crate) use decoder::SilkDecoder;
pub(crate) use encoder::SilkEncoder;

pub(crate) mod decoder;
pub(crate) mod encoder;
pub(crate) mod gain;
pub(crate) mod lpc;
pub(crate) mod nsq;
pub(crate) mod pitch;
pub(crate) mod resampler;
pub(crate) mod tables;

/// LPC order for wideband frames.
pub(crate) const MAX_LPC_ORDER: usize = 16;
/// LPC order for narrowband and mediumband frames.
pub(crate) const MIN_LPC_ORDER: usize = 10;
/// Subframes per 20 ms frame.
pub(crate) const MAX_NB_SUBFR: usize = 4;
/// Subframe duration.
pub(crate) const SUB_FRAME_MS: usize = 5;
/// Taps of the long-term predictor.
pub(crate) const LTP_ORDER: usize = 5;
/// Highest internal sampling rate in kHz.
pub(crate) const MAX_FS_KHZ: usize = 16;
/// Samples in a 20 ms frame at the highest internal rate.
pub(crate) const MAX_FRAME_LEN: usize = SUB_FRAME_MS * MAX_NB_SUBFR * MAX_FS_KHZ;
/// Longest pitch lag in milliseconds.
pub(crate) const MAX_PITCH_LAG_MS: usize = 18;
/// Shortest pitch lag in milliseconds.
pub(crate) const MIN_PITCH_LAG_MS: usize = 2;
/// Pulses are leveled around this adjustment in Q10.
pub(crate) const QUANT_LEVEL_ADJUST_Q10: i32 = 80;
/// Samples per shell coder block.
pub(crate) const SHELL_BLOCK_LEN: usize = 16;
/// Order of the noise shaping filters.
pub(crate) const SHAPE_ORDER: usize = 16;

/// The excitation dither generator. Matches on any platform.
#[inline(always)]
pub(crate) fn silk_rand(seed: i32) -> i32 {
    907_633_515_i32.wrapping_add(seed.wrapping_mul(196_314_165))
}

/// Per-frame signal classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SignalType {
    /// No voice activity.
    NoActivity,
    Unvoiced,
    Voiced,
}

impl SignalType {
    /// Index used by the excitation sign and rate-level tables.
    pub(crate) fn index(self) -> usize {
        match self {
            SignalType::NoActivity => 0,
            SignalType::Unvoiced => 1,
            SignalType::Voiced => 2,
        }
    }
}

/// The parameters of one coded SILK frame. Short-lived: built during one
/// encode or decode call and dropped afterwards.
#[derive(Clone, Debug)]
pub(crate) struct FrameParams {
    pub signal_type: SignalType,
    /// Low/high quantization offset class.
    pub quant_offset: usize,
    /// Per-subframe log gain indices after delta coding.
    pub gain_indices: [i32; MAX_NB_SUBFR],
    /// Dequantized per-subframe gains.
    pub gains_q16: [i32; MAX_NB_SUBFR],
    /// Quantized normalized LSFs.
    pub nlsf_q15: [i16; MAX_LPC_ORDER],
    /// NLSF interpolation quarter (4 = no interpolation).
    pub interp_index: usize,
    /// Base pitch lag for voiced frames.
    pub pitch_base: i32,
    /// Contour codebook index spreading the lag over the subframes.
    pub pitch_contour: usize,
    /// Per-subframe pitch lags for voiced frames.
    pub pitch_lags: [i32; MAX_NB_SUBFR],
    /// Per-subframe 5-tap LTP filters in Q7.
    pub ltp_filters: [[i8; LTP_ORDER]; MAX_NB_SUBFR],
    /// LTP state scaling in Q14.
    pub ltp_scale_q14: i32,
    /// Seed of the excitation dither generator.
    pub seed: i32,
    /// Excitation pulses, one per sample.
    pub pulses: [i16; MAX_FRAME_LEN],
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            signal_type: SignalType::NoActivity,
            quant_offset: 0,
            gain_indices: [0; MAX_NB_SUBFR],
            gains_q16: [65536; MAX_NB_SUBFR],
            nlsf_q15: [0; MAX_LPC_ORDER],
            interp_index: 4,
            pitch_base: 0,
            pitch_contour: 0,
            pitch_lags: [0; MAX_NB_SUBFR],
            ltp_filters: [[0; LTP_ORDER]; MAX_NB_SUBFR],
            ltp_scale_q14: 15565,
            seed: 0,
            pulses: [0; MAX_FRAME_LEN],
        }
    }
}

/// Static configuration of a frame: internal rate and derived sizes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameConfig {
    pub fs_khz: usize,
    pub nb_subfr: usize,
    pub lpc_order: usize,
}

impl FrameConfig {
    pub(crate) fn new(fs_khz: usize, frame_ms: usize) -> Self {
        Self {
            fs_khz,
            nb_subfr: frame_ms / SUB_FRAME_MS,
            lpc_order: if fs_khz == 16 {
                MAX_LPC_ORDER
            } else {
                MIN_LPC_ORDER
            },
        }
    }

    pub(crate) fn subfr_len(&self) -> usize {
        SUB_FRAME_MS * self.fs_khz
    }

    pub(crate) fn frame_len(&self) -> usize {
        self.subfr_len() * self.nb_subfr
    }

    pub(crate) fn min_lag(&self) -> i32 {
        (MIN_PITCH_LAG_MS * self.fs_khz) as i32
    }

    pub(crate) fn max_lag(&self) -> i32 {
        (MAX_PITCH_LAG_MS * self.fs_khz) as i32
    }

    /// Size of the uniform low part of an absolute pitch lag.
    pub(crate) fn lag_low_size(&self) -> u32 {
        match self.fs_khz {
            8 => 4,
            12 => 6,
            _ => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_frame_config_sizes() {
        let wb20 = FrameConfig::new(16, 20);
        assert_eq!(wb20.frame_len(), 320);
        assert_eq!(wb20.nb_subfr, 4);
        assert_eq!(wb20.lpc_order, 16);

        let nb10 = FrameConfig::new(8, 10);
        assert_eq!(nb10.frame_len(), 80);
        assert_eq!(nb10.nb_subfr, 2);
        assert_eq!(nb10.lpc_order, 10);
    }

    #[test]
    fn test_rand_sequence_is_stable() {
        let mut seed = 0_i32;
        seed = silk_rand(seed);
        assert_eq!(seed, 907_633_515);
        seed = silk_rand(seed);
        assert_eq!(seed, -1_653_660_526);
    }
}
