//! Implements the CELT layer: the MDCT-domain transform coder used for the
//! music path and the high band of hybrid streams.

pub(crate) use decoder::CeltDecoder;
pub(crate) use encoder::CeltEncoder;

pub(crate) mod alloc;
pub(crate) mod bands;
mod comb_filter;
mod decoder;
mod encoder;
mod kiss_fft;
mod mdct;
pub(crate) mod pvq;

use crate::Bandwidth;

/// Number of bands in the full-band layout.
pub(crate) const MAX_BANDS: usize = 21;
/// Size of the shortest MDCT and of the window overlap, in samples at 48 kHz.
pub(crate) const SHORT_BLOCK_SIZE: usize = 120;
/// log2 of the maximum number of short blocks per frame.
pub(crate) const MAX_LM: usize = 3;
/// Largest frame size handled by the transform layer.
pub(crate) const MAX_FRAME_SIZE: usize = SHORT_BLOCK_SIZE << MAX_LM;
/// Comb filter periods, bounded by the pitch coding range.
pub(crate) const COMBFILTER_MINPERIOD: usize = 15;
pub(crate) const COMBFILTER_MAXPERIOD: usize = 1024;

/// Band boundaries in units of one 2.5 ms MDCT bin. Band `i` of an LM-sized
/// frame covers bins `EBANDS[i] << LM .. EBANDS[i + 1] << LM`.
pub(crate) const EBANDS: [usize; MAX_BANDS + 1] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 34, 40, 48, 60, 78, 100,
];

/// log2 of the band widths in 1/8th bits, for a 2.5 ms frame.
pub(crate) const LOG_N: [i32; MAX_BANDS] = [
    0, 0, 0, 0, 0, 0, 0, 0, 8, 8, 8, 8, 16, 16, 16, 21, 21, 24, 29, 34, 36,
];

/// Mean band energies subtracted before coarse coding, in log2 units.
#[rustfmt::skip]
pub(crate) const E_MEANS: [f32; MAX_BANDS] = [
    6.437_5, 6.25, 5.75, 5.312_5, 5.062_5, 4.812_5, 4.5, 4.375, 4.875, 4.687_5,
    4.562_5, 4.437_5, 4.875, 4.625, 4.312_5, 4.5, 4.375, 4.625, 4.75, 4.437_5, 3.75,
];

/// Inter-frame energy prediction coefficients per frame size (Q15 over 32768).
pub(crate) const PRED_COEF: [f32; 4] = [
    29440.0 / 32768.0,
    26112.0 / 32768.0,
    21248.0 / 32768.0,
    16384.0 / 32768.0,
];

/// Inter-band feedback coefficients for the coarse energy predictor.
pub(crate) const BETA_COEF: [f32; 4] = [
    30147.0 / 32768.0,
    22282.0 / 32768.0,
    12124.0 / 32768.0,
    6554.0 / 32768.0,
];

/// Inter-band feedback coefficient used for intra frames.
pub(crate) const BETA_INTRA: f32 = 4915.0 / 32768.0;

/// Laplace probability model for the coarse energy residuals, as
/// (fs, decay) pairs per band, indexed by frame size and intra flag.
#[rustfmt::skip]
pub(crate) const E_PROB_MODEL: [[[u8; 42]; 2]; 4] = [
    // 120 sample frames.
    [
        // Inter
        [
             72, 127,  65, 129,  66, 128,  65, 128,  64, 128,  62, 128,  64, 128,
             64, 128,  92,  78,  92,  79,  92,  78,  90,  79, 116,  41, 115,  40,
            114,  40, 132,  26, 132,  26, 145,  17, 161,  12, 176,  10, 177,  11,
        ],
        // Intra
        [
             24, 179,  48, 138,  54, 135,  54, 132,  53, 134,  56, 133,  55, 132,
             55, 132,  61, 114,  70,  96,  74,  88,  75,  88,  87,  74,  89,  66,
             91,  67, 100,  59, 108,  50, 120,  40, 122,  37,  97,  43,  78,  50,
        ],
    ],
    // 240 sample frames.
    [
        // Inter
        [
             83,  78,  84,  81,  88,  75,  86,  74,  87,  71,  90,  73,  93,  74,
             93,  74, 109,  40, 114,  36, 117,  34, 117,  34, 143,  17, 145,  18,
            146,  19, 162,  12, 165,  10, 178,   7, 189,   6, 190,   8, 177,   9,
        ],
        // Intra
        [
             23, 178,  54, 115,  63, 102,  66,  98,  69,  99,  74,  89,  71,  91,
             73,  91,  78,  89,  86,  80,  92,  66,  93,  64, 102,  59, 103,  60,
            104,  60, 117,  52, 123,  44, 138,  35, 133,  31,  97,  38,  77,  45,
        ],
    ],
    // 480 sample frames.
    [
        // Inter
        [
             61,  90,  93,  60, 105,  42, 107,  41, 110,  45, 116,  38, 113,  38,
            112,  38, 124,  26, 132,  27, 136,  19, 140,  20, 155,  14, 159,  16,
            158,  18, 170,  13, 177,  10, 187,   8, 192,   6, 175,   9, 159,  10,
        ],
        // Intra
        [
             21, 178,  59, 110,  71,  86,  75,  85,  84,  83,  91,  66,  88,  73,
             87,  72,  92,  75,  98,  72, 105,  58, 107,  54, 115,  52, 114,  55,
            112,  56, 129,  51, 132,  40, 150,  33, 140,  29,  98,  35,  77,  42,
        ],
    ],
    // 960 sample frames.
    [
        // Inter
        [
             42, 121,  96,  66, 108,  43, 111,  40, 117,  44, 123,  32, 120,  36,
            119,  33, 127,  33, 134,  34, 139,  21, 147,  23, 152,  20, 158,  25,
            154,  26, 166,  21, 173,  16, 184,  13, 184,  10, 150,  13, 139,  15,
        ],
        // Intra
        [
             22, 178,  63, 114,  74,  82,  84,  83,  92,  82, 103,  62,  96,  72,
             96,  67, 101,  73, 107,  72, 113,  55, 118,  52, 125,  52, 118,  52,
            117,  55, 135,  49, 137,  39, 157,  32, 145,  29,  97,  33,  77,  40,
        ],
    ],
];

/// Fallback distribution for coarse energy when the budget is nearly gone.
pub(crate) const SMALL_ENERGY_ICDF: [u8; 3] = [2, 1, 0];

/// Maximum per-band allocations in 1/8th bits, indexed by frame size and
/// channel count.
#[rustfmt::skip]
pub(crate) const CACHE_CAPS: [[[i32; MAX_BANDS]; 2]; 4] = [
    // 120-sample
    [
        [
            224, 224, 224, 224, 224, 224, 224, 224, 160, 160, 160, 160, 185, 185, 185,
            178, 178, 168, 134,  61,  37,
        ],
        [
            224, 224, 224, 224, 224, 224, 224, 224, 240, 240, 240, 240, 207, 207, 207,
            198, 198, 183, 144,  66,  40,
        ],
    ],
    // 240-sample
    [
        [
            160, 160, 160, 160, 160, 160, 160, 160, 185, 185, 185, 185, 193, 193, 193,
            183, 183, 172, 138,  64,  38,
        ],
        [
            240, 240, 240, 240, 240, 240, 240, 240, 207, 207, 207, 207, 204, 204, 204,
            193, 193, 180, 143,  66,  40,
        ],
    ],
    // 480-sample
    [
        [
            185, 185, 185, 185, 185, 185, 185, 185, 193, 193, 193, 193, 193, 193, 193,
            183, 183, 172, 138,  65,  39,
        ],
        [
            207, 207, 207, 207, 207, 207, 207, 207, 204, 204, 204, 204, 201, 201, 201,
            188, 188, 176, 141,  66,  40,
        ],
    ],
    // 960-sample
    [
        [
            193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 194, 194, 194,
            184, 184, 173, 139,  65,  39,
        ],
        [
            204, 204, 204, 204, 204, 204, 204, 204, 201, 201, 201, 201, 198, 198, 198,
            187, 187, 175, 140,  66,  40,
        ],
    ],
];

/// Per-band psychoacoustic quality rows used by the allocator. Row 0 is
/// silence, the last row the maximum allocation, both in 1/8th bits per bin.
#[rustfmt::skip]
pub(crate) const BAND_ALLOCATION: [[u8; MAX_BANDS]; 11] = [
    [  0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0],
    [ 90,  80,  75,  69,  63,  56,  49,  40,  34,  29,  20,  18,  10,   0,   0,   0,   0,   0,   0,   0,   0],
    [110, 100,  90,  84,  78,  71,  65,  58,  51,  45,  39,  32,  26,  20,  12,   0,   0,   0,   0,   0,   0],
    [118, 110, 103,  93,  86,  80,  75,  70,  65,  59,  53,  47,  40,  31,  23,  15,   4,   0,   0,   0,   0],
    [126, 119, 112, 104,  95,  89,  83,  78,  72,  66,  60,  54,  47,  39,  32,  25,  17,  12,   1,   0,   0],
    [134, 127, 120, 114, 103,  97,  91,  85,  78,  72,  66,  60,  54,  47,  41,  35,  29,  23,  16,  10,   1],
    [144, 137, 130, 124, 113, 107, 101,  95,  88,  82,  76,  70,  64,  57,  51,  45,  39,  33,  26,  15,   1],
    [152, 145, 138, 132, 123, 117, 111, 105,  98,  92,  86,  80,  74,  67,  61,  55,  49,  43,  36,  20,   1],
    [162, 155, 148, 142, 133, 127, 121, 115, 108, 102,  96,  90,  84,  77,  71,  65,  59,  53,  46,  30,   1],
    [172, 165, 158, 152, 143, 137, 131, 125, 118, 112, 106, 100,  94,  87,  81,  75,  69,  63,  56,  45,  20],
    [200, 200, 200, 200, 200, 200, 200, 200, 198, 193, 188, 183, 178, 173, 168, 163, 158, 153, 148, 129, 104],
];

/// Probability model for the spreading decision.
pub(crate) const SPREAD_ICDF: [u8; 4] = [25, 23, 2, 0];

/// Probability model for the allocation trim.
pub(crate) const TRIM_ICDF: [u8; 11] = [126, 124, 119, 109, 87, 41, 19, 9, 4, 2, 0];

/// Probability model for the post-filter tapset.
pub(crate) const TAPSET_ICDF: [u8; 3] = [2, 1, 0];

/// Per-band time-frequency adjustments, indexed by `4*isTransient + 2*tf_select + tf_changed`.
pub(crate) const TF_SELECT_TABLE: [[i8; 8]; 4] = [
    [0, -1, 0, -1, 0, -1, 0, -1],
    [0, -1, 0, -2, 1, 0, 1, -1],
    [0, -2, 0, -3, 2, 0, 1, -1],
    [0, -2, 0, -3, 3, 0, 1, -1],
];

/// The number of bands coded at a given audio bandwidth.
pub(crate) fn bands_for_bandwidth(bandwidth: Bandwidth) -> usize {
    match bandwidth {
        Bandwidth::Narrowband => 13,
        Bandwidth::Mediumband | Bandwidth::Wideband => 17,
        Bandwidth::Superwideband => 19,
        _ => MAX_BANDS,
    }
}

/// The band the high part of a hybrid stream starts at.
pub(crate) const HYBRID_START_BAND: usize = 17;

/// The Vorbis power-complementary window used on every MDCT transition
/// region, regardless of the transform size.
pub(crate) fn vorbis_window(overlap: usize) -> Vec<f32> {
    use std::f32::consts::FRAC_PI_2;

    (0..overlap)
        .map(|i| {
            let x = (i as f32 + 0.5) / overlap as f32 * FRAC_PI_2;
            (FRAC_PI_2 * x.sin() * x.sin()).sin()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_band_layout_is_monotonic() {
        EBANDS.windows(2).for_each(|w| assert!(w[0] < w[1]));
        assert_eq!(EBANDS[MAX_BANDS], 100);
    }

    #[test]
    fn test_window_is_power_complementary() {
        let window = vorbis_window(SHORT_BLOCK_SIZE);
        (0..SHORT_BLOCK_SIZE).for_each(|i| {
            let rise = window[i];
            let fall = window[SHORT_BLOCK_SIZE - 1 - i];
            let sum = rise * rise + fall * fall;
            assert!((sum - 1.0).abs() < 1e-5, "i = {}, sum = {}", i, sum);
        });
    }

    #[test]
    fn test_prob_model_fits_q15() {
        E_PROB_MODEL.iter().flatten().for_each(|model| {
            model.chunks(2).for_each(|pair| {
                let fs = u32::from(pair[0]) << 7;
                let decay = u32::from(pair[1]) << 6;
                assert!(fs > 0 && fs < 32768);
                assert!(decay < 16384);
            });
        });
    }
}
