//! Implements the band bit allocator.
//!
//! Both sides run the identical algorithm from identically coded inputs
//! (band boosts, trim, remaining budget), so the per-band shape and fine
//! energy budgets never have to be transmitted; only the skip, intensity and
//! dual-stereo decisions cost bits, and those are coded from inside the
//! allocation loop.

use crate::celt::{BAND_ALLOCATION, CACHE_CAPS, EBANDS, LOG_N, MAX_BANDS};
use crate::encoder_error::EncoderError;
use crate::range_coder::{RangeDecoder, RangeEncoder, BITRES};

/// Bits (1/8th units, <<3) of coding an integer uniform over `n` values.
pub(crate) const LOG2_FRAC_TABLE: [i32; 24] = [
    0, 8, 13, 16, 19, 21, 23, 24, 26, 27, 28, 29, 30, 31, 32, 32, 33, 34, 34, 35, 36, 36, 37, 37,
];

const ALLOC_STEPS: i32 = 6;
const MAX_FINE_BITS: i32 = 8;
const FINE_OFFSET: i32 = 21;

/// The allocator codes its in-band decisions through this seam so that the
/// encoder and decoder share one implementation.
pub(crate) trait AllocBits {
    /// Codes (or decodes) one skip flag. `val` is the encoder's decision and
    /// is ignored when decoding.
    fn skip_bit(&mut self, val: bool) -> Result<bool, EncoderError>;
    /// Codes the first intensity-coupled band as a uniform integer in `0..ft`.
    fn intensity(&mut self, val: u32, ft: u32) -> Result<u32, EncoderError>;
    /// Codes the dual-stereo flag.
    fn dual_stereo(&mut self, val: bool) -> Result<bool, EncoderError>;
}

pub(crate) struct EncoderBits<'a, 'e> {
    pub(crate) enc: &'a mut RangeEncoder<'e>,
}

impl<'a, 'e> AllocBits for EncoderBits<'a, 'e> {
    fn skip_bit(&mut self, val: bool) -> Result<bool, EncoderError> {
        self.enc.encode_bit_logp(u32::from(val), 1)?;
        Ok(val)
    }

    fn intensity(&mut self, val: u32, ft: u32) -> Result<u32, EncoderError> {
        self.enc.encode_uint(val, ft)?;
        Ok(val)
    }

    fn dual_stereo(&mut self, val: bool) -> Result<bool, EncoderError> {
        self.enc.encode_bit_logp(u32::from(val), 1)?;
        Ok(val)
    }
}

pub(crate) struct DecoderBits<'a, 'd> {
    pub(crate) dec: &'a mut RangeDecoder<'d>,
}

impl<'a, 'd> AllocBits for DecoderBits<'a, 'd> {
    fn skip_bit(&mut self, _val: bool) -> Result<bool, EncoderError> {
        Ok(self.dec.decode_bit_logp(1))
    }

    fn intensity(&mut self, _val: u32, ft: u32) -> Result<u32, EncoderError> {
        Ok(self.dec.decode_uint(ft))
    }

    fn dual_stereo(&mut self, _val: bool) -> Result<bool, EncoderError> {
        Ok(self.dec.decode_bit_logp(1))
    }
}

/// The outcome of the allocation: everything the shape and energy coders
/// need, in 1/8th-bit units where applicable.
#[derive(Clone, Debug, Default)]
pub(crate) struct Allocation {
    /// Shape (PVQ) budget per band, summed over channels.
    pub(crate) shape_bits: [i32; MAX_BANDS],
    /// Fine energy bits per band and channel.
    pub(crate) fine_bits: [i32; MAX_BANDS],
    /// Whether a band takes priority in the final fine-energy pass.
    pub(crate) fine_priority: [bool; MAX_BANDS],
    /// Bands actually coded; everything above is skipped.
    pub(crate) coded_bands: usize,
    /// Unspent eighth-bits carried into the shape coder.
    pub(crate) balance: i32,
    /// First intensity-coupled band (== end when off).
    pub(crate) intensity: usize,
    /// Dual-stereo flag.
    pub(crate) dual_stereo: bool,
}

/// The maximum allocation for each band, in 1/8th bits.
pub(crate) fn band_caps(lm: usize, channels: usize) -> [i32; MAX_BANDS] {
    let mut caps = [0_i32; MAX_BANDS];
    caps.iter_mut().enumerate().for_each(|(j, cap)| {
        let n = (EBANDS[j + 1] - EBANDS[j]) << lm;
        *cap = (CACHE_CAPS[lm][channels - 1][j] + 64) * (channels * n) as i32 >> 2;
    });
    caps
}

/// Per-band bits at one quality row, before boosts.
fn row_bits(row: usize, j: usize, lm: usize, channels: usize, trim_offset: i32) -> i32 {
    let n = (EBANDS[j + 1] - EBANDS[j]) << lm;
    let mut bits = (channels * n) as i32 * i32::from(BAND_ALLOCATION[row][j]) >> 2;
    if bits > 0 {
        bits = i32::max(0, bits + trim_offset);
    }
    bits
}

struct AllocContext {
    start: usize,
    end: usize,
    lm: usize,
    channels: usize,
    thresh: [i32; MAX_BANDS],
    trim_offset: [i32; MAX_BANDS],
    caps: [i32; MAX_BANDS],
}

impl AllocContext {
    fn new(start: usize, end: usize, lm: usize, channels: usize, alloc_trim: i32) -> Self {
        let caps = band_caps(lm, channels);
        let mut thresh = [0_i32; MAX_BANDS];
        let mut trim_offset = [0_i32; MAX_BANDS];

        (start..end).for_each(|j| {
            let n = ((EBANDS[j + 1] - EBANDS[j]) << lm) as i32;
            // The minimum allocation that buys at least half a bit per sample.
            thresh[j] = i32::max((channels as i32) << BITRES, (3 * n << BITRES) >> 4);
            // Tilt of the allocation curve: positive trim favors low bands.
            trim_offset[j] = (channels as i32 * n * (alloc_trim - 5 - lm as i32)
                * (end - j - 1) as i32)
                << BITRES
                >> 6;
            if (EBANDS[j + 1] - EBANDS[j]) << lm == 1 {
                trim_offset[j] -= (channels as i32) << BITRES;
            }
        });

        Self {
            start,
            end,
            lm,
            channels,
            thresh,
            trim_offset,
            caps,
        }
    }

    fn bins(&self, from: usize, to: usize) -> i32 {
        ((EBANDS[to] - EBANDS[from]) << self.lm) as i32
    }
}

/// Computes the band allocation for the given total budget in 1/8th bits.
///
/// `intensity_req` and `dual_stereo_req` carry the encoder's stereo requests
/// in; the returned `Allocation` carries the coded decisions out.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_allocation<B: AllocBits>(
    start: usize,
    end: usize,
    lm: usize,
    channels: usize,
    offsets: &[i32; MAX_BANDS],
    alloc_trim: i32,
    intensity_req: usize,
    dual_stereo_req: bool,
    total: i32,
    bits: &mut B,
) -> Result<Allocation, EncoderError> {
    let ctx = AllocContext::new(start, end, lm, channels, alloc_trim);
    let total = i32::max(total, 0);

    // Reservations: one bit for the final skip, the intensity index and one
    // bit for dual stereo, in that order of priority.
    let mut skip_rsv = 0;
    let mut total = total;
    if total >= 1 << BITRES {
        skip_rsv = 1 << BITRES;
        total -= skip_rsv;
    }
    let mut intensity_rsv = 0;
    let mut dual_stereo_rsv = 0;
    if channels == 2 {
        intensity_rsv = LOG2_FRAC_TABLE[end - start];
        if intensity_rsv > total {
            intensity_rsv = 0;
        } else {
            total -= intensity_rsv;
            if total >= 1 << BITRES {
                dual_stereo_rsv = 1 << BITRES;
                total -= dual_stereo_rsv;
            }
        }
    }

    // Bisection over the quality rows.
    let mut lo = 1_usize;
    let mut hi = BAND_ALLOCATION.len() - 1;
    while lo <= hi {
        let mid = (lo + hi) >> 1;
        let mut psum = 0;
        let mut done = false;
        (start..end).rev().for_each(|j| {
            let bitsj = row_bits(mid, j, lm, channels, ctx.trim_offset[j]) + offsets[j];
            if bitsj >= ctx.thresh[j] || done {
                done = true;
                psum += i32::min(bitsj, ctx.caps[j]);
            } else if bitsj >= (channels as i32) << BITRES {
                psum += (channels as i32) << BITRES;
            }
        });
        if psum > total {
            if mid == 0 {
                break;
            }
            hi = mid - 1;
        } else {
            lo = mid + 1;
        }
    }
    let quality = hi; // Highest row not exceeding the budget.
    let lo_row = quality;
    let hi_row = usize::min(quality + 1, BAND_ALLOCATION.len() - 1);

    let mut bits1 = [0_i32; MAX_BANDS];
    let mut bits2 = [0_i32; MAX_BANDS];
    (start..end).for_each(|j| {
        let b1 = row_bits(lo_row, j, lm, channels, ctx.trim_offset[j]) + offsets[j];
        let b2 = row_bits(hi_row, j, lm, channels, ctx.trim_offset[j]) + offsets[j];
        bits1[j] = b1;
        bits2[j] = i32::max(b2 - b1, 0);
    });

    // Binary interpolation between the two rows at 1/64th resolution.
    let mut ilo = 0_i32;
    let mut ihi = 1 << ALLOC_STEPS;
    (0..ALLOC_STEPS).for_each(|_| {
        let mid = (ilo + ihi) >> 1;
        let mut psum = 0;
        let mut done = false;
        (start..end).rev().for_each(|j| {
            let tmp = bits1[j] + ((mid * bits2[j]) >> ALLOC_STEPS);
            if tmp >= ctx.thresh[j] || done {
                done = true;
                psum += i32::min(tmp, ctx.caps[j]);
            } else if tmp >= (channels as i32) << BITRES {
                psum += (channels as i32) << BITRES;
            }
        });
        if psum > total {
            ihi = mid;
        } else {
            ilo = mid;
        }
    });

    let mut band_bits = [0_i32; MAX_BANDS];
    let mut psum = 0;
    let mut done = false;
    (start..end).rev().for_each(|j| {
        let mut tmp = bits1[j] + ((ilo * bits2[j]) >> ALLOC_STEPS);
        if tmp >= ctx.thresh[j] || done {
            done = true;
            tmp = i32::min(tmp, ctx.caps[j]);
        } else if tmp >= (channels as i32) << BITRES {
            tmp = (channels as i32) << BITRES;
        } else {
            tmp = 0;
        }
        band_bits[j] = tmp;
        psum += tmp;
    });

    interp_bits_to_pulses(
        &ctx,
        &mut band_bits,
        psum,
        total,
        skip_rsv,
        intensity_rsv,
        dual_stereo_rsv,
        intensity_req,
        dual_stereo_req,
        bits,
    )
}

/// Converts the per-band budget into final shape and fine-energy budgets,
/// coding the skip, intensity and dual-stereo decisions along the way.
#[allow(clippy::too_many_arguments)]
fn interp_bits_to_pulses<B: AllocBits>(
    ctx: &AllocContext,
    band_bits: &mut [i32; MAX_BANDS],
    mut psum: i32,
    mut total: i32,
    skip_rsv: i32,
    mut intensity_rsv: i32,
    mut dual_stereo_rsv: i32,
    intensity_req: usize,
    dual_stereo_req: bool,
    bits: &mut B,
) -> Result<Allocation, EncoderError> {
    let start = ctx.start;
    let end = ctx.end;
    let channels = ctx.channels as i32;
    let alloc_floor = channels << BITRES;

    // Skip decisions, working backwards from the top band. The first band is
    // never skipped.
    let mut coded_bands = end;
    loop {
        let j = coded_bands - 1;
        if j <= start {
            total += skip_rsv;
            break;
        }

        // Bits this band would get including its share of the leftovers.
        let left = total - psum;
        let coded_bins = ctx.bins(start, coded_bands);
        let percoeff = left / coded_bins;
        let leftover = left - coded_bins * percoeff;
        let band_width = ctx.bins(j, coded_bands);
        let rem = i32::max(leftover - ctx.bins(start, j), 0);
        let mut this_bits = band_bits[j] + percoeff * band_width + rem;

        if this_bits >= i32::max(ctx.thresh[j], alloc_floor + (1 << BITRES)) {
            // The encoder keeps a band when it still earns a useful depth.
            let keep = coded_bands <= start + 2
                || this_bits > ((9 * band_width) << BITRES) >> 4;
            if bits.skip_bit(keep)? {
                break;
            }
            // We used a bit to skip this band.
            psum += 1 << BITRES;
            this_bits -= 1 << BITRES;
        }

        // Reclaim the bits originally allocated to this band.
        psum -= band_bits[j] + intensity_rsv;
        if intensity_rsv > 0 {
            intensity_rsv = LOG2_FRAC_TABLE[j - start];
        }
        psum += intensity_rsv;
        if this_bits >= alloc_floor {
            // Keep a minimal allocation for the band's energy.
            psum += alloc_floor;
            band_bits[j] = alloc_floor;
        } else {
            band_bits[j] = 0;
        }

        coded_bands -= 1;
    }

    // Stereo decisions.
    let mut intensity = 0_usize;
    if intensity_rsv > 0 {
        let req = usize::min(intensity_req, coded_bands);
        let coded = bits.intensity(
            (req.max(start) - start) as u32,
            (coded_bands + 1 - start) as u32,
        )?;
        intensity = start + coded as usize;
    }
    let mut dual_stereo = false;
    if intensity <= start {
        total += dual_stereo_rsv;
        dual_stereo_rsv = 0;
    }
    if dual_stereo_rsv > 0 {
        dual_stereo = bits.dual_stereo(dual_stereo_req)?;
    }

    // Distribute the leftovers proportionally to band width.
    let left = i32::max(total - psum, 0);
    let coded_bins = ctx.bins(start, coded_bands);
    let percoeff = left / coded_bins;
    let mut leftover = left - coded_bins * percoeff;
    (start..coded_bands).for_each(|j| {
        band_bits[j] += percoeff * ctx.bins(j, j + 1);
    });
    (start..coded_bands).for_each(|j| {
        let tmp = i32::min(leftover, ctx.bins(j, j + 1));
        band_bits[j] += tmp;
        leftover -= tmp;
    });

    // Split each band's budget into fine energy and shape bits.
    let mut result = Allocation {
        coded_bands,
        intensity,
        dual_stereo,
        ..Allocation::default()
    };
    let log_m = (ctx.lm as i32) << BITRES;
    let mut balance = 0;

    (start..coded_bands).for_each(|j| {
        let n = ctx.bins(j, j + 1);
        let bit = band_bits[j] + balance;
        let mut excess;

        if n > 1 {
            excess = i32::max(bit - ctx.caps[j], 0);
            let bit = bit - excess;

            // Number of fine energy quantizers sharing the band's bits.
            let den = channels * n
                + i32::from(channels == 2 && n > 2 && !dual_stereo && j < intensity);
            let n_c_log_n = den * (LOG_N[j] + log_m);
            let mut offset = (n_c_log_n >> 1) - den * FINE_OFFSET;
            if n == 2 {
                offset += (den << BITRES) >> 2;
            }
            // Make the first two fine bits cheaper to acquire.
            if bit + offset < (den * 2) << BITRES {
                offset += n_c_log_n >> 2;
            } else if bit + offset < (den * 3) << BITRES {
                offset += n_c_log_n >> 3;
            }

            let mut ebits = i32::max(0, bit + offset + (den << (BITRES - 1)));
            ebits = (ebits / den) >> BITRES;
            if channels * ebits > bit >> BITRES {
                ebits = bit >> (channels - 1) >> BITRES;
            }
            ebits = i32::min(ebits, MAX_FINE_BITS);

            result.fine_priority[j] = ebits * (den << BITRES) >= bit + offset;
            result.fine_bits[j] = ebits;
            result.shape_bits[j] = i32::max(0, bit - channels * ebits * (1 << BITRES));
        } else {
            // One-bin bands only get their sign and energy coded.
            excess = i32::max(0, bit - (channels << BITRES));
            result.shape_bits[j] = bit - excess;
            result.fine_bits[j] = 0;
            result.fine_priority[j] = true;
        }

        // Excess goes to fine energy up to the cap, the rest to the balance
        // shared with the following bands.
        if excess > 0 {
            let extra_fine = i32::min(
                excess >> (channels - 1) >> BITRES,
                MAX_FINE_BITS - result.fine_bits[j],
            );
            result.fine_bits[j] += extra_fine;
            let extra_bits = extra_fine * channels << BITRES;
            result.fine_priority[j] = extra_bits >= excess - balance;
            excess -= extra_bits;
        }
        balance = excess;
    });
    result.balance = balance;

    // Skipped bands spend their floor allocation on fine energy.
    (coded_bands..end).for_each(|j| {
        result.fine_bits[j] = band_bits[j] >> (channels - 1) >> BITRES;
        result.shape_bits[j] = 0;
        result.fine_priority[j] = false;
    });

    Ok(result)
}

/// Decodes (or encodes) the dynamic band boosts that precede the allocation.
///
/// Mirrored by `encode_boosts` on the encoder side; the decoder variant lives
/// in the band decoder. Returns the total boost in 1/8th bits.
pub(crate) fn boost_quanta(j: usize, lm: usize, channels: usize) -> i32 {
    let n = ((EBANDS[j + 1] - EBANDS[j]) << lm) as i32 * channels as i32;
    // Quanta is 6 bits, but no more than one bit per sample.
    i32::min(n << BITRES, i32::max(6 << BITRES, n))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::range_coder::{RangeDecoder, RangeEncoder};

    fn run_allocation(
        total: i32,
        lm: usize,
        channels: usize,
        trim: i32,
    ) -> (Allocation, Allocation) {
        let offsets = [0_i32; MAX_BANDS];
        let mut buffer = vec![0_u8; 1275];

        let mut enc = RangeEncoder::new(&mut buffer);
        let enc_alloc = {
            let mut coder = EncoderBits { enc: &mut enc };
            compute_allocation(0, 21, lm, channels, &offsets, trim, 21, false, total, &mut coder)
                .unwrap()
        };
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        let dec_alloc = {
            let mut coder = DecoderBits { dec: &mut dec };
            compute_allocation(0, 21, lm, channels, &offsets, trim, 21, false, total, &mut coder)
                .unwrap()
        };

        (enc_alloc, dec_alloc)
    }

    #[test]
    fn test_encoder_and_decoder_agree() {
        for &total in [500_i32, 1000, 2000, 5300, 10000].iter() {
            for &lm in [0_usize, 1, 2, 3].iter() {
                for &channels in [1_usize, 2].iter() {
                    let (enc_alloc, dec_alloc) = run_allocation(total, lm, channels, 5);

                    assert_eq!(enc_alloc.coded_bands, dec_alloc.coded_bands);
                    assert_eq!(enc_alloc.shape_bits, dec_alloc.shape_bits);
                    assert_eq!(enc_alloc.fine_bits, dec_alloc.fine_bits);
                    assert_eq!(enc_alloc.balance, dec_alloc.balance);
                    assert_eq!(enc_alloc.intensity, dec_alloc.intensity);
                    assert_eq!(enc_alloc.dual_stereo, dec_alloc.dual_stereo);
                }
            }
        }
    }

    #[test]
    fn test_allocation_stays_within_budget() {
        for &total in [400_i32, 1328, 2656, 8000].iter() {
            let (alloc, _) = run_allocation(total, 3, 1, 5);

            let spent: i32 = alloc.shape_bits.iter().sum::<i32>()
                + alloc
                    .fine_bits
                    .iter()
                    .map(|&b| b * (1 << BITRES))
                    .sum::<i32>();
            assert!(
                spent <= total + (1 << BITRES),
                "spent {} of {}",
                spent,
                total
            );
        }
    }

    #[test]
    fn test_more_bits_never_reduce_coded_bands() {
        let mut prev = 0;
        for &total in [300_i32, 600, 1200, 2400, 4800, 9600].iter() {
            let (alloc, _) = run_allocation(total, 2, 1, 5);
            assert!(alloc.coded_bands >= prev);
            prev = alloc.coded_bands;
        }
    }

    #[test]
    fn test_caps_are_respected() {
        let caps = band_caps(3, 1);
        let (alloc, _) = run_allocation(20000, 3, 1, 5);
        (0..MAX_BANDS).for_each(|j| {
            assert!(
                alloc.shape_bits[j] <= caps[j] + (MAX_FINE_BITS << BITRES),
                "band {} overshoots its cap",
                j
            );
        });
    }
}
