//! Implement the Opus encoder.

use crate::celt::{bands_for_bandwidth, CeltEncoder, HYBRID_START_BAND, MAX_BANDS};
use crate::range_coder::{RangeEncoder, Tell};
use crate::silk::resampler::Resampler;
use crate::silk::SilkEncoder;
use crate::{
    Application, Bandwidth, Channels, CodecMode, EncoderError, Sample, SamplingRate, Signal,
};

/// Largest Opus packet.
const MAX_PACKET_SIZE: usize = 1275;
/// Byte budget of a transition redundancy frame.
const REDUNDANCY_BYTES: usize = 40;
/// Duration of a redundancy frame at 48 kHz.
const REDUNDANCY_FRAME_SIZE: usize = 240;

/// Configures the encoder on creation.
#[derive(Clone, Debug)]
pub struct EncoderConfiguration {
    /// Sample rate of the input (Hz). Default: 48000 Hz.
    pub sampling_rate: SamplingRate,
    /// Number of input channels. Default: Stereo.
    pub channels: Channels,
    /// Intended application, biasing the mode decision. Default: Audio.
    pub application: Application,
}

impl Default for EncoderConfiguration {
    fn default() -> Self {
        Self {
            sampling_rate: SamplingRate::Hz48000,
            channels: Channels::Stereo,
            application: Application::Audio,
        }
    }
}

/// The mode controller: turns bitrate, signal class and application into a
/// `(mode, bandwidth)` decision with hysteresis against flapping.
#[derive(Clone, Debug)]
struct ModeControl {
    prev_mode: Option<CodecMode>,
    prev_bandwidth: Bandwidth,
    /// Consecutive frames the raw decision disagreed with the active mode.
    disagreement: u32,
    /// A SILK->CELT switch is delayed one frame for the redundancy payload.
    pending_celt: bool,
}

impl ModeControl {
    fn new() -> Self {
        Self {
            prev_mode: None,
            prev_bandwidth: Bandwidth::Fullband,
            disagreement: 0,
            pending_celt: false,
        }
    }

    /// Picks the mode for one frame. The label is a target: under forced
    /// hybrid the controller still adapts at the rate extremes.
    fn decide_mode(
        &mut self,
        frame_ms_x10: usize,
        bitrate: u32,
        channels: usize,
        application: Application,
        signal: Signal,
        forced: Option<CodecMode>,
    ) -> CodecMode {
        let rate = bitrate / channels as u32;

        let mut raw = if frame_ms_x10 < 100 || application == Application::LowDelay {
            // Only the transform path does 2.5 and 5 ms.
            CodecMode::Celt
        } else if let Some(mode) = forced {
            match mode {
                CodecMode::Hybrid if rate < 24_000 => CodecMode::Silk,
                CodecMode::Hybrid if rate > 80_000 => CodecMode::Celt,
                mode => mode,
            }
        } else {
            let voice = signal == Signal::Voice
                || (signal == Signal::Auto && application == Application::Voip);
            if voice && rate <= 24_000 {
                CodecMode::Silk
            } else if voice && rate <= 64_000 {
                CodecMode::Hybrid
            } else if rate <= 18_000 {
                CodecMode::Silk
            } else {
                CodecMode::Celt
            }
        };

        // Hybrid only exists at 10 and 20 ms.
        if raw == CodecMode::Hybrid && frame_ms_x10 > 200 {
            raw = CodecMode::Silk;
        }

        // Hysteresis: only switch after two consecutive disagreements, so a
        // single borderline frame cannot ping-pong the mode.
        match self.prev_mode {
            Some(prev) if prev != raw => {
                self.disagreement += 1;
                if self.disagreement >= 2 {
                    self.disagreement = 0;
                    raw
                } else {
                    prev
                }
            }
            _ => {
                self.disagreement = 0;
                raw
            }
        }
    }

    fn decide_bandwidth(
        &mut self,
        mode: CodecMode,
        bitrate: u32,
        channels: usize,
        requested: Bandwidth,
    ) -> Bandwidth {
        let rate = bitrate / channels as u32;

        let auto = match mode {
            CodecMode::Silk => {
                if rate < 10_000 {
                    Bandwidth::Narrowband
                } else if rate < 14_000 {
                    Bandwidth::Mediumband
                } else {
                    Bandwidth::Wideband
                }
            }
            CodecMode::Hybrid => {
                if rate < 36_000 {
                    Bandwidth::Superwideband
                } else {
                    Bandwidth::Fullband
                }
            }
            CodecMode::Celt => {
                if rate < 14_000 {
                    Bandwidth::Narrowband
                } else if rate < 40_000 {
                    Bandwidth::Wideband
                } else if rate < 56_000 {
                    Bandwidth::Superwideband
                } else {
                    Bandwidth::Fullband
                }
            }
        };

        let mut bandwidth = if requested == Bandwidth::Auto {
            auto
        } else {
            requested
        };

        // Clamp to what the chosen mode can label.
        bandwidth = match mode {
            CodecMode::Silk => match bandwidth {
                Bandwidth::Superwideband | Bandwidth::Fullband => Bandwidth::Wideband,
                other => other,
            },
            CodecMode::Hybrid => match bandwidth {
                Bandwidth::Fullband => Bandwidth::Fullband,
                _ => Bandwidth::Superwideband,
            },
            CodecMode::Celt => match bandwidth {
                // The transform layer has no mediumband layout.
                Bandwidth::Mediumband => Bandwidth::Wideband,
                other => other,
            },
        };

        self.prev_bandwidth = bandwidth;
        bandwidth
    }
}

/// Opus encoder.
pub struct Encoder {
    silk_enc: SilkEncoder,
    celt_enc: CeltEncoder,
    channels: Channels,
    sampling_rate: SamplingRate,
    application: Application,

    /// Input resamplers when feeding below 48 kHz.
    in_resamplers: Vec<Resampler>,

    bitrate: u32,
    vbr: bool,
    requested_bandwidth: Bandwidth,
    forced_mode: Option<CodecMode>,
    signal: Signal,
    complexity: u8,
    packet_loss_perc: u8,
    lsb_depth: u8,

    control: ModeControl,
    /// Whether the previous packet carried trailing redundancy, which
    /// already restarted the transform state on both sides.
    prev_redundancy: bool,
    final_range: u32,
}

impl Encoder {
    /// Creates a new `Encoder` with the given configuration.
    pub fn new(configuration: &EncoderConfiguration) -> Result<Self, EncoderError> {
        let in_resamplers = if configuration.sampling_rate != SamplingRate::Hz48000 {
            (0..configuration.channels as usize)
                .map(|_| Resampler::new(configuration.sampling_rate as u32, 48000))
                .collect::<Result<_, _>>()?
        } else {
            Vec::new()
        };

        Ok(Self {
            silk_enc: SilkEncoder::new(configuration.channels)?,
            celt_enc: CeltEncoder::new(configuration.channels),
            channels: configuration.channels,
            sampling_rate: configuration.sampling_rate,
            application: configuration.application,
            in_resamplers,
            bitrate: 64_000,
            vbr: true,
            requested_bandwidth: Bandwidth::Auto,
            forced_mode: None,
            signal: Signal::Auto,
            complexity: 5,
            packet_loss_perc: 0,
            lsb_depth: 16,
            control: ModeControl::new(),
            prev_redundancy: false,
            final_range: 0,
        })
    }

    /// Resets the encoder to a freshly initialized state.
    pub fn reset(&mut self) {
        self.silk_enc.reset();
        self.celt_enc.reset();
        self.in_resamplers.iter_mut().for_each(|r| r.reset());
        self.control = ModeControl::new();
        self.prev_redundancy = false;
    }

    /// Sets the target bitrate in bits per second.
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), EncoderError> {
        if !(500..=512_000).contains(&bitrate) {
            return Err(EncoderError::BadArguments("bitrate out of range"));
        }
        self.bitrate = bitrate;
        Ok(())
    }

    /// Restricts the audio bandwidth, or `Auto` to derive it from the rate.
    pub fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.requested_bandwidth = bandwidth;
    }

    /// Hints the signal class to the mode decision.
    pub fn set_signal_type(&mut self, signal: Signal) {
        self.signal = signal;
    }

    /// Forces a codec mode, or `None` for automatic selection. The label is
    /// adaptive: a forced hybrid still degrades to SILK or CELT at the rate
    /// extremes.
    pub fn set_mode(&mut self, mode: Option<CodecMode>) {
        self.forced_mode = mode;
    }

    /// Sets the encoder complexity (0..10).
    pub fn set_complexity(&mut self, complexity: u8) -> Result<(), EncoderError> {
        if complexity > 10 {
            return Err(EncoderError::BadArguments("complexity out of range"));
        }
        self.complexity = complexity;
        self.silk_enc.set_complexity(complexity);
        Ok(())
    }

    /// Enables variable bitrate.
    pub fn set_vbr(&mut self, vbr: bool) {
        self.vbr = vbr;
    }

    /// Enables constant bitrate.
    pub fn set_cbr(&mut self, cbr: bool) {
        self.vbr = !cbr;
    }

    /// Configures the expected packet loss, enabling in-band redundancy.
    pub fn set_packet_loss_perc(&mut self, perc: u8) -> Result<(), EncoderError> {
        if perc > 100 {
            return Err(EncoderError::BadArguments("loss percentage out of range"));
        }
        self.packet_loss_perc = perc;
        self.silk_enc.set_packet_loss_perc(perc);
        Ok(())
    }

    /// Declares the depth of the input samples (8..24).
    pub fn set_lsb_depth(&mut self, depth: u8) -> Result<(), EncoderError> {
        if !(8..=24).contains(&depth) {
            return Err(EncoderError::BadArguments("lsb depth out of range"));
        }
        self.lsb_depth = depth;
        Ok(())
    }

    /// Returns the final state of the codec's entropy coder, for parity
    /// checks against the decoder.
    pub fn final_range(&self) -> u32 {
        self.final_range
    }

    /// Reports the pitch of the last analyzed frame at 48 kHz.
    pub fn pitch(&self) -> u32 {
        self.silk_enc.pitch()
    }

    /// Encodes one frame of PCM (interleaved if stereo) into `output`.
    ///
    /// `frame_size` is in samples per channel at the configured rate and
    /// must correspond to 2.5, 5, 10, 20, 40 or 60 ms. Returns the number of
    /// bytes written; the packet is `output[..n]`.
    pub fn encode(
        &mut self,
        pcm: &[i16],
        frame_size: usize,
        output: &mut [u8],
    ) -> Result<usize, EncoderError> {
        let channels = self.channels as usize;
        if pcm.len() < frame_size * channels {
            return Err(EncoderError::BadArguments("input shorter than frame_size"));
        }

        let rate = self.sampling_rate as usize;
        let frame_ms_x10 = frame_size * 10_000 / rate;
        if frame_size * 10_000 != frame_ms_x10 * rate
            || !matches!(frame_ms_x10, 25 | 50 | 100 | 200 | 400 | 600)
        {
            return Err(EncoderError::BadArguments("unsupported frame size"));
        }

        // Bring the input to the 48 kHz internal rate.
        let frame48 = frame_size * 48000 / rate;
        let pcm48: Vec<i16> = if rate == 48000 {
            pcm[..frame_size * channels].to_vec()
        } else {
            let mut out = vec![0_i16; frame48 * channels];
            for c in 0..channels {
                let mono: Vec<i16> = (0..frame_size).map(|i| pcm[i * channels + c]).collect();
                let mut up = vec![0_i16; frame48];
                let produced = self.in_resamplers[c].process(&mono, &mut up);
                debug_assert_eq!(produced, frame48);
                (0..frame48).for_each(|i| out[i * channels + c] = up[i]);
            }
            out
        };

        // Mode and bandwidth decisions.
        let mut mode = self.control.decide_mode(
            frame_ms_x10,
            self.bitrate,
            channels,
            self.application,
            self.signal,
            self.forced_mode,
        );

        // A switch from the SILK side to CELT is delayed one frame: the
        // transition frame stays SILK and carries a trailing redundancy
        // payload the decoder uses to mask the discontinuity.
        let prev_mode = self.control.prev_mode;
        let mut to_celt_redundancy = false;
        let mut celt_to_silk_redundancy = false;
        if let Some(prev) = prev_mode {
            let prev_silk_side = prev != CodecMode::Celt;
            let new_silk_side = mode != CodecMode::Celt;
            if prev_silk_side && !new_silk_side && frame_ms_x10 >= 100 {
                if !self.control.pending_celt {
                    mode = if prev == CodecMode::Hybrid {
                        CodecMode::Hybrid
                    } else {
                        CodecMode::Silk
                    };
                    to_celt_redundancy = mode == CodecMode::Silk;
                    self.control.pending_celt = true;
                } else {
                    self.control.pending_celt = false;
                }
            } else if !prev_silk_side && new_silk_side {
                celt_to_silk_redundancy = mode == CodecMode::Silk;
            } else {
                self.control.pending_celt = false;
            }
        }

        // Entering the transform path restarts its state unless the previous
        // packet's trailing redundancy already did; the decoder follows the
        // same rule.
        if mode == CodecMode::Celt {
            if let Some(prev) = prev_mode {
                if prev != CodecMode::Celt && !self.prev_redundancy {
                    self.celt_enc.reset();
                }
            }
        }
        self.prev_redundancy = false;

        let bandwidth =
            self.control
                .decide_bandwidth(mode, self.bitrate, channels, self.requested_bandwidth);

        // Byte budget.
        let target_bytes = (self.bitrate as usize * frame_ms_x10 / 10 / 8000)
            .max(8)
            .min(MAX_PACKET_SIZE - 1)
            .min(output.len().saturating_sub(1));
        if target_bytes < 8 {
            return Err(EncoderError::BufferTooSmall);
        }

        let result = match mode {
            CodecMode::Celt if frame_ms_x10 > 200 => self.encode_celt_multiframe(
                &pcm48,
                frame_ms_x10,
                bandwidth,
                target_bytes,
                output,
            ),
            _ => self.encode_single(
                &pcm48,
                frame_ms_x10,
                mode,
                bandwidth,
                target_bytes,
                output,
                to_celt_redundancy,
                celt_to_silk_redundancy,
            ),
        };

        if to_celt_redundancy {
            self.prev_redundancy = true;
        }

        let n = match result {
            Ok(n) => n,
            Err(EncoderError::BudgetExceeded) => {
                // Last resort: a minimal valid packet. The decoder reads
                // deterministic zeros past the end of the tiny payload.
                log::warn!("frame did not fit its byte budget, emitting minimal packet");
                output[0] = build_toc(mode, bandwidth, frame_ms_x10, self.channels, 0);
                output[1] = 0;
                2
            }
            Err(err) => return Err(err),
        };

        self.control.prev_mode = Some(mode);
        Ok(n)
    }

    /// Encodes PCM given as floats. See [`Encoder::encode`].
    pub fn encode_float(
        &mut self,
        pcm: &[f32],
        frame_size: usize,
        output: &mut [u8],
    ) -> Result<usize, EncoderError> {
        let fixed: Vec<i16> = pcm.iter().map(|v| i16::from_f32(v.to_f32())).collect();
        self.encode(&fixed, frame_size, output)
    }

    /// One frame, framing code 0.
    #[allow(clippy::too_many_arguments)]
    fn encode_single(
        &mut self,
        pcm48: &[i16],
        frame_ms_x10: usize,
        mode: CodecMode,
        bandwidth: Bandwidth,
        target_bytes: usize,
        output: &mut [u8],
        to_celt_redundancy: bool,
        celt_to_silk_redundancy: bool,
    ) -> Result<usize, EncoderError> {
        let toc = build_toc(mode, bandwidth, frame_ms_x10, self.channels, 0);
        output[0] = toc;

        // VBR speech packets get headroom above the nominal target; the
        // shrink after coding brings them back to their actual size.
        let buf_bytes = if self.vbr && mode == CodecMode::Silk {
            (target_bytes * 2)
                .min(MAX_PACKET_SIZE - 1)
                .min(output.len().saturating_sub(1))
        } else {
            target_bytes
        };

        let payload = &mut output[1..1 + buf_bytes];
        let redundancy =
            (to_celt_redundancy || celt_to_silk_redundancy) && buf_bytes > 2 * REDUNDANCY_BYTES;
        let main_len = if redundancy {
            buf_bytes - REDUNDANCY_BYTES
        } else {
            buf_bytes
        };

        let frame48 = frame_ms_x10 * 48 / 10;
        let used = {
            let (main_buf, red_buf) = payload.split_at_mut(main_len);
            let mut enc = RangeEncoder::new(main_buf);

            match mode {
                CodecMode::Silk => {
                    self.silk_enc.set_bandwidth(bandwidth)?;
                    self.silk_enc.set_bitrate(self.bitrate);
                    self.silk_enc.encode(&mut enc, pcm48, frame_ms_x10 / 10)?;

                    // Redundancy signaling mirrors the decoder's budget gate,
                    // evaluated against the final packet length. A shrunk VBR
                    // packet never passes the gate, so the flag is only coded
                    // on CBR and redundancy-carrying packets.
                    if redundancy {
                        enc.encode_bit_logp(1, 12)?;
                        enc.encode_bit_logp(u32::from(celt_to_silk_redundancy), 1)?;
                        enc.encode_uint((REDUNDANCY_BYTES - 2) as u32, 256)?;
                        self.encode_redundancy_frame(pcm48, frame48, red_buf)?;
                    } else if !self.vbr {
                        let total_bits = (buf_bytes * 8) as u32;
                        if enc.tell() + 17 <= total_bits {
                            enc.encode_bit_logp(0, 12)?;
                        }
                    }
                }
                CodecMode::Hybrid => {
                    self.silk_enc.set_bandwidth(Bandwidth::Wideband)?;
                    // The low band gets the lion's share below the split.
                    self.silk_enc.set_bitrate(self.bitrate * 2 / 3);
                    self.silk_enc.encode(&mut enc, pcm48, frame_ms_x10 / 10)?;

                    let pcm_f: Vec<f32> = pcm48.iter().map(|&v| f32::from(v) / 32768.0).collect();
                    self.celt_enc.set_start_band(HYBRID_START_BAND);
                    self.celt_enc.set_end_band(bands_for_bandwidth(bandwidth));
                    self.celt_enc.encode(&mut enc, &pcm_f, frame48, main_len)?;
                }
                CodecMode::Celt => {
                    let pcm_f: Vec<f32> = pcm48.iter().map(|&v| f32::from(v) / 32768.0).collect();
                    self.celt_enc.set_start_band(0);
                    self.celt_enc.set_end_band(bands_for_bandwidth(bandwidth));
                    self.celt_enc.encode(&mut enc, &pcm_f, frame48, main_len)?;
                }
            }

            // Only pure SILK packets may shrink: the transform coder's bit
            // allocation depends on the exact packet length, so CELT and
            // hybrid frames keep their chosen size.
            let used = if self.vbr && !redundancy && mode == CodecMode::Silk {
                let bytes = ((enc.tell() + 7) / 8) as usize;
                enc.shrink(bytes.max(2));
                bytes.max(2)
            } else {
                main_len
            };
            enc.done()?;
            self.final_range = enc.range();
            used
        };

        let total = if redundancy {
            // The redundant frame is already in place at the packet's tail.
            main_len + REDUNDANCY_BYTES
        } else {
            used
        };

        Ok(1 + total)
    }

    /// Encodes a 5 ms CELT frame protecting a mode transition. The transform
    /// state restarts here on both sides of the link.
    fn encode_redundancy_frame(
        &mut self,
        pcm48: &[i16],
        frame48: usize,
        out: &mut [u8],
    ) -> Result<(), EncoderError> {
        self.celt_enc.reset();
        let channels = self.channels as usize;
        let n = REDUNDANCY_FRAME_SIZE;
        // Protect the start of the frame; the decoder crossfades it in.
        let span = n.min(frame48);
        let pcm_f: Vec<f32> = pcm48[..span * channels]
            .iter()
            .map(|&v| f32::from(v) / 32768.0)
            .collect();

        let mut enc = RangeEncoder::new(out);
        self.celt_enc.set_start_band(0);
        self.celt_enc.set_end_band(MAX_BANDS);
        self.celt_enc.encode(&mut enc, &pcm_f, n, REDUNDANCY_BYTES)?;
        enc.done()?;
        Ok(())
    }

    /// 40 and 60 ms transform frames are carried as two or three 20 ms
    /// frames in a code 3 CBR packet.
    fn encode_celt_multiframe(
        &mut self,
        pcm48: &[i16],
        frame_ms_x10: usize,
        bandwidth: Bandwidth,
        target_bytes: usize,
        output: &mut [u8],
    ) -> Result<usize, EncoderError> {
        let channels = self.channels as usize;
        let count = frame_ms_x10 / 200;
        let per_frame = ((target_bytes - 1) / count).min(MAX_PACKET_SIZE).max(8);

        output[0] = build_toc(CodecMode::Celt, bandwidth, 200, self.channels, 3);
        // CBR, no padding, `count` frames.
        output[1] = count as u8;

        let frame48 = 960;
        let mut offset = 2;
        for f in 0..count {
            let pcm_f: Vec<f32> = pcm48[f * frame48 * channels..(f + 1) * frame48 * channels]
                .iter()
                .map(|&v| f32::from(v) / 32768.0)
                .collect();

            let buf = &mut output[offset..offset + per_frame];
            let mut enc = RangeEncoder::new(buf);
            self.celt_enc.set_start_band(0);
            self.celt_enc.set_end_band(bands_for_bandwidth(bandwidth));
            self.celt_enc.encode(&mut enc, &pcm_f, frame48, per_frame)?;
            enc.done()?;
            self.final_range = enc.range();
            offset += per_frame;
        }

        Ok(offset)
    }
}

/// Builds the table-of-contents byte from the frame configuration.
pub(crate) fn build_toc(
    mode: CodecMode,
    bandwidth: Bandwidth,
    frame_ms_x10: usize,
    channels: Channels,
    code: u8,
) -> u8 {
    let config = match mode {
        CodecMode::Silk => {
            let row = match bandwidth {
                Bandwidth::Narrowband => 0,
                Bandwidth::Mediumband => 1,
                _ => 2,
            };
            let size = match frame_ms_x10 {
                100 => 0,
                200 => 1,
                400 => 2,
                _ => 3,
            };
            row * 4 + size
        }
        CodecMode::Hybrid => {
            let row = if bandwidth == Bandwidth::Fullband { 1 } else { 0 };
            let size = if frame_ms_x10 == 100 { 0 } else { 1 };
            12 + row * 2 + size
        }
        CodecMode::Celt => {
            let row = match bandwidth {
                Bandwidth::Narrowband => 0,
                Bandwidth::Wideband | Bandwidth::Mediumband => 1,
                Bandwidth::Superwideband => 2,
                _ => 3,
            };
            let size = match frame_ms_x10 {
                25 => 0,
                50 => 1,
                100 => 2,
                _ => 3,
            };
            16 + row * 4 + size
        }
    };

    ((config as u8) << 3) | (u8::from(channels == Channels::Stereo) << 2) | (code & 0x3)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::{query_packet_bandwidth, query_packet_codec_mode, query_packet_samples_per_frame};

    #[test]
    fn test_toc_round_trip() {
        // Every mode/bandwidth/size combination must label itself correctly.
        let cases = [
            (CodecMode::Silk, Bandwidth::Narrowband, 200_usize),
            (CodecMode::Silk, Bandwidth::Mediumband, 400),
            (CodecMode::Silk, Bandwidth::Wideband, 600),
            (CodecMode::Hybrid, Bandwidth::Superwideband, 100),
            (CodecMode::Hybrid, Bandwidth::Fullband, 200),
            (CodecMode::Celt, Bandwidth::Narrowband, 25),
            (CodecMode::Celt, Bandwidth::Wideband, 50),
            (CodecMode::Celt, Bandwidth::Superwideband, 100),
            (CodecMode::Celt, Bandwidth::Fullband, 200),
        ];

        for &(mode, bandwidth, ms_x10) in cases.iter() {
            let toc = build_toc(mode, bandwidth, ms_x10, Channels::Mono, 0);
            let packet = [toc, 0];
            assert_eq!(query_packet_codec_mode(&packet), mode, "{:?}", mode);
            assert_eq!(query_packet_bandwidth(&packet), bandwidth, "{:?}", bandwidth);
            assert_eq!(
                query_packet_samples_per_frame(&packet, SamplingRate::Hz48000),
                ms_x10 * 48 / 10,
                "{:?} {}",
                mode,
                ms_x10
            );
        }
    }

    #[test]
    fn test_mode_control_hysteresis() {
        let mut control = ModeControl::new();
        let mode = control.decide_mode(200, 12_000, 1, Application::Voip, Signal::Auto, None);
        assert_eq!(mode, CodecMode::Silk);
        control.prev_mode = Some(mode);

        // One borderline frame must not flip the mode...
        let mode2 = control.decide_mode(200, 96_000, 1, Application::Voip, Signal::Auto, None);
        assert_eq!(mode2, CodecMode::Silk);
        // ...but a persistent change must.
        let mode3 = control.decide_mode(200, 96_000, 1, Application::Voip, Signal::Auto, None);
        assert_eq!(mode3, CodecMode::Celt);
    }

    #[test]
    fn test_forced_hybrid_adapts_at_extremes() {
        let mut control = ModeControl::new();
        let low = control.decide_mode(
            200,
            12_000,
            1,
            Application::Audio,
            Signal::Auto,
            Some(CodecMode::Hybrid),
        );
        assert_eq!(low, CodecMode::Silk);

        let mut control = ModeControl::new();
        let high = control.decide_mode(
            200,
            128_000,
            1,
            Application::Audio,
            Signal::Auto,
            Some(CodecMode::Hybrid),
        );
        assert_eq!(high, CodecMode::Celt);
    }

    #[test]
    fn test_short_frames_force_celt() {
        let mut control = ModeControl::new();
        let mode = control.decide_mode(
            25,
            12_000,
            1,
            Application::Voip,
            Signal::Voice,
            Some(CodecMode::Silk),
        );
        assert_eq!(mode, CodecMode::Celt);
    }

    #[test]
    fn test_bandwidth_clamps_to_mode() {
        let mut control = ModeControl::new();
        let bw = control.decide_bandwidth(CodecMode::Silk, 64_000, 1, Bandwidth::Fullband);
        assert_eq!(bw, Bandwidth::Wideband);

        let bw = control.decide_bandwidth(CodecMode::Celt, 64_000, 1, Bandwidth::Mediumband);
        assert_eq!(bw, Bandwidth::Wideband);
    }
}
