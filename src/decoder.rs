//! Implement the Opus decoder.

use crate::celt::{bands_for_bandwidth, CeltDecoder, HYBRID_START_BAND};
use crate::range_coder::{RangeDecoder, Tell};
use crate::silk::resampler::Resampler;
use crate::silk::SilkDecoder;
use crate::{
    parse_packet, query_packet_bandwidth, query_packet_channel_count, query_packet_codec_mode,
    query_packet_samples_per_frame, Bandwidth, Channels, CodecMode, DecoderError, Sample,
    SamplingRate,
};

/// Duration of a redundancy frame in 48 kHz samples.
const REDUNDANCY_FRAME_SIZE: usize = 240;

/// Configures the decoder on creation.
///
/// Internally Opus stores data at 48000 Hz, so that should be the default
/// value for the sampling rate. However, the decoder can efficiently decode
/// to buffers at 8, 12, 16, and 24 kHz so if for some reason the caller
/// cannot use data at the full sample rate, or knows the compressed data
/// doesn't use the full frequency range, it can request decoding at a reduced
/// rate. Likewise, the decoder is capable of filling in either mono or
/// interleaved stereo pcm buffers, at the caller's request.
#[derive(Clone, Debug)]
pub struct DecoderConfiguration {
    /// Sample rate to decode at (Hz). Default: 48000 Hz.
    pub sampling_rate: SamplingRate,
    /// Number of channels to decode. Default: Stereo.
    pub channels: Channels,
    /// Scales the decoded output by a factor specified in Q8 dB units. Default: 0.
    pub gain: i16,
}

impl Default for DecoderConfiguration {
    fn default() -> Self {
        Self {
            sampling_rate: SamplingRate::Hz48000,
            channels: Channels::Stereo,
            gain: 0,
        }
    }
}

/// Opus decoder.
///
/// Opus is a stateful codec with overlapping blocks and as a result Opus
/// packets are not coded independently of each other. Packets must be
/// passed into the decoder serially and in the correct order for a correct
/// decode. Lost packets can be replaced with loss concealment by calling
/// the decoder with `None` for the missing packet.
pub struct Decoder {
    celt_dec: CeltDecoder,
    silk_dec: SilkDecoder,
    channels: Channels,
    sampling_rate: SamplingRate,
    decode_gain: i16,

    /// Output resamplers when decoding below 48 kHz.
    out_resamplers: Vec<Resampler>,

    bandwidth: Bandwidth,
    prev_mode: Option<CodecMode>,
    prev_frame_size48: usize,
    last_packet_duration: Option<u32>,

    /// Scratch for the 48 kHz pipeline, reused across calls.
    work_buffer: Vec<f32>,
    /// Whether the previous packet carried trailing transition redundancy,
    /// which already restarted the transform state.
    prev_redundancy: bool,
    final_range: u32,
}

impl Decoder {
    /// Creates a new `Decoder` with the given configuration.
    pub fn new(configuration: &DecoderConfiguration) -> Result<Self, DecoderError> {
        let celt_dec = CeltDecoder::new(configuration.channels)?;
        let silk_dec = SilkDecoder::new(configuration.channels)?;

        let out_resamplers = if configuration.sampling_rate != SamplingRate::Hz48000 {
            (0..configuration.channels as usize)
                .map(|_| Resampler::new(48000, configuration.sampling_rate as u32))
                .collect::<Result<_, _>>()
                .map_err(|_| DecoderError::InternalError("unsupported output rate"))?
        } else {
            Vec::new()
        };

        Ok(Self {
            celt_dec,
            silk_dec,
            sampling_rate: configuration.sampling_rate,
            channels: configuration.channels,
            decode_gain: configuration.gain,
            out_resamplers,
            bandwidth: Bandwidth::Auto,
            prev_mode: None,
            prev_frame_size48: 960,
            last_packet_duration: None,
            work_buffer: Vec::new(),
            prev_redundancy: false,
            final_range: 0,
        })
    }

    /// Resets the Decoder to be equivalent to a freshly initialized decoder.
    ///
    /// This should be called when switching streams in order to prevent
    /// the back to back decoding from giving different results from
    /// one at a time decoding.
    pub fn reset(&mut self) -> Result<(), DecoderError> {
        self.silk_dec.reset()?;
        self.celt_dec.reset()?;
        self.out_resamplers.iter_mut().for_each(|r| r.reset());

        self.bandwidth = Bandwidth::Auto;
        self.prev_mode = None;
        self.prev_frame_size48 = 960;
        self.last_packet_duration = None;
        self.prev_redundancy = false;

        Ok(())
    }

    /// Returns the sampling rate the decoder was initialized with.
    pub fn sampling_rate(&self) -> SamplingRate {
        self.sampling_rate
    }

    /// Returns the channels the decoder was initialized with.
    pub fn channels(&self) -> Channels {
        self.channels
    }

    /// Returns the amount to scale PCM signal by in Q8 dB units.
    pub fn gain(&self) -> i16 {
        self.decode_gain
    }

    /// Returns the decoder's last bandpass.
    pub fn bandwidth(&self) -> Bandwidth {
        self.bandwidth
    }

    /// Returns the pitch of the last decoded frame, measured in samples at
    /// 48 kHz.
    pub fn pitch(&self) -> Option<u32> {
        self.prev_mode.map(|mode| match mode {
            CodecMode::Celt => self.celt_dec.pitch(),
            CodecMode::Silk | CodecMode::Hybrid => self.silk_dec.pitch(),
        })
    }

    /// Returns the duration (in samples at the configured rate) of the last
    /// packet successfully decoded or concealed.
    pub fn last_packet_duration(&self) -> Option<u32> {
        self.last_packet_duration
    }

    /// Returns the final state of the codec's entropy coder.
    ///
    /// This is used for testing purposes, the encoder and decoder state
    /// should be identical after coding a payload assuming no data
    /// corruption or software bugs.
    pub fn final_range(&self) -> u32 {
        self.final_range
    }

    /// Decode an Opus packet with a generic sample output.
    ///
    /// Returns the number of decoded samples per channel.
    ///
    /// # Arguments
    /// * `packet`     - Input payload. Use `None` to indicate packet loss.
    /// * `samples`    - Output signal (interleaved if 2 channels). Length
    ///                  must be at least `frame_size` * `channels`.
    /// * `frame_size` - Number of samples per channel of available space. In
    ///                  the case of PLC (packet == `None`) or FEC
    ///                  (`decode_fec` = `true`), this needs to be exactly the
    ///                  duration of audio that is missing.
    /// * `decode_fec` - Request that any in-band forward error correction
    ///                  data be decoded. If no such data is available, the
    ///                  frame is decoded as if it were lost.
    pub fn decode<S: Sample>(
        &mut self,
        packet: Option<&[u8]>,
        samples: &mut [S],
        frame_size: usize,
        decode_fec: bool,
    ) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        let mut pcm = vec![0.0_f32; frame_size * channels];
        let decoded = self.decode_float(packet, &mut pcm, frame_size, decode_fec)?;
        (0..decoded * channels).for_each(|i| {
            samples[i] = S::from_f32(pcm[i]);
        });
        Ok(decoded)
    }

    /// Decode an Opus packet with floating point output.
    ///
    /// See [`Decoder::decode`] for the argument description.
    pub fn decode_float(
        &mut self,
        packet: Option<&[u8]>,
        samples: &mut [f32],
        frame_size: usize,
        decode_fec: bool,
    ) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        if samples.len() < frame_size * channels {
            return Err(DecoderError::BufferTooSmall);
        }

        let rate = self.sampling_rate as usize;
        let frame_size48 = frame_size * 48000 / rate;

        let produced48 = match packet {
            None => self.conceal(frame_size48)?,
            Some(packet) if packet.is_empty() => self.conceal(frame_size48)?,
            Some(packet) => self.decode_packet(packet, frame_size48, decode_fec)?,
        };

        // The internal pipeline runs at 48 kHz; convert down if requested.
        let out48 = std::mem::take(&mut self.work_buffer);
        let produced = self.emit(&out48[..produced48 * channels], samples)?;
        self.work_buffer = out48;

        self.last_packet_duration = Some(produced as u32);
        Ok(produced)
    }

    /// Runs concealment for the given duration.
    fn conceal(&mut self, frame_size48: usize) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        self.work_buffer.clear();
        self.work_buffer.resize(frame_size48 * channels, 0.0);

        match self.prev_mode {
            Some(CodecMode::Celt) => {
                let mut offset = 0;
                while offset < frame_size48 {
                    // Conceal in the largest valid transform size that fits.
                    let remaining = frame_size48 - offset;
                    let n = [960, 480, 240, 120]
                        .iter()
                        .copied()
                        .find(|&n| n <= remaining)
                        .unwrap_or(remaining);
                    let mut chunk = vec![0.0_f32; n * channels];
                    self.celt_dec.decode(None, &mut chunk, n)?;
                    self.work_buffer[offset * channels..(offset + n) * channels]
                        .copy_from_slice(&chunk);
                    offset += n;
                }
            }
            Some(_) => {
                let ms = frame_size48 / 48;
                let mut out = vec![0_i16; frame_size48 * channels];
                let n = self.silk_dec.decode(None, ms, &mut out, false)?;
                (0..n * channels).for_each(|i| {
                    self.work_buffer[i] = f32::from(out[i]) / 32768.0;
                });
            }
            None => {}
        }
        Ok(frame_size48)
    }

    /// Decodes all frames of one packet.
    fn decode_packet(
        &mut self,
        packet: &[u8],
        frame_size48: usize,
        decode_fec: bool,
    ) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        if packet.is_empty() {
            return Err(DecoderError::InvalidPacket);
        }
        if query_packet_channel_count(packet) as usize > channels {
            return Err(DecoderError::InvalidPacket);
        }

        let mode = query_packet_codec_mode(packet);
        let bandwidth = query_packet_bandwidth(packet);
        let samples_per_frame = query_packet_samples_per_frame(packet, SamplingRate::Hz48000);

        // Only the speech path carries in-band redundancy; recovering a lost
        // frame next to a transform packet falls back to concealment.
        if decode_fec && mode == CodecMode::Celt {
            return self.conceal(frame_size48);
        }

        let mut sizes = [0_usize; 48];
        let mut frames = [0_usize; 48];
        let count = parse_packet(packet, false, Some(&mut frames), &mut sizes, None, None)?;

        if count * samples_per_frame > frame_size48 {
            return Err(DecoderError::BufferTooSmall);
        }

        // A switch into the transform path without redundancy leaves stale
        // overlap state behind; restart it. When the previous packet carried
        // trailing redundancy the transform state already restarted there.
        if let Some(prev) = self.prev_mode {
            let was_celt = prev == CodecMode::Celt;
            let is_celt = mode == CodecMode::Celt;
            if !was_celt && is_celt && !self.prev_redundancy {
                log::debug!("mode transition {:?} -> {:?}", prev, mode);
                self.celt_dec.reset()?;
            }
        }
        self.prev_redundancy = false;

        let mut buf = vec![0.0_f32; count * samples_per_frame * channels];
        for f in 0..count {
            let data = &packet[frames[f]..frames[f] + sizes[f]];
            let start = f * samples_per_frame * channels;
            self.decode_frame(
                data,
                mode,
                bandwidth,
                samples_per_frame,
                &mut buf[start..start + samples_per_frame * channels],
                decode_fec && f == 0,
            )?;
        }
        self.work_buffer = buf;

        self.bandwidth = bandwidth;
        self.prev_mode = Some(mode);
        self.prev_frame_size48 = samples_per_frame;
        Ok(count * samples_per_frame)
    }

    /// Decodes one frame's payload.
    fn decode_frame(
        &mut self,
        data: &[u8],
        mode: CodecMode,
        bandwidth: Bandwidth,
        frame_size48: usize,
        out: &mut [f32],
        decode_fec: bool,
    ) -> Result<(), DecoderError> {
        let channels = self.channels as usize;
        let frame_ms = frame_size48 / 48;
        let mut dec = RangeDecoder::new(data);

        match mode {
            CodecMode::Silk => {
                self.silk_dec.set_bandwidth(bandwidth)?;
                let mut silk_out = vec![0_i16; frame_size48 * channels];
                let n = self
                    .silk_dec
                    .decode(Some(&mut dec), frame_ms, &mut silk_out, decode_fec)?;
                (0..n * channels).for_each(|i| {
                    out[i] = f32::from(silk_out[i]) / 32768.0;
                });

                // Transition redundancy.
                let total_bits = (data.len() * 8) as u32;
                if !decode_fec && dec.tell() + 17 <= total_bits && dec.decode_bit_logp(12) {
                    let celt_to_silk = dec.decode_bit_logp(1);
                    let red_bytes = dec.decode_uint(256) as usize + 2;
                    if red_bytes < data.len() {
                        self.apply_redundancy(
                            &data[data.len() - red_bytes..],
                            celt_to_silk,
                            frame_size48,
                            out,
                        )?;
                        self.prev_redundancy = !celt_to_silk;
                    }
                }
            }
            CodecMode::Hybrid => {
                self.silk_dec.set_bandwidth(Bandwidth::Wideband)?;
                let mut silk_out = vec![0_i16; frame_size48 * channels];
                let n = self
                    .silk_dec
                    .decode(Some(&mut dec), frame_ms, &mut silk_out, decode_fec)?;

                if decode_fec {
                    (0..n * channels).for_each(|i| {
                        out[i] = f32::from(silk_out[i]) / 32768.0;
                    });
                } else {
                    // The high band continues in the same coder.
                    self.celt_dec.set_start_band(HYBRID_START_BAND);
                    self.celt_dec.set_end_band(bands_for_bandwidth(bandwidth));
                    let mut celt_out = vec![0.0_f32; frame_size48 * channels];
                    self.celt_dec
                        .decode(Some(&mut dec), &mut celt_out, frame_size48)?;

                    (0..frame_size48 * channels).for_each(|i| {
                        let silk = if i < n * channels {
                            f32::from(silk_out[i]) / 32768.0
                        } else {
                            0.0
                        };
                        out[i] = silk + celt_out[i];
                    });
                }
            }
            CodecMode::Celt => {
                self.celt_dec.set_start_band(0);
                self.celt_dec.set_end_band(bands_for_bandwidth(bandwidth));
                self.celt_dec.decode(Some(&mut dec), out, frame_size48)?;
            }
        }

        self.final_range = dec.range();
        Ok(())
    }

    /// Decodes a redundant CELT frame and crossfades it over the packet
    /// boundary it protects.
    fn apply_redundancy(
        &mut self,
        red_data: &[u8],
        celt_to_silk: bool,
        frame_size48: usize,
        out: &mut [f32],
    ) -> Result<(), DecoderError> {
        let channels = self.channels as usize;
        let n = REDUNDANCY_FRAME_SIZE;
        if frame_size48 < n {
            return Ok(());
        }

        log::debug!(
            "applying {} redundancy frame",
            if celt_to_silk { "leading" } else { "trailing" }
        );

        // The transform state restarts at the redundancy frame, mirroring
        // the encoder.
        self.celt_dec.reset()?;
        let mut red_dec = RangeDecoder::new(red_data);
        self.celt_dec.set_start_band(0);
        self.celt_dec.set_end_band(crate::celt::MAX_BANDS);
        let mut red_out = vec![0.0_f32; n * channels];
        self.celt_dec.decode(Some(&mut red_dec), &mut red_out, n)?;

        // Linear crossfade between the redundant signal and the main decode.
        let region = if celt_to_silk {
            0..n
        } else {
            frame_size48 - n..frame_size48
        };
        for (k, i) in region.enumerate() {
            // Fade the redundancy out at the start, in at the end.
            let f = (k as f32 + 0.5) / n as f32;
            let w_red = if celt_to_silk { 1.0 - f } else { f };
            (0..channels).for_each(|c| {
                let idx = i * channels + c;
                out[idx] = out[idx] * (1.0 - w_red) + red_out[k * channels + c] * w_red;
            });
        }
        Ok(())
    }

    /// Converts the 48 kHz work signal to the configured rate and applies the
    /// decoder gain.
    fn emit(&mut self, pcm48: &[f32], samples: &mut [f32]) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        let frames48 = pcm48.len() / channels;

        let gain = if self.decode_gain != 0 {
            crate::math::fast_exp2(f32::from(self.decode_gain) / 256.0 * 0.166_096)
        } else {
            1.0
        };

        if self.sampling_rate == SamplingRate::Hz48000 {
            if samples.len() < pcm48.len() {
                return Err(DecoderError::BufferTooSmall);
            }
            samples[..pcm48.len()]
                .iter_mut()
                .zip(pcm48.iter())
                .for_each(|(o, &v)| *o = v * gain);
            return Ok(frames48);
        }

        let factor = 48000 / self.sampling_rate as usize;
        let out_frames = frames48 / factor;
        if samples.len() < out_frames * channels {
            return Err(DecoderError::BufferTooSmall);
        }

        for c in 0..channels {
            let mono: Vec<i16> = (0..frames48)
                .map(|i| i16::from_f32(pcm48[i * channels + c]))
                .collect();
            let mut resampled = vec![0_i16; out_frames + 32];
            let produced = self.out_resamplers[c].process(&mono, &mut resampled);
            (0..produced.min(out_frames)).for_each(|i| {
                samples[i * channels + c] = f32::from(resampled[i]) / 32768.0 * gain;
            });
        }
        Ok(out_frames)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::{Application, CodecMode, Encoder, EncoderConfiguration, Signal};

    fn sine(len: usize, channels: usize, freq: f64, amp: f64) -> Vec<i16> {
        (0..len * channels)
            .map(|i| {
                let t = (i / channels) as f64 / 48000.0;
                (amp * 32767.0 * (2.0 * std::f64::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    /// A pitched buzz with a noise floor, crudely speech-shaped.
    fn speech_like(len: usize) -> Vec<i16> {
        let period = 160;
        let mut seed = 0x1234_5678_u32;
        (0..len)
            .map(|i| {
                seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                let noise = (seed >> 16) as i32 - 32768;
                let phase = (i % period) as f64 / period as f64;
                let f = 2.0 * std::f64::consts::PI * phase;
                let buzz = 0.5 * f.sin() + 0.25 * (2.0 * f).sin() + 0.12 * (3.0 * f).sin();
                (8000.0 * buzz) as i16 + (noise / 40) as i16
            })
            .collect()
    }

    fn rms(x: &[f32]) -> f64 {
        (x.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>() / x.len() as f64).sqrt()
    }

    /// Normalized cross-correlation maximized over a delay search, as the
    /// codec pipeline has a few milliseconds of algorithmic delay.
    fn best_correlation(reference: &[f32], decoded: &[f32], max_delay: usize) -> f64 {
        let n = reference.len().min(decoded.len()).saturating_sub(max_delay);
        let mut best = -1.0_f64;
        for delay in 0..max_delay {
            let mut xy = 0.0_f64;
            let mut xx = 1e-12_f64;
            let mut yy = 1e-12_f64;
            (0..n).for_each(|i| {
                let a = f64::from(reference[i]);
                let b = f64::from(decoded[i + delay]);
                xy += a * b;
                xx += a * a;
                yy += b * b;
            });
            best = best.max(xy / (xx * yy).sqrt());
        }
        best
    }

    fn run_stream(
        encoder: &mut Encoder,
        decoder: &mut Decoder,
        pcm: &[i16],
        frame_size: usize,
        channels: usize,
        lose: impl Fn(usize) -> bool,
    ) -> (Vec<f32>, Vec<(usize, u32, u32)>) {
        let mut decoded = Vec::new();
        let mut parity = Vec::new();
        let mut packet = [0_u8; 1500];
        let frames = pcm.len() / channels / frame_size;

        for f in 0..frames {
            let chunk = &pcm[f * frame_size * channels..(f + 1) * frame_size * channels];
            let len = encoder.encode(chunk, frame_size, &mut packet).unwrap();
            assert!(len >= 2 && len <= 1276, "packet length {}", len);

            let mut out = vec![0.0_f32; frame_size * channels];
            let produced = if lose(f) {
                decoder
                    .decode_float(None, &mut out, frame_size, false)
                    .unwrap()
            } else {
                decoder
                    .decode_float(Some(&packet[..len]), &mut out, frame_size, false)
                    .unwrap()
            };
            assert_eq!(produced, frame_size, "frame {} produced {}", f, produced);
            decoded.extend_from_slice(&out);
            if !lose(f) {
                parity.push((f, encoder.final_range(), decoder.final_range()));
            }
        }
        (decoded, parity)
    }

    fn music_encoder(channels: Channels, bitrate: u32, vbr: bool) -> Encoder {
        let mut encoder = Encoder::new(&EncoderConfiguration {
            sampling_rate: SamplingRate::Hz48000,
            channels,
            application: Application::Audio,
        })
        .unwrap();
        encoder.set_bitrate(bitrate).unwrap();
        encoder.set_vbr(vbr);
        encoder.set_signal_type(Signal::Music);
        encoder
    }

    fn voice_encoder(channels: Channels, bitrate: u32) -> Encoder {
        let mut encoder = Encoder::new(&EncoderConfiguration {
            sampling_rate: SamplingRate::Hz48000,
            channels,
            application: Application::Voip,
        })
        .unwrap();
        encoder.set_bitrate(bitrate).unwrap();
        encoder.set_signal_type(Signal::Voice);
        encoder
    }

    fn decoder(channels: Channels) -> Decoder {
        Decoder::new(&DecoderConfiguration {
            sampling_rate: SamplingRate::Hz48000,
            channels,
            gain: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_celt_fullband_sine_round_trip() {
        let pcm = sine(48_000, 1, 440.0, 0.5);
        let mut encoder = music_encoder(Channels::Mono, 64_000, false);
        let mut dec = decoder(Channels::Mono);

        let (decoded, parity) = run_stream(&mut encoder, &mut dec, &pcm, 960, 1, |_| false);

        // The encoder and decoder walked the identical symbol stream.
        for (f, enc_range, dec_range) in parity.iter() {
            assert_eq!(enc_range, dec_range, "final_range differs at frame {}", f);
        }

        // The tone comes back recognizably.
        let reference: Vec<f32> = pcm.iter().map(|&v| f32::from(v) / 32768.0).collect();
        let corr = best_correlation(&reference[960..], &decoded[960..], 1500);
        assert!(corr > 0.5, "correlation {} too low", corr);

        let ratio = rms(&decoded[4800..]) / rms(&reference[4800..]);
        assert!(ratio > 0.25 && ratio < 2.5, "rms ratio {}", ratio);
    }

    #[test]
    fn test_silk_wideband_speech_round_trip() {
        let pcm = speech_like(48_000);
        let mut encoder = voice_encoder(Channels::Mono, 20_000);
        let mut dec = decoder(Channels::Mono);

        let (decoded, parity) = run_stream(&mut encoder, &mut dec, &pcm, 960, 1, |_| false);

        for (f, enc_range, dec_range) in parity.iter() {
            assert_eq!(enc_range, dec_range, "final_range differs at frame {}", f);
        }

        let reference: Vec<f32> = pcm.iter().map(|&v| f32::from(v) / 32768.0).collect();
        let corr = best_correlation(&reference[960..], &decoded[960..], 1500);
        assert!(corr > 0.4, "correlation {} too low", corr);
    }

    #[test]
    fn test_hybrid_stereo_labels_stay_put() {
        let mut pcm = sine(48_000, 2, 300.0, 0.4);
        // Decorrelate the channels a little.
        pcm.chunks_mut(2).enumerate().for_each(|(i, c)| {
            c[1] = c[1] / 2 + ((i % 64) as i16 - 32) * 8;
        });

        let mut encoder = voice_encoder(Channels::Stereo, 96_000);
        let mut dec = decoder(Channels::Stereo);

        let mut packet = [0_u8; 1500];
        let mut configs = Vec::new();
        for f in 0..50 {
            let chunk = &pcm[f * 1920..(f + 1) * 1920];
            let len = encoder.encode(chunk, 960, &mut packet).unwrap();

            let toc = packet[0];
            configs.push(toc >> 3);
            assert_eq!(query_packet_codec_mode(&packet[..len]), CodecMode::Hybrid);
            assert_eq!(query_packet_channel_count(&packet[..len]), Channels::Stereo);
            assert_eq!(
                query_packet_samples_per_frame(&packet[..len], SamplingRate::Hz48000),
                960
            );

            let mut out = vec![0.0_f32; 960 * 2];
            let produced = dec
                .decode_float(Some(&packet[..len]), &mut out, 960, false)
                .unwrap();
            assert_eq!(produced, 960);
            assert_eq!(encoder.final_range(), dec.final_range(), "frame {}", f);
        }

        // No mode flapping within the window.
        assert!(configs.windows(2).all(|w| w[0] == w[1]), "{:?}", configs);
    }

    #[test]
    fn test_loss_pattern_round_trip() {
        let pcm = speech_like(48_000);
        let mut encoder = voice_encoder(Channels::Mono, 24_000);

        let mut lossless_dec = decoder(Channels::Mono);
        let mut lossy_dec = decoder(Channels::Mono);

        let mut enc2 = voice_encoder(Channels::Mono, 24_000);
        let (lossless, _) = run_stream(&mut encoder, &mut lossless_dec, &pcm, 960, 1, |_| false);
        let (lossy, _) = run_stream(&mut enc2, &mut lossy_dec, &pcm, 960, 1, |f| {
            (10..=12).contains(&f)
        });

        assert_eq!(lossless.len(), lossy.len());

        // Outside the loss neighborhood the two decodes agree closely.
        let corr = best_correlation(&lossless[..9 * 960], &lossy[..9 * 960], 4);
        assert!(corr > 0.99, "pre-loss correlation {}", corr);

        // After the loss the stream resynchronizes to something sane.
        let tail_ratio = rms(&lossy[20 * 960..]) / rms(&lossless[20 * 960..]).max(1e-9);
        assert!(
            tail_ratio > 0.3 && tail_ratio < 3.0,
            "tail rms ratio {}",
            tail_ratio
        );
    }

    #[test]
    fn test_fec_recovers_lost_frame() {
        let pcm = speech_like(48_000);
        let mut encoder = voice_encoder(Channels::Mono, 24_000);
        encoder.set_packet_loss_perc(30).unwrap();
        let mut dec = decoder(Channels::Mono);

        let mut packets = Vec::new();
        let mut packet = [0_u8; 1500];
        for f in 0..20 {
            let chunk = &pcm[f * 960..(f + 1) * 960];
            let len = encoder.encode(chunk, 960, &mut packet).unwrap();
            packets.push(packet[..len].to_vec());
        }

        let mut out = vec![0.0_f32; 960];
        for f in 0..20 {
            if f == 10 {
                // Lost; recover it from the next packet's redundancy.
                let produced = dec
                    .decode_float(Some(&packets[11]), &mut out, 960, true)
                    .unwrap();
                assert_eq!(produced, 960);
            } else {
                let produced = dec
                    .decode_float(Some(&packets[f]), &mut out, 960, false)
                    .unwrap();
                assert_eq!(produced, 960);
            }
        }
    }

    #[test]
    fn test_celt_sixty_ms_packs_three_frames() {
        let pcm = sine(2880 * 4, 1, 500.0, 0.4);
        let mut encoder = music_encoder(Channels::Mono, 64_000, false);
        let mut dec = decoder(Channels::Mono);

        let mut packet = [0_u8; 1500];
        for f in 0..4 {
            let chunk = &pcm[f * 2880..(f + 1) * 2880];
            let len = encoder.encode(chunk, 2880, &mut packet).unwrap();

            assert_eq!(crate::query_packet_frame_count(&packet[..len]).unwrap(), 3);
            assert_eq!(
                crate::query_packet_sample_count(&packet[..len], SamplingRate::Hz48000).unwrap(),
                2880
            );

            let mut out = vec![0.0_f32; 2880];
            let produced = dec
                .decode_float(Some(&packet[..len]), &mut out, 2880, false)
                .unwrap();
            assert_eq!(produced, 2880);
        }
    }

    #[test]
    fn test_two_identical_encoders_are_deterministic() {
        let pcm = speech_like(19_200);
        let mut enc_a = voice_encoder(Channels::Mono, 24_000);
        let mut enc_b = voice_encoder(Channels::Mono, 24_000);

        let mut pkt_a = [0_u8; 1500];
        let mut pkt_b = [0_u8; 1500];
        for f in 0..20 {
            let chunk = &pcm[f * 960..(f + 1) * 960];
            let len_a = enc_a.encode(chunk, 960, &mut pkt_a).unwrap();
            let len_b = enc_b.encode(chunk, 960, &mut pkt_b).unwrap();
            assert_eq!(len_a, len_b);
            assert_eq!(pkt_a[..len_a], pkt_b[..len_b], "frame {}", f);
        }
    }

    #[test]
    fn test_encoder_rejects_bad_frame_sizes() {
        let mut encoder = music_encoder(Channels::Mono, 64_000, true);
        let pcm = vec![0_i16; 1000];
        let mut packet = [0_u8; 1500];
        assert!(encoder.encode(&pcm, 1000, &mut packet).is_err());
        assert!(encoder.encode(&pcm, 0, &mut packet).is_err());
    }

    #[test]
    fn test_invalid_packet_leaves_decoder_usable() {
        let mut dec = decoder(Channels::Mono);
        let mut out = vec![0.0_f32; 960];

        // A code 3 packet with zero frames is malformed.
        let bad = [0b0000_0011_u8, 0];
        assert_eq!(
            dec.decode_float(Some(&bad), &mut out, 960, false),
            Err(DecoderError::InvalidPacket)
        );

        // Concealment and further decoding still work.
        let produced = dec.decode_float(None, &mut out, 960, false).unwrap();
        assert_eq!(produced, 960);
    }

    #[test]
    fn test_decode_at_reduced_rate() {
        let pcm = sine(9600, 1, 440.0, 0.5);
        let mut encoder = music_encoder(Channels::Mono, 64_000, false);
        let mut dec = Decoder::new(&DecoderConfiguration {
            sampling_rate: SamplingRate::Hz16000,
            channels: Channels::Mono,
            gain: 0,
        })
        .unwrap();

        let mut packet = [0_u8; 1500];
        for f in 0..10 {
            let chunk = &pcm[f * 960..(f + 1) * 960];
            let len = encoder.encode(chunk, 960, &mut packet).unwrap();
            let mut out = vec![0.0_f32; 320];
            let produced = dec
                .decode_float(Some(&packet[..len]), &mut out, 320, false)
                .unwrap();
            assert_eq!(produced, 320);
        }
    }
}
