use bytes::Bytes;

use crate::{
    error::ConvertError,
    frame::{AudioFrame, SampleBuffer, SampleFormat, SinkFormat},
    timebase::MILLIS,
};

/// Linear interpolation between neighbouring frames. Keeps its fractional read position
/// and the last input frame across calls so consecutive buffers join without clicks.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    input_rate: u32,
    output_rate: u32,
    ratio: f64,
    position: f64,
    prev: Vec<f32>,
    channels: usize,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self, ConvertError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(ConvertError::Unsupported(format!(
                "sample rate {} -> {}",
                input_rate, output_rate
            )));
        }
        if channels == 0 {
            return Err(ConvertError::Unsupported("zero channels".to_string()));
        }
        Ok(Self {
            input_rate,
            output_rate,
            ratio: input_rate as f64 / output_rate as f64,
            position: 0.0,
            prev: vec![0.0; channels],
            channels,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// `input` is interleaved with `self.channels()` channels; trailing partial frames
    /// are ignored.
    pub fn process_interleaved(&mut self, input: &[f32]) -> Vec<f32> {
        let channels = self.channels;
        let input_frames = input.len() / channels;
        if input_frames == 0 {
            return Vec::new();
        }

        let output_frames = (input_frames as f64 / self.ratio).ceil() as usize;
        let mut output = Vec::with_capacity(output_frames * channels);

        let mut pos = self.position;
        while (pos as usize) < input_frames {
            let idx = pos as usize;
            let t = (pos - idx as f64) as f32;
            for ch in 0..channels {
                let a = if idx > 0 {
                    input[(idx - 1) * channels + ch]
                } else {
                    self.prev[ch]
                };
                let b = input[idx * channels + ch];
                output.push(a + (b - a) * t);
            }
            pos += self.ratio;
        }

        self.position = pos - input_frames as f64;
        let last = (input_frames - 1) * channels;
        self.prev.copy_from_slice(&input[last..last + channels]);
        output
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.prev.fill(0.0);
    }
}

/// Turns decoded audio into the sink's format.
///
/// When the decoded format already equals the sink format the samples pass through as a
/// zero-copy slice. Otherwise samples go through `f32`, get remixed to the sink's channel
/// count and resampled to its rate.
pub struct AudioConverter {
    target: SinkFormat,
    resampler: Option<LinearResampler>,
    converted: u64,
    passthrough: u64,
}

impl AudioConverter {
    /// The target is always delivered interleaved, whatever layout it names.
    pub fn new(target: SinkFormat) -> Self {
        Self {
            target: SinkFormat::new(target.sample_rate, target.channels, target.sample_format),
            resampler: None,
            converted: 0,
            passthrough: 0,
        }
    }

    pub fn target(&self) -> SinkFormat {
        self.target
    }

    pub fn passthrough_count(&self) -> u64 {
        self.passthrough
    }

    pub fn converted_count(&self) -> u64 {
        self.converted
    }

    pub fn convert(&mut self, frame: &AudioFrame) -> Result<SampleBuffer, ConvertError> {
        let bps = frame
            .format
            .bytes_per_sample()
            .ok_or_else(|| ConvertError::Unsupported(format!("sample format {:?}", frame.format)))?;
        if frame.channels == 0 {
            return Err(ConvertError::InvalidGeometry("zero channels".to_string()));
        }
        let pts_ms = frame.pts.map(|pts| crate::timebase::rescale(pts, frame.time_base, MILLIS));

        let source = SinkFormat {
            sample_rate: frame.sample_rate,
            channels: frame.channels,
            sample_format: frame.format,
        };
        if source == self.target && !frame.format.is_planar() {
            let len = frame.samples * frame.channels as usize * bps;
            let plane = frame.planes.first().ok_or(ConvertError::ShortPlane {
                plane: 0,
                len: 0,
                expected: len,
            })?;
            if plane.len() < len {
                return Err(ConvertError::ShortPlane {
                    plane: 0,
                    len: plane.len(),
                    expected: len,
                });
            }
            self.passthrough += 1;
            return Ok(SampleBuffer {
                format: self.target,
                frames: frame.samples,
                data: plane.slice(..len),
                pts_ms,
            });
        }

        let samples = to_interleaved_f32(frame, bps)?;
        let mixed = remix(&samples, frame.channels as usize, self.target.channels as usize);

        let resampled = if frame.sample_rate != self.target.sample_rate {
            let channels = self.target.channels as usize;
            let stale = self.resampler.as_ref().is_none_or(|r| {
                r.input_rate() != frame.sample_rate || r.channels() != channels
            });
            if stale {
                log::debug!(
                    "audio resampler {} -> {} Hz, {} channels",
                    frame.sample_rate,
                    self.target.sample_rate,
                    channels
                );
                self.resampler = Some(LinearResampler::new(
                    frame.sample_rate,
                    self.target.sample_rate,
                    channels,
                )?);
            }
            match self.resampler.as_mut() {
                Some(resampler) => resampler.process_interleaved(&mixed),
                None => mixed,
            }
        } else {
            self.resampler = None;
            mixed
        };

        let channels = self.target.channels.max(1) as usize;
        let frames = resampled.len() / channels;
        let data = write_interleaved(&resampled, self.target.sample_format)?;
        self.converted += 1;
        Ok(SampleBuffer {
            format: self.target,
            frames,
            data,
            pts_ms,
        })
    }
}

fn to_interleaved_f32(frame: &AudioFrame, bps: usize) -> Result<Vec<f32>, ConvertError> {
    let channels = frame.channels as usize;
    let total = frame.samples * channels;

    if !frame.format.is_planar() {
        let plane = frame.planes.first().map(|p| p.as_ref()).unwrap_or(&[]);
        if plane.len() < total * bps {
            return Err(ConvertError::ShortPlane {
                plane: 0,
                len: plane.len(),
                expected: total * bps,
            });
        }
        return Ok(read_interleaved(&plane[..total * bps], frame.format.packed()));
    }

    if frame.planes.len() < channels {
        return Err(ConvertError::InvalidGeometry(format!(
            "{} planes for {} channels",
            frame.planes.len(),
            channels
        )));
    }
    let packed = frame.format.packed();
    let mut per_channel = Vec::with_capacity(channels);
    for (i, plane) in frame.planes.iter().take(channels).enumerate() {
        let expected = frame.samples * bps;
        if plane.len() < expected {
            return Err(ConvertError::ShortPlane {
                plane: i,
                len: plane.len(),
                expected,
            });
        }
        per_channel.push(read_interleaved(&plane[..expected], packed));
    }

    let mut out = Vec::with_capacity(total);
    for s in 0..frame.samples {
        for ch in &per_channel {
            out.push(ch[s]);
        }
    }
    Ok(out)
}

/// Mono is duplicated to every output channel and any input folds down to mono by
/// averaging. Other layouts keep the leading channels and zero-fill the rest.
fn remix(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to || to == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if from == 1 {
            out.extend(std::iter::repeat_n(frame[0], to));
        } else if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for ch in 0..to {
                out.push(frame.get(ch).copied().unwrap_or(0.0));
            }
        }
    }
    out
}

/// Decodes packed native-endian samples into normalized `f32`. Unknown formats decode
/// to nothing.
pub fn read_interleaved(data: &[u8], format: SampleFormat) -> Vec<f32> {
    match format {
        SampleFormat::U8(_) => data.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        SampleFormat::I16(_) => data
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect(),
        SampleFormat::I32(_) => data
            .chunks_exact(4)
            .map(|c| (i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f64 / 2147483648.0) as f32)
            .collect(),
        SampleFormat::F32(_) => data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        SampleFormat::F64(_) => data
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_ne_bytes(b) as f32
            })
            .collect(),
        SampleFormat::Other(_) => Vec::new(),
    }
}

fn write_interleaved(samples: &[f32], format: SampleFormat) -> Result<Bytes, ConvertError> {
    let bps = format
        .bytes_per_sample()
        .ok_or_else(|| ConvertError::Unsupported(format!("sink sample format {:?}", format)))?;
    let mut out = Vec::with_capacity(samples.len() * bps);
    for &s in samples {
        let s = s.clamp(-1.0, 1.0);
        match format {
            SampleFormat::U8(_) => out.push((s * 127.0 + 128.0).round() as u8),
            SampleFormat::I16(_) => {
                out.extend_from_slice(&((s * 32767.0).round() as i16).to_ne_bytes())
            }
            SampleFormat::I32(_) => {
                out.extend_from_slice(&((s as f64 * 2147483647.0).round() as i32).to_ne_bytes())
            }
            SampleFormat::F32(_) => out.extend_from_slice(&s.to_ne_bytes()),
            SampleFormat::F64(_) => out.extend_from_slice(&(s as f64).to_ne_bytes()),
            SampleFormat::Other(_) => {}
        }
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame::SampleLayout, timebase::Timebase};

    fn f32_bytes(samples: &[f32]) -> Bytes {
        Bytes::from(samples.iter().flat_map(|s| s.to_ne_bytes()).collect::<Vec<_>>())
    }

    fn frame(
        rate: u32,
        channels: u16,
        format: SampleFormat,
        planes: Vec<Bytes>,
        samples: usize,
    ) -> AudioFrame {
        AudioFrame {
            sample_rate: rate,
            channels,
            format,
            samples,
            planes,
            pts: Some(48000),
            time_base: Timebase::new(1, 48000),
        }
    }

    #[test]
    fn test_matching_format_passes_through_without_copy() {
        let data = f32_bytes(&[0.1, -0.1, 0.2, -0.2]);
        let frame = frame(48000, 2, SampleFormat::F32(SampleLayout::Packed), vec![data.clone()], 2);
        let mut converter = AudioConverter::new(SinkFormat::default());

        let out = converter.convert(&frame).unwrap();
        assert_eq!(out.frames, 2);
        assert_eq!(out.data.as_ptr(), data.as_ptr());
        assert_eq!(out.pts_ms, Some(1000));
        assert_eq!(converter.passthrough_count(), 1);
        assert_eq!(converter.converted_count(), 0);
    }

    #[test]
    fn test_planar_is_interleaved() {
        let left = f32_bytes(&[0.5, 0.25]);
        let right = f32_bytes(&[-0.5, -0.25]);
        let frame = frame(48000, 2, SampleFormat::F32(SampleLayout::Planar), vec![left, right], 2);
        let mut converter = AudioConverter::new(SinkFormat::default());

        let out = converter.convert(&frame).unwrap();
        assert_eq!(out.to_f32(), vec![0.5, -0.5, 0.25, -0.25]);
        assert_eq!(converter.converted_count(), 1);
    }

    #[test]
    fn test_planar_sink_format_is_delivered_interleaved() {
        let target = SinkFormat {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::F32(SampleLayout::Planar),
        };
        let left = f32_bytes(&[0.5; 1024]);
        let right = f32_bytes(&[-0.5; 1024]);
        let planar = SampleFormat::F32(SampleLayout::Planar);
        let frame = frame(48000, 2, planar, vec![left, right], 1024);
        let mut converter = AudioConverter::new(target);
        assert_eq!(converter.target().sample_format, SampleFormat::F32(SampleLayout::Packed));

        let out = converter.convert(&frame).unwrap();
        assert_eq!(out.frames, 1024);
        assert_eq!(out.data.len(), 1024 * 2 * 4);
        assert_eq!(&out.to_f32()[..4], &[0.5, -0.5, 0.5, -0.5]);
        assert_eq!(converter.passthrough_count(), 0);
    }

    #[test]
    fn test_s16_mono_to_f32_stereo() {
        let data: Vec<u8> = [16384i16, -16384].iter().flat_map(|s| s.to_ne_bytes()).collect();
        let packed = SampleFormat::I16(SampleLayout::Packed);
        let frame = frame(48000, 1, packed, vec![Bytes::from(data)], 2);
        let mut converter = AudioConverter::new(SinkFormat::default());

        let out = converter.convert(&frame).unwrap();
        assert_eq!(out.frames, 2);
        assert_eq!(out.to_f32(), vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_stereo_to_mono_s16_averages() {
        let data = f32_bytes(&[0.5, 0.0, 1.0, 1.0]);
        let frame = frame(48000, 2, SampleFormat::F32(SampleLayout::Packed), vec![data], 2);
        let sink = SinkFormat::new(48000, 1, SampleFormat::I16(SampleLayout::Planar));
        let mut converter = AudioConverter::new(sink);

        let out = converter.convert(&frame).unwrap();
        assert_eq!(out.format.sample_format, SampleFormat::I16(SampleLayout::Packed));
        let values: Vec<i16> = out
            .data
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![8192, 32767]);
    }

    #[test]
    fn test_rate_mismatch_is_resampled() {
        let data = f32_bytes(&vec![0.25; 2 * 441]);
        let frame = frame(44100, 2, SampleFormat::F32(SampleLayout::Packed), vec![data], 441);
        let mut converter = AudioConverter::new(SinkFormat::default());

        let out = converter.convert(&frame).unwrap();
        assert_eq!(out.format.sample_rate, 48000);
        assert!((479..=481).contains(&out.frames), "frames = {}", out.frames);
        // interpolation starts from silence, then settles on the input level
        let samples = out.to_f32();
        assert!((samples[samples.len() - 1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_short_plane_is_rejected() {
        let frame = frame(
            48000,
            2,
            SampleFormat::F32(SampleLayout::Packed),
            vec![f32_bytes(&[0.0])],
            4,
        );
        let mut converter = AudioConverter::new(SinkFormat::default());
        assert!(matches!(
            converter.convert(&frame),
            Err(ConvertError::ShortPlane { plane: 0, .. })
        ));
    }

    #[test]
    fn test_linear_resampler_keeps_phase_across_calls() {
        let mut resampler = LinearResampler::new(48000, 24000, 1).unwrap();
        let first = resampler.process_interleaved(&[0.0, 1.0, 2.0, 3.0]);
        let second = resampler.process_interleaved(&[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(first[1], 1.0);
        assert_eq!(second[0], 3.0);
        resampler.reset();
        assert_eq!(resampler.process_interleaved(&[1.0])[0], 0.0);
    }

    #[test]
    fn test_linear_resampler_rejects_zero_rate() {
        assert!(LinearResampler::new(0, 48000, 2).is_err());
        assert!(LinearResampler::new(48000, 48000, 0).is_err());
    }
}
