use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::SAMPLE_RATE;

/// Convert signed 16-bit samples to `f32` with a plain widening cast.
/// No normalization: the mel model expects values in [-32768, 32767].
pub fn convert_to_float(input: &[i16], output: &mut Vec<f32>) {
    output.resize(input.len(), 0.0);
    convert_into(input, output);
}

/// Same conversion into a caller-provided slice of equal length.
pub fn convert_into(input: &[i16], output: &mut [f32]) {
    assert_eq!(input.len(), output.len());
    #[cfg(target_arch = "x86_64")]
    unsafe {
        convert_sse2(input, output);
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        convert_neon(input, output);
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    convert_scalar(input, output);
}

/// Whether the vectorized conversion path is compiled in.
pub fn simd_enabled() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

fn convert_scalar(input: &[i16], output: &mut [f32]) {
    for (dst, &src) in output.iter_mut().zip(input) {
        *dst = src as f32;
    }
}

// Eight samples per step: widen i16 lanes to i32, then convert to f32.
// Must stay byte-identical to the scalar path.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse2")]
unsafe fn convert_sse2(input: &[i16], output: &mut [f32]) {
    use std::arch::x86_64::*;

    let vectorized = input.len() & !7;
    let mut i = 0;
    while i < vectorized {
        let v = _mm_loadu_si128(input.as_ptr().add(i) as *const __m128i);
        let lo = _mm_srai_epi32::<16>(_mm_unpacklo_epi16(v, v));
        let hi = _mm_srai_epi32::<16>(_mm_unpackhi_epi16(v, v));
        _mm_storeu_ps(output.as_mut_ptr().add(i), _mm_cvtepi32_ps(lo));
        _mm_storeu_ps(output.as_mut_ptr().add(i + 4), _mm_cvtepi32_ps(hi));
        i += 8;
    }
    convert_scalar(&input[vectorized..], &mut output[vectorized..]);
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn convert_neon(input: &[i16], output: &mut [f32]) {
    use std::arch::aarch64::*;

    let vectorized = input.len() & !7;
    let mut i = 0;
    while i < vectorized {
        let v = vld1q_s16(input.as_ptr().add(i));
        let lo = vcvtq_f32_s32(vmovl_s16(vget_low_s16(v)));
        let hi = vcvtq_f32_s32(vmovl_s16(vget_high_s16(v)));
        vst1q_f32(output.as_mut_ptr().add(i), lo);
        vst1q_f32(output.as_mut_ptr().add(i + 4), hi);
        i += 8;
    }
    convert_scalar(&input[vectorized..], &mut output[vectorized..]);
}

/// Live capture from the default input device, delivering fixed-size i16
/// chunks. Prefers a native mono i16 config; falls back to an f32 stream
/// and converts in the callback.
pub struct MicSource {
    _stream: Stream,
    receiver: Receiver<Vec<i16>>,
    pending: Vec<i16>,
}

impl MicSource {
    pub fn new(chunk_size: usize) -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .context("no input device available")?;

        let native_i16 = device
            .supported_input_configs()
            .context("failed to query input configs")?
            .filter(|c| c.channels() == 1 && c.sample_format() == SampleFormat::I16)
            .find(|c| {
                c.min_sample_rate().0 <= SAMPLE_RATE && c.max_sample_rate().0 >= SAMPLE_RATE
            });

        let (sender, receiver) = mpsc::channel();
        let stream = match native_i16 {
            Some(config) => Self::build_stream_i16(
                &device,
                &config.with_sample_rate(SampleRate(SAMPLE_RATE)).config(),
                chunk_size,
                sender,
            )?,
            None => {
                let config = StreamConfig {
                    channels: 1,
                    sample_rate: SampleRate(SAMPLE_RATE),
                    buffer_size: cpal::BufferSize::Default,
                };
                Self::build_stream_f32(&device, &config, chunk_size, sender)?
            }
        };
        stream.play().context("failed to start audio stream")?;

        Ok(MicSource {
            _stream: stream,
            receiver,
            pending: Vec::new(),
        })
    }

    fn build_stream_i16(
        device: &cpal::Device,
        config: &StreamConfig,
        chunk_size: usize,
        sender: Sender<Vec<i16>>,
    ) -> anyhow::Result<Stream> {
        let buffer = Arc::new(Mutex::new(Vec::with_capacity(chunk_size * 2)));
        let stream = device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let mut buf = buffer.lock().unwrap();
                buf.extend_from_slice(data);
                while buf.len() >= chunk_size {
                    let chunk: Vec<i16> = buf.drain(..chunk_size).collect();
                    let _ = sender.send(chunk);
                }
            },
            |err| log::warn!("audio stream error: {err}"),
            None,
        )?;
        Ok(stream)
    }

    fn build_stream_f32(
        device: &cpal::Device,
        config: &StreamConfig,
        chunk_size: usize,
        sender: Sender<Vec<i16>>,
    ) -> anyhow::Result<Stream> {
        let buffer = Arc::new(Mutex::new(Vec::with_capacity(chunk_size * 2)));
        let stream = device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut buf = buffer.lock().unwrap();
                buf.extend(
                    data.iter()
                        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16),
                );
                while buf.len() >= chunk_size {
                    let chunk: Vec<i16> = buf.drain(..chunk_size).collect();
                    let _ = sender.send(chunk);
                }
            },
            |err| log::warn!("audio stream error: {err}"),
            None,
        )?;
        Ok(stream)
    }

    /// Blocking read of up to `buf.len()` samples. Returns 0 only if the
    /// capture stream has died.
    pub fn read(&mut self, buf: &mut [i16]) -> usize {
        while self.pending.len() < buf.len() {
            match self.receiver.recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => break,
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_cast_is_exact() {
        let samples = [0i16, 1, -1, 127, -128, 32767, -32768, 12345];
        let mut floats = Vec::new();
        convert_to_float(&samples, &mut floats);
        for (&s, &f) in samples.iter().zip(&floats) {
            assert_eq!(f, s as f32);
            // Truncating round-trip is the identity for all i16 inputs.
            assert_eq!(f as i16, s);
        }
    }

    #[test]
    fn vectorized_matches_scalar() {
        // Length deliberately not a multiple of eight to cover the tail.
        let samples: Vec<i16> = (0..1003)
            .map(|i| ((i * 7919) % 65536 - 32768) as i16)
            .collect();
        let mut fast = vec![0.0f32; samples.len()];
        let mut scalar = vec![0.0f32; samples.len()];
        convert_into(&samples, &mut fast);
        convert_scalar(&samples, &mut scalar);
        assert_eq!(fast, scalar);
    }

    #[test]
    fn convert_resizes_output() {
        let mut out = vec![0.0f32; 3];
        convert_to_float(&[5, 6], &mut out);
        assert_eq!(out, vec![5.0, 6.0]);
    }
}
