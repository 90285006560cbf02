//! Linear interpolation resampling.
//!
//! Quality is sufficient for speech (energy below 8kHz); no anti-alias
//! filter is applied. The streaming wrapper adapts a TTS provider stream to
//! the mixer's system rate chunk by chunk.

use crate::audio::pcm::{bytes_to_i16, i16_to_bytes};
use crate::audio::stream::PcmStream;
use crate::error::{Result, VoiceError};
use std::io;

/// Bytes pulled from the underlying stream per refill.
const REFILL_CHUNK_BYTES: usize = 4096;

/// Position-based linear resampler for interleaved i16 PCM.
pub struct LinearResampler {
    input_rate: u32,
    output_rate: u32,
    channels: usize,
}

impl LinearResampler {
    /// Create a resampler.
    ///
    /// # Errors
    ///
    /// Returns an error if either rate or the channel count is zero.
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(VoiceError::Audio(format!(
                "resampler rates must be positive, got {input_rate} -> {output_rate}"
            )));
        }
        if channels == 0 {
            return Err(VoiceError::Audio("resampler needs at least one channel".into()));
        }
        Ok(Self {
            input_rate,
            output_rate,
            channels,
        })
    }

    /// Resample one chunk of interleaved samples.
    ///
    /// Output length is `ceil(input_frames * output_rate / input_rate)`
    /// frames. Same-rate input returns a copy. Samples that do not fill a
    /// whole frame at the tail are ignored.
    pub fn process(&self, input: &[i16]) -> Vec<i16> {
        if self.input_rate == self.output_rate {
            return input.to_vec();
        }
        let in_frames = input.len() / self.channels;
        if in_frames == 0 {
            return Vec::new();
        }

        let out_frames = (in_frames * self.output_rate as usize)
            .div_ceil(self.input_rate as usize);
        let ratio = f64::from(self.input_rate) / f64::from(self.output_rate);
        let mut output = Vec::with_capacity(out_frames * self.channels);

        for j in 0..out_frames {
            let pos = j as f64 * ratio;
            let i = pos as usize;
            let frac = pos - i as f64;
            for c in 0..self.channels {
                let a = input[(i.min(in_frames - 1)) * self.channels + c];
                let b = if i + 1 < in_frames {
                    input[(i + 1) * self.channels + c]
                } else {
                    a
                };
                let sample = f64::from(a) * (1.0 - frac) + f64::from(b) * frac;
                output.push(clamp_i16(sample));
            }
        }
        output
    }
}

fn clamp_i16(v: f64) -> i16 {
    if v >= f64::from(i16::MAX) {
        i16::MAX
    } else if v <= f64::from(i16::MIN) {
        i16::MIN
    } else {
        v.round() as i16
    }
}

/// Streaming wrapper that resamples an underlying [`PcmStream`] on the fly.
///
/// Same-rate mode bypasses buffering entirely.
pub struct ResamplingReader {
    inner: Box<dyn PcmStream>,
    resampler: LinearResampler,
    bypass: bool,
    frame_bytes: usize,
    /// Bytes pulled from `inner` that do not yet complete a whole frame.
    remainder: Vec<u8>,
    /// Resampled output waiting to be read.
    output: Vec<u8>,
    output_pos: usize,
}

impl ResamplingReader {
    /// # Errors
    ///
    /// Returns an error for zero rates or channels.
    pub fn new(
        inner: Box<dyn PcmStream>,
        input_rate: u32,
        output_rate: u32,
        channels: usize,
    ) -> Result<Self> {
        let resampler = LinearResampler::new(input_rate, output_rate, channels)?;
        Ok(Self {
            inner,
            resampler,
            bypass: input_rate == output_rate,
            frame_bytes: channels * 2,
            remainder: Vec::new(),
            output: Vec::new(),
            output_pos: 0,
        })
    }

    fn refill(&mut self) -> io::Result<usize> {
        let mut chunk = vec![0u8; REFILL_CHUNK_BYTES];
        let n = self.inner.read(&mut chunk)?;
        if n == 0 {
            return Ok(0);
        }
        self.remainder.extend_from_slice(&chunk[..n]);

        let whole = (self.remainder.len() / self.frame_bytes) * self.frame_bytes;
        if whole == 0 {
            return Ok(n);
        }
        let frames: Vec<u8> = self.remainder.drain(..whole).collect();
        let samples = bytes_to_i16(&frames);
        let resampled = self.resampler.process(&samples);
        self.output = i16_to_bytes(&resampled);
        self.output_pos = 0;
        Ok(n)
    }
}

impl PcmStream for ResamplingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.bypass {
            return self.inner.read(buf);
        }

        loop {
            if self.output_pos < self.output.len() {
                let n = buf.len().min(self.output.len() - self.output_pos);
                buf[..n].copy_from_slice(&self.output[self.output_pos..self.output_pos + n]);
                self.output_pos += n;
                return Ok(n);
            }
            // WouldBlock from the underlying stream propagates to the caller.
            if self.refill()? == 0 {
                return Ok(0);
            }
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
