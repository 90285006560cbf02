//! PCM sample conversion helpers.
//!
//! The wire format everywhere in the pipeline is little-endian signed-16
//! interleaved samples; the mixer works in f32. These helpers are the only
//! place the conversions live.

/// Convert little-endian i16 bytes to samples.
///
/// A trailing odd byte (violating the frame invariant) is dropped.
pub fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Convert samples to little-endian i16 bytes.
pub fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Convert one i16 sample to f32 in `[-1, 1)`.
#[inline]
pub fn i16_to_f32(s: i16) -> f32 {
    f32::from(s) / 32768.0
}

/// Convert one f32 sample to i16, clipping to the representable range.
#[inline]
pub fn f32_to_i16(s: f32) -> i16 {
    let scaled = s * 32768.0;
    if scaled >= f32::from(i16::MAX) {
        i16::MAX
    } else if scaled <= f32::from(i16::MIN) {
        i16::MIN
    } else {
        scaled as i16
    }
}

/// Clip an f32 sample into `[-1, 1]`.
#[inline]
pub fn clip(s: f32) -> f32 {
    s.clamp(-1.0, 1.0)
}

/// Compute the RMS energy of little-endian i16 PCM bytes, normalized to
/// `[0, 1]` by treating each sample as `sample / 32768`.
pub fn rms_of_bytes(bytes: &[u8]) -> f32 {
    if bytes.len() < 2 {
        return 0.0;
    }
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;
    for b in bytes.chunks_exact(2) {
        let s = f64::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0;
        sum_sq += s * s;
        n += 1;
    }
    ((sum_sq / n as f64) as f32).sqrt()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn i16_bytes_round_trip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN, 12345, -12345];
        let bytes = i16_to_bytes(&samples);
        assert_eq!(bytes_to_i16(&bytes), samples);
    }

    #[test]
    fn odd_trailing_byte_dropped() {
        let out = bytes_to_i16(&[0x01, 0x02, 0xff]);
        assert_eq!(out, vec![i16::from_le_bytes([0x01, 0x02])]);
    }

    #[test]
    fn f32_conversion_clips() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), i16::MIN);
        assert_eq!(f32_to_i16(0.0), 0);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        let bytes = i16_to_bytes(&[0i16; 160]);
        assert_eq!(rms_of_bytes(&bytes), 0.0);
    }

    #[test]
    fn rms_of_full_scale_square_wave() {
        let samples: Vec<i16> = (0..160)
            .map(|i| if i % 2 == 0 { i16::MAX } else { -i16::MAX })
            .collect();
        let rms = rms_of_bytes(&i16_to_bytes(&samples));
        assert!((rms - 1.0).abs() < 0.001, "rms = {rms}");
    }

    #[test]
    fn clip_bounds() {
        assert_eq!(clip(1.5), 1.0);
        assert_eq!(clip(-1.5), -1.0);
        assert_eq!(clip(0.25), 0.25);
    }
}
