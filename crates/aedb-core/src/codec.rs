// ABOUTME: Binary codec for waveform sample blobs stored in the waveform database.
// ABOUTME: Converts physical-unit sample arrays to/from little-endian i16 or f32 blobs.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encoding or decoding a sample blob.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("blob length mismatch: expected {expected} bytes for the declared sample count, got {actual}")]
    BlobLengthMismatch { expected: usize, actual: usize },

    #[error("raw ADC values are not available for {0:?} blobs")]
    RawNotAvailable(DataFormat),

    #[error("unknown data format tag: {0}")]
    UnknownFormat(i64),

    #[error("invalid scale factor: {0}")]
    InvalidScale(f64),
}

/// On-disk layout of a sample blob, persisted as the integer `DataFormat` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Signed 16-bit ADC counts, scaled to physical units on decode.
    #[default]
    Int16,
    /// 32-bit floats already in physical units.
    Float32,
}

impl DataFormat {
    /// Integer tag stored in the database.
    pub fn tag(self) -> i64 {
        match self {
            DataFormat::Int16 => 0,
            DataFormat::Float32 => 1,
        }
    }

    /// Parse a stored tag.
    pub fn from_tag(tag: i64) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(DataFormat::Int16),
            1 => Ok(DataFormat::Float32),
            other => Err(CodecError::UnknownFormat(other)),
        }
    }

    /// Bytes per encoded sample.
    pub fn width(self) -> usize {
        match self {
            DataFormat::Int16 => 2,
            DataFormat::Float32 => 4,
        }
    }
}

fn check_scale(scale: f64) -> Result<(), CodecError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(CodecError::InvalidScale(scale))
    }
}

/// A declared count too large to address reports `usize::MAX` as expected.
fn check_length(bytes: &[u8], count: usize, format: DataFormat) -> Result<(), CodecError> {
    match count.checked_mul(format.width()) {
        Some(expected) if expected == bytes.len() => Ok(()),
        expected => Err(CodecError::BlobLengthMismatch {
            expected: expected.unwrap_or(usize::MAX),
            actual: bytes.len(),
        }),
    }
}

/// Quantise one physical value to an ADC count: divide by the scale, round
/// half up and saturate to the i16 range.
fn quantise(value: f32, scale: f64) -> i16 {
    let counts = (f64::from(value) / scale + 0.5).floor();
    counts.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Encode physical-unit samples into a blob of the given format.
///
/// `scale` is the physical value of one ADC count and only matters for
/// [`DataFormat::Int16`].
pub fn encode(samples: &[f32], format: DataFormat, scale: f64) -> Result<Vec<u8>, CodecError> {
    match format {
        DataFormat::Int16 => {
            check_scale(scale)?;
            let counts: Vec<i16> = samples.iter().map(|&s| quantise(s, scale)).collect();
            Ok(encode_raw(&counts))
        }
        DataFormat::Float32 => {
            let mut buf = vec![0u8; samples.len() * format.width()];
            LittleEndian::write_f32_into(samples, &mut buf);
            Ok(buf)
        }
    }
}

/// Encode already-quantised ADC counts as an [`DataFormat::Int16`] blob.
pub fn encode_raw(counts: &[i16]) -> Vec<u8> {
    let mut buf = vec![0u8; counts.len() * DataFormat::Int16.width()];
    LittleEndian::write_i16_into(counts, &mut buf);
    buf
}

/// Decode a blob holding `count` samples.
///
/// With `raw = true` an Int16 blob is returned as unscaled counts; Float32
/// blobs have no raw representation.
pub fn decode(
    bytes: &[u8],
    count: usize,
    format: DataFormat,
    scale: f64,
    raw: bool,
) -> Result<Vec<f32>, CodecError> {
    check_length(bytes, count, format)?;

    match format {
        DataFormat::Int16 => {
            let counts = decode_raw(bytes, count)?;
            if raw {
                return Ok(counts.into_iter().map(f32::from).collect());
            }
            check_scale(scale)?;
            Ok(counts
                .into_iter()
                .map(|c| (f64::from(c) * scale) as f32)
                .collect())
        }
        DataFormat::Float32 => {
            if raw {
                return Err(CodecError::RawNotAvailable(format));
            }
            let mut samples = vec![0f32; count];
            LittleEndian::read_f32_into(bytes, &mut samples);
            Ok(samples)
        }
    }
}

/// Decode an Int16 blob into ADC counts.
pub fn decode_raw(bytes: &[u8], count: usize) -> Result<Vec<i16>, CodecError> {
    check_length(bytes, count, DataFormat::Int16)?;
    let mut counts = vec![0i16; count];
    LittleEndian::read_i16_into(bytes, &mut counts);
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_counts_survive_unit_scale() {
        let blob = encode(&[100.0, -50.0, 0.0, 32000.0], DataFormat::Int16, 1.0).unwrap();
        let raw = decode(&blob, 4, DataFormat::Int16, 1.0, true).unwrap();
        assert_eq!(raw, vec![100.0, -50.0, 0.0, 32000.0]);

        let scaled = decode(&blob, 4, DataFormat::Int16, 2.5, false).unwrap();
        assert_eq!(scaled, vec![250.0, -125.0, 0.0, 80000.0]);
    }

    #[test]
    fn int16_layout_is_little_endian() {
        let blob = encode_raw(&[1, -2, 0x1234]);
        assert_eq!(blob, vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
    }

    #[test]
    fn float32_layout_is_little_endian() {
        let blob = encode(&[1.0], DataFormat::Float32, 123.0).unwrap();
        assert_eq!(blob, 1.0f32.to_le_bytes().to_vec());
    }

    #[test]
    fn int16_encode_rounds_and_saturates() {
        let blob = encode(&[0.4, 0.5, -0.5, -0.6, 1e9, -1e9], DataFormat::Int16, 1.0).unwrap();
        let counts = decode_raw(&blob, 6).unwrap();
        assert_eq!(counts, vec![0, 1, 0, -1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn int16_round_trip_within_one_step() {
        let scale = 1e-6;
        let samples: Vec<f32> = (0..200).map(|i| ((i as f32) * 0.05).sin() * 0.01).collect();
        let blob = encode(&samples, DataFormat::Int16, scale).unwrap();
        let decoded = decode(&blob, samples.len(), DataFormat::Int16, scale, false).unwrap();
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((f64::from(*a) - f64::from(*b)).abs() <= scale, "{a} vs {b}");
        }
    }

    #[test]
    fn float32_round_trip_is_exact() {
        let samples = vec![0.125f32, -3.5, 1e-7, f32::MAX];
        let blob = encode(&samples, DataFormat::Float32, 1.0).unwrap();
        assert_eq!(blob.len(), 16);
        let decoded = decode(&blob, 4, DataFormat::Float32, 42.0, false).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn float32_rejects_raw_requests() {
        let blob = encode(&[1.0, 2.0], DataFormat::Float32, 1.0).unwrap();
        let err = decode(&blob, 2, DataFormat::Float32, 1.0, true).unwrap_err();
        assert_eq!(err, CodecError::RawNotAvailable(DataFormat::Float32));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let blob = encode_raw(&[1, 2, 3]);
        let err = decode(&blob, 4, DataFormat::Int16, 1.0, false).unwrap_err();
        assert_eq!(
            err,
            CodecError::BlobLengthMismatch {
                expected: 8,
                actual: 6
            }
        );

        let err = decode(&blob, 1, DataFormat::Float32, 1.0, false).unwrap_err();
        assert!(matches!(err, CodecError::BlobLengthMismatch { expected: 4, .. }));
    }

    #[test]
    fn corrupt_sample_count_is_a_length_mismatch() {
        let err = decode(&[0; 4], usize::MAX / 2 + 1, DataFormat::Int16, 1.0, false).unwrap_err();
        assert_eq!(
            err,
            CodecError::BlobLengthMismatch {
                expected: usize::MAX,
                actual: 4
            }
        );
        assert!(matches!(
            decode(&[0; 8], usize::MAX / 3, DataFormat::Float32, 1.0, false).unwrap_err(),
            CodecError::BlobLengthMismatch { actual: 8, .. }
        ));
        assert!(matches!(
            decode_raw(&[0; 2], usize::MAX).unwrap_err(),
            CodecError::BlobLengthMismatch { .. }
        ));
    }

    #[test]
    fn empty_blob_decodes_to_empty_samples() {
        assert!(decode(&[], 0, DataFormat::Int16, 1.0, false).unwrap().is_empty());
        assert!(decode(&[], 0, DataFormat::Float32, 1.0, false).unwrap().is_empty());
    }

    #[test]
    fn format_tags_round_trip() {
        assert_eq!(DataFormat::from_tag(0).unwrap(), DataFormat::Int16);
        assert_eq!(DataFormat::from_tag(1).unwrap(), DataFormat::Float32);
        assert_eq!(DataFormat::from_tag(2).unwrap_err(), CodecError::UnknownFormat(2));
        assert_eq!(DataFormat::Float32.tag(), 1);
    }

    #[test]
    fn int16_encode_rejects_zero_scale() {
        let err = encode(&[1.0], DataFormat::Int16, 0.0).unwrap_err();
        assert_eq!(err, CodecError::InvalidScale(0.0));
    }
}
