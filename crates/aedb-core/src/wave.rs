// ABOUTME: Waveform helpers: per-record time axes and stitching of consecutive transient
// ABOUTME: records of one channel into a single continuous, zero-filled, cropped signal.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::record::{TransientId, TransientRecord};

#[derive(Debug, Error, PartialEq)]
pub enum WaveError {
    #[error("sample rate {actual} Hz of record {trai:?} differs from {expected} Hz inside the requested window")]
    SampleRateMismatch {
        expected: u32,
        actual: u32,
        trai: Option<TransientId>,
    },

    #[error("record {trai:?} has a sample rate of zero")]
    ZeroSampleRate { trai: Option<TransientId> },
}

/// Sample times in seconds relative to the trigger point.
pub fn time_axis(samples: usize, samplerate: u32, pretrigger: u32) -> Vec<f32> {
    if samplerate == 0 {
        return vec![0.0; samples];
    }
    let rate = f64::from(samplerate);
    let offset = i64::from(pretrigger);
    (0..samples as i64)
        .map(|n| ((n - offset) as f64 / rate) as f32)
        .collect()
}

/// A contiguous signal assembled from several transient records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContinuousWave {
    /// Seconds since session start of the first sample.
    pub start: f64,
    /// Zero when no record contributed.
    pub samplerate: u32,
    pub data: Vec<f32>,
}

impl ContinuousWave {
    /// Absolute sample times in seconds.
    pub fn time_axis(&self) -> Vec<f64> {
        if self.samplerate == 0 {
            return Vec::new();
        }
        let rate = f64::from(self.samplerate);
        (0..self.data.len())
            .map(|n| self.start + n as f64 / rate)
            .collect()
    }
}

fn clamp_index(index: f64, samples: usize) -> usize {
    if index <= 0.0 {
        0
    } else {
        (index as usize).min(samples)
    }
}

/// Stitch time-ordered records of a single channel into one signal.
///
/// The result is cropped to `[start, stop)`. Gaps longer than one sample
/// period between records are filled with zeros, as is the tail up to
/// `stop`. Records that start before `start` (typically the previous
/// record of the channel) contribute only their overlapping part.
/// `start = None` begins at the first record.
pub fn stitch<'a, I>(records: I, start: Option<f64>, stop: Option<f64>) -> Result<ContinuousWave, WaveError>
where
    I: IntoIterator<Item = &'a TransientRecord>,
{
    let mut records = records.into_iter().peekable();
    let start = match (start, records.peek()) {
        (Some(start), _) => start,
        (None, Some(first)) => first.time,
        (None, None) => return Ok(ContinuousWave::default()),
    };

    let mut samplerate = 0u32;
    let mut data: Vec<f32> = Vec::new();
    let mut expected_time = start;

    for tra in records {
        if tra.samplerate == 0 {
            return Err(WaveError::ZeroSampleRate { trai: tra.trai });
        }
        if samplerate == 0 {
            samplerate = tra.samplerate;
        }
        if tra.samplerate != samplerate {
            return Err(WaveError::SampleRateMismatch {
                expected: samplerate,
                actual: tra.samplerate,
                trai: tra.trai,
            });
        }
        let rate = f64::from(samplerate);

        let gap = tra.time - expected_time;
        if gap > 1.0 / rate {
            let fill = (gap * rate).round() as usize;
            debug!(trai = ?tra.trai, fill, "zero-filling gap before record");
            data.resize(data.len() + fill, 0.0);
        }

        let available = tra.data.len().min(tra.samples);
        let n_start = clamp_index(((start - tra.time) * rate).round(), available);
        let n_stop = match stop {
            Some(stop) => clamp_index(((stop - tra.time) * rate).round(), available),
            None => available,
        };
        if n_start < n_stop {
            data.extend_from_slice(&tra.data[n_start..n_stop]);
        }

        expected_time = (tra.time + n_stop as f64 / rate).max(start);
    }

    if let Some(stop) = stop {
        if samplerate > 0 {
            let rate = f64::from(samplerate);
            let remaining = stop - expected_time;
            if remaining.abs() > 1.0 / rate && remaining > 0.0 {
                let fill = (remaining * rate).round() as usize;
                data.resize(data.len() + fill, 0.0);
            }
        }
    }

    Ok(ContinuousWave {
        start,
        samplerate,
        data,
    })
}
