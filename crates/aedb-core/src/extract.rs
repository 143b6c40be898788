// ABOUTME: Boundary for feature extraction: anything that turns a decoded waveform into
// ABOUTME: named scalar features. Extractors never touch a store.

use std::collections::BTreeMap;

use crate::record::TransientRecord;

/// Computes named features from one decoded transient.
///
/// Implementations must be `Sync` so batch extraction can share one
/// extractor between worker threads.
pub trait FeatureExtractor: Sync {
    fn extract(&self, transient: &TransientRecord) -> BTreeMap<String, f64>;
}

impl<F> FeatureExtractor for F
where
    F: Fn(&TransientRecord) -> BTreeMap<String, f64> + Sync,
{
    fn extract(&self, transient: &TransientRecord) -> BTreeMap<String, f64> {
        self(transient)
    }
}

/// Peak absolute amplitude and the number of samples; handy as a minimal extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeakAmplitude;

impl FeatureExtractor for PeakAmplitude {
    fn extract(&self, transient: &TransientRecord) -> BTreeMap<String, f64> {
        let peak = transient
            .data
            .iter()
            .fold(0f32, |acc, &v| acc.max(v.abs()));
        BTreeMap::from([
            ("PeakAmp".to_string(), f64::from(peak)),
            ("Samples".to_string(), transient.samples as f64),
        ])
    }
}
