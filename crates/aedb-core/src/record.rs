// ABOUTME: Typed records for the three session stores: hits, markers, status and parametric sets,
// ABOUTME: transient waveforms and feature vectors, plus the identifier types that link them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::DataFormat;

/// Insertion-order identifier of a row, assigned by the store.
pub type RowId = i64;

/// Transient recorder index: links a hit, its waveform and its features.
pub type TransientId = i64;

/// Acquisition channel number.
pub type ChannelId = u16;

/// Identifier of a row in a channel-parameter table.
pub type ParamId = i64;

/// Kind of an events-table row, persisted as the integer `SetType` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetType {
    Parametric,
    Hit,
    Status,
    Label,
    DateTime,
    SectionStart,
}

impl SetType {
    pub fn code(self) -> i64 {
        match self {
            SetType::Parametric => 1,
            SetType::Hit => 2,
            SetType::Status => 3,
            SetType::Label => 4,
            SetType::DateTime => 5,
            SetType::SectionStart => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(SetType::Parametric),
            2 => Some(SetType::Hit),
            3 => Some(SetType::Status),
            4 => Some(SetType::Label),
            5 => Some(SetType::DateTime),
            6 => Some(SetType::SectionStart),
            _ => None,
        }
    }
}

/// What a marker row means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// Free-text label set by the user.
    #[default]
    Label,
    /// Wall-clock timestamp written whenever recording starts.
    DateTime,
    /// Start of a new section, e.g. after acquisition settings changed.
    SectionStart,
}

impl MarkerKind {
    pub fn set_type(self) -> SetType {
        match self {
            MarkerKind::Label => SetType::Label,
            MarkerKind::DateTime => SetType::DateTime,
            MarkerKind::SectionStart => SetType::SectionStart,
        }
    }

    pub fn from_set_type(set_type: SetType) -> Option<Self> {
        match set_type {
            SetType::Label => Some(MarkerKind::Label),
            SetType::DateTime => Some(MarkerKind::DateTime),
            SetType::SectionStart => Some(MarkerKind::SectionStart),
            _ => None,
        }
    }
}

/// A detected acoustic event, in physical units.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HitRecord {
    /// Ignored on write; the store assigns it.
    pub set_id: Option<RowId>,
    /// Seconds since session start.
    pub time: f64,
    pub channel: ChannelId,
    pub param_id: ParamId,
    /// Volts.
    pub threshold: Option<f64>,
    /// Peak amplitude in volts.
    pub amplitude: f64,
    /// Seconds.
    pub rise_time: Option<f64>,
    /// Seconds.
    pub duration: f64,
    /// Energy in eu (1e-14 V²s).
    pub energy: f64,
    /// Signal strength in nVs.
    pub signal_strength: Option<f64>,
    /// RMS of the noise before the hit, in volts.
    pub rms: f64,
    /// Positive threshold crossings.
    pub counts: Option<i64>,
    pub trai: Option<TransientId>,
    pub cascade_hits: Option<i64>,
    pub cascade_counts: Option<i64>,
    pub cascade_energy: Option<i64>,
    pub cascade_signal_strength: Option<i64>,
}

/// A user or system annotation in the events store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub set_id: Option<RowId>,
    pub time: f64,
    pub kind: MarkerKind,
    pub number: Option<i64>,
    pub data: String,
}

/// Periodic channel status (noise level, energy) in physical units.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusRecord {
    pub set_id: Option<RowId>,
    pub time: f64,
    pub channel: ChannelId,
    pub param_id: ParamId,
    pub threshold: Option<f64>,
    pub energy: f64,
    pub signal_strength: Option<f64>,
    pub rms: f64,
}

/// External parametric inputs (counters and analog values), stored unscaled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParametricRecord {
    pub set_id: Option<RowId>,
    pub time: f64,
    pub param_id: ParamId,
    /// Digital counter.
    pub pctd: Option<i64>,
    /// Analog hysteresis counter.
    pub pcta: Option<i64>,
    /// Raw values of the analog inputs PA0..PA7.
    pub pa: [Option<i64>; 8],
}

/// Any row of the events table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventRecord {
    Hit(HitRecord),
    Marker(MarkerRecord),
    Status(StatusRecord),
    Parametric(ParametricRecord),
}

impl EventRecord {
    pub fn set_id(&self) -> Option<RowId> {
        match self {
            EventRecord::Hit(r) => r.set_id,
            EventRecord::Marker(r) => r.set_id,
            EventRecord::Status(r) => r.set_id,
            EventRecord::Parametric(r) => r.set_id,
        }
    }

    pub fn time(&self) -> f64 {
        match self {
            EventRecord::Hit(r) => r.time,
            EventRecord::Marker(r) => r.time,
            EventRecord::Status(r) => r.time,
            EventRecord::Parametric(r) => r.time,
        }
    }

    pub fn set_type(&self) -> SetType {
        match self {
            EventRecord::Hit(_) => SetType::Hit,
            EventRecord::Marker(r) => r.kind.set_type(),
            EventRecord::Status(_) => SetType::Status,
            EventRecord::Parametric(_) => SetType::Parametric,
        }
    }
}

/// A recorded transient waveform.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransientRecord {
    pub set_id: Option<RowId>,
    /// Assigned by the store when `None` on write.
    pub trai: Option<TransientId>,
    /// Seconds since session start of the first sample.
    pub time: f64,
    pub channel: ChannelId,
    pub param_id: ParamId,
    /// Samples recorded before the trigger point.
    pub pretrigger: u32,
    /// Volts.
    pub threshold: f64,
    /// Hz.
    pub samplerate: u32,
    pub samples: usize,
    /// Volts, or ADC counts when `raw` is set.
    pub data: Vec<f32>,
    pub data_format: DataFormat,
    pub raw: bool,
}

impl TransientRecord {
    /// Time of each sample relative to the trigger point, in seconds.
    pub fn time_axis(&self) -> Vec<f32> {
        crate::wave::time_axis(self.samples, self.samplerate, self.pretrigger)
    }

    /// Recorded length in seconds.
    pub fn duration(&self) -> f64 {
        if self.samplerate == 0 {
            return 0.0;
        }
        self.samples as f64 / f64::from(self.samplerate)
    }
}

/// Features computed from one waveform.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub trai: TransientId,
    pub features: BTreeMap<String, f64>,
}

impl FeatureRecord {
    pub fn new(trai: TransientId) -> Self {
        Self {
            trai,
            features: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_type_codes_round_trip() {
        for code in 1..=6 {
            let set_type = SetType::from_code(code).unwrap();
            assert_eq!(set_type.code(), code);
        }
        assert!(SetType::from_code(0).is_none());
        assert!(SetType::from_code(7).is_none());
    }

    #[test]
    fn only_marker_set_types_map_to_marker_kinds() {
        assert_eq!(MarkerKind::from_set_type(SetType::DateTime), Some(MarkerKind::DateTime));
        assert_eq!(MarkerKind::from_set_type(SetType::Hit), None);
        assert_eq!(MarkerKind::SectionStart.set_type().code(), 6);
    }

    #[test]
    fn event_record_serializes_with_type_tag() {
        let record = EventRecord::Marker(MarkerRecord {
            set_id: Some(3),
            time: 1.5,
            kind: MarkerKind::Label,
            number: Some(1),
            data: "crack opened".to_string(),
        });

        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["type"], "marker");
        assert_eq!(json["data"], "crack opened");

        let back: EventRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, record);
        assert_eq!(back.set_type(), SetType::Label);
    }

    #[test]
    fn transient_duration_handles_zero_rate() {
        let tra = TransientRecord {
            samples: 100,
            samplerate: 0,
            ..Default::default()
        };
        assert_eq!(tra.duration(), 0.0);

        let tra = TransientRecord {
            samples: 1000,
            samplerate: 1_000_000,
            ..Default::default()
        };
        assert_eq!(tra.duration(), 0.001);
    }

    #[test]
    fn feature_record_builder_collects_values() {
        let rec = FeatureRecord::new(7).with("RA", 1.5).with("FFT_CoG", 120_000.0);
        assert_eq!(rec.trai, 7);
        assert_eq!(rec.features.len(), 2);
        assert_eq!(rec.features["RA"], 1.5);
    }
}
