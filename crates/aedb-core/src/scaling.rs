// ABOUTME: Per-channel conversion between stored integer columns and physical units.
// ABOUTME: Hits and status sets are stored as ADC-scaled integers and exposed in volts, eu and nVs.

use serde::{Deserialize, Serialize};

use crate::record::{ChannelId, HitRecord, ParamId, RowId, StatusRecord, TransientId};
use crate::time::{TimeBase, TimeTick};

/// Ratio between the stored RMS integer and the amplitude ADC step.
pub const RMS_FACTOR: f64 = 0.0065536;

/// One row of the events parameter table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventParams {
    pub id: ParamId,
    pub setup_id: Option<i64>,
    pub channel: Option<ChannelId>,
    /// Microvolts per amplitude ADC step.
    pub adc_uv: f64,
    /// Energy units per stored energy step.
    pub adc_te: f64,
    /// nVs per stored signal strength step.
    pub adc_ss: f64,
}

impl EventParams {
    /// Parameters that store physical values one-to-one (1 µV, 1 eu, 1 nVs per step).
    pub fn unit(id: ParamId) -> Self {
        Self {
            id,
            setup_id: None,
            channel: None,
            adc_uv: 1.0,
            adc_te: 1.0,
            adc_ss: 1.0,
        }
    }
}

/// One row of the waveform parameter table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformParams {
    pub id: ParamId,
    pub setup_id: Option<i64>,
    pub channel: Option<ChannelId>,
    /// Microvolts per threshold ADC step.
    pub adc_uv: f64,
    /// Millivolts per waveform sample count.
    pub tr_mv: f64,
}

impl WaveformParams {
    pub fn unit(id: ParamId) -> Self {
        Self {
            id,
            setup_id: None,
            channel: None,
            adc_uv: 1.0,
            tr_mv: 1.0,
        }
    }

    /// Volts per sample count, the scale handed to the blob codec.
    pub fn blob_scale(&self) -> f64 {
        self.tr_mv * 1e-3
    }

    pub fn threshold_volts(&self, raw: i64) -> f64 {
        raw as f64 * self.adc_uv * 1e-6
    }

    pub fn threshold_raw(&self, volts: f64) -> i64 {
        (volts * 1e6 / self.adc_uv).round() as i64
    }
}

/// Hit columns exactly as stored in the events table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawHit {
    pub set_id: Option<RowId>,
    pub time: TimeTick,
    pub channel: ChannelId,
    pub param_id: ParamId,
    pub thr: Option<i64>,
    pub amp: i64,
    pub rise_t: Option<i64>,
    pub dur: i64,
    pub eny: i64,
    pub ss: Option<i64>,
    pub rms: i64,
    pub counts: Option<i64>,
    pub trai: Option<TransientId>,
    pub c_hits: Option<i64>,
    pub c_cnt: Option<i64>,
    pub c_eny: Option<i64>,
    pub c_ss: Option<i64>,
}

/// Status columns exactly as stored in the events table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawStatus {
    pub set_id: Option<RowId>,
    pub time: TimeTick,
    pub channel: ChannelId,
    pub param_id: ParamId,
    pub thr: Option<i64>,
    pub eny: i64,
    pub ss: Option<i64>,
    pub rms: i64,
}

/// Converts event columns of one channel setup in both directions.
///
/// Stored integers are rounded to the nearest step on the way in.
#[derive(Debug, Clone, Copy)]
pub struct EventScaling<'a> {
    params: &'a EventParams,
    time_base: TimeBase,
}

impl<'a> EventScaling<'a> {
    pub fn new(params: &'a EventParams, time_base: TimeBase) -> Self {
        Self { params, time_base }
    }

    fn volts(&self, raw: i64) -> f64 {
        raw as f64 * self.params.adc_uv * 1e-6
    }

    fn volts_raw(&self, volts: f64) -> i64 {
        (volts * 1e6 / self.params.adc_uv).round() as i64
    }

    fn energy(&self, raw: i64) -> f64 {
        raw as f64 * self.params.adc_te
    }

    fn energy_raw(&self, eu: f64) -> i64 {
        (eu / self.params.adc_te).round() as i64
    }

    fn signal_strength(&self, raw: i64) -> f64 {
        raw as f64 * self.params.adc_ss
    }

    fn signal_strength_raw(&self, nvs: f64) -> i64 {
        (nvs / self.params.adc_ss).round() as i64
    }

    fn rms(&self, raw: i64) -> f64 {
        raw as f64 * self.params.adc_uv * RMS_FACTOR * 1e-6
    }

    fn rms_raw(&self, volts: f64) -> i64 {
        (volts * 1e6 / self.params.adc_uv / RMS_FACTOR).round() as i64
    }

    pub fn hit_from_raw(&self, raw: &RawHit) -> HitRecord {
        HitRecord {
            set_id: raw.set_id,
            time: self.time_base.to_seconds(raw.time),
            channel: raw.channel,
            param_id: raw.param_id,
            threshold: raw.thr.map(|v| self.volts(v)),
            amplitude: self.volts(raw.amp),
            rise_time: raw.rise_t.map(|v| self.time_base.to_seconds(v)),
            duration: self.time_base.to_seconds(raw.dur),
            energy: self.energy(raw.eny),
            signal_strength: raw.ss.map(|v| self.signal_strength(v)),
            rms: self.rms(raw.rms),
            counts: raw.counts,
            trai: raw.trai,
            cascade_hits: raw.c_hits,
            cascade_counts: raw.c_cnt,
            cascade_energy: raw.c_eny,
            cascade_signal_strength: raw.c_ss,
        }
    }

    pub fn hit_to_raw(&self, hit: &HitRecord) -> RawHit {
        RawHit {
            set_id: hit.set_id,
            time: self.time_base.to_ticks(hit.time),
            channel: hit.channel,
            param_id: hit.param_id,
            thr: hit.threshold.map(|v| self.volts_raw(v)),
            amp: self.volts_raw(hit.amplitude),
            rise_t: hit.rise_time.map(|v| self.time_base.to_ticks(v)),
            dur: self.time_base.to_ticks(hit.duration),
            eny: self.energy_raw(hit.energy),
            ss: hit.signal_strength.map(|v| self.signal_strength_raw(v)),
            rms: self.rms_raw(hit.rms),
            counts: hit.counts,
            trai: hit.trai,
            c_hits: hit.cascade_hits,
            c_cnt: hit.cascade_counts,
            c_eny: hit.cascade_energy,
            c_ss: hit.cascade_signal_strength,
        }
    }

    pub fn status_from_raw(&self, raw: &RawStatus) -> StatusRecord {
        StatusRecord {
            set_id: raw.set_id,
            time: self.time_base.to_seconds(raw.time),
            channel: raw.channel,
            param_id: raw.param_id,
            threshold: raw.thr.map(|v| self.volts(v)),
            energy: self.energy(raw.eny),
            signal_strength: raw.ss.map(|v| self.signal_strength(v)),
            rms: self.rms(raw.rms),
        }
    }

    pub fn status_to_raw(&self, status: &StatusRecord) -> RawStatus {
        RawStatus {
            set_id: status.set_id,
            time: self.time_base.to_ticks(status.time),
            channel: status.channel,
            param_id: status.param_id,
            thr: status.threshold.map(|v| self.volts_raw(v)),
            eny: self.energy_raw(status.energy),
            ss: status.signal_strength.map(|v| self.signal_strength_raw(v)),
            rms: self.rms_raw(status.rms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EventParams {
        EventParams {
            id: 1,
            setup_id: Some(1),
            channel: Some(1),
            adc_uv: 1.5625,
            adc_te: 0.0004,
            adc_ss: 0.03,
        }
    }

    #[test]
    fn hit_amplitude_uses_adc_step() {
        let p = params();
        let scaling = EventScaling::new(&p, TimeBase::DEFAULT);
        let raw = RawHit {
            amp: 6400,
            dur: 1_000,
            eny: 2_500,
            rms: 100,
            ..Default::default()
        };
        let hit = scaling.hit_from_raw(&raw);

        assert!((hit.amplitude - 0.01).abs() < 1e-12);
        assert!((hit.duration - 1e-4).abs() < 1e-15);
        assert!((hit.energy - 1.0).abs() < 1e-12);
        assert!((hit.rms - 100.0 * 1.5625 * RMS_FACTOR * 1e-6).abs() < 1e-15);
    }

    #[test]
    fn hit_survives_raw_round_trip() {
        let p = params();
        let scaling = EventScaling::new(&p, TimeBase::DEFAULT);
        let raw = RawHit {
            set_id: Some(10),
            time: 43_686_000,
            channel: 3,
            param_id: 1,
            thr: Some(1_600),
            amp: 31_000,
            rise_t: Some(492),
            dur: 8_200,
            eny: 12_345,
            ss: Some(789),
            rms: 41,
            counts: Some(17),
            trai: Some(5),
            c_hits: Some(1),
            c_cnt: None,
            c_eny: None,
            c_ss: None,
        };

        let back = scaling.hit_to_raw(&scaling.hit_from_raw(&raw));
        assert_eq!(back, raw);
    }

    #[test]
    fn status_survives_raw_round_trip() {
        let p = params();
        let scaling = EventScaling::new(&p, TimeBase::DEFAULT);
        let raw = RawStatus {
            set_id: Some(2),
            time: 10_000_000,
            channel: 1,
            param_id: 1,
            thr: None,
            eny: 77,
            ss: Some(3),
            rms: 512,
        };
        let status = scaling.status_from_raw(&raw);
        assert_eq!(status.time, 1.0);
        assert_eq!(scaling.status_to_raw(&status), raw);
    }

    #[test]
    fn waveform_blob_scale_is_millivolts() {
        let p = WaveformParams {
            tr_mv: 0.0625,
            ..WaveformParams::unit(1)
        };
        assert_eq!(p.blob_scale(), 0.0625e-3);
        assert_eq!(p.threshold_raw(p.threshold_volts(1_234)), 1_234);
    }
}
