// ABOUTME: Core domain types for Acoustic Emission session stores.
// ABOUTME: Record types, time base, scaling, waveform codec and stitching; no I/O.

pub mod codec;
pub mod extract;
pub mod info;
pub mod record;
pub mod scaling;
pub mod time;
pub mod wave;

pub use codec::{CodecError, DataFormat};
pub use extract::FeatureExtractor;
pub use info::{FieldInfo, GlobalInfo};
pub use record::{
    ChannelId, EventRecord, FeatureRecord, HitRecord, MarkerKind, MarkerRecord, ParamId,
    ParametricRecord, RowId, SetType, StatusRecord, TransientId, TransientRecord,
};
pub use scaling::{EventParams, EventScaling, RawHit, RawStatus, WaveformParams};
pub use time::{TICK_TOLERANCE, TimeBase, TimeTick};
pub use wave::{ContinuousWave, WaveError};
