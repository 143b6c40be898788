// ABOUTME: Waveforms store facade (.tradb): transient records with encoded sample blobs,
// ABOUTME: point and range reads, continuous-wave stitching per channel and live tailing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use aedb_core::codec::{self, CodecError};
use aedb_core::time::is_monotonic;
use aedb_core::wave::{self, ContinuousWave};
use aedb_core::{
    ChannelId, DataFormat, FieldInfo, ParamId, TimeBase, TimeTick, TransientId, TransientRecord, WaveformParams,
};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params_from_iter};
use tracing::debug;

use crate::error::StoreError;
use crate::handle::{OpenMode, Store, StoreHandle, StoreKind};
use crate::params::{self, ParamCache};
use crate::query::{Conditions, ReadFilter};
use crate::range::{self, KeyRange, WAVEFORMS_INDEX};
use crate::schema::{self, CreateOptions};
use crate::tail::{CancelToken, RowMapper, SqlSource, Tail, TailOptions};
use crate::write::{RowValues, WriteTx};

const TABLE: &str = "tr_data";

const SELECT: &str = "SELECT SetID, TRAI, Time, Chan, ParamID, Pretrigger, Thr, SampleRate, \
    Samples, DataFormat, Data FROM tr_data";

/// Tail over the waveforms table.
pub type WaveformTail<'a> = Tail<SqlSource<'a, TransientRecord>>;

fn out_of_range(column: &str, trai: TransientId, value: i64) -> StoreError {
    StoreError::InvalidArgument(format!("{TABLE}: TRAI {trai} has {column} {value}"))
}

fn codec_error(trai: TransientId) -> impl FnOnce(CodecError) -> StoreError {
    move |source| StoreError::Codec {
        table: TABLE.to_string(),
        key: trai,
        source,
    }
}

/// One tr_data row as stored.
struct WaveRow {
    set_id: i64,
    trai: TransientId,
    time: TimeTick,
    chan: i64,
    param_id: ParamId,
    pretrigger: i64,
    thr: i64,
    samplerate: i64,
    samples: i64,
    data_format: i64,
    data: Vec<u8>,
}

impl WaveRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            set_id: row.get(0)?,
            trai: row.get(1)?,
            time: row.get(2)?,
            chan: row.get(3)?,
            param_id: row.get(4)?,
            pretrigger: row.get(5)?,
            thr: row.get(6)?,
            samplerate: row.get(7)?,
            samples: row.get(8)?,
            data_format: row.get(9)?,
            data: row.get(10)?,
        })
    }

    fn into_record(
        self,
        params: &mut ParamCache<'_, WaveformParams>,
        time_base: TimeBase,
        raw: bool,
    ) -> Result<TransientRecord, StoreError> {
        let trai = self.trai;
        let channel = ChannelId::try_from(self.chan).map_err(|_| out_of_range("Chan", trai, self.chan))?;
        let pretrigger =
            u32::try_from(self.pretrigger).map_err(|_| out_of_range("Pretrigger", trai, self.pretrigger))?;
        let samplerate =
            u32::try_from(self.samplerate).map_err(|_| out_of_range("SampleRate", trai, self.samplerate))?;
        let samples = usize::try_from(self.samples).map_err(|_| out_of_range("Samples", trai, self.samples))?;
        let data_format = DataFormat::from_tag(self.data_format).map_err(codec_error(trai))?;

        let p = params.get(Some(self.param_id))?;
        let data = codec::decode(&self.data, samples, data_format, p.blob_scale(), raw).map_err(codec_error(trai))?;

        Ok(TransientRecord {
            set_id: Some(self.set_id),
            trai: Some(trai),
            time: time_base.to_seconds(self.time),
            channel,
            param_id: self.param_id,
            pretrigger,
            threshold: p.threshold_volts(self.thr),
            samplerate,
            samples,
            data,
            data_format,
            raw,
        })
    }
}

/// Insert one record inside an open transaction and return its TRAI.
fn insert_record(
    tx: &mut WriteTx<'_>,
    params: &BTreeMap<ParamId, WaveformParams>,
    time_base: TimeBase,
    record: &TransientRecord,
) -> Result<TransientId, StoreError> {
    if record.samples != record.data.len() {
        return Err(StoreError::InvalidArgument(format!(
            "{TABLE}: record declares {} samples but carries {}",
            record.samples,
            record.data.len()
        )));
    }
    let samples = i64::try_from(record.samples)
        .map_err(|_| StoreError::InvalidArgument(format!("{TABLE}: sample count {} is too large", record.samples)))?;
    let p = params
        .get(&record.param_id)
        .ok_or_else(|| StoreError::not_found("tr_params", format!("ID {}", record.param_id)))?;

    let trai = match record.trai {
        Some(trai) => trai,
        None => tx.max_key(TABLE, "TRAI")?.unwrap_or(0) + 1,
    };
    if trai < 1 {
        return Err(StoreError::InvalidArgument(format!("{TABLE}: TRAI must be positive, got {trai}")));
    }
    if tx.exists(TABLE, "TRAI", trai)? {
        return Err(StoreError::InvalidArgument(format!("{TABLE}: TRAI {trai} already exists")));
    }

    let time = time_base.to_ticks(record.time);
    let (below, above) = tx.neighbours(TABLE, "TRAI", "Time", trai)?;
    if let Some((_, previous)) = below.filter(|&(_, t)| !is_monotonic(t, time)) {
        return Err(StoreError::NotMonotonic {
            table: TABLE.to_string(),
            key: trai,
            previous,
            time,
        });
    }
    if let Some((key, next)) = above.filter(|&(_, t)| !is_monotonic(time, t)) {
        return Err(StoreError::NotMonotonic {
            table: TABLE.to_string(),
            key,
            previous: time,
            time: next,
        });
    }

    let encoded = match (record.raw, record.data_format) {
        (false, format) => codec::encode(&record.data, format, p.blob_scale()),
        (true, DataFormat::Int16) => codec::encode(&record.data, DataFormat::Int16, 1.0),
        (true, format) => Err(CodecError::RawNotAvailable(format)),
    };
    let blob = encoded.map_err(codec_error(trai))?;

    let row = RowValues::new()
        .int("Time", time)
        .int("Chan", i64::from(record.channel))
        .int("Status", 0)
        .int("ParamID", record.param_id)
        .int("Pretrigger", i64::from(record.pretrigger))
        .int("Thr", p.threshold_raw(record.threshold))
        .int("SampleRate", i64::from(record.samplerate))
        .int("Samples", samples)
        .int("DataFormat", record.data_format.tag())
        .blob("Data", blob)
        .int("TRAI", trai);
    tx.append_one(TABLE, row)?;
    Ok(trai)
}

/// The waveforms store of a session.
#[derive(Debug)]
pub struct WaveformStore {
    handle: StoreHandle,
    time_base: TimeBase,
}

impl Store for WaveformStore {
    const KIND: StoreKind = StoreKind::Waveforms;

    fn from_handle(handle: StoreHandle) -> Result<Self, StoreError> {
        let time_base = handle.info().time_base().ok_or_else(|| StoreError::SchemaMismatch {
            path: handle.location().path.clone(),
            reason: "missing TimeBase".to_string(),
        })?;
        Ok(Self { handle, time_base })
    }

    fn handle(&self) -> &StoreHandle {
        &self.handle
    }
}

impl WaveformStore {
    pub fn create(path: impl AsRef<Path>, options: &CreateOptions) -> Result<Self, StoreError> {
        schema::create(path.as_ref(), StoreKind::Waveforms, options)?;
        Self::open(path, OpenMode::ReadWrite)
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    /// FileID of the events store these waveforms belong to.
    pub fn reference_id(&self) -> Option<&str> {
        self.handle.info().reference_id()
    }

    /// Highest TRAI ever committed.
    pub fn last_trai(&self) -> Option<TransientId> {
        self.handle.info().trai()
    }

    pub fn field_info(&self) -> Result<Vec<FieldInfo>, StoreError> {
        self.handle.field_info()
    }

    pub fn tables(&self) -> Result<Vec<String>, StoreError> {
        self.handle.tables()
    }

    pub fn columns(&self) -> Result<Vec<String>, StoreError> {
        self.handle.columns()
    }

    pub fn channels(&self) -> Result<BTreeSet<ChannelId>, StoreError> {
        self.handle.channels()
    }

    pub fn params(&self) -> Result<BTreeMap<ParamId, WaveformParams>, StoreError> {
        params::load_waveform_params(self.handle.conn())
    }

    pub fn write_params(&mut self, params: &WaveformParams) -> Result<(), StoreError> {
        let row = params::waveform_params_row(params);
        self.handle.write(|tx| tx.upsert("tr_params", "ID", row))?;
        Ok(())
    }

    /// TRAI bounds of the waveforms recorded in `[start, stop]` seconds.
    pub fn find_range(&self, start: Option<f64>, stop: Option<f64>) -> Result<KeyRange, StoreError> {
        range::find_range(
            self.handle.conn(),
            &WAVEFORMS_INDEX,
            start.map(|s| self.time_base.to_ticks(s)),
            stop.map(|s| self.time_base.to_ticks(s)),
        )
    }

    fn query(&self, cond: &Conditions, raw: bool) -> Result<Vec<TransientRecord>, StoreError> {
        let conn = self.handle.conn();
        let sql = format!("{SELECT}{} ORDER BY TRAI", cond.where_clause());
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(cond.params()))?;
        let mut cache = ParamCache::waveforms(conn);

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(WaveRow::read(row)?.into_record(&mut cache, self.time_base, raw)?);
        }
        Ok(records)
    }

    /// Waveforms matching `filter`, in TRAI order. `filter.ids` are TRAIs.
    ///
    /// With `raw` set, Int16 samples are returned as ADC counts.
    pub fn read(&self, filter: &ReadFilter, raw: bool) -> Result<Vec<TransientRecord>, StoreError> {
        match self.conditions(filter)? {
            Some(cond) => self.query(&cond, raw),
            None => Ok(Vec::new()),
        }
    }

    /// TRAIs matching `filter`, without decoding any blob.
    pub fn trais(&self, filter: &ReadFilter) -> Result<Vec<TransientId>, StoreError> {
        let Some(cond) = self.conditions(filter)? else {
            return Ok(Vec::new());
        };
        let sql = format!("SELECT TRAI FROM tr_data{} ORDER BY TRAI", cond.where_clause());
        let mut stmt = self.handle.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(cond.params()), |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<TransientId>, _>>()?)
    }

    /// `None` when the time window holds no rows.
    fn conditions(&self, filter: &ReadFilter) -> Result<Option<Conditions>, StoreError> {
        let mut cond = Conditions::new();
        if filter.has_time_window() {
            match self.find_range(filter.time_start, filter.time_stop) {
                Ok(range) => cond.between("TRAI", range.low, range.high),
                Err(StoreError::EmptyRange { .. }) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
        cond.in_list("Chan", filter.channels.iter().map(|&c| i64::from(c)));
        cond.in_list("TRAI", filter.ids.iter().copied());
        cond.raw(filter.sql.as_deref());
        Ok(Some(cond))
    }

    /// Point lookup by TRAI.
    pub fn read_wave(&self, trai: TransientId, raw: bool) -> Result<TransientRecord, StoreError> {
        let mut cond = Conditions::new();
        cond.in_list("TRAI", [trai]);
        self.query(&cond, raw)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found(TABLE, format!("TRAI {trai}")))
    }

    /// One continuous signal of `channel` over `[start, stop)` seconds.
    ///
    /// The record of the channel preceding the window is included so a
    /// waveform that starts before `start` contributes its overlap. With
    /// `start = None` the signal begins at the first waveform of the store.
    pub fn read_continuous_wave(
        &self,
        channel: ChannelId,
        start: Option<f64>,
        stop: Option<f64>,
        raw: bool,
    ) -> Result<ContinuousWave, StoreError> {
        let start = match start {
            Some(start) => start,
            None => {
                let first: Option<TimeTick> = self
                    .handle
                    .conn()
                    .query_row("SELECT Time FROM tr_data ORDER BY TRAI LIMIT 1", [], |r| r.get(0))
                    .optional()?;
                match first {
                    Some(ticks) => self.time_base.to_seconds(ticks),
                    None => return Ok(ContinuousWave::default()),
                }
            }
        };
        if let Some(stop) = stop {
            if stop < start {
                return Err(StoreError::InvalidArgument(format!(
                    "{TABLE}: time stop {stop} is before time start {start}"
                )));
            }
        }
        let chan = i64::from(channel);

        let mut before = Conditions::new();
        before.push(
            "Chan = ? AND Time < ?",
            [Value::Integer(chan), Value::Integer(self.time_base.to_ticks(start))],
        );
        let previous: Option<TransientId> = self
            .handle
            .conn()
            .query_row(
                &format!("SELECT TRAI FROM tr_data{} ORDER BY TRAI DESC LIMIT 1", before.where_clause()),
                params_from_iter(before.params()),
                |r| r.get(0),
            )
            .optional()?;

        let mut records = Vec::new();
        if let Some(trai) = previous {
            records.push(self.read_wave(trai, raw)?);
        }
        match self.find_range(Some(start), stop) {
            Ok(range) => {
                let mut cond = Conditions::new();
                cond.between("TRAI", range.low, range.high);
                cond.in_list("Chan", [chan]);
                records.extend(self.query(&cond, raw)?);
            }
            Err(StoreError::EmptyRange { .. }) => {}
            Err(err) => return Err(err),
        }
        debug!(channel, start, ?stop, records = records.len(), "stitching continuous wave");

        wave::stitch(&records, Some(start), stop).map_err(|source| StoreError::Wave { channel, source })
    }

    /// Follow waveforms as they are appended, in insertion order, skipping
    /// those that do not match `filter`. The time window is checked per row.
    pub fn tail(
        &self,
        options: TailOptions,
        filter: &ReadFilter,
        cancel: CancelToken,
        raw: bool,
    ) -> WaveformTail<'_> {
        let conn = self.handle.conn();
        let time_base = self.time_base;
        let mut cache = ParamCache::waveforms(conn);
        let map: RowMapper<'_, TransientRecord> =
            Box::new(move |row: &Row<'_>| WaveRow::read(row)?.into_record(&mut cache, time_base, raw));
        let mut cond = Conditions::new();
        cond.time_window(
            "Time",
            filter.time_start.map(|s| time_base.to_ticks(s)),
            filter.time_stop.map(|s| time_base.to_ticks(s)),
        );
        cond.in_list("Chan", filter.channels.iter().map(|&c| i64::from(c)));
        cond.in_list("TRAI", filter.ids.iter().copied());
        cond.raw(filter.sql.as_deref());
        let source = SqlSource::new(
            conn,
            StoreKind::Waveforms,
            SELECT,
            "SetID",
            "SetID",
            Some(cond.into_parts()),
            map,
        );
        Tail::new(source, options, cancel)
    }

    /// Store one waveform; a record without TRAI gets the next free one.
    pub fn write(&mut self, record: &TransientRecord) -> Result<TransientId, StoreError> {
        let trais = self.write_all(std::slice::from_ref(record))?;
        trais
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidArgument(format!("{TABLE}: no row written")))
    }

    /// Store several waveforms in one transaction.
    pub fn write_all(&mut self, records: &[TransientRecord]) -> Result<Vec<TransientId>, StoreError> {
        let time_base = self.time_base;
        self.handle.write(|tx| {
            let params = params::load_waveform_params(tx.conn())?;
            records
                .iter()
                .map(|record| insert_record(tx, &params, time_base, record))
                .collect()
        })
    }
}
