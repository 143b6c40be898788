// ABOUTME: Events store facade (.pridb): hits, markers, status and parametric sets in one
// ABOUTME: time-sorted table, scaled to physical units through the channel parameters.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use aedb_core::scaling::{EventScaling, RawHit, RawStatus};
use aedb_core::time::is_monotonic;
use aedb_core::{
    ChannelId, EventParams, EventRecord, FieldInfo, HitRecord, MarkerKind, MarkerRecord, ParamId,
    ParametricRecord, RowId, SetType, StatusRecord, TimeBase, TimeTick,
};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use crate::error::StoreError;
use crate::handle::{OpenMode, Store, StoreHandle, StoreKind};
use crate::params::{self, ParamCache};
use crate::query::{Conditions, ReadFilter};
use crate::range::{self, EVENTS_INDEX, KeyRange};
use crate::schema::{self, CreateOptions};
use crate::tail::{CancelToken, RowMapper, SqlSource, Tail, TailOptions};
use crate::write::RowValues;

const SELECT: &str = "SELECT d.SetID, d.SetType, d.Time, d.Chan, d.Status, d.ParamID, \
    d.Thr, d.Amp, d.RiseT, d.Dur, d.Eny, d.SS, d.RMS, d.Counts, d.TRAI, \
    d.CHits, d.CCnt, d.CEny, d.CSS, d.PCTD, d.PCTA, \
    d.PA0, d.PA1, d.PA2, d.PA3, d.PA4, d.PA5, d.PA6, d.PA7, m.Number, m.Data \
    FROM ae_data d LEFT JOIN ae_markers m ON m.SetID = d.SetID";

const KNOWN_SET_TYPES: &str = "d.SetType BETWEEN 1 AND 6";

/// Tail over the events table.
pub type EventTail<'a> = Tail<SqlSource<'a, EventRecord>>;

/// One joined events/markers row as stored.
struct EventRow {
    set_id: RowId,
    set_type: i64,
    time: TimeTick,
    chan: Option<i64>,
    param_id: Option<ParamId>,
    thr: Option<i64>,
    amp: Option<i64>,
    rise_t: Option<i64>,
    dur: Option<i64>,
    eny: Option<i64>,
    ss: Option<i64>,
    rms: Option<i64>,
    counts: Option<i64>,
    trai: Option<i64>,
    c_hits: Option<i64>,
    c_cnt: Option<i64>,
    c_eny: Option<i64>,
    c_ss: Option<i64>,
    pctd: Option<i64>,
    pcta: Option<i64>,
    pa: [Option<i64>; 8],
    number: Option<i64>,
    data: Option<String>,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut pa = [None; 8];
        for (i, slot) in pa.iter_mut().enumerate() {
            *slot = row.get(21 + i)?;
        }
        Ok(Self {
            set_id: row.get(0)?,
            set_type: row.get(1)?,
            time: row.get(2)?,
            chan: row.get(3)?,
            param_id: row.get(5)?,
            thr: row.get(6)?,
            amp: row.get(7)?,
            rise_t: row.get(8)?,
            dur: row.get(9)?,
            eny: row.get(10)?,
            ss: row.get(11)?,
            rms: row.get(12)?,
            counts: row.get(13)?,
            trai: row.get(14)?,
            c_hits: row.get(15)?,
            c_cnt: row.get(16)?,
            c_eny: row.get(17)?,
            c_ss: row.get(18)?,
            pctd: row.get(19)?,
            pcta: row.get(20)?,
            pa,
            number: row.get(29)?,
            data: row.get(30)?,
        })
    }

    fn channel(&self) -> Result<ChannelId, StoreError> {
        let chan = self.chan.unwrap_or(0);
        ChannelId::try_from(chan).map_err(|_| {
            StoreError::InvalidArgument(format!("ae_data: SetID {} has channel {chan}", self.set_id))
        })
    }

    fn into_record(
        self,
        params: &mut ParamCache<'_, EventParams>,
        time_base: TimeBase,
    ) -> Result<EventRecord, StoreError> {
        let set_type = SetType::from_code(self.set_type).ok_or_else(|| {
            StoreError::InvalidArgument(format!("ae_data: SetID {} has SetType {}", self.set_id, self.set_type))
        })?;

        let record = match set_type {
            SetType::Hit => {
                let raw = RawHit {
                    set_id: Some(self.set_id),
                    time: self.time,
                    channel: self.channel()?,
                    param_id: self.param_id.unwrap_or_default(),
                    thr: self.thr,
                    amp: self.amp.unwrap_or(0),
                    rise_t: self.rise_t,
                    dur: self.dur.unwrap_or(0),
                    eny: self.eny.unwrap_or(0),
                    ss: self.ss,
                    rms: self.rms.unwrap_or(0),
                    counts: self.counts,
                    trai: self.trai,
                    c_hits: self.c_hits,
                    c_cnt: self.c_cnt,
                    c_eny: self.c_eny,
                    c_ss: self.c_ss,
                };
                let p = params.get(self.param_id)?;
                EventRecord::Hit(EventScaling::new(p, time_base).hit_from_raw(&raw))
            }
            SetType::Status => {
                let raw = RawStatus {
                    set_id: Some(self.set_id),
                    time: self.time,
                    channel: self.channel()?,
                    param_id: self.param_id.unwrap_or_default(),
                    thr: self.thr,
                    eny: self.eny.unwrap_or(0),
                    ss: self.ss,
                    rms: self.rms.unwrap_or(0),
                };
                let p = params.get(self.param_id)?;
                EventRecord::Status(EventScaling::new(p, time_base).status_from_raw(&raw))
            }
            SetType::Parametric => EventRecord::Parametric(ParametricRecord {
                set_id: Some(self.set_id),
                time: time_base.to_seconds(self.time),
                param_id: self.param_id.unwrap_or_default(),
                pctd: self.pctd,
                pcta: self.pcta,
                pa: self.pa,
            }),
            SetType::Label | SetType::DateTime | SetType::SectionStart => {
                EventRecord::Marker(MarkerRecord {
                    set_id: Some(self.set_id),
                    time: time_base.to_seconds(self.time),
                    kind: MarkerKind::from_set_type(set_type).unwrap_or_default(),
                    number: self.number,
                    data: self.data.unwrap_or_default(),
                })
            }
        };
        Ok(record)
    }
}

fn missing_params(id: ParamId) -> StoreError {
    StoreError::not_found("ae_params", format!("ID {id}"))
}

/// Row values for one record, plus the markers row if it is a marker.
fn event_row(
    record: &EventRecord,
    params: &BTreeMap<ParamId, EventParams>,
    time_base: TimeBase,
) -> Result<(TimeTick, RowValues, Option<RowValues>), StoreError> {
    let base = RowValues::new().int("SetType", record.set_type().code());
    let out = match record {
        EventRecord::Hit(hit) => {
            let p = params.get(&hit.param_id).ok_or_else(|| missing_params(hit.param_id))?;
            let raw = EventScaling::new(p, time_base).hit_to_raw(hit);
            let row = base
                .int("Time", raw.time)
                .int("Chan", i64::from(raw.channel))
                .int("Status", 0)
                .int("ParamID", raw.param_id)
                .opt_int("Thr", raw.thr)
                .int("Amp", raw.amp)
                .opt_int("RiseT", raw.rise_t)
                .int("Dur", raw.dur)
                .int("Eny", raw.eny)
                .opt_int("SS", raw.ss)
                .int("RMS", raw.rms)
                .opt_int("Counts", raw.counts)
                .opt_int("TRAI", raw.trai)
                .opt_int("CHits", raw.c_hits)
                .opt_int("CCnt", raw.c_cnt)
                .opt_int("CEny", raw.c_eny)
                .opt_int("CSS", raw.c_ss);
            (raw.time, row, None)
        }
        EventRecord::Status(status) => {
            let p = params
                .get(&status.param_id)
                .ok_or_else(|| missing_params(status.param_id))?;
            let raw = EventScaling::new(p, time_base).status_to_raw(status);
            let row = base
                .int("Time", raw.time)
                .int("Chan", i64::from(raw.channel))
                .int("Status", 0)
                .int("ParamID", raw.param_id)
                .opt_int("Thr", raw.thr)
                .int("Eny", raw.eny)
                .opt_int("SS", raw.ss)
                .int("RMS", raw.rms);
            (raw.time, row, None)
        }
        EventRecord::Parametric(parametric) => {
            let time = time_base.to_ticks(parametric.time);
            let mut row = base
                .int("Time", time)
                .int("ParamID", parametric.param_id)
                .opt_int("PCTD", parametric.pctd)
                .opt_int("PCTA", parametric.pcta);
            for (i, value) in parametric.pa.iter().enumerate() {
                row = row.opt_int(format!("PA{i}"), *value);
            }
            (time, row, None)
        }
        EventRecord::Marker(marker) => {
            let time = time_base.to_ticks(marker.time);
            let row = base.int("Time", time);
            let child = RowValues::new()
                .opt_int("Number", marker.number)
                .text("Data", marker.data.clone());
            (time, row, Some(child))
        }
    };
    Ok(out)
}

/// The events store of a session.
#[derive(Debug)]
pub struct EventStore {
    handle: StoreHandle,
    time_base: TimeBase,
}

impl Store for EventStore {
    const KIND: StoreKind = StoreKind::Events;

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

impl EventStore {
    /// Create a new events store and open it for writing.
    pub fn create(path: impl AsRef<Path>, options: &CreateOptions) -> Result<Self, StoreError> {
        schema::create(path.as_ref(), StoreKind::Events, options)?;
        Self::open(path, OpenMode::ReadWrite)
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    /// Session identifier that waveform and feature stores refer back to.
    pub fn file_id(&self) -> Option<&str> {
        self.handle.info().file_id()
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

    pub fn params(&self) -> Result<BTreeMap<ParamId, EventParams>, StoreError> {
        params::load_event_params(self.handle.conn())
    }

    /// Insert or replace one channel parameter row.
    pub fn write_params(&mut self, params: &EventParams) -> Result<(), StoreError> {
        let row = params::event_params_row(params);
        self.handle.write(|tx| tx.upsert("ae_params", "ID", row))?;
        Ok(())
    }

    /// SetID bounds of the rows in `[start, stop]` seconds.
    pub fn find_range(&self, start: Option<f64>, stop: Option<f64>) -> Result<KeyRange, StoreError> {
        range::find_range(
            self.handle.conn(),
            &EVENTS_INDEX,
            start.map(|s| self.time_base.to_ticks(s)),
            stop.map(|s| self.time_base.to_ticks(s)),
        )
    }

    fn query(&self, filter: &ReadFilter, set_types: &[SetType], by_channel: bool) -> Result<Vec<EventRecord>, StoreError> {
        let mut cond = Conditions::new();
        if filter.has_time_window() {
            match self.find_range(filter.time_start, filter.time_stop) {
                Ok(range) => cond.between("d.SetID", range.low, range.high),
                Err(StoreError::EmptyRange { .. }) => return Ok(Vec::new()),
                Err(err) => return Err(err),
            }
        }
        if set_types.is_empty() {
            cond.push(KNOWN_SET_TYPES, std::iter::empty::<Value>());
        } else {
            cond.in_list("d.SetType", set_types.iter().map(|t| t.code()));
        }
        if by_channel {
            cond.in_list("d.Chan", filter.channels.iter().map(|&c| i64::from(c)));
        }
        cond.in_list("d.SetID", filter.ids.iter().copied());
        cond.raw(filter.sql.as_deref());

        let conn = self.handle.conn();
        let sql = format!("{SELECT}{} ORDER BY d.SetID", cond.where_clause());
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(cond.params()))?;
        let mut cache = ParamCache::events(conn);

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(EventRow::read(row)?.into_record(&mut cache, self.time_base)?);
        }
        Ok(records)
    }

    /// All event rows matching `filter`, in SetID order.
    pub fn read(&self, filter: &ReadFilter) -> Result<Vec<EventRecord>, StoreError> {
        self.query(filter, &[], true)
    }

    pub fn read_hits(&self, filter: &ReadFilter) -> Result<Vec<HitRecord>, StoreError> {
        Ok(self
            .query(filter, &[SetType::Hit], true)?
            .into_iter()
            .filter_map(|r| match r {
                EventRecord::Hit(hit) => Some(hit),
                _ => None,
            })
            .collect())
    }

    /// Markers carry no channel; `filter.channels` is ignored.
    pub fn read_markers(&self, filter: &ReadFilter) -> Result<Vec<MarkerRecord>, StoreError> {
        let types = [SetType::Label, SetType::DateTime, SetType::SectionStart];
        Ok(self
            .query(filter, &types, false)?
            .into_iter()
            .filter_map(|r| match r {
                EventRecord::Marker(marker) => Some(marker),
                _ => None,
            })
            .collect())
    }

    pub fn read_status(&self, filter: &ReadFilter) -> Result<Vec<StatusRecord>, StoreError> {
        Ok(self
            .query(filter, &[SetType::Status], true)?
            .into_iter()
            .filter_map(|r| match r {
                EventRecord::Status(status) => Some(status),
                _ => None,
            })
            .collect())
    }

    /// Parametric sets carry no channel; `filter.channels` is ignored.
    pub fn read_parametric(&self, filter: &ReadFilter) -> Result<Vec<ParametricRecord>, StoreError> {
        Ok(self
            .query(filter, &[SetType::Parametric], false)?
            .into_iter()
            .filter_map(|r| match r {
                EventRecord::Parametric(p) => Some(p),
                _ => None,
            })
            .collect())
    }

    /// Point lookup by SetID.
    pub fn get(&self, set_id: RowId) -> Result<EventRecord, StoreError> {
        self.query(&ReadFilter::new().id(set_id), &[], false)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found("ae_data", format!("SetID {set_id}")))
    }

    fn tail_conditions(&self, filter: &ReadFilter) -> Conditions {
        let mut cond = Conditions::new();
        cond.push(KNOWN_SET_TYPES, std::iter::empty::<Value>());
        cond.time_window(
            "d.Time",
            filter.time_start.map(|s| self.time_base.to_ticks(s)),
            filter.time_stop.map(|s| self.time_base.to_ticks(s)),
        );
        cond.in_list("d.Chan", filter.channels.iter().map(|&c| i64::from(c)));
        cond.in_list("d.SetID", filter.ids.iter().copied());
        cond.raw(filter.sql.as_deref());
        cond
    }

    /// Follow rows as they are appended, in SetID order.
    ///
    /// Rows not matching `filter` are skipped. A time window is checked
    /// against each row's `Time`, and a channel list drops markers and
    /// parametric sets as [`EventStore::read`] does.
    pub fn tail(&self, options: TailOptions, filter: &ReadFilter, cancel: CancelToken) -> EventTail<'_> {
        let conn = self.handle.conn();
        let time_base = self.time_base;
        let mut cache = ParamCache::events(conn);
        let map: RowMapper<'_, EventRecord> =
            Box::new(move |row: &Row<'_>| EventRow::read(row)?.into_record(&mut cache, time_base));
        let source = SqlSource::new(
            conn,
            StoreKind::Events,
            SELECT,
            "d.SetID",
            "SetID",
            Some(self.tail_conditions(filter).into_parts()),
            map,
        );
        Tail::new(source, options, cancel)
    }

    /// Append records of any kind in one transaction.
    ///
    /// Times must not go back by more than one tick, relative to the last
    /// stored row and within the batch.
    pub fn write(&mut self, records: &[EventRecord]) -> Result<Vec<RowId>, StoreError> {
        let time_base = self.time_base;
        self.handle.write(|tx| {
            let params = params::load_event_params(tx.conn())?;
            let mut previous = tx.last_row("ae_data", "SetID", "Time")?;
            let mut ids = Vec::with_capacity(records.len());

            for record in records {
                let (time, row, marker) = event_row(record, &params, time_base)?;
                if let Some((key, prev)) = previous {
                    if !is_monotonic(prev, time) {
                        return Err(StoreError::NotMonotonic {
                            table: "ae_data".to_string(),
                            key,
                            previous: prev,
                            time,
                        });
                    }
                }

                let id = tx.append_one("ae_data", row)?;
                if let Some(marker) = marker {
                    tx.insert_child("ae_markers", marker.int("SetID", id))?;
                }
                let latest = previous.map_or(time, |(_, prev)| prev.max(time));
                previous = Some((id, latest));
                ids.push(id);
            }
            Ok(ids)
        })
    }

    pub fn write_hit(&mut self, hit: &HitRecord) -> Result<RowId, StoreError> {
        self.write_one(EventRecord::Hit(hit.clone()))
    }

    pub fn write_hits(&mut self, hits: &[HitRecord]) -> Result<Vec<RowId>, StoreError> {
        let records: Vec<EventRecord> = hits.iter().cloned().map(EventRecord::Hit).collect();
        self.write(&records)
    }

    pub fn write_status(&mut self, status: &StatusRecord) -> Result<RowId, StoreError> {
        self.write_one(EventRecord::Status(status.clone()))
    }

    pub fn write_parametric(&mut self, parametric: &ParametricRecord) -> Result<RowId, StoreError> {
        self.write_one(EventRecord::Parametric(parametric.clone()))
    }

    pub fn write_marker(&mut self, marker: &MarkerRecord) -> Result<RowId, StoreError> {
        self.write_one(EventRecord::Marker(marker.clone()))
    }

    fn write_one(&mut self, record: EventRecord) -> Result<RowId, StoreError> {
        let table = record.set_type();
        self.write(std::slice::from_ref(&record))?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidArgument(format!("no row written for {table:?}")))
    }

    /// Replace the number and text of an existing marker. Returns true if the
    /// marker had no markers row yet.
    pub fn upsert_marker(&mut self, set_id: RowId, number: Option<i64>, data: &str) -> Result<bool, StoreError> {
        let row = RowValues::new()
            .int("SetID", set_id)
            .opt_int("Number", number)
            .text("Data", data);
        self.handle.write(|tx| {
            let set_type: Option<i64> = tx
                .conn()
                .query_row("SELECT SetType FROM ae_data WHERE SetID = ?1", params![set_id], |r| r.get(0))
                .optional()?;
            let is_marker = set_type
                .and_then(SetType::from_code)
                .and_then(MarkerKind::from_set_type)
                .is_some();
            if !is_marker {
                return Err(StoreError::not_found("ae_data", format!("marker SetID {set_id}")));
            }
            tx.upsert("ae_markers", "SetID", row)
        })
    }
}
