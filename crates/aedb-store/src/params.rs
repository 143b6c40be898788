// ABOUTME: Channel parameter tables (ae_params, tr_params): load, upsert rows, and a small
// ABOUTME: cache that reloads when a row references a parameter ID it has not seen yet.

use std::collections::BTreeMap;

use aedb_core::{ChannelId, EventParams, ParamId, WaveformParams};
use rusqlite::{Connection, Row};

use crate::error::StoreError;
use crate::write::RowValues;

fn channel(value: Option<i64>) -> Option<ChannelId> {
    value.and_then(|v| ChannelId::try_from(v).ok())
}

fn event_params_from_row(row: &Row<'_>) -> rusqlite::Result<EventParams> {
    Ok(EventParams {
        id: row.get(0)?,
        setup_id: row.get(1)?,
        channel: channel(row.get(2)?),
        adc_uv: row.get(3)?,
        adc_te: row.get(4)?,
        adc_ss: row.get(5)?,
    })
}

fn waveform_params_from_row(row: &Row<'_>) -> rusqlite::Result<WaveformParams> {
    Ok(WaveformParams {
        id: row.get(0)?,
        setup_id: row.get(1)?,
        channel: channel(row.get(2)?),
        adc_uv: row.get(3)?,
        tr_mv: row.get(4)?,
    })
}

pub(crate) fn load_event_params(conn: &Connection) -> Result<BTreeMap<ParamId, EventParams>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT ID, SetupID, Chan, ADC_uV, ADC_TE, ADC_SS FROM ae_params")?;
    let rows = stmt.query_map([], event_params_from_row)?;
    let mut params = BTreeMap::new();
    for row in rows {
        let row = row?;
        params.insert(row.id, row);
    }
    Ok(params)
}

pub(crate) fn load_waveform_params(conn: &Connection) -> Result<BTreeMap<ParamId, WaveformParams>, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT ID, SetupID, Chan, ADC_uV, TR_mV FROM tr_params")?;
    let rows = stmt.query_map([], waveform_params_from_row)?;
    let mut params = BTreeMap::new();
    for row in rows {
        let row = row?;
        params.insert(row.id, row);
    }
    Ok(params)
}

pub(crate) fn event_params_row(params: &EventParams) -> RowValues {
    RowValues::new()
        .int("ID", params.id)
        .opt_int("SetupID", params.setup_id)
        .opt_int("Chan", params.channel.map(i64::from))
        .real("ADC_uV", params.adc_uv)
        .real("ADC_TE", params.adc_te)
        .real("ADC_SS", params.adc_ss)
}

pub(crate) fn waveform_params_row(params: &WaveformParams) -> RowValues {
    RowValues::new()
        .int("ID", params.id)
        .opt_int("SetupID", params.setup_id)
        .opt_int("Chan", params.channel.map(i64::from))
        .real("ADC_uV", params.adc_uv)
        .real("TR_mV", params.tr_mv)
}

type Loader<P> = fn(&Connection) -> Result<BTreeMap<ParamId, P>, StoreError>;

/// Parameter rows by ID, reloaded from the table on a miss.
pub(crate) struct ParamCache<'c, P> {
    conn: &'c Connection,
    table: &'static str,
    load: Loader<P>,
    entries: BTreeMap<ParamId, P>,
}

impl<'c> ParamCache<'c, EventParams> {
    pub(crate) fn events(conn: &'c Connection) -> Self {
        Self::new(conn, "ae_params", load_event_params)
    }
}

impl<'c> ParamCache<'c, WaveformParams> {
    pub(crate) fn waveforms(conn: &'c Connection) -> Self {
        Self::new(conn, "tr_params", load_waveform_params)
    }
}

impl<'c, P> ParamCache<'c, P> {
    fn new(conn: &'c Connection, table: &'static str, load: Loader<P>) -> Self {
        Self {
            conn,
            table,
            load,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&mut self, id: Option<ParamId>) -> Result<&P, StoreError> {
        let id = id.ok_or_else(|| StoreError::not_found(self.table, "ID NULL"))?;
        if !self.entries.contains_key(&id) {
            self.entries = (self.load)(self.conn)?;
        }
        self.entries
            .get(&id)
            .ok_or_else(|| StoreError::not_found(self.table, format!("ID {id}")))
    }
}
