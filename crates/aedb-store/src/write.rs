// ABOUTME: Transactional write path: atomic appends and upserts in one IMMEDIATE transaction,
// ABOUTME: with ValidSets and TRAI counters updated before the same commit.

use aedb_core::info::keys;
use aedb_core::{GlobalInfo, RowId, TimeTick};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter};
use tracing::debug;

use crate::error::StoreError;
use crate::handle::StoreKind;
use crate::query::is_identifier;
use crate::schema;

/// Column values of one row to insert or update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowValues {
    columns: Vec<(String, Value)>,
}

impl RowValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.columns.push((column.into(), value));
        self
    }

    pub fn int(self, column: impl Into<String>, value: i64) -> Self {
        self.value(column, Value::Integer(value))
    }

    pub fn real(self, column: impl Into<String>, value: f64) -> Self {
        self.value(column, Value::Real(value))
    }

    pub fn text(self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.value(column, Value::Text(value.into()))
    }

    pub fn blob(self, column: impl Into<String>, value: Vec<u8>) -> Self {
        self.value(column, Value::Blob(value))
    }

    pub fn opt_int(self, column: impl Into<String>, value: Option<i64>) -> Self {
        self.value(column, value.map_or(Value::Null, Value::Integer))
    }

    pub fn opt_real(self, column: impl Into<String>, value: Option<f64>) -> Self {
        self.value(column, value.map_or(Value::Null, Value::Real))
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(c, _)| c.as_str())
    }

    fn int_of(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(Value::Integer(v)) => Some(*v),
            _ => None,
        }
    }
}

fn check_identifiers(table: &str, row: &RowValues) -> Result<(), StoreError> {
    for column in row.columns() {
        if !is_identifier(column) {
            return Err(StoreError::InvalidArgument(format!(
                "{table}: {column:?} is not a valid column name"
            )));
        }
    }
    Ok(())
}

/// An open write transaction. Obtain one through [`write_transaction`].
pub struct WriteTx<'c> {
    tx: Transaction<'c>,
    kind: StoreKind,
    table: &'static str,
    inserted: i64,
    max_trai: Option<i64>,
}

impl<'c> WriteTx<'c> {
    fn new(tx: Transaction<'c>, kind: StoreKind) -> Self {
        Self {
            tx,
            kind,
            table: kind.data_table(),
            inserted: 0,
            max_trai: None,
        }
    }

    /// Read access inside the transaction.
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    fn track(&mut self, table: &str, row: &RowValues) {
        if table != self.kind.data_table() {
            return;
        }
        self.inserted += 1;
        if self.kind != StoreKind::Events {
            if let Some(trai) = row.int_of("TRAI") {
                self.max_trai = Some(self.max_trai.map_or(trai, |m| m.max(trai)));
            }
        }
    }

    fn insert(&mut self, table: &'static str, row: &RowValues) -> Result<RowId, StoreError> {
        self.table = table;
        check_identifiers(table, row)?;
        let columns: Vec<&str> = row.columns().collect();
        let marks = vec!["?"; columns.len()].join(", ");
        let sql = format!("INSERT INTO {table} ({}) VALUES ({marks})", columns.join(", "));

        let mut stmt = self.tx.prepare_cached(&sql)?;
        stmt.execute(params_from_iter(row.columns.iter().map(|(_, v)| v)))?;
        drop(stmt);
        self.track(table, row);
        Ok(self.tx.last_insert_rowid())
    }

    /// Insert rows, returning their assigned RowIds in order.
    pub fn append(
        &mut self,
        table: &'static str,
        rows: impl IntoIterator<Item = RowValues>,
    ) -> Result<Vec<RowId>, StoreError> {
        let mut ids = Vec::new();
        for row in rows {
            ids.push(self.insert(table, &row)?);
        }
        Ok(ids)
    }

    /// Insert a single row into `table`.
    pub fn append_one(&mut self, table: &'static str, row: RowValues) -> Result<RowId, StoreError> {
        self.insert(table, &row)
    }

    /// Insert a row into a side table (e.g. markers). Not counted in ValidSets.
    pub fn insert_child(&mut self, table: &'static str, row: RowValues) -> Result<RowId, StoreError> {
        if table == self.kind.data_table() {
            return Err(StoreError::InvalidArgument(format!(
                "{table} is the main table; use append"
            )));
        }
        self.insert(table, &row)
    }

    /// Insert `row`, or update the existing row with the same `key` value.
    /// Returns true if a new row was inserted.
    pub fn upsert(&mut self, table: &'static str, key: &str, row: RowValues) -> Result<bool, StoreError> {
        self.table = table;
        check_identifiers(table, &row)?;
        let key_value = row
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::InvalidArgument(format!("{table}: upsert row has no {key}")))?;

        let exists = self
            .tx
            .query_row(
                &format!("SELECT 1 FROM {table} WHERE {key} = ?1"),
                params![key_value],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if !exists {
            self.insert(table, &row)?;
            return Ok(true);
        }

        let updates: Vec<&(String, Value)> = row.columns.iter().filter(|(c, _)| c != key).collect();
        if !updates.is_empty() {
            let assignments: Vec<String> = updates.iter().map(|(c, _)| format!("{c} = ?")).collect();
            let sql = format!("UPDATE {table} SET {} WHERE {key} = ?", assignments.join(", "));
            let values = updates.iter().map(|(_, v)| v).chain(std::iter::once(&key_value));
            self.tx.prepare_cached(&sql)?.execute(params_from_iter(values))?;
        }
        Ok(false)
    }

    /// Add a REAL column for every name the table does not have yet.
    pub fn ensure_real_columns<'n>(
        &mut self,
        table: &'static str,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<Vec<String>, StoreError> {
        self.table = table;
        let existing = schema::column_names(&self.tx, table)?;
        let mut added: Vec<String> = Vec::new();
        for name in names {
            if existing.iter().chain(&added).any(|c| c.eq_ignore_ascii_case(name)) {
                continue;
            }
            if !is_identifier(name) {
                return Err(StoreError::InvalidArgument(format!(
                    "{table}: {name:?} is not a valid column name"
                )));
            }
            self.tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {name} REAL;"))?;
            debug!(table, column = name, "added column");
            added.push(name.to_string());
        }
        Ok(added)
    }

    /// Row with the highest `key`, as `(key, time)`.
    pub fn last_row(&self, table: &str, key: &str, time: &str) -> Result<Option<(i64, TimeTick)>, StoreError> {
        Ok(self
            .tx
            .query_row(
                &format!("SELECT {key}, {time} FROM {table} ORDER BY {key} DESC LIMIT 1"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Closest rows below and above `key`, as `(key, time)`.
    pub fn neighbours(
        &self,
        table: &str,
        key_column: &str,
        time: &str,
        key: i64,
    ) -> Result<(Option<(i64, TimeTick)>, Option<(i64, TimeTick)>), StoreError> {
        let below = self
            .tx
            .query_row(
                &format!("SELECT {key_column}, {time} FROM {table} WHERE {key_column} < ?1 ORDER BY {key_column} DESC LIMIT 1"),
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let above = self
            .tx
            .query_row(
                &format!("SELECT {key_column}, {time} FROM {table} WHERE {key_column} > ?1 ORDER BY {key_column} ASC LIMIT 1"),
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok((below, above))
    }

    pub fn exists(&self, table: &str, key: &str, value: i64) -> Result<bool, StoreError> {
        Ok(self
            .tx
            .query_row(&format!("SELECT 1 FROM {table} WHERE {key} = ?1"), params![value], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn max_key(&self, table: &str, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .tx
            .query_row(&format!("SELECT MAX({key}) FROM {table}"), [], |row| row.get(0))?)
    }

    /// Update counters from what was written, commit, and return the new GlobalInfo.
    fn finish(self) -> Result<GlobalInfo, StoreError> {
        let kind = self.kind;
        let current = schema::read_global_info(&self.tx, kind)?;

        if self.inserted > 0 {
            let valid_sets = current.valid_sets() + self.inserted;
            schema::set_global(&self.tx, kind, keys::VALID_SETS, &valid_sets.to_string())?;
        }
        if let Some(max_trai) = self.max_trai {
            let trai = current.trai().unwrap_or(0).max(max_trai);
            schema::set_global(&self.tx, kind, keys::TRAI, &trai.to_string())?;
        }

        let info = schema::read_global_info(&self.tx, kind)?;
        self.tx.commit()?;
        debug!(?kind, inserted = self.inserted, valid_sets = info.valid_sets(), "committed write");
        Ok(info)
    }
}

fn failed(table: &str, source: StoreError) -> StoreError {
    match source {
        already @ StoreError::WriteFailed { .. } => already,
        source => StoreError::WriteFailed {
            table: table.to_string(),
            source: Box::new(source),
        },
    }
}

/// Run `f` in one IMMEDIATE transaction.
///
/// On success the counters are updated in the same transaction, it is
/// committed and the committed GlobalInfo is returned. Any error rolls
/// everything back and surfaces as `WriteFailed` naming the table that
/// was being written.
pub fn write_transaction<T>(
    conn: &mut Connection,
    kind: StoreKind,
    f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, StoreError>,
) -> Result<(T, GlobalInfo), StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| failed(kind.data_table(), e.into()))?;
    let mut wtx = WriteTx::new(tx, kind);

    let value = match f(&mut wtx) {
        Ok(value) => value,
        Err(err) => {
            let table = wtx.table;
            // dropping the transaction rolls it back
            drop(wtx);
            return Err(failed(table, err));
        }
    };
    let table = wtx.table;
    let info = wtx.finish().map_err(|e| failed(table, e))?;
    Ok((value, info))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::schema::{CreateOptions, create};

    fn features(dir: &TempDir) -> Connection {
        let path = dir.path().join("w.trfdb");
        create(&path, StoreKind::Features, &CreateOptions::default()).unwrap();
        Connection::open(&path).unwrap()
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn counters_follow_committed_rows() {
        let dir = TempDir::new().unwrap();
        let mut conn = features(&dir);

        let (inserted, info) = write_transaction(&mut conn, StoreKind::Features, |tx| {
            tx.ensure_real_columns("trf_data", ["RA"])?;
            let a = tx.upsert("trf_data", "TRAI", RowValues::new().int("TRAI", 3).real("RA", 1.0))?;
            let b = tx.upsert("trf_data", "TRAI", RowValues::new().int("TRAI", 8).real("RA", 2.0))?;
            let c = tx.upsert("trf_data", "TRAI", RowValues::new().int("TRAI", 3).real("RA", 5.0))?;
            Ok([a, b, c])
        })
        .unwrap();

        assert_eq!(inserted, [true, true, false]);
        assert_eq!(info.valid_sets(), 2);
        assert_eq!(info.valid_sets(), count(&conn, "trf_data"));
        assert_eq!(info.trai(), Some(8));

        let ra: f64 = conn
            .query_row("SELECT RA FROM trf_data WHERE TRAI = 3", [], |r| r.get(0))
            .unwrap();
        assert_eq!(ra, 5.0);
    }

    #[test]
    fn failure_rolls_back_everything() {
        let dir = TempDir::new().unwrap();
        let mut conn = features(&dir);

        let err = write_transaction(&mut conn, StoreKind::Features, |tx| {
            tx.append("trf_data", [RowValues::new().int("TRAI", 1)])?;
            tx.append("trf_data", [RowValues::new().int("TRAI", 1)])?;
            Ok(())
        })
        .unwrap_err();

        match &err {
            StoreError::WriteFailed { table, source } => {
                assert_eq!(table, "trf_data");
                assert!(matches!(**source, StoreError::Sqlite(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(count(&conn, "trf_data"), 0);
        let info = schema::read_global_info(&conn, StoreKind::Features).unwrap();
        assert_eq!(info.valid_sets(), 0);
    }

    #[test]
    fn append_returns_increasing_row_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.pridb");
        create(&path, StoreKind::Events, &CreateOptions::default()).unwrap();
        let mut conn = Connection::open(&path).unwrap();

        let rows = (0..3).map(|t| RowValues::new().int("SetType", 2).int("Time", t * 10));
        let (ids, info) = write_transaction(&mut conn, StoreKind::Events, |tx| tx.append("ae_data", rows)).unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(info.valid_sets(), 3);

        let (child, info) = write_transaction(&mut conn, StoreKind::Events, |tx| {
            tx.insert_child("ae_markers", RowValues::new().int("SetID", 2).text("Data", "note"))
        })
        .unwrap();
        assert_eq!(child, 2);
        assert_eq!(info.valid_sets(), 3);
    }

    #[test]
    fn bad_column_names_are_rejected_before_sql() {
        let dir = TempDir::new().unwrap();
        let mut conn = features(&dir);
        let err = write_transaction(&mut conn, StoreKind::Features, |tx| {
            tx.ensure_real_columns("trf_data", ["ok", "no way"])
        })
        .unwrap_err();
        assert!(matches!(err.root_cause(), StoreError::InvalidArgument(_)));

        // the column added before the failure was rolled back too
        let columns = schema::column_names(&conn, "trf_data").unwrap();
        assert_eq!(columns, vec!["TRAI"]);
    }

    #[test]
    fn neighbours_and_last_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n.pridb");
        create(&path, StoreKind::Events, &CreateOptions::default()).unwrap();
        let mut conn = Connection::open(&path).unwrap();

        write_transaction(&mut conn, StoreKind::Events, |tx| {
            tx.append(
                "ae_data",
                [10, 20, 30].map(|t| RowValues::new().int("SetType", 2).int("Time", t)),
            )?;
            assert_eq!(tx.last_row("ae_data", "SetID", "Time")?, Some((3, 30)));
            assert_eq!(
                tx.neighbours("ae_data", "SetID", "Time", 2)?,
                (Some((1, 10)), Some((3, 30)))
            );
            assert!(tx.exists("ae_data", "SetID", 3)?);
            assert_eq!(tx.max_key("ae_data", "SetID")?, Some(3));
            Ok(())
        })
        .unwrap();
    }
}
