// ABOUTME: Features store facade (.trfdb): one row per TRAI with a dynamic set of REAL
// ABOUTME: feature columns, written by upsert and read by TRAI or SQL predicate.

use std::collections::BTreeMap;
use std::path::Path;

use aedb_core::{FeatureRecord, FieldInfo, TransientId};
use rusqlite::{Row, params_from_iter};

use crate::error::StoreError;
use crate::handle::{OpenMode, Store, StoreHandle, StoreKind};
use crate::query::{Conditions, ReadFilter, is_identifier};
use crate::schema::{self, CreateOptions};
use crate::tail::{CancelToken, RowMapper, SqlSource, Tail, TailOptions};
use crate::write::RowValues;

const TABLE: &str = "trf_data";

/// Tail over the features table.
pub type FeatureTail<'a> = Tail<SqlSource<'a, FeatureRecord>>;

fn feature_from_row(row: &Row<'_>) -> Result<FeatureRecord, StoreError> {
    let stmt: &rusqlite::Statement<'_> = row.as_ref();
    let mut record = FeatureRecord::new(row.get(0)?);
    for i in 1..stmt.column_count() {
        let name = stmt.column_name(i)?;
        if let Some(value) = row.get::<_, Option<f64>>(i)? {
            record.features.insert(name.to_string(), value);
        }
    }
    Ok(record)
}

fn conditions(filter: &ReadFilter) -> Result<Conditions, StoreError> {
    if filter.has_time_window() || !filter.channels.is_empty() {
        return Err(StoreError::InvalidArgument(format!(
            "{TABLE}: features can only be filtered by TRAI or SQL predicate"
        )));
    }
    let mut cond = Conditions::new();
    cond.in_list("TRAI", filter.ids.iter().copied());
    cond.raw(filter.sql.as_deref());
    Ok(cond)
}

fn check_names(record: &FeatureRecord) -> Result<(), StoreError> {
    for name in record.features.keys() {
        if !is_identifier(name) || name.eq_ignore_ascii_case("TRAI") {
            return Err(StoreError::InvalidArgument(format!(
                "{TABLE}: {name:?} cannot be used as a feature name"
            )));
        }
    }
    Ok(())
}

/// The features store of a session.
#[derive(Debug)]
pub struct FeatureStore {
    handle: StoreHandle,
}

impl Store for FeatureStore {
    const KIND: StoreKind = StoreKind::Features;

    fn from_handle(handle: StoreHandle) -> Result<Self, StoreError> {
        Ok(Self { handle })
    }

    fn handle(&self) -> &StoreHandle {
        &self.handle
    }
}

impl FeatureStore {
    pub fn create(path: impl AsRef<Path>, options: &CreateOptions) -> Result<Self, StoreError> {
        schema::create(path.as_ref(), StoreKind::Features, options)?;
        Self::open(path, OpenMode::ReadWrite)
    }

    pub fn reference_id(&self) -> Option<&str> {
        self.handle.info().reference_id()
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

    /// Feature column names, in table order.
    pub fn feature_names(&self) -> Result<Vec<String>, StoreError> {
        let mut columns = self.handle.columns()?;
        columns.retain(|c| !c.eq_ignore_ascii_case("TRAI"));
        Ok(columns)
    }

    /// Feature rows in TRAI order.
    ///
    /// Only `ids` (TRAIs) and `sql` apply; features carry neither a time
    /// nor a channel, so those filters are rejected.
    pub fn read(&self, filter: &ReadFilter) -> Result<Vec<FeatureRecord>, StoreError> {
        let cond = conditions(filter)?;

        let sql = format!("SELECT * FROM {TABLE}{} ORDER BY TRAI", cond.where_clause());
        let mut stmt = self.handle.conn().prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(cond.params()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(feature_from_row(row)?);
        }
        Ok(records)
    }

    pub fn get(&self, trai: TransientId) -> Result<FeatureRecord, StoreError> {
        self.read(&ReadFilter::new().id(trai))?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::not_found(TABLE, format!("TRAI {trai}")))
    }

    /// Follow feature rows as they are inserted, by TRAI.
    ///
    /// Rows upserted below the last delivered TRAI are not seen again. The
    /// filter accepts the same TRAI and SQL restrictions as [`FeatureStore::read`].
    pub fn tail(
        &self,
        options: TailOptions,
        filter: &ReadFilter,
        cancel: CancelToken,
    ) -> Result<FeatureTail<'_>, StoreError> {
        let cond = conditions(filter)?;
        let map: RowMapper<'_, FeatureRecord> = Box::new(|row: &Row<'_>| feature_from_row(row));
        let source = SqlSource::new(
            self.handle.conn(),
            StoreKind::Features,
            "SELECT * FROM trf_data",
            "TRAI",
            "TRAI",
            Some(cond.into_parts()),
            map,
        );
        Ok(Tail::new(source, options, cancel))
    }

    /// Insert or update the features of one TRAI. Returns true for a new row.
    pub fn write(&mut self, record: &FeatureRecord) -> Result<bool, StoreError> {
        Ok(self.write_all(std::slice::from_ref(record))? == 1)
    }

    /// Upsert several records in one transaction; new feature names become
    /// columns. Returns the number of new rows.
    pub fn write_all(&mut self, records: &[FeatureRecord]) -> Result<usize, StoreError> {
        for record in records {
            check_names(record)?;
        }
        self.handle.write(|tx| {
            let mut inserted = 0;
            for record in records {
                tx.ensure_real_columns(TABLE, record.features.keys().map(String::as_str))?;
                let row = record
                    .features
                    .iter()
                    .fold(RowValues::new().int("TRAI", record.trai), |row, (name, &value)| {
                        row.real(name.as_str(), value)
                    });
                if tx.upsert(TABLE, "TRAI", row)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    /// Feature values keyed by TRAI, for joining with hits or waveforms.
    pub fn by_trai(&self, filter: &ReadFilter) -> Result<BTreeMap<TransientId, BTreeMap<String, f64>>, StoreError> {
        Ok(self
            .read(filter)?
            .into_iter()
            .map(|record| (record.trai, record.features))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::tail::Follow;

    fn store(dir: &TempDir) -> FeatureStore {
        let options = CreateOptions {
            reference_id: Some("events-file".to_string()),
            ..CreateOptions::default()
        };
        FeatureStore::create(dir.path().join("s.trfdb"), &options).unwrap()
    }

    #[test]
    fn new_feature_names_become_columns() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        assert_eq!(store.reference_id(), Some("events-file"));
        assert!(store.feature_names().unwrap().is_empty());

        assert!(store.write(&FeatureRecord::new(1).with("RA", 12.5)).unwrap());
        assert!(store.write(&FeatureRecord::new(2).with("RA", 3.0).with("PeakFreq", 150e3)).unwrap());
        assert_eq!(store.feature_names().unwrap(), vec!["RA", "PeakFreq"]);

        let first = store.get(1).unwrap();
        assert_eq!(first.features, BTreeMap::from([("RA".to_string(), 12.5)]));
        assert_eq!(store.get(2).unwrap().features["PeakFreq"], 150e3);
        assert_eq!(store.rows(), 2);
        assert_eq!(store.global_info().trai(), Some(2));
    }

    #[test]
    fn upsert_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.write(&FeatureRecord::new(4).with("RA", 1.0).with("Counts", 3.0)).unwrap();
        assert!(!store.write(&FeatureRecord::new(4).with("RA", 2.0)).unwrap());

        let record = store.get(4).unwrap();
        assert_eq!(record.features["RA"], 2.0);
        assert_eq!(record.features["Counts"], 3.0);
        assert_eq!(store.rows(), 1);
    }

    #[test]
    fn batch_counts_only_new_rows() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.write(&FeatureRecord::new(1).with("RA", 1.0)).unwrap();
        let inserted = store
            .write_all(&[
                FeatureRecord::new(1).with("RA", 5.0),
                FeatureRecord::new(2).with("RA", 6.0),
                FeatureRecord::new(3).with("RA", 7.0),
            ])
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.rows(), 3);
        assert_eq!(store.read(&ReadFilter::new()).unwrap().len(), 3);
    }

    #[test]
    fn bad_feature_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        for name in ["trai", "Peak Freq", "1x", "a;b"] {
            let err = store.write(&FeatureRecord::new(1).with(name, 1.0)).unwrap_err();
            assert!(matches!(err, StoreError::InvalidArgument(_)), "{name}");
        }
        assert_eq!(store.rows(), 0);
    }

    #[test]
    fn reads_filter_by_trai_and_sql_only() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store
            .write_all(&(1..=5).map(|t| FeatureRecord::new(t).with("RA", t as f64 * 10.0)).collect::<Vec<_>>())
            .unwrap();

        let picked = store.read(&ReadFilter::new().ids([2, 4])).unwrap();
        assert_eq!(picked.iter().map(|r| r.trai).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(store.read(&ReadFilter::new().sql("RA >= 30")).unwrap().len(), 3);
        assert_eq!(store.by_trai(&ReadFilter::new()).unwrap()[&5]["RA"], 50.0);

        assert!(matches!(
            store.read(&ReadFilter::new().channel(1)).unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        assert!(matches!(
            store.read(&ReadFilter::new().time(Some(0.0), None)).unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        assert!(matches!(store.get(9).unwrap_err(), StoreError::NotFound { .. }));
    }

    #[test]
    fn tail_delivers_existing_rows_in_trai_order() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store
            .write_all(&[FeatureRecord::new(3).with("RA", 3.0), FeatureRecord::new(1).with("RA", 1.0)])
            .unwrap();

        let options = TailOptions::default().from_start().follow(Follow::UntilExhausted);
        let trais: Vec<_> = store
            .tail(options.clone(), &ReadFilter::new(), CancelToken::new())
            .unwrap()
            .map(|r| r.unwrap().trai)
            .collect();
        assert_eq!(trais, vec![1, 3]);

        let filtered: Vec<_> = store
            .tail(options.clone(), &ReadFilter::new().sql("RA > 2"), CancelToken::new())
            .unwrap()
            .map(|r| r.unwrap().trai)
            .collect();
        assert_eq!(filtered, vec![3]);
        assert!(matches!(
            store.tail(options, &ReadFilter::new().channel(1), CancelToken::new()),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
