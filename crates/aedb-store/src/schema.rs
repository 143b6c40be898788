// ABOUTME: Table layouts of the three store kinds, atomic creation from a template and
// ABOUTME: validation on open (tables, columns, version), including counter repair.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use aedb_core::info::keys;
use aedb_core::{FieldInfo, GlobalInfo, TimeBase};
use chrono::Utc;
use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::handle::{OpenMode, StoreHandle, StoreKind, StoreLocation};

/// The only schema version this engine reads and writes.
pub const SCHEMA_VERSION: i64 = 1;

const EVENTS_SCHEMA: &str = "
    CREATE TABLE ae_data (
        SetID INTEGER PRIMARY KEY AUTOINCREMENT,
        SetType INTEGER NOT NULL,
        Time INTEGER NOT NULL,
        Chan INTEGER,
        Status INTEGER,
        ParamID INTEGER,
        Thr INTEGER,
        Amp INTEGER,
        RiseT INTEGER,
        Dur INTEGER,
        Eny INTEGER,
        SS INTEGER,
        RMS INTEGER,
        Counts INTEGER,
        TRAI INTEGER,
        CHits INTEGER,
        CCnt INTEGER,
        CEny INTEGER,
        CSS INTEGER,
        PCTD INTEGER,
        PCTA INTEGER,
        PA0 INTEGER, PA1 INTEGER, PA2 INTEGER, PA3 INTEGER,
        PA4 INTEGER, PA5 INTEGER, PA6 INTEGER, PA7 INTEGER
    );
    CREATE INDEX ae_data_time ON ae_data (Time);

    CREATE TABLE ae_markers (
        SetID INTEGER PRIMARY KEY,
        Number INTEGER,
        Data TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE ae_params (
        ID INTEGER PRIMARY KEY,
        SetupID INTEGER,
        Chan INTEGER,
        ADC_uV REAL NOT NULL,
        ADC_TE REAL NOT NULL,
        ADC_SS REAL NOT NULL
    );

    CREATE TABLE ae_fieldinfo (
        field TEXT PRIMARY KEY,
        Unit TEXT,
        Parameter TEXT,
        Factor REAL
    );

    CREATE TABLE ae_globalinfo (
        Key TEXT PRIMARY KEY,
        Value TEXT
    );";

const WAVEFORMS_SCHEMA: &str = "
    CREATE TABLE tr_data (
        SetID INTEGER PRIMARY KEY AUTOINCREMENT,
        Time INTEGER NOT NULL,
        Chan INTEGER NOT NULL,
        Status INTEGER,
        ParamID INTEGER NOT NULL,
        Pretrigger INTEGER NOT NULL,
        Thr INTEGER NOT NULL,
        SampleRate INTEGER NOT NULL,
        Samples INTEGER NOT NULL,
        DataFormat INTEGER NOT NULL,
        Data BLOB NOT NULL,
        TRAI INTEGER NOT NULL UNIQUE
    );

    CREATE TABLE tr_params (
        ID INTEGER PRIMARY KEY,
        SetupID INTEGER,
        Chan INTEGER,
        ADC_uV REAL NOT NULL,
        TR_mV REAL NOT NULL
    );

    CREATE TABLE tr_fieldinfo (
        field TEXT PRIMARY KEY,
        Unit TEXT,
        Parameter TEXT,
        Factor REAL
    );

    CREATE TABLE tr_globalinfo (
        Key TEXT PRIMARY KEY,
        Value TEXT
    );";

const FEATURES_SCHEMA: &str = "
    CREATE TABLE trf_data (
        TRAI INTEGER PRIMARY KEY
    );

    CREATE TABLE trf_fieldinfo (
        field TEXT PRIMARY KEY,
        Unit TEXT,
        Parameter TEXT,
        Factor REAL
    );

    CREATE TABLE trf_globalinfo (
        Key TEXT PRIMARY KEY,
        Value TEXT
    );";

impl StoreKind {
    fn schema_sql(self) -> &'static str {
        match self {
            StoreKind::Events => EVENTS_SCHEMA,
            StoreKind::Waveforms => WAVEFORMS_SCHEMA,
            StoreKind::Features => FEATURES_SCHEMA,
        }
    }

    /// Tables that must exist in a store of this kind.
    pub fn required_tables(self) -> Vec<&'static str> {
        let mut tables = vec![self.data_table(), self.fieldinfo_table(), self.globalinfo_table()];
        tables.extend(self.params_table());
        tables.extend(self.markers_table());
        tables
    }

    /// Columns that must exist in the main data table.
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            StoreKind::Events => &[
                "SetID", "SetType", "Time", "Chan", "Status", "ParamID", "Thr", "Amp", "RiseT",
                "Dur", "Eny", "SS", "RMS", "Counts", "TRAI", "CHits", "CCnt", "CEny", "CSS",
                "PCTD", "PCTA", "PA0", "PA1", "PA2", "PA3", "PA4", "PA5", "PA6", "PA7",
            ],
            StoreKind::Waveforms => &[
                "SetID", "Time", "Chan", "Status", "ParamID", "Pretrigger", "Thr", "SampleRate",
                "Samples", "DataFormat", "Data", "TRAI",
            ],
            StoreKind::Features => &["TRAI"],
        }
    }

    fn default_field_info(self) -> Vec<FieldInfo> {
        match self {
            StoreKind::Events => vec![
                FieldInfo::new("Time", "s", Some("TimeBase"), None),
                FieldInfo::new("Thr", "V", Some("ADC_uV"), Some(1e-6)),
                FieldInfo::new("Amp", "V", Some("ADC_uV"), Some(1e-6)),
                FieldInfo::new("RiseT", "s", Some("TimeBase"), None),
                FieldInfo::new("Dur", "s", Some("TimeBase"), None),
                FieldInfo::new("Eny", "eu", Some("ADC_TE"), None),
                FieldInfo::new("SS", "nVs", Some("ADC_SS"), None),
                FieldInfo::new("RMS", "V", Some("ADC_uV"), Some(aedb_core::scaling::RMS_FACTOR * 1e-6)),
            ],
            StoreKind::Waveforms => vec![
                FieldInfo::new("Time", "s", Some("TimeBase"), None),
                FieldInfo::new("Thr", "V", Some("ADC_uV"), Some(1e-6)),
                FieldInfo::new("SampleRate", "Hz", None, None),
                FieldInfo::new("Data", "V", Some("TR_mV"), Some(1e-3)),
            ],
            StoreKind::Features => Vec::new(),
        }
    }
}

/// Options for [`create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Ticks per second; ignored for feature stores.
    pub time_base: TimeBase,
    /// Replace an existing non-empty file.
    pub overwrite: bool,
    /// `FileID` of the events store this one belongs to.
    pub reference_id: Option<String>,
    pub writer_id: Option<String>,
}

fn temp_path(path: &Path, kind: StoreKind) -> PathBuf {
    path.with_extension(format!("{}.tmp", kind.extension()))
}

fn side_files(path: &Path) -> [PathBuf; 2] {
    let base = path.as_os_str().to_owned();
    let mut wal = base.clone();
    wal.push("-wal");
    let mut shm = base;
    shm.push("-shm");
    [PathBuf::from(wal), PathBuf::from(shm)]
}

fn is_non_empty(path: &Path) -> Result<bool, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len() > 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

pub(crate) fn check_extension(path: &Path, kind: StoreKind) -> Result<(), StoreError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    if ext.eq_ignore_ascii_case(kind.extension()) {
        Ok(())
    } else {
        Err(StoreError::SchemaMismatch {
            path: path.to_path_buf(),
            reason: format!("expected a .{} file", kind.extension()),
        })
    }
}

/// Create an empty store of `kind` at `path`.
///
/// The schema is built in a sibling temp file inside one transaction and
/// then renamed over `path`, so a failure never leaves a half-written store.
pub fn create(path: &Path, kind: StoreKind, options: &CreateOptions) -> Result<(), StoreError> {
    check_extension(path, kind)?;
    if is_non_empty(path)? && !options.overwrite {
        return Err(StoreError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }

    let tmp = temp_path(path, kind);
    remove_if_exists(&tmp)?;
    if let Err(err) = build(&tmp, kind, options) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    for side in side_files(path) {
        remove_if_exists(&side)?;
    }
    fs::rename(&tmp, path).map_err(StoreError::io(path))?;

    info!(path = %path.display(), ?kind, time_base = %options.time_base, "created store");
    Ok(())
}

fn build(tmp: &Path, kind: StoreKind, options: &CreateOptions) -> Result<(), StoreError> {
    let mut conn = Connection::open(tmp)?;
    let tx = conn.transaction()?;
    tx.execute_batch(kind.schema_sql())?;

    let mut seed = GlobalInfo::new();
    seed.set(keys::VERSION, SCHEMA_VERSION);
    seed.set(keys::FILE_STATUS, 0);
    seed.set(keys::WRITER_ID, options.writer_id.as_deref().unwrap_or(env!("CARGO_PKG_NAME")));
    seed.set(keys::FILE_ID, Ulid::new());
    seed.set(keys::VALID_SETS, 0);
    seed.set(keys::CREATED_AT, Utc::now().to_rfc3339());
    if kind != StoreKind::Features {
        seed.set(keys::TIME_BASE, options.time_base);
    }
    if kind != StoreKind::Events {
        seed.set(keys::TRAI, 0);
        seed.set(keys::REFERENCE_ID, options.reference_id.as_deref().unwrap_or_default());
    }
    for (key, value) in seed.iter() {
        set_global(&tx, kind, key, value)?;
    }

    let sql = format!(
        "INSERT INTO {} (field, Unit, Parameter, Factor) VALUES (?1, ?2, ?3, ?4)",
        kind.fieldinfo_table()
    );
    for field in kind.default_field_info() {
        tx.execute(&sql, params![field.field, field.unit, field.parameter, field.factor])?;
    }

    tx.commit()?;
    conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
    Ok(())
}

/// Upsert one GlobalInfo entry.
pub(crate) fn set_global(conn: &Connection, kind: StoreKind, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO {} (Key, Value) VALUES (?1, ?2)
             ON CONFLICT(Key) DO UPDATE SET Value = excluded.Value",
            kind.globalinfo_table()
        ),
        params![key, value],
    )?;
    Ok(())
}

/// Read one GlobalInfo value straight from the file, bypassing any cache.
pub(crate) fn get_global(conn: &Connection, kind: StoreKind, key: &str) -> Result<Option<String>, StoreError> {
    let result = conn.query_row(
        &format!("SELECT Value FROM {} WHERE Key = ?1", kind.globalinfo_table()),
        params![key],
        |row| row.get::<_, Option<String>>(0),
    );
    match result {
        Ok(value) => Ok(value),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Sqlite(e)),
    }
}

pub(crate) fn read_global_info(conn: &Connection, kind: StoreKind) -> Result<GlobalInfo, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT Key, CAST(Value AS TEXT) FROM {}",
        kind.globalinfo_table()
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;

    let mut info = GlobalInfo::new();
    for row in rows {
        let (key, value) = row?;
        info.set(key, value.unwrap_or_default());
    }
    Ok(info)
}

pub(crate) fn read_field_info(conn: &Connection, kind: StoreKind) -> Result<Vec<FieldInfo>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT field, Unit, Parameter, Factor FROM {} ORDER BY field",
        kind.fieldinfo_table()
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok(FieldInfo {
            field: row.get(0)?,
            unit: row.get(1)?,
            parameter: row.get(2)?,
            factor: row.get(3)?,
        })
    })?;

    let mut fields = Vec::new();
    for row in rows {
        fields.push(row?);
    }
    Ok(fields)
}

pub(crate) fn table_names(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}

pub(crate) fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let stmt = conn.prepare(&format!("SELECT * FROM {table} LIMIT 0"))?;
    Ok(stmt.column_names().into_iter().map(str::to_string).collect())
}

fn validate(conn: &Connection, path: &Path, kind: StoreKind) -> Result<(), StoreError> {
    let tables: BTreeSet<String> = table_names(conn)?.into_iter().collect();
    for table in kind.required_tables() {
        if !tables.contains(table) {
            return Err(StoreError::SchemaMismatch {
                path: path.to_path_buf(),
                reason: format!("missing table {table}"),
            });
        }
    }

    let columns: BTreeSet<String> = column_names(conn, kind.data_table())?.into_iter().collect();
    for column in kind.required_columns() {
        if !columns.contains(*column) {
            return Err(StoreError::SchemaMismatch {
                path: path.to_path_buf(),
                reason: format!("missing column {}.{column}", kind.data_table()),
            });
        }
    }
    Ok(())
}

/// Actual row count and highest TRAI of the main table.
fn physical_counters(conn: &Connection, kind: StoreKind) -> Result<(i64, Option<i64>), StoreError> {
    let table = kind.data_table();
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    let trai = match kind {
        StoreKind::Events => None,
        _ => Some(conn.query_row(
            &format!("SELECT COALESCE(MAX(TRAI), 0) FROM {table}"),
            [],
            |row| row.get(0),
        )?),
    };
    Ok((count, trai))
}

/// Bring the counters in `info` in line with the table. Writes the fix back
/// only when `writable`.
fn repair_counters(
    conn: &mut Connection,
    path: &Path,
    kind: StoreKind,
    info: &mut GlobalInfo,
    writable: bool,
) -> Result<(), StoreError> {
    let (count, max_trai) = physical_counters(conn, kind)?;
    let mut fixes: Vec<(&str, i64)> = Vec::new();

    if info.valid_sets() != count {
        warn!(path = %path.display(), stored = info.valid_sets(), actual = count, "ValidSets out of sync");
        fixes.push((keys::VALID_SETS, count));
    }
    if let Some(max_trai) = max_trai {
        if info.trai() != Some(max_trai) {
            warn!(path = %path.display(), stored = ?info.trai(), actual = max_trai, "TRAI counter out of sync");
            fixes.push((keys::TRAI, max_trai));
        }
    }
    if fixes.is_empty() {
        return Ok(());
    }

    if writable {
        let tx = conn.transaction()?;
        for (key, value) in &fixes {
            set_global(&tx, kind, key, &value.to_string())?;
        }
        tx.commit()?;
    }
    for (key, value) in fixes {
        info.set(key, value);
    }
    Ok(())
}

/// Open and validate a store. Nothing is returned unless every check passes.
pub fn open(location: &StoreLocation, config: &StoreConfig) -> Result<StoreHandle, StoreError> {
    let path = location.path.as_path();
    let kind = location.kind;
    check_extension(path, kind)?;

    match location.mode {
        OpenMode::CreateIfMissing => {
            if !is_non_empty(path)? {
                let options = CreateOptions {
                    time_base: config.time_base,
                    ..CreateOptions::default()
                };
                create(path, kind, &options)?;
            }
        }
        OpenMode::ReadOnly | OpenMode::ReadWrite => {
            if !path.exists() {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
        }
    }

    let writable = location.mode.is_writable();
    let flags = if writable {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let mut conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(config.busy_timeout)?;

    validate(&conn, path, kind)?;

    let mut info = read_global_info(&conn, kind)?;
    if info.version() != Some(SCHEMA_VERSION) {
        return Err(StoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: info.get(keys::VERSION).map(str::to_string),
            supported: SCHEMA_VERSION,
        });
    }
    if kind != StoreKind::Features && info.time_base().is_none() {
        return Err(StoreError::SchemaMismatch {
            path: path.to_path_buf(),
            reason: "missing or invalid TimeBase".to_string(),
        });
    }

    if writable {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    }
    repair_counters(&mut conn, path, kind, &mut info, writable)?;
    if writable {
        set_global(&conn, kind, keys::FILE_STATUS, "1")?;
        info.set(keys::FILE_STATUS, 1);
    }

    debug!(path = %path.display(), mode = ?location.mode, rows = info.valid_sets(), "opened store");
    Ok(StoreHandle::new(conn, location.clone(), config.clone(), info))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn location(dir: &TempDir, name: &str, kind: StoreKind, mode: OpenMode) -> StoreLocation {
        StoreLocation::new(dir.path().join(name), kind, mode)
    }

    #[test]
    fn create_then_open_has_zero_valid_sets() {
        let dir = TempDir::new().unwrap();
        for (name, kind) in [
            ("s.pridb", StoreKind::Events),
            ("s.tradb", StoreKind::Waveforms),
            ("s.trfdb", StoreKind::Features),
        ] {
            let loc = location(&dir, name, kind, OpenMode::ReadOnly);
            create(&loc.path, kind, &CreateOptions::default()).unwrap();

            let handle = open(&loc, &StoreConfig::default()).unwrap();
            assert_eq!(handle.info().valid_sets(), 0, "{name}");
            assert_eq!(handle.info().version(), Some(SCHEMA_VERSION));
            assert!(handle.info().file_id().is_some());
        }
    }

    #[test]
    fn create_refuses_to_clobber_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.pridb");
        create(&path, StoreKind::Events, &CreateOptions::default()).unwrap();

        let err = create(&path, StoreKind::Events, &CreateOptions::default()).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let options = CreateOptions {
            overwrite: true,
            ..CreateOptions::default()
        };
        create(&path, StoreKind::Events, &options).unwrap();
    }

    #[test]
    fn create_accepts_existing_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.tradb");
        fs::write(&path, b"").unwrap();
        create(&path, StoreKind::Waveforms, &CreateOptions::default()).unwrap();
        assert!(!temp_path(&path, StoreKind::Waveforms).exists());
    }

    #[test]
    fn create_seeds_time_base_and_reference() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.tradb");
        let options = CreateOptions {
            time_base: TimeBase::new(1_000_000).unwrap(),
            reference_id: Some("01HZZREF".to_string()),
            ..CreateOptions::default()
        };
        create(&path, StoreKind::Waveforms, &options).unwrap();

        let conn = Connection::open(&path).unwrap();
        let info = read_global_info(&conn, StoreKind::Waveforms).unwrap();
        assert_eq!(info.time_base().unwrap().ticks_per_second(), 1_000_000);
        assert_eq!(info.reference_id(), Some("01HZZREF"));
        assert_eq!(info.trai(), Some(0));
        assert!(info.created_at().is_some());

        let fields = read_field_info(&conn, StoreKind::Waveforms).unwrap();
        assert!(fields.iter().any(|f| f.field == "Data" && f.parameter.as_deref() == Some("TR_mV")));
    }

    #[test]
    fn wrong_extension_is_a_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let err = create(&dir.path().join("s.db"), StoreKind::Events, &CreateOptions::default()).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
    }

    #[test]
    fn open_missing_file_fails_without_creating_it() {
        let dir = TempDir::new().unwrap();
        let loc = location(&dir, "nope.pridb", StoreKind::Events, OpenMode::ReadWrite);
        assert!(open(&loc, &StoreConfig::default()).is_err());
        assert!(!loc.path.exists());
    }

    #[test]
    fn create_if_missing_creates_with_configured_time_base() {
        let dir = TempDir::new().unwrap();
        let loc = location(&dir, "new.pridb", StoreKind::Events, OpenMode::CreateIfMissing);
        let config = StoreConfig {
            time_base: TimeBase::new(1_000).unwrap(),
            ..StoreConfig::default()
        };
        let handle = open(&loc, &config).unwrap();
        assert_eq!(handle.info().time_base().unwrap().ticks_per_second(), 1_000);
        assert!(handle.info().writer_active());
    }

    #[test]
    fn missing_column_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.tradb");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE tr_data (SetID INTEGER PRIMARY KEY, Time INTEGER);
                 CREATE TABLE tr_params (ID INTEGER PRIMARY KEY);
                 CREATE TABLE tr_fieldinfo (field TEXT);
                 CREATE TABLE tr_globalinfo (Key TEXT PRIMARY KEY, Value TEXT);",
            )
            .unwrap();
        }
        let loc = StoreLocation::new(path, StoreKind::Waveforms, OpenMode::ReadOnly);
        let err = open(&loc, &StoreConfig::default()).unwrap_err();
        match err {
            StoreError::SchemaMismatch { reason, .. } => assert!(reason.contains("tr_data.Chan"), "{reason}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn foreign_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let loc = location(&dir, "v.trfdb", StoreKind::Features, OpenMode::ReadOnly);
        create(&loc.path, StoreKind::Features, &CreateOptions::default()).unwrap();
        {
            let conn = Connection::open(&loc.path).unwrap();
            set_global(&conn, StoreKind::Features, keys::VERSION, "7").unwrap();
        }
        let err = open(&loc, &StoreConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnsupportedVersion { found: Some(ref v), supported: 1, .. } if v == "7"
        ));
    }

    #[test]
    fn read_only_open_corrects_counters_in_memory_only() {
        let dir = TempDir::new().unwrap();
        let loc = location(&dir, "c.trfdb", StoreKind::Features, OpenMode::ReadOnly);
        create(&loc.path, StoreKind::Features, &CreateOptions::default()).unwrap();
        {
            let conn = Connection::open(&loc.path).unwrap();
            conn.execute_batch("INSERT INTO trf_data (TRAI) VALUES (1), (2), (5);").unwrap();
        }

        let handle = open(&loc, &StoreConfig::default()).unwrap();
        assert_eq!(handle.info().valid_sets(), 3);
        assert_eq!(handle.info().trai(), Some(5));
        drop(handle);

        let conn = Connection::open(&loc.path).unwrap();
        assert_eq!(get_global(&conn, StoreKind::Features, keys::VALID_SETS).unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn writable_open_repairs_counters_on_disk() {
        let dir = TempDir::new().unwrap();
        let loc = location(&dir, "c.trfdb", StoreKind::Features, OpenMode::ReadWrite);
        create(&loc.path, StoreKind::Features, &CreateOptions::default()).unwrap();
        {
            let conn = Connection::open(&loc.path).unwrap();
            conn.execute_batch("INSERT INTO trf_data (TRAI) VALUES (4);").unwrap();
        }

        let handle = open(&loc, &StoreConfig::default()).unwrap();
        assert_eq!(handle.info().valid_sets(), 1);
        drop(handle);

        let conn = Connection::open(&loc.path).unwrap();
        assert_eq!(get_global(&conn, StoreKind::Features, keys::VALID_SETS).unwrap().as_deref(), Some("1"));
        assert_eq!(get_global(&conn, StoreKind::Features, keys::TRAI).unwrap().as_deref(), Some("4"));
        assert_eq!(get_global(&conn, StoreKind::Features, keys::FILE_STATUS).unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn writable_handle_marks_file_status_while_alive() {
        let dir = TempDir::new().unwrap();
        let loc = location(&dir, "w.pridb", StoreKind::Events, OpenMode::ReadWrite);
        create(&loc.path, StoreKind::Events, &CreateOptions::default()).unwrap();

        let writer = open(&loc, &StoreConfig::default()).unwrap();
        let reader = open(&loc.with_mode(OpenMode::ReadOnly), &StoreConfig::default()).unwrap();
        assert_eq!(
            get_global(reader.conn(), StoreKind::Events, keys::FILE_STATUS).unwrap().as_deref(),
            Some("1")
        );
        drop(writer);
        assert_eq!(
            get_global(reader.conn(), StoreKind::Events, keys::FILE_STATUS).unwrap().as_deref(),
            Some("0")
        );
    }
}
