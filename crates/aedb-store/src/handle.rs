// ABOUTME: Store handles: kind and open mode, the serialisable location used to reopen a
// ABOUTME: store in another thread or process, and the live handle that owns the connection.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use aedb_core::info::keys;
use aedb_core::{ChannelId, FieldInfo, GlobalInfo};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::schema;
use crate::write::{self, WriteTx};

/// Which of the three session stores a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Hits, markers, status and parametric sets (`.pridb`).
    Events,
    /// Transient waveforms (`.tradb`).
    Waveforms,
    /// Per-waveform features (`.trfdb`).
    Features,
}

impl StoreKind {
    pub fn extension(self) -> &'static str {
        match self {
            StoreKind::Events => "pridb",
            StoreKind::Waveforms => "tradb",
            StoreKind::Features => "trfdb",
        }
    }

    /// Guess the kind from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        [StoreKind::Events, StoreKind::Waveforms, StoreKind::Features]
            .into_iter()
            .find(|kind| kind.extension() == ext)
    }

    pub fn data_table(self) -> &'static str {
        match self {
            StoreKind::Events => "ae_data",
            StoreKind::Waveforms => "tr_data",
            StoreKind::Features => "trf_data",
        }
    }

    pub fn globalinfo_table(self) -> &'static str {
        match self {
            StoreKind::Events => "ae_globalinfo",
            StoreKind::Waveforms => "tr_globalinfo",
            StoreKind::Features => "trf_globalinfo",
        }
    }

    pub fn fieldinfo_table(self) -> &'static str {
        match self {
            StoreKind::Events => "ae_fieldinfo",
            StoreKind::Waveforms => "tr_fieldinfo",
            StoreKind::Features => "trf_fieldinfo",
        }
    }

    pub fn params_table(self) -> Option<&'static str> {
        match self {
            StoreKind::Events => Some("ae_params"),
            StoreKind::Waveforms => Some("tr_params"),
            StoreKind::Features => None,
        }
    }

    pub fn markers_table(self) -> Option<&'static str> {
        match self {
            StoreKind::Events => Some("ae_markers"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    #[default]
    ReadOnly,
    ReadWrite,
    /// Create the store first if the file is missing or empty.
    CreateIfMissing,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Everything needed to reopen a store; safe to send or serialise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLocation {
    pub path: PathBuf,
    pub kind: StoreKind,
    pub mode: OpenMode,
}

impl StoreLocation {
    pub fn new(path: impl Into<PathBuf>, kind: StoreKind, mode: OpenMode) -> Self {
        Self {
            path: path.into(),
            kind,
            mode,
        }
    }

    /// Same file and kind, different mode.
    pub fn with_mode(&self, mode: OpenMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    pub fn open(&self, config: &StoreConfig) -> Result<StoreHandle, StoreError> {
        schema::open(self, config)
    }
}

/// An open, validated store file.
///
/// Owns its connection and is not `Sync`; pass the [`StoreLocation`] to
/// another thread and reopen there instead. A writable handle keeps
/// `FileStatus = 1` until it is dropped.
#[derive(Debug)]
pub struct StoreHandle {
    conn: Connection,
    location: StoreLocation,
    config: StoreConfig,
    info: GlobalInfo,
}

impl StoreHandle {
    pub(crate) fn new(conn: Connection, location: StoreLocation, config: StoreConfig, info: GlobalInfo) -> Self {
        Self {
            conn,
            location,
            config,
            info,
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn kind(&self) -> StoreKind {
        self.location.kind
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// GlobalInfo as of open or the last committed write through this handle.
    pub fn info(&self) -> &GlobalInfo {
        &self.info
    }

    pub fn is_writable(&self) -> bool {
        self.location.mode.is_writable()
    }

    /// Re-read GlobalInfo from the file, picking up commits made by other handles.
    pub fn refresh(&mut self) -> Result<&GlobalInfo, StoreError> {
        self.info = schema::read_global_info(&self.conn, self.kind())?;
        Ok(&self.info)
    }

    /// Run `f` inside one write transaction and adopt the committed GlobalInfo.
    pub fn write<T>(
        &mut self,
        f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if !self.is_writable() {
            return Err(StoreError::ReadOnly {
                path: self.location.path.clone(),
            });
        }
        let (value, info) = write::write_transaction(&mut self.conn, self.location.kind, f)?;
        self.info = info;
        Ok(value)
    }

    pub fn field_info(&self) -> Result<Vec<FieldInfo>, StoreError> {
        schema::read_field_info(&self.conn, self.kind())
    }

    pub fn tables(&self) -> Result<Vec<String>, StoreError> {
        schema::table_names(&self.conn)
    }

    /// Column names of the main data table.
    pub fn columns(&self) -> Result<Vec<String>, StoreError> {
        schema::column_names(&self.conn, self.kind().data_table())
    }

    /// Distinct channels present in the main data table.
    pub fn channels(&self) -> Result<BTreeSet<ChannelId>, StoreError> {
        if self.kind() == StoreKind::Features {
            return Ok(BTreeSet::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT Chan FROM {} WHERE Chan IS NOT NULL",
            self.kind().data_table()
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut channels = BTreeSet::new();
        for row in rows {
            channels.insert(ChannelId::try_from(row?).map_err(|_| {
                StoreError::InvalidArgument("channel number out of range".to_string())
            })?);
        }
        Ok(channels)
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if !self.is_writable() {
            return;
        }
        if let Err(err) = schema::set_global(&self.conn, self.kind(), keys::FILE_STATUS, "0") {
            warn!(path = %self.location.path.display(), error = %err, "could not reset FileStatus");
        }
    }
}

/// Common surface of the three store facades.
pub trait Store: Sized {
    const KIND: StoreKind;

    /// Wrap a validated handle, checking kind-specific preconditions.
    fn from_handle(handle: StoreHandle) -> Result<Self, StoreError>;

    fn handle(&self) -> &StoreHandle;

    fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, StoreError> {
        Self::open_with(path, mode, &StoreConfig::default())
    }

    fn open_with(path: impl AsRef<Path>, mode: OpenMode, config: &StoreConfig) -> Result<Self, StoreError> {
        let location = StoreLocation::new(path.as_ref(), Self::KIND, mode);
        Self::open_location(&location, config)
    }

    fn open_location(location: &StoreLocation, config: &StoreConfig) -> Result<Self, StoreError> {
        if location.kind != Self::KIND {
            return Err(StoreError::InvalidArgument(format!(
                "{} is a {:?} store, expected {:?}",
                location.path.display(),
                location.kind,
                Self::KIND
            )));
        }
        Self::from_handle(location.open(config)?)
    }

    fn location(&self) -> &StoreLocation {
        self.handle().location()
    }

    fn global_info(&self) -> &GlobalInfo {
        self.handle().info()
    }

    /// Number of rows in the main table.
    fn rows(&self) -> i64 {
        self.handle().info().valid_sets()
    }
}

/// A store that is opened lazily, on first use after construction or
/// deserialisation. Only the location and config are serialised.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Reopenable<S> {
    location: StoreLocation,
    #[serde(default)]
    config: StoreConfig,
    #[serde(skip)]
    store: Option<S>,
}

impl<S: Store> Reopenable<S> {
    pub fn new(location: StoreLocation, config: StoreConfig) -> Self {
        Self {
            location,
            config,
            store: None,
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    /// The open store, opening it now if needed.
    pub fn get(&mut self) -> Result<&mut S, StoreError> {
        let store = match self.store.take() {
            Some(store) => store,
            None => S::open_location(&self.location, &self.config)?,
        };
        Ok(self.store.insert(store))
    }

    /// Drop the live store; the next [`Reopenable::get`] reopens it.
    pub fn close(&mut self) {
        self.store = None;
    }
}

impl<S> Clone for Reopenable<S> {
    /// Clones carry only the location; each clone opens its own handle.
    fn clone(&self) -> Self {
        Self {
            location: self.location.clone(),
            config: self.config.clone(),
            store: None,
        }
    }
}

impl<S> std::fmt::Debug for Reopenable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reopenable")
            .field("location", &self.location)
            .field("open", &self.store.is_some())
            .finish()
    }
}
