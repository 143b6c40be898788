// ABOUTME: SQLite persistence for Acoustic Emission sessions: events, waveforms and features stores.
// ABOUTME: Schema lifecycle, binary-search range queries, live tailing and transactional writes.

pub mod config;
pub mod error;
pub mod features;
pub mod handle;
mod params;
pub mod pridb;
pub mod query;
pub mod range;
pub mod schema;
pub mod tail;
pub mod tradb;
pub mod trfdb;
pub mod write;

pub use config::{ConfigError, StoreConfig};
pub use error::StoreError;
pub use features::{ExtractOptions, ExtractSummary, extract_features};
pub use handle::{OpenMode, Reopenable, Store, StoreHandle, StoreKind, StoreLocation};
pub use pridb::{EventStore, EventTail};
pub use query::ReadFilter;
pub use range::{KeyRange, TimeIndex, find_range};
pub use schema::{CreateOptions, SCHEMA_VERSION, create, open};
pub use tail::{CancelToken, Follow, RowMapper, SqlSource, Tail, TailOptions, TailSource};
pub use tradb::{WaveformStore, WaveformTail};
pub use trfdb::{FeatureStore, FeatureTail};
pub use write::{RowValues, WriteTx, write_transaction};
