// ABOUTME: Live consumption of appended rows: polls `key > last` in bounded batches, sleeps
// ABOUTME: when caught up, retries failed polls a bounded number of times, honours cancellation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use aedb_core::info::keys;
use rusqlite::types::Value;
use rusqlite::{Connection, Row, params_from_iter};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::handle::StoreKind;
use crate::schema;

/// When a tail stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Follow {
    /// Keep polling until cancelled.
    #[default]
    Forever,
    /// Stop at the first empty poll made while no writer had the store open.
    UntilIdle,
    /// Stop as soon as the rows present at poll time are drained.
    UntilExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TailOptions {
    /// Deliver rows with key greater than this. `None` skips existing rows.
    pub start_after: Option<i64>,
    pub poll_interval: Duration,
    pub buffer_size: usize,
    /// Consecutive failed polls tolerated before the tail yields the error.
    pub max_retries: u32,
    pub follow: Follow,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            start_after: None,
            poll_interval: Duration::from_millis(100),
            buffer_size: 1000,
            max_retries: 5,
            follow: Follow::Forever,
        }
    }
}

impl TailOptions {
    /// Replay every existing row, then continue as configured.
    pub fn from_start(mut self) -> Self {
        self.start_after = Some(0);
        self
    }

    pub fn follow(mut self, follow: Follow) -> Self {
        self.follow = follow;
        self
    }
}

/// Shared cancellation flag for a running tail.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a tail gets its rows from.
pub trait TailSource {
    type Item;

    /// Up to `limit` rows with key greater than `after`, in key order.
    fn fetch(&mut self, after: i64, limit: usize) -> Result<Vec<(i64, Self::Item)>, StoreError>;

    /// Highest key currently present.
    fn last_key(&mut self) -> Result<Option<i64>, StoreError>;

    /// True while a writer holds the store open.
    fn writer_active(&mut self) -> Result<bool, StoreError>;
}

/// Iterator over rows as they are appended.
///
/// Holds only the last delivered key between polls; no statement or
/// transaction stays open, so a concurrent writer is never blocked.
pub struct Tail<S: TailSource> {
    source: S,
    options: TailOptions,
    cancel: CancelToken,
    position: Option<i64>,
    buffer: VecDeque<(i64, S::Item)>,
    caught_up: bool,
    idle: bool,
    retry_pending: bool,
    failures: u32,
    finished: bool,
}

impl<S: TailSource> Tail<S> {
    pub fn new(source: S, options: TailOptions, cancel: CancelToken) -> Self {
        let position = options.start_after;
        Self {
            source,
            options,
            cancel,
            position,
            buffer: VecDeque::new(),
            caught_up: false,
            idle: false,
            retry_pending: false,
            failures: 0,
            finished: false,
        }
    }

    /// Key of the last delivered row; resume from here with `start_after`.
    pub fn last_delivered(&self) -> Option<i64> {
        self.position
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn poll(&mut self) -> Result<(), StoreError> {
        let after = match self.position {
            Some(position) => position,
            None => {
                let last = self.source.last_key()?.unwrap_or(0);
                self.position = Some(last);
                last
            }
        };
        let writer_was_active = match self.options.follow {
            Follow::UntilIdle => self.source.writer_active()?,
            _ => true,
        };

        let rows = self.source.fetch(after, self.options.buffer_size)?;
        debug!(after, fetched = rows.len(), "tail poll");
        self.caught_up = rows.len() < self.options.buffer_size;
        self.idle = rows.is_empty() && !writer_was_active;
        self.buffer.extend(rows);
        Ok(())
    }
}

impl<S: TailSource> Iterator for Tail<S> {
    type Item = Result<S::Item, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished || self.cancel.is_cancelled() {
                self.finished = true;
                return None;
            }
            if let Some((key, item)) = self.buffer.pop_front() {
                self.position = Some(key);
                return Some(Ok(item));
            }

            if self.caught_up || self.retry_pending {
                let stop = match self.options.follow {
                    _ if self.retry_pending => false,
                    Follow::Forever => false,
                    Follow::UntilIdle => self.idle,
                    Follow::UntilExhausted => true,
                };
                if stop {
                    self.finished = true;
                    return None;
                }
                thread::sleep(self.options.poll_interval);
                if self.cancel.is_cancelled() {
                    continue;
                }
            }

            match self.poll() {
                Ok(()) => {
                    self.failures = 0;
                    self.retry_pending = false;
                }
                Err(err) => {
                    self.failures += 1;
                    if self.failures > self.options.max_retries {
                        self.finished = true;
                        return Some(Err(err));
                    }
                    warn!(error = %err, attempt = self.failures, "tail poll failed, retrying");
                    self.retry_pending = true;
                }
            }
        }
    }
}

/// Converts one fetched row into a tail item.
pub type RowMapper<'c, T> = Box<dyn FnMut(&Row<'_>) -> Result<T, StoreError> + 'c>;

/// A [`TailSource`] over one store table.
///
/// `select` must start with the key column and must not carry a WHERE
/// clause; `filter` adds extra conditions with their parameters.
pub struct SqlSource<'c, T> {
    conn: &'c Connection,
    kind: StoreKind,
    key_column: &'static str,
    sql: String,
    filter_params: Vec<Value>,
    map: RowMapper<'c, T>,
}

impl<'c, T> SqlSource<'c, T> {
    pub fn new(
        conn: &'c Connection,
        kind: StoreKind,
        select: &str,
        key_expr: &str,
        key_column: &'static str,
        filter: Option<(String, Vec<Value>)>,
        map: RowMapper<'c, T>,
    ) -> Self {
        let (clause, filter_params) = match filter {
            Some((clause, params)) if !clause.is_empty() => (format!(" AND {clause}"), params),
            _ => (String::new(), Vec::new()),
        };
        let sql = format!("{select} WHERE {key_expr} > ?{clause} ORDER BY {key_expr} LIMIT ?");
        Self {
            conn,
            kind,
            key_column,
            sql,
            filter_params,
            map,
        }
    }
}

impl<T> TailSource for SqlSource<'_, T> {
    type Item = T;

    fn fetch(&mut self, after: i64, limit: usize) -> Result<Vec<(i64, T)>, StoreError> {
        let mut values = Vec::with_capacity(self.filter_params.len() + 2);
        values.push(Value::Integer(after));
        values.extend(self.filter_params.iter().cloned());
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let mut stmt = self.conn.prepare_cached(&self.sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let key: i64 = row.get(0)?;
            out.push((key, (self.map)(row)?));
        }
        Ok(out)
    }

    fn last_key(&mut self) -> Result<Option<i64>, StoreError> {
        let sql = format!("SELECT MAX({}) FROM {}", self.key_column, self.kind.data_table());
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    fn writer_active(&mut self) -> Result<bool, StoreError> {
        let status = schema::get_global(self.conn, self.kind, keys::FILE_STATUS)?;
        Ok(status.is_some_and(|s| s.trim() != "0"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Scripted store: a writer appends between polls according to a plan.
    struct Scripted {
        rows: BTreeMap<i64, String>,
        next_key: i64,
        /// rows appended before each fetch, by fetch index
        plan: Vec<usize>,
        fetches: usize,
        failures: Vec<bool>,
        writer_active: bool,
    }

    impl Scripted {
        fn new(existing: usize, plan: Vec<usize>) -> Self {
            let mut source = Self {
                rows: BTreeMap::new(),
                next_key: 1,
                plan,
                fetches: 0,
                failures: Vec::new(),
                writer_active: true,
            };
            source.append(existing);
            source
        }

        fn append(&mut self, n: usize) {
            for _ in 0..n {
                self.rows.insert(self.next_key, format!("row{}", self.next_key));
                self.next_key += 1;
            }
        }
    }

    impl TailSource for Scripted {
        type Item = String;

        fn fetch(&mut self, after: i64, limit: usize) -> Result<Vec<(i64, String)>, StoreError> {
            let index = self.fetches;
            self.fetches += 1;
            if self.failures.get(index).copied().unwrap_or(false) {
                return Err(StoreError::InvalidArgument("scripted failure".to_string()));
            }
            if let Some(&n) = self.plan.get(index) {
                self.append(n);
            }
            Ok(self
                .rows
                .range(after + 1..)
                .take(limit)
                .map(|(k, v)| (*k, v.clone()))
                .collect())
        }

        fn last_key(&mut self) -> Result<Option<i64>, StoreError> {
            Ok(self.rows.keys().next_back().copied())
        }

        fn writer_active(&mut self) -> Result<bool, StoreError> {
            Ok(self.writer_active)
        }
    }

    fn fast(start_after: Option<i64>, buffer_size: usize, follow: Follow) -> TailOptions {
        TailOptions {
            start_after,
            poll_interval: Duration::from_millis(1),
            buffer_size,
            max_retries: 2,
            follow,
        }
    }

    #[test]
    fn delivers_every_row_exactly_once_in_order() {
        let source = Scripted::new(5, vec![0, 3, 0, 7, 1, 0, 4]);
        let tail = Tail::new(source, fast(Some(0), 2, Follow::Forever), CancelToken::new());

        let keys: Vec<String> = tail.take(20).map(Result::unwrap).collect();
        let expected: Vec<String> = (1..=20).map(|k| format!("row{k}")).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn default_start_skips_existing_rows() {
        let source = Scripted::new(10, vec![0, 2]);
        let tail = Tail::new(source, fast(None, 100, Follow::Forever), CancelToken::new());
        let rows: Vec<String> = tail.take(2).map(Result::unwrap).collect();
        assert_eq!(rows, vec!["row11", "row12"]);
    }

    #[test]
    fn until_exhausted_stops_at_current_end() {
        let source = Scripted::new(7, Vec::new());
        let tail = Tail::new(source, fast(Some(3), 2, Follow::UntilExhausted), CancelToken::new());
        let rows: Vec<String> = tail.map(Result::unwrap).collect();
        assert_eq!(rows, vec!["row4", "row5", "row6", "row7"]);
    }

    #[test]
    fn until_idle_drains_then_stops_when_writer_is_gone() {
        let mut source = Scripted::new(3, vec![0, 2]);
        source.writer_active = false;
        let tail = Tail::new(source, fast(Some(0), 10, Follow::UntilIdle), CancelToken::new());
        let rows: Vec<String> = tail.map(Result::unwrap).collect();
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn cancellation_stops_without_further_fetches() {
        let source = Scripted::new(3, Vec::new());
        let cancel = CancelToken::new();
        let mut tail = Tail::new(source, fast(Some(0), 1, Follow::Forever), cancel.clone());

        assert_eq!(tail.next().unwrap().unwrap(), "row1");
        cancel.cancel();
        assert!(tail.next().is_none());
        assert_eq!(tail.source.fetches, 1);
        assert_eq!(tail.last_delivered(), Some(1));
    }

    #[test]
    fn transient_failures_are_retried() {
        let mut source = Scripted::new(2, Vec::new());
        source.failures = vec![true, true, false];
        let tail = Tail::new(source, fast(Some(0), 10, Follow::UntilExhausted), CancelToken::new());
        let rows: Vec<String> = tail.map(Result::unwrap).collect();
        assert_eq!(rows, vec!["row1", "row2"]);
    }

    #[test]
    fn persistent_failure_ends_with_one_error() {
        let mut source = Scripted::new(2, Vec::new());
        source.failures = vec![true; 10];
        let mut tail = Tail::new(source, fast(Some(0), 10, Follow::Forever), CancelToken::new());

        assert!(tail.next().unwrap().is_err());
        assert!(tail.next().is_none());
        // initial attempt plus max_retries
        assert_eq!(tail.source.fetches, 3);
    }
}
