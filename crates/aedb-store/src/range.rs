// ABOUTME: Time-window lookup by binary search over a time-sorted key column.
// ABOUTME: Probes use index seeks, so gaps in the key sequence cost nothing extra.

use aedb_core::{TICK_TOLERANCE, TimeTick};
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::debug;

use crate::error::StoreError;

/// A table with an integer key whose order follows its time column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeIndex {
    pub table: &'static str,
    pub key: &'static str,
    pub time: &'static str,
}

/// Events are keyed by insertion order, which the write path keeps time-sorted.
pub const EVENTS_INDEX: TimeIndex = TimeIndex {
    table: "ae_data",
    key: "SetID",
    time: "Time",
};

/// Waveforms are interleaved across channels by SetID; TRAI is the time-sorted key.
pub const WAVEFORMS_INDEX: TimeIndex = TimeIndex {
    table: "tr_data",
    key: "TRAI",
    time: "Time",
};

/// Inclusive bounds of the key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyRange {
    pub low: i64,
    pub high: i64,
}

impl KeyRange {
    pub fn contains(&self, key: i64) -> bool {
        self.low <= key && key <= self.high
    }
}

struct Prober<'a> {
    conn: &'a Connection,
    ceil_sql: String,
    floor_sql: String,
    probes: usize,
}

impl<'a> Prober<'a> {
    fn new(conn: &'a Connection, index: &TimeIndex) -> Self {
        let TimeIndex { table, key, time } = index;
        Self {
            conn,
            ceil_sql: format!("SELECT {key}, {time} FROM {table} WHERE {key} >= ?1 ORDER BY {key} ASC LIMIT 1"),
            floor_sql: format!("SELECT {key}, {time} FROM {table} WHERE {key} <= ?1 ORDER BY {key} DESC LIMIT 1"),
            probes: 0,
        }
    }

    fn seek(&mut self, ceil: bool, key: i64) -> Result<Option<(i64, TimeTick)>, StoreError> {
        self.probes += 1;
        let sql = if ceil { &self.ceil_sql } else { &self.floor_sql };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let result = stmt.query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?)));
        match result {
            Ok(hit) => Ok(Some(hit)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    /// Lowest row with key >= `key`.
    fn ceil(&mut self, key: i64) -> Result<Option<(i64, TimeTick)>, StoreError> {
        self.seek(true, key)
    }

    /// Highest row with key <= `key`.
    fn floor(&mut self, key: i64) -> Result<Option<(i64, TimeTick)>, StoreError> {
        self.seek(false, key)
    }
}

/// Key bounds of all rows whose time lies in `[start, stop]`.
///
/// `None` leaves that side open. Ties resolve to the lowest key at the
/// lower bound and the highest key at the upper bound. Fails with
/// `EmptyRange` when no row falls in the window and `InvalidArgument`
/// when `stop < start`.
pub fn find_range(
    conn: &Connection,
    index: &TimeIndex,
    start: Option<TimeTick>,
    stop: Option<TimeTick>,
) -> Result<KeyRange, StoreError> {
    find_range_counted(conn, index, start, stop).map(|(range, _)| range)
}

/// [`find_range`] plus the number of index probes it took.
pub(crate) fn find_range_counted(
    conn: &Connection,
    index: &TimeIndex,
    start: Option<TimeTick>,
    stop: Option<TimeTick>,
) -> Result<(KeyRange, usize), StoreError> {
    if let (Some(start), Some(stop)) = (start, stop) {
        if stop < start {
            return Err(StoreError::InvalidArgument(format!(
                "{}: time stop {stop} is before time start {start}",
                index.table
            )));
        }
    }
    let empty = || StoreError::EmptyRange {
        table: index.table.to_string(),
        start,
        stop,
    };

    let mut prober = Prober::new(conn, index);
    let Some((first_key, first_time)) = prober.ceil(i64::MIN)? else {
        return Err(empty());
    };
    let Some((last_key, last_time)) = prober.floor(i64::MAX)? else {
        return Err(empty());
    };
    if first_time > last_time + TICK_TOLERANCE {
        return Err(StoreError::NotMonotonic {
            table: index.table.to_string(),
            key: first_key,
            previous: first_time,
            time: last_time,
        });
    }

    let low = match start {
        None => first_key,
        Some(start) if first_time >= start => first_key,
        Some(start) if last_time + TICK_TOLERANCE < start => return Err(empty()),
        Some(start) => {
            // smallest x with time(ceil(x)) >= start
            let (mut lo, mut hi) = (first_key, last_key);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let (key, time) = prober.ceil(mid)?.ok_or_else(empty)?;
                if time >= start {
                    hi = mid;
                } else {
                    lo = key + 1;
                }
            }
            match prober.ceil(lo)?.ok_or_else(empty)? {
                (key, time) if time >= start => key,
                _ => return Err(empty()),
            }
        }
    };

    let high = match stop {
        None => last_key,
        Some(stop) if last_time <= stop => last_key,
        Some(stop) if first_time > stop + TICK_TOLERANCE => return Err(empty()),
        Some(stop) => {
            // largest x with time(floor(x)) <= stop
            let (mut lo, mut hi) = (first_key, last_key);
            while lo < hi {
                let mid = lo + (hi - lo + 1) / 2;
                let (key, time) = prober.floor(mid)?.ok_or_else(empty)?;
                if time <= stop {
                    lo = mid;
                } else {
                    hi = key - 1;
                }
            }
            match prober.floor(lo)?.ok_or_else(empty)? {
                (key, time) if time <= stop => key,
                _ => return Err(empty()),
            }
        }
    };

    debug!(table = index.table, ?start, ?stop, low, high, probes = prober.probes, "range lookup");
    if low > high {
        return Err(empty());
    }
    Ok((KeyRange { low, high }, prober.probes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: TimeIndex = TimeIndex {
        table: "t",
        key: "k",
        time: "time",
    };

    fn table(rows: &[(i64, i64)]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k INTEGER PRIMARY KEY, time INTEGER NOT NULL);")
            .unwrap();
        for (k, time) in rows {
            conn.execute("INSERT INTO t (k, time) VALUES (?1, ?2)", params![k, time])
                .unwrap();
        }
        conn
    }

    #[test]
    fn micro_second_window_picks_middle_hit() {
        let conn = table(&[(1, 0), (2, 500_000), (3, 1_500_000)]);
        let range = find_range(&conn, &INDEX, Some(400_000), Some(1_000_000)).unwrap();
        assert_eq!(range, KeyRange { low: 2, high: 2 });

        let err = find_range(&conn, &INDEX, Some(2_000_000), Some(3_000_000)).unwrap_err();
        assert!(matches!(err, StoreError::EmptyRange { .. }));
    }

    #[test]
    fn open_bounds_extend_to_table_ends() {
        let conn = table(&[(1, 10), (2, 20), (3, 30)]);
        assert_eq!(find_range(&conn, &INDEX, None, None).unwrap(), KeyRange { low: 1, high: 3 });
        assert_eq!(find_range(&conn, &INDEX, Some(15), None).unwrap(), KeyRange { low: 2, high: 3 });
        assert_eq!(find_range(&conn, &INDEX, None, Some(25)).unwrap(), KeyRange { low: 1, high: 2 });
        assert_eq!(find_range(&conn, &INDEX, Some(-5), Some(100)).unwrap(), KeyRange { low: 1, high: 3 });
    }

    #[test]
    fn ties_resolve_to_outermost_keys() {
        let conn = table(&[(1, 5), (2, 10), (3, 10), (4, 10), (5, 10), (6, 20)]);
        let range = find_range(&conn, &INDEX, Some(10), Some(10)).unwrap();
        assert_eq!(range, KeyRange { low: 2, high: 5 });
    }

    #[test]
    fn window_between_rows_is_empty() {
        let conn = table(&[(1, 10), (2, 20)]);
        let err = find_range(&conn, &INDEX, Some(12), Some(18)).unwrap_err();
        assert!(matches!(err, StoreError::EmptyRange { start: Some(12), stop: Some(18), .. }));
    }

    #[test]
    fn empty_table_is_empty_range() {
        let conn = table(&[]);
        assert!(matches!(
            find_range(&conn, &INDEX, None, None).unwrap_err(),
            StoreError::EmptyRange { .. }
        ));
    }

    #[test]
    fn inverted_window_is_invalid() {
        let conn = table(&[(1, 10)]);
        assert!(matches!(
            find_range(&conn, &INDEX, Some(20), Some(10)).unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
    }

    #[test]
    fn key_gaps_are_skipped() {
        // keys 10, 20, ... 1000 with time = key * 3
        let rows: Vec<(i64, i64)> = (1..=100).map(|i| (i * 10, i * 30)).collect();
        let conn = table(&rows);
        let range = find_range(&conn, &INDEX, Some(301), Some(599)).unwrap();
        assert_eq!(range, KeyRange { low: 110, high: 190 });
    }

    #[test]
    fn bounds_exclude_nearest_outside_rows() {
        let rows: Vec<(i64, i64)> = (1..=500).map(|i| (i, i * 7 + (i % 3))).collect();
        let conn = table(&rows);
        for (start, stop) in [(0, 50), (100, 1000), (330, 337), (2000, 3600)] {
            let range = find_range(&conn, &INDEX, Some(start), Some(stop)).unwrap();
            for &(k, time) in &rows {
                assert_eq!(range.contains(k), start <= time && time <= stop, "k={k} window=({start},{stop})");
            }
        }
    }

    #[test]
    fn probes_grow_logarithmically() {
        let rows: Vec<(i64, i64)> = (1..=4096).map(|i| (i, i)).collect();
        let conn = table(&rows);
        let (range, probes) = find_range_counted(&conn, &INDEX, Some(1000), Some(3000)).unwrap();
        assert_eq!(range, KeyRange { low: 1000, high: 3000 });
        // two end probes plus two bisections of 12 steps and a final seek each
        assert!(probes <= 2 + 2 * (12 + 2), "took {probes} probes");
    }

    #[test]
    fn unsorted_table_is_detected() {
        let conn = table(&[(1, 100), (2, 50)]);
        assert!(matches!(
            find_range(&conn, &INDEX, Some(60), None).unwrap_err(),
            StoreError::NotMonotonic { .. }
        ));
    }

    #[test]
    fn one_tick_backwards_step_is_tolerated() {
        let conn = table(&[(1, 100), (2, 99)]);
        let range = find_range(&conn, &INDEX, None, Some(100)).unwrap();
        assert_eq!(range, KeyRange { low: 1, high: 2 });
    }

    #[test]
    fn backwards_step_at_table_ends_still_finds_exact_rows() {
        // last row one tick behind a matching one
        let conn = table(&[(1, 5), (2, 10), (3, 9)]);
        let range = find_range(&conn, &INDEX, Some(10), None).unwrap();
        assert!(range.contains(2), "{range:?}");

        // first row one tick ahead of a matching one
        let conn = table(&[(1, 2), (2, 1), (3, 5)]);
        let range = find_range(&conn, &INDEX, None, Some(1)).unwrap();
        assert!(range.contains(2), "{range:?}");
        assert!(!range.contains(3), "{range:?}");

        // inside the tolerance but with no row in the window
        let conn = table(&[(1, 5), (2, 8), (3, 9)]);
        assert!(matches!(
            find_range(&conn, &INDEX, Some(10), None).unwrap_err(),
            StoreError::EmptyRange { .. }
        ));
        let conn = table(&[(1, 6), (2, 7), (3, 9)]);
        assert!(matches!(
            find_range(&conn, &INDEX, None, Some(5)).unwrap_err(),
            StoreError::EmptyRange { .. }
        ));
    }
}
