// ABOUTME: Read filters for facade queries and the small SQL condition builder behind them.
// ABOUTME: Also validates identifiers that end up spliced into SQL (feature column names).

use aedb_core::ChannelId;
use rusqlite::types::Value;

/// Restricts which rows a facade read returns.
///
/// Empty lists mean "no restriction". `ids` are SetIDs for events and
/// TRAIs for waveforms and features. `sql` is appended verbatim as an
/// extra predicate, e.g. `"Amp > 5000 AND RiseT < 1000"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadFilter {
    pub channels: Vec<ChannelId>,
    /// Seconds since session start, inclusive.
    pub time_start: Option<f64>,
    /// Seconds since session start, inclusive.
    pub time_stop: Option<f64>,
    pub ids: Vec<i64>,
    pub sql: Option<String>,
}

impl ReadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(mut self, channel: ChannelId) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channels(mut self, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        self.channels.extend(channels);
        self
    }

    pub fn time(mut self, start: Option<f64>, stop: Option<f64>) -> Self {
        self.time_start = start;
        self.time_stop = stop;
        self
    }

    pub fn id(mut self, id: i64) -> Self {
        self.ids.push(id);
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.ids.extend(ids);
        self
    }

    pub fn sql(mut self, predicate: impl Into<String>) -> Self {
        self.sql = Some(predicate.into());
        self
    }

    pub fn has_time_window(&self) -> bool {
        self.time_start.is_some() || self.time_stop.is_some()
    }
}

/// AND-joined SQL predicates with positional parameters.
#[derive(Debug, Clone, Default)]
pub(crate) struct Conditions {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Conditions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    /// `column IN (?, ...)`; no-op for an empty list.
    pub(crate) fn in_list(&mut self, column: &str, values: impl IntoIterator<Item = i64>) {
        let values: Vec<Value> = values.into_iter().map(Value::Integer).collect();
        if values.is_empty() {
            return;
        }
        let marks = vec!["?"; values.len()].join(", ");
        self.push(format!("{column} IN ({marks})"), values);
    }

    pub(crate) fn between(&mut self, column: &str, low: i64, high: i64) {
        self.push(
            format!("{column} BETWEEN ? AND ?"),
            [Value::Integer(low), Value::Integer(high)],
        );
    }

    /// Inclusive bounds on a tick column; `None` leaves that side open.
    pub(crate) fn time_window(&mut self, column: &str, start: Option<i64>, stop: Option<i64>) {
        if let Some(start) = start {
            self.push(format!("{column} >= ?"), [Value::Integer(start)]);
        }
        if let Some(stop) = stop {
            self.push(format!("{column} <= ?"), [Value::Integer(stop)]);
        }
    }

    /// A caller-supplied predicate, parenthesised.
    pub(crate) fn raw(&mut self, predicate: Option<&str>) {
        if let Some(predicate) = predicate.map(str::trim).filter(|p| !p.is_empty()) {
            self.push(format!("({predicate})"), std::iter::empty::<Value>());
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Predicates joined with AND, without a leading keyword.
    pub(crate) fn sql(&self) -> String {
        self.clauses.join(" AND ")
    }

    /// ` WHERE ...` or an empty string.
    pub(crate) fn where_clause(&self) -> String {
        if self.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.sql())
        }
    }

    pub(crate) fn params(&self) -> &[Value] {
        &self.params
    }

    /// Clause and parameters for a tail filter.
    pub(crate) fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql(), self.params)
    }
}

/// True for plain SQL identifiers: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("RA"));
        assert!(is_identifier("_x1"));
        assert!(is_identifier("FFT_CoG"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("1st"));
        assert!(!is_identifier("a b"));
        assert!(!is_identifier("x;DROP TABLE trf_data"));
        assert!(!is_identifier("Energy[eu]"));
    }

    #[test]
    fn conditions_join_with_and() {
        let mut cond = Conditions::new();
        cond.between("SetID", 3, 9);
        cond.in_list("Chan", [1, 2]);
        cond.in_list("TRAI", Vec::<i64>::new());
        cond.raw(Some("  Amp > 100 OR Amp < 5 "));
        cond.raw(Some(""));

        assert_eq!(
            cond.where_clause(),
            " WHERE SetID BETWEEN ? AND ? AND Chan IN (?, ?) AND (Amp > 100 OR Amp < 5)"
        );
        assert_eq!(cond.params().len(), 4);
    }

    #[test]
    fn open_time_window_binds_one_side() {
        let mut cond = Conditions::new();
        cond.time_window("Time", Some(100), None);
        cond.in_list("Chan", [4]);
        let (clause, params) = cond.into_parts();
        assert_eq!(clause, "Time >= ? AND Chan IN (?)");
        assert_eq!(params, vec![Value::Integer(100), Value::Integer(4)]);

        let mut both = Conditions::new();
        both.time_window("d.Time", Some(1), Some(2));
        assert_eq!(both.sql(), "d.Time >= ? AND d.Time <= ?");
    }

    #[test]
    fn empty_conditions_have_no_where() {
        assert_eq!(Conditions::new().where_clause(), "");
    }

    #[test]
    fn filter_builder_accumulates() {
        let filter = ReadFilter::new()
            .channel(1)
            .channels([2, 3])
            .time(Some(0.5), None)
            .ids([7, 8])
            .sql("Amp > 1");
        assert_eq!(filter.channels, vec![1, 2, 3]);
        assert!(filter.has_time_window());
        assert_eq!(filter.ids, vec![7, 8]);
        assert_eq!(filter.sql.as_deref(), Some("Amp > 1"));
    }
}
