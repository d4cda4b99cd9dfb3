//! Core record model, canonical field names and time windows for parkrev.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "parkrev-core";

/// Row dictionary shared by the operational store and the public mirror.
pub type Row = Map<String, Value>;

pub const ID_FIELD: &str = "id";
pub const MATCH_FIELD: &str = "match_field";
pub const FLOWBIRD_ID_FIELD: &str = "flowbird_id";
pub const UPDATED_AT_FIELD: &str = "updated_at";
pub const TRANSACTION_DATE_FIELD: &str = "transaction_date";

const STORE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FLOATING_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Settlement,
    MeterVendor,
    AppTransaction,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settlement => "settlement",
            Self::MeterVendor => "meter_vendor",
            Self::AppTransaction => "app_transaction",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which representative survives when a batch repeats an `id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Duplicates are data-entry noise; keep the first.
    #[default]
    FirstWins,
    /// Duplicates are redeliveries carrying updates; keep the last.
    LastWins,
}

/// A single-record failure: the record is skipped and reported, the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("missing required field `{field}`")]
    MissingField { field: String },
    #[error("invalid value {value:?} for `{field}`: {reason}")]
    InvalidField {
        field: String,
        value: String,
        reason: String,
    },
}

impl RecordError {
    pub fn invalid(field: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// One vendor record as delivered, keyed by the vendor's own column names.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    pub fields: Row,
}

impl RawRecord {
    pub fn new(fields: Row) -> Self {
        Self { fields }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }
}

impl From<Row> for RawRecord {
    fn from(fields: Row) -> Self {
        Self { fields }
    }
}

/// A record after schema mapping, keyed by canonical field names.
///
/// Remembers which vendor column each canonical field came from so that
/// errors name the column the vendor actually failed to deliver.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedRecord {
    pub source_id: String,
    fields: Row,
    origins: BTreeMap<String, String>,
}

impl NormalizedRecord {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            fields: Row::new(),
            origins: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, canonical: &str, external: &str, value: Value) {
        self.fields.insert(canonical.to_string(), value);
        self.origins.insert(canonical.to_string(), external.to_string());
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn value(&self, canonical: &str) -> Option<&Value> {
        self.fields.get(canonical).filter(|v| !v.is_null())
    }

    /// Vendor column a canonical field was read from.
    pub fn column_for<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.origins
            .get(canonical)
            .map(String::as_str)
            .unwrap_or(canonical)
    }

    pub fn text(&self, canonical: &str) -> Option<String> {
        self.value(canonical).and_then(value_as_text)
    }

    pub fn require_text(&self, canonical: &str) -> Result<String, RecordError> {
        self.text(canonical).ok_or_else(|| RecordError::MissingField {
            field: self.column_for(canonical).to_string(),
        })
    }

    pub fn require_int(&self, canonical: &str) -> Result<i64, RecordError> {
        let text = self.require_text(canonical)?;
        parse_int(&text).ok_or_else(|| {
            RecordError::invalid(self.column_for(canonical), text, "expected an integer")
        })
    }

    pub fn optional_int(&self, canonical: &str) -> Result<Option<i64>, RecordError> {
        match self.text(canonical) {
            None => Ok(None),
            Some(text) => parse_int(&text).map(Some).ok_or_else(|| {
                RecordError::invalid(self.column_for(canonical), text, "expected an integer")
            }),
        }
    }

    pub fn require_timestamp(&self, canonical: &str) -> Result<DateTime<Utc>, RecordError> {
        let value = self.value(canonical).ok_or_else(|| RecordError::MissingField {
            field: self.column_for(canonical).to_string(),
        })?;
        timestamp_from_value(value).ok_or_else(|| {
            RecordError::invalid(
                self.column_for(canonical),
                value_as_text(value).unwrap_or_default(),
                "unrecognised timestamp",
            )
        })
    }

    pub fn optional_timestamp(&self, canonical: &str) -> Result<Option<DateTime<Utc>>, RecordError> {
        match self.value(canonical) {
            None => Ok(None),
            Some(value) if value_as_text(value).is_none() => Ok(None),
            Some(_) => self.require_timestamp(canonical).map(Some),
        }
    }
}

/// Output of key derivation: the stable identifier, the optional cross-source
/// correlation key, and the row to be written to the operational store.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub id: String,
    pub match_field: Option<String>,
    pub row: Row,
}

impl KeyedRecord {
    pub fn new(id: String, match_field: Option<String>, mut row: Row) -> Self {
        row.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        if let Some(key) = &match_field {
            row.insert(MATCH_FIELD.to_string(), Value::String(key.clone()));
        }
        Self {
            id,
            match_field,
            row,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window start {start} is after window end {end}")]
    Inverted {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// How a missing start date is filled in when resolving a job window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDefault {
    Yesterday,
    Since(NaiveDate),
}

/// Inclusive `[start, end]` range over the `updated_at` watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Build a job window from optional calendar dates.
    ///
    /// An explicit date means 00:00:00 UTC of that day. A missing end is `now`.
    pub fn resolve(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        default_start: WindowDefault,
        now: DateTime<Utc>,
    ) -> Result<Self, WindowError> {
        let start = match (start, default_start) {
            (Some(date), _) => start_of_day(date),
            (None, WindowDefault::Yesterday) => now - Duration::days(1),
            (None, WindowDefault::Since(date)) => start_of_day(date),
        };
        let end = end.map(start_of_day).unwrap_or(now);
        Self::new(start, end)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

const ZONED_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %I:%M:%S %p",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Parse the timestamp spellings seen across vendors and the store.
///
/// Naive timestamps are read as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ZONED_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(input, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&ts));
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .map(start_of_day)
}

/// Timestamp from a JSON value: strings are parsed, integers are epoch seconds.
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_timestamp(text),
        Value::Number(number) => number
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

/// `YYYY-MM-DD HH:MM:SS`, the form written to the operational store.
pub fn format_store_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(STORE_TIMESTAMP_FORMAT).to_string()
}

/// `YYYY-MM-DDTHH:MM:SS`: second precision, no offset.
pub fn format_floating_timestamp(ts: NaiveDateTime) -> String {
    ts.format(FLOATING_TIMESTAMP_FORMAT).to_string()
}

/// Local time as written, ignoring any offset the text carries.
///
/// `2024-04-01T08:30:00-05:00` reads as `2024-04-01 08:30:00`; naive input is
/// taken as-is.
pub fn parse_wall_clock(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.naive_local());
    }
    for format in ZONED_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(input, format) {
            return Some(ts.naive_local());
        }
    }
    parse_timestamp(input).map(|ts| ts.naive_utc())
}

/// Wall-clock form of a JSON timestamp; integers are epoch seconds in UTC.
pub fn wall_clock_from_value(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(text) => parse_wall_clock(text),
        other => timestamp_from_value(other).map(|ts| ts.naive_utc()),
    }
}

/// Text form of a scalar JSON value; blank strings and non-scalars are `None`.
///
/// Whole floats render without a fraction, so `12345.0` from a spreadsheet
/// export reads the same as `12345`.
pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => {
            if number.is_i64() || number.is_u64() {
                return Some(number.to_string());
            }
            let float = number.as_f64()?;
            if float.is_finite() && float.fract() == 0.0 && float.abs() < 1e15 {
                Some(format!("{}", float as i64))
            } else {
                Some(number.to_string())
            }
        }
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    let float = text.parse::<f64>().ok()?;
    (float.is_finite() && float.fract() == 0.0 && float.abs() < 9.0e15).then_some(float as i64)
}

/// Numeric ordering when both ids are integers, lexicographic otherwise.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i128>(), b.parse::<i128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Ordering used when sorting rows by a column.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => {
            let x = value_as_text(x).unwrap_or_default();
            let y = value_as_text(y).unwrap_or_default();
            compare_ids(&x, &y)
        }
    }
}

/// Id of a row as text, if the row carries one.
pub fn row_id(row: &Row) -> Option<String> {
    row.get(ID_FIELD).and_then(value_as_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).single().unwrap()
    }

    #[test]
    fn parses_store_vendor_and_rfc3339_timestamps() {
        let expected = utc(2023, 5, 4, 13, 7, 9);
        assert_eq!(parse_timestamp("2023-05-04T13:07:09Z"), Some(expected));
        assert_eq!(parse_timestamp("2023-05-04 13:07:09"), Some(expected));
        assert_eq!(parse_timestamp("2023-05-04 13:07:09+00"), Some(expected));
        assert_eq!(parse_timestamp("2023-05-04T08:07:09-05:00"), Some(expected));
        assert_eq!(parse_timestamp("2023/05/04 01:07:09 PM"), Some(expected));
        assert_eq!(
            parse_timestamp("2023-05-04 13:07:09.123456+00:00").map(|t| t.timestamp()),
            Some(expected.timestamp())
        );
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp("   "), None);
    }

    #[test]
    fn numeric_values_are_epoch_seconds() {
        let ts = utc(2022, 1, 1, 0, 0, 0);
        assert_eq!(timestamp_from_value(&json!(ts.timestamp())), Some(ts));
        assert_eq!(timestamp_from_value(&json!(true)), None);
    }

    #[test]
    fn floating_format_drops_offset_and_fraction() {
        let ts = parse_timestamp("2024-02-29 23:59:58.999+00").unwrap();
        assert_eq!(format_floating_timestamp(ts.naive_utc()), "2024-02-29T23:59:58");
        assert_eq!(format_store_timestamp(ts), "2024-02-29 23:59:58");
    }

    #[test]
    fn wall_clock_keeps_the_written_local_time() {
        let expected = NaiveDate::from_ymd_opt(2024, 4, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(parse_wall_clock("2024-04-01T08:30:00-05:00"), Some(expected));
        assert_eq!(parse_wall_clock("2024-04-01 08:30:00.25-05"), Some(expected + Duration::milliseconds(250)));
        assert_eq!(parse_wall_clock("2024-04-01 08:30:00"), Some(expected));
        assert_eq!(wall_clock_from_value(&json!("2024-04-01T08:30:00+02:00")), Some(expected));
        assert_eq!(wall_clock_from_value(&json!("later")), None);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let window = TimeWindow::new(utc(2024, 1, 1, 0, 0, 0), utc(2024, 1, 2, 0, 0, 0)).unwrap();
        assert!(window.contains(utc(2024, 1, 1, 0, 0, 0)));
        assert!(window.contains(utc(2024, 1, 2, 0, 0, 0)));
        assert!(!window.contains(utc(2024, 1, 2, 0, 0, 1)));
        assert!(TimeWindow::new(window.end, window.start).is_err());
    }

    #[test]
    fn window_resolution_defaults() {
        let now = utc(2024, 3, 10, 15, 30, 0);
        let yesterday = TimeWindow::resolve(None, None, WindowDefault::Yesterday, now).unwrap();
        assert_eq!(yesterday.start, utc(2024, 3, 9, 15, 30, 0));
        assert_eq!(yesterday.end, now);

        let history = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
        let full = TimeWindow::resolve(None, None, WindowDefault::Since(history), now).unwrap();
        assert_eq!(full.start, utc(2022, 1, 1, 0, 0, 0));

        let explicit = TimeWindow::resolve(
            NaiveDate::from_ymd_opt(2024, 3, 1),
            NaiveDate::from_ymd_opt(2024, 3, 5),
            WindowDefault::Yesterday,
            now,
        )
        .unwrap();
        assert_eq!(explicit.start, utc(2024, 3, 1, 0, 0, 0));
        assert_eq!(explicit.end, utc(2024, 3, 5, 0, 0, 0));

        assert!(TimeWindow::resolve(
            NaiveDate::from_ymd_opt(2024, 3, 6),
            NaiveDate::from_ymd_opt(2024, 3, 5),
            WindowDefault::Yesterday,
            now,
        )
        .is_err());
    }

    #[test]
    fn ids_compare_numerically_when_possible() {
        assert_eq!(compare_ids("9", "10"), Ordering::Less);
        assert_eq!(compare_ids("abc", "abd"), Ordering::Less);
        assert_eq!(compare_ids("10", "10"), Ordering::Equal);
        assert_eq!(
            compare_values(Some(&json!("9")), Some(&json!("10"))),
            Ordering::Less
        );
        assert_eq!(compare_values(Some(&json!(2)), None), Ordering::Less);
    }

    #[test]
    fn text_values_normalise_spreadsheet_numbers() {
        assert_eq!(value_as_text(&json!(12345.0)), Some("12345".to_string()));
        assert_eq!(value_as_text(&json!(1.5)), Some("1.5".to_string()));
        assert_eq!(value_as_text(&json!("  ")), None);
        assert_eq!(value_as_text(&Value::Null), None);
        assert_eq!(parse_int("4096.0"), Some(4096));
        assert_eq!(parse_int("4096.5"), None);
    }

    #[test]
    fn keyed_record_writes_keys_into_row() {
        let keyed = KeyedRecord::new("7-42".into(), Some("xxxx1234-42".into()), Row::new());
        assert_eq!(keyed.row.get(ID_FIELD), Some(&json!("7-42")));
        assert_eq!(keyed.row.get(MATCH_FIELD), Some(&json!("xxxx1234-42")));
        assert_eq!(row_id(&keyed.row), Some("7-42".to_string()));
    }

    #[test]
    fn normalized_record_errors_name_vendor_column() {
        let mut record = NormalizedRecord::new("fiserv");
        record.insert("meter_id", "Terminal ID", json!("abc"));
        record.insert("batch_number", "Batch Number", Value::Null);

        assert_eq!(
            record.require_int("meter_id"),
            Err(RecordError::invalid("Terminal ID", "abc", "expected an integer"))
        );
        assert_eq!(
            record.require_text("batch_number"),
            Err(RecordError::MissingField {
                field: "Batch Number".into()
            })
        );
        assert_eq!(record.optional_int("batch_number"), Ok(None));
    }
}
