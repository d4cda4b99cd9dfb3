use std::str::FromStr;

use chrono::{DateTime, Utc};
use parkrev_core::{format_store_timestamp, NormalizedRecord, RecordError, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

mod fiserv;
mod flowbird;
mod hub;
mod passport;

pub use fiserv::FiservAdapter;
pub use flowbird::{FlowbirdPaymentsAdapter, FlowbirdTransactionsAdapter};
pub use hub::{HubAdapter, HubChannel};
pub use passport::PassportAdapter;

pub const UNKNOWN_LOCATION: &str = "Unknown Location";

/// Inclusive meter-id range sharing a location label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterLocation {
    pub first: i64,
    pub last: i64,
    pub name: String,
}

pub fn location_name(locations: &[MeterLocation], meter_id: i64) -> &str {
    locations
        .iter()
        .find(|loc| (loc.first..=loc.last).contains(&meter_id))
        .map(|loc| loc.name.as_str())
        .unwrap_or(UNKNOWN_LOCATION)
}

/// Parse `$1,234.50`-style currency text. Blank yields `None`.
pub fn parse_amount(text: &str) -> Option<Result<Decimal, rust_decimal::Error>> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Some(Decimal::from_str(&cleaned).or_else(|_| Decimal::from_scientific(&cleaned)))
}

pub(crate) fn amount_field(
    record: &NormalizedRecord,
    canonical: &str,
) -> Result<Option<Decimal>, RecordError> {
    let Some(text) = record.text(canonical) else {
        return Ok(None);
    };
    match parse_amount(&text) {
        None => Ok(None),
        Some(Ok(amount)) => Ok(Some(amount)),
        Some(Err(err)) => Err(RecordError::invalid(
            record.column_for(canonical),
            text,
            err.to_string(),
        )),
    }
}

pub(crate) fn require_amount(record: &NormalizedRecord, canonical: &str) -> Result<Decimal, RecordError> {
    amount_field(record, canonical)?.ok_or_else(|| RecordError::MissingField {
        field: record.column_for(canonical).to_string(),
    })
}

/// Cents-rounded JSON number. Goes through text so `2.05` lands on the nearest `f64`.
pub(crate) fn decimal_value(amount: Decimal) -> Value {
    amount
        .round_dp(2)
        .to_string()
        .parse::<f64>()
        .ok()
        .map(float_value)
        .unwrap_or(Value::Null)
}

pub(crate) fn float_value(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

pub(crate) fn timestamp_value(ts: Option<DateTime<Utc>>) -> Value {
    ts.map(|ts| Value::String(format_store_timestamp(ts)))
        .unwrap_or(Value::Null)
}

/// Builder for the row written to the operational store.
#[derive(Debug, Default)]
pub(crate) struct RowBuilder {
    row: Row,
}

impl RowBuilder {
    pub(crate) fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.row.insert(column.to_string(), value.into());
        self
    }

    pub(crate) fn build(self) -> Row {
        self.row
    }
}

pub(crate) fn integer_field(record: &NormalizedRecord, canonical: &str, text: &str) -> Result<i64, RecordError> {
    parkrev_core::parse_int(text).ok_or_else(|| {
        RecordError::invalid(record.column_for(canonical), text, "expected an integer")
    })
}
