use parkrev_core::{DedupPolicy, KeyedRecord, NormalizedRecord, RecordError, SourceKind};

use super::{
    decimal_value, float_value, integer_field, location_name, require_amount, timestamp_value,
    MeterLocation, RowBuilder,
};
use crate::keys::{invoice_number, match_field};
use crate::mapping::SchemaMapping;
use crate::SourceAdapter;

const PAYMENTS_NEEDED: &[&str] = &[
    "banking_id",
    "meter_id",
    "card_number",
    "transaction_date",
    "amount",
];

const TRANSACTIONS_NEEDED: &[&str] = &[
    "system_id",
    "banking_id",
    "meter_id",
    "transaction_date",
    "amount",
];

/// Vendor spellings of card payment that mean the same thing.
const CARD_PAYMENT_ALIASES: &[&str] = &["CARD_1_0", "CARD_0_116"];

/// Invoice number for a meter record, or `None` when no banking id was issued.
fn meter_invoice(
    record: &NormalizedRecord,
    terminal: &str,
    banking_id: i64,
) -> Result<Option<i64>, RecordError> {
    if banking_id <= 0 {
        return Ok(None);
    }
    invoice_number(terminal, banking_id).map(Some).ok_or_else(|| {
        RecordError::invalid(
            record.column_for("meter_id"),
            terminal,
            "terminal code is not numeric",
        )
    })
}

/// Card payments reported by the meter vendor.
#[derive(Debug, Clone)]
pub struct FlowbirdPaymentsAdapter {
    mapping: SchemaMapping,
}

impl FlowbirdPaymentsAdapter {
    pub fn new(mapping: SchemaMapping) -> Self {
        Self { mapping }
    }
}

impl SourceAdapter for FlowbirdPaymentsAdapter {
    fn source_id(&self) -> &'static str {
        "flowbird_payments"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::MeterVendor
    }

    fn default_table(&self) -> &'static str {
        "flowbird_payments_raw"
    }

    fn default_dedup(&self) -> DedupPolicy {
        DedupPolicy::LastWins
    }

    fn needed_fields(&self) -> &'static [&'static str] {
        PAYMENTS_NEEDED
    }

    fn mapping(&self) -> &SchemaMapping {
        &self.mapping
    }

    fn derive_keys(&self, record: &NormalizedRecord) -> Result<KeyedRecord, RecordError> {
        let banking_id = record.require_int("banking_id")?;
        let terminal = record.require_text("meter_id")?;
        let invoice = meter_invoice(record, &terminal, banking_id)?.ok_or_else(|| {
            RecordError::MissingField {
                field: record.column_for("banking_id").to_string(),
            }
        })?;
        let meter_id = integer_field(record, "meter_id", &terminal)?;
        let card = record.require_text("card_number")?;
        let transaction_date = record.require_timestamp("transaction_date")?;
        let processed_date = record.optional_timestamp("processed_date")?;
        let amount = require_amount(record, "amount")?;

        let row = RowBuilder::default()
            .set("invoice_id", invoice)
            .set("card_type", record.text("card_type"))
            .set("meter_id", meter_id)
            .set("transaction_type", "Card")
            .set("transaction_date", timestamp_value(Some(transaction_date)))
            .set("transaction_status", record.text("transaction_status"))
            .set("remittance_status", record.text("remittance_status"))
            .set("processed_date", timestamp_value(processed_date))
            .set("amount", decimal_value(amount))
            .build();

        Ok(KeyedRecord::new(
            invoice.to_string(),
            Some(match_field(&card, invoice)),
            row,
        ))
    }
}

/// Meter parking sessions.
#[derive(Debug, Clone)]
pub struct FlowbirdTransactionsAdapter {
    mapping: SchemaMapping,
    locations: Vec<MeterLocation>,
}

impl FlowbirdTransactionsAdapter {
    pub fn new(mapping: SchemaMapping, locations: Vec<MeterLocation>) -> Self {
        Self { mapping, locations }
    }
}

fn normalize_payment_method(method: String) -> String {
    if CARD_PAYMENT_ALIASES.contains(&method.as_str()) {
        "CARD".to_string()
    } else {
        method
    }
}

impl SourceAdapter for FlowbirdTransactionsAdapter {
    fn source_id(&self) -> &'static str {
        "flowbird_transactions"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::MeterVendor
    }

    fn default_table(&self) -> &'static str {
        "flowbird_transactions_raw"
    }

    fn default_dedup(&self) -> DedupPolicy {
        DedupPolicy::LastWins
    }

    fn needed_fields(&self) -> &'static [&'static str] {
        TRANSACTIONS_NEEDED
    }

    fn mapping(&self) -> &SchemaMapping {
        &self.mapping
    }

    fn derive_keys(&self, record: &NormalizedRecord) -> Result<KeyedRecord, RecordError> {
        let system_id = record.require_text("system_id")?;
        let terminal = record.require_text("meter_id")?;
        let meter_id = integer_field(record, "meter_id", &terminal)?;
        let invoice = match record.optional_int("banking_id")? {
            Some(banking_id) => meter_invoice(record, &terminal, banking_id)?,
            None => None,
        };
        let timestamp = record.require_timestamp("transaction_date")?;
        let start_time = record.optional_timestamp("start_time")?;
        let end_time = record.optional_timestamp("end_time")?;
        let amount = require_amount(record, "amount")?;
        let duration_min = match record.text("duration_sec") {
            None => 0.0,
            Some(text) => {
                let seconds: f64 = text.parse().map_err(|_| {
                    RecordError::invalid(record.column_for("duration_sec"), text.clone(), "expected seconds")
                })?;
                seconds / 60.0
            }
        };

        let row = RowBuilder::default()
            .set("invoice_id", invoice)
            .set("transaction_type", record.text("transaction_type"))
            .set(
                "payment_method",
                record.text("payment_method").map(normalize_payment_method),
            )
            .set("meter_id", meter_id)
            .set("timestamp", timestamp_value(Some(timestamp)))
            .set("duration_min", float_value(duration_min))
            .set("start_time", timestamp_value(start_time))
            .set("end_time", timestamp_value(end_time))
            .set("amount", decimal_value(amount))
            .set("location_name", location_name(&self.locations, meter_id))
            .build();

        Ok(KeyedRecord::new(system_id, None, row))
    }
}
