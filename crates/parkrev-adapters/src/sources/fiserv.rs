use parkrev_core::{DedupPolicy, KeyedRecord, NormalizedRecord, RecordError, SourceKind};

use super::{decimal_value, integer_field, require_amount, timestamp_value, RowBuilder};
use crate::keys::{match_field, settlement_id, IdScheme};
use crate::mapping::SchemaMapping;
use crate::SourceAdapter;

const NEEDED: &[&str] = &[
    "invoice_id",
    "card_number",
    "transaction_date",
    "meter_id",
    "batch_number",
    "batch_sequence_number",
    "amount",
];

/// Only the trailing digits of the processor location id identify the account.
const ACCOUNT_DIGITS: usize = 3;

/// Processor settlement reports.
#[derive(Debug, Clone)]
pub struct FiservAdapter {
    mapping: SchemaMapping,
    id_scheme: IdScheme,
}

impl FiservAdapter {
    pub fn new(mapping: SchemaMapping, id_scheme: IdScheme) -> Self {
        Self { mapping, id_scheme }
    }
}

fn account_number(record: &NormalizedRecord) -> Result<Option<i64>, RecordError> {
    let Some(location) = record.text("account") else {
        return Ok(None);
    };
    let digits: Vec<char> = location.chars().collect();
    let tail: String = digits[digits.len().saturating_sub(ACCOUNT_DIGITS)..]
        .iter()
        .collect();
    integer_field(record, "account", &tail).map(Some)
}

impl SourceAdapter for FiservAdapter {
    fn source_id(&self) -> &'static str {
        "fiserv"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Settlement
    }

    fn default_table(&self) -> &'static str {
        "fiserv_reports_raw"
    }

    fn default_dedup(&self) -> DedupPolicy {
        DedupPolicy::FirstWins
    }

    fn needed_fields(&self) -> &'static [&'static str] {
        NEEDED
    }

    fn mapping(&self) -> &SchemaMapping {
        &self.mapping
    }

    fn derive_keys(&self, record: &NormalizedRecord) -> Result<KeyedRecord, RecordError> {
        let invoice = record.require_int("invoice_id")?;
        let card = record.require_text("card_number")?;
        let meter_id = record.require_int("meter_id")?;
        let batch = record.require_int("batch_number")?;
        let sequence = record.require_int("batch_sequence_number")?;
        let transaction_date = record.require_timestamp("transaction_date")?;
        let amount = require_amount(record, "amount")?;
        let submit_date = record.optional_timestamp("submit_date")?;
        let funded_date = record
            .optional_timestamp("funded_date")?
            .unwrap_or(transaction_date);
        let account = account_number(record)?;

        let row = RowBuilder::default()
            .set("invoice_id", invoice)
            .set("transaction_date", timestamp_value(Some(transaction_date)))
            .set("transaction_type", record.text("transaction_type"))
            .set("meter_id", meter_id)
            .set("batch_number", batch)
            .set("batch_sequence_number", sequence)
            .set("submit_date", timestamp_value(submit_date))
            .set("funded_date", timestamp_value(Some(funded_date)))
            .set("amount", decimal_value(amount))
            .set("transaction_status", record.text("transaction_status"))
            .set("account", account)
            .build();

        Ok(KeyedRecord::new(
            settlement_id(self.id_scheme, batch, sequence, invoice),
            Some(match_field(&card, invoice)),
            row,
        ))
    }
}
