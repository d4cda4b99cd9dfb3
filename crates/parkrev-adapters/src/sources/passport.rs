use parkrev_core::{DedupPolicy, KeyedRecord, NormalizedRecord, RecordError, SourceKind};
use serde_json::Value;

use super::{amount_field, decimal_value, float_value, require_amount, timestamp_value, RowBuilder};
use crate::mapping::SchemaMapping;
use crate::SourceAdapter;

const NEEDED: &[&str] = &["transaction_number", "zone_id", "amount", "start_time"];

/// Zones whose id carries this marker are operator test zones.
const TEST_ZONE_MARKER: &str = "AUS";

const PAYMENT_RENAMES: &[(&str, &str)] = &[
    ("Credit/Debit Card", "App - Credit Card"),
    ("Zone Cash", "App - Wallet"),
    ("Validation", "App - Validation"),
    ("Free", "App - Free"),
    ("Network Token", "App - Network Token"),
];

fn rename_payment(payment: String) -> String {
    PAYMENT_RENAMES
        .iter()
        .find(|(from, _)| *from == payment)
        .map(|(_, to)| to.to_string())
        .unwrap_or(payment)
}

/// Mobile-app parking sessions.
#[derive(Debug, Clone)]
pub struct PassportAdapter {
    mapping: SchemaMapping,
}

impl PassportAdapter {
    pub fn new(mapping: SchemaMapping) -> Self {
        Self { mapping }
    }
}

impl SourceAdapter for PassportAdapter {
    fn source_id(&self) -> &'static str {
        "passport"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::AppTransaction
    }

    fn default_table(&self) -> &'static str {
        "passport_transactions_raw"
    }

    fn default_dedup(&self) -> DedupPolicy {
        DedupPolicy::LastWins
    }

    fn needed_fields(&self) -> &'static [&'static str] {
        NEEDED
    }

    fn mapping(&self) -> &SchemaMapping {
        &self.mapping
    }

    fn accept(&self, record: &NormalizedRecord) -> bool {
        !record
            .text("zone_id")
            .is_some_and(|zone| zone.contains(TEST_ZONE_MARKER))
    }

    fn derive_keys(&self, record: &NormalizedRecord) -> Result<KeyedRecord, RecordError> {
        let id = record.require_text("transaction_number")?;
        let zone_id = record.value("zone_id").cloned().unwrap_or(Value::Null);
        let start_time = record.require_timestamp("start_time")?;
        let end_time = record.optional_timestamp("end_time")?;
        let amount = require_amount(record, "amount")?;
        let net_revenue = amount_field(record, "net_revenue")?;
        let duration_min = end_time
            .map(|end| (end - start_time).num_seconds().max(0) as f64 / 60.0)
            .map(float_value)
            .unwrap_or(Value::Null);
        let source = match record.text("method") {
            Some(method) => format!("Passport - {method}"),
            None => "Passport".to_string(),
        };

        let row = RowBuilder::default()
            .set("zone_id", zone_id)
            .set("zone_group", record.text("zone_group"))
            .set(
                "payment_method",
                record.text("payment_type").map(rename_payment),
            )
            .set("transaction_date", timestamp_value(Some(start_time)))
            .set("start_time", timestamp_value(Some(start_time)))
            .set("end_time", timestamp_value(end_time))
            .set("duration_min", duration_min)
            .set("amount", decimal_value(amount))
            .set("net_revenue", net_revenue.map(decimal_value).unwrap_or(Value::Null))
            .set("source", source)
            .build();

        Ok(KeyedRecord::new(id, None, row))
    }
}
