use parkrev_core::{DedupPolicy, KeyedRecord, NormalizedRecord, RecordError, SourceKind};
use rust_decimal::Decimal;

use super::{amount_field, decimal_value, timestamp_value, RowBuilder};
use crate::keys::salted_hash;
use crate::mapping::SchemaMapping;
use crate::SourceAdapter;

const TVM_NEEDED: &[&str] = &["transaction_date", "amount_charged", "meter_id"];
const WEB_NEEDED: &[&str] = &["transaction_date", "amount_charged", "patron_name"];

const AMOUNT_FIELDS: &[&str] = &[
    "amount_charged",
    "amount_paid",
    "amount_refunded",
    "amount_returned",
    "amount_voucher",
];

const VOUCHER_PAYMENT: &str = "Voucher";

/// Flowbird HUB report channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubChannel {
    Tvm,
    Web,
    Mobile,
}

impl HubChannel {
    fn source_id(self) -> &'static str {
        match self {
            Self::Tvm => "flowbird_hub_tvm",
            Self::Web => "flowbird_hub_web",
            Self::Mobile => "flowbird_hub_mobile",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Tvm => "Flowbird HUB - TVM",
            Self::Web => "Flowbird HUB - Web",
            Self::Mobile => "Flowbird HUB - Mobile",
        }
    }

    /// Third component of the hashed id: the kiosk for TVM, the patron otherwise.
    fn identity_field(self) -> &'static str {
        match self {
            Self::Tvm => "meter_id",
            Self::Web | Self::Mobile => "patron_name",
        }
    }
}

/// HUB exports carry no stable transaction id, so one is hashed from three fields.
#[derive(Debug, Clone)]
pub struct HubAdapter {
    channel: HubChannel,
    mapping: SchemaMapping,
    salt: String,
}

impl HubAdapter {
    pub fn new(channel: HubChannel, mapping: SchemaMapping, salt: impl Into<String>) -> Self {
        Self {
            channel,
            mapping,
            salt: salt.into(),
        }
    }
}

impl SourceAdapter for HubAdapter {
    fn source_id(&self) -> &'static str {
        self.channel.source_id()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::MeterVendor
    }

    fn default_table(&self) -> &'static str {
        "flowbird_hub_transactions_raw"
    }

    fn default_dedup(&self) -> DedupPolicy {
        DedupPolicy::FirstWins
    }

    fn needed_fields(&self) -> &'static [&'static str] {
        match self.channel {
            HubChannel::Tvm => TVM_NEEDED,
            HubChannel::Web | HubChannel::Mobile => WEB_NEEDED,
        }
    }

    fn mapping(&self) -> &SchemaMapping {
        &self.mapping
    }

    fn derive_keys(&self, record: &NormalizedRecord) -> Result<KeyedRecord, RecordError> {
        let date_text = record.require_text("transaction_date")?;
        let transaction_date = record.require_timestamp("transaction_date")?;
        let charge_text = record.text("amount_charged").unwrap_or_default();
        let identity = record.require_text(self.channel.identity_field())?;
        let id = salted_hash(&self.salt, &[&date_text, &charge_text, &identity]);

        let mut row = RowBuilder::default()
            .set("source", self.channel.label())
            .set("transaction_date", timestamp_value(Some(transaction_date)))
            .set(
                "payment_method",
                record
                    .text("payment_method")
                    .unwrap_or_else(|| VOUCHER_PAYMENT.to_string()),
            )
            .set("status", record.text("status"));
        for field in AMOUNT_FIELDS {
            let amount = amount_field(record, field)?.unwrap_or(Decimal::ZERO);
            row = row.set(field, decimal_value(amount));
        }
        if self.channel == HubChannel::Tvm {
            row = row
                .set("meter_id", identity)
                .set("meter_name", record.text("meter_name"));
        }

        Ok(KeyedRecord::new(id, None, row.build()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::builtin_mapping;
    use parkrev_core::RawRecord;
    use serde_json::{json, Value};

    fn raw(value: Value) -> RawRecord {
        RawRecord::new(value.as_object().cloned().unwrap())
    }

    fn web(salt: &str) -> HubAdapter {
        HubAdapter::new(
            HubChannel::Web,
            builtin_mapping("flowbird_hub_web", None).unwrap(),
            salt,
        )
    }

    fn web_record() -> RawRecord {
        raw(json!({
            "Transaction Date": "2022-02-01 08:00:00",
            "Total Charge": "$3.00",
            "Patron Name": "Jordan Example",
            "Payment Mean": "",
            "Amount Paid": "$3.00",
            "Refunded": "",
            "Type": "Web"
        }))
    }

    #[test]
    fn hashed_id_is_stable_and_patron_is_not_stored() {
        let adapter = web("s3cret");
        let record = adapter.normalize(&web_record()).unwrap();
        let first = adapter.derive_keys(&record).unwrap();
        let again = web("s3cret").derive_keys(&record).unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.id, salted_hash("s3cret", &["2022-02-01 08:00:00", "$3.00", "Jordan Example"]));
        assert!(first.row.get("patron_name").is_none());
        assert!(!first.row.values().any(|v| v == &json!("Jordan Example")));
        assert_eq!(first.row["source"], json!("Flowbird HUB - Web"));
    }

    #[test]
    fn blank_payment_mean_is_voucher_and_blank_amounts_are_zero() {
        let adapter = web("salt");
        let keyed = adapter
            .derive_keys(&adapter.normalize(&web_record()).unwrap())
            .unwrap();
        assert_eq!(keyed.row["payment_method"], json!("Voucher"));
        assert_eq!(keyed.row["amount_charged"], json!(3.0));
        assert_eq!(keyed.row["amount_refunded"], json!(0.0));
        assert_eq!(keyed.row["amount_voucher"], json!(0.0));
    }

    #[test]
    fn tvm_hashes_machine_and_keeps_it() {
        let adapter = HubAdapter::new(
            HubChannel::Tvm,
            builtin_mapping("flowbird_hub_tvm", None).unwrap(),
            "salt",
        );
        let keyed = adapter
            .derive_keys(
                &adapter
                    .normalize(&raw(json!({
                        "Transaction Date": "2022-02-01 08:00:00",
                        "Total Charge": "$1.25",
                        "Machine ID": "PSTN-12",
                        "Machine Name": "Pay Station 12",
                        "Payment Mean": "Coins"
                    })))
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(keyed.id, salted_hash("salt", &["2022-02-01 08:00:00", "$1.25", "PSTN-12"]));
        assert_eq!(keyed.row["meter_id"], json!("PSTN-12"));
        assert_eq!(keyed.row["source"], json!("Flowbird HUB - TVM"));
        assert_eq!(keyed.row["amount_charged"], json!(1.25));
    }
}
