//! Identifier and correlation-key construction shared by the source adapters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Width the banking id is zero-padded to before joining with the terminal suffix.
pub const BANKING_ID_WIDTH: usize = 6;
/// Number of trailing terminal-code characters that prefix an invoice number.
pub const TERMINAL_SUFFIX_LEN: usize = 4;

const MASK_PLACEHOLDER: char = 'x';
const HASH_FIELD_SEPARATOR: u8 = 0x1f;

/// How a settlement record's `id` is composed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdScheme {
    /// `batch-invoice`. Sequence numbers drift between redeliveries, so they stay out.
    #[default]
    BatchInvoice,
    /// `batch-sequence-invoice`, for feeds whose sequence numbers are stable.
    BatchSequenceInvoice,
}

pub fn settlement_id(scheme: IdScheme, batch: i64, sequence: i64, invoice: i64) -> String {
    match scheme {
        IdScheme::BatchInvoice => format!("{batch}-{invoice}"),
        IdScheme::BatchSequenceInvoice => format!("{batch}-{sequence}-{invoice}"),
    }
}

/// Normalise every masking character to `x` so differently-masked cards compare equal.
pub fn mask_card(card: &str) -> String {
    card.trim()
        .chars()
        .map(|c| match c {
            '*' | 'X' | 'x' => MASK_PLACEHOLDER,
            other => other,
        })
        .collect()
}

pub fn match_field(card: &str, local_id: impl std::fmt::Display) -> String {
    format!("{}-{}", mask_card(card), local_id)
}

/// Banking id as a fixed-width string; `0` means no banking id was issued.
pub fn pad_banking_id(banking_id: i64) -> Option<String> {
    (banking_id > 0).then(|| format!("{banking_id:0width$}", width = BANKING_ID_WIDTH))
}

/// Last four terminal characters followed by the padded banking id, read as an integer.
///
/// `None` when no banking id was issued or the composite is not numeric.
pub fn invoice_number(terminal_code: &str, banking_id: i64) -> Option<i64> {
    let banking = pad_banking_id(banking_id)?;
    let terminal = terminal_code.trim();
    let suffix_start = terminal
        .char_indices()
        .rev()
        .nth(TERMINAL_SUFFIX_LEN - 1)
        .map(|(index, _)| index)
        .unwrap_or(0);
    let composite = format!("{}{}", &terminal[suffix_start..], banking);
    if !composite.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    composite.parse().ok()
}

/// Hex SHA-256 over the salt and each part, separated so `("ab","c")` and `("a","bc")` differ.
pub fn salted_hash(salt: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    for part in parts {
        hasher.update([HASH_FIELD_SEPARATOR]);
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
