//! Declarative vendor-column to canonical-field tables, one per source revision.

use std::collections::BTreeSet;
use std::path::Path;

use parkrev_core::{value_as_text, NormalizedRecord, RawRecord, RecordError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("no built-in mapping for source `{source_id}`")]
    UnknownSource { source_id: String },
    #[error("source `{source_id}` has no mapping revision `{revision}` (known: {known})")]
    UnknownRevision {
        source_id: String,
        revision: String,
        known: String,
    },
    #[error("reading mapping file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing mapping {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("mapping revision {revision} is invalid: {reason}")]
    Invalid { revision: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub external: String,
    pub canonical: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub revision: String,
    pub fields: Vec<FieldMapping>,
}

struct BuiltinMapping {
    source_id: &'static str,
    revision: &'static str,
    yaml: &'static str,
}

const FISERV_2021: &str = include_str!("../mappings/fiserv-2021.yaml");
const FISERV_2023: &str = include_str!("../mappings/fiserv-2023.yaml");
const FLOWBIRD_PAYMENTS: &str = include_str!("../mappings/flowbird-payments.yaml");
const FLOWBIRD_TRANSACTIONS: &str = include_str!("../mappings/flowbird-transactions.yaml");
const FLOWBIRD_HUB_TVM: &str = include_str!("../mappings/flowbird-hub-tvm.yaml");
const FLOWBIRD_HUB_WEB: &str = include_str!("../mappings/flowbird-hub-web.yaml");
const PASSPORT: &str = include_str!("../mappings/passport.yaml");

// Ordered oldest to newest within a source; the last entry is the default.
const BUILTIN_MAPPINGS: &[BuiltinMapping] = &[
    BuiltinMapping { source_id: "fiserv", revision: "2021", yaml: FISERV_2021 },
    BuiltinMapping { source_id: "fiserv", revision: "2023", yaml: FISERV_2023 },
    BuiltinMapping { source_id: "flowbird_payments", revision: "2021", yaml: FLOWBIRD_PAYMENTS },
    BuiltinMapping { source_id: "flowbird_transactions", revision: "2021", yaml: FLOWBIRD_TRANSACTIONS },
    BuiltinMapping { source_id: "flowbird_hub_tvm", revision: "2022", yaml: FLOWBIRD_HUB_TVM },
    BuiltinMapping { source_id: "flowbird_hub_web", revision: "2022", yaml: FLOWBIRD_HUB_WEB },
    BuiltinMapping { source_id: "flowbird_hub_mobile", revision: "2022", yaml: FLOWBIRD_HUB_WEB },
    BuiltinMapping { source_id: "passport", revision: "2022", yaml: PASSPORT },
];

pub fn builtin_revisions(source_id: &str) -> Vec<&'static str> {
    BUILTIN_MAPPINGS
        .iter()
        .filter(|m| m.source_id == source_id)
        .map(|m| m.revision)
        .collect()
}

/// Built-in mapping for a source; `None` picks the newest revision.
pub fn builtin_mapping(source_id: &str, revision: Option<&str>) -> Result<SchemaMapping, MappingError> {
    let candidates: Vec<&BuiltinMapping> = BUILTIN_MAPPINGS
        .iter()
        .filter(|m| m.source_id == source_id)
        .collect();
    let chosen = match revision {
        None => candidates.last().copied(),
        Some(wanted) => candidates.iter().copied().find(|m| m.revision == wanted),
    };
    let Some(chosen) = chosen else {
        return Err(match revision {
            Some(wanted) if !candidates.is_empty() => MappingError::UnknownRevision {
                source_id: source_id.to_string(),
                revision: wanted.to_string(),
                known: builtin_revisions(source_id).join(", "),
            },
            _ => MappingError::UnknownSource {
                source_id: source_id.to_string(),
            },
        });
    };
    SchemaMapping::from_yaml(chosen.yaml, &format!("{}@{}", chosen.source_id, chosen.revision))
}

impl SchemaMapping {
    pub fn from_yaml(text: &str, origin: &str) -> Result<Self, MappingError> {
        serde_yaml::from_str(text).map_err(|source| MappingError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, MappingError> {
        let text = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text, &path.display().to_string())
    }

    /// Reject empty tables, duplicated names and tables that omit a field the adapter reads.
    pub fn validate(&self, needed: &[&str]) -> Result<(), MappingError> {
        let invalid = |reason: String| MappingError::Invalid {
            revision: self.revision.clone(),
            reason,
        };
        if self.fields.is_empty() {
            return Err(invalid("no fields".into()));
        }
        let mut externals = BTreeSet::new();
        let mut canonicals = BTreeSet::new();
        for field in &self.fields {
            if field.external.trim().is_empty() || field.canonical.trim().is_empty() {
                return Err(invalid("blank field name".into()));
            }
            if !externals.insert(field.external.as_str()) {
                return Err(invalid(format!("external column `{}` mapped twice", field.external)));
            }
            if !canonicals.insert(field.canonical.as_str()) {
                return Err(invalid(format!("canonical field `{}` mapped twice", field.canonical)));
            }
        }
        for name in needed {
            if !canonicals.contains(name) {
                return Err(invalid(format!("missing canonical field `{name}`")));
            }
        }
        Ok(())
    }

    pub fn external_for(&self, canonical: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.canonical == canonical)
            .map(|f| f.external.as_str())
    }

    /// Rename vendor columns to canonical names. Unmapped columns are dropped.
    pub fn apply(&self, source_id: &str, raw: &RawRecord) -> Result<NormalizedRecord, RecordError> {
        let mut record = NormalizedRecord::new(source_id);
        for field in &self.fields {
            let value = raw.get(&field.external).cloned().unwrap_or(Value::Null);
            let present = match &value {
                Value::Null => false,
                Value::Array(_) | Value::Object(_) => true,
                scalar => value_as_text(scalar).is_some(),
            };
            if field.required && !present {
                return Err(RecordError::MissingField {
                    field: field.external.clone(),
                });
            }
            record.insert(&field.canonical, &field.external, value);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_builtin_mapping_parses_and_validates() {
        for builtin in BUILTIN_MAPPINGS {
            let mapping = builtin_mapping(builtin.source_id, Some(builtin.revision)).unwrap();
            mapping.validate(&[]).unwrap();
        }
    }

    #[test]
    fn fiserv_revisions_map_date_columns_differently() {
        let old = builtin_mapping("fiserv", Some("2021")).unwrap();
        let new = builtin_mapping("fiserv", None).unwrap();
        assert_eq!(new.revision, "2023");
        assert_eq!(old.external_for("funded_date"), Some("Funded Date"));
        assert_eq!(new.external_for("funded_date"), Some("Record Date"));
        assert_eq!(new.external_for("submit_date"), Some("Batch Date"));
        assert_eq!(builtin_revisions("fiserv"), vec!["2021", "2023"]);
    }

    #[test]
    fn unknown_source_and_revision_are_distinguished() {
        assert!(matches!(
            builtin_mapping("nope", None),
            Err(MappingError::UnknownSource { .. })
        ));
        assert!(matches!(
            builtin_mapping("fiserv", Some("1999")),
            Err(MappingError::UnknownRevision { .. })
        ));
    }

    #[test]
    fn validation_rejects_duplicates_and_missing_needed_fields() {
        let dup = SchemaMapping::from_yaml(
            "revision: x\nfields:\n  - { external: A, canonical: a }\n  - { external: A, canonical: b }\n",
            "test",
        )
        .unwrap();
        assert!(dup.validate(&[]).is_err());

        let dup_canonical = SchemaMapping::from_yaml(
            "revision: x\nfields:\n  - { external: A, canonical: a }\n  - { external: B, canonical: a }\n",
            "test",
        )
        .unwrap();
        assert!(dup_canonical.validate(&[]).is_err());

        let thin = SchemaMapping::from_yaml("revision: x\nfields:\n  - { external: A, canonical: a }\n", "test")
            .unwrap();
        assert!(thin.validate(&["a"]).is_ok());
        assert!(thin.validate(&["a", "id"]).is_err());

        let empty = SchemaMapping::from_yaml("revision: x\nfields: []\n", "test").unwrap();
        assert!(empty.validate(&[]).is_err());
    }

    #[test]
    fn apply_renames_drops_unmapped_and_rejects_blank_required() {
        let mapping = SchemaMapping::from_yaml(
            "revision: x\nfields:\n  - { external: 'Terminal ID', canonical: meter_id }\n  - { external: Note, canonical: note, required: false }\n",
            "test",
        )
        .unwrap();
        let raw = RawRecord::new(
            json!({ "Terminal ID": 1234, "PLATE_NUMBER": "ABC123" })
                .as_object()
                .cloned()
                .unwrap(),
        );
        let record = mapping.apply("s", &raw).unwrap();
        assert_eq!(record.value("meter_id"), Some(&json!(1234)));
        assert!(record.fields().get("PLATE_NUMBER").is_none());
        assert_eq!(record.value("note"), None);

        let blank = RawRecord::new(json!({ "Terminal ID": "  " }).as_object().cloned().unwrap());
        assert_eq!(
            mapping.apply("s", &blank),
            Err(RecordError::MissingField {
                field: "Terminal ID".into()
            })
        );
    }

    #[test]
    fn mapping_files_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.yaml");
        std::fs::write(&path, FISERV_2021).unwrap();
        let mapping = SchemaMapping::load(&path).unwrap();
        assert_eq!(mapping.revision, "2021");
        assert!(SchemaMapping::load(&dir.path().join("missing.yaml")).is_err());
    }
}
