//! Core domain model and record normalization for SOQI.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "soqi-core";

/// Question as delivered by the source API. The schema is mostly open:
/// only the fields the sync logic touches are named, everything else rides
/// along in `extra` and is passed through unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawQuestion {
    pub question_id: u64,
    /// Epoch seconds assigned by the source; `None` only for malformed
    /// payloads, which the normalizer rejects.
    pub creation_date: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// Cleaned record suitable for indexing. Carries both the human-readable
/// creation instant and the original epoch value; the latter is the only
/// field watermark queries touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionDocument {
    pub question_id: u64,
    pub creation_date: NaiveDateTime,
    pub creation_timestamp: i64,
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// Named field-exclusion list applied during normalization.
#[derive(Debug, Clone)]
pub struct FieldPolicy {
    pub excluded_fields: Vec<String>,
}

impl FieldPolicy {
    pub fn new(excluded_fields: Vec<String>) -> Self {
        Self { excluded_fields }
    }
}

impl Default for FieldPolicy {
    fn default() -> Self {
        Self {
            excluded_fields: vec!["owner".to_string()],
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("question {question_id} is missing a creation date")]
    MissingCreationDate { question_id: u64 },
    #[error("question {question_id} has creation date {epoch} outside the representable range")]
    CreationDateOutOfRange { question_id: u64, epoch: i64 },
}

/// Normalize one raw question: drop excluded fields, keep the original
/// epoch value in `creation_timestamp`, and replace the creation field
/// with a UTC datetime derived from it.
pub fn normalize_question(
    raw: RawQuestion,
    policy: &FieldPolicy,
) -> Result<QuestionDocument, NormalizeError> {
    let epoch = raw
        .creation_date
        .ok_or(NormalizeError::MissingCreationDate {
            question_id: raw.question_id,
        })?;
    let creation_date = DateTime::from_timestamp(epoch, 0)
        .ok_or(NormalizeError::CreationDateOutOfRange {
            question_id: raw.question_id,
            epoch,
        })?
        .naive_utc();

    let mut extra = raw.extra;
    for field in &policy.excluded_fields {
        extra.remove(field);
    }

    Ok(QuestionDocument {
        question_id: raw.question_id,
        creation_date,
        creation_timestamp: epoch,
        tags: raw.tags,
        extra,
    })
}

/// Normalize a whole fetched batch. A single malformed record fails the
/// batch with no partial output; the output schema needs every record's
/// timestamp for future watermark queries.
pub fn normalize_batch(
    raw: Vec<RawQuestion>,
    policy: &FieldPolicy,
) -> Result<Vec<QuestionDocument>, NormalizeError> {
    raw.into_iter().map(|q| normalize_question(q, policy)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mk_raw(id: u64, epoch: i64) -> RawQuestion {
        let mut extra = BTreeMap::new();
        extra.insert("title".to_string(), json!("Convert a dict to a DataFrame"));
        extra.insert("score".to_string(), json!(12));
        extra.insert(
            "owner".to_string(),
            json!({"user_id": 42, "display_name": "someone"}),
        );
        RawQuestion {
            question_id: id,
            creation_date: Some(epoch),
            tags: vec!["pandas".to_string()],
            extra,
        }
    }

    #[test]
    fn owner_is_stripped_and_the_timestamp_is_split() {
        let doc = normalize_question(mk_raw(1, 1_600_000_000), &FieldPolicy::default()).unwrap();
        assert_eq!(doc.question_id, 1);
        assert_eq!(doc.creation_timestamp, 1_600_000_000);
        assert_eq!(doc.creation_date.to_string(), "2020-09-13 12:26:40");
        assert!(!doc.extra.contains_key("owner"));
        assert_eq!(doc.extra.get("score"), Some(&json!(12)));
        assert_eq!(doc.tags, vec!["pandas".to_string()]);
    }

    #[test]
    fn exclusion_list_is_configurable() {
        let policy = FieldPolicy::new(vec!["score".to_string()]);
        let doc = normalize_question(mk_raw(1, 100), &policy).unwrap();
        assert!(!doc.extra.contains_key("score"));
        assert!(doc.extra.contains_key("owner"));
    }

    #[test]
    fn missing_creation_date_fails_the_batch() {
        let mut bad = mk_raw(2, 0);
        bad.creation_date = None;
        let err = normalize_batch(vec![mk_raw(1, 100), bad], &FieldPolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MissingCreationDate { question_id: 2 }
        ));
    }

    #[test]
    fn raw_question_captures_unknown_source_fields() {
        let raw: RawQuestion = serde_json::from_str(
            r#"{
                "question_id": 7,
                "creation_date": 300,
                "tags": ["pandas"],
                "title": "groupby question",
                "is_answered": true,
                "view_count": 9
            }"#,
        )
        .unwrap();
        assert_eq!(raw.question_id, 7);
        assert_eq!(raw.creation_date, Some(300));
        assert_eq!(raw.extra.get("view_count"), Some(&json!(9)));
    }

    #[test]
    fn normalized_document_serializes_both_timestamp_fields() {
        let doc = normalize_question(mk_raw(1, 1_600_000_000), &FieldPolicy::default()).unwrap();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["creation_timestamp"], json!(1_600_000_000));
        assert_eq!(value["creation_date"], json!("2020-09-13T12:26:40"));
        assert!(value.get("owner").is_none());
    }
}
