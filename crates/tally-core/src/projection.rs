//! Per-category payload projections.
//!
//! Each category's intake payload nests its subject under a different key
//! (`source`, `gate`, `flag`) with category-specific fields. A projection
//! deserializes that shape into typed structs and flattens it into the fixed
//! row shape: actor, subject, action, timestamp, plus a small attribute map
//! that is stored as JSON and passed through rollups untouched.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, TallyError};

/// Opaque per-category fields carried alongside a row.
pub type Attributes = BTreeMap<String, Value>;

/// Signature every category registers for turning a payload into a row.
pub type ProjectFn = fn(&Value) -> Result<Projection>;

/// A payload flattened into the fixed row shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub actor_id: i64,
    pub subject_id: i64,
    pub action: String,
    pub occurred_at: i64,
    pub attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    credential: CredentialRef,
    action: String,
    created: i64,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Deserialize)]
struct CredentialRef {
    id: i64,
}

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<Envelope<T>> {
    Envelope::<T>::deserialize(payload).map_err(|err| TallyError::MalformedPayload(err.to_string()))
}

// ---------------------------------------------------------------------------
// profile:source
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SourceBody {
    source: SourceRef,
}

#[derive(Debug, Deserialize)]
struct SourceRef {
    id: i64,
    name: String,
    #[serde(default)]
    tags: SourceTags,
}

#[derive(Debug, Default, Deserialize)]
struct SourceTags {
    #[serde(default)]
    sso: Value,
}

/// `profile:source`: provider name and whether the source was an SSO login.
///
/// Only a literal `true` counts as SSO; strings such as `"true"` do not.
pub fn project_source(payload: &Value) -> Result<Projection> {
    let envelope = parse::<SourceBody>(payload)?;
    let source = envelope.body.source;

    let mut attributes = Attributes::new();
    attributes.insert("provider".to_string(), Value::String(source.name));
    attributes.insert(
        "sso".to_string(),
        Value::Bool(source.tags.sso == Value::Bool(true)),
    );

    Ok(Projection {
        actor_id: envelope.credential.id,
        subject_id: source.id,
        action: envelope.action,
        occurred_at: envelope.created,
        attributes,
    })
}

// ---------------------------------------------------------------------------
// profile:gate
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GateBody {
    gate: GateRef,
}

#[derive(Debug, Deserialize)]
struct GateRef {
    id: i64,
    name: String,
    #[serde(default)]
    pass: Value,
    #[serde(default)]
    confidence_level: Option<String>,
}

/// `profile:gate`: gate name, pass flag, and optional confidence level.
pub fn project_gate(payload: &Value) -> Result<Projection> {
    let envelope = parse::<GateBody>(payload)?;
    let gate = envelope.body.gate;

    let mut attributes = Attributes::new();
    attributes.insert("name".to_string(), Value::String(gate.name));
    attributes.insert("pass".to_string(), Value::Bool(gate.pass == Value::Bool(true)));
    if let Some(level) = gate.confidence_level {
        attributes.insert("confidence_level".to_string(), Value::String(level));
    }

    Ok(Projection {
        actor_id: envelope.credential.id,
        subject_id: gate.id,
        action: envelope.action,
        occurred_at: envelope.created,
        attributes,
    })
}

// ---------------------------------------------------------------------------
// profile:flag
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FlagBody {
    flag: FlagRef,
}

#[derive(Debug, Deserialize)]
struct FlagRef {
    id: i64,
    slug: String,
    #[serde(default)]
    attribute: Option<String>,
}

/// `profile:flag`: flag slug and the attribute it was raised on, if any.
pub fn project_flag(payload: &Value) -> Result<Projection> {
    let envelope = parse::<FlagBody>(payload)?;
    let flag = envelope.body.flag;

    let mut attributes = Attributes::new();
    attributes.insert("slug".to_string(), Value::String(flag.slug));
    if let Some(attribute) = flag.attribute {
        attributes.insert("attribute".to_string(), Value::String(attribute));
    }

    Ok(Projection {
        actor_id: envelope.credential.id,
        subject_id: flag.id,
        action: envelope.action,
        occurred_at: envelope.created,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn source_projection_flattens_nested_tags() {
        let payload = json!({
            "endpoint": "profile:source",
            "credential": {"id": 7, "public": "4c9184f37cff01bcdc32dc486ec36961"},
            "source": {"id": 12, "name": "facebook", "tags": {"sso": true, "profile_id": "x"}},
            "action": "created",
            "created": 1_700_000_000
        });

        let projection = project_source(&payload).expect("valid source payload");
        assert_eq!(projection.actor_id, 7);
        assert_eq!(projection.subject_id, 12);
        assert_eq!(projection.action, "created");
        assert_eq!(projection.occurred_at, 1_700_000_000);
        assert_eq!(projection.attributes["provider"], json!("facebook"));
        assert_eq!(projection.attributes["sso"], json!(true));
    }

    #[test]
    fn source_without_tags_is_not_sso() {
        let payload = json!({
            "credential": {"id": 7},
            "source": {"id": 12, "name": "email"},
            "action": "deleted",
            "created": 10
        });

        let projection = project_source(&payload).expect("tags are optional");
        assert_eq!(projection.attributes["sso"], json!(false));
    }

    #[test]
    fn only_literal_true_counts_as_sso() {
        let payload = json!({
            "credential": {"id": 7},
            "source": {"id": 12, "name": "email", "tags": {"sso": "true"}},
            "action": "created",
            "created": 10
        });

        let projection = project_source(&payload).expect("valid payload");
        assert_eq!(projection.attributes["sso"], json!(false));
    }

    #[test]
    fn gate_projection_keeps_confidence_level() {
        let payload = json!({
            "credential": {"id": 3},
            "gate": {"id": 44, "name": "18+", "pass": true, "confidence_level": "high"},
            "action": "updated",
            "created": 99
        });

        let projection = project_gate(&payload).expect("valid gate payload");
        assert_eq!(projection.subject_id, 44);
        assert_eq!(projection.attributes["name"], json!("18+"));
        assert_eq!(projection.attributes["pass"], json!(true));
        assert_eq!(projection.attributes["confidence_level"], json!("high"));
    }

    #[test]
    fn flag_projection_omits_missing_attribute() {
        let payload = json!({
            "credential": {"id": 3},
            "flag": {"id": 5, "slug": "suspicious"},
            "action": "created",
            "created": 99
        });

        let projection = project_flag(&payload).expect("valid flag payload");
        assert_eq!(projection.attributes["slug"], json!("suspicious"));
        assert!(!projection.attributes.contains_key("attribute"));
    }

    #[test]
    fn missing_nested_object_is_malformed() {
        let payload = json!({
            "credential": {"id": 3},
            "action": "created",
            "created": 99
        });

        let err = project_gate(&payload).expect_err("gate object is required");
        assert_eq!(err.code(), ErrorCode::MalformedPayload);
    }

    #[test]
    fn wrongly_typed_ids_are_malformed() {
        let payload = json!({
            "credential": {"id": "seven"},
            "flag": {"id": 5, "slug": "x"},
            "action": "created",
            "created": 99
        });

        let err = project_flag(&payload).expect_err("credential id must be an integer");
        assert!(matches!(err, TallyError::MalformedPayload(_)));
    }
}
