//! PII-free event representation
//!
//! The only form of an event that is ever persisted or logged. Customer
//! emails, names, addresses, payment method details and free-form metadata
//! never leave the request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventEnvelope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub livemode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_due: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl SanitizedPayload {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "id": self.id }))
    }
}

/// Reduce a verified event to the allow-listed fields.
pub fn sanitize(envelope: &EventEnvelope) -> SanitizedPayload {
    let object = &envelope.data.object;

    SanitizedPayload {
        id: envelope.id.clone(),
        event_type: envelope.event_type.clone(),
        created: envelope.created,
        livemode: envelope.livemode,
        api_version: envelope.api_version.clone(),
        object_id: string_field(object, "id"),
        object_type: string_field(object, "object"),
        subscription_id: id_field(object, "subscription"),
        customer_id: id_field(object, "customer"),
        status: string_field(object, "status"),
        amount_paid: object.get("amount_paid").and_then(Value::as_i64),
        amount_due: object.get("amount_due").and_then(Value::as_i64),
        currency: string_field(object, "currency"),
    }
}

fn string_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Expandable references contribute only their id, never the expanded object.
fn id_field(object: &Value, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(id) => Some(id.clone()),
        Value::Object(expanded) => expanded
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
