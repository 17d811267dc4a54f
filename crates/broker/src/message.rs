//! Call envelope and delivered payload

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// A call request as stored in a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Connection of the caller, used to route the result back
    #[serde(default)]
    pub conn_id: String,
    pub msg_id: String,
    /// Target service
    pub uri: String,
    /// Application arguments, opaque here
    #[serde(default)]
    pub body: serde_json::Value,
}

impl CallEnvelope {
    /// New envelope with a random message id
    pub fn new(uri: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            conn_id: String::new(),
            msg_id: Uuid::new_v4().to_string(),
            uri: uri.into(),
            body,
        }
    }

    pub fn with_conn_id(mut self, conn_id: impl Into<String>) -> Self {
        self.conn_id = conn_id.into();
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// A call that passed its expiry check and was handed to the consumer
///
/// Only constructible with a positive remaining TTL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallPayload {
    #[serde(flatten)]
    envelope: CallEnvelope,
    read_timestamp: DateTime<Utc>,
    #[serde(rename = "ttl_after_read_ms", serialize_with = "serialize_millis")]
    ttl_after_read: Duration,
}

impl CallPayload {
    /// `None` if `ttl_after_read` is zero
    pub(crate) fn checked(
        envelope: CallEnvelope,
        ttl_after_read: Duration,
        read_timestamp: DateTime<Utc>,
    ) -> Option<Self> {
        if ttl_after_read.is_zero() {
            return None;
        }
        Some(Self {
            envelope,
            read_timestamp,
            ttl_after_read,
        })
    }

    pub fn uri(&self) -> &str {
        &self.envelope.uri
    }

    pub fn msg_id(&self) -> &str {
        &self.envelope.msg_id
    }

    pub fn conn_id(&self) -> &str {
        &self.envelope.conn_id
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.envelope.body
    }

    pub fn envelope(&self) -> &CallEnvelope {
        &self.envelope
    }

    /// When the expiry check succeeded
    pub fn read_timestamp(&self) -> DateTime<Utc> {
        self.read_timestamp
    }

    /// Remaining validity observed at the expiry check
    pub fn ttl_after_read(&self) -> Duration {
        self.ttl_after_read
    }

    /// Deadline for answering the call
    pub fn deadline(&self) -> DateTime<Utc> {
        self.read_timestamp
            + chrono::Duration::from_std(self.ttl_after_read).unwrap_or(chrono::Duration::zero())
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_json_shape() {
        let env = CallEnvelope {
            conn_id: "c1".to_string(),
            msg_id: "m1".to_string(),
            uri: "svc.echo".to_string(),
            body: json!({"x": 1}),
        };
        let value: serde_json::Value = serde_json::from_slice(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"conn_id": "c1", "msg_id": "m1", "uri": "svc.echo", "body": {"x": 1}})
        );
    }

    #[test]
    fn test_envelope_optional_fields() {
        let env = CallEnvelope::from_json(br#"{"msg_id":"m1","uri":"a"}"#).unwrap();
        assert_eq!(env.conn_id, "");
        assert_eq!(env.body, serde_json::Value::Null);
    }

    #[test]
    fn test_envelope_rejects_missing_uri() {
        assert!(CallEnvelope::from_json(br#"{"msg_id":"m1"}"#).is_err());
        assert!(CallEnvelope::from_json(b"not json").is_err());
    }

    #[test]
    fn test_new_generates_distinct_ids() {
        let a = CallEnvelope::new("a", json!(null));
        let b = CallEnvelope::new("a", json!(null));
        assert_ne!(a.msg_id, b.msg_id);
    }

    #[test]
    fn test_payload_requires_positive_ttl() {
        let env = CallEnvelope::new("a", json!(1));
        assert!(CallPayload::checked(env.clone(), Duration::ZERO, Utc::now()).is_none());

        let now = Utc::now();
        let payload = CallPayload::checked(env, Duration::from_millis(1500), now).unwrap();
        assert_eq!(payload.ttl_after_read(), Duration::from_millis(1500));
        assert_eq!(payload.deadline(), now + chrono::Duration::milliseconds(1500));

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["ttl_after_read_ms"], json!(1500));
        assert_eq!(value["uri"], json!("a"));
    }
}
