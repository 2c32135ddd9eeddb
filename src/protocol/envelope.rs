use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One discrete unit of communication crossing a channel.
///
/// Messages travel between test workers and the plugin (always through the
/// host), and the remaining variants sequence a test worker's lifetime.
/// Optional fields are omitted from the wire when absent; an explicit `null`
/// for `worker_id` or `reply_to` is rejected because absence carries meaning
/// ("plugin-wide" and "top-level" respectively).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// User data, optionally answering an earlier message.
    Message {
        id: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present_string"
        )]
        reply_to: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present_string"
        )]
        worker_id: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present_value"
        )]
        data: Option<Value>,
    },
    /// A test worker connected and may now exchange messages.
    RegisterWorker { id: String, file: String },
    /// A test worker is exiting; its teardown sequence must run.
    DeregisterWorker { id: String },
    /// The plugin finished tearing a test worker down.
    DeregisteredWorker { id: String },
    /// The plugin called `ready()`.
    Available,
}

impl Envelope {
    /// Construct a message envelope.
    pub fn message(
        id: impl Into<String>,
        reply_to: Option<String>,
        worker_id: Option<String>,
        data: Value,
    ) -> Self {
        Self::Message {
            id: id.into(),
            reply_to,
            worker_id,
            data: Some(data),
        }
    }

    /// Wire tag of this envelope, for logs and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::RegisterWorker { .. } => "register-worker",
            Self::DeregisterWorker { .. } => "deregister-worker",
            Self::DeregisteredWorker { .. } => "deregistered-worker",
            Self::Available => "available",
        }
    }

    /// Test worker this envelope is addressed to or from, if any.
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::Message { worker_id, .. } => worker_id.as_deref(),
            Self::RegisterWorker { id, .. }
            | Self::DeregisterWorker { id }
            | Self::DeregisteredWorker { id } => Some(id),
            Self::Available => None,
        }
    }

    /// Return a copy of this envelope addressed to (or stamped from) `worker`.
    /// Only messages carry a free-standing worker id; other kinds are returned
    /// unchanged.
    pub fn with_worker(self, worker: &str) -> Self {
        match self {
            Self::Message {
                id, reply_to, data, ..
            } => Self::Message {
                id,
                reply_to,
                worker_id: Some(worker.to_string()),
                data,
            },
            other => other,
        }
    }
}

fn present_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(Some)
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Serialize an envelope into its single-document wire form.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Parse a single-document wire form back into an envelope.
pub fn decode(raw: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plugin_wide_message_omits_absent_fields() {
        let envelope = Envelope::Message {
            id: "1/message/1".into(),
            reply_to: None,
            worker_id: None,
            data: None,
        };

        let raw = encode(&envelope).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, json!({"type": "message", "id": "1/message/1"}));
        assert_eq!(decode(&raw).unwrap(), envelope);
    }

    #[test]
    fn explicit_null_data_is_distinct_from_absent_data() {
        let with_null = decode(r#"{"type":"message","id":"m","data":null}"#).unwrap();
        let without = decode(r#"{"type":"message","id":"m"}"#).unwrap();

        assert!(matches!(
            &with_null,
            Envelope::Message { data: Some(Value::Null), .. }
        ));
        assert!(matches!(&without, Envelope::Message { data: None, .. }));
        assert_ne!(with_null, without);

        let reencoded: Value = serde_json::from_str(&encode(&with_null).unwrap()).unwrap();
        assert_eq!(reencoded, json!({"type": "message", "id": "m", "data": null}));
    }

    #[test]
    fn explicit_null_worker_id_is_rejected() {
        let error = decode(r#"{"type":"message","id":"m","worker_id":null}"#)
            .expect_err("null worker id must not mean plugin-wide");
        assert!(error.to_string().contains("null"));
    }

    #[test]
    fn addressed_reply_keeps_every_field() {
        let envelope = Envelope::message(
            "w1/message/3",
            Some("p/message/1".into()),
            Some("w1".into()),
            json!({"ok": true}),
        );
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.worker_id(), Some("w1"));
    }

    #[test]
    fn lifecycle_envelopes_use_kebab_case_tags() {
        let raw = encode(&Envelope::DeregisteredWorker { id: "w2".into() }).unwrap();
        assert_eq!(raw, r#"{"type":"deregistered-worker","id":"w2"}"#);
        assert_eq!(decode(r#"{"type":"available"}"#).unwrap(), Envelope::Available);
        assert_eq!(
            decode(r#"{"type":"register-worker","id":"w1","file":"a.test.js"}"#).unwrap(),
            Envelope::RegisterWorker {
                id: "w1".into(),
                file: "a.test.js".into()
            }
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(decode(r#"{"type":"shutdown"}"#).is_err());
    }

    #[test]
    fn with_worker_only_restamps_messages() {
        let message =
            Envelope::message("id", None, Some("spoofed".into()), json!(1)).with_worker("w1");
        assert_eq!(message.worker_id(), Some("w1"));

        let available = Envelope::Available.with_worker("w1");
        assert_eq!(available, Envelope::Available);
    }
}
