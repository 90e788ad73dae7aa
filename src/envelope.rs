//! Message envelope.
//!
//! On the wire an envelope is a JSON object carrying the serialized
//! application payload (base64) and an optional reply destination:
//!
//! ```json
//! {"ReplyTo": "3f2a9c0d1e4b5a6f.ephemeral", "Payload": "eyJOYW1lIjoiZXZlbnQifQ=="}
//! ```
//!
//! An empty `ReplyTo` means no reply is expected.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bus::{BusError, Result};

/// Payload plus reply routing metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "ReplyTo", default, with = "reply_to_field")]
    reply_to: Option<String>,
    #[serde(rename = "Payload", default, with = "base64_payload")]
    payload: Vec<u8>,
}

impl Envelope {
    /// Wrap an already serialized payload.
    pub fn new(payload: Vec<u8>, reply_to: Option<String>) -> Self {
        Self {
            reply_to: reply_to.filter(|r| !r.is_empty()),
            payload,
        }
    }

    /// Serialize `payload` as JSON and wrap it.
    pub fn wrap<T: Serialize + ?Sized>(payload: &T, reply_to: Option<&str>) -> Result<Self> {
        let payload = serde_json::to_vec(payload).map_err(BusError::Encoding)?;
        Ok(Self::new(payload, reply_to.map(str::to_owned)))
    }

    /// Envelope bytes as published to the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(BusError::Encoding)
    }

    /// Parse envelope bytes received from the broker.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(BusError::Decoding)
    }

    /// Destination a reply should be published to, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Raw serialized payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Deserialize the payload into `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(BusError::Decoding)
    }
}

/// Encode `payload` into envelope bytes ready for publishing.
pub fn encode<T: Serialize + ?Sized>(payload: &T, reply_to: Option<&str>) -> Result<Vec<u8>> {
    Envelope::wrap(payload, reply_to)?.to_bytes()
}

/// A decoded envelope as seen by a message handler.
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    attempts: u16,
    envelope: Envelope,
}

impl Message {
    pub fn new(id: impl Into<String>, attempts: u16, envelope: Envelope) -> Self {
        Self {
            id: id.into(),
            attempts,
            envelope,
        }
    }

    /// Broker-assigned message id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Delivery attempt, starting at 1.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.envelope.reply_to()
    }

    pub fn payload(&self) -> &[u8] {
        self.envelope.payload()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        self.envelope.decode_payload()
    }
}

mod reply_to_field {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(reply_to: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(reply_to.as_deref().unwrap_or_default())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let reply_to = Option::<String>::deserialize(d)?;
        Ok(reply_to.filter(|r| !r.is_empty()))
    }
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Event {
        #[serde(rename = "Name")]
        name: String,
    }

    #[test]
    fn test_payload_round_trip() {
        let event = Event {
            name: "event".to_string(),
        };
        let bytes = encode(&event, None).unwrap();

        let envelope = Envelope::decode(&bytes).unwrap();
        assert_eq!(envelope.decode_payload::<Event>().unwrap(), event);
        assert_eq!(envelope.reply_to(), None);
    }

    #[test]
    fn test_reply_to_preserved() {
        let bytes = encode(&"ping", Some("abc.ephemeral")).unwrap();
        let envelope = Envelope::decode(&bytes).unwrap();
        assert_eq!(envelope.reply_to(), Some("abc.ephemeral"));
    }

    #[test]
    fn test_wire_format() {
        let bytes = encode(&Event { name: "event".into() }, None).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["ReplyTo"], "");
        // base64 of {"Name":"event"}
        assert_eq!(value["Payload"], "eyJOYW1lIjoiZXZlbnQifQ==");
    }

    #[test]
    fn test_decodes_envelope_without_reply_field() {
        let envelope = Envelope::decode(br#"{"Payload":"eyJOYW1lIjoiZXZlbnQifQ=="}"#).unwrap();
        assert_eq!(envelope.reply_to(), None);
        assert_eq!(
            envelope.decode_payload::<Event>().unwrap(),
            Event {
                name: "event".into()
            }
        );
    }

    #[test]
    fn test_empty_reply_to_means_none() {
        let envelope = Envelope::new(b"1".to_vec(), Some(String::new()));
        assert_eq!(envelope.reply_to(), None);
    }

    #[test]
    fn test_decode_rejects_malformed_bytes() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(BusError::Decoding(_))
        ));
        assert!(matches!(
            Envelope::decode(br#"{"Payload":"***"}"#),
            Err(BusError::Decoding(_))
        ));
    }

    #[test]
    fn test_decode_payload_shape_mismatch() {
        let envelope = Envelope::wrap(&42, None).unwrap();
        assert!(matches!(
            envelope.decode_payload::<Event>(),
            Err(BusError::Decoding(_))
        ));
    }

    #[test]
    fn test_encode_rejects_unserializable_payload() {
        use std::collections::HashMap;

        // JSON object keys must be strings.
        let mut payload = HashMap::new();
        payload.insert(vec![1u8], "value");
        assert!(matches!(encode(&payload, None), Err(BusError::Encoding(_))));
    }

    #[test]
    fn test_message_accessors() {
        let envelope = Envelope::wrap(&"hi", Some("r.ephemeral")).unwrap();
        let message = Message::new("m-1", 2, envelope);

        assert_eq!(message.id(), "m-1");
        assert_eq!(message.attempts(), 2);
        assert_eq!(message.reply_to(), Some("r.ephemeral"));
        assert_eq!(message.decode_payload::<String>().unwrap(), "hi");
    }
}
