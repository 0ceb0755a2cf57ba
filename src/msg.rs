use std::fmt;

use bytes::Bytes;
use nanoid::nanoid;
use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::codec::Encoded;

/// Identifies this protocol among others multiplexed on one transport.
pub const PROTOCOL: &str = "reactive-stream";

/// A protocol step. Carried as a string so that steps this side does not
/// know about still decode and can be reported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Step {
    Subscribe,
    Ack,
    Nack,
    Request,
    Data,
    Cancel,
    Complete,
    Error,
    /// Raised by the transport when the destination cannot be reached.
    ServiceNotFound,
    /// Raised by the transport when the channel itself has failed.
    ConnectionFailure,
    Other(String),
}

impl Step {
    pub fn as_str(&self) -> &str {
        match self {
            Step::Subscribe => "subscribe",
            Step::Ack => "ack",
            Step::Nack => "nack",
            Step::Request => "request",
            Step::Data => "data",
            Step::Cancel => "cancel",
            Step::Complete => "complete",
            Step::Error => "error",
            Step::ServiceNotFound => "ServiceNotFound",
            Step::ConnectionFailure => "ConnectionFailure",
            Step::Other(name) => name.as_str(),
        }
    }
}

impl From<String> for Step {
    fn from(name: String) -> Self {
        match name.as_str() {
            "subscribe" => Step::Subscribe,
            "ack" => Step::Ack,
            "nack" => Step::Nack,
            "request" => Step::Request,
            "data" => Step::Data,
            "cancel" => Step::Cancel,
            "complete" => Step::Complete,
            "error" => Step::Error,
            "ServiceNotFound" => Step::ServiceNotFound,
            "ConnectionFailure" => Step::ConnectionFailure,
            _ => Step::Other(name),
        }
    }
}

impl From<Step> for String {
    fn from(step: Step) -> Self {
        match step {
            Step::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub id: String,
    pub step: Step,
    pub protocol: String,
    pub from_service: String,
    pub to_service: String,
    pub content_type: String,
    pub payload: Bytes,
}

impl ProtocolMessage {
    pub fn new(step: Step, from_service: &str, to_service: &str, encoded: Encoded) -> Self {
        Self {
            id: nanoid!(),
            step,
            protocol: PROTOCOL.to_owned(),
            from_service: from_service.to_owned(),
            to_service: to_service.to_owned(),
            content_type: encoded.content_type,
            payload: encoded.payload,
        }
    }

    /// A transport-originated signal about `service`, with no payload.
    pub fn transport_event(step: Step, service: &str) -> Self {
        Self {
            id: nanoid!(),
            step,
            protocol: PROTOCOL.to_owned(),
            from_service: service.to_owned(),
            to_service: String::new(),
            content_type: String::new(),
            payload: Bytes::new(),
        }
    }
}

/// Stream arguments, kept in insertion order. Re-inserting a key keeps its
/// position and replaces the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(Vec<(String, String)>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        if let Some((_, slot)) = self.0.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(slot, value));
        }
        self.0.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Args {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = Args::new();
        for (k, v) in iter {
            args.insert(k, v);
        }
        args
    }
}

impl Serialize for Args {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl<'de> Deserialize<'de> for Args {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ArgsVisitor;

        impl<'de> Visitor<'de> for ArgsVisitor {
            type Value = Args;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string arguments")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Args, A::Error> {
                let mut args = Args::new();
                while let Some((k, v)) = map.next_entry::<String, String>()? {
                    args.insert(k, v);
                }
                Ok(args)
            }
        }

        deserializer.deserialize_map(ArgsVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub path: String,
    #[serde(default)]
    pub args: Args,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub n: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// Body of the steps that carry nothing (ACK, NACK, CANCEL, COMPLETE).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    pub protocol: String,
    pub name: String,
    pub description: String,
    pub operations: Vec<OperationDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codecs, JSON, MSGPACK};

    #[test]
    fn unknown_steps_survive_the_wire() {
        let step: Step = serde_json::from_str("\"resume\"").unwrap();
        assert_eq!(step, Step::Other("resume".into()));
        assert_eq!(serde_json::to_string(&step).unwrap(), "\"resume\"");
        assert_eq!(step.to_string(), "resume");
    }

    #[test]
    fn known_steps_use_wire_names() {
        assert_eq!(serde_json::to_string(&Step::Request).unwrap(), "\"request\"");
        assert_eq!(Step::from("ConnectionFailure".to_owned()), Step::ConnectionFailure);
    }

    #[test]
    fn args_keep_first_position_and_last_value() {
        let mut args: Args = [("b", "1"), ("a", "2")].into_iter().collect();
        assert_eq!(args.insert("b", "3"), Some("1".to_owned()));
        let pairs: Vec<_> = args.iter().collect();
        assert_eq!(pairs, vec![("b", "3"), ("a", "2")]);
    }

    #[test]
    fn subscription_request_keeps_argument_order() {
        let codecs = Codecs::default();
        let request = SubscriptionRequest {
            path: "/orders/active".into(),
            args: [("zeta", "1"), ("alpha", "2"), ("mid", "3")].into_iter().collect(),
        };

        for ct in [MSGPACK, JSON] {
            let encoded = codecs.encode(&request, &[ct.to_owned()]).unwrap();
            let decoded: SubscriptionRequest =
                codecs.decode(&encoded.payload, &encoded.content_type).unwrap();
            assert_eq!(decoded, request);
            let keys: Vec<_> = decoded.args.iter().map(|(k, _)| k).collect();
            assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        }
    }

    #[test]
    fn missing_args_default_to_empty() {
        let request: SubscriptionRequest =
            serde_json::from_str(r#"{"path":"/orders"}"#).unwrap();
        assert!(request.args.is_empty());
    }

    #[test]
    fn message_is_stamped_with_protocol() {
        let encoded = Codecs::default().encode(&Empty {}, &[]).unwrap();
        let msg = ProtocolMessage::new(Step::Ack, "orders", "client", encoded);
        assert_eq!(msg.protocol, PROTOCOL);
        assert_eq!(msg.from_service, "orders");
        assert!(!msg.id.is_empty());
    }
}
