use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::{codec::Codecs, error::StreamError, msg::ProtocolMessage};

/// One element of a stream. The payload stays encoded until it is looked at.
#[derive(Debug)]
pub struct StreamData {
    payload: Bytes,
    content_type: String,
    codecs: Arc<Codecs>,
    value: OnceLock<Result<serde_json::Value, StreamError>>,
}

impl StreamData {
    pub(crate) fn new(msg: ProtocolMessage, codecs: Arc<Codecs>) -> Self {
        Self {
            payload: msg.payload,
            content_type: msg.content_type,
            codecs,
            value: OnceLock::new(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StreamError> {
        self.codecs
            .decode(&self.payload, &self.content_type)
            .map_err(|e| StreamError::Codec(e.to_string()))
    }

    /// The payload as a dynamic value, decoded on first access.
    pub fn value(&self) -> Result<&serde_json::Value, StreamError> {
        self.value
            .get_or_init(|| self.decode())
            .as_ref()
            .map_err(Clone::clone)
    }
}
